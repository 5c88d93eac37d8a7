//! RRAM compute-in-memory chiplet model.
//!
//! A chiplet is a grid of tiles, each a grid of sense arrays. Ops arrive as
//! [`tessera_types::RramTaskSpec`] phase descriptions (stage / execute / post)
//! and burn pre, pulse and post cycles on their tile; finished postprocess
//! phases run the dequantization math in [`quant`]. Weight residency is
//! tracked by the [`WeightDirectory`]; misses go through a serialized
//! weight-load DMA queue.

mod chiplet;
mod directory;
pub mod fp16;
mod quant;
mod tile;

pub use chiplet::{RramBufferKind, RramChiplet, RramTotals};
pub use directory::{WeightDirectory, WeightRecord};
pub use quant::{
    align_activations, align_fp16_values, finalize_result, AlignedActivations, ResultSummary,
};
pub use tile::{RramTile, TileDelta};
