//! Shared wire-level records for the tessera simulator.
//!
//! Everything the host orchestrator, the chiplet devices, and the platform
//! driver exchange lives here: command descriptors as they appear in
//! `chiplet_commands.json`, the scheduler-facing [`Task`], the per-target
//! task specifications ([`DigitalTaskDesc`], [`RramTaskSpec`]), and the
//! dynamically typed [`MetaValue`] metadata map carried by all of them.

mod command;
mod digital;
mod event;
mod meta;
mod rram;
mod task;

pub use command::{Command, CommandKind, ExecDomain, Target, TRANSFER_DIR_RRAM_TO_DIGITAL};
pub use digital::{BufferKind, DigitalTaskDesc, DigitalUnit};
pub use event::{HostEvent, HostEventKind};
pub use meta::{MetaMap, MetaMapExt, MetaValue};
pub use rram::{RramPhase, RramTaskSpec, WeightKey};
pub use task::{NodePayload, OpType, Task};
