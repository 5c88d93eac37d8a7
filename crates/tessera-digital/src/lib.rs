//! Digital compute chiplet model.
//!
//! A chiplet is partitioned into up to four compute clusters; each owns a
//! slice of the PE arrays, SPU clusters and VPU units plus three named SRAM
//! buffers (`activation`, `weights`, `scratch`). Work arrives as
//! [`tessera_types::DigitalTaskDesc`] problem descriptions and moves through
//! load -> compute -> store -> vector -> scalar phases under per-cycle bandwidth
//! and unit-count limits.

mod chiplet;
mod cluster;
mod units;

pub use tessera_sram::Buffer;
pub use chiplet::{DigitalChiplet, DigitalTotals};
pub use cluster::{ClusterTotals, ComputeCluster, CycleActivity};
pub use units::{PeArray, SpuCluster, VpuUnit};
