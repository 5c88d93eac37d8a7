//! Tessera: a cycle-level simulator for a heterogeneous chiplet accelerator.
//!
//! Facade crate re-exporting the workspace members. Most users want
//! [`platform::ChipletPlatform`] driven by a [`config::SimConfig`]:
//!
//! ```
//! use tessera::config::SimConfig;
//! use tessera::platform::ChipletPlatform;
//!
//! let mut platform = ChipletPlatform::new(SimConfig::default()).unwrap();
//! platform.run_until_idle(100_000);
//! assert!(platform.is_idle());
//! ```

pub use tessera_config as config;
pub use tessera_digital as digital;
pub use tessera_estimators as estimators;
pub use tessera_graph as graph;
pub use tessera_host as host;
pub use tessera_model as model;
pub use tessera_platform as platform;
pub use tessera_rram as rram;
pub use tessera_sram as sram;
pub use tessera_topology as topology;
pub use tessera_types as types;
