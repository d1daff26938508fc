//! Memory-pressure driven spilling of quadtree leaves to the file store.

pub mod controller;
pub mod resource;

pub use controller::{tier_threshold, SpillController, SpillDecision, SpillStats, SUPERSEDED_DIR_NAME};
pub use resource::{
    ManualProbe, MemoryProbe, MemoryUsage, ResourceManager, SystemMemoryProbe, SystemResources, TuningProfile,
};
