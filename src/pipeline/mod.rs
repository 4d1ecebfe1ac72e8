//! Derivation and time-windowed rollup of per-endpoint measurements.

pub mod rollup;
pub mod stats;
pub mod store;

pub use rollup::{FsSummary, RollupWindow, Snapshot, Summary};
pub use stats::{combine_fs_stats, FsStats, InstanceStats};
pub use store::SnapshotStore;
