//! CPU/GPU synchronization and frame pacing

pub mod frame_pipeline;
pub mod sync;
