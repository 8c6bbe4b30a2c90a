//! Command recording, shaders and the ray-tracing pipeline

pub mod commands;
pub mod ray_tracing_pipeline;
pub mod shader;
pub mod transitions;
