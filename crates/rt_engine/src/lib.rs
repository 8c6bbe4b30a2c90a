//! # RT Engine
//!
//! GPU resource and acceleration-structure management for a hardware
//! ray-tracing renderer built on Vulkan.
//!
//! ## Features
//!
//! - **Device memory**: RAII buffers and images allocated through `vk-mem`
//! - **Bindless resources**: handle-indexed tables of images, materials and
//!   geometry records published through one update-after-bind descriptor set
//! - **Acceleration structures**: bottom-level structures per model and a
//!   top-level structure over their instances
//! - **Frame pipelining**: N frames in flight driving ray dispatch and present
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rt_engine::prelude::*;
//!
//! fn build(handles: DeviceHandles, data: ModelData) -> VulkanResult<()> {
//!     let config = RendererConfig::default();
//!     let context = Arc::new(VulkanContext::new(handles, &config)?);
//!     let mut bindless = BindlessResources::new(&context, config.bindless_capacity)?;
//!
//!     let model = Model::upload(&context, data)?;
//!     // Models with nothing to build are logged and skipped
//!     let blas: Vec<_> = BottomLevelAccelerationStructure::new(&context, &model, &mut bindless)?
//!         .into_iter()
//!         .collect();
//!     let tlas = TopLevelAccelerationStructure::new(&context, &blas)?;
//!
//!     bindless.update_descriptor_set()?;
//!     let _ = tlas.structure();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod render;
pub mod scene;

/// Commonly used types
pub mod prelude {
    pub use crate::config::{CameraConfig, Config, ConfigError, RayTracingShaderConfig, RendererConfig};
    pub use crate::foundation::math::{Mat4, Vec2, Vec3, Vec4};
    pub use crate::render::backends::vulkan::{
        BindlessResources, BottomLevelAccelerationStructure, Buffer, BufferCreation, DeviceHandles,
        FramePipeline, GeometryNode, Image, ImageCreation, Material, MaterialCreation,
        RayTracingRenderer, ResourceHandle, ResourceTable, SingleTimeCommands, SwapchainTarget,
        TopLevelAccelerationStructure, VulkanContext, VulkanError, VulkanResult,
    };
    pub use crate::scene::{Mesh, Model, ModelData, Node, NodeIndex, SceneGraph, Vertex};
}
