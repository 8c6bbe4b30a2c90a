//! Vulkan ray-tracing backend
//!
//! Organized by responsibility:
//! - `initialization`: device context and error types
//! - `resources`: buffers, images, tables, descriptors and the bindless registry
//! - `acceleration`: bottom- and top-level acceleration structures
//! - `rendering`: command recording, layout transitions, shaders and the ray-tracing pipeline
//! - `state`: synchronization objects and frames-in-flight pacing
//! - `renderer`: per-frame ray dispatch into swapchain images

pub mod acceleration;
pub mod initialization;
pub mod renderer;
pub mod rendering;
pub mod resources;
pub mod state;

pub use acceleration::bottom_level::BottomLevelAccelerationStructure;
pub use acceleration::structure::AccelerationStructure;
pub use acceleration::top_level::TopLevelAccelerationStructure;
pub use initialization::context::{DeviceHandles, VulkanContext, VulkanError, VulkanResult};
pub use renderer::{CameraUniform, PresentTransfer, RayTracingRenderer};
pub use rendering::commands::{SingleTimeCommands, SubmissionState};
pub use rendering::ray_tracing_pipeline::{RayTracingPipeline, ShaderBindingTableLayout};
pub use rendering::shader::ShaderModule;
pub use resources::bindless::{BindlessResources, BindlessUploadPlan, UploadDecision};
pub use resources::buffer::{Buffer, BufferCreation};
pub use resources::geometry_node::{GeometryNode, GeometryNodeCreation};
pub use resources::image::{Image, ImageCreation, Sampler};
pub use resources::material::{Material, MaterialCreation};
pub use resources::resource_table::{ResourceHandle, ResourceTable};
pub use resources::texture_cache::TextureCache;
pub use state::frame_pipeline::{FrameCounter, FramePipeline, FrameStage, InFlightSlots, SwapchainTarget, MAX_FRAMES_IN_FLIGHT};
pub use state::sync::{Fence, FrameSync, Semaphore};
