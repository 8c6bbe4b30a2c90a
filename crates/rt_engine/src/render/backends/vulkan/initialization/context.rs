//! Vulkan device context
//!
//! Instance, device and queue creation belong to the host application. This
//! module takes those handles over and layers on what the ray-tracing
//! resources need: the memory allocator, a command pool on the graphics
//! queue, the acceleration-structure and ray-tracing-pipeline extension
//! loaders, and optional debug-utils object naming.
//!
//! Every buffer, image and structure keeps an `Arc<VulkanContext>`, so the
//! allocator outlives all allocations made through it. The host must drop the
//! last resource (and with it the context) before destroying the device.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{AccelerationStructure, RayTracingPipeline};
use ash::{vk, Device, Entry, Instance};
use std::ffi::CString;
use thiserror::Error;

use crate::config::RendererConfig;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// A single-time command buffer was recorded or submitted after it already ran
    #[error("Command buffer has already been submitted")]
    CommandsAlreadySubmitted,

    /// Acquire or present reported an out-of-date or suboptimal swapchain
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    /// A SPIR-V file could not be read
    #[error("Failed to load shader {path}: {source}")]
    ShaderLoad {
        /// Path of the shader file
        path: String,
        /// Underlying IO error
        source: std::io::Error,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Handles created by the host application
///
/// The device must have been created with ray-tracing pipeline, acceleration
/// structure, buffer device address and descriptor indexing features enabled,
/// and with one queue from `graphics_family`.
pub struct DeviceHandles {
    /// Loaded Vulkan entry points
    pub entry: Entry,
    /// Instance the device was created from
    pub instance: Instance,
    /// Logical device
    pub device: Device,
    /// Physical device backing `device`
    pub physical_device: vk::PhysicalDevice,
    /// Queue family used for graphics, compute, transfer and present
    pub graphics_family: u32,
}

/// Shared device state for all ray-tracing resources
pub struct VulkanContext {
    instance: Instance,
    device: Device,
    physical_device: vk::PhysicalDevice,
    graphics_family: u32,
    graphics_queue: vk::Queue,
    command_pool: vk::CommandPool,
    allocator: vk_mem::Allocator,
    acceleration_structure: AccelerationStructure,
    ray_tracing_pipeline: RayTracingPipeline,
    ray_tracing_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
    acceleration_structure_properties: vk::PhysicalDeviceAccelerationStructurePropertiesKHR,
    debug_utils: Option<DebugUtils>,
}

impl VulkanContext {
    /// Take over the host's device handles and create the shared state
    ///
    /// Debug names are attached when `config.enable_debug_names` is set; the
    /// instance must then have `VK_EXT_debug_utils` enabled.
    pub fn new(handles: DeviceHandles, config: &RendererConfig) -> VulkanResult<Self> {
        let DeviceHandles {
            entry,
            instance,
            device,
            physical_device,
            graphics_family,
        } = handles;
        let enable_debug_names = config.enable_debug_names;

        let allocator = {
            let create_info = vk_mem::AllocatorCreateInfo::new(&instance, &device, physical_device)
                .flags(vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS)
                .vulkan_api_version(vk::API_VERSION_1_2);
            vk_mem::Allocator::new(create_info).map_err(|e| {
                log::error!("[CONTEXT] Failed to create memory allocator: {:?}", e);
                VulkanError::Api(e)
            })?
        };

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe {
            device.create_command_pool(&pool_info, None)
                .map_err(VulkanError::Api)?
        };

        let acceleration_structure = AccelerationStructure::new(&instance, &device);
        let ray_tracing_pipeline = RayTracingPipeline::new(&instance, &device);
        let ray_tracing_properties = unsafe { RayTracingPipeline::get_properties(&instance, physical_device) };
        let acceleration_structure_properties =
            unsafe { AccelerationStructure::get_properties(&instance, physical_device) };

        let debug_utils = enable_debug_names.then(|| DebugUtils::new(&entry, &instance));

        log::info!(
            "[CONTEXT] Ray tracing ready: handle size {}, handle alignment {}, base alignment {}",
            ray_tracing_properties.shader_group_handle_size,
            ray_tracing_properties.shader_group_handle_alignment,
            ray_tracing_properties.shader_group_base_alignment
        );

        Ok(Self {
            instance,
            device,
            physical_device,
            graphics_family,
            graphics_queue,
            command_pool,
            allocator,
            acceleration_structure,
            ray_tracing_pipeline,
            ray_tracing_properties,
            acceleration_structure_properties,
            debug_utils,
        })
    }

    /// Get the logical device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Get the instance
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Get the physical device
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the memory allocator
    pub fn allocator(&self) -> &vk_mem::Allocator {
        &self.allocator
    }

    /// Get the graphics queue
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the graphics queue family index
    pub fn graphics_family(&self) -> u32 {
        self.graphics_family
    }

    /// Get the command pool used for one-shot and per-frame command buffers
    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Acceleration structure extension loader
    pub fn acceleration_structure_loader(&self) -> &AccelerationStructure {
        &self.acceleration_structure
    }

    /// Ray tracing pipeline extension loader
    pub fn ray_tracing_loader(&self) -> &RayTracingPipeline {
        &self.ray_tracing_pipeline
    }

    /// Shader group handle sizes and alignments of the physical device
    pub fn ray_tracing_properties(&self) -> &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR {
        &self.ray_tracing_properties
    }

    /// Acceleration structure limits, including the scratch offset alignment
    pub fn acceleration_structure_properties(&self) -> &vk::PhysicalDeviceAccelerationStructurePropertiesKHR {
        &self.acceleration_structure_properties
    }

    /// Device address of a buffer created with `SHADER_DEVICE_ADDRESS`
    pub fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    /// Device address of an acceleration structure
    pub fn acceleration_structure_device_address(
        &self,
        structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
            .acceleration_structure(structure);
        unsafe { self.acceleration_structure.get_acceleration_structure_device_address(&info) }
    }

    /// Attach a debug name to a Vulkan object
    ///
    /// No-op when debug names are disabled. Naming failures are logged and
    /// otherwise ignored.
    pub fn name_object<T: vk::Handle>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        if name.is_empty() {
            return;
        }
        let Ok(name) = CString::new(name) else {
            log::warn!("[CONTEXT] Debug name {:?} contains a NUL byte", name);
            return;
        };

        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(T::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(self.device.handle(), &name_info) } {
            log::warn!("[CONTEXT] Failed to name object {:?}: {:?}", name, e);
        }
    }

    /// Wait for the device to become idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe {
            self.device.device_wait_idle()
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("[CONTEXT] device_wait_idle failed during teardown: {:?}", e);
            }
            self.device.destroy_command_pool(self.command_pool, None);
        }
        log::debug!("[CONTEXT] Context destroyed");
    }
}
