//! SPIR-V shader modules

use ash::{vk, Device};
use std::ffi::CStr;
use std::io::Cursor;
use std::path::Path;
use crate::render::backends::vulkan::{VulkanResult, VulkanError};

/// Shader module with automatic cleanup
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create shader module from SPIR-V bytecode
    pub fn from_bytes(device: &Device, bytes: &[u8]) -> VulkanResult<Self> {
        log::debug!("[SHADER] Creating shader module from {} bytes", bytes.len());

        let words = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| {
            log::error!("[SHADER] Invalid SPIR-V: {}", e);
            VulkanError::InitializationFailed(format!("Invalid SPIR-V bytecode: {}", e))
        })?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe {
            device.create_shader_module(&create_info, None)
                .map_err(|e| {
                    log::error!("[SHADER] vkCreateShaderModule failed: {:?}", e);
                    VulkanError::Api(e)
                })?
        };

        Ok(Self { device: device.clone(), module })
    }

    /// Load shader from SPIR-V file
    pub fn from_file<P: AsRef<Path>>(device: &Device, path: P) -> VulkanResult<Self> {
        let path = path.as_ref();
        log::debug!("[SHADER] Loading shader from: {:?}", path);

        let bytes = std::fs::read(path).map_err(|source| {
            log::error!("[SHADER] Failed to read shader file {:?}: {}", path, source);
            VulkanError::ShaderLoad {
                path: path.display().to_string(),
                source,
            }
        })?;

        Self::from_bytes(device, &bytes)
    }

    /// Get shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Create shader stage create info
    pub fn create_stage_info(&self, stage: vk::ShaderStageFlags, entry_point: &CStr) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(entry_point)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}
