//! Shared acceleration structure storage and build protocol

use ash::vk;
use std::sync::Arc;

use crate::foundation::memory::{align_up, padded_size};
use crate::render::backends::vulkan::rendering::commands::SingleTimeCommands;
use crate::render::backends::vulkan::resources::buffer::{Buffer, BufferCreation};
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Built acceleration structure and the buffer backing it
///
/// The structure handle is destroyed in `drop`; the backing buffer is a
/// field and is therefore released afterwards.
pub struct AccelerationStructure {
    context: Arc<VulkanContext>,
    handle: vk::AccelerationStructureKHR,
    level: vk::AccelerationStructureTypeKHR,
    device_address: vk::DeviceAddress,
    buffer: Buffer,
    name: String,
}

impl AccelerationStructure {
    /// Build a structure from geometries and their build ranges
    ///
    /// Queries the build sizes, allocates the structure buffer, creates the
    /// structure, allocates scratch memory and records one build command.
    /// The scratch address handed to the build is rounded up to the device's
    /// scratch offset alignment inside a padded allocation.
    /// The scratch buffer is released as soon as the build has completed.
    pub fn build(
        context: &Arc<VulkanContext>,
        level: vk::AccelerationStructureTypeKHR,
        geometries: &[vk::AccelerationStructureGeometryKHR],
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
        name: &str,
    ) -> VulkanResult<Self> {
        if geometries.is_empty() || geometries.len() != ranges.len() {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "acceleration structure '{}' needs one range per geometry ({} geometries, {} ranges)",
                    name,
                    geometries.len(),
                    ranges.len()
                ),
            });
        }

        let loader = context.acceleration_structure_loader();
        let primitive_counts: Vec<u32> = ranges.iter().map(|range| range.primitive_count).collect();

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(level)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(geometries)
            .build();

        let sizes = unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &primitive_counts,
            )
        };
        log::debug!(
            "[AS] '{}' needs {} bytes of storage and {} bytes of scratch",
            name,
            sizes.acceleration_structure_size,
            sizes.build_scratch_size
        );

        let buffer = Buffer::new(
            context,
            &BufferCreation {
                size: sizes.acceleration_structure_size,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                mappable: false,
                memory_usage: vk_mem::MemoryUsage::GpuOnly,
                name: name.to_string(),
            },
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.handle())
            .size(sizes.acceleration_structure_size)
            .ty(level);
        let handle = unsafe {
            loader.create_acceleration_structure(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        context.name_object(handle, name);

        let mut structure = Self {
            context: Arc::clone(context),
            handle,
            level,
            device_address: 0,
            buffer,
            name: name.to_string(),
        };

        let scratch_alignment = u64::from(
            context
                .acceleration_structure_properties()
                .min_acceleration_structure_scratch_offset_alignment,
        );
        let scratch = Buffer::new(
            context,
            &BufferCreation {
                size: padded_size(sizes.build_scratch_size, scratch_alignment),
                usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                mappable: false,
                memory_usage: vk_mem::MemoryUsage::GpuOnly,
                name: format!("{name} scratch"),
            },
        )?;

        build_info.dst_acceleration_structure = handle;
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: align_up(scratch.device_address(), scratch_alignment),
        };

        SingleTimeCommands::execute(context, |_, command_buffer| unsafe {
            loader.cmd_build_acceleration_structures(command_buffer, &[build_info], &[ranges]);
        })?;
        drop(scratch);

        structure.device_address = context.acceleration_structure_device_address(handle);
        log::info!(
            "[AS] Built {} '{}' with {} geometries, {} primitives",
            level_name(level),
            name,
            geometries.len(),
            primitive_counts.iter().map(|&count| u64::from(count)).sum::<u64>()
        );

        Ok(structure)
    }

    /// Structure handle
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// Device address used by instances and shaders
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Bottom or top level
    pub fn level(&self) -> vk::AccelerationStructureTypeKHR {
        self.level
    }

    /// Buffer holding the structure
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.context
                .acceleration_structure_loader()
                .destroy_acceleration_structure(self.handle, None);
        }
        log::trace!("[AS] Destroyed '{}'", self.name);
    }
}

fn level_name(level: vk::AccelerationStructureTypeKHR) -> &'static str {
    match level {
        vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL => "BLAS",
        vk::AccelerationStructureTypeKHR::TOP_LEVEL => "TLAS",
        _ => "acceleration structure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_names() {
        assert_eq!(level_name(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL), "BLAS");
        assert_eq!(level_name(vk::AccelerationStructureTypeKHR::TOP_LEVEL), "TLAS");
        assert_eq!(level_name(vk::AccelerationStructureTypeKHR::GENERIC), "acceleration structure");
    }
}
