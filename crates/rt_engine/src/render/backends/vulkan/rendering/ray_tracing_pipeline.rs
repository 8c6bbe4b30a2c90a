//! Ray-tracing pipeline and shader binding table
//!
//! The pipeline has exactly three shader groups, in this order:
//!
//! | group | type                | stage        |
//! |-------|---------------------|--------------|
//! | 0     | general             | ray gen      |
//! | 1     | general             | miss         |
//! | 2     | triangles hit group | closest hit  |
//!
//! The shader binding table stores one handle per group. Each region starts
//! at a multiple of the device's base alignment and has a stride of the
//! handle size rounded up to the handle alignment.

use ash::{vk, Device};
use std::ffi::CStr;
use std::sync::Arc;

use crate::config::RayTracingShaderConfig;
use crate::foundation::memory::align_up;
use crate::render::backends::vulkan::rendering::shader::ShaderModule;
use crate::render::backends::vulkan::resources::buffer::{Buffer, BufferCreation};
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Ray generation group index
pub const RAYGEN_GROUP: u32 = 0;
/// Miss group index
pub const MISS_GROUP: u32 = 1;
/// Closest-hit group index
pub const HIT_GROUP: u32 = 2;
/// Number of shader groups
pub const GROUP_COUNT: u32 = 3;

/// Position of the ray generation stage in the pipeline's stage array
pub const RAYGEN_STAGE: u32 = 0;
/// Position of the miss stage
pub const MISS_STAGE: u32 = 1;
/// Position of the closest-hit stage
pub const CLOSEST_HIT_STAGE: u32 = 2;
/// Number of shader stages
pub const STAGE_COUNT: u32 = 3;

/// Shader group descriptions, indexed by group
///
/// Groups refer to shaders by their position in the stage array.
pub fn shader_groups() -> [vk::RayTracingShaderGroupCreateInfoKHR; GROUP_COUNT as usize] {
    let group = |ty, general: u32, closest_hit: u32| {
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(ty)
            .general_shader(general)
            .closest_hit_shader(closest_hit)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build()
    };

    let mut groups = [vk::RayTracingShaderGroupCreateInfoKHR::default(); GROUP_COUNT as usize];
    groups[RAYGEN_GROUP as usize] =
        group(vk::RayTracingShaderGroupTypeKHR::GENERAL, RAYGEN_STAGE, vk::SHADER_UNUSED_KHR);
    groups[MISS_GROUP as usize] = group(vk::RayTracingShaderGroupTypeKHR::GENERAL, MISS_STAGE, vk::SHADER_UNUSED_KHR);
    groups[HIT_GROUP as usize] = group(
        vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
        vk::SHADER_UNUSED_KHR,
        CLOSEST_HIT_STAGE,
    );
    groups
}

/// Byte layout of the shader binding table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderBindingTableLayout {
    /// Raw handle size reported by the device
    pub handle_size: u64,
    /// Handle size rounded up to the handle alignment; used as region stride
    pub handle_size_aligned: u64,
    /// Distance between region starts, a multiple of the base alignment
    pub region_size: u64,
    /// Base alignment every region start must honour
    pub base_alignment: u64,
}

impl ShaderBindingTableLayout {
    /// Derive the layout from the device's ray-tracing properties
    pub fn new(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> Self {
        let handle_size = u64::from(handle_size);
        let base_alignment = u64::from(base_alignment);
        let handle_size_aligned = align_up(handle_size, u64::from(handle_alignment));
        Self {
            handle_size,
            handle_size_aligned,
            region_size: align_up(handle_size_aligned, base_alignment),
            base_alignment,
        }
    }

    /// Offset of a group's region from the aligned table start
    pub fn region_offset(&self, group: u32) -> u64 {
        u64::from(group) * self.region_size
    }

    /// Bytes to allocate, including slack for aligning the table start
    pub fn allocation_size(&self) -> u64 {
        self.region_size * u64::from(GROUP_COUNT) + self.base_alignment
    }

    /// Offset from `buffer_address` to the first base-aligned byte
    pub fn start_offset(&self, buffer_address: vk::DeviceAddress) -> u64 {
        align_up(buffer_address, self.base_alignment) - buffer_address
    }

    /// Strided region of one group in a table starting at `table_address`
    pub fn region(&self, table_address: vk::DeviceAddress, group: u32) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: table_address + self.region_offset(group),
            stride: self.handle_size_aligned,
            size: self.handle_size_aligned,
        }
    }
}

/// Ray-tracing pipeline with its shader binding table
pub struct RayTracingPipeline {
    context: Arc<VulkanContext>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    shader_binding_table: Buffer,
    raygen_region: vk::StridedDeviceAddressRegionKHR,
    miss_region: vk::StridedDeviceAddressRegionKHR,
    hit_region: vk::StridedDeviceAddressRegionKHR,
}

impl RayTracingPipeline {
    /// Load the three shader stages and create the pipeline and its table
    pub fn new(
        context: &Arc<VulkanContext>,
        shaders: &RayTracingShaderConfig,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> VulkanResult<Self> {
        let device = context.device();
        let raygen = ShaderModule::from_file(device, &shaders.raygen_path)?;
        let miss = ShaderModule::from_file(device, &shaders.miss_path)?;
        let closest_hit = ShaderModule::from_file(device, &shaders.closest_hit_path)?;

        let entry_point = CStr::from_bytes_with_nul(b"main\0")
            .map_err(|e| VulkanError::InitializationFailed(e.to_string()))?;
        let mut stages = [vk::PipelineShaderStageCreateInfo::default(); STAGE_COUNT as usize];
        stages[RAYGEN_STAGE as usize] = raygen.create_stage_info(vk::ShaderStageFlags::RAYGEN_KHR, entry_point);
        stages[MISS_STAGE as usize] = miss.create_stage_info(vk::ShaderStageFlags::MISS_KHR, entry_point);
        stages[CLOSEST_HIT_STAGE as usize] =
            closest_hit.create_stage_info(vk::ShaderStageFlags::CLOSEST_HIT_KHR, entry_point);
        let groups = shader_groups();

        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        let layout = unsafe {
            device.create_pipeline_layout(&layout_info, None)
                .map_err(VulkanError::Api)?
        };

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(layout)
            .build();

        let pipeline = match unsafe {
            context.ray_tracing_loader().create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        } {
            Ok(pipelines) => pipelines[0],
            Err(e) => {
                log::error!("[RT PIPELINE] Pipeline creation failed: {:?}", e);
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(VulkanError::Api(e));
            }
        };

        let table = match Self::create_shader_binding_table(context, pipeline) {
            Ok(table) => table,
            Err(e) => {
                unsafe {
                    device.destroy_pipeline(pipeline, None);
                    device.destroy_pipeline_layout(layout, None);
                }
                return Err(e);
            }
        };
        let (shader_binding_table, [raygen_region, miss_region, hit_region]) = table;

        log::info!("[RT PIPELINE] Ray tracing pipeline created with {} shader groups", GROUP_COUNT);

        Ok(Self {
            context: Arc::clone(context),
            pipeline,
            layout,
            shader_binding_table,
            raygen_region,
            miss_region,
            hit_region,
        })
    }

    fn create_shader_binding_table(
        context: &Arc<VulkanContext>,
        pipeline: vk::Pipeline,
    ) -> VulkanResult<(Buffer, [vk::StridedDeviceAddressRegionKHR; 3])> {
        let properties = context.ray_tracing_properties();
        let layout = ShaderBindingTableLayout::new(
            properties.shader_group_handle_size,
            properties.shader_group_handle_alignment,
            properties.shader_group_base_alignment,
        );

        let handle_size = layout.handle_size as usize;
        let handles = unsafe {
            context.ray_tracing_loader()
                .get_ray_tracing_shader_group_handles(pipeline, 0, GROUP_COUNT, handle_size * GROUP_COUNT as usize)
                .map_err(VulkanError::Api)?
        };

        let buffer = Buffer::new(
            context,
            &BufferCreation {
                size: layout.allocation_size(),
                usage: vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                mappable: true,
                memory_usage: vk_mem::MemoryUsage::CpuToGpu,
                name: "shader binding table".to_string(),
            },
        )?;

        let buffer_address = buffer.device_address();
        let start = layout.start_offset(buffer_address);
        for (group, handle) in (0..GROUP_COUNT).zip(handles.chunks_exact(handle_size)) {
            buffer.write_at(start + layout.region_offset(group), handle)?;
        }

        let table_address = buffer_address + start;
        let regions = [
            layout.region(table_address, RAYGEN_GROUP),
            layout.region(table_address, MISS_GROUP),
            layout.region(table_address, HIT_GROUP),
        ];
        log::debug!(
            "[RT PIPELINE] Shader binding table: stride {}, region size {}",
            layout.handle_size_aligned,
            layout.region_size
        );
        Ok((buffer, regions))
    }

    /// Pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Pipeline layout handle
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Buffer holding the shader group handles
    pub fn shader_binding_table(&self) -> &Buffer {
        &self.shader_binding_table
    }

    /// Bind the pipeline and its descriptor sets, starting at set 0
    pub fn bind(&self, device: &Device, command_buffer: vk::CommandBuffer, descriptor_sets: &[vk::DescriptorSet]) {
        unsafe {
            device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::RAY_TRACING_KHR, self.pipeline);
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.layout,
                0,
                descriptor_sets,
                &[],
            );
        }
    }

    /// Dispatch one ray per pixel of a `width` x `height` target
    pub fn trace_rays(&self, command_buffer: vk::CommandBuffer, width: u32, height: u32) {
        let callable_region = vk::StridedDeviceAddressRegionKHR::default();
        unsafe {
            self.context.ray_tracing_loader().cmd_trace_rays(
                command_buffer,
                &self.raygen_region,
                &self.miss_region,
                &self.hit_region,
                &callable_region,
                width,
                height,
                1,
            );
        }
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            let device = self.context.device();
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_reference_stage_positions() {
        let groups = shader_groups();

        let raygen = groups[RAYGEN_GROUP as usize];
        assert_eq!(raygen.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(raygen.general_shader, RAYGEN_STAGE);

        let miss = groups[MISS_GROUP as usize];
        assert_eq!(miss.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(miss.general_shader, MISS_STAGE);
        assert_eq!(miss.closest_hit_shader, vk::SHADER_UNUSED_KHR);

        let hit = groups[HIT_GROUP as usize];
        assert_eq!(hit.ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(hit.general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(hit.closest_hit_shader, CLOSEST_HIT_STAGE);
        assert_eq!(hit.any_hit_shader, vk::SHADER_UNUSED_KHR);
    }

    #[test]
    fn test_layout_with_base_alignment() {
        let layout = ShaderBindingTableLayout::new(32, 32, 64);
        assert_eq!(layout.handle_size_aligned, 32);
        assert_eq!(layout.region_size, 64);
        assert_eq!(layout.region_offset(RAYGEN_GROUP), 0);
        assert_eq!(layout.region_offset(MISS_GROUP), 64);
        assert_eq!(layout.region_offset(HIT_GROUP), 128);
        assert_eq!(layout.allocation_size(), 3 * 64 + 64);
    }

    #[test]
    fn test_unaligned_handle_size_is_padded() {
        let layout = ShaderBindingTableLayout::new(20, 16, 16);
        assert_eq!(layout.handle_size_aligned, 32);
        assert_eq!(layout.region_size, 32);
    }

    #[test]
    fn test_table_start_is_base_aligned() {
        let layout = ShaderBindingTableLayout::new(32, 32, 64);
        assert_eq!(layout.start_offset(0x1000), 0);
        assert_eq!(layout.start_offset(0x1010), 0x30);

        let region = layout.region(0x1040, MISS_GROUP);
        assert_eq!(region.device_address, 0x1080);
        assert_eq!(region.stride, 32);
        assert_eq!(region.size, 32);
    }
}
