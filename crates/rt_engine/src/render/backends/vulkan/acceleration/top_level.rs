//! Top-level acceleration structure
//!
//! Instances every bottom-level structure once, with the model's transform,
//! a full visibility mask and back-face culling disabled. The instance
//! custom index carries the model's first geometry record so hit shaders
//! can find per-geometry data as `gl_InstanceCustomIndexEXT + gl_GeometryIndexEXT`.

use ash::vk;
use std::sync::Arc;

use crate::foundation::math::{to_vk_transform, Mat4};
use crate::render::backends::vulkan::acceleration::bottom_level::BottomLevelAccelerationStructure;
use crate::render::backends::vulkan::acceleration::structure::AccelerationStructure;
use crate::render::backends::vulkan::resources::buffer::{Buffer, BufferCreation};
use crate::render::backends::vulkan::{VulkanContext, VulkanResult};

/// Visibility mask given to every instance
pub const INSTANCE_MASK: u8 = 0xFF;

const MAX_CUSTOM_INDEX: u32 = (1 << 24) - 1;

/// Placement of one bottom-level structure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlasInstance {
    /// Device address of the bottom-level structure
    pub device_address: vk::DeviceAddress,
    /// Instance transform
    pub transform: Mat4,
    /// 24-bit value exposed to shaders as the instance custom index
    pub custom_index: u32,
}

/// Vulkan instance records, one per bottom-level structure, same order
pub fn instance_records(instances: &[BlasInstance]) -> Vec<vk::AccelerationStructureInstanceKHR> {
    instances
        .iter()
        .map(|instance| {
            if instance.custom_index > MAX_CUSTOM_INDEX {
                log::error!(
                    "[TLAS] Custom index {} does not fit in 24 bits; hit shaders will read wrong geometry records",
                    instance.custom_index
                );
            }
            vk::AccelerationStructureInstanceKHR {
                transform: to_vk_transform(&instance.transform),
                instance_custom_index_and_mask: vk::Packed24_8::new(instance.custom_index & MAX_CUSTOM_INDEX, INSTANCE_MASK),
                instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                    0,
                    vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
                ),
                acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                    device_handle: instance.device_address,
                },
            }
        })
        .collect()
}

/// Bytes allocated for `instance_count` records
///
/// At least one record is allocated so an empty scene still has a valid
/// instances buffer to build from.
pub fn instances_buffer_size(instance_count: usize) -> vk::DeviceSize {
    (instance_count.max(1) * std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()) as vk::DeviceSize
}

/// Top-level structure over all models
pub struct TopLevelAccelerationStructure {
    structure: AccelerationStructure,
    instances_buffer: Buffer,
    instance_count: u32,
}

impl TopLevelAccelerationStructure {
    /// Build the structure over `bottom_levels`
    ///
    /// An empty slice yields a structure with zero instances that every ray
    /// misses.
    pub fn new(
        context: &Arc<VulkanContext>,
        bottom_levels: &[BottomLevelAccelerationStructure],
    ) -> VulkanResult<Self> {
        if bottom_levels.is_empty() {
            log::error!("[TLAS] Scene has no bottom-level structures; building an empty top-level structure");
        }

        let instances: Vec<BlasInstance> = bottom_levels.iter().map(BottomLevelAccelerationStructure::instance).collect();
        let records = instance_records(&instances);
        let instance_count = records.len() as u32;

        let instances_buffer = Buffer::new(
            context,
            &BufferCreation {
                size: instances_buffer_size(records.len()),
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                mappable: true,
                memory_usage: vk_mem::MemoryUsage::CpuToGpu,
                name: "TLAS instances".to_string(),
            },
        )?;
        instances_buffer.write(&records)?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instances_buffer.device_address(),
            })
            .build();
        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances: instances_data })
            .build();
        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: instance_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };

        let structure = AccelerationStructure::build(
            context,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            &[geometry],
            &[range],
            "scene TLAS",
        )?;

        Ok(Self {
            structure,
            instances_buffer,
            instance_count,
        })
    }

    /// Underlying structure, bound for ray dispatch
    pub fn structure(&self) -> &AccelerationStructure {
        &self.structure
    }

    /// Buffer holding the instance records
    pub fn instances_buffer(&self) -> &Buffer {
        &self.instances_buffer
    }

    /// Number of instances
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{to_row_major_3x4, Vec3};

    fn instance(address: u64, offset: f32, custom_index: u32) -> BlasInstance {
        BlasInstance {
            device_address: address,
            transform: Mat4::new_translation(&Vec3::new(offset, 0.0, 0.0)),
            custom_index,
        }
    }

    #[test]
    fn test_one_record_per_bottom_level() {
        let instances = [instance(0x100, 1.0, 0), instance(0x200, 2.0, 3), instance(0x300, 3.0, 5)];
        let records = instance_records(&instances);

        assert_eq!(records.len(), instances.len());
        for (record, source) in records.iter().zip(&instances) {
            assert_eq!(record.transform.matrix, to_row_major_3x4(&source.transform));
            assert_eq!(record.instance_custom_index_and_mask.low_24(), source.custom_index);
            assert_eq!(record.instance_custom_index_and_mask.high_8(), INSTANCE_MASK);
            let reference = unsafe { record.acceleration_structure_reference.device_handle };
            assert_eq!(reference, source.device_address);
        }
    }

    #[test]
    fn test_instances_disable_face_culling() {
        let records = instance_records(&[instance(0x100, 0.0, 0)]);
        let flags = &records[0].instance_shader_binding_table_record_offset_and_flags;
        assert_eq!(flags.low_24(), 0);
        assert_eq!(
            u32::from(flags.high_8()),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
    }

    #[test]
    fn test_identity_instance_transform() {
        let records = instance_records(&[BlasInstance {
            device_address: 1,
            transform: Mat4::identity(),
            custom_index: 0,
        }]);
        assert_eq!(
            records[0].transform.matrix,
            [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn test_empty_scene_has_no_records_but_a_valid_buffer() {
        assert!(instance_records(&[]).is_empty());
        assert_eq!(instances_buffer_size(0), 64);
    }

    #[test]
    fn test_instances_buffer_holds_every_record() {
        assert_eq!(instances_buffer_size(3), 3 * 64);
    }

    #[test]
    fn test_instance_record_size() {
        assert_eq!(std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(), 64);
    }
}
