//! Per-geometry records for hit shaders
//!
//! Each triangle geometry in a bottom-level structure gets one record that
//! tells the closest-hit shader where its vertices and indices live and which
//! material to shade with. Shaders find the record through
//! `gl_InstanceCustomIndexEXT + gl_GeometryIndexEXT`.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::render::backends::vulkan::resources::material::Material;
use crate::render::backends::vulkan::resources::resource_table::ResourceHandle;

/// CPU-side description of a geometry record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryNodeCreation {
    /// Device address of the first vertex of the owning model
    pub vertex_buffer_address: vk::DeviceAddress,
    /// Device address of the mesh's first index
    pub index_buffer_address: vk::DeviceAddress,
    /// Material used for shading
    pub material: ResourceHandle<Material>,
}

/// GPU geometry record (std430, 32 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GeometryNode {
    /// Vertex buffer device address
    pub vertex_buffer_address: u64,
    /// Index buffer device address
    pub index_buffer_address: u64,
    /// Index into the bindless materials array
    pub material_index: u32,
    _padding: [u32; 3],
}

impl From<&GeometryNodeCreation> for GeometryNode {
    fn from(creation: &GeometryNodeCreation) -> Self {
        Self {
            vertex_buffer_address: creation.vertex_buffer_address,
            index_buffer_address: creation.index_buffer_address,
            material_index: creation.material.index(),
            _padding: [0; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        assert_eq!(std::mem::size_of::<GeometryNode>(), 32);
        assert_eq!(std::mem::align_of::<GeometryNode>(), 8);
    }

    #[test]
    fn test_creation_resolves_material_index() {
        let node = GeometryNode::from(&GeometryNodeCreation {
            vertex_buffer_address: 0x1000,
            index_buffer_address: 0x2000,
            material: ResourceHandle::new(4),
        });
        assert_eq!(node.vertex_buffer_address, 0x1000);
        assert_eq!(node.index_buffer_address, 0x2000);
        assert_eq!(node.material_index, 4);
    }
}
