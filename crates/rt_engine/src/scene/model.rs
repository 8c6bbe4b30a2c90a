//! Models handed over by the scene loader and their GPU upload
//!
//! A model stores all of its vertices and indices in two shared arrays; each
//! [`Mesh`] is a range of the index array with one material. After
//! [`Model::upload`] the arrays live in device-local buffers that serve both
//! as acceleration-structure build input and, through their device
//! addresses, as storage the hit shaders read.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

use crate::foundation::math::Mat4;
use crate::render::backends::vulkan::rendering::commands::{copy_buffer, SingleTimeCommands};
use crate::render::backends::vulkan::resources::buffer::{Buffer, BufferCreation};
use crate::render::backends::vulkan::resources::material::Material;
use crate::render::backends::vulkan::resources::resource_table::ResourceHandle;
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};
use crate::scene::node::SceneGraph;

/// Vertex layout shared with the hit shaders (32 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Object-space normal
    pub normal: [f32; 3],
    /// First UV set
    pub tex_coord: [f32; 2],
}

impl Vertex {
    /// Create a vertex
    pub fn new(position: [f32; 3], normal: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self { position, normal, tex_coord }
    }
}

/// Range of a model's index array drawn with one material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mesh {
    /// Name from the scene file, for diagnostics
    pub name: String,
    /// First index of the range
    pub first_index: u32,
    /// Number of indices; a multiple of three for triangle lists
    pub index_count: u32,
    /// Material used by the range
    pub material: ResourceHandle<Material>,
}

impl Mesh {
    /// Build a mesh from one loaded primitive and the materials it references
    ///
    /// Scene loaders call this for every primitive so the one-material rule of
    /// [`resolve_primitive_material`] is applied in one place.
    pub fn from_primitive(
        name: impl Into<String>,
        first_index: u32,
        index_count: u32,
        materials: &[ResourceHandle<Material>],
    ) -> Self {
        let name = name.into();
        let material = resolve_primitive_material(&name, materials);
        Self {
            name,
            first_index,
            index_count,
            material,
        }
    }
}

/// Pick the material of a primitive
///
/// Only one material per primitive is supported: the first reference wins
/// and every further one is reported.
pub fn resolve_primitive_material(
    mesh_name: &str,
    materials: &[ResourceHandle<Material>],
) -> ResourceHandle<Material> {
    let Some((first, rest)) = materials.split_first() else {
        log::warn!("[MODEL] Mesh '{}' has no material; using the null material", mesh_name);
        return ResourceHandle::null();
    };
    for extra in rest {
        log::error!(
            "[MODEL] Mesh '{}' references several materials; ignoring {:?} and keeping {:?}",
            mesh_name,
            extra,
            first
        );
    }
    *first
}

/// Parsed CPU model produced by the scene loader
#[derive(Debug, Clone, PartialEq)]
pub struct ModelData {
    /// Model name
    pub name: String,
    /// All vertices of all meshes
    pub vertices: Vec<Vertex>,
    /// All indices of all meshes, relative to `vertices`
    pub indices: Vec<u32>,
    /// Index ranges with their materials
    pub meshes: Vec<Mesh>,
    /// Node hierarchy; nodes refer to `meshes` by position
    pub graph: SceneGraph,
    /// Instance transform used when the model is placed in the top-level structure
    pub transform: Mat4,
}

impl Default for ModelData {
    fn default() -> Self {
        Self {
            name: String::new(),
            vertices: Vec::new(),
            indices: Vec::new(),
            meshes: Vec::new(),
            graph: SceneGraph::new(),
            transform: Mat4::identity(),
        }
    }
}

/// Uploaded model
pub struct Model {
    name: String,
    meshes: Vec<Mesh>,
    graph: SceneGraph,
    transform: Mat4,
    vertex_count: u32,
    index_count: u32,
    vertex_buffer: Buffer,
    index_buffer: Buffer,
}

impl Model {
    /// Upload vertices and indices to device-local memory
    pub fn upload(context: &Arc<VulkanContext>, data: ModelData) -> VulkanResult<Self> {
        if data.vertices.is_empty() || data.indices.is_empty() {
            return Err(VulkanError::InvalidOperation {
                reason: format!("model '{}' has no vertex or index data", data.name),
            });
        }

        let geometry_usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::TRANSFER_DST;

        let vertex_bytes = std::mem::size_of_val(data.vertices.as_slice()) as vk::DeviceSize;
        let index_bytes = std::mem::size_of_val(data.indices.as_slice()) as vk::DeviceSize;

        let vertex_buffer = Buffer::new(
            context,
            &BufferCreation {
                size: vertex_bytes,
                usage: geometry_usage | vk::BufferUsageFlags::VERTEX_BUFFER,
                mappable: false,
                memory_usage: vk_mem::MemoryUsage::GpuOnly,
                name: format!("{} vertices", data.name),
            },
        )?;
        let index_buffer = Buffer::new(
            context,
            &BufferCreation {
                size: index_bytes,
                usage: geometry_usage | vk::BufferUsageFlags::INDEX_BUFFER,
                mappable: false,
                memory_usage: vk_mem::MemoryUsage::GpuOnly,
                name: format!("{} indices", data.name),
            },
        )?;

        let vertex_staging = Buffer::new(context, &BufferCreation::staging(format!("{} vertex staging", data.name), vertex_bytes))?;
        vertex_staging.write(&data.vertices)?;
        let index_staging = Buffer::new(context, &BufferCreation::staging(format!("{} index staging", data.name), index_bytes))?;
        index_staging.write(&data.indices)?;

        SingleTimeCommands::execute(context, |device, command_buffer| {
            copy_buffer(device, command_buffer, vertex_staging.handle(), vertex_buffer.handle(), vertex_bytes);
            copy_buffer(device, command_buffer, index_staging.handle(), index_buffer.handle(), index_bytes);

            let barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::SHADER_READ)
                .build();
            unsafe {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                        | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            }
        })?;

        log::info!(
            "[MODEL] Uploaded '{}': {} vertices, {} indices, {} meshes, {} nodes",
            data.name,
            data.vertices.len(),
            data.indices.len(),
            data.meshes.len(),
            data.graph.len()
        );

        Ok(Self {
            vertex_count: data.vertices.len() as u32,
            index_count: data.indices.len() as u32,
            name: data.name,
            meshes: data.meshes,
            graph: data.graph,
            transform: data.transform,
            vertex_buffer,
            index_buffer,
        })
    }

    /// Model name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index ranges with materials
    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }

    /// Node hierarchy
    pub fn graph(&self) -> &SceneGraph {
        &self.graph
    }

    /// Instance transform
    pub fn transform(&self) -> &Mat4 {
        &self.transform
    }

    /// Number of vertices
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Number of indices
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Device-local vertex buffer
    pub fn vertex_buffer(&self) -> &Buffer {
        &self.vertex_buffer
    }

    /// Device-local index buffer
    pub fn index_buffer(&self) -> &Buffer {
        &self.index_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        let vertex = Vertex::new([1.0, 2.0, 3.0], [0.0, 1.0, 0.0], [0.5, 0.5]);
        let floats: &[f32] = bytemuck::cast_slice(std::slice::from_ref(&vertex));
        assert_eq!(&floats[..3], &[1.0, 2.0, 3.0]);
        assert_eq!(&floats[6..], &[0.5, 0.5]);
    }

    #[test]
    fn test_first_material_wins() {
        let materials = [ResourceHandle::new(2), ResourceHandle::new(5)];
        assert_eq!(resolve_primitive_material("mesh", &materials), ResourceHandle::new(2));
    }

    #[test]
    fn test_mesh_from_primitive_keeps_first_material() {
        let materials = [ResourceHandle::new(4), ResourceHandle::new(7)];
        let mesh = Mesh::from_primitive("hull", 6, 12, &materials);
        assert_eq!(mesh.name, "hull");
        assert_eq!((mesh.first_index, mesh.index_count), (6, 12));
        assert_eq!(mesh.material, ResourceHandle::new(4));
    }

    #[test]
    fn test_mesh_from_primitive_without_material() {
        assert!(Mesh::from_primitive("bare", 0, 3, &[]).material.is_null());
    }

    #[test]
    fn test_missing_material_is_null() {
        assert!(resolve_primitive_material("mesh", &[]).is_null());
    }
}
