//! Bottom-level acceleration structures
//!
//! One structure per model. Every node that carries meshes contributes its
//! world transform to a per-model transform buffer, and every mesh on such a
//! node becomes one opaque triangle geometry that reads its vertices from the
//! model-wide vertex buffer, its indices from its range of the index buffer
//! and its transform from the node's slot in the transform buffer.
//!
//! The geometry layout is computed by [`plan_bottom_level_geometry`] without
//! touching the device, then turned into Vulkan structs for the build.

use ash::vk;
use std::sync::Arc;

use crate::foundation::math::{to_row_major_3x4, Mat4};
use crate::render::backends::vulkan::acceleration::structure::AccelerationStructure;
use crate::render::backends::vulkan::acceleration::top_level::BlasInstance;
use crate::render::backends::vulkan::resources::bindless::BindlessResources;
use crate::render::backends::vulkan::resources::buffer::{Buffer, BufferCreation};
use crate::render::backends::vulkan::resources::geometry_node::GeometryNodeCreation;
use crate::scene::{Mesh, Model, SceneGraph, Vertex};
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Byte size of one row-major 3x4 transform
pub const TRANSFORM_STRIDE: vk::DeviceSize = std::mem::size_of::<vk::TransformMatrixKHR>() as vk::DeviceSize;

/// Byte size of one index
pub const INDEX_STRIDE: vk::DeviceSize = std::mem::size_of::<u32>() as vk::DeviceSize;

/// Base device addresses of a model's geometry buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryAddresses {
    /// Vertex buffer
    pub vertex_buffer: vk::DeviceAddress,
    /// Index buffer
    pub index_buffer: vk::DeviceAddress,
    /// Per-node transform buffer
    pub transform_buffer: vk::DeviceAddress,
}

/// One triangle geometry of a bottom-level build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    /// First vertex of the model
    pub vertex_address: vk::DeviceAddress,
    /// First index of the mesh
    pub index_address: vk::DeviceAddress,
    /// Transform of the owning node
    pub transform_address: vk::DeviceAddress,
    /// Highest vertex index the geometry may reference
    pub max_vertex: u32,
    /// Number of triangles
    pub primitive_count: u32,
}

/// Geometries of one model and the records hit shaders need for them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BottomLevelGeometryPlan {
    /// Triangle geometries in build order
    pub geometries: Vec<TriangleGeometry>,
    /// One record per geometry, same order
    pub geometry_nodes: Vec<GeometryNodeCreation>,
}

impl BottomLevelGeometryPlan {
    /// Whether no geometry survived planning
    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }

    /// Total triangles across all geometries
    pub fn primitive_count(&self) -> u64 {
        self.geometries.iter().map(|geometry| u64::from(geometry.primitive_count)).sum()
    }
}

/// World transforms of all mesh-bearing nodes, row-major 3x4, in node order
pub fn collect_node_transforms(graph: &SceneGraph) -> VulkanResult<Vec<[f32; 12]>> {
    graph
        .iter()
        .filter(|(_, node)| !node.meshes.is_empty())
        .map(|(index, _)| {
            graph
                .world_matrix(index)
                .map(|world| to_row_major_3x4(&world))
                .map_err(|e| VulkanError::InvalidOperation { reason: e.to_string() })
        })
        .collect()
}

/// Lay out the triangle geometries of a model
///
/// Transform slots are assigned to mesh-bearing nodes in node order, matching
/// [`collect_node_transforms`]. Meshes without indices, meshes whose index
/// range runs past `index_count`, and out-of-range mesh references are
/// reported and left out.
pub fn plan_bottom_level_geometry(
    model_name: &str,
    graph: &SceneGraph,
    meshes: &[Mesh],
    vertex_count: u32,
    index_count: u32,
    addresses: GeometryAddresses,
) -> BottomLevelGeometryPlan {
    let mut plan = BottomLevelGeometryPlan::default();
    let max_vertex = vertex_count.saturating_sub(1);

    let mesh_nodes = graph.nodes().iter().filter(|node| !node.meshes.is_empty());
    for (slot, node) in (0u64..).zip(mesh_nodes) {
        let transform_address = addresses.transform_buffer + slot * TRANSFORM_STRIDE;

        for &mesh_index in &node.meshes {
            let Some(mesh) = meshes.get(mesh_index) else {
                log::error!(
                    "[BLAS] Node '{}' of model '{}' references missing mesh {}",
                    node.name,
                    model_name,
                    mesh_index
                );
                continue;
            };

            if mesh.index_count == 0 {
                log::error!("[BLAS] Mesh '{}' of model '{}' has no indices; skipping it", mesh.name, model_name);
                continue;
            }
            let range_end = mesh.first_index.checked_add(mesh.index_count);
            if range_end.map_or(true, |end| end > index_count) {
                log::error!(
                    "[BLAS] Mesh '{}' of model '{}' reads indices {}..{} but the model has {}; skipping it",
                    mesh.name,
                    model_name,
                    mesh.first_index,
                    u64::from(mesh.first_index) + u64::from(mesh.index_count),
                    index_count
                );
                continue;
            }
            if mesh.index_count % 3 != 0 {
                log::warn!(
                    "[BLAS] Mesh '{}' of model '{}' has {} indices, not a whole number of triangles",
                    mesh.name,
                    model_name,
                    mesh.index_count
                );
            }

            let index_address = addresses.index_buffer + u64::from(mesh.first_index) * INDEX_STRIDE;
            plan.geometries.push(TriangleGeometry {
                vertex_address: addresses.vertex_buffer,
                index_address,
                transform_address,
                max_vertex,
                primitive_count: mesh.index_count / 3,
            });
            plan.geometry_nodes.push(GeometryNodeCreation {
                vertex_buffer_address: addresses.vertex_buffer,
                index_buffer_address: index_address,
                material: mesh.material,
            });
        }
    }

    plan
}

fn triangle_geometry(geometry: &TriangleGeometry) -> vk::AccelerationStructureGeometryKHR {
    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
        .vertex_format(vk::Format::R32G32B32_SFLOAT)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: geometry.vertex_address,
        })
        .vertex_stride(std::mem::size_of::<Vertex>() as vk::DeviceSize)
        .max_vertex(geometry.max_vertex)
        .index_type(vk::IndexType::UINT32)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: geometry.index_address,
        })
        .transform_data(vk::DeviceOrHostAddressConstKHR {
            device_address: geometry.transform_address,
        })
        .build();

    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        .build()
}

/// Bottom-level structure of one model
pub struct BottomLevelAccelerationStructure {
    structure: AccelerationStructure,
    transform_buffer: Buffer,
    geometry_count: u32,
    primitive_count: u64,
    first_geometry_node: u32,
    transform: Mat4,
}

impl BottomLevelAccelerationStructure {
    /// Build the structure for `model` and register its geometry records
    ///
    /// Returns `Ok(None)` when the model has nothing to build, either because
    /// no node carries meshes or because every mesh was excluded. The model
    /// is reported and left out of the scene.
    pub fn new(
        context: &Arc<VulkanContext>,
        model: &Model,
        bindless: &mut BindlessResources,
    ) -> VulkanResult<Option<Self>> {
        let transforms = collect_node_transforms(model.graph())?;
        if transforms.is_empty() {
            log::error!("[BLAS] Model '{}' has no nodes with meshes; leaving it out of the scene", model.name());
            return Ok(None);
        }

        let transform_buffer = Buffer::new(
            context,
            &BufferCreation {
                size: transforms.len() as vk::DeviceSize * TRANSFORM_STRIDE,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                mappable: true,
                memory_usage: vk_mem::MemoryUsage::CpuToGpu,
                name: format!("{} transforms", model.name()),
            },
        )?;
        transform_buffer.write(&transforms)?;

        let addresses = GeometryAddresses {
            vertex_buffer: model.vertex_buffer().device_address(),
            index_buffer: model.index_buffer().device_address(),
            transform_buffer: transform_buffer.device_address(),
        };
        let plan = plan_bottom_level_geometry(
            model.name(),
            model.graph(),
            model.meshes(),
            model.vertex_count(),
            model.index_count(),
            addresses,
        );
        if plan.is_empty() {
            log::error!("[BLAS] Model '{}' has no buildable geometry; leaving it out of the scene", model.name());
            return Ok(None);
        }

        let geometries: Vec<_> = plan.geometries.iter().map(triangle_geometry).collect();
        let ranges: Vec<_> = plan
            .geometries
            .iter()
            .map(|geometry| vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: geometry.primitive_count,
                primitive_offset: 0,
                first_vertex: 0,
                transform_offset: 0,
            })
            .collect();

        let structure = AccelerationStructure::build(
            context,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &geometries,
            &ranges,
            &format!("{} BLAS", model.name()),
        )?;

        let first_geometry_node = bindless.geometry_nodes().len() as u32;
        for node in &plan.geometry_nodes {
            bindless.create_geometry_node(node);
        }

        Ok(Some(Self {
            structure,
            transform_buffer,
            geometry_count: plan.geometries.len() as u32,
            primitive_count: plan.primitive_count(),
            first_geometry_node,
            transform: *model.transform(),
        }))
    }

    /// Underlying structure
    pub fn structure(&self) -> &AccelerationStructure {
        &self.structure
    }

    /// Device address of the structure
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.structure.device_address()
    }

    /// Per-node transform buffer
    pub fn transform_buffer(&self) -> &Buffer {
        &self.transform_buffer
    }

    /// Number of triangle geometries
    pub fn geometry_count(&self) -> u32 {
        self.geometry_count
    }

    /// Total number of triangles
    pub fn primitive_count(&self) -> u64 {
        self.primitive_count
    }

    /// Index of this model's first record in the geometry node table
    pub fn first_geometry_node(&self) -> u32 {
        self.first_geometry_node
    }

    /// Instance transform
    pub fn transform(&self) -> &Mat4 {
        &self.transform
    }

    /// Instance description for the top-level build
    pub fn instance(&self) -> BlasInstance {
        BlasInstance {
            device_address: self.device_address(),
            transform: self.transform,
            custom_index: self.first_geometry_node,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::render::backends::vulkan::resources::resource_table::ResourceHandle;
    use crate::scene::Node;
    use approx::assert_relative_eq;

    const ADDRESSES: GeometryAddresses = GeometryAddresses {
        vertex_buffer: 0x1_0000,
        index_buffer: 0x2_0000,
        transform_buffer: 0x3_0000,
    };

    fn mesh(name: &str, first_index: u32, index_count: u32, material: u32) -> Mesh {
        Mesh::from_primitive(name, first_index, index_count, &[ResourceHandle::new(material)])
    }

    #[test]
    fn test_single_triangle_plan() {
        let mut graph = SceneGraph::new();
        graph.add_node(Node::new("root", Mat4::identity()).with_meshes(vec![0])).unwrap();
        let meshes = [mesh("tri", 0, 3, 7)];

        let plan = plan_bottom_level_geometry("model", &graph, &meshes, 3, 3, ADDRESSES);

        assert_eq!(plan.geometries.len(), 1);
        let geometry = plan.geometries[0];
        assert_eq!(geometry.primitive_count, 1);
        assert_eq!(geometry.max_vertex, 2);
        assert_eq!(geometry.vertex_address, ADDRESSES.vertex_buffer);
        assert_eq!(geometry.index_address, ADDRESSES.index_buffer);
        assert_eq!(geometry.transform_address, ADDRESSES.transform_buffer);

        assert_eq!(plan.geometry_nodes.len(), 1);
        assert_eq!(plan.geometry_nodes[0].material.index(), 7);
        assert_eq!(plan.primitive_count(), 1);
    }

    #[test]
    fn test_offsets_follow_index_ranges_and_node_slots() {
        let mut graph = SceneGraph::new();
        let root = graph.add_node(Node::new("root", Mat4::identity())).unwrap();
        graph.add_child(root, Node::new("a", Mat4::identity()).with_meshes(vec![0])).unwrap();
        graph.add_child(root, Node::new("b", Mat4::identity()).with_meshes(vec![1, 2])).unwrap();
        let meshes = [mesh("m0", 0, 6, 0), mesh("m1", 6, 3, 1), mesh("m2", 9, 12, 2)];

        let plan = plan_bottom_level_geometry("model", &graph, &meshes, 24, 21, ADDRESSES);

        let index_offsets: Vec<_> = plan.geometries.iter().map(|g| g.index_address - ADDRESSES.index_buffer).collect();
        assert_eq!(index_offsets, vec![0, 24, 36]);

        // root carries no meshes, so node "a" takes slot 0 and "b" slot 1
        let transform_offsets: Vec<_> = plan
            .geometries
            .iter()
            .map(|g| g.transform_address - ADDRESSES.transform_buffer)
            .collect();
        assert_eq!(transform_offsets, vec![0, 48, 48]);

        assert_eq!(plan.primitive_count(), 2 + 1 + 4);
        assert_eq!(
            plan.geometry_nodes.iter().map(|n| n.index_buffer_address).collect::<Vec<_>>(),
            plan.geometries.iter().map(|g| g.index_address).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_empty_and_missing_meshes_are_excluded() {
        let mut graph = SceneGraph::new();
        graph.add_node(Node::new("root", Mat4::identity()).with_meshes(vec![0, 1, 5])).unwrap();
        let meshes = [mesh("empty", 0, 0, 0), mesh("tri", 0, 3, 1)];

        let plan = plan_bottom_level_geometry("model", &graph, &meshes, 3, 3, ADDRESSES);

        assert_eq!(plan.geometries.len(), 1);
        assert_eq!(plan.geometry_nodes[0].material.index(), 1);
    }

    #[test]
    fn test_index_range_past_the_end_is_excluded() {
        let mut graph = SceneGraph::new();
        graph.add_node(Node::new("root", Mat4::identity()).with_meshes(vec![0, 1, 2])).unwrap();
        let meshes = [
            mesh("past end", 6, 3, 0),
            mesh("wraps", u32::MAX - 1, 3, 1),
            mesh("tri", 0, 3, 2),
        ];

        let plan = plan_bottom_level_geometry("model", &graph, &meshes, 3, 3, ADDRESSES);

        assert_eq!(plan.geometries.len(), 1);
        assert_eq!(plan.geometries[0].index_address, ADDRESSES.index_buffer);
        assert_eq!(plan.geometry_nodes[0].material.index(), 2);
    }

    #[test]
    fn test_range_ending_exactly_at_index_count_is_kept() {
        let mut graph = SceneGraph::new();
        graph.add_node(Node::new("root", Mat4::identity()).with_meshes(vec![0])).unwrap();
        let meshes = [mesh("last", 3, 3, 0)];

        let plan = plan_bottom_level_geometry("model", &graph, &meshes, 6, 6, ADDRESSES);

        assert_eq!(plan.geometries.len(), 1);
        assert_eq!(plan.geometries[0].index_address, ADDRESSES.index_buffer + 12);
    }

    #[test]
    fn test_model_with_only_excluded_meshes_plans_nothing() {
        let mut graph = SceneGraph::new();
        graph.add_node(Node::new("root", Mat4::identity()).with_meshes(vec![0, 1, 4])).unwrap();
        let meshes = [mesh("empty", 0, 0, 0), mesh("past end", 3, 3, 1)];

        let plan = plan_bottom_level_geometry("model", &graph, &meshes, 3, 3, ADDRESSES);

        assert!(plan.is_empty());
        assert!(plan.geometry_nodes.is_empty());
        assert_eq!(plan.primitive_count(), 0);
    }

    #[test]
    fn test_graph_without_mesh_nodes_has_no_transforms() {
        let mut graph = SceneGraph::new();
        graph.add_node(Node::new("root", Mat4::identity())).unwrap();

        assert!(collect_node_transforms(&graph).unwrap().is_empty());
    }

    #[test]
    fn test_node_transforms_are_world_and_row_major() {
        let mut graph = SceneGraph::new();
        let parent = graph.add_node(Node::new("parent", Mat4::new_translation(&Vec3::new(1.0, 0.0, 0.0)))).unwrap();
        graph
            .add_child(parent, Node::new("child", Mat4::new_translation(&Vec3::new(0.0, 2.0, 0.0))).with_meshes(vec![0]))
            .unwrap();

        let transforms = collect_node_transforms(&graph).unwrap();

        assert_eq!(transforms.len(), 1);
        assert_relative_eq!(transforms[0][3], 1.0);
        assert_relative_eq!(transforms[0][7], 2.0);
        assert_relative_eq!(transforms[0][11], 0.0);
    }

    #[test]
    fn test_transform_stride_matches_vulkan() {
        assert_eq!(TRANSFORM_STRIDE, 48);
        assert_eq!(INDEX_STRIDE, 4);
    }
}
