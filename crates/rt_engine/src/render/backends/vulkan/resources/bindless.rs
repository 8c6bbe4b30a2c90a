//! Bindless resource registry
//!
//! Owns the resource tables for images, materials and geometry records and
//! publishes them through one update-after-bind descriptor set:
//!
//! | binding | contents                                   |
//! |---------|--------------------------------------------|
//! | 0       | `sampler2D images[capacity]`               |
//! | 1       | `Material materials[]` (storage buffer)    |
//! | 2       | `GeometryNode geometryNodes[]` (storage)   |
//!
//! Shaders index every array with the same numbers the tables hand out as
//! handles. Image slots past the live count point at a 1x1 fallback image so
//! the whole array is always valid to sample.

use ash::vk;
use std::sync::Arc;

use crate::render::backends::vulkan::rendering::commands::{copy_buffer, SingleTimeCommands};
use crate::render::backends::vulkan::resources::buffer::{Buffer, BufferCreation};
use crate::render::backends::vulkan::resources::descriptor_set::{
    DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetWriter,
};
use crate::render::backends::vulkan::resources::geometry_node::{GeometryNode, GeometryNodeCreation};
use crate::render::backends::vulkan::resources::image::{Image, ImageCreation, Sampler};
use crate::render::backends::vulkan::resources::material::{Material, MaterialCreation};
use crate::render::backends::vulkan::resources::resource_table::{ResourceHandle, ResourceTable};
use crate::render::backends::vulkan::{VulkanContext, VulkanResult};

/// Default number of entries per resource kind
pub const DEFAULT_BINDLESS_CAPACITY: u32 = 1024;

/// Binding of the combined image sampler array
pub const IMAGES_BINDING: u32 = 0;
/// Binding of the materials storage buffer
pub const MATERIALS_BINDING: u32 = 1;
/// Binding of the geometry records storage buffer
pub const GEOMETRY_NODES_BINDING: u32 = 2;

const BINDLESS_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::ANY_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw(),
);

/// What an update does for one resource kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadDecision {
    /// Nothing registered; no descriptor write
    Empty,
    /// Upload `count` entries
    Upload {
        /// Live entry count
        count: u32,
    },
    /// More entries than the array holds; this kind is skipped
    Overflow {
        /// Live entry count
        count: usize,
        /// Array capacity
        capacity: u32,
    },
}

impl UploadDecision {
    /// Decide for `count` live entries against `capacity`
    pub fn new(count: usize, capacity: u32) -> Self {
        match u32::try_from(count) {
            Ok(0) => Self::Empty,
            Ok(count) if count <= capacity => Self::Upload { count },
            _ => Self::Overflow { count, capacity },
        }
    }

    /// Whether this kind produces a descriptor write
    pub fn writes(self) -> bool {
        matches!(self, Self::Upload { .. })
    }
}

/// Per-kind decisions of one descriptor update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindlessUploadPlan {
    /// Image array decision
    pub images: UploadDecision,
    /// Materials buffer decision
    pub materials: UploadDecision,
    /// Geometry records buffer decision
    pub geometry_nodes: UploadDecision,
}

impl BindlessUploadPlan {
    /// Plan an update for the given live counts
    pub fn new(image_count: usize, material_count: usize, geometry_node_count: usize, capacity: u32) -> Self {
        Self {
            images: UploadDecision::new(image_count, capacity),
            materials: UploadDecision::new(material_count, capacity),
            geometry_nodes: UploadDecision::new(geometry_node_count, capacity),
        }
    }

    /// Number of descriptor writes the update performs
    pub fn descriptor_write_count(&self) -> usize {
        [self.images, self.materials, self.geometry_nodes]
            .into_iter()
            .filter(|decision| decision.writes())
            .count()
    }

    /// Report every overflowing kind
    pub fn log_overflows(&self) {
        for (kind, decision) in [
            ("images", self.images),
            ("materials", self.materials),
            ("geometry nodes", self.geometry_nodes),
        ] {
            if let UploadDecision::Overflow { count, capacity } = decision {
                log::error!(
                    "[Bindless] {} {} exceed the capacity of {}; their descriptors keep the previous contents",
                    count,
                    kind,
                    capacity
                );
            }
        }
    }
}

/// Views for every slot of the image array: live views first, fallback after
pub fn image_descriptor_views(live: &[vk::ImageView], fallback: vk::ImageView, capacity: u32) -> Vec<vk::ImageView> {
    let capacity = capacity as usize;
    live.iter()
        .copied()
        .chain(std::iter::repeat(fallback))
        .take(capacity)
        .collect()
}

/// Bindless tables plus the descriptor set publishing them
pub struct BindlessResources {
    context: Arc<VulkanContext>,
    capacity: u32,
    images: ResourceTable<Image>,
    materials: ResourceTable<Material>,
    geometry_nodes: ResourceTable<GeometryNode>,
    material_buffer: Buffer,
    geometry_node_buffer: Buffer,
    fallback_image: Image,
    fallback_sampler: Sampler,
    descriptor_set: vk::DescriptorSet,
    descriptor_pool: DescriptorPool,
    descriptor_set_layout: DescriptorSetLayout,
}

impl BindlessResources {
    /// Create the layout, pool, set, storage buffers and fallback image
    pub fn new(context: &Arc<VulkanContext>, capacity: u32) -> VulkanResult<Self> {
        let device = context.device();
        let array_flags = vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;

        let descriptor_set_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(
                IMAGES_BINDING,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                capacity,
                BINDLESS_STAGES,
                array_flags,
            )
            .add_binding(
                MATERIALS_BINDING,
                vk::DescriptorType::STORAGE_BUFFER,
                1,
                BINDLESS_STAGES,
                vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
            )
            .add_binding(
                GEOMETRY_NODES_BINDING,
                vk::DescriptorType::STORAGE_BUFFER,
                1,
                BINDLESS_STAGES,
                vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
            )
            .update_after_bind_pool()
            .build(device)?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 2,
            },
        ];
        let descriptor_pool = DescriptorPool::new(
            device.clone(),
            &pool_sizes,
            1,
            vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
        )?;
        let descriptor_set = descriptor_pool.allocate(&descriptor_set_layout)?;

        let material_buffer = Buffer::new(context, &Self::storage_creation::<Material>("bindless materials", capacity))?;
        let geometry_node_buffer =
            Buffer::new(context, &Self::storage_creation::<GeometryNode>("bindless geometry nodes", capacity))?;

        let fallback_image = Image::new(
            context,
            &ImageCreation {
                data: vec![255; 4],
                width: 1,
                height: 1,
                name: "bindless fallback".to_string(),
                ..Default::default()
            },
        )?;
        let fallback_sampler = Sampler::new(context)?;

        log::info!("[Bindless] Registry created with capacity {} per kind", capacity);

        Ok(Self {
            context: Arc::clone(context),
            capacity,
            images: ResourceTable::new(),
            materials: ResourceTable::new(),
            geometry_nodes: ResourceTable::new(),
            material_buffer,
            geometry_node_buffer,
            fallback_image,
            fallback_sampler,
            descriptor_set,
            descriptor_pool,
            descriptor_set_layout,
        })
    }

    fn storage_creation<T>(name: &str, capacity: u32) -> BufferCreation {
        BufferCreation {
            size: std::mem::size_of::<T>() as vk::DeviceSize * vk::DeviceSize::from(capacity),
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            mappable: false,
            memory_usage: vk_mem::MemoryUsage::GpuOnly,
            name: name.to_string(),
        }
    }

    /// Per-kind capacity
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Image table
    pub fn images(&self) -> &ResourceTable<Image> {
        &self.images
    }

    /// Image table for `create` calls
    pub fn images_mut(&mut self) -> &mut ResourceTable<Image> {
        &mut self.images
    }

    /// Material table
    pub fn materials(&self) -> &ResourceTable<Material> {
        &self.materials
    }

    /// Material table for `create` calls
    pub fn materials_mut(&mut self) -> &mut ResourceTable<Material> {
        &mut self.materials
    }

    /// Geometry record table
    pub fn geometry_nodes(&self) -> &ResourceTable<GeometryNode> {
        &self.geometry_nodes
    }

    /// Geometry record table for `create` calls
    pub fn geometry_nodes_mut(&mut self) -> &mut ResourceTable<GeometryNode> {
        &mut self.geometry_nodes
    }

    /// Create an image and register it
    pub fn create_image(&mut self, creation: &ImageCreation) -> VulkanResult<ResourceHandle<Image>> {
        let image = Image::new(&self.context, creation)?;
        Ok(self.images.create(image))
    }

    /// Flatten and register a material
    pub fn create_material(&mut self, creation: &MaterialCreation) -> ResourceHandle<Material> {
        self.materials.create(Material::from(creation))
    }

    /// Register a geometry record
    pub fn create_geometry_node(&mut self, creation: &GeometryNodeCreation) -> ResourceHandle<GeometryNode> {
        self.geometry_nodes.create(GeometryNode::from(creation))
    }

    /// Descriptor set to bind for ray dispatch
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    /// Layout of [`Self::descriptor_set`]
    pub fn descriptor_set_layout(&self) -> &DescriptorSetLayout {
        &self.descriptor_set_layout
    }

    /// Publish the current table contents to the descriptor set
    ///
    /// Kinds with no entries are left untouched. Kinds over capacity are
    /// reported and skipped while the others still upload.
    pub fn update_descriptor_set(&self) -> VulkanResult<BindlessUploadPlan> {
        let plan = BindlessUploadPlan::new(
            self.images.len(),
            self.materials.len(),
            self.geometry_nodes.len(),
            self.capacity,
        );
        plan.log_overflows();

        let mut writer = DescriptorSetWriter::new(self.descriptor_set);

        if plan.images.writes() {
            let live: Vec<vk::ImageView> = self.images.get_all().iter().map(Image::view).collect();
            let infos = image_descriptor_views(&live, self.fallback_image.view(), self.capacity)
                .into_iter()
                .map(|view| vk::DescriptorImageInfo {
                    sampler: self.fallback_sampler.handle(),
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                })
                .collect();
            writer = writer.images(IMAGES_BINDING, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, infos);
        }

        if plan.materials.writes() {
            let range = self.upload_records("materials", self.materials.get_all(), &self.material_buffer)?;
            writer = writer.buffer(MATERIALS_BINDING, vk::DescriptorType::STORAGE_BUFFER, self.material_buffer.handle(), range);
        }

        if plan.geometry_nodes.writes() {
            let range = self.upload_records("geometry nodes", self.geometry_nodes.get_all(), &self.geometry_node_buffer)?;
            writer = writer.buffer(
                GEOMETRY_NODES_BINDING,
                vk::DescriptorType::STORAGE_BUFFER,
                self.geometry_node_buffer.handle(),
                range,
            );
        }

        log::debug!(
            "[Bindless] Updating {} descriptor bindings ({} images, {} materials, {} geometry nodes)",
            writer.len(),
            self.images.len(),
            self.materials.len(),
            self.geometry_nodes.len()
        );
        writer.update(self.context.device());

        Ok(plan)
    }

    fn upload_records<T: Copy>(&self, kind: &str, records: &[T], destination: &Buffer) -> VulkanResult<vk::DeviceSize> {
        let size = std::mem::size_of_val(records) as vk::DeviceSize;
        let staging = Buffer::new(&self.context, &BufferCreation::staging(format!("bindless {kind} staging"), size))?;
        staging.write(records)?;

        SingleTimeCommands::execute(&self.context, |device, command_buffer| {
            copy_buffer(device, command_buffer, staging.handle(), destination.handle(), size);

            let barrier = vk::BufferMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(destination.handle())
                .offset(0)
                .size(size)
                .build();
            unsafe {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[barrier],
                    &[],
                );
            }
        })?;

        log::debug!("[Bindless] Uploaded {} {} ({} bytes)", records.len(), kind, size);
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_empty_tables_produce_no_writes() {
        let plan = BindlessUploadPlan::new(0, 0, 0, DEFAULT_BINDLESS_CAPACITY);
        assert_eq!(plan.images, UploadDecision::Empty);
        assert_eq!(plan.materials, UploadDecision::Empty);
        assert_eq!(plan.geometry_nodes, UploadDecision::Empty);
        assert_eq!(plan.descriptor_write_count(), 0);
    }

    #[test]
    fn test_image_overflow_skips_only_images() {
        let plan = BindlessUploadPlan::new(1025, 10, 3, 1024);
        assert_eq!(plan.images, UploadDecision::Overflow { count: 1025, capacity: 1024 });
        assert_eq!(plan.materials, UploadDecision::Upload { count: 10 });
        assert_eq!(plan.geometry_nodes, UploadDecision::Upload { count: 3 });
        assert_eq!(plan.descriptor_write_count(), 2);
    }

    #[test]
    fn test_exactly_at_capacity_uploads() {
        assert_eq!(UploadDecision::new(1024, 1024), UploadDecision::Upload { count: 1024 });
    }

    #[test]
    fn test_fallback_fills_remaining_slots() {
        let live = [vk::ImageView::from_raw(1), vk::ImageView::from_raw(2)];
        let fallback = vk::ImageView::from_raw(99);

        let views = image_descriptor_views(&live, fallback, 5);
        assert_eq!(views.len(), 5);
        assert_eq!(views[0], live[0]);
        assert_eq!(views[1], live[1]);
        assert!(views[2..].iter().all(|view| *view == fallback));
    }

    #[test]
    fn test_stage_mask_covers_hit_and_raygen() {
        assert!(BINDLESS_STAGES.contains(vk::ShaderStageFlags::RAYGEN_KHR));
        assert!(BINDLESS_STAGES.contains(vk::ShaderStageFlags::CLOSEST_HIT_KHR));
    }
}
