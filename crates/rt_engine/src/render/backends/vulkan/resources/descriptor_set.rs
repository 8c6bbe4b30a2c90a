//! Descriptor set layouts, pools and batched writes
//!
//! The builder supports descriptor arrays and per-binding flags so the same
//! code serves the small scene set (storage image, acceleration structure,
//! camera) and the large update-after-bind bindless set.

use ash::{vk, Device};
use crate::render::backends::vulkan::{VulkanResult, VulkanError};

/// Builder for descriptor set layouts
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
    binding_flags: Vec<vk::DescriptorBindingFlags>,
    flags: vk::DescriptorSetLayoutCreateFlags,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new descriptor set layout builder
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            binding_flags: Vec::new(),
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
        }
    }

    /// Add a binding of `count` descriptors
    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
        binding_flags: vk::DescriptorBindingFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags)
                .build()
        );
        self.binding_flags.push(binding_flags);
        self
    }

    /// Add a uniform buffer binding
    pub fn add_uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags, vk::DescriptorBindingFlags::empty())
    }

    /// Add a storage image binding
    pub fn add_storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags, vk::DescriptorBindingFlags::empty())
    }

    /// Add a top-level acceleration structure binding
    pub fn add_acceleration_structure(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(
            binding,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            1,
            stage_flags,
            vk::DescriptorBindingFlags::empty(),
        )
    }

    /// Create the layout from an update-after-bind pool
    pub fn update_after_bind_pool(mut self) -> Self {
        self.flags |= vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL;
        self
    }

    /// Build the descriptor set layout
    pub fn build(self, device: &Device) -> VulkanResult<DescriptorSetLayout> {
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&self.binding_flags);

        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(self.flags)
            .bindings(&self.bindings);
        if self.binding_flags.iter().any(|flags| !flags.is_empty()) {
            layout_info = layout_info.push_next(&mut flags_info);
        }

        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(VulkanError::Api)?;

        Ok(DescriptorSetLayout {
            layout,
            device: device.clone(),
            bindings: self.bindings,
        })
    }
}

impl Default for DescriptorSetLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor set layout wrapper with automatic cleanup
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    device: Device,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout {
    /// Get the Vulkan descriptor set layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Get the bindings used in this layout
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Descriptor pool for allocating descriptor sets
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    device: Device,
}

impl DescriptorPool {
    /// Create a descriptor pool with explicit sizes
    pub fn new(
        device: Device,
        pool_sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
        flags: vk::DescriptorPoolCreateFlags,
    ) -> VulkanResult<Self> {
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(flags)
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(VulkanError::Api)?;

        Ok(Self { pool, device })
    }

    /// Allocate one descriptor set
    pub fn allocate(&self, layout: &DescriptorSetLayout) -> VulkanResult<vk::DescriptorSet> {
        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(VulkanError::Api)?;
        sets.into_iter().next().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "descriptor pool returned no sets".to_string(),
        })
    }

    /// Get the pool handle
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

enum PendingWrite {
    Buffer {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        info: vk::DescriptorBufferInfo,
    },
    Images {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        infos: Vec<vk::DescriptorImageInfo>,
    },
    AccelerationStructure {
        binding: u32,
        structure: vk::AccelerationStructureKHR,
    },
}

/// Batched writes into one descriptor set
///
/// Descriptor infos are owned by the writer and only turned into
/// `VkWriteDescriptorSet` structs inside [`DescriptorSetWriter::update`], so the
/// pointers they carry stay valid for the duration of the call.
pub struct DescriptorSetWriter {
    set: vk::DescriptorSet,
    pending: Vec<PendingWrite>,
}

impl DescriptorSetWriter {
    /// Start a batch of writes into `set`
    pub fn new(set: vk::DescriptorSet) -> Self {
        Self { set, pending: Vec::new() }
    }

    /// Write a whole-range buffer descriptor
    pub fn buffer(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) -> Self {
        self.pending.push(PendingWrite::Buffer {
            binding,
            descriptor_type,
            info: vk::DescriptorBufferInfo { buffer, offset: 0, range },
        });
        self
    }

    /// Write an array of image descriptors starting at element 0
    pub fn images(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        infos: Vec<vk::DescriptorImageInfo>,
    ) -> Self {
        if !infos.is_empty() {
            self.pending.push(PendingWrite::Images { binding, descriptor_type, infos });
        }
        self
    }

    /// Write a top-level acceleration structure descriptor
    pub fn acceleration_structure(mut self, binding: u32, structure: vk::AccelerationStructureKHR) -> Self {
        self.pending.push(PendingWrite::AccelerationStructure { binding, structure });
        self
    }

    /// Number of queued writes
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no writes are queued
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply all queued writes
    pub fn update(self, device: &Device) {
        if self.pending.is_empty() {
            return;
        }

        let structure_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = self
            .pending
            .iter()
            .filter_map(|write| match write {
                PendingWrite::AccelerationStructure { structure, .. } => Some(
                    vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                        .acceleration_structures(std::slice::from_ref(structure))
                        .build(),
                ),
                _ => None,
            })
            .collect();

        let mut structure_index = 0;
        let writes: Vec<vk::WriteDescriptorSet> = self
            .pending
            .iter()
            .map(|write| match write {
                PendingWrite::Buffer { binding, descriptor_type, info } => vk::WriteDescriptorSet::builder()
                    .dst_set(self.set)
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(*descriptor_type)
                    .buffer_info(std::slice::from_ref(info))
                    .build(),
                PendingWrite::Images { binding, descriptor_type, infos } => vk::WriteDescriptorSet::builder()
                    .dst_set(self.set)
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(*descriptor_type)
                    .image_info(infos)
                    .build(),
                PendingWrite::AccelerationStructure { binding, .. } => {
                    let mut write = vk::WriteDescriptorSet::builder()
                        .dst_set(self.set)
                        .dst_binding(*binding)
                        .dst_array_element(0)
                        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                        .build();
                    write.descriptor_count = 1;
                    write.p_next = std::ptr::addr_of!(structure_infos[structure_index]).cast();
                    structure_index += 1;
                    write
                }
            })
            .collect();

        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }
    }
}
