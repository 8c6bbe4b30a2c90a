//! Device buffers allocated through the memory allocator
//!
//! A [`Buffer`] is created eagerly from a plain [`BufferCreation`] value and
//! released exactly once when dropped. Buffers created mappable stay
//! persistently mapped for their whole lifetime.

use ash::vk;
use std::ptr;
use std::sync::Arc;
use vk_mem::Alloc;

use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Parameters for [`Buffer::new`]
#[derive(Debug, Clone)]
pub struct BufferCreation {
    /// Size in bytes
    pub size: vk::DeviceSize,
    /// Vulkan usage flags
    pub usage: vk::BufferUsageFlags,
    /// Keep the buffer persistently mapped for sequential host writes
    pub mappable: bool,
    /// Memory placement hint for the allocator
    pub memory_usage: vk_mem::MemoryUsage,
    /// Debug name
    pub name: String,
}

impl Default for BufferCreation {
    fn default() -> Self {
        Self {
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            mappable: true,
            memory_usage: vk_mem::MemoryUsage::CpuOnly,
            name: String::new(),
        }
    }
}

impl BufferCreation {
    /// Host-visible staging buffer holding `size` bytes for a transfer
    pub fn staging(name: impl Into<String>, size: vk::DeviceSize) -> Self {
        Self {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            mappable: true,
            memory_usage: vk_mem::MemoryUsage::CpuOnly,
            name: name.into(),
        }
    }
}

/// Buffer with its allocation and optional persistent mapping
pub struct Buffer {
    context: Arc<VulkanContext>,
    buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
    mapped: *mut u8,
    size: vk::DeviceSize,
    name: String,
}

impl Buffer {
    /// Allocate a buffer
    pub fn new(context: &Arc<VulkanContext>, creation: &BufferCreation) -> VulkanResult<Self> {
        if creation.size == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: format!("buffer '{}' requested with zero size", creation.name),
            });
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(creation.size)
            .usage(creation.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let allocation_info = vk_mem::AllocationCreateInfo {
            usage: creation.memory_usage,
            flags: if creation.mappable {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };

        let allocator = context.allocator();
        let (buffer, mut allocation) = unsafe {
            allocator.create_buffer(&buffer_info, &allocation_info)
                .map_err(|e| {
                    log::error!("[BUFFER] Failed to allocate '{}' ({} bytes): {:?}", creation.name, creation.size, e);
                    VulkanError::Api(e)
                })?
        };

        let mapped = if creation.mappable {
            match unsafe { allocator.map_memory(&mut allocation) } {
                Ok(mapped) => mapped,
                Err(e) => {
                    unsafe { allocator.destroy_buffer(buffer, &mut allocation) };
                    return Err(VulkanError::Api(e));
                }
            }
        } else {
            ptr::null_mut()
        };

        context.name_object(buffer, &creation.name);
        log::debug!(
            "[BUFFER] Created '{}' ({} bytes, usage {:?}, mapped: {})",
            creation.name,
            creation.size,
            creation.usage,
            creation.mappable
        );

        Ok(Self {
            context: Arc::clone(context),
            buffer,
            allocation,
            mapped,
            size: creation.size,
            name: creation.name.clone(),
        })
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get buffer size
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host pointer of the persistent mapping; null when not mappable
    pub fn mapped_ptr(&self) -> *mut u8 {
        self.mapped
    }

    /// Whether the buffer is persistently mapped
    pub fn is_mapped(&self) -> bool {
        !self.mapped.is_null()
    }

    /// Device address; the buffer must carry `SHADER_DEVICE_ADDRESS` usage
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.context.buffer_device_address(self.buffer)
    }

    /// Copy `data` to the start of the mapped range
    pub fn write<T: Copy>(&self, data: &[T]) -> VulkanResult<()> {
        self.write_at(0, data)
    }

    /// Copy `data` into the mapped range at a byte offset
    pub fn write_at<T: Copy>(&self, offset: vk::DeviceSize, data: &[T]) -> VulkanResult<()> {
        if self.mapped.is_null() {
            return Err(VulkanError::InvalidOperation {
                reason: format!("buffer '{}' is not host mapped", self.name),
            });
        }

        let byte_len = std::mem::size_of_val(data) as vk::DeviceSize;
        if offset + byte_len > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "write of {} bytes at offset {} overflows buffer '{}' ({} bytes)",
                    byte_len, offset, self.name, self.size
                ),
            });
        }

        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr().cast::<u8>(),
                self.mapped.add(offset as usize),
                byte_len as usize,
            );
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let allocator = self.context.allocator();
        unsafe {
            if !self.mapped.is_null() {
                allocator.unmap_memory(&mut self.allocation);
            }
            allocator.destroy_buffer(self.buffer, &mut self.allocation);
        }
        log::trace!("[BUFFER] Destroyed '{}'", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_creation_is_mappable_host_memory() {
        let creation = BufferCreation::default();
        assert_eq!(creation.size, 0);
        assert!(creation.usage.is_empty());
        assert!(creation.mappable);
        assert!(matches!(creation.memory_usage, vk_mem::MemoryUsage::CpuOnly));
        assert!(creation.name.is_empty());
    }

    #[test]
    fn test_staging_creation() {
        let creation = BufferCreation::staging("upload", 256);
        assert_eq!(creation.size, 256);
        assert_eq!(creation.usage, vk::BufferUsageFlags::TRANSFER_SRC);
        assert!(creation.mappable);
        assert_eq!(creation.name, "upload");
    }
}
