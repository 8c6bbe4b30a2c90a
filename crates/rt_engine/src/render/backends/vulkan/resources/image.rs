//! Device-local 2D images and samplers
//!
//! Images are single-mip, optimal-tiling and exclusively owned. When pixel
//! data is supplied at creation it is uploaded immediately through a staging
//! buffer, leaving the image in `SHADER_READ_ONLY_OPTIMAL`.

use ash::vk;
use std::sync::Arc;
use vk_mem::Alloc;

use crate::render::backends::vulkan::rendering::commands::{copy_buffer_to_image, SingleTimeCommands};
use crate::render::backends::vulkan::rendering::transitions::transition_image_layout;
use crate::render::backends::vulkan::resources::buffer::{Buffer, BufferCreation};
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Parameters for [`Image::new`]
#[derive(Debug, Clone)]
pub struct ImageCreation {
    /// Initial pixel data, tightly packed; empty for no upload
    pub data: Vec<u8>,
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Texel format
    pub format: vk::Format,
    /// Vulkan usage flags; `TRANSFER_DST` is added when data is supplied
    pub usage: vk::ImageUsageFlags,
    /// Debug name
    pub name: String,
}

impl Default for ImageCreation {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            width: 0,
            height: 0,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::SAMPLED,
            name: String::new(),
        }
    }
}

/// Bytes per texel for the formats this crate uploads
pub fn texel_size(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8_UNORM => Some(1),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// Number of bytes `creation.data` must hold for the requested extent
pub fn expected_upload_size(creation: &ImageCreation) -> VulkanResult<u64> {
    let texel = texel_size(creation.format).ok_or_else(|| VulkanError::InvalidOperation {
        reason: format!("cannot upload pixel data for format {:?}", creation.format),
    })?;
    Ok(u64::from(creation.width) * u64::from(creation.height) * texel)
}

/// 2D image with view and allocation
pub struct Image {
    context: Arc<VulkanContext>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: vk_mem::Allocation,
    format: vk::Format,
    extent: vk::Extent2D,
    name: String,
}

impl Image {
    /// Create the image, its view, and upload `creation.data` if present
    pub fn new(context: &Arc<VulkanContext>, creation: &ImageCreation) -> VulkanResult<Self> {
        if creation.width == 0 || creation.height == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: format!("image '{}' requested with zero extent", creation.name),
            });
        }

        let has_data = !creation.data.is_empty();
        if has_data {
            let expected = expected_upload_size(creation)?;
            if (creation.data.len() as u64) < expected {
                return Err(VulkanError::InvalidOperation {
                    reason: format!(
                        "image '{}' needs {} bytes of pixel data, got {}",
                        creation.name,
                        expected,
                        creation.data.len()
                    ),
                });
            }
        }

        let mut usage = creation.usage;
        if has_data {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }

        let extent = vk::Extent2D {
            width: creation.width,
            height: creation.height,
        };
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(creation.format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let allocation_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::GpuOnly,
            ..Default::default()
        };

        let allocator = context.allocator();
        let (image, mut allocation) = unsafe {
            allocator.create_image(&image_info, &allocation_info)
                .map_err(|e| {
                    log::error!("[IMAGE] Failed to allocate '{}': {:?}", creation.name, e);
                    VulkanError::Api(e)
                })?
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(creation.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = match unsafe { context.device().create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { allocator.destroy_image(image, &mut allocation) };
                return Err(VulkanError::Api(e));
            }
        };

        context.name_object(image, &creation.name);

        let result = Self {
            context: Arc::clone(context),
            image,
            view,
            allocation,
            format: creation.format,
            extent,
            name: creation.name.clone(),
        };

        if has_data {
            result.upload(&creation.data)?;
        }

        log::debug!(
            "[IMAGE] Created '{}' {}x{} {:?} (uploaded: {})",
            result.name,
            extent.width,
            extent.height,
            creation.format,
            has_data
        );
        Ok(result)
    }

    fn upload(&self, data: &[u8]) -> VulkanResult<()> {
        let staging = Buffer::new(
            &self.context,
            &BufferCreation::staging(format!("{} staging", self.name), data.len() as vk::DeviceSize),
        )?;
        staging.write(data)?;

        let image = self.image;
        let extent = self.extent;
        SingleTimeCommands::execute(&self.context, |device, command_buffer| {
            transition_image_layout(
                device,
                command_buffer,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            copy_buffer_to_image(device, command_buffer, staging.handle(), image, extent);
            transition_image_layout(
                device,
                command_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })
    }

    /// Get image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Get image view handle
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Texel format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Image extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.context.device().destroy_image_view(self.view, None);
            self.context.allocator().destroy_image(self.image, &mut self.allocation);
        }
        log::trace!("[IMAGE] Destroyed '{}'", self.name);
    }
}

/// Linear, repeating texture sampler
pub struct Sampler {
    context: Arc<VulkanContext>,
    sampler: vk::Sampler,
}

impl Sampler {
    /// Create a linear sampler with repeat addressing
    pub fn new(context: &Arc<VulkanContext>) -> VulkanResult<Self> {
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);

        let sampler = unsafe {
            context.device().create_sampler(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            context: Arc::clone(context),
            sampler,
        })
    }

    /// Get sampler handle
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.context.device().destroy_sampler(self.sampler, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba8_upload_size() {
        let creation = ImageCreation {
            width: 4,
            height: 2,
            ..Default::default()
        };
        assert_eq!(expected_upload_size(&creation).unwrap(), 32);
    }

    #[test]
    fn test_float_upload_size() {
        let creation = ImageCreation {
            width: 3,
            height: 3,
            format: vk::Format::R32G32B32A32_SFLOAT,
            ..Default::default()
        };
        assert_eq!(expected_upload_size(&creation).unwrap(), 144);
    }

    #[test]
    fn test_unknown_format_cannot_be_uploaded() {
        let creation = ImageCreation {
            width: 1,
            height: 1,
            format: vk::Format::BC7_UNORM_BLOCK,
            ..Default::default()
        };
        assert!(expected_upload_size(&creation).is_err());
    }
}
