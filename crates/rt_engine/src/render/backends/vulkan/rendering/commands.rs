//! Scoped single-time command execution
//!
//! Setup work (uploads, acceleration structure builds) records into a
//! throwaway command buffer, submits it on the graphics queue and blocks on a
//! dedicated fence until the GPU is done. Everything the recorded commands
//! read is therefore safe to release once [`SingleTimeCommands::submit`]
//! returns.

use ash::{vk, Device};

use crate::render::backends::vulkan::state::sync::Fence;
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Lifecycle of a single-time command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    /// Allocated, nothing recorded yet
    Initial,
    /// Recording has begun
    Recording,
    /// Submitted and completed
    Submitted,
}

impl SubmissionState {
    /// Transition for a `record` call
    pub fn begin_recording(self) -> VulkanResult<Self> {
        match self {
            Self::Initial => Ok(Self::Recording),
            Self::Recording => Err(VulkanError::InvalidOperation {
                reason: "single-time commands are already recording".to_string(),
            }),
            Self::Submitted => Err(VulkanError::CommandsAlreadySubmitted),
        }
    }

    /// Transition for a `submit` call
    pub fn submit(self) -> VulkanResult<Self> {
        match self {
            Self::Recording => Ok(Self::Submitted),
            Self::Initial => Err(VulkanError::InvalidOperation {
                reason: "nothing was recorded before submit".to_string(),
            }),
            Self::Submitted => Err(VulkanError::CommandsAlreadySubmitted),
        }
    }
}

/// One-shot command buffer with its own completion fence
pub struct SingleTimeCommands<'a> {
    context: &'a VulkanContext,
    command_buffer: vk::CommandBuffer,
    fence: Fence,
    state: SubmissionState,
}

impl<'a> SingleTimeCommands<'a> {
    /// Allocate a primary command buffer and an unsignaled fence
    pub fn new(context: &'a VulkanContext) -> VulkanResult<Self> {
        let device = context.device();
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(context.command_pool())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe {
            device.allocate_command_buffers(&allocate_info)
                .map_err(VulkanError::Api)?[0]
        };

        let fence = match Fence::new(device.clone(), false) {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.free_command_buffers(context.command_pool(), &[command_buffer]) };
                return Err(e);
            }
        };

        Ok(Self {
            context,
            command_buffer,
            fence,
            state: SubmissionState::Initial,
        })
    }

    /// Allocate, record, submit and wait in one call
    pub fn execute<F>(context: &'a VulkanContext, record: F) -> VulkanResult<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer),
    {
        let mut commands = Self::new(context)?;
        commands.record(record)?;
        commands.submit()
    }

    /// Begin recording and hand the command buffer to `record`
    pub fn record<F>(&mut self, record: F) -> VulkanResult<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer),
    {
        let next = self.state.begin_recording()?;
        let device = self.context.device();
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device.begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }
        self.state = next;

        record(device, self.command_buffer);
        Ok(())
    }

    /// End recording, submit to the graphics queue and block until complete
    pub fn submit(&mut self) -> VulkanResult<()> {
        let next = self.state.submit()?;
        let device = self.context.device();

        unsafe {
            device.end_command_buffer(self.command_buffer)
                .map_err(VulkanError::Api)?;
        }

        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            device.queue_submit(self.context.graphics_queue(), &[submit_info.build()], self.fence.handle())
                .map_err(VulkanError::Api)?;
        }
        self.state = next;

        self.fence.wait(u64::MAX)
    }

    /// Current lifecycle state
    pub fn state(&self) -> SubmissionState {
        self.state
    }
}

impl Drop for SingleTimeCommands<'_> {
    fn drop(&mut self) {
        if self.state == SubmissionState::Recording {
            log::warn!("[COMMANDS] Single-time command buffer dropped without being submitted");
        }
        unsafe {
            self.context
                .device()
                .free_command_buffers(self.context.command_pool(), &[self.command_buffer]);
        }
    }
}

/// Record a whole-buffer copy
pub fn copy_buffer(device: &Device, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
    let region = vk::BufferCopy::builder().size(size).build();
    unsafe {
        device.cmd_copy_buffer(command_buffer, src, dst, &[region]);
    }
}

/// Record a tightly packed buffer-to-image copy into mip 0 of a color image
pub fn copy_buffer_to_image(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    src: vk::Buffer,
    dst: vk::Image,
    extent: vk::Extent2D,
) {
    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(color_subresource_layers())
        .image_offset(vk::Offset3D::default())
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .build();

    unsafe {
        device.cmd_copy_buffer_to_image(command_buffer, src, dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
    }
}

/// Record a full-extent image copy between two color images
pub fn copy_image_to_image(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    extent: vk::Extent2D,
) {
    let region = vk::ImageCopy::builder()
        .src_subresource(color_subresource_layers())
        .src_offset(vk::Offset3D::default())
        .dst_subresource(color_subresource_layers())
        .dst_offset(vk::Offset3D::default())
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .build();

    unsafe {
        device.cmd_copy_image(
            command_buffer,
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }
}

/// Blit the full extent of `src` onto `dst` with nearest filtering
///
/// Unlike a copy, a blit converts between formats, so channel order and sRGB
/// encoding of `dst` are honored. `src` must be in `TRANSFER_SRC_OPTIMAL` and
/// `dst` in `TRANSFER_DST_OPTIMAL`.
pub fn blit_image_to_image(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    extent: vk::Extent2D,
) {
    let corners = full_extent_offsets(extent);
    let region = vk::ImageBlit::builder()
        .src_subresource(color_subresource_layers())
        .src_offsets(corners)
        .dst_subresource(color_subresource_layers())
        .dst_offsets(corners)
        .build();

    unsafe {
        device.cmd_blit_image(
            command_buffer,
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
            vk::Filter::NEAREST,
        );
    }
}

fn full_extent_offsets(extent: vk::Extent2D) -> [vk::Offset3D; 2] {
    [
        vk::Offset3D::default(),
        vk::Offset3D {
            x: i32::try_from(extent.width).unwrap_or(i32::MAX),
            y: i32::try_from(extent.height).unwrap_or(i32::MAX),
            z: 1,
        },
    ]
}

fn color_subresource_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_then_submit() {
        let state = SubmissionState::Initial.begin_recording().unwrap();
        assert_eq!(state, SubmissionState::Recording);
        assert_eq!(state.submit().unwrap(), SubmissionState::Submitted);
    }

    #[test]
    fn test_second_submit_is_rejected() {
        let submitted = SubmissionState::Recording.submit().unwrap();
        assert!(matches!(submitted.submit(), Err(VulkanError::CommandsAlreadySubmitted)));
        assert!(matches!(submitted.begin_recording(), Err(VulkanError::CommandsAlreadySubmitted)));
    }

    #[test]
    fn test_submit_without_recording_is_rejected() {
        assert!(matches!(
            SubmissionState::Initial.submit(),
            Err(VulkanError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_blit_covers_whole_extent() {
        let [start, end] = full_extent_offsets(vk::Extent2D { width: 1280, height: 720 });
        assert_eq!((start.x, start.y, start.z), (0, 0, 0));
        assert_eq!((end.x, end.y, end.z), (1280, 720, 1));
    }

    #[test]
    fn test_recording_twice_is_rejected() {
        assert!(SubmissionState::Recording.begin_recording().is_err());
    }
}
