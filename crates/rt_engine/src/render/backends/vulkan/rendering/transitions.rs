//! Image layout transitions

use ash::{vk, Device};

/// Access masks and pipeline stages for one layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    /// Accesses that must complete before the transition
    pub src_access: vk::AccessFlags,
    /// Accesses that wait for the transition
    pub dst_access: vk::AccessFlags,
    /// Stage producing the source accesses
    pub src_stage: vk::PipelineStageFlags,
    /// Stage consuming the destination accesses
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier masks for the layout pairs this crate uses
///
/// Unknown pairs fall back to a full memory barrier.
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> TransitionMasks {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            A::TRANSFER_WRITE,
            A::SHADER_READ,
            S::TRANSFER,
            S::RAY_TRACING_SHADER_KHR | S::FRAGMENT_SHADER,
        ),
        (L::UNDEFINED, L::GENERAL) => (A::empty(), A::SHADER_WRITE, S::TOP_OF_PIPE, S::RAY_TRACING_SHADER_KHR),
        (L::GENERAL, L::TRANSFER_SRC_OPTIMAL) => (A::SHADER_WRITE, A::TRANSFER_READ, S::RAY_TRACING_SHADER_KHR, S::TRANSFER),
        (L::PRESENT_SRC_KHR, L::TRANSFER_DST_OPTIMAL) => (A::empty(), A::TRANSFER_WRITE, S::TRANSFER, S::TRANSFER),
        (L::TRANSFER_DST_OPTIMAL, L::PRESENT_SRC_KHR) => (A::TRANSFER_WRITE, A::empty(), S::TRANSFER, S::BOTTOM_OF_PIPE),
        _ => {
            log::debug!("[TRANSITION] No tailored masks for {:?} -> {:?}, using a full barrier", old, new);
            (
                A::MEMORY_WRITE,
                A::MEMORY_READ | A::MEMORY_WRITE,
                S::ALL_COMMANDS,
                S::ALL_COMMANDS,
            )
        }
    };

    TransitionMasks { src_access, dst_access, src_stage, dst_stage }
}

/// Record a layout transition of mip 0 / layer 0 of a color image
pub fn transition_image_layout(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let masks = transition_masks(old_layout, new_layout);
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access);

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier.build()],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_transitions() {
        let to_dst = transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(to_dst.src_access, vk::AccessFlags::empty());
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_read = transition_masks(vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
        assert!(to_read.dst_stage.contains(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR));
    }

    #[test]
    fn test_render_target_waits_on_ray_tracing_writes() {
        let masks = transition_masks(vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR);
        assert_eq!(masks.src_access, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(masks.dst_access, vk::AccessFlags::TRANSFER_READ);
    }

    #[test]
    fn test_unknown_pair_uses_full_barrier() {
        let masks = transition_masks(vk::ImageLayout::GENERAL, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::ALL_COMMANDS);
    }
}
