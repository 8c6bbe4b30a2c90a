//! Frames-in-flight pacing
//!
//! Each call to [`FramePipeline::render_frame`] walks one frame slot through
//! the same fixed sequence of [`FrameStage`]s. Slot `i` is reused only after
//! its `in_flight` fence reports that the previous submission on it finished,
//! so at most `frames_in_flight` frames are queued at once.
//!
//! A slot's fence is only waited on while [`InFlightSlots`] records a
//! submission for it. The fence is reset immediately before the submit, so a
//! failure while recording leaves it signaled and nothing ever waits forever
//! on work that was never queued.

use ash::extensions::khr::Swapchain;
use ash::{vk, Device};
use std::sync::Arc;

use crate::render::backends::vulkan::state::sync::FrameSync;
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Default number of frames recorded ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Cycles through frame slots `0..frames_in_flight`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounter {
    current: usize,
    frames_in_flight: usize,
}

impl FrameCounter {
    /// Start at slot 0
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            current: 0,
            frames_in_flight: frames_in_flight.max(1),
        }
    }

    /// Slot the next frame records into
    pub fn current(&self) -> usize {
        self.current
    }

    /// Number of slots
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Move to the next slot, wrapping after the last
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames_in_flight;
    }
}

/// Which frame slots have a submission the GPU may still be executing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightSlots {
    pending: Vec<bool>,
}

impl InFlightSlots {
    /// All slots idle
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: vec![false; frames_in_flight],
        }
    }

    /// Whether `slot` has work queued that was not yet waited on
    pub fn is_pending(&self, slot: usize) -> bool {
        self.pending.get(slot).copied().unwrap_or(false)
    }

    /// Record a successful submit on `slot`
    pub fn mark_submitted(&mut self, slot: usize) {
        if let Some(pending) = self.pending.get_mut(slot) {
            *pending = true;
        }
    }

    /// Record that the fence of `slot` was observed signaled
    pub fn mark_complete(&mut self, slot: usize) {
        if let Some(pending) = self.pending.get_mut(slot) {
            *pending = false;
        }
    }

    /// Slots with queued work, in ascending order
    pub fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.pending
            .iter()
            .enumerate()
            .filter_map(|(slot, &pending)| pending.then_some(slot))
    }
}

/// Stages of a single frame, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    /// Block on the slot's fence
    WaitPrevious,
    /// Acquire the next swapchain image
    Acquire,
    /// Reset the slot's command buffer
    Reset,
    /// Record the frame's commands
    Record,
    /// Reset the slot's fence and submit to the graphics queue
    Submit,
    /// Queue the image for presentation
    Present,
    /// Move to the next slot
    Advance,
}

impl FrameStage {
    /// Stage that follows this one; `Advance` wraps to `WaitPrevious`
    pub fn next(self) -> Self {
        match self {
            Self::WaitPrevious => Self::Acquire,
            Self::Acquire => Self::Reset,
            Self::Reset => Self::Record,
            Self::Record => Self::Submit,
            Self::Submit => Self::Present,
            Self::Present => Self::Advance,
            Self::Advance => Self::WaitPrevious,
        }
    }
}

/// Swapchain owned by the host, borrowed for one frame
pub struct SwapchainTarget<'a> {
    /// Swapchain extension loader
    pub loader: &'a Swapchain,
    /// Swapchain handle
    pub swapchain: vk::SwapchainKHR,
    /// Images of `swapchain`, indexed by acquire result
    pub images: &'a [vk::Image],
    /// Image format
    pub format: vk::Format,
    /// Image extent
    pub extent: vk::Extent2D,
}

/// Per-slot command buffers and sync objects
pub struct FramePipeline {
    context: Arc<VulkanContext>,
    command_buffers: Vec<vk::CommandBuffer>,
    frames: Vec<FrameSync>,
    in_flight: InFlightSlots,
    counter: FrameCounter,
    stage: FrameStage,
}

impl FramePipeline {
    /// Allocate one command buffer and one [`FrameSync`] per slot
    pub fn new(context: &Arc<VulkanContext>, frames_in_flight: usize) -> VulkanResult<Self> {
        if frames_in_flight == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: "frames in flight must be at least 1".to_string(),
            });
        }

        let device = context.device();
        let frames = (0..frames_in_flight)
            .map(|_| FrameSync::new(device))
            .collect::<VulkanResult<Vec<_>>>()?;

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(context.command_pool())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);
        let command_buffers = unsafe {
            device.allocate_command_buffers(&allocate_info)
                .map_err(VulkanError::Api)?
        };

        log::info!("[FRAME] Frame pipeline created with {} frames in flight", frames_in_flight);

        Ok(Self {
            context: Arc::clone(context),
            command_buffers,
            frames,
            in_flight: InFlightSlots::new(frames_in_flight),
            counter: FrameCounter::new(frames_in_flight),
            stage: FrameStage::WaitPrevious,
        })
    }

    /// Slot the next frame uses
    pub fn current_frame(&self) -> usize {
        self.counter.current()
    }

    /// Last stage entered
    pub fn stage(&self) -> FrameStage {
        self.stage
    }

    /// Block until every submitted frame has finished on the GPU
    ///
    /// Call before touching resources that queued frames may still read.
    pub fn wait_all(&mut self) -> VulkanResult<()> {
        let pending: Vec<usize> = self.in_flight.pending().collect();
        for slot in pending {
            self.wait_slot(slot)?;
        }
        Ok(())
    }

    fn wait_slot(&mut self, slot: usize) -> VulkanResult<()> {
        if self.in_flight.is_pending(slot) {
            self.frames[slot].in_flight.wait(u64::MAX)?;
            self.in_flight.mark_complete(slot);
        }
        Ok(())
    }

    fn enter(&mut self, stage: FrameStage) {
        log::trace!("[FRAME] slot {} -> {:?}", self.counter.current(), stage);
        self.stage = stage;
    }

    /// Render one frame and return the presented swapchain image index
    ///
    /// `record` receives the device, the slot's command buffer (already in the
    /// recording state) and the acquired image index. An error from `record`
    /// abandons the frame before anything is submitted. A suboptimal acquire still
    /// renders and presents; out-of-date or suboptimal results are reported as
    /// [`VulkanError::SwapchainOutOfDate`] so the host can recreate the swapchain.
    pub fn render_frame<F>(&mut self, target: &SwapchainTarget, record: F) -> VulkanResult<u32>
    where
        F: FnOnce(&Device, vk::CommandBuffer, u32) -> VulkanResult<()>,
    {
        let slot = self.counter.current();
        let command_buffer = self.command_buffers[slot];

        self.enter(FrameStage::WaitPrevious);
        self.wait_slot(slot)?;

        self.enter(FrameStage::Acquire);
        let acquired = unsafe {
            target.loader.acquire_next_image(
                target.swapchain,
                u64::MAX,
                self.frames[slot].image_available.handle(),
                vk::Fence::null(),
            )
        };
        let (image_index, acquire_suboptimal) = match acquired {
            Ok(result) => result,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("[FRAME] Swapchain out of date at acquire");
                return Err(VulkanError::SwapchainOutOfDate);
            }
            Err(e) => return Err(VulkanError::Api(e)),
        };

        self.enter(FrameStage::Reset);
        let device = self.context.device();
        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
        }

        self.enter(FrameStage::Record);
        let device = self.context.device();
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device.begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }
        record(device, command_buffer, image_index)?;
        unsafe {
            device.end_command_buffer(command_buffer)
                .map_err(VulkanError::Api)?;
        }

        self.enter(FrameStage::Submit);
        let device = self.context.device();
        let wait_semaphores = [self.frames[slot].image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let signal_semaphores = [self.frames[slot].render_finished.handle()];
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        self.frames[slot].in_flight.reset()?;
        unsafe {
            device.queue_submit(
                self.context.graphics_queue(),
                &[submit_info.build()],
                self.frames[slot].in_flight.handle(),
            )
            .map_err(VulkanError::Api)?;
        }
        self.in_flight.mark_submitted(slot);

        self.enter(FrameStage::Present);
        let swapchains = [target.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let presented = unsafe { target.loader.queue_present(self.context.graphics_queue(), &present_info) };

        self.enter(FrameStage::Advance);
        self.counter.advance();

        match presented {
            Ok(false) if !acquire_suboptimal => Ok(image_index),
            Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("[FRAME] Swapchain suboptimal or out of date at present");
                Err(VulkanError::SwapchainOutOfDate)
            }
            Err(e) => Err(VulkanError::Api(e)),
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        if let Err(e) = self.wait_all() {
            log::error!("[FRAME] Failed waiting on in-flight frames: {}", e);
        }
        unsafe {
            self.context
                .device()
                .free_command_buffers(self.context.command_pool(), &self.command_buffers);
        }
        log::debug!("[FRAME] Frame pipeline destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_counter_cycles() {
        let mut counter = FrameCounter::new(MAX_FRAMES_IN_FLIGHT);
        let mut slots = Vec::new();
        for _ in 0..6 {
            slots.push(counter.current());
            counter.advance();
        }
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_single_slot_counter_stays_at_zero() {
        let mut counter = FrameCounter::new(1);
        counter.advance();
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_zero_slots_clamped() {
        assert_eq!(FrameCounter::new(0).frames_in_flight(), 1);
    }

    #[test]
    fn test_new_slots_are_idle() {
        let slots = InFlightSlots::new(MAX_FRAMES_IN_FLIGHT);
        assert_eq!(slots.pending().count(), 0);
        assert!(!slots.is_pending(0));
    }

    #[test]
    fn test_only_submitted_slots_are_waited_on() {
        let mut slots = InFlightSlots::new(3);
        slots.mark_submitted(0);
        slots.mark_submitted(2);
        assert_eq!(slots.pending().collect::<Vec<_>>(), vec![0, 2]);

        slots.mark_complete(0);
        assert!(!slots.is_pending(0));
        assert!(slots.is_pending(2));
    }

    #[test]
    fn test_abandoned_frame_leaves_slot_idle() {
        // Slot 1 completed, then its next frame failed before submit.
        let mut slots = InFlightSlots::new(2);
        slots.mark_submitted(1);
        slots.mark_complete(1);
        assert!(!slots.is_pending(1));
        assert_eq!(slots.pending().count(), 0);
    }

    #[test]
    fn test_out_of_range_slot_is_ignored() {
        let mut slots = InFlightSlots::new(1);
        slots.mark_submitted(5);
        assert!(!slots.is_pending(5));
        assert_eq!(slots.pending().count(), 0);
    }

    #[test]
    fn test_stage_order_wraps() {
        let mut stage = FrameStage::WaitPrevious;
        let mut order = vec![stage];
        for _ in 0..6 {
            stage = stage.next();
            order.push(stage);
        }
        assert_eq!(
            order,
            vec![
                FrameStage::WaitPrevious,
                FrameStage::Acquire,
                FrameStage::Reset,
                FrameStage::Record,
                FrameStage::Submit,
                FrameStage::Present,
                FrameStage::Advance,
            ]
        );
        assert_eq!(stage.next(), FrameStage::WaitPrevious);
    }
}
