// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync, plus the frame-slot
// bookkeeping that limits the CPU to N frames ahead of the GPU.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::tracker::{self, HandleKind};
use super::DeviceContext;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<DeviceContext>,
}

impl FrameSync {
    pub fn new(device: Arc<DeviceContext>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let (image_available, render_finished, in_flight_fence) = unsafe {
            (
                device
                    .device
                    .create_semaphore(&semaphore_info, None)
                    .context("Failed to create image-available semaphore")?,
                device
                    .device
                    .create_semaphore(&semaphore_info, None)
                    .context("Failed to create render-finished semaphore")?,
                device
                    .device
                    .create_fence(&fence_info, None)
                    .context("Failed to create in-flight fence")?,
            )
        };
        tracker::created(HandleKind::Semaphore, 2);
        tracker::created(HandleKind::Fence, 1);

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
            device,
        })
    }

    /// Block until the GPU has finished the last submission guarded by this slot.
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
                .context("vkWaitForFences failed")
        }
    }

    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_fences(&[self.in_flight_fence])
                .context("vkResetFences failed")
        }
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
        tracker::destroyed(HandleKind::Semaphore, 2);
        tracker::destroyed(HandleKind::Fence, 1);
    }
}

/// Round-robin frame slot bookkeeping.
///
/// Tracks which frame number each slot last submitted and which slot last
/// rendered into each swapchain image. Knows nothing about Vulkan; the
/// scheduler asks it which fences to wait on.
#[derive(Debug)]
pub struct FrameSlots {
    current: usize,
    frame_number: u64,
    /// Frame number whose submission each slot's fence currently guards
    submitted: Vec<Option<u64>>,
    /// Slot whose submission last used each swapchain image
    image_owner: Vec<Option<usize>>,
}

impl FrameSlots {
    pub fn new(slot_count: usize) -> Self {
        assert!(slot_count > 0, "at least one frame slot is required");
        Self {
            current: 0,
            frame_number: 0,
            submitted: vec![None; slot_count],
            image_owner: Vec::new(),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Frame number of the frame currently being built.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Frame whose GPU work `slot`'s fence currently guards, if any.
    pub fn pending_for(&self, slot: usize) -> Option<u64> {
        self.submitted[slot]
    }

    /// Swapchain images changed; forget which slot rendered into which image.
    pub fn reset_images(&mut self, image_count: usize) {
        self.image_owner = vec![None; image_count];
    }

    /// Claim `image` for the current slot. Returns the other slot whose fence
    /// must be waited on first, if that slot still owns the image.
    pub fn claim_image(&mut self, image: usize) -> Option<usize> {
        if image >= self.image_owner.len() {
            self.image_owner.resize(image + 1, None);
        }
        let previous = self.image_owner[image].replace(self.current);
        previous.filter(|&slot| slot != self.current)
    }

    /// Record that the current slot's fence now guards the current frame.
    pub fn mark_submitted(&mut self) {
        self.submitted[self.current] = Some(self.frame_number);
    }

    /// Move to the next slot. Only called once a frame has been submitted.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.submitted.len();
        self.frame_number += 1;
    }
}
