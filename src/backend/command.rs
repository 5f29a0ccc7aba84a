// Command pools and one-shot submission

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::tracker::{self, HandleKind};
use super::DeviceContext;

/// Command pool bound to the graphics queue family.
///
/// Buffers handed out by `allocate` are freed when the pool is dropped.
pub struct CommandPool {
    pub pool: vk::CommandPool,
    allocated: usize,
    device: Arc<DeviceContext>,
}

impl CommandPool {
    pub fn new(device: Arc<DeviceContext>, flags: vk::CommandPoolCreateFlags) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            .flags(flags);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;
        tracker::created(HandleKind::CommandPool, 1);

        Ok(Self {
            pool,
            allocated: 0,
            device,
        })
    }

    /// Allocate `count` primary command buffers.
    pub fn allocate(&mut self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;
        self.allocated += buffers.len();
        tracker::created(HandleKind::CommandBuffer, buffers.len());

        Ok(buffers)
    }

    /// Record with `record`, submit to the graphics queue and block until the
    /// queue is idle. The command buffer is freed before returning.
    pub fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.device.device;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate one-shot command buffer")?[0];

        let result = (|| -> Result<()> {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(cmd, &begin_info) }
                .context("Failed to begin one-shot command buffer")?;

            record(device, cmd);

            unsafe { device.end_command_buffer(cmd) }
                .context("Failed to end one-shot command buffer")?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            unsafe {
                device
                    .queue_submit(self.device.graphics_queue, &[submit_info.build()], vk::Fence::null())
                    .context("Failed to submit one-shot command buffer")?;
                device
                    .queue_wait_idle(self.device.graphics_queue)
                    .context("vkQueueWaitIdle failed after upload")?;
            }
            Ok(())
        })();

        unsafe { device.free_command_buffers(self.pool, &[cmd]) };
        result
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
        tracker::destroyed(HandleKind::CommandBuffer, self.allocated);
        tracker::destroyed(HandleKind::CommandPool, 1);
    }
}
