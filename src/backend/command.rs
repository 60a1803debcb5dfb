// Command pools and one-shot command submission

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// A command pool bound to one queue family. Destroying it frees every
/// command buffer allocated from it.
pub struct CommandPool {
    pub pool: vk::CommandPool,
    pub queue_family: u32,
    pub queue: vk::Queue,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(
        device: Arc<VulkanDevice>,
        queue_family: u32,
        queue: vk::Queue,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            queue_family,
            queue,
            device,
        })
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    /// Start recording a command buffer that is submitted exactly once.
    pub fn one_shot(&self) -> Result<OneShotCommand<'_>> {
        OneShotCommand::begin(self)
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}

/// Scoped one-time command buffer.
///
/// Recording begins on construction. `submit` ends it, submits it to the
/// pool's queue and blocks until the queue is idle. If the guard is dropped
/// without `submit` (an early return through `?`), the drop submits it so
/// the work still runs exactly once.
pub struct OneShotCommand<'a> {
    pool: &'a CommandPool,
    cmd: vk::CommandBuffer,
    submitted: bool,
}

impl<'a> OneShotCommand<'a> {
    fn begin(pool: &'a CommandPool) -> Result<Self> {
        let cmd = pool
            .allocate(1)?
            .into_iter()
            .next()
            .context("Driver returned no command buffer")?;

        let device = &pool.device.device;
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        begin_or_release(
            || unsafe { device.begin_command_buffer(cmd, &begin_info) },
            || unsafe { device.free_command_buffers(pool.pool, &[cmd]) },
        )?;

        // Only a buffer in the recording state gets a guard
        Ok(Self {
            pool,
            cmd,
            submitted: false,
        })
    }

    pub fn buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn device(&self) -> &ash::Device {
        &self.pool.device.device
    }

    pub fn submit(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.submitted {
            return Ok(());
        }
        self.submitted = true;

        let device = &self.pool.device.device;
        let command_buffers = [self.cmd];
        let result = unsafe {
            device
                .end_command_buffer(self.cmd)
                .context("Failed to end one-shot command buffer")
                .and_then(|()| {
                    let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                    device
                        .queue_submit(self.pool.queue, &[submit_info.build()], vk::Fence::null())
                        .context("Failed to submit one-shot command buffer")
                })
                .and_then(|()| {
                    device
                        .queue_wait_idle(self.pool.queue)
                        .context("Failed waiting for one-shot command buffer")
                })
        };

        unsafe { device.free_command_buffers(self.pool.pool, &command_buffers) };
        result
    }
}

impl Drop for OneShotCommand<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::error!("One-shot command failed during unwind: {:#}", e);
        }
    }
}

/// Start recording, releasing the buffer instead when begin fails. A buffer
/// that never began recording must not be ended or submitted.
fn begin_or_release(
    begin: impl FnOnce() -> ash::prelude::VkResult<()>,
    release: impl FnOnce(),
) -> Result<()> {
    if let Err(e) = begin() {
        release();
        return Err(e).context("Failed to begin one-shot command buffer");
    }
    Ok(())
}
