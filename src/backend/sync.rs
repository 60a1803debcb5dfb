// Frame slots - synchronization and per-frame resources
//
// One slot per frame in flight. The fence guards everything else in the
// slot: nothing here is touched by the CPU until the fence has signalled.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::VulkanDevice;
use crate::uniforms::UniformBufferObject;

pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    /// Owned by the frame command pool, freed with it
    pub command_buffer: vk::CommandBuffer,
    /// Persistently mapped, written once per frame before submission
    pub uniform_buffer: GpuBuffer,
    device: Arc<VulkanDevice>,
}

impl FrameSlot {
    pub fn new(
        device: Arc<VulkanDevice>,
        command_buffer: vk::CommandBuffer,
        index: usize,
    ) -> Result<Self> {
        let uniform_buffer = GpuBuffer::new(
            device.clone(),
            &format!("frame {} uniforms", index),
            std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            &[],
        )?;

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device
                .device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create semaphore")?;
            let render_finished = match device.device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.device.destroy_semaphore(image_available, None);
                    return Err(e).context("Failed to create semaphore");
                }
            };
            let in_flight_fence = match device.device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.device.destroy_semaphore(image_available, None);
                    device.device.destroy_semaphore(render_finished, None);
                    return Err(e).context("Failed to create fence");
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
                command_buffer,
                uniform_buffer,
                device,
            })
        }
    }

    /// Block until the GPU has finished this slot's previous submission.
    /// A timeout means the device stopped making progress.
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        match unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, timeout_ns)
        } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => anyhow::bail!(
                "Device lost: frame fence not signalled within {} ms",
                timeout_ns / 1_000_000
            ),
            Err(e) => Err(e).context("Failed to wait for frame fence"),
        }
    }

    /// Unsignal the fence and clear the command buffer for re-recording.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_fences(&[self.in_flight_fence])
                .context("Failed to reset frame fence")?;
            self.device
                .device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
        }
        Ok(())
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
