// Resource upload - host data to device-local memory
//
// Every upload goes through a host-visible staging buffer and a one-shot
// copy command. Buffer copies run on the transfer queue (a dedicated family
// when the adapter has one); image work needs the graphics queue for blits.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::command::CommandPool;
use super::VulkanDevice;

pub struct Uploader {
    pub transfer_pool: CommandPool,
    pub graphics_pool: CommandPool,
    device: Arc<VulkanDevice>,
}

impl Uploader {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let families = device.queue_families;
        let transfer_pool = CommandPool::new(
            device.clone(),
            families.transfer,
            device.transfer_queue,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let graphics_pool = CommandPool::new(
            device.clone(),
            families.graphics,
            device.graphics_queue,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;

        Ok(Self {
            transfer_pool,
            graphics_pool,
            device,
        })
    }

    /// Families that read buffers uploaded here.
    fn sharing_families(&self) -> [u32; 2] {
        [self.device.queue_families.graphics, self.device.queue_families.transfer]
    }

    /// Host-visible buffer holding a copy of `data`.
    pub fn staging_buffer<T: Pod>(&self, name: &str, data: &[T]) -> Result<GpuBuffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut staging = GpuBuffer::new(
            self.device.clone(),
            name,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            &[],
        )?;
        staging.write(bytes)?;
        Ok(staging)
    }

    /// Upload `data` into a new device-local buffer with `usage`.
    /// Blocks until the copy has finished; the staging buffer is freed
    /// before returning.
    pub fn upload_buffer<T: Pod>(
        &self,
        name: &str,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<GpuBuffer> {
        if data.is_empty() {
            anyhow::bail!("Refusing to upload empty buffer '{}'", name);
        }

        let staging = self.staging_buffer(&format!("{} staging", name), data)?;
        let destination = GpuBuffer::new(
            self.device.clone(),
            name,
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::GpuOnly,
            &self.sharing_families(),
        )?;

        self.copy_buffer(&staging, &destination, staging.size)?;

        log::debug!("Uploaded '{}' ({} bytes)", name, destination.size);
        Ok(destination)
    }

    /// Copy the contents of a device-local buffer back to the host.
    pub fn read_back(&self, source: &GpuBuffer) -> Result<Vec<u8>> {
        let readback = GpuBuffer::new(
            self.device.clone(),
            "readback",
            source.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            &[],
        )?;

        self.copy_buffer(source, &readback, source.size)?;
        Ok(readback.read()?.to_vec())
    }

    /// Read `buffer` back and compare it bit for bit with `expected`.
    pub fn verify<T: Pod>(&self, name: &str, buffer: &GpuBuffer, expected: &[T]) -> Result<()> {
        let expected: &[u8] = bytemuck::cast_slice(expected);
        let actual = self.read_back(buffer)?;

        match first_mismatch(expected, &actual) {
            None => {
                log::info!("Verified upload of '{}' ({} bytes)", name, expected.len());
                Ok(())
            }
            Some(offset) => anyhow::bail!(
                "Upload of '{}' is corrupt: first differing byte at offset {}",
                name,
                offset
            ),
        }
    }

    fn copy_buffer(&self, src: &GpuBuffer, dst: &GpuBuffer, size: vk::DeviceSize) -> Result<()> {
        let command = self.transfer_pool.one_shot()?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            command
                .device()
                .cmd_copy_buffer(command.buffer(), src.buffer, dst.buffer, &[region]);
        }
        command.submit().context("Buffer copy failed")
    }
}

/// Offset of the first differing byte, treating a length mismatch as a
/// difference at the end of the shorter slice.
fn first_mismatch(expected: &[u8], actual: &[u8]) -> Option<usize> {
    expected
        .iter()
        .zip(actual)
        .position(|(a, b)| a != b)
        .or_else(|| (expected.len() != actual.len()).then(|| expected.len().min(actual.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_have_no_mismatch() {
        assert_eq!(first_mismatch(&[1, 2, 3], &[1, 2, 3]), None);
    }

    #[test]
    fn reports_first_differing_byte() {
        assert_eq!(first_mismatch(&[1, 2, 3, 4], &[1, 2, 9, 9]), Some(2));
    }

    #[test]
    fn length_mismatch_counts_as_difference() {
        assert_eq!(first_mismatch(&[1, 2, 3], &[1, 2]), Some(2));
        assert_eq!(first_mismatch(&[1, 2], &[1, 2, 3]), Some(2));
    }
}
