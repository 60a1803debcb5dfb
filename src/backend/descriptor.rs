// Descriptor pool and the per-frame descriptor sets
//
// One set per frame slot: that slot's uniform buffer plus the shared texture.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::texture::Texture;
use super::VulkanDevice;

pub struct FrameDescriptors {
    pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
    device: Arc<VulkanDevice>,
}

impl FrameDescriptors {
    pub fn new(
        device: Arc<VulkanDevice>,
        layout: vk::DescriptorSetLayout,
        uniform_buffers: &[&GpuBuffer],
        texture: &Texture,
    ) -> Result<Self> {
        let count = uniform_buffers.len() as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: count,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: count,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(count);

        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        let mut descriptors = Self {
            pool,
            sets: Vec::new(),
            device,
        };

        let layouts = vec![layout; uniform_buffers.len()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        descriptors.sets =
            unsafe { descriptors.device.device.allocate_descriptor_sets(&alloc_info) }
                .context("Failed to allocate descriptor sets")?;

        for (&set, uniform) in descriptors.sets.iter().zip(uniform_buffers) {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: uniform.buffer,
                offset: 0,
                range: uniform.size,
            }];
            let image_info = [vk::DescriptorImageInfo {
                sampler: texture.sampler,
                image_view: texture.image.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];

            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(1)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_info)
                    .build(),
            ];

            unsafe { descriptors.device.device.update_descriptor_sets(&writes, &[]) };
        }

        Ok(descriptors)
    }
}

impl Drop for FrameDescriptors {
    fn drop(&mut self) {
        // Frees the sets along with the pool
        unsafe { self.device.device.destroy_descriptor_pool(self.pool, None) };
    }
}
