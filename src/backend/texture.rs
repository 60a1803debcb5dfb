// Sampled textures with a generated mip chain

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::{GpuImage, ImageDesc};
use super::upload::Uploader;
use super::VulkanDevice;
use crate::assets::TextureData;

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Number of levels in a full mip chain: floor(log2(max(w, h))) + 1.
pub fn mip_levels(width: u32, height: u32) -> u32 {
    width.max(height).max(1).ilog2() + 1
}

/// Size of the level below a `size` level, never smaller than one texel.
pub fn next_mip_size(size: u32) -> u32 {
    (size / 2).max(1)
}

pub struct Texture {
    pub image: GpuImage,
    pub sampler: vk::Sampler,
    device: Arc<VulkanDevice>,
}

impl Texture {
    /// Upload RGBA8 pixels and build the full mip chain on the GPU.
    pub fn new(
        device: Arc<VulkanDevice>,
        uploader: &Uploader,
        data: &TextureData,
    ) -> Result<Self> {
        // Mip generation blits with linear filtering; there is no CPU fallback
        let features = device.format_properties(TEXTURE_FORMAT).optimal_tiling_features;
        if !features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
            anyhow::bail!("Texture image format does not support linear blitting");
        }

        let expected_len = data.width as usize * data.height as usize * 4;
        if data.pixels.len() != expected_len {
            anyhow::bail!(
                "Texture has {} bytes, expected {} for {}x{} RGBA",
                data.pixels.len(),
                expected_len,
                data.width,
                data.height
            );
        }

        let levels = mip_levels(data.width, data.height);
        let extent = vk::Extent2D {
            width: data.width,
            height: data.height,
        };

        let staging = uploader.staging_buffer("texture staging", &data.pixels)?;
        let image = GpuImage::new(
            device.clone(),
            &ImageDesc {
                name: "texture",
                extent,
                format: TEXTURE_FORMAT,
                usage: vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
                aspect: vk::ImageAspectFlags::COLOR,
                samples: vk::SampleCountFlags::TYPE_1,
                mip_levels: levels,
            },
        )?;

        {
            let command = uploader.graphics_pool.one_shot()?;
            let cmd = command.buffer();
            let dev = command.device();

            transition_image_layout(
                dev,
                cmd,
                image.image,
                0,
                levels,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(color_layers(0))
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .build();
            unsafe {
                dev.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            record_mipmaps(dev, cmd, image.image, extent, levels)?;
            command.submit().context("Texture upload failed")?;
        }
        drop(staging);

        let sampler = create_sampler(&device, levels)?;

        log::info!(
            "Created texture {}x{} with {} mip levels",
            extent.width,
            extent.height,
            levels
        );

        Ok(Self {
            image,
            sampler,
            device,
        })
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_sampler(self.sampler, None) };
    }
}

fn create_sampler(device: &VulkanDevice, mip_levels: u32) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(device.properties.limits.max_sampler_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .min_lod(0.0)
        .max_lod(mip_levels as f32)
        .mip_lod_bias(0.0);

    unsafe { device.device.create_sampler(&sampler_info, None) }
        .context("Failed to create texture sampler")
}

fn color_layers(mip_level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Access masks and pipeline stages for a supported layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier parameters for `old -> new`. Any other pair is a programming
/// error and is rejected.
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<TransitionMasks> {
    use vk::ImageLayout as L;

    let masks = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::TRANSFER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_READ,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        _ => anyhow::bail!("Unsupported layout transition: {:?} -> {:?}", old, new),
    };

    Ok(masks)
}

/// Record a barrier moving `level_count` mips starting at `base_mip` from
/// `old` to `new`.
pub fn transition_image_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    base_mip: u32,
    level_count: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let masks = transition_masks(old, new)?;

    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: base_mip,
            level_count,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }

    Ok(())
}

/// Source and destination rectangles for each blit in the chain,
/// level i-1 into level i.
pub fn mip_blit_extents(extent: vk::Extent2D, levels: u32) -> Vec<(vk::Extent2D, vk::Extent2D)> {
    let mut size = extent;
    (1..levels)
        .map(|_| {
            let next = vk::Extent2D {
                width: next_mip_size(size.width),
                height: next_mip_size(size.height),
            };
            let blit = (size, next);
            size = next;
            blit
        })
        .collect()
}

/// Fill levels 1.. from level 0, which must be in TRANSFER_DST layout with
/// every other level. Leaves the whole image in SHADER_READ_ONLY layout.
fn record_mipmaps(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    extent: vk::Extent2D,
    levels: u32,
) -> Result<()> {
    use vk::ImageLayout as L;

    for (i, (src, dst)) in (1..levels).zip(mip_blit_extents(extent, levels)) {
        transition_image_layout(
            device,
            cmd,
            image,
            i - 1,
            1,
            L::TRANSFER_DST_OPTIMAL,
            L::TRANSFER_SRC_OPTIMAL,
        )?;

        let blit = vk::ImageBlit {
            src_subresource: color_layers(i - 1),
            src_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: src.width as i32,
                    y: src.height as i32,
                    z: 1,
                },
            ],
            dst_subresource: color_layers(i),
            dst_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: dst.width as i32,
                    y: dst.height as i32,
                    z: 1,
                },
            ],
        };

        unsafe {
            device.cmd_blit_image(
                cmd,
                image,
                L::TRANSFER_SRC_OPTIMAL,
                image,
                L::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
        }

        transition_image_layout(
            device,
            cmd,
            image,
            i - 1,
            1,
            L::TRANSFER_SRC_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
        )?;
    }

    // The last level was only ever written
    transition_image_layout(
        device,
        cmd,
        image,
        levels - 1,
        1,
        L::TRANSFER_DST_OPTIMAL,
        L::SHADER_READ_ONLY_OPTIMAL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_level_counts() {
        assert_eq!(mip_levels(512, 256), 10);
        assert_eq!(mip_levels(1, 1), 1);
        assert_eq!(mip_levels(1024, 1024), 11);
        assert_eq!(mip_levels(1000, 3), 10);
        assert_eq!(mip_levels(3, 1000), 10);
        assert_eq!(mip_levels(2, 1), 2);
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn mip_chain_halves_with_floor_and_minimum_one() {
        let chain = mip_blit_extents(extent(5, 2), mip_levels(5, 2));
        let sizes: Vec<_> = chain.iter().map(|(_, dst)| (dst.width, dst.height)).collect();
        assert_eq!(sizes, vec![(2, 1), (1, 1)]);
        assert_eq!(chain[0].0, extent(5, 2));
        assert_eq!(chain[1].0, extent(2, 1));
    }

    #[test]
    fn single_level_texture_has_no_blits() {
        assert!(mip_blit_extents(extent(1, 1), 1).is_empty());
    }

    #[test]
    fn chain_ends_at_one_texel() {
        let chain = mip_blit_extents(extent(512, 256), mip_levels(512, 256));
        assert_eq!(chain.len(), 9);
        assert_eq!(chain.last().map(|(_, dst)| *dst), Some(extent(1, 1)));
    }

    #[test]
    fn supported_transitions() {
        use vk::ImageLayout as L;
        let upload = transition_masks(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(upload.dst_access, vk::AccessFlags::TRANSFER_WRITE);

        let last_level =
            transition_masks(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(last_level.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn unsupported_transition_is_an_error() {
        use vk::ImageLayout as L;
        let err = transition_masks(L::SHADER_READ_ONLY_OPTIMAL, L::UNDEFINED).unwrap_err();
        assert!(err.to_string().contains("Unsupported layout transition"));
    }
}
