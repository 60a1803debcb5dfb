// =============================================================================
// RENDERER - Owns every GPU object for the textured model
// =============================================================================
//
// Creation order:
//   device -> pipeline -> swapchain -> mesh and texture uploads
//   -> frame command pool -> frame slots -> descriptor sets
//
// Drop walks `RendererStage::TEARDOWN_ORDER`, the reverse of the order
// above. The device goes last.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::assets::{self, Vertex};
use crate::backend::buffer::{find_depth_format, GpuBuffer};
use crate::backend::command::CommandPool;
use crate::backend::descriptor::FrameDescriptors;
use crate::backend::pipeline::{AttachmentFormats, GraphicsPipeline};
use crate::backend::recorder::{record_draw, DrawInputs};
use crate::backend::swapchain::{choose_surface_format, SwapchainManager, SwapchainSettings};
use crate::backend::sync::FrameSlot;
use crate::backend::texture::Texture;
use crate::backend::upload::Uploader;
use crate::backend::VulkanDevice;
use crate::config::Config;
use crate::frame::{AcquireOutcome, FrameBackend, PresentOutcome, RecreateOutcome};
use crate::uniforms::UniformBufferObject;
use crate::window::AppWindow;

/// Renderer-owned objects, in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RendererStage {
    Device,
    Pipeline,
    Swapchain,
    Mesh,
    Texture,
    FramePool,
    FrameSlots,
    Descriptors,
}

impl RendererStage {
    #[cfg(test)]
    const CREATION_ORDER: [RendererStage; 8] = [
        RendererStage::Device,
        RendererStage::Pipeline,
        RendererStage::Swapchain,
        RendererStage::Mesh,
        RendererStage::Texture,
        RendererStage::FramePool,
        RendererStage::FrameSlots,
        RendererStage::Descriptors,
    ];

    /// Descriptor sets reference the uniform buffers and the texture; frame
    /// slots hold command buffers from the pool; framebuffers reference the
    /// render pass.
    const TEARDOWN_ORDER: [RendererStage; 8] = [
        RendererStage::Descriptors,
        RendererStage::FrameSlots,
        RendererStage::FramePool,
        RendererStage::Texture,
        RendererStage::Mesh,
        RendererStage::Swapchain,
        RendererStage::Pipeline,
        RendererStage::Device,
    ];
}

/// Device-local geometry for the loaded model
struct MeshBuffers {
    vertex: GpuBuffer,
    index: GpuBuffer,
    index_count: u32,
}

pub struct Renderer {
    descriptors: Option<FrameDescriptors>,
    frames: Vec<FrameSlot>,
    /// Owns the frame slots' command buffers
    frame_pool: Option<CommandPool>,
    texture: Option<Texture>,
    mesh: Option<MeshBuffers>,
    swapchain: SwapchainManager,
    pipeline: Option<GraphicsPipeline>,

    clear_color: [f32; 4],
    fence_timeout_ns: u64,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    pub fn new(config: &Config, window: &AppWindow) -> Result<Self> {
        log::info!("Initializing renderer...");

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Device context
        // ─────────────────────────────────────────────────────────────────────
        let device = VulkanDevice::new(
            &config.window.title,
            config.validation_enabled(),
            config.graphics.msaa_samples,
            window,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Pipeline
        // ─────────────────────────────────────────────────────────────────────
        // Surface format choice is deterministic, so the render pass built
        // here stays compatible with every recreated swapchain
        let formats = AttachmentFormats {
            color: choose_surface_format(&device.surface_support.formats)?.format,
            depth: find_depth_format(&device)?,
            samples: device.msaa_samples,
        };
        log::info!(
            "Attachments: color {:?}, depth {:?}, {:?}",
            formats.color,
            formats.depth,
            formats.samples
        );

        let pipeline = GraphicsPipeline::new(
            device.clone(),
            formats,
            &config.assets.vertex_shader,
            &config.assets.fragment_shader,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Swapchain
        // ─────────────────────────────────────────────────────────────────────
        let swapchain = SwapchainManager::new(
            device.clone(),
            SwapchainSettings {
                render_pass: pipeline.render_pass,
                formats,
                preferred_present_mode: config.preferred_present_mode(),
            },
            window.framebuffer_extent(),
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Assets
        // ─────────────────────────────────────────────────────────────────────
        let mesh = assets::load_model(&config.assets.model)?;
        let texture_data = assets::load_texture(&config.assets.texture)?;

        let uploader = Uploader::new(device.clone())?;
        let vertex_buffer = uploader.upload_buffer(
            "vertex buffer",
            &mesh.vertices,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = uploader.upload_buffer(
            "index buffer",
            &mesh.indices,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        if config.debug.verify_uploads {
            uploader.verify::<Vertex>("vertex buffer", &vertex_buffer, &mesh.vertices)?;
            uploader.verify::<u32>("index buffer", &index_buffer, &mesh.indices)?;
        }

        let texture = Texture::new(device.clone(), &uploader, &texture_data)?;

        let index_count = u32::try_from(mesh.indices.len()).context("Too many indices")?;
        // Staging pools are only needed at load time
        drop(uploader);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Frame slots
        // ─────────────────────────────────────────────────────────────────────
        let frames_in_flight = config.graphics.max_frames_in_flight;
        let frame_pool = CommandPool::new(
            device.clone(),
            device.queue_families.graphics,
            device.graphics_queue,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        let command_buffers = frame_pool.allocate(frames_in_flight as u32)?;
        let frames = command_buffers
            .into_iter()
            .enumerate()
            .map(|(i, cmd)| FrameSlot::new(device.clone(), cmd, i))
            .collect::<Result<Vec<_>>>()?;

        let uniform_buffers: Vec<&GpuBuffer> =
            frames.iter().map(|frame| &frame.uniform_buffer).collect();
        let descriptors = FrameDescriptors::new(
            device.clone(),
            pipeline.descriptor_set_layout,
            &uniform_buffers,
            &texture,
        )?;

        log::info!(
            "Renderer ready: {} vertices, {} indices, {}x{} texture, {} frames in flight",
            mesh.vertices.len(),
            index_count,
            texture_data.width,
            texture_data.height,
            frames_in_flight
        );

        Ok(Self {
            descriptors: Some(descriptors),
            frames,
            frame_pool: Some(frame_pool),
            texture: Some(texture),
            mesh: Some(MeshBuffers {
                vertex: vertex_buffer,
                index: index_buffer,
                index_count,
            }),
            swapchain,
            pipeline: Some(pipeline),
            clear_color: config.graphics.clear_color,
            fence_timeout_ns: config.fence_timeout_ns(),
            device,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    fn frame(&self, slot: usize) -> Result<&FrameSlot> {
        self.frames
            .get(slot)
            .with_context(|| format!("No frame slot {}", slot))
    }

    fn teardown(&mut self, stage: RendererStage) {
        match stage {
            RendererStage::Descriptors => drop(self.descriptors.take()),
            RendererStage::FrameSlots => self.frames.clear(),
            RendererStage::FramePool => drop(self.frame_pool.take()),
            RendererStage::Texture => drop(self.texture.take()),
            RendererStage::Mesh => drop(self.mesh.take()),
            RendererStage::Swapchain => self.swapchain.destroy(),
            RendererStage::Pipeline => drop(self.pipeline.take()),
            // Released when the last Arc goes, after every field above
            RendererStage::Device => {}
        }
    }
}

impl FrameBackend for Renderer {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.frame(slot)?.wait(self.fence_timeout_ns)
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.frame(slot)?.image_available;
        self.swapchain.current()?.acquire_next_image(semaphore)
    }

    fn update_uniforms(&mut self, slot: usize, elapsed: f32) -> Result<()> {
        let extent = self.swapchain.current()?.extent();
        let ubo = UniformBufferObject::at(elapsed, extent);
        self.frames
            .get_mut(slot)
            .with_context(|| format!("No frame slot {}", slot))?
            .uniform_buffer
            .write(std::slice::from_ref(&ubo))
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        self.frame(slot)?.reset()
    }

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let swapchain = self.swapchain.current()?;
        let framebuffer = *swapchain
            .framebuffers
            .get(image_index as usize)
            .with_context(|| format!("No framebuffer for image {}", image_index))?;
        let descriptor_set = *self
            .descriptors
            .as_ref()
            .context("Descriptor sets not initialized")?
            .sets
            .get(slot)
            .with_context(|| format!("No descriptor set for slot {}", slot))?;
        let pipeline = self
            .pipeline
            .as_ref()
            .context("Pipeline not initialized")?;
        let mesh = self.mesh.as_ref().context("Mesh not uploaded")?;

        let inputs = DrawInputs {
            render_pass: pipeline.render_pass,
            framebuffer,
            extent: swapchain.extent(),
            pipeline: pipeline.pipeline,
            pipeline_layout: pipeline.layout,
            descriptor_set,
            vertex_buffer: mesh.vertex.buffer,
            index_buffer: mesh.index.buffer,
            index_count: mesh.index_count,
            clear_color: self.clear_color,
        };

        record_draw(&self.device.device, self.frame(slot)?.command_buffer, &inputs)
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let frame = self.frame(slot)?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [frame.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                frame.in_flight_fence,
            )
        }
        .context("Failed to submit draw command buffer")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let render_finished = self.frame(slot)?.render_finished;
        self.swapchain
            .current()?
            .present(self.device.present_queue, image_index, render_finished)
    }

    fn recreate_swapchain(&mut self, framebuffer: vk::Extent2D) -> Result<RecreateOutcome> {
        self.swapchain.recreate(framebuffer)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Nothing may be destroyed while the GPU still uses it
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle: {:#}", e);
        }

        for stage in RendererStage::TEARDOWN_ORDER {
            self.teardown(stage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_reverses_creation() {
        let mut reversed = RendererStage::CREATION_ORDER;
        reversed.reverse();
        assert_eq!(RendererStage::TEARDOWN_ORDER, reversed);
    }

    #[test]
    fn every_stage_is_torn_down_once() {
        for stage in RendererStage::CREATION_ORDER {
            let count = RendererStage::TEARDOWN_ORDER
                .iter()
                .filter(|&&s| s == stage)
                .count();
            assert_eq!(count, 1, "{:?}", stage);
        }
    }

    #[test]
    fn dependents_go_before_what_they_reference() {
        let position = |stage: RendererStage| {
            RendererStage::TEARDOWN_ORDER
                .iter()
                .position(|&s| s == stage)
                .unwrap()
        };
        assert!(position(RendererStage::Descriptors) < position(RendererStage::Texture));
        assert!(position(RendererStage::Descriptors) < position(RendererStage::FrameSlots));
        assert!(position(RendererStage::FrameSlots) < position(RendererStage::FramePool));
        assert!(position(RendererStage::Swapchain) < position(RendererStage::Pipeline));
        assert_eq!(position(RendererStage::Device), RendererStage::TEARDOWN_ORDER.len() - 1);
    }
}
