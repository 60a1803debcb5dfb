// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// together with everything sized to it: image views, the multisampled
// colour target, the depth target and the framebuffers.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::buffer::{has_stencil_component, GpuImage, ImageDesc};
use super::pipeline::AttachmentFormats;
use super::VulkanDevice;
use crate::frame::{AcquireOutcome, PresentOutcome, RecreateOutcome};
use crate::window::is_zero_extent;

const PREFERRED_FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;
const PREFERRED_COLOR_SPACE: vk::ColorSpaceKHR = vk::ColorSpaceKHR::SRGB_NONLINEAR;

/// Everything chosen for one (re)creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub image_count: u32,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

impl SwapchainPlan {
    /// Derive the swapchain parameters from what the surface reports.
    ///
    /// `framebuffer` is the window's size in pixels and is only consulted
    /// when the surface leaves the extent up to us.
    pub fn new(
        caps: &vk::SurfaceCapabilitiesKHR,
        formats: &[vk::SurfaceFormatKHR],
        present_modes: &[vk::PresentModeKHR],
        preferred_present_mode: vk::PresentModeKHR,
        framebuffer: vk::Extent2D,
    ) -> Result<Self> {
        let surface_format = choose_surface_format(formats)?;
        let extent = choose_extent(caps, framebuffer);
        if is_zero_extent(extent) {
            anyhow::bail!("Refusing to create a swapchain with extent {:?}", extent);
        }

        Ok(Self {
            image_count: choose_image_count(caps),
            format: surface_format.format,
            color_space: surface_format.color_space,
            present_mode: choose_present_mode(present_modes, preferred_present_mode),
            extent,
        })
    }
}

/// Prefer sRGB BGRA8, else whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == PREFERRED_FORMAT && f.color_space == PREFERRED_COLOR_SPACE)
        .or_else(|| formats.first())
        .copied()
        .context("No suitable surface format")
}

/// The preferred mode if offered, else FIFO, which every surface supports.
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if present_modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Use the surface's extent unless it is the "undefined" sentinel, in which
/// case clamp the framebuffer size to the supported range.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: framebuffer
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: framebuffer
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, clamped to the maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// Swapchain-derived objects, in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStage {
    Swapchain,
    ImageViews,
    Attachments,
    Framebuffers,
}

impl SwapchainStage {
    pub const CREATION_ORDER: [SwapchainStage; 4] = [
        SwapchainStage::Swapchain,
        SwapchainStage::ImageViews,
        SwapchainStage::Attachments,
        SwapchainStage::Framebuffers,
    ];

    /// Dependents go first: framebuffers reference views and attachments,
    /// views reference swapchain images.
    pub const TEARDOWN_ORDER: [SwapchainStage; 4] = [
        SwapchainStage::Framebuffers,
        SwapchainStage::Attachments,
        SwapchainStage::ImageViews,
        SwapchainStage::Swapchain,
    ];
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    /// Multisampled render target; absent when rendering single-sampled
    pub color_target: Option<GpuImage>,
    pub depth_target: Option<GpuImage>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub plan: SwapchainPlan,
    loader: khr::Swapchain,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Build the swapchain and everything sized to it.
    pub fn new(
        device: Arc<VulkanDevice>,
        settings: &SwapchainSettings,
        caps: &vk::SurfaceCapabilitiesKHR,
        framebuffer: vk::Extent2D,
    ) -> Result<Self> {
        let plan = SwapchainPlan::new(
            caps,
            &device.surface_support.formats,
            &device.surface_support.present_modes,
            settings.preferred_present_mode,
            framebuffer,
        )?;

        if plan.format != settings.formats.color {
            anyhow::bail!(
                "Surface format changed from {:?} to {:?}",
                settings.formats.color,
                plan.format
            );
        }

        let loader = khr::Swapchain::new(&device.instance, &device.device);

        let families = device.queue_families;
        let queue_family_indices = [families.graphics, families.present];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(plan.image_count)
            .image_format(plan.format)
            .image_color_space(plan.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true);
        create_info = if families.graphics != families.present {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_family_indices)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // Handles are filled in stage by stage; Drop tears down whatever exists
        let mut chain = Self {
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            color_target: None,
            depth_target: None,
            framebuffers: Vec::new(),
            plan,
            loader,
            device,
        };

        chain.images = unsafe { chain.loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        for &image in &chain.images {
            let view = super::buffer::create_image_view(
                &chain.device,
                image,
                plan.format,
                vk::ImageAspectFlags::COLOR,
                1,
            )?;
            chain.image_views.push(view);
        }

        chain.create_attachments(&settings.formats)?;
        chain.create_framebuffers(settings.render_pass, &settings.formats)?;

        log::info!(
            "Created swapchain: {} images, {:?}, {:?}, {}x{}",
            chain.images.len(),
            plan.format,
            plan.present_mode,
            plan.extent.width,
            plan.extent.height
        );

        Ok(chain)
    }

    fn create_attachments(&mut self, formats: &AttachmentFormats) -> Result<()> {
        let extent = self.plan.extent;

        if formats.resolves() {
            self.color_target = Some(GpuImage::new(
                self.device.clone(),
                &ImageDesc {
                    name: "msaa color target",
                    extent,
                    format: formats.color,
                    usage: vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                        | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                    aspect: vk::ImageAspectFlags::COLOR,
                    samples: formats.samples,
                    mip_levels: 1,
                },
            )?);
        }

        let depth_aspect = if has_stencil_component(formats.depth) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        };
        self.depth_target = Some(GpuImage::new(
            self.device.clone(),
            &ImageDesc {
                name: "depth target",
                extent,
                format: formats.depth,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect: depth_aspect,
                samples: formats.samples,
                mip_levels: 1,
            },
        )?);

        Ok(())
    }

    fn create_framebuffers(
        &mut self,
        render_pass: vk::RenderPass,
        formats: &AttachmentFormats,
    ) -> Result<()> {
        let depth_view = self
            .depth_target
            .as_ref()
            .map(|depth| depth.view)
            .context("Depth target missing")?;
        let color_view = self.color_target.as_ref().map(|color| color.view);

        for &image_view in &self.image_views {
            // Must match the render pass attachment order
            let attachments = match (formats.resolves(), color_view) {
                (true, Some(color_view)) => vec![color_view, depth_view, image_view],
                (false, _) => vec![image_view, depth_view],
                (true, None) => anyhow::bail!("Multisampled colour target missing"),
            };

            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.plan.extent.width)
                .height(self.plan.extent.height)
                .layers(1);

            let framebuffer =
                unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }
                    .context("Failed to create framebuffer")?;
            self.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.plan.extent
    }

    /// Request the next image, signalling `semaphore` once it is ready.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Queue `image_index` for presentation once `wait_semaphore` signals.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Optimal),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    fn teardown(&mut self, stage: SwapchainStage) {
        let device = &self.device.device;
        unsafe {
            match stage {
                SwapchainStage::Framebuffers => {
                    for framebuffer in self.framebuffers.drain(..) {
                        device.destroy_framebuffer(framebuffer, None);
                    }
                }
                SwapchainStage::Attachments => {
                    self.color_target = None;
                    self.depth_target = None;
                }
                SwapchainStage::ImageViews => {
                    for view in self.image_views.drain(..) {
                        device.destroy_image_view(view, None);
                    }
                }
                SwapchainStage::Swapchain => {
                    // Images belong to the swapchain and go with it
                    self.images.clear();
                    self.loader.destroy_swapchain(self.swapchain, None);
                    self.swapchain = vk::SwapchainKHR::null();
                }
            }
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        for stage in SwapchainStage::TEARDOWN_ORDER {
            self.teardown(stage);
        }
    }
}

/// Inputs that stay fixed across recreations
#[derive(Debug, Clone, Copy)]
pub struct SwapchainSettings {
    pub render_pass: vk::RenderPass,
    pub formats: AttachmentFormats,
    pub preferred_present_mode: vk::PresentModeKHR,
}

/// Owns the current swapchain and rebuilds it on demand
pub struct SwapchainManager {
    current: Option<Swapchain>,
    /// A rebuild was asked for while the surface had zero area
    pending: bool,
    settings: SwapchainSettings,
    device: Arc<VulkanDevice>,
}

impl SwapchainManager {
    pub fn new(
        device: Arc<VulkanDevice>,
        settings: SwapchainSettings,
        framebuffer: vk::Extent2D,
    ) -> Result<Self> {
        let caps = device.surface_capabilities()?;
        let current = Swapchain::new(device.clone(), &settings, &caps, framebuffer)?;
        Ok(Self {
            current: Some(current),
            pending: false,
            settings,
            device,
        })
    }

    pub fn current(&self) -> Result<&Swapchain> {
        if self.pending {
            anyhow::bail!("Swapchain rebuild is still pending");
        }
        self.current.as_ref().context("Swapchain not initialized")
    }

    /// Wait for the GPU, tear the old swapchain down completely, then build
    /// a new one for `framebuffer`.
    ///
    /// While the surface reports zero area nothing is torn down; the
    /// rebuild stays pending until a later call sees a usable size.
    pub fn recreate(&mut self, framebuffer: vk::Extent2D) -> Result<RecreateOutcome> {
        self.device.wait_idle()?;

        let caps = self.device.surface_capabilities()?;
        if rebuild_must_wait(&caps, framebuffer) {
            if !self.pending {
                log::debug!("Surface has zero area, deferring swapchain rebuild");
            }
            self.pending = true;
            return Ok(RecreateOutcome::Deferred);
        }

        // The surface only accepts one swapchain at a time
        self.destroy();
        self.current = Some(Swapchain::new(
            self.device.clone(),
            &self.settings,
            &caps,
            framebuffer,
        )?);
        self.pending = false;

        log::debug!(
            "Swapchain recreated for {}x{}",
            framebuffer.width,
            framebuffer.height
        );
        Ok(RecreateOutcome::Rebuilt)
    }

    pub fn destroy(&mut self) {
        self.current = None;
    }
}

/// True when the surface would give the swapchain zero area, as it does
/// for a minimized window regardless of the last known framebuffer size.
pub fn rebuild_must_wait(caps: &vk::SurfaceCapabilitiesKHR, framebuffer: vk::Extent2D) -> bool {
    is_zero_extent(choose_extent(caps, framebuffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn caps(current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: current,
            min_image_extent: extent(64, 64),
            max_image_extent: extent(4096, 2048),
            ..Default::default()
        }
    }

    const UNDEFINED: vk::Extent2D = vk::Extent2D {
        width: u32::MAX,
        height: u32::MAX,
    };

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn prefers_srgb_bgra() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn image_count_is_min_plus_one_within_max() {
        assert_eq!(choose_image_count(&caps(UNDEFINED)), 3);

        let tight = vk::SurfaceCapabilitiesKHR {
            max_image_count: 2,
            ..caps(UNDEFINED)
        };
        assert_eq!(choose_image_count(&tight), 2);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            max_image_count: 0,
            ..caps(UNDEFINED)
        };
        assert_eq!(choose_image_count(&unbounded), 3);
    }

    #[test]
    fn surface_extent_wins_when_defined() {
        let current = extent(800, 600);
        let chosen = choose_extent(&caps(current), extent(1, 1));
        assert_eq!(chosen, current);
    }

    #[test]
    fn undefined_extent_clamps_framebuffer() {
        let caps = caps(UNDEFINED);
        for (width, height) in [(1, 1), (800, 600), (10_000, 10_000), (32, 3000)] {
            let clamped = choose_extent(&caps, extent(width, height));
            assert!(clamped.width >= caps.min_image_extent.width);
            assert!(clamped.width <= caps.max_image_extent.width);
            assert!(clamped.height >= caps.min_image_extent.height);
            assert!(clamped.height <= caps.max_image_extent.height);
        }
        assert_eq!(choose_extent(&caps, extent(1024, 768)), extent(1024, 768));
    }

    #[test]
    fn zero_extent_is_rejected() {
        let formats = [format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let minimized = caps(extent(0, 0));
        let plan = SwapchainPlan::new(
            &minimized,
            &formats,
            &[vk::PresentModeKHR::FIFO],
            vk::PresentModeKHR::MAILBOX,
            extent(0, 0),
        );
        assert!(plan.is_err());
    }

    #[test]
    fn minimized_surface_defers_rebuild() {
        // Window size seen before the minimize, surface already at zero
        let framebuffer = extent(800, 600);
        let minimized = caps(extent(0, 0));
        assert!(rebuild_must_wait(&minimized, framebuffer));

        let restored = caps(extent(800, 600));
        assert!(!rebuild_must_wait(&restored, framebuffer));
        assert!(!rebuild_must_wait(&caps(UNDEFINED), framebuffer));
        assert!(rebuild_must_wait(&caps(UNDEFINED), extent(0, 0)));
    }

    #[test]
    fn replanning_without_extent_change_is_identical() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        let caps = caps(UNDEFINED);
        let framebuffer = extent(1024, 768);

        let plan = || {
            SwapchainPlan::new(
                &caps,
                &formats,
                &modes,
                vk::PresentModeKHR::MAILBOX,
                framebuffer,
            )
            .unwrap()
        };
        let first = plan();
        let second = plan();
        assert_eq!(first, second);
        assert_eq!(first.extent, framebuffer);
    }

    #[test]
    fn resize_changes_only_the_extent() {
        let formats = [format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let modes = [vk::PresentModeKHR::FIFO];
        let before = SwapchainPlan::new(
            &caps(extent(800, 600)),
            &formats,
            &modes,
            vk::PresentModeKHR::MAILBOX,
            extent(800, 600),
        )
        .unwrap();
        let after = SwapchainPlan::new(
            &caps(extent(1024, 768)),
            &formats,
            &modes,
            vk::PresentModeKHR::MAILBOX,
            extent(1024, 768),
        )
        .unwrap();

        assert_eq!(after.extent, extent(1024, 768));
        let unchanged = SwapchainPlan {
            extent: before.extent,
            ..after
        };
        assert_eq!(unchanged, before);
    }

    #[test]
    fn teardown_reverses_creation() {
        let mut reversed = SwapchainStage::CREATION_ORDER;
        reversed.reverse();
        assert_eq!(SwapchainStage::TEARDOWN_ORDER, reversed);
    }
}
