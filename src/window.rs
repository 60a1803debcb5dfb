// Window surface provider
//
// Wraps the winit window with the handful of queries the renderer needs:
// framebuffer extent, minimisation, and a Vulkan surface bound to an instance.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::c_char;
use std::sync::Arc;
use winit::window::Window;

pub struct AppWindow {
    window: Arc<Window>,
}

impl AppWindow {
    pub fn new(window: Arc<Window>) -> Self {
        Self { window }
    }

    pub fn winit(&self) -> &Window {
        &self.window
    }

    /// Current framebuffer size in pixels.
    pub fn framebuffer_extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    pub fn is_minimized(&self) -> bool {
        is_zero_extent(self.framebuffer_extent())
            || self.window.is_minimized().unwrap_or(false)
    }

    /// Instance extensions the platform needs to present to this window.
    pub fn required_extensions(&self) -> Result<&'static [*const c_char]> {
        ash_window::enumerate_required_extensions(self.window.raw_display_handle())
            .context("Failed to query surface instance extensions")
    }

    /// Create a presentable surface bound to `instance`. The caller owns it.
    pub fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR> {
        unsafe {
            ash_window::create_surface(
                entry,
                instance,
                self.window.raw_display_handle(),
                self.window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")
    }
}

pub fn is_zero_extent(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}
