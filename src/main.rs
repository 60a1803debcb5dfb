// =============================================================================
// MODEL VIEWER - Textured, rotating OBJ model on Vulkan
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (App)                                         │
// │    └── FrameScheduler (wait, acquire, update, record, present)  │
// │          └── Renderer (FrameBackend)                            │
// │                ├── Device context + swapchain manager           │
// │                ├── Uploaded mesh and mipmapped texture          │
// │                └── Frame slots (fences, semaphores, uniforms)   │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

mod assets;
mod backend;
mod config;
mod frame;
mod renderer;
mod uniforms;
mod window;

use anyhow::Result;
use config::Config;
use frame::{FrameScheduler, FrameStatus};
use renderer::Renderer;
use std::sync::Arc;
use std::time::Instant;
use window::AppWindow;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::Window,
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    // Load configuration from config.toml
    let config = Config::load();

    log::info!("Starting model viewer");
    log::info!(
        "Window: {}x{}, present mode: {}, {} frames in flight",
        config.window.width,
        config.window.height,
        config.graphics.present_mode,
        config.graphics.max_frames_in_flight
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Default filter is `info`; `RUST_LOG` overrides it.
fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The renderer owns the surface
/// and must go before the window it was created for.
struct App {
    renderer: Option<Renderer>,
    scheduler: Option<FrameScheduler>,
    window: Option<AppWindow>,
    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            renderer: None,
            scheduler: None,
            window: None,
            config,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attributes = Window::default_attributes()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(true);

        let window = AppWindow::new(Arc::new(event_loop.create_window(attributes)?));
        let renderer = Renderer::new(&self.config, &window)?;
        let scheduler = FrameScheduler::new(renderer.frames_in_flight())?;

        self.window = Some(window);
        self.renderer = Some(renderer);
        self.scheduler = Some(scheduler);
        Ok(())
    }

    /// Draw one frame if everything is up. `Ok(true)` when an image was presented.
    fn render_frame(&mut self) -> Result<bool> {
        let (Some(window), Some(renderer), Some(scheduler)) =
            (&self.window, &mut self.renderer, &mut self.scheduler)
        else {
            return Ok(false);
        };

        let status = scheduler.draw_frame(renderer, window.framebuffer_extent())?;
        Ok(matches!(status, FrameStatus::Presented { .. }))
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.winit().set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        if let Err(e) = self.init(event_loop) {
            log::error!("Failed to initialize: {:#}", e);
            event_loop.exit();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut scheduler) = self.scheduler {
                    scheduler.request_resize();
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error: {:#}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Redraw continuously while visible; sleep until the next event while
    /// minimized.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(ref window) = self.window else {
            return;
        };

        if window.is_minimized() {
            event_loop.set_control_flow(ControlFlow::Wait);
        } else {
            event_loop.set_control_flow(ControlFlow::Poll);
            window.winit().request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Renderer waits for the device to go idle before releasing anything
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}
