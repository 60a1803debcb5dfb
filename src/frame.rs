// =============================================================================
// FRAME LOOP - Per-iteration state machine
// =============================================================================
//
// One iteration on slot k = current_frame mod N:
//   wait fence -> acquire -> update uniforms -> reset + record
//   -> submit -> present -> advance
//
// Acquisition and presentation results are the only conditions with a retry
// path (swapchain recreation). Everything else a backend reports is fatal.

use anyhow::Result;
use ash::vk;
use std::time::Instant;

use crate::window::is_zero_extent;

/// Result of asking the swapchain for its next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Usable image. `suboptimal` still renders, but asks for a rebuild.
    Acquired { image_index: u32, suboptimal: bool },
    /// The surface changed; nothing can be presented to this swapchain.
    OutOfDate,
}

/// Result of queueing an image for presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Optimal,
    Suboptimal,
    OutOfDate,
}

/// Result of asking for a swapchain rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateOutcome {
    Rebuilt,
    /// The surface has zero area; the old swapchain is left alone and the
    /// rebuild has to be retried.
    Deferred,
}

/// What one call to `FrameScheduler::draw_frame` ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Frame submitted and presented; `swapchain_rebuilt` when the swapchain
    /// was recreated afterwards.
    Presented { swapchain_rebuilt: bool },
    /// Framebuffer has zero area, nothing was touched.
    Minimized,
    /// A swapchain rebuild is waiting for the surface to regain a usable
    /// size; the frame was skipped.
    RebuildDeferred,
    /// Acquisition reported out-of-date; the swapchain was rebuilt and the
    /// frame abandoned without advancing.
    SwapchainRebuilt,
}

/// GPU-facing half of the frame loop, indexed by frame slot
pub trait FrameBackend {
    /// Block until the slot's previous submission has completed.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire the next presentable image, signalling the slot's
    /// image-available semaphore.
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Write the transform block for `elapsed` seconds into the slot's
    /// uniform buffer.
    fn update_uniforms(&mut self, slot: usize, elapsed: f32) -> Result<()>;

    /// Unsignal the slot's fence and reset its command buffer.
    fn reset_slot(&mut self, slot: usize) -> Result<()>;

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()>;

    /// Submit the slot's command buffer, signalling its fence on completion.
    fn submit(&mut self, slot: usize) -> Result<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    fn recreate_swapchain(&mut self, framebuffer: vk::Extent2D) -> Result<RecreateOutcome>;
}

pub struct FrameScheduler {
    frames_in_flight: usize,
    current_frame: usize,
    resize_requested: bool,
    /// The last rebuild was deferred; no image can be acquired until one
    /// succeeds
    rebuild_pending: bool,
    /// Set on the first frame drawn
    start: Option<Instant>,
}

impl FrameScheduler {
    pub fn new(frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            anyhow::bail!("At least one frame in flight is required");
        }

        Ok(Self {
            frames_in_flight,
            current_frame: 0,
            resize_requested: false,
            rebuild_pending: false,
            start: None,
        })
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Mark the swapchain for recreation after the next present.
    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    /// Run one iteration against the monotonic clock.
    pub fn draw_frame<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        framebuffer: vk::Extent2D,
    ) -> Result<FrameStatus> {
        if is_zero_extent(framebuffer) {
            return Ok(FrameStatus::Minimized);
        }

        let start = *self.start.get_or_insert_with(Instant::now);
        self.step(backend, framebuffer, start.elapsed().as_secs_f32())
    }

    /// One iteration with an explicit time since the first frame.
    pub fn step<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        framebuffer: vk::Extent2D,
        elapsed: f32,
    ) -> Result<FrameStatus> {
        if is_zero_extent(framebuffer) {
            return Ok(FrameStatus::Minimized);
        }

        if self.rebuild_pending && !self.rebuild(backend, framebuffer)? {
            return Ok(FrameStatus::RebuildDeferred);
        }

        let slot = self.current_frame;

        backend.wait_for_slot(slot)?;

        let (image_index, suboptimal) = match backend.acquire_image(slot)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire");
                return Ok(if self.rebuild(backend, framebuffer)? {
                    FrameStatus::SwapchainRebuilt
                } else {
                    FrameStatus::RebuildDeferred
                });
            }
        };

        backend.update_uniforms(slot, elapsed)?;

        // Only reset once work is certain to be submitted, or the next wait
        // on this slot would never return
        backend.reset_slot(slot)?;
        backend.record(slot, image_index)?;
        backend.submit(slot)?;

        let presented = backend.present(slot, image_index)?;
        let rebuild = suboptimal || presented != PresentOutcome::Optimal || self.resize_requested;
        if rebuild {
            log::debug!(
                "Recreating swapchain after present ({:?}, suboptimal acquire: {}, resize: {})",
                presented,
                suboptimal,
                self.resize_requested
            );
        }
        let rebuilt = rebuild && self.rebuild(backend, framebuffer)?;

        self.current_frame = (self.current_frame + 1) % self.frames_in_flight;

        Ok(FrameStatus::Presented {
            swapchain_rebuilt: rebuilt,
        })
    }

    /// Ask the backend for a new swapchain. `Ok(false)` when it had to be
    /// deferred; the next iteration retries before acquiring.
    fn rebuild<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        framebuffer: vk::Extent2D,
    ) -> Result<bool> {
        self.resize_requested = false;
        let rebuilt = backend.recreate_swapchain(framebuffer)? == RecreateOutcome::Rebuilt;
        self.rebuild_pending = !rebuilt;
        Ok(rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Wait(usize),
        Acquire(usize),
        Update(usize, f32),
        Reset(usize),
        Record(usize, u32),
        Submit(usize),
        Present(usize, u32),
        Recreate(u32, u32),
    }

    /// Backend that records every call and replays scripted results
    #[derive(Default)]
    struct ScriptedBackend {
        events: Vec<Event>,
        acquires: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        next_image: u32,
        extent: Option<vk::Extent2D>,
        /// Rebuild attempts to defer before one succeeds
        deferrals: usize,
    }

    impl ScriptedBackend {
        fn clear(&mut self) {
            self.events.clear();
        }
    }

    impl FrameBackend for ScriptedBackend {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.events.push(Event::Wait(slot));
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.events.push(Event::Acquire(slot));
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let image_index = self.next_image;
                self.next_image = (self.next_image + 1) % 3;
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: false,
                }
            }))
        }

        fn update_uniforms(&mut self, slot: usize, elapsed: f32) -> Result<()> {
            self.events.push(Event::Update(slot, elapsed));
            Ok(())
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            self.events.push(Event::Reset(slot));
            Ok(())
        }

        fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
            self.events.push(Event::Record(slot, image_index));
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<()> {
            self.events.push(Event::Submit(slot));
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.events.push(Event::Present(slot, image_index));
            Ok(self.presents.pop_front().unwrap_or(PresentOutcome::Optimal))
        }

        fn recreate_swapchain(&mut self, framebuffer: vk::Extent2D) -> Result<RecreateOutcome> {
            self.events.push(Event::Recreate(framebuffer.width, framebuffer.height));
            if self.deferrals > 0 {
                self.deferrals -= 1;
                return Ok(RecreateOutcome::Deferred);
            }
            self.extent = Some(framebuffer);
            Ok(RecreateOutcome::Rebuilt)
        }
    }

    const WINDOW: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    fn slots_used(events: &[Event]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Wait(slot) => Some(*slot),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        assert!(FrameScheduler::new(0).is_err());
    }

    #[test]
    fn slots_cycle_through_frames_in_flight() {
        for n in 1..=3 {
            let mut scheduler = FrameScheduler::new(n).unwrap();
            let mut backend = ScriptedBackend::default();

            for frame in 0..(3 * n) {
                assert!(scheduler.current_frame() < n);
                let status = scheduler.step(&mut backend, WINDOW, frame as f32).unwrap();
                assert_eq!(
                    status,
                    FrameStatus::Presented {
                        swapchain_rebuilt: false
                    }
                );
            }

            let expected: Vec<usize> = (0..3 * n).map(|i| i % n).collect();
            assert_eq!(slots_used(&backend.events), expected);
        }
    }

    #[test]
    fn fence_is_waited_on_before_slot_is_reset() {
        let mut scheduler = FrameScheduler::new(2).unwrap();
        let mut backend = ScriptedBackend::default();

        for frame in 0..6 {
            scheduler.step(&mut backend, WINDOW, frame as f32).unwrap();
        }

        for (i, event) in backend.events.iter().enumerate() {
            if let Event::Reset(slot) = event {
                let waited = backend.events[..i]
                    .iter()
                    .rev()
                    .take_while(|e| !matches!(e, Event::Submit(s) if s == slot))
                    .any(|e| *e == Event::Wait(*slot));
                assert!(waited, "slot {} reset without a preceding wait", slot);
            }
        }
    }

    #[test]
    fn one_iteration_runs_steps_in_order() {
        let mut scheduler = FrameScheduler::new(2).unwrap();
        let mut backend = ScriptedBackend::default();

        scheduler.step(&mut backend, WINDOW, 0.5).unwrap();

        assert_eq!(
            backend.events,
            vec![
                Event::Wait(0),
                Event::Acquire(0),
                Event::Update(0, 0.5),
                Event::Reset(0),
                Event::Record(0, 0),
                Event::Submit(0),
                Event::Present(0, 0),
            ]
        );
    }

    #[test]
    fn uniforms_differ_between_time_steps() {
        let mut scheduler = FrameScheduler::new(2).unwrap();
        let mut backend = ScriptedBackend::default();

        scheduler.step(&mut backend, WINDOW, 0.0).unwrap();
        scheduler.step(&mut backend, WINDOW, 1.0).unwrap();

        let updates: Vec<_> = backend
            .events
            .iter()
            .filter(|e| matches!(e, Event::Update(..)))
            .cloned()
            .collect();
        assert_eq!(updates, vec![Event::Update(0, 0.0), Event::Update(1, 1.0)]);
    }

    #[test]
    fn minimized_window_skips_everything() {
        let mut scheduler = FrameScheduler::new(2).unwrap();
        let mut backend = ScriptedBackend::default();
        let minimized = vk::Extent2D {
            width: 0,
            height: 0,
        };

        for _ in 0..5 {
            assert_eq!(
                scheduler.draw_frame(&mut backend, minimized).unwrap(),
                FrameStatus::Minimized
            );
        }
        assert!(backend.events.is_empty());
        assert_eq!(scheduler.current_frame(), 0);

        let status = scheduler.draw_frame(&mut backend, WINDOW).unwrap();
        assert!(matches!(status, FrameStatus::Presented { .. }));
        assert_eq!(slots_used(&backend.events), vec![0]);
    }

    #[test]
    fn out_of_date_acquire_rebuilds_without_presenting() {
        let mut scheduler = FrameScheduler::new(2).unwrap();
        let mut backend = ScriptedBackend::default();
        backend.acquires.push_back(AcquireOutcome::OutOfDate);

        let status = scheduler.step(&mut backend, WINDOW, 0.0).unwrap();

        assert_eq!(status, FrameStatus::SwapchainRebuilt);
        assert_eq!(
            backend.events,
            vec![Event::Wait(0), Event::Acquire(0), Event::Recreate(800, 600)]
        );
        // Slot was never reset, so it is reused straight away
        assert_eq!(scheduler.current_frame(), 0);
    }

    #[test]
    fn minimize_during_acquire_defers_until_surface_returns() {
        let mut scheduler = FrameScheduler::new(2).unwrap();
        let mut backend = ScriptedBackend::default();

        // Window still reported 800x600 when the frame started, but the
        // surface had already shrunk to nothing by the time of acquire
        backend.acquires.push_back(AcquireOutcome::OutOfDate);
        backend.deferrals = 3;

        assert_eq!(
            scheduler.step(&mut backend, WINDOW, 0.0).unwrap(),
            FrameStatus::RebuildDeferred
        );
        assert_eq!(
            backend.events,
            vec![Event::Wait(0), Event::Acquire(0), Event::Recreate(800, 600)]
        );

        // Later frames only retry the rebuild; no acquire against the old swapchain
        backend.clear();
        for _ in 0..2 {
            assert_eq!(
                scheduler.step(&mut backend, WINDOW, 0.1).unwrap(),
                FrameStatus::RebuildDeferred
            );
        }
        assert_eq!(
            backend.events,
            vec![Event::Recreate(800, 600), Event::Recreate(800, 600)]
        );
        assert_eq!(scheduler.current_frame(), 0);

        // Surface is back: rebuild, then render the frame normally
        backend.clear();
        let status = scheduler.step(&mut backend, WINDOW, 0.2).unwrap();
        assert_eq!(
            status,
            FrameStatus::Presented {
                swapchain_rebuilt: false
            }
        );
        assert_eq!(backend.events[0], Event::Recreate(800, 600));
        assert_eq!(backend.events[1], Event::Wait(0));
        assert!(backend.events.contains(&Event::Present(0, 0)));
        assert_eq!(backend.extent, Some(WINDOW));
        assert_eq!(scheduler.current_frame(), 1);
    }

    #[test]
    fn deferred_rebuild_after_present_blocks_next_acquire() {
        let mut scheduler = FrameScheduler::new(2).unwrap();
        let mut backend = ScriptedBackend::default();
        backend.presents.push_back(PresentOutcome::OutOfDate);
        backend.deferrals = 1;

        let status = scheduler.step(&mut backend, WINDOW, 0.0).unwrap();
        assert_eq!(
            status,
            FrameStatus::Presented {
                swapchain_rebuilt: false
            }
        );
        assert_eq!(scheduler.current_frame(), 1);

        backend.clear();
        scheduler.step(&mut backend, WINDOW, 0.1).unwrap();
        assert_eq!(backend.events[0], Event::Recreate(800, 600));
        assert_eq!(backend.events[1], Event::Wait(1));
    }

    #[test]
    fn suboptimal_acquire_presents_before_rebuilding() {
        let mut scheduler = FrameScheduler::new(2).unwrap();
        let mut backend = ScriptedBackend::default();
        backend.acquires.push_back(AcquireOutcome::Acquired {
            image_index: 1,
            suboptimal: true,
        });

        let status = scheduler.step(&mut backend, WINDOW, 0.0).unwrap();

        assert_eq!(
            status,
            FrameStatus::Presented {
                swapchain_rebuilt: true
            }
        );
        assert_eq!(
            &backend.events[backend.events.len() - 2..],
            &[Event::Present(0, 1), Event::Recreate(800, 600)]
        );
        assert_eq!(scheduler.current_frame(), 1);
    }

    #[test]
    fn present_results_trigger_rebuild() {
        for outcome in [PresentOutcome::Suboptimal, PresentOutcome::OutOfDate] {
            let mut scheduler = FrameScheduler::new(2).unwrap();
            let mut backend = ScriptedBackend::default();
            backend.presents.push_back(outcome);

            let status = scheduler.step(&mut backend, WINDOW, 0.0).unwrap();
            assert_eq!(
                status,
                FrameStatus::Presented {
                    swapchain_rebuilt: true
                }
            );
            assert_eq!(backend.events.last(), Some(&Event::Recreate(800, 600)));
        }
    }

    #[test]
    fn resize_rebuilds_at_new_extent() {
        let mut scheduler = FrameScheduler::new(2).unwrap();
        let mut backend = ScriptedBackend::default();

        scheduler.step(&mut backend, WINDOW, 0.0).unwrap();
        backend.clear();

        let resized = vk::Extent2D {
            width: 1024,
            height: 768,
        };
        scheduler.request_resize();
        backend.presents.push_back(PresentOutcome::Suboptimal);
        scheduler.step(&mut backend, resized, 0.1).unwrap();

        let rebuilds: Vec<_> = backend
            .events
            .iter()
            .filter(|e| matches!(e, Event::Recreate(..)))
            .collect();
        assert_eq!(rebuilds, vec![&Event::Recreate(1024, 768)]);
        assert_eq!(backend.extent, Some(resized));

        // Resize flag is cleared; later frames render without rebuilding
        backend.clear();
        for frame in 0..4 {
            let status = scheduler.step(&mut backend, resized, 0.2 + frame as f32).unwrap();
            assert_eq!(
                status,
                FrameStatus::Presented {
                    swapchain_rebuilt: false
                }
            );
        }
        assert!(!backend.events.iter().any(|e| matches!(e, Event::Recreate(..))));
    }

    #[test]
    fn resize_request_survives_minimization() {
        let mut scheduler = FrameScheduler::new(1).unwrap();
        let mut backend = ScriptedBackend::default();

        scheduler.request_resize();
        let minimized = vk::Extent2D {
            width: 0,
            height: 0,
        };
        assert_eq!(
            scheduler.step(&mut backend, minimized, 0.0).unwrap(),
            FrameStatus::Minimized
        );

        let status = scheduler.step(&mut backend, WINDOW, 0.0).unwrap();
        assert_eq!(
            status,
            FrameStatus::Presented {
                swapchain_rebuilt: true
            }
        );
    }
}
