//! Preview/Accumulate state machine and the per-frame pipeline.

use std::sync::Arc;

use crate::backend::{DrawCall, DrawTarget, ProgramId, ProgramKind, RenderBackend};
use crate::compile::build_program_for;
use crate::error::RenderError;
use crate::handoff::{CompositorHandle, FrameSignal, PendingMode, SnapshotQueue};
use crate::snapshot::{read_snapshot, PixelRect};
use crate::texture::{
    RenderTarget, SampledTexture, VideoTexture, CURRENT_TARGET_UNIT, PREVIOUS_TARGET_UNIT,
};
use crate::types::{Extent, RenderMode};
use crate::video::FrameProvider;

struct Programs {
    preview: ProgramId,
    accumulate: ProgramId,
    present: ProgramId,
}

impl Programs {
    /// `history` stands in for either accumulation target; both share a kind.
    fn build<B: RenderBackend + ?Sized>(
        backend: &mut B,
        video: &VideoTexture,
        history: &RenderTarget,
    ) -> Result<Self, RenderError> {
        let video: &dyn SampledTexture = video;
        let history: &dyn SampledTexture = history;
        Ok(Self {
            preview: build_program_for(backend, ProgramKind::Preview, &[video])?,
            accumulate: build_program_for(backend, ProgramKind::Accumulate, &[video, history])?,
            present: build_program_for(backend, ProgramKind::Present, &[history])?,
        })
    }
}

/// What a call to [`Compositor::draw_frame`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub frame_index: u64,
    pub mode: RenderMode,
    /// The accumulation history was discarded at the start of this frame.
    pub reset: bool,
    pub video_updated: bool,
    pub snapshots_delivered: usize,
}

/// Owns every piece of render-thread state.
///
/// Other threads talk to it through [`CompositorHandle`] and
/// [`FrameProvider`]; nothing here is shared.
pub struct Compositor<B: RenderBackend> {
    backend: B,
    programs: Programs,
    video: VideoTexture,
    provider: FrameProvider,
    current: RenderTarget,
    previous: RenderTarget,
    mode: RenderMode,
    pending: Arc<PendingMode>,
    snapshots: SnapshotQueue,
    signal: FrameSignal,
    frame_index: u64,
}

impl<B: RenderBackend> Compositor<B> {
    /// Links the programs and allocates the accumulation pair at the
    /// backend's surface size. Program build errors are fatal.
    pub fn new(mut backend: B, signal: FrameSignal) -> Result<Self, RenderError> {
        let viewport = backend.surface_size();
        let (provider, frames) = FrameProvider::new(signal.clone());
        let video = VideoTexture::new(&mut backend, frames)?;
        let current =
            RenderTarget::create(&mut backend, CURRENT_TARGET_UNIT, "accumulation a", viewport)?;
        let previous =
            RenderTarget::create(&mut backend, PREVIOUS_TARGET_UNIT, "accumulation b", viewport)?;
        let programs = Programs::build(&mut backend, &video, &previous)?;
        tracing::debug!(width = viewport.width, height = viewport.height, "compositor ready");

        Ok(Self {
            backend,
            programs,
            video,
            provider,
            current,
            previous,
            mode: RenderMode::Preview,
            pending: Arc::new(PendingMode::default()),
            snapshots: SnapshotQueue::new(),
            signal,
            frame_index: 0,
        })
    }

    pub fn handle(&self) -> CompositorHandle {
        CompositorHandle::new(
            Arc::clone(&self.pending),
            self.snapshots.sender(),
            self.signal.clone(),
        )
    }

    /// Surface negotiation endpoint for video sources.
    pub fn frame_provider(&self) -> FrameProvider {
        self.provider.clone()
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    pub fn viewport(&self) -> Extent {
        self.backend.surface_size()
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// The target drawn into next frame, then the history it blends against.
    pub fn targets(&self) -> (&RenderTarget, &RenderTarget) {
        (&self.current, &self.previous)
    }

    pub fn pending_snapshots(&self) -> usize {
        self.snapshots.len()
    }

    /// Reconfigures the surface and resizes both accumulation targets before
    /// the next draw. Zero-area sizes are ignored.
    pub fn resize(&mut self, size: Extent) -> Result<(), RenderError> {
        if size.is_empty() {
            return Ok(());
        }
        self.backend.configure_surface(size)?;
        self.current.resize(&mut self.backend, size)?;
        self.previous.resize(&mut self.backend, size)?;
        tracing::debug!(width = size.width, height = size.height, "viewport resized");
        Ok(())
    }

    /// Renders one frame: latch video, apply any pending mode, run the mode's
    /// passes, service snapshot requests, present.
    pub fn draw_frame(&mut self) -> Result<FrameReport, RenderError> {
        self.backend.begin_frame()?;
        let video_updated = self.video.update(&mut self.backend)?;
        let reset = self.apply_pending_mode()?;

        match self.mode {
            RenderMode::Preview => self.draw_preview()?,
            RenderMode::Accumulate => self.draw_accumulate()?,
        }

        self.backend.submit()?;
        let snapshots_delivered = self.service_snapshots();
        self.backend.present()?;

        let report = FrameReport {
            frame_index: self.frame_index,
            mode: self.mode,
            reset,
            video_updated,
            snapshots_delivered,
        };
        self.frame_index += 1;
        Ok(report)
    }

    fn apply_pending_mode(&mut self) -> Result<bool, RenderError> {
        let Some(requested) = self.pending.take() else {
            return Ok(false);
        };
        if requested == self.mode {
            return Ok(false);
        }
        let reset = self
            .current
            .reset_history(&mut self.backend)
            .and_then(|()| self.previous.reset_history(&mut self.backend));
        if let Err(err) = reset {
            // Retried next frame unless a newer request arrived meanwhile.
            self.pending.restore(requested);
            tracing::error!(from = %self.mode, to = %requested, error = %err, "mode change failed");
            return Err(err);
        }
        tracing::info!(from = %self.mode, to = %requested, "render mode changed");
        self.mode = requested;
        Ok(true)
    }

    fn draw_preview(&mut self) -> Result<(), RenderError> {
        let video = self.video.info();
        self.backend.bind_target(DrawTarget::Surface);
        self.backend.draw(&DrawCall {
            program: self.programs.preview,
            textures: &[video.handle],
            transform: video.transform,
        })
    }

    fn draw_accumulate(&mut self) -> Result<(), RenderError> {
        let viewport = self.backend.surface_size();
        ensure_matches_viewport(&self.current, viewport)?;
        ensure_matches_viewport(&self.previous, viewport)?;

        let video = self.video.info();
        let history = self.previous.handle();
        let program = self.programs.accumulate;
        self.current.render_into(&mut self.backend, |backend| {
            backend.draw(&DrawCall {
                program,
                textures: &[video.handle, history],
                transform: video.transform,
            })
        })?;

        // The freshly blended target becomes next frame's history.
        RenderTarget::swap_roles(&mut self.current, &mut self.previous);

        self.backend.bind_target(DrawTarget::Surface);
        self.backend.draw(&DrawCall {
            program: self.programs.present,
            textures: &[self.previous.handle()],
            transform: self.previous.info().transform,
        })
    }

    fn service_snapshots(&mut self) -> usize {
        if self.snapshots.is_empty() {
            return 0;
        }
        let callbacks = self.snapshots.drain();
        let rect = PixelRect::full(self.backend.surface_size());
        match read_snapshot(&mut self.backend, rect) {
            Ok(image) => {
                let delivered = callbacks.len();
                for callback in callbacks {
                    callback(&image);
                }
                tracing::debug!(
                    delivered,
                    width = image.width(),
                    height = image.height(),
                    "delivered snapshot"
                );
                delivered
            }
            Err(err) => {
                tracing::error!(
                    error = %err,
                    dropped = callbacks.len(),
                    "snapshot readback failed; dropping requests"
                );
                0
            }
        }
    }
}

fn ensure_matches_viewport(target: &RenderTarget, viewport: Extent) -> Result<(), RenderError> {
    if target.size() == viewport {
        Ok(())
    } else {
        Err(RenderError::TargetSizeMismatch {
            target: target.size(),
            viewport,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::backend::{ChannelOrder, PixelLayout, RowOrder};
    use crate::blend::luminance_gated_mix;
    use crate::software::SoftwareBackend;
    use crate::types::TextureTransform;
    use crate::video::FrameSink;

    fn compositor(width: u32, height: u32) -> Compositor<SoftwareBackend> {
        Compositor::new(
            SoftwareBackend::new(Extent::new(width, height)),
            FrameSignal::new(),
        )
        .unwrap()
    }

    fn sink(compositor: &Compositor<SoftwareBackend>, width: u32, height: u32) -> FrameSink {
        compositor
            .frame_provider()
            .request_surface(width, height)
            .unwrap()
    }

    fn solid(sink: &FrameSink, color: [u8; 4]) {
        let pixels = color.repeat(sink.size().pixel_count());
        sink.submit(pixels, TextureTransform::IDENTITY).unwrap();
    }

    fn to_unit(color: [u8; 4]) -> [f32; 4] {
        color.map(|c| f32::from(c) / 255.0)
    }

    fn to_bytes(color: [f32; 4]) -> [u8; 4] {
        color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
    }

    #[test]
    fn preview_snapshot_matches_solid_frame() {
        let mut compositor = compositor(4, 3);
        let sink = sink(&compositor, 2, 2);
        solid(&sink, [200, 40, 10, 255]);

        let rx = compositor.handle().request_snapshot_channel();
        let report = compositor.draw_frame().unwrap();
        assert_eq!(report.mode, RenderMode::Preview);
        assert_eq!(report.snapshots_delivered, 1);

        let image = rx.try_recv().unwrap();
        assert_eq!(image.dimensions(), (4, 3));
        assert!(image.pixels().all(|p| p.0 == [200, 40, 10, 255]));
    }

    fn top_marked_snapshot(layout: PixelLayout) -> image::RgbaImage {
        let backend = SoftwareBackend::new(Extent::new(2, 2)).with_readback_layout(layout);
        let mut compositor = Compositor::new(backend, FrameSignal::new()).unwrap();
        let sink = sink(&compositor, 1, 2);
        let mut pixels = vec![255, 0, 0, 255];
        pixels.extend_from_slice(&[0, 0, 255, 255]);
        sink.submit(pixels, TextureTransform::IDENTITY).unwrap();
        let rx = compositor.handle().request_snapshot_channel();
        compositor.draw_frame().unwrap();
        rx.try_recv().unwrap()
    }

    #[test]
    fn snapshot_row_zero_is_top_for_every_layout() {
        for layout in [
            PixelLayout {
                channels: ChannelOrder::Rgba,
                rows: RowOrder::BottomUp,
            },
            PixelLayout {
                channels: ChannelOrder::Bgra,
                rows: RowOrder::TopDown,
            },
            PixelLayout {
                channels: ChannelOrder::Bgra,
                rows: RowOrder::BottomUp,
            },
        ] {
            let image = top_marked_snapshot(layout);
            assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0, 255], "{layout:?}");
            assert_eq!(image.get_pixel(1, 1).0, [0, 0, 255, 255], "{layout:?}");
        }
    }

    #[test]
    fn pending_mode_is_applied_at_frame_start() {
        let mut compositor = compositor(2, 2);
        compositor.handle().request_mode(RenderMode::Accumulate);
        assert_eq!(compositor.mode(), RenderMode::Preview);
        let report = compositor.draw_frame().unwrap();
        assert!(report.reset);
        assert_eq!(report.mode, RenderMode::Accumulate);

        compositor.handle().request_mode(RenderMode::Accumulate);
        assert!(!compositor.draw_frame().unwrap().reset);
    }

    #[test]
    fn every_transition_recreates_both_targets() {
        let mut compositor = compositor(2, 2);
        let handle = compositor.handle();
        let mut seen = vec![];
        {
            let (a, b) = compositor.targets();
            seen.push(a.handle());
            seen.push(b.handle());
        }
        for (step, mode) in [
            RenderMode::Accumulate,
            RenderMode::Preview,
            RenderMode::Accumulate,
        ]
        .into_iter()
        .enumerate()
        {
            let before = compositor.backend().stats().textures_destroyed;
            handle.request_mode(mode);
            assert!(compositor.draw_frame().unwrap().reset, "step {step}");
            assert_eq!(compositor.backend().stats().textures_destroyed, before + 2);
            let (a, b) = compositor.targets();
            assert!(!seen.contains(&a.handle()) && !seen.contains(&b.handle()));
            seen.push(a.handle());
            seen.push(b.handle());
        }
        // Video texture plus the live accumulation pair.
        assert_eq!(compositor.backend().live_textures(), 3);
    }

    #[test]
    fn reentering_accumulate_starts_from_black() {
        let mut compositor = compositor(2, 2);
        let sink = sink(&compositor, 2, 2);
        let handle = compositor.handle();

        handle.request_mode(RenderMode::Accumulate);
        for _ in 0..5 {
            solid(&sink, [255, 255, 255, 255]);
            compositor.draw_frame().unwrap();
        }
        handle.request_mode(RenderMode::Preview);
        compositor.draw_frame().unwrap();

        let live = [128, 128, 128, 255];
        handle.request_mode(RenderMode::Accumulate);
        solid(&sink, live);
        compositor.draw_frame().unwrap();

        let expected = to_bytes(luminance_gated_mix(to_unit(live), [0.0, 0.0, 0.0, 1.0]));
        let surface = compositor.backend().surface_pixels();
        assert_eq!(&surface[..4], &expected);
    }

    #[test]
    fn accumulation_keeps_highlights() {
        let mut compositor = compositor(1, 1);
        let sink = sink(&compositor, 1, 1);
        compositor.handle().request_mode(RenderMode::Accumulate);

        solid(&sink, [255, 255, 255, 255]);
        compositor.draw_frame().unwrap();
        assert_eq!(&compositor.backend().surface_pixels()[..4], &[252, 252, 252, 255]);

        for _ in 0..10 {
            solid(&sink, [0, 0, 0, 255]);
            compositor.draw_frame().unwrap();
        }
        let value = compositor.backend().surface_pixels()[0];
        assert!(value > 200, "trail faded too fast: {value}");
    }

    #[test]
    fn blended_target_becomes_history() {
        let mut compositor = compositor(2, 1);
        let sink = sink(&compositor, 2, 1);
        compositor.handle().request_mode(RenderMode::Accumulate);
        solid(&sink, [90, 10, 10, 255]);
        compositor.draw_frame().unwrap();

        let (_, history) = compositor.targets();
        let history = compositor
            .backend()
            .texture_pixels(history.handle())
            .unwrap()
            .to_vec();
        assert_eq!(history, compositor.backend().surface_pixels());
        assert_eq!(compositor.targets().0.info().unit, CURRENT_TARGET_UNIT);
        assert_eq!(compositor.targets().1.info().unit, PREVIOUS_TARGET_UNIT);
    }

    #[test]
    fn resize_applies_to_both_targets_before_next_draw() {
        let mut compositor = compositor(4, 4);
        compositor.handle().request_mode(RenderMode::Accumulate);
        compositor.draw_frame().unwrap();

        compositor.resize(Extent::new(7, 5)).unwrap();
        let (a, b) = compositor.targets();
        assert_eq!(a.size(), Extent::new(7, 5));
        assert_eq!(b.size(), Extent::new(7, 5));
        for target in [a.handle(), b.handle()] {
            assert_eq!(compositor.backend().texture_size(target), Some(Extent::new(7, 5)));
        }
        compositor.draw_frame().unwrap();

        compositor.resize(Extent::new(0, 9)).unwrap();
        assert_eq!(compositor.viewport(), Extent::new(7, 5));
    }

    #[test]
    fn failed_mode_change_keeps_targets_and_retries() {
        let mut compositor = compositor(2, 2);
        let sink = sink(&compositor, 2, 2);
        solid(&sink, [60, 60, 60, 255]);
        compositor.draw_frame().unwrap();

        // Only the first of the two replacement targets can be allocated.
        compositor.backend_mut().limit_allocations(Some(1));
        compositor.handle().request_mode(RenderMode::Accumulate);
        let err = compositor.draw_frame().unwrap_err();
        assert!(matches!(err, RenderError::FramebufferIncomplete { .. }));
        assert_eq!(compositor.mode(), RenderMode::Preview);
        {
            let (a, b) = compositor.targets();
            assert!(compositor.backend().texture_pixels(a.handle()).is_some());
            assert!(compositor.backend().texture_pixels(b.handle()).is_some());
        }

        compositor.backend_mut().limit_allocations(None);
        solid(&sink, [60, 60, 60, 255]);
        let report = compositor.draw_frame().unwrap();
        assert!(report.reset);
        assert_eq!(report.mode, RenderMode::Accumulate);
        assert_eq!(compositor.backend().live_textures(), 3);
    }

    #[test]
    fn programs_take_sampler_kinds_from_their_textures() {
        let compositor = compositor(2, 2);
        let backend = compositor.backend();
        let fragment = |program| backend.program_source(program).unwrap().fragment.clone();

        let preview = fragment(compositor.programs.preview);
        assert!(preview.contains("videoSampler2D(u_texture0"));

        let accumulate = fragment(compositor.programs.accumulate);
        assert!(accumulate.contains("videoSampler2D(u_texture0"));
        assert!(accumulate.contains("texture(sampler2D(u_texture1"));

        let present = fragment(compositor.programs.present);
        assert!(present.contains("texture(sampler2D(u_texture0"));
        assert!(!present.contains("videoSampler2D(u_texture0"));
    }

    #[test]
    fn mismatched_target_is_refused() {
        let mut compositor = compositor(4, 4);
        compositor.handle().request_mode(RenderMode::Accumulate);
        compositor
            .backend_mut()
            .configure_surface(Extent::new(3, 3))
            .unwrap();
        let err = compositor.draw_frame().unwrap_err();
        assert!(matches!(err, RenderError::TargetSizeMismatch { .. }));
    }

    #[test]
    fn every_queued_snapshot_gets_the_same_frame() {
        let mut compositor = compositor(3, 2);
        let sink = sink(&compositor, 3, 2);
        solid(&sink, [1, 2, 3, 255]);
        let handle = compositor.handle();
        let receivers: Vec<_> = (0..4).map(|_| handle.request_snapshot_channel()).collect();
        assert_eq!(compositor.pending_snapshots(), 4);

        let report = compositor.draw_frame().unwrap();
        assert_eq!(report.snapshots_delivered, 4);
        assert_eq!(compositor.pending_snapshots(), 0);

        let images: Vec<_> = receivers.iter().map(|rx| rx.try_recv().unwrap()).collect();
        assert!(images.windows(2).all(|pair| pair[0] == pair[1]));

        assert_eq!(compositor.draw_frame().unwrap().snapshots_delivered, 0);
    }

    #[test]
    fn failed_readback_drops_requests() {
        let mut compositor = compositor(2, 2);
        compositor.backend_mut().fail_readbacks(true);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            compositor.handle().request_snapshot(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        let report = compositor.draw_frame().unwrap();
        assert_eq!(report.snapshots_delivered, 0);
        assert_eq!(compositor.pending_snapshots(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(compositor.backend().stats().frames_presented, 1);
    }

    #[test]
    fn snapshot_callback_can_end_the_exposure() {
        let mut compositor = compositor(2, 2);
        let sink = sink(&compositor, 2, 2);
        let handle = compositor.handle();
        handle.request_mode(RenderMode::Accumulate);
        solid(&sink, [255, 255, 255, 255]);
        compositor.draw_frame().unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let stopper = handle.clone();
        handle.request_snapshot(move |image| {
            let _ = tx.send(image.get_pixel(0, 0).0);
            stopper.request_mode(RenderMode::Preview);
        });
        solid(&sink, [0, 0, 0, 255]);
        let report = compositor.draw_frame().unwrap();
        assert_eq!(report.mode, RenderMode::Accumulate);
        assert!(rx.try_recv().unwrap()[0] > 240);

        let report = compositor.draw_frame().unwrap();
        assert_eq!(report.mode, RenderMode::Preview);
        assert!(report.reset);
    }
}
