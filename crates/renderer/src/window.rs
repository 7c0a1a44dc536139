use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use image::RgbaImage;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoopBuilder};
use winit::keyboard::{Key, NamedKey};
use winit::window::WindowBuilder;

use tracing::{error, info, warn};

use crate::backend::RenderBackend;
use crate::compositor::{Compositor, FrameReport};
use crate::gpu::WgpuBackend;
use crate::handoff::{CompositorHandle, FrameSignal};
use crate::types::{Extent, RendererConfig, RenderMode};
use crate::video::{Facing, VideoSource};

#[derive(Debug, Clone, Copy)]
enum UserEvent {
    FrameAvailable,
}

/// What a key press asks the preview window to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyAction {
    Shutter,
    ToggleFacing,
    Quit,
}

pub(crate) fn key_action(key: &Key) -> Option<KeyAction> {
    match key {
        Key::Named(NamedKey::Space) => Some(KeyAction::Shutter),
        Key::Named(NamedKey::Escape) => Some(KeyAction::Quit),
        Key::Character(value) if value.as_str() == " " => Some(KeyAction::Shutter),
        Key::Character(value) if value.eq_ignore_ascii_case("c") => {
            Some(KeyAction::ToggleFacing)
        }
        Key::Character(value) if value.eq_ignore_ascii_case("q") => Some(KeyAction::Quit),
        _ => None,
    }
}

/// Start/stop state of the exposure, tracked ahead of the compositor.
///
/// Mode requests only take effect on the next frame, so the compositor's
/// current mode can lag a press that was already handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Shutter {
    #[default]
    Idle,
    Open,
    /// A still has been requested; waiting for the drop back to preview.
    Closing,
}

impl Shutter {
    /// Starts an exposure, or ends the running one.
    ///
    /// Ending captures the next composed frame, hands it to `captures`, then
    /// drops back to preview so the still reflects the finished exposure.
    /// Presses while a still is in flight are ignored.
    pub(crate) fn press(&mut self, handle: &CompositorHandle, captures: &Sender<RgbaImage>) {
        match *self {
            Shutter::Idle => {
                info!("exposure started");
                handle.request_mode(RenderMode::Accumulate);
                *self = Shutter::Open;
            }
            Shutter::Open => {
                let captures = captures.clone();
                let control = handle.clone();
                handle.request_snapshot(move |image| {
                    if captures.send(image.clone()).is_err() {
                        warn!("capture receiver dropped; still discarded");
                    }
                    control.request_mode(RenderMode::Preview);
                });
                handle.signal().notify();
                info!("exposure stopping; capturing still");
                *self = Shutter::Closing;
            }
            Shutter::Closing => info!("still capture in progress; shutter ignored"),
        }
    }

    /// Follows a presented frame. A closing shutter settles once preview is
    /// back, or reopens when the still could not be read back.
    pub(crate) fn observe(&mut self, report: &FrameReport) {
        if *self != Shutter::Closing {
            return;
        }
        match report.mode {
            RenderMode::Preview => *self = Shutter::Idle,
            RenderMode::Accumulate if report.snapshots_delivered == 0 => {
                warn!("still capture failed; exposure continues");
                *self = Shutter::Open;
            }
            RenderMode::Accumulate => {}
        }
    }

    pub(crate) fn is_idle(self) -> bool {
        self == Shutter::Idle
    }
}

/// Opens the preview window and drives the compositor until it is closed.
///
/// Space starts and stops an exposure, C switches camera while previewing,
/// Escape quits. Every finished exposure is sent on `captures`.
pub fn run_window(
    config: RendererConfig,
    mut source: Box<dyn VideoSource>,
    captures: Sender<RgbaImage>,
) -> Result<()> {
    let event_loop = EventLoopBuilder::<UserEvent>::with_user_event()
        .build()
        .map_err(|err| anyhow!("failed to create event loop: {err}"))?;
    let proxy = Mutex::new(event_loop.create_proxy());
    let signal = FrameSignal::with_waker(move || {
        if let Ok(proxy) = proxy.lock() {
            let _ = proxy.send_event(UserEvent::FrameAvailable);
        }
    });

    let window_size = PhysicalSize::new(config.surface_size.0, config.surface_size.1);
    let window = WindowBuilder::new()
        .with_title(config.title.as_str())
        .with_inner_size(window_size)
        .build(&event_loop)
        .map_err(|err| anyhow!("failed to create preview window: {err}"))?;
    let window = Arc::new(window);

    let size = window.inner_size();
    let backend = WgpuBackend::windowed(
        Arc::clone(&window),
        Extent::new(size.width, size.height),
        config.power,
        config.vsync,
    )?;
    info!(adapter = backend.adapter_name(), "preview window ready");
    let mut compositor = Compositor::new(backend, signal)?;
    let handle = compositor.handle();
    source.start(compositor.frame_provider())?;

    let mut facing = Facing::default();
    let mut shutter = Shutter::default();
    let mut shown_mode = compositor.mode();
    let run_result = event_loop.run(move |event, elwt| {
        elwt.set_control_flow(ControlFlow::Wait);
        match event {
            Event::UserEvent(UserEvent::FrameAvailable) => {
                window.request_redraw();
            }
            Event::WindowEvent { window_id, event } if window_id == window.id() => match event {
                WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                    elwt.exit();
                }
                WindowEvent::KeyboardInput { event, .. } => {
                    if event.state != ElementState::Pressed || event.repeat {
                        return;
                    }
                    match key_action(&event.logical_key) {
                        Some(KeyAction::Shutter) => shutter.press(&handle, &captures),
                        Some(KeyAction::ToggleFacing) => {
                            if shutter.is_idle() && compositor.mode() == RenderMode::Preview {
                                facing = facing.toggled();
                                info!(?facing, "switching camera");
                                source.set_facing(facing);
                            } else {
                                info!("camera switch ignored during exposure");
                            }
                        }
                        Some(KeyAction::Quit) => elwt.exit(),
                        None => {}
                    }
                }
                WindowEvent::Resized(new_size) => {
                    let size = Extent::new(new_size.width, new_size.height);
                    if let Err(err) = compositor.resize(size) {
                        error!("failed to resize compositor: {err}");
                    }
                    window.request_redraw();
                }
                WindowEvent::ScaleFactorChanged {
                    mut inner_size_writer,
                    ..
                } => {
                    let _ = inner_size_writer.request_inner_size(window.inner_size());
                }
                WindowEvent::RedrawRequested => match compositor.draw_frame() {
                    Ok(report) => {
                        shutter.observe(&report);
                        tracing::trace!(
                            frame = report.frame_index,
                            mode = %report.mode,
                            "frame presented"
                        );
                        if report.mode != shown_mode {
                            shown_mode = report.mode;
                            window.set_title(&format!("{} [{}]", config.title, shown_mode));
                        }
                    }
                    Err(err) if err.is_recoverable_surface_error() => {
                        let viewport = compositor.viewport();
                        if let Err(err) = compositor.backend_mut().configure_surface(viewport) {
                            error!("failed to reconfigure surface: {err}");
                        }
                        window.request_redraw();
                    }
                    Err(err) => {
                        error!("frame failed: {err}");
                    }
                },
                _ => {}
            },
            Event::LoopExiting => {
                source.stop();
            }
            _ => {}
        }
    });

    run_result.map_err(|err| anyhow!("window event loop error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareBackend;
    use crate::types::TextureTransform;
    use crate::video::FrameSink;

    #[test]
    fn keys_map_to_actions() {
        assert_eq!(
            key_action(&Key::Named(NamedKey::Space)),
            Some(KeyAction::Shutter)
        );
        assert_eq!(
            key_action(&Key::Character("C".into())),
            Some(KeyAction::ToggleFacing)
        );
        assert_eq!(
            key_action(&Key::Named(NamedKey::Escape)),
            Some(KeyAction::Quit)
        );
        assert_eq!(key_action(&Key::Character("x".into())), None);
    }

    fn lit_compositor() -> (Compositor<SoftwareBackend>, FrameSink) {
        let backend = SoftwareBackend::new(Extent::new(4, 4));
        let compositor = Compositor::new(backend, FrameSignal::new()).unwrap();
        let sink = compositor.frame_provider().request_surface(1, 1).unwrap();
        sink.submit(vec![255, 255, 255, 255], TextureTransform::IDENTITY)
            .unwrap();
        (compositor, sink)
    }

    fn draw(compositor: &mut Compositor<SoftwareBackend>, shutter: &mut Shutter) {
        let report = compositor.draw_frame().unwrap();
        shutter.observe(&report);
    }

    #[test]
    fn shutter_cycle_captures_then_returns_to_preview() {
        let (mut compositor, _sink) = lit_compositor();
        let handle = compositor.handle();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut shutter = Shutter::default();

        shutter.press(&handle, &tx);
        draw(&mut compositor, &mut shutter);
        assert_eq!(compositor.mode(), RenderMode::Accumulate);
        assert_eq!(shutter, Shutter::Open);

        shutter.press(&handle, &tx);
        draw(&mut compositor, &mut shutter);
        let still = rx.try_recv().unwrap();
        assert_eq!(still.dimensions(), (4, 4));
        assert_eq!(compositor.mode(), RenderMode::Accumulate);
        assert_eq!(shutter, Shutter::Closing);

        draw(&mut compositor, &mut shutter);
        assert_eq!(compositor.mode(), RenderMode::Preview);
        assert!(shutter.is_idle());
    }

    #[test]
    fn press_during_stop_is_ignored() {
        let (mut compositor, _sink) = lit_compositor();
        let handle = compositor.handle();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut shutter = Shutter::default();

        shutter.press(&handle, &tx);
        draw(&mut compositor, &mut shutter);
        shutter.press(&handle, &tx);
        draw(&mut compositor, &mut shutter);

        // The compositor still reports Accumulate until the next frame.
        shutter.press(&handle, &tx);
        assert_eq!(compositor.pending_snapshots(), 0);
        draw(&mut compositor, &mut shutter);
        draw(&mut compositor, &mut shutter);

        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(compositor.mode(), RenderMode::Preview);
        assert!(shutter.is_idle());
    }

    #[test]
    fn failed_still_reopens_the_shutter() {
        let (mut compositor, _sink) = lit_compositor();
        let handle = compositor.handle();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut shutter = Shutter::default();

        shutter.press(&handle, &tx);
        draw(&mut compositor, &mut shutter);
        compositor.backend_mut().fail_readbacks(true);
        shutter.press(&handle, &tx);
        draw(&mut compositor, &mut shutter);

        assert!(rx.try_recv().is_err());
        assert_eq!(shutter, Shutter::Open);
        assert_eq!(compositor.mode(), RenderMode::Accumulate);
    }
}
