//! Boundary between camera-like producers and the render thread.
//!
//! A source asks the [`FrameProvider`] for a [`FrameSink`] once it knows its
//! frame size, then submits RGBA frames from its own thread. Submission only
//! queues the frame and raises the redraw signal; the upload happens when the
//! render thread next updates the video texture.

use std::sync::{Arc, Weak};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::VideoError;
use crate::handoff::FrameSignal;
use crate::types::{Extent, TextureTransform};

/// Frames buffered between a source and the render thread. Older frames are
/// evicted once this many are queued.
pub const FRAME_QUEUE_DEPTH: usize = 3;

/// One camera frame: top-row-first RGBA8 pixels plus the sampling transform.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub size: Extent,
    pub pixels: Vec<u8>,
    pub transform: TextureTransform,
}

/// Which physical camera a source should stream from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Facing {
    #[default]
    Back,
    Front,
}

impl Facing {
    pub fn toggled(self) -> Self {
        match self {
            Facing::Back => Facing::Front,
            Facing::Front => Facing::Back,
        }
    }

    /// Front cameras are shown mirrored.
    pub fn transform(self) -> TextureTransform {
        match self {
            Facing::Back => TextureTransform::IDENTITY,
            Facing::Front => TextureTransform::MIRROR_X,
        }
    }
}

/// A producer of video frames, such as a camera.
pub trait VideoSource: Send {
    /// Starts streaming into surfaces negotiated through `provider`.
    fn start(&mut self, provider: FrameProvider) -> Result<(), VideoError>;
    /// Rebinds the stream to another camera.
    fn set_facing(&mut self, facing: Facing);
    fn stop(&mut self);
}

/// Render-thread end of the frame queue.
///
/// The feed is the only strong owner of the receiver. Once it is dropped the
/// queue disconnects and sinks report [`VideoError::Disconnected`].
#[derive(Debug)]
pub struct FrameFeed {
    rx: Arc<Receiver<VideoFrame>>,
}

impl FrameFeed {
    /// The newest queued frame; older ones are discarded.
    pub fn latest(&self) -> Option<VideoFrame> {
        self.rx.try_iter().last()
    }
}

/// Negotiates frame surfaces for the render thread's video texture.
#[derive(Debug, Clone)]
pub struct FrameProvider {
    tx: Sender<VideoFrame>,
    rx: Weak<Receiver<VideoFrame>>,
    signal: FrameSignal,
}

impl FrameProvider {
    pub(crate) fn new(signal: FrameSignal) -> (Self, FrameFeed) {
        let (tx, rx) = bounded(FRAME_QUEUE_DEPTH);
        let rx = Arc::new(rx);
        let provider = Self {
            tx,
            rx: Arc::downgrade(&rx),
            signal,
        };
        (provider, FrameFeed { rx })
    }

    /// Called by the source once the frame size is known; may be called
    /// again later to renegotiate.
    pub fn request_surface(&self, width: u32, height: u32) -> Result<FrameSink, VideoError> {
        let size = Extent::new(width, height);
        if size.is_empty() {
            return Err(VideoError::EmptySurface);
        }
        tracing::debug!(width, height, "video surface negotiated");
        Ok(FrameSink {
            size,
            tx: self.tx.clone(),
            evict: Weak::clone(&self.rx),
            signal: self.signal.clone(),
        })
    }
}

/// Producer end of a negotiated video surface.
#[derive(Debug, Clone)]
pub struct FrameSink {
    size: Extent,
    tx: Sender<VideoFrame>,
    evict: Weak<Receiver<VideoFrame>>,
    signal: FrameSignal,
}

impl FrameSink {
    pub fn size(&self) -> Extent {
        self.size
    }

    /// Queues a frame and raises the frame-ready signal.
    pub fn submit(&self, pixels: Vec<u8>, transform: TextureTransform) -> Result<(), VideoError> {
        let expected = self.size.pixel_count() * 4;
        if pixels.len() != expected {
            return Err(VideoError::FrameSize {
                size: self.size,
                expected,
                actual: pixels.len(),
            });
        }

        let mut frame = VideoFrame {
            size: self.size,
            pixels,
            transform,
        };
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    if let Some(rx) = self.evict.upgrade() {
                        let _ = rx.try_recv();
                    }
                    frame = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return Err(VideoError::Disconnected),
            }
        }

        self.signal.notify();
        Ok(())
    }
}
