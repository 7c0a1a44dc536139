//! Lock-free handoffs from UI, export and video threads into the render thread.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use image::RgbaImage;

use crate::types::RenderMode;

const NO_PENDING_MODE: u8 = 0;
const PENDING_PREVIEW: u8 = 1;
const PENDING_ACCUMULATE: u8 = 2;

/// Single-slot mailbox for the next render mode. The last write wins.
#[derive(Debug, Default)]
pub struct PendingMode {
    slot: AtomicU8,
}

impl PendingMode {
    pub fn request(&self, mode: RenderMode) {
        self.slot.store(encode(mode), Ordering::Release);
    }

    /// Puts back a request that could not be applied. A request made since
    /// it was taken is newer and wins.
    pub fn restore(&self, mode: RenderMode) {
        let _ = self.slot.compare_exchange(
            NO_PENDING_MODE,
            encode(mode),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Consumes the pending mode, if any.
    pub fn take(&self) -> Option<RenderMode> {
        match self.slot.swap(NO_PENDING_MODE, Ordering::AcqRel) {
            PENDING_PREVIEW => Some(RenderMode::Preview),
            PENDING_ACCUMULATE => Some(RenderMode::Accumulate),
            _ => None,
        }
    }
}

fn encode(mode: RenderMode) -> u8 {
    match mode {
        RenderMode::Preview => PENDING_PREVIEW,
        RenderMode::Accumulate => PENDING_ACCUMULATE,
    }
}

/// Callback invoked on the render thread with the composed frame.
pub type SnapshotCallback = Box<dyn FnOnce(&RgbaImage) + Send + 'static>;

/// Unbounded queue of snapshot requests drained once per frame.
pub struct SnapshotQueue {
    tx: Sender<SnapshotCallback>,
    rx: Receiver<SnapshotCallback>,
}

impl SnapshotQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub(crate) fn sender(&self) -> Sender<SnapshotCallback> {
        self.tx.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Everything queued at the time of the call.
    pub fn drain(&self) -> Vec<SnapshotCallback> {
        self.rx.try_iter().collect()
    }
}

impl Default for SnapshotQueue {
    fn default() -> Self {
        Self::new()
    }
}

type Waker = Arc<dyn Fn() + Send + Sync>;

/// Redraw request shared between producers and the frame driver.
///
/// Raising the signal sets a dirty flag and calls the waker, which the window
/// driver wires to an event-loop proxy. Headless drivers poll the flag.
#[derive(Clone)]
pub struct FrameSignal {
    dirty: Arc<AtomicBool>,
    waker: Option<Waker>,
}

impl FrameSignal {
    pub fn new() -> Self {
        Self {
            dirty: Arc::new(AtomicBool::new(false)),
            waker: None,
        }
    }

    pub fn with_waker<F>(waker: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            dirty: Arc::new(AtomicBool::new(false)),
            waker: Some(Arc::new(waker)),
        }
    }

    pub fn notify(&self) {
        self.dirty.store(true, Ordering::Release);
        if let Some(waker) = &self.waker {
            waker();
        }
    }

    /// Clears the flag and reports whether a redraw was requested.
    pub fn take(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

impl Default for FrameSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSignal")
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .field("has_waker", &self.waker.is_some())
            .finish()
    }
}

/// Cloneable, `Send` control surface for a running compositor.
#[derive(Clone)]
pub struct CompositorHandle {
    pending: Arc<PendingMode>,
    snapshots: Sender<SnapshotCallback>,
    signal: FrameSignal,
}

impl CompositorHandle {
    pub(crate) fn new(
        pending: Arc<PendingMode>,
        snapshots: Sender<SnapshotCallback>,
        signal: FrameSignal,
    ) -> Self {
        Self {
            pending,
            snapshots,
            signal,
        }
    }

    /// Schedules a mode change for the start of the next frame.
    pub fn request_mode(&self, mode: RenderMode) {
        self.pending.request(mode);
        self.signal.notify();
    }

    /// Queues `callback` to receive the next composed frame.
    ///
    /// No redraw is requested: the callback fires after whatever frame the
    /// driver renders next.
    pub fn request_snapshot<F>(&self, callback: F)
    where
        F: FnOnce(&RgbaImage) + Send + 'static,
    {
        if self.snapshots.send(Box::new(callback)).is_err() {
            tracing::warn!("snapshot requested after the compositor shut down");
        }
    }

    /// Channel flavour of [`Self::request_snapshot`].
    pub fn request_snapshot_channel(&self) -> Receiver<RgbaImage> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.request_snapshot(move |image| {
            let _ = tx.send(image.clone());
        });
        rx
    }

    pub fn signal(&self) -> &FrameSignal {
        &self.signal
    }
}

impl std::fmt::Debug for CompositorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositorHandle")
            .field("pending_snapshots", &self.snapshots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn pending_mode_last_write_wins() {
        let pending = PendingMode::default();
        assert_eq!(pending.take(), None);
        pending.request(RenderMode::Accumulate);
        pending.request(RenderMode::Preview);
        pending.request(RenderMode::Accumulate);
        assert_eq!(pending.take(), Some(RenderMode::Accumulate));
        assert_eq!(pending.take(), None);
    }

    #[test]
    fn restore_never_overrides_a_newer_request() {
        let pending = PendingMode::default();
        pending.restore(RenderMode::Accumulate);
        assert_eq!(pending.take(), Some(RenderMode::Accumulate));

        pending.request(RenderMode::Preview);
        pending.restore(RenderMode::Accumulate);
        assert_eq!(pending.take(), Some(RenderMode::Preview));
    }

    #[test]
    fn pending_mode_accepts_writes_from_other_threads() {
        let pending = Arc::new(PendingMode::default());
        let writer = {
            let pending = Arc::clone(&pending);
            std::thread::spawn(move || pending.request(RenderMode::Accumulate))
        };
        writer.join().unwrap();
        assert_eq!(pending.take(), Some(RenderMode::Accumulate));
    }

    #[test]
    fn frame_signal_calls_waker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let signal = {
            let calls = Arc::clone(&calls);
            FrameSignal::with_waker(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let clone = signal.clone();
        clone.notify();
        clone.notify();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[test]
    fn request_mode_raises_signal() {
        let queue = SnapshotQueue::new();
        let handle = CompositorHandle::new(
            Arc::new(PendingMode::default()),
            queue.sender(),
            FrameSignal::new(),
        );
        handle.request_mode(RenderMode::Accumulate);
        assert!(handle.signal().take());
        handle.request_snapshot(|_| {});
        handle.request_snapshot(|_| {});
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
    }
}
