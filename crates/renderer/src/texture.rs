//! Bindable textures: the live video texture and off-screen render targets.

use crate::backend::{DrawTarget, RenderBackend, TextureId};
use crate::error::RenderError;
use crate::types::{Extent, SamplerKind, TextureTransform};
use crate::video::FrameFeed;

/// Texture unit of the accumulation target being drawn this frame.
pub const CURRENT_TARGET_UNIT: u32 = 0;
/// Texture unit of the live video texture.
pub const VIDEO_UNIT: u32 = 1;
/// Texture unit of the accumulation history.
pub const PREVIOUS_TARGET_UNIT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureInfo {
    pub unit: u32,
    pub handle: TextureId,
    pub size: Extent,
    pub transform: TextureTransform,
}

/// Something a program can sample from.
pub trait SampledTexture {
    fn info(&self) -> TextureInfo;
    fn sampler_kind(&self) -> SamplerKind;

    fn handle(&self) -> TextureId {
        self.info().handle
    }
}

/// The external video-frame texture.
///
/// Storage starts as a 1x1 black placeholder and reports a 0x0 size until
/// the first frame arrives.
pub struct VideoTexture {
    handle: TextureId,
    size: Extent,
    transform: TextureTransform,
    frames: FrameFeed,
    uploaded: u64,
}

impl VideoTexture {
    pub fn new<B: RenderBackend + ?Sized>(
        backend: &mut B,
        frames: FrameFeed,
    ) -> Result<Self, RenderError> {
        let handle = backend.create_texture("video frame", Extent::new(1, 1))?;
        Ok(Self {
            handle,
            size: Extent::default(),
            transform: TextureTransform::IDENTITY,
            frames,
            uploaded: 0,
        })
    }

    /// Latches the newest queued frame, skipping older ones.
    ///
    /// Returns whether a new frame was uploaded. The transform is refreshed
    /// together with the pixels.
    pub fn update<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Result<bool, RenderError> {
        let Some(frame) = self.frames.latest() else {
            return Ok(false);
        };
        backend.upload_pixels(self.handle, frame.size, &frame.pixels)?;
        if frame.size != self.size {
            tracing::debug!(
                width = frame.size.width,
                height = frame.size.height,
                "video frame size changed"
            );
        }
        self.size = frame.size;
        self.transform = frame.transform;
        self.uploaded += 1;
        Ok(true)
    }

    pub fn frames_uploaded(&self) -> u64 {
        self.uploaded
    }
}

impl SampledTexture for VideoTexture {
    fn info(&self) -> TextureInfo {
        TextureInfo {
            unit: VIDEO_UNIT,
            handle: self.handle,
            size: self.size,
            transform: self.transform,
        }
    }

    fn sampler_kind(&self) -> SamplerKind {
        SamplerKind::ExternalVideo
    }
}

/// Off-screen RGBA8 color buffer that can be drawn into and sampled.
#[derive(Debug)]
pub struct RenderTarget {
    label: String,
    unit: u32,
    handle: TextureId,
    size: Extent,
    generation: u64,
}

impl RenderTarget {
    /// Allocates storage cleared to opaque black.
    pub fn create<B: RenderBackend + ?Sized>(
        backend: &mut B,
        unit: u32,
        label: &str,
        size: Extent,
    ) -> Result<Self, RenderError> {
        let handle = allocate(backend, label, size)?;
        Ok(Self {
            label: label.to_string(),
            unit,
            handle,
            size,
            generation: 0,
        })
    }

    /// Runs `draw` with this target bound, then restores the previous
    /// destination whether or not `draw` succeeded.
    pub fn render_into<B, F, T>(&self, backend: &mut B, draw: F) -> Result<T, RenderError>
    where
        B: RenderBackend + ?Sized,
        F: FnOnce(&mut B) -> Result<T, RenderError>,
    {
        let previous = backend.bind_target(DrawTarget::Offscreen(self.handle));
        let result = draw(backend);
        backend.bind_target(previous);
        result
    }

    /// Reallocates storage for a new viewport. The handle is kept and the
    /// contents are cleared.
    pub fn resize<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        size: Extent,
    ) -> Result<(), RenderError> {
        if size == self.size {
            return Ok(());
        }
        backend.resize_texture(self.handle, size).inspect_err(|err| {
            tracing::error!(
                render_target = %self.label,
                error = %err,
                "failed to resize render target"
            );
        })?;
        self.size = size;
        Ok(())
    }

    /// Recreates the GPU objects, discarding all history.
    ///
    /// The replacement is allocated before the old storage is released, so a
    /// failed reset leaves the target usable with its history intact.
    pub fn reset_history<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Result<(), RenderError> {
        let replacement = allocate(backend, &self.label, self.size)?;
        backend.destroy_texture(std::mem::replace(&mut self.handle, replacement));
        self.generation += 1;
        tracing::debug!(
            render_target = %self.label,
            unit = self.unit,
            generation = self.generation,
            "render target recreated"
        );
        Ok(())
    }

    pub fn size(&self) -> Extent {
        self.size
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Texture units travel with the role, not the storage, when targets swap.
    pub(crate) fn swap_roles(current: &mut RenderTarget, previous: &mut RenderTarget) {
        std::mem::swap(current, previous);
        std::mem::swap(&mut current.unit, &mut previous.unit);
        std::mem::swap(&mut current.label, &mut previous.label);
    }
}

impl SampledTexture for RenderTarget {
    fn info(&self) -> TextureInfo {
        TextureInfo {
            unit: self.unit,
            handle: self.handle,
            size: self.size,
            transform: TextureTransform::IDENTITY,
        }
    }

    fn sampler_kind(&self) -> SamplerKind {
        SamplerKind::Standard2d
    }
}

fn allocate<B: RenderBackend + ?Sized>(
    backend: &mut B,
    label: &str,
    size: Extent,
) -> Result<TextureId, RenderError> {
    backend.create_texture(label, size).inspect_err(|err| {
        tracing::error!(render_target = label, error = %err, "failed to allocate render target");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::FrameSignal;
    use crate::software::SoftwareBackend;
    use crate::video::FrameProvider;

    #[test]
    fn render_into_restores_previous_target_on_error() {
        let mut backend = SoftwareBackend::new(Extent::new(4, 4));
        let target = RenderTarget::create(&mut backend, 0, "a", Extent::new(4, 4)).unwrap();
        let result: Result<(), RenderError> = target.render_into(&mut backend, |b| {
            assert_eq!(b.bound_target(), DrawTarget::Offscreen(target.handle()));
            Err(RenderError::GraphicsReadback("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(backend.bound_target(), DrawTarget::Surface);
    }

    #[test]
    fn reset_history_issues_new_handle_and_clears() {
        let mut backend = SoftwareBackend::new(Extent::new(2, 2));
        let mut target = RenderTarget::create(&mut backend, 0, "a", Extent::new(2, 2)).unwrap();
        let first = target.handle();
        target
            .render_into(&mut backend, |b| b.clear([1.0, 1.0, 1.0, 1.0]))
            .unwrap();
        target.reset_history(&mut backend).unwrap();
        assert_ne!(target.handle(), first);
        assert_eq!(target.generation(), 1);
        assert_eq!(backend.texture_pixels(target.handle()).unwrap()[..4], [0, 0, 0, 255]);
        assert!(backend.texture_pixels(first).is_none());
    }

    #[test]
    fn failed_reset_keeps_the_old_storage() {
        let mut backend = SoftwareBackend::new(Extent::new(2, 2));
        let mut target = RenderTarget::create(&mut backend, 0, "a", Extent::new(2, 2)).unwrap();
        let handle = target.handle();
        backend.limit_allocations(Some(0));
        assert!(target.reset_history(&mut backend).is_err());
        assert_eq!(target.handle(), handle);
        assert_eq!(target.generation(), 0);
        assert!(backend.texture_pixels(handle).is_some());
    }

    #[test]
    fn resize_keeps_handle() {
        let mut backend = SoftwareBackend::new(Extent::new(2, 2));
        let mut target = RenderTarget::create(&mut backend, 0, "a", Extent::new(2, 2)).unwrap();
        let handle = target.handle();
        target.resize(&mut backend, Extent::new(8, 3)).unwrap();
        assert_eq!(target.handle(), handle);
        assert_eq!(backend.texture_size(handle), Some(Extent::new(8, 3)));
    }

    #[test]
    fn video_texture_latches_newest_frame() {
        let mut backend = SoftwareBackend::new(Extent::new(2, 2));
        let (provider, rx) = FrameProvider::new(FrameSignal::new());
        let mut video = VideoTexture::new(&mut backend, rx).unwrap();
        assert_eq!(video.info().size, Extent::default());
        assert!(!video.update(&mut backend).unwrap());

        let sink = provider.request_surface(1, 1).unwrap();
        sink.submit(vec![10, 10, 10, 255], TextureTransform::IDENTITY)
            .unwrap();
        sink.submit(vec![20, 20, 20, 255], TextureTransform::MIRROR_X)
            .unwrap();
        assert!(video.update(&mut backend).unwrap());
        assert_eq!(video.frames_uploaded(), 1);
        assert_eq!(video.info().transform, TextureTransform::MIRROR_X);
        assert_eq!(video.info().size, Extent::new(1, 1));
        assert_eq!(backend.texture_pixels(video.handle()).unwrap(), &[20, 20, 20, 255]);
    }
}
