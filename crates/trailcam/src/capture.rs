use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use renderer::{Compositor, Facing, FrameSignal, RenderBackend, RenderMode};

use crate::source::FrameGenerator;

#[derive(Debug, Clone, Copy)]
pub struct ExposurePlan {
    /// Preview frames drawn before the shutter opens.
    pub warmup_frames: u32,
    /// Frames blended while the shutter is open.
    pub exposure_frames: u32,
    pub facing: Facing,
}

/// Runs one exposure without a window and returns the composed still.
///
/// Frames are pulled from `generator` in lockstep with the draws, so the
/// result only depends on the generator and the plan.
pub fn expose<B, G>(backend: B, generator: &mut G, plan: ExposurePlan) -> Result<RgbaImage>
where
    B: RenderBackend,
    G: FrameGenerator + ?Sized,
{
    let mut compositor =
        Compositor::new(backend, FrameSignal::new()).context("failed to build compositor")?;
    let size = generator.size();
    let sink = compositor
        .frame_provider()
        .request_surface(size.width, size.height)?;
    let handle = compositor.handle();
    let transform = plan.facing.transform();
    let mut index = 0u64;

    let mut feed = |compositor: &mut Compositor<B>| -> Result<()> {
        let pixels = generator.frame(index)?;
        sink.submit(pixels, transform)?;
        index += 1;
        compositor.draw_frame()?;
        Ok(())
    };

    for _ in 0..plan.warmup_frames {
        feed(&mut compositor)?;
    }

    handle.request_mode(RenderMode::Accumulate);
    let exposure_frames = plan.exposure_frames.max(1);
    for _ in 1..exposure_frames {
        feed(&mut compositor)?;
    }
    let still = handle.request_snapshot_channel();
    feed(&mut compositor)?;
    debug_assert_eq!(compositor.mode(), RenderMode::Accumulate);

    let image = still
        .try_recv()
        .map_err(|_| anyhow!("snapshot readback failed; see log for details"))?;

    handle.request_mode(RenderMode::Preview);
    compositor.draw_frame()?;
    tracing::info!(
        frames = exposure_frames,
        width = image.width(),
        height = image.height(),
        "exposure complete"
    );
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LightPainting;
    use renderer::{Extent, SoftwareBackend};

    fn plan(frames: u32) -> ExposurePlan {
        ExposurePlan {
            warmup_frames: 2,
            exposure_frames: frames,
            facing: Facing::Back,
        }
    }

    fn bright(image: &RgbaImage) -> usize {
        image
            .pixels()
            .filter(|px| px.0[0].max(px.0[1]).max(px.0[2]) > 100)
            .count()
    }

    fn bright_raw(pixels: &[u8]) -> usize {
        pixels
            .chunks_exact(4)
            .filter(|px| px[0].max(px[1]).max(px[2]) > 100)
            .count()
    }

    #[test]
    fn long_exposure_leaves_trails() {
        let size = Extent::new(64, 48);
        let mut scene = LightPainting::new(size);
        let still = expose(SoftwareBackend::new(size), &mut scene, plan(30)).unwrap();

        assert_eq!(still.dimensions(), (64, 48));
        let single = bright_raw(&scene.frame_at(2 + 29));
        assert!(
            bright(&still) > single * 2,
            "trail {} vs single frame {single}",
            bright(&still)
        );
        assert!(still.get_pixel(0, 0).0[0] < 40);
    }

    #[test]
    fn single_frame_exposure_matches_live_frame() {
        let size = Extent::new(32, 32);
        let mut scene = LightPainting::new(size);
        let still = expose(SoftwareBackend::new(size), &mut scene, plan(1)).unwrap();
        let live = scene.frame_at(2);
        assert_eq!(bright(&still), bright_raw(&live));
    }

    #[test]
    fn failed_readback_is_reported() {
        let size = Extent::new(8, 8);
        let mut scene = LightPainting::new(size);
        let mut backend = SoftwareBackend::new(size);
        backend.fail_readbacks(true);
        assert!(expose(backend, &mut scene, plan(3)).is_err());
    }
}
