//! Video sources feeding the compositor.
//!
//! A [`FrameGenerator`] produces top-row-first RGBA8 frames on demand. The
//! headless capture pulls frames from it directly, one per drawn frame;
//! [`PacedSource`] runs it on a worker thread at a fixed rate for the window.

use std::f32::consts::TAU;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use image::imageops::{self, FilterType};
use renderer::{Extent, Facing, FrameProvider, VideoError, VideoSource};

const BACKGROUND: [u8; 4] = [10, 12, 18, 255];

pub trait FrameGenerator: Send + 'static {
    fn size(&self) -> Extent;
    /// RGBA8 pixels for frame `index`, `size().pixel_count() * 4` bytes long.
    fn frame(&mut self, index: u64) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy)]
struct Light {
    color: [u8; 4],
    /// Orbit radius as a fraction of the shorter frame edge.
    orbit: f32,
    /// Full turns per 100 frames.
    speed: f32,
    phase: f32,
}

/// Dark street with a few lamps circling through it.
#[derive(Debug, Clone)]
pub struct LightPainting {
    size: Extent,
    lights: Vec<Light>,
}

impl LightPainting {
    pub fn new(size: Extent) -> Self {
        let lights = vec![
            Light {
                color: [255, 214, 120, 255],
                orbit: 0.36,
                speed: 1.0,
                phase: 0.0,
            },
            Light {
                color: [240, 60, 40, 255],
                orbit: 0.22,
                speed: -1.5,
                phase: 0.33,
            },
            Light {
                color: [90, 170, 255, 255],
                orbit: 0.12,
                speed: 2.0,
                phase: 0.66,
            },
        ];
        Self { size, lights }
    }

    fn light_radius(&self) -> f32 {
        (self.size.width.min(self.size.height) as f32 / 40.0).max(1.0)
    }

    fn light_center(&self, light: &Light, index: u64) -> (f32, f32) {
        let shorter = self.size.width.min(self.size.height) as f32;
        let angle = (light.phase + light.speed * index as f32 / 100.0) * TAU;
        let cx = self.size.width as f32 / 2.0 + angle.cos() * light.orbit * shorter;
        let cy = self.size.height as f32 / 2.0 + angle.sin() * light.orbit * shorter;
        (cx, cy)
    }

    pub fn frame_at(&self, index: u64) -> Vec<u8> {
        let Extent { width, height } = self.size;
        let mut pixels = BACKGROUND.repeat(self.size.pixel_count());
        let radius = self.light_radius();
        for light in &self.lights {
            let (cx, cy) = self.light_center(light, index);
            let x0 = (cx - radius).floor().max(0.0) as u32;
            let y0 = (cy - radius).floor().max(0.0) as u32;
            let x1 = ((cx + radius).ceil() as u32).min(width);
            let y1 = ((cy + radius).ceil() as u32).min(height);
            for y in y0..y1 {
                for x in x0..x1 {
                    let dx = x as f32 + 0.5 - cx;
                    let dy = y as f32 + 0.5 - cy;
                    if dx * dx + dy * dy <= radius * radius {
                        let offset = ((y * width + x) * 4) as usize;
                        pixels[offset..offset + 4].copy_from_slice(&light.color);
                    }
                }
            }
        }
        pixels
    }
}

impl FrameGenerator for LightPainting {
    fn size(&self) -> Extent {
        self.size
    }

    fn frame(&mut self, index: u64) -> Result<Vec<u8>> {
        Ok(self.frame_at(index))
    }
}

/// PNG/JPEG files from a directory, looped in file-name order and scaled to
/// the frame size.
#[derive(Debug, Clone)]
pub struct ImageSequence {
    size: Extent,
    frames: Vec<PathBuf>,
}

impl ImageSequence {
    pub fn open(directory: &Path, size: Extent) -> Result<Self> {
        let mut frames = fs::read_dir(directory)
            .with_context(|| format!("failed to read frame directory {}", directory.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| is_supported_image(path))
            .collect::<Vec<_>>();
        frames.sort();
        if frames.is_empty() {
            bail!("no PNG or JPEG frames found in {}", directory.display());
        }
        tracing::debug!(count = frames.len(), dir = %directory.display(), "image sequence");
        Ok(Self { size, frames })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

fn is_supported_image(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref(),
        Some("png" | "jpg" | "jpeg")
    )
}

impl FrameGenerator for ImageSequence {
    fn size(&self) -> Extent {
        self.size
    }

    fn frame(&mut self, index: u64) -> Result<Vec<u8>> {
        let path = &self.frames[(index % self.frames.len() as u64) as usize];
        let mut image = image::open(path)
            .with_context(|| format!("failed to decode frame {}", path.display()))?
            .to_rgba8();
        if image.dimensions() != (self.size.width, self.size.height) {
            image = imageops::resize(
                &image,
                self.size.width,
                self.size.height,
                FilterType::Triangle,
            );
        }
        Ok(image.into_raw())
    }
}

impl FrameGenerator for Box<dyn FrameGenerator> {
    fn size(&self) -> Extent {
        (**self).size()
    }

    fn frame(&mut self, index: u64) -> Result<Vec<u8>> {
        (**self).frame(index)
    }
}

/// Runs a generator on its own thread, submitting a frame every `1 / fps`.
pub struct PacedSource<G: FrameGenerator> {
    generator: Option<G>,
    fps: f32,
    front: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl<G: FrameGenerator> PacedSource<G> {
    pub fn new(generator: G, fps: f32, facing: Facing) -> Self {
        Self {
            generator: Some(generator),
            fps,
            front: Arc::new(AtomicBool::new(facing == Facing::Front)),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl<G: FrameGenerator> VideoSource for PacedSource<G> {
    fn start(&mut self, provider: FrameProvider) -> Result<(), VideoError> {
        let mut generator = self
            .generator
            .take()
            .ok_or_else(|| VideoError::Source("source already started".into()))?;
        let size = generator.size();
        let sink = provider.request_surface(size.width, size.height)?;
        let interval = Duration::from_secs_f32(1.0 / self.fps.max(1.0));
        let front = Arc::clone(&self.front);
        let shutdown = Arc::clone(&self.shutdown);

        let worker = thread::Builder::new()
            .name("trailcam-source".into())
            .spawn(move || {
                let mut index = 0u64;
                let mut next = Instant::now();
                while !shutdown.load(Ordering::Acquire) {
                    let facing = if front.load(Ordering::Acquire) {
                        Facing::Front
                    } else {
                        Facing::Back
                    };
                    let submitted = generator
                        .frame(index)
                        .map_err(|err| VideoError::Source(format!("{err:#}")))
                        .and_then(|pixels| sink.submit(pixels, facing.transform()));
                    if let Err(err) = submitted {
                        tracing::warn!("video source stopped: {err}");
                        break;
                    }
                    index += 1;
                    next += interval;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
            })
            .map_err(|err| VideoError::Source(format!("failed to spawn source thread: {err}")))?;
        self.worker = Some(worker);
        Ok(())
    }

    fn set_facing(&mut self, facing: Facing) {
        self.front.store(facing == Facing::Front, Ordering::Release);
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("video source thread panicked");
            }
        }
    }
}

impl<G: FrameGenerator> Drop for PacedSource<G> {
    fn drop(&mut self) {
        self.stop();
    }
}
