//! Surface readback into a top-down RGBA image.

use image::imageops;
use image::RgbaImage;

use crate::backend::{ChannelOrder, RawPixels, RenderBackend, RowOrder};
use crate::error::RenderError;
use crate::types::Extent;

/// Region of the surface to read, in top-left-origin pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn full(size: Extent) -> Self {
        Self {
            x: 0,
            y: 0,
            width: size.width,
            height: size.height,
        }
    }

    fn fits(&self, size: Extent) -> bool {
        u64::from(self.x) + u64::from(self.width) <= u64::from(size.width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(size.height)
    }
}

/// Reads `rect` of the presented surface back as an [`RgbaImage`].
///
/// Only valid between the backend's `submit` and `present` calls.
pub fn read_snapshot<B>(backend: &mut B, rect: PixelRect) -> Result<RgbaImage, RenderError>
where
    B: RenderBackend + ?Sized,
{
    let raw = backend.read_surface()?;
    if !rect.fits(raw.size) {
        return Err(RenderError::GraphicsReadback(format!(
            "snapshot rect {}x{}+{}+{} outside the {} surface",
            rect.width, rect.height, rect.x, rect.y, raw.size
        )));
    }
    let full = PixelRect::full(raw.size);
    let image = decode_pixels(raw)?;
    if rect == full {
        return Ok(image);
    }
    Ok(imageops::crop_imm(&image, rect.x, rect.y, rect.width, rect.height).to_image())
}

/// Reorders channels to RGBA and flips bottom-up rows so that row 0 of the
/// result is the top of the frame.
pub fn decode_pixels(raw: RawPixels) -> Result<RgbaImage, RenderError> {
    let RawPixels {
        size,
        layout,
        mut bytes,
    } = raw;
    let row_bytes = size.width as usize * 4;
    let expected = row_bytes * size.height as usize;
    if bytes.len() != expected {
        return Err(RenderError::GraphicsReadback(format!(
            "readback returned {} bytes, expected {expected} for {size}",
            bytes.len()
        )));
    }

    if layout.channels == ChannelOrder::Bgra {
        for pixel in bytes.chunks_exact_mut(4) {
            pixel.swap(0, 2);
        }
    }

    if layout.rows == RowOrder::BottomUp && row_bytes > 0 {
        let height = size.height as usize;
        for row in 0..height / 2 {
            let mirror = height - 1 - row;
            let (head, tail) = bytes.split_at_mut(mirror * row_bytes);
            head[row * row_bytes..(row + 1) * row_bytes].swap_with_slice(&mut tail[..row_bytes]);
        }
    }

    RgbaImage::from_raw(size.width, size.height, bytes).ok_or_else(|| {
        RenderError::GraphicsReadback(format!("pixel buffer does not fit a {size} image"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DrawCall, DrawTarget, PixelLayout, ProgramKind};
    use crate::compile::build_program;
    use crate::software::SoftwareBackend;
    use crate::types::{SamplerKind, TextureTransform};

    fn raw(layout: PixelLayout, rows: &[[u8; 4]]) -> RawPixels {
        RawPixels {
            size: Extent::new(1, rows.len() as u32),
            layout,
            bytes: rows.iter().flatten().copied().collect(),
        }
    }

    #[test]
    fn bottom_up_rows_are_flipped() {
        let layout = PixelLayout {
            channels: ChannelOrder::Rgba,
            rows: RowOrder::BottomUp,
        };
        let rows = [[1, 0, 0, 255], [2, 0, 0, 255], [3, 0, 0, 255]];
        let image = decode_pixels(raw(layout, &rows)).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [3, 0, 0, 255]);
        assert_eq!(image.get_pixel(0, 1).0, [2, 0, 0, 255]);
        assert_eq!(image.get_pixel(0, 2).0, [1, 0, 0, 255]);
    }

    #[test]
    fn bgra_is_reordered() {
        let layout = PixelLayout {
            channels: ChannelOrder::Bgra,
            rows: RowOrder::TopDown,
        };
        let image = decode_pixels(raw(layout, &[[10, 20, 30, 40], [50, 60, 70, 80]])).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [30, 20, 10, 40]);
        assert_eq!(image.get_pixel(0, 1).0, [70, 60, 50, 80]);
    }

    #[test]
    fn short_buffer_is_a_readback_error() {
        let raw = RawPixels {
            size: Extent::new(2, 2),
            layout: PixelLayout {
                channels: ChannelOrder::Rgba,
                rows: RowOrder::TopDown,
            },
            bytes: vec![0; 12],
        };
        assert!(matches!(
            decode_pixels(raw),
            Err(RenderError::GraphicsReadback(_))
        ));
    }

    fn presented_quadrants(backend: &mut SoftwareBackend) {
        let program = build_program(backend, ProgramKind::Present, &[SamplerKind::Standard2d])
            .unwrap();
        let texture = backend.create_texture("quadrants", Extent::new(2, 2)).unwrap();
        let pixels = [
            [255u8, 0, 0, 255],
            [0, 255, 0, 255],
            [0, 0, 255, 255],
            [255, 255, 255, 255],
        ]
        .concat();
        backend
            .upload_pixels(texture, Extent::new(2, 2), &pixels)
            .unwrap();
        backend.begin_frame().unwrap();
        backend.bind_target(DrawTarget::Surface);
        backend
            .draw(&DrawCall {
                program,
                textures: &[texture],
                transform: TextureTransform::IDENTITY,
            })
            .unwrap();
        backend.submit().unwrap();
    }

    #[test]
    fn rect_selects_a_top_left_origin_region() {
        let mut backend = SoftwareBackend::new(Extent::new(4, 4));
        presented_quadrants(&mut backend);
        let image = read_snapshot(
            &mut backend,
            PixelRect {
                x: 2,
                y: 2,
                width: 2,
                height: 2,
            },
        )
        .unwrap();
        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.get_pixel(0, 0).0, [255, 255, 255, 255]);
    }

    #[test]
    fn rect_outside_surface_is_rejected() {
        let mut backend = SoftwareBackend::new(Extent::new(4, 4));
        presented_quadrants(&mut backend);
        let rect = PixelRect {
            x: 3,
            y: 0,
            width: 2,
            height: 1,
        };
        assert!(matches!(
            read_snapshot(&mut backend, rect),
            Err(RenderError::GraphicsReadback(_))
        ));
    }
}
