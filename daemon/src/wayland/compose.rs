//! Turning decoded frames into surface-sized pixels

use anyhow::{Context, Result};
use fast_image_resize as fr;
use rayon::prelude::*;
use std::borrow::Cow;

use crate::playback::VideoFrame;

/// Scales frames to a surface and lays the cover colour over them
pub struct Compositor {
    resizer: fr::Resizer,
    /// Cover colour in BGR byte order
    cover: [u8; 3],
}

impl Compositor {
    pub fn new((r, g, b): (u8, u8, u8)) -> Self {
        Self {
            resizer: fr::Resizer::new(),
            cover: [b, g, r],
        }
    }

    /// Produce a `width`×`height` BGRA image: `frame` scaled to fill the
    /// surface (cropping the overflow), blended toward the cover colour by
    /// `opacity`. Without a usable frame the surface is solid cover.
    pub fn render(
        &mut self,
        frame: Option<&VideoFrame>,
        width: u32,
        height: u32,
        opacity: f32,
    ) -> Result<Vec<u8>> {
        let opacity = opacity.clamp(0.0, 1.0);
        let Some(frame) = frame.filter(|f| f.is_well_formed() && opacity < 1.0) else {
            return Ok(self.solid(width, height));
        };

        let mut pixels = if frame.width == width && frame.height == height {
            packed_pixels(frame).into_owned()
        } else {
            self.scale(frame, width, height)?
        };

        blend_cover(&mut pixels, width, self.cover, opacity);
        Ok(pixels)
    }

    fn solid(&self, width: u32, height: u32) -> Vec<u8> {
        let [b, g, r] = self.cover;
        [b, g, r, 0xff].repeat((width * height) as usize)
    }

    fn scale(&mut self, frame: &VideoFrame, width: u32, height: u32) -> Result<Vec<u8>> {
        let src = fr::images::Image::from_vec_u8(
            frame.width,
            frame.height,
            packed_pixels(frame).into_owned(),
            fr::PixelType::U8x4,
        )
        .context("Failed to wrap video frame")?;

        let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x4);

        let (left, top, crop_w, crop_h) = fill_crop(frame.width, frame.height, width, height);
        self.resizer
            .resize(
                &src,
                &mut dst,
                &fr::ResizeOptions::new()
                    .crop(left, top, crop_w, crop_h)
                    .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
            )
            .context("Failed to scale video frame")?;

        Ok(dst.into_vec())
    }
}

/// Frame rows without stride padding
fn packed_pixels(frame: &VideoFrame) -> Cow<'_, [u8]> {
    let row = frame.width as usize * 4;
    let stride = frame.stride as usize;
    if stride == row {
        return Cow::Borrowed(&frame.data[..row * frame.height as usize]);
    }

    let mut packed = Vec::with_capacity(row * frame.height as usize);
    for line in frame.data.chunks(stride).take(frame.height as usize) {
        packed.extend_from_slice(&line[..row]);
    }
    Cow::Owned(packed)
}

/// Centered source rectangle with the destination's aspect ratio
fn fill_crop(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> (f64, f64, f64, f64) {
    let (src_w, src_h) = (f64::from(src_w), f64::from(src_h));
    let target_ratio = f64::from(dst_w) / f64::from(dst_h);
    let src_ratio = src_w / src_h;

    if src_ratio > target_ratio {
        // Source is wider, trim the sides
        let w = src_h * target_ratio;
        ((src_w - w) / 2.0, 0.0, w, src_h)
    } else {
        // Source is taller, trim top and bottom
        let h = src_w / target_ratio;
        (0.0, (src_h - h) / 2.0, src_w, h)
    }
}

fn blend_cover(pixels: &mut [u8], width: u32, cover: [u8; 3], opacity: f32) {
    if opacity <= 0.0 {
        return;
    }
    let keep = 1.0 - opacity;
    let over = cover.map(|c| f32::from(c) * opacity);

    pixels
        .par_chunks_mut(width as usize * 4)
        .for_each(|row| {
            for px in row.chunks_exact_mut(4) {
                for (channel, over) in px[..3].iter_mut().zip(over) {
                    *channel = (f32::from(*channel) * keep + over).round() as u8;
                }
                px[3] = 0xff;
            }
        });
}
