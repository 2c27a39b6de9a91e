use crate::capture::CapturedFrame;
use anyhow::Context;
use fast_image_resize::images::{Image, ImageRef};
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};

/// Planar 4:2:0 frame, the layout fed to the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I420Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl I420Frame {
    pub fn black(width: u32, height: u32) -> Self {
        let (width, height) = (even(width.max(2)), even(height.max(2)));
        let luma = (width * height) as usize;
        let mut data = vec![16u8; luma + luma / 2];
        data[luma..].fill(128);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn expected_len(width: u32, height: u32) -> usize {
        let luma = (width * height) as usize;
        luma + luma / 2
    }
}

fn even(v: u32) -> u32 {
    v & !1
}

/// Output size for a source region: the width is capped at `max_width`
/// and the height follows the aspect ratio. Both are even.
pub fn target_size(src_width: u32, src_height: u32, max_width: u32) -> (u32, u32) {
    let width = src_width.min(max_width).max(2);
    let height = if width == src_width {
        src_height
    } else {
        (src_height as u64 * width as u64 / src_width.max(1) as u64) as u32
    };
    (even(width), even(height.max(2)))
}

/// Scales captured BGRx frames and converts them to I420.
pub struct FrameConverter {
    resizer: Resizer,
    options: ResizeOptions,
}

impl Default for FrameConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameConverter {
    pub fn new() -> Self {
        Self {
            resizer: Resizer::new(),
            options: ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
        }
    }

    pub fn convert(&mut self, frame: &CapturedFrame, max_width: u32) -> anyhow::Result<I420Frame> {
        let (width, height) = target_size(frame.width, frame.height, max_width);
        if width == frame.width && height == frame.height {
            return Ok(bgrx_to_i420(&frame.data, width, height));
        }

        let src = ImageRef::new(frame.width, frame.height, &frame.data, PixelType::U8x4)
            .context("Captured frame has unexpected size")?;
        let mut dst = Image::new(width, height, PixelType::U8x4);
        self.resizer
            .resize(&src, &mut dst, &self.options)
            .context("Failed to resize frame")?;
        Ok(bgrx_to_i420(dst.buffer(), width, height))
    }
}

/// BT.601 limited-range conversion. `width` and `height` must be even.
pub fn bgrx_to_i420(bgrx: &[u8], width: u32, height: u32) -> I420Frame {
    let (w, h) = (width as usize, height as usize);
    let luma = w * h;
    let mut data = vec![0u8; luma + luma / 2];
    let (y_plane, chroma) = data.split_at_mut(luma);
    let (u_plane, v_plane) = chroma.split_at_mut(luma / 4);

    for row in 0..h {
        for col in 0..w {
            let px = &bgrx[(row * w + col) * 4..];
            let (b, g, r) = (px[0] as i32, px[1] as i32, px[2] as i32);
            y_plane[row * w + col] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8;
        }
    }

    let cw = w / 2;
    for row in (0..h).step_by(2) {
        for col in (0..w).step_by(2) {
            let (mut r, mut g, mut b) = (0i32, 0i32, 0i32);
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let px = &bgrx[((row + dy) * w + col + dx) * 4..];
                b += px[0] as i32;
                g += px[1] as i32;
                r += px[2] as i32;
            }
            let (r, g, b) = (r / 4, g / 4, b / 4);
            let idx = (row / 2) * cw + col / 2;
            u_plane[idx] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8;
            v_plane[idx] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8;
        }
    }

    I420Frame {
        width,
        height,
        data,
    }
}
