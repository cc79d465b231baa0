//! Data Augmentation Module
//!
//! Weak and strong views for FixMatch. Images are `[channels, height, width]`
//! with values in `[0, 1]`; normalization happens later, in the batcher.
//!
//! # Augmentation Strategy
//!
//! - **Labeled / weak view**: random horizontal flip, then a random
//!   translation of up to 12.5% with reflect padding
//! - **Strong view**: weak, then `num_ops` randomly chosen photometric or
//!   geometric ops at random magnitudes, then Cutout
//! - **Test**: no augmentation

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::ImageShape;

/// Configuration for the strong view
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrongAugmentConfig {
    /// Random ops applied per image
    pub num_ops: usize,
    /// Cutout square side as a fraction of the image side
    pub cutout_ratio: f32,
    /// Rotation range in degrees (applies ±max_rotation)
    pub max_rotation: f32,
}

impl Default for StrongAugmentConfig {
    fn default() -> Self {
        Self {
            num_ops: 2,
            cutout_ratio: 0.5,
            max_rotation: 30.0,
        }
    }
}

/// Ops the strong view draws from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrongOp {
    Identity,
    AutoContrast,
    Brightness,
    Color,
    Contrast,
    Posterize,
    Rotate,
    Solarize,
}

impl StrongOp {
    pub const ALL: [StrongOp; 8] = [
        StrongOp::Identity,
        StrongOp::AutoContrast,
        StrongOp::Brightness,
        StrongOp::Color,
        StrongOp::Contrast,
        StrongOp::Posterize,
        StrongOp::Rotate,
        StrongOp::Solarize,
    ];
}

/// Produces weak and strong views of an image
#[derive(Clone, Debug)]
pub struct Augmenter {
    shape: ImageShape,
    strong: StrongAugmentConfig,
}

impl Augmenter {
    pub fn new(shape: ImageShape, strong: StrongAugmentConfig) -> Self {
        Self { shape, strong }
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    /// Flip and translate
    pub fn weak(&self, pixels: &[f32], rng: &mut ChaCha8Rng) -> Vec<f32> {
        let mut out = pixels.to_vec();
        if rng.gen::<f32>() < 0.5 {
            self.flip_horizontal(&mut out);
        }
        let max_shift_y = (self.shape.height as f32 * 0.125).round() as i64;
        let max_shift_x = (self.shape.width as f32 * 0.125).round() as i64;
        let dy = rng.gen_range(-max_shift_y..=max_shift_y);
        let dx = rng.gen_range(-max_shift_x..=max_shift_x);
        self.translate_reflect(&out, dy, dx)
    }

    /// Weak view, random ops, then Cutout
    pub fn strong(&self, pixels: &[f32], rng: &mut ChaCha8Rng) -> Vec<f32> {
        let mut out = self.weak(pixels, rng);
        for _ in 0..self.strong.num_ops {
            let op = StrongOp::ALL[rng.gen_range(0..StrongOp::ALL.len())];
            self.apply(op, &mut out, rng);
        }
        self.cutout(&mut out, rng);
        out
    }

    /// Apply one op with a random magnitude
    pub fn apply(&self, op: StrongOp, img: &mut [f32], rng: &mut ChaCha8Rng) {
        match op {
            StrongOp::Identity => {}
            StrongOp::AutoContrast => self.auto_contrast(img),
            StrongOp::Brightness => {
                let factor = rng.gen_range(0.05f32..0.95) + 0.5;
                img.iter_mut().for_each(|v| *v = (*v * factor).clamp(0.0, 1.0));
            }
            StrongOp::Color => self.adjust_saturation(img, rng.gen_range(0.05..0.95) + 0.5),
            StrongOp::Contrast => self.adjust_contrast(img, rng.gen_range(0.05..0.95) + 0.5),
            StrongOp::Posterize => {
                let levels = (1u32 << rng.gen_range(4u32..=8)) as f32 - 1.0;
                img.iter_mut()
                    .for_each(|v| *v = (*v * levels).floor() / levels);
            }
            StrongOp::Rotate => {
                let angle = rng.gen_range(-self.strong.max_rotation..=self.strong.max_rotation);
                let rotated = self.rotate(img, angle);
                img.copy_from_slice(&rotated);
            }
            StrongOp::Solarize => {
                let threshold = rng.gen_range(0.0..1.0f32);
                img.iter_mut().for_each(|v| {
                    if *v >= threshold {
                        *v = 1.0 - *v
                    }
                });
            }
        }
    }

    fn index(&self, c: usize, y: usize, x: usize) -> usize {
        (c * self.shape.height + y) * self.shape.width + x
    }

    fn flip_horizontal(&self, img: &mut [f32]) {
        let w = self.shape.width;
        for c in 0..self.shape.channels {
            for y in 0..self.shape.height {
                let row = self.index(c, y, 0);
                img[row..row + w].reverse();
            }
        }
    }

    /// Shift content by `(dy, dx)`, filling exposed borders by reflection
    fn translate_reflect(&self, img: &[f32], dy: i64, dx: i64) -> Vec<f32> {
        let (h, w) = (self.shape.height as i64, self.shape.width as i64);
        let mut out = vec![0.0; img.len()];
        for c in 0..self.shape.channels {
            for y in 0..h {
                let sy = reflect(y - dy, h);
                for x in 0..w {
                    let sx = reflect(x - dx, w);
                    out[self.index(c, y as usize, x as usize)] = img[self.index(c, sy, sx)];
                }
            }
        }
        out
    }

    /// Stretch each channel to the full `[0, 1]` range
    fn auto_contrast(&self, img: &mut [f32]) {
        let plane = self.shape.height * self.shape.width;
        for channel in img.chunks_mut(plane) {
            let lo = channel.iter().cloned().fold(f32::INFINITY, f32::min);
            let hi = channel.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            if hi - lo > f32::EPSILON {
                channel.iter_mut().for_each(|v| *v = (*v - lo) / (hi - lo));
            }
        }
    }

    /// Per-pixel luminance (first channel when not RGB)
    fn luminance(&self, img: &[f32]) -> Vec<f32> {
        let plane = self.shape.height * self.shape.width;
        if self.shape.channels < 3 {
            return img[..plane].to_vec();
        }
        (0..plane)
            .map(|i| 0.299 * img[i] + 0.587 * img[plane + i] + 0.114 * img[2 * plane + i])
            .collect()
    }

    /// Scale pixel values around the mean luminance
    fn adjust_contrast(&self, img: &mut [f32], factor: f32) {
        let lum = self.luminance(img);
        let mean = lum.iter().sum::<f32>() / lum.len().max(1) as f32;
        img.iter_mut()
            .for_each(|v| *v = (mean + factor * (*v - mean)).clamp(0.0, 1.0));
    }

    /// Interpolate between grayscale and the original
    fn adjust_saturation(&self, img: &mut [f32], factor: f32) {
        let gray = self.luminance(img);
        let plane = gray.len();
        for (i, v) in img.iter_mut().enumerate() {
            let g = gray[i % plane];
            *v = (g + factor * (*v - g)).clamp(0.0, 1.0);
        }
    }

    /// Rotate about the centre with bilinear sampling; outside is black
    fn rotate(&self, img: &[f32], angle_degrees: f32) -> Vec<f32> {
        if angle_degrees.abs() < 0.1 {
            return img.to_vec();
        }
        let (h, w) = (self.shape.height, self.shape.width);
        let (cy, cx) = ((h as f32 - 1.0) / 2.0, (w as f32 - 1.0) / 2.0);
        let (sin_a, cos_a) = angle_degrees.to_radians().sin_cos();

        let mut out = vec![0.0; img.len()];
        for y in 0..h {
            for x in 0..w {
                let (dx, dy) = (x as f32 - cx, y as f32 - cy);
                let src_x = cx + dx * cos_a + dy * sin_a;
                let src_y = cy - dx * sin_a + dy * cos_a;
                if src_x < 0.0 || src_y < 0.0 || src_x > (w - 1) as f32 || src_y > (h - 1) as f32 {
                    continue;
                }

                let (x0, y0) = (src_x.floor() as usize, src_y.floor() as usize);
                let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
                let (fx, fy) = (src_x - x0 as f32, src_y - y0 as f32);

                for c in 0..self.shape.channels {
                    let v = img[self.index(c, y0, x0)] * (1.0 - fx) * (1.0 - fy)
                        + img[self.index(c, y0, x1)] * fx * (1.0 - fy)
                        + img[self.index(c, y1, x0)] * (1.0 - fx) * fy
                        + img[self.index(c, y1, x1)] * fx * fy;
                    out[self.index(c, y, x)] = v;
                }
            }
        }
        out
    }

    /// Grey out a random square
    fn cutout(&self, img: &mut [f32], rng: &mut ChaCha8Rng) {
        let (h, w) = (self.shape.height, self.shape.width);
        let side = (self.strong.cutout_ratio * h.min(w) as f32).round() as usize;
        if side == 0 {
            return;
        }
        let cy = rng.gen_range(0..h);
        let cx = rng.gen_range(0..w);
        let (y0, y1) = (cy.saturating_sub(side / 2), (cy + side / 2).min(h));
        let (x0, x1) = (cx.saturating_sub(side / 2), (cx + side / 2).min(w));

        for c in 0..self.shape.channels {
            for y in y0..y1 {
                for x in x0..x1 {
                    img[self.index(c, y, x)] = 0.5;
                }
            }
        }
    }
}

/// Reflect an out-of-range coordinate back into `[0, len)` (no edge repeat)
fn reflect(i: i64, len: i64) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let m = i.rem_euclid(period);
    (if m < len { m } else { period - m }) as usize
}
