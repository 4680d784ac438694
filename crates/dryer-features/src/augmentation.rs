//! Random geometric jitter applied to training images.
//!
//! Each call draws a fresh flip, rotation and zoom, so two extractions of the
//! same record differ. Only training-time extraction uses it.

use image::RgbImage;
use rand::Rng;

/// Ranges for the geometric jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterConfig {
    pub horizontal_flip: bool,
    /// Maximum rotation either way, in degrees
    pub rotation_degrees: f32,
    /// Maximum relative zoom either way
    pub zoom: f32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            horizontal_flip: true,
            rotation_degrees: 20.0,
            zoom: 0.2,
        }
    }
}

/// Flip, rotation and zoom with nearest-edge fill.
#[derive(Debug, Clone, Default)]
pub struct GeometricJitter {
    config: JitterConfig,
}

impl GeometricJitter {
    pub fn new(config: JitterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }

    /// Jitters `image` with the thread-local generator.
    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        self.apply_with(image, &mut rand::thread_rng())
    }

    pub fn apply_with<R: Rng + ?Sized>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        let flip = self.config.horizontal_flip && rng.gen_bool(0.5);
        let angle = if self.config.rotation_degrees > 0.0 {
            rng.gen_range(-self.config.rotation_degrees..=self.config.rotation_degrees)
        } else {
            0.0
        };
        let (zoom_x, zoom_y) = if self.config.zoom > 0.0 {
            let range = (1.0 - self.config.zoom)..=(1.0 + self.config.zoom);
            (rng.gen_range(range.clone()), rng.gen_range(range))
        } else {
            (1.0, 1.0)
        };
        warp(image, flip, angle.to_radians(), zoom_x, zoom_y)
    }
}

/// Inverse-maps every output pixel through flip, rotation and zoom around the
/// image centre, sampling the nearest source pixel and clamping at the edges.
fn warp(image: &RgbImage, flip: bool, radians: f32, zoom_x: f32, zoom_y: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let (sin, cos) = radians.sin_cos();
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;

    RgbImage::from_fn(width, height, |x, y| {
        let mut dx = x as f32 - cx;
        let dy = y as f32 - cy;
        if flip {
            dx = -dx;
        }
        let rx = cos * dx + sin * dy;
        let ry = -sin * dx + cos * dy;
        let sx = (cx + rx * zoom_x).round().clamp(0.0, max_x) as u32;
        let sy = (cy + ry * zoom_y).round().clamp(0.0, max_y) as u32;
        *image.get_pixel(sx, sy)
    })
}
