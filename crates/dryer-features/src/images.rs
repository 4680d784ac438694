//! Image loading and width-wise stacking.

use std::path::Path;

use dryer_core::{Error, ImageTensor, Result, IMAGE_CHANNELS};
use image::imageops::FilterType;
use image::{ImageReader, RgbImage};

/// Loads `path` as RGB and resizes it to `side` x `side`.
pub fn load_rgb(path: &Path, side: u32) -> Result<RgbImage> {
    if path.as_os_str().is_empty() {
        return Err(Error::image_load(path, "empty image path"));
    }
    if !path.is_file() {
        return Err(Error::image_load(path, "file not found"));
    }

    let image = ImageReader::open(path)
        .map_err(|e| Error::image_load(path, e))?
        .with_guessed_format()
        .map_err(|e| Error::image_load(path, e))?
        .decode()
        .map_err(|e| Error::image_load(path, e))?;

    Ok(image
        .resize_exact(side, side, FilterType::Triangle)
        .to_rgb8())
}

/// Places equally sized images side by side and scales pixels to `[0, 1]`.
///
/// The result is laid out height x width x channel, with the first image in
/// the leftmost columns.
pub fn concat_width(images: &[RgbImage]) -> ImageTensor {
    let Some(first) = images.first() else {
        return ImageTensor::zeros(0, 0);
    };
    let (tile_width, height) = first.dimensions();
    let (tile_width, height) = (tile_width as usize, height as usize);
    let width = tile_width * images.len();

    let mut tensor = ImageTensor::zeros(height, width);
    for (tile, image) in images.iter().enumerate() {
        for (x, y, pixel) in image.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= tile_width || y >= height {
                continue;
            }
            let offset = (y * width + tile * tile_width + x) * IMAGE_CHANNELS;
            for c in 0..IMAGE_CHANNELS {
                tensor.data[offset + c] = f32::from(pixel[c]) / 255.0;
            }
        }
    }
    tensor
}
