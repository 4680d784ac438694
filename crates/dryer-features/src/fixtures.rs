//! Synthetic records and images for test suites.

use std::path::Path;

use dryer_core::{
    ConveyorEntry, Error, FurnaceSnapshot, ImagePair, ProductionRecord, Result, TemperatureEntry,
    ValidationEntry, IMAGES_PER_SIDE, ZONE_COUNT,
};
use image::{Rgb, RgbImage};

use crate::sets::TrainingSet;

/// A complete record whose values shift with `index`.
///
/// Setpoint zone `z` is `60 + 2z + index`; the actual reading runs two
/// degrees under it.
pub fn record(index: usize) -> ProductionRecord {
    record_with_zones_at(index, ZONE_COUNT)
}

/// A record whose setpoint entry carries `zones` zone values.
pub fn record_with_zones(zones: usize) -> ProductionRecord {
    record_with_zones_at(0, zones)
}

fn record_with_zones_at(index: usize, zones: usize) -> ProductionRecord {
    let shift = index as f64;
    let setpoints: Vec<f64> = (0..zones).map(|z| 60.0 + 2.0 * z as f64 + shift).collect();
    let actuals: Vec<f64> = (0..ZONE_COUNT)
        .map(|z| 58.0 + 2.0 * z as f64 + shift)
        .collect();

    ProductionRecord::new(
        format!("2024-03-01 {:02}:00:00", index % 24),
        FurnaceSnapshot {
            setpoints: vec![TemperatureEntry::new("10:00", &setpoints, 20.0 + shift)],
            actuals: vec![TemperatureEntry::new("10:05", &actuals, 19.5 + shift)],
            conveyors: vec![ConveyorEntry::new(
                "10:05",
                1.0 + 0.1 * shift,
                [2.0, 2.5, 3.0],
            )],
        },
    )
}

/// Writes six small PNGs under `dir` and returns them as a pair.
pub fn image_pair(dir: &Path, prefix: &str) -> Result<ImagePair> {
    let mut conforming = Vec::with_capacity(IMAGES_PER_SIDE);
    let mut observed = Vec::with_capacity(IMAGES_PER_SIDE);
    for i in 0..IMAGES_PER_SIDE {
        let shade = (i * 60) as u8;
        conforming.push(write_png(dir, &format!("{prefix}_ok_{i}.png"), Rgb([200, 180, shade]))?);
        observed.push(write_png(dir, &format!("{prefix}_nok_{i}.png"), Rgb([90, shade, 40]))?);
    }
    Ok(ImagePair::new(conforming, observed))
}

fn write_png(dir: &Path, name: &str, color: Rgb<u8>) -> Result<std::path::PathBuf> {
    let path = dir.join(name);
    let image = RgbImage::from_fn(40, 40, |x, y| {
        if (x + y) % 7 == 0 {
            Rgb([255, 255, 255])
        } else {
            color
        }
    });
    image.save(&path).map_err(|e| Error::image_load(&path, e))?;
    Ok(path)
}

/// `count` complete training sets for `product`, each with its own images.
pub fn training_sets(dir: &Path, product: &str, count: usize) -> Result<Vec<TrainingSet>> {
    (0..count)
        .map(|i| {
            let images = image_pair(dir, &format!("{product}_{i}"))?;
            Ok(TrainingSet::new(format!("set_{}", i + 1), product, record(i), images))
        })
        .collect()
}

/// `count` complete validation entries.
pub fn validation_entries(dir: &Path, count: usize) -> Result<Vec<ValidationEntry>> {
    (0..count)
        .map(|i| {
            Ok(ValidationEntry {
                record: record(i),
                images: image_pair(dir, &format!("val_{i}"))?,
            })
        })
        .collect()
}
