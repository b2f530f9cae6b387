#![allow(dead_code)]

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use sift::image::{gaussian_blur, GrayFloatImage};
use sift::Descriptor;

/// A single bright Gaussian blob on a dark background.
pub fn blob(width: usize, height: usize, center: (f32, f32), sigma: f32) -> GrayFloatImage {
    GrayFloatImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - center.0;
        let dy = y as f32 - center.1;
        0.1 + 0.6 * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
    })
}

/// Smoothed uniform noise stretched to `[0, 1]`.
pub fn texture(seed: u8, width: usize, height: usize) -> GrayFloatImage {
    let mut rng = Pcg64::from_seed([seed; 32]);
    let noise = GrayFloatImage::from_fn(width, height, |_, _| rng.gen());
    let smooth = gaussian_blur(&noise, 2.0);
    let (min, max) = smooth
        .pixels()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), p| {
            (min.min(p[0]), max.max(p[0]))
        });
    GrayFloatImage::from_fn(width, height, |x, y| (smooth.get(x, y) - min) / (max - min))
}

/// The `width` x `height` window of `image` starting at `(left, top)`.
pub fn crop(
    image: &GrayFloatImage,
    left: usize,
    top: usize,
    width: usize,
    height: usize,
) -> GrayFloatImage {
    GrayFloatImage::from_fn(width, height, |x, y| image.get(x + left, y + top))
}

pub fn flatten<T>(per_octave: Vec<Vec<T>>) -> Vec<T> {
    per_octave.into_iter().flatten().collect()
}

/// Drop descriptors whose features repeat an earlier one.
pub fn unique(descriptors: Vec<Descriptor>) -> Vec<Descriptor> {
    let mut unique: Vec<Descriptor> = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        if unique.iter().all(|d| d.features != descriptor.features) {
            unique.push(descriptor);
        }
    }
    unique
}
