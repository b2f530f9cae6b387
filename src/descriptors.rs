use crate::trie::Distance;
use crate::vector::{clip, group_means, normalize, quantize, quantized_distance};
use crate::{check_capacity, Error, KeyPoint, KeyPointOrientations, Octave, ScaleSpace, Sift};
use log::*;
use std::f32::consts::{SQRT_2, TAU};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Components above this are clipped before the second normalization.
const CLIP_THRESHOLD: f32 = 0.2;

/// A gradient histogram descriptor of one oriented keypoint.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Descriptor {
    pub keypoint: KeyPoint,
    /// Orientation the patch was rotated to, in radians.
    pub theta: f32,
    /// Quantized histogram, `(y * d + x) * b + bin` ordered.
    pub features: Vec<u8>,
    /// The unit length histogram the features were quantized from.
    pub raw_features: Vec<f32>,
    /// Per-cell means of `features / 255`, interior cells first, used to
    /// index the descriptor in a [`Trie`](crate::trie::Trie).
    pub key: Vec<f32>,
}

impl Distance for Descriptor {
    fn distance(&self, other: &Self) -> f32 {
        quantized_distance(&self.features, &other.features)
    }
}

/// Cell order of the index key for a `d` x `d` grid: interior cells, then
/// corners, then the remaining edge cells, each in row-major order.
///
/// Neighboring cells of similar descriptors change together, so leading with
/// the interior keeps the first trie levels stable.
pub fn index_key_order(d: usize) -> Vec<usize> {
    let last = d.saturating_sub(1);
    let is_edge = |v: usize| v == 0 || v == last;
    let cells = || (0..d * d).map(move |cell| (cell, cell % d, cell / d));
    let interior = cells().filter(|&(_, x, y)| !is_edge(x) && !is_edge(y));
    let corners = cells().filter(|&(_, x, y)| is_edge(x) && is_edge(y));
    let edges = cells().filter(|&(_, x, y)| is_edge(x) != is_edge(y));
    interior
        .chain(corners)
        .chain(edges)
        .map(|(cell, _, _)| cell)
        .collect()
}

/// Reduce quantized features to one value in `[0, 1]` per grid cell.
pub fn index_key(features: &[u8], d: usize, b: usize) -> Vec<f32> {
    let scaled: Vec<f32> = features.iter().map(|&f| f32::from(f) / 255.0).collect();
    let means = group_means(&scaled, b);
    index_key_order(d).into_iter().map(|cell| means[cell]).collect()
}

/// Distribute `weight` over the eight cells surrounding the continuous
/// position `(gx, gy, go)`. Spatial cells outside the grid are skipped while
/// the orientation axis wraps.
fn trilinear_add(
    histogram: &mut [f32],
    (gx, gy, go): (f32, f32, f32),
    weight: f32,
    d: usize,
    b: usize,
) {
    let (x0, y0, o0) = (gx.floor(), gy.floor(), go.floor());
    let (fx, fy, fo) = (gx - x0, gy - y0, go - o0);
    let (x0, y0, o0) = (x0 as isize, y0 as isize, o0 as isize);
    for (yi, wy) in [(y0, 1.0 - fy), (y0 + 1, fy)] {
        if yi < 0 || yi >= d as isize {
            continue;
        }
        for (xi, wx) in [(x0, 1.0 - fx), (x0 + 1, fx)] {
            if xi < 0 || xi >= d as isize {
                continue;
            }
            let cell = (yi as usize * d + xi as usize) * b;
            for (oi, wo) in [(o0, 1.0 - fo), (o0 + 1, fo)] {
                let bin = oi.rem_euclid(b as isize) as usize;
                histogram[cell + bin] += weight * wx * wy * wo;
            }
        }
    }
}

impl Sift {
    /// Extract a descriptor for every (keypoint, orientation) pair.
    ///
    /// # Arguments
    /// * `scale_space` - The scale space the keypoints were detected in.
    /// * `orientations` - Oriented keypoints, grouped per octave.
    /// # Return value
    /// Descriptors grouped per octave. Pairs whose patch does not fit in the
    /// octave are dropped.
    pub fn extract_descriptors(
        &self,
        scale_space: &ScaleSpace,
        orientations: &[Vec<KeyPointOrientations>],
    ) -> Result<Vec<Vec<Descriptor>>, Error> {
        let mut total = 0;
        scale_space
            .octaves
            .iter()
            .zip(orientations)
            .map(|(octave, oriented)| -> Result<Vec<Descriptor>, Error> {
                #[cfg(not(feature = "rayon"))]
                let descriptors: Vec<Descriptor> = oriented
                    .iter()
                    .flat_map(|o| o.orientations.iter().map(move |&theta| (o.keypoint, theta)))
                    .filter_map(|(keypoint, theta)| self.descriptor(octave, &keypoint, theta).ok())
                    .collect();
                #[cfg(feature = "rayon")]
                let descriptors: Vec<Descriptor> = oriented
                    .par_iter()
                    .flat_map_iter(|o| o.orientations.iter().map(move |&theta| (o.keypoint, theta)))
                    .filter_map(|(keypoint, theta)| self.descriptor(octave, &keypoint, theta).ok())
                    .collect();
                debug!(
                    "Octave {}: {} descriptors.",
                    octave.index,
                    descriptors.len()
                );
                total += descriptors.len();
                check_capacity("descriptors", total, self.maximum_descriptors)?;
                Ok(descriptors)
            })
            .collect()
    }

    /// Build the descriptor of `keypoint` with the patch rotated to `theta`.
    ///
    /// # Arguments
    /// * `octave` - The octave the keypoint was detected in.
    /// * `keypoint` - The keypoint.
    /// * `theta` - The orientation in radians.
    /// # Return value
    /// The descriptor, [`Error::SampleOutOfBounds`] if the patch leaves the
    /// octave or [`Error::DegenerateDescriptor`] if there is no gradient.
    pub fn descriptor(
        &self,
        octave: &Octave,
        keypoint: &KeyPoint,
        theta: f32,
    ) -> Result<Descriptor, Error> {
        let d = self.descriptor_histograms_per_axis;
        let b = self.descriptor_orientation_bins;
        let x = keypoint.point.0 / octave.delta;
        let y = keypoint.point.1 / octave.delta;
        let sigma = keypoint.sigma / octave.delta;
        let histogram_width = 2.0 * self.lambda_descriptor * sigma / d as f32;
        let radius = (histogram_width * SQRT_2 * (d + 1) as f32 * 0.5).round() as isize;
        let (cx, cy) = (x.round() as isize, y.round() as isize);
        if cx - radius < 1
            || cx + radius > octave.width as isize - 2
            || cy - radius < 1
            || cy + radius > octave.height as isize - 2
        {
            return Err(Error::SampleOutOfBounds {
                x: cx,
                y: cy,
                width: octave.width,
                height: octave.height,
            });
        }

        let magnitudes = &octave.magnitudes[keypoint.scale];
        let orientations = &octave.orientations[keypoint.scale];
        let (sin, cos) = theta.sin_cos();
        let grid_center = d as f32 / 2.0 - 0.5;
        let window = d as f32 * d as f32 * 0.5;
        let mut histogram = vec![0f32; d * d * b];
        for n in cy - radius..=cy + radius {
            for m in cx - radius..=cx + radius {
                let dx = m as f32 - x;
                let dy = n as f32 - y;
                let rx = (cos * dx + sin * dy) / histogram_width;
                let ry = (-sin * dx + cos * dy) / histogram_width;
                let gx = rx + grid_center;
                let gy = ry + grid_center;
                if gx <= -1.0 || gx >= d as f32 || gy <= -1.0 || gy >= d as f32 {
                    continue;
                }
                let (m, n) = (m as usize, n as usize);
                let weight = (-(rx * rx + ry * ry) / window).exp() * magnitudes.get(m, n);
                let angle = (orientations.get(m, n) - theta).rem_euclid(TAU);
                trilinear_add(
                    &mut histogram,
                    (gx, gy, angle * b as f32 / TAU),
                    weight,
                    d,
                    b,
                );
            }
        }

        if !normalize(&mut histogram) {
            return Err(Error::DegenerateDescriptor);
        }
        clip(&mut histogram, CLIP_THRESHOLD);
        normalize(&mut histogram);
        let features = quantize(&histogram);
        let key = index_key(&features, d, b);
        Ok(Descriptor {
            keypoint: *keypoint,
            theta,
            features,
            raw_features: histogram,
            key,
        })
    }
}
