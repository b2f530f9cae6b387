use crate::{Error, KeyPoint, Octave, ScaleSpace, Sift};
use float_ord::FloatOrd;
use std::f32::consts::TAU;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A keypoint together with each dominant gradient direction around it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KeyPointOrientations {
    pub keypoint: KeyPoint,
    /// Radians in `[0, 2π)`. May be empty for a featureless neighborhood.
    pub orientations: Vec<f32>,
}

/// Circular 3-tap box filter, applied `iterations` times.
fn smooth_histogram(histogram: &mut [f32], iterations: usize) {
    let bins = histogram.len();
    let mut previous = histogram.to_vec();
    for _ in 0..iterations {
        previous.copy_from_slice(histogram);
        for (i, value) in histogram.iter_mut().enumerate() {
            *value = (previous[(i + bins - 1) % bins] + previous[i] + previous[(i + 1) % bins])
                / 3.0;
        }
    }
}

/// Angles of every strict local maximum above `threshold * max`, refined by
/// fitting a parabola through the peak and its two neighbors.
fn histogram_peaks(histogram: &[f32], threshold: f32) -> Vec<f32> {
    let bins = histogram.len();
    let max = histogram
        .iter()
        .copied()
        .map(FloatOrd)
        .max()
        .map_or(0.0, |m| m.0);
    if max <= 0.0 {
        return vec![];
    }
    (0..bins)
        .filter_map(|i| {
            let h0 = histogram[i];
            let hm = histogram[(i + bins - 1) % bins];
            let hp = histogram[(i + 1) % bins];
            if h0 <= threshold * max || h0 <= hm || h0 <= hp {
                return None;
            }
            let offset = (hm - hp) / (2.0 * (hm + hp - 2.0 * h0));
            let angle = ((i as f32 + offset) / bins as f32 * TAU).rem_euclid(TAU);
            Some(if angle >= TAU { 0.0 } else { angle })
        })
        .collect()
}

impl Sift {
    /// Compute the dominant orientations of every keypoint.
    ///
    /// Keypoints whose sampling disk leaves the octave are dropped.
    pub fn assign_orientations(
        &self,
        scale_space: &ScaleSpace,
        keypoints: &[Vec<KeyPoint>],
    ) -> Vec<Vec<KeyPointOrientations>> {
        scale_space
            .octaves
            .iter()
            .zip(keypoints)
            .map(|(octave, keypoints)| {
                #[cfg(not(feature = "rayon"))]
                {
                    keypoints
                        .iter()
                        .filter_map(|&keypoint| {
                            Some(KeyPointOrientations {
                                keypoint,
                                orientations: self.orientations(octave, &keypoint).ok()?,
                            })
                        })
                        .collect()
                }
                #[cfg(feature = "rayon")]
                {
                    keypoints
                        .par_iter()
                        .filter_map(|&keypoint| {
                            Some(KeyPointOrientations {
                                keypoint,
                                orientations: self.orientations(octave, &keypoint).ok()?,
                            })
                        })
                        .collect()
                }
            })
            .collect()
    }

    /// Dominant orientations of a single keypoint.
    pub fn orientations(&self, octave: &Octave, keypoint: &KeyPoint) -> Result<Vec<f32>, Error> {
        let mut histogram = self.orientation_histogram(octave, keypoint)?;
        smooth_histogram(&mut histogram, self.orientation_smoothing_iterations);
        Ok(histogram_peaks(&histogram, self.orientation_threshold))
    }

    /// Gaussian weighted histogram of gradient orientations over a disk
    /// around the keypoint.
    ///
    /// # Arguments
    /// * `octave` - The octave the keypoint was detected in.
    /// * `keypoint` - The keypoint.
    /// # Return value
    /// `orientation_bins` accumulated magnitudes, or
    /// [`Error::SampleOutOfBounds`] if the disk does not fit in the octave.
    pub fn orientation_histogram(
        &self,
        octave: &Octave,
        keypoint: &KeyPoint,
    ) -> Result<Vec<f32>, Error> {
        let x = keypoint.point.0 / octave.delta;
        let y = keypoint.point.1 / octave.delta;
        let sigma = keypoint.sigma / octave.delta;
        let lambda = self.lambda_orientation;
        let radius = (3.0 * lambda * sigma).ceil();
        let max_x = octave.width as f32 - 2.0;
        let max_y = octave.height as f32 - 2.0;
        if x - radius < 1.0 || x + radius > max_x || y - radius < 1.0 || y + radius > max_y {
            return Err(Error::SampleOutOfBounds {
                x: x as isize,
                y: y as isize,
                width: octave.width,
                height: octave.height,
            });
        }

        let magnitudes = &octave.magnitudes[keypoint.scale];
        let orientations = &octave.orientations[keypoint.scale];
        let bins = self.orientation_bins;
        let mut histogram = vec![0f32; bins];
        for n in (y - radius).ceil() as usize..=(y + radius).floor() as usize {
            for m in (x - radius).ceil() as usize..=(x + radius).floor() as usize {
                let dx = m as f32 - x;
                let dy = n as f32 - y;
                if dx * dx + dy * dy > radius * radius {
                    continue;
                }
                let (u, v) = (dx / sigma, dy / sigma);
                let weight = (-(u * u + v * v) / (2.0 * lambda * lambda)).exp();
                let bin = (orientations.get(m, n) / TAU * bins as f32).round() as usize % bins;
                histogram[bin] += weight * magnitudes.get(m, n);
            }
        }
        Ok(histogram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::GrayFloatImage;
    use approx::assert_relative_eq;
    use std::f32::consts::PI;

    /// Octave 1 of a 48x48 input, with gradient images given by `f(x, y)`.
    fn gradient_octave(f: impl Fn(usize, usize) -> (f32, f32)) -> (Sift, Octave) {
        let sift = Sift::default();
        let mut octave = sift.allocate_octaves(48, 48).remove(1);
        let images = octave.sigmas.len();
        octave.magnitudes = (0..images)
            .map(|_| GrayFloatImage::from_fn(48, 48, |x, y| f(x, y).0))
            .collect();
        octave.orientations = (0..images)
            .map(|_| GrayFloatImage::from_fn(48, 48, |x, y| f(x, y).1))
            .collect();
        (sift, octave)
    }

    fn keypoint_at(x: f32, y: f32, sigma: f32) -> KeyPoint {
        KeyPoint {
            octave: 1,
            scale: 2,
            sub_scale: 0.0,
            scaled_point: (x as usize, y as usize),
            point: (x, y),
            normalized_point: (x / 48.0, y / 48.0),
            sigma,
            response: 0.1,
        }
    }

    #[test]
    fn uniform_direction_gives_one_orientation() {
        let (sift, octave) = gradient_octave(|_, _| (1.0, 1.0));
        let orientations = sift
            .orientations(&octave, &keypoint_at(24.0, 24.0, 2.0))
            .unwrap();
        assert_eq!(orientations.len(), 1);
        assert!((orientations[0] - 1.0).abs() < PI / 36.0);
    }

    #[test]
    fn two_directions_give_two_orientations() {
        let (sift, octave) =
            gradient_octave(|x, y| (1.0, if (x + y) % 2 == 0 { 1.0 } else { 4.0 }));
        let mut orientations = sift
            .orientations(&octave, &keypoint_at(24.0, 24.0, 2.0))
            .unwrap();
        orientations.sort_by_key(|&a| FloatOrd(a));
        assert_eq!(orientations.len(), 2);
        assert!((orientations[0] - 1.0).abs() < PI / 36.0);
        assert!((orientations[1] - 4.0).abs() < PI / 36.0);
    }

    #[test]
    fn featureless_patch_has_no_orientation() {
        let (sift, octave) = gradient_octave(|_, _| (0.0, 0.0));
        assert!(sift
            .orientations(&octave, &keypoint_at(24.0, 24.0, 2.0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn disk_outside_octave_is_rejected() {
        let (sift, octave) = gradient_octave(|_, _| (1.0, 1.0));
        // Radius is ceil(3 * 1.5 * 2) = 9 octave pixels.
        assert!(matches!(
            sift.orientation_histogram(&octave, &keypoint_at(9.0, 24.0, 2.0)),
            Err(Error::SampleOutOfBounds { .. })
        ));
        assert!(sift
            .orientation_histogram(&octave, &keypoint_at(10.0, 24.0, 2.0))
            .is_ok());
    }

    #[test]
    fn smoothing_preserves_mass() {
        let mut histogram = vec![0.0; 36];
        histogram[0] = 3.0;
        histogram[20] = 1.5;
        smooth_histogram(&mut histogram, 6);
        assert_relative_eq!(histogram.iter().sum::<f32>(), 4.5, epsilon = 1e-5);
        // Wraps around: bin 35 received mass from bin 0.
        assert!(histogram[35] > 0.0);
        assert_relative_eq!(histogram[1], histogram[35], epsilon = 1e-6);
    }

    #[test]
    fn parabolic_peak_interpolation() {
        let mut histogram = vec![0.0; 36];
        histogram[4] = 1.0;
        histogram[5] = 2.0;
        histogram[6] = 1.5;
        let peaks = histogram_peaks(&histogram, 0.8);
        assert_eq!(peaks.len(), 1);
        assert_relative_eq!(peaks[0], (5.0 + 1.0 / 6.0) / 36.0 * TAU, epsilon = 1e-5);
    }

    #[test]
    fn peak_in_first_bin_wraps() {
        let mut histogram = vec![0.0; 36];
        histogram[35] = 1.5;
        histogram[0] = 2.0;
        histogram[1] = 1.0;
        let peaks = histogram_peaks(&histogram, 0.8);
        assert_eq!(peaks.len(), 1);
        assert!(peaks[0] > 35.0 / 36.0 * TAU && peaks[0] < TAU);
    }
}
