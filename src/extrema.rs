use crate::{check_capacity, Error, KeyPoint, Octave, ScaleSpace, Sift};
use cv_core::nalgebra::{Matrix3, Vector3};
use log::*;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Interpolation offsets at or beyond this move the sample to the neighbor.
const MAX_OFFSET: f32 = 0.6;

/// A strict local extremum of the difference of Gaussians, before refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtremaCandidate {
    pub octave: usize,
    pub x: usize,
    pub y: usize,
    pub scale: usize,
    pub value: f32,
}

/// Central difference gradient and Hessian of the DoG in `(x, y, scale)`.
fn dog_derivatives(
    octave: &Octave,
    x: usize,
    y: usize,
    scale: usize,
) -> (Vector3<f32>, Matrix3<f32>) {
    let d = |dx: isize, dy: isize, ds: isize| {
        octave.dog(
            (scale as isize + ds) as usize,
            (x as isize + dx) as usize,
            (y as isize + dy) as usize,
        )
    };
    let v = d(0, 0, 0);
    let gradient = Vector3::new(
        0.5 * (d(1, 0, 0) - d(-1, 0, 0)),
        0.5 * (d(0, 1, 0) - d(0, -1, 0)),
        0.5 * (d(0, 0, 1) - d(0, 0, -1)),
    );
    let dxx = d(1, 0, 0) + d(-1, 0, 0) - 2.0 * v;
    let dyy = d(0, 1, 0) + d(0, -1, 0) - 2.0 * v;
    let dss = d(0, 0, 1) + d(0, 0, -1) - 2.0 * v;
    let dxy = 0.25 * (d(1, 1, 0) - d(-1, 1, 0) - d(1, -1, 0) + d(-1, -1, 0));
    let dxs = 0.25 * (d(1, 0, 1) - d(-1, 0, 1) - d(1, 0, -1) + d(-1, 0, -1));
    let dys = 0.25 * (d(0, 1, 1) - d(0, -1, 1) - d(0, 1, -1) + d(0, -1, -1));
    let hessian = Matrix3::new(
        dxx, dxy, dxs, //
        dxy, dyy, dys, //
        dxs, dys, dss,
    );
    (gradient, hessian)
}

/// Integer step taken along an axis for a given interpolation offset.
fn step(offset: f32) -> isize {
    if offset >= MAX_OFFSET {
        1
    } else if offset <= -MAX_OFFSET {
        -1
    } else {
        0
    }
}

impl Sift {
    /// Test whether the DoG value at `(x, y, scale)` is strictly greater or
    /// strictly smaller than all 26 neighbors.
    fn is_extremum(&self, octave: &Octave, x: usize, y: usize, scale: usize) -> bool {
        let value = octave.dog(scale, x, y);
        let mut is_max = true;
        let mut is_min = true;
        for s in scale - 1..=scale + 1 {
            let layer = &octave.differences[s];
            for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    if (s, nx, ny) == (scale, x, y) {
                        continue;
                    }
                    let neighbor = layer.get(nx, ny);
                    is_max &= value > neighbor;
                    is_min &= value < neighbor;
                    if !is_max && !is_min {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn scan_layer(&self, octave: &Octave, scale: usize) -> Vec<ExtremaCandidate> {
        let mut candidates = vec![];
        for y in 1..octave.height.saturating_sub(1) {
            for x in 1..octave.width.saturating_sub(1) {
                if self.is_extremum(octave, x, y, scale) {
                    candidates.push(ExtremaCandidate {
                        octave: octave.index,
                        x,
                        y,
                        scale,
                        value: octave.dog(scale, x, y),
                    });
                }
            }
        }
        candidates
    }

    /// Scan every interior DoG pixel of the inner `scales_per_octave` layers
    /// for strict 3x3x3 extrema.
    pub fn find_extrema(&self, octave: &Octave) -> Vec<ExtremaCandidate> {
        #[cfg(not(feature = "rayon"))]
        {
            (1..=self.scales_per_octave)
                .flat_map(|scale| self.scan_layer(octave, scale))
                .collect()
        }
        #[cfg(feature = "rayon")]
        {
            (1..=self.scales_per_octave)
                .into_par_iter()
                .flat_map_iter(|scale| self.scan_layer(octave, scale))
                .collect()
        }
    }

    /// Refine a candidate to sub-pixel and sub-scale precision.
    ///
    /// Returns `None` when the candidate does not converge, walks out of the
    /// border margin, has a singular Hessian, has too little contrast, or
    /// lies on an edge.
    ///
    /// # Arguments
    /// * `octave` - The octave the candidate was found in.
    /// * `candidate` - The extremum to refine.
    /// * `input_size` - Width and height of the input image, for normalization.
    pub fn refine_candidate(
        &self,
        octave: &Octave,
        candidate: &ExtremaCandidate,
        input_size: (usize, usize),
    ) -> Option<KeyPoint> {
        let border = self.image_border as isize;
        let x_range = border..octave.width as isize - border;
        let y_range = border..octave.height as isize - border;
        let scale_range = 1..=self.scales_per_octave as isize;
        let (mut x, mut y, mut scale) = (
            candidate.x as isize,
            candidate.y as isize,
            candidate.scale as isize,
        );
        for _ in 0..self.max_interpolation_iterations {
            if !x_range.contains(&x) || !y_range.contains(&y) || !scale_range.contains(&scale) {
                return None;
            }
            let (gradient, hessian) =
                dog_derivatives(octave, x as usize, y as usize, scale as usize);
            let alpha = -(hessian.try_inverse()? * gradient);
            if alpha.iter().all(|offset| offset.abs() < MAX_OFFSET) {
                return self.accept(
                    octave,
                    (x as usize, y as usize, scale as usize),
                    &gradient,
                    &hessian,
                    &alpha,
                    input_size,
                );
            }
            x += step(alpha.x);
            y += step(alpha.y);
            scale += step(alpha.z);
        }
        None
    }

    /// Contrast and edge tests on a converged interpolation, then build the keypoint.
    fn accept(
        &self,
        octave: &Octave,
        (x, y, scale): (usize, usize, usize),
        gradient: &Vector3<f32>,
        hessian: &Matrix3<f32>,
        alpha: &Vector3<f32>,
        (input_width, input_height): (usize, usize),
    ) -> Option<KeyPoint> {
        let response = octave.dog(scale, x, y) + 0.5 * gradient.dot(alpha);
        if response.abs() <= self.dog_threshold {
            return None;
        }

        let (hxx, hyy, hxy) = (hessian[(0, 0)], hessian[(1, 1)], hessian[(0, 1)]);
        let trace = hxx + hyy;
        let determinant = hxx * hyy - hxy * hxy;
        if determinant <= 0.0 {
            return None;
        }
        let edge = self.edge_threshold;
        if trace * trace / determinant >= (edge + 1.0).powi(2) / edge {
            return None;
        }

        let fx = x as f32 + alpha.x;
        let fy = y as f32 + alpha.y;
        let border = self.image_border as f32;
        if fx < border
            || fx >= (octave.width - self.image_border) as f32
            || fy < border
            || fy >= (octave.height - self.image_border) as f32
        {
            return None;
        }

        let point = (fx * octave.delta, fy * octave.delta);
        Some(KeyPoint {
            octave: octave.index,
            scale,
            sub_scale: alpha.z,
            scaled_point: (x, y),
            point,
            normalized_point: (point.0 / input_width as f32, point.1 / input_height as f32),
            sigma: octave.sigmas[scale] * (octave.sigmas[1] / octave.sigmas[0]).powf(alpha.z),
            response,
        })
    }

    /// Find and refine the keypoints of every octave.
    ///
    /// # Arguments
    /// * `scale_space` - The scale space built by [`Sift::scale_space`].
    /// # Return value
    /// The keypoints of each octave, or [`Error::CapacityExceeded`] if one of
    /// the configured maxima was exceeded.
    pub fn detect_keypoints(&self, scale_space: &ScaleSpace) -> Result<Vec<Vec<KeyPoint>>, Error> {
        let input_size = (scale_space.width, scale_space.height);
        let mut total_candidates = 0;
        let mut total_keypoints = 0;
        scale_space
            .octaves
            .iter()
            .map(|octave| -> Result<Vec<KeyPoint>, Error> {
                let candidates = self.find_extrema(octave);
                total_candidates += candidates.len();
                check_capacity("candidates", total_candidates, self.maximum_candidates)?;
                #[cfg(not(feature = "rayon"))]
                let keypoints: Vec<KeyPoint> = candidates
                    .iter()
                    .filter_map(|candidate| self.refine_candidate(octave, candidate, input_size))
                    .collect();
                #[cfg(feature = "rayon")]
                let keypoints: Vec<KeyPoint> = candidates
                    .par_iter()
                    .filter_map(|candidate| self.refine_candidate(octave, candidate, input_size))
                    .collect();
                debug!(
                    "Octave {}: {} candidates refined to {} keypoints.",
                    octave.index,
                    candidates.len(),
                    keypoints.len()
                );
                total_keypoints += keypoints.len();
                check_capacity("keypoints", total_keypoints, self.maximum_keypoints)?;
                Ok(keypoints)
            })
            .collect()
    }
}
