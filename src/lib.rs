mod descriptors;
mod extrema;
pub mod image;
mod matching;
mod orientation;
mod pyramid;
pub mod trie;
pub mod vector;

pub use descriptors::{index_key, index_key_order, Descriptor};
pub use extrema::ExtremaCandidate;
pub use matching::{Correspondence, Matcher};
pub use orientation::KeyPointOrientations;
pub use pyramid::{Octave, ScaleSpace};

use crate::image::GrayFloatImage;
use ::image::{DynamicImage, ImageError};
use cv_core::nalgebra::Point2;
use cv_core::ImagePoint;
use log::*;
use std::path::Path;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A refined, scale-space stable point of interest.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KeyPoint {
    /// Octave the keypoint was detected in.
    pub octave: usize,
    /// Integer scale index inside the octave, in `1..=scales_per_octave`.
    pub scale: usize,
    /// Fractional offset from `scale` found by interpolation, in `(-0.6, 0.6)`.
    pub sub_scale: f32,
    /// Integer pixel coordinate in the octave's own sampling grid.
    pub scaled_point: (usize, usize),
    /// Sub-pixel position in input image pixels.
    /// +x faces right and +y faces toward the bottom of the image.
    pub point: (f32, f32),
    /// `point` divided by the input image dimensions.
    pub normalized_point: (f32, f32),
    /// Continuous blur level, in input image pixels.
    pub sigma: f32,
    /// Interpolated difference of Gaussians value. Negative for bright blobs.
    pub response: f32,
}

impl ImagePoint for KeyPoint {
    fn image_point(&self) -> Point2<f64> {
        Point2::new(self.point.0 as f64, self.point.1 as f64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sample ({x}, {y}) is outside of the {width}x{height} octave")]
    SampleOutOfBounds {
        x: isize,
        y: isize,
        width: usize,
        height: usize,
    },
    #[error("descriptor histogram is empty")]
    DegenerateDescriptor,
    #[error("more than {capacity} {stage} were produced")]
    CapacityExceeded {
        stage: &'static str,
        capacity: usize,
    },
    #[error("failed to load image: {0}")]
    Image(#[from] ImageError),
}

/// Contains the configuration parameters of SIFT.
///
/// The parameter that most affects the number of features is `dog_threshold`.
/// [`Sift::new`] sets it and leaves everything else at the default, and
/// [`Sift::sparse`] and [`Sift::dense`] are provided for the common cases.
/// The default value of `dog_threshold` is `0.0133`.
///
/// Values are expected to be sane (positive thresholds, at least one octave,
/// `sigma_minimum > sigma_input`). This is checked by [`Sift::validate`] and a
/// violation panics.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sift {
    /// Blur of the seed image, in input pixels.
    pub sigma_minimum: f32,

    /// Sampling distance of the seed image. `0.5` doubles the input.
    pub delta_minimum: f32,

    /// Blur already assumed present in the input image.
    pub sigma_input: f32,

    pub num_octaves: usize,

    pub scales_per_octave: usize,

    /// Minimum absolute interpolated DoG value of a keypoint.
    pub dog_threshold: f32,

    /// Maximum ratio of principal curvatures before a point counts as an edge.
    pub edge_threshold: f32,

    pub max_interpolation_iterations: usize,

    /// Margin, in octave pixels, that keypoints must keep from the image edge.
    pub image_border: usize,

    /// Gaussian window of the orientation histogram, in units of sigma.
    pub lambda_orientation: f32,

    pub orientation_bins: usize,

    /// Fraction of the histogram maximum a secondary peak must reach.
    pub orientation_threshold: f32,

    pub orientation_smoothing_iterations: usize,

    /// Descriptor grid size `d`, producing `d * d` histograms.
    pub descriptor_histograms_per_axis: usize,

    pub descriptor_orientation_bins: usize,

    /// Gaussian window of the descriptor patch, in units of sigma.
    pub lambda_descriptor: f32,

    /// Fail instead of growing past this many extrema candidates per run.
    pub maximum_candidates: Option<usize>,

    pub maximum_keypoints: Option<usize>,

    pub maximum_descriptors: Option<usize>,
}

impl Sift {
    /// This convenience constructor is provided for the very common case
    /// that the detector threshold needs to be modified.
    pub fn new(dog_threshold: f32) -> Self {
        Self {
            dog_threshold,
            ..Default::default()
        }
    }

    /// Create a `Sift` that sparsely detects features.
    ///
    /// Uses a threshold of `0.04` (default is `0.0133`).
    pub fn sparse() -> Self {
        Self::new(0.04)
    }

    /// Create a `Sift` that densely detects features.
    ///
    /// Uses a threshold of `0.005` (default is `0.0133`).
    pub fn dense() -> Self {
        Self::new(0.005)
    }

    /// Length of a descriptor feature vector, `d * d * b`.
    pub fn descriptor_len(&self) -> usize {
        self.descriptor_histograms_per_axis
            * self.descriptor_histograms_per_axis
            * self.descriptor_orientation_bins
    }

    /// Panics if the configuration cannot describe a scale space.
    pub fn validate(&self) {
        assert!(self.num_octaves > 0, "at least one octave is required");
        assert!(
            self.scales_per_octave > 0,
            "at least one scale per octave is required"
        );
        assert!(self.delta_minimum > 0.0, "delta_minimum must be positive");
        assert!(
            self.sigma_minimum > self.sigma_input && self.sigma_input >= 0.0,
            "sigma_minimum must exceed a non-negative sigma_input"
        );
        assert!(self.dog_threshold > 0.0, "dog_threshold must be positive");
        assert!(self.edge_threshold > 0.0, "edge_threshold must be positive");
        assert!(self.image_border > 0, "image_border must be at least one pixel");
        assert!(
            self.max_interpolation_iterations > 0,
            "at least one interpolation iteration is required"
        );
        assert!(
            self.lambda_orientation > 0.0 && self.lambda_descriptor > 0.0,
            "window sizes must be positive"
        );
        assert!(self.orientation_bins >= 3, "need at least 3 orientation bins");
        assert!(
            self.orientation_threshold > 0.0 && self.orientation_threshold <= 1.0,
            "orientation_threshold must be in (0, 1]"
        );
        assert!(
            self.descriptor_histograms_per_axis > 0 && self.descriptor_orientation_bins > 0,
            "descriptor grid must be non-empty"
        );
    }
}

impl Default for Sift {
    fn default() -> Sift {
        Sift {
            sigma_minimum: 0.8,
            delta_minimum: 0.5,
            sigma_input: 0.5,
            num_octaves: 5,
            scales_per_octave: 3,
            dog_threshold: 0.0133,
            edge_threshold: 10.0,
            max_interpolation_iterations: 5,
            image_border: 5,
            lambda_orientation: 1.5,
            orientation_bins: 36,
            orientation_threshold: 0.8,
            orientation_smoothing_iterations: 6,
            descriptor_histograms_per_axis: 4,
            descriptor_orientation_bins: 8,
            lambda_descriptor: 6.0,
            maximum_candidates: None,
            maximum_keypoints: None,
            maximum_descriptors: None,
        }
    }
}

/// Fail with [`Error::CapacityExceeded`] if `count` is over an optional limit.
pub(crate) fn check_capacity(
    stage: &'static str,
    count: usize,
    capacity: Option<usize>,
) -> Result<(), Error> {
    match capacity {
        Some(capacity) if count > capacity => Err(Error::CapacityExceeded { stage, capacity }),
        _ => Ok(()),
    }
}

impl Sift {
    /// Extract features using SIFT.
    ///
    /// This performs all operations end-to-end. Every stage is also public, so
    /// a client interested in only part of the process can call them directly;
    /// this function documents how they fit together.
    ///
    /// # Arguments
    /// * `image` - The input image for which to extract features.
    ///
    /// Returns the keypoints and the descriptors, both grouped per octave.
    ///
    /// # Example
    /// ```
    /// let sift = sift::Sift::default();
    /// let image = image::DynamicImage::new_luma8(64, 64);
    /// let (keypoints, descriptors) = sift.extract(&image).unwrap();
    /// assert!(keypoints.iter().all(Vec::is_empty));
    /// assert_eq!(descriptors.len(), 5);
    /// ```
    #[allow(clippy::type_complexity)]
    pub fn extract(
        &self,
        image: &DynamicImage,
    ) -> Result<(Vec<Vec<KeyPoint>>, Vec<Vec<Descriptor>>), Error> {
        self.extract_from_gray_float_image(&GrayFloatImage::from_dynamic(image))
    }

    /// Same as [`Sift::extract`], starting from a luminance image in `[0, 1]`.
    #[allow(clippy::type_complexity)]
    pub fn extract_from_gray_float_image(
        &self,
        image: &GrayFloatImage,
    ) -> Result<(Vec<Vec<KeyPoint>>, Vec<Vec<Descriptor>>), Error> {
        let scale_space = self.scale_space(image);
        trace!("Detecting keypoints.");
        let keypoints = self.detect_keypoints(&scale_space)?;
        trace!("Assigning orientations.");
        let orientations = self.assign_orientations(&scale_space, &keypoints);
        trace!("Extracting descriptors.");
        let descriptors = self.extract_descriptors(&scale_space, &orientations)?;
        trace!("Computing descriptors finished.");
        info!(
            "Extracted {} features from {} keypoints",
            descriptors.iter().map(Vec::len).sum::<usize>(),
            keypoints.iter().map(Vec::len).sum::<usize>()
        );
        Ok((keypoints, descriptors))
    }

    /// Extract features using SIFT from an image on disk.
    ///
    /// # Examples
    /// ```no_run
    /// let sift = sift::Sift::default();
    /// let (keypoints, descriptors) = sift.extract_path("scene.png").unwrap();
    /// ```
    #[allow(clippy::type_complexity)]
    pub fn extract_path(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(Vec<Vec<KeyPoint>>, Vec<Vec<Descriptor>>), Error> {
        self.extract(&::image::open(path)?)
    }
}
