use crate::image::{difference, gaussian_blur, gradients, GrayFloatImage};
use crate::Sift;
use log::*;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// One sampling density of the scale space and every image computed at it.
#[derive(Debug, Clone)]
pub struct Octave {
    /// Octave index `o`
    pub index: usize,
    /// Sampling distance in input pixels, `delta_minimum * 2^o`
    pub delta: f32,
    pub width: usize,
    pub height: usize,
    /// Absolute blur of each Gaussian image, in input pixels
    pub sigmas: Vec<f32>,
    /// `scales_per_octave + 3` progressively blurred images
    pub gaussians: Vec<GrayFloatImage>,
    /// `scales_per_octave + 2` differences of adjacent Gaussian images
    pub differences: Vec<GrayFloatImage>,
    /// Gradient magnitude of each Gaussian image
    pub magnitudes: Vec<GrayFloatImage>,
    /// Gradient orientation of each Gaussian image
    pub orientations: Vec<GrayFloatImage>,
}

impl Octave {
    /// Lay out octave `index` for an input of `width` x `height` pixels.
    ///
    /// Images are left empty until the scale space is built.
    fn new(index: usize, width: usize, height: usize, options: &Sift) -> Octave {
        let delta = options.delta_minimum * 2f32.powi(index as i32);
        let sigmas = (0..options.scales_per_octave + 3)
            .map(|s| {
                delta / options.delta_minimum
                    * options.sigma_minimum
                    * 2f32.powf(s as f32 / options.scales_per_octave as f32)
            })
            .collect();
        Octave {
            index,
            delta,
            width: (width as f32 / delta).floor() as usize,
            height: (height as f32 / delta).floor() as usize,
            sigmas,
            gaussians: vec![],
            differences: vec![],
            magnitudes: vec![],
            orientations: vec![],
        }
    }

    /// DoG value at integer scale `scale` and pixel `(x, y)`.
    pub fn dog(&self, scale: usize, x: usize, y: usize) -> f32 {
        self.differences[scale].get(x, y)
    }

    /// Fill the image stacks starting from an already blurred `seed`.
    fn build(&mut self, seed: GrayFloatImage) {
        debug_assert_eq!((seed.width(), seed.height()), (self.width, self.height));
        let mut gaussians = Vec::with_capacity(self.sigmas.len());
        gaussians.push(seed);
        for s in 1..self.sigmas.len() {
            let rho = (self.sigmas[s].powi(2) - self.sigmas[s - 1].powi(2)).sqrt() / self.delta;
            let blurred = gaussian_blur(&gaussians[s - 1], rho);
            gaussians.push(blurred);
        }
        trace!("Gaussian stack of octave {} finished.", self.index);

        #[cfg(not(feature = "rayon"))]
        {
            self.differences = gaussians
                .windows(2)
                .map(|pair| difference(&pair[1], &pair[0]))
                .collect();
            (self.magnitudes, self.orientations) = gaussians.iter().map(gradients).unzip();
        }
        #[cfg(feature = "rayon")]
        {
            self.differences = gaussians
                .par_windows(2)
                .map(|pair| difference(&pair[1], &pair[0]))
                .collect();
            (self.magnitudes, self.orientations) = gaussians.par_iter().map(gradients).unzip();
        }
        trace!("Differences and gradients of octave {} finished.", self.index);
        self.gaussians = gaussians;
    }
}

/// The complete Gaussian scale space of one input image.
#[derive(Debug, Clone)]
pub struct ScaleSpace {
    /// Input image width in pixels
    pub width: usize,
    /// Input image height in pixels
    pub height: usize,
    pub octaves: Vec<Octave>,
}

impl Sift {
    /// Compute the octave layout for an input of the given dimensions.
    ///
    /// Panics if the configuration is invalid or the image is too small to
    /// produce a non-empty coarsest octave.
    pub fn allocate_octaves(&self, width: usize, height: usize) -> Vec<Octave> {
        self.validate();
        let octaves: Vec<Octave> = (0..self.num_octaves)
            .map(|index| Octave::new(index, width, height, self))
            .collect();
        for octave in &octaves {
            assert!(
                octave.width > 0 && octave.height > 0,
                "a {}x{} image is too small for {} octaves",
                width,
                height,
                self.num_octaves
            );
            debug!(
                "Octave {}: {}x{}, delta {}, sigmas {:?}",
                octave.index, octave.width, octave.height, octave.delta, octave.sigmas
            );
        }
        octaves
    }

    /// The first Gaussian image of octave 0: the input resampled to
    /// `delta_minimum` spacing and blurred up to `sigma_minimum`.
    fn seed_image(&self, image: &GrayFloatImage, octave: &Octave) -> GrayFloatImage {
        let resampled = image.resample_bilinear(octave.width, octave.height, self.delta_minimum);
        let sigma = (self.sigma_minimum.powi(2) - self.sigma_input.powi(2)).sqrt()
            / self.delta_minimum;
        gaussian_blur(&resampled, sigma)
    }

    /// Build the Gaussian, difference of Gaussians and gradient stacks of
    /// every octave.
    ///
    /// # Arguments
    /// * `image` - The luminance input image.
    pub fn scale_space(&self, image: &GrayFloatImage) -> ScaleSpace {
        let mut octaves = self.allocate_octaves(image.width(), image.height());
        trace!("Creating seed image.");
        let mut seed = self.seed_image(image, &octaves[0]);
        for octave in octaves.iter_mut() {
            octave.build(seed);
            seed = octave.gaussians[self.scales_per_octave].downsample_nearest();
        }
        ScaleSpace {
            width: image.width(),
            height: image.height(),
            octaves,
        }
    }
}
