use derive_more::{Deref, DerefMut};
use image::{DynamicImage, ImageBuffer, Luma};
use log::*;
use ndarray::{azip, s, Array2, ArrayView2};
use std::f32::consts::TAU;
use wide::f32x4;

type GrayImageBuffer = ImageBuffer<Luma<f32>, Vec<f32>>;

/// BT.709 luma weights.
const LUMA_WEIGHTS: [f32; 3] = [0.2126, 0.7152, 0.0722];

/// The single channel float image every stage of the pipeline operates on.
///
/// Pixel values are expected to lie between 0 and 1. The wrapper keeps the
/// image crate's buffer so loading and debugging output stay trivial, while
/// the filters below work on the raw row-major storage directly.
#[derive(Debug, Clone, PartialEq, Deref, DerefMut)]
pub struct GrayFloatImage(pub GrayImageBuffer);

impl GrayFloatImage {
    /// Create a unit float luminance image from any `DynamicImage`.
    ///
    /// Color images are reduced with BT.709 luma weights.
    pub fn from_dynamic(input_image: &DynamicImage) -> Self {
        let rgb = input_image.to_rgb32f();
        info!("Loaded a {} x {} image", rgb.width(), rgb.height());
        Self(ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
            let channels = rgb[(x, y)].0;
            Luma([channels
                .iter()
                .zip(LUMA_WEIGHTS.iter())
                .map(|(c, w)| c * w)
                .sum()])
        }))
    }

    /// Build an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        Self(ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
            Luma([f(x as usize, y as usize)])
        }))
    }

    pub fn from_array2(arr: Array2<f32>) -> Self {
        let (height, width) = arr.dim();
        let arr = if arr.is_standard_layout() {
            arr
        } else {
            arr.as_standard_layout().into_owned()
        };
        Self(
            ImageBuffer::from_raw(width as u32, height as u32, arr.into_raw_vec())
                .expect("raw vector didn't have enough pixels for the image"),
        )
    }

    /// View the pixels as a `(height, width)` array.
    pub fn ref_array2(&self) -> ArrayView2<'_, f32> {
        ArrayView2::from_shape((self.height(), self.width()), &self.0.as_raw()[..])
            .expect("image buffer length matches its dimensions")
    }

    pub fn width(&self) -> usize {
        self.0.width() as usize
    }

    pub fn height(&self) -> usize {
        self.0.height() as usize
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.0.as_raw()[y * self.width() + x]
    }

    /// Resample to `width` x `height` with bilinear interpolation, where output
    /// pixel `m` reads the input at `m * spacing`.
    ///
    /// Samples past the last row or column reuse the edge pixel.
    pub fn resample_bilinear(&self, width: usize, height: usize, spacing: f32) -> Self {
        let last_x = self.width() - 1;
        let last_y = self.height() - 1;
        Self::from_fn(width, height, |x, y| {
            let px = x as f32 * spacing;
            let py = y as f32 * spacing;
            let x0 = (px.floor() as usize).min(last_x);
            let y0 = (py.floor() as usize).min(last_y);
            let x1 = (x0 + 1).min(last_x);
            let y1 = (y0 + 1).min(last_y);
            let fx = (px - x0 as f32).clamp(0.0, 1.0);
            let fy = (py - y0 as f32).clamp(0.0, 1.0);
            let top = self.get(x0, y0) * (1.0 - fx) + self.get(x1, y0) * fx;
            let bottom = self.get(x0, y1) * (1.0 - fx) + self.get(x1, y1) * fx;
            top * (1.0 - fy) + bottom * fy
        })
    }

    /// Nearest neighbor 2x downsampling: `out[x, y] = in[2x, 2y]`.
    pub fn downsample_nearest(&self) -> Self {
        let width = self.width() / 2;
        let height = self.height() / 2;
        Self::from_array2(
            self.ref_array2()
                .slice(s![..height * 2;2, ..width * 2;2])
                .to_owned(),
        )
    }
}

/// Pixelwise `upper - lower`.
pub fn difference(upper: &GrayFloatImage, lower: &GrayFloatImage) -> GrayFloatImage {
    assert_eq!(
        (upper.width(), upper.height()),
        (lower.width(), lower.height()),
        "difference of images with different dimensions"
    );
    let mut output = Array2::zeros((upper.height(), upper.width()));
    azip!((out in &mut output, &a in &upper.ref_array2(), &b in &lower.ref_array2()) {
        *out = a - b;
    });
    GrayFloatImage::from_array2(output)
}

/// Central difference gradient magnitude and orientation (radians in `[0, 2π)`).
///
/// The one pixel border has no central difference and is left at zero.
pub fn gradients(image: &GrayFloatImage) -> (GrayFloatImage, GrayFloatImage) {
    let mut magnitude = Array2::zeros((image.height(), image.width()));
    let mut orientation = Array2::zeros((image.height(), image.width()));
    if image.width() >= 3 && image.height() >= 3 {
        let pixels = image.ref_array2();
        azip!((
            m in magnitude.slice_mut(s![1..-1, 1..-1]),
            o in orientation.slice_mut(s![1..-1, 1..-1]),
            &right in pixels.slice(s![1..-1, 2..]),
            &left in pixels.slice(s![1..-1, ..-2]),
            &below in pixels.slice(s![2.., 1..-1]),
            &above in pixels.slice(s![..-2, 1..-1]),
        ) {
            let dx = 0.5 * (right - left);
            let dy = 0.5 * (below - above);
            *m = dx.hypot(dy);
            *o = dy.atan2(dx).rem_euclid(TAU);
        });
    }
    (
        GrayFloatImage::from_array2(magnitude),
        GrayFloatImage::from_array2(orientation),
    )
}

/// Symmetric boundary reflection: `-1 -> 0`, `-2 -> 1`, `len -> len - 1`.
///
/// Works for offsets larger than the signal itself, which happens when a
/// wide kernel meets a small octave.
pub fn mirror(index: isize, len: usize) -> usize {
    let period = 2 * len as isize;
    let wrapped = index.rem_euclid(period);
    if wrapped >= len as isize {
        (period - 1 - wrapped) as usize
    } else {
        wrapped as usize
    }
}

fn simd_kernel(kernel: &[f32]) -> Vec<f32x4> {
    kernel
        .chunks(4)
        .map(|chunk| {
            let mut data = [0.0; 4];
            data[..chunk.len()].copy_from_slice(chunk);
            f32x4::new(data)
        })
        .collect()
}

fn convolve_window(window: &[f32], kernel_simd: &[f32x4]) -> f32 {
    window
        .chunks_exact(4)
        .map(|chunk| f32x4::new([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .zip(kernel_simd.iter())
        .fold(f32x4::splat(0.), |acc, (a, b)| a.mul_add(*b, acc))
        .reduce_add()
}

pub fn horizontal_filter(image: &GrayImageBuffer, kernel: &[f32]) -> GrayImageBuffer {
    let kernel_size = kernel.len();
    debug_assert!(kernel_size % 2 == 1);
    let kernel_half_size = kernel_size / 2;
    let width = image.width() as usize;
    let height = image.height() as usize;
    let mut output = vec![0.0; width * height];
    let kernel_simd = simd_kernel(kernel);
    let kernel_simd_size = 4 * kernel_simd.len();
    let padded_width = width + kernel_half_size * 2;
    let mut scratch = vec![0f32; padded_width + kernel_simd_size - kernel_size];
    for (row_in, row_out) in image
        .as_raw()
        .chunks_exact(width)
        .zip(output.chunks_exact_mut(width))
    {
        // Reflected borders on both sides, zeros past the end for the SIMD tail.
        for (i, value) in scratch[..padded_width].iter_mut().enumerate() {
            *value = row_in[mirror(i as isize - kernel_half_size as isize, width)];
        }
        scratch
            .windows(kernel_simd_size)
            .zip(row_out)
            .for_each(|(window, output)| *output = convolve_window(window, &kernel_simd));
    }
    GrayImageBuffer::from_raw(width as u32, height as u32, output)
        .expect("output buffer has one value per pixel")
}

pub fn vertical_filter(image: &GrayImageBuffer, kernel: &[f32]) -> GrayImageBuffer {
    let kernel_size = kernel.len();
    debug_assert!(kernel_size % 2 == 1);
    let kernel_half_size = kernel_size / 2;
    let width = image.width() as usize;
    let height = image.height() as usize;
    let mut output = vec![0.0; width * height];
    let kernel_simd = simd_kernel(kernel);
    let kernel_simd_size = 4 * kernel_simd.len();
    // Columns are transposed into a scratch block 16 floats wide so the
    // kernel always walks contiguous memory.
    const SCRATCH_WIDTH: usize = 16;
    let padded_height = height + kernel_half_size * 2;
    let scratch_height = padded_height + kernel_simd_size - kernel_size;
    let mut scratch = vec![0f32; SCRATCH_WIDTH * scratch_height];
    let pixels = image.as_raw();
    for x_s in (0..width).step_by(SCRATCH_WIDTH) {
        let x_e = (x_s + SCRATCH_WIDTH).min(width);
        for x in x_s..x_e {
            let column = &mut scratch[(x - x_s) * scratch_height..][..padded_height];
            for (i, value) in column.iter_mut().enumerate() {
                let y = mirror(i as isize - kernel_half_size as isize, height);
                *value = pixels[y * width + x];
            }
        }
        scratch
            .chunks(scratch_height)
            .take(x_e - x_s)
            .enumerate()
            .for_each(|(dx, column)| {
                let x = x_s + dx;
                column
                    .windows(kernel_simd_size)
                    .take(height)
                    .enumerate()
                    .for_each(|(y, window)| {
                        output[y * width + x] = convolve_window(window, &kernel_simd);
                    });
            });
    }
    GrayImageBuffer::from_raw(width as u32, height as u32, output)
        .expect("output buffer has one value per pixel")
}

pub fn separable_filter(
    image: &GrayImageBuffer,
    h_kernel: &[f32],
    v_kernel: &[f32],
) -> GrayImageBuffer {
    let h = horizontal_filter(image, h_kernel);
    vertical_filter(&h, v_kernel)
}

/// Normalized Gaussian weights sampled at integer offsets `-n..=n`, where the
/// kernel has `2n + 1` taps.
pub fn gaussian_kernel(sigma: f32, kernel_size: usize) -> Vec<f32> {
    assert!(kernel_size % 2 == 1, "kernel_size must be odd");
    let half_width = (kernel_size / 2) as i32;
    let mut kernel: Vec<f32> = (-half_width..=half_width)
        .map(|i| (-0.5 * (i as f32 / sigma).powi(2)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|v| *v /= sum);
    kernel
}

/// Blur with a separable Gaussian of standard deviation `sigma` pixels,
/// truncated at `ceil(4 * sigma)`.
pub fn gaussian_blur(image: &GrayFloatImage, sigma: f32) -> GrayFloatImage {
    assert!(sigma > 0.0, "sigma must be > 0.0");
    let kernel_radius = (4.0 * sigma).ceil() as usize;
    let kernel = gaussian_kernel(sigma, kernel_radius * 2 + 1);
    GrayFloatImage(separable_filter(image, &kernel, &kernel))
}
