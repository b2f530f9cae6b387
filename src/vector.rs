//! Small vector helpers shared by the descriptor, index and matching stages.
//!
//! Everything here works on plain slices so that descriptor features, index
//! keys and histograms can all go through the same code.

use wide::f32x4;

/// Squared Euclidean distance between two equally sized float vectors.
pub fn distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let a_chunks = a.chunks_exact(4);
    let b_chunks = b.chunks_exact(4);
    let tail: f32 = a_chunks
        .remainder()
        .iter()
        .zip(b_chunks.remainder())
        .map(|(&a, &b)| (a - b) * (a - b))
        .sum();
    a_chunks
        .zip(b_chunks)
        .map(|(a, b)| {
            f32x4::new([a[0], a[1], a[2], a[3]]) - f32x4::new([b[0], b[1], b[2], b[3]])
        })
        .fold(f32x4::splat(0.), |acc, d| d.mul_add(d, acc))
        .reduce_add()
        + tail
}

/// Euclidean distance between two equally sized float vectors.
pub fn distance(a: &[f32], b: &[f32]) -> f32 {
    distance_squared(a, b).sqrt()
}

/// Euclidean distance between two quantized feature vectors.
pub fn quantized_distance(a: &[u8], b: &[u8]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let sum: u32 = a
        .iter()
        .zip(b)
        .map(|(&a, &b)| {
            let d = i32::from(a) - i32::from(b);
            (d * d) as u32
        })
        .sum();
    (sum as f32).sqrt()
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

pub fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

/// Scale `a` to unit length.
///
/// Returns `false` and leaves the input untouched if it has zero length.
pub fn normalize(a: &mut [f32]) -> bool {
    let length = norm(a);
    if length <= f32::EPSILON {
        return false;
    }
    let inverse = length.recip();
    a.iter_mut().for_each(|v| *v *= inverse);
    true
}

/// Clamp every component to at most `maximum`.
pub fn clip(a: &mut [f32], maximum: f32) {
    a.iter_mut().for_each(|v| *v = v.min(maximum));
}

/// Map unit-range components to bytes with `min(255, round(v * 512))`.
pub fn quantize(a: &[f32]) -> Vec<u8> {
    a.iter()
        .map(|&v| (v * 512.0).round().clamp(0.0, 255.0) as u8)
        .collect()
}

/// Arithmetic mean, zero for an empty slice.
pub fn mean(a: &[f32]) -> f32 {
    if a.is_empty() {
        0.0
    } else {
        a.iter().sum::<f32>() / a.len() as f32
    }
}

/// Means of consecutive, non-overlapping groups of `group` components.
pub fn group_means(a: &[f32], group: usize) -> Vec<f32> {
    assert!(group > 0, "group size must be positive");
    a.chunks(group).map(mean).collect()
}
