use crate::trie::{Distance, Trie, TrieBuilder};
use crate::Descriptor;
use cv_core::nalgebra::Vector2;
use cv_core::{FeatureMatch, ImagePoint};
use float_ord::FloatOrd;
use log::*;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An accepted match between a source and a target descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence<'a> {
    pub source: &'a Descriptor,
    pub target: &'a Descriptor,
    /// Euclidean distance between the quantized features.
    pub distance: f32,
}

impl Correspondence<'_> {
    /// The matched keypoint positions, in input image pixels.
    pub fn feature_match(&self) -> FeatureMatch<cv_core::KeyPoint> {
        FeatureMatch(
            cv_core::KeyPoint(self.source.keypoint.image_point()),
            cv_core::KeyPoint(self.target.keypoint.image_point()),
        )
    }

    fn source_position(&self) -> Vector2<f32> {
        let (x, y) = self.source.keypoint.point;
        Vector2::new(x, y)
    }

    fn target_position(&self) -> Vector2<f32> {
        let (x, y) = self.target.keypoint.point;
        Vector2::new(x, y)
    }
}

/// Contains the configuration parameters of descriptor matching.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Matcher {
    /// Best neighbors at or beyond this distance are rejected.
    pub absolute_threshold: f32,
    /// Lowe's ratio: the best neighbor must be closer than this fraction of
    /// the second best.
    pub relative_threshold: f32,
    pub trie_branching_factor: usize,
    /// Leaves scanned on each side of the start leaf of a trie query.
    pub search_radius: usize,
    /// Neighbors retrieved per query.
    pub k: usize,
    pub minimum_sample_size: usize,
    pub maximum_sample_size: usize,
    /// Displacements shorter than this, in pixels, make a window unscorable.
    pub minimum_length: f32,
}

impl Default for Matcher {
    fn default() -> Self {
        Self {
            absolute_threshold: 300.0,
            relative_threshold: 0.6,
            trie_branching_factor: 8,
            search_radius: 10,
            k: 2,
            minimum_sample_size: 5,
            maximum_sample_size: 20,
            minimum_length: 2.0,
        }
    }
}

impl Matcher {
    /// Build the approximate index used to query `descriptors`.
    pub fn index<'a>(&self, descriptors: &'a [Descriptor]) -> Trie<&'a Descriptor> {
        let key_length = descriptors.first().map_or(1, |d| d.key.len());
        let mut builder = TrieBuilder::new(self.trie_branching_factor, key_length);
        for descriptor in descriptors {
            builder.insert(&descriptor.key, descriptor);
        }
        builder.link()
    }

    /// Lowe's ratio test over the two closest neighbor distances.
    fn accept(&self, best: f32, second: f32) -> bool {
        best < self.absolute_threshold && best < second * self.relative_threshold
    }

    /// Match every source descriptor to its approximate nearest target.
    ///
    /// A source descriptor with fewer than two neighbors in reach has nothing
    /// to compare against and is not matched. Correspondences are returned in
    /// source order.
    pub fn match_descriptors<'a>(
        &self,
        source: &'a [Descriptor],
        target: &'a [Descriptor],
    ) -> Vec<Correspondence<'a>> {
        if source.is_empty() || target.is_empty() {
            return vec![];
        }
        let trie = self.index(target);
        let best_match = |descriptor: &'a Descriptor| {
            let neighbors =
                trie.nearest(&descriptor.key, &descriptor, self.search_radius, self.k.max(2));
            let (best, second) = match neighbors.as_slice() {
                [best, second, ..] => (best, second),
                _ => return None,
            };
            self.accept(best.distance, second.distance)
                .then(|| Correspondence {
                    source: descriptor,
                    target: *best.value,
                    distance: best.distance,
                })
        };
        #[cfg(not(feature = "rayon"))]
        let correspondences: Vec<Correspondence<'a>> =
            source.iter().filter_map(best_match).collect();
        #[cfg(feature = "rayon")]
        let correspondences: Vec<Correspondence<'a>> =
            source.par_iter().filter_map(best_match).collect();
        info!(
            "Matched {} of {} descriptors",
            correspondences.len(),
            source.len()
        );
        correspondences
    }

    /// Same as [`Matcher::match_descriptors`] with a linear scan of `target`.
    pub fn match_exact<'a>(
        &self,
        source: &'a [Descriptor],
        target: &'a [Descriptor],
    ) -> Vec<Correspondence<'a>> {
        source
            .iter()
            .filter_map(|descriptor| {
                let mut best: Option<(&'a Descriptor, f32)> = None;
                let mut second = None;
                for candidate in target {
                    let distance = descriptor.distance(candidate);
                    match best {
                        Some((_, best_distance)) if distance >= best_distance => {
                            if second.map_or(true, |second| distance < second) {
                                second = Some(distance);
                            }
                        }
                        _ => {
                            second = best.map(|(_, best_distance)| best_distance);
                            best = Some((candidate, distance));
                        }
                    }
                }
                let (target, distance) = best?;
                self.accept(distance, second?).then_some(Correspondence {
                    source: descriptor,
                    target,
                    distance,
                })
            })
            .collect()
    }

    /// Confidence in `[0, 1]` that the matches between two descriptor sets
    /// are related by a similarity transform.
    ///
    /// Returns `0.0` if either set or the matches between them are smaller
    /// than `minimum_sample_size`.
    pub fn match_geometry(&self, source: &[Descriptor], target: &[Descriptor]) -> f32 {
        if source.len() < self.minimum_sample_size || target.len() < self.minimum_sample_size {
            return 0.0;
        }
        let mut correspondences = self.match_descriptors(source, target);
        if correspondences.len() < self.minimum_sample_size {
            debug!(
                "Only {} correspondences, not scoring geometry.",
                correspondences.len()
            );
            return 0.0;
        }
        correspondences.sort_by_key(|c| FloatOrd(c.distance));
        correspondences.truncate(self.maximum_sample_size);
        self.geometric_confidence(&correspondences)
    }

    /// Score every window of four consecutive correspondences and return the
    /// mean score with outliers (z-score above 2) removed.
    pub fn geometric_confidence(&self, correspondences: &[Correspondence<'_>]) -> f32 {
        let scores: Vec<f32> = correspondences
            .windows(4)
            .filter_map(|window| self.window_score(window))
            .collect();
        debug!(
            "Scored {} of {} geometry windows.",
            scores.len(),
            correspondences.len().saturating_sub(3)
        );
        fair_mean(&scores)
    }

    fn window_score(&self, window: &[Correspondence<'_>]) -> Option<f32> {
        let source: Vec<Vector2<f32>> = window.iter().map(|c| c.source_position()).collect();
        let target: Vec<Vector2<f32>> = window.iter().map(|c| c.target_position()).collect();
        let (u1, u2) = (source[1] - source[0], source[3] - source[2]);
        let (v1, v2) = (target[1] - target[0], target[3] - target[2]);
        if [u1, u2, v1, v2]
            .iter()
            .any(|v| v.norm() < self.minimum_length)
        {
            return None;
        }
        let cos_source = u1.normalize().dot(&u2.normalize());
        let cos_target = v1.normalize().dot(&v2.normalize());
        let orientation = (1.0 - ((cos_source - cos_target) / 2.0).abs()).clamp(0.0, 1.0);
        let ratio_source = u1.norm() / u2.norm();
        let ratio_target = v1.norm() / v2.norm();
        let scale =
            (ratio_source.min(ratio_target) / ratio_source.max(ratio_target)).clamp(0.0, 1.0);
        Some((orientation * scale).powi(2))
    }
}

/// Mean of the values within two sample standard deviations of the mean.
fn fair_mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    if values.len() < 2 {
        return mean;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / (n - 1.0);
    let std = variance.sqrt();
    if std <= f32::EPSILON {
        return mean;
    }
    let kept: Vec<f32> = values
        .iter()
        .copied()
        .filter(|v| (v - mean).abs() / std <= 2.0)
        .collect();
    if kept.is_empty() {
        mean
    } else {
        kept.iter().sum::<f32>() / kept.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::index_key;
    use crate::KeyPoint;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn descriptor(features: Vec<u8>, point: (f32, f32)) -> Descriptor {
        let key = index_key(&features, 4, 8);
        Descriptor {
            keypoint: KeyPoint {
                octave: 0,
                scale: 1,
                sub_scale: 0.0,
                scaled_point: (point.0 as usize * 2, point.1 as usize * 2),
                point,
                normalized_point: (point.0 / 256.0, point.1 / 256.0),
                sigma: 1.6,
                response: 0.05,
            },
            theta: 0.0,
            raw_features: features.iter().map(|&f| f32::from(f) / 512.0).collect(),
            features,
            key,
        }
    }

    fn flat(value: u8) -> Descriptor {
        descriptor(vec![value; 128], (10.0, 10.0))
    }

    /// Descriptors with random features at random positions.
    fn random_set(rng: &mut Pcg64, count: usize) -> Vec<Descriptor> {
        (0..count)
            .map(|_| {
                let features = (0..128).map(|_| rng.gen_range(0..=120)).collect();
                let point = (rng.gen_range(10.0..240.0), rng.gen_range(10.0..240.0));
                descriptor(features, point)
            })
            .collect()
    }

    fn moved(descriptors: &[Descriptor], f: impl Fn((f32, f32)) -> (f32, f32)) -> Vec<Descriptor> {
        descriptors
            .iter()
            .map(|d| descriptor(d.features.clone(), f(d.keypoint.point)))
            .collect()
    }

    #[test]
    fn ratio_test_accepts_distinctive_matches() {
        let matcher = Matcher::default();
        let source = vec![flat(50)];
        let target = vec![flat(60), flat(51)];
        let matches = matcher.match_descriptors(&source, &target);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].target, &target[1]);
        assert_relative_eq!(matches[0].distance, 128f32.sqrt(), epsilon = 1e-4);
    }

    #[test]
    fn ratio_test_rejects_ambiguous_matches() {
        let matcher = Matcher::default();
        let source = vec![flat(50)];
        let target = vec![flat(49), flat(51)];
        assert!(matcher.match_descriptors(&source, &target).is_empty());
        assert!(matcher.match_exact(&source, &target).is_empty());
    }

    #[test]
    fn absolute_threshold_and_single_neighbor() {
        let matcher = Matcher::default();
        let source = vec![flat(50)];
        // Without a second neighbor there is no ratio to test.
        assert!(matcher.match_descriptors(&source, &[flat(52)]).is_empty());
        assert!(matcher.match_descriptors(&source, &[flat(70)]).is_empty());
        assert!(matcher.match_exact(&source, &[flat(52)]).is_empty());
        // 40 * sqrt(128) is above the absolute threshold.
        assert!(matcher
            .match_descriptors(&source, &[flat(90), flat(200)])
            .is_empty());
        assert!(matcher.match_exact(&source, &[flat(90), flat(200)]).is_empty());
        assert!(matcher.match_descriptors(&source, &[]).is_empty());
        assert!(matcher.match_descriptors(&[], &source).is_empty());
    }

    #[test]
    fn exact_and_approximate_agree_on_separated_data() {
        let mut rng = Pcg64::from_seed([3; 32]);
        let target = random_set(&mut rng, 100);
        let source: Vec<Descriptor> = target
            .iter()
            .map(|d| {
                // Swapping within a cell keeps the index key unchanged.
                let mut features = d.features.clone();
                features.swap(0, 1);
                descriptor(features, d.keypoint.point)
            })
            .collect();
        let matcher = Matcher::default();
        let approximate = matcher.match_descriptors(&source, &target);
        let exact = matcher.match_exact(&source, &target);
        assert_eq!(exact.len(), 100);
        assert_eq!(approximate, exact);
    }

    #[test]
    fn correspondence_converts_to_feature_match() {
        let source = descriptor(vec![1; 128], (3.5, 4.0));
        let target = descriptor(vec![1; 128], (7.0, 8.25));
        let correspondence = Correspondence {
            source: &source,
            target: &target,
            distance: 0.0,
        };
        let FeatureMatch(a, b) = correspondence.feature_match();
        assert_eq!((a.0.x, a.0.y), (3.5, 4.0));
        assert_eq!((b.0.x, b.0.y), (7.0, 8.25));
    }

    #[test]
    fn translation_is_geometrically_consistent() {
        let mut rng = Pcg64::from_seed([4; 32]);
        let source = random_set(&mut rng, 30);
        let target = moved(&source, |(x, y)| (x + 17.0, y - 6.5));
        let confidence = Matcher::default().match_geometry(&source, &target);
        assert_relative_eq!(confidence, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn similarity_transform_is_geometrically_consistent() {
        let mut rng = Pcg64::from_seed([5; 32]);
        let source = random_set(&mut rng, 30);
        let (sin, cos) = 0.7f32.sin_cos();
        let target = moved(&source, |(x, y)| {
            (2.0 * (cos * x - sin * y) + 5.0, 2.0 * (sin * x + cos * y) - 3.0)
        });
        let confidence = Matcher::default().match_geometry(&source, &target);
        assert!(confidence > 0.99, "confidence {}", confidence);
    }

    #[test]
    fn scrambled_positions_score_low() {
        let mut rng = Pcg64::from_seed([6; 32]);
        let source = random_set(&mut rng, 30);
        let mut positions = Pcg64::from_seed([7; 32]);
        let target: Vec<Descriptor> = source
            .iter()
            .map(|d| {
                let point = (positions.gen_range(0.0..250.0), positions.gen_range(0.0..250.0));
                descriptor(d.features.clone(), point)
            })
            .collect();
        let confidence = Matcher::default().match_geometry(&source, &target);
        assert!(confidence < 0.8, "confidence {}", confidence);
    }

    #[test]
    fn unrelated_sets_have_no_confidence() {
        let mut rng = Pcg64::from_seed([8; 32]);
        let source = random_set(&mut rng, 30);
        let target = random_set(&mut rng, 30);
        assert!(Matcher::default().match_geometry(&source, &target) < 0.2);
    }

    #[test]
    fn small_samples_have_no_confidence() {
        let mut rng = Pcg64::from_seed([9; 32]);
        let source = random_set(&mut rng, 4);
        let target = moved(&source, |(x, y)| (x + 1.0, y));
        assert_eq!(Matcher::default().match_geometry(&source, &target), 0.0);
    }

    #[test]
    fn fair_mean_drops_outliers() {
        assert_eq!(fair_mean(&[]), 0.0);
        assert_eq!(fair_mean(&[0.25]), 0.25);
        assert_relative_eq!(fair_mean(&[0.5; 6]), 0.5);
        let mut scores = vec![1.0; 10];
        scores.push(0.0);
        assert_relative_eq!(fair_mean(&scores), 1.0);
    }
}
