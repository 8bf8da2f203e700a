//! Metric behaviour: raw comparison distances, reported distances, and
//! signed hyperplane margins.
//!
//! Raw distances are cheap monotone surrogates used for ordering (squared
//! L2, `2 - 2cos`, negated dot). [`Metric::normalized_distance`] maps a raw
//! value onto the scale reported to callers. All functions here are pure:
//! the same metric must reproduce identical decisions during build-time
//! partitioning and query-time pruning.

use std::fmt::{Display, Formatter};

use crate::math;
use crate::Metric;

impl Metric {
    /// Raw distance used for candidate ordering. Lower is always closer,
    /// including for dot product (negated internally).
    pub(crate) fn raw_distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Angular => math::angular_distance(a, b),
            Metric::Euclidean => math::l2_distance_sqr(a, b),
            Metric::Manhattan => math::manhattan_distance(a, b),
            Metric::Hamming => math::hamming_distance(a, b) as f32,
            Metric::Dot => -math::dot(a, b),
        }
    }

    /// Map a raw distance onto the scale reported to callers: the square
    /// root for Angular/Euclidean, the identity for Manhattan/Hamming, and
    /// the plain dot product for Dot (larger means more similar there).
    pub fn normalized_distance(self, raw: f32) -> f32 {
        match self {
            Metric::Angular | Metric::Euclidean => raw.max(0.0).sqrt(),
            Metric::Manhattan | Metric::Hamming => raw,
            Metric::Dot => -raw,
        }
    }

    /// Signed side of `point` relative to a split plane. Positive margins
    /// route to the right child. For Hamming the plane is a coordinate test:
    /// `normal[0]` holds the coordinate index.
    pub(crate) fn margin(self, normal: &[f32], bias: f32, point: &[f32]) -> f32 {
        match self {
            Metric::Hamming => {
                let coord = normal[0] as usize;
                if point[coord] > 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            _ => bias + math::dot(normal, point),
        }
    }

    /// Stable on-disk tag for this metric.
    pub(crate) fn to_tag(self) -> u32 {
        match self {
            Metric::Angular => 0,
            Metric::Euclidean => 1,
            Metric::Manhattan => 2,
            Metric::Hamming => 3,
            Metric::Dot => 4,
        }
    }

    pub(crate) fn from_tag(tag: u32) -> Option<Metric> {
        match tag {
            0 => Some(Metric::Angular),
            1 => Some(Metric::Euclidean),
            2 => Some(Metric::Manhattan),
            3 => Some(Metric::Hamming),
            4 => Some(Metric::Dot),
            _ => None,
        }
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Metric::Angular => "angular",
            Metric::Euclidean => "euclidean",
            Metric::Manhattan => "manhattan",
            Metric::Hamming => "hamming",
            Metric::Dot => "dot",
        };
        f.write_str(name)
    }
}
