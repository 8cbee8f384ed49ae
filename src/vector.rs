use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Distance metric of a deployment. Pinned in the manifest at first open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Euclidean,
    #[default]
    Cosine,
}

impl Metric {
    /// Calculate distance. LOWER is ALWAYS closer/better.
    ///
    /// Cosine returns `1 - cos(a, b)` in `[0, 2]`; a zero vector is treated as
    /// orthogonal to everything. Euclidean returns the true L2 distance.
    ///
    /// Unrolling 8 lanes lets LLVM keep the accumulators in vector registers.
    #[inline(always)]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Euclidean => {
                let mut sum = 0.0;
                let remainder_start = a.len() - a.len() % 8;

                for (ac, bc) in a.chunks_exact(8).zip(b.chunks_exact(8)) {
                    let mut lane = 0.0;
                    for i in 0..8 {
                        let d = ac[i] - bc[i];
                        lane += d * d;
                    }
                    sum += lane;
                }

                for i in remainder_start..a.len() {
                    let diff = a[i] - b[i];
                    sum += diff * diff;
                }

                f32::sqrt(sum)
            }
            Metric::Cosine => {
                let mut dot = 0.0;
                let mut norm_a = 0.0;
                let mut norm_b = 0.0;
                let remainder_start = a.len() - a.len() % 8;

                for (ac, bc) in a.chunks_exact(8).zip(b.chunks_exact(8)) {
                    for i in 0..8 {
                        dot += ac[i] * bc[i];
                        norm_a += ac[i] * ac[i];
                        norm_b += bc[i] * bc[i];
                    }
                }

                for i in remainder_start..a.len() {
                    dot += a[i] * b[i];
                    norm_a += a[i] * a[i];
                    norm_b += b[i] * b[i];
                }

                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                let cos = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
                1.0 - cos
            }
        }
    }

    /// Maps a distance onto `[0, 1]`, 1 meaning identical.
    ///
    /// Cosine clamps `1 - d` so anti-correlated vectors bottom out at 0
    /// instead of going negative. Euclidean is unbounded, so it uses
    /// `1 / (1 + d)`.
    pub fn similarity(&self, distance: f32) -> f32 {
        match self {
            Metric::Cosine => (1.0 - distance).clamp(0.0, 1.0),
            Metric::Euclidean => 1.0 / (1.0 + distance.max(0.0)),
        }
    }

    pub fn similarity_percent(&self, distance: f32) -> f32 {
        self.similarity(distance) * 100.0
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Euclidean => f.write_str("euclidean"),
            Metric::Cosine => f.write_str("cosine"),
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            other => Err(format!("unknown metric '{other}', expected cosine or euclidean")),
        }
    }
}
