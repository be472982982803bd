//! Connectivity summary distributions.
//!
//! "Connectivity" is the count, per program element, of how many manifests'
//! coverage includes it. [`Connectivity`] summarizes a sequence of such
//! counts; the raw sequence is not persisted.

use serde::{Deserialize, Serialize};

/// Summary statistics over a sequence of per-element protection counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connectivity {
    /// Number of samples the summary was computed over.
    pub count: usize,
    /// Smallest sample.
    pub minimum: usize,
    /// Largest sample.
    pub maximum: usize,
    /// Arithmetic mean.
    pub mean: f64,
    /// Population variance.
    pub variance: f64,
    /// Population standard deviation.
    pub std_dev: f64,
}

impl Connectivity {
    /// Builds the summary for a sequence of counts. An empty sequence
    /// yields the zero summary.
    pub fn new(counts: &[usize]) -> Self {
        if counts.is_empty() {
            return Self::default();
        }
        let count = counts.len();
        let minimum = counts.iter().copied().min().unwrap_or(0);
        let maximum = counts.iter().copied().max().unwrap_or(0);
        let mean = counts.iter().sum::<usize>() as f64 / count as f64;
        let variance = counts
            .iter()
            .map(|&c| {
                let d = c as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / count as f64;
        Connectivity {
            count,
            minimum,
            maximum,
            mean,
            variance,
            std_dev: variance.sqrt(),
        }
    }
}
