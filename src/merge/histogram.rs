use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when two histograms cannot be summed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    #[error("{name}: bin count mismatch (have {expected}, got {found})")]
    BinCount {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("{name}: axis mismatch (have {expected:?}, got {found:?})")]
    Axis {
        name: String,
        expected: Axis,
        found: Axis,
    },
}

/// Fixed-width x axis range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub min: f64,
    pub max: f64,
}

/// One-dimensional binned histogram used as the merge accumulator.
///
/// Bin contents are kept as `f64` so weighted fills survive the merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<Axis>,
    pub bins: Vec<f64>,
    #[serde(default)]
    pub entries: f64,
}

impl Histogram {
    /// Creates a histogram without axis information. Entries are the bin sum.
    pub fn new(name: impl Into<String>, bins: Vec<f64>) -> Self {
        let entries = bins.iter().sum();
        Self {
            name: name.into(),
            title: String::new(),
            axis: None,
            bins,
            entries,
        }
    }

    /// Attaches an axis range.
    pub fn with_axis(mut self, min: f64, max: f64) -> Self {
        self.axis = Some(Axis { min, max });
        self
    }

    /// Checks that `other` has the same binning as `self`.
    ///
    /// Axes are only compared when both sides carry one; a v1 payload
    /// without axis information merges with anything of equal bin count.
    pub fn check_shape(&self, other: &Histogram) -> Result<(), MergeError> {
        if self.bins.len() != other.bins.len() {
            return Err(MergeError::BinCount {
                name: self.name.clone(),
                expected: self.bins.len(),
                found: other.bins.len(),
            });
        }

        if let (Some(mine), Some(theirs)) = (self.axis, other.axis) {
            if mine != theirs {
                return Err(MergeError::Axis {
                    name: self.name.clone(),
                    expected: mine,
                    found: theirs,
                });
            }
        }

        Ok(())
    }

    /// Adds `other` into `self` bin for bin.
    ///
    /// On error `self` is left untouched.
    pub fn merge(&mut self, other: &Histogram) -> Result<(), MergeError> {
        self.check_shape(other)?;

        for (slot, value) in self.bins.iter_mut().zip(other.bins.iter()) {
            *slot += *value;
        }
        self.entries += other.entries;
        if self.axis.is_none() {
            self.axis = other.axis;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sums_bins() {
        let mut a = Histogram::new("h", vec![1.0, 2.0, 3.0]);
        let b = Histogram::new("h", vec![4.0, 5.0, 6.0]);

        a.merge(&b).expect("same shape should merge");

        assert_eq!(a.bins, vec![5.0, 7.0, 9.0]);
        assert_eq!(a.entries, 21.0);
    }

    #[test]
    fn test_merge_bin_count_mismatch_leaves_primary_untouched() {
        let mut a = Histogram::new("h", vec![1.0, 2.0, 3.0]);
        let b = Histogram::new("h", vec![4.0, 5.0]);

        let err = a.merge(&b).unwrap_err();

        assert!(matches!(
            err,
            MergeError::BinCount {
                expected: 3,
                found: 2,
                ..
            }
        ));
        assert_eq!(a.bins, vec![1.0, 2.0, 3.0]);
        assert_eq!(a.entries, 6.0);
    }

    #[test]
    fn test_merge_axis_mismatch() {
        let mut a = Histogram::new("h", vec![1.0, 1.0]).with_axis(0.0, 10.0);
        let b = Histogram::new("h", vec![1.0, 1.0]).with_axis(0.0, 20.0);

        let err = a.merge(&b).unwrap_err();
        assert!(err.to_string().contains("axis mismatch"));
        assert_eq!(a.bins, vec![1.0, 1.0]);
    }

    #[test]
    fn test_merge_adopts_axis_from_other() {
        let mut a = Histogram::new("h", vec![1.0, 1.0]);
        let b = Histogram::new("h", vec![2.0, 2.0]).with_axis(-1.0, 1.0);

        a.merge(&b).expect("axis-less primary should accept");
        assert_eq!(a.axis, Some(Axis { min: -1.0, max: 1.0 }));
    }
}
