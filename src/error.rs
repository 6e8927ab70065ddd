//! Error taxonomy for the segmentation pipeline

use serde::Serialize;
use thiserror::Error;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, SegmentationError>;

/// Errors raised while loading, aggregating, scaling or clustering customer data
#[derive(Debug, Error)]
pub enum SegmentationError {
    /// Input that cannot be safely defaulted: a missing column, nothing finite
    /// to impute from, or NaN fed to clustering
    #[error("data quality error in column '{column}': {reason}")]
    DataQuality { column: String, reason: String },

    /// Caller-supplied parameter violates a precondition
    #[error("invalid parameter '{parameter}': {reason}")]
    InvalidParameter { parameter: String, reason: String },

    /// linfa rejected the k-means fit
    #[error("clustering failed: {0}")]
    Clustering(#[from] linfa_clustering::KMeansError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dataframe error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rendering the projection failed
    #[error("plot error: {0}")]
    Plot(String),
}

impl SegmentationError {
    pub fn data_quality(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataQuality {
            column: column.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }
}

/// Non-fatal notice that k-means stopped at its iteration cap before the centroids settled.
///
/// The partition it accompanies is still the best one found and is safe to use.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceWarning {
    /// Iteration cap that was in force
    pub max_iterations: u64,
    /// Largest distance a centroid would still move in one more Lloyd step
    pub centroid_shift: f64,
    /// Tolerance the shift was compared against
    pub tolerance: f64,
}

impl std::fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "k-means did not converge within {} iterations \
             (centroid shift {:.3e} > tolerance {:.1e})",
            self.max_iterations, self.centroid_shift, self.tolerance
        )
    }
}
