//! Feature standardization and imputation

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, SegmentationError};
use crate::features::{FeatureTable, FEATURE_NAMES, N_FEATURES};

/// Divisor used for columns whose spread is zero or undefined
pub const DEGENERATE_SCALE: f64 = 1.0;

/// Per-column mean and standard deviation fitted once over the full feature table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StandardScaler {
    pub mean: Array1<f64>,
    /// Sample standard deviation (ddof = 1), or [`DEGENERATE_SCALE`] for constant columns
    pub scale: Array1<f64>,
}

impl StandardScaler {
    /// Fit column statistics, ignoring non-finite entries.
    ///
    /// A column whose finite values are all equal (including a single finite
    /// value) gets its value as mean and a unit divisor, so it scales to zeros.
    pub fn fit(features: &Array2<f64>) -> Self {
        let mut mean = Array1::from_elem(features.ncols(), f64::NAN);
        let mut scale = Array1::from_elem(features.ncols(), DEGENERATE_SCALE);

        for (j, column) in features.axis_iter(Axis(1)).enumerate() {
            let Some(mu) = finite_mean(column) else {
                continue;
            };

            let (min, max) = column
                .iter()
                .filter(|v| v.is_finite())
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            if min == max {
                mean[j] = min;
                debug!(column = %column_name(j), "constant column, scaling by 1.0");
                continue;
            }
            mean[j] = mu;

            let (sum_sq, count) = column
                .iter()
                .filter(|v| v.is_finite())
                .fold((0.0, 0usize), |(acc, n), v| (acc + (v - mu).powi(2), n + 1));
            let sigma = (sum_sq / (count - 1) as f64).sqrt();
            if sigma > 0.0 && sigma.is_finite() {
                scale[j] = sigma;
            }
        }

        debug!(?mean, ?scale, "fitted standard scaler");
        Self { mean, scale }
    }

    /// Apply `(x - mean) / scale` column-wise; non-finite inputs stay non-finite
    pub fn transform(&self, features: &Array2<f64>) -> Array2<f64> {
        let mut scaled = features.to_owned();
        for mut row in scaled.outer_iter_mut() {
            for ((cell, mu), sigma) in row.iter_mut().zip(&self.mean).zip(&self.scale) {
                *cell = (*cell - mu) / sigma;
            }
        }
        scaled
    }

    /// Scale a single raw feature vector
    pub fn transform_one(&self, values: &[f64; N_FEATURES]) -> Array1<f64> {
        values
            .iter()
            .zip(&self.mean)
            .zip(&self.scale)
            .map(|((x, mu), sigma)| (x - mu) / sigma)
            .collect()
    }
}

/// Standardized, imputed feature matrix with the scaler that produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaledFeatures {
    /// (n_customers, 4), same row order as the feature table
    pub matrix: Array2<f64>,
    pub scaler: StandardScaler,
}

/// Fit a scaler over the feature table and standardize it
pub fn standardize(table: &FeatureTable) -> Result<(StandardScaler, Array2<f64>)> {
    if table.is_empty() {
        return Err(SegmentationError::invalid_parameter(
            "features",
            "cannot standardize an empty feature table",
        ));
    }

    let raw = table.to_matrix();
    let scaler = StandardScaler::fit(&raw);
    let scaled = scaler.transform(&raw);
    Ok((scaler, scaled))
}

/// Replace non-finite entries with the mean of their column's finite entries.
///
/// Fails when a column has no finite entry at all.
pub fn impute(mut matrix: Array2<f64>) -> Result<Array2<f64>> {
    for (j, mut column) in matrix.axis_iter_mut(Axis(1)).enumerate() {
        if column.iter().all(|v| v.is_finite()) {
            continue;
        }

        let fill = finite_mean(column.view()).ok_or_else(|| {
            SegmentationError::data_quality(
                column_name(j),
                "every value is missing or non-finite, nothing to impute from",
            )
        })?;

        let mut filled = 0usize;
        for cell in column.iter_mut().filter(|v| !v.is_finite()) {
            *cell = fill;
            filled += 1;
        }
        debug!(column = %column_name(j), filled, fill, "imputed missing values");
    }

    Ok(matrix)
}

/// Standardize then impute
pub fn preprocess(table: &FeatureTable) -> Result<ScaledFeatures> {
    let (scaler, scaled) = standardize(table)?;
    let matrix = impute(scaled)?;
    Ok(ScaledFeatures { matrix, scaler })
}

fn finite_mean(column: ArrayView1<f64>) -> Option<f64> {
    let (sum, count) = column
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(acc, n), v| (acc + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

fn column_name(j: usize) -> String {
    FEATURE_NAMES
        .get(j)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("column {j}"))
}
