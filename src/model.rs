//! K-Means partitioning of scaled customer features and per-cluster summaries

use linfa::prelude::*;
use linfa_clustering::KMeans;
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConvergenceWarning, Result, SegmentationError};
use crate::features::{FeatureTable, FEATURE_NAMES, N_FEATURES};
use crate::preprocess::ScaledFeatures;

/// Seed used unless the caller picks another, so re-selecting a K reproduces the same plot
pub const DEFAULT_SEED: u64 = 42;

/// K-Means hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansConfig {
    /// Update steps allowed per run
    pub max_iterations: u64,
    /// A run stops once its centroids move less than this in one step
    pub tolerance: f64,
    /// Independent k-means++ restarts; the lowest-inertia run wins
    pub n_runs: usize,
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            tolerance: 1e-4,
            n_runs: 10,
            seed: DEFAULT_SEED,
        }
    }
}

impl KMeansConfig {
    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_runs(mut self, n_runs: usize) -> Self {
        self.n_runs = n_runs;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(SegmentationError::invalid_parameter(
                "max_iterations",
                "must be at least 1",
            ));
        }
        if self.n_runs == 0 {
            return Err(SegmentationError::invalid_parameter(
                "n_runs",
                "must be at least 1",
            ));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(SegmentationError::invalid_parameter(
                "tolerance",
                format!("must be a finite positive number, got {}", self.tolerance),
            ));
        }
        Ok(())
    }
}

/// Mean raw features of the customers carrying one cluster label
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub cluster: usize,
    pub size: usize,
    pub total_purchases: f64,
    pub average_purchase_amount: f64,
    pub total_returns: f64,
    pub churn_status: f64,
}

impl ClusterSummary {
    pub fn means(&self) -> [f64; N_FEATURES] {
        [
            self.total_purchases,
            self.average_purchase_amount,
            self.total_returns,
            self.churn_status,
        ]
    }
}

/// Fitted partition of the customers into `k` groups
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Partition {
    pub k: usize,
    /// Cluster label per customer row, aligned with the feature table
    pub assignment: Vec<usize>,
    /// Cluster centers in scaled space, one row per label
    pub centroids: Array2<f64>,
    /// Within-cluster sum of squares
    pub inertia: f64,
    /// One row per label present in `assignment`, ordered by label
    pub summary: Vec<ClusterSummary>,
    pub warning: Option<ConvergenceWarning>,
}

impl Partition {
    /// Number of customers per label, including labels nobody was assigned to
    pub fn cluster_sizes(&self) -> Vec<usize> {
        label_counts(&self.assignment, self.k)
    }

    /// Label of the nearest centroid for an already-scaled point
    pub fn predict(&self, point: ArrayView1<f64>) -> Result<usize> {
        if point.len() != self.centroids.ncols() {
            return Err(SegmentationError::invalid_parameter(
                "point",
                format!(
                    "expected {} features, got {}",
                    self.centroids.ncols(),
                    point.len()
                ),
            ));
        }
        if let Some(j) = point.iter().position(|v| !v.is_finite()) {
            return Err(SegmentationError::data_quality(
                column_name(j),
                "cannot assign a point with a non-finite value",
            ));
        }
        Ok(nearest_centroid(point, self.centroids.view()).0)
    }

    /// Mean silhouette coefficient over the first `sample_size` customers
    pub fn silhouette_sample(&self, features: &Array2<f64>, sample_size: usize) -> f64 {
        let n_samples = features.nrows().min(sample_size);
        if n_samples < 2 {
            return 0.0;
        }

        let mut silhouette_sum = 0.0;

        for i in 0..n_samples {
            let point = features.row(i);
            let cluster_label = self.assignment[i];

            let mut same_cluster = (0.0, 0usize);
            let mut other_clusters = vec![(0.0, 0usize); self.k];

            for j in 0..n_samples {
                if i == j {
                    continue;
                }

                let distance = squared_distance(point, features.row(j)).sqrt();
                let other_label = self.assignment[j];

                if other_label == cluster_label {
                    same_cluster.0 += distance;
                    same_cluster.1 += 1;
                } else if other_label < self.k {
                    other_clusters[other_label].0 += distance;
                    other_clusters[other_label].1 += 1;
                }
            }

            let a_i = if same_cluster.1 == 0 {
                0.0
            } else {
                same_cluster.0 / same_cluster.1 as f64
            };

            let b_i = other_clusters
                .iter()
                .filter(|(_, count)| *count > 0)
                .map(|(sum, count)| sum / *count as f64)
                .fold(f64::INFINITY, f64::min);

            let silhouette_i = if b_i.is_infinite() || (a_i == 0.0 && b_i == 0.0) {
                0.0
            } else {
                (b_i - a_i) / a_i.max(b_i)
            };

            silhouette_sum += silhouette_i;
        }

        silhouette_sum / n_samples as f64
    }
}

/// Partition customers into `k` clusters.
///
/// Fitting is done by linfa's k-means with k-means++ seeding. The fit is
/// seeded from `config.seed`, so identical inputs always produce the
/// same assignment. A run that hits the iteration cap is still returned, with a
/// [`ConvergenceWarning`] attached.
///
/// # Arguments
/// * `features` - Raw per-customer features, used for the summary means
/// * `scaled` - Standardized and imputed features, used for the fit
/// * `k` - Number of clusters, in `[2, n_customers]`
/// * `config` - Iteration cap, tolerance, restarts and seed
pub fn partition(
    features: &FeatureTable,
    scaled: &ScaledFeatures,
    k: usize,
    config: &KMeansConfig,
) -> Result<Partition> {
    let matrix = &scaled.matrix;
    let n_samples = matrix.nrows();

    if k < 2 {
        return Err(SegmentationError::invalid_parameter(
            "k",
            format!("at least 2 clusters are required, got {k}"),
        ));
    }
    if k > n_samples {
        return Err(SegmentationError::invalid_parameter(
            "k",
            format!("{k} clusters requested but there are only {n_samples} distinct customers"),
        ));
    }
    if features.len() != n_samples {
        return Err(SegmentationError::invalid_parameter(
            "features",
            format!(
                "feature table has {} rows but the scaled matrix has {n_samples}",
                features.len()
            ),
        ));
    }
    config.validate()?;
    ensure_finite(matrix)?;

    let model = KMeans::params_with(k, StdRng::seed_from_u64(config.seed), L2Dist)
        .n_runs(config.n_runs)
        .max_n_iterations(config.max_iterations)
        .tolerance(config.tolerance)
        .fit(&DatasetBase::from(matrix.view()))?;

    let centroids = model.centroids().clone();
    let labels: Array1<usize> = model.predict(matrix);
    let assignment = labels.to_vec();
    let inertia = within_cluster_sum_of_squares(matrix, &assignment, &centroids);
    debug!(k, inertia, n_runs = config.n_runs, "k-means fit finished");

    let shift = max_shift(&next_centroids(matrix, &assignment, &centroids), &centroids);
    let warning = (shift > config.tolerance).then(|| ConvergenceWarning {
        max_iterations: config.max_iterations,
        centroid_shift: shift,
        tolerance: config.tolerance,
    });
    if let Some(w) = &warning {
        warn!(%w, "returning best partition found");
    }

    let summary = summarize(&features.to_matrix(), &assignment, k);
    info!(
        k,
        customers = n_samples,
        clusters_present = summary.len(),
        inertia,
        "partitioned customers"
    );

    Ok(Partition {
        k,
        assignment,
        centroids,
        inertia,
        summary,
        warning,
    })
}

/// Nearest centroid and its squared distance; ties go to the lower index
fn nearest_centroid(point: ArrayView1<f64>, centroids: ArrayView2<f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (idx, centroid) in centroids.outer_iter().enumerate() {
        let distance = squared_distance(point, centroid);
        if distance < best.1 {
            best = (idx, distance);
        }
    }
    best
}

fn within_cluster_sum_of_squares(
    matrix: &Array2<f64>,
    assignment: &[usize],
    centroids: &Array2<f64>,
) -> f64 {
    matrix
        .outer_iter()
        .zip(assignment)
        .map(|(row, &label)| squared_distance(row, centroids.row(label)))
        .sum()
}

/// Centroids after one more update step of the fit.
///
/// Each old centroid counts as one extra member of its own cluster, so an
/// empty cluster stays where it is.
fn next_centroids(
    matrix: &Array2<f64>,
    assignment: &[usize],
    centroids: &Array2<f64>,
) -> Array2<f64> {
    let mut sums = centroids.clone();
    let mut counts = vec![1usize; centroids.nrows()];

    for (&label, row) in assignment.iter().zip(matrix.outer_iter()) {
        let mut sum = sums.row_mut(label);
        sum += &row;
        counts[label] += 1;
    }
    for (mut sum, &count) in sums.outer_iter_mut().zip(&counts) {
        sum /= count as f64;
    }

    sums
}

/// Largest Euclidean distance between matching centroid rows
fn max_shift(updated: &Array2<f64>, centroids: &Array2<f64>) -> f64 {
    updated
        .outer_iter()
        .zip(centroids.outer_iter())
        .map(|(new, old)| squared_distance(new, old).sqrt())
        .fold(0.0, f64::max)
}

/// Number of customers carrying each label in `0..k`
fn label_counts(assignment: &[usize], k: usize) -> Vec<usize> {
    assignment.iter().fold(vec![0; k], |mut counts, &label| {
        if let Some(count) = counts.get_mut(label) {
            *count += 1;
        }
        counts
    })
}

/// Per-label means over the raw features, only for labels that occur
fn summarize(raw: &Array2<f64>, labels: &[usize], k: usize) -> Vec<ClusterSummary> {
    label_counts(labels, k)
        .into_iter()
        .enumerate()
        .filter(|&(_, size)| size > 0)
        .map(|(cluster, size)| {
            let members: Vec<usize> = labels
                .iter()
                .enumerate()
                .filter(|(_, &label)| label == cluster)
                .map(|(row, _)| row)
                .collect();

            let rows = raw.select(Axis(0), &members);
            let means: Vec<f64> = rows
                .axis_iter(Axis(1))
                .map(|column| {
                    let (sum, count) = column
                        .iter()
                        .filter(|v| v.is_finite())
                        .fold((0.0, 0usize), |(acc, n), v| (acc + v, n + 1));
                    if count == 0 {
                        f64::NAN
                    } else {
                        sum / count as f64
                    }
                })
                .collect();

            ClusterSummary {
                cluster,
                size,
                total_purchases: means[0],
                average_purchase_amount: means[1],
                total_returns: means[2],
                churn_status: means[3],
            }
        })
        .collect()
}

fn ensure_finite(matrix: &Array2<f64>) -> Result<()> {
    for ((row, j), value) in matrix.indexed_iter() {
        if !value.is_finite() {
            return Err(SegmentationError::data_quality(
                column_name(j),
                format!("non-finite value {value} at customer row {row} reached clustering"),
            ));
        }
    }
    Ok(())
}

fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

fn column_name(j: usize) -> String {
    FEATURE_NAMES
        .get(j)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("column {j}"))
}

/// Centroid coordinates mapped back to raw feature units
pub fn unscale_centroids(partition: &Partition, scaled: &ScaledFeatures) -> Array2<f64> {
    &partition.centroids * &scaled.scaler.scale + &scaled.scaler.mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::preprocess;
    use proptest::prelude::*;

    fn prepared(rows: &[[f64; N_FEATURES]]) -> (FeatureTable, ScaledFeatures) {
        let table = FeatureTable::from_rows(rows);
        let scaled = preprocess(&table).unwrap();
        (table, scaled)
    }

    fn blobs() -> Vec<[f64; N_FEATURES]> {
        vec![
            [100.0, 50.0, 0.0, 0.0],
            [120.0, 60.0, 1.0, 0.0],
            [110.0, 55.0, 0.0, 0.0],
            [5000.0, 2500.0, 4.0, 1.0],
            [5200.0, 2600.0, 5.0, 1.0],
            [2500.0, 900.0, 2.0, 0.0],
            [2600.0, 950.0, 2.0, 1.0],
        ]
    }

    #[test]
    fn test_outlier_gets_its_own_cluster() {
        let (table, scaled) = prepared(&[
            [100.0, 100.0, 0.0, 0.0],
            [100.0, 100.0, 0.0, 0.0],
            [5000.0, 2500.0, 1.0, 1.0],
        ]);
        let partition = partition(&table, &scaled, 2, &KMeansConfig::default()).unwrap();

        let labels = &partition.assignment;
        assert_eq!(labels[0], labels[1]);
        assert_ne!(labels[0], labels[2]);

        let outlier = partition
            .summary
            .iter()
            .find(|s| s.cluster == labels[2])
            .unwrap();
        assert_eq!(outlier.size, 1);
        assert_eq!(outlier.means(), [5000.0, 2500.0, 1.0, 1.0]);

        let pair = partition
            .summary
            .iter()
            .find(|s| s.cluster == labels[0])
            .unwrap();
        assert_eq!(pair.means(), [100.0, 100.0, 0.0, 0.0]);
    }

    #[test]
    fn test_partition_is_deterministic() {
        let (table, scaled) = prepared(&blobs());
        let config = KMeansConfig::default();

        let first = partition(&table, &scaled, 3, &config).unwrap();
        let second = partition(&table, &scaled, 3, &config).unwrap();
        assert_eq!(first.assignment, second.assignment);
        assert_eq!(first.summary, second.summary);
    }

    #[test]
    fn test_k_equal_to_rows_gives_distinct_labels() {
        let rows = blobs();
        let (table, scaled) = prepared(&rows);
        let partition = partition(&table, &scaled, rows.len(), &KMeansConfig::default()).unwrap();

        let mut labels = partition.assignment.clone();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), rows.len());
        assert!(partition.inertia.abs() < 1e-12);
    }

    #[test]
    fn test_invalid_cluster_count() {
        let rows = blobs();
        let (table, scaled) = prepared(&rows);
        let config = KMeansConfig::default();

        for k in [0, 1, rows.len() + 1] {
            let result = partition(&table, &scaled, k, &config);
            assert!(
                matches!(
                    result,
                    Err(SegmentationError::InvalidParameter { ref parameter, .. })
                        if parameter == "k"
                ),
                "k = {k} should be rejected"
            );
        }
    }

    #[test]
    fn test_non_finite_matrix_is_rejected() {
        let (table, mut scaled) = prepared(&blobs());
        scaled.matrix[[2, 1]] = f64::NAN;

        let err = partition(&table, &scaled, 2, &KMeansConfig::default()).unwrap_err();
        match err {
            SegmentationError::DataQuality { column, .. } => {
                assert_eq!(column, "Average Purchase Amount")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_iteration_cap_returns_result_with_warning() {
        // Two tight groups of three: a centroid seeded on one member needs
        // several steps to reach its group mean
        let (table, scaled) = prepared(&[
            [100.0, 50.0, 0.0, 0.0],
            [140.0, 70.0, 1.0, 0.0],
            [120.0, 65.0, 0.0, 0.0],
            [5000.0, 2500.0, 4.0, 1.0],
            [5400.0, 2600.0, 5.0, 1.0],
            [5200.0, 2700.0, 3.0, 1.0],
        ]);
        let config = KMeansConfig::default()
            .with_max_iterations(1)
            .with_tolerance(1e-9)
            .with_runs(1);

        let partition = partition(&table, &scaled, 2, &config).unwrap();
        assert_eq!(partition.assignment.len(), 6);

        let warning = partition.warning.as_ref().unwrap();
        assert_eq!(warning.max_iterations, 1);
        assert_eq!(warning.tolerance, 1e-9);
        assert!(warning.centroid_shift > warning.tolerance);
    }

    #[test]
    fn test_default_config_converges_without_warning() {
        let (table, scaled) = prepared(&blobs());
        let partition = partition(&table, &scaled, 3, &KMeansConfig::default()).unwrap();

        assert!(partition.warning.is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (table, scaled) = prepared(&blobs());
        for (config, name) in [
            (KMeansConfig::default().with_runs(0), "n_runs"),
            (KMeansConfig::default().with_max_iterations(0), "max_iterations"),
            (KMeansConfig::default().with_tolerance(0.0), "tolerance"),
        ] {
            assert!(matches!(
                partition(&table, &scaled, 2, &config),
                Err(SegmentationError::InvalidParameter { ref parameter, .. }) if parameter == name
            ));
        }
    }

    #[test]
    fn test_cluster_sizes_sum_to_customers() {
        let (table, scaled) = prepared(&blobs());
        let partition = partition(&table, &scaled, 3, &KMeansConfig::default()).unwrap();

        let sizes = partition.cluster_sizes();
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes.iter().sum::<usize>(), blobs().len());
        for summary in &partition.summary {
            assert_eq!(sizes[summary.cluster], summary.size);
        }
    }

    #[test]
    fn test_predict_matches_training_labels() {
        let (table, scaled) = prepared(&blobs());
        let partition = partition(&table, &scaled, 3, &KMeansConfig::default()).unwrap();

        for (row, &label) in scaled.matrix.outer_iter().zip(&partition.assignment) {
            assert_eq!(partition.predict(row).unwrap(), label);
        }
    }

    #[test]
    fn test_tie_goes_to_lower_centroid() {
        let centroids = ndarray::array![[1.0, 0.0], [-1.0, 0.0]];
        let point = ndarray::array![0.0, 0.0];

        assert_eq!(nearest_centroid(point.view(), centroids.view()).0, 0);
    }

    #[test]
    fn test_silhouette_is_bounded() {
        let (table, scaled) = prepared(&blobs());
        let partition = partition(&table, &scaled, 3, &KMeansConfig::default()).unwrap();

        let score = partition.silhouette_sample(&scaled.matrix, 100);
        assert!((-1.0..=1.0).contains(&score));
    }

    #[test]
    fn test_unscaled_centroids_match_summary_means() {
        let (table, scaled) = prepared(&blobs());
        let partition = partition(&table, &scaled, 3, &KMeansConfig::default()).unwrap();
        let raw = unscale_centroids(&partition, &scaled);

        // Converged centroids sit within the tolerance of their members' mean
        for summary in &partition.summary {
            let centroid = raw.row(summary.cluster);
            let expected = summary.means();
            for (j, value) in centroid.iter().enumerate() {
                let scale = scaled.scaler.scale[j];
                assert!((value - expected[j]).abs() <= 1e-4 * scale);
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_summary_labels_match_assignment(
            rows in prop::collection::vec(
                (0.0f64..1000.0, 0.0f64..500.0, 0.0f64..5.0, 0u8..2),
                3..20
            ),
            k_seed in 0usize..100,
        ) {
            let rows: Vec<[f64; N_FEATURES]> = rows
                .into_iter()
                .map(|(t, a, r, c)| [t, a, r, c as f64])
                .collect();
            let k = 2 + k_seed % (rows.len() - 1);
            let (table, scaled) = prepared(&rows);
            let config = KMeansConfig::default().with_runs(2);
            let partition = partition(&table, &scaled, k, &config).unwrap();

            let mut assigned = partition.assignment.clone();
            assigned.sort_unstable();
            assigned.dedup();
            let summarized: Vec<usize> = partition.summary.iter().map(|s| s.cluster).collect();

            prop_assert_eq!(assigned, summarized);
            prop_assert!(partition.assignment.iter().all(|&label| label < k));
        }
    }
}
