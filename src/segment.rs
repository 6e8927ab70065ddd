//! Segmentation facade: aggregate, preprocess and partition with a per-set cache

use std::sync::{Arc, PoisonError, RwLock};

use ndarray::Array2;
use serde::Serialize;
use tracing::{debug, info};

use crate::data::TransactionSet;
use crate::error::{ConvergenceWarning, Result, SegmentationError};
use crate::features::{aggregate, FeatureTable, N_FEATURES};
use crate::model::{partition, unscale_centroids, ClusterSummary, KMeansConfig, Partition};
use crate::preprocess::{preprocess, ScaledFeatures, StandardScaler};

/// K-independent stages derived from one transaction set
#[derive(Debug)]
struct Prepared {
    set_id: u64,
    features: Arc<FeatureTable>,
    scaled: Arc<ScaledFeatures>,
}

/// Runs segmentations for varying K, reusing aggregation and scaling across calls.
///
/// The cache holds the prepared features of the most recent transaction set.
/// Asking for a different set replaces it wholesale. Two threads racing to fill
/// it compute the same value, so whichever write lands last is equivalent.
#[derive(Debug, Default)]
pub struct Segmenter {
    config: KMeansConfig,
    cache: RwLock<Option<Arc<Prepared>>>,
}

impl Segmenter {
    pub fn new(config: KMeansConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &KMeansConfig {
        &self.config
    }

    /// Segment `transactions` into `k` clusters
    pub fn segment(&self, transactions: &TransactionSet, k: usize) -> Result<SegmentationResult> {
        if transactions.is_empty() {
            return Err(SegmentationError::invalid_parameter(
                "transactions",
                "cannot segment an empty transaction set",
            ));
        }

        let prepared = self.prepare(transactions)?;
        let partition = partition(&prepared.features, &prepared.scaled, k, &self.config)?;

        Ok(SegmentationResult {
            features: Arc::clone(&prepared.features),
            scaled: Arc::clone(&prepared.scaled),
            partition,
        })
    }

    /// Drop cached features so the next call recomputes them
    pub fn invalidate(&self) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Whether features for this set are already cached
    pub fn is_cached(&self, transactions: &TransactionSet) -> bool {
        self.cached(transactions.id()).is_some()
    }

    fn cached(&self, set_id: u64) -> Option<Arc<Prepared>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|prepared| prepared.set_id == set_id)
            .cloned()
    }

    fn prepare(&self, transactions: &TransactionSet) -> Result<Arc<Prepared>> {
        if let Some(prepared) = self.cached(transactions.id()) {
            debug!(set_id = transactions.id(), "reusing cached customer features");
            return Ok(prepared);
        }

        let features = aggregate(transactions)?;
        let scaled = preprocess(&features)?;
        let prepared = Arc::new(Prepared {
            set_id: transactions.id(),
            features: Arc::new(features),
            scaled: Arc::new(scaled),
        });

        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&prepared));
        info!(
            set_id = transactions.id(),
            customers = prepared.features.len(),
            "prepared customer features"
        );

        Ok(prepared)
    }
}

/// One-shot segmentation with the default configuration
pub fn segment(transactions: &TransactionSet, k: usize) -> Result<SegmentationResult> {
    Segmenter::default().segment(transactions, k)
}

/// Customers, their cluster labels and the per-cluster summary
#[derive(Debug, Clone, Serialize)]
pub struct SegmentationResult {
    pub features: Arc<FeatureTable>,
    pub scaled: Arc<ScaledFeatures>,
    pub partition: Partition,
}

/// Flat per-customer row for tables and charts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerSegment {
    pub customer_name: String,
    pub total_purchases: f64,
    pub average_purchase_amount: f64,
    pub total_returns: f64,
    pub churn_status: f64,
    pub cluster: usize,
}

impl SegmentationResult {
    pub fn k(&self) -> usize {
        self.partition.k
    }

    /// Cluster label per customer, aligned with [`Self::feature_table`]
    pub fn assignment(&self) -> &[usize] {
        &self.partition.assignment
    }

    pub fn summary(&self) -> &[ClusterSummary] {
        &self.partition.summary
    }

    pub fn feature_table(&self) -> &FeatureTable {
        &self.features
    }

    pub fn inertia(&self) -> f64 {
        self.partition.inertia
    }

    pub fn warnings(&self) -> Vec<ConvergenceWarning> {
        self.partition.warning.iter().cloned().collect()
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        self.partition.cluster_sizes()
    }

    /// Centroids in raw feature units
    pub fn centroids(&self) -> Array2<f64> {
        unscale_centroids(&self.partition, &self.scaled)
    }

    /// Scaler fitted on this set's features
    pub fn scaler(&self) -> &StandardScaler {
        &self.scaled.scaler
    }

    /// Sampled silhouette coefficient in scaled space
    pub fn silhouette(&self, sample_size: usize) -> f64 {
        self.partition
            .silhouette_sample(&self.scaled.matrix, sample_size)
    }

    /// Cluster a new customer would join, given raw `[total, average, returns, churn]`
    pub fn predict(&self, values: &[f64; N_FEATURES]) -> Result<usize> {
        let scaled = self.scaled.scaler.transform_one(values);
        self.partition.predict(scaled.view())
    }

    /// One flat record per customer
    pub fn records(&self) -> Vec<CustomerSegment> {
        self.features
            .customers
            .iter()
            .zip(&self.partition.assignment)
            .map(|(customer, &cluster)| CustomerSegment {
                customer_name: customer.customer_name.clone(),
                total_purchases: customer.total_purchases,
                average_purchase_amount: customer.average_purchase_amount,
                total_returns: customer.total_returns,
                churn_status: customer.churn_status,
                cluster,
            })
            .collect()
    }
}
