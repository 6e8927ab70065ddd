//! custseg: customer segmentation for e-commerce transaction data
//!
//! Transactions are reduced to one behavioral feature vector per customer
//! (total spend, average order value, returns, churn), standardized, imputed
//! and partitioned with seeded K-Means into a user-chosen number of clusters.

pub mod cli;
pub mod data;
pub mod error;
pub mod export;
pub mod features;
pub mod model;
pub mod preprocess;
pub mod segment;
pub mod viz;

// Re-export public items for easier access
pub use cli::Args;
pub use data::{TransactionRecord, TransactionSet};
pub use error::{ConvergenceWarning, Result, SegmentationError};
pub use features::{aggregate, CustomerFeatures, Feature, FeatureTable};
pub use model::{partition, ClusterSummary, KMeansConfig, Partition};
pub use preprocess::{impute, preprocess, standardize, ScaledFeatures, StandardScaler};
pub use segment::{segment, CustomerSegment, SegmentationResult, Segmenter};
