//! Command-line interface definitions and argument parsing

use std::path::PathBuf;

use clap::Parser;

use crate::features::{Feature, N_FEATURES};
use crate::model::{KMeansConfig, DEFAULT_SEED};

/// Segment e-commerce customers with K-Means on their purchase behavior
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the transactions CSV file
    #[arg(short, long, default_value = "ecommerce_customer_data_large.csv")]
    pub input: PathBuf,

    /// Number of clusters for K-Means
    #[arg(short = 'k', long, default_value = "4")]
    pub clusters: usize,

    /// Output path for the cluster scatter plot (SVG)
    #[arg(short, long, default_value = "segmentation.svg")]
    pub output: PathBuf,

    /// Feature plotted on the horizontal axis
    #[arg(long, value_enum, default_value = "total-purchases")]
    pub x: Feature,

    /// Feature plotted on the vertical axis
    #[arg(long, value_enum, default_value = "average-purchase-amount")]
    pub y: Feature,

    /// Maximum iterations for K-Means algorithm
    #[arg(long, default_value = "300")]
    pub max_iters: u64,

    /// Tolerance for K-Means convergence
    #[arg(long, default_value = "1e-4")]
    pub tolerance: f64,

    /// Number of k-means++ restarts; the best one is kept
    #[arg(long, default_value = "10")]
    pub runs: usize,

    /// Seed for centroid initialization
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    /// Write the per-cluster summary to this CSV file
    #[arg(long)]
    pub summary_csv: Option<PathBuf>,

    /// Write every customer with its cluster label to this CSV file
    #[arg(long)]
    pub assignments_csv: Option<PathBuf>,

    /// Write the full segmentation report as JSON
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Prediction mode: provide total,average,returns,churn as comma-separated string
    /// Example: --predict "2500,500,1,0"
    #[arg(short, long)]
    pub predict: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// K-Means settings requested on the command line
    pub fn kmeans_config(&self) -> KMeansConfig {
        KMeansConfig::default()
            .with_max_iterations(self.max_iters)
            .with_tolerance(self.tolerance)
            .with_runs(self.runs)
            .with_seed(self.seed)
    }

    /// Parse feature values from the predict string
    /// Expected format: "total,average,returns,churn"
    pub fn parse_feature_values(&self) -> anyhow::Result<Option<[f64; N_FEATURES]>> {
        let Some(ref predict_str) = self.predict else {
            return Ok(None);
        };

        let parts: Vec<&str> = predict_str.split(',').collect();
        if parts.len() != N_FEATURES {
            anyhow::bail!("Predict values must be in format 'total,average,returns,churn'");
        }

        let mut values = [0.0; N_FEATURES];
        for ((value, part), feature) in values.iter_mut().zip(&parts).zip(Feature::ALL) {
            *value = part
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid {} value: {}", feature.name(), part))?;
        }

        Ok(Some(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["custseg"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = args(&[]);

        assert_eq!(args.clusters, 4);
        assert_eq!(args.x, Feature::TotalPurchases);
        assert_eq!(args.y, Feature::AveragePurchaseAmount);
        assert_eq!(args.kmeans_config(), KMeansConfig::default());
    }

    #[test]
    fn test_feature_axes_and_config() {
        let args = args(&["-k", "6", "--x", "churn-status", "--seed", "7", "--runs", "3"]);

        assert_eq!(args.clusters, 6);
        assert_eq!(args.x, Feature::ChurnStatus);
        let config = args.kmeans_config();
        assert_eq!(config.seed, 7);
        assert_eq!(config.n_runs, 3);
    }

    #[test]
    fn test_parse_feature_values() {
        let mut args = args(&["--predict", "2500, 500,1,0"]);

        let result = args.parse_feature_values().unwrap();
        assert_eq!(result, Some([2500.0, 500.0, 1.0, 0.0]));

        args.predict = None;
        assert_eq!(args.parse_feature_values().unwrap(), None);

        args.predict = Some("1,2,3".to_string());
        assert!(args.parse_feature_values().is_err());

        args.predict = Some("1,2,x,0".to_string());
        let err = args.parse_feature_values().unwrap_err();
        assert!(err.to_string().contains("Total Returns"));
    }
}
