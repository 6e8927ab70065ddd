//! Flat exports of a segmentation: CSV tables via Polars and a JSON report

use std::fs::File;
use std::path::Path;

use polars::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::error::{ConvergenceWarning, Result};
use crate::features::FEATURE_NAMES;
use crate::model::ClusterSummary;
use crate::segment::{CustomerSegment, SegmentationResult};

/// Summary table with one row per populated cluster
pub fn summary_frame(summary: &[ClusterSummary]) -> PolarsResult<DataFrame> {
    let column = |f: fn(&ClusterSummary) -> f64| summary.iter().map(f).collect::<Vec<f64>>();

    DataFrame::new(vec![
        Series::new(
            "Cluster",
            summary.iter().map(|s| s.cluster as u64).collect::<Vec<_>>(),
        ),
        Series::new(
            "Customers",
            summary.iter().map(|s| s.size as u64).collect::<Vec<_>>(),
        ),
        Series::new(FEATURE_NAMES[0], column(|s| s.total_purchases)),
        Series::new(FEATURE_NAMES[1], column(|s| s.average_purchase_amount)),
        Series::new(FEATURE_NAMES[2], column(|s| s.total_returns)),
        Series::new(FEATURE_NAMES[3], column(|s| s.churn_status)),
    ])
}

/// Per-customer features with their cluster label
pub fn assignments_frame(records: &[CustomerSegment]) -> PolarsResult<DataFrame> {
    let column = |f: fn(&CustomerSegment) -> f64| records.iter().map(f).collect::<Vec<f64>>();

    DataFrame::new(vec![
        Series::new(
            "Customer Name",
            records
                .iter()
                .map(|r| r.customer_name.clone())
                .collect::<Vec<_>>(),
        ),
        Series::new(FEATURE_NAMES[0], column(|r| r.total_purchases)),
        Series::new(FEATURE_NAMES[1], column(|r| r.average_purchase_amount)),
        Series::new(FEATURE_NAMES[2], column(|r| r.total_returns)),
        Series::new(FEATURE_NAMES[3], column(|r| r.churn_status)),
        Series::new(
            "Cluster",
            records.iter().map(|r| r.cluster as u64).collect::<Vec<_>>(),
        ),
    ])
}

pub fn write_summary_csv(result: &SegmentationResult, path: impl AsRef<Path>) -> Result<()> {
    let mut frame = summary_frame(result.summary())?;
    write_csv(&mut frame, path.as_ref())
}

pub fn write_assignments_csv(result: &SegmentationResult, path: impl AsRef<Path>) -> Result<()> {
    let mut frame = assignments_frame(&result.records())?;
    write_csv(&mut frame, path.as_ref())
}

fn write_csv(frame: &mut DataFrame, path: &Path) -> Result<()> {
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(frame)?;
    info!(path = %path.display(), rows = frame.height(), "wrote CSV export");
    Ok(())
}

/// Serializable view of a segmentation, flat enough for a table widget
#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub k: usize,
    pub inertia: f64,
    pub skipped_records: usize,
    pub summary: &'a [ClusterSummary],
    pub customers: Vec<CustomerSegment>,
    pub warnings: Vec<ConvergenceWarning>,
}

impl<'a> From<&'a SegmentationResult> for Report<'a> {
    fn from(result: &'a SegmentationResult) -> Self {
        Self {
            k: result.k(),
            inertia: result.inertia(),
            skipped_records: result.feature_table().skipped_records,
            summary: result.summary(),
            customers: result.records(),
            warnings: result.warnings(),
        }
    }
}

pub fn to_json(result: &SegmentationResult) -> Result<String> {
    Ok(serde_json::to_string_pretty(&Report::from(result))?)
}

pub fn write_json(result: &SegmentationResult, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, &Report::from(result))?;
    info!(path = %path.display(), "wrote JSON report");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{TransactionRecord, TransactionSet};
    use crate::segment::segment;
    use tempfile::tempdir;

    fn result() -> SegmentationResult {
        let set = TransactionSet::from_records(&[
            TransactionRecord::purchase("Ann", 100.0),
            TransactionRecord::purchase("Ann", 100.0),
            TransactionRecord::purchase("Bob", 200.0),
            TransactionRecord::purchase("Cat", 5000.0).with_churn(1),
        ])
        .unwrap();
        segment(&set, 2).unwrap()
    }

    #[test]
    fn test_summary_frame_shape() {
        let result = result();
        let frame = summary_frame(result.summary()).unwrap();

        assert_eq!(frame.height(), result.summary().len());
        assert_eq!(frame.width(), 6);
        assert!(frame.column("Churn Status").is_ok());
    }

    #[test]
    fn test_write_csv_files() {
        let result = result();
        let dir = tempdir().unwrap();
        let summary_path = dir.path().join("summary.csv");
        let assignments_path = dir.path().join("assignments.csv");

        write_summary_csv(&result, &summary_path).unwrap();
        write_assignments_csv(&result, &assignments_path).unwrap();

        let summary = std::fs::read_to_string(summary_path).unwrap();
        assert!(summary.starts_with("Cluster,Customers,Total Purchases"));
        let assignments = std::fs::read_to_string(assignments_path).unwrap();
        assert_eq!(assignments.lines().count(), 1 + 3);
    }

    #[test]
    fn test_json_report() {
        let result = result();
        let json = to_json(&result).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["k"], 2);
        assert_eq!(value["customers"].as_array().unwrap().len(), 3);
        assert_eq!(value["customers"][0]["customer_name"], "Ann");
    }
}
