//! custseg: customer segmentation of e-commerce transactions
//!
//! Loads the transaction file, segments customers with K-Means, prints the
//! cluster summary and writes the projection and any requested exports.

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use custseg::{export, viz, Args, SegmentationResult, Segmenter, TransactionSet};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let start_time = Instant::now();

    let transactions = TransactionSet::from_csv(&args.input)
        .with_context(|| format!("failed to load transactions from {}", args.input.display()))?;
    println!("✓ Data loaded: {} transactions", transactions.len());

    let segmenter = Segmenter::new(args.kmeans_config());
    let result = segmenter
        .segment(&transactions, args.clusters)
        .with_context(|| format!("segmentation into {} clusters failed", args.clusters))?;

    if let Some(values) = args.parse_feature_values()? {
        run_prediction_mode(&result, values)?;
    } else {
        run_full_pipeline(&args, &result)?;
    }

    println!(
        "\nTotal processing time: {:.2}s",
        start_time.elapsed().as_secs_f64()
    );

    Ok(())
}

/// Report which cluster a new customer would join
fn run_prediction_mode(result: &SegmentationResult, values: [f64; 4]) -> Result<()> {
    println!("=== Prediction Mode ===");
    println!(
        "Input features: total={}, average={}, returns={}, churn={}",
        values[0], values[1], values[2], values[3]
    );

    let cluster = result.predict(&values)?;
    let cluster_sizes = result.cluster_sizes();
    let total_customers = result.feature_table().len();
    let cluster_percentage = (cluster_sizes[cluster] as f64 / total_customers as f64) * 100.0;

    println!("\n✓ Predicted Cluster: {}", cluster);
    println!(
        "  Size: {} customers ({:.1}% of total)",
        cluster_sizes[cluster], cluster_percentage
    );
    if let Some(summary) = result.summary().iter().find(|s| s.cluster == cluster) {
        println!(
            "  Cluster means: total={:.2}, average={:.2}, returns={:.2}, churn={:.2}",
            summary.total_purchases,
            summary.average_purchase_amount,
            summary.total_returns,
            summary.churn_status
        );
    }

    Ok(())
}

/// Print statistics, render charts and write exports
fn run_full_pipeline(args: &Args, result: &SegmentationResult) -> Result<()> {
    let table = result.feature_table();
    println!("✓ Customers segmented: {} customers", table.len());
    if table.skipped_records > 0 {
        println!(
            "  Skipped {} transactions without a customer name",
            table.skipped_records
        );
    }
    for warning in result.warnings() {
        println!("  ⚠ {warning}");
    }

    print_cluster_statistics(result);

    let sizes_path = viz::render_report(result, args.x, args.y, &args.output)?;
    println!("\n✓ Visualizations generated");
    println!("  Main plot saved to: {}", args.output.display());
    println!("  Cluster sizes saved to: {}", sizes_path.display());

    if let Some(path) = &args.summary_csv {
        export::write_summary_csv(result, path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("  Cluster summary saved to: {}", path.display());
    }
    if let Some(path) = &args.assignments_csv {
        export::write_assignments_csv(result, path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("  Assignments saved to: {}", path.display());
    }
    if let Some(path) = &args.json {
        export::write_json(result, path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("  JSON report saved to: {}", path.display());
    }

    Ok(())
}

fn print_cluster_statistics(result: &SegmentationResult) {
    let total_customers = result.feature_table().len();

    println!("\n=== Cluster Summary ({} clusters) ===", result.k());
    println!("Within-cluster sum of squares (Inertia): {:.2}", result.inertia());
    println!(
        "Silhouette score (sample): {:.3}",
        result.silhouette(500.min(total_customers))
    );

    println!("\n  Cluster | Customers | Total Purchases | Avg Purchase | Returns | Churn");
    println!("  --------|-----------|-----------------|--------------|---------|------");
    for summary in result.summary() {
        let percentage = (summary.size as f64 / total_customers as f64) * 100.0;
        println!(
            "  {:7} | {:>5} {:>3.0}% | {:15.2} | {:12.2} | {:7.2} | {:5.2}",
            summary.cluster,
            summary.size,
            percentage,
            summary.total_purchases,
            summary.average_purchase_amount,
            summary.total_returns,
            summary.churn_status
        );
    }
}
