//! Cluster projections rendered to SVG with Plotters

use std::path::{Path, PathBuf};

use plotters::prelude::*;
use tracing::info;

use crate::error::{Result, SegmentationError};
use crate::features::Feature;
use crate::segment::SegmentationResult;

/// Color palette for different clusters
const CLUSTER_COLORS: [RGBColor; 10] = [
    RGBColor(99, 110, 250),
    RGBColor(239, 85, 59),
    RGBColor(0, 204, 150),
    RGBColor(171, 99, 250),
    RGBColor(255, 161, 90),
    RGBColor(25, 211, 243),
    RGBColor(255, 102, 146),
    RGBColor(182, 232, 128),
    RGBColor(255, 151, 255),
    RGBColor(254, 203, 82),
];

fn cluster_color(cluster: usize) -> RGBColor {
    CLUSTER_COLORS
        .get(cluster)
        .copied()
        .unwrap_or(BLACK)
}

fn plot_error(err: impl std::fmt::Display) -> SegmentationError {
    SegmentationError::Plot(err.to_string())
}

/// Scatter two raw features against each other, one color per cluster.
///
/// Centroids, mapped back to raw units, are drawn as crosses and named in the legend.
pub fn render_scatter(
    result: &SegmentationResult,
    x: Feature,
    y: Feature,
    output_path: &Path,
    plot_title: Option<&str>,
) -> Result<()> {
    let default_title = format!("Customer Segmentation ({} Clusters)", result.k());
    let title = plot_title.unwrap_or(&default_title);

    let records = result.feature_table();
    let points: Vec<(f64, f64, usize)> = records
        .customers
        .iter()
        .zip(result.assignment())
        .map(|(customer, &cluster)| (customer.get(x), customer.get(y), cluster))
        .filter(|(px, py, _)| px.is_finite() && py.is_finite())
        .collect();

    if points.is_empty() {
        return Err(SegmentationError::data_quality(
            x.name(),
            "no customer has finite values for both plotted features",
        ));
    }

    let (x_range, y_range) = padded_bounds(&points);

    let root = SVGBackend::new(output_path, (800, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 26))
        .margin(10)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(x_range, y_range)
        .map_err(plot_error)?;

    chart
        .configure_mesh()
        .x_desc(x.name())
        .y_desc(y.name())
        .axis_desc_style(("sans-serif", 15))
        .draw()
        .map_err(plot_error)?;

    chart
        .draw_series(
            points.iter().map(|&(px, py, cluster)| {
                Circle::new((px, py), 4, cluster_color(cluster).filled())
            }),
        )
        .map_err(plot_error)?;

    let centroids = result.centroids();
    for summary in result.summary() {
        let centroid = centroids.row(summary.cluster);
        let (cx, cy) = (centroid[x.index()], centroid[y.index()]);
        let color = cluster_color(summary.cluster);

        chart
            .draw_series(std::iter::once(Cross::new((cx, cy), 8, color.stroke_width(3))))
            .map_err(plot_error)?
            .label(format!("Cluster {} ({} customers)", summary.cluster, summary.size))
            .legend(move |(lx, ly)| {
                Rectangle::new([(lx, ly - 5), (lx + 10, ly + 5)], color.filled())
            });
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(plot_error)?;

    root.present().map_err(plot_error)?;
    info!(path = %output_path.display(), "cluster scatter saved");

    Ok(())
}

/// Bar chart of customers per cluster label
pub fn render_cluster_sizes(result: &SegmentationResult, output_path: &Path) -> Result<()> {
    let cluster_sizes = result.cluster_sizes();
    let max_size = cluster_sizes.iter().copied().max().unwrap_or(1).max(1) as f64;

    let root = SVGBackend::new(output_path, (600, 400)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Cluster Sizes", ("sans-serif", 26))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(-0.5f64..(result.k() as f64 - 0.5), 0f64..(max_size * 1.1))
        .map_err(plot_error)?;

    chart
        .configure_mesh()
        .x_desc("Cluster ID")
        .y_desc("Number of Customers")
        .axis_desc_style(("sans-serif", 15))
        .draw()
        .map_err(plot_error)?;

    chart
        .draw_series(cluster_sizes.iter().enumerate().map(|(cluster, &size)| {
            Rectangle::new(
                [(cluster as f64 - 0.4, 0.0), (cluster as f64 + 0.4, size as f64)],
                cluster_color(cluster).filled(),
            )
        }))
        .map_err(plot_error)?;

    root.present().map_err(plot_error)?;
    info!(path = %output_path.display(), "cluster size chart saved");

    Ok(())
}

/// Render the scatter to `base_output_path` and the size chart next to it.
///
/// Returns the path of the size chart.
pub fn render_report(
    result: &SegmentationResult,
    x: Feature,
    y: Feature,
    base_output_path: &Path,
) -> Result<PathBuf> {
    render_scatter(result, x, y, base_output_path, None)?;

    let sizes_path = sizes_chart_path(base_output_path);
    render_cluster_sizes(result, &sizes_path)?;

    Ok(sizes_path)
}

/// `plot.svg` -> `plot_sizes.svg`
pub fn sizes_chart_path(base_output_path: &Path) -> PathBuf {
    let stem = base_output_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clusters".to_string());
    base_output_path.with_file_name(format!("{stem}_sizes.svg"))
}

fn padded_bounds(points: &[(f64, f64, usize)]) -> (std::ops::Range<f64>, std::ops::Range<f64>) {
    let bounds = |values: Vec<f64>| {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let pad = ((max - min) * 0.05).max(0.5);
        (min - pad)..(max + pad)
    };

    (
        bounds(points.iter().map(|p| p.0).collect()),
        bounds(points.iter().map(|p| p.1).collect()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{TransactionRecord, TransactionSet};
    use crate::segment::segment;
    use tempfile::tempdir;

    fn create_test_result() -> SegmentationResult {
        let set = TransactionSet::from_records(&[
            TransactionRecord::purchase("Ann", 100.0),
            TransactionRecord::purchase("Bob", 150.0),
            TransactionRecord::purchase("Cat", 4000.0).with_churn(1),
            TransactionRecord::purchase("Dan", 4200.0).with_churn(1),
            TransactionRecord::purchase("Eve", 2000.0),
        ])
        .unwrap();
        segment(&set, 3).unwrap()
    }

    #[test]
    fn test_render_scatter() {
        let result = create_test_result();
        let temp_dir = tempdir().unwrap();
        let output_path = temp_dir.path().join("test_plot.svg");

        render_scatter(
            &result,
            Feature::TotalPurchases,
            Feature::AveragePurchaseAmount,
            &output_path,
            None,
        )
        .unwrap();

        let svg = std::fs::read_to_string(&output_path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("Customer Segmentation (3 Clusters)"));
    }

    #[test]
    fn test_render_report_writes_both_charts() {
        let result = create_test_result();
        let temp_dir = tempdir().unwrap();
        let output_path = temp_dir.path().join("report.svg");

        let sizes_path = render_report(
            &result,
            Feature::TotalPurchases,
            Feature::ChurnStatus,
            &output_path,
        )
        .unwrap();

        assert!(output_path.exists());
        assert_eq!(sizes_path, temp_dir.path().join("report_sizes.svg"));
        assert!(sizes_path.exists());
    }

    #[test]
    fn test_padded_bounds_handle_constant_values() {
        let (x, y) = padded_bounds(&[(1.0, 5.0, 0), (1.0, 5.0, 1)]);
        assert!(x.start < 1.0 && x.end > 1.0);
        assert!(y.start < 5.0 && y.end > 5.0);
    }
}
