//! Output files of a label transfer run: scatter plots of the joint
//! embedding and the per-cell metadata table.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use log::info;
use plotters::prelude::*;

const PLOT_SIZE: (u32, u32) = (800, 800);
const MARGIN: f64 = 40.0;
const POINT_RADIUS: i32 = 3;

/// One row of the metadata table.
#[derive(Debug, Clone, PartialEq)]
pub struct CellRecord {
    pub cell: String,
    pub technology: String,
    pub rna_cluster: Option<String>,
    pub atac_cluster: Option<String>,
    pub predicted_id: Option<String>,
    pub prediction_score: Option<f64>,
    pub umap: [f64; 2],
}

impl CellRecord {
    /// Label shown in the annotated plot: the cluster for reference cells,
    /// the prediction for query cells.
    pub fn annotation(&self) -> Option<&str> {
        self.rna_cluster.as_deref().or(self.predicted_id.as_deref())
    }
}

fn optional(value: Option<&str>) -> String {
    value.unwrap_or("NA").to_string()
}

/// Tab-separated metadata, one line per cell.
pub fn write_metadata<W: Write>(records: &[CellRecord], writer: W) -> Result<()> {
    let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    out.write_record([
        "cell",
        "technology",
        "rna_cluster",
        "atac_cluster",
        "predicted_id",
        "prediction_score",
        "UMAP_1",
        "UMAP_2",
    ])?;
    for r in records {
        out.write_record([
            r.cell.clone(),
            r.technology.clone(),
            optional(r.rna_cluster.as_deref()),
            optional(r.atac_cluster.as_deref()),
            optional(r.predicted_id.as_deref()),
            r.prediction_score.map_or_else(|| "NA".to_string(), |s| s.to_string()),
            r.umap[0].to_string(),
            r.umap[1].to_string(),
        ])?;
    }
    out.flush()?;
    Ok(())
}

/// Maps embedding coordinates onto the plot canvas; shared by all plots of a
/// run so that they overlay.
struct Canvas {
    min: [f64; 2],
    span: [f64; 2],
}

impl Canvas {
    fn fit(records: &[CellRecord]) -> Self {
        let mut min = [f64::INFINITY; 2];
        let mut max = [f64::NEG_INFINITY; 2];
        for r in records {
            for d in 0..2 {
                min[d] = min[d].min(r.umap[d]);
                max[d] = max[d].max(r.umap[d]);
            }
        }
        let span = [0, 1].map(|d| {
            let s = max[d] - min[d];
            if s.is_finite() && s > 0.0 { s } else { 1.0 }
        });
        let min = min.map(|m| if m.is_finite() { m } else { 0.0 });
        Canvas { min, span }
    }

    fn pixel(&self, point: [f64; 2]) -> (i32, i32) {
        let width = PLOT_SIZE.0 as f64 - 2.0 * MARGIN;
        let height = PLOT_SIZE.1 as f64 - 2.0 * MARGIN;
        let x = MARGIN + (point[0] - self.min[0]) / self.span[0] * width;
        let y = MARGIN + (1.0 - (point[1] - self.min[1]) / self.span[1]) * height;
        (x.round() as i32, y.round() as i32)
    }
}

/// Scatter plot of the cells for which `colour_by` returns a category,
/// one palette colour per sorted category.
fn plot_cells<F>(path: &Path, records: &[CellRecord], canvas: &Canvas, colour_by: F) -> Result<()>
where
    F: Fn(&CellRecord) -> Option<&str>,
{
    let mut categories: Vec<&str> = records.iter().filter_map(&colour_by).collect();
    categories.sort_unstable();
    categories.dedup();

    let root = BitMapBackend::new(path, PLOT_SIZE).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| anyhow!("Failed to draw {}: {}", path.display(), e))?;
    for r in records {
        let Some(category) = colour_by(r) else {
            continue;
        };
        let colour_index = categories.binary_search(&category).unwrap_or(0);
        root.draw(&Circle::new(
            canvas.pixel(r.umap),
            POINT_RADIUS,
            Palette99::pick(colour_index).filled(),
        ))
        .map_err(|e| anyhow!("Failed to draw {}: {}", path.display(), e))?;
    }
    root.present()
        .map_err(|e| anyhow!("Failed to write {}: {}", path.display(), e))?;
    Ok(())
}

/// Write the four plots and the metadata table into `dir`, returning the
/// written paths.
pub fn write_report(dir: &Path, project: &str, records: &[CellRecord]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    let canvas = Canvas::fit(records);

    let source = dir.join(format!("{}_source.png", project));
    plot_cells(&source, records, &canvas, |r| Some(r.technology.as_str()))?;

    let rna_only = dir.join(format!("{}_RNAonly.png", project));
    plot_cells(&rna_only, records, &canvas, |r| r.rna_cluster.as_deref())?;

    let atac_only = dir.join(format!("{}_ATAConly.png", project));
    plot_cells(&atac_only, records, &canvas, |r| r.atac_cluster.as_deref())?;

    let annotated = dir.join(format!("{}_annotated.png", project));
    plot_cells(&annotated, records, &canvas, CellRecord::annotation)?;

    let metadata = dir.join(format!("{}_metadata.tsv", project));
    let file = std::fs::File::create(&metadata)
        .with_context(|| format!("Failed to create {}", metadata.display()))?;
    write_metadata(records, file)?;

    info!("Wrote label transfer report to {}", dir.display());
    Ok(vec![source, rna_only, atac_only, annotated, metadata])
}
