//! Gene activity scores for chromatin-accessibility cells.
//!
//! A gene's activity in a cell is the summed accessibility of every region
//! overlapping the gene body extended upstream of its transcription start.

use std::collections::HashMap;

use anyhow::Result;
use log::debug;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use serde::{Deserialize, Serialize};

use crate::error::MarkerError;
use crate::matrix::FeatureMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strand {
    #[serde(rename = "+")]
    Forward,
    #[serde(rename = "-")]
    Reverse,
}

/// One gene of the annotation, closed coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneAnnotation {
    pub gene: String,
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub strand: Strand,
}

impl GeneAnnotation {
    /// The gene body extended by `upstream` bases before its 5' end.
    pub fn extended(&self, upstream: u64) -> GenomicRegion {
        let (start, end) = match self.strand {
            Strand::Forward => (self.start.saturating_sub(upstream), self.end),
            Strand::Reverse => (self.start, self.end.saturating_add(upstream)),
        };
        GenomicRegion {
            chrom: self.chrom.clone(),
            start,
            end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenomicRegion {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}

impl GenomicRegion {
    /// Parse `chr:start-end` or `chr-start-end`.
    pub fn parse(id: &str) -> Result<Self> {
        let invalid = || MarkerError::InvalidMatrix(format!("cannot parse region '{}'", id));

        let (chrom, range) = match id.split_once(':') {
            Some((chrom, range)) => (chrom, range),
            None => {
                let mut parts = id.rsplitn(3, '-');
                let end = parts.next().ok_or_else(invalid)?;
                let start = parts.next().ok_or_else(invalid)?;
                let chrom = parts.next().ok_or_else(invalid)?;
                let range_len = start.len() + 1 + end.len();
                (chrom, &id[id.len() - range_len..])
            }
        };
        let (start, end) = range.split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end: u64 = end.trim().parse().map_err(|_| invalid())?;
        if chrom.is_empty() || end < start {
            return Err(invalid().into());
        }
        Ok(GenomicRegion {
            chrom: chrom.to_string(),
            start,
            end,
        })
    }
}

/// Regions of one chromosome sorted by start, with their matrix rows.
struct ChromIndex {
    regions: Vec<(u64, u64, usize)>,
    longest: u64,
}

impl ChromIndex {
    fn overlapping(&self, start: u64, end: u64) -> impl Iterator<Item = usize> + '_ {
        let first = self
            .regions
            .partition_point(|&(s, _, _)| s.saturating_add(self.longest) < start);
        self.regions[first..]
            .iter()
            .take_while(move |&&(s, _, _)| s <= end)
            .filter(move |&&(_, e, _)| e >= start)
            .map(|&(_, _, row)| row)
    }
}

fn index_regions(names: &[String]) -> Result<HashMap<String, ChromIndex>> {
    let mut by_chrom: HashMap<String, ChromIndex> = HashMap::new();
    for (row, name) in names.iter().enumerate() {
        let region = GenomicRegion::parse(name)?;
        let entry = by_chrom.entry(region.chrom).or_insert_with(|| ChromIndex {
            regions: Vec::new(),
            longest: 0,
        });
        entry.longest = entry.longest.max(region.end - region.start);
        entry.regions.push((region.start, region.end, row));
    }
    for index in by_chrom.values_mut() {
        index.regions.sort_unstable();
    }
    Ok(by_chrom)
}

/// Sum the region rows of `regions` over each annotated gene.
///
/// Genes sharing a name are merged; each region counts once per gene. Genes
/// without any overlapping region are left out of the result.
pub fn gene_activity(
    regions: &FeatureMatrix<f64>,
    annotation: &[GeneAnnotation],
    upstream: u64,
) -> Result<FeatureMatrix<f64>> {
    let index = index_regions(regions.feature_names())?;

    let mut genes: Vec<String> = Vec::new();
    let mut gene_rows: HashMap<&str, usize> = HashMap::new();
    let mut members: Vec<Vec<usize>> = Vec::new();
    for gene in annotation {
        let body = gene.extended(upstream);
        let Some(chrom) = index.get(&body.chrom) else {
            continue;
        };
        let hits: Vec<usize> = chrom.overlapping(body.start, body.end).collect();
        if hits.is_empty() {
            continue;
        }
        let slot = *gene_rows.entry(gene.gene.as_str()).or_insert_with(|| {
            genes.push(gene.gene.clone());
            members.push(Vec::new());
            members.len() - 1
        });
        members[slot].extend(hits);
    }
    if genes.is_empty() {
        let message = "no annotated gene overlaps an accessible region".to_string();
        return Err(MarkerError::InvalidMatrix(message).into());
    }

    let source = regions.matrix();
    let mut coo = CooMatrix::new(genes.len(), regions.n_cells());
    let mut sums = vec![0.0; regions.n_cells()];
    for (gene_row, rows) in members.iter_mut().enumerate() {
        rows.sort_unstable();
        rows.dedup();
        sums.iter_mut().for_each(|s| *s = 0.0);
        for &r in rows.iter() {
            let row = source.row(r);
            for (&c, &v) in row.col_indices().iter().zip(row.values()) {
                sums[c] += v;
            }
        }
        for (c, &s) in sums.iter().enumerate() {
            if s != 0.0 {
                coo.push(gene_row, c, s);
            }
        }
    }
    debug!(
        "Gene activity for {} genes from {} regions",
        genes.len(),
        regions.n_features()
    );

    FeatureMatrix::new(CsrMatrix::from(&coo), genes, regions.cell_names().to_vec())
}

/// Columns of `activity` for the cells of `cells` that it contains, in
/// `cells` order. Fails with `NoSharedCells` when there is none.
pub fn restrict_to_cells(
    activity: &FeatureMatrix<f64>,
    cells: &[String],
) -> Result<FeatureMatrix<f64>> {
    let shared: Vec<usize> = cells.iter().filter_map(|c| activity.cell_position(c)).collect();
    if shared.is_empty() {
        return Err(MarkerError::NoSharedCells.into());
    }
    activity.select_cells(&shared)
}
