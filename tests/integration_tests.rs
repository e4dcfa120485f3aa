// End-to-end checks of the marker drivers and the label transfer pipeline.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use single_markers::markers::{MarkerConfig, find_all_markers, find_markers};
use single_markers::testing::TestMethod;
use single_markers::testing::effect::{FoldChangeBase, summarize_features};
use single_markers::transfer::{
    ActivitySource, GeneAnnotation, Query, Reference, Strand, TransferConfig, TransferInputs,
    run_label_transfer,
};
use single_markers::{Capabilities, CellGroups, DataLayer, FeatureMatrix, MarkerError};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn names(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}{}", prefix, i)).collect()
}

/// 2,000 log-normalized features over 50 + 60 cells; the first 50 features
/// are detected far more often in the first group.
fn scenario() -> (FeatureMatrix<f64>, CellGroups) {
    let mut rng = StdRng::seed_from_u64(2024);
    let n_cells = 110;
    let rows: Vec<Vec<f64>> = (0..2000)
        .map(|f| {
            let background = 0.05 + 0.4 * (f % 7) as f64 / 7.0;
            (0..n_cells)
                .map(|c| {
                    let p = match (f < 50, c < 50) {
                        (true, true) => 0.8,
                        (true, false) => 0.1,
                        _ => background,
                    };
                    if rng.random::<f64>() < p {
                        (2.0 + rng.random_range(0..5) as f64).ln()
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect();
    let matrix =
        FeatureMatrix::from_dense_rows(&rows, names("feature", 2000), names("cell", n_cells))
            .unwrap();
    let groups = CellGroups::from_indices((0..50).collect(), (50..110).collect(), n_cells).unwrap();
    (matrix, groups)
}

fn sequential(method: TestMethod) -> MarkerConfig {
    MarkerConfig {
        method,
        parallel: false,
        ..MarkerConfig::default()
    }
}

#[cfg(test)]
mod marker_scenarios {
    use super::*;

    #[test]
    fn wilcoxon_scenario_is_ranked_and_corrected() {
        init();
        let (matrix, groups) = scenario();
        let config = MarkerConfig::default();
        let table = find_markers(&matrix, &groups, None, &config, Capabilities::none()).unwrap();

        assert!(!table.is_empty());
        assert!(table.len() < 2000);
        assert_eq!(table.total_features(), 2000);

        for pair in table.rows().windows(2) {
            let (a, b) = (pair[0].p_val().unwrap(), pair[1].p_val().unwrap());
            assert!(a <= b);
            if a == b {
                assert!(pair[0].avg_log_fc >= pair[1].avg_log_fc);
            }
        }
        for row in table.rows() {
            let (p, adj) = (row.p_val().unwrap(), row.p_val_adj().unwrap());
            assert!((0.0..=1.0).contains(&adj));
            assert!((adj - (p * 2000.0).min(1.0)).abs() < 1e-12);
        }

        let top: Vec<usize> = table.rows()[..50]
            .iter()
            .map(|r| r.feature.trim_start_matches("feature").parse().unwrap())
            .collect();
        assert!(top.iter().all(|&f| f < 50), "top rows: {:?}", top);
    }

    #[test]
    fn unknown_method_in_config_fails_before_testing() {
        let err = MarkerConfig::from_json_str(r#"{"method": "foo"}"#).unwrap_err();
        assert!(format!("{:#}", err).contains("Unknown test: 'foo'"));
    }

    #[test]
    fn downsampled_runs_are_reproducible() {
        let (matrix, groups) = scenario();
        let config = MarkerConfig {
            max_cells_per_group: Some(30),
            random_seed: 11,
            ..MarkerConfig::default()
        };
        let a = find_markers(&matrix, &groups, None, &config, Capabilities::none()).unwrap();
        let b = find_markers(&matrix, &groups, None, &config, Capabilities::none()).unwrap();
        assert_eq!(a.rows(), b.rows());
    }

    #[test]
    fn auc_table_has_no_p_values() {
        let (matrix, groups) = scenario();
        let config = sequential(TestMethod::Roc);
        let table = find_markers(&matrix, &groups, None, &config, Capabilities::none()).unwrap();
        assert!(table.rows().iter().all(|r| r.p_val().is_none() && r.p_val_adj().is_none()));
        assert!(table.rows().iter().all(|r| (0.0..=1.0).contains(&r.auc().unwrap())));
        let aucs: Vec<f64> = table.rows().iter().map(|r| r.auc().unwrap()).collect();
        assert!(aucs.windows(2).all(|w| w[0] >= w[1]));

        let mut buf = Vec::new();
        table.write_to(&mut buf).unwrap();
        let header = String::from_utf8(buf).unwrap().lines().next().unwrap().to_string();
        assert!(header.contains("AUC") && !header.contains("p_val"));
    }

    #[test]
    fn glm_skipped_features_are_absent_and_reported() {
        init();
        let mut rows = vec![
            // Shifted counts
            vec![
                5.0, 7.0, 6.0, 9.0, 4.0, 8.0, 6.0, 7.0, 5.0, 6.0, // group 1
                1.0, 0.0, 2.0, 1.0, 0.0, 1.0, 2.0, 0.0, 1.0, 1.0, // group 2
            ],
            // Two expressing cells in group 1, none in group 2
            vec![0.0; 20],
        ];
        rows[1][0] = 3.0;
        rows[1][1] = 2.0;
        let features = vec!["shifted".into(), "rare".into()];
        let matrix = FeatureMatrix::from_dense_rows(&rows, features, names("c", 20)).unwrap();
        let groups = CellGroups::from_indices((0..10).collect(), (10..20).collect(), 20).unwrap();
        let config = MarkerConfig {
            layer: DataLayer::Counts,
            ..sequential(TestMethod::Poisson)
        };
        let table = find_markers(&matrix, &groups, None, &config, Capabilities::none()).unwrap();

        assert_eq!(table.len(), 1);
        assert!(table.get("rare").is_none());
        assert!(table.get("shifted").unwrap().p_val().unwrap() < 1e-6);
        assert!(table.diagnostics().warnings().any(|d| d.feature.as_deref() == Some("rare")));
    }

    #[cfg(feature = "size-factor")]
    #[test]
    fn size_factor_bypasses_the_prefilter() {
        let rows: Vec<Vec<f64>> = (0..5)
            .map(|f| {
                (0..16)
                    .map(|c| {
                        let depth = 1.0 + (c % 4) as f64 * 0.5;
                        let level = if f == 0 && c < 8 { 30.0 } else { 8.0 + f as f64 };
                        (level * depth + ((c * 7 + f * 3) % 5) as f64).round()
                    })
                    .collect()
            })
            .collect();
        let matrix =
            FeatureMatrix::from_dense_rows(&rows, names("gene", 5), names("c", 16)).unwrap();
        let groups = CellGroups::from_indices((0..8).collect(), (8..16).collect(), 16).unwrap();
        let config = MarkerConfig {
            layer: DataLayer::Counts,
            min_pct: 0.99,
            logfc_threshold: 10.0,
            ..sequential(TestMethod::SizeFactor)
        };
        let table = find_markers(&matrix, &groups, None, &config, Capabilities::detect()).unwrap();
        assert_eq!(table.len(), 5);

        let summaries = summarize_features(
            &matrix,
            &groups,
            &[0, 1, 2, 3, 4],
            DataLayer::Counts,
            1.0,
            FoldChangeBase::Natural,
            false,
        );
        for (f, summary) in summaries.iter().enumerate() {
            let row = table.get(&format!("gene{}", f)).unwrap();
            assert_eq!(row.avg_log_fc, summary.avg_log_fc);
        }
        assert_eq!(table.rows()[0].feature, "gene0");
    }

    #[test]
    fn all_markers_cover_every_cluster() {
        let (matrix, _) = scenario();
        let labels: Vec<&str> = (0..110).map(|c| if c < 50 { "alpha" } else { "beta" }).collect();
        let config = MarkerConfig::default();
        let table = find_all_markers(&matrix, &labels, None, &config, Capabilities::none(), 0.01)
            .unwrap();
        assert!(table.rows().iter().all(|r| r.p_val().unwrap() < 0.01));
        let alpha = table.rows().iter().filter(|r| r.cluster.as_deref() == Some("alpha")).count();
        assert!(alpha >= 50);
        assert!(table.rows().iter().any(|r| r.cluster.as_deref() == Some("beta")));
    }
}

#[cfg(test)]
mod label_transfer {
    use super::*;

    const GENES: [&str; 6] = ["CD3E", "CD3D", "IL7R", "MS4A1", "CD79A", "CD19"];

    fn gene_names() -> Vec<String> {
        GENES.iter().map(|g| g.to_string()).collect()
    }

    /// 12 T cells then 12 B cells, log-normalized.
    fn reference() -> Reference {
        let rows: Vec<Vec<f64>> = (0..GENES.len())
            .map(|g| {
                (0..24)
                    .map(|c| {
                        let t_gene = g < 3;
                        let t_cell = c < 12;
                        if t_gene == t_cell { (2.0 + (c % 4) as f64).ln() } else { 0.0 }
                    })
                    .collect()
            })
            .collect();
        let data = FeatureMatrix::from_dense_rows(&rows, gene_names(), names("rna", 24)).unwrap();
        let mut variable_features: Vec<String> = gene_names();
        variable_features.push("NOT_MEASURED".into());
        Reference {
            data,
            clusters: (0..24).map(|c| if c < 12 { "T".into() } else { "B".into() }).collect(),
            variable_features,
        }
    }

    /// Per-gene accessibility counts: 8 T-like cells then 8 B-like cells.
    fn gene_counts() -> Vec<Vec<f64>> {
        (0..GENES.len())
            .map(|g| {
                (0..16)
                    .map(|c| if (g < 3) == (c < 8) { 3.0 + (c % 3) as f64 } else { 0.0 })
                    .collect()
            })
            .collect()
    }

    fn region_id(g: usize) -> String {
        let start = 10_000 * (g + 1) as u64;
        format!("chr1:{}-{}", start + 100, start + 300)
    }

    fn query() -> Query {
        let region_ids = (0..GENES.len()).map(region_id).collect();
        let regions =
            FeatureMatrix::from_dense_rows(&gene_counts(), region_ids, names("atac", 16)).unwrap();
        Query {
            regions,
            clusters: (0..16).map(|c| if c < 8 { "0".into() } else { "1".into() }).collect(),
        }
    }

    fn config(dir: &std::path::Path) -> TransferConfig {
        TransferConfig {
            project: "pbmc".into(),
            output_dir: dir.to_path_buf(),
            dims: 1,
            k_anchor: 5,
            k_score: 10,
            k_weight: 10,
            umap_neighbors: 5,
            umap_epochs: 30,
            ..TransferConfig::default()
        }
    }

    fn check_predictions(outcome: &single_markers::TransferOutcome) {
        let predictions: Vec<_> = outcome.predictions().collect();
        assert_eq!(predictions.len(), 16);
        for (cell, id, score) in predictions {
            let q: usize = cell.trim_start_matches("atac").parse().unwrap();
            assert_eq!(id, if q < 8 { "T" } else { "B" }, "cell {}", cell);
            assert!((0.0..=1.0 + 1e-12).contains(&score));
        }
    }

    #[test]
    fn precomputed_activity_transfers_labels() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let mut cells = names("atac", 16);
        cells.push("unrelated".into());
        let mut counts = gene_counts();
        counts.iter_mut().for_each(|row| row.push(1.0));
        let activity = FeatureMatrix::from_dense_rows(&counts, gene_names(), cells).unwrap();
        let inputs = TransferInputs {
            reference: reference(),
            query: query(),
            activity: ActivitySource::Precomputed(activity),
        };

        let outcome = run_label_transfer(&inputs, &config(dir.path())).unwrap();
        check_predictions(&outcome);
        assert_eq!(outcome.labels, vec!["B".to_string(), "T".to_string()]);
        assert_eq!(outcome.prediction_scores.dim(), (16, 2));
        assert!(!outcome.anchors.is_empty());
        assert_eq!(outcome.imputed.n_features(), GENES.len());
        assert_eq!(outcome.cells.len(), 40);

        for file in [
            "pbmc_source.png",
            "pbmc_RNAonly.png",
            "pbmc_ATAConly.png",
            "pbmc_annotated.png",
            "pbmc_metadata.tsv",
        ] {
            assert!(dir.path().join(file).exists(), "{} missing", file);
        }
        let metadata = std::fs::read_to_string(dir.path().join("pbmc_metadata.tsv")).unwrap();
        assert_eq!(metadata.lines().count(), 41);

        let again = run_label_transfer(&inputs, &config(dir.path())).unwrap();
        assert_eq!(outcome.cells, again.cells);
    }

    #[test]
    fn annotation_activity_transfers_labels() {
        let dir = tempfile::tempdir().unwrap();
        let annotation: Vec<GeneAnnotation> = GENES
            .iter()
            .enumerate()
            .map(|(g, name)| {
                let start = 10_000 * (g + 1) as u64;
                GeneAnnotation {
                    gene: name.to_string(),
                    chrom: "chr1".into(),
                    start: start + 1500,
                    end: start + 2500,
                    strand: Strand::Forward,
                }
            })
            .collect();
        let inputs = TransferInputs {
            reference: reference(),
            query: query(),
            activity: ActivitySource::Annotation(annotation),
        };
        let outcome = run_label_transfer(&inputs, &config(dir.path())).unwrap();
        check_predictions(&outcome);
    }

    #[test]
    fn no_shared_cells_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("transfer");
        let activity = FeatureMatrix::from_dense_rows(
            &gene_counts().into_iter().map(|r| r[..2].to_vec()).collect::<Vec<_>>(),
            gene_names(),
            vec!["elsewhere0".into(), "elsewhere1".into()],
        )
        .unwrap();
        let inputs = TransferInputs {
            reference: reference(),
            query: query(),
            activity: ActivitySource::Precomputed(activity),
        };
        let err = run_label_transfer(&inputs, &config(&out)).unwrap_err();
        assert_eq!(err.downcast_ref::<MarkerError>(), Some(&MarkerError::NoSharedCells));
        assert!(!out.exists());
    }

    #[test]
    fn disjoint_features_have_no_anchors_to_find() {
        let dir = tempfile::tempdir().unwrap();
        let mut reference = reference();
        reference.variable_features = vec!["NOT_MEASURED".into()];
        let inputs = TransferInputs {
            reference,
            query: query(),
            activity: ActivitySource::Precomputed(
                FeatureMatrix::from_dense_rows(&gene_counts(), gene_names(), names("atac", 16))
                    .unwrap(),
            ),
        };
        let err = run_label_transfer(&inputs, &config(dir.path())).unwrap_err();
        assert_eq!(err.downcast_ref::<MarkerError>(), Some(&MarkerError::NoSharedFeatures));
    }
}

#[cfg(test)]
mod methods_end_to_end {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use single_markers::{Covariates, MarkerTable};
    use single_markers::testing::inference::discrete::chi_square_upper_tail;
    use single_markers::testing::inference::parametric::bimodal_lrt;

    const UP: [f64; 24] = [
        4.0, 6.0, 5.0, 0.0, 7.0, 5.0, 2.0, 6.0, 4.0, 5.0, 3.0, 6.0, // group 1
        2.0, 1.0, 0.0, 3.0, 1.0, 0.0, 0.0, 1.0, 4.0, 2.0, 1.0, 0.0, // group 2
    ];

    /// Counts for 12 + 12 cells with one covariate balanced across groups.
    fn counts_with_covariates() -> (FeatureMatrix<f64>, CellGroups, Covariates) {
        let up = UP.to_vec();
        let mut down = UP[12..].to_vec();
        down.extend_from_slice(&UP[..12]);
        let noise: Vec<f64> = (0..24).map(|c| ((c * 5) % 7) as f64).collect();
        let cells = names("c", 24);
        let matrix = FeatureMatrix::from_dense_rows(
            &[up, down, noise],
            vec!["up".into(), "down".into(), "noise".into()],
            cells.clone(),
        )
        .unwrap();
        let groups =
            CellGroups::from_indices((0..12).collect(), (12..24).collect(), 24).unwrap();
        let depth = Array2::from_shape_fn((24, 1), |(c, _)| 1.0 + (c % 4) as f64 * 0.5);
        let covariates = Covariates::new(cells, vec!["depth".into()], depth).unwrap();
        (matrix, groups, covariates)
    }

    fn assert_sorted_by_p(table: &MarkerTable) {
        let p: Vec<f64> = table.rows().iter().map(|r| r.p_val().unwrap()).collect();
        assert!(p.windows(2).all(|w| w[0] <= w[1]), "{:?}", p);
    }

    fn run_with_covariates(method: TestMethod, layer: DataLayer) -> MarkerTable {
        let (matrix, groups, covariates) = counts_with_covariates();
        let config = MarkerConfig {
            layer,
            ..sequential(method)
        };
        let table = find_markers(
            &matrix,
            &groups,
            Some(&covariates),
            &config,
            Capabilities::detect(),
        )
        .unwrap();
        assert!(!table.diagnostics().has_warning_containing("ignoring them"));
        assert_sorted_by_p(&table);
        table
    }

    #[test]
    fn bimod_p_is_the_three_df_chi_square_tail() {
        let x = [2.0, 2.5, 0.0, 1.8, 2.2, 0.0, 2.4, 2.1];
        let y = [0.0, 0.5, 0.0, 0.0, 0.7, 0.0, 0.0, 0.4];
        let row: Vec<f64> = x.iter().chain(y.iter()).copied().collect();
        let matrix =
            FeatureMatrix::from_dense_rows(&[row], vec!["g".into()], names("c", 16)).unwrap();
        let groups = CellGroups::from_indices((0..8).collect(), (8..16).collect(), 16).unwrap();

        let config = sequential(TestMethod::Bimod);
        let table = find_markers(&matrix, &groups, None, &config, Capabilities::none()).unwrap();
        let expected = bimodal_lrt(&x, &y);
        assert_eq!(expected.degrees_of_freedom, Some(3.0));
        assert_eq!(expected.p_value, chi_square_upper_tail(expected.statistic, 3.0));
        let p = table.get("g").unwrap().p_val().unwrap();
        assert_relative_eq!(p, expected.p_value, max_relative = 1e-10);
        assert!(p < 0.05);
    }

    #[test]
    fn logistic_regression_with_covariates() {
        let table = run_with_covariates(TestMethod::LogisticRegression, DataLayer::Data);
        assert!(table.get("up").unwrap().p_val().unwrap() < 0.05);
        assert!(table.get("down").unwrap().p_val().unwrap() < 0.05);
    }

    #[test]
    fn negative_binomial_with_covariates() {
        let table = run_with_covariates(TestMethod::NegativeBinomial, DataLayer::Counts);
        let up = table.get("up").unwrap();
        assert!(up.p_val().unwrap() < 0.01);
        assert!(up.avg_log_fc > 0.0);
        assert!(table.get("down").unwrap().avg_log_fc < 0.0);
    }

    #[cfg(feature = "hurdle")]
    #[test]
    fn hurdle_with_covariates() {
        let table = run_with_covariates(TestMethod::Hurdle, DataLayer::Data);
        assert!(table.get("up").unwrap().p_val().unwrap() < 0.05);
        assert!(table.rows().iter().all(|r| (0.0..=1.0).contains(&r.p_val().unwrap())));
    }

    #[test]
    fn only_positive_markers_are_kept() {
        let (matrix, groups, _) = counts_with_covariates();
        let config = MarkerConfig {
            only_pos: true,
            ..sequential(TestMethod::Wilcoxon)
        };
        let table = find_markers(&matrix, &groups, None, &config, Capabilities::none()).unwrap();
        assert!(table.get("up").is_some());
        assert!(table.get("down").is_none());
        assert!(table.rows().iter().all(|r| r.avg_log_fc > 0.0));

        let config = sequential(TestMethod::Wilcoxon);
        let both = find_markers(&matrix, &groups, None, &config, Capabilities::none()).unwrap();
        assert!(both.get("down").is_some());
    }

    #[test]
    fn detection_difference_can_empty_the_feature_set() {
        let (matrix, groups, _) = counts_with_covariates();
        let config = MarkerConfig {
            min_diff_pct: Some(0.9),
            ..sequential(TestMethod::Wilcoxon)
        };
        let err = find_markers(&matrix, &groups, None, &config, Capabilities::none()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<MarkerError>(),
            Some(&MarkerError::EmptyFeatureSet("min_diff_pct".into()))
        );
        assert!(err.to_string().contains("min_diff_pct"));
    }

    #[test]
    fn tables_written_to_disk_keep_their_layout() {
        let dir = tempfile::tempdir().unwrap();
        let (matrix, groups, _) = counts_with_covariates();

        let config = MarkerConfig {
            fc_base: FoldChangeBase::Two,
            ..sequential(TestMethod::Wilcoxon)
        };
        let path = dir.path().join("log2.tsv");
        find_markers(&matrix, &groups, None, &config, Capabilities::none())
            .unwrap()
            .write_tsv(&path)
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("feature\tp_val\tavg_log2FC\tpct.1\tpct.2\tp_val_adj")
        );
        assert!(lines.all(|l| l.split('\t').count() == 6));

        let labels: Vec<&str> = (0..24).map(|c| if c < 12 { "a" } else { "b" }).collect();
        let config = sequential(TestMethod::Roc);
        let roc = find_all_markers(&matrix, &labels, None, &config, Capabilities::none(), 0.01)
            .unwrap();
        let path = dir.path().join("roc.tsv");
        roc.write_tsv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("feature\tAUC\tpower\tavg_logFC\tpct.1\tpct.2\tcluster")
        );
        let clusters: Vec<&str> = lines.map(|l| l.rsplit('\t').next().unwrap()).collect();
        assert_eq!(clusters.len(), roc.len());
        assert!(clusters.contains(&"a") && clusters.contains(&"b"));
    }
}
