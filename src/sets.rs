// ID-universe set algebra and the curation stage that uses it to pick the entities that
// have a sequence, a text and at least one ligand.

use anyhow::{Error, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use crate::config::{Config, CURATE_SUMMARY_FILE, SELECTED_IDS_FILE};
use crate::io::{format_number_with_commas, sorted_ids, write_id_list, write_summary};
use crate::keys::{collect_keys, ScanStats};

pub type IdSet = HashSet<String>;

/// Intersection of all `sets`. Iterates the smallest set and probes the rest.
/// No sets, or any empty set, gives an empty result.
pub fn intersection(sets: &[&IdSet]) -> IdSet {
    let Some(smallest) = sets.iter().min_by_key(|set| set.len()) else {
        return IdSet::new();
    };
    smallest
        .iter()
        .filter(|id| sets.iter().all(|set| set.contains(*id)))
        .cloned()
        .collect()
}

pub fn difference(a: &IdSet, b: &IdSet) -> IdSet {
    a.difference(b).cloned().collect()
}

pub fn union(sets: &[&IdSet]) -> IdSet {
    let mut out = IdSet::with_capacity(sets.iter().map(|set| set.len()).max().unwrap_or(0));
    for set in sets {
        out.extend(set.iter().cloned());
    }
    out
}

/*=================================================================
=                         COVERAGE REPORT                         =
=================================================================*/

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageReport {
    pub ligand_ids: usize,
    pub sequence_ids: usize,
    pub text_ids: usize,
    pub fallback_sequence_ids: Option<usize>,

    pub ligand_sequence_text: usize,
    pub sequence_text: usize,
    pub ligand_text: usize,
    pub sequence_not_text: usize,
    pub ligand_not_text: usize,
    pub ligand_text_not_sequence: usize,
    pub ligand_fallback_text: Option<usize>,

    pub selected: usize,
}

/// Computes the eligible universe, `(ligand ∩ seq ∩ text) ∪ (ligand ∩ fallback ∩ text)`,
/// together with the asymmetric-coverage counts. Coverage gaps are diagnostics, not errors.
pub fn select_universe(
    ligand: &IdSet,
    sequence: &IdSet,
    text: &IdSet,
    fallback_sequence: Option<&IdSet>,
) -> (IdSet, CoverageReport) {
    let ligand_sequence_text = intersection(&[ligand, sequence, text]);
    let ligand_text = intersection(&[ligand, text]);

    let mut report = CoverageReport {
        ligand_ids: ligand.len(),
        sequence_ids: sequence.len(),
        text_ids: text.len(),
        fallback_sequence_ids: fallback_sequence.map(|set| set.len()),
        ligand_sequence_text: ligand_sequence_text.len(),
        sequence_text: intersection(&[sequence, text]).len(),
        ligand_text: ligand_text.len(),
        sequence_not_text: difference(sequence, text).len(),
        ligand_not_text: difference(ligand, text).len(),
        ligand_text_not_sequence: difference(&ligand_text, sequence).len(),
        ligand_fallback_text: None,
        selected: 0,
    };

    let selected = match fallback_sequence {
        Some(fallback) => {
            let with_fallback = intersection(&[&ligand_text, fallback]);
            report.ligand_fallback_text = Some(with_fallback.len());
            union(&[&ligand_sequence_text, &with_fallback])
        }
        None => ligand_sequence_text,
    };
    report.selected = selected.len();

    (selected, report)
}

fn display_coverage(report: &CoverageReport) {
    let n = format_number_with_commas;
    println!("=== ID COVERAGE ===");
    println!("Protein to ligand IDs:                 {:>15}", n(report.ligand_ids));
    println!("Protein to sequence IDs:               {:>15}", n(report.sequence_ids));
    println!("Protein to text IDs:                   {:>15}", n(report.text_ids));
    if let Some(fallback) = report.fallback_sequence_ids {
        println!("Fallback sequence IDs:                 {:>15}", n(fallback));
    }
    println!("Ligand, sequence and text:             {:>15}", n(report.ligand_sequence_text));
    println!("Sequence and text:                     {:>15}", n(report.sequence_text));
    println!("Ligand and text:                       {:>15}", n(report.ligand_text));
    println!("Sequence without text:                 {:>15}", n(report.sequence_not_text));
    println!("Ligand without text:                   {:>15}", n(report.ligand_not_text));
    println!("Ligand and text without sequence:      {:>15}", n(report.ligand_text_not_sequence));
    if let Some(with_fallback) = report.ligand_fallback_text {
        println!("Ligand and text with fallback seq:     {:>15}", n(with_fallback));
    }
    println!("Selected entities:                     {:>15}", n(report.selected));
}

/*=================================================================
=                          CURATE STAGE                           =
=================================================================*/

#[derive(Debug, Clone, Serialize)]
pub struct CurateSummary {
    pub coverage: CoverageReport,
    pub scans: Vec<(PathBuf, ScanStats)>,
}

pub fn execute_curate(config: &Config) -> Result<CurateSummary, Error> {
    println!("Starting entity curation...");
    let start_main = Instant::now();

    let mut corpora = vec![
        config.protein2ligand_path.clone(),
        config.sequence_path.clone(),
        config.text_path.clone(),
    ];
    if let Some(fallback) = &config.fallback_sequence_path {
        corpora.push(fallback.clone());
    }

    // Each corpus is scanned by its own reader, so the key sets can be built in parallel
    let scanned: Vec<(IdSet, ScanStats)> = corpora
        .par_iter()
        .map(|path| -> Result<(IdSet, ScanStats), Error> {
            let scan_start = Instant::now();
            let result = collect_keys(path)?;
            println!(
                "  → {} keys from {:?} in {:.2}s",
                format_number_with_commas(result.0.len()),
                path,
                scan_start.elapsed().as_secs_f64()
            );
            Ok(result)
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let (sets, stats): (Vec<IdSet>, Vec<ScanStats>) = scanned.into_iter().unzip();
    let (selected, coverage) = select_universe(&sets[0], &sets[1], &sets[2], sets.get(3));
    display_coverage(&coverage);

    let selected_path = config.work_path(SELECTED_IDS_FILE);
    write_id_list(&selected_path, &sorted_ids(&selected))?;
    println!("IDs have been saved to {:?}", selected_path);

    let summary = CurateSummary {
        coverage,
        scans: corpora.into_iter().zip(stats).collect(),
    };
    write_summary(&config.work_path(CURATE_SUMMARY_FILE), &summary)?;

    println!("Curation completed in {:.2}s", start_main.elapsed().as_secs_f64());
    Ok(summary)
}
