// Ligand incidence per entity universe and the frequency-stratified ligand split.
//
// Held-out ligands are drawn from the ligands that the val/test proteins bind, bucketed by how
// many proteins reference them. A ligand drawn for both val and test is dropped from both, so
// the two held-out sets never share a ligand.

use anyhow::{Error, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use crate::clusters::{load_split_entities, read_cluster_splits, IngestStats};
use crate::config::{
    validate_buckets, Config, FrequencySource, SamplingPolicy, SizeBucket, Split, SELECTED_IDS_FILE,
    SPLIT_LIGANDS_SUMMARY_FILE, TEST_LIGANDS_FILE, VAL_LIGANDS_FILE,
};
use crate::io::{format_number_with_commas, read_id_set, sorted_ids, write_id_list, write_summary};
use crate::keys::{scan_corpus, EntrySink, ScanStats};
use crate::partial::{partial_load, LoadStats};

/// Strips `suffix` from the end of `label` until it no longer ends with it.
pub fn canonicalize_label<'a>(label: &'a str, suffix: &str) -> &'a str {
    if suffix.is_empty() {
        return label;
    }
    let mut label = label;
    while let Some(stripped) = label.strip_suffix(suffix) {
        label = stripped;
    }
    label
}

/// Canonical labels of one entity, in list order, with duplicates kept.
fn canonical_labels(labels: &[String], suffix: &str) -> Vec<String> {
    labels
        .iter()
        .map(|label| canonicalize_label(label, suffix).to_string())
        .collect()
}

/*=================================================================
=                         LIGAND INCIDENCE                        =
=================================================================*/

/// Label view of one entity universe. A label's count is the number of distinct entities in
/// the universe that reference it.
#[derive(Debug, Clone, Default)]
pub struct LigandIncidence {
    entity_labels: HashMap<String, Vec<String>>,
    counts: HashMap<String, usize>,
    missing_entities: usize,
}

impl LigandIncidence {
    pub fn build(
        protein2ligand: &HashMap<String, Vec<String>>,
        universe: &HashSet<String>,
        suffix: &str,
    ) -> Self {
        let mut incidence = LigandIncidence::default();
        for entity_id in universe {
            let Some(labels) = protein2ligand.get(entity_id) else {
                incidence.missing_entities += 1;
                continue;
            };
            let labels = canonical_labels(labels, suffix);
            let distinct: HashSet<&String> = labels.iter().collect();
            for label in distinct {
                *incidence.counts.entry(label.clone()).or_insert(0) += 1;
            }
            incidence.entity_labels.insert(entity_id.clone(), labels);
        }
        incidence
    }

    pub fn count(&self, label: &str) -> usize {
        self.counts.get(label).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &HashMap<String, usize> {
        &self.counts
    }

    pub fn labels(&self) -> impl Iterator<Item = &String> {
        self.counts.keys()
    }

    pub fn labels_for(&self, entity_id: &str) -> Option<&[String]> {
        self.entity_labels.get(entity_id).map(|labels| labels.as_slice())
    }

    pub fn num_entities(&self) -> usize {
        self.entity_labels.len()
    }

    pub fn num_labels(&self) -> usize {
        self.counts.len()
    }

    /// Entities of the universe that have no entry in the protein -> ligand map.
    pub fn missing_entities(&self) -> usize {
        self.missing_entities
    }

    pub fn total_pairings(&self) -> usize {
        self.entity_labels.values().map(|labels| labels.len()).sum()
    }
}

struct FrequencySink<'a> {
    universe: &'a HashSet<String>,
    suffix: &'a str,
    counts: HashMap<String, usize>,
    seen: HashSet<String>,
    malformed_values: usize,
}

impl<'a> EntrySink for FrequencySink<'a> {
    fn wants(&mut self, key: &str) -> bool {
        self.universe.contains(key) && !self.seen.contains(key)
    }

    fn accept(&mut self, key: String, value: Value) {
        let labels = match serde_json::from_value::<Vec<String>>(value) {
            Ok(labels) => labels,
            Err(_) => {
                self.malformed_values += 1;
                return;
            }
        };
        let distinct: HashSet<&str> = labels
            .iter()
            .map(|label| canonicalize_label(label, self.suffix))
            .collect();
        for label in distinct {
            *self.counts.entry(label.to_string()).or_insert(0) += 1;
        }
        self.seen.insert(key);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FrequencyStats {
    pub entities_counted: usize,
    pub distinct_labels: usize,
    pub malformed_values: usize,
    pub scan: ScanStats,
}

/// Label frequency over `universe`, streamed from the protein -> ligand corpus. Only one
/// entity's label list is decoded at a time.
pub fn count_label_frequencies(
    path: &Path,
    universe: &HashSet<String>,
    suffix: &str,
) -> Result<(HashMap<String, usize>, FrequencyStats), Error> {
    let mut sink = FrequencySink {
        universe,
        suffix,
        counts: HashMap::new(),
        seen: HashSet::new(),
        malformed_values: 0,
    };
    let scan = scan_corpus(path, &mut sink)?;
    let stats = FrequencyStats {
        entities_counted: sink.seen.len(),
        distinct_labels: sink.counts.len(),
        malformed_values: sink.malformed_values,
        scan,
    };
    Ok((sink.counts, stats))
}

/*=================================================================
=                      LIGAND LEAKAGE SAMPLER                     =
=================================================================*/

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LigandSplit {
    /// Sorted.
    pub val: Vec<String>,
    pub test: Vec<String>,
    pub val_candidates: usize,
    pub test_candidates: usize,
    pub conflicts: usize,
    pub warnings: Vec<String>,
}

/// (label, frequency) sorted by label.
fn label_frequencies<'a>(
    view: &'a LigandIncidence,
    global: Option<&HashMap<String, usize>>,
) -> Vec<(&'a String, usize)> {
    let mut labels: Vec<(&String, usize)> = view
        .labels()
        .map(|label| {
            let frequency = match global {
                Some(global) => global.get(label).copied().unwrap_or(0),
                None => view.count(label),
            };
            (label, frequency)
        })
        .collect();
    labels.sort();
    labels
}

/// Picks candidates from `labels` (sorted by ID) bucket by bucket.
fn sample_candidates(
    labels: &[(&String, usize)],
    buckets: &[SizeBucket],
    policy: SamplingPolicy,
    rng: &mut ChaCha20Rng,
    warnings: &mut Vec<String>,
) -> HashSet<String> {
    let mut chosen = HashSet::new();
    for bucket in buckets {
        let mut matching: Vec<&String> = labels
            .iter()
            .filter(|(_, frequency)| bucket.contains(*frequency))
            .map(|(label, _)| *label)
            .collect();

        match policy {
            SamplingPolicy::TakeAll => chosen.extend(matching.into_iter().cloned()),
            SamplingPolicy::Quota => {
                if matching.len() < bucket.count {
                    let warning = format!(
                        "asked for {} ligands in range {}, but only {} available. Sampling all of them.",
                        bucket.count,
                        bucket,
                        matching.len()
                    );
                    println!("Warning: {}", warning);
                    warnings.push(warning);
                }
                let take = bucket.count.min(matching.len());
                let (picked, _) = matching.partial_shuffle(rng, take);
                chosen.extend(picked.iter().map(|label| (*label).clone()));
            }
        }
    }
    chosen
}

/// Draws held-out ligands for val and test independently, then removes any ligand drawn for
/// both. With `global` set, a ligand is bucketed by its global frequency instead of its count
/// inside the split. The generator is consumed val first, then test.
pub fn sample_ligand_split(
    val: &LigandIncidence,
    test: &LigandIncidence,
    global: Option<&HashMap<String, usize>>,
    buckets: &[SizeBucket],
    policy: SamplingPolicy,
    seed: u64,
) -> Result<LigandSplit, Error> {
    validate_buckets(buckets, "ligand_buckets")?;

    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut warnings = Vec::new();

    let val_candidates = sample_candidates(&label_frequencies(val, global), buckets, policy, &mut rng, &mut warnings);
    let test_candidates =
        sample_candidates(&label_frequencies(test, global), buckets, policy, &mut rng, &mut warnings);

    let conflicts: HashSet<&String> = val_candidates.intersection(&test_candidates).collect();
    let final_val = sorted_ids(val_candidates.iter().filter(|label| !conflicts.contains(label)));
    let final_test = sorted_ids(test_candidates.iter().filter(|label| !conflicts.contains(label)));

    Ok(LigandSplit {
        val_candidates: val_candidates.len(),
        test_candidates: test_candidates.len(),
        conflicts: conflicts.len(),
        val: final_val,
        test: final_test,
        warnings,
    })
}

/// Ligands visible during training: every known ligand minus both held-out sets.
pub fn train_visible_labels<'a, I>(all_labels: I, val: &HashSet<String>, test: &HashSet<String>) -> HashSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    all_labels
        .into_iter()
        .filter(|label| !val.contains(*label) && !test.contains(*label))
        .cloned()
        .collect()
}

/*=================================================================
=                        SPLIT LIGANDS STAGE                      =
=================================================================*/

#[derive(Debug, Clone, Serialize)]
pub struct ViewStats {
    pub entities: usize,
    pub entities_without_labels: usize,
    pub distinct_labels: usize,
    pub pairings: usize,
}

impl ViewStats {
    fn of(view: &LigandIncidence) -> Self {
        ViewStats {
            entities: view.num_entities(),
            entities_without_labels: view.missing_entities(),
            distinct_labels: view.num_labels(),
            pairings: view.total_pairings(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitLigandsSummary {
    pub ingest: IngestStats,
    pub load: LoadStats,
    pub frequency_source: FrequencySource,
    pub sampling: SamplingPolicy,
    pub global_frequency: Option<FrequencyStats>,
    pub val_view: ViewStats,
    pub test_view: ViewStats,
    pub split: LigandSplit,
}

fn display_top_labels(counts: &HashMap<String, usize>) {
    let mut sorted: Vec<(&String, &usize)> = counts.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    println!("Most referenced ligands:");
    for (label, count) in sorted.iter().take(10) {
        println!("  {} referenced by {} proteins", label, format_number_with_commas(**count));
    }
}

pub fn execute_split_ligands(config: &Config) -> Result<SplitLigandsSummary, Error> {
    println!("Starting ligand split...");
    let start_main = Instant::now();

    let eval_clusters: HashMap<String, Split> = read_cluster_splits(config)?
        .into_iter()
        .filter(|(_, split)| *split != Split::Train)
        .collect();
    let (entities, ingest) = load_split_entities(&config.cluster_mapping_path, &eval_clusters)?;
    let no_entities = HashSet::new();
    let val_entities = entities.get(&Split::Val).unwrap_or(&no_entities);
    let test_entities = entities.get(&Split::Test).unwrap_or(&no_entities);
    println!(
        "val has {} proteins, test has {} proteins.",
        format_number_with_commas(val_entities.len()),
        format_number_with_commas(test_entities.len())
    );

    let needed: HashSet<String> = val_entities.union(test_entities).cloned().collect();
    let (protein2ligand, load) = partial_load::<Vec<String>>(&config.protein2ligand_path, &needed)?;

    let val_view = LigandIncidence::build(&protein2ligand, val_entities, &config.label_suffix);
    let test_view = LigandIncidence::build(&protein2ligand, test_entities, &config.label_suffix);
    drop(protein2ligand);
    println!(
        "val proteins reference {} ligands, test proteins reference {} ligands.",
        format_number_with_commas(val_view.num_labels()),
        format_number_with_commas(test_view.num_labels())
    );

    let (global, global_frequency) = match config.ligand_frequency {
        FrequencySource::Global => {
            let selected = read_id_set(&config.work_path(SELECTED_IDS_FILE))?;
            let (counts, stats) =
                count_label_frequencies(&config.protein2ligand_path, &selected, &config.label_suffix)?;
            println!(
                "Counted {} ligands over {} selected proteins.",
                format_number_with_commas(counts.len()),
                format_number_with_commas(stats.entities_counted)
            );
            if config.debug {
                display_top_labels(&counts);
            }
            (Some(counts), Some(stats))
        }
        FrequencySource::Split => (None, None),
    };

    let split = sample_ligand_split(
        &val_view,
        &test_view,
        global.as_ref(),
        &config.ligand_buckets,
        config.ligand_sampling,
        config.seed,
    )?;
    if split.conflicts > 0 {
        println!(
            "Removed {} ligands drawn for both val and test.",
            format_number_with_commas(split.conflicts)
        );
    }

    write_id_list(&config.work_path(VAL_LIGANDS_FILE), &split.val)?;
    println!("Saved {} ligands to {}", split.val.len(), VAL_LIGANDS_FILE);
    write_id_list(&config.work_path(TEST_LIGANDS_FILE), &split.test)?;
    println!("Saved {} ligands to {}", split.test.len(), TEST_LIGANDS_FILE);

    let summary = SplitLigandsSummary {
        ingest,
        load,
        frequency_source: config.ligand_frequency,
        sampling: config.ligand_sampling,
        global_frequency,
        val_view: ViewStats::of(&val_view),
        test_view: ViewStats::of(&test_view),
        split,
    };
    write_summary(&config.work_path(SPLIT_LIGANDS_SUMMARY_FILE), &summary)?;

    println!("Ligand split completed in {:.2}s", start_main.elapsed().as_secs_f64());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ids(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn p2l(json: &str) -> HashMap<String, Vec<String>> {
        serde_json::from_str(json).unwrap()
    }

    fn all_buckets() -> Vec<SizeBucket> {
        vec![SizeBucket::new(1, None, 100)]
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        assert_eq!(canonicalize_label("L1.sdf", ".sdf"), "L1");
        assert_eq!(canonicalize_label("L1", ".sdf"), "L1");
        assert_eq!(canonicalize_label("L1.sdf.sdf", ".sdf"), "L1");
        assert_eq!(canonicalize_label("sdf", ".sdf"), "sdf");
        for raw in ["X.sdf", "X.sdf.sdf", "X", "X.mol"] {
            let once = canonicalize_label(raw, ".sdf");
            assert_eq!(canonicalize_label(once, ".sdf"), once);
        }
        assert_eq!(canonicalize_label("X.sdf", ""), "X.sdf");
    }

    #[test]
    fn test_incidence_counts_distinct_entities() {
        let map = p2l(r#"{"P1": ["L1.sdf", "L2.sdf"], "P2": ["L1.sdf", "L1"], "P3": ["L3.sdf"]}"#);
        let view = LigandIncidence::build(&map, &ids(&["P1", "P2", "P9"]), ".sdf");

        assert_eq!(view.count("L1"), 2);
        assert_eq!(view.count("L2"), 1);
        assert_eq!(view.count("L3"), 0);
        assert_eq!(view.num_labels(), 2);
        assert_eq!(view.missing_entities(), 1);
        assert_eq!(view.labels_for("P2").unwrap(), &["L1".to_string(), "L1".to_string()]);
        assert_eq!(view.total_pairings(), 4);
    }

    #[test]
    fn test_single_entity_count() {
        let map = p2l(r#"{"P1": ["L1.sdf", "L2.sdf"]}"#);
        let view = LigandIncidence::build(&map, &ids(&["P1"]), ".sdf");
        assert_eq!(view.count("L1"), 1);
    }

    #[test]
    fn test_total_overlap_leaves_both_empty() {
        let map = p2l(r#"{"P1": ["L1.sdf", "L2.sdf"], "P2": ["L1.sdf", "L2.sdf"]}"#);
        let val = LigandIncidence::build(&map, &ids(&["P1"]), ".sdf");
        let test = LigandIncidence::build(&map, &ids(&["P2"]), ".sdf");

        let split = sample_ligand_split(&val, &test, None, &all_buckets(), SamplingPolicy::TakeAll, 42).unwrap();
        assert!(split.val.is_empty());
        assert!(split.test.is_empty());
        assert_eq!(split.conflicts, 2);
    }

    #[test]
    fn test_conflicts_removed_from_both_sides() {
        let map = p2l(r#"{"P1": ["L1", "L2", "L3"], "P2": ["L3", "L4"]}"#);
        let val = LigandIncidence::build(&map, &ids(&["P1"]), ".sdf");
        let test = LigandIncidence::build(&map, &ids(&["P2"]), ".sdf");

        let split = sample_ligand_split(&val, &test, None, &all_buckets(), SamplingPolicy::TakeAll, 42).unwrap();
        assert_eq!(split.val, vec!["L1", "L2"]);
        assert_eq!(split.test, vec!["L4"]);
        assert_eq!(split.val_candidates, 3);
        assert_eq!(split.conflicts, 1);
    }

    #[test]
    fn test_global_frequency_decides_bucket() {
        let map = p2l(r#"{"P1": ["RARE", "COMMON"]}"#);
        let val = LigandIncidence::build(&map, &ids(&["P1"]), ".sdf");
        let test = LigandIncidence::default();
        let global: HashMap<String, usize> =
            HashMap::from([("RARE".to_string(), 1), ("COMMON".to_string(), 500)]);
        let buckets = vec![SizeBucket::new(1, Some(10), 0)];

        let split = sample_ligand_split(&val, &test, Some(&global), &buckets, SamplingPolicy::TakeAll, 1).unwrap();
        assert_eq!(split.val, vec!["RARE"]);

        // Inside the split both have count 1
        let split = sample_ligand_split(&val, &test, None, &buckets, SamplingPolicy::TakeAll, 1).unwrap();
        assert_eq!(split.val, vec!["COMMON", "RARE"]);
    }

    #[test]
    fn test_quota_is_deterministic_and_warns() {
        let mut map = p2l(r#"{"P2": ["T1"]}"#);
        map.insert("P1".to_string(), (0..50).map(|i| format!("L{:02}", i)).collect());
        let val = LigandIncidence::build(&map, &ids(&["P1"]), ".sdf");
        let test = LigandIncidence::build(&map, &ids(&["P2"]), ".sdf");
        let buckets = vec![SizeBucket::new(1, None, 5)];

        let first = sample_ligand_split(&val, &test, None, &buckets, SamplingPolicy::Quota, 42).unwrap();
        let second = sample_ligand_split(&val, &test, None, &buckets, SamplingPolicy::Quota, 42).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.val.len(), 5);
        assert_eq!(first.test, vec!["T1"]);
        assert_eq!(first.warnings.len(), 1);

        let mut sorted = first.val.clone();
        sorted.sort();
        assert_eq!(sorted, first.val);
    }

    #[test]
    fn test_train_visible_excludes_held_out() {
        let all = ids(&["L1", "L2", "L3", "L4"]);
        let visible = train_visible_labels(&all, &ids(&["L1"]), &ids(&["L4"]));
        assert_eq!(visible, ids(&["L2", "L3"]));
    }

    #[test]
    fn test_count_label_frequencies_streams_universe() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("protein2ligand_id.json");
        std::fs::write(
            &path,
            r#"{"P1": ["L1.sdf", "L2.sdf", "L1.sdf"], "P2": ["L1.sdf"], "P3": ["L2.sdf"], "P4": "bad"}"#,
        )
        .unwrap();

        let (counts, stats) = count_label_frequencies(&path, &ids(&["P1", "P2", "P4"]), ".sdf").unwrap();
        assert_eq!(counts["L1"], 2);
        assert_eq!(counts["L2"], 1);
        assert_eq!(stats.entities_counted, 2);
        assert_eq!(stats.malformed_values, 1);
    }
}
