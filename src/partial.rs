// Partial loading of a keyed corpus: one streaming pass that keeps only the entries
// whose key is in a needed-ID set. Resident memory follows the needed set, not the corpus.

use anyhow::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::io::format_number_with_commas;
use crate::keys::{scan_corpus, EntrySink, ScanStats};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub path: PathBuf,
    pub needed: usize,
    pub retained: usize,
    pub duplicates: usize,
    pub malformed_values: usize,
    pub scan: ScanStats,
}

struct NeededSink<'a, T> {
    needed: &'a HashSet<String>,
    loaded: HashMap<String, T>,
    duplicates: usize,
    malformed_values: usize,
}

impl<'a, T: DeserializeOwned> EntrySink for NeededSink<'a, T> {
    fn wants(&mut self, key: &str) -> bool {
        if !self.needed.contains(key) {
            return false;
        }
        if self.loaded.contains_key(key) {
            // First value wins
            self.duplicates += 1;
            return false;
        }
        true
    }

    fn accept(&mut self, key: String, value: Value) {
        match serde_json::from_value::<T>(value) {
            Ok(parsed) => {
                self.loaded.insert(key, parsed);
            }
            Err(_) => self.malformed_values += 1,
        }
    }
}

/// Loads the entries of `path` whose key is in `needed`. Keys absent from the corpus are
/// absent from the result; values that do not decode as `T` are skipped and counted.
pub fn partial_load<T: DeserializeOwned>(
    path: &Path,
    needed: &HashSet<String>,
) -> Result<(HashMap<String, T>, LoadStats), Error> {
    let start = Instant::now();
    let mut sink = NeededSink {
        needed,
        loaded: HashMap::new(),
        duplicates: 0,
        malformed_values: 0,
    };
    let scan = scan_corpus(path, &mut sink)?;

    let stats = LoadStats {
        path: path.to_path_buf(),
        needed: needed.len(),
        retained: sink.loaded.len(),
        duplicates: sink.duplicates,
        malformed_values: sink.malformed_values,
        scan,
    };
    println!(
        "  → Loaded {} of {} needed entries from {:?} ({} scanned) in {:.2}s",
        format_number_with_commas(stats.retained),
        format_number_with_commas(stats.needed),
        path,
        format_number_with_commas(stats.scan.entries),
        start.elapsed().as_secs_f64()
    );
    if stats.malformed_values > 0 {
        println!("    Skipped {} entries with malformed values", stats.malformed_values);
    }

    Ok((sink.loaded, stats))
}

/// Loads from each corpus in turn, asking later corpora only for the keys still missing.
/// The remaining set is rebuilt between passes; nothing is removed while a scan is running.
pub fn partial_load_chain<T: DeserializeOwned>(
    paths: &[PathBuf],
    needed: &HashSet<String>,
) -> Result<(HashMap<String, T>, Vec<LoadStats>), Error> {
    let mut loaded: HashMap<String, T> = HashMap::new();
    let mut all_stats = Vec::new();

    for path in paths {
        let remaining: HashSet<String> = needed
            .iter()
            .filter(|id| !loaded.contains_key(*id))
            .cloned()
            .collect();
        if remaining.is_empty() {
            break;
        }
        let (found, stats) = partial_load::<T>(path, &remaining)?;
        loaded.extend(found);
        all_stats.push(stats);
    }

    Ok((loaded, all_stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ids(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_result_is_needed_intersect_corpus() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uniprot2seq.json");
        std::fs::write(&path, r#"{"P1": "MKV", "P2": "MAA", "P3": "MGG", "P4": "MTT"}"#).unwrap();

        let needed = ids(&["P2", "P4", "P9"]);
        let (loaded, stats) = partial_load::<String>(&path, &needed).unwrap();

        let keys: HashSet<String> = loaded.keys().cloned().collect();
        assert!(keys.is_subset(&needed));
        assert_eq!(keys, ids(&["P2", "P4"]));
        assert_eq!(loaded["P4"], "MTT");
        assert_eq!(stats.retained, 2);
        assert_eq!(stats.scan.entries, 4);
    }

    #[test]
    fn test_wrong_value_shape_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("protein2ligand_id.json");
        std::fs::write(&path, r#"{"P1": ["L1.sdf", "L2.sdf"], "P2": "not a list", "P3": [7]}"#).unwrap();

        let (loaded, stats) = partial_load::<Vec<String>>(&path, &ids(&["P1", "P2", "P3"])).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["P1"], vec!["L1.sdf", "L2.sdf"]);
        assert_eq!(stats.malformed_values, 2);
    }

    #[test]
    fn test_duplicate_keys_keep_first_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uniref50.jsonl");
        std::fs::write(&path, "{\"P1\": \"FIRST\"}\n{\"P1\": \"SECOND\"}\n").unwrap();

        let (loaded, stats) = partial_load::<String>(&path, &ids(&["P1"])).unwrap();
        assert_eq!(loaded["P1"], "FIRST");
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn test_chain_only_asks_fallback_for_missing() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("uniprot2seq.json");
        let fallback = dir.path().join("uniref50.jsonl");
        std::fs::write(&primary, r#"{"P1": "PRIMARY", "P2": "PRIMARY"}"#).unwrap();
        std::fs::write(&fallback, "{\"P2\": \"FALLBACK\"}\n{\"P3\": \"FALLBACK\"}\n").unwrap();

        let (loaded, stats) =
            partial_load_chain::<String>(&[primary, fallback], &ids(&["P1", "P2", "P3", "P4"])).unwrap();
        assert_eq!(loaded["P2"], "PRIMARY");
        assert_eq!(loaded["P3"], "FALLBACK");
        assert!(!loaded.contains_key("P4"));
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].needed, 2);
    }

    #[test]
    fn test_empty_needed_set() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uniprot2text.json");
        std::fs::write(&path, r#"{"P1": "kinase"}"#).unwrap();
        let (loaded, _) = partial_load::<String>(&path, &HashSet::new()).unwrap();
        assert!(loaded.is_empty());
    }
}
