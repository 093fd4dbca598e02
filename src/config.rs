use anyhow::{bail, Context, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use mj_io::read_pathbuf_to_mem;

/*=================================================================
=                           FILE NAMES                            =
=================================================================*/

pub const SELECTED_IDS_FILE: &str = "selected_entity_ids.txt";
pub const TRAIN_CLUSTERS_FILE: &str = "train_clusters.txt";
pub const VAL_CLUSTERS_FILE: &str = "val_clusters.txt";
pub const TEST_CLUSTERS_FILE: &str = "test_clusters.txt";
pub const VAL_LIGANDS_FILE: &str = "ligands_val.txt";
pub const TEST_LIGANDS_FILE: &str = "ligands_test.txt";
pub const FASTA_FILE: &str = "output_sequences.fasta";

pub const CURATE_SUMMARY_FILE: &str = "curate_summary.json";
pub const SPLIT_CLUSTERS_SUMMARY_FILE: &str = "split_clusters_summary.json";
pub const SPLIT_LIGANDS_SUMMARY_FILE: &str = "split_ligands_summary.json";
pub const WRITE_RECORDS_SUMMARY_FILE: &str = "write_records_summary.json";

/*=================================================================
=                          CONFIG TYPES                           =
=================================================================*/

/// Half-open size range `[low, high)` with a sampling quota. A missing `high` means +inf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeBucket {
    pub low: usize,
    #[serde(default)]
    pub high: Option<usize>,
    pub count: usize,
}

impl SizeBucket {
    pub fn new(low: usize, high: Option<usize>, count: usize) -> Self {
        SizeBucket { low, high, count }
    }

    pub fn contains(&self, size: usize) -> bool {
        match self.high {
            Some(high) => size >= self.low && size < high,
            None => size >= self.low,
        }
    }
}

impl fmt::Display for SizeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.high {
            Some(high) => write!(f, "[{}, {})", self.low, high),
            None => write!(f, "[{}, inf)", self.low),
        }
    }
}

/// Buckets must be ascending and non-overlapping, and only the last one may be open-ended.
/// Anything else would let one item land in two buckets.
pub fn validate_buckets(buckets: &[SizeBucket], name: &str) -> Result<(), Error> {
    for (idx, bucket) in buckets.iter().enumerate() {
        if let Some(high) = bucket.high {
            if high <= bucket.low {
                bail!("{}[{}]: high ({}) must be greater than low ({})", name, idx, high, bucket.low);
            }
        }
        if let Some(next) = buckets.get(idx + 1) {
            match bucket.high {
                None => bail!("{}[{}]: only the last bucket may be open-ended", name, idx),
                Some(high) if high > next.low => bail!(
                    "{}[{}] {} overlaps {}[{}] {}",
                    name, idx, bucket, name, idx + 1, next
                ),
                _ => {}
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn cluster_file(&self) -> &'static str {
        match self {
            Split::Train => TRAIN_CLUSTERS_FILE,
            Split::Val => VAL_CLUSTERS_FILE,
            Split::Test => TEST_CLUSTERS_FILE,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingPolicy {
    TakeAll,
    Quota,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencySource {
    Global,
    Split,
}

/// Which ligands an output file may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LigandVisibility {
    /// Ligands visible during training: everything except the held-out val/test ligands.
    Seen,
    /// Only this split's own held-out ligands.
    Unseen,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub file: String,
    pub split: Split,
    pub ligands: LigandVisibility,
}

/*=================================================================
=                             CONFIG                              =
=================================================================*/

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Source corpora
    pub protein2ligand_path: PathBuf,
    pub sequence_path: PathBuf,
    pub text_path: PathBuf,
    #[serde(default)]
    pub fallback_sequence_path: Option<PathBuf>,
    pub structure_path: PathBuf,
    pub cluster_mapping_path: PathBuf,

    // Directory paths
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,

    // Sampling
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_cluster_buckets")]
    pub cluster_buckets: Vec<SizeBucket>,
    #[serde(default = "default_ligand_buckets")]
    pub ligand_buckets: Vec<SizeBucket>,
    #[serde(default = "default_ligand_sampling")]
    pub ligand_sampling: SamplingPolicy,
    #[serde(default = "default_ligand_frequency")]
    pub ligand_frequency: FrequencySource,
    #[serde(default = "default_label_suffix")]
    pub label_suffix: String,

    // Record emission
    #[serde(default = "default_tokenizer_str")]
    pub tokenizer_str: String,
    #[serde(default = "default_function_template")]
    pub function_template: String,
    #[serde(default = "default_special_tokens")]
    pub special_tokens: Vec<String>,
    #[serde(default = "default_outputs")]
    pub outputs: Vec<OutputSpec>,

    // Debug options
    #[serde(default = "default_debug")]
    pub debug: bool,
}

fn default_seed() -> u64 {
    42
}

fn default_cluster_buckets() -> Vec<SizeBucket> {
    vec![
        SizeBucket::new(1, Some(501), 40),
        SizeBucket::new(501, Some(1001), 20),
        SizeBucket::new(1001, Some(2501), 10),
        SizeBucket::new(2501, None, 2),
    ]
}

fn default_ligand_buckets() -> Vec<SizeBucket> {
    // Five bands of 10k over the protein count; the quota only matters under `quota` sampling
    (0..5)
        .map(|i| SizeBucket::new(1 + i * 10000, Some(1 + (i + 1) * 10000), 4))
        .collect()
}

fn default_ligand_sampling() -> SamplingPolicy {
    SamplingPolicy::TakeAll
}

fn default_ligand_frequency() -> FrequencySource {
    FrequencySource::Global
}

fn default_label_suffix() -> String {
    ".sdf".to_string()
}

fn default_tokenizer_str() -> String {
    "uniseg".to_string()
}

fn default_function_template() -> String {
    "The function of the target protein is <FUNCTION> {text} </FUNCTION>".to_string()
}

fn default_special_tokens() -> Vec<String> {
    vec!["<FUNCTION>".to_string(), "</FUNCTION>".to_string()]
}

fn default_outputs() -> Vec<OutputSpec> {
    let spec = |file: &str, split, ligands| OutputSpec { file: file.to_string(), split, ligands };
    vec![
        spec("train_dataset_tokenized.jsonl", Split::Train, LigandVisibility::Seen),
        spec("val_dataset_seen_ligands_tokenized.jsonl", Split::Val, LigandVisibility::Seen),
        spec("test_dataset_seen_ligands_tokenized.jsonl", Split::Test, LigandVisibility::Seen),
        spec("val_dataset_unseen_ligands_tokenized.jsonl", Split::Val, LigandVisibility::Unseen),
        spec("test_dataset_unseen_ligands_tokenized.jsonl", Split::Test, LigandVisibility::Unseen),
    ]
}

fn default_debug() -> bool {
    false
}

impl Config {
    pub fn work_path(&self, file_name: &str) -> PathBuf {
        self.work_dir.join(file_name)
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_buckets(&self.cluster_buckets, "cluster_buckets")?;
        validate_buckets(&self.ligand_buckets, "ligand_buckets")?;

        if !self.function_template.contains("{text}") {
            bail!("function_template must contain a {{text}} placeholder");
        }

        let mut seen_files = HashSet::new();
        for output in &self.outputs {
            if !seen_files.insert(output.file.as_str()) {
                bail!("Output file {:?} is configured more than once", output.file);
            }
            if output.split == Split::Train && output.ligands == LigandVisibility::Unseen {
                bail!("Output {:?}: the train split has no held-out ligands", output.file);
            }
        }
        Ok(())
    }
}

pub fn read_config(config_path: &PathBuf) -> Result<Config, Error> {
    let contents = read_pathbuf_to_mem(config_path)
        .with_context(|| format!("Failed to read config {:?}", config_path))?;
    let config: Config = serde_yaml::from_reader(contents)
        .with_context(|| format!("Failed to parse config {:?}", config_path))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_boundaries_are_half_open() {
        let bucket = SizeBucket::new(1, Some(3), 2);
        assert!(!bucket.contains(0));
        assert!(bucket.contains(1));
        assert!(bucket.contains(2));
        assert!(!bucket.contains(3));

        let open = SizeBucket::new(2501, None, 2);
        assert!(open.contains(2501));
        assert!(open.contains(usize::MAX));
    }

    #[test]
    fn test_default_buckets_validate() {
        assert!(validate_buckets(&default_cluster_buckets(), "cluster_buckets").is_ok());
        assert!(validate_buckets(&default_ligand_buckets(), "ligand_buckets").is_ok());
        assert_eq!(default_ligand_buckets()[4], SizeBucket::new(40001, Some(50001), 4));
    }

    #[test]
    fn test_overlapping_or_open_buckets_rejected() {
        let overlapping = vec![SizeBucket::new(1, Some(10), 1), SizeBucket::new(5, Some(20), 1)];
        assert!(validate_buckets(&overlapping, "b").is_err());

        let open_middle = vec![SizeBucket::new(1, None, 1), SizeBucket::new(5, Some(20), 1)];
        assert!(validate_buckets(&open_middle, "b").is_err());

        let inverted = vec![SizeBucket::new(10, Some(10), 1)];
        assert!(validate_buckets(&inverted, "b").is_err());
    }

    #[test]
    fn test_minimal_yaml_gets_defaults() {
        let yaml = r#"
protein2ligand_path: data/protein2ligand_id.json
sequence_path: data/uniprot2seq.json
text_path: data/uniprot2text.json
structure_path: data/ligand2smiles.json
cluster_mapping_path: data/clusterRes_cluster.tsv
work_dir: work
output_dir: out
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.seed, 42);
        assert_eq!(config.cluster_buckets.len(), 4);
        assert_eq!(config.cluster_buckets[3].high, None);
        assert_eq!(config.ligand_sampling, SamplingPolicy::TakeAll);
        assert_eq!(config.outputs.len(), 5);
        assert!(config.fallback_sequence_path.is_none());
    }

    #[test]
    fn test_unseen_train_output_rejected() {
        let yaml = r#"
protein2ligand_path: a
sequence_path: b
text_path: c
structure_path: d
cluster_mapping_path: e
work_dir: w
output_dir: o
outputs:
  - file: train.jsonl
    split: train
    ligands: unseen
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
