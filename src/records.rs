// Final record emission: joins each split's proteins with their sequence, text, ligands and
// ligand structures, and writes one JSON line per surviving (protein, ligand) pair.

use anyhow::{Context, Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use mj_io::build_pbar;

use crate::clusters::{load_split_entities, read_cluster_splits, IngestStats};
use crate::config::{
    Config, LigandVisibility, OutputSpec, Split, TEST_LIGANDS_FILE, VAL_LIGANDS_FILE,
    WRITE_RECORDS_SUMMARY_FILE,
};
use crate::io::{create_writer, format_number_with_commas, read_id_set, sorted_ids, write_summary};
use crate::ligands::{canonicalize_label, train_visible_labels};
use crate::partial::{partial_load, partial_load_chain, LoadStats};
use crate::tokenizer::{tokenize_wrapped, OmniTokenizer, TextTokenizer, TokenizedText};

/*=================================================================
=                           RECORD TYPES                          =
=================================================================*/

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInput {
    pub function_original: String,
    pub function_tokens: Vec<String>,
    pub function_token_ids: Vec<usize>,
    pub ligand: String,
    pub ligand_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub input: RecordInput,
    pub output: String,
    pub uniprot_id: String,
}

/// A protein's ligand list as found in the corpus. Anything that is not a list of strings is
/// kept as `Malformed` so it can be counted at emission time.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LabelList {
    Labels(Vec<String>),
    Malformed(Value),
}

/// Which ligands a job may emit.
#[derive(Debug, Clone, Copy)]
pub enum LabelPolicy<'a> {
    Any,
    Only(&'a HashSet<String>),
    Nothing,
}

impl<'a> LabelPolicy<'a> {
    pub fn allows(&self, label: &str) -> bool {
        match self {
            LabelPolicy::Any => true,
            LabelPolicy::Only(allowed) => allowed.contains(label),
            LabelPolicy::Nothing => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmitSummary {
    pub entities_in_split: usize,
    pub missing_sequence: usize,
    pub missing_text: usize,
    pub missing_labels: usize,
    pub malformed_label_lists: usize,
    pub labels_filtered_by_visibility: usize,
    pub labels_without_structure: usize,
    pub records_written: usize,
}

/*=================================================================
=                        RECORD JOIN EMITTER                      =
=================================================================*/

/// Read-only join inputs shared by every output job.
pub struct RecordJoinEmitter<'a> {
    pub sequences: &'a HashMap<String, String>,
    pub texts: &'a HashMap<String, String>,
    pub protein2ligand: &'a HashMap<String, LabelList>,
    pub structures: &'a HashMap<String, String>,
    pub tokenizer: &'a dyn TextTokenizer,
    pub function_template: &'a str,
    pub label_suffix: &'a str,
}

impl<'a> RecordJoinEmitter<'a> {
    /// Streams the records of `entities` (in sorted order) into `writer`. Missing join
    /// targets exclude a protein or a ligand and are counted; only write failures are errors.
    pub fn emit<W: Write>(
        &self,
        entities: &HashSet<String>,
        policy: LabelPolicy,
        writer: &mut W,
    ) -> Result<EmitSummary, Error> {
        let mut summary = EmitSummary {
            entities_in_split: entities.len(),
            ..Default::default()
        };

        for entity_id in sorted_ids(entities) {
            let Some(sequence) = self.sequences.get(&entity_id).filter(|s| !s.is_empty()) else {
                summary.missing_sequence += 1;
                continue;
            };
            let Some(text) = self.texts.get(&entity_id).filter(|s| !s.is_empty()) else {
                summary.missing_text += 1;
                continue;
            };
            let labels = match self.protein2ligand.get(&entity_id) {
                Some(LabelList::Labels(labels)) => labels,
                Some(LabelList::Malformed(_)) => {
                    summary.malformed_label_lists += 1;
                    continue;
                }
                None => {
                    summary.missing_labels += 1;
                    continue;
                }
            };

            // Tokenized on the first ligand that survives the filters
            let mut tokenized: Option<TokenizedText> = None;
            for raw_label in labels {
                let label = canonicalize_label(raw_label, self.label_suffix);
                if !policy.allows(label) {
                    summary.labels_filtered_by_visibility += 1;
                    continue;
                }
                let Some(structure) = self.structures.get(label) else {
                    summary.labels_without_structure += 1;
                    continue;
                };

                let tokens = tokenized
                    .get_or_insert_with(|| tokenize_wrapped(self.tokenizer, self.function_template, text));
                let record = DatasetRecord {
                    input: RecordInput {
                        function_original: tokens.original_text.clone(),
                        function_tokens: tokens.tokenized_text.clone(),
                        function_token_ids: tokens.token_ids.clone(),
                        ligand: structure.clone(),
                        ligand_id: label.to_string(),
                    },
                    output: sequence.clone(),
                    uniprot_id: entity_id.clone(),
                };
                serde_json::to_writer(&mut *writer, &record)?;
                writer.write_all(b"\n")?;
                summary.records_written += 1;
            }
        }

        writer.flush()?;
        Ok(summary)
    }
}

/*=================================================================
=                        WRITE RECORDS STAGE                      =
=================================================================*/

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub output: OutputSpec,
    pub path: PathBuf,
    pub emit: EmitSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteRecordsSummary {
    pub ingest: IngestStats,
    pub loads: Vec<LoadStats>,
    pub val_ligands: usize,
    pub test_ligands: usize,
    pub train_visible_ligands: usize,
    pub jobs: Vec<JobSummary>,
}

fn label_policy<'a>(
    output: &OutputSpec,
    train_visible: &'a HashSet<String>,
    val_labels: &'a HashSet<String>,
    test_labels: &'a HashSet<String>,
) -> LabelPolicy<'a> {
    match (output.ligands, output.split) {
        (LigandVisibility::Any, _) => LabelPolicy::Any,
        (LigandVisibility::Seen, _) => LabelPolicy::Only(train_visible),
        (LigandVisibility::Unseen, Split::Val) => LabelPolicy::Only(val_labels),
        (LigandVisibility::Unseen, Split::Test) => LabelPolicy::Only(test_labels),
        // Train has no held-out ligands
        (LigandVisibility::Unseen, Split::Train) => LabelPolicy::Nothing,
    }
}

pub fn execute_write_records(config: &Config) -> Result<WriteRecordsSummary, Error> {
    println!("Starting record emission...");
    let start_main = Instant::now();

    let used_splits: HashSet<Split> = config.outputs.iter().map(|output| output.split).collect();
    let cluster_splits: HashMap<String, Split> = read_cluster_splits(config)?
        .into_iter()
        .filter(|(_, split)| used_splits.contains(split))
        .collect();
    let (entities, ingest) = load_split_entities(&config.cluster_mapping_path, &cluster_splits)?;
    for split in Split::ALL {
        if let Some(members) = entities.get(&split) {
            println!("{} split has {} proteins.", split, format_number_with_commas(members.len()));
        }
    }

    let val_labels = read_id_set(&config.work_path(VAL_LIGANDS_FILE))?;
    let test_labels = read_id_set(&config.work_path(TEST_LIGANDS_FILE))?;

    let needed: HashSet<String> = entities.values().flatten().cloned().collect();
    let mut sequence_paths = vec![config.sequence_path.clone()];
    if let Some(fallback) = &config.fallback_sequence_path {
        sequence_paths.push(fallback.clone());
    }
    let (sequences, mut loads) = partial_load_chain::<String>(&sequence_paths, &needed)?;
    let (texts, text_load) = partial_load::<String>(&config.text_path, &needed)?;
    let (protein2ligand, ligand_load) = partial_load::<LabelList>(&config.protein2ligand_path, &needed)?;

    let referenced_labels: HashSet<String> = protein2ligand
        .values()
        .filter_map(|list| match list {
            LabelList::Labels(labels) => Some(labels),
            LabelList::Malformed(_) => None,
        })
        .flatten()
        .map(|label| canonicalize_label(label, &config.label_suffix).to_string())
        .collect();
    let (structures, structure_load) = partial_load::<String>(&config.structure_path, &referenced_labels)?;
    loads.extend([text_load, ligand_load, structure_load]);

    let train_visible = train_visible_labels(&referenced_labels, &val_labels, &test_labels);
    let tokenizer = OmniTokenizer::new(&config.tokenizer_str, &config.special_tokens)?;

    let emitter = RecordJoinEmitter {
        sequences: &sequences,
        texts: &texts,
        protein2ligand: &protein2ligand,
        structures: &structures,
        tokenizer: &tokenizer,
        function_template: &config.function_template,
        label_suffix: &config.label_suffix,
    };

    let no_entities = HashSet::new();
    let pbar = build_pbar(config.outputs.len(), "Output files");
    let jobs: Vec<JobSummary> = config
        .outputs
        .par_iter()
        .map(|output| -> Result<JobSummary, Error> {
            let path = config.output_dir.join(&output.file);
            let members = entities.get(&output.split).unwrap_or(&no_entities);
            let policy = label_policy(output, &train_visible, &val_labels, &test_labels);

            let mut writer = create_writer(&path)?;
            let emit = emitter
                .emit(members, policy, &mut writer)
                .with_context(|| format!("Failed writing {:?}", path))?;
            pbar.inc(1);
            Ok(JobSummary { output: output.clone(), path, emit })
        })
        .collect::<Result<Vec<_>, Error>>()?;
    pbar.finish();

    for job in &jobs {
        println!(
            "  {} records -> {:?} ({} missing sequence, {} missing text, {} ligands without structure)",
            format_number_with_commas(job.emit.records_written),
            job.path,
            job.emit.missing_sequence,
            job.emit.missing_text,
            job.emit.labels_without_structure
        );
    }

    let summary = WriteRecordsSummary {
        ingest,
        loads,
        val_ligands: val_labels.len(),
        test_ligands: test_labels.len(),
        train_visible_ligands: train_visible.len(),
        jobs,
    };
    write_summary(&config.work_path(WRITE_RECORDS_SUMMARY_FILE), &summary)?;

    println!("Record emission completed in {:.2}s", start_main.elapsed().as_secs_f64());
    Ok(summary)
}
