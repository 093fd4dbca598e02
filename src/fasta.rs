use anyhow::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use crate::config::{Config, FASTA_FILE, SELECTED_IDS_FILE};
use crate::io::{create_writer, format_number_with_commas, read_id_list};
use crate::partial::partial_load_chain;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FastaSummary {
    pub requested: usize,
    pub written: usize,
    /// Sequences found in each corpus, in lookup order.
    pub per_source: Vec<(PathBuf, usize)>,
    pub missing: usize,
}

/// Writes `>{id}\n{sequence}\n` for every ID in `ids` that has a sequence, in the order given.
pub fn write_fasta<W: Write>(ids: &[String], sequences: &HashMap<String, String>, writer: &mut W) -> Result<usize, Error> {
    let mut written = 0;
    for id in ids {
        if let Some(sequence) = sequences.get(id) {
            writeln!(writer, ">{}\n{}", id, sequence)?;
            written += 1;
        }
    }
    writer.flush()?;
    Ok(written)
}

pub fn execute_make_fasta(config: &Config, output: Option<&PathBuf>) -> Result<FastaSummary, Error> {
    println!("Starting FASTA export...");
    let start_main = Instant::now();

    let ids = read_id_list(&config.work_path(SELECTED_IDS_FILE))?;
    let needed: HashSet<String> = ids.iter().cloned().collect();

    let mut sources = vec![config.sequence_path.clone()];
    if let Some(fallback) = &config.fallback_sequence_path {
        sources.push(fallback.clone());
    }
    let (sequences, loads) = partial_load_chain::<String>(&sources, &needed)?;

    let output_path = output.cloned().unwrap_or_else(|| config.work_path(FASTA_FILE));
    let mut writer = create_writer(&output_path)?;
    let written = write_fasta(&ids, &sequences, &mut writer)?;

    let summary = FastaSummary {
        requested: needed.len(),
        written,
        per_source: loads.iter().map(|load| (load.path.clone(), load.retained)).collect(),
        missing: needed.len() - sequences.len(),
    };
    for (path, count) in &summary.per_source {
        println!("{} written from {:?}", format_number_with_commas(*count), path);
    }
    if summary.missing > 0 {
        println!("Warning: {} selected proteins have no sequence", format_number_with_commas(summary.missing));
    }

    println!("FASTA export to {:?} completed in {:.2}s", output_path, start_main.elapsed().as_secs_f64());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_fasta_skips_missing() {
        let sequences: HashMap<String, String> =
            serde_json::from_str(r#"{"P1": "MKV", "P3": "MGG"}"#).unwrap();
        let ids = vec!["P1".to_string(), "P2".to_string(), "P3".to_string()];

        let mut out = Vec::new();
        let written = write_fasta(&ids, &sequences, &mut out).unwrap();
        assert_eq!(written, 2);
        assert_eq!(String::from_utf8(out).unwrap(), ">P1\nMKV\n>P3\nMGG\n");
    }
}
