// Post-hoc checks over produced artifacts: comparing two ID lists and cutting an emitted
// dataset down to an allow list of (protein, ligand) pairs.

use anyhow::{bail, Context, Error, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use mj_io::read_pathbuf_to_mem;

use crate::io::{create_writer, format_number_with_commas, open_reader, read_id_set, sorted_ids};

pub mod stats;

/*=================================================================
=                           ID COMPARISON                         =
=================================================================*/

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdComparison {
    pub first_count: usize,
    pub second_count: usize,
    pub common: usize,
    /// Sorted.
    pub only_in_first: Vec<String>,
    pub only_in_second: Vec<String>,
}

impl IdComparison {
    pub fn identical(&self) -> bool {
        self.only_in_first.is_empty() && self.only_in_second.is_empty()
    }
}

pub fn compare_id_sets(first: &HashSet<String>, second: &HashSet<String>) -> IdComparison {
    IdComparison {
        first_count: first.len(),
        second_count: second.len(),
        common: first.intersection(second).count(),
        only_in_first: sorted_ids(first.difference(second)),
        only_in_second: sorted_ids(second.difference(first)),
    }
}

pub fn compare_id_files(first: &PathBuf, second: &PathBuf) -> Result<IdComparison, Error> {
    let first_ids = read_id_set(first)?;
    let second_ids = read_id_set(second)?;
    println!("Loaded {} IDs from {:?}", format_number_with_commas(first_ids.len()), first);
    println!("Loaded {} IDs from {:?}", format_number_with_commas(second_ids.len()), second);
    println!("Comparing IDs...");

    let comparison = compare_id_sets(&first_ids, &second_ids);
    if comparison.identical() {
        println!("Both files contain exactly the same IDs.");
    } else {
        println!("Differences found:");
        if !comparison.only_in_first.is_empty() {
            println!("  IDs only in {:?}: {:?}", first, comparison.only_in_first);
        }
        if !comparison.only_in_second.is_empty() {
            println!("  IDs only in {:?}: {:?}", second, comparison.only_in_second);
        }
    }
    Ok(comparison)
}

/*=================================================================
=                         ALLOW LIST FILTER                       =
=================================================================*/

/// Reads a two-column TSV of (protein_id, ligand_id) with a header row. Rows that do not
/// have exactly two columns are ignored.
pub fn load_allow_list(path: &PathBuf) -> Result<HashSet<(String, String)>, Error> {
    let data = read_pathbuf_to_mem(path).with_context(|| format!("Failed to read allow list {:?}", path))?;
    let mut allowed = HashSet::new();
    for line in data.lines().skip(1) {
        let line = line?;
        let fields: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
        if let [protein_id, ligand_id] = fields.as_slice() {
            allowed.insert((protein_id.to_string(), ligand_id.to_string()));
        }
    }
    println!("Loaded {} pairs into the allow list.", format_number_with_commas(allowed.len()));
    Ok(allowed)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterSummary {
    pub lines_read: usize,
    pub lines_kept: usize,
    pub malformed_lines: usize,
}

/// Copies the lines of `input` whose (uniprot_id, input.ligand_id) pair is allowed.
/// Kept lines are written byte for byte.
pub fn filter_lines<R: BufRead, W: Write>(
    mut input: R,
    output: &mut W,
    allowed: &HashSet<(String, String)>,
) -> Result<FilterSummary, Error> {
    let mut summary = FilterSummary::default();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        summary.lines_read += 1;

        let Ok(record) = serde_json::from_slice::<serde_json::Value>(&buf) else {
            summary.malformed_lines += 1;
            continue;
        };
        let protein_id = record["uniprot_id"].as_str();
        let ligand_id = record["input"]["ligand_id"].as_str();
        let (Some(protein_id), Some(ligand_id)) = (protein_id, ligand_id) else {
            summary.malformed_lines += 1;
            continue;
        };

        if allowed.contains(&(protein_id.to_string(), ligand_id.to_string())) {
            output.write_all(&buf)?;
            if !buf.ends_with(b"\n") {
                output.write_all(b"\n")?;
            }
            summary.lines_kept += 1;
        }
    }
    output.flush()?;
    Ok(summary)
}

pub fn filter_records_by_allow_list(
    input: &Path,
    output: &Path,
    allow_list: &PathBuf,
) -> Result<FilterSummary, Error> {
    let allowed = load_allow_list(allow_list)?;
    if allowed.is_empty() {
        bail!("Allow list {:?} is empty; refusing to write an empty dataset", allow_list);
    }

    println!("Starting to filter {:?}...", input);
    let reader = open_reader(input)?;
    let mut writer = create_writer(output)?;
    let summary = filter_lines(reader, &mut writer, &allowed)?;

    println!("=== FILTERING COMPLETE ===");
    println!("Total lines read: {}", format_number_with_commas(summary.lines_read));
    println!("Lines kept:       {}", format_number_with_commas(summary.lines_kept));
    if summary.malformed_lines > 0 {
        println!("Malformed lines:  {}", format_number_with_commas(summary.malformed_lines));
    }
    println!("Filtered file saved to: {:?}", output);
    Ok(summary)
}
