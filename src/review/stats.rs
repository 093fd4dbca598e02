use anyhow::{Error, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::io::{format_number_with_commas, open_reader};

#[derive(Debug, Deserialize)]
struct RecordView {
    uniprot_id: String,
    input: RecordInputView,
}

#[derive(Debug, Deserialize)]
struct RecordInputView {
    ligand_id: String,
    #[serde(default)]
    function_token_ids: Vec<serde_json::Value>,
}

/// Aggregate counts for one emitted dataset file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetStats {
    pub records: usize,
    pub proteins: usize,
    pub ligands: usize,
    pub malformed_lines: usize,
    pub avg_tokens: f64,
    /// (ligand_id, records) sorted by records descending, then ID
    pub records_per_ligand: Vec<(String, usize)>,
}

pub fn compute_dataset_stats<R: BufRead>(mut reader: R) -> Result<DatasetStats, Error> {
    let mut proteins = HashSet::new();
    let mut per_ligand: HashMap<String, usize> = HashMap::new();
    let mut stats = DatasetStats::default();
    let mut total_tokens = 0usize;

    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        if buf.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        let record: RecordView = match serde_json::from_slice(&buf) {
            Ok(record) => record,
            Err(_) => {
                stats.malformed_lines += 1;
                continue;
            }
        };
        stats.records += 1;
        total_tokens += record.input.function_token_ids.len();
        proteins.insert(record.uniprot_id);
        *per_ligand.entry(record.input.ligand_id).or_insert(0) += 1;
    }

    stats.proteins = proteins.len();
    stats.ligands = per_ligand.len();
    stats.avg_tokens = if stats.records > 0 {
        total_tokens as f64 / stats.records as f64
    } else {
        0.0
    };
    let mut records_per_ligand: Vec<(String, usize)> = per_ligand.into_iter().collect();
    records_per_ligand.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    stats.records_per_ligand = records_per_ligand;
    Ok(stats)
}

/// Display dataset statistics, or export them as CSV when `output_dir` is given
pub fn display_dataset_stats(files: &[PathBuf], output_dir: Option<&Path>) -> Result<Vec<DatasetStats>, Error> {
    let mut all_stats = Vec::new();
    for path in files {
        all_stats.push(compute_dataset_stats(open_reader(path)?)?);
    }

    if let Some(dir) = output_dir {
        fs::create_dir_all(dir)?;
        write_summary_csv(dir, files, &all_stats)?;
        for (path, stats) in files.iter().zip(&all_stats) {
            write_ligand_csv(dir, path, stats)?;
        }
        println!("Exported statistics to: {}", dir.display());
        println!("  - summary.csv");
        println!("  - <dataset>_ligands.csv");
        return Ok(all_stats);
    }

    for (path, stats) in files.iter().zip(&all_stats) {
        println!("=== DATASET STATISTICS: {} ===", path.display());
        println!("  Records:         {:>12}", format_number_with_commas(stats.records));
        println!("  Proteins:        {:>12}", format_number_with_commas(stats.proteins));
        println!("  Ligands:         {:>12}", format_number_with_commas(stats.ligands));
        println!("  Avg tokens:      {:>12.1}", stats.avg_tokens);
        if stats.malformed_lines > 0 {
            println!("  Malformed lines: {:>12}", format_number_with_commas(stats.malformed_lines));
        }
        println!();
        println!("  Records per ligand (top 20):");

        let max_count = stats.records_per_ligand.first().map(|(_, count)| *count).unwrap_or(0);
        let bar_width = 50;
        for (ligand, count) in stats.records_per_ligand.iter().take(20) {
            let bar_length = if max_count > 0 {
                ((*count as f64 / max_count as f64) * bar_width as f64) as usize
            } else {
                0
            };
            let bar = "█".repeat(bar_length);
            let empty = " ".repeat(bar_width - bar_length);
            println!("  {:<30} {:>8} │{}{}│", ligand, count, bar, empty);
        }
        println!();
    }
    Ok(all_stats)
}

fn dataset_name(path: &Path) -> String {
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("dataset");
    name.split('.').next().unwrap_or(name).to_string()
}

fn write_summary_csv(dir: &Path, files: &[PathBuf], all_stats: &[DatasetStats]) -> Result<(), Error> {
    let path = dir.join("summary.csv");
    let mut file = File::create(path)?;

    writeln!(file, "dataset,records,proteins,ligands,avg_tokens,malformed_lines")?;
    for (dataset, stats) in files.iter().zip(all_stats) {
        writeln!(
            file,
            "{},{},{},{},{:.1},{}",
            dataset_name(dataset),
            stats.records,
            stats.proteins,
            stats.ligands,
            stats.avg_tokens,
            stats.malformed_lines
        )?;
    }

    Ok(())
}

fn write_ligand_csv(dir: &Path, dataset: &Path, stats: &DatasetStats) -> Result<(), Error> {
    let path = dir.join(format!("{}_ligands.csv", dataset_name(dataset)));
    let mut file = File::create(path)?;

    writeln!(file, "ligand_id,records")?;
    for (ligand, count) in &stats.records_per_ligand {
        writeln!(file, "{},{}", ligand, count)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn record(protein: &str, ligand: &str, tokens: usize) -> String {
        let ids: Vec<usize> = (0..tokens).collect();
        format!(
            "{{\"input\": {{\"function_token_ids\": {:?}, \"ligand_id\": \"{}\"}}, \"output\": \"M\", \"uniprot_id\": \"{}\"}}\n",
            ids, ligand, protein
        )
    }

    #[test]
    fn test_compute_dataset_stats() {
        let input = [
            record("P1", "L1", 4),
            record("P1", "L2", 4),
            record("P2", "L1", 2),
            "garbage\n".to_string(),
        ]
        .concat();

        let stats = compute_dataset_stats(Cursor::new(input)).unwrap();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.proteins, 2);
        assert_eq!(stats.ligands, 2);
        assert_eq!(stats.malformed_lines, 1);
        assert!((stats.avg_tokens - 10.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.records_per_ligand[0], ("L1".to_string(), 2));
    }

    #[test]
    fn test_empty_dataset() {
        let stats = compute_dataset_stats(Cursor::new("")).unwrap();
        assert_eq!(stats, DatasetStats::default());
    }

    #[test]
    fn test_csv_export() {
        let dir = TempDir::new().unwrap();
        let dataset = dir.path().join("val_dataset_tokenized.jsonl");
        std::fs::write(&dataset, record("P1", "L1", 3)).unwrap();

        let out_dir = dir.path().join("stats");
        display_dataset_stats(&[dataset], Some(&out_dir)).unwrap();

        let summary = std::fs::read_to_string(out_dir.join("summary.csv")).unwrap();
        assert_eq!(
            summary,
            "dataset,records,proteins,ligands,avg_tokens,malformed_lines\nval_dataset_tokenized,1,1,1,3.0,0\n"
        );
        let ligands = std::fs::read_to_string(out_dir.join("val_dataset_tokenized_ligands.csv")).unwrap();
        assert_eq!(ligands, "ligand_id,records\nL1,1\n");
    }
}
