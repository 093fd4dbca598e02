// Corpus readers and the small flat files that carry state between stages
// (ID lists, split files, stage summaries).

use anyhow::{Context, Error, Result};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{create_dir_all, File};
use std::io::{BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use zstd::stream::read::Decoder as ZstdDecoder;

use mj_io::{read_pathbuf_to_mem, write_mem_to_pathbuf};

/// Opens a corpus for streaming, decompressing `.gz` / `.zst` on the fly.
/// A missing or unreadable file is an error naming the path.
pub fn open_reader(path: &Path) -> Result<Box<dyn BufRead + Send>, Error> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;

    let reader: Box<dyn BufRead + Send> = match path.extension().and_then(|s| s.to_str()) {
        Some("gz") => Box::new(BufReader::new(GzDecoder::new(file))),
        Some("zst") => {
            let decoder = ZstdDecoder::new(file)
                .with_context(|| format!("Failed to start zstd decoder for {:?}", path))?;
            Box::new(BufReader::new(decoder))
        }
        _ => Box::new(BufReader::new(file)),
    };
    Ok(reader)
}

/// Creates `path` (and its parent directories) for buffered writing.
pub fn create_writer(path: &Path) -> Result<BufWriter<File>, Error> {
    ensure_parent_dir(path)?;
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    Ok(BufWriter::new(file))
}

fn ensure_parent_dir(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }
    Ok(())
}

/// Reads a flat ID list (one ID per line), keeping file order. Blank lines are ignored.
pub fn read_id_list(path: &PathBuf) -> Result<Vec<String>, Error> {
    let data = read_pathbuf_to_mem(path).with_context(|| format!("Failed to read ID list {:?}", path))?;
    let mut ids = Vec::new();
    for line in data.lines() {
        let line = line?;
        let id = line.trim();
        if !id.is_empty() {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}

pub fn read_id_set(path: &PathBuf) -> Result<HashSet<String>, Error> {
    Ok(read_id_list(path)?.into_iter().collect())
}

/// Writes IDs one per line in the order given. Callers sort first when order must be stable.
pub fn write_id_list(path: &PathBuf, ids: &[String]) -> Result<(), Error> {
    ensure_parent_dir(path)?;
    let mut output_bytes = Vec::new();
    for id in ids {
        output_bytes.extend_from_slice(id.as_bytes());
        output_bytes.push(b'\n');
    }
    write_mem_to_pathbuf(&output_bytes, path)
        .with_context(|| format!("Failed to write ID list {:?}", path))?;
    Ok(())
}

/// Sorts a set into a Vec so that persisted output never depends on hash order.
pub fn sorted_ids<'a, I>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut sorted: Vec<String> = ids.into_iter().cloned().collect();
    sorted.sort();
    sorted
}

pub fn write_summary<T: Serialize>(path: &PathBuf, summary: &T) -> Result<(), Error> {
    ensure_parent_dir(path)?;
    let bytes = serde_json::to_vec_pretty(summary)?;
    write_mem_to_pathbuf(&bytes, path).with_context(|| format!("Failed to write summary {:?}", path))?;
    Ok(())
}

// Helper function to format numbers with commas
pub fn format_number_with_commas(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, ch) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(ch);
    }

    result.chars().rev().collect()
}
