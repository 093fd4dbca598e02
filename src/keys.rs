// Streaming key extraction over corpora that are too large to load.
//
// Two layouts are supported:
//   * one huge JSON object `{ "<entity id>": <value>, ... }` walked entry by entry with a
//     serde visitor, values that nobody asked for are skipped with `IgnoredAny`;
//   * JSONL, one small object per line, each line parsed on its own.

use anyhow::{Error, Result};
use serde::de::{Deserializer as _, IgnoredAny, MapAccess, Visitor};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::io::BufRead;
use std::path::Path;

use crate::io::open_reader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorpusFormat {
    /// A single top-level object keyed by entity ID.
    Object,
    /// One JSON object per line.
    Lines,
}

impl CorpusFormat {
    pub fn infer(path: &Path) -> Self {
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
        if name.contains(".jsonl") {
            CorpusFormat::Lines
        } else {
            CorpusFormat::Object
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub entries: usize,
    pub malformed_lines: usize,
    pub non_object_lines: usize,
    /// Set when a keyed object could not be read to the end. Entries before the failure are kept.
    pub parse_error: Option<String>,
}

/// Receives corpus entries during a scan. `wants` sees every key; only entries it accepts
/// have their value decoded and passed to `accept`.
pub trait EntrySink {
    fn wants(&mut self, key: &str) -> bool;

    fn accept(&mut self, _key: String, _value: Value) {}
}

struct KeySink<F: FnMut(&str)> {
    on_key: F,
}

impl<F: FnMut(&str)> EntrySink for KeySink<F> {
    fn wants(&mut self, key: &str) -> bool {
        (self.on_key)(key);
        false
    }
}

/*=================================================================
=                         KEYED OBJECT SCAN                       =
=================================================================*/

struct ObjectVisitor<'a, S> {
    sink: &'a mut S,
    entries: &'a mut usize,
}

impl<'de, 'a, S: EntrySink> Visitor<'de> for ObjectVisitor<'a, S> {
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a JSON object keyed by entity id")
    }

    fn visit_map<A>(self, mut map: A) -> Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        while let Some(key) = map.next_key::<String>()? {
            *self.entries += 1;
            if self.sink.wants(&key) {
                let value: Value = map.next_value()?;
                self.sink.accept(key, value);
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

fn scan_object<R: std::io::Read, S: EntrySink>(reader: R, sink: &mut S) -> ScanStats {
    let mut entries = 0;
    let mut de = serde_json::Deserializer::from_reader(reader);
    let result = (&mut de).deserialize_map(ObjectVisitor {
        sink,
        entries: &mut entries,
    });
    let result = match result {
        Ok(()) => de.end(),
        Err(e) => Err(e),
    };

    ScanStats {
        entries,
        parse_error: result.err().map(|e| e.to_string()),
        ..Default::default()
    }
}

/*=================================================================
=                            JSONL SCAN                           =
=================================================================*/

/// Reads the next non-blank line into `buf`. Returns false at end of input.
fn next_line(reader: &mut dyn BufRead, buf: &mut Vec<u8>, line_num: &mut usize) -> std::io::Result<bool> {
    loop {
        buf.clear();
        if reader.read_until(b'\n', buf)? == 0 {
            return Ok(false);
        }
        *line_num += 1;
        if !buf.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(true);
        }
    }
}

fn parse_line(buf: &[u8], line_num: usize, stats: &mut ScanStats) -> Option<Map<String, Value>> {
    match serde_json::from_slice::<Value>(buf) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            stats.non_object_lines += 1;
            None
        }
        Err(e) => {
            println!("Error decoding JSON on line {}: {}", line_num, e);
            stats.malformed_lines += 1;
            None
        }
    }
}

fn scan_lines<S: EntrySink>(mut reader: Box<dyn BufRead + Send>, sink: &mut S) -> ScanStats {
    let mut stats = ScanStats::default();
    let mut buf = Vec::new();
    let mut line_num = 0;

    loop {
        match next_line(reader.as_mut(), &mut buf, &mut line_num) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                stats.parse_error = Some(format!("read failed after line {}: {}", line_num, e));
                break;
            }
        }
        let Some(map) = parse_line(&buf, line_num, &mut stats) else {
            continue;
        };
        for (key, value) in map {
            stats.entries += 1;
            if sink.wants(&key) {
                sink.accept(key, value);
            }
        }
    }
    stats
}

/// Lazy key iterator over a JSONL corpus. Only one line is held in memory at a time.
pub struct JsonlKeys {
    reader: Box<dyn BufRead + Send>,
    pending: VecDeque<String>,
    buf: Vec<u8>,
    line_num: usize,
    stats: ScanStats,
    done: bool,
}

impl JsonlKeys {
    pub fn new(reader: Box<dyn BufRead + Send>) -> Self {
        JsonlKeys {
            reader,
            pending: VecDeque::new(),
            buf: Vec::new(),
            line_num: 0,
            stats: ScanStats::default(),
            done: false,
        }
    }

    pub fn open(path: &Path) -> Result<Self, Error> {
        Ok(JsonlKeys::new(open_reader(path)?))
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    pub fn into_stats(self) -> ScanStats {
        self.stats
    }
}

impl Iterator for JsonlKeys {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while self.pending.is_empty() && !self.done {
            match next_line(self.reader.as_mut(), &mut self.buf, &mut self.line_num) {
                Ok(true) => {
                    if let Some(map) = parse_line(&self.buf, self.line_num, &mut self.stats) {
                        self.pending.extend(map.into_iter().map(|(key, _)| key));
                    }
                }
                Ok(false) => self.done = true,
                Err(e) => {
                    self.stats.parse_error =
                        Some(format!("read failed after line {}: {}", self.line_num, e));
                    self.done = true;
                }
            }
        }
        let key = self.pending.pop_front()?;
        self.stats.entries += 1;
        Some(key)
    }
}

/*=================================================================
=                            PUBLIC API                           =
=================================================================*/

/// Streams every entry of a corpus through `sink`. Only failing to open the file is fatal;
/// bad lines are skipped and a truncated object keeps what was read before the damage.
pub fn scan_corpus<S: EntrySink>(path: &Path, sink: &mut S) -> Result<ScanStats, Error> {
    let reader = open_reader(path)?;
    let stats = match CorpusFormat::infer(path) {
        CorpusFormat::Object => scan_object(reader, sink),
        CorpusFormat::Lines => scan_lines(reader, sink),
    };
    report_scan_problems(path, &stats);
    Ok(stats)
}

/// Calls `on_key` for every key in the corpus without decoding any value.
pub fn for_each_key<F: FnMut(&str)>(path: &Path, on_key: F) -> Result<ScanStats, Error> {
    match CorpusFormat::infer(path) {
        CorpusFormat::Object => scan_corpus(path, &mut KeySink { on_key }),
        CorpusFormat::Lines => {
            let mut on_key = on_key;
            let mut keys = JsonlKeys::open(path)?;
            for key in &mut keys {
                on_key(&key);
            }
            let stats = keys.into_stats();
            report_scan_problems(path, &stats);
            Ok(stats)
        }
    }
}

pub fn collect_keys(path: &Path) -> Result<(HashSet<String>, ScanStats), Error> {
    let mut keys = HashSet::new();
    let stats = for_each_key(path, |key| {
        keys.insert(key.to_string());
    })?;
    Ok((keys, stats))
}

fn report_scan_problems(path: &Path, stats: &ScanStats) {
    if stats.malformed_lines > 0 || stats.non_object_lines > 0 {
        println!(
            "Skipped {} malformed and {} non-object lines in {:?}",
            stats.malformed_lines, stats.non_object_lines, path
        );
    }
    if let Some(err) = &stats.parse_error {
        println!("Warning: stopped reading {:?} early ({} entries read): {}", path, stats.entries, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn reader(text: &str) -> Box<dyn BufRead + Send> {
        Box::new(Cursor::new(text.as_bytes().to_vec()))
    }

    #[test]
    fn test_infer_format() {
        assert_eq!(CorpusFormat::infer(Path::new("uniref50.jsonl")), CorpusFormat::Lines);
        assert_eq!(CorpusFormat::infer(Path::new("uniref50.jsonl.gz")), CorpusFormat::Lines);
        assert_eq!(CorpusFormat::infer(Path::new("uniprot2seq.json")), CorpusFormat::Object);
        assert_eq!(CorpusFormat::infer(Path::new("uniprot2seq.json.zst")), CorpusFormat::Object);
    }

    #[test]
    fn test_object_keys_skip_values() {
        let text = r#"{"P1": "MKV", "P2": {"nested": [1, 2, {"deep": null}]}, "P3": ["L1.sdf"]}"#;
        let mut keys = Vec::new();
        let stats = scan_object(Cursor::new(text), &mut KeySink { on_key: |k: &str| keys.push(k.to_string()) });
        assert_eq!(keys, vec!["P1", "P2", "P3"]);
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.parse_error, None);
    }

    #[test]
    fn test_truncated_object_keeps_prefix() {
        let text = r#"{"P1": "MKV", "P2": "AAA", "P3": "#;
        let mut keys = Vec::new();
        let stats = scan_object(Cursor::new(text), &mut KeySink { on_key: |k: &str| keys.push(k.to_string()) });
        assert_eq!(keys, vec!["P1", "P2", "P3"]);
        assert!(stats.parse_error.is_some());
    }

    #[test]
    fn test_empty_object() {
        let mut count = 0;
        let stats = scan_object(Cursor::new("{}"), &mut KeySink { on_key: |_: &str| count += 1 });
        assert_eq!(count, 0);
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.parse_error, None);
    }

    #[test]
    fn test_jsonl_keys_skip_bad_lines() {
        let text = "{\"P1\": \"AAA\"}\nnot json at all\n\n[1, 2, 3]\n{\"P2\": \"BBB\", \"P3\": \"CCC\"}\n";
        let mut keys = JsonlKeys::new(reader(text));
        let collected: Vec<String> = (&mut keys).collect();
        assert_eq!(collected, vec!["P1", "P2", "P3"]);
        assert_eq!(keys.stats().malformed_lines, 1);
        assert_eq!(keys.stats().non_object_lines, 1);
        assert_eq!(keys.stats().entries, 3);
    }

    #[test]
    fn test_jsonl_handles_crlf_and_missing_trailing_newline() {
        let text = "{\"P1\": \"AAA\"}\r\n{\"P2\": \"BBB\"}";
        let collected: Vec<String> = JsonlKeys::new(reader(text)).collect();
        assert_eq!(collected, vec!["P1", "P2"]);
    }

    #[test]
    fn test_collect_keys_from_both_formats() {
        let dir = TempDir::new().unwrap();
        let object_path = dir.path().join("uniprot2text.json");
        std::fs::write(&object_path, r#"{"P1": "kinase", "P2": "transporter"}"#).unwrap();
        let lines_path = dir.path().join("uniref50.jsonl");
        std::fs::write(&lines_path, "{\"P2\": \"MK\"}\n{oops\n{\"P4\": \"MA\"}\n").unwrap();

        let (object_keys, _) = collect_keys(&object_path).unwrap();
        let (line_keys, line_stats) = collect_keys(&lines_path).unwrap();
        assert_eq!(object_keys, HashSet::from(["P1".to_string(), "P2".to_string()]));
        assert_eq!(line_keys, HashSet::from(["P2".to_string(), "P4".to_string()]));
        assert_eq!(line_stats.malformed_lines, 1);
    }

    #[test]
    fn test_missing_corpus_is_fatal() {
        assert!(collect_keys(Path::new("/no/such/uniprot2seq.json")).is_err());
    }
}
