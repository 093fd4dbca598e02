use anyhow::Result;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use ligsplit::{read_config, Config};

pub const CORPUS_FILES: [&str; 6] = [
    "protein2ligand_id.json",
    "uniprot2seq.json",
    "uniref50.jsonl",
    "uniprot2text.json",
    "ligand2smiles.json",
    "clusterRes_cluster.tsv",
];

pub struct TestEnvironment {
    _temp_dir: TempDir, // Prefixed with _ to indicate it's kept for Drop cleanup
    pub data_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub config_path: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let data_dir = temp_dir.path().join("data");
        let work_dir = temp_dir.path().join("work");
        let output_dir = temp_dir.path().join("output");
        let config_path = temp_dir.path().join("config.yaml");

        fs::create_dir_all(&data_dir)?;

        Ok(TestEnvironment {
            _temp_dir: temp_dir,
            data_dir,
            work_dir,
            output_dir,
            config_path,
        })
    }

    pub fn config(&self) -> Result<Config> {
        read_config(&self.config_path)
    }

    pub fn work_file(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    pub fn output_file(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }
}

/// Copy a fixture file to the test environment
pub fn copy_fixture(fixture_path: &str, dest_dir: &Path) -> Result<PathBuf> {
    let fixture_full_path = PathBuf::from("tests/fixtures").join(fixture_path);

    if !fixture_full_path.exists() {
        anyhow::bail!("Fixture file not found: {:?}", fixture_full_path);
    }

    let file_name = fixture_full_path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Invalid fixture path"))?;

    let dest_path = dest_dir.join(file_name);
    fs::copy(&fixture_full_path, &dest_path)?;

    Ok(dest_path)
}

/// Copy a config fixture and point it at the test directories
pub fn copy_and_update_config(
    config_fixture: &str,
    env: &TestEnvironment,
    overrides: &[(&str, serde_yaml::Value)],
) -> Result<()> {
    let fixture_path = PathBuf::from("tests/fixtures/configs").join(config_fixture);

    if !fixture_path.exists() {
        anyhow::bail!("Config fixture not found: {:?}", fixture_path);
    }

    let config_content = fs::read_to_string(&fixture_path)?;
    let mut config: HashMap<String, serde_yaml::Value> = serde_yaml::from_str(&config_content)?;

    let path_value = |path: PathBuf| serde_yaml::Value::String(path.to_string_lossy().to_string());
    let data = |name: &str| path_value(env.data_dir.join(name));

    config.insert("protein2ligand_path".to_string(), data("protein2ligand_id.json"));
    config.insert("sequence_path".to_string(), data("uniprot2seq.json"));
    config.insert("fallback_sequence_path".to_string(), data("uniref50.jsonl"));
    config.insert("text_path".to_string(), data("uniprot2text.json"));
    config.insert("structure_path".to_string(), data("ligand2smiles.json"));
    config.insert("cluster_mapping_path".to_string(), data("clusterRes_cluster.tsv"));
    config.insert("work_dir".to_string(), path_value(env.work_dir.clone()));
    config.insert("output_dir".to_string(), path_value(env.output_dir.clone()));

    for (key, value) in overrides {
        config.insert(key.to_string(), value.clone());
    }

    let yaml_content = serde_yaml::to_string(&config)?;
    let mut file = File::create(&env.config_path)?;
    file.write_all(yaml_content.as_bytes())?;

    Ok(())
}

/// Setup test environment with the corpus fixtures and a config
pub fn setup_test_with_fixtures(
    config_fixture: &str,
    overrides: &[(&str, serde_yaml::Value)],
) -> Result<TestEnvironment> {
    let env = TestEnvironment::new()?;

    for name in CORPUS_FILES {
        copy_fixture(&format!("corpus/{}", name), &env.data_dir)?;
    }
    copy_and_update_config(config_fixture, &env, overrides)?;

    Ok(env)
}

pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content.lines().map(|line| line.to_string()).collect())
}

pub fn read_set(path: &Path) -> Result<HashSet<String>> {
    Ok(read_lines(path)?.into_iter().collect())
}

pub fn read_records(path: &Path) -> Result<Vec<Value>> {
    let mut records = Vec::new();
    for line in read_lines(path)? {
        if !line.trim().is_empty() {
            records.push(serde_json::from_str(&line)?);
        }
    }
    Ok(records)
}

#[allow(dead_code)]
pub fn record_proteins(records: &[Value]) -> HashSet<String> {
    records
        .iter()
        .filter_map(|r| r["uniprot_id"].as_str().map(|s| s.to_string()))
        .collect()
}

#[allow(dead_code)]
pub fn record_ligands(records: &[Value]) -> HashSet<String> {
    records
        .iter()
        .filter_map(|r| r["input"]["ligand_id"].as_str().map(|s| s.to_string()))
        .collect()
}
