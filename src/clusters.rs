// Cluster ingest and the cluster-level train/val/test split.
//
// The mapping file is a header-less TSV of (cluster_id, entity_id) membership edges. Splits
// are drawn over whole clusters so near-duplicate proteins never straddle train and eval.

use anyhow::{bail, Context, Error, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;
use std::time::Instant;

use crate::config::{validate_buckets, Config, SizeBucket, Split, SPLIT_CLUSTERS_SUMMARY_FILE};
use crate::io::{format_number_with_commas, open_reader, read_id_list, write_id_list, write_summary};

const MAX_ANOMALY_EXAMPLES: usize = 20;

/*=================================================================
=                          CLUSTER INGEST                         =
=================================================================*/

/// cluster_id -> member entity IDs. Every entity belongs to exactly one cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterPartition {
    clusters: HashMap<String, HashSet<String>>,
}

impl ClusterPartition {
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn members(&self, cluster_id: &str) -> Option<&HashSet<String>> {
        self.clusters.get(cluster_id)
    }

    pub fn total_members(&self) -> usize {
        self.clusters.values().map(|m| m.len()).sum()
    }

    /// (cluster_id, size) sorted by cluster ID.
    pub fn sizes(&self) -> Vec<(String, usize)> {
        let mut sizes: Vec<(String, usize)> = self
            .clusters
            .iter()
            .map(|(id, members)| (id.clone(), members.len()))
            .collect();
        sizes.sort();
        sizes
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HashSet<String>)> {
        self.clusters.iter()
    }
}

impl FromIterator<(String, HashSet<String>)> for ClusterPartition {
    fn from_iter<I: IntoIterator<Item = (String, HashSet<String>)>>(iter: I) -> Self {
        ClusterPartition { clusters: iter.into_iter().collect() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub rows: usize,
    pub short_rows: usize,
    pub duplicate_rows: usize,
    /// Entities listed under more than one cluster. They stay in the first one.
    pub anomalies: usize,
    /// (entity, kept cluster, ignored cluster)
    pub anomaly_examples: Vec<(String, String, String)>,
}

/// Builds a partition from TSV rows in a single pass, keeping only clusters accepted by
/// `keep_cluster`. An entity's cluster is its first one over the whole file, whether or
/// not that cluster is kept. Short or empty rows are skipped; read failures are fatal.
pub fn ingest_clusters<R, F>(mut reader: R, keep_cluster: F) -> Result<(ClusterPartition, IngestStats), Error>
where
    R: BufRead,
    F: Fn(&str) -> bool,
{
    let mut clusters: HashMap<String, HashSet<String>> = HashMap::new();
    let mut first_cluster: HashMap<String, String> = HashMap::new();
    let mut stats = IngestStats::default();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        stats.rows += 1;

        let Ok(line) = std::str::from_utf8(&buf) else {
            stats.short_rows += 1;
            continue;
        };
        let mut fields = line.trim_end_matches(['\n', '\r']).split('\t');
        let (Some(cluster_id), Some(entity_id)) = (fields.next(), fields.next()) else {
            stats.short_rows += 1;
            continue;
        };
        let (cluster_id, entity_id) = (cluster_id.trim(), entity_id.trim());
        if cluster_id.is_empty() || entity_id.is_empty() {
            stats.short_rows += 1;
            continue;
        }
        // Membership is settled on every row; the filter only decides what is returned
        match first_cluster.get(entity_id) {
            Some(kept) if kept == cluster_id => stats.duplicate_rows += 1,
            Some(kept) => {
                stats.anomalies += 1;
                if stats.anomaly_examples.len() < MAX_ANOMALY_EXAMPLES {
                    stats.anomaly_examples.push((
                        entity_id.to_string(),
                        kept.clone(),
                        cluster_id.to_string(),
                    ));
                }
            }
            None => {
                first_cluster.insert(entity_id.to_string(), cluster_id.to_string());
                if keep_cluster(cluster_id) {
                    clusters
                        .entry(cluster_id.to_string())
                        .or_default()
                        .insert(entity_id.to_string());
                }
            }
        }
    }

    Ok((ClusterPartition { clusters }, stats))
}

pub fn load_cluster_partition(path: &Path) -> Result<(ClusterPartition, IngestStats), Error> {
    let reader = open_reader(path)?;
    let (partition, stats) = ingest_clusters(reader, |_| true)
        .with_context(|| format!("Failed reading cluster mapping {:?}", path))?;
    report_ingest(path, &stats);
    Ok((partition, stats))
}

fn report_ingest(path: &Path, stats: &IngestStats) {
    if stats.short_rows > 0 {
        println!("Skipped {} short or malformed rows in {:?}", stats.short_rows, path);
    }
    if stats.anomalies > 0 {
        println!(
            "Warning: {} entities appear in more than one cluster in {:?}; kept the first cluster",
            stats.anomalies, path
        );
        for (entity, kept, ignored) in &stats.anomaly_examples {
            println!("    {} kept in {}, ignored in {}", entity, kept, ignored);
        }
    }
}

/*=================================================================
=                       SPLIT MEMBERSHIP IO                       =
=================================================================*/

/// Reads the three persisted cluster lists into cluster_id -> split.
/// A cluster listed under two splits means the split files are corrupt.
pub fn read_cluster_splits(config: &Config) -> Result<HashMap<String, Split>, Error> {
    let mut cluster_splits: HashMap<String, Split> = HashMap::new();
    for split in Split::ALL {
        for cluster_id in read_id_list(&config.work_path(split.cluster_file()))? {
            if let Some(previous) = cluster_splits.insert(cluster_id.clone(), split) {
                if previous != split {
                    bail!("Cluster {} is listed in both the {} and {} split files", cluster_id, previous, split);
                }
            }
        }
    }
    Ok(cluster_splits)
}

/// Resolves persisted cluster splits to entity IDs with one pass over the mapping file.
pub fn load_split_entities(
    mapping_path: &Path,
    cluster_splits: &HashMap<String, Split>,
) -> Result<(HashMap<Split, HashSet<String>>, IngestStats), Error> {
    let reader = open_reader(mapping_path)?;
    let (partition, stats) = ingest_clusters(reader, |cluster_id| cluster_splits.contains_key(cluster_id))
        .with_context(|| format!("Failed reading cluster mapping {:?}", mapping_path))?;
    report_ingest(mapping_path, &stats);

    let mut entities: HashMap<Split, HashSet<String>> =
        Split::ALL.iter().map(|split| (*split, HashSet::new())).collect();
    for (cluster_id, members) in partition.iter() {
        let split = cluster_splits[cluster_id];
        entities.entry(split).or_default().extend(members.iter().cloned());
    }
    Ok((entities, stats))
}

/*=================================================================
=                       CLUSTER SPLIT SAMPLER                     =
=================================================================*/

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketDraw {
    pub bucket: String,
    pub available: usize,
    pub requested: usize,
    pub val: usize,
    pub test: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterSplit {
    /// Sorted by cluster ID.
    pub train: Vec<String>,
    /// In draw order, bucket by bucket.
    pub val: Vec<String>,
    pub test: Vec<String>,
    pub draws: Vec<BucketDraw>,
    pub warnings: Vec<String>,
}

/// Draws val/test clusters per size bucket. Within a bucket the first half of the draw goes
/// to val and the rest to test, so both eval splits see the same size distribution.
/// Everything not drawn is train. Candidates are sorted by cluster ID before drawing, so the
/// result depends only on the partition, the buckets and the seed.
pub fn sample_cluster_split(
    partition: &ClusterPartition,
    buckets: &[SizeBucket],
    seed: u64,
) -> Result<ClusterSplit, Error> {
    validate_buckets(buckets, "cluster_buckets")?;

    let sizes = partition.sizes();
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut split = ClusterSplit::default();

    for bucket in buckets {
        let mut matching: Vec<&str> = sizes
            .iter()
            .filter(|(_, size)| bucket.contains(*size))
            .map(|(id, _)| id.as_str())
            .collect();

        let take = bucket.count.min(matching.len());
        if matching.len() < bucket.count {
            let warning = format!(
                "asked for {} clusters in range {}, but only {} available. Sampling all of them.",
                bucket.count,
                bucket,
                matching.len()
            );
            println!("Warning: {}", warning);
            split.warnings.push(warning);
        }

        let (chosen, _) = matching.partial_shuffle(&mut rng, take);
        let half = take / 2;
        split.val.extend(chosen[..half].iter().map(|id| id.to_string()));
        split.test.extend(chosen[half..].iter().map(|id| id.to_string()));

        split.draws.push(BucketDraw {
            bucket: bucket.to_string(),
            available: matching.len(),
            requested: bucket.count,
            val: half,
            test: take - half,
        });
    }

    let held_out: HashSet<&str> = split.val.iter().chain(split.test.iter()).map(|s| s.as_str()).collect();
    split.train = sizes
        .into_iter()
        .map(|(id, _)| id)
        .filter(|id| !held_out.contains(id.as_str()))
        .collect();

    Ok(split)
}

/*=================================================================
=                       SPLIT CLUSTERS STAGE                      =
=================================================================*/

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub clusters: usize,
    pub total_members: usize,
    pub singletons: usize,
    pub largest: Vec<(String, usize)>,
    pub smallest: Vec<(String, usize)>,
}

pub fn cluster_stats(partition: &ClusterPartition) -> ClusterStats {
    let mut sizes = partition.sizes();
    let singletons = sizes.iter().filter(|(_, size)| *size == 1).count();

    // Stable by ID within equal sizes
    sizes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let largest = sizes.iter().take(10).cloned().collect();
    sizes.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    let smallest = sizes.iter().take(10).cloned().collect();

    ClusterStats {
        clusters: partition.len(),
        total_members: partition.total_members(),
        singletons,
        largest,
        smallest,
    }
}

fn display_cluster_stats(stats: &ClusterStats) {
    println!("=== CLUSTER STATISTICS ===");
    println!("Clusters:            {:>15}", format_number_with_commas(stats.clusters));
    println!("Member entities:     {:>15}", format_number_with_commas(stats.total_members));
    println!("Singleton clusters:  {:>15}", format_number_with_commas(stats.singletons));
    println!("Top 10 clusters:");
    for (cluster_id, size) in &stats.largest {
        println!("  Cluster {} has {} sequences.", cluster_id, size);
    }
    println!("Least 10 clusters:");
    for (cluster_id, size) in &stats.smallest {
        println!("  Cluster {} has {} sequences.", cluster_id, size);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitClustersSummary {
    pub ingest: IngestStats,
    pub stats: ClusterStats,
    pub seed: u64,
    pub draws: Vec<BucketDraw>,
    pub warnings: Vec<String>,
    pub train_clusters: usize,
    pub val_clusters: usize,
    pub test_clusters: usize,
}

pub fn execute_split_clusters(config: &Config) -> Result<SplitClustersSummary, Error> {
    println!("Starting cluster split...");
    let start_main = Instant::now();

    let (partition, ingest) = load_cluster_partition(&config.cluster_mapping_path)?;
    let stats = cluster_stats(&partition);
    display_cluster_stats(&stats);

    let split = sample_cluster_split(&partition, &config.cluster_buckets, config.seed)?;
    for draw in &split.draws {
        crate::debug_println!(
            config,
            "  bucket {}: {} available, {} requested, {} val / {} test",
            draw.bucket, draw.available, draw.requested, draw.val, draw.test
        );
    }

    write_id_list(&config.work_path(Split::Val.cluster_file()), &split.val)?;
    write_id_list(&config.work_path(Split::Test.cluster_file()), &split.test)?;
    write_id_list(&config.work_path(Split::Train.cluster_file()), &split.train)?;

    println!(
        "val_clusters has {} clusters, test_clusters has {} clusters.",
        split.val.len(),
        split.test.len()
    );
    println!("train_clusters has {} clusters.", format_number_with_commas(split.train.len()));

    let summary = SplitClustersSummary {
        ingest,
        stats,
        seed: config.seed,
        train_clusters: split.train.len(),
        val_clusters: split.val.len(),
        test_clusters: split.test.len(),
        draws: split.draws,
        warnings: split.warnings,
    };
    write_summary(&config.work_path(SPLIT_CLUSTERS_SUMMARY_FILE), &summary)?;

    println!("Cluster split completed in {:.2}s", start_main.elapsed().as_secs_f64());
    Ok(summary)
}
