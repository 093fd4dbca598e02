use anyhow::{Error, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

use ligsplit::review::stats::display_dataset_stats;
use ligsplit::review::{compare_id_files, filter_records_by_allow_list};
use ligsplit::{
    execute_curate, execute_make_fasta, execute_split_clusters, execute_split_ligands,
    execute_write_records, read_config,
};

/*=================================================================
=                                  ARGS                           =
=================================================================*/

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct ArgParser {
    #[clap(subcommand)]
    command: Commands,

    #[arg(long, default_value_t = 0)]
    threads: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Select the proteins that have a sequence, a text and at least one ligand
    Curate {
        #[arg(required = true, long)]
        config: PathBuf,
    },

    /// Split homology clusters into train/val/test
    SplitClusters {
        #[arg(required = true, long)]
        config: PathBuf,
    },

    /// Pick held-out val/test ligands from the eval clusters
    SplitLigands {
        #[arg(required = true, long)]
        config: PathBuf,
    },

    /// Emit the tokenized dataset files from the persisted splits
    WriteRecords {
        #[arg(required = true, long)]
        config: PathBuf,
    },

    /// Run curate, split-clusters, split-ligands and write-records in order
    Run {
        #[arg(required = true, long)]
        config: PathBuf,
    },

    /// Write the selected proteins' sequences as FASTA
    MakeFasta {
        #[arg(required = true, long)]
        config: PathBuf,

        #[arg(long, help = "Output path (default: <work_dir>/output_sequences.fasta)")]
        output: Option<PathBuf>,
    },

    /// Compare two ID lists
    CompareIds {
        #[arg(required = true)]
        first: PathBuf,

        #[arg(required = true)]
        second: PathBuf,
    },

    /// Keep only the records whose (protein, ligand) pair is in an allow list
    FilterRecords {
        #[arg(required = true, long)]
        input: PathBuf,

        #[arg(required = true, long)]
        output: PathBuf,

        #[arg(required = true, long, help = "TSV with a header row: uniprot_id, ligand_id")]
        allow_list: PathBuf,
    },

    /// Show record/protein/ligand counts for emitted dataset files
    Stats {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, help = "Write CSV files to this directory instead of printing")]
        output_dir: Option<PathBuf>,
    },
}

/*=================================================================
=                                 MAIN                            =
=================================================================*/

fn run_pipeline(config_path: &PathBuf) -> Result<(), Error> {
    let start_main = Instant::now();
    let config = read_config(config_path)?;
    execute_curate(&config)?;
    execute_split_clusters(&config)?;
    execute_split_ligands(&config)?;
    execute_write_records(&config)?;
    println!("Pipeline completed in {:.2}s", start_main.elapsed().as_secs_f64());
    Ok(())
}

fn main() {
    let args = ArgParser::parse();
    let threads = args.threads;
    if threads != 0 {
        std::env::set_var("RAYON_NUM_THREADS", threads.to_string());
    }

    let result: Result<(), Error> = match &args.command {
        Commands::Curate { config } => read_config(config).and_then(|c| execute_curate(&c).map(|_| ())),
        Commands::SplitClusters { config } => {
            read_config(config).and_then(|c| execute_split_clusters(&c).map(|_| ()))
        }
        Commands::SplitLigands { config } => {
            read_config(config).and_then(|c| execute_split_ligands(&c).map(|_| ()))
        }
        Commands::WriteRecords { config } => {
            read_config(config).and_then(|c| execute_write_records(&c).map(|_| ()))
        }
        Commands::Run { config } => run_pipeline(config),
        Commands::MakeFasta { config, output } => {
            read_config(config).and_then(|c| execute_make_fasta(&c, output.as_ref()).map(|_| ()))
        }
        Commands::CompareIds { first, second } => compare_id_files(first, second).map(|_| ()),
        Commands::FilterRecords { input, output, allow_list } => {
            filter_records_by_allow_list(input, output, allow_list).map(|_| ())
        }
        Commands::Stats { files, output_dir } => {
            display_dataset_stats(files, output_dir.as_deref()).map(|_| ())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
