//! # Warning: Unstable API
//!
//! This library API is unstable and subject to breaking changes without notice.
//! Only the CLI interface is considered stable. Use at your own risk.
//!
//! To use the CLI tool, install with: `cargo install ligsplit`

// Debug logging macro - only prints when config.debug is true
#[macro_export]
macro_rules! debug_println {
    ($config:expr, $($arg:tt)*) => {
        if $config.debug {
            println!($($arg)*);
        }
    };
}

#[doc(hidden)]
pub mod clusters;
#[doc(hidden)]
pub mod config;
#[doc(hidden)]
pub mod fasta;
#[doc(hidden)]
pub mod io;
#[doc(hidden)]
pub mod keys;
#[doc(hidden)]
pub mod ligands;
#[doc(hidden)]
pub mod partial;
#[doc(hidden)]
pub mod records;
#[doc(hidden)]
pub mod review;
#[doc(hidden)]
pub mod sets;
#[doc(hidden)]
pub mod tokenizer;

// Re-export stage entry points for convenience (also hidden from docs)
#[doc(hidden)]
pub use clusters::execute_split_clusters;
#[doc(hidden)]
pub use config::{read_config, Config};
#[doc(hidden)]
pub use fasta::execute_make_fasta;
#[doc(hidden)]
pub use ligands::execute_split_ligands;
#[doc(hidden)]
pub use records::execute_write_records;
#[doc(hidden)]
pub use sets::execute_curate;
