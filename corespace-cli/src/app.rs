use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// corespace - fixed-address space layouts and core images
#[derive(Debug, Parser)]
#[command(name = "corespace", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the space layout of an architecture.
    Layout {
        /// Architecture: x86, x86_64, aarch64, ppc, sparc or hppa. Defaults to the host.
        #[arg(short, long)]
        arch: Option<String>,

        /// Include the foreign linkage table regardless of the build configuration.
        #[arg(long)]
        linkage_table: bool,
    },

    /// Check every architecture's layout for overlapping or unaligned spaces.
    Check,

    /// List the core sections of an object file or saved executable.
    Inspect {
        /// Path to the ELF file.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// Validate a layout against a simulated address space, without mapping anything.
    Probe {
        /// Architecture: x86, x86_64, aarch64, ppc, sparc or hppa. Defaults to the host.
        #[arg(short, long)]
        arch: Option<String>,

        /// Mark a page as taken before validating (hex like 0x28000000 or decimal). Repeatable.
        #[arg(long, value_name = "ADDRESS")]
        occupy: Vec<String>,
    },
}
