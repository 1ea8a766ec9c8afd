mod app;
mod commands;
mod output;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })
    .expect("failed to set Ctrl+C handler");

    let cli = Cli::parse();

    // Show corespace info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("corespace", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    match &cli.command {
        Command::Layout {
            arch,
            linkage_table,
        } => commands::layout::run(arch.as_deref(), *linkage_table, &cli.global),
        Command::Check => commands::check::run(&cli.global),
        Command::Inspect { path } => commands::inspect::run(path, &cli.global),
        Command::Probe { arch, occupy } => commands::probe::run(arch.as_deref(), occupy, &cli.global),
    }
}
