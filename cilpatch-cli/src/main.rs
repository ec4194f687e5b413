mod app;
mod commands;
mod output;

use clap::Parser;
use log::LevelFilter;

use crate::app::{Cli, Command, GlobalOptions};

/// Library logs go to stderr, so `--json` output on stdout stays parseable.
fn init_logging(global: &GlobalOptions) {
    if global.json {
        return;
    }

    let level = match global.verbose {
        true => LevelFilter::Debug,
        false => LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_module("cilpatch", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })
    .expect("failed to set Ctrl+C handler");

    let cli = Cli::parse();
    init_logging(&cli.global);

    match &cli.command {
        Command::FixFilestreams {
            input,
            output,
            search_dirs,
            no_input_dir,
            dry_run,
            types,
        } => {
            let options = commands::fix_filestreams::FixOptions {
                input,
                output: output.as_deref(),
                search_dirs,
                search_input_dir: !*no_input_dir,
                dry_run: *dry_run,
                types,
            };
            commands::fix_filestreams::run(&options, &cli.global)
        }
    }
}
