use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// cilpatch - rewrite FileStream constructor calls in compiled .NET assemblies
#[derive(Debug, Parser)]
#[command(name = "cilpatch", version, about, long_about = None)]
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
    /// Make FileStream constructors in the given types open files read-only.
    FixFilestreams {
        /// Assembly (.dll or .exe) to patch.
        #[arg(short, long = "infile", value_name = "INFILE")]
        input: PathBuf,

        /// Where to write the patched module (defaults to patching INFILE in place).
        #[arg(short, long = "outfile", value_name = "OUTFILE")]
        output: Option<PathBuf>,

        /// Additional directory to search for referenced assemblies (repeatable).
        #[arg(long = "search-dir", value_name = "DIR")]
        search_dirs: Vec<PathBuf>,

        /// Do not search the input module's directory for referenced assemblies.
        #[arg(long)]
        no_input_dir: bool,

        /// Report what would be patched without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Types whose methods (and nested types' methods) are patched.
        #[arg(value_name = "TYPE", required = true)]
        types: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fix_filestreams() {
        let cli = Cli::parse_from([
            "cilpatch",
            "fix-filestreams",
            "-i",
            "Game.exe",
            "--search-dir",
            "/usr/lib/mono/4.5",
            "--dry-run",
            "Worker",
            "Game.Settings",
        ]);

        let Command::FixFilestreams {
            input,
            output,
            search_dirs,
            no_input_dir,
            dry_run,
            types,
        } = cli.command;
        assert_eq!(input, PathBuf::from("Game.exe"));
        assert_eq!(output, None);
        assert_eq!(search_dirs, vec![PathBuf::from("/usr/lib/mono/4.5")]);
        assert!(!no_input_dir);
        assert!(dry_run);
        assert_eq!(types, vec!["Worker", "Game.Settings"]);
    }

    #[test]
    fn types_are_required() {
        assert!(Cli::try_parse_from(["cilpatch", "fix-filestreams", "-i", "Game.exe"]).is_err());
    }
}
