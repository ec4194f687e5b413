use std::path::{Path, PathBuf};

use anyhow::Context;
use cilpatch::patch::{fix_filestreams, FixFileStreamsRequest, PatchConfig, PatchReport};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    output::{print_output, render_table},
};

pub struct FixOptions<'a> {
    pub input: &'a Path,
    pub output: Option<&'a Path>,
    pub search_dirs: &'a [PathBuf],
    pub search_input_dir: bool,
    pub dry_run: bool,
    pub types: &'a [String],
}

#[derive(Debug, Serialize)]
struct FixReport {
    input: String,
    output: String,
    written: bool,
    types_visited: usize,
    methods_visited: usize,
    call_sites: usize,
    methods: Vec<MethodReport>,
}

#[derive(Debug, Serialize)]
struct MethodReport {
    token: String,
    name: String,
    call_sites: usize,
}

pub fn run(opts: &FixOptions, global: &GlobalOptions) -> anyhow::Result<()> {
    let mut request = FixFileStreamsRequest::new(opts.input, opts.types.to_vec());
    if let Some(output) = opts.output {
        request = request.with_output(output);
    }

    let config = opts
        .search_dirs
        .iter()
        .fold(PatchConfig::default(), |config, dir| config.with_search_dir(dir))
        .with_search_input_dir(opts.search_input_dir)
        .with_dry_run(opts.dry_run);

    let report = fix_filestreams(&request, &config)
        .with_context(|| format!("failed to patch {}", opts.input.display()))?;

    print_output(&build_report(opts.input, &report), global, display)
}

fn build_report(input: &Path, report: &PatchReport) -> FixReport {
    FixReport {
        input: input.display().to_string(),
        output: report.output.display().to_string(),
        written: report.written,
        types_visited: report.types_visited,
        methods_visited: report.methods_visited,
        call_sites: report.call_sites,
        methods: report
            .methods
            .iter()
            .map(|method| MethodReport {
                token: method.method.to_string(),
                name: method.name.clone(),
                call_sites: method.call_sites,
            })
            .collect(),
    }
}

fn display(report: &FixReport) {
    if report.methods.is_empty() {
        println!("No FileStream call sites found");
    } else {
        let rows = report
            .methods
            .iter()
            .map(|method| {
                vec![
                    method.token.clone(),
                    method.name.clone(),
                    method.call_sites.to_string(),
                ]
            })
            .collect();
        println!("{}\n", render_table(&["TOKEN", "METHOD", "SITES"], &[2], rows));
    }

    println!(
        "{} call site(s) in {} of {} method(s), {} type(s) visited",
        report.call_sites,
        report.methods.len(),
        report.methods_visited,
        report.types_visited
    );
    if report.written {
        println!("Written to {}", report.output);
    } else {
        println!("Dry run, {} not written", report.output);
    }
}
