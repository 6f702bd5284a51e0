use anyhow::{Context, Result};
use clap::Parser;
use reprocheck::cli::CheckArgs;
use reprocheck::config;
use reprocheck::error::{CheckError, EXIT_DIFFERENT, EXIT_REPRODUCIBLE, EXIT_USAGE};
use reprocheck::logging;
use reprocheck::orchestrator::{CheckReport, Orchestrator};
use reprocheck::variations::Registry;
use std::io::Write;

fn main() {
    let args = CheckArgs::parse();
    let code = match run(&args) {
        Ok(code) => code,
        Err(err) => {
            let code = err
                .downcast_ref::<CheckError>()
                .map(CheckError::exit_code)
                .unwrap_or(EXIT_USAGE);
            eprintln!("reprocheck: {err:#}");
            code
        }
    };
    std::process::exit(code);
}

fn run(args: &CheckArgs) -> Result<i32> {
    let registry = Registry::builtin();
    if args.list_variations {
        let mut stdout = std::io::stdout().lock();
        for name in registry.names() {
            writeln!(stdout, "{name}")?;
        }
        return Ok(EXIT_REPRODUCIBLE);
    }

    let settings = config::resolve(args, &registry)?;
    logging::init(settings.verbosity);
    tracing::debug!(settings = ?settings, "resolved settings");

    let report = Orchestrator::new(&settings).run()?;
    if settings.json {
        let text = serde_json::to_string_pretty(&report).context("serialize report")?;
        println!("{text}");
    } else {
        print_summary(&report)?;
    }
    Ok(if report.is_reproducible() {
        EXIT_REPRODUCIBLE
    } else {
        EXIT_DIFFERENT
    })
}

fn print_summary(report: &CheckReport) -> Result<()> {
    let mut out = std::io::stdout().lock();
    for name in &report.applied {
        writeln!(out, "variation {name}: applied")?;
    }
    for skipped in &report.skipped {
        writeln!(
            out,
            "variation {}: skipped (testbed lacks {})",
            skipped.name, skipped.missing
        )?;
    }
    if !report.reverted {
        writeln!(out, "experiment ran in a fresh testbed session")?;
    }
    for (label, digests) in [("control", &report.control), ("experiment", &report.experiment)] {
        for (path, sha256) in digests {
            writeln!(out, "{label} {path} sha256:{sha256}")?;
        }
    }
    if !report.diff_output.is_empty() {
        out.write_all(report.diff_output.as_bytes())?;
        if !report.diff_output.ends_with('\n') {
            writeln!(out)?;
        }
    }
    if let Some(dir) = &report.store_dir {
        writeln!(out, "artifacts kept in {}", dir.display())?;
    }
    if report.is_reproducible() {
        writeln!(out, "reproducible: artifacts are identical")?;
    } else {
        writeln!(out, "not reproducible: artifacts differ")?;
    }
    Ok(())
}
