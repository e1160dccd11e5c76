use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{value_parser, Arg, ArgAction, Command};
use log::LevelFilter;
use mailsift::diagnostics::DiagnosticKind;
use mailsift::{
    ArchiveStatistics, Conversation, DiagnosticsReport, DocumentLoader, Pipeline, PipelineConfig,
    PipelineError,
};
use serde::Serialize;
use std::io::{self, Write};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const TOP_IDENTITIES: usize = 20;

#[derive(Serialize)]
struct Export<'a> {
    conversations: &'a [Conversation],
    diagnostics: &'a DiagnosticsReport,
    statistics: &'a ArchiveStatistics,
    generated_at: DateTime<Utc>,
}

fn main() {
    let matches = Command::new("mailsift")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Rebuilds email threads from OCR'd legal-disclosure text files")
        .long_about(
            "mailsift reads folders of OCR'd email text, repairs common OCR damage,\n\
             extracts headers, merges duplicate copies of the same message and\n\
             groups the result into conversations. Output is a single JSON document.",
        )
        .arg(
            Arg::new("folders")
                .value_name("FOLDER")
                .help("Folders of .txt documents to process")
                .num_args(1..)
                .action(ArgAction::Append)
                .required_unless_present_any(["generate-config", "test-config"]),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (built-in defaults when absent)"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Write JSON output to FILE instead of stdout")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Print archive statistics after the run (stderr unless --output is set)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("failures")
                .long("failures")
                .help("List documents that produced no email (stderr unless --output is set)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("workers")
                .short('j')
                .long("workers")
                .value_name("N")
                .help("Number of extraction worker threads")
                .value_parser(value_parser!(usize))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging of per-document decisions")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let mut config = match load_config(matches.get_one::<String>("config")) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config.logging.level.parse().unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.workers = Some(*workers);
    }

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    let pipeline = match Pipeline::new(config.clone()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("❌ {e}");
            process::exit(1);
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || {
        log::warn!("Received interrupt, stopping at the next stage boundary");
        flag.store(true, Ordering::SeqCst);
    }) {
        log::warn!("Failed to install interrupt handler: {e}");
    }

    let folders: Vec<String> = matches
        .get_many::<String>("folders")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let batch = DocumentLoader::load_dirs(&folders);
    log::info!("Loaded {} documents from {} folders", batch.len(), folders.len());

    let output = match pipeline.run_batch(batch, &cancel) {
        Ok(output) => output,
        Err(e @ PipelineError::Cancelled { .. }) => {
            eprintln!("⚠️  {e}");
            process::exit(130);
        }
        Err(e) => {
            eprintln!("❌ {e}");
            process::exit(1);
        }
    };

    let statistics = output.statistics(&config, TOP_IDENTITIES);
    let export = Export {
        conversations: &output.conversations,
        diagnostics: &output.diagnostics,
        statistics: &statistics,
        generated_at: Utc::now(),
    };
    if let Err(e) = write_output(matches.get_one::<String>("output"), &export) {
        eprintln!("❌ {e:#}");
        process::exit(1);
    }

    // Reports share stdout only when the JSON went to a file.
    let json_on_stdout = matches.get_one::<String>("output").is_none();
    let mut report_out: Box<dyn Write> = if json_on_stdout {
        Box::new(io::stderr())
    } else {
        Box::new(io::stdout())
    };

    if matches.get_flag("stats") {
        let written = writeln!(report_out).and_then(|_| statistics.write_summary(&mut report_out));
        if let Err(e) = written {
            log::warn!("Failed to write statistics: {e}");
        }
    }

    if matches.get_flag("failures") {
        if let Err(e) = write_failures(&mut report_out, &output.diagnostics) {
            log::warn!("Failed to write failure report: {e}");
        }
    }
}

fn load_config(path: Option<&String>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_file(path),
        None => Ok(PipelineConfig::default()),
    }
}

fn generate_default_config(path: &str) {
    let config = PipelineConfig::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your archive.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn test_config(config: &PipelineConfig) {
    println!("🔍 Testing configuration...");
    println!();
    println!("Header scan window: {} lines", config.detection.header_scan_lines);
    println!("Date patterns: {}", config.extraction.date_formats.len());
    println!(
        "Principal addresses: {}",
        config.extraction.principal_addresses.join(", ")
    );
    println!(
        "Corrections: {} domain, {} address, {} name",
        config.normalization.domain_corrections.len(),
        config.normalization.address_corrections.len(),
        config.extraction.name_corrections.len()
    );
    println!("Fingerprint body prefix: {} chars", config.dedup.fingerprint_prefix_len);
    println!(
        "Proximity window: {} hours",
        config.threading.proximity_window_hours
    );

    match config.validate() {
        Ok(()) => println!("✅ Configuration is valid"),
        Err(e) => {
            println!("❌ Configuration validation failed:");
            println!("Error: {e}");
            process::exit(1);
        }
    }
}

fn write_output(path: Option<&String>, export: &Export) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(export).context("Failed to serialize output")?;
    match path {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write output file: {path}"))?;
            log::info!("Output written to {path}");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn write_failures(out: &mut dyn Write, report: &DiagnosticsReport) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "📋 {report}")?;
    if report.failures.is_empty() {
        writeln!(out, "✅ Every document produced at least one email")?;
        return Ok(());
    }

    for (kind, title) in [
        (DiagnosticKind::UnparseableDocument, "Unparseable documents"),
        (DiagnosticKind::ExtractionFailure, "Extraction failures"),
    ] {
        let failures: Vec<_> = report.failures_of(kind).collect();
        if failures.is_empty() {
            continue;
        }
        writeln!(out)?;
        writeln!(out, "{} ({} total):", title, failures.len())?;
        writeln!(out, "═══════════════════════════════════════")?;
        for failure in failures {
            writeln!(out, "  • {}: {}", failure.source_path, failure.reason)?;
        }
    }
    Ok(())
}
