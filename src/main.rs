//! dmarc-digest - DMARC aggregate report store and analyzer
//!
//! Ingests aggregate report attachments (ZIP, GZIP or plain XML) into a local
//! SQLite database and answers compliance questions over everything stored.
//!
//! Results are printed in one of three formats: Table, CSV, or JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use dmarc_digest::models::{DkimResult, Report};
use dmarc_digest::{config, encode, Attachment, Config, Store};
use prettytable::{Cell, Row, Table};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// CLI arguments for dmarc-digest.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "DMARC aggregate report store and analyzer",
    long_about = "dmarc-digest ingests DMARC aggregate reports (zip, gzip or xml), evaluates \
                  SPF/DKIM alignment for every record, stores each report once, and reports \
                  compliance statistics across everything ingested."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to a JSON configuration file
    #[arg(short, long, global = true, env = "DMARC_CONFIG")]
    config: Option<PathBuf>,

    /// Database path (overrides configuration)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Output format: table, csv, json
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest report attachments into the database
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Decode and evaluate a report without storing it
    Parse { file: PathBuf },
    /// Print a stored report as aggregate-report XML
    Export { id: i64 },
    /// Overall compliance statistics
    Stats,
    /// List stored reports, most recent first
    Reports {
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show one stored report
    Show { id: i64 },
    /// Source IPs ranked by message volume
    TopIps {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Per-domain compliance
    Domains,
    /// Report counts per reporting organization
    Orgs,
    /// Message counts per SPF result
    Spf,
    /// Message counts per DKIM result
    Dkim,
    /// Write a sample configuration file
    InitConfig { path: PathBuf },
}

/// Supported output formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputFormat {
    Table,
    Csv,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

/// One flattened record, for table and CSV output.
#[derive(Debug, Serialize)]
struct RecordRow {
    source_ip: String,
    count: u32,
    header_from: String,
    disposition: String,
    spf: String,
    dkim: String,
    compliant: bool,
}

impl RecordRow {
    fn from_report(report: &Report) -> Vec<RecordRow> {
        report
            .records
            .iter()
            .map(|r| RecordRow {
                source_ip: r.source_ip.to_string(),
                count: r.count,
                header_from: r.header_from.clone(),
                disposition: r.policy_evaluated.disposition.clone(),
                spf: if r.spf.is_empty() {
                    "No SPF record".to_string()
                } else {
                    r.spf
                        .iter()
                        .map(|s| format!("{}:{}", s.domain, s.result))
                        .collect::<Vec<_>>()
                        .join(", ")
                },
                dkim: if r.dkim.is_empty() {
                    "No DKIM signature".to_string()
                } else {
                    r.dkim
                        .iter()
                        .map(format_dkim)
                        .collect::<Vec<_>>()
                        .join(", ")
                },
                compliant: r.compliance.map(|c| c.compliant).unwrap_or(false),
            })
            .collect()
    }
}

/// Formats a DKIM result into a clear, human-readable string.
fn format_dkim(d: &DkimResult) -> String {
    if d.selector.trim().is_empty() {
        format!("{}:{}", d.domain, d.result)
    } else {
        format!("{} (selector: {}): {}", d.domain, d.selector, d.result)
    }
}

/// Prints `rows` in the chosen format; `headers` and `cells` drive the table layout.
fn emit<T: Serialize>(
    format: &OutputFormat,
    rows: &[T],
    headers: &[&str],
    cells: impl Fn(&T) -> Vec<String>,
) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rows)?),
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(std::io::stdout());
            for r in rows {
                wtr.serialize(r)?;
            }
            wtr.flush()?;
        }
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "No data.".yellow());
                return Ok(());
            }
            let mut table = Table::new();
            table.add_row(Row::new(headers.iter().map(|h| Cell::new(h)).collect()));
            for r in rows {
                table.add_row(Row::new(cells(r).iter().map(|c| Cell::new(c)).collect()));
            }
            table.printstd();
        }
    }
    Ok(())
}

fn print_report(format: &OutputFormat, report: &Report) -> Result<()> {
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    if let OutputFormat::Table = format {
        let meta = &report.metadata;
        let policy = &report.policy;
        println!("{}", "DMARC Report".bold().blue());
        println!("{}", "----------------------------".dimmed());
        println!("{}: {} ({})", "Organization".bold(), meta.org_name, meta.email);
        println!("{}: {}", "Report ID".bold(), meta.report_id);
        println!("{}: {} - {}", "Period".bold(), meta.date_begin, meta.date_end);
        println!("{}: {}", "Domain".bold(), policy.domain);
        println!("{}: {}", "SPF Alignment".bold(), policy.spf_alignment());
        println!("{}: {}", "DKIM Alignment".bold(), policy.dkim_alignment());
        println!("{}: {}", "Policy".bold(), policy.policy);
        println!("{}: {}", "Percentage Applied".bold(), policy.pct);
        println!(
            "{}: {} of {} ({:.1}%)\n",
            "Compliant Messages".bold(),
            report.compliant_count(),
            report.total_messages(),
            report.compliance_rate()
        );
    }
    let rows = RecordRow::from_report(report);
    emit(
        format,
        &rows,
        &["Source IP", "Count", "Header From", "SPF", "DKIM", "Compliant"],
        |r| {
            vec![
                r.source_ip.clone(),
                r.count.to_string(),
                r.header_from.clone(),
                r.spf.clone(),
                r.dkim.clone(),
                if r.compliant { "yes".green().to_string() } else { "no".red().to_string() },
            ]
        },
    )
}

fn rate(r: f64) -> String {
    format!("{:.1}%", r)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity.
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(if cli.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    if let Command::InitConfig { path } = &cli.command {
        config::write_sample(path)?;
        println!("Sample configuration written to {}", path.display());
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db) = &cli.database {
        config.database_path = db.clone();
    }

    if let Command::Parse { file } = &cli.command {
        let data = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
        let report = dmarc_digest::decode_and_evaluate(&data, &config)
            .with_context(|| format!("Failed to parse {}", file.display()))?;
        return print_report(&cli.output, &report);
    }

    config.ensure_database_dir()?;
    let store = Store::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    let result = run(&cli, &config, &store).await;
    store.close().await;
    result
}

async fn run(cli: &Cli, config: &Config, store: &Store) -> Result<()> {
    let format = &cli.output;
    match &cli.command {
        Command::Ingest { files } => {
            let mut attachments = Vec::with_capacity(files.len());
            for file in files {
                log::info!("Processing file: {}", file.display());
                let data = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
                attachments.push(Attachment {
                    name: file.display().to_string(),
                    data,
                });
            }
            let summary = dmarc_digest::ingest_batch(store, &attachments, config).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                _ => {
                    println!(
                        "{} {} inserted, {} already stored, {} failed",
                        "Ingest complete:".bold().cyan(),
                        summary.inserted,
                        summary.skipped,
                        summary.failed.len()
                    );
                    for (name, error) in &summary.failed {
                        println!("  {} {}: {}", "x".red(), name, error);
                    }
                }
            }
        }
        Command::Show { id } => {
            let report = store.get_by_id(*id).await?;
            print_report(format, &report)?;
        }
        Command::Export { id } => {
            let report = store.get_by_id(*id).await?;
            print!("{}", encode::to_xml(&report));
        }
        Command::Stats => {
            let stats = store.statistics().await?;
            emit(
                format,
                std::slice::from_ref(&stats),
                &["Reports", "Messages", "Compliance", "Source IPs", "Domains"],
                |s| {
                    vec![
                        s.total_reports.to_string(),
                        s.total_messages.to_string(),
                        rate(s.compliance_rate),
                        s.unique_source_ips.to_string(),
                        s.unique_domains.to_string(),
                    ]
                },
            )?;
        }
        Command::Reports { limit, offset } => {
            let reports = store.list(*limit, *offset).await?;
            emit(
                format,
                &reports,
                &["ID", "Organization", "Domain", "Begin", "End", "Messages", "Compliance"],
                |r| {
                    vec![
                        r.id.to_string(),
                        r.org_name.clone(),
                        r.domain.clone(),
                        r.period_begin.format("%Y-%m-%d %H:%M").to_string(),
                        r.period_end.format("%Y-%m-%d %H:%M").to_string(),
                        r.total_messages.to_string(),
                        rate(r.compliance_rate),
                    ]
                },
            )?;
        }
        Command::TopIps { limit } => {
            let ips = store.top_source_ips(*limit).await?;
            emit(format, &ips, &["Source IP", "Messages", "Pass", "Fail"], |r| {
                vec![
                    r.ip.clone(),
                    r.total_count.to_string(),
                    r.pass_count.to_string(),
                    r.fail_count.to_string(),
                ]
            })?;
        }
        Command::Domains => {
            let domains = store.domain_stats().await?;
            emit(format, &domains, &["Domain", "Messages", "Compliant", "Compliance"], |d| {
                vec![
                    d.domain.clone(),
                    d.total_messages.to_string(),
                    d.compliant_messages.to_string(),
                    rate(d.compliance_rate),
                ]
            })?;
        }
        Command::Orgs => {
            let orgs = store.org_stats().await?;
            emit(format, &orgs, &["Organization", "Reports"], |o| {
                vec![o.org_name.clone(), o.report_count.to_string()]
            })?;
        }
        Command::Spf | Command::Dkim => {
            let results = if matches!(cli.command, Command::Spf) {
                store.spf_stats().await?
            } else {
                store.dkim_stats().await?
            };
            emit(format, &results, &["Result", "Messages"], |r| {
                vec![r.result.clone(), r.count.to_string()]
            })?;
        }
        // Handled before the store is opened.
        Command::Parse { .. } | Command::InitConfig { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parsing() {
        assert!(matches!(OutputFormat::from_str("table"), Ok(OutputFormat::Table)));
        assert!(matches!(OutputFormat::from_str("CSV"), Ok(OutputFormat::Csv)));
        assert!(matches!(OutputFormat::from_str("json"), Ok(OutputFormat::Json)));
        assert!(OutputFormat::from_str("invalid").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["dmarc-digest", "--output", "json", "top-ips", "--limit", "5"]).unwrap();
        assert!(matches!(cli.output, OutputFormat::Json));
        assert!(matches!(cli.command, Command::TopIps { limit: 5 }));
        assert!(Cli::try_parse_from(["dmarc-digest", "ingest"]).is_err());
    }

    #[test]
    fn test_config_path_from_environment() {
        std::env::set_var("DMARC_CONFIG", "/etc/dmarc-digest.json");
        let from_env = Cli::try_parse_from(["dmarc-digest", "stats"]).unwrap();
        let from_flag = Cli::try_parse_from(["dmarc-digest", "--config", "local.json", "stats"]).unwrap();
        std::env::remove_var("DMARC_CONFIG");
        assert_eq!(from_env.config, Some(PathBuf::from("/etc/dmarc-digest.json")));
        assert_eq!(from_flag.config, Some(PathBuf::from("local.json")));
    }

    #[test]
    fn test_dkim_formatting() {
        let d = DkimResult {
            domain: "example.com".into(),
            selector: "s1".into(),
            result: dmarc_digest::models::DkimVerdict::Pass,
            raw_result: "pass".into(),
            human_result: None,
        };
        assert_eq!(format_dkim(&d), "example.com (selector: s1): pass");
    }
}
