//! Parcel analysis command line interface.
//!
//! # Usage
//!
//! ```bash
//! # Full analysis of a parcel defined in a fixture
//! parcel_cli --fixture fixtures/demo_parcel.yaml analyze 6266-1234
//!
//! # Consolidated rules for a zone, as JSON
//! parcel_cli --fixture fixtures/demo_parcel.yaml --json rules --zone SION-R2
//!
//! # Against the database (feature `database`)
//! parcel_cli analyze 6266-1234 --wkt "POLYGON((...))"
//! parcel_cli quality-report --days 7
//! parcel_cli purge-cache
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use serde::Serialize;

use parcel_core::calculator::{CalcOutput, ControlLevel};
use parcel_core::context::ContextFlag;
use parcel_core::quality::QualityReport;
use parcel_core::{AnalysisReport, AnalysisRequest, RuleQuery, Severity, ZoneResolution};
use parcel_engine::{backend, telemetry, AppConfig, Backend};

#[derive(Parser)]
#[command(name = "parcel_cli")]
#[command(version)]
#[command(about = "Zoning rule resolution, build indicators and context flags for land parcels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Seed in-memory stores from a YAML fixture instead of the database
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    /// Config file (overrides PARCEL_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print pretty JSON instead of a text summary
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for one parcel
    Analyze {
        parcel_id: String,

        /// Parcel geometry; taken from the fixture when omitted
        #[arg(long)]
        wkt: Option<String>,

        /// Known zone id; skips the spatial zone lookup
        #[arg(long)]
        zone: Option<String>,

        /// Parcel area in m²; defaults to the geometry's planar area
        #[arg(long)]
        area: Option<f64>,

        /// Budget for context layer lookups, in milliseconds
        #[arg(long)]
        budget_ms: Option<u64>,
    },

    /// Resolve consolidated rules for a zone or a geometry
    Rules {
        #[arg(long, conflicts_with = "wkt", required_unless_present = "wkt")]
        zone: Option<String>,

        #[arg(long)]
        wkt: Option<String>,
    },

    /// Evaluate the context layers for a parcel
    Context {
        parcel_id: String,

        #[arg(long)]
        wkt: Option<String>,
    },

    /// Aggregate quality scores over recent days
    QualityReport {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },

    /// Drop cached context layers older than the given age
    PurgeCache {
        /// Age in days (defaults to the configured TTL)
        #[arg(long)]
        days: Option<i64>,
    },
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {:#}", "error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    telemetry::init(&config.log_filter);

    match run(&cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                println!("{}", serde_json::json!({ "error": format!("{e:#}") }));
            } else {
                eprintln!("{}: {:#}", "error".red().bold(), e);
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<AppConfig> {
    match path {
        Some(path) => {
            dotenvy::dotenv().ok();
            let mut config = AppConfig::from_file(path)?;
            config.apply_env();
            Ok(config)
        }
        None => AppConfig::load(),
    }
}

async fn run(cli: &Cli, config: &AppConfig) -> Result<()> {
    let backend = backend::connect(cli.fixture.as_deref(), config).await?;

    match &cli.command {
        Commands::Analyze {
            parcel_id,
            wkt,
            zone,
            area,
            budget_ms,
        } => {
            let mut request = request_for(&backend, parcel_id, wkt.as_deref())?;
            if let Some(zone) = zone {
                request = request.with_zone(zone.clone());
            }
            if let Some(area) = area {
                request = request.with_area(*area);
            }
            if let Some(ms) = budget_ms {
                request = request.with_context_budget(Duration::from_millis(*ms));
            }
            let report = backend.analyzer.analyze(request).await?;
            emit(cli.json, &report, print_report)
        }
        Commands::Rules { zone, wkt } => {
            let query = match (zone, wkt) {
                (Some(zone), _) => RuleQuery::Zone(zone.clone()),
                (None, Some(wkt)) => RuleQuery::GeometryWkt(wkt.clone()),
                (None, None) => return Err(anyhow!("either --zone or --wkt is required")),
            };
            let resolution = backend.analyzer.resolve_rules(&query).await?;
            emit(cli.json, &resolution, print_rules)
        }
        Commands::Context { parcel_id, wkt } => {
            let request = request_for(&backend, parcel_id, wkt.as_deref())?;
            let flags = backend
                .analyzer
                .resolve_context(&request.parcel_id, &request.geometry_wkt)
                .await;
            emit(cli.json, &flags, |flags| print_flags(flags))
        }
        Commands::QualityReport { days } => {
            let report = backend.analyzer.quality_report(*days).await?;
            emit(cli.json, &report, |r| print_quality_report(r, *days))
        }
        Commands::PurgeCache { days } => {
            let purged = backend.analyzer.purge_context_cache(*days).await?;
            emit(cli.json, &serde_json::json!({ "purged": purged }), |_| {
                println!("{} purged {} cached context layer(s)", "OK".green(), purged)
            })
        }
    }
}

/// Build a request from `--wkt` or the fixture's parcel entry.
fn request_for(backend: &Backend, parcel_id: &str, wkt: Option<&str>) -> Result<AnalysisRequest> {
    if let Some(wkt) = wkt {
        return Ok(AnalysisRequest::new(parcel_id, wkt));
    }
    let parcel = backend
        .known_parcel(parcel_id)
        .with_context(|| format!("parcel {parcel_id} is not in the fixture; pass --wkt"))?;
    let mut request = AnalysisRequest::new(&parcel.id, &parcel.geometry);
    if let Some(zone) = &parcel.zone_id {
        request = request.with_zone(zone.clone());
    }
    if let Some(area) = parcel.area_m2 {
        request = request.with_area(area);
    }
    Ok(request)
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(value).context("serializing output")?
        );
    } else {
        text(value);
    }
    Ok(())
}

// =============================================================================
// TEXT OUTPUT
// =============================================================================

fn severity_label(severity: Severity) -> ColoredString {
    match severity {
        Severity::Critical => "CRITICAL".red().bold(),
        Severity::Warning => "WARNING".yellow(),
        Severity::Info => "INFO".blue(),
    }
}

fn control_label(level: ControlLevel) -> ColoredString {
    match level {
        ControlLevel::Error => "error".red().bold(),
        ControlLevel::Warning => "warning".yellow(),
        ControlLevel::Info => "info".blue(),
    }
}

fn opt_m2(value: Option<f64>) -> String {
    value.map_or_else(|| "-".dimmed().to_string(), |v| format!("{v} m²"))
}

fn print_rules(resolution: &ZoneResolution) {
    match &resolution.zone_id {
        Some(zone) => println!("{} {}", "Zone".bold(), zone),
        None => println!("{} {}", "Zone".bold(), "none".dimmed()),
    }
    if resolution.is_tied() {
        println!(
            "  {} tied with {}",
            "!".yellow(),
            resolution.tied_zones.join(", ")
        );
    }
    for rule in &resolution.rules {
        println!(
            "  {:<20} {:<12} {}",
            rule.field.key(),
            rule.value.to_string().bold(),
            rule.level.as_str().dimmed()
        );
        for lost in &rule.overridden {
            println!(
                "    {} {} ({})",
                "overrides".dimmed(),
                lost.value,
                lost.level.as_str()
            );
        }
    }
}

fn print_calc(calc: &CalcOutput) {
    println!("{}", "Build indicators".bold());
    println!("  usable floor area (SU)  {}", opt_m2(calc.su_m2));
    println!("  gross floor area (IBUS) {}", opt_m2(calc.ibus_m2));
    println!("  ground coverage         {}", opt_m2(calc.emprise_m2));
    println!(
        "  max floors (estimate)   {}",
        calc.niveaux_max_est
            .map_or_else(|| "-".dimmed().to_string(), |n| n.to_string())
    );
    println!("  reliability             {:.2}", calc.reliability);
    for control in &calc.controls {
        println!(
            "  [{}] {} {}",
            control_label(control.level),
            control.code.as_str(),
            control.message.dimmed()
        );
    }
}

fn print_flags(flags: &[ContextFlag]) {
    println!("{}", "Context".bold());
    if flags.is_empty() {
        println!("  {}", "no constraints found".dimmed());
    }
    for flag in flags {
        println!(
            "  [{}] {:<15} {}",
            severity_label(flag.severity),
            flag.layer.as_str(),
            flag.message
        );
    }
}

fn print_report(report: &AnalysisReport) {
    println!("{} {}", "Parcel".bold(), report.parcel_id);
    if let Some(area) = report.area_m2 {
        println!("  area {:.1} m² ({:?})", area, report.area_source);
    }
    print_rules(&ZoneResolution {
        zone_id: report.zone_id.clone(),
        rules: report.rules.clone(),
        tied_zones: report.tied_zones.clone(),
    });
    print_calc(&report.calc);
    print_flags(&report.context);

    let q = &report.quality;
    println!(
        "{} {:.2}  ({} fields: {} direct, {} derived, {} estimated, {} missing)",
        "Quality".bold(),
        q.score_global,
        q.total_fields,
        q.direct_count,
        q.derived_count,
        q.estimated_count,
        q.missing_count
    );

    let degraded = &report.degraded;
    if let Some(e) = &degraded.rules {
        println!("{} rules: {}", "degraded".yellow().bold(), e);
    }
    for layer in &degraded.context {
        println!("{} context layer {}", "degraded".yellow().bold(), layer);
    }
    if let Some(e) = &degraded.evidence_persistence {
        println!("{} evidence not persisted: {}", "degraded".yellow().bold(), e);
    }
}

fn print_quality_report(report: &QualityReport, days: i64) {
    println!("{} (last {} days)", "Quality report".bold(), days);
    println!("  parcels analyzed  {}", report.parcels_analyzed);
    match report.average_score {
        Some(avg) => println!("  average score     {avg:.2}"),
        None => println!("  average score     {}", "-".dimmed()),
    }
    let d = &report.distribution;
    println!(
        "  distribution      {} excellent, {} good, {} average, {} poor",
        d.excellent.to_string().green(),
        d.good,
        d.average,
        d.poor.to_string().red()
    );
    if !report.top_missing_fields.is_empty() {
        println!("  most often missing");
        for m in &report.top_missing_fields {
            println!("    {:<18} {}", m.field, m.occurrences);
        }
    }
    for day in &report.daily_trend {
        println!(
            "  {}  {:>4} parcel(s)  avg {:.2}",
            day.date, day.parcels, day.average_score
        );
    }
    if !report.worst_parcels.is_empty() {
        println!("  lowest scores");
        for s in &report.worst_parcels {
            println!("    {:<18} {:.2}  {}", s.parcel_id, s.score_global, s.calc_date);
        }
    }
}
