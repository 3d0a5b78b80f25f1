//! Command surface for recording review-agent runs and querying their metrics.
//!
//! Hosts can embed the CLI through [`run_cli`] (parsed arguments) or
//! [`run_command`] (an already opened [`SqliteMetricsStore`]).

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use review_metrics_core::{
    now_utc, ChangeSortKey, Direction, MetricsError, RuleQualityFilter, RuleSortKey, RunReport,
    SortOrder, TimeWindow,
};
use review_metrics_store_sqlite::{
    BenchmarkConfig, BenchmarkReport, BenchmarkThresholds, Bucket, ChangeFilter, ChangeQuery,
    RuleQualityQuery, RunFilter, SqliteMetricsStore, SummaryCheck, SummaryIssueSeverity,
    TimeseriesMetric,
};
use serde::Serialize;
use time::{Duration, OffsetDateTime, UtcOffset};

const DEFAULT_WINDOW_DAYS: i64 = 7;
const MAX_OFFSET: usize = 100_000;

#[derive(Debug, Parser)]
#[command(name = "crm")]
#[command(about = "Code review agent metrics CLI")]
pub struct Cli {
    #[arg(long, default_value = "./review_metrics.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Runs {
        #[command(subcommand)]
        command: Box<RunsCommand>,
    },
    Rules {
        #[command(subcommand)]
        command: Box<RulesCommand>,
    },
    Changes {
        #[command(subcommand)]
        command: Box<ChangesCommand>,
    },
    Metrics {
        #[command(subcommand)]
        command: Box<MetricsCommand>,
    },
    Summaries {
        #[command(subcommand)]
        command: Box<SummariesCommand>,
    },
    Benchmark {
        #[command(subcommand)]
        command: Box<BenchmarkCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    /// Record one run report given as JSON.
    Record(RecordArgs),
    /// Newest runs first.
    Recent(RecentArgs),
}

#[derive(Debug, Subcommand)]
pub enum RulesCommand {
    /// Aggregate rule-quality summary.
    Quality(RuleQualityArgs),
    Top(RuleTopArgs),
    List(RuleListArgs),
    Trend(RuleTrendArgs),
}

#[derive(Debug, Subcommand)]
pub enum ChangesCommand {
    Summary(ChangeArgs),
    Top(ChangeTopArgs),
    List(ChangeListArgs),
    Runs(ChangeRunsArgs),
}

#[derive(Debug, Subcommand)]
pub enum MetricsCommand {
    Overview(MetricsArgs),
    Timeseries(TimeseriesArgs),
    TopRules(TopRulesArgs),
}

#[derive(Debug, Subcommand)]
pub enum SummariesCommand {
    /// Replay every change's runs and compare against stored summaries.
    Check,
}

#[derive(Debug, Subcommand)]
pub enum BenchmarkCommand {
    Run(BenchmarkRunArgs),
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[arg(long, conflicts_with = "json")]
    file: Option<PathBuf>,
    #[arg(long)]
    json: Option<String>,
}

#[derive(Debug, Args)]
pub struct WindowArgs {
    /// RFC3339 timestamp or unix seconds; defaults to `to` minus 7 days.
    #[arg(long)]
    from: Option<String>,
    /// RFC3339 timestamp or unix seconds; defaults to now.
    #[arg(long)]
    to: Option<String>,
}

#[derive(Debug, Args)]
pub struct RunFilterArgs {
    #[arg(long)]
    repo: Option<String>,
    #[arg(long)]
    ruleset_version: Option<String>,
    #[arg(long)]
    agent_version: Option<String>,
    #[arg(long)]
    code_change_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct RecentArgs {
    #[command(flatten)]
    window: WindowArgs,
    #[command(flatten)]
    filter: RunFilterArgs,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct RuleQualityArgs {
    #[command(flatten)]
    window: WindowArgs,
    #[arg(long)]
    repo: Option<String>,
    #[arg(long)]
    ruleset_version: Option<String>,
    #[arg(long)]
    rule_id: Option<String>,
    #[arg(long)]
    min_runs: Option<u64>,
    #[arg(long)]
    min_changes: Option<u64>,
}

#[derive(Debug, Args)]
pub struct RuleTopArgs {
    #[command(flatten)]
    quality: RuleQualityArgs,
    #[arg(long, default_value = "high")]
    direction: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct RuleListArgs {
    #[command(flatten)]
    quality: RuleQualityArgs,
    #[arg(long, default_value = "fix_rate")]
    sort: String,
    #[arg(long, default_value = "desc")]
    order: String,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    offset: Option<usize>,
}

#[derive(Debug, Args)]
pub struct RuleTrendArgs {
    #[command(flatten)]
    window: WindowArgs,
    #[arg(long)]
    rule_id: String,
    #[arg(long)]
    repo: Option<String>,
    #[arg(long)]
    ruleset_version: Option<String>,
    #[arg(long, default_value = "day")]
    bucket: String,
}

#[derive(Debug, Args)]
pub struct ChangeArgs {
    #[command(flatten)]
    window: WindowArgs,
    #[arg(long)]
    repo: Option<String>,
    #[arg(long)]
    ruleset_version: Option<String>,
    #[arg(long)]
    code_change_id: Option<String>,
    #[arg(long)]
    min_runs: Option<u32>,
}

#[derive(Debug, Args)]
pub struct ChangeTopArgs {
    #[command(flatten)]
    change: ChangeArgs,
    #[arg(long, default_value = "high")]
    direction: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ChangeListArgs {
    #[command(flatten)]
    change: ChangeArgs,
    #[arg(long, default_value = "improvement_rate")]
    sort: String,
    #[arg(long, default_value = "desc")]
    order: String,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    offset: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ChangeRunsArgs {
    #[arg(long)]
    code_change_id: String,
    #[arg(long)]
    repo: Option<String>,
    /// Optional lower bound; unlike other windows this one is open by default.
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct MetricsArgs {
    #[command(flatten)]
    window: WindowArgs,
    #[command(flatten)]
    filter: RunFilterArgs,
}

#[derive(Debug, Args)]
pub struct TimeseriesArgs {
    #[command(flatten)]
    metrics: MetricsArgs,
    #[arg(long, default_value = "runs")]
    metric: String,
    #[arg(long, default_value = "day")]
    bucket: String,
}

#[derive(Debug, Args)]
pub struct TopRulesArgs {
    #[command(flatten)]
    window: WindowArgs,
    #[arg(long)]
    repo: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct BenchmarkRunArgs {
    #[arg(long = "volume")]
    volumes: Vec<usize>,
    #[arg(long, default_value_t = 3)]
    repetitions: usize,
    #[arg(long)]
    record_p95_max_ms: Option<f64>,
    #[arg(long)]
    derive_p95_max_ms: Option<f64>,
    #[arg(long)]
    summarize_p95_max_ms: Option<f64>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

/// JSON envelope for every query result printed on stdout.
#[derive(Debug, Serialize)]
pub struct JsonPayload<T: Serialize> {
    contract_version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    window: Option<TimeWindow>,
    data: T,
}

#[derive(Debug, Serialize)]
struct RecordPayload {
    run_id: i64,
    idempotent: bool,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Benchmark { command } => run_benchmark(*command),
        command => {
            tracing::debug!(db = %cli.db.display(), "opening metrics store");
            let mut store = SqliteMetricsStore::open(&cli.db)?;
            store.migrate()?;
            run_command(command, &mut store)
        }
    }
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when argument validation, ingestion or a query fails.
pub fn run_command(command: Command, store: &mut SqliteMetricsStore) -> Result<()> {
    match command {
        Command::Runs { command } => run_runs(*command, store),
        Command::Rules { command } => run_rules(*command, store),
        Command::Changes { command } => run_changes(*command, store),
        Command::Metrics { command } => run_metrics(*command, store),
        Command::Summaries { command } => run_summaries(&command, store),
        Command::Benchmark { .. } => Err(anyhow!(
            "internal dispatch error: benchmark should be handled before store initialization"
        )),
    }
}

fn run_runs(command: RunsCommand, store: &mut SqliteMetricsStore) -> Result<()> {
    match command {
        RunsCommand::Record(args) => {
            let raw = match (args.file, args.json) {
                (Some(path), None) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read run report {}", path.display()))?,
                (None, Some(raw)) => raw,
                _ => {
                    return Err(MetricsError::validation(
                        "report",
                        "exactly one of --file or --json is required",
                    )
                    .into())
                }
            };
            let report = parse_report(&raw)?;
            let recorded = store.record_run(&report)?;
            print_json(
                "run_record.v1",
                None,
                RecordPayload {
                    run_id: recorded.run_id,
                    idempotent: recorded.idempotent,
                },
            )
        }
        RunsCommand::Recent(args) => {
            let window = resolve_window(&args.window)?;
            let limit = clamp(args.limit, 50, 1, 200);
            let rows = store.recent_runs(&window, &run_filter(args.filter), limit)?;
            print_json("recent_runs.v1", Some(window), rows)
        }
    }
}

fn run_rules(command: RulesCommand, store: &SqliteMetricsStore) -> Result<()> {
    match command {
        RulesCommand::Quality(args) => {
            let query = rule_quality_query(args)?;
            let summary = store.rule_quality_summary(&query)?;
            print_json("rule_quality_summary.v1", Some(query.window), summary)
        }
        RulesCommand::Top(args) => {
            let direction = parse_direction(&args.direction)?;
            let limit = clamp(args.limit, 5, 1, 50);
            let query = rule_quality_query(args.quality)?;
            let rows = store.top_rule_quality(&query, direction, limit)?;
            print_json("rule_quality_top.v1", Some(query.window), rows)
        }
        RulesCommand::List(args) => {
            let sort = RuleSortKey::parse(&args.sort).ok_or_else(|| {
                MetricsError::validation("sort", format!("unsupported sort key {}", args.sort))
            })?;
            let order = parse_order(&args.order)?;
            let limit = clamp(args.limit, 50, 1, 500);
            let offset = clamp(args.offset, 0, 0, MAX_OFFSET);
            let query = rule_quality_query(args.quality)?;
            let rows = store.list_rule_quality(&query, sort, order, limit, offset)?;
            print_json("rule_quality_list.v1", Some(query.window), rows)
        }
        RulesCommand::Trend(args) => {
            let window = resolve_window(&args.window)?;
            let bucket = parse_bucket(&args.bucket)?;
            let rule_id = required("rule_id", &args.rule_id)?;
            let filter = RuleQualityFilter {
                repo: non_blank(args.repo),
                ruleset_version: non_blank(args.ruleset_version),
                rule_id: None,
            };
            let points = store.rule_trend(&window, &rule_id, &filter, bucket)?;
            print_json("rule_trend.v1", Some(window), points)
        }
    }
}

fn run_changes(command: ChangesCommand, store: &SqliteMetricsStore) -> Result<()> {
    match command {
        ChangesCommand::Summary(args) => {
            let query = change_query(args)?;
            let summary = store.change_effectiveness_summary(&query)?;
            print_json("change_summary.v1", Some(query.window), summary)
        }
        ChangesCommand::Top(args) => {
            let direction = parse_direction(&args.direction)?;
            let limit = clamp(args.limit, 5, 1, 50);
            let query = change_query(args.change)?;
            let rows = store.top_changes(&query, direction, limit)?;
            print_json("change_top.v1", Some(query.window), rows)
        }
        ChangesCommand::List(args) => {
            let sort = ChangeSortKey::parse(&args.sort).ok_or_else(|| {
                MetricsError::validation("sort", format!("unsupported sort key {}", args.sort))
            })?;
            let order = parse_order(&args.order)?;
            let limit = clamp(args.limit, 50, 1, 500);
            let offset = clamp(args.offset, 0, 0, MAX_OFFSET);
            let query = change_query(args.change)?;
            let rows = store.list_changes(&query, sort, order, limit, offset)?;
            print_json("change_list.v1", Some(query.window), rows)
        }
        ChangesCommand::Runs(args) => {
            let code_change_id = required("code_change_id", &args.code_change_id)?;
            let from = args.from.as_deref().map(|raw| parse_time_arg("from", raw)).transpose()?;
            let to = args.to.as_deref().map(|raw| parse_time_arg("to", raw)).transpose()?;
            if let (Some(from), Some(to)) = (from, to) {
                TimeWindow::new(from, to)?;
            }
            let limit = clamp(args.limit, 50, 1, 200);
            let repo = non_blank(args.repo);
            let rows = store.change_runs(&code_change_id, repo.as_deref(), from, to, limit)?;
            print_json("change_runs.v1", None, rows)
        }
    }
}

fn run_metrics(command: MetricsCommand, store: &SqliteMetricsStore) -> Result<()> {
    match command {
        MetricsCommand::Overview(args) => {
            let window = resolve_window(&args.window)?;
            let overview = store.metrics_overview(&window, &run_filter(args.filter))?;
            print_json("metrics_overview.v1", Some(window), overview)
        }
        MetricsCommand::Timeseries(args) => {
            let metric = TimeseriesMetric::parse(&args.metric).ok_or_else(|| {
                MetricsError::validation("metric", format!("unsupported metric {}", args.metric))
            })?;
            let bucket = parse_bucket(&args.bucket)?;
            let window = resolve_window(&args.metrics.window)?;
            let points = store.metrics_timeseries(
                &window,
                &run_filter(args.metrics.filter),
                metric,
                bucket,
            )?;
            print_json("metrics_timeseries.v1", Some(window), points)
        }
        MetricsCommand::TopRules(args) => {
            let window = resolve_window(&args.window)?;
            let limit = clamp(args.limit, 10, 1, 50);
            let repo = non_blank(args.repo);
            let rows = store.top_rules_by_hits(&window, repo.as_deref(), limit)?;
            print_json("metrics_top_rules.v1", Some(window), rows)
        }
    }
}

fn run_summaries(command: &SummariesCommand, store: &SqliteMetricsStore) -> Result<()> {
    match command {
        SummariesCommand::Check => {
            let check = store.check_summaries()?;
            println!("{}", serde_json::to_string_pretty(&check)?);
            if !check.healthy {
                return Err(anyhow!(
                    "summary consistency check failed: {}",
                    summarize_issues(&check)
                ));
            }
            Ok(())
        }
    }
}

/// Runs the benchmark harness against temporary databases; `--db` is unused.
///
/// # Errors
/// Returns an error when thresholds are partially given, the harness fails,
/// or any threshold is violated.
pub fn run_benchmark(command: BenchmarkCommand) -> Result<()> {
    match command {
        BenchmarkCommand::Run(args) => {
            let volumes = if args.volumes.is_empty() {
                vec![100, 500, 2_000]
            } else {
                args.volumes
            };

            let thresholds = match (
                args.record_p95_max_ms,
                args.derive_p95_max_ms,
                args.summarize_p95_max_ms,
            ) {
                (Some(record), Some(derive), Some(summarize)) => Some(BenchmarkThresholds {
                    record_p95_ms_max: record,
                    derive_p95_ms_max: derive,
                    summarize_p95_ms_max: summarize,
                }),
                (None, None, None) => None,
                _ => {
                    return Err(MetricsError::validation(
                        "thresholds",
                        "benchmark thresholds require all of --record-p95-max-ms, --derive-p95-max-ms, --summarize-p95-max-ms",
                    )
                    .into())
                }
            };

            let config = BenchmarkConfig {
                volumes,
                repetitions: args.repetitions,
            };
            let report = SqliteMetricsStore::run_benchmark(&config, thresholds)?;

            if let Some(path) = args.output {
                let serialized = serde_json::to_string_pretty(&report)?;
                std::fs::write(&path, serialized).with_context(|| {
                    format!("failed writing benchmark report to {}", path.display())
                })?;
            }

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_benchmark_report(&report);
            }

            if !report.within_thresholds {
                return Err(anyhow!(
                    "benchmark thresholds violated: {}",
                    report.violations.join("; ")
                ));
            }
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(
    contract_version: &'static str,
    window: Option<TimeWindow>,
    data: T,
) -> Result<()> {
    let payload = JsonPayload {
        contract_version,
        window,
        data,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

const REPORT_FIELDS: [&str; 10] = [
    "repo",
    "code_change_id",
    "agent_run_id",
    "agent_version",
    "ruleset_version",
    "reported_at",
    "diff_lines",
    "triggered_total_hits",
    "rule_hits",
    "report",
];

/// Decodes a run report; decoding failures name the report field they occurred in.
fn parse_report(raw: &str) -> Result<RunReport> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    let report: RunReport =
        serde_path_to_error::deserialize(&mut deserializer).map_err(|err| {
            let field = report_field(&err.path().to_string());
            MetricsError::validation(field, format!("invalid run report JSON: {}", err.inner()))
        })?;
    deserializer.end().map_err(|err| {
        MetricsError::validation("report", format!("invalid run report JSON: {err}"))
    })?;
    Ok(report)
}

/// `rule_hits.R1` maps to `rule_hits`; paths outside the report shape map to `report`.
fn report_field(path: &str) -> &'static str {
    let head = path.split(['.', '[']).next().unwrap_or_default();
    REPORT_FIELDS
        .iter()
        .copied()
        .find(|field| *field == head)
        .unwrap_or("report")
}

fn rule_quality_query(args: RuleQualityArgs) -> Result<RuleQualityQuery> {
    Ok(RuleQualityQuery {
        window: resolve_window(&args.window)?,
        filter: RuleQualityFilter {
            repo: non_blank(args.repo),
            ruleset_version: non_blank(args.ruleset_version),
            rule_id: non_blank(args.rule_id),
        },
        min_runs: clamp(args.min_runs, 1, 1, 1_000),
        min_changes: clamp(args.min_changes, 2, 1, 1_000),
    })
}

fn change_query(args: ChangeArgs) -> Result<ChangeQuery> {
    Ok(ChangeQuery {
        window: resolve_window(&args.window)?,
        filter: ChangeFilter {
            repo: non_blank(args.repo),
            ruleset_version: non_blank(args.ruleset_version),
            code_change_id: non_blank(args.code_change_id),
        },
        min_runs: clamp(args.min_runs, 2, 1, 1_000),
    })
}

fn run_filter(args: RunFilterArgs) -> RunFilter {
    RunFilter {
        repo: non_blank(args.repo),
        ruleset_version: non_blank(args.ruleset_version),
        agent_version: non_blank(args.agent_version),
        code_change_id: non_blank(args.code_change_id),
    }
}

fn resolve_window(args: &WindowArgs) -> Result<TimeWindow> {
    let to = match args.to.as_deref() {
        Some(raw) => parse_time_arg("to", raw)?,
        None => now_utc(),
    };
    let from = match args.from.as_deref() {
        Some(raw) => parse_time_arg("from", raw)?,
        None => to - Duration::days(DEFAULT_WINDOW_DAYS),
    };
    Ok(TimeWindow::new(from, to)?)
}

/// Accepts RFC3339 (any offset, normalized to UTC) or integer unix seconds.
fn parse_time_arg(field: &'static str, raw: &str) -> Result<OffsetDateTime> {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
        let seconds: i64 = trimmed.parse().map_err(|err| {
            MetricsError::validation(field, format!("invalid unix timestamp {trimmed}: {err}"))
        })?;
        return OffsetDateTime::from_unix_timestamp(seconds).map_err(|err| {
            MetricsError::validation(field, format!("invalid unix timestamp {trimmed}: {err}"))
                .into()
        });
    }

    OffsetDateTime::parse(trimmed, &time::format_description::well_known::Rfc3339)
        .map(|value| value.to_offset(UtcOffset::UTC))
        .map_err(|err| {
            MetricsError::validation(field, format!("invalid RFC3339 timestamp {trimmed}: {err}"))
                .into()
        })
}

fn parse_direction(raw: &str) -> Result<Direction> {
    Direction::parse(raw).ok_or_else(|| {
        MetricsError::validation("direction", format!("direction must be low or high, got {raw}"))
            .into()
    })
}

fn parse_order(raw: &str) -> Result<SortOrder> {
    SortOrder::parse(raw).ok_or_else(|| {
        MetricsError::validation("order", format!("order must be asc or desc, got {raw}")).into()
    })
}

fn parse_bucket(raw: &str) -> Result<Bucket> {
    Bucket::parse(raw).ok_or_else(|| {
        MetricsError::validation("bucket", format!("bucket must be hour or day, got {raw}")).into()
    })
}

fn required(field: &'static str, raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MetricsError::validation(field, format!("{field} is required")).into());
    }
    Ok(trimmed.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|trimmed| !trimmed.is_empty())
}

/// Missing values take `default`; present ones are clamped into `[min, max]`.
fn clamp<T: Ord + Copy>(value: Option<T>, default: T, min: T, max: T) -> T {
    value.map_or(default, |value| value.clamp(min, max))
}

fn summarize_issues(check: &SummaryCheck) -> String {
    check
        .issues
        .iter()
        .filter(|issue| issue.severity == SummaryIssueSeverity::Error)
        .map(|issue| format!("{}:{}:{}", issue.code, issue.repo, issue.code_change_id))
        .collect::<Vec<_>>()
        .join("; ")
}

fn print_benchmark_report(report: &BenchmarkReport) {
    println!(
        "contract={} generated_at={} repetitions={} within_thresholds={}",
        report.contract_version,
        report.generated_at,
        report.repetitions,
        if report.within_thresholds {
            "yes"
        } else {
            "no"
        }
    );
    println!(
        "{:<10} {:<12} {:<12} {:<12} {:<12} {:<14} {:<14}",
        "runs", "record_p50", "record_p95", "derive_p50", "derive_p95", "summarize_p50", "summarize_p95"
    );
    println!("{}", "-".repeat(94));
    for item in &report.volumes {
        println!(
            "{:<10} {:<12.3} {:<12.3} {:<12.3} {:<12.3} {:<14.3} {:<14.3}",
            item.run_count,
            item.record_p50_ms,
            item.record_p95_ms,
            item.derive_p50_ms,
            item.derive_p95_ms,
            item.summarize_p50_ms,
            item.summarize_p95_ms
        );
    }

    if !report.violations.is_empty() {
        println!("violations={}", report.violations.join(" | "));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else)]

    use super::*;
    use review_metrics_core::parse_rfc3339_utc;
    use review_metrics_store_sqlite::error_code;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn window_args(from: Option<&str>, to: Option<&str>) -> WindowArgs {
        WindowArgs {
            from: from.map(str::to_string),
            to: to.map(str::to_string),
        }
    }

    #[test]
    fn window_accepts_rfc3339_and_unix_seconds() {
        let window = must(resolve_window(&window_args(
            Some("1770465600"),
            Some("2026-02-07T14:00:00+02:00"),
        )));
        let expected = must(parse_rfc3339_utc("2026-02-07T12:00:00Z").map_err(Into::into));
        assert_eq!(window.from, expected);
        assert_eq!(window.to, expected);
    }

    #[test]
    fn window_defaults_to_trailing_seven_days() {
        let window = must(resolve_window(&window_args(None, Some("2026-02-08T00:00:00Z"))));
        assert_eq!(window.to - window.from, Duration::days(7));
    }

    #[test]
    fn inverted_window_is_a_validation_error() {
        let err = match resolve_window(&window_args(
            Some("2026-02-08T00:00:00Z"),
            Some("2026-02-07T00:00:00Z"),
        )) {
            Ok(value) => panic!("expected error, got {value:?}"),
            Err(err) => err,
        };
        assert_eq!(error_code(&err), "VALIDATION_ERROR");
    }

    #[test]
    fn garbage_timestamp_is_a_validation_error() {
        let err = match parse_time_arg("from", "yesterday") {
            Ok(value) => panic!("expected error, got {value:?}"),
            Err(err) => err,
        };
        assert_eq!(error_code(&err), "VALIDATION_ERROR");
        assert!(err.to_string().contains("from"));
    }

    #[test]
    fn clamp_applies_defaults_and_bounds() {
        assert_eq!(clamp(None, 50_usize, 1, 500), 50);
        assert_eq!(clamp(Some(0_usize), 50, 1, 500), 1);
        assert_eq!(clamp(Some(9_000_usize), 50, 1, 500), 500);
        assert_eq!(clamp(Some(7_u64), 2, 1, 1_000), 7);
    }

    #[test]
    fn blank_filters_are_dropped() {
        assert_eq!(non_blank(Some("  ".to_string())), None);
        assert_eq!(non_blank(Some(" org/a ".to_string())), Some("org/a".to_string()));
    }

    #[test]
    fn cli_parses_nested_commands_and_defaults() {
        let cli = match Cli::try_parse_from([
            "crm",
            "rules",
            "list",
            "--sort",
            "total_hits",
            "--min-changes",
            "3",
        ]) {
            Ok(value) => value,
            Err(err) => panic!("parse failed: {err}"),
        };
        assert_eq!(cli.db, PathBuf::from("./review_metrics.sqlite3"));
        match cli.command {
            Command::Rules { command } => match *command {
                RulesCommand::List(args) => {
                    assert_eq!(args.sort, "total_hits");
                    assert_eq!(args.order, "desc");
                    assert_eq!(args.quality.min_changes, Some(3));
                }
                other => panic!("unexpected rules command {other:?}"),
            },
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn record_rejects_both_sources() {
        let parsed = Cli::try_parse_from(["crm", "runs", "record", "--file", "a.json", "--json", "{}"]);
        assert!(parsed.is_err());
    }

    fn report_error_field(raw: &str) -> &'static str {
        let err = match parse_report(raw) {
            Ok(value) => panic!("expected error, got {value:?}"),
            Err(err) => err,
        };
        match err.downcast_ref::<MetricsError>() {
            Some(MetricsError::Validation { field, .. }) => *field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn report_decode_errors_name_the_offending_field() {
        assert_eq!(
            report_error_field(r#"{"repo": "org/a", "reported_at": "2026-02-07 12:00"}"#),
            "reported_at"
        );
        assert_eq!(report_error_field(r#"{"diff_lines": -3}"#), "diff_lines");
        assert_eq!(report_error_field(r#"{"rule_hits": {"R1": "two"}}"#), "rule_hits");
        assert_eq!(report_error_field(r#"{"repo": 7}"#), "repo");
        assert_eq!(report_error_field("[1, 2]"), "report");
        assert_eq!(report_error_field(r#"{"repo": "org/a"} trailing"#), "report");
    }

    #[test]
    fn report_json_errors_are_validation_errors() {
        let err = match parse_report("{not json") {
            Ok(value) => panic!("expected error, got {value:?}"),
            Err(err) => err,
        };
        assert_eq!(error_code(&err), "VALIDATION_ERROR");
    }

    #[test]
    fn record_and_query_through_command_dispatch() {
        let mut store = must(SqliteMetricsStore::open(std::path::Path::new(":memory:")));
        must(store.migrate());

        let report = r#"{
            "repo": "org/service",
            "code_change_id": "PR-9",
            "agent_run_id": "r1",
            "agent_version": "1.0.0",
            "ruleset_version": "rs-1",
            "reported_at": "2026-02-07T12:00:00Z",
            "diff_lines": 10,
            "triggered_total_hits": 2,
            "rule_hits": {"R-1": 2}
        }"#;
        let cli = match Cli::try_parse_from(["crm", "runs", "record", "--json", report]) {
            Ok(value) => value,
            Err(err) => panic!("parse failed: {err}"),
        };
        must(run_command(cli.command, &mut store));

        let cli = match Cli::try_parse_from([
            "crm",
            "changes",
            "runs",
            "--code-change-id",
            "PR-9",
        ]) {
            Ok(value) => value,
            Err(err) => panic!("parse failed: {err}"),
        };
        must(run_command(cli.command, &mut store));

        let summary = match must(store.get_change_summary(&review_metrics_core::ChangeKey::new(
            "org/service",
            "PR-9",
        ))) {
            Some(value) => value,
            None => panic!("summary expected"),
        };
        assert_eq!(summary.run_count, 1);
    }

    #[test]
    fn json_payload_shape_is_stable() {
        let window = must(
            TimeWindow::new(
                must(parse_rfc3339_utc("2026-02-01T00:00:00Z").map_err(Into::into)),
                must(parse_rfc3339_utc("2026-02-08T00:00:00Z").map_err(Into::into)),
            )
            .map_err(Into::into),
        );
        let payload = JsonPayload {
            contract_version: "change_summary.v1",
            window: Some(window),
            data: RecordPayload {
                run_id: 7,
                idempotent: true,
            },
        };
        let value = must(serde_json::to_value(payload).map_err(Into::into));
        assert_eq!(
            value,
            serde_json::json!({
                "contract_version": "change_summary.v1",
                "window": {
                    "from": "2026-02-01T00:00:00Z",
                    "to": "2026-02-08T00:00:00Z"
                },
                "data": {"run_id": 7, "idempotent": true}
            })
        );
    }
}
