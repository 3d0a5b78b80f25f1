//! SQLite record store for review-agent runs.
//!
//! Ingestion writes a run, its rule hits and the change summary upsert in one
//! `IMMEDIATE` transaction. Folds for the same change therefore never
//! interleave. SQLite holds a single database-wide write lock, so folds for
//! *different* changes also queue behind each other for the length of one
//! ingestion transaction (a run, its hits, one upsert); waiters retry up to
//! `busy_timeout` instead of failing. Reads run on their own snapshot and do
//! not wait on writers under WAL.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use review_metrics_core::{
    fold_change_summary, format_rfc3339, from_unix_millis, now_utc, to_unix_millis, ChangeKey,
    ChangeSummary, FoldInput, MetricsError, RecordedRun, RuleQualityFilter, RunKey, RunRecord,
    RunReport, TimeWindow, ValidatedRun,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};
use ulid::Ulid;

mod query;

pub use query::{
    Bucket, ChangeFilter, ChangeQuery, MetricsOverview, RuleHitTotal, RuleQualityQuery,
    RuleTrendPoint, RunFilter, RunRow, TimeseriesMetric, TimeseriesPoint, VersionCount,
};

const METRICS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_METRICS_V1: &str = r"
CREATE TABLE IF NOT EXISTS runs (
  run_id INTEGER PRIMARY KEY AUTOINCREMENT,
  repo TEXT NOT NULL,
  code_change_id TEXT NOT NULL,
  agent_run_id TEXT NOT NULL,
  agent_version TEXT NOT NULL,
  ruleset_version TEXT NOT NULL,
  reported_at INTEGER NOT NULL,
  diff_lines INTEGER NOT NULL CHECK (diff_lines >= 0),
  triggered_total_hits INTEGER NOT NULL CHECK (triggered_total_hits >= 0),
  rule_hits_json TEXT NOT NULL DEFAULT '{}',
  recorded_at INTEGER NOT NULL,
  UNIQUE (repo, code_change_id, agent_run_id)
);

CREATE TRIGGER IF NOT EXISTS trg_runs_no_update
BEFORE UPDATE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_runs_no_delete
BEFORE DELETE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_runs_change_reported
  ON runs(repo, code_change_id, reported_at);
CREATE INDEX IF NOT EXISTS idx_runs_repo_reported
  ON runs(repo, reported_at);
CREATE INDEX IF NOT EXISTS idx_runs_reported
  ON runs(reported_at);

CREATE TABLE IF NOT EXISTS rule_hits (
  hit_id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id INTEGER NOT NULL,
  repo TEXT NOT NULL,
  code_change_id TEXT NOT NULL,
  reported_at INTEGER NOT NULL,
  ruleset_version TEXT NOT NULL,
  rule_id TEXT NOT NULL CHECK (length(trim(rule_id)) > 0),
  hit_count INTEGER NOT NULL CHECK (hit_count >= 0),
  UNIQUE (run_id, rule_id),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TRIGGER IF NOT EXISTS trg_rule_hits_no_update
BEFORE UPDATE ON rule_hits
BEGIN
  SELECT RAISE(FAIL, 'rule_hits is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_rule_hits_no_delete
BEFORE DELETE ON rule_hits
BEGIN
  SELECT RAISE(FAIL, 'rule_hits is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_rule_hits_rule_reported
  ON rule_hits(rule_id, reported_at);
CREATE INDEX IF NOT EXISTS idx_rule_hits_rule_repo_reported
  ON rule_hits(rule_id, repo, reported_at);
CREATE INDEX IF NOT EXISTS idx_rule_hits_change_rule
  ON rule_hits(repo, code_change_id, rule_id);
CREATE INDEX IF NOT EXISTS idx_rule_hits_ruleset_rule
  ON rule_hits(ruleset_version, rule_id);

CREATE TABLE IF NOT EXISTS change_summaries (
  repo TEXT NOT NULL,
  code_change_id TEXT NOT NULL,
  run_count INTEGER NOT NULL CHECK (run_count >= 1),
  first_reported_at INTEGER NOT NULL,
  last_reported_at INTEGER NOT NULL,
  max_total_hits INTEGER NOT NULL CHECK (max_total_hits >= 0),
  max_run_id INTEGER NOT NULL,
  min_total_hits INTEGER NOT NULL CHECK (min_total_hits >= 0),
  min_run_id INTEGER NOT NULL,
  last_ruleset_version TEXT NOT NULL,
  improvement_rate REAL CHECK (improvement_rate BETWEEN 0.0 AND 1.0 OR improvement_rate IS NULL),
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (repo, code_change_id)
);

CREATE INDEX IF NOT EXISTS idx_change_summaries_repo_last
  ON change_summaries(repo, last_reported_at);
CREATE INDEX IF NOT EXISTS idx_change_summaries_repo_runs
  ON change_summaries(repo, run_count);
";

// Every SET expression reads the row as it was before this statement, so the
// fold is a single atomic compare-and-update per change.
const FOLD_CHANGE_SUMMARY_SQL: &str = r"
INSERT INTO change_summaries(
  repo, code_change_id, run_count, first_reported_at, last_reported_at,
  max_total_hits, max_run_id, min_total_hits, min_run_id,
  last_ruleset_version, improvement_rate, updated_at
) VALUES (?1, ?2, 1, ?3, ?3, ?4, ?5, ?4, ?5, ?6, NULL, ?7)
ON CONFLICT(repo, code_change_id) DO UPDATE SET
  run_count = run_count + 1,
  first_reported_at = MIN(first_reported_at, excluded.first_reported_at),
  last_reported_at = MAX(last_reported_at, excluded.last_reported_at),
  max_run_id = CASE
    WHEN excluded.max_total_hits > max_total_hits THEN excluded.max_run_id
    ELSE max_run_id
  END,
  max_total_hits = MAX(max_total_hits, excluded.max_total_hits),
  min_run_id = CASE
    WHEN excluded.min_total_hits < min_total_hits THEN excluded.min_run_id
    ELSE min_run_id
  END,
  min_total_hits = MIN(min_total_hits, excluded.min_total_hits),
  last_ruleset_version = CASE
    WHEN excluded.last_reported_at >= last_reported_at THEN excluded.last_ruleset_version
    ELSE last_ruleset_version
  END,
  improvement_rate = CASE
    WHEN MAX(max_total_hits, excluded.max_total_hits) > 0 THEN
      CAST(MAX(max_total_hits, excluded.max_total_hits)
           - MIN(min_total_hits, excluded.min_total_hits) AS REAL)
      / MAX(max_total_hits, excluded.max_total_hits)
    ELSE NULL
  END,
  updated_at = excluded.updated_at
";

const SUMMARY_COLUMNS: &str = "repo, code_change_id, run_count, first_reported_at, last_reported_at,
  max_total_hits, max_run_id, min_total_hits, min_run_id, last_ruleset_version, improvement_rate";

const RUN_COLUMNS: &str = "run_id, repo, code_change_id, agent_run_id, agent_version, ruleset_version,
  reported_at, diff_lines, triggered_total_hits, rule_hits_json, recorded_at";

pub struct SqliteMetricsStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SummaryIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SummaryIssue {
    pub code: String,
    pub severity: SummaryIssueSeverity,
    pub repo: String,
    pub code_change_id: String,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SummaryCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub checked_changes: usize,
    pub stored_summaries: usize,
    pub checked_runs: usize,
    pub issues: Vec<SummaryIssue>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct BenchmarkThresholds {
    pub record_p95_ms_max: f64,
    pub derive_p95_ms_max: f64,
    pub summarize_p95_ms_max: f64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct BenchmarkConfig {
    pub volumes: Vec<usize>,
    pub repetitions: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct BenchmarkVolumeResult {
    pub run_count: usize,
    pub record_p50_ms: f64,
    pub record_p95_ms: f64,
    pub derive_p50_ms: f64,
    pub derive_p95_ms: f64,
    pub summarize_p50_ms: f64,
    pub summarize_p95_ms: f64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct BenchmarkReport {
    pub contract_version: String,
    pub generated_at: String,
    pub repetitions: usize,
    pub volumes: Vec<BenchmarkVolumeResult>,
    pub thresholds: Option<BenchmarkThresholds>,
    pub within_thresholds: bool,
    pub violations: Vec<String>,
}

impl SqliteMetricsStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_METRICS_V1)
            .context("failed to apply metrics schema")?;

        let now = format_rfc3339(now_utc())?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![METRICS_MIGRATION_VERSION, now],
            )
            .context("failed to register metrics schema migration")?;
        if inserted > 0 {
            info!(version = METRICS_MIGRATION_VERSION, "applied metrics schema migration");
        }

        Ok(())
    }

    /// Records one run report.
    ///
    /// A report whose natural key already exists returns the stored run id with
    /// `idempotent = true` and writes nothing. Otherwise the run, its rule hits
    /// and the change-summary fold commit together or not at all.
    pub fn record_run(&mut self, report: &RunReport) -> Result<RecordedRun> {
        let run = report.validate()?;
        let key = run.run_key();

        if let Some(run_id) = find_run_id(&self.conn, &key)? {
            debug!(run_key = %key, run_id, "run already recorded; replay absorbed");
            return Ok(RecordedRun {
                run_id,
                idempotent: true,
            });
        }

        self.write_new_run(&run)
    }

    fn write_new_run(&mut self, run: &ValidatedRun) -> Result<RecordedRun> {
        let key = run.run_key();
        match insert_run_with_fold(&mut self.conn, run, now_utc()) {
            Ok(run_id) => {
                info!(
                    repo = %run.repo,
                    code_change_id = %run.code_change_id,
                    agent_run_id = %run.agent_run_id,
                    run_id,
                    "recorded run"
                );
                Ok(RecordedRun {
                    run_id,
                    idempotent: false,
                })
            }
            Err(err) if is_unique_violation(&err) => {
                let Some(run_id) = find_run_id(&self.conn, &key)? else {
                    return Err(MetricsError::Internal(format!(
                        "natural key conflict for {key} but no stored run found"
                    ))
                    .into());
                };
                warn!(run_key = %key, run_id, "lost natural-key race; returning stored run");
                Ok(RecordedRun {
                    run_id,
                    idempotent: true,
                })
            }
            Err(err) => {
                warn!(run_key = %key, error = %err, "run ingestion rolled back");
                Err(MetricsError::Internal(format!("failed to record run {key}: {err}")).into())
            }
        }
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id],
                parse_run_row,
            )
            .optional()
            .with_context(|| format!("failed to load run {run_id}"))
    }

    pub fn get_change_summary(&self, key: &ChangeKey) -> Result<Option<ChangeSummary>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {SUMMARY_COLUMNS} FROM change_summaries
                     WHERE repo = ?1 AND code_change_id = ?2"
                ),
                params![key.repo, key.code_change_id],
                parse_summary_row,
            )
            .optional()
            .with_context(|| format!("failed to load change summary for {key}"))
    }

    /// Replays the fold over every change's runs in ingestion order and
    /// compares the result with the stored summary. Read-only.
    pub fn check_summaries(&self) -> Result<SummaryCheck> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start summary check snapshot")?;

        let mut expected: BTreeMap<ChangeKey, ChangeSummary> = BTreeMap::new();
        let mut checked_runs = 0_usize;
        let mut issues = Vec::new();
        {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs ORDER BY repo, code_change_id, run_id"
                ))
                .context("failed to prepare run replay query")?;
            let rows = stmt
                .query_map([], parse_run_row)
                .context("failed to query runs for replay")?;
            for run in collect_rows(rows)? {
                checked_runs += 1;
                let key = ChangeKey::new(run.repo.clone(), run.code_change_id.clone());
                let next = fold_change_summary(
                    expected.get(&key),
                    &key,
                    &FoldInput {
                        run_id: run.run_id,
                        triggered_total_hits: run.triggered_total_hits,
                        reported_at: run.reported_at,
                        ruleset_version: run.ruleset_version.clone(),
                    },
                );
                expected.insert(key, next);
            }
        }

        let stored = load_all_summaries(&tx)?;

        for (key, want) in &expected {
            match stored.get(key) {
                None => issues.push(summary_issue(
                    "missing_summary",
                    SummaryIssueSeverity::Error,
                    key,
                    format!("change has {} run(s) but no stored summary", want.run_count),
                )),
                Some(have) => {
                    if let Some(diff) = describe_summary_difference(want, have) {
                        issues.push(summary_issue(
                            "summary_mismatch",
                            SummaryIssueSeverity::Error,
                            key,
                            diff,
                        ));
                    }
                }
            }
        }
        for key in stored.keys() {
            if !expected.contains_key(key) {
                issues.push(summary_issue(
                    "orphan_summary",
                    SummaryIssueSeverity::Warning,
                    key,
                    "stored summary has no recorded runs".to_string(),
                ));
            }
        }

        {
            let mut stmt = tx
                .prepare(
                    "SELECT r.run_id, r.repo, r.code_change_id, r.triggered_total_hits,
                            COALESCE((SELECT SUM(h.hit_count) FROM rule_hits h WHERE h.run_id = r.run_id), 0)
                     FROM runs r
                     WHERE r.triggered_total_hits !=
                           COALESCE((SELECT SUM(h.hit_count) FROM rule_hits h WHERE h.run_id = r.run_id), 0)
                     ORDER BY r.run_id",
                )
                .context("failed to prepare hit-sum audit query")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        ChangeKey::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })
                .context("failed to query hit-sum audit")?;
            for (run_id, key, total, sum) in collect_rows(rows)? {
                issues.push(summary_issue(
                    "hit_sum_mismatch",
                    SummaryIssueSeverity::Error,
                    &key,
                    format!("run {run_id} triggered_total_hits={total} but rule hits sum to {sum}"),
                ));
            }
        }

        tx.commit().context("failed to close summary check snapshot")?;

        let healthy = !issues
            .iter()
            .any(|issue| issue.severity == SummaryIssueSeverity::Error);
        Ok(SummaryCheck {
            contract_version: "summary_check.v1".to_string(),
            healthy,
            checked_changes: expected.len(),
            stored_summaries: stored.len(),
            checked_runs,
            issues,
        })
    }

    #[allow(clippy::too_many_lines)]
    pub fn run_benchmark(
        config: &BenchmarkConfig,
        thresholds: Option<BenchmarkThresholds>,
    ) -> Result<BenchmarkReport> {
        if config.volumes.is_empty() {
            return Err(anyhow!(
                "benchmark config must include at least one volume value"
            ));
        }
        if config.repetitions == 0 {
            return Err(anyhow!("benchmark repetitions must be >= 1"));
        }

        let mut volume_results = Vec::new();

        for &run_count in &config.volumes {
            let mut record_samples_ms = Vec::new();
            let mut derive_samples_ms = Vec::new();
            let mut summarize_samples_ms = Vec::new();

            for repetition in 0..config.repetitions {
                let db_path = std::env::temp_dir().join(format!(
                    "review-metrics-bench-{}-{}-{}.sqlite3",
                    run_count,
                    repetition,
                    Ulid::new()
                ));

                let mut store = SqliteMetricsStore::open(&db_path)?;
                store.migrate()?;

                let base = now_utc() - time::Duration::hours(1);
                for index in 0..run_count {
                    let report = benchmark_report(index, base);
                    let start = Instant::now();
                    let _ = store.record_run(&report)?;
                    record_samples_ms.push(start.elapsed().as_secs_f64() * 1_000.0);
                }

                let window = TimeWindow::new(base - time::Duration::minutes(1), now_utc())?;

                let derive_start = Instant::now();
                let _ = store.derive_rule_quality(&window, &RuleQualityFilter::default())?;
                derive_samples_ms.push(derive_start.elapsed().as_secs_f64() * 1_000.0);

                let summarize_start = Instant::now();
                let _ = store.change_effectiveness_summary(&ChangeQuery {
                    window,
                    filter: ChangeFilter::default(),
                    min_runs: 2,
                })?;
                summarize_samples_ms.push(summarize_start.elapsed().as_secs_f64() * 1_000.0);

                drop(store);
                remove_database_files(&db_path);
            }

            volume_results.push(BenchmarkVolumeResult {
                run_count,
                record_p50_ms: percentile(&record_samples_ms, 0.50),
                record_p95_ms: percentile(&record_samples_ms, 0.95),
                derive_p50_ms: percentile(&derive_samples_ms, 0.50),
                derive_p95_ms: percentile(&derive_samples_ms, 0.95),
                summarize_p50_ms: percentile(&summarize_samples_ms, 0.50),
                summarize_p95_ms: percentile(&summarize_samples_ms, 0.95),
            });
        }

        let mut violations = Vec::new();
        if let Some(limit) = &thresholds {
            for volume in &volume_results {
                if volume.record_p95_ms > limit.record_p95_ms_max {
                    violations.push(format!(
                        "volume={} record_p95_ms={} exceeds max={}",
                        volume.run_count, volume.record_p95_ms, limit.record_p95_ms_max
                    ));
                }
                if volume.derive_p95_ms > limit.derive_p95_ms_max {
                    violations.push(format!(
                        "volume={} derive_p95_ms={} exceeds max={}",
                        volume.run_count, volume.derive_p95_ms, limit.derive_p95_ms_max
                    ));
                }
                if volume.summarize_p95_ms > limit.summarize_p95_ms_max {
                    violations.push(format!(
                        "volume={} summarize_p95_ms={} exceeds max={}",
                        volume.run_count, volume.summarize_p95_ms, limit.summarize_p95_ms_max
                    ));
                }
            }
        }

        Ok(BenchmarkReport {
            contract_version: "benchmark_report.v1".to_string(),
            generated_at: format_rfc3339(now_utc())?,
            repetitions: config.repetitions,
            volumes: volume_results,
            thresholds,
            within_thresholds: violations.is_empty(),
            violations,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Maps an error to its stable code; anything that is not a [`MetricsError`]
/// counts as internal.
#[must_use]
pub fn error_code(err: &anyhow::Error) -> &'static str {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<MetricsError>())
        .map_or("INTERNAL_ERROR", MetricsError::code)
}

fn find_run_id(conn: &Connection, key: &RunKey) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT run_id FROM runs
         WHERE repo = ?1 AND code_change_id = ?2 AND agent_run_id = ?3",
        params![key.repo, key.code_change_id, key.agent_run_id],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("failed to look up run {key}"))
}

fn insert_run_with_fold(
    conn: &mut Connection,
    run: &ValidatedRun,
    recorded_at: time::OffsetDateTime,
) -> rusqlite::Result<i64> {
    let reported_at = to_unix_millis(run.reported_at);
    let recorded_at = to_unix_millis(recorded_at);
    let rule_hits_json = serde_json::to_string(&run.rule_hits)
        .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    tx.execute(
        "INSERT INTO runs(
            repo, code_change_id, agent_run_id, agent_version, ruleset_version,
            reported_at, diff_lines, triggered_total_hits, rule_hits_json, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            run.repo,
            run.code_change_id,
            run.agent_run_id,
            run.agent_version,
            run.ruleset_version,
            reported_at,
            run.diff_lines,
            run.triggered_total_hits,
            rule_hits_json,
            recorded_at,
        ],
    )?;
    let run_id = tx.last_insert_rowid();

    {
        let mut stmt = tx.prepare(
            "INSERT INTO rule_hits(
                run_id, repo, code_change_id, reported_at, ruleset_version, rule_id, hit_count
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for (rule_id, hit_count) in &run.rule_hits {
            stmt.execute(params![
                run_id,
                run.repo,
                run.code_change_id,
                reported_at,
                run.ruleset_version,
                rule_id,
                hit_count,
            ])?;
        }
    }

    tx.execute(
        FOLD_CHANGE_SUMMARY_SQL,
        params![
            run.repo,
            run.code_change_id,
            reported_at,
            run.triggered_total_hits,
            run_id,
            run.ruleset_version,
            recorded_at,
        ],
    )?;

    tx.commit()?;
    Ok(run_id)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::ConstraintViolation
                && inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn load_all_summaries(conn: &Connection) -> Result<BTreeMap<ChangeKey, ChangeSummary>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {SUMMARY_COLUMNS} FROM change_summaries"))
        .context("failed to prepare summary listing")?;
    let rows = stmt
        .query_map([], parse_summary_row)
        .context("failed to list change summaries")?;
    Ok(collect_rows(rows)?
        .into_iter()
        .map(|summary| (summary.change_key(), summary))
        .collect())
}

fn describe_summary_difference(want: &ChangeSummary, have: &ChangeSummary) -> Option<String> {
    let mut diffs = Vec::new();
    if want.run_count != have.run_count {
        diffs.push(format!("run_count {} != {}", have.run_count, want.run_count));
    }
    if want.max_total_hits != have.max_total_hits || want.max_run_id != have.max_run_id {
        diffs.push(format!(
            "max {}@{} != {}@{}",
            have.max_total_hits, have.max_run_id, want.max_total_hits, want.max_run_id
        ));
    }
    if want.min_total_hits != have.min_total_hits || want.min_run_id != have.min_run_id {
        diffs.push(format!(
            "min {}@{} != {}@{}",
            have.min_total_hits, have.min_run_id, want.min_total_hits, want.min_run_id
        ));
    }
    if want.first_reported_at != have.first_reported_at
        || want.last_reported_at != have.last_reported_at
    {
        diffs.push("reported_at bounds differ".to_string());
    }
    if want.last_ruleset_version != have.last_ruleset_version {
        diffs.push(format!(
            "last_ruleset_version {} != {}",
            have.last_ruleset_version, want.last_ruleset_version
        ));
    }
    let rate_matches = match (want.improvement_rate, have.improvement_rate) {
        (Some(lhs), Some(rhs)) => (lhs - rhs).abs() <= 1e-9,
        (None, None) => true,
        _ => false,
    };
    if !rate_matches {
        diffs.push(format!(
            "improvement_rate {:?} != {:?}",
            have.improvement_rate, want.improvement_rate
        ));
    }

    if diffs.is_empty() {
        None
    } else {
        Some(diffs.join("; "))
    }
}

fn summary_issue(
    code: &str,
    severity: SummaryIssueSeverity,
    key: &ChangeKey,
    message: String,
) -> SummaryIssue {
    SummaryIssue {
        code: code.to_string(),
        severity,
        repo: key.repo.clone(),
        code_change_id: key.code_change_id.clone(),
        message,
    }
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let rule_hits_json: String = row.get(9)?;
    let rule_hits: BTreeMap<String, u32> =
        serde_json::from_str(&rule_hits_json).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(err))
        })?;

    Ok(RunRecord {
        run_id: row.get(0)?,
        repo: row.get(1)?,
        code_change_id: row.get(2)?,
        agent_run_id: row.get(3)?,
        agent_version: row.get(4)?,
        ruleset_version: row.get(5)?,
        reported_at: millis_column(row, 6)?,
        diff_lines: row.get(7)?,
        triggered_total_hits: row.get(8)?,
        rule_hits,
        recorded_at: millis_column(row, 10)?,
    })
}

fn parse_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeSummary> {
    Ok(ChangeSummary {
        repo: row.get(0)?,
        code_change_id: row.get(1)?,
        run_count: row.get(2)?,
        first_reported_at: millis_column(row, 3)?,
        last_reported_at: millis_column(row, 4)?,
        max_total_hits: row.get(5)?,
        max_run_id: row.get(6)?,
        min_total_hits: row.get(7)?,
        min_run_id: row.get(8)?,
        last_ruleset_version: row.get(9)?,
        improvement_rate: row.get(10)?,
    })
}

fn millis_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<time::OffsetDateTime> {
    let millis: i64 = row.get(index)?;
    from_unix_millis(millis).map_err(to_sql_error)
}

fn benchmark_report(index: usize, base: time::OffsetDateTime) -> RunReport {
    let hits_a = u32::try_from(index % 9).unwrap_or(0);
    let hits_b = u32::try_from(index % 4).unwrap_or(0);
    let mut rule_hits = BTreeMap::new();
    rule_hits.insert("bench.rule.a".to_string(), hits_a);
    if index % 3 != 0 {
        rule_hits.insert("bench.rule.b".to_string(), hits_b);
    }
    let total = rule_hits.values().sum();
    let offset = i64::try_from(index).unwrap_or(i64::MAX);

    RunReport {
        repo: "bench/repo".to_string(),
        code_change_id: format!("change-{}", index % 16),
        agent_run_id: format!("bench-run-{index}"),
        agent_version: "bench".to_string(),
        ruleset_version: "bench-v1".to_string(),
        reported_at: Some(base + time::Duration::milliseconds(offset)),
        diff_lines: Some(100),
        triggered_total_hits: total,
        rule_hits: Some(rule_hits),
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn percentile(values: &[f64], percentile_rank: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let position = (percentile_rank * sorted.len() as f64).ceil() as usize;
    let index = position.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

#[allow(clippy::needless_pass_by_value)]
/// Removes a database file together with its WAL and shared-memory sidecars.
fn remove_database_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        let _ = std::fs::remove_file(name);
    }
}

fn to_sql_error(err: MetricsError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Integer,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::manual_let_else,
        clippy::float_cmp,
        clippy::too_many_lines
    )]

    use super::*;
    use proptest::prelude::*;
    use review_metrics_core::{parse_rfc3339_utc, Direction, RuleSortKey, SortOrder};
    use time::{Duration, OffsetDateTime};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteMetricsStore {
        let store = must(SqliteMetricsStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn file_store_path(label: &str) -> std::path::PathBuf {
        let path =
            std::env::temp_dir().join(format!("review-metrics-{label}-{}.sqlite3", Ulid::new()));
        let store = must(SqliteMetricsStore::open(&path));
        must(store.migrate());
        path
    }

    fn t0() -> OffsetDateTime {
        must(parse_rfc3339_utc("2026-02-07T12:00:00Z").map_err(anyhow::Error::from))
    }

    fn report(change: &str, agent_run_id: &str, minutes: i64, hits: &[(&str, u32)]) -> RunReport {
        let rule_hits: BTreeMap<String, u32> = hits
            .iter()
            .map(|(rule, count)| ((*rule).to_string(), *count))
            .collect();
        RunReport {
            repo: "org/service".to_string(),
            code_change_id: change.to_string(),
            agent_run_id: agent_run_id.to_string(),
            agent_version: "1.4.0".to_string(),
            ruleset_version: "rs-1".to_string(),
            reported_at: Some(t0() + Duration::minutes(minutes)),
            diff_lines: Some(200),
            triggered_total_hits: rule_hits.values().sum(),
            rule_hits: Some(rule_hits),
        }
    }

    fn count(store: &SqliteMetricsStore, table: &str) -> i64 {
        match store
            .connection()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        {
            Ok(value) => value,
            Err(err) => panic!("failed to count {table}: {err}"),
        }
    }

    fn summary_for(store: &SqliteMetricsStore, change: &str) -> ChangeSummary {
        match must(store.get_change_summary(&ChangeKey::new("org/service", change))) {
            Some(summary) => summary,
            None => panic!("expected summary for {change}"),
        }
    }

    fn window(from_minutes: i64, to_minutes: i64) -> TimeWindow {
        must(
            TimeWindow::new(
                t0() + Duration::minutes(from_minutes),
                t0() + Duration::minutes(to_minutes),
            )
            .map_err(anyhow::Error::from),
        )
    }

    #[test]
    fn record_run_persists_run_hits_and_summary() {
        let mut store = fixture_store();
        let recorded = must(store.record_run(&report("PR-1", "a", 0, &[("R1", 3), ("R2", 1)])));
        assert!(!recorded.idempotent);

        let run = match must(store.get_run(recorded.run_id)) {
            Some(value) => value,
            None => panic!("run should exist"),
        };
        assert_eq!(run.triggered_total_hits, 4);
        assert_eq!(run.rule_hits.get("R1"), Some(&3));
        assert_eq!(count(&store, "rule_hits"), 2);

        let summary = summary_for(&store, "PR-1");
        assert_eq!(summary.run_count, 1);
        assert_eq!(summary.max_run_id, recorded.run_id);
        assert_eq!(summary.improvement_rate, None);
    }

    #[test]
    fn retried_report_is_idempotent_even_with_different_fields() {
        let mut store = fixture_store();
        let first = must(store.record_run(&report("PR-1", "a", 0, &[("R1", 3)])));
        let second = must(store.record_run(&report("PR-1", "a", 5, &[("R1", 1), ("R2", 9)])));

        assert_eq!(first.run_id, second.run_id);
        assert!(!first.idempotent);
        assert!(second.idempotent);
        assert_eq!(count(&store, "runs"), 1);
        assert_eq!(count(&store, "rule_hits"), 1);
        assert_eq!(summary_for(&store, "PR-1").run_count, 1);
    }

    #[test]
    fn validation_failure_writes_nothing() {
        let mut store = fixture_store();
        let mut bad = report("PR-1", "a", 0, &[("R1", 3)]);
        bad.triggered_total_hits = 4;

        let err = match store.record_run(&bad) {
            Ok(value) => panic!("expected validation failure, got {value:?}"),
            Err(err) => err,
        };
        assert_eq!(error_code(&err), "VALIDATION_ERROR");
        assert!(err.to_string().contains("triggered_total_hits"));
        assert_eq!(count(&store, "runs"), 0);
        assert_eq!(count(&store, "change_summaries"), 0);
    }

    #[test]
    fn failed_fold_rolls_back_run_and_hits() {
        let mut store = fixture_store();
        if let Err(err) = store.connection().execute_batch(
            "CREATE TRIGGER trg_test_fail_summary
             BEFORE INSERT ON change_summaries
             BEGIN
               SELECT RAISE(ABORT, 'summary write refused');
             END;",
        ) {
            panic!("failed to install test trigger: {err}");
        }

        let err = match store.record_run(&report("PR-1", "a", 0, &[("R1", 3)])) {
            Ok(value) => panic!("expected fold failure, got {value:?}"),
            Err(err) => err,
        };
        assert_eq!(error_code(&err), "INTERNAL_ERROR");
        assert_eq!(count(&store, "runs"), 0);
        assert_eq!(count(&store, "rule_hits"), 0);
    }

    #[test]
    fn natural_key_conflict_resolves_to_stored_run() {
        let mut store = fixture_store();
        let first = must(store.record_run(&report("PR-1", "a", 0, &[("R1", 3)])));

        let late = must(
            report("PR-1", "a", 0, &[("R1", 3)])
                .validate()
                .map_err(anyhow::Error::from),
        );
        let replay = must(store.write_new_run(&late));
        assert!(replay.idempotent);
        assert_eq!(replay.run_id, first.run_id);
        assert_eq!(summary_for(&store, "PR-1").run_count, 1);
    }

    #[test]
    fn running_extrema_match_ten_four_seven() {
        let mut store = fixture_store();
        let ten = must(store.record_run(&report("PR-1", "a", 0, &[("R1", 10)])));
        let four = must(store.record_run(&report("PR-1", "b", 10, &[("R1", 4)])));
        let _ = must(store.record_run(&report("PR-1", "c", 20, &[("R1", 7)])));

        let summary = summary_for(&store, "PR-1");
        assert_eq!(summary.run_count, 3);
        assert_eq!(summary.max_total_hits, 10);
        assert_eq!(summary.max_run_id, ten.run_id);
        assert_eq!(summary.min_total_hits, 4);
        assert_eq!(summary.min_run_id, four.run_id);
        let rate = match summary.improvement_rate {
            Some(value) => value,
            None => panic!("rate expected"),
        };
        assert!((rate - 0.6).abs() < 1e-9);
    }

    #[test]
    fn out_of_order_runs_track_latest_ruleset_version() {
        let mut store = fixture_store();
        let mut late = report("PR-1", "a", 30, &[("R1", 2)]);
        late.ruleset_version = "rs-3".to_string();
        let mut early = report("PR-1", "b", 0, &[("R1", 5)]);
        early.ruleset_version = "rs-1".to_string();
        let _ = must(store.record_run(&late));
        let _ = must(store.record_run(&early));

        let summary = summary_for(&store, "PR-1");
        assert_eq!(summary.last_ruleset_version, "rs-3");
        assert_eq!(summary.first_reported_at, t0());
        assert_eq!(summary.last_reported_at, t0() + Duration::minutes(30));
    }

    #[test]
    fn concurrent_folds_on_one_change_lose_no_updates() {
        let db_path = file_store_path("concurrent");

        let mut handles = Vec::new();
        for (index, hits) in [10_u32, 4, 7].into_iter().enumerate() {
            let path = db_path.clone();
            handles.push(std::thread::spawn(move || {
                let mut store = SqliteMetricsStore::open(&path)?;
                let minutes = i64::try_from(index).unwrap_or(0);
                store.record_run(&report(
                    "PR-1",
                    &format!("run-{index}"),
                    minutes,
                    &[("R1", hits)],
                ))?;
                store.record_run(&report(
                    &format!("PR-other-{index}"),
                    "solo",
                    minutes,
                    &[("R2", hits)],
                ))
            }));
        }
        for handle in handles {
            match handle.join() {
                Ok(result) => {
                    let _ = must(result);
                }
                Err(err) => panic!("ingest thread panicked: {err:?}"),
            }
        }

        let store = must(SqliteMetricsStore::open(&db_path));
        let summary = summary_for(&store, "PR-1");
        assert_eq!(summary.run_count, 3);
        assert_eq!(summary.max_total_hits, 10);
        assert_eq!(summary.min_total_hits, 4);
        assert_eq!(summary.improvement_rate.map(|rate| (rate * 10.0).round()), Some(6.0));
        assert_eq!(count(&store, "change_summaries"), 4);
        assert!(must(store.check_summaries()).healthy);

        drop(store);
        remove_database_files(&db_path);
        for suffix in ["", "-wal", "-shm"] {
            let mut name = db_path.as_os_str().to_owned();
            name.push(suffix);
            assert!(
                !std::path::Path::new(&name).exists(),
                "leftover database file {name:?}"
            );
        }
    }

    #[test]
    fn sqlite_busy_timeout_allows_record_after_lock_release() {
        let db_path = file_store_path("lock");

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let record_path = db_path.clone();
        let record_handle = std::thread::spawn(move || {
            let mut store = SqliteMetricsStore::open(&record_path)?;
            store.record_run(&report("PR-1", "a", 0, &[("R1", 1)]))
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let record_result = match record_handle.join() {
            Ok(result) => result,
            Err(err) => panic!("record thread join failed: {err:?}"),
        };
        assert!(
            record_result.is_ok(),
            "record should succeed after lock release: {:?}",
            record_result.err()
        );

        drop(lock_conn);
        remove_database_files(&db_path);
    }

    #[test]
    fn pre_epoch_runs_are_recorded_and_bucketed_downward() {
        let mut store = fixture_store();
        let mut early = report("PR-old", "a", 0, &[("R1", 2)]);
        early.reported_at = Some(must(
            parse_rfc3339_utc("1969-12-31T23:30:00Z").map_err(anyhow::Error::from),
        ));
        let recorded = must(store.record_run(&early));
        assert!(!recorded.idempotent);

        let window = must(
            TimeWindow::new(
                must(parse_rfc3339_utc("1969-12-31T00:00:00Z").map_err(anyhow::Error::from)),
                must(parse_rfc3339_utc("1970-01-01T01:00:00Z").map_err(anyhow::Error::from)),
            )
            .map_err(anyhow::Error::from),
        );
        let points = must(store.metrics_timeseries(
            &window,
            &RunFilter::default(),
            TimeseriesMetric::Runs,
            Bucket::Hour,
        ));
        assert_eq!(points.len(), 1);
        assert_eq!(
            points[0].bucket_start,
            must(parse_rfc3339_utc("1969-12-31T23:00:00Z").map_err(anyhow::Error::from))
        );
        assert_eq!(points[0].value, Some(1.0));

        let trend = must(store.rule_trend(&window, "R1", &RuleQualityFilter::default(), Bucket::Day));
        assert_eq!(trend.len(), 1);
        assert_eq!(
            trend[0].bucket_start,
            must(parse_rfc3339_utc("1969-12-31T00:00:00Z").map_err(anyhow::Error::from))
        );
        assert_eq!(trend[0].total_hits, 2);
    }

    #[test]
    fn disappeared_rule_counts_as_fixed_and_disappeared() {
        let mut store = fixture_store();
        let _ = must(store.record_run(&report("C", "a", 0, &[("R", 5)])));
        let _ = must(store.record_run(&report("C", "b", 10, &[])));

        let rows = must(store.derive_rule_quality(&window(0, 10), &RuleQualityFilter::default()));
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.rule_id, "R");
        assert_eq!(row.change_count, 1);
        assert_eq!(row.disappear_count, 1);
        assert_eq!(row.fix_count, 1);
        assert_eq!(row.fix_rate, Some(1.0));
        assert_eq!(row.avg_drop, Some(5.0));
    }

    #[test]
    fn fix_rate_over_two_changes_is_half() {
        let mut store = fixture_store();
        let _ = must(store.record_run(&report("C1", "a", 0, &[("R", 4)])));
        let _ = must(store.record_run(&report("C1", "b", 5, &[("R", 1)])));
        let _ = must(store.record_run(&report("C2", "a", 0, &[("R", 3)])));
        let _ = must(store.record_run(&report("C2", "b", 5, &[("R", 3)])));

        let query = RuleQualityQuery {
            window: window(0, 10),
            filter: RuleQualityFilter::default(),
            min_runs: 1,
            min_changes: 2,
        };
        let rows = must(store.rule_quality(&query));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fix_rate, Some(0.5));
        assert_eq!(rows[0].disappear_rate, Some(0.0));
        assert_eq!(rows[0].hit_rate, Some(1.0));

        let summary = must(store.rule_quality_summary(&query));
        assert_eq!(summary.total_rules, 1);
        assert_eq!(summary.total_runs, 4);
        assert_eq!(summary.avg_fix_rate, Some(0.5));
    }

    #[test]
    fn rule_without_qualifying_change_has_null_fix_rate() {
        let mut store = fixture_store();
        let _ = must(store.record_run(&report("C1", "a", 0, &[("R", 4)])));
        let _ = must(store.record_run(&report("C1", "b", 60, &[("R", 1)])));

        let rows = must(store.derive_rule_quality(&window(0, 10), &RuleQualityFilter::default()));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].change_count, 0);
        assert_eq!(rows[0].fix_rate, None);
        assert_eq!(rows[0].disappear_rate, None);
    }

    #[test]
    fn rule_listing_sorts_and_pages() {
        let mut store = fixture_store();
        let _ = must(store.record_run(&report("C1", "a", 0, &[("A", 4), ("B", 2)])));
        let _ = must(store.record_run(&report("C1", "b", 5, &[("A", 1)])));
        let _ = must(store.record_run(&report("C2", "a", 1, &[("B", 2), ("Z", 9)])));

        let query = RuleQualityQuery {
            window: window(0, 10),
            filter: RuleQualityFilter::default(),
            min_runs: 1,
            min_changes: 0,
        };
        let by_hits = must(store.list_rule_quality(&query, RuleSortKey::TotalHits, SortOrder::Desc, 2, 0));
        let ids: Vec<&str> = by_hits.iter().map(|row| row.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["Z", "A"]);

        let second_page = must(store.list_rule_quality(&query, RuleSortKey::TotalHits, SortOrder::Desc, 2, 2));
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].rule_id, "B");

        let top = must(store.top_rule_quality(&query, Direction::High, 1));
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].rule_id, "A");
    }

    #[test]
    fn change_reader_classifies_and_ranks() {
        let mut store = fixture_store();
        let _ = must(store.record_run(&report("C1", "a", 0, &[("R", 10)])));
        let _ = must(store.record_run(&report("C1", "b", 1, &[("R", 4)])));
        let _ = must(store.record_run(&report("C2", "a", 0, &[("R", 3)])));
        let _ = must(store.record_run(&report("C2", "b", 1, &[("R", 3)])));
        let _ = must(store.record_run(&report("C3", "a", 0, &[("R", 8)])));

        let query = ChangeQuery {
            window: window(0, 10),
            filter: ChangeFilter::default(),
            min_runs: 1,
        };
        let summary = must(store.change_effectiveness_summary(&query));
        assert_eq!(summary.total_changes, 3);
        assert_eq!(summary.improving_changes, 1);
        assert_eq!(summary.stable_changes, 2);
        let avg = match summary.avg_improvement_rate {
            Some(value) => value,
            None => panic!("average expected"),
        };
        assert!((avg - 0.3).abs() < 1e-9);

        let top = must(store.top_changes(&query, Direction::High, 10));
        let ids: Vec<&str> = top.iter().map(|row| row.code_change_id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "C2"]);

        let strict = ChangeQuery {
            min_runs: 2,
            ..query
        };
        assert_eq!(must(store.change_effectiveness_summary(&strict)).total_changes, 2);
    }

    #[test]
    fn change_runs_are_chronological_with_density() {
        let mut store = fixture_store();
        let _ = must(store.record_run(&report("C1", "late", 9, &[("R", 4)])));
        let mut empty_diff = report("C1", "early", 1, &[("R", 2)]);
        empty_diff.diff_lines = Some(0);
        let _ = must(store.record_run(&empty_diff));

        let runs = must(store.change_runs("C1", Some("org/service"), None, None, 50));
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run.agent_run_id, "early");
        assert_eq!(runs[0].hit_density, None);
        assert_eq!(runs[1].hit_density, Some(0.02));
    }

    #[test]
    fn run_metrics_report_totals_and_buckets() {
        let mut store = fixture_store();
        let _ = must(store.record_run(&report("C1", "a", 0, &[("R", 4)])));
        let _ = must(store.record_run(&report("C1", "b", 90, &[("R", 2), ("S", 2)])));

        let window = window(0, 120);
        let filter = RunFilter::default();
        let overview = must(store.metrics_overview(&window, &filter));
        assert_eq!(overview.total_runs, 2);
        assert_eq!(overview.total_hits, 8);
        assert_eq!(overview.total_diff_lines, 400);
        assert_eq!(overview.avg_hit_density, Some(0.02));
        assert_eq!(overview.active_repos, 1);

        let series = must(store.metrics_timeseries(&window, &filter, TimeseriesMetric::Runs, Bucket::Hour));
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].value, Some(1.0));

        let recent = must(store.recent_runs(&window, &filter, 1));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].run.agent_run_id, "b");

        let top = must(store.top_rules_by_hits(&window, None, 10));
        assert_eq!(top[0].rule_id, "R");
        assert_eq!(top[0].total_hits, 6);

        let trend = must(store.rule_trend(&window, "R", &RuleQualityFilter::default(), Bucket::Day));
        assert_eq!(trend.len(), 1);
        assert_eq!(trend[0].total_hits, 6);
    }

    #[test]
    fn append_only_triggers_block_updates_and_deletes() {
        let mut store = fixture_store();
        let recorded = must(store.record_run(&report("PR-1", "a", 0, &[("R1", 3)])));

        let update = store.connection().execute(
            "UPDATE runs SET agent_version = 'mutated' WHERE run_id = ?1",
            params![recorded.run_id],
        );
        assert!(update.is_err());
        let delete = store
            .connection()
            .execute("DELETE FROM rule_hits WHERE run_id = ?1", params![recorded.run_id]);
        assert!(delete.is_err());
    }

    #[test]
    fn summary_check_detects_tampering() {
        let mut store = fixture_store();
        let _ = must(store.record_run(&report("PR-1", "a", 0, &[("R1", 3)])));
        let _ = must(store.record_run(&report("PR-1", "b", 1, &[("R1", 1)])));
        assert!(must(store.check_summaries()).healthy);

        if let Err(err) = store.connection().execute_batch(
            "UPDATE change_summaries SET max_total_hits = 99 WHERE code_change_id = 'PR-1';
             INSERT INTO change_summaries(repo, code_change_id, run_count, first_reported_at,
               last_reported_at, max_total_hits, max_run_id, min_total_hits, min_run_id,
               last_ruleset_version, improvement_rate, updated_at)
             VALUES ('org/service', 'ghost', 1, 0, 0, 0, 0, 0, 0, 'rs-1', NULL, 0);",
        ) {
            panic!("failed to tamper summaries: {err}");
        }

        let check = must(store.check_summaries());
        assert!(!check.healthy);
        assert_eq!(check.checked_changes, 1);
        assert_eq!(check.stored_summaries, 2);
        let codes: Vec<&str> = check.issues.iter().map(|issue| issue.code.as_str()).collect();
        assert!(codes.contains(&"summary_mismatch"));
        assert!(codes.contains(&"orphan_summary"));
    }

    #[test]
    fn schema_contract_contains_expected_tables_and_triggers() {
        let store = fixture_store();
        for table in ["runs", "rule_hits", "change_summaries", "schema_migrations"] {
            let exists = match store.connection().query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get::<_, i64>(0),
            ) {
                Ok(value) => value,
                Err(err) => panic!("failed to query table contract: {err}"),
            };
            assert_eq!(exists, 1, "missing table {table}");
        }

        let trigger_count = match store.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type='trigger'
               AND name IN ('trg_runs_no_update', 'trg_runs_no_delete',
                            'trg_rule_hits_no_update', 'trg_rule_hits_no_delete')",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to query trigger contract: {err}"),
        };
        assert_eq!(trigger_count, 4);
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let mut store = fixture_store();
        let _ = must(store.record_run(&report("PR-1", "a", 0, &[("R1", 3)])));
        must(store.migrate());
        assert_eq!(count(&store, "runs"), 1);
        assert_eq!(count(&store, "schema_migrations"), 1);
        assert_eq!(summary_for(&store, "PR-1").run_count, 1);
    }

    #[test]
    fn benchmark_harness_generates_report_and_respects_thresholds() {
        let config = BenchmarkConfig {
            volumes: vec![20, 40],
            repetitions: 2,
        };
        let thresholds = BenchmarkThresholds {
            record_p95_ms_max: 5_000.0,
            derive_p95_ms_max: 5_000.0,
            summarize_p95_ms_max: 5_000.0,
        };

        let report = must(SqliteMetricsStore::run_benchmark(&config, Some(thresholds.clone())));
        assert_eq!(report.contract_version, "benchmark_report.v1");
        assert_eq!(report.repetitions, 2);
        assert_eq!(report.volumes.len(), 2);
        assert_eq!(report.thresholds, Some(thresholds));
        assert!(report.within_thresholds);

        let strict = BenchmarkThresholds {
            record_p95_ms_max: -1.0,
            derive_p95_ms_max: -1.0,
            summarize_p95_ms_max: -1.0,
        };
        let failing = must(SqliteMetricsStore::run_benchmark(
            &BenchmarkConfig {
                volumes: vec![5],
                repetitions: 1,
            },
            Some(strict),
        ));
        assert!(!failing.within_thresholds);
        assert_eq!(failing.violations.len(), 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_stored_summary_matches_running_extrema(totals in prop::collection::vec(0u32..50, 1..24)) {
            let mut store = fixture_store();
            for (index, total) in totals.iter().copied().enumerate() {
                let minutes = i64::try_from(index).unwrap_or(0);
                let hits: Vec<(&str, u32)> = if total == 0 { Vec::new() } else { vec![("R", total)] };
                let _ = must(store.record_run(&report("PR-P", &format!("run-{index}"), minutes, &hits)));
            }

            let summary = summary_for(&store, "PR-P");
            let max = totals.iter().copied().max().unwrap_or(0);
            let min = totals.iter().copied().min().unwrap_or(0);
            prop_assert_eq!(summary.run_count as usize, totals.len());
            prop_assert_eq!(summary.max_total_hits, max);
            prop_assert_eq!(summary.min_total_hits, min);
            if totals.len() < 2 || max == 0 {
                prop_assert!(summary.improvement_rate.is_none());
            } else {
                let expected = f64::from(max - min) / f64::from(max);
                let rate = summary.improvement_rate.unwrap_or(-1.0);
                prop_assert!((rate - expected).abs() < 1e-9);
            }
            prop_assert!(must(store.check_summaries()).healthy);
        }
    }
}
