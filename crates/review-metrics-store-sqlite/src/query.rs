//! Read-side queries. Each public method reads from one snapshot; writes may
//! land between calls, which dashboards tolerate.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use review_metrics_core::{
    apply_thresholds, attach_hit_rates, derive_rule_quality, rank_changes, rank_rules,
    sort_changes, sort_rules, summarize_changes, summarize_rule_quality, to_unix_millis,
    ChangeEffectivenessRow, ChangeEffectivenessSummary, ChangeKey, ChangeSortKey, ChangeSummary,
    Direction, RuleHitRecord, RuleQuality, RuleQualityFilter, RuleQualitySummary, RuleSortKey,
    RunRecord, SortOrder, TimeWindow,
};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    collect_rows, millis_column, parse_run_row, parse_summary_row, SqliteMetricsStore,
    RUN_COLUMNS, SUMMARY_COLUMNS,
};

const RUN_FILTER_SQL: &str = "reported_at BETWEEN ?1 AND ?2
  AND (?3 IS NULL OR repo = ?3)
  AND (?4 IS NULL OR ruleset_version = ?4)
  AND (?5 IS NULL OR agent_version = ?5)
  AND (?6 IS NULL OR code_change_id = ?6)";

const TOP_VERSIONS_LIMIT: i64 = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Hour,
    #[default]
    Day,
}

impl Bucket {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }

    #[must_use]
    pub fn millis(self) -> i64 {
        match self {
            Self::Hour => 3_600_000,
            Self::Day => 86_400_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeseriesMetric {
    #[default]
    Runs,
    Hits,
    Density,
}

impl TimeseriesMetric {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "runs" => Some(Self::Runs),
            "hits" => Some(Self::Hits),
            "density" => Some(Self::Density),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunFilter {
    pub repo: Option<String>,
    pub ruleset_version: Option<String>,
    pub agent_version: Option<String>,
    pub code_change_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChangeFilter {
    pub repo: Option<String>,
    /// Matched against the summary's `last_ruleset_version`.
    pub ruleset_version: Option<String>,
    pub code_change_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleQualityQuery {
    pub window: TimeWindow,
    pub filter: RuleQualityFilter,
    pub min_runs: u64,
    pub min_changes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeQuery {
    pub window: TimeWindow,
    pub filter: ChangeFilter,
    pub min_runs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleTrendPoint {
    #[serde(with = "review_metrics_core::rfc3339")]
    pub bucket_start: OffsetDateTime,
    pub total_hits: u64,
    pub run_count: u64,
}

/// A run with its hit density (`hits / diff_lines`, null for empty diffs).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRow {
    #[serde(flatten)]
    pub run: RunRecord,
    pub hit_density: Option<f64>,
}

impl From<RunRecord> for RunRow {
    fn from(run: RunRecord) -> Self {
        let hit_density = (run.diff_lines > 0)
            .then(|| f64::from(run.triggered_total_hits) / f64::from(run.diff_lines));
        Self { run, hit_density }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionCount {
    pub version: String,
    pub runs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsOverview {
    pub total_runs: u64,
    pub total_hits: u64,
    pub total_diff_lines: u64,
    pub avg_hit_density: Option<f64>,
    pub active_repos: u64,
    pub top_ruleset_versions: Vec<VersionCount>,
    pub top_agent_versions: Vec<VersionCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeseriesPoint {
    #[serde(with = "review_metrics_core::rfc3339")]
    pub bucket_start: OffsetDateTime,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleHitTotal {
    pub rule_id: String,
    pub total_hits: u64,
    pub run_count: u64,
}

impl SqliteMetricsStore {
    /// The five-stage derivation without thresholds or hit rates.
    pub fn derive_rule_quality(
        &self,
        window: &TimeWindow,
        filter: &RuleQualityFilter,
    ) -> Result<Vec<RuleQuality>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start rule quality snapshot")?;
        let hits = load_rule_hits(&tx, window, filter)?;
        let summaries = load_summaries_in_window(&tx, window, filter.repo.as_deref())?;
        tx.commit().context("failed to close rule quality snapshot")?;

        Ok(derive_rule_quality(&hits, &summaries, window, filter))
    }

    pub fn rule_quality(&self, query: &RuleQualityQuery) -> Result<Vec<RuleQuality>> {
        Ok(self.thresholded_rule_quality(query)?.0)
    }

    pub fn rule_quality_summary(&self, query: &RuleQualityQuery) -> Result<RuleQualitySummary> {
        let (rows, total_runs) = self.thresholded_rule_quality(query)?;
        Ok(summarize_rule_quality(&rows, total_runs))
    }

    pub fn top_rule_quality(
        &self,
        query: &RuleQualityQuery,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<RuleQuality>> {
        let rows = self.rule_quality(query)?;
        Ok(rank_rules(rows, direction, limit))
    }

    pub fn list_rule_quality(
        &self,
        query: &RuleQualityQuery,
        sort: RuleSortKey,
        order: SortOrder,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RuleQuality>> {
        let mut rows = self.rule_quality(query)?;
        sort_rules(&mut rows, sort, order);
        Ok(page(rows, limit, offset))
    }

    /// Hits per time bucket for one rule.
    pub fn rule_trend(
        &self,
        window: &TimeWindow,
        rule_id: &str,
        filter: &RuleQualityFilter,
        bucket: Bucket,
    ) -> Result<Vec<RuleTrendPoint>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT reported_at - ((reported_at % ?6) + ?6) % ?6 AS bucket_start,
                        SUM(hit_count),
                        COUNT(DISTINCT run_id)
                 FROM rule_hits
                 WHERE rule_id = ?1
                   AND reported_at BETWEEN ?2 AND ?3
                   AND (?4 IS NULL OR repo = ?4)
                   AND (?5 IS NULL OR ruleset_version = ?5)
                 GROUP BY bucket_start
                 ORDER BY bucket_start ASC",
            )
            .context("failed to prepare rule trend query")?;
        let rows = stmt
            .query_map(
                params![
                    rule_id,
                    window.from_millis(),
                    window.to_millis(),
                    filter.repo.as_deref(),
                    filter.ruleset_version.as_deref(),
                    bucket.millis(),
                ],
                |row| {
                    Ok(RuleTrendPoint {
                        bucket_start: millis_column(row, 0)?,
                        total_hits: row.get(1)?,
                        run_count: row.get(2)?,
                    })
                },
            )
            .with_context(|| format!("failed to query trend for rule {rule_id}"))?;
        collect_rows(rows)
    }

    pub fn change_effectiveness_summary(
        &self,
        query: &ChangeQuery,
    ) -> Result<ChangeEffectivenessSummary> {
        let summaries = load_change_summaries(&self.conn, query)?;
        Ok(summarize_changes(&summaries))
    }

    pub fn top_changes(
        &self,
        query: &ChangeQuery,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<ChangeEffectivenessRow>> {
        let summaries = load_change_summaries(&self.conn, query)?;
        Ok(rank_changes(&summaries, direction, limit))
    }

    pub fn list_changes(
        &self,
        query: &ChangeQuery,
        sort: ChangeSortKey,
        order: SortOrder,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ChangeEffectivenessRow>> {
        let summaries = load_change_summaries(&self.conn, query)?;
        let mut rows: Vec<ChangeEffectivenessRow> =
            summaries.iter().map(ChangeEffectivenessRow::from).collect();
        sort_changes(&mut rows, sort, order);
        Ok(page(rows, limit, offset))
    }

    /// Runs for one change, oldest first. Either bound may be open.
    pub fn change_runs(
        &self,
        code_change_id: &str,
        repo: Option<&str>,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
        limit: usize,
    ) -> Result<Vec<RunRow>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE code_change_id = ?1
                   AND (?2 IS NULL OR repo = ?2)
                   AND (?3 IS NULL OR reported_at >= ?3)
                   AND (?4 IS NULL OR reported_at <= ?4)
                 ORDER BY reported_at ASC, run_id ASC
                 LIMIT ?5"
            ))
            .context("failed to prepare change runs query")?;
        let rows = stmt
            .query_map(
                params![
                    code_change_id,
                    repo,
                    from.map(to_unix_millis),
                    to.map(to_unix_millis),
                    sql_limit(limit),
                ],
                parse_run_row,
            )
            .with_context(|| format!("failed to query runs for change {code_change_id}"))?;
        Ok(collect_rows(rows)?.into_iter().map(RunRow::from).collect())
    }

    pub fn metrics_overview(&self, window: &TimeWindow, filter: &RunFilter) -> Result<MetricsOverview> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start overview snapshot")?;

        let (total_runs, total_hits, total_diff_lines, active_repos) = tx
            .query_row(
                &format!(
                    "SELECT COUNT(*),
                            COALESCE(SUM(triggered_total_hits), 0),
                            COALESCE(SUM(diff_lines), 0),
                            COUNT(DISTINCT repo)
                     FROM runs WHERE {RUN_FILTER_SQL}"
                ),
                params![
                    window.from_millis(),
                    window.to_millis(),
                    filter.repo.as_deref(),
                    filter.ruleset_version.as_deref(),
                    filter.agent_version.as_deref(),
                    filter.code_change_id.as_deref(),
                ],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, u64>(2)?,
                        row.get::<_, u64>(3)?,
                    ))
                },
            )
            .context("failed to query run overview")?;

        let top_ruleset_versions = top_versions(&tx, "ruleset_version", window, filter)?;
        let top_agent_versions = top_versions(&tx, "agent_version", window, filter)?;
        tx.commit().context("failed to close overview snapshot")?;

        #[allow(clippy::cast_precision_loss)]
        let avg_hit_density =
            (total_diff_lines > 0).then(|| total_hits as f64 / total_diff_lines as f64);

        Ok(MetricsOverview {
            total_runs,
            total_hits,
            total_diff_lines,
            avg_hit_density,
            active_repos,
            top_ruleset_versions,
            top_agent_versions,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn metrics_timeseries(
        &self,
        window: &TimeWindow,
        filter: &RunFilter,
        metric: TimeseriesMetric,
        bucket: Bucket,
    ) -> Result<Vec<TimeseriesPoint>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT reported_at - ((reported_at % ?7) + ?7) % ?7 AS bucket_start,
                        COUNT(*),
                        COALESCE(SUM(triggered_total_hits), 0),
                        COALESCE(SUM(diff_lines), 0)
                 FROM runs WHERE {RUN_FILTER_SQL}
                 GROUP BY bucket_start
                 ORDER BY bucket_start ASC"
            ))
            .context("failed to prepare timeseries query")?;
        let rows = stmt
            .query_map(
                params![
                    window.from_millis(),
                    window.to_millis(),
                    filter.repo.as_deref(),
                    filter.ruleset_version.as_deref(),
                    filter.agent_version.as_deref(),
                    filter.code_change_id.as_deref(),
                    bucket.millis(),
                ],
                |row| {
                    let runs: u64 = row.get(1)?;
                    let hits: u64 = row.get(2)?;
                    let diff_lines: u64 = row.get(3)?;
                    let value = match metric {
                        TimeseriesMetric::Runs => Some(runs as f64),
                        TimeseriesMetric::Hits => Some(hits as f64),
                        TimeseriesMetric::Density => {
                            (diff_lines > 0).then(|| hits as f64 / diff_lines as f64)
                        }
                    };
                    Ok(TimeseriesPoint {
                        bucket_start: millis_column(row, 0)?,
                        value,
                    })
                },
            )
            .context("failed to query timeseries")?;
        collect_rows(rows)
    }

    /// Newest runs first.
    pub fn recent_runs(
        &self,
        window: &TimeWindow,
        filter: &RunFilter,
        limit: usize,
    ) -> Result<Vec<RunRow>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE {RUN_FILTER_SQL}
                 ORDER BY reported_at DESC, run_id DESC
                 LIMIT ?7"
            ))
            .context("failed to prepare recent runs query")?;
        let rows = stmt
            .query_map(
                params![
                    window.from_millis(),
                    window.to_millis(),
                    filter.repo.as_deref(),
                    filter.ruleset_version.as_deref(),
                    filter.agent_version.as_deref(),
                    filter.code_change_id.as_deref(),
                    sql_limit(limit),
                ],
                parse_run_row,
            )
            .context("failed to query recent runs")?;
        Ok(collect_rows(rows)?.into_iter().map(RunRow::from).collect())
    }

    pub fn top_rules_by_hits(
        &self,
        window: &TimeWindow,
        repo: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RuleHitTotal>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT rule_id, SUM(hit_count) AS total_hits, COUNT(DISTINCT run_id)
                 FROM rule_hits
                 WHERE reported_at BETWEEN ?1 AND ?2
                   AND (?3 IS NULL OR repo = ?3)
                 GROUP BY rule_id
                 ORDER BY total_hits DESC, rule_id ASC
                 LIMIT ?4",
            )
            .context("failed to prepare top rules query")?;
        let rows = stmt
            .query_map(
                params![window.from_millis(), window.to_millis(), repo, sql_limit(limit)],
                |row| {
                    Ok(RuleHitTotal {
                        rule_id: row.get(0)?,
                        total_hits: row.get(1)?,
                        run_count: row.get(2)?,
                    })
                },
            )
            .context("failed to query top rules")?;
        collect_rows(rows)
    }

    fn thresholded_rule_quality(&self, query: &RuleQualityQuery) -> Result<(Vec<RuleQuality>, u64)> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start rule quality snapshot")?;
        let hits = load_rule_hits(&tx, &query.window, &query.filter)?;
        let summaries = load_summaries_in_window(&tx, &query.window, query.filter.repo.as_deref())?;
        let total_runs = count_runs(&tx, &query.window, &query.filter)?;
        tx.commit().context("failed to close rule quality snapshot")?;

        let rows = derive_rule_quality(&hits, &summaries, &query.window, &query.filter);
        let mut rows = apply_thresholds(rows, query.min_runs, query.min_changes);
        attach_hit_rates(&mut rows, total_runs);
        Ok((rows, total_runs))
    }
}

fn load_rule_hits(
    conn: &Connection,
    window: &TimeWindow,
    filter: &RuleQualityFilter,
) -> Result<Vec<RuleHitRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT run_id, repo, code_change_id, reported_at, ruleset_version, rule_id, hit_count
             FROM rule_hits
             WHERE reported_at BETWEEN ?1 AND ?2
               AND (?3 IS NULL OR repo = ?3)
               AND (?4 IS NULL OR ruleset_version = ?4)
               AND (?5 IS NULL OR rule_id = ?5)
             ORDER BY run_id ASC, rule_id ASC",
        )
        .context("failed to prepare rule hit snapshot")?;
    let rows = stmt
        .query_map(
            params![
                window.from_millis(),
                window.to_millis(),
                filter.repo.as_deref(),
                filter.ruleset_version.as_deref(),
                filter.rule_id.as_deref(),
            ],
            |row| {
                Ok(RuleHitRecord {
                    run_id: row.get(0)?,
                    repo: row.get(1)?,
                    code_change_id: row.get(2)?,
                    reported_at: millis_column(row, 3)?,
                    ruleset_version: row.get(4)?,
                    rule_id: row.get(5)?,
                    hit_count: row.get(6)?,
                })
            },
        )
        .context("failed to query rule hit snapshot")?;
    collect_rows(rows)
}

fn load_summaries_in_window(
    conn: &Connection,
    window: &TimeWindow,
    repo: Option<&str>,
) -> Result<BTreeMap<ChangeKey, ChangeSummary>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM change_summaries
             WHERE last_reported_at BETWEEN ?1 AND ?2
               AND (?3 IS NULL OR repo = ?3)"
        ))
        .context("failed to prepare change summary snapshot")?;
    let rows = stmt
        .query_map(
            params![window.from_millis(), window.to_millis(), repo],
            parse_summary_row,
        )
        .context("failed to query change summary snapshot")?;
    Ok(collect_rows(rows)?
        .into_iter()
        .map(|summary| (summary.change_key(), summary))
        .collect())
}

fn load_change_summaries(conn: &Connection, query: &ChangeQuery) -> Result<Vec<ChangeSummary>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM change_summaries
             WHERE last_reported_at BETWEEN ?1 AND ?2
               AND run_count >= ?3
               AND (?4 IS NULL OR repo = ?4)
               AND (?5 IS NULL OR last_ruleset_version = ?5)
               AND (?6 IS NULL OR code_change_id = ?6)
             ORDER BY repo ASC, code_change_id ASC"
        ))
        .context("failed to prepare change summary query")?;
    let rows = stmt
        .query_map(
            params![
                query.window.from_millis(),
                query.window.to_millis(),
                query.min_runs,
                query.filter.repo.as_deref(),
                query.filter.ruleset_version.as_deref(),
                query.filter.code_change_id.as_deref(),
            ],
            parse_summary_row,
        )
        .context("failed to query change summaries")?;
    collect_rows(rows)
}

fn count_runs(conn: &Connection, window: &TimeWindow, filter: &RuleQualityFilter) -> Result<u64> {
    conn.query_row(
        "SELECT COUNT(*) FROM runs
         WHERE reported_at BETWEEN ?1 AND ?2
           AND (?3 IS NULL OR repo = ?3)
           AND (?4 IS NULL OR ruleset_version = ?4)",
        params![
            window.from_millis(),
            window.to_millis(),
            filter.repo.as_deref(),
            filter.ruleset_version.as_deref(),
        ],
        |row| row.get(0),
    )
    .context("failed to count runs in window")
}

fn top_versions(
    conn: &Connection,
    column: &str,
    window: &TimeWindow,
    filter: &RunFilter,
) -> Result<Vec<VersionCount>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {column}, COUNT(*) AS runs FROM runs WHERE {RUN_FILTER_SQL}
             GROUP BY {column}
             ORDER BY runs DESC, {column} ASC
             LIMIT ?7"
        ))
        .with_context(|| format!("failed to prepare top {column} query"))?;
    let rows = stmt
        .query_map(
            params![
                window.from_millis(),
                window.to_millis(),
                filter.repo.as_deref(),
                filter.ruleset_version.as_deref(),
                filter.agent_version.as_deref(),
                filter.code_change_id.as_deref(),
                TOP_VERSIONS_LIMIT,
            ],
            |row| {
                Ok(VersionCount {
                    version: row.get(0)?,
                    runs: row.get(1)?,
                })
            },
        )
        .with_context(|| format!("failed to query top {column}"))?;
    collect_rows(rows)
}

fn page<T>(rows: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    rows.into_iter().skip(offset).take(limit).collect()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
