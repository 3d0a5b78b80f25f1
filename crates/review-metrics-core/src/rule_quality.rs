//! Rule-quality derivation over a windowed snapshot of rule hits.
//!
//! Each stage is a separate function producing an explicit relation:
//!
//! 1. [`rule_totals`]: per-rule totals.
//! 2. [`change_peaks`]: per (rule, change) peak and last firing.
//! 3. [`resolve_final_states`]: final hit per (rule, change), with
//!    "disappeared" detection against the change summary.
//! 4. [`change_statistics`]: per-rule fix / disappear counts and mean drop.
//! 5. [`merge_rule_quality`]: left join of stage 1 with stage 4.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{ChangeKey, ChangeSummary, Direction, RuleHitRecord, SortOrder, TimeWindow};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RuleQualityFilter {
    pub repo: Option<String>,
    pub ruleset_version: Option<String>,
    pub rule_id: Option<String>,
}

impl RuleQualityFilter {
    #[must_use]
    pub fn matches(&self, hit: &RuleHitRecord) -> bool {
        matches_opt(self.repo.as_deref(), &hit.repo)
            && matches_opt(self.ruleset_version.as_deref(), &hit.ruleset_version)
            && matches_opt(self.rule_id.as_deref(), &hit.rule_id)
    }
}

fn matches_opt(expected: Option<&str>, actual: &str) -> bool {
    expected.map_or(true, |value| value == actual)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleTotals {
    pub rule_id: String,
    pub total_hits: u64,
    pub run_count: u64,
    #[serde(with = "crate::rfc3339")]
    pub last_seen_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangePeak {
    pub rule_id: String,
    pub change: ChangeKey,
    pub max_hit: u32,
    #[serde(with = "crate::rfc3339")]
    pub last_hit_time: OffsetDateTime,
    /// Hit count observed at `last_hit_time`; the largest one if several
    /// hits share that instant.
    pub recorded_hit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalState {
    pub rule_id: String,
    pub change: ChangeKey,
    pub max_hit: u32,
    pub final_hit: u32,
    pub disappeared: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleChangeStats {
    pub rule_id: String,
    pub change_count: u64,
    pub fix_count: u64,
    pub disappear_count: u64,
    pub avg_drop: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleQuality {
    pub rule_id: String,
    pub total_hits: u64,
    pub run_count: u64,
    #[serde(with = "crate::rfc3339")]
    pub last_seen_at: OffsetDateTime,
    pub change_count: u64,
    pub fix_count: u64,
    pub disappear_count: u64,
    pub fix_rate: Option<f64>,
    pub disappear_rate: Option<f64>,
    pub avg_drop: Option<f64>,
    pub hit_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleQualitySummary {
    pub total_rules: u64,
    pub avg_fix_rate: Option<f64>,
    pub avg_disappear_rate: Option<f64>,
    pub avg_hit_rate: Option<f64>,
    pub total_runs: u64,
    pub total_hit_count: u64,
    pub total_rule_run_count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleSortKey {
    #[default]
    FixRate,
    DisappearRate,
    TotalHits,
    RunCount,
    LastSeenAt,
    AvgDrop,
    ChangeCount,
}

impl RuleSortKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FixRate => "fix_rate",
            Self::DisappearRate => "disappear_rate",
            Self::TotalHits => "total_hits",
            Self::RunCount => "run_count",
            Self::LastSeenAt => "last_seen_at",
            Self::AvgDrop => "avg_drop",
            Self::ChangeCount => "change_count",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fix_rate" => Some(Self::FixRate),
            "disappear_rate" => Some(Self::DisappearRate),
            "total_hits" => Some(Self::TotalHits),
            "run_count" => Some(Self::RunCount),
            "last_seen_at" => Some(Self::LastSeenAt),
            "avg_drop" => Some(Self::AvgDrop),
            "change_count" => Some(Self::ChangeCount),
            _ => None,
        }
    }
}

/// Stage 1.
#[must_use]
pub fn rule_totals(hits: &[RuleHitRecord]) -> Vec<RuleTotals> {
    let mut grouped: BTreeMap<&str, (u64, BTreeSet<i64>, OffsetDateTime)> = BTreeMap::new();
    for hit in hits {
        let entry = grouped
            .entry(hit.rule_id.as_str())
            .or_insert_with(|| (0, BTreeSet::new(), hit.reported_at));
        entry.0 += u64::from(hit.hit_count);
        entry.1.insert(hit.run_id);
        entry.2 = entry.2.max(hit.reported_at);
    }

    grouped
        .into_iter()
        .map(|(rule_id, (total_hits, runs, last_seen_at))| RuleTotals {
            rule_id: rule_id.to_string(),
            total_hits,
            run_count: runs.len() as u64,
            last_seen_at,
        })
        .collect()
}

/// Stage 2.
#[must_use]
pub fn change_peaks(hits: &[RuleHitRecord]) -> Vec<ChangePeak> {
    let mut grouped: BTreeMap<(&str, &str, &str), ChangePeak> = BTreeMap::new();
    for hit in hits {
        let key = (
            hit.rule_id.as_str(),
            hit.repo.as_str(),
            hit.code_change_id.as_str(),
        );
        match grouped.get_mut(&key) {
            None => {
                grouped.insert(
                    key,
                    ChangePeak {
                        rule_id: hit.rule_id.clone(),
                        change: ChangeKey::new(hit.repo.clone(), hit.code_change_id.clone()),
                        max_hit: hit.hit_count,
                        last_hit_time: hit.reported_at,
                        recorded_hit: hit.hit_count,
                    },
                );
            }
            Some(peak) => {
                peak.max_hit = peak.max_hit.max(hit.hit_count);
                match hit.reported_at.cmp(&peak.last_hit_time) {
                    Ordering::Greater => {
                        peak.last_hit_time = hit.reported_at;
                        peak.recorded_hit = hit.hit_count;
                    }
                    Ordering::Equal => peak.recorded_hit = peak.recorded_hit.max(hit.hit_count),
                    Ordering::Less => {}
                }
            }
        }
    }
    grouped.into_values().collect()
}

/// Stage 3. Peaks whose change has no summary, or whose summary was last
/// reported outside the window, are dropped.
#[must_use]
pub fn resolve_final_states(
    peaks: &[ChangePeak],
    summaries: &BTreeMap<ChangeKey, ChangeSummary>,
    window: &TimeWindow,
) -> Vec<FinalState> {
    peaks
        .iter()
        .filter_map(|peak| {
            let summary = summaries.get(&peak.change)?;
            if !window.contains(summary.last_reported_at) {
                return None;
            }
            let disappeared = summary.last_reported_at > peak.last_hit_time;
            let final_hit = if disappeared { 0 } else { peak.recorded_hit };
            Some(FinalState {
                rule_id: peak.rule_id.clone(),
                change: peak.change.clone(),
                max_hit: peak.max_hit,
                final_hit,
                disappeared,
            })
        })
        .collect()
}

/// Stage 4.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn change_statistics(states: &[FinalState]) -> Vec<RuleChangeStats> {
    let mut grouped: BTreeMap<&str, (u64, u64, u64, u64)> = BTreeMap::new();
    for state in states {
        let entry = grouped.entry(state.rule_id.as_str()).or_default();
        entry.0 += 1;
        if state.final_hit < state.max_hit {
            entry.1 += 1;
        }
        if state.final_hit == 0 && state.max_hit > 0 {
            entry.2 += 1;
        }
        entry.3 += u64::from(state.max_hit.saturating_sub(state.final_hit));
    }

    grouped
        .into_iter()
        .map(
            |(rule_id, (change_count, fix_count, disappear_count, drop_sum))| RuleChangeStats {
                rule_id: rule_id.to_string(),
                change_count,
                fix_count,
                disappear_count,
                avg_drop: drop_sum as f64 / change_count as f64,
            },
        )
        .collect()
}

/// Stage 5. Every rule from stage 1 survives; rates stay null without
/// qualifying changes.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn merge_rule_quality(totals: &[RuleTotals], stats: &[RuleChangeStats]) -> Vec<RuleQuality> {
    let by_rule: BTreeMap<&str, &RuleChangeStats> =
        stats.iter().map(|row| (row.rule_id.as_str(), row)).collect();

    totals
        .iter()
        .map(|total| {
            let stat = by_rule
                .get(total.rule_id.as_str())
                .copied()
                .filter(|stat| stat.change_count > 0);
            RuleQuality {
                rule_id: total.rule_id.clone(),
                total_hits: total.total_hits,
                run_count: total.run_count,
                last_seen_at: total.last_seen_at,
                change_count: stat.map_or(0, |stat| stat.change_count),
                fix_count: stat.map_or(0, |stat| stat.fix_count),
                disappear_count: stat.map_or(0, |stat| stat.disappear_count),
                fix_rate: stat.map(|stat| stat.fix_count as f64 / stat.change_count as f64),
                disappear_rate: stat
                    .map(|stat| stat.disappear_count as f64 / stat.change_count as f64),
                avg_drop: stat.map(|stat| stat.avg_drop),
                hit_rate: None,
            }
        })
        .collect()
}

/// Runs all five stages over hits inside `window` that match `filter`.
#[must_use]
pub fn derive_rule_quality(
    hits: &[RuleHitRecord],
    summaries: &BTreeMap<ChangeKey, ChangeSummary>,
    window: &TimeWindow,
    filter: &RuleQualityFilter,
) -> Vec<RuleQuality> {
    let scoped: Vec<RuleHitRecord> = hits
        .iter()
        .filter(|hit| window.contains(hit.reported_at) && filter.matches(hit))
        .cloned()
        .collect();

    let totals = rule_totals(&scoped);
    let peaks = change_peaks(&scoped);
    let states = resolve_final_states(&peaks, summaries, window);
    let stats = change_statistics(&states);
    merge_rule_quality(&totals, &stats)
}

#[must_use]
pub fn apply_thresholds(rows: Vec<RuleQuality>, min_runs: u64, min_changes: u64) -> Vec<RuleQuality> {
    rows.into_iter()
        .filter(|row| row.run_count >= min_runs && row.change_count >= min_changes)
        .collect()
}

/// Sets `hit_rate = run_count / total_runs`; null when `total_runs == 0`.
#[allow(clippy::cast_precision_loss)]
pub fn attach_hit_rates(rows: &mut [RuleQuality], total_runs: u64) {
    for row in rows {
        row.hit_rate = (total_runs > 0).then(|| row.run_count as f64 / total_runs as f64);
    }
}

#[must_use]
pub fn summarize_rule_quality(rows: &[RuleQuality], total_runs: u64) -> RuleQualitySummary {
    RuleQualitySummary {
        total_rules: rows.len() as u64,
        avg_fix_rate: mean(rows.iter().filter_map(|row| row.fix_rate)),
        avg_disappear_rate: mean(rows.iter().filter_map(|row| row.disappear_rate)),
        avg_hit_rate: mean(rows.iter().filter_map(|row| row.hit_rate)),
        total_runs,
        total_hit_count: rows.iter().map(|row| row.total_hits).sum(),
        total_rule_run_count: rows.iter().map(|row| row.run_count).sum(),
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0_f64, 0_u64), |(sum, count), value| {
        (sum + value, count + 1)
    });
    (count > 0).then(|| sum / count as f64)
}

/// Nulls sort last in both directions.
pub(crate) fn compare_nullable(left: Option<f64>, right: Option<f64>, order: SortOrder) -> Ordering {
    match (left, right) {
        (Some(left), Some(right)) => directed(left.total_cmp(&right), order),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub(crate) fn directed(ordering: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Asc => ordering,
        SortOrder::Desc => ordering.reverse(),
    }
}

pub fn sort_rules(rows: &mut [RuleQuality], key: RuleSortKey, order: SortOrder) {
    rows.sort_by(|left, right| {
        let primary = match key {
            RuleSortKey::FixRate => compare_nullable(left.fix_rate, right.fix_rate, order),
            RuleSortKey::DisappearRate => {
                compare_nullable(left.disappear_rate, right.disappear_rate, order)
            }
            RuleSortKey::AvgDrop => compare_nullable(left.avg_drop, right.avg_drop, order),
            RuleSortKey::TotalHits => directed(left.total_hits.cmp(&right.total_hits), order),
            RuleSortKey::RunCount => directed(left.run_count.cmp(&right.run_count), order),
            RuleSortKey::ChangeCount => {
                directed(left.change_count.cmp(&right.change_count), order)
            }
            RuleSortKey::LastSeenAt => directed(left.last_seen_at.cmp(&right.last_seen_at), order),
        };
        primary
            .then_with(|| right.last_seen_at.cmp(&left.last_seen_at))
            .then_with(|| left.rule_id.cmp(&right.rule_id))
    });
}

/// Top `limit` rules by fix rate.
#[must_use]
pub fn rank_rules(mut rows: Vec<RuleQuality>, direction: Direction, limit: usize) -> Vec<RuleQuality> {
    sort_rules(&mut rows, RuleSortKey::FixRate, direction.order());
    rows.truncate(limit);
    rows
}
