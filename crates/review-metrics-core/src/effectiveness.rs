//! Change effectiveness: classifying and ranking change summaries.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::rule_quality::{compare_nullable, directed, mean};
use crate::{ChangeSummary, Direction, SortOrder};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeClass {
    Improving,
    Stable,
}

impl ChangeClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Stable => "stable",
        }
    }
}

#[must_use]
pub fn classify_change(summary: &ChangeSummary) -> ChangeClass {
    if summary.max_total_hits > summary.min_total_hits {
        ChangeClass::Improving
    } else {
        ChangeClass::Stable
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEffectivenessSummary {
    pub total_changes: u64,
    pub improving_changes: u64,
    pub stable_changes: u64,
    pub avg_improvement_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEffectivenessRow {
    pub repo: String,
    pub code_change_id: String,
    pub run_count: u32,
    #[serde(with = "crate::rfc3339")]
    pub first_reported_at: OffsetDateTime,
    #[serde(with = "crate::rfc3339")]
    pub last_reported_at: OffsetDateTime,
    pub max_total_hits: u32,
    pub min_total_hits: u32,
    pub delta: u32,
    pub improvement_rate: Option<f64>,
    pub last_ruleset_version: String,
    pub class: ChangeClass,
}

impl From<&ChangeSummary> for ChangeEffectivenessRow {
    fn from(summary: &ChangeSummary) -> Self {
        Self {
            repo: summary.repo.clone(),
            code_change_id: summary.code_change_id.clone(),
            run_count: summary.run_count,
            first_reported_at: summary.first_reported_at,
            last_reported_at: summary.last_reported_at,
            max_total_hits: summary.max_total_hits,
            min_total_hits: summary.min_total_hits,
            delta: summary.max_total_hits.saturating_sub(summary.min_total_hits),
            improvement_rate: summary.improvement_rate,
            last_ruleset_version: summary.last_ruleset_version.clone(),
            class: classify_change(summary),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSortKey {
    #[default]
    ImprovementRate,
    Delta,
    LastReportedAt,
    RunCount,
    MaxTotalHits,
    MinTotalHits,
}

impl ChangeSortKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImprovementRate => "improvement_rate",
            Self::Delta => "delta",
            Self::LastReportedAt => "last_reported_at",
            Self::RunCount => "run_count",
            Self::MaxTotalHits => "max_total_hits",
            Self::MinTotalHits => "min_total_hits",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "improvement_rate" => Some(Self::ImprovementRate),
            "delta" => Some(Self::Delta),
            "last_reported_at" => Some(Self::LastReportedAt),
            "run_count" => Some(Self::RunCount),
            "max_total_hits" => Some(Self::MaxTotalHits),
            "min_total_hits" => Some(Self::MinTotalHits),
            _ => None,
        }
    }
}

/// Counts and mean rate over summaries already scoped by window and `min_runs`.
#[must_use]
pub fn summarize_changes(summaries: &[ChangeSummary]) -> ChangeEffectivenessSummary {
    let improving = summaries
        .iter()
        .filter(|summary| classify_change(summary) == ChangeClass::Improving)
        .count() as u64;
    ChangeEffectivenessSummary {
        total_changes: summaries.len() as u64,
        improving_changes: improving,
        stable_changes: summaries.len() as u64 - improving,
        avg_improvement_rate: mean(summaries.iter().filter_map(|summary| summary.improvement_rate)),
    }
}

pub fn sort_changes(rows: &mut [ChangeEffectivenessRow], key: ChangeSortKey, order: SortOrder) {
    rows.sort_by(|left, right| {
        let primary = match key {
            ChangeSortKey::ImprovementRate => {
                compare_nullable(left.improvement_rate, right.improvement_rate, order)
            }
            ChangeSortKey::Delta => directed(left.delta.cmp(&right.delta), order),
            ChangeSortKey::LastReportedAt => {
                directed(left.last_reported_at.cmp(&right.last_reported_at), order)
            }
            ChangeSortKey::RunCount => directed(left.run_count.cmp(&right.run_count), order),
            ChangeSortKey::MaxTotalHits => {
                directed(left.max_total_hits.cmp(&right.max_total_hits), order)
            }
            ChangeSortKey::MinTotalHits => {
                directed(left.min_total_hits.cmp(&right.min_total_hits), order)
            }
        };
        primary
            .then_with(|| right.last_reported_at.cmp(&left.last_reported_at))
            .then_with(|| tie_by_identity(left, right))
    });
}

fn tie_by_identity(left: &ChangeEffectivenessRow, right: &ChangeEffectivenessRow) -> Ordering {
    left.repo
        .cmp(&right.repo)
        .then_with(|| left.code_change_id.cmp(&right.code_change_id))
}

/// Top `limit` changes by improvement rate; rows without a rate are excluded.
#[must_use]
pub fn rank_changes(
    summaries: &[ChangeSummary],
    direction: Direction,
    limit: usize,
) -> Vec<ChangeEffectivenessRow> {
    let mut rows: Vec<ChangeEffectivenessRow> = summaries
        .iter()
        .filter(|summary| summary.improvement_rate.is_some())
        .map(ChangeEffectivenessRow::from)
        .collect();
    sort_changes(&mut rows, ChangeSortKey::ImprovementRate, direction.order());
    rows.truncate(limit);
    rows
}
