//! Domain model for code-review agent run metrics.
//!
//! This crate is pure: it validates run reports, defines how a run is folded
//! into its change summary, and derives rule-quality and change-effectiveness
//! signals from in-memory snapshots. Persistence lives in
//! `review-metrics-store-sqlite`.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};

pub mod effectiveness;
pub mod fold;
pub mod rule_quality;

pub use effectiveness::{
    classify_change, rank_changes, sort_changes, summarize_changes, ChangeClass,
    ChangeEffectivenessRow, ChangeEffectivenessSummary, ChangeSortKey,
};
pub use fold::{fold_change_summary, improvement_rate, FoldInput};
pub use rule_quality::{
    apply_thresholds, attach_hit_rates, change_peaks, change_statistics, derive_rule_quality,
    merge_rule_quality, rank_rules, resolve_final_states, rule_totals, sort_rules,
    summarize_rule_quality, ChangePeak, FinalState, RuleChangeStats, RuleQuality,
    RuleQualityFilter, RuleQualitySummary, RuleSortKey, RuleTotals,
};

/// Unix seconds of `0001-01-01T00:00:00Z`, the value clients send for an unset time.
const ZERO_TIMESTAMP_UNIX: i64 = -62_135_596_800;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MetricsError {
    #[error("validation error: {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl MetricsError {
    #[must_use]
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Identity of one code change under review.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChangeKey {
    pub repo: String,
    pub code_change_id: String,
}

impl ChangeKey {
    #[must_use]
    pub fn new(repo: impl Into<String>, code_change_id: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            code_change_id: code_change_id.into(),
        }
    }
}

impl Display for ChangeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repo, self.code_change_id)
    }
}

/// Natural idempotency key of a run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunKey {
    pub repo: String,
    pub code_change_id: String,
    pub agent_run_id: String,
}

impl Display for RunKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.repo, self.code_change_id, self.agent_run_id
        )
    }
}

/// Inclusive `[from, to]` UTC window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct TimeWindow {
    #[serde(with = "rfc3339")]
    pub from: OffsetDateTime,
    #[serde(with = "rfc3339")]
    pub to: OffsetDateTime,
}

impl TimeWindow {
    /// Builds a window, normalizing both bounds to UTC.
    ///
    /// # Errors
    /// Returns [`MetricsError::Validation`] when `to < from`.
    pub fn new(from: OffsetDateTime, to: OffsetDateTime) -> Result<Self, MetricsError> {
        let from = from.to_offset(UtcOffset::UTC);
        let to = to.to_offset(UtcOffset::UTC);
        if to < from {
            return Err(MetricsError::validation("to", "to must be >= from"));
        }
        Ok(Self { from, to })
    }

    /// Window ending at `to` and reaching back `span`.
    ///
    /// # Errors
    /// Returns [`MetricsError::Validation`] when `span` is negative.
    pub fn trailing(to: OffsetDateTime, span: Duration) -> Result<Self, MetricsError> {
        Self::new(to - span, to)
    }

    #[must_use]
    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        self.from <= instant && instant <= self.to
    }

    #[must_use]
    pub fn from_millis(&self) -> i64 {
        to_unix_millis(self.from)
    }

    #[must_use]
    pub fn to_millis(&self) -> i64 {
        to_unix_millis(self.to)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// Ranking direction for top-N queries: `High` puts the best rates first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Low,
    #[default]
    High,
}

impl Direction {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    #[must_use]
    pub fn order(self) -> SortOrder {
        match self {
            Self::Low => SortOrder::Asc,
            Self::High => SortOrder::Desc,
        }
    }
}

/// A run report as submitted by the review agent.
///
/// Optional fields model "absent on the wire"; [`RunReport::validate`] turns
/// them into a [`ValidatedRun`] or names the first field that is wrong.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunReport {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub code_change_id: String,
    #[serde(default)]
    pub agent_run_id: String,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub ruleset_version: String,
    #[serde(default, with = "rfc3339::option")]
    pub reported_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub diff_lines: Option<u32>,
    #[serde(default)]
    pub triggered_total_hits: u32,
    #[serde(default)]
    pub rule_hits: Option<BTreeMap<String, u32>>,
}

impl RunReport {
    /// Validates a report before it is allowed anywhere near the store.
    ///
    /// # Errors
    /// Returns [`MetricsError::Validation`] naming the first violated field.
    pub fn validate(&self) -> Result<ValidatedRun, MetricsError> {
        for (field, value) in [
            ("repo", &self.repo),
            ("code_change_id", &self.code_change_id),
            ("agent_run_id", &self.agent_run_id),
            ("agent_version", &self.agent_version),
            ("ruleset_version", &self.ruleset_version),
        ] {
            if value.trim().is_empty() {
                return Err(MetricsError::validation(field, format!("{field} is required")));
            }
        }

        let Some(reported_at) = self.reported_at else {
            return Err(MetricsError::validation(
                "reported_at",
                "reported_at is required",
            ));
        };
        if reported_at.unix_timestamp() == ZERO_TIMESTAMP_UNIX && reported_at.nanosecond() == 0 {
            return Err(MetricsError::validation(
                "reported_at",
                "reported_at must not be the zero timestamp",
            ));
        }

        let Some(diff_lines) = self.diff_lines else {
            return Err(MetricsError::validation(
                "diff_lines",
                "diff_lines is required",
            ));
        };

        let Some(rule_hits) = &self.rule_hits else {
            return Err(MetricsError::validation(
                "rule_hits",
                "rule_hits is required",
            ));
        };
        if self.triggered_total_hits > 0 && rule_hits.is_empty() {
            return Err(MetricsError::validation(
                "rule_hits",
                "rule_hits cannot be empty when triggered_total_hits > 0",
            ));
        }
        if rule_hits.keys().any(|rule_id| rule_id.trim().is_empty()) {
            return Err(MetricsError::validation(
                "rule_hits",
                "rule_hits keys must be non-empty rule ids",
            ));
        }

        let sum: u64 = rule_hits.values().copied().map(u64::from).sum();
        if sum != u64::from(self.triggered_total_hits) {
            return Err(MetricsError::validation(
                "triggered_total_hits",
                format!(
                    "triggered_total_hits must equal sum(rule_hits): {} != {sum}",
                    self.triggered_total_hits
                ),
            ));
        }

        Ok(ValidatedRun {
            repo: self.repo.clone(),
            code_change_id: self.code_change_id.clone(),
            agent_run_id: self.agent_run_id.clone(),
            agent_version: self.agent_version.clone(),
            ruleset_version: self.ruleset_version.clone(),
            reported_at: truncate_to_millis(reported_at.to_offset(UtcOffset::UTC)),
            diff_lines,
            triggered_total_hits: self.triggered_total_hits,
            rule_hits: rule_hits.clone(),
        })
    }
}

/// A report that passed validation; `reported_at` is UTC at millisecond precision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatedRun {
    pub repo: String,
    pub code_change_id: String,
    pub agent_run_id: String,
    pub agent_version: String,
    pub ruleset_version: String,
    #[serde(with = "rfc3339")]
    pub reported_at: OffsetDateTime,
    pub diff_lines: u32,
    pub triggered_total_hits: u32,
    pub rule_hits: BTreeMap<String, u32>,
}

impl ValidatedRun {
    #[must_use]
    pub fn run_key(&self) -> RunKey {
        RunKey {
            repo: self.repo.clone(),
            code_change_id: self.code_change_id.clone(),
            agent_run_id: self.agent_run_id.clone(),
        }
    }

    #[must_use]
    pub fn change_key(&self) -> ChangeKey {
        ChangeKey::new(self.repo.clone(), self.code_change_id.clone())
    }
}

/// Outcome of an ingestion call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordedRun {
    pub run_id: i64,
    pub idempotent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: i64,
    pub repo: String,
    pub code_change_id: String,
    pub agent_run_id: String,
    pub agent_version: String,
    pub ruleset_version: String,
    #[serde(with = "rfc3339")]
    pub reported_at: OffsetDateTime,
    pub diff_lines: u32,
    pub triggered_total_hits: u32,
    pub rule_hits: BTreeMap<String, u32>,
    #[serde(with = "rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// One rule's hit count within one run; `reported_at` is copied from the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleHitRecord {
    pub run_id: i64,
    pub repo: String,
    pub code_change_id: String,
    #[serde(with = "rfc3339")]
    pub reported_at: OffsetDateTime,
    pub ruleset_version: String,
    pub rule_id: String,
    pub hit_count: u32,
}

/// Running aggregate over every run folded in for one change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeSummary {
    pub repo: String,
    pub code_change_id: String,
    pub run_count: u32,
    #[serde(with = "rfc3339")]
    pub first_reported_at: OffsetDateTime,
    #[serde(with = "rfc3339")]
    pub last_reported_at: OffsetDateTime,
    pub max_total_hits: u32,
    pub max_run_id: i64,
    pub min_total_hits: u32,
    pub min_run_id: i64,
    pub last_ruleset_version: String,
    pub improvement_rate: Option<f64>,
}

impl ChangeSummary {
    #[must_use]
    pub fn change_key(&self) -> ChangeKey {
        ChangeKey::new(self.repo.clone(), self.code_change_id.clone())
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`MetricsError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, MetricsError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            MetricsError::validation("timestamp", format!("invalid RFC3339 timestamp: {err}"))
        })?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(MetricsError::validation(
            "timestamp",
            "timestamp MUST use UTC offset Z",
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`MetricsError::Internal`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, MetricsError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| MetricsError::Internal(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn to_unix_millis(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Inverse of [`to_unix_millis`].
///
/// # Errors
/// Returns [`MetricsError::Internal`] when the value is outside the
/// representable range.
pub fn from_unix_millis(millis: i64) -> Result<OffsetDateTime, MetricsError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| MetricsError::Internal(format!("invalid stored timestamp {millis}: {err}")))
}

#[must_use]
pub fn truncate_to_millis(value: OffsetDateTime) -> OffsetDateTime {
    let millis = value.millisecond();
    value.replace_millisecond(millis).unwrap_or(value)
}

/// Serde adapter: RFC3339 strings for `OffsetDateTime` fields.
pub mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    /// # Errors
    /// Propagates formatting failures as serializer errors.
    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = super::format_rfc3339(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    /// # Errors
    /// Rejects strings that are not RFC3339.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        OffsetDateTime::parse(&raw, &time::format_description::well_known::Rfc3339)
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::OffsetDateTime;

        /// # Errors
        /// Propagates formatting failures as serializer errors.
        pub fn serialize<S: Serializer>(
            value: &Option<OffsetDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(inner) => super::serialize(inner, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        /// Rejects strings that are not RFC3339.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<OffsetDateTime>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|value| {
                OffsetDateTime::parse(&value, &time::format_description::well_known::Rfc3339)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }
}
