//! Folding one newly recorded run into its change summary.
//!
//! The store applies the same rules as a single SQL upsert; this module is the
//! reference definition used by the consistency audit and by tests.

use time::OffsetDateTime;

use crate::{ChangeKey, ChangeSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldInput {
    pub run_id: i64,
    pub triggered_total_hits: u32,
    pub reported_at: OffsetDateTime,
    pub ruleset_version: String,
}

/// `(max - min) / max` once at least two runs exist and `max > 0`.
#[must_use]
pub fn improvement_rate(run_count: u32, max_total_hits: u32, min_total_hits: u32) -> Option<f64> {
    if run_count < 2 || max_total_hits == 0 {
        return None;
    }
    Some(f64::from(max_total_hits - min_total_hits) / f64::from(max_total_hits))
}

/// Produces the summary state after folding `input` into `current`.
///
/// Ties on max/min keep the existing run id. A run reported at the same
/// instant as the stored `last_reported_at` takes over `last_ruleset_version`.
#[must_use]
pub fn fold_change_summary(
    current: Option<&ChangeSummary>,
    key: &ChangeKey,
    input: &FoldInput,
) -> ChangeSummary {
    let Some(state) = current else {
        return ChangeSummary {
            repo: key.repo.clone(),
            code_change_id: key.code_change_id.clone(),
            run_count: 1,
            first_reported_at: input.reported_at,
            last_reported_at: input.reported_at,
            max_total_hits: input.triggered_total_hits,
            max_run_id: input.run_id,
            min_total_hits: input.triggered_total_hits,
            min_run_id: input.run_id,
            last_ruleset_version: input.ruleset_version.clone(),
            improvement_rate: None,
        };
    };

    let run_count = state.run_count.saturating_add(1);
    let (max_total_hits, max_run_id) = if input.triggered_total_hits > state.max_total_hits {
        (input.triggered_total_hits, input.run_id)
    } else {
        (state.max_total_hits, state.max_run_id)
    };
    let (min_total_hits, min_run_id) = if input.triggered_total_hits < state.min_total_hits {
        (input.triggered_total_hits, input.run_id)
    } else {
        (state.min_total_hits, state.min_run_id)
    };
    let last_ruleset_version = if input.reported_at >= state.last_reported_at {
        input.ruleset_version.clone()
    } else {
        state.last_ruleset_version.clone()
    };

    ChangeSummary {
        repo: state.repo.clone(),
        code_change_id: state.code_change_id.clone(),
        run_count,
        first_reported_at: state.first_reported_at.min(input.reported_at),
        last_reported_at: state.last_reported_at.max(input.reported_at),
        max_total_hits,
        max_run_id,
        min_total_hits,
        min_run_id,
        last_ruleset_version,
        improvement_rate: improvement_rate(run_count, max_total_hits, min_total_hits),
    }
}
