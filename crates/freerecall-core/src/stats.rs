use std::collections::BTreeMap;

use serde::Serialize;

use crate::batch::{group_by_list, recalls_in_output_order, AlignedEvent};
use crate::distance::{indexed_lists, DistanceMatrix};
use crate::table::{Table, Value};
use crate::transitions::TransitionMasker;
use crate::AnalysisError;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SpcRow {
    pub subject: Value,
    pub input: i64,
    pub recall: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PnrRow {
    pub subject: Value,
    pub output: i64,
    pub input: i64,
    pub prob: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LagRankRow {
    pub subject: Value,
    pub rank: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DistanceRankRow {
    pub subject: Value,
    pub rank: Option<f64>,
}

fn studied(event: &AlignedEvent) -> Option<i64> {
    event.input.filter(|_| !event.intrusion && event.repeat == 0)
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

/// Serial position curve: per subject and input position, the fraction of
/// lists in which the studied item was recalled.
///
/// # Errors
/// See [`AlignedEvent::from_table`].
pub fn spc(aligned: &Table) -> Result<Vec<SpcRow>, AnalysisError> {
    let mut tallies: BTreeMap<(Value, i64), (u64, u64)> = BTreeMap::new();
    for event in AlignedEvent::from_table(aligned)? {
        let Some(input) = studied(&event) else {
            continue;
        };
        let (recalled, total) = tallies.entry((event.subject, input)).or_default();
        *recalled += u64::from(event.recalled);
        *total += 1;
    }

    Ok(tallies
        .into_iter()
        .filter_map(|((subject, input), (recalled, total))| {
            ratio(recalled, total).map(|recall| SpcRow { subject, input, recall })
        })
        .collect())
}

/// Probability of nth recall: per subject, output position `n` and input
/// position `i`, the share of lists whose n-th recall was a first recall of
/// position `i`, among lists whose n-th recall was a valid recall and in
/// which `i` had not yet been recalled.
///
/// Intrusions and repeats occupy their output position but count toward
/// neither total.
///
/// # Errors
/// Returns [`AnalysisError::Configuration`] for a zero `list_length` and
/// [`AnalysisError::Data`] for input positions outside `1..=list_length`,
/// besides the errors of [`AlignedEvent::from_table`].
pub fn pnr(aligned: &Table, list_length: usize) -> Result<Vec<PnrRow>, AnalysisError> {
    if list_length == 0 {
        return Err(AnalysisError::Configuration(
            "list_length MUST be a positive integer, got 0".to_string(),
        ));
    }
    let grouped = group_by_list(AlignedEvent::from_table(aligned)?);

    let mut rows = Vec::with_capacity(grouped.len() * list_length * list_length);
    for (subject, lists) in grouped {
        let mut actual = vec![vec![0_u64; list_length]; list_length];
        let mut possible = vec![vec![0_u64; list_length]; list_length];
        for events in lists.values() {
            let mut recalled = vec![false; list_length];
            for (n, event) in recalls_in_output_order(events)?.into_iter().take(list_length).enumerate() {
                if !event.is_valid_recall() {
                    continue;
                }
                let slot = event
                    .input
                    .and_then(|input| usize::try_from(input - 1).ok())
                    .filter(|slot| *slot < list_length)
                    .ok_or_else(|| {
                        AnalysisError::Data(format!(
                            "recalled item {} has input position outside 1..={list_length}",
                            event.item
                        ))
                    })?;
                for (position, done) in recalled.iter().enumerate() {
                    if !done {
                        possible[n][position] += 1;
                    }
                }
                actual[n][slot] += 1;
                recalled[slot] = true;
            }
        }

        for (output, (actual, possible)) in (1_i64..).zip(actual.iter().zip(&possible)) {
            for (input, (actual, possible)) in (1_i64..).zip(actual.iter().zip(possible)) {
                rows.push(PnrRow {
                    subject: subject.clone(),
                    output,
                    input,
                    prob: ratio(*actual, *possible),
                });
            }
        }
    }
    Ok(rows)
}

/// Percentile rank of `actual` among `candidates`, with ties sharing their
/// average rank. 1.0 means the actual value was the smallest candidate.
#[allow(clippy::cast_precision_loss)]
fn percentile_rank<T: PartialOrd>(actual: T, candidates: &[T]) -> Option<f64> {
    if candidates.len() < 2 {
        return None;
    }
    let below = candidates.iter().filter(|candidate| **candidate < actual).count();
    let tied = candidates.iter().filter(|candidate| **candidate == actual).count();
    let rank = below as f64 + (tied as f64 + 1.0) / 2.0;
    Some(1.0 - (rank - 1.0) / (candidates.len() as f64 - 1.0))
}

/// Lag rank: per subject, the mean percentile rank of each transition's
/// absolute lag among the absolute lags of its candidates.
///
/// Transitions come from the masked walk over each list's recalls, with the
/// list's studied positions as the pool. Intrusions stay in the sequence but
/// are never in the pool, so they break the chain around them. Transitions
/// with a single candidate are not ranked; a subject with no ranked
/// transition gets `rank: None`.
///
/// # Errors
/// See [`AlignedEvent::from_table`].
pub fn lag_rank(aligned: &Table) -> Result<Vec<LagRankRow>, AnalysisError> {
    let grouped = group_by_list(AlignedEvent::from_table(aligned)?);

    let mut rows = Vec::with_capacity(grouped.len());
    for (subject, lists) in grouped {
        let mut ranks = Vec::new();
        for events in lists.values() {
            let mut pool = events.iter().filter_map(studied).map(Some).collect::<Vec<_>>();
            pool.sort_unstable();
            let seq = recalls_in_output_order(events)?
                .into_iter()
                .map(|event| event.input.filter(|_| !event.intrusion))
                .collect::<Vec<_>>();

            for transition in TransitionMasker::new(&seq, &pool).transitions()? {
                let (Some(prev), Some(curr)) = (transition.prev, transition.curr) else {
                    continue;
                };
                let lags = transition
                    .possible
                    .iter()
                    .flatten()
                    .map(|candidate| (candidate - prev).abs())
                    .collect::<Vec<_>>();
                ranks.extend(percentile_rank((curr - prev).abs(), &lags));
            }
        }

        tracing::debug!(subject = %subject, transitions = ranks.len(), "ranked transition lags");
        rows.push(LagRankRow { subject, rank: mean(&ranks) });
    }
    Ok(rows)
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Distance rank: per subject, the mean percentile rank of each transition's
/// distance among the distances from the same source to its candidates.
///
/// Items are located in `distances` through the `index_key` column of the
/// aligned table. Transitions come from the same walk as [`lag_rank`], so
/// intrusions and items without an index break the chain, and transitions
/// with a single candidate are not ranked.
///
/// # Errors
/// Returns [`AnalysisError::Schema`] when `index_key` is missing and
/// [`AnalysisError::Data`] for an index outside `distances`, besides the
/// errors of [`AlignedEvent::from_table`].
pub fn distance_rank(
    aligned: &Table,
    index_key: &str,
    distances: &DistanceMatrix,
) -> Result<Vec<DistanceRankRow>, AnalysisError> {
    let subjects = indexed_lists(aligned, index_key, distances)?;

    let mut rows = Vec::with_capacity(subjects.len());
    for (subject, lists) in subjects {
        let mut ranks = Vec::new();
        for list in &lists {
            let pool = list.pool.iter().copied().map(Some).collect::<Vec<_>>();
            for transition in TransitionMasker::new(&list.recalls, &pool).transitions()? {
                let (Some(prev), Some(curr)) = (transition.prev, transition.curr) else {
                    continue;
                };
                let candidates = transition
                    .possible
                    .iter()
                    .flatten()
                    .map(|candidate| distances.distance(prev, *candidate))
                    .collect::<Result<Vec<_>, _>>()?;
                ranks.extend(percentile_rank(distances.distance(prev, curr)?, &candidates));
            }
        }
        tracing::debug!(subject = %subject, transitions = ranks.len(), "ranked transition distances");
        rows.push(DistanceRankRow { subject, rank: mean(&ranks) });
    }
    Ok(rows)
}
