use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use serde::Serialize;

use crate::transitions::TransitionMasker;
use crate::AnalysisError;

/// Actual and possible transition counts for one lag.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct LagBin {
    pub lag: i64,
    pub actual: u64,
    pub possible: u64,
    /// `None` when no transition at this lag was ever possible.
    pub prob: Option<f64>,
}

/// Optional source and target masks for one recall sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListMasks {
    pub from: Option<Vec<bool>>,
    pub to: Option<Vec<bool>>,
}

/// Cumulative lag histogram over every lag in `-(L - 1)..=(L - 1)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagCounts {
    max_lag: i64,
    actual: Vec<u64>,
    possible: Vec<u64>,
}

impl LagCounts {
    /// # Errors
    /// Returns [`AnalysisError::Configuration`] when `list_length` is zero or
    /// too large to index lags.
    pub fn new(list_length: usize) -> Result<Self, AnalysisError> {
        let max_lag = i64::try_from(list_length)
            .ok()
            .filter(|length| *length > 0)
            .map(|length| length - 1)
            .ok_or_else(|| {
                AnalysisError::Configuration(format!(
                    "list_length MUST be a positive integer, got {list_length}"
                ))
            })?;
        let bins = 2 * list_length - 1;
        Ok(Self { max_lag, actual: vec![0; bins], possible: vec![0; bins] })
    }

    /// Counts over `sequences` using plain adjacent pairing.
    ///
    /// # Errors
    /// See [`LagCounts::new`] and [`LagCounts::add_list`].
    pub fn from_sequences(sequences: &[Vec<i64>], list_length: usize) -> Result<Self, AnalysisError> {
        let mut counts = Self::new(list_length)?;
        for recalls in sequences {
            counts.add_list(recalls)?;
        }
        Ok(counts)
    }

    /// Counts over `sequences` using the transition walk, so repeated recalls
    /// are excluded. `masks` is either empty or holds one entry per sequence.
    ///
    /// # Errors
    /// Returns [`AnalysisError::Configuration`] when `masks` is neither empty
    /// nor as long as `sequences`, or a mask does not fit its sequence.
    pub fn from_masked(
        sequences: &[Vec<i64>],
        masks: &[ListMasks],
        list_length: usize,
    ) -> Result<Self, AnalysisError> {
        if !masks.is_empty() && masks.len() != sequences.len() {
            return Err(AnalysisError::Configuration(format!(
                "got masks for {} lists but {} recall sequences",
                masks.len(),
                sequences.len()
            )));
        }
        let mut counts = Self::new(list_length)?;
        for (index, recalls) in sequences.iter().enumerate() {
            let masks = masks.get(index);
            counts.add_masked_list(
                recalls,
                masks.and_then(|masks| masks.from.as_deref()),
                masks.and_then(|masks| masks.to.as_deref()),
            )?;
        }
        Ok(counts)
    }

    #[must_use]
    pub fn list_length(&self) -> i64 {
        self.max_lag + 1
    }

    #[must_use]
    pub fn lags(&self) -> RangeInclusive<i64> {
        -self.max_lag..=self.max_lag
    }

    fn slot(&self, lag: i64) -> Option<usize> {
        if lag.abs() > self.max_lag {
            return None;
        }
        usize::try_from(lag + self.max_lag).ok()
    }

    fn check_position(&self, position: i64) -> Result<(), AnalysisError> {
        if (1..=self.list_length()).contains(&position) {
            Ok(())
        } else {
            Err(AnalysisError::Data(format!(
                "serial position {position} is outside 1..={}",
                self.list_length()
            )))
        }
    }

    fn bump(counts: &mut [u64], slot: Option<usize>) {
        if let Some(slot) = slot {
            counts[slot] += 1;
        }
    }

    /// Count one transition from `prev` to `curr` and each candidate lag.
    pub fn record<'p, I>(&mut self, prev: i64, curr: i64, candidates: I)
    where
        I: IntoIterator<Item = &'p i64>,
    {
        let slot = self.slot(curr - prev);
        Self::bump(&mut self.actual, slot);
        for candidate in candidates {
            let slot = self.slot(candidate - prev);
            Self::bump(&mut self.possible, slot);
        }
    }

    /// Accumulate one list by plain adjacent pairing: every consecutive pair
    /// counts as a transition, and the candidates are all positions not yet
    /// used as a source in this list.
    ///
    /// # Errors
    /// Returns [`AnalysisError::Data`] when a position lies outside
    /// `1..=list_length`. Nothing is counted in that case.
    pub fn add_list(&mut self, recalls: &[i64]) -> Result<(), AnalysisError> {
        for position in recalls {
            self.check_position(*position)?;
        }

        let mut allowed: BTreeSet<i64> = (1..=self.list_length()).collect();
        for pair in recalls.windows(2) {
            let (prev, curr) = (pair[0], pair[1]);
            allowed.remove(&prev);
            self.record(prev, curr, &allowed);
        }
        Ok(())
    }

    /// Accumulate one list through [`TransitionMasker`], so repeats are skipped
    /// and the optional masks gate sources and targets. Positions outside
    /// `1..=list_length` never enter the pool and break the chain around them.
    ///
    /// # Errors
    /// Returns [`AnalysisError::Configuration`] when a mask length differs from
    /// the sequence length.
    pub fn add_masked_list(
        &mut self,
        recalls: &[i64],
        from_mask: Option<&[bool]>,
        to_mask: Option<&[bool]>,
    ) -> Result<(), AnalysisError> {
        let pool = (1..=self.list_length()).collect::<Vec<_>>();
        let mut masker = TransitionMasker::new(recalls, &pool);
        if let Some(mask) = from_mask {
            masker = masker.from_mask(mask);
        }
        if let Some(mask) = to_mask {
            masker = masker.to_mask(mask);
        }
        for transition in masker.transitions()? {
            self.record(transition.prev, transition.curr, &transition.possible);
        }
        Ok(())
    }

    #[must_use]
    pub fn actual(&self, lag: i64) -> u64 {
        self.slot(lag).map_or(0, |slot| self.actual[slot])
    }

    #[must_use]
    pub fn possible(&self, lag: i64) -> u64 {
        self.slot(lag).map_or(0, |slot| self.possible[slot])
    }

    #[must_use]
    pub fn total_actual(&self) -> u64 {
        self.actual.iter().sum()
    }

    /// One bin per lag in ascending order. Bins with no possible transitions
    /// carry `prob: None` rather than zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn bins(&self) -> Vec<LagBin> {
        self.lags()
            .zip(self.actual.iter().zip(&self.possible))
            .map(|(lag, (actual, possible))| LagBin {
                lag,
                actual: *actual,
                possible: *possible,
                prob: (*possible > 0).then(|| *actual as f64 / *possible as f64),
            })
            .collect()
    }
}

/// Conditional response probability by lag for one subject's lists.
///
/// # Errors
/// Returns [`AnalysisError::Configuration`] for a zero `list_length` and
/// [`AnalysisError::Data`] for serial positions outside `1..=list_length`.
pub fn lag_crp(sequences: &[Vec<i64>], list_length: usize) -> Result<Vec<LagBin>, AnalysisError> {
    LagCounts::from_sequences(sequences, list_length).map(|counts| counts.bins())
}
