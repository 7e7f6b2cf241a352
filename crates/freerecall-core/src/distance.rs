use std::collections::BTreeSet;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::batch::{annotated_events, group_by_list, recalls_in_output_order, Execution};
use crate::table::{Table, Value};
use crate::transitions::TransitionMasker;
use crate::AnalysisError;

/// Square matrix of pairwise item distances, indexed by item index.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMatrix {
    size: usize,
    values: Vec<f64>,
}

impl DistanceMatrix {
    /// # Errors
    /// Returns [`AnalysisError::Configuration`] when the rows do not form a
    /// square matrix or a distance is NaN.
    pub fn new(rows: Vec<Vec<f64>>) -> Result<Self, AnalysisError> {
        let size = rows.len();
        let mut values = Vec::with_capacity(size * size);
        for (index, row) in rows.into_iter().enumerate() {
            if row.len() != size {
                return Err(AnalysisError::Configuration(format!(
                    "distance matrix row {index} has {} entries, expected {size}",
                    row.len()
                )));
            }
            if row.iter().any(|value| value.is_nan()) {
                return Err(AnalysisError::Configuration(format!(
                    "distance matrix row {index} contains NaN"
                )));
            }
            values.extend(row);
        }
        Ok(Self { size, values })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[must_use]
    pub fn get(&self, from: usize, to: usize) -> Option<f64> {
        if from >= self.size || to >= self.size {
            return None;
        }
        self.values.get(from * self.size + to).copied()
    }

    pub(crate) fn distance(&self, from: usize, to: usize) -> Result<f64, AnalysisError> {
        self.get(from, to).ok_or_else(|| {
            AnalysisError::Data(format!(
                "item index pair ({from}, {to}) is outside the {0}x{0} distance matrix",
                self.size
            ))
        })
    }
}

/// Actual and possible transition counts for one distance bin.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct DistanceBin {
    pub lower: f64,
    pub upper: f64,
    pub actual: u64,
    pub possible: u64,
    /// `None` when no transition into this bin was ever possible.
    pub prob: Option<f64>,
}

/// Cumulative histogram of transition distances over fixed bin edges.
///
/// Bins are half-open `[edges[i], edges[i + 1])` except the last, which also
/// holds its upper edge. Distances outside the edges are not counted.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceCounts {
    edges: Vec<f64>,
    count_unique: bool,
    actual: Vec<u64>,
    possible: Vec<u64>,
}

impl DistanceCounts {
    /// With `count_unique`, a bin counts as possible at most once per
    /// transition however many candidates fall into it.
    ///
    /// # Errors
    /// Returns [`AnalysisError::Configuration`] unless there are at least two
    /// finite, strictly increasing edges.
    pub fn new(edges: Vec<f64>, count_unique: bool) -> Result<Self, AnalysisError> {
        if edges.len() < 2 {
            return Err(AnalysisError::Configuration(format!(
                "distance bins need at least two edges, got {}",
                edges.len()
            )));
        }
        if edges.iter().any(|edge| !edge.is_finite())
            || edges.windows(2).any(|pair| pair[0] >= pair[1])
        {
            return Err(AnalysisError::Configuration(
                "distance bin edges MUST be finite and strictly increasing".to_string(),
            ));
        }
        let bins = edges.len() - 1;
        Ok(Self { edges, count_unique, actual: vec![0; bins], possible: vec![0; bins] })
    }

    #[must_use]
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Bin holding `distance`, if any.
    #[must_use]
    pub fn bin(&self, distance: f64) -> Option<usize> {
        let last = self.edges.len() - 1;
        if distance.is_nan() || distance < self.edges[0] || distance > self.edges[last] {
            return None;
        }
        if distance >= self.edges[last] {
            return Some(last - 1);
        }
        Some(self.edges.partition_point(|edge| *edge <= distance) - 1)
    }

    /// Count one transition at `distance` and the distances of its
    /// candidates.
    pub fn record<I>(&mut self, distance: f64, candidates: I)
    where
        I: IntoIterator<Item = f64>,
    {
        if let Some(bin) = self.bin(distance) {
            self.actual[bin] += 1;
        }
        let bins = candidates.into_iter().filter_map(|candidate| self.bin(candidate));
        if self.count_unique {
            for bin in bins.collect::<BTreeSet<_>>() {
                self.possible[bin] += 1;
            }
        } else {
            for bin in bins.collect::<Vec<_>>() {
                self.possible[bin] += 1;
            }
        }
    }

    /// Walk one recall sequence over `pool` and count every transition.
    ///
    /// Items are item indices into `distances`. `None` recalls (intrusions or
    /// items without an index) are never in the pool, so they break the
    /// chain; repeated recalls are skipped.
    ///
    /// # Errors
    /// Returns [`AnalysisError::Data`] when an index is outside `distances`.
    pub fn add_list(
        &mut self,
        distances: &DistanceMatrix,
        pool: &[usize],
        recalls: &[Option<usize>],
    ) -> Result<(), AnalysisError> {
        let pool = pool.iter().copied().map(Some).collect::<Vec<_>>();
        for transition in TransitionMasker::new(recalls, &pool).transitions()? {
            let (Some(prev), Some(curr)) = (transition.prev, transition.curr) else {
                continue;
            };
            let candidates = transition
                .possible
                .iter()
                .flatten()
                .map(|candidate| distances.distance(prev, *candidate))
                .collect::<Result<Vec<_>, _>>()?;
            self.record(distances.distance(prev, curr)?, candidates);
        }
        Ok(())
    }

    #[must_use]
    pub fn actual(&self) -> &[u64] {
        &self.actual
    }

    #[must_use]
    pub fn possible(&self) -> &[u64] {
        &self.possible
    }

    #[must_use]
    pub fn total_actual(&self) -> u64 {
        self.actual.iter().sum()
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn bins(&self) -> Vec<DistanceBin> {
        self.edges
            .windows(2)
            .zip(self.actual.iter().zip(&self.possible))
            .map(|(edges, (actual, possible))| DistanceBin {
                lower: edges[0],
                upper: edges[1],
                actual: *actual,
                possible: *possible,
                prob: (*possible > 0).then(|| *actual as f64 / *possible as f64),
            })
            .collect()
    }
}

/// Studied item indices and recalled item indices of one list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct IndexedList {
    pub(crate) pool: Vec<usize>,
    pub(crate) recalls: Vec<Option<usize>>,
}

/// Per subject, in ascending order, the indexed lists in ascending list order.
pub(crate) type IndexedSubjects = Vec<(Value, Vec<IndexedList>)>;

fn item_index(
    cell: &Value,
    column: &str,
    row: usize,
    size: usize,
) -> Result<Option<usize>, AnalysisError> {
    if cell.is_null() {
        return Ok(None);
    }
    cell.as_i64()
        .and_then(|index| usize::try_from(index).ok())
        .filter(|index| *index < size)
        .map(Some)
        .ok_or_else(|| {
            AnalysisError::Data(format!(
                "row {row} has `{column}` value {cell}, not an index below {size}"
            ))
        })
}

/// Read item indices from `index_key` and split each list into its pool of
/// studied indices and its recalls in output order.
///
/// # Errors
/// Returns [`AnalysisError::Schema`] when `index_key` or a required aligned
/// column is missing and [`AnalysisError::Data`] for an index that is not a
/// non-negative integer below the matrix size.
pub(crate) fn indexed_lists(
    aligned: &Table,
    index_key: &str,
    distances: &DistanceMatrix,
) -> Result<IndexedSubjects, AnalysisError> {
    let events = annotated_events(aligned, index_key, |cell, row| {
        item_index(cell, index_key, row, distances.len())
    })?;

    group_by_list(events)
        .into_iter()
        .map(|(subject, lists)| {
            let lists = lists
                .values()
                .map(|entries| {
                    let pool = entries
                        .iter()
                        .filter(|entry| {
                            let event = &entry.event;
                            event.input.is_some() && !event.intrusion && event.repeat == 0
                        })
                        .filter_map(|entry| entry.extra)
                        .collect();
                    let recalls = recalls_in_output_order(entries)?
                        .into_iter()
                        .map(|entry| entry.extra.filter(|_| !entry.event.intrusion))
                        .collect();
                    Ok(IndexedList { pool, recalls })
                })
                .collect::<Result<Vec<_>, AnalysisError>>()?;
            Ok((subject, lists))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DistanceCrpOptions {
    /// Aligned column holding each item's row in the distance matrix.
    pub index_key: String,
    pub edges: Vec<f64>,
    pub count_unique: bool,
    pub execution: Execution,
}

impl Default for DistanceCrpOptions {
    fn default() -> Self {
        Self {
            index_key: "item_index".to_string(),
            edges: Vec::new(),
            count_unique: false,
            execution: Execution::Serial,
        }
    }
}

type SubjectRows = Result<Vec<SubjectDistanceCrp>, AnalysisError>;

/// One output row of [`distance_crp_by_subject`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubjectDistanceCrp {
    pub subject: Value,
    pub bin: usize,
    pub lower: f64,
    pub upper: f64,
    pub prob: Option<f64>,
    pub actual: u64,
    pub possible: u64,
}

/// Conditional response probability by distance bin, per subject.
///
/// Transitions come from the walk over each list's recalls with the list's
/// studied items as the pool, so repeats are skipped and intrusions break
/// the chain.
///
/// # Errors
/// Returns [`AnalysisError::Configuration`] for invalid bin edges, besides
/// the errors of reading item indices and of [`DistanceCounts::add_list`].
pub fn distance_crp_by_subject(
    aligned: &Table,
    distances: &DistanceMatrix,
    options: &DistanceCrpOptions,
) -> Result<Vec<SubjectDistanceCrp>, AnalysisError> {
    let empty = DistanceCounts::new(options.edges.clone(), options.count_unique)?;
    let subjects = indexed_lists(aligned, &options.index_key, distances)?;

    let per_subject = |(subject, lists): &(Value, Vec<IndexedList>)| -> SubjectRows {
        let mut counts = empty.clone();
        for list in lists {
            counts.add_list(distances, &list.pool, &list.recalls)?;
        }
        tracing::debug!(
            subject = %subject,
            lists = lists.len(),
            transitions = counts.total_actual(),
            "accumulated distance counts"
        );
        Ok(counts
            .bins()
            .into_iter()
            .enumerate()
            .map(|(bin, counts)| SubjectDistanceCrp {
                subject: subject.clone(),
                bin,
                lower: counts.lower,
                upper: counts.upper,
                prob: counts.prob,
                actual: counts.actual,
                possible: counts.possible,
            })
            .collect())
    };

    let results = match options.execution {
        Execution::Serial => subjects.iter().map(per_subject).collect::<Result<Vec<_>, _>>()?,
        Execution::Parallel => subjects.par_iter().map(per_subject).collect::<Result<Vec<_>, _>>()?,
    };
    tracing::debug!(
        subjects = subjects.len(),
        bins = empty.actual().len(),
        count_unique = options.count_unique,
        "computed distance CRP by subject"
    );
    Ok(results.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Items 0-3 sit 1 apart, items 4-7 sit 3 apart, and the two blocks sit
    /// 2 apart.
    fn blocks() -> DistanceMatrix {
        let rows = (0..8)
            .map(|from: usize| {
                (0..8)
                    .map(|to: usize| match (from / 4, to / 4) {
                        _ if from == to => 0.0,
                        (0, 0) => 1.0,
                        (1, 1) => 3.0,
                        _ => 2.0,
                    })
                    .collect()
            })
            .collect();
        match DistanceMatrix::new(rows) {
            Ok(matrix) => matrix,
            Err(err) => panic!("fixture matrix should build: {err}"),
        }
    }

    fn counted(count_unique: bool) -> DistanceCounts {
        let mut counts = match DistanceCounts::new(vec![0.5, 1.5, 2.5, 3.5], count_unique) {
            Ok(counts) => counts,
            Err(err) => panic!("edges should be valid: {err}"),
        };
        let pool = (0..8).collect::<Vec<_>>();
        let recalls = [3, 2, 1, 7, 0, 6, 5].map(Some);
        if let Err(err) = counts.add_list(&blocks(), &pool, &recalls) {
            panic!("list should count: {err}");
        }
        counts
    }

    // Test IDs: DIST-001
    #[test]
    fn distance_counts_every_candidate() {
        let counts = counted(false);
        assert_eq!(counts.actual(), &[2, 3, 1]);
        assert_eq!(counts.possible(), &[6, 16, 5]);
    }

    // Test IDs: DIST-002
    #[test]
    fn distance_counts_each_bin_once_per_transition_when_unique() {
        let counts = counted(true);
        assert_eq!(counts.actual(), &[2, 3, 1]);
        assert_eq!(counts.possible(), &[3, 5, 2]);
        let probs = counts.bins().iter().map(|bin| bin.prob).collect::<Vec<_>>();
        assert_eq!(probs, vec![Some(2.0 / 3.0), Some(0.6), Some(0.5)]);
    }

    #[test]
    fn bins_are_half_open_with_closed_last_edge() {
        let counts = match DistanceCounts::new(vec![0.0, 1.0, 2.0], false) {
            Ok(counts) => counts,
            Err(err) => panic!("edges should be valid: {err}"),
        };
        assert_eq!(counts.bin(0.0), Some(0));
        assert_eq!(counts.bin(0.99), Some(0));
        assert_eq!(counts.bin(1.0), Some(1));
        assert_eq!(counts.bin(2.0), Some(1));
        assert_eq!(counts.bin(2.01), None);
        assert_eq!(counts.bin(-0.5), None);
        assert_eq!(counts.bin(f64::NAN), None);
    }

    #[test]
    fn invalid_edges_and_matrices_are_configuration_errors() {
        for edges in [vec![1.0], vec![1.0, 1.0], vec![2.0, 1.0], vec![0.0, f64::INFINITY]] {
            assert!(matches!(DistanceCounts::new(edges, false), Err(AnalysisError::Configuration(_))));
        }
        assert!(matches!(
            DistanceMatrix::new(vec![vec![0.0, 1.0], vec![1.0]]),
            Err(AnalysisError::Configuration(_))
        ));
        assert!(matches!(
            DistanceMatrix::new(vec![vec![f64::NAN]]),
            Err(AnalysisError::Configuration(_))
        ));
    }

    #[test]
    fn indices_outside_the_matrix_are_data_errors() {
        let mut counts = match DistanceCounts::new(vec![0.0, 4.0], false) {
            Ok(counts) => counts,
            Err(err) => panic!("edges should be valid: {err}"),
        };
        let result = counts.add_list(&blocks(), &[0, 9], &[Some(0), Some(9)]);
        assert!(matches!(result, Err(AnalysisError::Data(_))));
    }

    #[test]
    fn intrusions_break_the_chain() {
        let mut counts = match DistanceCounts::new(vec![0.5, 3.5], false) {
            Ok(counts) => counts,
            Err(err) => panic!("edges should be valid: {err}"),
        };
        if let Err(err) = counts.add_list(&blocks(), &[0, 1, 2], &[Some(0), None, Some(1), Some(2)]) {
            panic!("list should count: {err}");
        }
        assert_eq!(counts.total_actual(), 1);
        assert_eq!(counts.possible(), &[1]);
    }

    fn aligned_with_indices() -> Table {
        let columns = [
            "subject", "list", "item", "input", "output", "recalled", "repeat", "intrusion", "item_index",
        ];
        let mut table = Table::new(columns.iter().map(|column| (*column).to_string()).collect());
        let rows: [(i64, &str, Option<i64>, Option<i64>, i64, Option<i64>); 6] = [
            (1, "a", Some(1), Some(2), 0, Some(0)),
            (1, "b", Some(2), Some(1), 0, Some(1)),
            (1, "c", Some(3), None, 0, Some(4)),
            (1, "x", None, Some(3), 0, None),
            (2, "d", Some(1), Some(1), 0, Some(5)),
            (2, "e", Some(2), Some(2), 0, Some(6)),
        ];
        for (list, item, input, output, repeat, index) in rows {
            let row = vec![
                Value::Int(1),
                Value::Int(list),
                Value::from(item),
                Value::from(input),
                Value::from(output),
                Value::Bool(output.is_some()),
                Value::Int(repeat),
                Value::Bool(input.is_none()),
                Value::from(index),
            ];
            if let Err(err) = table.push_row(row) {
                panic!("fixture row should fit: {err}");
            }
        }
        table
    }

    // Test IDs: DIST-003
    #[test]
    fn subject_rows_cover_every_bin() {
        let options = DistanceCrpOptions { edges: vec![0.5, 1.5, 2.5, 3.5], ..DistanceCrpOptions::default() };
        let rows = match distance_crp_by_subject(&aligned_with_indices(), &blocks(), &options) {
            Ok(rows) => rows,
            Err(err) => panic!("distance CRP should compute: {err}"),
        };
        // List 1 runs 1 -> 0 with {0, 4} left; list 2 runs 5 -> 6 with {6} left.
        assert_eq!(rows.iter().map(|row| row.bin).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(rows.iter().map(|row| row.actual).collect::<Vec<_>>(), vec![1, 0, 1]);
        assert_eq!(rows.iter().map(|row| row.possible).collect::<Vec<_>>(), vec![1, 1, 1]);
        assert_eq!((rows[2].lower, rows[2].upper), (2.5, 3.5));

        let parallel = DistanceCrpOptions { execution: Execution::Parallel, ..options };
        match distance_crp_by_subject(&aligned_with_indices(), &blocks(), &parallel) {
            Ok(parallel_rows) => assert_eq!(parallel_rows, rows),
            Err(err) => panic!("distance CRP should compute: {err}"),
        }
    }

    #[test]
    fn missing_index_column_is_schema_error() {
        let options = DistanceCrpOptions {
            index_key: "position_index".to_string(),
            edges: vec![0.0, 4.0],
            ..DistanceCrpOptions::default()
        };
        let result = distance_crp_by_subject(&aligned_with_indices(), &blocks(), &options);
        assert!(matches!(result, Err(AnalysisError::Schema(message)) if message.contains("`position_index`")));
    }

    #[test]
    fn indices_beyond_the_matrix_are_rejected_on_read() {
        let small = match DistanceMatrix::new(vec![vec![0.0; 5]; 5]) {
            Ok(matrix) => matrix,
            Err(err) => panic!("matrix should build: {err}"),
        };
        let options = DistanceCrpOptions { edges: vec![0.0, 4.0], ..DistanceCrpOptions::default() };
        let result = distance_crp_by_subject(&aligned_with_indices(), &small, &options);
        assert!(matches!(result, Err(AnalysisError::Data(_))));
    }
}
