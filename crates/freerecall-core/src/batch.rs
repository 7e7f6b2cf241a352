use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::lag::{LagCounts, ListMasks};
use crate::table::{Table, Value};
use crate::AnalysisError;

/// Typed view of one aligned row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedEvent {
    pub subject: Value,
    pub list: Value,
    pub item: Value,
    pub input: Option<i64>,
    pub output: Option<i64>,
    pub recalled: bool,
    pub repeat: i64,
    pub intrusion: bool,
}

struct EventColumns {
    subject: usize,
    list: usize,
    input: usize,
    output: usize,
    recalled: usize,
    item: Option<usize>,
    repeat: Option<usize>,
    intrusion: Option<usize>,
}

impl AlignedEvent {
    /// Read events out of an aligned table by column name.
    ///
    /// `subject`, `list`, `input`, `output` and `recalled` are required.
    /// `item` defaults to null, `repeat` to zero and `intrusion` to whether
    /// `input` is absent.
    ///
    /// # Errors
    /// Returns [`AnalysisError::Schema`] for a missing required column and
    /// [`AnalysisError::Data`] for cells of the wrong kind.
    pub fn from_table(table: &Table) -> Result<Vec<Self>, AnalysisError> {
        let required =
            table.require_columns(["subject", "list", "input", "output", "recalled"], |name| {
                AnalysisError::Schema(format!("aligned table has no `{name}` column"))
            })?;
        let columns = EventColumns {
            subject: required[0],
            list: required[1],
            input: required[2],
            output: required[3],
            recalled: required[4],
            item: table.column_index("item"),
            repeat: table.column_index("repeat"),
            intrusion: table.column_index("intrusion"),
        };

        table
            .rows()
            .iter()
            .enumerate()
            .map(|(index, row)| Self::from_row(row, index, &columns))
            .collect()
    }

    fn from_row(
        row: &[Value],
        index: usize,
        columns: &EventColumns,
    ) -> Result<Self, AnalysisError> {
        let input = optional_int(&row[columns.input], "input", index)?;
        let output = optional_int(&row[columns.output], "output", index)?;
        let recalled = flag(&row[columns.recalled], "recalled", index)?;
        let repeat = match columns.repeat.map(|column| &row[column]) {
            None | Some(Value::Null) => 0,
            Some(cell) => cell.as_i64().ok_or_else(|| bad_cell("repeat", index, cell))?,
        };
        let intrusion = match columns.intrusion {
            None => input.is_none(),
            Some(column) => flag(&row[column], "intrusion", index)?,
        };
        Ok(Self {
            subject: row[columns.subject].clone(),
            list: row[columns.list].clone(),
            item: columns.item.map(|column| row[column].clone()).unwrap_or_default(),
            input,
            output,
            recalled,
            repeat,
            intrusion,
        })
    }

    /// First recall of a studied item.
    #[must_use]
    pub fn is_valid_recall(&self) -> bool {
        self.recalled && !self.intrusion && self.repeat == 0 && self.input.is_some()
    }
}

fn bad_cell(column: &str, index: usize, cell: &Value) -> AnalysisError {
    AnalysisError::Data(format!("row {index} has malformed `{column}` value {cell}"))
}

fn optional_int(cell: &Value, column: &str, index: usize) -> Result<Option<i64>, AnalysisError> {
    if cell.is_null() {
        return Ok(None);
    }
    cell.as_i64().map(Some).ok_or_else(|| bad_cell(column, index, cell))
}

fn flag(cell: &Value, column: &str, index: usize) -> Result<bool, AnalysisError> {
    cell.as_bool().ok_or_else(|| bad_cell(column, index, cell))
}

impl AsRef<AlignedEvent> for AlignedEvent {
    fn as_ref(&self) -> &AlignedEvent {
        self
    }
}

/// An event paired with cells read from extra columns of the same row.
#[derive(Debug, Clone)]
pub(crate) struct Annotated<X> {
    pub(crate) event: AlignedEvent,
    pub(crate) extra: X,
}

impl<X> AsRef<AlignedEvent> for Annotated<X> {
    fn as_ref(&self) -> &AlignedEvent {
        &self.event
    }
}

/// Read events and, row by row, an extra value from the named column.
///
/// # Errors
/// Returns [`AnalysisError::Schema`] when `column` is missing, besides the
/// errors of [`AlignedEvent::from_table`] and of `read`.
pub(crate) fn annotated_events<X>(
    table: &Table,
    column: &str,
    read: impl Fn(&Value, usize) -> Result<X, AnalysisError>,
) -> Result<Vec<Annotated<X>>, AnalysisError> {
    let index = table.column_index(column).ok_or_else(|| {
        AnalysisError::Schema(format!("aligned table has no `{column}` column"))
    })?;
    AlignedEvent::from_table(table)?
        .into_iter()
        .zip(table.rows())
        .enumerate()
        .map(|(row_index, (event, row))| Ok(Annotated { event, extra: read(&row[index], row_index)? }))
        .collect()
}

/// Subject -> list -> events, both levels in ascending key order.
pub(crate) type Grouped<E = AlignedEvent> = BTreeMap<Value, BTreeMap<Value, Vec<E>>>;

pub(crate) fn group_by_list<E: AsRef<AlignedEvent>>(events: Vec<E>) -> Grouped<E> {
    let mut grouped = Grouped::<E>::new();
    for event in events {
        let key = event.as_ref();
        let (subject, list) = (key.subject.clone(), key.list.clone());
        grouped.entry(subject).or_default().entry(list).or_default().push(event);
    }
    grouped
}

/// Recalled events of one list in output order.
pub(crate) fn recalls_in_output_order<E: AsRef<AlignedEvent>>(
    events: &[E],
) -> Result<Vec<&E>, AnalysisError> {
    let mut recalls = Vec::new();
    for entry in events.iter().filter(|entry| entry.as_ref().recalled) {
        let event = entry.as_ref();
        if event.output.is_none() {
            return Err(AnalysisError::Data(format!(
                "item {} is marked recalled but has no output position",
                event.item
            )));
        }
        recalls.push(entry);
    }
    recalls.sort_by_key(|entry| entry.as_ref().output);
    Ok(recalls)
}

/// Input-position recall sequences for one subject, one per list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubjectSequences {
    pub subject: Value,
    pub lists: Vec<Vec<i64>>,
}

/// Extract per-list recall sequences for every subject.
///
/// Sequences hold the input positions of recalled, studied items in output
/// order, repeats included. Intrusions have no input position and are left
/// out. Subjects and lists appear in ascending key order.
///
/// # Errors
/// See [`AlignedEvent::from_table`]; also [`AnalysisError::Data`] when a row
/// is marked recalled without an output position.
pub fn recall_sequences(aligned: &Table) -> Result<Vec<SubjectSequences>, AnalysisError> {
    let grouped = group_by_list(AlignedEvent::from_table(aligned)?);
    grouped
        .into_iter()
        .map(|(subject, lists)| {
            let lists = lists
                .values()
                .map(|events| {
                    Ok(recalls_in_output_order(events)?
                        .into_iter()
                        .filter(|event| !event.intrusion)
                        .filter_map(|event| event.input)
                        .collect::<Vec<_>>())
                })
                .collect::<Result<Vec<_>, AnalysisError>>()?;
            Ok(SubjectSequences { subject, lists })
        })
        .collect()
}

/// How subjects are scheduled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Execution {
    #[default]
    Serial,
    /// One task per subject on the global rayon pool.
    Parallel,
}

/// How transitions are counted within each list.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LagMethod {
    /// Every adjacent pair of recalls, repeats included.
    #[default]
    Paired,
    /// Transitions from the masked walk; repeated recalls are skipped.
    Masked,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LagCrpOptions {
    pub list_length: usize,
    pub method: LagMethod,
    pub execution: Execution,
    /// Boolean column; a recall whose cell is false cannot start a
    /// transition. Masked method only.
    pub from_mask_key: Option<String>,
    /// Boolean column; a recall whose cell is false cannot end a
    /// transition. Masked method only.
    pub to_mask_key: Option<String>,
}

impl LagCrpOptions {
    fn has_masks(&self) -> bool {
        self.from_mask_key.is_some() || self.to_mask_key.is_some()
    }
}

impl Default for LagCrpOptions {
    fn default() -> Self {
        Self {
            list_length: 1,
            method: LagMethod::Paired,
            execution: Execution::Serial,
            from_mask_key: None,
            to_mask_key: None,
        }
    }
}

/// Recall sequences of one subject with the mask flags of each recall.
struct MaskedSequences {
    sequences: SubjectSequences,
    masks: Vec<ListMasks>,
}

/// Null mask cells leave the recall unmasked.
fn mask_cell(cell: &Value, column: &str, index: usize) -> Result<bool, AnalysisError> {
    if cell.is_null() {
        return Ok(true);
    }
    flag(cell, column, index)
}

fn mask_flags(
    table: &Table,
    column: Option<&str>,
    rows: usize,
) -> Result<Vec<Option<bool>>, AnalysisError> {
    let Some(column) = column else {
        return Ok(vec![None; rows]);
    };
    let index = table.column_index(column).ok_or_else(|| {
        AnalysisError::Schema(format!("aligned table has no `{column}` mask column"))
    })?;
    table
        .rows()
        .iter()
        .enumerate()
        .map(|(row_index, row)| mask_cell(&row[index], column, row_index).map(Some))
        .collect()
}

/// Like [`recall_sequences`], with each list's masks read from the option's
/// mask columns, aligned with the recalls kept in the sequence.
fn masked_sequences(
    aligned: &Table,
    options: &LagCrpOptions,
) -> Result<Vec<MaskedSequences>, AnalysisError> {
    let from = mask_flags(aligned, options.from_mask_key.as_deref(), aligned.len())?;
    let to = mask_flags(aligned, options.to_mask_key.as_deref(), aligned.len())?;
    let events = AlignedEvent::from_table(aligned)?
        .into_iter()
        .zip(from.into_iter().zip(to))
        .map(|(event, extra)| Annotated { event, extra })
        .collect::<Vec<_>>();

    group_by_list(events)
        .into_iter()
        .map(|(subject, lists)| {
            let mut sequences = Vec::with_capacity(lists.len());
            let mut masks = Vec::with_capacity(lists.len());
            for entries in lists.values() {
                let kept = recalls_in_output_order(entries)?
                    .into_iter()
                    .filter(|entry| !entry.event.intrusion)
                    .filter_map(|entry| entry.event.input.map(|input| (input, entry.extra)))
                    .collect::<Vec<_>>();
                let collect_mask = |pick: fn(&(Option<bool>, Option<bool>)) -> Option<bool>| {
                    kept.iter().map(|(_, extra)| pick(extra)).collect::<Option<Vec<_>>>()
                };
                masks.push(ListMasks {
                    from: collect_mask(|(from, _)| *from),
                    to: collect_mask(|(_, to)| *to),
                });
                sequences.push(kept.into_iter().map(|(input, _)| input).collect());
            }
            Ok(MaskedSequences { sequences: SubjectSequences { subject, lists: sequences }, masks })
        })
        .collect()
}

/// One output row of [`lag_crp_by_subject`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubjectLagCrp {
    pub subject: Value,
    pub lag: i64,
    pub prob: Option<f64>,
    pub actual: u64,
    pub possible: u64,
}

/// Lag-CRP for every subject of an aligned table, serially and by adjacent
/// pairing.
///
/// # Errors
/// See [`lag_crp_by_subject_with`].
pub fn lag_crp_by_subject(aligned: &Table, list_length: usize) -> Result<Vec<SubjectLagCrp>, AnalysisError> {
    lag_crp_by_subject_with(aligned, &LagCrpOptions { list_length, ..LagCrpOptions::default() })
}

/// Lag-CRP for every subject of an aligned table.
///
/// Rows come out grouped by subject in ascending order, and by lag within a
/// subject, regardless of [`Execution`].
///
/// # Errors
/// Returns [`AnalysisError::Schema`] when a required or mask column is
/// missing, [`AnalysisError::Configuration`] for a zero list length or mask
/// columns without [`LagMethod::Masked`], and [`AnalysisError::Data`] for
/// malformed cells or positions outside `1..=list_length`.
pub fn lag_crp_by_subject_with(
    aligned: &Table,
    options: &LagCrpOptions,
) -> Result<Vec<SubjectLagCrp>, AnalysisError> {
    LagCounts::new(options.list_length)?;
    if options.has_masks() && options.method != LagMethod::Masked {
        return Err(AnalysisError::Configuration(
            "mask columns require the masked lag method".to_string(),
        ));
    }
    let subjects = if options.has_masks() {
        masked_sequences(aligned, options)?
    } else {
        recall_sequences(aligned)?
            .into_iter()
            .map(|sequences| MaskedSequences { sequences, masks: Vec::new() })
            .collect()
    };

    let per_subject = |subject: &MaskedSequences| -> Result<Vec<SubjectLagCrp>, AnalysisError> {
        let sequences = &subject.sequences;
        let counts = match options.method {
            LagMethod::Paired => LagCounts::from_sequences(&sequences.lists, options.list_length)?,
            LagMethod::Masked => {
                LagCounts::from_masked(&sequences.lists, &subject.masks, options.list_length)?
            }
        };
        tracing::debug!(
            subject = %sequences.subject,
            lists = sequences.lists.len(),
            masked = !subject.masks.is_empty(),
            transitions = counts.total_actual(),
            "accumulated lag counts"
        );
        Ok(counts
            .bins()
            .into_iter()
            .map(|bin| SubjectLagCrp {
                subject: sequences.subject.clone(),
                lag: bin.lag,
                prob: bin.prob,
                actual: bin.actual,
                possible: bin.possible,
            })
            .collect())
    };

    let results = match options.execution {
        Execution::Serial => subjects.iter().map(per_subject).collect::<Result<Vec<_>, _>>()?,
        Execution::Parallel => subjects.par_iter().map(per_subject).collect::<Result<Vec<_>, _>>()?,
    };

    tracing::debug!(
        subjects = subjects.len(),
        execution = ?options.execution,
        method = ?options.method,
        "computed lag-CRP by subject"
    );
    Ok(results.into_iter().flatten().collect())
}
