use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::table::{Table, Value};
use crate::{AnalysisError, ALIGNED_COLUMNS};

/// Column roles used when merging study and recall events.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct AlignOptions {
    /// Columns identifying the same item-in-list on both sides.
    pub merge_keys: Vec<String>,
    /// Columns meaningful to both study and recall events.
    pub list_keys: Vec<String>,
    /// Columns carried only from study events.
    pub study_keys: Vec<String>,
    /// Columns carried only from recall events.
    pub recall_keys: Vec<String>,
    /// Serial position on the study side, output position on the recall side.
    pub position_key: String,
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self {
            merge_keys: vec!["subject".to_string(), "list".to_string(), "item".to_string()],
            list_keys: Vec::new(),
            study_keys: Vec::new(),
            recall_keys: Vec::new(),
            position_key: "position".to_string(),
        }
    }
}

impl AlignOptions {
    fn join_keys(&self) -> impl Iterator<Item = &str> {
        self.merge_keys.iter().chain(&self.list_keys).map(String::as_str)
    }

    fn output_columns(&self) -> Result<Vec<String>, AnalysisError> {
        let columns = self
            .merge_keys
            .iter()
            .map(String::as_str)
            .chain(ALIGNED_COLUMNS)
            .chain(self.list_keys.iter().map(String::as_str))
            .chain(self.study_keys.iter().map(String::as_str))
            .chain(self.recall_keys.iter().map(String::as_str))
            .map(str::to_string)
            .collect::<Vec<_>>();

        let mut seen = BTreeSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(AnalysisError::Configuration(format!(
                    "column `{column}` is assigned to more than one role in the aligned layout"
                )));
            }
        }
        Ok(columns)
    }
}

/// Indices of the columns each side contributes, resolved once up front.
struct SideColumns {
    join: Vec<usize>,
    extra: Vec<usize>,
    position: usize,
}

impl SideColumns {
    fn resolve(
        table: &Table,
        side: &str,
        options: &AlignOptions,
        extra_keys: &[String],
    ) -> Result<Self, AnalysisError> {
        let join = table.require_columns(options.join_keys(), |name| {
            AnalysisError::Configuration(format!("{side} table has no key column `{name}`"))
        })?;
        let extra = table.require_columns(extra_keys.iter().map(String::as_str), |name| {
            AnalysisError::Configuration(format!("{side} table has no key column `{name}`"))
        })?;
        let position = table.column_index(&options.position_key).ok_or_else(|| {
            AnalysisError::Schema(format!(
                "{side} table has no position column `{}`",
                options.position_key
            ))
        })?;
        Ok(Self { join, extra, position })
    }

    fn key(&self, row: &[Value]) -> Vec<Value> {
        self.join.iter().map(|index| row[*index].clone()).collect()
    }

    fn position(&self, row: &[Value], side: &str, index: usize) -> Result<i64, AnalysisError> {
        row[self.position].as_i64().ok_or_else(|| {
            AnalysisError::Data(format!(
                "{side} row {index} has non-integer position {}",
                row[self.position]
            ))
        })
    }
}

/// Merge study and recall events into one row per item occurrence.
///
/// Output columns are the merge keys, then `input`, `output`, `recalled`,
/// `repeat`, `intrusion`, then list, study and recall passthrough columns.
/// Study rows come first in their original order, each followed by its matching
/// recall rows; unmatched recall rows (intrusions) follow. The result is then
/// stably sorted by the merge keys other than `item` plus `input`, with absent
/// inputs last.
///
/// # Errors
/// Returns [`AnalysisError::Configuration`] when a key list names a column
/// missing from its table or a column is given two roles,
/// [`AnalysisError::Schema`] when the position column is missing from either
/// table, and [`AnalysisError::Data`] for non-integer positions.
pub fn align(study: &Table, recall: &Table, options: &AlignOptions) -> Result<Table, AnalysisError> {
    if options.merge_keys.is_empty() {
        return Err(AnalysisError::Configuration("merge_keys MUST be non-empty".to_string()));
    }
    let columns = options.output_columns()?;
    let study_side = SideColumns::resolve(study, "study", options, &options.study_keys)?;
    let recall_side = SideColumns::resolve(recall, "recall", options, &options.recall_keys)?;

    let mut repeat_counts: BTreeMap<Vec<Value>, i64> = BTreeMap::new();
    let mut recall_by_key: BTreeMap<Vec<Value>, Vec<usize>> = BTreeMap::new();
    let mut repeats = Vec::with_capacity(recall.len());
    let merge_width = options.merge_keys.len();
    for (index, row) in recall.rows().iter().enumerate() {
        let key = recall_side.key(row);
        let count = repeat_counts.entry(key[..merge_width].to_vec()).or_insert(0);
        repeats.push(*count);
        *count += 1;
        recall_by_key.entry(key).or_default().push(index);
    }

    let mut rows: Vec<Vec<Value>> = Vec::with_capacity(study.len() + recall.len());
    let mut matched = vec![false; recall.len()];
    for (study_index, study_row) in study.rows().iter().enumerate() {
        let key = study_side.key(study_row);
        let input = study_side.position(study_row, "study", study_index)?;
        let matches = recall_by_key.get(&key).map_or(&[][..], Vec::as_slice);

        if matches.is_empty() {
            let event = Event { key: &key, input: Some(input), output: None, repeat: 0 };
            rows.push(event.row(options, Some((study_row, &study_side)), None));
            continue;
        }

        for recall_index in matches {
            let recall_row = &recall.rows()[*recall_index];
            let output = recall_side.position(recall_row, "recall", *recall_index)?;
            matched[*recall_index] = true;
            let event = Event {
                key: &key,
                input: Some(input),
                output: Some(output),
                repeat: repeats[*recall_index],
            };
            rows.push(event.row(
                options,
                Some((study_row, &study_side)),
                Some((recall_row, &recall_side)),
            ));
        }
    }

    for (recall_index, recall_row) in recall.rows().iter().enumerate() {
        if matched[recall_index] {
            continue;
        }
        let key = recall_side.key(recall_row);
        let output = recall_side.position(recall_row, "recall", recall_index)?;
        let event = Event { key: &key, input: None, output: Some(output), repeat: repeats[recall_index] };
        rows.push(event.row(options, None, Some((recall_row, &recall_side))));
    }

    let mut sort_indices: Vec<usize> = options
        .merge_keys
        .iter()
        .enumerate()
        .filter(|(_, key)| key.as_str() != "item")
        .map(|(index, _)| index)
        .collect();
    sort_indices.push(merge_width);
    rows.sort_by(|lhs, rhs| {
        sort_indices
            .iter()
            .map(|index| lhs[*index].cmp(&rhs[*index]))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    tracing::debug!(
        study_rows = study.len(),
        recall_rows = recall.len(),
        aligned_rows = rows.len(),
        "aligned study and recall events"
    );
    Ok(Table::from_parts(columns, rows))
}

struct Event<'a> {
    key: &'a [Value],
    input: Option<i64>,
    output: Option<i64>,
    repeat: i64,
}

impl Event<'_> {
    /// Lay the event out in canonical column order. Join keys come from
    /// whichever side produced the row; a missing side leaves its passthrough
    /// cells null.
    fn row(
        &self,
        options: &AlignOptions,
        study: Option<(&[Value], &SideColumns)>,
        recall: Option<(&[Value], &SideColumns)>,
    ) -> Vec<Value> {
        let merge_width = options.merge_keys.len();
        let mut row = Vec::with_capacity(
            self.key.len()
                + ALIGNED_COLUMNS.len()
                + options.study_keys.len()
                + options.recall_keys.len(),
        );
        row.extend_from_slice(&self.key[..merge_width]);
        row.push(Value::from(self.input));
        row.push(Value::from(self.output));
        row.push(Value::Bool(self.output.is_some()));
        row.push(Value::Int(self.repeat));
        row.push(Value::Bool(self.input.is_none()));
        row.extend_from_slice(&self.key[merge_width..]);
        push_side(&mut row, study, options.study_keys.len());
        push_side(&mut row, recall, options.recall_keys.len());
        row
    }
}

fn push_side(row: &mut Vec<Value>, side: Option<(&[Value], &SideColumns)>, width: usize) {
    match side {
        Some((source, columns)) => row.extend(columns.extra.iter().map(|index| source[*index].clone())),
        None => row.extend(std::iter::repeat(Value::Null).take(width)),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn trial_table(columns: &[&str], rows: Vec<Vec<Value>>) -> Table {
        let mut table = Table::new(columns.iter().map(|column| (*column).to_string()).collect());
        for row in rows {
            if let Err(err) = table.push_row(row) {
                panic!("fixture row should fit: {err}");
            }
        }
        table
    }

    fn trial(subject: i64, list: i64, position: i64, item: &str) -> Vec<Value> {
        vec![Value::Int(subject), Value::Int(list), Value::Int(position), Value::from(item)]
    }

    fn int(value: i64) -> Value {
        Value::Int(value)
    }

    const COLUMNS: [&str; 4] = ["subject", "list", "position", "item"];

    fn two_list_fixture() -> (Table, Table) {
        let study = trial_table(
            &COLUMNS,
            vec![
                trial(1, 1, 1, "absence"),
                trial(1, 1, 2, "hollow"),
                trial(1, 1, 3, "pupil"),
                trial(1, 2, 1, "fountain"),
                trial(1, 2, 2, "piano"),
                trial(1, 2, 3, "pillow"),
            ],
        );
        let recall = trial_table(
            &COLUMNS,
            vec![
                trial(1, 1, 1, "pupil"),
                trial(1, 1, 2, "absence"),
                trial(1, 1, 3, "empty"),
                trial(1, 2, 1, "pillow"),
                trial(1, 2, 2, "fountain"),
                trial(1, 2, 3, "pillow"),
            ],
        );
        (study, recall)
    }

    fn aligned(study: &Table, recall: &Table, options: &AlignOptions) -> Table {
        match align(study, recall, options) {
            Ok(table) => table,
            Err(err) => panic!("alignment should succeed: {err}"),
        }
    }

    fn find_row<'a>(table: &'a Table, item: &str, output: Option<i64>) -> &'a [Value] {
        let item_index = table.column_index("item").unwrap_or_else(|| panic!("no item column"));
        let output_index =
            table.column_index("output").unwrap_or_else(|| panic!("no output column"));
        table
            .rows()
            .iter()
            .find(|row| {
                row[item_index] == Value::from(item)
                    && (output.is_none() || row[output_index] == Value::from(output))
            })
            .unwrap_or_else(|| panic!("no row for item {item}"))
    }

    fn cell<'a>(table: &Table, row: &'a [Value], column: &str) -> &'a Value {
        let index = table.column_index(column).unwrap_or_else(|| panic!("no column {column}"));
        &row[index]
    }

    #[test]
    fn merged_rows_mark_recalls_repeats_and_intrusions() {
        let (study, recall) = two_list_fixture();
        let table = aligned(&study, &recall, &AlignOptions::default());

        assert_eq!(
            table.columns(),
            ["subject", "list", "item", "input", "output", "recalled", "repeat", "intrusion"]
        );

        let correct = find_row(&table, "pupil", None);
        assert_eq!(cell(&table, correct, "input"), &Value::Int(3));
        assert_eq!(cell(&table, correct, "recalled"), &Value::Bool(true));
        assert_eq!(cell(&table, correct, "repeat"), &Value::Int(0));
        assert_eq!(cell(&table, correct, "intrusion"), &Value::Bool(false));

        let forgot = find_row(&table, "hollow", None);
        assert_eq!(cell(&table, forgot, "input"), &Value::Int(2));
        assert_eq!(cell(&table, forgot, "output"), &Value::Null);
        assert_eq!(cell(&table, forgot, "recalled"), &Value::Bool(false));
        assert_eq!(cell(&table, forgot, "repeat"), &Value::Int(0));
        assert_eq!(cell(&table, forgot, "intrusion"), &Value::Bool(false));

        let intrusion = find_row(&table, "empty", None);
        assert_eq!(cell(&table, intrusion, "input"), &Value::Null);
        assert_eq!(cell(&table, intrusion, "recalled"), &Value::Bool(true));
        assert_eq!(cell(&table, intrusion, "repeat"), &Value::Int(0));
        assert_eq!(cell(&table, intrusion, "intrusion"), &Value::Bool(true));

        let repeat = find_row(&table, "pillow", Some(3));
        assert_eq!(cell(&table, repeat, "input"), &Value::Int(3));
        assert_eq!(cell(&table, repeat, "recalled"), &Value::Bool(true));
        assert_eq!(cell(&table, repeat, "repeat"), &Value::Int(1));
        assert_eq!(cell(&table, repeat, "intrusion"), &Value::Bool(false));
    }

    #[test]
    fn rows_sort_by_list_then_input_with_intrusions_last() {
        let (study, recall) = two_list_fixture();
        let table = aligned(&study, &recall, &AlignOptions::default());
        let items = table
            .rows()
            .iter()
            .map(|row| (cell(&table, row, "item").to_string(), cell(&table, row, "output").clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            items,
            vec![
                ("absence".to_string(), Value::Int(2)),
                ("hollow".to_string(), Value::Null),
                ("pupil".to_string(), Value::Int(1)),
                ("empty".to_string(), Value::Int(3)),
                ("fountain".to_string(), Value::Int(2)),
                ("piano".to_string(), Value::Null),
                ("pillow".to_string(), Value::Int(1)),
                ("pillow".to_string(), Value::Int(3)),
            ]
        );
    }

    #[test]
    fn three_item_round_trip_scenario() {
        let study = trial_table(
            &COLUMNS,
            vec![trial(1, 1, 1, "A"), trial(1, 1, 2, "B"), trial(1, 1, 3, "C")],
        );
        let recall = trial_table(&COLUMNS, vec![trial(1, 1, 1, "C"), trial(1, 1, 2, "A")]);
        let table = aligned(&study, &recall, &AlignOptions::default());
        assert_eq!(table.len(), 3);

        let c = find_row(&table, "C", None);
        assert_eq!(cell(&table, c, "input"), &Value::Int(3));
        assert_eq!(cell(&table, c, "output"), &Value::Int(1));
        let a = find_row(&table, "A", None);
        assert_eq!(cell(&table, a, "input"), &Value::Int(1));
        assert_eq!(cell(&table, a, "output"), &Value::Int(2));
        let b = find_row(&table, "B", None);
        assert_eq!(cell(&table, b, "output"), &Value::Null);
        assert_eq!(cell(&table, b, "recalled"), &Value::Bool(false));
    }

    #[test]
    fn passthrough_columns_follow_their_side() {
        let columns = ["subject", "list", "position", "item", "item_index", "task", "rt"];
        let study = trial_table(
            &columns,
            vec![
                vec![int(1), int(1), int(1), "a".into(), int(0), int(1), Value::Null],
                vec![int(1), int(1), int(2), "b".into(), int(1), int(2), Value::Null],
            ],
        );
        let recall = trial_table(
            &columns,
            vec![
                vec![int(1), int(1), int(1), "b".into(), int(1), Value::Null, int(1200)],
                vec![int(1), int(1), int(2), "x".into(), Value::Null, Value::Null, int(800)],
            ],
        );
        let options = AlignOptions {
            list_keys: vec!["item_index".to_string()],
            study_keys: vec!["task".to_string()],
            recall_keys: vec!["rt".to_string()],
            ..AlignOptions::default()
        };
        let table = aligned(&study, &recall, &options);
        assert_eq!(
            table.columns(),
            [
                "subject", "list", "item", "input", "output", "recalled", "repeat", "intrusion",
                "item_index", "task", "rt"
            ]
        );

        let b = find_row(&table, "b", None);
        assert_eq!(cell(&table, b, "item_index"), &Value::Int(1));
        assert_eq!(cell(&table, b, "task"), &Value::Int(2));
        assert_eq!(cell(&table, b, "rt"), &Value::Int(1200));

        let a = find_row(&table, "a", None);
        assert_eq!(cell(&table, a, "task"), &Value::Int(1));
        assert_eq!(cell(&table, a, "rt"), &Value::Null);

        let x = find_row(&table, "x", None);
        assert_eq!(cell(&table, x, "task"), &Value::Null);
        assert_eq!(cell(&table, x, "rt"), &Value::Int(800));
        assert_eq!(cell(&table, x, "intrusion"), &Value::Bool(true));
    }

    #[test]
    fn inputs_are_not_mutated() {
        let (study, recall) = two_list_fixture();
        let before = recall.clone();
        let _ = aligned(&study, &recall, &AlignOptions::default());
        assert_eq!(recall, before);
        assert!(!recall.has_column("repeat"));
    }

    #[test]
    fn missing_key_columns_are_configuration_errors() {
        let (study, recall) = two_list_fixture();
        let options =
            AlignOptions { study_keys: vec!["task".to_string()], ..AlignOptions::default() };
        let err = match align(&study, &recall, &options) {
            Ok(_) => panic!("missing study key should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, AnalysisError::Configuration(_)));
        assert!(err.to_string().contains("`task`"));

        let options =
            AlignOptions { recall_keys: vec!["task".to_string()], ..AlignOptions::default() };
        assert!(matches!(align(&study, &recall, &options), Err(AnalysisError::Configuration(_))));
    }

    #[test]
    fn duplicate_roles_are_configuration_errors() {
        let columns = ["subject", "list", "position", "item", "task"];
        let study = trial_table(&columns, vec![]);
        let recall = trial_table(&columns, vec![]);
        let options = AlignOptions {
            study_keys: vec!["task".to_string()],
            recall_keys: vec!["task".to_string()],
            ..AlignOptions::default()
        };
        assert!(matches!(align(&study, &recall, &options), Err(AnalysisError::Configuration(_))));
    }

    #[test]
    fn missing_position_column_is_schema_error() {
        let (study, recall) = two_list_fixture();
        let options =
            AlignOptions { position_key: "serial".to_string(), ..AlignOptions::default() };
        assert!(matches!(align(&study, &recall, &options), Err(AnalysisError::Schema(_))));
    }

    #[test]
    fn fractional_position_is_data_error() {
        let study = trial_table(
            &COLUMNS,
            vec![vec![int(1), int(1), Value::Float(1.5), "a".into()]],
        );
        let recall = trial_table(&COLUMNS, vec![]);
        assert!(matches!(
            align(&study, &recall, &AlignOptions::default()),
            Err(AnalysisError::Data(_))
        ));
    }

    fn arbitrary_trials() -> impl Strategy<Value = (Vec<u8>, Vec<u8>)> {
        (
            proptest::sample::subsequence((0_u8..8).collect::<Vec<_>>(), 0..8),
            proptest::collection::vec(0_u8..10, 0..12),
        )
    }

    proptest! {
        #[test]
        fn property_alignment_is_complete_and_repeats_are_monotonic((studied, recalled) in arbitrary_trials()) {
            let study = trial_table(
                &COLUMNS,
                studied
                    .iter()
                    .enumerate()
                    .map(|(index, item)| trial(1, 1, i64::try_from(index).unwrap_or(0) + 1, &format!("w{item}")))
                    .collect(),
            );
            let recall = trial_table(
                &COLUMNS,
                recalled
                    .iter()
                    .enumerate()
                    .map(|(index, item)| trial(1, 1, i64::try_from(index).unwrap_or(0) + 1, &format!("w{item}")))
                    .collect(),
            );
            let table = align(&study, &recall, &AlignOptions::default());
            prop_assert!(table.is_ok());
            let table = table.unwrap_or_default();

            let studied_and_recalled = studied.iter().filter(|item| recalled.contains(item)).count();
            let unrecalled = studied.len() - studied_and_recalled;
            prop_assert_eq!(table.len(), recalled.len() + unrecalled);
            prop_assert!(table.len() <= study.len() + recall.len());

            let output_index = table.column_index("output").unwrap_or(0);
            let recalled_rows = table.rows().iter().filter(|row| !row[output_index].is_null()).count();
            prop_assert_eq!(recalled_rows, recalled.len());

            let mut seen: BTreeMap<String, Vec<(i64, i64)>> = BTreeMap::new();
            for row in table.rows() {
                let item = cell(&table, row, "item").to_string();
                let recalled_flag = cell(&table, row, "recalled").as_bool().unwrap_or(false);
                let intrusion = cell(&table, row, "intrusion").as_bool().unwrap_or(false);
                let input = cell(&table, row, "input");
                prop_assert_eq!(recalled_flag, !row[output_index].is_null());
                prop_assert_eq!(intrusion, input.is_null());
                if let (Some(output), Some(repeat)) = (row[output_index].as_i64(), cell(&table, row, "repeat").as_i64()) {
                    seen.entry(item).or_default().push((output, repeat));
                }
            }
            for occurrences in seen.values_mut() {
                occurrences.sort_unstable();
                let repeats = occurrences.iter().map(|(_, repeat)| *repeat).collect::<Vec<_>>();
                let expected = (0..i64::try_from(repeats.len()).unwrap_or(0)).collect::<Vec<_>>();
                prop_assert_eq!(repeats, expected);
            }
        }
    }
}
