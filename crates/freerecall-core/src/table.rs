use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Map;

use crate::AnalysisError;

/// One cell of a [`Table`].
///
/// `Null` marks an absent value. Values are totally ordered so they can be used
/// as grouping and sort keys: numbers compare numerically across `Int` and
/// `Float`, kinds order as `Bool < number < Str`, and `Null` sorts last.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer view of a numeric cell; floats qualify only when integral.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Float(value)
                if value.is_finite()
                    && value.fract() == 0.0
                    && *value >= i64::MIN as f64
                    && *value <= i64::MAX as f64 =>
            {
                Some(*value as i64)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Int(_) | Self::Float(_) => 1,
            Self::Str(_) => 2,
            Self::Null => 3,
        }
    }
}

/// Exact comparison of an integer with a float, without rounding the
/// integer. NaN keeps its `f64::total_cmp` place: negative NaN below every
/// number, positive NaN above.
#[allow(clippy::cast_possible_truncation)]
fn cmp_int_float(lhs: i64, rhs: f64) -> Ordering {
    // 2^63, the first float past i64::MAX.
    const I64_END: f64 = 9_223_372_036_854_775_808.0;
    if rhs.is_nan() {
        return if rhs.is_sign_negative() { Ordering::Greater } else { Ordering::Less };
    }
    if rhs >= I64_END {
        return Ordering::Less;
    }
    if rhs < -I64_END {
        return Ordering::Greater;
    }
    let whole = rhs.trunc();
    match lhs.cmp(&(whole as i64)) {
        Ordering::Equal => {
            let fraction = rhs - whole;
            if fraction > 0.0 {
                Ordering::Less
            } else if fraction < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        ordering => ordering,
    }
}

/// `f64::total_cmp` with `-0.0 == 0.0`, so both equal `Int(0)`.
#[allow(clippy::float_cmp)]
fn cmp_floats(lhs: f64, rhs: f64) -> Ordering {
    if lhs == rhs {
        Ordering::Equal
    } else {
        lhs.total_cmp(&rhs)
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(lhs), Self::Bool(rhs)) => lhs.cmp(rhs),
            (Self::Int(lhs), Self::Int(rhs)) => lhs.cmp(rhs),
            (Self::Int(lhs), Self::Float(rhs)) => cmp_int_float(*lhs, *rhs),
            (Self::Float(lhs), Self::Int(rhs)) => cmp_int_float(*rhs, *lhs).reverse(),
            (Self::Float(lhs), Self::Float(rhs)) => cmp_floats(*lhs, *rhs),
            (Self::Str(lhs), Self::Str(rhs)) => lhs.cmp(rhs),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value}"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Row-major table with named columns.
///
/// Serializes as a list of JSON objects ("records") in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    /// Build a table from JSON objects. Columns appear in first-seen order and
    /// fields missing from a record are filled with [`Value::Null`].
    ///
    /// # Errors
    /// Returns [`AnalysisError::Data`] when a field holds an array or object.
    pub fn from_records(
        records: &[Map<String, serde_json::Value>],
    ) -> Result<Self, AnalysisError> {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !columns.iter().any(|column| column == key) {
                    columns.push(key.clone());
                }
            }
        }

        let mut table = Self::new(columns);
        for (index, record) in records.iter().enumerate() {
            let mut row = Vec::with_capacity(table.columns.len());
            for column in &table.columns {
                let cell = match record.get(column) {
                    None => Value::Null,
                    Some(raw) => serde_json::from_value::<Value>(raw.clone()).map_err(|_| {
                        AnalysisError::Data(format!(
                            "record {index} field `{column}` must be a scalar, got {raw}"
                        ))
                    })?,
                };
                row.push(cell);
            }
            table.rows.push(row);
        }
        Ok(table)
    }

    #[must_use]
    pub fn to_records(&self) -> Vec<Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(column, cell)| {
                        (column.clone(), serde_json::to_value(cell).unwrap_or_default())
                    })
                    .collect()
            })
            .collect()
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    #[must_use]
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|cells| cells.get(index))
    }

    /// Append a row whose cells follow the table's column order.
    ///
    /// # Errors
    /// Returns [`AnalysisError::Data`] when the row width differs from the
    /// number of columns.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), AnalysisError> {
        if row.len() != self.columns.len() {
            return Err(AnalysisError::Data(format!(
                "row has {} cells but table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Rows for which `keep` holds, in original order.
    #[must_use]
    pub fn filter<F>(&self, mut keep: F) -> Self
    where
        F: FnMut(&[Value]) -> bool,
    {
        Self {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|row| keep(row)).cloned().collect(),
        }
    }

    /// Resolve column names to indices, failing on the first absent name.
    pub(crate) fn require_columns<'a, I>(
        &self,
        names: I,
        error: impl Fn(&str) -> AnalysisError,
    ) -> Result<Vec<usize>, AnalysisError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names.into_iter().map(|name| self.column_index(name).ok_or_else(|| error(name))).collect()
    }

    pub(crate) fn from_parts(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }
}

impl Serialize for Table {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let records = self.to_records();
        let mut seq = serializer.serialize_seq(Some(records.len()))?;
        for record in &records {
            seq.serialize_element(record)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Table {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let records = Vec::<Map<String, serde_json::Value>>::deserialize(deserializer)?;
        Self::from_records(&records).map_err(serde::de::Error::custom)
    }
}
