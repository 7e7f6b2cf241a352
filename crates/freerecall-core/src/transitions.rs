use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{BuildHasher, Hash};

use serde::Serialize;

use crate::AnalysisError;

/// Maps an item identifier to the value a transition test compares.
pub trait ValueLookup<T> {
    type Value;

    fn lookup(&self, item: &T) -> Option<&Self::Value>;
}

impl<V> ValueLookup<usize> for Vec<V> {
    type Value = V;

    fn lookup(&self, item: &usize) -> Option<&V> {
        self.get(*item)
    }
}

impl<V> ValueLookup<i64> for Vec<V> {
    type Value = V;

    fn lookup(&self, item: &i64) -> Option<&V> {
        usize::try_from(*item).ok().and_then(|index| self.get(index))
    }
}

impl<K, V> ValueLookup<K> for BTreeMap<K, V>
where
    K: Ord,
{
    type Value = V;

    fn lookup(&self, item: &K) -> Option<&V> {
        self.get(item)
    }
}

impl<K, V, S> ValueLookup<K> for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    type Value = V;

    fn lookup(&self, item: &K) -> Option<&V> {
        self.get(item)
    }
}

/// Binary test over the looked-up values of the current and a candidate item.
pub type Predicate<'a, V> = Box<dyn Fn(&V, &V) -> bool + 'a>;

/// One step of a recall sequence: the item just recalled, the item recalled
/// next, and every item that could have been recalled next.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct Transition<T> {
    pub prev: T,
    pub curr: T,
    pub possible: Vec<T>,
}

/// Builder for a single pass over the transitions of one recall sequence.
///
/// The candidate pool is copied on construction, so one `possible` slice can
/// seed any number of sequences.
pub struct TransitionMasker<'a, T, V = T> {
    seq: &'a [T],
    possible: Vec<T>,
    from_mask: Option<&'a [bool]>,
    to_mask: Option<&'a [bool]>,
    test: Option<Predicate<'a, V>>,
    test_values: Option<&'a dyn ValueLookup<T, Value = V>>,
    misordered_test: bool,
}

impl<'a, T> TransitionMasker<'a, T, T>
where
    T: Ord + Clone,
{
    #[must_use]
    pub fn new(seq: &'a [T], possible: &[T]) -> Self {
        Self {
            seq,
            possible: possible.to_vec(),
            from_mask: None,
            to_mask: None,
            test: None,
            test_values: None,
            misordered_test: false,
        }
    }
}

impl<'a, T, V> TransitionMasker<'a, T, V>
where
    T: Ord + Clone,
{
    /// Positions whose `false` entry excludes transitions *from* that position.
    #[must_use]
    pub fn from_mask(mut self, mask: &'a [bool]) -> Self {
        self.from_mask = Some(mask);
        self
    }

    /// Positions whose `false` entry excludes transitions *to* that position.
    #[must_use]
    pub fn to_mask(mut self, mask: &'a [bool]) -> Self {
        self.to_mask = Some(mask);
        self
    }

    /// Values compared by the transition test. Must be supplied before
    /// [`TransitionMasker::with_test`].
    #[must_use]
    pub fn with_test_values<W>(
        self,
        values: &'a dyn ValueLookup<T, Value = W>,
    ) -> TransitionMasker<'a, T, W> {
        TransitionMasker {
            seq: self.seq,
            possible: self.possible,
            from_mask: self.from_mask,
            to_mask: self.to_mask,
            test: None,
            test_values: Some(values),
            misordered_test: self.misordered_test || self.test.is_some(),
        }
    }

    /// Require `test(value(prev), value(curr))` for a transition to count, and
    /// narrow the candidates to items passing the same test against `prev`.
    #[must_use]
    pub fn with_test<F>(mut self, test: F) -> Self
    where
        F: Fn(&V, &V) -> bool + 'a,
    {
        self.test = Some(Box::new(test));
        self
    }

    /// Validate the configuration and start the walk.
    ///
    /// # Errors
    /// Returns [`AnalysisError::Configuration`] when a test is given without
    /// test values or a mask length differs from the sequence length, and
    /// [`AnalysisError::Data`] when an item has no test value.
    pub fn transitions(self) -> Result<Transitions<'a, T, V>, AnalysisError> {
        if self.misordered_test {
            return Err(AnalysisError::Configuration(
                "test values MUST be supplied before the transition test".to_string(),
            ));
        }
        for (name, mask) in [("from_mask", self.from_mask), ("to_mask", self.to_mask)] {
            if let Some(mask) = mask {
                if mask.len() != self.seq.len() {
                    return Err(AnalysisError::Configuration(format!(
                        "{name} has {} entries but the sequence has {}",
                        mask.len(),
                        self.seq.len()
                    )));
                }
            }
        }

        let test = match (self.test, self.test_values) {
            (Some(_), None) => {
                return Err(AnalysisError::Configuration(
                    "a transition test requires test values".to_string(),
                ))
            }
            (Some(test), Some(values)) => {
                let missing = self.seq.iter().chain(&self.possible).position(|item| {
                    values.lookup(item).is_none()
                });
                if let Some(position) = missing {
                    return Err(AnalysisError::Data(format!(
                        "item {position} of the sequence and pool has no test value"
                    )));
                }
                Some((test, values))
            }
            (None, _) => None,
        };

        Ok(Transitions {
            seq: self.seq,
            pool: Pool::new(&self.possible),
            from_mask: self.from_mask,
            to_mask: self.to_mask,
            test,
            n: 0,
        })
    }
}

/// Items still available as transition targets, in original pool order.
///
/// Duplicates are allowed; taking an item removes its earliest remaining copy.
struct Pool<T> {
    slots: Vec<Option<T>>,
    index: BTreeMap<T, VecDeque<usize>>,
}

impl<T> Pool<T>
where
    T: Ord + Clone,
{
    fn new(items: &[T]) -> Self {
        let mut index: BTreeMap<T, VecDeque<usize>> = BTreeMap::new();
        for (slot, item) in items.iter().enumerate() {
            index.entry(item.clone()).or_default().push_back(slot);
        }
        Self { slots: items.iter().cloned().map(Some).collect(), index }
    }

    fn contains(&self, item: &T) -> bool {
        self.index.contains_key(item)
    }

    fn take(&mut self, item: &T) -> bool {
        let Some(slots) = self.index.get_mut(item) else {
            return false;
        };
        if let Some(slot) = slots.pop_front() {
            self.slots[slot] = None;
        }
        if slots.is_empty() {
            self.index.remove(item);
        }
        true
    }

    fn items(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten()
    }
}

/// Lazy, single-pass walk over the valid transitions of one sequence.
pub struct Transitions<'a, T, V> {
    seq: &'a [T],
    pool: Pool<T>,
    from_mask: Option<&'a [bool]>,
    to_mask: Option<&'a [bool]>,
    test: Option<(Predicate<'a, V>, &'a dyn ValueLookup<T, Value = V>)>,
    n: usize,
}

fn allowed(mask: Option<&[bool]>, position: usize) -> bool {
    mask.map_or(true, |mask| mask[position])
}

impl<T, V> Iterator for Transitions<'_, T, V>
where
    T: Ord + Clone,
{
    type Item = Transition<T>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.n + 1 < self.seq.len() {
            let n = self.n;
            self.n += 1;

            let prev = &self.seq[n];
            if !self.pool.take(prev) {
                continue;
            }

            let curr = &self.seq[n + 1];
            if !self.pool.contains(curr) {
                continue;
            }

            if !(allowed(self.from_mask, n) && allowed(self.to_mask, n + 1)) {
                continue;
            }

            let possible = match &self.test {
                None => self.pool.items().cloned().collect(),
                Some((test, values)) => {
                    let (Some(prev_value), Some(curr_value)) =
                        (values.lookup(prev), values.lookup(curr))
                    else {
                        continue;
                    };
                    if !test(prev_value, curr_value) {
                        continue;
                    }
                    self.pool
                        .items()
                        .filter(|item| {
                            values.lookup(item).is_some_and(|value| test(prev_value, value))
                        })
                        .cloned()
                        .collect()
                }
            };

            return Some(Transition { prev: prev.clone(), curr: curr.clone(), possible });
        }
        None
    }
}
