use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::str::Chars;

use serde::{Deserialize, Serialize};

mod allocate;
mod collection;
mod reconcile;

pub use allocate::{key_between, KeyError, MidpointAllocator, CANONICAL_START_INDEX};
pub use collection::{LoadState, OrderableCollection};
pub use reconcile::{
    FailureKind, IndexAssignment, ItemFailure, ReconcilePath, ReconcileReport, ReorderReconciler,
    RepairTrigger,
};

pub const DEFAULT_INDEX_ATTRIBUTE_ID: &str = "index-attribute";
pub const DEFAULT_INDEX_ATTRIBUTE_NAME: &str = "Index";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OrderingError {
    #[error("item at position {position} has neither relation_id nor id")]
    MissingIdentifier { position: usize },
    #[error("index allocation failed for {item_id}: {reason}")]
    Allocation { item_id: String, reason: String },
    #[error("index write failed for {item_id}: {reason}")]
    Write { item_id: String, reason: String },
    #[error("index read failed: {0}")]
    Read(String),
}

/// Attribute under which an item's index fact is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(default)]
pub struct IndexAttribute {
    pub id: String,
    pub name: String,
}

impl Default for IndexAttribute {
    fn default() -> Self {
        Self {
            id: DEFAULT_INDEX_ATTRIBUTE_ID.to_string(),
            name: DEFAULT_INDEX_ATTRIBUTE_NAME.to_string(),
        }
    }
}

/// Anything that can be placed in a user-ordered collection.
pub trait Orderable {
    /// Current index value, if one has been assigned.
    fn order_index(&self) -> Option<&str>;

    /// Identifier used to key index persistence (relation id before entity id).
    fn ordering_id(&self) -> Option<&str>;

    fn set_order_index(&mut self, index: Option<String>);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrderableItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(flatten)]
    pub payload: BTreeMap<String, serde_json::Value>,
}

impl OrderableItem {
    #[must_use]
    pub fn relation(relation_id: &str, index: Option<&str>) -> Self {
        Self {
            id: None,
            relation_id: Some(relation_id.to_string()),
            index: index.map(str::to_string),
            payload: BTreeMap::new(),
        }
    }
}

impl Orderable for OrderableItem {
    fn order_index(&self) -> Option<&str> {
        non_empty(self.index.as_deref())
    }

    fn ordering_id(&self) -> Option<&str> {
        non_empty(self.relation_id.as_deref()).or_else(|| non_empty(self.id.as_deref()))
    }

    fn set_order_index(&mut self, index: Option<String>) {
        self.index = index;
    }
}

/// Persisted index value of one entity, as returned by an [`IndexReader`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexedEntityRecord {
    pub entity_id: String,
    pub index: Option<String>,
}

/// One index fact to persist.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct IndexWrite<'a> {
    pub entity_id: &'a str,
    pub attribute: &'a IndexAttribute,
    pub value: &'a str,
    pub space_id: &'a str,
}

pub trait IndexAllocator {
    /// Produce an index sorting strictly between `before` and `after`.
    ///
    /// With only `before` the result sorts after it, with only `after` it sorts
    /// before it, and with neither it is the canonical starting index.
    ///
    /// # Errors
    /// Returns [`OrderingError::Allocation`] when no such index exists.
    fn allocate(
        &self,
        item_id: &str,
        before: Option<&str>,
        after: Option<&str>,
    ) -> Result<String, OrderingError>;
}

pub trait IndexWriter {
    /// Upsert one index fact. Last write wins; there is no revision check.
    ///
    /// # Errors
    /// Returns [`OrderingError::Write`] when the fact cannot be persisted.
    fn upsert_index(&mut self, write: &IndexWrite<'_>) -> Result<(), OrderingError>;
}

pub trait IndexReader {
    /// Fetch the persisted index value for every requested entity id.
    ///
    /// # Errors
    /// Returns [`OrderingError::Read`] when the backing store cannot be queried.
    fn fetch_index_records(
        &self,
        space_id: &str,
        entity_ids: &[String],
        attribute: &IndexAttribute,
    ) -> Result<Vec<IndexedEntityRecord>, OrderingError>;
}

impl<W: IndexWriter + ?Sized> IndexWriter for &mut W {
    fn upsert_index(&mut self, write: &IndexWrite<'_>) -> Result<(), OrderingError> {
        (**self).upsert_index(write)
    }
}

#[must_use]
pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

/// Numeric-aware string comparison: runs of ASCII digits compare by value.
///
/// Returns [`Ordering::Equal`] only for identical strings; numerically equal
/// runs order the one with fewer leading zeros first.
#[must_use]
pub fn natural_cmp(lhs: &str, rhs: &str) -> Ordering {
    let mut lhs_chars = lhs.chars().peekable();
    let mut rhs_chars = rhs.chars().peekable();

    loop {
        match (lhs_chars.peek().copied(), rhs_chars.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(left), Some(right)) if left.is_ascii_digit() && right.is_ascii_digit() => {
                let left_run = take_digit_run(&mut lhs_chars);
                let right_run = take_digit_run(&mut rhs_chars);
                let ordering = cmp_digit_runs(&left_run, &right_run);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(left), Some(right)) => {
                if left != right {
                    return left.cmp(&right);
                }
                lhs_chars.next();
                rhs_chars.next();
            }
        }
    }
}

fn take_digit_run(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(ch) = chars.next_if(char::is_ascii_digit) {
        run.push(ch);
    }
    run
}

fn cmp_digit_runs(lhs: &str, rhs: &str) -> Ordering {
    let lhs_value = lhs.trim_start_matches('0');
    let rhs_value = rhs.trim_start_matches('0');
    lhs_value
        .len()
        .cmp(&rhs_value.len())
        .then_with(|| lhs_value.cmp(rhs_value))
        .then_with(|| lhs.len().cmp(&rhs.len()))
}

/// Total order used for display ordering of a collection.
///
/// Indexed items come first in natural index order. Unindexed items follow,
/// ordered by identifier; items without any identifier come last. Ties are
/// left to the caller's stable sort.
#[must_use]
pub fn compare_orderable<T: Orderable + ?Sized>(lhs: &T, rhs: &T) -> Ordering {
    match (lhs.order_index(), rhs.order_index()) {
        (Some(left), Some(right)) => natural_cmp(left, right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => match (lhs.ordering_id(), rhs.ordering_id()) {
            (Some(left), Some(right)) => left.cmp(right),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        },
    }
}

/// Sort a collection by index without mutating the input.
///
/// When no item carries an index the input order is returned unchanged.
#[must_use]
pub fn sort_by_index<T: Orderable + Clone>(items: &[T]) -> Vec<T> {
    let mut sorted = items.to_vec();
    if !items.iter().any(|item| item.order_index().is_some()) {
        return sorted;
    }

    sorted.sort_by(|lhs, rhs| compare_orderable(lhs, rhs));
    sorted
}

/// Neighbor view of one position in a proposed ordering.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct NeighborIndices<'a> {
    pub before: Option<&'a str>,
    pub after: Option<&'a str>,
    pub current: Option<&'a str>,
}

impl NeighborIndices<'_> {
    /// Whether the item at this position must receive a new index.
    #[must_use]
    pub fn needs_update(&self) -> bool {
        let before = non_empty(self.before);
        let after = non_empty(self.after);
        let Some(current) = non_empty(self.current) else {
            return true;
        };

        if before.is_some_and(|before| before > current) {
            return true;
        }

        if after.is_some_and(|after| current > after) {
            return true;
        }

        matches!((before, after), (Some(before), Some(after)) if before == after)
    }
}

/// Free-function form of [`NeighborIndices::needs_update`].
#[must_use]
pub fn needs_update(before: Option<&str>, after: Option<&str>, current: Option<&str>) -> bool {
    NeighborIndices { before, after, current }.needs_update()
}
