use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    sort_by_index, IndexAllocator, IndexAttribute, IndexWrite, IndexWriter, NeighborIndices,
    Orderable, OrderingError,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePath {
    Empty,
    Unchanged,
    RepairAll,
    Incremental,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RepairTrigger {
    MissingIdentifier,
    NoIndices,
    PartialIndices,
    DuplicateIndices,
    /// Incremental indices did not reproduce the requested order.
    OrderMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexAssignment {
    pub item_id: String,
    pub previous_index: Option<String>,
    pub index: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingIdentifier,
    Allocation,
    Write,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ItemFailure {
    pub position: usize,
    pub item_id: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

impl ItemFailure {
    fn from_error(position: usize, item_id: Option<&str>, err: &OrderingError) -> Self {
        let kind = match err {
            OrderingError::MissingIdentifier { .. } => FailureKind::MissingIdentifier,
            OrderingError::Allocation { .. } => FailureKind::Allocation,
            OrderingError::Write { .. } | OrderingError::Read(_) => FailureKind::Write,
        };
        Self {
            position,
            item_id: item_id.map(str::to_string),
            kind,
            message: err.to_string(),
        }
    }
}

/// Outcome of one reconcile run. Failures are recorded here, never returned.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileReport {
    pub path: ReconcilePath,
    pub repair_triggers: Vec<RepairTrigger>,
    pub assignments: Vec<IndexAssignment>,
    pub skipped: usize,
    pub failures: Vec<ItemFailure>,
    pub aborted: bool,
}

impl ReconcileReport {
    fn new(path: ReconcilePath) -> Self {
        Self {
            path,
            repair_triggers: Vec::new(),
            assignments: Vec::new(),
            skipped: 0,
            failures: Vec::new(),
            aborted: false,
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.aborted
    }

    /// Index value assigned to `item_id` in this run, if any.
    #[must_use]
    pub fn assigned_index(&self, item_id: &str) -> Option<&str> {
        self.assignments
            .iter()
            .rev()
            .find(|assignment| assignment.item_id == item_id)
            .map(|assignment| assignment.index.as_str())
    }
}

/// Repairs or incrementally updates the persisted indices of a collection so
/// that it sorts in a caller-chosen order.
#[derive(Debug, Clone)]
pub struct ReorderReconciler<A> {
    allocator: A,
    attribute: IndexAttribute,
}

impl<A: IndexAllocator> ReorderReconciler<A> {
    pub fn new(allocator: A, attribute: IndexAttribute) -> Self {
        Self { allocator, attribute }
    }

    /// Persist indices so `new_order` becomes the sorted order.
    ///
    /// Each item's current index is taken as its persisted value.
    pub fn reconcile<T, W>(&self, new_order: &[T], space_id: &str, writer: &mut W) -> ReconcileReport
    where
        T: Orderable + Clone,
        W: IndexWriter + ?Sized,
    {
        if new_order.is_empty() {
            debug!(space_id, "reorder of empty collection ignored");
            return ReconcileReport::new(ReconcilePath::Empty);
        }

        let triggers = repair_triggers(new_order);
        if triggers.is_empty() {
            self.incremental(new_order, space_id, writer)
        } else {
            info!(space_id, items = new_order.len(), ?triggers, "repairing all indices");
            let mut report = self.repair_all(new_order, space_id, writer);
            report.repair_triggers = triggers;
            report
        }
    }

    fn repair_all<T, W>(&self, new_order: &[T], space_id: &str, writer: &mut W) -> ReconcileReport
    where
        T: Orderable,
        W: IndexWriter + ?Sized,
    {
        let mut report = ReconcileReport::new(ReconcilePath::RepairAll);
        let mut previous: Option<String> = None;

        for (position, item) in new_order.iter().enumerate() {
            let Some(item_id) = item.ordering_id() else {
                let err = OrderingError::MissingIdentifier { position };
                warn!(space_id, position, error = %err, "index repair aborted");
                report.failures.push(ItemFailure::from_error(position, None, &err));
                report.aborted = true;
                return report;
            };

            let outcome = self
                .allocator
                .allocate(item_id, previous.as_deref(), None)
                .and_then(|index| self.write(writer, space_id, item_id, index));
            match outcome {
                Ok(index) => {
                    report.assignments.push(IndexAssignment {
                        item_id: item_id.to_string(),
                        previous_index: item.order_index().map(str::to_string),
                        index: index.clone(),
                    });
                    previous = Some(index);
                }
                Err(err) => {
                    warn!(space_id, position, item_id, error = %err, "index repair aborted");
                    report.failures.push(ItemFailure::from_error(position, Some(item_id), &err));
                    report.aborted = true;
                    return report;
                }
            }
        }

        report
    }

    fn incremental<T, W>(&self, new_order: &[T], space_id: &str, writer: &mut W) -> ReconcileReport
    where
        T: Orderable + Clone,
        W: IndexWriter + ?Sized,
    {
        let sorted = sort_by_index(new_order);
        if sorted
            .iter()
            .map(Orderable::ordering_id)
            .eq(new_order.iter().map(Orderable::ordering_id))
        {
            debug!(space_id, items = new_order.len(), "order unchanged");
            return ReconcileReport::new(ReconcilePath::Unchanged);
        }

        info!(space_id, items = new_order.len(), "updating indices incrementally");
        let mut report = ReconcileReport::new(ReconcilePath::Incremental);
        let mut known: HashMap<&str, String> = new_order
            .iter()
            .filter_map(|item| Some((item.ordering_id()?, item.order_index()?.to_string())))
            .collect();

        for (position, item) in new_order.iter().enumerate() {
            let Some(item_id) = item.ordering_id() else {
                continue;
            };
            let neighbor = |offset: Option<usize>| {
                offset
                    .and_then(|index| new_order.get(index))
                    .and_then(Orderable::ordering_id)
                    .and_then(|id| known.get(id).cloned())
            };
            let before = neighbor(position.checked_sub(1));
            let after = neighbor(position.checked_add(1));
            let current = known.get(item_id).cloned();

            let neighbors = NeighborIndices {
                before: before.as_deref(),
                after: after.as_deref(),
                current: current.as_deref(),
            };
            if !neighbors.needs_update() {
                debug!(space_id, position, item_id, "index already in place");
                report.skipped += 1;
                continue;
            }

            let upper = match (before.as_deref(), after.as_deref()) {
                (Some(lower), Some(upper)) if lower >= upper => None,
                (_, upper) => upper,
            };
            let outcome = self
                .allocator
                .allocate(item_id, before.as_deref(), upper)
                .and_then(|index| self.write(writer, space_id, item_id, index));
            match outcome {
                Ok(index) => {
                    known.insert(item_id, index.clone());
                    report.assignments.push(IndexAssignment {
                        item_id: item_id.to_string(),
                        previous_index: current,
                        index,
                    });
                }
                Err(err) => {
                    warn!(space_id, position, item_id, error = %err, "index update failed");
                    report.failures.push(ItemFailure::from_error(position, Some(item_id), &err));
                }
            }
        }

        if report.failures.is_empty() && !sorts_into(new_order, &known) {
            info!(space_id, items = new_order.len(), "updated indices do not sort into requested order");
            let mut repaired = self.repair_all(new_order, space_id, writer);
            repaired.repair_triggers = vec![RepairTrigger::OrderMismatch];
            report.assignments.append(&mut repaired.assignments);
            repaired.assignments = report.assignments;
            repaired.skipped = report.skipped;
            return repaired;
        }

        report
    }

    fn write<W>(
        &self,
        writer: &mut W,
        space_id: &str,
        item_id: &str,
        index: String,
    ) -> Result<String, OrderingError>
    where
        W: IndexWriter + ?Sized,
    {
        writer.upsert_index(&IndexWrite {
            entity_id: item_id,
            attribute: &self.attribute,
            value: &index,
            space_id,
        })?;
        Ok(index)
    }
}

/// Whether `items`, carrying the indices in `known`, sort back into their
/// current order.
fn sorts_into<T: Orderable + Clone>(items: &[T], known: &HashMap<&str, String>) -> bool {
    let updated = items
        .iter()
        .cloned()
        .map(|mut item| {
            let index = item.ordering_id().and_then(|id| known.get(id)).cloned();
            item.set_order_index(index);
            item
        })
        .collect::<Vec<_>>();
    sort_by_index(&updated)
        .iter()
        .map(Orderable::ordering_id)
        .eq(items.iter().map(Orderable::ordering_id))
}

fn repair_triggers<T: Orderable>(items: &[T]) -> Vec<RepairTrigger> {
    let mut triggers = Vec::new();
    if items.iter().any(|item| item.ordering_id().is_none()) {
        triggers.push(RepairTrigger::MissingIdentifier);
    }

    let indices = items.iter().filter_map(Orderable::order_index).collect::<Vec<_>>();
    if indices.is_empty() {
        triggers.push(RepairTrigger::NoIndices);
    } else if indices.len() < items.len() {
        triggers.push(RepairTrigger::PartialIndices);
    }

    let mut seen = HashSet::with_capacity(indices.len());
    if indices.iter().any(|index| !seen.insert(*index)) {
        triggers.push(RepairTrigger::DuplicateIndices);
    }

    triggers
}
