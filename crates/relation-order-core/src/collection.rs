use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    sort_by_index, IndexAllocator, IndexAttribute, IndexReader, IndexWriter, IndexedEntityRecord,
    Orderable, OrderingError, ReconcileReport, ReorderReconciler,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
}

/// A user-ordered collection together with the persisted index values known
/// for its members.
#[derive(Debug, Clone)]
pub struct OrderableCollection<T> {
    space_id: String,
    attribute: IndexAttribute,
    items: Vec<T>,
    persisted: HashMap<String, String>,
    optimistic: Option<Vec<T>>,
    state: LoadState,
}

impl<T: Orderable + Clone> OrderableCollection<T> {
    pub fn new(space_id: impl Into<String>, attribute: IndexAttribute, items: Vec<T>) -> Self {
        Self {
            space_id: space_id.into(),
            attribute,
            items,
            persisted: HashMap::new(),
            optimistic: None,
            state: LoadState::Unloaded,
        }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn is_loading(&self) -> bool {
        self.state == LoadState::Loading
    }

    pub fn persisted_index(&self, item_id: &str) -> Option<&str> {
        self.persisted.get(item_id).map(String::as_str)
    }

    /// Mark the collection as loading and return the ids whose indices must be fetched.
    pub fn start_load(&mut self) -> Vec<String> {
        self.state = LoadState::Loading;
        self.items
            .iter()
            .filter_map(Orderable::ordering_id)
            .map(str::to_string)
            .collect()
    }

    /// Merge fetched records into the members. Persisted values win; a member
    /// without a record loses any index it carried.
    pub fn finish_load(&mut self, records: Vec<IndexedEntityRecord>) -> Vec<T> {
        self.persisted = records
            .into_iter()
            .filter_map(|record| {
                let index = record.index.filter(|index| !index.is_empty())?;
                Some((record.entity_id, index))
            })
            .collect();

        for item in &mut self.items {
            let index = item
                .ordering_id()
                .and_then(|id| self.persisted.get(id))
                .cloned();
            item.set_order_index(index);
        }

        self.optimistic = None;
        self.state = LoadState::Ready;
        debug!(space_id = %self.space_id, known = self.persisted.len(), "collection loaded");
        self.sorted_items()
    }

    /// Fetch persisted indices through `reader` and return the sorted members.
    ///
    /// # Errors
    /// Propagates the reader's [`OrderingError::Read`]; the collection is left unloaded.
    pub fn load<R>(&mut self, reader: &R) -> Result<Vec<T>, OrderingError>
    where
        R: IndexReader + ?Sized,
    {
        let ids = self.start_load();
        match reader.fetch_index_records(&self.space_id, &ids, &self.attribute) {
            Ok(records) => Ok(self.finish_load(records)),
            Err(err) => {
                self.state = LoadState::Unloaded;
                Err(err)
            }
        }
    }

    /// Members in display order: the optimistic order of the last reorder if
    /// one is pending, otherwise sorted by index.
    pub fn sorted_items(&self) -> Vec<T> {
        match &self.optimistic {
            Some(order) => order.clone(),
            None => sort_by_index(&self.items),
        }
    }

    /// Adopt `new_order` as the visible order and persist indices for it.
    pub fn reorder<A, W>(
        &mut self,
        reconciler: &ReorderReconciler<A>,
        new_order: Vec<T>,
        writer: &mut W,
    ) -> ReconcileReport
    where
        A: IndexAllocator,
        W: IndexWriter + ?Sized,
    {
        let merged = new_order
            .into_iter()
            .map(|mut item| {
                let index = item
                    .ordering_id()
                    .and_then(|id| self.persisted.get(id))
                    .cloned();
                item.set_order_index(index);
                item
            })
            .collect::<Vec<_>>();

        self.optimistic = Some(merged.clone());
        let report = reconciler.reconcile(&merged, &self.space_id, writer);
        self.apply_report(&report);
        report
    }

    /// Fold successful assignments into the persisted map and the members.
    pub fn apply_report(&mut self, report: &ReconcileReport) {
        for assignment in &report.assignments {
            self.persisted
                .insert(assignment.item_id.clone(), assignment.index.clone());
        }

        let persisted = &self.persisted;
        let refresh = |item: &mut T| {
            if let Some(index) = item.ordering_id().and_then(|id| persisted.get(id)).cloned() {
                item.set_order_index(Some(index));
            }
        };
        self.items.iter_mut().for_each(refresh);
        if let Some(order) = self.optimistic.as_mut() {
            order.iter_mut().for_each(refresh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IndexWrite, MidpointAllocator, OrderableItem, ReconcilePath};

    struct MapReader(HashMap<String, String>);

    impl IndexReader for MapReader {
        fn fetch_index_records(
            &self,
            _space_id: &str,
            entity_ids: &[String],
            _attribute: &IndexAttribute,
        ) -> Result<Vec<IndexedEntityRecord>, OrderingError> {
            Ok(entity_ids
                .iter()
                .filter_map(|id| {
                    self.0.get(id).map(|index| IndexedEntityRecord {
                        entity_id: id.clone(),
                        index: Some(index.clone()),
                    })
                })
                .collect())
        }
    }

    struct BrokenReader;

    impl IndexReader for BrokenReader {
        fn fetch_index_records(
            &self,
            _space_id: &str,
            _entity_ids: &[String],
            _attribute: &IndexAttribute,
        ) -> Result<Vec<IndexedEntityRecord>, OrderingError> {
            Err(OrderingError::Read("connection reset".to_string()))
        }
    }

    #[derive(Default)]
    struct MapWriter(HashMap<String, String>);

    impl IndexWriter for MapWriter {
        fn upsert_index(&mut self, write: &IndexWrite<'_>) -> Result<(), OrderingError> {
            self.0.insert(write.entity_id.to_string(), write.value.to_string());
            Ok(())
        }
    }

    fn item(id: &str, index: Option<&str>) -> OrderableItem {
        OrderableItem::relation(id, index)
    }

    fn ids(items: &[OrderableItem]) -> Vec<&str> {
        items.iter().filter_map(Orderable::ordering_id).collect()
    }

    fn reader(pairs: &[(&str, &str)]) -> MapReader {
        MapReader(
            pairs
                .iter()
                .map(|(id, index)| ((*id).to_string(), (*index).to_string()))
                .collect(),
        )
    }

    fn collection(items: Vec<OrderableItem>) -> OrderableCollection<OrderableItem> {
        OrderableCollection::new("space-1", IndexAttribute::default(), items)
    }

    #[test]
    fn load_merges_persisted_indices_and_sorts() {
        let mut collection = collection(vec![item("1", Some("z")), item("2", None), item("3", None)]);
        assert_eq!(collection.state(), LoadState::Unloaded);

        let sorted = match collection.load(&reader(&[("2", "a"), ("3", "b")])) {
            Ok(sorted) => sorted,
            Err(err) => panic!("load failed: {err}"),
        };

        assert_eq!(collection.state(), LoadState::Ready);
        assert_eq!(ids(&sorted), vec!["2", "3", "1"]);
        assert_eq!(sorted[2].index, None);
        assert_eq!(collection.persisted_index("2"), Some("a"));
    }

    #[test]
    fn loading_state_is_visible_between_start_and_finish() {
        let mut collection = collection(vec![item("1", None)]);

        let requested = collection.start_load();
        assert!(collection.is_loading());
        assert_eq!(requested, vec!["1".to_string()]);

        collection.finish_load(Vec::new());
        assert!(!collection.is_loading());
    }

    #[test]
    fn failed_load_leaves_collection_unloaded() {
        let mut collection = collection(vec![item("1", None)]);

        let result = collection.load(&BrokenReader);

        assert!(matches!(result, Err(OrderingError::Read(_))));
        assert_eq!(collection.state(), LoadState::Unloaded);
    }

    #[test]
    fn reorder_shows_requested_order_and_persists_minimal_writes() {
        let mut collection = collection(vec![item("1", None), item("2", None), item("3", None)]);
        let loaded = collection.load(&reader(&[("1", "a"), ("2", "b"), ("3", "c")]));
        assert!(loaded.is_ok());
        let reconciler = ReorderReconciler::new(MidpointAllocator, IndexAttribute::default());
        let mut writer = MapWriter::default();

        let report = collection.reorder(
            &reconciler,
            vec![item("3", None), item("1", None), item("2", None)],
            &mut writer,
        );

        assert_eq!(report.path, ReconcilePath::Incremental);
        assert_eq!(ids(&collection.sorted_items()), vec!["3", "1", "2"]);
        assert_eq!(writer.0.len(), 1);
        assert_eq!(collection.persisted_index("3"), writer.0.get("3").map(String::as_str));
    }

    #[test]
    fn next_load_replaces_optimistic_order_with_persisted_state() {
        let mut collection = collection(vec![item("1", None), item("2", None)]);
        let reconciler = ReorderReconciler::new(MidpointAllocator, IndexAttribute::default());
        let mut writer = MapWriter::default();
        collection.reorder(&reconciler, vec![item("2", None), item("1", None)], &mut writer);
        assert_eq!(ids(&collection.sorted_items()), vec!["2", "1"]);

        let store = MapReader(writer.0.clone());
        let sorted = match collection.load(&store) {
            Ok(sorted) => sorted,
            Err(err) => panic!("load failed: {err}"),
        };

        assert_eq!(ids(&sorted), vec!["2", "1"]);
        assert_eq!(sorted[0].index.as_deref(), Some("a"));
    }
}
