use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use relation_order_core::{
    MidpointAllocator, OrderableCollection, ReconcileReport, ReorderReconciler,
};
use relation_order_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};
use tracing::info;

mod coalesce;
mod collection;
mod config;

pub use coalesce::ReorderCoalescer;
pub use collection::{
    CollectionShape, CollectionView, NAME_ATTRIBUTE, PROPERTIES_TYPE, SHOWN_COLUMNS_TYPE,
};
pub use config::{OrderingConfig, DEFAULT_REORDER_QUIET_PERIOD_MS};
pub use relation_order_store_sqlite::{NewRelation, RelationRecord, SchemaStatus, Triple};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoveRelationRequest {
    pub space_id: String,
    pub relation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoveRelationResult {
    pub space_id: String,
    pub relation_id: String,
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListRelationsRequest {
    pub space_id: String,
    pub from_entity_id: String,
    pub type_ids: Vec<String>,
}

/// Raw write of an index fact, bypassing reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetIndexRequest {
    pub space_id: String,
    pub entity_id: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShowCollectionRequest {
    pub space_id: String,
    pub collection: CollectionShape,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReorderRequest {
    pub space_id: String,
    pub collection: CollectionShape,
    pub relation_ids: Vec<String>,
}

impl ReorderRequest {
    /// Key under which rapid reorders of the same collection are coalesced.
    #[must_use]
    pub fn coalesce_key(&self) -> String {
        format!("{}/{}", self.space_id, self.collection.key())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReorderResult {
    pub report: ReconcileReport,
    pub view: CollectionView,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToggleColumnRequest {
    pub space_id: String,
    pub block_entity_id: String,
    pub column_entity_id: String,
    pub column_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToggleColumnResult {
    pub shown: bool,
    pub added: Option<RelationRecord>,
    pub removed_relation_ids: Vec<String>,
    pub view: CollectionView,
}

#[derive(Debug, Clone)]
pub struct OrderingApi {
    db_path: PathBuf,
    config: OrderingConfig,
}

impl OrderingApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_config(db_path, OrderingConfig::default())
    }

    #[must_use]
    pub fn with_config(db_path: PathBuf, config: OrderingConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &OrderingConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    fn reconciler(&self) -> ReorderReconciler<MidpointAllocator> {
        ReorderReconciler::new(MidpointAllocator, self.config.index_attribute.clone())
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Add one relation, seeded with the configured initial index.
    ///
    /// # Errors
    /// Returns an error when required ids are empty or persistence fails.
    pub fn add_relation(&self, input: &NewRelation) -> Result<RelationRecord> {
        for (field, value) in [
            ("space_id", &input.space_id),
            ("type_id", &input.type_id),
            ("from_entity_id", &input.from_entity_id),
            ("to_entity_id", &input.to_entity_id),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{field} must not be empty"));
            }
        }

        let mut store = self.open_migrated_store()?;
        store.add_relation(input, &self.config.initial_index, &self.config.index_attribute)
    }

    /// Remove one relation and its facts.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn remove_relation(&self, input: RemoveRelationRequest) -> Result<RemoveRelationResult> {
        let mut store = self.open_migrated_store()?;
        let removed = store.remove_relation(&input.space_id, &input.relation_id)?;
        Ok(RemoveRelationResult { space_id: input.space_id, relation_id: input.relation_id, removed })
    }

    /// List relations out of an entity, in creation order.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_relations(&self, input: &ListRelationsRequest) -> Result<Vec<RelationRecord>> {
        let store = self.open_migrated_store()?;
        let type_ids = input.type_ids.iter().map(String::as_str).collect::<Vec<_>>();
        store.list_relations(
            &input.space_id,
            &input.from_entity_id,
            &type_ids,
            &self.config.index_attribute,
        )
    }

    /// Write an index fact as-is.
    ///
    /// # Errors
    /// Returns an error when the value is empty or the write fails.
    pub fn set_index(&self, input: &SetIndexRequest) -> Result<Triple> {
        if input.value.is_empty() {
            return Err(anyhow!("index value must not be empty"));
        }
        let mut store = self.open_migrated_store()?;
        store.upsert_triple(
            &input.space_id,
            &input.entity_id,
            &self.config.index_attribute,
            &input.value,
        )
    }

    /// Load a collection sorted by its persisted indices.
    ///
    /// # Errors
    /// Returns an error when members or indices cannot be read.
    pub fn load_collection(&self, input: ShowCollectionRequest) -> Result<CollectionView> {
        let store = self.open_migrated_store()?;
        let (_, sorted) = self.loaded_collection(&store, &input.space_id, &input.collection)?;
        Ok(CollectionView::new(&input.space_id, input.collection, sorted))
    }

    /// Reorder a collection to follow `relation_ids` and persist the indices
    /// that must change. Per-item failures are reported, not returned.
    ///
    /// # Errors
    /// Returns an error when the collection cannot be loaded.
    pub fn reorder_collection(&self, input: ReorderRequest) -> Result<ReorderResult> {
        let mut store = self.open_migrated_store()?;
        let (mut collection, sorted) =
            self.loaded_collection(&store, &input.space_id, &input.collection)?;

        let new_order = collection::plan_reorder(&sorted, &input.relation_ids);
        let report = collection.reorder(&self.reconciler(), new_order, &mut store);
        info!(
            space_id = %input.space_id,
            collection = %input.collection.key(),
            path = ?report.path,
            writes = report.assignments.len(),
            failures = report.failures.len(),
            "collection reordered"
        );

        let view = CollectionView::new(&input.space_id, input.collection, collection.sorted_items());
        Ok(ReorderResult { report, view })
    }

    /// Show or hide a table column.
    ///
    /// # Errors
    /// Returns an error when the table cannot be read or the change fails.
    pub fn toggle_column(&self, input: ToggleColumnRequest) -> Result<ToggleColumnResult> {
        let mut store = self.open_migrated_store()?;
        let attribute = &self.config.index_attribute;
        let members =
            collection::table_columns(&store, &input.space_id, &input.block_entity_id, attribute)?;

        let existing = members
            .iter()
            .filter(|member| member.to_entity_id == input.column_entity_id)
            .map(|member| member.relation_id.clone())
            .collect::<Vec<_>>();

        let (added, removed_relation_ids) = if existing.is_empty() {
            let relation = NewRelation {
                relation_id: None,
                space_id: input.space_id.clone(),
                type_id: collection::active_column_type(&members).to_string(),
                from_entity_id: input.block_entity_id.clone(),
                to_entity_id: input.column_entity_id.clone(),
                to_entity_name: input.column_name.clone(),
            };
            let added = store.add_relation(&relation, &self.config.initial_index, attribute)?;
            (Some(added), Vec::new())
        } else {
            for relation_id in &existing {
                store.remove_relation(&input.space_id, relation_id)?;
            }
            (None, existing)
        };

        let shape = CollectionShape::TableColumns { block_entity_id: input.block_entity_id };
        let (_, sorted) = self.loaded_collection(&store, &input.space_id, &shape)?;
        Ok(ToggleColumnResult {
            shown: added.is_some(),
            added,
            removed_relation_ids,
            view: CollectionView::new(&input.space_id, shape, sorted),
        })
    }

    fn loaded_collection(
        &self,
        store: &SqliteStore,
        space_id: &str,
        shape: &CollectionShape,
    ) -> Result<(OrderableCollection<RelationRecord>, Vec<RelationRecord>)> {
        let attribute = &self.config.index_attribute;
        let members = shape.members(store, space_id, attribute)?;
        let mut collection = OrderableCollection::new(space_id, attribute.clone(), members);
        let sorted = collection
            .load(store)
            .with_context(|| format!("failed to load collection {}", shape.key()))?;
        Ok((collection, sorted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relation_order_core::{ReconcilePath, RepairTrigger};

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("relation-order-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn column(to: &str) -> NewRelation {
        NewRelation {
            relation_id: Some(format!("rel-{to}")),
            space_id: "space-1".to_string(),
            type_id: SHOWN_COLUMNS_TYPE.to_string(),
            from_entity_id: "block-1".to_string(),
            to_entity_id: to.to_string(),
            to_entity_name: None,
        }
    }

    fn table() -> CollectionShape {
        CollectionShape::TableColumns { block_entity_id: "block-1".to_string() }
    }

    fn reorder(api: &OrderingApi, ids: &[&str]) -> Result<ReorderResult> {
        api.reorder_collection(ReorderRequest {
            space_id: "space-1".to_string(),
            collection: table(),
            relation_ids: ids.iter().map(|id| (*id).to_string()).collect(),
        })
    }

    fn show(api: &OrderingApi, collection: CollectionShape) -> Result<CollectionView> {
        api.load_collection(ShowCollectionRequest { space_id: "space-1".to_string(), collection })
    }

    // Test IDs: TAPI-001
    #[test]
    fn reorder_persists_and_reloads_requested_order() -> Result<()> {
        let api = OrderingApi::new(unique_temp_db_path());
        for to in ["a", "b", "c"] {
            api.add_relation(&column(to))?;
        }

        let first = reorder(&api, &["rel-c", "rel-a", "rel-b"])?;
        assert_eq!(first.report.path, ReconcilePath::RepairAll);
        assert_eq!(first.report.repair_triggers, vec![RepairTrigger::DuplicateIndices]);
        assert_eq!(first.view.relation_ids(), vec!["rel-c", "rel-a", "rel-b"]);

        let reloaded = show(&api, table())?;
        assert_eq!(reloaded.relation_ids(), vec!["rel-c", "rel-a", "rel-b"]);
        assert_eq!(
            reloaded.shown_column_ids,
            Some(vec!["c".to_string(), "a".to_string(), "b".to_string(), NAME_ATTRIBUTE.to_string()])
        );
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn second_reorder_is_incremental_and_minimal() -> Result<()> {
        let api = OrderingApi::new(unique_temp_db_path());
        for to in ["a", "b", "c"] {
            api.add_relation(&column(to))?;
        }
        reorder(&api, &["rel-a", "rel-b", "rel-c"])?;

        let moved = reorder(&api, &["rel-c", "rel-a", "rel-b"])?;

        assert_eq!(moved.report.path, ReconcilePath::Incremental);
        assert_eq!(moved.report.assignments.len(), 1);
        assert_eq!(moved.report.assignments[0].item_id, "rel-c");
        assert_eq!(show(&api, table())?.relation_ids(), vec!["rel-c", "rel-a", "rel-b"]);

        let unchanged = reorder(&api, &["rel-c", "rel-a", "rel-b"])?;
        assert_eq!(unchanged.report.path, ReconcilePath::Unchanged);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn reorder_ignores_unknown_ids_and_keeps_unrequested_members() -> Result<()> {
        let api = OrderingApi::new(unique_temp_db_path());
        for to in ["a", "b", "c"] {
            api.add_relation(&column(to))?;
        }
        reorder(&api, &["rel-a", "rel-b", "rel-c"])?;

        let result = reorder(&api, &["placeholder-row", "rel-b"])?;

        assert_eq!(result.view.relation_ids(), vec!["rel-b", "rel-a", "rel-c"]);
        assert!(result.report.is_clean());
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn table_falls_back_to_legacy_properties_relations() -> Result<()> {
        let api = OrderingApi::new(unique_temp_db_path());
        let mut legacy = column("status");
        legacy.type_id = PROPERTIES_TYPE.to_string();
        api.add_relation(&legacy)?;

        let view = show(&api, table())?;
        assert_eq!(view.relation_ids(), vec!["rel-status"]);

        api.add_relation(&column("owner"))?;
        let view = show(&api, table())?;
        assert_eq!(view.relation_ids(), vec!["rel-owner"]);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn toggle_column_adds_then_removes() -> Result<()> {
        let api = OrderingApi::new(unique_temp_db_path());
        api.add_relation(&column("status"))?;
        let request = ToggleColumnRequest {
            space_id: "space-1".to_string(),
            block_entity_id: "block-1".to_string(),
            column_entity_id: "owner".to_string(),
            column_name: Some("Owner".to_string()),
        };

        let shown = api.toggle_column(request.clone())?;
        assert!(shown.shown);
        let Some(added) = shown.added else {
            return Err(anyhow!("toggle should add a relation"));
        };
        assert_eq!(added.type_id, SHOWN_COLUMNS_TYPE);
        assert_eq!(added.index.as_deref(), Some("a"));
        assert_eq!(shown.view.items.len(), 2);

        let hidden = api.toggle_column(request)?;
        assert!(!hidden.shown);
        assert_eq!(hidden.removed_relation_ids, vec![added.relation_id]);
        assert_eq!(hidden.view.relation_ids(), vec!["rel-status"]);
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn relation_chips_and_shown_properties_are_ordered() -> Result<()> {
        let api = OrderingApi::new(unique_temp_db_path());
        for to in ["x", "y"] {
            api.add_relation(&NewRelation {
                relation_id: Some(format!("chip-{to}")),
                space_id: "space-1".to_string(),
                type_id: "tags".to_string(),
                from_entity_id: "entity-1".to_string(),
                to_entity_id: to.to_string(),
                to_entity_name: None,
            })?;
        }
        api.set_index(&SetIndexRequest {
            space_id: "space-1".to_string(),
            entity_id: "chip-x".to_string(),
            value: "b".to_string(),
        })?;

        let chips = show(
            &api,
            CollectionShape::RelationChips {
                entity_id: "entity-1".to_string(),
                attribute_id: "tags".to_string(),
            },
        )?;
        assert_eq!(chips.relation_ids(), vec!["chip-y", "chip-x"]);
        assert_eq!(chips.shown_column_ids, None);

        let props = show(
            &api,
            CollectionShape::ShownProperties {
                relation_ids: vec!["chip-x".to_string(), "missing".to_string(), "chip-y".to_string()],
            },
        )?;
        assert_eq!(props.relation_ids(), vec!["chip-y", "chip-x"]);
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn remove_relation_reports_whether_it_existed() -> Result<()> {
        let api = OrderingApi::new(unique_temp_db_path());
        api.add_relation(&column("a"))?;
        let request =
            RemoveRelationRequest { space_id: "space-1".to_string(), relation_id: "rel-a".to_string() };

        assert!(api.remove_relation(request.clone())?.removed);
        assert!(!api.remove_relation(request)?.removed);
        Ok(())
    }

    // Test IDs: TAPI-008
    #[test]
    fn add_relation_rejects_empty_ids() {
        let api = OrderingApi::new(unique_temp_db_path());
        let mut relation = column("a");
        relation.from_entity_id = " ".to_string();

        assert!(api.add_relation(&relation).is_err());
    }

    // Test IDs: TAPI-009
    #[test]
    fn migrate_dry_run_reports_pending_versions() -> Result<()> {
        let api = OrderingApi::new(unique_temp_db_path());

        let planned = api.migrate(true)?;
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));
        Ok(())
    }

    // Test IDs: TAPI-010
    #[test]
    fn configured_attribute_and_initial_index_are_used() -> Result<()> {
        let config = OrderingConfig::from_yaml_str(
            "index_attribute:\n  id: column-index\n  name: Column index\ninitial_index: m\n",
        )?;
        let db_path = unique_temp_db_path();
        let api = OrderingApi::with_config(db_path.clone(), config);

        let added = api.add_relation(&column("a"))?;
        assert_eq!(added.index.as_deref(), Some("m"));

        let default_view = OrderingApi::new(db_path).load_collection(ShowCollectionRequest {
            space_id: "space-1".to_string(),
            collection: table(),
        })?;
        assert_eq!(default_view.items[0].index, None);
        Ok(())
    }
}
