use std::collections::HashSet;

use anyhow::Result;
use relation_order_core::{sort_by_index, IndexAttribute, Orderable};
use relation_order_store_sqlite::{RelationRecord, SqliteStore};
use serde::{Deserialize, Serialize};

pub const SHOWN_COLUMNS_TYPE: &str = "shown-columns";
/// Column relation type written before `shown-columns` existed.
pub const PROPERTIES_TYPE: &str = "properties";
pub const NAME_ATTRIBUTE: &str = "name";

/// Which relations make up an ordered collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectionShape {
    TableColumns { block_entity_id: String },
    RelationChips { entity_id: String, attribute_id: String },
    ShownProperties { relation_ids: Vec<String> },
}

impl CollectionShape {
    /// Stable key identifying this collection within a space.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::TableColumns { block_entity_id } => format!("table_columns:{block_entity_id}"),
            Self::RelationChips { entity_id, attribute_id } => {
                format!("relation_chips:{entity_id}:{attribute_id}")
            }
            Self::ShownProperties { relation_ids } => {
                format!("shown_properties:{}", relation_ids.join(","))
            }
        }
    }

    pub(crate) fn members(
        &self,
        store: &SqliteStore,
        space_id: &str,
        attribute: &IndexAttribute,
    ) -> Result<Vec<RelationRecord>> {
        match self {
            Self::TableColumns { block_entity_id } => {
                table_columns(store, space_id, block_entity_id, attribute)
            }
            Self::RelationChips { entity_id, attribute_id } => {
                store.list_relations(space_id, entity_id, &[attribute_id.as_str()], attribute)
            }
            Self::ShownProperties { relation_ids } => {
                store.get_relations(space_id, relation_ids, attribute)
            }
        }
    }
}

pub(crate) fn table_columns(
    store: &SqliteStore,
    space_id: &str,
    block_entity_id: &str,
    attribute: &IndexAttribute,
) -> Result<Vec<RelationRecord>> {
    let shown = store.list_relations(space_id, block_entity_id, &[SHOWN_COLUMNS_TYPE], attribute)?;
    if !shown.is_empty() {
        return Ok(shown);
    }
    store.list_relations(space_id, block_entity_id, &[PROPERTIES_TYPE], attribute)
}

/// Relation type new columns of a table should be added with.
pub(crate) fn active_column_type(members: &[RelationRecord]) -> &'static str {
    if members.iter().any(|member| member.type_id == SHOWN_COLUMNS_TYPE) {
        SHOWN_COLUMNS_TYPE
    } else {
        PROPERTIES_TYPE
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionView {
    pub space_id: String,
    pub collection: CollectionShape,
    pub items: Vec<RelationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shown_column_ids: Option<Vec<String>>,
}

impl CollectionView {
    pub(crate) fn new(space_id: &str, collection: CollectionShape, items: Vec<RelationRecord>) -> Self {
        let shown_column_ids = matches!(collection, CollectionShape::TableColumns { .. })
            .then(|| shown_column_ids(&items));
        Self { space_id: space_id.to_string(), collection, items, shown_column_ids }
    }

    #[must_use]
    pub fn relation_ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.relation_id.as_str()).collect()
    }
}

/// Column entity ids in display order; the name column is always shown.
fn shown_column_ids(items: &[RelationRecord]) -> Vec<String> {
    let mut ids = items.iter().map(|item| item.to_entity_id.clone()).collect::<Vec<_>>();
    if !ids.iter().any(|id| id == NAME_ATTRIBUTE) {
        ids.push(NAME_ATTRIBUTE.to_string());
    }
    ids
}

/// Turn requested relation ids into a full ordering of `members`.
///
/// Ids that are not members are ignored and repeated ids count once. Members
/// that were not requested follow in their current display order.
pub(crate) fn plan_reorder(members: &[RelationRecord], requested: &[String]) -> Vec<RelationRecord> {
    let sorted = sort_by_index(members);
    let mut placed = HashSet::new();
    let mut order = Vec::with_capacity(sorted.len());

    for relation_id in requested {
        if let Some(member) = sorted.iter().find(|member| member.ordering_id() == Some(relation_id.as_str())) {
            if placed.insert(member.relation_id.clone()) {
                order.push(member.clone());
            }
        }
    }

    for member in sorted {
        if !placed.contains(&member.relation_id) {
            order.push(member);
        }
    }

    order
}
