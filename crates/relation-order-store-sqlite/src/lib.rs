use std::path::Path;

use anyhow::{anyhow, Context, Result};
use relation_order_core::{
    IndexAttribute, IndexReader, IndexWrite, IndexWriter, IndexedEntityRecord, Orderable,
    OrderingError,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS relations (
  relation_id TEXT PRIMARY KEY,
  space_id TEXT NOT NULL CHECK (length(space_id) > 0),
  type_id TEXT NOT NULL CHECK (length(type_id) > 0),
  from_entity_id TEXT NOT NULL,
  to_entity_id TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS triples (
  space_id TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  attribute_id TEXT NOT NULL,
  attribute_name TEXT NOT NULL,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (space_id, entity_id, attribute_id)
);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE relations ADD COLUMN to_entity_name TEXT;

CREATE INDEX IF NOT EXISTS idx_relations_from_type ON relations(space_id, from_entity_id, type_id);
CREATE INDEX IF NOT EXISTS idx_triples_attribute ON triples(space_id, attribute_id);
";

const RELATION_COLUMNS: &str = "r.relation_id, r.space_id, r.type_id, r.from_entity_id,
    r.to_entity_id, r.to_entity_name, r.created_at, t.value";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Input for [`SqliteStore::add_relation`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewRelation {
    #[serde(default)]
    pub relation_id: Option<String>,
    pub space_id: String,
    pub type_id: String,
    pub from_entity_id: String,
    pub to_entity_id: String,
    #[serde(default)]
    pub to_entity_name: Option<String>,
}

/// A stored relation joined with its index fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationRecord {
    pub relation_id: String,
    pub space_id: String,
    pub type_id: String,
    pub from_entity_id: String,
    pub to_entity_id: String,
    pub to_entity_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub index: Option<String>,
}

impl Orderable for RelationRecord {
    fn order_index(&self) -> Option<&str> {
        self.index.as_deref().filter(|index| !index.is_empty())
    }

    fn ordering_id(&self) -> Option<&str> {
        Some(self.relation_id.as_str()).filter(|id| !id.is_empty())
    }

    fn set_order_index(&mut self, index: Option<String>) {
        self.index = index;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Triple {
    pub space_id: String,
    pub entity_id: String,
    pub attribute_id: String,
    pub attribute_name: String,
    pub value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SqliteStore {
    /// Open a SQLite-backed relation store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "relations")? {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if !table_has_column(&self.conn, "relations", "relation_id")? {
            return Err(anyhow!("database schema is invalid: relations has no relation_id column"));
        }

        // Tables exist without migration records; infer the version from their shape.
        record_schema_version(&self.conn, 1)?;
        if table_has_column(&self.conn, "relations", "to_entity_name")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, "relations", "to_entity_name")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(());
        }

        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Insert a relation and seed its index fact with `initial_index`.
    ///
    /// # Errors
    /// Returns an error when the relation id already exists or the insert fails.
    pub fn add_relation(
        &mut self,
        relation: &NewRelation,
        initial_index: &str,
        attribute: &IndexAttribute,
    ) -> Result<RelationRecord> {
        let relation_id = relation
            .relation_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Ulid::new().to_string());
        let created_at = OffsetDateTime::now_utc();
        let stamp = rfc3339(created_at)?;

        let tx = self.conn.transaction().context("failed to start add_relation transaction")?;
        tx.execute(
            "INSERT INTO relations(
                relation_id, space_id, type_id, from_entity_id, to_entity_id, to_entity_name, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                relation_id,
                relation.space_id,
                relation.type_id,
                relation.from_entity_id,
                relation.to_entity_id,
                relation.to_entity_name,
                stamp,
            ],
        )
        .with_context(|| format!("failed to insert relation {relation_id}"))?;

        if !initial_index.is_empty() {
            upsert_triple_row(
                &tx,
                &relation.space_id,
                &relation_id,
                attribute,
                initial_index,
                &stamp,
            )?;
        }
        tx.commit().context("failed to commit add_relation transaction")?;

        debug!(relation_id = %relation_id, space_id = %relation.space_id, "relation added");
        Ok(RelationRecord {
            relation_id,
            space_id: relation.space_id.clone(),
            type_id: relation.type_id.clone(),
            from_entity_id: relation.from_entity_id.clone(),
            to_entity_id: relation.to_entity_id.clone(),
            to_entity_name: relation.to_entity_name.clone(),
            created_at,
            index: Some(initial_index.to_string()).filter(|index| !index.is_empty()),
        })
    }

    /// Delete a relation and every fact stored on it. Returns whether it existed.
    ///
    /// # Errors
    /// Returns an error when the delete statements fail.
    pub fn remove_relation(&mut self, space_id: &str, relation_id: &str) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start remove_relation transaction")?;
        tx.execute(
            "DELETE FROM triples WHERE space_id = ?1 AND entity_id = ?2",
            params![space_id, relation_id],
        )
        .with_context(|| format!("failed to delete facts of relation {relation_id}"))?;
        let removed = tx
            .execute(
                "DELETE FROM relations WHERE space_id = ?1 AND relation_id = ?2",
                params![space_id, relation_id],
            )
            .with_context(|| format!("failed to delete relation {relation_id}"))?;
        tx.commit().context("failed to commit remove_relation transaction")?;
        Ok(removed > 0)
    }

    /// Relations out of `from_entity_id` whose type is one of `type_ids`, in insertion order.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn list_relations(
        &self,
        space_id: &str,
        from_entity_id: &str,
        type_ids: &[&str],
        attribute: &IndexAttribute,
    ) -> Result<Vec<RelationRecord>> {
        if type_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..type_ids.len())
            .map(|offset| format!("?{}", offset + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {RELATION_COLUMNS}
             FROM relations r
             LEFT JOIN triples t
               ON t.space_id = r.space_id AND t.entity_id = r.relation_id AND t.attribute_id = ?1
             WHERE r.space_id = ?2 AND r.from_entity_id = ?3 AND r.type_id IN ({placeholders})
             ORDER BY r.rowid ASC"
        );

        let mut values = vec![attribute.id.as_str(), space_id, from_entity_id];
        values.extend_from_slice(type_ids);

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare list_relations query")?;
        let rows = stmt.query_map(params_from_iter(values.iter()), relation_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(relation_from_row(row?)?);
        }
        Ok(out)
    }

    /// Relations with the given ids, in request order. Unknown ids are skipped.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn get_relations(
        &self,
        space_id: &str,
        relation_ids: &[String],
        attribute: &IndexAttribute,
    ) -> Result<Vec<RelationRecord>> {
        let sql = format!(
            "SELECT {RELATION_COLUMNS}
             FROM relations r
             LEFT JOIN triples t
               ON t.space_id = r.space_id AND t.entity_id = r.relation_id AND t.attribute_id = ?1
             WHERE r.space_id = ?2 AND r.relation_id = ?3"
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare get_relations query")?;

        let mut out = Vec::new();
        for relation_id in relation_ids {
            let row = stmt
                .query_row(params![attribute.id, space_id, relation_id], relation_row)
                .optional()
                .with_context(|| format!("failed to load relation {relation_id}"))?;
            if let Some(row) = row {
                out.push(relation_from_row(row)?);
            }
        }
        Ok(out)
    }

    /// Insert or replace one fact. Last write wins.
    ///
    /// # Errors
    /// Returns an error when the upsert fails.
    pub fn upsert_triple(
        &mut self,
        space_id: &str,
        entity_id: &str,
        attribute: &IndexAttribute,
        value: &str,
    ) -> Result<Triple> {
        let updated_at = OffsetDateTime::now_utc();
        upsert_triple_row(&self.conn, space_id, entity_id, attribute, value, &rfc3339(updated_at)?)?;
        Ok(Triple {
            space_id: space_id.to_string(),
            entity_id: entity_id.to_string(),
            attribute_id: attribute.id.clone(),
            attribute_name: attribute.name.clone(),
            value: value.to_string(),
            updated_at,
        })
    }

    /// # Errors
    /// Returns an error when the query fails or the stored timestamp is malformed.
    pub fn get_triple(
        &self,
        space_id: &str,
        entity_id: &str,
        attribute_id: &str,
    ) -> Result<Option<Triple>> {
        let row = self
            .conn
            .query_row(
                "SELECT attribute_name, value, updated_at FROM triples
                 WHERE space_id = ?1 AND entity_id = ?2 AND attribute_id = ?3",
                params![space_id, entity_id, attribute_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load fact {attribute_id} of {entity_id}"))?;

        row.map(|(attribute_name, value, updated_at)| {
            Ok(Triple {
                space_id: space_id.to_string(),
                entity_id: entity_id.to_string(),
                attribute_id: attribute_id.to_string(),
                attribute_name,
                value,
                updated_at: parse_rfc3339(&updated_at)?,
            })
        })
        .transpose()
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

impl IndexWriter for SqliteStore {
    fn upsert_index(&mut self, write: &IndexWrite<'_>) -> Result<(), OrderingError> {
        self.upsert_triple(write.space_id, write.entity_id, write.attribute, write.value)
            .map(|_| ())
            .map_err(|err| OrderingError::Write {
                item_id: write.entity_id.to_string(),
                reason: format!("{err:#}"),
            })
    }
}

impl IndexReader for SqliteStore {
    fn fetch_index_records(
        &self,
        space_id: &str,
        entity_ids: &[String],
        attribute: &IndexAttribute,
    ) -> Result<Vec<IndexedEntityRecord>, OrderingError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT value FROM triples
                 WHERE space_id = ?1 AND entity_id = ?2 AND attribute_id = ?3",
            )
            .map_err(|err| OrderingError::Read(err.to_string()))?;

        entity_ids
            .iter()
            .map(|entity_id| {
                let index = stmt
                    .query_row(params![space_id, entity_id, attribute.id], |row| {
                        row.get::<_, String>(0)
                    })
                    .optional()
                    .map_err(|err| OrderingError::Read(format!("{entity_id}: {err}")))?;
                Ok(IndexedEntityRecord { entity_id: entity_id.clone(), index })
            })
            .collect()
    }
}

type RelationRow = (String, String, String, String, String, Option<String>, String, Option<String>);

fn relation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelationRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn relation_from_row(row: RelationRow) -> Result<RelationRecord> {
    let (relation_id, space_id, type_id, from_entity_id, to_entity_id, to_entity_name, created_at, index) =
        row;
    Ok(RelationRecord {
        created_at: parse_rfc3339(&created_at)
            .with_context(|| format!("relation {relation_id} has a malformed created_at"))?,
        relation_id,
        space_id,
        type_id,
        from_entity_id,
        to_entity_id,
        to_entity_name,
        index,
    })
}

fn upsert_triple_row(
    conn: &Connection,
    space_id: &str,
    entity_id: &str,
    attribute: &IndexAttribute,
    value: &str,
    updated_at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO triples(space_id, entity_id, attribute_id, attribute_name, value, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(space_id, entity_id, attribute_id) DO UPDATE SET
           attribute_name = excluded.attribute_name,
           value = excluded.value,
           updated_at = excluded.updated_at",
        params![space_id, entity_id, attribute.id, attribute.name, value, updated_at],
    )
    .with_context(|| format!("failed to upsert fact {} of {entity_id}", attribute.id))?;
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "relations")? {
        return Ok((0, false));
    }

    if !table_has_column(conn, "relations", "relation_id")? {
        return Err(anyhow!("database schema is invalid: relations has no relation_id column"));
    }

    if table_has_column(conn, "relations", "to_entity_name")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
