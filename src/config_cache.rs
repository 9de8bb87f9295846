//! Config mirror: local cache of cloud-authoritative reference data.
//!
//! The cloud is the sole writer of this data, so there is no conflict
//! resolution; every push replaces the cached entity wholesale and the last
//! write wins. POS operations read menu items, employees, printers and the
//! like from here and never block on network access.

use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::{now_rfc3339, DbState};
use crate::error::{sql, HostError, Result};

/// Read/upsert handle over the `config_cache` table.
#[derive(Clone)]
pub struct ConfigMirror {
    db: Arc<DbState>,
}

impl ConfigMirror {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Insert or wholesale-replace a mirrored entity.
    ///
    /// Keys by `{entity_type}:{id}`; the entity must carry an `id` field
    /// (string or number). An optional parent reference (`parentId`,
    /// `parent_id`, `categoryId`, or `category_id`) is extracted so children
    /// can be listed per parent. Every write refreshes `updated_at` so
    /// staleness can be audited.
    pub fn upsert(&self, entity_type: &str, entity: &Value) -> Result<()> {
        let entity_id = id_field(entity).ok_or_else(|| HostError::Invalid {
            what: "config entity",
            detail: format!("{entity_type} entity has no id field"),
        })?;
        let parent_id = parent_field(entity);
        let cache_key = format!("{entity_type}:{entity_id}");
        let data = serde_json::to_string(entity)?;
        let now = now_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO config_cache (cache_key, entity_type, entity_id, parent_id, data, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(cache_key) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    data = excluded.data,
                    updated_at = excluded.updated_at",
                params![cache_key, entity_type, entity_id, parent_id, data, now],
            )
            .map_err(sql("upsert config entity"))?;
            Ok(())
        })?;

        debug!(entity_type = %entity_type, entity_id = %entity_id, "Config entity mirrored");
        Ok(())
    }

    /// Fetch a mirrored entity by type and id.
    pub fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT data FROM config_cache WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type, entity_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql("get config entity"))
        })?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// List mirrored entities of a type under a given parent (e.g. menu
    /// items within a category).
    pub fn list_by_parent(&self, entity_type: &str, parent_id: &str) -> Result<Vec<Value>> {
        let rows: Vec<String> = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT data FROM config_cache
                     WHERE entity_type = ?1 AND parent_id = ?2
                     ORDER BY entity_id",
                )
                .map_err(sql("prepare list_by_parent"))?;
            let collected = stmt
                .query_map(params![entity_type, parent_id], |row| row.get(0))
                .map_err(sql("query list_by_parent"))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(collected)
        })?;

        let mut entities = Vec::with_capacity(rows.len());
        for json in rows {
            entities.push(serde_json::from_str(&json)?);
        }
        Ok(entities)
    }

    /// Drop every cached entity of a type. Used ahead of a full resync push.
    pub fn clear_by_type(&self, entity_type: &str) -> Result<usize> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM config_cache WHERE entity_type = ?1",
                params![entity_type],
            )
            .map_err(sql("clear config cache by type"))
        })?;
        info!(entity_type = %entity_type, removed, "Config cache cleared for resync");
        Ok(removed)
    }

    /// Number of cached entities of a type.
    pub fn count_by_type(&self, entity_type: &str) -> Result<i64> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM config_cache WHERE entity_type = ?1",
                params![entity_type],
                |row| row.get(0),
            )
            .map_err(sql("count config entities"))
        })
    }

    /// Most recent mirror write for a type, for staleness indicators.
    pub fn last_updated_at(&self, entity_type: &str) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT MAX(updated_at) FROM config_cache WHERE entity_type = ?1",
                params![entity_type],
                |row| row.get(0),
            )
            .map_err(sql("config cache last_updated_at"))
        })
    }
}

fn id_field(entity: &Value) -> Option<String> {
    match entity.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn parent_field(entity: &Value) -> Option<String> {
    for key in ["parentId", "parent_id", "categoryId", "category_id"] {
        match entity.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

// ===========================================================================
// Tests
// ===========================================================================
