use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use tokio::sync::RwLock;

use cloudprice_common::{ContextualLevel, ContextualResource};

/// Well-known preference keys. Values live in the `system_preferences`
/// table (or the in-memory store) and may be overridden per tool/region
/// through `contextual_preferences`.
pub mod keys {
    pub const ALLOWED_INSTANCE_TYPES: &str = "cluster.allowed.instance.types";
    pub const ALLOWED_INSTANCE_TYPES_DOCKER: &str = "cluster.allowed.instance.types.docker";
    pub const ALLOWED_PRICE_TYPES: &str = "cluster.allowed.price.types";
    pub const ALLOWED_MASTER_PRICE_TYPES: &str = "cluster.allowed.master.price.types";
    pub const OFFER_FILTER_TERM_TYPES: &str = "cluster.instance.offer.filter.term.types";
    pub const OFFER_FILTER_UNIQUE: &str = "cluster.instance.offer.filter.unique";
    pub const OFFER_FILTER_CPU_MIN: &str = "cluster.instance.offer.filter.cpu.min";
    pub const OFFER_FILTER_MEM_MIN: &str = "cluster.instance.offer.filter.mem.min";
    pub const OFFER_INSERT_BATCH_SIZE: &str = "cluster.instance.offer.insert.batch.size";
    pub const CLUSTER_SPOT: &str = "cluster.spot";
    pub const SPOT_ALLOC_STRATEGY: &str = "cluster.spot.alloc.strategy";
    pub const SPOT_BID_PRICE: &str = "cluster.spot.bid.price";
}

/// Typed access to flat configuration values. Absent keys and parse
/// failures both read as `None`; fallback defaults live at the call sites.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get_string(&self, key: &str) -> Option<String>;

    async fn get_int(&self, key: &str) -> Option<i64> {
        self.get_string(key).await.and_then(|v| v.trim().parse().ok())
    }

    async fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_string(key).await.and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
    }

    async fn get_double(&self, key: &str) -> Option<f64> {
        self.get_string(key).await.and_then(|v| v.trim().parse().ok())
    }
}

pub struct PgPreferenceStore {
    db: Pool<Postgres>,
}

impl PgPreferenceStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PreferenceStore for PgPreferenceStore {
    async fn get_string(&self, key: &str) -> Option<String> {
        sqlx::query_scalar("SELECT value FROM system_preferences WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.db)
            .await
            .unwrap_or(None)
    }
}

#[derive(Default)]
pub struct InMemoryPreferenceStore {
    values: RwLock<HashMap<String, String>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: &str, value: &str) {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn get_string(&self, key: &str) -> Option<String> {
        self.values.read().await.get(key).cloned()
    }
}

/// Resolves preference values that can be scoped per tool/region.
///
/// Keys are evaluated in the given priority order and every resolved value
/// is concatenated into one comma-joined string: a tool-specific allow-list
/// is additive with the system-wide one, not exclusive of it.
#[async_trait]
pub trait ContextualPreferenceResolver: Send + Sync {
    async fn search_list(&self, keys: &[&str], resources: &[ContextualResource]) -> String;
}

pub struct PgContextualPreferenceResolver {
    db: Pool<Postgres>,
}

impl PgContextualPreferenceResolver {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    async fn resolve_one(&self, key: &str, resources: &[ContextualResource]) -> Option<String> {
        for resource in resources {
            let value: Option<String> = sqlx::query_scalar(
                "SELECT value FROM contextual_preferences
                 WHERE key = $1 AND level = $2 AND resource_id = $3",
            )
            .bind(key)
            .bind(resource.level)
            .bind(&resource.resource_id)
            .fetch_optional(&self.db)
            .await
            .unwrap_or(None);
            if let Some(v) = value {
                if !v.trim().is_empty() {
                    return Some(v);
                }
            }
        }
        sqlx::query_scalar("SELECT value FROM system_preferences WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.db)
            .await
            .unwrap_or(None)
            .filter(|v: &String| !v.trim().is_empty())
    }
}

#[async_trait]
impl ContextualPreferenceResolver for PgContextualPreferenceResolver {
    async fn search_list(&self, keys: &[&str], resources: &[ContextualResource]) -> String {
        let mut parts = Vec::new();
        for key in keys {
            if let Some(v) = self.resolve_one(key, resources).await {
                parts.push(v);
            }
        }
        parts.join(",")
    }
}

#[derive(Default)]
pub struct InMemoryContextualPreferenceResolver {
    system: RwLock<HashMap<String, String>>,
    contextual: RwLock<HashMap<(String, ContextualLevel, String), String>>,
}

impl InMemoryContextualPreferenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_system(&self, key: &str, value: &str) {
        self.system
            .write()
            .await
            .insert(key.to_string(), value.to_string());
    }

    pub async fn set_contextual(&self, key: &str, level: ContextualLevel, resource_id: &str, value: &str) {
        self.contextual.write().await.insert(
            (key.to_string(), level, resource_id.to_string()),
            value.to_string(),
        );
    }

    async fn resolve_one(&self, key: &str, resources: &[ContextualResource]) -> Option<String> {
        let contextual = self.contextual.read().await;
        for resource in resources {
            let lookup = (key.to_string(), resource.level, resource.resource_id.clone());
            if let Some(v) = contextual.get(&lookup) {
                if !v.trim().is_empty() {
                    return Some(v.clone());
                }
            }
        }
        self.system
            .read()
            .await
            .get(key)
            .filter(|v| !v.trim().is_empty())
            .cloned()
    }
}

#[async_trait]
impl ContextualPreferenceResolver for InMemoryContextualPreferenceResolver {
    async fn search_list(&self, keys: &[&str], resources: &[ContextualResource]) -> String {
        let mut parts = Vec::new();
        for key in keys {
            if let Some(v) = self.resolve_one(key, resources).await {
                parts.push(v);
            }
        }
        parts.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn typed_getters_parse_or_read_none() {
        let prefs = InMemoryPreferenceStore::new();
        prefs.set(keys::OFFER_FILTER_CPU_MIN, "4").await;
        prefs.set(keys::OFFER_FILTER_UNIQUE, "true").await;
        prefs.set(keys::OFFER_FILTER_MEM_MIN, "not-a-number").await;

        assert_eq!(prefs.get_int(keys::OFFER_FILTER_CPU_MIN).await, Some(4));
        assert_eq!(prefs.get_bool(keys::OFFER_FILTER_UNIQUE).await, Some(true));
        assert_eq!(prefs.get_double(keys::OFFER_FILTER_MEM_MIN).await, None);
        assert_eq!(prefs.get_string("missing").await, None);
    }

    #[tokio::test]
    async fn contextual_values_win_over_system_and_concatenate_across_keys() {
        let resolver = InMemoryContextualPreferenceResolver::new();
        resolver
            .set_system(keys::ALLOWED_INSTANCE_TYPES, "m5.*")
            .await;
        resolver
            .set_contextual(keys::ALLOWED_INSTANCE_TYPES_DOCKER, ContextualLevel::Tool, "42", "c5.*")
            .await;

        let merged = resolver
            .search_list(
                &[keys::ALLOWED_INSTANCE_TYPES_DOCKER, keys::ALLOWED_INSTANCE_TYPES],
                &[ContextualResource::tool("42")],
            )
            .await;
        assert_eq!(merged, "c5.*,m5.*");

        // Without the tool resource only the system-wide list resolves.
        let merged = resolver
            .search_list(
                &[keys::ALLOWED_INSTANCE_TYPES_DOCKER, keys::ALLOWED_INSTANCE_TYPES],
                &[],
            )
            .await;
        assert_eq!(merged, "m5.*");
    }
}
