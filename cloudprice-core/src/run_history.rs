use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use cloudprice_common::{LaunchConfig, RunRecord};

/// Read access to past pipeline runs, used for historical price statistics
/// and for backfilling estimation requests from the last launch.
#[async_trait]
pub trait RunHistoryStore: Send + Sync {
    /// Finished runs of one pipeline version, any instance type.
    async fn load_finished_runs(&self, pipeline_id: Uuid, version: &str) -> Result<Vec<RunRecord>>;

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunRecord>>;

    /// Launch parameters of the most recent run of a pipeline version.
    async fn last_launch_config(
        &self,
        pipeline_id: Uuid,
        version: &str,
    ) -> Result<Option<LaunchConfig>>;
}

pub struct PgRunHistoryStore {
    db: Pool<Postgres>,
}

impl PgRunHistoryStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RunHistoryStore for PgRunHistoryStore {
    async fn load_finished_runs(&self, pipeline_id: Uuid, version: &str) -> Result<Vec<RunRecord>> {
        let runs = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT id, pipeline_id, version, instance_type, instance_disk, spot,
                   billable_duration_ms, finished
            FROM pipeline_runs
            WHERE pipeline_id = $1 AND version = $2 AND finished = true
            ORDER BY started_at
            "#,
        )
        .bind(pipeline_id)
        .bind(version)
        .fetch_all(&self.db)
        .await
        .context("Failed to load finished runs")?;
        Ok(runs)
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let run = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT id, pipeline_id, version, instance_type, instance_disk, spot,
                   billable_duration_ms, finished
            FROM pipeline_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(run)
    }

    async fn last_launch_config(
        &self,
        pipeline_id: Uuid,
        version: &str,
    ) -> Result<Option<LaunchConfig>> {
        let config = sqlx::query_as::<_, (Option<String>, Option<i32>, Option<bool>)>(
            r#"
            SELECT instance_type, instance_disk, spot
            FROM pipeline_runs
            WHERE pipeline_id = $1 AND version = $2
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(pipeline_id)
        .bind(version)
        .fetch_optional(&self.db)
        .await?;
        Ok(config.map(|(instance_type, instance_disk, spot)| LaunchConfig {
            instance_type,
            instance_disk,
            spot,
        }))
    }
}

/// In-memory run history for tests. Runs are kept in insertion order, so
/// "most recent" is the last pushed record.
#[derive(Default)]
pub struct InMemoryRunHistoryStore {
    runs: RwLock<Vec<RunRecord>>,
    launch_configs: RwLock<HashMap<(Uuid, String), LaunchConfig>>,
}

impl InMemoryRunHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_run(&self, run: RunRecord) {
        self.runs.write().await.push(run);
    }

    pub async fn set_launch_config(&self, pipeline_id: Uuid, version: &str, config: LaunchConfig) {
        self.launch_configs
            .write()
            .await
            .insert((pipeline_id, version.to_string()), config);
    }
}

#[async_trait]
impl RunHistoryStore for InMemoryRunHistoryStore {
    async fn load_finished_runs(&self, pipeline_id: Uuid, version: &str) -> Result<Vec<RunRecord>> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .filter(|r| r.pipeline_id == pipeline_id && r.version == version && r.finished)
            .cloned()
            .collect())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .find(|r| r.id == run_id)
            .cloned())
    }

    async fn last_launch_config(
        &self,
        pipeline_id: Uuid,
        version: &str,
    ) -> Result<Option<LaunchConfig>> {
        if let Some(config) = self
            .launch_configs
            .read()
            .await
            .get(&(pipeline_id, version.to_string()))
        {
            return Ok(Some(config.clone()));
        }
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.pipeline_id == pipeline_id && r.version == version)
            .map(|r| LaunchConfig {
                instance_type: r.instance_type.clone(),
                instance_disk: r.instance_disk,
                spot: r.spot,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(pipeline_id: Uuid, version: &str, finished: bool, duration_ms: i64) -> RunRecord {
        RunRecord {
            id: Uuid::new_v4(),
            pipeline_id,
            version: version.to_string(),
            instance_type: Some("m5.large".to_string()),
            instance_disk: Some(50),
            spot: Some(false),
            billable_duration_ms: duration_ms,
            finished,
        }
    }

    #[tokio::test]
    async fn finished_runs_exclude_active_ones() {
        let store = InMemoryRunHistoryStore::new();
        let pipeline_id = Uuid::new_v4();
        store.push_run(run(pipeline_id, "v1", true, 3_600_000)).await;
        store.push_run(run(pipeline_id, "v1", false, 0)).await;
        store.push_run(run(pipeline_id, "v2", true, 3_600_000)).await;

        let runs = store.load_finished_runs(pipeline_id, "v1").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].finished);
    }

    #[tokio::test]
    async fn last_launch_config_prefers_explicit_config() {
        let store = InMemoryRunHistoryStore::new();
        let pipeline_id = Uuid::new_v4();
        store.push_run(run(pipeline_id, "v1", true, 1)).await;
        store
            .set_launch_config(
                pipeline_id,
                "v1",
                LaunchConfig {
                    instance_type: Some("c5.large".to_string()),
                    instance_disk: Some(100),
                    spot: Some(true),
                },
            )
            .await;

        let config = store.last_launch_config(pipeline_id, "v1").await.unwrap().unwrap();
        assert_eq!(config.instance_type.as_deref(), Some("c5.large"));
        assert_eq!(config.instance_disk, Some(100));
        assert_eq!(config.spot, Some(true));
    }

    #[tokio::test]
    async fn last_launch_config_falls_back_to_latest_run() {
        let store = InMemoryRunHistoryStore::new();
        let pipeline_id = Uuid::new_v4();
        let mut first = run(pipeline_id, "v1", true, 1);
        first.instance_type = Some("m5.large".to_string());
        let mut second = run(pipeline_id, "v1", true, 1);
        second.instance_type = Some("m5.2xlarge".to_string());
        store.push_run(first).await;
        store.push_run(second).await;

        let config = store.last_launch_config(pipeline_id, "v1").await.unwrap().unwrap();
        assert_eq!(config.instance_type.as_deref(), Some("m5.2xlarge"));
    }
}
