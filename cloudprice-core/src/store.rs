use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, QueryBuilder};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use cloudprice_common::{InstanceOffer, ProductFamily, Region};

/// Filter criteria for loading persisted offers. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct OfferRequest {
    pub instance_type: Option<String>,
    pub region_id: Option<Uuid>,
    pub term_type: Option<String>,
    pub product_family: Option<ProductFamily>,
    pub operating_system: Option<String>,
    pub tenancy: Option<String>,
    pub unit: Option<String>,
    pub volume_type: Option<String>,
}

impl OfferRequest {
    pub fn matches(&self, offer: &InstanceOffer) -> bool {
        fn field(expected: &Option<String>, actual: &str) -> bool {
            expected
                .as_deref()
                .map(|e| e.eq_ignore_ascii_case(actual))
                .unwrap_or(true)
        }
        field(&self.instance_type, &offer.instance_type)
            && self.region_id.map(|r| r == offer.region_id).unwrap_or(true)
            && field(&self.term_type, &offer.term_type)
            && self
                .product_family
                .map(|f| f == offer.product_family)
                .unwrap_or(true)
            && field(&self.operating_system, &offer.operating_system)
            && field(&self.tenancy, &offer.tenancy)
            && field(&self.unit, &offer.unit)
            && field(&self.volume_type, offer.volume_type.as_deref().unwrap_or(""))
    }
}

/// Persisted offer snapshots, replaced wholesale per region on refresh.
/// `replace_offers_for_region` must be atomic from a reader's point of view:
/// a concurrent `load_offers` sees either the old or the new full set.
#[async_trait]
pub trait OfferStore: Send + Sync {
    async fn load_offers(&self, request: &OfferRequest) -> Result<Vec<InstanceOffer>>;

    async fn replace_offers_for_region(
        &self,
        region_id: Uuid,
        offers: Vec<InstanceOffer>,
        batch_size: usize,
    ) -> Result<()>;

    async fn price_list_publish_date(&self) -> Result<Option<DateTime<Utc>>>;
}

pub struct PgOfferStore {
    db: Pool<Postgres>,
}

impl PgOfferStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OfferStore for PgOfferStore {
    async fn load_offers(&self, request: &OfferRequest) -> Result<Vec<InstanceOffer>> {
        let offers = sqlx::query_as::<_, InstanceOffer>(
            r#"
            SELECT instance_type, region_id, cloud_provider, term_type, price_per_unit,
                   unit, product_family, operating_system, tenancy, volume_type,
                   vcpu, memory_gb, gpu_count
            FROM instance_offers
            WHERE ($1::text IS NULL OR lower(instance_type) = lower($1))
              AND ($2::uuid IS NULL OR region_id = $2)
              AND ($3::text IS NULL OR lower(term_type) = lower($3))
              AND ($4::product_family IS NULL OR product_family = $4)
              AND ($5::text IS NULL OR lower(operating_system) = lower($5))
              AND ($6::text IS NULL OR lower(tenancy) = lower($6))
              AND ($7::text IS NULL OR lower(unit) = lower($7))
              AND ($8::text IS NULL OR lower(COALESCE(volume_type, '')) = lower($8))
            "#,
        )
        .bind(request.instance_type.as_deref())
        .bind(request.region_id)
        .bind(request.term_type.as_deref())
        .bind(request.product_family)
        .bind(request.operating_system.as_deref())
        .bind(request.tenancy.as_deref())
        .bind(request.unit.as_deref())
        .bind(request.volume_type.as_deref())
        .fetch_all(&self.db)
        .await
        .context("Failed to load instance offers")?;
        Ok(offers)
    }

    async fn replace_offers_for_region(
        &self,
        region_id: Uuid,
        offers: Vec<InstanceOffer>,
        batch_size: usize,
    ) -> Result<()> {
        // Delete + chunked inserts inside one transaction; readers observe the
        // swap only at commit.
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM instance_offers WHERE region_id = $1")
            .bind(region_id)
            .execute(&mut *tx)
            .await?;

        let batch_size = batch_size.max(1);
        for chunk in offers.chunks(batch_size) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO instance_offers (instance_type, region_id, cloud_provider, \
                 term_type, price_per_unit, unit, product_family, operating_system, \
                 tenancy, volume_type, vcpu, memory_gb, gpu_count, updated_at) ",
            );
            builder.push_values(chunk, |mut b, offer| {
                b.push_bind(&offer.instance_type)
                    .push_bind(offer.region_id)
                    .push_bind(offer.cloud_provider)
                    .push_bind(&offer.term_type)
                    .push_bind(offer.price_per_unit)
                    .push_bind(&offer.unit)
                    .push_bind(offer.product_family)
                    .push_bind(&offer.operating_system)
                    .push_bind(&offer.tenancy)
                    .push_bind(offer.volume_type.as_deref())
                    .push_bind(offer.vcpu)
                    .push_bind(offer.memory_gb)
                    .push_bind(offer.gpu_count)
                    .push("NOW()");
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await.context("Failed to commit offer replacement")?;
        Ok(())
    }

    async fn price_list_publish_date(&self) -> Result<Option<DateTime<Utc>>> {
        let date: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(updated_at) FROM instance_offers")
                .fetch_one(&self.db)
                .await?;
        Ok(date)
    }
}

/// In-memory offer store for tests and single-node local runs. The region
/// map swap under the write lock gives the same reader-atomicity as the
/// Postgres transaction.
#[derive(Default)]
pub struct InMemoryOfferStore {
    offers: RwLock<HashMap<Uuid, Vec<InstanceOffer>>>,
    publish_date: RwLock<Option<DateTime<Utc>>>,
}

impl InMemoryOfferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfferStore for InMemoryOfferStore {
    async fn load_offers(&self, request: &OfferRequest) -> Result<Vec<InstanceOffer>> {
        let offers = self.offers.read().await;
        Ok(offers
            .values()
            .flatten()
            .filter(|o| request.matches(o))
            .cloned()
            .collect())
    }

    async fn replace_offers_for_region(
        &self,
        region_id: Uuid,
        offers: Vec<InstanceOffer>,
        _batch_size: usize,
    ) -> Result<()> {
        self.offers.write().await.insert(region_id, offers);
        *self.publish_date.write().await = Some(Utc::now());
        Ok(())
    }

    async fn price_list_publish_date(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.publish_date.read().await)
    }
}

/// Registered cloud regions; exactly one is flagged as the platform default.
#[async_trait]
pub trait RegionStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Region>>;
    async fn load(&self, region_id: Uuid) -> Result<Option<Region>>;
    async fn default_region(&self) -> Result<Option<Region>>;
}

pub struct PgRegionStore {
    db: Pool<Postgres>,
}

impl PgRegionStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RegionStore for PgRegionStore {
    async fn load_all(&self) -> Result<Vec<Region>> {
        let regions = sqlx::query_as::<_, Region>(
            "SELECT id, provider, code, is_default FROM regions ORDER BY code",
        )
        .fetch_all(&self.db)
        .await
        .context("Failed to load regions")?;
        Ok(regions)
    }

    async fn load(&self, region_id: Uuid) -> Result<Option<Region>> {
        let region = sqlx::query_as::<_, Region>(
            "SELECT id, provider, code, is_default FROM regions WHERE id = $1",
        )
        .bind(region_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(region)
    }

    async fn default_region(&self) -> Result<Option<Region>> {
        let region = sqlx::query_as::<_, Region>(
            "SELECT id, provider, code, is_default FROM regions WHERE is_default = true LIMIT 1",
        )
        .fetch_optional(&self.db)
        .await?;
        Ok(region)
    }
}

#[derive(Default)]
pub struct InMemoryRegionStore {
    regions: Vec<Region>,
}

impl InMemoryRegionStore {
    pub fn new(regions: Vec<Region>) -> Self {
        Self { regions }
    }
}

#[async_trait]
impl RegionStore for InMemoryRegionStore {
    async fn load_all(&self) -> Result<Vec<Region>> {
        Ok(self.regions.clone())
    }

    async fn load(&self, region_id: Uuid) -> Result<Option<Region>> {
        Ok(self.regions.iter().find(|r| r.id == region_id).cloned())
    }

    async fn default_region(&self) -> Result<Option<Region>> {
        Ok(self.regions.iter().find(|r| r.is_default).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudprice_common::{CloudProviderKind, TermType, HOURS_UNIT};

    fn offer(region_id: Uuid, instance_type: &str, term_type: &str) -> InstanceOffer {
        InstanceOffer {
            instance_type: instance_type.to_string(),
            region_id,
            cloud_provider: CloudProviderKind::Aws,
            term_type: term_type.to_string(),
            price_per_unit: 0.1,
            unit: HOURS_UNIT.to_string(),
            product_family: ProductFamily::Instance,
            operating_system: "Linux".to_string(),
            tenancy: "Shared".to_string(),
            volume_type: None,
            vcpu: 2,
            memory_gb: 8.0,
            gpu_count: 0,
        }
    }

    #[tokio::test]
    async fn replace_is_per_region() {
        let store = InMemoryOfferStore::new();
        let region_a = Uuid::new_v4();
        let region_b = Uuid::new_v4();
        store
            .replace_offers_for_region(region_a, vec![offer(region_a, "m5.large", "OnDemand")], 100)
            .await
            .unwrap();
        store
            .replace_offers_for_region(region_b, vec![offer(region_b, "c5.large", "OnDemand")], 100)
            .await
            .unwrap();

        // Replacing region A leaves region B untouched.
        store
            .replace_offers_for_region(region_a, vec![offer(region_a, "m5.xlarge", "OnDemand")], 100)
            .await
            .unwrap();

        let request = OfferRequest {
            region_id: Some(region_b),
            ..Default::default()
        };
        let offers = store.load_offers(&request).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].instance_type, "c5.large");

        let request = OfferRequest {
            region_id: Some(region_a),
            ..Default::default()
        };
        let offers = store.load_offers(&request).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].instance_type, "m5.xlarge");
    }

    #[tokio::test]
    async fn request_matching_is_case_insensitive() {
        let region_id = Uuid::new_v4();
        let request = OfferRequest {
            instance_type: Some("M5.LARGE".to_string()),
            term_type: Some(TermType::OnDemand.as_str().to_string()),
            ..Default::default()
        };
        assert!(request.matches(&offer(region_id, "m5.large", "OnDemand")));
        assert!(!request.matches(&offer(region_id, "m5.large", "Spot")));
    }

    #[tokio::test]
    async fn publish_date_tracks_replacements() {
        let store = InMemoryOfferStore::new();
        assert!(store.price_list_publish_date().await.unwrap().is_none());
        let region_id = Uuid::new_v4();
        store
            .replace_offers_for_region(region_id, vec![], 100)
            .await
            .unwrap();
        assert!(store.price_list_publish_date().await.unwrap().is_some());
    }
}
