use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cloudprice_common::{
    wildcard, AllowedInstanceAndPriceTypes, CloudPriceError, ContextualResource, InstanceOffer,
    InstancePrice, InstanceType, PriceType, ProductFamily, Region, RunPrice, TermType,
    GENERAL_PURPOSE_VOLUME_TYPE, HOURS_UNIT, LINUX_OPERATING_SYSTEM, MILLIS_IN_HOUR,
    SHARED_TENANCY,
};
use cloudprice_providers::{CloudPriceProvider, ProviderRegistry};

use crate::filters::{apply_filter_chain, build_filter_chain, FilterDefaults};
use crate::preference::{keys, ContextualPreferenceResolver, PreferenceStore};
use crate::run_history::RunHistoryStore;
use crate::store::{OfferRequest, OfferStore, RegionStore};

/// Central entry point for price list refresh, instance/price type
/// allowance and run cost estimation.
///
/// All collaborators are trait objects so the same manager runs against
/// Postgres in the service binary and against in-memory stores in tests.
pub struct InstanceOfferManager {
    offers: Arc<dyn OfferStore>,
    regions: Arc<dyn RegionStore>,
    prefs: Arc<dyn PreferenceStore>,
    contextual: Arc<dyn ContextualPreferenceResolver>,
    runs: Arc<dyn RunHistoryStore>,
    providers: Arc<ProviderRegistry>,
    filter_defaults: FilterDefaults,
}

impl InstanceOfferManager {
    pub fn new(
        offers: Arc<dyn OfferStore>,
        regions: Arc<dyn RegionStore>,
        prefs: Arc<dyn PreferenceStore>,
        contextual: Arc<dyn ContextualPreferenceResolver>,
        runs: Arc<dyn RunHistoryStore>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            offers,
            regions,
            prefs,
            contextual,
            runs,
            providers,
            filter_defaults: FilterDefaults::default(),
        }
    }

    // --- Price list refresh ---

    /// Refreshes the price list for every registered region. A failing
    /// region is logged and skipped; the remaining regions still refresh.
    /// Returns the total number of offers persisted in this pass.
    pub async fn refresh_price_list(&self) -> Result<usize> {
        let regions = self.regions.load_all().await?;
        info!("Refreshing price list for {} regions", regions.len());
        let mut total = 0;
        for region in &regions {
            match self.refresh_region(region).await {
                Ok(count) => total += count,
                Err(err) => {
                    error!(
                        "Price list refresh failed for region {} ({}): {:#}",
                        region.code, region.id, err
                    );
                }
            }
        }
        if let Some(date) = self.offers.price_list_publish_date().await? {
            info!("Price list updated, publish date {}", date);
        }
        Ok(total)
    }

    /// On-demand refresh of one region.
    pub async fn refresh_price_list_for_region(
        &self,
        region_id: Uuid,
    ) -> Result<usize, CloudPriceError> {
        let region = self
            .regions
            .load(region_id)
            .await?
            .ok_or(CloudPriceError::UnknownRegion { region_id })?;
        Ok(self.refresh_region(&region).await?)
    }

    async fn refresh_region(&self, region: &Region) -> Result<usize> {
        let provider = self.providers.get(region.provider)?;
        let raw = provider.refresh_price_list(region).await?;
        if raw.is_empty() {
            // An empty response is a provider hiccup more often than an empty
            // catalog; keep the previous snapshot.
            warn!(
                "Price list for region {} came back empty, keeping the previous snapshot",
                region.code
            );
            return Ok(0);
        }

        let chain = build_filter_chain(self.prefs.as_ref(), &self.filter_defaults).await;
        let offers = apply_filter_chain(&chain, raw);
        let batch_size = self
            .prefs
            .get_int(keys::OFFER_INSERT_BATCH_SIZE)
            .await
            .filter(|v| *v > 0)
            .map(|v| v as usize)
            .unwrap_or(self.filter_defaults.insert_batch_size);

        let count = offers.len();
        self.offers
            .replace_offers_for_region(region.id, offers, batch_size)
            .await?;
        info!("Stored {} offers for region {}", count, region.code);
        Ok(count)
    }

    pub async fn price_list_publish_date(&self) -> Result<Option<DateTime<Utc>>> {
        self.offers.price_list_publish_date().await
    }

    // --- Allowance policy ---

    /// An instance type is allowed when it is non-blank, matches the
    /// resolved allow-list pattern and is actually offered in the region
    /// for the requested pricing model.
    pub async fn is_instance_allowed(
        &self,
        instance_type: &str,
        region_id: Option<Uuid>,
        spot: bool,
    ) -> Result<bool, CloudPriceError> {
        let region = self.resolve_region(region_id).await?;
        let resources = region_resources(&region);
        self.check_instance_allowed(
            instance_type,
            &[keys::ALLOWED_INSTANCE_TYPES],
            &resources,
            &region,
            spot,
        )
        .await
    }

    /// Tool-scoped variant: the docker allow-list takes priority and is
    /// additive with the system-wide one.
    pub async fn is_tool_instance_allowed(
        &self,
        instance_type: &str,
        tool: &ContextualResource,
        region_id: Option<Uuid>,
        spot: bool,
    ) -> Result<bool, CloudPriceError> {
        let region = self.resolve_region(region_id).await?;
        let mut resources = vec![tool.clone()];
        resources.extend(region_resources(&region));
        self.check_instance_allowed(
            instance_type,
            &[
                keys::ALLOWED_INSTANCE_TYPES_DOCKER,
                keys::ALLOWED_INSTANCE_TYPES,
            ],
            &resources,
            &region,
            spot,
        )
        .await
    }

    /// True when the tool may run the instance type somewhere, under either
    /// pricing model. Used for validation before a region is picked.
    pub async fn is_tool_instance_allowed_in_any_region(
        &self,
        instance_type: &str,
        tool: &ContextualResource,
    ) -> Result<bool, CloudPriceError> {
        if instance_type.trim().is_empty() {
            return Ok(false);
        }
        let resources = [tool.clone()];
        let pattern_keys = [
            keys::ALLOWED_INSTANCE_TYPES_DOCKER,
            keys::ALLOWED_INSTANCE_TYPES,
        ];
        if !self
            .matches_allowed_pattern(instance_type, &pattern_keys, &resources)
            .await
        {
            return Ok(false);
        }
        Ok(self.offered_in_catalog(instance_type, None, false).await?
            || self.offered_in_catalog(instance_type, None, true).await?)
    }

    /// Price types carry no catalog check; the configured list is matched
    /// directly (globs allowed, blank list permits everything).
    pub async fn is_price_type_allowed(
        &self,
        price_type: &str,
        resources: &[ContextualResource],
        is_master: bool,
    ) -> bool {
        let key = if is_master {
            keys::ALLOWED_MASTER_PRICE_TYPES
        } else {
            keys::ALLOWED_PRICE_TYPES
        };
        let raw = self.contextual.search_list(&[key], resources).await;
        let patterns = wildcard::split_patterns(&raw);
        patterns.is_empty() || wildcard::matches_any(&patterns, price_type)
    }

    pub async fn get_allowed_instance_types(
        &self,
        region_id: Option<Uuid>,
        spot: bool,
    ) -> Result<Vec<InstanceType>, CloudPriceError> {
        let region = self.resolve_region(region_id).await?;
        let resources = region_resources(&region);
        self.load_allowed_instance_types(&region, spot, &[keys::ALLOWED_INSTANCE_TYPES], &resources)
            .await
    }

    pub async fn get_allowed_tool_instance_types(
        &self,
        tool: &ContextualResource,
        region_id: Option<Uuid>,
        spot: bool,
    ) -> Result<Vec<InstanceType>, CloudPriceError> {
        let region = self.resolve_region(region_id).await?;
        let mut resources = vec![tool.clone()];
        resources.extend(region_resources(&region));
        self.load_allowed_instance_types(
            &region,
            spot,
            &[
                keys::ALLOWED_INSTANCE_TYPES_DOCKER,
                keys::ALLOWED_INSTANCE_TYPES,
            ],
            &resources,
        )
        .await
    }

    /// The full allowance bundle a launch form needs in one round trip.
    pub async fn get_allowed_instance_and_price_types(
        &self,
        tool: Option<&ContextualResource>,
        region_id: Option<Uuid>,
        spot: bool,
    ) -> Result<AllowedInstanceAndPriceTypes, CloudPriceError> {
        let region = self.resolve_region(region_id).await?;
        let mut resources = Vec::new();
        if let Some(tool) = tool {
            resources.push(tool.clone());
        }
        resources.extend(region_resources(&region));

        let allowed_instance_types = self
            .get_allowed_instance_types(Some(region.id), spot)
            .await?;
        let allowed_instance_docker_types = match tool {
            Some(tool) => {
                self.get_allowed_tool_instance_types(tool, Some(region.id), spot)
                    .await?
            }
            None => allowed_instance_types.clone(),
        };

        let mut allowed_price_types = Vec::new();
        let mut allowed_master_price_types = Vec::new();
        for price_type in [PriceType::OnDemand, PriceType::Spot] {
            if self
                .is_price_type_allowed(price_type.as_str(), &resources, false)
                .await
            {
                allowed_price_types.push(price_type.as_str().to_string());
            }
            if self
                .is_price_type_allowed(price_type.as_str(), &resources, true)
                .await
            {
                allowed_master_price_types.push(price_type.as_str().to_string());
            }
        }

        Ok(AllowedInstanceAndPriceTypes {
            allowed_instance_types,
            allowed_instance_docker_types,
            allowed_price_types,
            allowed_master_price_types,
        })
    }

    // --- Price estimation ---

    /// Estimated hourly price of an instance type with `instance_disk` GB of
    /// default storage attached. Fails when the type is not allowed.
    pub async fn get_instance_estimated_price(
        &self,
        instance_type: &str,
        instance_disk: i32,
        spot: bool,
        region_id: Option<Uuid>,
    ) -> Result<InstancePrice, CloudPriceError> {
        let region = self.resolve_region(region_id).await?;
        if !self
            .is_instance_allowed(instance_type, Some(region.id), spot)
            .await?
        {
            return Err(CloudPriceError::InstanceTypeNotAllowed {
                instance_type: instance_type.to_string(),
            });
        }

        let provider = self.providers.get(region.provider)?;
        let compute = if spot {
            provider.get_spot_price(&region, instance_type).await?
        } else {
            self.min_on_demand_price(instance_type, region.id).await?
        };

        // Disk pricing is quoted against the default volume class only; cold
        // or archival tiers would understate the real launch cost.
        let storage_offers = self
            .offers
            .load_offers(&OfferRequest {
                region_id: Some(region.id),
                product_family: Some(ProductFamily::Storage),
                volume_type: Some(GENERAL_PURPOSE_VOLUME_TYPE.to_string()),
                ..Default::default()
            })
            .await?;
        let disk_total = provider
            .get_price_for_disk(&region, &storage_offers, instance_disk, instance_type, spot)
            .await?;
        debug!(
            "Estimated {} in {}: compute {:.6}/h, disk {:.6}/h",
            instance_type, region.code, compute, disk_total
        );

        Ok(InstancePrice {
            instance_type: instance_type.to_string(),
            instance_disk,
            price_per_hour: compute + disk_total,
            price_per_hour_compute: compute,
            price_per_hour_disk: if instance_disk > 0 {
                disk_total / instance_disk as f64
            } else {
                0.0
            },
            average_time_price: None,
            minimum_time_price: None,
            maximum_time_price: None,
        })
    }

    /// Pipeline-level estimate: missing launch parameters are backfilled
    /// from the version's last launch configuration, and the finished runs
    /// of the version yield average/min/max historical time prices.
    pub async fn get_instance_estimated_price_for_pipeline(
        &self,
        pipeline_id: Uuid,
        version: &str,
        instance_type: Option<&str>,
        instance_disk: Option<i32>,
        spot: Option<bool>,
        region_id: Option<Uuid>,
    ) -> Result<InstancePrice, CloudPriceError> {
        let mut instance_type = instance_type
            .map(str::to_string)
            .filter(|t| !t.trim().is_empty());
        let mut instance_disk = instance_disk.filter(|d| *d > 0);
        let mut spot = spot;

        if instance_type.is_none() || instance_disk.is_none() || spot.is_none() {
            if let Some(config) = self.runs.last_launch_config(pipeline_id, version).await? {
                instance_type = instance_type.or(config.instance_type);
                instance_disk = instance_disk.or(config.instance_disk.filter(|d| *d > 0));
                spot = spot.or(config.spot);
            }
        }
        let spot = match spot {
            Some(spot) => spot,
            None => self
                .prefs
                .get_bool(keys::CLUSTER_SPOT)
                .await
                .unwrap_or(false),
        };

        let mut price = self
            .get_instance_estimated_price(
                instance_type.as_deref().unwrap_or(""),
                instance_disk.unwrap_or(0),
                spot,
                region_id,
            )
            .await?;

        let durations: Vec<f64> = self
            .runs
            .load_finished_runs(pipeline_id, version)
            .await?
            .iter()
            .map(|r| r.billable_duration_ms)
            // Zero-duration runs are real runs and count toward the average.
            .filter(|ms| *ms >= 0)
            .map(|ms| ms as f64 / MILLIS_IN_HOUR)
            .collect();
        if !durations.is_empty() {
            let totals: Vec<f64> = durations.iter().map(|h| h * price.price_per_hour).collect();
            price.average_time_price =
                Some(totals.iter().sum::<f64>() / totals.len() as f64);
            price.minimum_time_price = totals.iter().copied().reduce(f64::min);
            price.maximum_time_price = totals.iter().copied().reduce(f64::max);
        }
        Ok(price)
    }

    /// Price of one concrete run: hourly rate for its node plus the total
    /// accrued cost once the run has finished.
    pub async fn get_run_estimated_price(
        &self,
        run_id: Uuid,
        region_id: Option<Uuid>,
    ) -> Result<RunPrice, CloudPriceError> {
        let run = self
            .runs
            .load_run(run_id)
            .await?
            .ok_or(CloudPriceError::RunNotFound { run_id })?;

        let spot = match run.spot {
            Some(spot) => spot,
            None => self
                .prefs
                .get_bool(keys::CLUSTER_SPOT)
                .await
                .unwrap_or(false),
        };
        let instance_type = run.instance_type.clone().unwrap_or_default();
        let instance_disk = run.instance_disk.unwrap_or(0);

        let estimate = self
            .get_instance_estimated_price(&instance_type, instance_disk, spot, region_id)
            .await?;
        let total_price = if run.finished && run.billable_duration_ms > 0 {
            run.billable_duration_ms as f64 / MILLIS_IN_HOUR * estimate.price_per_hour
        } else {
            0.0
        };
        Ok(RunPrice {
            instance_type,
            instance_disk,
            price_per_hour: estimate.price_per_hour,
            total_price,
        })
    }

    /// Cheapest positive on-demand compute price for the type, 0 when the
    /// catalog has none.
    pub async fn get_price_per_hour_for_instance(
        &self,
        instance_type: &str,
        region_id: Uuid,
    ) -> Result<f64> {
        self.min_on_demand_price(instance_type, region_id).await
    }

    /// First compute offer for the type in the region, if any.
    pub async fn find_offer(
        &self,
        instance_type: &str,
        region_id: Uuid,
    ) -> Result<Option<InstanceOffer>> {
        let offers = self
            .offers
            .load_offers(&OfferRequest {
                instance_type: Some(instance_type.to_string()),
                region_id: Some(region_id),
                product_family: Some(ProductFamily::Instance),
                ..Default::default()
            })
            .await?;
        Ok(offers.into_iter().next())
    }

    /// Spot bid price per the configured allocation strategy. `manual`
    /// reads the configured bid, `on_demand` bids the current on-demand
    /// price. Misconfiguration degrades with an error log instead of
    /// failing the launch.
    pub async fn resolve_bid_price(
        &self,
        instance_type: &str,
        region_id: Uuid,
    ) -> Result<Option<f64>> {
        let strategy = self
            .prefs
            .get_string(keys::SPOT_ALLOC_STRATEGY)
            .await
            .unwrap_or_else(|| "on_demand".to_string());
        match strategy.trim() {
            "manual" => {
                let bid = self.prefs.get_double(keys::SPOT_BID_PRICE).await;
                if bid.is_none() {
                    error!("Spot allocation strategy is 'manual' but no bid price is configured");
                }
                Ok(bid)
            }
            "on_demand" => {
                let price = self
                    .get_price_per_hour_for_instance(instance_type, region_id)
                    .await?;
                Ok(Some(price))
            }
            other => {
                error!("Unsupported spot allocation strategy '{}'", other);
                Ok(self.prefs.get_double(keys::SPOT_BID_PRICE).await)
            }
        }
    }

    // --- Internals ---

    async fn resolve_region(&self, region_id: Option<Uuid>) -> Result<Region, CloudPriceError> {
        match region_id {
            Some(region_id) => self
                .regions
                .load(region_id)
                .await?
                .ok_or(CloudPriceError::UnknownRegion { region_id }),
            None => self
                .regions
                .default_region()
                .await?
                .ok_or(CloudPriceError::NoDefaultRegion),
        }
    }

    async fn check_instance_allowed(
        &self,
        instance_type: &str,
        pattern_keys: &[&str],
        resources: &[ContextualResource],
        region: &Region,
        spot: bool,
    ) -> Result<bool, CloudPriceError> {
        if instance_type.trim().is_empty() {
            return Ok(false);
        }
        if !self
            .matches_allowed_pattern(instance_type, pattern_keys, resources)
            .await
        {
            return Ok(false);
        }
        Ok(self
            .offered_in_catalog(instance_type, Some(region.id), spot)
            .await?)
    }

    async fn matches_allowed_pattern(
        &self,
        instance_type: &str,
        pattern_keys: &[&str],
        resources: &[ContextualResource],
    ) -> bool {
        let raw = self.contextual.search_list(pattern_keys, resources).await;
        let patterns = wildcard::split_patterns(&raw);
        patterns.is_empty() || wildcard::matches_any(&patterns, instance_type)
    }

    /// Catalog existence check, pricing-model aware. The spot bucket name
    /// depends on the cloud the offer came from.
    async fn offered_in_catalog(
        &self,
        instance_type: &str,
        region_id: Option<Uuid>,
        spot: bool,
    ) -> Result<bool> {
        let offers = self
            .offers
            .load_offers(&OfferRequest {
                instance_type: Some(instance_type.to_string()),
                region_id,
                product_family: Some(ProductFamily::Instance),
                ..Default::default()
            })
            .await?;
        Ok(offers.iter().any(|o| {
            let term = if spot {
                TermType::spot_term_name(o.cloud_provider)
            } else {
                TermType::OnDemand.as_str()
            };
            o.term_type.eq_ignore_ascii_case(term)
        }))
    }

    async fn load_allowed_instance_types(
        &self,
        region: &Region,
        spot: bool,
        pattern_keys: &[&str],
        resources: &[ContextualResource],
    ) -> Result<Vec<InstanceType>, CloudPriceError> {
        let term = if spot {
            TermType::spot_term_name(region.provider)
        } else {
            TermType::OnDemand.as_str()
        };
        let offers = self
            .offers
            .load_offers(&OfferRequest {
                region_id: Some(region.id),
                term_type: Some(term.to_string()),
                product_family: Some(ProductFamily::Instance),
                ..Default::default()
            })
            .await?;

        let raw = self.contextual.search_list(pattern_keys, resources).await;
        let patterns = wildcard::split_patterns(&raw);

        let mut types: Vec<InstanceType> = Vec::new();
        for offer in offers {
            if !patterns.is_empty() && !wildcard::matches_any(&patterns, &offer.instance_type) {
                continue;
            }
            if types.iter().any(|t| t.name == offer.instance_type) {
                continue;
            }
            types.push(InstanceType {
                name: offer.instance_type,
                vcpu: offer.vcpu,
                memory_gb: offer.memory_gb,
                gpu_count: offer.gpu_count,
            });
        }
        types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(types)
    }

    async fn min_on_demand_price(&self, instance_type: &str, region_id: Uuid) -> Result<f64> {
        let offers = self
            .offers
            .load_offers(&OfferRequest {
                instance_type: Some(instance_type.to_string()),
                region_id: Some(region_id),
                term_type: Some(TermType::OnDemand.as_str().to_string()),
                product_family: Some(ProductFamily::Instance),
                operating_system: Some(LINUX_OPERATING_SYSTEM.to_string()),
                tenancy: Some(SHARED_TENANCY.to_string()),
                unit: Some(HOURS_UNIT.to_string()),
                ..Default::default()
            })
            .await?;
        let min = offers
            .iter()
            .map(|o| o.price_per_unit)
            .filter(|p| *p > 0.0)
            .fold(f64::INFINITY, f64::min);
        Ok(if min.is_finite() { min } else { 0.0 })
    }
}

fn region_resources(region: &Region) -> Vec<ContextualResource> {
    vec![ContextualResource::region(region.id.to_string())]
}
