use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use cloudprice_common::{
    CloudProviderKind, InstanceOffer, InstanceType, ProductFamily, Region, TermType, HOURS_IN_MONTH,
};

#[async_trait]
pub trait CloudPriceProvider: Send + Sync {
    fn provider(&self) -> CloudProviderKind;

    /// Name of this provider's variable-price bucket in its price list.
    fn spot_term_name(&self) -> &'static str {
        TermType::spot_term_name(self.provider())
    }

    /// Retrieve the full raw price list for a region. Offers are unfiltered;
    /// the caller runs its own filter chain before persisting.
    async fn refresh_price_list(&self, region: &Region) -> Result<Vec<InstanceOffer>>;

    /// Current variable price for one instance type, in USD per hour.
    async fn get_spot_price(&self, region: &Region, instance_type: &str) -> Result<f64>;

    /// Hourly price for `disk_gb` of default storage, given the persisted
    /// storage offers for the region. Default: cheapest positive GB-month
    /// rate, prorated to an hour.
    async fn get_price_for_disk(
        &self,
        _region: &Region,
        storage_offers: &[InstanceOffer],
        disk_gb: i32,
        _instance_type: &str,
        _spot: bool,
    ) -> Result<f64> {
        let per_gb_month = storage_offers
            .iter()
            .filter(|o| o.product_family == ProductFamily::Storage)
            .map(|o| o.price_per_unit)
            .filter(|p| *p > 0.0)
            .fold(f64::INFINITY, f64::min);
        if !per_gb_month.is_finite() {
            return Ok(0.0);
        }
        Ok(per_gb_month * disk_gb as f64 / HOURS_IN_MONTH)
    }

    /// Distinct compute SKUs the provider sells in a region for the given
    /// pricing model. Default: derived from the raw price list.
    async fn get_all_instance_types(&self, region: &Region, spot: bool) -> Result<Vec<InstanceType>> {
        let term = if spot {
            self.spot_term_name().to_string()
        } else {
            TermType::OnDemand.as_str().to_string()
        };
        let offers = self.refresh_price_list(region).await?;
        let mut seen: HashMap<String, InstanceType> = HashMap::new();
        for offer in offers {
            if offer.product_family != ProductFamily::Instance {
                continue;
            }
            if !offer.term_type.eq_ignore_ascii_case(&term) {
                continue;
            }
            seen.entry(offer.instance_type.clone()).or_insert(InstanceType {
                name: offer.instance_type,
                vcpu: offer.vcpu,
                memory_gb: offer.memory_gb,
                gpu_count: offer.gpu_count,
            });
        }
        let mut types: Vec<InstanceType> = seen.into_values().collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(types)
    }
}

/// Lookup of price providers by cloud, for multi-cloud deployments where
/// each region belongs to exactly one provider.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<CloudProviderKind, Arc<dyn CloudPriceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider: Arc<dyn CloudPriceProvider>) -> Self {
        self.providers.insert(provider.provider(), provider);
        self
    }

    pub fn get(&self, kind: CloudProviderKind) -> Result<Arc<dyn CloudPriceProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No price provider registered for '{}'", kind.as_str()))
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "aws")]
pub mod aws;
