use crate::CloudPriceProvider;
use anyhow::Result;
use async_trait::async_trait;

use cloudprice_common::{
    CloudProviderKind, InstanceOffer, ProductFamily, Region, TermType, GB_MONTH_UNIT,
    GENERAL_PURPOSE_VOLUME_TYPE, HOURS_UNIT, LINUX_OPERATING_SYSTEM, SHARED_TENANCY,
};

/// Fraction of the on-demand price the mock charges for spot capacity.
const SPOT_DISCOUNT: f64 = 0.3;

const STORAGE_PRICE_PER_GB_MONTH: f64 = 0.10;

/// Static SKU table: (name, vcpu, memory_gb, gpu_count, on_demand_price).
const CATALOG: &[(&str, i32, f64, i32, f64)] = &[
    ("m5.large", 2, 8.0, 0, 0.096),
    ("m5.xlarge", 4, 16.0, 0, 0.192),
    ("m5.2xlarge", 8, 32.0, 0, 0.384),
    ("c5.large", 2, 4.0, 0, 0.085),
    ("p3.2xlarge", 8, 61.0, 1, 3.06),
    // Below the default cpu/mem filter thresholds on purpose.
    ("t3.micro", 2, 1.0, 0, 0.0104),
];

/// Deterministic in-memory price list for tests and local runs.
/// No network, no credentials; every region gets the same catalog.
pub struct MockPriceProvider;

impl MockPriceProvider {
    pub fn new() -> Self {
        Self
    }

    fn compute_offer(region: &Region, name: &str, vcpu: i32, memory_gb: f64, gpu_count: i32,
                     term_type: &str, price: f64) -> InstanceOffer {
        InstanceOffer {
            instance_type: name.to_string(),
            region_id: region.id,
            cloud_provider: CloudProviderKind::Mock,
            term_type: term_type.to_string(),
            price_per_unit: price,
            unit: HOURS_UNIT.to_string(),
            product_family: ProductFamily::Instance,
            operating_system: LINUX_OPERATING_SYSTEM.to_string(),
            tenancy: SHARED_TENANCY.to_string(),
            volume_type: None,
            vcpu,
            memory_gb,
            gpu_count,
        }
    }
}

impl Default for MockPriceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudPriceProvider for MockPriceProvider {
    fn provider(&self) -> CloudProviderKind {
        CloudProviderKind::Mock
    }

    async fn refresh_price_list(&self, region: &Region) -> Result<Vec<InstanceOffer>> {
        let mut offers = Vec::with_capacity(CATALOG.len() * 2 + 1);
        for (name, vcpu, memory_gb, gpu_count, price) in CATALOG.iter().copied() {
            offers.push(Self::compute_offer(
                region, name, vcpu, memory_gb, gpu_count,
                TermType::OnDemand.as_str(), price,
            ));
            offers.push(Self::compute_offer(
                region, name, vcpu, memory_gb, gpu_count,
                self.spot_term_name(), price * SPOT_DISCOUNT,
            ));
        }
        offers.push(InstanceOffer {
            instance_type: String::new(),
            region_id: region.id,
            cloud_provider: CloudProviderKind::Mock,
            term_type: TermType::OnDemand.as_str().to_string(),
            price_per_unit: STORAGE_PRICE_PER_GB_MONTH,
            unit: GB_MONTH_UNIT.to_string(),
            product_family: ProductFamily::Storage,
            operating_system: LINUX_OPERATING_SYSTEM.to_string(),
            tenancy: SHARED_TENANCY.to_string(),
            volume_type: Some(GENERAL_PURPOSE_VOLUME_TYPE.to_string()),
            vcpu: 0,
            memory_gb: 0.0,
            gpu_count: 0,
        });
        Ok(offers)
    }

    async fn get_spot_price(&self, _region: &Region, instance_type: &str) -> Result<f64> {
        CATALOG
            .iter()
            .find(|(name, ..)| *name == instance_type)
            .map(|(_, _, _, _, price)| price * SPOT_DISCOUNT)
            .ok_or_else(|| anyhow::anyhow!("MockPriceProvider: unknown instance type '{}'", instance_type))
    }
}
