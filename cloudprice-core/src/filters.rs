use std::collections::HashSet;

use cloudprice_common::{InstanceOffer, ProductFamily, TermType};

use crate::preference::{keys, PreferenceStore};

/// A single transformation over a raw offer list. Implementations are pure:
/// input is never mutated and surviving offers keep their order.
pub trait OfferFilter: Send + Sync {
    fn filter(&self, offers: Vec<InstanceOffer>) -> Vec<InstanceOffer>;
}

/// Keeps offers whose term type is in the allowed set.
pub struct TermTypeFilter {
    allowed: HashSet<String>,
}

impl TermTypeFilter {
    pub fn new(allowed: HashSet<String>) -> Self {
        Self { allowed }
    }
}

impl OfferFilter for TermTypeFilter {
    fn filter(&self, offers: Vec<InstanceOffer>) -> Vec<InstanceOffer> {
        offers
            .into_iter()
            .filter(|o| self.allowed.contains(&o.term_type))
            .collect()
    }
}

/// Keeps exactly one offer per dedup key, first-seen wins.
pub struct UniqueFilter;

impl OfferFilter for UniqueFilter {
    fn filter(&self, offers: Vec<InstanceOffer>) -> Vec<InstanceOffer> {
        let mut seen = HashSet::new();
        offers
            .into_iter()
            .filter(|o| seen.insert(o.dedup_key()))
            .collect()
    }
}

/// Drops compute offers below the cpu/memory thresholds. Storage offers
/// carry no cpu/memory and pass through untouched.
pub struct MinimumRequirementsFilter {
    min_cpu: i32,
    min_mem: f64,
}

impl MinimumRequirementsFilter {
    pub fn new(min_cpu: i32, min_mem: f64) -> Self {
        Self { min_cpu, min_mem }
    }
}

impl OfferFilter for MinimumRequirementsFilter {
    fn filter(&self, offers: Vec<InstanceOffer>) -> Vec<InstanceOffer> {
        offers
            .into_iter()
            .filter(|o| {
                o.product_family != ProductFamily::Instance
                    || (o.vcpu >= self.min_cpu && o.memory_gb >= self.min_mem)
            })
            .collect()
    }
}

/// Hardcoded fallbacks used when a preference is absent or unparseable.
#[derive(Debug, Clone)]
pub struct FilterDefaults {
    pub term_types: Vec<String>,
    pub unique: bool,
    pub cpu_min: i32,
    pub mem_min: f64,
    pub insert_batch_size: usize,
}

impl Default for FilterDefaults {
    fn default() -> Self {
        Self {
            term_types: TermType::all_names(),
            unique: true,
            cpu_min: 2,
            mem_min: 3.0,
            insert_batch_size: 10_000,
        }
    }
}

/// Builds the active filter chain from live preferences. Called once per
/// refresh so preference changes take effect without a restart; nothing is
/// cached across calls. A filter whose activation condition is false is
/// omitted from the chain entirely.
pub async fn build_filter_chain(
    prefs: &dyn PreferenceStore,
    defaults: &FilterDefaults,
) -> Vec<Box<dyn OfferFilter>> {
    let mut chain: Vec<Box<dyn OfferFilter>> = Vec::new();

    let term_types: HashSet<String> = prefs
        .get_string(keys::OFFER_FILTER_TERM_TYPES)
        .await
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| cloudprice_common::wildcard::split_patterns(&raw).into_iter().collect())
        .unwrap_or_else(|| defaults.term_types.iter().cloned().collect());
    if !term_types.is_empty() {
        chain.push(Box::new(TermTypeFilter::new(term_types)));
    }

    let unique = prefs
        .get_bool(keys::OFFER_FILTER_UNIQUE)
        .await
        .unwrap_or(defaults.unique);
    if unique {
        chain.push(Box::new(UniqueFilter));
    }

    let cpu_min = prefs
        .get_int(keys::OFFER_FILTER_CPU_MIN)
        .await
        .map(|v| v as i32)
        .unwrap_or(defaults.cpu_min);
    let mem_min = prefs
        .get_double(keys::OFFER_FILTER_MEM_MIN)
        .await
        .unwrap_or(defaults.mem_min);
    if cpu_min > 0 || mem_min > 0.0 {
        chain.push(Box::new(MinimumRequirementsFilter::new(cpu_min, mem_min)));
    }

    chain
}

/// Left-to-right composition; identity when the chain is empty.
pub fn apply_filter_chain(chain: &[Box<dyn OfferFilter>], offers: Vec<InstanceOffer>) -> Vec<InstanceOffer> {
    chain.iter().fold(offers, |acc, f| f.filter(acc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudprice_common::{CloudProviderKind, HOURS_UNIT, LINUX_OPERATING_SYSTEM, SHARED_TENANCY};
    use uuid::Uuid;

    fn offer(instance_type: &str, term_type: &str, vcpu: i32, memory_gb: f64) -> InstanceOffer {
        InstanceOffer {
            instance_type: instance_type.to_string(),
            region_id: Uuid::nil(),
            cloud_provider: CloudProviderKind::Aws,
            term_type: term_type.to_string(),
            price_per_unit: 1.0,
            unit: HOURS_UNIT.to_string(),
            product_family: ProductFamily::Instance,
            operating_system: LINUX_OPERATING_SYSTEM.to_string(),
            tenancy: SHARED_TENANCY.to_string(),
            volume_type: None,
            vcpu,
            memory_gb,
            gpu_count: 0,
        }
    }

    fn storage_offer() -> InstanceOffer {
        let mut o = offer("", "OnDemand", 0, 0.0);
        o.product_family = ProductFamily::Storage;
        o.volume_type = Some("General Purpose".to_string());
        o
    }

    #[test]
    fn term_type_filter_drops_unknown_terms() {
        let allowed: HashSet<String> = ["OnDemand".to_string()].into_iter().collect();
        let filter = TermTypeFilter::new(allowed);
        let result = filter.filter(vec![offer("m5.xlarge", "Spot", 4, 16.0)]);
        assert!(result.is_empty());

        let result = filter.filter(vec![offer("m5.xlarge", "OnDemand", 4, 16.0)]);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn unique_filter_keeps_first_seen() {
        let mut duplicate = offer("m5.xlarge", "OnDemand", 4, 16.0);
        duplicate.price_per_unit = 2.0;
        let offers = vec![
            offer("m5.xlarge", "OnDemand", 4, 16.0),
            duplicate,
            offer("m5.xlarge", "Spot", 4, 16.0),
        ];
        let result = UniqueFilter.filter(offers);
        assert_eq!(result.len(), 2);
        assert!((result[0].price_per_unit - 1.0).abs() < 1e-9);
    }

    #[test]
    fn minimum_requirements_filter_enforces_both_thresholds() {
        let filter = MinimumRequirementsFilter::new(2, 3.0);
        assert!(filter.filter(vec![offer("t3.micro", "OnDemand", 2, 1.0)]).is_empty());
        assert!(filter.filter(vec![offer("a1.medium", "OnDemand", 1, 4.0)]).is_empty());
        assert_eq!(filter.filter(vec![offer("m5.large", "OnDemand", 2, 8.0)]).len(), 1);
    }

    #[test]
    fn minimum_requirements_filter_ignores_storage() {
        let filter = MinimumRequirementsFilter::new(2, 3.0);
        assert_eq!(filter.filter(vec![storage_offer()]).len(), 1);
    }

    #[tokio::test]
    async fn chain_is_idempotent() {
        let prefs = crate::preference::InMemoryPreferenceStore::new();
        let chain = build_filter_chain(&prefs, &FilterDefaults::default()).await;
        let offers = vec![
            offer("m5.xlarge", "OnDemand", 4, 16.0),
            offer("m5.xlarge", "OnDemand", 4, 16.0),
            offer("t3.micro", "OnDemand", 2, 1.0),
        ];
        let once = apply_filter_chain(&chain, offers.clone());
        let twice = apply_filter_chain(&chain, once.clone());
        assert_eq!(once.len(), 1);
        assert_eq!(once.len(), twice.len());
        assert_eq!(once[0].instance_type, twice[0].instance_type);
    }

    #[tokio::test]
    async fn inactive_filters_are_omitted_from_the_chain() {
        let prefs = crate::preference::InMemoryPreferenceStore::new();
        prefs.set(keys::OFFER_FILTER_UNIQUE, "false").await;
        prefs.set(keys::OFFER_FILTER_CPU_MIN, "0").await;
        prefs.set(keys::OFFER_FILTER_MEM_MIN, "0").await;
        let chain = build_filter_chain(&prefs, &FilterDefaults::default()).await;
        // Only the term-type filter survives.
        assert_eq!(chain.len(), 1);

        let duplicated = vec![
            offer("t3.micro", "OnDemand", 2, 1.0),
            offer("t3.micro", "OnDemand", 2, 1.0),
        ];
        let result = apply_filter_chain(&chain, duplicated);
        assert_eq!(result.len(), 2);
    }
}
