use crate::CloudPriceProvider;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use cloudprice_common::{
    CloudProviderKind, InstanceOffer, ProductFamily, Region, TermType, GB_MONTH_UNIT, HOURS_UNIT,
    LINUX_OPERATING_SYSTEM, SHARED_TENANCY,
};

const DEFAULT_PRICING_ENDPOINT: &str = "https://pricing.us-east-1.amazonaws.com";

/// Spot capacity is priced by a live market the public offer file does not
/// cover. Until the spot history API is wired in we approximate it as a
/// fixed fraction of on-demand, overridable via AWS_SPOT_DISCOUNT.
const DEFAULT_SPOT_DISCOUNT: f64 = 0.3;

/// Price provider backed by the public AWS EC2 offer file
/// (no credentials required).
pub struct AwsPriceProvider {
    client: reqwest::Client,
    endpoint: String,
    spot_discount: f64,
    // Last successfully parsed list per region, reused for spot lookups.
    cache: RwLock<HashMap<Uuid, Vec<InstanceOffer>>>,
}

impl AwsPriceProvider {
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_PRICING_ENDPOINT.to_string())
    }

    /// Endpoint override via AWS_PRICING_ENDPOINT, discount via
    /// AWS_SPOT_DISCOUNT.
    pub fn from_env() -> Self {
        let endpoint = std::env::var("AWS_PRICING_ENDPOINT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PRICING_ENDPOINT.to_string());
        Self::with_endpoint(endpoint)
    }

    pub fn with_endpoint(endpoint: String) -> Self {
        let spot_discount = std::env::var("AWS_SPOT_DISCOUNT")
            .ok()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| *v > 0.0 && *v <= 1.0)
            .unwrap_or(DEFAULT_SPOT_DISCOUNT);
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            spot_discount,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn fetch_offer_file(&self, region: &Region) -> Result<serde_json::Value> {
        let url = format!(
            "{}/offers/v1.0/aws/AmazonEC2/current/{}/index.json",
            self.endpoint, region.code
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "AWS offer file request failed for region {}: status={} body={}",
                region.code,
                status,
                text
            );
        }
        resp.json::<serde_json::Value>()
            .await
            .context("Failed to parse AWS offer file")
    }

    fn parse_offer_file(&self, region: &Region, doc: &serde_json::Value) -> Vec<InstanceOffer> {
        let Some(products) = doc["products"].as_object() else {
            eprintln!("⚠️ AWS offer file for {} has no 'products' object", region.code);
            return vec![];
        };
        let empty = serde_json::Map::new();
        let on_demand_terms = doc["terms"]["OnDemand"].as_object().unwrap_or(&empty);

        let mut offers = Vec::new();
        for (sku, product) in products {
            let attributes = &product["attributes"];
            let family = product["productFamily"].as_str().unwrap_or("");

            let parsed = match family {
                "Compute Instance" => self.parse_compute_product(region, attributes),
                "Storage" => self.parse_storage_product(region, attributes),
                _ => None,
            };
            let Some(mut offer) = parsed else { continue };

            // First on-demand price dimension for the SKU; AWS nests both
            // levels under opaque rate-code keys.
            let Some((price, unit)) = first_price_dimension(on_demand_terms.get(sku)) else {
                continue;
            };
            offer.price_per_unit = price;
            offer.unit = unit;
            offers.push(offer);
        }
        offers
    }

    fn parse_compute_product(&self, region: &Region, attributes: &serde_json::Value) -> Option<InstanceOffer> {
        let instance_type = attributes["instanceType"].as_str()?;
        let operating_system = attributes["operatingSystem"].as_str().unwrap_or("");
        let tenancy = attributes["tenancy"].as_str().unwrap_or("");
        // Linux/Shared only; everything else multiplies the list without
        // being launchable by the platform.
        if operating_system != LINUX_OPERATING_SYSTEM || tenancy != SHARED_TENANCY {
            return None;
        }
        let vcpu = attributes["vcpu"]
            .as_str()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0);
        let memory_gb = parse_memory_gb(attributes["memory"].as_str().unwrap_or(""));
        let gpu_count = attributes["gpu"]
            .as_str()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0);
        Some(InstanceOffer {
            instance_type: instance_type.to_string(),
            region_id: region.id,
            cloud_provider: CloudProviderKind::Aws,
            term_type: TermType::OnDemand.as_str().to_string(),
            price_per_unit: 0.0,
            unit: HOURS_UNIT.to_string(),
            product_family: ProductFamily::Instance,
            operating_system: operating_system.to_string(),
            tenancy: tenancy.to_string(),
            volume_type: None,
            vcpu,
            memory_gb,
            gpu_count,
        })
    }

    fn parse_storage_product(&self, region: &Region, attributes: &serde_json::Value) -> Option<InstanceOffer> {
        let volume_type = attributes["volumeType"].as_str()?;
        Some(InstanceOffer {
            instance_type: String::new(),
            region_id: region.id,
            cloud_provider: CloudProviderKind::Aws,
            term_type: TermType::OnDemand.as_str().to_string(),
            price_per_unit: 0.0,
            unit: GB_MONTH_UNIT.to_string(),
            product_family: ProductFamily::Storage,
            operating_system: String::new(),
            tenancy: String::new(),
            volume_type: Some(volume_type.to_string()),
            vcpu: 0,
            memory_gb: 0.0,
            gpu_count: 0,
        })
    }
}

impl Default for AwsPriceProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk terms[sku] -> first offer term -> first price dimension.
fn first_price_dimension(term: Option<&serde_json::Value>) -> Option<(f64, String)> {
    let dimensions = term?
        .as_object()?
        .values()
        .next()?
        .get("priceDimensions")?
        .as_object()?
        .values()
        .next()?
        .clone();
    let price = dimensions["pricePerUnit"]["USD"]
        .as_str()
        .and_then(|v| v.parse::<f64>().ok())?;
    let unit = dimensions["unit"].as_str().unwrap_or(HOURS_UNIT);
    // The offer file abbreviates hours as "Hrs".
    let unit = if unit.eq_ignore_ascii_case("hrs") {
        HOURS_UNIT.to_string()
    } else {
        unit.to_string()
    };
    Some((price, unit))
}

/// "16 GiB" -> 16.0. Unparseable values degrade to 0 and get dropped by
/// the minimum-requirements filter downstream.
fn parse_memory_gb(raw: &str) -> f64 {
    raw.split_whitespace()
        .next()
        .map(|v| v.replace(',', ""))
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[async_trait]
impl CloudPriceProvider for AwsPriceProvider {
    fn provider(&self) -> CloudProviderKind {
        CloudProviderKind::Aws
    }

    async fn refresh_price_list(&self, region: &Region) -> Result<Vec<InstanceOffer>> {
        let doc = self.fetch_offer_file(region).await?;
        let offers = self.parse_offer_file(region, &doc);
        if offers.is_empty() {
            eprintln!(
                "⚠️ AWS price list for region {} parsed to zero offers",
                region.code
            );
        } else {
            self.cache.write().await.insert(region.id, offers.clone());
        }
        Ok(offers)
    }

    async fn get_spot_price(&self, region: &Region, instance_type: &str) -> Result<f64> {
        // Serve from the cached list when possible; refresh otherwise.
        let cached = self.cache.read().await.get(&region.id).cloned();
        let offers = match cached {
            Some(offers) => offers,
            None => self.refresh_price_list(region).await?,
        };
        let on_demand = offers
            .iter()
            .filter(|o| {
                o.product_family == ProductFamily::Instance
                    && o.instance_type.eq_ignore_ascii_case(instance_type)
            })
            .map(|o| o.price_per_unit)
            .filter(|p| *p > 0.0)
            .fold(f64::INFINITY, f64::min);
        if !on_demand.is_finite() {
            anyhow::bail!(
                "No on-demand price found for '{}' in region {}",
                instance_type,
                region.code
            );
        }
        Ok(on_demand * self.spot_discount)
    }
}
