use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod wildcard;

// --- Pricing constants shared across crates ---

pub const HOURS_UNIT: &str = "Hours";
pub const GB_MONTH_UNIT: &str = "GB-Mo";
pub const LINUX_OPERATING_SYSTEM: &str = "Linux";
pub const SHARED_TENANCY: &str = "Shared";
pub const GENERAL_PURPOSE_VOLUME_TYPE: &str = "General Purpose";

/// Hours used to convert GB-month storage pricing into an hourly rate (30 * 24).
pub const HOURS_IN_MONTH: f64 = 720.0;

pub const MILLIS_IN_HOUR: f64 = 3_600_000.0;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "cloud_provider", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CloudProviderKind {
    Aws,
    Gcp,
    Azure,
    Mock,
}

impl CloudProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProviderKind::Aws => "aws",
            CloudProviderKind::Gcp => "gcp",
            CloudProviderKind::Azure => "azure",
            CloudProviderKind::Mock => "mock",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "aws" => Some(CloudProviderKind::Aws),
            "gcp" => Some(CloudProviderKind::Gcp),
            "azure" => Some(CloudProviderKind::Azure),
            "mock" => Some(CloudProviderKind::Mock),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "product_family", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProductFamily {
    Instance,
    Storage,
}

/// Pricing model buckets as they appear in provider price lists.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermType {
    OnDemand,
    Spot,
    Preemptible,
}

impl TermType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TermType::OnDemand => "OnDemand",
            TermType::Spot => "Spot",
            TermType::Preemptible => "Preemptible",
        }
    }

    pub fn all_names() -> Vec<String> {
        [TermType::OnDemand, TermType::Spot, TermType::Preemptible]
            .iter()
            .map(|t| t.as_str().to_string())
            .collect()
    }

    /// Providers name their variable-price bucket differently.
    pub fn spot_term_name(provider: CloudProviderKind) -> &'static str {
        match provider {
            CloudProviderKind::Gcp => TermType::Preemptible.as_str(),
            _ => TermType::Spot.as_str(),
        }
    }
}

/// User-facing pricing model, mapped to provider term types on demand.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriceType {
    OnDemand,
    Spot,
}

impl PriceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceType::OnDemand => "on_demand",
            PriceType::Spot => "spot",
        }
    }
}

// --- Entities ---

/// One price quote for a compute or storage SKU, as persisted per region.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct InstanceOffer {
    pub instance_type: String,
    pub region_id: Uuid,
    pub cloud_provider: CloudProviderKind,
    pub term_type: String,
    pub price_per_unit: f64,
    pub unit: String,
    pub product_family: ProductFamily,
    pub operating_system: String,
    pub tenancy: String,
    pub volume_type: Option<String>,
    pub vcpu: i32,
    pub memory_gb: f64,
    pub gpu_count: i32,
}

impl InstanceOffer {
    /// Identity used by the uniqueness filter and catalog dedup.
    pub fn dedup_key(&self) -> (String, Uuid, String, ProductFamily, String, String, Option<String>) {
        (
            self.instance_type.clone(),
            self.region_id,
            self.term_type.clone(),
            self.product_family,
            self.operating_system.clone(),
            self.tenancy.clone(),
            self.volume_type.clone(),
        )
    }
}

/// A distinct compute SKU, deduplicated from offers on read. Never persisted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstanceType {
    pub name: String,
    pub vcpu: i32,
    pub memory_gb: f64,
    pub gpu_count: i32,
}

/// Estimated cost of running an instance type with the given disk.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct InstancePrice {
    pub instance_type: String,
    pub instance_disk: i32,
    pub price_per_hour: f64,
    pub price_per_hour_compute: f64,
    /// Per-GB-hour disk figure; the total disk price is folded into `price_per_hour`.
    pub price_per_hour_disk: f64,
    pub average_time_price: Option<f64>,
    pub minimum_time_price: Option<f64>,
    pub maximum_time_price: Option<f64>,
}

/// Estimated cost of a single run.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RunPrice {
    pub instance_type: String,
    pub instance_disk: i32,
    pub price_per_hour: f64,
    /// Zero while the run is still active.
    pub total_price: f64,
}

/// Allowed instance and price types resolved for a request. Computed, never persisted.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AllowedInstanceAndPriceTypes {
    pub allowed_instance_types: Vec<InstanceType>,
    pub allowed_instance_docker_types: Vec<InstanceType>,
    pub allowed_price_types: Vec<String>,
    pub allowed_master_price_types: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Region {
    pub id: Uuid,
    pub provider: CloudProviderKind,
    pub code: String,
    pub is_default: bool,
}

/// A pipeline run as seen by the pricing core: launch snapshot + billable time.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct RunRecord {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub version: String,
    pub instance_type: Option<String>,
    pub instance_disk: Option<i32>,
    pub spot: Option<bool>,
    pub billable_duration_ms: i64,
    pub finished: bool,
}

/// Launch parameters recorded for a pipeline version, used to backfill
/// estimation requests that leave type/disk/spot unset.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LaunchConfig {
    pub instance_type: Option<String>,
    pub instance_disk: Option<i32>,
    pub spot: Option<bool>,
}

// --- Contextual preference scoping ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "contextual_level", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContextualLevel {
    Tool,
    Region,
}

/// A resource a preference value may be scoped to (tool, region, ...).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ContextualResource {
    pub level: ContextualLevel,
    pub resource_id: String,
}

impl ContextualResource {
    pub fn tool(id: impl Into<String>) -> Self {
        Self {
            level: ContextualLevel::Tool,
            resource_id: id.into(),
        }
    }

    pub fn region(id: impl Into<String>) -> Self {
        Self {
            level: ContextualLevel::Region,
            resource_id: id.into(),
        }
    }
}

// --- Errors ---

#[derive(Debug, thiserror::Error)]
pub enum CloudPriceError {
    #[error("Instance type '{instance_type}' is not allowed")]
    InstanceTypeNotAllowed { instance_type: String },
    #[error("Region {region_id} is not registered")]
    UnknownRegion { region_id: Uuid },
    #[error("No default region is configured")]
    NoDefaultRegion,
    #[error("Run {run_id} was not found")]
    RunNotFound { run_id: Uuid },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
