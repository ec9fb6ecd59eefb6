//! Toolkit records, manifests, and slug validation.
//!
//! A toolkit is a zip-packaged bundle carrying a `toolkit.json` manifest
//! plus optional backend routes, worker handlers, dashboard context, and
//! frontend assets. The slug is the primary key everywhere: registry
//! rows, storage directories, and the job-type prefix.

pub mod bundle;
pub mod loader;
pub mod plugins;
pub mod registry;

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use bundle::BundleInstaller;
pub use loader::ToolkitLoader;
pub use registry::ToolkitRegistry;

static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_-]+$").expect("slug pattern"));

/// Normalize and validate a slug: trimmed, lowercased, `^[a-z0-9_-]+$`.
pub fn normalize_slug(raw: &str) -> Result<String, String> {
    let slug = raw.trim().to_lowercase();
    if slug.is_empty() {
        return Err("Toolkit slug must not be empty".to_string());
    }
    if !SLUG_RE.is_match(&slug) {
        return Err(
            "Toolkit slug must contain only lowercase letters, numbers, hyphen, or underscore"
                .to_string(),
        );
    }
    Ok(slug)
}

/// Where a toolkit record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolkitOrigin {
    Builtin,
    Bundled,
    Uploaded,
    Community,
    Custom,
}

impl ToolkitOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Bundled => "bundled",
            Self::Uploaded => "uploaded",
            Self::Community => "community",
            Self::Custom => "custom",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "builtin" => Some(Self::Builtin),
            "bundled" => Some(Self::Bundled),
            "uploaded" => Some(Self::Uploaded),
            "community" => Some(Self::Community),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for ToolkitOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Card surfaced on the operator dashboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardCard {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub link_text: Option<String>,
    #[serde(default)]
    pub link_href: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Installed toolkit metadata. The SQL table is authoritative; a KV hash
/// mirrors it for hot reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolkitRecord {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub base_path: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub origin: ToolkitOrigin,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub backend_module: Option<String>,
    #[serde(default)]
    pub backend_router_attr: Option<String>,
    #[serde(default)]
    pub worker_module: Option<String>,
    #[serde(default)]
    pub worker_register_attr: Option<String>,
    #[serde(default)]
    pub dashboard_cards: Vec<DashboardCard>,
    #[serde(default)]
    pub dashboard_context_module: Option<String>,
    #[serde(default)]
    pub dashboard_context_attr: Option<String>,
    #[serde(default)]
    pub frontend_entry: Option<String>,
    #[serde(default)]
    pub frontend_source_entry: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_category() -> String {
    "toolkit".to_string()
}

/// Fields accepted when registering a toolkit by hand.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolkitCreate {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub base_path: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub backend_module: Option<String>,
    #[serde(default)]
    pub backend_router_attr: Option<String>,
    #[serde(default)]
    pub worker_module: Option<String>,
    #[serde(default)]
    pub worker_register_attr: Option<String>,
    #[serde(default)]
    pub dashboard_cards: Vec<DashboardCard>,
    #[serde(default)]
    pub dashboard_context_module: Option<String>,
    #[serde(default)]
    pub dashboard_context_attr: Option<String>,
    #[serde(default)]
    pub frontend_entry: Option<String>,
    #[serde(default)]
    pub frontend_source_entry: Option<String>,
}

pub(crate) fn default_enabled() -> bool {
    true
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolkitUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub base_path: Option<String>,
    pub enabled: Option<bool>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub version: Option<String>,
    pub backend_module: Option<String>,
    pub backend_router_attr: Option<String>,
    pub worker_module: Option<String>,
    pub worker_register_attr: Option<String>,
    pub dashboard_cards: Option<Vec<DashboardCard>>,
    pub dashboard_context_module: Option<String>,
    pub dashboard_context_attr: Option<String>,
    pub frontend_entry: Option<String>,
    pub frontend_source_entry: Option<String>,
}

impl ToolkitRecord {
    pub fn from_create(payload: ToolkitCreate, origin: ToolkitOrigin) -> Self {
        let now = Utc::now();
        Self {
            slug: payload.slug,
            name: payload.name,
            description: payload.description.unwrap_or_default(),
            base_path: payload.base_path,
            enabled: payload.enabled,
            category: payload.category,
            tags: payload.tags,
            origin,
            version: payload.version,
            backend_module: payload.backend_module,
            backend_router_attr: payload.backend_router_attr,
            worker_module: payload.worker_module,
            worker_register_attr: payload.worker_register_attr,
            dashboard_cards: payload.dashboard_cards,
            dashboard_context_module: payload.dashboard_context_module,
            dashboard_context_attr: payload.dashboard_context_attr,
            frontend_entry: payload.frontend_entry,
            frontend_source_entry: payload.frontend_source_entry,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply_update(&mut self, update: ToolkitUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(base_path) = update.base_path {
            self.base_path = base_path;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(category) = update.category {
            self.category = category;
        }
        if let Some(tags) = update.tags {
            self.tags = tags;
        }
        if let Some(version) = update.version {
            self.version = Some(version);
        }
        if let Some(value) = update.backend_module {
            self.backend_module = Some(value);
        }
        if let Some(value) = update.backend_router_attr {
            self.backend_router_attr = Some(value);
        }
        if let Some(value) = update.worker_module {
            self.worker_module = Some(value);
        }
        if let Some(value) = update.worker_register_attr {
            self.worker_register_attr = Some(value);
        }
        if let Some(cards) = update.dashboard_cards {
            self.dashboard_cards = cards;
        }
        if let Some(value) = update.dashboard_context_module {
            self.dashboard_context_module = Some(value);
        }
        if let Some(value) = update.dashboard_context_attr {
            self.dashboard_context_attr = Some(value);
        }
        if let Some(value) = update.frontend_entry {
            self.frontend_entry = Some(value);
        }
        if let Some(value) = update.frontend_source_entry {
            self.frontend_source_entry = Some(value);
        }
        self.updated_at = Utc::now();
    }
}

/// `toolkit.json` as shipped inside a bundle. Unknown keys are ignored;
/// only `slug` is required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    pub slug: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub backend: ManifestModule,
    #[serde(default)]
    pub worker: ManifestModule,
    #[serde(default)]
    pub dashboard: ManifestDashboard,
    #[serde(default)]
    pub dashboard_cards: Vec<DashboardCard>,
    #[serde(default)]
    pub frontend: ManifestFrontend,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestModule {
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub router_attr: Option<String>,
    #[serde(default)]
    pub register_attr: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestDashboard {
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default, alias = "attr")]
    pub callable: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestFrontend {
    #[serde(default)]
    pub entry: Option<String>,
    #[serde(default)]
    pub source_entry: Option<String>,
}
