//! Toolkit activation.
//!
//! Activation wires a toolkit's compiled plugin into the running
//! process: job handlers into the worker registry, dashboard context
//! into the API. The loader keeps a mutex-guarded `loaded` set so
//! activation is idempotent, per-slug isolated (one toolkit failing to
//! activate never touches another's registrations), and revocable at
//! runtime.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::jobs::{HandlerRegistry, LazyLoader};

use super::plugins::{self, PluginEnv, ToolkitPlugin};
use super::registry::ToolkitRegistry;
use super::{ToolkitOrigin, ToolkitRecord};

#[derive(Default)]
struct LoaderState {
    loaded: HashSet<String>,
    active: HashMap<String, Arc<dyn ToolkitPlugin>>,
}

pub struct ToolkitLoader {
    registry: ToolkitRegistry,
    handlers: Arc<HandlerRegistry>,
    env: PluginEnv,
    state: Mutex<LoaderState>,
}

impl ToolkitLoader {
    pub fn new(registry: ToolkitRegistry, handlers: Arc<HandlerRegistry>, env: PluginEnv) -> Self {
        Self {
            registry,
            handlers,
            env,
            state: Mutex::new(LoaderState::default()),
        }
    }

    pub fn registry(&self) -> &ToolkitRegistry {
        &self.registry
    }

    /// Activate one toolkit. No-op when the slug is already loaded or
    /// the record is missing or disabled.
    pub async fn activate(&self, slug: &str) -> Result<(), RegistryError> {
        if self
            .state
            .lock()
            .expect("loader state poisoned")
            .loaded
            .contains(slug)
        {
            return Ok(());
        }
        let Some(record) = self.registry.get(slug).await? else {
            return Ok(());
        };
        if !record.enabled {
            return Ok(());
        }

        let plugin = record
            .worker_module
            .as_deref()
            .and_then(|module| {
                let plugin = plugins::plugin_for_module(module, &self.env);
                if plugin.is_none() {
                    tracing::warn!(
                        slug,
                        module,
                        "toolkit names a worker module with no compiled counterpart; \
                         installing as asset-only"
                    );
                }
                plugin
            });

        let mut state = self.state.lock().expect("loader state poisoned");
        if state.loaded.contains(slug) {
            return Ok(());
        }
        if let Some(plugin) = plugin {
            plugin.register_handlers(&self.handlers);
            plugin.on_activate();
            state.active.insert(slug.to_string(), plugin);
        }
        state.loaded.insert(slug.to_string());
        drop(state);

        tracing::info!(slug, "toolkit activated");
        Ok(())
    }

    /// Activate every enabled toolkit. Used at process startup.
    pub async fn activate_enabled(&self) -> Result<(), RegistryError> {
        for record in self.registry.list().await? {
            if record.enabled {
                if let Err(err) = self.activate(&record.slug).await {
                    tracing::error!(slug = %record.slug, error = %err, "toolkit activation failed");
                }
            }
        }
        Ok(())
    }

    /// Drop a toolkit's registrations and loaded flag.
    pub fn mark_removed(&self, slug: &str) {
        let mut state = self.state.lock().expect("loader state poisoned");
        state.loaded.remove(slug);
        state.active.remove(slug);
        drop(state);
        self.handlers.unregister_slug(slug);
    }

    pub fn is_loaded(&self, slug: &str) -> bool {
        self.state
            .lock()
            .expect("loader state poisoned")
            .loaded
            .contains(slug)
    }

    /// Dashboard context contributed by active plugins, keyed by slug.
    pub fn dashboard_contexts(&self) -> serde_json::Map<String, serde_json::Value> {
        let state = self.state.lock().expect("loader state poisoned");
        state
            .active
            .iter()
            .map(|(slug, plugin)| (slug.clone(), plugin.dashboard_context()))
            .collect()
    }

    /// Seed bundled toolkits unless a removal tombstone suppresses them.
    /// An existing record keeps its enabled flag; origin is forced back
    /// to `bundled`.
    pub async fn ensure_bundled_installed(&self) -> Result<(), RegistryError> {
        for bundled in plugins::bundled_toolkits() {
            if self.registry.is_removed(bundled.slug).await? {
                continue;
            }
            let existing = self.registry.get(bundled.slug).await?;
            let enabled = existing.as_ref().map(|record| record.enabled).unwrap_or(true);
            let created_at = existing
                .as_ref()
                .map(|record| record.created_at)
                .unwrap_or_else(chrono::Utc::now);

            let record = ToolkitRecord {
                slug: bundled.slug.to_string(),
                name: bundled.name.to_string(),
                description: bundled.description.to_string(),
                base_path: format!("/toolkits/{}", bundled.slug),
                enabled,
                category: bundled.category.to_string(),
                tags: bundled.tags.iter().map(|tag| tag.to_string()).collect(),
                origin: ToolkitOrigin::Bundled,
                version: Some(bundled.version.to_string()),
                backend_module: None,
                backend_router_attr: None,
                worker_module: Some(bundled.worker_module.to_string()),
                worker_register_attr: Some("register".to_string()),
                dashboard_cards: (bundled.dashboard_cards)(),
                dashboard_context_module: None,
                dashboard_context_attr: None,
                frontend_entry: None,
                frontend_source_entry: None,
                created_at,
                updated_at: chrono::Utc::now(),
            };
            self.registry.upsert(&record).await?;

            if enabled {
                self.activate(bundled.slug).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LazyLoader for ToolkitLoader {
    /// Clear the loaded flag and re-run activation; called by the worker
    /// when a handler lookup misses.
    async fn reload_slug(&self, slug: &str) {
        self.state
            .lock()
            .expect("loader state poisoned")
            .loaded
            .remove(slug);
        if let Err(err) = self.activate(slug).await {
            tracing::error!(slug, error = %err, "lazy toolkit load failed");
        }
    }
}
