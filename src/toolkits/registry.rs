//! Toolkit registry over the dual store.
//!
//! The SQL table is authoritative; a KV hash mirrors it for hot reads.
//! Every write lands in both in one logical step, and a mirror miss is
//! repaired from SQL on the next read.

use std::sync::Arc;

use crate::config::redis_key;
use crate::db::Database;
use crate::error::{KvError, RegistryError};
use crate::kv::Kv;

use super::{ToolkitCreate, ToolkitOrigin, ToolkitRecord, ToolkitUpdate, normalize_slug};

#[derive(Clone)]
pub struct ToolkitRegistry {
    db: Arc<dyn Database>,
    kv: Arc<dyn Kv>,
    mirror_key: String,
}

impl ToolkitRegistry {
    pub fn new(db: Arc<dyn Database>, kv: Arc<dyn Kv>, prefix: &str) -> Self {
        Self {
            db,
            kv,
            mirror_key: redis_key(prefix, &["toolkits", "registry"]),
        }
    }

    /// Sorted view: category first, then case-insensitive name.
    pub async fn list(&self) -> Result<Vec<ToolkitRecord>, RegistryError> {
        let mut records = self.read_mirror().await?;
        if records.is_empty() {
            records = self.rebuild_mirror().await?;
        }
        records.sort_by(|a, b| {
            (a.category.clone(), a.name.to_lowercase())
                .cmp(&(b.category.clone(), b.name.to_lowercase()))
        });
        Ok(records)
    }

    pub async fn get(&self, slug: &str) -> Result<Option<ToolkitRecord>, RegistryError> {
        if let Some(raw) = self.kv.hget(&self.mirror_key, slug).await? {
            let record = serde_json::from_str(&raw)
                .map_err(|err| KvError::Decode(err.to_string()))?;
            return Ok(Some(record));
        }
        // Mirror miss; repair from the authoritative table.
        match self.db.get_toolkit(slug).await? {
            Some(record) => {
                self.mirror(&record).await?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub async fn create(
        &self,
        payload: ToolkitCreate,
        origin: ToolkitOrigin,
    ) -> Result<ToolkitRecord, RegistryError> {
        let slug =
            normalize_slug(&payload.slug).map_err(RegistryError::InvalidSlug)?;
        if self.get(&slug).await?.is_some() {
            return Err(RegistryError::DuplicateSlug(slug));
        }
        let mut record = ToolkitRecord::from_create(payload, origin);
        record.slug = slug;
        self.write(&record).await?;
        Ok(record)
    }

    /// Create or replace, preserving `created_at` and origin of an
    /// existing record unless the caller overrides them.
    pub async fn upsert(&self, record: &ToolkitRecord) -> Result<(), RegistryError> {
        self.write(record).await
    }

    pub async fn update(
        &self,
        slug: &str,
        update: ToolkitUpdate,
    ) -> Result<Option<ToolkitRecord>, RegistryError> {
        let Some(mut record) = self.get(slug).await? else {
            return Ok(None);
        };
        record.apply_update(update);
        self.write(&record).await?;
        Ok(Some(record))
    }

    /// Delete a toolkit. Builtin records are protected; deleting a
    /// bundled record leaves a tombstone that suppresses re-seeding.
    pub async fn delete(&self, slug: &str) -> Result<ToolkitRecord, RegistryError> {
        let Some(record) = self.get(slug).await? else {
            return Err(RegistryError::NotFound);
        };
        if record.origin == ToolkitOrigin::Builtin {
            return Err(RegistryError::BuiltinProtected);
        }
        if !self.db.delete_toolkit(slug).await? {
            return Err(RegistryError::NotFound);
        }
        self.kv.hdel(&self.mirror_key, slug).await?;
        if record.origin == ToolkitOrigin::Bundled {
            self.db.record_toolkit_removal(slug).await?;
        }
        Ok(record)
    }

    pub async fn set_origin(
        &self,
        slug: &str,
        origin: ToolkitOrigin,
    ) -> Result<Option<ToolkitRecord>, RegistryError> {
        let Some(mut record) = self.get(slug).await? else {
            return Ok(None);
        };
        record.origin = origin;
        record.updated_at = chrono::Utc::now();
        self.write(&record).await?;
        Ok(Some(record))
    }

    pub async fn is_removed(&self, slug: &str) -> Result<bool, RegistryError> {
        Ok(self.db.toolkit_removal_exists(slug).await?)
    }

    pub async fn clear_removal(&self, slug: &str) -> Result<(), RegistryError> {
        Ok(self.db.clear_toolkit_removal(slug).await?)
    }

    async fn read_mirror(&self) -> Result<Vec<ToolkitRecord>, RegistryError> {
        let mut records = Vec::new();
        for raw in self.kv.hvals(&self.mirror_key).await? {
            let record: ToolkitRecord = serde_json::from_str(&raw)
                .map_err(|err| KvError::Decode(err.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Repopulate the KV mirror from SQL.
    pub async fn rebuild_mirror(&self) -> Result<Vec<ToolkitRecord>, RegistryError> {
        let records = self.db.list_toolkits().await?;
        for record in &records {
            self.mirror(record).await?;
        }
        Ok(records)
    }

    async fn write(&self, record: &ToolkitRecord) -> Result<(), RegistryError> {
        self.db.upsert_toolkit(record).await?;
        self.mirror(record).await?;
        Ok(())
    }

    async fn mirror(&self, record: &ToolkitRecord) -> Result<(), KvError> {
        let raw =
            serde_json::to_string(record).map_err(|err| KvError::Decode(err.to_string()))?;
        self.kv.hset(&self.mirror_key, &record.slug, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use crate::kv::MemoryKv;
    use pretty_assertions::assert_eq;

    fn create_payload(slug: &str, name: &str) -> ToolkitCreate {
        ToolkitCreate {
            slug: slug.into(),
            name: name.into(),
            description: None,
            base_path: format!("/toolkits/{slug}"),
            enabled: false,
            category: "toolkit".into(),
            tags: vec![],
            version: None,
            backend_module: None,
            backend_router_attr: None,
            worker_module: None,
            worker_register_attr: None,
            dashboard_cards: vec![],
            dashboard_context_module: None,
            dashboard_context_attr: None,
            frontend_entry: None,
            frontend_source_entry: None,
        }
    }

    fn registry() -> (ToolkitRegistry, Arc<MemoryDb>, Arc<MemoryKv>) {
        let db = Arc::new(MemoryDb::new());
        let kv = Arc::new(MemoryKv::new());
        let registry = ToolkitRegistry::new(db.clone(), kv.clone(), "opsdeck");
        (registry, db, kv)
    }

    #[tokio::test]
    async fn create_rejects_duplicates_and_bad_slugs() {
        let (registry, _db, _kv) = registry();
        registry
            .create(create_payload("zabbix", "Zabbix"), ToolkitOrigin::Bundled)
            .await
            .unwrap();

        let err = registry
            .create(create_payload("zabbix", "Other"), ToolkitOrigin::Custom)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateSlug(_)));

        let err = registry
            .create(create_payload("Bad Slug!", "Nope"), ToolkitOrigin::Custom)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSlug(_)));
    }

    #[tokio::test]
    async fn list_sorts_by_category_then_name() {
        let (registry, _db, _kv) = registry();
        let mut monitoring = create_payload("zeta", "zeta kit");
        monitoring.category = "monitoring".into();
        registry
            .create(monitoring, ToolkitOrigin::Custom)
            .await
            .unwrap();
        registry
            .create(create_payload("alpha", "Beta Kit"), ToolkitOrigin::Custom)
            .await
            .unwrap();
        registry
            .create(create_payload("gamma", "alpha kit"), ToolkitOrigin::Custom)
            .await
            .unwrap();

        let slugs: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.slug)
            .collect();
        assert_eq!(slugs, vec!["zeta", "gamma", "alpha"]);
    }

    #[tokio::test]
    async fn mirror_miss_repairs_from_sql() {
        let (registry, db, kv) = registry();
        let record = registry
            .create(create_payload("zabbix", "Zabbix"), ToolkitOrigin::Bundled)
            .await
            .unwrap();

        // Blow away the mirror; the authoritative row survives.
        kv.hdel("opsdeck:toolkits:registry", "zabbix").await.unwrap();
        assert!(db.get_toolkit("zabbix").await.unwrap().is_some());

        let fetched = registry.get("zabbix").await.unwrap().unwrap();
        assert_eq!(fetched.slug, record.slug);
        // Mirror is repaired.
        assert!(
            kv.hget("opsdeck:toolkits:registry", "zabbix")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn delete_builtin_is_forbidden() {
        let (registry, _db, _kv) = registry();
        registry
            .create(create_payload("core", "Core"), ToolkitOrigin::Builtin)
            .await
            .unwrap();
        let err = registry.delete("core").await.unwrap_err();
        assert!(matches!(err, RegistryError::BuiltinProtected));
    }

    #[tokio::test]
    async fn delete_bundled_records_tombstone() {
        let (registry, _db, _kv) = registry();
        registry
            .create(create_payload("zabbix", "Zabbix"), ToolkitOrigin::Bundled)
            .await
            .unwrap();

        registry.delete("zabbix").await.unwrap();
        assert!(registry.is_removed("zabbix").await.unwrap());
        assert!(registry.get("zabbix").await.unwrap().is_none());

        registry.clear_removal("zabbix").await.unwrap();
        assert!(!registry.is_removed("zabbix").await.unwrap());
    }

    #[tokio::test]
    async fn delete_uploaded_leaves_no_tombstone() {
        let (registry, _db, _kv) = registry();
        registry
            .create(create_payload("custom1", "Custom"), ToolkitOrigin::Uploaded)
            .await
            .unwrap();
        registry.delete("custom1").await.unwrap();
        assert!(!registry.is_removed("custom1").await.unwrap());
    }

    #[tokio::test]
    async fn update_flips_enabled() {
        let (registry, _db, _kv) = registry();
        registry
            .create(create_payload("zabbix", "Zabbix"), ToolkitOrigin::Bundled)
            .await
            .unwrap();
        let updated = registry
            .update(
                "zabbix",
                ToolkitUpdate {
                    enabled: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(updated.enabled);
    }
}
