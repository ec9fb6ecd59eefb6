//! Community catalog: browse, install, and update toolkits published
//! as remote zip bundles.
//!
//! The catalog URL comes from a system-settings override, falling back
//! to the configured default. Bundle downloads walk an ordered list of
//! candidate URLs derived from the entry and the catalog location; the
//! first response that looks like a zip wins.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::audit::{AuditContext, AuditService};
use crate::db::Database;
use crate::error::{BundleError, CatalogError};
use crate::toolkits::bundle::BundleInstaller;
use crate::toolkits::{ToolkitOrigin, ToolkitRecord};

/// System-settings key overriding the compile-time catalog URL.
pub const CATALOG_SETTING_KEY: &str = "toolkit.catalog.url";

const CATALOG_FETCH_TIMEOUT_SECONDS: u64 = 10;
const BUNDLE_DOWNLOAD_TIMEOUT_SECONDS: u64 = 30;

/// Accepted zip signatures: regular, empty, and spanned archives.
const ZIP_MAGICS: [&[u8]; 3] = [b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityToolkitEntry {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub bundle_url: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub maintainers: Vec<String>,
    #[serde(default)]
    pub resolved_bundle_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    Wrapped { toolkits: Vec<CommunityToolkitEntry> },
    Bare(Vec<CommunityToolkitEntry>),
}

/// An available upgrade for an installed community toolkit.
#[derive(Debug, Clone, Serialize)]
pub struct ToolkitUpdate {
    pub slug: String,
    pub installed_version: Option<String>,
    pub available_version: String,
    pub source: String,
}

pub struct CatalogService {
    db: Arc<dyn Database>,
    installer: Arc<BundleInstaller>,
    audit: AuditService,
    default_url: Option<String>,
    http: reqwest::Client,
}

impl CatalogService {
    pub fn new(
        db: Arc<dyn Database>,
        installer: Arc<BundleInstaller>,
        audit: AuditService,
        default_url: Option<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(CATALOG_FETCH_TIMEOUT_SECONDS))
            .build()
            .expect("reqwest client");
        Self {
            db,
            installer,
            audit,
            default_url,
            http,
        }
    }

    /// Effective catalog URL: stored override first, then the default.
    pub async fn catalog_url(&self) -> Result<Option<Url>, CatalogError> {
        let stored = self
            .db
            .get_setting(CATALOG_SETTING_KEY)
            .await
            .map_err(|err| CatalogError::Fetch(err.to_string()))?
            .and_then(|value| value.as_str().map(str::to_string))
            .filter(|value| !value.trim().is_empty());
        let raw = stored.or_else(|| self.default_url.clone());
        match raw {
            Some(raw) => Url::parse(raw.trim())
                .map(Some)
                .map_err(|err| CatalogError::Fetch(format!("invalid catalog url: {err}"))),
            None => Ok(None),
        }
    }

    /// Fetch and parse the catalog, resolving each entry's bundle URL
    /// against the catalog location when it is relative.
    pub async fn fetch(&self) -> Result<(Url, Vec<CommunityToolkitEntry>), CatalogError> {
        let url = self.catalog_url().await?.ok_or(CatalogError::NotConfigured)?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|err| CatalogError::Fetch(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::Fetch(format!(
                "catalog returned {}",
                response.status()
            )));
        }
        let document: CatalogDocument = response
            .json()
            .await
            .map_err(|err| CatalogError::Fetch(err.to_string()))?;
        let mut entries = match document {
            CatalogDocument::Wrapped { toolkits } => toolkits,
            CatalogDocument::Bare(toolkits) => toolkits,
        };
        for entry in &mut entries {
            if entry.resolved_bundle_url.is_none() {
                entry.resolved_bundle_url = entry
                    .bundle_url
                    .as_deref()
                    .and_then(|bundle_url| url.join(bundle_url).ok())
                    .map(|resolved| resolved.to_string());
            }
        }
        Ok((url, entries))
    }

    /// Download and install a catalog entry as a disabled community
    /// toolkit.
    pub async fn install(
        &self,
        slug: &str,
        context: AuditContext,
    ) -> Result<ToolkitRecord, CatalogError> {
        let (catalog_url, entries) = self.fetch().await?;
        let entry = entries
            .into_iter()
            .find(|entry| entry.slug == slug)
            .ok_or_else(|| CatalogError::EntryNotFound(slug.to_string()))?;

        let bundle_path = self.download_bundle(&entry, &catalog_url).await?;
        let outcome = self
            .installer
            .install_uploaded_bundle(&bundle_path, Some(slug), ToolkitOrigin::Community, false)
            .await?;

        let _ = self
            .audit
            .log(
                "toolkit.install",
                Some(serde_json::json!({
                    "slug": outcome.record.slug,
                    "origin": "community",
                    "version": outcome.record.version,
                    "catalog_url": catalog_url.to_string(),
                })),
                AuditContext {
                    target_type: Some("toolkit".to_string()),
                    target_id: Some(outcome.record.slug.clone()),
                    ..context
                },
            )
            .await;

        Ok(outcome.record)
    }

    async fn download_bundle(
        &self,
        entry: &CommunityToolkitEntry,
        catalog_url: &Url,
    ) -> Result<std::path::PathBuf, CatalogError> {
        let candidates = candidate_bundle_urls(entry, catalog_url);
        if candidates.is_empty() {
            return Err(CatalogError::NoBundle(entry.slug.clone()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(BUNDLE_DOWNLOAD_TIMEOUT_SECONDS))
            .build()
            .map_err(|err| CatalogError::Fetch(err.to_string()))?;

        for candidate in &candidates {
            let response = match client.get(candidate.clone()).send().await {
                Ok(response) if response.status().is_success() => response,
                Ok(_) | Err(_) => continue,
            };
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(_) => continue,
            };
            if !looks_like_zip(&body) {
                continue;
            }
            if body.len() as u64 > self.installer.limits().bundle_max_bytes {
                return Err(CatalogError::Bundle(BundleError::BundleTooLarge));
            }

            let stream = futures::stream::iter(vec![Ok::<bytes::Bytes, BundleError>(
                bytes::Bytes::from(body.to_vec()),
            )]);
            let path = self
                .installer
                .write_upload_to_disk(&format!("{}.zip", entry.slug), stream)
                .await
                .map_err(CatalogError::Bundle)?;
            tracing::info!(slug = %entry.slug, url = %candidate, "downloaded community bundle");
            return Ok(path);
        }
        Err(CatalogError::NoBundle(entry.slug.clone()))
    }

    /// Report community toolkits whose catalog entry advertises a newer
    /// version.
    pub async fn check_updates(
        &self,
        installed: &[ToolkitRecord],
    ) -> Result<Vec<ToolkitUpdate>, CatalogError> {
        let (catalog_url, entries) = self.fetch().await?;
        let mut updates = Vec::new();
        for record in installed {
            if record.origin != ToolkitOrigin::Community {
                continue;
            }
            let Some(entry) = entries.iter().find(|entry| entry.slug == record.slug) else {
                continue;
            };
            let Some(available) = entry.version.as_deref() else {
                continue;
            };
            if is_newer_version(available, record.version.as_deref()) {
                updates.push(ToolkitUpdate {
                    slug: record.slug.clone(),
                    installed_version: record.version.clone(),
                    available_version: available.to_string(),
                    source: catalog_url.to_string(),
                });
            }
        }
        Ok(updates)
    }
}

fn looks_like_zip(body: &[u8]) -> bool {
    ZIP_MAGICS.iter().any(|magic| body.starts_with(magic))
}

/// Semver comparison with a lexicographic fallback for unparseable
/// versions. `None` installed always counts as older.
pub fn is_newer_version(available: &str, installed: Option<&str>) -> bool {
    let Some(installed) = installed else {
        return true;
    };
    let parse = |raw: &str| semver::Version::parse(raw.trim().trim_start_matches('v')).ok();
    match (parse(available), parse(installed)) {
        (Some(available), Some(installed)) => available > installed,
        _ => available > installed,
    }
}

fn has_extension(raw: &str) -> bool {
    raw.rsplit('/')
        .next()
        .is_some_and(|segment| segment.contains('.'))
}

/// Site root for a catalog URL: GitHub raw URLs rewrite to the
/// project's Pages site, Pages URLs keep their project prefix, anything
/// else collapses to the host root.
fn site_root(catalog_url: &Url) -> Option<Url> {
    let host = catalog_url.host_str()?;
    let segments: Vec<&str> = catalog_url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    if host == "raw.githubusercontent.com" && segments.len() >= 2 {
        let owner = segments[0];
        let repo = segments[1];
        return Url::parse(&format!("https://{owner}.github.io/{repo}/")).ok();
    }
    if host.ends_with(".github.io") {
        if let Some(project) = segments.first() {
            return catalog_url.join(&format!("/{project}/")).ok();
        }
    }
    catalog_url.join("/").ok()
}

/// Ordered, deduplicated candidate URLs for a bundle download.
pub fn candidate_bundle_urls(entry: &CommunityToolkitEntry, catalog_url: &Url) -> Vec<Url> {
    let mut candidates: Vec<Url> = Vec::new();
    let mut push = |url: Url| {
        if !candidates.iter().any(|existing| existing == &url) {
            candidates.push(url);
        }
    };

    if let Some(resolved) = entry.resolved_bundle_url.as_deref() {
        if let Ok(url) = Url::parse(resolved) {
            push(url);
        }
    }

    if let Some(bundle_url) = entry.bundle_url.as_deref() {
        let mut variants = vec![bundle_url.to_string()];
        if !has_extension(bundle_url) {
            variants.push(format!("{bundle_url}.zip"));
        }

        let homepage = entry
            .homepage
            .as_deref()
            .and_then(|raw| Url::parse(raw).ok());
        let root = site_root(catalog_url);

        for variant in &variants {
            if let Ok(absolute) = Url::parse(variant) {
                push(absolute);
                continue;
            }
            if let Some(homepage) = &homepage {
                if let Ok(url) = homepage.join(variant) {
                    push(url);
                }
            }
            if let Some(root) = &root {
                if let Ok(url) = root.join(variant) {
                    push(url);
                }
            }
            if let Ok(url) = catalog_url.join(variant) {
                push(url);
            }
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(bundle_url: Option<&str>) -> CommunityToolkitEntry {
        CommunityToolkitEntry {
            slug: "demo".into(),
            name: "Demo".into(),
            description: None,
            version: None,
            bundle_url: bundle_url.map(str::to_string),
            homepage: None,
            tags: vec![],
            maintainers: vec![],
            resolved_bundle_url: None,
        }
    }

    #[test]
    fn zip_magic_detection() {
        assert!(looks_like_zip(b"PK\x03\x04rest"));
        assert!(looks_like_zip(b"PK\x05\x06"));
        assert!(looks_like_zip(b"PK\x07\x08"));
        assert!(!looks_like_zip(b"<html>"));
        assert!(!looks_like_zip(b""));
    }

    #[test]
    fn semver_compare_with_fallback() {
        assert!(is_newer_version("1.2.0", Some("1.1.9")));
        assert!(!is_newer_version("1.2.0", Some("1.2.0")));
        assert!(!is_newer_version("1.2.0", Some("1.10.0")));
        assert!(is_newer_version("v2.0.0", Some("1.9.0")));
        assert!(is_newer_version("1.0.0", None));
        // Unparseable versions fall back to lexicographic order.
        assert!(is_newer_version("build-b", Some("build-a")));
        assert!(!is_newer_version("build-a", Some("build-b")));
    }

    #[test]
    fn relative_bundle_joins_catalog_site_root_before_catalog_url() {
        let catalog =
            Url::parse("https://sxmxc.github.io/ideal-octo-engine/catalog/toolkits.json").unwrap();
        let candidates = candidate_bundle_urls(&entry(Some("toolkits/demo/bundle")), &catalog);
        let rendered: Vec<String> = candidates.iter().map(Url::to_string).collect();
        assert_eq!(
            rendered[0],
            "https://sxmxc.github.io/ideal-octo-engine/toolkits/demo/bundle"
        );
        // The .zip variant and the catalog-relative join follow.
        assert!(rendered.contains(
            &"https://sxmxc.github.io/ideal-octo-engine/toolkits/demo/bundle.zip".to_string()
        ));
        assert!(rendered.contains(
            &"https://sxmxc.github.io/ideal-octo-engine/catalog/toolkits/demo/bundle".to_string()
        ));
    }

    #[test]
    fn raw_github_catalog_rewrites_to_pages_site() {
        let catalog =
            Url::parse("https://raw.githubusercontent.com/acme/toolkits/main/catalog.json")
                .unwrap();
        let candidates = candidate_bundle_urls(&entry(Some("bundles/demo.zip")), &catalog);
        let rendered: Vec<String> = candidates.iter().map(Url::to_string).collect();
        assert_eq!(rendered[0], "https://acme.github.io/toolkits/bundles/demo.zip");
    }

    #[test]
    fn absolute_bundle_url_wins() {
        let catalog = Url::parse("https://catalog.example/catalog.json").unwrap();
        let mut entry = entry(Some("https://cdn.example/demo.zip"));
        entry.resolved_bundle_url = Some("https://cdn.example/resolved.zip".to_string());
        let candidates = candidate_bundle_urls(&entry, &catalog);
        let rendered: Vec<String> = candidates.iter().map(Url::to_string).collect();
        assert_eq!(rendered[0], "https://cdn.example/resolved.zip");
        assert_eq!(rendered[1], "https://cdn.example/demo.zip");
    }

    #[test]
    fn homepage_joins_come_first_among_bases() {
        let catalog = Url::parse("https://catalog.example/catalog.json").unwrap();
        let mut entry = entry(Some("demo"));
        entry.homepage = Some("https://acme.example/toolkits/".to_string());
        let candidates = candidate_bundle_urls(&entry, &catalog);
        let rendered: Vec<String> = candidates.iter().map(Url::to_string).collect();
        assert_eq!(rendered[0], "https://acme.example/toolkits/demo");
        assert!(rendered.contains(&"https://catalog.example/demo".to_string()));
        assert!(rendered.contains(&"https://catalog.example/demo.zip".to_string()));
    }

    #[test]
    fn candidates_are_deduplicated() {
        let catalog = Url::parse("https://catalog.example/catalog.json").unwrap();
        let mut entry = entry(Some("https://cdn.example/demo.zip"));
        entry.resolved_bundle_url = Some("https://cdn.example/demo.zip".to_string());
        let candidates = candidate_bundle_urls(&entry, &catalog);
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn catalog_document_tolerates_bare_arrays() {
        let wrapped: CatalogDocument =
            serde_json::from_str(r#"{"toolkits": [{"slug": "a", "name": "A"}]}"#).unwrap();
        let bare: CatalogDocument =
            serde_json::from_str(r#"[{"slug": "a", "name": "A"}]"#).unwrap();
        for document in [wrapped, bare] {
            let entries = match document {
                CatalogDocument::Wrapped { toolkits } => toolkits,
                CatalogDocument::Bare(toolkits) => toolkits,
            };
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].slug, "a");
        }
    }
}
