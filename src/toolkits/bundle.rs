//! Toolkit bundle ingestion.
//!
//! Uploads stream to disk in bounded chunks, archives extract under a
//! scratch directory with traversal and symlink defenses plus per-file
//! and aggregate size caps, and only after the manifest validates and
//! the tree copies into `{storage}/{slug}` does the registry record
//! change. Any failure along the way removes the bundle file and the
//! extraction directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::{AsyncReadExt as _, Stream, StreamExt};
use rand::Rng;
use tokio::io::AsyncWriteExt;

use crate::error::{BundleError, InstallError};

use super::loader::ToolkitLoader;
use super::{Manifest, ToolkitOrigin, ToolkitRecord, ToolkitUpdate, normalize_slug};

/// Upload read/write chunk size: 1 MiB.
const CHUNK_BYTES: usize = 1024 * 1024;

/// Scratch area for in-flight extractions.
const UPLOADS_DIR: &str = "__uploads__";

const DEFAULT_FRONTEND_ENTRY: &str = "frontend/dist/index.js";
const DEFAULT_FRONTEND_SOURCE_ENTRY: &str = "frontend/index.tsx";

/// Size limits applied during ingestion.
#[derive(Debug, Clone, Copy)]
pub struct BundleLimits {
    pub upload_max_bytes: u64,
    pub bundle_max_bytes: u64,
    pub bundle_max_file_bytes: u64,
}

/// Outcome of a successful install.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub record: ToolkitRecord,
    pub bundle_path: Option<PathBuf>,
}

pub struct BundleInstaller {
    loader: Arc<ToolkitLoader>,
    storage_dir: PathBuf,
    limits: BundleLimits,
}

impl BundleInstaller {
    pub fn new(loader: Arc<ToolkitLoader>, storage_dir: PathBuf, limits: BundleLimits) -> Self {
        Self {
            loader,
            storage_dir,
            limits,
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn limits(&self) -> BundleLimits {
        self.limits
    }

    /// Stream an upload to disk in ≤1 MiB chunks, aborting once the
    /// total exceeds the upload cap. Returns the bundle path.
    pub async fn write_upload_to_disk<S>(
        &self,
        file_name: &str,
        mut stream: S,
    ) -> Result<PathBuf, BundleError>
    where
        S: Stream<Item = Result<bytes::Bytes, BundleError>> + Unpin,
    {
        tokio::fs::create_dir_all(&self.storage_dir).await?;
        let target = self.sanitized_bundle_path(file_name).await;

        let mut file = tokio::fs::File::create(&target).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&target).await;
                    return Err(err);
                }
            };
            for piece in chunk.chunks(CHUNK_BYTES) {
                written += piece.len() as u64;
                if written > self.limits.upload_max_bytes {
                    drop(file);
                    let _ = tokio::fs::remove_file(&target).await;
                    return Err(BundleError::UploadTooLarge);
                }
                file.write_all(piece).await?;
            }
        }
        file.flush().await?;
        Ok(target)
    }

    async fn sanitized_bundle_path(&self, file_name: &str) -> PathBuf {
        let base = Path::new(file_name)
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .filter(|name| !name.is_empty() && name != ".." && name != ".")
            .unwrap_or_default();
        let mut candidate = if base.is_empty() {
            format!("upload-{:08x}.zip", rand::thread_rng().r#gen::<u32>())
        } else {
            base
        };
        // A directory squatting on the name forces a random suffix.
        if tokio::fs::metadata(self.storage_dir.join(&candidate))
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
        {
            candidate = format!(
                "upload-{:08x}-{candidate}",
                rand::thread_rng().r#gen::<u32>()
            );
        }
        self.storage_dir.join(candidate)
    }

    /// Full upload flow: extract, validate, install, keep the archive as
    /// `{storage}/{slug}.zip`. Cleans up on any failure.
    pub async fn install_uploaded_bundle(
        &self,
        bundle_path: &Path,
        slug_override: Option<&str>,
        origin: ToolkitOrigin,
        enable_by_default: bool,
    ) -> Result<InstallOutcome, InstallError> {
        let scratch_name = match slug_override {
            Some(slug) => slug.to_string(),
            None => bundle_path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("bundle")
                .to_string(),
        };
        let scratch = self.storage_dir.join(UPLOADS_DIR).join(&scratch_name);

        let result = self
            .extract_and_install(bundle_path, &scratch, slug_override, origin, enable_by_default)
            .await;
        let _ = tokio::fs::remove_dir_all(&scratch).await;

        match result {
            Ok(record) => {
                let final_path = self.storage_dir.join(format!("{}.zip", record.slug));
                if bundle_path != final_path {
                    let _ = tokio::fs::remove_file(&final_path).await;
                    tokio::fs::rename(bundle_path, &final_path)
                        .await
                        .map_err(BundleError::from)?;
                }
                Ok(InstallOutcome {
                    record,
                    bundle_path: Some(final_path),
                })
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(bundle_path).await;
                Err(err)
            }
        }
    }

    async fn extract_and_install(
        &self,
        bundle_path: &Path,
        scratch: &Path,
        slug_override: Option<&str>,
        origin: ToolkitOrigin,
        enable_by_default: bool,
    ) -> Result<ToolkitRecord, InstallError> {
        if scratch.exists() {
            tokio::fs::remove_dir_all(scratch)
                .await
                .map_err(BundleError::from)?;
        }
        tokio::fs::create_dir_all(scratch)
            .await
            .map_err(BundleError::from)?;

        self.extract_archive(bundle_path, scratch).await?;
        let record = self
            .install_from_directory(scratch, slug_override, origin, enable_by_default, true)
            .await?;
        Ok(record)
    }

    /// Extract a zip archive into `dest`, enforcing entry-name hygiene,
    /// symlink rejection, size caps, and mode-bit preservation.
    pub async fn extract_archive(
        &self,
        bundle_path: &Path,
        dest: &Path,
    ) -> Result<(), BundleError> {
        let mut file = tokio::io::BufReader::new(tokio::fs::File::open(bundle_path).await?);
        let mut reader = async_zip::tokio::read::seek::ZipFileReader::with_tokio(&mut file)
            .await
            .map_err(|err| BundleError::BadArchive(err.to_string()))?;

        let mut aggregate_remaining = self.limits.bundle_max_bytes;
        let entry_count = reader.file().entries().len();
        for index in 0..entry_count {
            let (name, is_dir, permissions) = {
                let entry = &reader.file().entries()[index];
                let name = entry
                    .filename()
                    .as_str()
                    .map_err(|err| BundleError::BadArchive(err.to_string()))?
                    .to_string();
                let is_dir = entry
                    .dir()
                    .map_err(|err| BundleError::BadArchive(err.to_string()))?;
                (name, is_dir, entry.unix_permissions())
            };

            let relative = validate_entry_name(&name)?;
            // Symlinks never extract; their target could escape the root.
            if let Some(mode) = permissions {
                if mode & 0o170000 == 0o120000 {
                    return Err(BundleError::ForbiddenEntry(name.to_string()));
                }
            }

            let target = dest.join(&relative);
            if is_dir {
                tokio::fs::create_dir_all(&target).await?;
                continue;
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let mut entry_reader = reader
                .reader_with_entry(index)
                .await
                .map_err(|err| BundleError::BadArchive(err.to_string()))?;
            let mut out = tokio::fs::File::create(&target).await?;
            let mut file_remaining = self.limits.bundle_max_file_bytes;
            let mut buf = vec![0u8; CHUNK_BYTES];
            loop {
                let read = entry_reader
                    .read(&mut buf)
                    .await
                    .map_err(|err| BundleError::BadArchive(err.to_string()))?;
                if read == 0 {
                    break;
                }
                let read = read as u64;
                if read > file_remaining {
                    return Err(BundleError::FileTooLarge(name.to_string()));
                }
                file_remaining -= read;
                if read > aggregate_remaining {
                    return Err(BundleError::BundleTooLarge);
                }
                aggregate_remaining -= read;
                out.write_all(&buf[..read as usize]).await?;
            }
            out.flush().await?;

            #[cfg(unix)]
            if let Some(mode) = permissions {
                use std::os::unix::fs::PermissionsExt;
                let mode = (mode as u32) & 0o777;
                if mode != 0 {
                    tokio::fs::set_permissions(
                        &target,
                        std::fs::Permissions::from_mode(mode),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Install a toolkit from an extracted directory tree. The registry
    /// is only touched after the manifest validates and the tree has
    /// been copied under the storage root.
    pub async fn install_from_directory(
        &self,
        source_dir: &Path,
        slug_override: Option<&str>,
        origin: ToolkitOrigin,
        enable_by_default: bool,
        preserve_enabled: bool,
    ) -> Result<ToolkitRecord, InstallError> {
        let toolkit_root = resolve_toolkit_root(source_dir).await?;
        let manifest = load_manifest(&toolkit_root.join("toolkit.json")).await?;

        let manifest_slug = manifest
            .slug
            .as_deref()
            .ok_or_else(|| BundleError::Manifest("toolkit.json must define a slug".to_string()))?;
        let manifest_slug = normalize_slug(manifest_slug).map_err(BundleError::Manifest)?;
        let slug = match slug_override {
            Some(raw) => {
                let overridden = normalize_slug(raw).map_err(BundleError::Manifest)?;
                if overridden != manifest_slug {
                    return Err(BundleError::Manifest(
                        "Manifest slug does not match override".to_string(),
                    )
                    .into());
                }
                overridden
            }
            None => manifest_slug,
        };

        let name = manifest
            .name
            .clone()
            .unwrap_or_else(|| title_case_slug(&slug));
        let description = manifest.description.clone().unwrap_or_default();
        let base_path = match manifest.base_path.as_deref() {
            Some(path) if path.starts_with('/') => path.to_string(),
            Some(path) => format!("/{}", path.trim_start_matches('/')),
            None => format!("/toolkits/{slug}"),
        };

        let frontend_entry =
            resolve_frontend_entry(&toolkit_root, manifest.frontend.entry.as_deref(), DEFAULT_FRONTEND_ENTRY, "Frontend entry")
                .await?;
        let frontend_source_entry = resolve_frontend_entry(
            &toolkit_root,
            manifest.frontend.source_entry.as_deref(),
            DEFAULT_FRONTEND_SOURCE_ENTRY,
            "Frontend source entry",
        )
        .await?;

        validate_toolkit_tree(&toolkit_root).await?;

        // Copy into storage, confined to the storage root.
        tokio::fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(BundleError::from)?;
        let storage_resolved = tokio::fs::canonicalize(&self.storage_dir)
            .await
            .map_err(BundleError::from)?;
        let dest_root = self.storage_dir.join(&slug);
        if dest_root.exists() {
            tokio::fs::remove_dir_all(&dest_root)
                .await
                .map_err(BundleError::from)?;
        }
        copy_tree(&toolkit_root, &dest_root).await?;
        let dest_resolved = tokio::fs::canonicalize(&dest_root)
            .await
            .map_err(BundleError::from)?;
        if !dest_resolved.starts_with(&storage_resolved) {
            let _ = tokio::fs::remove_dir_all(&dest_root).await;
            return Err(BundleError::Manifest(
                "Toolkit storage destination escapes configured storage directory".to_string(),
            )
            .into());
        }

        let registry = self.loader.registry();
        registry.clear_removal(&slug).await?;

        let existing = registry.get(&slug).await?;
        let record = match existing {
            Some(_) => {
                let update = ToolkitUpdate {
                    name: Some(name),
                    description: Some(description),
                    base_path: Some(base_path),
                    enabled: (!preserve_enabled).then_some(enable_by_default),
                    category: manifest.category.clone(),
                    tags: Some(manifest.tags.clone()),
                    version: manifest.version.clone(),
                    backend_module: manifest.backend.module.clone(),
                    backend_router_attr: manifest.backend.router_attr.clone(),
                    worker_module: manifest.worker.module.clone(),
                    worker_register_attr: manifest.worker.register_attr.clone(),
                    dashboard_cards: Some(manifest.dashboard_cards.clone()),
                    dashboard_context_module: manifest.dashboard.module.clone(),
                    dashboard_context_attr: manifest.dashboard.callable.clone(),
                    frontend_entry: frontend_entry.clone(),
                    frontend_source_entry: frontend_source_entry.clone(),
                };
                registry
                    .update(&slug, update)
                    .await?
                    .expect("existing toolkit vanished during update")
            }
            None => {
                let mut record = ToolkitRecord::from_create(
                    super::ToolkitCreate {
                        slug: slug.clone(),
                        name,
                        description: Some(description),
                        base_path,
                        enabled: enable_by_default,
                        category: manifest
                            .category
                            .clone()
                            .unwrap_or_else(|| "toolkit".to_string()),
                        tags: manifest.tags.clone(),
                        version: manifest.version.clone(),
                        backend_module: manifest.backend.module.clone(),
                        backend_router_attr: manifest.backend.router_attr.clone(),
                        worker_module: manifest.worker.module.clone(),
                        worker_register_attr: manifest.worker.register_attr.clone(),
                        dashboard_cards: manifest.dashboard_cards.clone(),
                        dashboard_context_module: manifest.dashboard.module.clone(),
                        dashboard_context_attr: manifest.dashboard.callable.clone(),
                        frontend_entry: frontend_entry.clone(),
                        frontend_source_entry: frontend_source_entry.clone(),
                    },
                    origin,
                );
                record.slug = slug.clone();
                registry.upsert(&record).await?;
                record
            }
        };

        if record.enabled {
            // Force a clean reload so a replaced bundle takes effect.
            self.loader.mark_removed(&slug);
            self.loader.activate(&slug).await?;
        }

        Ok(record)
    }
}

/// Reject drive letters, absolute paths, and parent-directory segments;
/// return the safe relative path.
fn validate_entry_name(name: &str) -> Result<PathBuf, BundleError> {
    if name.is_empty() {
        return Err(BundleError::ForbiddenEntry(name.to_string()));
    }
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(BundleError::ForbiddenEntry(name.to_string()));
    }
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(BundleError::ForbiddenEntry(name.to_string()));
    }
    let path = PathBuf::from(&normalized);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => return Err(BundleError::ForbiddenEntry(name.to_string())),
        }
    }
    Ok(path)
}

fn is_noise_directory(name: &str) -> bool {
    name.starts_with("__MACOSX") || name.starts_with('.')
}

/// The manifest lives either at the extraction root or in exactly one
/// non-noise subdirectory (zips often wrap a single top folder).
async fn resolve_toolkit_root(source_dir: &Path) -> Result<PathBuf, BundleError> {
    if tokio::fs::try_exists(source_dir.join("toolkit.json")).await? {
        return Ok(source_dir.to_path_buf());
    }

    let mut candidates = Vec::new();
    let mut entries = match tokio::fs::read_dir(source_dir).await {
        Ok(entries) => entries,
        Err(_) => {
            return Err(BundleError::Manifest(
                "toolkit.json manifest not found".to_string(),
            ));
        }
    };
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_noise_directory(&name) {
            continue;
        }
        if tokio::fs::try_exists(entry.path().join("toolkit.json")).await? {
            candidates.push(entry.path());
        }
    }

    if candidates.len() == 1 {
        return Ok(candidates.remove(0));
    }
    Err(BundleError::Manifest(
        "toolkit.json manifest not found".to_string(),
    ))
}

async fn load_manifest(path: &Path) -> Result<Manifest, BundleError> {
    if !tokio::fs::try_exists(path).await? {
        return Err(BundleError::Manifest(
            "toolkit.json manifest not found".to_string(),
        ));
    }
    let raw = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&raw)
        .map_err(|err| BundleError::Manifest(format!("Invalid toolkit.json: {err}")))
}

async fn resolve_frontend_entry(
    toolkit_root: &Path,
    declared: Option<&str>,
    default: &str,
    label: &str,
) -> Result<Option<String>, BundleError> {
    match declared {
        Some(raw) => {
            let normalized = raw.replace('\\', "/");
            if !tokio::fs::try_exists(toolkit_root.join(&normalized)).await? {
                return Err(BundleError::Manifest(format!(
                    "{label} '{normalized}' declared in toolkit.json was not found in the bundle"
                )));
            }
            Ok(Some(normalized))
        }
        None => {
            if tokio::fs::try_exists(toolkit_root.join(default)).await? {
                Ok(Some(default.to_string()))
            } else {
                Ok(None)
            }
        }
    }
}

/// Every entry under the root must be a regular file or directory and
/// must resolve inside the root; symlink chains cannot escape.
pub async fn validate_toolkit_tree(toolkit_root: &Path) -> Result<(), BundleError> {
    let meta = tokio::fs::symlink_metadata(toolkit_root).await?;
    if !meta.is_dir() {
        return Err(BundleError::Manifest(
            "Toolkit root is not a directory".to_string(),
        ));
    }
    let root_resolved = tokio::fs::canonicalize(toolkit_root).await?;

    let mut pending = vec![toolkit_root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = tokio::fs::symlink_metadata(&path).await?;
            if meta.file_type().is_symlink() {
                return Err(BundleError::Manifest(format!(
                    "Toolkit bundle may not contain symbolic links (found: {})",
                    entry.file_name().to_string_lossy()
                )));
            }
            let resolved = tokio::fs::canonicalize(&path).await?;
            if !resolved.starts_with(&root_resolved) {
                return Err(BundleError::Manifest(format!(
                    "Toolkit bundle contains entry outside the root: {}",
                    path.display()
                )));
            }
            if meta.is_dir() {
                pending.push(path);
            } else if !meta.is_file() {
                return Err(BundleError::Manifest(format!(
                    "Toolkit bundle contains unsupported file type: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

/// Recursive directory copy preserving permissions.
async fn copy_tree(source: &Path, dest: &Path) -> Result<(), BundleError> {
    tokio::fs::create_dir_all(dest).await?;
    let mut pending = vec![(source.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                tokio::fs::create_dir_all(&target).await?;
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

fn title_case_slug(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use crate::jobs::{HandlerRegistry, JobStore};
    use crate::kv::{Kv, MemoryKv};
    use crate::taskbus::MemoryTaskBus;
    use crate::toolkits::ToolkitRegistry;
    use crate::toolkits::plugins::PluginEnv;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    fn limits() -> BundleLimits {
        BundleLimits {
            upload_max_bytes: 1024 * 1024,
            bundle_max_bytes: 1024 * 1024,
            bundle_max_file_bytes: 64 * 1024,
        }
    }

    fn installer(storage: &Path) -> BundleInstaller {
        let db = Arc::new(MemoryDb::new());
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let registry = ToolkitRegistry::new(db, kv.clone(), "opsdeck");
        let env = PluginEnv {
            kv: kv.clone(),
            jobs: JobStore::new(kv, "opsdeck"),
            bus: Arc::new(MemoryTaskBus::new()),
            queue: "opsdeck".to_string(),
            prefix: "opsdeck".to_string(),
            worker_side: false,
        };
        let loader = Arc::new(ToolkitLoader::new(
            registry,
            Arc::new(HandlerRegistry::new()),
            env,
        ));
        BundleInstaller::new(loader, storage.to_path_buf(), limits())
    }

    /// Build a zip on disk with `(name, contents)` entries.
    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip_writer::ZipWriter::new(file);
        for (name, contents) in entries {
            zip.add_entry(name, contents);
        }
        zip.finish();
    }

    /// Minimal stored (uncompressed) zip writer for test fixtures.
    mod zip_writer {
        use std::io::Write;

        pub struct ZipWriter<W: Write> {
            out: W,
            offset: u32,
            central: Vec<u8>,
            count: u16,
        }

        impl<W: Write> ZipWriter<W> {
            pub fn new(out: W) -> Self {
                Self {
                    out,
                    offset: 0,
                    central: Vec::new(),
                    count: 0,
                }
            }

            pub fn add_entry(&mut self, name: &str, contents: &[u8]) {
                let crc = crc32(contents);
                let name_bytes = name.as_bytes();
                let header_offset = self.offset;

                let mut local = Vec::new();
                local.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
                local.extend_from_slice(&20u16.to_le_bytes()); // version needed
                local.extend_from_slice(&0u16.to_le_bytes()); // flags
                local.extend_from_slice(&0u16.to_le_bytes()); // stored
                local.extend_from_slice(&0u16.to_le_bytes()); // mod time
                local.extend_from_slice(&0u16.to_le_bytes()); // mod date
                local.extend_from_slice(&crc.to_le_bytes());
                local.extend_from_slice(&(contents.len() as u32).to_le_bytes());
                local.extend_from_slice(&(contents.len() as u32).to_le_bytes());
                local.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
                local.extend_from_slice(&0u16.to_le_bytes()); // extra len
                local.extend_from_slice(name_bytes);
                local.extend_from_slice(contents);
                self.out.write_all(&local).unwrap();
                self.offset += local.len() as u32;

                self.central
                    .extend_from_slice(&0x0201_4b50u32.to_le_bytes());
                self.central.extend_from_slice(&20u16.to_le_bytes()); // made by
                self.central.extend_from_slice(&20u16.to_le_bytes()); // needed
                self.central.extend_from_slice(&0u16.to_le_bytes());
                self.central.extend_from_slice(&0u16.to_le_bytes());
                self.central.extend_from_slice(&0u16.to_le_bytes());
                self.central.extend_from_slice(&0u16.to_le_bytes());
                self.central.extend_from_slice(&crc.to_le_bytes());
                self.central
                    .extend_from_slice(&(contents.len() as u32).to_le_bytes());
                self.central
                    .extend_from_slice(&(contents.len() as u32).to_le_bytes());
                self.central
                    .extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
                self.central.extend_from_slice(&0u16.to_le_bytes());
                self.central.extend_from_slice(&0u16.to_le_bytes());
                self.central.extend_from_slice(&0u16.to_le_bytes());
                self.central.extend_from_slice(&0u16.to_le_bytes());
                self.central.extend_from_slice(&0u32.to_le_bytes()); // ext attrs
                self.central
                    .extend_from_slice(&header_offset.to_le_bytes());
                self.central.extend_from_slice(name_bytes);
                self.count += 1;
            }

            pub fn finish(mut self) {
                let central_offset = self.offset;
                self.out.write_all(&self.central).unwrap();
                let mut eocd = Vec::new();
                eocd.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
                eocd.extend_from_slice(&0u16.to_le_bytes());
                eocd.extend_from_slice(&0u16.to_le_bytes());
                eocd.extend_from_slice(&self.count.to_le_bytes());
                eocd.extend_from_slice(&self.count.to_le_bytes());
                eocd.extend_from_slice(&(self.central.len() as u32).to_le_bytes());
                eocd.extend_from_slice(&central_offset.to_le_bytes());
                eocd.extend_from_slice(&0u16.to_le_bytes());
                self.out.write_all(&eocd).unwrap();
                self.out.flush().unwrap();
            }
        }

        fn crc32(data: &[u8]) -> u32 {
            let mut crc = 0xFFFF_FFFFu32;
            for byte in data {
                crc ^= *byte as u32;
                for _ in 0..8 {
                    let mask = (crc & 1).wrapping_neg();
                    crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
                }
            }
            !crc
        }
    }

    #[test]
    fn entry_names_are_policed() {
        assert!(validate_entry_name("backend/app.py").is_ok());
        assert!(validate_entry_name("toolkit.json").is_ok());
        assert!(validate_entry_name("../../evil.txt").is_err());
        assert!(validate_entry_name("/etc/passwd").is_err());
        assert!(validate_entry_name("C:evil.txt").is_err());
        assert!(validate_entry_name("a/../b").is_err());
        assert!(validate_entry_name("").is_err());
    }

    #[tokio::test]
    async fn upload_over_cap_is_rejected_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(dir.path());

        let big = bytes::Bytes::from(vec![0u8; 2 * 1024 * 1024]);
        let stream = futures::stream::iter(vec![Ok(big)]);
        let err = installer
            .write_upload_to_disk("huge.zip", stream)
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::UploadTooLarge));
        assert!(!dir.path().join("huge.zip").exists());
    }

    #[tokio::test]
    async fn upload_name_is_sanitized_to_basename() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(dir.path());

        let stream = futures::stream::iter(vec![Ok(bytes::Bytes::from_static(b"zipzip"))]);
        let path = installer
            .write_upload_to_disk("../../escape.zip", stream)
            .await
            .unwrap();
        assert_eq!(path.parent().unwrap(), dir.path());
        assert_eq!(path.file_name().unwrap(), "escape.zip");
    }

    #[tokio::test]
    async fn traversal_entries_abort_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(dir.path());

        let bundle = dir.path().join("evil.zip");
        write_zip(
            &bundle,
            &[
                ("toolkit.json", br#"{"slug": "evil"}"# as &[u8]),
                ("../../evil.txt", b"pwned"),
            ],
        );

        let err = installer
            .install_uploaded_bundle(&bundle, None, ToolkitOrigin::Uploaded, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::Bundle(BundleError::ForbiddenEntry(_))
        ));
        // Nothing escaped and nothing was registered.
        assert!(!dir.path().parent().unwrap().join("evil.txt").exists());
        assert!(
            installer
                .loader
                .registry()
                .get("evil")
                .await
                .unwrap()
                .is_none()
        );
        // The failed bundle was cleaned up.
        assert!(!bundle.exists());
    }

    #[tokio::test]
    async fn per_file_cap_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(dir.path());

        let exact = vec![b'a'; 64 * 1024];
        let bundle = dir.path().join("exact.zip");
        write_zip(
            &bundle,
            &[
                ("toolkit.json", br#"{"slug": "exact"}"# as &[u8]),
                ("payload.bin", exact.as_slice()),
            ],
        );
        installer
            .install_uploaded_bundle(&bundle, None, ToolkitOrigin::Uploaded, false)
            .await
            .unwrap();

        let over = vec![b'a'; 64 * 1024 + 1];
        let bundle = dir.path().join("over.zip");
        write_zip(
            &bundle,
            &[
                ("toolkit.json", br#"{"slug": "over"}"# as &[u8]),
                ("payload.bin", over.as_slice()),
            ],
        );
        let err = installer
            .install_uploaded_bundle(&bundle, None, ToolkitOrigin::Uploaded, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::Bundle(BundleError::FileTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn install_registers_record_and_keeps_archive() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(dir.path());

        let bundle = dir.path().join("demo-upload.zip");
        write_zip(
            &bundle,
            &[(
                "toolkit.json",
                br#"{"slug": "demo", "name": "Demo Toolkit", "base_path": "toolkits/demo"}"#
                    as &[u8],
            )],
        );

        let outcome = installer
            .install_uploaded_bundle(&bundle, Some("demo"), ToolkitOrigin::Uploaded, false)
            .await
            .unwrap();
        assert_eq!(outcome.record.slug, "demo");
        assert_eq!(outcome.record.base_path, "/toolkits/demo");
        assert!(!outcome.record.enabled);
        assert_eq!(outcome.bundle_path.unwrap(), dir.path().join("demo.zip"));
        assert!(dir.path().join("demo").join("toolkit.json").exists());
        // Scratch area is gone.
        assert!(!dir.path().join(UPLOADS_DIR).join("demo").exists());
    }

    #[tokio::test]
    async fn slug_override_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(dir.path());

        let bundle = dir.path().join("demo.zip");
        write_zip(&bundle, &[("toolkit.json", br#"{"slug": "demo"}"# as &[u8])]);
        let err = installer
            .install_uploaded_bundle(&bundle, Some("other"), ToolkitOrigin::Uploaded, false)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::Bundle(BundleError::Manifest(_))));
    }

    #[tokio::test]
    async fn declared_frontend_entry_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(dir.path());

        let bundle = dir.path().join("fe.zip");
        write_zip(
            &bundle,
            &[(
                "toolkit.json",
                br#"{"slug": "fe", "frontend": {"entry": "frontend/dist/app.js"}}"# as &[u8],
            )],
        );
        let err = installer
            .install_uploaded_bundle(&bundle, None, ToolkitOrigin::Uploaded, false)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::Bundle(BundleError::Manifest(_))));
    }

    #[tokio::test]
    async fn missing_source_entry_defaults_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(dir.path());

        let bundle = dir.path().join("fe2.zip");
        write_zip(
            &bundle,
            &[
                ("toolkit.json", br#"{"slug": "fe2"}"# as &[u8]),
                ("frontend/index.tsx", b"export default null;"),
            ],
        );
        let outcome = installer
            .install_uploaded_bundle(&bundle, None, ToolkitOrigin::Uploaded, false)
            .await
            .unwrap();
        assert_eq!(
            outcome.record.frontend_source_entry.as_deref(),
            Some("frontend/index.tsx")
        );
        assert!(outcome.record.frontend_entry.is_none());
    }

    #[tokio::test]
    async fn wrapped_single_directory_is_unwrapped() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(dir.path());

        let bundle = dir.path().join("wrapped.zip");
        write_zip(
            &bundle,
            &[(
                "wrapped-1.0/toolkit.json",
                br#"{"slug": "wrapped", "name": "Wrapped"}"# as &[u8],
            )],
        );
        let outcome = installer
            .install_uploaded_bundle(&bundle, None, ToolkitOrigin::Uploaded, false)
            .await
            .unwrap();
        assert_eq!(outcome.record.slug, "wrapped");
        assert!(dir.path().join("wrapped").join("toolkit.json").exists());
    }

    #[tokio::test]
    async fn symlink_in_tree_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        std::fs::create_dir_all(&root).unwrap();
        let mut manifest = std::fs::File::create(root.join("toolkit.json")).unwrap();
        manifest.write_all(br#"{"slug": "demo"}"#).unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink("/etc/passwd", root.join("link")).unwrap();
            let err = validate_toolkit_tree(&root).await.unwrap_err();
            assert!(err.to_string().contains("symbolic links"));
        }
    }
}
