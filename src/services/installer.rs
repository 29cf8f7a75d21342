use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{EngineError, Result};
use crate::models::{
    IndexedFile, Instance, InstanceModifications, InvalidFile, ModOverride, ModpackFile,
    ModpackVersionManifest, TARGET_MODLOADER,
};
use crate::services::content_cache::ContentCache;
use crate::services::download_task::{DownloadTask, TEMP_PREFIX};
use crate::services::http::HttpDownloader;
use crate::services::instance_store::{InstanceStore, META_DIR};
use crate::services::progress::{
    InstallStage, ProgressTracker, TaskProgressAggregator, STEPS_UNKNOWN,
};
use crate::services::task_runner::{CancellationToken, ParallelTaskRunner};
use crate::services::validation::{DownloadValidation, FileValidation, HashFunction};
use crate::utils::hash::compute_sha1_file;
use crate::utils::paths::{is_safe_relative_path, normalize_relative_path};

/// Folders whose contents users actively manage; only these are scanned for
/// untracked files.
const TRACKED_DIRS: &[&str] = &["mods"];

const DISABLED_SUFFIX: &str = ".disabled";
const OVERRIDES_PREFIX: &str = "overrides/";
const CF_ARCHIVE_NAME: &str = "cf-overrides.zip";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationType {
    FreshInstall,
    Upgrade,
    Validate,
}

#[derive(Clone, Debug)]
pub struct ModLoaderSpec {
    pub name: String,
    pub version: String,
}

/// Out-of-scope loader-specific installation; this engine only sequences
/// the call and records the resolved version string.
#[async_trait]
pub trait ModLoaderInstaller: Send + Sync {
    async fn install(
        &self,
        instance_dir: &Path,
        game_version: &str,
        loader_name: &str,
        loader_version: &str,
    ) -> Result<String>;
}

/// Transient plan for one install/upgrade/validate run; consumed by
/// `execute` and discarded.
pub struct InstallOperation {
    pub operation_type: OperationType,
    pub invalid_files: Vec<InvalidFile>,
    /// Files in tracked folders that belong to neither the manifest nor the
    /// removal plan. Surfaced to the user, never auto-deleted.
    pub untracked_files: Vec<String>,
    pub files_to_remove: Vec<PathBuf>,
    pub files_to_download: Vec<DownloadTask>,
    /// New file id to old file id, matched by shared project id. Lets an
    /// override created under the old id survive re-keying.
    pub file_update_map: HashMap<i64, i64>,
    pub new_overrides: Vec<ModOverride>,
    pub mod_loader: Option<ModLoaderSpec>,
    pub game_version: String,
    pub total_download_bytes: u64,
    cf_extract: Option<DownloadTask>,
    new_manifest: ModpackVersionManifest,
}

pub struct InstanceInstaller {
    store: InstanceStore,
    cache: ContentCache,
    client: Arc<dyn HttpDownloader>,
    loader_installer: Arc<dyn ModLoaderInstaller>,
    tracker: Arc<ProgressTracker>,
    token: CancellationToken,
    thread_limit: usize,
}

impl InstanceInstaller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: InstanceStore,
        cache: ContentCache,
        client: Arc<dyn HttpDownloader>,
        loader_installer: Arc<dyn ModLoaderInstaller>,
        tracker: Arc<ProgressTracker>,
        token: CancellationToken,
        thread_limit: usize,
    ) -> Self {
        Self {
            store,
            cache,
            client,
            loader_installer,
            tracker,
            token,
            thread_limit,
        }
    }

    /// Diffs the declarative manifest against the instance's real state and
    /// builds the execution plan. Read-only apart from progress reporting.
    pub fn prepare(
        &self,
        instance: &Instance,
        new_manifest: ModpackVersionManifest,
    ) -> Result<InstallOperation> {
        self.token.check()?;
        self.tracker.next_stage(InstallStage::Prepare, STEPS_UNKNOWN)?;

        let old_manifest = match instance.properties.installed_version {
            Some(_) => instance.manifest.as_ref(),
            None => None,
        };
        let operation_type = match old_manifest {
            None => OperationType::FreshInstall,
            Some(old) if old.id == new_manifest.id => OperationType::Validate,
            Some(_) => OperationType::Upgrade,
        };
        tracing::info!(
            "preparing {:?} of instance {} to manifest {}",
            operation_type,
            instance.uuid,
            new_manifest.id
        );

        let new_files = self.flatten_manifest(&new_manifest, &instance.dir)?;

        let mut invalid_files = Vec::new();
        let mut files_to_remove = Vec::new();
        let mut file_update_map = HashMap::new();
        let mut new_overrides = instance.modifications.overrides.clone();

        match (operation_type, old_manifest) {
            (OperationType::FreshInstall, _) => {}
            (OperationType::Validate, _) => {
                invalid_files =
                    validate_files(&instance.dir, &new_files, &instance.modifications)?;
            }
            (OperationType::Upgrade, Some(old)) => {
                let old_files = self.flatten_manifest(old, &instance.dir)?;
                let plan = diff_for_upgrade(
                    &instance.dir,
                    old,
                    &old_files,
                    &new_manifest,
                    &new_files,
                    &instance.modifications,
                );
                files_to_remove = plan.files_to_remove;
                file_update_map = plan.file_update_map;
                new_overrides = plan.new_overrides;
            }
            // Upgrade is only ever derived from a present old manifest.
            (OperationType::Upgrade, None) => {}
        }

        // Paths are resolved against the overrides as they will stand after
        // this operation, not as they stood before it.
        let override_view = instance.modifications.with_overrides(new_overrides.clone());

        let untracked_files = detect_untracked(
            &instance.dir,
            &new_files,
            &override_view,
            &mut files_to_remove,
        )?;

        let mod_loader = new_manifest
            .find_target(TARGET_MODLOADER)?
            .map(|target| ModLoaderSpec {
                name: target.name.clone(),
                version: target.version.clone(),
            });
        let game_version = new_manifest.game_version()?;

        let mut files_to_download = Vec::new();
        let mut total_download_bytes = 0;
        for file in &new_manifest.files {
            if file.is_cf_extract() {
                continue;
            }
            let task = self.build_task(&instance.dir, file, &override_view)?;
            // Already-valid files are dropped from the schedule entirely.
            if task.is_redundant() {
                continue;
            }
            total_download_bytes += file.size;
            files_to_download.push(task);
        }

        let cf_extract = match new_manifest.cf_extract_file()? {
            Some(file) => Some(self.build_cf_task(&instance.dir, file)?),
            None => None,
        };

        Ok(InstallOperation {
            operation_type,
            invalid_files,
            untracked_files,
            files_to_remove,
            files_to_download,
            file_update_map,
            new_overrides,
            mod_loader,
            game_version,
            total_download_bytes,
            cf_extract,
            new_manifest,
        })
    }

    /// Runs the plan. Failures after deletions have begun leave the
    /// instance partially modified; there is no rollback, and a VALIDATE
    /// pass is the recovery path. Cancellation is checked between every
    /// major step.
    pub async fn execute(
        &self,
        instance: &mut Instance,
        operation: InstallOperation,
    ) -> Result<()> {
        wrap("remove", remove_files(&operation.files_to_remove))?;
        instance.modifications = instance
            .modifications
            .with_overrides(operation.new_overrides.clone());

        self.token.check()?;
        self.tracker.next_stage(InstallStage::ModLoader, 1)?;
        let resolved_loader = match &operation.mod_loader {
            Some(spec) => wrap(
                "mod loader",
                self.loader_installer
                    .install(
                        &instance.dir,
                        &operation.game_version,
                        &spec.name,
                        &spec.version,
                    )
                    .await,
            )?,
            // No loader target means vanilla; record the game version.
            None => operation.game_version.clone(),
        };
        instance.properties.mod_loader = resolved_loader;

        self.token.check()?;
        self.tracker
            .next_stage(InstallStage::Files, operation.files_to_download.len() as i64)?;
        self.tracker.set_overall_bytes(operation.total_download_bytes);
        wrap("download", self.run_downloads(&operation.files_to_download).await)?;

        self.token.check()?;
        if let Some(cf_task) = &operation.cf_extract {
            wrap("overrides archive", self.fetch_and_extract(instance, cf_task).await)?;
        }

        wrap("commit", self.commit(instance, &operation))?;
        self.tracker.finish();
        tracing::info!(
            "instance {} now at manifest {}",
            instance.uuid,
            operation.new_manifest.id
        );
        Ok(())
    }

    async fn run_downloads(&self, tasks: &[DownloadTask]) -> Result<()> {
        let aggregator = TaskProgressAggregator::new(Arc::clone(&self.tracker));
        let mut futures = Vec::new();
        for task in tasks.iter().cloned() {
            let client = Arc::clone(&self.client);
            let token = self.token.clone();
            let tracker = Arc::clone(&self.tracker);
            let mut handle = aggregator.task_handle();
            futures.push(async move {
                task.execute(client.as_ref(), &mut handle, &token).await?;
                tracker.step_done();
                Ok(())
            });
        }
        ParallelTaskRunner::new(self.thread_limit, self.token.clone())
            .run(futures)
            .await
    }

    async fn fetch_and_extract(&self, instance: &Instance, cf_task: &DownloadTask) -> Result<()> {
        let aggregator = TaskProgressAggregator::new(Arc::clone(&self.tracker));
        let mut handle = aggregator.task_handle();
        cf_task
            .execute(self.client.as_ref(), &mut handle, &self.token)
            .await?;
        extract_overrides(cf_task.dest(), &instance.dir)
    }

    fn commit(&self, instance: &mut Instance, operation: &InstallOperation) -> Result<()> {
        self.store
            .save_manifest(&instance.dir, &operation.new_manifest)?;
        instance.manifest = Some(operation.new_manifest.clone());
        instance.properties.installed_version = Some(operation.new_manifest.id);
        instance.properties.install_complete = true;
        self.store.save(instance)
    }

    /// Flattens a manifest into its path-to-file map, including virtual
    /// entries from the overrides archive when the archive is resolvable
    /// locally. Exactly one entry per relative path.
    fn flatten_manifest(
        &self,
        manifest: &ModpackVersionManifest,
        instance_dir: &Path,
    ) -> Result<HashMap<String, IndexedFile>> {
        let mut flattened = HashMap::new();
        for file in &manifest.files {
            if file.is_cf_extract() {
                continue;
            }
            let rel_path = file.instance_rel_path();
            let indexed = IndexedFile {
                rel_path: rel_path.clone(),
                file_id: file.id,
                tracked_mod: is_tracked_path(&rel_path),
                sha1: file.sha1.clone(),
                length: file.size,
            };
            if flattened.insert(rel_path.clone(), indexed).is_some() {
                return Err(EngineError::illegal_state(format!(
                    "manifest {} maps two files onto '{rel_path}'",
                    manifest.id
                )));
            }
        }

        if let Some(cf_file) = manifest.cf_extract_file()? {
            for entry in self.cf_virtual_entries(cf_file, instance_dir)? {
                flattened.entry(entry.rel_path.clone()).or_insert(entry);
            }
        }
        Ok(flattened)
    }

    /// Lists the overrides archive content as virtual indexed files. The
    /// archive is looked up in the cache or at its download destination; an
    /// unavailable archive simply contributes nothing.
    fn cf_virtual_entries(
        &self,
        cf_file: &ModpackFile,
        instance_dir: &Path,
    ) -> Result<Vec<IndexedFile>> {
        let archive = cf_file
            .sha1
            .as_deref()
            .and_then(|sha1| self.cache.get(sha1))
            .or_else(|| {
                let local = cf_archive_path(instance_dir);
                local.is_file().then_some(local)
            });
        let Some(archive) = archive else {
            tracing::debug!("overrides archive not available locally, skipping virtual entries");
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        let mut zip = zip::ZipArchive::new(File::open(&archive)?)?;
        for index in 0..zip.len() {
            let entry = zip.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let Some(rel) = entry.name().strip_prefix(OVERRIDES_PREFIX) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            entries.push(IndexedFile {
                rel_path: normalize_relative_path(rel),
                file_id: cf_file.id,
                tracked_mod: false,
                sha1: None,
                length: entry.size(),
            });
        }
        Ok(entries)
    }

    fn build_task(
        &self,
        instance_dir: &Path,
        file: &ModpackFile,
        modifications: &InstanceModifications,
    ) -> Result<DownloadTask> {
        let rel = effective_rel_path(file, modifications);
        self.task_for(file, instance_dir.join(&rel))
    }

    fn build_cf_task(&self, instance_dir: &Path, file: &ModpackFile) -> Result<DownloadTask> {
        self.task_for(file, cf_archive_path(instance_dir))
    }

    fn task_for(&self, file: &ModpackFile, dest: PathBuf) -> Result<DownloadTask> {
        let mut validation = FileValidation::of().with_expected_size(file.size);
        if let Some(sha1) = &file.sha1 {
            validation = validation.with_hash(HashFunction::Sha1, sha1.clone())?;
        }
        Ok(
            DownloadTask::new(file.url.clone(), dest, DownloadValidation::of(validation))
                .with_mirrors(file.mirrors.clone())
                .with_cache(self.cache.clone()),
        )
    }
}

struct UpgradePlan {
    files_to_remove: Vec<PathBuf>,
    file_update_map: HashMap<i64, i64>,
    new_overrides: Vec<ModOverride>,
}

/// Computes removals and override migration for an upgrade. Files whose
/// path vanished from the new manifest are deleted (after override
/// remapping, so a disabled file's `.disabled` sibling is what gets
/// removed); overrides follow their mod to its new file id via the shared
/// project id, or are dropped along with the file.
fn diff_for_upgrade(
    instance_dir: &Path,
    old_manifest: &ModpackVersionManifest,
    old_files: &HashMap<String, IndexedFile>,
    new_manifest: &ModpackVersionManifest,
    new_files: &HashMap<String, IndexedFile>,
    modifications: &InstanceModifications,
) -> UpgradePlan {
    let mut files_to_remove = Vec::new();
    for (rel_path, indexed) in old_files {
        if new_files.contains_key(rel_path) {
            continue;
        }
        let effective = remap_rel_path(rel_path, indexed.file_id, modifications);
        files_to_remove.push(instance_dir.join(effective));
    }

    let mut project_to_old: HashMap<i64, &ModpackFile> = HashMap::new();
    for file in &old_manifest.files {
        if let Some(project) = file.curse_project {
            project_to_old.insert(project, file);
        }
    }
    let mut file_update_map = HashMap::new();
    let mut old_id_to_new: HashMap<i64, &ModpackFile> = HashMap::new();
    for file in &new_manifest.files {
        let Some(project) = file.curse_project else { continue };
        if let Some(old_file) = project_to_old.get(&project) {
            file_update_map.insert(file.id, old_file.id);
            old_id_to_new.insert(old_file.id, file);
        }
    }

    let mut new_overrides = Vec::new();
    for entry in &modifications.overrides {
        if entry.state.is_added() {
            // User-added content is not manifest-tracked; it rides along.
            new_overrides.push(entry.clone());
            continue;
        }
        match old_id_to_new.get(&entry.file_id) {
            Some(new_file) if new_file.id == entry.file_id => new_overrides.push(entry.clone()),
            Some(new_file) => {
                new_overrides.push(entry.remapped(new_file.id, new_file.name.clone()));
            }
            // The mod left the pack; its override goes with it.
            None => {}
        }
    }

    UpgradePlan {
        files_to_remove,
        file_update_map,
        new_overrides,
    }
}

/// VALIDATE: checks every known file for existence, size and hash. Missing
/// files report `actual_len = -1` and no actual hash, distinguishing them
/// from corrupt ones.
fn validate_files(
    instance_dir: &Path,
    files: &HashMap<String, IndexedFile>,
    modifications: &InstanceModifications,
) -> Result<Vec<InvalidFile>> {
    let mut invalid = Vec::new();
    for (rel_path, indexed) in files {
        let effective = remap_rel_path(rel_path, indexed.file_id, modifications);
        let path = instance_dir.join(&effective);
        if !path.is_file() {
            invalid.push(InvalidFile::missing(
                rel_path.clone(),
                indexed.sha1.clone(),
                indexed.length,
            ));
            continue;
        }

        let actual_len = std::fs::metadata(&path)?.len();
        let mut actual_hash = None;
        let mut matches = actual_len == indexed.length;
        if matches {
            if let Some(expected) = &indexed.sha1 {
                let computed = compute_sha1_file(&path)?;
                matches = &computed == expected;
                actual_hash = Some(computed);
            }
        }
        if !matches {
            invalid.push(InvalidFile {
                rel_path: rel_path.clone(),
                expected_hash: indexed.sha1.clone(),
                actual_hash,
                expected_len: indexed.length,
                actual_len: actual_len as i64,
            });
        }
    }
    Ok(invalid)
}

/// Scans tracked content folders for files the manifest does not know
/// about. Works off the flattened path map so files placed by the
/// overrides archive count as known too. `__tmp_` leftovers from
/// interrupted downloads are deleted unconditionally; everything else is
/// reported, never auto-deleted.
fn detect_untracked(
    instance_dir: &Path,
    files: &HashMap<String, IndexedFile>,
    modifications: &InstanceModifications,
    files_to_remove: &mut Vec<PathBuf>,
) -> Result<Vec<String>> {
    let mut known: HashSet<String> = HashSet::new();
    for (rel_path, indexed) in files {
        known.insert(remap_rel_path(rel_path, indexed.file_id, modifications));
        known.insert(rel_path.clone());
    }
    let removal_set: HashSet<PathBuf> = files_to_remove.iter().cloned().collect();

    let mut untracked = Vec::new();
    for tracked in TRACKED_DIRS {
        let dir = instance_dir.join(tracked);
        if !dir.is_dir() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with(TEMP_PREFIX) {
                files_to_remove.push(entry.path().to_path_buf());
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(instance_dir) else {
                continue;
            };
            let rel = normalize_relative_path(&rel.to_string_lossy());
            if known.contains(&rel) || removal_set.contains(entry.path()) {
                continue;
            }
            untracked.push(rel);
        }
    }
    untracked.sort();
    Ok(untracked)
}

/// Applies a user's override to a manifest-declared path: DISABLED appends
/// the `.disabled` suffix, ENABLED strips it. This is how a user's
/// deviation survives comparison, deletion and download alike.
fn remap_rel_path(rel_path: &str, file_id: i64, modifications: &InstanceModifications) -> String {
    let entry = modifications.override_for_file_id(file_id).or_else(|| {
        rel_path
            .rsplit('/')
            .next()
            .and_then(|name| modifications.override_for_name(name))
    });
    match entry {
        Some(entry) if entry.state.is_disabled() && !rel_path.ends_with(DISABLED_SUFFIX) => {
            format!("{rel_path}{DISABLED_SUFFIX}")
        }
        Some(entry) if !entry.state.is_disabled() && rel_path.ends_with(DISABLED_SUFFIX) => {
            rel_path[..rel_path.len() - DISABLED_SUFFIX.len()].to_string()
        }
        _ => rel_path.to_string(),
    }
}

fn effective_rel_path(file: &ModpackFile, modifications: &InstanceModifications) -> String {
    remap_rel_path(&file.instance_rel_path(), file.id, modifications)
}

fn is_tracked_path(rel_path: &str) -> bool {
    TRACKED_DIRS
        .iter()
        .any(|dir| rel_path.starts_with(&format!("{dir}/")))
}

fn cf_archive_path(instance_dir: &Path) -> PathBuf {
    instance_dir.join(META_DIR).join(CF_ARCHIVE_NAME)
}

fn remove_files(files: &[PathBuf]) -> Result<()> {
    for path in files {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!("removed {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Extracts `overrides/` entries onto the instance directory. Existing
/// paths are skipped: never overwrite user content (a deliberate policy,
/// not an accident of ordering).
fn extract_overrides(archive: &Path, instance_dir: &Path) -> Result<()> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let Some(rel) = entry.name().strip_prefix(OVERRIDES_PREFIX).map(str::to_string) else {
            continue;
        };
        if rel.is_empty() {
            continue;
        }
        let rel_path = PathBuf::from(normalize_relative_path(&rel));
        if !is_safe_relative_path(&rel_path) {
            tracing::warn!("skipping unsafe archive entry {rel}");
            continue;
        }
        let dest = instance_dir.join(&rel_path);
        if dest.exists() {
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

/// Wraps a phase failure with its stage name; cancellation signals pass
/// through untouched so callers can tell the two apart.
fn wrap<T>(stage: &'static str, result: Result<T>) -> Result<T> {
    result.map_err(|err| {
        if err.is_cancelled() {
            err
        } else {
            EngineError::Installation {
                stage,
                source: Box::new(err),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use crate::models::{InstanceProperties, OverrideState, Target, CF_EXTRACT_TYPE, TARGET_GAME};
    use crate::services::download_task::test_support::FakeDownloader;
    use crate::services::progress::test_support::RecordingSink;
    use crate::services::progress::EventSink;
    use crate::utils::hash::compute_sha1_file;

    struct VanillaLoader;

    #[async_trait]
    impl ModLoaderInstaller for VanillaLoader {
        async fn install(
            &self,
            _instance_dir: &Path,
            game_version: &str,
            loader_name: &str,
            loader_version: &str,
        ) -> Result<String> {
            Ok(format!("{loader_name}-{game_version}-{loader_version}"))
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        store: InstanceStore,
        cache: ContentCache,
        client: Arc<FakeDownloader>,
        instance: Instance,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().expect("tempdir");
            let store = InstanceStore::new(root.path().join("instances"));
            let cache = ContentCache::new(root.path().join("cache")).expect("cache");
            let mut instance =
                Instance::new(PathBuf::new(), InstanceProperties::new("Fixture Pack"));
            instance.dir = store.instance_dir(instance.uuid);
            std::fs::create_dir_all(&instance.dir).expect("instance dir");
            Self {
                _root: root,
                store,
                cache,
                client: Arc::new(FakeDownloader::new()),
                instance,
            }
        }

        fn installer(&self) -> InstanceInstaller {
            let tracker = Arc::new(ProgressTracker::new(
                RecordingSink::new() as Arc<dyn EventSink>
            ));
            InstanceInstaller::new(
                self.store.clone(),
                self.cache.clone(),
                Arc::clone(&self.client) as Arc<dyn HttpDownloader>,
                Arc::new(VanillaLoader),
                tracker,
                CancellationToken::new(),
                2,
            )
        }

        fn installer_with_token(&self, token: CancellationToken) -> InstanceInstaller {
            let tracker = Arc::new(ProgressTracker::new(
                RecordingSink::new() as Arc<dyn EventSink>
            ));
            InstanceInstaller::new(
                self.store.clone(),
                self.cache.clone(),
                Arc::clone(&self.client) as Arc<dyn HttpDownloader>,
                Arc::new(VanillaLoader),
                tracker,
                token,
                2,
            )
        }

        fn serve_mod(&self, url: &str, bytes: &[u8]) -> (u64, String) {
            self.client.serve(url, bytes);
            let scratch = self._root.path().join("scratch.bin");
            std::fs::write(&scratch, bytes).expect("scratch");
            let sha1 = compute_sha1_file(&scratch).expect("hash");
            (bytes.len() as u64, sha1)
        }
    }

    fn mod_file(id: i64, name: &str, url: &str, size: u64, sha1: &str) -> ModpackFile {
        ModpackFile {
            id,
            path: "mods/".to_string(),
            name: name.to_string(),
            url: url.to_string(),
            mirrors: Vec::new(),
            sha1: Some(sha1.to_string()),
            size,
            file_type: "mod".to_string(),
            client_only: false,
            server_only: false,
            optional: false,
            curse_project: None,
            curse_file: None,
        }
    }

    fn manifest(id: i64, files: Vec<ModpackFile>) -> ModpackVersionManifest {
        ModpackVersionManifest {
            id,
            parent: 1,
            name: format!("1.0.{id}"),
            targets: vec![Target {
                id: 1,
                name: "minecraft".to_string(),
                target_type: TARGET_GAME.to_string(),
                version: "1.20.1".to_string(),
            }],
            files,
        }
    }

    async fn install(fixture: &mut Fixture, new_manifest: ModpackVersionManifest) {
        let installer = fixture.installer();
        let operation = installer
            .prepare(&fixture.instance, new_manifest)
            .expect("prepare");
        installer
            .execute(&mut fixture.instance, operation)
            .await
            .expect("execute");
    }

    #[tokio::test]
    async fn fresh_install_downloads_and_commits() {
        let mut fixture = Fixture::new();
        let (size, sha1) = fixture.serve_mod("https://cdn.invalid/alpha.jar", b"alpha bytes");
        let new_manifest = manifest(
            10,
            vec![mod_file(1, "alpha.jar", "https://cdn.invalid/alpha.jar", size, &sha1)],
        );

        let installer = fixture.installer();
        let operation = installer
            .prepare(&fixture.instance, new_manifest)
            .expect("prepare");
        assert_eq!(operation.operation_type, OperationType::FreshInstall);
        assert_eq!(operation.files_to_download.len(), 1);

        installer
            .execute(&mut fixture.instance, operation)
            .await
            .expect("execute");

        assert!(fixture.instance.dir.join("mods/alpha.jar").is_file());
        assert!(fixture.instance.properties.install_complete);
        assert_eq!(fixture.instance.properties.installed_version, Some(10));
        // Vanilla: no modloader target, so the game version is recorded.
        assert_eq!(fixture.instance.properties.mod_loader, "1.20.1");
        // The manifest became the version-of-record on disk.
        let persisted = fixture
            .store
            .load_manifest(&fixture.instance.dir)
            .expect("load manifest")
            .expect("present");
        assert_eq!(persisted.id, 10);
    }

    #[tokio::test]
    async fn validate_is_idempotent_on_a_valid_instance() {
        let mut fixture = Fixture::new();
        let (size, sha1) = fixture.serve_mod("https://cdn.invalid/alpha.jar", b"alpha bytes");
        let new_manifest = manifest(
            10,
            vec![mod_file(1, "alpha.jar", "https://cdn.invalid/alpha.jar", size, &sha1)],
        );
        install(&mut fixture, new_manifest.clone()).await;

        for _ in 0..2 {
            let installer = fixture.installer();
            let operation = installer
                .prepare(&fixture.instance, new_manifest.clone())
                .expect("prepare");
            assert_eq!(operation.operation_type, OperationType::Validate);
            assert!(operation.invalid_files.is_empty());
            assert!(operation.files_to_download.is_empty());
        }
    }

    #[tokio::test]
    async fn validate_distinguishes_missing_from_corrupt() {
        let mut fixture = Fixture::new();
        let (size_a, sha1_a) = fixture.serve_mod("https://cdn.invalid/a.jar", b"aaaa");
        let (size_b, sha1_b) = fixture.serve_mod("https://cdn.invalid/b.jar", b"bbbb");
        let new_manifest = manifest(
            10,
            vec![
                mod_file(1, "a.jar", "https://cdn.invalid/a.jar", size_a, &sha1_a),
                mod_file(2, "b.jar", "https://cdn.invalid/b.jar", size_b, &sha1_b),
            ],
        );
        install(&mut fixture, new_manifest.clone()).await;

        std::fs::remove_file(fixture.instance.dir.join("mods/a.jar")).expect("remove a");
        std::fs::write(fixture.instance.dir.join("mods/b.jar"), b"XXXX").expect("corrupt b");

        let installer = fixture.installer();
        let operation = installer
            .prepare(&fixture.instance, new_manifest)
            .expect("prepare");
        assert_eq!(operation.invalid_files.len(), 2);
        let missing = operation
            .invalid_files
            .iter()
            .find(|item| item.rel_path == "mods/a.jar")
            .expect("missing entry");
        assert!(missing.is_missing());
        assert_eq!(missing.actual_len, -1);
        let corrupt = operation
            .invalid_files
            .iter()
            .find(|item| item.rel_path == "mods/b.jar")
            .expect("corrupt entry");
        assert!(!corrupt.is_missing());
        // Both invalid files are rescheduled for repair.
        assert_eq!(operation.files_to_download.len(), 2);
    }

    #[tokio::test]
    async fn zero_byte_files_are_synthesized_and_stay_valid() {
        let mut fixture = Fixture::new();
        let mut empty = mod_file(1, "empty.jar", "https://cdn.invalid/never-fetched.jar", 0, "");
        empty.sha1 = None;
        let new_manifest = manifest(10, vec![empty]);
        install(&mut fixture, new_manifest.clone()).await;

        let dest = fixture.instance.dir.join("mods/empty.jar");
        assert!(dest.is_file());
        assert_eq!(std::fs::metadata(&dest).expect("meta").len(), 0);
        assert_eq!(fixture.client.call_count(), 0);

        let installer = fixture.installer();
        let operation = installer
            .prepare(&fixture.instance, new_manifest)
            .expect("prepare");
        assert_eq!(operation.operation_type, OperationType::Validate);
        assert!(operation.invalid_files.is_empty());
    }

    #[tokio::test]
    async fn untracked_detection_excludes_known_files_and_purges_temps() {
        let mut fixture = Fixture::new();
        let (size, sha1) = fixture.serve_mod("https://cdn.invalid/known.jar", b"known");
        let new_manifest = manifest(
            10,
            vec![mod_file(1, "known.jar", "https://cdn.invalid/known.jar", size, &sha1)],
        );
        install(&mut fixture, new_manifest.clone()).await;

        let mods_dir = fixture.instance.dir.join("mods");
        std::fs::write(mods_dir.join("extra.jar"), b"user dropped this in").expect("extra");
        std::fs::write(mods_dir.join("__tmp_crashed.jar"), b"partial").expect("temp");

        let installer = fixture.installer();
        let operation = installer
            .prepare(&fixture.instance, new_manifest)
            .expect("prepare");
        assert_eq!(operation.untracked_files, vec!["mods/extra.jar".to_string()]);
        assert!(operation
            .files_to_remove
            .contains(&mods_dir.join("__tmp_crashed.jar")));
        // A known file never shows up as both untracked and to-download.
        assert!(operation.files_to_download.is_empty());
    }

    #[tokio::test]
    async fn override_survives_upgrade_via_project_id() {
        let mut fixture = Fixture::new();
        let (size_old, sha1_old) = fixture.serve_mod("https://cdn.invalid/thing-1.0.jar", b"v1");
        let mut old_file = mod_file(
            1,
            "thing-1.0.jar",
            "https://cdn.invalid/thing-1.0.jar",
            size_old,
            &sha1_old,
        );
        old_file.curse_project = Some(42);
        let old_manifest = manifest(10, vec![old_file]);
        install(&mut fixture, old_manifest).await;

        // User disables the mod: the jar gains a .disabled suffix and an
        // override records the deviation.
        let mods_dir = fixture.instance.dir.join("mods");
        std::fs::rename(
            mods_dir.join("thing-1.0.jar"),
            mods_dir.join("thing-1.0.jar.disabled"),
        )
        .expect("disable");
        fixture.instance.modifications = fixture.instance.modifications.with_overrides(vec![
            ModOverride {
                state: OverrideState::Disabled,
                file_name: "thing-1.0.jar".to_string(),
                file_id: 1,
                sha1: Some(sha1_old),
                project_id: Some(42),
                version_id: None,
            },
        ]);

        let (size_new, sha1_new) = fixture.serve_mod("https://cdn.invalid/thing-1.1.jar", b"v2");
        let mut new_file = mod_file(
            2,
            "thing-1.1.jar",
            "https://cdn.invalid/thing-1.1.jar",
            size_new,
            &sha1_new,
        );
        new_file.curse_project = Some(42);
        let new_manifest = manifest(11, vec![new_file]);

        let installer = fixture.installer();
        let operation = installer
            .prepare(&fixture.instance, new_manifest)
            .expect("prepare");
        assert_eq!(operation.operation_type, OperationType::Upgrade);
        assert_eq!(operation.file_update_map.get(&2), Some(&1));

        let migrated = operation
            .new_overrides
            .iter()
            .find(|item| item.file_id == 2)
            .expect("override survived");
        assert_eq!(migrated.state, OverrideState::UpdatedDisabled);

        // The old disabled sibling is what gets deleted.
        assert!(operation
            .files_to_remove
            .contains(&mods_dir.join("thing-1.0.jar.disabled")));

        installer
            .execute(&mut fixture.instance, operation)
            .await
            .expect("execute");
        assert!(!mods_dir.join("thing-1.0.jar.disabled").exists());
        // The replacement downloads to its disabled name, honoring the
        // user's choice across the upgrade.
        assert!(mods_dir.join("thing-1.1.jar.disabled").is_file());
        assert_eq!(
            fixture
                .instance
                .modifications
                .override_for_file_id(2)
                .expect("committed override")
                .state,
            OverrideState::UpdatedDisabled
        );
    }

    #[tokio::test]
    async fn dropped_mods_take_their_overrides_with_them() {
        let mut fixture = Fixture::new();
        let (size, sha1) = fixture.serve_mod("https://cdn.invalid/gone.jar", b"gone");
        let mut old_file =
            mod_file(1, "gone.jar", "https://cdn.invalid/gone.jar", size, &sha1);
        old_file.curse_project = Some(77);
        let old_manifest = manifest(10, vec![old_file]);
        install(&mut fixture, old_manifest).await;

        fixture.instance.modifications = fixture.instance.modifications.with_overrides(vec![
            ModOverride {
                state: OverrideState::Enabled,
                file_name: "gone.jar".to_string(),
                file_id: 1,
                sha1: None,
                project_id: Some(77),
                version_id: None,
            },
        ]);

        let new_manifest = manifest(11, Vec::new());
        let installer = fixture.installer();
        let operation = installer
            .prepare(&fixture.instance, new_manifest)
            .expect("prepare");
        assert!(operation.new_overrides.is_empty());
        assert!(operation
            .files_to_remove
            .contains(&fixture.instance.dir.join("mods/gone.jar")));
    }

    #[tokio::test]
    async fn overrides_archive_extracts_without_clobbering() {
        let mut fixture = Fixture::new();

        let mut archive_bytes = Vec::new();
        {
            let mut writer =
                zip::ZipWriter::new(std::io::Cursor::new(&mut archive_bytes));
            let options = zip::write::FileOptions::default();
            writer
                .start_file("overrides/config/fresh.cfg", options)
                .expect("start fresh");
            writer.write_all(b"from archive").expect("write fresh");
            writer
                .start_file("overrides/config/existing.cfg", options)
                .expect("start existing");
            writer.write_all(b"archive version").expect("write existing");
            writer.finish().expect("finish zip");
        }
        let (size, sha1) = fixture.serve_mod("https://cdn.invalid/overrides.zip", &archive_bytes);

        let config_dir = fixture.instance.dir.join("config");
        std::fs::create_dir_all(&config_dir).expect("config dir");
        std::fs::write(config_dir.join("existing.cfg"), b"user version").expect("seed existing");

        let mut cf_file = mod_file(
            9,
            "overrides.zip",
            "https://cdn.invalid/overrides.zip",
            size,
            &sha1,
        );
        cf_file.path = String::new();
        cf_file.file_type = CF_EXTRACT_TYPE.to_string();
        let new_manifest = manifest(10, vec![cf_file]);
        install(&mut fixture, new_manifest).await;

        assert_eq!(
            std::fs::read(config_dir.join("fresh.cfg")).expect("read fresh"),
            b"from archive"
        );
        // Existing user content is never overwritten.
        assert_eq!(
            std::fs::read(config_dir.join("existing.cfg")).expect("read existing"),
            b"user version"
        );
    }

    #[tokio::test]
    async fn archive_placed_files_stay_known_on_later_runs() {
        let mut fixture = Fixture::new();

        let mut archive_bytes = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut archive_bytes));
            let options = zip::write::FileOptions::default();
            writer
                .start_file("overrides/mods/bundled.jar", options)
                .expect("start bundled");
            writer.write_all(b"bundled mod bytes").expect("write bundled");
            writer.finish().expect("finish zip");
        }
        let (size, sha1) = fixture.serve_mod("https://cdn.invalid/overrides.zip", &archive_bytes);

        let mut cf_file = mod_file(
            9,
            "overrides.zip",
            "https://cdn.invalid/overrides.zip",
            size,
            &sha1,
        );
        cf_file.path = String::new();
        cf_file.file_type = CF_EXTRACT_TYPE.to_string();
        let new_manifest = manifest(10, vec![cf_file]);
        install(&mut fixture, new_manifest.clone()).await;

        assert!(fixture.instance.dir.join("mods/bundled.jar").is_file());

        // A later pass must recognize the archive's files as manifest-known.
        let installer = fixture.installer();
        let operation = installer
            .prepare(&fixture.instance, new_manifest)
            .expect("prepare");
        assert_eq!(operation.operation_type, OperationType::Validate);
        assert!(operation.untracked_files.is_empty());
        assert!(operation.invalid_files.is_empty());
    }

    #[tokio::test]
    async fn cancellation_before_downloads_stops_the_run() {
        let mut fixture = Fixture::new();
        let (size, sha1) = fixture.serve_mod("https://cdn.invalid/alpha.jar", b"alpha bytes");
        let new_manifest = manifest(
            10,
            vec![mod_file(1, "alpha.jar", "https://cdn.invalid/alpha.jar", size, &sha1)],
        );

        let token = CancellationToken::new();
        let installer = fixture.installer_with_token(token.clone());
        let operation = installer
            .prepare(&fixture.instance, new_manifest)
            .expect("prepare");
        token.cancel();

        let err = installer
            .execute(&mut fixture.instance, operation)
            .await
            .expect_err("must cancel");
        assert!(err.is_cancelled());
        assert!(!fixture.instance.properties.install_complete);
    }

    #[tokio::test]
    async fn download_failures_surface_as_installation_errors() {
        let mut fixture = Fixture::new();
        // No canned response: every attempt at this URL fails.
        let new_manifest = manifest(
            10,
            vec![mod_file(
                1,
                "broken.jar",
                "https://cdn.invalid/broken.jar",
                4,
                "da39a3ee5e6b4b0d3255bfef95601890afd80709",
            )],
        );

        let installer = fixture.installer();
        let operation = installer
            .prepare(&fixture.instance, new_manifest)
            .expect("prepare");
        let err = installer
            .execute(&mut fixture.instance, operation)
            .await
            .expect_err("must fail");
        match err {
            EngineError::Installation { stage, .. } => assert_eq!(stage, "download"),
            other => panic!("expected installation error, got {other}"),
        }
        assert!(!fixture.instance.properties.install_complete);
    }
}
