use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::models::{Instance, ModpackVersionManifest};
use crate::utils::fs::write_json_atomic;

pub const INSTANCE_FILE: &str = "instance.json";
pub const INSTANCE_BACKUP_FILE: &str = "instance.json.bak";
/// Metadata subdirectory inside every instance directory.
pub const META_DIR: &str = ".launchermeta";
/// Last successfully installed manifest, used as the "old manifest" for
/// future diffs.
pub const VERSION_FILE: &str = "version.json";

/// Durable persistence for instances: `instance.json` with a `.bak` crash
/// fallback, plus the version-of-record manifest under the metadata dir.
#[derive(Clone)]
pub struct InstanceStore {
    instances_dir: PathBuf,
}

impl InstanceStore {
    pub fn new(instances_dir: PathBuf) -> Self {
        Self { instances_dir }
    }

    pub fn instance_dir(&self, uuid: Uuid) -> PathBuf {
        self.instances_dir.join(uuid.to_string())
    }

    /// Writes `instance.json` atomically and refreshes the `.bak` copy.
    pub fn save(&self, instance: &Instance) -> Result<()> {
        fs::create_dir_all(&instance.dir)?;
        let primary = instance.dir.join(INSTANCE_FILE);
        write_json_atomic(&primary, instance)?;
        fs::copy(&primary, instance.dir.join(INSTANCE_BACKUP_FILE))?;
        Ok(())
    }

    /// Loads an instance record. The primary file is always tried first;
    /// when it is missing or corrupt the backup is used and, on success,
    /// copied back over the primary.
    pub fn load(&self, dir: &Path) -> Result<Instance> {
        let primary = dir.join(INSTANCE_FILE);
        let backup = dir.join(INSTANCE_BACKUP_FILE);

        let mut instance = match read_instance(&primary) {
            Ok(instance) => instance,
            Err(primary_err) => {
                tracing::warn!(
                    "failed to read {}, trying backup: {primary_err}",
                    primary.display()
                );
                let instance = read_instance(&backup).map_err(|_| {
                    EngineError::NotFound(format!(
                        "no readable instance record in {}",
                        dir.display()
                    ))
                })?;
                if let Err(err) = fs::copy(&backup, &primary) {
                    tracing::warn!("failed to restore instance.json from backup: {err}");
                }
                instance
            }
        };

        instance.dir = dir.to_path_buf();
        instance.manifest = self.load_manifest(dir)?;
        Ok(instance)
    }

    /// Commits the manifest as the instance's version-of-record.
    pub fn save_manifest(&self, dir: &Path, manifest: &ModpackVersionManifest) -> Result<()> {
        write_json_atomic(&dir.join(META_DIR).join(VERSION_FILE), manifest)
    }

    pub fn load_manifest(&self, dir: &Path) -> Result<Option<ModpackVersionManifest>> {
        let path = dir.join(META_DIR).join(VERSION_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

fn read_instance(path: &Path) -> Result<Instance> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceProperties;

    fn store_and_instance() -> (tempfile::TempDir, InstanceStore, Instance) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = InstanceStore::new(dir.path().to_path_buf());
        let mut instance = Instance::new(PathBuf::new(), InstanceProperties::new("Test Pack"));
        instance.dir = store.instance_dir(instance.uuid);
        (dir, store, instance)
    }

    #[test]
    fn save_load_round_trip() {
        let (_dir, store, mut instance) = store_and_instance();
        instance.properties.installed_version = Some(42);
        instance.properties.install_complete = true;
        store.save(&instance).expect("save");

        let loaded = store.load(&instance.dir).expect("load");
        assert_eq!(loaded.uuid, instance.uuid);
        assert_eq!(loaded.properties.installed_version, Some(42));
        assert!(loaded.properties.install_complete);
        assert_eq!(loaded.dir, instance.dir);
    }

    #[test]
    fn corrupt_primary_falls_back_to_backup_and_restores_it() {
        let (_dir, store, instance) = store_and_instance();
        store.save(&instance).expect("save");

        let primary = instance.dir.join(INSTANCE_FILE);
        fs::write(&primary, b"{ not json").expect("corrupt primary");

        let loaded = store.load(&instance.dir).expect("load via backup");
        assert_eq!(loaded.uuid, instance.uuid);

        // Primary was healed from the backup.
        let raw = fs::read_to_string(&primary).expect("read primary");
        assert!(serde_json::from_str::<serde_json::Value>(&raw).is_ok());
    }

    #[test]
    fn missing_both_records_is_not_found() {
        let (_dir, store, instance) = store_and_instance();
        assert!(matches!(
            store.load(&instance.dir),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn manifest_round_trip() {
        let (_dir, store, instance) = store_and_instance();
        fs::create_dir_all(&instance.dir).expect("mkdir");
        assert!(store.load_manifest(&instance.dir).expect("load none").is_none());

        let manifest = ModpackVersionManifest {
            id: 7,
            parent: 1,
            name: "1.2.3".to_string(),
            targets: Vec::new(),
            files: Vec::new(),
        };
        store.save_manifest(&instance.dir, &manifest).expect("save");
        let loaded = store
            .load_manifest(&instance.dir)
            .expect("load")
            .expect("present");
        assert_eq!(loaded.id, 7);
    }
}
