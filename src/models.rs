use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{EngineError, Result};
use crate::utils::paths::join_relative;

/// Virtual file type for the CurseForge overrides archive. At most one file
/// of this type may appear in a manifest; it is downloaded like any other
/// file but extracted onto the instance directory instead of placed as-is.
pub const CF_EXTRACT_TYPE: &str = "cf-extract";

pub const TARGET_GAME: &str = "game";
pub const TARGET_MODLOADER: &str = "modloader";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModpackVersionManifest {
    pub id: i64,
    pub parent: i64,
    pub name: String,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub files: Vec<ModpackFile>,
}

impl ModpackVersionManifest {
    /// Finds the single target of the given type. Duplicate targets of one
    /// type are a manifest inconsistency, not a recoverable condition.
    pub fn find_target(&self, target_type: &str) -> Result<Option<&Target>> {
        let mut found: Option<&Target> = None;
        for target in &self.targets {
            if target.target_type == target_type {
                if found.is_some() {
                    return Err(EngineError::illegal_state(format!(
                        "manifest {} declares duplicate '{}' targets",
                        self.id, target_type
                    )));
                }
                found = Some(target);
            }
        }
        Ok(found)
    }

    pub fn game_version(&self) -> Result<String> {
        self.find_target(TARGET_GAME)?
            .map(|target| target.version.clone())
            .ok_or_else(|| {
                EngineError::illegal_state(format!("manifest {} has no game target", self.id))
            })
    }

    /// At most one cf-extract entry is allowed per manifest.
    pub fn cf_extract_file(&self) -> Result<Option<&ModpackFile>> {
        let mut found: Option<&ModpackFile> = None;
        for file in &self.files {
            if file.is_cf_extract() {
                if found.is_some() {
                    return Err(EngineError::illegal_state(format!(
                        "manifest {} declares more than one cf-extract file",
                        self.id
                    )));
                }
                found = Some(file);
            }
        }
        Ok(found)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModpackFile {
    pub id: i64,
    /// Directory portion, relative to the instance root ("mods/").
    pub path: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
    #[serde(default)]
    pub sha1: Option<String>,
    pub size: u64,
    #[serde(rename = "type")]
    pub file_type: String,
    #[serde(default)]
    pub client_only: bool,
    #[serde(default)]
    pub server_only: bool,
    #[serde(default)]
    pub optional: bool,
    /// CurseForge provenance, used to migrate overrides across versions.
    #[serde(default)]
    pub curse_project: Option<i64>,
    #[serde(default)]
    pub curse_file: Option<i64>,
}

impl ModpackFile {
    pub fn is_cf_extract(&self) -> bool {
        self.file_type == CF_EXTRACT_TYPE
    }

    /// Identity key for diffing. Ids can change across manifest versions for
    /// the same logical file; the normalized relative path cannot.
    pub fn instance_rel_path(&self) -> String {
        join_relative(&self.path, &self.name)
    }
}

/// Common representation produced by flattening a manifest (including
/// virtual entries from the CurseForge overrides archive) into a
/// path-to-file map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedFile {
    pub rel_path: String,
    pub file_id: i64,
    pub tracked_mod: bool,
    pub sha1: Option<String>,
    pub length: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverrideState {
    AddedEnabled,
    AddedDisabled,
    Enabled,
    Disabled,
    UpdatedEnabled,
    UpdatedDisabled,
}

impl OverrideState {
    pub fn is_disabled(self) -> bool {
        matches!(
            self,
            OverrideState::AddedDisabled | OverrideState::Disabled | OverrideState::UpdatedDisabled
        )
    }

    pub fn is_added(self) -> bool {
        matches!(self, OverrideState::AddedEnabled | OverrideState::AddedDisabled)
    }

    /// The state an override carries after being re-keyed to a new file id
    /// during an upgrade. Added states stay as they are; the rest become
    /// their updated counterparts.
    pub fn updated(self) -> OverrideState {
        match self {
            OverrideState::Enabled | OverrideState::UpdatedEnabled => OverrideState::UpdatedEnabled,
            OverrideState::Disabled | OverrideState::UpdatedDisabled => {
                OverrideState::UpdatedDisabled
            }
            other => other,
        }
    }
}

/// A recorded user deviation from the manifest-prescribed state of one file.
/// Immutable; remapping produces a new value rather than mutating in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModOverride {
    pub state: OverrideState,
    pub file_name: String,
    pub file_id: i64,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub version_id: Option<i64>,
}

impl ModOverride {
    pub fn remapped(&self, new_file_id: i64, new_file_name: String) -> ModOverride {
        ModOverride {
            state: self.state.updated(),
            file_name: new_file_name,
            file_id: new_file_id,
            sha1: self.sha1.clone(),
            project_id: self.project_id,
            version_id: self.version_id,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceModifications {
    #[serde(default)]
    pub overrides: Vec<ModOverride>,
    #[serde(default)]
    pub mod_loader_override: Option<String>,
}

impl InstanceModifications {
    pub fn override_for_file_id(&self, file_id: i64) -> Option<&ModOverride> {
        self.overrides.iter().find(|item| item.file_id == file_id)
    }

    pub fn override_for_name(&self, file_name: &str) -> Option<&ModOverride> {
        self.overrides.iter().find(|item| item.file_name == file_name)
    }

    /// Returns a copy with the given override list; callers never mutate the
    /// list in place so concurrent readers see a consistent snapshot.
    pub fn with_overrides(&self, overrides: Vec<ModOverride>) -> InstanceModifications {
        InstanceModifications {
            overrides,
            mod_loader_override: self.mod_loader_override.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceProperties {
    pub name: String,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub installed_version: Option<i64>,
    #[serde(default)]
    pub mod_loader: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub cloud_saves: bool,
    #[serde(default)]
    pub install_complete: bool,
}

impl InstanceProperties {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory_mb: None,
            installed_version: None,
            mod_loader: String::new(),
            locked: false,
            category: None,
            pinned: false,
            cloud_saves: false,
            install_complete: false,
        }
    }
}

/// One installed copy of a modpack. The uuid is the stable identity; the
/// directory and manifest are rehydrated by the instance store rather than
/// serialized into `instance.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub uuid: Uuid,
    #[serde(skip)]
    pub dir: PathBuf,
    pub properties: InstanceProperties,
    #[serde(default)]
    pub modifications: InstanceModifications,
    #[serde(skip)]
    pub manifest: Option<ModpackVersionManifest>,
}

impl Instance {
    pub fn new(dir: PathBuf, properties: InstanceProperties) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            dir,
            properties,
            modifications: InstanceModifications::default(),
            manifest: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Syncing,
    Unfinished,
    Synced,
}

/// Small metadata record arbitrating which side of a local/cloud pair is
/// authoritative during a sync pass.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncManifest {
    /// Epoch milliseconds of the last sync attempt.
    pub last_sync: i64,
    pub state: SyncState,
}

impl SyncManifest {
    pub fn new(last_sync: i64, state: SyncState) -> Self {
        Self { last_sync, state }
    }
}

/// A file that failed VALIDATE. `actual_hash = None` with `actual_len = -1`
/// means the file is missing rather than corrupt.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidFile {
    pub rel_path: String,
    pub expected_hash: Option<String>,
    pub actual_hash: Option<String>,
    pub expected_len: u64,
    pub actual_len: i64,
}

impl InvalidFile {
    pub fn missing(rel_path: String, expected_hash: Option<String>, expected_len: u64) -> Self {
        Self {
            rel_path,
            expected_hash,
            actual_hash: None,
            expected_len,
            actual_len: -1,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.actual_len < 0
    }
}
