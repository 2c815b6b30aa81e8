use crate::keypath::KeyPath;
use crate::registry::{CommandKind, CommandRegistry};
use crate::types::{TargetId, UnitId};
use crate::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SETTINGS_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported settings_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("inventory.targets must not be empty")]
    EmptyInventory,
    #[error("target '{0}' is listed more than once in the inventory")]
    DuplicateTarget(String),
    #[error("inventory.local '{0}' is not an inventory target")]
    UnknownLocalTarget(String),
    #[error("invalid settings: {0}")]
    Invalid(String),
    #[error("invalid settings: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub settings_version: u32,
    pub inventory: InventorySection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub packages: PackagesSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub firmware: FirmwareSection,
    #[serde(default)]
    pub ssl: SslSection,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InventorySection {
    pub targets: Vec<TargetId>,
    /// The node that runs controller-side work (file staging, firmware
    /// scripts). Defaults to the first inventory target.
    #[serde(default)]
    pub local: Option<TargetId>,
}

impl InventorySection {
    pub fn local_target(&self) -> Option<&TargetId> {
        self.local.as_ref().or_else(|| self.targets.first())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Directory holding change-unit scripts for the shell backend.
    #[serde(default)]
    pub units_dir: Option<PathBuf>,
    /// Prefix used to reach a target, e.g. `ssh -o BatchMode=yes {target}`.
    #[serde(default)]
    pub remote_shell: Option<String>,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub mock: MockSection,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            units_dir: None,
            remote_shell: None,
            parallelism: default_parallelism(),
            mock: MockSection::default(),
        }
    }
}

/// Failure injection for the mock backend. Entries are `unit@target`, or a
/// bare `unit` to fail on every target.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MockSection {
    #[serde(default)]
    pub failing: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackagesSection {
    /// Components updated in order by `update`.
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default = "default_unit_template")]
    pub unit_template: String,
    /// Prints an opaque package-manager checkpoint on the target.
    #[serde(default)]
    pub checkpoint_cmd: Option<String>,
    /// Restores a checkpoint; `{checkpoint}` is substituted.
    #[serde(default)]
    pub rollback_cmd: Option<String>,
}

impl Default for PackagesSection {
    fn default() -> Self {
        Self {
            components: Vec::new(),
            unit_template: default_unit_template(),
            checkpoint_cmd: None,
            rollback_cmd: None,
        }
    }
}

impl PackagesSection {
    pub fn update_unit(&self, component: &str) -> Result<UnitId, ValidationError> {
        UnitId::parse(&self.unit_template.replace("{component}", component))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PathsSection {
    #[serde(default = "default_file_roots")]
    pub file_roots: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            file_roots: default_file_roots(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FirmwareSection {
    /// Controller CLI script, relative to `paths.file_roots`.
    #[serde(default = "default_firmware_script")]
    pub script: String,
    #[serde(default = "default_controller_key")]
    pub controller_key: KeyPath,
}

impl Default for FirmwareSection {
    fn default() -> Self {
        Self {
            script: default_firmware_script(),
            controller_key: default_controller_key(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SslSection {
    #[serde(default = "default_ssl_unit")]
    pub unit: UnitId,
    /// Certificate destination, relative to `paths.file_roots`.
    #[serde(default = "default_ssl_dest")]
    pub dest: String,
    #[serde(default)]
    pub restart_unit: Option<UnitId>,
}

impl Default for SslSection {
    fn default() -> Self {
        Self {
            unit: default_ssl_unit(),
            dest: default_ssl_dest(),
            restart_unit: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CommandSection {
    #[serde(default)]
    pub kind: CommandKind,
    /// Key prefixes the command may write.
    pub keys: Vec<KeyPath>,
    #[serde(default)]
    pub pre: Vec<UnitId>,
    #[serde(default)]
    pub post: Vec<UnitId>,
}

fn default_backend() -> String {
    "shell".to_owned()
}

fn default_parallelism() -> usize {
    8
}

fn default_unit_template() -> String {
    "components.{component}.update".to_owned()
}

fn default_file_roots() -> PathBuf {
    PathBuf::from("/srv/stagehand/files")
}

fn default_firmware_script() -> String {
    "components/controller/files/script/controller_cli.sh".to_owned()
}

fn default_controller_key() -> KeyPath {
    KeyPath::parse("cluster/storage_enclosure/controller")
        .unwrap_or_else(|_| unreachable!("static key path is well formed"))
}

fn default_ssl_unit() -> UnitId {
    UnitId::new("components.misc_pkgs.ssl_certs")
}

fn default_ssl_dest() -> String {
    "ssl/stx.pem".to_owned()
}

impl Settings {
    /// Structural checks that serde cannot express. Runs once at load time.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.settings_version != SETTINGS_VERSION {
            return Err(SettingsError::UnsupportedVersion(self.settings_version));
        }
        if self.inventory.targets.is_empty() {
            return Err(SettingsError::EmptyInventory);
        }
        let mut seen = BTreeSet::new();
        for target in &self.inventory.targets {
            TargetId::parse(target)?;
            if !seen.insert(target.as_str()) {
                return Err(SettingsError::DuplicateTarget(target.to_string()));
            }
        }
        if let Some(local) = &self.inventory.local {
            if !seen.contains(local.as_str()) {
                return Err(SettingsError::UnknownLocalTarget(local.to_string()));
            }
        }
        if self.runtime.parallelism == 0 {
            return Err(SettingsError::Invalid(
                "runtime.parallelism must be at least 1".to_owned(),
            ));
        }
        if !self.packages.unit_template.contains("{component}") {
            return Err(SettingsError::Invalid(
                "packages.unit_template must contain '{component}'".to_owned(),
            ));
        }
        for component in &self.packages.components {
            self.packages.update_unit(component)?;
        }
        UnitId::parse(&self.ssl.unit)?;
        if let Some(unit) = &self.ssl.restart_unit {
            UnitId::parse(unit)?;
        }
        if self.ssl.dest.is_empty() || Path::new(&self.ssl.dest).is_absolute() {
            return Err(SettingsError::Invalid(
                "ssl.dest must be a relative path".to_owned(),
            ));
        }
        // Building the registry checks every command entry.
        CommandRegistry::from_settings(self)?;
        Ok(())
    }
}

pub fn parse_settings_str(input: &str) -> Result<Settings, SettingsError> {
    let settings: Settings = toml::from_str(input)?;
    settings.validate()?;
    Ok(settings)
}

pub fn load_settings_file(path: impl AsRef<Path>) -> Result<Settings, SettingsError> {
    let content = fs::read_to_string(path)?;
    parse_settings_str(&content)
}
