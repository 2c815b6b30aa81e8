//! Named configuration commands declared in `stagehand.toml`.
//!
//! Each `[commands.<name>]` entry becomes a `CommandSpec`: the key prefixes it
//! may write plus the hooks run around the commit. The registry is built once
//! from validated settings and owned by the engine.

use crate::change::{ConfigChange, HookSet, TargetSelector};
use crate::keypath::KeyPath;
use crate::settings::{Settings, SettingsError};
use crate::types::validate_identifier;
use crate::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    #[default]
    Set,
    UpdateRepo,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Set => "set",
            CommandKind::UpdateRepo => "update-repo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    pub kind: CommandKind,
    pub keys: Vec<KeyPath>,
    pub hooks: HookSet,
}

impl CommandSpec {
    fn ensure_kind(&self, expected: CommandKind) -> Result<(), ValidationError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(ValidationError::CommandKind {
                command: self.name.clone(),
                expected: expected.as_str(),
                actual: self.kind.as_str(),
            })
        }
    }

    pub fn allows(&self, key: &KeyPath) -> bool {
        self.keys.iter().any(|prefix| prefix.contains(key))
    }

    /// Build a change from `key=value` assignments, rejecting keys outside
    /// the command's declared prefixes.
    pub fn build_change<S: AsRef<str>>(
        &self,
        assignments: &[S],
        targets: TargetSelector,
    ) -> Result<ConfigChange, ValidationError> {
        self.ensure_kind(CommandKind::Set)?;
        let change = ConfigChange::from_assignments(assignments, targets)?;
        if let Some(key) = change.keys().find(|key| !self.allows(key)) {
            return Err(ValidationError::KeyNotAllowed {
                command: self.name.clone(),
                key: key.to_string(),
            });
        }
        Ok(change)
    }

    /// Build the `<prefix>/<release>` entry of an update-repo command.
    pub fn build_repo_change(
        &self,
        release: &str,
        source: &RepoSource,
        targets: TargetSelector,
    ) -> Result<ConfigChange, ValidationError> {
        self.ensure_kind(CommandKind::UpdateRepo)?;
        validate_identifier("release", release)?;
        let prefix = self.keys.first().ok_or_else(|| {
            ValidationError::Source(format!("command '{}' declares no key prefix", self.name))
        })?;
        Ok(ConfigChange::single(
            prefix.join(release)?,
            source.value(),
            targets,
        ))
    }
}

/// Where an update repository comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoSource {
    Directory(PathBuf),
    Iso(PathBuf),
    Url(String),
    Remove,
}

impl RepoSource {
    /// Classify a user-supplied source. `None` or an empty string removes the
    /// release; anything with a URL scheme is kept as-is; everything else must
    /// be an existing local directory or file.
    pub fn classify(source: Option<&str>) -> Result<Self, ValidationError> {
        let Some(source) = source.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Self::Remove);
        };
        if source.contains("://") {
            return Ok(Self::Url(source.to_owned()));
        }
        let path = Path::new(source);
        if path.is_dir() {
            Ok(Self::Directory(path.to_path_buf()))
        } else if path.is_file() {
            Ok(Self::Iso(path.to_path_buf()))
        } else {
            Err(ValidationError::Source(format!(
                "repo source '{source}' is neither a URL nor an existing file or directory"
            )))
        }
    }

    /// Value recorded in the configuration store.
    pub fn value(&self) -> Value {
        match self {
            RepoSource::Directory(_) => Value::String("dir".to_owned()),
            RepoSource::Iso(_) => Value::String("iso".to_owned()),
            RepoSource::Url(url) => Value::String(url.clone()),
            RepoSource::Remove => Value::Null,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            RepoSource::Directory(p) | RepoSource::Iso(p) => Some(p),
            RepoSource::Url(_) | RepoSource::Remove => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, CommandSpec>,
}

impl CommandRegistry {
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        let mut commands = BTreeMap::new();
        let mut update_repo: Option<&str> = None;
        for (name, section) in &settings.commands {
            validate_identifier("command name", name)?;
            if section.keys.is_empty() {
                return Err(SettingsError::Invalid(format!(
                    "command '{name}' declares no keys"
                )));
            }
            if section.kind == CommandKind::UpdateRepo {
                if let Some(first) = update_repo {
                    return Err(SettingsError::Invalid(format!(
                        "commands '{first}' and '{name}' are both update-repo commands"
                    )));
                }
                if section.keys.len() != 1 {
                    return Err(SettingsError::Invalid(format!(
                        "update-repo command '{name}' must declare exactly one key prefix"
                    )));
                }
                update_repo = Some(name);
            }
            for unit in section.pre.iter().chain(&section.post) {
                validate_identifier("unit id", unit)?;
            }
            commands.insert(
                name.clone(),
                CommandSpec {
                    name: name.clone(),
                    kind: section.kind,
                    keys: section.keys.clone(),
                    hooks: HookSet::new(section.pre.clone(), section.post.clone()),
                },
            );
        }
        Ok(Self { commands })
    }

    pub fn get(&self, name: &str) -> Result<&CommandSpec, ValidationError> {
        self.commands
            .get(name)
            .ok_or_else(|| ValidationError::UnknownCommand(name.to_owned()))
    }

    pub fn update_repo(&self) -> Result<&CommandSpec, ValidationError> {
        self.commands
            .values()
            .find(|spec| spec.kind == CommandKind::UpdateRepo)
            .ok_or_else(|| ValidationError::UnknownCommand("update-repo".to_owned()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.values()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
