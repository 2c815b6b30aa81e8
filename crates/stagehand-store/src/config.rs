use crate::layout::StoreLayout;
use crate::{fsync_dir, new_op_id, write_atomic, Checksummed, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_schema::{ConfigChange, KeyPath};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Prior value of every key a change touches. `None` means the key was absent.
pub type PriorValues = BTreeMap<KeyPath, Option<Value>>;

/// The committed configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub version: u64,
    pub values: BTreeMap<KeyPath, Value>,
    pub updated_at: String,
    /// blake3 checksum for integrity verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ConfigDocument {
    fn empty() -> Self {
        Self {
            version: 0,
            values: BTreeMap::new(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            checksum: None,
        }
    }

    pub fn get(&self, key: &KeyPath) -> Option<&Value> {
        self.values.get(key)
    }

    /// Apply new values in place; `null` removes a key.
    fn apply(&mut self, values: impl IntoIterator<Item = (KeyPath, Option<Value>)>) {
        for (key, value) in values {
            match value {
                Some(Value::Null) | None => {
                    self.values.remove(&key);
                }
                Some(value) => {
                    self.values.insert(key, value);
                }
            }
        }
        self.version += 1;
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

impl Checksummed for ConfigDocument {
    fn checksum_slot(&mut self) -> &mut Option<String> {
        &mut self.checksum
    }
}

/// A change written to the staging area but not yet committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedChange {
    pub snapshot_id: String,
    pub base_version: u64,
    pub values: BTreeMap<KeyPath, Value>,
    pub staged_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Checksummed for StagedChange {
    fn checksum_slot(&mut self) -> &mut Option<String> {
        &mut self.checksum
    }
}

/// Prior values captured by [`ConfigStore::stage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    id: String,
    base_version: u64,
    prior: PriorValues,
    taken_at: String,
}

impl ConfigSnapshot {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn prior(&self) -> &PriorValues {
        &self.prior
    }

    pub fn taken_at(&self) -> &str {
        &self.taken_at
    }
}

/// Versioned key-path configuration with a single pending stage.
///
/// Reads always observe committed state; a staged change becomes visible only
/// through [`commit`](Self::commit). Callers serialize writers with the store
/// lock.
pub struct ConfigStore {
    layout: StoreLayout,
}

impl ConfigStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        if !self.layout.config_file().exists() {
            self.put_document(&ConfigDocument::empty())?;
        }
        Ok(())
    }

    /// Load the committed document. A store without one reads as empty at
    /// version 0.
    pub fn load(&self) -> Result<ConfigDocument, StoreError> {
        let path = self.layout.config_file();
        if !path.exists() {
            return Ok(ConfigDocument::empty());
        }
        let mut doc: ConfigDocument = serde_json::from_str(&fs::read_to_string(&path)?)?;
        doc.verify("config.json")?;
        Ok(doc)
    }

    pub fn version(&self) -> Result<u64, StoreError> {
        Ok(self.load()?.version)
    }

    pub fn read<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a KeyPath>,
    ) -> Result<BTreeMap<KeyPath, Option<Value>>, StoreError> {
        let doc = self.load()?;
        Ok(keys
            .into_iter()
            .map(|key| (key.clone(), doc.get(key).cloned()))
            .collect())
    }

    pub fn read_all(&self) -> Result<BTreeMap<KeyPath, Value>, StoreError> {
        Ok(self.load()?.values)
    }

    /// Commit values directly, bypassing the stage. Refused while a change is
    /// staged.
    pub fn write(&self, values: &BTreeMap<KeyPath, Value>) -> Result<u64, StoreError> {
        if let Some(staged) = self.staged()? {
            return Err(StoreError::AlreadyStaged {
                snapshot_id: staged.snapshot_id,
            });
        }
        let mut doc = self.load()?;
        doc.apply(values.iter().map(|(k, v)| (k.clone(), Some(v.clone()))));
        self.put_document(&doc)?;
        debug!("config write: {} keys, version {}", values.len(), doc.version);
        Ok(doc.version)
    }

    pub fn staged(&self) -> Result<Option<StagedChange>, StoreError> {
        let path = self.layout.staged_file();
        if !path.exists() {
            return Ok(None);
        }
        let mut staged: StagedChange = serde_json::from_str(&fs::read_to_string(&path)?)?;
        staged.verify("staged.json")?;
        Ok(Some(staged))
    }

    pub fn is_staged(&self) -> bool {
        self.layout.staged_file().exists()
    }

    /// Record prior values for every key the change touches and write the new
    /// values to the staging area.
    pub fn stage(&self, change: &ConfigChange) -> Result<ConfigSnapshot, StoreError> {
        if let Some(staged) = self.staged()? {
            return Err(StoreError::AlreadyStaged {
                snapshot_id: staged.snapshot_id,
            });
        }
        let doc = self.load()?;
        let prior: PriorValues = change
            .keys()
            .map(|key| (key.clone(), doc.get(key).cloned()))
            .collect();
        let snapshot = ConfigSnapshot {
            id: new_op_id(&serde_json::to_string(change.values())?),
            base_version: doc.version,
            prior,
            taken_at: chrono::Utc::now().to_rfc3339(),
        };
        let staged = StagedChange {
            snapshot_id: snapshot.id.clone(),
            base_version: doc.version,
            values: change.values().clone(),
            staged_at: snapshot.taken_at.clone(),
            checksum: None,
        };
        let content = serde_json::to_string_pretty(&staged.sealed()?)?;
        write_atomic(
            &self.layout.store_dir(),
            &self.layout.staged_file(),
            content.as_bytes(),
        )?;
        debug!(
            "staged change {} ({} keys) on version {}",
            snapshot.id,
            staged.values.len(),
            doc.version
        );
        Ok(snapshot)
    }

    /// Make the staged values the committed state. Returns the new version.
    pub fn commit(&self) -> Result<u64, StoreError> {
        let staged = self.staged()?.ok_or(StoreError::NotStaged)?;
        let mut doc = self.load()?;
        if staged.base_version != doc.version {
            return Err(StoreError::StaleStage {
                base: staged.base_version,
                current: doc.version,
            });
        }
        doc.apply(staged.values.into_iter().map(|(k, v)| (k, Some(v))));
        self.put_document(&doc)?;
        self.remove_staged()?;
        info!(
            "committed change {} as version {}",
            staged.snapshot_id, doc.version
        );
        Ok(doc.version)
    }

    /// Drop a pending stage. Returns whether one existed.
    pub fn discard_staged(&self) -> Result<bool, StoreError> {
        if !self.is_staged() {
            return Ok(false);
        }
        self.remove_staged()?;
        debug!("discarded staged change");
        Ok(true)
    }

    /// Restore every key of the snapshot to its prior value and re-commit.
    ///
    /// A pending stage belonging to this snapshot is discarded. Returns
    /// `false` when the committed state already matched the snapshot, in
    /// which case nothing is written.
    pub fn rollback(&self, snapshot: &ConfigSnapshot) -> Result<bool, StoreError> {
        // A stage left behind by another writer stays untouched, so a corrupt
        // staged file must not block the restore either.
        if let Ok(Some(staged)) = self.staged() {
            if staged.snapshot_id == snapshot.id {
                self.remove_staged()?;
                debug!("rollback: discarded stage of {}", snapshot.id);
            }
        }
        let restored = self.restore_prior(&snapshot.prior)?;
        if restored {
            info!("rolled back change {}", snapshot.id);
        }
        Ok(restored)
    }

    /// Write the given prior values back as a new committed version, unless
    /// the committed state already equals them.
    pub fn restore_prior(&self, prior: &PriorValues) -> Result<bool, StoreError> {
        let mut doc = self.load()?;
        let unchanged = prior
            .iter()
            .all(|(key, value)| doc.get(key) == value.as_ref());
        if unchanged {
            return Ok(false);
        }
        doc.apply(prior.clone());
        self.put_document(&doc)?;
        Ok(true)
    }

    fn put_document(&self, doc: &ConfigDocument) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(&doc.sealed()?)?;
        write_atomic(
            &self.layout.store_dir(),
            &self.layout.config_file(),
            content.as_bytes(),
        )
    }

    fn remove_staged(&self) -> Result<(), StoreError> {
        let path = self.layout.staged_file();
        if path.exists() {
            fs::remove_file(&path)?;
            fsync_dir(path.parent().unwrap_or(Path::new(".")))?;
        }
        Ok(())
    }
}
