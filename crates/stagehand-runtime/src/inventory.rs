use crate::RuntimeError;
use stagehand_schema::{InventorySection, TargetId, TargetSelector};

/// The known target nodes, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    targets: Vec<TargetId>,
    local: TargetId,
}

impl Inventory {
    pub fn new(targets: Vec<TargetId>, local: Option<TargetId>) -> Result<Self, RuntimeError> {
        let local = match local {
            Some(local) if targets.contains(&local) => local,
            Some(local) => return Err(RuntimeError::UnknownTarget(local.into_inner())),
            None => targets
                .first()
                .cloned()
                .ok_or_else(|| RuntimeError::NoTargets("*".to_owned()))?,
        };
        Ok(Self { targets, local })
    }

    pub fn from_settings(section: &InventorySection) -> Result<Self, RuntimeError> {
        Self::new(section.targets.clone(), section.local.clone())
    }

    pub fn targets(&self) -> &[TargetId] {
        &self.targets
    }

    /// The node that runs controller-side work.
    pub fn local(&self) -> &TargetId {
        &self.local
    }

    /// Resolve a selector to concrete targets, in inventory order.
    pub fn resolve(&self, selector: &TargetSelector) -> Result<Vec<TargetId>, RuntimeError> {
        let resolved: Vec<TargetId> = match selector {
            TargetSelector::All => self.targets.clone(),
            TargetSelector::One(id) => {
                self.check(id)?;
                vec![id.clone()]
            }
            TargetSelector::Set(ids) => {
                for id in ids {
                    self.check(id)?;
                }
                self.targets
                    .iter()
                    .filter(|t| ids.contains(*t))
                    .cloned()
                    .collect()
            }
        };
        if resolved.is_empty() {
            return Err(RuntimeError::NoTargets(selector.to_string()));
        }
        Ok(resolved)
    }

    fn check(&self, id: &TargetId) -> Result<(), RuntimeError> {
        if self.targets.contains(id) {
            Ok(())
        } else {
            Err(RuntimeError::UnknownTarget(id.to_string()))
        }
    }
}
