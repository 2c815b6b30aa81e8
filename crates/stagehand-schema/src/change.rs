use crate::keypath::KeyPath;
use crate::types::{TargetId, UnitId};
use crate::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Which target nodes an operation addresses.
///
/// Textual form: `*` for every node, `node-1` for one node, `node-1,node-2`
/// for an explicit set. Resolution against the inventory happens in the
/// runtime, never here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum TargetSelector {
    #[default]
    All,
    One(TargetId),
    Set(BTreeSet<TargetId>),
}

impl TargetSelector {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let input = input.trim();
        if input == "*" {
            return Ok(Self::All);
        }
        let mut ids = BTreeSet::new();
        for part in input.split(',') {
            let part = part.trim();
            TargetId::parse(part).map_err(|_| ValidationError::Selector(input.to_owned()))?;
            ids.insert(TargetId::new(part));
        }
        if ids.len() == 1 {
            if let Some(only) = ids.pop_first() {
                return Ok(Self::One(only));
            }
        }
        Ok(Self::Set(ids))
    }

    pub fn set(ids: impl IntoIterator<Item = TargetId>) -> Self {
        Self::Set(ids.into_iter().collect())
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::All => f.write_str("*"),
            TargetSelector::One(id) => f.write_str(id),
            TargetSelector::Set(ids) => {
                let joined: Vec<&str> = ids.iter().map(TargetId::as_str).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

impl std::str::FromStr for TargetSelector {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TargetSelector {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TargetSelector> for String {
    fn from(value: TargetSelector) -> Self {
        value.to_string()
    }
}

#[derive(Deserialize)]
struct RawChange {
    values: BTreeMap<KeyPath, Value>,
    #[serde(default)]
    targets: TargetSelector,
}

/// A desired configuration change: new values per key path plus the nodes
/// it applies to. A `null` value removes the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawChange")]
pub struct ConfigChange {
    values: BTreeMap<KeyPath, Value>,
    targets: TargetSelector,
}

impl TryFrom<RawChange> for ConfigChange {
    type Error = ValidationError;

    fn try_from(raw: RawChange) -> Result<Self, Self::Error> {
        Self::new(raw.values, raw.targets)
    }
}

impl ConfigChange {
    pub fn new(
        values: BTreeMap<KeyPath, Value>,
        targets: TargetSelector,
    ) -> Result<Self, ValidationError> {
        if values.is_empty() {
            return Err(ValidationError::EmptyChange);
        }
        Ok(Self { values, targets })
    }

    pub fn single(key: KeyPath, value: Value, targets: TargetSelector) -> Self {
        Self {
            values: BTreeMap::from([(key, value)]),
            targets,
        }
    }

    /// Build a change from `key/path=value` assignments.
    ///
    /// Values are read as JSON when they parse as JSON (`3`, `true`,
    /// `{"a":1}`, `"quoted"`), and as plain strings otherwise.
    pub fn from_assignments<S: AsRef<str>>(
        assignments: &[S],
        targets: TargetSelector,
    ) -> Result<Self, ValidationError> {
        let mut values = BTreeMap::new();
        for assignment in assignments {
            let assignment = assignment.as_ref();
            let (key, raw) = assignment
                .split_once('=')
                .ok_or_else(|| ValidationError::Assignment(assignment.to_owned()))?;
            let key = KeyPath::parse(key.trim())?;
            values.insert(key, parse_value(raw));
        }
        Self::new(values, targets)
    }

    pub fn values(&self) -> &BTreeMap<KeyPath, Value> {
        &self.values
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyPath> {
        self.values.keys()
    }

    pub fn targets(&self) -> &TargetSelector {
        &self.targets
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

/// Change-units run around a commit. Either list may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSet {
    #[serde(default)]
    pub pre: Vec<UnitId>,
    #[serde(default)]
    pub post: Vec<UnitId>,
}

impl HookSet {
    pub fn new(pre: Vec<UnitId>, post: Vec<UnitId>) -> Self {
        Self { pre, post }
    }

    pub fn post_only(post: Vec<UnitId>) -> Self {
        Self {
            pre: Vec::new(),
            post,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }
}

/// The remote work carried by an asynchronous job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobAction {
    ApplyUnits { units: Vec<UnitId> },
    RunCommand { command: String },
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobAction::ApplyUnits { units } => {
                let names: Vec<&str> = units.iter().map(UnitId::as_str).collect();
                write!(f, "apply {}", names.join(", "))
            }
            JobAction::RunCommand { command } => write!(f, "run '{command}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub action: JobAction,
    pub targets: TargetSelector,
}

impl JobRequest {
    pub fn apply_units(units: Vec<UnitId>, targets: TargetSelector) -> Self {
        Self {
            action: JobAction::ApplyUnits { units },
            targets,
        }
    }

    pub fn run_command(command: impl Into<String>, targets: TargetSelector) -> Self {
        Self {
            action: JobAction::RunCommand {
                command: command.into(),
            },
            targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn selector_parse_forms() {
        assert_eq!(TargetSelector::parse("*").unwrap(), TargetSelector::All);
        assert_eq!(
            TargetSelector::parse("node-1").unwrap(),
            TargetSelector::One(TargetId::new("node-1"))
        );
        let set = TargetSelector::parse("node-2, node-1").unwrap();
        assert_eq!(
            set,
            TargetSelector::set([TargetId::new("node-1"), TargetId::new("node-2")])
        );
        assert_eq!(set.to_string(), "node-1,node-2");
    }

    #[test]
    fn selector_rejects_garbage() {
        assert!(TargetSelector::parse("").is_err());
        assert!(TargetSelector::parse("node-1,,node-2").is_err());
        assert!(TargetSelector::parse("node 1").is_err());
    }

    #[test]
    fn selector_serializes_as_text() {
        let json = serde_json::to_string(&TargetSelector::All).unwrap();
        assert_eq!(json, "\"*\"");
        let back: TargetSelector = serde_json::from_str("\"a,b\"").unwrap();
        assert!(matches!(back, TargetSelector::Set(ref s) if s.len() == 2));
    }

    #[test]
    fn assignments_parse_json_then_string() {
        let change = ConfigChange::from_assignments(
            &["replica_count=3", "cert_path=/x/new.pem", "enabled=true", "name=\"7\""],
            TargetSelector::All,
        )
        .unwrap();
        let get = |k: &str| change.values()[&KeyPath::parse(k).unwrap()].clone();
        assert_eq!(get("replica_count"), json!(3));
        assert_eq!(get("cert_path"), json!("/x/new.pem"));
        assert_eq!(get("enabled"), json!(true));
        assert_eq!(get("name"), json!("7"));
    }

    #[test]
    fn assignments_reject_malformed() {
        assert!(matches!(
            ConfigChange::from_assignments(&["no-equals-sign"], TargetSelector::All),
            Err(ValidationError::Assignment(_))
        ));
        assert!(matches!(
            ConfigChange::from_assignments(&["a//b=1"], TargetSelector::All),
            Err(ValidationError::KeyPath { .. })
        ));
        let empty: [&str; 0] = [];
        assert_eq!(
            ConfigChange::from_assignments(&empty, TargetSelector::All),
            Err(ValidationError::EmptyChange)
        );
    }

    #[test]
    fn change_deserialization_rejects_empty() {
        let bad: Result<ConfigChange, _> = serde_json::from_str(r#"{"values":{}}"#);
        assert!(bad.is_err());
        let ok: ConfigChange =
            serde_json::from_str(r#"{"values":{"a/b":1},"targets":"node-1"}"#).unwrap();
        assert_eq!(ok.targets(), &TargetSelector::One(TargetId::new("node-1")));
    }

    #[test]
    fn job_action_display() {
        let action = JobAction::ApplyUnits {
            units: vec![UnitId::new("a"), UnitId::new("b")],
        };
        assert_eq!(action.to_string(), "apply a, b");
        let req = JobRequest::run_command("uptime", TargetSelector::All);
        assert_eq!(req.action.to_string(), "run 'uptime'");
    }
}
