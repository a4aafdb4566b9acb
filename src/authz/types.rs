use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::authz::condition::Expr;

/// Typed entity identifier, e.g. `User::"alice"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityUid {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityUid {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Actions may be named without a type; they live under `Action`.
    pub fn action(name: impl Into<String>) -> Self {
        Self::new("Action", name)
    }

    /// Parse `Type::"id"` or `Type/id`.
    pub fn parse(s: &str) -> Option<Self> {
        if let Some((t, rest)) = s.split_once("::\"") {
            let id = rest.strip_suffix('"')?;
            if t.is_empty() {
                return None;
            }
            return Some(Self::new(t, unescape(id)?));
        }
        let (t, id) = s.split_once('/')?;
        if t.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(t, id))
    }

    /// Like [`EntityUid::parse`], but a bare name is taken as an action.
    pub fn parse_action(s: &str) -> Option<Self> {
        if s.contains("::\"") || s.contains('/') {
            Self::parse(s)
        } else if s.is_empty() {
            None
        } else {
            Some(Self::action(s))
        }
    }

    fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => {
                Self::parse(s).ok_or_else(|| format!("invalid entity reference `{s}`"))
            }
            Value::Object(map) => {
                let map = match map.get("__entity") {
                    Some(Value::Object(inner)) => inner,
                    Some(_) => return Err("`__entity` must be an object".into()),
                    None => map,
                };
                let t = map.get("type").and_then(Value::as_str);
                let id = map.get("id").and_then(Value::as_str);
                match (t, id) {
                    (Some(t), Some(id)) if !t.is_empty() => Ok(Self::new(t, id)),
                    _ => Err(format!(
                        "entity reference requires string `type` and `id` fields, got {value}"
                    )),
                }
            }
            other => Err(format!("invalid entity reference {other}")),
        }
    }
}

fn unescape(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '"' => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

impl std::fmt::Display for EntityUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::\"", self.entity_type)?;
        for c in self.entity_id.chars() {
            if c == '"' || c == '\\' {
                write!(f, "\\")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, "\"")
    }
}

impl Serialize for EntityUid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        json!({ "type": self.entity_type, "id": self.entity_id }).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EntityUid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// Accepts everything `EntityUid` does, plus a bare action name.
pub fn deserialize_action<'de, D: Deserializer<'de>>(deserializer: D) -> Result<EntityUid, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => EntityUid::parse_action(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid action `{s}`"))),
        other => EntityUid::from_json(&other).map_err(serde::de::Error::custom),
    }
}

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    String(String),
    Long(i64),
    Bool(bool),
    Entity(EntityUid),
    Set(Vec<AttrValue>),
    Record(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::String(_) => "string",
            AttrValue::Long(_) => "long",
            AttrValue::Bool(_) => "bool",
            AttrValue::Entity(_) => "entity",
            AttrValue::Set(_) => "set",
            AttrValue::Record(_) => "record",
        }
    }

    /// Decode a JSON value. Entity references use the `__entity` escape;
    /// any other object is a record.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::Null => Err("null is not a valid attribute value".into()),
            Value::Bool(b) => Ok(AttrValue::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(AttrValue::Long)
                .ok_or_else(|| format!("only 64-bit integers are supported, got {n}")),
            Value::String(s) => Ok(AttrValue::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(AttrValue::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(AttrValue::Set),
            Value::Object(map) if map.contains_key("__entity") => {
                EntityUid::from_json(value).map(AttrValue::Entity)
            }
            Value::Object(map) => record_from_json(map).map(AttrValue::Record),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            AttrValue::String(s) => Value::String(s.clone()),
            AttrValue::Long(n) => Value::from(*n),
            AttrValue::Bool(b) => Value::Bool(*b),
            AttrValue::Entity(uid) => {
                json!({ "__entity": { "type": uid.entity_type, "id": uid.entity_id } })
            }
            AttrValue::Set(items) => Value::Array(items.iter().map(AttrValue::to_json).collect()),
            AttrValue::Record(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

pub fn record_from_json(map: &Map<String, Value>) -> Result<BTreeMap<String, AttrValue>, String> {
    map.iter()
        .map(|(k, v)| {
            AttrValue::from_json(v)
                .map(|v| (k.clone(), v))
                .map_err(|e| format!("attribute `{k}`: {e}"))
        })
        .collect()
}

impl Serialize for AttrValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttrValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        AttrValue::from_json(&value).map_err(serde::de::Error::custom)
    }
}

// ---------- Policy domain types ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[serde(alias = "Permit")]
    Permit,
    #[serde(alias = "Forbid")]
    Forbid,
}

/// A principal, action or resource constraint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ScopeConstraint {
    #[default]
    #[serde(rename = "All")]
    Any,
    #[serde(rename = "==")]
    Eq { entity: EntityUid },
    #[serde(rename = "in")]
    In { entity: EntityUid },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub principal: ScopeConstraint,
    #[serde(default)]
    pub action: ScopeConstraint,
    #[serde(default)]
    pub resource: ScopeConstraint,
}

/// A policy as submitted over the wire or parsed from a policy file.
/// Conditions are still raw strings here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub effect: Effect,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub unless: Option<String>,
}

/// A compiled policy. Conditions are parsed once at load time.
#[derive(Debug, Clone)]
pub struct Policy {
    pub id: String,
    pub effect: Effect,
    pub scope: Scope,
    pub when: Option<Expr>,
    pub unless: Option<Expr>,
}

// ---------- Decisions ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    ExplicitForbid,
    NoApplicablePermit,
    UnknownEntity,
    InvalidContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyErrorReport {
    pub policy: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: Outcome,
    pub reason: Option<DenyReason>,
    pub determining_policies: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<PolicyErrorReport>,
}

impl Decision {
    pub fn allow(policies: BTreeSet<String>) -> Self {
        Self {
            decision: Outcome::Allow,
            reason: None,
            determining_policies: policies,
            errors: Vec::new(),
        }
    }

    pub fn deny(reason: DenyReason) -> Self {
        Self {
            decision: Outcome::Deny,
            reason: Some(reason),
            determining_policies: BTreeSet::new(),
            errors: Vec::new(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Outcome::Allow
    }
}

// ---------- API request/response types ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    pub principal: EntityUid,
    #[serde(deserialize_with = "deserialize_action")]
    pub action: EntityUid,
    pub resource: EntityUid,
    /// Free-form request context, e.g. `{"role": "Reader"}`
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadResponse {
    pub loaded: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StatusResponse {
    pub entities_loaded: bool,
    pub policies_loaded: bool,
    pub entity_count: usize,
    pub policy_count: usize,
    pub cached_closures: usize,
}
