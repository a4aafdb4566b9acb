use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::authz::condition::parse_condition;
use crate::authz::entities::{Entity, EntityStore};
use crate::authz::errors::LoadError;
use crate::authz::policy::parse_kdl_policies;
use crate::authz::policy_store::PolicyStore;
use crate::authz::types::{Policy, PolicyRecord};
use crate::authz::AuthzState;

/// Load the entity snapshot and the policy directory into one `AuthzState`.
pub fn load_state(entities_path: &Path, policies_dir: &Path) -> Result<AuthzState, LoadError> {
    let entities = load_entities(entities_path)?;
    let policies = load_policies(policies_dir)?;
    Ok(AuthzState::new(entities, policies))
}

/// Read an entity snapshot in the load format from a JSON file.
pub fn load_entities(path: &Path) -> Result<EntityStore, LoadError> {
    let contents = read(path)?;
    let store = EntityStore::load(parse_entities_json(&contents)?)?;
    tracing::info!(
        path = %path.display(),
        entities = store.len(),
        "Loaded entities"
    );
    Ok(store)
}

/// Load all `.kdl` and `.json` policy files from the given directory, in
/// file name order, and compile them into a single `PolicyStore`.
pub fn load_policies(dir: &Path) -> Result<PolicyStore, LoadError> {
    if !dir.is_dir() {
        return Err(LoadError::PolicyLoadError {
            path: dir.display().to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "policies directory does not exist or is not a directory",
            ),
        });
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .map(|ext| ext == "kdl" || ext == "json")
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut records = Vec::new();
    for path in &paths {
        let contents = read(path)?;
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("kdl") => parse_kdl_policies(&contents)?,
            _ => parse_policies_json(&contents)?,
        };
        tracing::debug!(path = %path.display(), policies = parsed.len(), "Parsed policy file");
        records.extend(parsed);
    }

    let store = compile_policies(records)?;

    tracing::info!(
        files = paths.len(),
        policies = store.len(),
        "Loaded authorization policies"
    );

    Ok(store)
}

fn read(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|source| LoadError::PolicyLoadError {
        path: path.display().to_string(),
        source,
    })
}

/// Decode a JSON array of entity records. Errors name the offending record.
pub fn parse_entities_json(source: &str) -> Result<Vec<Entity>, LoadError> {
    let value: Value = serde_json::from_str(source)?;
    entities_from_value(value)
}

pub fn entities_from_value(value: Value) -> Result<Vec<Entity>, LoadError> {
    let Value::Array(items) = value else {
        return Err(LoadError::MalformedEntity(
            "expected a JSON array of entity records".into(),
        ));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value(item)
                .map_err(|e| LoadError::MalformedEntity(format!("record {i}: {e}")))
        })
        .collect()
}

/// Decode a JSON array of policy records.
pub fn parse_policies_json(source: &str) -> Result<Vec<PolicyRecord>, LoadError> {
    Ok(serde_json::from_str(source)?)
}

/// Compile a policy record, parsing its conditions. Records without an id
/// are named after their position in the load.
pub fn compile_policy(record: PolicyRecord, position: usize) -> Result<Policy, LoadError> {
    let id = record.id.unwrap_or_else(|| format!("policy{position}"));
    let compile = |clause: &str, src: Option<String>| {
        src.map(|s| {
            parse_condition(&s).map_err(|e| LoadError::MalformedPolicy {
                id: id.clone(),
                detail: format!("{clause} condition: {e}"),
            })
        })
        .transpose()
    };
    let when = compile("when", record.condition)?;
    let unless = compile("unless", record.unless)?;
    Ok(Policy {
        id,
        effect: record.effect,
        scope: record.scope,
        when,
        unless,
    })
}

/// Compile and index a full policy set.
pub fn compile_policies(records: Vec<PolicyRecord>) -> Result<PolicyStore, LoadError> {
    let policies = records
        .into_iter()
        .enumerate()
        .map(|(position, record)| compile_policy(record, position))
        .collect::<Result<Vec<_>, _>>()?;
    PolicyStore::load(policies)
}
