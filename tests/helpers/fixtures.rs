use std::path::{Path, PathBuf};

use canopy::authz::entities::Entity;
use canopy::authz::loader::parse_entities_json;
use canopy::authz::policy::parse_kdl_policies;
use canopy::authz::types::{AuthorizeRequest, EntityUid, PolicyRecord};

/// A path relative to the crate root.
pub fn repo_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join(relative)
}

/// The TinyTodo entity snapshot shipped in `data/`.
pub fn tinytodo_entities() -> Vec<Entity> {
    let source = std::fs::read_to_string(repo_path("data/entities.json"))
        .expect("Failed to read entities fixture");
    parse_entities_json(&source).expect("Invalid entities fixture")
}

/// The TinyTodo policies shipped in `policies/`.
pub fn tinytodo_policies() -> Vec<PolicyRecord> {
    let source = std::fs::read_to_string(repo_path("policies/tinytodo.kdl"))
        .expect("Failed to read policy fixture");
    parse_kdl_policies(&source).expect("Invalid policy fixture")
}

/// `principal` and `resource` as `Type/id`, `action` as a bare name.
pub fn request(principal: &str, action: &str, resource: &str) -> AuthorizeRequest {
    AuthorizeRequest {
        principal: EntityUid::parse(principal).expect("bad principal"),
        action: EntityUid::action(action),
        resource: EntityUid::parse(resource).expect("bad resource"),
        context: serde_json::Value::Null,
    }
}
