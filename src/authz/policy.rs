use crate::authz::errors::LoadError;
use crate::authz::types::*;
use kdl::{KdlDocument, KdlNode};

/// Parse a KDL document into policy records.
///
/// ```kdl
/// policy "editors-update" effect="permit" {
///     principal
///     action is="UpdateList"
///     resource
///     when "principal in resource.editors"
/// }
/// ```
pub fn parse_kdl_policies(source: &str) -> Result<Vec<PolicyRecord>, LoadError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| LoadError::KdlParse(e.to_string()))?;

    let mut records = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "policy" => records.push(parse_policy_node(node, records.len())?),
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(records)
}

fn parse_policy_node(node: &KdlNode, position: usize) -> Result<PolicyRecord, LoadError> {
    let id = first_string_arg(node);
    let label = id.clone().unwrap_or_else(|| format!("#{position}"));
    let malformed = |detail: String| LoadError::MalformedPolicy {
        id: label.clone(),
        detail,
    };

    let effect = match node.get("effect").and_then(|v| v.as_string()) {
        Some("permit") | Some("Permit") => Effect::Permit,
        Some("forbid") | Some("Forbid") => Effect::Forbid,
        Some(other) => {
            return Err(malformed(format!(
                "unknown effect `{other}` (expected \"permit\" or \"forbid\")"
            )))
        }
        None => return Err(malformed("missing `effect` property".into())),
    };

    let mut scope = Scope::default();
    let mut condition = None;
    let mut unless = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "principal" => {
                    scope.principal = scope_constraint(child, EntityUid::parse).map_err(&malformed)?
                }
                "action" => {
                    scope.action =
                        scope_constraint(child, EntityUid::parse_action).map_err(&malformed)?
                }
                "resource" => {
                    scope.resource = scope_constraint(child, EntityUid::parse).map_err(&malformed)?
                }
                "when" => {
                    if condition.is_some() {
                        return Err(malformed("more than one `when` clause".into()));
                    }
                    condition = Some(
                        first_string_arg(child)
                            .ok_or_else(|| malformed("`when` requires a string argument".into()))?,
                    );
                }
                "unless" => {
                    if unless.is_some() {
                        return Err(malformed("more than one `unless` clause".into()));
                    }
                    unless = Some(
                        first_string_arg(child).ok_or_else(|| {
                            malformed("`unless` requires a string argument".into())
                        })?,
                    );
                }
                other => {
                    return Err(malformed(format!(
                        "unexpected child `{other}` (expected `principal`, `action`, `resource`, `when` or `unless`)"
                    )));
                }
            }
        }
    }

    Ok(PolicyRecord {
        id,
        effect,
        scope,
        condition,
        unless,
    })
}

/// `principal` alone matches anything; `is="T/id"` is equality and
/// `in="T/id"` is hierarchy membership.
fn scope_constraint(
    node: &KdlNode,
    parse: fn(&str) -> Option<EntityUid>,
) -> Result<ScopeConstraint, String> {
    let name = node.name().value();
    let is = node.get("is").and_then(|v| v.as_string());
    let within = node.get("in").and_then(|v| v.as_string());
    let entity = |raw: &str| {
        parse(raw).ok_or_else(|| {
            format!("invalid entity reference `{raw}` in `{name}` (expected \"Type/id\" or Type::\"id\")")
        })
    };
    match (is, within) {
        (None, None) => Ok(ScopeConstraint::Any),
        (Some(raw), None) => Ok(ScopeConstraint::Eq {
            entity: entity(raw)?,
        }),
        (None, Some(raw)) => Ok(ScopeConstraint::In {
            entity: entity(raw)?,
        }),
        (Some(_), Some(_)) => Err(format!("`{name}` cannot have both `is` and `in`")),
    }
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}
