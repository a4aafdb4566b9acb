use std::collections::BTreeSet;

use serde_json::Value;

use crate::authz::condition::{self, EvalContext, Expr};
use crate::authz::errors::EvalError;
use crate::authz::hierarchy::HierarchyResolver;
use crate::authz::types::*;
use crate::authz::AuthzState;

/// A validated request. `context` is always a record.
#[derive(Debug, Clone)]
pub struct Request {
    pub principal: EntityUid,
    pub action: EntityUid,
    pub resource: EntityUid,
    pub context: AttrValue,
}

impl Request {
    /// Fails when the context is not a JSON object of supported values.
    /// A missing (null) context is an empty record.
    pub fn new(
        principal: EntityUid,
        action: EntityUid,
        resource: EntityUid,
        context: &Value,
    ) -> Result<Self, String> {
        let context = match context {
            Value::Null => condition::empty_context(),
            Value::Object(map) => AttrValue::Record(record_from_json(map)?),
            other => return Err(format!("context must be a JSON object, got {other}")),
        };
        Ok(Self {
            principal,
            action,
            resource,
            context,
        })
    }
}

/// Decide a request from its raw parts. An unusable context denies with
/// `InvalidContext` rather than failing.
pub fn authorize(
    state: &AuthzState,
    principal: EntityUid,
    action: EntityUid,
    resource: EntityUid,
    context: &Value,
) -> Decision {
    match Request::new(principal, action, resource, context) {
        Ok(request) => evaluate(state, &request),
        Err(detail) => {
            tracing::debug!(%detail, "rejecting request context");
            Decision::deny(DenyReason::InvalidContext)
        }
    }
}

pub fn authorize_request(state: &AuthzState, req: &AuthorizeRequest) -> Decision {
    authorize(
        state,
        req.principal.clone(),
        req.action.clone(),
        req.resource.clone(),
        &req.context,
    )
}

/// Deny-overrides, then default deny.
pub fn evaluate(state: &AuthzState, request: &Request) -> Decision {
    for uid in [&request.principal, &request.resource] {
        if !state.entities.contains(uid) {
            tracing::debug!(entity = %uid, "unknown entity in request");
            return Decision::deny(DenyReason::UnknownEntity);
        }
    }

    let cx = EvalContext {
        principal: &request.principal,
        action: &request.action,
        resource: &request.resource,
        context: &request.context,
        hierarchy: &state.hierarchy,
    };

    let mut permits = BTreeSet::new();
    let mut forbids = BTreeSet::new();
    let mut errors = Vec::new();

    for policy in state.policies.policies_for(&request.action) {
        if !scope_matches(&policy.scope, request, &state.hierarchy) {
            continue;
        }
        match conditions_hold(policy, &cx) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::debug!(policy = %policy.id, error = %e, "condition error, policy not applicable");
                errors.push(PolicyErrorReport {
                    policy: policy.id.clone(),
                    message: e.to_string(),
                });
                continue;
            }
        }
        match policy.effect {
            Effect::Permit => permits.insert(policy.id.clone()),
            Effect::Forbid => forbids.insert(policy.id.clone()),
        };
    }

    let mut decision = if !forbids.is_empty() {
        Decision {
            determining_policies: forbids,
            ..Decision::deny(DenyReason::ExplicitForbid)
        }
    } else if !permits.is_empty() {
        Decision::allow(permits)
    } else {
        Decision::deny(DenyReason::NoApplicablePermit)
    };
    decision.errors = errors;

    tracing::trace!(
        principal = %request.principal,
        action = %request.action,
        resource = %request.resource,
        decision = ?decision.decision,
        "Evaluated request"
    );
    decision
}

fn scope_matches(scope: &Scope, request: &Request, hierarchy: &HierarchyResolver) -> bool {
    constraint_matches(&scope.principal, &request.principal, hierarchy)
        && constraint_matches(&scope.action, &request.action, hierarchy)
        && constraint_matches(&scope.resource, &request.resource, hierarchy)
}

fn constraint_matches(
    constraint: &ScopeConstraint,
    uid: &EntityUid,
    hierarchy: &HierarchyResolver,
) -> bool {
    match constraint {
        ScopeConstraint::Any => true,
        ScopeConstraint::Eq { entity } => entity == uid,
        ScopeConstraint::In { entity } => hierarchy.is_ancestor(entity, uid),
    }
}

/// `when` must hold and `unless` must not.
fn conditions_hold(policy: &Policy, cx: &EvalContext<'_>) -> Result<bool, EvalError> {
    let check = |expr: &Option<Expr>, absent: bool| match expr {
        Some(e) => condition::evaluate(e, cx),
        None => Ok(absent),
    };
    Ok(check(&policy.when, true)? && !check(&policy.unless, false)?)
}
