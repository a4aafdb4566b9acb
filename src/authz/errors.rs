use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

use crate::authz::types::EntityUid;

/// Failures while loading entities or policies. Fatal to the load operation;
/// the previously loaded state (if any) stays in effect.
#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("Duplicate entity `{0}`")]
    #[diagnostic(
        code(canopy::load::duplicate_id),
        help("Every entity uid (type + id) may appear only once in a load")
    )]
    DuplicateId(EntityUid),

    #[error("Entity `{entity}` has parent `{parent}` which is not part of the load")]
    #[diagnostic(
        code(canopy::load::dangling_parent),
        help("Parent references must resolve to entities in the same snapshot")
    )]
    DanglingParent { entity: EntityUid, parent: EntityUid },

    #[error("Cycle detected in entity hierarchy: {0}")]
    #[diagnostic(
        code(canopy::load::cycle),
        help("The parent relation must form a DAG; break the cycle listed above")
    )]
    CycleDetected(String),

    #[error("Entity `{entity}` is still a parent of `{child}`")]
    #[diagnostic(
        code(canopy::load::still_referenced),
        help("Remove or re-parent the children before removing the entity")
    )]
    StillReferenced { entity: EntityUid, child: EntityUid },

    #[error("Duplicate policy id `{0}`")]
    #[diagnostic(code(canopy::load::duplicate_policy))]
    DuplicatePolicyId(String),

    #[error("Malformed policy `{id}`: {detail}")]
    #[diagnostic(
        code(canopy::load::malformed_policy),
        help("Supported operators: ==, !=, <, <=, >, >=, &&, ||, !, in, has, is, .contains(). Variables: principal, action, resource, context")
    )]
    MalformedPolicy { id: String, detail: String },

    #[error("Malformed entity: {0}")]
    #[diagnostic(
        code(canopy::load::malformed_entity),
        help("Entity records look like {{\"uid\": {{\"type\": .., \"id\": ..}}, \"attrs\": {{..}}, \"parents\": [..]}}")
    )]
    MalformedEntity(String),

    #[error("Invalid payload: {0}")]
    #[diagnostic(code(canopy::load::payload))]
    InvalidPayload(#[from] serde_json::Error),

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(canopy::load::kdl_parse),
        help("Check your KDL file syntax, see https://kdl.dev")
    )]
    KdlParse(String),

    #[error("Failed to load `{path}`")]
    #[diagnostic(
        code(canopy::load::file),
        help("Check that the file exists and is readable")
    )]
    PolicyLoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    #[diagnostic(code(canopy::load::io))]
    Io(#[from] std::io::Error),
}

impl IntoResponse for LoadError {
    fn into_response(self) -> Response {
        let status = match &self {
            LoadError::PolicyLoadError { .. } | LoadError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };
        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Condition expressions that fail to parse.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("empty expression")]
    Empty,
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unexpected character `{0}`")]
    UnexpectedChar(char),
    #[error("invalid integer `{0}`")]
    InvalidInteger(String),
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("{0}")]
    Syntax(String),
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
}

/// Condition evaluation failures. These never reach callers: the policy is
/// treated as not applicable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("`{entity}` has no attribute `{attr}`")]
    MissingAttribute { entity: String, attr: String },
    #[error("entity `{0}` does not exist")]
    MissingEntity(EntityUid),
    #[error("type error: expected {expected}, got {got}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },
    #[error("integer overflow")]
    Overflow,
}

/// Errors surfaced by the HTTP decision service.
#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error("Entities or policies have not been loaded yet")]
    #[diagnostic(code(canopy::service::unavailable))]
    Unavailable,

    #[error("Entity `{0}` not found")]
    #[diagnostic(code(canopy::service::not_found))]
    NotFound(EntityUid),

    #[error("Bad request: {0}")]
    #[diagnostic(code(canopy::service::bad_request))]
    BadRequest(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Load(#[from] LoadError),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let status = match self {
            ServiceError::Load(e) => return e.into_response(),
            ServiceError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
