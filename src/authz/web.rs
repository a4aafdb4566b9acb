use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::authz::engine;
use crate::authz::entities::{Entity, EntityStore};
use crate::authz::errors::{LoadError, ServiceError};
use crate::authz::hierarchy::HierarchyResolver;
use crate::authz::loader;
use crate::authz::policy_store::PolicyStore;
use crate::authz::types::{
    AuthorizeRequest, Decision, EntityUid, LoadResponse, PolicyRecord, StatusResponse,
};
use crate::authz::AuthzState;

#[derive(Debug, Default)]
struct Loaded {
    entities: Option<(Arc<EntityStore>, Arc<HierarchyResolver>)>,
    policies: Option<Arc<PolicyStore>>,
}

/// The decision service's current snapshots. Loads validate first and then
/// swap new `Arc`s in under the write lock; readers clone an `AuthzState`
/// and evaluate without holding the lock.
#[derive(Debug, Clone, Default)]
pub struct DecisionService {
    inner: Arc<RwLock<Loaded>>,
}

impl DecisionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: AuthzState) -> Self {
        let loaded = Loaded {
            entities: Some((state.entities, state.hierarchy)),
            policies: Some(state.policies),
        };
        Self {
            inner: Arc::new(RwLock::new(loaded)),
        }
    }

    pub async fn snapshot(&self) -> Result<AuthzState, ServiceError> {
        let loaded = self.inner.read().await;
        match (&loaded.entities, &loaded.policies) {
            (Some((entities, hierarchy)), Some(policies)) => Ok(AuthzState {
                entities: entities.clone(),
                hierarchy: hierarchy.clone(),
                policies: policies.clone(),
            }),
            _ => Err(ServiceError::Unavailable),
        }
    }

    /// Swap in a new entity snapshot. The resolver cache starts empty.
    pub async fn replace_entities(&self, store: EntityStore, warm: bool) -> usize {
        let count = store.len();
        let store = Arc::new(store);
        let hierarchy = Arc::new(HierarchyResolver::new(store.clone()));
        if warm {
            hierarchy.warm();
        }
        self.inner.write().await.entities = Some((store, hierarchy));
        tracing::info!(entities = count, "Replaced entity snapshot");
        count
    }

    /// Swap in a new policy set. The resolver cache is kept.
    pub async fn replace_policies(&self, store: PolicyStore) -> usize {
        let count = store.len();
        self.inner.write().await.policies = Some(Arc::new(store));
        tracing::info!(policies = count, "Replaced policy set");
        count
    }

    /// Copy-on-write insert of a single entity.
    pub async fn insert_entity(&self, entity: Entity) -> Result<(), ServiceError> {
        let mut loaded = self.inner.write().await;
        let mut store = match &loaded.entities {
            Some((current, _)) => EntityStore::clone(current),
            None => EntityStore::new(),
        };
        let uid = entity.uid.clone();
        store.insert(entity)?;
        let store = Arc::new(store);
        loaded.entities = Some((store.clone(), Arc::new(HierarchyResolver::new(store))));
        tracing::info!(entity = %uid, "Inserted entity");
        Ok(())
    }

    /// Copy-on-write removal. Fails while the entity is still a parent.
    pub async fn remove_entity(&self, uid: &EntityUid) -> Result<Entity, ServiceError> {
        let mut loaded = self.inner.write().await;
        let Some((current, _)) = &loaded.entities else {
            return Err(ServiceError::NotFound(uid.clone()));
        };
        let mut store = EntityStore::clone(current);
        let removed = store
            .remove(uid)?
            .ok_or_else(|| ServiceError::NotFound(uid.clone()))?;
        let store = Arc::new(store);
        loaded.entities = Some((store.clone(), Arc::new(HierarchyResolver::new(store))));
        tracing::info!(entity = %uid, "Removed entity");
        Ok(removed)
    }

    pub async fn entities(&self) -> Result<Arc<EntityStore>, ServiceError> {
        let loaded = self.inner.read().await;
        loaded
            .entities
            .as_ref()
            .map(|(store, _)| store.clone())
            .ok_or(ServiceError::Unavailable)
    }

    pub async fn status(&self) -> StatusResponse {
        let loaded = self.inner.read().await;
        let mut status = StatusResponse::default();
        if let Some((store, hierarchy)) = &loaded.entities {
            status.entities_loaded = true;
            status.entity_count = store.len();
            status.cached_closures = hierarchy.cached_len();
        }
        if let Some(policies) = &loaded.policies {
            status.policies_loaded = true;
            status.policy_count = policies.len();
        }
        status
    }
}

pub fn router(service: DecisionService) -> Router {
    Router::new()
        .route("/authorize", post(handle_authorize))
        .route("/authorize/batch", post(handle_authorize_batch))
        .route("/entities", post(handle_load_entities).put(handle_insert_entity))
        .route("/entities/{entity_type}", get(handle_entities_of_type))
        .route(
            "/entities/{entity_type}/{entity_id}",
            get(handle_get_entity).delete(handle_remove_entity),
        )
        .route("/policies", post(handle_load_policies))
        .route("/status", get(handle_status))
        .route("/healthz", get(health))
        .with_state(service)
}

/// Bodies are decoded here rather than through the `Json` extractor so that
/// every malformed payload gets the same `{"error": ..}` 400 body.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ServiceError> {
    serde_json::from_slice(body).map_err(|e| ServiceError::BadRequest(e.to_string()))
}

async fn handle_authorize(
    State(service): State<DecisionService>,
    body: Bytes,
) -> Result<Json<Decision>, ServiceError> {
    let req: AuthorizeRequest = parse_body(&body)?;
    let state = service.snapshot().await?;
    Ok(Json(engine::authorize_request(&state, &req)))
}

async fn handle_authorize_batch(
    State(service): State<DecisionService>,
    body: Bytes,
) -> Result<Json<Vec<Decision>>, ServiceError> {
    let reqs: Vec<AuthorizeRequest> = parse_body(&body)?;
    let state = service.snapshot().await?;
    let decisions = reqs
        .iter()
        .map(|req| engine::authorize_request(&state, req))
        .collect();
    Ok(Json(decisions))
}

async fn handle_load_entities(
    State(service): State<DecisionService>,
    body: Bytes,
) -> Result<Json<LoadResponse>, ServiceError> {
    let value: Value = serde_json::from_slice(&body).map_err(LoadError::from)?;
    let store = EntityStore::load(loader::entities_from_value(value)?)?;
    let loaded = service.replace_entities(store, false).await;
    Ok(Json(LoadResponse { loaded }))
}

async fn handle_insert_entity(
    State(service): State<DecisionService>,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let value: Value = serde_json::from_slice(&body).map_err(LoadError::from)?;
    let entity: Entity = serde_json::from_value(value)
        .map_err(|e| LoadError::MalformedEntity(e.to_string()))?;
    service.insert_entity(entity).await?;
    Ok((StatusCode::CREATED, Json(LoadResponse { loaded: 1 })))
}

async fn handle_remove_entity(
    State(service): State<DecisionService>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<Entity>, ServiceError> {
    let uid = EntityUid::new(entity_type, entity_id);
    Ok(Json(service.remove_entity(&uid).await?))
}

async fn handle_get_entity(
    State(service): State<DecisionService>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<Entity>, ServiceError> {
    let uid = EntityUid::new(entity_type, entity_id);
    let store = service.entities().await?;
    store
        .get(&uid)
        .cloned()
        .map(Json)
        .ok_or(ServiceError::NotFound(uid))
}

async fn handle_entities_of_type(
    State(service): State<DecisionService>,
    Path(entity_type): Path<String>,
) -> Result<Json<Vec<Entity>>, ServiceError> {
    let store = service.entities().await?;
    Ok(Json(store.all_of_type(&entity_type).cloned().collect()))
}

async fn handle_load_policies(
    State(service): State<DecisionService>,
    body: Bytes,
) -> Result<Json<LoadResponse>, ServiceError> {
    let records: Vec<PolicyRecord> = serde_json::from_slice(&body).map_err(LoadError::from)?;
    let store = loader::compile_policies(records)?;
    let loaded = service.replace_policies(store).await;
    Ok(Json(LoadResponse { loaded }))
}

async fn handle_status(State(service): State<DecisionService>) -> Json<StatusResponse> {
    Json(service.status().await)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
