//! Typed HTTP client for the decision service, and an owned handle on a
//! spawned server process.

use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

use miette::Diagnostic;
use reqwest::{Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::authz::entities::Entity;
use crate::authz::types::{
    AuthorizeRequest, Decision, EntityUid, LoadResponse, PolicyRecord, StatusResponse,
};

#[derive(Debug, Error, Diagnostic)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    #[diagnostic(code(canopy::client::bad_request))]
    BadRequest(String),

    #[error("Not found: {0}")]
    #[diagnostic(code(canopy::client::not_found))]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    #[diagnostic(
        code(canopy::client::unavailable),
        help("Load entities and policies before sending authorization requests")
    )]
    Unavailable(String),

    #[error("Server error ({status}): {message}")]
    #[diagnostic(code(canopy::client::server))]
    Server { status: u16, message: String },

    #[error("Transport error: {0}")]
    #[diagnostic(code(canopy::client::transport))]
    Transport(#[from] reqwest::Error),

    #[error("Could not decode response: {0}")]
    #[diagnostic(code(canopy::client::decode))]
    Decode(String),

    #[error("Server process: {0}")]
    #[diagnostic(code(canopy::client::process))]
    Process(String),
}

#[derive(Debug, Clone)]
pub struct DecisionClient {
    http: reqwest::Client,
    base_url: Url,
}

impl DecisionClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ApiError::BadRequest(format!("{base_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .no_proxy()
            .build()?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::BadRequest(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call<B, T>(&self, method: Method, segments: &[&str], body: Option<&B>) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut req = self.http.request(method, self.url(segments)?);
        if let Some(body) = body {
            req = req.json(body);
        }
        handle_response(req.send().await?).await
    }

    pub async fn authorize(&self, req: &AuthorizeRequest) -> Result<Decision, ApiError> {
        self.call(Method::POST, &["authorize"], Some(req)).await
    }

    pub async fn authorize_batch(&self, reqs: &[AuthorizeRequest]) -> Result<Vec<Decision>, ApiError> {
        self.call(Method::POST, &["authorize", "batch"], Some(reqs)).await
    }

    pub async fn load_entities(&self, entities: &[Entity]) -> Result<LoadResponse, ApiError> {
        self.call(Method::POST, &["entities"], Some(entities)).await
    }

    pub async fn insert_entity(&self, entity: &Entity) -> Result<LoadResponse, ApiError> {
        self.call(Method::PUT, &["entities"], Some(entity)).await
    }

    pub async fn remove_entity(&self, uid: &EntityUid) -> Result<Entity, ApiError> {
        self.call::<(), _>(
            Method::DELETE,
            &["entities", &uid.entity_type, &uid.entity_id],
            None,
        )
        .await
    }

    pub async fn get_entity(&self, uid: &EntityUid) -> Result<Entity, ApiError> {
        self.call::<(), _>(
            Method::GET,
            &["entities", &uid.entity_type, &uid.entity_id],
            None,
        )
        .await
    }

    pub async fn entities_of_type(&self, entity_type: &str) -> Result<Vec<Entity>, ApiError> {
        self.call::<(), _>(Method::GET, &["entities", entity_type], None)
            .await
    }

    pub async fn load_policies(&self, policies: &[PolicyRecord]) -> Result<LoadResponse, ApiError> {
        self.call(Method::POST, &["policies"], Some(policies)).await
    }

    pub async fn status(&self) -> Result<StatusResponse, ApiError> {
        self.call::<(), _>(Method::GET, &["status"], None).await
    }

    pub async fn health(&self) -> Result<(), ApiError> {
        let resp = self.http.get(self.url(&["healthz"])?).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(error_for(resp.status(), resp.text().await.unwrap_or_default()))
        }
    }
}

/// The one place responses are inspected: success bodies are decoded into
/// `T`, everything else becomes a categorized `ApiError`.
pub async fn handle_response<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
    let status = resp.status();
    let body = resp.bytes().await?;
    if status.is_success() {
        return serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()));
    }
    Err(error_for(status, String::from_utf8_lossy(&body).into_owned()))
}

fn error_for(status: StatusCode, body: String) -> ApiError {
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(body);
    match status {
        StatusCode::BAD_REQUEST => ApiError::BadRequest(message),
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        StatusCode::SERVICE_UNAVAILABLE => ApiError::Unavailable(message),
        other => ApiError::Server {
            status: other.as_u16(),
            message,
        },
    }
}

/// A running server process. Dropping the handle kills and reaps it, so the
/// process never outlives the caller's scope, including on error paths.
#[derive(Debug)]
pub struct ServerProcess {
    child: Option<Child>,
    client: DecisionClient,
}

impl ServerProcess {
    /// Start `command` and wait until `base_url` answers `/healthz`.
    pub async fn spawn(
        mut command: Command,
        base_url: &str,
        ready_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = DecisionClient::new(base_url)?;
        let child = command
            .spawn()
            .map_err(|e| ApiError::Process(format!("failed to start: {e}")))?;
        let mut server = Self {
            child: Some(child),
            client,
        };

        let deadline = Instant::now() + ready_timeout;
        loop {
            if let Some(status) = server.try_exit_status()? {
                return Err(ApiError::Process(format!(
                    "exited before becoming ready ({status})"
                )));
            }
            if server.client.health().await.is_ok() {
                tracing::debug!(%base_url, "server process ready");
                return Ok(server);
            }
            if Instant::now() >= deadline {
                return Err(ApiError::Process(format!(
                    "not ready at {base_url} after {ready_timeout:?}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn client(&self) -> &DecisionClient {
        &self.client
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn try_exit_status(&mut self) -> Result<Option<ExitStatus>, ApiError> {
        match self.child.as_mut() {
            Some(child) => child
                .try_wait()
                .map_err(|e| ApiError::Process(e.to_string())),
            None => Ok(None),
        }
    }

    /// Kill the process and wait for it to exit.
    pub fn shutdown(mut self) -> Result<ExitStatus, ApiError> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| ApiError::Process("already stopped".into()))?;
        stop(&mut child).map_err(|e| ApiError::Process(e.to_string()))
    }
}

fn stop(child: &mut Child) -> std::io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    child.kill()?;
    child.wait()
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = stop(&mut child);
        }
    }
}
