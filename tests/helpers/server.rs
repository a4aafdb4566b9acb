use canopy::authz::web::DecisionService;
use canopy::client::DecisionClient;
use canopy::settings::Settings;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// An in-process decision service on an ephemeral port, shut down on drop.
pub struct TestServer {
    client: DecisionClient,
    shutdown: Option<oneshot::Sender<()>>,
    _handle: JoinHandle<miette::Result<()>>,
}

impl TestServer {
    pub async fn start(service: DecisionService) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("No local address");
        let app = canopy::web::app(service, &Settings::default());

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(canopy::web::serve_with_shutdown(listener, app, async move {
            let _ = rx.await;
        }));

        let client =
            DecisionClient::new(&format!("http://{addr}")).expect("Failed to build client");
        Self {
            client,
            shutdown: Some(tx),
            _handle: handle,
        }
    }

    /// Start with nothing loaded.
    pub async fn empty() -> Self {
        Self::start(DecisionService::new()).await
    }

    pub fn client(&self) -> &DecisionClient {
        &self.client
    }

    pub fn base_url(&self) -> String {
        self.client.base_url().as_str().trim_end_matches('/').to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
