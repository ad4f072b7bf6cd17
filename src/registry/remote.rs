//! Coordination service over HTTP
//!
//! `RegistryService` exposes an `InMemoryCoordinator` to other processes and
//! expires sessions that stop sending keepalives. `HttpRegistryClient` is the
//! matching `RegistryClient`; children watches are served by polling and
//! diffing the child list.

use super::{InMemoryCoordinator, InMemoryRegistryClient, RegistryClient, RegistryError, RegistryEvent};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use slog::{debug, info, warn, Logger};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistryOp {
    AcquireLock { path: String },
    ReleaseLock { path: String },
    LockHolder { path: String },
    HoldsLock { path: String },
    RegisterEphemeral { path: String, payload: String },
    Unregister { path: String },
    Get { path: String },
    Children { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RegistryReply {
    Done,
    Flag(bool),
    Payload(Option<String>),
    Children(Vec<(String, String)>),
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenSessionRequest {
    identity: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenSessionResponse {
    session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeepaliveRequest {
    session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpRequest {
    session_id: String,
    op: RegistryOp,
}

struct SessionEntry {
    client: InMemoryRegistryClient,
    last_seen: Instant,
}

/// HTTP front of a coordinator
#[derive(Clone)]
pub struct RegistryService {
    coordinator: Arc<InMemoryCoordinator>,
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
    session_timeout: Duration,
    logger: Logger,
}

impl RegistryService {
    pub fn new(coordinator: Arc<InMemoryCoordinator>, session_timeout: Duration, logger: Logger) -> Self {
        Self {
            coordinator,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            session_timeout,
            logger,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/registry/session", post(handle_open_session))
            .route("/registry/keepalive", post(handle_keepalive))
            .route("/registry/op", post(handle_op))
            .with_state(self.clone())
    }

    /// Expire sessions whose last keepalive is older than the session timeout
    pub async fn expire_idle_sessions(&self) -> Vec<String> {
        let expired: Vec<String> = {
            let mut sessions = self.sessions.lock().await;
            let now = Instant::now();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_seen) > self.session_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                sessions.remove(id);
            }
            ids
        };

        for session_id in &expired {
            info!(self.logger, "Expiring idle registry session"; "session_id" => session_id);
            self.coordinator.expire_session(session_id).await;
        }
        expired
    }

    pub fn spawn_expiry_sweep(&self) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.session_timeout / 2);
            loop {
                ticker.tick().await;
                service.expire_idle_sessions().await;
            }
        })
    }

    pub async fn start(self, address: SocketAddr) -> Result<(), std::io::Error> {
        let sweep = self.spawn_expiry_sweep();
        let listener = tokio::net::TcpListener::bind(address).await?;
        info!(self.logger, "Coordinator listening"; "address" => %address);
        let result = axum::serve(listener, self.router()).await;
        sweep.abort();
        result
    }

    async fn apply(&self, session_id: &str, op: RegistryOp) -> Result<RegistryReply, RegistryError> {
        let client = {
            let sessions = self.sessions.lock().await;
            match sessions.get(session_id) {
                Some(entry) => entry.client.clone(),
                None => {
                    return Err(RegistryError::SessionExpired {
                        session_id: session_id.to_string(),
                    })
                }
            }
        };

        match op {
            RegistryOp::AcquireLock { path } => client.acquire_lock(&path).await.map(RegistryReply::Flag),
            RegistryOp::ReleaseLock { path } => {
                client.release_lock(&path).await.map(|_| RegistryReply::Done)
            }
            RegistryOp::LockHolder { path } => {
                client.lock_holder(&path).await.map(RegistryReply::Payload)
            }
            RegistryOp::HoldsLock { path } => client.holds_lock(&path).await.map(RegistryReply::Flag),
            RegistryOp::RegisterEphemeral { path, payload } => client
                .register_ephemeral(&path, payload)
                .await
                .map(|_| RegistryReply::Done),
            RegistryOp::Unregister { path } => {
                client.unregister(&path).await.map(|_| RegistryReply::Done)
            }
            RegistryOp::Get { path } => client.get(&path).await.map(RegistryReply::Payload),
            RegistryOp::Children { path } => {
                client.children(&path).await.map(RegistryReply::Children)
            }
        }
    }
}

async fn handle_open_session(
    State(service): State<RegistryService>,
    Json(req): Json<OpenSessionRequest>,
) -> Json<OpenSessionResponse> {
    let client = service.coordinator.connect(&req.identity).await;
    let session_id = client.session_id().to_string();
    debug!(service.logger, "Opened registry session";
        "identity" => &req.identity,
        "session_id" => &session_id
    );
    service.sessions.lock().await.insert(
        session_id.clone(),
        SessionEntry {
            client,
            last_seen: Instant::now(),
        },
    );
    Json(OpenSessionResponse { session_id })
}

async fn handle_keepalive(
    State(service): State<RegistryService>,
    Json(req): Json<KeepaliveRequest>,
) -> StatusCode {
    match service.sessions.lock().await.get_mut(&req.session_id) {
        Some(entry) => {
            entry.last_seen = Instant::now();
            StatusCode::OK
        }
        None => StatusCode::GONE,
    }
}

async fn handle_op(State(service): State<RegistryService>, Json(req): Json<OpRequest>) -> impl IntoResponse {
    Json(service.apply(&req.session_id, req.op).await)
}

/// Connection to the coordinator shared by the client and its background tasks
struct RemoteSession {
    http: reqwest::Client,
    base_url: String,
    session_id: String,
    expired: AtomicBool,
}

impl RemoteSession {
    fn expired_error(&self) -> RegistryError {
        RegistryError::SessionExpired {
            session_id: self.session_id.clone(),
        }
    }

    async fn call(&self, op: RegistryOp) -> Result<RegistryReply, RegistryError> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(self.expired_error());
        }

        let reply: Result<RegistryReply, RegistryError> = self
            .http
            .post(format!("{}/registry/op", self.base_url))
            .json(&OpRequest {
                session_id: self.session_id.clone(),
                op,
            })
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        if let Err(RegistryError::SessionExpired { .. }) = &reply {
            self.expired.store(true, Ordering::SeqCst);
        }
        reply
    }

    async fn keepalive(&self) -> Result<(), RegistryError> {
        let response = self
            .http
            .post(format!("{}/registry/keepalive", self.base_url))
            .json(&KeepaliveRequest {
                session_id: self.session_id.clone(),
            })
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        if response.status().as_u16() == StatusCode::GONE.as_u16() {
            self.expired.store(true, Ordering::SeqCst);
            return Err(self.expired_error());
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<(String, String)>, RegistryError> {
        match self.call(RegistryOp::Children { path: path.to_string() }).await? {
            RegistryReply::Children(children) => Ok(children),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: RegistryReply) -> RegistryError {
    RegistryError::Unavailable(format!("unexpected registry reply {:?}", reply))
}

/// Events turning snapshot `before` into `after`
fn diff_children(
    parent: &str,
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> Vec<RegistryEvent> {
    let mut events = Vec::new();
    for (name, payload) in after {
        if before.get(name) != Some(payload) {
            events.push(RegistryEvent::ChildUpserted {
                parent: parent.to_string(),
                name: name.clone(),
                payload: payload.clone(),
            });
        }
    }
    for name in before.keys() {
        if !after.contains_key(name) {
            events.push(RegistryEvent::ChildRemoved {
                parent: parent.to_string(),
                name: name.clone(),
            });
        }
    }
    events
}

/// Registry client talking to a `RegistryService`
pub struct HttpRegistryClient {
    session: Arc<RemoteSession>,
    identity: String,
    poll_interval: Duration,
    watches: Mutex<HashMap<String, broadcast::Sender<RegistryEvent>>>,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
    logger: Logger,
}

impl HttpRegistryClient {
    /// Open a session and start its keepalive loop
    pub async fn connect(
        base_url: &str,
        identity: &str,
        keepalive_interval: Duration,
        poll_interval: Duration,
        logger: Logger,
    ) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let opened: OpenSessionResponse = http
            .post(format!("{}/registry/session", base_url))
            .json(&OpenSessionRequest {
                identity: identity.to_string(),
            })
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        info!(logger, "Registry session opened";
            "identity" => identity,
            "session_id" => &opened.session_id
        );

        let session = Arc::new(RemoteSession {
            http,
            base_url,
            session_id: opened.session_id,
            expired: AtomicBool::new(false),
        });

        let keepalive_session = session.clone();
        let keepalive_logger = logger.clone();
        let keepalive = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive_interval);
            loop {
                ticker.tick().await;
                match keepalive_session.keepalive().await {
                    Ok(()) => {}
                    Err(RegistryError::SessionExpired { session_id }) => {
                        warn!(keepalive_logger, "Registry session expired"; "session_id" => session_id);
                        break;
                    }
                    Err(e) => {
                        warn!(keepalive_logger, "Registry keepalive failed"; "error" => %e);
                    }
                }
            }
        });

        Ok(Self {
            session,
            identity: identity.to_string(),
            poll_interval,
            watches: Mutex::new(HashMap::new()),
            background: std::sync::Mutex::new(vec![keepalive]),
            logger,
        })
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut background) = self.background.lock() {
            background.push(handle);
        }
    }
}

impl Drop for HttpRegistryClient {
    fn drop(&mut self) {
        if let Ok(background) = self.background.lock() {
            for handle in background.iter() {
                handle.abort();
            }
        }
    }
}

#[async_trait::async_trait]
impl RegistryClient for HttpRegistryClient {
    fn session_id(&self) -> &str {
        &self.session.session_id
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn acquire_lock(&self, path: &str) -> Result<bool, RegistryError> {
        match self.session.call(RegistryOp::AcquireLock { path: path.to_string() }).await? {
            RegistryReply::Flag(acquired) => Ok(acquired),
            other => Err(unexpected(other)),
        }
    }

    async fn release_lock(&self, path: &str) -> Result<(), RegistryError> {
        self.session
            .call(RegistryOp::ReleaseLock { path: path.to_string() })
            .await
            .map(|_| ())
    }

    async fn lock_holder(&self, path: &str) -> Result<Option<String>, RegistryError> {
        match self.session.call(RegistryOp::LockHolder { path: path.to_string() }).await? {
            RegistryReply::Payload(holder) => Ok(holder),
            other => Err(unexpected(other)),
        }
    }

    async fn holds_lock(&self, path: &str) -> Result<bool, RegistryError> {
        match self.session.call(RegistryOp::HoldsLock { path: path.to_string() }).await? {
            RegistryReply::Flag(held) => Ok(held),
            other => Err(unexpected(other)),
        }
    }

    async fn register_ephemeral(&self, path: &str, payload: String) -> Result<(), RegistryError> {
        self.session
            .call(RegistryOp::RegisterEphemeral {
                path: path.to_string(),
                payload,
            })
            .await
            .map(|_| ())
    }

    async fn unregister(&self, path: &str) -> Result<(), RegistryError> {
        self.session
            .call(RegistryOp::Unregister { path: path.to_string() })
            .await
            .map(|_| ())
    }

    async fn get(&self, path: &str) -> Result<Option<String>, RegistryError> {
        match self.session.call(RegistryOp::Get { path: path.to_string() }).await? {
            RegistryReply::Payload(payload) => Ok(payload),
            other => Err(unexpected(other)),
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<(String, String)>, RegistryError> {
        self.session.children(path).await
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<broadcast::Receiver<RegistryEvent>, RegistryError> {
        let mut watches = self.watches.lock().await;
        if let Some(tx) = watches.get(path) {
            return Ok(tx.subscribe());
        }

        let initial: BTreeMap<String, String> = self.session.children(path).await?.into_iter().collect();
        let (tx, rx) = broadcast::channel(256);
        watches.insert(path.to_string(), tx.clone());

        let session = self.session.clone();
        let parent = path.to_string();
        let interval = self.poll_interval;
        let logger = self.logger.clone();
        self.track(tokio::spawn(async move {
            let mut known = initial;
            loop {
                tokio::time::sleep(interval).await;
                match session.children(&parent).await {
                    Ok(children) => {
                        let current: BTreeMap<String, String> = children.into_iter().collect();
                        for event in diff_children(&parent, &known, &current) {
                            let _ = tx.send(event);
                        }
                        known = current;
                    }
                    Err(RegistryError::SessionExpired { .. }) => break,
                    Err(e) => {
                        debug!(logger, "Children poll failed"; "path" => &parent, "error" => %e);
                    }
                }
            }
        }));

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    async fn start_service(session_timeout: Duration) -> (RegistryService, String) {
        let service = RegistryService::new(InMemoryCoordinator::new(), session_timeout, logger());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = service.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (service, format!("http://{}", addr))
    }

    #[test]
    fn test_diff_children() {
        let before = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "1".to_string()),
        ]);
        let after = BTreeMap::from([
            ("a".to_string(), "2".to_string()),
            ("c".to_string(), "1".to_string()),
        ]);
        let events = diff_children("/p", &before, &after);
        assert_eq!(events.len(), 3);
        assert!(events.contains(&RegistryEvent::ChildRemoved {
            parent: "/p".to_string(),
            name: "b".to_string()
        }));
        assert!(diff_children("/p", &after, &after).is_empty());
    }

    #[tokio::test]
    async fn test_remote_lock_and_nodes() {
        let (_service, url) = start_service(Duration::from_secs(30)).await;
        let interval = Duration::from_millis(50);
        let a = HttpRegistryClient::connect(&url, "master-a", interval, interval, logger())
            .await
            .unwrap();
        let b = HttpRegistryClient::connect(&url, "master-b", interval, interval, logger())
            .await
            .unwrap();

        assert!(a.acquire_lock("/locks/wf").await.unwrap());
        assert!(!b.acquire_lock("/locks/wf").await.unwrap());
        assert_eq!(
            b.lock_holder("/locks/wf").await.unwrap(),
            Some("master-a".to_string())
        );

        let mut watch = b.watch_children("/dagrun/workers").await.unwrap();
        a.register_ephemeral("/dagrun/workers/w1", "{}".to_string())
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), watch.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, RegistryEvent::ChildUpserted { ref name, .. } if name == "w1"));
    }

    #[tokio::test]
    async fn test_idle_session_expires() {
        let (service, url) = start_service(Duration::from_millis(100)).await;
        // Keepalive slower than the timeout
        let client = HttpRegistryClient::connect(
            &url,
            "w1",
            Duration::from_secs(60),
            Duration::from_millis(50),
            logger(),
        )
        .await
        .unwrap();
        client.acquire_lock("/l").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let expired = service.expire_idle_sessions().await;
        assert_eq!(expired, vec![client.session_id().to_string()]);

        assert!(matches!(
            client.acquire_lock("/l").await,
            Err(RegistryError::SessionExpired { .. })
        ));
    }
}
