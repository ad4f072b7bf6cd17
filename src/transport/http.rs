//! HTTP server and client for master/worker frames (Layer 0)
//!
//! Frames are posted as JSON `Envelope`s to `POST /rpc`; the reply body is the
//! handler's `WireMessage`. `GET /health` reports the host and its role.

use crate::transport::errors::TransportError;
use crate::transport::message::{Envelope, WireMessage};
use crate::transport::transport::{MessageHandler, MessageSender};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, warn, Logger};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// HTTP client for sending frames to peers
pub struct HttpMessageSender {
    client: reqwest::Client,
    logger: Logger,
}

impl HttpMessageSender {
    pub fn new(request_timeout: Duration, logger: Logger) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Handler(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, logger })
    }
}

#[async_trait::async_trait]
impl MessageSender for HttpMessageSender {
    async fn send(&self, address: &str, envelope: Envelope) -> Result<WireMessage, TransportError> {
        let url = format!("{}/rpc", address.trim_end_matches('/'));
        let kind = envelope.message.kind();

        debug!(self.logger, "Sending HTTP POST request";
            "url" => &url,
            "kind" => kind
        );

        let response = self
            .client
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| {
                warn!(self.logger, "HTTP request failed"; "error" => %e, "url" => &url);
                TransportError::SendFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                }
            })?;

        if !response.status().is_success() {
            warn!(self.logger, "HTTP request returned error status";
                "status" => response.status().as_u16(),
                "url" => &url
            );
            return Err(TransportError::SendFailed {
                address: address.to_string(),
                reason: format!("HTTP status {}", response.status()),
            });
        }

        response
            .json::<WireMessage>()
            .await
            .map_err(|e| TransportError::DeserializationError {
                reason: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub host: String,
    pub role: String,
}

/// HTTP server for receiving frames
#[derive(Clone)]
pub struct HttpServer {
    handler: Arc<dyn MessageHandler>,
    host: String,
    role: &'static str,
    address: SocketAddr,
    /// Additional routes served next to `/rpc` and `/health`
    extra: Option<Router>,
    logger: Logger,
}

impl HttpServer {
    pub fn new(
        host: impl Into<String>,
        role: &'static str,
        address: SocketAddr,
        handler: Arc<dyn MessageHandler>,
        logger: Logger,
    ) -> Self {
        Self {
            handler,
            host: host.into(),
            role,
            address,
            extra: None,
            logger,
        }
    }

    pub fn with_routes(mut self, routes: Router) -> Self {
        self.extra = Some(routes);
        self
    }

    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/rpc", post(handle_rpc))
            .route("/health", get(handle_health))
            .with_state(self.clone());
        match &self.extra {
            Some(extra) => router.merge(extra.clone()),
            None => router,
        }
    }

    /// Bind and serve until the task is dropped
    pub async fn start(self) -> Result<(), std::io::Error> {
        info!(self.logger, "Starting HTTP server"; "address" => %self.address);

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.address)
            .await
            .map_err(|e| {
                error!(self.logger, "Failed to bind HTTP server"; "error" => %e);
                e
            })?;

        info!(self.logger, "HTTP server listening"; "address" => %self.address);

        axum::serve(listener, app).await.map_err(|e| {
            error!(self.logger, "HTTP server error"; "error" => %e);
            e
        })
    }
}

async fn handle_rpc(State(server): State<HttpServer>, Json(envelope): Json<Envelope>) -> Response {
    debug!(server.logger, "Received frame via HTTP";
        "from" => &envelope.from,
        "kind" => envelope.message.kind()
    );

    match server.handler.handle(envelope).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => {
            error!(server.logger, "Failed to handle frame"; "error" => %e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response()
        }
    }
}

async fn handle_health(State(server): State<HttpServer>) -> Response {
    Json(HealthResponse {
        status: "ok".to_string(),
        host: server.host.clone(),
        role: server.role.to_string(),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message::{CorrelationKey, EventType};

    struct AckHandler;

    #[async_trait::async_trait]
    impl MessageHandler for AckHandler {
        async fn handle(&self, envelope: Envelope) -> Result<WireMessage, TransportError> {
            match envelope.message.correlation_key() {
                Some(key) => Ok(WireMessage::ack(key)),
                None => Err(TransportError::Handler("no key".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_http_round_trip() {
        let logger = Logger::root(slog::Discard, slog::o!());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new("m1", "master", addr, Arc::new(AckHandler), logger.clone());
        let app = server.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let sender = HttpMessageSender::new(Duration::from_secs(2), logger).unwrap();
        let key = CorrelationKey::new("t1", 1, EventType::Running);
        let reply = sender
            .send(
                &format!("http://{}", addr),
                Envelope::new("w1", WireMessage::ack(key.clone())),
            )
            .await
            .unwrap();
        assert!(reply.acknowledges(&key));

        let health: HealthResponse = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health.host, "m1");
        assert_eq!(health.role, "master");
    }

    #[tokio::test]
    async fn test_http_send_to_closed_port_fails() {
        let logger = Logger::root(slog::Discard, slog::o!());
        let sender = HttpMessageSender::new(Duration::from_millis(500), logger).unwrap();
        let key = CorrelationKey::new("t1", 1, EventType::Running);
        let result = sender
            .send("http://127.0.0.1:1", Envelope::new("w1", WireMessage::ack(key)))
            .await;
        assert!(matches!(result, Err(TransportError::SendFailed { .. })));
    }
}
