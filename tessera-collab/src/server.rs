//! Connection gateway: websocket upgrade, authorization, session startup.
//!
//! Architecture:
//! ```text
//!  GET /ws/{baseId}?ticket=…
//!        │
//!        ▼
//!  ┌─────────────┐  404 bad path / 401 rejected
//!  │  handshake  │────────────────────────────────► (no session)
//!  │  callback   │
//!  └──────┬──────┘
//!         │ Identity
//!         ▼
//!  Session::run ◄──── Hub clone (one Hub per process)
//! ```
//!
//! Every accepted TCP stream runs on its own task. A failed handshake is
//! logged for that peer and never stops the accept loop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite;

use crate::auth::{AuthError, Authorizer};
use crate::hub::{Hub, HubConfig};
use crate::presence::Identity;
use crate::session::{FrameHandler, IgnoreFrames, Session, SessionConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Hub buffer sizes
    pub hub: HubConfig,
    /// Per-connection limits and timers
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            hub: HubConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reject settings the hub or sessions cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("broadcast_capacity", self.hub.broadcast_capacity),
            ("presence_capacity", self.hub.presence_capacity),
            ("mailbox_capacity", self.session.mailbox_capacity),
            ("reply_capacity", self.session.reply_capacity),
            ("max_frame_size", self.session.max_frame_size),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.session.write_timeout.is_zero() {
            return Err(ConfigError::Zero("write_timeout"));
        }
        if self.session.ping_period.is_zero() {
            return Err(ConfigError::Zero("ping_period"));
        }
        if self.session.ping_period >= self.session.pong_wait {
            return Err(ConfigError::ProbeTiming {
                ping_period: self.session.ping_period,
                pong_wait: self.session.pong_wait,
            });
        }
        Ok(())
    }
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("ping_period ({ping_period:?}) must be shorter than pong_wait ({pong_wait:?})")]
    ProbeTiming {
        ping_period: std::time::Duration,
        pong_wait: std::time::Duration,
    },
}

/// Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
}

/// Why an upgrade was refused.
#[derive(Debug, thiserror::Error)]
enum Rejection {
    #[error("no workspace route for '{0}'")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
}

impl Rejection {
    fn into_response(self) -> ErrorResponse {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        };
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = status;
        response
    }
}

/// Workspace id from an upgrade path of the form `/ws/{workspaceId}`.
///
/// The segment is percent-decoded; it must be non-empty UTF-8 once decoded.
fn workspace_from_path(path: &str) -> Option<String> {
    let segment = path.strip_prefix("/ws/")?;
    if segment.contains('/') {
        return None;
    }
    let id = percent_decode_str(segment).decode_utf8().ok()?;
    (!id.is_empty()).then(|| id.into_owned())
}

/// Accepts websocket upgrades and turns them into hub sessions.
#[derive(Clone)]
pub struct Gateway {
    config: ServerConfig,
    hub: Hub,
    authorizer: Arc<dyn Authorizer>,
    handler: Arc<dyn FrameHandler>,
}

impl Gateway {
    pub fn new(config: ServerConfig, hub: Hub, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            config,
            hub,
            authorizer,
            handler: Arc::new(IgnoreFrames),
        }
    }

    /// Route well-formed client frames of unhandled types to `handler`.
    pub fn with_frame_handler(mut self, handler: Arc<dyn FrameHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Bind `bind_addr` and serve until the process exits.
    pub async fn run(self) -> Result<(), GatewayError> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        if let Ok(addr) = listener.local_addr() {
            log::info!("Collaboration gateway listening on {addr}");
        }

        tokio::pin!(shutdown);
        loop {
            let (stream, addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                        continue;
                    }
                },
            };
            log::debug!("New TCP connection from {addr}");

            let gateway = self.clone();
            tokio::spawn(async move {
                match gateway.handle_connection(stream, addr).await {
                    Ok(()) => {}
                    // Rejected upgrades were already logged by the callback.
                    Err(GatewayError::Handshake(tungstenite::Error::Http(_))) => {}
                    Err(e) => log::warn!("Connection from {addr} failed: {e}"),
                }
            });
        }

        log::info!("Collaboration gateway stopped accepting connections");
        Ok(())
    }

    fn admit(&self, request: &Request) -> Result<(String, Identity), Rejection> {
        let path = request.uri().path();
        let workspace_id =
            workspace_from_path(path).ok_or_else(|| Rejection::NotFound(path.to_string()))?;
        let query = request.uri().query().unwrap_or_default();
        let identity = self.authorizer.authorize(&workspace_id, query)?;
        Ok((workspace_id, identity))
    }

    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) -> Result<(), GatewayError> {
        let mut admitted = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match self.admit(request) {
                Ok(accepted) => {
                    admitted = Some(accepted);
                    Ok(response)
                }
                Err(rejection) => {
                    log::warn!("Rejected upgrade from {addr}: {rejection}");
                    Err(rejection.into_response())
                }
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            callback,
            Some(self.config.session.websocket_config()),
        )
        .await?;

        let Some((workspace_id, identity)) = admitted else {
            return Ok(());
        };
        log::info!(
            "WebSocket connection from {addr}: {} joined workspace {workspace_id}",
            identity.user_id
        );

        let session = Session::new(
            workspace_id,
            identity,
            self.hub.clone(),
            self.config.session.clone(),
            self.handler.clone(),
        );
        session.run(ws).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.hub.broadcast_capacity, 256);
        assert_eq!(config.session.mailbox_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = ServerConfig::default();
        config.session.mailbox_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("mailbox_capacity")));

        let mut config = ServerConfig::default();
        config.hub.broadcast_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("broadcast_capacity")));
    }

    #[test]
    fn test_validate_rejects_probe_slower_than_deadline() {
        let mut config = ServerConfig::default();
        config.session.ping_period = Duration::from_secs(60);
        config.session.pong_wait = Duration::from_secs(60);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ProbeTiming { .. })
        ));
    }

    #[test]
    fn test_workspace_from_path() {
        assert_eq!(workspace_from_path("/ws/base-1").as_deref(), Some("base-1"));
        assert_eq!(
            workspace_from_path("/ws/team%20space%2Fq%3F1").as_deref(),
            Some("team space/q?1")
        );
        assert_eq!(workspace_from_path("/ws/%E2%9C%93").as_deref(), Some("\u{2713}"));
        assert_eq!(workspace_from_path("/ws/%FF"), None);
        assert_eq!(workspace_from_path("/ws/"), None);
        assert_eq!(workspace_from_path("/ws"), None);
        assert_eq!(workspace_from_path("/ws/base-1/extra"), None);
        assert_eq!(workspace_from_path("/api/base-1"), None);
    }

    #[test]
    fn test_rejection_status_codes() {
        let not_found = Rejection::NotFound("/nope".into()).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let unauthorized = Rejection::from(AuthError::InvalidTicket).into_response();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert!(unauthorized.body().as_deref().unwrap().contains("unauthorized"));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let hub = Hub::spawn(HubConfig::default());
        let gateway = Gateway::new(
            ServerConfig::default(),
            hub,
            Arc::new(crate::auth::TicketStore::default()),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            gateway.serve(listener, async {}),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let hub = Hub::spawn(HubConfig::default());
        let mut config = ServerConfig::default();
        config.session.reply_capacity = 0;
        let gateway = Gateway::new(config, hub, Arc::new(crate::auth::TicketStore::default()));
        assert!(matches!(gateway.run().await, Err(GatewayError::Config(_))));
    }
}
