//! [`NodeHandle`]: anything the verifier can ask for a [`NodeState`].

use std::sync::Arc;

use async_trait::async_trait;
use common::protocol::{ErrorResponse, NodeState};
use common::EncryptionError;
use hyper::{StatusCode, Uri};

use super::client::PeerClient;
use crate::rotation::RotationController;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeHandle: Send + Sync {
    fn node_id(&self) -> String;

    /// # Errors
    ///
    /// [`EncryptionError::ConfigMissing`] when the node has never been
    /// configured; [`EncryptionError::Unavailable`] when it cannot be asked.
    async fn state(&self) -> Result<NodeState, EncryptionError>;
}

/// The node this process runs, answered from its own config file.
pub struct LocalNode {
    controller: Arc<RotationController>,
}

impl LocalNode {
    pub fn new(controller: Arc<RotationController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl NodeHandle for LocalNode {
    fn node_id(&self) -> String {
        self.controller.node_id().to_owned()
    }

    async fn state(&self) -> Result<NodeState, EncryptionError> {
        self.controller.local_state().await
    }
}

/// A peer reached over `GET {base}/v1/encrypt/state`.
#[derive(Debug, Clone)]
pub struct HttpNode {
    name: String,
    base_url: String,
    client: PeerClient,
}

impl HttpNode {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, client: PeerClient) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client,
        }
    }

    fn state_uri(&self) -> Result<Uri, EncryptionError> {
        format!("{}/v1/encrypt/state", self.base_url)
            .parse()
            .map_err(|e| EncryptionError::Unavailable(format!("{}: invalid peer url: {e}", self.name)))
    }
}

#[async_trait]
impl NodeHandle for HttpNode {
    fn node_id(&self) -> String {
        self.name.clone()
    }

    async fn state(&self) -> Result<NodeState, EncryptionError> {
        let (status, body) = self
            .client
            .get(self.state_uri()?)
            .await
            .map_err(|e| EncryptionError::Unavailable(format!("{}: {e:#}", self.name)))?;

        match status {
            StatusCode::OK => serde_json::from_slice(&body).map_err(|e| {
                EncryptionError::Unavailable(format!("{}: malformed state: {e}", self.name))
            }),
            // Only a peer that says so is unconfigured; any other 404 means
            // it does not serve this API.
            StatusCode::NOT_FOUND => match serde_json::from_slice::<ErrorResponse>(&body) {
                Ok(r) if r.code == "config_missing" => {
                    Err(EncryptionError::ConfigMissing(r.message))
                }
                _ => Err(EncryptionError::Unavailable(format!(
                    "{} has no encryption state endpoint",
                    self.name
                ))),
            },
            other => Err(EncryptionError::Unavailable(format!(
                "{} answered {other}",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::get, Json, Router};
    use common::Stage;

    fn sample_state() -> NodeState {
        NodeState {
            node_id: "server-2".into(),
            stage: Stage::Prepare,
            enabled: true,
            config_hash: "abc123".into(),
            active_key: Some("AES-CBC aescbckey-1".into()),
            inactive_keys: vec!["AES-CBC aescbckey-2".into()],
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn http_node_reads_peer_state() {
        let base = serve(Router::new().route(
            "/v1/encrypt/state",
            get(|| async { Json(sample_state()) }),
        ))
        .await;
        let node = HttpNode::new("server-2", base, PeerClient::new(None).unwrap());
        assert_eq!(node.state().await.unwrap(), sample_state());
    }

    #[tokio::test]
    async fn http_node_maps_not_found_to_config_missing() {
        let base = serve(Router::new().route(
            "/v1/encrypt/state",
            get(|| async {
                (
                    AxumStatus::NOT_FOUND,
                    Json(ErrorResponse::new("config_missing", "never bootstrapped")),
                )
            }),
        ))
        .await;
        let node = HttpNode::new("server-2", base, PeerClient::new(None).unwrap());
        match node.state().await {
            Err(EncryptionError::ConfigMissing(msg)) => assert_eq!(msg, "never bootstrapped"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_node_treats_foreign_404_as_unavailable() {
        let base = serve(Router::new().fallback(|| async {
            (
                AxumStatus::NOT_FOUND,
                Json(ErrorResponse::new("not_found", "the requested resource does not exist")),
            )
        }))
        .await;
        let node = HttpNode::new("server-2", base, PeerClient::new(None).unwrap());
        assert!(matches!(
            node.state().await,
            Err(EncryptionError::Unavailable(_))
        ));

        let bare = serve(Router::new()).await;
        let node = HttpNode::new("server-3", bare, PeerClient::new(None).unwrap());
        assert!(matches!(
            node.state().await,
            Err(EncryptionError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn http_node_reports_refused_connection_as_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let node = HttpNode::new(
            "server-3",
            format!("http://{addr}"),
            PeerClient::new(None).unwrap(),
        );
        assert!(matches!(
            node.state().await,
            Err(EncryptionError::Unavailable(_))
        ));
    }
}
