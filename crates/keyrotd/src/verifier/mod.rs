//! Cluster-wide consistency check behind `status`.
//!
//! Every node is asked for its state concurrently, each under its own
//! timeout. A slow or dead peer only marks its own row unreachable; it never
//! holds up or fails the report. Hash disagreement is reported, not raised.

pub mod client;
pub mod node;

pub use client::PeerClient;
pub use node::{HttpNode, LocalNode, NodeHandle};

use std::sync::Arc;
use std::time::Duration;

use common::protocol::{ClusterReport, HashComparison, NodeReport};
use common::EncryptionError;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default per-node status timeout.
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConsistencyVerifier {
    timeout: Duration,
}

impl Default for ConsistencyVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_TIMEOUT)
    }
}

impl ConsistencyVerifier {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Build the cluster report with `local` as the hash reference.
    ///
    /// # Errors
    ///
    /// Only a failure to read the local node's own configuration (other than
    /// it being absent) is an error. Peer failures become report rows.
    pub async fn status(
        &self,
        local: Arc<dyn NodeHandle>,
        peers: &[Arc<dyn NodeHandle>],
    ) -> Result<ClusterReport, EncryptionError> {
        let ids: Vec<String> = peers.iter().map(|p| p.node_id()).collect();
        let mut set = JoinSet::new();
        for (idx, peer) in peers.iter().enumerate() {
            let peer = Arc::clone(peer);
            let limit = self.timeout;
            set.spawn(async move { (idx, timeout(limit, peer.state()).await) });
        }

        let local_id = local.node_id();
        let local_row = match timeout(self.timeout, local.state()).await {
            Ok(Ok(state)) => Some(state),
            Ok(Err(EncryptionError::ConfigMissing(_))) => None,
            Ok(Err(e)) => {
                set.abort_all();
                return Err(e);
            }
            Err(_) => {
                set.abort_all();
                return Err(EncryptionError::Unavailable(format!(
                    "local state not read within {} ms",
                    self.timeout.as_millis()
                )));
            }
        };

        let mut rows: Vec<Option<NodeReport>> = vec![None; peers.len()];
        while let Some(joined) = set.join_next().await {
            let Ok((idx, outcome)) = joined else {
                warn!("peer status task failed");
                continue;
            };
            let id = &ids[idx];
            rows[idx] = Some(match outcome {
                Ok(Ok(state)) => NodeReport::from_state(&state),
                Ok(Err(EncryptionError::ConfigMissing(reason))) => {
                    NodeReport::unconfigured(id.clone(), reason)
                }
                Ok(Err(e)) => {
                    warn!(peer = %id, error = %e, "peer status failed");
                    NodeReport::unreachable(id.clone(), e.to_string())
                }
                Err(_) => {
                    warn!(peer = %id, "peer status timed out");
                    NodeReport::unreachable(
                        id.clone(),
                        format!("timed out after {} ms", self.timeout.as_millis()),
                    )
                }
            });
        }

        let peer_rows: Vec<NodeReport> = rows
            .into_iter()
            .zip(&ids)
            .map(|(row, id)| {
                row.unwrap_or_else(|| NodeReport::unreachable(id.clone(), "status task failed"))
            })
            .collect();

        let reference = local_row.as_ref().map(|s| s.config_hash.clone());
        let differing: Vec<String> = peer_rows
            .iter()
            .filter(|row| row.reachable && row.config_hash != reference)
            .map(|row| row.node_id.clone())
            .collect();
        let hashes = if differing.is_empty() {
            HashComparison::AllMatch
        } else {
            HashComparison::Mismatch {
                reference: local_id.clone(),
                differing,
            }
        };
        debug!(
            peers = peers.len(),
            matched = matches!(hashes, HashComparison::AllMatch),
            "cluster status assembled"
        );

        let mut nodes = Vec::with_capacity(peer_rows.len() + 1);
        let report = match local_row {
            Some(state) => {
                nodes.push(NodeReport::from_state(&state));
                nodes.extend(peer_rows);
                ClusterReport {
                    enabled: Some(state.enabled),
                    stage: Some(state.stage),
                    hashes,
                    active_key: state.active_key,
                    inactive_keys: state.inactive_keys,
                    nodes,
                }
            }
            None => {
                nodes.push(NodeReport::unconfigured(local_id, "no configuration file found"));
                nodes.extend(peer_rows);
                ClusterReport {
                    enabled: None,
                    stage: None,
                    hashes,
                    active_key: None,
                    inactive_keys: Vec::new(),
                    nodes,
                }
            }
        };
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::node::MockNodeHandle;
    use common::protocol::NodeState;
    use common::Stage;

    fn state(node: &str, stage: Stage, hash: &str) -> NodeState {
        NodeState {
            node_id: node.into(),
            stage,
            enabled: true,
            config_hash: hash.into(),
            active_key: Some("AES-CBC aescbckey-a".into()),
            inactive_keys: vec![],
        }
    }

    fn answering(node: &'static str, stage: Stage, hash: &'static str) -> Arc<dyn NodeHandle> {
        let mut mock = MockNodeHandle::new();
        mock.expect_node_id().return_const(node.to_string());
        mock.expect_state()
            .returning(move || Ok(state(node, stage, hash)));
        Arc::new(mock)
    }

    fn failing(node: &'static str, err: fn() -> EncryptionError) -> Arc<dyn NodeHandle> {
        let mut mock = MockNodeHandle::new();
        mock.expect_node_id().return_const(node.to_string());
        mock.expect_state().returning(move || Err(err()));
        Arc::new(mock)
    }

    /// Never answers within any sane timeout.
    struct Stuck;

    #[async_trait::async_trait]
    impl NodeHandle for Stuck {
        fn node_id(&self) -> String {
            "server-stuck".into()
        }

        async fn state(&self) -> Result<NodeState, EncryptionError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(EncryptionError::Unavailable("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn all_nodes_equal() {
        let report = ConsistencyVerifier::default()
            .status(
                answering("s1", Stage::Start, "h"),
                &[answering("s2", Stage::Start, "h"), answering("s3", Stage::Start, "h")],
            )
            .await
            .unwrap();
        assert!(report.hashes_match());
        assert_eq!(report.nodes.len(), 3);
        assert!(report.render().contains("All hashes match"));
    }

    #[tokio::test]
    async fn mismatch_names_differing_nodes_and_keeps_stages() {
        let report = ConsistencyVerifier::default()
            .status(
                answering("s1", Stage::Prepare, "new"),
                &[answering("s2", Stage::Start, "old"), answering("s3", Stage::Prepare, "new")],
            )
            .await
            .unwrap();
        assert_eq!(
            report.hashes,
            HashComparison::Mismatch {
                reference: "s1".into(),
                differing: vec!["s2".into()],
            }
        );
        assert_eq!(report.nodes[1].stage, Some(Stage::Start));
        assert_eq!(report.nodes[2].stage, Some(Stage::Prepare));
        assert!(report.render().contains("hash does not match between s1 and s2"));
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_block_or_mismatch() {
        let verifier = ConsistencyVerifier::new(Duration::from_millis(50));
        let report = verifier
            .status(
                answering("s1", Stage::Rotate, "h"),
                &[
                    Arc::new(Stuck),
                    failing("s3", || EncryptionError::Unavailable("refused".into())),
                ],
            )
            .await
            .unwrap();
        assert!(report.hashes_match());
        assert!(!report.nodes[1].reachable);
        assert!(report.nodes[1].error.as_deref().unwrap().contains("timed out"));
        assert!(!report.nodes[2].reachable);
    }

    #[tokio::test]
    async fn unconfigured_peer_is_a_mismatch() {
        let report = ConsistencyVerifier::default()
            .status(
                answering("s1", Stage::Start, "h"),
                &[failing("s2", || EncryptionError::ConfigMissing("none".into()))],
            )
            .await
            .unwrap();
        assert!(!report.hashes_match());
        assert!(report.nodes[1].reachable);
    }

    #[tokio::test]
    async fn unconfigured_local_node_reports_disabled() {
        let report = ConsistencyVerifier::default()
            .status(
                failing("s1", || EncryptionError::ConfigMissing("none".into())),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(report.enabled, None);
        assert!(report
            .render()
            .starts_with("Encryption Status: Disabled, no configuration file found"));
    }

    #[tokio::test]
    async fn corrupt_local_config_is_an_error() {
        let err = ConsistencyVerifier::default()
            .status(
                failing("s1", || EncryptionError::ConfigCorrupt("bad".into())),
                &[answering("s2", Stage::Start, "h")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EncryptionError::ConfigCorrupt(_)));
    }
}
