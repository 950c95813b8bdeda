//! Request and response types exchanged between nodes and operators.
//!
//! These types are serialised as JSON over the node HTTP API. Nothing in this
//! module ever carries raw key material; keys are described by name only.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Rotation stage
// ---------------------------------------------------------------------------

/// Step of the key-rotation protocol a node is currently on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    Prepare,
    Rotate,
    ReencryptActive,
    ReencryptFinished,
}

impl Stage {
    /// Wire / on-disk name of the stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Prepare => "prepare",
            Stage::Rotate => "rotate",
            Stage::ReencryptActive => "reencrypt_active",
            Stage::ReencryptFinished => "reencrypt_finished",
        }
    }

    /// A new rotation cycle may only begin from these stages.
    pub fn accepts_new_cycle(&self) -> bool {
        matches!(self, Stage::Start | Stage::ReencryptFinished)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Stage::Start),
            "prepare" => Ok(Stage::Prepare),
            "rotate" => Ok(Stage::Rotate),
            "reencrypt_active" => Ok(Stage::ReencryptActive),
            "reencrypt_finished" => Ok(Stage::ReencryptFinished),
            other => Err(format!("unknown stage {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Transition request
// ---------------------------------------------------------------------------

/// Stage name that requests the compound prepare + rotate + reencrypt cycle.
pub const ROTATE_KEYS: &str = "rotate_keys";

/// Request body for `PUT /v1/encrypt/config`.
///
/// Exactly one of `stage` or `enable` is expected. `stage` accepts
/// `prepare`, `rotate`, `rotate_keys` and `reencrypt_active`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionRequest {
    /// Requested stage transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// `true` → enable, `false` → disable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    /// Bypass the stage-ordering precondition.
    #[serde(default)]
    pub force: bool,
    /// Advance reencrypt without rewriting records.
    #[serde(default)]
    pub skip: bool,
}

// ---------------------------------------------------------------------------
// Node state and cluster report
// ---------------------------------------------------------------------------

/// A node's own view of its encryption configuration, served on
/// `GET /v1/encrypt/state` and polled by peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub stage: Stage,
    pub enabled: bool,
    /// Hex digest of the canonical configuration.
    pub config_hash: String,
    /// Label of the primary key, e.g. `"AES-CBC aescbckey-…"`. `None` when
    /// the identity provider is primary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_key: Option<String>,
    /// Labels of the retained legacy keys, in order.
    #[serde(default)]
    pub inactive_keys: Vec<String>,
}

/// One row of a [`ClusterReport`]. Recomputed on every status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: String,
    pub reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeReport {
    /// Row for a node that answered.
    pub fn from_state(state: &NodeState) -> Self {
        Self {
            node_id: state.node_id.clone(),
            reachable: true,
            stage: Some(state.stage),
            enabled: Some(state.enabled),
            config_hash: Some(state.config_hash.clone()),
            error: None,
        }
    }

    /// Row for a node that answered but has no configuration yet.
    pub fn unconfigured(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            reachable: true,
            stage: None,
            enabled: Some(false),
            config_hash: None,
            error: Some(reason.into()),
        }
    }

    /// Row for a node that failed to answer in time.
    pub fn unreachable(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            reachable: false,
            stage: None,
            enabled: None,
            config_hash: None,
            error: Some(reason.into()),
        }
    }
}

/// Outcome of comparing every reachable node's hash against the local one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HashComparison {
    AllMatch,
    Mismatch { reference: String, differing: Vec<String> },
}

/// Cluster-wide status assembled by the consistency verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterReport {
    /// `None` when the local node has never been configured.
    pub enabled: Option<bool>,
    /// Stage of the local node.
    pub stage: Option<Stage>,
    pub hashes: HashComparison,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_key: Option<String>,
    #[serde(default)]
    pub inactive_keys: Vec<String>,
    /// Local node first, then peers in the order they were configured.
    pub nodes: Vec<NodeReport>,
}

impl ClusterReport {
    pub fn hashes_match(&self) -> bool {
        matches!(self.hashes, HashComparison::AllMatch)
    }

    /// Human-readable report in the format printed by `status`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        match self.enabled {
            Some(true) => out.push_str("Encryption Status: Enabled\n"),
            Some(false) if self.stage.is_some() => out.push_str("Encryption Status: Disabled\n"),
            _ => {
                out.push_str("Encryption Status: Disabled, no configuration file found\n");
                return out;
            }
        }
        if let Some(stage) = self.stage {
            out.push_str(&format!("Current Rotation Stage: {stage}\n"));
        }
        match &self.hashes {
            HashComparison::AllMatch => {
                out.push_str("Server Encryption Hashes: All hashes match\n");
            }
            HashComparison::Mismatch {
                reference,
                differing,
            } => {
                out.push_str(&format!(
                    "Server Encryption Hashes: hash does not match between {reference} and {}\n",
                    differing.join(", ")
                ));
            }
        }

        out.push('\n');
        out.push_str(&format!("{:<8}{:<10}{}\n", "Active", "Key Type", "Name"));
        out.push_str(&format!("{:<8}{:<10}{}\n", "------", "--------", "----"));
        if let Some(active) = &self.active_key {
            out.push_str(&key_row(" *", active));
        }
        for key in &self.inactive_keys {
            out.push_str(&key_row("", key));
        }

        out.push('\n');
        out.push_str(&format!("{:<20}{:<20}{}\n", "Node", "Stage", "Hash"));
        for node in &self.nodes {
            let stage = match (node.reachable, node.stage) {
                (false, _) => "unreachable".to_string(),
                (true, Some(s)) => s.to_string(),
                (true, None) => "unconfigured".to_string(),
            };
            let hash = node
                .config_hash
                .as_deref()
                .map(|h| h.chars().take(12).collect::<String>())
                .unwrap_or_else(|| "-".into());
            out.push_str(&format!("{:<20}{:<20}{}\n", node.node_id, stage, hash));
        }
        out
    }
}

/// Split `"AES-CBC name"` into its type and name columns.
fn key_row(marker: &str, label: &str) -> String {
    let (kind, name) = label.split_once(' ').unwrap_or(("", label));
    format!("{marker:<8}{kind:<10}{name}\n")
}

/// Response body for `GET /v1/encrypt/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub report: ClusterReport,
    /// [`ClusterReport::render`] output.
    pub summary: String,
}

/// Response body for `POST /v1/encrypt/reload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadResponse {
    /// Whether a newer configuration was adopted from the generation marker.
    pub adopted: bool,
    pub state: NodeState,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"illegal_transition"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `"ok"` or `"degraded"`.
    pub status: String,
    /// Whether this node has a loadable encryption configuration.
    pub config_loaded: bool,
}
