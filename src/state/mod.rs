//! Per-source run state: status, pending interactions, suspension snapshots
//! and collected payloads.
//!
//! `status` / `message` / `pending_interaction` are the entire contract a
//! status-reporting collaborator needs to render "needs attention" banners;
//! nothing else in here is exposed outside the engine.

mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::StepSpec;

pub use store::{HistoryRecord, RunStateStore};

/// Lifecycle status of a source's most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Collecting normally; `last_payload` holds the latest data.
    Active,
    /// Blocked on external input; `pending_interaction` says what is needed.
    Suspended,
    /// The last run hit a hard failure; retried on the next trigger.
    Error,
    /// Configuration was edited since the last run; needs a refresh.
    ConfigChanged,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Suspended => "suspended",
            RunStatus::Error => "error",
            RunStatus::ConfigChanged => "config_changed",
        }
    }
}

/// What kind of external input a suspended run is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// Free-form values typed by a person (e.g. a missing API key).
    InputText,
    /// An OAuth authorization must be started; `data` carries the
    /// authorize-URL parameters.
    OauthStart,
    /// A yes/no acknowledgement.
    Confirm,
    /// A browser-assisted scrape whose payload has not been delivered yet.
    WebviewScrape,
}

/// One field a collaborator should collect for an [`Interaction`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionField {
    pub key: String,
    pub label: String,
    #[serde(default = "default_input_type")]
    pub input_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_input_type() -> String {
    "text".to_string()
}

fn default_required() -> bool {
    true
}

impl InteractionField {
    pub fn password(key: impl Into<String>, label: impl Into<String>) -> Self {
        InteractionField {
            key: key.into(),
            label: label.into(),
            input_type: "password".to_string(),
            description: None,
            required: true,
        }
    }

    pub fn text(key: impl Into<String>, label: impl Into<String>) -> Self {
        InteractionField {
            key: key.into(),
            label: label.into(),
            input_type: default_input_type(),
            description: None,
            required: true,
        }
    }
}

/// A structured request for external input, produced when a step cannot
/// complete. Consumed and cleared by `resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    #[serde(rename = "type")]
    pub kind: InteractionKind,
    pub step_id: String,
    #[serde(default)]
    pub fields: Vec<InteractionField>,
    pub message: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// The persisted status record for a source. Exactly one live instance per
/// source, created lazily, overwritten whole on every run or resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub source_id: String,
    pub status: RunStatus,
    pub message: Option<String>,
    pub pending_interaction: Option<Interaction>,
    pub last_payload: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(source_id: impl Into<String>, status: RunStatus) -> Self {
        RunState {
            source_id: source_id.into(),
            status,
            message: None,
            pending_interaction: None,
            last_payload: None,
            updated_at: Utc::now(),
        }
    }
}

/// The private snapshot persisted alongside a suspended RunState.
///
/// Restoring it gives `resume` exactly the `context` that existed at the
/// moment of suspension, plus the flow as it was then — a config edit landing
/// mid-suspension never retroactively changes a pending resume. The secrets
/// scope needs no copy; the store itself is durable. `run_id` tags every
/// outstanding interaction so stale asynchronous callbacks can be detected
/// and discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suspension {
    pub run_id: Uuid,
    pub step_index: usize,
    pub context: Map<String, Value>,
    pub flow: Vec<StepSpec>,
}
