//! Source and flow configuration model.
//!
//! The engine treats configuration as a read-only input supplied by an
//! external collaborator through [`ConfigProvider`]. Records are re-read on
//! every trigger, so edits take effect on the next run rather than
//! retroactively on an in-flight suspension.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StepError;

/// The closed set of step kinds a flow may contain.
///
/// Dispatch on this enum is exhaustive by construction; an unknown kind in a
/// config file fails deserialization before the engine ever sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ApiKey,
    Http,
    Oauth,
    Extract,
    Script,
    Log,
    Webview,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ApiKey => "api_key",
            StepKind::Http => "http",
            StepKind::Oauth => "oauth",
            StepKind::Extract => "extract",
            StepKind::Script => "script",
            StepKind::Log => "log",
            StepKind::Webview => "webview",
        }
    }
}

/// One unit of work in a flow.
///
/// `outputs` maps a handler result key (e.g. `http_response`, `value`) to the
/// variable name it is published under. `secrets` lists the result keys that
/// are persisted to the secret store — nothing else is ever implicitly stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    #[serde(rename = "use")]
    pub kind: StepKind,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<String>,
}

/// An ordered step list owned by an integration, shared read-only by every
/// source referencing it. Immutable at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(rename = "id")]
    pub integration_id: String,
    pub steps: Vec<StepSpec>,
}

/// When a source is collected: a cron expression takes precedence over the
/// fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
}

fn default_interval_minutes() -> u64 {
    60
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule {
            cron: None,
            interval_minutes: default_interval_minutes(),
        }
    }
}

/// A configured data source. Created and edited by the external CRUD
/// collaborator; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    #[serde(default)]
    pub integration_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Initial values for the run's `context` scope.
    #[serde(default)]
    pub vars: Map<String, Value>,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Inline flow, overriding the integration's definition when present.
    #[serde(default)]
    pub flow: Option<Vec<StepSpec>>,
}

fn default_enabled() -> bool {
    true
}

impl Source {
    /// Resolves the step list this source runs: its inline flow, or the flow
    /// owned by the integration it references.
    pub fn resolve_flow(&self, provider: &dyn ConfigProvider) -> Result<Vec<StepSpec>, StepError> {
        if let Some(flow) = &self.flow {
            return Ok(flow.clone());
        }
        let integration_id = self.integration_id.as_deref().ok_or_else(|| {
            StepError::config(format!(
                "source '{}' has no flow and no integration",
                self.id
            ))
        })?;
        let definition = provider
            .flow(integration_id)
            .map_err(|e| StepError::config(format!("failed to load flow for '{integration_id}': {e}")))?
            .ok_or_else(|| StepError::config(format!("integration '{integration_id}' not found")))?;
        Ok(definition.steps)
    }
}

/// Read-only access to source and flow records.
///
/// Implementations must tolerate being called on every trigger; the engine
/// never caches what they return.
pub trait ConfigProvider: Send + Sync {
    fn source(&self, source_id: &str) -> Result<Option<Source>>;
    fn sources(&self) -> Result<Vec<Source>>;
    fn flow(&self, integration_id: &str) -> Result<Option<FlowDefinition>>;
}

/// JSON-file-backed provider: `sources.json` and `integrations.json` in a
/// data directory, re-read on every call.
pub struct JsonConfigStore {
    sources_file: PathBuf,
    integrations_file: PathBuf,
}

impl JsonConfigStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        let dir = data_dir.as_ref();
        Self {
            sources_file: dir.join("sources.json"),
            integrations_file: dir.join("integrations.json"),
        }
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

impl ConfigProvider for JsonConfigStore {
    fn source(&self, source_id: &str) -> Result<Option<Source>> {
        Ok(self.sources()?.into_iter().find(|s| s.id == source_id))
    }

    fn sources(&self) -> Result<Vec<Source>> {
        Self::read_json(&self.sources_file)
    }

    fn flow(&self, integration_id: &str) -> Result<Option<FlowDefinition>> {
        let definitions: Vec<FlowDefinition> = Self::read_json(&self.integrations_file)?;
        Ok(definitions
            .into_iter()
            .find(|f| f.integration_id == integration_id))
    }
}

/// In-memory provider, used by tests and embedders that manage records
/// themselves.
#[derive(Default)]
pub struct MemoryConfigStore {
    sources: RwLock<Vec<Source>>,
    flows: RwLock<Vec<FlowDefinition>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_source(&self, source: Source) {
        let mut sources = self.sources.write().unwrap();
        if let Some(existing) = sources.iter_mut().find(|s| s.id == source.id) {
            *existing = source;
        } else {
            sources.push(source);
        }
    }

    pub fn upsert_flow(&self, flow: FlowDefinition) {
        let mut flows = self.flows.write().unwrap();
        if let Some(existing) = flows
            .iter_mut()
            .find(|f| f.integration_id == flow.integration_id)
        {
            *existing = flow;
        } else {
            flows.push(flow);
        }
    }

    pub fn remove_source(&self, source_id: &str) {
        self.sources.write().unwrap().retain(|s| s.id != source_id);
    }
}

impl ConfigProvider for MemoryConfigStore {
    fn source(&self, source_id: &str) -> Result<Option<Source>> {
        Ok(self
            .sources
            .read()
            .unwrap()
            .iter()
            .find(|s| s.id == source_id)
            .cloned())
    }

    fn sources(&self) -> Result<Vec<Source>> {
        Ok(self.sources.read().unwrap().clone())
    }

    fn flow(&self, integration_id: &str) -> Result<Option<FlowDefinition>> {
        Ok(self
            .flows
            .read()
            .unwrap()
            .iter()
            .find(|f| f.integration_id == integration_id)
            .cloned())
    }
}
