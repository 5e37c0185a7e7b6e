//! The engine facade: ties configuration, secrets, run state, the executor
//! and the exclusivity guard together behind one API.
//!
//! Everything external collaborators do — triggering runs, answering
//! interactions, delivering webview payloads, OAuth callbacks — goes through
//! [`CollectorEngine`]. Run state is persisted here, on every transition, so
//! a process restart picks suspensions back up from disk.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{AuthManager, OAuthSettings};
use crate::config::{ConfigProvider, Source, StepKind};
use crate::error::StepError;
use crate::executor::{FlowExecutor, FlowOutcome, Scopes};
use crate::secrets::SecretsStore;
use crate::state::{InteractionKind, RunState, RunStateStore, RunStatus, Suspension};
use crate::webview::{ScrapeRequest, WebviewHost};

/// How a trigger was disposed of.
pub enum RunOutcome {
    /// The run executed; here is the state it left behind.
    Completed(RunState),
    /// Another run already held the source's guard (or the source is
    /// disabled); this trigger was dropped, not queued.
    Dropped,
}

pub struct CollectorEngine {
    config: Arc<dyn ConfigProvider>,
    secrets: Arc<SecretsStore>,
    states: Arc<RunStateStore>,
    auth: Arc<AuthManager>,
    executor: FlowExecutor,
    /// One guard per source id. A trigger that cannot take the guard is
    /// dropped; the next scheduled trigger will collect fresher data anyway.
    guards: DashMap<String, Arc<Mutex<()>>>,
    webview: Option<Arc<dyn WebviewHost>>,
}

impl CollectorEngine {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        secrets: Arc<SecretsStore>,
        states: Arc<RunStateStore>,
    ) -> Self {
        let auth = Arc::new(AuthManager::new(Arc::clone(&secrets)));
        let executor = FlowExecutor::new(Arc::clone(&auth), Arc::clone(&secrets));
        CollectorEngine {
            config,
            secrets,
            states,
            auth,
            executor,
            guards: DashMap::new(),
            webview: None,
        }
    }

    pub fn with_webview_host(mut self, host: Arc<dyn WebviewHost>) -> Self {
        self.webview = Some(host);
        self
    }

    /// Triggers a collection run for one source.
    pub async fn run(&self, source_id: &str) -> Result<RunOutcome> {
        let Some(_guard) = self.begin(source_id) else {
            debug!(source = %source_id, "run already in progress, dropping trigger");
            return Ok(RunOutcome::Dropped);
        };

        let source = self.load_source(source_id)?;
        if !source.enabled {
            debug!(source = %source_id, "source disabled, dropping trigger");
            return Ok(RunOutcome::Dropped);
        }

        let outcome = match source.resolve_flow(self.config.as_ref()) {
            Ok(flow) => self.executor.run(&source, &flow).await,
            Err(e) => Err(e),
        };
        let state = self.record_outcome(source_id, outcome).await?;
        Ok(RunOutcome::Completed(state))
    }

    /// Answers the pending interaction of a suspended source and drives the
    /// flow onward from its snapshot.
    pub async fn resume(&self, source_id: &str, payload: Map<String, Value>) -> Result<RunOutcome> {
        let Some(_guard) = self.begin(source_id) else {
            debug!(source = %source_id, "run already in progress, dropping resume");
            return Ok(RunOutcome::Dropped);
        };
        self.resume_locked(source_id, payload, None).await
    }

    /// Delivers an intercepted webview payload. Stale deliveries — a window
    /// left open across a newer run — are detected by run id and discarded.
    pub async fn deliver_webview_result(
        &self,
        source_id: &str,
        run_id: Uuid,
        result: std::result::Result<Value, String>,
    ) -> Result<RunOutcome> {
        let Some(_guard) = self.begin(source_id) else {
            debug!(source = %source_id, "run already in progress, dropping webview result");
            return Ok(RunOutcome::Dropped);
        };
        let mut map = Map::new();
        match result {
            Ok(payload) => {
                map.insert("payload".to_string(), payload);
            }
            Err(message) => {
                map.insert("error".to_string(), Value::String(message));
            }
        }
        self.resume_locked(source_id, map, Some(run_id)).await
    }

    async fn resume_locked(
        &self,
        source_id: &str,
        payload: Map<String, Value>,
        expected_run_id: Option<Uuid>,
    ) -> Result<RunOutcome> {
        let Some(suspension) = self.states.suspension(source_id)? else {
            warn!(source = %source_id, "resume requested but nothing is suspended");
            return Ok(RunOutcome::Dropped);
        };
        if let Some(expected) = expected_run_id {
            if suspension.run_id != expected {
                warn!(
                    source = %source_id,
                    delivered = %expected,
                    current = %suspension.run_id,
                    "discarding stale callback for a superseded run"
                );
                return Ok(RunOutcome::Dropped);
            }
        }
        let interaction = self
            .states
            .get(source_id)?
            .and_then(|s| s.pending_interaction)
            .ok_or_else(|| anyhow!("source '{source_id}' has no pending interaction"))?;

        let source = self.load_source(source_id)?;
        let outcome = self
            .executor
            .resume(&source, suspension, &interaction, payload)
            .await;
        let state = self.record_outcome(source_id, outcome).await?;
        Ok(RunOutcome::Completed(state))
    }

    /// Runs every enabled source once. Triggers whose guard is held are
    /// dropped individually; one failing source never stops the sweep.
    pub async fn refresh_all(&self) -> Result<()> {
        for source in self.config.sources()? {
            if !source.enabled {
                continue;
            }
            if let Err(e) = self.run(&source.id).await {
                error!(source = %source.id, error = %e, "refresh failed");
            }
        }
        Ok(())
    }

    pub fn run_state(&self, source_id: &str) -> Result<Option<RunState>> {
        self.states.get(source_id)
    }

    pub fn history(&self, source_id: &str, limit: usize) -> Result<Vec<crate::state::HistoryRecord>> {
        self.states.history(source_id, limit)
    }

    /// Builds a fresh authorize URL for the source's OAuth step, for
    /// collaborators that want to restart authorization outside a run.
    pub fn authorize_url(&self, source_id: &str) -> Result<String> {
        let (source, settings) = self.oauth_settings(source_id)?;
        self.auth.authorize_url(&source.id, &settings)
    }

    /// Completes an OAuth callback by exchanging the code. The stored bundle
    /// is picked up the next time the flow's oauth step executes.
    pub async fn exchange_code(&self, source_id: &str, code: &str) -> Result<()> {
        let (source, settings) = self.oauth_settings(source_id)?;
        self.auth
            .exchange_code(&source.id, &settings, code)
            .await
            .context("code exchange failed")?;
        Ok(())
    }

    /// Removes everything the engine holds for a source: secrets, run state,
    /// history and the guard. Configuration records belong to the external
    /// CRUD collaborator and are untouched.
    pub fn delete_source(&self, source_id: &str) -> Result<()> {
        let removed = self.secrets.delete_source(source_id)?;
        self.states.delete(source_id)?;
        self.guards.remove(source_id);
        info!(source = %source_id, secrets_removed = removed, "source data deleted");
        Ok(())
    }

    /// Marks a source as needing a re-run after its configuration changed.
    /// Pending interactions and snapshots are invalidated; the collected
    /// payload is kept for display until fresh data arrives.
    pub fn mark_config_changed(&self, source_id: &str) -> Result<()> {
        self.states.mark_config_changed(source_id)?;
        Ok(())
    }

    /// Bulk variant of [`mark_config_changed`](Self::mark_config_changed),
    /// used after an import replaces the whole configuration set.
    pub fn mark_all_config_changed(&self) -> Result<()> {
        for source in self.config.sources()? {
            self.states.mark_config_changed(&source.id)?;
        }
        Ok(())
    }

    fn oauth_settings(&self, source_id: &str) -> Result<(Source, OAuthSettings)> {
        let source = self.load_source(source_id)?;
        let flow = source
            .resolve_flow(self.config.as_ref())
            .map_err(|e| anyhow!(e.to_string()))?;
        let step = flow
            .iter()
            .find(|s| s.kind == StepKind::Oauth)
            .ok_or_else(|| anyhow!("source '{source_id}' has no oauth step"))?;
        let secrets = self.secrets.get_all(source_id)?;
        let scopes = Scopes::new(source.vars.clone(), secrets);
        let settings: OAuthSettings =
            serde_json::from_value(Value::Object(scopes.resolve_args(&step.args)))
                .context("invalid oauth settings")?;
        Ok((source, settings))
    }

    fn load_source(&self, source_id: &str) -> Result<Source> {
        self.config
            .source(source_id)?
            .ok_or_else(|| anyhow!("source '{source_id}' not found"))
    }

    /// Persists the run's terminal state and fires webview scrapes for
    /// fresh webview suspensions.
    async fn record_outcome(
        &self,
        source_id: &str,
        outcome: Result<FlowOutcome, StepError>,
    ) -> Result<RunState> {
        let previous_payload = self
            .states
            .get(source_id)?
            .and_then(|state| state.last_payload);

        let (state, suspension) = match outcome {
            Ok(FlowOutcome::Completed { payload, .. }) => {
                let mut state = RunState::new(source_id, RunStatus::Active);
                if let Some(payload) = &payload {
                    self.states.append_history(source_id, payload)?;
                }
                state.last_payload = payload.or(previous_payload);
                (state, None)
            }
            Ok(FlowOutcome::Suspended {
                interaction,
                suspension,
            }) => {
                if interaction.kind == InteractionKind::WebviewScrape {
                    self.notify_webview(source_id, &suspension, &interaction.data)
                        .await;
                }
                let mut state = RunState::new(source_id, RunStatus::Suspended);
                state.message = Some(interaction.message.clone());
                state.pending_interaction = Some(interaction);
                state.last_payload = previous_payload;
                (state, Some(suspension))
            }
            Err(e) => {
                error!(source = %source_id, error = %e, "run failed");
                let mut state = RunState::new(source_id, RunStatus::Error);
                state.message = Some(e.to_string());
                state.last_payload = previous_payload;
                (state, None)
            }
        };

        self.states.set(&state, suspension.as_ref())?;
        Ok(state)
    }

    async fn notify_webview(
        &self,
        source_id: &str,
        suspension: &Suspension,
        data: &Map<String, Value>,
    ) {
        let Some(host) = &self.webview else {
            return;
        };
        let Some(url) = data.get("url").and_then(Value::as_str) else {
            warn!(source = %source_id, "webview suspension has no url");
            return;
        };
        let request = ScrapeRequest {
            source_id: source_id.to_string(),
            run_id: suspension.run_id,
            url: url.to_string(),
            intercept_pattern: data
                .get("intercept_pattern")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        if let Err(e) = host.begin_scrape(request).await {
            warn!(source = %source_id, error = %e, "webview host rejected scrape request");
        }
    }

    /// Takes the per-source guard, or `None` when a run is already active.
    fn begin(&self, source_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self
            .guards
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().ok()
    }
}
