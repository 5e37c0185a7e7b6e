//! The flow state machine: runs a source's step list, suspends when a step
//! needs external input, and resumes from a persisted snapshot.
//!
//! The executor is deliberately I/O-thin: it owns the step semantics and the
//! scope rules, while persistence of run state and the exclusivity guard live
//! in the engine above it.

mod scope;

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::{AuthManager, OAuthSettings, CLIENT_ID_KEY};
use crate::config::{Source, StepKind, StepSpec};
use crate::error::StepError;
use crate::parser::{self, ExtractStrategy};
use crate::secrets::SecretsStore;
use crate::state::{Interaction, InteractionField, InteractionKind, Suspension};

pub use scope::Scopes;

/// What one step produced.
enum StepOutcome {
    /// The handler's result map, keyed by well-known result names
    /// (`value`, `access_token`, `http_response`, ...).
    Done(Map<String, Value>),
    /// The step cannot proceed without external input.
    Suspend(Interaction),
}

/// Terminal result of driving a flow as far as it can go.
#[derive(Debug)]
pub enum FlowOutcome {
    Completed {
        /// The last `extract` step's contribution, if any.
        payload: Option<Value>,
        context: Map<String, Value>,
    },
    Suspended {
        interaction: Interaction,
        suspension: Suspension,
    },
}

pub struct FlowExecutor {
    http: reqwest::Client,
    auth: Arc<AuthManager>,
    secrets: Arc<SecretsStore>,
}

impl FlowExecutor {
    pub fn new(auth: Arc<AuthManager>, secrets: Arc<SecretsStore>) -> Self {
        FlowExecutor {
            http: reqwest::Client::new(),
            auth,
            secrets,
        }
    }

    /// Structural validation, run before any step executes. A flow that fails
    /// here produces a config error without touching the network.
    pub fn validate_flow(flow: &[StepSpec]) -> Result<(), StepError> {
        if flow.is_empty() {
            return Err(StepError::config("flow has no steps"));
        }
        for step in flow {
            let missing = |arg: &str| {
                StepError::config(format!(
                    "step '{}' ({}) is missing required arg '{arg}'",
                    step.id,
                    step.kind.as_str()
                ))
            };
            match step.kind {
                StepKind::Http | StepKind::Webview => {
                    if !step.args.contains_key("url") {
                        return Err(missing("url"));
                    }
                }
                StepKind::Extract | StepKind::Script => {
                    if !step.args.contains_key("expression") {
                        return Err(missing("expression"));
                    }
                }
                StepKind::Oauth => {
                    if !step.args.contains_key("auth_url") {
                        return Err(missing("auth_url"));
                    }
                    if !step.args.contains_key("token_url") {
                        return Err(missing("token_url"));
                    }
                }
                StepKind::ApiKey | StepKind::Log => {}
            }
        }
        Ok(())
    }

    /// Runs a flow from the top under a fresh run id.
    pub async fn run(&self, source: &Source, flow: &[StepSpec]) -> Result<FlowOutcome, StepError> {
        Self::validate_flow(flow)?;
        let secrets = self
            .secrets
            .get_all(&source.id)
            .map_err(|e| StepError::step(format!("failed to load secrets: {e}")))?;
        let scopes = Scopes::new(source.vars.clone(), secrets);
        let run_id = Uuid::new_v4();
        info!(source = %source.id, run = %run_id, steps = flow.len(), "starting flow");
        self.execute_from(source, flow, 0, scopes, run_id, None).await
    }

    /// Resumes a suspended flow with the payload answering its pending
    /// interaction. The snapshot's flow is used as-is; config edits made
    /// while suspended do not apply to this run.
    pub async fn resume(
        &self,
        source: &Source,
        suspension: Suspension,
        interaction: &Interaction,
        payload: Map<String, Value>,
    ) -> Result<FlowOutcome, StepError> {
        let Suspension {
            run_id,
            step_index,
            context,
            flow,
        } = suspension;
        let step = flow
            .get(step_index)
            .cloned()
            .ok_or_else(|| StepError::config("suspension points past the end of the flow"))?;
        info!(source = %source.id, run = %run_id, step = %step.id, "resuming flow");

        match interaction.kind {
            InteractionKind::InputText => {
                self.persist_interaction_secrets(&source.id, interaction, &payload)?;
                let mut scopes = self.reload_scopes(&source.id, context)?;
                // Anything not persisted as a secret lands in the context.
                let secret_keys = declared_secret_keys(interaction);
                for (key, value) in payload {
                    if !secret_keys.iter().any(|k| k == &key) {
                        scopes.context.insert(key, value);
                    }
                }
                // Re-execute the step that suspended; its input now exists.
                self.execute_from(source, &flow, step_index, scopes, run_id, None)
                    .await
            }
            InteractionKind::OauthStart => {
                let code = payload
                    .get("code")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StepError::step("oauth resume payload is missing 'code'"))?;
                let settings = oauth_settings(&step, &Scopes::new(context.clone(), Default::default()))?;
                self.auth
                    .exchange_code(&source.id, &settings, code)
                    .await
                    .map_err(|e| StepError::auth(e.to_string()))?;
                let scopes = self.reload_scopes(&source.id, context)?;
                self.execute_from(source, &flow, step_index, scopes, run_id, None)
                    .await
            }
            InteractionKind::WebviewScrape => {
                // The host delivers {error} instead of {payload} when the
                // scrape itself failed.
                if let Some(err) = payload.get("error").and_then(Value::as_str) {
                    return Err(StepError::step(format!("webview scrape failed: {err}")));
                }
                let value = payload
                    .get("payload")
                    .cloned()
                    .ok_or_else(|| StepError::step("webview resume payload is missing 'payload'"))?;
                let mut scopes = self.reload_scopes(&source.id, context)?;
                let mut result = Map::new();
                result.insert("payload".to_string(), value.clone());
                result.insert("value".to_string(), value);
                let mut last_payload = None;
                self.finish_step(&source.id, &step, result, &mut scopes, &mut last_payload)?;
                self.execute_from(source, &flow, step_index + 1, scopes, run_id, last_payload)
                    .await
            }
            InteractionKind::Confirm => {
                let scopes = self.reload_scopes(&source.id, context)?;
                self.execute_from(source, &flow, step_index + 1, scopes, run_id, None)
                    .await
            }
        }
    }

    async fn execute_from(
        &self,
        source: &Source,
        flow: &[StepSpec],
        start: usize,
        mut scopes: Scopes,
        run_id: Uuid,
        mut last_payload: Option<Value>,
    ) -> Result<FlowOutcome, StepError> {
        for (index, step) in flow.iter().enumerate().skip(start) {
            let args = scopes.resolve_args(&step.args);
            debug!(source = %source.id, step = %step.id, kind = step.kind.as_str(), "executing step");
            match self.execute_step(source, step, args, &scopes, run_id).await? {
                StepOutcome::Done(result) => {
                    self.finish_step(&source.id, step, result, &mut scopes, &mut last_payload)?;
                }
                StepOutcome::Suspend(interaction) => {
                    info!(
                        source = %source.id,
                        step = %step.id,
                        kind = ?interaction.kind,
                        "flow suspended awaiting interaction"
                    );
                    return Ok(FlowOutcome::Suspended {
                        interaction,
                        suspension: Suspension {
                            run_id,
                            step_index: index,
                            context: scopes.context.clone(),
                            flow: flow.to_vec(),
                        },
                    });
                }
            }
        }
        info!(source = %source.id, run = %run_id, "flow completed");
        Ok(FlowOutcome::Completed {
            payload: last_payload,
            context: scopes.context,
        })
    }

    /// Applies a completed step's result: persists declared secrets, records
    /// the payload for extract steps, and publishes mapped outputs.
    fn finish_step(
        &self,
        source_id: &str,
        step: &StepSpec,
        result: Map<String, Value>,
        scopes: &mut Scopes,
        last_payload: &mut Option<Value>,
    ) -> Result<(), StepError> {
        for key in &step.secrets {
            if let Some(value) = result.get(key) {
                let raw = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                self.secrets
                    .put(source_id, key, &raw)
                    .map_err(|e| StepError::step(format!("failed to persist secret '{key}': {e}")))?;
                scopes.secrets.insert(key.clone(), raw);
            }
        }

        let mapped: Map<String, Value> = step
            .outputs
            .iter()
            .map(|(result_key, var_name)| {
                let value = result.get(result_key).cloned().unwrap_or(Value::Null);
                (var_name.clone(), value)
            })
            .collect();

        if step.kind == StepKind::Extract || step.kind == StepKind::Script {
            *last_payload = if mapped.is_empty() {
                result.get("value").cloned()
            } else {
                Some(Value::Object(mapped.clone()))
            };
        }

        scopes.publish(mapped);
        Ok(())
    }

    async fn execute_step(
        &self,
        source: &Source,
        step: &StepSpec,
        args: Map<String, Value>,
        scopes: &Scopes,
        run_id: Uuid,
    ) -> Result<StepOutcome, StepError> {
        match step.kind {
            StepKind::ApiKey => Ok(self.api_key_step(step, &args, scopes)),
            StepKind::Oauth => self.oauth_step(source, step, args, scopes).await,
            StepKind::Http => self.http_step(step, &args).await,
            StepKind::Extract | StepKind::Script => Ok(extract_step(step, &args, scopes)),
            StepKind::Log => Ok(log_step(source, step, &args)),
            StepKind::Webview => Ok(webview_step(step, &args, run_id)),
        }
    }

    fn api_key_step(&self, step: &StepSpec, args: &Map<String, Value>, scopes: &Scopes) -> StepOutcome {
        let secret_key = args
            .get("secret_key")
            .and_then(Value::as_str)
            .unwrap_or("api_key");
        if let Some(value) = scopes.secrets.get(secret_key) {
            let mut result = Map::new();
            result.insert("value".to_string(), Value::String(value.clone()));
            return StepOutcome::Done(result);
        }

        let label = args
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("API key")
            .to_string();
        let mut field = InteractionField::password(secret_key, label);
        field.description = args
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut data = Map::new();
        data.insert("secret_keys".to_string(), json!([secret_key]));
        StepOutcome::Suspend(Interaction {
            kind: InteractionKind::InputText,
            step_id: step.id.clone(),
            fields: vec![field],
            message: format!("A credential is required: {secret_key}"),
            data,
        })
    }

    async fn oauth_step(
        &self,
        source: &Source,
        step: &StepSpec,
        args: Map<String, Value>,
        scopes: &Scopes,
    ) -> Result<StepOutcome, StepError> {
        let settings = settings_from_args(step, args)?;

        if let Some(token) = self
            .auth
            .resolve_token(&source.id, &settings)
            .await
            .map_err(|e| StepError::auth(e.to_string()))?
        {
            let mut result = Map::new();
            result.insert("access_token".to_string(), Value::String(token));
            return Ok(StepOutcome::Done(result));
        }

        // No usable token. Without client credentials we cannot even build
        // an authorize URL, so ask for those first.
        if settings.client_id.is_none() && !scopes.secrets.contains_key(CLIENT_ID_KEY) {
            let mut data = Map::new();
            data.insert("secret_keys".to_string(), json!(["client_id", "client_secret"]));
            if let Some(doc_url) = &settings.doc_url {
                data.insert("doc_url".to_string(), json!(doc_url));
            }
            return Ok(StepOutcome::Suspend(Interaction {
                kind: InteractionKind::InputText,
                step_id: step.id.clone(),
                fields: vec![
                    InteractionField::text("client_id", "OAuth client ID"),
                    InteractionField::password("client_secret", "OAuth client secret"),
                ],
                message: "OAuth application credentials are required".to_string(),
                data,
            }));
        }

        let authorize_url = self
            .auth
            .authorize_url(&source.id, &settings)
            .map_err(|e| StepError::auth(e.to_string()))?;
        let mut data = Map::new();
        data.insert("authorize_url".to_string(), json!(authorize_url));
        if let Some(doc_url) = &settings.doc_url {
            data.insert("doc_url".to_string(), json!(doc_url));
        }
        Ok(StepOutcome::Suspend(Interaction {
            kind: InteractionKind::OauthStart,
            step_id: step.id.clone(),
            fields: Vec::new(),
            message: "Authorization is required; open the authorize URL".to_string(),
            data,
        }))
    }

    async fn http_step(
        &self,
        step: &StepSpec,
        args: &Map<String, Value>,
    ) -> Result<StepOutcome, StepError> {
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::step(format!("step '{}' url is not a string", step.id)))?;
        let method = args
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method: reqwest::Method = method
            .parse()
            .map_err(|_| StepError::step(format!("invalid HTTP method '{method}'")))?;

        let mut request = self.http.request(method, url);
        if let Some(headers) = args.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.header(name, value);
            }
        }
        if let Some(query) = args.get("query").and_then(Value::as_object) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = args.get("body") {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StepError::step(format!("request to {url} failed: {e}")))?;
        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                let value = value.to_str().unwrap_or_default().to_string();
                (name.to_string(), Value::String(value))
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| StepError::step(format!("failed to read response body: {e}")))?;
        if !status.is_success() {
            return Err(StepError::step(format!(
                "request to {url} returned {status}: {}",
                truncate(&text, 300)
            )));
        }

        let parsed: Value =
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone()));
        let mut result = Map::new();
        result.insert("http_response".to_string(), parsed);
        result.insert("raw_data".to_string(), Value::String(text));
        result.insert("status".to_string(), json!(status.as_u16()));
        result.insert("headers".to_string(), Value::Object(headers));
        Ok(StepOutcome::Done(result))
    }

    fn persist_interaction_secrets(
        &self,
        source_id: &str,
        interaction: &Interaction,
        payload: &Map<String, Value>,
    ) -> Result<(), StepError> {
        for key in declared_secret_keys(interaction) {
            let required = interaction
                .fields
                .iter()
                .find(|f| f.key == key)
                .map(|f| f.required)
                .unwrap_or(true);
            match payload.get(&key).and_then(Value::as_str) {
                Some(value) => {
                    self.secrets.put(source_id, &key, value).map_err(|e| {
                        StepError::step(format!("failed to persist secret '{key}': {e}"))
                    })?;
                }
                None if required => {
                    return Err(StepError::step(format!(
                        "resume payload is missing required field '{key}'"
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }

    fn reload_scopes(
        &self,
        source_id: &str,
        context: Map<String, Value>,
    ) -> Result<Scopes, StepError> {
        let secrets = self
            .secrets
            .get_all(source_id)
            .map_err(|e| StepError::step(format!("failed to load secrets: {e}")))?;
        Ok(Scopes::new(context, secrets))
    }
}

fn declared_secret_keys(interaction: &Interaction) -> Vec<String> {
    interaction
        .data
        .get("secret_keys")
        .and_then(Value::as_array)
        .map(|keys| {
            keys.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn settings_from_args(step: &StepSpec, args: Map<String, Value>) -> Result<OAuthSettings, StepError> {
    serde_json::from_value(Value::Object(args)).map_err(|e| {
        StepError::config(format!("step '{}' has invalid oauth settings: {e}", step.id))
    })
}

fn oauth_settings(step: &StepSpec, scopes: &Scopes) -> Result<OAuthSettings, StepError> {
    settings_from_args(step, scopes.resolve_args(&step.args))
}

fn extract_step(step: &StepSpec, args: &Map<String, Value>, scopes: &Scopes) -> StepOutcome {
    let strategy = if step.kind == StepKind::Script {
        ExtractStrategy::Script
    } else {
        args.get("type")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    };
    let expression = args
        .get("expression")
        .and_then(Value::as_str)
        .unwrap_or_default();
    // Default input is the whole context, so a script can combine values
    // from several earlier steps.
    let input = args
        .get("source")
        .cloned()
        .unwrap_or_else(|| Value::Object(scopes.context.clone()));

    let value = parser::extract(strategy, &input, expression);
    let mut result = Map::new();
    result.insert("value".to_string(), value);
    StepOutcome::Done(result)
}

fn log_step(source: &Source, step: &StepSpec, args: &Map<String, Value>) -> StepOutcome {
    let message = args
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    info!(source = %source.id, step = %step.id, "{message}");
    StepOutcome::Done(Map::new())
}

fn webview_step(step: &StepSpec, args: &Map<String, Value>, run_id: Uuid) -> StepOutcome {
    let mut data = Map::new();
    data.insert("url".to_string(), args.get("url").cloned().unwrap_or(Value::Null));
    if let Some(pattern) = args.get("intercept_pattern") {
        data.insert("intercept_pattern".to_string(), pattern.clone());
    }
    data.insert("run_id".to_string(), json!(run_id));
    StepOutcome::Suspend(Interaction {
        kind: InteractionKind::WebviewScrape,
        step_id: step.id.clone(),
        fields: Vec::new(),
        message: "A browser-assisted scrape is required".to_string(),
        data,
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
