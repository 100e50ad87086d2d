//! HTTP command endpoints.
//!
//! One handler per command kind. Handlers validate the form or query, build
//! the command(s) with a single `now_ticks` reading, and go through the
//! [`ReplicatedLog`]: writes are proposed and answered once applied, reads
//! wait on the read barrier first.
//!
//! Routes:
//! - `POST /AddKeyValue` - form `key=value` pairs
//! - `POST /AddHashset` - `______key_____` names the hashset, other pairs are fields
//! - `POST /ListLeftPush` - form `queue=payload` pairs
//! - `POST /ListRightPop` - form `queue=count` pairs
//! - `POST /ListCallback` - `key`, `id`, `code`
//! - `GET  /Get?key=`, `GET /HashGetAll?key=`, `GET /ListLength?key=`
//! - `GET  /leader`

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::{OriginalUri, Query as QueryParams, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::clock::TickSource;
use crate::command::Command;
use crate::config::EndpointSettings;
use crate::error::LogError;
use crate::interpreter::{ApplyOutcome, Query, QueryResult};
use crate::log::ReplicatedLog;
use crate::schedule::{OutcomeReport, QueueStats};

/// Form field naming the hashset in `/AddHashset`.
pub const HASHSET_KEY_FIELD: &str = "______key_____";

const NO_CONSENSUS: &str = "no consensus";

/// Failures surfaced to HTTP clients.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Write reached a follower; carries the same request on the leader.
    #[error("not the leader, retry at {0}")]
    Redirect(String),

    #[error("no consensus")]
    NoConsensus,

    #[error(transparent)]
    Log(LogError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::Redirect(location) => Redirect::temporary(&location).into_response(),
            ApiError::NoConsensus => {
                (StatusCode::SERVICE_UNAVAILABLE, NO_CONSENSUS).into_response()
            }
            ApiError::Log(err) => {
                error!("replicated log failure: {err}");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    let msg = msg.into();
    warn!("rejected request: {msg}");
    ApiError::BadRequest(msg)
}

/// Shared handler state.
pub struct AppState<L> {
    log: L,
    clock: Arc<dyn TickSource>,
    settings: Arc<EndpointSettings>,
}

impl<L: Clone> Clone for AppState<L> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            clock: Arc::clone(&self.clock),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<L: ReplicatedLog> AppState<L> {
    /// HTTP address of the current leader, if one is known.
    fn leader_addr(&self) -> Option<&str> {
        let leader = self.log.leader().leader?;
        self.settings.http_peers.get(&leader).map(String::as_str)
    }

    /// Maps a log failure for the request at `uri`; writes on a follower are
    /// redirected to the leader with the same path and query.
    fn log_failure(&self, err: LogError, uri: &axum::http::Uri) -> ApiError {
        match err {
            LogError::NotLeader { leader: Some(id) } => {
                match self.settings.http_peers.get(&id) {
                    Some(addr) => {
                        let path = uri
                            .path_and_query()
                            .map(|pq| pq.as_str())
                            .unwrap_or_else(|| uri.path());
                        ApiError::Redirect(format!("http://{addr}{path}"))
                    }
                    None => {
                        warn!(leader = id, "no http address for leader");
                        ApiError::NoConsensus
                    }
                }
            }
            LogError::NotLeader { leader: None } => ApiError::NoConsensus,
            other => ApiError::Log(other),
        }
    }

    async fn propose(
        &self,
        commands: Vec<Command>,
        uri: &axum::http::Uri,
    ) -> Result<Vec<ApplyOutcome>, ApiError> {
        self.log
            .propose(commands, self.settings.request_timeout)
            .await
            .map_err(|err| self.log_failure(err, uri))
    }

    async fn read(&self, query: Query, uri: &axum::http::Uri) -> Result<QueryResult, ApiError> {
        self.log
            .read(query, self.settings.request_timeout)
            .await
            .map_err(|err| self.log_failure(err, uri))
    }
}

/// Builds the router serving every command endpoint.
pub fn router<L: ReplicatedLog>(
    log: L,
    clock: Arc<dyn TickSource>,
    settings: EndpointSettings,
) -> Router {
    let state = AppState {
        log,
        clock,
        settings: Arc::new(settings),
    };
    Router::new()
        .route("/AddKeyValue", post(add_key_value::<L>))
        .route("/AddHashset", post(add_hashset::<L>))
        .route("/ListLeftPush", post(list_left_push::<L>))
        .route("/ListRightPop", post(list_right_pop::<L>))
        .route("/ListCallback", post(list_callback::<L>))
        .route("/Get", get(get_value::<L>))
        .route("/HashGetAll", get(hash_get_all::<L>))
        .route("/ListLength", get(list_length::<L>))
        .route("/leader", get(leader::<L>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type FormPairs = Form<Vec<(String, String)>>;
type Params = QueryParams<HashMap<String, String>>;

fn require_pairs(pairs: &[(String, String)]) -> Result<(), ApiError> {
    if pairs.is_empty() {
        return Err(bad_request("at least one form field is required"));
    }
    if pairs.iter().any(|(key, _)| key.is_empty()) {
        return Err(bad_request("form field names must not be empty"));
    }
    Ok(())
}

fn required_param<'a>(params: &'a HashMap<String, String>, name: &str) -> Result<&'a str, ApiError> {
    match params.get(name) {
        Some(value) if !value.is_empty() => Ok(value.as_str()),
        _ => Err(bad_request(format!("missing '{name}' parameter"))),
    }
}

fn form_field<'a>(pairs: &'a [(String, String)], name: &str) -> Result<&'a str, ApiError> {
    match pairs.iter().find(|(key, _)| key == name) {
        Some((_, value)) if !value.is_empty() => Ok(value.as_str()),
        _ => Err(bad_request(format!("missing '{name}' field"))),
    }
}

async fn add_key_value<L: ReplicatedLog>(
    State(state): State<AppState<L>>,
    OriginalUri(uri): OriginalUri,
    Form(pairs): FormPairs,
) -> Result<StatusCode, ApiError> {
    require_pairs(&pairs)?;
    let commands = pairs
        .into_iter()
        .map(|(key, value)| Command::SetKeyValue {
            key,
            value: value.into_bytes(),
        })
        .collect();
    state.propose(commands, &uri).await?;
    Ok(StatusCode::OK)
}

async fn add_hashset<L: ReplicatedLog>(
    State(state): State<AppState<L>>,
    OriginalUri(uri): OriginalUri,
    Form(pairs): FormPairs,
) -> Result<StatusCode, ApiError> {
    let key = form_field(&pairs, HASHSET_KEY_FIELD)?.to_string();
    let fields: BTreeMap<String, String> = pairs
        .into_iter()
        .filter(|(name, _)| name != HASHSET_KEY_FIELD)
        .collect();
    state
        .propose(vec![Command::SetHashset { key, fields }], &uri)
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PushedItem {
    pub key: String,
    pub id: String,
}

async fn list_left_push<L: ReplicatedLog>(
    State(state): State<AppState<L>>,
    OriginalUri(uri): OriginalUri,
    Form(pairs): FormPairs,
) -> Result<Json<Vec<PushedItem>>, ApiError> {
    require_pairs(&pairs)?;
    let now_ticks = state.clock.now_ticks();
    let retry = &state.settings.retry;
    let keys: Vec<String> = pairs.iter().map(|(key, _)| key.clone()).collect();
    let commands: Vec<Command> = pairs
        .into_iter()
        .map(|(key, value)| Command::QueuePush {
            key,
            id: nanoid::nanoid!(),
            now_ticks,
            retry_timeout_seconds: retry.timeout_seconds,
            retry_delays_seconds: retry.delays_seconds.clone(),
            retryable_status_codes: retry.retryable_status_codes.clone(),
            value: value.into_bytes(),
        })
        .collect();

    let outcomes = state.propose(commands, &uri).await?;
    let pushed = keys
        .into_iter()
        .zip(outcomes)
        .filter_map(|(key, outcome)| match outcome {
            ApplyOutcome::Pushed { id } => Some(PushedItem { key, id }),
            _ => None,
        })
        .collect();
    Ok(Json(pushed))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PoppedValue {
    pub id: String,
    /// Base64 of the pushed payload.
    pub value: String,
}

async fn list_right_pop<L: ReplicatedLog>(
    State(state): State<AppState<L>>,
    OriginalUri(uri): OriginalUri,
    Form(pairs): FormPairs,
) -> Result<Json<Vec<PoppedValue>>, ApiError> {
    require_pairs(&pairs)?;
    let now_ticks = state.clock.now_ticks();
    let commands = pairs
        .into_iter()
        .map(|(key, count)| {
            let count: u32 = count
                .parse()
                .map_err(|_| bad_request(format!("invalid pop count '{count}' for '{key}'")))?;
            Ok(Command::QueuePop {
                key,
                count,
                now_ticks,
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    let outcomes = state.propose(commands, &uri).await?;
    let popped = outcomes
        .into_iter()
        .flat_map(|outcome| match outcome {
            ApplyOutcome::Popped(items) => items,
            _ => Vec::new(),
        })
        .map(|item| PoppedValue {
            id: item.id,
            value: STANDARD.encode(item.value),
        })
        .collect();
    Ok(Json(popped))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallbackResult {
    pub finished: bool,
}

async fn list_callback<L: ReplicatedLog>(
    State(state): State<AppState<L>>,
    OriginalUri(uri): OriginalUri,
    Form(pairs): FormPairs,
) -> Result<Json<CallbackResult>, ApiError> {
    let key = form_field(&pairs, "key")?.to_string();
    let id = form_field(&pairs, "id")?.to_string();
    let code = form_field(&pairs, "code")?;
    let outcome_code: i32 = match code.parse() {
        Ok(0) | Err(_) => {
            return Err(bad_request(format!("invalid outcome code '{code}'")));
        }
        Ok(code) => code,
    };

    let command = Command::QueueOutcome {
        key,
        id: id.clone(),
        now_ticks: state.clock.now_ticks(),
        outcome_code,
    };
    let outcomes = state.propose(vec![command], &uri).await?;
    match outcomes.into_iter().next() {
        Some(ApplyOutcome::Outcome(OutcomeReport::Finished)) => {
            Ok(Json(CallbackResult { finished: true }))
        }
        Some(ApplyOutcome::Outcome(OutcomeReport::AwaitingRetry)) => {
            Ok(Json(CallbackResult { finished: false }))
        }
        Some(ApplyOutcome::Outcome(OutcomeReport::NotRunning)) => Err(ApiError::Conflict(
            format!("element '{id}' has no running attempt"),
        )),
        _ => Err(ApiError::NotFound(format!("unknown element '{id}'"))),
    }
}

async fn get_value<L: ReplicatedLog>(
    State(state): State<AppState<L>>,
    OriginalUri(uri): OriginalUri,
    QueryParams(params): Params,
) -> Result<Response, ApiError> {
    let key = required_param(&params, "key")?.to_string();
    match state.read(Query::Get { key: key.clone() }, &uri).await? {
        QueryResult::Value(Some(value)) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            value,
        )
            .into_response()),
        _ => Err(ApiError::NotFound(format!("no value for '{key}'"))),
    }
}

async fn hash_get_all<L: ReplicatedLog>(
    State(state): State<AppState<L>>,
    OriginalUri(uri): OriginalUri,
    QueryParams(params): Params,
) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    let key = required_param(&params, "key")?.to_string();
    match state.read(Query::HashGetAll { key }, &uri).await? {
        QueryResult::Hashset(fields) => Ok(Json(fields.unwrap_or_default())),
        _ => Ok(Json(BTreeMap::new())),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueLength {
    pub length: usize,
    pub available: usize,
    pub running: usize,
}

impl From<QueueStats> for QueueLength {
    fn from(stats: QueueStats) -> Self {
        Self {
            length: stats.length,
            available: stats.available,
            running: stats.running,
        }
    }
}

async fn list_length<L: ReplicatedLog>(
    State(state): State<AppState<L>>,
    OriginalUri(uri): OriginalUri,
    QueryParams(params): Params,
) -> Result<Json<QueueLength>, ApiError> {
    let key = required_param(&params, "key")?.to_string();
    let query = Query::QueueStats {
        key,
        now_ticks: state.clock.now_ticks(),
    };
    match state.read(query, &uri).await? {
        QueryResult::QueueStats(stats) => Ok(Json(stats.into())),
        _ => Ok(Json(QueueStats::default().into())),
    }
}

async fn leader<L: ReplicatedLog>(State(state): State<AppState<L>>) -> Result<String, ApiError> {
    state
        .leader_addr()
        .map(str::to_string)
        .ok_or(ApiError::NoConsensus)
}
