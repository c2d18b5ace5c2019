use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{MethodRouter, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, value::RawValue};
use tokio::net::TcpListener;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    collection::Collection,
    config::Config,
    document::Document,
    error::{DbError, Result},
    patch,
    path::{self, Resolved},
    schema::Schema,
    skiplist::SkipList,
    subscribe::{self, Frame},
    token::TokenManager,
};

#[derive(Clone)]
pub struct AppState {
    databases: Arc<SkipList<Arc<Collection>>>,
    tokens: Arc<TokenManager>,
    schema: Arc<Schema>,
    query_deadline: Duration,
    subscriber_buffer: usize,
    keep_alive: Duration,
}

impl AppState {
    fn deadline(&self) -> Option<Instant> {
        Some(Instant::now() + self.query_deadline)
    }
}

pub async fn run(config: Config) -> Result<()> {
    let schema = Arc::new(Schema::load(config.schema_path()?)?);
    let tokens = Arc::new(TokenManager::new());
    if let Some(tokens_path) = &config.tokens_path {
        if let Err(err) = tokens.preload(tokens_path) {
            warn!("token preload skipped: {err}");
        }
    }

    let state = AppState {
        databases: Arc::new(SkipList::new("databases")),
        tokens,
        schema,
        query_deadline: config.query_deadline(),
        subscriber_buffer: config.subscriber_buffer,
        keep_alive: config.keep_alive(),
    };

    let app = Router::new()
        .route("/v1", entity_router())
        .route("/v1/", entity_router())
        .route("/v1/{*path}", entity_router())
        .route("/auth", post(login).delete(logout).options(auth_options))
        .with_state(state)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Starting DocDBX server on {addr}");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| DbError::Internal(err.to_string()))?;

    Ok(())
}

fn entity_router() -> MethodRouter<AppState> {
    axum::routing::get(get_entity)
        .put(put_entity)
        .post(post_entity)
        .delete(delete_entity)
        .patch(patch_entity)
        .options(v1_options)
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?;
    let value = value.to_str().ok()?;
    if let Some(token) = value.strip_prefix("Bearer ") {
        Some(token.trim().to_string())
    } else {
        None
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<String> {
    let token = extract_bearer_token(headers).ok_or(DbError::Unauthorized)?;
    state.tokens.validate(&token).ok_or(DbError::Unauthorized)
}

fn require_json_content(headers: &HeaderMap) -> Result<()> {
    let matches = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == "application/json")
        .unwrap_or(false);
    if matches { Ok(()) } else { Err(DbError::ContentType) }
}

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}

#[derive(Serialize)]
struct UriResponse {
    uri: String,
}

fn uri_response(status: StatusCode, uri: String) -> Result<Response> {
    let location = HeaderValue::from_str(&uri)
        .map_err(|_| DbError::BadRequest("unable to format uri".to_string()))?;
    Ok((
        status,
        [(header::LOCATION, location)],
        Json(UriResponse { uri }),
    )
        .into_response())
}

// --- auth endpoints ---

#[derive(Deserialize)]
struct AuthRequest {
    #[serde(default)]
    username: String,
}

#[derive(Serialize)]
struct AuthResponse {
    token: String,
}

async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    require_json_content(&headers)?;
    let request: AuthRequest = serde_json::from_slice(&body)
        .map_err(|_| DbError::BadRequest("error unmarshaling username".to_string()))?;
    let token = state.tokens.issue(&request.username);
    info!("issued token for {}", request.username);
    Ok(Json(AuthResponse { token }).into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode> {
    let token = extract_bearer_token(&headers).ok_or(DbError::Unauthorized)?;
    if !state.tokens.revoke(&token) {
        return Err(DbError::Unauthorized);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn auth_options() -> Response {
    (
        StatusCode::OK,
        [
            (header::ALLOW, HeaderValue::from_static("POST,DELETE")),
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("POST,DELETE"),
            ),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type, Authorization"),
            ),
        ],
    )
        .into_response()
}

async fn v1_options() -> Response {
    (
        StatusCode::OK,
        [
            (
                header::ALLOW,
                HeaderValue::from_static("GET,PUT,POST,DELETE,PATCH"),
            ),
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET,PUT,POST,DELETE,PATCH"),
            ),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type, Authorization, Last-Event-ID"),
            ),
        ],
    )
        .into_response()
}

// --- GET: read or subscribe ---

async fn get_entity(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response> {
    authorize(&state, &headers)?;

    let mode = params.get("mode").map(String::as_str).unwrap_or("");
    if !mode.is_empty() && mode != "subscribe" {
        return Err(DbError::InvalidQuery("invalid query parameter".to_string()));
    }

    let segments = path::parse_segments(uri.path())?;
    let resolved = path::resolve_deepest(&state.databases, &segments)?;
    let n = segments.len() as isize;
    let interval = params.get("interval").map(String::as_str);

    if resolved.ends_on_collection {
        if resolved.last_good == n - 1 {
            // A bare database name reads nothing; listing needs the trailing
            // slash form.
            Err(DbError::BadPath("insufficient path length".to_string()))
        } else if resolved.last_good == n - 2 && last_segment_empty(&segments) {
            let col = require_collection(&resolved)?;
            if mode == "subscribe" {
                return subscribe_collection(&state, col, uri.path(), interval);
            }
            let (low, high) = path::parse_interval(interval)?;
            let full_path = path::entity_path(uri.path())?;
            let body = col.render(state.deadline(), &low, &high, full_path)?;
            Ok(json_response(StatusCode::OK, body))
        } else {
            Err(DbError::NotFound("Document does not exist".to_string()))
        }
    } else if resolved.last_good != n - 1 {
        Err(DbError::NotFound("Collection does not exist".to_string()))
    } else {
        let col = require_collection(&resolved)?;
        let doc = require_document(&resolved)?;
        if mode == "subscribe" {
            return subscribe_document(&state, col, doc.name(), uri.path(), interval);
        }
        let full_path = path::entity_path(uri.path())?;
        let body = doc.render(full_path)?;
        Ok(json_response(StatusCode::OK, body))
    }
}

fn subscribe_document(
    state: &AppState,
    col: Arc<Collection>,
    doc_name: &str,
    uri_path: &str,
    interval: Option<&str>,
) -> Result<Response> {
    // The interval parameter must still be well-formed even though the
    // bounds collapse to the document's own name.
    path::parse_interval(interval)?;

    let mut initial = Vec::new();
    if let Some(doc) = col.find_document(doc_name) {
        let full_path = path::entity_path(uri_path)?;
        initial.push(Frame::update(doc.render(full_path)?));
    }
    info!("document subscriber attached at {uri_path}");
    Ok(subscribe::subscription_response(
        col,
        doc_name.to_string(),
        doc_name.to_string(),
        initial,
        state.subscriber_buffer,
        state.keep_alive,
    ))
}

fn subscribe_collection(
    state: &AppState,
    col: Arc<Collection>,
    uri_path: &str,
    interval: Option<&str>,
) -> Result<Response> {
    let (low, high) = path::parse_interval(interval)?;
    let documents = col.query(state.deadline(), &low, &high)?;
    let full_path = path::entity_path(uri_path)?;

    // The whole opening snapshot shares one id.
    let id = subscribe::now_ms();
    let mut initial = Vec::with_capacity(documents.len());
    for doc in &documents {
        let rendered = doc.render(&format!("{full_path}{}", doc.name()))?;
        initial.push(Frame::update_with_id(rendered, id));
    }
    info!("collection subscriber attached at {uri_path}");
    Ok(subscribe::subscription_response(
        col,
        low,
        high,
        initial,
        state.subscriber_buffer,
        state.keep_alive,
    ))
}

// --- PUT: create database / sub-collection, create or overwrite document ---

async fn put_entity(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response> {
    let username = authorize(&state, &headers)?;

    let segments = path::parse_segments(uri.path())?;
    let n = segments.len() as isize;

    if segments.len() > 1 && segments.len() % 2 == 0 && !last_segment_empty(&segments) {
        require_json_content(&headers)?;
    }

    // The body only matters when the path names a document.
    let data = if segments.len() != 1 && !last_segment_empty(&segments) {
        Some(parse_raw_body(&body)?)
    } else {
        None
    };

    if segments.len() == 2 && segments[1].is_empty() {
        return Err(DbError::BadPath("Bad Path".to_string()));
    }

    let resolved = path::resolve_deepest(&state.databases, &segments)?;

    let mode = params.get("mode").map(String::as_str).unwrap_or("");
    if !mode.is_empty() && mode != "overwrite" && mode != "nooverwrite" {
        return Err(DbError::InvalidQuery("mode of incorrect format".to_string()));
    }

    let mut status = StatusCode::CREATED;

    if resolved.ends_on_collection {
        if resolved.last_good == n - 1 {
            return Err(DbError::AlreadyExists("database already exists".to_string()));
        } else if resolved.last_good < n - 2 {
            return Err(DbError::NotFound(
                "Containing document does not exist".to_string(),
            ));
        } else {
            let doc_name = &segments[segments.len() - 1];
            if doc_name.is_empty() {
                return Err(DbError::BadPath("bad path".to_string()));
            }
            let col = require_collection(&resolved)?;
            let data = data.ok_or_else(|| {
                DbError::BadRequest("invalid json encoding".to_string())
            })?;
            let overwrote =
                write_document(&state, &col, doc_name, uri.path(), data, &username)?;
            if overwrote {
                status = StatusCode::OK;
            }
        }
    } else if resolved.last_good == n - 1 {
        // The path ends on an existing document: overwrite unless forbidden.
        if mode == "nooverwrite" {
            return Err(DbError::Conflict("document already exists".to_string()));
        }
        let doc_name = &segments[segments.len() - 1];
        if doc_name.is_empty() {
            return Err(DbError::BadPath("document name too short".to_string()));
        }
        status = StatusCode::OK;
        let col = require_collection(&resolved)?;
        let data = data
            .ok_or_else(|| DbError::BadRequest("invalid json encoding".to_string()))?;
        write_document(&state, &col, doc_name, uri.path(), data, &username)?;
    } else if resolved.last_good == -1 && segments.len() == 1 {
        let db_name = &segments[0];
        if db_name.is_empty() {
            return Err(DbError::BadPath("bad path".to_string()));
        }
        state.databases.upsert(db_name, |key, _, exists| {
            if exists {
                Err(DbError::AlreadyExists("database already exists".to_string()))
            } else {
                Ok(Arc::new(Collection::new(key)))
            }
        })?;
    } else if resolved.last_good == -1 {
        return Err(DbError::NotFound(
            "containing database does not exist".to_string(),
        ));
    } else if resolved.last_good < n - 3
        || (resolved.last_good == n - 3 && !last_segment_empty(&segments))
    {
        return Err(DbError::NotFound(
            "containing collection does not exist".to_string(),
        ));
    } else {
        let col_name = &segments[segments.len() - 2];
        let doc = require_document(&resolved)?;
        doc.put_collection(col_name, |key, _, exists| {
            if exists {
                Err(DbError::AlreadyExists("already exists".to_string()))
            } else {
                Ok(Arc::new(Collection::new(key)))
            }
        })?;
    }

    uri_response(status, uri.path().to_string())
}

/// Create or replace a document inside the collection's per-key guard,
/// notifying subscribers with the committed state. Returns whether an
/// existing document was overwritten.
fn write_document(
    state: &AppState,
    col: &Arc<Collection>,
    doc_name: &str,
    uri_path: &str,
    data: Box<RawValue>,
    username: &str,
) -> Result<bool> {
    let parsed: Value = serde_json::from_str(data.get()).map_err(|_| {
        DbError::BadRequest("unable to unmarshal encoded request body into JSONValue".to_string())
    })?;
    state
        .schema
        .validate(&parsed)
        .map_err(DbError::SchemaViolation)?;

    let full_path = path::entity_path(uri_path)?.to_string();
    let notify_col = Arc::clone(col);
    let mut overwrote = false;
    col.put_document(doc_name, |key, current, _exists| {
        let doc = match current {
            Some(current) => {
                overwrote = true;
                current.with_data(data.clone(), username)
            }
            None => Document::new(key, data.clone(), username),
        };
        let rendered = doc.render(&full_path).map_err(|_| {
            DbError::Internal("unable to format document for subscriptions".to_string())
        })?;
        subscribe::notify(&notify_col, key, &Frame::update(rendered));
        Ok::<Arc<Document>, DbError>(Arc::new(doc))
    })?;
    if overwrote {
        info!("replaced document {doc_name}");
    } else {
        info!("created new document {doc_name}");
    }
    Ok(overwrote)
}

// --- POST: insert with a generated name ---

async fn post_entity(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let username = authorize(&state, &headers)?;

    let parsed: Value = serde_json::from_slice(&body).map_err(|_| {
        DbError::BadRequest("unable to unmarshal encoded request body into JSONValue".to_string())
    })?;
    state
        .schema
        .validate(&parsed)
        .map_err(DbError::SchemaViolation)?;
    let data = parse_raw_body(&body)?;

    let segments = path::parse_segments(uri.path())?;
    let n = segments.len() as isize;
    let resolved = path::resolve_deepest(&state.databases, &segments)?;

    if segments.len() % 2 == 0 && last_segment_empty(&segments) {
        require_json_content(&headers)?;
    } else {
        return Err(DbError::BadPath("not collection path".to_string()));
    }

    if !resolved.ends_on_collection {
        if resolved.last_good == n - 1 {
            return Err(DbError::BadPath("bad request".to_string()));
        }
        return Err(DbError::NotFound("collection not found".to_string()));
    }
    if resolved.last_good != n - 2 {
        return Err(DbError::NotFound("document not found".to_string()));
    }

    let col = require_collection(&resolved)?;
    let base_path = path::entity_path(uri.path())?.to_string();
    let notify_col = Arc::clone(&col);

    // Names come from the wall clock; a taken name means another insert won
    // this millisecond, so draw again.
    let doc_name = loop {
        let candidate = subscribe::now_ms().to_string();
        let result = col.put_document(&candidate, |key, _, exists| {
            if exists {
                return Err(DbError::AlreadyExists("document already exists".to_string()));
            }
            let doc = Document::new(key, data.clone(), &username);
            let rendered = doc.render(&format!("{base_path}{key}")).map_err(|_| {
                DbError::Internal("unable to format new document for subscriptions".to_string())
            })?;
            subscribe::notify(&notify_col, key, &Frame::update(rendered));
            Ok(Arc::new(doc))
        });
        match result {
            Ok(_) => break candidate,
            Err(DbError::AlreadyExists(_)) => continue,
            Err(err) => return Err(err),
        }
    };
    info!("created new document {doc_name} via post");

    uri_response(StatusCode::CREATED, format!("{}{doc_name}", uri.path()))
}

// --- DELETE ---

async fn delete_entity(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response> {
    authorize(&state, &headers)?;

    let segments = path::parse_segments(uri.path())?;
    let n = segments.len() as isize;
    let resolved = path::resolve_deepest(&state.databases, &segments)?;

    if resolved.ends_on_collection {
        if segments.len() == 1 {
            let col = require_collection(&resolved)?;
            info!("deleting database {}", col.name());
            let _ = state.databases.remove(col.name());
        } else if resolved.last_good == n - 2
            && last_segment_empty(&segments)
            && segments.len() > 2
        {
            let doc = require_document(&resolved)?;
            let col = require_collection(&resolved)?;
            info!("deleting collection {}", col.name());
            if doc.delete_collection(col.name()).is_none() {
                return Err(DbError::BadRequest("could not delete collection".to_string()));
            }
            let full_path = path::entity_path(uri.path())?;
            let frame = Frame::delete(full_path)?;
            subscribe::notify(&col, "", &frame);
        } else {
            return Err(DbError::NotFound("Document Not found".to_string()));
        }
    } else if resolved.last_good != n - 1 {
        return Err(DbError::NotFound("collection not found".to_string()));
    } else {
        let doc = require_document(&resolved)?;
        let col = require_collection(&resolved)?;
        info!("deleting document {}", doc.name());
        if col.delete_document(doc.name()).is_none() {
            return Err(DbError::BadRequest("could not delete document".to_string()));
        }
        let full_path = path::entity_path(uri.path())?;
        let frame = Frame::delete(full_path)?;
        subscribe::notify(&col, doc.name(), &frame);
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}

// --- PATCH ---

#[derive(Serialize)]
struct PatchResponse {
    uri: String,
    #[serde(rename = "patchFailed")]
    patch_failed: bool,
    message: String,
}

async fn patch_entity(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let username = authorize(&state, &headers)?;

    let segments = path::parse_segments(uri.path())?;
    let n = segments.len() as isize;
    let resolved = path::resolve_deepest(&state.databases, &segments)?;

    if segments.len() % 2 == 0 && !last_segment_empty(&segments) {
        require_json_content(&headers)?;
    } else {
        return Err(DbError::BadPath("not document path".to_string()));
    }

    if resolved.ends_on_collection {
        return if resolved.last_good == n - 1 {
            Err(DbError::BadRequest(
                "patch only supported on documents".to_string(),
            ))
        } else if resolved.last_good < n - 2 {
            Err(DbError::NotFound(
                "Containing document does not exist".to_string(),
            ))
        } else {
            // Patch edits documents; it never creates them.
            Err(DbError::NotFound("not found".to_string()))
        };
    }

    if resolved.last_good != n - 1 {
        return if resolved.last_good == -1 && segments.len() == 1 {
            Err(DbError::NotFound("not found".to_string()))
        } else if resolved.last_good == -1 {
            Err(DbError::NotFound(
                "containing database does not exist".to_string(),
            ))
        } else {
            Err(DbError::NotFound(
                "containing collection does not exist".to_string(),
            ))
        };
    }

    let doc_name = segments[segments.len() - 1].clone();
    if doc_name.is_empty() {
        return Err(DbError::BadPath("document name too short".to_string()));
    }

    let body_value: Value = serde_json::from_slice(&body).map_err(|_| {
        DbError::BadRequest("unable to unmarshal encoded request body into JSONValue".to_string())
    })?;

    let col = require_collection(&resolved)?;
    let notify_col = Arc::clone(&col);
    let full_path = path::entity_path(uri.path())?.to_string();
    let schema = Arc::clone(&state.schema);

    let mut patch_failed = false;
    let mut parse_failed = false;
    let mut message = String::new();

    col.put_document(&doc_name, |key, current, _exists| {
        let Some(current) = current else {
            return Err(DbError::NotFound("document does not exist".to_string()));
        };

        let doc_value: Value = serde_json::from_str(current.data().get()).map_err(|_| {
            DbError::BadRequest("unable to unmarshal document data into JSONValue".to_string())
        })?;

        let ops = match patch::parse_ops(&body_value) {
            Ok(ops) => ops,
            Err(err) => {
                parse_failed = true;
                patch_failed = true;
                message = err.to_string();
                return Ok(Arc::clone(current));
            }
        };

        let patched = match patch::apply_all(doc_value, &ops) {
            Ok(patched) => patched,
            Err(err) => {
                patch_failed = true;
                message = err.to_string();
                return Ok(Arc::clone(current));
            }
        };

        schema
            .validate(&patched)
            .map_err(DbError::SchemaViolation)?;
        let encoded = serde_json::to_string(&patched)?;
        let raw = RawValue::from_string(encoded)?;

        let doc = current.with_data(raw, &username);
        let rendered = doc.render(&full_path).map_err(|_| {
            DbError::Internal("unable to format document for subscriptions".to_string())
        })?;
        subscribe::notify(&notify_col, key, &Frame::update(rendered));
        Ok(Arc::new(doc))
    })?;

    if message.is_empty() {
        message = "patch applied".to_string();
    }
    let status = if parse_failed {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    let location = HeaderValue::from_str(uri.path())
        .map_err(|_| DbError::BadRequest("unable to format uri".to_string()))?;
    Ok((
        status,
        [(header::LOCATION, location)],
        Json(PatchResponse {
            uri: uri.path().to_string(),
            patch_failed,
            message,
        }),
    )
        .into_response())
}

// --- shared helpers ---

fn last_segment_empty(segments: &[String]) -> bool {
    segments.last().map(|s| s.is_empty()).unwrap_or(false)
}

fn require_collection(resolved: &Resolved) -> Result<Arc<Collection>> {
    resolved
        .last_col
        .clone()
        .ok_or_else(|| DbError::Internal("resolver returned no collection".to_string()))
}

fn require_document(resolved: &Resolved) -> Result<Arc<Document>> {
    resolved
        .last_doc
        .clone()
        .ok_or_else(|| DbError::Internal("resolver returned no document".to_string()))
}

fn parse_raw_body(body: &Bytes) -> Result<Box<RawValue>> {
    let text = String::from_utf8(body.to_vec())
        .map_err(|_| DbError::BadRequest("invalid json encoding".to_string()))?;
    RawValue::from_string(text)
        .map_err(|_| DbError::BadRequest("invalid json encoding".to_string()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
