use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::PortalError;
use crate::execute::Pagination;
use crate::export::ExportOptions;
use crate::interface::{AvailableFields, CancelToken, QueryId, QueryInterface};
use crate::query::QueryGroup;
use crate::translate::{SortDirection, SortSpec};

pub const QUERY_ID_HEADER: &str = "x-query-id";
// slack on top of the engine's own deadline before the handler gives up
const GRACE: Duration = Duration::from_secs(2);
// chunks in flight between the export thread and the response body
const CHANNEL_DEPTH: usize = 4;

/// A failed request, rendered as `{detail, status_code, kind}`.
#[derive(Debug)]
pub struct ApiError(pub PortalError);

impl From<PortalError> for ApiError {
    fn from(error: PortalError) -> Self {
        Self(error)
    }
}

pub fn status_for(error: &PortalError) -> StatusCode {
    match error {
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        PortalError::ExportTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        PortalError::QueryTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        // nginx's "client closed request"
        PortalError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
    status_code: u16,
    kind: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(error = %self.0, code = status.as_u16(), "request failed");
        } else {
            info!(error = %self.0, code = status.as_u16(), "request rejected");
        }
        let body = ErrorBody {
            detail: self.0.user_message(),
            status_code: status.as_u16(),
            kind: self.0.kind(),
        };
        (status, Json(body)).into_response()
    }
}

/// Cancels the token when the handler future is dropped, which is what
/// happens when the client goes away before a response is produced.
struct CancelOnDrop(Option<CancelToken>);
impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}
impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.0.take() {
            token.cancel();
        }
    }
}

/// Hands serialized export bytes to the response body. A closed channel
/// means the client is gone, so the export is cancelled.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    cancel: CancelToken,
}
impl io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.tx.blocking_send(Ok(Bytes::copy_from_slice(buf))).is_err() {
            self.cancel.cancel();
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "export receiver closed"));
        }
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub sort_field: Option<String>,
    pub sort_direction: Option<SortDirection>,
}

#[derive(Deserialize)]
struct SearchEnvelope {
    query: QueryGroup,
    #[serde(default)]
    sort_field: Option<String>,
    #[serde(default)]
    sort_direction: Option<SortDirection>,
}

#[derive(Deserialize)]
struct ExportRequest {
    query: QueryGroup,
    #[serde(default)]
    export_options: ExportOptions,
    #[serde(default)]
    sort_field: Option<String>,
    #[serde(default)]
    sort_direction: Option<SortDirection>,
}

fn sort_spec(field: Option<String>, direction: Option<SortDirection>) -> Option<SortSpec> {
    field
        .filter(|f| !f.trim().is_empty())
        .map(|field| SortSpec { field, direction: direction.unwrap_or_default() })
}

/// The search body is either a bare query tree or `{query, sort_field, sort_direction}`.
fn search_body(body: Value, params: &SearchParams) -> Result<(QueryGroup, Option<SortSpec>), PortalError> {
    let malformed = |e: serde_json::Error| PortalError::Malformed(e.to_string());
    if body.get("query").is_some() {
        let envelope: SearchEnvelope = serde_json::from_value(body).map_err(malformed)?;
        let sort = sort_spec(
            envelope.sort_field.or_else(|| params.sort_field.clone()),
            envelope.sort_direction.or(params.sort_direction),
        );
        Ok((envelope.query, sort))
    } else {
        let tree: QueryGroup = serde_json::from_value(body).map_err(malformed)?;
        Ok((tree, sort_spec(params.sort_field.clone(), params.sort_direction)))
    }
}

fn with_query_id(mut response: Response, id: QueryId) -> Response {
    response
        .headers_mut()
        .insert(HeaderName::from_static(QUERY_ID_HEADER), HeaderValue::from(id.value()));
    response
}

fn join_error(error: tokio::task::JoinError) -> PortalError {
    PortalError::Invariant(format!("worker task failed: {error}"))
}

async fn search(
    State(interface): State<Arc<QueryInterface>>,
    params: Result<Query<SearchParams>, QueryRejection>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params.map_err(|e| PortalError::Malformed(e.body_text()))?;
    let Json(body) = body.map_err(|e| PortalError::Malformed(e.body_text()))?;
    let (tree, sort) = search_body(body, &params)?;
    let pagination = Pagination::resolve(params.skip, params.limit, interface.limits())?;
    tree.validate(interface.catalog())?;

    let registration = interface.register()?;
    let id = registration.id();
    let guard = CancelOnDrop(Some(registration.token().clone()));
    let timeout = interface.limits().query_timeout;
    let worker = Arc::clone(&interface);
    let task = tokio::task::spawn_blocking(move || {
        worker.search(&tree, sort.as_ref(), pagination, registration.token())
    });
    let page = match tokio::time::timeout(timeout + GRACE, task).await {
        Ok(joined) => joined.map_err(join_error)??,
        Err(_) => {
            warn!(query_id = %id, "search outlived its deadline");
            return Err(PortalError::QueryTimeout(timeout).into());
        }
    };
    guard.disarm();
    Ok(with_query_id(Json(page).into_response(), id))
}

async fn available_fields(State(interface): State<Arc<QueryInterface>>) -> Json<AvailableFields> {
    Json(interface.available_fields())
}

async fn export(
    State(interface): State<Arc<QueryInterface>>,
    params: Result<Query<SearchParams>, QueryRejection>,
    body: Result<Json<ExportRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params.map_err(|e| PortalError::Malformed(e.body_text()))?;
    let Json(request) = body.map_err(|e| PortalError::Malformed(e.body_text()))?;
    let sort = sort_spec(
        request.sort_field.or(params.sort_field),
        request.sort_direction.or(params.sort_direction),
    );
    let plan = interface.prepare_export(&request.query, &request.export_options, sort.as_ref())?;
    let content_type = plan.content_type();
    let filename = plan.filename();

    let registration = interface.register()?;
    let id = registration.id();
    let guard = CancelOnDrop(Some(registration.token().clone()));
    let timeout = interface.limits().export_timeout;
    let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
    let worker = Arc::clone(&interface);
    let task = tokio::task::spawn_blocking(move || {
        let started = Instant::now();
        let token = registration.token().clone();
        let writer = ChannelWriter { tx: tx.clone(), cancel: token.clone() };
        let result = worker.export(&plan, &token, writer);
        match &result {
            Ok(rows) => info!(
                query_id = %id,
                rows,
                ms = started.elapsed().as_secs_f64() * 1000.0,
                "export streamed"
            ),
            Err(error) => {
                if matches!(error, PortalError::Cancelled) {
                    info!(query_id = %id, "export cancelled");
                } else {
                    warn!(query_id = %id, %error, "export failed");
                }
                // an error item makes the body end abnormally, so a cut-short
                // file never looks complete
                let _ = tx.blocking_send(Err(io::Error::other(error.user_message())));
            }
        }
        result
    });

    // nothing is sent until the count passed the ceiling and the first chunk exists
    let first = match tokio::time::timeout(timeout + GRACE, rx.recv()).await {
        Ok(first) => first,
        Err(_) => return Err(PortalError::QueryTimeout(timeout).into()),
    };
    let body = match first {
        Some(Ok(chunk)) => {
            let rest = ReceiverStream::new(rx);
            Body::from_stream(stream::once(async move { Ok::<_, io::Error>(chunk) }).chain(rest))
        }
        Some(Err(_)) | None => {
            task.await.map_err(join_error)??;
            Body::empty()
        }
    };
    guard.disarm();
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_DISPOSITION, format!("attachment; filename={filename}"))
        .body(body)
        .map_err(|e| PortalError::Invariant(e.to_string()))?;
    Ok(with_query_id(response, id))
}

async fn cancel_query(State(interface): State<Arc<QueryInterface>>, Path(id): Path<u64>) -> Result<Response, ApiError> {
    if interface.cancel(QueryId::new(id))? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        let detail = format!("No running query with id {id}");
        Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"detail": detail, "status_code": 404, "kind": "not_found"})),
        )
            .into_response())
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

async fn root() -> Json<Value> {
    Json(json!({
        "name": "AGN-DB API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "online",
    }))
}

fn cors(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %o, "ignoring unparsable CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(QUERY_ID_HEADER), CONTENT_DISPOSITION])
}

pub fn router(interface: Arc<QueryInterface>, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/search", post(search))
        .route("/search/available-fields", get(available_fields))
        .route("/search/export", post(export))
        .route("/search/queries/:id", delete(cancel_query))
        .layer(cors(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(interface)
}
