use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use relation_order_api::{
    CollectionView, ListRelationsRequest, MigrateResult, NewRelation, OrderingApi,
    OrderingConfig, RelationRecord, RemoveRelationRequest, RemoveRelationResult,
    ReorderCoalescer, ReorderRequest, ReorderResult, SchemaStatus, SetIndexRequest,
    ShowCollectionRequest, ToggleColumnRequest, ToggleColumnResult, Triple,
    API_CONTRACT_VERSION,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: OrderingApi,
    reorders: ReorderCoalescer<ReorderRequest>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct RelationList {
    relations: Vec<RelationRecord>,
}

#[derive(Debug, Clone, Serialize)]
struct ReorderQueued {
    coalesce_key: String,
    superseded: bool,
    quiet_period_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
struct FlushResult {
    flushed_keys: Vec<String>,
}

#[derive(Debug, Parser)]
#[command(name = "relation-order-service")]
#[command(about = "Local HTTP service for relation ordering")]
struct Args {
    #[arg(long, default_value = "./relation_order.sqlite3")]
    db: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    /// Must be called inside a tokio runtime.
    fn new(api: OrderingApi) -> Self {
        let worker_api = api.clone();
        let reorders = ReorderCoalescer::new(api.config().quiet_period(), move |key, request| {
            match worker_api.reorder_collection(request) {
                Ok(result) if result.report.is_clean() => {
                    info!(key = %key, path = ?result.report.path, "coalesced reorder applied");
                }
                Ok(result) => {
                    warn!(
                        key = %key,
                        failures = result.report.failures.len(),
                        aborted = result.report.aborted,
                        "coalesced reorder applied with failures"
                    );
                }
                Err(err) => warn!(key = %key, error = %err, "coalesced reorder failed"),
            }
        });
        Self { api, reorders }
    }

    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/relations/add", post(relations_add))
        .route("/v1/relations/remove", post(relations_remove))
        .route("/v1/relations/list", post(relations_list))
        .route("/v1/index/set", post(index_set))
        .route("/v1/collections/show", post(collections_show))
        .route("/v1/collections/reorder", post(collections_reorder))
        .route("/v1/collections/reorder/coalesced", post(collections_reorder_coalesced))
        .route("/v1/collections/flush", post(collections_flush))
        .route("/v1/collections/toggle-column", post(collections_toggle_column))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; serving until killed");
        std::future::pending::<()>().await;
    }
}

/// Serve until `shutdown` resolves, then apply every queued reorder.
async fn serve<F>(listener: tokio::net::TcpListener, state: ServiceState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app(state.clone())).with_graceful_shutdown(shutdown).await?;
    info!(pending = state.reorders.pending_keys().len(), "flushing queued reorders");
    state.reorders.flush().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = OrderingConfig::load_or_default(args.config.as_deref())?;
    let state = ServiceState::new(OrderingApi::with_config(args.db, config));
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "relation order service listening");
    serve(listener, state, shutdown_signal()).await
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result =
        state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn relations_add(
    State(state): State<ServiceState>,
    Json(request): Json<NewRelation>,
) -> Result<Json<ServiceEnvelope<RelationRecord>>, ServiceError> {
    let record =
        state.api.add_relation(&request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(record)))
}

async fn relations_remove(
    State(state): State<ServiceState>,
    Json(request): Json<RemoveRelationRequest>,
) -> Result<Json<ServiceEnvelope<RemoveRelationResult>>, ServiceError> {
    let result =
        state.api.remove_relation(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn relations_list(
    State(state): State<ServiceState>,
    Json(request): Json<ListRelationsRequest>,
) -> Result<Json<ServiceEnvelope<RelationList>>, ServiceError> {
    let relations =
        state.api.list_relations(&request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(RelationList { relations })))
}

async fn index_set(
    State(state): State<ServiceState>,
    Json(request): Json<SetIndexRequest>,
) -> Result<Json<ServiceEnvelope<Triple>>, ServiceError> {
    let triple = state.api.set_index(&request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(triple)))
}

async fn collections_show(
    State(state): State<ServiceState>,
    Json(request): Json<ShowCollectionRequest>,
) -> Result<Json<ServiceEnvelope<CollectionView>>, ServiceError> {
    let view =
        state.api.load_collection(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(view)))
}

async fn collections_reorder(
    State(state): State<ServiceState>,
    Json(request): Json<ReorderRequest>,
) -> Result<Json<ServiceEnvelope<ReorderResult>>, ServiceError> {
    let result =
        state.api.reorder_collection(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

/// Queue the reorder; only the last request per collection within the quiet
/// period is applied.
async fn collections_reorder_coalesced(
    State(state): State<ServiceState>,
    Json(request): Json<ReorderRequest>,
) -> (StatusCode, Json<ServiceEnvelope<ReorderQueued>>) {
    let coalesce_key = request.coalesce_key();
    let superseded = state.reorders.submit(coalesce_key.clone(), request);
    let quiet_period_ms =
        u64::try_from(state.reorders.quiet_period().as_millis()).unwrap_or(u64::MAX);
    (
        StatusCode::ACCEPTED,
        Json(envelope(ReorderQueued { coalesce_key, superseded, quiet_period_ms })),
    )
}

async fn collections_flush(State(state): State<ServiceState>) -> Json<ServiceEnvelope<FlushResult>> {
    let flushed_keys = state.reorders.pending_keys();
    state.reorders.flush().await;
    Json(envelope(FlushResult { flushed_keys }))
}

async fn collections_toggle_column(
    State(state): State<ServiceState>,
    Json(request): Json<ToggleColumnRequest>,
) -> Result<Json<ServiceEnvelope<ToggleColumnResult>>, ServiceError> {
    let result =
        state.api.toggle_column(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("relation-order-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn router_for(db_path: PathBuf) -> (Router, ServiceState) {
        let state = ServiceState::new(OrderingApi::new(db_path));
        (app(state.clone()), state)
    }

    async fn response_text(response: Response) -> String {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        }
    }

    async fn response_json(response: Response) -> Value {
        let body = response_text(response).await;
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn post_json(router: &Router, uri: &str, payload: &Value) -> Response {
        match router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    async fn get_request(router: &Router, uri: &str) -> Response {
        match router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    async fn add_columns(router: &Router, tos: &[&str]) {
        for to in tos {
            let payload = serde_json::json!({
                "relation_id": format!("rel-{to}"),
                "space_id": "space-1",
                "type_id": "shown-columns",
                "from_entity_id": "block-1",
                "to_entity_id": to,
                "to_entity_name": null
            });
            let response = post_json(router, "/v1/relations/add", &payload).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    fn table() -> Value {
        serde_json::json!({"kind": "table_columns", "block_entity_id": "block-1"})
    }

    fn view_ids(view: &Value) -> Vec<String> {
        view.get("items")
            .and_then(Value::as_array)
            .unwrap_or_else(|| panic!("missing items in view: {view}"))
            .iter()
            .filter_map(|item| item.get("relation_id").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    async fn shown_ids(router: &Router) -> Vec<String> {
        let response = post_json(
            router,
            "/v1/collections/show",
            &serde_json::json!({"space_id": "space-1", "collection": table()}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        view_ids(&value["data"])
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (router, _) = router_for(unique_temp_db_path());

        let response = get_request(&router, "/v1/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value.get("api_contract_version").and_then(Value::as_str), Some(API_CONTRACT_VERSION));
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let (router, _) = router_for(unique_temp_db_path());

        let response = get_request(&router, "/v1/openapi").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_text(response).await;
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/collections/reorder"));
        assert!(body.contains("/v1/collections/flush"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn reorder_then_show_round_trip() {
        let db_path = unique_temp_db_path();
        let (router, _) = router_for(db_path.clone());
        add_columns(&router, &["a", "b", "c"]).await;

        let response = post_json(
            &router,
            "/v1/collections/reorder",
            &serde_json::json!({
                "space_id": "space-1",
                "collection": table(),
                "relation_ids": ["rel-b", "rel-c", "rel-a"]
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["data"]["report"]["path"], Value::String("repair_all".to_string()));
        assert_eq!(view_ids(&value["data"]["view"]), vec!["rel-b", "rel-c", "rel-a"]);

        assert_eq!(shown_ids(&router).await, vec!["rel-b", "rel-c", "rel-a"]);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn coalesced_reorders_apply_only_the_last_request() {
        let db_path = unique_temp_db_path();
        let (router, state) = router_for(db_path.clone());
        add_columns(&router, &["a", "b", "c"]).await;

        let first = post_json(
            &router,
            "/v1/collections/reorder/coalesced",
            &serde_json::json!({
                "space_id": "space-1",
                "collection": table(),
                "relation_ids": ["rel-c", "rel-b", "rel-a"]
            }),
        )
        .await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let first = response_json(first).await;
        assert_eq!(first["data"]["superseded"], Value::Bool(false));

        let second = post_json(
            &router,
            "/v1/collections/reorder/coalesced",
            &serde_json::json!({
                "space_id": "space-1",
                "collection": table(),
                "relation_ids": ["rel-b", "rel-a", "rel-c"]
            }),
        )
        .await;
        let second = response_json(second).await;
        assert_eq!(second["data"]["superseded"], Value::Bool(true));
        assert_eq!(state.reorders.pending_keys().len(), 1);

        let flushed = post_json(&router, "/v1/collections/flush", &serde_json::json!({})).await;
        assert_eq!(flushed.status(), StatusCode::OK);
        let flushed = response_json(flushed).await;
        assert_eq!(
            flushed["data"]["flushed_keys"],
            serde_json::json!(["space-1/table_columns:block-1"])
        );

        assert_eq!(shown_ids(&router).await, vec!["rel-b", "rel-a", "rel-c"]);
        assert!(state.reorders.pending_keys().is_empty());

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn shutdown_applies_queued_reorders() {
        let db_path = unique_temp_db_path();
        let config = OrderingConfig { reorder_quiet_period_ms: 60_000, ..OrderingConfig::default() };
        let state = ServiceState::new(OrderingApi::with_config(db_path.clone(), config));
        let router = app(state.clone());
        add_columns(&router, &["a", "b", "c"]).await;

        let queued = post_json(
            &router,
            "/v1/collections/reorder/coalesced",
            &serde_json::json!({
                "space_id": "space-1",
                "collection": table(),
                "relation_ids": ["rel-c", "rel-a", "rel-b"]
            }),
        )
        .await;
        assert_eq!(queued.status(), StatusCode::ACCEPTED);
        assert_eq!(state.reorders.pending_keys().len(), 1);

        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(err) => panic!("failed to bind test listener: {err}"),
        };
        if let Err(err) = serve(listener, state.clone(), std::future::ready(())).await {
            panic!("serve failed: {err}");
        }

        assert!(state.reorders.pending_keys().is_empty());
        assert_eq!(shown_ids(&router).await, vec!["rel-c", "rel-a", "rel-b"]);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn toggle_column_and_errors_use_service_envelope() {
        let (router, _) = router_for(unique_temp_db_path());

        let toggled = post_json(
            &router,
            "/v1/collections/toggle-column",
            &serde_json::json!({
                "space_id": "space-1",
                "block_entity_id": "block-1",
                "column_entity_id": "status",
                "column_name": "Status"
            }),
        )
        .await;
        assert_eq!(toggled.status(), StatusCode::OK);
        let toggled = response_json(toggled).await;
        assert_eq!(toggled["data"]["shown"], Value::Bool(true));
        assert_eq!(toggled["data"]["view"]["shown_column_ids"], serde_json::json!(["status", "name"]));

        let rejected = post_json(
            &router,
            "/v1/index/set",
            &serde_json::json!({"space_id": "space-1", "entity_id": "rel-1", "value": ""}),
        )
        .await;
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
        let rejected = response_json(rejected).await;
        assert_eq!(
            rejected.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert!(rejected
            .get("error")
            .and_then(Value::as_str)
            .is_some_and(|error| error.contains("must not be empty")));
    }
}
