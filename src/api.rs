//! REST API for the warehouse service.
//!
//! Exposes planning (retrieve, store, reclaim), the completion callback used
//! by the middleware, layout and box registration, and the OpenAPI document.
//! Uses Axum as the web framework and supports CORS.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Json, Path, Query, State};
use axum::{
    Router,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};

use crate::config::{ApiConfig, AppConfig};
use crate::error::WarehouseError;
use crate::middleware::{Acknowledgement, ConnectionReport, DispatchError, Dispatcher};
use crate::model::{BoxKey, MovementRecord, Rack, Slot, WarehouseBox};
use crate::occupancy::{LookupMatch, OccupancyIndex};
use crate::persistence::save_snapshot;
use crate::planner::{OperationPlan, Planner, SkippedBox, StoreTarget};
use crate::reconciler::{CompletionNotification, ReconcileOutcome, Reconciler};
use crate::store::{NewBox, NewSlot, Warehouse};
use crate::types::{BoxId, Coord, RackId, SlotId};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    warehouse: Arc<Mutex<Warehouse>>,
    planner: Arc<Planner>,
    reconciler: Arc<Reconciler>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    in_flight: InFlight,
    state_path: Option<PathBuf>,
}

impl AppState {
    pub fn new(
        warehouse: Warehouse,
        config: &AppConfig,
        dispatcher: Option<Arc<dyn Dispatcher>>,
    ) -> Self {
        let planner = Planner::new(config.planner.clone());
        let reconciler = Reconciler::new(planner.config().intake_name.clone());
        Self {
            warehouse: Arc::new(Mutex::new(warehouse)),
            planner: Arc::new(planner),
            reconciler: Arc::new(reconciler),
            dispatcher,
            in_flight: InFlight::default(),
            state_path: config.storage.state_path().cloned(),
        }
    }

    fn warehouse(&self) -> MutexGuard<'_, Warehouse> {
        self.warehouse.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn intake_name(&self) -> &str {
        &self.planner.config().intake_name
    }

    fn dispatcher(&self) -> Result<Arc<dyn Dispatcher>, Response> {
        self.dispatcher
            .clone()
            .ok_or_else(|| dispatch_error(DispatchError::NotConfigured))
    }

    /// Writes the snapshot if a state path is configured; failures are logged only.
    fn persist(&self, warehouse: &Warehouse) {
        if let Some(path) = &self.state_path {
            if let Err(err) = save_snapshot(path, warehouse) {
                warn!("Could not save warehouse snapshot to {}: {}", path.display(), err);
            }
        }
    }
}

/// Boxes with a plan currently being built or dispatched.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<BoxId>>>);

impl InFlight {
    fn acquire(&self, ids: Vec<BoxId>) -> Result<InFlightGuard, WarehouseError> {
        let mut active = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(busy) = ids.iter().find(|id| active.contains(*id)) {
            return Err(WarehouseError::OperationInFlight(busy.clone()));
        }
        active.extend(ids.iter().cloned());
        Ok(InFlightGuard {
            owner: self.clone(),
            ids,
        })
    }
}

struct InFlightGuard {
    owner: InFlight,
    ids: Vec<BoxId>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut active = self.owner.0.lock().unwrap_or_else(PoisonError::into_inner);
        for id in &self.ids {
            active.remove(id);
        }
    }
}

static OPENAPI_DOC: OnceLock<utoipa::openapi::OpenApi> = OnceLock::new();

// SRI hashes verified against https://unpkg.com/swagger-ui-dist@5.17.14/ on 2025-10-29.
const SWAGGER_UI_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
    <head>
        <meta charset="utf-8" />
        <title>rackflow API Docs</title>
        <link
            rel="stylesheet"
            href="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui.css"
            integrity="sha384-wxLW6kwyHktdDGr6Pv1zgm/VGJh99lfUbzSn6HNHBENZlCN7W602k9VkGdxuFvPn"
            crossorigin="anonymous"
        />
    </head>
    <body>
        <div id="swagger-ui"></div>
        <script
            src="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui-bundle.js"
            integrity="sha384-wmyclcVGX/WhUkdkATwhaK1X1JtiNrr2EoYJ+diV3vj4v6OC5yCeSu+yW13SYJep"
            crossorigin="anonymous"
        ></script>
        <script
            src="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui-standalone-preset.js"
            integrity="sha384-2YH8WDRaj7V2OqU/trsmzSagmk/E2SutiCsGkdgoQwC9pNUJV1u/141DHB6jgs8t"
            crossorigin="anonymous"
        ></script>
        <script>
            window.onload = function () {
                const ui = SwaggerUIBundle({
                    url: "/docs/openapi.json",
                    dom_id: "#swagger-ui",
                    presets: [SwaggerUIBundle.presets.apis, SwaggerUIStandalonePreset],
                    layout: "StandaloneLayout",
                });
                window.ui = ui;
            };
        </script>
    </body>
    </html>"##;

fn openapi_doc() -> &'static utoipa::openapi::OpenApi {
    OPENAPI_DOC.get_or_init(ApiDoc::openapi)
}

// ---------------------------------------------------------------------------
// Request and response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

#[derive(Deserialize, ToSchema)]
#[schema(example = json!({ "id": "RACK-A", "name": "Rack A", "width": 10, "depth": 10, "height": 3 }))]
pub struct RackRequest {
    pub id: String,
    pub name: String,
    pub width: u32,
    pub depth: u32,
    pub height: u32,
}

#[derive(Deserialize, ToSchema, Clone, Copy, Debug)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    /// Addressable rack position
    Grid,
    /// Temporary area for displaced boxes
    Staging,
    /// The intake/exit door
    Intake,
}

#[derive(Deserialize, ToSchema)]
#[schema(example = json!({ "name": "A-3-1-1", "rack": "RACK-A", "kind": "grid", "coord": { "x": 3, "y": 1, "z": 1 } }))]
pub struct SlotRequest {
    pub name: String,
    pub kind: SlotKind,
    #[serde(default)]
    pub rack: Option<RackId>,
    #[serde(default)]
    pub coord: Coord,
}

#[derive(Deserialize, ToSchema)]
#[schema(example = json!({ "name": "Quality boxes", "key": "QBE" }))]
pub struct KeyRequest {
    pub name: String,
    pub key: String,
}

#[derive(Deserialize, ToSchema)]
#[schema(example = json!({ "key": "QBE", "home": 42 }))]
pub struct BoxRequest {
    pub key: String,
    #[serde(default)]
    pub home: Option<SlotId>,
    #[serde(default)]
    pub location: Option<SlotId>,
}

/// A box with its resolved location names and movement history.
#[derive(Serialize, ToSchema)]
pub struct BoxDetails {
    #[serde(rename = "box")]
    pub record: WarehouseBox,
    pub location_name: Option<String>,
    pub home_name: Option<String>,
    pub history: Vec<MovementRecord>,
}

#[derive(Serialize, ToSchema)]
pub struct StagingResponse {
    pub count: usize,
    /// Deepest first
    pub boxes: Vec<WarehouseBox>,
}

/// Rack position to look up.
#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PositionQuery {
    pub x: i32,
    /// Depth, 0 is the access side
    pub y: i32,
    pub z: i32,
}

/// The box found at a rack position.
#[derive(Serialize, ToSchema)]
pub struct PositionLookup {
    pub slot: SlotId,
    pub slot_name: String,
    pub matched: LookupMatch,
    #[serde(rename = "box")]
    pub record: WarehouseBox,
}

#[derive(Serialize, ToSchema)]
pub struct OutsideResponse {
    pub count: usize,
    pub boxes: Vec<WarehouseBox>,
}

/// A plan that the middleware accepted.
#[derive(Serialize, ToSchema)]
pub struct DispatchResponse {
    pub plan: OperationPlan,
    pub acknowledgement: Acknowledgement,
}

#[derive(Serialize, ToSchema)]
pub struct ReclaimResponse {
    pub plan: Option<OperationPlan>,
    pub skipped: Vec<SkippedBox>,
    pub acknowledgement: Option<Acknowledgement>,
}

/// JSON-RPC 2.0 wrapper the middleware uses for completion callbacks.
#[derive(Deserialize, ToSchema)]
#[schema(example = json!({
    "jsonrpc": "2.0",
    "method": "call",
    "params": {
        "operation_id": "PUT_IN-QBE12026000029-20260131-075555-0001",
        "operation_type": "put_in",
        "box_id": "QBE12026000029",
        "status": "completed",
        "new_location": { "x": 3, "y": 1, "z": 1 }
    },
    "id": null
}))]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<CompletionNotification>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub id: Value,
}

#[derive(Serialize, ToSchema)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[schema(value_type = Object)]
    pub id: Value,
    pub result: CompletionResult,
}

#[derive(Serialize, ToSchema)]
pub struct CompletionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReconcileOutcome>,
}

#[derive(Serialize, ToSchema)]
struct ErrorResponse {
    error: String,
    details: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: details.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_response(
    status: StatusCode,
    error: impl Into<String>,
    details: impl Into<String>,
) -> Response {
    (status, Json(ErrorResponse::new(error, details))).into_response()
}

fn json_deserialize_error(err: JsonRejection) -> Response {
    error_response(err.status(), "invalid_json", err.body_text())
}

fn status_for(err: &WarehouseError) -> StatusCode {
    match err {
        WarehouseError::MalformedNotification { .. } | WarehouseError::Validation(_) => {
            StatusCode::BAD_REQUEST
        }
        WarehouseError::BoxNotFound(_)
        | WarehouseError::SlotNotFound(_)
        | WarehouseError::RackNotFound(_)
        | WarehouseError::KeyNotFound(_)
        | WarehouseError::NoBoxAt { .. } => StatusCode::NOT_FOUND,
        WarehouseError::DuplicateOccupancy { .. } | WarehouseError::OperationInFlight(_) => {
            StatusCode::CONFLICT
        }
        WarehouseError::NoStagingAvailable { .. } | WarehouseError::IntakeMissing(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        WarehouseError::Persistence(_) | WarehouseError::Io(_) | WarehouseError::Json(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn warehouse_error(err: WarehouseError) -> Response {
    error_response(status_for(&err), err.code(), err.to_string())
}

fn dispatch_error(err: DispatchError) -> Response {
    let status = match err {
        DispatchError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    error_response(status, "dispatch_failed", err.to_string())
}

fn parse_json<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    payload.map(|Json(value)| value).map_err(json_deserialize_error)
}

async fn dispatch(dispatcher: Arc<dyn Dispatcher>, plan: OperationPlan) -> Response {
    match dispatcher.send(&plan).await {
        Ok(acknowledgement) => {
            info!(
                "Dispatched {} with {} steps",
                plan.operation_id,
                plan.step_count()
            );
            (
                StatusCode::OK,
                Json(DispatchResponse {
                    plan,
                    acknowledgement,
                }),
            )
                .into_response()
        }
        Err(err) => dispatch_error(err),
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/wms/health", get(handle_health))
        .route("/api/wms/racks", post(handle_create_rack))
        .route("/api/wms/slots", post(handle_create_slot))
        .route("/api/wms/keys", post(handle_register_key))
        .route("/api/wms/boxes", post(handle_create_box))
        .route("/api/wms/boxes/{id}", get(handle_get_box))
        .route("/api/wms/boxes/{id}/retrieve", post(handle_retrieve))
        .route("/api/wms/boxes/{id}/store", post(handle_store))
        .route("/api/wms/racks/{rack}/boxes", get(handle_box_at))
        .route("/api/wms/staging", get(handle_staging))
        .route("/api/wms/outside", get(handle_outside))
        .route("/api/wms/reclaim", post(handle_reclaim))
        .route("/api/wms/operation/complete", post(handle_operation_complete))
        .route("/api/wms/middleware", get(handle_middleware_status))
        .route("/api/wms/middleware/test", post(handle_middleware_test))
        // API documentation
        .route("/docs/openapi.json", get(serve_openapi_json))
        .route("/docs", get(serve_openapi_ui))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Starts the API server and blocks until it terminates.
pub async fn start_api_server(config: ApiConfig, state: AppState) {
    let app = router(state);

    let addr = config.socket_addr();
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Could not bind API server to {}: {}", addr, err);
            return;
        }
    };

    info!(
        "Server running on http://{}:{}",
        config.display_host(),
        config.port()
    );
    if config.binds_to_all_interfaces() {
        info!("Local access: http://localhost:{}", config.port());
    }
    info!("Documentation: GET /docs, GET /docs/openapi.json");

    if let Err(err) = axum::serve(listener, app).await {
        error!("API server terminated with an error: {err}");
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/wms/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "wms"
)]
async fn handle_health() -> Response {
    Json(HealthResponse {
        status: "ok",
        service: "rackflow",
    })
    .into_response()
}

/// Registers a rack and its dimensions.
#[utoipa::path(
    post,
    path = "/api/wms/racks",
    request_body = RackRequest,
    responses(
        (status = 201, description = "Rack created", body = Rack),
        (status = 400, description = "Invalid dimensions or duplicate id", body = ErrorResponse)
    ),
    tag = "layout"
)]
async fn handle_create_rack(
    State(state): State<AppState>,
    payload: Result<Json<RackRequest>, JsonRejection>,
) -> Response {
    let request = match parse_json(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let rack = match Rack::new(
        RackId::new(request.id),
        request.name,
        (request.width, request.depth, request.height),
    ) {
        Ok(rack) => rack,
        Err(err) => return warehouse_error(err),
    };

    let mut warehouse = state.warehouse();
    match warehouse.add_rack(rack.clone()) {
        Ok(()) => {
            state.persist(&warehouse);
            info!("Registered rack {}", rack.id);
            (StatusCode::CREATED, Json(rack)).into_response()
        }
        Err(err) => warehouse_error(err),
    }
}

/// Registers a grid, staging or intake slot.
#[utoipa::path(
    post,
    path = "/api/wms/slots",
    request_body = SlotRequest,
    responses(
        (status = 201, description = "Slot created", body = Slot),
        (status = 400, description = "Slot outside its rack or duplicate position", body = ErrorResponse),
        (status = 404, description = "Unknown rack", body = ErrorResponse)
    ),
    tag = "layout"
)]
async fn handle_create_slot(
    State(state): State<AppState>,
    payload: Result<Json<SlotRequest>, JsonRejection>,
) -> Response {
    let request = match parse_json(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let new_slot = match (request.kind, &request.rack) {
        (SlotKind::Grid, Some(rack)) => NewSlot::grid(request.name, rack, request.coord),
        (SlotKind::Grid, None) => {
            return warehouse_error(WarehouseError::validation(
                "A grid slot must name its rack",
            ));
        }
        (SlotKind::Staging, rack) => NewSlot::staging(request.name, rack.as_ref(), request.coord),
        (SlotKind::Intake, _) => NewSlot::intake(request.name),
    };

    let mut warehouse = state.warehouse();
    let created = warehouse
        .add_slot(new_slot)
        .and_then(|id| warehouse.slot(id).cloned().ok_or(WarehouseError::SlotNotFound(id)));
    match created {
        Ok(slot) => {
            state.persist(&warehouse);
            (StatusCode::CREATED, Json(slot)).into_response()
        }
        Err(err) => warehouse_error(err),
    }
}

/// Registers a box key; its sequence starts at 1.
#[utoipa::path(
    post,
    path = "/api/wms/keys",
    request_body = KeyRequest,
    responses(
        (status = 201, description = "Key registered", body = BoxKey),
        (status = 400, description = "Invalid or duplicate key", body = ErrorResponse)
    ),
    tag = "boxes"
)]
async fn handle_register_key(
    State(state): State<AppState>,
    payload: Result<Json<KeyRequest>, JsonRejection>,
) -> Response {
    let request = match parse_json(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let key = match BoxKey::new(request.name, request.key) {
        Ok(key) => key,
        Err(err) => return warehouse_error(err),
    };

    let mut warehouse = state.warehouse();
    match warehouse.register_key(key.clone()) {
        Ok(()) => {
            state.persist(&warehouse);
            (StatusCode::CREATED, Json(key)).into_response()
        }
        Err(err) => warehouse_error(err),
    }
}

/// Creates a box and mints its id; without a location it starts at the intake.
#[utoipa::path(
    post,
    path = "/api/wms/boxes",
    request_body = BoxRequest,
    responses(
        (status = 201, description = "Box created", body = WarehouseBox),
        (status = 404, description = "Unknown key or slot", body = ErrorResponse),
        (status = 409, description = "Initial rack position is occupied", body = ErrorResponse),
        (status = 422, description = "No intake slot configured", body = ErrorResponse)
    ),
    tag = "boxes"
)]
async fn handle_create_box(
    State(state): State<AppState>,
    payload: Result<Json<BoxRequest>, JsonRejection>,
) -> Response {
    let request = match parse_json(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let new_box = NewBox {
        key: request.key,
        home: request.home,
        location: request.location,
    };

    let mut warehouse = state.warehouse();
    let created = warehouse
        .create_box(new_box, state.intake_name(), Utc::now())
        .and_then(|id| {
            warehouse
                .get_box(&id)
                .cloned()
                .ok_or(WarehouseError::BoxNotFound(id))
        });
    match created {
        Ok(record) => {
            state.persist(&warehouse);
            info!("Created box {}", record.id);
            (StatusCode::CREATED, Json(record)).into_response()
        }
        Err(err) => warehouse_error(err),
    }
}

#[utoipa::path(
    get,
    path = "/api/wms/boxes/{id}",
    params(("id" = String, Path, description = "Box identifier")),
    responses(
        (status = 200, description = "Box state and movement history", body = BoxDetails),
        (status = 404, description = "Unknown box", body = ErrorResponse)
    ),
    tag = "boxes"
)]
async fn handle_get_box(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let box_id = BoxId::new(id);
    let warehouse = state.warehouse();
    let Some(record) = warehouse.get_box(&box_id) else {
        return warehouse_error(WarehouseError::BoxNotFound(box_id));
    };
    let slot_name = |id: SlotId| warehouse.slot(id).map(|slot| slot.name.clone());

    Json(BoxDetails {
        record: record.clone(),
        location_name: slot_name(record.current_location),
        home_name: record.home_location.and_then(slot_name),
        history: warehouse.history_for(&box_id).cloned().collect(),
    })
    .into_response()
}

/// Finds the box at a rack position; falls back to the box whose home it is.
#[utoipa::path(
    get,
    path = "/api/wms/racks/{rack}/boxes",
    params(("rack" = String, Path, description = "Rack identifier"), PositionQuery),
    responses(
        (status = 200, description = "Box at or homed at the position", body = PositionLookup),
        (status = 400, description = "Missing or invalid coordinates", body = ErrorResponse),
        (status = 404, description = "Unknown rack or no box at the position", body = ErrorResponse)
    ),
    tag = "boxes"
)]
async fn handle_box_at(
    State(state): State<AppState>,
    Path(rack): Path<String>,
    query: Result<Query<PositionQuery>, QueryRejection>,
) -> Response {
    let position = match query {
        Ok(Query(position)) => position,
        Err(err) => return error_response(err.status(), "invalid_query", err.body_text()),
    };
    let rack = RackId::new(rack);
    let coord = Coord::new(position.x, position.y, position.z);
    let warehouse = state.warehouse();
    if warehouse.rack(&rack).is_none() {
        return warehouse_error(WarehouseError::RackNotFound(rack));
    }

    match OccupancyIndex::new(&warehouse).lookup(&rack, coord) {
        Some((slot, record, matched)) => Json(PositionLookup {
            slot: slot.id,
            slot_name: slot.name.clone(),
            matched,
            record: record.clone(),
        })
        .into_response(),
        None => warehouse_error(WarehouseError::NoBoxAt { rack, coord }),
    }
}

/// Lists boxes outside the racks that are not parked in staging.
#[utoipa::path(
    get,
    path = "/api/wms/outside",
    responses((status = 200, description = "Boxes outside the warehouse", body = OutsideResponse)),
    tag = "boxes"
)]
async fn handle_outside(State(state): State<AppState>) -> Response {
    let warehouse = state.warehouse();
    let boxes: Vec<WarehouseBox> = OccupancyIndex::new(&warehouse)
        .boxes_outside()
        .into_iter()
        .cloned()
        .collect();
    Json(OutsideResponse {
        count: boxes.len(),
        boxes,
    })
    .into_response()
}

/// Lists boxes parked in staging, deepest first.
#[utoipa::path(
    get,
    path = "/api/wms/staging",
    responses((status = 200, description = "Staged boxes", body = StagingResponse)),
    tag = "boxes"
)]
async fn handle_staging(State(state): State<AppState>) -> Response {
    let warehouse = state.warehouse();
    let boxes: Vec<WarehouseBox> = OccupancyIndex::new(&warehouse)
        .boxes_in_staging(None)
        .into_iter()
        .cloned()
        .collect();
    Json(StagingResponse {
        count: boxes.len(),
        boxes,
    })
    .into_response()
}

/// Plans and dispatches taking a box out to the intake.
#[utoipa::path(
    post,
    path = "/api/wms/boxes/{id}/retrieve",
    params(("id" = String, Path, description = "Box identifier")),
    responses(
        (status = 200, description = "Plan accepted by the middleware", body = DispatchResponse),
        (status = 404, description = "Unknown box", body = ErrorResponse),
        (status = 409, description = "Another operation for this box is in flight", body = ErrorResponse),
        (status = 422, description = "Not enough free staging slots", body = ErrorResponse),
        (status = 502, description = "Middleware rejected or unreachable", body = ErrorResponse),
        (status = 503, description = "No middleware configured", body = ErrorResponse)
    ),
    tag = "operations"
)]
async fn handle_retrieve(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let box_id = BoxId::new(id);
    let dispatcher = match state.dispatcher() {
        Ok(dispatcher) => dispatcher,
        Err(response) => return response,
    };
    let _guard = match state.in_flight.acquire(vec![box_id.clone()]) {
        Ok(guard) => guard,
        Err(err) => return warehouse_error(err),
    };

    let plan = {
        let warehouse = state.warehouse();
        state.planner.plan_retrieve(&warehouse, &box_id, Utc::now())
    };
    match plan {
        Ok(plan) => dispatch(dispatcher, plan).await,
        Err(err) => warehouse_error(err),
    }
}

/// Plans and dispatches putting a box into a rack position.
///
/// The body is optional; without it the box goes to its home slot.
#[utoipa::path(
    post,
    path = "/api/wms/boxes/{id}/store",
    params(("id" = String, Path, description = "Box identifier")),
    request_body(content = StoreTarget, description = "Optional explicit destination"),
    responses(
        (status = 200, description = "Plan accepted by the middleware", body = DispatchResponse),
        (status = 400, description = "No destination could be resolved", body = ErrorResponse),
        (status = 404, description = "Unknown box, slot or rack", body = ErrorResponse),
        (status = 409, description = "Destination occupied or operation in flight", body = ErrorResponse),
        (status = 502, description = "Middleware rejected or unreachable", body = ErrorResponse),
        (status = 503, description = "No middleware configured", body = ErrorResponse)
    ),
    tag = "operations"
)]
async fn handle_store(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let box_id = BoxId::new(id);
    let target = if body.iter().all(u8::is_ascii_whitespace) {
        StoreTarget::default()
    } else {
        match serde_json::from_slice::<StoreTarget>(&body) {
            Ok(target) => target,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, "invalid_json", err.to_string());
            }
        }
    };
    let dispatcher = match state.dispatcher() {
        Ok(dispatcher) => dispatcher,
        Err(response) => return response,
    };
    let _guard = match state.in_flight.acquire(vec![box_id.clone()]) {
        Ok(guard) => guard,
        Err(err) => return warehouse_error(err),
    };

    let plan = {
        let warehouse = state.warehouse();
        state
            .planner
            .plan_store(&warehouse, &box_id, &target, Utc::now())
    };
    match plan {
        Ok(plan) => dispatch(dispatcher, plan).await,
        Err(err) => warehouse_error(err),
    }
}

/// Plans and dispatches returning staged boxes to their home slots.
#[utoipa::path(
    post,
    path = "/api/wms/reclaim",
    responses(
        (status = 200, description = "Reclaim plan (null when nothing can go home) and skipped boxes", body = ReclaimResponse),
        (status = 409, description = "A staged box is part of another operation", body = ErrorResponse),
        (status = 502, description = "Middleware rejected or unreachable", body = ErrorResponse),
        (status = 503, description = "No middleware configured", body = ErrorResponse)
    ),
    tag = "operations"
)]
async fn handle_reclaim(State(state): State<AppState>) -> Response {
    let dispatcher = match state.dispatcher() {
        Ok(dispatcher) => dispatcher,
        Err(response) => return response,
    };
    let reclaim = {
        let warehouse = state.warehouse();
        state.planner.plan_reclaim(&warehouse, Utc::now())
    };
    for skipped in &reclaim.skipped {
        warn!("Reclaim skipped box {}: {}", skipped.box_id, skipped.reason);
    }

    let Some(plan) = reclaim.plan else {
        return Json(ReclaimResponse {
            plan: None,
            skipped: reclaim.skipped,
            acknowledgement: None,
        })
        .into_response();
    };

    let ids: Vec<BoxId> = plan.sequence.iter().map(|step| step.box_id.clone()).collect();
    let _guard = match state.in_flight.acquire(ids) {
        Ok(guard) => guard,
        Err(err) => return warehouse_error(err),
    };
    match dispatcher.send(&plan).await {
        Ok(acknowledgement) => {
            info!(
                "Dispatched reclaim {} for {} boxes",
                plan.operation_id,
                plan.step_count()
            );
            Json(ReclaimResponse {
                plan: Some(plan),
                skipped: reclaim.skipped,
                acknowledgement: Some(acknowledgement),
            })
            .into_response()
        }
        Err(err) => dispatch_error(err),
    }
}

fn rpc_response(status: StatusCode, id: Value, result: CompletionResult) -> Response {
    (
        status,
        Json(RpcResponse {
            jsonrpc: "2.0",
            id,
            result,
        }),
    )
        .into_response()
}

fn rpc_error(id: Value, err: &WarehouseError) -> Response {
    rpc_response(
        status_for(err),
        id,
        CompletionResult {
            success: false,
            code: Some(err.code()),
            error: Some(err.to_string()),
            outcome: None,
        },
    )
}

/// Completion callback from the middleware, one box per call.
///
/// The body is read leniently so callers that omit `Content-Type` still work.
#[utoipa::path(
    post,
    path = "/api/wms/operation/complete",
    request_body = RpcRequest,
    responses(
        (status = 200, description = "Reconciled, failed or ignored", body = RpcResponse),
        (status = 400, description = "Malformed notification; nothing was changed", body = RpcResponse),
        (status = 404, description = "Unknown box", body = RpcResponse),
        (status = 409, description = "Reported position is held by another box", body = RpcResponse)
    ),
    tag = "operations"
)]
async fn handle_operation_complete(State(state): State<AppState>, body: Bytes) -> Response {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            warn!("Unreadable completion callback: {}", err);
            return rpc_error(
                Value::Null,
                &WarehouseError::validation(format!("Invalid JSON-RPC body: {err}")),
            );
        }
    };
    let id = request.id;
    let notification = request.params.unwrap_or_default();
    info!(
        "Completion callback for {:?} ({:?})",
        notification.operation_id, notification.box_id
    );

    let mut warehouse = state.warehouse();
    let reconciler = state.reconciler.clone();
    let outcome = warehouse.transaction(|tx| reconciler.reconcile(tx, notification, Utc::now()));
    match outcome {
        Ok(outcome) => {
            if matches!(outcome, ReconcileOutcome::Applied { .. }) {
                state.persist(&warehouse);
            }
            let success = !matches!(outcome, ReconcileOutcome::Failed { .. });
            rpc_response(
                StatusCode::OK,
                id,
                CompletionResult {
                    success,
                    code: None,
                    error: None,
                    outcome: Some(outcome),
                },
            )
        }
        Err(err) => {
            warn!("Completion callback rejected: {}", err);
            rpc_error(id, &err)
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/wms/middleware",
    responses((status = 200, description = "Last connection test", body = ConnectionReport)),
    tag = "middleware"
)]
async fn handle_middleware_status(State(state): State<AppState>) -> Response {
    let report = match &state.dispatcher {
        Some(dispatcher) => dispatcher.status(),
        None => ConnectionReport {
            message: Some(DispatchError::NotConfigured.to_string()),
            ..ConnectionReport::default()
        },
    };
    Json(report).into_response()
}

#[utoipa::path(
    post,
    path = "/api/wms/middleware/test",
    responses(
        (status = 200, description = "Probe result", body = ConnectionReport),
        (status = 503, description = "No middleware configured", body = ErrorResponse)
    ),
    tag = "middleware"
)]
async fn handle_middleware_test(State(state): State<AppState>) -> Response {
    match state.dispatcher() {
        Ok(dispatcher) => Json(dispatcher.test_connection().await).into_response(),
        Err(response) => response,
    }
}

async fn serve_openapi_json() -> impl IntoResponse {
    Json(openapi_doc())
}

async fn serve_openapi_ui() -> impl IntoResponse {
    Html(SWAGGER_UI_HTML)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handle_health,
        handle_create_rack,
        handle_create_slot,
        handle_register_key,
        handle_create_box,
        handle_get_box,
        handle_box_at,
        handle_staging,
        handle_outside,
        handle_retrieve,
        handle_store,
        handle_reclaim,
        handle_operation_complete,
        handle_middleware_status,
        handle_middleware_test
    ),
    components(
        schemas(
            HealthResponse,
            RackRequest,
            SlotRequest,
            SlotKind,
            KeyRequest,
            BoxRequest,
            BoxDetails,
            StagingResponse,
            PositionLookup,
            LookupMatch,
            OutsideResponse,
            DispatchResponse,
            ReclaimResponse,
            RpcRequest,
            RpcResponse,
            CompletionResult,
            CompletionNotification,
            ReconcileOutcome,
            StoreTarget,
            OperationPlan,
            ConnectionReport,
            ErrorResponse
        )
    ),
    tags(
        (name = "wms", description = "Service status"),
        (name = "layout", description = "Racks and slots"),
        (name = "boxes", description = "Box keys, registration and lookup"),
        (name = "operations", description = "Planning, dispatch and completion callbacks"),
        (name = "middleware", description = "Automation middleware connection")
    )
)]
struct ApiDoc;
