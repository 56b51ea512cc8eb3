//! HTTP API gateway.
//!
//! A stateless JSON façade over the dispatcher, snapshot service and
//! migration coordinator. Handlers only parse, delegate and map results;
//! every success body is `{"success": true, "message": ...}` (plus extra
//! fields for queries) and every error body is
//! `{"error": <kind>, "reason": <message>}`.
//!
//! All mutating endpoints are synchronous: the response is sent once the
//! operation has finished.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{Method, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use virtpilot_hypervisor::{ConsoleInfo, VmInfo, VmState};

use crate::dispatcher::{Dispatcher, VmSpec};
use crate::error::ControlError;
use crate::iso_manager::IsoCatalog;
use crate::migration::{MigrationCoordinator, MigrationJob};
use crate::snapshot::SnapshotService;
use crate::state_machine::{self, Action};

/// Shared state for HTTP handlers
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub snapshots: SnapshotService,
    pub migration: MigrationCoordinator,
    pub iso: IsoCatalog,
    /// URI used when a request does not carry one
    pub default_uri: String,
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
    reason: String,
    /// Terminal record of a migration that did not commit
    #[serde(skip_serializing_if = "Option::is_none")]
    job: Option<MigrationJob>,
}

type ApiFailure = (StatusCode, Json<ApiError>);
type ApiResult<T> = Result<Json<T>, ApiFailure>;

fn status_for(err: &ControlError) -> StatusCode {
    match err {
        ControlError::VmNotFound(_)
        | ControlError::SnapshotNotFound { .. }
        | ControlError::SourceNotFound(_) => StatusCode::NOT_FOUND,
        ControlError::InvalidTransition { .. }
        | ControlError::AlreadyInTargetState { .. }
        | ControlError::DuplicateSnapshot { .. }
        | ControlError::NameCollision { .. }
        | ControlError::InvalidState { .. } => StatusCode::CONFLICT,
        ControlError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ControlError::Connection { .. } => StatusCode::BAD_GATEWAY,
        ControlError::PartialFailure(_) | ControlError::Driver(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn api_error(err: ControlError) -> ApiFailure {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(kind = err.kind(), error = %err, "Request failed");
    } else {
        warn!(kind = err.kind(), error = %err, "Request rejected");
    }

    (
        status,
        Json(ApiError {
            error: err.kind().to_string(),
            reason: err.to_string(),
            job: None,
        }),
    )
}

fn invalid(reason: impl Into<String>) -> ApiFailure {
    api_error(ControlError::InvalidRequest(reason.into()))
}

fn required(field: &str, value: Option<String>) -> Result<String, ApiFailure> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(invalid(format!("missing required field '{}'", field))),
    }
}

/// Unwrap a JSON body, reporting malformed bodies as `invalid_request`.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiFailure> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| invalid(rejection.body_text()))
}

#[derive(Serialize)]
pub struct MessageResponse {
    success: bool,
    message: String,
}

fn ok(message: impl Into<String>) -> ApiResult<MessageResponse> {
    Ok(Json(MessageResponse {
        success: true,
        message: message.into(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct UriQuery {
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VmRequest {
    uri: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    uri: Option<String>,
    name: Option<String>,
    /// RAM in MiB
    ram: Option<u64>,
    cpu: Option<u32>,
    /// Disk in GiB
    disk: Option<u64>,
    iso: Option<String>,
    osinfo: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CloneRequest {
    uri: Option<String>,
    src: Option<String>,
    dst: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    uri: Option<String>,
    name: Option<String>,
    dest: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    uri: Option<String>,
    name: Option<String>,
    snapshot: Option<String>,
}

#[derive(Serialize)]
pub struct VmSummary {
    name: String,
    state: VmState,
}

#[derive(Serialize)]
pub struct VmListResponse {
    vms: Vec<VmSummary>,
}

#[derive(Serialize)]
pub struct VmInfoResponse {
    vm: VmInfo,
    /// Actions a client may offer for the VM's current state
    actions: Vec<Action>,
}

#[derive(Serialize)]
pub struct ConsoleResponse {
    success: bool,
    message: String,
    console: ConsoleInfo,
}

#[derive(Serialize)]
pub struct MigrateResponse {
    success: bool,
    message: String,
    job: MigrationJob,
}

#[derive(Serialize)]
pub struct SnapshotListResponse {
    snapshots: Vec<String>,
}

#[derive(Serialize)]
pub struct RevertResponse {
    success: bool,
    message: String,
    state: VmState,
}

#[derive(Serialize)]
pub struct DriverInfo {
    name: String,
    version: String,
    live_migration: bool,
    snapshots: bool,
}

#[derive(Serialize)]
pub struct HealthResponse {
    uri: String,
    hostname: String,
    reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    driver: Option<DriverInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct HostsResponse {
    hosts: Vec<String>,
}

impl AppState {
    fn uri(&self, uri: Option<String>) -> String {
        uri.filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.default_uri.clone())
    }

    fn target(&self, req: VmRequest) -> Result<(String, String), ApiFailure> {
        let name = required("name", req.name)?;
        Ok((self.uri(req.uri), name))
    }
}

// ============================================================================
// Server
// ============================================================================

/// Serve the API until the listener fails.
pub async fn run_http_server(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(address = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the application router with all routes
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let api_routes = Router::new()
        // Queries
        .route("/vms", get(list_vms))
        .route("/vm_info", post(vm_info))
        .route("/iso", get(list_isos))
        .route("/health", get(health))
        .route("/hosts", get(list_hosts))
        // Lifecycle
        .route("/create", post(create_vm))
        .route("/start", post(start_vm))
        .route("/stop", post(stop_vm))
        .route("/pause", post(pause_vm))
        .route("/resume", post(resume_vm))
        .route("/restart", post(restart_vm))
        .route("/destroy", post(destroy_vm))
        .route("/console", post(open_console))
        // Snapshots & clones
        .route("/snapshot", post(create_snapshot))
        .route("/list_snapshots", post(list_snapshots))
        .route("/revert_snapshot", post(revert_snapshot))
        .route("/delete_snapshot", post(delete_snapshot))
        .route("/clone", post(clone_vm))
        // Migration
        .route("/migrate", post(migrate_vm));

    Router::new()
        .nest("/api", api_routes)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Query Handlers
// ============================================================================

/// GET /api/vms?uri= - List VMs with their state
async fn list_vms(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UriQuery>,
) -> ApiResult<VmListResponse> {
    let uri = state.uri(query.uri);
    let vms = state.dispatcher.list_vms(&uri).await.map_err(api_error)?;

    Ok(Json(VmListResponse {
        vms: vms
            .into_iter()
            .map(|vm| VmSummary {
                name: vm.name,
                state: vm.state,
            })
            .collect(),
    }))
}

/// POST /api/vm_info - Full VM record and the actions valid right now
async fn vm_info(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmRequest>, JsonRejection>,
) -> ApiResult<VmInfoResponse> {
    let (uri, name) = state.target(body(payload)?)?;
    let vm = state.dispatcher.vm_info(&uri, &name).await.map_err(api_error)?;
    let actions = state_machine::allowed_actions(vm.state);

    Ok(Json(VmInfoResponse { vm, actions }))
}

/// GET /api/iso - Install media filenames, sorted
async fn list_isos(State(state): State<Arc<AppState>>) -> ApiResult<Vec<String>> {
    match state.iso.list().await {
        Ok(isos) => Ok(Json(isos)),
        Err(e) => {
            error!(path = %state.iso.path().display(), error = %e, "Failed to list ISO files");
            Err(api_error(ControlError::Driver(format!(
                "cannot read ISO directory: {}",
                e
            ))))
        }
    }
}

/// GET /api/health?uri= - Reachability and driver identity of a hypervisor
async fn health(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UriQuery>,
) -> Json<HealthResponse> {
    let uri = state.uri(query.uri);
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let response = match state.dispatcher.health(&uri).await {
        Ok(caps) => HealthResponse {
            uri,
            hostname,
            reachable: true,
            driver: Some(DriverInfo {
                name: caps.name,
                version: caps.version,
                live_migration: caps.supports_live_migration,
                snapshots: caps.supports_snapshots,
            }),
            error: None,
        },
        Err(e) => HealthResponse {
            uri,
            hostname,
            reachable: false,
            driver: None,
            error: Some(e.to_string()),
        },
    };
    Json(response)
}

/// GET /api/hosts - URIs with an open session
async fn list_hosts(State(state): State<Arc<AppState>>) -> Json<HostsResponse> {
    Json(HostsResponse {
        hosts: state.dispatcher.connections().hosts().await,
    })
}

// ============================================================================
// Lifecycle Handlers
// ============================================================================

/// POST /api/create - Provision a new (inactive) VM
async fn create_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateRequest>, JsonRejection>,
) -> ApiResult<MessageResponse> {
    let req = body(payload)?;
    let uri = state.uri(req.uri);
    let spec = VmSpec {
        name: required("name", req.name)?,
        ram_mib: req.ram.ok_or_else(|| invalid("missing required field 'ram'"))?,
        vcpus: req.cpu.ok_or_else(|| invalid("missing required field 'cpu'"))?,
        disk_gib: req.disk.ok_or_else(|| invalid("missing required field 'disk'"))?,
        iso: req.iso,
        os_variant: req.osinfo,
    };

    let vm = state.dispatcher.create(&uri, spec).await.map_err(api_error)?;
    ok(format!(
        "VM '{}' created ({} MiB, {} vCPU, {} GiB)",
        vm.name, vm.memory_mib, vm.vcpus, vm.disk_gib
    ))
}

async fn lifecycle(
    state: &AppState,
    payload: Result<Json<VmRequest>, JsonRejection>,
    action: Action,
) -> ApiResult<MessageResponse> {
    let (uri, name) = state.target(body(payload)?)?;
    let message = state
        .dispatcher
        .execute(&uri, &name, action)
        .await
        .map_err(api_error)?;
    ok(message)
}

/// POST /api/start
async fn start_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmRequest>, JsonRejection>,
) -> ApiResult<MessageResponse> {
    lifecycle(&state, payload, Action::Start).await
}

/// POST /api/stop - Power off; succeeds as a no-op on an inactive VM
async fn stop_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmRequest>, JsonRejection>,
) -> ApiResult<MessageResponse> {
    lifecycle(&state, payload, Action::Stop).await
}

/// POST /api/pause
async fn pause_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmRequest>, JsonRejection>,
) -> ApiResult<MessageResponse> {
    lifecycle(&state, payload, Action::Pause).await
}

/// POST /api/resume
async fn resume_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmRequest>, JsonRejection>,
) -> ApiResult<MessageResponse> {
    lifecycle(&state, payload, Action::Resume).await
}

/// POST /api/restart
async fn restart_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmRequest>, JsonRejection>,
) -> ApiResult<MessageResponse> {
    lifecycle(&state, payload, Action::Restart).await
}

/// POST /api/destroy - Delete an inactive VM and its storage
async fn destroy_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmRequest>, JsonRejection>,
) -> ApiResult<MessageResponse> {
    lifecycle(&state, payload, Action::Delete).await
}

/// POST /api/console - Open a console session on the server
async fn open_console(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmRequest>, JsonRejection>,
) -> ApiResult<ConsoleResponse> {
    let (uri, name) = state.target(body(payload)?)?;
    let (message, console) = state
        .dispatcher
        .console(&uri, &name)
        .await
        .map_err(api_error)?;

    Ok(Json(ConsoleResponse {
        success: true,
        message,
        console,
    }))
}

// ============================================================================
// Snapshot & Clone Handlers
// ============================================================================

fn snapshot_target(
    state: &AppState,
    req: SnapshotRequest,
) -> Result<(String, String, String), ApiFailure> {
    let name = required("name", req.name)?;
    let snapshot = required("snapshot", req.snapshot)?;
    Ok((state.uri(req.uri), name, snapshot))
}

/// POST /api/snapshot
async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SnapshotRequest>, JsonRejection>,
) -> ApiResult<MessageResponse> {
    let (uri, name, snapshot) = snapshot_target(&state, body(payload)?)?;
    let info = state
        .snapshots
        .create(&uri, &name, &snapshot)
        .await
        .map_err(api_error)?;

    let what = match info.kind {
        virtpilot_hypervisor::SnapshotKind::DiskAndMemory => "disk and memory",
        virtpilot_hypervisor::SnapshotKind::DiskOnly => "disk",
    };
    ok(format!("Snapshot '{}' of VM '{}' created ({})", info.name, name, what))
}

/// POST /api/list_snapshots
async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmRequest>, JsonRejection>,
) -> ApiResult<SnapshotListResponse> {
    let (uri, name) = state.target(body(payload)?)?;
    let snapshots = state.snapshots.list(&uri, &name).await.map_err(api_error)?;

    Ok(Json(SnapshotListResponse {
        snapshots: snapshots.into_iter().map(|s| s.name).collect(),
    }))
}

/// POST /api/revert_snapshot
async fn revert_snapshot(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SnapshotRequest>, JsonRejection>,
) -> ApiResult<RevertResponse> {
    let (uri, name, snapshot) = snapshot_target(&state, body(payload)?)?;
    let vm_state = state
        .snapshots
        .revert(&uri, &name, &snapshot)
        .await
        .map_err(api_error)?;

    Ok(Json(RevertResponse {
        success: true,
        message: format!("VM '{}' reverted to snapshot '{}'", name, snapshot),
        state: vm_state,
    }))
}

/// POST /api/delete_snapshot
async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SnapshotRequest>, JsonRejection>,
) -> ApiResult<MessageResponse> {
    let (uri, name, snapshot) = snapshot_target(&state, body(payload)?)?;
    state
        .snapshots
        .delete(&uri, &name, &snapshot)
        .await
        .map_err(api_error)?;

    ok(format!("Snapshot '{}' of VM '{}' deleted", snapshot, name))
}

/// POST /api/clone
async fn clone_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CloneRequest>, JsonRejection>,
) -> ApiResult<MessageResponse> {
    let req = body(payload)?;
    let src = required("src", req.src)?;
    let dst = required("dst", req.dst)?;
    let uri = state.uri(req.uri);

    let vm = state
        .snapshots
        .clone_vm(&uri, &src, &dst)
        .await
        .map_err(api_error)?;

    ok(format!("VM '{}' cloned to '{}'", src, vm.name))
}

// ============================================================================
// Migration Handler
// ============================================================================

/// POST /api/migrate - Move a VM to another hypervisor URI
async fn migrate_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MigrateRequest>, JsonRejection>,
) -> ApiResult<MigrateResponse> {
    let req = body(payload)?;
    let uri = required("uri", req.uri)?;
    let name = required("name", req.name)?;
    let dest = required("dest", req.dest)?;

    match state.migration.migrate(&uri, &name, &dest).await {
        Ok(job) => Ok(Json(MigrateResponse {
            success: true,
            message: format!("VM '{}' migrated from {} to {}", name, uri, dest),
            job,
        })),
        Err(failure) => {
            let (status, Json(mut err)) = api_error(failure.error);
            err.job = Some(failure.job);
            Err((status, Json(err)))
        }
    }
}
