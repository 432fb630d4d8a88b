//! REST API Server for managing sandboxes
//!
//! Thin mapping of HTTP requests onto a single [`SandboxRegistry`].
//!
//! ## Endpoints
//!
//! POST /api/v1/sandboxes - Create sandbox
//! GET /api/v1/sandboxes - List sandboxes
//! POST /api/v1/sandboxes/{id}/execute - Run a target to completion
//! GET /api/v1/sandboxes/{id}/report - Current report
//! POST /api/v1/sandboxes/{id}/stop - Stop sandbox
//! DELETE /api/v1/sandboxes/{id} - Stop and forget sandbox
//! POST /api/v1/quarantine - Quarantine a file

use actix_web::http::StatusCode;
use actix_web::{App, HttpResponse, HttpServer, Responder, web};
use log::{info, warn};
use safebox::{ExecutionPolicy, ManagerConfig, SandboxError, SandboxRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let bind = std::env::var("SAFEBOX_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let state = web::Data::new(AppState::new(SandboxRegistry::new(ManagerConfig::from_env())));

    info!("SafeBox API server starting on http://{}", bind);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api/v1")
                    .route("/sandboxes", web::post().to(create_sandbox))
                    .route("/sandboxes", web::get().to(list_sandboxes))
                    .route("/sandboxes/{id}", web::delete().to(delete_sandbox))
                    .route("/sandboxes/{id}/execute", web::post().to(execute_sandbox))
                    .route("/sandboxes/{id}/report", web::get().to(get_report))
                    .route("/sandboxes/{id}/stop", web::post().to(stop_sandbox))
                    .route("/quarantine", web::post().to(quarantine_file)),
            )
    })
    .bind(bind)?
    .run()
    .await
}

// ============ API Types ============

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    /// Sandbox ID (generated when absent)
    pub id: Option<String>,
    /// CPU ceiling in percent
    pub max_cpu_percent: Option<f64>,
    /// Memory ceiling (e.g., "256M", "1G")
    pub memory_limit: Option<String>,
    /// Timeout in seconds
    pub timeout: Option<u64>,
    /// Descendant process ceiling
    pub max_processes: Option<u32>,
    pub network_enabled: Option<bool>,
    pub file_access_allowed: Option<bool>,
    /// Kill on first anomaly
    pub strict: Option<bool>,
}

impl CreateSandboxRequest {
    fn policy(&self) -> safebox::Result<ExecutionPolicy> {
        let mut builder = ExecutionPolicy::builder();
        if let Some(cpu) = self.max_cpu_percent {
            builder = builder.max_cpu_percent(cpu);
        }
        if let Some(mem) = &self.memory_limit {
            builder = builder.max_memory_str(mem)?;
        }
        if let Some(timeout) = self.timeout {
            builder = builder.max_duration_seconds(timeout);
        }
        if let Some(max) = self.max_processes {
            builder = builder.max_processes(max);
        }
        if let Some(enabled) = self.network_enabled {
            builder = builder.network_enabled(enabled);
        }
        if let Some(allowed) = self.file_access_allowed {
            builder = builder.file_access_allowed(allowed);
        }
        if let Some(strict) = self.strict {
            builder = builder.strict(strict);
        }
        builder.build()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Program to run
    pub program: String,
    /// Arguments
    pub args: Option<Vec<String>>,
    /// Extra environment variables
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuarantineRequest {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    fn error(message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

// ============ Application State ============

pub struct AppState {
    registry: Arc<SandboxRegistry>,
}

impl AppState {
    fn new(registry: SandboxRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

fn status_for(err: &SandboxError) -> StatusCode {
    if err.is_refusal() {
        return match err {
            SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
            SandboxError::PolicyRejected(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::CONFLICT,
        };
    }
    match err {
        SandboxError::InvalidConfig(_) | SandboxError::Launch { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &SandboxError) -> HttpResponse {
    let status = status_for(err);
    if status.is_server_error() {
        warn!("Request failed: {}", err);
    }
    HttpResponse::build(status).json(ApiResponse::<()>::error(err.to_string()))
}

fn blocking_failed(err: impl std::fmt::Display) -> HttpResponse {
    HttpResponse::InternalServerError().json(ApiResponse::<()>::error(format!(
        "Worker failed: {}",
        err
    )))
}

// ============ Handlers ============

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "safebox",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Create sandbox
async fn create_sandbox(
    req: web::Json<CreateSandboxRequest>,
    state: web::Data<AppState>,
) -> impl Responder {
    let policy = match req.policy() {
        Ok(policy) => policy,
        Err(e) => return error_response(&e),
    };

    let created = match &req.id {
        Some(id) => state.registry.create_with_id(id, policy),
        None => state.registry.create(policy),
    };

    match created {
        Ok(id) => HttpResponse::Created().json(ApiResponse::ok(
            "Sandbox created successfully",
            serde_json::json!({ "id": id }),
        )),
        Err(e) => error_response(&e),
    }
}

/// List sandboxes
async fn list_sandboxes(state: web::Data<AppState>) -> impl Responder {
    let summaries = state.registry.list();
    HttpResponse::Ok().json(ApiResponse::ok(
        format!("Found {} sandboxes", summaries.len()),
        summaries,
    ))
}

/// Run a target to completion; the poll loop runs on the blocking pool
async fn execute_sandbox(
    id: web::Path<String>,
    req: web::Json<ExecuteRequest>,
    state: web::Data<AppState>,
) -> impl Responder {
    let registry = Arc::clone(&state.registry);
    let req = req.into_inner();
    let id = id.into_inner();
    let env: Vec<(String, String)> = req.env.unwrap_or_default().into_iter().collect();
    let args = req.args.unwrap_or_default();

    let result =
        web::block(move || registry.execute_with_env(&id, &req.program, &args, &env)).await;
    match result {
        Ok(Ok(report)) => HttpResponse::Ok().json(ApiResponse::ok(
            format!("Sandbox {} finished", report.sandbox_id),
            report,
        )),
        Ok(Err(e)) => error_response(&e),
        Err(e) => blocking_failed(e),
    }
}

/// Current report of a sandbox
async fn get_report(id: web::Path<String>, state: web::Data<AppState>) -> impl Responder {
    match state.registry.get_report(&id) {
        Ok(report) => HttpResponse::Ok().json(ApiResponse::ok("Report", report)),
        Err(e) => error_response(&e),
    }
}

/// Stop sandbox; waits for the process tree to be gone
async fn stop_sandbox(id: web::Path<String>, state: web::Data<AppState>) -> impl Responder {
    let registry = Arc::clone(&state.registry);
    let id = id.into_inner();
    let target = id.clone();

    match web::block(move || registry.stop(&target)).await {
        Ok(Ok(())) => HttpResponse::Ok().json(ApiResponse::ok(
            format!("Sandbox stopped: {}", id),
            serde_json::json!({ "id": id }),
        )),
        Ok(Err(e)) => error_response(&e),
        Err(e) => blocking_failed(e),
    }
}

/// Delete sandbox
async fn delete_sandbox(id: web::Path<String>, state: web::Data<AppState>) -> impl Responder {
    let registry = Arc::clone(&state.registry);
    let id = id.into_inner();
    let target = id.clone();

    match web::block(move || registry.remove(&target)).await {
        Ok(Ok(())) => HttpResponse::Ok().json(ApiResponse::ok(
            format!("Sandbox deleted: {}", id),
            serde_json::json!({ "id": id }),
        )),
        Ok(Err(e)) => error_response(&e),
        Err(e) => blocking_failed(e),
    }
}

/// Quarantine a file
async fn quarantine_file(
    req: web::Json<QuarantineRequest>,
    state: web::Data<AppState>,
) -> impl Responder {
    match state.registry.quarantine(&req.path, &req.reason) {
        Ok(path) => HttpResponse::Ok().json(ApiResponse::ok(
            "File quarantined",
            serde_json::json!({ "quarantine_path": path }),
        )),
        Err(e) => error_response(&e),
    }
}
