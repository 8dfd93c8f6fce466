use crate::api::ApiContext;
use crate::api::responses::{
    AdminAckResponse, BookErrorCode, BookErrorResponse, BookRequest, BookSuccessResponse,
    CancelErrorCode, CancelErrorResponse, CancelRequest, ConfigErrorCode, ConfigErrorResponse,
    ConfigResponse, HealthResponse, HealthStatus, MaintenanceRequest, QueuePositionResponse,
    QueueSuccessResponse, ReplaceErrorCode, ReplaceErrorResponse, ReplaceRequest,
    StatusErrorCode, StatusErrorResponse, StatusResponse,
};
use crate::config::Tunables;
use crate::orchestrator::{AdminAction, Trigger};
use crate::state::{AppState, SensorHealth, StatusSnapshot, SystemHealth};
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::error;

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

#[derive(Debug)]
enum TimestampError {
    Format(time::error::Format),
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampError::Format(err) => write!(f, "timestamp format error: {err}"),
        }
    }
}

fn format_timestamp(timestamp: SystemTime) -> Result<String, TimestampError> {
    let datetime = OffsetDateTime::from(timestamp);
    datetime.format(&Rfc3339).map_err(TimestampError::Format)
}

fn fallback_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

// Status

pub enum ApiStatusResponse {
    Success(StatusResponse),
    Error {
        status: StatusCode,
        body: StatusErrorResponse,
    },
}

impl IntoResponse for ApiStatusResponse {
    fn into_response(self) -> Response {
        match self {
            ApiStatusResponse::Success(body) => (StatusCode::OK, Json(body)).into_response(),
            ApiStatusResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn get_status(State(ctx): State<ApiContext>) -> impl IntoResponse {
    build_status_response(ctx.state)
}

fn build_status_response(state: Arc<RwLock<AppState>>) -> ApiStatusResponse {
    let snapshot = match state.read() {
        Ok(guard) => guard.status().clone(),
        Err(_) => return status_internal_error("state lock poisoned while reading status"),
    };

    match map_status(&snapshot) {
        Ok(body) => ApiStatusResponse::Success(body),
        Err(err) => status_internal_error(&err.to_string()),
    }
}

fn map_status(snapshot: &StatusSnapshot) -> Result<StatusResponse, TimestampError> {
    let occupation_start = snapshot
        .occupation_start
        .map(format_timestamp)
        .transpose()?;
    let pending_deadline = snapshot
        .pending_deadline
        .map(format_timestamp)
        .transpose()?;
    Ok(StatusResponse {
        state: snapshot.state,
        occupied_by: snapshot.occupied_by.clone(),
        occupation_start,
        pending_user: snapshot.pending_user.clone(),
        pending_deadline,
        queue: map_queue(snapshot),
        queue_size: snapshot.queue_size,
        next_user: snapshot.next_user.clone(),
        estimated_wait_minutes: snapshot.estimated_wait_minutes,
        timestamp: format_timestamp(snapshot.updated_at)?,
    })
}

fn map_queue(snapshot: &StatusSnapshot) -> Vec<QueuePositionResponse> {
    snapshot
        .queue
        .iter()
        .map(|position| QueuePositionResponse {
            position: position.position,
            user_id: position.user_id.clone(),
            wait_minutes: position.wait_minutes,
        })
        .collect()
}

fn status_internal_error(message: &str) -> ApiStatusResponse {
    error!(message = message, "Internal error while handling /api/status");
    ApiStatusResponse::Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: StatusErrorResponse {
            error_code: StatusErrorCode::InternalError,
            error_message: INTERNAL_ERROR_MESSAGE.to_string(),
            timestamp: fallback_timestamp(),
        },
    }
}

// Queue listing

pub enum QueueResponse {
    Success(QueueSuccessResponse),
    Error {
        status: StatusCode,
        body: StatusErrorResponse,
    },
}

impl IntoResponse for QueueResponse {
    fn into_response(self) -> Response {
        match self {
            QueueResponse::Success(body) => (StatusCode::OK, Json(body)).into_response(),
            QueueResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn get_queue(State(ctx): State<ApiContext>) -> impl IntoResponse {
    build_queue_response(ctx.state)
}

fn build_queue_response(state: Arc<RwLock<AppState>>) -> QueueResponse {
    let snapshot = match state.read() {
        Ok(guard) => guard.status().clone(),
        Err(_) => return queue_internal_error("state lock poisoned while reading queue"),
    };
    let timestamp = match format_timestamp(snapshot.updated_at) {
        Ok(timestamp) => timestamp,
        Err(err) => return queue_internal_error(&err.to_string()),
    };
    QueueResponse::Success(QueueSuccessResponse {
        queue: map_queue(&snapshot),
        queue_size: snapshot.queue_size,
        timestamp,
    })
}

fn queue_internal_error(message: &str) -> QueueResponse {
    error!(message = message, "Internal error while handling /api/queue");
    QueueResponse::Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: StatusErrorResponse {
            error_code: StatusErrorCode::InternalError,
            error_message: INTERNAL_ERROR_MESSAGE.to_string(),
            timestamp: fallback_timestamp(),
        },
    }
}

// Booking

pub enum BookResponse {
    Accepted(BookSuccessResponse),
    Error {
        status: StatusCode,
        body: BookErrorResponse,
    },
}

impl IntoResponse for BookResponse {
    fn into_response(self) -> Response {
        match self {
            BookResponse::Accepted(body) => (StatusCode::ACCEPTED, Json(body)).into_response(),
            BookResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn post_book(
    State(ctx): State<ApiContext>,
    Json(request): Json<BookRequest>,
) -> impl IntoResponse {
    let ack = match build_book_ack(ctx.state, &request.user_id, SystemTime::now()) {
        Ok(ack) => ack,
        Err(response) => return response,
    };
    if ctx
        .triggers
        .send(Trigger::Booking {
            user_id: request.user_id,
        })
        .is_err()
    {
        return book_internal_error("trigger channel closed");
    }
    BookResponse::Accepted(ack)
}

/// Synchronous validation ack. The orchestrator re-checks on its own tick;
/// this is the fast rejection path the transport contract promises.
fn build_book_ack(
    state: Arc<RwLock<AppState>>,
    user_id: &str,
    now: SystemTime,
) -> Result<BookSuccessResponse, BookResponse> {
    if !valid_user_id(user_id) {
        return Err(book_error(
            StatusCode::BAD_REQUEST,
            BookErrorCode::InvalidUser,
            "user id must be 1-64 chars of [A-Za-z0-9_-]",
        ));
    }

    let (snapshot, tunables) = match state.read() {
        Ok(guard) => (guard.status().clone(), guard.tunables().clone()),
        Err(_) => return Err(book_internal_error("state lock poisoned while booking")),
    };

    match snapshot.state {
        crate::state::OccupancyState::SystemError => {
            return Err(book_error(
                StatusCode::SERVICE_UNAVAILABLE,
                BookErrorCode::SystemError,
                "system is in error state",
            ));
        }
        crate::state::OccupancyState::Maintenance => {
            return Err(book_error(
                StatusCode::SERVICE_UNAVAILABLE,
                BookErrorCode::Maintenance,
                "system is in maintenance",
            ));
        }
        _ => {}
    }

    if user_in_queue(&snapshot, user_id) {
        return Err(book_error(
            StatusCode::CONFLICT,
            BookErrorCode::DuplicateUser,
            "user already holds a queue slot",
        ));
    }
    if snapshot.queue_size >= tunables.max_queue_size {
        return Err(book_error(
            StatusCode::CONFLICT,
            BookErrorCode::QueueFull,
            "queue is full",
        ));
    }

    let position = snapshot.queue_size + 1;
    let estimated_wait_minutes = snapshot.estimated_wait_minutes
        + snapshot.queue_size * tunables.max_occupancy_minutes;
    let timestamp = format_timestamp(now)
        .map_err(|err| book_internal_error(&err.to_string()))?;
    Ok(BookSuccessResponse {
        position,
        estimated_wait_minutes,
        timestamp,
    })
}

fn user_in_queue(snapshot: &StatusSnapshot, user_id: &str) -> bool {
    snapshot.pending_user.as_deref() == Some(user_id)
        || snapshot.queue.iter().any(|p| p.user_id == user_id)
}

fn valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && user_id.len() <= 64
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn book_error(status: StatusCode, error_code: BookErrorCode, message: &str) -> BookResponse {
    BookResponse::Error {
        status,
        body: BookErrorResponse {
            error_code,
            error_message: message.to_string(),
            timestamp: fallback_timestamp(),
        },
    }
}

fn book_internal_error(message: &str) -> BookResponse {
    error!(message = message, "Internal error while handling /api/book");
    book_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        BookErrorCode::InternalError,
        INTERNAL_ERROR_MESSAGE,
    )
}

// Cancel

pub enum CancelResponse {
    Accepted(AdminAckResponse),
    Error {
        status: StatusCode,
        body: CancelErrorResponse,
    },
}

impl IntoResponse for CancelResponse {
    fn into_response(self) -> Response {
        match self {
            CancelResponse::Accepted(body) => (StatusCode::ACCEPTED, Json(body)).into_response(),
            CancelResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn post_cancel(
    State(ctx): State<ApiContext>,
    Json(request): Json<CancelRequest>,
) -> impl IntoResponse {
    let snapshot = match ctx.state.read() {
        Ok(guard) => guard.status().clone(),
        Err(_) => return cancel_internal_error("state lock poisoned while cancelling"),
    };
    if !user_in_queue(&snapshot, &request.user_id) {
        return CancelResponse::Error {
            status: StatusCode::NOT_FOUND,
            body: CancelErrorResponse {
                error_code: CancelErrorCode::NotInQueue,
                error_message: "user has no open queue entry".to_string(),
                timestamp: fallback_timestamp(),
            },
        };
    }
    if ctx
        .triggers
        .send(Trigger::CancelBooking {
            user_id: request.user_id,
        })
        .is_err()
    {
        return cancel_internal_error("trigger channel closed");
    }
    CancelResponse::Accepted(AdminAckResponse {
        accepted: true,
        timestamp: fallback_timestamp(),
    })
}

fn cancel_internal_error(message: &str) -> CancelResponse {
    error!(message = message, "Internal error while handling /api/cancel");
    CancelResponse::Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: CancelErrorResponse {
            error_code: CancelErrorCode::InternalError,
            error_message: INTERNAL_ERROR_MESSAGE.to_string(),
            timestamp: fallback_timestamp(),
        },
    }
}

// Replace

pub enum ReplaceResponse {
    Accepted(AdminAckResponse),
    Error {
        status: StatusCode,
        body: ReplaceErrorResponse,
    },
}

impl IntoResponse for ReplaceResponse {
    fn into_response(self) -> Response {
        match self {
            ReplaceResponse::Accepted(body) => (StatusCode::ACCEPTED, Json(body)).into_response(),
            ReplaceResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn post_replace(
    State(ctx): State<ApiContext>,
    Json(request): Json<ReplaceRequest>,
) -> impl IntoResponse {
    if let Err(response) = validate_replace(&ctx.state, &request) {
        return response;
    }
    if ctx
        .triggers
        .send(Trigger::ReplaceBooking {
            user_id: request.user_id,
            new_user_id: request.new_user_id,
        })
        .is_err()
    {
        return replace_internal_error("trigger channel closed");
    }
    ReplaceResponse::Accepted(AdminAckResponse {
        accepted: true,
        timestamp: fallback_timestamp(),
    })
}

fn validate_replace(
    state: &Arc<RwLock<AppState>>,
    request: &ReplaceRequest,
) -> Result<(), ReplaceResponse> {
    if !valid_user_id(&request.new_user_id) {
        return Err(replace_error(
            StatusCode::BAD_REQUEST,
            ReplaceErrorCode::InvalidUser,
            "new user id must be 1-64 chars of [A-Za-z0-9_-]",
        ));
    }
    let snapshot = match state.read() {
        Ok(guard) => guard.status().clone(),
        Err(_) => return Err(replace_internal_error("state lock poisoned while replacing")),
    };
    if !user_in_queue(&snapshot, &request.user_id) {
        return Err(replace_error(
            StatusCode::NOT_FOUND,
            ReplaceErrorCode::NotInQueue,
            "user has no open queue entry",
        ));
    }
    if user_in_queue(&snapshot, &request.new_user_id) {
        return Err(replace_error(
            StatusCode::CONFLICT,
            ReplaceErrorCode::DuplicateUser,
            "new user already holds a queue slot",
        ));
    }
    Ok(())
}

fn replace_error(
    status: StatusCode,
    error_code: ReplaceErrorCode,
    message: &str,
) -> ReplaceResponse {
    ReplaceResponse::Error {
        status,
        body: ReplaceErrorResponse {
            error_code,
            error_message: message.to_string(),
            timestamp: fallback_timestamp(),
        },
    }
}

fn replace_internal_error(message: &str) -> ReplaceResponse {
    error!(message = message, "Internal error while handling /api/replace");
    replace_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        ReplaceErrorCode::InternalError,
        INTERNAL_ERROR_MESSAGE,
    )
}

// Health

pub async fn get_health(State(ctx): State<ApiContext>) -> impl IntoResponse {
    build_health_response(ctx.state, SystemTime::now())
}

fn build_health_response(
    state: Arc<RwLock<AppState>>,
    now: SystemTime,
) -> (StatusCode, Json<HealthResponse>) {
    let health = match state.read() {
        Ok(guard) => guard.health().clone(),
        Err(_) => SystemHealth {
            pir: SensorHealth::Error {
                message: "state lock poisoned".to_string(),
            },
            ultrasonic: SensorHealth::Error {
                message: "state lock poisoned".to_string(),
            },
            storage_ok: false,
        },
    };

    let status = derive_health_status(&health);
    let status_code = match status {
        HealthStatus::Ko => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
    };
    let timestamp = format_timestamp(now).unwrap_or_else(|_| fallback_timestamp());

    (status_code, Json(HealthResponse { status, timestamp }))
}

fn derive_health_status(health: &SystemHealth) -> HealthStatus {
    if !health.storage_ok {
        return HealthStatus::Ko;
    }

    let mut working = 0;
    let mut failed = 0;
    for sensor in [&health.pir, &health.ultrasonic] {
        match sensor {
            SensorHealth::Ok => working += 1,
            SensorHealth::Error { .. } => failed += 1,
            SensorHealth::Disabled => {}
        }
    }

    match (working, failed) {
        (0, _) => HealthStatus::Ko,
        (_, 0) => HealthStatus::Ok,
        _ => HealthStatus::Degraded,
    }
}

// Admin

pub enum AdminResponse {
    Accepted(AdminAckResponse),
    Error {
        status: StatusCode,
        body: ConfigErrorResponse,
    },
}

impl IntoResponse for AdminResponse {
    fn into_response(self) -> Response {
        match self {
            AdminResponse::Accepted(body) => (StatusCode::ACCEPTED, Json(body)).into_response(),
            AdminResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn post_force_unlock(State(ctx): State<ApiContext>) -> impl IntoResponse {
    send_admin(&ctx, AdminAction::ForceUnlock)
}

pub async fn post_reset(State(ctx): State<ApiContext>) -> impl IntoResponse {
    send_admin(&ctx, AdminAction::Reset)
}

pub async fn post_clear_queue(State(ctx): State<ApiContext>) -> impl IntoResponse {
    send_admin(&ctx, AdminAction::ClearQueue)
}

pub async fn post_maintenance(
    State(ctx): State<ApiContext>,
    Json(request): Json<MaintenanceRequest>,
) -> impl IntoResponse {
    let action = if request.enter {
        AdminAction::EnterMaintenance
    } else {
        AdminAction::ExitMaintenance
    };
    send_admin(&ctx, action)
}

fn send_admin(ctx: &ApiContext, action: AdminAction) -> AdminResponse {
    if ctx.triggers.send(Trigger::Admin(action)).is_err() {
        return admin_internal_error("trigger channel closed");
    }
    AdminResponse::Accepted(AdminAckResponse {
        accepted: true,
        timestamp: fallback_timestamp(),
    })
}

fn admin_internal_error(message: &str) -> AdminResponse {
    error!(message = message, "Internal error while handling admin action");
    AdminResponse::Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ConfigErrorResponse {
            error_code: ConfigErrorCode::InternalError,
            error_message: INTERNAL_ERROR_MESSAGE.to_string(),
            timestamp: fallback_timestamp(),
        },
    }
}

// Config

pub async fn get_config(State(ctx): State<ApiContext>) -> impl IntoResponse {
    match ctx.state.read() {
        Ok(guard) => (
            StatusCode::OK,
            Json(ConfigResponse {
                tunables: guard.tunables().clone(),
                timestamp: fallback_timestamp(),
            }),
        )
            .into_response(),
        Err(_) => admin_internal_error("state lock poisoned while reading config").into_response(),
    }
}

pub async fn post_config(
    State(ctx): State<ApiContext>,
    Json(tunables): Json<Tunables>,
) -> impl IntoResponse {
    if let Err(e) = tunables.validate() {
        return AdminResponse::Error {
            status: StatusCode::BAD_REQUEST,
            body: ConfigErrorResponse {
                error_code: ConfigErrorCode::InvalidConfig,
                error_message: e.to_string(),
                timestamp: fallback_timestamp(),
            },
        };
    }
    send_admin(&ctx, AdminAction::UpdateTunables(tunables))
}
