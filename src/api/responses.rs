use crate::config::Tunables;
use crate::state::OccupancyState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct BookRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReplaceRequest {
    pub user_id: String,
    pub new_user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    pub enter: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct StatusResponse {
    pub state: OccupancyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupied_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupation_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_deadline: Option<String>,
    pub queue: Vec<QueuePositionResponse>,
    pub queue_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_user: Option<String>,
    pub estimated_wait_minutes: u32,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct QueuePositionResponse {
    pub position: u32,
    pub user_id: String,
    pub wait_minutes: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct StatusErrorResponse {
    pub error_code: StatusErrorCode,
    pub error_message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusErrorCode {
    InternalError,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct QueueSuccessResponse {
    pub queue: Vec<QueuePositionResponse>,
    pub queue_size: u32,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct BookSuccessResponse {
    pub position: u32,
    pub estimated_wait_minutes: u32,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct BookErrorResponse {
    pub error_code: BookErrorCode,
    pub error_message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookErrorCode {
    InvalidUser,
    DuplicateUser,
    QueueFull,
    SystemError,
    Maintenance,
    InternalError,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct CancelErrorResponse {
    pub error_code: CancelErrorCode,
    pub error_message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelErrorCode {
    NotInQueue,
    InternalError,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ReplaceErrorResponse {
    pub error_code: ReplaceErrorCode,
    pub error_message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplaceErrorCode {
    NotInQueue,
    DuplicateUser,
    InvalidUser,
    InternalError,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Ko,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct AdminAckResponse {
    pub accepted: bool,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ConfigResponse {
    pub tunables: Tunables,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ConfigErrorResponse {
    pub error_code: ConfigErrorCode,
    pub error_message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigErrorCode {
    InvalidConfig,
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_response_omits_absent_optionals() {
        let response = StatusResponse {
            state: OccupancyState::Free,
            occupied_by: None,
            occupation_start: None,
            pending_user: None,
            pending_deadline: None,
            queue: Vec::new(),
            queue_size: 0,
            next_user: None,
            estimated_wait_minutes: 0,
            timestamp: "2026-02-01T10:00:00Z".to_string(),
        };

        let value = serde_json::to_value(response).expect("serialize status response");
        assert_eq!(
            value,
            json!({
                "state": "FREE",
                "queue": [],
                "queue_size": 0,
                "estimated_wait_minutes": 0,
                "timestamp": "2026-02-01T10:00:00Z"
            })
        );
    }

    #[test]
    fn book_error_uses_screaming_snake_case_code() {
        let response = BookErrorResponse {
            error_code: BookErrorCode::DuplicateUser,
            error_message: "already queued".to_string(),
            timestamp: "2026-02-01T10:01:00Z".to_string(),
        };

        let value = serde_json::to_value(response).expect("serialize book error");
        assert_eq!(
            value,
            json!({
                "error_code": "DUPLICATE_USER",
                "error_message": "already queued",
                "timestamp": "2026-02-01T10:01:00Z"
            })
        );
    }

    #[test]
    fn health_response_serializes_status_lowercase() {
        let response = HealthResponse {
            status: HealthStatus::Degraded,
            timestamp: "2026-02-01T10:02:00Z".to_string(),
        };

        let value = serde_json::to_value(response).expect("serialize health response");
        assert_eq!(
            value,
            json!({
                "status": "degraded",
                "timestamp": "2026-02-01T10:02:00Z"
            })
        );
    }

    #[test]
    fn queue_response_lists_positions_in_order() {
        let response = QueueSuccessResponse {
            queue: vec![
                QueuePositionResponse {
                    position: 1,
                    user_id: "USER_001".to_string(),
                    wait_minutes: 5,
                },
                QueuePositionResponse {
                    position: 2,
                    user_id: "USER_002".to_string(),
                    wait_minutes: 15,
                },
            ],
            queue_size: 2,
            timestamp: "2026-02-01T10:03:00Z".to_string(),
        };

        let value = serde_json::to_value(response).expect("serialize queue response");
        assert_eq!(
            value,
            json!({
                "queue": [
                    {"position": 1, "user_id": "USER_001", "wait_minutes": 5},
                    {"position": 2, "user_id": "USER_002", "wait_minutes": 15}
                ],
                "queue_size": 2,
                "timestamp": "2026-02-01T10:03:00Z"
            })
        );
    }
}
