use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("capacity error: {0}")]
    Capacity(String),
    #[error("sensor fault: {0}")]
    Sensor(String),
    #[error("persistence fault: {0}")]
    Persistence(String),
    #[error("recovery inconsistency: {0}")]
    Recovery(String),
    #[error("gpio error: {0}")]
    Gpio(String),
    #[error("watch channel send failed")]
    WatchSend,
    #[error("state lock poisoned")]
    StateLock,
}

impl From<sled::Error> for AppError {
    fn from(err: sled::Error) -> Self {
        AppError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Persistence(err.to_string())
    }
}
