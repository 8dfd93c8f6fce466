//! Typed notification events. The orchestrator emits these; a dispatcher
//! thread hands them to whatever `Notifier` the deployment wires in.
//! Delivery failure is logged and absorbed, never fed back into the state
//! machine.

use crate::error::AppError;
use serde::Serialize;
use std::sync::mpsc::Receiver;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    ReservationConfirmed {
        user_id: String,
        position: u32,
        wait_minutes: u32,
    },
    YourTurn {
        user_id: String,
        timeout_minutes: u32,
    },
    NoShow {
        user_id: String,
    },
    QueueCleared,
    SystemError,
    TimeoutWarning {
        user_id: Option<String>,
    },
}

pub trait Notifier: Send {
    fn deliver(&self, notification: &Notification) -> Result<(), AppError>;
}

/// Default sink: structured log lines only.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn deliver(&self, notification: &Notification) -> Result<(), AppError> {
        match notification {
            Notification::ReservationConfirmed {
                user_id,
                position,
                wait_minutes,
            } => info!(
                user = %user_id,
                position = position,
                wait_minutes = wait_minutes,
                "Reservation confirmed"
            ),
            Notification::YourTurn {
                user_id,
                timeout_minutes,
            } => info!(
                user = %user_id,
                timeout_minutes = timeout_minutes,
                "Your turn"
            ),
            Notification::NoShow { user_id } => info!(user = %user_id, "Reservation expired"),
            Notification::QueueCleared => info!("Queue cleared"),
            Notification::SystemError => warn!("System error notification"),
            Notification::TimeoutWarning { user_id } => info!(
                user = user_id.as_deref().unwrap_or("-"),
                "Occupancy time exceeded"
            ),
        }
        Ok(())
    }
}

/// Drain `rx` until all senders hang up, delivering each notification.
pub fn spawn_dispatcher(
    rx: Receiver<Notification>,
    notifier: Box<dyn Notifier>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for notification in rx {
            if let Err(e) = notifier.deliver(&notification) {
                warn!(error = %e, ?notification, "Notification delivery failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    struct RecordingNotifier {
        delivered: Arc<Mutex<Vec<Notification>>>,
        fail: bool,
    }

    impl Notifier for RecordingNotifier {
        fn deliver(&self, notification: &Notification) -> Result<(), AppError> {
            if self.fail {
                return Err(AppError::Validation("delivery refused".to_string()));
            }
            self.delivered
                .lock()
                .map_err(|_| AppError::StateLock)?
                .push(notification.clone());
            Ok(())
        }
    }

    #[test]
    fn dispatcher_delivers_in_order() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let handle = spawn_dispatcher(
            rx,
            Box::new(RecordingNotifier {
                delivered: Arc::clone(&delivered),
                fail: false,
            }),
        );

        tx.send(Notification::QueueCleared).expect("send");
        tx.send(Notification::NoShow {
            user_id: "USER_001".to_string(),
        })
        .expect("send");
        drop(tx);
        handle.join().expect("dispatcher thread");

        let seen = delivered.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Notification::QueueCleared);
    }

    #[test]
    fn delivery_failure_does_not_stop_the_dispatcher() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let handle = spawn_dispatcher(
            rx,
            Box::new(RecordingNotifier {
                delivered: Arc::clone(&delivered),
                fail: true,
            }),
        );

        tx.send(Notification::SystemError).expect("send");
        tx.send(Notification::QueueCleared).expect("send");
        drop(tx);

        handle.join().expect("dispatcher thread survives failures");
    }

    #[test]
    fn notification_serializes_with_type_tag() {
        let value = serde_json::to_value(Notification::YourTurn {
            user_id: "USER_003".to_string(),
            timeout_minutes: 3,
        })
        .expect("serialize notification");

        assert_eq!(
            value,
            serde_json::json!({
                "type": "your_turn",
                "user_id": "USER_003",
                "timeout_minutes": 3
            })
        );
    }
}
