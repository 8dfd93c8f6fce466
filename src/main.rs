use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use ufficio_flow::{api, config, events, fusion, notify, orchestrator, queue, recovery, sensor,
    state, store};

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt().with_target(false).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    tracing::info!(
        config_path = config::DEFAULT_CONFIG_PATH,
        "ufficio-flow starting"
    );
    let config = config::load_default()?;

    // An unopenable database is the one failure allowed to block startup
    let store = store::Store::open(config.storage_path())?;
    let queue = queue::QueueStore::open(store.db())?;
    let events = events::EventLog::open(store.db())?;

    // A persisted admin override beats the file snapshot
    let tunables = match store.load_tunables()? {
        Some(tunables) => {
            tracing::info!("Using persisted tunables override");
            tunables
        }
        None => config.tunables.clone(),
    };
    tunables.validate()?;

    let mut rig = build_rig(&config);
    if !rig.has_any_sensor() {
        tracing::warn!("No sensors available - fusion will report unknown presence");
    }
    let mut fusion_state = fusion::SensorFusion::new();

    // Recovery needs to observe sustained absence only when the persisted
    // state claims the room is occupied
    let fusion_config = fusion::FusionConfig {
        mode: tunables.fusion_mode,
        presence_threshold_cm: tunables.presence_threshold_cm,
        movement_timeout: tunables.movement_timeout(),
    };
    let observe_window = match store.load_system_state() {
        Ok(Some(persisted)) if persisted.occupancy.is_occupied() => tunables.pir_absence(),
        _ => Duration::ZERO,
    };
    let signal = recovery::observe(
        &mut rig,
        &mut fusion_state,
        &fusion_config,
        observe_window,
        config.poll_interval(),
    );
    let now = SystemTime::now();
    let initial = recovery::recover(&store, &queue, &events, &signal, &tunables, now)?;
    tracing::info!(state = ?initial.occupancy, "Recovery complete");

    let orchestrator = orchestrator::Orchestrator::new(
        initial,
        tunables.clone(),
        queue,
        events,
        store,
        now,
    );

    let app_state = Arc::new(RwLock::new(state::AppState::new(tunables)));
    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::unbounded_channel();
    let (notification_tx, notification_rx) = std::sync::mpsc::channel();
    let _dispatcher = notify::spawn_dispatcher(notification_rx, Box::new(notify::LogNotifier));

    let stop = Arc::new(AtomicBool::new(false));
    let _poll_handle = orchestrator::spawn_poll_thread(
        orchestrator,
        rig,
        fusion_state,
        Arc::clone(&app_state),
        trigger_rx,
        notification_tx,
        Arc::clone(&stop),
        config.poll_interval(),
    );

    let app = api::router(api::ApiContext {
        state: Arc::clone(&app_state),
        triggers: trigger_tx,
    });
    let port = config.server_port();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app).await?;

    // Signal the polling thread to stop
    stop.store(true, std::sync::atomic::Ordering::Relaxed);

    Ok(())
}

fn build_rig(config: &config::Config) -> sensor::SensorRig {
    let sensors = config.sensors();

    #[cfg(target_os = "linux")]
    {
        use ufficio_flow::sensor::gpio::{HcSr04Sensor, PirSensor, PushButton};

        let motion: Option<Box<dyn sensor::MotionSensor + Send>> = if sensors.use_pir {
            match sensors.pir_pin {
                Some(pin) => match PirSensor::new(pin) {
                    Ok(pir) => {
                        tracing::info!(pin = pin, "PIR sensor ready");
                        Some(Box::new(pir))
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Failed to initialize PIR sensor");
                        None
                    }
                },
                None => {
                    tracing::warn!("PIR enabled but no pin configured");
                    None
                }
            }
        } else {
            None
        };

        let range: Option<Box<dyn sensor::RangeSensor + Send>> = if sensors.use_ultrasonic {
            match (sensors.trig_pin, sensors.echo_pin) {
                (Some(trig), Some(echo)) => match HcSr04Sensor::new(trig, echo) {
                    Ok(ultrasonic) => {
                        tracing::info!(trig = trig, echo = echo, "Ultrasonic sensor ready");
                        Some(Box::new(ultrasonic))
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Failed to initialize ultrasonic sensor");
                        None
                    }
                },
                _ => {
                    tracing::warn!("Ultrasonic enabled but trig/echo pins not configured");
                    None
                }
            }
        } else {
            None
        };

        let button: Option<Box<dyn sensor::ButtonInput + Send>> = match sensors.button_pin {
            Some(pin) => match PushButton::new(pin) {
                Ok(button) => {
                    tracing::info!(pin = pin, "Direct-access button ready");
                    Some(Box::new(button))
                }
                Err(err) => {
                    tracing::error!(error = %err, "Failed to initialize button");
                    None
                }
            },
            None => None,
        };

        sensor::SensorRig::new(motion, range, button)
    }

    #[cfg(not(target_os = "linux"))]
    {
        use ufficio_flow::sensor::mock::{MockMotionSensor, MockRangeSensor};

        let _ = sensors;
        tracing::warn!("GPIO sensors require Linux/Raspberry Pi - using mock sensors");
        sensor::SensorRig::new(
            Some(Box::new(MockMotionSensor::with_motion(false))),
            Some(Box::new(MockRangeSensor::with_distance(
                sensor::MAX_RANGE_CM,
            ))),
            None,
        )
    }
}
