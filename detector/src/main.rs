use motion_watch_alerts::{AlertDb, TelegramBot};
use motion_watch_capture::open_source;
use motion_watch_common::config::Config;
use motion_watch_detector::pipeline::{MotionPipeline, PipelineConfig, PipelineError};
use motion_watch_detector::preview::PreviewDisplay;
use motion_watch_detector::trigger::{AuditTrigger, NullTrigger, TelegramTrigger, Trigger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How long a closed pipeline gets to finish its current alert.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        camera = config.camera.url,
        mode = config.camera.mode,
        max_window = config.detection.max_window,
        batch_size = config.detection.batch_size,
        alert_threshold = config.detection.alert_threshold,
        telegram = config.telegram.api_key.is_some(),
        "starting motion-watch"
    );

    let db = match AlertDb::open(std::path::Path::new(&config.database.path)) {
        Ok(d) => {
            info!(path = config.database.path, "SQLite alert DB opened");
            Arc::new(d)
        }
        Err(e) => {
            error!(error = %e, path = config.database.path, "failed to open alert DB");
            std::process::exit(1);
        }
    };
    for admin in &config.telegram.admins {
        match db.set_admin(admin, true) {
            Ok(true) => info!(telegram_id = admin, "admin flag set"),
            Ok(false) => info!(telegram_id = admin, "admin not registered yet"),
            Err(e) => warn!(error = %e, telegram_id = admin, "failed to set admin flag"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trigger = build_trigger(&config, &db, shutdown_rx);

    run_supervisor(&config, trigger).await;

    let _ = shutdown_tx.send(true);
    info!("motion-watch stopped");
}

/// Wire up alert delivery, starting the Telegram registration loop when a bot
/// token is configured.
fn build_trigger(
    config: &Config,
    db: &Arc<AlertDb>,
    shutdown: watch::Receiver<bool>,
) -> Option<Arc<dyn Trigger>> {
    let audit = config.database.audit_alerts;

    let Some(token) = config.telegram.api_key.as_deref() else {
        warn!("telegram.api_key not set; motion alerts will not be delivered");
        return audit.then(|| {
            Arc::new(AuditTrigger::new(NullTrigger, Arc::clone(db))) as Arc<dyn Trigger>
        });
    };

    let bot = Arc::new(
        TelegramBot::new(
            token,
            Arc::clone(db),
            Duration::from_secs(config.telegram.poll_timeout_secs),
        )
        .with_admins(config.telegram.admins.iter().cloned()),
    );

    let registration = Arc::clone(&bot);
    tokio::spawn(async move {
        registration.run_registration_loop(shutdown).await;
    });

    let telegram = TelegramTrigger::new(bot);
    let trigger: Arc<dyn Trigger> = if audit {
        Arc::new(AuditTrigger::new(telegram, Arc::clone(db)))
    } else {
        Arc::new(telegram)
    };
    Some(trigger)
}

/// Run the pipeline until Ctrl-C, reopening the camera with exponential
/// backoff whenever capture fails.
async fn run_supervisor(config: &Config, trigger: Option<Arc<dyn Trigger>>) {
    let initial_backoff = Duration::from_secs(config.restart.initial_backoff_secs);
    let max_backoff = Duration::from_secs(config.restart.max_backoff_secs);
    let mut backoff = initial_backoff;

    loop {
        let started = Instant::now();
        match run_once(config, trigger.clone()).await {
            Ok(Outcome::Shutdown) => break,
            Ok(Outcome::Stopped) => {
                info!("pipeline stopped");
                break;
            }
            Err(e) => {
                // A camera that streamed for a while gets a fresh backoff
                if started.elapsed() > max_backoff {
                    backoff = initial_backoff;
                }
                error!(error = %e, "camera failed, restarting in {:?}", backoff);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl-C during restart backoff");
                break;
            }
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}

enum Outcome {
    /// Ctrl-C closed the pipeline.
    Shutdown,
    /// The pipeline ended without an error.
    Stopped,
}

async fn run_once(
    config: &Config,
    trigger: Option<Arc<dyn Trigger>>,
) -> Result<Outcome, PipelineError> {
    let source = open_source(&config.camera)?;

    let mut pipeline = MotionPipeline::new(source, PipelineConfig::from(&config.detection));
    if let Some(trigger) = trigger {
        pipeline = pipeline.with_trigger(trigger);
    }
    if config.preview.enabled {
        pipeline = pipeline.with_display(Box::new(PreviewDisplay::spawn(
            PathBuf::from(&config.preview.path),
            Duration::from_millis(config.preview.interval_ms),
            config.detection.jpeg_quality,
        )));
    }

    let running = pipeline.start();
    tokio::pin!(running);

    tokio::select! {
        result = &mut running => result.map(|_| Outcome::Stopped),
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, shutting down");
            pipeline.close();
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut running).await {
                Ok(Err(e)) => warn!(error = %e, "pipeline stopped with error during shutdown"),
                Ok(Ok(())) => {}
                Err(_) => warn!("pipeline did not stop within {:?}", SHUTDOWN_GRACE),
            }
            Ok(Outcome::Shutdown)
        }
    }
}
