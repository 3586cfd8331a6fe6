use async_trait::async_trait;
use chrono::Utc;
use motion_watch_alerts::db::{AlertDb, CreateNotificationRequest};
use motion_watch_alerts::telegram::{Photo, TelegramBot, TelegramError};
use motion_watch_common::frame::{Frame, FrameError};
use std::sync::Arc;
use tracing::{info, warn};

const ALERT_TEXT: &str = "Movement detected by the security camera!";
const AUDIT_MESSAGE: &str = "Motion detected";

/// A frame exported for alert delivery.
#[derive(Debug, Clone)]
pub struct AlertImage {
    pub jpeg: Vec<u8>,
    pub file_name: String,
    pub seq: u64,
}

impl AlertImage {
    pub fn from_frame(frame: &Frame, quality: u8) -> Result<Self, FrameError> {
        Ok(Self {
            jpeg: frame.encode_jpeg(quality)?,
            file_name: frame.export_name(),
            seq: frame.seq,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("alert delivery failed: {0}")]
    Delivery(#[from] TelegramError),
    #[error("alert reached none of the recipients")]
    Undelivered,
    #[error("{0}")]
    Other(String),
}

/// Capability invoked when the detector decides there was motion.
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn fire(&self, image: AlertImage) -> Result<(), TriggerError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Trigger that does nothing.
pub struct NullTrigger;

#[async_trait]
impl Trigger for NullTrigger {
    async fn fire(&self, _image: AlertImage) -> Result<(), TriggerError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Sends the alert text and the image to every admin via Telegram.
pub struct TelegramTrigger {
    bot: Arc<TelegramBot>,
}

impl TelegramTrigger {
    pub fn new(bot: Arc<TelegramBot>) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Trigger for TelegramTrigger {
    async fn fire(&self, image: AlertImage) -> Result<(), TriggerError> {
        info!(seq = image.seq, "movement detected, sending alert via Telegram");
        let photo = Photo {
            jpeg: &image.jpeg,
            file_name: &image.file_name,
        };
        match self.bot.send_alert(ALERT_TEXT, Some(photo)).await? {
            0 => Err(TriggerError::Undelivered),
            _ => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "telegram"
    }
}

/// Records a notification for every alert, then delegates to `inner`.
///
/// A failed insert is logged and does not prevent delivery.
pub struct AuditTrigger<T> {
    inner: T,
    db: Arc<AlertDb>,
}

impl<T: Trigger> AuditTrigger<T> {
    pub fn new(inner: T, db: Arc<AlertDb>) -> Self {
        Self { inner, db }
    }
}

#[async_trait]
impl<T: Trigger> Trigger for AuditTrigger<T> {
    async fn fire(&self, image: AlertImage) -> Result<(), TriggerError> {
        let request = CreateNotificationRequest {
            message: Some(AUDIT_MESSAGE.to_string()),
            timestamp: Some(Utc::now().timestamp()),
            ..Default::default()
        };
        if let Err(e) = self.db.create_notification(request) {
            warn!(error = %e, "error creating notification");
        }
        self.inner.fire(image).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Trigger for Counting {
        async fn fire(&self, _image: AlertImage) -> Result<(), TriggerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(TriggerError::Other("delivery down".into()))
        }
    }

    fn image() -> AlertImage {
        AlertImage::from_frame(&Frame::solid(8, 8, [9, 9, 9], 1708300000000, 12), 80).unwrap()
    }

    #[test]
    fn alert_image_from_frame() {
        let image = image();
        assert_eq!(image.seq, 12);
        assert_eq!(&image.jpeg[..2], &[0xFF, 0xD8]);
        assert!(image.file_name.ends_with("_000012.jpg"));
    }

    #[test]
    fn empty_frame_cannot_be_exported() {
        assert!(AlertImage::from_frame(&Frame::empty(0, 0), 80).is_err());
    }

    #[tokio::test]
    async fn telegram_without_recipients_is_undelivered() {
        let db = Arc::new(AlertDb::open_in_memory().unwrap());
        let bot = TelegramBot::new("test-token", db, std::time::Duration::from_secs(1))
            .with_base_url("http://127.0.0.1:9");
        let trigger = TelegramTrigger::new(Arc::new(bot));

        let result = trigger.fire(image()).await;
        assert!(matches!(result, Err(TriggerError::Undelivered)));
    }

    #[tokio::test]
    async fn null_trigger_succeeds() {
        assert!(NullTrigger.fire(image()).await.is_ok());
    }

    #[tokio::test]
    async fn audit_records_then_delegates() {
        let db = Arc::new(AlertDb::open_in_memory().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let trigger = AuditTrigger::new(Counting(Arc::clone(&calls)), Arc::clone(&db));

        let result = trigger.fire(image()).await;
        assert!(matches!(result, Err(TriggerError::Other(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let notes = db.list_notifications().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].message, "Motion detected");
        assert!(notes[0].timestamp > 0);
    }
}
