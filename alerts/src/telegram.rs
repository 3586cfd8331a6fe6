use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::db::{AlertDb, AlertDbError, User};

const API_BASE: &str = "https://api.telegram.org";
const REGISTERED_REPLY: &str = "User registered successfully!";
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("Telegram HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Telegram API error: {0}")]
    Api(String),
    #[error("user lookup failed: {0}")]
    Db(#[from] AlertDbError),
}

/// Envelope every Bot API method answers with.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, TelegramError> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(TelegramError::Api(
                self.description
                    .unwrap_or_else(|| "response without result".into()),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub from: Option<Sender>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct Sender {
    pub id: i64,
    pub username: Option<String>,
}

/// JPEG attachment for an alert.
#[derive(Debug, Clone, Copy)]
pub struct Photo<'a> {
    pub jpeg: &'a [u8],
    pub file_name: &'a str,
}

/// Telegram bot that registers users who message it and pushes motion
/// alerts to every admin.
pub struct TelegramBot {
    client: reqwest::Client,
    token: String,
    api_base: String,
    db: Arc<AlertDb>,
    poll_timeout: Duration,
    /// Telegram ids promoted to admin when they register.
    admins: HashSet<String>,
}

impl TelegramBot {
    pub fn new(token: &str, db: Arc<AlertDb>, poll_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.to_string(),
            api_base: API_BASE.to_string(),
            db,
            poll_timeout,
            admins: HashSet::new(),
        }
    }

    /// Talk to a Bot API server other than api.telegram.org.
    pub fn with_base_url(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_admins(mut self, admins: impl IntoIterator<Item = String>) -> Self {
        self.admins = admins.into_iter().collect();
        self
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TelegramError> {
        let response: ApiResponse<T> = request.send().await?.json().await?;
        response.into_result()
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        let request = self.client.post(self.method_url("sendMessage")).json(&body);
        self.call::<serde_json::Value>(request).await?;
        Ok(())
    }

    pub async fn send_photo(
        &self,
        chat_id: i64,
        jpeg: Vec<u8>,
        file_name: &str,
    ) -> Result<(), TelegramError> {
        let photo = Part::bytes(jpeg)
            .file_name(file_name.to_string())
            .mime_str("image/jpeg")?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("photo", photo);
        let request = self.client.post(self.method_url("sendPhoto")).multipart(form);
        self.call::<serde_json::Value>(request).await?;
        Ok(())
    }

    /// Send `text`, and the image if any, to every admin user.
    ///
    /// Failures for individual users are logged and skipped. Returns the
    /// number of admins the alert was fully delivered to.
    pub async fn send_alert(
        &self,
        text: &str,
        photo: Option<Photo<'_>>,
    ) -> Result<usize, TelegramError> {
        let admins = self.db.find_admins()?;
        if admins.is_empty() {
            warn!("no admin users registered, alert not delivered");
            return Ok(0);
        }

        let mut delivered = 0;
        for user in &admins {
            match self.deliver(user, text, photo).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    error!(error = %e, username = user.username, "failed to send alert");
                }
            }
        }
        info!(delivered, admins = admins.len(), "alert sent");
        Ok(delivered)
    }

    async fn deliver(
        &self,
        user: &User,
        text: &str,
        photo: Option<Photo<'_>>,
    ) -> Result<(), TelegramError> {
        self.send_message(user.chat_id, text).await?;
        if let Some(photo) = photo {
            self.send_photo(user.chat_id, photo.jpeg.to_vec(), photo.file_name)
                .await?;
        }
        Ok(())
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TelegramError> {
        let request = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.poll_timeout.as_secs().to_string()),
            ])
            .timeout(self.poll_timeout + Duration::from_secs(10));
        self.call(request).await
    }

    /// Long-poll for incoming messages and register their senders until
    /// `shutdown` flips to true.
    pub async fn run_registration_loop(&self, mut shutdown: watch::Receiver<bool>) {
        info!("telegram registration loop started");
        let mut offset = 0;

        while !*shutdown.borrow() {
            let updates = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                res = self.get_updates(offset) => res,
            };

            let updates = match updates {
                Ok(u) => u,
                Err(e) => {
                    warn!(error = %e, "getUpdates failed, retrying in {:?}", POLL_ERROR_BACKOFF);
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(mut user) = registration_from_update(&update) else {
                    debug!(update_id = update.update_id, "ignoring update without sender");
                    continue;
                };
                user.admin = self.admins.contains(&user.telegram_id);
                if let Err(e) = self.db.upsert_user(&user) {
                    error!(error = %e, telegram_id = user.telegram_id, "error upserting user");
                    continue;
                }
                info!(
                    telegram_id = user.telegram_id,
                    username = user.username,
                    admin = user.admin,
                    "user registered"
                );
                if let Err(e) = self.send_message(user.chat_id, REGISTERED_REPLY).await {
                    warn!(error = %e, "failed to confirm registration");
                }
            }
        }
        info!("telegram registration loop stopped");
    }
}

/// The user record a message registers, if the update carries a message
/// with a known sender.
pub fn registration_from_update(update: &Update) -> Option<User> {
    let message = update.message.as_ref()?;
    let from = message.from.as_ref()?;
    Some(User {
        id: None,
        username: from.username.clone().unwrap_or_default(),
        telegram_id: from.id.to_string(),
        chat_id: message.chat.id,
        admin: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Request target and body of every call the fake API received.
    type Seen = Arc<Mutex<Vec<(String, String)>>>;

    async fn read_request(socket: &mut TcpStream) -> Option<(String, String)> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let target = head.split_whitespace().nth(1)?.to_string();
        let lower = head.to_ascii_lowercase();
        let content_length = lower
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok());
        let chunked = lower.contains("transfer-encoding: chunked");
        loop {
            let body = &buf[head_end..];
            let complete = match content_length {
                Some(len) => body.len() >= len,
                None if chunked => body.ends_with(b"0\r\n\r\n"),
                None => true,
            };
            if complete {
                break;
            }
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        Some((target, String::from_utf8_lossy(&buf[head_end..]).into_owned()))
    }

    /// Loopback Bot API answering each request with `reply(target, body)`.
    async fn fake_api(reply: fn(&str, &str) -> String) -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Seen = Arc::default();
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let Some((target, body)) = read_request(&mut socket).await else {
                    continue;
                };
                let json = reply(&target, &body);
                log.lock().unwrap().push((target, body));
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{json}",
                    json.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), seen)
    }

    fn calls(seen: &Seen, method: &str) -> Vec<(String, String)> {
        let suffix = format!("/{method}");
        seen.lock()
            .unwrap()
            .iter()
            .filter(|(target, _)| target.split('?').next().unwrap_or("").ends_with(&suffix))
            .cloned()
            .collect()
    }

    fn admin(telegram_id: &str, chat_id: i64) -> User {
        User {
            id: None,
            username: format!("user{telegram_id}"),
            telegram_id: telegram_id.to_string(),
            chat_id,
            admin: true,
        }
    }

    #[test]
    fn parses_updates_and_builds_registration() {
        let raw = r#"{
            "ok": true,
            "result": [
                {
                    "update_id": 901,
                    "message": {
                        "message_id": 1,
                        "from": { "id": 5551, "is_bot": false, "username": "alice" },
                        "chat": { "id": 5551, "type": "private" },
                        "text": "/start"
                    }
                },
                { "update_id": 902 }
            ]
        }"#;
        let response: ApiResponse<Vec<Update>> = serde_json::from_str(raw).unwrap();
        let updates = response.into_result().unwrap();
        assert_eq!(updates.len(), 2);

        let user = registration_from_update(&updates[0]).unwrap();
        assert_eq!(user.telegram_id, "5551");
        assert_eq!(user.username, "alice");
        assert_eq!(user.chat_id, 5551);
        assert!(!user.admin);

        assert!(registration_from_update(&updates[1]).is_none());
    }

    #[test]
    fn sender_without_username() {
        let update: Update = serde_json::from_str(
            r#"{"update_id": 3, "message": {"from": {"id": 9}, "chat": {"id": -100}}}"#,
        )
        .unwrap();
        let user = registration_from_update(&update).unwrap();
        assert_eq!(user.username, "");
        assert_eq!(user.chat_id, -100);
    }

    #[test]
    fn api_error_surfaces_description() {
        let raw = r#"{"ok": false, "error_code": 401, "description": "Unauthorized"}"#;
        let response: ApiResponse<serde_json::Value> = serde_json::from_str(raw).unwrap();
        match response.into_result() {
            Err(TelegramError::Api(desc)) => assert_eq!(desc, "Unauthorized"),
            other => panic!("expected API error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn alert_without_admins_is_a_noop() {
        let db = Arc::new(AlertDb::open_in_memory().unwrap());
        let bot = TelegramBot::new("test-token", db, Duration::from_secs(1));
        assert_eq!(bot.send_alert("Movement detected", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn alert_continues_past_failed_admin() {
        let (url, seen) = fake_api(|target, body| {
            if target.ends_with("/sendMessage") && body.contains(r#""chat_id":100"#) {
                r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was blocked"}"#
                    .to_string()
            } else {
                r#"{"ok":true,"result":{}}"#.to_string()
            }
        })
        .await;
        let db = Arc::new(AlertDb::open_in_memory().unwrap());
        db.upsert_user(&admin("1", 100)).unwrap();
        db.upsert_user(&admin("2", 200)).unwrap();
        let bot = TelegramBot::new("test-token", db, Duration::from_secs(1)).with_base_url(&url);

        let photo = Photo {
            jpeg: &[0xFF, 0xD8, 0xFF, 0xD9],
            file_name: "motion_20240219T000000.000Z_000042.jpg",
        };
        let delivered = bot.send_alert("Movement detected", Some(photo)).await.unwrap();
        assert_eq!(delivered, 1);

        assert_eq!(calls(&seen, "sendMessage").len(), 2);
        let photos = calls(&seen, "sendPhoto");
        assert_eq!(photos.len(), 1);
        let (target, body) = &photos[0];
        assert!(target.starts_with("/bottest-token/"));
        assert!(body.contains(r#"filename="motion_20240219T000000.000Z_000042.jpg""#));
        assert!(body.contains("200"));
    }

    #[tokio::test]
    async fn registration_upserts_sender_and_replies() {
        let (url, seen) = fake_api(|target, _| {
            if !target.contains("/getUpdates") {
                r#"{"ok":true,"result":{}}"#.to_string()
            } else if target.contains("offset=0") {
                r#"{"ok":true,"result":[{"update_id":41,"message":
                    {"from":{"id":77,"username":"carol"},"chat":{"id":500}}}]}"#
                    .to_string()
            } else {
                r#"{"ok":true,"result":[]}"#.to_string()
            }
        })
        .await;
        let db = Arc::new(AlertDb::open_in_memory().unwrap());
        let bot = Arc::new(
            TelegramBot::new("test-token", Arc::clone(&db), Duration::from_secs(1))
                .with_base_url(&url)
                .with_admins(["77".to_string()]),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let bot = Arc::clone(&bot);
            tokio::spawn(async move { bot.run_registration_loop(shutdown_rx).await })
        };

        let mut settled = false;
        for _ in 0..300 {
            let replied = !calls(&seen, "sendMessage").is_empty();
            let advanced = calls(&seen, "getUpdates")
                .iter()
                .any(|(target, _)| target.contains("offset=42"));
            if replied && advanced {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("registration loop ignored shutdown")
            .unwrap();
        assert!(settled, "no reply or offset never advanced");

        let user = db.find_user_by_telegram_id("77").unwrap().unwrap();
        assert_eq!(user.username, "carol");
        assert_eq!(user.chat_id, 500);
        assert!(user.admin);

        let replies = calls(&seen, "sendMessage");
        assert_eq!(replies.len(), 1);
        assert!(replies[0].1.contains(r#""chat_id":500"#));
        assert!(replies[0].1.contains(REGISTERED_REPLY));
    }
}
