//! Collaborators of the motion detector: the SQLite store for users and
//! notifications, and the Telegram bot that delivers alerts.

pub mod db;
pub mod telegram;

pub use db::{AlertDb, AlertDbError, CreateNotificationRequest, Notification, User};
pub use telegram::{Photo, TelegramBot, TelegramError};
