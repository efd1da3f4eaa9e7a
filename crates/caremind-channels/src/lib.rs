//! # CareMind Channels
//!
//! Messaging provider implementations of the `MessageDispatcher`
//! boundary: WhatsApp Business Cloud API (server-side templates) and
//! Telegram Bot API (templates rendered locally from config).

pub mod telegram;
pub mod whatsapp;

pub use telegram::TelegramDispatcher;
pub use whatsapp::WhatsAppDispatcher;
