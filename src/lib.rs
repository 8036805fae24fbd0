//! Live chat session client for job applications.
//!
//! Merges persisted conversation history with a streaming WebSocket channel,
//! decodes the typed event protocol, and drives bounded connection recovery.
//! Consumers observe one consistent transcript + phase model per application
//! binding; see [`chat::ChatClient`].

pub mod chat;
pub mod models;

pub use chat::{ChatClient, ChatHandle, ChatPhase, ChatUpdate};
pub use models::{ChatConfig, ChatMessage, ChatSession, Sender, SessionState};
