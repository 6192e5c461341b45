#![warn(clippy::unwrap_used)]

pub mod admin_rest;
pub mod auth;
pub mod chat;
pub mod error;
pub mod health;
pub mod llm;
pub mod organizations_rest;
pub mod server;
pub mod state;
pub mod usage_rest;
pub mod webhook_rest;

pub use llm::{ChatModel, OpenAiChatModel, UnconfiguredModel};
pub use server::{router, ApiServer};
pub use state::AppState;
