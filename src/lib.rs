//! Terminal chat client that streams chat-completion replies into stored
//! messages and renders them as Markdown.

pub mod api;
pub mod app;
pub mod config;
pub mod conversation;
pub mod display;
pub mod error;
pub mod ingest;
pub mod markdown;
pub mod sse;
pub mod store;
