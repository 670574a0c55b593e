use std::io;

use thiserror::Error;

use crate::store::{ConversationId, MessageId};

/// A single `data:` frame that could not be decoded. Never fatal.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// The response stream itself is broken. Aborts the session.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request Error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API Error: Status {status} - {body}")]
    Status { status: u16, body: String },
    #[error("Stream Read Error: {0}")]
    Read(String),
    #[error("Stream closed before completion")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Message {0} not found")]
    MessageNotFound(MessageId),
    #[error("Conversation {0} not found")]
    ConversationNotFound(ConversationId),
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("A reply is already streaming into message {0}")]
    AlreadyStreaming(MessageId),
    #[error("No stream session has been started")]
    Idle,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

// --- Binary-level errors ---
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("Config Error: {0}")]
    Config(#[from] Box<figment::Error>),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Channel Receive Error")]
    ChannelReceive,
}
