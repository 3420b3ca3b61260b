//! Delivery-status callback receiver
//!
//! This crate receives the asynchronous delivery notifications a messaging
//! provider pushes for previously sent messages:
//! - Verification handshake (`GET ?echostr=`)
//! - Basic authentication against the channel key and secret
//! - JSON batch decoding into typed event records
//! - Dispatch to per-type handlers or to one unified batch handler
//! - Listener lifecycle with signal-triggered, bounded graceful shutdown
//!
//! # Example
//!
//! ```rust,ignore
//! use callback_receiver::{CallbackReceiver, EventRecord, EventType};
//!
//! let receiver = CallbackReceiver::builder()
//!     .with_listen_addr("0.0.0.0:8081")
//!     .with_channel("channel-key", "channel-secret")
//!     .on_fn(EventType::SentFail, |record: EventRecord| async move {
//!         tracing::warn!(msg_id = %record.msg_id, error = ?record.error, "Send failed");
//!         Ok(())
//!     })
//!     .build()?;
//!
//! let report = receiver.listener().run().await?;
//! ```

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod inbound;
pub mod listener;
pub mod telemetry;

pub use auth::{AuthGuard, AuthRejection, ChannelCredentials};
pub use config::{ConfigError, ReceiverBuilder, ReceiverConfig};
pub use dispatch::{
    BatchFn, BatchHandler, DispatchReport, DispatchStrategy, Dispatcher, HandlerSet, RecordFn,
    RecordHandler,
};
pub use events::{
    ErrorInvariant, EventBatch, EventError, EventParseError, EventRecord, EventType, Platform,
    Sender,
};
pub use inbound::CallbackReceiver;
pub use listener::{Listener, ListenerState, ShutdownOutcome, ShutdownReason, ShutdownReport};

/// Raw callback body type carried by [`EventBatch`]
pub use axum::body::Bytes;

use std::time::Duration;
use thiserror::Error;

/// Receiver errors
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Listener did not start within {0:?}")]
    StartupTimeout(Duration),

    #[error("Listener is already running")]
    AlreadyRunning,

    #[error("Listener has already stopped")]
    AlreadyStopped,

    #[error("HTTP server error: {0}")]
    Server(String),

    #[error("Forced close failed: {0}")]
    ForceClose(String),
}

pub type Result<T> = std::result::Result<T, ReceiverError>;
