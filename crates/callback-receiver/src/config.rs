//! Receiver configuration
//!
//! [`ReceiverConfig`] holds the plain settings and can be deserialized from a
//! file or the environment. [`ReceiverBuilder`] adds handler registration and
//! validates everything once in [`ReceiverBuilder::build`].

use crate::auth::{AuthGuard, ChannelCredentials};
use crate::dispatch::{
    BatchFn, BatchHandler, DispatchStrategy, Dispatcher, HandlerSet, RecordFn, RecordHandler,
};
use crate::events::{EventBatch, EventRecord, EventType};
use crate::inbound::CallbackReceiver;
use crate::telemetry;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Construction-time configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Listen address must not be empty")]
    EmptyListenAddr,

    #[error("Callback path must start with '/': {0:?}")]
    InvalidPath(String),

    #[error("Authentication is enabled but no channel key is configured")]
    MissingChannelKey,

    #[error("Authentication is enabled but no channel secret is configured")]
    MissingChannelSecret,

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
}

/// Receiver settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Socket address to bind, e.g. "0.0.0.0:8081"
    pub listen_addr: String,
    /// Callback path, must start with '/'
    pub path: String,
    /// Require Basic credentials on every request
    pub auth_enabled: bool,
    /// Channel key, the expected Basic username
    pub channel_key: String,
    /// Channel secret, the expected Basic password
    pub channel_secret: String,
    /// Largest accepted request body
    pub max_body_bytes: usize,
    /// Largest accepted number of records in one batch
    pub max_records_per_batch: usize,
    /// How long a unified handler may hold the response
    pub unified_ack_timeout_ms: u64,
    /// Bind deadline
    pub startup_timeout_ms: u64,
    /// Drain deadline before connections are force-closed
    pub grace_period_ms: u64,
    /// Stop on SIGINT / SIGTERM
    pub handle_signals: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8081".to_string(),
            path: "/callback".to_string(),
            auth_enabled: true,
            channel_key: String::new(),
            channel_secret: String::new(),
            max_body_bytes: 4 * 1024 * 1024,
            max_records_per_batch: 1000,
            unified_ack_timeout_ms: 5_000,
            startup_timeout_ms: 5_000,
            grace_period_ms: 5_000,
            handle_signals: true,
        }
    }
}

impl ReceiverConfig {
    pub fn unified_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.unified_ack_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::EmptyListenAddr);
        }
        if !self.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.path.clone()));
        }
        if self.auth_enabled {
            if self.channel_key.is_empty() {
                return Err(ConfigError::MissingChannelKey);
            }
            if self.channel_secret.is_empty() {
                return Err(ConfigError::MissingChannelSecret);
            }
        }

        let limits = [
            ("max_body_bytes", self.max_body_bytes as u64),
            ("max_records_per_batch", self.max_records_per_batch as u64),
            ("startup_timeout_ms", self.startup_timeout_ms),
            ("grace_period_ms", self.grace_period_ms),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroLimit(*name));
        }

        Ok(())
    }

    pub(crate) fn auth_guard(&self) -> AuthGuard {
        if self.auth_enabled {
            AuthGuard::new(ChannelCredentials::new(
                &self.channel_key,
                &self.channel_secret,
            ))
        } else {
            AuthGuard::disabled()
        }
    }
}

/// Builder for a [`CallbackReceiver`].
///
/// Per-type handlers and the unified handler are mutually exclusive: the
/// most recent registration decides the strategy. Registering a unified
/// handler drops every per-type handler, and registering a per-type handler
/// after a unified one starts again from an empty per-type set.
pub struct ReceiverBuilder {
    config: ReceiverConfig,
    strategy: DispatchStrategy,
    default_logger: bool,
}

impl Default for ReceiverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverBuilder {
    pub fn new() -> Self {
        Self::from_config(ReceiverConfig::default())
    }

    pub fn from_config(config: ReceiverConfig) -> Self {
        Self {
            config,
            strategy: DispatchStrategy::default(),
            default_logger: true,
        }
    }

    pub fn with_listen_addr(mut self, addr: &str) -> Self {
        self.config.listen_addr = addr.to_string();
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.config.path = path.to_string();
        self
    }

    /// Enable Basic authentication against the given channel identity
    pub fn with_channel(mut self, key: &str, secret: &str) -> Self {
        self.config.auth_enabled = true;
        self.config.channel_key = key.to_string();
        self.config.channel_secret = secret.to_string();
        self
    }

    pub fn with_auth(mut self, enabled: bool) -> Self {
        self.config.auth_enabled = enabled;
        self
    }

    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.config.max_body_bytes = bytes;
        self
    }

    pub fn with_max_records_per_batch(mut self, records: usize) -> Self {
        self.config.max_records_per_batch = records;
        self
    }

    pub fn with_unified_ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.unified_ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.config.grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.config.handle_signals = enabled;
        self
    }

    /// Do not install the fallback console subscriber on build
    pub fn without_default_logger(mut self) -> Self {
        self.default_logger = false;
        self
    }

    /// Register a handler for one event type
    pub fn on<H>(mut self, event_type: EventType, handler: H) -> Self
    where
        H: RecordHandler + 'static,
    {
        let handler: Arc<dyn RecordHandler> = Arc::new(handler);
        if let DispatchStrategy::PerType(handlers) = &mut self.strategy {
            handlers.insert(event_type, handler);
            return self;
        }

        debug!(event_type = %event_type, "Per-type handler replaces unified handler");
        let mut handlers = HandlerSet::default();
        handlers.insert(event_type, handler);
        self.strategy = DispatchStrategy::PerType(handlers);
        self
    }

    /// Register an async closure for one event type
    pub fn on_fn<F, Fut>(self, event_type: EventType, f: F) -> Self
    where
        F: Fn(EventRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on(event_type, RecordFn(f))
    }

    pub fn on_target_valid<H: RecordHandler + 'static>(self, handler: H) -> Self {
        self.on(EventType::TargetValid, handler)
    }

    pub fn on_target_invalid<H: RecordHandler + 'static>(self, handler: H) -> Self {
        self.on(EventType::TargetInvalid, handler)
    }

    pub fn on_sent_succ<H: RecordHandler + 'static>(self, handler: H) -> Self {
        self.on(EventType::SentSucc, handler)
    }

    pub fn on_sent_fail<H: RecordHandler + 'static>(self, handler: H) -> Self {
        self.on(EventType::SentFail, handler)
    }

    pub fn on_received_succ<H: RecordHandler + 'static>(self, handler: H) -> Self {
        self.on(EventType::ReceivedSucc, handler)
    }

    pub fn on_received_fail<H: RecordHandler + 'static>(self, handler: H) -> Self {
        self.on(EventType::ReceivedFail, handler)
    }

    pub fn on_click<H: RecordHandler + 'static>(self, handler: H) -> Self {
        self.on(EventType::Click, handler)
    }

    pub fn on_retracted_succ<H: RecordHandler + 'static>(self, handler: H) -> Self {
        self.on(EventType::RetractedSucc, handler)
    }

    pub fn on_retracted_fail<H: RecordHandler + 'static>(self, handler: H) -> Self {
        self.on(EventType::RetractedFail, handler)
    }

    /// Route every batch to a single handler, clearing per-type handlers
    pub fn unified<H>(mut self, handler: H) -> Self
    where
        H: BatchHandler + 'static,
    {
        if let DispatchStrategy::PerType(handlers) = &self.strategy {
            if !handlers.is_empty() {
                debug!(
                    cleared = handlers.len(),
                    "Unified handler replaces per-type handlers"
                );
            }
        }
        self.strategy = DispatchStrategy::Unified(Arc::new(handler));
        self
    }

    pub fn unified_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(EventBatch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.unified(BatchFn(f))
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn strategy(&self) -> &DispatchStrategy {
        &self.strategy
    }

    /// Validate the configuration and assemble the receiver
    pub fn build(self) -> Result<CallbackReceiver, ConfigError> {
        if self.default_logger {
            telemetry::install_default_subscriber();
        }

        self.config.validate()?;

        if !self.strategy.has_handlers() {
            warn!("No callback handlers registered, events will be acknowledged and dropped");
        }
        if !self.config.auth_enabled {
            warn!("Callback authentication is disabled");
        }

        let dispatcher = Dispatcher::new(self.strategy, self.config.unified_ack_timeout());
        Ok(CallbackReceiver::new(self.config, dispatcher))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait::async_trait]
    impl RecordHandler for Noop {
        async fn handle(&self, _record: EventRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn authed() -> ReceiverBuilder {
        ReceiverBuilder::new()
            .with_channel("key", "secret")
            .without_default_logger()
    }

    #[test]
    fn test_defaults() {
        let config = ReceiverConfig::default();
        assert_eq!(config.path, "/callback");
        assert!(config.auth_enabled);
        assert_eq!(config.grace_period(), Duration::from_secs(5));
        assert_eq!(config.startup_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_validation_errors() {
        let missing_key = ReceiverBuilder::new().without_default_logger().build();
        assert_eq!(missing_key.err(), Some(ConfigError::MissingChannelKey));

        let missing_secret = ReceiverBuilder::new()
            .with_channel("key", "")
            .without_default_logger()
            .build();
        assert_eq!(missing_secret.err(), Some(ConfigError::MissingChannelSecret));

        let bad_path = authed().with_path("callback").build();
        assert_eq!(
            bad_path.err(),
            Some(ConfigError::InvalidPath("callback".to_string()))
        );

        let zero_grace = authed().with_grace_period(Duration::ZERO).build();
        assert_eq!(zero_grace.err(), Some(ConfigError::ZeroLimit("grace_period_ms")));

        let empty_addr = authed().with_listen_addr(" ").build();
        assert_eq!(empty_addr.err(), Some(ConfigError::EmptyListenAddr));
    }

    #[test]
    fn test_auth_disabled_needs_no_credentials() {
        let receiver = ReceiverBuilder::new()
            .with_auth(false)
            .without_default_logger()
            .build();
        assert!(receiver.is_ok());
    }

    #[test]
    fn test_unified_clears_per_type_handlers() {
        let builder = authed()
            .on_click(Noop)
            .on_sent_fail(Noop)
            .unified_fn(|_batch| async { anyhow::Ok(()) });

        assert!(builder.strategy().is_unified());
        assert!(builder.strategy().registered_types().is_empty());
    }

    #[test]
    fn test_per_type_after_unified_starts_fresh() {
        let builder = authed()
            .on_click(Noop)
            .unified_fn(|_batch| async { anyhow::Ok(()) })
            .on_received_succ(Noop);

        assert!(!builder.strategy().is_unified());
        assert_eq!(
            builder.strategy().registered_types(),
            vec![EventType::ReceivedSucc]
        );
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: ReceiverConfig = serde_json::from_value(serde_json::json!({
            "path": "/hooks/push",
            "channel_key": "k",
            "grace_period_ms": 250
        }))
        .unwrap();

        assert_eq!(config.path, "/hooks/push");
        assert_eq!(config.grace_period(), Duration::from_millis(250));
        assert_eq!(config.max_records_per_batch, 1000);
    }
}
