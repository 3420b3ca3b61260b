//! Application wiring: logging handlers around the callback receiver

use anyhow::{Context, Result};
use async_trait::async_trait;
use callback_receiver::{
    BatchHandler, CallbackReceiver, EventBatch, EventRecord, EventType, ReceiverBuilder,
    ReceiverConfig, RecordHandler, ShutdownReport,
};
use tracing::{debug, info, warn};

use crate::cli::Args;

/// Logs every record it receives
struct EventLogger;

#[async_trait]
impl RecordHandler for EventLogger {
    async fn handle(&self, record: EventRecord) -> anyhow::Result<()> {
        log_record(&record);
        Ok(())
    }
}

/// Logs a batch summary, then each record
struct BatchLogger;

#[async_trait]
impl BatchHandler for BatchLogger {
    async fn handle(&self, batch: EventBatch) -> anyhow::Result<()> {
        info!(
            batch_id = %batch.id,
            records = batch.len(),
            by_type = ?batch.count_by_type(),
            "Callback batch"
        );
        for record in batch.iter() {
            log_record(record);
        }
        Ok(())
    }
}

fn log_record(record: &EventRecord) {
    match &record.error {
        Some(error) => warn!(
            event_type = %record.event_type,
            msg_id = %record.msg_id,
            user_id = %record.user_id,
            channel_key = %record.channel_key,
            code = error.code,
            message = %error.message,
            "Delivery failed"
        ),
        None => info!(
            event_type = %record.event_type,
            msg_id = %record.msg_id,
            user_id = %record.user_id,
            channel_key = %record.channel_key,
            sent_at = ?record.sent_at(),
            "Delivery event"
        ),
    }
    if !record.params.is_empty() {
        debug!(msg_id = %record.msg_id, params = ?record.params, "Delivery event params");
    }
}

/// Main application
pub struct App {
    receiver: CallbackReceiver,
}

impl App {
    /// Build the receiver with logging handlers
    pub fn build(args: &Args, config: ReceiverConfig) -> Result<Self> {
        let builder = ReceiverBuilder::from_config(config).without_default_logger();

        let builder = if args.unified {
            builder.unified(BatchLogger)
        } else {
            EventType::ALL
                .into_iter()
                .fold(builder, |builder, event_type| builder.on(event_type, EventLogger))
        };

        let receiver = builder.build().context("Invalid receiver configuration")?;
        Ok(Self { receiver })
    }

    /// Serve until shutdown
    pub async fn run(self) -> Result<ShutdownReport> {
        let config = self.receiver.config();
        info!(
            listen_addr = %config.listen_addr,
            path = %config.path,
            auth = config.auth_enabled,
            unified = self.receiver.dispatcher().strategy().is_unified(),
            "Starting callback server"
        );

        self.receiver
            .listener()
            .run()
            .await
            .context("Callback listener failed")
    }
}
