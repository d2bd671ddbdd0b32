//! Outbound operator link

use async_trait::async_trait;
use otpgate_common::Result;
use otpgate_storage::models::Message;
use tracing::info;

/// Hands accepted messages to the carrier.
///
/// Delivery reports come back separately through the DLR ingestion endpoint.
#[async_trait]
pub trait OperatorLink: Send + Sync {
    async fn submit(&self, message: &Message) -> Result<()>;
}

/// Link that only logs submissions
#[derive(Debug, Default, Clone)]
pub struct LoggingOperatorLink;

#[async_trait]
impl OperatorLink for LoggingOperatorLink {
    async fn submit(&self, message: &Message) -> Result<()> {
        info!(
            message_id = %message.id,
            to = %message.mobile_phone,
            sender = %message.sender,
            parts = message.part_count,
            encoding = %message.encoding,
            "Submitted message to operator"
        );
        Ok(())
    }
}
