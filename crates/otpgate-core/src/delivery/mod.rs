//! Delivery status tracking
//!
//! Operator delivery reports and expiry sweeps are funnelled into a single
//! tracker task, which moves PENDING messages to their terminal status and
//! hands status callbacks to the webhook dispatcher:
//!
//! ```text
//! DLR webhook ─┐
//!              ├─> TrackerCommand ─> Tracker ─> CallbackJob ─> WebhookDispatcher
//! Sweeper ─────┘
//! ```

pub mod dispatcher;
pub mod sweeper;
pub mod tracker;

use otpgate_common::types::{MessageId, MessageStatus};
use serde::{Deserialize, Serialize};

pub use dispatcher::{validate_callback_url, DispatcherConfig, WebhookDispatcher};
pub use sweeper::run_sweeper;
pub use tracker::{spawn_tracker, ReportOutcome, Tracker, TrackerCommand, TrackerHandle};

/// A delivery report from the operator link
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryReport {
    /// Message id the report refers to
    pub id: String,
    /// Raw operator status, e.g. `DELIVRD` or `UNDELIV`
    pub message_status: String,
    /// Operator completion time, informational only
    pub donedate: Option<String>,
    /// Operator error code
    pub err: Option<String>,
}

/// Map a raw operator status to a terminal message status.
///
/// Returns `None` for interim statuses that do not end delivery.
pub fn map_operator_status(raw: &str) -> Option<MessageStatus> {
    let raw = raw.trim().to_ascii_uppercase();
    match raw.as_str() {
        "DELIVRD" | "DELIVERED" => Some(MessageStatus::Delivrd),
        "UNDELIV" | "UNDELIVERABLE" | "DELETED" => Some(MessageStatus::Undeliv),
        "REJECTD" | "REJECTED" => Some(MessageStatus::Rejected),
        "EXPIRED" => Some(MessageStatus::Expired),
        "ENROUTE" | "ACCEPTD" | "ACCEPTED" | "PENDING" | "ESME_ROK" => None,
        _ => Some(MessageStatus::Failed),
    }
}

/// Body posted to an integrator's status webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub metadata: serde_json::Value,
}

/// A status webhook waiting to be delivered
#[derive(Debug, Clone)]
pub struct CallbackJob {
    pub url: String,
    pub payload: CallbackPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_operator_status() {
        assert_eq!(map_operator_status("DELIVRD"), Some(MessageStatus::Delivrd));
        assert_eq!(map_operator_status("delivered"), Some(MessageStatus::Delivrd));
        assert_eq!(map_operator_status("DELETED"), Some(MessageStatus::Undeliv));
        assert_eq!(map_operator_status("REJECTD"), Some(MessageStatus::Rejected));
        assert_eq!(map_operator_status("EXPIRED"), Some(MessageStatus::Expired));
        assert_eq!(map_operator_status("ENROUTE"), None);
        assert_eq!(map_operator_status("ACCEPTD"), None);
        assert_eq!(map_operator_status("UNKNOWN"), Some(MessageStatus::Failed));
        assert_eq!(map_operator_status("ESME_RTHROTTLED"), Some(MessageStatus::Failed));
    }
}
