//! OtpGate Core - Messaging engine
//!
//! Segmentation, pricing, balance accounting, moderation, and delivery
//! tracking. The [`gateway::Gateway`] ties them together for the API layer.

pub mod delivery;
pub mod encoding;
pub mod gateway;
pub mod guard;
pub mod ledger;
pub mod moderation;
pub mod normalizer;
pub mod operator;
pub mod pricing;

pub use delivery::{DeliveryReport, TrackerHandle, WebhookDispatcher};
pub use encoding::{segment, Segmentation};
pub use gateway::{
    BatchItem, BatchItemOutcome, BatchOutcome, BatchRequest, CheckOutcome, CheckRequest,
    DispatchSummary, Gateway, HistoryQuery, SendOutcome, SendRequest,
};
pub use guard::Guard;
pub use ledger::Ledger;
pub use moderation::{Decision, Moderation, TemplateSubmission};
pub use normalizer::{normalize, Normalization};
pub use operator::{LoggingOperatorLink, OperatorLink};
pub use pricing::{Quote, RateTable};
