//! Delivery Status Tracker
//!
//! Single task owning every PENDING → terminal transition.

use super::{map_operator_status, CallbackJob, CallbackPayload, DeliveryReport};
use chrono::{DateTime, Utc};
use otpgate_common::types::{MessageId, MessageStatus};
use otpgate_common::{Error, Result};
use otpgate_storage::models::Message;
use otpgate_storage::repository::MessageRepository;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Work for the tracker task
#[derive(Debug)]
pub enum TrackerCommand {
    Report {
        report: DeliveryReport,
        reply: Option<oneshot::Sender<Result<ReportOutcome>>>,
    },
    SweepExpired {
        reply: Option<oneshot::Sender<Result<usize>>>,
    },
}

/// What a delivery report did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The message moved to this terminal status
    Applied(MessageStatus),
    /// Interim operator status; nothing changed
    Interim,
    /// The message was already terminal
    Duplicate,
    /// No such message
    UnknownMessage,
}

/// Cloneable sender side of the tracker
#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<TrackerCommand>,
}

impl TrackerHandle {
    /// Queue a report without waiting for it to be applied
    pub async fn submit(&self, report: DeliveryReport) -> Result<()> {
        self.tx
            .send(TrackerCommand::Report {
                report,
                reply: None,
            })
            .await
            .map_err(|_| Error::Internal("delivery tracker is not running".to_string()))
    }

    /// Apply a report and wait for the outcome
    pub async fn report(&self, report: DeliveryReport) -> Result<ReportOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrackerCommand::Report {
                report,
                reply: Some(reply),
            })
            .await
            .map_err(|_| Error::Internal("delivery tracker is not running".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("delivery tracker dropped the reply".to_string()))?
    }

    /// Expire overdue messages and return how many were expired
    pub async fn sweep_expired(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrackerCommand::SweepExpired { reply: Some(reply) })
            .await
            .map_err(|_| Error::Internal("delivery tracker is not running".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("delivery tracker dropped the reply".to_string()))?
    }
}

/// Tracker task state
pub struct Tracker {
    rx: mpsc::Receiver<TrackerCommand>,
    messages: Arc<dyn MessageRepository>,
    callbacks: mpsc::Sender<CallbackJob>,
    expiry: chrono::Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Tracker {
    pub fn new(
        rx: mpsc::Receiver<TrackerCommand>,
        messages: Arc<dyn MessageRepository>,
        callbacks: mpsc::Sender<CallbackJob>,
        expiry: chrono::Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            rx,
            messages,
            callbacks,
            expiry,
            shutdown_rx,
        }
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!("Delivery tracker started");

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow_and_update() {
                        info!("Delivery tracker shutting down");
                        break;
                    }
                }

                command = self.rx.recv() => {
                    let Some(command) = command else {
                        info!("Tracker channel closed");
                        break;
                    };
                    self.handle(command).await;
                }
            }
        }

        // Reports already accepted by the queue are still applied
        self.rx.close();
        let mut drained = 0usize;
        while let Some(command) = self.rx.recv().await {
            self.handle(command).await;
            drained += 1;
        }
        if drained > 0 {
            info!(drained, "Applied queued tracker commands before stopping");
        }
    }

    async fn handle(&self, command: TrackerCommand) {
        match command {
            TrackerCommand::Report { report, reply } => {
                let result = self.apply_report(report).await;
                if let Err(e) = &result {
                    error!("Failed to apply delivery report: {}", e);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            TrackerCommand::SweepExpired { reply } => {
                let result = self.sweep(Utc::now()).await;
                if let Err(e) = &result {
                    error!("Expiry sweep failed: {}", e);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn apply_report(&self, report: DeliveryReport) -> Result<ReportOutcome> {
        let Some(status) = map_operator_status(&report.message_status) else {
            debug!(id = %report.id, status = %report.message_status, "Interim delivery report");
            return Ok(ReportOutcome::Interim);
        };

        let Ok(message_id) = report.id.trim().parse::<MessageId>() else {
            warn!(id = %report.id, "Delivery report for unknown message id");
            return Ok(ReportOutcome::UnknownMessage);
        };

        let error_code = report.err.filter(|e| !e.is_empty() && e != "000");
        match self
            .messages
            .mark_terminal(message_id, status, error_code, Utc::now())
            .await?
        {
            Some(message) => {
                info!(%message_id, %status, "Message reached terminal status");
                self.enqueue_callback(&message, status).await;
                Ok(ReportOutcome::Applied(status))
            }
            None => {
                if self.messages.get(message_id).await?.is_some() {
                    debug!(%message_id, %status, "Ignoring report for terminal message");
                    Ok(ReportOutcome::Duplicate)
                } else {
                    warn!(%message_id, "Delivery report for unknown message");
                    Ok(ReportOutcome::UnknownMessage)
                }
            }
        }
    }

    /// Expire every PENDING message older than the horizon
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.messages.expire_pending(now - self.expiry, now).await?;
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired pending messages");
        }
        for message in &expired {
            self.enqueue_callback(message, MessageStatus::Expired).await;
        }
        Ok(expired.len())
    }

    async fn enqueue_callback(&self, message: &Message, status: MessageStatus) {
        let Some(url) = message.dlr_callback_url.clone() else {
            return;
        };

        let job = CallbackJob {
            url,
            payload: CallbackPayload {
                message_id: message.id,
                status,
                metadata: message.metadata.clone(),
            },
        };
        if self.callbacks.send(job).await.is_err() {
            warn!(message_id = %message.id, "Webhook dispatcher is gone, dropping callback");
        }
    }
}

/// Start the tracker task.
///
/// Returns a handle for submitting commands and the task's join handle.
pub fn spawn_tracker(
    messages: Arc<dyn MessageRepository>,
    callbacks: mpsc::Sender<CallbackJob>,
    expiry: chrono::Duration,
    buffer: usize,
    shutdown_rx: watch::Receiver<bool>,
) -> (TrackerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let tracker = Tracker::new(rx, messages, callbacks, expiry, shutdown_rx);

    let task = tokio::spawn(async move {
        tracker.run().await;
        info!("Delivery tracker stopped");
    });

    (TrackerHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use otpgate_common::types::Encoding;
    use otpgate_storage::models::NewMessage;
    use otpgate_storage::repository::MemoryMessageRepository;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn pending_message(
        repo: &MemoryMessageRepository,
        callback: Option<&str>,
    ) -> Message {
        repo.insert(NewMessage {
            id: Uuid::now_v7(),
            request_id: Uuid::new_v4().to_string(),
            account_id: Uuid::new_v4(),
            mobile_phone: "+998901234567".to_string(),
            content: "Your code is 1234".to_string(),
            sender: "OTP".to_string(),
            encoding: Encoding::Gsm7,
            part_count: 1,
            price: dec!(115),
            currency: "UZS".to_string(),
            promotional: false,
            template_id: None,
            metadata: serde_json::json!({"order": 42}),
            dlr_callback_url: callback.map(String::from),
            dispatch_id: None,
        })
        .await
        .unwrap()
        .unwrap()
    }

    fn report(id: MessageId, status: &str) -> DeliveryReport {
        DeliveryReport {
            id: id.to_string(),
            message_status: status.to_string(),
            donedate: None,
            err: None,
        }
    }

    struct Harness {
        repo: Arc<MemoryMessageRepository>,
        handle: TrackerHandle,
        callbacks: mpsc::Receiver<CallbackJob>,
        _shutdown: watch::Sender<bool>,
    }

    fn harness(expiry: chrono::Duration) -> Harness {
        let repo = Arc::new(MemoryMessageRepository::new());
        let (cb_tx, cb_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = spawn_tracker(repo.clone(), cb_tx, expiry, 16, shutdown_rx);
        Harness {
            repo,
            handle,
            callbacks: cb_rx,
            _shutdown: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn test_report_applies_once() {
        let mut h = harness(chrono::Duration::hours(48));
        let message = pending_message(&h.repo, Some("https://example.com/dlr")).await;

        let outcome = h.handle.report(report(message.id, "DELIVRD")).await.unwrap();
        assert_eq!(outcome, ReportOutcome::Applied(MessageStatus::Delivrd));

        let job = h.callbacks.recv().await.unwrap();
        assert_eq!(job.payload.message_id, message.id);
        assert_eq!(job.payload.status, MessageStatus::Delivrd);
        assert_eq!(job.payload.metadata, serde_json::json!({"order": 42}));

        // Duplicate and late reports change nothing and fire no callback
        let outcome = h.handle.report(report(message.id, "DELIVRD")).await.unwrap();
        assert_eq!(outcome, ReportOutcome::Duplicate);
        let outcome = h.handle.report(report(message.id, "UNDELIV")).await.unwrap();
        assert_eq!(outcome, ReportOutcome::Duplicate);
        assert!(h.callbacks.try_recv().is_err());

        let stored = h.repo.get(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "DELIVRD");
        assert!(stored.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_interim_and_unknown_reports() {
        let h = harness(chrono::Duration::hours(48));
        let message = pending_message(&h.repo, None).await;

        assert_eq!(
            h.handle.report(report(message.id, "ENROUTE")).await.unwrap(),
            ReportOutcome::Interim
        );
        assert_eq!(h.repo.get(message.id).await.unwrap().unwrap().status, "PENDING");

        assert_eq!(
            h.handle.report(report(Uuid::new_v4(), "DELIVRD")).await.unwrap(),
            ReportOutcome::UnknownMessage
        );
        let garbage = DeliveryReport {
            id: "not-a-uuid".to_string(),
            message_status: "DELIVRD".to_string(),
            donedate: None,
            err: None,
        };
        assert_eq!(h.handle.report(garbage).await.unwrap(), ReportOutcome::UnknownMessage);
    }

    #[tokio::test]
    async fn test_error_code_recorded() {
        let h = harness(chrono::Duration::hours(48));
        let message = pending_message(&h.repo, None).await;

        let mut r = report(message.id, "UNDELIV");
        r.err = Some("011".to_string());
        h.handle.report(r).await.unwrap();

        let stored = h.repo.get(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "UNDELIV");
        assert_eq!(stored.error_code.as_deref(), Some("011"));
    }

    #[tokio::test]
    async fn test_sweep_expires_and_notifies() {
        let mut h = harness(chrono::Duration::zero());
        let message = pending_message(&h.repo, Some("https://example.com/dlr")).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert_eq!(h.handle.sweep_expired().await.unwrap(), 1);
        let job = h.callbacks.recv().await.unwrap();
        assert_eq!(job.payload.status, MessageStatus::Expired);

        // A DLR arriving after expiry is a no-op
        assert_eq!(
            h.handle.report(report(message.id, "DELIVRD")).await.unwrap(),
            ReportOutcome::Duplicate
        );
        assert_eq!(h.handle.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let repo = Arc::new(MemoryMessageRepository::new());
        let (cb_tx, _cb_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) =
            spawn_tracker(repo, cb_tx, chrono::Duration::hours(1), 4, shutdown_rx);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(handle.sweep_expired().await.is_err());
    }

    #[tokio::test]
    async fn test_queued_reports_applied_on_shutdown() {
        let repo = Arc::new(MemoryMessageRepository::new());
        let (cb_tx, mut cb_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) =
            spawn_tracker(repo.clone(), cb_tx, chrono::Duration::hours(1), 8, shutdown_rx);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let message = pending_message(&repo, Some("https://example.com/dlr")).await;
            ids.push(message.id);
        }
        for id in &ids {
            handle.submit(report(*id, "DELIVRD")).await.unwrap();
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        for id in &ids {
            let stored = repo.get(*id).await.unwrap().unwrap();
            assert_eq!(stored.status, "DELIVRD");
        }
        // Callbacks were queued for every drained report, then the sender closed
        let mut callbacks = 0;
        while cb_rx.recv().await.is_some() {
            callbacks += 1;
        }
        assert_eq!(callbacks, 3);
    }
}
