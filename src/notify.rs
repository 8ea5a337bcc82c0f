//! Outbound notification dispatch to external notification sinks.
//!
//! Reconciliation commits a Session's state transition to the declarative
//! store first; notification delivery happens afterwards, off the
//! reconcile path, so a slow or unreachable webhook endpoint never blocks
//! or retries the reconciliation itself. A bounded channel decouples
//! producer (the reconciler, enqueuing on commit) from consumer (a
//! background task that delivers with backoff and gives up after a fixed
//! number of attempts, logging the drop rather than losing the process).

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::crd::{NotificationEvent, NotificationWebhook};

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub event: NotificationEvent,
    pub tenant: String,
    pub session: String,
    pub phase: String,
    pub message: String,
}

struct Delivery {
    url: String,
    payload: NotificationPayload,
}

/// Producer handle held by the reconciler. Cloning is cheap (an `mpsc`
/// sender); every reconciler task shares one outbox.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Delivery>,
}

impl Outbox {
    /// Spawns the background delivery task and returns the producer handle.
    /// `client` is shared across all deliveries; `reqwest::Client` is
    /// internally connection-pooled so a single instance is correct here.
    pub fn spawn(client: reqwest::Client) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(delivery_loop(client, rx));
        Self { tx }
    }

    /// Enqueues a notification for every webhook subscribed to `payload.event`.
    /// Never awaits a network call; a full channel drops the oldest-pending
    /// work by logging and skipping rather than applying backpressure to
    /// the reconciler.
    pub fn enqueue(&self, webhooks: &[NotificationWebhook], payload: NotificationPayload) {
        for webhook in webhooks {
            if !webhook.events.contains(&payload.event) {
                continue;
            }
            let delivery = Delivery { url: webhook.url.clone(), payload: payload.clone() };
            if let Err(err) = self.tx.try_send(delivery) {
                warn!(
                    tenant = %payload.tenant,
                    session = %payload.session,
                    url = %webhook.url,
                    error = %err,
                    "dropping notification, outbox channel full"
                );
            }
        }
    }
}

async fn delivery_loop(client: reqwest::Client, mut rx: mpsc::Receiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        deliver_with_retry(&client, delivery).await;
    }
}

async fn deliver_with_retry(client: &reqwest::Client, delivery: Delivery) {
    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=MAX_ATTEMPTS {
        match client.post(&delivery.url).json(&delivery.payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(url = %delivery.url, session = %delivery.payload.session, attempt, "notification delivered");
                return;
            }
            Ok(resp) => {
                warn!(url = %delivery.url, status = %resp.status(), attempt, "notification endpoint returned non-2xx");
            }
            Err(err) => {
                warn!(url = %delivery.url, error = %err, attempt, "notification delivery failed");
            }
        }
        if attempt < MAX_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
    warn!(
        url = %delivery.url,
        session = %delivery.payload.session,
        attempts = MAX_ATTEMPTS,
        "giving up on notification after exhausting retries"
    );
}
