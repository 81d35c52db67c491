//! Notification dispatcher
//!
//! A service whose acquire callback requests the shared PostgreSQL pool
//! through [`quartermaster::AcquireContext::registry`]: providing the
//! `notifications` key quietly brings `postgres` up first, and reverse
//! teardown order guarantees the worker stops before its pool closes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nutype::nutype;
use quartermaster::{Lifecycle, ReleaseError, ResourceKey};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Key for the notification dispatcher resource.
pub const NOTIFICATIONS: ResourceKey<NotificationsService> = ResourceKey::new("notifications");

/// Who a notification is addressed to. Trimmed, non-empty, at most 200
/// characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200),
    derive(Debug, Clone, PartialEq, Eq, Display, AsRef, Serialize, Deserialize)
)]
pub struct Recipient(String);

/// One queued notification row as stored in the `notifications` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Row identifier.
    pub id: Uuid,
    /// Who the notification is for.
    pub recipient: Recipient,
    /// Message body.
    pub body: String,
    /// Queue time.
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Builds a fresh queue entry for `recipient`.
    #[must_use]
    pub fn new(recipient: Recipient, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            recipient,
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

/// Background dispatcher for queued notifications.
///
/// The worker polls the `notifications` table and delivers whatever is
/// pending. Poll failures are logged and retried on the next tick rather
/// than killing the worker.
pub struct NotificationsService {
    pool: Arc<PgPool>,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationsService {
    /// Starts the polling worker over the given pool.
    #[must_use]
    pub fn start(pool: Arc<PgPool>, poll_interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let worker = tokio::spawn(poll_loop(
            Arc::clone(&pool),
            poll_interval,
            Arc::clone(&shutdown),
        ));
        Self {
            pool,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queues a notification for the worker to deliver.
    pub async fn notify(&self, recipient: &Recipient, body: &str) -> Result<(), sqlx::Error> {
        let notification = Notification::new(recipient.clone(), body);
        sqlx::query(
            "INSERT INTO notifications (id, recipient, body, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(notification.id)
        .bind(notification.recipient.into_inner())
        .bind(notification.body)
        .bind(notification.created_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    /// Stops the worker and waits for it to finish. The pool itself stays
    /// open; it belongs to its own registration.
    pub async fn shutdown(&self) -> Result<(), ReleaseError> {
        self.shutdown.notify_one();
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.await.map_err(ReleaseError::with_source)?;
        }
        Ok(())
    }
}

/// Declares the notifications resource. Acquisition requests the shared pool
/// from the registry, release stops the worker.
pub fn lifecycle(poll_interval: Duration) -> Lifecycle<NotificationsService> {
    Lifecycle::with_context(move |context| async move {
        let pool = context.registry().provide_one(crate::POSTGRES).await?;
        info!(key = %context.key(), "[notifications.start] starting dispatch worker");
        Ok(NotificationsService::start(pool, poll_interval))
    })
    .with_release(|service| async move { service.shutdown().await })
}

async fn poll_loop(pool: Arc<PgPool>, poll_interval: Duration, shutdown: Arc<Notify>) {
    let first_tick = tokio::time::Instant::now() + poll_interval;
    let mut ticker = tokio::time::interval_at(first_tick, poll_interval);
    loop {
        tokio::select! {
            biased;
            () = shutdown.notified() => break,
            _ = ticker.tick() => {
                if let Err(error) = dispatch_pending(&pool).await {
                    warn!(error = %error, "[notifications.poll] dispatch attempt failed");
                }
            }
        }
    }
    info!("[notifications.poll] worker stopped");
}

async fn dispatch_pending(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, recipient, body FROM notifications \
         WHERE sent_at IS NULL ORDER BY created_at LIMIT 50",
    )
    .fetch_all(pool)
    .await?;

    let mut delivered = 0_u64;
    for row in rows {
        let id: Uuid = row.try_get("id")?;
        let recipient: String = row.try_get("recipient")?;
        let body: String = row.try_get("body")?;

        info!(
            %id,
            recipient = %recipient,
            body_len = body.len(),
            "[notifications.dispatch] delivering notification"
        );

        sqlx::query("UPDATE notifications SET sent_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        delivered += 1;
    }

    Ok(delivered)
}
