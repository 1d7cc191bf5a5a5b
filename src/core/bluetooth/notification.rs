//! Notification handling
//! One task per subscribed characteristic, each stoppable through its own
//! cancellation token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::backend::GattSession;
use crate::core::error::Result;

/// Receives every value a subscribed characteristic notifies
pub type NotificationCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

struct Subscription {
    id: u64,
    token: CancellationToken,
}

#[derive(Clone, Default)]
pub struct NotificationHandler {
    subscriptions: Arc<Mutex<HashMap<Uuid, Subscription>>>,
    next_id: Arc<AtomicU64>,
}

impl NotificationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts forwarding notifications of `characteristic` to `on_value`.
    /// A previous subscription to the same characteristic is replaced.
    pub async fn subscribe(
        &self,
        session: Arc<dyn GattSession>,
        characteristic: Uuid,
        on_value: NotificationCallback,
    ) -> Result<()> {
        info!("Subscribing to notifications of {}...", characteristic);
        let stream = session.notifications(characteristic).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let subscription = Subscription {
            id,
            token: token.clone(),
        };
        if let Some(previous) = self.lock().insert(characteristic, subscription) {
            previous.token.cancel();
        }

        let subscriptions = self.subscriptions.clone();
        tokio::spawn(async move {
            Self::process_notifications(characteristic, stream, on_value, token).await;
            let mut subscriptions = subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            // A resubscribe may have replaced the entry already
            if subscriptions.get(&characteristic).is_some_and(|s| s.id == id) {
                subscriptions.remove(&characteristic);
            }
        });
        Ok(())
    }

    async fn process_notifications(
        characteristic: Uuid,
        mut stream: crate::core::bluetooth::backend::NotificationStream,
        on_value: NotificationCallback,
        token: CancellationToken,
    ) {
        debug!("Listening for notifications on {}", characteristic);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(value)) => {
                        debug!("Received {} bytes from {}", value.len(), characteristic);
                        on_value(value);
                    }
                    Some(Err(e)) => {
                        error!("Error in notification stream: {}", e);
                        break;
                    }
                    None => break,
                },
            }
        }
        info!("Notification stream of {} ended", characteristic);
    }

    /// Returns false when there was no subscription to stop.
    pub fn unsubscribe(&self, characteristic: Uuid) -> bool {
        match self.lock().remove(&characteristic) {
            Some(subscription) => {
                subscription.token.cancel();
                info!("Unsubscribed from {}", characteristic);
                true
            }
            None => false,
        }
    }

    pub fn stop_notifications(&self) {
        let subscriptions = std::mem::take(&mut *self.lock());
        for subscription in subscriptions.into_values() {
            subscription.token.cancel();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
