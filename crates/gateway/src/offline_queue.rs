//! FIFO offline queue per recipient, backed by the registry's list
//! primitives.
//!
//! Two lists per recipient: `<base>:<id>:queued` (pending) and
//! `<base>:<id>:processing` (in-flight). Both keys get their TTL refreshed on
//! every touch.

use std::sync::Arc;
use std::time::Duration;

use common::UmfMessage;
use registry_client::Registry;

use crate::error::Result;

/// Default key base for the offline queue.
pub const DEFAULT_QUEUE_BASE: &str = "hydra-router:message:queue";

/// Queue keys live for 24 hours unless touched.
const QUEUE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct OfflineQueue {
    registry: Arc<dyn Registry>,
    base: String,
}

impl OfflineQueue {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            base: DEFAULT_QUEUE_BASE.to_string(),
        }
    }

    fn queued_key(&self, id: &str) -> String {
        format!("{}:{}:queued", self.base, id)
    }

    fn processing_key(&self, id: &str) -> String {
        format!("{}:{}:processing", self.base, id)
    }

    /// Append a message for an offline recipient.
    pub async fn enqueue(&self, id: &str, msg: &UmfMessage) -> Result<()> {
        let key = self.queued_key(id);
        self.registry.list_push(&key, &msg.to_json()?).await?;
        self.registry.set_expiry(&key, QUEUE_TTL).await?;
        Ok(())
    }

    /// Atomically move the oldest pending message to `processing`.
    pub async fn dequeue(&self, id: &str) -> Result<Option<String>> {
        let queued = self.queued_key(id);
        let processing = self.processing_key(id);
        let moved = self.registry.list_move_head(&queued, &processing).await?;
        if moved.is_some() {
            self.registry.set_expiry(&queued, QUEUE_TTL).await?;
            self.registry.set_expiry(&processing, QUEUE_TTL).await?;
        }
        Ok(moved)
    }

    /// Remove one delivered message from `processing`.
    pub async fn complete(&self, id: &str, raw: &str) -> Result<()> {
        let processing = self.processing_key(id);
        self.registry.list_remove(&processing, raw).await?;
        self.registry.set_expiry(&processing, QUEUE_TTL).await?;
        Ok(())
    }
}
