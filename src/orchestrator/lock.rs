//! Single writer per conversation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::config::BusyPolicy;
use crate::error::{OrchestratorError, Result};

type Slot = Arc<AsyncMutex<()>>;

/// Per-conversation leases. Entries are dropped once nobody holds or waits on them.
#[derive(Debug)]
pub struct ConversationLocks {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    policy: BusyPolicy,
    wait: Duration,
}

/// Held for the lifetime of a turn.
#[derive(Debug)]
pub struct ConversationLease {
    id: String,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ConversationLocks {
    pub fn new(policy: BusyPolicy, wait: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            policy,
            wait,
        }
    }

    pub async fn acquire(&self, conversation_id: &str) -> Result<ConversationLease> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let busy = || OrchestratorError::ConversationBusy(conversation_id.to_string());
        let guard = match self.policy {
            BusyPolicy::Reject => slot.clone().try_lock_owned().map_err(|_| busy()),
            BusyPolicy::Queue => {
                debug!(conversation_id, "waiting for conversation lease");
                tokio::time::timeout(self.wait, slot.clone().lock_owned())
                    .await
                    .map_err(|_| busy())
            }
        };
        // a failed attempt still builds a lease so its drop cleans up the slot
        let lease = ConversationLease {
            id: conversation_id.to_string(),
            slots: self.slots.clone(),
            slot,
            guard: None,
        };
        match guard {
            Ok(guard) => {
                let mut lease = lease;
                lease.guard = Some(guard);
                Ok(lease)
            }
            Err(err) => {
                drop(lease);
                Err(err)
            }
        }
    }

    pub fn active(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl ConversationLease {
    pub fn conversation_id(&self) -> &str {
        &self.id
    }
}

impl Drop for ConversationLease {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        // map + this lease: nobody else holds or waits
        if Arc::strong_count(&self.slot) <= 2 {
            slots.remove(&self.id);
        }
    }
}
