use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::UnixTimeMs;

/// A mutation recorded while offline, replayed on reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineAction {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: String,
    pub payload: serde_json::Value,
    pub enqueued_at: UnixTimeMs,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl OfflineAction {
    pub fn new(
        action_type: impl Into<String>,
        payload: serde_json::Value,
        max_retries: u32,
        enqueued_at: UnixTimeMs,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action_type: action_type.into(),
            payload,
            enqueued_at,
            retry_count: 0,
            max_retries,
        }
    }

    /// No attempts left.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Bounded FIFO of pending actions. Pushing past capacity evicts the oldest.
#[derive(Debug, Clone)]
pub struct ActionQueue {
    actions: VecDeque<OfflineAction>,
    capacity: usize,
}

impl ActionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            actions: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Rebuild from persisted actions, oldest first. Entries beyond capacity
    /// are dropped from the front and returned.
    pub fn restore(actions: Vec<OfflineAction>, capacity: usize) -> (Self, Vec<OfflineAction>) {
        let mut queue = Self::new(capacity);
        let mut evicted = Vec::new();
        for action in actions {
            if let Some(old) = queue.push(action) {
                evicted.push(old);
            }
        }
        (queue, evicted)
    }

    pub fn push(&mut self, action: OfflineAction) -> Option<OfflineAction> {
        let evicted = if self.actions.len() >= self.capacity {
            self.actions.pop_front()
        } else {
            None
        };
        self.actions.push_back(action);
        evicted
    }

    pub fn get(&self, id: &str) -> Option<&OfflineAction> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<OfflineAction> {
        let index = self.actions.iter().position(|a| a.id == id)?;
        self.actions.remove(index)
    }

    /// Count one failed attempt. Returns the updated action.
    pub fn record_failure(&mut self, id: &str) -> Option<&OfflineAction> {
        let action = self.actions.iter_mut().find(|a| a.id == id)?;
        action.retry_count = action.retry_count.saturating_add(1);
        Some(action)
    }

    pub fn ids(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.id.clone()).collect()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.actions.len();
        self.actions.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &OfflineAction> {
        self.actions.iter()
    }

    pub fn to_vec(&self) -> Vec<OfflineAction> {
        self.actions.iter().cloned().collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.actions)
    }

    pub fn decode(bytes: &[u8]) -> Result<Vec<OfflineAction>, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
