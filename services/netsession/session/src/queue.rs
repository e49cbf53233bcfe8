//! Bounded FIFO queues with overflow policies.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// What happens when an item arrives at a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the new item and report an error
    #[default]
    KeepDefault,
    /// Reject the new item silently
    KeepOld,
    /// Evict the oldest item, then accept the new one
    KeepNew,
}

impl OverflowPolicy {
    fn to_u8(self) -> u8 {
        match self {
            OverflowPolicy::KeepDefault => 0,
            OverflowPolicy::KeepOld => 1,
            OverflowPolicy::KeepNew => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => OverflowPolicy::KeepOld,
            2 => OverflowPolicy::KeepNew,
            _ => OverflowPolicy::KeepDefault,
        }
    }
}

/// Depth bound and overflow policy for one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued items, 0 for unbounded
    pub max_depth: usize,
    /// Overflow policy
    pub policy: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl QueueConfig {
    /// No depth limit
    pub fn unbounded() -> Self {
        Self {
            max_depth: 0,
            policy: OverflowPolicy::KeepDefault,
        }
    }

    /// Bounded queue
    pub fn bounded(max_depth: usize, policy: OverflowPolicy) -> Self {
        Self { max_depth, policy }
    }
}

/// Result of [`SessionQueue::push`]
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// Item queued
    Accepted,
    /// Item queued after evicting the returned oldest item
    Evicted(T),
    /// Queue full; the item is handed back
    Rejected(T),
}

/// Mutex-guarded FIFO with a runtime-adjustable bound
#[derive(Debug)]
pub struct SessionQueue<T> {
    items: Mutex<VecDeque<T>>,
    max_depth: AtomicUsize,
    policy: AtomicU8,
}

impl<T> Default for SessionQueue<T> {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl<T> SessionQueue<T> {
    /// Create an empty queue
    pub fn new(config: QueueConfig) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            max_depth: AtomicUsize::new(config.max_depth),
            policy: AtomicU8::new(config.policy.to_u8()),
        }
    }

    /// Append `item`, applying the overflow policy when full
    pub fn push(&self, item: T) -> PushOutcome<T> {
        let max = self.max_depth();
        let mut items = self.items.lock();
        if max == 0 || items.len() < max {
            items.push_back(item);
            return PushOutcome::Accepted;
        }
        match self.policy() {
            OverflowPolicy::KeepNew => {
                let oldest = items.pop_front();
                items.push_back(item);
                match oldest {
                    Some(oldest) => PushOutcome::Evicted(oldest),
                    None => PushOutcome::Accepted,
                }
            }
            OverflowPolicy::KeepOld | OverflowPolicy::KeepDefault => PushOutcome::Rejected(item),
        }
    }

    /// Remove the oldest item
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Inspect the oldest item without removing it
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.items.lock().front().map(f)
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// True when bounded and at capacity
    pub fn is_full(&self) -> bool {
        let max = self.max_depth();
        max > 0 && self.len() >= max
    }

    /// Drop every queued item, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let n = items.len();
        items.clear();
        n
    }

    /// Current depth bound, 0 for unbounded
    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::Acquire)
    }

    /// Change the depth bound. Items already queued beyond it are kept.
    pub fn set_max_depth(&self, max_depth: usize) {
        self.max_depth.store(max_depth, Ordering::Release);
    }

    /// Current overflow policy
    pub fn policy(&self) -> OverflowPolicy {
        OverflowPolicy::from_u8(self.policy.load(Ordering::Acquire))
    }

    /// Change the overflow policy
    pub fn set_policy(&self, policy: OverflowPolicy) {
        self.policy.store(policy.to_u8(), Ordering::Release);
    }
}
