//! Per-session decode context and attribute bags.

use dashmap::DashMap;
use netsession_wire::{ByteAccumulator, FrameCodec};
use std::any::Any;
use std::sync::Arc;

/// Value stored in an attribute bag
pub type AttributeValue = Arc<dyn Any + Send + Sync>;

/// String-keyed bag of shared values, used by sessions and groups
#[derive(Default)]
pub struct Attributes {
    map: DashMap<String, AttributeValue>,
}

impl std::fmt::Debug for Attributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attributes")
            .field("len", &self.map.len())
            .finish()
    }
}

impl Attributes {
    /// Empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, returning the previous one
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Option<AttributeValue> {
        self.map.insert(key.into(), Arc::new(value))
    }

    /// Typed lookup; `None` if missing or of another type
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.map.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    /// Untyped lookup
    pub fn get_raw(&self, key: &str) -> Option<AttributeValue> {
        self.map.get(key).map(|v| v.value().clone())
    }

    /// Remove a value
    pub fn remove(&self, key: &str) -> Option<AttributeValue> {
        self.map.remove(key).map(|(_, v)| v)
    }

    /// Whether `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Snapshot of the keys
    pub fn keys(&self) -> Vec<String> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Remove everything
    pub fn clear(&self) {
        self.map.clear();
    }
}

/// Reassembly state owned by the read task: the accumulator plus the codec's
/// frame-in-progress
pub(crate) struct DecodeContext<C: FrameCodec> {
    pub(crate) accumulator: ByteAccumulator,
    pub(crate) state: C::State,
}

impl<C: FrameCodec> Default for DecodeContext<C> {
    fn default() -> Self {
        Self {
            accumulator: ByteAccumulator::new(),
            state: C::State::default(),
        }
    }
}

impl<C: FrameCodec> DecodeContext<C> {
    pub(crate) fn reset(&mut self) {
        self.accumulator.clear();
        self.state = C::State::default();
    }
}
