//! [`ResourceRegistry`] – per-resource mode bookkeeping.
//!
//! The registry records, for every resource a mode-setting command has
//! touched, the active [`PinMode`], an optional UI tag and the
//! [`CallbackHandle`] of the callback the device was given for that mode.
//!
//! # Transitions
//!
//! Any mode may follow any mode. [`ResourceRegistry::set_mode`] simply
//! overwrites the previous entry, the same way re-configuring a physical pin
//! does.
//!
//! # Stale events
//!
//! Each callback handed to the device carries a handle from
//! [`ResourceRegistry::issue_handle`]. Once a resource is reconfigured its old
//! handle stops being current, and [`ResourceRegistry::is_current`] lets the
//! report path discard events that were queued under the previous mode.

use std::collections::BTreeMap;
use std::fmt;

use pinbus_types::{PinMode, ResourceId};

/// Opaque identity of one callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackHandle(u64);

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// Mode-specific metadata stored alongside the mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeMetadata {
    pub tag: Option<String>,
    pub callback: Option<CallbackHandle>,
}

impl ModeMetadata {
    pub fn tagged(tag: Option<String>) -> Self {
        Self { tag, callback: None }
    }

    pub fn with_callback(mut self, handle: CallbackHandle) -> Self {
        self.callback = Some(handle);
        self
    }
}

/// Observable state of one resource. The callback handle is deliberately
/// left out: it changes on every configuration even when nothing visible
/// does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceView {
    pub id: ResourceId,
    pub mode: PinMode,
    pub tag: Option<String>,
}

#[derive(Debug, Clone)]
struct Entry {
    mode: PinMode,
    metadata: ModeMetadata,
}

/// Mode table owned by a single dispatch loop; no interior locking.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    entries: BTreeMap<ResourceId, Entry>,
    next_handle: u64,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh callback handle. Handles are never reused.
    pub fn issue_handle(&mut self) -> CallbackHandle {
        self.next_handle += 1;
        CallbackHandle(self.next_handle)
    }

    /// Record `mode` as the active mode of `id`, replacing whatever was
    /// there before.
    pub fn set_mode(&mut self, id: ResourceId, mode: PinMode, metadata: ModeMetadata) {
        self.entries.insert(id, Entry { mode, metadata });
    }

    /// Active mode of `id`, or [`PinMode::Unconfigured`] if never set.
    pub fn get_mode(&self, id: ResourceId) -> PinMode {
        self.entries
            .get(&id)
            .map(|entry| entry.mode)
            .unwrap_or_default()
    }

    pub fn tag(&self, id: ResourceId) -> Option<&str> {
        self.entries
            .get(&id)
            .and_then(|entry| entry.metadata.tag.as_deref())
    }

    pub fn callback(&self, id: ResourceId) -> Option<CallbackHandle> {
        self.entries.get(&id).and_then(|entry| entry.metadata.callback)
    }

    /// Whether `handle` is the callback of the current mode of `id`.
    pub fn is_current(&self, id: ResourceId, handle: CallbackHandle) -> bool {
        self.callback(id) == Some(handle)
    }

    pub fn describe(&self, id: ResourceId) -> Option<ResourceView> {
        self.entries.get(&id).map(|entry| ResourceView {
            id,
            mode: entry.mode,
            tag: entry.metadata.tag.clone(),
        })
    }

    /// Every configured resource, in resource order.
    pub fn snapshot(&self) -> Vec<ResourceView> {
        self.entries
            .keys()
            .filter_map(|id| self.describe(*id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
