//! Replay-time file handle table
//!
//! A captured OPEN is known only by its capturing thread until the matching
//! OPEN_RET names the file id that later READs and CLOSEs refer to. Each open
//! file is one [`HandleSlot`] that moves through
//! `Opening → Open { refs } → Closed`, first keyed by thread id and then,
//! exactly once, by file id.
//!
//! The registry lock is held only to find or re-key a slot and each slot's
//! lock only to read or update its state. Neither is held across a backend
//! call.

use crate::backend::BackendHandle;
use crate::error::{IoTraceError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Reference count of an open file with no reads in flight
pub const BASELINE_REFS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum HandleKey {
    /// Opened by this capture-time thread, OPEN_RET not seen yet
    Opening(i64),
    /// Keyed by the captured file id
    Open(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Opening { handle: BackendHandle },
    Open { handle: BackendHandle, refs: usize },
    Closed,
}

#[derive(Debug)]
pub(crate) struct HandleSlot {
    state: Mutex<SlotState>,
    released: Notify,
}

impl HandleSlot {
    fn new(state: SlotState) -> Self {
        Self {
            state: Mutex::new(state),
            released: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until no read holds a reference, then mark the slot closed
    ///
    /// Returns `None` if the slot was not open.
    async fn drain(&self) -> Option<BackendHandle> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut state = self.state();
                let current = *state;
                match current {
                    SlotState::Open { handle, refs } if refs <= BASELINE_REFS => {
                        *state = SlotState::Closed;
                        return Some(handle);
                    }
                    SlotState::Open { .. } => {}
                    _ => return None,
                }
            }

            released.await;
        }
    }
}

/// An open file unlinked from the table because its file id was reused
#[derive(Debug)]
pub(crate) struct DisplacedHandle {
    slot: Arc<HandleSlot>,
}

impl DisplacedHandle {
    /// Wait for reads still using the old file, then hand back its handle
    pub(crate) async fn drained(self) -> Option<BackendHandle> {
        self.slot.drain().await
    }
}

/// An in-flight read; holds a reference on its file until dropped
#[derive(Debug)]
pub(crate) struct ReadLease {
    slot: Arc<HandleSlot>,
    handle: BackendHandle,
}

impl ReadLease {
    pub(crate) fn handle(&self) -> BackendHandle {
        self.handle
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        let mut state = self.slot.state();
        if let SlotState::Open { refs, .. } = &mut *state {
            *refs = refs.saturating_sub(1);
        }
        drop(state);
        self.slot.released.notify_waiters();
    }
}

#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    slots: Mutex<HashMap<HandleKey, Arc<HandleSlot>>>,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<HandleKey, Arc<HandleSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a handle opened by `thread_id`
    ///
    /// Returns the handle of an earlier OPEN from the same thread that never
    /// saw its OPEN_RET; the caller owns it and should close it.
    pub(crate) fn insert_opening(&self, thread_id: i64, handle: BackendHandle) -> Option<BackendHandle> {
        let slot = Arc::new(HandleSlot::new(SlotState::Opening { handle }));
        let stale = self.slots().insert(HandleKey::Opening(thread_id), slot)?;
        let previous = std::mem::replace(&mut *stale.state(), SlotState::Closed);
        match previous {
            SlotState::Opening { handle } => Some(handle),
            _ => None,
        }
    }

    /// Re-key the pending open of `thread_id` under `file_id`
    ///
    /// If a still-open file already used `file_id`, it is unlinked from the
    /// table and returned; the caller owns it and should close its handle
    /// once [`DisplacedHandle::drained`] resolves.
    pub(crate) fn promote(&self, thread_id: i64, file_id: i64) -> Result<Option<DisplacedHandle>> {
        let mut slots = self.slots();
        let slot = slots
            .remove(&HandleKey::Opening(thread_id))
            .ok_or(IoTraceError::HandleNotFound(file_id))?;

        {
            let mut state = slot.state();
            let SlotState::Opening { handle } = *state else {
                return Err(IoTraceError::HandleNotFound(file_id));
            };
            *state = SlotState::Open {
                handle,
                refs: BASELINE_REFS,
            };
        }

        let displaced = slots.insert(HandleKey::Open(file_id), slot);
        Ok(displaced.map(|slot| DisplacedHandle { slot }))
    }

    /// Take a reference on `file_id` for the duration of one read
    pub(crate) fn acquire(&self, file_id: i64) -> Result<ReadLease> {
        let slot = self
            .slots()
            .get(&HandleKey::Open(file_id))
            .cloned()
            .ok_or(IoTraceError::HandleNotFound(file_id))?;

        let handle = {
            let mut state = slot.state();
            match &mut *state {
                SlotState::Open { handle, refs } => {
                    *refs += 1;
                    *handle
                }
                _ => return Err(IoTraceError::HandleNotFound(file_id)),
            }
        };
        Ok(ReadLease { slot, handle })
    }

    /// Wait for in-flight reads on `file_id` to finish, then mark it closed
    /// and drop it from the table
    ///
    /// Returns the backend handle to close.
    pub(crate) async fn close(&self, file_id: i64) -> Result<BackendHandle> {
        let key = HandleKey::Open(file_id);
        let slot = self
            .slots()
            .get(&key)
            .cloned()
            .ok_or(IoTraceError::HandleNotFound(file_id))?;

        let handle = slot
            .drain()
            .await
            .ok_or(IoTraceError::HandleNotFound(file_id))?;

        let mut slots = self.slots();
        if slots.get(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
            slots.remove(&key);
        }
        Ok(handle)
    }

    /// Number of slots in the table
    pub(crate) fn len(&self) -> usize {
        self.slots().len()
    }

    #[cfg(test)]
    pub(crate) fn refs(&self, file_id: i64) -> Option<usize> {
        let slot = self.slots().get(&HandleKey::Open(file_id)).cloned()?;
        let state = *slot.state();
        match state {
            SlotState::Open { refs, .. } => Some(refs),
            _ => None,
        }
    }
}
