//! Group storage: correlation key -> group, guarded by one lock per key.
//!
//! Lock ordering: a slot lock may be held while taking the table lock, never
//! the other way round. The table lock is only held for map lookups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use tracing::warn;

use crate::error::EngineError;
use crate::types::{CorrelationKey, GroupState, Message, MessageGroup};

/// Backend side of a held group lock. Implemented by each store for its own guard type.
pub trait GroupLock {
  fn group(&self) -> &MessageGroup;
  fn group_mut(&mut self) -> &mut MessageGroup;
  /// Take the group out. Anyone who later acquires this same lock must not see it as live.
  fn retire(self: Box<Self>) -> MessageGroup;
}

/// Exclusive access to one live group. Dropping it releases the key's lock.
pub struct LockedGroup {
  key: CorrelationKey,
  lock: Box<dyn GroupLock>,
}

impl LockedGroup {
  pub fn new(key: CorrelationKey, lock: Box<dyn GroupLock>) -> Self {
    Self { key, lock }
  }

  pub fn key(&self) -> &CorrelationKey {
    &self.key
  }

  pub fn group(&self) -> &MessageGroup {
    self.lock.group()
  }

  pub(crate) fn group_mut(&mut self) -> &mut MessageGroup {
    self.lock.group_mut()
  }

  /// Take the group out of its lock in `final_state`. Store backends call this from `remove`.
  pub fn retire(self, final_state: GroupState) -> MessageGroup {
    let mut group = self.lock.retire();
    group.set_state(final_state);
    group
  }
}

/// What `drain` took out of the store, plus the keys it had to leave behind.
#[derive(Debug, Default)]
pub struct Drained {
  pub groups: Vec<MessageGroup>,
  /// Groups still locked after the timeout. They stay live in the store.
  pub busy: Vec<CorrelationKey>,
}

/// Abstract group store. All operations are all-or-nothing.
pub trait MessageGroupStore: Send + Sync {
  /// Lock the group for `key`, creating it (pending, empty) if absent.
  fn fetch_or_create(
    &self,
    key: &CorrelationKey,
    now: DateTime<Utc>,
    timeout: Duration,
  ) -> Result<LockedGroup, EngineError>;

  /// Lock the group for `key` only if it exists.
  fn lock_existing(
    &self,
    key: &CorrelationKey,
    timeout: Duration,
  ) -> Result<Option<LockedGroup>, EngineError>;

  /// Append to a pending group the caller holds.
  fn append(
    &self,
    locked: &mut LockedGroup,
    message: Message,
    now: DateTime<Utc>,
  ) -> Result<(), EngineError> {
    let state = locked.group().state();
    if state != GroupState::Pending {
      return Err(EngineError::store(format!(
        "group {} is {:?}, cannot append",
        locked.key(),
        state
      )));
    }
    locked.group_mut().push(message, now);
    Ok(())
  }

  /// Delete the group, reclaim its lock entry and hand the group back in `final_state`.
  ///
  /// Infallible: the engine emits a released group's output before removing it,
  /// so a remove that could fail would let a later retry emit it twice. Backends
  /// that persist must make the deletion durable before handing out the lock.
  fn remove(&self, locked: LockedGroup, final_state: GroupState) -> MessageGroup;

  /// Remove and return every pending group not updated within `max_age` of `now`.
  fn sweep_expired(
    &self,
    max_age: chrono::Duration,
    now: DateTime<Utc>,
  ) -> Result<Vec<MessageGroup>, EngineError>;

  /// Remove and return every group, waiting up to `timeout` per group lock.
  ///
  /// Groups already removed are always returned; a group still locked after
  /// the timeout is left in place and reported in [`Drained::busy`].
  fn drain(&self, timeout: Duration) -> Result<Drained, EngineError>;

  /// Defensive copy of a group, for diagnostics.
  fn snapshot(&self, key: &CorrelationKey) -> Option<MessageGroup>;

  /// Live groups.
  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Live per-key lock entries.
  fn lock_count(&self) -> usize {
    self.len()
  }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

struct GroupSlot {
  group: MessageGroup,
  /// Set once the group has been removed; waiters must re-resolve the key.
  retired: bool,
}

type Slot = Arc<Mutex<GroupSlot>>;

struct SlotGuard(ArcMutexGuard<RawMutex, GroupSlot>);

impl GroupLock for SlotGuard {
  fn group(&self) -> &MessageGroup {
    &self.0.group
  }

  fn group_mut(&mut self) -> &mut MessageGroup {
    &mut self.0.group
  }

  fn retire(self: Box<Self>) -> MessageGroup {
    let mut guard = self.0;
    let placeholder = MessageGroup::new(guard.group.key().clone(), guard.group.created_at());
    let group = std::mem::replace(&mut guard.group, placeholder);
    guard.retired = true;
    group
  }
}

/// Lock table and group map in one structure: a slot is created together with
/// its group and dropped from the table together with it.
#[derive(Default)]
pub struct InMemoryGroupStore {
  table: Mutex<HashMap<CorrelationKey, Slot>>,
}

impl InMemoryGroupStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn slot_for(&self, key: &CorrelationKey, now: DateTime<Utc>) -> Slot {
    let mut table = self.table.lock();
    table
      .entry(key.clone())
      .or_insert_with(|| {
        Arc::new(Mutex::new(GroupSlot {
          group: MessageGroup::new(key.clone(), now),
          retired: false,
        }))
      })
      .clone()
  }

  fn existing_slot(&self, key: &CorrelationKey) -> Option<Slot> {
    self.table.lock().get(key).cloned()
  }

  fn slots(&self) -> Vec<(CorrelationKey, Slot)> {
    self
      .table
      .lock()
      .iter()
      .map(|(k, s)| (k.clone(), Arc::clone(s)))
      .collect()
  }

  fn locked(key: &CorrelationKey, guard: ArcMutexGuard<RawMutex, GroupSlot>) -> LockedGroup {
    LockedGroup::new(key.clone(), Box::new(SlotGuard(guard)))
  }

  fn timeout_error(key: &CorrelationKey, timeout: Duration) -> EngineError {
    EngineError::LockTimeout {
      key: key.clone(),
      waited: timeout,
    }
  }
}

impl MessageGroupStore for InMemoryGroupStore {
  fn fetch_or_create(
    &self,
    key: &CorrelationKey,
    now: DateTime<Utc>,
    timeout: Duration,
  ) -> Result<LockedGroup, EngineError> {
    let deadline = Instant::now() + timeout;
    loop {
      let slot = self.slot_for(key, now);
      let remaining = deadline.saturating_duration_since(Instant::now());
      let guard = slot
        .try_lock_arc_for(remaining)
        .ok_or_else(|| Self::timeout_error(key, timeout))?;
      if guard.retired {
        // Released or expired while we waited; the table already points elsewhere.
        continue;
      }
      return Ok(Self::locked(key, guard));
    }
  }

  fn lock_existing(
    &self,
    key: &CorrelationKey,
    timeout: Duration,
  ) -> Result<Option<LockedGroup>, EngineError> {
    let deadline = Instant::now() + timeout;
    loop {
      let slot = match self.existing_slot(key) {
        Some(s) => s,
        None => return Ok(None),
      };
      let remaining = deadline.saturating_duration_since(Instant::now());
      let guard = slot
        .try_lock_arc_for(remaining)
        .ok_or_else(|| Self::timeout_error(key, timeout))?;
      if guard.retired {
        continue;
      }
      return Ok(Some(Self::locked(key, guard)));
    }
  }

  fn remove(&self, locked: LockedGroup, final_state: GroupState) -> MessageGroup {
    // A non-retired slot is always the one the table holds for its key: the
    // entry is only deleted here, under the slot lock, just before retiring it.
    self.table.lock().remove(locked.key());
    locked.retire(final_state)
  }

  fn sweep_expired(
    &self,
    max_age: chrono::Duration,
    now: DateTime<Utc>,
  ) -> Result<Vec<MessageGroup>, EngineError> {
    let mut expired = Vec::new();
    for (key, slot) in self.slots() {
      // A group locked right now is mid-admit, so it is not stale.
      let guard = match slot.try_lock_arc() {
        Some(g) => g,
        None => continue,
      };
      if guard.retired
        || guard.group.state() != GroupState::Pending
        || now - guard.group.last_updated_at() <= max_age
      {
        continue;
      }
      expired.push(self.remove(Self::locked(&key, guard), GroupState::Expired));
    }
    Ok(expired)
  }

  fn drain(&self, timeout: Duration) -> Result<Drained, EngineError> {
    let mut drained = Drained::default();
    for (key, slot) in self.slots() {
      let guard = match slot.try_lock_arc_for(timeout) {
        Some(g) => g,
        None => {
          warn!(key = %key, waited_ms = timeout.as_millis() as u64, "group still locked, left in store");
          drained.busy.push(key);
          continue;
        }
      };
      if guard.retired {
        continue;
      }
      drained.groups.push(self.remove(Self::locked(&key, guard), GroupState::Expired));
    }
    Ok(drained)
  }

  fn snapshot(&self, key: &CorrelationKey) -> Option<MessageGroup> {
    let slot = self.existing_slot(key)?;
    let guard = slot.lock();
    if guard.retired {
      return None;
    }
    Some(guard.group.clone())
  }

  fn len(&self) -> usize {
    self.table.lock().len()
  }

  fn lock_count(&self) -> usize {
    // Slots are the locks; the table is the lock table.
    self.table.lock().len()
  }
}
