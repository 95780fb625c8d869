//! Session registry and lifecycle engine: handle allocation,
//! harvesting, owner-lost cancellation, same-service-and-user supersession.

use crate::config::ConfigOverlay;
use crate::error::RegistryError;
use crate::session::{Session, SessionState};

/// Fixed-capacity sparse array of session slots. A separate
/// `live` vector gives O(live) iteration for `harvest`/`owner_lost`/
/// `stop_similar` without walking the whole `MAX`-sized backing array.
pub struct SessionRegistry {
    max: usize,
    slots: Vec<Option<Session>>,
    live: Vec<i32>,
    next_available_cursor: usize,
}

impl SessionRegistry {
    /// Default registry capacity (256), overridable for tests.
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(max: usize) -> Self {
        Self {
            max,
            slots: (0..max).map(|_| None).collect(),
            live: Vec::new(),
            next_available_cursor: 0,
        }
    }

    /// Harvests first, then writes a fresh `Session` into the smallest free
    /// slot and returns its handle. The caller fills in `username`, `config`,
    /// `owner_tag` and `commitment` via [`get_mut`](Self::get_mut) before
    /// starting the orchestrator.
    pub fn allocate(&mut self) -> Result<i32, RegistryError> {
        self.harvest();

        while self.next_available_cursor < self.max
            && self.slots[self.next_available_cursor].is_some()
        {
            self.next_available_cursor += 1;
        }
        if self.next_available_cursor >= self.max {
            return Err(RegistryError::Exhausted);
        }

        let handle = self.next_available_cursor as i32;
        self.slots[handle as usize] = Some(Session::new(
            handle,
            String::new(),
            None,
            ConfigOverlay::new(),
            [0u8; 32],
        ));
        self.live.push(handle);
        self.next_available_cursor += 1;
        Ok(handle)
    }

    /// Detaches `handle` from the live list and frees its slot. Lowers the
    /// allocation cursor so the freed slot is reused before higher ones.
    pub fn remove(&mut self, handle: i32) {
        if handle < 0 || handle as usize >= self.max {
            return;
        }
        if self.slots[handle as usize].take().is_some() {
            self.live.retain(|&h| h != handle);
            self.next_available_cursor = self.next_available_cursor.min(handle as usize);
        }
    }

    pub fn get(&self, handle: i32) -> Option<&Session> {
        if handle < 0 || handle as usize >= self.max {
            return None;
        }
        self.slots[handle as usize].as_ref()
    }

    pub fn get_mut(&mut self, handle: i32) -> Option<&mut Session> {
        if handle < 0 || handle as usize >= self.max {
            return None;
        }
        self.slots[handle as usize].as_mut()
    }

    /// Removes every live session currently in `Harvestable`.
    pub fn harvest(&mut self) {
        let dead: Vec<i32> = self
            .live
            .iter()
            .copied()
            .filter(|&h| {
                matches!(
                    self.slots[h as usize].as_ref().map(|s| s.state),
                    Some(SessionState::Harvestable)
                )
            })
            .collect();
        for h in dead {
            self.remove(h);
        }
    }

    /// Returns the handles of every live session belonging to `owner_tag`
    /// that is still in a pre-`Completed` state — i.e. one still holding a
    /// running orchestrator whose owner's loss should cancel it. `Completed`,
    /// `Continuing`, and `Harvestable` are all reached only after a
    /// successful handshake (or, for `Harvestable`, after the session has
    /// already resolved one way or another) and are excluded: a continuous
    /// session surviving its starting caller's exit is the entire point of
    /// continuous mode. The caller is responsible for actually stopping
    /// those orchestrators; this method only identifies them, since the
    /// registry does not own orchestrator handles.
    pub fn owner_lost(&self, owner_tag: &str) -> Vec<i32> {
        self.live
            .iter()
            .copied()
            .filter(|&h| {
                self.slots[h as usize].as_ref().is_some_and(|s| {
                    s.owner_tag.as_deref() == Some(owner_tag)
                        && !matches!(
                            s.state,
                            SessionState::Completed | SessionState::Continuing | SessionState::Harvestable
                        )
                })
            })
            .collect()
    }

    /// Returns the handles of every OTHER live `Continuing` session sharing
    /// `new_session`'s username and service commitment — candidates a fresh
    /// lock-screen session supersedes.
    pub fn stop_similar(&self, new_session: &Session) -> Vec<i32> {
        self.live
            .iter()
            .copied()
            .filter(|&h| h != new_session.handle)
            .filter(|&h| {
                self.slots[h as usize].as_ref().is_some_and(|s| {
                    s.state == SessionState::Continuing
                        && s.username == new_session.username
                        && s.commitment == new_session.commitment
                })
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
