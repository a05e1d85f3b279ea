use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;
use tracing::debug;

use crate::mailbox::{Mailbox, OfferError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable handle for one connection. Allocated from a process-wide counter,
/// so an id is never handed out twice while the process lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} is already registered")]
    DuplicateIdentity(SessionId),
}

#[derive(Debug)]
pub struct SessionRecord {
    alias: String,
    mailbox: Mailbox,
}

impl SessionRecord {
    /// Closes the session's mailbox and hands back its alias.
    pub fn close(self) -> String {
        self.mailbox.close();
        self.alias
    }
}

/// Active sessions. Owned by the broker task; nothing else touches it.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<SessionId, SessionRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an active session. On a duplicate id the new mailbox is
    /// dropped, which closes it, and the existing entry is left alone.
    pub fn insert(
        &mut self,
        id: SessionId,
        alias: String,
        mailbox: Mailbox,
    ) -> Result<(), RegistryError> {
        if self.sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateIdentity(id));
        }
        self.sessions.insert(id, SessionRecord { alias, mailbox });
        Ok(())
    }

    pub fn remove(&mut self, id: SessionId) -> Option<SessionRecord> {
        self.sessions.remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// `(id, alias)` pairs ordered by id.
    pub fn roster(&self) -> Vec<(SessionId, String)> {
        let mut roster: Vec<_> = self
            .sessions
            .iter()
            .map(|(id, record)| (*id, record.alias.clone()))
            .collect();
        roster.sort_by_key(|(id, _)| *id);
        roster
    }

    /// Removes every session, ordered by id.
    pub fn drain(&mut self) -> Vec<(SessionId, SessionRecord)> {
        let mut drained: Vec<_> = self.sessions.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    /// Offers `line` to every mailbox and returns the sessions whose mailbox
    /// was full. Those sessions missed the line and should be evicted.
    pub fn fan_out(&self, line: &str) -> Vec<SessionId> {
        let mut overflowed = Vec::new();
        for (id, record) in &self.sessions {
            match record.mailbox.offer(line.to_owned()) {
                Ok(()) => {}
                Err(OfferError::Full) => overflowed.push(*id),
                Err(OfferError::Closed) => {
                    // Writer already stopped; the connection's teardown will send a Leave.
                    debug!(%id, "skipping closed mailbox");
                }
            }
        }
        overflowed.sort();
        overflowed
    }
}
