//! Membership-change rounds.
//!
//! A round snapshots the members expected to acknowledge at its start and
//! completes once every one of them has replied (or gone away). Membership
//! changes during the round do not move the goalposts.

use crate::transport::ConnId;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RoundId(u64);

impl From<u64> for RoundId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round#{}", self.0)
    }
}

/// What to commit when a round completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Commit {
    Connect(ConnId),
    Disconnect(ConnId),
}

#[derive(Debug)]
pub(crate) struct Round {
    pub commit: Commit,
    expected: BTreeSet<ConnId>,
}

impl Round {
    pub fn is_complete(&self) -> bool {
        self.expected.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.expected.len()
    }
}

/// All rounds in flight on one node.
#[derive(Debug, Default)]
pub(crate) struct Rounds {
    next: u64,
    active: HashMap<RoundId, Round>,
}

impl Rounds {
    /// Open a round awaiting `expected`.
    pub fn open(&mut self, commit: Commit, expected: impl IntoIterator<Item = ConnId>) -> RoundId {
        let id = RoundId(self.next);
        self.next += 1;
        self.active.insert(
            id,
            Round {
                commit,
                expected: expected.into_iter().collect(),
            },
        );
        id
    }

    /// Credit `from` in `round`. Returns the commit if this completed it.
    pub fn acknowledge(&mut self, round: RoundId, from: ConnId) -> Option<Commit> {
        let entry = self.active.get_mut(&round)?;
        if !entry.expected.remove(&from) {
            tracing::warn!(%round, %from, "acknowledgement from a peer outside the round");
        }
        self.take_if_complete(round)
    }

    /// Drop `conn` from every round's expected set. Returns the commits of
    /// rounds this completed.
    pub fn forget(&mut self, conn: ConnId) -> Vec<Commit> {
        let touched: Vec<RoundId> = self
            .active
            .iter_mut()
            .filter_map(|(id, round)| round.expected.remove(&conn).then_some(*id))
            .collect();
        touched
            .into_iter()
            .filter_map(|id| self.take_if_complete(id))
            .collect()
    }

    pub fn get(&self, round: RoundId) -> Option<&Round> {
        self.active.get(&round)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn take_if_complete(&mut self, round: RoundId) -> Option<Commit> {
        if self.active.get(&round)?.is_complete() {
            self.active.remove(&round).map(|r| r.commit)
        } else {
            None
        }
    }
}
