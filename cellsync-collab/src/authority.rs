//! Server-side authoritative document.
//!
//! Holds the committed snapshot, its version, and the log of committed
//! operations. An operation generated against version `v` is transformed
//! past `log[v..]` before it is applied, so concurrent edits are merged in
//! commit order.
//!
//! Each attached participant has a floor: the oldest version it can still
//! submit against (its join version, then the base of its latest submit).
//! Log entries below the lowest floor are dropped.

use std::collections::HashMap;

use cellsync_core::ot::{self, Component, OtError, Side};
use cellsync_core::ParticipantId;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("operation based on version {base}, document is at {current}")]
    FutureVersion { base: u64, current: u64 },
    #[error("operation based on version {base}, history starts at {oldest}")]
    StaleVersion { base: u64, oldest: u64 },
    #[error(transparent)]
    Apply(#[from] OtError),
}

pub struct Authority {
    snapshot: Value,
    version: u64,
    /// Version the first log entry was applied to.
    log_start: u64,
    log: Vec<Vec<Component>>,
    floors: HashMap<ParticipantId, u64>,
}

impl Authority {
    pub fn new(snapshot: Value) -> Self {
        Self {
            snapshot,
            version: 0,
            log_start: 0,
            log: Vec::new(),
            floors: HashMap::new(),
        }
    }

    pub fn snapshot(&self) -> &Value {
        &self.snapshot
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of committed operations still kept for rebasing.
    pub fn history_len(&self) -> usize {
        self.log.len()
    }

    /// Start tracking a participant that received the current snapshot.
    pub fn attach(&mut self, participant: ParticipantId) {
        self.floors.insert(participant, self.version);
    }

    pub fn detach(&mut self, participant: &ParticipantId) {
        if self.floors.remove(participant).is_some() {
            self.compact();
        }
    }

    /// Commit an operation `from` generated against `base`.
    ///
    /// Returns the new version and the operation as it was applied. An
    /// operation whose components were all dropped by transformation still
    /// commits, so the submitter gets its acknowledgement.
    pub fn submit(
        &mut self,
        from: ParticipantId,
        base: u64,
        ops: Vec<Component>,
    ) -> Result<(u64, Vec<Component>), AuthorityError> {
        if base > self.version {
            return Err(AuthorityError::FutureVersion { base, current: self.version });
        }
        let Some(behind) = base.checked_sub(self.log_start) else {
            return Err(AuthorityError::StaleVersion { base, oldest: self.log_start });
        };
        let rebased = self.log[behind as usize..]
            .iter()
            .fold(ops, |op, committed| ot::transform(&op, committed, Side::Left));
        ot::apply(&mut self.snapshot, &rebased)?;
        self.version += 1;
        self.log.push(rebased.clone());
        log::trace!("Committed version {} ({} components)", self.version, rebased.len());

        if let Some(floor) = self.floors.get_mut(&from) {
            *floor = (*floor).max(base);
        }
        self.compact();
        Ok((self.version, rebased))
    }

    fn compact(&mut self) {
        // Untracked submitters (benchmarks, direct use) keep the full log.
        let Some(floor) = self.floors.values().copied().min() else {
            return;
        };
        if floor > self.log_start {
            self.log.drain(..(floor - self.log_start) as usize);
            self.log_start = floor;
        }
    }
}
