use std::collections::BTreeMap;

use common::{Expiry, StickyRecord};
use serde::{Deserialize, Serialize};

/// Result of [`StickyLedger::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// The record for the owner was installed or replaced.
    Installed,
    /// The owner already held a live record and overwrite was not requested.
    Kept(Expiry),
}

/// Named pins held on one replica, one expiry per owner.
///
/// Expired records stay in the map until the next call that purges them;
/// liveness is always evaluated against the caller's `now`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StickyLedger {
    records: BTreeMap<String, Expiry>,
}

impl StickyLedger {
    pub fn from_records(records: impl IntoIterator<Item = StickyRecord>) -> Self {
        let mut ledger = Self::default();
        for record in records {
            ledger.records.insert(record.owner, record.expiry);
        }
        ledger
    }

    pub fn set(&mut self, owner: &str, expiry: Expiry, overwrite: bool, now: u64) -> PinOutcome {
        self.purge_expired(now);

        if !overwrite && let Some(existing) = self.records.get(owner) {
            return PinOutcome::Kept(*existing);
        }

        if expiry.is_live(now) {
            self.records.insert(owner.to_string(), expiry);
        } else {
            self.records.remove(owner);
        }
        PinOutcome::Installed
    }

    pub fn clear(&mut self, owner: &str, now: u64) -> PinOutcome {
        self.set(owner, Expiry::EXPIRED, true, now)
    }

    pub fn is_pinned(&self, now: u64) -> bool {
        self.records.values().any(|expiry| expiry.is_live(now))
    }

    pub fn is_pinned_by(&self, owner: &str, now: u64) -> bool {
        self.records
            .get(owner)
            .is_some_and(|expiry| expiry.is_live(now))
    }

    pub fn expiry_of(&self, owner: &str) -> Option<Expiry> {
        self.records.get(owner).copied()
    }

    /// Drops expired records and returns them.
    pub fn purge_expired(&mut self, now: u64) -> Vec<StickyRecord> {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|(_, expiry)| !expiry.is_live(now))
            .map(|(owner, _)| owner.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|owner| {
                self.records
                    .remove(&owner)
                    .map(|expiry| StickyRecord::new(owner, expiry))
            })
            .collect()
    }

    pub fn records(&self) -> Vec<StickyRecord> {
        self.records
            .iter()
            .map(|(owner, expiry)| StickyRecord::new(owner.clone(), *expiry))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
