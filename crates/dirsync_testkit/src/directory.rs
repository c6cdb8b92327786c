//! An in-memory directory that replays updates with conflict resolution.
//!
//! Payloads are CBOR: the attributes of the new entry for an add, a list of
//! modifications for a modify, the new DN for a rename, nothing for a
//! delete.

use dirsync_core::{
    apply_modifications, Csn, EntryAttributes, EntryHistorical, Modification, ResolutionOutcome,
};
use dirsync_engine::{normalized_rdns, ReplayHandler, ReplayOutcome};
use dirsync_protocol::{Opcode, UpdateMsg};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An entry with its replication metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Attribute values.
    pub attributes: EntryAttributes,
    /// Historical metadata.
    pub historical: EntryHistorical,
    /// CSN of the add that created the entry.
    pub created: Csn,
}

#[derive(Debug, Default)]
struct Entries {
    live: BTreeMap<String, StoredEntry>,
    deleted: BTreeMap<String, Csn>,
}

/// A directory held in memory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: RwLock<Entries>,
}

/// Encodes the payload of an add.
pub fn encode_entry(attributes: &EntryAttributes) -> Vec<u8> {
    encode(attributes)
}

/// Encodes the payload of a modify.
pub fn encode_modifications(mods: &[Modification]) -> Vec<u8> {
    encode(&mods)
}

/// Encodes the payload of a rename.
pub fn encode_new_dn(dn: &str) -> Vec<u8> {
    encode(&dn)
}

fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).expect("Failed to encode payload");
    out
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, String> {
    ciborium::from_reader(payload).map_err(|err| format!("undecodable payload: {err}"))
}

/// Lowercases a DN and strips spaces around RDNs.
pub fn normalize_dn(dn: &str) -> String {
    normalized_rdns(dn).join(",")
}

impl MemoryDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an operation made at `csn`, resolving conflicts with what the
    /// directory already saw.
    ///
    /// Used for local writes and for replay alike.
    pub fn apply(&self, csn: Csn, opcode: Opcode, dn: &str, payload: &[u8]) -> ReplayOutcome {
        let key = normalize_dn(dn);
        let result = match opcode {
            Opcode::Add => decode(payload).map(|attrs| self.add(csn, key, attrs)),
            Opcode::Delete => Ok(self.delete(csn, key)),
            Opcode::Modify => decode::<Vec<Modification>>(payload).map(|mods| self.modify(csn, &key, &mods)),
            Opcode::ModifyDn => {
                decode::<String>(payload).and_then(|new_dn| self.rename(&key, normalize_dn(&new_dn)))
            }
        };
        result.unwrap_or_else(ReplayOutcome::Failed)
    }

    fn add(&self, csn: Csn, key: String, attributes: EntryAttributes) -> ReplayOutcome {
        let mut entries = self.entries.write();
        if entries.deleted.get(&key).is_some_and(|deleted| *deleted >= csn) {
            return ReplayOutcome::NoOp;
        }
        // The oldest add of a DN wins.
        if entries.live.get(&key).is_some_and(|existing| existing.created <= csn) {
            return ReplayOutcome::NoOp;
        }
        let mut historical = EntryHistorical::new();
        historical.record_add_entry(csn, &attributes);
        entries.live.insert(
            key,
            StoredEntry {
                attributes,
                historical,
                created: csn,
            },
        );
        ReplayOutcome::Applied
    }

    fn delete(&self, csn: Csn, key: String) -> ReplayOutcome {
        let mut entries = self.entries.write();
        match entries.live.get(&key) {
            Some(existing) if existing.created <= csn => {
                entries.live.remove(&key);
                let tombstone = entries.deleted.entry(key).or_insert(csn);
                *tombstone = (*tombstone).max(csn);
                ReplayOutcome::Applied
            }
            _ => ReplayOutcome::NoOp,
        }
    }

    fn modify(&self, csn: Csn, key: &str, mods: &[Modification]) -> ReplayOutcome {
        let mut entries = self.entries.write();
        let Some(entry) = entries.live.get_mut(key) else {
            return ReplayOutcome::NoOp;
        };
        let resolution = entry.historical.resolve(csn, mods, &entry.attributes);
        apply_modifications(&mut entry.attributes, &resolution.mods);
        match resolution.outcome {
            ResolutionOutcome::NoOp => ReplayOutcome::NoOp,
            ResolutionOutcome::Applied | ResolutionOutcome::Partial => ReplayOutcome::Applied,
        }
    }

    fn rename(&self, key: &str, new_key: String) -> Result<ReplayOutcome, String> {
        let mut entries = self.entries.write();
        if key == new_key {
            return Ok(ReplayOutcome::NoOp);
        }
        if entries.live.contains_key(&new_key) {
            return Err(format!("entry {new_key} already exists"));
        }
        match entries.live.remove(key) {
            Some(entry) => {
                entries.live.insert(new_key, entry);
                Ok(ReplayOutcome::Applied)
            }
            None => Ok(ReplayOutcome::NoOp),
        }
    }

    /// Attributes of the entry at `dn`.
    pub fn entry(&self, dn: &str) -> Option<EntryAttributes> {
        self.entries
            .read()
            .live
            .get(&normalize_dn(dn))
            .map(|entry| entry.attributes.clone())
    }

    /// The entry at `dn` with its metadata.
    pub fn stored(&self, dn: &str) -> Option<StoredEntry> {
        self.entries.read().live.get(&normalize_dn(dn)).cloned()
    }

    /// Every entry's attributes, keyed by normalized DN.
    pub fn snapshot(&self) -> BTreeMap<String, EntryAttributes> {
        self.entries
            .read()
            .live
            .iter()
            .map(|(dn, entry)| (dn.clone(), entry.attributes.clone()))
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().live.len()
    }

    /// Returns true if the directory holds no entry.
    pub fn is_empty(&self) -> bool {
        self.entries.read().live.is_empty()
    }

    /// Drops historical facts and tombstones older than `floor`.
    ///
    /// Returns the number of facts removed.
    pub fn purge_historical(&self, floor: Csn) -> usize {
        let mut entries = self.entries.write();
        let mut removed = 0;
        for entry in entries.live.values_mut() {
            removed += entry.historical.purge(floor);
        }
        let before = entries.deleted.len();
        entries.deleted.retain(|_, csn| *csn >= floor);
        removed + before - entries.deleted.len()
    }
}

impl ReplayHandler for MemoryDirectory {
    fn replay(&self, msg: &UpdateMsg) -> ReplayOutcome {
        self.apply(msg.csn, msg.opcode, &msg.target_dn, &msg.payload)
    }
}
