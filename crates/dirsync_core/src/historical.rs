//! Attribute-level conflict resolution.
//!
//! Every entry carries an [`EntryHistorical`]: for each attribute, the CSN of
//! the last attribute-wide delete or replace, and for each value the CSN of
//! its last add or delete. Before a replicated modification is applied,
//! [`EntryHistorical::resolve`] drops or rewrites the parts that are older
//! than what the entry already reflects, so replicas converge whatever order
//! they receive concurrent modifications in.
//!
//! Historical text form, one line per fact:
//!
//! ```text
//! <attr>:<csn>:add:<value>      value added
//! <attr>:<csn>:del:<value>      value deleted
//! <attr>:<csn>:attrDel          whole attribute deleted
//! <attr>:<csn>:repl:<value>     attribute replaced; one value of the replace
//! ```
//!
//! A replace is stored as one `repl` line for its first value plus `add`
//! lines for the rest.

use crate::csn::Csn;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Attribute values of an entry.
pub type EntryAttributes = BTreeMap<String, BTreeSet<String>>;

/// Kind of an attribute modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModKind {
    /// Add values.
    Add,
    /// Delete values, or the whole attribute if no value is given.
    Delete,
    /// Replace all values; no value deletes the attribute.
    Replace,
}

/// One attribute modification of a modify operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// What the modification does.
    pub kind: ModKind,
    /// Attribute name.
    pub attribute: String,
    /// Values concerned.
    pub values: Vec<String>,
}

impl Modification {
    fn new<I, S>(kind: ModKind, attribute: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            attribute: attribute.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Adds `values` to `attribute`.
    pub fn add<I: IntoIterator<Item = S>, S: Into<String>>(attribute: &str, values: I) -> Self {
        Self::new(ModKind::Add, attribute, values)
    }

    /// Deletes `values` from `attribute`; no values deletes the attribute.
    pub fn delete<I: IntoIterator<Item = S>, S: Into<String>>(attribute: &str, values: I) -> Self {
        Self::new(ModKind::Delete, attribute, values)
    }

    /// Deletes the whole attribute.
    #[must_use]
    pub fn delete_attribute(attribute: &str) -> Self {
        Self::new(ModKind::Delete, attribute, Vec::<String>::new())
    }

    /// Replaces the values of `attribute`.
    pub fn replace<I: IntoIterator<Item = S>, S: Into<String>>(attribute: &str, values: I) -> Self {
        Self::new(ModKind::Replace, attribute, values)
    }
}

/// Applies modifications to an entry, in order.
pub fn apply_modifications(entry: &mut EntryAttributes, mods: &[Modification]) {
    for m in mods {
        match m.kind {
            ModKind::Add => {
                entry
                    .entry(m.attribute.clone())
                    .or_default()
                    .extend(m.values.iter().cloned());
            }
            ModKind::Delete if m.values.is_empty() => {
                entry.remove(&m.attribute);
            }
            ModKind::Delete => {
                if let Some(values) = entry.get_mut(&m.attribute) {
                    for value in &m.values {
                        values.remove(value);
                    }
                }
            }
            ModKind::Replace => {
                entry.insert(m.attribute.clone(), m.values.iter().cloned().collect());
            }
        }
        if entry.get(&m.attribute).is_some_and(BTreeSet::is_empty) {
            entry.remove(&m.attribute);
        }
    }
}

/// Kind of one historical fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistKind {
    /// A value was added.
    AddValue,
    /// A value was deleted.
    DeleteValue,
    /// The whole attribute was deleted.
    DeleteAttribute,
    /// The attribute was replaced.
    Replace,
}

impl HistKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::AddValue => "add",
            Self::DeleteValue => "del",
            Self::DeleteAttribute => "attrDel",
            Self::Replace => "repl",
        }
    }
}

/// One line of historical metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalEntry {
    /// Attribute name.
    pub attribute: String,
    /// CSN of the change.
    pub csn: Csn,
    /// What happened.
    pub kind: HistKind,
    /// The value concerned, absent for [`HistKind::DeleteAttribute`].
    pub value: Option<String>,
}

impl fmt::Display for HistoricalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.attribute, self.csn, self.kind.as_str())?;
        if let Some(value) = &self.value {
            write!(f, ":{value}")?;
        }
        Ok(())
    }
}

impl FromStr for HistoricalEntry {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let invalid = |reason| CoreError::InvalidHistorical {
            value: s.to_string(),
            reason,
        };
        let mut parts = s.splitn(4, ':');
        let attribute = parts.next().filter(|a| !a.is_empty()).ok_or_else(|| invalid("missing attribute"))?;
        let csn = parts.next().ok_or_else(|| invalid("missing CSN"))?;
        let csn: Csn = csn.parse().map_err(|_| invalid("malformed CSN"))?;
        let kind = match parts.next() {
            Some("add") => HistKind::AddValue,
            Some("del") => HistKind::DeleteValue,
            Some("attrDel") => HistKind::DeleteAttribute,
            Some("repl") => HistKind::Replace,
            _ => return Err(invalid("unknown kind")),
        };
        let value = parts.next().map(str::to_string);
        match (kind, &value) {
            (HistKind::DeleteAttribute, Some(_)) => return Err(invalid("attrDel takes no value")),
            (HistKind::DeleteAttribute, None) => {}
            (_, None) => return Err(invalid("missing value")),
            _ => {}
        }
        Ok(Self {
            attribute: attribute.to_string(),
            csn,
            kind,
            value,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ValueState {
    csn: Csn,
    deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct AttrHistory {
    delete_csn: Option<Csn>,
    values: BTreeMap<String, ValueState>,
}

impl AttrHistory {
    fn value_csn(&self, value: &str) -> Option<Csn> {
        self.values.get(value).map(|v| v.csn)
    }

    fn deleted_at_or_after(&self, csn: Csn) -> bool {
        self.delete_csn.is_some_and(|d| d >= csn)
    }

    fn is_empty(&self) -> bool {
        self.delete_csn.is_none() && self.values.is_empty()
    }
}

/// What conflict resolution left of a modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Every part applies unchanged.
    Applied,
    /// Some parts were dropped or rewritten.
    Partial,
    /// Nothing is left to apply; the entry already reflects newer changes.
    NoOp,
}

/// Result of [`EntryHistorical::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The modifications to apply to the entry.
    pub mods: Vec<Modification>,
    /// How they relate to the requested ones.
    pub outcome: ResolutionOutcome,
}

/// Historical metadata of one entry.
///
/// Every attribute is treated as multi-valued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryHistorical {
    attrs: BTreeMap<String, AttrHistory>,
}

impl EntryHistorical {
    /// Creates empty metadata, as for a freshly added entry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the values of a newly added entry.
    pub fn record_add_entry(&mut self, csn: Csn, entry: &EntryAttributes) {
        for (attribute, values) in entry {
            let hist = self.attrs.entry(attribute.clone()).or_default();
            for value in values {
                hist.values.insert(value.clone(), ValueState { csn, deleted: false });
            }
        }
    }

    /// Resolves `mods`, made at `csn`, against this metadata and the entry's
    /// current attributes, and records the winning CSNs.
    ///
    /// The returned modifications are safe to apply to `entry` with
    /// [`apply_modifications`]. Resolving the same modifications twice
    /// yields [`ResolutionOutcome::NoOp`] the second time.
    pub fn resolve(&mut self, csn: Csn, mods: &[Modification], entry: &EntryAttributes) -> Resolution {
        // Decisions compare against the history as it was before this
        // operation, so a delete then an add of the same attribute in one
        // operation does not cancel itself.
        let before = self.attrs.clone();
        let mut current = entry.clone();
        let mut resolved = Vec::with_capacity(mods.len());

        for m in mods {
            let prior = before.get(&m.attribute).cloned().unwrap_or_default();
            let present = current.get(&m.attribute).cloned().unwrap_or_default();
            let hist = self.attrs.entry(m.attribute.clone()).or_default();

            let kept = match m.kind {
                ModKind::Add => resolve_add(csn, m, &prior, &present, hist),
                ModKind::Delete if m.values.is_empty() => resolve_delete_attribute(csn, m, &prior, &present, hist),
                ModKind::Delete => resolve_delete_values(csn, m, &prior, &present, hist),
                ModKind::Replace => resolve_replace(csn, m, &prior, &present, hist),
            };
            if let Some(kept) = kept {
                apply_modifications(&mut current, std::slice::from_ref(&kept));
                resolved.push(kept);
            }
        }
        self.attrs.retain(|_, hist| !hist.is_empty());

        let outcome = if resolved.is_empty() {
            ResolutionOutcome::NoOp
        } else if resolved.as_slice() == mods {
            ResolutionOutcome::Applied
        } else {
            ResolutionOutcome::Partial
        };
        Resolution {
            mods: resolved,
            outcome,
        }
    }

    /// Forgets facts older than `floor`. Returns the number removed.
    ///
    /// Facts below the purge floor can no longer be contradicted by a
    /// replicated change, since no such change remains in any changelog.
    pub fn purge(&mut self, floor: Csn) -> usize {
        let mut removed = 0;
        for hist in self.attrs.values_mut() {
            if hist.delete_csn.is_some_and(|d| d < floor) {
                hist.delete_csn = None;
                removed += 1;
            }
            let before = hist.values.len();
            hist.values.retain(|_, v| v.csn >= floor);
            removed += before - hist.values.len();
        }
        self.attrs.retain(|_, hist| !hist.is_empty());
        removed
    }

    /// Newest CSN recorded for `attribute`, any fact considered.
    #[must_use]
    pub fn last_change(&self, attribute: &str) -> Option<Csn> {
        let hist = self.attrs.get(attribute)?;
        hist.values.values().map(|v| v.csn).chain(hist.delete_csn).max()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// The historical facts, in attribute then value order.
    #[must_use]
    pub fn entries(&self) -> Vec<HistoricalEntry> {
        let mut out = Vec::new();
        for (attribute, hist) in &self.attrs {
            let repl_value = hist.delete_csn.and_then(|d| {
                hist.values
                    .iter()
                    .find(|(_, v)| v.csn == d && !v.deleted)
                    .map(|(value, _)| value.clone())
            });
            if let Some(delete_csn) = hist.delete_csn {
                out.push(HistoricalEntry {
                    attribute: attribute.clone(),
                    csn: delete_csn,
                    kind: if repl_value.is_some() {
                        HistKind::Replace
                    } else {
                        HistKind::DeleteAttribute
                    },
                    value: repl_value.clone(),
                });
            }
            for (value, state) in &hist.values {
                if repl_value.as_ref() == Some(value) {
                    continue;
                }
                out.push(HistoricalEntry {
                    attribute: attribute.clone(),
                    csn: state.csn,
                    kind: if state.deleted {
                        HistKind::DeleteValue
                    } else {
                        HistKind::AddValue
                    },
                    value: Some(value.clone()),
                });
            }
        }
        out
    }

    /// Encodes the metadata as historical lines.
    #[must_use]
    pub fn encode(&self) -> Vec<String> {
        self.entries().iter().map(ToString::to_string).collect()
    }

    /// Rebuilds metadata from historical lines.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidHistorical`] for a malformed line.
    pub fn decode<I, S>(lines: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut historical = Self::new();
        for line in lines {
            let fact: HistoricalEntry = line.as_ref().parse()?;
            let hist = historical.attrs.entry(fact.attribute).or_default();
            if matches!(fact.kind, HistKind::DeleteAttribute | HistKind::Replace) {
                hist.delete_csn = hist.delete_csn.max(Some(fact.csn));
            }
            if let Some(value) = fact.value {
                let state = ValueState {
                    csn: fact.csn,
                    deleted: fact.kind == HistKind::DeleteValue,
                };
                let newer = hist.values.get(&value).map_or(true, |old| old.csn <= state.csn);
                if newer {
                    hist.values.insert(value, state);
                }
            }
        }
        Ok(historical)
    }
}

fn rebuilt(m: &Modification, values: Vec<String>) -> Modification {
    Modification {
        kind: m.kind,
        attribute: m.attribute.clone(),
        values,
    }
}

fn resolve_add(
    csn: Csn,
    m: &Modification,
    prior: &AttrHistory,
    present: &BTreeSet<String>,
    hist: &mut AttrHistory,
) -> Option<Modification> {
    if prior.deleted_at_or_after(csn) {
        return None;
    }
    let mut keep = Vec::new();
    for value in &m.values {
        if prior.value_csn(value).is_some_and(|v| v >= csn) {
            continue;
        }
        hist.values.insert(value.clone(), ValueState { csn, deleted: false });
        if !present.contains(value) {
            keep.push(value.clone());
        }
    }
    (!keep.is_empty()).then(|| rebuilt(m, keep))
}

fn resolve_delete_values(
    csn: Csn,
    m: &Modification,
    prior: &AttrHistory,
    present: &BTreeSet<String>,
    hist: &mut AttrHistory,
) -> Option<Modification> {
    if prior.deleted_at_or_after(csn) {
        return None;
    }
    let mut keep = Vec::new();
    for value in &m.values {
        if prior.value_csn(value).is_some_and(|v| v >= csn) {
            continue;
        }
        hist.values.insert(value.clone(), ValueState { csn, deleted: true });
        if present.contains(value) {
            keep.push(value.clone());
        }
    }
    (!keep.is_empty()).then(|| rebuilt(m, keep))
}

fn resolve_delete_attribute(
    csn: Csn,
    m: &Modification,
    prior: &AttrHistory,
    present: &BTreeSet<String>,
    hist: &mut AttrHistory,
) -> Option<Modification> {
    if prior.deleted_at_or_after(csn) {
        return None;
    }
    hist.delete_csn = Some(csn);
    hist.values.retain(|_, v| v.csn > csn);

    if present.is_empty() {
        return None;
    }
    let newer: BTreeSet<&String> = present
        .iter()
        .filter(|value| prior.value_csn(value).is_some_and(|v| v > csn))
        .collect();
    if newer.is_empty() {
        return Some(m.clone());
    }
    let older: Vec<String> = present
        .iter()
        .filter(|value| !newer.contains(value))
        .cloned()
        .collect();
    (!older.is_empty()).then(|| rebuilt(m, older))
}

fn resolve_replace(
    csn: Csn,
    m: &Modification,
    prior: &AttrHistory,
    present: &BTreeSet<String>,
    hist: &mut AttrHistory,
) -> Option<Modification> {
    if prior.deleted_at_or_after(csn) {
        return None;
    }

    let mut result: BTreeSet<String> = BTreeSet::new();
    for value in &m.values {
        match prior.values.get(value) {
            Some(state) if state.csn > csn => {
                if !state.deleted {
                    result.insert(value.clone());
                }
            }
            _ => {
                result.insert(value.clone());
            }
        }
    }
    for value in present {
        if prior.value_csn(value).is_some_and(|v| v > csn) {
            result.insert(value.clone());
        }
    }

    hist.delete_csn = Some(csn);
    hist.values.retain(|_, v| v.csn > csn);
    for value in &m.values {
        hist.values
            .entry(value.clone())
            .or_insert(ValueState { csn, deleted: false });
    }

    let unchanged = result.len() == m.values.len() && m.values.iter().all(|v| result.contains(v));
    if unchanged {
        return Some(m.clone());
    }
    if result.is_empty() && present.is_empty() {
        return None;
    }
    Some(rebuilt(m, result.into_iter().collect()))
}
