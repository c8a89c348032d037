//! Provenance records.
//!
//! Every derived value is recorded as an [`EvidenceItem`] keyed by
//! [`EvidenceKey`]. Recording the same key twice replaces the earlier item;
//! [`EvidenceLedger`] is the in-process form of that merge.

#![allow(clippy::should_implement_trait)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::FieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    Regulation,
    Context,
    Calculation,
}

impl RefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regulation => "regulation",
            Self::Context => "context",
            Self::Calculation => "calculation",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "regulation" => Some(Self::Regulation),
            "context" => Some(Self::Context),
            "calculation" => Some(Self::Calculation),
            _ => None,
        }
    }
}

/// How a value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    Direct,
    Derived,
    Estimated,
    Missing,
}

impl Reliability {
    pub const ALL: [Reliability; 4] = [
        Self::Direct,
        Self::Derived,
        Self::Estimated,
        Self::Missing,
    ];

    pub fn weight(&self) -> f64 {
        match self {
            Self::Direct => 1.0,
            Self::Derived => 0.8,
            Self::Estimated => 0.5,
            Self::Missing => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Derived => "derived",
            Self::Estimated => "estimated",
            Self::Missing => "missing",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub ref_type: RefType,
    /// Originating rule id or layer name; `None` for calculations.
    #[serde(default)]
    pub ref_id: Option<String>,
    pub parcel_id: String,
    pub field: String,
    #[serde(default)]
    pub value: Option<FieldValue>,
    pub reliability: Reliability,
    pub source_path: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub inserted_by: String,
    pub recorded_at: DateTime<Utc>,
}

impl EvidenceItem {
    pub fn key(&self) -> EvidenceKey {
        EvidenceKey {
            ref_type: self.ref_type,
            ref_id: self.ref_id.clone().unwrap_or_default(),
            field: self.field.clone(),
            parcel_id: self.parcel_id.clone(),
        }
    }
}

/// Upsert identity: `(ref_type, ref_id or "", field, parcel_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvidenceKey {
    pub ref_type: RefType,
    pub ref_id: String,
    pub field: String,
    pub parcel_id: String,
}

/// Idempotent merge of evidence items by key, iterated in key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceLedger {
    entries: BTreeMap<EvidenceKey, EvidenceItem>,
}

impl EvidenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns `true` when an existing item was replaced.
    pub fn upsert(&mut self, item: EvidenceItem) -> bool {
        self.entries.insert(item.key(), item).is_some()
    }

    pub fn get(&self, key: &EvidenceKey) -> Option<&EvidenceItem> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &EvidenceItem> {
        self.entries.values()
    }

    pub fn for_parcel<'a>(&'a self, parcel_id: &'a str) -> impl Iterator<Item = &'a EvidenceItem> {
        self.entries.values().filter(move |i| i.parcel_id == parcel_id)
    }

    /// Remove every item for a parcel. Returns the number removed.
    pub fn remove_parcel(&mut self, parcel_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| k.parcel_id != parcel_id);
        before - self.entries.len()
    }

    pub fn into_items(self) -> Vec<EvidenceItem> {
        self.entries.into_values().collect()
    }
}

impl Extend<EvidenceItem> for EvidenceLedger {
    fn extend<T: IntoIterator<Item = EvidenceItem>>(&mut self, iter: T) {
        for item in iter {
            self.upsert(item);
        }
    }
}

impl FromIterator<EvidenceItem> for EvidenceLedger {
    fn from_iter<T: IntoIterator<Item = EvidenceItem>>(iter: T) -> Self {
        let mut ledger = Self::new();
        ledger.extend(iter);
        ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(ref_type: RefType, ref_id: Option<&str>, field: &str, value: f64) -> EvidenceItem {
        EvidenceItem {
            ref_type,
            ref_id: ref_id.map(str::to_string),
            parcel_id: "P1".into(),
            field: field.into(),
            value: Some(FieldValue::Number(value)),
            reliability: Reliability::Direct,
            source_path: "test".into(),
            comment: None,
            metadata: serde_json::Value::Null,
            inserted_by: "test".into(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_weights() {
        assert_eq!(Reliability::Direct.weight(), 1.0);
        assert_eq!(Reliability::Derived.weight(), 0.8);
        assert_eq!(Reliability::Estimated.weight(), 0.5);
        assert_eq!(Reliability::Missing.weight(), 0.0);
    }

    #[test]
    fn test_str_round_trip() {
        for r in Reliability::ALL {
            assert_eq!(Reliability::from_str(r.as_str()), Some(r));
        }
        assert_eq!(RefType::from_str("context"), Some(RefType::Context));
        assert_eq!(RefType::from_str("other"), None);
    }

    #[test]
    fn test_upsert_replaces_same_key() {
        let mut ledger = EvidenceLedger::new();
        assert!(!ledger.upsert(item(RefType::Calculation, None, "su_m2", 1.0)));
        assert!(ledger.upsert(item(RefType::Calculation, None, "su_m2", 2.0)));
        assert_eq!(ledger.len(), 1);
        let only = ledger.items().next().unwrap();
        assert_eq!(only.value, Some(FieldValue::Number(2.0)));
    }

    #[test]
    fn test_distinct_ref_ids_are_distinct_keys() {
        let ledger: EvidenceLedger = vec![
            item(RefType::Regulation, Some("a"), "ibus", 0.6),
            item(RefType::Regulation, Some("b"), "ibus", 0.7),
            item(RefType::Context, Some("a"), "ibus", 0.6),
        ]
        .into_iter()
        .collect();
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_remove_parcel() {
        let mut ledger = EvidenceLedger::new();
        ledger.upsert(item(RefType::Calculation, None, "su_m2", 1.0));
        let mut other = item(RefType::Calculation, None, "su_m2", 1.0);
        other.parcel_id = "P2".into();
        ledger.upsert(other);
        assert_eq!(ledger.remove_parcel("P1"), 1);
        assert_eq!(ledger.for_parcel("P2").count(), 1);
        assert_eq!(ledger.for_parcel("P1").count(), 0);
    }
}
