//! # Item Fingerprints
//!
//! A fingerprint is the SHA-256 of the comparable fields of an item. Two
//! observations of the same key with equal fingerprints are "no change".
//!
//! ## Comparable Fields
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  available   price_cents   name   category              │  → fingerprint
//! ├──────────────────────────────────────────────────────────┤
//! │  code   source   payload   captured_at                   │  → ignored
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Strings are length-prefixed in the canonical form, so `("ab", "c")` and
//! `("a", "bc")` can never hash alike.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Canonical form version. Bump when the field set changes.
const CANONICAL_VERSION: &str = "v1";

/// The comparable state of an item, also stored as before/after on changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemState {
    pub available: bool,
    pub price_cents: Option<i64>,
    pub name: Option<String>,
    pub category: Option<String>,
}

impl ItemState {
    pub fn new(
        available: bool,
        price_cents: Option<i64>,
        name: Option<&str>,
        category: Option<&str>,
    ) -> Self {
        ItemState {
            available,
            price_cents,
            name: name.map(str::to_string),
            category: category.map(str::to_string),
        }
    }

    /// Hex-encoded SHA-256 over the canonical form.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        hex::encode(digest)
    }

    /// True when the availability flag is the only comparable difference.
    pub fn only_availability_differs(&self, other: &ItemState) -> bool {
        self.available != other.available
            && self.price_cents == other.price_cents
            && self.name == other.name
            && self.category == other.category
    }

    fn canonical(&self) -> String {
        format!(
            "{}|available={}|price={}|name={}|category={}",
            CANONICAL_VERSION,
            u8::from(self.available),
            self.price_cents
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            encode_opt(self.name.as_deref()),
            encode_opt(self.category.as_deref()),
        )
    }
}

fn encode_opt(value: Option<&str>) -> String {
    match value {
        Some(s) => format!("{}:{}", s.len(), s),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let state = ItemState::new(true, Some(1290), Some("Nasi Lemak"), Some("Rice"));
        let fp = state.fingerprint();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, state.clone().fingerprint());
    }

    #[test]
    fn test_each_field_affects_fingerprint() {
        let base = ItemState::new(true, Some(100), Some("A"), Some("B"));
        let variants = [
            ItemState { available: false, ..base.clone() },
            ItemState { price_cents: Some(101), ..base.clone() },
            ItemState { price_cents: None, ..base.clone() },
            ItemState { name: Some("A2".into()), ..base.clone() },
            ItemState { category: None, ..base.clone() },
        ];
        for v in variants {
            assert_ne!(v.fingerprint(), base.fingerprint(), "{:?}", v);
        }
    }

    #[test]
    fn test_length_prefix_prevents_ambiguity() {
        let a = ItemState::new(true, None, Some("ab"), Some("c"));
        let b = ItemState::new(true, None, Some("a"), Some("bc"));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_only_availability_differs() {
        let on = ItemState::new(true, Some(5), Some("x"), None);
        let off = ItemState { available: false, ..on.clone() };
        assert!(on.only_availability_differs(&off));
        assert!(!on.only_availability_differs(&on));

        let off_and_repriced = ItemState { price_cents: Some(6), ..off };
        assert!(!on.only_availability_differs(&off_and_repriced));
    }
}
