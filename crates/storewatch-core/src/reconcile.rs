//! # Reconciliation Planner
//!
//! Pure diff of a run's observations against the newest stored snapshot per
//! key. The storage layer feeds it prior state inside its write transaction
//! and persists the resulting plan; nothing here touches the database.
//!
//! ## Decision Table
//! ```text
//! ┌────────────────────────────┬───────────────┬──────────────────────────┐
//! │ Prior (newest row for key) │ Observed now? │ Result                   │
//! ├────────────────────────────┼───────────────┼──────────────────────────┤
//! │ none / tombstone           │ yes           │ snapshot + created       │
//! │ same fingerprint           │ yes           │ snapshot                 │
//! │ availability flipped only  │ yes           │ snapshot + avail_toggled │
//! │ other difference           │ yes           │ snapshot + updated       │
//! │ live, shop in scope        │ no            │ tombstone + removed      │
//! │ live, shop out of scope    │ no            │ nothing                  │
//! │ tombstone                  │ no            │ nothing                  │
//! └────────────────────────────┴───────────────┴──────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::types::{
    ChangeType, ItemKey, ItemObservation, ItemSnapshot, NewChange, NewSnapshot, Source,
};
use crate::REMOVED_FINGERPRINT;

/// Which stored keys a run is allowed to declare removed.
///
/// A source is in scope when the run polled it successfully. A source polled
/// only in part (a listing that started past its first page) puts just the
/// shops it listed in scope. Individual shops can be carved out of either
/// when only their listing failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalScope {
    sources: BTreeSet<Source>,
    limited: BTreeMap<Source, BTreeSet<String>>,
    skipped_shops: BTreeSet<(Source, String)>,
}

impl RemovalScope {
    pub fn new() -> Self {
        RemovalScope::default()
    }

    /// Scope covering every given source in full.
    pub fn of(sources: impl IntoIterator<Item = Source>) -> Self {
        RemovalScope {
            sources: sources.into_iter().collect(),
            ..RemovalScope::default()
        }
    }

    pub fn cover(&mut self, source: Source) {
        self.sources.insert(source);
    }

    /// Covers only the listed shops of a source.
    pub fn cover_shops<I, S>(&mut self, source: Source, shop_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.limited
            .entry(source)
            .or_default()
            .extend(shop_ids.into_iter().map(Into::into));
    }

    /// Excludes one shop of a source (its listing failed this run).
    pub fn skip_shop(&mut self, source: Source, shop_id: impl Into<String>) {
        self.skipped_shops.insert((source, shop_id.into()));
    }

    pub fn contains(&self, source: Source, shop_id: &str) -> bool {
        let covered = self.sources.contains(&source)
            || self
                .limited
                .get(&source)
                .is_some_and(|shops| shops.contains(shop_id));
        covered && !self.skipped_shops.contains(&(source, shop_id.to_string()))
    }

    /// Sources covered in full or in part.
    pub fn sources(&self) -> BTreeSet<Source> {
        self.sources
            .iter()
            .chain(self.limited.keys())
            .copied()
            .collect()
    }
}

/// Rows to write for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub snapshots: Vec<NewSnapshot>,
    pub changes: Vec<NewChange>,
}

/// Plans the snapshots and changes for `run_id`.
///
/// ## Arguments
/// * `scope` - Keys the run may declare removed (see [`RemovalScope`]).
/// * `prior` - Newest stored snapshot per key (tombstones included).
/// * `observations` - Everything observed this run. Later entries for the
///   same key win.
///
/// Output order is deterministic (sorted by key).
pub fn plan(
    run_id: i64,
    scope: &RemovalScope,
    prior: &HashMap<ItemKey, ItemSnapshot>,
    observations: Vec<ItemObservation>,
    captured_at: DateTime<Utc>,
) -> ReconcilePlan {
    let mut latest: BTreeMap<ItemKey, ItemObservation> = BTreeMap::new();
    for obs in observations {
        latest.insert(obs.key(), obs);
    }

    let mut out = ReconcilePlan::default();

    for (key, obs) in &latest {
        let state = obs.state();
        let fingerprint = state.fingerprint();

        let change_type = match prior.get(key) {
            None => Some(ChangeType::Created),
            Some(p) if p.removed => Some(ChangeType::Created),
            Some(p) if p.fingerprint == fingerprint => None,
            Some(p) if p.state().only_availability_differs(&state) => {
                Some(ChangeType::AvailabilityToggled)
            }
            Some(_) => Some(ChangeType::Updated),
        };

        if let Some(change_type) = change_type {
            let before = prior
                .get(key)
                .filter(|p| !p.removed)
                .map(ItemSnapshot::state);
            out.changes.push(NewChange {
                run_id,
                shop_id: key.shop_id.clone(),
                item_id: key.item_id.clone(),
                change_type,
                before,
                after: Some(state),
                changed_at: captured_at,
            });
        }

        out.snapshots.push(NewSnapshot {
            run_id,
            shop_id: obs.shop_id.clone(),
            item_id: obs.item_id.clone(),
            source: obs.source,
            name: obs.name.clone(),
            code: obs.code.clone(),
            category: obs.category.clone(),
            price_cents: obs.price_cents,
            available: obs.available,
            fingerprint,
            removed: false,
            payload: obs.payload.clone(),
            captured_at,
        });
    }

    let mut vanished: Vec<&ItemSnapshot> = prior
        .values()
        .filter(|p| !p.removed && scope.contains(p.source, &p.shop_id))
        .filter(|p| !latest.contains_key(&p.key()))
        .collect();
    vanished.sort_by(|a, b| (&a.shop_id, &a.item_id).cmp(&(&b.shop_id, &b.item_id)));

    for p in vanished {
        out.changes.push(NewChange {
            run_id,
            shop_id: p.shop_id.clone(),
            item_id: p.item_id.clone(),
            change_type: ChangeType::Removed,
            before: Some(p.state()),
            after: None,
            changed_at: captured_at,
        });
        out.snapshots.push(NewSnapshot {
            run_id,
            shop_id: p.shop_id.clone(),
            item_id: p.item_id.clone(),
            source: p.source,
            name: p.name.clone(),
            code: p.code.clone(),
            category: p.category.clone(),
            price_cents: p.price_cents,
            available: false,
            fingerprint: REMOVED_FINGERPRINT.to_string(),
            removed: true,
            payload: serde_json::Value::Null,
            captured_at,
        });
    }

    out
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(shop: &str, item: &str, source: Source, available: bool) -> ItemObservation {
        ItemObservation {
            shop_id: shop.to_string(),
            item_id: item.to_string(),
            source,
            name: Some(format!("Item {}", item)),
            code: None,
            category: None,
            price_cents: Some(500),
            available,
            payload: serde_json::json!({ "shopId": shop }),
        }
    }

    /// Turns a plan's snapshots into the "prior" map the next run would see.
    fn as_prior(plan: &ReconcilePlan) -> HashMap<ItemKey, ItemSnapshot> {
        plan.snapshots
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let snap = ItemSnapshot {
                    id: i as i64 + 1,
                    run_id: s.run_id,
                    shop_id: s.shop_id.clone(),
                    item_id: s.item_id.clone(),
                    source: s.source,
                    name: s.name.clone(),
                    code: s.code.clone(),
                    category: s.category.clone(),
                    price_cents: s.price_cents,
                    available: s.available,
                    fingerprint: s.fingerprint.clone(),
                    removed: s.removed,
                    payload: s.payload.to_string(),
                    captured_at: s.captured_at,
                };
                (snap.key(), snap)
            })
            .collect()
    }

    fn scope(sources: &[Source]) -> RemovalScope {
        RemovalScope::of(sources.iter().copied())
    }

    #[test]
    fn test_first_run_creates_everything() {
        let plan = plan(
            1,
            &scope(&[Source::Partner]),
            &HashMap::new(),
            vec![obs("S1", "A", Source::Partner, true), obs("S1", "B", Source::Partner, true)],
            Utc::now(),
        );
        assert_eq!(plan.snapshots.len(), 2);
        assert_eq!(plan.changes.len(), 2);
        assert!(plan.changes.iter().all(|c| c.change_type == ChangeType::Created));
        assert!(plan.changes.iter().all(|c| c.before.is_none()));
    }

    #[test]
    fn test_identical_second_run_emits_nothing() {
        let observations = vec![obs("S1", "A", Source::Partner, true)];
        let s = scope(&[Source::Partner]);
        let first = plan(1, &s, &HashMap::new(), observations.clone(), Utc::now());
        let second = plan(2, &s, &as_prior(&first), observations, Utc::now());

        assert_eq!(second.snapshots.len(), 1);
        assert!(second.changes.is_empty());
    }

    #[test]
    fn test_availability_toggle() {
        let first = plan(
            1,
            &scope(&[Source::Grab]),
            &HashMap::new(),
            vec![obs("S1", "grab", Source::Grab, true)],
            Utc::now(),
        );
        let second = plan(
            2,
            &scope(&[Source::Grab]),
            &as_prior(&first),
            vec![obs("S1", "grab", Source::Grab, false)],
            Utc::now(),
        );

        assert_eq!(second.changes.len(), 1);
        let change = &second.changes[0];
        assert_eq!(change.change_type, ChangeType::AvailabilityToggled);
        assert_eq!(change.before.as_ref().map(|s| s.available), Some(true));
        assert_eq!(change.after.as_ref().map(|s| s.available), Some(false));
    }

    #[test]
    fn test_price_change_is_update() {
        let s = scope(&[Source::Partner]);
        let original = vec![obs("S1", "A", Source::Partner, true)];
        let first = plan(1, &s, &HashMap::new(), original, Utc::now());
        let mut repriced = obs("S1", "A", Source::Partner, false);
        repriced.price_cents = Some(650);
        let second = plan(2, &s, &as_prior(&first), vec![repriced], Utc::now());

        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.changes[0].change_type, ChangeType::Updated);
    }

    #[test]
    fn test_removed_exactly_once_then_recreated() {
        let s = scope(&[Source::Partner]);
        let both = || {
            vec![obs("S1", "A", Source::Partner, true), obs("S1", "B", Source::Partner, true)]
        };
        let only_a = || vec![obs("S1", "A", Source::Partner, true)];
        let first = plan(1, &s, &HashMap::new(), both(), Utc::now());

        let second = plan(2, &s, &as_prior(&first), only_a(), Utc::now());
        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.changes[0].change_type, ChangeType::Removed);
        assert_eq!(second.changes[0].item_id, "B");
        assert!(second.changes[0].after.is_none());
        let tombstone = second.snapshots.iter().find(|s| s.item_id == "B").unwrap();
        assert!(tombstone.removed);
        assert_eq!(tombstone.fingerprint, REMOVED_FINGERPRINT);

        let mut prior = as_prior(&first);
        prior.extend(as_prior(&second));
        let third = plan(3, &s, &prior, only_a(), Utc::now());
        assert!(third.changes.is_empty(), "tombstoned key must not be removed twice");

        let fourth = plan(4, &s, &prior, both(), Utc::now());
        assert_eq!(fourth.changes.len(), 1);
        assert_eq!(fourth.changes[0].change_type, ChangeType::Created);
    }

    #[test]
    fn test_out_of_scope_sources_are_not_removed() {
        let first = plan(
            1,
            &scope(&[Source::Partner, Source::Grab]),
            &HashMap::new(),
            vec![obs("S1", "A", Source::Partner, true), obs("S1", "grab", Source::Grab, true)],
            Utc::now(),
        );
        // Partner feed failed this run: only grab is in scope.
        let second = plan(
            2,
            &scope(&[Source::Grab]),
            &as_prior(&first),
            vec![obs("S1", "grab", Source::Grab, true)],
            Utc::now(),
        );
        assert!(second.changes.is_empty());
        assert_eq!(second.snapshots.len(), 1);
    }

    #[test]
    fn test_skipped_shop_keeps_its_items() {
        let s = scope(&[Source::Partner]);
        let first = plan(
            1,
            &s,
            &HashMap::new(),
            vec![obs("S1", "A", Source::Partner, true), obs("S2", "B", Source::Partner, true)],
            Utc::now(),
        );

        let mut partial = scope(&[Source::Partner]);
        partial.skip_shop(Source::Partner, "S2");
        let second = plan(2, &partial, &as_prior(&first), vec![], Utc::now());

        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.changes[0].shop_id, "S1");
        assert!(partial.contains(Source::Partner, "S1"));
        assert!(!partial.contains(Source::Partner, "S2"));
        assert!(!partial.contains(Source::Grab, "S1"));
    }

    #[test]
    fn test_partial_listing_scopes_only_listed_shops() {
        let first = plan(
            1,
            &scope(&[Source::Partner]),
            &HashMap::new(),
            vec![obs("S1", "A", Source::Partner, true), obs("S2", "B", Source::Partner, true)],
            Utc::now(),
        );

        // Listing resumed at a later page and only returned S2, now empty.
        let mut resumed = RemovalScope::new();
        resumed.cover_shops(Source::Partner, ["S2"]);
        let second = plan(2, &resumed, &as_prior(&first), vec![], Utc::now());

        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.changes[0].shop_id, "S2");
        assert_eq!(second.changes[0].change_type, ChangeType::Removed);
        assert!(!resumed.contains(Source::Partner, "S1"));
        assert_eq!(resumed.sources(), BTreeSet::from([Source::Partner]));

        resumed.skip_shop(Source::Partner, "S2");
        assert!(!resumed.contains(Source::Partner, "S2"));
    }

    #[test]
    fn test_last_write_wins_within_batch() {
        let plan = plan(
            1,
            &scope(&[Source::Grab]),
            &HashMap::new(),
            vec![obs("S1", "grab", Source::Grab, true), obs("S1", "grab", Source::Grab, false)],
            Utc::now(),
        );
        assert_eq!(plan.snapshots.len(), 1);
        assert!(!plan.snapshots[0].available);
    }
}
