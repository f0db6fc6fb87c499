use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use tracing::debug;

use crate::geolocate::LocationRecord;
use crate::optin::OptInCheck;

/// Merges freshly resolved locations with the previously saved ones.
///
/// A fresh `(0, 0)` never replaces a known location of a user who is still
/// opted in, and saved users who have since opted out are dropped. The result
/// holds one record per name, sorted by name.
pub fn reconcile(
    fresh: &[LocationRecord],
    persisted: &[LocationRecord],
    check: &impl OptInCheck,
) -> Vec<LocationRecord> {
    let fresh = index_by_name(fresh);
    let persisted = index_by_name(persisted);
    let mut merged: BTreeMap<&str, &LocationRecord> = BTreeMap::new();

    for (&name, &fresh_record) in &fresh {
        let chosen = match persisted.get(name) {
            Some(&saved) if fresh_record.is_sentinel() && check.is_opted_in(name) => {
                debug!(user = %name, "keeping saved location over unresolved lookup");
                saved
            }
            _ => fresh_record,
        };
        merged.insert(name, chosen);
    }

    for (&name, &saved) in &persisted {
        if fresh.contains_key(name) {
            continue;
        }
        if check.is_opted_in(name) {
            merged.insert(name, saved);
        } else {
            debug!(user = %name, "dropping saved location of opted-out user");
        }
    }

    merged.into_values().cloned().collect()
}

/// Records with a real location, for renderers that cannot show unknowns.
pub fn pinned(records: &[LocationRecord]) -> Vec<LocationRecord> {
    records
        .iter()
        .filter(|record| !record.is_sentinel())
        .cloned()
        .collect()
}

fn index_by_name(records: &[LocationRecord]) -> BTreeMap<&str, &LocationRecord> {
    let mut index: BTreeMap<&str, &LocationRecord> = BTreeMap::new();
    for record in records {
        if record.name.is_empty() {
            continue;
        }
        match index.entry(record.name.as_str()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if preferred(record, slot.get()) == Ordering::Greater {
                    slot.insert(record);
                }
            }
        }
    }
    index
}

/// Ranks two records of the same name without looking at their position: a
/// real location beats `(0, 0)`, then the larger `(lat, lng)` wins.
fn preferred(a: &LocationRecord, b: &LocationRecord) -> Ordering {
    b.is_sentinel()
        .cmp(&a.is_sentinel())
        .then_with(|| a.lat.total_cmp(&b.lat))
        .then_with(|| a.lng.total_cmp(&b.lng))
}
