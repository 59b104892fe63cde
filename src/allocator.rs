use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use crate::error::QvmError;
use crate::store::{ConfigStore, Reservation};

/// Smallest id in `range` that is not in `used`.
pub fn lowest_free(used: &BTreeSet<u32>, range: RangeInclusive<u32>) -> Option<u32> {
    range.into_iter().find(|id| !used.contains(id))
}

/// Reserve the lowest free id. A candidate lost to a concurrent creator is
/// skipped and the scan continues upward.
pub fn allocate(store: &ConfigStore, range: RangeInclusive<u32>) -> Result<Reservation, QvmError> {
    let (start, end) = (*range.start(), *range.end());
    let mut used = store.keyspace()?;

    while let Some(id) = lowest_free(&used, range.clone()) {
        match store.reserve(id) {
            Ok(reservation) => {
                tracing::debug!(id, "allocated id");
                return Ok(reservation);
            }
            Err(QvmError::AlreadyExists { .. }) => {
                tracing::debug!(id, "id taken concurrently, trying next");
                used.insert(id);
            }
            Err(e) => return Err(e),
        }
    }

    Err(QvmError::NoCapacity { start, end })
}

/// Reserve a caller-chosen id.
pub fn claim(
    store: &ConfigStore,
    id: u32,
    range: RangeInclusive<u32>,
) -> Result<Reservation, QvmError> {
    if !range.contains(&id) {
        return Err(QvmError::Validation {
            message: format!(
                "id {id} outside allowed range {}..={}",
                range.start(),
                range.end()
            ),
        });
    }
    store.reserve(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn set(ids: &[u32]) -> BTreeSet<u32> {
        ids.iter().copied().collect()
    }

    #[test]
    fn lowest_free_picks_minimum_gap() {
        assert_eq!(lowest_free(&set(&[]), 100..=999), Some(100));
        assert_eq!(lowest_free(&set(&[100, 101, 103]), 100..=999), Some(102));
        assert_eq!(lowest_free(&set(&[5, 6]), 100..=999), Some(100));
    }

    #[test]
    fn lowest_free_exhausted() {
        assert_eq!(lowest_free(&set(&[1, 2, 3]), 1..=3), None);
        assert_eq!(lowest_free(&set(&[1, 3]), 1..=3), Some(2));
    }

    #[test]
    fn lowest_free_matches_brute_force() {
        // Every subset of a 6-id range.
        for mask in 0u32..64 {
            let used: BTreeSet<u32> = (0..6).filter(|b| mask & (1 << b) != 0).map(|b| b + 10).collect();
            let expected = (10..=15).find(|id| !used.contains(id));
            assert_eq!(lowest_free(&used, 10..=15), expected, "mask {mask:06b}");
        }
    }

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("configs"), Settings::default());
        std::fs::create_dir_all(store.dir()).unwrap();
        (dir, store)
    }

    #[test]
    fn allocate_skips_records_and_reservations() {
        let (_dir, store) = store();
        std::fs::write(store.dir().join("100.json"), "{}").unwrap();
        let _held = store.reserve(101).unwrap();

        let got = allocate(&store, 100..=105).unwrap();
        assert_eq!(got.id(), 102);

        let next = allocate(&store, 100..=105).unwrap();
        assert_eq!(next.id(), 103);
    }

    #[test]
    fn allocate_reports_no_capacity() {
        let (_dir, store) = store();
        let _a = store.reserve(100).unwrap();
        let _b = store.reserve(101).unwrap();
        assert!(matches!(
            allocate(&store, 100..=101),
            Err(QvmError::NoCapacity { start: 100, end: 101 })
        ));
    }

    #[test]
    fn claim_checks_range_and_collisions() {
        let (_dir, store) = store();
        assert!(matches!(
            claim(&store, 50, 100..=999),
            Err(QvmError::Validation { .. })
        ));
        let _held = claim(&store, 150, 100..=999).unwrap();
        assert!(matches!(
            claim(&store, 150, 100..=999),
            Err(QvmError::AlreadyExists { id: 150 })
        ));
    }
}
