//! Final assembly of the dataset document.

use std::collections::{BTreeMap, BTreeSet};

use airdex_core::{format_timestamp, DatasetFile, Icao, StoredAirport};
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::state::LoadedState;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub file: DatasetFile,
    pub refreshed: usize,
    pub added: usize,
}

/// Overwrite `lastUpdated` on non-base records named in `refreshes`. Returns how many changed.
pub fn apply_refreshes(
    non_base: &mut [StoredAirport],
    refreshes: &BTreeMap<Icao, DateTime<Utc>>,
) -> usize {
    let mut applied = 0;
    for record in non_base.iter_mut() {
        let Some(ts) = record.key().and_then(|key| refreshes.get(&key)) else {
            continue;
        };
        record.set_last_updated(*ts);
        applied += 1;
    }
    applied
}

/// Base records first in file order, then every non-base record ascending by
/// uppercase identifier. Existing records win identifier collisions.
pub fn merge(
    state: LoadedState,
    new_records: Vec<StoredAirport>,
    refreshes: &BTreeMap<Icao, DateTime<Utc>>,
    run_time: DateTime<Utc>,
) -> MergeOutcome {
    let LoadedState {
        schema_version,
        base,
        mut non_base,
        known,
    } = state;

    let refreshed = apply_refreshes(&mut non_base, refreshes);

    let mut taken: BTreeSet<Icao> = known.into_keys().collect();
    let mut added = 0;
    for record in new_records {
        let Some(key) = record.key() else {
            continue;
        };
        if !taken.insert(key.clone()) {
            warn!(icao = %key, "new record collides with an existing one, keeping existing");
            continue;
        }
        non_base.push(record);
        added += 1;
    }

    non_base.sort_by_cached_key(|record| record.icao().to_uppercase());

    let mut airports = base;
    airports.extend(non_base);

    MergeOutcome {
        file: DatasetFile {
            schema_version,
            last_updated: Some(format_timestamp(run_time)),
            airports,
        },
        refreshed,
        added,
    }
}
