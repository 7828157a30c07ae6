//! Partitioning of the persisted dataset into the base and non-base tiers.

use std::collections::BTreeMap;

use airdex_core::{DatasetFile, Icao, Provenance, StoredAirport};
use airdex_storage::DatasetStore;
use tracing::{info, warn};

/// What the reconciler needs to know about an identifier already in the dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownEntry {
    pub provenance: Provenance,
    pub last_updated: Option<String>,
}

pub type KnownIndex = BTreeMap<Icao, KnownEntry>;

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedState {
    pub schema_version: u32,
    /// Never reordered or mutated.
    pub base: Vec<StoredAirport>,
    pub non_base: Vec<StoredAirport>,
    pub known: KnownIndex,
}

impl LoadedState {
    pub fn from_dataset(file: DatasetFile) -> Self {
        let mut base = Vec::new();
        let mut non_base = Vec::new();
        let mut known = KnownIndex::new();

        for record in file.airports {
            let Some(key) = record.key() else {
                continue;
            };
            if known.contains_key(&key) {
                warn!(icao = %key, "identifier appears more than once in dataset");
            } else {
                known.insert(
                    key,
                    KnownEntry {
                        provenance: record.provenance(),
                        last_updated: record.last_updated().map(ToString::to_string),
                    },
                );
            }
            if record.is_base() {
                base.push(record);
            } else {
                non_base.push(record);
            }
        }

        Self {
            schema_version: file.schema_version,
            base,
            non_base,
            known,
        }
    }

}

pub async fn load_state(store: &DatasetStore) -> LoadedState {
    let state = LoadedState::from_dataset(store.load().await);
    info!(
        base = state.base.len(),
        non_base = state.non_base.len(),
        unique_icaos = state.known.len(),
        "loaded dataset"
    );
    state
}
