//! Reconciliation of the two scraped claim sets against the known identifiers.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use airdex_core::{parse_timestamp, Candidate, Icao, Provenance};
use chrono::{DateTime, Utc};

use crate::state::KnownIndex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub scraped_steam: usize,
    pub scraped_discord: usize,
    pub new_steam: BTreeMap<Icao, Candidate>,
    pub new_discord: BTreeMap<Icao, Candidate>,
    /// Discord-owned records whose thread shows newer activity than persisted.
    pub refreshes: BTreeMap<Icao, DateTime<Utc>>,
}

impl Reconciliation {
    pub fn new_count(&self) -> usize {
        self.new_steam.len() + self.new_discord.len()
    }

    /// All newly admitted claims in ascending identifier order. Keys of the two maps are disjoint.
    pub fn new_records(&self) -> BTreeMap<&Icao, &Candidate> {
        self.new_steam
            .iter()
            .chain(self.new_discord.iter())
            .collect()
    }
}

/// Collapse duplicate claims to the one with the latest recency signal.
/// Ties, including two claims without a signal, keep the one seen first.
pub fn collapse_latest(candidates: Vec<Candidate>) -> BTreeMap<Icao, Candidate> {
    let mut latest: BTreeMap<Icao, Candidate> = BTreeMap::new();
    for candidate in candidates {
        match latest.entry(candidate.icao.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(candidate);
            }
            Entry::Occupied(mut slot) => {
                if candidate.recency() > slot.get().recency() {
                    slot.insert(candidate);
                }
            }
        }
    }
    latest
}

pub fn reconcile(steam: Vec<Candidate>, discord: Vec<Candidate>, known: &KnownIndex) -> Reconciliation {
    let scraped_steam = steam.len();
    let scraped_discord = discord.len();
    let steam = collapse_latest(steam);
    let discord = collapse_latest(discord);

    let new_steam: BTreeMap<Icao, Candidate> = steam
        .into_iter()
        .filter(|(icao, _)| !known.contains_key(icao))
        .collect();

    let mut new_discord = BTreeMap::new();
    let mut refreshes = BTreeMap::new();
    for (icao, candidate) in discord {
        match known.get(&icao) {
            Some(entry) => {
                if entry.provenance != Provenance::Discord {
                    continue;
                }
                let Some(activity) = candidate.recency() else {
                    continue;
                };
                let persisted = entry.last_updated.as_deref().and_then(parse_timestamp);
                if persisted.map_or(true, |persisted| activity > persisted) {
                    refreshes.insert(icao, activity);
                }
            }
            None if new_steam.contains_key(&icao) => {}
            None => {
                new_discord.insert(icao, candidate);
            }
        }
    }

    Reconciliation {
        scraped_steam,
        scraped_discord,
        new_steam,
        new_discord,
        refreshes,
    }
}
