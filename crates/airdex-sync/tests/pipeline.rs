use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use airdex_adapters::{AdapterContext, AdapterError, AirportLookup, CandidateSource, LookupError};
use airdex_core::{
    format_timestamp, Candidate, DatasetFile, ForumPost, Icao, Provenance, StoredAirport, WorkshopItem,
};
use airdex_storage::{decode_dataset, DatasetStore, EnrichmentCache};
use airdex_sync::{Enricher, RunMode, SyncPipeline};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};
use tempfile::TempDir;

struct FakeSource {
    provenance: Provenance,
    candidates: Vec<Candidate>,
    calls: AtomicUsize,
    fail: bool,
}

impl FakeSource {
    fn new(provenance: Provenance, candidates: Vec<Candidate>) -> Arc<Self> {
        Arc::new(Self {
            provenance,
            candidates,
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn failing(provenance: Provenance) -> Arc<Self> {
        Arc::new(Self {
            provenance,
            candidates: Vec::new(),
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }
}

#[async_trait]
impl CandidateSource for FakeSource {
    fn source(&self) -> Provenance {
        self.provenance
    }

    async fn collect(&self, _ctx: &AdapterContext) -> Result<Vec<Candidate>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AdapterError::Message("platform unavailable".into()));
        }
        Ok(self.candidates.clone())
    }
}

#[derive(Default)]
struct CountingLookup {
    payloads: HashMap<String, JsonValue>,
    calls: AtomicUsize,
}

impl CountingLookup {
    fn with(entries: &[(&str, JsonValue)]) -> Arc<Self> {
        Arc::new(Self {
            payloads: entries
                .iter()
                .map(|(code, payload)| (code.to_string(), payload.clone()))
                .collect(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AirportLookup for CountingLookup {
    async fn lookup(&self, _ctx: &AdapterContext, icao: &Icao) -> Result<JsonValue, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .get(icao.as_str())
            .cloned()
            .ok_or_else(|| LookupError::NotFound(icao.clone()))
    }
}

struct Workspace {
    _dir: TempDir,
    data_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Workspace {
    fn new(dataset: Option<&str>, seed: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let cache_dir = dir.path().join("cache").join("aerodatabox");
        std::fs::create_dir_all(&data_dir).unwrap();
        if let Some(dataset) = dataset {
            std::fs::write(data_dir.join("airports.json"), dataset).unwrap();
        }
        if let Some(seed) = seed {
            std::fs::write(data_dir.join("baseAirports.json"), seed).unwrap();
        }
        Self {
            _dir: dir,
            data_dir,
            cache_dir,
        }
    }

    fn dataset_path(&self) -> PathBuf {
        self.data_dir.join("airports.json")
    }

    fn read_dataset(&self) -> DatasetFile {
        decode_dataset(&std::fs::read_to_string(self.dataset_path()).unwrap())
            .unwrap()
            .file
    }

    fn cache_payload(&self, code: &str, payload: &JsonValue) {
        std::fs::create_dir_all(&self.cache_dir).unwrap();
        std::fs::write(self.cache_dir.join(format!("{code}.json")), payload.to_string()).unwrap();
    }

    fn pipeline(
        &self,
        lookup: Option<Arc<CountingLookup>>,
        steam: Arc<FakeSource>,
        discord: Arc<FakeSource>,
    ) -> SyncPipeline {
        let lookup = lookup.map(|l| l as Arc<dyn AirportLookup>);
        let enricher = Enricher::new(EnrichmentCache::new(&self.cache_dir), lookup, Duration::ZERO);
        SyncPipeline::new(DatasetStore::in_data_dir(&self.data_dir), enricher)
            .with_steam(steam)
            .with_discord(discord)
    }
}

fn icao(code: &str) -> Icao {
    Icao::normalize(code).unwrap()
}

fn at(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, month, day, 10, 0, 0).unwrap()
}

fn steam_item(code: &str, id: &str, updated: DateTime<Utc>) -> Candidate {
    Candidate::workshop(
        icao(code),
        WorkshopItem {
            published_file_id: id.into(),
            title: format!("{code} scenery pack"),
            creator: format!("creator-{id}"),
            time_updated: Some(updated),
            workshop_url: format!("https://steamcommunity.com/sharedfiles/filedetails/?id={id}"),
            subscriptions: 100,
        },
    )
}

fn forum_post(code: &str, thread: &str, activity: Option<DateTime<Utc>>) -> Candidate {
    Candidate::forum(
        icao(code),
        ForumPost {
            author: format!("author-{thread}"),
            discord_thread: format!("https://discord.com/channels/1312377412251680858/{thread}"),
            activity_at: activity,
        },
    )
}

fn payload(name: &str) -> JsonValue {
    json!({"fullName": name, "location": {"lat": 10.5, "lon": -20.25}})
}

fn find<'a>(file: &'a DatasetFile, code: &str) -> &'a StoredAirport {
    file.airports
        .iter()
        .find(|r| r.icao().eq_ignore_ascii_case(code))
        .unwrap_or_else(|| panic!("{code} missing from dataset"))
}

fn field(file: &DatasetFile, code: &str, name: &str) -> JsonValue {
    find(file, code).get(name).cloned().unwrap_or(JsonValue::Null)
}

fn codes(file: &DatasetFile) -> Vec<String> {
    file.airports.iter().map(|r| r.icao().to_string()).collect()
}

/// File bytes with the top-level run stamp blanked out.
fn bytes_without_run_stamp(path: &Path) -> String {
    let text = std::fs::read_to_string(path).unwrap();
    let mut lines: Vec<&str> = text.lines().collect();
    let stamp = lines
        .iter()
        .position(|line| line.starts_with("  \"lastUpdated\": "))
        .expect("top-level lastUpdated line");
    lines[stamp] = "  \"lastUpdated\": <run>,";
    lines.join("\n")
}

const DATASET: &str = r#"{
  "schemaVersion": 2,
  "lastUpdated": "2025-01-01T00:00:00+00:00",
  "airports": [
    {"icao": "EGLL", "name": "Heathrow Airport", "lat": 51.47, "lng": -0.45, "status": "base",
     "author": null, "workshopUrl": null, "discordThread": null, "lastUpdated": null,
     "defaultIncluded": true, "featured": true},
    {"icao": "KEXP", "name": "Example Airport", "lat": 1.0, "lng": 2.0, "status": "in_dev",
     "source": "discord", "author": "pilot", "workshopUrl": null,
     "discordThread": "https://discord.com/channels/1312377412251680858/1",
     "lastUpdated": "2025-03-01T10:00:00+00:00", "defaultIncluded": false, "featured": false,
     "steamSubscriptions": 0, "notes": "hand edited"},
    {"icao": "KSEA", "name": "Seattle Airport", "lat": 47.44, "lng": -122.3, "status": "released",
     "source": "steam", "author": "maker", "workshopUrl": "https://steamcommunity.com/sharedfiles/filedetails/?id=9",
     "discordThread": null, "lastUpdated": "2025-02-01T00:00:00+00:00",
     "defaultIncluded": false, "featured": false, "steamSubscriptions": 12}
  ]
}"#;

#[tokio::test]
async fn full_run_adds_refreshes_and_sorts() {
    let ws = Workspace::new(Some(DATASET), None);
    let lookup = CountingLookup::with(&[("KABC", payload("Abc Regional")), ("LOWI", payload("Innsbruck Airport"))]);
    let steam = FakeSource::new(Provenance::Steam, vec![steam_item("KABC", "101", at(3, 5))]);
    let discord = FakeSource::new(
        Provenance::Discord,
        vec![
            forum_post("KEXP", "1", Some(at(4, 2))),
            forum_post("LOWI", "2", None),
        ],
    );

    let summary = ws
        .pipeline(Some(lookup.clone()), steam, discord)
        .run(RunMode::Full)
        .await
        .unwrap();

    assert_eq!(summary.records_written, 5);
    assert_eq!((summary.new_steam, summary.new_discord), (1, 1));
    assert_eq!((summary.added, summary.refreshed, summary.rejected), (2, 1, 0));
    assert_eq!(lookup.calls(), 2);

    let file = ws.read_dataset();
    assert_eq!(file.schema_version, 2);
    assert_eq!(file.last_updated.as_deref(), Some(summary.last_updated.as_str()));
    assert_eq!(codes(&file), vec!["EGLL", "KABC", "KEXP", "KSEA", "LOWI"]);

    assert_eq!(field(&file, "KEXP", "lastUpdated"), json!(format_timestamp(at(4, 2))));
    assert_eq!(field(&file, "KEXP", "author"), json!("pilot"));
    assert_eq!(field(&file, "KEXP", "notes"), json!("hand edited"));

    assert_eq!(field(&file, "KABC", "name"), json!("Abc Regional Airport"));
    assert_eq!(field(&file, "KABC", "status"), json!("released"));
    assert_eq!(field(&file, "KABC", "source"), json!("steam"));
    assert_eq!(field(&file, "KABC", "lastUpdated"), json!(format_timestamp(at(3, 5))));
    assert_eq!(field(&file, "KABC", "steamSubscriptions"), json!(100));

    assert_eq!(field(&file, "LOWI", "name"), json!("Innsbruck Airport"));
    assert_eq!(field(&file, "LOWI", "status"), json!("in_dev"));
    assert_eq!(field(&file, "LOWI", "lastUpdated"), json!(summary.last_updated));

    assert_eq!(field(&file, "EGLL", "defaultIncluded"), json!(true));
    assert_eq!(field(&file, "EGLL", "featured"), json!(true));

    let cached = EnrichmentCache::new(&ws.cache_dir).load(&icao("KABC")).await;
    assert_eq!(cached, Some(payload("Abc Regional")));
}

#[tokio::test]
async fn latest_workshop_item_wins_for_duplicate_identifier() {
    let ws = Workspace::new(Some(DATASET), None);
    let lookup = CountingLookup::with(&[("KXYZ", payload("Xyz Field"))]);
    let steam = FakeSource::new(
        Provenance::Steam,
        vec![
            steam_item("KXYZ", "201", at(3, 1)),
            steam_item("KXYZ", "202", at(3, 9)),
        ],
    );

    ws.pipeline(Some(lookup), steam, FakeSource::new(Provenance::Discord, Vec::new()))
        .run(RunMode::Full)
        .await
        .unwrap();

    let file = ws.read_dataset();
    assert_eq!(
        field(&file, "KXYZ", "workshopUrl"),
        json!("https://steamcommunity.com/sharedfiles/filedetails/?id=202")
    );
    assert_eq!(field(&file, "KXYZ", "author"), json!("creator-202"));
    assert_eq!(field(&file, "KXYZ", "lastUpdated"), json!(format_timestamp(at(3, 9))));
}

#[tokio::test]
async fn identifier_claimed_by_both_sources_goes_to_steam_and_uses_cache() {
    let ws = Workspace::new(Some(DATASET), None);
    ws.cache_payload("KZZZ", &json!({"shortName": "Zulu", "location": {"lat": 5.0, "lng": 6.0}}));
    let lookup = CountingLookup::with(&[]);
    let steam = FakeSource::new(Provenance::Steam, vec![steam_item("KZZZ", "301", at(2, 1))]);
    let discord = FakeSource::new(Provenance::Discord, vec![forum_post("KZZZ", "9", Some(at(5, 1)))]);

    let summary = ws
        .pipeline(Some(lookup.clone()), steam, discord)
        .run(RunMode::Full)
        .await
        .unwrap();

    assert_eq!(lookup.calls(), 0);
    assert_eq!((summary.new_steam, summary.new_discord), (1, 0));
    let file = ws.read_dataset();
    assert_eq!(field(&file, "KZZZ", "name"), json!("Zulu Airport"));
    assert_eq!((field(&file, "KZZZ", "lat"), field(&file, "KZZZ", "lng")), (json!(5.0), json!(6.0)));
    assert_eq!(field(&file, "KZZZ", "status"), json!("released"));
    assert_eq!(field(&file, "KZZZ", "source"), json!("steam"));
    assert_eq!(field(&file, "KZZZ", "discordThread"), JsonValue::Null);
}

#[tokio::test]
async fn record_without_longitude_is_not_written() {
    let ws = Workspace::new(Some(DATASET), None);
    let lookup = CountingLookup::with(&[("KNOL", json!({"fullName": "No Lon", "location": {"lat": 1.0}}))]);
    let steam = FakeSource::new(Provenance::Steam, vec![steam_item("KNOL", "401", at(1, 1))]);

    let summary = ws
        .pipeline(Some(lookup), steam, FakeSource::new(Provenance::Discord, Vec::new()))
        .run(RunMode::Full)
        .await
        .unwrap();

    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.added, 0);
    assert!(!codes(&ws.read_dataset()).contains(&"KNOL".to_string()));
}

#[tokio::test]
async fn lookup_failure_only_drops_that_identifier() {
    let ws = Workspace::new(Some(DATASET), None);
    let lookup = CountingLookup::with(&[("KGOD", payload("Good Field"))]);
    let steam = FakeSource::new(
        Provenance::Steam,
        vec![steam_item("KBAD", "501", at(1, 1)), steam_item("KGOD", "502", at(1, 2))],
    );

    let summary = ws
        .pipeline(Some(lookup.clone()), steam, FakeSource::new(Provenance::Discord, Vec::new()))
        .run(RunMode::Full)
        .await
        .unwrap();

    assert_eq!(lookup.calls(), 2);
    assert_eq!((summary.added, summary.rejected), (1, 1));
    let written = codes(&ws.read_dataset());
    assert!(written.contains(&"KGOD".to_string()));
    assert!(!written.contains(&"KBAD".to_string()));
}

#[tokio::test]
async fn rerun_with_same_inputs_is_idempotent() {
    let ws = Workspace::new(Some(DATASET), None);
    let lookup = CountingLookup::with(&[("KABC", payload("Abc Regional"))]);
    let steam_items = vec![steam_item("KABC", "101", at(3, 5))];
    let forum = vec![forum_post("KEXP", "1", Some(at(4, 2)))];

    ws.pipeline(
        Some(lookup.clone()),
        FakeSource::new(Provenance::Steam, steam_items.clone()),
        FakeSource::new(Provenance::Discord, forum.clone()),
    )
    .run(RunMode::Full)
    .await
    .unwrap();
    let first = bytes_without_run_stamp(&ws.dataset_path());

    let summary = ws
        .pipeline(
            Some(lookup.clone()),
            FakeSource::new(Provenance::Steam, steam_items),
            FakeSource::new(Provenance::Discord, forum),
        )
        .run(RunMode::Full)
        .await
        .unwrap();
    let second = bytes_without_run_stamp(&ws.dataset_path());

    assert_eq!(lookup.calls(), 1);
    assert_eq!((summary.added, summary.refreshed), (0, 0));
    assert_eq!(first, second);
    assert!(first.contains("\"notes\": \"hand edited\""));
}

#[tokio::test]
async fn missing_credentials_on_cache_miss_aborts_without_writing() {
    let ws = Workspace::new(Some(DATASET), None);
    let before = std::fs::read(ws.dataset_path()).unwrap();
    let steam = FakeSource::new(Provenance::Steam, vec![steam_item("KNEW", "601", at(1, 1))]);

    let err = ws
        .pipeline(None, steam, FakeSource::new(Provenance::Discord, Vec::new()))
        .run(RunMode::Full)
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("APIMARKET_API_KEY"));
    assert_eq!(std::fs::read(ws.dataset_path()).unwrap(), before);
}

#[tokio::test]
async fn cached_identifiers_need_no_credentials() {
    let ws = Workspace::new(Some(DATASET), None);
    ws.cache_payload("KCCH", &payload("Cached Field"));
    let steam = FakeSource::new(Provenance::Steam, vec![steam_item("KCCH", "701", at(1, 1))]);

    let summary = ws
        .pipeline(None, steam, FakeSource::new(Provenance::Discord, Vec::new()))
        .run(RunMode::Full)
        .await
        .unwrap();
    assert_eq!(summary.added, 1);
}

#[tokio::test]
async fn steam_only_mode_never_touches_discord() {
    let ws = Workspace::new(Some(DATASET), None);
    let discord = FakeSource::new(Provenance::Discord, vec![forum_post("KEXP", "1", Some(at(6, 1)))]);

    let summary = ws
        .pipeline(
            Some(CountingLookup::with(&[])),
            FakeSource::new(Provenance::Steam, Vec::new()),
            discord.clone(),
        )
        .run(RunMode::SteamOnly)
        .await
        .unwrap();

    assert_eq!(discord.calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.refreshed, 0);
    assert_eq!(
        find(&ws.read_dataset(), "KEXP").last_updated(),
        Some("2025-03-01T10:00:00+00:00")
    );
}

#[tokio::test]
async fn failing_source_does_not_stop_the_run() {
    let ws = Workspace::new(Some(DATASET), None);
    let lookup = CountingLookup::with(&[("LOWI", payload("Innsbruck"))]);
    let discord = FakeSource::new(Provenance::Discord, vec![forum_post("LOWI", "2", None)]);

    let summary = ws
        .pipeline(Some(lookup), FakeSource::failing(Provenance::Steam), discord)
        .run(RunMode::Full)
        .await
        .unwrap();
    assert_eq!((summary.new_steam, summary.new_discord, summary.added), (0, 1, 1));
}

#[tokio::test]
async fn seed_creates_missing_dataset() {
    let seed = r#"{"schemaVersion": 1, "lastUpdated": null, "airports": [
      {"icao": "EGLL", "name": "Heathrow Airport", "lat": 51.47, "lng": -0.45, "status": "base"}
    ]}"#;
    let ws = Workspace::new(None, Some(seed));

    let summary = ws
        .pipeline(
            Some(CountingLookup::with(&[])),
            FakeSource::new(Provenance::Steam, Vec::new()),
            FakeSource::new(Provenance::Discord, Vec::new()),
        )
        .run(RunMode::Full)
        .await
        .unwrap();

    assert_eq!(summary.records_written, 1);
    assert_eq!(codes(&ws.read_dataset()), vec!["EGLL"]);
}

#[tokio::test]
async fn no_dataset_and_no_seed_is_fatal() {
    let ws = Workspace::new(None, None);
    let result = ws
        .pipeline(
            None,
            FakeSource::new(Provenance::Steam, Vec::new()),
            FakeSource::new(Provenance::Discord, Vec::new()),
        )
        .run(RunMode::Full)
        .await;
    assert!(result.is_err());
    assert!(!Path::new(&ws.dataset_path()).exists());
}

#[tokio::test]
async fn detect_reports_new_identifiers_without_writing() {
    let ws = Workspace::new(Some(DATASET), None);
    let before = std::fs::read(ws.dataset_path()).unwrap();
    let lookup = CountingLookup::with(&[]);
    let steam = FakeSource::new(
        Provenance::Steam,
        vec![steam_item("KXYZ", "1", at(1, 1)), steam_item("KSEA", "2", at(1, 1)), steam_item("KABC", "3", at(1, 1))],
    );
    let discord = FakeSource::new(
        Provenance::Discord,
        vec![forum_post("KABC", "1", None), forum_post("LOWI", "2", None)],
    );

    let report = ws
        .pipeline(Some(lookup.clone()), steam, discord)
        .detect()
        .await
        .unwrap();

    assert_eq!(report.steam, vec![icao("KABC"), icao("KXYZ")]);
    assert_eq!(report.discord, vec![icao("LOWI")]);
    assert_eq!(
        report.to_string(),
        "Dry-detect new ICAOs: 3\n - [STEAM] KABC\n - [STEAM] KXYZ\n - [DISCORD] LOWI\n"
    );
    assert_eq!(lookup.calls(), 0);
    assert_eq!(std::fs::read(ws.dataset_path()).unwrap(), before);
}

#[tokio::test]
async fn run_without_candidates_keeps_every_persisted_entry_verbatim() {
    let dataset = r#"{
  "schemaVersion": 3,
  "lastUpdated": "2025-01-01T00:00:00+00:00",
  "airports": [
    {
      "icao": "KEXP",
      "name": "Example Airport",
      "lat": 1.0,
      "lng": -2,
      "country": null,
      "continent": null,
      "status": "base"
    },
    {
      "icao": "KSUB",
      "name": "Subscribed Airport",
      "lat": 3.5,
      "lng": 4.5,
      "status": "base",
      "steamSubscriptions": null
    },
    {
      "icao": "KNON",
      "lat": 5,
      "lng": 6,
      "status": "base"
    },
    {
      "icao": "KWIP",
      "name": "Planned Airport",
      "status": "planned",
      "defaultIncluded": null
    },
    {
      "name": "No Code Airport",
      "status": "released"
    }
  ]
}
"#;
    let ws = Workspace::new(Some(dataset), None);

    let summary = ws
        .pipeline(
            None,
            FakeSource::new(Provenance::Steam, Vec::new()),
            FakeSource::new(Provenance::Discord, Vec::new()),
        )
        .run(RunMode::Full)
        .await
        .unwrap();

    assert_eq!(summary.records_written, 4);
    assert_eq!(summary.base_records, 3);
    let written = std::fs::read_to_string(ws.dataset_path()).unwrap();
    let expected = dataset
        .replace("  \"lastUpdated\": \"2025-01-01T00:00:00+00:00\"", &format!("  \"lastUpdated\": \"{}\"", summary.last_updated))
        .replace(",\n    {\n      \"name\": \"No Code Airport\",\n      \"status\": \"released\"\n    }", "");
    assert_eq!(written, expected);
}
