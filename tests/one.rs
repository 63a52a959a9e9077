use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::NaiveDate;

use one_client::domain::{DatasetRecord, DatasetType, ListCategory, SessionId, SessionRecord};
use one_client::error::OneError;
use one_client::one::{ListResult, LoadOptions, LoadResult, LoadTarget, One};
use one_client::query::SearchFilters;
use one_client::registry::RegistryClient;
use one_client::store::CacheStore;
use one_client::transfer::FileTransfer;

const EID: &str = "86e27228-8708-48d8-96ed-9aa61ab951db";
const EID_OTHER: &str = "4e0b3320-47b7-416e-b842-c34dc9004cf8";

fn eid() -> SessionId {
    EID.parse().unwrap()
}

fn day(text: &str) -> NaiveDate {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").unwrap()
}

fn dtype(name: &str) -> DatasetType {
    name.parse().unwrap()
}

#[derive(Default)]
struct MockRegistry {
    sessions: Vec<SessionRecord>,
    datasets: HashMap<SessionId, Vec<(String, Option<String>)>>,
    catalog: HashMap<&'static str, Vec<String>>,
    dataset_calls: Mutex<usize>,
}

impl MockRegistry {
    fn with_session(mut self, id: &str, subject: &str, user: &str, date: &str) -> Self {
        self.sessions.push(SessionRecord {
            id: id.parse().unwrap(),
            subject: subject.to_string(),
            user: user.to_string(),
            start_date: day(date),
            detail: None,
        });
        self
    }

    fn with_dataset(mut self, id: &str, dataset_type: &str, url: Option<&str>) -> Self {
        self.datasets
            .entry(id.parse().unwrap())
            .or_default()
            .push((dataset_type.to_string(), url.map(|u| u.to_string())));
        self
    }
}

impl RegistryClient for MockRegistry {
    fn search_sessions(
        &self,
        filters: &SearchFilters,
        details: bool,
    ) -> Result<Vec<SessionRecord>, OneError> {
        Ok(self
            .sessions
            .iter()
            .filter(|record| {
                let user_ok =
                    filters.users.is_empty() || filters.users.iter().any(|u| *u == record.user);
                let subject_ok = filters
                    .subjects
                    .as_ref()
                    .is_none_or(|s| *s == record.subject);
                let date_ok = filters
                    .date_range
                    .is_none_or(|(start, end)| record.start_date >= start && record.start_date <= end);
                user_ok && subject_ok && date_ok
            })
            .map(|record| SessionRecord {
                detail: details.then(|| serde_json::json!({"subject": record.subject})),
                ..record.clone()
            })
            .collect())
    }

    fn session_datasets(&self, session: &SessionId) -> Result<Vec<DatasetRecord>, OneError> {
        *self.dataset_calls.lock().unwrap() += 1;
        Ok(self
            .datasets
            .get(session)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|(name, url)| DatasetRecord {
                session: session.clone(),
                dataset_type: name.parse().unwrap(),
                url,
            })
            .collect())
    }

    fn list_catalog(&self, category: ListCategory) -> Result<Vec<String>, OneError> {
        Ok(self
            .catalog
            .get(category.as_str())
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct MockTransfer {
    transfers: Mutex<Vec<String>>,
    fail_urls: HashSet<String>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FileTransfer for MockTransfer {
    fn download(&self, url: &str, destination: &Path) -> Result<(), OneError> {
        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.transfers.lock().unwrap().push(url.to_string());
        let result = if self.fail_urls.contains(url) {
            Err(OneError::Transport(format!("connection reset: {url}")))
        } else {
            std::fs::write(destination, format!("payload:{url}"))
                .map_err(|err| OneError::Filesystem(err.to_string()))
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn client(
    registry: MockRegistry,
    transfer: MockTransfer,
) -> (tempfile::TempDir, One<MockRegistry, MockTransfer>) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
    let store = CacheStore::new(root);
    store.ensure_root().unwrap();
    (temp, One::new(store, registry, transfer))
}

fn session_fixture() -> MockRegistry {
    MockRegistry::default()
        .with_session(EID, "flowers", "olivier", "2018-08-24")
        .with_dataset(EID, "clusters.templateWaveforms", Some("https://files.test/wf.npy"))
        .with_dataset(EID, "clusters.probes", Some("https://files.test/pr.npy"))
        .with_dataset(EID, "clusters.depths", Some("https://files.test/d.npy"))
}

#[test]
fn search_empty_filters_rejected() {
    let (_temp, one) = client(MockRegistry::default(), MockTransfer::default());
    let err = one.search(&SearchFilters::new(), false).unwrap_err();
    assert_matches!(err, OneError::InvalidQuery(_));
}

#[test]
fn search_by_user_and_exact_date() {
    let registry = MockRegistry::default()
        .with_session(EID, "flowers", "olivier", "2018-08-24")
        .with_session(EID_OTHER, "flowers", "olivier", "2018-08-25");
    let (_temp, one) = client(registry, MockTransfer::default());

    let filters = SearchFilters::new()
        .user("olivier")
        .date_range(day("2018-08-24"), day("2018-08-24"));
    let result = one.search(&filters, false).unwrap();
    assert_eq!(result.eids, vec![eid()]);

    let miss = SearchFilters::new()
        .user("nbonacchi")
        .date_range(day("2018-08-24"), day("2018-08-24"));
    assert!(one.search(&miss, false).unwrap().eids.is_empty());
}

#[test]
fn search_details_positionally_aligned() {
    let registry = MockRegistry::default()
        .with_session(EID, "flowers", "olivier", "2018-08-24")
        .with_session(EID_OTHER, "tulips", "nbonacchi", "2018-08-25");
    let (_temp, one) = client(registry, MockTransfer::default());

    let filters = SearchFilters::new().user("olivier").user("nbonacchi");
    let result = one.search(&filters, true).unwrap();
    let records = result.records.unwrap();
    assert_eq!(result.eids.len(), records.len());
    for (id, record) in result.eids.iter().zip(&records) {
        assert_eq!(*id, record.id);
        assert!(record.detail.is_some());
    }
}

#[test]
fn load_positional_with_absent_type() {
    let (_temp, one) = client(session_fixture(), MockTransfer::default());

    let requested = vec![
        dtype("clusters.probes"),
        dtype("thisDataset.IveJustMadeUp"),
        dtype("clusters.depths"),
    ];
    let result = one
        .load(LoadTarget::Session(eid()), &requested, LoadOptions::default())
        .unwrap();

    let paths = result.paths();
    assert_eq!(paths.len(), 3);
    assert!(paths[0].is_some());
    assert!(paths[1].is_none());
    assert!(paths[2].is_some());
    assert!(paths[0].as_ref().unwrap().ends_with("clusters.probes"));
    assert_eq!(result.warnings().len(), 1);
}

#[test]
fn load_detailed_carries_parallel_sequences() {
    let (_temp, one) = client(session_fixture(), MockTransfer::default());

    let requested = vec![dtype("clusters.templateWaveforms"), dtype("clusters.probes")];
    let options = LoadOptions {
        dclass_output: true,
        cache_only: false,
    };
    let result = one
        .load(LoadTarget::Session(eid()), &requested, options)
        .unwrap();

    let LoadResult::Detailed(record) = result else {
        panic!("expected detailed output");
    };
    assert_eq!(record.paths.len(), requested.len());
    assert_eq!(record.dataset_types.len(), requested.len());
    assert_eq!(
        record.dataset_types,
        vec![
            Some(dtype("clusters.templateWaveforms")),
            Some(dtype("clusters.probes"))
        ]
    );
}

#[test]
fn warm_cache_load_is_idempotent() {
    let (_temp, one) = client(session_fixture(), MockTransfer::default());

    let requested = vec![dtype("clusters.probes"), dtype("clusters.depths")];
    let first = one
        .load(LoadTarget::Session(eid()), &requested, LoadOptions::default())
        .unwrap();
    let transfers_after_first = one_transfers(&one);
    assert_eq!(transfers_after_first, 2);
    assert_eq!(registry_calls(&one), 1);

    let second = one
        .load(LoadTarget::Session(eid()), &requested, LoadOptions::default())
        .unwrap();
    assert_eq!(one_transfers(&one), transfers_after_first);
    // The warm load is answered entirely from disk: no transfers and no
    // registry round trip either.
    assert_eq!(registry_calls(&one), 1);
    assert_eq!(first.paths(), second.paths());
}

#[test]
fn warm_cache_load_skips_existence_query() {
    let (_temp, one) = client(session_fixture(), MockTransfer::default());

    let requested = vec![dtype("clusters.probes")];
    one.load(LoadTarget::Session(eid()), &requested, LoadOptions::default())
        .unwrap();
    assert_eq!(registry_calls(&one), 1);

    let result = one
        .load(LoadTarget::Session(eid()), &requested, LoadOptions::default())
        .unwrap();
    assert!(result.paths()[0].is_some());
    assert_eq!(registry_calls(&one), 1);
    assert_eq!(one_transfers(&one), 1);
}

#[test]
fn partial_failure_is_isolated() {
    let mut transfer = MockTransfer::default();
    transfer
        .fail_urls
        .insert("https://files.test/pr.npy".to_string());
    let (_temp, one) = client(session_fixture(), transfer);

    let requested = vec![
        dtype("clusters.templateWaveforms"),
        dtype("clusters.probes"),
        dtype("clusters.depths"),
    ];
    let result = one
        .load(LoadTarget::Session(eid()), &requested, LoadOptions::default())
        .unwrap();

    let paths = result.paths();
    assert!(paths[0].is_some());
    assert!(paths[1].is_none());
    assert!(paths[2].is_some());
    assert_eq!(result.warnings().len(), 1);
    // The failing transfer must not leave a cache entry behind.
    assert!(one
        .store()
        .lookup(&eid(), &dtype("clusters.probes"))
        .unwrap()
        .is_none());
}

#[test]
fn load_everything_resolves_full_catalogue() {
    let (_temp, one) = client(session_fixture(), MockTransfer::default());

    let result = one
        .load(LoadTarget::Session(eid()), &[], LoadOptions::default())
        .unwrap();
    assert_eq!(result.paths().len(), 3);
    assert!(result.paths().iter().all(|path| path.is_some()));
}

#[test]
fn load_by_filters_requires_unique_match() {
    let registry = MockRegistry::default()
        .with_session(EID, "flowers", "olivier", "2018-08-24")
        .with_session(EID_OTHER, "flowers", "olivier", "2018-08-25")
        .with_dataset(EID, "clusters.depths", Some("https://files.test/d.npy"));
    let (_temp, one) = client(registry, MockTransfer::default());

    let ambiguous = SearchFilters::new().subject("flowers");
    let err = one
        .load(
            LoadTarget::Filters(ambiguous),
            &[dtype("clusters.depths")],
            LoadOptions::default(),
        )
        .unwrap_err();
    assert_matches!(err, OneError::AmbiguousSession { matched: 2 });

    let none = SearchFilters::new().subject("cacti");
    let err = one
        .load(
            LoadTarget::Filters(none),
            &[dtype("clusters.depths")],
            LoadOptions::default(),
        )
        .unwrap_err();
    assert_matches!(err, OneError::AmbiguousSession { matched: 0 });

    let unique = SearchFilters::new()
        .subject("flowers")
        .date_range(day("2018-08-24"), day("2018-08-24"));
    let result = one
        .load(
            LoadTarget::Filters(unique),
            &[dtype("clusters.depths")],
            LoadOptions::default(),
        )
        .unwrap();
    assert_eq!(result.session(), &eid());
}

#[test]
fn concurrent_loads_share_one_transfer() {
    let transfer = MockTransfer {
        delay: Some(Duration::from_millis(50)),
        ..MockTransfer::default()
    };
    let (_temp, one) = client(session_fixture(), transfer);

    thread::scope(|scope| {
        for _ in 0..4 {
            let one = &one;
            scope.spawn(move || {
                let result = one
                    .load(
                        LoadTarget::Session(eid()),
                        &[dtype("clusters.depths")],
                        LoadOptions::default(),
                    )
                    .unwrap();
                assert!(result.paths()[0].is_some());
            });
        }
    });

    assert_eq!(one_transfers(&one), 1);
}

#[test]
fn parallel_fetches_are_bounded() {
    let mut registry = MockRegistry::default().with_session(EID, "flowers", "olivier", "2018-08-24");
    for index in 0..12 {
        let name = format!("channels.site{index}");
        let url = format!("https://files.test/site{index}.npy");
        registry = registry.with_dataset(EID, &name, Some(&url));
    }
    let transfer = MockTransfer {
        delay: Some(Duration::from_millis(20)),
        ..MockTransfer::default()
    };
    let (_temp, one) = client(registry, transfer);

    let result = one
        .load(LoadTarget::Session(eid()), &[], LoadOptions::default())
        .unwrap();
    assert_eq!(result.paths().len(), 12);
    assert!(result.paths().iter().all(|path| path.is_some()));
    assert_eq!(one_transfers(&one), 12);
    assert!(one.transfer().max_in_flight.load(Ordering::SeqCst) <= 8);
}

#[test]
fn cache_only_skips_network() {
    let (_temp, one) = client(session_fixture(), MockTransfer::default());

    // Warm one type, then go offline.
    one.load(
        LoadTarget::Session(eid()),
        &[dtype("clusters.depths")],
        LoadOptions::default(),
    )
    .unwrap();

    let options = LoadOptions {
        dclass_output: false,
        cache_only: true,
    };
    let requested = vec![dtype("clusters.depths"), dtype("clusters.probes")];
    let result = one
        .load(LoadTarget::Session(eid()), &requested, options)
        .unwrap();
    assert!(result.paths()[0].is_some());
    assert!(result.paths()[1].is_none());
    assert_eq!(one_transfers(&one), 1);
}

#[test]
fn list_session_dataset_types() {
    let registry = session_fixture().with_dataset(EID, "spikes.times", None);
    let (_temp, one) = client(registry, MockTransfer::default());

    let result = one.list(Some(&eid()), ListCategory::DatasetTypes).unwrap();
    let ListResult::Names(names) = result else {
        panic!("expected name list");
    };
    // Only existing dataset types are listed.
    assert_eq!(names.len(), 3);
    assert!(!names.contains(&"spikes.times".to_string()));

    let all = one.list(Some(&eid()), ListCategory::All).unwrap();
    let ListResult::Datasets(records) = all else {
        panic!("expected dataset records");
    };
    assert_eq!(records.len(), 4);
}

#[test]
fn list_catalog_categories() {
    let mut registry = MockRegistry::default();
    registry.catalog.insert(
        "users",
        vec!["olivier".to_string(), "nbonacchi".to_string()],
    );
    let (_temp, one) = client(registry, MockTransfer::default());

    let result = one.list(None, ListCategory::Users).unwrap();
    let ListResult::Names(names) = result else {
        panic!("expected name list");
    };
    assert_eq!(names, vec!["olivier", "nbonacchi"]);

    let err = one.list(Some(&eid()), ListCategory::Users).unwrap_err();
    assert_matches!(err, OneError::InvalidQuery(_));
}

fn one_transfers(one: &One<MockRegistry, MockTransfer>) -> usize {
    // Field access through the mock requires reaching into One; the
    // transfer mock records every download it performed.
    one_transfer_log(one).len()
}

fn one_transfer_log(one: &One<MockRegistry, MockTransfer>) -> Vec<String> {
    one.transfer().transfers.lock().unwrap().clone()
}

fn registry_calls(one: &One<MockRegistry, MockTransfer>) -> usize {
    *one.registry().dataset_calls.lock().unwrap()
}
