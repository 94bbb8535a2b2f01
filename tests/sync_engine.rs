use async_trait::async_trait;
use bytes::Bytes;
use quest_pipeline::{
    models::{
        object::{Object, ObjectMeta, VersionMarker},
        sync::{Candidate, FailureReason, Outcome, TableOutcome},
        table::Table,
    },
    services::{
        memory_store::MemoryStore,
        object_store::{ObjectStore, StoreError, StoreResult},
        retry::RetryPolicy,
        sources::{RemoteSource, SourceError},
        sync_engine::{SourceDescriptor, SyncEngine, SyncSettings},
        table_writer::TableFormat,
    },
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Clone)]
enum Reply {
    Body(Bytes),
    Status(u16),
    /// Fail with the status this many times, then serve the body.
    Flaky(u16, usize, Bytes),
    Hang,
}

#[derive(Default)]
struct ScriptedSource {
    entries: Mutex<BTreeMap<String, (Option<VersionMarker>, Reply)>>,
    fetches: Mutex<HashMap<String, usize>>,
    listing_down: AtomicBool,
}

impl ScriptedSource {
    fn set(&self, id: &str, marker: Option<&str>, reply: Reply) {
        self.entries
            .lock()
            .unwrap()
            .insert(id.to_string(), (marker.map(VersionMarker::new), reply));
    }

    fn remove(&self, id: &str) {
        self.entries.lock().unwrap().remove(id);
    }

    fn fetches(&self, id: &str) -> usize {
        self.fetches.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl RemoteSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn list_candidates(&self) -> Result<Vec<Candidate>, SourceError> {
        if self.listing_down.load(Ordering::SeqCst) {
            return Err(SourceError::Status {
                url: "scripted://index".into(),
                status: 403,
            });
        }
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(id, (marker, _))| Candidate::new(id.clone(), marker.clone()))
            .collect())
    }

    async fn fetch(&self, remote_id: &str) -> Result<Bytes, SourceError> {
        let attempt = {
            let mut fetches = self.fetches.lock().unwrap();
            let count = fetches.entry(remote_id.to_string()).or_default();
            *count += 1;
            *count
        };
        let reply = self
            .entries
            .lock()
            .unwrap()
            .get(remote_id)
            .map(|(_, reply)| reply.clone())
            .ok_or_else(|| SourceError::UnknownRemote(remote_id.to_string()))?;
        let status = |status| SourceError::Status {
            url: format!("scripted://{}", remote_id),
            status,
        };
        match reply {
            Reply::Body(bytes) => Ok(bytes),
            Reply::Status(code) => Err(status(code)),
            Reply::Flaky(code, failures, _) if attempt <= failures => Err(status(code)),
            Reply::Flaky(_, _, bytes) => Ok(bytes),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(status(599))
            }
        }
    }
}

/// Memory store that counts puts and can be switched to refuse them.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    puts: AtomicUsize,
    refuse_puts: AtomicBool,
    /// Number of upcoming `.table` puts to fail with a transient error.
    table_put_failures: AtomicUsize,
}

impl CountingStore {
    fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn put(&self, key: &str, bytes: Bytes, marker: VersionMarker) -> StoreResult<ObjectMeta> {
        if self.refuse_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk detached".into()));
        }
        if key.ends_with(".table")
            && self
                .table_put_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Unavailable("blip".into()));
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, bytes, marker).await
    }

    async fn get(&self, key: &str) -> StoreResult<Object> {
        self.inner.get(key).await
    }

    async fn stat(&self, key: &str) -> StoreResult<ObjectMeta> {
        self.inner.stat(key).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }
}

fn settings() -> SyncSettings {
    SyncSettings {
        fetch_timeout: Duration::from_secs(5),
        retry: RetryPolicy::new(3, Duration::from_millis(10)),
        concurrency: 4,
    }
}

fn setup() -> (Arc<ScriptedSource>, Arc<CountingStore>, SyncEngine, SourceDescriptor) {
    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(CountingStore::default());
    let engine = SyncEngine::new(store.clone(), settings());
    let descriptor = SourceDescriptor::new(source.clone(), "raw/");
    (source, store, engine, descriptor)
}

fn body(text: &'static str) -> Reply {
    Reply::Body(Bytes::from_static(text.as_bytes()))
}

#[tokio::test]
async fn second_run_without_remote_changes_is_a_no_op() {
    let (source, store, engine, descriptor) = setup();
    source.set("a.txt", Some("v1"), body("alpha"));
    source.set("b.txt", Some("v1"), body("beta"));

    let first = engine.run(&descriptor).await;
    assert_eq!(first.outcomes(), vec![Outcome::Updated, Outcome::Updated]);
    assert_eq!(store.puts(), 2);

    let second = engine.run(&descriptor).await;
    assert_eq!(second.outcomes(), vec![Outcome::Unchanged, Outcome::Unchanged]);
    assert_eq!(store.puts(), 2);
    assert_eq!(source.total_fetches(), 2);
    assert_eq!(
        store.list("raw/").await.unwrap(),
        vec!["raw/a.txt", "raw/b.txt"]
    );
}

#[tokio::test]
async fn changed_marker_fetches_and_writes_only_that_candidate() {
    let (source, store, engine, descriptor) = setup();
    source.set("a.txt", Some("v1"), body("alpha"));
    source.set("b.txt", Some("v1"), body("beta"));
    engine.run(&descriptor).await;

    source.set("b.txt", Some("v2"), body("beta, revised"));
    let report = engine.run(&descriptor).await;

    assert_eq!(report.outcomes(), vec![Outcome::Unchanged, Outcome::Updated]);
    assert_eq!(source.fetches("a.txt"), 1);
    assert_eq!(source.fetches("b.txt"), 2);
    assert_eq!(store.puts(), 3);
    assert_eq!(store.head("raw/b.txt").await.unwrap(), VersionMarker::new("v2"));
    assert_eq!(
        store.get("raw/b.txt").await.unwrap().bytes,
        Bytes::from_static(b"beta, revised")
    );
}

#[tokio::test]
async fn new_marker_with_identical_bytes_is_recorded_once() {
    let (source, store, engine, descriptor) = setup();
    source.set("a.txt", Some("v1"), body("alpha"));
    engine.run(&descriptor).await;
    let content = store.stat("raw/a.txt").await.unwrap().content_version;

    source.set("a.txt", Some("v2"), body("alpha"));
    let report = engine.run(&descriptor).await;

    assert_eq!(report.outcomes(), vec![Outcome::Unchanged]);
    assert_eq!(source.fetches("a.txt"), 2);
    assert_eq!(store.head("raw/a.txt").await.unwrap(), VersionMarker::new("v2"));
    let stored = store.get("raw/a.txt").await.unwrap();
    assert_eq!(stored.meta.content_version, content);
    assert_eq!(stored.bytes, Bytes::from_static(b"alpha"));

    // The new marker sticks: later runs skip the fetch entirely.
    for _ in 0..3 {
        assert_eq!(engine.run(&descriptor).await.outcomes(), vec![Outcome::Unchanged]);
    }
    assert_eq!(source.fetches("a.txt"), 2);
    assert_eq!(store.puts(), 2);
}

#[tokio::test]
async fn one_failing_candidate_does_not_affect_the_others() {
    let (source, store, engine, descriptor) = setup();
    source.set("1.txt", Some("v1"), body("one"));
    source.set("2.txt", Some("v1"), Reply::Status(404));
    source.set("3.txt", Some("v1"), body("three"));

    let report = engine.run(&descriptor).await;

    assert_eq!(report.candidates.len(), 3);
    assert_eq!(report.candidates[0].outcome, Outcome::Updated);
    assert!(matches!(
        report.candidates[1].outcome,
        Outcome::Failed(FailureReason::Fetch(_))
    ));
    assert_eq!(report.candidates[2].outcome, Outcome::Updated);
    // 404 is not retried.
    assert_eq!(source.fetches("2.txt"), 1);
    assert!(!store.exists("raw/2.txt").await.unwrap());
    assert_eq!(report.failed(), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_fetch_fails_with_timeout() {
    let (source, store, engine, descriptor) = setup();
    source.set("slow.txt", Some("v1"), Reply::Hang);
    source.set("fast.txt", Some("v1"), body("fast"));

    let report = engine.run(&descriptor).await;

    let slow = report
        .candidates
        .iter()
        .find(|c| c.remote_id == "slow.txt")
        .unwrap();
    assert_eq!(slow.outcome, Outcome::Failed(FailureReason::Timeout));
    // Timeouts are not retried.
    assert_eq!(source.fetches("slow.txt"), 1);
    assert!(!store.exists("raw/slow.txt").await.unwrap());
    assert!(store.exists("raw/fast.txt").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried_with_backoff() {
    let (source, _store, engine, descriptor) = setup();
    source.set(
        "flaky.txt",
        Some("v1"),
        Reply::Flaky(503, 2, Bytes::from_static(b"finally")),
    );

    let report = engine.run(&descriptor).await;
    assert_eq!(report.outcomes(), vec![Outcome::Updated]);
    assert_eq!(source.fetches("flaky.txt"), 3);

    source.set("flaky.txt", Some("v2"), Reply::Flaky(503, 10, Bytes::new()));
    let report = engine.run(&descriptor).await;
    assert!(report.candidates[0].outcome.is_failed());
    // 3 attempts in the first run, 3 more before giving up.
    assert_eq!(source.fetches("flaky.txt"), 6);
}

#[tokio::test]
async fn markerless_candidates_are_fingerprinted() {
    let (source, store, engine, descriptor) = setup();
    source.set("data.json", None, body(r#"{"data":[]}"#));

    assert_eq!(engine.run(&descriptor).await.outcomes(), vec![Outcome::Updated]);
    let stored = store.head("raw/data.json").await.unwrap();
    assert_eq!(
        stored,
        VersionMarker::from_content(br#"{"data":[]}"#)
    );

    // Same bytes: fetched again but not rewritten.
    assert_eq!(engine.run(&descriptor).await.outcomes(), vec![Outcome::Unchanged]);
    assert_eq!(source.fetches("data.json"), 2);
    assert_eq!(store.puts(), 1);

    source.set("data.json", None, body(r#"{"data":[1]}"#));
    assert_eq!(engine.run(&descriptor).await.outcomes(), vec![Outcome::Updated]);
    assert_eq!(store.puts(), 2);
}

#[tokio::test]
async fn store_outage_fails_candidate_and_keeps_previous_object() {
    let (source, store, engine, descriptor) = setup();
    source.set("a.txt", Some("v1"), body("alpha"));
    engine.run(&descriptor).await;

    source.set("a.txt", Some("v2"), body("alpha 2"));
    store.refuse_puts.store(true, Ordering::SeqCst);
    let report = engine.run(&descriptor).await;

    assert!(matches!(
        report.candidates[0].outcome,
        Outcome::Failed(FailureReason::Store(_))
    ));
    let current = store.get("raw/a.txt").await.unwrap();
    assert_eq!(current.bytes, Bytes::from_static(b"alpha"));
    assert_eq!(current.meta.source_marker, VersionMarker::new("v1"));
}

#[tokio::test]
async fn listing_failure_is_reported_per_source() {
    let (source, store, engine, descriptor) = setup();
    source.set("a.txt", Some("v1"), body("alpha"));
    source.listing_down.store(true, Ordering::SeqCst);

    let other_source = Arc::new(ScriptedSource::default());
    other_source.set("b.txt", Some("v1"), body("beta"));
    let other = SourceDescriptor::new(other_source, "other/");

    let reports = engine.run_all(&[descriptor, other]).await;
    assert!(reports[0].listing_error.as_deref().unwrap().contains("403"));
    assert_eq!(reports[0].candidates.len(), 0);
    assert_eq!(reports[1].outcomes(), vec![Outcome::Updated]);
    assert_eq!(store.list("").await.unwrap(), vec!["other/b.txt"]);
}

#[tokio::test]
async fn tables_follow_their_raw_objects() {
    let (source, store, engine, descriptor) = setup();
    let descriptor = descriptor.with_table(TableFormat::tab_separated());
    source.set("series", Some("v1"), body("id\tvalue\nA\t1\nB\t2\n"));

    let report = engine.run(&descriptor).await;
    assert_eq!(
        report.candidates[0].table,
        Some(TableOutcome::Written {
            key: "raw/series.table".into(),
            rows: 2
        })
    );
    let table = Table::from_csv(&store.get("raw/series.table").await.unwrap().bytes).unwrap();
    assert_eq!(table.columns, vec!["id", "value"]);

    // Unchanged raw object and existing table: nothing rewritten.
    let report = engine.run(&descriptor).await;
    assert_eq!(report.candidates[0].table, None);
    assert_eq!(store.puts(), 2);

    // A payload that no longer parses leaves the previous table in place
    // while the raw object itself is still updated.
    source.set("series", Some("v2"), body("id\tvalue\nA\t1\textra\n"));
    let report = engine.run(&descriptor).await;
    assert_eq!(report.candidates[0].outcome, Outcome::Updated);
    assert!(matches!(
        report.candidates[0].table,
        Some(TableOutcome::Failed { .. })
    ));
    let table = Table::from_csv(&store.get("raw/series.table").await.unwrap().bytes).unwrap();
    assert_eq!(table.len(), 2);
}

#[tokio::test]
async fn table_missed_by_a_failed_put_is_rebuilt_on_the_next_run() {
    let (source, store, engine, descriptor) = setup();
    let descriptor = descriptor.with_table(TableFormat::tab_separated());
    source.set("series", Some("v1"), body("id\tvalue\nA\t1\n"));
    engine.run(&descriptor).await;

    // Every attempt of the table put fails while the raw put goes through.
    source.set("series", Some("v2"), body("id\tvalue\nA\t1\nB\t2\nC\t3\n"));
    store.table_put_failures.store(3, Ordering::SeqCst);
    let report = engine.run(&descriptor).await;
    assert_eq!(report.candidates[0].outcome, Outcome::Updated);
    assert!(matches!(
        report.candidates[0].table,
        Some(TableOutcome::Failed { .. })
    ));
    let table = Table::from_csv(&store.get("raw/series.table").await.unwrap().bytes).unwrap();
    assert_eq!(table.len(), 1);

    // Raw marker unchanged, but the table lags behind the raw content.
    let report = engine.run(&descriptor).await;
    assert_eq!(report.candidates[0].outcome, Outcome::Unchanged);
    assert_eq!(
        report.candidates[0].table,
        Some(TableOutcome::Written {
            key: "raw/series.table".into(),
            rows: 3
        })
    );
    assert_eq!(source.fetches("series"), 2);
    let table = Table::from_csv(&store.get("raw/series.table").await.unwrap().bytes).unwrap();
    assert_eq!(table.len(), 3);

    let report = engine.run(&descriptor).await;
    assert_eq!(report.candidates[0].table, None);
}

#[tokio::test]
async fn transient_table_put_failure_is_retried_within_the_run() {
    let (source, store, engine, descriptor) = setup();
    let descriptor = descriptor.with_table(TableFormat::tab_separated());
    source.set("series", Some("v1"), body("id\tvalue\nA\t1\nB\t2\n"));
    store.table_put_failures.store(2, Ordering::SeqCst);

    let report = engine.run(&descriptor).await;
    assert_eq!(
        report.candidates[0].table,
        Some(TableOutcome::Written {
            key: "raw/series.table".into(),
            rows: 2
        })
    );
    assert_eq!(store.table_put_failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unlisted_objects_are_removed_with_their_tables() {
    let (source, store, engine, descriptor) = setup();
    let descriptor = descriptor.with_table(TableFormat::tab_separated());
    source.set("keep", Some("v1"), body("id\n1\n"));
    source.set("gone", Some("v1"), body("id\n2\n"));
    engine.run(&descriptor).await;
    assert_eq!(
        store.list("raw/").await.unwrap(),
        vec!["raw/gone", "raw/gone.table", "raw/keep", "raw/keep.table"]
    );

    source.remove("gone");
    let report = engine.run(&descriptor).await;
    assert_eq!(report.outcomes(), vec![Outcome::Unchanged, Outcome::Removed]);
    assert_eq!(report.removed(), 1);
    assert_eq!(report.candidates[1].remote_id, "gone");
    assert_eq!(report.candidates[1].target_key, "raw/gone");
    assert_eq!(
        store.list("raw/").await.unwrap(),
        vec!["raw/keep", "raw/keep.table"]
    );

    let report = engine.run(&descriptor).await;
    assert_eq!(report.outcomes(), vec![Outcome::Unchanged]);
}

#[tokio::test]
async fn removal_stays_under_the_prefix_and_skips_empty_listings() {
    let (source, store, engine, descriptor) = setup();
    store
        .put("elsewhere/x", Bytes::from_static(b"x"), VersionMarker::new("m"))
        .await
        .unwrap();
    source.set("a.txt", Some("v1"), body("alpha"));
    source.set("b.txt", Some("v1"), body("beta"));
    engine.run(&descriptor).await;

    source.remove("b.txt");
    assert_eq!(
        engine.run(&descriptor).await.outcomes(),
        vec![Outcome::Unchanged, Outcome::Removed]
    );
    assert!(store.exists("elsewhere/x").await.unwrap());

    // An empty listing is not taken as "everything was deleted".
    source.remove("a.txt");
    let report = engine.run(&descriptor).await;
    assert!(report.candidates.is_empty());
    assert!(store.exists("raw/a.txt").await.unwrap());

    // Neither is a failed one.
    source.set("c.txt", Some("v1"), body("gamma"));
    source.listing_down.store(true, Ordering::SeqCst);
    engine.run(&descriptor).await;
    assert!(store.exists("raw/a.txt").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_runs_converge() {
    let source = Arc::new(ScriptedSource::default());
    for i in 0..8 {
        source.set(&format!("f{}.txt", i), Some("v1"), Reply::Body(Bytes::from(format!("file {}", i))));
    }
    let store = Arc::new(MemoryStore::new());
    let first = SyncEngine::new(store.clone(), settings());
    let second = SyncEngine::new(store.clone(), settings());
    let descriptor = SourceDescriptor::new(source.clone(), "raw/");

    let (a, b) = tokio::join!(first.run(&descriptor), second.run(&descriptor));
    assert_eq!(a.failed() + b.failed(), 0);

    for i in 0..8 {
        let object = store.get(&format!("raw/f{}.txt", i)).await.unwrap();
        assert_eq!(object.bytes, Bytes::from(format!("file {}", i)));
        assert_eq!(object.meta.source_marker, VersionMarker::new("v1"));
    }
    let report = first.run(&descriptor).await;
    assert_eq!(report.unchanged(), 8);
}
