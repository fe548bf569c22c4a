use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::{debug, error, info, warn};

use muster_parser::{read_clock_file, ClockEvent, TransactionKind, WorkerId};

use crate::directory::{DirectorySync, DutyUpdate};
use crate::store::{MappingStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Parsed,
    Empty,
    ParseError,
}

/// One file's contribution to a batch. Built at load time, discarded after
/// its disposition settles.
#[derive(Debug)]
pub struct BatchFile {
    pub path: PathBuf,
    pub filename: String,
    pub status: ParseStatus,
    /// Events in row order; empty for `Empty` and `ParseError` files.
    pub events: Vec<ClockEvent>,
    /// Usernames this file's workers resolve to. File success is judged
    /// against exactly this set.
    pub usernames: HashSet<String>,
    /// Distinct worker ids with no mapping, in order of first appearance.
    pub unmapped: Vec<WorkerId>,
    pub skipped_rows: usize,
}

/// The single duty-status outcome computed for one worker across the whole
/// batch: the chronologically latest event wins.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub worker: WorkerId,
    pub username: String,
    pub transaction: TransactionKind,
    pub timestamp: NaiveDateTime,
}

impl DesiredState {
    pub fn to_update(&self) -> DutyUpdate {
        DutyUpdate {
            username: self.username.clone(),
            on_duty_at: match self.transaction {
                TransactionKind::On => Some(self.timestamp),
                TransactionKind::Off => None,
            },
        }
    }
}

/// Everything a batch produced: what each file contained, what was pushed
/// upstream, and how each username fared.
#[derive(Debug)]
pub struct BatchReconciliation {
    pub files: Vec<BatchFile>,
    pub desired: Vec<DesiredState>,
    /// Per-username success from the bulk call. Absence means failure.
    pub results: HashMap<String, bool>,
    pub upstream_calls: u32,
}

impl BatchReconciliation {
    pub fn events_total(&self) -> usize {
        self.files.iter().map(|file| file.events.len()).sum()
    }
}

/// Process one batch of clock files end to end: parse each file, compute
/// one desired state per worker, and issue at most one upstream write. An
/// upstream failure is contained here by failing every slated worker; only
/// mapping-store errors propagate.
pub async fn reconcile_batch(
    store: &MappingStore,
    directory: &dyn DirectorySync,
    paths: &[PathBuf],
) -> Result<BatchReconciliation, StoreError> {
    let (files, resolved) = load_batch(store, paths).await?;
    let desired = desired_states(&files, &resolved);

    let (results, upstream_calls) = if desired.is_empty() {
        debug!("batch has no resolvable workers, skipping upstream call");
        (HashMap::new(), 0)
    } else {
        let updates: Vec<DutyUpdate> = desired.iter().map(DesiredState::to_update).collect();
        info!(
            files = files.len(),
            workers = updates.len(),
            "pushing duty-status updates"
        );
        match directory.bulk_set_duty_status(&updates).await {
            Ok(results) => (results, 1),
            Err(err) => {
                error!(error = %err, "bulk duty-status update failed, all workers in batch marked failed");
                let all_failed = desired
                    .iter()
                    .map(|state| (state.username.clone(), false))
                    .collect();
                (all_failed, 1)
            }
        }
    };

    Ok(BatchReconciliation {
        files,
        desired,
        results,
        upstream_calls,
    })
}

/// Parse every file in the batch and resolve its workers against the
/// mapping store. Per-file and per-row problems are logged and contained;
/// only store errors surface.
async fn load_batch(
    store: &MappingStore,
    paths: &[PathBuf],
) -> Result<(Vec<BatchFile>, HashMap<WorkerId, String>), StoreError> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(load_file(path));
    }

    let mut resolved: HashMap<WorkerId, String> = HashMap::new();
    let mut unmappable: HashSet<WorkerId> = HashSet::new();
    for file in &files {
        for event in &file.events {
            if resolved.contains_key(&event.worker) || unmappable.contains(&event.worker) {
                continue;
            }
            match store.username_for_worker(&event.worker).await? {
                Some(username) => {
                    resolved.insert(event.worker.clone(), username);
                }
                None => {
                    unmappable.insert(event.worker.clone());
                }
            }
        }
    }

    for file in &mut files {
        let mut unmapped: Vec<WorkerId> = Vec::new();
        for event in &file.events {
            if let Some(username) = resolved.get(&event.worker) {
                file.usernames.insert(username.clone());
            } else if !unmapped.contains(&event.worker) {
                warn!(
                    file = %file.filename,
                    worker = %event.worker,
                    "no mapping for worker, events dropped"
                );
                unmapped.push(event.worker.clone());
            }
        }
        file.unmapped = unmapped;
    }

    Ok((files, resolved))
}

fn load_file(path: &Path) -> BatchFile {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    match read_clock_file(path) {
        Ok(parsed) => {
            for row in &parsed.skipped {
                warn!(file = %filename, error = %row, "skipping unreadable row");
            }
            let status = if parsed.events.is_empty() {
                ParseStatus::Empty
            } else {
                ParseStatus::Parsed
            };
            debug!(
                file = %filename,
                events = parsed.events.len(),
                skipped = parsed.skipped.len(),
                "parsed clock file"
            );
            BatchFile {
                path: path.to_path_buf(),
                filename,
                status,
                events: parsed.events,
                usernames: HashSet::new(),
                unmapped: Vec::new(),
                skipped_rows: parsed.skipped.len(),
            }
        }
        Err(err) => {
            error!(file = %filename, error = %err, "failed to parse clock file");
            BatchFile {
                path: path.to_path_buf(),
                filename,
                status: ParseStatus::ParseError,
                events: Vec::new(),
                usernames: HashSet::new(),
                unmapped: Vec::new(),
                skipped_rows: 0,
            }
        }
    }
}

/// Reduce the pooled batch events to one state per worker. Events are
/// pooled in (file discovery, row) order, stable-sorted per worker by
/// timestamp, and the last one wins, so a timestamp tie falls to the event
/// later in the pool. Workers without a mapping contribute nothing. If two
/// worker ids share a username, the state with the latest event keeps the
/// username so the upstream payload stays uniquely keyed.
pub fn desired_states(
    files: &[BatchFile],
    resolved: &HashMap<WorkerId, String>,
) -> Vec<DesiredState> {
    let mut worker_order: Vec<&WorkerId> = Vec::new();
    let mut pooled: HashMap<&WorkerId, Vec<(&ClockEvent, usize)>> = HashMap::new();

    let mut seq = 0usize;
    for file in files {
        for event in &file.events {
            let events = pooled.entry(&event.worker).or_insert_with(|| {
                worker_order.push(&event.worker);
                Vec::new()
            });
            events.push((event, seq));
            seq += 1;
        }
    }

    let mut by_username: HashMap<String, (DesiredState, usize)> = HashMap::new();
    let mut username_order: Vec<String> = Vec::new();

    for worker in worker_order {
        let Some(username) = resolved.get(worker) else {
            continue;
        };
        let mut events = pooled.remove(worker).unwrap_or_default();
        events.sort_by_key(|(event, _)| event.timestamp);
        let Some(&(latest, seq)) = events.last() else {
            continue;
        };

        let state = DesiredState {
            worker: worker.clone(),
            username: username.clone(),
            transaction: latest.transaction,
            timestamp: latest.timestamp,
        };

        match by_username.get_mut(username) {
            Some((existing, existing_seq)) => {
                warn!(
                    username = %username,
                    "two worker ids map to one username, keeping the latest event"
                );
                if (state.timestamp, seq) >= (existing.timestamp, *existing_seq) {
                    *existing = state;
                    *existing_seq = seq;
                }
            }
            None => {
                username_order.push(username.clone());
                by_username.insert(username.clone(), (state, seq));
            }
        }
    }

    username_order
        .into_iter()
        .filter_map(|username| by_username.remove(&username).map(|(state, _)| state))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::NaiveDateTime;

    use muster_parser::{ClockEvent, GeoSample, TransactionKind, WorkerId, EVENT_TIMESTAMP_FORMAT};

    use super::*;
    use crate::db;
    use crate::directory::{DirectoryError, DirectoryUser};

    fn wid(value: &str) -> WorkerId {
        WorkerId::new(value).expect("bad test worker id")
    }

    fn event(worker: &str, kind: TransactionKind, stamp: &str) -> ClockEvent {
        ClockEvent {
            transaction: kind,
            worker: wid(worker),
            payroll_ref: String::new(),
            timestamp: NaiveDateTime::parse_from_str(stamp, EVENT_TIMESTAMP_FORMAT)
                .expect("bad test timestamp"),
            geo: GeoSample {
                status: 0,
                latitude: 0.0,
                longitude: 0.0,
                accuracy: 0.0,
            },
        }
    }

    fn file(name: &str, events: Vec<ClockEvent>) -> BatchFile {
        let status = if events.is_empty() {
            ParseStatus::Empty
        } else {
            ParseStatus::Parsed
        };
        BatchFile {
            path: PathBuf::from(name),
            filename: name.to_string(),
            status,
            events,
            usernames: HashSet::new(),
            unmapped: Vec::new(),
            skipped_rows: 0,
        }
    }

    fn mapping(pairs: &[(&str, &str)]) -> HashMap<WorkerId, String> {
        pairs
            .iter()
            .map(|(worker, username)| (wid(worker), username.to_string()))
            .collect()
    }

    #[test]
    fn latest_event_wins_across_files() {
        let files = vec![
            file("a.csv", vec![event("10001", TransactionKind::On, "20250115080000")]),
            file("b.csv", vec![event("10001", TransactionKind::Off, "20250115170000")]),
        ];
        let resolved = mapping(&[("10001", "asmith")]);

        let states = desired_states(&files, &resolved);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].transaction, TransactionKind::Off);
        assert_eq!(states[0].username, "asmith");
    }

    #[test]
    fn file_order_does_not_change_the_winner() {
        let early = event("10001", TransactionKind::On, "20250115080000");
        let late = event("10001", TransactionKind::Off, "20250115170000");

        let forward = vec![
            file("a.csv", vec![early.clone()]),
            file("b.csv", vec![late.clone()]),
        ];
        let backward = vec![file("b.csv", vec![late]), file("a.csv", vec![early])];
        let resolved = mapping(&[("10001", "asmith")]);

        assert_eq!(
            desired_states(&forward, &resolved)[0].transaction,
            TransactionKind::Off
        );
        assert_eq!(
            desired_states(&backward, &resolved)[0].transaction,
            TransactionKind::Off
        );
    }

    #[test]
    fn timestamp_ties_fall_to_the_later_pooled_event() {
        let stamp = "20250115120000";
        let files = vec![
            file("a.csv", vec![event("10001", TransactionKind::On, stamp)]),
            file("b.csv", vec![event("10001", TransactionKind::Off, stamp)]),
        ];
        let resolved = mapping(&[("10001", "asmith")]);

        let states = desired_states(&files, &resolved);
        assert_eq!(states[0].transaction, TransactionKind::Off);
    }

    #[test]
    fn one_state_per_worker() {
        let files = vec![file(
            "a.csv",
            vec![
                event("10001", TransactionKind::On, "20250115080000"),
                event("10001", TransactionKind::Off, "20250115120000"),
                event("10001", TransactionKind::On, "20250115140000"),
                event("10002", TransactionKind::On, "20250115090000"),
            ],
        )];
        let resolved = mapping(&[("10001", "asmith"), ("10002", "bjones")]);

        let states = desired_states(&files, &resolved);
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].worker, wid("10001"));
        assert_eq!(states[0].transaction, TransactionKind::On);
        assert_eq!(
            states[0].timestamp,
            NaiveDateTime::parse_from_str("20250115140000", EVENT_TIMESTAMP_FORMAT).unwrap()
        );
    }

    #[test]
    fn unmapped_workers_contribute_nothing() {
        let files = vec![file(
            "a.csv",
            vec![
                event("10001", TransactionKind::On, "20250115080000"),
                event("99999", TransactionKind::On, "20250115090000"),
            ],
        )];
        let resolved = mapping(&[("10001", "asmith")]);

        let states = desired_states(&files, &resolved);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].username, "asmith");
    }

    #[test]
    fn shared_username_keeps_the_latest_event() {
        let files = vec![file(
            "a.csv",
            vec![
                event("10001", TransactionKind::Off, "20250115170000"),
                event("10002", TransactionKind::On, "20250115080000"),
            ],
        )];
        let resolved = mapping(&[("10001", "asmith"), ("10002", "asmith")]);

        let states = desired_states(&files, &resolved);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].worker, wid("10001"));
        assert_eq!(states[0].transaction, TransactionKind::Off);
    }

    #[test]
    fn off_events_clear_and_on_events_set() {
        let files = vec![file(
            "a.csv",
            vec![
                event("10001", TransactionKind::On, "20250115080000"),
                event("10002", TransactionKind::Off, "20250115090000"),
            ],
        )];
        let resolved = mapping(&[("10001", "asmith"), ("10002", "bjones")]);

        let states = desired_states(&files, &resolved);
        let updates: Vec<DutyUpdate> = states.iter().map(DesiredState::to_update).collect();
        assert!(updates[0].on_duty_at.is_some());
        assert!(updates[1].on_duty_at.is_none());
    }

    struct StubDirectory {
        responses: HashMap<String, bool>,
        calls: Mutex<Vec<Vec<DutyUpdate>>>,
        fail: bool,
    }

    impl StubDirectory {
        fn succeeding(responses: &[(&str, bool)]) -> Self {
            Self {
                responses: responses
                    .iter()
                    .map(|(name, ok)| (name.to_string(), *ok))
                    .collect(),
                calls: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                responses: HashMap::new(),
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DirectorySync for StubDirectory {
        async fn bulk_set_duty_status(
            &self,
            updates: &[DutyUpdate],
        ) -> Result<HashMap<String, bool>, DirectoryError> {
            self.calls.lock().unwrap().push(updates.to_vec());
            if self.fail {
                return Err(DirectoryError::BadResponse("stub failure".to_string()));
            }
            Ok(self.responses.clone())
        }

        async fn fetch_users_with_attributes(
            &self,
            _fields: &[String],
        ) -> Result<Vec<DirectoryUser>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn find_stale_duty_status(
            &self,
            _older_than_hours: u32,
        ) -> Result<Vec<String>, DirectoryError> {
            Ok(Vec::new())
        }
    }

    async fn store_with(mappings: &[(&str, &str)]) -> MappingStore {
        let pool = db::connect_memory().await.expect("pool");
        db::run_migrations(&pool).await.expect("migrations");
        let store = MappingStore::new(pool);
        let rows: Vec<(String, String)> = mappings
            .iter()
            .map(|(worker, username)| (worker.to_string(), username.to_string()))
            .collect();
        if !rows.is_empty() {
            store.replace_mappings(&rows).await.expect("seed mappings");
        }
        store
    }

    fn write_clock_file(dir: &Path, name: &str, rows: &[&str]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, rows.join("\n")).expect("write clock file");
        path
    }

    #[tokio::test]
    async fn batch_makes_exactly_one_upstream_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = write_clock_file(
            dir.path(),
            "a.csv",
            &["BON,10001,1,20250115,080000,20250115080000,1,0,0,0"],
        );
        let b = write_clock_file(
            dir.path(),
            "b.csv",
            &[
                "BOF,10001,1,20250115,170000,20250115170000,1,0,0,0",
                "BON,10002,2,20250115,180000,20250115180000,1,0,0,0",
            ],
        );

        let store = store_with(&[("10001", "asmith"), ("10002", "bjones")]).await;
        let directory = StubDirectory::succeeding(&[("asmith", true), ("bjones", false)]);

        let batch = reconcile_batch(&store, &directory, &[a, b])
            .await
            .expect("reconcile failed");

        assert_eq!(directory.call_count(), 1);
        assert_eq!(batch.upstream_calls, 1);
        assert_eq!(batch.events_total(), 3);

        let updates = &directory.calls.lock().unwrap()[0];
        assert_eq!(updates.len(), 2);
        let asmith = updates.iter().find(|u| u.username == "asmith").unwrap();
        assert!(asmith.on_duty_at.is_none());
        let bjones = updates.iter().find(|u| u.username == "bjones").unwrap();
        assert!(bjones.on_duty_at.is_some());

        assert_eq!(batch.results.get("asmith"), Some(&true));
        assert_eq!(batch.results.get("bjones"), Some(&false));
    }

    #[tokio::test]
    async fn batch_without_resolvable_workers_skips_the_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = write_clock_file(
            dir.path(),
            "a.csv",
            &["BON,77777,1,20250115,080000,20250115080000,1,0,0,0"],
        );

        let store = store_with(&[]).await;
        let directory = StubDirectory::succeeding(&[]);

        let batch = reconcile_batch(&store, &directory, &[a])
            .await
            .expect("reconcile failed");

        assert_eq!(directory.call_count(), 0);
        assert_eq!(batch.upstream_calls, 0);
        assert!(batch.desired.is_empty());
        assert_eq!(batch.files[0].unmapped, vec![wid("77777")]);
    }

    #[tokio::test]
    async fn upstream_failure_marks_every_worker_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = write_clock_file(
            dir.path(),
            "a.csv",
            &[
                "BON,10001,1,20250115,080000,20250115080000,1,0,0,0",
                "BON,10002,2,20250115,090000,20250115090000,1,0,0,0",
            ],
        );

        let store = store_with(&[("10001", "asmith"), ("10002", "bjones")]).await;
        let directory = StubDirectory::failing();

        let batch = reconcile_batch(&store, &directory, &[a])
            .await
            .expect("reconcile failed");

        assert_eq!(batch.upstream_calls, 1);
        assert_eq!(batch.results.get("asmith"), Some(&false));
        assert_eq!(batch.results.get("bjones"), Some(&false));
    }

    #[tokio::test]
    async fn unreadable_files_are_contained_as_parse_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("ghost.csv");
        let good = write_clock_file(
            dir.path(),
            "good.csv",
            &["BON,10001,1,20250115,080000,20250115080000,1,0,0,0"],
        );

        let store = store_with(&[("10001", "asmith")]).await;
        let directory = StubDirectory::succeeding(&[("asmith", true)]);

        let batch = reconcile_batch(&store, &directory, &[missing, good])
            .await
            .expect("reconcile failed");

        assert_eq!(batch.files[0].status, ParseStatus::ParseError);
        assert_eq!(batch.files[1].status, ParseStatus::Parsed);
        assert_eq!(batch.upstream_calls, 1);
    }
}
