use super::*;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

const ALL_STATES: [ReplicaState; 7] = [
    ReplicaState::FromClient,
    ReplicaState::FromPool,
    ReplicaState::FromStore,
    ReplicaState::Cached,
    ReplicaState::Precious,
    ReplicaState::Broken,
    ReplicaState::Removed,
];

fn rid(value: &str) -> ReplicaId {
    ReplicaId::parse(value).unwrap()
}

struct ChannelListener(UnboundedSender<StateChangeEvent>);

impl StateChangeListener for ChannelListener {
    fn state_changed(&self, event: &StateChangeEvent) {
        let _ = self.0.send(event.clone());
    }
}

fn listen(repository: &ReplicaRepository) -> UnboundedReceiver<StateChangeEvent> {
    let (tx, rx) = unbounded_channel();
    repository.add_listener(Arc::new(ChannelListener(tx)));
    rx
}

/// Builds an entry that currently sits in `state`.
async fn entry_in_state(repository: &ReplicaRepository, id: &ReplicaId, state: ReplicaState) {
    match state {
        ReplicaState::FromClient | ReplicaState::FromPool | ReplicaState::FromStore => {
            repository.create_entry(id, state).await.unwrap();
        }
        ReplicaState::Cached | ReplicaState::Precious => {
            repository
                .create_entry(id, ReplicaState::FromClient)
                .await
                .unwrap();
            repository.complete_entry(id, state, 7, &[]).await.unwrap();
        }
        ReplicaState::Broken => {
            repository
                .create_entry(id, ReplicaState::FromClient)
                .await
                .unwrap();
            repository
                .complete_entry(id, ReplicaState::Cached, 7, &[])
                .await
                .unwrap();
            repository
                .set_state(id, ReplicaState::Broken, "checksum mismatch")
                .await
                .unwrap();
        }
        ReplicaState::Removed => unreachable!("removed entries do not exist"),
    }
}

#[tokio::test]
async fn set_state_accepts_exactly_the_transition_table() {
    let repository = ReplicaRepository::in_memory(test_dir("transitions"));
    let mut counter = 0usize;

    for from in ALL_STATES.into_iter().filter(|s| *s != ReplicaState::Removed) {
        for to in ALL_STATES {
            counter += 1;
            let id = rid(&format!("file-{counter}"));
            entry_in_state(&repository, &id, from).await;

            let result = repository.set_state(&id, to, "test").await;

            if transition_allowed(from, to) {
                assert!(result.is_ok(), "{from} -> {to} should be allowed");
                if to == ReplicaState::Removed {
                    assert!(matches!(
                        repository.get_entry(&id).await,
                        Err(RepositoryError::NotFound(_))
                    ));
                } else {
                    assert_eq!(repository.get_entry(&id).await.unwrap().state, to);
                }
            } else {
                assert!(
                    matches!(result, Err(RepositoryError::InvalidTransition { .. })),
                    "{from} -> {to} should be rejected, got {result:?}"
                );
                assert_eq!(repository.get_entry(&id).await.unwrap().state, from);
            }
        }
    }
}

#[test]
fn transition_table_rejects_backwards_moves() {
    assert!(!transition_allowed(ReplicaState::Cached, ReplicaState::FromStore));
    assert!(!transition_allowed(ReplicaState::Cached, ReplicaState::Precious));
    assert!(!transition_allowed(ReplicaState::Broken, ReplicaState::Cached));
    assert!(!transition_allowed(ReplicaState::Precious, ReplicaState::Removed));
    assert!(!transition_allowed(ReplicaState::FromPool, ReplicaState::Removed));
    assert!(transition_allowed(ReplicaState::FromStore, ReplicaState::Precious));
    assert!(transition_allowed(ReplicaState::Precious, ReplicaState::Cached));
}

#[tokio::test]
async fn unknown_ids_fail_with_not_found() {
    let repository = ReplicaRepository::in_memory(test_dir("not-found"));
    let id = rid("missing");

    assert!(matches!(
        repository.get_entry(&id).await,
        Err(RepositoryError::NotFound(_))
    ));
    assert!(matches!(
        repository
            .set_state(&id, ReplicaState::Cached, "test")
            .await,
        Err(RepositoryError::NotFound(_))
    ));
    assert!(matches!(
        repository
            .set_sticky(&id, "qos", Expiry::Never, false)
            .await,
        Err(RepositoryError::NotFound(_))
    ));
}

#[tokio::test]
async fn create_entry_rejects_duplicates_and_stable_initial_states() {
    let repository = ReplicaRepository::in_memory(test_dir("create"));
    let id = rid("dup");

    repository
        .create_entry(&id, ReplicaState::FromStore)
        .await
        .unwrap();
    assert!(matches!(
        repository.create_entry(&id, ReplicaState::FromPool).await,
        Err(RepositoryError::AlreadyExists(_))
    ));
    assert!(matches!(
        repository
            .create_entry(&rid("other"), ReplicaState::Cached)
            .await,
        Err(RepositoryError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn complete_entry_sets_size_and_pins() {
    let repository = ReplicaRepository::in_memory(test_dir("complete"));
    let id = rid("arriving");
    repository
        .create_entry(&id, ReplicaState::FromPool)
        .await
        .unwrap();

    let entry = repository
        .complete_entry(
            &id,
            ReplicaState::Precious,
            4096,
            &[StickyRecord::new("qos", Expiry::Never)],
        )
        .await
        .unwrap();

    assert_eq!(entry.state, ReplicaState::Precious);
    assert_eq!(entry.size, 4096);
    assert_eq!(entry.sticky_records, vec![StickyRecord::new("qos", Expiry::Never)]);

    assert!(matches!(
        repository
            .complete_entry(&id, ReplicaState::Cached, 1, &[])
            .await,
        Err(RepositoryError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn removability_follows_live_pins() {
    let repository = ReplicaRepository::in_memory(test_dir("removable"));
    let id = rid("cached");
    entry_in_state(&repository, &id, ReplicaState::Cached).await;

    assert!(repository.is_removable(&id).await.unwrap());

    repository
        .set_sticky(&id, "qos", Expiry::Never, false)
        .await
        .unwrap();
    assert!(!repository.is_removable(&id).await.unwrap());
    assert_eq!(repository.removable().await, Vec::<ReplicaId>::new());

    repository.clear_sticky(&id, "qos").await.unwrap();
    assert!(repository.is_removable(&id).await.unwrap());

    repository
        .set_sticky(&id, "resilience", Expiry::At(1), true)
        .await
        .unwrap();
    assert!(repository.is_removable(&id).await.unwrap());
    assert_eq!(repository.removable().await, vec![id]);
}

#[tokio::test]
async fn transient_entries_are_never_removable() {
    let repository = ReplicaRepository::in_memory(test_dir("transient"));
    let id = rid("incoming");
    entry_in_state(&repository, &id, ReplicaState::FromClient).await;

    assert!(!repository.is_removable(&id).await.unwrap());
    assert!(matches!(
        repository
            .set_state(&id, ReplicaState::Removed, "evict")
            .await,
        Err(RepositoryError::InvalidTransition { .. })
    ));
    assert!(matches!(
        repository
            .set_sticky(&id, "qos", Expiry::Never, false)
            .await,
        Err(RepositoryError::Incomplete(_))
    ));
}

#[tokio::test]
async fn sticky_overwrite_semantics_hold_through_repository() {
    let repository = ReplicaRepository::in_memory(test_dir("overwrite"));
    let id = rid("pinned");
    entry_in_state(&repository, &id, ReplicaState::Cached).await;
    let later = Expiry::At(unix_millis() + 60_000);

    repository
        .set_sticky(&id, "qos", Expiry::Never, false)
        .await
        .unwrap();
    let kept = repository
        .set_sticky(&id, "qos", later, false)
        .await
        .unwrap();
    assert_eq!(kept, PinOutcome::Kept(Expiry::Never));
    assert_eq!(
        repository.get_entry(&id).await.unwrap().sticky_records,
        vec![StickyRecord::new("qos", Expiry::Never)]
    );

    let replaced = repository
        .set_sticky(&id, "qos", later, true)
        .await
        .unwrap();
    assert_eq!(replaced, PinOutcome::Installed);
    assert_eq!(
        repository.get_entry(&id).await.unwrap().sticky_records,
        vec![StickyRecord::new("qos", later)]
    );
}

#[tokio::test]
async fn pinned_replica_cannot_be_removed() {
    let repository = ReplicaRepository::in_memory(test_dir("pinned-remove"));
    let id = rid("keep-me");
    entry_in_state(&repository, &id, ReplicaState::Cached).await;
    repository
        .set_sticky(&id, "system", Expiry::Never, true)
        .await
        .unwrap();

    assert!(matches!(
        repository
            .set_state(&id, ReplicaState::Removed, "evict")
            .await,
        Err(RepositoryError::Pinned(_))
    ));
    assert_eq!(
        repository.get_entry(&id).await.unwrap().state,
        ReplicaState::Cached
    );
}

#[tokio::test]
async fn status_reports_composite_flags() {
    let repository = ReplicaRepository::in_memory(test_dir("status"));

    let broken = rid("broken");
    entry_in_state(&repository, &broken, ReplicaState::Broken).await;
    repository
        .set_sticky(&broken, "system", Expiry::Never, true)
        .await
        .unwrap();
    let status = repository.status(&broken, "system").await.unwrap();
    assert!(status.exists && status.broken && status.system_sticky);
    assert!(!status.readable && !status.removable && !status.waiting);

    let precious = rid("precious");
    entry_in_state(&repository, &precious, ReplicaState::Precious).await;
    let status = repository.status(&precious, "system").await.unwrap();
    assert!(status.precious && status.readable);
    assert!(!status.removable && !status.system_sticky);

    let waiting = rid("waiting");
    entry_in_state(&repository, &waiting, ReplicaState::FromStore).await;
    let status = repository.status(&waiting, "system").await.unwrap();
    assert!(status.waiting && !status.readable && !status.removable);
}

#[tokio::test]
async fn listeners_see_transitions_in_order() {
    let repository = ReplicaRepository::in_memory(test_dir("listeners"));
    let mut events = listen(&repository);
    let id = rid("observed");

    entry_in_state(&repository, &id, ReplicaState::Precious).await;
    repository
        .set_state(&id, ReplicaState::Cached, "archived")
        .await
        .unwrap();
    repository
        .set_state(&id, ReplicaState::Broken, "checksum mismatch")
        .await
        .unwrap();
    repository
        .set_state(&id, ReplicaState::Removed, "cleanup")
        .await
        .unwrap();

    let mut seen = Vec::new();
    while seen.len() < 5 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event delivery timed out")
            .expect("dispatcher stopped");
        seen.push((event.old_state, event.new_state));
    }

    assert_eq!(
        seen,
        vec![
            (ReplicaState::Removed, ReplicaState::FromClient),
            (ReplicaState::FromClient, ReplicaState::Precious),
            (ReplicaState::Precious, ReplicaState::Cached),
            (ReplicaState::Cached, ReplicaState::Broken),
            (ReplicaState::Broken, ReplicaState::Removed),
        ]
    );
}

/// Blocks on its first event until the test drops the release handle.
struct StalledListener(std::sync::Mutex<std::sync::mpsc::Receiver<()>>);

impl StateChangeListener for StalledListener {
    fn state_changed(&self, _event: &StateChangeEvent) {
        if let Ok(release) = self.0.lock() {
            let _ = release.recv();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_listener_does_not_block_mutators() {
    let repository = ReplicaRepository::in_memory(test_dir("stalled-listener"));
    let (release, stalled) = std::sync::mpsc::channel::<()>();
    repository.add_listener(Arc::new(StalledListener(std::sync::Mutex::new(stalled))));

    let mutations = async {
        for n in 0..3_000 {
            let id = rid(&format!("busy-{n}"));
            repository
                .create_entry(&id, ReplicaState::FromStore)
                .await
                .unwrap();
            repository
                .complete_entry(&id, ReplicaState::Cached, 1, &[])
                .await
                .unwrap();
        }
        repository
            .set_state(&rid("busy-0"), ReplicaState::Removed, "cleanup")
            .await
            .unwrap();
    };
    tokio::time::timeout(Duration::from_secs(20), mutations)
        .await
        .expect("mutations blocked behind a stalled listener");

    drop(release);
}

struct PanickingListener;

impl StateChangeListener for PanickingListener {
    fn state_changed(&self, event: &StateChangeEvent) {
        if event.id.as_str() == "explodes" {
            panic!("listener failure for {}", event.id);
        }
    }
}

#[tokio::test]
async fn panicking_listener_does_not_silence_others() {
    let repository = ReplicaRepository::in_memory(test_dir("panicking-listener"));
    repository.add_listener(Arc::new(PanickingListener));
    let mut events = listen(&repository);

    repository
        .create_entry(&rid("explodes"), ReplicaState::FromClient)
        .await
        .unwrap();
    repository
        .create_entry(&rid("afterwards"), ReplicaState::FromClient)
        .await
        .unwrap();

    let mut ids = Vec::new();
    while ids.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event delivery timed out")
            .expect("dispatcher stopped");
        ids.push(event.id.as_str().to_string());
    }
    assert_eq!(ids, vec!["explodes".to_string(), "afterwards".to_string()]);
}

#[tokio::test]
async fn failed_transition_emits_no_event() {
    let repository = ReplicaRepository::in_memory(test_dir("no-event"));
    let id = rid("quiet");
    entry_in_state(&repository, &id, ReplicaState::Cached).await;
    let mut events = listen(&repository);

    let _ = repository
        .set_state(&id, ReplicaState::FromStore, "nope")
        .await;

    let received = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
    assert!(received.is_err(), "no event expected, got {received:?}");
}

#[tokio::test]
async fn concurrent_demotions_have_a_single_winner() {
    let repository = Arc::new(ReplicaRepository::in_memory(test_dir("race")));
    let id = rid("contended");
    entry_in_state(&repository, &id, ReplicaState::Precious).await;

    let mut tasks = Vec::new();
    for n in 0..8 {
        let repository = Arc::clone(&repository);
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            repository
                .set_state(&id, ReplicaState::Cached, &format!("mutator-{n}"))
                .await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(RepositoryError::InvalidTransition { from, .. }) => {
                assert_eq!(from, ReplicaState::Cached)
            }
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn concurrent_pins_from_many_owners_all_land() {
    let repository = Arc::new(ReplicaRepository::in_memory(test_dir("pins")));
    let id = rid("shared");
    entry_in_state(&repository, &id, ReplicaState::Cached).await;

    let mut tasks = Vec::new();
    for n in 0..32 {
        let repository = Arc::clone(&repository);
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            repository
                .set_sticky(&id, &format!("owner-{n}"), Expiry::Never, false)
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(
        repository.get_entry(&id).await.unwrap().sticky_records.len(),
        32
    );
}

#[tokio::test]
async fn update_entry_times_out_without_applying() {
    let repository = ReplicaRepository::in_memory(test_dir("update-timeout"));
    let id = rid("busy");
    entry_in_state(&repository, &id, ReplicaState::Precious).await;

    {
        let _held = repository.lock(&id).await.unwrap();
        let result = repository
            .update_entry(
                &id,
                ReplicaState::Cached,
                &[StickyRecord::new("migration", Expiry::Never)],
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(RepositoryError::Timeout(_))));
    }

    let entry = repository.get_entry(&id).await.unwrap();
    assert_eq!(entry.state, ReplicaState::Precious);
    assert!(entry.sticky_records.is_empty());
}

#[tokio::test]
async fn update_entry_applies_state_and_pins_together() {
    let repository = ReplicaRepository::in_memory(test_dir("update"));
    let id = rid("updated");
    entry_in_state(&repository, &id, ReplicaState::Precious).await;

    let entry = repository
        .update_entry(
            &id,
            ReplicaState::Cached,
            &[StickyRecord::new("pin-manager", Expiry::Never)],
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(entry.state, ReplicaState::Cached);
    assert!(entry.is_pinned(unix_millis()));

    assert!(matches!(
        repository
            .update_entry(&id, ReplicaState::Precious, &[], Duration::from_secs(1))
            .await,
        Err(RepositoryError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn abort_discards_partial_data() {
    let dir = test_dir("abort");
    let repository = ReplicaRepository::in_memory(&dir);
    let id = rid("partial");
    repository
        .create_entry(&id, ReplicaState::FromPool)
        .await
        .unwrap();
    write_atomic(&repository.partial_path(&id), b"half")
        .await
        .unwrap();

    repository.abort_entry(&id, "cancelled").await.unwrap();

    assert!(!repository.partial_path(&id).exists());
    assert!(matches!(
        repository.get_entry(&id).await,
        Err(RepositoryError::NotFound(_))
    ));
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn purge_drops_only_expired_pins() {
    let repository = ReplicaRepository::in_memory(test_dir("purge"));
    let id = rid("sweep");
    entry_in_state(&repository, &id, ReplicaState::Cached).await;
    {
        let mut guard = repository.lock(&id).await.unwrap();
        guard.sticky = StickyLedger::from_records([
            StickyRecord::new("old", Expiry::At(1)),
            StickyRecord::new("forever", Expiry::Never),
        ]);
    }

    assert_eq!(repository.purge_expired_sticky().await.unwrap(), 1);
    assert_eq!(
        repository.get_entry(&id).await.unwrap().sticky_records,
        vec![StickyRecord::new("forever", Expiry::Never)]
    );
}

#[tokio::test]
async fn reopen_restores_entries_and_recovers_incomplete_ones() {
    let root = test_dir("reopen");

    {
        let repository = ReplicaRepository::open(&root).await.unwrap();
        let done = rid("done");
        repository
            .create_entry(&done, ReplicaState::FromClient)
            .await
            .unwrap();
        repository
            .complete_entry(
                &done,
                ReplicaState::Precious,
                12,
                &[StickyRecord::new("qos", Expiry::Never)],
            )
            .await
            .unwrap();
        repository
            .create_entry(&rid("half"), ReplicaState::FromPool)
            .await
            .unwrap();
    }

    let reopened = ReplicaRepository::open(&root).await.unwrap();
    assert_eq!(reopened.len(), 2);

    let done = reopened.get_entry(&rid("done")).await.unwrap();
    assert_eq!(done.state, ReplicaState::Precious);
    assert_eq!(done.size, 12);
    assert_eq!(done.sticky_records, vec![StickyRecord::new("qos", Expiry::Never)]);

    let half = reopened.get_entry(&rid("half")).await.unwrap();
    assert_eq!(half.state, ReplicaState::Broken);

    let _ = std::fs::remove_dir_all(root);
}

#[tokio::test]
async fn removal_deletes_metadata_record() {
    let root = test_dir("remove-meta");
    let repository = ReplicaRepository::open(&root).await.unwrap();
    let id = rid("gone");
    entry_in_state(&repository, &id, ReplicaState::Cached).await;
    assert!(root.join("meta").join("gone.json").exists());

    repository
        .set_state(&id, ReplicaState::Removed, "evicted")
        .await
        .unwrap();
    assert!(!root.join("meta").join("gone.json").exists());

    let _ = std::fs::remove_dir_all(root);
}
