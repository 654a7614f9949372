use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use mediaguard::classifier::Classifier;
use mediaguard::config::MediaLimits;
use mediaguard::coordinator::{AlbumCoordinator, IgnoreReason, Submission};
use mediaguard::dispatch::ChannelSink;
use mediaguard::error::{EngineError, Result};
use mediaguard::ffmpeg::FfmpegExtractor;
use mediaguard::policy::{PolicyStore, StaticPolicyStore};
use mediaguard::sampler::VideoSampler;
use mediaguard::scoring::ScoringEngine;
use mediaguard::storage::LocalMediaSource;
use mediaguard::{
    Assessment, CategoryScoreSet, GroupVerdict, GuildMediaPolicy, ItemAnalyzer, MediaAnalyzer,
    MediaItem, MediaKind, Sender, Uncertainty,
};

const CHAT: i64 = -100_555;
const DEBOUNCE: Duration = Duration::from_millis(3000);

#[derive(Default)]
struct ScriptedAnalyzer {
    delay: Duration,
    violating: HashSet<i64>,
    failing: HashSet<i64>,
    panicking: HashSet<i64>,
    calls: AtomicUsize,
    /// Policy each call was made under, in call order
    policies: Mutex<Vec<GuildMediaPolicy>>,
}

#[async_trait]
impl ItemAnalyzer for ScriptedAnalyzer {
    async fn analyze(&self, item: &MediaItem, policy: &GuildMediaPolicy) -> Result<Assessment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.policies.lock().unwrap().push(policy.clone());
        tokio::time::sleep(self.delay).await;

        if self.panicking.contains(&item.message_id) {
            panic!("decoder blew up on message {}", item.message_id);
        }
        if self.failing.contains(&item.message_id) {
            return Err(EngineError::download(&item.remote_ref, "status 502"));
        }
        if self.violating.contains(&item.message_id) {
            return Ok(Assessment {
                is_violation: true,
                category: Some("real_nudity".into()),
                confidence_score: 0.82,
                reason_text: "real_nudity scored 0.82 (threshold 0.70)".into(),
                uncertainty: Uncertainty::Low,
            });
        }
        Ok(Assessment::clean("no blocked category reached 0.70 (primary: safe)"))
    }
}

fn analyzer(delay_ms: u64) -> ScriptedAnalyzer {
    ScriptedAnalyzer {
        delay: Duration::from_millis(delay_ms),
        ..Default::default()
    }
}

fn policy() -> GuildMediaPolicy {
    GuildMediaPolicy {
        blocked_categories: vec!["real_nudity".into(), "gore".into()],
        confidence_threshold: 0.7,
        ..Default::default()
    }
}

fn item(kind: MediaKind, chat_id: i64, group_key: Option<&str>, message_id: i64) -> MediaItem {
    MediaItem {
        kind,
        remote_ref: format!("media_{}.jpg", message_id),
        size_bytes: 64_000,
        duration_seconds: None,
        caption: None,
        group_key: group_key.map(str::to_string),
        chat_id,
        message_id,
        sender: Sender {
            user_id: 4242,
            tier_level: Some(1),
        },
        submitted_at: Utc::now(),
    }
}

fn photo(group_key: Option<&str>, message_id: i64) -> MediaItem {
    item(MediaKind::Photo, CHAT, group_key, message_id)
}

/// One policy for every chat, replaceable at runtime, answered after `delay`.
struct SwappablePolicyStore {
    policy: Mutex<GuildMediaPolicy>,
    delay: Duration,
}

impl SwappablePolicyStore {
    fn new(policy: GuildMediaPolicy, delay_ms: u64) -> Self {
        Self {
            policy: Mutex::new(policy),
            delay: Duration::from_millis(delay_ms),
        }
    }

    fn replace(&self, policy: GuildMediaPolicy) {
        *self.policy.lock().unwrap() = policy;
    }
}

#[async_trait]
impl PolicyStore for SwappablePolicyStore {
    async fn get_guild_media_policy(&self, _chat_id: i64) -> anyhow::Result<Option<GuildMediaPolicy>> {
        tokio::time::sleep(self.delay).await;
        Ok(Some(self.policy.lock().unwrap().clone()))
    }
}

fn setup(
    analyzer: Arc<ScriptedAnalyzer>,
    store: impl PolicyStore + 'static,
) -> (AlbumCoordinator, UnboundedReceiver<GroupVerdict>) {
    setup_shared(analyzer, Arc::new(store))
}

fn setup_shared(
    analyzer: Arc<ScriptedAnalyzer>,
    store: Arc<dyn PolicyStore>,
) -> (AlbumCoordinator, UnboundedReceiver<GroupVerdict>) {
    let (sink, rx) = ChannelSink::new();
    let coordinator = AlbumCoordinator::new(analyzer, store, Arc::new(sink), DEBOUNCE);
    (coordinator, rx)
}

fn default_store() -> StaticPolicyStore {
    StaticPolicyStore::with_default(policy())
}

#[tokio::test(start_paused = true)]
async fn test_album_collapses_into_one_verdict_after_quiet_window() {
    let analyzer = Arc::new(analyzer(500));
    let (coordinator, mut rx) = setup(analyzer.clone(), default_store());
    let start = Instant::now();

    for (i, message_id) in [1, 2, 3].into_iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(1000)).await;
        }
        match coordinator.submit(photo(Some("album-1"), message_id)).await {
            Submission::Buffered { items, .. } => assert_eq!(items, i + 1),
            other => panic!("expected buffered, got {:?}", other),
        }
    }
    assert_eq!(coordinator.open_albums(), 1);

    let verdict = rx.recv().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(5000));
    assert_eq!(verdict.group_key.as_deref(), Some("album-1"));
    assert_eq!(verdict.message_ids(), vec![1, 2, 3]);
    assert!(!verdict.has_violations());
    assert_eq!(verdict.sender.user_id, 4242);
    assert_eq!(analyzer.calls.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(coordinator.open_albums(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_one_violating_item_flags_the_album() {
    let analyzer = Arc::new(ScriptedAnalyzer {
        violating: HashSet::from([12]),
        ..analyzer(200)
    });
    let (coordinator, mut rx) = setup(analyzer, default_store());

    for message_id in 10..15 {
        coordinator.submit(photo(Some("album-2"), message_id)).await;
    }

    let verdict = rx.recv().await.unwrap();
    assert_eq!(verdict.all_items.len(), 5);
    assert_eq!(verdict.violating_items.len(), 1);
    let flagged = &verdict.violating_items[0];
    assert_eq!(flagged.item.message_id, 12);
    assert_eq!(flagged.category.as_deref(), Some("real_nudity"));
}

#[tokio::test(start_paused = true)]
async fn test_lone_item_is_dispatched_without_debounce() {
    let analyzer = Arc::new(ScriptedAnalyzer {
        violating: HashSet::from([7]),
        ..analyzer(400)
    });
    let (coordinator, mut rx) = setup(analyzer, default_store());
    let start = Instant::now();

    let group = match coordinator.submit(photo(None, 7)).await {
        Submission::Dispatched(group) => group,
        other => panic!("expected dispatch, got {:?}", other),
    };
    assert!(start.elapsed() < DEBOUNCE);
    assert!(group.group_key.is_none());
    assert_eq!(group.violating_items.len(), 1);
    assert_eq!(group.violating_items[0].confidence_score, 0.82);

    let delivered = rx.recv().await.unwrap();
    assert_eq!(delivered.message_ids(), vec![7]);
    assert_eq!(coordinator.open_albums(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_analysis_is_awaited_before_finalizing() {
    let analyzer = Arc::new(analyzer(10_000));
    let (coordinator, mut rx) = setup(analyzer, default_store());
    let start = Instant::now();

    coordinator.submit(photo(Some("album-3"), 1)).await;
    coordinator.submit(photo(Some("album-3"), 2)).await;

    let verdict = rx.recv().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(10_000));
    assert_eq!(verdict.all_items.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_and_panicking_items_count_as_clean() {
    let analyzer = Arc::new(ScriptedAnalyzer {
        failing: HashSet::from([2]),
        panicking: HashSet::from([3]),
        ..analyzer(100)
    });
    let (coordinator, mut rx) = setup(analyzer, default_store());

    for message_id in 1..=3 {
        coordinator.submit(photo(Some("album-4"), message_id)).await;
    }

    let verdict = rx.recv().await.unwrap();
    assert_eq!(verdict.all_items.len(), 3);
    assert!(!verdict.has_violations());

    let failed = &verdict.all_items[1];
    assert!(failed.reason_text.starts_with("not analyzed (download_failed)"));
    let panicked = &verdict.all_items[2];
    assert!(panicked.reason_text.starts_with("not analyzed"));
    assert!(!panicked.is_violation);
}

#[tokio::test(start_paused = true)]
async fn test_chats_without_enabled_policy_are_ignored() {
    let analyzer = Arc::new(analyzer(0));
    let mut store = StaticPolicyStore::new();
    store.insert(
        CHAT,
        GuildMediaPolicy {
            enabled: false,
            ..policy()
        },
    );
    let (coordinator, mut rx) = setup(analyzer.clone(), store);

    assert!(matches!(
        coordinator.submit(photo(Some("album-5"), 1)).await,
        Submission::Ignored(IgnoreReason::Disabled)
    ));
    assert!(matches!(
        coordinator.submit(item(MediaKind::Video, -1, None, 2)).await,
        Submission::Ignored(IgnoreReason::PolicyMissing)
    ));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.open_albums(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_trusted_sender_bypasses_checks() {
    let analyzer = Arc::new(analyzer(0));
    let store = StaticPolicyStore::with_default(GuildMediaPolicy {
        tier_bypass_level: Some(3),
        ..policy()
    });
    let (coordinator, _rx) = setup(analyzer.clone(), store);

    let mut trusted = photo(Some("album-6"), 1);
    trusted.sender.tier_level = Some(5);
    assert!(matches!(
        coordinator.submit(trusted).await,
        Submission::Ignored(IgnoreReason::Bypassed)
    ));
    assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.open_albums(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_same_group_key_in_different_chats_stays_separate() {
    let analyzer = Arc::new(analyzer(100));
    let (coordinator, mut rx) = setup(analyzer, default_store());

    coordinator.submit(item(MediaKind::Photo, -1, Some("shared"), 1)).await;
    coordinator.submit(item(MediaKind::Photo, -2, Some("shared"), 2)).await;
    coordinator.submit(item(MediaKind::Photo, -1, Some("shared"), 3)).await;
    assert_eq!(coordinator.open_albums(), 2);

    let mut verdicts = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
    verdicts.sort_by_key(|v| v.chat_id);
    assert_eq!(verdicts[0].chat_id, -2);
    assert_eq!(verdicts[0].message_ids(), vec![2]);
    assert_eq!(verdicts[1].message_ids(), vec![1, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_late_item_opens_a_new_album() {
    let analyzer = Arc::new(analyzer(100));
    let (coordinator, mut rx) = setup(analyzer, default_store());

    coordinator.submit(photo(Some("album-7"), 1)).await;
    let first = rx.recv().await.unwrap();
    assert_eq!(first.message_ids(), vec![1]);

    coordinator.submit(photo(Some("album-7"), 2)).await;
    let second = rx.recv().await.unwrap();
    assert_eq!(second.message_ids(), vec![2]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_open_albums_once() {
    let analyzer = Arc::new(analyzer(500));
    let (coordinator, mut rx) = setup(analyzer, default_store());
    let start = Instant::now();

    coordinator.submit(photo(Some("album-8"), 1)).await;
    coordinator.submit(photo(Some("album-8"), 2)).await;
    coordinator.shutdown().await;

    assert!(start.elapsed() < DEBOUNCE);
    assert_eq!(coordinator.open_albums(), 0);
    assert_eq!(rx.recv().await.unwrap().message_ids(), vec![1, 2]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_submissions() {
    let analyzer = Arc::new(analyzer(10_000));
    let store = SwappablePolicyStore::new(policy(), 2000);
    let (coordinator, mut rx) = setup(analyzer.clone(), store);
    let start = Instant::now();

    // Both are still waiting on the policy lookup when shutdown starts
    let lone = coordinator.spawn_submit(photo(None, 1));
    let late = coordinator.spawn_submit(photo(Some("album-10"), 2));
    coordinator.shutdown().await;

    assert!(start.elapsed() >= Duration::from_millis(12_000));
    assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(coordinator.open_albums(), 0);

    let mut delivered = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
    delivered.sort_by_key(|v| v.message_ids());
    assert_eq!(delivered[0].message_ids(), vec![1]);
    assert!(delivered[0].group_key.is_none());
    assert_eq!(delivered[1].message_ids(), vec![2]);
    assert_eq!(delivered[1].group_key.as_deref(), Some("album-10"));

    assert!(matches!(lone.await.unwrap(), Submission::Dispatched(_)));
    assert!(matches!(late.await.unwrap(), Submission::Dispatched(_)));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_album_closed_by_its_timer() {
    let analyzer = Arc::new(analyzer(10_000));
    let (coordinator, mut rx) = setup(analyzer, default_store());

    coordinator.submit(photo(Some("album-11"), 1)).await;
    // Debounce has fired and the album left the map, analysis still running
    tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;
    assert_eq!(coordinator.open_albums(), 0);

    coordinator.shutdown().await;
    assert_eq!(rx.try_recv().unwrap().message_ids(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_album_keeps_policy_snapshot_from_when_it_opened() {
    let analyzer = Arc::new(analyzer(100));
    let store = Arc::new(SwappablePolicyStore::new(policy(), 0));
    let (coordinator, mut rx) = setup_shared(analyzer.clone(), store.clone());

    assert!(matches!(
        coordinator.submit(photo(Some("album-12"), 1)).await,
        Submission::Buffered { items: 1, .. }
    ));

    let changed = GuildMediaPolicy {
        enabled: false,
        blocked_categories: vec!["weapons".into()],
        confidence_threshold: 0.2,
        ..Default::default()
    };
    store.replace(changed.clone());

    assert!(matches!(
        coordinator.submit(photo(Some("album-12"), 2)).await,
        Submission::Buffered { items: 2, .. }
    ));

    let verdict = rx.recv().await.unwrap();
    assert_eq!(verdict.message_ids(), vec![1, 2]);
    let seen = analyzer.policies.lock().unwrap().clone();
    assert_eq!(seen, vec![policy(), policy()]);

    // The next album reads the changed policy
    assert!(matches!(
        coordinator.submit(photo(Some("album-13"), 3)).await,
        Submission::Ignored(IgnoreReason::Disabled)
    ));
    assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
}

struct UnreachableClassifier {
    calls: AtomicUsize,
}

#[async_trait]
impl Classifier for UnreachableClassifier {
    async fn classify(&self, _image: &str, _caption: Option<&str>) -> Result<CategoryScoreSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::ClassificationUnavailable(
            "connection refused".into(),
        ))
    }
}

#[tokio::test]
async fn test_classifier_outage_fails_open_for_whole_album() {
    let media = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    for message_id in 1..=3 {
        std::fs::write(
            media.path().join(format!("media_{}.jpg", message_id)),
            b"not really a jpeg",
        )
        .unwrap();
    }

    let classifier = Arc::new(UnreachableClassifier {
        calls: AtomicUsize::new(0),
    });
    let analyzer = MediaAnalyzer::new(
        Arc::new(LocalMediaSource::new(media.path())),
        VideoSampler::new(Arc::new(FfmpegExtractor::new(1)), 2),
        ScoringEngine::new(classifier.clone(), Duration::from_secs(5)),
        MediaLimits::default(),
        scratch.path(),
    );
    let (sink, mut rx) = ChannelSink::new();
    let coordinator = AlbumCoordinator::new(
        Arc::new(analyzer),
        Arc::new(default_store()),
        Arc::new(sink),
        Duration::from_millis(50),
    );

    for message_id in 1..=3 {
        coordinator.submit(photo(Some("album-9"), message_id)).await;
    }

    let verdict = rx.recv().await.unwrap();
    assert_eq!(verdict.all_items.len(), 3);
    assert!(!verdict.has_violations());
    for v in &verdict.all_items {
        assert!(
            v.reason_text
                .starts_with("classification unavailable, treated as safe"),
            "unexpected reason: {}",
            v.reason_text
        );
        assert_eq!(v.uncertainty, Uncertainty::High);
    }
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}
