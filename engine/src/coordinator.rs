//! Album batching.
//!
//! Each arriving item is analysed right away in its own task. Items that
//! share an album key are buffered until no new item has arrived for the
//! debounce window; then every outstanding task is awaited and one
//! [`GroupVerdict`] goes to the sink. Items without an album key skip the
//! buffer and are dispatched as soon as their analysis finishes.
//!
//! Per album: absent -> open (buffer + timer) -> closing (buffer removed,
//! draining tasks) -> closed (verdict dispatched). The album map is the only
//! shared state; it is only touched under a short synchronous lock.
//!
//! Every submission, lone dispatch and finalization holds an [`InFlight`]
//! guard so [`AlbumCoordinator::shutdown`] can wait for all of them.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::analysis::ItemAnalyzer;
use crate::dispatch::VerdictSink;
use crate::error::EngineError;
use crate::models::{Assessment, GroupVerdict, GuildMediaPolicy, ItemVerdict, MediaItem};
use crate::policy::PolicyStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlbumKey {
    pub chat_id: i64,
    pub group_key: String,
}

impl fmt::Display for AlbumKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chat_id, self.group_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Chat has no media policy
    PolicyMissing,
    /// Policy lookup errored
    PolicyUnavailable,
    Disabled,
    /// Sender's tier bypasses media checks
    Bypassed,
    /// Runtime dropped the analysis before a verdict existed
    Cancelled,
}

#[derive(Debug)]
pub enum Submission {
    Ignored(IgnoreReason),
    /// Item joined an open album; `items` counts it.
    Buffered { album: AlbumKey, items: usize },
    Dispatched(GroupVerdict),
}

struct GroupBuffer {
    tasks: Vec<JoinHandle<ItemVerdict>>,
    policy: Arc<GuildMediaPolicy>,
    /// Bumped on every arrival; a timer only closes the generation it armed.
    generation: u64,
    timer: Option<JoinHandle<()>>,
    opened_at: Instant,
}

struct Inner {
    analyzer: Arc<dyn ItemAnalyzer>,
    policies: Arc<dyn PolicyStore>,
    sink: Arc<dyn VerdictSink>,
    debounce: Duration,
    albums: Mutex<HashMap<AlbumKey, GroupBuffer>>,
    /// Set by shutdown under the album lock; no album opens afterwards.
    closed: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Counts one unit of outstanding work until dropped.
struct InFlight(Arc<Inner>);

impl InFlight {
    fn enter(inner: &Arc<Inner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(inner.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct AlbumCoordinator {
    inner: Arc<Inner>,
}

impl AlbumCoordinator {
    pub fn new(
        analyzer: Arc<dyn ItemAnalyzer>,
        policies: Arc<dyn PolicyStore>,
        sink: Arc<dyn VerdictSink>,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                analyzer,
                policies,
                sink,
                debounce,
                albums: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn open_albums(&self) -> usize {
        self.inner.albums().len()
    }

    /// Accept one media item.
    ///
    /// Album items return as soon as they are buffered. Lone items return
    /// after their verdict has been dispatched.
    pub async fn submit(&self, item: MediaItem) -> Submission {
        let _in_flight = InFlight::enter(&self.inner);
        match item.group_key.clone() {
            Some(group_key) => {
                let album = AlbumKey {
                    chat_id: item.chat_id,
                    group_key,
                };
                self.submit_to_album(album, item).await
            }
            None => self.submit_single(item).await,
        }
    }

    /// [`submit`](Self::submit) on a background task. The work counts as in
    /// flight from the moment this returns.
    pub fn spawn_submit(&self, item: MediaItem) -> JoinHandle<Submission> {
        let in_flight = InFlight::enter(&self.inner);
        let coordinator = self.clone();
        tokio::spawn(async move {
            let _in_flight = in_flight;
            let chat_id = item.chat_id;
            let message_id = item.message_id;
            let submission = coordinator.submit(item).await;
            if let Submission::Ignored(reason) = &submission {
                tracing::debug!(chat_id, message_id, ?reason, "media item ignored");
            }
            submission
        })
    }

    async fn submit_single(&self, item: MediaItem) -> Submission {
        let policy = match self.inner.resolve_policy(item.chat_id).await {
            Ok(policy) => policy,
            Err(reason) => return Submission::Ignored(reason),
        };
        if policy.bypasses(&item.sender) {
            return Submission::Ignored(IgnoreReason::Bypassed);
        }
        self.dispatch_alone(item, policy, None).await
    }

    /// Analyse one item and dispatch it as its own group.
    async fn dispatch_alone(
        &self,
        item: MediaItem,
        policy: Arc<GuildMediaPolicy>,
        group_key: Option<String>,
    ) -> Submission {
        // Awaited through its own task so dispatch still happens if our
        // caller goes away.
        let inner = self.inner.clone();
        let in_flight = InFlight::enter(&inner);
        let analysis = spawn_analysis(&inner, item, policy);
        let handle = tokio::spawn(async move {
            let _in_flight = in_flight;
            let verdict = match analysis.await {
                Ok(verdict) => verdict,
                Err(e) => {
                    tracing::error!(error = %e, "analysis task lost");
                    return None;
                }
            };
            let group = GroupVerdict::from_items(group_key, vec![verdict])?;
            inner.sink.on_group_verdict(group.clone()).await;
            Some(group)
        });

        match handle.await {
            Ok(Some(group)) => Submission::Dispatched(group),
            Ok(None) => Submission::Ignored(IgnoreReason::Cancelled),
            Err(e) => {
                tracing::error!(error = %e, "dispatch task lost");
                Submission::Ignored(IgnoreReason::Cancelled)
            }
        }
    }

    async fn submit_to_album(&self, album: AlbumKey, item: MediaItem) -> Submission {
        let snapshot = self.inner.albums().get(&album).map(|b| b.policy.clone());
        let policy = match snapshot {
            Some(policy) => policy,
            None => match self.inner.resolve_policy(album.chat_id).await {
                Ok(policy) => policy,
                Err(reason) => return Submission::Ignored(reason),
            },
        };

        let policy = {
            let mut albums = self.inner.albums();
            // Another item may have opened the album while we fetched policy
            let policy = albums
                .get(&album)
                .map(|b| b.policy.clone())
                .unwrap_or(policy);
            if policy.bypasses(&item.sender) {
                return Submission::Ignored(IgnoreReason::Bypassed);
            }

            if !self.inner.closed.load(Ordering::SeqCst) {
                let buffer = albums.entry(album.clone()).or_insert_with(|| {
                    tracing::debug!(album = %album, "album opened");
                    GroupBuffer {
                        tasks: Vec::new(),
                        policy: policy.clone(),
                        generation: 0,
                        timer: None,
                        opened_at: Instant::now(),
                    }
                });

                buffer.tasks.push(spawn_analysis(&self.inner, item, policy));
                buffer.generation += 1;
                if let Some(previous) = buffer.timer.take() {
                    previous.abort();
                }
                buffer.timer = Some(arm_timer(&self.inner, album.clone(), buffer.generation));

                let items = buffer.tasks.len();
                tracing::debug!(album = %album, items, "item buffered, debounce re-armed");
                return Submission::Buffered { album, items };
            }
            policy
        };

        tracing::info!(album = %album, message_id = item.message_id, "shutting down, dispatching album item alone");
        self.dispatch_alone(item, policy, Some(album.group_key)).await
    }

    /// Close every open album now and wait until every verdict is out.
    ///
    /// Submissions still in flight finish first. Album items that arrive
    /// after this call are dispatched on their own instead of opening an
    /// album.
    pub async fn shutdown(&self) {
        let drained: Vec<(AlbumKey, GroupBuffer)> = {
            let mut albums = self.inner.albums();
            self.inner.closed.store(true, Ordering::SeqCst);
            albums.drain().collect()
        };

        if !drained.is_empty() {
            tracing::info!(albums = drained.len(), "flushing open albums");
            let mut finalizers = Vec::with_capacity(drained.len());
            for (album, mut buffer) in drained {
                if let Some(timer) = buffer.timer.take() {
                    timer.abort();
                }
                finalizers.push(tokio::spawn(finalize(self.inner.clone(), album, buffer)));
            }
            for finalizer in finalizers {
                if let Err(e) = finalizer.await {
                    tracing::error!(error = %e, "album finalizer lost");
                }
            }
        }

        self.inner.wait_idle().await;
    }
}

impl Inner {
    fn albums(&self) -> MutexGuard<'_, HashMap<AlbumKey, GroupBuffer>> {
        self.albums.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn resolve_policy(&self, chat_id: i64) -> Result<Arc<GuildMediaPolicy>, IgnoreReason> {
        match self.policies.get_guild_media_policy(chat_id).await {
            Ok(Some(policy)) if policy.enabled => Ok(Arc::new(policy.normalized())),
            Ok(Some(_)) => Err(IgnoreReason::Disabled),
            Ok(None) => {
                let missing = EngineError::PolicyMissing(chat_id);
                tracing::debug!(error = %missing, error_kind = missing.kind(), "media checks disabled");
                Err(IgnoreReason::PolicyMissing)
            }
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "policy lookup failed, skipping media checks");
                Err(IgnoreReason::PolicyUnavailable)
            }
        }
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            let pending = self.in_flight.load(Ordering::SeqCst);
            if pending == 0 {
                return;
            }
            tracing::info!(pending, "waiting for in-flight media");
            idle.await;
        }
    }

    /// Remove the album if `generation` is still the latest arrival.
    fn close(&self, album: &AlbumKey, generation: u64) -> Option<GroupBuffer> {
        let mut albums = self.albums();
        match albums.get(album) {
            Some(buffer) if buffer.generation == generation => albums.remove(album),
            _ => None,
        }
    }
}

/// Start analysing one item. The task never fails: errors and panics in
/// the analyzer become a clean verdict with the reason recorded.
fn spawn_analysis(
    inner: &Arc<Inner>,
    item: MediaItem,
    policy: Arc<GuildMediaPolicy>,
) -> JoinHandle<ItemVerdict> {
    let analyzer = inner.analyzer.clone();
    let span = tracing::info_span!(
        "analyze",
        chat_id = item.chat_id,
        message_id = item.message_id,
        kind = %item.kind,
        album = item.group_key.as_deref().unwrap_or("-"),
    );

    tokio::spawn(
        async move {
            let outcome = AssertUnwindSafe(analyzer.analyze(&item, &policy))
                .catch_unwind()
                .await;

            let assessment = match outcome {
                Ok(Ok(assessment)) => assessment,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, error_kind = e.kind(), "analysis failed, treating item as clean");
                    Assessment::clean(format!("not analyzed ({}): {}", e.kind(), e))
                }
                Err(_) => {
                    tracing::error!("analysis panicked, treating item as clean");
                    Assessment::clean("not analyzed: analysis panicked")
                }
            };
            ItemVerdict::new(item, assessment)
        }
        .instrument(span),
    )
}

fn arm_timer(inner: &Arc<Inner>, album: AlbumKey, generation: u64) -> JoinHandle<()> {
    let inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(inner.debounce).await;
        // Entered before the album leaves the map so shutdown never sees a
        // gap between the two.
        let in_flight = InFlight::enter(&inner);
        if let Some(buffer) = inner.close(&album, generation) {
            // Finalization runs detached so aborting a stale timer handle
            // can never cut it short.
            tokio::spawn(async move {
                let _in_flight = in_flight;
                finalize(inner, album, buffer).await;
            });
        }
    })
}

async fn finalize(inner: Arc<Inner>, album: AlbumKey, buffer: GroupBuffer) {
    let expected = buffer.tasks.len();
    let mut verdicts = Vec::with_capacity(expected);
    for task in buffer.tasks {
        match task.await {
            Ok(verdict) => verdicts.push(verdict),
            Err(e) => tracing::error!(album = %album, error = %e, "analysis task lost"),
        }
    }

    let Some(group) = GroupVerdict::from_items(Some(album.group_key.clone()), verdicts) else {
        return;
    };

    let elapsed_ms = buffer.opened_at.elapsed().as_millis() as u64;
    if group.has_violations() {
        tracing::info!(
            album = %album,
            user_id = group.sender.user_id,
            items = group.all_items.len(),
            violations = group.violating_items.len(),
            elapsed_ms,
            "album finalized with violations"
        );
    } else {
        tracing::debug!(album = %album, items = group.all_items.len(), elapsed_ms, "album finalized clean");
    }
    if group.all_items.len() != expected {
        tracing::warn!(album = %album, expected, got = group.all_items.len(), "album finalized with missing items");
    }

    inner.sink.on_group_verdict(group).await;
}
