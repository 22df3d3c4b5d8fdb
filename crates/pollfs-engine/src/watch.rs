//! Polling file change notifier
//!
//! [`PollingWatcher`] runs one background thread that wakes every poll interval,
//! compares each watched file's modification time and length with the previous
//! observation, and hands a [`FileChange`] to the subscriber's callback.
//! Callbacks run on the watcher thread, outside any internal lock.

use pollfs_config::WatchConfig;
use pollfs_types::{
    ChangeCallback, ChangeKind, ChangeNotifier, Error, FileChange, PollInterval, Result,
    SubscriptionId,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use tracing::{debug, trace, warn};
use uuid::Uuid;

type SharedCallback = Arc<dyn Fn(&FileChange) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    modified: Option<SystemTime>,
    len: u64,
}

impl Snapshot {
    fn take(path: &Path) -> Option<Self> {
        fs::metadata(path).ok().map(|metadata| Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }
}

struct Subscription {
    path: PathBuf,
    callback: SharedCallback,
    last: Option<Snapshot>,
}

type Subscriptions = Arc<Mutex<HashMap<SubscriptionId, Subscription>>>;

/// Change notifier that polls file metadata from a background thread
pub struct PollingWatcher {
    interval: PollInterval,
    subscriptions: Subscriptions,
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl PollingWatcher {
    /// Start a watcher polling every `interval`
    pub fn new(interval: PollInterval) -> Result<Self> {
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let (stop, stopped) = mpsc::channel::<()>();

        let shared = Arc::clone(&subscriptions);
        let period = interval.get();
        let worker = thread::Builder::new()
            .name("pollfs-watch".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        poll_subscriptions(&shared);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| Error::Io {
                message: format!("failed to spawn watcher thread: {}", e),
                os_code: e.raw_os_error(),
            })?;

        debug!("Started polling watcher every {:?}", period);
        Ok(Self {
            interval,
            subscriptions,
            stop: Some(stop),
            worker: Some(worker),
        })
    }

    /// Start a watcher from the `watch` configuration section
    pub fn from_config(config: &WatchConfig) -> Result<Self> {
        let interval = PollInterval::new(config.poll_interval()).map_err(Error::config)?;
        Self::new(interval)
    }

    /// Interval between polls
    pub fn interval(&self) -> PollInterval {
        self.interval
    }

    /// Number of active subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the background thread is still polling
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Run one poll on the calling thread; returns the number of changes delivered
    pub fn poll_now(&self) -> usize {
        poll_subscriptions(&self.subscriptions)
    }

    /// Stop the background thread and wait for it
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Watcher thread panicked");
            }
            debug!("Stopped polling watcher");
        }
    }
}

impl ChangeNotifier for PollingWatcher {
    fn subscribe(&self, path: &Path, callback: ChangeCallback) -> Result<SubscriptionId> {
        pollfs_types::validate_path(path)?;

        let id = Uuid::new_v4();
        let subscription = Subscription {
            path: path.to_path_buf(),
            callback: Arc::from(callback),
            last: Snapshot::take(path),
        };
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, subscription);

        debug!("Subscription {} watches {}", id, path.display());
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let removed = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        match removed {
            Some(subscription) => {
                debug!("Subscription {} on {} removed", id, subscription.path.display());
                Ok(())
            }
            None => Err(Error::invalid_argument(format!(
                "unknown subscription {}",
                id
            ))),
        }
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PollingWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingWatcher")
            .field("interval", &self.interval)
            .field("subscriptions", &self.subscription_count())
            .field("running", &self.is_running())
            .finish()
    }
}

fn classify(before: Option<Snapshot>, after: Option<Snapshot>) -> Option<ChangeKind> {
    match (before, after) {
        (None, Some(_)) => Some(ChangeKind::Created),
        (Some(_), None) => Some(ChangeKind::Removed),
        (Some(before), Some(after)) if before != after => Some(ChangeKind::Modified),
        _ => None,
    }
}

fn poll_subscriptions(subscriptions: &Mutex<HashMap<SubscriptionId, Subscription>>) -> usize {
    let changes: Vec<(SharedCallback, FileChange)> = {
        let mut subscriptions = subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        subscriptions
            .values_mut()
            .filter_map(|subscription| {
                let current = Snapshot::take(&subscription.path);
                let kind = classify(subscription.last, current)?;
                subscription.last = current;
                Some((
                    Arc::clone(&subscription.callback),
                    FileChange {
                        path: subscription.path.clone(),
                        kind,
                    },
                ))
            })
            .collect()
    };

    for (callback, change) in &changes {
        trace!("{:?} {}", change.kind, change.path.display());
        callback(change);
    }
    changes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    type Events = Arc<Mutex<Vec<FileChange>>>;

    /// Watcher whose background thread never fires during a test
    fn idle_watcher() -> PollingWatcher {
        PollingWatcher::new(PollInterval::new(Duration::from_secs(3600)).unwrap()).unwrap()
    }

    fn recorder() -> (Events, ChangeCallback) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: ChangeCallback = Box::new(move |change: &FileChange| {
            sink.lock().unwrap().push(change.clone());
        });
        (events, callback)
    }

    fn kinds(events: &Events) -> Vec<ChangeKind> {
        events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_length_change_is_modified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watched.txt");
        fs::write(&path, b"one").unwrap();

        let watcher = idle_watcher();
        let (events, callback) = recorder();
        watcher.subscribe(&path, callback).unwrap();

        assert_eq!(watcher.poll_now(), 0);
        fs::write(&path, b"one two").unwrap();
        assert_eq!(watcher.poll_now(), 1);
        assert_eq!(watcher.poll_now(), 0);

        let events = events.lock().unwrap();
        assert_eq!(events[0].path, path);
        assert_eq!(events[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn test_mtime_change_is_modified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watched.txt");
        fs::write(&path, b"same").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_000_000, 0)).unwrap();

        let watcher = idle_watcher();
        let (events, callback) = recorder();
        watcher.subscribe(&path, callback).unwrap();

        // Same length, new timestamp
        filetime::set_file_mtime(&path, FileTime::from_unix_time(2_000_000, 0)).unwrap();
        assert_eq!(watcher.poll_now(), 1);
        assert_eq!(kinds(&events), vec![ChangeKind::Modified]);
    }

    #[test]
    fn test_create_and_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("later.txt");

        let watcher = idle_watcher();
        let (events, callback) = recorder();
        watcher.subscribe(&path, callback).unwrap();

        fs::write(&path, b"hello").unwrap();
        watcher.poll_now();
        fs::remove_file(&path).unwrap();
        watcher.poll_now();

        assert_eq!(kinds(&events), vec![ChangeKind::Created, ChangeKind::Removed]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watched.txt");
        fs::write(&path, b"a").unwrap();

        let watcher = idle_watcher();
        let (events, callback) = recorder();
        let id = watcher.subscribe(&path, callback).unwrap();
        assert_eq!(watcher.subscription_count(), 1);

        watcher.unsubscribe(id).unwrap();
        assert_eq!(watcher.subscription_count(), 0);
        assert!(watcher.unsubscribe(id).is_err());

        fs::write(&path, b"abc").unwrap();
        assert_eq!(watcher.poll_now(), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_background_thread_delivers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watched.txt");
        fs::write(&path, b"a").unwrap();

        let mut watcher =
            PollingWatcher::new(PollInterval::new(PollInterval::MIN).unwrap()).unwrap();
        assert!(watcher.is_running());
        let (events, callback) = recorder();
        watcher.subscribe(&path, callback).unwrap();

        fs::write(&path, b"abcdef").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while events.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        // The rewrite may be observed mid-way, so more than one event is fine
        let seen = kinds(&events);
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|kind| *kind == ChangeKind::Modified));

        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_from_config_rejects_fast_polling() {
        let config = WatchConfig { poll_interval_ms: 1 };
        let error = PollingWatcher::from_config(&config).unwrap_err();
        assert_eq!(error.kind(), pollfs_types::ErrorKind::Config);
    }

    #[test]
    fn test_empty_path_is_rejected() {
        let watcher = idle_watcher();
        let (_, callback) = recorder();
        assert!(watcher.subscribe(Path::new(""), callback).is_err());
    }
}
