//! Upload/download progress notifier.
//!
//! Registrations are either streaming (invoked on every update, forever) or
//! one-shot (report progress toward the amount of work outstanding at
//! registration time, then expire).

use std::sync::{Arc, Mutex};

use crate::core::Version;

/// `(transferred_bytes, transferrable_bytes)`.
pub type ProgressCallback = Box<dyn FnMut(u64, u64) + Send>;

type SharedCallback = Arc<Mutex<ProgressCallback>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressDirection {
    Upload,
    Download,
}

/// One progress sample, as fed by the session after each integration or
/// upload acknowledgement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressSample {
    pub downloaded: u64,
    pub downloadable: u64,
    pub uploaded: u64,
    pub uploadable: u64,
    /// Server version of the latest DOWNLOAD; 0 until the first one.
    pub download_version: Version,
    pub snapshot_version: Version,
}

pub type ProgressToken = u64;

struct Registration {
    token: ProgressToken,
    direction: ProgressDirection,
    is_streaming: bool,
    /// Snapshot version the local file had when the registration was made.
    /// One-shot upload waiters skip samples older than this.
    registered_at_snapshot: Version,
    /// Work outstanding at first eligible sample; one-shot registrations
    /// report against this fixed target.
    captured_transferrable: Option<u64>,
    callback: SharedCallback,
}

struct Inner {
    next_token: ProgressToken,
    registrations: Vec<Registration>,
    current: Option<ProgressSample>,
}

/// Fan-out of transfer progress to registered callbacks.
///
/// Callbacks always run with the internal lock released, so they may
/// register and unregister freely.
pub struct ProgressNotifier {
    inner: Mutex<Inner>,
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_token: 1,
                registrations: Vec::new(),
                current: None,
            }),
        }
    }

    /// Register a callback. If a sample has already been seen the callback
    /// is invoked immediately (and may expire on the spot).
    pub fn register(
        &self,
        callback: ProgressCallback,
        direction: ProgressDirection,
        is_streaming: bool,
        registered_at_snapshot: Version,
    ) -> ProgressToken {
        let callback: SharedCallback = Arc::new(Mutex::new(callback));
        let mut immediate = None;

        let token = {
            let mut inner = self.inner.lock().unwrap();
            let token = inner.next_token;
            inner.next_token += 1;
            let mut registration = Registration {
                token,
                direction,
                is_streaming,
                registered_at_snapshot,
                captured_transferrable: None,
                callback: Arc::clone(&callback),
            };
            let mut expired = false;
            if let Some(sample) = inner.current
                && let Some((transferred, transferrable, expires)) =
                    advance(&mut registration, &sample)
            {
                immediate = Some((transferred, transferrable));
                expired = expires;
            }
            if !expired {
                inner.registrations.push(registration);
            }
            token
        };

        if let Some((transferred, transferrable)) = immediate {
            (callback.lock().unwrap())(transferred, transferrable);
        }
        token
    }

    pub fn unregister(&self, token: ProgressToken) {
        let mut inner = self.inner.lock().unwrap();
        inner.registrations.retain(|r| r.token != token);
    }

    /// Feed a new sample and dispatch callbacks. Samples prior to the first
    /// DOWNLOAD (`download_version == 0`) are ignored.
    pub fn update(&self, sample: ProgressSample) {
        if sample.download_version == 0 {
            return;
        }

        let mut invocations: Vec<(SharedCallback, u64, u64)> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.current = Some(sample);
            inner.registrations.retain_mut(|registration| {
                match advance(registration, &sample) {
                    None => true,
                    Some((transferred, transferrable, expired)) => {
                        invocations.push((
                            Arc::clone(&registration.callback),
                            transferred,
                            transferrable,
                        ));
                        !expired
                    }
                }
            });
        }

        for (callback, transferred, transferrable) in invocations {
            (callback.lock().unwrap())(transferred, transferrable);
        }
    }
}

/// Advance a registration against a sample. Returns the values to report
/// and whether the registration expired, or None when the sample must be
/// skipped for this registration.
fn advance(registration: &mut Registration, sample: &ProgressSample) -> Option<(u64, u64, bool)> {
    if !registration.is_streaming
        && registration.direction == ProgressDirection::Upload
        && registration.registered_at_snapshot > sample.snapshot_version
    {
        // Upload counters do not yet reflect the commit the caller
        // registered after.
        return None;
    }

    let (transferred, live_transferrable) = match registration.direction {
        ProgressDirection::Upload => (sample.uploaded, sample.uploadable),
        ProgressDirection::Download => (sample.downloaded, sample.downloadable),
    };

    if registration.is_streaming {
        return Some((transferred, live_transferrable, false));
    }

    let captured = registration
        .captured_transferrable
        .get_or_insert(live_transferrable);
    // Server-side compaction can shrink the outstanding amount.
    if live_transferrable < *captured {
        *captured = live_transferrable;
    }
    let target = *captured;
    Some((transferred, target, transferred >= target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn sample(
        downloaded: u64,
        downloadable: u64,
        uploaded: u64,
        uploadable: u64,
        download_version: Version,
        snapshot_version: Version,
    ) -> ProgressSample {
        ProgressSample {
            downloaded,
            downloadable,
            uploaded,
            uploadable,
            download_version,
            snapshot_version,
        }
    }

    #[test]
    fn ignores_updates_before_first_download() {
        let notifier = ProgressNotifier::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        notifier.register(
            Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            ProgressDirection::Download,
            true,
            0,
        );
        notifier.update(sample(1, 2, 0, 0, 0, 1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        notifier.update(sample(1, 2, 0, 0, 3, 1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn streaming_download_reports_live_values() {
        let notifier = ProgressNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        notifier.register(
            Box::new(move |transferred, transferrable| {
                sink.lock().unwrap().push((transferred, transferrable));
            }),
            ProgressDirection::Download,
            true,
            0,
        );
        notifier.update(sample(10, 100, 0, 0, 1, 1));
        notifier.update(sample(60, 120, 0, 0, 2, 1));
        assert_eq!(*seen.lock().unwrap(), vec![(10, 100), (60, 120)]);
    }

    #[test]
    fn one_shot_download_expires_at_captured_target() {
        let notifier = ProgressNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        notifier.register(
            Box::new(move |transferred, transferrable| {
                sink.lock().unwrap().push((transferred, transferrable));
            }),
            ProgressDirection::Download,
            false,
            0,
        );
        notifier.update(sample(10, 100, 0, 0, 1, 1));
        // Transferrable grew, but the captured target stays at 100.
        notifier.update(sample(100, 150, 0, 0, 2, 1));
        // Registration expired; no further reports.
        notifier.update(sample(150, 150, 0, 0, 3, 1));
        assert_eq!(*seen.lock().unwrap(), vec![(10, 100), (100, 100)]);
    }

    #[test]
    fn captured_target_shrinks_with_server_compaction() {
        let notifier = ProgressNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        notifier.register(
            Box::new(move |transferred, transferrable| {
                sink.lock().unwrap().push((transferred, transferrable));
            }),
            ProgressDirection::Download,
            false,
            0,
        );
        notifier.update(sample(10, 100, 0, 0, 1, 1));
        notifier.update(sample(20, 80, 0, 0, 2, 1));
        assert_eq!(*seen.lock().unwrap(), vec![(10, 100), (20, 80)]);
    }

    #[test]
    fn one_shot_upload_skips_stale_snapshots() {
        let notifier = ProgressNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        notifier.register(
            Box::new(move |transferred, transferrable| {
                sink.lock().unwrap().push((transferred, transferrable));
            }),
            ProgressDirection::Upload,
            false,
            5,
        );
        // Sample predates the registration snapshot: skipped.
        notifier.update(sample(0, 0, 10, 40, 1, 4));
        assert!(seen.lock().unwrap().is_empty());
        // Snapshot caught up.
        notifier.update(sample(0, 0, 40, 40, 2, 5));
        assert_eq!(*seen.lock().unwrap(), vec![(40, 40)]);
    }

    #[test]
    fn unregister_stops_reports() {
        let notifier = ProgressNotifier::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let token = notifier.register(
            Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            ProgressDirection::Download,
            true,
            0,
        );
        notifier.update(sample(1, 2, 0, 0, 1, 1));
        notifier.unregister(token);
        notifier.update(sample(2, 2, 0, 0, 2, 1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn immediate_invocation_on_late_registration() {
        let notifier = ProgressNotifier::new();
        notifier.update(sample(30, 100, 0, 0, 1, 1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        notifier.register(
            Box::new(move |transferred, transferrable| {
                sink.lock().unwrap().push((transferred, transferrable));
            }),
            ProgressDirection::Download,
            true,
            0,
        );
        assert_eq!(*seen.lock().unwrap(), vec![(30, 100)]);
    }

    #[test]
    fn callback_may_unregister_from_within() {
        let notifier = Arc::new(ProgressNotifier::new());
        let hits = Arc::new(AtomicU64::new(0));
        let token_slot = Arc::new(Mutex::new(0u64));

        let counter = Arc::clone(&hits);
        let notifier_handle = Arc::clone(&notifier);
        let slot = Arc::clone(&token_slot);
        let token = notifier.register(
            Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                notifier_handle.unregister(*slot.lock().unwrap());
            }),
            ProgressDirection::Download,
            true,
            0,
        );
        *token_slot.lock().unwrap() = token;

        notifier.update(sample(1, 2, 0, 0, 1, 1));
        notifier.update(sample(2, 2, 0, 0, 2, 1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
