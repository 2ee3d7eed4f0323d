//! Camera feeds: lifecycle, the latest-frame mailbox and registry hooks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread;

use crate::convert::DecodedFrame;
use crate::error::{CameraError, FeedError};
use crate::format::{FormatRequest, StreamFormat};
use crate::traits::{BackendState, CaptureBackend};

/// Identity a registry assigns to a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedId(pub u64);

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feed#{}", self.0)
    }
}

/// The external collaborator feeds are registered into and that downstream
/// consumers pull frames from.
///
/// `notify_frame` is called on the capture thread (or the transport's
/// callback thread) and must not block.
pub trait FeedRegistry: Send + Sync {
    /// Take a reference to `feed` and return its identity.
    fn register(&self, feed: Arc<CameraFeed>) -> FeedId;

    /// Drop the registry's reference to a feed.
    fn unregister(&self, id: FeedId);

    /// A feed published a new frame.
    fn notify_frame(&self, id: FeedId, frame: Arc<DecodedFrame>);
}

/// Lifecycle state of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// No capture running.
    Idle,
    /// A capture thread or transport callback is delivering frames.
    Streaming,
}

/// Counters kept per feed across activations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    /// Frames converted and published.
    pub published: u64,
    /// Frames dropped because they could not be converted.
    pub dropped: u64,
    /// Waits for a filled buffer that timed out.
    pub timeouts: u64,
}

#[derive(Debug)]
struct Status {
    state: FeedState,
    format: Option<StreamFormat>,
    last_error: Option<Arc<CameraError>>,
    generation: u64,
}

struct Registration {
    registry: Weak<dyn FeedRegistry>,
    id: FeedId,
}

/// State shared between a feed and whatever delivers its frames.
pub(crate) struct FeedShared {
    name: String,
    status: Mutex<Status>,
    latest: Mutex<Option<Arc<DecodedFrame>>>,
    registration: OnceLock<Registration>,
    published: AtomicU64,
    dropped: AtomicU64,
    timeouts: AtomicU64,
    feed: Weak<CameraFeed>,
}

impl FeedShared {
    fn new(name: String, feed: Weak<CameraFeed>) -> Self {
        Self {
            name,
            status: Mutex::new(Status {
                state: FeedState::Idle,
                format: None,
                last_error: None,
                generation: 0,
            }),
            latest: Mutex::new(None),
            registration: OnceLock::new(),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            feed,
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        lock(&self.status)
    }

    fn stats(&self) -> FeedStats {
        FeedStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Write side of a feed's single-slot mailbox, handed to a backend on start.
///
/// Publishing replaces whatever frame was there: the latest frame wins and
/// nothing queues behind a slow reader.
#[derive(Clone)]
pub struct FrameSink {
    shared: Arc<FeedShared>,
    generation: u64,
}

impl FrameSink {
    /// Name of the feed this sink delivers into.
    pub fn feed_name(&self) -> &str {
        &self.shared.name
    }

    /// Make `frame` the feed's latest frame and tell the registry.
    pub fn publish(&self, frame: DecodedFrame) {
        let frame = Arc::new(frame);
        *lock(&self.shared.latest) = Some(Arc::clone(&frame));
        self.shared.published.fetch_add(1, Ordering::Relaxed);

        if let Some(registration) = self.shared.registration.get() {
            if let Some(registry) = registration.registry.upgrade() {
                registry.notify_frame(registration.id, frame);
            }
        }
    }

    /// Count a frame that could not be converted.
    pub fn drop_frame(&self, err: &CameraError) {
        let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("{}: dropped frame ({dropped} total): {err}", self.shared.name);
    }

    /// Count a wait that timed out.
    pub fn capture_timeout(&self, err: &CameraError, consecutive: u32) {
        self.shared.timeouts.fetch_add(1, Ordering::Relaxed);
        log::warn!("{}: {err} ({consecutive} in a row)", self.shared.name);
    }

    /// The activation this sink belongs to cannot continue.
    ///
    /// Marks the feed idle, records the error and deactivates it in the
    /// background: the failing thread cannot join itself.
    pub fn fail(&self, err: CameraError) {
        let err = Arc::new(err);
        {
            let mut status = self.shared.status();
            if status.generation != self.generation || status.state != FeedState::Streaming {
                log::debug!("{}: stale failure ignored: {err}", self.shared.name);
                return;
            }
            status.state = FeedState::Idle;
            status.last_error = Some(Arc::clone(&err));
        }
        log::error!("{}: {err}; deactivating", self.shared.name);

        let feed = Weak::clone(&self.shared.feed);
        let generation = self.generation;
        let spawned = thread::Builder::new()
            .name(format!("reap-{}", self.shared.name))
            .spawn(move || {
                if let Some(feed) = feed.upgrade() {
                    feed.reap(generation);
                }
            });
        if let Err(spawn_err) = spawned {
            log::error!("{}: cannot spawn reaper: {spawn_err}", self.shared.name);
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(name: &str) -> Self {
        let shared = Arc::new(FeedShared::new(name.to_owned(), Weak::new()));
        shared.status().state = FeedState::Streaming;
        Self {
            shared,
            generation: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn registered(name: &str, registry: Weak<dyn FeedRegistry>, id: FeedId) -> Self {
        let sink = Self::detached(name);
        let _ = sink.shared.registration.set(Registration { registry, id });
        sink
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> FeedStats {
        self.shared.stats()
    }

    #[cfg(test)]
    pub(crate) fn latest(&self) -> Option<Arc<DecodedFrame>> {
        lock(&self.shared.latest).clone()
    }

    #[cfg(test)]
    pub(crate) fn failure(&self) -> Option<Arc<CameraError>> {
        self.shared.status().last_error.clone()
    }
}

struct Control {
    backend: Box<dyn CaptureBackend>,
    request: FormatRequest,
}

/// One camera's capture session, as seen by consumers.
///
/// Dropping the last reference deactivates the feed first.
pub struct CameraFeed {
    shared: Arc<FeedShared>,
    control: Mutex<Control>,
}

impl CameraFeed {
    /// Bind a feed to `backend`. The feed starts idle.
    pub fn new(name: &str, backend: Box<dyn CaptureBackend>, request: FormatRequest) -> Arc<Self> {
        let name = name.to_owned();
        Arc::new_cyclic(|feed| Self {
            shared: Arc::new(FeedShared::new(name, Weak::clone(feed))),
            control: Mutex::new(Control { backend, request }),
        })
    }

    /// Record the registry this feed was registered into. A feed is
    /// registered at most once; later calls return `false`.
    pub(crate) fn bind(&self, registry: Weak<dyn FeedRegistry>, id: FeedId) -> bool {
        self.shared
            .registration
            .set(Registration { registry, id })
            .is_ok()
    }

    /// Feed name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Registry identity, once registered.
    pub fn id(&self) -> Option<FeedId> {
        self.shared.registration.get().map(|registration| registration.id)
    }

    /// Start capturing. No-op if already streaming.
    ///
    /// Device open and format negotiation complete on the calling thread;
    /// only steady-state capture runs in the background. On failure the
    /// backend is rolled back and the feed stays idle.
    pub fn activate(&self) -> Result<(), FeedError> {
        let mut control = self.control();
        if self.state() == FeedState::Streaming {
            return Ok(());
        }

        // Left over from a stalled activation whose reaper has not run yet.
        if let Err(err) = release(control.backend.as_mut()) {
            log::warn!("{}: releasing previous activation: {err}", self.name());
        }

        let generation = {
            let mut status = self.shared.status();
            status.generation += 1;
            status.generation
        };
        let request = control.request;

        match self.bring_up(control.backend.as_mut(), &request, generation) {
            Ok(format) => {
                log::info!("{}: streaming {format}", self.name());
                Ok(())
            }
            Err(err) => {
                if let Err(rollback) = release(control.backend.as_mut()) {
                    log::warn!("{}: rollback: {rollback}", self.name());
                }
                let err = Arc::new(err);
                {
                    let mut status = self.shared.status();
                    status.state = FeedState::Idle;
                    status.format = None;
                    status.last_error = Some(Arc::clone(&err));
                }
                let err = FeedError::new(self.name(), err);
                log::error!("{err}");
                Err(err)
            }
        }
    }

    fn bring_up(
        &self,
        backend: &mut dyn CaptureBackend,
        request: &FormatRequest,
        generation: u64,
    ) -> Result<StreamFormat, CameraError> {
        backend.open()?;
        let format = backend.negotiate_format(request)?;
        {
            let mut status = self.shared.status();
            status.state = FeedState::Streaming;
            status.format = Some(format);
        }
        backend.start(FrameSink {
            shared: Arc::clone(&self.shared),
            generation,
        })?;
        Ok(format)
    }

    /// Stop capturing. No-op if idle.
    ///
    /// Returns only once no further frame can be published and every
    /// buffer has been reclaimed.
    pub fn deactivate(&self) -> Result<(), FeedError> {
        let mut control = self.control();
        let result = release(control.backend.as_mut());

        let was_streaming = {
            let mut status = self.shared.status();
            let was_streaming = status.state == FeedState::Streaming;
            status.state = FeedState::Idle;
            status.generation += 1;
            was_streaming
        };
        if was_streaming {
            log::info!("{}: deactivated", self.name());
        }

        result.map_err(|err| FeedError::new(self.name(), Arc::new(err)))
    }

    /// Implicit deactivation after the activation `generation` failed.
    fn reap(&self, generation: u64) {
        let mut control = self.control();
        if self.shared.status().generation != generation {
            return;
        }
        if let Err(err) = release(control.backend.as_mut()) {
            log::warn!("{}: releasing failed activation: {err}", self.name());
        }
        log::debug!("{}: failed activation released", self.name());
    }

    /// Whether frames are being captured.
    pub fn is_active(&self) -> bool {
        self.state() == FeedState::Streaming
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FeedState {
        self.shared.status().state
    }

    /// Format negotiated by the current or last activation.
    pub fn format(&self) -> Option<StreamFormat> {
        self.shared.status().format
    }

    /// The most recently published frame. Never waits on capture.
    pub fn latest_frame(&self) -> Option<Arc<DecodedFrame>> {
        lock(&self.shared.latest).clone()
    }

    /// The error that ended the last failed activation, if any.
    pub fn last_error(&self) -> Option<Arc<CameraError>> {
        self.shared.status().last_error.clone()
    }

    /// Frame counters.
    pub fn stats(&self) -> FeedStats {
        self.shared.stats()
    }

    /// Format requested on the next activation.
    pub fn request(&self) -> FormatRequest {
        self.control().request
    }

    /// Change the requested format. Takes effect on the next activation.
    pub fn set_request(&self, request: FormatRequest) {
        self.control().request = request;
    }

    /// State of the bound backend.
    pub fn backend_state(&self) -> BackendState {
        self.control().backend.state()
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        lock(&self.control)
    }
}

impl fmt::Debug for CameraFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraFeed")
            .field("name", &self.shared.name)
            .field("id", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for CameraFeed {
    fn drop(&mut self) {
        if let Err(err) = self.deactivate() {
            log::warn!("{err}");
        }
    }
}

/// Walk a backend back to `Closed` from wherever it is.
fn release(backend: &mut dyn CaptureBackend) -> Result<(), CameraError> {
    let mut first = None;
    if backend.state() == BackendState::Streaming {
        if let Err(err) = backend.stop() {
            first.get_or_insert(err);
        }
    }
    if backend.state() != BackendState::Closed {
        if let Err(err) = backend.close() {
            first.get_or_insert(err);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Guarded values are replaced whole, so a poisoned lock still holds a
/// consistent value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
