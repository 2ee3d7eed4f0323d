//! Camera service: finds devices, builds feeds for them and keeps the feed
//! registry in step with what is plugged in.

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;

use crate::config::CaptureConfig;
use crate::device::list_nodes;
use crate::error::{CameraError, Result};
use crate::feed::{CameraFeed, FeedRegistry};
use crate::format::FormatRequest;
use crate::mapped::{CaptureSettings, DeviceOpener, MappedBackend, V4l2Opener};
use crate::traits::CaptureBackend;
use crate::usb::{UsbStreamBackend, UsbTransport};

/// Stable identity of a physical device across enumerations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How to reach a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLocator {
    /// A V4L2 device node.
    Path(PathBuf),
    /// A file descriptor the platform granted for a USB device.
    UsbFd(RawFd),
}

/// A device present at enumeration time. May be stale by the time it is
/// used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Identity used to match feeds to devices.
    pub id: DeviceId,
    /// Human-readable name; also the feed name.
    pub name: String,
    /// Where the device lives.
    pub locator: DeviceLocator,
}

impl DeviceDescriptor {
    /// Descriptor for a device node, identified by its path.
    pub fn for_path(path: &Path) -> Self {
        let id = path.display().to_string();
        Self {
            id: DeviceId(id.clone()),
            name: id,
            locator: DeviceLocator::Path(path.to_owned()),
        }
    }

    /// Descriptor for a platform-granted USB file descriptor.
    pub fn for_usb_fd(id: &str, name: &str, fd: RawFd) -> Self {
        Self {
            id: DeviceId(id.to_owned()),
            name: name.to_owned(),
            locator: DeviceLocator::UsbFd(fd),
        }
    }
}

/// Lists the devices currently present.
pub trait DeviceDiscovery: Send + Sync {
    /// Devices present right now.
    fn enumerate(&self) -> Vec<DeviceDescriptor>;
}

/// Discovers V4L2 capture nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Discovery;

impl DeviceDiscovery for V4l2Discovery {
    fn enumerate(&self) -> Vec<DeviceDescriptor> {
        list_nodes()
            .into_iter()
            .map(|node| {
                let mut descriptor = DeviceDescriptor::for_path(&node.path);
                if let Some(name) = node.name {
                    descriptor.name = format!("{name} ({})", node.path.display());
                }
                descriptor
            })
            .collect()
    }
}

/// Builds the backend variant that fits a device.
pub trait BackendFactory: Send + Sync {
    /// A closed backend for `device`.
    fn create(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureBackend>>;
}

/// Builds [`MappedBackend`]s for device nodes.
pub struct MappedFactory<O: DeviceOpener> {
    opener: Arc<O>,
    settings: CaptureSettings,
}

impl<O: DeviceOpener> MappedFactory<O> {
    /// Factory sharing `opener` between every backend it builds.
    pub fn new(opener: O, settings: CaptureSettings) -> Self {
        Self {
            opener: Arc::new(opener),
            settings,
        }
    }
}

impl<O: DeviceOpener> BackendFactory for MappedFactory<O> {
    fn create(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureBackend>> {
        match &device.locator {
            DeviceLocator::Path(path) => Ok(Box::new(MappedBackend::new(
                Arc::clone(&self.opener),
                path,
                self.settings,
            ))),
            DeviceLocator::UsbFd(fd) => Err(CameraError::DeviceOpen {
                device: device.id.to_string(),
                reason: format!("fd {fd} is not a device node"),
            }),
        }
    }
}

/// Builds [`UsbStreamBackend`]s over one shared transport context.
///
/// The context lives as long as the factory or any backend built from it.
pub struct UsbFactory<T: UsbTransport> {
    transport: Arc<T>,
}

impl<T: UsbTransport> UsbFactory<T> {
    /// Factory owning the process-wide transport context.
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }
}

impl<T: UsbTransport> BackendFactory for UsbFactory<T> {
    fn create(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureBackend>> {
        match &device.locator {
            DeviceLocator::UsbFd(fd) => Ok(Box::new(UsbStreamBackend::new(
                Arc::clone(&self.transport),
                *fd,
                &device.name,
            ))),
            DeviceLocator::Path(path) => Err(CameraError::TransportWrap(format!(
                "{} is not a USB descriptor",
                path.display()
            ))),
        }
    }
}

/// What `refresh` does with feeds whose device has gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPolicy {
    /// Leave them registered; they fail on their next activation.
    Keep,
    /// Deactivate and unregister them.
    #[default]
    Retire,
}

/// Feeds a refresh added and retired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Devices that gained a feed.
    pub added: Vec<DeviceId>,
    /// Devices whose feed was removed.
    pub retired: Vec<DeviceId>,
}

impl RefreshReport {
    /// Whether the refresh changed nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.retired.is_empty()
    }
}

/// Owns the feeds of every known device and their registrations.
///
/// Dropping the service deactivates and unregisters all of them.
pub struct CameraService {
    registry: Arc<dyn FeedRegistry>,
    discovery: Option<Box<dyn DeviceDiscovery>>,
    factory: Box<dyn BackendFactory>,
    request: FormatRequest,
    policy: RefreshPolicy,
    feeds: Mutex<BTreeMap<DeviceId, Arc<CameraFeed>>>,
}

impl CameraService {
    /// Assemble a service from its collaborators.
    ///
    /// Without `discovery`, devices only arrive through
    /// [`CameraService::on_device_added`].
    pub fn new(
        registry: Arc<dyn FeedRegistry>,
        discovery: Option<Box<dyn DeviceDiscovery>>,
        factory: Box<dyn BackendFactory>,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            registry,
            discovery,
            factory,
            request: config.format,
            policy: config.refresh_policy,
            feeds: Mutex::new(BTreeMap::new()),
        }
    }

    /// Service over the host's V4L2 nodes.
    pub fn v4l2(registry: Arc<dyn FeedRegistry>, config: &CaptureConfig) -> Self {
        Self::new(
            registry,
            Some(Box::new(V4l2Discovery)),
            Box::new(MappedFactory::new(V4l2Opener, config.settings())),
            config,
        )
    }

    /// Service over a USB transport context. Devices are announced by the
    /// platform through [`CameraService::on_device_added`].
    pub fn usb<T: UsbTransport>(
        registry: Arc<dyn FeedRegistry>,
        transport: T,
        config: &CaptureConfig,
    ) -> Self {
        Self::new(registry, None, Box::new(UsbFactory::new(transport)), config)
    }

    /// Devices present right now.
    pub fn enumerate(&self) -> Vec<DeviceDescriptor> {
        self.discovery
            .as_ref()
            .map(|discovery| discovery.enumerate())
            .unwrap_or_default()
    }

    /// Build and register a feed for `device` without activating it.
    ///
    /// A device that already has a feed keeps it; the existing feed is
    /// returned.
    pub fn add_feed_for(&self, device: &DeviceDescriptor) -> Result<Arc<CameraFeed>> {
        let mut feeds = self.feeds();
        if let Some(feed) = feeds.get(&device.id) {
            log::debug!("{}: already has {}", device.id, feed.name());
            return Ok(Arc::clone(feed));
        }

        let backend = self.factory.create(device)?;
        let feed = CameraFeed::new(&device.name, backend, self.request);
        let id = self.registry.register(Arc::clone(&feed));
        feed.bind(Arc::downgrade(&self.registry), id);
        feeds.insert(device.id.clone(), Arc::clone(&feed));

        log::info!("{}: registered as {id}", device.name);
        Ok(feed)
    }

    /// Reconcile registered feeds with the devices present now.
    ///
    /// New devices get a feed. Devices already registered keep theirs.
    /// Vanished devices are handled per the configured [`RefreshPolicy`].
    pub fn refresh(&self) -> RefreshReport {
        let Some(discovery) = self.discovery.as_ref() else {
            return RefreshReport::default();
        };
        let present = discovery.enumerate();
        let mut report = RefreshReport::default();

        for device in &present {
            if self.feeds().contains_key(&device.id) {
                continue;
            }
            match self.add_feed_for(device) {
                Ok(_) => report.added.push(device.id.clone()),
                Err(err) => log::warn!("{}: cannot build feed: {err}", device.id),
            }
        }

        if self.policy == RefreshPolicy::Retire {
            let vanished: Vec<DeviceId> = self
                .feeds()
                .keys()
                .filter(|id| !present.iter().any(|device| device.id == **id))
                .cloned()
                .collect();
            for id in vanished {
                if self.remove_feed(&id) {
                    report.retired.push(id);
                }
            }
        }

        if !report.is_empty() {
            log::info!(
                "refresh: {} added, {} retired",
                report.added.len(),
                report.retired.len()
            );
        }
        report
    }

    /// Hot-plug: the platform announced a device.
    pub fn on_device_added(&self, device: &DeviceDescriptor) -> Result<Arc<CameraFeed>> {
        self.add_feed_for(device)
    }

    /// Hot-plug: the platform reported a device gone.
    pub fn on_device_removed(&self, id: &DeviceId) -> bool {
        self.remove_feed(id)
    }

    /// Deactivate and unregister the feed of `id`. Returns whether there
    /// was one.
    pub fn remove_feed(&self, id: &DeviceId) -> bool {
        let Some(feed) = self.feeds().remove(id) else {
            return false;
        };
        self.retire(id, &feed);
        true
    }

    /// The feed of `id`, if registered.
    pub fn feed(&self, id: &DeviceId) -> Option<Arc<CameraFeed>> {
        self.feeds().get(id).cloned()
    }

    /// Every registered feed, ordered by device id.
    pub fn feeds_snapshot(&self) -> Vec<(DeviceId, Arc<CameraFeed>)> {
        self.feeds()
            .iter()
            .map(|(id, feed)| (id.clone(), Arc::clone(feed)))
            .collect()
    }

    /// Deactivate and unregister every feed.
    pub fn shutdown(&self) {
        let feeds = std::mem::take(&mut *self.feeds());
        for (id, feed) in &feeds {
            self.retire(id, feed);
        }
        if !feeds.is_empty() {
            log::info!("shut down {} feeds", feeds.len());
        }
    }

    fn retire(&self, id: &DeviceId, feed: &CameraFeed) {
        if let Err(err) = feed.deactivate() {
            log::warn!("{err}");
        }
        if let Some(feed_id) = feed.id() {
            self.registry.unregister(feed_id);
        }
        log::info!("{id}: feed retired");
    }

    fn feeds(&self) -> MutexGuard<'_, BTreeMap<DeviceId, Arc<CameraFeed>>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CameraService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
