//! camfeed demo: list capture nodes or stream one feed and report frames.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camfeed::{
    CameraFeed, CameraService, CaptureConfig, DecodedFrame, DeviceDescriptor, FeedId,
    FeedRegistry, PixelPreference,
};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "camfeed", version, about = "Capture frames from a V4L2 camera")]
struct Args {
    /// Device node to stream from.
    #[arg(short, long, default_value = "/dev/video0")]
    device: PathBuf,

    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Requested width.
    #[arg(long)]
    width: Option<u32>,

    /// Requested height.
    #[arg(long)]
    height: Option<u32>,

    /// Requested frame rate.
    #[arg(long)]
    fps: Option<u32>,

    /// Pixel encoding: "any" or a FourCC such as YUYV or MJPG.
    #[arg(long)]
    pixel_format: Option<PixelPreference>,

    /// How long to stream.
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,

    /// List capture devices and exit.
    #[arg(long)]
    list: bool,
}

impl Args {
    fn capture_config(&self) -> camfeed::Result<CaptureConfig> {
        let mut config = match &self.config {
            Some(path) => CaptureConfig::load(path)?,
            None => CaptureConfig::default(),
        };
        let format = &mut config.format;
        format.width = self.width.unwrap_or(format.width);
        format.height = self.height.unwrap_or(format.height);
        format.fps = self.fps.unwrap_or(format.fps);
        format.pixel_format = self.pixel_format.unwrap_or(format.pixel_format);
        config.validated()
    }
}

/// Registry that counts frame notifications.
#[derive(Default)]
struct CountingRegistry {
    next: AtomicU64,
    frames: AtomicU64,
}

impl FeedRegistry for CountingRegistry {
    fn register(&self, feed: Arc<CameraFeed>) -> FeedId {
        let id = FeedId(self.next.fetch_add(1, Ordering::Relaxed));
        log::debug!("{} registered as {id}", feed.name());
        id
    }

    fn unregister(&self, id: FeedId) {
        log::debug!("{id} unregistered");
    }

    fn notify_frame(&self, _id: FeedId, _frame: Arc<DecodedFrame>) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run(&Args::parse()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let config = args.capture_config()?;
    let registry = Arc::new(CountingRegistry::default());
    let service = CameraService::v4l2(Arc::clone(&registry) as Arc<dyn FeedRegistry>, &config);

    if args.list {
        for device in service.enumerate() {
            println!("{}: {}", device.id, device.name);
        }
        return Ok(());
    }

    stream(&service, &registry, &args.device, Duration::from_secs(args.seconds))?;
    service.shutdown();
    Ok(())
}

fn stream(
    service: &CameraService,
    registry: &CountingRegistry,
    device: &Path,
    duration: Duration,
) -> Result<(), Box<dyn Error>> {
    let feed = service.add_feed_for(&DeviceDescriptor::for_path(device))?;
    feed.activate()?;

    if let Some(format) = feed.format() {
        println!("Format: {format}");
    }

    let started = Instant::now();
    while started.elapsed() < duration && feed.is_active() {
        thread::sleep(Duration::from_secs(1));
        let stats = feed.stats();
        match feed.latest_frame() {
            Some(frame) => println!(
                "Frame {}: {}x{}, {} published, {} dropped, {} timeouts, {} notified",
                frame.sequence(),
                frame.width(),
                frame.height(),
                stats.published,
                stats.dropped,
                stats.timeouts,
                registry.frames.load(Ordering::Relaxed)
            ),
            None => println!("No frame yet ({} timeouts)", stats.timeouts),
        }
    }

    if let Some(err) = feed.last_error() {
        return Err(format!("capture stopped: {err}").into());
    }
    feed.deactivate()?;
    Ok(())
}
