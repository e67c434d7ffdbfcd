//! Live preview: pulls frames from a capture device at a fixed rate and publishes a
//! prediction for each one.
//!
//! A [`CaptureSurface`] owns at most one open stream and stops it before opening another
//! or when dropped. A [`PreviewTask`] owns the surface for as long as the loop runs, so
//! every way the task ends (stop, drop, stream end, untrained machine) releases the device.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::classifier::{ClassifierError, Prediction, TeachableMachine};
use crate::registry::ImageSample;

/// Roughly one display refresh at 60Hz.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("Permission to use the capture device was denied")]
    PermissionDenied,
    #[error("Capture device unavailable: {0}")]
    Unavailable(String),
    #[error("Capture stream failed: {0}")]
    StreamFailed(String),
}

/// Result of asking a stream for its current frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ready(ImageSample),
    /// The stream is open but has no complete frame yet
    NotReady,
    /// The stream has no more frames
    Ended,
}

pub trait CaptureStream: Send {
    fn grab_frame(&mut self) -> Result<Frame, DeviceError>;

    /// Releases the underlying device. Calling it more than once has no further effect.
    fn stop(&mut self);
}

/// Something that can hand out capture streams, such as a camera.
pub trait CaptureDevice: Send + Sync {
    fn open(&self) -> Result<Box<dyn CaptureStream>, DeviceError>;
}

/// Holds at most one active capture stream.
#[derive(Default)]
pub struct CaptureSurface {
    stream: Option<Box<dyn CaptureStream>>,
}

impl CaptureSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops the current stream, if any, then opens a new one from `device`.
    pub fn acquire(&mut self, device: &dyn CaptureDevice) -> Result<(), DeviceError> {
        self.release();
        self.stream = Some(device.open()?);
        Ok(())
    }

    pub fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            debug!("Capture stream released");
        }
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    pub fn grab_frame(&mut self) -> Result<Frame, DeviceError> {
        match self.stream.as_mut() {
            Some(stream) => stream.grab_frame(),
            None => Ok(Frame::Ended),
        }
    }
}

impl Drop for CaptureSurface {
    fn drop(&mut self) {
        self.release();
    }
}

/// A capture device that plays back a fixed list of frames.
#[derive(Debug, Clone)]
pub struct ReplayCamera {
    frames: Arc<[ImageSample]>,
    repeat: bool,
    warmup_frames: usize,
    permission_granted: bool,
    active_streams: Arc<AtomicUsize>,
}

impl ReplayCamera {
    pub fn new(frames: Vec<ImageSample>) -> Self {
        Self {
            frames: Arc::from(frames),
            repeat: false,
            warmup_frames: 0,
            permission_granted: true,
            active_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Loads every regular file in `dir`, in file-name order.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let frames = read_image_dir(dir.as_ref())?;
        if frames.is_empty() {
            return Err(DeviceError::Unavailable(format!("no frames in {:?}", dir.as_ref())).into());
        }
        Ok(Self::new(frames))
    }

    /// Loop back to the first frame instead of ending.
    pub fn with_repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    /// Report `NotReady` for the first `n` grabs of each stream.
    pub fn with_warmup(mut self, n: usize) -> Self {
        self.warmup_frames = n;
        self
    }

    pub fn deny_permission(mut self) -> Self {
        self.permission_granted = false;
        self
    }

    /// Streams opened from this camera (or its clones) and not yet stopped.
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }
}

impl CaptureDevice for ReplayCamera {
    fn open(&self) -> Result<Box<dyn CaptureStream>, DeviceError> {
        if !self.permission_granted {
            return Err(DeviceError::PermissionDenied);
        }
        self.active_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ReplayStream {
            frames: Arc::clone(&self.frames),
            position: 0,
            repeat: self.repeat,
            warmup_remaining: self.warmup_frames,
            active_streams: Arc::clone(&self.active_streams),
            stopped: false,
        }))
    }
}

struct ReplayStream {
    frames: Arc<[ImageSample]>,
    position: usize,
    repeat: bool,
    warmup_remaining: usize,
    active_streams: Arc<AtomicUsize>,
    stopped: bool,
}

impl CaptureStream for ReplayStream {
    fn grab_frame(&mut self) -> Result<Frame, DeviceError> {
        if self.stopped {
            return Err(DeviceError::StreamFailed("stream already stopped".into()));
        }
        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            return Ok(Frame::NotReady);
        }
        if self.position >= self.frames.len() {
            if !self.repeat || self.frames.is_empty() {
                return Ok(Frame::Ended);
            }
            self.position = 0;
        }
        let frame = self.frames[self.position].clone();
        self.position += 1;
        Ok(Frame::Ready(frame))
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.active_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ReplayStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Latest state published by a running preview.
#[derive(Debug, Clone)]
pub enum PreviewUpdate {
    /// No frame has been classified yet
    Waiting,
    Prediction { frame: u64, prediction: Prediction },
    Failed { frame: u64, message: String },
    /// The loop has exited and will publish nothing more
    Ended,
}

/// Handle to a running live-preview loop.
///
/// Dropping the handle aborts the loop; [`PreviewTask::stop`] shuts it down gracefully.
pub struct PreviewTask {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<Notify>,
    updates: watch::Receiver<PreviewUpdate>,
}

impl PreviewTask {
    /// Opens a stream from `device` and starts classifying its frames every
    /// `machine.frame_interval()`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// - `NotTrained` if the machine is not exportable
    /// - `Device` if the stream cannot be opened
    pub fn start(machine: Arc<TeachableMachine>, device: &dyn CaptureDevice) -> Result<Self, ClassifierError> {
        if !machine.is_exportable() {
            return Err(ClassifierError::NotTrained);
        }
        let mut surface = CaptureSurface::new();
        surface.acquire(device)?;

        let (sender, updates) = watch::channel(PreviewUpdate::Waiting);
        let shutdown = Arc::new(Notify::new());
        let interval = machine.frame_interval();
        let handle = tokio::spawn(preview_loop(
            machine,
            surface,
            sender,
            Arc::clone(&shutdown),
            interval,
        ));
        info!("Preview started ({:?} per frame)", interval);

        Ok(Self {
            handle: Some(handle),
            shutdown,
            updates,
        })
    }

    pub fn updates(&self) -> watch::Receiver<PreviewUpdate> {
        self.updates.clone()
    }

    pub fn latest(&self) -> PreviewUpdate {
        self.updates.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the loop to exit and waits for it, releasing the capture stream.
    pub async fn stop(mut self) -> Result<(), ClassifierError> {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| DeviceError::StreamFailed(format!("preview task failed: {}", e)))?;
        }
        info!("Preview stopped");
        Ok(())
    }
}

impl Drop for PreviewTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shutdown.notify_one();
            handle.abort();
            debug!("Preview task aborted on drop");
        }
    }
}

async fn preview_loop(
    machine: Arc<TeachableMachine>,
    mut surface: CaptureSurface,
    updates: watch::Sender<PreviewUpdate>,
    shutdown: Arc<Notify>,
    frame_interval: Duration,
) {
    // tokio::time::interval panics on a zero period
    let mut interval = tokio::time::interval(frame_interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut frame_no = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                debug!("Preview received shutdown signal");
                break;
            }

            _ = interval.tick() => {
                let image = match surface.grab_frame() {
                    Ok(Frame::Ready(image)) => image,
                    Ok(Frame::NotReady) => continue,
                    Ok(Frame::Ended) => {
                        info!("Capture stream ended after {} frames", frame_no);
                        break;
                    }
                    Err(e) => {
                        warn!("Capture stream failed: {}", e);
                        let _ = updates.send(PreviewUpdate::Failed { frame: frame_no, message: e.to_string() });
                        break;
                    }
                };
                frame_no += 1;

                let update = match machine.predict(&image).await {
                    Ok(prediction) => PreviewUpdate::Prediction { frame: frame_no, prediction },
                    // these hold for every frame until the machine itself changes
                    Err(e @ (ClassifierError::NotTrained
                    | ClassifierError::NotReady(_)
                    | ClassifierError::InsufficientClasses { .. })) => {
                        warn!("Stopping preview: {}", e);
                        let _ = updates.send(PreviewUpdate::Failed {
                            frame: frame_no,
                            message: e.to_string(),
                        });
                        break;
                    }
                    Err(e) => {
                        debug!("Prediction for frame {} failed: {}", frame_no, e);
                        PreviewUpdate::Failed { frame: frame_no, message: e.to_string() }
                    }
                };
                if updates.send(update).is_err() {
                    debug!("All preview receivers dropped");
                    break;
                }
            }
        }
    }

    surface.release();
    let _ = updates.send(PreviewUpdate::Ended);
}

/// Where preview frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Camera,
    File,
}

/// The preview panel's state: an on/off toggle and an input source, with the camera
/// loop running exactly while the toggle is on and the source is the camera.
pub struct Preview {
    machine: Arc<TeachableMachine>,
    device: Arc<dyn CaptureDevice>,
    enabled: bool,
    source: InputSource,
    task: Option<PreviewTask>,
}

impl Preview {
    pub fn new(machine: Arc<TeachableMachine>, device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            machine,
            device,
            enabled: false,
            source: InputSource::Camera,
            task: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn source(&self) -> InputSource {
        self.source
    }

    /// Updates from the camera loop, while one is running.
    pub fn updates(&self) -> Option<watch::Receiver<PreviewUpdate>> {
        self.task.as_ref().map(PreviewTask::updates)
    }

    pub fn is_streaming(&self) -> bool {
        self.task.as_ref().is_some_and(PreviewTask::is_running)
    }

    pub async fn set_enabled(&mut self, enabled: bool) -> Result<(), ClassifierError> {
        if enabled && !self.machine.is_exportable() {
            return Err(ClassifierError::NotTrained);
        }
        self.enabled = enabled;
        self.sync().await
    }

    pub async fn set_source(&mut self, source: InputSource) -> Result<(), ClassifierError> {
        if source != self.source {
            self.stop_task().await?;
            self.source = source;
        }
        self.sync().await
    }

    /// One-off prediction for an uploaded image.
    pub async fn predict_file(&self, image: &ImageSample) -> Result<Prediction, ClassifierError> {
        if !self.enabled || self.source != InputSource::File {
            return Err(ClassifierError::ValidationError(
                "file prediction needs the preview enabled with the file source".into(),
            ));
        }
        self.machine.predict(image).await
    }

    async fn sync(&mut self) -> Result<(), ClassifierError> {
        let wants_camera = self.enabled && self.source == InputSource::Camera;
        if wants_camera && !self.is_streaming() {
            self.stop_task().await?;
            self.task = Some(PreviewTask::start(Arc::clone(&self.machine), self.device.as_ref())?);
        } else if !wants_camera {
            self.stop_task().await?;
        }
        Ok(())
    }

    async fn stop_task(&mut self) -> Result<(), ClassifierError> {
        match self.task.take() {
            Some(task) => task.stop().await,
            None => Ok(()),
        }
    }
}

/// Reads every regular file in `dir` as an image sample, sorted by file name.
pub fn read_image_dir(dir: &Path) -> Result<Vec<ImageSample>, ClassifierError> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    paths.iter().map(ImageSample::from_path).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: u8) -> Vec<ImageSample> {
        (0..n).map(|i| ImageSample::from_bytes(vec![i])).collect()
    }

    #[test]
    fn test_replay_stream_sequence() {
        let camera = ReplayCamera::new(frames(2)).with_warmup(1);
        let mut stream = camera.open().unwrap();
        assert_eq!(stream.grab_frame().unwrap(), Frame::NotReady);
        assert_eq!(stream.grab_frame().unwrap(), Frame::Ready(ImageSample::from_bytes(vec![0])));
        assert_eq!(stream.grab_frame().unwrap(), Frame::Ready(ImageSample::from_bytes(vec![1])));
        assert_eq!(stream.grab_frame().unwrap(), Frame::Ended);
    }

    #[test]
    fn test_replay_repeat() {
        let camera = ReplayCamera::new(frames(1)).with_repeat(true);
        let mut stream = camera.open().unwrap();
        for _ in 0..3 {
            assert!(matches!(stream.grab_frame().unwrap(), Frame::Ready(_)));
        }
    }

    #[test]
    fn test_permission_denied() {
        let camera = ReplayCamera::new(frames(1)).deny_permission();
        let mut surface = CaptureSurface::new();
        assert_eq!(surface.acquire(&camera).unwrap_err(), DeviceError::PermissionDenied);
        assert!(!surface.is_active());
    }

    #[test]
    fn test_surface_holds_one_stream() {
        let camera = ReplayCamera::new(frames(1));
        let mut surface = CaptureSurface::new();
        surface.acquire(&camera).unwrap();
        surface.acquire(&camera).unwrap();
        assert_eq!(camera.active_streams(), 1);
        surface.release();
        assert_eq!(camera.active_streams(), 0);
    }

    #[test]
    fn test_surface_drop_releases() {
        let camera = ReplayCamera::new(frames(1));
        {
            let mut surface = CaptureSurface::new();
            surface.acquire(&camera).unwrap();
            assert_eq!(camera.active_streams(), 1);
        }
        assert_eq!(camera.active_streams(), 0);
    }

    #[test]
    fn test_stopped_stream_errors() {
        let camera = ReplayCamera::new(frames(1));
        let mut stream = camera.open().unwrap();
        stream.stop();
        stream.stop();
        assert_eq!(camera.active_streams(), 0);
        assert!(stream.grab_frame().is_err());
    }

    #[tokio::test]
    async fn test_start_requires_trained_machine() {
        let machine = Arc::new(TeachableMachine::builder().build().unwrap());
        let camera = ReplayCamera::new(frames(1));
        assert!(matches!(
            PreviewTask::start(machine, &camera),
            Err(ClassifierError::NotTrained)
        ));
        assert_eq!(camera.active_streams(), 0);
    }
}
