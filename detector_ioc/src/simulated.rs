/*!
Simulated detector.

Stands in for the vendor SDK when no hardware is attached: it sleeps
through each exposure, synthesises a frame, optionally writes the raw
frames to disk and delivers events to registered handlers on its own
event thread, the way the SDK does.
*/

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use shared::Frame;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::device::{Detector, DeviceError, EventHandler, EventKind, HandlerId, OutputFormat};

/// Granularity at which a running exposure checks for abort
const ABORT_POLL: Duration = Duration::from_millis(5);

struct EventJob {
    kind: EventKind,
    handlers: Vec<EventHandler>,
    /// Signalled once every handler has returned
    done: Option<Sender<()>>,
}

/// Clears the abort request and the busy flag however the acquisition ends
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
    abort: &'a AtomicBool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.abort.store(false, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
    }
}

pub struct SimulatedDetector {
    model: String,
    width: u32,
    height: u32,
    frame_overhead: Duration,
    busy: AtomicBool,
    abort: AtomicBool,
    last_frame: Mutex<Option<Vec<u32>>>,
    handlers: Mutex<Vec<(HandlerId, EventKind, EventHandler)>>,
    next_handler: AtomicU64,
    acquisitions: AtomicU64,
    events: Sender<EventJob>,
}

impl SimulatedDetector {
    /// Create the detector and start its event thread
    pub fn new(
        model: impl Into<String>,
        width: u32,
        height: u32,
        frame_overhead: Duration,
    ) -> Result<Self, DeviceError> {
        let (events, jobs) = unbounded::<EventJob>();

        thread::Builder::new()
            .name("sdk-events".to_string())
            .spawn(move || {
                for job in jobs {
                    for handler in &job.handlers {
                        handler(job.kind);
                    }
                    if let Some(done) = job.done {
                        let _ = done.send(());
                    }
                }
                debug!("SDK event thread stopped");
            })?;

        Ok(Self {
            model: model.into(),
            width,
            height,
            frame_overhead,
            busy: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            last_frame: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            acquisitions: AtomicU64::new(0),
            events,
        })
    }

    /// Number of times the acquisition primitive has started
    #[cfg(test)]
    pub fn acquisitions_started(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Raise the process-wide exit event without waiting for handlers
    #[cfg(test)]
    pub fn raise_exit(&self) -> Result<(), DeviceError> {
        self.dispatch(EventKind::Exit, false)
    }

    fn dispatch(&self, kind: EventKind, wait: bool) -> Result<(), DeviceError> {
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| h.clone())
            .collect();
        if handlers.is_empty() {
            return Ok(());
        }

        let (done_tx, done_rx) = bounded(1);
        let job = EventJob {
            kind,
            handlers,
            done: wait.then_some(done_tx),
        };
        self.events.send(job).map_err(|_| DeviceError::Disconnected)?;
        if wait {
            done_rx.recv().map_err(|_| DeviceError::Disconnected)?;
        }
        Ok(())
    }

    /// Sleep for `duration`, returning early with `Aborted` on request
    fn expose(&self, duration: Duration) -> Result<(), DeviceError> {
        let deadline = Instant::now() + duration;
        loop {
            if self.abort.load(Ordering::SeqCst) {
                return Err(DeviceError::Aborted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(ABORT_POLL));
        }
    }

    /// Deterministic test pattern: a diagonal ramp plus a bright spot that
    /// moves with the frame index
    fn synthesize_frame(&self, index: u32) -> Vec<u32> {
        let (w, h) = (self.width, self.height);
        let spot_x = (index * 7) % w.max(1);
        let spot_y = (index * 3) % h.max(1);
        let mut pixels = Vec::with_capacity(w as usize * h as usize);
        for y in 0..h {
            for x in 0..w {
                let ramp = (x + y + index) % 256;
                let near = x.abs_diff(spot_x) <= 2 && y.abs_diff(spot_y) <= 2;
                pixels.push(if near { ramp + 1000 } else { ramp });
            }
        }
        pixels
    }

    fn write_frame(writer: &mut BufWriter<File>, pixels: &[u32]) -> Result<(), DeviceError> {
        for p in pixels {
            writer.write_all(&p.to_le_bytes())?;
        }
        Ok(())
    }
}

impl Detector for SimulatedDetector {
    fn identity(&self) -> String {
        self.model.clone()
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn abort_operation(&self) -> Result<(), DeviceError> {
        if self.is_busy() {
            info!("🛑 Abort requested");
            self.abort.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn register_event(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::SeqCst));
        self.handlers.lock().push((id, kind, handler));
        id
    }

    fn unregister_event(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(i, k, _)| !(*i == id && *k == kind));
        handlers.len() != before
    }

    fn with_last_frame(&self, visit: &mut dyn FnMut(Frame<'_>)) -> Result<(), DeviceError> {
        let guard = self.last_frame.lock();
        let pixels = guard.as_deref().ok_or(DeviceError::NoFrame)?;
        visit(Frame::new(self.width, self.height, pixels));
        Ok(())
    }

    fn run_acquisition(
        &self,
        frames: u32,
        exposure: Duration,
        format: OutputFormat,
        path: Option<&Path>,
    ) -> Result<(), DeviceError> {
        if frames == 0 {
            return Err(DeviceError::InvalidParameter("frame count must be at least 1".into()));
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(DeviceError::Busy);
        }
        let _busy = BusyGuard {
            busy: &self.busy,
            abort: &self.abort,
        };
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        let mut writer = match path {
            Some(path) => {
                debug!("Saving {:?} frames to {}", format, path.display());
                Some(BufWriter::new(File::create(path)?))
            }
            None => None,
        };

        info!("📷 Acquiring {} frame(s) of {:.3}s", frames, exposure.as_secs_f64());
        let mut completed = 0u32;
        let mut result = Ok(());
        for index in 0..frames {
            if let Err(e) = self.expose(exposure + self.frame_overhead) {
                result = Err(e);
                break;
            }
            let pixels = self.synthesize_frame(index);
            if let Some(writer) = writer.as_mut() {
                if let Err(e) = Self::write_frame(writer, &pixels) {
                    result = Err(e);
                    break;
                }
            }
            *self.last_frame.lock() = Some(pixels);
            completed += 1;
        }
        if let Some(mut writer) = writer {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush frame file: {}", e);
                result = result.and(Err(e.into()));
            }
        }

        info!("📷 Acquisition ended after {} of {} frame(s)", completed, frames);
        if completed > 0 {
            self.dispatch(EventKind::AcquisitionFinished, true)?;
        }
        result
    }
}
