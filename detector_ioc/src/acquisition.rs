/*!
Acquisition worker and its controller.

At most one worker thread exists at a time. The controller decides to
spawn and installs the worker's handle under the same lock, so two
near-simultaneous start requests cannot both spawn. The worker clears its
own handle as the very last step, after every other post-acquisition
commit is visible in the table.
*/

use parking_lot::Mutex;
use shared::naming::full_file_name;
use shared::pvdb::{names, DetectorState, ACQUIRE_START, ACQUIRE_STOP};
use shared::{Severity, Value, ValueTable};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::callback::FrameCallback;
use crate::device::{Detector, DeviceError, EventKind, HandlerId, OutputFormat};

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);
const ABORT_POLL: Duration = Duration::from_millis(1);

/// Lifecycle of the acquisition worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Running,
    /// A stop was requested; the worker is winding down
    Stopping,
}

/// Parameters captured when an acquisition starts. Later writes to the
/// table only affect the next acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionParameters {
    pub exposure: f64,
    pub frames: i64,
    pub path: String,
    pub name: String,
    pub number: i64,
    pub template: String,
    pub auto_increment: bool,
    pub auto_save: bool,
}

impl AcquisitionParameters {
    /// Read every parameter under a single table lock
    pub fn snapshot(table: &ValueTable) -> Self {
        let [exposure, frames, path, name, number, template, auto_increment, auto_save] = table
            .snapshot([
                names::ACQUIRE_TIME,
                names::NUM_IMAGES,
                names::FILE_PATH,
                names::FILE_NAME,
                names::FILE_NUMBER,
                names::FILE_TEMPLATE,
                names::AUTO_INCREMENT,
                names::AUTO_SAVE,
            ]);
        let text = |v: Option<Value>| v.and_then(|v| v.as_text()).unwrap_or_default();
        let flag = |v: Option<Value>| v.and_then(|v| v.as_bool()).unwrap_or(false);

        Self {
            exposure: exposure.and_then(|v| v.as_f64()).unwrap_or(0.0),
            frames: frames.and_then(|v| v.as_i64()).unwrap_or(0),
            path: text(path),
            name: text(name),
            number: number.and_then(|v| v.as_i64()).unwrap_or(0),
            template: text(template),
            auto_increment: flag(auto_increment),
            auto_save: flag(auto_save),
        }
    }

    pub fn full_file_name(&self) -> shared::Result<PathBuf> {
        full_file_name(&self.path, &self.template, &self.name, self.number)
    }

    /// Frame count and exposure in the device's units
    fn device_arguments(&self) -> Result<(u32, Duration), String> {
        let frames = u32::try_from(self.frames)
            .ok()
            .filter(|f| *f > 0)
            .ok_or_else(|| format!("NumImages must be between 1 and {}", u32::MAX))?;
        let exposure = Duration::try_from_secs_f64(self.exposure)
            .map_err(|_| format!("AcquireTime {} is not a valid exposure", self.exposure))?;
        Ok((frames, exposure))
    }
}

/// How one pass of the worker ended
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Completed,
    Aborted,
    /// Stop arrived before the device was started
    Cancelled,
    /// Parameters were unusable; the device was not started
    Rejected(String),
    /// The device reported a fault
    Faulted(String),
}

impl Outcome {
    fn invoked_device(&self) -> bool {
        matches!(self, Outcome::Completed | Outcome::Aborted | Outcome::Faulted(_))
    }

    fn detector_state(&self) -> DetectorState {
        match self {
            Outcome::Rejected(_) | Outcome::Faulted(_) => DetectorState::Error,
            _ => DetectorState::Idle,
        }
    }

    fn status(&self) -> (String, Severity) {
        match self {
            Outcome::Completed => ("Acquisition complete".into(), Severity::NoAlarm),
            Outcome::Aborted => ("Acquisition aborted".into(), Severity::NoAlarm),
            Outcome::Cancelled => ("Acquisition stopped before start".into(), Severity::NoAlarm),
            Outcome::Rejected(msg) | Outcome::Faulted(msg) => (msg.clone(), Severity::Major),
        }
    }
}

#[derive(Debug)]
struct WorkerSlot {
    state: AcquisitionState,
    handle: Option<JoinHandle<()>>,
    closed: bool,
    /// The worker has committed to calling the device and has not returned
    invoking: bool,
}

/// Puts the controller back to idle if the worker unwinds
struct UnwindGuard<'a> {
    controller: &'a AcquisitionController,
}

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.controller.recover();
        }
    }
}

/// Frame callback registration for one pass
struct Registration<'a> {
    device: &'a dyn Detector,
    id: HandlerId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if !self.device.unregister_event(EventKind::AcquisitionFinished, self.id) {
            warn!("Frame callback was not registered at unregistration");
        }
    }
}

/// Owns the worker handle and the acquisition state
pub struct AcquisitionController {
    table: Arc<ValueTable>,
    device: Arc<dyn Detector>,
    slot: Mutex<WorkerSlot>,
}

impl AcquisitionController {
    pub fn new(table: Arc<ValueTable>, device: Arc<dyn Detector>) -> Self {
        Self {
            table,
            device,
            slot: Mutex::new(WorkerSlot {
                state: AcquisitionState::Idle,
                handle: None,
                closed: false,
                invoking: false,
            }),
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.slot.lock().state
    }

    /// True while a worker handle is installed
    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.slot.lock().handle.is_some()
    }

    /// Spawn a worker unless one already exists.
    ///
    /// Returns `Ok(false)` when a worker is already running or the
    /// controller has been shut down.
    pub fn start(self: &Arc<Self>) -> std::io::Result<bool> {
        let mut slot = self.slot.lock();
        if slot.closed || slot.handle.is_some() {
            return Ok(false);
        }

        let controller = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || controller.run())?;

        slot.handle = Some(handle);
        slot.state = AcquisitionState::Running;
        // A worker finishing just before this one may have reset Acquire
        self.table.set(names::ACQUIRE, Value::Enum(ACQUIRE_START));
        self.table.set(names::DETECTOR_STATE, DetectorState::Acquire);
        Ok(true)
    }

    /// Request a stop. The device is asked to abort if it is busy; the
    /// worker still completes its bookkeeping.
    pub fn stop(&self) {
        let invoking = {
            let mut slot = self.slot.lock();
            if slot.state == AcquisitionState::Running {
                slot.state = AcquisitionState::Stopping;
                self.table.set(names::DETECTOR_STATE, DetectorState::Aborting);
            }
            slot.invoking
        };

        if !invoking {
            if self.device.is_busy() {
                self.abort_device();
            }
            return;
        }

        // The worker passed its stop check and may not have reached the
        // device yet; wait until the call is underway or has returned
        loop {
            if self.device.is_busy() {
                self.abort_device();
                return;
            }
            if !self.slot.lock().invoking {
                return;
            }
            thread::sleep(ABORT_POLL);
        }
    }

    fn abort_device(&self) {
        if let Err(e) = self.device.abort_operation() {
            warn!("Abort request failed: {}", e);
        }
    }

    /// Refuse further starts, abort any running acquisition and wait for
    /// its worker to finish
    pub fn shutdown(&self) {
        let handle = {
            let mut slot = self.slot.lock();
            slot.closed = true;
            if slot.state == AcquisitionState::Running {
                slot.state = AcquisitionState::Stopping;
            }
            slot.handle.take()
        };

        if let Some(handle) = handle {
            info!("Waiting for acquisition worker to finish");
            // The worker may not have reached the device yet, so keep
            // asking until it is done
            while !handle.is_finished() {
                if self.device.is_busy() {
                    self.abort_device();
                }
                thread::sleep(SHUTDOWN_POLL);
            }
            if handle.join().is_err() {
                error!("Acquisition worker panicked");
            }
        }
    }

    /// Worker body: one pass from snapshot to bookkeeping
    fn run(&self) {
        let _guard = UnwindGuard { controller: self };
        let params = AcquisitionParameters::snapshot(&self.table);
        info!("🚀 Acquisition started: {:?}", params);

        let outcome = self.acquire(&params);
        match &outcome {
            Outcome::Faulted(msg) | Outcome::Rejected(msg) => error!("Acquisition failed: {}", msg),
            other => info!("Acquisition finished: {:?}", other),
        }

        // Bookkeeping runs whatever the outcome; the slot lock keeps a
        // concurrent stop from interleaving with the final state.
        let mut slot = self.slot.lock();
        let (mut message, mut severity) = outcome.status();
        let mut state = outcome.detector_state();
        if params.auto_increment && outcome.invoked_device() {
            match params.number.checked_add(1) {
                Some(next) => self.table.set(names::FILE_NUMBER, Value::Int(next)),
                None => {
                    message = format!("FileNumber {} cannot be incremented", params.number);
                    severity = Severity::Major;
                    state = DetectorState::Error;
                    error!("{}", message);
                }
            }
        }
        self.table.set(names::DETECTOR_STATE, state);
        self.table.set_with_severity(names::STATUS_MESSAGE, Value::Str(message), severity);
        self.table.set(names::ACQUIRE, Value::Enum(ACQUIRE_STOP));
        // Subscribers see the updates in commit order, Acquire last
        self.table.flush();

        slot.handle.take();
        slot.state = AcquisitionState::Idle;
    }

    /// Release the slot after the worker panicked part-way through a pass
    fn recover(&self) {
        let mut slot = self.slot.lock();
        let commits = [
            (names::DETECTOR_STATE, Value::from(DetectorState::Error), None),
            (
                names::STATUS_MESSAGE,
                Value::Str("Acquisition worker failed".into()),
                Some(Severity::Major),
            ),
            (names::ACQUIRE, Value::Enum(ACQUIRE_STOP), None),
        ];
        for (name, value, severity) in commits {
            if let Err(e) = self.table.try_set(name, value, severity) {
                error!("Recovery write to {} failed: {}", name, e);
            }
        }
        self.table.flush();

        slot.handle.take();
        slot.invoking = false;
        slot.state = AcquisitionState::Idle;
        error!("Acquisition worker panicked; controller reset to idle");
    }

    fn acquire(&self, params: &AcquisitionParameters) -> Outcome {
        let full_name = match params.full_file_name() {
            Ok(path) => path,
            Err(e) => return Outcome::Rejected(e.to_string()),
        };
        let full_name_text = full_name.to_string_lossy().into_owned();
        self.table.set(names::FULL_FILE_NAME, Value::chars(&full_name_text));
        self.table.flush();

        let (frames, exposure) = match params.device_arguments() {
            Ok(args) => args,
            Err(msg) => return Outcome::Rejected(msg),
        };
        let destination = params.auto_save.then_some(full_name.as_path());

        let handler = FrameCallback::new(Arc::clone(&self.table), &self.device).into_handler();
        let _registration = Registration {
            device: self.device.as_ref(),
            id: self.device.register_event(EventKind::AcquisitionFinished, handler),
        };

        // Decided under the slot lock so a stop either cancels the pass
        // here or sees `invoking` and waits to abort the device
        let proceed = {
            let mut slot = self.slot.lock();
            slot.invoking = slot.state != AcquisitionState::Stopping;
            slot.invoking
        };
        let result = proceed
            .then(|| self.device.run_acquisition(frames, exposure, OutputFormat::AutoDetect, destination));
        self.slot.lock().invoking = false;

        match result {
            None => Outcome::Cancelled,
            Some(Ok(())) => Outcome::Completed,
            Some(Err(DeviceError::Aborted)) => Outcome::Aborted,
            Some(Err(e)) => Outcome::Faulted(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EventHandler;
    use crate::simulated::SimulatedDetector;
    use shared::pvdb::{declarations, DatabaseDefaults};
    use shared::Frame;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;
    use tempfile::tempdir;

    struct Fixture {
        table: Arc<ValueTable>,
        sim: Arc<SimulatedDetector>,
        controller: Arc<AcquisitionController>,
    }

    fn fixture() -> Fixture {
        let sim = Arc::new(SimulatedDetector::new("sim", 4, 4, Duration::ZERO).unwrap());
        let (table, controller) = controller_for(sim.clone());
        Fixture {
            table,
            sim,
            controller,
        }
    }

    fn controller_for(device: Arc<dyn Detector>) -> (Arc<ValueTable>, Arc<AcquisitionController>) {
        let defaults = DatabaseDefaults {
            acquire_time: 0.001,
            auto_save: false,
            ..DatabaseDefaults::default()
        };
        let table = Arc::new(ValueTable::new(declarations(&defaults)));
        let controller = Arc::new(AcquisitionController::new(Arc::clone(&table), device));
        (table, controller)
    }

    /// Wraps the simulator, optionally panicking on the first acquisition
    /// or stalling before the device reports busy
    struct WrappedDetector {
        inner: Arc<SimulatedDetector>,
        panic_on_first: bool,
        start_delay: Duration,
        calls: AtomicU64,
    }

    impl WrappedDetector {
        fn new(inner: Arc<SimulatedDetector>) -> Self {
            Self {
                inner,
                panic_on_first: false,
                start_delay: Duration::ZERO,
                calls: AtomicU64::new(0),
            }
        }
    }

    impl Detector for WrappedDetector {
        fn identity(&self) -> String {
            self.inner.identity()
        }

        fn width(&self) -> u32 {
            self.inner.width()
        }

        fn height(&self) -> u32 {
            self.inner.height()
        }

        fn is_busy(&self) -> bool {
            self.inner.is_busy()
        }

        fn abort_operation(&self) -> Result<(), DeviceError> {
            self.inner.abort_operation()
        }

        fn register_event(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
            self.inner.register_event(kind, handler)
        }

        fn unregister_event(&self, kind: EventKind, id: HandlerId) -> bool {
            self.inner.unregister_event(kind, id)
        }

        fn with_last_frame(&self, visit: &mut dyn FnMut(Frame<'_>)) -> Result<(), DeviceError> {
            self.inner.with_last_frame(visit)
        }

        fn run_acquisition(
            &self,
            frames: u32,
            exposure: Duration,
            format: OutputFormat,
            path: Option<&Path>,
        ) -> Result<(), DeviceError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 && self.panic_on_first {
                panic!("SDK crashed during acquisition");
            }
            thread::sleep(self.start_delay);
            self.inner.run_acquisition(frames, exposure, format, path)
        }
    }

    fn wait_idle(controller: &AcquisitionController) {
        let start = Instant::now();
        while controller.is_active() {
            assert!(start.elapsed() < Duration::from_secs(10), "worker did not finish");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_snapshot_reads_parameters() {
        let f = fixture();
        f.table.set(names::FILE_PATH, Value::chars("/data"));
        f.table.set(names::FILE_NUMBER, Value::Int(3));

        let params = AcquisitionParameters::snapshot(&f.table);
        assert_eq!(params.path, "/data");
        assert_eq!(params.name, "test");
        assert_eq!(params.number, 3);
        assert_eq!(params.frames, 1);
        assert!(params.auto_increment);
        assert!(!params.auto_save);
        assert_eq!(params.full_file_name().unwrap(), PathBuf::from("/data/test_0003.h5"));
    }

    #[test]
    fn test_single_pass_settles_back_to_idle() {
        let f = fixture();
        f.table.set(names::FILE_NUMBER, Value::Int(5));

        assert!(f.controller.start().unwrap());
        wait_idle(&f.controller);

        assert_eq!(f.controller.state(), AcquisitionState::Idle);
        assert_eq!(f.sim.acquisitions_started(), 1);
        assert_eq!(f.table.get(names::FILE_NUMBER), Some(Value::Int(6)));
        assert_eq!(f.table.get(names::ACQUIRE), Some(Value::Enum(ACQUIRE_STOP)));
        assert_eq!(f.table.get(names::DETECTOR_STATE), Some(DetectorState::Idle.into()));
        assert_eq!(f.table.get(names::ARRAY_COUNTER), Some(Value::Int(1)));
    }

    #[test]
    fn test_second_start_while_running_is_refused() {
        let f = fixture();
        f.table.set(names::ACQUIRE_TIME, Value::Float(0.3));

        assert!(f.controller.start().unwrap());
        assert!(!f.controller.start().unwrap());
        wait_idle(&f.controller);

        assert_eq!(f.sim.acquisitions_started(), 1);
    }

    #[test]
    fn test_stop_aborts_running_device() {
        let f = fixture();
        f.table.set(names::ACQUIRE_TIME, Value::Float(30.0));
        f.table.set(names::FILE_NUMBER, Value::Int(1));

        assert!(f.controller.start().unwrap());
        let start = Instant::now();
        while !f.sim.is_busy() {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
        }
        f.controller.stop();
        wait_idle(&f.controller);

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(
            f.table.get(names::STATUS_MESSAGE),
            Some(Value::Str("Acquisition aborted".into()))
        );
        // the device ran, so the sequence number still advances
        assert_eq!(f.table.get(names::FILE_NUMBER), Some(Value::Int(2)));
        assert_eq!(f.table.get(names::ACQUIRE), Some(Value::Enum(ACQUIRE_STOP)));
    }

    #[test]
    fn test_bad_template_skips_device_and_number() {
        let f = fixture();
        f.table.set(names::FILE_TEMPLATE, Value::Str("%d_%s".into()));

        assert!(f.controller.start().unwrap());
        wait_idle(&f.controller);

        assert_eq!(f.sim.acquisitions_started(), 0);
        assert_eq!(f.table.get(names::FILE_NUMBER), Some(Value::Int(0)));
        assert_eq!(f.table.get(names::DETECTOR_STATE), Some(DetectorState::Error.into()));
        assert_eq!(f.table.severity(names::STATUS_MESSAGE), Some(Severity::Major));
        assert_eq!(f.table.get(names::ACQUIRE), Some(Value::Enum(ACQUIRE_STOP)));
    }

    #[test]
    fn test_device_fault_is_reported_but_settles() {
        let f = fixture();
        f.table.set(names::AUTO_SAVE, Value::Enum(1));
        f.table.set(names::FILE_PATH, Value::chars("/nonexistent/output/dir"));

        assert!(f.controller.start().unwrap());
        wait_idle(&f.controller);

        assert_eq!(f.table.get(names::DETECTOR_STATE), Some(DetectorState::Error.into()));
        assert_eq!(f.table.severity(names::STATUS_MESSAGE), Some(Severity::Major));
        assert_eq!(f.table.get(names::ACQUIRE), Some(Value::Enum(ACQUIRE_STOP)));
        assert_eq!(f.controller.state(), AcquisitionState::Idle);
    }

    #[test]
    fn test_auto_save_writes_full_file_name() {
        let f = fixture();
        let dir = tempdir().unwrap();
        let dir_text = dir.path().to_string_lossy().into_owned();
        f.table.set(names::AUTO_SAVE, Value::Enum(1));
        f.table.set(names::FILE_PATH, Value::chars(&dir_text));
        f.table.set(names::FILE_NUMBER, Value::Int(3));

        assert!(f.controller.start().unwrap());
        wait_idle(&f.controller);

        let expected = dir.path().join("test_0003.h5");
        assert!(expected.exists());
        assert_eq!(
            f.table.get(names::FULL_FILE_NAME).and_then(|v| v.as_text()),
            Some(expected.to_string_lossy().into_owned())
        );
    }

    #[test]
    fn test_file_number_at_maximum_is_not_wrapped() {
        let f = fixture();
        f.table.set(names::FILE_NUMBER, Value::Int(i64::MAX));

        assert!(f.controller.start().unwrap());
        wait_idle(&f.controller);

        assert_eq!(f.sim.acquisitions_started(), 1);
        assert_eq!(f.table.get(names::FILE_NUMBER), Some(Value::Int(i64::MAX)));
        assert_eq!(f.table.severity(names::STATUS_MESSAGE), Some(Severity::Major));
        assert_eq!(f.table.get(names::DETECTOR_STATE), Some(DetectorState::Error.into()));
        assert_eq!(f.table.get(names::ACQUIRE), Some(Value::Enum(ACQUIRE_STOP)));

        // the controller is still usable
        f.table.set(names::FILE_NUMBER, Value::Int(1));
        assert!(f.controller.start().unwrap());
        wait_idle(&f.controller);
        assert_eq!(f.sim.acquisitions_started(), 2);
        assert_eq!(f.table.get(names::FILE_NUMBER), Some(Value::Int(2)));
    }

    #[test]
    fn test_worker_panic_releases_slot() {
        let sim = Arc::new(SimulatedDetector::new("sim", 4, 4, Duration::ZERO).unwrap());
        let device = WrappedDetector {
            panic_on_first: true,
            ..WrappedDetector::new(sim.clone())
        };
        let (table, controller) = controller_for(Arc::new(device));
        table.set(names::FILE_NUMBER, Value::Int(7));

        assert!(controller.start().unwrap());
        wait_idle(&controller);

        assert_eq!(controller.state(), AcquisitionState::Idle);
        assert_eq!(table.get(names::ACQUIRE), Some(Value::Enum(ACQUIRE_STOP)));
        assert_eq!(table.get(names::DETECTOR_STATE), Some(DetectorState::Error.into()));
        assert_eq!(table.severity(names::STATUS_MESSAGE), Some(Severity::Major));
        assert_eq!(table.get(names::FILE_NUMBER), Some(Value::Int(7)));

        assert!(controller.start().unwrap());
        wait_idle(&controller);
        assert_eq!(sim.acquisitions_started(), 1);
        assert_eq!(table.get(names::DETECTOR_STATE), Some(DetectorState::Idle.into()));
        assert_eq!(table.get(names::FILE_NUMBER), Some(Value::Int(8)));
    }

    #[test]
    fn test_stop_before_device_reports_busy_still_aborts() {
        let sim = Arc::new(SimulatedDetector::new("sim", 4, 4, Duration::ZERO).unwrap());
        let device = WrappedDetector {
            start_delay: Duration::from_millis(200),
            ..WrappedDetector::new(sim.clone())
        };
        let (table, controller) = controller_for(Arc::new(device));
        table.set(names::ACQUIRE_TIME, Value::Float(30.0));

        assert!(controller.start().unwrap());
        let start = Instant::now();
        while !controller.slot.lock().invoking {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!sim.is_busy());
        controller.stop();
        wait_idle(&controller);

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(sim.acquisitions_started(), 1);
        assert_eq!(
            table.get(names::STATUS_MESSAGE),
            Some(Value::Str("Acquisition aborted".into()))
        );
    }

    #[test]
    fn test_shutdown_joins_worker_and_refuses_start() {
        let f = fixture();
        f.table.set(names::ACQUIRE_TIME, Value::Float(30.0));

        assert!(f.controller.start().unwrap());
        let start = Instant::now();
        f.controller.shutdown();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(!f.controller.start().unwrap());
        assert_eq!(f.table.get(names::ACQUIRE), Some(Value::Enum(ACQUIRE_STOP)));
    }
}
