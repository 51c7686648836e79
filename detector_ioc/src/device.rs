/*!
Detector device interface.

This is the boundary to the vendor SDK: identity and geometry, the busy
flag, advisory abort, event registration, access to the last completed
frame and the blocking acquisition primitive. The SDK invokes registered
handlers from its own thread.
*/

use shared::Frame;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Event classes a handler can be registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An acquisition finished and its last frame is available
    AcquisitionFinished,
    /// The hosting application asked every client to exit
    Exit,
}

/// Handler invoked on the SDK's event thread
pub type EventHandler = Arc<dyn Fn(EventKind) + Send + Sync>;

/// Token returned by registration, used to unregister the same handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// Output file format requested from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Let the device choose the format from the file extension
    #[default]
    AutoDetect,
    /// Raw little-endian 32-bit pixel counts
    Raw,
}

/// Errors reported by the detector device
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device is busy")]
    Busy,

    #[error("Operation aborted")]
    Aborted,

    #[error("No completed frame available")]
    NoFrame,

    #[error("Invalid acquisition parameter: {0}")]
    InvalidParameter(String),

    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device disconnected")]
    Disconnected,
}

/// A detector as exposed by the vendor SDK
pub trait Detector: Send + Sync {
    /// Full model name and serial
    fn identity(&self) -> String;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn is_busy(&self) -> bool;

    /// Ask a running operation to stop. Advisory: the acquisition call
    /// returns once the device has wound down.
    fn abort_operation(&self) -> Result<(), DeviceError>;

    fn register_event(&self, kind: EventKind, handler: EventHandler) -> HandlerId;

    /// Returns false when the handler was not registered for `kind`
    fn unregister_event(&self, kind: EventKind, id: HandlerId) -> bool;

    /// Lend the most recently completed frame to `visit`.
    ///
    /// The buffer is released as soon as `visit` returns.
    fn with_last_frame(&self, visit: &mut dyn FnMut(Frame<'_>)) -> Result<(), DeviceError>;

    /// Acquire `frames` frames of `exposure` each, blocking until done or
    /// aborted. Frames are stored at `path` when one is given.
    fn run_acquisition(
        &self,
        frames: u32,
        exposure: Duration,
        format: OutputFormat,
        path: Option<&Path>,
    ) -> Result<(), DeviceError>;
}
