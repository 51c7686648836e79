/*!
Command dispatcher.

Every external write goes through [`CommandDispatcher::handle_write`].
Read-back fields are rejected without touching the table; `Acquire` and
`FilePath` carry side effects; everything else is a plain commit.
*/

use shared::pvdb::{is_readback_name, names, ACQUIRE_START, ACQUIRE_STOP};
use shared::{Severity, SharedError, Value, ValueTable};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::acquisition::AcquisitionController;

/// Why an external write was not accepted
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("{0} is read-only")]
    ReadOnly(String),

    #[error("{0} is not a known process variable")]
    Undeclared(String),

    #[error("{0}")]
    InvalidValue(SharedError),
}

impl From<SharedError> for WriteError {
    fn from(e: SharedError) -> Self {
        match e {
            SharedError::Undeclared(name) => WriteError::Undeclared(name),
            other => WriteError::InvalidValue(other),
        }
    }
}

/// True when `path` is an existing directory this process can create files in.
///
/// Creates and removes a temporary file, so callers on an async runtime
/// should run it on the blocking pool.
pub fn is_writable_dir(path: &Path) -> bool {
    path.is_dir() && tempfile::tempfile_in(path).is_ok()
}

pub struct CommandDispatcher {
    table: Arc<ValueTable>,
    acquisition: Arc<AcquisitionController>,
}

impl CommandDispatcher {
    pub fn new(table: Arc<ValueTable>, acquisition: Arc<AcquisitionController>) -> Self {
        Self { table, acquisition }
    }

    pub fn table(&self) -> &Arc<ValueTable> {
        &self.table
    }

    /// Apply an external write. `Ok` means the write was accepted.
    ///
    /// Side effects are applied before returning, and changed values are
    /// flushed to subscribers.
    pub fn handle_write(&self, name: &str, value: Value) -> Result<(), WriteError> {
        let def = self
            .table
            .definition(name)
            .ok_or_else(|| WriteError::Undeclared(name.to_string()))?;
        if def.read_only || is_readback_name(name) {
            warn!("Rejected write to read-only {}", name);
            return Err(WriteError::ReadOnly(name.to_string()));
        }
        let value = def.conform(value)?;
        debug!("Write {} = {:?}", name, value);

        match name {
            names::ACQUIRE => {
                let start = value.as_i64() == Some(i64::from(ACQUIRE_START));
                self.table.try_set(name, value, None)?;
                if start {
                    self.start_acquisition();
                } else {
                    self.acquisition.stop();
                }
            }
            names::FILE_PATH => {
                self.table.try_set(name, value, None)?;
                self.refresh_path_exists();
            }
            _ => self.table.try_set(name, value, None)?,
        }

        self.table.flush();
        Ok(())
    }

    /// Parse client text into the declared kind, then apply it as a write
    pub fn handle_text_write(&self, name: &str, text: &str) -> Result<(), WriteError> {
        let def = self
            .table
            .definition(name)
            .ok_or_else(|| WriteError::Undeclared(name.to_string()))?;
        let value = def.parse(text)?;
        self.handle_write(name, value)
    }

    /// Recompute `FilePathExists_RBV` from the current `FilePath`
    pub fn refresh_path_exists(&self) {
        let path = self
            .table
            .get(names::FILE_PATH)
            .and_then(|v| v.as_text())
            .unwrap_or_default();
        let ok = is_writable_dir(Path::new(&path));
        let severity = if ok { Severity::NoAlarm } else { Severity::Major };
        self.table
            .set_with_severity(names::FILE_PATH_EXISTS, Value::Enum(u16::from(ok)), severity);
        if !ok {
            info!("Output path '{}' does not exist or is not writable", path);
        }
    }

    fn start_acquisition(&self) {
        match self.acquisition.start() {
            Ok(true) => info!("Acquisition worker started"),
            Ok(false) => debug!("Start ignored, acquisition already active"),
            Err(e) => {
                error!("Failed to spawn acquisition worker: {}", e);
                self.table.set(names::ACQUIRE, Value::Enum(ACQUIRE_STOP));
                self.table.set_with_severity(
                    names::STATUS_MESSAGE,
                    Value::Str(format!("Failed to start acquisition: {}", e)),
                    Severity::Major,
                );
            }
        }
    }
}
