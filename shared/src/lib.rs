/*!
# Shared Types and Utilities

This crate contains the named-value model shared by the detector IOC
components.

## Core Types

- [`Value`] - Current value of a process variable
- [`PvDef`] - Declaration of a process variable (kind, capacity, enums)
- [`ValueTable`] - Thread-safe table of named values
- [`Frame`] - A detector frame borrowed from the SDK

## Modules

- [`pvdb`] - The declared process variables and their names
- [`table`] - Synchronized value storage and change publication
- [`naming`] - printf-style output file naming
- [`error`] - Common error types
*/

pub mod error;
pub mod frame;
pub mod naming;
pub mod pvdb;
pub mod table;
pub mod value;

// Re-export commonly used types
pub use error::{Result, SharedError};
pub use frame::Frame;
pub use table::{Reading, Update, ValueTable};
pub use value::{PvDef, Severity, Value, ValueKind};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
