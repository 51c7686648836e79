/*!
Process-variable database for the detector.

Names follow the areaDetector conventions (ADBase, NDFile and
NDPluginStdArrays) so that existing clients and display screens can be
pointed at the IOC without changes.
*/

use crate::value::{PvDef, Severity, Value, ValueKind};

/// Suffix reserved for read-back fields computed inside the IOC
pub const READBACK_SUFFIX: &str = "_RBV";

/// Capacity of the pixel payload array
pub const ARRAY_DATA_CAPACITY: usize = 6_553_600;

pub mod names {
    pub const MODEL: &str = "Model_RBV";
    pub const MAX_SIZE_X: &str = "MaxSizeX_RBV";
    pub const MAX_SIZE_Y: &str = "MaxSizeY_RBV";

    pub const ACQUIRE: &str = "Acquire";
    pub const ACQUIRE_TIME: &str = "AcquireTime";
    pub const NUM_IMAGES: &str = "NumImages";
    pub const DETECTOR_STATE: &str = "DetectorState_RBV";
    pub const STATUS_MESSAGE: &str = "StatusMessage_RBV";

    pub const NDIMENSIONS: &str = "NDimensions_RBV";
    pub const DIMENSIONS: &str = "Dimensions_RBV";
    pub const DATA_TYPE: &str = "DataType_RBV";
    pub const ARRAY_SIZE_X: &str = "ArraySizeX_RBV";
    pub const ARRAY_SIZE_Y: &str = "ArraySizeY_RBV";
    pub const ARRAY_SIZE_Z: &str = "ArraySizeZ_RBV";
    pub const ARRAY_DATA: &str = "ArrayData";
    pub const ARRAY_COUNTER: &str = "ArrayCounter_RBV";
    pub const COLOR_MODE: &str = "ColorMode_RBV";

    pub const FILE_PATH: &str = "FilePath";
    pub const FILE_NAME: &str = "FileName";
    pub const FILE_NUMBER: &str = "FileNumber";
    pub const FILE_TEMPLATE: &str = "FileTemplate";
    pub const AUTO_INCREMENT: &str = "AutoIncrement";
    pub const AUTO_SAVE: &str = "AutoSave";
    pub const FULL_FILE_NAME: &str = "FullFileName_RBV";
    pub const FILE_PATH_EXISTS: &str = "FilePathExists_RBV";
}

pub const ACQUIRE_STOP: u16 = 0;
pub const ACQUIRE_START: u16 = 1;

pub const NO_YES: &[&str] = &["No", "Yes"];
pub const STOP_START: &[&str] = &["Stop", "Start"];
pub const DATA_TYPES: &[&str] = &["Int8", "UInt8", "Int16", "UInt16", "Int32", "UInt32"];
pub const DATA_TYPE_UINT32: u16 = 5;

/// Labels for `DetectorState_RBV`, in index order
pub const DETECTOR_STATES: &[&str] = &["Idle", "Acquire", "Aborting", "Error"];
const DETECTOR_STATE_SEVERITIES: &[Severity] = &[
    Severity::NoAlarm,
    Severity::NoAlarm,
    Severity::Minor,
    Severity::Major,
];

/// Values of `DetectorState_RBV`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DetectorState {
    Idle = 0,
    Acquire = 1,
    Aborting = 2,
    Error = 3,
}

impl From<DetectorState> for Value {
    fn from(state: DetectorState) -> Self {
        Value::Enum(state as u16)
    }
}

/// Initial values that come from configuration and the opened device
#[derive(Debug, Clone)]
pub struct DatabaseDefaults {
    pub model: String,
    pub max_size_x: u32,
    pub max_size_y: u32,
    pub acquire_time: f64,
    pub num_images: i64,
    pub file_path: String,
    pub file_name: String,
    pub file_template: String,
    pub auto_increment: bool,
    pub auto_save: bool,
}

impl Default for DatabaseDefaults {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_size_x: 0,
            max_size_y: 0,
            acquire_time: 0.1,
            num_images: 1,
            file_path: String::new(),
            file_name: "test".to_string(),
            file_template: "%s_%04d.h5".to_string(),
            auto_increment: true,
            auto_save: true,
        }
    }
}

fn yes_no(flag: bool) -> Value {
    Value::Enum(u16::from(flag))
}

/// Declare every process variable served by the IOC
pub fn declarations(defaults: &DatabaseDefaults) -> Vec<PvDef> {
    use names::*;

    vec![
        // detector info
        PvDef::new(MODEL, ValueKind::Str, Value::Str(defaults.model.clone()))
            .with_count(40)
            .read_only(),
        PvDef::new(MAX_SIZE_X, ValueKind::Int, Value::Int(i64::from(defaults.max_size_x))).read_only(),
        PvDef::new(MAX_SIZE_Y, ValueKind::Int, Value::Int(i64::from(defaults.max_size_y))).read_only(),
        // acquisition control and status
        PvDef::new(ACQUIRE, ValueKind::Enum, Value::Enum(ACQUIRE_STOP)).with_enums(STOP_START),
        PvDef::new(ACQUIRE_TIME, ValueKind::Float, Value::Float(defaults.acquire_time)),
        PvDef::new(NUM_IMAGES, ValueKind::Int, Value::Int(defaults.num_images)),
        PvDef::new(DETECTOR_STATE, ValueKind::Enum, DetectorState::Idle.into())
            .with_enums(DETECTOR_STATES)
            .with_states(DETECTOR_STATE_SEVERITIES)
            .read_only(),
        PvDef::new(STATUS_MESSAGE, ValueKind::Str, Value::Str(String::new()))
            .with_count(256)
            .read_only(),
        // image data descriptors
        PvDef::new(NDIMENSIONS, ValueKind::Int, Value::Int(3)).read_only(),
        PvDef::new(DIMENSIONS, ValueKind::IntArray, Value::int_array(vec![0, 0, 0]))
            .with_count(3)
            .read_only(),
        PvDef::new(DATA_TYPE, ValueKind::Enum, Value::Enum(DATA_TYPE_UINT32))
            .with_enums(DATA_TYPES)
            .read_only(),
        PvDef::new(ARRAY_SIZE_X, ValueKind::Int, Value::Int(0)).read_only(),
        PvDef::new(ARRAY_SIZE_Y, ValueKind::Int, Value::Int(0)).read_only(),
        PvDef::new(ARRAY_SIZE_Z, ValueKind::Int, Value::Int(0)).read_only(),
        PvDef::new(ARRAY_DATA, ValueKind::IntArray, Value::int_array(Vec::new()))
            .with_count(ARRAY_DATA_CAPACITY)
            .read_only(),
        PvDef::new(ARRAY_COUNTER, ValueKind::Int, Value::Int(0)).read_only(),
        PvDef::new(COLOR_MODE, ValueKind::Enum, Value::Enum(0))
            .with_enums(&["Mono"])
            .read_only(),
        // file saving control
        PvDef::new(FILE_PATH, ValueKind::Char, Value::chars(&defaults.file_path)).with_count(128),
        PvDef::new(FILE_NAME, ValueKind::Char, Value::chars(&defaults.file_name)).with_count(128),
        PvDef::new(FILE_NUMBER, ValueKind::Int, Value::Int(0)),
        PvDef::new(FILE_TEMPLATE, ValueKind::Str, Value::Str(defaults.file_template.clone()))
            .with_count(40),
        PvDef::new(AUTO_INCREMENT, ValueKind::Enum, yes_no(defaults.auto_increment)).with_enums(NO_YES),
        PvDef::new(AUTO_SAVE, ValueKind::Enum, yes_no(defaults.auto_save)).with_enums(NO_YES),
        PvDef::new(FULL_FILE_NAME, ValueKind::Char, Value::chars(""))
            .with_count(256)
            .read_only(),
        PvDef::new(FILE_PATH_EXISTS, ValueKind::Enum, Value::Enum(0))
            .with_enums(NO_YES)
            .with_states(&[Severity::Major, Severity::NoAlarm])
            .read_only(),
    ]
}

/// True for names that only internal components may set
pub fn is_readback_name(name: &str) -> bool {
    name.ends_with(READBACK_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_readback_is_read_only() {
        for def in declarations(&DatabaseDefaults::default()) {
            if is_readback_name(def.name) {
                assert!(def.read_only, "{} should be read-only", def.name);
            }
        }
    }

    #[test]
    fn test_names_are_unique() {
        let defs = declarations(&DatabaseDefaults::default());
        let mut names: Vec<_> = defs.iter().map(|d| d.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), defs.len());
    }

    #[test]
    fn test_initial_values_match_kind() {
        for def in declarations(&DatabaseDefaults::default()) {
            assert_eq!(def.initial.kind(), def.kind, "{}", def.name);
        }
    }
}
