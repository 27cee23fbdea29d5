//! Registry mapping feature names to their declared SDK types.
//!
//! The driver exposes features by name only; which typed primitive is
//! valid for each name is documented, not discoverable. The registry
//! captures that documentation so accessors can dispatch before touching
//! the driver and reject mistyped reads locally.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{AndorError, CamResult};

/// Declared type of a feature, driving which driver primitives apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureType {
    /// 64-bit integer.
    Int,
    /// Double-precision float.
    Float,
    /// Boolean flag.
    Bool,
    /// Enumerated value addressed by index or value string.
    Enum,
    /// UTF-8 string.
    String,
    /// Side-effect-only command.
    Command,
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeatureType::Int => "Int",
            FeatureType::Float => "Float",
            FeatureType::Bool => "Bool",
            FeatureType::Enum => "Enum",
            FeatureType::String => "String",
            FeatureType::Command => "Command",
        };
        f.write_str(s)
    }
}

/// Entries of the built-in table, as documented for SDK3 devices.
const KNOWN_FEATURES: &[(&str, FeatureType)] = &[
    // Integers
    ("AccumulateCount", FeatureType::Int),
    ("AOIHBin", FeatureType::Int),
    ("AOIHeight", FeatureType::Int),
    ("AOILeft", FeatureType::Int),
    ("AOIStride", FeatureType::Int),
    ("AOITop", FeatureType::Int),
    ("AOIVBin", FeatureType::Int),
    ("AOIWidth", FeatureType::Int),
    ("BaselineLevel", FeatureType::Int),
    ("BufferOverflowEvent", FeatureType::Int),
    ("DeviceCount", FeatureType::Int),
    ("DeviceVideoIndex", FeatureType::Int),
    ("EventsMissedEvent", FeatureType::Int),
    ("ExposureStartEvent", FeatureType::Int),
    ("ExposureEndEvent", FeatureType::Int),
    ("FrameCount", FeatureType::Int),
    ("ImageSizeBytes", FeatureType::Int),
    ("LUTIndex", FeatureType::Int),
    ("LUTValue", FeatureType::Int),
    ("RowNExposureStartEvent", FeatureType::Int),
    ("RowNExposureEndEvent", FeatureType::Int),
    ("SensorHeight", FeatureType::Int),
    ("SensorWidth", FeatureType::Int),
    ("TimestampClock", FeatureType::Int),
    ("TimestampClockFrequency", FeatureType::Int),
    // Floats
    ("BytesPerPixel", FeatureType::Float),
    ("ExposureTime", FeatureType::Float),
    ("FrameRate", FeatureType::Float),
    ("MaxInterfaceTransferRate", FeatureType::Float),
    ("PixelHeight", FeatureType::Float),
    ("PixelWidth", FeatureType::Float),
    ("ReadoutTime", FeatureType::Float),
    ("SensorTemperature", FeatureType::Float),
    ("TargetSensorTemperature", FeatureType::Float),
    // Booleans
    ("AlternatingReadoutDirection", FeatureType::Bool),
    ("CameraAcquiring", FeatureType::Bool),
    ("CameraPresent", FeatureType::Bool),
    ("EventEnable", FeatureType::Bool),
    ("FastAOIFrameRateEnable", FeatureType::Bool),
    ("FullAOIControl", FeatureType::Bool),
    ("IOInvert", FeatureType::Bool),
    ("MetadataEnable", FeatureType::Bool),
    ("MetadataFrame", FeatureType::Bool),
    ("MetadataTimestamp", FeatureType::Bool),
    ("Overlap", FeatureType::Bool),
    ("RollingShutterGlobalClear", FeatureType::Bool),
    ("ScanSpeedControlEnable", FeatureType::Bool),
    ("SensorCooling", FeatureType::Bool),
    ("SpuriousNoiseFilter", FeatureType::Bool),
    ("StaticBlemishCorrection", FeatureType::Bool),
    ("SynchronousTriggering", FeatureType::Bool),
    ("VerticallyCentreAOI", FeatureType::Bool),
    // Enumerations
    ("AOIBinning", FeatureType::Enum),
    ("AOILayout", FeatureType::Enum),
    ("AuxiliaryOutSource", FeatureType::Enum),
    ("AuxOutSourceTwo", FeatureType::Enum),
    ("BitDepth", FeatureType::Enum),
    ("CycleMode", FeatureType::Enum),
    ("ElectronicShutteringMode", FeatureType::Enum),
    ("EventSelector", FeatureType::Enum),
    ("FanSpeed", FeatureType::Enum),
    ("GateMode", FeatureType::Enum),
    ("IOSelector", FeatureType::Enum),
    ("PixelCorrection", FeatureType::Enum),
    ("PixelEncoding", FeatureType::Enum),
    ("PixelReadoutRate", FeatureType::Enum),
    ("PreAmpGain", FeatureType::Enum),
    ("PreAmpGainChannel", FeatureType::Enum),
    ("PreAmpGainControl", FeatureType::Enum),
    ("PreAmpGainSelector", FeatureType::Enum),
    ("SensorReadoutMode", FeatureType::Enum),
    ("ShutterMode", FeatureType::Enum),
    ("ShutterOutputMode", FeatureType::Enum),
    ("SimplePreAmpGainControl", FeatureType::Enum),
    ("TemperatureControl", FeatureType::Enum),
    ("TemperatureStatus", FeatureType::Enum),
    ("TriggerMode", FeatureType::Enum),
    // Strings
    ("CameraFamily", FeatureType::String),
    ("CameraModel", FeatureType::String),
    ("CameraName", FeatureType::String),
    ("ControllerID", FeatureType::String),
    ("DDR2Type", FeatureType::String),
    ("DriverVersion", FeatureType::String),
    ("FirmwareVersion", FeatureType::String),
    ("InterfaceType", FeatureType::String),
    ("MicrocodeVersion", FeatureType::String),
    ("SensorModel", FeatureType::String),
    ("SerialNumber", FeatureType::String),
    ("SoftwareVersion", FeatureType::String),
    // Commands
    ("AcquisitionStart", FeatureType::Command),
    ("AcquisitionStop", FeatureType::Command),
    ("CameraDump", FeatureType::Command),
    ("SoftwareTrigger", FeatureType::Command),
    ("TimestampClockReset", FeatureType::Command),
];

static DEFAULT_TABLE: Lazy<HashMap<&'static str, FeatureType>> =
    Lazy::new(|| KNOWN_FEATURES.iter().copied().collect());

/// Lookup table from feature names to declared types.
///
/// Starts from the built-in SDK3 table; entries for device-specific or
/// newly documented features can be added at runtime.
#[derive(Debug, Clone)]
pub struct FeatureRegistry {
    extra: HashMap<String, FeatureType>,
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureRegistry {
    /// Registry holding only the built-in table.
    pub fn new() -> Self {
        Self {
            extra: HashMap::new(),
        }
    }

    /// Add or override an entry. Surrounding whitespace in `name` is
    /// ignored.
    pub fn insert(&mut self, name: &str, ty: FeatureType) {
        self.extra.insert(name.trim().to_owned(), ty);
    }

    /// Declared type of `name`, or `NotImplemented` for blank or unknown
    /// names. Surrounding whitespace is ignored.
    pub fn lookup(&self, name: &str) -> CamResult<FeatureType> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(AndorError::NotImplemented {
                feature: String::new(),
            });
        }
        if let Some(ty) = self.extra.get(trimmed) {
            return Ok(*ty);
        }
        DEFAULT_TABLE
            .get(trimmed)
            .copied()
            .ok_or_else(|| AndorError::NotImplemented {
                feature: trimmed.to_owned(),
            })
    }

    /// Whether `name` resolves to an entry.
    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_resolves_builtin_entries() {
        let reg = FeatureRegistry::new();
        assert_eq!(reg.lookup("ExposureTime").unwrap(), FeatureType::Float);
        assert_eq!(reg.lookup("CameraModel").unwrap(), FeatureType::String);
        assert_eq!(reg.lookup("AcquisitionStart").unwrap(), FeatureType::Command);
    }

    #[test]
    fn lookup_trims_whitespace() {
        let reg = FeatureRegistry::new();
        assert_eq!(reg.lookup("  FrameCount ").unwrap(), FeatureType::Int);
    }

    #[test]
    fn unknown_and_blank_names_are_not_implemented() {
        let reg = FeatureRegistry::new();
        assert!(matches!(
            reg.lookup("NoSuchFeature"),
            Err(AndorError::NotImplemented { .. })
        ));
        assert!(matches!(
            reg.lookup("   "),
            Err(AndorError::NotImplemented { .. })
        ));
    }

    #[test]
    fn every_discovery_feature_is_registered() {
        let reg = FeatureRegistry::new();
        let metadata = [
            "CameraName",
            "CameraModel",
            "SerialNumber",
            "ControllerID",
            "CameraFamily",
            "SensorModel",
            "FirmwareVersion",
            "DriverVersion",
            "MicrocodeVersion",
            "InterfaceType",
        ];
        for name in metadata {
            assert_eq!(reg.lookup(name).unwrap(), FeatureType::String, "{name}");
        }
        assert_eq!(reg.lookup("SensorWidth").unwrap(), FeatureType::Int);
        assert_eq!(reg.lookup("SensorHeight").unwrap(), FeatureType::Int);
        assert_eq!(reg.lookup("PixelWidth").unwrap(), FeatureType::Float);
        assert_eq!(reg.lookup("PixelHeight").unwrap(), FeatureType::Float);
    }

    #[test]
    fn runtime_entries_override_builtins() {
        let mut reg = FeatureRegistry::new();
        reg.insert("VendorSpecial", FeatureType::Enum);
        assert_eq!(reg.lookup("VendorSpecial").unwrap(), FeatureType::Enum);
        reg.insert("ExposureTime", FeatureType::Int);
        assert_eq!(reg.lookup("ExposureTime").unwrap(), FeatureType::Int);
    }
}
