//! Typed access to named driver features.
//!
//! A [`FeatureAccessor`] is a cursor bound to one (device handle, feature
//! name, declared type) triple. Reads and writes dispatch on the declared
//! type, never on the value the caller happens to hold: asking for an
//! arithmetic read of a `String` feature is a [`AndorError::TypeMismatch`],
//! not a conversion. Every driver call is formatted as the equivalent C
//! signature, offered to the diagnostic sink, and kept as `last_call()` so
//! failures can be reported with the exact call that produced them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::driver::{DeviceHandle, Driver};
use crate::error::{AndorError, CamResult};
use crate::log::CameraLog;
use crate::registry::FeatureType;

mod sealed {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// Arithmetic types an accessor can read into or write from.
///
/// The trait is sealed; the driver only speaks `i64` and `f64`, and these
/// conversions define how narrower caller types map onto them.
pub trait Arithmetic: sealed::Sealed + Copy + PartialEq + std::fmt::Debug {
    /// Name used in type-mismatch diagnostics.
    const NAME: &'static str;

    #[allow(missing_docs)]
    fn from_i64(v: i64) -> Self;
    #[allow(missing_docs)]
    fn to_i64(self) -> i64;
    #[allow(missing_docs)]
    fn from_f64(v: f64) -> Self;
    #[allow(missing_docs)]
    fn to_f64(self) -> f64;
}

macro_rules! impl_arithmetic {
    ($($t:ty),*) => {$(
        impl Arithmetic for $t {
            const NAME: &'static str = stringify!($t);
            fn from_i64(v: i64) -> Self { v as $t }
            fn to_i64(self) -> i64 { self as i64 }
            fn from_f64(v: f64) -> Self { v as $t }
            fn to_f64(self) -> f64 { self as f64 }
        }
    )*};
}

impl_arithmetic!(i32, i64, u32, u64, f32, f64);

/// Last value observed through an accessor, stored by tag.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    /// Boolean feature state.
    Bool(bool),
    /// 64-bit integer feature state.
    Int(i64),
    /// Floating-point feature state.
    Float(f64),
    /// Selected index of an enumerated feature.
    EnumIndex(i32),
    /// String feature contents.
    Str(String),
}

/// Snapshot of a string feature: the name and what it read as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringFeature {
    /// Feature name.
    pub name: String,
    /// Value at the time of the read.
    pub value: String,
}

/// Snapshot of an enumerated feature's current selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumFeature {
    /// Feature name.
    pub name: String,
    /// Value string of the selected entry.
    pub value: String,
    /// Index of the selected entry.
    pub index: i32,
}

/// Full introspection of an enumerated feature.
///
/// `implemented` is expected to contain `available` but that is whatever
/// the driver reports, not something this layer enforces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumInfo {
    /// Feature name.
    pub name: String,
    /// Every value string, in ascending index order.
    pub values: Vec<String>,
    /// Indices the device implements.
    pub implemented: Vec<i32>,
    /// Indices currently selectable.
    pub available: Vec<i32>,
    /// Index selected at the time of the query.
    pub current_index: i32,
}

/// The four capability flags of a feature, queried independently.
///
/// No invariant links them; a feature may be implemented yet neither
/// readable nor writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureInfo {
    /// Whether the device implements the feature at all.
    pub is_implemented: bool,
    /// Whether the feature is currently readable.
    pub is_readable: bool,
    /// Whether the feature is permanently read-only.
    pub is_read_only: bool,
    /// Whether the feature is currently writable.
    pub is_writable: bool,
}

/// Handle-bound cursor over one named feature.
///
/// Rebindable with [`bind_to`](Self::bind_to); deliberately not `Clone`,
/// the handle owns the device and the accessor is just a view onto it.
pub struct FeatureAccessor {
    driver: Arc<dyn Driver>,
    log: CameraLog,
    handle: DeviceHandle,
    name: String,
    ty: FeatureType,
    cached: Option<FeatureValue>,
    last_call: String,
}

impl FeatureAccessor {
    /// New accessor bound to nothing useful yet; call
    /// [`bind_to`](Self::bind_to) before use.
    pub fn new(driver: Arc<dyn Driver>, log: CameraLog) -> Self {
        Self {
            driver,
            log,
            handle: DeviceHandle(0),
            name: String::new(),
            ty: FeatureType::Int,
            cached: None,
            last_call: String::new(),
        }
    }

    /// Rebind to a new (handle, name, type) triple. Touches no driver
    /// state. The name is trimmed; a blank name is rejected.
    pub fn bind_to(&mut self, handle: DeviceHandle, name: &str, ty: FeatureType) -> CamResult<()> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(AndorError::NotImplemented {
                feature: String::new(),
            });
        }
        self.handle = handle;
        self.name = trimmed.to_owned();
        self.ty = ty;
        self.cached = None;
        Ok(())
    }

    /// Name the accessor is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type the accessor is bound to.
    pub fn feature_type(&self) -> FeatureType {
        self.ty
    }

    /// Formatted signature of the most recent driver call.
    pub fn last_call(&self) -> &str {
        &self.last_call
    }

    /// Value observed by the most recent successful read or write, if any.
    /// The cache is a convenience, not a source of truth.
    pub fn cached_value(&self) -> Option<&FeatureValue> {
        self.cached.as_ref()
    }

    /// Record the call signature, run the driver call, and on an SDK
    /// failure rewrap it so the error carries this signature.
    fn dispatch<T>(
        &mut self,
        signature: String,
        op: impl FnOnce(&dyn Driver) -> CamResult<T>,
    ) -> CamResult<T> {
        self.log.call(&signature);
        self.last_call = signature;
        match op(self.driver.as_ref()) {
            Ok(v) => Ok(v),
            Err(AndorError::Sdk { code, .. }) => {
                let err = AndorError::sdk(code, self.last_call.clone());
                self.log.error(&err.to_string());
                Err(err)
            }
            Err(other) => {
                self.log.error(&other.to_string());
                Err(other)
            }
        }
    }

    fn mismatch(&self, requested: &'static str) -> AndorError {
        AndorError::TypeMismatch {
            feature: self.name.clone(),
            declared: self.ty,
            requested,
        }
    }

    /// Read the feature as arithmetic `T`, dispatching on the declared type.
    ///
    /// Int reads an `i64`, Float a `f64`, Bool maps to 0/1, Enum reads the
    /// selected index. String and Command features have no arithmetic
    /// reading.
    pub fn read_as<T: Arithmetic>(&mut self) -> CamResult<T> {
        let handle = self.handle;
        let name = self.name.clone();
        match self.ty {
            FeatureType::Int => {
                let sig = format!("AT_GetInt({handle}, '{name}', &value)");
                let v = self.dispatch(sig, |d| d.get_int(handle, &name))?;
                self.cached = Some(FeatureValue::Int(v));
                Ok(T::from_i64(v))
            }
            FeatureType::Float => {
                let sig = format!("AT_GetFloat({handle}, '{name}', &value)");
                let v = self.dispatch(sig, |d| d.get_float(handle, &name))?;
                self.cached = Some(FeatureValue::Float(v));
                Ok(T::from_f64(v))
            }
            FeatureType::Bool => {
                let sig = format!("AT_GetBool({handle}, '{name}', &value)");
                let v = self.dispatch(sig, |d| d.get_bool(handle, &name))?;
                self.cached = Some(FeatureValue::Bool(v));
                Ok(T::from_i64(i64::from(v)))
            }
            FeatureType::Enum => {
                let sig = format!("AT_GetEnumIndex({handle}, '{name}', &index)");
                let v = self.dispatch(sig, |d| d.get_enum_index(handle, &name))?;
                self.cached = Some(FeatureValue::EnumIndex(v));
                Ok(T::from_i64(i64::from(v)))
            }
            FeatureType::String | FeatureType::Command => Err(self.mismatch(T::NAME)),
        }
    }

    /// Write arithmetic `T` to the feature, dispatching on the declared
    /// type. The cache is updated only after the driver call succeeds.
    pub fn write_as<T: Arithmetic>(&mut self, value: T) -> CamResult<()> {
        let handle = self.handle;
        let name = self.name.clone();
        match self.ty {
            FeatureType::Int => {
                let v = value.to_i64();
                let sig = format!("AT_SetInt({handle}, '{name}', {v})");
                self.dispatch(sig, |d| d.set_int(handle, &name, v))?;
                self.cached = Some(FeatureValue::Int(v));
            }
            FeatureType::Float => {
                let v = value.to_f64();
                let sig = format!("AT_SetFloat({handle}, '{name}', {v})");
                self.dispatch(sig, |d| d.set_float(handle, &name, v))?;
                self.cached = Some(FeatureValue::Float(v));
            }
            FeatureType::Bool => {
                let v = value.to_i64() != 0;
                let sig = format!("AT_SetBool({handle}, '{name}', {})", i32::from(v));
                self.dispatch(sig, |d| d.set_bool(handle, &name, v))?;
                self.cached = Some(FeatureValue::Bool(v));
            }
            FeatureType::Enum => {
                let v = value.to_i64() as i32;
                let sig = format!("AT_SetEnumIndex({handle}, '{name}', {v})");
                self.dispatch(sig, |d| d.set_enum_index(handle, &name, v))?;
                self.cached = Some(FeatureValue::EnumIndex(v));
            }
            FeatureType::String | FeatureType::Command => {
                return Err(self.mismatch(T::NAME));
            }
        }
        Ok(())
    }

    /// Bounds of the feature as `(min, max)`.
    ///
    /// Bool reports `(false, true)` as `(0, 1)`; String and Enum have no
    /// numeric range.
    pub fn read_range<T: Arithmetic>(&mut self) -> CamResult<(T, T)> {
        let handle = self.handle;
        let name = self.name.clone();
        match self.ty {
            FeatureType::Int => {
                let sig = format!("AT_GetIntMin({handle}, '{name}', &min)");
                let min = self.dispatch(sig, |d| d.get_int_min(handle, &name))?;
                let sig = format!("AT_GetIntMax({handle}, '{name}', &max)");
                let max = self.dispatch(sig, |d| d.get_int_max(handle, &name))?;
                Ok((T::from_i64(min), T::from_i64(max)))
            }
            FeatureType::Float => {
                let sig = format!("AT_GetFloatMin({handle}, '{name}', &min)");
                let min = self.dispatch(sig, |d| d.get_float_min(handle, &name))?;
                let sig = format!("AT_GetFloatMax({handle}, '{name}', &max)");
                let max = self.dispatch(sig, |d| d.get_float_max(handle, &name))?;
                Ok((T::from_f64(min), T::from_f64(max)))
            }
            FeatureType::Bool => Ok((T::from_i64(0), T::from_i64(1))),
            FeatureType::String | FeatureType::Enum | FeatureType::Command => {
                Err(self.mismatch(T::NAME))
            }
        }
    }

    /// Read a string feature in two phases: query the maximum length, then
    /// fetch into a buffer of exactly that length.
    pub fn read_string(&mut self) -> CamResult<String> {
        if self.ty != FeatureType::String {
            return Err(self.mismatch("String"));
        }
        let handle = self.handle;
        let name = self.name.clone();
        let sig = format!("AT_GetStringMaxLength({handle}, '{name}', &len)");
        let max_len = self.dispatch(sig, |d| d.get_string_max_length(handle, &name))?;
        if max_len == 0 {
            let err = AndorError::EmptyLength {
                feature: name.clone(),
            };
            self.log.error(&err.to_string());
            return Err(err);
        }
        let sig = format!("AT_GetString({handle}, '{name}', &value, {max_len})");
        let value = self.dispatch(sig, |d| d.get_string(handle, &name, max_len))?;
        self.cached = Some(FeatureValue::Str(value.clone()));
        Ok(value)
    }

    /// Read a string feature into a named snapshot.
    pub fn read_string_feature(&mut self) -> CamResult<StringFeature> {
        let value = self.read_string()?;
        Ok(StringFeature {
            name: self.name.clone(),
            value,
        })
    }

    /// Write a string feature.
    pub fn write_string(&mut self, value: &str) -> CamResult<()> {
        if self.ty != FeatureType::String {
            return Err(self.mismatch("String"));
        }
        let handle = self.handle;
        let name = self.name.clone();
        let sig = format!("AT_SetString({handle}, '{name}', '{value}')");
        self.dispatch(sig, |d| d.set_string(handle, &name, value))?;
        self.cached = Some(FeatureValue::Str(value.to_owned()));
        Ok(())
    }

    /// Read an enumerated feature's current selection as index plus value
    /// string.
    pub fn read_enum(&mut self) -> CamResult<EnumFeature> {
        if self.ty != FeatureType::Enum {
            return Err(self.mismatch("Enum"));
        }
        let handle = self.handle;
        let name = self.name.clone();
        let sig = format!("AT_GetEnumIndex({handle}, '{name}', &index)");
        let index = self.dispatch(sig, |d| d.get_enum_index(handle, &name))?;
        let sig = format!("AT_GetEnumStringByIndex({handle}, '{name}', {index}, &value)");
        let value = self.dispatch(sig, |d| d.get_enum_string_by_index(handle, &name, index))?;
        self.cached = Some(FeatureValue::EnumIndex(index));
        Ok(EnumFeature {
            name,
            value,
            index,
        })
    }

    /// Select an enumerated value by string. Name-to-index resolution is
    /// the driver's job, not done locally.
    pub fn write_enum_by_string(&mut self, value: &str) -> CamResult<()> {
        if self.ty != FeatureType::Enum {
            return Err(self.mismatch("Enum"));
        }
        let handle = self.handle;
        let name = self.name.clone();
        let sig = format!("AT_SetEnumString({handle}, '{name}', '{value}')");
        self.dispatch(sig, |d| d.set_enum_string(handle, &name, value))?;
        self.cached = Some(FeatureValue::Str(value.to_owned()));
        Ok(())
    }

    /// Full enumeration introspection: value list, implemented and
    /// available index sets, and the current selection.
    ///
    /// Availability is only queried for implemented indices.
    pub fn read_enum_info(&mut self) -> CamResult<EnumInfo> {
        if self.ty != FeatureType::Enum {
            return Err(self.mismatch("Enum"));
        }
        let handle = self.handle;
        let name = self.name.clone();

        let sig = format!("AT_GetEnumCount({handle}, '{name}', &count)");
        let count = self.dispatch(sig, |d| d.get_enum_count(handle, &name))?;

        let mut values = Vec::with_capacity(count.max(0) as usize);
        let mut implemented = Vec::new();
        let mut available = Vec::new();
        for index in 0..count {
            let sig = format!("AT_GetEnumStringByIndex({handle}, '{name}', {index}, &value)");
            let value = self.dispatch(sig, |d| d.get_enum_string_by_index(handle, &name, index))?;
            values.push(value);

            let sig = format!("AT_IsEnumIndexImplemented({handle}, '{name}', {index}, &flag)");
            let is_impl = self.dispatch(sig, |d| d.is_enum_index_implemented(handle, &name, index))?;
            if is_impl {
                implemented.push(index);
                let sig = format!("AT_IsEnumIndexAvailable({handle}, '{name}', {index}, &flag)");
                if self.dispatch(sig, |d| d.is_enum_index_available(handle, &name, index))? {
                    available.push(index);
                }
            }
        }

        let sig = format!("AT_GetEnumIndex({handle}, '{name}', &index)");
        let current_index = self.dispatch(sig, |d| d.get_enum_index(handle, &name))?;
        self.cached = Some(FeatureValue::EnumIndex(current_index));

        Ok(EnumInfo {
            name,
            values,
            implemented,
            available,
            current_index,
        })
    }

    /// Query the four capability flags. Works for any declared type and
    /// never fails on an unimplemented feature; that outcome is itself the
    /// answer.
    pub fn read_feature_info(&mut self) -> CamResult<FeatureInfo> {
        let handle = self.handle;
        let name = self.name.clone();
        let sig = format!("AT_IsImplemented({handle}, '{name}', &flag)");
        let is_implemented = self.dispatch(sig, |d| d.is_implemented(handle, &name))?;
        let sig = format!("AT_IsReadable({handle}, '{name}', &flag)");
        let is_readable = self.dispatch(sig, |d| d.is_readable(handle, &name))?;
        let sig = format!("AT_IsReadOnly({handle}, '{name}', &flag)");
        let is_read_only = self.dispatch(sig, |d| d.is_read_only(handle, &name))?;
        let sig = format!("AT_IsWritable({handle}, '{name}', &flag)");
        let is_writable = self.dispatch(sig, |d| d.is_writable(handle, &name))?;
        Ok(FeatureInfo {
            is_implemented,
            is_readable,
            is_read_only,
            is_writable,
        })
    }

    /// Execute a command feature.
    pub fn issue_command(&mut self) -> CamResult<()> {
        if self.ty != FeatureType::Command {
            return Err(self.mismatch("Command"));
        }
        let handle = self.handle;
        let name = self.name.clone();
        let sig = format!("AT_Command({handle}, '{name}')");
        self.dispatch(sig, |d| d.issue_command(handle, &name))
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use crate::registry::FeatureRegistry;

    fn accessor_for(name: &str) -> (Arc<MockDriver>, FeatureAccessor) {
        let driver = Arc::new(MockDriver::new());
        let handle = driver.open(0).unwrap();
        let reg = FeatureRegistry::new();
        let ty = reg.lookup(name).unwrap();
        let mut acc = FeatureAccessor::new(driver.clone(), CameraLog::new());
        acc.bind_to(handle, name, ty).unwrap();
        (driver, acc)
    }

    #[test]
    fn int_round_trip_through_narrower_types() {
        let (_d, mut acc) = accessor_for("AOIWidth");
        acc.write_as(640_i32).unwrap();
        assert_eq!(acc.read_as::<i64>().unwrap(), 640);
        assert_eq!(acc.read_as::<u32>().unwrap(), 640);
        assert_eq!(acc.cached_value(), Some(&FeatureValue::Int(640)));
    }

    #[test]
    fn float_round_trip_and_range() {
        let (_d, mut acc) = accessor_for("ExposureTime");
        acc.write_as(0.05_f64).unwrap();
        assert!((acc.read_as::<f64>().unwrap() - 0.05).abs() < 1e-12);
        let (min, max) = acc.read_range::<f64>().unwrap();
        assert!(min < max);
    }

    #[test]
    fn bool_reads_as_zero_or_one() {
        let (_d, mut acc) = accessor_for("SensorCooling");
        acc.write_as(1_i32).unwrap();
        assert_eq!(acc.read_as::<i64>().unwrap(), 1);
        let (lo, hi) = acc.read_range::<i32>().unwrap();
        assert_eq!((lo, hi), (0, 1));
    }

    #[test]
    fn arithmetic_read_of_string_is_type_mismatch() {
        let (_d, mut acc) = accessor_for("CameraModel");
        let err = acc.read_as::<i64>().unwrap_err();
        assert!(matches!(err, AndorError::TypeMismatch { .. }));
        let err = acc.write_as(3_i64).unwrap_err();
        assert!(matches!(err, AndorError::TypeMismatch { .. }));
    }

    #[test]
    fn string_read_is_two_phase() {
        let (_d, mut acc) = accessor_for("CameraModel");
        let snap = acc.read_string_feature().unwrap();
        assert_eq!(snap.name, "CameraModel");
        assert!(!snap.value.is_empty());
        assert!(acc.last_call().starts_with("AT_GetString("));
    }

    #[test]
    fn zero_reported_string_length_is_an_error() {
        let (driver, mut acc) = accessor_for("CameraModel");
        driver.report_zero_string_length("CameraModel");
        let err = acc.read_string().unwrap_err();
        assert!(matches!(err, AndorError::EmptyLength { ref feature } if feature == "CameraModel"));
    }

    #[test]
    fn enum_select_by_string_moves_current_index() {
        let (_d, mut acc) = accessor_for("TriggerMode");
        acc.write_enum_by_string("Software").unwrap();
        let info = acc.read_enum_info().unwrap();
        let selected = info.values[info.current_index as usize].clone();
        assert_eq!(selected, "Software");
        assert!(info.implemented.contains(&info.current_index));
    }

    #[test]
    fn enum_info_lists_values_in_index_order() {
        let (_d, mut acc) = accessor_for("TriggerMode");
        let info = acc.read_enum_info().unwrap();
        assert_eq!(info.values.len() as i32, info.implemented.len() as i32);
        assert!(info.available.iter().all(|i| info.implemented.contains(i)));
    }

    #[test]
    fn feature_info_reports_unimplemented_without_error() {
        let (_d, mut acc) = accessor_for("GateMode");
        let info = acc.read_feature_info().unwrap();
        assert!(!info.is_implemented);
        assert!(!info.is_readable);
        assert!(!info.is_writable);
    }

    #[test]
    fn failed_driver_call_carries_the_formatted_signature() {
        let (_d, mut acc) = accessor_for("SensorTemperature");
        // Read-only in the mock, writes are rejected.
        let err = acc.write_as(0.0_f64).unwrap_err();
        match err {
            AndorError::Sdk { call, .. } => {
                assert!(call.starts_with("AT_SetFloat("));
                assert!(call.contains("SensorTemperature"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn enums_and_strings_have_no_numeric_range() {
        let (_d, mut acc) = accessor_for("TriggerMode");
        assert!(matches!(
            acc.read_range::<i32>(),
            Err(AndorError::TypeMismatch { .. })
        ));
        let (_d, mut acc) = accessor_for("CameraModel");
        assert!(matches!(
            acc.read_range::<f64>(),
            Err(AndorError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn blank_name_is_rejected_on_bind() {
        let driver = Arc::new(MockDriver::new());
        let mut acc = FeatureAccessor::new(driver, CameraLog::new());
        let err = acc
            .bind_to(DeviceHandle(2), "   ", FeatureType::Int)
            .unwrap_err();
        assert!(matches!(err, AndorError::NotImplemented { .. }));
    }
}
