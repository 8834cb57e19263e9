//! Sample - the unit of transfer on a stream
//!
//! A stream carries exactly one channel format for its whole lifetime. The
//! closed set of formats is modelled as a tagged union (`SampleData`) and the
//! Rust element types are bound to it through the sealed `SampleValue` trait.

use serde::{Deserialize, Serialize};

use crate::{Result, StreamError};

/// Channel format (sample encoding) of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelFormat {
    Float32,
    Double64,
    String,
    Int32,
    Int16,
    Int8,
    Int64,
}

impl ChannelFormat {
    /// Whether values of this format are numbers
    pub fn is_numeric(self) -> bool {
        !matches!(self, ChannelFormat::String)
    }

    /// Format name used in predicates and XML export
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelFormat::Float32 => "float32",
            ChannelFormat::Double64 => "double64",
            ChannelFormat::String => "string",
            ChannelFormat::Int32 => "int32",
            ChannelFormat::Int16 => "int16",
            ChannelFormat::Int8 => "int8",
            ChannelFormat::Int64 => "int64",
        }
    }

    /// Parse a format name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "float32" => Some(ChannelFormat::Float32),
            "double64" => Some(ChannelFormat::Double64),
            "string" => Some(ChannelFormat::String),
            "int32" => Some(ChannelFormat::Int32),
            "int16" => Some(ChannelFormat::Int16),
            "int8" => Some(ChannelFormat::Int8),
            "int64" => Some(ChannelFormat::Int64),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel values of one sample, in the stream's native encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleData {
    Float32(Vec<f32>),
    Double64(Vec<f64>),
    String(Vec<String>),
    Int32(Vec<i32>),
    Int16(Vec<i16>),
    Int8(Vec<i8>),
    Int64(Vec<i64>),
}

impl SampleData {
    /// Encoding of the contained values
    pub fn format(&self) -> ChannelFormat {
        match self {
            SampleData::Float32(_) => ChannelFormat::Float32,
            SampleData::Double64(_) => ChannelFormat::Double64,
            SampleData::String(_) => ChannelFormat::String,
            SampleData::Int32(_) => ChannelFormat::Int32,
            SampleData::Int16(_) => ChannelFormat::Int16,
            SampleData::Int8(_) => ChannelFormat::Int8,
            SampleData::Int64(_) => ChannelFormat::Int64,
        }
    }

    /// Number of channel values
    pub fn len(&self) -> usize {
        match self {
            SampleData::Float32(v) => v.len(),
            SampleData::Double64(v) => v.len(),
            SampleData::String(v) => v.len(),
            SampleData::Int32(v) => v.len(),
            SampleData::Int16(v) => v.len(),
            SampleData::Int8(v) => v.len(),
            SampleData::Int64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode caller values into `format`, converting between numeric types.
    ///
    /// # Errors
    /// `Argument` when mixing string and numeric encodings.
    pub fn encode<T: SampleValue>(values: &[T], format: ChannelFormat) -> Result<Self> {
        if T::FORMAT == format {
            return Ok(T::wrap(values.to_vec()));
        }
        if !(T::FORMAT.is_numeric() && format.is_numeric()) {
            return Err(format_mismatch(T::FORMAT, format));
        }
        let numbers: Vec<f64> = values.iter().filter_map(SampleValue::to_f64).collect();
        Ok(Self::from_f64s(&numbers, format))
    }

    /// Decode into a caller buffer of the same length.
    ///
    /// # Errors
    /// `Argument` on length mismatch or string/numeric mixing.
    pub fn decode_into<T: SampleValue>(&self, out: &mut [T]) -> Result<()> {
        if out.len() != self.len() {
            return Err(StreamError::argument(format!(
                "buffer holds {} values but the sample has {} channels",
                out.len(),
                self.len()
            )));
        }
        if let Some(native) = T::unwrap_ref(self) {
            out.clone_from_slice(native);
            return Ok(());
        }
        let numbers = self
            .to_f64s()
            .ok_or_else(|| format_mismatch(self.format(), T::FORMAT))?;
        for (slot, value) in out.iter_mut().zip(numbers) {
            *slot = T::from_f64(value).ok_or_else(|| format_mismatch(self.format(), T::FORMAT))?;
        }
        Ok(())
    }

    /// Decode into a freshly allocated vector
    pub fn decode<T: SampleValue + Default>(&self) -> Result<Vec<T>> {
        let mut out = vec![T::default(); self.len()];
        self.decode_into(&mut out)?;
        Ok(out)
    }

    fn to_f64s(&self) -> Option<Vec<f64>> {
        match self {
            SampleData::Float32(v) => Some(v.iter().map(|x| f64::from(*x)).collect()),
            SampleData::Double64(v) => Some(v.clone()),
            SampleData::String(_) => None,
            SampleData::Int32(v) => Some(v.iter().map(|x| f64::from(*x)).collect()),
            SampleData::Int16(v) => Some(v.iter().map(|x| f64::from(*x)).collect()),
            SampleData::Int8(v) => Some(v.iter().map(|x| f64::from(*x)).collect()),
            SampleData::Int64(v) => Some(v.iter().map(|x| *x as f64).collect()),
        }
    }

    fn from_f64s(values: &[f64], format: ChannelFormat) -> Self {
        match format {
            ChannelFormat::Float32 => SampleData::Float32(values.iter().map(|v| *v as f32).collect()),
            ChannelFormat::Double64 => SampleData::Double64(values.to_vec()),
            ChannelFormat::String => {
                SampleData::String(values.iter().map(|v| v.to_string()).collect())
            }
            ChannelFormat::Int32 => SampleData::Int32(values.iter().map(|v| v.round() as i32).collect()),
            ChannelFormat::Int16 => SampleData::Int16(values.iter().map(|v| v.round() as i16).collect()),
            ChannelFormat::Int8 => SampleData::Int8(values.iter().map(|v| v.round() as i8).collect()),
            ChannelFormat::Int64 => SampleData::Int64(values.iter().map(|v| v.round() as i64).collect()),
        }
    }
}

fn format_mismatch(from: ChannelFormat, to: ChannelFormat) -> StreamError {
    StreamError::argument(format!("cannot convert {from} values to {to}"))
}

/// One time-stamped sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Capture time in the producer's clock domain (seconds)
    pub timestamp: f64,

    /// Channel values
    pub data: SampleData,
}

mod private {
    pub trait Sealed {}
}

/// Element types that can be pushed to / pulled from a stream
pub trait SampleValue: Clone + Send + Sync + 'static + private::Sealed {
    /// Native encoding of this element type
    const FORMAT: ChannelFormat;

    fn wrap(values: Vec<Self>) -> SampleData;

    fn unwrap_ref(data: &SampleData) -> Option<&[Self]>;

    fn to_f64(&self) -> Option<f64>;

    fn from_f64(value: f64) -> Option<Self>;
}

macro_rules! impl_numeric_sample_value {
    ($ty:ty, $variant:ident, |$v:ident| $from:expr) => {
        impl private::Sealed for $ty {}

        impl SampleValue for $ty {
            const FORMAT: ChannelFormat = ChannelFormat::$variant;

            #[inline]
            fn wrap(values: Vec<Self>) -> SampleData {
                SampleData::$variant(values)
            }

            #[inline]
            fn unwrap_ref(data: &SampleData) -> Option<&[Self]> {
                match data {
                    SampleData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            #[inline]
            fn to_f64(&self) -> Option<f64> {
                Some(*self as f64)
            }

            #[inline]
            fn from_f64($v: f64) -> Option<Self> {
                Some($from)
            }
        }
    };
}

// float -> integer conversions round to nearest, then saturate
impl_numeric_sample_value!(f32, Float32, |v| v as f32);
impl_numeric_sample_value!(f64, Double64, |v| v);
impl_numeric_sample_value!(i32, Int32, |v| v.round() as i32);
impl_numeric_sample_value!(i16, Int16, |v| v.round() as i16);
impl_numeric_sample_value!(i8, Int8, |v| v.round() as i8);
impl_numeric_sample_value!(i64, Int64, |v| v.round() as i64);

impl private::Sealed for String {}

impl SampleValue for String {
    const FORMAT: ChannelFormat = ChannelFormat::String;

    fn wrap(values: Vec<Self>) -> SampleData {
        SampleData::String(values)
    }

    fn unwrap_ref(data: &SampleData) -> Option<&[Self]> {
        match data {
            SampleData::String(v) => Some(v),
            _ => None,
        }
    }

    fn to_f64(&self) -> Option<f64> {
        None
    }

    fn from_f64(_value: f64) -> Option<Self> {
        None
    }
}
