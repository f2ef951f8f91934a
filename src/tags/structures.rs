use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{GatewayError, Result};

/// Logical name of an owning controller. Each name maps to exactly one
/// driver instance registered at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlcName {
    Compactlogix,
    Slc500,
}

impl PlcName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlcName::Compactlogix => "compactlogix",
            PlcName::Slc500 => "slc500",
        }
    }
}

impl fmt::Display for PlcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse freshness/validity label attached to each tag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Quality {
    Good,
    /// The owning PLC is faulted; the value is the last one read.
    Stale,
    /// The last read of this address failed.
    Bad,
    /// The tag has never been read.
    #[default]
    Uninitialized,
}

/// Declared datatype of a tag. Governs the storage shape of `TagValue`
/// and how raw driver output is coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagDatatype {
    Bool,
    Int,
    Real,
    Decimal,
    String,
}

/// A stored tag value. The variant always matches the owning record's
/// declared datatype; the store enforces this at every mutation.
///
/// `Decimal` carries an exact fixed-point number whose scale (including
/// trailing zeros) survives storage and serialization. It is never demoted
/// to binary floating point.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Decimal(Decimal),
    Text(String),
}

impl TagValue {
    pub fn datatype(&self) -> TagDatatype {
        match self {
            TagValue::Bool(_) => TagDatatype::Bool,
            TagValue::Int(_) => TagDatatype::Int,
            TagValue::Real(_) => TagDatatype::Real,
            TagValue::Decimal(_) => TagDatatype::Decimal,
            TagValue::Text(_) => TagDatatype::String,
        }
    }

    pub fn matches(&self, datatype: TagDatatype) -> bool {
        self.datatype() == datatype
    }

    /// Default initial value for a datatype, used when a tag is created
    /// without one.
    pub fn default_for(datatype: TagDatatype) -> TagValue {
        match datatype {
            TagDatatype::Bool => TagValue::Bool(false),
            TagDatatype::Int => TagValue::Int(0),
            TagDatatype::Real => TagValue::Real(0.0),
            TagDatatype::Decimal => TagValue::Decimal(Decimal::ZERO),
            TagDatatype::String => TagValue::Text(String::new()),
        }
    }

    /// Coerce a raw driver value into the declared datatype.
    ///
    /// Decimal tags apply the record's linear scaling in exact decimal
    /// arithmetic and are quantized to the declared number of decimals
    /// (round half up); the declared scale is never narrowed.
    pub fn coerce(raw: &TagValue, record: &TagRecord) -> Result<TagValue> {
        let mismatch = || {
            GatewayError::TypeMismatch(format!(
                "cannot coerce {:?} into {:?} for tag {}",
                raw.datatype(),
                record.datatype,
                record.id
            ))
        };
        match record.datatype {
            TagDatatype::Bool => match raw {
                TagValue::Bool(b) => Ok(TagValue::Bool(*b)),
                TagValue::Int(i) => Ok(TagValue::Bool(*i != 0)),
                _ => Err(mismatch()),
            },
            TagDatatype::Int => match raw {
                TagValue::Int(i) => Ok(TagValue::Int(*i)),
                TagValue::Bool(b) => Ok(TagValue::Int(i64::from(*b))),
                TagValue::Real(f) if f.fract() == 0.0 && f.is_finite() => {
                    Ok(TagValue::Int(*f as i64))
                }
                _ => Err(mismatch()),
            },
            TagDatatype::Real => match raw {
                TagValue::Real(f) => Ok(TagValue::Real(*f)),
                TagValue::Int(i) => Ok(TagValue::Real(*i as f64)),
                _ => Err(mismatch()),
            },
            TagDatatype::Decimal => {
                let d = match raw {
                    TagValue::Decimal(d) => *d,
                    TagValue::Int(i) => Decimal::from(*i),
                    TagValue::Real(f) => Decimal::from_f64(*f).ok_or_else(mismatch)?,
                    TagValue::Text(s) => Decimal::from_str(s).map_err(|_| mismatch())?,
                    TagValue::Bool(_) => return Err(mismatch()),
                };
                Ok(TagValue::Decimal(record.apply_scaling(d)))
            }
            TagDatatype::String => match raw {
                TagValue::Text(s) => Ok(TagValue::Text(s.clone())),
                _ => Err(mismatch()),
            },
        }
    }
}

/// One addressable datum within a PLC, plus its latest value and
/// serialization policy.
#[derive(Debug, Clone, Serialize)]
pub struct TagRecord {
    /// Opaque identifier, unique within the store. Immutable once set.
    pub id: String,
    /// Display name, defaults to the id.
    pub name: String,
    pub plc: PlcName,
    /// Driver-specific address (e.g. `Main.Temp`, `N7:0`).
    pub address: String,
    pub datatype: TagDatatype,
    pub value: TagValue,
    pub quality: Quality,
    /// Nanosecond timestamp of the last driver read that produced the
    /// current value; 0 means never read.
    pub last_update_ns: u64,
    pub writable: bool,
    /// Disabled tags are skipped by the poller but stay visible over REST.
    pub enabled: bool,
    pub description: Option<String>,
    /// Linear scaling applied when raw integer registers feed Decimal tags.
    pub scale_mul: f64,
    pub scale_add: f64,
    /// Declared scale for Decimal tags; coerced values are quantized to
    /// this many places and never narrowed below it.
    pub decimals: Option<u32>,
}

impl TagRecord {
    pub fn new(
        id: impl Into<String>,
        plc: PlcName,
        address: impl Into<String>,
        datatype: TagDatatype,
    ) -> Self {
        let id = id.into();
        TagRecord {
            name: id.clone(),
            id,
            plc,
            address: address.into(),
            datatype,
            value: TagValue::default_for(datatype),
            quality: Quality::Uninitialized,
            last_update_ns: 0,
            writable: false,
            enabled: true,
            description: None,
            scale_mul: 1.0,
            scale_add: 0.0,
            decimals: None,
        }
    }

    /// Apply this record's linear scaling and declared scale to an exact
    /// decimal. Identity scaling (1.0 / 0.0) skips the arithmetic so the
    /// incoming scale is preserved untouched.
    pub fn apply_scaling(&self, value: Decimal) -> Decimal {
        let mut out = value;
        if self.scale_mul != 1.0 || self.scale_add != 0.0 {
            let mul = Decimal::from_f64(self.scale_mul).unwrap_or(Decimal::ONE);
            let add = Decimal::from_f64(self.scale_add).unwrap_or(Decimal::ZERO);
            out = out * mul + add;
        }
        if let Some(dp) = self.decimals {
            // round_dp only narrows; rescale pads the trailing zeros so the
            // declared scale always shows.
            out = out.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
            out.rescale(dp);
        }
        out
    }
}

/// Current wall-clock time as nanoseconds since the epoch, for
/// `last_update_ns` stamping.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
