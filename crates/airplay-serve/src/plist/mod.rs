//! Property-list values as AirPlay uses them: binary plists in, XML plists
//! out. Just the subset of the format Apple clients actually send.

pub mod binary;
pub mod xml;

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    Boolean(bool),
    Integer(i64),
    Real(f64),
    String(String),
    Data(Vec<u8>),
    Array(Vec<PlistValue>),
    // BTreeMap keeps rendered dictionaries in sorted key order.
    Dictionary(BTreeMap<String, PlistValue>),
}

impl PlistValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PlistValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PlistValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PlistValue::Real(r) => Some(*r),
            PlistValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PlistValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PlistValue]> {
        match self {
            PlistValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&BTreeMap<String, PlistValue>> {
        match self {
            PlistValue::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` for non-dictionaries and missing keys.
    pub fn get(&self, key: &str) -> Option<&PlistValue> {
        self.as_dictionary()?.get(key)
    }
}

impl From<BTreeMap<String, PlistValue>> for PlistValue {
    fn from(dict: BTreeMap<String, PlistValue>) -> Self {
        PlistValue::Dictionary(dict)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlistError {
    #[error("not a binary plist (bad magic)")]
    BadMagic,

    #[error("truncated plist: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("invalid trailer")]
    InvalidTrailer,

    #[error("invalid object marker 0x{0:02x}")]
    InvalidMarker(u8),

    #[error("invalid object reference {0}")]
    InvalidReference(u64),

    #[error("string is not valid unicode")]
    InvalidString,

    #[error("circular object reference")]
    CircularReference,
}
