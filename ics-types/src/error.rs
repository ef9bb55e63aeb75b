//! Error types and MAPI status codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding wire structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Input ended before a complete structure was read.
    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        /// Name of the structure being decoded.
        what: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// A fixed-size structure had the wrong length.
    #[error("invalid {what} length: {len}")]
    InvalidLength {
        /// Name of the structure being decoded.
        what: &'static str,
        /// Length that was supplied.
        len: usize,
    },

    /// Property type code not known to this implementation.
    #[error("unknown property type: 0x{0:04x}")]
    UnknownPropType(u16),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// MAPI status codes returned in ROP responses.
///
/// Only the codes this engine produces are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    /// MAPI_E_SUCCESS
    Success = 0x0000_0000,
    /// ecNullObject: the handle does not refer to an object
    NullObject = 0x0000_04B9,
    /// SYNC_W_CLIENT_CHANGE_NEWER / ignore: the import was not applied
    SyncIgnore = 0x0004_0821,
    /// MAPI_E_CALL_FAILED: generic backend failure
    CallFailed = 0x8000_4005,
    /// MAPI_E_NO_ACCESS
    NoAccess = 0x8007_0005,
    /// MAPI_E_NOT_ENOUGH_MEMORY
    NotEnoughMemory = 0x8007_000E,
    /// MAPI_E_INVALID_PARAMETER
    InvalidParameter = 0x8007_0057,
    /// MAPI_E_NO_SUPPORT
    NoSupport = 0x8004_0102,
    /// MAPI_E_UNKNOWN_FLAGS
    UnknownFlags = 0x8004_0106,
    /// MAPI_E_INVALID_OBJECT
    InvalidObject = 0x8004_0108,
    /// MAPI_E_NOT_FOUND
    NotFound = 0x8004_010F,
    /// MAPI_E_CORRUPT_DATA
    CorruptData = 0x8004_011B,
    /// MAPI_E_NOT_INITIALIZED
    NotInitialized = 0x8004_0605,
    /// SYNC_E_CONFLICT
    SyncConflict = 0x8004_0802,
}

impl ErrorCode {
    /// Numeric value as carried in a ROP response.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Whether this code reports success (including warnings).
    pub fn is_success(self) -> bool {
        self.as_u32() & 0x8000_0000 == 0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:08X})", self, self.as_u32())
    }
}
