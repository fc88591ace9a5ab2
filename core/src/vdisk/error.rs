//! Virtual disk error types
//!
//! Error enum for the translation engine. Follows the same pattern as
//! `Fat32Error` and `GptError`: plain `Copy` variants, no payload.

use core::fmt;

/// Errors that can occur while building or serving a virtual disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdiskError {
    /// Extent map failed validation; serve the image from memory instead
    UnsupportedLayout,
    /// Underlying storage read failed
    BackingReadFailure,
    /// Table or scratch buffer growth failed
    OutOfMemory,
    /// Parameter block GUID or checksum did not verify
    ChecksumMismatch,
    /// Buffer length is not a whole number of blocks, or too small
    InvalidBuffer,
    /// Read position beyond the end of the media
    ReadOverflow,
    /// The virtual media is read-only
    WriteProtected,
    /// Override payload longer than the record can hold
    InvalidOverride,
    /// Chain blob header or table offsets are inconsistent
    InvalidChain,
    /// Argument outside the accepted range
    InvalidParameter,
}

impl VdiskError {
    /// Get a human-readable description of the error
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedLayout => "Unsupported file system layout",
            Self::BackingReadFailure => "Backing storage read failed",
            Self::OutOfMemory => "Out of memory",
            Self::ChecksumMismatch => "Parameter block checksum mismatch",
            Self::InvalidBuffer => "Invalid buffer size",
            Self::ReadOverflow => "Read beyond end of media",
            Self::WriteProtected => "Media is write protected",
            Self::InvalidOverride => "Override record too large",
            Self::InvalidChain => "Invalid chain data",
            Self::InvalidParameter => "Invalid parameter",
        }
    }
}

impl fmt::Display for VdiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<alloc::collections::TryReserveError> for VdiskError {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}
