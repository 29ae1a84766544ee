//! Error types raised by the master library

use canmaster_common::DataType;
use snafu::Snafu;

/// Errors concerning the shape of the object dictionary and PDO mappings
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DictionaryError {
    /// The named or addressed entry does not exist
    #[snafu(display("Unknown dictionary entry: {entry}"))]
    UnknownEntry {
        /// Name or "index sub subindex" of the missing entry
        entry: String,
    },
    /// A value's type does not match the entry's declared type
    #[snafu(display("Wrong type for entry {entry}: expected {expected}, got {got}"))]
    WrongType {
        /// The entry concerned
        entry: String,
        /// The entry's declared type
        expected: DataType,
        /// The offending type
        got: DataType,
    },
    /// A PDO mapping does not fit into the 8-byte frame
    #[snafu(display("Mapping for {entry} does not fit: offset ({offset}) + size ({size}) > 8"))]
    MappingSize {
        /// The mapped entry
        entry: String,
        /// Mapping offset into the frame
        offset: u8,
        /// Byte size of the entry's type
        size: usize,
    },
    /// Two mappings of one transmit PDO overlap in the frame
    #[snafu(display("Mapping for {entry} overlaps another mapping"))]
    MappingOverlap {
        /// The second of the overlapping entries
        entry: String,
    },
    /// No operation registered under this name
    #[snafu(display("Unknown operation: {name}"))]
    UnknownOperation {
        /// The requested operation name
        name: String,
    },
    /// No constant registered under this name
    #[snafu(display("Unknown constant: {name}"))]
    UnknownConstant {
        /// The requested constant name
        name: String,
    },
}

/// Errors raised by the SDO engine
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SdoError {
    /// The slave did not answer within the configured per-segment timeout
    #[snafu(display("SDO response timeout: {message}"))]
    ResponseTimeout {
        /// Details including the last underlying error
        message: String,
    },
    /// The slave aborted the transfer
    #[snafu(display("SDO transfer aborted with code {abort_code:#010X}"))]
    Abort {
        /// CiA 301 abort code
        abort_code: u32,
    },
    /// The slave violated the SDO protocol
    #[snafu(display("SDO protocol error: {message}"))]
    Protocol {
        /// Details of the violation
        message: String,
    },
    /// Any other failure, e.g. the driver refusing a send
    #[snafu(display("SDO error: {message}"))]
    Unknown {
        /// Details
        message: String,
    },
}

impl SdoError {
    /// Returns true for the timeout kind, which is the only retryable one
    pub fn is_timeout(&self) -> bool {
        matches!(self, SdoError::ResponseTimeout { .. })
    }
}

/// Top-level error type of the master library
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CanOpenError {
    /// A dictionary-shape error
    #[snafu(transparent)]
    Dictionary {
        /// The underlying error
        source: DictionaryError,
    },
    /// An SDO transfer failure
    #[snafu(transparent)]
    Sdo {
        /// The underlying error
        source: SdoError,
    },
    /// An invariant violation, e.g. adding a duplicate entry
    #[snafu(display("{message}"))]
    Canopen {
        /// What went wrong
        message: String,
    },
}
