//! Error results that can occur working with disk images
//!
//! Every error carries one of the fixed numeric status codes that the
//! hosting server surfaces to its own protocol unchanged.
#![warn(missing_docs)]
#![warn(unsafe_code)]
use std::{
    fmt::{Debug, Display, Formatter, Result},
    io,
};

/// An error that can occur when processing a disk image.
#[derive(PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.kind)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create a new Error with a given ErrorKind variant
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind }
    }

    /// The numeric status code for this error.
    ///
    /// These codes are stable; the hosting server forwards them
    /// bit-exact to its callers.
    pub fn status(&self) -> u8 {
        self.kind.status()
    }

    /// The kind of error that occurred.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::new(ErrorKind::Internal(e.to_string()))
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(e: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        Error::new(ErrorKind::Internal(e.to_string()))
    }
}

impl<'a> nom::error::ParseError<&'a [u8]> for Error {
    fn from_error_kind(_input: &'a [u8], kind: nom::error::ErrorKind) -> Self {
        Error::new(ErrorKind::Internal(kind.description().to_string()))
    }

    fn append(_input: &'a [u8], _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

/// The kinds of errors that can occur when processing a disk image.
///
/// Each variant maps to one numeric status code; the message payload is
/// free-form and human-oriented.
#[derive(Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The named file, directory or path segment does not exist. (1)
    NotFound(String),
    /// A path segment that must be a directory is a regular file. (2)
    NotADirectory(String),
    /// A file operation was attempted on a directory. (3)
    IsADirectory(String),
    /// The destination name already exists. (4)
    AlreadyExists(String),
    /// A directory removal was attempted on a non-empty directory. (5)
    DirectoryNotEmpty(String),
    /// The operation requires an overwrite permission the caller did
    /// not grant. (6)
    AccessDenied(String),
    /// A track/sector reference or chain is out of range or cyclic. (7)
    InvalidPath(String),
    /// An offset/length pair does not match the file's extent. (8)
    RangeInvalid(String),
    /// The image, a track range, or a directory has no room left. (9)
    TooLarge(String),
    /// The operation is not supported on this image variant. (10)
    Unsupported(String),
    /// The image is in use. (11)
    Busy(String),
    /// The request is malformed: bad image size, wildcard in a write
    /// path, or an unencodable name. (12)
    BadRequest(String),
    /// An I/O or internal failure not attributable to the caller. (13)
    Internal(String),
}

impl ErrorKind {
    /// The numeric status code for this kind.
    pub fn status(&self) -> u8 {
        match self {
            ErrorKind::NotFound(_) => 1,
            ErrorKind::NotADirectory(_) => 2,
            ErrorKind::IsADirectory(_) => 3,
            ErrorKind::AlreadyExists(_) => 4,
            ErrorKind::DirectoryNotEmpty(_) => 5,
            ErrorKind::AccessDenied(_) => 6,
            ErrorKind::InvalidPath(_) => 7,
            ErrorKind::RangeInvalid(_) => 8,
            ErrorKind::TooLarge(_) => 9,
            ErrorKind::Unsupported(_) => 10,
            ErrorKind::Busy(_) => 11,
            ErrorKind::BadRequest(_) => 12,
            ErrorKind::Internal(_) => 13,
        }
    }

    /// The message payload.
    pub fn message(&self) -> &str {
        match self {
            ErrorKind::NotFound(m)
            | ErrorKind::NotADirectory(m)
            | ErrorKind::IsADirectory(m)
            | ErrorKind::AlreadyExists(m)
            | ErrorKind::DirectoryNotEmpty(m)
            | ErrorKind::AccessDenied(m)
            | ErrorKind::InvalidPath(m)
            | ErrorKind::RangeInvalid(m)
            | ErrorKind::TooLarge(m)
            | ErrorKind::Unsupported(m)
            | ErrorKind::Busy(m)
            | ErrorKind::BadRequest(m)
            | ErrorKind::Internal(m) => m,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "status {}: {}", self.status(), self.message())
    }
}

impl Debug for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};
    use pretty_assertions::assert_eq;

    /// The numeric codes are part of the wire contract and must never
    /// shift.
    #[test]
    fn status_codes_are_stable() {
        let cases: [(ErrorKind, u8); 13] = [
            (ErrorKind::NotFound(String::new()), 1),
            (ErrorKind::NotADirectory(String::new()), 2),
            (ErrorKind::IsADirectory(String::new()), 3),
            (ErrorKind::AlreadyExists(String::new()), 4),
            (ErrorKind::DirectoryNotEmpty(String::new()), 5),
            (ErrorKind::AccessDenied(String::new()), 6),
            (ErrorKind::InvalidPath(String::new()), 7),
            (ErrorKind::RangeInvalid(String::new()), 8),
            (ErrorKind::TooLarge(String::new()), 9),
            (ErrorKind::Unsupported(String::new()), 10),
            (ErrorKind::Busy(String::new()), 11),
            (ErrorKind::BadRequest(String::new()), 12),
            (ErrorKind::Internal(String::new()), 13),
        ];
        for (kind, code) in cases {
            assert_eq!(Error::new(kind).status(), code);
        }
    }

    #[test]
    fn io_errors_become_internal() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(e.status(), 13);
    }

    #[test]
    fn display_includes_status_and_message() {
        let e = Error::new(ErrorKind::NotFound(String::from("no such file: HELLO")));
        assert_eq!(format!("{}", e), "status 1: no such file: HELLO");
    }
}
