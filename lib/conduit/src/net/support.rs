use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    /// The peer spoke something other than RFB 3.8.
    VersionMismatch,
    /// The client response matched no mapping in the registry.
    AuthFailed,
    /// The upstream address could not be connected.
    DialFailed,
    /// The upstream offered neither None auth nor a usable VNC auth.
    SecurityUnsupported,
    /// The mapping registry could not be read or written.
    Registry,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let error: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(error, NetworkError::Wait);
    }

    #[test]
    fn test_io_error_folds_to_fatal() {
        let error: NetworkError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(
            error,
            NetworkError::Fatal(ErrorType::Io(io::ErrorKind::BrokenPipe))
        );
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), NetworkError>(()).has_failed());
        assert!(!Err::<(), _>(NetworkError::Wait).has_failed());
        assert!(Err::<(), _>(NetworkError::Fatal(ErrorType::AuthFailed)).has_failed());
    }
}
