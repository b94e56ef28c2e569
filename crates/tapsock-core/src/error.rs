//! Error types for virtual socket operations.
//!
//! Errors are grouped into classes so callers can tell resource exhaustion,
//! protocol failures, state violations and unsupported options apart. Every
//! error maps onto a POSIX errno for the integer-returning shim.
//!
//! # Propagation
//!
//! - Errors detected inside an application-facing call are returned directly.
//! - Errors detected by the embedded stack inside the event loop are recorded on
//!   the virtual socket as a [`StackErrorKind`] and surfaced by the next call
//!   that touches that socket.

use thiserror::Error;

/// Broad error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// No PCB, buffer or descriptor capacity available
    ResourceExhausted,
    /// Invalid address, type mismatch or handshake failure
    Protocol,
    /// Operation attempted in an incompatible socket state
    StateViolation,
    /// Option not modeled by this layer
    UnsupportedOption,
    /// Operation cannot complete right now; retry later
    WouldBlock,
    /// Unknown or already closed descriptor
    BadDescriptor,
    /// Failure in the surrounding runtime (threads, channels)
    Io,
}

/// Error codes reported by the embedded stack.
///
/// These mirror the classic small-stack error set and are what the `on_error`
/// callback records on a virtual socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackErrorKind {
    /// Out of memory
    Mem,
    /// Buffer error
    Buf,
    /// Timeout
    Timeout,
    /// Routing problem
    Route,
    /// Operation in progress
    InProgress,
    /// Illegal value
    Value,
    /// Operation would block
    WouldBlock,
    /// Address in use
    InUse,
    /// Already connecting
    Already,
    /// Already connected
    IsConn,
    /// Not connected
    Conn,
    /// Low-level interface error
    Interface,
    /// Connection aborted
    Abort,
    /// Connection reset
    Reset,
    /// Connection closed
    Closed,
    /// Illegal argument
    Arg,
    /// Peer answered the handshake with a reset
    Refused,
}

impl StackErrorKind {
    /// POSIX errno for this stack error
    pub fn errno(self) -> i32 {
        match self {
            Self::Mem => libc::ENOMEM,
            Self::Buf => libc::ENOBUFS,
            Self::Timeout => libc::ETIMEDOUT,
            Self::Route => libc::ENETUNREACH,
            Self::InProgress => libc::EINPROGRESS,
            Self::Value => libc::EINVAL,
            Self::WouldBlock => libc::EWOULDBLOCK,
            Self::InUse => libc::EADDRINUSE,
            Self::Already | Self::IsConn => libc::EISCONN,
            Self::Conn => libc::ENOTCONN,
            Self::Interface => libc::EIO,
            Self::Abort => libc::ECONNABORTED,
            Self::Reset => libc::ECONNRESET,
            Self::Closed => libc::ENOTCONN,
            Self::Arg => libc::EINVAL,
            Self::Refused => libc::ECONNREFUSED,
        }
    }

    /// Short human-readable description
    pub fn describe(self) -> &'static str {
        match self {
            Self::Mem => "out of memory",
            Self::Buf => "buffer error",
            Self::Timeout => "timeout",
            Self::Route => "routing problem",
            Self::InProgress => "operation in progress",
            Self::Value => "illegal value",
            Self::WouldBlock => "operation would block",
            Self::InUse => "address in use",
            Self::Already => "already connecting",
            Self::IsConn => "already connected",
            Self::Conn => "not connected",
            Self::Interface => "low-level interface error",
            Self::Abort => "connection aborted",
            Self::Reset => "connection reset",
            Self::Closed => "connection closed",
            Self::Arg => "illegal argument",
            Self::Refused => "connection refused",
        }
    }

    /// Class of the error as seen by the application
    pub fn class(self) -> ErrorClass {
        match self {
            Self::Mem | Self::Buf => ErrorClass::ResourceExhausted,
            Self::WouldBlock | Self::InProgress => ErrorClass::WouldBlock,
            Self::Interface => ErrorClass::Io,
            _ => ErrorClass::Protocol,
        }
    }
}

impl std::fmt::Display for StackErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// Errors returned by application-facing socket operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    // ============ Resource Exhaustion ============
    /// No more virtual sockets can be provisioned
    #[error("socket limit reached ({limit} live sockets)")]
    SocketLimit {
        /// Configured maximum
        limit: usize,
    },

    /// Buffer space exhausted
    #[error("no buffer space available")]
    NoBufferSpace,

    /// Accept queue of a listening socket is full
    #[error("accept queue full")]
    AcceptQueueFull,

    // ============ Protocol / Negotiation ============
    /// Address family not supported
    #[error("address family not supported: {0}")]
    AddressFamilyNotSupported(i32),

    /// Socket type not supported
    #[error("socket type not supported: {0}")]
    SocketTypeNotSupported(i32),

    /// Protocol does not match the socket type
    #[error("protocol not supported: {0}")]
    ProtocolNotSupported(i32),

    /// Address family of the argument does not match the socket
    #[error("address family mismatch")]
    FamilyMismatch,

    /// Operation requires a different socket type
    #[error("operation not supported on {0} sockets")]
    WrongSocketType(&'static str),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No virtual network interface can reach the address
    #[error("no network reaches {0}")]
    NoRoute(std::net::IpAddr),

    /// No virtual network interface owns the local address
    #[error("address not available: {0}")]
    AddressNotAvailable(std::net::IpAddr),

    /// Address already bound on this interface
    #[error("address in use: port {0}")]
    AddressInUse(u16),

    /// Error reported asynchronously by the embedded stack
    #[error("stack error: {0}")]
    Stack(StackErrorKind),

    // ============ State Violations ============
    /// Socket is already connected
    #[error("socket already connected")]
    AlreadyConnected,

    /// Socket is not connected
    #[error("socket not connected")]
    NotConnected,

    /// Datagram socket has no default destination
    #[error("destination address required")]
    DestinationRequired,

    /// Socket is not listening
    #[error("socket is not listening")]
    NotListening,

    /// Socket is shutting down or closed
    #[error("socket is shutting down")]
    ShuttingDown,

    /// Timed out waiting for the event loop
    #[error("operation timed out")]
    TimedOut,

    // ============ Options ============
    /// Option not modeled by this layer
    #[error("unsupported option level={level} name={name}")]
    UnsupportedOption {
        /// Option level (SOL_SOCKET, IPPROTO_TCP, ...)
        level: i32,
        /// Option name
        name: i32,
    },

    // ============ Misc ============
    /// Operation would block
    #[error("operation would block")]
    WouldBlock,

    /// Unknown or closed descriptor
    #[error("bad descriptor: {0}")]
    BadDescriptor(i32),

    /// The owning interface has stopped
    #[error("network interface is down")]
    InterfaceDown,
}

impl SocketError {
    /// Error class
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SocketLimit { .. } | Self::NoBufferSpace | Self::AcceptQueueFull => {
                ErrorClass::ResourceExhausted
            }
            Self::AddressFamilyNotSupported(_)
            | Self::SocketTypeNotSupported(_)
            | Self::ProtocolNotSupported(_)
            | Self::FamilyMismatch
            | Self::WrongSocketType(_)
            | Self::InvalidArgument(_)
            | Self::NoRoute(_)
            | Self::AddressNotAvailable(_)
            | Self::AddressInUse(_) => ErrorClass::Protocol,
            Self::Stack(kind) => kind.class(),
            Self::AlreadyConnected
            | Self::NotConnected
            | Self::DestinationRequired
            | Self::NotListening
            | Self::ShuttingDown
            | Self::TimedOut => ErrorClass::StateViolation,
            Self::UnsupportedOption { .. } => ErrorClass::UnsupportedOption,
            Self::WouldBlock => ErrorClass::WouldBlock,
            Self::BadDescriptor(_) => ErrorClass::BadDescriptor,
            Self::InterfaceDown => ErrorClass::Io,
        }
    }

    /// POSIX errno for this error
    pub fn errno(&self) -> i32 {
        match self {
            Self::SocketLimit { .. } => libc::ENOMEM,
            Self::NoBufferSpace => libc::ENOBUFS,
            Self::AcceptQueueFull => libc::ECONNREFUSED,
            Self::AddressFamilyNotSupported(_) => libc::EAFNOSUPPORT,
            Self::SocketTypeNotSupported(_) => libc::ESOCKTNOSUPPORT,
            Self::ProtocolNotSupported(_) => libc::EPROTONOSUPPORT,
            Self::FamilyMismatch | Self::InvalidArgument(_) => libc::EINVAL,
            Self::WrongSocketType(_) => libc::EOPNOTSUPP,
            Self::NoRoute(_) => libc::ENETUNREACH,
            Self::AddressNotAvailable(_) => libc::EADDRNOTAVAIL,
            Self::AddressInUse(_) => libc::EADDRINUSE,
            Self::Stack(kind) => kind.errno(),
            Self::AlreadyConnected => libc::EISCONN,
            Self::NotConnected => libc::ENOTCONN,
            Self::DestinationRequired => libc::EDESTADDRREQ,
            Self::NotListening => libc::EINVAL,
            Self::ShuttingDown => libc::EPIPE,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::UnsupportedOption { .. } => libc::ENOPROTOOPT,
            Self::WouldBlock => libc::EWOULDBLOCK,
            Self::BadDescriptor(_) => libc::EBADF,
            Self::InterfaceDown => libc::ENETDOWN,
        }
    }

    /// Check if the operation may succeed when retried later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WouldBlock | Self::NoBufferSpace | Self::Stack(StackErrorKind::WouldBlock)
        )
    }
}

impl From<StackErrorKind> for SocketError {
    fn from(kind: StackErrorKind) -> Self {
        Self::Stack(kind)
    }
}

/// Result type for socket operations
pub type SocketResult<T> = Result<T, SocketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_error_errno_table() {
        assert_eq!(StackErrorKind::Mem.errno(), libc::ENOMEM);
        assert_eq!(StackErrorKind::Buf.errno(), libc::ENOBUFS);
        assert_eq!(StackErrorKind::Timeout.errno(), libc::ETIMEDOUT);
        assert_eq!(StackErrorKind::Route.errno(), libc::ENETUNREACH);
        assert_eq!(StackErrorKind::InUse.errno(), libc::EADDRINUSE);
        assert_eq!(StackErrorKind::Already.errno(), libc::EISCONN);
        assert_eq!(StackErrorKind::Reset.errno(), libc::ECONNRESET);
        assert_eq!(StackErrorKind::Abort.errno(), libc::ECONNABORTED);
        assert_eq!(StackErrorKind::Refused.errno(), libc::ECONNREFUSED);
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            SocketError::SocketLimit { limit: 4 }.class(),
            ErrorClass::ResourceExhausted
        );
        assert_eq!(SocketError::FamilyMismatch.class(), ErrorClass::Protocol);
        assert_eq!(SocketError::ShuttingDown.class(), ErrorClass::StateViolation);
        assert_eq!(
            SocketError::UnsupportedOption { level: 1, name: 2 }.class(),
            ErrorClass::UnsupportedOption
        );
        assert_eq!(
            SocketError::Stack(StackErrorKind::Reset).class(),
            ErrorClass::Protocol
        );
        assert_eq!(
            SocketError::Stack(StackErrorKind::Mem).class(),
            ErrorClass::ResourceExhausted
        );
    }

    #[test]
    fn test_socket_error_errno() {
        assert_eq!(SocketError::SocketLimit { limit: 1 }.errno(), libc::ENOMEM);
        assert_eq!(SocketError::WouldBlock.errno(), libc::EWOULDBLOCK);
        assert_eq!(SocketError::BadDescriptor(3).errno(), libc::EBADF);
        assert_eq!(
            SocketError::UnsupportedOption { level: 0, name: 0 }.errno(),
            libc::ENOPROTOOPT
        );
        assert_eq!(
            SocketError::from(StackErrorKind::Reset).errno(),
            libc::ECONNRESET
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(SocketError::WouldBlock.is_transient());
        assert!(!SocketError::NotConnected.is_transient());
    }
}
