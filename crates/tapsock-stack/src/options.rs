//! Socket options modeled by this layer.
//!
//! Only the options with a meaning here are accepted; anything else is
//! reported as [`SocketError::UnsupportedOption`] rather than ignored.

use std::time::Duration;
use tapsock_core::{SocketError, SocketResult, SocketType};

/// Keep-alive interval used when `SO_KEEPALIVE` is switched on
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(75);

/// A settable option with its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// `TCP_NODELAY`: disable Nagle's algorithm
    NoDelay(bool),
    /// `SO_LINGER`: bound on how long close waits for unsent data; zero aborts
    Linger(Option<Duration>),
    /// `SO_KEEPALIVE`: keep-alive probe interval
    KeepAlive(Option<Duration>),
}

/// A readable option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionName {
    /// `TCP_NODELAY`
    NoDelay,
    /// `SO_LINGER`
    Linger,
    /// `SO_KEEPALIVE`
    KeepAlive,
    /// `SO_ERROR` (takes the pending error)
    Error,
    /// `SO_TYPE`
    Type,
}

/// Value returned by `get_option`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    /// Boolean option
    Flag(bool),
    /// Linger setting
    Linger(Option<Duration>),
    /// Pending errno, 0 if none
    Error(i32),
    /// Socket type
    Type(SocketType),
}

impl OptionName {
    /// Resolve a `(level, name)` pair
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::UnsupportedOption`] for anything not modeled.
    pub fn from_raw(level: i32, name: i32) -> SocketResult<Self> {
        match (level, name) {
            (libc::IPPROTO_TCP, libc::TCP_NODELAY) => Ok(Self::NoDelay),
            (libc::SOL_SOCKET, libc::SO_LINGER) => Ok(Self::Linger),
            (libc::SOL_SOCKET, libc::SO_KEEPALIVE) => Ok(Self::KeepAlive),
            (libc::SOL_SOCKET, libc::SO_ERROR) => Ok(Self::Error),
            (libc::SOL_SOCKET, libc::SO_TYPE) => Ok(Self::Type),
            _ => Err(SocketError::UnsupportedOption { level, name }),
        }
    }
}

fn read_int(value: &[u8]) -> SocketResult<i32> {
    let bytes: [u8; 4] = value
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(SocketError::InvalidArgument("option value too short"))?;
    Ok(i32::from_ne_bytes(bytes))
}

impl SocketOption {
    /// Decode a raw `setsockopt` value.
    ///
    /// Integer options take a native-endian `int`; `SO_LINGER` takes a
    /// `struct linger` (`l_onoff`, `l_linger` in seconds).
    ///
    /// # Errors
    ///
    /// Returns an error for unmodeled or read-only options and short values.
    pub fn from_raw(level: i32, name: i32, value: &[u8]) -> SocketResult<Self> {
        match OptionName::from_raw(level, name)? {
            OptionName::NoDelay => Ok(Self::NoDelay(read_int(value)? != 0)),
            OptionName::KeepAlive => Ok(Self::KeepAlive(
                (read_int(value)? != 0).then_some(DEFAULT_KEEPALIVE),
            )),
            OptionName::Linger => {
                let onoff = read_int(value)?;
                let secs = read_int(value.get(4..).unwrap_or_default())?;
                Ok(Self::Linger(
                    (onoff != 0).then(|| Duration::from_secs(secs.max(0) as u64)),
                ))
            }
            OptionName::Error | OptionName::Type => {
                Err(SocketError::UnsupportedOption { level, name })
            }
        }
    }

    /// Name of this option
    pub fn name(&self) -> OptionName {
        match self {
            Self::NoDelay(_) => OptionName::NoDelay,
            Self::Linger(_) => OptionName::Linger,
            Self::KeepAlive(_) => OptionName::KeepAlive,
        }
    }
}

impl OptionValue {
    /// Encode for `getsockopt`
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Flag(on) => i32::from(*on).to_ne_bytes().to_vec(),
            Self::Error(errno) => errno.to_ne_bytes().to_vec(),
            Self::Type(ty) => ty.raw().to_ne_bytes().to_vec(),
            Self::Linger(linger) => {
                let mut out = Vec::with_capacity(8);
                out.extend_from_slice(&i32::from(linger.is_some()).to_ne_bytes());
                let secs = linger.map_or(0, |d| d.as_secs().min(i32::MAX as u64) as i32);
                out.extend_from_slice(&secs.to_ne_bytes());
                out
            }
        }
    }
}
