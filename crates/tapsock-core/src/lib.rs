//! # tapsock Core
//!
//! Stack-independent building blocks of the tapsock virtual socket layer.
//!
//! This crate provides:
//! - Fixed-capacity ring buffers for RX/TX staging
//! - The virtual socket control-plane state machine
//! - Per-listener accept queues
//! - Live-socket accounting
//! - Datagram framing for the application channel
//! - Error taxonomy with POSIX errno mapping
//! - The readiness-notification collaborator interface
//! - Shared stack configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Application threads                            │
//! │   (socket/bind/connect/listen/accept/read/write/close)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  VirtualSocket                                  │
//! │   (state flags, RX/TX rings, accept queue, pending error)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  Tap event loop (tapsock-stack)                 │
//! │   (sole owner of PCBs, drives the embedded TCP/IP stack)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accept_queue;
pub mod accounting;
pub mod config;
pub mod error;
pub mod framing;
pub mod readiness;
pub mod ring_buffer;
pub mod vsocket;

pub use accept_queue::AcceptQueue;
pub use accounting::SocketAccounting;
pub use config::{StackConfig, WriteMode};
pub use error::{ErrorClass, SocketError, SocketResult, StackErrorKind};
pub use readiness::{Fd, NoopNotifier, ReadinessNotifier, ReadinessTable};
pub use ring_buffer::RingBuffer;
pub use vsocket::{
    AddressFamily, NetworkId, ProtocolState, ShutdownHow, SocketId, SocketType, TxStage,
    VirtualSocket, VsState,
};

/// Ephemeral port range used when binding to port 0
pub const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Largest MTU a Tap accepts
pub const MAX_MTU: usize = 2800;

/// Ethernet header length (destination MAC, source MAC, ether-type)
pub const ETHERNET_HEADER_SIZE: usize = 14;
