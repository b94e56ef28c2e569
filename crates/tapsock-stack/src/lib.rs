//! # tapsock Stack
//!
//! Drives the embedded TCP/IP stack behind tapsock virtual sockets.
//!
//! This crate provides:
//! - Taps: one virtual Ethernet interface per joined network, each with a
//!   dedicated event loop thread that owns every protocol control block
//! - The stack driver: application-side socket operations that hand work to
//!   the event loop and move data through the socket rings
//! - Stack callbacks: draining received data, reaping acknowledged data and
//!   publishing connection state changes back to sockets
//! - Tap selection by destination or local address
//! - [`NetworkService`], the descriptor table tying it together, and a
//!   POSIX-convention shim in [`posix`]
//!
//! ## Threading
//!
//! Application threads never touch stack state. They post [`Tap`] commands
//! and wait on the socket's condition variable; the event loop is the only
//! thread that polls the interface or mutates a control block.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
mod callbacks;
pub mod device;
mod driver;
mod event_loop;
pub mod options;
mod pcb;
pub mod posix;
pub mod select;
pub mod service;
pub mod tap;

pub use addr::{AddrParseError, IpCidr, Route};
pub use device::{
    ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHERTYPE_IPV6, EthernetFrame, FrameSink, MacAddress, NullSink,
    encode_frame,
};
pub use driver::max_datagram_payload;
pub use options::{OptionName, OptionValue, SocketOption};
pub use select::{select_bind_tap, select_tap};
pub use service::NetworkService;
pub use tap::{MIN_MTU, Tap, TapConfig, TapError, TapShared, TapStats, TapStatsSnapshot};
