//! `portmerge-middleware` – The Plumbing
//!
//! Moves [`Record`][portmerge_types::Record]s between named ports without
//! caring about their meaning.
//!
//! # Modules
//!
//! - [`transport`] – the [`Transport`] / [`InputChannel`] / [`OutputChannel`]
//!   traits the merge engine is written against.
//! - [`bus`] – in-process [`PortBus`] built on Tokio broadcast channels.
//! - [`udp`] – [`UdpTransport`] exchanging JSON datagrams between processes.
//! - [`registry`] – [`TransportRegistry`], the name → constructor map used
//!   to pick a transport from configuration.

pub mod bus;
pub mod registry;
pub mod transport;
pub mod udp;

pub use bus::PortBus;
pub use registry::{TransportFactory, TransportRegistry, TransportSettings};
pub use transport::{InputChannel, OutputChannel, Transport};
pub use udp::UdpTransport;
