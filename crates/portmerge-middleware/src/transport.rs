//! The channel collaborator seam.
//!
//! The merge engine never speaks directly to sockets or an in-process bus.
//! It opens named channels through a [`Transport`] and talks to them through
//! [`InputChannel`] and [`OutputChannel`].
//!
//! # Overview
//!
//! - [`PortBus`][crate::bus::PortBus] – in-process transport built on Tokio
//!   broadcast channels.
//! - [`UdpTransport`][crate::udp::UdpTransport] – JSON datagrams between
//!   processes, names resolved through a static table.

use async_trait::async_trait;
use portmerge_types::{MergeError, Record};

/// Opens named channels.
///
/// # Contract
///
/// * `open_input` / `open_output` – register `name` with the transport and
///   return a channel bound to it.  Registering a name twice fails.
///
/// * `is_registered` – `true` while some channel (local or remote) answers to
///   `name`.  Used to pick the first free auto-generated input name.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_input(&self, name: &str) -> Result<Box<dyn InputChannel>, MergeError>;

    async fn open_output(&self, name: &str) -> Result<Box<dyn OutputChannel>, MergeError>;

    fn is_registered(&self, name: &str) -> bool;
}

/// The receiving end of one source.
#[async_trait]
pub trait InputChannel: Send {
    /// The name this channel was opened under.
    fn name(&self) -> &str;

    /// Ask the producer registered as `producer` to deliver to this channel.
    ///
    /// Fails with [`MergeError::Connection`] when the producer cannot be
    /// resolved.
    async fn connect(&mut self, producer: &str) -> Result<(), MergeError>;

    /// Non-blocking: the newest record received since the previous call, or
    /// `None` when nothing new has arrived.
    fn try_read(&mut self) -> Option<Record>;

    /// Stop delivering records.  Subsequent reads return `None`.
    fn interrupt(&mut self);

    /// Release the underlying resource and unregister the name.
    fn close(&mut self);
}

/// The sending end of the merged stream.
pub trait OutputChannel: Send {
    fn name(&self) -> &str;

    /// Best-effort, non-blocking delivery of `record` to every current
    /// consumer.  Having no consumers is not an error.
    fn write(&mut self, record: &Record) -> Result<(), MergeError>;

    fn interrupt(&mut self);

    fn close(&mut self);
}
