//! In-process port bus.
//!
//! Every output port owns a [`tokio::sync::broadcast`] channel so that any
//! number of input ports can subscribe without one slow reader blocking the
//! others.  Readers that fall behind skip straight to the newest record,
//! which is the only one a merge tick ever looks at.
//!
//! | Port kind | Registered as | Delivers to |
//! |---|---|---|
//! | Output | broadcast sender | every connected input |
//! | Input | name only | its single connected output |

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use portmerge_types::{MergeError, Record};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::debug;

use crate::transport::{InputChannel, OutputChannel, Transport};

/// Default per-port channel capacity (records buffered before the oldest is
/// dropped for slow readers).
const DEFAULT_CAPACITY: usize = 16;

#[derive(Debug)]
enum PortEntry {
    Input,
    Output(broadcast::Sender<Record>),
}

/// Shared port bus.  Clone it cheaply – all clones share the same name table.
#[derive(Clone, Debug)]
pub struct PortBus {
    ports: Arc<RwLock<HashMap<String, PortEntry>>>,
    capacity: usize,
}

impl PortBus {
    /// Create a bus whose output ports buffer `capacity` records each.
    pub fn new(capacity: usize) -> Self {
        Self {
            ports: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn register(&self, name: &str, entry: PortEntry) -> Result<(), MergeError> {
        let mut ports = self
            .ports
            .write()
            .map_err(|_| MergeError::Transport("port table lock poisoned".to_string()))?;
        if ports.contains_key(name) {
            return Err(MergeError::Transport(format!(
                "port name '{name}' is already registered"
            )));
        }
        ports.insert(name.to_string(), entry);
        Ok(())
    }

    fn unregister(&self, name: &str) {
        if let Ok(mut ports) = self.ports.write() {
            ports.remove(name);
        }
    }

    fn subscribe(&self, producer: &str) -> Result<broadcast::Receiver<Record>, MergeError> {
        let ports = self
            .ports
            .read()
            .map_err(|_| MergeError::Transport("port table lock poisoned".to_string()))?;
        match ports.get(producer) {
            Some(PortEntry::Output(sender)) => Ok(sender.subscribe()),
            Some(PortEntry::Input) => Err(MergeError::Connection {
                name: producer.to_string(),
                details: "port is not an output".to_string(),
            }),
            None => Err(MergeError::Connection {
                name: producer.to_string(),
                details: "cannot find requested port".to_string(),
            }),
        }
    }
}

impl Default for PortBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Transport for PortBus {
    async fn open_input(&self, name: &str) -> Result<Box<dyn InputChannel>, MergeError> {
        self.register(name, PortEntry::Input)?;
        Ok(Box::new(LocalInput {
            name: name.to_string(),
            bus: self.clone(),
            receiver: None,
            interrupted: false,
            closed: false,
        }))
    }

    async fn open_output(&self, name: &str) -> Result<Box<dyn OutputChannel>, MergeError> {
        let (sender, _) = broadcast::channel(self.capacity);
        self.register(name, PortEntry::Output(sender.clone()))?;
        Ok(Box::new(LocalOutput {
            name: name.to_string(),
            bus: self.clone(),
            sender,
            interrupted: false,
            closed: false,
        }))
    }

    fn is_registered(&self, name: &str) -> bool {
        self.ports
            .read()
            .map(|ports| ports.contains_key(name))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

struct LocalInput {
    name: String,
    bus: PortBus,
    receiver: Option<broadcast::Receiver<Record>>,
    interrupted: bool,
    closed: bool,
}

#[async_trait]
impl InputChannel for LocalInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self, producer: &str) -> Result<(), MergeError> {
        if self.closed {
            return Err(MergeError::Closed);
        }
        self.receiver = Some(self.bus.subscribe(producer)?);
        debug!(port = %self.name, producer, "connected");
        Ok(())
    }

    fn try_read(&mut self) -> Option<Record> {
        if self.interrupted {
            return None;
        }
        let receiver = self.receiver.as_mut()?;
        let mut latest = None;
        loop {
            match receiver.try_recv() {
                Ok(record) => latest = Some(record),
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(port = %self.name, skipped, "reader lagged; skipping to newest");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        latest
    }

    fn interrupt(&mut self) {
        self.interrupted = true;
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.receiver = None;
            self.bus.unregister(&self.name);
        }
    }
}

struct LocalOutput {
    name: String,
    bus: PortBus,
    sender: broadcast::Sender<Record>,
    interrupted: bool,
    closed: bool,
}

impl OutputChannel for LocalOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, record: &Record) -> Result<(), MergeError> {
        if self.closed {
            return Err(MergeError::Closed);
        }
        if !self.interrupted {
            // No subscribers is a normal condition.
            let _ = self.sender.send(record.clone());
        }
        Ok(())
    }

    fn interrupt(&mut self) {
        self.interrupted = true;
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.bus.unregister(&self.name);
        }
    }
}
