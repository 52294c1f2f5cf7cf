//! Source registry.
//!
//! One [`Source`] per distinct producer named in the active format.  Each
//! owns an input channel connected to that producer and caches the newest
//! record it has seen, so a tick always has something to select from once
//! the producer has published at least once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use portmerge_middleware::{InputChannel, Transport};
use portmerge_types::{MergeError, Record};
use tokio::time::timeout;
use tracing::{debug, info};

/// A connected producer and its last received record.
pub struct Source {
    name: String,
    channel: Box<dyn InputChannel>,
    cached: Option<Record>,
}

impl Source {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the local input channel reading from this source.
    pub fn input_name(&self) -> &str {
        self.channel.name()
    }

    /// Newest record received so far, `None` until the first one arrives.
    pub fn cached(&self) -> Option<&Record> {
        self.cached.as_ref()
    }

    /// Drain the channel without waiting; returns `true` when the cache was
    /// replaced.
    fn refresh(&mut self) -> bool {
        match self.channel.try_read() {
            Some(record) => {
                self.cached = Some(record);
                true
            }
            None => false,
        }
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        self.channel.interrupt();
        self.channel.close();
    }
}

/// Producers referenced by one format, keyed by producer name.
pub struct SourceRegistry {
    transport: Arc<dyn Transport>,
    input_prefix: String,
    connect_timeout: Duration,
    sources: BTreeMap<String, Source>,
}

impl SourceRegistry {
    /// Create an empty registry.  Input channels are named
    /// `<input_prefix><N>:i` with the smallest `N >= 1` still free on the
    /// transport.
    pub fn new(
        transport: Arc<dyn Transport>,
        input_prefix: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            input_prefix: input_prefix.into(),
            connect_timeout,
            sources: BTreeMap::new(),
        }
    }

    /// Open an input channel and connect it to the producer `name`.
    ///
    /// Declaring a name twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`MergeError::Connection`] when the producer cannot be reached within
    /// the connect timeout, or whatever the transport reports when opening
    /// the channel.
    pub async fn declare(&mut self, name: &str) -> Result<(), MergeError> {
        if self.sources.contains_key(name) {
            return Ok(());
        }

        let input_name = self.next_input_name();
        let mut channel = self.transport.open_input(&input_name).await?;
        let connected = match timeout(self.connect_timeout, channel.connect(name)).await {
            Ok(result) => result,
            Err(_) => Err(MergeError::Connection {
                name: name.to_string(),
                details: format!("no answer within {:?}", self.connect_timeout),
            }),
        };
        if let Err(e) = connected {
            channel.close();
            return Err(e);
        }

        info!(source = name, input = %input_name, "source connected");
        self.sources.insert(
            name.to_string(),
            Source {
                name: name.to_string(),
                channel,
                cached: None,
            },
        );
        Ok(())
    }

    fn next_input_name(&self) -> String {
        let mut n: u64 = 1;
        loop {
            let candidate = format!("{}{n}:i", self.input_prefix);
            if !self.transport.is_registered(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Pull the newest available record from every source.  Returns how many
    /// caches changed.
    pub fn refresh_all(&mut self) -> usize {
        let fresh = self
            .sources
            .values_mut()
            .map(Source::refresh)
            .filter(|&changed| changed)
            .count();
        debug!(fresh, total = self.sources.len(), "sources refreshed");
        fresh
    }

    /// Cached record of `name`; `Ok(None)` until it has published.
    ///
    /// # Errors
    ///
    /// [`MergeError::Lookup`] if `name` was never declared.
    pub fn get(&self, name: &str) -> Result<Option<&Record>, MergeError> {
        self.sources
            .get(name)
            .map(Source::cached)
            .ok_or_else(|| MergeError::Lookup(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    /// Make every pending or future read return immediately.
    pub fn interrupt_all(&mut self) {
        for source in self.sources.values_mut() {
            source.channel.interrupt();
        }
    }

    /// Release every input channel.  The registry is empty afterwards.
    pub fn close_all(&mut self) {
        for source in self.sources.values_mut() {
            source.channel.interrupt();
        }
        // Dropping a source closes its channel.
        self.sources.clear();
    }
}
