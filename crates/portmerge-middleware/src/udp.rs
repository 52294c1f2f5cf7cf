//! UDP transport: JSON datagrams between processes.
//!
//! Port names resolve through a static name table loaded from configuration
//! plus every port opened locally.  A consumer subscribes by sending a
//! `subscribe` packet to the producer's address; the producer answers with
//! `subscribed` and from then on sends every record to the consumer as a
//! `data` packet.
//!
//! ```text
//! consumer ──{"kind":"subscribe","port":"/lm/merge/source1:i"}──▶ producer
//! consumer ◀──{"kind":"subscribed","port":"/imu:o"}─────────────── producer
//! consumer ◀──{"kind":"data","record":[1,2.5,["x"]]}───────────── producer
//! ```
//!
//! `connect` does not return until the producer has answered, so a missing
//! producer surfaces as a connection timeout.  A consumer that hears nothing
//! for [`RESUBSCRIBE_AFTER`] subscribes again, which picks up producers that
//! restarted and lost their subscriber list.
//!
//! Reads and writes never block: both sides use `try_recv_from` /
//! `try_send_to` and treat `WouldBlock` as "nothing to do".  Each output runs
//! a small task that answers subscriptions as they arrive.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use portmerge_types::{MergeError, Record};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::TransportSettings;
use crate::transport::{InputChannel, OutputChannel, Transport};

/// Largest payload that fits in a single IPv4 UDP datagram.
const MAX_DATAGRAM: usize = 65_507;

/// Silence after which a consumer subscribes again.
pub const RESUBSCRIBE_AFTER: Duration = Duration::from_millis(500);

/// Interval between `subscribe` retries while `connect` waits for an answer.
const CONNECT_RETRY: Duration = Duration::from_millis(200);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Packet {
    Subscribe { port: String },
    Subscribed { port: String },
    Data { record: Record },
}

fn encode(packet: &Packet) -> Result<Vec<u8>, MergeError> {
    serde_json::to_vec(packet).map_err(|e| MergeError::Transport(e.to_string()))
}

/// Name table shared by the transport and every channel it opened.
#[derive(Debug, Default)]
struct NameTable {
    configured: BTreeMap<String, SocketAddr>,
    local: RwLock<HashMap<String, SocketAddr>>,
}

impl NameTable {
    fn resolve(&self, name: &str) -> Option<SocketAddr> {
        let local = self
            .local
            .read()
            .ok()
            .and_then(|local| local.get(name).copied());
        local.or_else(|| self.configured.get(name).copied())
    }

    fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    fn register(&self, name: &str, addr: SocketAddr) -> Result<(), MergeError> {
        let mut local = self
            .local
            .write()
            .map_err(|_| MergeError::Transport("name table lock poisoned".to_string()))?;
        if local.contains_key(name) {
            return Err(MergeError::Transport(format!(
                "port name '{name}' is already registered"
            )));
        }
        local.insert(name.to_string(), addr);
        Ok(())
    }

    fn unregister(&self, name: &str) {
        if let Ok(mut local) = self.local.write() {
            local.remove(name);
        }
    }
}

/// [`Transport`] over UDP sockets.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    names: Arc<NameTable>,
    bind_host: String,
}

impl UdpTransport {
    /// Build the transport from settings.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Configuration`] if a configured port address is
    /// not a valid socket address.
    pub fn from_settings(settings: &TransportSettings) -> Result<Self, MergeError> {
        let mut configured = BTreeMap::new();
        for (name, addr) in &settings.ports {
            let parsed: SocketAddr = addr.parse().map_err(|e| {
                MergeError::Configuration(format!("port '{name}' has invalid address '{addr}': {e}"))
            })?;
            configured.insert(name.clone(), parsed);
        }
        Ok(Self {
            names: Arc::new(NameTable {
                configured,
                local: RwLock::new(HashMap::new()),
            }),
            bind_host: settings.bind_host.clone(),
        })
    }

    /// Address `name` currently resolves to, if any.
    pub fn resolve(&self, name: &str) -> Option<SocketAddr> {
        self.names.resolve(name)
    }

    async fn bind(&self, addr: Option<SocketAddr>) -> Result<UdpSocket, MergeError> {
        let result = match addr {
            Some(addr) => UdpSocket::bind(addr).await,
            None => UdpSocket::bind((self.bind_host.as_str(), 0)).await,
        };
        result.map_err(|e| MergeError::Transport(format!("bind failed: {e}")))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn open_input(&self, name: &str) -> Result<Box<dyn InputChannel>, MergeError> {
        let socket = self.bind(None).await?;
        let addr = local_addr(&socket)?;
        self.names.register(name, addr)?;
        debug!(port = name, %addr, "input bound");
        let subscribe = encode(&Packet::Subscribe {
            port: name.to_string(),
        })?;
        Ok(Box::new(UdpInput {
            name: name.to_string(),
            names: Arc::clone(&self.names),
            socket: Some(socket),
            producer: None,
            subscribe,
            last_heard: Instant::now(),
            buf: vec![0; MAX_DATAGRAM],
            interrupted: false,
        }))
    }

    async fn open_output(&self, name: &str) -> Result<Box<dyn OutputChannel>, MergeError> {
        // Outputs listed in the name table bind to their configured address
        // so remote consumers can find them.
        let socket = self.bind(self.names.configured.get(name).copied()).await?;
        let addr = local_addr(&socket)?;
        self.names.register(name, addr)?;
        info!(port = name, %addr, "output bound");

        let ack = encode(&Packet::Subscribed {
            port: name.to_string(),
        })?;
        let socket = Arc::new(socket);
        let subscribers = Arc::new(Mutex::new(HashSet::new()));
        let listener = tokio::spawn(answer_subscriptions(
            name.to_string(),
            Arc::clone(&socket),
            Arc::clone(&subscribers),
            ack,
        ));
        Ok(Box::new(UdpOutput {
            name: name.to_string(),
            names: Arc::clone(&self.names),
            socket: Some(socket),
            subscribers,
            listener: Some(listener),
            interrupted: false,
        }))
    }

    fn is_registered(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

fn local_addr(socket: &UdpSocket) -> Result<SocketAddr, MergeError> {
    socket
        .local_addr()
        .map_err(|e| MergeError::Transport(format!("cannot read local address: {e}")))
}

/// A producer bound to an unspecified address answers from a concrete one.
fn same_peer(expected: SocketAddr, from: SocketAddr) -> bool {
    expected.port() == from.port() && (expected.ip().is_unspecified() || expected.ip() == from.ip())
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

struct UdpInput {
    name: String,
    names: Arc<NameTable>,
    socket: Option<UdpSocket>,
    producer: Option<SocketAddr>,
    subscribe: Vec<u8>,
    /// Last packet from the producer, or last `subscribe` sent.
    last_heard: Instant,
    buf: Vec<u8>,
    interrupted: bool,
}

impl UdpInput {
    fn resubscribe(&mut self, producer: SocketAddr) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        match socket.try_send_to(&self.subscribe, producer) {
            Ok(_) => debug!(port = %self.name, %producer, "subscription renewed"),
            Err(e) => debug!(port = %self.name, %producer, error = %e, "resubscribe failed"),
        }
        self.last_heard = Instant::now();
    }
}

#[async_trait]
impl InputChannel for UdpInput {
    fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to `producer` and wait for its answer.  Waits indefinitely;
    /// callers bound the wait with a timeout.
    async fn connect(&mut self, producer: &str) -> Result<(), MergeError> {
        let addr = self.names.resolve(producer).ok_or_else(|| MergeError::Connection {
            name: producer.to_string(),
            details: "cannot find requested port".to_string(),
        })?;
        let socket = self.socket.as_ref().ok_or(MergeError::Closed)?;

        loop {
            socket
                .send_to(&self.subscribe, addr)
                .await
                .map_err(|e| MergeError::Connection {
                    name: producer.to_string(),
                    details: e.to_string(),
                })?;
            let Ok(received) = tokio::time::timeout(CONNECT_RETRY, socket.recv_from(&mut self.buf)).await
            else {
                debug!(port = %self.name, producer, "no answer yet; subscribing again");
                continue;
            };
            let (len, from) = received.map_err(|e| MergeError::Connection {
                name: producer.to_string(),
                details: e.to_string(),
            })?;
            if !same_peer(addr, from) {
                continue;
            }
            match serde_json::from_slice::<Packet>(&self.buf[..len]) {
                Ok(Packet::Subscribed { .. } | Packet::Data { .. }) => break,
                Ok(other) => debug!(port = %self.name, packet = ?other, "ignoring packet"),
                Err(e) => debug!(port = %self.name, error = %e, "dropping malformed datagram"),
            }
        }

        self.producer = Some(addr);
        self.last_heard = Instant::now();
        debug!(port = %self.name, producer, %addr, "subscribed");
        Ok(())
    }

    fn try_read(&mut self) -> Option<Record> {
        if self.interrupted {
            return None;
        }
        let producer = self.producer?;
        let socket = self.socket.as_ref()?;
        let mut latest = None;
        loop {
            match socket.try_recv_from(&mut self.buf) {
                Ok((len, from)) if same_peer(producer, from) => {
                    match serde_json::from_slice::<Packet>(&self.buf[..len]) {
                        Ok(Packet::Data { record }) => {
                            self.last_heard = Instant::now();
                            latest = Some(record);
                        }
                        Ok(Packet::Subscribed { .. }) => self.last_heard = Instant::now(),
                        Ok(other) => debug!(port = %self.name, packet = ?other, "ignoring packet"),
                        Err(e) => debug!(port = %self.name, error = %e, "dropping malformed datagram"),
                    }
                }
                Ok((_, from)) => {
                    debug!(port = %self.name, %from, "ignoring datagram from unconnected peer");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(port = %self.name, error = %e, "receive failed");
                    break;
                }
            }
        }
        if self.last_heard.elapsed() >= RESUBSCRIBE_AFTER {
            self.resubscribe(producer);
        }
        latest
    }

    fn interrupt(&mut self) {
        self.interrupted = true;
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            self.names.unregister(&self.name);
        }
    }
}

/// Answer every `subscribe` packet arriving on an output's socket, including
/// repeats from consumers that are already subscribed.
async fn answer_subscriptions(
    output: String,
    socket: Arc<UdpSocket>,
    subscribers: Arc<Mutex<HashSet<SocketAddr>>>,
    ack: Vec<u8>,
) {
    let mut buf = vec![0; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(%output, error = %e, "receive failed");
                continue;
            }
        };
        match serde_json::from_slice::<Packet>(&buf[..len]) {
            Ok(Packet::Subscribe { port }) => {
                let added = subscribers.lock().is_ok_and(|mut s| s.insert(from));
                if added {
                    info!(%output, subscriber = %port, %from, "new subscriber");
                }
                if let Err(e) = socket.send_to(&ack, from).await {
                    debug!(%output, %from, error = %e, "cannot answer subscription");
                }
            }
            Ok(other) => debug!(%output, packet = ?other, "ignoring packet"),
            Err(e) => debug!(%output, error = %e, "dropping malformed datagram"),
        }
    }
}

struct UdpOutput {
    name: String,
    names: Arc<NameTable>,
    socket: Option<Arc<UdpSocket>>,
    subscribers: Arc<Mutex<HashSet<SocketAddr>>>,
    listener: Option<JoinHandle<()>>,
    interrupted: bool,
}

impl OutputChannel for UdpOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, record: &Record) -> Result<(), MergeError> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(MergeError::Closed);
        };
        let targets: Vec<SocketAddr> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.iter().copied().collect(),
            Err(_) => return Err(MergeError::Transport("subscriber lock poisoned".to_string())),
        };
        if self.interrupted || targets.is_empty() {
            return Ok(());
        }

        let packet = encode(&Packet::Data {
            record: record.clone(),
        })?;
        if packet.len() > MAX_DATAGRAM {
            return Err(MergeError::Transport(format!(
                "record of {} bytes does not fit in a datagram",
                packet.len()
            )));
        }

        let mut dropped = Vec::new();
        for addr in targets {
            match socket.try_send_to(&packet, addr) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!(output = %self.name, %addr, "send buffer full; record skipped");
                }
                Err(e) => {
                    warn!(output = %self.name, %addr, error = %e, "dropping subscriber");
                    dropped.push(addr);
                }
            }
        }
        if !dropped.is_empty()
            && let Ok(mut subscribers) = self.subscribers.lock()
        {
            for addr in dropped {
                subscribers.remove(&addr);
            }
        }
        Ok(())
    }

    fn interrupt(&mut self) {
        self.interrupted = true;
    }

    fn close(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if self.socket.take().is_some() {
            if let Ok(mut subscribers) = self.subscribers.lock() {
                subscribers.clear();
            }
            self.names.unregister(&self.name);
        }
    }
}

impl Drop for UdpOutput {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portmerge_types::record;

    fn loopback() -> TransportSettings {
        TransportSettings {
            bind_host: "127.0.0.1".to_string(),
            ports: BTreeMap::new(),
        }
    }

    /// Settings naming `/remote:o` at a loopback port nobody is bound to.
    fn with_remote() -> Result<TransportSettings, Box<dyn std::error::Error>> {
        let addr = std::net::UdpSocket::bind("127.0.0.1:0")?.local_addr()?;
        let mut settings = loopback();
        settings.ports.insert("/remote:o".to_string(), addr.to_string());
        Ok(settings)
    }

    async fn wait_for_record(
        out: &mut Box<dyn OutputChannel>,
        input: &mut Box<dyn InputChannel>,
        record: &Record,
        attempts: usize,
    ) -> Result<Option<Record>, MergeError> {
        for _ in 0..attempts {
            out.write(record)?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(r) = input.try_read() {
                return Ok(Some(r));
            }
        }
        Ok(None)
    }

    #[tokio::test]
    async fn records_flow_after_subscription() -> Result<(), Box<dyn std::error::Error>> {
        let transport = UdpTransport::from_settings(&loopback())?;
        let mut out = transport.open_output("/sensor:o").await?;
        let mut input = transport.open_input("/merge/source1:i").await?;
        input.connect("/sensor:o").await?;

        let mut received = None;
        for _ in 0..100 {
            out.write(&record![1_i64, 2.5, record!["x"]])?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(r) = input.try_read() {
                received = Some(r);
                break;
            }
        }
        assert_eq!(received, Some(record![1_i64, 2.5, record!["x"]]));
        Ok(())
    }

    #[tokio::test]
    async fn connect_waits_for_the_producer_to_answer() -> Result<(), Box<dyn std::error::Error>> {
        let settings = with_remote()?;
        let consumer = UdpTransport::from_settings(&settings)?;
        let mut input = consumer.open_input("/merge/source1:i").await?;

        let pending = tokio::time::timeout(Duration::from_millis(300), input.connect("/remote:o")).await;
        assert!(pending.is_err(), "connected without a running producer");

        let producer = UdpTransport::from_settings(&settings)?;
        let mut out = producer.open_output("/remote:o").await?;
        tokio::time::timeout(Duration::from_secs(2), input.connect("/remote:o")).await??;

        let received = wait_for_record(&mut out, &mut input, &record![5_i64], 100).await?;
        assert_eq!(received, Some(record![5_i64]));
        Ok(())
    }

    #[tokio::test]
    async fn consumer_resubscribes_after_producer_restart() -> Result<(), Box<dyn std::error::Error>> {
        let settings = with_remote()?;
        let consumer = UdpTransport::from_settings(&settings)?;
        let mut input = consumer.open_input("/merge/source1:i").await?;

        let first = UdpTransport::from_settings(&settings)?;
        let mut out = first.open_output("/remote:o").await?;
        input.connect("/remote:o").await?;
        assert_eq!(
            wait_for_record(&mut out, &mut input, &record![1_i64], 100).await?,
            Some(record![1_i64])
        );

        out.close();
        drop(out);
        // The old socket is released once its listener task is torn down.
        let restarted = UdpTransport::from_settings(&settings)?;
        let mut out = None;
        for _ in 0..50 {
            match restarted.open_output("/remote:o").await {
                Ok(o) => {
                    out = Some(o);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        let mut out = out.ok_or("producer could not rebind its address")?;

        let received = wait_for_record(&mut out, &mut input, &record![2_i64], 300).await?;
        assert_eq!(received, Some(record![2_i64]));
        Ok(())
    }

    #[tokio::test]
    async fn connect_to_unknown_name_fails() -> Result<(), Box<dyn std::error::Error>> {
        let transport = UdpTransport::from_settings(&loopback())?;
        let mut input = transport.open_input("/in").await?;
        let err = input.connect("/missing:o").await.unwrap_err();
        assert!(matches!(err, MergeError::Connection { .. }));
        Ok(())
    }

    #[test]
    fn invalid_configured_address_is_rejected() {
        let mut settings = loopback();
        settings
            .ports
            .insert("/robot:o".to_string(), "not-an-address".to_string());
        let err = UdpTransport::from_settings(&settings).unwrap_err();
        assert!(matches!(err, MergeError::Configuration(_)));
    }

    #[test]
    fn configured_names_are_registered() -> Result<(), Box<dyn std::error::Error>> {
        let mut settings = loopback();
        settings
            .ports
            .insert("/robot:o".to_string(), "127.0.0.1:10005".to_string());
        let transport = UdpTransport::from_settings(&settings)?;
        assert!(transport.is_registered("/robot:o"));
        assert_eq!(transport.resolve("/robot:o"), Some("127.0.0.1:10005".parse::<SocketAddr>()?));
        assert!(!transport.is_registered("/other:o"));
        Ok(())
    }

    #[tokio::test]
    async fn close_frees_the_name() -> Result<(), Box<dyn std::error::Error>> {
        let transport = UdpTransport::from_settings(&loopback())?;
        let mut input = transport.open_input("/in").await?;
        assert!(transport.is_registered("/in"));
        input.close();
        assert!(!transport.is_registered("/in"));
        assert_eq!(input.try_read(), None);
        Ok(())
    }

    #[test]
    fn unspecified_producer_matches_any_ip_on_its_port() {
        let any: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        let local: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        assert!(same_peer(any, local));
        assert!(!same_peer(any, other));
        assert!(same_peer(local, local));
    }
}
