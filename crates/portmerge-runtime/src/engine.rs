//! [`MergeEngine`] – the periodic merge loop.
//!
//! Every period the engine drains each source to its newest record, replays
//! the active [`Selector`] tree over the cached records and writes the
//! result to a single output port named `<prefix>/output:o`.
//!
//! # Lifecycle
//!
//! | State | Reached by | Allows |
//! |---|---|---|
//! | `Unconfigured` | [`MergeEngine::new`] | `configure` |
//! | `Configured` | first successful `configure` | `configure`, `tick`, `run` |
//! | `Running` | `run` | `configure`, `tick`, frequency changes |
//! | `Closed` | `shutdown` | nothing; every call reports [`MergeError::Closed`] |
//!
//! Reconfiguration builds and connects the new sources before swapping them
//! in, so a failed `configure` leaves the previous format active.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use portmerge_middleware::{OutputChannel, Transport};
use portmerge_types::{MergeError, Record};
use tokio::sync::{Mutex, watch};
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::format::parse_format;
use crate::selector::Selector;
use crate::sources::SourceRegistry;

/// Default port prefix.
pub const DEFAULT_PREFIX: &str = "/lm/merge";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Startup parameters for a [`MergeEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Prefix of every port the engine opens.
    pub port_prefix: String,
    /// Time between merge ticks.
    pub period: Duration,
    /// How long a source may take to accept a connection.
    pub connect_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port_prefix: DEFAULT_PREFIX.to_string(),
            period: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Convert a tick frequency in Hz to a loop period.
///
/// # Errors
///
/// [`MergeError::Validation`] unless `hz` is finite, positive and yields a
/// representable, non-zero period.
pub fn period_from_hz(hz: f64) -> Result<Duration, MergeError> {
    if !hz.is_finite() || hz <= 0.0 {
        return Err(MergeError::Validation(format!(
            "frequency must be a positive number of Hz, got {hz}"
        )));
    }
    match Duration::try_from_secs_f64(1.0 / hz) {
        Ok(period) if !period.is_zero() => Ok(period),
        _ => Err(MergeError::Validation(format!(
            "frequency {hz} Hz is out of range"
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unconfigured,
    Configured,
    Running,
    Closed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Unconfigured => "unconfigured",
            EngineState::Configured => "configured",
            EngineState::Running => "running",
            EngineState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Session {
    selector: Arc<Selector>,
    sources: SourceRegistry,
}

struct Inner {
    state: EngineState,
    session: Option<Session>,
    output: Option<Box<dyn OutputChannel>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// MergeEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Periodic format-driven merger.
///
/// All methods take `&self`; share the engine through an [`Arc`] between the
/// loop task, the command console and signal handlers.
pub struct MergeEngine {
    transport: Arc<dyn Transport>,
    port_prefix: String,
    connect_timeout: Duration,
    inner: Mutex<Inner>,
    period: watch::Sender<Duration>,
    shutdown: watch::Sender<bool>,
}

impl MergeEngine {
    /// Create an unconfigured engine on top of `transport`.
    ///
    /// # Errors
    ///
    /// [`MergeError::Validation`] for a zero period.
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Result<Self, MergeError> {
        if config.period.is_zero() {
            return Err(MergeError::Validation(
                "merge period must be greater than zero".to_string(),
            ));
        }
        let (period, _) = watch::channel(config.period);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            transport,
            port_prefix: config.port_prefix.trim_end_matches('/').to_string(),
            connect_timeout: config.connect_timeout,
            inner: Mutex::new(Inner {
                state: EngineState::Unconfigured,
                session: None,
                output: None,
            }),
            period,
            shutdown,
        })
    }

    /// Name of the output port.
    pub fn output_name(&self) -> String {
        format!("{}/output:o", self.port_prefix)
    }

    pub async fn state(&self) -> EngineState {
        self.inner.lock().await.state
    }

    /// Current tick period.
    pub fn period(&self) -> Duration {
        *self.period.borrow()
    }

    /// Current tick frequency in Hz.
    pub fn frequency(&self) -> f64 {
        1.0 / self.period().as_secs_f64()
    }

    /// Change the tick frequency.  A running loop picks the new period up
    /// before its next tick.
    ///
    /// # Errors
    ///
    /// [`MergeError::Validation`] for a non-positive or non-finite `hz`.
    pub fn set_frequency(&self, hz: f64) -> Result<Duration, MergeError> {
        let period = period_from_hz(hz)?;
        self.period.send_replace(period);
        info!(hz, ?period, "merge frequency changed");
        Ok(period)
    }

    /// Install a new format, connecting every source it names.
    ///
    /// The output port is opened on the first successful call and kept for
    /// the lifetime of the engine.
    ///
    /// # Errors
    ///
    /// - [`MergeError::Syntax`] if the format is malformed.
    /// - [`MergeError::Configuration`] if it selects nothing.
    /// - [`MergeError::Connection`] if a source cannot be reached.
    /// - [`MergeError::Closed`] after shutdown.
    ///
    /// On error the previously installed format stays active.
    pub async fn configure(&self, format: &Record) -> Result<(), MergeError> {
        if self.state().await == EngineState::Closed {
            return Err(MergeError::Closed);
        }

        let selector = parse_format(format)?;
        if selector.is_empty() {
            return Err(MergeError::Configuration(
                "format selects nothing".to_string(),
            ));
        }

        let mut sources = SourceRegistry::new(
            Arc::clone(&self.transport),
            format!("{}/source", self.port_prefix),
            self.connect_timeout,
        );
        for name in selector.source_names() {
            sources.declare(name).await?;
        }

        let mut inner = self.inner.lock().await;
        if inner.state == EngineState::Closed {
            return Err(MergeError::Closed);
        }
        if inner.output.is_none() {
            inner.output = Some(self.transport.open_output(&self.output_name()).await?);
        }

        let source_count = sources.len();
        let previous = inner.session.replace(Session {
            selector: Arc::new(selector),
            sources,
        });
        if inner.state == EngineState::Unconfigured {
            inner.state = EngineState::Configured;
        }
        drop(inner);

        if let Some(mut old) = previous {
            old.sources.interrupt_all();
            old.sources.close_all();
        }
        info!(sources = source_count, output = %self.output_name(), "format installed");
        Ok(())
    }

    /// Indented dump of the active format, `None` before the first
    /// successful [`configure`](Self::configure).
    pub async fn describe(&self) -> Option<String> {
        let selector = {
            let inner = self.inner.lock().await;
            inner.session.as_ref().map(|s| Arc::clone(&s.selector))
        };
        selector.map(|s| s.to_string())
    }

    /// Run a single merge step: refresh, select, publish.
    ///
    /// Returns the record that was written.
    ///
    /// # Errors
    ///
    /// [`MergeError::IndexRange`] / [`MergeError::IndexType`] when cached data
    /// does not match the format; nothing is written in that case.
    /// [`MergeError::Configuration`] before configuration and
    /// [`MergeError::Closed`] after shutdown.
    pub async fn tick(&self) -> Result<Record, MergeError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.state == EngineState::Closed {
            return Err(MergeError::Closed);
        }
        let session = inner
            .session
            .as_mut()
            .ok_or_else(|| MergeError::Configuration("no format installed".to_string()))?;

        let fresh = session.sources.refresh_all();
        let mut out = Record::new();
        session.selector.select(&mut out, &session.sources)?;

        if let Some(output) = inner.output.as_mut() {
            output.write(&out)?;
        }
        debug!(fresh, elements = out.len(), "merged");
        Ok(out)
    }

    /// Tick at the configured period until [`shutdown`](Self::shutdown) or
    /// [`request_shutdown`](Self::request_shutdown) is called.
    ///
    /// Failed ticks are logged and skipped.  The engine is closed when this
    /// returns `Ok`.
    ///
    /// Every tick failure arrives as a [`MergeError`]; panics are not caught.
    /// Selection and the bundled transports report bad data and I/O through
    /// `Result`, so a panic here is a bug and ends the loop task.
    ///
    /// # Errors
    ///
    /// [`MergeError::Configuration`] when unconfigured or already running,
    /// [`MergeError::Closed`] after shutdown.
    pub async fn run(&self) -> Result<(), MergeError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                EngineState::Configured => inner.state = EngineState::Running,
                EngineState::Unconfigured => {
                    return Err(MergeError::Configuration(
                        "cannot run without a format".to_string(),
                    ));
                }
                EngineState::Running => {
                    return Err(MergeError::Configuration(
                        "merge loop is already running".to_string(),
                    ));
                }
                EngineState::Closed => return Err(MergeError::Closed),
            }
        }

        let mut period_rx = self.period.subscribe();
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = new_ticker(*period_rx.borrow_and_update());
        info!(period = ?ticker.period(), "merge loop started");

        let (mut merged, mut skipped) = (0_u64, 0_u64);
        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => match self.tick().await {
                    Ok(_) => merged += 1,
                    Err(MergeError::Closed) => break,
                    Err(e) => {
                        skipped += 1;
                        warn!(error = %e, "merge tick skipped");
                    }
                },
                changed = period_rx.changed() => {
                    if changed.is_ok() {
                        ticker = new_ticker(*period_rx.borrow_and_update());
                        debug!(period = ?ticker.period(), "merge loop re-timed");
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        self.shutdown().await;
        info!(merged, skipped, "merge loop stopped");
        Ok(())
    }

    /// Ask a running loop to stop.  Safe to call from any thread, including
    /// signal handlers; the loop closes the engine on its way out.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop the loop, interrupt and close every channel.  Idempotent.
    pub async fn shutdown(&self) {
        self.request_shutdown();
        let mut inner = self.inner.lock().await;
        if inner.state == EngineState::Closed {
            return;
        }
        inner.state = EngineState::Closed;

        if let Some(session) = inner.session.as_mut() {
            session.sources.interrupt_all();
        }
        if let Some(output) = inner.output.as_mut() {
            output.interrupt();
        }
        if let Some(mut session) = inner.session.take() {
            session.sources.close_all();
        }
        if let Some(mut output) = inner.output.take() {
            output.close();
        }
        info!("merge engine closed");
    }
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}
