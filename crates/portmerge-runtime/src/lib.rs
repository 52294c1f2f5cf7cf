//! `portmerge-runtime` – The Merge Loop
//!
//! Reads records from any number of producer ports, picks elements out of
//! them according to a format, and publishes one merged record per tick.
//!
//! # Modules
//!
//! - [`format`] – parses a format (`(/imu:o[1-3] (/gps:o))`) into a
//!   [`Selector`] tree, validating port names and index syntax.
//! - [`selector`] – the [`Selector`] tree itself: leaves select by 1-based
//!   index paths, composites wrap their children in a nested record.
//! - [`sources`] – [`SourceRegistry`]: one connected input per producer,
//!   caching the newest record received.
//! - [`engine`] – [`MergeEngine`]: configure / run / tick / shutdown, with a
//!   live-adjustable tick frequency.
//! - [`console`] – `help`, `info`, `freq <hz>` and `quit` commands.
//! - [`telemetry`] – [`init_tracing`]: global `tracing` subscriber with an
//!   optional OTLP exporter.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use portmerge_middleware::{OutputChannel, PortBus, Transport};
//! use portmerge_runtime::{EngineConfig, MergeEngine, read_format};
//! use portmerge_types::record;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = PortBus::default();
//! let mut imu = bus.open_output("/imu:o").await?;
//! let engine = MergeEngine::new(Arc::new(bus.clone()), EngineConfig::default())?;
//!
//! engine.configure(&read_format("(/imu:o[2-3])")?).await?;
//!
//! imu.write(&record![0.1, 0.2, 0.3])?;
//! assert_eq!(engine.tick().await?, record![0.2, 0.3]);
//! # Ok(())
//! # }
//! ```

pub mod console;
pub mod engine;
pub mod format;
pub mod selector;
pub mod sources;
pub mod telemetry;

pub use console::{Command, Reply, respond};
pub use engine::{EngineConfig, EngineState, MergeEngine};
pub use format::{parse_format, parse_format_text, parse_port_spec, read_format};
pub use selector::{Dimension, IndexSelector, IndexSpec, Selector};
pub use sources::{Source, SourceRegistry};
pub use telemetry::{TracerProviderGuard, init_tracing};
