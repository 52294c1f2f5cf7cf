//! [`TransportRegistry`] – name-keyed transport constructors.
//!
//! Built once at startup and passed by reference to whoever needs to turn a
//! configured transport name into a live [`Transport`].

use std::collections::BTreeMap;
use std::sync::Arc;

use portmerge_types::MergeError;
use serde::{Deserialize, Serialize};

use crate::bus::PortBus;
use crate::transport::Transport;
use crate::udp::UdpTransport;

/// Constructor stored in the registry.
pub type TransportFactory = fn(&TransportSettings) -> Result<Arc<dyn Transport>, MergeError>;

/// Settings handed to every [`TransportFactory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Host that dynamically bound channels listen on.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Static name table: port name → socket address.  Remote producers must
    /// be listed here; local outputs listed here bind to the given address.
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            ports: BTreeMap::new(),
        }
    }
}

/// Explicit map from transport name to constructor.
///
/// # Example
///
/// ```
/// use portmerge_middleware::{TransportRegistry, TransportSettings};
///
/// let registry = TransportRegistry::with_defaults();
/// let transport = registry.create("local", &TransportSettings::default());
/// assert!(transport.is_ok());
/// assert!(registry.create("carrier-pigeon", &TransportSettings::default()).is_err());
/// ```
#[derive(Default)]
pub struct TransportRegistry {
    factories: BTreeMap<String, TransportFactory>,
}

impl TransportRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in `local` and `udp` transports.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("local", local_transport);
        registry.register("udp", udp_transport);
        registry
    }

    /// Register a constructor.  Any previous constructor with the same name
    /// is replaced.
    pub fn register(&mut self, name: impl Into<String>, factory: TransportFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Construct the transport registered as `name`.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Configuration`] for unknown names, or whatever
    /// the constructor itself reports.
    pub fn create(
        &self,
        name: &str,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn Transport>, MergeError> {
        match self.factories.get(name) {
            Some(factory) => factory(settings),
            None => Err(MergeError::Configuration(format!(
                "unknown transport '{name}' (known: {})",
                self.names().collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

fn local_transport(_: &TransportSettings) -> Result<Arc<dyn Transport>, MergeError> {
    let bus: Arc<dyn Transport> = Arc::new(PortBus::default());
    Ok(bus)
}

fn udp_transport(settings: &TransportSettings) -> Result<Arc<dyn Transport>, MergeError> {
    let udp: Arc<dyn Transport> = Arc::new(UdpTransport::from_settings(settings)?);
    Ok(udp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_local_and_udp() {
        let registry = TransportRegistry::with_defaults();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["local", "udp"]);
    }

    #[test]
    fn unknown_transport_lists_known_names() {
        let registry = TransportRegistry::with_defaults();
        let err = registry
            .create("serial", &TransportSettings::default())
            .err()
            .expect("serial is not registered");
        assert!(matches!(err, MergeError::Configuration(_)));
        assert!(err.to_string().contains("local, udp"));
    }

    #[test]
    fn factory_errors_propagate() {
        let registry = TransportRegistry::with_defaults();
        let mut settings = TransportSettings::default();
        settings.ports.insert("/x".to_string(), "bogus".to_string());
        assert!(registry.create("udp", &settings).is_err());
    }

    #[test]
    fn custom_factory_replaces_builtin() {
        fn always_fails(_: &TransportSettings) -> Result<Arc<dyn Transport>, MergeError> {
            Err(MergeError::Transport("offline".to_string()))
        }
        let mut registry = TransportRegistry::with_defaults();
        registry.register("local", always_fails);
        assert!(matches!(
            registry.create("local", &TransportSettings::default()),
            Err(MergeError::Transport(_))
        ));
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: TransportSettings = serde_json::from_str(r#"{"ports": {"/a:o": "127.0.0.1:9000"}}"#).unwrap();
        assert_eq!(settings.bind_host, "127.0.0.1");
        assert_eq!(settings.ports.get("/a:o").map(String::as_str), Some("127.0.0.1:9000"));
    }
}
