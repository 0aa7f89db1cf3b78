//! Service registry model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Identity of a service: `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Namespace the service lives in.
    pub namespace: String,
    /// Service name.
    pub name: String,
}

impl ServiceKey {
    /// Creates a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// A service as seen by a registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Namespace the service lives in.
    pub namespace: String,
    /// Service name.
    pub name: String,
    /// String labels.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Vendor-specific attributes, opaque to the engine.
    #[serde(default)]
    pub property: HashMap<String, Value>,
}

impl Service {
    /// Creates a service with no metadata.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Adds a property entry.
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.property.insert(key.into(), value);
        self
    }

    /// The identity key of this service.
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// One endpoint of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Identity assigned by the registry that stores the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Host or IP address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// String labels.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Vendor-specific attributes.
    #[serde(default)]
    pub property: HashMap<String, Value>,
}

impl Instance {
    /// Creates an instance without an id.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Sets the registry-assigned id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `host:port`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An incremental change to one service's instances.
///
/// `update_instances` is carried for completeness; the engine does not act
/// on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceChangeEvent {
    /// Service the change belongs to.
    pub service: Service,
    /// Instances that appeared.
    #[serde(default)]
    pub add_instances: Vec<Instance>,
    /// Instances that disappeared.
    #[serde(default)]
    pub delete_instances: Vec<Instance>,
    /// Instances whose attributes changed.
    #[serde(default)]
    pub update_instances: Vec<Instance>,
}

impl ServiceChangeEvent {
    /// An event announcing new instances.
    pub fn added(service: Service, instances: Vec<Instance>) -> Self {
        Self {
            service,
            add_instances: instances,
            ..Self::default()
        }
    }

    /// An event announcing removed instances.
    pub fn deleted(service: Service, instances: Vec<Instance>) -> Self {
        Self {
            service,
            delete_instances: instances,
            ..Self::default()
        }
    }

    /// Returns true if the event carries no instance changes at all.
    pub fn is_empty(&self) -> bool {
        self.add_instances.is_empty()
            && self.delete_instances.is_empty()
            && self.update_instances.is_empty()
    }
}
