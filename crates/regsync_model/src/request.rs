//! Requests exchanged with readers and writers.
//!
//! A request is an action tag plus a string-keyed parameter bag. The typed
//! constructors and accessors below fix which keys each action uses, so
//! collaborators never have to agree on key names by convention alone.

use crate::configfile::{ConfigFile, ConfigFileKey};
use crate::discovery::{Instance, Service, ServiceKey};
use crate::error::{ModelError, ModelResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Parameter key names.
pub mod keys {
    /// `Vec<Service>` payload.
    pub const SERVICE_LIST: &str = "serviceList";
    /// `Vec<Instance>` payload.
    pub const INSTANCE_LIST: &str = "instanceList";
    /// `Vec<ConfigFile>` payload.
    pub const CONFIG_FILE_LIST: &str = "configFileList";
    /// Namespace name.
    pub const NAMESPACE: &str = "namespace";
    /// Service name.
    pub const SERVICE: &str = "service";
    /// Config group name.
    pub const GROUP: &str = "group";
    /// Config file name.
    pub const FILE_NAME: &str = "fileName";
}

/// What a request asks the collaborator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// List every service.
    ListServices,
    /// Create services.
    CreateServices,
    /// Update services.
    UpdateServices,
    /// Delete services.
    DeleteServices,
    /// Register instances of one service.
    CreateInstances,
    /// Update instances of one service.
    UpdateInstances,
    /// Deregister instances of one service.
    DeleteInstances,
    /// List the instances of one service.
    ListInstances,
    /// Subscribe to changes of one service.
    WatchService,
    /// List every config file.
    ListConfigFiles,
    /// Create config files.
    CreateConfigFiles,
    /// Update config files.
    UpdateConfigFiles,
    /// Delete config files.
    DeleteConfigFiles,
    /// Subscribe to changes of one config file.
    WatchConfigFile,
}

impl Action {
    /// Stable name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ListServices => "list_services",
            Action::CreateServices => "create_services",
            Action::UpdateServices => "update_services",
            Action::DeleteServices => "delete_services",
            Action::CreateInstances => "create_instances",
            Action::UpdateInstances => "update_instances",
            Action::DeleteInstances => "delete_instances",
            Action::ListInstances => "list_instances",
            Action::WatchService => "watch_service",
            Action::ListConfigFiles => "list_config_files",
            Action::CreateConfigFiles => "create_config_files",
            Action::UpdateConfigFiles => "update_config_files",
            Action::DeleteConfigFiles => "delete_config_files",
            Action::WatchConfigFile => "watch_config_file",
        }
    }

    /// Returns true for actions that modify the destination.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Action::CreateServices
                | Action::UpdateServices
                | Action::DeleteServices
                | Action::CreateInstances
                | Action::UpdateInstances
                | Action::DeleteInstances
                | Action::CreateConfigFiles
                | Action::UpdateConfigFiles
                | Action::DeleteConfigFiles
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter bag of a request.
pub type Params = BTreeMap<String, Value>;

/// An action plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Requested action.
    pub action: Action,
    /// Parameters.
    #[serde(default)]
    pub params: Params,
}

/// Request handed to a reader.
pub type ReadRequest = Request;
/// Request handed to a writer.
pub type WriteRequest = Request;
/// Request handed to a reader's watch.
pub type WatchRequest = Request;

impl Request {
    /// Creates a request with an empty parameter bag.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            params: Params::new(),
        }
    }

    /// Adds a raw parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Adds a parameter serialized from `value`.
    pub fn with_typed<T: Serialize + ?Sized>(
        self,
        key: impl Into<String>,
        value: &T,
    ) -> ModelResult<Self> {
        Ok(self.with_param(key, serde_json::to_value(value)?))
    }

    /// Returns a raw parameter.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Decodes a parameter, failing if it is absent.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> ModelResult<T> {
        let value = self
            .params
            .get(key)
            .ok_or_else(|| ModelError::MissingParam(key.to_string()))?;
        Ok(T::deserialize(value)?)
    }

    /// `ListServices`.
    pub fn list_services() -> Self {
        Self::new(Action::ListServices)
    }

    /// `ListConfigFiles`.
    pub fn list_config_files() -> Self {
        Self::new(Action::ListConfigFiles)
    }

    /// A request addressing one service by key (`ListInstances`, `WatchService`).
    pub fn for_service(action: Action, key: &ServiceKey) -> Self {
        Self::new(action)
            .with_param(keys::NAMESPACE, Value::String(key.namespace.clone()))
            .with_param(keys::SERVICE, Value::String(key.name.clone()))
    }

    /// A request carrying a service batch.
    pub fn with_services(action: Action, services: &[Service]) -> ModelResult<Self> {
        Self::new(action).with_typed(keys::SERVICE_LIST, services)
    }

    /// A request carrying an instance batch for one service.
    pub fn with_instances(
        action: Action,
        service: &ServiceKey,
        instances: &[Instance],
    ) -> ModelResult<Self> {
        Self::for_service(action, service).with_typed(keys::INSTANCE_LIST, instances)
    }

    /// A request addressing one config file by key (`WatchConfigFile`).
    pub fn for_config_file(action: Action, key: &ConfigFileKey) -> Self {
        Self::new(action)
            .with_param(keys::NAMESPACE, Value::String(key.namespace.clone()))
            .with_param(keys::GROUP, Value::String(key.group.clone()))
            .with_param(keys::FILE_NAME, Value::String(key.file_name.clone()))
    }

    /// A request carrying a config file batch.
    pub fn with_config_files(action: Action, files: &[ConfigFile]) -> ModelResult<Self> {
        Self::new(action).with_typed(keys::CONFIG_FILE_LIST, files)
    }

    /// The service key addressed by this request.
    pub fn service_key(&self) -> ModelResult<ServiceKey> {
        Ok(ServiceKey::new(
            self.param::<String>(keys::NAMESPACE)?,
            self.param::<String>(keys::SERVICE)?,
        ))
    }

    /// The config file key addressed by this request.
    pub fn config_file_key(&self) -> ModelResult<ConfigFileKey> {
        Ok(ConfigFileKey::new(
            self.param::<String>(keys::NAMESPACE)?,
            self.param::<String>(keys::GROUP)?,
            self.param::<String>(keys::FILE_NAME)?,
        ))
    }

    /// The service batch carried by this request.
    pub fn services(&self) -> ModelResult<Vec<Service>> {
        self.param(keys::SERVICE_LIST)
    }

    /// The instance batch carried by this request.
    pub fn instances(&self) -> ModelResult<Vec<Instance>> {
        self.param(keys::INSTANCE_LIST)
    }

    /// The config file batch carried by this request.
    pub fn config_files(&self) -> ModelResult<Vec<ConfigFile>> {
        self.param(keys::CONFIG_FILE_LIST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_request_carries_service_and_batch() {
        let key = ServiceKey::new("default", "orders");
        let instances = vec![Instance::new("10.0.0.1", 80), Instance::new("10.0.0.2", 80)];
        let req = Request::with_instances(Action::CreateInstances, &key, &instances).unwrap();

        assert_eq!(req.action, Action::CreateInstances);
        assert_eq!(req.service_key().unwrap(), key);
        assert_eq!(req.instances().unwrap(), instances);
    }

    #[test]
    fn missing_param_is_reported() {
        let req = Request::list_services();
        match req.services() {
            Err(ModelError::MissingParam(key)) => assert_eq!(key, keys::SERVICE_LIST),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wrong_shape_is_a_json_error() {
        let req = Request::new(Action::CreateServices)
            .with_param(keys::SERVICE_LIST, Value::String("nope".into()));
        assert!(matches!(req.services(), Err(ModelError::Json(_))));
    }

    #[test]
    fn config_file_key_round_trip() {
        let key = ConfigFileKey::new("ns", "group", "app.properties");
        let req = Request::for_config_file(Action::WatchConfigFile, &key);
        assert_eq!(req.config_file_key().unwrap(), key);
    }

    #[test]
    fn write_classification() {
        assert!(Action::CreateInstances.is_write());
        assert!(Action::DeleteConfigFiles.is_write());
        assert!(!Action::ListServices.is_write());
        assert!(!Action::WatchService.is_write());
        assert_eq!(Action::CreateServices.to_string(), "create_services");
    }
}
