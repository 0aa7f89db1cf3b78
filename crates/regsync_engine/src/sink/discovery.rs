//! Discovery-mode reconciliation: services and their instances.

use super::{cancellable, converted, diff, SinkCore, WatchKey, LOCAL_SINK_NAME};
use crate::error::EngineResult;
use regsync_model::{keys, Action, Instance, Request, Service, ServiceChangeEvent, ServiceKey};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

impl SinkCore {
    pub(super) async fn reconcile_services(self: &Arc<Self>, token: &CancellationToken) -> bool {
        let listed = match self.list_services(token).await {
            Ok(services) => services,
            Err(err) => {
                self.report(&err);
                return false;
            }
        };

        let current: HashMap<ServiceKey, Service> =
            listed.into_iter().map(|service| (service.key(), service)).collect();
        let changes = diff(&self.state.read().services, current);

        self.remove_services(&changes.removed);
        self.add_services(changes.added, token).await
    }

    async fn list_services(&self, token: &CancellationToken) -> EngineResult<Vec<Service>> {
        cancellable(token, self.reader.read(&Request::list_services()))
            .await?
            .into_services()
    }

    /// Drops vanished services from the snapshot and cancels their watches.
    ///
    /// Their instances are left in the destination.
    fn remove_services(&self, removed: &[ServiceKey]) {
        if removed.is_empty() {
            return;
        }
        for key in removed {
            self.unsubscribe(&WatchKey::Service(key.clone()));
            self.state.write().services.remove(key);
            info!(sink = LOCAL_SINK_NAME, service = %key, "service gone from source");
        }
        self.stats.write().removed += removed.len() as u64;
    }

    async fn add_services(self: &Arc<Self>, added: Vec<Service>, token: &CancellationToken) -> bool {
        if added.is_empty() {
            return true;
        }
        if let Err(err) = self.create_services(&added, token).await {
            self.report(&err);
            return false;
        }

        let mut ok = true;
        for service in added {
            let key = service.key();
            match self.sync_service(&key, token).await {
                Ok(()) => {
                    self.state.write().services.insert(key.clone(), service);
                    self.stats.write().added += 1;
                    info!(sink = LOCAL_SINK_NAME, service = %key, "service synced");
                }
                Err(err) => {
                    self.report(&err);
                    ok = false;
                }
            }
        }
        ok
    }

    async fn create_services(&self, services: &[Service], token: &CancellationToken) -> EngineResult<()> {
        let batch = self.transform(services)?;
        self.write(converted(Action::CreateServices, keys::SERVICE_LIST, batch), token)
            .await
    }

    /// Copies the full instance list of one service, then opens its watch.
    async fn sync_service(self: &Arc<Self>, key: &ServiceKey, token: &CancellationToken) -> EngineResult<()> {
        let instances = cancellable(
            token,
            self.reader
                .read(&Request::for_service(Action::ListInstances, key)),
        )
        .await?
        .into_instances()?;

        if !instances.is_empty() {
            self.write_instances(Action::CreateInstances, key, &instances, token)
                .await?;
        }

        let request = Request::for_service(Action::WatchService, key);
        match cancellable(token, self.reader.watch(&request)).await? {
            Some(stream) => self.subscribe(WatchKey::Service(key.clone()), stream, token),
            None => debug!(sink = LOCAL_SINK_NAME, service = %key, "source has no watch"),
        }
        Ok(())
    }

    async fn write_instances(
        &self,
        action: Action,
        key: &ServiceKey,
        instances: &[Instance],
        token: &CancellationToken,
    ) -> EngineResult<()> {
        let batch = self.transform(instances)?;
        let request = Request::for_service(action, key).with_param(keys::INSTANCE_LIST, batch);
        self.write(request, token).await
    }

    /// Writes the added and deleted instances of one change event.
    ///
    /// Updated instances are not propagated.
    pub(super) async fn apply_service_event(
        &self,
        key: &ServiceKey,
        event: ServiceChangeEvent,
        token: &CancellationToken,
    ) -> bool {
        let mut ok = true;
        if !event.add_instances.is_empty() {
            if let Err(err) = self
                .write_instances(Action::CreateInstances, key, &event.add_instances, token)
                .await
            {
                self.report(&err);
                ok = false;
            }
        }
        if !event.delete_instances.is_empty() {
            if let Err(err) = self
                .write_instances(Action::DeleteInstances, key, &event.delete_instances, token)
                .await
            {
                self.report(&err);
                ok = false;
            }
        }
        ok
    }
}
