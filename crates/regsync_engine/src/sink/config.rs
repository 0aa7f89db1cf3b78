//! Config-mode reconciliation: config files keyed by namespace, group and name.
//!
//! Mirrors the discovery loop, with one addition: a file whose content or
//! tags changed since the last tick is written as an update.

use super::{cancellable, converted, diff, SinkCore, WatchKey, LOCAL_SINK_NAME};
use crate::error::EngineResult;
use regsync_model::{
    keys, Action, ConfigChangeEvent, ConfigChangeKind, ConfigFile, ConfigFileKey, Request,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

impl SinkCore {
    pub(super) async fn reconcile_config_files(self: &Arc<Self>, token: &CancellationToken) -> bool {
        let listed = match cancellable(token, self.reader.read(&Request::list_config_files()))
            .await
            .and_then(|result| result.into_config_files())
        {
            Ok(files) => files,
            Err(err) => {
                self.report(&err);
                return false;
            }
        };

        let current: HashMap<ConfigFileKey, ConfigFile> =
            listed.into_iter().map(|file| (file.key(), file)).collect();
        let changes = diff(&self.state.read().config_files, current);

        for key in &changes.removed {
            self.unsubscribe(&WatchKey::ConfigFile(key.clone()));
            self.state.write().config_files.remove(key);
            info!(sink = LOCAL_SINK_NAME, file = %key, "config file gone from source");
        }
        self.stats.write().removed += changes.removed.len() as u64;

        let mut ok = true;
        if !changes.changed.is_empty() {
            match self
                .write_config_files(Action::UpdateConfigFiles, &changes.changed, token)
                .await
            {
                Ok(()) => {
                    let updated = changes.changed.len() as u64;
                    {
                        let mut state = self.state.write();
                        for file in changes.changed {
                            state.config_files.insert(file.key(), file);
                        }
                    }
                    self.stats.write().updated += updated;
                }
                Err(err) => {
                    self.report(&err);
                    ok = false;
                }
            }
        }
        if !changes.added.is_empty() {
            ok &= self.add_config_files(changes.added, token).await;
        }
        ok
    }

    async fn add_config_files(self: &Arc<Self>, added: Vec<ConfigFile>, token: &CancellationToken) -> bool {
        if let Err(err) = self
            .write_config_files(Action::CreateConfigFiles, &added, token)
            .await
        {
            self.report(&err);
            return false;
        }

        let mut ok = true;
        for file in added {
            let key = file.key();
            match self.watch_config_file(&key, token).await {
                Ok(()) => {
                    self.state.write().config_files.insert(key.clone(), file);
                    self.stats.write().added += 1;
                    info!(sink = LOCAL_SINK_NAME, file = %key, "config file synced");
                }
                Err(err) => {
                    self.report(&err);
                    ok = false;
                }
            }
        }
        ok
    }

    async fn watch_config_file(self: &Arc<Self>, key: &ConfigFileKey, token: &CancellationToken) -> EngineResult<()> {
        let request = Request::for_config_file(Action::WatchConfigFile, key);
        match cancellable(token, self.reader.watch(&request)).await? {
            Some(stream) => self.subscribe(WatchKey::ConfigFile(key.clone()), stream, token),
            None => debug!(sink = LOCAL_SINK_NAME, file = %key, "source has no watch"),
        }
        Ok(())
    }

    async fn write_config_files(
        &self,
        action: Action,
        files: &[ConfigFile],
        token: &CancellationToken,
    ) -> EngineResult<()> {
        let batch = self.transform(files)?;
        self.write(converted(action, keys::CONFIG_FILE_LIST, batch), token)
            .await
    }

    /// Writes one watched change.
    ///
    /// A written modification is committed to the snapshot so the next tick
    /// does not repeat it. A deletion is left for the tick to drop.
    pub(super) async fn apply_config_event(
        &self,
        key: &ConfigFileKey,
        event: ConfigChangeEvent,
        token: &CancellationToken,
    ) -> bool {
        let action = match event.kind {
            ConfigChangeKind::Modified => Action::UpdateConfigFiles,
            ConfigChangeKind::Deleted => Action::DeleteConfigFiles,
        };
        match self
            .write_config_files(action, std::slice::from_ref(&event.file), token)
            .await
        {
            Ok(()) => {
                if event.kind == ConfigChangeKind::Modified {
                    let mut state = self.state.write();
                    if state.subscriptions.contains_key(&WatchKey::ConfigFile(key.clone())) {
                        state.config_files.insert(key.clone(), event.file);
                    }
                    drop(state);
                    self.stats.write().updated += 1;
                }
                true
            }
            Err(err) => {
                self.report(&err);
                false
            }
        }
    }
}
