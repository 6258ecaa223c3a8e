use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::{AdapterContext, AdapterFactory, SetupStatus, SourceAdapter};
use crate::error::{AppError, Result};
use crate::models::{JsonMap, Plugin, Source};
use crate::session::{CredentialWriter, Session};

/// An adapter bound to its stored source and plugin rows.
pub struct LoadedAdapter {
    pub source: Source,
    pub plugin: Plugin,
    pub adapter: Box<dyn SourceAdapter>,
    pub credentials: CredentialWriter,
}

/// Adapters available at runtime, keyed by plugin id.
pub struct AdapterRegistry {
    factories: BTreeMap<String, Arc<dyn AdapterFactory>>,
    http: reqwest::Client,
}

impl AdapterRegistry {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            factories: BTreeMap::new(),
            http,
        }
    }

    /// Registry with the adapters that ship with the crate.
    pub fn with_builtins(http: reqwest::Client) -> Self {
        let mut registry = Self::new(http);
        registry.register(super::feed::FeedFactory);
        registry.register(super::filesystem::FilesystemFactory);
        registry
    }

    pub fn register(&mut self, factory: impl AdapterFactory + 'static) {
        self.factories
            .insert(factory.id().to_string(), Arc::new(factory));
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn factory(&self, id: &str) -> Result<Arc<dyn AdapterFactory>> {
        self.factories
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("plugin {}", id)))
    }

    /// Resolves a plugin id or a source name to a plugin id. A source name
    /// picks the source's preferred plugin, else the first one registered.
    pub async fn resolve(&self, session: &Session, name: &str) -> Result<String> {
        if self.factories.contains_key(name) {
            return Ok(name.to_string());
        }

        if let Some(source) = session.repo().get_source_by_name(name).await? {
            if let Some(plugin_id) = source.preferred_plugin_id {
                if let Some(plugin) = session.repo().get_plugin(plugin_id).await? {
                    if self.factories.contains_key(&plugin.name) {
                        return Ok(plugin.name);
                    }
                }
            }
        }

        self.factories
            .values()
            .find(|f| f.source().eq_ignore_ascii_case(name))
            .map(|f| f.id().to_string())
            .ok_or_else(|| AppError::NotFound(format!("plugin or source {}", name)))
    }

    /// Ensures the source and plugin rows exist and the stored config is
    /// migrated to the adapter's current version.
    async fn ensure_plugin(
        &self,
        session: &Session,
        factory: &dyn AdapterFactory,
    ) -> Result<(Source, Plugin)> {
        let repo = session.repo();
        let mut source = repo.ensure_source(factory.source()).await?;

        let mut plugin = match repo.get_plugin_by_name(factory.id()).await? {
            Some(plugin) => plugin,
            None => {
                info!(plugin = factory.id(), source = %source.name, "registering plugin");
                repo.insert_plugin(source.id, factory.id(), factory.version(), JsonMap::new())
                    .await?
            }
        };

        if plugin.source_id != source.id {
            return Err(AppError::Conflict(format!(
                "plugin {} belongs to another source",
                plugin.name
            )));
        }

        if plugin.version < factory.version() {
            info!(
                plugin = %plugin.name,
                from = plugin.version,
                to = factory.version(),
                "migrating plugin config"
            );
            factory.migrate(plugin.version, &mut plugin.config)?;
            plugin.version = factory.version();
            repo.update_plugin(plugin.id, plugin.version, &plugin.config)
                .await?;
        }

        if source.preferred_plugin_id.is_none() {
            repo.set_preferred_plugin(source.id, Some(plugin.id)).await?;
            source.preferred_plugin_id = Some(plugin.id);
        }

        Ok((source, plugin))
    }

    /// Merges `values` into the plugin config and reports whether it is usable.
    pub async fn setup(&self, session: &Session, id: &str, values: JsonMap) -> Result<SetupStatus> {
        let factory = self.factory(id)?;
        let (_, mut plugin) = self.ensure_plugin(session, factory.as_ref()).await?;

        if !values.is_empty() {
            plugin.config.extend(values);
            session
                .repo()
                .update_plugin_config(plugin.id, &plugin.config)
                .await?;
        }
        Ok(factory.setup(&plugin.config))
    }

    pub async fn load(&self, session: &Session, id: &str) -> Result<LoadedAdapter> {
        let factory = self.factory(id)?;
        let (source, plugin) = self.ensure_plugin(session, factory.as_ref()).await?;

        if let SetupStatus::MissingFields(fields) = factory.setup(&plugin.config) {
            return Err(AppError::Config(format!(
                "plugin {} is not set up, missing: {}",
                plugin.name,
                fields.join(", ")
            )));
        }

        let credentials = session.credential_writer(plugin.id);
        let adapter = factory.create(AdapterContext {
            config: plugin.config.clone(),
            credentials: credentials.clone(),
            http: self.http.clone(),
        })?;
        debug!(plugin = %plugin.name, source = %source.name, "loaded adapter");

        Ok(LoadedAdapter {
            source,
            plugin,
            adapter,
            credentials,
        })
    }
}
