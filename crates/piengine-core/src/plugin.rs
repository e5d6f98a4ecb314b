use crate::app::App;
use crate::concurrency::CancelToken;
use crate::config::ConfigError;
use crate::lock::LockError;
use crate::scene::Scene;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{plugin}' failed: {message}")]
    Failed { plugin: String, message: String },
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl PluginError {
    pub fn failed(plugin: &str, message: impl Into<String>) -> Self {
        PluginError::Failed {
            plugin: plugin.to_owned(),
            message: message.into(),
        }
    }
}

/// Engine extension point.
///
/// A plugin may be attached to the engine (global: `init`, `update`,
/// `shutdown` run on the engine's fan-outs) or to an app (local: the app also
/// calls `init_for_app` and `process_scene`). The same instance may be
/// driven from several threads at once, so implementations keep their state
/// behind interior mutability.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn update(&self, _dt: f32) -> Result<(), PluginError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn init_for_app(&self, _app: &dyn App) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once per frame for every app the plugin is attached to.
    /// Long traversals should poll `cancel`.
    fn process_scene(&self, _scene: &Scene, _cancel: &CancelToken) -> Result<(), PluginError> {
        Ok(())
    }
}

impl fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Plugin({})", self.name())
    }
}

type PluginFactory = Box<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Resolves plugin names from a manifest to fresh plugin instances.
#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the plugins shipped in this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtins::SCENE_STATS, || {
            Arc::new(crate::builtins::SceneStatsPlugin::new())
        });
        registry.register(crate::builtins::PRUNE_EMPTY, || {
            Arc::new(crate::builtins::PruneEmptyPlugin::new())
        });
        registry.register("mock", || Arc::new(crate::mock::MockPlugin::new("mock")));
        registry
    }

    /// Register (or replace) the factory for `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_owned(), Box::new(factory));
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn Plugin>, ConfigError> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(ConfigError::UnknownPlugin(name.to_owned())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Plugin for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn builtin_registry_resolves_shipped_plugins() {
        let registry = PluginRegistry::builtin();
        assert_eq!(registry.names(), vec!["mock", "prune-empty", "scene-stats"]);
        assert_eq!(registry.create("scene-stats").unwrap().name(), "scene-stats");
        assert_eq!(registry.create("prune-empty").unwrap().name(), "prune-empty");
        assert!(registry.contains("mock"));
    }

    #[test]
    fn unknown_plugin_is_a_config_error() {
        let err = PluginRegistry::builtin().create("nonexistent").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPlugin(ref name) if name == "nonexistent"));
    }

    #[test]
    fn each_create_returns_a_fresh_instance() {
        let mut registry = PluginRegistry::new();
        registry.register("named", || Arc::new(Named("named")));
        let a = registry.create("named").unwrap();
        let b = registry.create("named").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn default_hooks_succeed() {
        let plugin = Named("noop");
        assert!(plugin.init().is_ok());
        assert!(plugin.update(1.0 / 60.0).is_ok());
        assert!(plugin
            .process_scene(&Scene::new("s"), &CancelToken::new())
            .is_ok());
        assert!(plugin.shutdown().is_ok());
    }

    #[test]
    fn failed_error_names_the_plugin() {
        let err = PluginError::failed("physics", "diverged");
        assert_eq!(err.to_string(), "plugin 'physics' failed: diverged");
    }
}
