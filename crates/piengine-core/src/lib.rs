//! Core orchestration for the PI engine.
//!
//! This crate ties scenes, apps, and plugins together under a lifecycle
//! orchestrator. Every lifecycle transition fans out one unit of work per
//! plugin or app through a structured `TaskGroup`, and scene access from
//! concurrently running tasks is coordinated by an `UpgradableLock` that lets
//! a reader upgrade to a writer without releasing its read hold.

pub mod app;
pub mod builtins;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod lock;
pub mod mock;
pub mod plugin;
pub mod scene;
pub mod snapshot;
pub mod task;
pub mod variants;

pub use app::{App, AppKind, SceneApp, SceneHooks};
pub use concurrency::{install_signal_handler, shutdown_requested, CancelToken};
pub use config::{
    load_scene_file, parse_manifest_file, parse_manifest_str, parse_scene_str, ConfigError,
    ConfigLoader, EngineManifest,
};
pub use engine::{
    AppReport, Engine, EngineCore, EngineOptions, EngineReport, HeadlessCore, RunOutcome,
};
pub use lifecycle::{validate_transition, AppStatus, Transition};
pub use lock::{LockError, LockState, ReadHold, UpgradableLock, WriteHold};
pub use plugin::{Plugin, PluginError, PluginRegistry};
pub use scene::{Light, LightKind, Scene, SceneNode, Transform};
pub use snapshot::SnapshotList;
pub use task::{TaskError, TaskFailure, TaskGroup, TaskHandle};
pub use variants::{create_app, HudApp, HudScene, MapApp, MapScene, WorldApp, WorldScene};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("fan-out failed: {0}")]
    Task(#[from] TaskFailure),
    #[error("operation cancelled")]
    Cancelled,
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("plugin not attached: {0}")]
    PluginNotAttached(String),
    #[error("app not managed by engine: {0}")]
    AppNotFound(String),
    #[error("app is terminated: {0}")]
    AppTerminated(String),
}

impl CoreError {
    /// True when the error only reports that the calling context was
    /// cancelled, as opposed to a unit of work actually failing.
    pub fn is_cancellation(&self) -> bool {
        match self {
            CoreError::Cancelled
            | CoreError::Lock(LockError::Cancelled)
            | CoreError::Plugin(PluginError::Lock(LockError::Cancelled)) => true,
            CoreError::Task(failure) => failure.root().is_cancellation(),
            _ => false,
        }
    }

    /// The configuration problem behind this error, looking through nested
    /// fan-outs.
    pub fn config_error(&self) -> Option<&ConfigError> {
        match self {
            CoreError::Config(err) => Some(err),
            CoreError::Task(failure) => failure.root().error().and_then(CoreError::config_error),
            _ => None,
        }
    }
}
