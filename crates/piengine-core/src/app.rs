use crate::concurrency::CancelToken;
use crate::config::ConfigError;
use crate::lifecycle::{validate_transition, AppStatus, Transition};
use crate::plugin::Plugin;
use crate::scene::Scene;
use crate::snapshot::SnapshotList;
use crate::task::{self, TaskGroup};
use crate::CoreError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppKind {
    World,
    Map,
    Hud,
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppKind::World => write!(f, "world"),
            AppKind::Map => write!(f, "map"),
            AppKind::Hud => write!(f, "hud"),
        }
    }
}

impl FromStr for AppKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "world" => Ok(AppKind::World),
            "map" => Ok(AppKind::Map),
            "hud" => Ok(AppKind::Hud),
            other => Err(ConfigError::UnknownAppKind(other.to_owned())),
        }
    }
}

/// A sandboxed unit of the engine: one scene plus the plugins attached to it.
///
/// Every lifecycle method runs as one fan-out (scene work plus one task per
/// attached plugin) and only commits the new status when the whole fan-out
/// succeeded.
pub trait App: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> AppKind;

    fn status(&self) -> AppStatus;

    fn scene(&self) -> &Scene;

    fn initialize(&self) -> Result<(), CoreError>;

    fn start(&self) -> Result<(), CoreError>;

    /// Advance one frame. A no-op unless the app is running.
    fn update(&self, dt: f32) -> Result<(), CoreError> {
        self.update_with(dt, &CancelToken::new())
    }

    /// Like [`update`](Self::update), with the frame's work cancelled when
    /// `parent` is.
    fn update_with(&self, dt: f32, parent: &CancelToken) -> Result<(), CoreError>;

    fn pause(&self) -> Result<(), CoreError>;

    fn unpause(&self) -> Result<(), CoreError>;

    fn stop(&self) -> Result<(), CoreError>;

    /// Release the scene and shut down attached plugins. A no-op on an app
    /// that was never initialized or is already terminated.
    fn cleanup(&self) -> Result<(), CoreError>;

    fn add_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), CoreError>;

    fn remove_plugin(&self, plugin: &Arc<dyn Plugin>) -> Result<(), CoreError>;

    fn plugins(&self) -> Arc<Vec<Arc<dyn Plugin>>>;
}

impl fmt::Debug for dyn App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("status", &self.status())
            .finish()
    }
}

/// Scene work an app variant performs on each lifecycle step.
///
/// Each hook runs as one task of the step's fan-out, concurrently with the
/// plugin tasks, and may poll `cancel`.
pub trait SceneHooks: Send + Sync + 'static {
    fn kind(&self) -> AppKind;

    fn on_initialize(&self, _scene: &Scene, _cancel: &CancelToken) -> Result<(), CoreError> {
        Ok(())
    }

    fn on_start(&self, _scene: &Scene, _cancel: &CancelToken) -> Result<(), CoreError> {
        Ok(())
    }

    fn on_update(
        &self,
        _scene: &Scene,
        _dt: f32,
        _cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    fn on_pause(&self, _scene: &Scene, _cancel: &CancelToken) -> Result<(), CoreError> {
        Ok(())
    }

    fn on_unpause(&self, _scene: &Scene, _cancel: &CancelToken) -> Result<(), CoreError> {
        Ok(())
    }

    fn on_stop(&self, _scene: &Scene, _cancel: &CancelToken) -> Result<(), CoreError> {
        Ok(())
    }

    fn on_cleanup(&self, _scene: &Scene, _cancel: &CancelToken) -> Result<(), CoreError> {
        Ok(())
    }
}

/// [`App`] implementation shared by every variant; the variant only supplies
/// its [`SceneHooks`].
pub struct SceneApp<H> {
    id: String,
    hooks: H,
    scene: Scene,
    status: Mutex<AppStatus>,
    transitions: Mutex<()>,
    /// Held by transitions and by plugin attach/detach, but not by frames,
    /// so plugins can still be attached while a frame is running.
    membership: Mutex<()>,
    plugins: SnapshotList<Arc<dyn Plugin>>,
}

impl<H: SceneHooks> fmt::Debug for SceneApp<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneApp")
            .field("id", &self.id)
            .field("kind", &self.hooks.kind())
            .field("status", &self.status())
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

impl<H: SceneHooks> SceneApp<H> {
    pub fn new(id: impl Into<String>, scene: Scene, hooks: H) -> Self {
        Self {
            id: id.into(),
            hooks,
            scene,
            status: Mutex::new(AppStatus::Uninitialized),
            transitions: Mutex::new(()),
            membership: Mutex::new(()),
            plugins: SnapshotList::new(),
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Validate, fan out, then commit. Transitions of one app never overlap;
    /// `status()` stays readable while a fan-out is in flight.
    ///
    /// `fork_all` receives the plugin set as it was when the transition
    /// began. Attaching or detaching waits for the transition to finish, so
    /// cleanup shuts down exactly the plugins it then forgets.
    fn run_transition<'env, F>(
        &'env self,
        transition: Transition,
        fork_all: F,
    ) -> Result<(), CoreError>
    where
        F: for<'scope> FnOnce(&mut TaskGroup<'scope, 'env>, &[Arc<dyn Plugin>]),
    {
        let _serial = self.transitions.lock();
        let _members = self.membership.lock();
        let from = self.status();
        if transition.is_noop_from(from) {
            trace!("{}: {transition} ignored in state {from}", self.id);
            return Ok(());
        }
        validate_transition(from, transition)?;

        let plugins = self.plugins.snapshot();
        task::group(&format!("{}:{transition}", self.id), |g| {
            fork_all(g, plugins.as_slice());
        })?;

        let to = transition.target();
        if transition == Transition::Cleanup {
            self.plugins.clear();
        }
        *self.status.lock() = to;
        debug!("{}: {from} -> {to}", self.id);
        Ok(())
    }

    fn fork_scene_hook<'scope, F>(&'scope self, group: &mut TaskGroup<'scope, '_>, hook: F)
    where
        F: FnOnce(&H, &Scene, &CancelToken) -> Result<(), CoreError> + Send + 'scope,
    {
        let (hooks, scene) = (&self.hooks, &self.scene);
        group.fork("scene", move |cancel| hook(hooks, scene, cancel));
    }
}

impl<H: SceneHooks> App for SceneApp<H> {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AppKind {
        self.hooks.kind()
    }

    fn status(&self) -> AppStatus {
        *self.status.lock()
    }

    fn scene(&self) -> &Scene {
        &self.scene
    }

    fn initialize(&self) -> Result<(), CoreError> {
        self.run_transition(Transition::Initialize, |g, plugins| {
            self.fork_scene_hook(g, H::on_initialize);
            for plugin in plugins.iter() {
                let plugin = Arc::clone(plugin);
                let app: &dyn App = self;
                g.fork(plugin.name().to_owned(), move |_| {
                    plugin.init()?;
                    plugin.init_for_app(app)?;
                    Ok(())
                });
            }
        })
    }

    fn start(&self) -> Result<(), CoreError> {
        self.run_transition(Transition::Start, |g, _| {
            self.fork_scene_hook(g, H::on_start);
        })?;
        info!("app {} running", self.id);
        Ok(())
    }

    fn update_with(&self, dt: f32, parent: &CancelToken) -> Result<(), CoreError> {
        let _serial = self.transitions.lock();
        if self.status() != AppStatus::Running {
            return Ok(());
        }
        let plugins = self.plugins.snapshot();
        let (hooks, scene) = (&self.hooks, &self.scene);
        task::group_with(&format!("{}:update", self.id), Some(parent), |g| {
            g.fork("scene", move |cancel| hooks.on_update(scene, dt, cancel));
            for plugin in plugins.iter() {
                let plugin = Arc::clone(plugin);
                g.fork(plugin.name().to_owned(), move |cancel| {
                    plugin.update(dt)?;
                    plugin.process_scene(scene, cancel)?;
                    Ok(())
                });
            }
        })
    }

    fn pause(&self) -> Result<(), CoreError> {
        self.run_transition(Transition::Pause, |g, _| {
            self.fork_scene_hook(g, H::on_pause);
        })
    }

    fn unpause(&self) -> Result<(), CoreError> {
        self.run_transition(Transition::Unpause, |g, _| {
            self.fork_scene_hook(g, H::on_unpause);
        })
    }

    fn stop(&self) -> Result<(), CoreError> {
        self.run_transition(Transition::Stop, |g, _| {
            self.fork_scene_hook(g, H::on_stop);
        })?;
        info!("app {} stopped", self.id);
        Ok(())
    }

    fn cleanup(&self) -> Result<(), CoreError> {
        self.run_transition(Transition::Cleanup, |g, plugins| {
            self.fork_scene_hook(g, H::on_cleanup);
            for plugin in plugins.iter() {
                let plugin = Arc::clone(plugin);
                g.fork(plugin.name().to_owned(), move |_| {
                    plugin.shutdown().map_err(CoreError::from)
                });
            }
        })
    }

    fn add_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), CoreError> {
        let _members = self.membership.lock();
        if self.status() == AppStatus::Terminated {
            return Err(CoreError::AppTerminated(self.id.clone()));
        }
        let app: &dyn App = self;
        let name = plugin.name().to_owned();
        task::group(&format!("{}:add-plugin", self.id), |g| {
            let plugin = Arc::clone(&plugin);
            g.fork(name.clone(), move |_| {
                plugin.init()?;
                plugin.init_for_app(app)?;
                Ok(())
            });
        })?;
        self.plugins.push(plugin);
        debug!("{}: plugin '{name}' attached", self.id);
        Ok(())
    }

    fn remove_plugin(&self, plugin: &Arc<dyn Plugin>) -> Result<(), CoreError> {
        let _members = self.membership.lock();
        let name = plugin.name().to_owned();
        if !self.plugins.contains_where(|p| Arc::ptr_eq(p, plugin)) {
            return Err(CoreError::PluginNotAttached(name));
        }
        task::group(&format!("{}:remove-plugin", self.id), |g| {
            let plugin = Arc::clone(plugin);
            g.fork(name.clone(), move |_| plugin.shutdown().map_err(CoreError::from));
        })?;
        self.plugins.remove_where(|p| Arc::ptr_eq(p, plugin));
        debug!("{}: plugin '{name}' detached", self.id);
        Ok(())
    }

    fn plugins(&self) -> Arc<Vec<Arc<dyn Plugin>>> {
        self.plugins.snapshot()
    }
}
