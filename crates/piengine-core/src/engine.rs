use crate::app::{App, AppKind};
use crate::concurrency::{shutdown_requested, CancelToken};
use crate::config::ConfigLoader;
use crate::lifecycle::AppStatus;
use crate::plugin::Plugin;
use crate::snapshot::SnapshotList;
use crate::task;
use crate::CoreError;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Platform bring-up performed once, concurrently with configuration loading.
pub trait EngineCore: Send + Sync {
    fn name(&self) -> &str;

    fn initialize_core(&self, _cancel: &CancelToken) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Core with nothing to bring up, for tools and tests.
#[derive(Debug, Default)]
pub struct HeadlessCore;

impl EngineCore for HeadlessCore {
    fn name(&self) -> &'static str {
        "headless"
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineOptions {
    /// Seconds advanced per tick.
    pub fixed_dt: f32,
    /// Stop after this many ticks of one `run`.
    pub max_ticks: Option<u64>,
    /// Sleep to the next frame boundary after each tick.
    pub pace: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_fps(60)
    }
}

impl EngineOptions {
    pub fn from_fps(fps: u32) -> Self {
        Self {
            fixed_dt: 1.0 / fps.max(1) as f32,
            max_ticks: None,
            pace: true,
        }
    }

    fn frame(&self) -> Duration {
        Duration::try_from_secs_f32(self.fixed_dt).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// A stop was requested.
    Stopped { ticks: u64 },
    /// `max_ticks` was reached.
    TickLimit { ticks: u64 },
}

impl RunOutcome {
    pub fn ticks(&self) -> u64 {
        match self {
            RunOutcome::Stopped { ticks } | RunOutcome::TickLimit { ticks } => *ticks,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppReport {
    pub id: String,
    pub kind: AppKind,
    pub status: AppStatus,
    pub nodes: usize,
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub core: String,
    pub running: bool,
    pub ticks: u64,
    pub apps: Vec<AppReport>,
    pub plugins: Vec<String>,
}

/// Top-level orchestrator: owns the active apps and the global plugins and
/// drives them one fan-out per tick.
///
/// All methods take `&self`, so an engine can be shared with the tasks that
/// configure it and stopped from another thread while `run` is looping.
pub struct Engine {
    core: Box<dyn EngineCore>,
    options: Mutex<EngineOptions>,
    running: AtomicBool,
    stop: Mutex<CancelToken>,
    ticks: AtomicU64,
    apps: SnapshotList<Arc<dyn App>>,
    plugins: SnapshotList<Arc<dyn Plugin>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(HeadlessCore)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("core", &self.core.name())
            .field("running", &self.is_running())
            .field("ticks", &self.ticks())
            .field("apps", &self.apps)
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(core: impl EngineCore + 'static) -> Self {
        Self {
            core: Box::new(core),
            options: Mutex::new(EngineOptions::default()),
            running: AtomicBool::new(false),
            stop: Mutex::new(CancelToken::new()),
            ticks: AtomicU64::new(0),
            apps: SnapshotList::new(),
            plugins: SnapshotList::new(),
        }
    }

    pub fn headless() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_options(self, options: EngineOptions) -> Self {
        self.set_options(options);
        self
    }

    pub fn options(&self) -> EngineOptions {
        *self.options.lock()
    }

    pub fn set_options(&self, options: EngineOptions) {
        *self.options.lock() = options;
    }

    /// Bring up the core and apply `loader`'s manifest concurrently.
    ///
    /// Engine options are taken from the manifest before the fan-out starts.
    pub fn initialize(&self, loader: &ConfigLoader) -> Result<(), CoreError> {
        info!("initializing engine (core: {})", self.core.name());
        self.set_options(loader.engine_options());
        let core = self.core.as_ref();
        task::group("initialize", |g| {
            g.fork("core", move |cancel| core.initialize_core(cancel));
            g.fork("config", move |_| loader.load(self));
        })?;
        info!(
            "engine initialized: {} apps, {} plugins",
            self.apps.len(),
            self.plugins.len()
        );
        Ok(())
    }

    /// Tick until stopped, failed, or the tick limit is reached.
    ///
    /// A stop request ([`request_stop`](Self::request_stop), [`close`](Self::close)
    /// from another thread, or Ctrl-C) ends the loop with
    /// [`RunOutcome::Stopped`], even when it interrupted a tick. Any other
    /// failure ends the loop and is returned.
    ///
    /// A stop requested while no loop is running is kept for the next call,
    /// which then returns `Stopped { ticks: 0 }` without ticking. Each stop
    /// request ends exactly one `run`.
    pub fn run(&self) -> Result<RunOutcome, CoreError> {
        let token = {
            let mut stop = self.stop.lock();
            if stop.is_cancelled() || shutdown_requested() {
                *stop = CancelToken::new();
                info!("engine stop was requested before the loop started");
                return Ok(RunOutcome::Stopped { ticks: 0 });
            }
            self.running.store(true, Ordering::SeqCst);
            stop.clone()
        };
        let options = self.options();
        info!(
            "engine running: dt={:.4}s max_ticks={:?}",
            options.fixed_dt, options.max_ticks
        );

        let mut ticks = 0;
        let mut next_frame = Instant::now();
        let outcome = loop {
            if self.stop_requested(&token) {
                break Ok(RunOutcome::Stopped { ticks });
            }
            if options.max_ticks.is_some_and(|max| ticks >= max) {
                break Ok(RunOutcome::TickLimit { ticks });
            }
            if let Err(err) = self.tick_with(&token, options.fixed_dt) {
                if self.stop_requested(&token) {
                    debug!("tick interrupted by stop request: {err}");
                    break Ok(RunOutcome::Stopped { ticks });
                }
                break Err(err);
            }
            ticks += 1;

            if options.pace {
                next_frame += options.frame();
                let now = Instant::now();
                if next_frame > now {
                    thread::sleep(next_frame - now);
                } else {
                    next_frame = now;
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        if matches!(outcome, Ok(RunOutcome::Stopped { .. })) {
            self.rearm_stop();
        }
        match &outcome {
            Ok(done) => info!("engine loop ended after {} ticks", done.ticks()),
            Err(err) => warn!("engine loop failed after {ticks} ticks: {err}"),
        }
        outcome
    }

    /// Consume a delivered stop request so the next `run` can loop again.
    fn rearm_stop(&self) {
        *self.stop.lock() = CancelToken::new();
    }

    fn stop_requested(&self, token: &CancelToken) -> bool {
        if shutdown_requested() {
            token.cancel();
        }
        token.is_cancelled() || !self.running.load(Ordering::SeqCst)
    }

    /// Run a single frame with the configured time step, outside of `run`.
    pub fn tick(&self) -> Result<(), CoreError> {
        self.tick_with(&CancelToken::new(), self.options().fixed_dt)
    }

    fn tick_with(&self, parent: &CancelToken, dt: f32) -> Result<(), CoreError> {
        let apps = self.apps.snapshot();
        let plugins = self.plugins.snapshot();
        task::group_with("tick", Some(parent), |g| {
            for app in apps.iter().filter(|app| app.status() == AppStatus::Running) {
                let app = Arc::clone(app);
                g.fork(format!("app:{}", app.id()), move |cancel| app.update_with(dt, cancel));
            }
            for plugin in plugins.iter() {
                let plugin = Arc::clone(plugin);
                g.fork(format!("plugin:{}", plugin.name()), move |_| {
                    plugin.update(dt).map_err(CoreError::from)
                });
            }
        })?;
        self.ticks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Ask a running loop to stop after (or during) the current tick. With
    /// no loop running, the next [`run`](Self::run) stops before ticking.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.lock().cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ticks completed over the engine's lifetime.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Stop the loop, stop and clean up every app, shut down every global
    /// plugin, then forget all of them.
    ///
    /// Both collections are cleared even when part of the teardown failed;
    /// the first failure is returned. Closing an engine with nothing left to
    /// tear down does nothing.
    pub fn close(&self) -> Result<(), CoreError> {
        self.request_stop();
        let apps = self.apps.snapshot();
        let plugins = self.plugins.snapshot();
        if apps.is_empty() && plugins.is_empty() {
            return Ok(());
        }

        info!(
            "closing engine: {} apps, {} plugins",
            apps.len(),
            plugins.len()
        );
        let result = task::group("close", |g| {
            for app in apps.iter() {
                let app = Arc::clone(app);
                g.fork(format!("app:{}", app.id()), move |_| {
                    if matches!(app.status(), AppStatus::Running | AppStatus::Paused) {
                        app.stop()?;
                    }
                    app.cleanup()
                });
            }
            for plugin in plugins.iter() {
                let plugin = Arc::clone(plugin);
                g.fork(format!("plugin:{}", plugin.name()), move |_| {
                    plugin.shutdown().map_err(CoreError::from)
                });
            }
        });

        self.apps.clear();
        self.plugins.clear();
        result
    }

    /// Initialize a global plugin and add it to the tick.
    pub fn load_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), CoreError> {
        let name = plugin.name().to_owned();
        task::group("load-plugin", |g| {
            let plugin = Arc::clone(&plugin);
            g.fork(name.clone(), move |_| plugin.init().map_err(CoreError::from));
        })?;
        self.plugins.push(plugin);
        info!("plugin '{name}' loaded");
        Ok(())
    }

    pub fn unload_plugin(&self, plugin: &Arc<dyn Plugin>) -> Result<(), CoreError> {
        let name = plugin.name().to_owned();
        if !self.plugins.contains_where(|p| Arc::ptr_eq(p, plugin)) {
            return Err(CoreError::PluginNotAttached(name));
        }
        task::group("unload-plugin", |g| {
            let plugin = Arc::clone(plugin);
            g.fork(name.clone(), move |_| plugin.shutdown().map_err(CoreError::from));
        })?;
        self.plugins.remove_where(|p| Arc::ptr_eq(p, plugin));
        info!("plugin '{name}' unloaded");
        Ok(())
    }

    /// Initialize `app` if needed, start it, and make it part of the tick.
    pub fn start_app(&self, app: Arc<dyn App>) -> Result<(), CoreError> {
        let id = app.id().to_owned();
        task::group("start-app", |g| {
            let app = Arc::clone(&app);
            g.fork(id.clone(), move |_| {
                if app.status() == AppStatus::Uninitialized {
                    app.initialize()?;
                }
                app.start()
            });
        })?;
        self.apps.push_unique(app, |a, b| Arc::ptr_eq(a, b));
        Ok(())
    }

    /// Stop and clean up a managed app, then drop it from the tick.
    pub fn stop_app(&self, app: &Arc<dyn App>) -> Result<(), CoreError> {
        self.ensure_managed(app)?;
        task::group("stop-app", |g| {
            let app = Arc::clone(app);
            g.fork(app.id().to_owned(), move |_| {
                if matches!(app.status(), AppStatus::Running | AppStatus::Paused) {
                    app.stop()?;
                }
                app.cleanup()
            });
        })?;
        self.apps.remove_where(|a| Arc::ptr_eq(a, app));
        Ok(())
    }

    pub fn pause_app(&self, app: &Arc<dyn App>) -> Result<(), CoreError> {
        self.ensure_managed(app)?;
        task::group("pause-app", |g| {
            let app = Arc::clone(app);
            g.fork(app.id().to_owned(), move |_| app.pause());
        })
    }

    pub fn unpause_app(&self, app: &Arc<dyn App>) -> Result<(), CoreError> {
        self.ensure_managed(app)?;
        task::group("unpause-app", |g| {
            let app = Arc::clone(app);
            g.fork(app.id().to_owned(), move |_| app.unpause());
        })
    }

    fn ensure_managed(&self, app: &Arc<dyn App>) -> Result<(), CoreError> {
        if self.apps.contains_where(|a| Arc::ptr_eq(a, app)) {
            Ok(())
        } else {
            Err(CoreError::AppNotFound(app.id().to_owned()))
        }
    }

    pub fn apps(&self) -> Arc<Vec<Arc<dyn App>>> {
        self.apps.snapshot()
    }

    pub fn app(&self, id: &str) -> Option<Arc<dyn App>> {
        self.apps.snapshot().iter().find(|a| a.id() == id).cloned()
    }

    pub fn plugins(&self) -> Arc<Vec<Arc<dyn Plugin>>> {
        self.plugins.snapshot()
    }

    pub fn status_report(&self) -> EngineReport {
        EngineReport {
            core: self.core.name().to_owned(),
            running: self.is_running(),
            ticks: self.ticks(),
            apps: self
                .apps
                .snapshot()
                .iter()
                .map(|app| AppReport {
                    id: app.id().to_owned(),
                    kind: app.kind(),
                    status: app.status(),
                    nodes: app.scene().len(),
                    plugins: app.plugins().iter().map(|p| p.name().to_owned()).collect(),
                })
                .collect(),
            plugins: self
                .plugins
                .snapshot()
                .iter()
                .map(|p| p.name().to_owned())
                .collect(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("engine teardown on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPlugin, PluginCallKind};
    use crate::scene::Scene;
    use crate::variants::create_app;

    fn engine() -> Engine {
        Engine::headless().with_options(EngineOptions {
            pace: false,
            ..EngineOptions::default()
        })
    }

    fn world(id: &str) -> Arc<dyn App> {
        create_app(AppKind::World, id, Scene::new(id))
    }

    #[test]
    fn options_from_fps() {
        let options = EngineOptions::from_fps(30);
        assert!((options.fixed_dt - 1.0 / 30.0).abs() < f32::EPSILON);
        assert!(options.pace);
        assert!((EngineOptions::default().fixed_dt - 1.0 / 60.0).abs() < f32::EPSILON);
    }

    #[test]
    fn start_app_initializes_and_registers() {
        let engine = engine();
        let app = world("w");
        engine.start_app(Arc::clone(&app)).unwrap();
        assert_eq!(app.status(), AppStatus::Running);
        assert_eq!(engine.apps().len(), 1);
        assert!(engine.app("w").is_some());
    }

    #[test]
    fn tick_updates_global_plugins() {
        let engine = engine();
        let mock = Arc::new(MockPlugin::new("g"));
        engine.load_plugin(mock.clone()).unwrap();
        engine.tick().unwrap();
        engine.tick().unwrap();
        assert_eq!(mock.count(PluginCallKind::Init), 1);
        assert_eq!(mock.count(PluginCallKind::Update), 2);
        assert_eq!(engine.ticks(), 2);
    }

    #[test]
    fn run_stops_at_tick_limit() {
        let engine = engine();
        engine.set_options(EngineOptions {
            max_ticks: Some(5),
            ..engine.options()
        });
        let outcome = engine.run().unwrap();
        assert_eq!(outcome, RunOutcome::TickLimit { ticks: 5 });
        assert!(!engine.is_running());
    }

    #[test]
    fn stop_requested_before_run_ends_that_run_only() {
        let engine = Engine::headless().with_options(EngineOptions {
            pace: false,
            max_ticks: Some(50),
            ..EngineOptions::default()
        });
        engine.start_app(world("w")).unwrap();

        engine.request_stop();
        assert_eq!(engine.run().unwrap(), RunOutcome::Stopped { ticks: 0 });
        assert_eq!(engine.ticks(), 0);
        assert!(!engine.is_running());

        assert_eq!(engine.run().unwrap(), RunOutcome::TickLimit { ticks: 50 });
    }

    #[test]
    fn run_after_close_does_not_tick() {
        let engine = engine();
        engine.start_app(world("w")).unwrap();
        engine.close().unwrap();
        assert_eq!(engine.run().unwrap(), RunOutcome::Stopped { ticks: 0 });
    }

    #[test]
    fn pause_and_unpause_are_routed_to_managed_apps() {
        let engine = engine();
        let app = world("w");
        engine.start_app(Arc::clone(&app)).unwrap();
        engine.pause_app(&app).unwrap();
        assert_eq!(app.status(), AppStatus::Paused);
        engine.unpause_app(&app).unwrap();
        assert_eq!(app.status(), AppStatus::Running);

        let stranger = world("x");
        assert!(matches!(
            engine.pause_app(&stranger),
            Err(CoreError::AppNotFound(_))
        ));
    }

    #[test]
    fn stop_app_cleans_up_and_forgets() {
        let engine = engine();
        let app = world("w");
        engine.start_app(Arc::clone(&app)).unwrap();
        engine.stop_app(&app).unwrap();
        assert_eq!(app.status(), AppStatus::Terminated);
        assert!(engine.apps().is_empty());
    }

    #[test]
    fn unload_plugin_shuts_it_down() {
        let engine = engine();
        let mock = Arc::new(MockPlugin::new("g"));
        let handle: Arc<dyn Plugin> = mock.clone();
        engine.load_plugin(Arc::clone(&handle)).unwrap();
        engine.unload_plugin(&handle).unwrap();
        assert!(engine.plugins().is_empty());
        assert_eq!(mock.count(PluginCallKind::Shutdown), 1);
        assert!(matches!(
            engine.unload_plugin(&handle),
            Err(CoreError::PluginNotAttached(_))
        ));
    }

    #[test]
    fn status_report_lists_apps_and_plugins() {
        let engine = engine();
        engine.start_app(world("w")).unwrap();
        engine.load_plugin(Arc::new(MockPlugin::new("g"))).unwrap();
        let report = engine.status_report();
        assert_eq!(report.core, "headless");
        assert_eq!(report.apps.len(), 1);
        assert_eq!(report.apps[0].status, AppStatus::Running);
        assert_eq!(report.plugins, vec!["g"]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["apps"][0]["kind"], "world");
        assert_eq!(json["apps"][0]["status"], "running");
    }

    #[test]
    fn run_outcome_serializes_with_tag() {
        let json = serde_json::to_value(RunOutcome::TickLimit { ticks: 4 }).unwrap();
        assert_eq!(json["outcome"], "tick_limit");
        assert_eq!(json["ticks"], 4);
    }

    #[test]
    fn drop_tears_down() {
        let mock = Arc::new(MockPlugin::new("g"));
        {
            let engine = engine();
            engine.load_plugin(mock.clone()).unwrap();
        }
        assert_eq!(mock.count(PluginCallKind::Shutdown), 1);
    }
}
