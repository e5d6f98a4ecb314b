use crate::app::App;
use crate::concurrency::CancelToken;
use crate::plugin::{Plugin, PluginError};
use crate::scene::Scene;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginCallKind {
    Init,
    InitForApp,
    Update,
    ProcessScene,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PluginCall {
    Init,
    InitForApp(String),
    Update(f32),
    ProcessScene(String),
    Shutdown,
}

impl PluginCall {
    pub fn kind(&self) -> PluginCallKind {
        match self {
            PluginCall::Init => PluginCallKind::Init,
            PluginCall::InitForApp(_) => PluginCallKind::InitForApp,
            PluginCall::Update(_) => PluginCallKind::Update,
            PluginCall::ProcessScene(_) => PluginCallKind::ProcessScene,
            PluginCall::Shutdown => PluginCallKind::Shutdown,
        }
    }
}

/// Plugin that records every call it receives. Used by tests and by the
/// `mock` entry of the built-in registry.
#[derive(Debug)]
pub struct MockPlugin {
    name: String,
    calls: Mutex<Vec<PluginCall>>,
    failing: HashSet<PluginCallKind>,
    delay: Option<Duration>,
}

impl MockPlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            calls: Mutex::new(Vec::new()),
            failing: HashSet::new(),
            delay: None,
        }
    }

    /// Fail every call of `kind` (the call is still recorded).
    #[must_use]
    pub fn failing_on(mut self, kind: PluginCallKind) -> Self {
        self.failing.insert(kind);
        self
    }

    /// Sleep this long inside every call, waking early on cancellation where
    /// a token is available.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<PluginCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, kind: PluginCallKind) -> usize {
        self.calls.lock().iter().filter(|c| c.kind() == kind).count()
    }

    fn record(&self, call: PluginCall, cancel: Option<&CancelToken>) -> Result<(), PluginError> {
        let kind = call.kind();
        self.calls.lock().push(call);
        if let Some(delay) = self.delay {
            let started = Instant::now();
            while started.elapsed() < delay {
                if cancel.is_some_and(CancelToken::is_cancelled) {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
        if self.failing.contains(&kind) {
            return Err(PluginError::failed(&self.name, format!("{kind:?} failed")));
        }
        Ok(())
    }
}

impl Plugin for MockPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> Result<(), PluginError> {
        self.record(PluginCall::Init, None)
    }

    fn update(&self, dt: f32) -> Result<(), PluginError> {
        self.record(PluginCall::Update(dt), None)
    }

    fn shutdown(&self) -> Result<(), PluginError> {
        self.record(PluginCall::Shutdown, None)
    }

    fn init_for_app(&self, app: &dyn App) -> Result<(), PluginError> {
        self.record(PluginCall::InitForApp(app.id().to_owned()), None)
    }

    fn process_scene(&self, scene: &Scene, cancel: &CancelToken) -> Result<(), PluginError> {
        self.record(PluginCall::ProcessScene(scene.name().to_owned()), Some(cancel))
    }
}
