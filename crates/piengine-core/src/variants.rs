use crate::app::{App, AppKind, SceneApp, SceneHooks};
use crate::concurrency::CancelToken;
use crate::scene::Scene;
use crate::CoreError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub type WorldApp = SceneApp<WorldScene>;
pub type MapApp = SceneApp<MapScene>;
pub type HudApp = SceneApp<HudScene>;

/// A game world. Tracks simulated time and releases its nodes on cleanup.
#[derive(Debug, Default)]
pub struct WorldScene {
    simulated_us: AtomicU64,
}

impl WorldScene {
    /// Seconds of running time this world has simulated.
    pub fn simulated_secs(&self) -> f64 {
        self.simulated_us.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}

impl SceneHooks for WorldScene {
    fn kind(&self) -> AppKind {
        AppKind::World
    }

    fn on_update(&self, _scene: &Scene, dt: f32, _cancel: &CancelToken) -> Result<(), CoreError> {
        let micros = (f64::from(dt) * 1_000_000.0).round() as u64;
        self.simulated_us.fetch_add(micros, Ordering::SeqCst);
        Ok(())
    }

    fn on_cleanup(&self, scene: &Scene, cancel: &CancelToken) -> Result<(), CoreError> {
        release_nodes(scene, cancel)
    }
}

/// An overview map. Releases its nodes on cleanup.
#[derive(Debug, Default)]
pub struct MapScene;

impl SceneHooks for MapScene {
    fn kind(&self) -> AppKind {
        AppKind::Map
    }

    fn on_cleanup(&self, scene: &Scene, cancel: &CancelToken) -> Result<(), CoreError> {
        release_nodes(scene, cancel)
    }
}

/// Heads-up overlay. Its scene is kept across cleanup.
#[derive(Debug, Default)]
pub struct HudScene;

impl SceneHooks for HudScene {
    fn kind(&self) -> AppKind {
        AppKind::Hud
    }
}

fn release_nodes(scene: &Scene, cancel: &CancelToken) -> Result<(), CoreError> {
    let _write = scene.acquire_write_with(cancel)?;
    let released = scene.clear_nodes()?;
    debug!(scene = scene.name(), released, "scene nodes released");
    Ok(())
}

pub fn create_app(kind: AppKind, id: &str, scene: Scene) -> Arc<dyn App> {
    match kind {
        AppKind::World => Arc::new(WorldApp::new(id, scene, WorldScene::default())),
        AppKind::Map => Arc::new(MapApp::new(id, scene, MapScene)),
        AppKind::Hud => Arc::new(HudApp::new(id, scene, HudScene)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::AppStatus;
    use crate::scene::SceneNode;

    fn scene() -> Scene {
        Scene::with_nodes("s", vec![SceneNode::new("a"), SceneNode::new("b")])
    }

    fn run_and_clean(app: &dyn App) {
        app.initialize().unwrap();
        app.start().unwrap();
        app.cleanup().unwrap();
        assert_eq!(app.status(), AppStatus::Terminated);
    }

    #[test]
    fn world_and_map_release_nodes_on_cleanup() {
        for kind in [AppKind::World, AppKind::Map] {
            let app = create_app(kind, "a", scene());
            assert_eq!(app.kind(), kind);
            run_and_clean(app.as_ref());
            assert!(app.scene().is_empty());
            assert!(app.scene().lock_state().is_free());
        }
    }

    #[test]
    fn hud_keeps_its_scene() {
        let app = create_app(AppKind::Hud, "hud", scene());
        run_and_clean(app.as_ref());
        assert_eq!(app.scene().len(), 2);
    }

    #[test]
    fn world_accumulates_simulated_time_only_while_running() {
        let app = WorldApp::new("w", scene(), WorldScene::default());
        app.initialize().unwrap();
        app.update(0.5).unwrap();
        app.start().unwrap();
        app.update(0.5).unwrap();
        app.update(0.25).unwrap();
        assert!((app.hooks().simulated_secs() - 0.75).abs() < 1e-9);
    }
}
