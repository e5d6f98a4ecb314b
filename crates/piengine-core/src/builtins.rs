//! Plugins shipped with the engine and resolvable by name from a manifest.

use crate::concurrency::CancelToken;
use crate::lock::LockError;
use crate::plugin::{Plugin, PluginError};
use crate::scene::{Scene, SceneNode};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, trace};

pub const SCENE_STATS: &str = "scene-stats";
pub const PRUNE_EMPTY: &str = "prune-empty";

/// Counts meshes and lights of every scene it processes, under a read hold.
#[derive(Debug, Default)]
pub struct SceneStatsPlugin {
    frames: AtomicU64,
    meshes: AtomicUsize,
    lights: AtomicUsize,
}

impl SceneStatsPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Mesh and light counts seen by the most recent traversal.
    pub fn last_counts(&self) -> (usize, usize) {
        (
            self.meshes.load(Ordering::SeqCst),
            self.lights.load(Ordering::SeqCst),
        )
    }
}

impl Plugin for SceneStatsPlugin {
    fn name(&self) -> &str {
        SCENE_STATS
    }

    fn process_scene(&self, scene: &Scene, cancel: &CancelToken) -> Result<(), PluginError> {
        let _read = scene.acquire_read_with(cancel)?;
        let (mut meshes, mut lights) = (0, 0);
        for node in scene.nodes().iter() {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled.into());
            }
            meshes += usize::from(node.mesh.is_some());
            lights += usize::from(node.light.is_some());
        }
        self.meshes.store(meshes, Ordering::SeqCst);
        self.lights.store(lights, Ordering::SeqCst);
        self.frames.fetch_add(1, Ordering::SeqCst);
        trace!(scene = scene.name(), meshes, lights, "scene stats");
        Ok(())
    }

    fn shutdown(&self) -> Result<(), PluginError> {
        debug!("{SCENE_STATS}: {} frames processed", self.frames());
        Ok(())
    }
}

/// Removes nodes that carry neither a mesh nor a light.
///
/// Scans under a read hold and only upgrades when something needs removing.
/// If another reader is already upgrading the same scene, this frame is
/// skipped and the scan runs again next frame.
#[derive(Debug, Default)]
pub struct PruneEmptyPlugin {
    pruned: AtomicUsize,
    skipped: AtomicUsize,
}

impl PruneEmptyPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pruned(&self) -> usize {
        self.pruned.load(Ordering::SeqCst)
    }

    /// Frames given up because of upgrade contention.
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }
}

impl Plugin for PruneEmptyPlugin {
    fn name(&self) -> &str {
        PRUNE_EMPTY
    }

    fn process_scene(&self, scene: &Scene, cancel: &CancelToken) -> Result<(), PluginError> {
        let read = scene.acquire_read_with(cancel)?;
        if !scene.nodes().iter().any(SceneNode::is_empty) {
            return Ok(());
        }

        let write = match read.upgrade_with(cancel) {
            Ok(write) => write,
            Err(LockError::UpgradeContention) => {
                self.skipped.fetch_add(1, Ordering::SeqCst);
                trace!(scene = scene.name(), "prune skipped: upgrade contention");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let removed = scene.remove_where_locked(&write, SceneNode::is_empty);
        self.pruned.fetch_add(removed, Ordering::SeqCst);
        debug!(scene = scene.name(), removed, "pruned empty nodes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Light, LightKind};

    fn scene() -> Scene {
        Scene::with_nodes(
            "s",
            vec![
                SceneNode::new("cube").with_mesh("cube.obj", None),
                SceneNode::new("sun").with_light(Light::new(LightKind::Directional)),
                SceneNode::new("empty-a"),
                SceneNode::new("empty-b"),
            ],
        )
    }

    #[test]
    fn stats_count_meshes_and_lights() {
        let stats = SceneStatsPlugin::new();
        stats.process_scene(&scene(), &CancelToken::new()).unwrap();
        assert_eq!(stats.last_counts(), (1, 1));
        assert_eq!(stats.frames(), 1);
    }

    #[test]
    fn stats_report_cancellation() {
        let token = CancelToken::new();
        token.cancel();
        let err = SceneStatsPlugin::new()
            .process_scene(&scene(), &token)
            .unwrap_err();
        assert!(matches!(err, PluginError::Lock(LockError::Cancelled)));
    }

    #[test]
    fn prune_removes_empty_nodes_and_releases_the_lock() {
        let scene = scene();
        let prune = PruneEmptyPlugin::new();
        prune.process_scene(&scene, &CancelToken::new()).unwrap();

        assert_eq!(prune.pruned(), 2);
        assert_eq!(scene.len(), 2);
        assert!(scene.lock_state().is_free());

        // Nothing left to prune: no upgrade needed.
        prune.process_scene(&scene, &CancelToken::new()).unwrap();
        assert_eq!(prune.pruned(), 2);
    }

    #[test]
    fn prune_skips_frame_on_upgrade_contention() {
        use std::thread;
        use std::time::Duration;

        let scene = scene();
        let prune = PruneEmptyPlugin::new();

        thread::scope(|s| {
            let outer = scene.acquire_read();
            let scene = &scene;
            // Another reader starts upgrading and waits for our read to go.
            let other = s.spawn(move || {
                let read = scene.acquire_read();
                let _write = read.upgrade().unwrap();
            });
            while scene.lock_state().waiting_writers == 0 {
                thread::sleep(Duration::from_millis(1));
            }

            prune.process_scene(scene, &CancelToken::new()).unwrap();
            assert_eq!(prune.skipped(), 1);
            drop(outer);
            other.join().unwrap();
        });

        assert_eq!(prune.pruned(), 0);
        assert_eq!(scene.len(), 4);
        assert!(scene.lock_state().is_free());
    }
}
