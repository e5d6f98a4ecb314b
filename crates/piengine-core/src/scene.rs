use crate::concurrency::CancelToken;
use crate::lock::{LockError, LockState, ReadHold, UpgradableLock, WriteHold};
use crate::snapshot::SnapshotList;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: [f32; 3],
    pub rotation: [f32; 3],
    pub scale: [f32; 3],
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            rotation: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightKind {
    Point,
    Directional,
    Spot,
}

impl fmt::Display for LightKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LightKind::Point => write!(f, "point"),
            LightKind::Directional => write!(f, "directional"),
            LightKind::Spot => write!(f, "spot"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Light {
    pub kind: LightKind,
    pub color: [f32; 3],
    pub intensity: f32,
}

impl Light {
    pub fn new(kind: LightKind) -> Self {
        Self {
            kind,
            color: [1.0; 3],
            intensity: 1.0,
        }
    }

    #[must_use]
    pub fn with_color(mut self, color: [f32; 3]) -> Self {
        self.color = color;
        self
    }

    #[must_use]
    pub fn with_intensity(mut self, intensity: f32) -> Self {
        self.intensity = intensity;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneNode {
    pub id: String,
    pub mesh: Option<String>,
    pub material: Option<String>,
    pub light: Option<Light>,
    pub transform: Transform,
}

impl SceneNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mesh: None,
            material: None,
            light: None,
            transform: Transform::default(),
        }
    }

    #[must_use]
    pub fn with_mesh(mut self, geometry: impl Into<String>, material: Option<String>) -> Self {
        self.mesh = Some(geometry.into());
        self.material = material;
        self
    }

    #[must_use]
    pub fn with_light(mut self, light: Light) -> Self {
        self.light = Some(light);
        self
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// A node with neither geometry nor light contributes nothing to a frame.
    pub fn is_empty(&self) -> bool {
        self.mesh.is_none() && self.light.is_none()
    }
}

/// A named set of nodes guarded by an [`UpgradableLock`].
///
/// Node storage is a [`SnapshotList`], so taking a snapshot never blocks.
/// The lock coordinates *logical* access between concurrent tasks: traversals
/// that must see a consistent scene hold read, and structural edits hold write
/// (possibly by upgrading a read hold they already have).
#[derive(Debug)]
pub struct Scene {
    name: String,
    nodes: SnapshotList<SceneNode>,
    lock: UpgradableLock,
}

impl Scene {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_nodes(name, Vec::new())
    }

    pub fn with_nodes(name: impl Into<String>, nodes: Vec<SceneNode>) -> Self {
        Self {
            name: name.into(),
            nodes: SnapshotList::from(nodes),
            lock: UpgradableLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> &UpgradableLock {
        &self.lock
    }

    pub fn lock_state(&self) -> LockState {
        self.lock.state()
    }

    pub fn acquire_read(&self) -> ReadHold<'_> {
        self.lock.acquire_read()
    }

    pub fn acquire_read_with(&self, cancel: &CancelToken) -> Result<ReadHold<'_>, LockError> {
        self.lock.acquire_read_with(cancel)
    }

    pub fn acquire_write(&self) -> Result<WriteHold<'_>, LockError> {
        self.lock.acquire_write()
    }

    pub fn acquire_write_with(&self, cancel: &CancelToken) -> Result<WriteHold<'_>, LockError> {
        self.lock.acquire_write_with(cancel)
    }

    pub fn nodes(&self) -> Arc<Vec<SceneNode>> {
        self.nodes.snapshot()
    }

    pub fn node(&self, id: &str) -> Option<SceneNode> {
        self.nodes.snapshot().iter().find(|n| n.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node under the write lock. A node with an id already present is
    /// rejected; returns whether it was added.
    pub fn add_node(&self, node: SceneNode) -> Result<bool, LockError> {
        let _write = self.lock.acquire_write()?;
        Ok(self.nodes.push_unique(node, |a, b| a.id == b.id))
    }

    pub fn remove_node(&self, id: &str) -> Result<bool, LockError> {
        let _write = self.lock.acquire_write()?;
        Ok(self.nodes.remove_where(|n| n.id == id) > 0)
    }

    /// Remove every node matching `pred`. The caller must already hold write;
    /// used by traversals that upgraded in place.
    pub fn remove_where_locked(
        &self,
        _write: &WriteHold<'_>,
        pred: impl Fn(&SceneNode) -> bool,
    ) -> usize {
        self.nodes.remove_where(pred)
    }

    pub fn clear_nodes(&self) -> Result<usize, LockError> {
        let _write = self.lock.acquire_write()?;
        Ok(self.nodes.clear().len())
    }

    pub fn mesh_count(&self) -> usize {
        self.nodes.snapshot().iter().filter(|n| n.mesh.is_some()).count()
    }

    pub fn light_count(&self) -> usize {
        self.nodes.snapshot().iter().filter(|n| n.light.is_some()).count()
    }
}
