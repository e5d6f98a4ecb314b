//! TOML engine manifests and scene files, and the loader that applies a
//! manifest to an [`Engine`].

use crate::app::{App, AppKind};
use crate::engine::{Engine, EngineOptions};
use crate::plugin::PluginRegistry;
use crate::scene::{Light, LightKind, Scene, SceneNode, Transform};
use crate::task;
use crate::variants::create_app;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported manifest_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("engine.fps must be greater than zero")]
    ZeroFps,
    #[error("unknown plugin: '{0}'")]
    UnknownPlugin(String),
    #[error("unknown app kind: '{0}' (expected world, map or hud)")]
    UnknownAppKind(String),
    #[error("duplicate app id: '{0}'")]
    DuplicateApp(String),
    #[error("invalid scene node '{id}': {reason}")]
    InvalidNode { id: String, reason: String },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineManifest {
    pub manifest_version: u32,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
    #[serde(default)]
    pub apps: Vec<AppEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub max_ticks: Option<u64>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            max_ticks: None,
        }
    }
}

fn default_fps() -> u32 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PluginEntry {
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InitialStatus {
    #[default]
    Running,
    Paused,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AppEntry {
    pub id: String,
    pub kind: String,
    /// Scene file, relative to the manifest.
    #[serde(default)]
    pub scene: Option<PathBuf>,
    #[serde(default)]
    pub status: InitialStatus,
    /// Plugins attached to this app only.
    #[serde(default)]
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SceneFile {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Mesh,
    PointLight,
    DirectionalLight,
    SpotLight,
    #[default]
    Empty,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NodeEntry {
    pub id: String,
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub geometry: Option<String>,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub color: Option<[f32; 3]>,
    #[serde(default)]
    pub intensity: Option<f32>,
    #[serde(default)]
    pub transform: Option<TransformEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TransformEntry {
    #[serde(default)]
    pub position: [f32; 3],
    #[serde(default)]
    pub rotation: [f32; 3],
    #[serde(default = "unit_scale")]
    pub scale: [f32; 3],
}

fn unit_scale() -> [f32; 3] {
    [1.0; 3]
}

impl NodeEntry {
    pub fn to_node(&self) -> Result<SceneNode, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidNode {
            id: self.id.clone(),
            reason: reason.to_owned(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }

        let mut node = SceneNode::new(&self.id);
        let light_kind = match self.node_type {
            NodeType::Mesh => {
                let geometry = self
                    .geometry
                    .as_deref()
                    .ok_or_else(|| invalid("mesh nodes need a geometry"))?;
                node = node.with_mesh(geometry, self.material.clone());
                None
            }
            NodeType::PointLight => Some(LightKind::Point),
            NodeType::DirectionalLight => Some(LightKind::Directional),
            NodeType::SpotLight => Some(LightKind::Spot),
            NodeType::Empty => None,
        };

        match light_kind {
            Some(kind) => {
                let mut light = Light::new(kind);
                if let Some(color) = self.color {
                    light = light.with_color(color);
                }
                if let Some(intensity) = self.intensity {
                    if intensity < 0.0 {
                        return Err(invalid("light intensity must not be negative"));
                    }
                    light = light.with_intensity(intensity);
                }
                node = node.with_light(light);
            }
            None if self.color.is_some() || self.intensity.is_some() => {
                return Err(invalid("color and intensity only apply to lights"));
            }
            None => {}
        }

        if let Some(t) = &self.transform {
            node = node.with_transform(Transform {
                position: t.position,
                rotation: t.rotation,
                scale: t.scale,
            });
        }
        Ok(node)
    }
}

pub fn parse_manifest_str(input: &str) -> Result<EngineManifest, ConfigError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<EngineManifest, ConfigError> {
    parse_manifest_str(&read_file(path.as_ref())?)
}

pub fn parse_scene_str(input: &str) -> Result<Scene, ConfigError> {
    let file: SceneFile = toml::from_str(input)?;
    let mut seen = BTreeSet::new();
    let mut nodes = Vec::with_capacity(file.nodes.len());
    for entry in &file.nodes {
        if !seen.insert(entry.id.as_str()) {
            return Err(ConfigError::InvalidNode {
                id: entry.id.clone(),
                reason: "duplicate node id".to_owned(),
            });
        }
        nodes.push(entry.to_node()?);
    }
    Ok(Scene::with_nodes(file.name, nodes))
}

pub fn load_scene_file(path: impl AsRef<Path>) -> Result<Scene, ConfigError> {
    let path = path.as_ref();
    let scene = parse_scene_str(&read_file(path)?)?;
    debug!("loaded scene '{}' ({} nodes) from {}", scene.name(), scene.len(), path.display());
    Ok(scene)
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Applies an [`EngineManifest`] to an engine: global plugins first, then
/// apps, each group loaded concurrently.
#[derive(Debug)]
pub struct ConfigLoader {
    manifest: EngineManifest,
    base_dir: PathBuf,
    registry: PluginRegistry,
}

impl ConfigLoader {
    /// Loader for `manifest`, resolving scene paths against `base_dir` and
    /// plugin names against the built-in registry.
    pub fn new(manifest: EngineManifest, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            base_dir: base_dir.into(),
            registry: PluginRegistry::builtin(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let manifest = parse_manifest_file(path)?;
        let base_dir = path.parent().map_or_else(PathBuf::new, Path::to_path_buf);
        Ok(Self::new(manifest, base_dir))
    }

    #[must_use]
    pub fn with_registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn manifest(&self) -> &EngineManifest {
        &self.manifest
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Check everything that can be checked without touching an engine.
    /// Scene files are not read here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let manifest = &self.manifest;
        if manifest.manifest_version != 1 {
            return Err(ConfigError::UnsupportedVersion(manifest.manifest_version));
        }
        if manifest.engine.fps == 0 {
            return Err(ConfigError::ZeroFps);
        }
        for entry in &manifest.plugins {
            self.ensure_plugin(&entry.name)?;
        }
        let mut ids = BTreeSet::new();
        for app in &manifest.apps {
            if !ids.insert(app.id.as_str()) {
                return Err(ConfigError::DuplicateApp(app.id.clone()));
            }
            app.kind.parse::<AppKind>()?;
            for name in &app.plugins {
                self.ensure_plugin(name)?;
            }
        }
        Ok(())
    }

    fn ensure_plugin(&self, name: &str) -> Result<(), ConfigError> {
        if self.registry.contains(name) {
            Ok(())
        } else {
            Err(ConfigError::UnknownPlugin(name.to_owned()))
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        let mut options = EngineOptions::from_fps(self.manifest.engine.fps);
        options.max_ticks = self.manifest.engine.max_ticks;
        options
    }

    pub fn load_scene(&self, entry: &AppEntry) -> Result<Scene, ConfigError> {
        match &entry.scene {
            Some(path) => load_scene_file(self.base_dir.join(path)),
            None => Ok(Scene::new(&entry.id)),
        }
    }

    /// Create the app described by `entry`, with its scene loaded. Local
    /// plugins are not attached yet.
    pub fn build_app(&self, entry: &AppEntry) -> Result<Arc<dyn App>, ConfigError> {
        let kind = entry.kind.parse::<AppKind>()?;
        let scene = self.load_scene(entry)?;
        Ok(create_app(kind, &entry.id, scene))
    }

    pub fn load(&self, engine: &Engine) -> Result<(), CoreError> {
        self.validate()?;
        let manifest = &self.manifest;
        info!(
            "loading {} plugins and {} apps",
            manifest.plugins.len(),
            manifest.apps.len()
        );

        task::group("load-plugins", |g| {
            for entry in &manifest.plugins {
                g.fork(entry.name.clone(), move |_| {
                    let plugin = self.registry.create(&entry.name)?;
                    engine.load_plugin(plugin)
                });
            }
        })?;

        task::group("load-apps", |g| {
            for entry in &manifest.apps {
                g.fork(entry.id.clone(), move |_| self.load_app(engine, entry));
            }
        })
    }

    /// Start the app, then attach its local plugins and apply its initial
    /// status. If any of that fails the app is stopped and removed again.
    fn load_app(&self, engine: &Engine, entry: &AppEntry) -> Result<(), CoreError> {
        let app = self.build_app(entry)?;
        engine.start_app(Arc::clone(&app))?;
        if let Err(err) = self.settle_app(engine, &app, entry) {
            if let Err(rollback) = engine.stop_app(&app) {
                warn!("app '{}': rollback after failed load: {rollback}", entry.id);
            }
            return Err(err);
        }
        debug!("app '{}' loaded", entry.id);
        Ok(())
    }

    fn settle_app(
        &self,
        engine: &Engine,
        app: &Arc<dyn App>,
        entry: &AppEntry,
    ) -> Result<(), CoreError> {
        for name in &entry.plugins {
            app.add_plugin(self.registry.create(name)?)?;
        }
        if entry.status == InitialStatus::Paused {
            engine.pause_app(app)?;
        }
        Ok(())
    }
}
