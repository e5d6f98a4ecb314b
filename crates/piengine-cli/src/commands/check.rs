use super::{json_pretty, EXIT_SUCCESS};
use piengine_core::ConfigLoader;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct AppCheck {
    id: String,
    kind: String,
    scene: String,
    nodes: usize,
    meshes: usize,
    lights: usize,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    manifest: String,
    fps: u32,
    max_ticks: Option<u64>,
    plugins: Vec<String>,
    apps: Vec<AppCheck>,
}

pub fn run(manifest: &Path, json: bool) -> Result<u8, String> {
    let loader = ConfigLoader::from_file(manifest).map_err(|e| format!("config error: {e}"))?;
    loader.validate().map_err(|e| format!("config error: {e}"))?;

    let mut apps = Vec::new();
    for entry in &loader.manifest().apps {
        let scene = loader
            .load_scene(entry)
            .map_err(|e| format!("config error: app '{}': {e}", entry.id))?;
        apps.push(AppCheck {
            id: entry.id.clone(),
            kind: entry.kind.clone(),
            scene: scene.name().to_owned(),
            nodes: scene.len(),
            meshes: scene.mesh_count(),
            lights: scene.light_count(),
        });
    }

    let report = CheckReport {
        manifest: manifest.display().to_string(),
        fps: loader.manifest().engine.fps,
        max_ticks: loader.manifest().engine.max_ticks,
        plugins: loader
            .manifest()
            .plugins
            .iter()
            .map(|p| p.name.clone())
            .collect(),
        apps,
    };

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        println!("manifest OK: {}", report.manifest);
        println!("  fps: {}", report.fps);
        if let Some(max) = report.max_ticks {
            println!("  max_ticks: {max}");
        }
        if !report.plugins.is_empty() {
            println!("  plugins: {}", report.plugins.join(", "));
        }
        for app in &report.apps {
            println!(
                "  app {:<14} {:<6} scene '{}': {} nodes ({} meshes, {} lights)",
                app.id, app.kind, app.scene, app.nodes, app.meshes, app.lights
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
