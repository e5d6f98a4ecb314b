use criterion::{criterion_group, criterion_main, Criterion};
use piengine_core::mock::MockPlugin;
use piengine_core::{
    create_app, AppKind, Engine, EngineOptions, Light, LightKind, Scene, SceneNode,
    UpgradableLock,
};
use std::sync::Arc;

fn sample_scene(nodes: usize) -> Scene {
    let nodes = (0..nodes)
        .map(|i| {
            let node = SceneNode::new(format!("node-{i}"));
            if i % 10 == 0 {
                node.with_light(Light::new(LightKind::Point))
            } else {
                node.with_mesh("cube.obj", None)
            }
        })
        .collect();
    Scene::with_nodes("bench", nodes)
}

fn bench_lock(c: &mut Criterion) {
    let lock = UpgradableLock::new();
    c.bench_function("lock_read_uncontended", |b| {
        b.iter(|| drop(lock.acquire_read()));
    });
    c.bench_function("lock_read_upgrade_downgrade", |b| {
        b.iter(|| {
            let read = lock.acquire_read();
            drop(read.upgrade().unwrap());
        });
    });
}

fn bench_tick(c: &mut Criterion) {
    let engine = Engine::headless().with_options(EngineOptions {
        pace: false,
        ..EngineOptions::default()
    });
    for i in 0..4 {
        let app = create_app(AppKind::World, &format!("app-{i}"), sample_scene(256));
        app.add_plugin(Arc::new(MockPlugin::new("local"))).unwrap();
        engine.start_app(app).unwrap();
    }
    engine
        .load_plugin(Arc::new(MockPlugin::new("global")))
        .unwrap();

    c.bench_function("engine_tick_4apps", |b| {
        b.iter(|| engine.tick().unwrap());
    });
}

fn bench_scene_stats(c: &mut Criterion) {
    use piengine_core::builtins::SceneStatsPlugin;
    use piengine_core::{CancelToken, Plugin};

    let scene = sample_scene(4096);
    let stats = SceneStatsPlugin::new();
    let token = CancelToken::new();
    c.bench_function("scene_stats_4096_nodes", |b| {
        b.iter(|| stats.process_scene(&scene, &token).unwrap());
    });
}

criterion_group!(benches, bench_lock, bench_tick, bench_scene_stats);
criterion_main!(benches);
