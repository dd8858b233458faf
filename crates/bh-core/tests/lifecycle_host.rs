//! Host-process lifecycle tests that rely on a fresh per-process bootstrap
//! (directory layout, debug config snapshot, engine environment).

use std::sync::Arc;
use std::time::Duration;

use bh_core::bootstrap;
use bh_core::bridge::{BridgeClient, BridgeServer, ServiceCallback};
use bh_core::lifecycle::{LifecycleController, Supervisor};
use bh_core::settings::{ServiceSettings, SharedSettings};
use bh_engine::loopback::LoopbackEngine;
use bh_types::ServiceStatus;

struct NullCallback;

impl ServiceCallback for NullCallback {
    fn on_status_changed(&self, _status: ServiceStatus) {}
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn debug_start_writes_config_snapshot_and_engine_env() {
    let engine = LoopbackEngine::new();
    let base = tempfile::tempdir().unwrap().into_path();
    let profile = base.join("profile.json");
    std::fs::write(&profile, r#"{"outbounds":[{"tag":"direct"}]}"#).unwrap();
    let settings = SharedSettings::new(ServiceSettings {
        active_config_path: profile.display().to_string(),
        config_options: r#"{"mode":"rule"}"#.to_string(),
        active_profile_name: "debug-profile".to_string(),
        debug_mode: true,
        disable_memory_limit: true,
    });

    let controller =
        LifecycleController::new(Arc::new(engine.clone()), settings, base.clone())
            .with_reload_settle(Duration::ZERO);
    let supervisor = Supervisor::start(controller);
    let handle = supervisor.handle();

    let server = BridgeServer::new(handle.clone());
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let client = BridgeClient::new(addr, Arc::new(NullCallback));
    client.connect().await.unwrap();

    client.start().await.unwrap();
    wait_until("started", || handle.status() == ServiceStatus::Started).await;

    // Bootstrap layout established under the controller's base dir.
    let dirs = bootstrap::dirs().expect("bootstrap ran");
    assert_eq!(dirs.base_dir, base);
    assert!(dirs.working_dir.is_dir());
    assert!(dirs.cache_dir.is_dir());
    assert!(dirs.stderr_log().is_file());
    assert_eq!(
        std::env::var(bootstrap::ENV_WORKING_DIR).ok().as_deref(),
        dirs.working_dir.to_str()
    );

    // Debug mode persisted the built config.
    let snapshot = std::fs::read_to_string(dirs.config_snapshot()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
    assert_eq!(parsed["options"]["mode"], "rule");

    // Memory limit disabled by settings.
    assert!(!engine.memory_limit_enabled());
    assert!(engine.local_dns_registered());

    // Device-idle signals bridge straight into pause/wake.
    client.device_idle(true).await.unwrap();
    wait_until("paused", || engine.handles()[0].is_paused()).await;
    client.device_idle(false).await.unwrap();
    wait_until("woken", || !engine.handles()[0].is_paused()).await;

    client.stop().await.unwrap();
    wait_until("stopped", || handle.status() == ServiceStatus::Stopped).await;
    handle.terminated().await;
    assert!(!engine.local_dns_registered());

    client.disconnect();
    server.close();
}
