//! Working/cache directory and engine environment bootstrap.
//!
//! Runs exactly once per process lifetime; later calls return the already
//! established directories regardless of the base path they pass. Engine
//! `setup` and stderr redirection are best-effort: their failures are logged
//! and never abort the service start.

use std::path::Path;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{debug, warn};

use bh_engine::{Engine, EngineDirs};

/// Environment variables the engine reads for its directory layout.
pub const ENV_BASE_DIR: &str = "BH_BASE_DIR";
pub const ENV_WORKING_DIR: &str = "BH_WORKING_DIR";
pub const ENV_CACHE_DIR: &str = "BH_CACHE_DIR";

const WORKING_DIR_NAME: &str = "engine_working";
const CACHE_DIR_NAME: &str = "cache";

static DIRS: OnceLock<EngineDirs> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

/// The established directory layout, if [`ensure`] has run.
pub fn dirs() -> Option<&'static EngineDirs> {
    DIRS.get()
}

/// Establish the directory layout under `base_dir` and point the engine at
/// it. Idempotent; the first successful call wins for the process lifetime.
pub fn ensure<E: Engine>(engine: &E, base_dir: &Path) -> std::io::Result<&'static EngineDirs> {
    if let Some(dirs) = DIRS.get() {
        debug!(target: "bh_core::bootstrap", "already initialized, skipping");
        return Ok(dirs);
    }
    let _guard = INIT.lock();
    if let Some(dirs) = DIRS.get() {
        return Ok(dirs);
    }

    let dirs = EngineDirs {
        base_dir: base_dir.to_path_buf(),
        working_dir: base_dir.join(WORKING_DIR_NAME),
        cache_dir: base_dir.join(CACHE_DIR_NAME),
    };
    std::fs::create_dir_all(&dirs.base_dir)?;
    std::fs::create_dir_all(&dirs.working_dir)?;
    std::fs::create_dir_all(&dirs.cache_dir)?;

    debug!(
        target: "bh_core::bootstrap",
        base = %dirs.base_dir.display(),
        working = %dirs.working_dir.display(),
        cache = %dirs.cache_dir.display(),
        "directory layout established"
    );

    std::env::set_var(ENV_BASE_DIR, &dirs.base_dir);
    std::env::set_var(ENV_WORKING_DIR, &dirs.working_dir);
    std::env::set_var(ENV_CACHE_DIR, &dirs.cache_dir);

    if let Err(e) = engine.setup(&dirs) {
        warn!(target: "bh_core::bootstrap", error = %e, "engine setup failed");
    }
    if let Err(e) = engine.redirect_stderr(&dirs.stderr_log()) {
        warn!(target: "bh_core::bootstrap", error = %e, "stderr redirection failed");
    }

    Ok(DIRS.get_or_init(|| dirs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bh_engine::loopback::LoopbackEngine;

    #[test]
    fn bootstrap_is_idempotent_per_process() {
        let engine = LoopbackEngine::new();
        // Deliberately kept for the whole test process: other tests in this
        // binary may run against the layout established here.
        let first_base = tempfile::tempdir().unwrap().into_path();
        let second_base = tempfile::tempdir().unwrap();

        let first = ensure(&engine, &first_base).unwrap();
        assert!(first.working_dir.is_dir());
        assert!(first.cache_dir.is_dir());
        assert!(first.stderr_log().is_file());

        // A second call with a different base keeps the established layout.
        let second = ensure(&engine, second_base.path()).unwrap();
        assert_eq!(first, second);
        assert!(!second_base.path().join(WORKING_DIR_NAME).exists());
    }
}
