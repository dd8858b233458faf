use std::sync::OnceLock;

/// Ensure tracing is initialized only once across the application.
static TRACING: OnceLock<()> = OnceLock::new();

/// Initialize tracing once, safe to call multiple times. `RUST_LOG` selects
/// the filter, `BH_TRACING_FORMAT=json` switches to JSON output.
pub fn init_tracing_once() {
    TRACING.get_or_init(|| {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
        let fmt_json = std::env::var("BH_TRACING_FORMAT")
            .ok()
            .is_some_and(|v| v == "json");
        let builder = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
            .with_target(true);
        let _ = if fmt_json {
            builder.json().try_init()
        } else {
            builder.compact().try_init()
        };
        tracing::debug!("tracing initialized (json={})", fmt_json);
    });
}
