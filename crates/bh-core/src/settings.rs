//! Shared service settings, read by the lifecycle controller at start time.

use std::sync::Arc;

use parking_lot::RwLock;

/// Mutable service configuration supplied by the front-end before start:
/// the active profile and the engine options blob.
#[derive(Clone, Debug, Default)]
pub struct ServiceSettings {
    /// Path to the active configuration profile. Blank means "no profile
    /// selected" and fails start with an `EmptyConfiguration` alert.
    pub active_config_path: String,
    /// Engine options blob (JSON), merged into the profile at build time.
    pub config_options: String,
    /// Display name of the active profile, for notifications.
    pub active_profile_name: String,
    /// Write the fully built config into the working directory on start.
    pub debug_mode: bool,
    /// Disable the engine-side memory limit.
    pub disable_memory_limit: bool,
}

/// Cheap-to-clone shared cell around [`ServiceSettings`].
#[derive(Clone, Debug, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<ServiceSettings>>,
}

impl SharedSettings {
    pub fn new(settings: ServiceSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn get(&self) -> ServiceSettings {
        self.inner.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut ServiceSettings)) {
        f(&mut self.inner.write());
    }

    /// Select the active profile (path + display name).
    pub fn set_active_profile(&self, path: impl Into<String>, name: impl Into<String>) {
        let mut guard = self.inner.write();
        guard.active_config_path = path.into();
        guard.active_profile_name = name.into();
    }

    pub fn set_config_options(&self, options: impl Into<String>) {
        self.inner.write().config_options = options.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_settings_updates_are_visible_to_clones() {
        let settings = SharedSettings::default();
        let clone = settings.clone();
        settings.set_active_profile("/tmp/p.json", "primary");
        clone.set_config_options(r#"{"mode":"rule"}"#);

        let snap = settings.get();
        assert_eq!(snap.active_config_path, "/tmp/p.json");
        assert_eq!(snap.active_profile_name, "primary");
        assert_eq!(snap.config_options, r#"{"mode":"rule"}"#);
    }
}
