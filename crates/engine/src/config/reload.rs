//! Hot reload
//!
//! The running configuration is an immutable snapshot behind an
//! `ArcSwap`: readers are lock-free and in-flight calls pin the `Arc`
//! they started with. A reload parses the new document, diffs it against
//! the running one and classifies every changed group as hot-reloadable
//! or restart-required. Hot changes apply by swapping the snapshot;
//! restart-required changes are reported but the old values stay live
//! until the operator restarts.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::{info, warn};

use super::Config;
use crate::error::Result;

/// Outcome of one reload attempt, returned to the admin endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    /// Whether a new snapshot was swapped in
    pub applied: bool,
    /// Changed keys that only take effect after a process restart
    pub restart_required: Vec<String>,
    /// Unknown-key and operator-facing warnings, verbatim
    pub warnings: Vec<String>,
}

/// Classify the diff between two valid documents
///
/// Returns the restart-required key list; everything else that differs
/// is hot-reloadable by swapping the snapshot.
pub fn classify_diff(running: &Config, next: &Config) -> Vec<String> {
    let mut restart = Vec::new();
    let mut require = |key: &str| restart.push(key.to_string());

    if running.asterisk != next.asterisk {
        require("asterisk");
    }
    if running.audiosocket != next.audiosocket {
        require("audiosocket");
    }
    if running.external_media != next.external_media {
        require("external_media");
    }
    if running.audio_transport != next.audio_transport {
        require("audio_transport");
    }
    if running.downstream_mode != next.downstream_mode {
        require("downstream_mode");
    }
    if running.admin.bind != next.admin.bind {
        require("admin.bind");
    }
    if running.profiles != next.profiles {
        require("profiles");
    }
    if running.default_profile != next.default_profile {
        require("default_profile");
    }
    // provider endpoints and credentials are dialed at session start but
    // their supervisors are wired at boot
    for (name, provider) in &next.providers {
        match running.providers.get(name) {
            Some(current) if current.url == provider.url && current.api_key == provider.api_key => {}
            Some(_) => require(&format!("providers.{name}")),
            None => require(&format!("providers.{name}")),
        }
    }
    for name in running.providers.keys() {
        if !next.providers.contains_key(name) {
            require(&format!("providers.{name}"));
        }
    }
    restart
}

/// Shared configuration store
pub struct ConfigStore {
    path: PathBuf,
    current: ArcSwap<Config>,
}

impl ConfigStore {
    pub fn new(path: PathBuf, initial: Config) -> Self {
        Self {
            path,
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// The current snapshot; cheap, lock-free
    pub fn snapshot(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Re-read the document from disk, swap if valid
    pub fn reload(&self) -> Result<ReloadReport> {
        let (next, mut warnings) = Config::load(&self.path)?;
        let running = self.snapshot();
        let restart_required = classify_diff(&running, &next);

        if !restart_required.is_empty() {
            warn!(
                keys = ?restart_required,
                "reload contains restart-required changes; old values stay live"
            );
            warnings.push(format!(
                "{} change(s) take effect only after restart",
                restart_required.len()
            ));
        }

        // Hot-reloadable portions apply immediately. Restart-required
        // groups are pinned back to the running values so the swapped
        // snapshot never disagrees with the sockets that are actually
        // bound.
        let mut applied = next;
        applied.asterisk = running.asterisk.clone();
        applied.audiosocket = running.audiosocket.clone();
        applied.external_media = running.external_media.clone();
        applied.audio_transport = running.audio_transport;
        applied.downstream_mode = running.downstream_mode;
        applied.admin = running.admin.clone();
        applied.profiles = running.profiles.clone();
        applied.default_profile = running.default_profile.clone();
        for (name, provider) in applied.providers.iter_mut() {
            if let Some(current) = running.providers.get(name) {
                provider.url = current.url.clone();
                provider.api_key = current.api_key.clone();
            }
        }

        self.current.store(Arc::new(applied));
        info!(restart_required = restart_required.len(), "configuration reloaded");

        Ok(ReloadReport {
            applied: true,
            restart_required,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::minimal_toml;

    fn parse(raw: &str) -> Config {
        Config::from_str(raw).unwrap().0
    }

    #[test]
    fn identical_documents_need_no_restart() {
        let a = parse(&minimal_toml());
        let b = parse(&minimal_toml());
        assert!(classify_diff(&a, &b).is_empty());
    }

    #[test]
    fn prompt_change_is_hot() {
        let a = parse(&minimal_toml());
        let raw = minimal_toml().replace(
            "prompt = \"You are a helpful receptionist.\"",
            "prompt = \"You are terse.\"",
        );
        let b = parse(&raw);
        assert!(classify_diff(&a, &b).is_empty());
        assert_ne!(
            a.contexts["default"].prompt,
            b.contexts["default"].prompt
        );
    }

    #[test]
    fn destination_target_change_is_hot() {
        let mut raw = minimal_toml();
        raw.push_str(
            "\n[tools.transfer.destinations.support_agent]\nkind = \"extension\"\ntarget = \"6000\"\n",
        );
        let a = parse(&raw);
        let b = parse(&raw.replace("target = \"6000\"", "target = \"6001\""));
        assert!(classify_diff(&a, &b).is_empty());
    }

    #[test]
    fn transport_and_credentials_require_restart() {
        let a = parse(&minimal_toml());
        let b = parse(
            &minimal_toml().replace("audio_transport = \"audiosocket\"",
                                    "audio_transport = \"externalmedia\""),
        );
        assert_eq!(classify_diff(&a, &b), vec!["audio_transport"]);

        let c = parse(&minimal_toml().replace("api_key = \"k\"", "api_key = \"k2\""));
        assert_eq!(classify_diff(&a, &c), vec!["providers.agent"]);
    }

    #[test]
    fn store_swaps_hot_changes_and_pins_restart_groups() {
        let dir = std::env::temp_dir().join(format!("arivox-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, minimal_toml()).unwrap();

        let (initial, _) = Config::load(&path).unwrap();
        let store = ConfigStore::new(path.clone(), initial);

        // hot change (greeting) + restart-required change (api key)
        let updated = minimal_toml()
            .replace("greeting = \"Hello, how can I help?\"", "greeting = \"Hi!\"")
            .replace("api_key = \"k\"", "api_key = \"rotated\"");
        std::fs::write(&path, updated).unwrap();

        let report = store.reload().unwrap();
        assert!(report.applied);
        assert_eq!(report.restart_required, vec!["providers.agent"]);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.contexts["default"].greeting, "Hi!");
        // restart-required value pinned to the running one
        assert_eq!(snapshot.providers["agent"].api_key, "k");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn invalid_next_document_keeps_running_snapshot() {
        let dir = std::env::temp_dir().join(format!("arivox-test-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, minimal_toml()).unwrap();

        let (initial, _) = Config::load(&path).unwrap();
        let store = ConfigStore::new(path.clone(), initial);

        std::fs::write(&path, "this is not toml [").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.snapshot().default_provider, "agent");

        std::fs::remove_dir_all(&dir).ok();
    }
}
