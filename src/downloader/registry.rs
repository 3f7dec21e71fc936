//! Static registry mapping a configured `kind` to a backend constructor.

use std::sync::Arc;

use super::Downloader;
use super::command::CommandDownloader;
use super::local::LocalDownloader;
use crate::config::{Config, DownloaderConfig, MatchingConfig};
use crate::error::Result;

type Constructor = fn(&DownloaderConfig, &MatchingConfig) -> Result<Arc<dyn Downloader>>;

static REGISTRY: &[(&str, Constructor)] = &[("local", local), ("command", command)];

fn local(config: &DownloaderConfig, matching: &MatchingConfig) -> Result<Arc<dyn Downloader>> {
    Ok(Arc::new(LocalDownloader::from_config(config, matching)?))
}

fn command(config: &DownloaderConfig, matching: &MatchingConfig) -> Result<Arc<dyn Downloader>> {
    Ok(Arc::new(CommandDownloader::from_config(config, matching)?))
}

/// Registered backend kinds.
pub fn known_kinds() -> Vec<&'static str> {
    REGISTRY.iter().map(|(kind, _)| *kind).collect()
}

pub fn is_known_kind(kind: &str) -> bool {
    REGISTRY.iter().any(|(k, _)| *k == kind)
}

/// Construct one backend from its configuration.
pub fn build(config: &DownloaderConfig, matching: &MatchingConfig) -> Result<Arc<dyn Downloader>> {
    let Some((_, constructor)) = REGISTRY.iter().find(|(kind, _)| *kind == config.kind) else {
        return Err(crate::error::Error::download(format!(
            "downloader '{}' has unknown kind '{}'",
            config.name, config.kind
        )));
    };
    constructor(config, matching)
}

/// Construct every enabled backend. Misconfigured ones are logged and left out.
pub fn build_all(config: &Config) -> Vec<Arc<dyn Downloader>> {
    config
        .enabled_downloaders()
        .filter_map(|d| match build(d, &config.matching) {
            Ok(backend) => Some(backend),
            Err(e) => {
                tracing::error!(backend = %d.name, "Skipping downloader: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_known_kinds() {
        assert_eq!(known_kinds(), vec!["local", "command"]);
        assert!(is_known_kind("command"));
        assert!(!is_known_kind("qobuz"));
    }

    #[test]
    fn test_build_unknown_kind_fails() {
        let cfg = DownloaderConfig {
            name: "x".into(),
            kind: "nope".into(),
            ..Default::default()
        };
        assert!(build(&cfg, &MatchingConfig::default()).is_err());
    }

    #[test]
    fn test_build_all_skips_broken_and_disabled() {
        let mut config = Config::default();
        config.downloaders = vec![
            DownloaderConfig {
                name: "staging".into(),
                kind: "local".into(),
                priority: 5,
                staging_dir: Some(PathBuf::from("/srv/incoming")),
                ..Default::default()
            },
            DownloaderConfig {
                name: "broken".into(),
                kind: "command".into(),
                ..Default::default()
            },
            DownloaderConfig {
                name: "off".into(),
                kind: "local".into(),
                enabled: false,
                staging_dir: Some(PathBuf::from("/srv/other")),
                ..Default::default()
            },
        ];

        let backends = build_all(&config);
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].name(), "staging");
        assert_eq!(backends[0].priority(), 5);
    }
}
