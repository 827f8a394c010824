//! Proxy settings: YAML file, then environment, then command-line flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::live::UpstreamOptions;
use crate::assets::SyncOptions;
use crate::matcher::MatcherConfig;
use crate::proxy::DEFAULT_MAX_BODY_BYTES;
use crate::sanitize::secrets::{default_patterns, SecretPattern, SecretPolicy};
use crate::sanitize::{default_sanitizers, SanitizerError, SanitizerSpec};
use crate::session::RegistryOptions;
use crate::transform::{default_transforms, TransformSpec};

/// Environment variable overriding [`ProxySettings::listen`].
pub const ENV_LISTEN: &str = "VCRPROXY_LISTEN";
/// Environment variable overriding [`ProxySettings::storage_root`].
pub const ENV_STORAGE_ROOT: &str = "VCRPROXY_STORAGE_ROOT";
/// Environment variable overriding [`ProxySettings::admin_key`].
pub const ENV_ADMIN_KEY: &str = "VCRPROXY_ADMIN_KEY";
/// Environment variable overriding [`TlsSettings::ca_dir`].
pub const ENV_CA_DIR: &str = "VCRPROXY_CA_DIR";

/// Errors raised while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        /// Settings file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The settings file is not valid YAML for [`ProxySettings`].
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        /// Settings file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_yaml::Error,
    },
    /// An override has the wrong shape.
    #[error("invalid value for {name}: {value}")]
    InvalidValue {
        /// Setting or variable name.
        name: &'static str,
        /// Rejected value.
        value: String,
    },
    /// A configured secret pattern does not compile.
    #[error(transparent)]
    Secrets(#[from] SanitizerError),
}

/// HTTPS interception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Terminate `CONNECT` tunnels; when off they are relayed blindly.
    pub enabled: bool,
    /// Directory holding `ca.pem` and `ca.key`.
    pub ca_dir: PathBuf,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self { enabled: true, ca_dir: PathBuf::from(".vcrproxy/ca") }
    }
}

/// The require-clean secret policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretSettings {
    /// Refuse to flush recordings that still contain secrets.
    pub require_clean: bool,
    /// Secret shapes to look for.
    pub patterns: Vec<SecretPattern>,
}

impl Default for SecretSettings {
    fn default() -> Self {
        Self { require_clean: true, patterns: default_patterns() }
    }
}

impl SecretSettings {
    /// Compiles the policy; disabled means an empty policy.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern does not compile.
    pub fn policy(&self) -> Result<SecretPolicy, ConfigError> {
        if self.require_clean {
            Ok(SecretPolicy::compile(&self.patterns)?)
        } else {
            Ok(SecretPolicy::default())
        }
    }
}

/// Asset synchronizer tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetSettings {
    /// Bound on every git invocation.
    pub git_timeout_secs: u64,
    /// Attempts for idempotent remote reads.
    pub restore_attempts: u32,
    /// Base backoff between attempts.
    pub retry_delay_ms: u64,
    /// Where working directories live; `<git root>/.assets` when unset.
    pub assets_dir: Option<PathBuf>,
}

impl Default for AssetSettings {
    fn default() -> Self {
        Self { git_timeout_secs: 300, restore_attempts: 3, retry_delay_ms: 2000, assets_dir: None }
    }
}

impl AssetSettings {
    /// Bound on git invocations.
    #[must_use]
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    /// Synchronizer options.
    #[must_use]
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            assets_root: self.assets_dir.clone(),
            restore_attempts: self.restore_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

/// Everything `vcrproxy serve` and the asset commands need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Listen address.
    pub listen: SocketAddr,
    /// Base directory for relative recording paths.
    pub storage_root: PathBuf,
    /// Key required on admin calls, if any.
    pub admin_key: Option<String>,
    /// Bound on each upstream exchange.
    pub upstream_timeout_secs: u64,
    /// Force-stop sessions idle this long; 0 disables the reaper.
    pub idle_timeout_secs: u64,
    /// Follow upstream redirects instead of relaying them.
    pub follow_redirects: bool,
    /// Accept invalid upstream certificates.
    pub insecure_upstream: bool,
    /// Request body limit.
    pub max_body_bytes: usize,
    /// Keep record logs in an on-disk journal instead of memory.
    pub journal: bool,
    /// HTTPS interception.
    pub tls: TlsSettings,
    /// Require-clean policy.
    pub secrets: SecretSettings,
    /// Sanitizers applied to every recording before session sanitizers.
    pub sanitizers: Vec<SanitizerSpec>,
    /// Transforms every playback session starts with.
    pub transforms: Vec<TransformSpec>,
    /// Matcher every playback session starts with.
    pub matcher: MatcherConfig,
    /// Asset synchronizer tuning.
    pub assets: AssetSettings,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 5000)),
            storage_root: PathBuf::from("."),
            admin_key: None,
            upstream_timeout_secs: 100,
            idle_timeout_secs: 0,
            follow_redirects: false,
            insecure_upstream: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            journal: false,
            tls: TlsSettings::default(),
            secrets: SecretSettings::default(),
            sanitizers: default_sanitizers(),
            transforms: default_transforms(),
            matcher: MatcherConfig::default(),
            assets: AssetSettings::default(),
        }
    }
}

impl ProxySettings {
    /// Reads `path` if given (defaults otherwise), then applies environment
    /// overrides. A `.env` file in the working directory is honored.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// is malformed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Parses a settings file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Applies `VCRPROXY_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `VCRPROXY_LISTEN` is not a socket address.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        if let Some(listen) = lookup(ENV_LISTEN) {
            self.listen = parse_listen(ENV_LISTEN, &listen)?;
        }
        if let Some(root) = lookup(ENV_STORAGE_ROOT) {
            self.storage_root = PathBuf::from(root);
        }
        if let Some(key) = lookup(ENV_ADMIN_KEY) {
            self.admin_key = Some(key);
        }
        if let Some(dir) = lookup(ENV_CA_DIR) {
            self.tls.ca_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Bound on each upstream exchange.
    #[must_use]
    pub fn upstream_options(&self) -> UpstreamOptions {
        UpstreamOptions {
            timeout: Duration::from_secs(self.upstream_timeout_secs.max(1)),
            insecure: self.insecure_upstream,
            follow_redirects: self.follow_redirects,
        }
    }

    /// Idle reaper bound, if enabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Registry options derived from these settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a secret pattern does not compile.
    pub fn registry_options(&self) -> Result<RegistryOptions, ConfigError> {
        Ok(RegistryOptions {
            storage_root: self.storage_root.clone(),
            sanitizers: self.sanitizers.clone(),
            transforms: self.transforms.clone(),
            matcher: self.matcher.clone(),
            secrets: self.secrets.policy()?,
            journal: self.journal,
        })
    }
}

/// Parses a listen address.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] if `value` is not `host:port`.
pub fn parse_listen(name: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue { name, value: value.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vcrproxy.yaml");
        std::fs::write(
            &path,
            "listen: 0.0.0.0:6000\njournal: true\ntls:\n  enabled: false\n\
             matcher:\n  compareBodies: false\n",
        )
        .unwrap();
        let settings = ProxySettings::from_file(&path).unwrap();
        assert_eq!(settings.listen.port(), 6000);
        assert!(settings.journal);
        assert!(!settings.tls.enabled);
        assert_eq!(settings.tls.ca_dir, TlsSettings::default().ca_dir);
        assert!(!settings.matcher.compare_bodies);
        assert_eq!(settings.matcher.max_candidates, 3);
        assert_eq!(settings.sanitizers, default_sanitizers());
    }

    #[test]
    fn environment_overrides_file_values() {
        let env = HashMap::from([
            (ENV_LISTEN, "127.0.0.1:7000"),
            (ENV_ADMIN_KEY, "s3cret"),
            (ENV_CA_DIR, "/tmp/ca"),
            (ENV_STORAGE_ROOT, ""),
        ]);
        let mut settings = ProxySettings::default();
        settings.apply_env(|name| env.get(name).map(ToString::to_string)).unwrap();
        assert_eq!(settings.listen.port(), 7000);
        assert_eq!(settings.admin_key.as_deref(), Some("s3cret"));
        assert_eq!(settings.tls.ca_dir, PathBuf::from("/tmp/ca"));
        assert_eq!(settings.storage_root, PathBuf::from("."));
    }

    #[test]
    fn malformed_values_are_reported() {
        let mut settings = ProxySettings::default();
        let err = settings.apply_env(|_| Some("nowhere".into())).unwrap_err();
        assert!(err.to_string().contains(ENV_LISTEN));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "listen: [1, 2]\n").unwrap();
        assert!(matches!(ProxySettings::from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn disabled_secret_gate_compiles_to_empty_policy() {
        let settings = SecretSettings { require_clean: false, ..SecretSettings::default() };
        assert!(settings.policy().unwrap().is_empty());
    }
}
