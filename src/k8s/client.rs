// Client creation per connection profile with custom user-agent support for kube 2.x
use super::USER_AGENT;
use super::registry::{ConnectionKey, Connector};
use crate::error::{Error, Result};
use async_trait::async_trait;
use hyper::http::{HeaderName, HeaderValue};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, error, info, warn};

/// User agent sent with every request: `KUBECAST_USER_AGENT` if set,
/// otherwise [`USER_AGENT`]
#[must_use]
pub fn user_agent() -> String {
    std::env::var("KUBECAST_USER_AGENT")
        .ok()
        .filter(|ua| !ua.trim().is_empty())
        .unwrap_or_else(|| USER_AGENT.to_string())
}

/// Add a user-agent header to `config`. Invalid header values are skipped and
/// the client keeps kube's default.
pub fn add_user_agent_header(config: &mut Config, user_agent: Option<&str>) {
    let Some(user_agent) = user_agent else {
        return;
    };
    match HeaderValue::from_str(user_agent) {
        Ok(value) => config
            .headers
            .push((HeaderName::from_static("user-agent"), value)),
        Err(_) => warn!("⚠️ Ignoring invalid user agent {:?}", user_agent),
    }
}

/// Named set of credentials. The cluster half of a [`ConnectionKey`] picks a
/// context from the profile's kubeconfig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub id: String,
    /// Kubeconfig file; `None` uses `KUBECONFIG` or `~/.kube/config`
    pub kubeconfig: Option<PathBuf>,
}

impl ConnectionProfile {
    #[must_use]
    pub fn new(id: impl Into<String>, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            id: id.into(),
            kubeconfig,
        }
    }

    fn read_kubeconfig(&self) -> Result<Kubeconfig> {
        let kubeconfig = match &self.kubeconfig {
            Some(path) => Kubeconfig::read_from(path)?,
            None => Kubeconfig::read()?,
        };
        Ok(kubeconfig)
    }

    /// Context names available to this profile
    ///
    /// # Errors
    ///
    /// Returns `Error::Kubeconfig` if the kubeconfig cannot be read
    pub fn contexts(&self) -> Result<Vec<String>> {
        Ok(self
            .read_kubeconfig()?
            .contexts
            .into_iter()
            .map(|context| context.name)
            .collect())
    }

    /// The kubeconfig's `current-context`, if set
    ///
    /// # Errors
    ///
    /// Returns `Error::Kubeconfig` if the kubeconfig cannot be read
    pub fn current_context(&self) -> Result<Option<String>> {
        Ok(self.read_kubeconfig()?.current_context)
    }
}

/// Builds [`kube::Client`]s from registered profiles
pub struct KubeConnector {
    profiles: RwLock<HashMap<String, ConnectionProfile>>,
    user_agent: String,
    validate: bool,
}

impl Default for KubeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl KubeConnector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            user_agent: user_agent(),
            validate: true,
        }
    }

    /// Skip the API server round trip when building clients
    #[must_use]
    pub const fn without_validation(mut self) -> Self {
        self.validate = false;
        self
    }

    /// Add or replace a profile. Callers replacing a profile should also
    /// invalidate it in the connection registry.
    pub fn upsert(&self, profile: ConnectionProfile) {
        debug!("📇 Profile {} -> {:?}", profile.id, profile.kubeconfig);
        match self.profiles.write() {
            Ok(mut profiles) => profiles.insert(profile.id.clone(), profile),
            Err(poisoned) => poisoned.into_inner().insert(profile.id.clone(), profile),
        };
    }

    pub fn remove(&self, profile_id: &str) -> bool {
        match self.profiles.write() {
            Ok(mut profiles) => profiles.remove(profile_id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(profile_id).is_some(),
        }
    }

    #[must_use]
    pub fn profile(&self, profile_id: &str) -> Option<ConnectionProfile> {
        match self.profiles.read() {
            Ok(profiles) => profiles.get(profile_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(profile_id).cloned(),
        }
    }

    /// Resolve the client configuration for `key` without connecting
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownProfile` for unregistered profiles and
    /// `Error::Kubeconfig` if the kubeconfig or context cannot be loaded
    pub async fn config_for(&self, key: &ConnectionKey) -> Result<Config> {
        let profile = self
            .profile(&key.profile_id)
            .ok_or_else(|| Error::UnknownProfile(key.profile_id.clone()))?;

        let kubeconfig = profile.read_kubeconfig()?;
        let options = KubeConfigOptions {
            context: Some(key.cluster.clone()),
            ..KubeConfigOptions::default()
        };
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &options).await?;
        add_user_agent_header(&mut config, Some(&self.user_agent));
        Ok(config)
    }
}

#[async_trait]
impl Connector for KubeConnector {
    type Client = Client;

    async fn connect(&self, key: &ConnectionKey) -> Result<Client> {
        debug!("🔧 Creating Kubernetes client for {}", key);
        let config = self.config_for(key).await.map_err(|e| {
            error!("❌ Failed to load configuration for {}: {}", key, e);
            e
        })?;

        let client = Client::try_from(config).map_err(|e| Error::Connection {
            target: key.to_string(),
            message: e.to_string(),
        })?;

        if self.validate {
            let version = client
                .apiserver_version()
                .await
                .map_err(|e| Error::from_kube(e, "get", "version"))?;
            info!("✅ Connected to {} (Kubernetes {})", key, version.git_version);
        }
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config() -> Config {
        Config::new("https://127.0.0.1:6443".parse().unwrap())
    }

    #[test]
    fn test_user_agent_header_added() {
        let mut config = config();
        add_user_agent_header(&mut config, Some("kubecast/1.0"));
        assert!(config
            .headers
            .iter()
            .any(|(name, value)| name == "user-agent" && value == "kubecast/1.0"));
    }

    #[test]
    fn test_invalid_user_agent_is_ignored() {
        let mut config = config();
        add_user_agent_header(&mut config, Some("\u{007F}InvalidAgent"));
        add_user_agent_header(&mut config, None);
        assert!(config.headers.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_profile() {
        let connector = KubeConnector::new().without_validation();
        let err = connector
            .connect(&ConnectionKey::new("missing", "kind"))
            .await
            .err().unwrap();
        assert!(matches!(err, Error::UnknownProfile(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_unreadable_kubeconfig() {
        let connector = KubeConnector::new().without_validation();
        connector.upsert(ConnectionProfile::new(
            "dev",
            Some(Path::new("/nonexistent/kubecast/config").to_path_buf()),
        ));
        let err = connector
            .connect(&ConnectionKey::new("dev", "kind"))
            .await
            .err().unwrap();
        assert!(matches!(err, Error::Kubeconfig(_)));

        assert!(connector.remove("dev"));
        assert!(connector.profile("dev").is_none());
    }
}
