use derive_more::From;
use k8s_openapi::serde_json;
use std::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Yaml(serde_yaml::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Kubeconfig(kube::config::KubeconfigError),

    /// The cluster could not be reached or refused our credentials
    Connection { target: String, message: String },

    /// Authenticated, but denied for a verb on a resource
    Permission {
        verb: String,
        resource: String,
        message: String,
    },

    /// The watch cache did not become ready within the caller's budget
    SyncTimeout { resource: String, waited: Duration },

    /// A view transform failed on a concrete object
    Serialization { object: String, message: String },

    NotFound { resource: String, name: String },

    /// The upstream resumption token is no longer valid; a full re-list is needed
    TokenExpired,

    /// The owning connection was invalidated
    Invalidated(String),

    /// A subscriber fell too far behind and was disconnected
    SlowConsumer { topic: String, skipped: u64 },

    UnknownProfile(String),

    InvalidQuery(String),

    Unsupported(String),

    /// Custom error message
    Custom(String),
}

impl Error {
    /// Classify a kube error for `verb` on `resource`.
    ///
    /// 401 and transport failures are connection errors, 403 is a permission
    /// error, 404 is not-found and 410 means the resource version expired.
    #[must_use]
    pub fn from_kube(err: kube::Error, verb: &str, resource: &str) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 401 => Self::Connection {
                target: resource.to_string(),
                message: resp.message.clone(),
            },
            kube::Error::Api(ref resp) if resp.code == 403 => Self::Permission {
                verb: verb.to_string(),
                resource: resource.to_string(),
                message: resp.message.clone(),
            },
            kube::Error::Api(ref resp) if resp.code == 404 => Self::NotFound {
                resource: resource.to_string(),
                name: resp.message.clone(),
            },
            kube::Error::Api(ref resp) if resp.code == 410 => Self::TokenExpired,
            kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::Auth(_) => {
                Self::Connection {
                    target: resource.to_string(),
                    message: err.to_string(),
                }
            }
            other => Self::Kube(other),
        }
    }

    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    #[must_use]
    pub const fn is_permission(&self) -> bool {
        matches!(self, Self::Permission { .. })
    }

    #[must_use]
    pub const fn is_sync_timeout(&self) -> bool {
        matches!(self, Self::SyncTimeout { .. })
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Json(e) => write!(fmt, "json error: {e}"),
            Self::Yaml(e) => write!(fmt, "yaml error: {e}"),
            Self::Kube(e) => write!(fmt, "kubernetes error: {e}"),
            Self::Kubeconfig(e) => write!(fmt, "kubeconfig error: {e}"),
            Self::Connection { target, message } => {
                write!(fmt, "cannot connect to {target}: {message}")
            }
            Self::Permission {
                verb,
                resource,
                message,
            } => write!(fmt, "permission denied to {verb} {resource}: {message}"),
            Self::SyncTimeout { resource, waited } => write!(
                fmt,
                "{resource} cache not synced after {}ms",
                waited.as_millis()
            ),
            Self::Serialization { object, message } => {
                write!(fmt, "failed to serialize {object}: {message}")
            }
            Self::NotFound { resource, name } => write!(fmt, "{resource} {name} not found"),
            Self::TokenExpired => write!(fmt, "resource version expired"),
            Self::Invalidated(target) => write!(fmt, "{target} was invalidated"),
            Self::SlowConsumer { topic, skipped } => write!(
                fmt,
                "subscriber of {topic} disconnected after skipping {skipped} frames"
            ),
            Self::UnknownProfile(id) => write!(fmt, "unknown connection profile {id}"),
            Self::InvalidQuery(message) => write!(fmt, "invalid stream query: {message}"),
            Self::Unsupported(what) => write!(fmt, "unsupported: {what}"),
            Self::Custom(message) => write!(fmt, "{message}"),
        }
    }
}

impl std::error::Error for Error {}
