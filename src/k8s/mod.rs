pub mod cache;
pub mod client;
pub mod context;
pub mod controller;
pub mod registry;
pub mod source;
pub mod stream;

/// Default user agent for `kubecast` - automatically uses the package version
///
/// Can be overridden via the `KUBECAST_USER_AGENT` environment variable, see
/// [`client::user_agent`].
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
