/**
 * Helper functions for creating common cache error types
 */
use crate::error::Error;

/// Create the error returned to callers of an entry torn down by invalidation
#[must_use]
pub fn invalidated_error(target: &str) -> Error {
    Error::Invalidated(target.to_string())
}

/// Create a `SyncTimeout` for `resource` after waiting `waited`
#[must_use]
pub const fn sync_timeout_error(resource: String, waited: std::time::Duration) -> Error {
    Error::SyncTimeout { resource, waited }
}
