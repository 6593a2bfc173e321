use crate::k8s::registry::ConnectionKey;
use std::fmt;

/// Addressable broadcast channel: one logical change feed.
///
/// Rendered as `profile/cluster/kind/<namespace|*>/<name|*>[/qualifier]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTopic {
    pub connection: ConnectionKey,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub qualifier: Option<String>,
}

impl StreamTopic {
    #[must_use]
    pub fn new(connection: ConnectionKey, kind: impl Into<String>) -> Self {
        Self {
            connection,
            kind: kind.into(),
            namespace: None,
            name: None,
            qualifier: None,
        }
    }

    #[must_use]
    pub fn namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.map(str::to_string);
        self
    }

    #[must_use]
    pub fn name(mut self, name: Option<&str>) -> Self {
        self.name = name.map(str::to_string);
        self
    }

    /// Sub-stream such as `events` or `pods`
    #[must_use]
    pub fn qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    #[must_use]
    pub fn belongs_to(&self, key: &ConnectionKey) -> bool {
        &self.connection == key
    }
}

impl fmt::Display for StreamTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.connection,
            self.kind,
            self.namespace.as_deref().unwrap_or("*"),
            self.name.as_deref().unwrap_or("*"),
        )?;
        if let Some(qualifier) = &self.qualifier {
            write!(f, "/{qualifier}")?;
        }
        Ok(())
    }
}
