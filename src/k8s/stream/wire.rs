//! Wire format for browser clients.
//!
//! A stream is addressed with query parameters
//! (`profile`, `cluster`, optional `namespace`, `name`, `qualifier`) and each
//! flush travels as one server-sent event whose data line is the complete
//! JSON snapshot.

use super::broker::Frame;
use super::topic::StreamTopic;
use crate::error::{Error, Result};
use crate::k8s::registry::ConnectionKey;
use bytes::{BufMut, Bytes, BytesMut};

/// Target of a stream request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamQuery {
    pub connection: ConnectionKey,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub qualifier: Option<String>,
}

impl StreamQuery {
    #[must_use]
    pub const fn new(connection: ConnectionKey) -> Self {
        Self {
            connection,
            namespace: None,
            name: None,
            qualifier: None,
        }
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Parse a URL query string such as
    /// `profile=dev&cluster=kind&namespace=default&qualifier=events`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` if `profile` or `cluster` is missing or
    /// a parameter is unknown.
    pub fn parse(query: &str) -> Result<Self> {
        let mut profile = None;
        let mut cluster = None;
        let mut namespace = None;
        let mut name = None;
        let mut qualifier = None;

        for (key, value) in url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
            let value = Some(value.into_owned()).filter(|v| !v.is_empty());
            match key.as_ref() {
                "profile" => profile = value,
                "cluster" => cluster = value,
                "namespace" => namespace = value,
                "name" => name = value,
                "qualifier" => qualifier = value,
                other => return Err(Error::InvalidQuery(format!("unknown parameter {other}"))),
            }
        }

        let profile = profile.ok_or_else(|| Error::InvalidQuery("missing profile".to_string()))?;
        let cluster = cluster.ok_or_else(|| Error::InvalidQuery("missing cluster".to_string()))?;
        Ok(Self {
            connection: ConnectionKey::new(profile, cluster),
            namespace,
            name,
            qualifier,
        })
    }

    /// Topic of this query for objects of `kind`
    #[must_use]
    pub fn topic(&self, kind: &str) -> StreamTopic {
        let topic = StreamTopic::new(self.connection.clone(), kind)
            .namespace(self.namespace.as_deref())
            .name(self.name.as_deref());
        match &self.qualifier {
            Some(qualifier) => topic.qualifier(qualifier.clone()),
            None => topic,
        }
    }
}

/// Encode one frame as a server-sent event.
///
/// Frames that follow dropped frames use the `resync` event name so clients
/// know intermediate states were skipped.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Bytes {
    let event = if frame.stale { "resync" } else { "snapshot" };
    let payload: &[u8] = if frame.payload.is_empty() {
        crate::k8s::cache::view::EMPTY_SNAPSHOT
    } else {
        &frame.payload
    };

    let mut out = BytesMut::with_capacity(payload.len() + 32);
    out.put_slice(b"event: ");
    out.put_slice(event.as_bytes());
    out.put_slice(b"\ndata: ");
    out.put_slice(payload);
    out.put_slice(b"\n\n");
    out.freeze()
}
