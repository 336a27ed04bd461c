//! Reply message representation.
//!
//! A [`Reply`] is the unit the dispatch loop hands to a subject: a frame
//! type tag, an optional carried error, and an opaque payload. Wire framing
//! and decoding into `Reply` happen in the transport layer; this module only
//! defines the surface the correlation core needs — the type tag, the error
//! predicate/extraction, and the typed body parse.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Message type tag carried by every frame.
pub type Kind = u16;

/// The distinguished acknowledgement type tag.
pub const ACK: Kind = 0;

/// An inbound reply correlated to one outstanding call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reply {
    // ---
    /// Frame type tag.
    kind: Kind,

    /// Carried error text for error-tagged replies.
    error: Option<Arc<str>>,

    /// Opaque body bytes; interpretation is up to the caller's schema.
    payload: Bytes,
}

impl Reply {
    // ---
    /// Create a reply with the given type tag and payload.
    pub fn new(kind: Kind, payload: Bytes) -> Self {
        // ---
        Self {
            kind,
            error: None,
            payload,
        }
    }

    /// Create an acknowledgement reply.
    pub fn ack() -> Self {
        Self::new(ACK, Bytes::new())
    }

    /// Create an error-tagged reply carrying a server/application error.
    pub fn remote_error(kind: Kind, reason: impl Into<Arc<str>>) -> Self {
        // ---
        Self {
            kind,
            error: Some(reason.into()),
            payload: Bytes::new(),
        }
    }

    /// The frame type tag.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Whether this reply is error-tagged.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Extract the carried error.
    ///
    /// Error-tagged replies are always treated as call-terminal by the
    /// standard accessors, so this is the error the awaiting caller sees.
    pub fn to_error(&self) -> Error {
        // ---
        match &self.error {
            Some(reason) => Error::Remote(Arc::clone(reason)),
            None => Error::Remote(Arc::from("unspecified remote error")),
        }
    }

    /// Borrow the raw payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Parse the payload into a typed body.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the payload is not valid JSON for `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        // ---
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Body {
        value: i32,
    }

    #[test]
    fn test_parse_typed_body() {
        // ---
        let reply = Reply::new(7, Bytes::from(r#"{"value":42}"#));
        let body: Body = reply.parse().unwrap();
        assert_eq!(body, Body { value: 42 });
    }

    #[test]
    fn test_parse_rejects_malformed_body() {
        // ---
        let reply = Reply::new(7, Bytes::from("not json"));
        let err = reply.parse::<Body>().unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_predicate_and_extraction() {
        // ---
        let reply = Reply::remote_error(3, "backend unavailable");
        assert!(reply.is_error());

        match reply.to_error() {
            Error::Remote(reason) => assert_eq!(&*reason, "backend unavailable"),
            other => panic!("expected remote error, got {other:?}"),
        }

        assert!(!Reply::ack().is_error());
    }
}
