//! Error types for the runtime and the boundary bridge.
//!
//! The crate distinguishes three failure classes:
//!
//! - **Setup and boundary errors** are ordinary values of [`Error`], returned
//!   from fallible public entry points (port declaration, flag decoding,
//!   inbound injection). They are never retried.
//! - **Protocol violations** observed by the replay harness live in
//!   [`crate::replay::ReplayError`].
//! - **Programming defects** (duplicate process registration, unknown channel
//!   ids, channel payload type confusion) abort immediately with a panic
//!   naming the offending id, mirroring the registration invariants of the
//!   process and channel tables.

use crate::decode::DecodeError;

/// A convenient alias for results carrying [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by program setup and the boundary channel bridge.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// A boundary port name was declared twice, in either direction.
    #[error("boundary port `{name}` is declared twice")]
    DuplicatePort {
        /// The offending port name.
        name: String,
    },

    /// A host-side operation named a port that was never declared.
    #[error("no boundary port named `{name}`")]
    UnknownPort {
        /// The unknown port name.
        name: String,
    },

    /// The flags supplied at boot failed the program's flag decoder.
    #[error("invalid flags: {source}")]
    InvalidFlags {
        /// The structured decode trail.
        #[source]
        source: DecodeError,
    },

    /// An inbound payload failed the port's decoder.
    ///
    /// The injection is fatal and nothing is delivered; the error names the
    /// port and carries the full field/index trail.
    #[error("invalid payload for inbound port `{port}`: {source}")]
    InboundDecode {
        /// The inbound port the payload was sent to.
        port: String,
        /// The structured decode trail.
        #[source]
        source: DecodeError,
    },
}

impl Error {
    /// The port name this error is about, if any.
    #[must_use]
    pub fn port_name(&self) -> Option<&str> {
        match self {
            Self::DuplicatePort { name } | Self::UnknownPort { name } => Some(name),
            Self::InboundDecode { port, .. } => Some(port),
            Self::InvalidFlags { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode;
    use serde_json::json;

    #[test]
    fn inbound_decode_names_port_and_trail() {
        let source = decode::int().run(&json!("nope")).unwrap_err();
        let err = Error::InboundDecode {
            port: "in".to_string(),
            source,
        };
        let text = err.to_string();
        assert!(text.contains("`in`"), "missing port name: {text}");
        assert_eq!(err.port_name(), Some("in"));
    }
}
