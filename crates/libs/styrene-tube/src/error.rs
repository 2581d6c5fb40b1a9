use serde::{Deserialize, Serialize};

/// Protocol error names carried by [`TubeError::name`].
pub mod names {
    pub const NOT_AVAILABLE: &str = "org.freedesktop.Telepathy.Error.NotAvailable";
    pub const NOT_IMPLEMENTED: &str = "org.freedesktop.Telepathy.Error.NotImplemented";
    pub const INVALID_ARGUMENT: &str = "org.freedesktop.Telepathy.Error.InvalidArgument";
    pub const CONNECTION_REFUSED: &str = "org.freedesktop.Telepathy.Error.ConnectionRefused";
    pub const ORPHANED: &str = "org.freedesktop.Telepathy.Error.Orphaned";
    pub const CANCELLED: &str = "org.freedesktop.Telepathy.Error.Cancelled";
    pub const DISCONNECTED: &str = "org.freedesktop.Telepathy.Error.Disconnected";
}

/// A failure as reported by the tube protocol: an error name plus a
/// human-readable message.
///
/// Every failure in this crate is represented as data. Call failures from
/// the proxy are carried through verbatim; locally detected failures use
/// one of the names in [`names`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, thiserror::Error)]
#[error("{name}: {message}")]
pub struct TubeError {
    pub name: String,
    pub message: String,
}

impl TubeError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn not_available(message: impl Into<String>) -> Self {
        Self::new(names::NOT_AVAILABLE, message)
    }

    pub fn not_implemented(method: impl Into<String>) -> Self {
        Self::new(
            names::NOT_IMPLEMENTED,
            format!("not implemented: {}", method.into()),
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(names::INVALID_ARGUMENT, message)
    }

    /// The fixed refusal reported when a tube leaves its pending state for
    /// anything other than `Open`.
    pub fn connection_refused() -> Self {
        Self::new(
            names::CONNECTION_REFUSED,
            "The connection to this tube was refused",
        )
    }

    pub fn orphaned(message: impl Into<String>) -> Self {
        Self::new(names::ORPHANED, message)
    }

    /// Combination of address type and access control the channel does not
    /// advertise.
    pub fn unsupported_socket() -> Self {
        Self::new(
            names::NOT_IMPLEMENTED,
            "The requested address type/access control combination is not supported",
        )
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_name_and_message() {
        let err = TubeError::new("Disconnected", "peer left");
        assert_eq!(err.to_string(), "Disconnected: peer left");
    }

    #[test]
    fn constructors_use_protocol_names() {
        let refused = TubeError::connection_refused();
        assert!(refused.is(names::CONNECTION_REFUSED));
        assert!(TubeError::orphaned("gone").is(names::ORPHANED));
        assert!(TubeError::unsupported_socket().is(names::NOT_IMPLEMENTED));
        assert_eq!(
            TubeError::not_implemented("offer").message,
            "not implemented: offer".to_owned()
        );
    }

    #[test]
    fn round_trips_through_json() {
        let err = TubeError::not_available("Channel busy");
        let json = serde_json::to_string(&err).expect("serialize");
        let back: TubeError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, err);
    }
}
