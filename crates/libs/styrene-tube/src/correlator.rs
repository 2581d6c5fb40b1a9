//! Matching resolved contacts back to the connection events that asked for
//! them.
//!
//! Per connection id the lifecycle is
//! `Unseen → PendingAdd → Active → PendingRemove → Removed`. Adds enqueue a
//! contact lookup; closes enqueue an empty barrier so they cannot overtake an
//! add that is still resolving.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::TubeError;
use crate::queue::RequestToken;
use crate::types::*;

#[derive(Clone, Debug, PartialEq)]
struct PendingConnection {
    connection_id: ConnectionId,
    parameter: AccessControlParam,
}

#[derive(Clone, Debug, PartialEq)]
struct ClosedConnection {
    connection_id: ConnectionId,
    error: TubeError,
}

/// Connection-to-contact bookkeeping for one outgoing tube.
#[derive(Clone, Debug, Default)]
pub struct ConnectionState {
    contacts: HashMap<ConnectionId, ContactRef>,
    source_addresses: HashMap<SocketAddr, Vec<ConnectionId>>,
    credentials: HashMap<u8, Vec<ConnectionId>>,
}

impl ConnectionState {
    pub fn contact(&self, connection_id: ConnectionId) -> Option<&ContactRef> {
        self.contacts.get(&connection_id)
    }

    pub fn contacts_for_connections(&self) -> &HashMap<ConnectionId, ContactRef> {
        &self.contacts
    }

    /// Several live connections may share a source address; each key lists
    /// them in the order they were added.
    pub fn connections_for_source_addresses(&self) -> &HashMap<SocketAddr, Vec<ConnectionId>> {
        &self.source_addresses
    }

    /// Credential bytes are one random byte per peer, so they can collide.
    pub fn connections_for_credentials(&self) -> &HashMap<u8, Vec<ConnectionId>> {
        &self.credentials
    }

    /// Drop every trace of `connection_id`, returning the contact it was
    /// mapped to.
    fn remove(&mut self, connection_id: ConnectionId) -> Option<ContactRef> {
        forget(&mut self.source_addresses, connection_id);
        forget(&mut self.credentials, connection_id);
        self.contacts.remove(&connection_id)
    }

    fn clear(&mut self) {
        self.contacts.clear();
        self.source_addresses.clear();
        self.credentials.clear();
    }
}

fn forget<K>(map: &mut HashMap<K, Vec<ConnectionId>>, connection_id: ConnectionId) {
    map.retain(|_, ids| {
        ids.retain(|id| *id != connection_id);
        !ids.is_empty()
    });
}

/// What a resolved token turned out to mean.
#[derive(Clone, Debug, PartialEq)]
pub enum Correlation {
    Added {
        connection_id: ConnectionId,
        contact: Option<ContactRef>,
    },
    Removed {
        connection_id: ConnectionId,
        error: TubeError,
        contact: Option<ContactRef>,
    },
    /// The token matched no pending add or close.
    Unmatched,
}

#[derive(Debug, Default)]
pub struct ConnectionCorrelator {
    pending_adds: HashMap<RequestToken, PendingConnection>,
    pending_removes: HashMap<RequestToken, ClosedConnection>,
    state: ConnectionState,
}

impl ConnectionCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `token` resolves the peer of a new connection.
    pub fn connection_added(
        &mut self,
        token: RequestToken,
        connection_id: ConnectionId,
        parameter: AccessControlParam,
    ) {
        let pending = PendingConnection {
            connection_id,
            parameter,
        };
        self.pending_adds.insert(token, pending);
    }

    /// Record that `token` is the ordering barrier for a closed connection.
    pub fn connection_closed(
        &mut self,
        token: RequestToken,
        connection_id: ConnectionId,
        error: TubeError,
    ) {
        let closed = ClosedConnection {
            connection_id,
            error,
        };
        self.pending_removes.insert(token, closed);
    }

    /// Apply a queue result.
    ///
    /// `address_type` and `access_control` describe the socket the tube was
    /// offered with; they decide whether a connection parameter is tracked as
    /// a source address, a credential byte, or not at all.
    pub fn resolve(
        &mut self,
        token: RequestToken,
        contacts: &[ContactRef],
        address_type: SocketAddressType,
        access_control: SocketAccessControl,
    ) -> Correlation {
        if let Some(pending) = self.pending_adds.remove(&token) {
            let connection_id = pending.connection_id;
            for contact in contacts {
                self.state.contacts.insert(connection_id, contact.clone());
            }
            self.track_parameter(
                connection_id,
                pending.parameter,
                address_type,
                access_control,
            );
            return Correlation::Added {
                connection_id,
                contact: self.state.contacts.get(&connection_id).cloned(),
            };
        }

        if let Some(closed) = self.pending_removes.remove(&token) {
            let contact = self.state.remove(closed.connection_id);
            return Correlation::Removed {
                connection_id: closed.connection_id,
                error: closed.error,
                contact,
            };
        }

        log::warn!(
            "no pending connection event for request {} ({} contacts)",
            token,
            contacts.len()
        );
        Correlation::Unmatched
    }

    fn track_parameter(
        &mut self,
        connection_id: ConnectionId,
        parameter: AccessControlParam,
        address_type: SocketAddressType,
        access_control: SocketAccessControl,
    ) {
        match parameter {
            AccessControlParam::Address(address) if address_type.is_ip() => {
                self.state
                    .source_addresses
                    .entry(address)
                    .or_default()
                    .push(connection_id);
            }
            AccessControlParam::Credential(byte)
                if address_type.is_unix() && access_control == SocketAccessControl::Credentials =>
            {
                self.state
                    .credentials
                    .entry(byte)
                    .or_default()
                    .push(connection_id);
            }
            _ => {}
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Adds and closes whose tokens have not come back yet.
    pub fn pending(&self) -> usize {
        self.pending_adds.len() + self.pending_removes.len()
    }

    /// Forget everything, including requests still in the queue. Their
    /// results will come back as [`Correlation::Unmatched`].
    pub fn clear(&mut self) {
        self.pending_adds.clear();
        self.pending_removes.clear();
        self.state.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    use crate::queue::{ContactResolutionQueue, QueueEvent};
    use crate::traits::ContactDirectory;

    const UNIX: SocketAddressType = SocketAddressType::Unix;
    const IPV4: SocketAddressType = SocketAddressType::Ipv4;
    const LOCALHOST: SocketAccessControl = SocketAccessControl::Localhost;
    const PORT: SocketAccessControl = SocketAccessControl::Port;
    const CREDENTIALS: SocketAccessControl = SocketAccessControl::Credentials;

    fn contact(handle: HandleId, id: &str) -> ContactRef {
        Arc::new(Contact::new(handle, id))
    }

    struct Directory;

    #[async_trait::async_trait]
    impl ContactDirectory for Directory {
        async fn contacts_for_handles(
            &self,
            handles: &[HandleId],
        ) -> Result<Vec<ContactRef>, TubeError> {
            Ok(handles
                .iter()
                .map(|h| contact(*h, if *h == 5 { "alice" } else { "bob" }))
                .collect())
        }
    }

    fn tokens(queue: &ContactResolutionQueue, n: usize) -> Vec<RequestToken> {
        (0..n).map(|_| queue.enqueue(Vec::new())).collect()
    }

    async fn resolved(
        events: &mut mpsc::UnboundedReceiver<QueueEvent>,
    ) -> (RequestToken, Vec<ContactRef>) {
        loop {
            match events.recv().await.expect("queue alive") {
                QueueEvent::Resolved { token, contacts } => {
                    return (token, contacts.unwrap_or_default());
                }
                QueueEvent::Drained => continue,
            }
        }
    }

    #[tokio::test]
    async fn add_then_close_round_trip() {
        let (queue, mut events) = ContactResolutionQueue::new(Arc::new(Directory));
        let mut correlator = ConnectionCorrelator::new();
        let peer_left = TubeError::new("Disconnected", "peer left");

        let add = queue.enqueue(vec![5]);
        correlator.connection_added(add, 7, AccessControlParam::None);
        let close = queue.enqueue(Vec::new());
        correlator.connection_closed(close, 7, peer_left.clone());
        assert_eq!(correlator.pending(), 2);

        let (token, contacts) = resolved(&mut events).await;
        let added = correlator.resolve(token, &contacts, UNIX, LOCALHOST);
        let alice = contact(5, "alice");
        assert_eq!(
            added,
            Correlation::Added {
                connection_id: 7,
                contact: Some(alice.clone()),
            }
        );
        assert_eq!(correlator.state().contact(7), Some(&alice));

        let (token, contacts) = resolved(&mut events).await;
        let removed = correlator.resolve(token, &contacts, UNIX, LOCALHOST);
        assert_eq!(
            removed,
            Correlation::Removed {
                connection_id: 7,
                error: peer_left,
                contact: Some(alice),
            }
        );
        assert!(correlator.state().contacts_for_connections().is_empty());
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn unknown_token_changes_nothing() {
        let (queue, _events) = ContactResolutionQueue::new(Arc::new(Directory));
        let mut correlator = ConnectionCorrelator::new();
        let known = tokens(&queue, 2);
        correlator.connection_added(known[0], 1, AccessControlParam::None);

        let outcome = correlator.resolve(known[1], &[contact(5, "alice")], IPV4, PORT);
        assert_eq!(outcome, Correlation::Unmatched);
        assert!(correlator.state().contacts_for_connections().is_empty());
        assert_eq!(correlator.pending(), 1);
    }

    #[tokio::test]
    async fn tracks_source_address_for_ip_tubes() {
        let (queue, _events) = ContactResolutionQueue::new(Arc::new(Directory));
        let mut correlator = ConnectionCorrelator::new();
        let source: SocketAddr = "127.0.0.1:50123".parse().expect("addr");

        let t = tokens(&queue, 2);
        correlator.connection_added(t[0], 3, AccessControlParam::Address(source));
        correlator.resolve(t[0], &[contact(2, "bob")], IPV4, PORT);
        let state = correlator.state();
        assert_eq!(
            state.connections_for_source_addresses().get(&source),
            Some(&vec![3])
        );
        assert!(state.connections_for_credentials().is_empty());

        correlator.connection_closed(t[1], 3, TubeError::orphaned("x"));
        correlator.resolve(t[1], &[], IPV4, PORT);
        let state = correlator.state();
        assert!(state.connections_for_source_addresses().is_empty());
    }

    #[tokio::test]
    async fn tracks_credentials_only_with_credentials_access_control() {
        let (queue, _events) = ContactResolutionQueue::new(Arc::new(Directory));
        let mut correlator = ConnectionCorrelator::new();
        let t = tokens(&queue, 2);
        let byte = AccessControlParam::Credential(0x2a);

        correlator.connection_added(t[0], 1, byte.clone());
        correlator.resolve(t[0], &[], UNIX, LOCALHOST);
        assert!(correlator.state().connections_for_credentials().is_empty());

        correlator.connection_added(t[1], 2, byte);
        correlator.resolve(t[1], &[], SocketAddressType::AbstractUnix, CREDENTIALS);
        let credentials = correlator.state().connections_for_credentials();
        assert_eq!(credentials.get(&0x2a), Some(&vec![2]));
    }

    #[tokio::test]
    async fn shared_credential_byte_keeps_both_connections() {
        let (queue, _events) = ContactResolutionQueue::new(Arc::new(Directory));
        let mut correlator = ConnectionCorrelator::new();
        let t = tokens(&queue, 3);
        let byte = AccessControlParam::Credential(0x2a);

        correlator.connection_added(t[0], 8, byte.clone());
        correlator.resolve(t[0], &[], UNIX, CREDENTIALS);
        correlator.connection_added(t[1], 9, byte);
        correlator.resolve(t[1], &[], UNIX, CREDENTIALS);
        let credentials = correlator.state().connections_for_credentials();
        assert_eq!(credentials.get(&0x2a), Some(&vec![8, 9]));

        correlator.connection_closed(t[2], 9, TubeError::orphaned("left"));
        correlator.resolve(t[2], &[], UNIX, CREDENTIALS);
        let credentials = correlator.state().connections_for_credentials();
        assert_eq!(credentials.get(&0x2a), Some(&vec![8]));
    }

    #[tokio::test]
    async fn shared_source_address_removed_per_connection() {
        let (queue, _events) = ContactResolutionQueue::new(Arc::new(Directory));
        let mut correlator = ConnectionCorrelator::new();
        let source: SocketAddr = "127.0.0.1:50123".parse().expect("addr");
        let t = tokens(&queue, 4);

        correlator.connection_added(t[0], 1, AccessControlParam::Address(source));
        correlator.resolve(t[0], &[], IPV4, PORT);
        correlator.connection_added(t[1], 2, AccessControlParam::Address(source));
        correlator.resolve(t[1], &[], IPV4, PORT);

        correlator.connection_closed(t[2], 1, TubeError::orphaned("left"));
        correlator.resolve(t[2], &[], IPV4, PORT);
        let sources = correlator.state().connections_for_source_addresses();
        assert_eq!(sources.get(&source), Some(&vec![2]));

        correlator.connection_closed(t[3], 2, TubeError::orphaned("left"));
        correlator.resolve(t[3], &[], IPV4, PORT);
        let sources = correlator.state().connections_for_source_addresses();
        assert!(sources.is_empty());
    }

    #[tokio::test]
    async fn closing_unknown_connection_still_reports() {
        let (queue, _events) = ContactResolutionQueue::new(Arc::new(Directory));
        let mut correlator = ConnectionCorrelator::new();
        let t = tokens(&queue, 1);

        correlator.connection_closed(t[0], 99, TubeError::orphaned("gone"));
        let outcome = correlator.resolve(t[0], &[], UNIX, LOCALHOST);
        assert_eq!(
            outcome,
            Correlation::Removed {
                connection_id: 99,
                error: TubeError::orphaned("gone"),
                contact: None,
            }
        );
    }

    #[tokio::test]
    async fn clear_discards_pending_and_state() {
        let (queue, _events) = ContactResolutionQueue::new(Arc::new(Directory));
        let mut correlator = ConnectionCorrelator::new();
        let t = tokens(&queue, 2);
        correlator.connection_added(t[0], 1, AccessControlParam::None);
        correlator.resolve(t[0], &[contact(5, "alice")], UNIX, LOCALHOST);
        correlator.connection_added(t[1], 2, AccessControlParam::None);

        correlator.clear();
        assert_eq!(correlator.pending(), 0);
        assert!(correlator.state().contacts_for_connections().is_empty());
        let late = correlator.resolve(t[1], &[], UNIX, LOCALHOST);
        assert_eq!(late, Correlation::Unmatched);
    }
}
