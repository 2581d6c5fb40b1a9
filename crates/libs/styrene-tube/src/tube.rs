use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::error::TubeError;
use crate::types::*;

/// State shared by incoming and outgoing stream tubes, and the broadcast
/// channel their subscribers listen on.
///
/// Only the owning channel's dispatch loop and its open operations mutate
/// this; readers get snapshots.
pub struct StreamTube {
    object_path: String,
    requested: bool,
    inner: Mutex<TubeInner>,
    events: broadcast::Sender<TubeEvent>,
}

struct TubeInner {
    ready: bool,
    /// `None` until the initial state has been introspected.
    state: Option<TubeState>,
    parameters: TubeParameters,
    service: String,
    supported: SupportedSocketMap,
    address_type: SocketAddressType,
    access_control: SocketAccessControl,
    ip_address: Option<SocketAddr>,
    local_address: Option<String>,
    connections: BTreeSet<ConnectionId>,
    invalidated: Option<TubeError>,
}

impl StreamTube {
    pub fn new(object_path: impl Into<String>, requested: bool, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            object_path: object_path.into(),
            requested,
            inner: Mutex::new(TubeInner {
                ready: false,
                state: None,
                parameters: TubeParameters::new(),
                service: String::new(),
                supported: SupportedSocketMap::new(),
                address_type: SocketAddressType::Unix,
                access_control: SocketAccessControl::Localhost,
                ip_address: None,
                local_address: None,
                connections: BTreeSet::new(),
                invalidated: None,
            }),
            events,
        }
    }

    fn inner(&self) -> MutexGuard<'_, TubeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: TubeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    /// `true` for locally requested (outgoing) tubes.
    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TubeEvent> {
        self.events.subscribe()
    }

    // ── Readiness ─────────────────────────────────────────────────────────────

    pub fn is_ready(&self) -> bool {
        self.inner().ready
    }

    /// Store introspected properties and mark the tube ready.
    ///
    /// A state notification that raced ahead of introspection wins over the
    /// introspected state.
    pub fn apply_properties(&self, properties: TubeProperties) {
        let mut inner = self.inner();
        if inner.state.is_none() {
            inner.state = Some(properties.state);
        }
        inner.parameters = properties.parameters;
        inner.service = properties.service;
        inner.supported = properties.supported_socket_types;
        inner.ready = true;
        log::debug!(
            "tube({}): ready in state {:?}",
            self.object_path,
            inner.state
        );
    }

    // ── Validity ──────────────────────────────────────────────────────────────

    pub fn is_valid(&self) -> bool {
        self.inner().invalidated.is_none()
    }

    pub fn invalidation(&self) -> Option<TubeError> {
        self.inner().invalidated.clone()
    }

    /// Mark the tube dead. Every live connection gets a synthesized close
    /// with an `Orphaned` error before `Invalidated` is published. Repeated
    /// calls are ignored.
    pub fn invalidate(&self, error: TubeError) {
        self.invalidate_with(error, |_| None);
    }

    /// Like [`StreamTube::invalidate`], with `contact_for` supplying the
    /// contact each synthesized close is reported with.
    pub fn invalidate_with<F>(&self, error: TubeError, contact_for: F)
    where
        F: Fn(ConnectionId) -> Option<ContactRef>,
    {
        let connections = {
            let mut inner = self.inner();
            if inner.invalidated.is_some() {
                return;
            }
            inner.invalidated = Some(error.clone());
            std::mem::take(&mut inner.connections)
        };

        if !connections.is_empty() {
            log::debug!(
                "tube({}): invalidated with {} connections remaining, synthesizing close events",
                self.object_path,
                connections.len()
            );
        }
        for connection_id in connections {
            self.publish(TubeEvent::ConnectionClosed {
                connection_id,
                error: TubeError::orphaned("parent tube invalidated, streams closing"),
                contact: contact_for(connection_id),
            });
        }

        log::debug!("tube({}): invalidated: {}", self.object_path, error);
        self.publish(TubeEvent::Invalidated(error));
    }

    // ── State ─────────────────────────────────────────────────────────────────

    /// Current tube state. Reports `NotOffered` until the tube is ready.
    pub fn state(&self) -> TubeState {
        let inner = self.inner();
        match (inner.ready, inner.state) {
            (true, Some(state)) => state,
            _ => {
                log::warn!(
                    "tube({}): state() used before the tube is ready",
                    self.object_path
                );
                TubeState::NotOffered
            }
        }
    }

    /// Apply a state change from the protocol.
    ///
    /// Subscribers are only told about changes after the initial state is
    /// known, and never about a state the tube is already in.
    pub fn set_state(&self, state: TubeState) {
        let previous = {
            let mut inner = self.inner();
            let previous = inner.state.replace(state);
            if previous == Some(state) {
                return;
            }
            previous
        };
        log::debug!("tube({}): state changed to {:?}", self.object_path, state);
        if previous.is_some() {
            self.publish(TubeEvent::StateChanged(state));
        }
    }

    // ── Properties ────────────────────────────────────────────────────────────

    pub fn parameters(&self) -> TubeParameters {
        let inner = self.inner();
        if !inner.ready {
            log::warn!(
                "tube({}): parameters() used before the tube is ready",
                self.object_path
            );
            return TubeParameters::new();
        }
        inner.parameters.clone()
    }

    pub fn set_parameters(&self, parameters: TubeParameters) {
        self.inner().parameters = parameters;
    }

    pub fn service(&self) -> String {
        self.inner().service.clone()
    }

    pub fn supported_socket_types(&self) -> SupportedSocketMap {
        self.inner().supported.clone()
    }

    pub fn supports(
        &self,
        address_type: SocketAddressType,
        access_control: SocketAccessControl,
    ) -> bool {
        let inner = self.inner();
        if !inner.ready {
            log::warn!(
                "tube({}): socket support queried before ready",
                self.object_path
            );
            return false;
        }
        inner
            .supported
            .get(&address_type)
            .is_some_and(|controls| controls.contains(&access_control))
    }

    // ── Socket ────────────────────────────────────────────────────────────────

    pub fn address_type(&self) -> SocketAddressType {
        self.inner().address_type
    }

    pub fn access_control(&self) -> SocketAccessControl {
        self.inner().access_control
    }

    pub fn set_socket(&self, address_type: SocketAddressType, access_control: SocketAccessControl) {
        let mut inner = self.inner();
        inner.address_type = address_type;
        inner.access_control = access_control;
    }

    /// The TCP endpoint of the tube; only meaningful once open.
    pub fn ip_address(&self) -> Option<SocketAddr> {
        let inner = self.inner();
        if inner.state != Some(TubeState::Open) {
            log::warn!("tube({}): not open, no IP address", self.object_path);
            return None;
        }
        inner.ip_address
    }

    /// The Unix socket path of the tube; only meaningful once open.
    pub fn local_address(&self) -> Option<String> {
        let inner = self.inner();
        if inner.state != Some(TubeState::Open) {
            log::warn!(
                "tube({}): not open, no local socket address",
                self.object_path
            );
            return None;
        }
        inner.local_address.clone()
    }

    pub fn set_ip_address(&self, address: SocketAddr) {
        self.inner().ip_address = Some(address);
    }

    pub fn set_local_address(&self, address: impl Into<String>) {
        self.inner().local_address = Some(address.into());
    }

    // ── Connections ───────────────────────────────────────────────────────────

    pub fn connections(&self) -> BTreeSet<ConnectionId> {
        self.inner().connections.clone()
    }

    /// Returns `false` if the connection was already known.
    pub fn add_connection(&self, connection_id: ConnectionId, contact: Option<ContactRef>) -> bool {
        if !self.inner().connections.insert(connection_id) {
            log::warn!(
                "tube({}): tried to add connection {} but it already was there",
                self.object_path,
                connection_id
            );
            return false;
        }
        self.publish(TubeEvent::NewConnection {
            connection_id,
            contact,
        });
        true
    }

    /// Returns `false` if the connection was not known.
    pub fn remove_connection(
        &self,
        connection_id: ConnectionId,
        error: TubeError,
        contact: Option<ContactRef>,
    ) -> bool {
        if !self.inner().connections.remove(&connection_id) {
            log::warn!(
                "tube({}): tried to remove connection {} but it wasn't there",
                self.object_path,
                connection_id
            );
            return false;
        }
        self.publish(TubeEvent::ConnectionClosed {
            connection_id,
            error,
            contact,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::names;
    use tokio::sync::broadcast::error::TryRecvError;

    fn ready_tube(state: TubeState) -> StreamTube {
        let tube = StreamTube::new("/tube/1", true, 16);
        let mut supported = SupportedSocketMap::new();
        supported.insert(
            SocketAddressType::Ipv4,
            vec![SocketAccessControl::Localhost],
        );
        tube.apply_properties(TubeProperties {
            state,
            parameters: TubeParameters::new(),
            service: "chess".into(),
            supported_socket_types: supported,
        });
        tube
    }

    #[test]
    fn state_is_not_offered_until_ready() {
        let tube = StreamTube::new("/tube/1", false, 4);
        assert_eq!(tube.state(), TubeState::NotOffered);
        let ipv4 = SocketAddressType::Ipv4;
        assert!(!tube.supports(ipv4, SocketAccessControl::Localhost));
    }

    #[test]
    fn state_change_before_introspection_is_silent() {
        let tube = StreamTube::new("/tube/1", false, 4);
        let mut rx = tube.subscribe();
        tube.set_state(TubeState::LocalPending);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        tube.apply_properties(TubeProperties {
            state: TubeState::NotOffered,
            parameters: TubeParameters::new(),
            service: String::new(),
            supported_socket_types: SupportedSocketMap::new(),
        });
        assert_eq!(tube.state(), TubeState::LocalPending);
    }

    #[test]
    fn same_state_is_not_republished() {
        let tube = ready_tube(TubeState::RemotePending);
        let mut rx = tube.subscribe();
        tube.set_state(TubeState::RemotePending);
        tube.set_state(TubeState::Open);
        assert_eq!(rx.try_recv(), Ok(TubeEvent::StateChanged(TubeState::Open)));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn supports_reads_socket_map() {
        let tube = ready_tube(TubeState::NotOffered);
        assert_eq!(tube.service(), "chess");
        let (ipv4, unix) = (SocketAddressType::Ipv4, SocketAddressType::Unix);
        assert!(tube.supports(ipv4, SocketAccessControl::Localhost));
        assert!(!tube.supports(ipv4, SocketAccessControl::Port));
        assert!(!tube.supports(unix, SocketAccessControl::Localhost));
    }

    #[test]
    fn addresses_hidden_until_open() {
        let tube = ready_tube(TubeState::RemotePending);
        let addr: SocketAddr = "127.0.0.1:4000".parse().expect("addr");
        tube.set_ip_address(addr);
        assert_eq!(tube.ip_address(), None);
        tube.set_state(TubeState::Open);
        assert_eq!(tube.ip_address(), Some(addr));
        assert_eq!(tube.local_address(), None);
    }

    #[test]
    fn duplicate_and_unknown_connections_are_rejected() {
        let tube = ready_tube(TubeState::Open);
        let mut rx = tube.subscribe();
        assert!(tube.add_connection(1, None));
        assert!(!tube.add_connection(1, None));
        assert!(!tube.remove_connection(2, TubeError::orphaned("x"), None));
        let bye = TubeError::new("Disconnected", "bye");
        assert!(tube.remove_connection(1, bye, None));

        assert!(matches!(rx.try_recv(), Ok(TubeEvent::NewConnection { connection_id: 1, .. })));
        assert!(matches!(rx.try_recv(), Ok(TubeEvent::ConnectionClosed { connection_id: 1, .. })));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn invalidate_orphans_live_connections_once() {
        let tube = ready_tube(TubeState::Open);
        tube.add_connection(4, None);
        tube.add_connection(5, None);
        let mut rx = tube.subscribe();

        let reason = TubeError::new(names::CANCELLED, "closed");
        tube.invalidate(reason.clone());
        tube.invalidate(TubeError::new(names::CANCELLED, "again"));

        for expected in [4, 5] {
            match rx.try_recv() {
                Ok(TubeEvent::ConnectionClosed {
                    connection_id,
                    error,
                    ..
                }) => {
                    assert_eq!(connection_id, expected);
                    assert!(error.is(names::ORPHANED));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(rx.try_recv(), Ok(TubeEvent::Invalidated(reason)));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(!tube.is_valid());
        assert!(tube.connections().is_empty());
    }
}
