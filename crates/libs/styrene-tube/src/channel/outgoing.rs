use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{address_type_for, ChannelCore};
use crate::config::TubeConfig;
use crate::correlator::{ConnectionCorrelator, Correlation};
use crate::error::TubeError;
use crate::operation::{spawn_open, OpenKind, OpenRequest, TubeConnectionOperation};
use crate::queue::{ContactResolutionQueue, QueueEvent, RequestToken};
use crate::traits::{ContactDirectory, StreamTubeProxy};
use crate::tube::StreamTube;
use crate::types::*;

/// A stream tube we offer to a remote contact.
///
/// Every remote connection is resolved to the contact behind it before it is
/// announced, in the order the protocol reported it. Closes wait behind any
/// lookup still in progress so a connection is never reported closed before
/// it was reported open.
pub struct OutgoingStreamTubeChannel {
    core: ChannelCore,
    correlator: Arc<Mutex<ConnectionCorrelator>>,
    settle_requests: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl OutgoingStreamTubeChannel {
    /// Must be called inside a tokio runtime; spawns the channel's dispatch
    /// task and its contact resolution queue.
    pub fn new(
        proxy: Arc<dyn StreamTubeProxy>,
        directory: Arc<dyn ContactDirectory>,
        events: mpsc::UnboundedReceiver<ProtocolEvent>,
        config: TubeConfig,
    ) -> Self {
        let core = ChannelCore::new(proxy, true, config);
        let correlator = Arc::new(Mutex::new(ConnectionCorrelator::new()));
        let (settle_requests, settle_rx) = mpsc::unbounded_channel();
        let (queue, queue_events) = ContactResolutionQueue::new(directory);

        let dispatch = OutgoingDispatch {
            tube: core.tube.clone(),
            correlator: correlator.clone(),
            queue,
            queue_events,
            events,
            settle_requests: settle_rx,
            settle_waiters: Vec::new(),
            cancel: core.cancel.clone(),
        };
        tokio::spawn(dispatch.run());

        Self {
            core,
            correlator,
            settle_requests,
        }
    }

    pub fn tube(&self) -> &StreamTube {
        &self.core.tube
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TubeEvent> {
        self.core.tube.subscribe()
    }

    /// Introspect the channel. Offers are refused until this succeeds.
    pub async fn become_ready(&self) -> Result<(), TubeError> {
        self.core.become_ready().await
    }

    /// Offer a listening TCP socket.
    ///
    /// `Port` access control is used when the channel supports it (and the
    /// config prefers it), so that connections can be mapped back to their
    /// source addresses; otherwise `Localhost`.
    pub fn offer_tcp_socket(
        &self,
        address: SocketAddr,
        parameters: TubeParameters,
    ) -> TubeConnectionOperation {
        let core = &self.core;
        if let Err(error) = core.check_can_open(TubeState::NotOffered, "Channel busy") {
            return TubeConnectionOperation::failed(error);
        }

        let address_type = address_type_for(&address);
        let access_control = match self.ip_access_control(address_type) {
            Ok(access_control) => access_control,
            Err(error) => return TubeConnectionOperation::failed(error),
        };

        core.tube.set_socket(address_type, access_control);
        core.tube.set_ip_address(address);
        let address = SocketAddress::Ip(address);
        self.offer(address_type, address, access_control, parameters)
    }

    /// Offer a listening Unix socket. A path starting with NUL is treated as
    /// an abstract socket.
    pub fn offer_unix_socket(
        &self,
        path: impl Into<String>,
        parameters: TubeParameters,
        require_credentials: bool,
    ) -> TubeConnectionOperation {
        let core = &self.core;
        if let Err(error) = core.check_can_open(TubeState::NotOffered, "Channel busy") {
            return TubeConnectionOperation::failed(error);
        }

        let address = SocketAddress::Unix(path.into());
        let address_type = if address.is_abstract() {
            SocketAddressType::AbstractUnix
        } else {
            SocketAddressType::Unix
        };
        let access_control = if require_credentials {
            SocketAccessControl::Credentials
        } else {
            SocketAccessControl::Localhost
        };
        if let Err(error) = core.check_supported(address_type, access_control) {
            return TubeConnectionOperation::failed(error);
        }

        core.tube.set_socket(address_type, access_control);
        if let SocketAddress::Unix(path) = &address {
            core.tube.set_local_address(path.clone());
        }
        self.offer(address_type, address, access_control, parameters)
    }

    fn ip_access_control(
        &self,
        address_type: SocketAddressType,
    ) -> Result<SocketAccessControl, TubeError> {
        let preferred = if self.core.config.prefer_port_access_control {
            [SocketAccessControl::Port, SocketAccessControl::Localhost]
        } else {
            [SocketAccessControl::Localhost, SocketAccessControl::Port]
        };
        let tube = &self.core.tube;
        match preferred
            .into_iter()
            .find(|ac| tube.supports(address_type, *ac))
        {
            Some(access_control) => Ok(access_control),
            None => {
                let fallback = preferred[0];
                self.core.check_supported(address_type, fallback)?;
                Ok(fallback)
            }
        }
    }

    fn offer(
        &self,
        address_type: SocketAddressType,
        address: SocketAddress,
        access_control: SocketAccessControl,
        parameters: TubeParameters,
    ) -> TubeConnectionOperation {
        log::debug!(
            "tube({}): offering {:?} socket with {:?} access control",
            self.core.path(),
            address_type,
            access_control
        );
        let request = OpenRequest {
            kind: OpenKind::Offer,
            address_type,
            access_control,
            address: Some(address.clone()),
            credential_byte: None,
            parameters: parameters.clone(),
        };
        let proxy = self.core.proxy.clone();
        let tube = self.core.tube.clone();
        let cancel = self.core.cancel.clone();
        spawn_open(tube, request, cancel, async move {
            proxy
                .offer(address_type, address, access_control, parameters)
                .await
                .map(|()| None)
        })
    }

    // ── Connection maps ───────────────────────────────────────────────────────

    /// Contacts behind the currently open connections.
    pub fn contacts_for_connections(&self) -> HashMap<ConnectionId, ContactRef> {
        if !self.maps_available("contacts_for_connections") {
            return HashMap::new();
        }
        lock(&self.correlator)
            .state()
            .contacts_for_connections()
            .clone()
    }

    /// Only meaningful for tubes offered over TCP.
    pub fn connections_for_source_addresses(&self) -> HashMap<SocketAddr, Vec<ConnectionId>> {
        if !self.core.tube.address_type().is_ip() {
            log::warn!(
                "tube({}): connections_for_source_addresses() only makes sense for TCP sockets",
                self.core.path()
            );
            return HashMap::new();
        }
        if !self.maps_available("connections_for_source_addresses") {
            return HashMap::new();
        }
        lock(&self.correlator)
            .state()
            .connections_for_source_addresses()
            .clone()
    }

    /// Only meaningful for Unix tubes offered with credentials required.
    pub fn connections_for_credentials(&self) -> HashMap<u8, Vec<ConnectionId>> {
        let tube = &self.core.tube;
        if !tube.address_type().is_unix()
            || tube.access_control() != SocketAccessControl::Credentials
        {
            log::warn!(
                "tube({}): connections_for_credentials() only makes sense for Unix sockets \
                 requiring credentials",
                self.core.path()
            );
            return HashMap::new();
        }
        if !self.maps_available("connections_for_credentials") {
            return HashMap::new();
        }
        lock(&self.correlator)
            .state()
            .connections_for_credentials()
            .clone()
    }

    /// A valid tube only has connection data once it is open. Invalidation
    /// closes every connection and clears the maps, so an invalidated tube
    /// reports them empty without a warning.
    fn maps_available(&self, caller: &str) -> bool {
        let tube = &self.core.tube;
        if !tube.is_valid() {
            return true;
        }
        if !tube.is_ready() {
            log::warn!(
                "tube({}): channel must be ready before calling {}",
                self.core.path(),
                caller
            );
            return false;
        }
        if tube.state() != TubeState::Open {
            log::warn!(
                "tube({}): {} only makes sense when the tube is open",
                self.core.path(),
                caller
            );
            return false;
        }
        true
    }

    /// Resolves once every protocol event delivered before the call has been
    /// resolved and announced to subscribers.
    pub async fn settled(&self) {
        let (tx, rx) = oneshot::channel();
        if self.settle_requests.send(tx).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

fn lock(correlator: &Mutex<ConnectionCorrelator>) -> MutexGuard<'_, ConnectionCorrelator> {
    correlator.lock().unwrap_or_else(PoisonError::into_inner)
}

struct OutgoingDispatch {
    tube: Arc<StreamTube>,
    correlator: Arc<Mutex<ConnectionCorrelator>>,
    queue: ContactResolutionQueue,
    queue_events: mpsc::UnboundedReceiver<QueueEvent>,
    events: mpsc::UnboundedReceiver<ProtocolEvent>,
    settle_requests: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    settle_waiters: Vec<oneshot::Sender<()>>,
    cancel: CancellationToken,
}

impl OutgoingDispatch {
    async fn run(mut self) {
        let mut protocol_open = true;
        let mut settle_open = true;
        loop {
            // Protocol events win over queue results so every token is
            // recorded before a later result could need it.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.events.recv(), if protocol_open => match event {
                    Some(event) => self.handle_protocol(event),
                    None => {
                        let path = self.tube.object_path();
                        log::debug!("tube({path}): protocol event source closed");
                        protocol_open = false;
                    }
                },
                queued = self.queue_events.recv() => match queued {
                    Some(QueueEvent::Resolved { token, contacts }) => {
                        self.handle_resolved(token, contacts)
                    }
                    Some(QueueEvent::Drained) => {
                        log::trace!("tube({}): contact queue drained", self.tube.object_path());
                    }
                    None => break,
                },
                waiter = self.settle_requests.recv(), if settle_open => match waiter {
                    Some(waiter) => self.settle_waiters.push(waiter),
                    None => settle_open = false,
                },
            }
            self.notify_settled();
        }
        log::trace!("tube({}): dispatch stopped", self.tube.object_path());
    }

    fn handle_protocol(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::NewRemoteConnection {
                handle,
                parameter,
                connection_id,
            } => {
                if !self.tube.is_valid() {
                    return;
                }
                let token = self.queue.enqueue(vec![handle]);
                lock(&self.correlator).connection_added(token, connection_id, parameter);
                log::debug!(
                    "tube({}): new connection {} from handle {}, resolving as {}",
                    self.tube.object_path(),
                    connection_id,
                    handle,
                    token
                );
            }
            ProtocolEvent::ConnectionClosed {
                connection_id,
                error,
            } => {
                if !self.tube.is_valid() {
                    return;
                }
                let token = self.queue.enqueue(Vec::new());
                lock(&self.correlator).connection_closed(token, connection_id, error);
            }
            ProtocolEvent::NewLocalConnection { connection_id } => {
                log::warn!(
                    "tube({}): ignoring local connection {} on an outgoing tube",
                    self.tube.object_path(),
                    connection_id
                );
            }
            ProtocolEvent::StateChanged(state) => self.tube.set_state(state),
            ProtocolEvent::Invalidated(error) => {
                let mut correlator = lock(&self.correlator);
                let contacts = correlator.state().contacts_for_connections().clone();
                correlator.clear();
                drop(correlator);
                let contact_for = |id: ConnectionId| contacts.get(&id).cloned();
                self.tube.invalidate_with(error, contact_for);
            }
        }
    }

    fn handle_resolved(
        &mut self,
        token: RequestToken,
        contacts: Result<Vec<ContactRef>, TubeError>,
    ) {
        if !self.tube.is_valid() {
            log::debug!(
                "tube({}): invalidated, not emitting queued connection event {}",
                self.tube.object_path(),
                token
            );
            return;
        }

        // The queue already logged the failure.
        let contacts = contacts.unwrap_or_default();
        let correlation = lock(&self.correlator).resolve(
            token,
            &contacts,
            self.tube.address_type(),
            self.tube.access_control(),
        );

        match correlation {
            Correlation::Added {
                connection_id,
                contact,
            } => {
                self.tube.add_connection(connection_id, contact);
            }
            Correlation::Removed {
                connection_id,
                error,
                contact,
            } => {
                self.tube.remove_connection(connection_id, error, contact);
            }
            Correlation::Unmatched => {}
        }
    }

    fn notify_settled(&mut self) {
        if self.settle_waiters.is_empty() {
            return;
        }
        if lock(&self.correlator).pending() > 0 || !self.queue.is_idle() {
            return;
        }
        for waiter in self.settle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
