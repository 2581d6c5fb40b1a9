use std::net::SocketAddr;
use std::sync::Arc;

use rand_core::{OsRng, RngCore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{address_type_for, ChannelCore};
use crate::config::TubeConfig;
use crate::error::TubeError;
use crate::operation::{spawn_open, OpenKind, OpenRequest, TubeConnectionOperation};
use crate::traits::StreamTubeProxy;
use crate::tube::StreamTube;
use crate::types::*;

/// A stream tube offered to us by a remote contact.
///
/// Connections on an incoming tube are made locally, so they are tracked
/// directly without any contact lookup.
pub struct IncomingStreamTubeChannel {
    core: ChannelCore,
}

impl IncomingStreamTubeChannel {
    /// Must be called inside a tokio runtime.
    pub fn new(
        proxy: Arc<dyn StreamTubeProxy>,
        events: mpsc::UnboundedReceiver<ProtocolEvent>,
        config: TubeConfig,
    ) -> Self {
        let core = ChannelCore::new(proxy, false, config);
        let dispatch = incoming_dispatch(core.tube.clone(), events, core.cancel.clone());
        tokio::spawn(dispatch);
        Self { core }
    }

    pub fn tube(&self) -> &StreamTube {
        &self.core.tube
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TubeEvent> {
        self.core.tube.subscribe()
    }

    pub async fn become_ready(&self) -> Result<(), TubeError> {
        self.core.become_ready().await
    }

    /// Accept the tube as a TCP socket.
    ///
    /// With no address, or an unspecified one, any local process may
    /// connect. A specific address restricts connections to that source
    /// address and port, so the port must be non-zero.
    pub fn accept_as_tcp_socket(&self, allowed: Option<SocketAddr>) -> TubeConnectionOperation {
        let core = &self.core;
        if let Err(error) = core.check_can_open(TubeState::LocalPending, "Channel not ready") {
            return TubeConnectionOperation::failed(error);
        }

        let localhost = SocketAccessControl::Localhost;
        let (address_type, access_control, param) = match allowed {
            None => (SocketAddressType::Ipv4, localhost, AccessControlParam::None),
            Some(addr) if addr.ip().is_unspecified() => {
                (address_type_for(&addr), localhost, AccessControlParam::None)
            }
            Some(addr) if addr.port() == 0 => {
                log::warn!(
                    "tube({}): Port access control needs a valid address and port, got {}",
                    core.path(),
                    addr
                );
                return TubeConnectionOperation::failed(TubeError::invalid_argument(
                    "The supplied allowed address and/or port was invalid",
                ));
            }
            Some(addr) => (
                address_type_for(&addr),
                SocketAccessControl::Port,
                AccessControlParam::Address(addr),
            ),
        };

        self.accept(address_type, access_control, param, None)
    }

    /// Accept the tube as a Unix socket. With `require_credentials` the
    /// connecting side must send the returned credential byte.
    pub fn accept_as_unix_socket(&self, require_credentials: bool) -> TubeConnectionOperation {
        let core = &self.core;
        if let Err(error) = core.check_can_open(TubeState::LocalPending, "Channel not ready") {
            return TubeConnectionOperation::failed(error);
        }

        let (access_control, credential_byte) = if require_credentials {
            let mut byte = [0u8; 1];
            OsRng.fill_bytes(&mut byte);
            (SocketAccessControl::Credentials, Some(byte[0]))
        } else {
            (SocketAccessControl::Localhost, None)
        };
        let param = match credential_byte {
            Some(byte) => AccessControlParam::Credential(byte),
            None => AccessControlParam::None,
        };

        let address_type = SocketAddressType::Unix;
        self.accept(address_type, access_control, param, credential_byte)
    }

    fn accept(
        &self,
        address_type: SocketAddressType,
        access_control: SocketAccessControl,
        param: AccessControlParam,
        credential_byte: Option<u8>,
    ) -> TubeConnectionOperation {
        if let Err(error) = self.core.check_supported(address_type, access_control) {
            return TubeConnectionOperation::failed(error);
        }
        self.core.tube.set_socket(address_type, access_control);

        log::debug!(
            "tube({}): accepting as {:?} socket with {:?} access control",
            self.core.path(),
            address_type,
            access_control
        );
        let request = OpenRequest {
            kind: OpenKind::Accept,
            address_type,
            access_control,
            address: None,
            credential_byte,
            parameters: self.core.tube.parameters(),
        };
        let proxy = self.core.proxy.clone();
        let tube = self.core.tube.clone();
        let cancel = self.core.cancel.clone();
        spawn_open(tube, request, cancel, async move {
            proxy
                .accept(address_type, access_control, param)
                .await
                .map(Some)
        })
    }
}

async fn incoming_dispatch(
    tube: Arc<StreamTube>,
    mut events: mpsc::UnboundedReceiver<ProtocolEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            ProtocolEvent::NewLocalConnection { connection_id } if tube.is_valid() => {
                tube.add_connection(connection_id, None);
            }
            ProtocolEvent::ConnectionClosed {
                connection_id,
                error,
            } if tube.is_valid() => {
                tube.remove_connection(connection_id, error, None);
            }
            ProtocolEvent::NewLocalConnection { .. } | ProtocolEvent::ConnectionClosed { .. } => {}
            ProtocolEvent::NewRemoteConnection { connection_id, .. } => {
                log::warn!(
                    "tube({}): ignoring remote connection {} on an incoming tube",
                    tube.object_path(),
                    connection_id
                );
            }
            ProtocolEvent::StateChanged(state) => tube.set_state(state),
            ProtocolEvent::Invalidated(error) => tube.invalidate(error),
        }
    }
    log::trace!("tube({}): dispatch stopped", tube.object_path());
}
