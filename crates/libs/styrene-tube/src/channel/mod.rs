//! Stream tube channels.
//!
//! Each channel owns a [`StreamTube`] and a dispatch task that applies the
//! proxy's [`ProtocolEvent`]s to it. Offer and accept calls run as separate
//! tasks and report through a [`TubeConnectionOperation`].
//!
//! [`ProtocolEvent`]: crate::ProtocolEvent
//! [`TubeConnectionOperation`]: crate::TubeConnectionOperation

mod incoming;
mod outgoing;

pub use incoming::IncomingStreamTubeChannel;
pub use outgoing::OutgoingStreamTubeChannel;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::TubeConfig;
use crate::error::TubeError;
use crate::traits::StreamTubeProxy;
use crate::tube::StreamTube;
use crate::types::*;

/// Plumbing shared by both channel directions.
struct ChannelCore {
    proxy: Arc<dyn StreamTubeProxy>,
    tube: Arc<StreamTube>,
    config: TubeConfig,
    cancel: CancellationToken,
}

impl ChannelCore {
    fn new(proxy: Arc<dyn StreamTubeProxy>, requested: bool, config: TubeConfig) -> Self {
        let tube = Arc::new(StreamTube::new(
            proxy.object_path(),
            requested,
            config.effective_event_capacity(),
        ));
        Self {
            proxy,
            tube,
            config,
            cancel: CancellationToken::new(),
        }
    }

    fn path(&self) -> &str {
        self.tube.object_path()
    }

    async fn become_ready(&self) -> Result<(), TubeError> {
        if self.tube.is_ready() {
            return Ok(());
        }
        if let Some(error) = self.tube.invalidation() {
            return Err(error);
        }
        let properties = self.proxy.request_properties().await.map_err(|err| {
            log::warn!("tube({}): introspection failed: {}", self.path(), err);
            err
        })?;
        self.tube.apply_properties(properties);
        Ok(())
    }

    /// Common preconditions for offer and accept: ready, still valid, and in
    /// the one state the call may be made from.
    fn check_can_open(&self, required: TubeState, wrong_state: &str) -> Result<(), TubeError> {
        if !self.tube.is_ready() {
            log::warn!(
                "tube({}): channel must be ready before opening the tube",
                self.path()
            );
            return Err(TubeError::not_available("Channel not ready"));
        }
        if let Some(error) = self.tube.invalidation() {
            return Err(error);
        }
        let state = self.tube.state();
        if state != required {
            log::warn!(
                "tube({}): cannot open the tube in state {:?}, expected {:?}",
                self.path(),
                state,
                required
            );
            return Err(TubeError::not_available(wrong_state));
        }
        Ok(())
    }

    fn check_supported(
        &self,
        address_type: SocketAddressType,
        access_control: SocketAccessControl,
    ) -> Result<(), TubeError> {
        if self.tube.supports(address_type, access_control) {
            return Ok(());
        }
        log::warn!(
            "tube({}): {:?} sockets with {:?} access control are not supported",
            self.path(),
            address_type,
            access_control
        );
        Err(TubeError::unsupported_socket())
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn address_type_for(address: &std::net::SocketAddr) -> SocketAddressType {
    if address.is_ipv4() {
        SocketAddressType::Ipv4
    } else {
        SocketAddressType::Ipv6
    }
}
