use async_trait::async_trait;

use crate::error::TubeError;
use crate::types::*;

/// Remote calls on a stream tube channel object.
///
/// Signals from the same object are not part of this trait; they are handed
/// to the channel as a stream of [`ProtocolEvent`]s at construction.
#[async_trait]
pub trait StreamTubeProxy: Send + Sync {
    /// Object path used to identify the channel in logs.
    fn object_path(&self) -> &str;

    /// Fetch the tube and stream tube properties.
    async fn request_properties(&self) -> Result<TubeProperties, TubeError>;

    /// Offer a local listening socket over the tube.
    async fn offer(
        &self,
        address_type: SocketAddressType,
        address: SocketAddress,
        access_control: SocketAccessControl,
        parameters: TubeParameters,
    ) -> Result<(), TubeError>;

    /// Accept an incoming tube. Returns the socket the local side should
    /// connect to.
    async fn accept(
        &self,
        address_type: SocketAddressType,
        access_control: SocketAccessControl,
        param: AccessControlParam,
    ) -> Result<SocketAddress, TubeError>;
}
