use async_trait::async_trait;

use crate::error::TubeError;
use crate::traits::*;
use crate::types::*;

/// A proxy that returns `NotImplemented` for every call.
///
/// Useful to wire a channel up before a real transport exists, and to
/// exercise the failure paths of offer and accept.
pub struct StubTubeProxy {
    object_path: String,
}

impl StubTubeProxy {
    pub fn new(object_path: impl Into<String>) -> Self {
        Self {
            object_path: object_path.into(),
        }
    }
}

impl Default for StubTubeProxy {
    fn default() -> Self {
        Self::new("/stub/tube")
    }
}

#[async_trait]
impl StreamTubeProxy for StubTubeProxy {
    fn object_path(&self) -> &str {
        &self.object_path
    }

    async fn request_properties(&self) -> Result<TubeProperties, TubeError> {
        Err(TubeError::not_implemented("request_properties"))
    }

    async fn offer(
        &self,
        _address_type: SocketAddressType,
        _address: SocketAddress,
        _access_control: SocketAccessControl,
        _parameters: TubeParameters,
    ) -> Result<(), TubeError> {
        Err(TubeError::not_implemented("offer"))
    }

    async fn accept(
        &self,
        _address_type: SocketAddressType,
        _access_control: SocketAccessControl,
        _param: AccessControlParam,
    ) -> Result<SocketAddress, TubeError> {
        Err(TubeError::not_implemented("accept"))
    }
}

/// A contact directory that cannot resolve anything.
pub struct StubDirectory;

#[async_trait]
impl ContactDirectory for StubDirectory {
    async fn contacts_for_handles(
        &self,
        _handles: &[HandleId],
    ) -> Result<Vec<ContactRef>, TubeError> {
        Err(TubeError::not_implemented("contacts_for_handles"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::names;

    #[tokio::test]
    async fn every_call_is_not_implemented() {
        let proxy = StubTubeProxy::default();
        assert_eq!(proxy.object_path(), "/stub/tube");

        let err = proxy.request_properties().await.expect_err("stub");
        assert!(err.is(names::NOT_IMPLEMENTED));

        let err = proxy
            .accept(
                SocketAddressType::Unix,
                SocketAccessControl::Localhost,
                AccessControlParam::None,
            )
            .await
            .expect_err("stub");
        assert_eq!(err.message, "not implemented: accept");

        let err = StubDirectory
            .contacts_for_handles(&[1])
            .await
            .expect_err("stub");
        assert!(err.is(names::NOT_IMPLEMENTED));
    }
}
