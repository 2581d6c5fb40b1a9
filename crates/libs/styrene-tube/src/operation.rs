//! "Offer or accept, then wait for the tube to open" as one completable
//! operation.
//!
//! [`OpenSequence`] is the pure transition table. The driver spawned by the
//! channels feeds it the call result, a re-sampled tube state and the
//! tube's notifications, and completes a [`TubeConnectionOperation`] with
//! whatever terminal outcome the sequence reports first.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{names, TubeError};
use crate::tube::StreamTube;
use crate::types::*;

/// Which side of the tube is being opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenKind {
    /// Outgoing tube; the remote side still has to accept.
    Offer,
    /// Incoming tube; the local accept is being completed.
    Accept,
}

impl OpenKind {
    /// The one non-open state the tube may sit in while the operation waits.
    pub fn waiting_state(self) -> TubeState {
        match self {
            Self::Offer => TubeState::RemotePending,
            Self::Accept => TubeState::LocalPending,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenPhase {
    Calling,
    WaitingForOpen,
    Open,
    Refused,
    Failed,
}

impl OpenPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Open | Self::Refused | Self::Failed)
    }
}

/// Terminal result reported by [`OpenSequence`]. `Ok` means the tube is open.
pub type OpenOutcome = Result<(), TubeError>;

/// Transition table for one open attempt. Every input returns the terminal
/// outcome the first time one is reached and `None` otherwise.
#[derive(Debug)]
pub struct OpenSequence {
    kind: OpenKind,
    phase: OpenPhase,
}

impl OpenSequence {
    pub fn new(kind: OpenKind) -> Self {
        Self {
            kind,
            phase: OpenPhase::Calling,
        }
    }

    pub fn kind(&self) -> OpenKind {
        self.kind
    }

    pub fn phase(&self) -> OpenPhase {
        self.phase
    }

    /// The offer/accept call returned. `current` is the tube state sampled
    /// after subscribing to notifications; it only completes the sequence
    /// if the tube is already open.
    pub fn call_finished(
        &mut self,
        result: Result<(), TubeError>,
        current: TubeState,
    ) -> Option<OpenOutcome> {
        if self.phase != OpenPhase::Calling {
            return None;
        }
        if let Err(error) = result {
            self.phase = OpenPhase::Failed;
            return Some(Err(error));
        }
        self.phase = OpenPhase::WaitingForOpen;
        if current == TubeState::Open {
            self.phase = OpenPhase::Open;
            return Some(Ok(()));
        }
        None
    }

    /// A state notification. Ignored unless waiting for the tube to open.
    pub fn state_changed(&mut self, state: TubeState) -> Option<OpenOutcome> {
        if self.phase != OpenPhase::WaitingForOpen {
            return None;
        }
        if state == TubeState::Open {
            self.phase = OpenPhase::Open;
            Some(Ok(()))
        } else if state == self.kind.waiting_state() {
            None
        } else {
            self.phase = OpenPhase::Refused;
            Some(Err(TubeError::connection_refused()))
        }
    }

    /// The owning channel went away before the sequence finished.
    pub fn invalidated(&mut self, error: TubeError) -> Option<OpenOutcome> {
        if self.phase.is_terminal() {
            return None;
        }
        self.phase = OpenPhase::Failed;
        Some(Err(error))
    }
}

/// A tube that finished opening, with what was negotiated for it.
#[derive(Clone, Debug, PartialEq)]
pub struct TubeConnection {
    pub address_type: SocketAddressType,
    pub access_control: SocketAccessControl,
    /// The offered socket, or the socket to connect to after an accept.
    pub address: SocketAddress,
    /// Byte to send when connecting to an accepted Unix tube that requires
    /// credentials.
    pub credential_byte: Option<u8>,
    pub parameters: TubeParameters,
}

impl TubeConnection {
    pub fn requires_credentials(&self) -> bool {
        self.access_control == SocketAccessControl::Credentials
    }
}

/// Handle to an in-progress offer or accept.
#[must_use = "an operation does nothing observable unless awaited"]
#[derive(Debug)]
pub struct TubeConnectionOperation {
    result: oneshot::Receiver<Result<TubeConnection, TubeError>>,
}

impl TubeConnectionOperation {
    /// An operation that has already failed.
    pub fn failed(error: TubeError) -> Self {
        let (tx, result) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { result }
    }

    /// Wait for the terminal outcome.
    pub async fn finished(self) -> Result<TubeConnection, TubeError> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(TubeError::new(names::CANCELLED, "operation abandoned")),
        }
    }
}

/// What an open attempt asked for, before the call is made.
#[derive(Clone, Debug)]
pub(crate) struct OpenRequest {
    pub kind: OpenKind,
    pub address_type: SocketAddressType,
    pub access_control: SocketAccessControl,
    /// Offered socket; `None` for accepts, which learn it from the call.
    pub address: Option<SocketAddress>,
    pub credential_byte: Option<u8>,
    pub parameters: TubeParameters,
}

/// Spawn the driver for `request`. `call` performs the offer or accept and
/// yields the socket returned by the remote side, if any.
pub(crate) fn spawn_open<F>(
    tube: Arc<StreamTube>,
    request: OpenRequest,
    cancel: CancellationToken,
    call: F,
) -> TubeConnectionOperation
where
    F: Future<Output = Result<Option<SocketAddress>, TubeError>> + Send + 'static,
{
    let (tx, result) = oneshot::channel();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                Err(TubeError::new(names::CANCELLED, "channel dropped before the tube opened"))
            }
            outcome = drive_open(&tube, request, call) => outcome,
        };
        if let Err(err) = &outcome {
            log::warn!("tube({}): open failed: {}", tube.object_path(), err);
        }
        let _ = tx.send(outcome);
    });
    TubeConnectionOperation { result }
}

async fn drive_open<F>(
    tube: &StreamTube,
    request: OpenRequest,
    call: F,
) -> Result<TubeConnection, TubeError>
where
    F: Future<Output = Result<Option<SocketAddress>, TubeError>>,
{
    let mut sequence = OpenSequence::new(request.kind);

    // Subscribed before the call so no notification sent while it is in
    // flight is lost. State changes are held until the call returns.
    let mut events = tube.subscribe();
    if let Some(error) = tube.invalidation() {
        return fail(sequence.invalidated(error));
    }

    tokio::pin!(call);
    let mut buffered = Vec::new();
    let returned = loop {
        tokio::select! {
            result = &mut call => break result,
            event = events.recv() => match event {
                Ok(TubeEvent::Invalidated(error)) => return fail(sequence.invalidated(error)),
                Ok(TubeEvent::StateChanged(state)) => buffered.push(state),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return fail(sequence.invalidated(gone())),
            },
        }
    };

    let address = match returned {
        Ok(address) => address,
        Err(error) => return fail(sequence.call_finished(Err(error), TubeState::NotOffered)),
    };
    log::debug!(
        "tube({}): {:?} call returned",
        tube.object_path(),
        request.kind
    );

    if let Some(error) = tube.invalidation() {
        return fail(sequence.invalidated(error));
    }

    // The re-sample catches an open that happened before the subscription
    // saw it; state changes seen during the call are then replayed in order.
    let mut outcome = sequence.call_finished(Ok(()), tube.state());
    for state in buffered {
        if outcome.is_some() {
            break;
        }
        outcome = sequence.state_changed(state);
    }
    while outcome.is_none() {
        outcome = match events.recv().await {
            Ok(TubeEvent::StateChanged(state)) => sequence.state_changed(state),
            Ok(TubeEvent::Invalidated(error)) => sequence.invalidated(error),
            Ok(_) => None,
            Err(RecvError::Lagged(skipped)) => {
                log::debug!(
                    "tube({}): missed {} events while opening, re-sampling state",
                    tube.object_path(),
                    skipped
                );
                match tube.invalidation() {
                    Some(error) => sequence.invalidated(error),
                    None => sequence.state_changed(tube.state()),
                }
            }
            Err(RecvError::Closed) => sequence.invalidated(gone()),
        };
    }
    finish(outcome)?;

    let address = match (request.kind, address.or(request.address)) {
        (_, Some(address)) => address,
        (kind, None) => {
            return Err(TubeError::new(
                names::DISCONNECTED,
                format!("{kind:?} completed without a socket address"),
            ))
        }
    };

    match request.kind {
        OpenKind::Offer => tube.set_parameters(request.parameters.clone()),
        OpenKind::Accept => match &address {
            SocketAddress::Ip(ip) => tube.set_ip_address(*ip),
            SocketAddress::Unix(path) => tube.set_local_address(path.clone()),
        },
    }
    log::debug!("tube({}): open at {:?}", tube.object_path(), address);

    Ok(TubeConnection {
        address_type: request.address_type,
        access_control: request.access_control,
        address,
        credential_byte: request.credential_byte,
        parameters: request.parameters,
    })
}

fn finish(outcome: Option<OpenOutcome>) -> OpenOutcome {
    outcome.unwrap_or_else(|| Err(gone()))
}

/// Early exit for a sequence that can only have failed.
fn fail<T>(outcome: Option<OpenOutcome>) -> Result<T, TubeError> {
    Err(finish(outcome).err().unwrap_or_else(gone))
}

fn gone() -> TubeError {
    TubeError::orphaned("tube went away while opening")
}
