//! Client side of styrene stream tubes.
//!
//! A stream tube carries a byte stream between a local socket and a remote
//! contact. This crate wraps a tube channel proxy and provides:
//!
//! - **Offer and accept** as a single [`TubeConnectionOperation`] that
//!   completes once the tube is open, or fails with a protocol error
//! - **Ordered contact resolution** through [`ContactResolutionQueue`]:
//!   one directory lookup at a time, results in request order
//! - **Connection tracking** on outgoing tubes, mapping connection ids to
//!   contacts, source addresses and credential bytes
//! - **Stubs** returning `NotImplemented` for wiring and failure tests
//!
//! # Collaborators
//!
//! The transport is abstracted behind two traits:
//!
//! - [`StreamTubeProxy`] for the offer/accept/introspection calls
//! - [`ContactDirectory`] for resolving handles into contacts
//!
//! Protocol signals are fed to a channel as an
//! `mpsc::UnboundedReceiver<ProtocolEvent>`; channels publish
//! [`TubeEvent`]s to any number of broadcast subscribers.

pub mod channel;
pub mod config;
pub mod correlator;
pub mod error;
pub mod operation;
pub mod queue;
pub mod traits;
pub mod tube;
pub mod types;

pub use channel::{IncomingStreamTubeChannel, OutgoingStreamTubeChannel};
pub use config::TubeConfig;
pub use correlator::{ConnectionCorrelator, ConnectionState, Correlation};
pub use error::TubeError;
pub use operation::{OpenKind, OpenPhase, OpenSequence, TubeConnection, TubeConnectionOperation};
pub use queue::{ContactResolutionQueue, HandleRequest, QueueEvent, RequestToken};
pub use traits::{ContactDirectory, StreamTubeProxy};
pub use tube::StreamTube;
pub use types::*;

mod stub;
pub use stub::{StubDirectory, StubTubeProxy};
