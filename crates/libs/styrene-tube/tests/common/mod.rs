#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use styrene_tube::*;
use tokio::sync::{broadcast, mpsc};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .is_test(true)
            .try_init();
    });
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

pub async fn next_event(rx: &mut broadcast::Receiver<TubeEvent>) -> TubeEvent {
    within(rx.recv()).await.expect("tube event")
}

pub fn supported(pairs: &[(SocketAddressType, SocketAccessControl)]) -> SupportedSocketMap {
    let mut map = SupportedSocketMap::new();
    for (address_type, access_control) in pairs {
        map.entry(*address_type).or_default().push(*access_control);
    }
    map
}

pub fn properties(state: TubeState, supported: SupportedSocketMap) -> TubeProperties {
    TubeProperties {
        state,
        parameters: TubeParameters::new(),
        service: "chess".into(),
        supported_socket_types: supported,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OfferCall {
    pub address_type: SocketAddressType,
    pub address: SocketAddress,
    pub access_control: SocketAccessControl,
    pub parameters: TubeParameters,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AcceptCall {
    pub address_type: SocketAddressType,
    pub access_control: SocketAccessControl,
    pub param: AccessControlParam,
}

/// Scriptable proxy. Protocol events are pushed with [`FakeProxy::send`];
/// `emit_on_call` events are pushed while an offer/accept is in flight.
pub struct FakeProxy {
    properties: TubeProperties,
    events: mpsc::UnboundedSender<ProtocolEvent>,
    emit_on_call: Vec<ProtocolEvent>,
    offer_result: Result<(), TubeError>,
    accept_result: Result<SocketAddress, TubeError>,
    pub offers: Mutex<Vec<OfferCall>>,
    pub accepts: Mutex<Vec<AcceptCall>>,
}

impl FakeProxy {
    pub fn new(properties: TubeProperties) -> (Self, mpsc::UnboundedReceiver<ProtocolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let proxy = Self {
            properties,
            events,
            emit_on_call: Vec::new(),
            offer_result: Ok(()),
            accept_result: Ok(SocketAddress::Ip("127.0.0.1:7000".parse().expect("addr"))),
            offers: Mutex::new(Vec::new()),
            accepts: Mutex::new(Vec::new()),
        };
        (proxy, rx)
    }

    pub fn emit_on_call(mut self, events: Vec<ProtocolEvent>) -> Self {
        self.emit_on_call = events;
        self
    }

    pub fn offer_result(mut self, result: Result<(), TubeError>) -> Self {
        self.offer_result = result;
        self
    }

    pub fn accept_result(mut self, result: Result<SocketAddress, TubeError>) -> Self {
        self.accept_result = result;
        self
    }

    pub fn send(&self, event: ProtocolEvent) {
        self.events.send(event).expect("channel alive");
    }

    fn emit(&self) {
        for event in &self.emit_on_call {
            let _ = self.events.send(event.clone());
        }
    }
}

#[async_trait]
impl StreamTubeProxy for FakeProxy {
    fn object_path(&self) -> &str {
        "/org/example/tube/1"
    }

    async fn request_properties(&self) -> Result<TubeProperties, TubeError> {
        Ok(self.properties.clone())
    }

    async fn offer(
        &self,
        address_type: SocketAddressType,
        address: SocketAddress,
        access_control: SocketAccessControl,
        parameters: TubeParameters,
    ) -> Result<(), TubeError> {
        self.offers.lock().expect("lock").push(OfferCall {
            address_type,
            address,
            access_control,
            parameters,
        });
        self.emit();
        // Let the dispatch task apply what was just emitted.
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.offer_result.clone()
    }

    async fn accept(
        &self,
        address_type: SocketAddressType,
        access_control: SocketAccessControl,
        param: AccessControlParam,
    ) -> Result<SocketAddress, TubeError> {
        self.accepts.lock().expect("lock").push(AcceptCall {
            address_type,
            access_control,
            param,
        });
        self.emit();
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.accept_result.clone()
    }
}

/// Directory with per-handle latency that tracks concurrent lookups.
pub struct DelayedDirectory {
    names: HashMap<HandleId, (String, u64)>,
    failing: HashSet<HandleId>,
    current: AtomicUsize,
    pub peak: AtomicUsize,
    pub calls: Mutex<Vec<Vec<HandleId>>>,
}

impl DelayedDirectory {
    pub fn new(entries: &[(HandleId, &str, u64)]) -> Self {
        Self {
            names: entries
                .iter()
                .map(|(h, id, delay)| (*h, (id.to_string(), *delay)))
                .collect(),
            failing: HashSet::new(),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_for(mut self, handle: HandleId) -> Self {
        self.failing.insert(handle);
        self
    }
}

#[async_trait]
impl ContactDirectory for DelayedDirectory {
    async fn contacts_for_handles(
        &self,
        handles: &[HandleId],
    ) -> Result<Vec<ContactRef>, TubeError> {
        self.calls.lock().expect("lock").push(handles.to_vec());
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = handles
            .iter()
            .filter_map(|h| self.names.get(h))
            .map(|(_, d)| *d)
            .max()
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        if handles.iter().any(|h| self.failing.contains(h)) {
            return Err(TubeError::not_available("contact lookup failed"));
        }
        let contacts = handles.iter().filter_map(|h| {
            let (id, _) = self.names.get(h)?;
            Some(Arc::new(Contact::new(*h, id.clone())))
        });
        Ok(contacts.collect())
    }
}
