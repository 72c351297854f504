/// Operator-supervised pairing handshake
///
/// 1. A device writes `addr ‖ publicKey [‖ capabilities]` to the pair-request
///    characteristic. The request is kept for the pairing timeout.
/// 2. The operator accepts one pending address. The gateway writes
///    `addr ‖ channelId` to the pair-response characteristic. Only one offer
///    is outstanding; a new offer cancels the previous one.
/// 3. The device answers with `addr ‖ channelId ‖ signature(addr ‖ channelId)`
///    on the pair-response characteristic, signed with the key from step 1.
///    A valid answer enrolls the sensor.
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep_until, Duration, Instant};
use uuid::Uuid;

use crate::config::SharedSettings;
use crate::crypto::{PublicKey, SIGNATURE_LEN};
use crate::models::{Address, Capabilities, Sensor};
use crate::registry::SharedRegistry;

const CHANNEL_ID_LEN: usize = 16;
const OFFER_LEN: usize = Address::LEN + CHANNEL_ID_LEN;
pub const CONFIRMATION_LEN: usize = OFFER_LEN + SIGNATURE_LEN;

/// Pairing lifecycle notifications forwarded to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingEvent {
    RequestReceived(Address),
    RequestTimedOut(Address),
    Offered(Address),
    OfferCanceled(Address),
    OfferTimedOut(Address),
    Paired(Address),
    EnrollFailed(Address),
}

impl fmt::Display for PairingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingEvent::RequestReceived(a) => write!(f, "REQUEST-NEW:{}", a),
            PairingEvent::RequestTimedOut(a) => write!(f, "REQUEST-TIMEOUT:{}", a),
            PairingEvent::Offered(a) => write!(f, "PAIRING-WITH:{}", a),
            PairingEvent::OfferCanceled(a) => write!(f, "PAIRING-CANCELED:{}", a),
            PairingEvent::OfferTimedOut(a) => write!(f, "PAIRING-TIMEOUT:{}", a),
            PairingEvent::Paired(a) => write!(f, "PAIR-SUCCESS:{}", a),
            PairingEvent::EnrollFailed(a) => write!(f, "PAIR-FAILED:{}", a),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("pairing mode disabled")]
    Disabled,
    #[error("pair request from {0} not found")]
    RequestNotFound(Address),
}

/// Current value of the pair-response characteristic, shared with the transport.
#[derive(Debug, Clone, Default)]
pub struct ResponseValue(Arc<std::sync::Mutex<Vec<u8>>>);

impl ResponseValue {
    pub fn get(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set(&self, value: Vec<u8>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

#[derive(Debug)]
struct PendingRequest {
    public_key: PublicKey,
    capabilities: Capabilities,
    generation: u64,
}

#[derive(Debug)]
struct Offer {
    address: Address,
    channel: Uuid,
    request: PendingRequest,
    generation: u64,
}

#[derive(Debug, Default)]
struct PairingState {
    enabled: bool,
    requests: HashMap<Address, PendingRequest>,
    offer: Option<Offer>,
    generation: u64,
}

impl PairingState {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

pub struct Pairing {
    state: Mutex<PairingState>,
    registry: SharedRegistry,
    settings: SharedSettings,
    response: ResponseValue,
    events: broadcast::Sender<PairingEvent>,
    timeout: Duration,
}

impl Pairing {
    pub fn new(
        registry: SharedRegistry,
        settings: SharedSettings,
        response: ResponseValue,
        timeout: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Pairing {
            state: Mutex::new(PairingState::default()),
            registry,
            settings,
            response,
            events,
            timeout,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    pub async fn enable(&self) {
        self.state.lock().await.enabled = true;
        info!("Pairing started");
    }

    pub async fn disable(&self) {
        self.state.lock().await.enabled = false;
        info!("Pairing stopped");
    }

    /// Handles a write to the pair-request characteristic.
    pub async fn on_pair_request(self: &Arc<Self>, value: &[u8]) {
        let Some(address) = Address::from_prefix(value) else {
            warn!("Pair request too short ({} bytes)", value.len());
            return;
        };
        let (public_key, trailer) = match PublicKey::from_der_prefix(&value[Address::LEN..]) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Pair request from {} rejected: {}", address, e);
                return;
            }
        };
        let Some(capabilities) = Capabilities::from_trailer(trailer) else {
            warn!(
                "Pair request from {} rejected: malformed capabilities ({} bytes)",
                address,
                trailer.len()
            );
            return;
        };
        debug!(
            "Pair request from {} with a {}-byte key",
            address,
            public_key.der().len()
        );
        if self.registry.read().await.contains(&address) {
            warn!("Pair request from {} ignored: already paired", address);
            return;
        }

        let mut state = self.state.lock().await;
        if !state.enabled {
            debug!("Pair request from {} ignored: pairing disabled", address);
            return;
        }
        let offered = state.offer.as_ref().is_some_and(|o| o.address == address);
        if offered || state.requests.contains_key(&address) {
            debug!("Duplicate pair request from {}", address);
            return;
        }
        let generation = state.next_generation();
        state.requests.insert(
            address,
            PendingRequest {
                public_key,
                capabilities,
                generation,
            },
        );
        drop(state);

        self.arm_request_timeout(address, generation);
        info!(
            "Pair request from {} | PAIR-ACCEPT {} to accept",
            address, address
        );
        self.report(PairingEvent::RequestReceived(address));
    }

    /// Offers pairing to `address`, cancelling any other outstanding offer.
    pub async fn accept(self: &Arc<Self>, address: Address) -> Result<(), PairingError> {
        let channel = self.settings.read().await.data_channel;

        let mut state = self.state.lock().await;
        if !state.enabled {
            return Err(PairingError::Disabled);
        }
        let pending = state.requests.remove(&address);
        let request = match pending {
            Some(request) => request,
            // re-accepting the current offer restarts it
            None if state.offer.as_ref().is_some_and(|o| o.address == address) => {
                match state.offer.take() {
                    Some(offer) => offer.request,
                    None => return Err(PairingError::RequestNotFound(address)),
                }
            }
            None => return Err(PairingError::RequestNotFound(address)),
        };
        let canceled = state.offer.take().map(|o| o.address);
        let generation = state.next_generation();
        state.offer = Some(Offer {
            address,
            channel,
            request,
            generation,
        });

        let mut offer = Vec::with_capacity(OFFER_LEN);
        offer.extend_from_slice(address.as_bytes());
        offer.extend_from_slice(channel.as_bytes());
        self.response.set(offer);
        drop(state);

        if let Some(previous) = canceled {
            info!("Canceled pairing with {}", previous);
            self.report(PairingEvent::OfferCanceled(previous));
        }
        self.arm_offer_timeout(address, generation);
        info!("Pairing with {}", address);
        self.report(PairingEvent::Offered(address));
        Ok(())
    }

    /// Handles a write to the pair-response characteristic. Anything that is
    /// not a valid answer to the current offer is dropped.
    pub async fn on_confirmation(&self, value: &[u8]) {
        if value.len() != CONFIRMATION_LEN {
            debug!("Ignoring pair confirmation of {} bytes", value.len());
            return;
        }
        let (signed, signature) = value.split_at(OFFER_LEN);
        let Some(address) = Address::from_prefix(signed) else {
            return;
        };
        let Ok(channel) = Uuid::from_slice(&signed[Address::LEN..]) else {
            return;
        };

        let mut state = self.state.lock().await;
        if !state.enabled {
            debug!("Pair confirmation from {} ignored: pairing disabled", address);
            return;
        }
        let Some(offer) = state.offer.as_ref() else {
            warn!("Pair confirmation from {} without an offer", address);
            return;
        };
        if offer.address != address {
            warn!(
                "Pair confirmation from {} while offering {}",
                address, offer.address
            );
            return;
        }
        if offer.channel != channel {
            warn!("Pair confirmation from {} has wrong channel {}", address, channel);
            return;
        }
        if !offer.request.public_key.verify(signed, signature) {
            warn!("Invalid pair confirmation signature from {}", address);
            return;
        }
        let Some(offer) = state.offer.take() else {
            return;
        };
        drop(state);

        let sensor = Sensor::enrolled(
            address,
            &offer.request.capabilities,
            offer.request.public_key,
        );
        let inserted = self.registry.write().await.insert(sensor).await;
        self.response.set(Vec::new());
        match inserted {
            Ok(()) => {
                info!("{} has been paired with the Gateway", address);
                self.report(PairingEvent::Paired(address));
            }
            Err(e) => {
                error!("Failed to enroll {}: {}", address, e);
                self.report(PairingEvent::EnrollFailed(address));
            }
        }
    }

    fn arm_request_timeout(self: &Arc<Self>, address: Address, generation: u64) {
        let deadline = Instant::now() + self.timeout;
        let pairing = Arc::clone(self);
        tokio::spawn(async move {
            sleep_until(deadline).await;
            let mut state = pairing.state.lock().await;
            let current = state.requests.get(&address).map(|r| r.generation);
            if current == Some(generation) {
                state.requests.remove(&address);
                drop(state);
                info!("Pair request from {} has timed out", address);
                pairing.report(PairingEvent::RequestTimedOut(address));
            }
        });
    }

    fn arm_offer_timeout(self: &Arc<Self>, address: Address, generation: u64) {
        let deadline = Instant::now() + self.timeout;
        let pairing = Arc::clone(self);
        tokio::spawn(async move {
            sleep_until(deadline).await;
            let mut state = pairing.state.lock().await;
            let expired = state
                .offer
                .as_ref()
                .is_some_and(|o| o.address == address && o.generation == generation);
            if expired {
                state.offer = None;
                pairing.response.set(Vec::new());
                drop(state);
                info!("Pairing with {} has timed out", address);
                pairing.report(PairingEvent::OfferTimedOut(address));
            }
        });
    }

    fn report(&self, event: PairingEvent) {
        // no subscribers just means no operator is watching
        let _ = self.events.send(event);
    }
}
