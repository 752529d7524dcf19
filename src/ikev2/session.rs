use log::{debug, trace, warn};
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, VecDeque},
    error, fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use super::crypto::{self, CryptoStack, DHTransformType, SaParams};
use super::keys::{ChildKeymats, DerivedKeySet, KeyDerivationError};
use super::message;

// Random child SPI draws before giving up.
const MAX_SPI_ATTEMPTS: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionID {
    initiator_spi: u64,
    responder_spi: u64,
}

impl SessionID {
    pub fn new(initiator_spi: u64, responder_spi: u64) -> SessionID {
        SessionID {
            initiator_spi,
            responder_spi,
        }
    }

    pub fn initiator_spi(&self) -> u64 {
        self.initiator_spi
    }

    pub fn responder_spi(&self) -> u64 {
        self.responder_spi
    }
}

impl fmt::Display for SessionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.initiator_spi, self.responder_spi)
    }
}

impl fmt::Debug for SessionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Auth,
    IkeSaEstablished,
    CreateChild,
    SaRekeying,
    ChildSaEstablished,
    SaDeleting,
}

impl SessionState {
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            Self::IkeSaEstablished | Self::CreateChild | Self::SaRekeying | Self::ChildSaEstablished
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::Auth => write!(f, "Auth"),
            Self::IkeSaEstablished => write!(f, "IKE SA established"),
            Self::CreateChild => write!(f, "Creating Child SA"),
            Self::SaRekeying => write!(f, "Rekeying IKE SA"),
            Self::ChildSaEstablished => write!(f, "Child SA established"),
            Self::SaDeleting => write!(f, "Deleting"),
        }
    }
}

/// What a locally initiated request is meant to achieve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestContext {
    SaInit,
    Auth,
    CreateChild { rekey: Option<u32>, pfs: bool },
    RekeyIke,
    DeleteIke,
    DeleteChild(Vec<u32>),
    Liveness,
}

impl RequestContext {
    pub fn exchange_type(&self) -> message::ExchangeType {
        match self {
            Self::SaInit => message::ExchangeType::IKE_SA_INIT,
            Self::Auth => message::ExchangeType::IKE_AUTH,
            Self::CreateChild { .. } | Self::RekeyIke => message::ExchangeType::CREATE_CHILD_SA,
            Self::DeleteIke | Self::DeleteChild(_) | Self::Liveness => {
                message::ExchangeType::INFORMATIONAL
            }
        }
    }
}

/// Serialized message, shared between the outbound queue and the retransmission slot.
#[derive(Debug)]
pub struct SentMessage {
    message_id: u32,
    exchange_type: message::ExchangeType,
    data: Vec<u8>,
}

impl SentMessage {
    pub fn new(message_id: u32, exchange_type: message::ExchangeType, data: Vec<u8>) -> SentMessage {
        SentMessage {
            message_id,
            exchange_type,
            data,
        }
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    pub fn exchange_type(&self) -> message::ExchangeType {
        self.exchange_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug, Default)]
pub struct Timers {
    pub retransmit: Option<Instant>,
    pub lifetime: Option<Instant>,
    pub half_open: Option<Instant>,
}

impl Timers {
    pub fn cancel(&mut self) {
        *self = Timers::default();
    }

    pub fn is_active(&self) -> bool {
        self.retransmit.is_some() || self.lifetime.is_some() || self.half_open.is_some()
    }
}

struct OutstandingRequest {
    context: RequestContext,
    message: Arc<SentMessage>,
    retransmissions: usize,
    retransmit_delay: Duration,
}

pub enum RequestCheck {
    Process,
    Retransmit(Arc<SentMessage>),
    Ignore,
}

pub enum Retransmission {
    None,
    Resend(Arc<SentMessage>),
    Exhausted,
}

/// IKE_SA_INIT material kept until the IKE SA is authenticated.
pub(super) struct InitContext {
    pub nonce_local: Vec<u8>,
    pub dh: Option<DHTransformType>,
    pub dh_group: u16,
    pub cookie: Option<Vec<u8>>,
}

/// Child SA requested by the local side, waiting for the peer's response.
pub(super) struct PendingChild {
    pub local_spi: u32,
    pub nonce_local: Option<Vec<u8>>,
    pub dh: Option<DHTransformType>,
    pub ts_initiator: Vec<message::TrafficSelector>,
    pub ts_responder: Vec<message::TrafficSelector>,
    pub rekey: Option<u32>,
}

/// IKE SA rekey requested by the local side.
pub(super) struct PendingIkeRekey {
    pub local_spi: u64,
    pub nonce_local: Vec<u8>,
    pub dh: DHTransformType,
}

pub(super) struct ChildResponse {
    pub proposal: message::Proposal,
    pub ts_initiator: Vec<message::TrafficSelector>,
    pub ts_responder: Vec<message::TrafficSelector>,
    pub nonce: Option<Vec<u8>>,
    pub key_exchange: Option<message::KeyExchange>,
}

/// Parser results that the response generator turns into payloads.
pub(super) enum ResponsePlan {
    SaInit {
        proposal: message::Proposal,
        key_exchange: message::KeyExchange,
    },
    Auth {
        child: Result<ChildResponse, message::NotifyMessageType>,
    },
    CreateChild(ChildResponse),
    RekeyIke {
        proposal: message::Proposal,
        nonce: Vec<u8>,
        key_exchange: message::KeyExchange,
    },
    Informational {
        deleted_spis: Vec<u32>,
    },
}

pub struct ChildSaSession {
    local_spi: u32,
    remote_spi: u32,
    protocol_id: message::IPSecProtocolID,
    params: SaParams,
    ts_local: Vec<message::TrafficSelector>,
    ts_remote: Vec<message::TrafficSelector>,
    keys: ChildKeymats,
    parent: SessionID,
}

impl ChildSaSession {
    pub fn new(
        local_spi: u32,
        remote_spi: u32,
        params: SaParams,
        ts_local: Vec<message::TrafficSelector>,
        ts_remote: Vec<message::TrafficSelector>,
        keys: ChildKeymats,
        parent: SessionID,
    ) -> ChildSaSession {
        ChildSaSession {
            local_spi,
            remote_spi,
            protocol_id: params.protocol_id,
            params,
            ts_local,
            ts_remote,
            keys,
            parent,
        }
    }

    pub fn local_spi(&self) -> u32 {
        self.local_spi
    }

    pub fn remote_spi(&self) -> u32 {
        self.remote_spi
    }

    pub fn protocol_id(&self) -> message::IPSecProtocolID {
        self.protocol_id
    }

    pub fn params(&self) -> &SaParams {
        &self.params
    }

    pub fn ts_local(&self) -> &[message::TrafficSelector] {
        &self.ts_local
    }

    pub fn ts_remote(&self) -> &[message::TrafficSelector] {
        &self.ts_remote
    }

    pub fn keys(&self) -> &ChildKeymats {
        &self.keys
    }

    pub fn parent(&self) -> SessionID {
        self.parent
    }

    pub(super) fn set_parent(&mut self, parent: SessionID) {
        self.parent = parent;
    }
}

impl fmt::Display for ChildSaSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:08x}/{:08x} local {:?} remote {:?}",
            self.protocol_id, self.local_spi, self.remote_spi, self.ts_local, self.ts_remote
        )
    }
}

pub struct IkeSaSession {
    pub(super) id: SessionID,
    pub(super) is_initiator: bool,
    pub(super) remote_addr: SocketAddr,
    pub(super) state: SessionState,
    pub(super) params: Option<SaParams>,
    pub(super) nonce_initiator: Vec<u8>,
    pub(super) nonce_responder: Vec<u8>,
    pub(super) init: Option<InitContext>,
    pub(super) keys: Option<DerivedKeySet>,
    pub(super) crypto_stack: Option<CryptoStack>,
    pub(super) init_request: Vec<u8>,
    pub(super) init_response: Vec<u8>,
    pub(super) remote_id: Option<message::Identification>,
    pub(super) child_sas: HashMap<u32, ChildSaSession>,
    pub(super) pending_child: Option<PendingChild>,
    pub(super) pending_rekey: Option<PendingIkeRekey>,
    pub(super) response_plan: Option<ResponsePlan>,
    pub(super) rekeyed: Option<Box<IkeSaSession>>,
    pub(super) timers: Timers,
    local_message_id: u32,
    remote_message_id: u32,
    last_request_hash: Option<[u8; 32]>,
    last_response: Option<Arc<SentMessage>>,
    sent_request: Option<OutstandingRequest>,
    queued_requests: VecDeque<RequestContext>,
}

impl IkeSaSession {
    pub fn new_initiator(
        local_spi: u64,
        remote_addr: SocketAddr,
        now: Instant,
        half_open_timeout: Duration,
    ) -> IkeSaSession {
        let mut session = Self::new(SessionID::new(local_spi, 0), true, remote_addr);
        session.timers.half_open = Some(now + half_open_timeout);
        session.queued_requests.push_back(RequestContext::SaInit);
        session
    }

    pub fn new_responder(
        id: SessionID,
        remote_addr: SocketAddr,
        now: Instant,
        half_open_timeout: Duration,
    ) -> IkeSaSession {
        let mut session = Self::new(id, false, remote_addr);
        session.timers.half_open = Some(now + half_open_timeout);
        session
    }

    pub(super) fn new(id: SessionID, is_initiator: bool, remote_addr: SocketAddr) -> IkeSaSession {
        IkeSaSession {
            id,
            is_initiator,
            remote_addr,
            state: SessionState::Init,
            params: None,
            nonce_initiator: vec![],
            nonce_responder: vec![],
            init: None,
            keys: None,
            crypto_stack: None,
            init_request: vec![],
            init_response: vec![],
            remote_id: None,
            child_sas: HashMap::new(),
            pending_child: None,
            pending_rekey: None,
            response_plan: None,
            rekeyed: None,
            timers: Timers::default(),
            local_message_id: 0,
            remote_message_id: 0,
            last_request_hash: None,
            last_response: None,
            sent_request: None,
            queued_requests: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SessionID {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_spi(&self) -> u64 {
        if self.is_initiator {
            self.id.initiator_spi
        } else {
            self.id.responder_spi
        }
    }

    pub fn remote_spi(&self) -> u64 {
        if self.is_initiator {
            self.id.responder_spi
        } else {
            self.id.initiator_spi
        }
    }

    pub fn params(&self) -> Option<&SaParams> {
        self.params.as_ref()
    }

    pub fn keys(&self) -> Option<&DerivedKeySet> {
        self.keys.as_ref()
    }

    pub fn remote_id(&self) -> Option<&message::Identification> {
        self.remote_id.as_ref()
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn child_sas(&self) -> impl Iterator<Item = &ChildSaSession> {
        self.child_sas.values()
    }

    pub fn child_sa(&self, local_spi: u32) -> Option<&ChildSaSession> {
        self.child_sas.get(&local_spi)
    }

    pub(super) fn child_sa_by_remote_spi(&self, remote_spi: u32) -> Option<&ChildSaSession> {
        self.child_sas
            .values()
            .find(|child| child.remote_spi == remote_spi)
    }

    pub fn local_message_id(&self) -> u32 {
        self.local_message_id
    }

    pub fn remote_message_id(&self) -> u32 {
        self.remote_message_id
    }

    pub fn has_outstanding_request(&self) -> bool {
        self.sent_request.is_some()
    }

    pub(super) fn outstanding_request(&self) -> Option<&RequestContext> {
        self.sent_request.as_ref().map(|request| &request.context)
    }

    pub fn queue_request(&mut self, context: RequestContext) {
        self.queued_requests.push_back(context);
    }

    pub(super) fn queue_request_first(&mut self, context: RequestContext) {
        self.queued_requests.push_front(context);
    }

    pub(super) fn next_queued_request(&mut self) -> Option<RequestContext> {
        if self.sent_request.is_some() {
            None
        } else {
            self.queued_requests.pop_front()
        }
    }

    /// Request that `next_queued_request` would return.
    pub(super) fn peek_queued_request(&self) -> Option<&RequestContext> {
        if self.sent_request.is_some() {
            None
        } else {
            self.queued_requests.front()
        }
    }

    pub(super) fn allocate_child_spi(&self) -> Result<u32, SessionError> {
        for _ in 0..MAX_SPI_ATTEMPTS {
            let spi = crypto::random_spi_u32();
            let pending = self
                .pending_child
                .as_ref()
                .is_some_and(|pending| pending.local_spi == spi);
            if !pending && !self.child_sas.contains_key(&spi) {
                return Ok(spi);
            }
            debug!("Child SPI {:08x} collision, drawing another", spi);
        }
        Err(SessionError::ResourceExhausted)
    }

    /// Classifies an incoming request by its message ID.
    pub fn check_request(&self, request: &message::InputMessage) -> RequestCheck {
        let message_id = request.read_message_id();
        if message_id == self.remote_message_id {
            return RequestCheck::Process;
        }
        if message_id.wrapping_add(1) != self.remote_message_id {
            debug!(
                "Session {} received request with unexpected message ID {}, expected {}",
                self.id, message_id, self.remote_message_id
            );
            return RequestCheck::Ignore;
        }
        match (self.last_response.as_ref(), self.last_request_hash.as_ref()) {
            (Some(last_response), Some(last_request_hash)) => {
                let request_hash: [u8; 32] = Sha256::digest(request.raw_data()).into();
                if &request_hash == last_request_hash {
                    RequestCheck::Retransmit(last_response.clone())
                } else {
                    // A modified retransmission must not be answered with the cached response.
                    warn!(
                        "Session {} retransmitted request hash mismatch, not sending response",
                        self.id
                    );
                    RequestCheck::Ignore
                }
            }
            _ => RequestCheck::Ignore,
        }
    }

    /// Message ID to use in a response to the request being processed.
    pub(super) fn response_message_id(&self) -> u32 {
        self.remote_message_id
    }

    pub fn complete_response(&mut self, request: &[u8], response: Arc<SentMessage>) {
        self.last_request_hash = Some(Sha256::digest(request).into());
        self.last_response = Some(response);
        self.remote_message_id = self.remote_message_id.wrapping_add(1);
    }

    pub fn start_request(
        &mut self,
        context: RequestContext,
        message: Arc<SentMessage>,
        now: Instant,
        retransmit_delay: Duration,
    ) {
        self.timers.retransmit = Some(now + retransmit_delay);
        self.sent_request = Some(OutstandingRequest {
            context,
            message,
            retransmissions: 0,
            retransmit_delay,
        });
    }

    /// Returns the context of the outstanding request if `response` answers it.
    pub fn match_response(&self, response: &message::InputMessage) -> Option<RequestContext> {
        let request = self.sent_request.as_ref()?;
        if request.message.message_id() != response.read_message_id()
            || request.message.exchange_type() != response.read_exchange_type()
        {
            debug!(
                "Session {} dropping response with message ID {}",
                self.id,
                response.read_message_id()
            );
            return None;
        }
        Some(request.context.clone())
    }

    /// Clears the outstanding request after its response was processed.
    pub fn complete_request(&mut self) {
        let restarted_init = self
            .sent_request
            .as_ref()
            .is_some_and(|request| request.context == RequestContext::SaInit)
            && self.state == SessionState::Init;
        self.sent_request = None;
        self.timers.retransmit = None;
        // A retried IKE_SA_INIT reuses message ID 0.
        if !restarted_init {
            self.local_message_id = self.local_message_id.wrapping_add(1);
        }
    }

    pub fn due_retransmission(&mut self, now: Instant, limit: usize) -> Retransmission {
        let due = self.timers.retransmit.is_some_and(|deadline| deadline <= now);
        let request = match self.sent_request.as_mut() {
            Some(request) if due => request,
            _ => return Retransmission::None,
        };
        if request.retransmissions >= limit {
            return Retransmission::Exhausted;
        }
        request.retransmissions += 1;
        request.retransmit_delay *= 2;
        self.timers.retransmit = Some(now + request.retransmit_delay);
        trace!(
            "Session {} retransmitting message {} (attempt {})",
            self.id,
            request.message.message_id(),
            request.retransmissions
        );
        Retransmission::Resend(request.message.clone())
    }

    pub(super) fn record_init_message(&mut self, data: &[u8]) {
        if self.is_initiator {
            self.init_request = data.to_vec();
        } else {
            self.init_response = data.to_vec();
        }
    }

    pub fn set_established(&mut self, now: Instant, lifetime: Duration) {
        self.state = if self.child_sas.is_empty() {
            SessionState::IkeSaEstablished
        } else {
            SessionState::ChildSaEstablished
        };
        self.timers.half_open = None;
        if self.timers.lifetime.is_none() {
            self.timers.lifetime = Some(now + lifetime);
        }
    }

    /// Returns true once when the IKE SA lifetime has run out.
    pub fn take_expired_lifetime(&mut self, now: Instant) -> bool {
        if self.timers.lifetime.is_some_and(|deadline| deadline <= now) {
            self.timers.lifetime = None;
            true
        } else {
            false
        }
    }

    pub fn half_open_expired(&self, now: Instant) -> bool {
        !self.state.is_established()
            && self.state != SessionState::SaDeleting
            && self.timers.half_open.is_some_and(|deadline| deadline <= now)
    }

    /// Drops the state of a locally requested CREATE_CHILD_SA that the peer rejected.
    pub fn abort_pending(&mut self) {
        self.pending_child = None;
        self.pending_rekey = None;
        if matches!(self.state, SessionState::CreateChild | SessionState::SaRekeying) {
            self.state = if self.child_sas.is_empty() {
                SessionState::IkeSaEstablished
            } else {
                SessionState::ChildSaEstablished
            };
        }
    }

    pub(super) fn take_rekeyed(&mut self) -> Option<IkeSaSession> {
        self.rekeyed.take().map(|session| *session)
    }

    /// Stops every timer; must run before the session is dropped from the table.
    pub fn cancel_timers(&mut self) {
        self.timers.cancel();
        self.sent_request = None;
    }

    pub(super) fn insert_child_sa(&mut self, child: ChildSaSession) {
        debug!("Session {} added Child SA {}", self.id, child);
        self.child_sas.insert(child.local_spi, child);
    }

    pub(super) fn remove_child_sa(&mut self, local_spi: u32) -> Option<ChildSaSession> {
        self.child_sas.remove(&local_spi)
    }

    pub(super) fn header(
        &self,
        exchange_type: message::ExchangeType,
        is_response: bool,
    ) -> message::IkeHeader {
        let message_id = if is_response {
            self.response_message_id()
        } else {
            self.local_message_id
        };
        message::IkeHeader::new(
            self.id.initiator_spi,
            self.id.responder_spi,
            exchange_type,
            message::Flags::new(self.is_initiator, is_response),
            message_id,
        )
    }

    /// Serializes `msg`; every exchange after IKE_SA_INIT wraps its payloads in SK.
    pub fn seal(&self, msg: &message::Message) -> Result<Vec<u8>, SessionError> {
        if msg.header().exchange_type == message::ExchangeType::IKE_SA_INIT {
            return Ok(msg.to_bytes()?);
        }
        let crypto_stack = self
            .crypto_stack
            .as_ref()
            .ok_or("Crypto stack not initialized")?;
        if log::log_enabled!(log::Level::Trace) {
            trace!("Encrypting message {:?}", msg);
        }
        let plaintext = message::encode_payloads(msg.payloads())?;
        let mut encrypted = crypto_stack.encrypt_data(&plaintext).map_err(|err| {
            warn!("Failed to encrypt data {}", err);
            "Failed to encrypt data"
        })?;
        encrypted.resize(encrypted.len() + crypto_stack.signature_length(), 0);
        let first_payload = msg
            .payloads()
            .first()
            .map(|payload| payload.payload_type())
            .unwrap_or(message::PayloadType::NONE);
        let mut outer = message::Message::new(*msg.header());
        outer.push_payload(message::Payload::Encrypted(message::EncryptedPayload {
            first_payload,
            data: encrypted,
        }));
        let mut data = outer.to_bytes()?;
        crypto_stack.sign(&mut data).map_err(|err| {
            warn!("Failed to sign data {}", err);
            "Failed to sign data"
        })?;
        Ok(data)
    }

    /// Verifies the ICV, decrypts the SK payload and splits the inner payloads.
    pub fn open(
        &self,
        msg: &message::InputMessage,
    ) -> Result<Vec<message::IkePayload>, SessionError> {
        let crypto_stack = self
            .crypto_stack
            .as_ref()
            .ok_or("Crypto stack not initialized")?;
        let encrypted = msg
            .iter_payloads()
            .find_map(|payload| match payload {
                Ok(message::IkePayload {
                    payload: message::Payload::Encrypted(encrypted),
                    ..
                }) => Some(Ok(encrypted)),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
            .ok_or(SessionError::MissingPayload(
                message::PayloadType::ENCRYPTED_AND_AUTHENTICATED,
            ))??;
        if !crypto_stack.validate_signature(msg.raw_data()) {
            return Err(SessionError::IntegrityCheckFailed);
        }
        let signature_length = crypto_stack.signature_length();
        if encrypted.data.len() < signature_length {
            return Err(SessionError::IntegrityCheckFailed);
        }
        let ciphertext = &encrypted.data[..encrypted.data.len() - signature_length];
        let plaintext = crypto_stack.decrypt_data(ciphertext).map_err(|err| {
            debug!("Failed to decrypt data: {}", err);
            SessionError::Malformed(message::FormatError::Malformed("Failed to decrypt data"))
        })?;
        Ok(message::decode_payloads(encrypted.first_payload, &plaintext)?)
    }
}

#[derive(Debug)]
pub enum SessionError {
    Malformed(message::FormatError),
    MissingPayload(message::PayloadType),
    UnsupportedCriticalPayload(message::PayloadType),
    UnacceptableProposal,
    InvalidKeyExchange(u16),
    AuthenticationFailed,
    UnsupportedAlgorithm(KeyDerivationError),
    PolicyMismatch,
    ChildSaNotFound,
    ProtocolStateViolation(&'static str),
    IntegrityCheckFailed,
    PeerNotify(message::NotifyMessageType),
    ResourceExhausted,
    Encode(message::EncodeError),
    CryptoInit(crypto::InitError),
    Internal(&'static str),
}

impl SessionError {
    /// Notification reported to the peer; `None` means the request is silently dropped.
    pub fn notify(&self) -> Option<message::Notify> {
        let notify = |message_type| Some(message::Notify::new(message_type, &[]));
        match self {
            Self::Malformed(_) | Self::MissingPayload(_) | Self::ProtocolStateViolation(_) => {
                notify(message::NotifyMessageType::INVALID_SYNTAX)
            }
            Self::UnsupportedCriticalPayload(payload_type) => Some(message::Notify::new(
                message::NotifyMessageType::UNSUPPORTED_CRITICAL_PAYLOAD,
                &[payload_type.type_id()],
            )),
            Self::UnacceptableProposal | Self::UnsupportedAlgorithm(_) => {
                notify(message::NotifyMessageType::NO_PROPOSAL_CHOSEN)
            }
            Self::InvalidKeyExchange(group) => Some(message::Notify::new(
                message::NotifyMessageType::INVALID_KE_PAYLOAD,
                &group.to_be_bytes(),
            )),
            Self::AuthenticationFailed => notify(message::NotifyMessageType::AUTHENTICATION_FAILED),
            Self::PolicyMismatch => notify(message::NotifyMessageType::TS_UNACCEPTABLE),
            Self::ChildSaNotFound => notify(message::NotifyMessageType::CHILD_SA_NOT_FOUND),
            Self::ResourceExhausted => notify(message::NotifyMessageType::TEMPORARY_FAILURE),
            Self::IntegrityCheckFailed
            | Self::PeerNotify(_)
            | Self::Encode(_)
            | Self::CryptoInit(_)
            | Self::Internal(_) => None,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "Malformed packet: {}", e),
            Self::MissingPayload(payload_type) => write!(f, "Missing {} payload", payload_type),
            Self::UnsupportedCriticalPayload(payload_type) => {
                write!(f, "Unsupported critical payload {}", payload_type)
            }
            Self::UnacceptableProposal => write!(f, "No acceptable proposal"),
            Self::InvalidKeyExchange(group) => {
                write!(f, "Key exchange uses wrong group, expected {}", group)
            }
            Self::AuthenticationFailed => write!(f, "Authentication failed"),
            Self::UnsupportedAlgorithm(e) => write!(f, "Key derivation failed: {}", e),
            Self::PolicyMismatch => write!(f, "Traffic selectors rejected by policy"),
            Self::ChildSaNotFound => write!(f, "Child SA not found"),
            Self::ProtocolStateViolation(msg) => write!(f, "Protocol state violation: {}", msg),
            Self::IntegrityCheckFailed => write!(f, "Integrity check failed"),
            Self::PeerNotify(notify) => write!(f, "Peer reported {}", notify),
            Self::ResourceExhausted => write!(f, "Resources exhausted"),
            Self::Encode(e) => write!(f, "Encode error: {}", e),
            Self::CryptoInit(e) => write!(f, "Crypto init error: {}", e),
            Self::Internal(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for SessionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Malformed(err) => Some(err),
            Self::UnsupportedAlgorithm(err) => Some(err),
            Self::Encode(err) => Some(err),
            Self::CryptoInit(err) => Some(err),
            _ => None,
        }
    }
}

impl From<&'static str> for SessionError {
    fn from(msg: &'static str) -> SessionError {
        Self::Internal(msg)
    }
}

impl From<message::FormatError> for SessionError {
    fn from(err: message::FormatError) -> SessionError {
        Self::Malformed(err)
    }
}

impl From<message::EncodeError> for SessionError {
    fn from(err: message::EncodeError) -> SessionError {
        Self::Encode(err)
    }
}

impl From<crypto::InitError> for SessionError {
    fn from(err: crypto::InitError) -> SessionError {
        Self::CryptoInit(err)
    }
}

impl From<KeyDerivationError> for SessionError {
    fn from(err: KeyDerivationError) -> SessionError {
        Self::UnsupportedAlgorithm(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::keys::SkPxLength;
    use crate::ikev2::message::{
        ExchangeType, Flags, IPSecProtocolID, IkeHeader, InputMessage, Message, Payload,
        Transform, TransformType,
    };

    fn remote_addr() -> SocketAddr {
        "192.0.2.1:500".parse().unwrap()
    }

    fn established_pair() -> (IkeSaSession, IkeSaSession) {
        let params = SaParams {
            protocol_id: IPSecProtocolID::IKE,
            enc: Some(Transform::new(TransformType::ENCR_AES_CBC, Some(128))),
            prf: Some(TransformType::PRF_HMAC_SHA1),
            integ: Some(TransformType::AUTH_HMAC_SHA1_96),
            dh: Some(TransformType::DH_2048_MODP),
            esn: None,
        };
        let id = SessionID::new(0x1122334455667788, 0x8877665544332211);
        let create_session = |is_initiator| {
            let mut session = IkeSaSession::new(id, is_initiator, remote_addr());
            let keys =
                DerivedKeySet::derive(&params, &[1u8; 20], &[2u8; 16], &[3u8; 16], 1, 2, SkPxLength::Prf)
                    .unwrap();
            session.crypto_stack = Some(keys.crypto_stack(&params, is_initiator).unwrap());
            session.keys = Some(keys);
            session.params = Some(params.clone());
            session
        };
        (create_session(true), create_session(false))
    }

    #[test]
    fn session_id_display() {
        let id = SessionID::new(0x1122334455667788, 0);
        assert_eq!(id.to_string(), "1122334455667788-0000000000000000");
    }

    #[test]
    fn seal_and_open() {
        let (initiator, responder) = established_pair();
        let mut msg = Message::new(initiator.header(ExchangeType::INFORMATIONAL, false));
        msg.push_payload(Payload::VendorId(b"liveness".to_vec()));
        let data = initiator.seal(&msg).unwrap();
        let input = InputMessage::from_datagram(&data).unwrap();
        assert_eq!(
            input.header().next_payload,
            message::PayloadType::ENCRYPTED_AND_AUTHENTICATED
        );
        let payloads = responder.open(&input).unwrap();
        assert_eq!(payloads, msg.payloads());

        let mut tampered = data.clone();
        let offset = tampered.len() - 20;
        tampered[offset] ^= 0x80;
        let input = InputMessage::from_datagram(&tampered).unwrap();
        assert!(matches!(
            responder.open(&input),
            Err(SessionError::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn request_message_ids() {
        let (mut initiator, mut responder) = established_pair();
        let msg = Message::new(initiator.header(ExchangeType::INFORMATIONAL, false));
        let request = initiator.seal(&msg).unwrap();
        let input = InputMessage::from_datagram(&request).unwrap();
        assert!(matches!(responder.check_request(&input), RequestCheck::Process));

        let response = Arc::new(SentMessage::new(0, ExchangeType::INFORMATIONAL, vec![1, 2, 3]));
        responder.complete_response(&request, response.clone());
        assert_eq!(responder.remote_message_id(), 1);
        match responder.check_request(&input) {
            RequestCheck::Retransmit(cached) => assert!(Arc::ptr_eq(&cached, &response)),
            _ => panic!("Expected a retransmission"),
        }

        initiator.local_message_id = 5;
        let msg = Message::new(initiator.header(ExchangeType::INFORMATIONAL, false));
        let request = initiator.seal(&msg).unwrap();
        let input = InputMessage::from_datagram(&request).unwrap();
        assert!(matches!(responder.check_request(&input), RequestCheck::Ignore));
    }

    #[test]
    fn peek_matches_next_queued_request() {
        let now = Instant::now();
        let mut session = IkeSaSession::new_initiator(1, remote_addr(), now, Duration::from_secs(30));
        session.queue_request(RequestContext::RekeyIke);
        assert_eq!(session.peek_queued_request(), Some(&RequestContext::SaInit));
        assert_eq!(session.next_queued_request(), Some(RequestContext::SaInit));
        assert_eq!(session.peek_queued_request(), Some(&RequestContext::RekeyIke));

        let sent = Arc::new(SentMessage::new(0, ExchangeType::IKE_SA_INIT, vec![0; 28]));
        session.start_request(RequestContext::SaInit, sent, now, Duration::from_secs(1));
        assert_eq!(session.peek_queued_request(), None);
        assert_eq!(session.next_queued_request(), None);
    }

    #[test]
    fn retransmission_backoff_and_limit() {
        let now = Instant::now();
        let mut session = IkeSaSession::new_initiator(1, remote_addr(), now, Duration::from_secs(30));
        let sent = Arc::new(SentMessage::new(0, ExchangeType::IKE_SA_INIT, vec![0; 28]));
        session.start_request(RequestContext::SaInit, sent.clone(), now, Duration::from_secs(1));

        assert!(matches!(
            session.due_retransmission(now, 2),
            Retransmission::None
        ));
        let now = now + Duration::from_secs(1);
        match session.due_retransmission(now, 2) {
            Retransmission::Resend(message) => assert!(Arc::ptr_eq(&message, &sent)),
            _ => panic!("Expected a retransmission"),
        }
        assert_eq!(session.timers().retransmit, Some(now + Duration::from_secs(2)));
        let now = now + Duration::from_secs(2);
        assert!(matches!(
            session.due_retransmission(now, 2),
            Retransmission::Resend(_)
        ));
        let now = now + Duration::from_secs(4);
        assert!(matches!(
            session.due_retransmission(now, 2),
            Retransmission::Exhausted
        ));

        session.cancel_timers();
        assert!(!session.timers().is_active());
        assert!(!session.has_outstanding_request());
        assert!(matches!(
            session.due_retransmission(now + Duration::from_secs(60), 2),
            Retransmission::None
        ));
    }

    #[test]
    fn retried_init_keeps_message_id() {
        let now = Instant::now();
        let mut session = IkeSaSession::new_initiator(1, remote_addr(), now, Duration::from_secs(30));
        let sent = Arc::new(SentMessage::new(0, ExchangeType::IKE_SA_INIT, vec![0; 28]));
        session.start_request(RequestContext::SaInit, sent, now, Duration::from_secs(1));
        session.complete_request();
        assert_eq!(session.local_message_id(), 0);

        let sent = Arc::new(SentMessage::new(0, ExchangeType::IKE_SA_INIT, vec![0; 28]));
        session.start_request(RequestContext::SaInit, sent, now, Duration::from_secs(1));
        session.state = SessionState::Auth;
        session.complete_request();
        assert_eq!(session.local_message_id(), 1);
    }

    #[test]
    fn child_spi_allocation_avoids_collisions() {
        let (mut initiator, _) = established_pair();
        let spi = initiator.allocate_child_spi().unwrap();
        assert!(spi >= 256);
        initiator.pending_child = Some(PendingChild {
            local_spi: spi,
            nonce_local: None,
            dh: None,
            ts_initiator: vec![],
            ts_responder: vec![],
            rekey: None,
        });
        for _ in 0..100 {
            assert_ne!(initiator.allocate_child_spi().unwrap(), spi);
        }
    }

    #[test]
    fn response_header_flags() {
        let (initiator, responder) = established_pair();
        let header = responder.header(ExchangeType::CREATE_CHILD_SA, true);
        assert!(header.flags.has(Flags::RESPONSE));
        assert!(!header.flags.has(Flags::INITIATOR));
        let header: IkeHeader = initiator.header(ExchangeType::CREATE_CHILD_SA, false);
        assert!(header.flags.has(Flags::INITIATOR));
        assert!(!header.flags.has(Flags::RESPONSE));
    }
}
