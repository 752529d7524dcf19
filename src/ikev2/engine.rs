use log::{debug, info, trace, warn};
use std::{
    collections::HashMap,
    error, fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use zeroize::Zeroizing;

use super::crypto;
use super::exchange::{self, Credentials, ExchangeContext, Outgoing, ReceivedMessage};
use super::keys::SkPxLength;
use super::message::{
    ExchangeType, Flags, IPSecProtocolID, Identification, InputMessage, Notify,
    NotifyMessageType, Payload, Proposal, Spi, Transform, TransformType,
};
use super::policy::Spd;
use super::session::{
    IkeSaSession, RequestCheck, RequestContext, Retransmission, SentMessage, SessionError,
    SessionID, SessionState,
};

const COOKIE_SECRET_LENGTH: usize = 32;

const DEFAULT_IKE_LIFETIME: Duration = Duration::from_secs(4 * 60 * 60);
const DEFAULT_HALF_OPEN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_RETRANSMISSIONS_LIMIT: usize = 5;

/// Static configuration shared by every IKE SA of an engine.
pub struct EngineConfig {
    pub local_id: Identification,
    pub credentials: Credentials,
    pub ike_proposals: Vec<Proposal>,
    pub esp_proposals: Vec<Proposal>,
    pub spd: Spd,
    // Answer every IKE_SA_INIT without a valid cookie with a COOKIE notification.
    pub require_cookies: bool,
    pub sk_px: SkPxLength,
    // Request a fresh DH exchange for Child SAs created with CREATE_CHILD_SA.
    pub pfs: bool,
    pub ike_lifetime: Duration,
    pub half_open_timeout: Duration,
    pub retransmit_timeout: Duration,
    pub retransmissions_limit: usize,
}

impl EngineConfig {
    pub fn new(local_id: Identification, credentials: Credentials) -> EngineConfig {
        EngineConfig {
            local_id,
            credentials,
            ike_proposals: Self::default_ike_proposals(),
            esp_proposals: Self::default_esp_proposals(),
            spd: Spd::allow_any(),
            require_cookies: false,
            sk_px: SkPxLength::default(),
            pfs: false,
            ike_lifetime: DEFAULT_IKE_LIFETIME,
            half_open_timeout: DEFAULT_HALF_OPEN_TIMEOUT,
            retransmit_timeout: DEFAULT_RETRANSMIT_TIMEOUT,
            retransmissions_limit: DEFAULT_RETRANSMISSIONS_LIMIT,
        }
    }

    pub fn default_ike_proposals() -> Vec<Proposal> {
        vec![
            Proposal {
                num: 1,
                protocol_id: IPSecProtocolID::IKE,
                spi: Spi::None,
                transforms: vec![
                    Transform::new(TransformType::ENCR_AES_CBC, Some(256)),
                    Transform::new(TransformType::PRF_HMAC_SHA2_256, None),
                    Transform::new(TransformType::AUTH_HMAC_SHA2_256_128, None),
                    Transform::new(TransformType::DH_2048_MODP, None),
                    Transform::new(TransformType::DH_256_ECP, None),
                ],
            },
            Proposal {
                num: 2,
                protocol_id: IPSecProtocolID::IKE,
                spi: Spi::None,
                transforms: vec![
                    Transform::new(TransformType::ENCR_AES_CBC, Some(128)),
                    Transform::new(TransformType::PRF_HMAC_SHA1, None),
                    Transform::new(TransformType::AUTH_HMAC_SHA1_96, None),
                    Transform::new(TransformType::DH_2048_MODP, None),
                ],
            },
        ]
    }

    pub fn default_esp_proposals() -> Vec<Proposal> {
        vec![Proposal {
            num: 1,
            protocol_id: IPSecProtocolID::ESP,
            spi: Spi::None,
            transforms: vec![
                Transform::new(TransformType::ENCR_AES_CBC, Some(256)),
                Transform::new(TransformType::ENCR_AES_CBC, Some(128)),
                Transform::new(TransformType::AUTH_HMAC_SHA2_256_128, None),
                Transform::new(TransformType::AUTH_HMAC_SHA1_96, None),
                Transform::new(TransformType::DH_2048_MODP, None),
                Transform::new(TransformType::DH_256_ECP, None),
                Transform::new(TransformType::DH_NONE, None),
                Transform::new(TransformType::NO_ESN, None),
            ],
        }]
    }
}

/// Datagram the caller must transmit to `remote`.
pub struct Outbound {
    pub remote: SocketAddr,
    pub data: Arc<SentMessage>,
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} message {} ({} bytes) to {}",
            self.data.exchange_type(),
            self.data.message_id(),
            self.data.data().len(),
            self.remote
        )
    }
}

/// Sans-IO IKEv2 engine: owns every IKE SA and turns datagrams and timer ticks into datagrams.
pub struct Engine {
    config: EngineConfig,
    sessions: HashMap<u64, IkeSaSession>,
    // Responder sessions by peer address and initiator SPI, until the session is removed.
    initiator_spis: HashMap<(SocketAddr, u64), u64>,
    cookie_secret: Zeroizing<Vec<u8>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Engine {
        Engine {
            config,
            sessions: HashMap::new(),
            initiator_spis: HashMap::new(),
            cookie_secret: Zeroizing::new(crypto::random_nonce(COOKIE_SECRET_LENGTH)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// IKE SA identified by its local SPI.
    pub fn session(&self, local_spi: u64) -> Option<&IkeSaSession> {
        self.sessions.get(&local_spi)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &IkeSaSession> {
        self.sessions.values()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Starts a new IKE SA with `remote`, returning its local SPI.
    pub fn initiate(&mut self, remote: SocketAddr, now: Instant) -> (u64, Vec<Outbound>) {
        let local_spi = self.reserve_spi();
        let session =
            IkeSaSession::new_initiator(local_spi, remote, now, self.config.half_open_timeout);
        info!("Initiating session {} with {}", session.id(), remote);
        self.sessions.insert(local_spi, session);
        let mut outbound = vec![];
        self.drive(local_spi, now, &mut outbound);
        (local_spi, outbound)
    }

    pub fn create_child_sa(
        &mut self,
        local_spi: u64,
        now: Instant,
    ) -> Result<Vec<Outbound>, EngineError> {
        let pfs = self.config.pfs;
        self.queue_request(
            local_spi,
            RequestContext::CreateChild { rekey: None, pfs },
            now,
        )
    }

    pub fn rekey_child_sa(
        &mut self,
        local_spi: u64,
        child_spi: u32,
        now: Instant,
    ) -> Result<Vec<Outbound>, EngineError> {
        self.established_session(local_spi)?
            .child_sa(child_spi)
            .ok_or(EngineError::Session(SessionError::ChildSaNotFound))?;
        let pfs = self.config.pfs;
        self.queue_request(
            local_spi,
            RequestContext::CreateChild {
                rekey: Some(child_spi),
                pfs,
            },
            now,
        )
    }

    pub fn rekey_ike_sa(
        &mut self,
        local_spi: u64,
        now: Instant,
    ) -> Result<Vec<Outbound>, EngineError> {
        self.queue_request(local_spi, RequestContext::RekeyIke, now)
    }

    pub fn delete_child_sa(
        &mut self,
        local_spi: u64,
        child_spi: u32,
        now: Instant,
    ) -> Result<Vec<Outbound>, EngineError> {
        self.established_session(local_spi)?
            .child_sa(child_spi)
            .ok_or(EngineError::Session(SessionError::ChildSaNotFound))?;
        self.queue_request(local_spi, RequestContext::DeleteChild(vec![child_spi]), now)
    }

    pub fn delete_ike_sa(
        &mut self,
        local_spi: u64,
        now: Instant,
    ) -> Result<Vec<Outbound>, EngineError> {
        self.queue_request(local_spi, RequestContext::DeleteIke, now)
    }

    pub fn check_liveness(
        &mut self,
        local_spi: u64,
        now: Instant,
    ) -> Result<Vec<Outbound>, EngineError> {
        self.queue_request(local_spi, RequestContext::Liveness, now)
    }

    /// Sends Delete to every established IKE SA and drops the rest.
    pub fn shutdown(&mut self, now: Instant) -> Vec<Outbound> {
        let mut outbound = vec![];
        let local_spis = self.sessions.keys().copied().collect::<Vec<_>>();
        for local_spi in local_spis {
            let established = self
                .sessions
                .get(&local_spi)
                .is_some_and(|session| session.state().is_established());
            if established {
                if let Some(session) = self.sessions.get_mut(&local_spi) {
                    session.queue_request(RequestContext::DeleteIke);
                }
                self.drive(local_spi, now, &mut outbound);
            } else {
                self.remove_session(local_spi);
            }
        }
        outbound
    }

    fn established_session(&self, local_spi: u64) -> Result<&IkeSaSession, EngineError> {
        let session = self
            .sessions
            .get(&local_spi)
            .ok_or(EngineError::SessionNotFound(local_spi))?;
        if session.state().is_established() {
            Ok(session)
        } else {
            Err(EngineError::NotEstablished(session.id()))
        }
    }

    fn queue_request(
        &mut self,
        local_spi: u64,
        context: RequestContext,
        now: Instant,
    ) -> Result<Vec<Outbound>, EngineError> {
        self.established_session(local_spi)?;
        if let Some(session) = self.sessions.get_mut(&local_spi) {
            debug!("Session {} queued {:?} request", session.id(), context);
            session.queue_request(context);
        }
        let mut outbound = vec![];
        self.drive(local_spi, now, &mut outbound);
        Ok(outbound)
    }

    /// Processes one received datagram; malformed or unexpected input is dropped.
    pub fn process_datagram(
        &mut self,
        remote: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Vec<Outbound> {
        let mut outbound = vec![];
        let input = match InputMessage::from_datagram(data) {
            Ok(input) => input,
            Err(err) => {
                debug!("Dropping invalid datagram from {}: {}", remote, err);
                return outbound;
            }
        };
        trace!("Received packet from {}\n{:?}", remote, input);
        let result = if input.is_response() {
            self.process_response(remote, &input, now, &mut outbound)
        } else {
            self.process_request(remote, &input, now, &mut outbound)
        };
        if let Err(err) = result {
            warn!("Failed to process message from {}: {}", remote, err);
        }
        outbound
    }

    /// Advances retransmission, half-open and lifetime timers.
    pub fn handle_timers(&mut self, now: Instant) -> Vec<Outbound> {
        let mut outbound = vec![];
        let mut expired = vec![];
        let mut lifetime_expired = vec![];
        let limit = self.config.retransmissions_limit;
        for (local_spi, session) in self.sessions.iter_mut() {
            match session.due_retransmission(now, limit) {
                Retransmission::Resend(data) => outbound.push(Outbound {
                    remote: session.remote_addr(),
                    data,
                }),
                Retransmission::Exhausted => {
                    warn!(
                        "Session {} reached retransmission limit, deleting",
                        session.id()
                    );
                    expired.push(*local_spi);
                    continue;
                }
                Retransmission::None => {}
            }
            if session.half_open_expired(now) {
                info!("Deleting expired half-open session {}", session.id());
                expired.push(*local_spi);
                continue;
            }
            if session.take_expired_lifetime(now) {
                info!("Session {} lifetime expired", session.id());
                lifetime_expired.push(*local_spi);
            }
        }
        expired
            .into_iter()
            .for_each(|local_spi| self.remove_session(local_spi));
        for local_spi in lifetime_expired {
            if let Some(session) = self.sessions.get_mut(&local_spi) {
                session.queue_request(RequestContext::DeleteIke);
            }
            self.drive(local_spi, now, &mut outbound);
        }
        outbound
    }

    fn process_request(
        &mut self,
        remote: SocketAddr,
        input: &InputMessage,
        now: Instant,
        outbound: &mut Vec<Outbound>,
    ) -> Result<(), SessionError> {
        let header = *input.header();
        if header.initiator_spi == 0 {
            debug!("Dropping request with zero initiator SPI from {}", remote);
            return Ok(());
        }
        let is_new_sa = header.exchange_type == ExchangeType::IKE_SA_INIT
            && header.responder_spi == 0;
        let local_spi = if is_new_sa {
            match self.accept_sa_init(remote, input, now, outbound)? {
                Some(local_spi) => local_spi,
                None => return Ok(()),
            }
        } else {
            receiver_spi(input)
        };
        // Only a CREATE_CHILD_SA request can rekey the IKE SA and need a new SPI.
        let reserved_spi =
            (header.exchange_type == ExchangeType::CREATE_CHILD_SA).then(|| self.reserve_spi());
        let session = match self.sessions.get_mut(&local_spi) {
            Some(session) => session,
            None => {
                debug!("Dropping request for unknown session {:016x}", local_spi);
                return Ok(());
            }
        };
        let id_matches = if is_new_sa {
            session.id().initiator_spi() == header.initiator_spi
        } else {
            session.id() == SessionID::new(header.initiator_spi, header.responder_spi)
        };
        if !id_matches {
            debug!("Dropping request with SPIs not matching session {}", session.id());
            return Ok(());
        }
        match session.check_request(input) {
            RequestCheck::Process => {}
            RequestCheck::Retransmit(response) => {
                debug!(
                    "Session {} resending response to message {}",
                    session.id(),
                    header.message_id
                );
                outbound.push(Outbound {
                    remote,
                    data: response,
                });
                return Ok(());
            }
            RequestCheck::Ignore => return Ok(()),
        }

        let payloads = if header.exchange_type == ExchangeType::IKE_SA_INIT {
            input.payloads()?
        } else {
            match session.open(input) {
                Ok(payloads) => payloads,
                Err(err) => {
                    // Requests failing the integrity check are dropped silently.
                    debug!("Session {} dropping request: {}", session.id(), err);
                    return Ok(());
                }
            }
        };
        let msg = ReceivedMessage {
            header,
            raw: input.raw_data(),
            payloads,
        };
        let ctx = ExchangeContext {
            config: &self.config,
            reserved_spi,
            initial_contact: false,
            now,
        };
        let result = exchange::exchange_handlers(
            self.config.credentials.auth_method(),
            header.exchange_type,
        )
        .and_then(|handlers| {
            (handlers.parser)(session, &ctx, &msg)?;
            let response = (handlers.generator)(session, &ctx, Outgoing::Response)?;
            session.seal(&response)
        });

        let (data, failed) = match result {
            Ok(data) => (data, false),
            Err(err) => {
                warn!(
                    "Session {} rejected {} request: {}",
                    session.id(),
                    header.exchange_type,
                    err
                );
                let notify = match err.notify() {
                    Some(notify) => notify,
                    None => return Ok(()),
                };
                let data = if header.exchange_type == ExchangeType::IKE_SA_INIT {
                    exchange::sa_init_notify_response(&header, notify).to_bytes()?
                } else {
                    let response = exchange::error_response(session, header.exchange_type, notify);
                    session.seal(&response)?
                };
                (data, true)
            }
        };
        if header.exchange_type == ExchangeType::IKE_SA_INIT && !failed {
            session.record_init_message(&data);
        }
        let response = Arc::new(SentMessage::new(
            header.message_id,
            header.exchange_type,
            data,
        ));
        session.complete_response(input.raw_data(), response.clone());
        outbound.push(Outbound {
            remote,
            data: response,
        });

        let setup_failed = failed
            && (header.exchange_type == ExchangeType::IKE_SA_INIT
                || header.exchange_type == ExchangeType::IKE_AUTH);
        let deleted = session.state() == SessionState::SaDeleting;
        let rekeyed = session.take_rekeyed();
        if let Some(rekeyed) = rekeyed {
            self.adopt_session(rekeyed);
        }
        if setup_failed || deleted {
            self.remove_session(local_spi);
            return Ok(());
        }
        self.drive(local_spi, now, outbound);
        Ok(())
    }

    fn process_response(
        &mut self,
        remote: SocketAddr,
        input: &InputMessage,
        now: Instant,
        outbound: &mut Vec<Outbound>,
    ) -> Result<(), SessionError> {
        let header = *input.header();
        let local_spi = receiver_spi(input);
        let session = match self.sessions.get_mut(&local_spi) {
            Some(session) => session,
            None => {
                debug!("Dropping response for unknown session {:016x}", local_spi);
                return Ok(());
            }
        };
        let id_matches = if header.exchange_type == ExchangeType::IKE_SA_INIT {
            session.state() == SessionState::Init
                && session.id().initiator_spi() == header.initiator_spi
        } else {
            session.id() == SessionID::new(header.initiator_spi, header.responder_spi)
        };
        if !id_matches {
            debug!("Dropping response with SPIs not matching session {}", session.id());
            return Ok(());
        }
        let context = match session.match_response(input) {
            Some(context) => context,
            None => return Ok(()),
        };
        let payloads = if header.exchange_type == ExchangeType::IKE_SA_INIT {
            input.payloads()?
        } else {
            session.open(input)?
        };
        let msg = ReceivedMessage {
            header,
            raw: input.raw_data(),
            payloads,
        };
        let ctx = ExchangeContext {
            config: &self.config,
            reserved_spi: None,
            initial_contact: false,
            now,
        };
        let result = exchange::exchange_handlers(
            self.config.credentials.auth_method(),
            header.exchange_type,
        )
        .and_then(|handlers| (handlers.parser)(session, &ctx, &msg));
        session.complete_request();
        if let Err(err) = result {
            warn!(
                "Session {} failed to process {} response from {}: {}",
                session.id(),
                header.exchange_type,
                remote,
                err
            );
            match context {
                RequestContext::SaInit | RequestContext::Auth | RequestContext::DeleteIke => {
                    self.remove_session(local_spi);
                    return Ok(());
                }
                _ => session.abort_pending(),
            }
        }

        let deleted = context == RequestContext::DeleteIke
            && session.state() == SessionState::SaDeleting;
        let rekeyed = session.take_rekeyed();
        if let Some(rekeyed) = rekeyed {
            self.adopt_session(rekeyed);
        }
        if deleted {
            self.remove_session(local_spi);
            return Ok(());
        }
        self.drive(local_spi, now, outbound);
        Ok(())
    }

    /// Stateless cookie check, then a tentative responder session for a new IKE_SA_INIT.
    fn accept_sa_init(
        &mut self,
        remote: SocketAddr,
        input: &InputMessage,
        now: Instant,
        outbound: &mut Vec<Outbound>,
    ) -> Result<Option<u64>, SessionError> {
        let header = *input.header();
        if let Some(local_spi) = self.initiator_spis.get(&(remote, header.initiator_spi)) {
            return Ok(Some(*local_spi));
        }
        if self.config.require_cookies {
            let payloads = input.payloads()?;
            let nonce = payloads.iter().find_map(|payload| match payload.payload {
                Payload::Nonce(ref nonce) => Some(nonce.as_slice()),
                _ => None,
            });
            let nonce = match nonce {
                Some(nonce) => nonce,
                None => {
                    debug!("Dropping IKE_SA_INIT without nonce from {}", remote);
                    return Ok(None);
                }
            };
            let expected = exchange::responder_cookie(
                &self.cookie_secret,
                nonce,
                &remote,
                header.initiator_spi,
            )?;
            let cookie = payloads.iter().find_map(|payload| match payload.payload {
                Payload::Notify(ref notify) if notify.message_type == NotifyMessageType::COOKIE => {
                    Some(notify.data.as_slice())
                }
                _ => None,
            });
            if cookie != Some(expected.as_slice()) {
                debug!("Requesting cookie from {}", remote);
                let response = exchange::sa_init_notify_response(
                    &header,
                    Notify::new(NotifyMessageType::COOKIE, &expected),
                );
                outbound.push(Outbound {
                    remote,
                    data: Arc::new(SentMessage::new(
                        header.message_id,
                        ExchangeType::IKE_SA_INIT,
                        response.to_bytes()?,
                    )),
                });
                return Ok(None);
            }
        }
        let local_spi = self.reserve_spi();
        let session = IkeSaSession::new_responder(
            SessionID::new(header.initiator_spi, local_spi),
            remote,
            now,
            self.config.half_open_timeout,
        );
        debug!("Created half-open session {} for {}", session.id(), remote);
        self.sessions.insert(local_spi, session);
        self.initiator_spis
            .insert((remote, header.initiator_spi), local_spi);
        Ok(Some(local_spi))
    }

    /// Sends the next queued request, if no request is outstanding.
    fn drive(&mut self, local_spi: u64, now: Instant, outbound: &mut Vec<Outbound>) {
        loop {
            let next = self.sessions.get(&local_spi).and_then(|session| {
                session
                    .peek_queued_request()
                    .map(|context| (context.clone(), session.remote_addr()))
            });
            let (next, remote) = match next {
                Some(next) => next,
                None => return,
            };
            let reserved_spi = (next == RequestContext::RekeyIke).then(|| self.reserve_spi());
            let initial_contact =
                next == RequestContext::Auth && !self.has_established_peer(local_spi, remote);
            let session = match self.sessions.get_mut(&local_spi) {
                Some(session) => session,
                None => return,
            };
            let context = match session.next_queued_request() {
                Some(context) => context,
                None => return,
            };
            let ctx = ExchangeContext {
                config: &self.config,
                reserved_spi,
                initial_contact,
                now,
            };
            let result = exchange::exchange_handlers(
                self.config.credentials.auth_method(),
                context.exchange_type(),
            )
            .and_then(|handlers| {
                let msg = (handlers.generator)(session, &ctx, Outgoing::Request(&context))?;
                Ok((msg.header().message_id, session.seal(&msg)?))
            });
            match result {
                Ok((message_id, data)) => {
                    if context == RequestContext::SaInit {
                        session.record_init_message(&data);
                    }
                    let sent = Arc::new(SentMessage::new(message_id, context.exchange_type(), data));
                    debug!(
                        "Session {} sending {:?} request {}",
                        session.id(),
                        context,
                        message_id
                    );
                    session.start_request(context, sent.clone(), now, self.config.retransmit_timeout);
                    outbound.push(Outbound {
                        remote: session.remote_addr(),
                        data: sent,
                    });
                }
                Err(err) => {
                    warn!(
                        "Session {} failed to prepare {:?} request: {}",
                        session.id(),
                        context,
                        err
                    );
                    if matches!(context, RequestContext::SaInit | RequestContext::Auth) {
                        self.remove_session(local_spi);
                        return;
                    }
                    session.abort_pending();
                }
            }
        }
    }

    fn has_established_peer(&self, local_spi: u64, remote: SocketAddr) -> bool {
        self.sessions.iter().any(|(spi, session)| {
            *spi != local_spi
                && session.remote_addr() == remote
                && session.state().is_established()
        })
    }

    fn adopt_session(&mut self, session: IkeSaSession) {
        let local_spi = session.local_spi();
        info!(
            "Session {} replaces IKE SA, {} Child SAs moved",
            session.id(),
            session.child_sas().count()
        );
        self.sessions.insert(local_spi, session);
    }

    fn remove_session(&mut self, local_spi: u64) {
        if let Some(mut session) = self.sessions.remove(&local_spi) {
            session.cancel_timers();
            info!("Deleted session {}", session.id());
        }
        self.initiator_spis.retain(|_, spi| *spi != local_spi);
    }

    fn reserve_spi(&self) -> u64 {
        loop {
            let spi = crypto::random_spi_u64();
            if !self.sessions.contains_key(&spi) {
                return spi;
            }
        }
    }
}

// The INITIATOR flag tells which of the two SPIs belongs to the receiver.
fn receiver_spi(input: &InputMessage) -> u64 {
    if input.read_flags().has(Flags::INITIATOR) {
        input.read_responder_spi()
    } else {
        input.read_initiator_spi()
    }
}

#[derive(Debug)]
pub enum EngineError {
    SessionNotFound(u64),
    NotEstablished(SessionID),
    Session(SessionError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SessionNotFound(local_spi) => write!(f, "Session {:016x} not found", local_spi),
            Self::NotEstablished(id) => write!(f, "Session {} is not established", id),
            Self::Session(e) => write!(f, "Session error: {}", e),
        }
    }
}

impl error::Error for EngineError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::SessionNotFound(_) | Self::NotEstablished(_) => None,
            Self::Session(err) => Some(err),
        }
    }
}

impl From<SessionError> for EngineError {
    fn from(err: SessionError) -> EngineError {
        Self::Session(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::crypto::{CertificateSigner, CertificateVerifier, CryptoError, PseudorandomTransform};
    use crate::ikev2::message::{
        AuthMethod, Authentication, Certificate, CertificateEncoding, IkePayload,
    };

    fn fast_proposals(config: &mut EngineConfig) {
        config.ike_proposals = vec![Proposal {
            num: 1,
            protocol_id: IPSecProtocolID::IKE,
            spi: Spi::None,
            transforms: vec![
                Transform::new(TransformType::ENCR_AES_CBC, Some(128)),
                Transform::new(TransformType::PRF_HMAC_SHA2_256, None),
                Transform::new(TransformType::AUTH_HMAC_SHA2_256_128, None),
                Transform::new(TransformType::DH_256_ECP, None),
            ],
        }];
        config.esp_proposals = vec![Proposal {
            num: 1,
            protocol_id: IPSecProtocolID::ESP,
            spi: Spi::None,
            transforms: vec![
                Transform::new(TransformType::ENCR_AES_CBC, Some(128)),
                Transform::new(TransformType::AUTH_HMAC_SHA2_256_128, None),
                Transform::new(TransformType::DH_256_ECP, None),
                Transform::new(TransformType::DH_NONE, None),
                Transform::new(TransformType::NO_ESN, None),
            ],
        }];
    }

    fn psk_config(id: &str, psk: &[u8]) -> EngineConfig {
        let mut config = EngineConfig::new(Identification::fqdn(id), Credentials::shared_key(psk));
        fast_proposals(&mut config);
        config
    }

    struct Pair {
        initiator: Engine,
        responder: Engine,
        initiator_addr: SocketAddr,
        responder_addr: SocketAddr,
        now: Instant,
    }

    impl Pair {
        fn new(initiator: EngineConfig, responder: EngineConfig) -> Pair {
            Pair {
                initiator: Engine::new(initiator),
                responder: Engine::new(responder),
                initiator_addr: "198.51.100.1:500".parse().unwrap(),
                responder_addr: "203.0.113.1:500".parse().unwrap(),
                now: Instant::now(),
            }
        }

        fn psk() -> Pair {
            Pair::new(
                psk_config("initiator.test", b"secret"),
                psk_config("responder.test", b"secret"),
            )
        }

        /// Delivers datagrams in lock-step until both sides are quiet.
        fn deliver(&mut self, outbound: Vec<Outbound>, to_responder: bool) {
            let mut pending = vec![(to_responder, outbound)];
            let mut rounds = 0;
            while let Some((to_responder, messages)) = pending.pop() {
                rounds += 1;
                assert!(rounds < 64, "Exchange does not converge");
                for msg in messages {
                    let replies = if to_responder {
                        assert_eq!(msg.remote, self.responder_addr);
                        self.responder
                            .process_datagram(self.initiator_addr, msg.data.data(), self.now)
                    } else {
                        assert_eq!(msg.remote, self.initiator_addr);
                        self.initiator
                            .process_datagram(self.responder_addr, msg.data.data(), self.now)
                    };
                    if !replies.is_empty() {
                        pending.push((!to_responder, replies));
                    }
                }
            }
        }

        fn establish(&mut self) -> u64 {
            let (local_spi, outbound) = self.initiator.initiate(self.responder_addr, self.now);
            assert_eq!(outbound.len(), 1);
            self.deliver(outbound, true);
            local_spi
        }

        fn initiator_session(&self) -> &IkeSaSession {
            assert_eq!(self.initiator.sessions().count(), 1);
            self.initiator.sessions().next().unwrap()
        }

        fn responder_session(&self) -> &IkeSaSession {
            assert_eq!(self.responder.sessions().count(), 1);
            self.responder.sessions().next().unwrap()
        }
    }

    fn assert_child_sas_match(initiator: &IkeSaSession, responder: &IkeSaSession) {
        assert_eq!(
            initiator.child_sas().count(),
            responder.child_sas().count()
        );
        for child in initiator.child_sas() {
            let peer = responder
                .child_sas()
                .find(|peer| peer.remote_spi() == child.local_spi())
                .expect("Matching Child SA");
            assert_eq!(peer.local_spi(), child.remote_spi());
            assert_eq!(child.keys().outbound.enc_key, peer.keys().inbound.enc_key);
            assert_eq!(child.keys().outbound.integ_key, peer.keys().inbound.integ_key);
            assert_eq!(child.keys().inbound.enc_key, peer.keys().outbound.enc_key);
            assert_ne!(child.keys().inbound.enc_key, child.keys().outbound.enc_key);
        }
    }

    #[test]
    fn psk_handshake() {
        let mut pair = Pair::psk();
        let local_spi = pair.establish();

        let initiator = pair.initiator_session();
        let responder = pair.responder_session();
        assert_eq!(initiator.local_spi(), local_spi);
        assert_eq!(initiator.id(), responder.id());
        assert_eq!(initiator.state(), SessionState::ChildSaEstablished);
        assert_eq!(responder.state(), SessionState::ChildSaEstablished);
        assert_eq!(initiator.local_message_id(), 2);
        assert_eq!(responder.remote_message_id(), 2);
        assert!(!initiator.has_outstanding_request());
        assert_eq!(
            initiator.remote_id(),
            Some(&Identification::fqdn("responder.test"))
        );
        assert_eq!(
            responder.remote_id(),
            Some(&Identification::fqdn("initiator.test"))
        );
        assert!(initiator.timers().half_open.is_none());
        assert!(initiator.timers().lifetime.is_some());
        assert_eq!(initiator.child_sas().count(), 1);
        assert_child_sas_match(initiator, responder);
        // IKE_AUTH never adds a DH group to the Child SA.
        let child = initiator.child_sas().next().unwrap();
        assert_eq!(child.params().dh_group(), None);
    }

    #[test]
    fn default_proposals_handshake() {
        let mut pair = Pair::new(
            EngineConfig::new(
                Identification::fqdn("initiator.test"),
                Credentials::shared_key(b"secret"),
            ),
            EngineConfig::new(
                Identification::fqdn("responder.test"),
                Credentials::shared_key(b"secret"),
            ),
        );
        pair.establish();
        let initiator = pair.initiator_session();
        let params = initiator.params().unwrap();
        assert_eq!(params.dh_group(), Some(14));
        assert_eq!(params.prf, Some(TransformType::PRF_HMAC_SHA2_256));
        assert_child_sas_match(initiator, pair.responder_session());
    }

    #[test]
    fn invalid_ke_payload_retry() {
        let mut initiator = psk_config("initiator.test", b"secret");
        initiator.ike_proposals[0].transforms.insert(
            3,
            Transform::new(TransformType::DH_2048_MODP, None),
        );
        let responder = psk_config("responder.test", b"secret");
        let mut pair = Pair::new(initiator, responder);
        pair.establish();
        let initiator = pair.initiator_session();
        assert_eq!(initiator.params().unwrap().dh_group(), Some(19));
        assert_eq!(initiator.state(), SessionState::ChildSaEstablished);
        assert_eq!(initiator.local_message_id(), 2);
    }

    #[test]
    fn wrong_psk_fails_authentication() {
        let mut pair = Pair::new(
            psk_config("initiator.test", b"secret"),
            psk_config("responder.test", b"different"),
        );
        pair.establish();
        assert!(pair.initiator.is_empty());
        assert!(pair.responder.is_empty());
    }

    #[test]
    fn cookie_exchange() {
        let mut responder = psk_config("responder.test", b"secret");
        responder.require_cookies = true;
        let mut pair = Pair::new(psk_config("initiator.test", b"secret"), responder);

        let (_, outbound) = pair.initiator.initiate(pair.responder_addr, pair.now);
        let replies = pair.responder.process_datagram(
            pair.initiator_addr,
            outbound[0].data.data(),
            pair.now,
        );
        assert_eq!(replies.len(), 1);
        assert!(pair.responder.is_empty());
        let cookie_request = InputMessage::from_datagram(replies[0].data.data()).unwrap();
        assert_eq!(cookie_request.read_responder_spi(), 0);
        match cookie_request.payloads().unwrap()[0].payload {
            Payload::Notify(ref notify) => {
                assert_eq!(notify.message_type, NotifyMessageType::COOKIE)
            }
            _ => panic!("Expected COOKIE notification"),
        }

        pair.deliver(replies, false);
        assert_eq!(pair.initiator_session().state(), SessionState::ChildSaEstablished);
        assert_eq!(pair.responder_session().state(), SessionState::ChildSaEstablished);
        assert_eq!(pair.initiator_session().local_message_id(), 2);
    }

    #[test]
    fn stale_sa_init_after_establish_is_ignored() {
        let mut pair = Pair::psk();
        let (_, outbound) = pair.initiator.initiate(pair.responder_addr, pair.now);
        let request = outbound[0].data.data().to_vec();
        pair.deliver(outbound, true);
        let id = pair.responder_session().id();
        assert!(pair.responder_session().state().is_established());

        let replies = pair
            .responder
            .process_datagram(pair.initiator_addr, &request, pair.now);
        assert!(replies.is_empty());
        assert_eq!(pair.responder.sessions().count(), 1);
        assert_eq!(pair.responder_session().id(), id);

        // After the IKE SA is deleted, the same SPI may start a new one.
        let local_spi = pair.initiator_session().local_spi();
        let outbound = pair.initiator.delete_ike_sa(local_spi, pair.now).unwrap();
        pair.deliver(outbound, true);
        assert!(pair.responder.is_empty());
        let replies = pair
            .responder
            .process_datagram(pair.initiator_addr, &request, pair.now);
        assert_eq!(replies.len(), 1);
        assert_eq!(pair.responder.sessions().count(), 1);
    }

    #[test]
    fn duplicate_request_gets_cached_response() {
        let mut pair = Pair::psk();
        let (_, outbound) = pair.initiator.initiate(pair.responder_addr, pair.now);
        let request = outbound[0].data.data().to_vec();
        let first = pair
            .responder
            .process_datagram(pair.initiator_addr, &request, pair.now);
        let second = pair
            .responder
            .process_datagram(pair.initiator_addr, &request, pair.now);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].data.data(), second[0].data.data());
        assert_eq!(pair.responder.sessions().count(), 1);

        // A modified copy of the last request is not answered.
        let mut modified = request.clone();
        let last = modified.len() - 1;
        modified[last] ^= 0xff;
        let ignored = pair
            .responder
            .process_datagram(pair.initiator_addr, &modified, pair.now);
        assert!(ignored.is_empty());
    }

    #[test]
    fn retransmission_and_half_open_expiry() {
        let mut pair = Pair::psk();
        let now = pair.now;
        let (_, outbound) = pair.initiator.initiate(pair.responder_addr, now);
        let request = outbound[0].data.data().to_vec();

        assert!(pair.initiator.handle_timers(now).is_empty());
        let resent = pair.initiator.handle_timers(now + Duration::from_secs(1));
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].data.data(), request.as_slice());
        assert!(pair
            .initiator
            .handle_timers(now + Duration::from_secs(2))
            .is_empty());
        assert_eq!(
            pair.initiator
                .handle_timers(now + Duration::from_secs(3))
                .len(),
            1
        );

        pair.initiator.handle_timers(now + Duration::from_secs(31));
        assert!(pair.initiator.is_empty());
    }

    #[test]
    fn retransmission_limit_deletes_session() {
        let mut initiator = psk_config("initiator.test", b"secret");
        initiator.retransmissions_limit = 1;
        let mut pair = Pair::new(initiator, psk_config("responder.test", b"secret"));
        let now = pair.now;
        pair.initiator.initiate(pair.responder_addr, now);
        assert_eq!(
            pair.initiator
                .handle_timers(now + Duration::from_secs(1))
                .len(),
            1
        );
        assert!(pair
            .initiator
            .handle_timers(now + Duration::from_secs(3))
            .is_empty());
        assert!(pair.initiator.is_empty());
    }

    #[test]
    fn create_child_sa_with_pfs() {
        let mut initiator = psk_config("initiator.test", b"secret");
        initiator.pfs = true;
        let mut pair = Pair::new(initiator, psk_config("responder.test", b"secret"));
        let local_spi = pair.establish();

        let outbound = pair.initiator.create_child_sa(local_spi, pair.now).unwrap();
        assert_eq!(outbound.len(), 1);
        pair.deliver(outbound, true);

        let initiator = pair.initiator_session();
        let responder = pair.responder_session();
        assert_eq!(initiator.child_sas().count(), 2);
        assert_eq!(initiator.state(), SessionState::ChildSaEstablished);
        assert_eq!(initiator.local_message_id(), 3);
        assert!(initiator
            .child_sas()
            .any(|child| child.params().dh_group() == Some(19)));
        assert_child_sas_match(initiator, responder);
    }

    #[test]
    fn rekey_child_sa() {
        let mut pair = Pair::psk();
        let local_spi = pair.establish();
        let old_spi = pair.initiator_session().child_sas().next().unwrap().local_spi();

        let outbound = pair
            .initiator
            .rekey_child_sa(local_spi, old_spi, pair.now)
            .unwrap();
        pair.deliver(outbound, true);

        let initiator = pair.initiator_session();
        let responder = pair.responder_session();
        assert_eq!(initiator.child_sas().count(), 1);
        assert!(initiator.child_sa(old_spi).is_none());
        // CREATE_CHILD_SA followed by INFORMATIONAL Delete.
        assert_eq!(initiator.local_message_id(), 4);
        assert_child_sas_match(initiator, responder);
    }

    #[test]
    fn rekey_ike_sa() {
        let mut pair = Pair::psk();
        let local_spi = pair.establish();
        let old_id = pair.initiator_session().id();
        let child_spi = pair.initiator_session().child_sas().next().unwrap().local_spi();

        let outbound = pair.initiator.rekey_ike_sa(local_spi, pair.now).unwrap();
        pair.deliver(outbound, true);

        let initiator = pair.initiator_session();
        let responder = pair.responder_session();
        assert_ne!(initiator.id(), old_id);
        assert_eq!(initiator.id(), responder.id());
        assert!(initiator.state().is_established());
        assert_eq!(initiator.local_message_id(), 0);
        assert!(initiator.child_sa(child_spi).is_some());
        assert!(initiator
            .child_sas()
            .all(|child| child.parent() == initiator.id()));
        assert_child_sas_match(initiator, responder);

        let new_spi = initiator.local_spi();
        let outbound = pair.initiator.check_liveness(new_spi, pair.now).unwrap();
        pair.deliver(outbound, true);
        assert_eq!(pair.initiator_session().local_message_id(), 1);
        assert_eq!(pair.responder_session().remote_message_id(), 1);
    }

    #[test]
    fn delete_child_sa() {
        let mut pair = Pair::psk();
        let local_spi = pair.establish();
        let child_spi = pair.initiator_session().child_sas().next().unwrap().local_spi();

        assert!(pair
            .initiator
            .delete_child_sa(local_spi, child_spi.wrapping_add(1), pair.now)
            .is_err());
        let outbound = pair
            .initiator
            .delete_child_sa(local_spi, child_spi, pair.now)
            .unwrap();
        pair.deliver(outbound, true);
        assert_eq!(pair.initiator_session().child_sas().count(), 0);
        assert_eq!(pair.responder_session().child_sas().count(), 0);
        assert_eq!(pair.initiator_session().state(), SessionState::IkeSaEstablished);
        assert_eq!(pair.responder_session().state(), SessionState::IkeSaEstablished);
    }

    #[test]
    fn delete_ike_sa() {
        let mut pair = Pair::psk();
        let local_spi = pair.establish();
        let outbound = pair.initiator.delete_ike_sa(local_spi, pair.now).unwrap();
        pair.deliver(outbound, true);
        assert!(pair.initiator.is_empty());
        assert!(pair.responder.is_empty());
    }

    /// Runs IKE_SA_INIT for a new IKE SA, returns the decrypted IKE_AUTH request and completes it.
    fn auth_request_payloads(pair: &mut Pair) -> Vec<IkePayload> {
        let (local_spi, outbound) = pair.initiator.initiate(pair.responder_addr, pair.now);
        let replies =
            pair.responder
                .process_datagram(pair.initiator_addr, outbound[0].data.data(), pair.now);
        assert_eq!(replies.len(), 1);
        let auth =
            pair.initiator
                .process_datagram(pair.responder_addr, replies[0].data.data(), pair.now);
        assert_eq!(auth.len(), 1);
        let input = InputMessage::from_datagram(auth[0].data.data()).unwrap();
        let responder = pair
            .responder
            .sessions()
            .find(|session| session.id().initiator_spi() == local_spi)
            .unwrap();
        let payloads = responder.open(&input).unwrap();
        pair.deliver(auth, true);
        payloads
    }

    fn has_initial_contact(payloads: &[IkePayload]) -> bool {
        payloads.iter().any(|payload| {
            matches!(payload.payload,
                Payload::Notify(ref notify) if notify.message_type == NotifyMessageType::INITIAL_CONTACT)
        })
    }

    #[test]
    fn initial_contact_only_for_first_ike_sa() {
        let mut pair = Pair::psk();
        let first = auth_request_payloads(&mut pair);
        assert!(has_initial_contact(&first));
        assert!(pair.initiator_session().state().is_established());

        let second = auth_request_payloads(&mut pair);
        assert!(!has_initial_contact(&second));
        assert_eq!(pair.initiator.sessions().count(), 2);
        assert!(pair
            .initiator
            .sessions()
            .all(|session| session.state().is_established()));
    }

    #[test]
    fn liveness_check() {
        let mut pair = Pair::psk();
        let local_spi = pair.establish();
        let outbound = pair.initiator.check_liveness(local_spi, pair.now).unwrap();
        assert_eq!(outbound.len(), 1);
        pair.deliver(outbound, true);
        assert_eq!(pair.initiator_session().local_message_id(), 3);
        assert!(!pair.initiator_session().has_outstanding_request());
        assert_eq!(pair.initiator_session().state(), SessionState::ChildSaEstablished);
    }

    #[test]
    fn requests_need_established_session() {
        let mut pair = Pair::psk();
        let (local_spi, _) = pair.initiator.initiate(pair.responder_addr, pair.now);
        assert!(matches!(
            pair.initiator.create_child_sa(local_spi, pair.now),
            Err(EngineError::NotEstablished(_))
        ));
        assert!(matches!(
            pair.initiator.check_liveness(local_spi.wrapping_add(1), pair.now),
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[test]
    fn lifetime_expiry_deletes_ike_sa() {
        let mut pair = Pair::psk();
        pair.establish();
        let outbound = pair
            .initiator
            .handle_timers(pair.now + DEFAULT_IKE_LIFETIME + Duration::from_secs(1));
        assert_eq!(outbound.len(), 1);
        pair.deliver(outbound, true);
        assert!(pair.initiator.is_empty());
        assert!(pair.responder.is_empty());
    }

    #[test]
    fn shutdown_deletes_sessions() {
        let mut pair = Pair::psk();
        pair.establish();
        let outbound = pair.responder.shutdown(pair.now);
        assert_eq!(outbound.len(), 1);
        pair.deliver(outbound, false);
        assert!(pair.initiator.is_empty());
        assert!(pair.responder.is_empty());
    }

    #[test]
    fn garbage_is_dropped() {
        let mut pair = Pair::psk();
        let addr = pair.initiator_addr;
        assert!(pair
            .responder
            .process_datagram(addr, &[0u8; 12], pair.now)
            .is_empty());
        let mut header = [0u8; 28];
        header[17] = 0x20;
        header[18] = 34;
        header[27] = 28;
        assert!(pair
            .responder
            .process_datagram(addr, &header, pair.now)
            .is_empty());
        assert!(pair.responder.is_empty());
    }

    struct TestSigner {
        key: Vec<u8>,
        id: Identification,
    }

    impl TestSigner {
        fn signature(key: &[u8], signed_octets: &[u8]) -> Vec<u8> {
            PseudorandomTransform::init(TransformType::PRF_HMAC_SHA2_256, key)
                .unwrap()
                .prf(signed_octets)
                .to_vec()
        }
    }

    impl CertificateSigner for TestSigner {
        fn auth_method(&self) -> AuthMethod {
            AuthMethod::DIGITAL_SIGNATURE
        }

        fn certificates(&self) -> Vec<Certificate> {
            vec![Certificate {
                encoding: CertificateEncoding::X509_SIGNATURE,
                data: self.id.data.clone(),
            }]
        }

        fn sign(&self, signed_octets: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(Self::signature(&self.key, signed_octets))
        }
    }

    struct TestVerifier {
        key: Vec<u8>,
    }

    impl CertificateVerifier for TestVerifier {
        fn verify(
            &self,
            certificates: &[Certificate],
            id: &Identification,
            auth: &Authentication,
            signed_octets: &[u8],
        ) -> Result<(), CryptoError> {
            if !certificates.iter().any(|cert| cert.data == id.data) {
                return Err("Certificate does not match identity".into());
            }
            if auth.method != AuthMethod::DIGITAL_SIGNATURE
                || auth.data != TestSigner::signature(&self.key, signed_octets)
            {
                return Err("Bad signature".into());
            }
            Ok(())
        }
    }

    fn certificate_config(id: &str, key: &[u8]) -> EngineConfig {
        let local_id = Identification::fqdn(id);
        let credentials = Credentials::Certificate {
            signer: Arc::new(TestSigner {
                key: key.to_vec(),
                id: local_id.clone(),
            }),
            verifier: Arc::new(TestVerifier { key: key.to_vec() }),
        };
        let mut config = EngineConfig::new(local_id, credentials);
        fast_proposals(&mut config);
        config
    }

    #[test]
    fn certificate_handshake() {
        let mut pair = Pair::new(
            certificate_config("initiator.test", b"ca"),
            certificate_config("responder.test", b"ca"),
        );
        pair.establish();
        assert_eq!(pair.initiator_session().state(), SessionState::ChildSaEstablished);
        assert_eq!(pair.responder_session().state(), SessionState::ChildSaEstablished);
        assert_child_sas_match(pair.initiator_session(), pair.responder_session());
    }

    #[test]
    fn certificate_handshake_bad_signature() {
        let mut pair = Pair::new(
            certificate_config("initiator.test", b"ca"),
            certificate_config("responder.test", b"other"),
        );
        pair.establish();
        assert!(pair.initiator.is_empty());
        assert!(pair.responder.is_empty());
    }
}
