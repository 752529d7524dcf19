use log::{debug, info, warn};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};
use zeroize::Zeroizing;

use super::crypto::{
    self, CertificateSigner, CertificateVerifier, DHTransform, DHTransformType,
    PseudorandomTransform, SaParams,
};
use super::engine::EngineConfig;
use super::keys::{self, ChildKeymats, DerivedKeySet};
use super::message::{
    self, Authentication, Certificate, Delete, ExchangeType, IPSecProtocolID,
    IkeHeader, IkePayload, Identification, KeyExchange, Message, Notify, NotifyMessageType,
    Payload, PayloadType, Proposal, Spi, TrafficSelector, Transform, TransformType,
};
use super::policy;
use super::session::{
    ChildResponse, ChildSaSession, IkeSaSession, InitContext, PendingChild, PendingIkeRekey,
    RequestContext, ResponsePlan, SessionError, SessionID, SessionState,
};

const NONCE_LENGTH: usize = 32;
const MAX_COOKIE_LENGTH: usize = 64;
const KEY_PAD: &[u8] = b"Key Pad for IKEv2";

/// How the local endpoint proves its identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    SharedKey,
    Signature,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    Auth,
}

pub enum Credentials {
    SharedKey(Zeroizing<Vec<u8>>),
    Certificate {
        signer: Arc<dyn CertificateSigner>,
        verifier: Arc<dyn CertificateVerifier>,
    },
}

impl Credentials {
    pub fn shared_key(psk: &[u8]) -> Credentials {
        Credentials::SharedKey(Zeroizing::new(psk.to_vec()))
    }

    pub fn auth_method(&self) -> AuthMethod {
        match self {
            Self::SharedKey(_) => AuthMethod::SharedKey,
            Self::Certificate { .. } => AuthMethod::Signature,
        }
    }

    fn psk(&self) -> Option<&[u8]> {
        match self {
            Self::SharedKey(psk) => Some(psk.as_slice()),
            Self::Certificate { .. } => None,
        }
    }

    fn signer(&self) -> Option<&dyn CertificateSigner> {
        match self {
            Self::SharedKey(_) => None,
            Self::Certificate { signer, .. } => Some(signer.as_ref()),
        }
    }

    fn verifier(&self) -> Option<&dyn CertificateVerifier> {
        match self {
            Self::SharedKey(_) => None,
            Self::Certificate { verifier, .. } => Some(verifier.as_ref()),
        }
    }
}

/// Engine state that exchange handlers read but never modify.
pub struct ExchangeContext<'a> {
    pub config: &'a EngineConfig,
    // Unused IKE SPI for the new IKE SA, present only when the exchange may rekey the IKE SA.
    pub reserved_spi: Option<u64>,
    // No other IKE SA with the peer is established, so IKE_AUTH may send INITIAL_CONTACT.
    pub initial_contact: bool,
    pub now: Instant,
}

/// Received message with the SK payload already verified and decrypted.
pub struct ReceivedMessage<'a> {
    pub header: IkeHeader,
    pub raw: &'a [u8],
    pub payloads: Vec<IkePayload>,
}

impl ReceivedMessage<'_> {
    pub fn is_response(&self) -> bool {
        self.header.flags.has(message::Flags::RESPONSE)
    }
}

pub enum Outgoing<'a> {
    Request(&'a RequestContext),
    Response,
}

pub type Parser =
    fn(&mut IkeSaSession, &ExchangeContext, &ReceivedMessage) -> Result<(), SessionError>;
pub type Generator =
    fn(&mut IkeSaSession, &ExchangeContext, Outgoing) -> Result<Message, SessionError>;

#[derive(Clone, Copy)]
pub struct ExchangeHandlers {
    pub parser: Parser,
    pub generator: Generator,
}

pub fn handlers(auth_method: AuthMethod, phase: Phase) -> ExchangeHandlers {
    match (auth_method, phase) {
        (AuthMethod::SharedKey, Phase::Init) => ExchangeHandlers {
            parser: parse_sa_init,
            generator: generate_sa_init,
        },
        (AuthMethod::SharedKey, Phase::Auth) => ExchangeHandlers {
            parser: parse_auth_psk,
            generator: generate_auth_psk,
        },
        (AuthMethod::Signature, Phase::Init) => ExchangeHandlers {
            parser: parse_sa_init,
            generator: generate_sa_init_certreq,
        },
        (AuthMethod::Signature, Phase::Auth) => ExchangeHandlers {
            parser: parse_auth_signature,
            generator: generate_auth_signature,
        },
    }
}

pub fn child_sa_handlers() -> ExchangeHandlers {
    ExchangeHandlers {
        parser: parse_create_child_sa,
        generator: generate_create_child_sa,
    }
}

pub fn informational_handlers() -> ExchangeHandlers {
    ExchangeHandlers {
        parser: parse_informational,
        generator: generate_informational,
    }
}

pub fn exchange_handlers(
    auth_method: AuthMethod,
    exchange_type: ExchangeType,
) -> Result<ExchangeHandlers, SessionError> {
    match exchange_type {
        ExchangeType::IKE_SA_INIT => Ok(handlers(auth_method, Phase::Init)),
        ExchangeType::IKE_AUTH => Ok(handlers(auth_method, Phase::Auth)),
        ExchangeType::CREATE_CHILD_SA => Ok(child_sa_handlers()),
        ExchangeType::INFORMATIONAL => Ok(informational_handlers()),
        _ => Err(SessionError::ProtocolStateViolation(
            "Unsupported exchange type",
        )),
    }
}

/// Error response to a request received on an existing session.
pub fn error_response(
    session: &IkeSaSession,
    exchange_type: ExchangeType,
    notify: Notify,
) -> Message {
    let mut msg = Message::new(session.header(exchange_type, true));
    msg.push_payload(Payload::Notify(notify));
    msg
}

/// Stateless IKE_SA_INIT response carrying a single notification.
pub fn sa_init_notify_response(request: &IkeHeader, notify: Notify) -> Message {
    let header = IkeHeader::new(
        request.initiator_spi,
        0,
        ExchangeType::IKE_SA_INIT,
        message::Flags::new(false, true),
        request.message_id,
    );
    let mut msg = Message::new(header);
    msg.push_payload(Payload::Notify(notify));
    msg
}

/// Cookie = prf(secret, Ni | IPi | SPIi), computed without keeping any state.
pub fn responder_cookie(
    secret: &[u8],
    nonce: &[u8],
    remote: &SocketAddr,
    initiator_spi: u64,
) -> Result<Vec<u8>, SessionError> {
    let prf = PseudorandomTransform::init(TransformType::PRF_HMAC_SHA2_256, secret)?;
    let ip = match remote.ip() {
        IpAddr::V4(addr) => addr.octets().to_vec(),
        IpAddr::V6(addr) => addr.octets().to_vec(),
    };
    let spi = initiator_spi.to_be_bytes();
    Ok(prf.prf_parts(&[nonce, ip.as_slice(), &spi[..]]).to_vec())
}

#[derive(Default)]
struct ExchangePayloads<'a> {
    sa: Option<&'a [Proposal]>,
    key_exchange: Option<&'a KeyExchange>,
    nonce: Option<&'a [u8]>,
    id_initiator: Option<&'a Identification>,
    id_responder: Option<&'a Identification>,
    auth: Option<&'a Authentication>,
    certificates: Vec<Certificate>,
    ts_initiator: Option<&'a [TrafficSelector]>,
    ts_responder: Option<&'a [TrafficSelector]>,
    notifies: Vec<&'a Notify>,
    deletes: Vec<&'a Delete>,
}

impl<'a> ExchangePayloads<'a> {
    fn collect(payloads: &'a [IkePayload]) -> Result<ExchangePayloads<'a>, SessionError> {
        let mut result = ExchangePayloads::default();
        for payload in payloads {
            match payload.payload {
                Payload::SecurityAssociation(ref proposals) => result.sa = Some(proposals),
                Payload::KeyExchange(ref key_exchange) => result.key_exchange = Some(key_exchange),
                Payload::Nonce(ref nonce) => result.nonce = Some(nonce),
                Payload::IdentificationInitiator(ref id) => result.id_initiator = Some(id),
                Payload::IdentificationResponder(ref id) => result.id_responder = Some(id),
                Payload::Authentication(ref auth) => result.auth = Some(auth),
                Payload::Certificate(ref certificate) => {
                    result.certificates.push(certificate.clone())
                }
                Payload::TrafficSelectorInitiator(ref ts) => result.ts_initiator = Some(ts),
                Payload::TrafficSelectorResponder(ref ts) => result.ts_responder = Some(ts),
                Payload::Notify(ref notify) => result.notifies.push(notify),
                Payload::Delete(ref delete) => result.deletes.push(delete),
                Payload::CertificateRequest(_)
                | Payload::VendorId(_)
                | Payload::Configuration(_) => {
                    debug!("Ignoring {} payload", payload.payload_type());
                }
                Payload::Encrypted(_) => {
                    return Err(SessionError::ProtocolStateViolation(
                        "Unexpected encrypted payload",
                    ))
                }
                Payload::Unknown(payload_type, _) => {
                    if payload.critical {
                        warn!("Unsupported critical payload {}", payload_type);
                        return Err(SessionError::UnsupportedCriticalPayload(payload_type));
                    }
                    debug!("Ignoring unknown payload {}", payload_type);
                }
            }
        }
        Ok(result)
    }

    fn notify(&self, message_type: NotifyMessageType) -> Option<&'a Notify> {
        self.notifies
            .iter()
            .find(|notify| notify.message_type == message_type)
            .copied()
    }

    fn error_notify(&self) -> Option<&'a Notify> {
        self.notifies
            .iter()
            .find(|notify| notify.message_type.is_error())
            .copied()
    }
}

fn required<T>(value: Option<T>, payload_type: PayloadType) -> Result<T, SessionError> {
    value.ok_or_else(|| {
        debug!("Message is missing required {} payload", payload_type);
        SessionError::MissingPayload(payload_type)
    })
}

fn check_direction(session: &IkeSaSession, msg: &ReceivedMessage) -> Result<(), SessionError> {
    // The INITIATOR flag marks every message sent by the original initiator.
    if msg.header.flags.has(message::Flags::INITIATOR) == session.is_initiator() {
        return Err(SessionError::ProtocolStateViolation(
            "Initiator flag does not match role",
        ));
    }
    Ok(())
}

fn check_setup_direction(session: &IkeSaSession, msg: &ReceivedMessage) -> Result<(), SessionError> {
    check_direction(session, msg)?;
    if msg.is_response() != session.is_initiator() {
        return Err(SessionError::ProtocolStateViolation(
            "Only the initiator sends IKE SA setup requests",
        ));
    }
    Ok(())
}

fn first_dh_group(proposals: &[Proposal]) -> Option<u16> {
    proposals
        .iter()
        .flat_map(|proposal| proposal.transforms.iter())
        .filter(|transform| {
            transform.transform_type.transform_type() == TransformType::DIFFIE_HELLMAN
        })
        .map(|transform| transform.transform_type.type_id().1)
        .find(|group| DHTransformType::is_supported(*group))
}

fn offers_dh_group(proposals: &[Proposal], group: u16) -> bool {
    let dh = TransformType::dh_group(group);
    DHTransformType::is_supported(group)
        && proposals
            .iter()
            .flat_map(|proposal| proposal.transforms.iter())
            .any(|transform| transform.transform_type == dh)
}

/// Keeps only proposals offering `group`, with every other DH transform removed.
fn restrict_dh(proposals: &[Proposal], group: u16) -> Vec<Proposal> {
    let dh = TransformType::dh_group(group);
    proposals
        .iter()
        .filter(|proposal| proposal.transforms.iter().any(|t| t.transform_type == dh))
        .map(|proposal| Proposal {
            transforms: proposal
                .transforms
                .iter()
                .filter(|t| {
                    t.transform_type.transform_type() != TransformType::DIFFIE_HELLMAN
                        || t.transform_type == dh
                })
                .cloned()
                .collect(),
            ..proposal.clone()
        })
        .collect()
}

fn with_spi(proposals: Vec<Proposal>, spi: Spi) -> Vec<Proposal> {
    proposals
        .into_iter()
        .map(|proposal| Proposal { spi, ..proposal })
        .collect()
}

/// ESP proposals sent by the initiator; DH is only offered when PFS is requested.
fn child_proposals(proposals: &[Proposal], spi: u32, pfs_group: Option<u16>) -> Vec<Proposal> {
    proposals
        .iter()
        .map(|proposal| {
            let mut transforms = proposal
                .transforms
                .iter()
                .filter(|t| t.transform_type.transform_type() != TransformType::DIFFIE_HELLMAN)
                .cloned()
                .collect::<Vec<_>>();
            if let Some(group) = pfs_group {
                transforms.push(Transform::new(TransformType::dh_group(group), None));
            }
            Proposal {
                num: proposal.num,
                protocol_id: proposal.protocol_id,
                spi: Spi::U32(spi),
                transforms,
            }
        })
        .collect()
}

/// Chooses an IKE proposal, preferring one that accepts the group of the received KE payload.
fn select_ike_proposal(
    local: &[Proposal],
    remote: &[Proposal],
    ke_group: u16,
) -> Result<(SaParams, u8), SessionError> {
    let matching_group = restrict_dh(remote, ke_group);
    if let Some((params, proposal)) = crypto::choose_sa_parameters(local, &matching_group) {
        return Ok((params, proposal.num));
    }
    let (params, proposal) =
        crypto::choose_sa_parameters(local, remote).ok_or(SessionError::UnacceptableProposal)?;
    Ok((params, proposal.num))
}

fn compute_shared_secret(
    dh: &DHTransformType,
    key_exchange: &KeyExchange,
) -> Result<Zeroizing<Vec<u8>>, SessionError> {
    if key_exchange.group != dh.group_number() {
        return Err(SessionError::InvalidKeyExchange(dh.group_number()));
    }
    dh.compute_shared_secret(&key_exchange.value).map_err(|err| {
        warn!("Failed to compute shared secret: {}", err);
        SessionError::Malformed(message::FormatError::Malformed("Invalid key exchange value"))
    })
}

fn established_keys(session: &IkeSaSession) -> Result<(&SaParams, &DerivedKeySet), SessionError> {
    match (session.params.as_ref(), session.keys.as_ref()) {
        (Some(params), Some(keys)) => Ok((params, keys)),
        _ => Err(SessionError::ProtocolStateViolation("IKE SA keys not derived")),
    }
}

fn ike_prf(params: &SaParams) -> Result<TransformType, SessionError> {
    params
        .prf
        .ok_or(SessionError::Internal("IKE SA has no PRF"))
}

/// <SignedOctets> = RealMessage | Nonce | prf(SK_px, ID')
fn signed_octets(
    session: &IkeSaSession,
    params: &SaParams,
    keys: &DerivedKeySet,
    id: &Identification,
    initiator: bool,
) -> Result<Vec<u8>, SessionError> {
    let (real_message, nonce) = if initiator {
        (&session.init_request, &session.nonce_responder)
    } else {
        (&session.init_response, &session.nonce_initiator)
    };
    let prf = params.create_prf(keys.sk_p(initiator))?;
    let id_hash = prf.prf(&id.raw_value());
    let mut octets = Vec::with_capacity(real_message.len() + nonce.len() + id_hash.len());
    octets.extend_from_slice(real_message);
    octets.extend_from_slice(nonce);
    octets.extend_from_slice(&id_hash);
    Ok(octets)
}

fn psk_prf(params: &SaParams, psk: &[u8]) -> Result<PseudorandomTransform, SessionError> {
    let pad_key = params.create_prf(psk)?.prf(KEY_PAD);
    Ok(params.create_prf(&pad_key)?)
}

type Signer = fn(
    &ExchangeContext,
    &SaParams,
    &[u8],
) -> Result<(Authentication, Vec<Certificate>), SessionError>;

type Verifier = fn(
    &ExchangeContext,
    &SaParams,
    &[u8],
    &Identification,
    &Authentication,
    &[Certificate],
) -> Result<(), SessionError>;

fn sign_psk(
    ctx: &ExchangeContext,
    params: &SaParams,
    signed_octets: &[u8],
) -> Result<(Authentication, Vec<Certificate>), SessionError> {
    let psk = ctx
        .config
        .credentials
        .psk()
        .ok_or("Pre-shared key is not configured")?;
    let data = psk_prf(params, psk)?.prf(signed_octets);
    let auth = Authentication {
        method: message::AuthMethod::SHARED_KEY_MESSAGE_INTEGRITY_CODE,
        data: data.to_vec(),
    };
    Ok((auth, vec![]))
}

fn verify_psk(
    ctx: &ExchangeContext,
    params: &SaParams,
    signed_octets: &[u8],
    id: &Identification,
    auth: &Authentication,
    _certificates: &[Certificate],
) -> Result<(), SessionError> {
    if auth.method != message::AuthMethod::SHARED_KEY_MESSAGE_INTEGRITY_CODE {
        warn!("Peer {} uses unexpected auth method {}", id, auth.method);
        return Err(SessionError::AuthenticationFailed);
    }
    let psk = ctx
        .config
        .credentials
        .psk()
        .ok_or("Pre-shared key is not configured")?;
    if psk_prf(params, psk)?.verify(signed_octets, &auth.data) {
        Ok(())
    } else {
        warn!("Peer {} sent invalid AUTH payload", id);
        Err(SessionError::AuthenticationFailed)
    }
}

fn sign_certificate(
    ctx: &ExchangeContext,
    _params: &SaParams,
    signed_octets: &[u8],
) -> Result<(Authentication, Vec<Certificate>), SessionError> {
    let signer = ctx
        .config
        .credentials
        .signer()
        .ok_or("Certificate signer is not configured")?;
    let data = signer.sign(signed_octets).map_err(|err| {
        warn!("Failed to sign AUTH payload: {}", err);
        SessionError::Internal("Failed to sign AUTH payload")
    })?;
    let auth = Authentication {
        method: signer.auth_method(),
        data,
    };
    Ok((auth, signer.certificates()))
}

fn verify_certificate(
    ctx: &ExchangeContext,
    _params: &SaParams,
    signed_octets: &[u8],
    id: &Identification,
    auth: &Authentication,
    certificates: &[Certificate],
) -> Result<(), SessionError> {
    let verifier = ctx
        .config
        .credentials
        .verifier()
        .ok_or("Certificate verifier is not configured")?;
    verifier
        .verify(certificates, id, auth, signed_octets)
        .map_err(|err| {
            warn!("Peer {} signature verification failed: {}", id, err);
            SessionError::AuthenticationFailed
        })
}

fn generate_sa_init(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    outgoing: Outgoing,
) -> Result<Message, SessionError> {
    match outgoing {
        Outgoing::Request(_) => generate_sa_init_request(session, ctx),
        Outgoing::Response => generate_sa_init_response(session, false),
    }
}

fn generate_sa_init_certreq(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    outgoing: Outgoing,
) -> Result<Message, SessionError> {
    match outgoing {
        Outgoing::Request(_) => generate_sa_init_request(session, ctx),
        Outgoing::Response => generate_sa_init_response(session, true),
    }
}

fn generate_sa_init_request(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
) -> Result<Message, SessionError> {
    if session.state != SessionState::Init {
        return Err(SessionError::ProtocolStateViolation(
            "IKE SA is already initialized",
        ));
    }
    if session.init.is_none() {
        let dh_group =
            first_dh_group(&ctx.config.ike_proposals).ok_or(SessionError::UnacceptableProposal)?;
        session.init = Some(InitContext {
            nonce_local: crypto::random_nonce(NONCE_LENGTH),
            dh: Some(DHTransformType::from_group(dh_group)?),
            dh_group,
            cookie: None,
        });
    }
    let init = session
        .init
        .as_ref()
        .ok_or(SessionError::Internal("Missing IKE_SA_INIT context"))?;
    let dh = init
        .dh
        .as_ref()
        .ok_or(SessionError::Internal("Missing DH context"))?;

    let mut msg = Message::new(session.header(ExchangeType::IKE_SA_INIT, false));
    if let Some(ref cookie) = init.cookie {
        msg.push_payload(Payload::Notify(Notify::new(NotifyMessageType::COOKIE, cookie)));
    }
    msg.push_payload(Payload::SecurityAssociation(
        ctx.config.ike_proposals.clone(),
    ));
    msg.push_payload(Payload::KeyExchange(KeyExchange {
        group: init.dh_group,
        value: dh.read_public_key(),
    }));
    msg.push_payload(Payload::Nonce(init.nonce_local.clone()));
    Ok(msg)
}

fn generate_sa_init_response(
    session: &mut IkeSaSession,
    certificate_request: bool,
) -> Result<Message, SessionError> {
    let (proposal, key_exchange) = match session.response_plan.take() {
        Some(ResponsePlan::SaInit {
            proposal,
            key_exchange,
        }) => (proposal, key_exchange),
        _ => return Err(SessionError::Internal("No IKE_SA_INIT response prepared")),
    };
    let mut msg = Message::new(session.header(ExchangeType::IKE_SA_INIT, true));
    msg.push_payload(Payload::SecurityAssociation(vec![proposal]));
    msg.push_payload(Payload::KeyExchange(key_exchange));
    msg.push_payload(Payload::Nonce(session.nonce_responder.clone()));
    if certificate_request {
        msg.push_payload(Payload::CertificateRequest(Certificate {
            encoding: message::CertificateEncoding::X509_SIGNATURE,
            data: vec![],
        }));
    }
    Ok(msg)
}

fn parse_sa_init(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    msg: &ReceivedMessage,
) -> Result<(), SessionError> {
    check_setup_direction(session, msg)?;
    if msg.is_response() {
        parse_sa_init_response(session, ctx, msg)
    } else {
        parse_sa_init_request(session, ctx, msg)
    }
}

fn parse_sa_init_request(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    msg: &ReceivedMessage,
) -> Result<(), SessionError> {
    if session.state != SessionState::Init {
        return Err(SessionError::ProtocolStateViolation(
            "IKE_SA_INIT on initialized session",
        ));
    }
    let payloads = ExchangePayloads::collect(&msg.payloads)?;
    let proposals = required(payloads.sa, PayloadType::SECURITY_ASSOCIATION)?;
    let key_exchange = required(payloads.key_exchange, PayloadType::KEY_EXCHANGE)?;
    let nonce_remote = required(payloads.nonce, PayloadType::NONCE)?;

    let (params, proposal_num) =
        select_ike_proposal(&ctx.config.ike_proposals, proposals, key_exchange.group)?;
    let dh_group = params
        .dh_group()
        .ok_or(SessionError::UnacceptableProposal)?;
    if key_exchange.group != dh_group {
        debug!(
            "Initiator sent KE for group {}, requesting group {}",
            key_exchange.group, dh_group
        );
        return Err(SessionError::InvalidKeyExchange(dh_group));
    }
    let dh = DHTransformType::from_group(dh_group)?;
    let shared_secret = compute_shared_secret(&dh, key_exchange)?;
    let nonce_local = crypto::random_nonce(NONCE_LENGTH);
    let skeyseed = keys::skeyseed(&params, nonce_remote, &nonce_local, &shared_secret)?;
    let keys = DerivedKeySet::derive(
        &params,
        &skeyseed,
        nonce_remote,
        &nonce_local,
        session.id.initiator_spi(),
        session.id.responder_spi(),
        ctx.config.sk_px,
    )?;
    let crypto_stack = keys.crypto_stack(&params, false)?;

    debug!("Session {} negotiated IKE SA {}", session.id, params);
    session.response_plan = Some(ResponsePlan::SaInit {
        proposal: params.to_proposal(proposal_num, Spi::None),
        key_exchange: KeyExchange {
            group: dh_group,
            value: dh.read_public_key(),
        },
    });
    session.nonce_initiator = nonce_remote.to_vec();
    session.nonce_responder = nonce_local;
    session.params = Some(params);
    session.keys = Some(keys);
    session.crypto_stack = Some(crypto_stack);
    session.init_request = msg.raw.to_vec();
    session.state = SessionState::Auth;
    Ok(())
}

fn parse_sa_init_response(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    msg: &ReceivedMessage,
) -> Result<(), SessionError> {
    if session.state != SessionState::Init {
        return Err(SessionError::ProtocolStateViolation(
            "Unexpected IKE_SA_INIT response",
        ));
    }
    let payloads = ExchangePayloads::collect(&msg.payloads)?;

    // A cookie request restarts the exchange before anything else is looked at.
    if let Some(cookie) = payloads.notify(NotifyMessageType::COOKIE) {
        if cookie.data.is_empty() || cookie.data.len() > MAX_COOKIE_LENGTH {
            return Err(SessionError::Malformed(message::FormatError::Malformed(
                "Invalid cookie length",
            )));
        }
        let init = session
            .init
            .as_mut()
            .ok_or(SessionError::Internal("Missing IKE_SA_INIT context"))?;
        debug!("Session {} responder requested a cookie", session.id);
        init.cookie = Some(cookie.data.clone());
        session.queue_request_first(RequestContext::SaInit);
        return Ok(());
    }
    if let Some(notify) = payloads.notify(NotifyMessageType::INVALID_KE_PAYLOAD) {
        let group = match notify.data.as_slice() {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            _ => {
                return Err(SessionError::Malformed(message::FormatError::Malformed(
                    "Invalid INVALID_KE_PAYLOAD data",
                )))
            }
        };
        let init = session
            .init
            .as_mut()
            .ok_or(SessionError::Internal("Missing IKE_SA_INIT context"))?;
        if group == init.dh_group || !offers_dh_group(&ctx.config.ike_proposals, group) {
            warn!("Responder requested unacceptable DH group {}", group);
            return Err(SessionError::PeerNotify(notify.message_type));
        }
        debug!("Session {} retrying with DH group {}", session.id, group);
        init.dh = Some(DHTransformType::from_group(group)?);
        init.dh_group = group;
        session.queue_request_first(RequestContext::SaInit);
        return Ok(());
    }
    if let Some(notify) = payloads.error_notify() {
        warn!("Responder rejected IKE_SA_INIT: {}", notify.message_type);
        return Err(SessionError::PeerNotify(notify.message_type));
    }

    let proposals = required(payloads.sa, PayloadType::SECURITY_ASSOCIATION)?;
    let key_exchange = required(payloads.key_exchange, PayloadType::KEY_EXCHANGE)?;
    let nonce_remote = required(payloads.nonce, PayloadType::NONCE)?;
    if proposals.len() != 1 {
        return Err(SessionError::UnacceptableProposal);
    }
    let (params, _) = crypto::choose_sa_parameters(&ctx.config.ike_proposals, proposals)
        .ok_or(SessionError::UnacceptableProposal)?;
    let responder_spi = msg.header.responder_spi;
    if responder_spi == 0 {
        return Err(SessionError::Malformed(message::FormatError::Malformed(
            "Responder SPI is zero",
        )));
    }
    let init = session
        .init
        .as_ref()
        .ok_or(SessionError::Internal("Missing IKE_SA_INIT context"))?;
    if params.dh_group() != Some(init.dh_group) {
        return Err(SessionError::UnacceptableProposal);
    }
    let dh = init
        .dh
        .as_ref()
        .ok_or(SessionError::Internal("Missing DH context"))?;
    let shared_secret = compute_shared_secret(dh, key_exchange)?;
    let skeyseed = keys::skeyseed(&params, &init.nonce_local, nonce_remote, &shared_secret)?;
    let keys = DerivedKeySet::derive(
        &params,
        &skeyseed,
        &init.nonce_local,
        nonce_remote,
        session.id.initiator_spi(),
        responder_spi,
        ctx.config.sk_px,
    )?;
    let crypto_stack = keys.crypto_stack(&params, true)?;
    let nonce_local = init.nonce_local.clone();

    session.id = SessionID::new(session.id.initiator_spi(), responder_spi);
    debug!("Session {} negotiated IKE SA {}", session.id, params);
    session.nonce_initiator = nonce_local;
    session.nonce_responder = nonce_remote.to_vec();
    session.params = Some(params);
    session.keys = Some(keys);
    session.crypto_stack = Some(crypto_stack);
    session.init_response = msg.raw.to_vec();
    session.init = None;
    session.state = SessionState::Auth;
    session.queue_request_first(RequestContext::Auth);
    Ok(())
}

fn generate_auth_psk(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    outgoing: Outgoing,
) -> Result<Message, SessionError> {
    generate_auth(session, ctx, outgoing, sign_psk)
}

fn generate_auth_signature(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    outgoing: Outgoing,
) -> Result<Message, SessionError> {
    generate_auth(session, ctx, outgoing, sign_certificate)
}

fn parse_auth_psk(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    msg: &ReceivedMessage,
) -> Result<(), SessionError> {
    parse_auth(session, ctx, msg, verify_psk)
}

fn parse_auth_signature(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    msg: &ReceivedMessage,
) -> Result<(), SessionError> {
    parse_auth(session, ctx, msg, verify_certificate)
}

fn generate_auth(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    outgoing: Outgoing,
    signer: Signer,
) -> Result<Message, SessionError> {
    let is_response = matches!(outgoing, Outgoing::Response);
    let (params, keys) = established_keys(session)?;
    let octets = signed_octets(session, params, keys, &ctx.config.local_id, !is_response)?;
    let (auth, certificates) = signer(ctx, params, &octets)?;

    let mut msg = Message::new(session.header(ExchangeType::IKE_AUTH, is_response));
    if is_response {
        msg.push_payload(Payload::IdentificationResponder(ctx.config.local_id.clone()));
    } else {
        msg.push_payload(Payload::IdentificationInitiator(ctx.config.local_id.clone()));
    }
    certificates
        .into_iter()
        .for_each(|certificate| msg.push_payload(Payload::Certificate(certificate)));
    msg.push_payload(Payload::Authentication(auth));

    if is_response {
        match session.response_plan.take() {
            Some(ResponsePlan::Auth { child: Ok(child) }) => {
                msg.push_payload(Payload::SecurityAssociation(vec![child.proposal]));
                msg.push_payload(Payload::TrafficSelectorInitiator(child.ts_initiator));
                msg.push_payload(Payload::TrafficSelectorResponder(child.ts_responder));
            }
            Some(ResponsePlan::Auth { child: Err(error) }) => {
                msg.push_payload(Payload::Notify(Notify::new(error, &[])));
            }
            _ => return Err(SessionError::Internal("No IKE_AUTH response prepared")),
        }
        return Ok(msg);
    }

    let local_spi = session.allocate_child_spi()?;
    let (ts_initiator, ts_responder) = ctx.config.spd.initiator_selectors();
    msg.push_payload(Payload::SecurityAssociation(child_proposals(
        &ctx.config.esp_proposals,
        local_spi,
        None,
    )));
    msg.push_payload(Payload::TrafficSelectorInitiator(ts_initiator.clone()));
    msg.push_payload(Payload::TrafficSelectorResponder(ts_responder.clone()));
    if ctx.initial_contact {
        msg.push_payload(Payload::Notify(Notify::new(
            NotifyMessageType::INITIAL_CONTACT,
            &[],
        )));
    }
    session.pending_child = Some(PendingChild {
        local_spi,
        nonce_local: None,
        dh: None,
        ts_initiator,
        ts_responder,
        rekey: None,
    });
    Ok(msg)
}

fn parse_auth(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    msg: &ReceivedMessage,
    verifier: Verifier,
) -> Result<(), SessionError> {
    check_setup_direction(session, msg)?;
    if session.state != SessionState::Auth {
        return Err(SessionError::ProtocolStateViolation(
            "IKE_AUTH outside of authentication phase",
        ));
    }
    if msg.is_response() {
        parse_auth_response(session, ctx, msg, verifier)
    } else {
        parse_auth_request(session, ctx, msg, verifier)
    }
}

fn parse_auth_request(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    msg: &ReceivedMessage,
    verifier: Verifier,
) -> Result<(), SessionError> {
    let payloads = ExchangePayloads::collect(&msg.payloads)?;
    let id = required(payloads.id_initiator, PayloadType::ID_INITIATOR)?;
    let auth = required(payloads.auth, PayloadType::AUTHENTICATION)?;
    let proposals = required(payloads.sa, PayloadType::SECURITY_ASSOCIATION)?;
    let ts_initiator = required(payloads.ts_initiator, PayloadType::TRAFFIC_SELECTOR_INITIATOR)?;
    let ts_responder = required(payloads.ts_responder, PayloadType::TRAFFIC_SELECTOR_RESPONDER)?;

    let (params, keys) = established_keys(session)?;
    let octets = signed_octets(session, params, keys, id, true)?;
    verifier(ctx, params, &octets, id, auth, &payloads.certificates)?;

    let child = accept_child_sa(
        session,
        ctx,
        proposals,
        ts_initiator,
        ts_responder,
        (session.nonce_initiator.as_slice(), session.nonce_responder.as_slice()),
        None,
    );
    let child = match child {
        Ok((child, response)) => {
            session.insert_child_sa(child);
            Ok(response)
        }
        Err(err) => {
            warn!("Session {} rejected Child SA from {}: {}", session.id, id, err);
            let notify = err
                .notify()
                .map(|notify| notify.message_type)
                .unwrap_or(NotifyMessageType::NO_PROPOSAL_CHOSEN);
            Err(notify)
        }
    };
    session.response_plan = Some(ResponsePlan::Auth { child });
    session.remote_id = Some(id.clone());
    session.set_established(ctx.now, ctx.config.ike_lifetime);
    info!("Session {} established IKE SA with {}", session.id, id);
    Ok(())
}

fn parse_auth_response(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    msg: &ReceivedMessage,
    verifier: Verifier,
) -> Result<(), SessionError> {
    let payloads = ExchangePayloads::collect(&msg.payloads)?;
    if payloads.auth.is_none() {
        if let Some(notify) = payloads.error_notify() {
            warn!("Responder rejected IKE_AUTH: {}", notify.message_type);
            return Err(SessionError::PeerNotify(notify.message_type));
        }
    }
    let id = required(payloads.id_responder, PayloadType::ID_RESPONDER)?;
    let auth = required(payloads.auth, PayloadType::AUTHENTICATION)?;

    let (params, keys) = established_keys(session)?;
    let octets = signed_octets(session, params, keys, id, false)?;
    verifier(ctx, params, &octets, id, auth, &payloads.certificates)?;

    let pending = session
        .pending_child
        .as_ref()
        .ok_or(SessionError::Internal("No Child SA requested"))?;
    let child = match (payloads.sa, payloads.ts_initiator, payloads.ts_responder) {
        (Some(proposals), Some(ts_initiator), Some(ts_responder)) => Some(complete_child_sa(
            session,
            ctx,
            pending,
            proposals,
            ts_initiator,
            ts_responder,
            (session.nonce_initiator.as_slice(), session.nonce_responder.as_slice()),
            None,
        )?),
        _ => {
            match payloads.error_notify() {
                Some(notify) => warn!(
                    "Session {} Child SA was not created: {}",
                    session.id, notify.message_type
                ),
                None => warn!("Session {} Child SA was not created", session.id),
            }
            None
        }
    };

    session.pending_child = None;
    if let Some(child) = child {
        session.insert_child_sa(child);
    }
    session.remote_id = Some(id.clone());
    session.set_established(ctx.now, ctx.config.ike_lifetime);
    info!("Session {} established IKE SA with {}", session.id, id);
    Ok(())
}

/// Responder side of Child SA negotiation; nothing is committed to the session.
fn accept_child_sa(
    session: &IkeSaSession,
    ctx: &ExchangeContext,
    proposals: &[Proposal],
    ts_initiator: &[TrafficSelector],
    ts_responder: &[TrafficSelector],
    nonces: (&[u8], &[u8]),
    key_exchange: Option<&KeyExchange>,
) -> Result<(ChildSaSession, ChildResponse), SessionError> {
    let (ike_params, ike_keys) = established_keys(session)?;
    let (params, proposal) = crypto::choose_sa_parameters(&ctx.config.esp_proposals, proposals)
        .ok_or(SessionError::UnacceptableProposal)?;
    let remote_spi = match proposal.spi {
        Spi::U32(spi) => spi,
        _ => {
            return Err(SessionError::Malformed(message::FormatError::Malformed(
                "Child SA proposal has no SPI",
            )))
        }
    };
    let (pfs_secret, key_exchange_response) = match params.dh_group() {
        Some(group) => {
            let key_exchange = key_exchange.ok_or(SessionError::InvalidKeyExchange(group))?;
            let dh = DHTransformType::from_group(group)?;
            let shared_secret = compute_shared_secret(&dh, key_exchange)?;
            let response = KeyExchange {
                group,
                value: dh.read_public_key(),
            };
            (Some(shared_secret), Some(response))
        }
        None => (None, None),
    };
    let narrowed = ctx
        .config
        .spd
        .narrow(ts_initiator, ts_responder)
        .ok_or(SessionError::PolicyMismatch)?;
    let local_spi = session.allocate_child_spi()?;
    let keys = ChildKeymats::derive(
        &params,
        ike_prf(ike_params)?,
        ike_keys.sk_d(),
        pfs_secret.as_ref().map(|secret| secret.as_slice()),
        nonces.0,
        nonces.1,
        false,
    )?;
    let response = ChildResponse {
        proposal: params.to_proposal(proposal.num, Spi::U32(local_spi)),
        ts_initiator: narrowed.ts_initiator.clone(),
        ts_responder: narrowed.ts_responder.clone(),
        nonce: None,
        key_exchange: key_exchange_response,
    };
    let child = ChildSaSession::new(
        local_spi,
        remote_spi,
        params,
        narrowed.ts_responder,
        narrowed.ts_initiator,
        keys,
        session.id,
    );
    Ok((child, response))
}

/// Initiator side of Child SA negotiation, validating the responder's choice.
#[allow(clippy::too_many_arguments)]
fn complete_child_sa(
    session: &IkeSaSession,
    ctx: &ExchangeContext,
    pending: &PendingChild,
    proposals: &[Proposal],
    ts_initiator: &[TrafficSelector],
    ts_responder: &[TrafficSelector],
    nonces: (&[u8], &[u8]),
    key_exchange: Option<&KeyExchange>,
) -> Result<ChildSaSession, SessionError> {
    let (ike_params, ike_keys) = established_keys(session)?;
    if proposals.len() != 1 {
        return Err(SessionError::UnacceptableProposal);
    }
    let (params, proposal) = crypto::choose_sa_parameters(&ctx.config.esp_proposals, proposals)
        .ok_or(SessionError::UnacceptableProposal)?;
    let remote_spi = match proposal.spi {
        Spi::U32(spi) => spi,
        _ => {
            return Err(SessionError::Malformed(message::FormatError::Malformed(
                "Child SA proposal has no SPI",
            )))
        }
    };
    let pfs_secret = match (params.dh_group(), pending.dh.as_ref()) {
        (None, _) => None,
        (Some(group), Some(dh)) if dh.group_number() == group => {
            let key_exchange = required(key_exchange, PayloadType::KEY_EXCHANGE)?;
            Some(compute_shared_secret(dh, key_exchange)?)
        }
        (Some(_), _) => return Err(SessionError::UnacceptableProposal),
    };
    if !policy::selectors_within(&pending.ts_initiator, ts_initiator)
        || !policy::selectors_within(&pending.ts_responder, ts_responder)
    {
        warn!("Responder returned traffic selectors outside of proposal");
        return Err(SessionError::PolicyMismatch);
    }
    let keys = ChildKeymats::derive(
        &params,
        ike_prf(ike_params)?,
        ike_keys.sk_d(),
        pfs_secret.as_ref().map(|secret| secret.as_slice()),
        nonces.0,
        nonces.1,
        true,
    )?;
    Ok(ChildSaSession::new(
        pending.local_spi,
        remote_spi,
        params,
        ts_initiator.to_vec(),
        ts_responder.to_vec(),
        keys,
        session.id,
    ))
}

fn generate_create_child_sa(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    outgoing: Outgoing,
) -> Result<Message, SessionError> {
    match outgoing {
        Outgoing::Request(RequestContext::CreateChild { rekey, pfs }) => {
            generate_create_child_request(session, ctx, *rekey, *pfs)
        }
        Outgoing::Request(RequestContext::RekeyIke) => generate_rekey_ike_request(session, ctx),
        Outgoing::Request(_) => Err(SessionError::Internal(
            "Unsupported CREATE_CHILD_SA request",
        )),
        Outgoing::Response => generate_create_child_response(session),
    }
}

fn generate_create_child_request(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    rekey: Option<u32>,
    pfs: bool,
) -> Result<Message, SessionError> {
    if !session.state.is_established() {
        return Err(SessionError::ProtocolStateViolation("IKE SA is not established"));
    }
    let (ike_params, _) = established_keys(session)?;
    let (ts_initiator, ts_responder) = match rekey {
        Some(spi) => {
            let child = session.child_sa(spi).ok_or(SessionError::ChildSaNotFound)?;
            (child.ts_local().to_vec(), child.ts_remote().to_vec())
        }
        None => ctx.config.spd.initiator_selectors(),
    };
    let dh = if pfs {
        let group = ike_params
            .dh_group()
            .ok_or(SessionError::UnacceptableProposal)?;
        Some(DHTransformType::from_group(group)?)
    } else {
        None
    };
    let local_spi = session.allocate_child_spi()?;
    let nonce_local = crypto::random_nonce(NONCE_LENGTH);

    let mut msg = Message::new(session.header(ExchangeType::CREATE_CHILD_SA, false));
    if let Some(spi) = rekey {
        msg.push_payload(Payload::Notify(Notify {
            protocol_id: Some(IPSecProtocolID::ESP),
            spi: Spi::U32(spi),
            message_type: NotifyMessageType::REKEY_SA,
            data: vec![],
        }));
    }
    msg.push_payload(Payload::SecurityAssociation(child_proposals(
        &ctx.config.esp_proposals,
        local_spi,
        dh.as_ref().map(|dh| dh.group_number()),
    )));
    msg.push_payload(Payload::Nonce(nonce_local.clone()));
    if let Some(ref dh) = dh {
        msg.push_payload(Payload::KeyExchange(KeyExchange {
            group: dh.group_number(),
            value: dh.read_public_key(),
        }));
    }
    msg.push_payload(Payload::TrafficSelectorInitiator(ts_initiator.clone()));
    msg.push_payload(Payload::TrafficSelectorResponder(ts_responder.clone()));

    session.pending_child = Some(PendingChild {
        local_spi,
        nonce_local: Some(nonce_local),
        dh,
        ts_initiator,
        ts_responder,
        rekey,
    });
    session.state = SessionState::CreateChild;
    Ok(msg)
}

fn generate_rekey_ike_request(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
) -> Result<Message, SessionError> {
    if !session.state.is_established() {
        return Err(SessionError::ProtocolStateViolation("IKE SA is not established"));
    }
    let (ike_params, _) = established_keys(session)?;
    let group = ike_params
        .dh_group()
        .ok_or(SessionError::UnacceptableProposal)?;
    let proposals = restrict_dh(&ctx.config.ike_proposals, group);
    if proposals.is_empty() {
        return Err(SessionError::UnacceptableProposal);
    }
    let dh = DHTransformType::from_group(group)?;
    let local_spi = ctx
        .reserved_spi
        .ok_or(SessionError::Internal("No IKE SPI reserved for rekey"))?;
    let nonce_local = crypto::random_nonce(NONCE_LENGTH);

    let mut msg = Message::new(session.header(ExchangeType::CREATE_CHILD_SA, false));
    msg.push_payload(Payload::SecurityAssociation(with_spi(
        proposals,
        Spi::U64(local_spi),
    )));
    msg.push_payload(Payload::Nonce(nonce_local.clone()));
    msg.push_payload(Payload::KeyExchange(KeyExchange {
        group,
        value: dh.read_public_key(),
    }));

    session.pending_rekey = Some(PendingIkeRekey {
        local_spi,
        nonce_local,
        dh,
    });
    session.state = SessionState::SaRekeying;
    Ok(msg)
}

fn generate_create_child_response(session: &mut IkeSaSession) -> Result<Message, SessionError> {
    let mut msg = Message::new(session.header(ExchangeType::CREATE_CHILD_SA, true));
    match session.response_plan.take() {
        Some(ResponsePlan::CreateChild(child)) => {
            let nonce = child
                .nonce
                .ok_or(SessionError::Internal("Child SA response has no nonce"))?;
            msg.push_payload(Payload::SecurityAssociation(vec![child.proposal]));
            msg.push_payload(Payload::Nonce(nonce));
            if let Some(key_exchange) = child.key_exchange {
                msg.push_payload(Payload::KeyExchange(key_exchange));
            }
            msg.push_payload(Payload::TrafficSelectorInitiator(child.ts_initiator));
            msg.push_payload(Payload::TrafficSelectorResponder(child.ts_responder));
        }
        Some(ResponsePlan::RekeyIke {
            proposal,
            nonce,
            key_exchange,
        }) => {
            msg.push_payload(Payload::SecurityAssociation(vec![proposal]));
            msg.push_payload(Payload::Nonce(nonce));
            msg.push_payload(Payload::KeyExchange(key_exchange));
        }
        _ => {
            return Err(SessionError::Internal(
                "No CREATE_CHILD_SA response prepared",
            ))
        }
    }
    Ok(msg)
}

fn parse_create_child_sa(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    msg: &ReceivedMessage,
) -> Result<(), SessionError> {
    check_direction(session, msg)?;
    if msg.is_response() {
        return parse_create_child_response(session, ctx, msg);
    }
    if !session.state.is_established() {
        return Err(SessionError::ProtocolStateViolation("IKE SA is not established"));
    }
    if session.state == SessionState::SaRekeying {
        // Simultaneous rekeying is not supported.
        return Err(SessionError::ResourceExhausted);
    }
    let payloads = ExchangePayloads::collect(&msg.payloads)?;
    let proposals = required(payloads.sa, PayloadType::SECURITY_ASSOCIATION)?;
    let nonce_remote = required(payloads.nonce, PayloadType::NONCE)?;
    let rekeys_ike = proposals
        .first()
        .is_some_and(|proposal| proposal.protocol_id == IPSecProtocolID::IKE);
    if rekeys_ike {
        parse_rekey_ike_request(session, ctx, &payloads, proposals, nonce_remote)
    } else {
        parse_create_child_request(session, ctx, &payloads, proposals, nonce_remote)
    }
}

fn parse_create_child_request(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    payloads: &ExchangePayloads,
    proposals: &[Proposal],
    nonce_remote: &[u8],
) -> Result<(), SessionError> {
    let ts_initiator = required(payloads.ts_initiator, PayloadType::TRAFFIC_SELECTOR_INITIATOR)?;
    let ts_responder = required(payloads.ts_responder, PayloadType::TRAFFIC_SELECTOR_RESPONDER)?;
    if let Some(rekey) = payloads.notify(NotifyMessageType::REKEY_SA) {
        let old_child = match rekey.spi {
            Spi::U32(spi) => session.child_sa_by_remote_spi(spi),
            _ => None,
        };
        match old_child {
            Some(child) => debug!("Session {} rekeying Child SA {}", session.id, child),
            None => {
                warn!("Session {} peer rekeys unknown Child SA {}", session.id, rekey.spi);
                return Err(SessionError::ChildSaNotFound);
            }
        }
    }
    let nonce_local = crypto::random_nonce(NONCE_LENGTH);
    let (child, mut response) = accept_child_sa(
        session,
        ctx,
        proposals,
        ts_initiator,
        ts_responder,
        (nonce_remote, nonce_local.as_slice()),
        payloads.key_exchange,
    )?;
    response.nonce = Some(nonce_local);
    info!("Session {} created Child SA {}", session.id, child);
    session.insert_child_sa(child);
    session.response_plan = Some(ResponsePlan::CreateChild(response));
    session.state = SessionState::ChildSaEstablished;
    Ok(())
}

fn parse_rekey_ike_request(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    payloads: &ExchangePayloads,
    proposals: &[Proposal],
    nonce_remote: &[u8],
) -> Result<(), SessionError> {
    let key_exchange = required(payloads.key_exchange, PayloadType::KEY_EXCHANGE)?;
    let (old_params, old_keys) = established_keys(session)?;
    let (params, proposal_num) =
        select_ike_proposal(&ctx.config.ike_proposals, proposals, key_exchange.group)?;
    let dh_group = params
        .dh_group()
        .ok_or(SessionError::UnacceptableProposal)?;
    if key_exchange.group != dh_group {
        return Err(SessionError::InvalidKeyExchange(dh_group));
    }
    let remote_spi = proposals
        .iter()
        .find(|proposal| proposal.num == proposal_num)
        .and_then(|proposal| match proposal.spi {
            Spi::U64(spi) if spi != 0 => Some(spi),
            _ => None,
        })
        .ok_or(SessionError::Malformed(message::FormatError::Malformed(
            "IKE SA proposal has no SPI",
        )))?;
    let dh = DHTransformType::from_group(dh_group)?;
    let shared_secret = compute_shared_secret(&dh, key_exchange)?;
    let nonce_local = crypto::random_nonce(NONCE_LENGTH);
    let skeyseed = keys::rekey_skeyseed(
        ike_prf(old_params)?,
        old_keys.sk_d(),
        &shared_secret,
        nonce_remote,
        &nonce_local,
    )?;
    let local_spi = ctx
        .reserved_spi
        .ok_or(SessionError::Internal("No IKE SPI reserved for rekey"))?;
    let keys = DerivedKeySet::derive(
        &params,
        &skeyseed,
        nonce_remote,
        &nonce_local,
        remote_spi,
        local_spi,
        ctx.config.sk_px,
    )?;
    let crypto_stack = keys.crypto_stack(&params, false)?;

    let mut rekeyed = IkeSaSession::new(
        SessionID::new(remote_spi, local_spi),
        false,
        session.remote_addr,
    );
    rekeyed.nonce_initiator = nonce_remote.to_vec();
    rekeyed.nonce_responder = nonce_local.clone();
    rekeyed.params = Some(params.clone());
    rekeyed.keys = Some(keys);
    rekeyed.crypto_stack = Some(crypto_stack);
    rekeyed.remote_id = session.remote_id.clone();

    session.response_plan = Some(ResponsePlan::RekeyIke {
        proposal: params.to_proposal(proposal_num, Spi::U64(local_spi)),
        nonce: nonce_local,
        key_exchange: KeyExchange {
            group: dh_group,
            value: dh.read_public_key(),
        },
    });
    adopt_child_sas(session, &mut rekeyed);
    rekeyed.set_established(ctx.now, ctx.config.ike_lifetime);
    info!("Session {} rekeyed as {}", session.id, rekeyed.id);
    session.rekeyed = Some(Box::new(rekeyed));
    session.state = SessionState::SaRekeying;
    Ok(())
}

/// Moves Child SAs to the IKE SA that replaces `session`.
fn adopt_child_sas(session: &mut IkeSaSession, rekeyed: &mut IkeSaSession) {
    for (spi, mut child) in session.child_sas.drain() {
        child.set_parent(rekeyed.id);
        rekeyed.child_sas.insert(spi, child);
    }
}

fn parse_create_child_response(
    session: &mut IkeSaSession,
    ctx: &ExchangeContext,
    msg: &ReceivedMessage,
) -> Result<(), SessionError> {
    let payloads = ExchangePayloads::collect(&msg.payloads)?;
    if let Some(notify) = payloads.error_notify() {
        warn!(
            "Session {} peer rejected CREATE_CHILD_SA: {}",
            session.id, notify.message_type
        );
        return Err(SessionError::PeerNotify(notify.message_type));
    }
    let proposals = required(payloads.sa, PayloadType::SECURITY_ASSOCIATION)?;
    let nonce_remote = required(payloads.nonce, PayloadType::NONCE)?;
    match session.outstanding_request() {
        Some(RequestContext::CreateChild { rekey, .. }) => {
            let rekey = *rekey;
            let ts_initiator =
                required(payloads.ts_initiator, PayloadType::TRAFFIC_SELECTOR_INITIATOR)?;
            let ts_responder =
                required(payloads.ts_responder, PayloadType::TRAFFIC_SELECTOR_RESPONDER)?;
            let pending = session
                .pending_child
                .as_ref()
                .ok_or(SessionError::Internal("No Child SA requested"))?;
            let nonce_local = pending
                .nonce_local
                .as_ref()
                .ok_or(SessionError::Internal("Child SA request has no nonce"))?;
            let child = complete_child_sa(
                session,
                ctx,
                pending,
                proposals,
                ts_initiator,
                ts_responder,
                (nonce_local.as_slice(), nonce_remote),
                payloads.key_exchange,
            )?;

            info!("Session {} created Child SA {}", session.id, child);
            session.pending_child = None;
            session.insert_child_sa(child);
            session.state = SessionState::ChildSaEstablished;
            if let Some(old_spi) = rekey {
                session.queue_request_first(RequestContext::DeleteChild(vec![old_spi]));
            }
            Ok(())
        }
        Some(RequestContext::RekeyIke) => {
            let key_exchange = required(payloads.key_exchange, PayloadType::KEY_EXCHANGE)?;
            let (old_params, old_keys) = established_keys(session)?;
            let pending = session
                .pending_rekey
                .as_ref()
                .ok_or(SessionError::Internal("No IKE SA rekey requested"))?;
            if proposals.len() != 1 {
                return Err(SessionError::UnacceptableProposal);
            }
            let (params, proposal) =
                crypto::choose_sa_parameters(&ctx.config.ike_proposals, proposals)
                    .ok_or(SessionError::UnacceptableProposal)?;
            if params.dh_group() != Some(pending.dh.group_number()) {
                return Err(SessionError::UnacceptableProposal);
            }
            let remote_spi = match proposal.spi {
                Spi::U64(spi) if spi != 0 => spi,
                _ => {
                    return Err(SessionError::Malformed(message::FormatError::Malformed(
                        "IKE SA proposal has no SPI",
                    )))
                }
            };
            let shared_secret = compute_shared_secret(&pending.dh, key_exchange)?;
            let skeyseed = keys::rekey_skeyseed(
                ike_prf(old_params)?,
                old_keys.sk_d(),
                &shared_secret,
                &pending.nonce_local,
                nonce_remote,
            )?;
            let keys = DerivedKeySet::derive(
                &params,
                &skeyseed,
                &pending.nonce_local,
                nonce_remote,
                pending.local_spi,
                remote_spi,
                ctx.config.sk_px,
            )?;
            let crypto_stack = keys.crypto_stack(&params, true)?;

            let mut rekeyed = IkeSaSession::new(
                SessionID::new(pending.local_spi, remote_spi),
                true,
                session.remote_addr,
            );
            rekeyed.nonce_initiator = pending.nonce_local.clone();
            rekeyed.nonce_responder = nonce_remote.to_vec();
            rekeyed.params = Some(params);
            rekeyed.keys = Some(keys);
            rekeyed.crypto_stack = Some(crypto_stack);
            rekeyed.remote_id = session.remote_id.clone();

            session.pending_rekey = None;
            adopt_child_sas(session, &mut rekeyed);
            rekeyed.set_established(ctx.now, ctx.config.ike_lifetime);
            info!("Session {} rekeyed as {}", session.id, rekeyed.id);
            session.rekeyed = Some(Box::new(rekeyed));
            session.queue_request_first(RequestContext::DeleteIke);
            Ok(())
        }
        _ => Err(SessionError::Internal("Unexpected CREATE_CHILD_SA response")),
    }
}

fn generate_informational(
    session: &mut IkeSaSession,
    _ctx: &ExchangeContext,
    outgoing: Outgoing,
) -> Result<Message, SessionError> {
    match outgoing {
        Outgoing::Request(context) => {
            let mut msg = Message::new(session.header(ExchangeType::INFORMATIONAL, false));
            match context {
                RequestContext::DeleteIke => {
                    msg.push_payload(Payload::Delete(Delete {
                        protocol_id: IPSecProtocolID::IKE,
                        spis: vec![],
                    }));
                    session.state = SessionState::SaDeleting;
                }
                RequestContext::DeleteChild(spis) => {
                    msg.push_payload(Payload::Delete(Delete {
                        protocol_id: IPSecProtocolID::ESP,
                        spis: spis.iter().map(|spi| Spi::U32(*spi)).collect(),
                    }));
                }
                RequestContext::Liveness => {}
                _ => {
                    return Err(SessionError::Internal(
                        "Unsupported INFORMATIONAL request",
                    ))
                }
            }
            Ok(msg)
        }
        Outgoing::Response => {
            let mut msg = Message::new(session.header(ExchangeType::INFORMATIONAL, true));
            match session.response_plan.take() {
                Some(ResponsePlan::Informational { deleted_spis }) => {
                    if !deleted_spis.is_empty() {
                        msg.push_payload(Payload::Delete(Delete {
                            protocol_id: IPSecProtocolID::ESP,
                            spis: deleted_spis.into_iter().map(Spi::U32).collect(),
                        }));
                    }
                }
                _ => {
                    return Err(SessionError::Internal(
                        "No INFORMATIONAL response prepared",
                    ))
                }
            }
            Ok(msg)
        }
    }
}

fn parse_informational(
    session: &mut IkeSaSession,
    _ctx: &ExchangeContext,
    msg: &ReceivedMessage,
) -> Result<(), SessionError> {
    check_direction(session, msg)?;
    if !session.state.is_established() && session.state != SessionState::SaDeleting {
        return Err(SessionError::ProtocolStateViolation("IKE SA is not established"));
    }
    let payloads = ExchangePayloads::collect(&msg.payloads)?;
    payloads
        .notifies
        .iter()
        .filter(|notify| notify.message_type.is_error())
        .for_each(|notify| warn!("Session {} peer reported {}", session.id, notify.message_type));

    if msg.is_response() {
        match session.outstanding_request() {
            Some(RequestContext::DeleteIke) => {
                info!("Session {} deleted by request", session.id);
                session.state = SessionState::SaDeleting;
            }
            Some(RequestContext::DeleteChild(spis)) => {
                for spi in spis.clone() {
                    if let Some(child) = session.remove_child_sa(spi) {
                        info!("Session {} deleted Child SA {}", session.id, child);
                    }
                }
                if session.state == SessionState::ChildSaEstablished && session.child_sas.is_empty()
                {
                    session.state = SessionState::IkeSaEstablished;
                }
            }
            Some(RequestContext::Liveness) => debug!("Session {} peer is alive", session.id),
            _ => {
                return Err(SessionError::Internal(
                    "Unexpected INFORMATIONAL response",
                ))
            }
        }
        return Ok(());
    }

    let delete_ike = payloads
        .deletes
        .iter()
        .any(|delete| delete.protocol_id == IPSecProtocolID::IKE);
    let deleted_spis = payloads
        .deletes
        .iter()
        .filter(|delete| delete.protocol_id != IPSecProtocolID::IKE)
        .flat_map(|delete| delete.spis.iter())
        .filter_map(|spi| match spi {
            Spi::U32(spi) => match session.child_sa_by_remote_spi(*spi) {
                Some(child) => Some(child.local_spi()),
                None => {
                    debug!("Session {} peer deletes unknown Child SA {:08x}", session.id, spi);
                    None
                }
            },
            _ => None,
        })
        .collect::<Vec<_>>();

    if delete_ike {
        info!("Session {} deleted by peer", session.id);
        session.state = SessionState::SaDeleting;
        session.response_plan = Some(ResponsePlan::Informational {
            deleted_spis: vec![],
        });
        return Ok(());
    }
    for spi in deleted_spis.iter() {
        if let Some(child) = session.remove_child_sa(*spi) {
            info!("Session {} peer deleted Child SA {}", session.id, child);
        }
    }
    if session.state == SessionState::ChildSaEstablished && session.child_sas.is_empty() {
        session.state = SessionState::IkeSaEstablished;
    }
    session.response_plan = Some(ResponsePlan::Informational { deleted_spis });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::engine::EngineConfig;
    use crate::ikev2::message::{Flags, InputMessage};
    use std::time::Duration;

    fn remote_addr() -> SocketAddr {
        "192.0.2.1:500".parse().unwrap()
    }

    fn sha1_modp2048_config() -> EngineConfig {
        let mut config = EngineConfig::new(
            Identification::fqdn("initiator.test"),
            Credentials::shared_key(b"secret"),
        );
        config.ike_proposals = vec![Proposal {
            num: 1,
            protocol_id: IPSecProtocolID::IKE,
            spi: Spi::None,
            transforms: vec![
                Transform::new(TransformType::ENCR_AES_CBC, Some(128)),
                Transform::new(TransformType::PRF_HMAC_SHA1, None),
                Transform::new(TransformType::AUTH_HMAC_SHA1_96, None),
                Transform::new(TransformType::DH_2048_MODP, None),
            ],
        }];
        config
    }

    fn context(config: &EngineConfig) -> ExchangeContext {
        ExchangeContext {
            config,
            reserved_spi: Some(0x0102030405060708),
            initial_contact: true,
            now: Instant::now(),
        }
    }

    fn received<'a>(msg: &Message, raw: &'a [u8]) -> ReceivedMessage<'a> {
        ReceivedMessage {
            header: *msg.header(),
            raw,
            payloads: msg.payloads().to_vec(),
        }
    }

    fn initiator_session() -> IkeSaSession {
        IkeSaSession::new_initiator(
            0x1122334455667788,
            remote_addr(),
            Instant::now(),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn sa_init_request_layout() {
        let config = sha1_modp2048_config();
        let ctx = context(&config);
        let mut session = initiator_session();
        let generator = handlers(AuthMethod::SharedKey, Phase::Init).generator;
        let msg = generator(&mut session, &ctx, Outgoing::Request(&RequestContext::SaInit)).unwrap();

        let data = msg.to_bytes().unwrap();
        let input = InputMessage::from_datagram(&data).unwrap();
        assert_eq!(input.read_exchange_type(), ExchangeType::IKE_SA_INIT);
        assert_eq!(input.read_flags(), Flags::INITIATOR);
        assert_eq!(input.read_initiator_spi(), 0x1122334455667788);
        assert_eq!(input.read_responder_spi(), 0);
        assert_eq!(input.read_message_id(), 0);
        let payloads = input.payloads().unwrap();
        let types = payloads
            .iter()
            .map(|payload| payload.payload_type())
            .collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![
                PayloadType::SECURITY_ASSOCIATION,
                PayloadType::KEY_EXCHANGE,
                PayloadType::NONCE
            ]
        );
        match payloads[1].payload {
            Payload::KeyExchange(ref key_exchange) => {
                assert_eq!(key_exchange.group, 14);
                assert_eq!(key_exchange.value.len(), 256);
            }
            _ => panic!("Expected KE payload"),
        }
    }

    #[test]
    fn cookie_resend_keeps_parameters() {
        let config = sha1_modp2048_config();
        let ctx = context(&config);
        let mut session = initiator_session();
        assert_eq!(session.next_queued_request(), Some(RequestContext::SaInit));
        let sa_init = handlers(AuthMethod::SharedKey, Phase::Init);
        let first =
            (sa_init.generator)(&mut session, &ctx, Outgoing::Request(&RequestContext::SaInit))
                .unwrap();
        let request = first.to_bytes().unwrap();
        session.start_request(
            RequestContext::SaInit,
            Arc::new(super::super::session::SentMessage::new(
                0,
                ExchangeType::IKE_SA_INIT,
                request,
            )),
            ctx.now,
            Duration::from_secs(1),
        );

        let cookie = vec![0xc0u8; 32];
        let response = sa_init_notify_response(
            first.header(),
            Notify::new(NotifyMessageType::COOKIE, &cookie),
        );
        let raw = response.to_bytes().unwrap();
        (sa_init.parser)(&mut session, &ctx, &received(&response, &raw)).unwrap();
        assert_eq!(session.state(), SessionState::Init);
        session.complete_request();
        assert_eq!(session.local_message_id(), 0);
        assert_eq!(session.next_queued_request(), Some(RequestContext::SaInit));

        let second =
            (sa_init.generator)(&mut session, &ctx, Outgoing::Request(&RequestContext::SaInit))
                .unwrap();
        assert_eq!(second.payloads().len(), 4);
        assert_eq!(
            second.payloads()[0].payload,
            Payload::Notify(Notify::new(NotifyMessageType::COOKIE, &cookie))
        );
        assert_eq!(&second.payloads()[1..], first.payloads());
        assert_eq!(second.header().message_id, 0);
    }

    #[test]
    fn missing_payload_leaves_state_unchanged() {
        let config = sha1_modp2048_config();
        let ctx = context(&config);
        let mut session = initiator_session();
        let sa_init = handlers(AuthMethod::SharedKey, Phase::Init);
        let request =
            (sa_init.generator)(&mut session, &ctx, Outgoing::Request(&RequestContext::SaInit))
                .unwrap();

        let header = IkeHeader::new(
            0x1122334455667788,
            0x8877665544332211,
            ExchangeType::IKE_SA_INIT,
            Flags::new(false, true),
            0,
        );
        let mut response = Message::new(header);
        response.push_payload(request.payloads()[0].payload.clone());
        response.push_payload(Payload::Nonce(vec![7u8; 32]));
        let raw = response.to_bytes().unwrap();
        let result = (sa_init.parser)(&mut session, &ctx, &received(&response, &raw));
        assert!(matches!(
            result,
            Err(SessionError::MissingPayload(PayloadType::KEY_EXCHANGE))
        ));
        assert_eq!(session.state(), SessionState::Init);
        assert_eq!(session.id().responder_spi(), 0);
        assert!(session.keys().is_none());
    }

    #[test]
    fn responder_rejects_wrong_key_exchange_group() {
        let config = sha1_modp2048_config();
        let ctx = context(&config);
        let mut session = IkeSaSession::new_responder(
            SessionID::new(0x1122334455667788, 0x99),
            remote_addr(),
            ctx.now,
            Duration::from_secs(30),
        );
        let header = IkeHeader::new(
            0x1122334455667788,
            0,
            ExchangeType::IKE_SA_INIT,
            Flags::new(true, false),
            0,
        );
        let mut request = Message::new(header);
        request.push_payload(Payload::SecurityAssociation(config.ike_proposals.clone()));
        request.push_payload(Payload::KeyExchange(KeyExchange {
            group: 19,
            value: vec![4u8; 64],
        }));
        request.push_payload(Payload::Nonce(vec![1u8; 32]));
        let raw = request.to_bytes().unwrap();

        let parser = handlers(AuthMethod::SharedKey, Phase::Init).parser;
        let err = parser(&mut session, &ctx, &received(&request, &raw)).unwrap_err();
        assert!(matches!(err, SessionError::InvalidKeyExchange(14)));
        let notify = err.notify().unwrap();
        assert_eq!(notify.message_type, NotifyMessageType::INVALID_KE_PAYLOAD);
        assert_eq!(notify.data, vec![0, 14]);
        assert_eq!(session.state(), SessionState::Init);
    }

    #[test]
    fn critical_unknown_payload_is_rejected() {
        let config = sha1_modp2048_config();
        let ctx = context(&config);
        let mut session = IkeSaSession::new_responder(
            SessionID::new(1, 2),
            remote_addr(),
            ctx.now,
            Duration::from_secs(30),
        );
        let header = IkeHeader::new(1, 0, ExchangeType::IKE_SA_INIT, Flags::new(true, false), 0);
        let mut request = Message::new(header);
        request.push_critical_payload(Payload::Unknown(PayloadType::from_u8(200), vec![1, 2]));
        let raw = request.to_bytes().unwrap();
        let parser = handlers(AuthMethod::SharedKey, Phase::Init).parser;
        let err = parser(&mut session, &ctx, &received(&request, &raw)).unwrap_err();
        let notify = err.notify().unwrap();
        assert_eq!(
            notify.message_type,
            NotifyMessageType::UNSUPPORTED_CRITICAL_PAYLOAD
        );
        assert_eq!(notify.data, vec![200]);
    }

    #[test]
    fn responder_cookie_depends_on_inputs() {
        let secret = [9u8; 32];
        let addr = remote_addr();
        let cookie = responder_cookie(&secret, &[1u8; 32], &addr, 5).unwrap();
        assert_eq!(cookie.len(), 32);
        assert_eq!(cookie, responder_cookie(&secret, &[1u8; 32], &addr, 5).unwrap());
        assert_ne!(cookie, responder_cookie(&secret, &[1u8; 32], &addr, 6).unwrap());
        let other: SocketAddr = "192.0.2.2:500".parse().unwrap();
        assert_ne!(cookie, responder_cookie(&secret, &[1u8; 32], &other, 5).unwrap());
    }

    #[test]
    fn psk_auth_matches_prf_construction() {
        let params = SaParams {
            protocol_id: IPSecProtocolID::IKE,
            enc: Some(Transform::new(TransformType::ENCR_AES_CBC, Some(128))),
            prf: Some(TransformType::PRF_HMAC_SHA2_256),
            integ: Some(TransformType::AUTH_HMAC_SHA2_256_128),
            dh: Some(TransformType::DH_256_ECP),
            esn: None,
        };
        let octets = b"signed octets";
        let auth = psk_prf(&params, b"secret").unwrap().prf(octets);
        let pad_key = PseudorandomTransform::init(TransformType::PRF_HMAC_SHA2_256, b"secret")
            .unwrap()
            .prf(b"Key Pad for IKEv2");
        let expected = PseudorandomTransform::init(TransformType::PRF_HMAC_SHA2_256, &pad_key)
            .unwrap()
            .prf(octets);
        assert_eq!(auth, expected);
        assert!(psk_prf(&params, b"secret").unwrap().verify(octets, &expected));
        assert!(!psk_prf(&params, b"other").unwrap().verify(octets, &expected));
    }

    #[test]
    fn proposal_helpers() {
        let config = EngineConfig::new(
            Identification::fqdn("test"),
            Credentials::shared_key(b"secret"),
        );
        let esp = child_proposals(&config.esp_proposals, 0x1000, None);
        assert!(esp.iter().all(|proposal| proposal.spi == Spi::U32(0x1000)));
        assert!(esp
            .iter()
            .flat_map(|proposal| proposal.transforms.iter())
            .all(|t| t.transform_type.transform_type() != TransformType::DIFFIE_HELLMAN));
        let esp = child_proposals(&config.esp_proposals, 0x1000, Some(19));
        assert!(esp.iter().all(|proposal| proposal
            .transforms
            .contains(&Transform::new(TransformType::DH_256_ECP, None))));

        assert_eq!(first_dh_group(&config.ike_proposals), Some(14));
        assert!(offers_dh_group(&config.ike_proposals, 14));
        assert!(!offers_dh_group(&config.ike_proposals, 5));
        assert!(restrict_dh(&config.ike_proposals, 2).is_empty());
    }
}
