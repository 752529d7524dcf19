use std::{
    error, fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    ops::RangeInclusive,
};

use log::debug;

pub const IKE_HEADER_LENGTH: usize = 28;
const PAYLOAD_HEADER_LENGTH: usize = 4;
const IKE_VERSION: u8 = 0x20;

const MIN_NONCE_LENGTH: usize = 16;
const MAX_NONCE_LENGTH: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeType(u8);

impl ExchangeType {
    pub const IKE_SA_INIT: ExchangeType = ExchangeType(34);
    pub const IKE_AUTH: ExchangeType = ExchangeType(35);
    pub const CREATE_CHILD_SA: ExchangeType = ExchangeType(36);
    pub const INFORMATIONAL: ExchangeType = ExchangeType(37);

    pub fn from_u8(value: u8) -> Result<ExchangeType, FormatError> {
        if value >= Self::IKE_SA_INIT.0 && value <= Self::INFORMATIONAL.0 {
            Ok(ExchangeType(value))
        } else {
            debug!("Unsupported IKEv2 Exchange Type {}", value);
            Err("Unsupported IKEv2 Exchange Type".into())
        }
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IKE_SA_INIT => write!(f, "IKE_SA_INIT")?,
            Self::IKE_AUTH => write!(f, "IKE_AUTH")?,
            Self::CREATE_CHILD_SA => write!(f, "CREATE_CHILD_SA")?,
            Self::INFORMATIONAL => write!(f, "INFORMATIONAL")?,
            _ => write!(f, "Unknown exchange type {}", self.0)?,
        }
        Ok(())
    }
}

impl fmt::Debug for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const INITIATOR: Flags = Flags(1 << 3);
    pub const VERSION: Flags = Flags(1 << 4);
    pub const RESPONSE: Flags = Flags(1 << 5);

    pub fn from_u8(value: u8) -> Result<Flags, FormatError> {
        const RESERVED_MASK: u8 =
            0xff & !Flags::INITIATOR.0 & !Flags::VERSION.0 & !Flags::RESPONSE.0;
        if value & RESERVED_MASK != 0x00 {
            debug!("IKEv2 reserved flags are set {}", value & RESERVED_MASK);
            return Err("IKEv2 reserved flags are set".into());
        }
        Ok(Flags(value))
    }

    pub fn new(initiator: bool, response: bool) -> Flags {
        let mut flags = 0;
        if initiator {
            flags |= Flags::INITIATOR.0;
        }
        if response {
            flags |= Flags::RESPONSE.0;
        }
        Flags(flags)
    }

    pub fn has(&self, flag: Flags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has(Flags::INITIATOR) {
            f.write_str("Initiator ")?;
        }
        if self.has(Flags::VERSION) {
            f.write_str("Version ")?;
        }
        if self.has(Flags::RESPONSE) {
            f.write_str("Response")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x} ({})", self.0, self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IkeHeader {
    pub initiator_spi: u64,
    pub responder_spi: u64,
    pub next_payload: PayloadType,
    pub exchange_type: ExchangeType,
    pub flags: Flags,
    pub message_id: u32,
    pub length: u32,
}

// Parse and validate as described in RFC 7296, Section 3.1.
impl IkeHeader {
    pub fn new(
        initiator_spi: u64,
        responder_spi: u64,
        exchange_type: ExchangeType,
        flags: Flags,
        message_id: u32,
    ) -> IkeHeader {
        IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload: PayloadType::NONE,
            exchange_type,
            flags,
            message_id,
            length: IKE_HEADER_LENGTH as u32,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<IkeHeader, FormatError> {
        if data.len() < IKE_HEADER_LENGTH {
            debug!("Not enough data in message");
            return Err(FormatError::ShortPacket);
        }
        let version = data[17];
        let major_version = version >> 4 & 0x0f;
        if major_version != 2 {
            debug!(
                "Unsupported major version {}.{}",
                major_version,
                version & 0x0f
            );
            return Err("Unsupported major version".into());
        }
        Ok(IkeHeader {
            initiator_spi: read_u64(&data[0..8]),
            responder_spi: read_u64(&data[8..16]),
            next_payload: PayloadType::from_u8(data[16]),
            exchange_type: ExchangeType::from_u8(data[18])?,
            flags: Flags::from_u8(data[19])?,
            message_id: read_u32(&data[20..24]),
            length: read_u32(&data[24..28]),
        })
    }

    pub fn to_bytes(&self) -> [u8; IKE_HEADER_LENGTH] {
        let mut dest = [0u8; IKE_HEADER_LENGTH];
        dest[0..8].copy_from_slice(&self.initiator_spi.to_be_bytes());
        dest[8..16].copy_from_slice(&self.responder_spi.to_be_bytes());
        dest[16] = self.next_payload.type_id();
        dest[17] = IKE_VERSION;
        dest[18] = self.exchange_type.type_id();
        dest[19] = self.flags.bits();
        dest[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        dest[24..28].copy_from_slice(&self.length.to_be_bytes());
        dest
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadType(u8);

impl PayloadType {
    pub const NONE: PayloadType = PayloadType(0);
    pub const SECURITY_ASSOCIATION: PayloadType = PayloadType(33);
    pub const KEY_EXCHANGE: PayloadType = PayloadType(34);
    pub const ID_INITIATOR: PayloadType = PayloadType(35);
    pub const ID_RESPONDER: PayloadType = PayloadType(36);
    pub const CERTIFICATE: PayloadType = PayloadType(37);
    pub const CERTIFICATE_REQUEST: PayloadType = PayloadType(38);
    pub const AUTHENTICATION: PayloadType = PayloadType(39);
    pub const NONCE: PayloadType = PayloadType(40);
    pub const NOTIFY: PayloadType = PayloadType(41);
    pub const DELETE: PayloadType = PayloadType(42);
    pub const VENDOR_ID: PayloadType = PayloadType(43);
    pub const TRAFFIC_SELECTOR_INITIATOR: PayloadType = PayloadType(44);
    pub const TRAFFIC_SELECTOR_RESPONDER: PayloadType = PayloadType(45);
    pub const ENCRYPTED_AND_AUTHENTICATED: PayloadType = PayloadType(46);
    pub const CONFIGURATION: PayloadType = PayloadType(47);
    pub const EXTENSIBLE_AUTHENTICATION: PayloadType = PayloadType(48);

    pub fn from_u8(value: u8) -> PayloadType {
        PayloadType(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "No Next Payload")?,
            Self::SECURITY_ASSOCIATION => write!(f, "Security Association")?,
            Self::KEY_EXCHANGE => write!(f, "Key Exchange")?,
            Self::ID_INITIATOR => write!(f, "Identification - Initiator")?,
            Self::ID_RESPONDER => write!(f, "Identification - Responder")?,
            Self::CERTIFICATE => write!(f, "Certificate")?,
            Self::CERTIFICATE_REQUEST => write!(f, "Certificate Request")?,
            Self::AUTHENTICATION => write!(f, "Authentication")?,
            Self::NONCE => write!(f, "Nonce")?,
            Self::NOTIFY => write!(f, "Notify")?,
            Self::DELETE => write!(f, "Delete")?,
            Self::VENDOR_ID => write!(f, "Vendor ID")?,
            Self::TRAFFIC_SELECTOR_INITIATOR => write!(f, "Traffic Selector - Initiator")?,
            Self::TRAFFIC_SELECTOR_RESPONDER => write!(f, "Traffic Selector - Responder")?,
            Self::ENCRYPTED_AND_AUTHENTICATED => write!(f, "Encrypted and Authenticated")?,
            Self::CONFIGURATION => write!(f, "Configuration")?,
            Self::EXTENSIBLE_AUTHENTICATION => write!(f, "Extensible Authentication")?,
            _ => write!(f, "Unknown payload type {}", self.0)?,
        }
        Ok(())
    }
}

impl fmt::Debug for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IPSecProtocolID(u8);

impl IPSecProtocolID {
    pub const IKE: IPSecProtocolID = IPSecProtocolID(1);
    pub const AH: IPSecProtocolID = IPSecProtocolID(2);
    pub const ESP: IPSecProtocolID = IPSecProtocolID(3);

    pub fn from_u8(value: u8) -> IPSecProtocolID {
        IPSecProtocolID(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for IPSecProtocolID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IKE => write!(f, "IKE")?,
            Self::AH => write!(f, "AH")?,
            Self::ESP => write!(f, "ESP")?,
            _ => write!(f, "Unknown IPSec Protocol ID {}", self.0)?,
        }
        Ok(())
    }
}

impl fmt::Debug for IPSecProtocolID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Spi {
    None,
    U32(u32),
    U64(u64),
}

impl Spi {
    pub fn from_slice(spi: &[u8]) -> Result<Spi, FormatError> {
        match spi.len() {
            0 => Ok(Self::None),
            4 => Ok(Self::U32(read_u32(spi))),
            8 => Ok(Self::U64(read_u64(spi))),
            _ => {
                debug!("Unexpected SPI size {}", spi.len());
                Err("Unexpected SPI size".into())
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::U32(_) => 4,
            Self::U64(_) => 8,
        }
    }

    fn write_to(&self, dest: &mut Vec<u8>) {
        match self {
            Self::None => {}
            Self::U32(spi) => dest.extend_from_slice(&spi.to_be_bytes()),
            Self::U64(spi) => dest.extend_from_slice(&spi.to_be_bytes()),
        }
    }
}

impl fmt::Display for Spi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::U32(spi) => write!(f, "{spi:08x}"),
            Self::U64(spi) => write!(f, "{spi:016x}"),
        }
    }
}

impl fmt::Debug for Spi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            _ => fmt::Display::fmt(self, f),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformType(u8, u16);

// See http://www.iana.org/assignments/ikev2-parameters/ for additional values.
impl TransformType {
    pub const ENCRYPTION: u8 = 1;
    pub const PSEUDORANDOM: u8 = 2;
    pub const INTEGRITY: u8 = 3;
    pub const DIFFIE_HELLMAN: u8 = 4;
    pub const EXTENDED_SEQUENCE_NUMBERS: u8 = 5;

    pub const ENCR_3DES: TransformType = TransformType(1, 3);
    pub const ENCR_NULL: TransformType = TransformType(1, 11);
    pub const ENCR_AES_CBC: TransformType = TransformType(1, 12);
    pub const ENCR_AES_CTR: TransformType = TransformType(1, 13);
    pub const ENCR_AES_GCM_16: TransformType = TransformType(1, 20);

    pub const PRF_HMAC_MD5: TransformType = TransformType(2, 1);
    pub const PRF_HMAC_SHA1: TransformType = TransformType(2, 2);
    pub const PRF_HMAC_SHA2_256: TransformType = TransformType(2, 5);
    pub const PRF_HMAC_SHA2_384: TransformType = TransformType(2, 6);

    pub const AUTH_NONE: TransformType = TransformType(3, 0);
    pub const AUTH_HMAC_MD5_96: TransformType = TransformType(3, 1);
    pub const AUTH_HMAC_SHA1_96: TransformType = TransformType(3, 2);
    pub const AUTH_AES_XCBC_96: TransformType = TransformType(3, 5);
    pub const AUTH_HMAC_SHA2_256_128: TransformType = TransformType(3, 12);
    pub const AUTH_HMAC_SHA2_384_192: TransformType = TransformType(3, 13);

    pub const DH_NONE: TransformType = TransformType(4, 0);
    pub const DH_1024_MODP: TransformType = TransformType(4, 2);
    pub const DH_1536_MODP: TransformType = TransformType(4, 5);
    pub const DH_2048_MODP: TransformType = TransformType(4, 14);
    pub const DH_256_ECP: TransformType = TransformType(4, 19);

    pub const NO_ESN: TransformType = TransformType(5, 0);
    pub const ESN: TransformType = TransformType(5, 1);

    pub fn from_raw(transform_type: u8, transform_id: u16) -> TransformType {
        TransformType(transform_type, transform_id)
    }

    pub fn type_id(&self) -> (u8, u16) {
        (self.0, self.1)
    }

    pub fn transform_type(&self) -> u8 {
        self.0
    }

    pub fn dh_group(group: u16) -> TransformType {
        TransformType(Self::DIFFIE_HELLMAN, group)
    }
}

impl fmt::Display for TransformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ENCR_3DES => write!(f, "ENCR_3DES")?,
            Self::ENCR_NULL => write!(f, "ENCR_NULL")?,
            Self::ENCR_AES_CBC => write!(f, "ENCR_AES_CBC")?,
            Self::ENCR_AES_CTR => write!(f, "ENCR_AES_CTR")?,
            Self::ENCR_AES_GCM_16 => write!(f, "ENCR_AES_GCM_16")?,
            Self::PRF_HMAC_MD5 => write!(f, "PRF_HMAC_MD5")?,
            Self::PRF_HMAC_SHA1 => write!(f, "PRF_HMAC_SHA1")?,
            Self::PRF_HMAC_SHA2_256 => write!(f, "PRF_HMAC_SHA2_256")?,
            Self::PRF_HMAC_SHA2_384 => write!(f, "PRF_HMAC_SHA2_384")?,
            Self::AUTH_NONE => write!(f, "AUTH_NONE")?,
            Self::AUTH_HMAC_MD5_96 => write!(f, "AUTH_HMAC_MD5_96")?,
            Self::AUTH_HMAC_SHA1_96 => write!(f, "AUTH_HMAC_SHA1_96")?,
            Self::AUTH_AES_XCBC_96 => write!(f, "AUTH_AES_XCBC_96")?,
            Self::AUTH_HMAC_SHA2_256_128 => write!(f, "AUTH_HMAC_SHA2_256_128")?,
            Self::AUTH_HMAC_SHA2_384_192 => write!(f, "AUTH_HMAC_SHA2_384_192")?,
            Self::DH_NONE => write!(f, "DH_NONE")?,
            Self::DH_1024_MODP => write!(f, "DH_1024_MODP")?,
            Self::DH_1536_MODP => write!(f, "DH_1536_MODP")?,
            Self::DH_2048_MODP => write!(f, "DH_2048_MODP")?,
            Self::DH_256_ECP => write!(f, "DH_256_ECP")?,
            Self::NO_ESN => write!(f, "NO_ESN")?,
            Self::ESN => write!(f, "ESN")?,
            _ => write!(f, "Unknown transform type {} id {}", self.0, self.1)?,
        }
        Ok(())
    }
}

impl fmt::Debug for TransformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TransformAttributeType(u16);

impl TransformAttributeType {
    pub const KEY_LENGTH: TransformAttributeType = TransformAttributeType(14);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transform {
    pub transform_type: TransformType,
    pub key_length: Option<u16>,
    // Set when the peer sent an attribute this codec does not know.
    pub unknown_attributes: bool,
}

impl Transform {
    pub fn new(transform_type: TransformType, key_length: Option<u16>) -> Transform {
        Transform {
            transform_type,
            key_length,
            unknown_attributes: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub num: u8,
    pub protocol_id: IPSecProtocolID,
    pub spi: Spi,
    pub transforms: Vec<Transform>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NotifyMessageType(u16);

impl NotifyMessageType {
    pub const UNSUPPORTED_CRITICAL_PAYLOAD: NotifyMessageType = NotifyMessageType(1);
    pub const INVALID_IKE_SPI: NotifyMessageType = NotifyMessageType(4);
    pub const INVALID_MAJOR_VERSION: NotifyMessageType = NotifyMessageType(5);
    pub const INVALID_SYNTAX: NotifyMessageType = NotifyMessageType(7);
    pub const INVALID_MESSAGE_ID: NotifyMessageType = NotifyMessageType(9);
    pub const INVALID_SPI: NotifyMessageType = NotifyMessageType(11);
    pub const NO_PROPOSAL_CHOSEN: NotifyMessageType = NotifyMessageType(14);
    pub const INVALID_KE_PAYLOAD: NotifyMessageType = NotifyMessageType(17);
    pub const AUTHENTICATION_FAILED: NotifyMessageType = NotifyMessageType(24);
    pub const SINGLE_PAIR_REQUIRED: NotifyMessageType = NotifyMessageType(34);
    pub const NO_ADDITIONAL_SAS: NotifyMessageType = NotifyMessageType(35);
    pub const INTERNAL_ADDRESS_FAILURE: NotifyMessageType = NotifyMessageType(36);
    pub const FAILED_CP_REQUIRED: NotifyMessageType = NotifyMessageType(37);
    pub const TS_UNACCEPTABLE: NotifyMessageType = NotifyMessageType(38);
    pub const INVALID_SELECTORS: NotifyMessageType = NotifyMessageType(39);
    pub const TEMPORARY_FAILURE: NotifyMessageType = NotifyMessageType(43);
    pub const CHILD_SA_NOT_FOUND: NotifyMessageType = NotifyMessageType(44);

    pub const INITIAL_CONTACT: NotifyMessageType = NotifyMessageType(16384);
    pub const SET_WINDOW_SIZE: NotifyMessageType = NotifyMessageType(16385);
    pub const ADDITIONAL_TS_POSSIBLE: NotifyMessageType = NotifyMessageType(16386);
    pub const IPCOMP_SUPPORTED: NotifyMessageType = NotifyMessageType(16387);
    pub const NAT_DETECTION_SOURCE_IP: NotifyMessageType = NotifyMessageType(16388);
    pub const NAT_DETECTION_DESTINATION_IP: NotifyMessageType = NotifyMessageType(16389);
    pub const COOKIE: NotifyMessageType = NotifyMessageType(16390);
    pub const USE_TRANSPORT_MODE: NotifyMessageType = NotifyMessageType(16391);
    pub const REKEY_SA: NotifyMessageType = NotifyMessageType(16393);
    pub const ESP_TFC_PADDING_NOT_SUPPORTED: NotifyMessageType = NotifyMessageType(16394);
    pub const NON_FIRST_FRAGMENTS_ALSO: NotifyMessageType = NotifyMessageType(16395);

    pub fn from_u16(value: u16) -> NotifyMessageType {
        NotifyMessageType(value)
    }

    pub fn type_id(&self) -> u16 {
        self.0
    }

    // Types below 16384 report errors, RFC 7296 Section 3.10.1.
    pub fn is_error(&self) -> bool {
        self.0 < 16384
    }
}

impl fmt::Display for NotifyMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNSUPPORTED_CRITICAL_PAYLOAD => write!(f, "UNSUPPORTED_CRITICAL_PAYLOAD")?,
            Self::INVALID_IKE_SPI => write!(f, "INVALID_IKE_SPI")?,
            Self::INVALID_MAJOR_VERSION => write!(f, "INVALID_MAJOR_VERSION")?,
            Self::INVALID_SYNTAX => write!(f, "INVALID_SYNTAX")?,
            Self::INVALID_MESSAGE_ID => write!(f, "INVALID_MESSAGE_ID")?,
            Self::INVALID_SPI => write!(f, "INVALID_SPI")?,
            Self::NO_PROPOSAL_CHOSEN => write!(f, "NO_PROPOSAL_CHOSEN")?,
            Self::INVALID_KE_PAYLOAD => write!(f, "INVALID_KE_PAYLOAD")?,
            Self::AUTHENTICATION_FAILED => write!(f, "AUTHENTICATION_FAILED")?,
            Self::SINGLE_PAIR_REQUIRED => write!(f, "SINGLE_PAIR_REQUIRED")?,
            Self::NO_ADDITIONAL_SAS => write!(f, "NO_ADDITIONAL_SAS")?,
            Self::INTERNAL_ADDRESS_FAILURE => write!(f, "INTERNAL_ADDRESS_FAILURE")?,
            Self::FAILED_CP_REQUIRED => write!(f, "FAILED_CP_REQUIRED")?,
            Self::TS_UNACCEPTABLE => write!(f, "TS_UNACCEPTABLE")?,
            Self::INVALID_SELECTORS => write!(f, "INVALID_SELECTORS")?,
            Self::TEMPORARY_FAILURE => write!(f, "TEMPORARY_FAILURE")?,
            Self::CHILD_SA_NOT_FOUND => write!(f, "CHILD_SA_NOT_FOUND")?,
            Self::INITIAL_CONTACT => write!(f, "INITIAL_CONTACT")?,
            Self::SET_WINDOW_SIZE => write!(f, "SET_WINDOW_SIZE")?,
            Self::ADDITIONAL_TS_POSSIBLE => write!(f, "ADDITIONAL_TS_POSSIBLE")?,
            Self::IPCOMP_SUPPORTED => write!(f, "IPCOMP_SUPPORTED")?,
            Self::NAT_DETECTION_SOURCE_IP => write!(f, "NAT_DETECTION_SOURCE_IP")?,
            Self::NAT_DETECTION_DESTINATION_IP => write!(f, "NAT_DETECTION_DESTINATION_IP")?,
            Self::COOKIE => write!(f, "COOKIE")?,
            Self::USE_TRANSPORT_MODE => write!(f, "USE_TRANSPORT_MODE")?,
            Self::REKEY_SA => write!(f, "REKEY_SA")?,
            Self::ESP_TFC_PADDING_NOT_SUPPORTED => write!(f, "ESP_TFC_PADDING_NOT_SUPPORTED")?,
            Self::NON_FIRST_FRAGMENTS_ALSO => write!(f, "NON_FIRST_FRAGMENTS_ALSO")?,
            _ => write!(f, "Unknown Notify Message Type {}", self.0)?,
        }
        Ok(())
    }
}

impl fmt::Debug for NotifyMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AuthMethod(u8);

impl AuthMethod {
    pub const RSA_DIGITAL_SIGNATURE: AuthMethod = AuthMethod(1);
    pub const SHARED_KEY_MESSAGE_INTEGRITY_CODE: AuthMethod = AuthMethod(2);
    pub const DSS_DIGITAL_SIGNATURE: AuthMethod = AuthMethod(3);
    pub const ECDSA_SHA256_P256: AuthMethod = AuthMethod(9);
    pub const DIGITAL_SIGNATURE: AuthMethod = AuthMethod(14);

    pub fn from_u8(value: u8) -> AuthMethod {
        AuthMethod(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::RSA_DIGITAL_SIGNATURE => write!(f, "RSA Digital Signature")?,
            Self::SHARED_KEY_MESSAGE_INTEGRITY_CODE => {
                write!(f, "Shared Key Message Integrity Code")?
            }
            Self::DSS_DIGITAL_SIGNATURE => write!(f, "DSS Digital Signature")?,
            Self::ECDSA_SHA256_P256 => write!(f, "ECDSA with SHA-256 on the P-256 curve")?,
            Self::DIGITAL_SIGNATURE => write!(f, "Digital Signature")?,
            _ => write!(f, "Unknown authentication method {}", self.0)?,
        }
        Ok(())
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdentificationType(u8);

impl IdentificationType {
    pub const ID_IPV4_ADDR: IdentificationType = IdentificationType(1);
    pub const ID_FQDN: IdentificationType = IdentificationType(2);
    pub const ID_RFC822_ADDR: IdentificationType = IdentificationType(3);
    pub const ID_IPV6_ADDR: IdentificationType = IdentificationType(5);
    pub const ID_DER_ASN1_DN: IdentificationType = IdentificationType(9);
    pub const ID_DER_ASN1_GN: IdentificationType = IdentificationType(10);
    pub const ID_KEY_ID: IdentificationType = IdentificationType(11);

    pub fn from_u8(value: u8) -> IdentificationType {
        IdentificationType(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for IdentificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ID_IPV4_ADDR => write!(f, "ID_IPV4_ADDR")?,
            Self::ID_FQDN => write!(f, "ID_FQDN")?,
            Self::ID_RFC822_ADDR => write!(f, "ID_RFC822_ADDR")?,
            Self::ID_IPV6_ADDR => write!(f, "ID_IPV6_ADDR")?,
            Self::ID_DER_ASN1_DN => write!(f, "ID_DER_ASN1_DN")?,
            Self::ID_DER_ASN1_GN => write!(f, "ID_DER_ASN1_GN")?,
            Self::ID_KEY_ID => write!(f, "ID_KEY_ID")?,
            _ => write!(f, "Unknown ID type {}", self.0)?,
        }
        Ok(())
    }
}

impl fmt::Debug for IdentificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identification {
    pub id_type: IdentificationType,
    pub data: Vec<u8>,
}

impl Identification {
    pub fn fqdn(hostname: &str) -> Identification {
        Identification {
            id_type: IdentificationType::ID_FQDN,
            data: hostname.as_bytes().to_vec(),
        }
    }

    // The body of the ID payload (type, reserved bytes and data) is signed in AUTH.
    pub fn raw_value(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(4 + self.data.len());
        raw.extend_from_slice(&[self.id_type.type_id(), 0, 0, 0]);
        raw.extend_from_slice(&self.data);
        raw
    }
}

impl fmt::Display for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id_type {
            IdentificationType::ID_FQDN | IdentificationType::ID_RFC822_ADDR => {
                write!(f, "{}", String::from_utf8_lossy(&self.data))
            }
            IdentificationType::ID_IPV4_ADDR if self.data.len() == 4 => {
                let mut addr = [0u8; 4];
                addr.copy_from_slice(&self.data);
                write!(f, "{}", Ipv4Addr::from(addr))
            }
            IdentificationType::ID_IPV6_ADDR if self.data.len() == 16 => {
                let mut addr = [0u8; 16];
                addr.copy_from_slice(&self.data);
                write!(f, "{}", Ipv6Addr::from(addr))
            }
            _ => write!(f, "{} {:?}", self.id_type, self.data),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CertificateEncoding(u8);

impl CertificateEncoding {
    pub const X509_SIGNATURE: CertificateEncoding = CertificateEncoding(4);

    pub fn from_u8(value: u8) -> CertificateEncoding {
        CertificateEncoding(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for CertificateEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::X509_SIGNATURE => write!(f, "X.509 Certificate - Signature"),
            _ => write!(f, "Unknown certificate encoding {}", self.0),
        }
    }
}

impl fmt::Debug for CertificateEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    pub encoding: CertificateEncoding,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyExchange {
    pub group: u16,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authentication {
    pub method: AuthMethod,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notify {
    pub protocol_id: Option<IPSecProtocolID>,
    pub spi: Spi,
    pub message_type: NotifyMessageType,
    pub data: Vec<u8>,
}

impl Notify {
    pub fn new(message_type: NotifyMessageType, data: &[u8]) -> Notify {
        Notify {
            protocol_id: None,
            spi: Spi::None,
            message_type,
            data: data.to_vec(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delete {
    pub protocol_id: IPSecProtocolID,
    pub spis: Vec<Spi>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TrafficSelectorType(u8);

impl TrafficSelectorType {
    pub const TS_IPV4_ADDR_RANGE: TrafficSelectorType = TrafficSelectorType(7);
    pub const TS_IPV6_ADDR_RANGE: TrafficSelectorType = TrafficSelectorType(8);

    fn from_u8(value: u8) -> Result<TrafficSelectorType, FormatError> {
        if value == Self::TS_IPV4_ADDR_RANGE.0 || value == Self::TS_IPV6_ADDR_RANGE.0 {
            Ok(TrafficSelectorType(value))
        } else {
            debug!("Unsupported traffic selector type {}", value);
            Err("Unsupported traffic selector type".into())
        }
    }
}

impl fmt::Display for TrafficSelectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TS_IPV4_ADDR_RANGE => write!(f, "TS_IPV4_ADDR_RANGE"),
            Self::TS_IPV6_ADDR_RANGE => write!(f, "TS_IPV6_ADDR_RANGE"),
            _ => write!(f, "Unknown traffic selector type {}", self.0),
        }
    }
}

impl fmt::Debug for TrafficSelectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IPProtocolType(u8);

impl IPProtocolType {
    pub const ANY: IPProtocolType = IPProtocolType(0);
    pub const ICMP: IPProtocolType = IPProtocolType(1);
    pub const TCP: IPProtocolType = IPProtocolType(6);
    pub const UDP: IPProtocolType = IPProtocolType(17);
    pub const IPV6_ICMP: IPProtocolType = IPProtocolType(58);

    pub fn from_u8(value: u8) -> IPProtocolType {
        IPProtocolType(value)
    }

    pub fn protocol_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for IPProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ANY => write!(f, "ANY"),
            Self::ICMP => write!(f, "ICMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::IPV6_ICMP => write!(f, "IPV6_ICMP"),
            _ => write!(f, "Unknown protocol {}", self.0),
        }
    }
}

impl fmt::Debug for IPProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TrafficSelector {
    ts_type: TrafficSelectorType,
    ip_protocol: IPProtocolType,
    port: RangeInclusive<u16>,
    addr: RangeInclusive<IpAddr>,
}

impl TrafficSelector {
    pub fn new(
        ip_protocol: IPProtocolType,
        addr: RangeInclusive<IpAddr>,
        port: RangeInclusive<u16>,
    ) -> Result<TrafficSelector, FormatError> {
        let ts_type = match (addr.start(), addr.end()) {
            (IpAddr::V4(_), IpAddr::V4(_)) => TrafficSelectorType::TS_IPV4_ADDR_RANGE,
            (IpAddr::V6(_), IpAddr::V6(_)) => TrafficSelectorType::TS_IPV6_ADDR_RANGE,
            _ => return Err("Traffic selector address family mismatch".into()),
        };
        Ok(TrafficSelector {
            ts_type,
            ip_protocol,
            port,
            addr,
        })
    }

    pub fn from_ip_range(addr: RangeInclusive<IpAddr>) -> Result<TrafficSelector, FormatError> {
        Self::new(IPProtocolType::ANY, addr, 0..=u16::MAX)
    }

    pub fn any_ipv4() -> TrafficSelector {
        TrafficSelector {
            ts_type: TrafficSelectorType::TS_IPV4_ADDR_RANGE,
            ip_protocol: IPProtocolType::ANY,
            port: 0..=u16::MAX,
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED)..=IpAddr::V4(Ipv4Addr::BROADCAST),
        }
    }

    pub fn ts_type(&self) -> TrafficSelectorType {
        self.ts_type
    }

    pub fn ip_protocol(&self) -> IPProtocolType {
        self.ip_protocol
    }

    pub fn addr_range(&self) -> &RangeInclusive<IpAddr> {
        &self.addr
    }

    pub fn port_range(&self) -> &RangeInclusive<u16> {
        &self.port
    }

    fn encoded_length(&self) -> usize {
        match self.ts_type {
            TrafficSelectorType::TS_IPV6_ADDR_RANGE => 8 + 16 * 2,
            _ => 8 + 4 * 2,
        }
    }

    fn write_to(&self, dest: &mut Vec<u8>) {
        dest.push(self.ts_type.0);
        dest.push(self.ip_protocol.0);
        dest.extend_from_slice(&(self.encoded_length() as u16).to_be_bytes());
        dest.extend_from_slice(&self.port.start().to_be_bytes());
        dest.extend_from_slice(&self.port.end().to_be_bytes());
        for addr in [self.addr.start(), self.addr.end()] {
            match addr {
                IpAddr::V4(addr) => dest.extend_from_slice(&addr.octets()),
                IpAddr::V6(addr) => dest.extend_from_slice(&addr.octets()),
            }
        }
    }

    fn from_slice(data: &[u8]) -> Result<(TrafficSelector, usize), FormatError> {
        if data.len() < 8 {
            debug!("Not enough data in traffic selector");
            return Err(FormatError::Truncated("Not enough data in traffic selector"));
        }
        let ts_type = TrafficSelectorType::from_u8(data[0])?;
        let ip_protocol = IPProtocolType(data[1]);
        let selector_length = read_u16(&data[2..4]) as usize;
        let addr_length = match ts_type {
            TrafficSelectorType::TS_IPV6_ADDR_RANGE => 16,
            _ => 4,
        };
        if selector_length != 8 + addr_length * 2 {
            return Err("Traffic selector length is invalid".into());
        }
        if data.len() < selector_length {
            return Err(FormatError::Truncated("Traffic selector overflow"));
        }
        let start_port = read_u16(&data[4..6]);
        let end_port = read_u16(&data[6..8]);
        let read_addr = |addr: &[u8]| -> IpAddr {
            if addr.len() == 16 {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(addr);
                IpAddr::V6(Ipv6Addr::from(octets))
            } else {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(addr);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
        };
        let start_addr = read_addr(&data[8..8 + addr_length]);
        let end_addr = read_addr(&data[8 + addr_length..8 + addr_length * 2]);
        Ok((
            TrafficSelector {
                ts_type,
                ip_protocol,
                port: start_port..=end_port,
                addr: start_addr..=end_addr,
            },
            selector_length,
        ))
    }
}

impl fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} {} ports {}-{}",
            self.addr.start(),
            self.addr.end(),
            self.ip_protocol,
            self.port.start(),
            self.port.end()
        )
    }
}

impl fmt::Debug for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationType(u8);

impl ConfigurationType {
    pub const CFG_REQUEST: ConfigurationType = ConfigurationType(1);
    pub const CFG_REPLY: ConfigurationType = ConfigurationType(2);
    pub const CFG_SET: ConfigurationType = ConfigurationType(3);
    pub const CFG_ACK: ConfigurationType = ConfigurationType(4);
}

impl fmt::Debug for ConfigurationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::CFG_REQUEST => write!(f, "CFG_REQUEST"),
            Self::CFG_REPLY => write!(f, "CFG_REPLY"),
            Self::CFG_SET => write!(f, "CFG_SET"),
            Self::CFG_ACK => write!(f, "CFG_ACK"),
            _ => write!(f, "Unknown configuration type {}", self.0),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationAttributeType(u16);

impl ConfigurationAttributeType {
    pub const INTERNAL_IP4_ADDRESS: ConfigurationAttributeType = ConfigurationAttributeType(1);
    pub const INTERNAL_IP4_NETMASK: ConfigurationAttributeType = ConfigurationAttributeType(2);
    pub const INTERNAL_IP4_DNS: ConfigurationAttributeType = ConfigurationAttributeType(3);
    pub const INTERNAL_IP6_ADDRESS: ConfigurationAttributeType = ConfigurationAttributeType(8);
    pub const INTERNAL_IP6_DNS: ConfigurationAttributeType = ConfigurationAttributeType(10);

    pub fn from_u16(value: u16) -> ConfigurationAttributeType {
        ConfigurationAttributeType(value)
    }
}

impl fmt::Debug for ConfigurationAttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INTERNAL_IP4_ADDRESS => write!(f, "INTERNAL_IP4_ADDRESS"),
            Self::INTERNAL_IP4_NETMASK => write!(f, "INTERNAL_IP4_NETMASK"),
            Self::INTERNAL_IP4_DNS => write!(f, "INTERNAL_IP4_DNS"),
            Self::INTERNAL_IP6_ADDRESS => write!(f, "INTERNAL_IP6_ADDRESS"),
            Self::INTERNAL_IP6_DNS => write!(f, "INTERNAL_IP6_DNS"),
            _ => write!(f, "Unknown configuration attribute {}", self.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigurationAttribute {
    pub attribute_type: ConfigurationAttributeType,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Configuration {
    pub cfg_type: ConfigurationType,
    pub attributes: Vec<ConfigurationAttribute>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPayload {
    // Generic header Next Payload field of SK carries the first inner payload type.
    pub first_payload: PayloadType,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    SecurityAssociation(Vec<Proposal>),
    KeyExchange(KeyExchange),
    IdentificationInitiator(Identification),
    IdentificationResponder(Identification),
    Certificate(Certificate),
    CertificateRequest(Certificate),
    Authentication(Authentication),
    Nonce(Vec<u8>),
    Notify(Notify),
    Delete(Delete),
    VendorId(Vec<u8>),
    TrafficSelectorInitiator(Vec<TrafficSelector>),
    TrafficSelectorResponder(Vec<TrafficSelector>),
    Encrypted(EncryptedPayload),
    Configuration(Configuration),
    Unknown(PayloadType, Vec<u8>),
}

impl Payload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Self::SecurityAssociation(_) => PayloadType::SECURITY_ASSOCIATION,
            Self::KeyExchange(_) => PayloadType::KEY_EXCHANGE,
            Self::IdentificationInitiator(_) => PayloadType::ID_INITIATOR,
            Self::IdentificationResponder(_) => PayloadType::ID_RESPONDER,
            Self::Certificate(_) => PayloadType::CERTIFICATE,
            Self::CertificateRequest(_) => PayloadType::CERTIFICATE_REQUEST,
            Self::Authentication(_) => PayloadType::AUTHENTICATION,
            Self::Nonce(_) => PayloadType::NONCE,
            Self::Notify(_) => PayloadType::NOTIFY,
            Self::Delete(_) => PayloadType::DELETE,
            Self::VendorId(_) => PayloadType::VENDOR_ID,
            Self::TrafficSelectorInitiator(_) => PayloadType::TRAFFIC_SELECTOR_INITIATOR,
            Self::TrafficSelectorResponder(_) => PayloadType::TRAFFIC_SELECTOR_RESPONDER,
            Self::Encrypted(_) => PayloadType::ENCRYPTED_AND_AUTHENTICATED,
            Self::Configuration(_) => PayloadType::CONFIGURATION,
            Self::Unknown(payload_type, _) => *payload_type,
        }
    }

    pub fn decode(
        payload_type: PayloadType,
        next_payload: PayloadType,
        data: &[u8],
    ) -> Result<Payload, FormatError> {
        let payload = match payload_type {
            PayloadType::SECURITY_ASSOCIATION => {
                Self::SecurityAssociation(decode_security_association(data)?)
            }
            PayloadType::KEY_EXCHANGE => {
                if data.len() < 4 {
                    debug!("Not enough data in key exchange payload");
                    return Err(FormatError::Truncated(
                        "Not enough data in key exchange payload",
                    ));
                }
                Self::KeyExchange(KeyExchange {
                    group: read_u16(&data[0..2]),
                    value: data[4..].to_vec(),
                })
            }
            PayloadType::ID_INITIATOR | PayloadType::ID_RESPONDER => {
                if data.len() < 4 {
                    return Err(FormatError::Truncated("Not enough data in ID payload"));
                }
                let id = Identification {
                    id_type: IdentificationType(data[0]),
                    data: data[4..].to_vec(),
                };
                if payload_type == PayloadType::ID_INITIATOR {
                    Self::IdentificationInitiator(id)
                } else {
                    Self::IdentificationResponder(id)
                }
            }
            PayloadType::CERTIFICATE | PayloadType::CERTIFICATE_REQUEST => {
                if data.is_empty() {
                    return Err(FormatError::Truncated(
                        "Not enough data in certificate payload",
                    ));
                }
                let cert = Certificate {
                    encoding: CertificateEncoding(data[0]),
                    data: data[1..].to_vec(),
                };
                if payload_type == PayloadType::CERTIFICATE {
                    Self::Certificate(cert)
                } else {
                    Self::CertificateRequest(cert)
                }
            }
            PayloadType::AUTHENTICATION => {
                if data.len() < 4 {
                    return Err(FormatError::Truncated(
                        "Not enough data in authentication payload",
                    ));
                }
                Self::Authentication(Authentication {
                    method: AuthMethod(data[0]),
                    data: data[4..].to_vec(),
                })
            }
            PayloadType::NONCE => {
                if data.len() < MIN_NONCE_LENGTH || data.len() > MAX_NONCE_LENGTH {
                    debug!("Nonce length {} is out of range", data.len());
                    return Err("Nonce length is out of range".into());
                }
                Self::Nonce(data.to_vec())
            }
            PayloadType::NOTIFY => Self::Notify(decode_notify(data)?),
            PayloadType::DELETE => Self::Delete(decode_delete(data)?),
            PayloadType::VENDOR_ID => Self::VendorId(data.to_vec()),
            PayloadType::TRAFFIC_SELECTOR_INITIATOR => {
                Self::TrafficSelectorInitiator(decode_traffic_selectors(data)?)
            }
            PayloadType::TRAFFIC_SELECTOR_RESPONDER => {
                Self::TrafficSelectorResponder(decode_traffic_selectors(data)?)
            }
            PayloadType::ENCRYPTED_AND_AUTHENTICATED => Self::Encrypted(EncryptedPayload {
                first_payload: next_payload,
                data: data.to_vec(),
            }),
            PayloadType::CONFIGURATION => Self::Configuration(decode_configuration(data)?),
            _ => Self::Unknown(payload_type, data.to_vec()),
        };
        Ok(payload)
    }

    fn encode_body(&self, dest: &mut Vec<u8>) -> Result<(), EncodeError> {
        match self {
            Self::SecurityAssociation(proposals) => {
                encode_security_association(proposals, dest)?
            }
            Self::KeyExchange(kex) => {
                dest.extend_from_slice(&kex.group.to_be_bytes());
                dest.extend_from_slice(&[0, 0]);
                dest.extend_from_slice(&kex.value);
            }
            Self::IdentificationInitiator(id) | Self::IdentificationResponder(id) => {
                dest.extend_from_slice(&id.raw_value());
            }
            Self::Certificate(cert) | Self::CertificateRequest(cert) => {
                dest.push(cert.encoding.0);
                dest.extend_from_slice(&cert.data);
            }
            Self::Authentication(auth) => {
                dest.extend_from_slice(&[auth.method.0, 0, 0, 0]);
                dest.extend_from_slice(&auth.data);
            }
            Self::Nonce(nonce) => dest.extend_from_slice(nonce),
            Self::Notify(notify) => {
                dest.push(notify.protocol_id.map(|id| id.0).unwrap_or(0));
                dest.push(notify.spi.len() as u8);
                dest.extend_from_slice(&notify.message_type.0.to_be_bytes());
                notify.spi.write_to(dest);
                dest.extend_from_slice(&notify.data);
            }
            Self::Delete(delete) => {
                let spi_size = delete.spis.first().map(|spi| spi.len()).unwrap_or(0);
                if delete.spis.iter().any(|spi| spi.len() != spi_size) {
                    return Err("Delete payload has mixed SPI sizes".into());
                }
                let num_spi =
                    u16::try_from(delete.spis.len()).map_err(|_| "Too many SPIs to delete")?;
                dest.push(delete.protocol_id.0);
                dest.push(spi_size as u8);
                dest.extend_from_slice(&num_spi.to_be_bytes());
                delete.spis.iter().for_each(|spi| spi.write_to(dest));
            }
            Self::VendorId(data) => dest.extend_from_slice(data),
            Self::TrafficSelectorInitiator(ts) | Self::TrafficSelectorResponder(ts) => {
                let num_ts = u8::try_from(ts.len()).map_err(|_| "Too many traffic selectors")?;
                dest.extend_from_slice(&[num_ts, 0, 0, 0]);
                ts.iter().for_each(|ts| ts.write_to(dest));
            }
            Self::Encrypted(encrypted) => dest.extend_from_slice(&encrypted.data),
            Self::Configuration(configuration) => {
                dest.extend_from_slice(&[configuration.cfg_type.0, 0, 0, 0]);
                for attr in &configuration.attributes {
                    let length =
                        u16::try_from(attr.value.len()).map_err(|_| "Attribute is too long")?;
                    dest.extend_from_slice(&(attr.attribute_type.0 & 0x7fff).to_be_bytes());
                    dest.extend_from_slice(&length.to_be_bytes());
                    dest.extend_from_slice(&attr.value);
                }
            }
            Self::Unknown(_, data) => dest.extend_from_slice(data),
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IkePayload {
    pub critical: bool,
    pub payload: Payload,
}

impl IkePayload {
    pub fn payload_type(&self) -> PayloadType {
        self.payload.payload_type()
    }

    pub fn encode(&self, next_payload: PayloadType, dest: &mut Vec<u8>) -> Result<(), EncodeError> {
        const CRITICAL_BIT: u8 = 1 << 7;
        let start = dest.len();
        // SK is always the last payload, its Next Payload points inside the encrypted data.
        let next_payload = match self.payload {
            Payload::Encrypted(ref encrypted) => encrypted.first_payload,
            _ => next_payload,
        };
        dest.push(next_payload.0);
        dest.push(if self.critical { CRITICAL_BIT } else { 0x00 });
        dest.extend_from_slice(&[0, 0]);
        self.payload.encode_body(dest)?;
        let payload_length =
            u16::try_from(dest.len() - start).map_err(|_| EncodeError::new("Payload is too long"))?;
        dest[start + 2..start + 4].copy_from_slice(&payload_length.to_be_bytes());
        Ok(())
    }
}

impl From<Payload> for IkePayload {
    fn from(payload: Payload) -> IkePayload {
        IkePayload {
            critical: false,
            payload,
        }
    }
}

struct PayloadIter<'a> {
    next_payload: PayloadType,
    data: &'a [u8],
}

impl<'a> Iterator for PayloadIter<'a> {
    type Item = Result<IkePayload, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        const CRITICAL_BIT: u8 = 1 << 7;
        if self.next_payload == PayloadType::NONE {
            if !self.data.is_empty() {
                debug!("Packet has unaccounted data");
            }
            return None;
        }
        if self.data.len() < PAYLOAD_HEADER_LENGTH {
            debug!("Not enough data in payload");
            self.next_payload = PayloadType::NONE;
            self.data = &[];
            return Some(Err(FormatError::Truncated("Not enough data in payload")));
        }
        let next_payload = PayloadType(self.data[0]);
        let payload_flags = self.data[1];
        let payload_length = read_u16(&self.data[2..4]) as usize;
        if payload_length < PAYLOAD_HEADER_LENGTH || self.data.len() < payload_length {
            debug!(
                "Payload {} declares {} bytes, {} available",
                self.next_payload,
                payload_length,
                self.data.len()
            );
            self.next_payload = PayloadType::NONE;
            self.data = &[];
            return Some(Err(FormatError::Truncated("Payload overflow")));
        }
        // Reserved bits are ignored on receipt, RFC 7296 Section 3.2.
        let critical = payload_flags & CRITICAL_BIT != 0;
        let payload_type = self.next_payload;
        let data = &self.data[PAYLOAD_HEADER_LENGTH..payload_length];
        self.data = &self.data[payload_length..];
        self.next_payload = if payload_type == PayloadType::ENCRYPTED_AND_AUTHENTICATED {
            // Everything after SK is encrypted, next payload refers to the decrypted data.
            if !self.data.is_empty() {
                debug!("Data after encrypted payload");
            }
            self.data = &[];
            PayloadType::NONE
        } else {
            next_payload
        };
        match Payload::decode(payload_type, next_payload, data) {
            Ok(payload) => Some(Ok(IkePayload { critical, payload })),
            Err(err) => {
                self.next_payload = PayloadType::NONE;
                self.data = &[];
                Some(Err(err))
            }
        }
    }
}

pub fn decode_payloads(
    first_payload: PayloadType,
    data: &[u8],
) -> Result<Vec<IkePayload>, FormatError> {
    PayloadIter {
        next_payload: first_payload,
        data,
    }
    .collect()
}

pub fn encode_payloads(payloads: &[IkePayload]) -> Result<Vec<u8>, EncodeError> {
    let mut dest = vec![];
    for (i, payload) in payloads.iter().enumerate() {
        let next_payload = payloads
            .get(i + 1)
            .map(|next| next.payload_type())
            .unwrap_or(PayloadType::NONE);
        payload.encode(next_payload, &mut dest)?;
    }
    Ok(dest)
}

fn decode_security_association(mut data: &[u8]) -> Result<Vec<Proposal>, FormatError> {
    let mut proposals = vec![];
    while !data.is_empty() {
        if data.len() < 8 {
            debug!("Not enough data in security association");
            return Err(FormatError::Truncated(
                "Not enough data in security association",
            ));
        }
        let last_substruct = data[0];
        let proposal_length = read_u16(&data[2..4]) as usize;
        if proposal_length < 8 || data.len() < proposal_length {
            debug!("Proposal overflow");
            return Err(FormatError::Truncated("Proposal overflow"));
        }
        match last_substruct {
            0 if data.len() != proposal_length => {
                debug!("Unaccounted proposal bytes");
                return Err("Unaccounted proposal bytes".into());
            }
            2 if data.len() == proposal_length => {
                debug!("Missing proposal after non-last substruct");
                return Err(FormatError::Truncated("Missing proposal"));
            }
            0 | 2 => {}
            _ => {
                debug!("Unexpected proposal last substruc {}", last_substruct);
                return Err("Unexpected proposal last substruc".into());
            }
        }
        let proposal_num = data[4];
        let protocol_id = IPSecProtocolID(data[5]);
        let spi_size = data[6] as usize;
        let num_transforms = data[7] as usize;
        if proposal_length < 8 + spi_size {
            debug!("Proposal SPI overflow");
            return Err(FormatError::Truncated("Proposal SPI overflow"));
        }
        let spi = Spi::from_slice(&data[8..8 + spi_size])?;
        let transforms = decode_transforms(&data[8 + spi_size..proposal_length], num_transforms)?;
        proposals.push(Proposal {
            num: proposal_num,
            protocol_id,
            spi,
            transforms,
        });
        data = &data[proposal_length..];
    }
    Ok(proposals)
}

fn decode_transforms(
    mut data: &[u8],
    num_transforms: usize,
) -> Result<Vec<Transform>, FormatError> {
    let mut transforms = Vec::with_capacity(num_transforms);
    while !data.is_empty() {
        if data.len() < 8 {
            debug!("Not enough data in security association transform");
            return Err(FormatError::Truncated(
                "Not enough data in security association transform",
            ));
        }
        let last_substruct = data[0];
        let transform_length = read_u16(&data[2..4]) as usize;
        if transform_length < 8 || data.len() < transform_length {
            debug!("Transform overflow");
            return Err(FormatError::Truncated("Transform overflow"));
        }
        if (last_substruct == 0 && data.len() != transform_length)
            || (last_substruct == 3 && data.len() == transform_length)
            || (last_substruct != 0 && last_substruct != 3)
        {
            debug!("Unexpected transform last substruc {}", last_substruct);
            return Err("Unexpected transform last substruc".into());
        }
        let transform_type = TransformType(data[4], read_u16(&data[6..8]));
        let mut transform = Transform::new(transform_type, None);
        decode_transform_attributes(&data[8..transform_length], &mut transform)?;
        transforms.push(transform);
        data = &data[transform_length..];
    }
    if transforms.len() != num_transforms {
        debug!(
            "Proposal declares {} transforms, contains {}",
            num_transforms,
            transforms.len()
        );
        return Err("Transform count mismatch".into());
    }
    Ok(transforms)
}

fn decode_transform_attributes(
    mut data: &[u8],
    transform: &mut Transform,
) -> Result<(), FormatError> {
    const ATTRIBUTE_FORMAT_TV: u16 = 1 << 15;
    const ATTRIBUTE_TYPE_MASK: u16 = !ATTRIBUTE_FORMAT_TV;
    while !data.is_empty() {
        if data.len() < 4 {
            debug!("Not enough data in security association transform attribute");
            return Err(FormatError::Truncated(
                "Not enough data in transform attribute",
            ));
        }
        let attribute_type = read_u16(&data[0..2]);
        if attribute_type & ATTRIBUTE_FORMAT_TV != 0 {
            let attribute_type = TransformAttributeType(attribute_type & ATTRIBUTE_TYPE_MASK);
            if attribute_type == TransformAttributeType::KEY_LENGTH {
                transform.key_length = Some(read_u16(&data[2..4]));
            } else {
                transform.unknown_attributes = true;
            }
            data = &data[4..];
        } else {
            let attribute_length = read_u16(&data[2..4]) as usize;
            if data.len() < 4 + attribute_length {
                debug!("Transform attribute overflow");
                return Err(FormatError::Truncated("Transform attribute overflow"));
            }
            // Key Length is always sent in TV format.
            transform.unknown_attributes = true;
            data = &data[4 + attribute_length..];
        }
    }
    Ok(())
}

fn encode_security_association(
    proposals: &[Proposal],
    dest: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    for (i, proposal) in proposals.iter().enumerate() {
        let start = dest.len();
        let last_substruct = if i + 1 == proposals.len() { 0 } else { 2 };
        let num_transforms =
            u8::try_from(proposal.transforms.len()).map_err(|_| "Too many transforms")?;
        dest.extend_from_slice(&[last_substruct, 0, 0, 0]);
        dest.push(proposal.num);
        dest.push(proposal.protocol_id.0);
        dest.push(proposal.spi.len() as u8);
        dest.push(num_transforms);
        proposal.spi.write_to(dest);
        for (j, transform) in proposal.transforms.iter().enumerate() {
            let transform_start = dest.len();
            let last_substruct = if j + 1 == proposal.transforms.len() {
                0
            } else {
                3
            };
            let (transform_type, transform_id) = transform.transform_type.type_id();
            dest.extend_from_slice(&[last_substruct, 0, 0, 0, transform_type, 0]);
            dest.extend_from_slice(&transform_id.to_be_bytes());
            if let Some(key_length) = transform.key_length {
                const ATTRIBUTE_FORMAT_TV: u16 = 1 << 15;
                let attribute_type = ATTRIBUTE_FORMAT_TV | TransformAttributeType::KEY_LENGTH.0;
                dest.extend_from_slice(&attribute_type.to_be_bytes());
                dest.extend_from_slice(&key_length.to_be_bytes());
            }
            let transform_length = (dest.len() - transform_start) as u16;
            dest[transform_start + 2..transform_start + 4]
                .copy_from_slice(&transform_length.to_be_bytes());
        }
        let proposal_length =
            u16::try_from(dest.len() - start).map_err(|_| "Proposal is too long")?;
        dest[start + 2..start + 4].copy_from_slice(&proposal_length.to_be_bytes());
    }
    Ok(())
}

fn decode_notify(data: &[u8]) -> Result<Notify, FormatError> {
    if data.len() < 4 {
        debug!("Not enough data in notify payload");
        return Err(FormatError::Truncated("Not enough data in notify payload"));
    }
    let protocol_id = if data[0] != 0 {
        Some(IPSecProtocolID(data[0]))
    } else {
        None
    };
    let spi_size = data[1] as usize;
    if data.len() < 4 + spi_size {
        return Err(FormatError::Truncated("Notify SPI overflow"));
    }
    Ok(Notify {
        protocol_id,
        spi: Spi::from_slice(&data[4..4 + spi_size])?,
        message_type: NotifyMessageType(read_u16(&data[2..4])),
        data: data[4 + spi_size..].to_vec(),
    })
}

fn decode_delete(data: &[u8]) -> Result<Delete, FormatError> {
    if data.len() < 4 {
        debug!("Not enough data in delete payload");
        return Err(FormatError::Truncated("Not enough data in delete payload"));
    }
    let protocol_id = IPSecProtocolID(data[0]);
    let spi_size = data[1] as usize;
    let num_spi = read_u16(&data[2..4]) as usize;
    if data.len() != 4 + spi_size * num_spi {
        debug!(
            "Delete payload has {} bytes, expected {}",
            data.len(),
            4 + spi_size * num_spi
        );
        return Err(FormatError::Truncated("Delete payload SPI overflow"));
    }
    let spis = if spi_size == 0 {
        vec![]
    } else {
        data[4..]
            .chunks(spi_size)
            .map(Spi::from_slice)
            .collect::<Result<Vec<_>, _>>()?
    };
    Ok(Delete { protocol_id, spis })
}

fn decode_traffic_selectors(data: &[u8]) -> Result<Vec<TrafficSelector>, FormatError> {
    if data.len() < 4 {
        return Err(FormatError::Truncated(
            "Not enough data in traffic selector payload",
        ));
    }
    let num_ts = data[0] as usize;
    let mut data = &data[4..];
    let mut selectors = Vec::with_capacity(num_ts);
    for _ in 0..num_ts {
        let (ts, length) = TrafficSelector::from_slice(data)?;
        selectors.push(ts);
        data = &data[length..];
    }
    if !data.is_empty() {
        return Err("Traffic selector payload has unaccounted data".into());
    }
    Ok(selectors)
}

fn decode_configuration(data: &[u8]) -> Result<Configuration, FormatError> {
    if data.len() < 4 {
        return Err(FormatError::Truncated(
            "Not enough data in configuration payload",
        ));
    }
    let cfg_type = ConfigurationType(data[0]);
    let mut data = &data[4..];
    let mut attributes = vec![];
    while !data.is_empty() {
        if data.len() < 4 {
            return Err(FormatError::Truncated(
                "Not enough data in configuration attribute",
            ));
        }
        let attribute_type = ConfigurationAttributeType(read_u16(&data[0..2]) & 0x7fff);
        let length = read_u16(&data[2..4]) as usize;
        if data.len() < 4 + length {
            return Err(FormatError::Truncated("Configuration attribute overflow"));
        }
        attributes.push(ConfigurationAttribute {
            attribute_type,
            value: data[4..4 + length].to_vec(),
        });
        data = &data[4 + length..];
    }
    Ok(Configuration {
        cfg_type,
        attributes,
    })
}

/// Outgoing IKEv2 message: a header and payloads in wire order.
#[derive(Clone, Debug)]
pub struct Message {
    header: IkeHeader,
    payloads: Vec<IkePayload>,
}

impl Message {
    pub fn new(header: IkeHeader) -> Message {
        Message {
            header,
            payloads: vec![],
        }
    }

    pub fn header(&self) -> &IkeHeader {
        &self.header
    }

    pub fn payloads(&self) -> &[IkePayload] {
        &self.payloads
    }

    pub fn push_payload(&mut self, payload: Payload) {
        self.payloads.push(payload.into())
    }

    pub fn push_critical_payload(&mut self, payload: Payload) {
        self.payloads.push(IkePayload {
            critical: true,
            payload,
        })
    }

    /// Serializes the message; the header Length and Next Payload fields are
    /// always recomputed from the payload list.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let payloads = encode_payloads(&self.payloads)?;
        let mut header = self.header;
        header.next_payload = self
            .payloads
            .first()
            .map(|pl| pl.payload_type())
            .unwrap_or(PayloadType::NONE);
        header.length = u32::try_from(IKE_HEADER_LENGTH + payloads.len())
            .map_err(|_| EncodeError::new("Message is too long"))?;
        let mut dest = Vec::with_capacity(IKE_HEADER_LENGTH + payloads.len());
        dest.extend_from_slice(&header.to_bytes());
        dest.extend_from_slice(&payloads);
        Ok(dest)
    }
}

/// Received IKEv2 message with a validated header; payloads are only split on demand.
pub struct InputMessage<'a> {
    header: IkeHeader,
    data: &'a [u8],
}

impl InputMessage<'_> {
    pub fn from_datagram(p: &[u8]) -> Result<InputMessage, FormatError> {
        let header = IkeHeader::from_bytes(p)?;
        let declared_length = header.length as usize;
        if declared_length > p.len() {
            debug!(
                "Packet length mismatch (received {} bytes, peer specified {} bytes)",
                p.len(),
                declared_length
            );
            return Err(FormatError::ShortPacket);
        } else if declared_length != p.len() {
            debug!(
                "Packet has {} trailing bytes",
                p.len().saturating_sub(declared_length)
            );
            return Err("Packet length mismatch".into());
        }
        Ok(InputMessage { header, data: p })
    }

    pub fn header(&self) -> &IkeHeader {
        &self.header
    }

    pub fn raw_data(&self) -> &[u8] {
        self.data
    }

    pub fn read_initiator_spi(&self) -> u64 {
        self.header.initiator_spi
    }

    pub fn read_responder_spi(&self) -> u64 {
        self.header.responder_spi
    }

    pub fn read_exchange_type(&self) -> ExchangeType {
        self.header.exchange_type
    }

    pub fn read_flags(&self) -> Flags {
        self.header.flags
    }

    pub fn read_message_id(&self) -> u32 {
        self.header.message_id
    }

    pub fn is_response(&self) -> bool {
        self.header.flags.has(Flags::RESPONSE)
    }

    pub fn iter_payloads(&self) -> impl Iterator<Item = Result<IkePayload, FormatError>> + '_ {
        PayloadIter {
            next_payload: self.header.next_payload,
            data: &self.data[IKE_HEADER_LENGTH..],
        }
    }

    pub fn payloads(&self) -> Result<Vec<IkePayload>, FormatError> {
        self.iter_payloads().collect()
    }
}

impl fmt::Debug for InputMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "IKEv2 message")?;
        writeln!(f, "  Initiator SPI {:x}", self.header.initiator_spi)?;
        writeln!(f, "  Responder SPI {:x}", self.header.responder_spi)?;
        writeln!(f, "  Next payload {}", self.header.next_payload)?;
        writeln!(f, "  Exchange type {}", self.header.exchange_type)?;
        writeln!(f, "  Flags {}", self.header.flags)?;
        writeln!(f, "  Message ID {}", self.header.message_id)?;
        writeln!(f, "  Length {}", self.header.length)?;
        for pl in self.iter_payloads() {
            match pl {
                Ok(pl) => writeln!(f, "  {:?}", pl)?,
                Err(err) => writeln!(f, "  Payload data invalid {}", err)?,
            }
        }
        Ok(())
    }
}

fn read_u16(data: &[u8]) -> u16 {
    let mut result = [0u8; 2];
    result.copy_from_slice(&data[..2]);
    u16::from_be_bytes(result)
}

fn read_u32(data: &[u8]) -> u32 {
    let mut result = [0u8; 4];
    result.copy_from_slice(&data[..4]);
    u32::from_be_bytes(result)
}

fn read_u64(data: &[u8]) -> u64 {
    let mut result = [0u8; 8];
    result.copy_from_slice(&data[..8]);
    u64::from_be_bytes(result)
}

#[derive(Debug, PartialEq, Eq)]
pub enum FormatError {
    ShortPacket,
    Truncated(&'static str),
    Malformed(&'static str),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ShortPacket => write!(f, "Packet is shorter than its declared length"),
            Self::Truncated(msg) => write!(f, "Truncated: {}", msg),
            Self::Malformed(msg) => write!(f, "{}", msg),
        }
    }
}

impl error::Error for FormatError {}

impl From<&'static str> for FormatError {
    fn from(msg: &'static str) -> FormatError {
        FormatError::Malformed(msg)
    }
}

#[derive(Debug)]
pub struct EncodeError {
    msg: &'static str,
}

impl EncodeError {
    fn new(msg: &'static str) -> EncodeError {
        EncodeError { msg }
    }
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl error::Error for EncodeError {}

impl From<&'static str> for EncodeError {
    fn from(msg: &'static str) -> EncodeError {
        EncodeError { msg }
    }
}
