use aes::{Aes128, Aes192, Aes256};
use cipher::{
    block_padding::NoPadding, BlockCipher, BlockDecryptMut, BlockEncryptMut, InnerIvInit,
    KeyInit,
};
use crypto_bigint::{
    const_residue, impl_modulus,
    modular::constant_mod::{self, ResidueParams},
    Encoding, Random, U1024, U2048,
};
use hmac::{Hmac, Mac};
use log::debug;
use p256::{
    elliptic_curve::sec1::Tag as P256Tag, EncodedPoint, NonZeroScalar, ProjectivePoint, PublicKey,
};
use rand::{rngs::OsRng, Rng};
use sha1::Sha1;
use sha2::{Sha256, Sha384};
use std::{error, fmt};
use zeroize::Zeroizing;

use super::message;

const AES_BLOCK_SIZE: usize = 16;

/// Negotiated algorithms of an IKE or Child SA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaParams {
    pub protocol_id: message::IPSecProtocolID,
    pub enc: Option<message::Transform>,
    pub prf: Option<message::TransformType>,
    pub integ: Option<message::TransformType>,
    pub dh: Option<message::TransformType>,
    pub esn: Option<message::TransformType>,
}

impl SaParams {
    pub fn enc_key_length(&self) -> Result<usize, UnsupportedTransform> {
        match self.enc {
            Some(ref enc) => encryption_key_length(enc),
            None => Err(UnsupportedTransform {}),
        }
    }

    pub fn prf_key_length(&self) -> Result<usize, UnsupportedTransform> {
        match self.prf {
            Some(prf) => prf_key_length(prf),
            None => Err(UnsupportedTransform {}),
        }
    }

    pub fn integ_key_length(&self) -> Result<usize, UnsupportedTransform> {
        match self.integ {
            Some(integ) => integrity_key_length(integ),
            None => Err(UnsupportedTransform {}),
        }
    }

    pub fn dh_group(&self) -> Option<u16> {
        self.dh
            .filter(|dh| *dh != message::TransformType::DH_NONE)
            .map(|dh| dh.type_id().1)
    }

    pub fn create_prf(&self, key: &[u8]) -> Result<PseudorandomTransform, InitError> {
        match self.prf {
            Some(prf) => PseudorandomTransform::init(prf, key),
            None => Err("PRF is not negotiated".into()),
        }
    }

    /// Builds the single-proposal SA payload echoed back to the peer.
    pub fn to_proposal(&self, num: u8, spi: message::Spi) -> message::Proposal {
        let mut transforms = vec![];
        if let Some(ref enc) = self.enc {
            transforms.push(enc.clone());
        }
        let others = [self.prf, self.integ, self.dh, self.esn];
        transforms.extend(
            others
                .into_iter()
                .flatten()
                .map(|transform_type| message::Transform::new(transform_type, None)),
        );
        message::Proposal {
            num,
            protocol_id: self.protocol_id,
            spi,
            transforms,
        }
    }
}

impl fmt::Display for SaParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.protocol_id)?;
        if let Some(ref enc) = self.enc {
            write!(f, " {}", enc.transform_type)?;
            if let Some(key_length) = enc.key_length {
                write!(f, "-{}", key_length)?;
            }
        }
        for transform_type in [self.prf, self.integ, self.dh, self.esn].into_iter().flatten() {
            write!(f, " {}", transform_type)?;
        }
        Ok(())
    }
}

fn select_transform(
    transform_type: u8,
    local: &message::Proposal,
    remote: &message::Proposal,
) -> Result<Option<message::Transform>, UnsupportedTransform> {
    let is_none = |t: &&message::Transform| t.transform_type.type_id().1 == 0;
    let local_transforms = local
        .transforms
        .iter()
        .filter(|t| t.transform_type.transform_type() == transform_type)
        .collect::<Vec<_>>();
    let remote_transforms = remote
        .transforms
        .iter()
        .filter(|t| t.transform_type.transform_type() == transform_type)
        .collect::<Vec<_>>();
    match (local_transforms.is_empty(), remote_transforms.is_empty()) {
        (true, true) => Ok(None),
        (false, true) => {
            if local_transforms.iter().any(is_none) {
                Ok(None)
            } else {
                Err(UnsupportedTransform {})
            }
        }
        (true, false) => {
            if remote_transforms.iter().any(is_none) {
                Ok(None)
            } else {
                Err(UnsupportedTransform {})
            }
        }
        (false, false) => remote_transforms
            .into_iter()
            .filter(|remote| !remote.unknown_attributes)
            .find(|remote| {
                local_transforms.iter().any(|local| {
                    local.transform_type == remote.transform_type
                        && local.key_length == remote.key_length
                })
            })
            .cloned()
            .map(Some)
            .ok_or(UnsupportedTransform {}),
    }
}

fn match_proposal(
    local: &message::Proposal,
    remote: &message::Proposal,
) -> Result<SaParams, UnsupportedTransform> {
    if local.protocol_id != remote.protocol_id {
        return Err(UnsupportedTransform {});
    }
    let enc = select_transform(message::TransformType::ENCRYPTION, local, remote)?;
    let prf = select_transform(message::TransformType::PSEUDORANDOM, local, remote)?;
    let integ = select_transform(message::TransformType::INTEGRITY, local, remote)?;
    let dh = select_transform(message::TransformType::DIFFIE_HELLMAN, local, remote)?;
    let esn = select_transform(message::TransformType::EXTENDED_SEQUENCE_NUMBERS, local, remote)?;
    let params = SaParams {
        protocol_id: remote.protocol_id,
        enc,
        prf: prf.map(|t| t.transform_type),
        integ: integ.map(|t| t.transform_type),
        dh: dh.map(|t| t.transform_type),
        esn: esn.map(|t| t.transform_type),
    };
    // Only AES-CBC is implemented, so integrity is always required.
    params.enc_key_length()?;
    params.integ_key_length()?;
    if params.protocol_id == message::IPSecProtocolID::IKE {
        params.prf_key_length()?;
        if params.dh_group().is_none() {
            return Err(UnsupportedTransform {});
        }
    }
    Ok(params)
}

/// Picks the first remote proposal (in the peer's order) that matches any local proposal.
pub fn choose_sa_parameters<'a>(
    local: &[message::Proposal],
    remote: &'a [message::Proposal],
) -> Option<(SaParams, &'a message::Proposal)> {
    remote.iter().find_map(|remote_proposal| {
        local.iter().find_map(|local_proposal| {
            match match_proposal(local_proposal, remote_proposal) {
                Ok(params) => {
                    debug!(
                        "Selected proposal {} with parameters {}",
                        remote_proposal.num, params
                    );
                    Some((params, remote_proposal))
                }
                Err(_) => None,
            }
        })
    })
}

pub fn encryption_key_length(transform: &message::Transform) -> Result<usize, UnsupportedTransform> {
    match (transform.transform_type, transform.key_length) {
        (message::TransformType::ENCR_AES_CBC, Some(128)) => Ok(128 / 8),
        (message::TransformType::ENCR_AES_CBC, Some(192)) => Ok(192 / 8),
        (message::TransformType::ENCR_AES_CBC, Some(256)) => Ok(256 / 8),
        _ => Err(UnsupportedTransform {}),
    }
}

pub fn prf_key_length(transform_type: message::TransformType) -> Result<usize, UnsupportedTransform> {
    match transform_type {
        message::TransformType::PRF_HMAC_SHA1 => Ok(160 / 8),
        message::TransformType::PRF_HMAC_SHA2_256 => Ok(256 / 8),
        message::TransformType::PRF_HMAC_SHA2_384 => Ok(384 / 8),
        _ => Err(UnsupportedTransform {}),
    }
}

pub fn integrity_key_length(
    transform_type: message::TransformType,
) -> Result<usize, UnsupportedTransform> {
    match transform_type {
        message::TransformType::AUTH_HMAC_SHA1_96 => Ok(160 / 8),
        message::TransformType::AUTH_HMAC_SHA2_256_128 => Ok(256 / 8),
        message::TransformType::AUTH_HMAC_SHA2_384_192 => Ok(384 / 8),
        _ => Err(UnsupportedTransform {}),
    }
}

pub enum DHTransformType {
    MODP1024(DHTransformMODP1024),
    MODP2048(DHTransformMODP2048),
    ECP256(DHTransformECP256),
}

pub trait DHTransform {
    fn read_public_key(&self) -> Vec<u8>;

    fn key_length_bytes(&self) -> usize;

    fn shared_key_length_bytes(&self) -> usize;

    fn group_number(&self) -> u16;

    fn compute_shared_secret(
        &self,
        other_public_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, InitError>;
}

impl DHTransformType {
    pub fn init(transform_type: message::TransformType) -> Result<DHTransformType, InitError> {
        match transform_type {
            message::TransformType::DH_1024_MODP => {
                let private_key = U1024::random(&mut OsRng);
                // This calculates DH_MODP_GENERATOR^private_key mod DHModulus1024.
                let public_key = DH_MODP_RESIDUE_1024.pow(&private_key).retrieve();
                Ok(DHTransformType::MODP1024(DHTransformMODP1024 {
                    private_key,
                    public_key,
                }))
            }
            message::TransformType::DH_2048_MODP => {
                let private_key = U2048::random(&mut OsRng);
                let public_key = DH_MODP_RESIDUE_2048.pow(&private_key).retrieve();
                Ok(DHTransformType::MODP2048(DHTransformMODP2048 {
                    private_key,
                    public_key,
                }))
            }
            message::TransformType::DH_256_ECP => {
                let private_key = NonZeroScalar::random(&mut OsRng);
                let public_key = PublicKey::from_secret_scalar(&private_key);
                Ok(DHTransformType::ECP256(DHTransformECP256 {
                    private_key,
                    public_key,
                }))
            }
            _ => Err("Unsupported DH".into()),
        }
    }

    pub fn from_group(group: u16) -> Result<DHTransformType, InitError> {
        Self::init(message::TransformType::dh_group(group))
    }

    pub fn is_supported(group: u16) -> bool {
        matches!(
            message::TransformType::dh_group(group),
            message::TransformType::DH_1024_MODP
                | message::TransformType::DH_2048_MODP
                | message::TransformType::DH_256_ECP
        )
    }
}

impl DHTransform for DHTransformType {
    fn read_public_key(&self) -> Vec<u8> {
        match self {
            Self::MODP1024(ref dh) => dh.read_public_key(),
            Self::MODP2048(ref dh) => dh.read_public_key(),
            Self::ECP256(ref dh) => dh.read_public_key(),
        }
    }

    fn key_length_bytes(&self) -> usize {
        match self {
            Self::MODP1024(ref dh) => dh.key_length_bytes(),
            Self::MODP2048(ref dh) => dh.key_length_bytes(),
            Self::ECP256(ref dh) => dh.key_length_bytes(),
        }
    }

    fn shared_key_length_bytes(&self) -> usize {
        match self {
            Self::MODP1024(ref dh) => dh.shared_key_length_bytes(),
            Self::MODP2048(ref dh) => dh.shared_key_length_bytes(),
            Self::ECP256(ref dh) => dh.shared_key_length_bytes(),
        }
    }

    fn group_number(&self) -> u16 {
        match self {
            Self::MODP1024(ref dh) => dh.group_number(),
            Self::MODP2048(ref dh) => dh.group_number(),
            Self::ECP256(ref dh) => dh.group_number(),
        }
    }

    fn compute_shared_secret(
        &self,
        other_public_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, InitError> {
        match self {
            Self::MODP1024(ref dh) => dh.compute_shared_secret(other_public_key),
            Self::MODP2048(ref dh) => dh.compute_shared_secret(other_public_key),
            Self::ECP256(ref dh) => dh.compute_shared_secret(other_public_key),
        }
    }
}

pub struct DHTransformMODP1024 {
    public_key: U1024,
    private_key: U1024,
}

impl DHTransform for DHTransformMODP1024 {
    fn read_public_key(&self) -> Vec<u8> {
        self.public_key.to_be_bytes().to_vec()
    }

    fn key_length_bytes(&self) -> usize {
        1024 / 8
    }

    fn shared_key_length_bytes(&self) -> usize {
        self.key_length_bytes()
    }

    fn group_number(&self) -> u16 {
        message::TransformType::DH_1024_MODP.type_id().1
    }

    fn compute_shared_secret(
        &self,
        other_public_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, InitError> {
        if other_public_key.len() != self.key_length_bytes() {
            return Err("MODP 1024 key length is not valid".into());
        }
        let other_public_key = U1024::from_be_slice(other_public_key);
        let max_public_key = DHModulus1024::MODULUS.wrapping_sub(&U1024::ONE);
        if other_public_key <= U1024::ONE || other_public_key >= max_public_key {
            return Err("MODP 1024 public key is out of range".into());
        }
        let other_key_residue = const_residue!(other_public_key, DHModulus1024);
        let shared_key = other_key_residue.pow(&self.private_key).retrieve();
        Ok(Zeroizing::new(shared_key.to_be_bytes().to_vec()))
    }
}

pub struct DHTransformMODP2048 {
    public_key: U2048,
    private_key: U2048,
}

impl DHTransform for DHTransformMODP2048 {
    fn read_public_key(&self) -> Vec<u8> {
        self.public_key.to_be_bytes().to_vec()
    }

    fn key_length_bytes(&self) -> usize {
        2048 / 8
    }

    fn shared_key_length_bytes(&self) -> usize {
        self.key_length_bytes()
    }

    fn group_number(&self) -> u16 {
        message::TransformType::DH_2048_MODP.type_id().1
    }

    fn compute_shared_secret(
        &self,
        other_public_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, InitError> {
        if other_public_key.len() != self.key_length_bytes() {
            return Err("MODP 2048 key length is not valid".into());
        }
        let other_public_key = U2048::from_be_slice(other_public_key);
        let max_public_key = DHModulus2048::MODULUS.wrapping_sub(&U2048::ONE);
        if other_public_key <= U2048::ONE || other_public_key >= max_public_key {
            return Err("MODP 2048 public key is out of range".into());
        }
        let other_key_residue = const_residue!(other_public_key, DHModulus2048);
        let shared_key = other_key_residue.pow(&self.private_key).retrieve();
        Ok(Zeroizing::new(shared_key.to_be_bytes().to_vec()))
    }
}

pub struct DHTransformECP256 {
    private_key: NonZeroScalar,
    public_key: PublicKey,
}

impl DHTransform for DHTransformECP256 {
    fn read_public_key(&self) -> Vec<u8> {
        // RFC 5903 uses x|y without the SEC1 tag.
        EncodedPoint::from(&self.public_key).as_bytes()[1..].to_vec()
    }

    fn key_length_bytes(&self) -> usize {
        2 * 256 / 8
    }

    fn shared_key_length_bytes(&self) -> usize {
        256 / 8
    }

    fn group_number(&self) -> u16 {
        message::TransformType::DH_256_ECP.type_id().1
    }

    fn compute_shared_secret(
        &self,
        other_public_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, InitError> {
        if other_public_key.len() != self.key_length_bytes() {
            return Err("ECP 256 key length is not valid".into());
        }
        let mut other_public_key_sec1 = [0u8; 1 + 64];
        other_public_key_sec1[0] = P256Tag::Uncompressed.into();
        other_public_key_sec1[1..].copy_from_slice(other_public_key);
        let other_public_key = match PublicKey::from_sec1_bytes(&other_public_key_sec1) {
            Ok(key) => key,
            Err(err) => {
                debug!("Failed to decode other public key {}", err);
                return Err("Failed to decode other public key".into());
            }
        };
        let public_point = ProjectivePoint::from(other_public_key.as_affine());
        let secret_point = (&public_point * &self.private_key).to_affine();
        Ok(Zeroizing::new(
            EncodedPoint::from(secret_point).compress().as_bytes()[1..].to_vec(),
        ))
    }
}

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;
type HmacSha384 = Hmac<Sha384>;

#[derive(Clone)]
pub enum PseudorandomTransform {
    HmacSha1(HmacSha1),
    HmacSha256(HmacSha256),
    HmacSha384(HmacSha384),
}

impl PseudorandomTransform {
    pub fn init(
        transform_type: message::TransformType,
        key: &[u8],
    ) -> Result<PseudorandomTransform, InitError> {
        match transform_type {
            message::TransformType::PRF_HMAC_SHA1 => <HmacSha1 as Mac>::new_from_slice(key)
                .map(Self::HmacSha1)
                .map_err(|_| InitError::new("Failed to init HMAC SHA1 PRF")),
            message::TransformType::PRF_HMAC_SHA2_256 => <HmacSha256 as Mac>::new_from_slice(key)
                .map(Self::HmacSha256)
                .map_err(|_| InitError::new("Failed to init HMAC SHA256 PRF")),
            message::TransformType::PRF_HMAC_SHA2_384 => <HmacSha384 as Mac>::new_from_slice(key)
                .map(Self::HmacSha384)
                .map_err(|_| InitError::new("Failed to init HMAC SHA384 PRF")),
            _ => Err("Unsupported PRF".into()),
        }
    }

    pub fn output_length(&self) -> usize {
        match self {
            Self::HmacSha1(_) => 160 / 8,
            Self::HmacSha256(_) => 256 / 8,
            Self::HmacSha384(_) => 384 / 8,
        }
    }

    pub fn prf(&self, data: &[u8]) -> Zeroizing<Vec<u8>> {
        self.prf_parts(&[data])
    }

    /// Computes the PRF over the concatenation of `parts`.
    pub fn prf_parts(&self, parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
        fn digest<M: Mac + Clone>(hmac: &M, parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
            let mut hmac = hmac.clone();
            parts.iter().for_each(|part| hmac.update(part));
            Zeroizing::new(hmac.finalize().into_bytes().to_vec())
        }
        match self {
            Self::HmacSha1(ref hmac) => digest(hmac, parts),
            Self::HmacSha256(ref hmac) => digest(hmac, parts),
            Self::HmacSha384(ref hmac) => digest(hmac, parts),
        }
    }

    /// Checks that prf(data) equals `expected` in constant time.
    pub fn verify(&self, data: &[u8], expected: &[u8]) -> bool {
        fn verify_with<M: Mac + Clone>(hmac: &M, data: &[u8], expected: &[u8]) -> bool {
            let mut hmac = hmac.clone();
            hmac.update(data);
            hmac.verify_slice(expected).is_ok()
        }
        match self {
            Self::HmacSha1(ref hmac) => verify_with(hmac, data, expected),
            Self::HmacSha256(ref hmac) => verify_with(hmac, data, expected),
            Self::HmacSha384(ref hmac) => verify_with(hmac, data, expected),
        }
    }
}

#[derive(Clone)]
pub enum Integrity {
    HmacSha1tr96(HmacSha1),
    HmacSha256tr128(HmacSha256),
    HmacSha384tr192(HmacSha384),
}

impl Integrity {
    pub fn init(
        transform_type: message::TransformType,
        key: &[u8],
    ) -> Result<Integrity, InitError> {
        match transform_type {
            message::TransformType::AUTH_HMAC_SHA1_96 => <HmacSha1 as Mac>::new_from_slice(key)
                .map(Self::HmacSha1tr96)
                .map_err(|err| {
                    debug!("Failed to init SHA1-96 HMAC key: {}", err);
                    InitError::new("Failed to init SHA1-96 HMAC key")
                }),
            message::TransformType::AUTH_HMAC_SHA2_256_128 => <HmacSha256 as Mac>::new_from_slice(key)
                .map(Self::HmacSha256tr128)
                .map_err(|err| {
                    debug!("Failed to init SHA256-128 HMAC key: {}", err);
                    InitError::new("Failed to init SHA256-128 HMAC key")
                }),
            message::TransformType::AUTH_HMAC_SHA2_384_192 => <HmacSha384 as Mac>::new_from_slice(key)
                .map(Self::HmacSha384tr192)
                .map_err(|err| {
                    debug!("Failed to init SHA384-192 HMAC key: {}", err);
                    InitError::new("Failed to init SHA384-192 HMAC key")
                }),
            _ => Err("Unsupported integrity algorithm".into()),
        }
    }

    pub fn signature_length(&self) -> usize {
        match self {
            Self::HmacSha1tr96(_) => 96 / 8,
            Self::HmacSha256tr128(_) => 128 / 8,
            Self::HmacSha384tr192(_) => 192 / 8,
        }
    }

    /// Writes the ICV into the last `signature_length` bytes of `data`.
    pub fn sign(&self, data: &mut [u8]) -> Result<(), CryptoError> {
        fn sign_with<M: Mac + Clone>(
            hmac: &M,
            data: &mut [u8],
            signature_length: usize,
        ) -> Result<(), CryptoError> {
            if data.len() < signature_length {
                return Err("Not enough space to add signature".into());
            }
            let data_length = data.len() - signature_length;
            let mut hmac = hmac.clone();
            hmac.update(&data[..data_length]);
            let hash = hmac.finalize().into_bytes();
            data[data_length..].copy_from_slice(&hash[..signature_length]);
            Ok(())
        }
        let signature_length = self.signature_length();
        match self {
            Self::HmacSha1tr96(ref hmac) => sign_with(hmac, data, signature_length),
            Self::HmacSha256tr128(ref hmac) => sign_with(hmac, data, signature_length),
            Self::HmacSha384tr192(ref hmac) => sign_with(hmac, data, signature_length),
        }
    }

    /// Checks the trailing ICV of `data` in constant time.
    pub fn validate(&self, data: &[u8]) -> bool {
        fn validate_with<M: Mac + Clone>(hmac: &M, data: &[u8], signature_length: usize) -> bool {
            if data.len() < signature_length {
                return false;
            }
            let (data, received_signature) = data.split_at(data.len() - signature_length);
            let mut hmac = hmac.clone();
            hmac.update(data);
            hmac.verify_truncated_left(received_signature).is_ok()
        }
        let signature_length = self.signature_length();
        match self {
            Self::HmacSha1tr96(ref hmac) => validate_with(hmac, data, signature_length),
            Self::HmacSha256tr128(ref hmac) => validate_with(hmac, data, signature_length),
            Self::HmacSha384tr192(ref hmac) => validate_with(hmac, data, signature_length),
        }
    }
}

#[derive(Clone)]
pub enum EncryptionAesCbc {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl EncryptionAesCbc {
    pub fn init(transform: &message::Transform, key: &[u8]) -> Result<EncryptionAesCbc, InitError> {
        if transform.transform_type != message::TransformType::ENCR_AES_CBC {
            return Err("Unsupported encryption algorithm".into());
        }
        let cipher = match key.len() {
            16 => Aes128::new_from_slice(key).map(Self::Aes128),
            24 => Aes192::new_from_slice(key).map(Self::Aes192),
            32 => Aes256::new_from_slice(key).map(Self::Aes256),
            _ => return Err("Unsupported AES key length".into()),
        };
        cipher.map_err(|_| "Failed to init AES key".into())
    }

    pub fn iv_length(&self) -> usize {
        AES_BLOCK_SIZE
    }

    /// IV + plaintext padded to a block boundary, including the Pad Length byte.
    pub fn encrypted_payload_length(&self, msg_len: usize) -> usize {
        let encrypted_size = (1 + msg_len / AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
        AES_BLOCK_SIZE + encrypted_size
    }

    /// Returns IV || ciphertext, using the RFC 7296 Section 3.14 padding.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let encrypted_payload_length = self.encrypted_payload_length(plaintext.len());
        let mut data = vec![0u8; encrypted_payload_length];
        let padded_msg_len = encrypted_payload_length - AES_BLOCK_SIZE;
        rand::thread_rng().fill(&mut data[..AES_BLOCK_SIZE]);
        data[AES_BLOCK_SIZE..AES_BLOCK_SIZE + plaintext.len()].copy_from_slice(plaintext);
        data[encrypted_payload_length - 1] = (padded_msg_len - 1 - plaintext.len()) as u8;
        let (iv, payload) = data.split_at_mut(AES_BLOCK_SIZE);
        match self {
            Self::Aes128(ref cipher) => cbc_encrypt(cipher, iv, payload)?,
            Self::Aes192(ref cipher) => cbc_encrypt(cipher, iv, payload)?,
            Self::Aes256(ref cipher) => cbc_encrypt(cipher, iv, payload)?,
        }
        Ok(data)
    }

    /// Decrypts IV || ciphertext and strips the padding.
    pub fn decrypt(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if data.len() <= AES_BLOCK_SIZE || (data.len() - AES_BLOCK_SIZE) % AES_BLOCK_SIZE != 0 {
            return Err("Encrypted data length is not valid".into());
        }
        let (iv, payload) = data.split_at(AES_BLOCK_SIZE);
        let mut plaintext = Zeroizing::new(payload.to_vec());
        match self {
            Self::Aes128(ref cipher) => cbc_decrypt(cipher, iv, &mut plaintext)?,
            Self::Aes192(ref cipher) => cbc_decrypt(cipher, iv, &mut plaintext)?,
            Self::Aes256(ref cipher) => cbc_decrypt(cipher, iv, &mut plaintext)?,
        }
        let pad_length = plaintext[plaintext.len() - 1] as usize;
        if pad_length + 1 > plaintext.len() {
            return Err("Padding length is not valid".into());
        }
        let msg_len = plaintext.len() - pad_length - 1;
        plaintext.truncate(msg_len);
        Ok(plaintext)
    }
}

fn cbc_encrypt<C>(cipher: &C, iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError>
where
    C: BlockCipher + BlockEncryptMut + Clone,
{
    let encryptor = cbc::Encryptor::<C>::inner_iv_slice_init(cipher.clone(), iv).map_err(|err| {
        debug!("Failed to init AES CBC IV: {}", err);
        "Failed to init AES CBC IV"
    })?;
    let msg_len = data.len();
    encryptor
        .encrypt_padded_mut::<NoPadding>(data, msg_len)
        .map_err(|err| {
            debug!("Failed to encode AES CBC message: {}", err);
            "Failed to encode AES CBC message"
        })?;
    Ok(())
}

fn cbc_decrypt<C>(cipher: &C, iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError>
where
    C: BlockCipher + BlockDecryptMut + Clone,
{
    let decryptor = cbc::Decryptor::<C>::inner_iv_slice_init(cipher.clone(), iv).map_err(|err| {
        debug!("Failed to init AES CBC IV: {}", err);
        "Failed to init AES CBC IV"
    })?;
    decryptor
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|err| {
            debug!("Failed to decode AES CBC message: {}", err);
            "Failed to decode AES CBC message"
        })?;
    Ok(())
}

/// Encryption and integrity keys of one IKE SA, oriented for the local endpoint.
pub struct CryptoStack {
    enc_local: EncryptionAesCbc,
    enc_remote: EncryptionAesCbc,
    integ_local: Integrity,
    integ_remote: Integrity,
}

impl CryptoStack {
    pub fn new(
        params: &SaParams,
        enc_local: &[u8],
        enc_remote: &[u8],
        integ_local: &[u8],
        integ_remote: &[u8],
    ) -> Result<CryptoStack, InitError> {
        let enc = params.enc.as_ref().ok_or("Encryption is not negotiated")?;
        let integ = params.integ.ok_or("Integrity is not negotiated")?;
        Ok(CryptoStack {
            enc_local: EncryptionAesCbc::init(enc, enc_local)?,
            enc_remote: EncryptionAesCbc::init(enc, enc_remote)?,
            integ_local: Integrity::init(integ, integ_local)?,
            integ_remote: Integrity::init(integ, integ_remote)?,
        })
    }

    pub fn signature_length(&self) -> usize {
        self.integ_local.signature_length()
    }

    pub fn encrypt_data(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.enc_local.encrypt(plaintext)
    }

    pub fn decrypt_data(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.enc_remote.decrypt(data)
    }

    pub fn sign(&self, data: &mut [u8]) -> Result<(), CryptoError> {
        self.integ_local.sign(data)
    }

    pub fn validate_signature(&self, data: &[u8]) -> bool {
        self.integ_remote.validate(data)
    }
}

pub fn random_nonce(length: usize) -> Vec<u8> {
    let mut nonce = vec![0u8; length];
    rand::thread_rng().fill(nonce.as_mut_slice());
    nonce
}

pub fn random_spi_u64() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX)
}

pub fn random_spi_u32() -> u32 {
    // Values 1-255 are reserved by IANA.
    rand::thread_rng().gen_range(256..=u32::MAX)
}

/// Produces signatures for certificate-based authentication.
pub trait CertificateSigner: Send + Sync {
    fn auth_method(&self) -> message::AuthMethod;

    fn certificates(&self) -> Vec<message::Certificate>;

    fn sign(&self, signed_octets: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Validates the peer's certificate chain and its signature over the signed octets.
pub trait CertificateVerifier: Send + Sync {
    fn verify(
        &self,
        certificates: &[message::Certificate],
        id: &message::Identification,
        auth: &message::Authentication,
        signed_octets: &[u8],
    ) -> Result<(), CryptoError>;
}

pub struct UnsupportedTransform {}

impl fmt::Display for UnsupportedTransform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Unsupported transform")
    }
}

impl fmt::Debug for UnsupportedTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for UnsupportedTransform {}

pub struct InitError {
    msg: &'static str,
}

impl InitError {
    fn new(msg: &'static str) -> InitError {
        InitError { msg }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl fmt::Debug for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for InitError {}

impl From<&'static str> for InitError {
    fn from(msg: &'static str) -> InitError {
        InitError { msg }
    }
}

pub struct CryptoError {
    msg: &'static str,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl fmt::Debug for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for CryptoError {}

impl From<&'static str> for CryptoError {
    fn from(msg: &'static str) -> CryptoError {
        CryptoError { msg }
    }
}

const DH_MODP_GENERATOR_1024: U1024 = U1024::from_u8(2);
const DH_MODP_RESIDUE_1024: constant_mod::Residue<DHModulus1024, { U1024::LIMBS }> =
    const_residue!(DH_MODP_GENERATOR_1024, DHModulus1024);

impl_modulus!(
    DHModulus1024,
    U1024,
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF"
);

const DH_MODP_GENERATOR_2048: U2048 = U2048::from_u8(2);
const DH_MODP_RESIDUE_2048: constant_mod::Residue<DHModulus2048, { U2048::LIMBS }> =
    const_residue!(DH_MODP_GENERATOR_2048, DHModulus2048);

// RFC 3526, Section 3.
impl_modulus!(
    DHModulus2048,
    U2048,
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::message::{IPSecProtocolID, Proposal, Spi, Transform, TransformType};

    fn ike_proposal(num: u8, transforms: &[(TransformType, Option<u16>)]) -> Proposal {
        Proposal {
            num,
            protocol_id: IPSecProtocolID::IKE,
            spi: Spi::None,
            transforms: transforms
                .iter()
                .map(|(t, key_length)| Transform::new(*t, *key_length))
                .collect(),
        }
    }

    #[test]
    fn prf_hmac_sha256_rfc4231() {
        // RFC 4231 test case 2.
        let prf = PseudorandomTransform::init(TransformType::PRF_HMAC_SHA2_256, b"Jefe").unwrap();
        let result = prf.prf_parts(&[&b"what do ya want "[..], &b"for nothing?"[..]]);
        let expected = [
            0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08, 0x95,
            0x75, 0xc7, 0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec, 0x58, 0xb9,
            0x64, 0xec, 0x38, 0x43,
        ];
        assert_eq!(result.as_slice(), &expected);
        assert_eq!(prf.output_length(), 32);
    }

    #[test]
    fn prf_hmac_sha1_rfc2202() {
        // RFC 2202 test case 2.
        let prf = PseudorandomTransform::init(TransformType::PRF_HMAC_SHA1, b"Jefe").unwrap();
        let result = prf.prf(b"what do ya want for nothing?");
        let expected = [
            0xef, 0xfc, 0xdf, 0x6a, 0xe5, 0xeb, 0x2f, 0xa2, 0xd2, 0x74, 0x16, 0xd5, 0xf1, 0x84,
            0xdf, 0x9c, 0x25, 0x9a, 0x7c, 0x79,
        ];
        assert_eq!(result.as_slice(), &expected);
    }

    #[test]
    fn hmac_transforms_accept_any_key_length() {
        for key in [&[][..], &[0x0b; 7][..], &[0x0b; 200][..]] {
            for transform_type in [
                TransformType::PRF_HMAC_SHA1,
                TransformType::PRF_HMAC_SHA2_256,
                TransformType::PRF_HMAC_SHA2_384,
            ] {
                let prf = PseudorandomTransform::init(transform_type, key).unwrap();
                let digest = prf.prf(b"data");
                assert_eq!(digest.len(), prf.output_length());
                assert!(prf.verify(b"data", &digest));
            }
            for transform_type in [
                TransformType::AUTH_HMAC_SHA1_96,
                TransformType::AUTH_HMAC_SHA2_256_128,
                TransformType::AUTH_HMAC_SHA2_384_192,
            ] {
                assert!(Integrity::init(transform_type, key).is_ok());
            }
        }
    }

    #[test]
    fn unsupported_prf() {
        assert!(PseudorandomTransform::init(TransformType::PRF_HMAC_MD5, b"key").is_err());
    }

    #[test]
    fn dh_agreement() {
        for transform_type in [
            TransformType::DH_1024_MODP,
            TransformType::DH_2048_MODP,
            TransformType::DH_256_ECP,
        ] {
            let alice = DHTransformType::init(transform_type).unwrap();
            let bob = DHTransformType::init(transform_type).unwrap();
            let alice_public = alice.read_public_key();
            let bob_public = bob.read_public_key();
            assert_eq!(alice_public.len(), alice.key_length_bytes());
            let alice_secret = alice.compute_shared_secret(&bob_public).unwrap();
            let bob_secret = bob.compute_shared_secret(&alice_public).unwrap();
            assert_eq!(alice_secret.as_slice(), bob_secret.as_slice());
            assert_eq!(alice_secret.len(), alice.shared_key_length_bytes());
        }
    }

    #[test]
    fn dh_rejects_invalid_public_key() {
        let dh = DHTransformType::init(TransformType::DH_2048_MODP).unwrap();
        assert!(dh.compute_shared_secret(&[0u8; 256]).is_err());
        assert!(dh.compute_shared_secret(&[0u8; 128]).is_err());
        let mut one = [0u8; 256];
        one[255] = 1;
        assert!(dh.compute_shared_secret(&one).is_err());
        assert!(DHTransformType::from_group(5).is_err());
    }

    #[test]
    fn aes_cbc_roundtrip() {
        for key_length in [128u16, 192, 256] {
            let transform = Transform::new(TransformType::ENCR_AES_CBC, Some(key_length));
            let key = vec![0x42; key_length as usize / 8];
            let enc = EncryptionAesCbc::init(&transform, &key).unwrap();
            for msg_len in [0usize, 1, 15, 16, 17, 100] {
                let plaintext = (0..msg_len).map(|i| i as u8).collect::<Vec<_>>();
                let encrypted = enc.encrypt(&plaintext).unwrap();
                assert_eq!(encrypted.len(), enc.encrypted_payload_length(msg_len));
                assert_eq!(encrypted.len() % 16, 0);
                let decrypted = enc.decrypt(&encrypted).unwrap();
                assert_eq!(decrypted.as_slice(), plaintext.as_slice());
            }
        }
    }

    #[test]
    fn aes_cbc_rejects_bad_length() {
        let transform = Transform::new(TransformType::ENCR_AES_CBC, Some(128));
        let enc = EncryptionAesCbc::init(&transform, &[1u8; 16]).unwrap();
        assert!(enc.decrypt(&[0u8; 16]).is_err());
        assert!(enc.decrypt(&[0u8; 40]).is_err());
        assert!(EncryptionAesCbc::init(&transform, &[1u8; 10]).is_err());
    }

    #[test]
    fn integrity_sign_validate() {
        for transform_type in [
            TransformType::AUTH_HMAC_SHA1_96,
            TransformType::AUTH_HMAC_SHA2_256_128,
            TransformType::AUTH_HMAC_SHA2_384_192,
        ] {
            let key_length = integrity_key_length(transform_type).unwrap();
            let integ = Integrity::init(transform_type, &vec![7u8; key_length]).unwrap();
            let mut data = vec![0x33u8; 64 + integ.signature_length()];
            integ.sign(&mut data).unwrap();
            assert!(integ.validate(&data));
            data[3] ^= 0x01;
            assert!(!integ.validate(&data));
        }
    }

    #[test]
    fn choose_first_acceptable_proposal() {
        let local = vec![ike_proposal(
            1,
            &[
                (TransformType::ENCR_AES_CBC, Some(128)),
                (TransformType::ENCR_AES_CBC, Some(256)),
                (TransformType::PRF_HMAC_SHA1, None),
                (TransformType::PRF_HMAC_SHA2_256, None),
                (TransformType::AUTH_HMAC_SHA1_96, None),
                (TransformType::DH_2048_MODP, None),
            ],
        )];
        let remote = vec![
            ike_proposal(
                1,
                &[
                    (TransformType::ENCR_AES_GCM_16, Some(256)),
                    (TransformType::PRF_HMAC_SHA2_256, None),
                    (TransformType::DH_2048_MODP, None),
                ],
            ),
            ike_proposal(
                2,
                &[
                    (TransformType::ENCR_AES_CBC, Some(256)),
                    (TransformType::ENCR_AES_CBC, Some(128)),
                    (TransformType::PRF_HMAC_SHA2_256, None),
                    (TransformType::AUTH_HMAC_SHA1_96, None),
                    (TransformType::DH_256_ECP, None),
                    (TransformType::DH_2048_MODP, None),
                ],
            ),
        ];
        let (params, proposal) = choose_sa_parameters(&local, &remote).unwrap();
        assert_eq!(proposal.num, 2);
        assert_eq!(
            params.enc,
            Some(Transform::new(TransformType::ENCR_AES_CBC, Some(256)))
        );
        assert_eq!(params.prf, Some(TransformType::PRF_HMAC_SHA2_256));
        assert_eq!(params.integ, Some(TransformType::AUTH_HMAC_SHA1_96));
        assert_eq!(params.dh_group(), Some(14));
        assert_eq!(params.enc_key_length().unwrap(), 32);
    }

    #[test]
    fn no_acceptable_proposal() {
        let local = vec![ike_proposal(
            1,
            &[
                (TransformType::ENCR_AES_CBC, Some(128)),
                (TransformType::PRF_HMAC_SHA1, None),
                (TransformType::AUTH_HMAC_SHA1_96, None),
                (TransformType::DH_2048_MODP, None),
            ],
        )];
        let remote = vec![ike_proposal(
            1,
            &[
                (TransformType::ENCR_AES_CBC, Some(128)),
                (TransformType::PRF_HMAC_SHA1, None),
                (TransformType::AUTH_HMAC_SHA1_96, None),
                (TransformType::DH_1024_MODP, None),
            ],
        )];
        assert!(choose_sa_parameters(&local, &remote).is_none());
    }

    #[test]
    fn proposal_with_unknown_attribute_is_skipped() {
        let local = vec![ike_proposal(
            1,
            &[
                (TransformType::ENCR_AES_CBC, Some(128)),
                (TransformType::PRF_HMAC_SHA1, None),
                (TransformType::AUTH_HMAC_SHA1_96, None),
                (TransformType::DH_2048_MODP, None),
            ],
        )];
        let mut remote = local.clone();
        remote[0].transforms[0].unknown_attributes = true;
        assert!(choose_sa_parameters(&local, &remote).is_none());
    }
}
