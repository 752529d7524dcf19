use log::debug;
use std::{error, fmt};
use zeroize::Zeroizing;

use super::crypto::{self, CryptoStack, InitError, PseudorandomTransform, SaParams};
use super::message;

// prf+ counter is a single octet, RFC 7296 Section 2.13.
const MAX_PRF_PLUS_BLOCKS: usize = 255;

/// Length of the SK_pi and SK_pr slices in the key stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SkPxLength {
    /// PRF key length, as required by RFC 7296.
    #[default]
    Prf,
    /// Integrity key length, for compatibility with peers deriving SK_px that way.
    Integrity,
}

/// Expands `prf` (already keyed) over `seed` into exactly `length` bytes.
pub fn prf_plus(
    prf: &PseudorandomTransform,
    seed: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, KeyDerivationError> {
    let block_length = prf.output_length();
    if length > block_length * MAX_PRF_PLUS_BLOCKS {
        debug!(
            "Requested {} bytes from prf+, maximum is {}",
            length,
            block_length * MAX_PRF_PLUS_BLOCKS
        );
        return Err(KeyDerivationError::OutputTooLong);
    }
    let mut output = Zeroizing::new(Vec::with_capacity(length + block_length));
    let mut previous = Zeroizing::new(vec![]);
    let mut counter = 1u8;
    while output.len() < length {
        let block = prf.prf_parts(&[previous.as_slice(), seed, &[counter]]);
        output.extend_from_slice(&block);
        previous = block;
        counter = counter.wrapping_add(1);
    }
    output.truncate(length);
    Ok(output)
}

/// SKEYSEED = prf(Ni | Nr, g^ir)
pub fn skeyseed(
    params: &SaParams,
    nonce_initiator: &[u8],
    nonce_responder: &[u8],
    shared_secret: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KeyDerivationError> {
    let mut key = Zeroizing::new(Vec::with_capacity(
        nonce_initiator.len() + nonce_responder.len(),
    ));
    key.extend_from_slice(nonce_initiator);
    key.extend_from_slice(nonce_responder);
    let prf = params.create_prf(&key)?;
    Ok(prf.prf(shared_secret))
}

/// SKEYSEED = prf(SK_d (old), g^ir (new) | Ni | Nr), using the PRF of the SA being rekeyed.
pub fn rekey_skeyseed(
    old_prf: message::TransformType,
    old_sk_d: &[u8],
    shared_secret: &[u8],
    nonce_initiator: &[u8],
    nonce_responder: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KeyDerivationError> {
    let prf = PseudorandomTransform::init(old_prf, old_sk_d)?;
    Ok(prf.prf_parts(&[shared_secret, nonce_initiator, nonce_responder]))
}

/// The seven IKE SA keys; either fully derived or not constructed at all.
pub struct DerivedKeySet {
    sk_d: Zeroizing<Vec<u8>>,
    sk_ai: Zeroizing<Vec<u8>>,
    sk_ar: Zeroizing<Vec<u8>>,
    sk_ei: Zeroizing<Vec<u8>>,
    sk_er: Zeroizing<Vec<u8>>,
    sk_pi: Zeroizing<Vec<u8>>,
    sk_pr: Zeroizing<Vec<u8>>,
}

impl DerivedKeySet {
    pub fn key_material_length(
        params: &SaParams,
        sk_px: SkPxLength,
    ) -> Result<usize, KeyDerivationError> {
        let prf_length = params.prf_key_length()?;
        let integ_length = params.integ_key_length()?;
        let enc_length = params.enc_key_length()?;
        let px_length = match sk_px {
            SkPxLength::Prf => prf_length,
            SkPxLength::Integrity => integ_length,
        };
        Ok(prf_length + 2 * integ_length + 2 * enc_length + 2 * px_length)
    }

    /// {SK_d | SK_ai | SK_ar | SK_ei | SK_er | SK_pi | SK_pr} = prf+(SKEYSEED, Ni | Nr | SPIi | SPIr)
    pub fn derive(
        params: &SaParams,
        skeyseed: &[u8],
        nonce_initiator: &[u8],
        nonce_responder: &[u8],
        spi_initiator: u64,
        spi_responder: u64,
        sk_px: SkPxLength,
    ) -> Result<DerivedKeySet, KeyDerivationError> {
        let prf_length = params.prf_key_length()?;
        let integ_length = params.integ_key_length()?;
        let enc_length = params.enc_key_length()?;
        let px_length = match sk_px {
            SkPxLength::Prf => prf_length,
            SkPxLength::Integrity => integ_length,
        };
        let total_length = Self::key_material_length(params, sk_px)?;

        let prf = params.create_prf(skeyseed)?;
        let mut seed = Vec::with_capacity(nonce_initiator.len() + nonce_responder.len() + 16);
        seed.extend_from_slice(nonce_initiator);
        seed.extend_from_slice(nonce_responder);
        seed.extend_from_slice(&spi_initiator.to_be_bytes());
        seed.extend_from_slice(&spi_responder.to_be_bytes());
        let stream = prf_plus(&prf, &seed, total_length)?;

        let mut cursor = 0;
        let mut next_key = |length: usize| {
            let key = Zeroizing::new(stream[cursor..cursor + length].to_vec());
            cursor += length;
            key
        };
        Ok(DerivedKeySet {
            sk_d: next_key(prf_length),
            sk_ai: next_key(integ_length),
            sk_ar: next_key(integ_length),
            sk_ei: next_key(enc_length),
            sk_er: next_key(enc_length),
            sk_pi: next_key(px_length),
            sk_pr: next_key(px_length),
        })
    }

    pub fn sk_d(&self) -> &[u8] {
        &self.sk_d
    }

    pub fn sk_ai(&self) -> &[u8] {
        &self.sk_ai
    }

    pub fn sk_ar(&self) -> &[u8] {
        &self.sk_ar
    }

    pub fn sk_ei(&self) -> &[u8] {
        &self.sk_ei
    }

    pub fn sk_er(&self) -> &[u8] {
        &self.sk_er
    }

    pub fn sk_pi(&self) -> &[u8] {
        &self.sk_pi
    }

    pub fn sk_pr(&self) -> &[u8] {
        &self.sk_pr
    }

    /// SK_pi for the initiator's AUTH payload, SK_pr for the responder's.
    pub fn sk_p(&self, initiator: bool) -> &[u8] {
        if initiator {
            &self.sk_pi
        } else {
            &self.sk_pr
        }
    }

    pub fn crypto_stack(
        &self,
        params: &SaParams,
        is_initiator: bool,
    ) -> Result<CryptoStack, InitError> {
        if is_initiator {
            CryptoStack::new(params, &self.sk_ei, &self.sk_er, &self.sk_ai, &self.sk_ar)
        } else {
            CryptoStack::new(params, &self.sk_er, &self.sk_ei, &self.sk_ar, &self.sk_ai)
        }
    }
}

impl fmt::Debug for DerivedKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key values are never printed.
        f.debug_struct("DerivedKeySet")
            .field("sk_d", &self.sk_d.len())
            .field("sk_a", &self.sk_ai.len())
            .field("sk_e", &self.sk_ei.len())
            .field("sk_p", &self.sk_pi.len())
            .finish()
    }
}

/// Algorithm IDs and keys for one direction of an ESP SA.
pub struct EspAlgoInfo {
    pub enc: message::Transform,
    pub integ: Option<message::TransformType>,
    pub enc_key: Zeroizing<Vec<u8>>,
    pub integ_key: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for EspAlgoInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EspAlgoInfo")
            .field("enc", &self.enc)
            .field("integ", &self.integ)
            .field("enc_key_length", &self.enc_key.len())
            .field("integ_key_length", &self.integ_key.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct ChildKeymats {
    pub outbound: EspAlgoInfo,
    pub inbound: EspAlgoInfo,
}

impl ChildKeymats {
    /// KEYMAT = prf+(SK_d, [g^ir (new) |] Ni | Nr)
    pub fn derive(
        params: &SaParams,
        ike_prf: message::TransformType,
        sk_d: &[u8],
        pfs_secret: Option<&[u8]>,
        nonce_initiator: &[u8],
        nonce_responder: &[u8],
        is_initiator: bool,
    ) -> Result<ChildKeymats, KeyDerivationError> {
        let enc = params
            .enc
            .clone()
            .ok_or(KeyDerivationError::UnsupportedAlgorithm)?;
        let enc_length = params.enc_key_length()?;
        let integ_length = params.integ_key_length()?;

        let prf = PseudorandomTransform::init(ike_prf, sk_d)?;
        let pfs_secret = pfs_secret.unwrap_or(&[]);
        let mut seed = Zeroizing::new(Vec::with_capacity(
            pfs_secret.len() + nonce_initiator.len() + nonce_responder.len(),
        ));
        seed.extend_from_slice(pfs_secret);
        seed.extend_from_slice(nonce_initiator);
        seed.extend_from_slice(nonce_responder);
        let keymat = prf_plus(&prf, &seed, 2 * (enc_length + integ_length))?;

        let (initiator_keys, responder_keys) = keymat.split_at(enc_length + integ_length);
        let algo_info = |keys: &[u8]| EspAlgoInfo {
            enc: enc.clone(),
            integ: params.integ,
            enc_key: Zeroizing::new(keys[..enc_length].to_vec()),
            integ_key: Zeroizing::new(keys[enc_length..].to_vec()),
        };
        let initiator_to_responder = algo_info(initiator_keys);
        let responder_to_initiator = algo_info(responder_keys);
        if is_initiator {
            Ok(ChildKeymats {
                outbound: initiator_to_responder,
                inbound: responder_to_initiator,
            })
        } else {
            Ok(ChildKeymats {
                outbound: responder_to_initiator,
                inbound: initiator_to_responder,
            })
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum KeyDerivationError {
    UnsupportedAlgorithm,
    OutputTooLong,
}

impl fmt::Display for KeyDerivationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnsupportedAlgorithm => write!(f, "Unsupported algorithm"),
            Self::OutputTooLong => write!(f, "Requested key material is too long"),
        }
    }
}

impl error::Error for KeyDerivationError {}

impl From<crypto::UnsupportedTransform> for KeyDerivationError {
    fn from(_: crypto::UnsupportedTransform) -> KeyDerivationError {
        Self::UnsupportedAlgorithm
    }
}

impl From<InitError> for KeyDerivationError {
    fn from(err: InitError) -> KeyDerivationError {
        debug!("Failed to init PRF: {}", err);
        Self::UnsupportedAlgorithm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::message::{IPSecProtocolID, Transform, TransformType};

    fn sa_params(prf: TransformType, integ: TransformType, key_length: u16) -> SaParams {
        SaParams {
            protocol_id: IPSecProtocolID::IKE,
            enc: Some(Transform::new(TransformType::ENCR_AES_CBC, Some(key_length))),
            prf: Some(prf),
            integ: Some(integ),
            dh: Some(TransformType::DH_2048_MODP),
            esn: None,
        }
    }

    #[test]
    fn prf_plus_lengths() {
        let prf = PseudorandomTransform::init(TransformType::PRF_HMAC_SHA1, b"key").unwrap();
        for length in [0, 1, 19, 20, 21, 100, 20 * 255] {
            assert_eq!(prf_plus(&prf, b"seed", length).unwrap().len(), length);
        }
        assert_eq!(
            prf_plus(&prf, b"seed", 20 * 255 + 1).unwrap_err(),
            KeyDerivationError::OutputTooLong
        );
    }

    #[test]
    fn prf_plus_blocks() {
        let prf = PseudorandomTransform::init(TransformType::PRF_HMAC_SHA2_256, b"key").unwrap();
        let output = prf_plus(&prf, b"seed", 80).unwrap();
        let t1 = prf.prf(b"seed\x01");
        let t2 = prf.prf_parts(&[t1.as_slice(), &b"seed"[..], &[2]]);
        let t3 = prf.prf_parts(&[t2.as_slice(), &b"seed"[..], &[3]]);
        assert_eq!(&output[..32], t1.as_slice());
        assert_eq!(&output[32..64], t2.as_slice());
        assert_eq!(&output[64..80], &t3[..16]);
    }

    #[test]
    fn derive_sa_keys_sha1() {
        let params = sa_params(
            TransformType::PRF_HMAC_SHA1,
            TransformType::AUTH_HMAC_SHA1_96,
            128,
        );
        let ni = [0x11u8; 20];
        let nr = [0x22u8; 20];
        let shared_secret = [0x33u8; 128];
        let skeyseed = skeyseed(&params, &ni, &nr, &shared_secret).unwrap();
        assert_eq!(skeyseed.len(), 20);

        let length = DerivedKeySet::key_material_length(&params, SkPxLength::Prf).unwrap();
        // SK_d, SK_ai/ar, SK_ei/er, then SK_pi/pr sized by the PRF key length.
        assert_eq!(length, 20 + 2 * 20 + 2 * 16 + 2 * 20);

        let keys = DerivedKeySet::derive(
            &params,
            &skeyseed,
            &ni,
            &nr,
            0x1122334455667788,
            0x99aabbccddeeff00,
            SkPxLength::Prf,
        )
        .unwrap();
        assert_eq!(keys.sk_d().len(), 20);
        assert_eq!(keys.sk_ai().len(), 20);
        assert_eq!(keys.sk_ei().len(), 16);
        assert_eq!(keys.sk_pr().len(), 20);

        // Slices follow the prf+ stream order.
        let prf = params.create_prf(&skeyseed).unwrap();
        let mut seed = vec![];
        seed.extend_from_slice(&ni);
        seed.extend_from_slice(&nr);
        seed.extend_from_slice(&0x1122334455667788u64.to_be_bytes());
        seed.extend_from_slice(&0x99aabbccddeeff00u64.to_be_bytes());
        let stream = prf_plus(&prf, &seed, length).unwrap();
        assert_eq!(keys.sk_d(), &stream[0..20]);
        assert_eq!(keys.sk_ai(), &stream[20..40]);
        assert_eq!(keys.sk_ar(), &stream[40..60]);
        assert_eq!(keys.sk_ei(), &stream[60..76]);
        assert_eq!(keys.sk_er(), &stream[76..92]);
        assert_eq!(keys.sk_pi(), &stream[92..112]);
        assert_eq!(keys.sk_pr(), &stream[112..132]);
    }

    #[test]
    fn derive_is_deterministic() {
        let params = sa_params(
            TransformType::PRF_HMAC_SHA2_256,
            TransformType::AUTH_HMAC_SHA2_256_128,
            256,
        );
        let derive = || {
            let skeyseed = skeyseed(&params, &[1u8; 32], &[2u8; 32], &[3u8; 256]).unwrap();
            DerivedKeySet::derive(&params, &skeyseed, &[1u8; 32], &[2u8; 32], 5, 6, SkPxLength::Prf)
                .unwrap()
        };
        let first = derive();
        let second = derive();
        assert_eq!(first.sk_d(), second.sk_d());
        assert_eq!(first.sk_ei(), second.sk_ei());
        assert_eq!(first.sk_pr(), second.sk_pr());
        assert_ne!(first.sk_pi(), first.sk_pr());
    }

    #[test]
    fn sk_px_length_option() {
        let params = sa_params(
            TransformType::PRF_HMAC_SHA2_256,
            TransformType::AUTH_HMAC_SHA1_96,
            128,
        );
        let keys = |sk_px| {
            DerivedKeySet::derive(&params, &[9u8; 32], &[1u8; 16], &[2u8; 16], 1, 2, sk_px)
                .unwrap()
        };
        let rfc = keys(SkPxLength::Prf);
        let legacy = keys(SkPxLength::Integrity);
        assert_eq!(rfc.sk_pi().len(), 32);
        assert_eq!(legacy.sk_pi().len(), 20);
        // Everything before SK_pi is unaffected.
        assert_eq!(rfc.sk_er(), legacy.sk_er());
        assert_eq!(&rfc.sk_pi()[..20], legacy.sk_pi());
    }

    #[test]
    fn unsupported_algorithm_fails() {
        let mut params = sa_params(
            TransformType::PRF_HMAC_MD5,
            TransformType::AUTH_HMAC_SHA1_96,
            128,
        );
        assert_eq!(
            skeyseed(&params, &[1u8; 16], &[2u8; 16], &[3u8; 32]).unwrap_err(),
            KeyDerivationError::UnsupportedAlgorithm
        );
        params.prf = Some(TransformType::PRF_HMAC_SHA1);
        params.enc = Some(Transform::new(TransformType::ENCR_3DES, None));
        assert!(matches!(
            DerivedKeySet::derive(&params, &[1u8; 20], &[1u8; 16], &[2u8; 16], 1, 2, SkPxLength::Prf),
            Err(KeyDerivationError::UnsupportedAlgorithm)
        ));
    }

    #[test]
    fn child_keymats_roles() {
        let params = SaParams {
            protocol_id: IPSecProtocolID::ESP,
            enc: Some(Transform::new(TransformType::ENCR_AES_CBC, Some(256))),
            prf: None,
            integ: Some(TransformType::AUTH_HMAC_SHA2_256_128),
            dh: None,
            esn: Some(TransformType::NO_ESN),
        };
        let sk_d = [0x44u8; 32];
        let derive = |pfs: Option<&[u8]>, is_initiator| {
            ChildKeymats::derive(
                &params,
                TransformType::PRF_HMAC_SHA2_256,
                &sk_d,
                pfs,
                &[1u8; 32],
                &[2u8; 32],
                is_initiator,
            )
            .unwrap()
        };
        let initiator = derive(None, true);
        let responder = derive(None, false);
        assert_eq!(initiator.outbound.enc_key.len(), 32);
        assert_eq!(initiator.outbound.integ_key.len(), 32);
        assert_eq!(initiator.outbound.enc_key, responder.inbound.enc_key);
        assert_eq!(initiator.outbound.integ_key, responder.inbound.integ_key);
        assert_eq!(initiator.inbound.enc_key, responder.outbound.enc_key);
        assert_ne!(initiator.outbound.enc_key, initiator.inbound.enc_key);

        let with_pfs = derive(Some(&[7u8; 256]), true);
        assert_ne!(with_pfs.outbound.enc_key, initiator.outbound.enc_key);
    }

    #[test]
    fn rekey_skeyseed_uses_old_sk_d() {
        let first = rekey_skeyseed(
            TransformType::PRF_HMAC_SHA1,
            &[1u8; 20],
            &[2u8; 128],
            &[3u8; 16],
            &[4u8; 16],
        )
        .unwrap();
        let second = rekey_skeyseed(
            TransformType::PRF_HMAC_SHA1,
            &[5u8; 20],
            &[2u8; 128],
            &[3u8; 16],
            &[4u8; 16],
        )
        .unwrap();
        assert_eq!(first.len(), 20);
        assert_ne!(first, second);
    }
}
