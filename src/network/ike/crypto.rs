use crate::network::ike::proposal::{Proposal, TransformType};
use crate::network::ike::sa::IKESaId;
use crate::network::ike::IKEError;
use rand::SecureRandom;
use ring::{agreement, hmac, rand};
use std::sync::Arc;

// Key exchange method transform IDs (IANA transform type 4)
pub const MODP_1024: u16 = 2;
pub const MODP_2048: u16 = 14;
pub const MODP_3072: u16 = 15;
pub const MODP_4096: u16 = 16;
pub const ECP_256: u16 = 19;
pub const ECP_384: u16 = 20;
pub const CURVE_25519: u16 = 31;
pub const MLKEM_768: u16 = 36;

pub fn ke_method_name(method: u16) -> &'static str {
    match method {
        MODP_1024 => "MODP_1024",
        MODP_2048 => "MODP_2048",
        MODP_3072 => "MODP_3072",
        MODP_4096 => "MODP_4096",
        ECP_256 => "ECP_256",
        ECP_384 => "ECP_384",
        CURVE_25519 => "CURVE_25519",
        MLKEM_768 => "MLKEM_768",
        _ => "UNKNOWN",
    }
}

/// One side of a key exchange. Implementations own the ephemeral private key;
/// applying the peer's public value makes the shared secret available.
pub trait KeyExchange: Send + Sync {
    fn method(&self) -> u16;
    fn public_key(&self) -> Result<Vec<u8>, IKEError>;
    fn set_public_key(&mut self, data: &[u8]) -> Result<(), IKEError>;
    fn shared_secret(&self) -> Result<Vec<u8>, IKEError>;
}

/// Factory seam for key exchange backends. The default provider covers the
/// ECDH methods ring implements; integrators plug in MODP/ML-KEM backends.
pub trait KeyExchangeProvider: Send + Sync {
    fn create_ke(&self, method: u16) -> Option<Box<dyn KeyExchange>>;
}

pub struct RingKeyExchangeProvider;

impl KeyExchangeProvider for RingKeyExchangeProvider {
    fn create_ke(&self, method: u16) -> Option<Box<dyn KeyExchange>> {
        let algorithm = match method {
            ECP_256 => &agreement::ECDH_P256,
            ECP_384 => &agreement::ECDH_P384,
            CURVE_25519 => &agreement::X25519,
            _ => return None,
        };
        RingKeyExchange::new(method, algorithm)
            .ok()
            .map(|ke| Box::new(ke) as Box<dyn KeyExchange>)
    }
}

struct RingKeyExchange {
    method: u16,
    algorithm: &'static agreement::Algorithm,
    private_key: Option<agreement::EphemeralPrivateKey>,
    public_key: Vec<u8>,
    shared_secret: Option<Vec<u8>>,
}

impl RingKeyExchange {
    fn new(method: u16, algorithm: &'static agreement::Algorithm) -> Result<Self, IKEError> {
        let rng = rand::SystemRandom::new();
        let private_key = agreement::EphemeralPrivateKey::generate(algorithm, &rng)
            .map_err(|e| IKEError::Crypto(format!("Key pair generation failed: {:?}", e)))?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|e| IKEError::Crypto(format!("Public key computation failed: {:?}", e)))?
            .as_ref()
            .to_vec();

        Ok(RingKeyExchange {
            method,
            algorithm,
            private_key: Some(private_key),
            public_key,
            shared_secret: None,
        })
    }
}

impl KeyExchange for RingKeyExchange {
    fn method(&self) -> u16 {
        self.method
    }

    fn public_key(&self) -> Result<Vec<u8>, IKEError> {
        Ok(self.public_key.clone())
    }

    fn set_public_key(&mut self, data: &[u8]) -> Result<(), IKEError> {
        let private_key = self
            .private_key
            .take()
            .ok_or_else(|| IKEError::Crypto("Key exchange already completed".to_string()))?;
        let peer = agreement::UnparsedPublicKey::new(self.algorithm, data.to_vec());

        let secret = agreement::agree_ephemeral(private_key, &peer, |secret| secret.to_vec())
            .map_err(|e| IKEError::Crypto(format!("Key agreement failed: {:?}", e)))?;
        self.shared_secret = Some(secret);
        Ok(())
    }

    fn shared_secret(&self) -> Result<Vec<u8>, IKEError> {
        self.shared_secret
            .clone()
            .ok_or_else(|| IKEError::Crypto("Shared secret not yet computed".to_string()))
    }
}

pub struct NonceGenerator {
    rng: rand::SystemRandom,
}

impl NonceGenerator {
    pub fn new() -> Self {
        NonceGenerator {
            rng: rand::SystemRandom::new(),
        }
    }

    pub fn allocate_nonce(&self, size: usize) -> Result<Vec<u8>, IKEError> {
        let mut nonce = vec![0u8; size];
        self.rng
            .fill(&mut nonce)
            .map_err(|e| IKEError::Crypto(format!("Nonce generation failed: {:?}", e)))?;
        Ok(nonce)
    }
}

impl Default for NonceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash algorithms negotiable for signature authentication (RFC 7427).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum HashAlgorithm {
    Sha1 = 1,
    Sha256 = 2,
    Sha384 = 3,
    Sha512 = 4,
}

impl HashAlgorithm {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(HashAlgorithm::Sha1),
            2 => Some(HashAlgorithm::Sha256),
            3 => Some(HashAlgorithm::Sha384),
            4 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Whether the algorithm may be announced for IKEv2 signature
    /// authentication (SHA-1 is excluded).
    pub fn usable_for_ikev2(self) -> bool {
        !matches!(self, HashAlgorithm::Sha1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfAlgorithm {
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl PrfAlgorithm {
    pub fn from_transform_id(id: u16) -> Option<Self> {
        match id {
            crate::network::ike::proposal::PRF_HMAC_SHA2_256 => Some(PrfAlgorithm::HmacSha256),
            crate::network::ike::proposal::PRF_HMAC_SHA2_384 => Some(PrfAlgorithm::HmacSha384),
            crate::network::ike::proposal::PRF_HMAC_SHA2_512 => Some(PrfAlgorithm::HmacSha512),
            _ => None,
        }
    }

    fn hmac_algorithm(self) -> hmac::Algorithm {
        match self {
            PrfAlgorithm::HmacSha256 => hmac::HMAC_SHA256,
            PrfAlgorithm::HmacSha384 => hmac::HMAC_SHA384,
            PrfAlgorithm::HmacSha512 => hmac::HMAC_SHA512,
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha256 => 32,
            PrfAlgorithm::HmacSha384 => 48,
            PrfAlgorithm::HmacSha512 => 64,
        }
    }

    fn prf(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let key = hmac::Key::new(self.hmac_algorithm(), key);
        hmac::sign(&key, data).as_ref().to_vec()
    }
}

/// prf+ keying material expansion (RFC 7296 section 2.13).
fn prf_plus(prf: PrfAlgorithm, key: &[u8], seed: &[u8], length: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(length);
    let mut block = Vec::new();
    let mut counter = 1u8;
    while out.len() < length {
        let mut data = block.clone();
        data.extend_from_slice(seed);
        data.push(counter);
        block = prf.prf(key, &data);
        out.extend_from_slice(&block);
        counter += 1;
    }
    out.truncate(length);
    out
}

const ENCRYPTION_KEY_LEN: usize = 32;

/// Key material derived for one IKE_SA.
#[derive(Debug, Default, Clone)]
pub struct IKEKeyring {
    pub sk_d: Vec<u8>,
    pub sk_ai: Vec<u8>,
    pub sk_ar: Vec<u8>,
    pub sk_ei: Vec<u8>,
    pub sk_er: Vec<u8>,
    pub sk_pi: Vec<u8>,
    pub sk_pr: Vec<u8>,
}

/// Keymat engine of one IKE_SA: creates nonce generators and key exchange
/// objects, collects negotiated signature hash algorithms, and derives the
/// SA's key material.
pub struct IKEKeymat {
    provider: Arc<dyn KeyExchangeProvider>,
    prf: Option<PrfAlgorithm>,
    keys: Option<IKEKeyring>,
    hash_algorithms: Vec<HashAlgorithm>,
}

impl IKEKeymat {
    pub fn new(provider: Arc<dyn KeyExchangeProvider>) -> Self {
        IKEKeymat {
            provider,
            prf: None,
            keys: None,
            hash_algorithms: Vec::new(),
        }
    }

    pub fn create_nonce_gen(&self) -> NonceGenerator {
        NonceGenerator::new()
    }

    pub fn create_ke(&self, method: u16) -> Option<Box<dyn KeyExchange>> {
        self.provider.create_ke(method)
    }

    pub fn add_hash_algorithm(&mut self, algorithm: HashAlgorithm) {
        if !self.hash_algorithms.contains(&algorithm) {
            self.hash_algorithms.push(algorithm);
        }
    }

    pub fn hash_algorithms(&self) -> &[HashAlgorithm] {
        &self.hash_algorithms
    }

    /// Hash algorithms we can announce when the peer configuration does not
    /// constrain them.
    pub fn supported_hash_algorithms(&self) -> Vec<HashAlgorithm> {
        vec![
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha384,
            HashAlgorithm::Sha512,
        ]
    }

    /// SK_d and the PRF it was derived with, available once keys exist.
    /// Seeds the derivation of a rekeyed or followup SA.
    pub fn skd(&self) -> Option<(PrfAlgorithm, Vec<u8>)> {
        match (self.prf, &self.keys) {
            (Some(prf), Some(keys)) if !keys.sk_d.is_empty() => Some((prf, keys.sk_d.clone())),
            _ => None,
        }
    }

    pub fn keys(&self) -> Option<&IKEKeyring> {
        self.keys.as_ref()
    }

    /// Derive the IKE_SA keys from the completed key exchanges and nonces
    /// (RFC 7296 section 2.14; RFC 9370 for multiple key exchanges).
    ///
    /// Without `inherited` material this is an initial derivation seeded from
    /// the nonces alone; with it, SKEYSEED is computed from the inherited
    /// SK_d, covering both rekeying and followup exchanges.
    pub fn derive_ike_keys(
        &mut self,
        proposal: &Proposal,
        kes: &[&dyn KeyExchange],
        nonce_i: &[u8],
        nonce_r: &[u8],
        id: &IKESaId,
        inherited: Option<(PrfAlgorithm, Vec<u8>)>,
    ) -> Result<(), IKEError> {
        let prf_id = proposal
            .get_algorithm(TransformType::PseudoRandomFunction)
            .ok_or_else(|| IKEError::Protocol("Proposal lacks a PRF transform".to_string()))?;
        let prf = PrfAlgorithm::from_transform_id(prf_id)
            .ok_or_else(|| IKEError::Crypto(format!("PRF transform {} not supported", prf_id)))?;

        if kes.is_empty() {
            return Err(IKEError::Crypto("No key exchange completed".to_string()));
        }
        let mut g_ir = Vec::new();
        for ke in kes {
            g_ir.extend_from_slice(&ke.shared_secret()?);
        }

        let skeyseed = match &inherited {
            Some((old_prf, sk_d)) => {
                let mut data = g_ir.clone();
                data.extend_from_slice(nonce_i);
                data.extend_from_slice(nonce_r);
                old_prf.prf(sk_d, &data)
            }
            None => {
                let mut key = nonce_i.to_vec();
                key.extend_from_slice(nonce_r);
                prf.prf(&key, &g_ir)
            }
        };

        let mut seed = nonce_i.to_vec();
        seed.extend_from_slice(nonce_r);
        seed.extend_from_slice(&id.initiator_spi.to_be_bytes());
        seed.extend_from_slice(&id.responder_spi.to_be_bytes());

        let prf_len = prf.digest_len();
        let total = prf_len * 5 + ENCRYPTION_KEY_LEN * 2;
        let material = prf_plus(prf, &skeyseed, &seed, total);

        let mut keys = IKEKeyring::default();
        let mut offset = 0;
        let next = |len: usize, offset: &mut usize| {
            let part = material[*offset..*offset + len].to_vec();
            *offset += len;
            part
        };
        keys.sk_d = next(prf_len, &mut offset);
        keys.sk_ai = next(prf_len, &mut offset);
        keys.sk_ar = next(prf_len, &mut offset);
        keys.sk_ei = next(ENCRYPTION_KEY_LEN, &mut offset);
        keys.sk_er = next(ENCRYPTION_KEY_LEN, &mut offset);
        keys.sk_pi = next(prf_len, &mut offset);
        keys.sk_pr = next(prf_len, &mut offset);

        self.prf = Some(prf);
        self.keys = Some(keys);
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Deterministic key exchange used by state machine tests, standing in
    /// for methods the ring provider does not implement.
    pub struct MockKeyExchange {
        method: u16,
        applied: bool,
        fail_apply: bool,
        fail_public: bool,
        fail_secret: bool,
    }

    impl KeyExchange for MockKeyExchange {
        fn method(&self) -> u16 {
            self.method
        }

        fn public_key(&self) -> Result<Vec<u8>, IKEError> {
            if self.fail_public {
                return Err(IKEError::Crypto("Public key unavailable".to_string()));
            }
            Ok(self.method.to_be_bytes().repeat(16))
        }

        fn set_public_key(&mut self, _data: &[u8]) -> Result<(), IKEError> {
            if self.fail_apply {
                return Err(IKEError::Crypto("Invalid public value".to_string()));
            }
            self.applied = true;
            Ok(())
        }

        fn shared_secret(&self) -> Result<Vec<u8>, IKEError> {
            if self.fail_secret {
                return Err(IKEError::Crypto("Shared secret computation failed".to_string()));
            }
            if !self.applied {
                return Err(IKEError::Crypto("Shared secret not yet computed".to_string()));
            }
            // both sides agree by construction
            Ok(self.method.to_le_bytes().repeat(16))
        }
    }

    /// Provider accepting a fixed set of methods, all backed by
    /// [MockKeyExchange]. The failure flags model backends that reject the
    /// peer's value, or that fail only after it was applied.
    pub struct MockKeyExchangeProvider {
        pub supported: Vec<u16>,
        pub fail_apply: bool,
        pub fail_public: bool,
        pub fail_secret: bool,
    }

    impl MockKeyExchangeProvider {
        pub fn new(supported: &[u16]) -> Self {
            MockKeyExchangeProvider {
                supported: supported.to_vec(),
                fail_apply: false,
                fail_public: false,
                fail_secret: false,
            }
        }
    }

    impl KeyExchangeProvider for MockKeyExchangeProvider {
        fn create_ke(&self, method: u16) -> Option<Box<dyn KeyExchange>> {
            if !self.supported.contains(&method) {
                return None;
            }
            Some(Box::new(MockKeyExchange {
                method,
                applied: false,
                fail_apply: self.fail_apply,
                fail_public: self.fail_public,
                fail_secret: self.fail_secret,
            }))
        }
    }
}
