use crate::network::ike::bus::{Bus, LoggingBus};
use crate::network::ike::crypto::{
    HashAlgorithm, IKEKeymat, KeyExchangeProvider, RingKeyExchangeProvider,
};
use crate::network::ike::message::GatewayIdentity;
use crate::network::ike::proposal::{select_proposal, Proposal, SelectionFlags, TransformType};
use crate::network::ike::{Extension, IKEError, IKEState};
use rand::SecureRandom;
use ring::rand;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IKESaId {
    pub initiator_spi: u64,
    pub responder_spi: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentationPolicy {
    No,
    Accept,
    Yes,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildlessPolicy {
    Never,
    Allow,
    Force,
}

/// Connection-level IKE configuration: the proposals we offer or accept and
/// the negotiation policies tied to them.
#[derive(Debug, Clone)]
pub struct IKEConfig {
    pub name: String,
    pub proposals: Vec<Proposal>,
    pub fragmentation: FragmentationPolicy,
    pub childless: ChildlessPolicy,
}

impl IKEConfig {
    pub fn new(name: &str, proposals: Vec<Proposal>) -> Self {
        IKEConfig {
            name: name.to_string(),
            proposals,
            fragmentation: FragmentationPolicy::Yes,
            childless: ChildlessPolicy::Allow,
        }
    }

    pub fn select_proposal(
        &self,
        supplied: &[Proposal],
        flags: SelectionFlags,
    ) -> Option<Proposal> {
        select_proposal(&self.proposals, supplied, flags)
    }

    /// The key exchange method we would offer first.
    pub fn first_ke_method(&self) -> Option<u16> {
        self.proposals
            .iter()
            .find_map(|p| p.get_algorithm(TransformType::KeyExchangeMethod))
    }
}

/// One authentication round of a peer configuration. Only the hash
/// algorithms of its signature scheme constraints matter here.
#[derive(Debug, Clone, Default)]
pub struct AuthRound {
    pub signature_hashes: Vec<HashAlgorithm>,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub name: String,
    pub ppk_id: Option<String>,
    pub auth_rounds: Vec<AuthRound>,
}

impl PeerConfig {
    pub fn new(name: &str) -> Self {
        PeerConfig {
            name: name.to_string(),
            ppk_id: None,
            auth_rounds: Vec::new(),
        }
    }
}

/// Lookup of alternative IKE configurations for a local/remote address pair,
/// used by the responder when the active config matches no proposal.
pub trait ConfigBackend: Send + Sync {
    fn ike_configs(&self, local: IpAddr, remote: IpAddr) -> Vec<IKEConfig>;
}

pub struct NoConfigBackend;

impl ConfigBackend for NoConfigBackend {
    fn ike_configs(&self, _local: IpAddr, _remote: IpAddr) -> Vec<IKEConfig> {
        Vec::new()
    }
}

/// Responder-side redirect decision (RFC 5685): where to send a connecting
/// client instead of serving it here.
pub trait RedirectPolicy: Send + Sync {
    fn redirect_on_init(&self, sa: &IKESession) -> Option<GatewayIdentity>;
}

pub struct NoRedirectPolicy;

impl RedirectPolicy for NoRedirectPolicy {
    fn redirect_on_init(&self, _sa: &IKESession) -> Option<GatewayIdentity> {
        None
    }
}

/// Credential lookup as far as this exchange needs it.
pub trait CredentialStore: Send + Sync {
    /// Whether at least one post-quantum pre-shared key is available.
    fn have_ppk(&self) -> bool;
}

pub struct NoCredentials;

impl CredentialStore for NoCredentials {
    fn have_ppk(&self) -> bool {
        false
    }
}

/// Injected collaborators of an IKE_SA.
pub struct SessionServices {
    pub bus: Arc<dyn Bus>,
    pub backends: Arc<dyn ConfigBackend>,
    pub redirect: Arc<dyn RedirectPolicy>,
    pub credentials: Arc<dyn CredentialStore>,
    pub ke_provider: Arc<dyn KeyExchangeProvider>,
}

impl Default for SessionServices {
    fn default() -> Self {
        SessionServices {
            bus: Arc::new(LoggingBus),
            backends: Arc::new(NoConfigBackend),
            redirect: Arc::new(NoRedirectPolicy),
            credentials: Arc::new(NoCredentials),
            ke_provider: Arc::new(RingKeyExchangeProvider),
        }
    }
}

/// One IKE_SA: identity, negotiation state, configuration and the services
/// the handshake tasks consult.
pub struct IKESession {
    id: IKESaId,
    state: IKEState,
    local_addr: IpAddr,
    remote_addr: IpAddr,
    ike_cfg: IKEConfig,
    peer_cfg: PeerConfig,
    proposal: Option<Proposal>,
    extensions: HashSet<Extension>,
    keymat: IKEKeymat,
    bus: Arc<dyn Bus>,
    backends: Arc<dyn ConfigBackend>,
    redirect: Arc<dyn RedirectPolicy>,
    credentials: Arc<dyn CredentialStore>,
    redirected_from: Option<GatewayIdentity>,
    redirect_target: Option<GatewayIdentity>,
}

fn allocate_spi() -> Result<u64, IKEError> {
    let rng = rand::SystemRandom::new();
    let mut spi = [0u8; 8];
    rng.fill(&mut spi)
        .map_err(|e| IKEError::Crypto(format!("RNG error: {:?}", e)))?;
    Ok(u64::from_be_bytes(spi))
}

impl IKESession {
    pub fn new_initiator(
        local_addr: IpAddr,
        remote_addr: IpAddr,
        ike_cfg: IKEConfig,
        peer_cfg: PeerConfig,
        services: SessionServices,
    ) -> Result<Self, IKEError> {
        let mut session = Self::new(local_addr, remote_addr, ike_cfg, peer_cfg, services)?;
        session.id.initiator_spi = allocate_spi()?;
        Ok(session)
    }

    pub fn new_responder(
        local_addr: IpAddr,
        remote_addr: IpAddr,
        initiator_spi: u64,
        ike_cfg: IKEConfig,
        peer_cfg: PeerConfig,
        services: SessionServices,
    ) -> Result<Self, IKEError> {
        let mut session = Self::new(local_addr, remote_addr, ike_cfg, peer_cfg, services)?;
        session.id.initiator_spi = initiator_spi;
        session.id.responder_spi = allocate_spi()?;
        Ok(session)
    }

    fn new(
        local_addr: IpAddr,
        remote_addr: IpAddr,
        ike_cfg: IKEConfig,
        peer_cfg: PeerConfig,
        services: SessionServices,
    ) -> Result<Self, IKEError> {
        Ok(IKESession {
            id: IKESaId::default(),
            state: IKEState::Created,
            local_addr,
            remote_addr,
            ike_cfg,
            peer_cfg,
            proposal: None,
            extensions: HashSet::new(),
            keymat: IKEKeymat::new(services.ke_provider),
            bus: services.bus,
            backends: services.backends,
            redirect: services.redirect,
            credentials: services.credentials,
            redirected_from: None,
            redirect_target: None,
        })
    }

    pub fn id(&self) -> IKESaId {
        self.id
    }

    pub fn set_initiator_spi(&mut self, spi: u64) {
        self.id.initiator_spi = spi;
    }

    pub fn set_responder_spi(&mut self, spi: u64) {
        self.id.responder_spi = spi;
    }

    pub fn state(&self) -> &IKEState {
        &self.state
    }

    pub fn set_state(&mut self, state: IKEState) {
        self.state = state;
    }

    pub fn local_addr(&self) -> IpAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> IpAddr {
        self.remote_addr
    }

    pub fn ike_cfg(&self) -> &IKEConfig {
        &self.ike_cfg
    }

    pub fn set_ike_cfg(&mut self, cfg: IKEConfig) {
        self.ike_cfg = cfg;
    }

    pub fn peer_cfg(&self) -> &PeerConfig {
        &self.peer_cfg
    }

    pub fn proposal(&self) -> Option<&Proposal> {
        self.proposal.as_ref()
    }

    pub fn set_proposal(&mut self, proposal: Proposal) {
        self.proposal = Some(proposal);
    }

    pub fn enable_extension(&mut self, extension: Extension) {
        self.extensions.insert(extension);
    }

    pub fn supports_extension(&self, extension: Extension) -> bool {
        self.extensions.contains(&extension)
    }

    pub fn keymat(&self) -> &IKEKeymat {
        &self.keymat
    }

    pub fn keymat_mut(&mut self) -> &mut IKEKeymat {
        &mut self.keymat
    }

    pub fn bus(&self) -> Arc<dyn Bus> {
        Arc::clone(&self.bus)
    }

    pub fn backends(&self) -> Arc<dyn ConfigBackend> {
        Arc::clone(&self.backends)
    }

    pub fn redirect_policy(&self) -> Arc<dyn RedirectPolicy> {
        Arc::clone(&self.redirect)
    }

    pub fn credentials(&self) -> Arc<dyn CredentialStore> {
        Arc::clone(&self.credentials)
    }

    /// Roll the negotiation state back for another IKE_SA_INIT attempt after
    /// a COOKIE or INVALID_KE_PAYLOAD round trip.
    pub fn reset(&mut self) {
        self.state = IKEState::Created;
        self.id.responder_spi = 0;
        self.proposal = None;
    }

    /// The gateway this session was redirected away from, if any.
    pub fn redirected_from(&self) -> Option<&GatewayIdentity> {
        self.redirected_from.as_ref()
    }

    pub fn set_redirected_from(&mut self, gateway: GatewayIdentity) {
        self.redirected_from = Some(gateway);
    }

    /// Accept a REDIRECT from the responder. Returns false when the gateway
    /// identity is unusable.
    pub fn handle_redirect(&mut self, gateway: GatewayIdentity) -> bool {
        if let GatewayIdentity::Fqdn(name) = &gateway {
            if name.is_empty() {
                tracing::warn!("Ignoring redirect to empty gateway name");
                return false;
            }
        }
        tracing::info!("Session redirected to {}", gateway);
        self.redirect_target = Some(gateway);
        true
    }

    pub fn redirect_target(&self) -> Option<&GatewayIdentity> {
        self.redirect_target.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ike::proposal::{
        AUTH_HMAC_SHA2_256_128, ENCR_AES_CBC, PRF_HMAC_SHA2_256,
    };

    fn test_config() -> IKEConfig {
        IKEConfig::new(
            "default",
            vec![Proposal::new_ike(1)
                .add_keyed_transform(TransformType::EncryptionAlgorithm, ENCR_AES_CBC, 256)
                .add_transform(TransformType::PseudoRandomFunction, PRF_HMAC_SHA2_256)
                .add_transform(TransformType::IntegrityAlgorithm, AUTH_HMAC_SHA2_256_128)
                .add_transform(TransformType::KeyExchangeMethod, 14)],
        )
    }

    #[test]
    fn test_initiator_session_gets_spi() {
        let session = IKESession::new_initiator(
            "192.0.2.1".parse().unwrap(),
            "192.0.2.2".parse().unwrap(),
            test_config(),
            PeerConfig::new("peer"),
            SessionServices::default(),
        )
        .unwrap();

        assert_ne!(session.id().initiator_spi, 0);
        assert_eq!(session.id().responder_spi, 0);
        assert_eq!(*session.state(), IKEState::Created);
    }

    #[test]
    fn test_reset_clears_negotiation_state() {
        let mut session = IKESession::new_responder(
            "192.0.2.2".parse().unwrap(),
            "192.0.2.1".parse().unwrap(),
            42,
            test_config(),
            PeerConfig::new("peer"),
            SessionServices::default(),
        )
        .unwrap();
        session.set_state(IKEState::Connecting);
        session.set_proposal(test_config().proposals[0].clone());

        session.reset();
        assert_eq!(*session.state(), IKEState::Created);
        assert_eq!(session.id().responder_spi, 0);
        assert!(session.proposal().is_none());
        // initiator SPI is kept, retries reuse it
        assert_eq!(session.id().initiator_spi, 42);
    }

    #[test]
    fn test_extensions() {
        let mut session = IKESession::new_initiator(
            "192.0.2.1".parse().unwrap(),
            "192.0.2.2".parse().unwrap(),
            test_config(),
            PeerConfig::new("peer"),
            SessionServices::default(),
        )
        .unwrap();

        assert!(!session.supports_extension(Extension::Fragmentation));
        session.enable_extension(Extension::Fragmentation);
        assert!(session.supports_extension(Extension::Fragmentation));
    }
}
