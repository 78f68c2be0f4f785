use crate::config::NegotiationSettings;
use crate::network::ike::bus::{Alert, IKEKeysEvent};
use crate::network::ike::crypto::{ke_method_name, HashAlgorithm, KeyExchange, NonceGenerator, PrfAlgorithm};
use crate::network::ike::message::{
    ke_group_data, parse_ke_group, redirect_data_create, redirect_data_parse, ExchangeType,
    IKEMessage, IKEPayload, KeyExchangePayload, NoncePayload, NotificationPayload, NotifyType,
    SAPayload,
};
use crate::network::ike::proposal::{Proposal, SelectionFlags, TransformType};
use crate::network::ike::sa::{ChildlessPolicy, FragmentationPolicy, IKESaId, IKESession};
use crate::network::ike::tasks::{Task, TaskStatus};
use crate::network::ike::{Extension, IKEError, IKEState, NONCE_SIZE};

/// Maximum retries after COOKIE or INVALID_KE_PAYLOAD round trips.
const MAX_RETRIES: u32 = 5;

/// Maximum number of key exchanges per handshake, the initial one plus
/// ADDITIONAL_KEY_EXCHANGE_1..7.
const MAX_KEY_EXCHANGES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// The IKE_SA_INIT request/response pair.
    Init,
    /// Additional key exchanges via IKE_INTERMEDIATE or IKE_FOLLOWUP_KE.
    MultiKe,
}

/// One slot of the key exchange plan collected from the negotiated proposal.
#[derive(Debug, Clone)]
struct KeSlot {
    transform_type: TransformType,
    method: u16,
    done: bool,
}

/// Snapshot of the IKE_SA being rekeyed: everything the new handshake needs
/// from it.
#[derive(Debug, Clone)]
pub struct RekeyedSa {
    pub id: IKESaId,
    /// Key exchange method of the old proposal, reused when configured.
    pub ke_method: Option<u16>,
    /// SK_d and PRF of the old keymat, seeding the new derivation.
    pub skd: Option<(PrfAlgorithm, Vec<u8>)>,
}

impl RekeyedSa {
    pub fn from_session(sa: &IKESession) -> Self {
        RekeyedSa {
            id: sa.id(),
            ke_method: sa
                .proposal()
                .and_then(|p| p.get_algorithm(TransformType::KeyExchangeMethod)),
            skd: sa.keymat().skd(),
        }
    }
}

/// The IKE_SA_INIT task. Negotiates a proposal, runs one or more key
/// exchanges and triggers key derivation, for both roles of a fresh
/// handshake as well as a rekeying.
pub struct IKEInitTask {
    role: Role,
    phase: Phase,
    settings: NegotiationSettings,
    old_sa: Option<RekeyedSa>,
    nonceg: NonceGenerator,
    my_nonce: Vec<u8>,
    other_nonce: Vec<u8>,
    /// Key exchange method from the sent or parsed KE payload.
    ke_method: u16,
    ke: Option<Box<dyn KeyExchange>>,
    /// Applying the peer's public key failed.
    ke_failed: bool,
    proposal: Option<Proposal>,
    ke_plan: Vec<KeSlot>,
    ke_index: usize,
    /// Key exchanges completed during rekeying, in order.
    kes: Vec<Box<dyn KeyExchange>>,
    cookie: Vec<u8>,
    retry: u32,
    /// Key derivation deferred to post_build/post_process so the current
    /// IKE_INTERMEDIATE message is still protected with the old keys.
    pending_derivation: bool,
}

impl IKEInitTask {
    pub fn new(
        sa: &IKESession,
        role: Role,
        old_sa: Option<RekeyedSa>,
        settings: &NegotiationSettings,
    ) -> Self {
        IKEInitTask {
            role,
            phase: Phase::Init,
            settings: *settings,
            old_sa,
            nonceg: sa.keymat().create_nonce_gen(),
            my_nonce: Vec::new(),
            other_nonce: Vec::new(),
            ke_method: 0,
            ke: None,
            ke_failed: false,
            proposal: None,
            ke_plan: Vec::with_capacity(MAX_KEY_EXCHANGES),
            ke_index: 0,
            kes: Vec::new(),
            cookie: Vec::new(),
            retry: 0,
            pending_derivation: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn retry_count(&self) -> u32 {
        self.retry
    }

    pub fn cookie(&self) -> &[u8] {
        &self.cookie
    }

    /// The lexicographically lower of the two nonces. Both ends report the
    /// same value, used by later exchanges.
    pub fn get_lower_nonce(&self) -> &[u8] {
        let len = self.my_nonce.len().min(self.other_nonce.len());
        if self.my_nonce[..len].cmp(&self.other_nonce[..len]) == std::cmp::Ordering::Less {
            &self.my_nonce
        } else {
            &self.other_nonce
        }
    }

    fn exchange_type_multi_ke(&self) -> ExchangeType {
        if self.old_sa.is_some() {
            ExchangeType::IkeFollowupKe
        } else {
            ExchangeType::IkeIntermediate
        }
    }

    fn generate_nonce(&mut self) -> Result<(), IKEError> {
        self.my_nonce = self.nonceg.allocate_nonce(NONCE_SIZE)?;
        Ok(())
    }

    fn nonces_by_role(&self) -> (&[u8], &[u8]) {
        match self.role {
            Role::Initiator => (&self.my_nonce, &self.other_nonce),
            Role::Responder => (&self.other_nonce, &self.my_nonce),
        }
    }

    /// Announce the hash algorithms usable for signature authentication,
    /// constrained by the peer config's authentication rounds if it has any.
    fn send_supported_hash_algorithms(&self, sa: &IKESession, message: &mut IKEMessage) {
        let mut algos: Vec<HashAlgorithm> = Vec::new();
        for round in &sa.peer_cfg().auth_rounds {
            for hash in &round.signature_hashes {
                if hash.usable_for_ikev2() && !algos.contains(hash) {
                    algos.push(*hash);
                }
            }
        }
        if algos.is_empty() {
            algos = sa.keymat().supported_hash_algorithms();
        }
        if !algos.is_empty() {
            let mut data = Vec::with_capacity(algos.len() * 2);
            for hash in &algos {
                data.extend_from_slice(&(*hash as u16).to_be_bytes());
            }
            message.add_notify(false, NotifyType::SignatureHashAlgorithms, data);
            tracing::debug!("Sending {} supported signature hash algorithms", algos.len());
        }
    }

    /// Store the hash algorithms supported by the peer.
    fn handle_supported_hash_algorithms(&mut self, sa: &mut IKESession, data: &[u8]) {
        let mut added = false;
        for chunk in data.chunks_exact(2) {
            let value = u16::from_be_bytes([chunk[0], chunk[1]]);
            if let Some(algorithm) = HashAlgorithm::from_u16(value) {
                if algorithm.usable_for_ikev2() {
                    sa.keymat_mut().add_hash_algorithm(algorithm);
                    added = true;
                }
            }
        }
        tracing::debug!("Received supported signature hash algorithms");
        if added {
            sa.enable_extension(Extension::SignatureAuth);
        }
    }

    fn send_use_ppk(&self, sa: &IKESession) -> bool {
        match self.role {
            Role::Initiator => sa.peer_cfg().ppk_id.is_some(),
            // check if we have at least one PPK available
            Role::Responder => {
                sa.supports_extension(Extension::Ppk) && sa.credentials().have_ppk()
            }
        }
    }

    fn build_payloads(&mut self, sa: &IKESession, message: &mut IKEMessage) -> Result<(), IKEError> {
        let id = sa.id();

        if self.role == Role::Initiator {
            let mut preferred = Vec::new();
            let mut other_groups = Vec::new();
            for mut proposal in sa.ike_cfg().proposals.clone() {
                // include the SPI of the new IKE_SA when rekeying
                if self.old_sa.is_some() {
                    proposal.set_spi(id.initiator_spi);
                }
                // move the method in use to the front; proposals that don't
                // offer it at all go to the back
                if proposal.promote_transform(TransformType::KeyExchangeMethod, self.ke_method) {
                    preferred.push(proposal);
                } else {
                    other_groups.push(proposal);
                }
            }
            preferred.append(&mut other_groups);
            message.add_payload(IKEPayload::SA(SAPayload {
                proposals: preferred,
            }));
        } else {
            if self.old_sa.is_some() {
                if let Some(proposal) = self.proposal.as_mut() {
                    proposal.set_spi(id.responder_spi);
                }
            }
            let proposal = self
                .proposal
                .clone()
                .ok_or_else(|| IKEError::Protocol("No proposal selected".to_string()))?;
            message.add_payload(IKEPayload::SA(SAPayload {
                proposals: vec![proposal],
            }));
        }

        let ke = self
            .ke
            .as_ref()
            .ok_or_else(|| IKEError::Protocol("No key exchange object".to_string()))?;
        let key_exchange_data = ke.public_key().map_err(|e| {
            tracing::warn!("Creating KE payload failed: {}", e);
            e
        })?;
        message.add_payload(IKEPayload::KeyExchange(KeyExchangePayload {
            method: ke.method(),
            key_exchange_data,
        }));

        message.add_payload(IKEPayload::Nonce(NoncePayload {
            nonce_data: self.my_nonce.clone(),
        }));

        // negotiate fragmentation if we are not rekeying
        if self.old_sa.is_none()
            && sa.ike_cfg().fragmentation != FragmentationPolicy::No
            && (self.role == Role::Initiator || sa.supports_extension(Extension::Fragmentation))
        {
            message.add_notify(false, NotifyType::FragmentationSupported, Vec::new());
        }
        // submit supported hash algorithms for signature authentication
        if self.old_sa.is_none()
            && self.settings.signature_authentication
            && (self.role == Role::Initiator || sa.supports_extension(Extension::SignatureAuth))
        {
            self.send_supported_hash_algorithms(sa, message);
        }
        // notify the peer if we support redirection
        if self.old_sa.is_none() && self.role == Role::Initiator && self.settings.follow_redirects {
            match sa.redirected_from() {
                Some(gateway) => {
                    let data = redirect_data_create(gateway, &[]);
                    message.add_notify(false, NotifyType::RedirectedFrom, data);
                }
                None => message.add_notify(false, NotifyType::RedirectSupported, Vec::new()),
            }
        }
        // notify the peer if we want to use PPK
        if self.old_sa.is_none() && self.send_use_ppk(sa) {
            message.add_notify(false, NotifyType::UsePpk, Vec::new());
        }
        // notify the peer if we accept childless IKE_SAs
        if self.old_sa.is_none()
            && self.role == Role::Responder
            && sa.ike_cfg().childless != ChildlessPolicy::Never
        {
            message.add_notify(false, NotifyType::ChildlessIkev2Supported, Vec::new());
        }
        Ok(())
    }

    /// Select a proposal from the peer's offer, falling back to alternative
    /// configs on the responder.
    fn process_sa_payload(&mut self, sa: &mut IKESession, payload: &SAPayload) {
        let flags = SelectionFlags {
            skip_private: !sa.supports_extension(Extension::Vendor)
                && !self.settings.accept_private_algs,
            prefer_supplied: !self.settings.prefer_configured_proposals,
        };
        self.proposal = sa.ike_cfg().select_proposal(&payload.proposals, flags);
        if self.proposal.is_none() {
            let mut alt_cfg = None;
            if self.role == Role::Responder && self.old_sa.is_none() {
                let current = sa.ike_cfg().name.clone();
                for cfg in sa.backends().ike_configs(sa.local_addr(), sa.remote_addr()) {
                    if cfg.name == current {
                        // already tried and failed
                        continue;
                    }
                    tracing::info!(
                        "No matching proposal found, trying alternative config {}",
                        cfg.name
                    );
                    self.proposal = cfg.select_proposal(&payload.proposals, flags);
                    if self.proposal.is_some() {
                        alt_cfg = Some(cfg);
                        break;
                    }
                }
            }
            match alt_cfg {
                Some(cfg) => sa.set_ike_cfg(cfg),
                None => sa.bus().alert(Alert::ProposalMismatchIke {
                    proposals: payload.proposals.clone(),
                }),
            }
        }
    }

    /// Collect all key exchanges from the negotiated proposal.
    fn determine_key_exchanges(&mut self) {
        let proposal = match &self.proposal {
            Some(proposal) => proposal,
            None => return,
        };
        self.ke_plan.clear();
        self.ke_plan.push(KeSlot {
            transform_type: TransformType::KeyExchangeMethod,
            method: proposal
                .get_algorithm(TransformType::KeyExchangeMethod)
                .unwrap_or(0),
            done: false,
        });
        for transform_type in TransformType::ADDITIONAL_KEY_EXCHANGES {
            if let Some(method) = proposal.get_algorithm(transform_type) {
                self.ke_plan.push(KeSlot {
                    transform_type,
                    method,
                    done: false,
                });
            }
        }
    }

    fn additional_key_exchange_required(&self) -> bool {
        self.ke_plan[self.ke_index.min(self.ke_plan.len())..]
            .iter()
            .any(|slot| !slot.done)
    }

    fn clear_key_exchanges(&mut self) {
        self.ke_plan.clear();
        self.ke_index = 0;
        self.kes.clear();
    }

    fn process_ke_payload(&mut self, sa: &mut IKESession, ke_payload: &KeyExchangePayload) {
        let method = self
            .ke_plan
            .get(self.ke_index)
            .map(|slot| slot.method)
            .unwrap_or(0);
        let received = ke_payload.method;

        if method != received {
            tracing::warn!(
                "Key exchange method in received payload {} doesn't match negotiated {}",
                ke_method_name(received),
                ke_method_name(method)
            );
            self.ke_failed = true;
            return;
        }

        match self.role {
            Role::Responder => {
                self.ke = sa.keymat().create_ke(method);
                if self.ke.is_none() {
                    tracing::warn!(
                        "Negotiated key exchange method {} not supported",
                        ke_method_name(method)
                    );
                }
            }
            Role::Initiator => {
                if let Some(ke) = &self.ke {
                    self.ke_failed = ke.method() != received;
                }
            }
        }

        if !self.ke_failed {
            if let Some(ke) = self.ke.as_mut() {
                if let Err(e) = ke.set_public_key(&ke_payload.key_exchange_data) {
                    tracing::warn!("Applying peer's public key failed: {}", e);
                    self.ke_failed = true;
                }
            }
        }
    }

    fn process_notify(&mut self, sa: &mut IKESession, notify: &NotificationPayload) {
        match NotifyType::from_u16(notify.notify_message_type) {
            Some(NotifyType::FragmentationSupported) => {
                sa.enable_extension(Extension::Fragmentation);
            }
            Some(NotifyType::SignatureHashAlgorithms) => {
                if self.settings.signature_authentication {
                    self.handle_supported_hash_algorithms(sa, &notify.notification_data);
                }
            }
            Some(NotifyType::UsePpk) => {
                if self.old_sa.is_none() {
                    sa.enable_extension(Extension::Ppk);
                }
            }
            Some(NotifyType::RedirectedFrom) => {
                match redirect_data_parse(&notify.notification_data) {
                    Some((gateway, _)) => {
                        tracing::info!("Client got redirected from {}", gateway);
                    }
                    None => {
                        tracing::warn!("Received invalid REDIRECTED_FROM notify, ignored");
                        return;
                    }
                }
                // a peer announcing its previous gateway also supports
                // redirection, enable it like for REDIRECT_SUPPORTED
                if self.old_sa.is_none() {
                    sa.enable_extension(Extension::Redirection);
                }
            }
            Some(NotifyType::RedirectSupported) => {
                if self.old_sa.is_none() {
                    sa.enable_extension(Extension::Redirection);
                }
            }
            Some(NotifyType::ChildlessIkev2Supported) => {
                if self.role == Role::Initiator && self.old_sa.is_none() {
                    sa.enable_extension(Extension::Childless);
                }
            }
            _ => {
                // other notifies are handled elsewhere
            }
        }
    }

    fn process_payloads(&mut self, sa: &mut IKESession, message: &IKEMessage) {
        let mut ke_payload: Option<&KeyExchangePayload> = None;

        for payload in &message.payloads {
            match payload {
                IKEPayload::SA(sa_payload) => self.process_sa_payload(sa, sa_payload),
                IKEPayload::KeyExchange(ke) => {
                    ke_payload = Some(ke);
                    self.ke_method = ke.method;
                }
                IKEPayload::Nonce(nonce) => {
                    self.other_nonce = nonce.nonce_data.clone();
                }
                IKEPayload::Notification(notify) => self.process_notify(sa, notify),
                IKEPayload::Unknown { payload_type, .. } => {
                    tracing::debug!("Ignoring payload type {}", payload_type);
                }
            }
        }

        if let Some(proposal) = self.proposal.clone() {
            sa.set_proposal(proposal.clone());

            // retrieve the SPI of the new IKE_SA when rekeying
            if self.old_sa.is_some() {
                let spi = proposal.spi.unwrap_or(0);
                match self.role {
                    Role::Initiator => sa.set_responder_spi(spi),
                    Role::Responder => sa.set_initiator_spi(spi),
                }
            }

            self.determine_key_exchanges();
            if let Some(ke) = ke_payload {
                self.process_ke_payload(sa, ke);
            }
        }
    }

    fn build_payloads_multi_ke(&mut self, message: &mut IKEMessage) -> Result<(), IKEError> {
        let ke = self
            .ke
            .as_ref()
            .ok_or_else(|| IKEError::Protocol("No key exchange object".to_string()))?;
        let key_exchange_data = ke.public_key().map_err(|e| {
            tracing::warn!("Creating KE payload failed: {}", e);
            e
        })?;
        message.add_payload(IKEPayload::KeyExchange(KeyExchangePayload {
            method: ke.method(),
            key_exchange_data,
        }));
        Ok(())
    }

    fn process_payloads_multi_ke(&mut self, sa: &mut IKESession, message: &IKEMessage) {
        match message.ke_payload() {
            Some(ke) => self.process_ke_payload(sa, ke),
            None => tracing::warn!("KE payload missing in message"),
        }
    }

    /// Derive the IKE_SA keys and publish them. `seed_id` names the SA whose
    /// SK_d seeds the derivation; without inherited material this is an
    /// initial derivation.
    fn derive_keys(
        &self,
        sa: &mut IKESession,
        seed_id: IKESaId,
        inherited: Option<(PrfAlgorithm, Vec<u8>)>,
    ) -> Result<(), IKEError> {
        let proposal = self
            .proposal
            .as_ref()
            .ok_or_else(|| IKEError::Protocol("No negotiated proposal".to_string()))?;
        let kes: Vec<&dyn KeyExchange> = if self.kes.is_empty() {
            vec![self
                .ke
                .as_deref()
                .ok_or_else(|| IKEError::Crypto("No key exchange object".to_string()))?]
        } else {
            self.kes.iter().map(|ke| ke.as_ref()).collect()
        };
        let (nonce_i, nonce_r) = self.nonces_by_role();
        let rekeyed_from = inherited.as_ref().map(|_| seed_id);

        let id = sa.id();
        sa.keymat_mut()
            .derive_ike_keys(proposal, &kes, nonce_i, nonce_r, &id, inherited)?;
        sa.bus().ike_keys(IKEKeysEvent {
            sa: id,
            ke_methods: kes.iter().map(|ke| ke.method()).collect(),
            nonce_i: nonce_i.to_vec(),
            nonce_r: nonce_r.to_vec(),
            rekeyed_from,
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Called when one key exchange finished: advance the plan and decide
    /// whether to derive keys now or keep going.
    fn key_exchange_done(&mut self, sa: &mut IKESession) -> TaskStatus {
        match self.ke_plan.get_mut(self.ke_index) {
            Some(slot) => slot.done = true,
            None => {
                tracing::warn!("Key exchange finished without a plan slot");
                return TaskStatus::Failed;
            }
        }
        self.ke_index += 1;
        let additional = self.additional_key_exchange_required();

        let seed = if let Some(old) = &self.old_sa {
            // during rekeying we collect all the key exchanges performed and
            // derive keys only when all are done
            let old = old.clone();
            if let Some(ke) = self.ke.take() {
                self.kes.push(ke);
            }
            if additional {
                None
            } else {
                Some((old.id, old.skd))
            }
        } else {
            // key derivation for additional exchanges works like rekeying,
            // seeded with our own SK_d from the previous derivation
            Some((sa.id(), sa.keymat().skd()))
        };

        if let Some((seed_id, inherited)) = seed {
            if let Err(e) = self.derive_keys(sa, seed_id, inherited) {
                tracing::warn!("Key derivation failed: {}", e);
                return TaskStatus::Failed;
            }
        }
        if additional {
            TaskStatus::NeedMore
        } else {
            TaskStatus::Success
        }
    }

    fn raise_alerts(&self, sa: &IKESession, notify_type: u16) {
        if notify_type == NotifyType::NoProposalChosen as u16 {
            sa.bus().alert(Alert::ProposalMismatchIke {
                proposals: sa.ike_cfg().proposals.clone(),
            });
        }
    }

    fn build_i(&mut self, sa: &mut IKESession, message: &mut IKEMessage) -> TaskStatus {
        tracing::info!("Initiating IKE_SA to {}", sa.remote_addr());
        sa.set_state(IKEState::Connecting);

        if self.retry >= MAX_RETRIES {
            tracing::warn!("Giving up after {} retries", MAX_RETRIES);
            return TaskStatus::Failed;
        }

        // if we are retrying after an INVALID_KE_PAYLOAD we already have one
        if self.ke.is_none() {
            self.ke_method = if self.old_sa.is_some() && self.settings.prefer_previous_dh_group {
                // reuse the method of the old IKE_SA when rekeying, with the
                // configured one as fallback
                self.old_sa
                    .as_ref()
                    .and_then(|old| old.ke_method)
                    .or_else(|| sa.ike_cfg().first_ke_method())
                    .unwrap_or(0)
            } else {
                sa.ike_cfg().first_ke_method().unwrap_or(0)
            };
            self.ke = sa.keymat().create_ke(self.ke_method);
            if self.ke.is_none() {
                tracing::warn!(
                    "Configured key exchange method {} not supported",
                    ke_method_name(self.ke_method)
                );
                return TaskStatus::Failed;
            }
        } else if self.ke.as_ref().map(|ke| ke.method()) != Some(self.ke_method) {
            // reset the key exchange if the method changed (INVALID_KE_PAYLOAD)
            self.ke = sa.keymat().create_ke(self.ke_method);
            if self.ke.is_none() {
                tracing::warn!(
                    "Requested key exchange method {} not supported",
                    ke_method_name(self.ke_method)
                );
                return TaskStatus::Failed;
            }
        }

        // generate the nonce only when trying the first time
        if self.my_nonce.is_empty() {
            if let Err(e) = self.generate_nonce() {
                tracing::warn!("{}", e);
                return TaskStatus::Failed;
            }
        }

        if !self.cookie.is_empty() {
            message.add_notify(false, NotifyType::Cookie, self.cookie.clone());
        }

        if self.build_payloads(sa, message).is_err() {
            return TaskStatus::Failed;
        }
        TaskStatus::NeedMore
    }

    fn build_i_multi_ke(&mut self, sa: &mut IKESession, message: &mut IKEMessage) -> TaskStatus {
        message.exchange_type = self.exchange_type_multi_ke();

        let method = match self.ke_plan.get(self.ke_index) {
            Some(slot) => {
                tracing::debug!(
                    "Starting {:?} with {}",
                    slot.transform_type,
                    ke_method_name(slot.method)
                );
                slot.method
            }
            None => {
                tracing::warn!("No key exchange left to initiate");
                return TaskStatus::Failed;
            }
        };
        self.ke = sa.keymat().create_ke(method);
        if self.ke.is_none() {
            tracing::warn!(
                "Negotiated key exchange method {} not supported",
                ke_method_name(method)
            );
            return TaskStatus::Failed;
        }
        if self.build_payloads_multi_ke(message).is_err() {
            return TaskStatus::Failed;
        }
        TaskStatus::NeedMore
    }

    fn process_r(&mut self, sa: &mut IKESession, message: &IKEMessage) -> TaskStatus {
        tracing::info!("{} is initiating an IKE_SA", sa.remote_addr());
        sa.set_state(IKEState::Connecting);

        if let Err(e) = self.generate_nonce() {
            tracing::warn!("{}", e);
            return TaskStatus::Failed;
        }

        if let Some(notify) = message.get_notify(NotifyType::MeConnectId) {
            tracing::debug!(
                "Received ME_CONNECTID notify ({} bytes)",
                notify.notification_data.len()
            );
        }

        self.process_payloads(sa, message);
        TaskStatus::NeedMore
    }

    fn process_r_multi_ke(&mut self, sa: &mut IKESession, message: &IKEMessage) -> TaskStatus {
        if message.exchange_type == self.exchange_type_multi_ke() {
            self.process_payloads_multi_ke(sa, message);
        }
        TaskStatus::NeedMore
    }

    fn build_r(&mut self, sa: &mut IKESession, message: &mut IKEMessage) -> TaskStatus {
        // check if we have everything we need
        if self.proposal.is_none() || self.other_nonce.is_empty() || self.my_nonce.is_empty() {
            tracing::warn!("Received proposals unacceptable");
            message.add_notify(true, NotifyType::NoProposalChosen, Vec::new());
            return TaskStatus::Failed;
        }

        // check if we'd have to redirect the client
        if self.old_sa.is_none() && sa.supports_extension(Extension::Redirection) {
            if let Some(gateway) = sa.redirect_policy().redirect_on_init(sa) {
                tracing::info!("Redirecting peer to {}", gateway);
                let data = redirect_data_create(&gateway, &self.other_nonce);
                message.add_notify(true, NotifyType::Redirect, data);
                return TaskStatus::Failed;
            }
        }

        let has_method = self
            .proposal
            .as_ref()
            .map(|p| p.has_transform(TransformType::KeyExchangeMethod, self.ke_method))
            .unwrap_or(false);
        if self.ke.is_none() || !has_method {
            let group = self
                .proposal
                .as_ref()
                .and_then(|p| p.get_algorithm(TransformType::KeyExchangeMethod));
            match group {
                Some(group) if group != self.ke_method => {
                    tracing::warn!(
                        "Key exchange method {} unacceptable, requesting {}",
                        ke_method_name(self.ke_method),
                        ke_method_name(group)
                    );
                    self.ke_method = group;
                    message.add_notify(false, NotifyType::InvalidKePayload, ke_group_data(group));
                }
                _ => {
                    tracing::warn!("No acceptable proposal found");
                    message.add_notify(true, NotifyType::NoProposalChosen, Vec::new());
                }
            }
            return TaskStatus::Failed;
        }

        if self.ke_failed {
            tracing::warn!("Applying peer's public key failed");
            message.add_notify(true, NotifyType::NoProposalChosen, Vec::new());
            return TaskStatus::Failed;
        }

        if self.build_payloads(sa, message).is_err() {
            message.add_notify(true, NotifyType::NoProposalChosen, Vec::new());
            return TaskStatus::Failed;
        }

        match self.key_exchange_done(sa) {
            TaskStatus::Failed => {
                message.add_notify(true, NotifyType::NoProposalChosen, Vec::new());
                TaskStatus::Failed
            }
            TaskStatus::NeedMore => {
                // use the followup exchange type for additional key exchanges
                self.phase = Phase::MultiKe;
                TaskStatus::NeedMore
            }
            TaskStatus::Success => TaskStatus::Success,
        }
    }

    fn build_r_multi_ke(&mut self, sa: &mut IKESession, message: &mut IKEMessage) -> TaskStatus {
        if self.ke.is_none() {
            message.add_notify(false, NotifyType::InvalidSyntax, Vec::new());
            return TaskStatus::Failed;
        }
        if self.ke_failed {
            message.add_notify(false, NotifyType::NoProposalChosen, Vec::new());
            return TaskStatus::Failed;
        }
        if self.build_payloads_multi_ke(message).is_err() {
            return TaskStatus::Failed;
        }

        if self.old_sa.is_some() {
            let status = self.key_exchange_done(sa);
            if status == TaskStatus::Failed {
                message.add_notify(false, NotifyType::NoProposalChosen, Vec::new());
                return TaskStatus::Failed;
            }
            status
        } else {
            // derive keys for IKE_INTERMEDIATE only after the response went
            // out, it must still be protected with the old keys
            self.pending_derivation = true;
            TaskStatus::NeedMore
        }
    }

    fn process_i(&mut self, sa: &mut IKESession, message: &IKEMessage) -> TaskStatus {
        // check for erroneous notifies
        for notify in message.notifies() {
            let notify_type = notify.notify_message_type;
            match NotifyType::from_u16(notify_type) {
                Some(NotifyType::InvalidKePayload) => {
                    let requested = match parse_ke_group(&notify.notification_data) {
                        Some(group) => group,
                        None => {
                            tracing::warn!("Received malformed INVALID_KE_PAYLOAD notify");
                            return TaskStatus::Failed;
                        }
                    };
                    tracing::warn!(
                        "Peer didn't accept key exchange method {}, it requested {}",
                        ke_method_name(self.ke_method),
                        ke_method_name(requested)
                    );
                    self.ke_method = requested;
                    // reset the IKE_SA if we are not rekeying
                    if self.old_sa.is_none() {
                        sa.reset();
                    }
                    self.retry += 1;
                    return TaskStatus::NeedMore;
                }
                Some(NotifyType::NatDetectionSourceIp)
                | Some(NotifyType::NatDetectionDestinationIp) => {
                    // handled by the NAT detection task
                }
                Some(NotifyType::MultipleAuthSupported) => {
                    // handled during authentication
                }
                Some(NotifyType::Cookie) => {
                    self.cookie = notify.notification_data.clone();
                    sa.reset();
                    tracing::debug!("Received COOKIE notify");
                    self.retry += 1;
                    return TaskStatus::NeedMore;
                }
                Some(NotifyType::Redirect) => {
                    if self.old_sa.is_some() {
                        tracing::warn!("Received REDIRECT notify during rekeying, ignored");
                        continue;
                    }
                    return match redirect_data_parse(&notify.notification_data) {
                        Some((gateway, _)) if sa.handle_redirect(gateway.clone()) => TaskStatus::NeedMore,
                        _ => TaskStatus::Failed,
                    };
                }
                _ => {
                    if NotifyType::is_error(notify_type) {
                        tracing::warn!("Received notify error {}", notify_type);
                        self.raise_alerts(sa, notify_type);
                        return TaskStatus::Failed;
                    }
                    tracing::debug!("Received notify {}", notify_type);
                }
            }
        }

        self.process_payloads(sa, message);

        // check if we have everything
        if self.proposal.is_none() || self.other_nonce.is_empty() || self.my_nonce.is_empty() {
            tracing::warn!("Peer's proposal selection invalid");
            return TaskStatus::Failed;
        }
        let method_ok = self
            .proposal
            .as_ref()
            .map(|p| p.has_transform(TransformType::KeyExchangeMethod, self.ke_method))
            .unwrap_or(false);
        if !method_ok {
            tracing::warn!("Peer's key exchange method selection invalid");
            return TaskStatus::Failed;
        }
        if self.ke_failed {
            tracing::warn!("Applying peer's public key failed");
            return TaskStatus::Failed;
        }

        let status = self.key_exchange_done(sa);
        if status == TaskStatus::NeedMore {
            // use the followup exchange type for additional key exchanges
            self.phase = Phase::MultiKe;
        }
        status
    }

    fn process_i_multi_ke(&mut self, sa: &mut IKESession, message: &IKEMessage) -> TaskStatus {
        self.process_payloads_multi_ke(sa, message);

        if self.ke_failed {
            return TaskStatus::Failed;
        }

        if self.old_sa.is_some() {
            self.key_exchange_done(sa)
        } else {
            // derive keys in post_process, the response we just consumed was
            // still protected with the old keys
            self.pending_derivation = true;
            TaskStatus::NeedMore
        }
    }
}

impl Task for IKEInitTask {
    fn pre_process(&mut self, _sa: &mut IKESession, message: &IKEMessage) -> TaskStatus {
        if self.role == Role::Responder {
            return TaskStatus::Success;
        }
        for notify in message.notifies() {
            match NotifyType::from_u16(notify.notify_message_type) {
                Some(NotifyType::Cookie) => {
                    if !self.cookie.is_empty() && notify.notification_data == self.cookie {
                        tracing::warn!("Ignoring response with duplicate COOKIE notify");
                        return TaskStatus::Failed;
                    }
                }
                Some(NotifyType::Redirect) => {
                    if self.old_sa.is_some() {
                        continue;
                    }
                    // the notify must echo our nonce
                    return match redirect_data_parse(&notify.notification_data) {
                        Some((_, nonce)) if nonce == self.my_nonce => TaskStatus::Success,
                        _ => {
                            tracing::warn!("Received invalid REDIRECT notify");
                            TaskStatus::Failed
                        }
                    };
                }
                _ => {}
            }
        }
        TaskStatus::Success
    }

    fn process(&mut self, sa: &mut IKESession, message: &IKEMessage) -> TaskStatus {
        match (self.role, self.phase) {
            (Role::Initiator, Phase::Init) => self.process_i(sa, message),
            (Role::Initiator, Phase::MultiKe) => self.process_i_multi_ke(sa, message),
            (Role::Responder, Phase::Init) => self.process_r(sa, message),
            (Role::Responder, Phase::MultiKe) => self.process_r_multi_ke(sa, message),
        }
    }

    fn build(&mut self, sa: &mut IKESession, message: &mut IKEMessage) -> TaskStatus {
        match (self.role, self.phase) {
            (Role::Initiator, Phase::Init) => self.build_i(sa, message),
            (Role::Initiator, Phase::MultiKe) => self.build_i_multi_ke(sa, message),
            (Role::Responder, Phase::Init) => self.build_r(sa, message),
            (Role::Responder, Phase::MultiKe) => self.build_r_multi_ke(sa, message),
        }
    }

    fn post_build(&mut self, sa: &mut IKESession, _message: &IKEMessage) -> Option<TaskStatus> {
        if self.role == Role::Responder && self.pending_derivation {
            self.pending_derivation = false;
            return Some(self.key_exchange_done(sa));
        }
        None
    }

    fn post_process(&mut self, sa: &mut IKESession, _message: &IKEMessage) -> Option<TaskStatus> {
        if self.role == Role::Initiator && self.pending_derivation {
            self.pending_derivation = false;
            return Some(self.key_exchange_done(sa));
        }
        None
    }

    fn migrate(&mut self) {
        self.proposal = None;
        self.other_nonce.clear();
        self.ke_failed = false;
        self.pending_derivation = false;
        self.phase = Phase::Init;
        self.clear_key_exchanges();
    }
}
