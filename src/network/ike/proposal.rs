use serde::{Deserialize, Serialize};

// Transform IDs used for IKE proposals (IANA IKEv2 registries)
pub const ENCR_AES_CBC: u16 = 12;
pub const ENCR_AES_GCM_16: u16 = 20;
pub const PRF_HMAC_SHA2_256: u16 = 5;
pub const PRF_HMAC_SHA2_384: u16 = 6;
pub const PRF_HMAC_SHA2_512: u16 = 7;
pub const AUTH_HMAC_SHA2_256_128: u16 = 12;

/// First transform ID of the IANA private use range.
pub const PRIVATE_USE_MIN: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransformType {
    EncryptionAlgorithm = 1,
    PseudoRandomFunction = 2,
    IntegrityAlgorithm = 3,
    KeyExchangeMethod = 4,
    SequenceNumbers = 5,
    AdditionalKeyExchange1 = 6,
    AdditionalKeyExchange2 = 7,
    AdditionalKeyExchange3 = 8,
    AdditionalKeyExchange4 = 9,
    AdditionalKeyExchange5 = 10,
    AdditionalKeyExchange6 = 11,
    AdditionalKeyExchange7 = 12,
}

impl TransformType {
    /// The seven additional key exchange transform types of RFC 9370, in order.
    pub const ADDITIONAL_KEY_EXCHANGES: [TransformType; 7] = [
        TransformType::AdditionalKeyExchange1,
        TransformType::AdditionalKeyExchange2,
        TransformType::AdditionalKeyExchange3,
        TransformType::AdditionalKeyExchange4,
        TransformType::AdditionalKeyExchange5,
        TransformType::AdditionalKeyExchange6,
        TransformType::AdditionalKeyExchange7,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub transform_type: TransformType,
    pub transform_id: u16,
    pub key_length: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub number: u8,
    pub protocol_id: u8,
    pub spi: Option<u64>,
    pub transforms: Vec<Transform>,
}

impl Proposal {
    pub fn new_ike(number: u8) -> Self {
        Proposal {
            number,
            protocol_id: 1, // IKE
            spi: None,
            transforms: Vec::new(),
        }
    }

    pub fn add_transform(mut self, transform_type: TransformType, transform_id: u16) -> Self {
        self.transforms.push(Transform {
            transform_type,
            transform_id,
            key_length: None,
        });
        self
    }

    pub fn add_keyed_transform(
        mut self,
        transform_type: TransformType,
        transform_id: u16,
        key_length: u16,
    ) -> Self {
        self.transforms.push(Transform {
            transform_type,
            transform_id,
            key_length: Some(key_length),
        });
        self
    }

    /// First algorithm of the given transform type, if any.
    pub fn get_algorithm(&self, transform_type: TransformType) -> Option<u16> {
        self.transforms
            .iter()
            .find(|t| t.transform_type == transform_type)
            .map(|t| t.transform_id)
    }

    pub fn has_transform(&self, transform_type: TransformType, transform_id: u16) -> bool {
        self.transforms
            .iter()
            .any(|t| t.transform_type == transform_type && t.transform_id == transform_id)
    }

    /// Move the matching transform in front of all others of the same type so
    /// the peer sees it as our preference. Returns false if the proposal does
    /// not advertise the algorithm at all.
    pub fn promote_transform(&mut self, transform_type: TransformType, transform_id: u16) -> bool {
        let pos = match self
            .transforms
            .iter()
            .position(|t| t.transform_type == transform_type && t.transform_id == transform_id)
        {
            Some(pos) => pos,
            None => return false,
        };
        let first = self
            .transforms
            .iter()
            .position(|t| t.transform_type == transform_type)
            .unwrap_or(pos);
        if pos != first {
            let transform = self.transforms.remove(pos);
            self.transforms.insert(first, transform);
        }
        true
    }

    pub fn set_spi(&mut self, spi: u64) {
        self.spi = Some(spi);
    }

    fn transform_types(&self) -> Vec<TransformType> {
        let mut types: Vec<TransformType> = self
            .transforms
            .iter()
            .map(|t| t.transform_type)
            .collect();
        types.sort();
        types.dedup();
        types
    }
}

/// Flags steering proposal selection, derived from strict-negotiation settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionFlags {
    /// Ignore private-use transform IDs offered by an unknown peer.
    pub skip_private: bool,
    /// Let the peer's preference order win over the configured order.
    pub prefer_supplied: bool,
}

/// Select a proposal from the peer's list against our configured list.
///
/// Two proposals match when they cover the same transform types and share at
/// least one algorithm per type. The preferred side's ordering decides which
/// shared algorithm is picked. The selected proposal keeps the supplied
/// proposal's number and SPI, which carries the peer's new SPI during
/// rekeying.
pub fn select_proposal(
    configured: &[Proposal],
    supplied: &[Proposal],
    flags: SelectionFlags,
) -> Option<Proposal> {
    let supplied: Vec<Proposal> = supplied
        .iter()
        .map(|p| {
            let mut p = p.clone();
            if flags.skip_private {
                p.transforms.retain(|t| t.transform_id < PRIVATE_USE_MIN);
            }
            p
        })
        .collect();

    if flags.prefer_supplied {
        for theirs in &supplied {
            for ours in configured {
                if let Some(selected) = match_proposals(theirs, ours, theirs) {
                    return Some(selected);
                }
            }
        }
    } else {
        for ours in configured {
            for theirs in &supplied {
                if let Some(selected) = match_proposals(ours, theirs, theirs) {
                    return Some(selected);
                }
            }
        }
    }
    None
}

/// Intersect two proposals, taking algorithm preference from `preferred` and
/// number/SPI from `wire` (the supplied side).
fn match_proposals(preferred: &Proposal, other: &Proposal, wire: &Proposal) -> Option<Proposal> {
    if preferred.protocol_id != other.protocol_id {
        return None;
    }
    if preferred.transform_types() != other.transform_types() {
        return None;
    }

    let mut selected = Proposal {
        number: wire.number,
        protocol_id: wire.protocol_id,
        spi: wire.spi,
        transforms: Vec::new(),
    };
    for transform_type in preferred.transform_types() {
        let common = preferred.transforms.iter().find(|t| {
            t.transform_type == transform_type
                && other.transforms.iter().any(|o| {
                    o.transform_type == transform_type
                        && o.transform_id == t.transform_id
                        && o.key_length == t.key_length
                })
        })?;
        selected.transforms.push(common.clone());
    }
    Some(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aes_sha256_proposal(ke_method: u16) -> Proposal {
        Proposal::new_ike(1)
            .add_keyed_transform(TransformType::EncryptionAlgorithm, ENCR_AES_CBC, 256)
            .add_transform(TransformType::PseudoRandomFunction, PRF_HMAC_SHA2_256)
            .add_transform(TransformType::IntegrityAlgorithm, AUTH_HMAC_SHA2_256_128)
            .add_transform(TransformType::KeyExchangeMethod, ke_method)
    }

    #[test]
    fn test_select_matching_proposal() {
        let configured = vec![aes_sha256_proposal(14)];
        let supplied = vec![aes_sha256_proposal(14)];

        let selected =
            select_proposal(&configured, &supplied, SelectionFlags::default()).unwrap();
        assert_eq!(
            selected.get_algorithm(TransformType::KeyExchangeMethod),
            Some(14)
        );
        assert!(selected.has_transform(TransformType::EncryptionAlgorithm, ENCR_AES_CBC));
    }

    #[test]
    fn test_select_no_common_group() {
        let configured = vec![aes_sha256_proposal(14)];
        let supplied = vec![aes_sha256_proposal(19)];

        assert!(select_proposal(&configured, &supplied, SelectionFlags::default()).is_none());
    }

    #[test]
    fn test_selected_subset_of_supplied() {
        let mut wide = aes_sha256_proposal(14).add_transform(TransformType::KeyExchangeMethod, 19);
        wide.spi = Some(0x1122334455667788);
        let configured = vec![aes_sha256_proposal(19)];

        let selected =
            select_proposal(&configured, &[wide.clone()], SelectionFlags::default()).unwrap();
        // every selected transform was offered by the peer
        for t in &selected.transforms {
            assert!(wide.has_transform(t.transform_type, t.transform_id));
        }
        // our preference picked group 19, the peer SPI survives
        assert_eq!(
            selected.get_algorithm(TransformType::KeyExchangeMethod),
            Some(19)
        );
        assert_eq!(selected.spi, Some(0x1122334455667788));
    }

    #[test]
    fn test_prefer_supplied_ordering() {
        let configured = vec![aes_sha256_proposal(14).add_transform(TransformType::KeyExchangeMethod, 19)];
        let supplied = vec![aes_sha256_proposal(19).add_transform(TransformType::KeyExchangeMethod, 14)];

        let ours_first = select_proposal(&configured, &supplied, SelectionFlags::default()).unwrap();
        assert_eq!(
            ours_first.get_algorithm(TransformType::KeyExchangeMethod),
            Some(14)
        );

        let theirs_first = select_proposal(
            &configured,
            &supplied,
            SelectionFlags {
                prefer_supplied: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            theirs_first.get_algorithm(TransformType::KeyExchangeMethod),
            Some(19)
        );
    }

    #[test]
    fn test_skip_private_algorithms() {
        let configured = vec![aes_sha256_proposal(14)];
        // peer offers a private-use group ahead of a standard one
        let supplied = vec![Proposal::new_ike(1)
            .add_keyed_transform(TransformType::EncryptionAlgorithm, ENCR_AES_CBC, 256)
            .add_transform(TransformType::PseudoRandomFunction, PRF_HMAC_SHA2_256)
            .add_transform(TransformType::IntegrityAlgorithm, AUTH_HMAC_SHA2_256_128)
            .add_transform(TransformType::KeyExchangeMethod, 1025)
            .add_transform(TransformType::KeyExchangeMethod, 14)];

        let selected = select_proposal(
            &configured,
            &supplied,
            SelectionFlags {
                skip_private: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            selected.get_algorithm(TransformType::KeyExchangeMethod),
            Some(14)
        );
    }

    #[test]
    fn test_promote_transform() {
        let mut proposal = aes_sha256_proposal(14).add_transform(TransformType::KeyExchangeMethod, 19);

        assert!(proposal.promote_transform(TransformType::KeyExchangeMethod, 19));
        assert_eq!(
            proposal.get_algorithm(TransformType::KeyExchangeMethod),
            Some(19)
        );
        // the other group is still advertised
        assert!(proposal.has_transform(TransformType::KeyExchangeMethod, 14));

        assert!(!proposal.promote_transform(TransformType::KeyExchangeMethod, 21));
    }

    #[test]
    fn test_additional_key_exchange_types_mismatch() {
        // a proposal with ADDKE1 never matches one without it
        let with_addke = aes_sha256_proposal(14)
            .add_transform(TransformType::AdditionalKeyExchange1, 35);
        let without = aes_sha256_proposal(14);

        assert!(select_proposal(&[with_addke], &[without], SelectionFlags::default()).is_none());
    }
}
