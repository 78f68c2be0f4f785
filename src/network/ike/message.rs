use crate::network::ike::proposal::Proposal;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeType {
    IkeSaInit = 34,
    IkeAuth = 35,
    CreateChildSa = 36,
    Informational = 37,
    // RFC 9242
    IkeIntermediate = 43,
    // RFC 9370
    IkeFollowupKe = 44,
}

/// Notify message types handled by this daemon (RFC 7296 and extensions).
/// Types up to 16383 signal errors, everything above is status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum NotifyType {
    UnsupportedCriticalPayload = 1,
    InvalidSyntax = 7,
    NoProposalChosen = 14,
    InvalidKePayload = 17,
    AuthenticationFailed = 24,
    NatDetectionSourceIp = 16388,
    NatDetectionDestinationIp = 16389,
    Cookie = 16390,
    MultipleAuthSupported = 16404,
    RedirectSupported = 16406,
    Redirect = 16407,
    RedirectedFrom = 16408,
    ChildlessIkev2Supported = 16418,
    FragmentationSupported = 16430,
    SignatureHashAlgorithms = 16431,
    UsePpk = 16435,
    // vendor extension, private use range
    MeConnectId = 40967,
}

/// Boundary between error and status notify types (RFC 7296 section 3.10.1).
pub const NOTIFY_ERROR_MAX: u16 = 16383;

impl NotifyType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(NotifyType::UnsupportedCriticalPayload),
            7 => Some(NotifyType::InvalidSyntax),
            14 => Some(NotifyType::NoProposalChosen),
            17 => Some(NotifyType::InvalidKePayload),
            24 => Some(NotifyType::AuthenticationFailed),
            16388 => Some(NotifyType::NatDetectionSourceIp),
            16389 => Some(NotifyType::NatDetectionDestinationIp),
            16390 => Some(NotifyType::Cookie),
            16404 => Some(NotifyType::MultipleAuthSupported),
            16406 => Some(NotifyType::RedirectSupported),
            16407 => Some(NotifyType::Redirect),
            16408 => Some(NotifyType::RedirectedFrom),
            16418 => Some(NotifyType::ChildlessIkev2Supported),
            16430 => Some(NotifyType::FragmentationSupported),
            16431 => Some(NotifyType::SignatureHashAlgorithms),
            16435 => Some(NotifyType::UsePpk),
            40967 => Some(NotifyType::MeConnectId),
            _ => None,
        }
    }

    pub fn is_error(value: u16) -> bool {
        value <= NOTIFY_ERROR_MAX
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IKEPayload {
    SA(SAPayload),
    KeyExchange(KeyExchangePayload),
    Nonce(NoncePayload),
    Notification(NotificationPayload),
    Unknown { payload_type: u8, data: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SAPayload {
    pub proposals: Vec<Proposal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchangePayload {
    pub method: u16,
    pub key_exchange_data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoncePayload {
    pub nonce_data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub protocol_id: u8,
    pub notify_message_type: u16,
    pub spi: Vec<u8>,
    pub notification_data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IKEMessage {
    pub initiator_spi: u64,
    pub responder_spi: u64,
    pub version: u8,
    pub exchange_type: ExchangeType,
    pub from_initiator: bool,
    pub request: bool,
    pub message_id: u32,
    pub payloads: Vec<IKEPayload>,
}

impl IKEMessage {
    pub fn new(exchange_type: ExchangeType, request: bool) -> Self {
        IKEMessage {
            initiator_spi: 0,
            responder_spi: 0,
            version: 0x20, // IKEv2
            exchange_type,
            from_initiator: request,
            request,
            message_id: 0,
            payloads: Vec::new(),
        }
    }

    pub fn add_payload(&mut self, payload: IKEPayload) {
        self.payloads.push(payload);
    }

    /// Append a notify payload. Payload order is preserved, so notifies added
    /// before the SA payload (e.g. COOKIE) end up first on the wire. With
    /// `flush` set, payloads queued so far are discarded first, so an error
    /// notify travels alone even when negotiation payloads were already built.
    pub fn add_notify(&mut self, flush: bool, notify_type: NotifyType, data: Vec<u8>) {
        if flush {
            self.payloads.clear();
        }
        self.payloads
            .push(IKEPayload::Notification(NotificationPayload {
                protocol_id: 1, // IKE
                notify_message_type: notify_type as u16,
                spi: Vec::new(),
                notification_data: data,
            }));
    }

    pub fn notifies(&self) -> impl Iterator<Item = &NotificationPayload> {
        self.payloads.iter().filter_map(|p| match p {
            IKEPayload::Notification(n) => Some(n),
            _ => None,
        })
    }

    pub fn get_notify(&self, notify_type: NotifyType) -> Option<&NotificationPayload> {
        self.notifies()
            .find(|n| n.notify_message_type == notify_type as u16)
    }

    pub fn ke_payload(&self) -> Option<&KeyExchangePayload> {
        self.payloads.iter().find_map(|p| match p {
            IKEPayload::KeyExchange(ke) => Some(ke),
            _ => None,
        })
    }

    pub fn nonce_payload(&self) -> Option<&NoncePayload> {
        self.payloads.iter().find_map(|p| match p {
            IKEPayload::Nonce(n) => Some(n),
            _ => None,
        })
    }

    pub fn sa_payload(&self) -> Option<&SAPayload> {
        self.payloads.iter().find_map(|p| match p {
            IKEPayload::SA(sa) => Some(sa),
            _ => None,
        })
    }
}

/// Encode the key exchange group for an INVALID_KE_PAYLOAD notify
/// (unsigned 16-bit, network byte order).
pub fn ke_group_data(method: u16) -> Vec<u8> {
    method.to_be_bytes().to_vec()
}

pub fn parse_ke_group(data: &[u8]) -> Option<u16> {
    if data.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([data[0], data[1]]))
}

/// Gateway identity carried in REDIRECT and REDIRECTED_FROM notifies
/// (RFC 5685 section 6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayIdentity {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Fqdn(String),
}

impl GatewayIdentity {
    pub fn from_addr(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(ip) => GatewayIdentity::Ipv4(ip),
            IpAddr::V6(ip) => GatewayIdentity::Ipv6(ip),
        }
    }
}

impl std::fmt::Display for GatewayIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayIdentity::Ipv4(ip) => write!(f, "{}", ip),
            GatewayIdentity::Ipv6(ip) => write!(f, "{}", ip),
            GatewayIdentity::Fqdn(name) => write!(f, "{}", name),
        }
    }
}

/// Encode redirect notification data: gateway identity type, identity length,
/// identity octets, then the echoed nonce (empty for REDIRECTED_FROM).
pub fn redirect_data_create(gateway: &GatewayIdentity, nonce: &[u8]) -> Vec<u8> {
    let (ident_type, ident): (u8, Vec<u8>) = match gateway {
        GatewayIdentity::Ipv4(ip) => (1, ip.octets().to_vec()),
        GatewayIdentity::Ipv6(ip) => (2, ip.octets().to_vec()),
        GatewayIdentity::Fqdn(name) => (3, name.as_bytes().to_vec()),
    };
    let mut data = Vec::with_capacity(2 + ident.len() + nonce.len());
    data.push(ident_type);
    data.push(ident.len() as u8);
    data.extend_from_slice(&ident);
    data.extend_from_slice(nonce);
    data
}

/// Parse redirect notification data into (gateway, nonce). The nonce is
/// whatever trails the identity and may be empty.
pub fn redirect_data_parse(data: &[u8]) -> Option<(GatewayIdentity, Vec<u8>)> {
    if data.len() < 2 {
        return None;
    }
    let ident_type = data[0];
    let ident_len = data[1] as usize;
    let rest = &data[2..];
    if rest.len() < ident_len {
        return None;
    }
    let (ident, nonce) = rest.split_at(ident_len);
    let gateway = match ident_type {
        1 => {
            let octets: [u8; 4] = ident.try_into().ok()?;
            GatewayIdentity::Ipv4(Ipv4Addr::from(octets))
        }
        2 => {
            let octets: [u8; 16] = ident.try_into().ok()?;
            GatewayIdentity::Ipv6(Ipv6Addr::from(octets))
        }
        3 => GatewayIdentity::Fqdn(String::from_utf8(ident.to_vec()).ok()?),
        _ => return None,
    };
    Some((gateway, nonce.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ke_group_network_byte_order() {
        assert_eq!(ke_group_data(14), vec![0x00, 0x0e]);
        assert_eq!(parse_ke_group(&[0x00, 0x0e]), Some(14));
        assert_eq!(parse_ke_group(&[0x00]), None);
    }

    #[test]
    fn test_notify_error_boundary() {
        assert!(NotifyType::is_error(NotifyType::NoProposalChosen as u16));
        assert!(NotifyType::is_error(16383));
        assert!(!NotifyType::is_error(NotifyType::Cookie as u16));
    }

    #[test]
    fn test_notify_order_preserved() {
        let mut msg = IKEMessage::new(ExchangeType::IkeSaInit, true);
        msg.add_notify(false, NotifyType::Cookie, vec![0x11, 0x22]);
        msg.add_payload(IKEPayload::Nonce(NoncePayload {
            nonce_data: vec![0u8; 32],
        }));

        match &msg.payloads[0] {
            IKEPayload::Notification(n) => {
                assert_eq!(n.notify_message_type, NotifyType::Cookie as u16);
            }
            other => panic!("expected notify first, got {:?}", other),
        }
    }

    #[test]
    fn test_flushing_notify_discards_queued_payloads() {
        let mut msg = IKEMessage::new(ExchangeType::IkeSaInit, false);
        msg.add_payload(IKEPayload::Nonce(NoncePayload {
            nonce_data: vec![0u8; 32],
        }));
        msg.add_notify(false, NotifyType::FragmentationSupported, Vec::new());

        msg.add_notify(true, NotifyType::NoProposalChosen, Vec::new());

        assert_eq!(msg.payloads.len(), 1);
        assert!(msg.get_notify(NotifyType::NoProposalChosen).is_some());
    }

    #[test]
    fn test_redirect_data_fqdn() {
        let gateway = GatewayIdentity::Fqdn("vpn2.example.com".to_string());
        let nonce = vec![0xaa; 32];
        let data = redirect_data_create(&gateway, &nonce);

        let (parsed, echoed) = redirect_data_parse(&data).unwrap();
        assert_eq!(parsed, gateway);
        assert_eq!(echoed, nonce);
    }

    #[test]
    fn test_redirect_data_truncated() {
        let data = vec![3, 200, b'a'];
        assert!(redirect_data_parse(&data).is_none());
    }
}
