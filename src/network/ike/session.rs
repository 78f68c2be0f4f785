use crate::config::DaemonConfig;
use crate::network::ike::message::{ExchangeType, IKEMessage};
use crate::network::ike::proposal::{
    Proposal, TransformType, AUTH_HMAC_SHA2_256_128, ENCR_AES_CBC, PRF_HMAC_SHA2_256,
};
use crate::network::ike::sa::{IKEConfig, IKESession, PeerConfig, SessionServices};
use crate::network::ike::tasks::ike_init::{IKEInitTask, Role};
use crate::network::ike::tasks::{Task, TaskStatus};
use crate::network::ike::IKEError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

/// Upper bound on round trips per handshake, covering retries and all
/// additional key exchanges.
const MAX_EXCHANGE_ROUNDS: usize = 16;

/// The IKE configuration offered when no connection-specific one exists.
pub fn default_ike_config(ke_method: u16, additional_methods: &[u16]) -> IKEConfig {
    let mut proposal = Proposal::new_ike(1)
        .add_keyed_transform(TransformType::EncryptionAlgorithm, ENCR_AES_CBC, 256)
        .add_transform(TransformType::PseudoRandomFunction, PRF_HMAC_SHA2_256)
        .add_transform(TransformType::IntegrityAlgorithm, AUTH_HMAC_SHA2_256_128)
        .add_transform(TransformType::KeyExchangeMethod, ke_method);
    for (slot, method) in TransformType::ADDITIONAL_KEY_EXCHANGES
        .into_iter()
        .zip(additional_methods)
    {
        proposal = proposal.add_transform(slot, *method);
    }
    IKEConfig::new("default", vec![proposal])
}

struct PendingHandshake {
    sa: IKESession,
    task: IKEInitTask,
}

pub struct IKEDaemon {
    listen_addr: SocketAddr,
    config: DaemonConfig,
    socket: Option<Arc<UdpSocket>>,
    handshakes: Arc<RwLock<HashMap<u64, PendingHandshake>>>,
}

impl IKEDaemon {
    pub fn new(listen_addr: SocketAddr, config: DaemonConfig) -> Self {
        IKEDaemon {
            listen_addr,
            config,
            socket: None,
            handshakes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn start(&mut self) -> Result<SocketAddr, IKEError> {
        let socket = UdpSocket::bind(self.listen_addr).await?;
        let local_addr = socket.local_addr()?;
        tracing::info!("IKE daemon listening on {}", local_addr);

        let socket = Arc::new(socket);
        self.socket = Some(Arc::clone(&socket));

        let handshakes = Arc::clone(&self.handshakes);
        let config = self.config.clone();
        tokio::spawn(async move {
            Self::listen_loop(socket, handshakes, config, local_addr).await;
        });

        Ok(local_addr)
    }

    async fn listen_loop(
        socket: Arc<UdpSocket>,
        handshakes: Arc<RwLock<HashMap<u64, PendingHandshake>>>,
        config: DaemonConfig,
        local_addr: SocketAddr,
    ) {
        let mut buf = [0; 4096];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, addr)) => {
                    tracing::debug!("Received IKE packet from {} ({} bytes)", addr, size);

                    match Self::handle_packet(&buf[..size], addr, &handshakes, &config, local_addr)
                        .await
                    {
                        Ok(Some(reply)) => {
                            if let Err(e) = socket.send_to(&reply, addr).await {
                                tracing::error!("Failed to send IKE reply to {}: {}", addr, e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!("Error handling IKE packet: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("IKE socket error: {}", e);
                }
            }
        }
    }

    async fn handle_packet(
        data: &[u8],
        sender: SocketAddr,
        handshakes: &Arc<RwLock<HashMap<u64, PendingHandshake>>>,
        config: &DaemonConfig,
        local_addr: SocketAddr,
    ) -> Result<Option<Vec<u8>>, IKEError> {
        let message: IKEMessage = serde_json::from_slice(data)
            .map_err(|e| IKEError::Protocol(format!("Malformed IKE message: {}", e)))?;
        if !message.request {
            // responses are consumed by the initiating side
            return Ok(None);
        }

        let mut handshakes = handshakes.write().await;
        if !handshakes.contains_key(&message.initiator_spi) {
            if message.exchange_type != ExchangeType::IkeSaInit {
                return Err(IKEError::Protocol(
                    "Follow-up exchange for unknown IKE_SA".to_string(),
                ));
            }
            let sa = IKESession::new_responder(
                local_addr.ip(),
                sender.ip(),
                message.initiator_spi,
                default_ike_config(config.ike.ke_method, &config.ike.additional_ke_methods),
                PeerConfig::new(&sender.ip().to_string()),
                SessionServices::default(),
            )?;
            let task = IKEInitTask::new(&sa, Role::Responder, None, &config.negotiation);
            handshakes.insert(message.initiator_spi, PendingHandshake { sa, task });
        }
        let handshake = handshakes
            .get_mut(&message.initiator_spi)
            .ok_or_else(|| IKEError::Protocol("Lost handshake state".to_string()))?;

        handshake.task.process(&mut handshake.sa, &message);

        let mut response = IKEMessage::new(message.exchange_type, false);
        response.initiator_spi = message.initiator_spi;
        response.responder_spi = handshake.sa.id().responder_spi;
        response.from_initiator = false;
        response.message_id = message.message_id;

        let mut status = handshake.task.build(&mut handshake.sa, &mut response);
        let reply = serde_json::to_vec(&response)
            .map_err(|e| IKEError::Protocol(format!("Encoding IKE message failed: {}", e)))?;
        if let Some(post) = handshake.task.post_build(&mut handshake.sa, &response) {
            status = post;
        }

        match status {
            TaskStatus::Success => {
                tracing::info!("Completed IKE_SA_INIT with {}", sender);
                handshakes.remove(&message.initiator_spi);
            }
            TaskStatus::Failed => {
                tracing::warn!("IKE_SA_INIT with {} failed", sender);
                handshakes.remove(&message.initiator_spi);
            }
            TaskStatus::NeedMore => {}
        }

        Ok(Some(reply))
    }
}

/// Run an IKE_SA_INIT handshake against `remote`, including any additional
/// key exchanges, and return the session with derived keys.
pub async fn initiate(remote: SocketAddr, config: &DaemonConfig) -> Result<IKESession, IKEError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let local_addr = socket.local_addr()?;

    let mut sa = IKESession::new_initiator(
        local_addr.ip(),
        remote.ip(),
        default_ike_config(config.ike.ke_method, &config.ike.additional_ke_methods),
        PeerConfig::new(&remote.ip().to_string()),
        SessionServices::default(),
    )?;
    let mut task = IKEInitTask::new(&sa, Role::Initiator, None, &config.negotiation);

    let mut buf = vec![0u8; 4096];
    let mut message_id = 0u32;

    for _ in 0..MAX_EXCHANGE_ROUNDS {
        let mut request = IKEMessage::new(ExchangeType::IkeSaInit, true);
        request.initiator_spi = sa.id().initiator_spi;
        request.message_id = message_id;

        if task.build(&mut sa, &mut request) == TaskStatus::Failed {
            return Err(IKEError::Protocol("Building IKE_SA_INIT failed".to_string()));
        }
        let data = serde_json::to_vec(&request)
            .map_err(|e| IKEError::Protocol(format!("Encoding IKE message failed: {}", e)))?;
        socket.send_to(&data, remote).await?;
        tracing::debug!("Sent IKE message to {} ({} bytes)", remote, data.len());

        let (size, addr) = socket.recv_from(&mut buf).await?;
        if addr != remote {
            return Err(IKEError::Protocol("Unexpected sender address".to_string()));
        }
        let response: IKEMessage = serde_json::from_slice(&buf[..size])
            .map_err(|e| IKEError::Protocol(format!("Malformed IKE message: {}", e)))?;
        if sa.id().responder_spi == 0 {
            sa.set_responder_spi(response.responder_spi);
        }

        if task.pre_process(&mut sa, &response) == TaskStatus::Failed {
            return Err(IKEError::Protocol("IKE_SA_INIT response rejected".to_string()));
        }
        let mut status = task.process(&mut sa, &response);
        if let Some(post) = task.post_process(&mut sa, &response) {
            status = post;
        }

        match status {
            TaskStatus::Success => {
                tracing::info!("Completed IKE_SA_INIT with {}", remote);
                return Ok(sa);
            }
            TaskStatus::Failed => {
                return Err(IKEError::Protocol("IKE_SA_INIT failed".to_string()));
            }
            TaskStatus::NeedMore => {
                message_id += 1;
            }
        }
    }
    Err(IKEError::Protocol(
        "IKE_SA_INIT did not complete within the exchange limit".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ike::bus::testing::RecordingBus;
    use crate::network::ike::crypto::ECP_256;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_loopback_handshake() {
        let config = DaemonConfig::default();
        let mut daemon = IKEDaemon::new("127.0.0.1:0".parse().unwrap(), config.clone());
        let addr = daemon.start().await.unwrap();

        let sa = initiate(addr, &config).await.unwrap();
        assert!(sa.keymat().keys().is_some());
        assert_ne!(sa.id().responder_spi, 0);
    }

    #[tokio::test]
    async fn test_loopback_multi_ke_handshake() {
        let mut config = DaemonConfig::default();
        config.ike.additional_ke_methods = vec![ECP_256];
        let mut daemon = IKEDaemon::new("127.0.0.1:0".parse().unwrap(), config.clone());
        let addr = daemon.start().await.unwrap();

        // drive the wire by hand so the exchanges and key events are visible
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_addr = socket.local_addr().unwrap();
        let bus = Arc::new(RecordingBus::default());
        let services = SessionServices {
            bus: bus.clone(),
            ..Default::default()
        };
        let mut sa = IKESession::new_initiator(
            local_addr.ip(),
            addr.ip(),
            default_ike_config(config.ike.ke_method, &config.ike.additional_ke_methods),
            PeerConfig::new("responder"),
            services,
        )
        .unwrap();
        let mut task = IKEInitTask::new(&sa, Role::Initiator, None, &config.negotiation);

        let mut buf = vec![0u8; 4096];
        let mut exchanges = Vec::new();
        let mut completed = false;
        for message_id in 0..4u32 {
            let mut request = IKEMessage::new(ExchangeType::IkeSaInit, true);
            request.initiator_spi = sa.id().initiator_spi;
            request.message_id = message_id;
            assert_eq!(task.build(&mut sa, &mut request), TaskStatus::NeedMore);
            exchanges.push(request.exchange_type);

            let data = serde_json::to_vec(&request).unwrap();
            socket.send_to(&data, addr).await.unwrap();
            let (size, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let response: IKEMessage = serde_json::from_slice(&buf[..size]).unwrap();
            if sa.id().responder_spi == 0 {
                sa.set_responder_spi(response.responder_spi);
            }

            assert_eq!(task.pre_process(&mut sa, &response), TaskStatus::Success);
            let mut status = task.process(&mut sa, &response);
            if let Some(post) = task.post_process(&mut sa, &response) {
                status = post;
            }
            match status {
                TaskStatus::Success => {
                    completed = true;
                    break;
                }
                TaskStatus::NeedMore => {}
                TaskStatus::Failed => panic!("handshake failed"),
            }
        }

        assert!(completed);
        // the daemon routed the second exchange to the pending handshake
        assert_eq!(
            exchanges,
            vec![ExchangeType::IkeSaInit, ExchangeType::IkeIntermediate]
        );
        // one derivation per key exchange
        assert_eq!(bus.key_events.lock().unwrap().len(), 2);
        assert!(sa.keymat().keys().is_some());
    }

    #[tokio::test]
    async fn test_garbage_packet_does_not_kill_daemon() {
        let config = DaemonConfig::default();
        let mut daemon = IKEDaemon::new("127.0.0.1:0".parse().unwrap(), config.clone());
        let addr = daemon.start().await.unwrap();

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe.send_to(b"not an ike message", addr).await.unwrap();

        // a real handshake still succeeds afterwards
        let sa = initiate(addr, &config).await.unwrap();
        assert!(sa.keymat().keys().is_some());
    }
}
