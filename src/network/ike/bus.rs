use crate::network::ike::proposal::Proposal;
use crate::network::ike::sa::IKESaId;

#[derive(Debug, Clone)]
pub enum Alert {
    /// No IKE proposal matched; carries the offers that failed to match.
    ProposalMismatchIke { proposals: Vec<Proposal> },
}

/// Raised once new IKE_SA keys have been derived.
#[derive(Debug, Clone)]
pub struct IKEKeysEvent {
    pub sa: IKESaId,
    /// Methods of the key exchanges that fed the derivation, in order.
    pub ke_methods: Vec<u16>,
    pub nonce_i: Vec<u8>,
    pub nonce_r: Vec<u8>,
    /// The SA whose SK_d seeded the derivation, when one did.
    pub rekeyed_from: Option<IKESaId>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub trait Bus: Send + Sync {
    fn alert(&self, alert: Alert);
    fn ike_keys(&self, event: IKEKeysEvent);
}

/// Default bus sink, reporting events through the log.
pub struct LoggingBus;

impl Bus for LoggingBus {
    fn alert(&self, alert: Alert) {
        match alert {
            Alert::ProposalMismatchIke { proposals } => {
                tracing::warn!("No matching IKE proposal among {} offers", proposals.len());
            }
        }
    }

    fn ike_keys(&self, event: IKEKeysEvent) {
        tracing::info!(
            "Derived IKE_SA keys for SPIs {:016x}_i {:016x}_r from {} key exchange(s)",
            event.sa.initiator_spi,
            event.sa.responder_spi,
            event.ke_methods.len()
        );
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Bus capturing events for assertions.
    #[derive(Default)]
    pub struct RecordingBus {
        pub alerts: Mutex<Vec<Alert>>,
        pub key_events: Mutex<Vec<IKEKeysEvent>>,
    }

    impl Bus for RecordingBus {
        fn alert(&self, alert: Alert) {
            self.alerts.lock().unwrap().push(alert);
        }

        fn ike_keys(&self, event: IKEKeysEvent) {
            self.key_events.lock().unwrap().push(event);
        }
    }
}
