use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub ike: IKESettings,
    pub negotiation: NegotiationSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonSettings {
    pub listen_port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IKESettings {
    /// Key exchange method offered first (IANA transform type 4 ID).
    pub ke_method: u16,
    /// Additional key exchange methods run via IKE_INTERMEDIATE, in order
    /// (RFC 9370, at most seven).
    pub additional_ke_methods: Vec<u16>,
}

/// Strict-negotiation knobs consulted by the IKE_SA_INIT task.
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct NegotiationSettings {
    /// Accept private-use algorithm IDs from peers not known to run our
    /// implementation.
    pub accept_private_algs: bool,
    /// Let our configured proposal order win over the peer's.
    pub prefer_configured_proposals: bool,
    /// Reuse the previous SA's key exchange method when rekeying.
    pub prefer_previous_dh_group: bool,
    /// Negotiate signature authentication hash algorithms (RFC 7427).
    pub signature_authentication: bool,
    /// Follow IKEv2 redirects (RFC 5685).
    pub follow_redirects: bool,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        NegotiationSettings {
            accept_private_algs: false,
            prefer_configured_proposals: true,
            prefer_previous_dh_group: true,
            signature_authentication: true,
            follow_redirects: true,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            daemon: DaemonSettings {
                listen_port: 500,
                log_level: "info".to_string(),
            },
            ike: IKESettings {
                ke_method: 31, // CURVE_25519
                additional_ke_methods: Vec::new(),
            },
            negotiation: NegotiationSettings::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("ikev2d.toml").required(false))
            .add_source(File::with_name("/etc/ikev2d/config.toml").required(false))
            .add_source(Environment::with_prefix("IKEV2D"))
            .set_default("daemon.listen_port", 500)?
            .set_default("daemon.log_level", "info")?
            .set_default("ike.ke_method", 31)?
            .set_default("ike.additional_ke_methods", Vec::<i64>::new())?
            .set_default("negotiation.accept_private_algs", false)?
            .set_default("negotiation.prefer_configured_proposals", true)?
            .set_default("negotiation.prefer_previous_dh_group", true)?
            .set_default("negotiation.signature_authentication", true)?
            .set_default("negotiation.follow_redirects", true)?
            .build()?;

        config.try_deserialize()
    }

    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let toml_content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }
}
