//! YAML configuration
//!
//! The file is parsed into raw, all-optional structs that reject unknown keys,
//! then validated into the typed settings the links consume. Defaults are
//! applied during validation so the raw layer mirrors the file exactly.

use std::fs;
use std::path::{Path, PathBuf};

use gpsstats_driver::{LinkProvider, Links, OrchestratorError, PublishOptions, TOPIC};
use gpsstats_link::{
    GpsdLink, GpsdSettings, MqttAuth, MqttLink, MqttSettings, TlsSettings, TlsVersion,
    tls::cipher_suite_names,
};
use gpsstats_protocol::{QoS, mqtt};
use nix::unistd::{Group, User};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/gpsstats.cfg";

/// Account a root-started daemon switches to when `daemon.user` is unset
pub const DEFAULT_USER: &str = "nobody";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ============================================================================
// Raw file layout
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    daemon: RawDaemon,
    #[serde(default)]
    gpsd: RawGpsd,
    #[serde(default)]
    mqtt: RawMqtt,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDaemon {
    user: Option<String>,
    group: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGpsd {
    host: Option<String>,
    port: Option<i64>,
    device: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMqtt {
    client_id: Option<String>,
    host: Option<String>,
    port: Option<i64>,
    qos: Option<i64>,
    retain: Option<bool>,
    auth: Option<RawAuth>,
    tls: Option<RawTls>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAuth {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTls {
    ca_cert_file: Option<PathBuf>,
    ca_cert_path: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    verify_peer: Option<bool>,
    tls_version: Option<String>,
    ciphers: Option<String>,
}

// ============================================================================
// Validated configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonSettings {
    /// Account to switch to when started as root
    pub user: Option<String>,
    pub group: Option<String>,
}

impl DaemonSettings {
    /// The configured user, else [`DEFAULT_USER`]
    pub fn target_user(&self) -> &str {
        self.user.as_deref().unwrap_or(DEFAULT_USER)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub daemon: DaemonSettings,
    pub gpsd: GpsdSettings,
    pub mqtt: MqttSettings,
    pub publish: PublishOptions,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        // An empty or comment-only file means "all defaults"
        let value: serde_yaml::Value = serde_yaml::from_str(text)?;
        let raw: RawConfig = if value.is_null() {
            RawConfig::default()
        } else {
            serde_yaml::from_value(value)?
        };
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let daemon = validate_daemon(raw.daemon)?;
        let gpsd = GpsdSettings {
            host: raw.gpsd.host.unwrap_or_else(|| "localhost".to_string()),
            port: match raw.gpsd.port {
                Some(port) => validate_port("gpsd.port", port)?,
                None => gpsstats_protocol::gpsd::DEFAULT_PORT,
            },
            device: raw.gpsd.device,
            ..GpsdSettings::default()
        };
        let (mqtt, publish) = validate_mqtt(raw.mqtt)?;

        Ok(Self {
            daemon,
            gpsd,
            mqtt,
            publish,
        })
    }

    /// Writes the effective configuration to the debug log; never the password
    pub fn log_effective(&self) {
        debug!(
            host = %self.gpsd.host,
            port = self.gpsd.port,
            device = ?self.gpsd.device,
            "gpsd configuration"
        );
        debug!(
            client_id = %self.mqtt.client_id,
            host = %self.mqtt.host,
            port = self.mqtt.port,
            qos = self.publish.qos as u8,
            retain = self.publish.retain,
            username = ?self.mqtt.auth.as_ref().map(|a| &a.username),
            tls = self.mqtt.tls.is_some(),
            "mqtt configuration"
        );
        if let Some(ref tls) = self.mqtt.tls {
            debug!(
                ca_cert_file = ?tls.ca_cert_file,
                ca_cert_path = ?tls.ca_cert_path,
                cert_file = ?tls.cert_file,
                verify_peer = tls.verify_peer,
                version = %tls.version,
                ciphers = ?tls.ciphers,
                "mqtt tls configuration"
            );
        }
        debug!(
            user = self.daemon.target_user(),
            group = ?self.daemon.group,
            "daemon configuration"
        );
    }
}

fn validate_port(key: &str, port: i64) -> Result<u16, ConfigError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| invalid(format!("{} must be between 1 and 65535, got {}", key, port)))
}

fn validate_daemon(raw: RawDaemon) -> Result<DaemonSettings, ConfigError> {
    if let Some(ref name) = raw.user {
        match User::from_name(name) {
            Ok(Some(_)) => {},
            Ok(None) => return Err(invalid(format!("daemon.user: unknown user {:?}", name))),
            Err(e) => return Err(invalid(format!("daemon.user: lookup of {:?} failed: {}", name, e))),
        }
    }
    if let Some(ref name) = raw.group {
        match Group::from_name(name) {
            Ok(Some(_)) => {},
            Ok(None) => return Err(invalid(format!("daemon.group: unknown group {:?}", name))),
            Err(e) => {
                return Err(invalid(format!("daemon.group: lookup of {:?} failed: {}", name, e)));
            },
        }
    }
    Ok(DaemonSettings {
        user: raw.user,
        group: raw.group,
    })
}

fn validate_mqtt(raw: RawMqtt) -> Result<(MqttSettings, PublishOptions), ConfigError> {
    let qos = match raw.qos {
        Some(level) => u8::try_from(level)
            .ok()
            .and_then(|level| QoS::try_from(level).ok())
            .ok_or_else(|| invalid(format!("mqtt.qos must be 0, 1 or 2, got {}", level)))?,
        None => QoS::AtLeastOnce,
    };

    let auth = match raw.auth {
        Some(RawAuth {
            username: Some(username),
            password: Some(password),
        }) => Some(MqttAuth { username, password }),
        Some(_) => return Err(invalid("mqtt.auth needs both username and password")),
        None => None,
    };

    let tls = raw.tls.map(validate_tls).transpose()?;

    let port = match raw.port {
        Some(port) => validate_port("mqtt.port", port)?,
        None if tls.is_some() => mqtt::DEFAULT_TLS_PORT,
        None => mqtt::DEFAULT_PORT,
    };
    if let Some(ref tls) = tls {
        if port == mqtt::DEFAULT_PORT {
            warn!("mqtt.tls is configured but mqtt.port is {}, the plain MQTT port", port);
        }
        if !tls.verify_peer {
            warn!("mqtt.tls.verify_peer is false, the broker certificate will not be checked");
        }
    }

    let settings = MqttSettings {
        client_id: raw.client_id.unwrap_or_else(|| "gpsstats".to_string()),
        host: raw.host.unwrap_or_else(|| "localhost".to_string()),
        port,
        auth,
        tls,
        ..MqttSettings::default()
    };
    let publish = PublishOptions {
        topic: TOPIC.to_string(),
        qos,
        retain: raw.retain.unwrap_or(false),
    };
    Ok((settings, publish))
}

fn validate_tls(raw: RawTls) -> Result<TlsSettings, ConfigError> {
    if raw.ca_cert_file.is_none() && raw.ca_cert_path.is_none() {
        return Err(invalid("mqtt.tls needs ca_cert_file or ca_cert_path"));
    }
    if raw.cert_file.is_some() != raw.key_file.is_some() {
        return Err(invalid("mqtt.tls.cert_file and mqtt.tls.key_file go together"));
    }

    let version = match raw.tls_version {
        Some(ref v) => v
            .parse::<TlsVersion>()
            .map_err(|e| invalid(format!("mqtt.tls.tls_version: {}", e)))?,
        None => TlsVersion::default(),
    };

    if let Some(ref ciphers) = raw.ciphers {
        let known = cipher_suite_names();
        let mut any = false;
        for name in ciphers.split([':', ',']).map(str::trim).filter(|n| !n.is_empty()) {
            if !known.iter().any(|k| k.eq_ignore_ascii_case(name)) {
                return Err(invalid(format!(
                    "mqtt.tls.ciphers: unknown cipher suite {:?} (known: {})",
                    name,
                    known.join(", ")
                )));
            }
            any = true;
        }
        if !any {
            return Err(invalid("mqtt.tls.ciphers is empty"));
        }
    }

    Ok(TlsSettings {
        ca_cert_file: raw.ca_cert_file,
        ca_cert_path: raw.ca_cert_path,
        cert_file: raw.cert_file,
        key_file: raw.key_file,
        verify_peer: raw.verify_peer.unwrap_or(true),
        version,
        ciphers: raw.ciphers,
    })
}

// ============================================================================
// Link provider
// ============================================================================

/// Builds links from the configuration file, re-reading it on every reload
pub struct ConfigProvider {
    path: PathBuf,
    /// Already validated configuration used by the first `provide()`
    preloaded: Option<Config>,
    daemon: DaemonSettings,
}

impl ConfigProvider {
    pub fn new(path: PathBuf, config: Config) -> Self {
        Self {
            path,
            daemon: config.daemon.clone(),
            preloaded: Some(config),
        }
    }
}

impl LinkProvider for ConfigProvider {
    type Feed = GpsdLink;
    type Bus = MqttLink;

    fn provide(&mut self) -> Result<Links<GpsdLink, MqttLink>, OrchestratorError> {
        let config = match self.preloaded.take() {
            Some(config) => config,
            None => {
                let config = Config::load(&self.path)
                    .map_err(|e| OrchestratorError::Config(e.to_string()))?;
                info!("Configuration reloaded from {}", self.path.display());
                config
            },
        };
        config.log_effective();

        let bus = MqttLink::new(config.mqtt).map_err(|e| OrchestratorError::Config(e.to_string()))?;
        if config.daemon != self.daemon {
            warn!("daemon section changes take effect after a restart");
        }
        Ok(Links {
            feed: GpsdLink::new(config.gpsd),
            bus,
            publish: config.publish,
        })
    }
}
