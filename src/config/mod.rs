//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::crypto::{AuthDigest, DataCipher};

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Carrier protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    #[default]
    Udp,
    Tcp,
}

impl Proto {
    /// The spelling used inside the remote-options string.
    pub fn options_label(self) -> &'static str {
        match self {
            Proto::Udp => "UDPv4",
            Proto::Tcp => "TCPv4",
        }
    }
}

/// Compression advertisement. Only no-op variants are accepted; anything
/// that would actually compress is rejected at validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Empty,
    Stub,
    LzoNo,
}

impl Compression {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "" => Ok(Compression::None),
            "empty" => Ok(Compression::Empty),
            "stub" => Ok(Compression::Stub),
            "lzo-no" => Ok(Compression::LzoNo),
            other => Err(ConfigError::Invalid(format!("unsupported compression: {other}"))),
        }
    }

    /// Suffix appended to the remote-options string, if any.
    fn options_suffix(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Empty => ",compress",
            Compression::Stub => ",compress stub",
            Compression::LzoNo => ",lzo-comp no",
        }
    }
}

/// The configuration record consumed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote gateway host (name or address).
    pub remote: String,
    /// Remote gateway port.
    pub port: u16,
    /// Carrier protocol.
    #[serde(default)]
    pub proto: Proto,

    /// Root CA: a PEM file path, or the PEM text itself.
    #[serde(default)]
    pub ca: String,
    /// Client certificate: a PEM file path, or the PEM text itself.
    pub cert: Option<String>,
    /// Client private key: a PEM file path, or the PEM text itself.
    pub key: Option<String>,
    /// Credentials file with username and password on separate lines.
    pub auth_user_pass: Option<String>,

    /// Data-channel cipher suite, e.g. `AES-256-GCM`.
    #[serde(default = "default_cipher")]
    pub cipher: String,
    /// Data-channel auth digest, e.g. `SHA256`.
    #[serde(default = "default_auth")]
    pub auth: String,
    /// Compression advertisement: one of ``, `empty`, `stub`, `lzo-no`.
    #[serde(default)]
    pub compress: String,

    /// Highest TLS version to offer: `1.2` or `1.3`.
    pub tls_max_version: Option<String>,

    /// Total handshake deadline in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_cipher() -> String {
    "AES-256-GCM".to_string()
}

fn default_auth() -> String {
    "SHA256".to_string()
}

fn default_handshake_timeout() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote: String::new(),
            port: 1194,
            proto: Proto::Udp,
            ca: String::new(),
            cert: None,
            key: None,
            auth_user_pass: None,
            cipher: default_cipher(),
            auth: default_auth(),
            compress: String::new(),
            tls_max_version: None,
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Read(e.to_string()))
    }

    /// Checks internal consistency: address, cipher names, compression,
    /// and that some authentication material is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.is_empty() {
            return Err(ConfigError::Invalid("remote host is required".into()));
        }
        DataCipher::from_suite(&self.cipher)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        AuthDigest::from_name(&self.auth).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.compression()?;
        if let Some(v) = &self.tls_max_version {
            if v != "1.2" && v != "1.3" {
                return Err(ConfigError::Invalid(format!("unsupported tls version: {v}")));
            }
        }
        if self.ca.is_empty() {
            return Err(ConfigError::Invalid("ca is required".into()));
        }
        let has_cert = self.cert.is_some() && self.key.is_some();
        if !has_cert && self.auth_user_pass.is_none() {
            return Err(ConfigError::Invalid(
                "expected certificate or username/password".into(),
            ));
        }
        Ok(())
    }

    pub fn compression(&self) -> Result<Compression, ConfigError> {
        Compression::from_name(&self.compress)
    }

    /// `host:port` form for the dialer.
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote, self.port)
    }

    /// Reads PEM material that may be given inline or as a file path.
    pub fn read_pem(value: &str) -> Result<Vec<u8>, ConfigError> {
        if value.contains("-----BEGIN") {
            return Ok(value.as_bytes().to_vec());
        }
        std::fs::read(value).map_err(|e| ConfigError::Read(format!("{value}: {e}")))
    }

    /// Loads `username`/`password` from the auth file, if configured.
    pub fn load_credentials(&self) -> Result<Option<(String, String)>, ConfigError> {
        let Some(path) = &self.auth_user_pass else {
            return Ok(None);
        };
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(format!("{path}: {e}")))?;
        let mut lines = content.lines();
        let user = lines.next().unwrap_or("").trim().to_string();
        let pass = lines.next().unwrap_or("").trim().to_string();
        if user.is_empty() || pass.is_empty() {
            return Err(ConfigError::Invalid("auth file needs username and password lines".into()));
        }
        Ok(Some((user, pass)))
    }

    /// Renders the remote-options string advertised to the server inside
    /// the key exchange.
    pub fn remote_options_string(&self) -> String {
        if self.cipher.is_empty() {
            return String::new();
        }
        let keysize = self
            .cipher
            .split('-')
            .nth(1)
            .unwrap_or("256")
            .to_string();
        let mut opts = format!(
            "V1,dev-type tun,link-mtu 1549,tun-mtu 1500,proto {},cipher {},auth {},keysize {},key-method 2,tls-client",
            self.proto.options_label(),
            self.cipher,
            self.auth.to_lowercase(),
            keysize,
        );
        if let Ok(c) = self.compression() {
            opts.push_str(c.options_suffix());
        }
        opts
    }

    /// Free-form `key=value` lines describing this client, sent in the
    /// peer-info field of the key exchange.
    pub fn peer_info_string(&self) -> String {
        format!(
            "IV_VER={}\nIV_PLAT={}\nIV_PROTO=2\n",
            crate::VERSION,
            std::env::consts::OS
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            remote: "vpn.example.net".into(),
            port: 1194,
            proto: Proto::Udp,
            ca: "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n".into(),
            cert: Some("client.pem".into()),
            key: Some("client.key".into()),
            cipher: "AES-128-GCM".into(),
            auth: "SHA512".into(),
            ..Config::default()
        }
    }

    #[test]
    fn test_validate_accepts_good_config() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut c = valid_config();
        c.remote = String::new();
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.ca = String::new();
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.cert = None;
        c.key = None;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_cipher_and_compression() {
        let mut c = valid_config();
        c.cipher = "BF-CBC".into();
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.compress = "lz4".into();
        assert!(c.validate().is_err());

        for ok in ["", "empty", "stub", "lzo-no"] {
            let mut c = valid_config();
            c.compress = ok.into();
            c.validate().unwrap();
        }
    }

    #[test]
    fn test_remote_options_string_tcp() {
        let mut c = valid_config();
        c.proto = Proto::Tcp;
        assert_eq!(
            c.remote_options_string(),
            "V1,dev-type tun,link-mtu 1549,tun-mtu 1500,proto TCPv4,cipher AES-128-GCM,auth sha512,keysize 128,key-method 2,tls-client"
        );
    }

    #[test]
    fn test_remote_options_string_compress_variants() {
        let mut c = valid_config();
        c.compress = "stub".into();
        assert!(c.remote_options_string().ends_with(",tls-client,compress stub"));

        c.compress = "lzo-no".into();
        assert!(c.remote_options_string().ends_with(",tls-client,lzo-comp no"));

        c.compress = "empty".into();
        assert!(c.remote_options_string().ends_with(",tls-client,compress"));
    }

    #[test]
    fn test_remote_options_empty_without_cipher() {
        let mut c = valid_config();
        c.cipher = String::new();
        assert_eq!(c.remote_options_string(), "");
    }

    #[test]
    fn test_remote_addr() {
        assert_eq!(valid_config().remote_addr(), "vpn.example.net:1194");
    }

    #[test]
    fn test_read_pem_inline() {
        let pem = "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----";
        assert_eq!(Config::read_pem(pem).unwrap(), pem.as_bytes());
        assert!(Config::read_pem("/definitely/not/a/file.pem").is_err());
    }

    #[test]
    fn test_load_credentials() {
        let dir = std::env::temp_dir().join("rovpn-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("auth.txt");
        std::fs::write(&path, "user\npassword\n").unwrap();

        let mut c = valid_config();
        c.auth_user_pass = Some(path.to_string_lossy().into_owned());
        assert_eq!(
            c.load_credentials().unwrap(),
            Some(("user".to_string(), "password".to_string()))
        );

        std::fs::write(&path, "only-user\n").unwrap();
        assert!(c.load_credentials().is_err());

        c.auth_user_pass = None;
        assert_eq!(c.load_credentials().unwrap(), None);
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = std::env::temp_dir().join("rovpn-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let c = valid_config();
        c.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.remote, c.remote);
        assert_eq!(loaded.proto, c.proto);
        assert_eq!(loaded.cipher, c.cipher);
        assert_eq!(loaded.handshake_timeout_secs, 60);
    }

    #[test]
    fn test_peer_info_lines() {
        let pi = valid_config().peer_info_string();
        assert!(pi.starts_with("IV_VER="));
        assert!(pi.contains("IV_PLAT="));
    }
}
