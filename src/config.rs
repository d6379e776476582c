//! Configuration surface for the gateway.
//!
//! Carries the teacher's SSH algorithm compatibility lists unchanged, plus
//! the full configuration structs the gateway's components are parameterised
//! by. Parsing these out of a config file or environment is an external
//! collaborator's job; this module only defines the contract and sane
//! `Default` values.

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac, Preferred};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All supported key exchange algorithms in order of preference.
///
/// Includes modern algorithms like Curve25519 as well as legacy Diffie-Hellman
/// variants for compatibility with older devices.
pub const ALL_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA1,
    kex::DH_GEX_SHA256,
    kex::DH_G1_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G15_SHA512,
    kex::DH_G16_SHA512,
    kex::DH_G17_SHA512,
    kex::DH_G18_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::NONE,
];

/// All supported cipher algorithms for encryption.
///
/// Includes modern ciphers like AES-GCM and ChaCha20-Poly1305, as well as
/// legacy CBC mode ciphers for compatibility with older devices.
pub static ALL_CIPHERS: &[cipher::Name] = &[
    cipher::CLEAR,
    cipher::NONE,
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_256_GCM,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
    cipher::CHACHA20_POLY1305,
];

/// All supported MAC (Message Authentication Code) algorithms.
///
/// Includes both standard HMAC variants and ETM (Encrypt-then-MAC) variants
/// for enhanced security.
pub const ALL_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::NONE,
    mac::HMAC_SHA1,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
];

/// All supported compression algorithms.
///
/// Includes ZLIB compression variants as well as no compression for
/// maximum compatibility.
pub const ALL_COMPRESSION_ALGORITHMS: &[compression::Name] = &[
    compression::NONE,
    compression::ZLIB,
    compression::ZLIB_LEGACY,
];

/// All supported host key algorithms.
///
/// Includes modern algorithms like Ed25519 and ECDSA, as well as legacy
/// RSA and DSA for compatibility with older devices.
pub const ALL_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Dsa,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Ed25519,
    Algorithm::Rsa { hash: None },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::SkEcdsaSha2NistP256,
    Algorithm::SkEd25519,
];

/// Modern-only subset of [`ALL_KEX_ORDER`] used by [`SecurityLevel::Secure`].
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

pub static SECURE_CIPHERS: &[cipher::Name] =
    &[cipher::AES_256_GCM, cipher::CHACHA20_POLY1305, cipher::AES_256_CTR];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[mac::HMAC_SHA256_ETM, mac::HMAC_SHA512_ETM];

/// Middle-ground subset used by [`SecurityLevel::Balanced`].
pub const BALANCED_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G14_SHA256,
    kex::DH_GEX_SHA256,
];

pub const BALANCED_KEY_TYPES: &[Algorithm] = ALL_KEY_TYPES;

pub static BALANCED_CIPHERS: &[cipher::Name] = &[
    cipher::AES_256_GCM,
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

pub const BALANCED_MAC_ALGORITHMS: &[mac::Name] =
    &[mac::HMAC_SHA256_ETM, mac::HMAC_SHA512_ETM, mac::HMAC_SHA256, mac::HMAC_SHA512];

/// Everything, including weak algorithms, used by [`SecurityLevel::LegacyCompatible`].
pub const LEGACY_KEX_ORDER: &[kex::Name] = ALL_KEX_ORDER;
pub const LEGACY_KEY_TYPES: &[Algorithm] = ALL_KEY_TYPES;
pub static LEGACY_CIPHERS: &[cipher::Name] = ALL_CIPHERS;
pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = ALL_MAC_ALGORITHMS;
pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] = ALL_COMPRESSION_ALGORITHMS;

/// Closed set of SSH authentication methods the pipeline may negotiate
/// (spec §4.6, §6 `allowedAuthMethods`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethodName {
    Password,
    Publickey,
    KeyboardInteractive,
}

/// Unknown-host-key policy when the trust store has no record (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownKeyAction {
    Prompt,
    Alert,
    Reject,
}

/// Host-key verification mode (spec §6 `mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyVerificationMode {
    Hybrid,
    ServerOnly,
    ClientOnly,
}

/// SSH algorithm policy, carried unchanged from the teacher's
/// `ConnectionSecurityOptions`/`SecurityLevel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityLevel {
    Secure,
    Balanced,
    LegacyCompatible,
}

impl SecurityLevel {
    pub fn preferred(self) -> Preferred {
        match self {
            SecurityLevel::Secure => Preferred {
                kex: Cow::Borrowed(SECURE_KEX_ORDER),
                key: Cow::Borrowed(SECURE_KEY_TYPES),
                cipher: Cow::Borrowed(SECURE_CIPHERS),
                mac: Cow::Borrowed(SECURE_MAC_ALGORITHMS),
                compression: Cow::Borrowed(DEFAULT_COMPRESSION_ALGORITHMS),
            },
            SecurityLevel::Balanced => Preferred {
                kex: Cow::Borrowed(BALANCED_KEX_ORDER),
                key: Cow::Borrowed(BALANCED_KEY_TYPES),
                cipher: Cow::Borrowed(BALANCED_CIPHERS),
                mac: Cow::Borrowed(BALANCED_MAC_ALGORITHMS),
                compression: Cow::Borrowed(DEFAULT_COMPRESSION_ALGORITHMS),
            },
            SecurityLevel::LegacyCompatible => Preferred {
                kex: Cow::Borrowed(LEGACY_KEX_ORDER),
                key: Cow::Borrowed(LEGACY_KEY_TYPES),
                cipher: Cow::Borrowed(LEGACY_CIPHERS),
                mac: Cow::Borrowed(LEGACY_MAC_ALGORITHMS),
                compression: Cow::Borrowed(DEFAULT_COMPRESSION_ALGORITHMS),
            },
        }
    }
}

/// `readyTimeout` / keepalive / algorithm parameters for dialing (spec §4.7, §6).
#[derive(Debug, Clone)]
pub struct SshDialConfig {
    pub ready_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_count_max: u32,
}

impl Default for SshDialConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(20),
            keepalive_interval: Duration::from_secs(15),
            keepalive_count_max: 3,
        }
    }
}

/// SFTP-related limits (spec §6).
#[derive(Debug, Clone)]
pub struct SftpConfig {
    pub max_file_size: u64,
    pub blocked_extensions: Vec<String>,
    pub allowed_paths: Vec<String>,
    pub max_concurrent_transfers: usize,
    pub chunk_rate_limit_bytes_per_sec: u64,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            max_file_size: 1024 * 1024 * 1024,
            blocked_extensions: vec!["exe".into(), "sh".into(), "bat".into()],
            allowed_paths: Vec::new(),
            max_concurrent_transfers: 4,
            chunk_rate_limit_bytes_per_sec: 0,
        }
    }
}

/// Connection pool tuning (spec §4.2, §6).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            idle_timeout: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// Host-key verification policy (spec §4.7, §4.9, §6).
#[derive(Debug, Clone)]
pub struct HostKeyVerificationConfig {
    pub enabled: bool,
    pub mode: HostKeyVerificationMode,
    pub unknown_key_action: UnknownKeyAction,
    pub trust_store_path: String,
    pub prompt_timeout: Duration,
}

impl Default for HostKeyVerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: HostKeyVerificationMode::Hybrid,
            unknown_key_action: UnknownKeyAction::Prompt,
            trust_store_path: "known_hosts.sqlite3".to_string(),
            prompt_timeout: Duration::from_secs(5),
        }
    }
}

/// Browser session lifetime policy (spec §6).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub secret: String,
    pub session_timeout: Duration,
    pub max_history_size: usize,
    pub allow_replay_credentials: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            session_timeout: Duration::from_secs(30 * 60),
            max_history_size: 100,
            allow_replay_credentials: false,
        }
    }
}

/// Single-sign-on trusted-header mapping (spec §6).
#[derive(Debug, Clone, Default)]
pub struct SsoConfig {
    pub enabled: bool,
    pub trusted_proxies: Vec<String>,
    /// Maps an inbound HTTP header name to a credential field (`username`, `password`).
    pub header_field_mapping: HashMap<String, String>,
}

/// Top-level configuration surface (spec §6 "Configuration surface").
///
/// An external config loader (env vars, TOML/YAML file) is responsible for
/// populating this struct; the gateway only consumes it.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    pub cors_origins: Vec<String>,
    pub allowed_subnets: Vec<String>,
    pub env_allowlist: Vec<String>,
    pub allowed_auth_methods: Vec<AuthMethodName>,
    pub output_rate_limit_bytes_per_sec: u64,
    pub socket_high_water_mark: usize,
    pub dial: SshDialConfig,
    pub sftp: SftpConfig,
    pub pool: PoolConfig,
    pub host_key: HostKeyVerificationConfig,
    pub session: SessionConfig,
    pub sso: SsoConfig,
    pub security_level: SecurityLevel,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 8080,
            cors_origins: Vec::new(),
            allowed_subnets: Vec::new(),
            env_allowlist: Vec::new(),
            allowed_auth_methods: vec![
                AuthMethodName::Password,
                AuthMethodName::KeyboardInteractive,
            ],
            output_rate_limit_bytes_per_sec: 0,
            socket_high_water_mark: 16 * 1024,
            dial: SshDialConfig::default(),
            sftp: SftpConfig::default(),
            pool: PoolConfig::default(),
            host_key: HostKeyVerificationConfig::default(),
            session: SessionConfig::default(),
            sso: SsoConfig::default(),
            security_level: SecurityLevel::Secure,
        }
    }
}
