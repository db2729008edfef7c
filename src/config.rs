use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::net::IpAddr;

use anyhow::{anyhow, Context, Result};

use crate::scoring::{ClassifierConfig, MAX_THREAT_LEVEL};
use crate::stall::{StallConfig, DEFAULT_CHUNK_REPEAT, DEFAULT_MAX_MESSAGES};
use crate::telemetry::RotationConfig;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://tarpit.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub tls: Option<TlsPaths>,
    pub stall: StallConfig,
    pub database_url: String,
    pub db_max_connections: u32,
    /// Decoys seeded into the honeypot catalog at startup.
    pub payloads: BTreeMap<String, String>,
    pub classifier: ClassifierConfig,
    pub flag_threshold: u8,
    pub max_request_bytes: Option<usize>,
    pub api_enabled: bool,
    pub api_tokens: Option<HashSet<String>>,
    pub rescore_on_start: bool,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
    pub log_sample_n: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 8080,
            tls: None,
            stall: StallConfig::default(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            db_max_connections: 5,
            payloads: BTreeMap::new(),
            classifier: ClassifierConfig::default(),
            flag_threshold: MAX_THREAT_LEVEL,
            max_request_bytes: None,
            api_enabled: false,
            api_tokens: None,
            rescore_on_start: false,
            log_file: None,
            rotation: RotationConfig::default(),
            log_stdout: false,
            log_sample_n: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let bind = match non_empty_var("TARPIT_BIND") {
            Some(raw) => raw
                .parse::<IpAddr>()
                .map_err(|_| anyhow!("TARPIT_BIND must be an IP address"))?,
            None => IpAddr::from([0, 0, 0, 0]),
        };
        let port = match parse_optional_u64("PORT")? {
            Some(p) => u16::try_from(p).map_err(|_| anyhow!("PORT must be at most 65535"))?,
            None => 8080,
        };

        let tls = match (non_empty_var("TARPIT_TLS_CERT"), non_empty_var("TARPIT_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => return Err(anyhow!("TARPIT_TLS_CERT and TARPIT_TLS_KEY must be set together")),
        };

        let stall = StallConfig {
            enabled: parse_bool_env("TARPIT_STALL")?.unwrap_or(true),
            max_messages: parse_optional_u64("TARPIT_STALL_MAX_MESSAGES")?.unwrap_or(DEFAULT_MAX_MESSAGES),
            chunk_repeat: parse_optional_u64("TARPIT_STALL_CHUNK_REPEAT")?
                .map(|n| n.max(1) as usize)
                .unwrap_or(DEFAULT_CHUNK_REPEAT),
        };

        let database_url = non_empty_var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let db_max_connections = parse_optional_u64("TARPIT_DB_MAX_CONNECTIONS")?
            .map(|n| n.clamp(1, u64::from(u32::MAX)) as u32)
            .unwrap_or(5);

        let payloads = match non_empty_var("TARPIT_PAYLOADS") {
            Some(path) => {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read TARPIT_PAYLOADS '{}': file unreadable", path))?;
                serde_json::from_str::<BTreeMap<String, String>>(&content).with_context(|| {
                    format!(
                        "Failed to parse TARPIT_PAYLOADS '{}': expected a JSON object of file name to contents",
                        path
                    )
                })?
            }
            None => BTreeMap::new(),
        };

        let classifier = ClassifierConfig {
            extra_scanner_signatures: parse_list("TARPIT_SCANNER_SIGNATURES"),
            extra_sensitive_files: parse_list("TARPIT_SENSITIVE_FILES"),
        };

        let flag_threshold = match parse_optional_u64("TARPIT_FLAG_THRESHOLD")? {
            Some(n) if n <= u64::from(MAX_THREAT_LEVEL) => n as u8,
            Some(_) => {
                return Err(anyhow!(
                    "TARPIT_FLAG_THRESHOLD must be between 0 and {}",
                    MAX_THREAT_LEVEL
                ))
            }
            None => MAX_THREAT_LEVEL,
        };

        let api_tokens = non_empty_var("TARPIT_API_TOKENS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<HashSet<_>>()
            })
            .filter(|set: &HashSet<String>| !set.is_empty());

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        Ok(Self {
            bind,
            port,
            tls,
            stall,
            database_url,
            db_max_connections,
            payloads,
            classifier,
            flag_threshold,
            max_request_bytes: parse_optional_u64("TARPIT_MAX_REQUEST_BYTES")?.map(|v| v as usize),
            api_enabled: parse_bool_env("TARPIT_API")?.unwrap_or(false),
            api_tokens,
            rescore_on_start: parse_bool_env("TARPIT_RESCORE_ON_START")?.unwrap_or(false),
            log_file: non_empty_var("LOG_FILE"),
            rotation,
            log_stdout: parse_bool_env("TARPIT_LOG_STDOUT")?.unwrap_or(false),
            log_sample_n: parse_optional_u64("TARPIT_LOG_SAMPLE_N")?.filter(|n| *n > 1),
        })
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_list(var: &str) -> Vec<String> {
    non_empty_var(var)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
