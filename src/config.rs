//! Configuration structures
//!
//! Plain data deserializable from whatever front end loads them (YAML file,
//! CLI flags). Every field has a default so partial documents work.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Standard CoAP UDP port
pub const DEFAULT_COAP_PORT: u16 = 5683;

/// SID of the device's schema catalog checksum leaf
pub const DEFAULT_CHECKSUM_SID: i64 = 29304;

/// Where the transport connects
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportTarget {
    /// Point-to-point serial line
    Serial {
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// UDP datagrams to a bridge, one frame per datagram
    WifiBridge { address: String },
}

fn default_baud_rate() -> u32 {
    115_200
}

impl TransportTarget {
    /// Human-readable target used in logs and errors
    pub fn describe(&self) -> String {
        match self {
            Self::Serial { device, baud_rate } => format!("{device}@{baud_rate}"),
            Self::WifiBridge { address } => format!("udp://{address}"),
        }
    }
}

impl Default for TransportTarget {
    fn default() -> Self {
        Self::Serial {
            device: "/dev/ttyACM0".to_string(),
            baud_rate: default_baud_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub target: TransportTarget,
    /// Per-attempt response timeout
    pub request_timeout_ms: u64,
    /// Retransmissions after the first attempt
    pub max_retries: u32,
    /// How long `Device::open` waits for the announce frame
    pub ready_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            target: TransportTarget::default(),
            request_timeout_ms: 2000,
            max_retries: 3,
            ready_timeout_ms: 10_000,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Cache root; `None` selects the per-user cache directory
    pub cache_dir: Option<PathBuf>,
    /// Base location of `<checksum>.tar.gz` bundles (URL or directory)
    pub source: Option<String>,
    /// SID queried to learn the device's catalog checksum
    pub checksum_sid: i64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            source: None,
            checksum_sid: DEFAULT_CHECKSUM_SID,
        }
    }
}

/// Sibling key ordering used when encoding maps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    /// Order of first appearance in the device's schema
    #[default]
    Velocity,
    /// Ascending SID (CBOR canonical order)
    Rfc8949,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub sort_mode: SortMode,
    /// Block2 size exponent; block size is `2^(szx + 4)`
    pub block_szx: u8,
    /// Executable turning YANG into YIN
    pub yang_compiler: String,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            sort_mode: SortMode::default(),
            block_szx: 4,
            yang_compiler: "pyang".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub catalog: CatalogConfig,
    pub codec: CodecConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "transport": {"target": {"kind": "wifi-bridge", "address": "192.168.4.1"}},
                "codec": {"sort_mode": "rfc8949"}
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.transport.target,
            TransportTarget::WifiBridge {
                address: "192.168.4.1".into()
            }
        );
        assert_eq!(config.transport.max_retries, 3);
        assert_eq!(config.codec.sort_mode, SortMode::Rfc8949);
        assert_eq!(config.codec.block_szx, 4);
        assert_eq!(config.catalog.cache_dir, None);
    }

    #[test]
    fn test_serial_default_baud() {
        let target: TransportTarget =
            serde_json::from_str(r#"{"kind": "serial", "device": "/dev/ttyUSB1"}"#).unwrap();
        assert_eq!(target.describe(), "/dev/ttyUSB1@115200");
    }
}
