//! Node configuration: `atombus.toml` defaults overridden by CLI flags.

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

/// Inclusive endpoint port range, written `lo:hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (lo, hi) = raw
            .split_once(':')
            .ok_or_else(|| format!("expected lo:hi, got {:?}", raw))?;
        let lo = lo.parse().map_err(|_| format!("bad lower port: {}", lo))?;
        let hi = hi.parse().map_err(|_| format!("bad upper port: {}", hi))?;
        if lo > hi {
            return Err(format!("empty port range {}:{}", lo, hi));
        }
        Ok(Self { lo, hi })
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Optional `atombus.toml` contents; every field can be overridden on
/// the command line.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    pub hostname: Option<String>,
    pub ports_range: Option<PortRange>,
    pub peer_address: Option<String>,
    pub attention_broker_address: Option<String>,
    pub cache_dir: Option<String>,
    pub log_level: Option<String>,
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Loads the config file when present, otherwise empty defaults.
    pub fn load_optional(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_parses_and_validates() {
        let range: PortRange = "64000:64999".parse().unwrap();
        assert_eq!(range, PortRange { lo: 64000, hi: 64999 });
        assert!("64000".parse::<PortRange>().is_err());
        assert!("hi:lo".parse::<PortRange>().is_err());
        assert!("900:800".parse::<PortRange>().is_err());
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atombus.toml");
        std::fs::write(
            &path,
            "hostname = \"localhost:40001\"\nports_range = \"42000:42100\"\nlog_level = \"debug\"\n",
        )
        .unwrap();
        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.hostname.as_deref(), Some("localhost:40001"));
        assert_eq!(
            config.ports_range,
            Some(PortRange { lo: 42000, hi: 42100 })
        );
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.peer_address, None);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = NodeConfig::load_optional(Path::new("/nonexistent/atombus.toml")).unwrap();
        assert!(config.hostname.is_none());
    }
}
