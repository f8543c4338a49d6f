use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::path::Path;

pub const DEFAULT_PORT: u16 = 5900;

#[derive(Serialize, Deserialize)]
pub struct ProxyConfig {
    pub address: String,
    pub store: String,
}

impl Default for ProxyConfig {
    fn default() -> ProxyConfig {
        ProxyConfig {
            address: format!("0.0.0.0:{}", DEFAULT_PORT),
            store: "vncmux.json".to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ProxyConfig {
        serdeconv::from_toml_file(path).expect("Error loading proxy configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();

        assert_eq!(config.address, "0.0.0.0:5900");
        assert_eq!(config.store, "vncmux.json");
    }

    #[test]
    fn test_toml_roundtrip() {
        let rendered =
            serdeconv::to_toml_string(&ProxyConfig::default()).expect("Error rendering config");
        let config: ProxyConfig =
            serdeconv::from_toml_str(&rendered).expect("Error parsing config");

        assert_eq!(config.address, "0.0.0.0:5900");
        assert_eq!(config.store, "vncmux.json");
    }
}
