//! Identity of the node this router runs on

use crate::config::{MachineConfig, MachineProvider};
use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    pub machine_id: String,
    pub region: String,
    pub private_ip: String,
    pub app_name: Option<String>,
}

impl MachineInfo {
    /// Identity taken straight from configuration
    pub fn local(machine_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            region: region.into(),
            private_ip: "127.0.0.1".to_string(),
            app_name: None,
        }
    }

    /// Identity from the Fly.io runtime environment
    pub fn from_fly_env() -> Result<Self> {
        Self::from_fly_vars(|key| std::env::var(key).ok())
    }

    fn from_fly_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.is_empty())
                .with_context(|| format!("{} is not set", key))
        };

        Ok(Self {
            machine_id: require("FLY_MACHINE_ID")?,
            region: require("FLY_REGION")?,
            private_ip: require("FLY_PRIVATE_IP")?,
            app_name: Some(require("FLY_APP_NAME")?),
        })
    }

    pub fn from_config(config: &MachineConfig) -> Result<Self> {
        match config.provider {
            MachineProvider::Local => {
                let mut info = Self::local(&config.machine_id, &config.region);
                if let Some(ip) = &config.private_ip {
                    info.private_ip = ip.clone();
                }
                Ok(info)
            }
            MachineProvider::Fly => Self::from_fly_env().context("fly machine identity"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_local_identity() {
        let info = MachineInfo::local("loc1", "local");
        assert_eq!(info.machine_id, "loc1");
        assert_eq!(info.private_ip, "127.0.0.1");
        assert_eq!(info.app_name, None);
    }

    #[test]
    fn test_fly_identity_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("FLY_MACHINE_ID", "e784"),
            ("FLY_REGION", "ord"),
            ("FLY_PRIVATE_IP", "fdaa::3"),
            ("FLY_APP_NAME", "edge"),
        ]
        .into_iter()
        .collect();

        let info = MachineInfo::from_fly_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(info.machine_id, "e784");
        assert_eq!(info.region, "ord");
        assert_eq!(info.private_ip, "fdaa::3");
        assert_eq!(info.app_name.as_deref(), Some("edge"));
    }

    #[test]
    fn test_fly_identity_requires_all_vars() {
        let err = MachineInfo::from_fly_vars(|k| (k != "FLY_REGION").then(|| "x".to_string())).unwrap_err();
        assert!(err.to_string().contains("FLY_REGION"));
    }

    #[test]
    fn test_from_local_config() {
        let config = MachineConfig {
            provider: MachineProvider::Local,
            machine_id: "m1".to_string(),
            region: "iad".to_string(),
            private_ip: Some("10.1.0.4".to_string()),
        };
        let info = MachineInfo::from_config(&config).unwrap();
        assert_eq!(info.machine_id, "m1");
        assert_eq!(info.private_ip, "10.1.0.4");
    }
}
