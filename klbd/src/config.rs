use std::collections::HashSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Virtual service bind address; must be IPv4 with a nonzero port.
    pub bind: SocketAddr,
    /// Kernel scheduler name, passed through opaquely.
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    /// DNS-SD service type to browse, e.g. "_http._tcp".
    pub zeroconf_service: String,
    #[serde(default)]
    pub zeroconf_domain: Option<String>,
    #[serde(default)]
    pub zeroconf_interface: Option<String>,
}

fn default_scheduler() -> String {
    "rr".to_owned()
}

impl ServiceConfig {
    pub fn bind_v4(&self) -> Result<SocketAddrV4> {
        match self.bind {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(_) => bail!("bind address must be IPv4: {}", self.bind),
        }
    }
}

impl Config {
    /// Load and validate the configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            bail!("no services configured");
        }

        let mut binds = HashSet::new();
        for service in &self.services {
            let bind = service.bind_v4()?;
            if bind.port() == 0 {
                bail!("bind address must have a port: {bind}");
            }
            if !binds.insert(bind) {
                bail!("duplicate bind address: {bind}");
            }
            if service.zeroconf_service.is_empty() {
                bail!("zeroconf_service must not be empty (bind {bind})");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(toml: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_service_gets_defaults() {
        let config = parse(
            r#"
            [[service]]
            bind = "10.0.0.1:80"
            zeroconf_service = "_http._tcp"
            "#,
        )
        .unwrap();

        assert_eq!(config.services.len(), 1);
        let service = &config.services[0];
        assert_eq!(service.bind_v4().unwrap(), "10.0.0.1:80".parse().unwrap());
        assert_eq!(service.scheduler, "rr");
        assert_eq!(service.zeroconf_domain, None);
        assert_eq!(service.zeroconf_interface, None);
    }

    #[test]
    fn full_service_round_trips() {
        let config = parse(
            r#"
            [[service]]
            bind = "10.0.0.1:80"
            scheduler = "wrr"
            zeroconf_service = "_http._tcp"
            zeroconf_domain = "local"
            zeroconf_interface = "eth0"
            "#,
        )
        .unwrap();

        let service = &config.services[0];
        assert_eq!(service.scheduler, "wrr");
        assert_eq!(service.zeroconf_domain.as_deref(), Some("local"));
        assert_eq!(service.zeroconf_interface.as_deref(), Some("eth0"));
    }

    #[test]
    fn empty_service_list_is_rejected() {
        assert!(parse("").is_err());
    }

    #[test]
    fn ipv6_bind_is_rejected() {
        let err = parse(
            r#"
            [[service]]
            bind = "[2001:db8::1]:80"
            zeroconf_service = "_http._tcp"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("IPv4"));
    }

    #[test]
    fn zero_port_is_rejected() {
        assert!(parse(
            r#"
            [[service]]
            bind = "10.0.0.1:0"
            zeroconf_service = "_http._tcp"
            "#,
        )
        .is_err());
    }

    #[test]
    fn duplicate_bind_is_rejected() {
        let err = parse(
            r#"
            [[service]]
            bind = "10.0.0.1:80"
            zeroconf_service = "_http._tcp"

            [[service]]
            bind = "10.0.0.1:80"
            zeroconf_service = "_https._tcp"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn load_reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [[service]]
            bind = "192.168.1.10:443"
            zeroconf_service = "_https._tcp"
            "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.services[0].bind_v4().unwrap(), "192.168.1.10:443".parse().unwrap());
    }

    #[test]
    fn load_missing_file_fails_with_path_context() {
        let err = Config::load("/nonexistent/klbd.toml").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/klbd.toml"));
    }
}
