//! Program settings file.
//!
//! One `key=value` pair per line, values optionally double-quoted. Unknown
//! keys are ignored (logged). An unreadable or invalid file is a startup
//! fatal; the settings are never reloaded.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

/// Compiled-in location of the settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "config/settings/settings.conf";

#[derive(Debug, Clone)]
pub struct ProgramSettings {
    /// Cluster-mapping file (reloaded on SIGHUP).
    pub configuration_file: PathBuf,
    /// Ports-configuration file (polled for change).
    pub ports_configuration_file: PathBuf,
    /// Hosts file (polled for change).
    pub hosts_configuration_file: PathBuf,
    /// Bind address for the control and cluster-range listeners; empty means
    /// all interfaces.
    pub listener_host: String,
    /// Control listener port.
    pub listener_port: u16,
    pub cluster_ports_range_min: u16,
    pub cluster_ports_range_max: u16,
}

impl ProgramSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        Self::parse(&contents)
            .with_context(|| format!("invalid settings file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut configuration_file = None;
        let mut ports_configuration_file = None;
        let mut hosts_configuration_file = None;
        let mut listener_host = String::new();
        let mut listener_port = None;
        let mut cluster_ports_range_min = None;
        let mut cluster_ports_range_max = None;

        for line in contents.lines() {
            let halves: Vec<&str> = line.split('=').collect();
            if halves.len() != 2 {
                bail!("invalid settings line `{line}`: expected format setting=value");
            }

            let setting = halves[0];
            let value = halves[1].trim_matches('"');
            match setting {
                "configurationFile" => configuration_file = Some(PathBuf::from(value)),
                "portsConfigurationFile" => {
                    ports_configuration_file = Some(PathBuf::from(value))
                }
                "hostsConfigurationFile" => {
                    hosts_configuration_file = Some(PathBuf::from(value))
                }
                "listenerHost" => listener_host = value.to_string(),
                "listenerPort" => listener_port = Some(parse_port(setting, value)?),
                "clusterPortsRangeMin" => {
                    cluster_ports_range_min = Some(parse_port(setting, value)?)
                }
                "clusterPortsRangeMax" => {
                    cluster_ports_range_max = Some(parse_port(setting, value)?)
                }
                _ => debug!(setting, "skipping unknown settings entry"),
            }
        }

        Ok(Self {
            configuration_file: configuration_file.context("missing configurationFile")?,
            ports_configuration_file: ports_configuration_file
                .context("missing portsConfigurationFile")?,
            hosts_configuration_file: hosts_configuration_file
                .context("missing hostsConfigurationFile")?,
            listener_host,
            listener_port: listener_port.context("missing listenerPort")?,
            cluster_ports_range_min: cluster_ports_range_min
                .context("missing clusterPortsRangeMin")?,
            cluster_ports_range_max: cluster_ports_range_max
                .context("missing clusterPortsRangeMax")?,
        })
    }
}

fn parse_port(setting: &str, value: &str) -> Result<u16> {
    value
        .parse()
        .with_context(|| format!("invalid {setting} `{value}`"))
}
