use std::fs;

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, instrument};

use crate::consts;

/// Top level gateway configuration, loaded from an optional toml file.
/// Every field is optional so that a bare `logview-gatewayd serve` with
/// no config file at all runs with sane defaults.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Address the control-plane listener binds to.
    pub bind: Option<String>,

    /// How long an SSH session may sit idle before being reaped.
    pub session_timeout_secs: Option<u64>,

    /// Default grid width for newly opened log sessions.
    pub default_cols: Option<u16>,

    /// Default grid height for newly opened log sessions.
    pub default_rows: Option<u16>,

    /// Name (or path) of the pager binary to invoke on the remote host.
    pub pager_bin: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: None,
            session_timeout_secs: None,
            default_cols: None,
            default_rows: None,
            pager_bin: None,
        }
    }
}

impl Config {
    pub fn bind_addr(&self) -> String {
        self.bind.clone().unwrap_or_else(|| consts::DEFAULT_BIND_ADDR.to_string())
    }

    pub fn session_timeout(&self) -> std::time::Duration {
        match self.session_timeout_secs {
            Some(secs) => std::time::Duration::from_secs(secs),
            None => consts::SESSION_TIMEOUT,
        }
    }

    pub fn default_cols(&self) -> u16 {
        self.default_cols.unwrap_or(consts::DEFAULT_COLS)
    }

    pub fn default_rows(&self) -> u16 {
        self.default_rows.unwrap_or(consts::DEFAULT_ROWS)
    }

    pub fn pager_bin(&self) -> String {
        self.pager_bin.clone().unwrap_or_else(|| consts::DEFAULT_PAGER_BIN.to_string())
    }
}

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let config = match config_file {
        Some(path) => {
            info!("parsing config file ({})", path);
            let config_str = fs::read_to_string(path).context("reading config toml")?;
            toml::from_str(&config_str).context("parsing config file")?
        }
        None => Config::default(),
    };

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file_given() {
        let config = read_config(&None).unwrap();
        assert_eq!(config.bind_addr(), consts::DEFAULT_BIND_ADDR);
        assert_eq!(config.default_cols(), consts::DEFAULT_COLS);
        assert_eq!(config.default_rows(), consts::DEFAULT_ROWS);
        assert_eq!(config.pager_bin(), "less");
    }
}
