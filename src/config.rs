//! Config module for the download manager

use std::time::Duration;

use clap::Parser;
use reqwest::{
    Client,
    header::{self, HeaderMap, HeaderValue},
};

use crate::downloader::{DownloadError, Result};

const DEFAULT_USER_AGENT: &str = concat!("storefront-downloader/", env!("CARGO_PKG_VERSION"));

#[derive(Parser, Debug, Clone)]
pub struct DownloaderConfig {
    /// User-Agent sent with every request
    #[clap(long, env = "SFDL_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Seconds to wait for a TCP/TLS connection
    #[clap(long, env = "SFDL_CONNECT_TIMEOUT", default_value_t = 30)]
    pub connect_timeout_secs: u64,

    /// Seconds a body read may stall before the transfer fails, 0 disables
    #[clap(long, env = "SFDL_READ_TIMEOUT", default_value_t = 60)]
    pub read_timeout_secs: u64,

    /// Redirects followed before giving up
    #[clap(long, env = "SFDL_MAX_REDIRECTS", default_value_t = 10)]
    pub max_redirects: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            max_redirects: 10,
        }
    }
}

impl DownloaderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }

    /// Build the shared HTTP client for every transfer
    pub fn build_client(&self) -> Result<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        let mut builder = Client::builder()
            .user_agent(self.user_agent.as_str())
            .default_headers(headers)
            .connect_timeout(self.connect_timeout())
            .redirect(reqwest::redirect::Policy::limited(self.max_redirects));

        if let Some(read_timeout) = self.read_timeout() {
            builder = builder.read_timeout(read_timeout);
        }

        builder.build().map_err(DownloadError::Client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_cli_defaults() {
        let parsed = DownloaderConfig::parse_from(["sfdl"]);
        let default = DownloaderConfig::default();
        // env vars can override the parsed side, only compare when unset
        if std::env::var_os("SFDL_CONNECT_TIMEOUT").is_none() {
            assert_eq!(parsed.connect_timeout_secs, default.connect_timeout_secs);
        }
        if std::env::var_os("SFDL_MAX_REDIRECTS").is_none() {
            assert_eq!(parsed.max_redirects, default.max_redirects);
        }
    }

    #[test]
    fn zero_read_timeout_disables_it() {
        let config = DownloaderConfig {
            read_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.read_timeout().is_none());
        assert!(config.build_client().is_ok());
    }
}
