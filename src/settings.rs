use anyhow::{bail, Context, Result};
use serde::Deserialize;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;
use backtrace::Backtrace;
use log::error;

use crate::mail_reader::message::DEFAULT_TEMPLATE;
use crate::mail_reader::supervisor::RetryPolicy;

// Main configuration struct
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub profiles: Vec<Profile>,
}

// One mailbox bridged to one channel
#[derive(Debug, Deserialize, Clone)]
pub struct Profile {
    pub name: String,
    pub imap: ImapConfig,
    pub mattermost: MattermostConfig,
    #[serde(default = "default_template")]
    pub mail_template: String,
    #[serde(default = "default_keepalive")]
    pub keepalive_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImapConfig {
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MattermostConfig {
    pub server: String,
    pub team: String,
    pub username: String,
    pub password: String,
    pub channel: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: 2,
            delay_seconds: 30,
        }
    }
}

impl Profile {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retry.attempts, Duration::from_secs(self.retry.delay_seconds))
    }
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

// RFC 2177 asks clients to re-issue IDLE at least every 29 minutes
fn default_keepalive() -> u64 {
    29 * 60
}

fn default_imap_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

pub fn parse_settings(yaml: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(yaml).context("Cannot deserialize settings")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.profiles.is_empty() {
        bail!("no profiles configured");
    }
    for profile in &config.profiles {
        if profile.mattermost.channel.is_empty() {
            bail!("profile {}: channel name is empty", profile.name);
        }
        if profile.imap.mailbox.is_empty() {
            bail!("profile {}: mailbox name is empty", profile.name);
        }
    }
    Ok(())
}

pub fn load_settings(path: &Path) -> Result<Config> {
    // Open the YAML file
    let file = File::open(path).map_err(|err| {
        error!("Error: {}", err);

        // Capture and print the backtrace
        let backtrace = Backtrace::new();
        error!("Backtrace:\n{:?}", backtrace);
        err
    });
    let file = file.with_context(|| format!("Cannot find settings at {}", path.display()))?;

    let reader = BufReader::new(file);

    // Parse the YAML file into the Config struct
    let config: Config = match serde_yaml::from_reader(reader) {
        Ok(config) => config,
        Err(err) => {
            error!("Error: {}", err);
            let backtrace = Backtrace::new();
            error!("Backtrace:\n{:?}", backtrace);
            return Err(err).context("Cannot deserialize settings");
        }
    };

    validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
profiles:
  - name: support
    imap:
      server: imap.example.com
      username: support@example.com
      password: secret
    mattermost:
      server: https://chat.example.com
      team: eng
      username: bot
      password: secret
      channel: town-square
"#;

    #[test]
    fn defaults_fill_optional_fields() {
        let config = parse_settings(MINIMAL).unwrap();
        let profile = &config.profiles[0];
        assert_eq!(profile.imap.port, 993);
        assert_eq!(profile.imap.mailbox, "INBOX");
        assert_eq!(profile.mail_template, DEFAULT_TEMPLATE);
        assert_eq!(profile.keepalive(), Duration::from_secs(1740));
        assert_eq!(profile.retry_policy(), RetryPolicy::fixed(2, Duration::from_secs(30)));
    }

    #[test]
    fn empty_channel_is_rejected() {
        let yaml = MINIMAL.replace("channel: town-square", "channel: \"\"");
        let err = parse_settings(&yaml).unwrap_err();
        assert!(err.to_string().contains("channel name is empty"));
    }

    #[test]
    fn no_profiles_is_rejected() {
        assert!(parse_settings("profiles: []").is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_settings(Path::new("/nonexistent/mailbridge.yaml")).is_err());
    }
}
