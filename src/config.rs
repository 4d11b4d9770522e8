use anyhow::Context;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Process-wide settings, built once at startup and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the MTA reaches this milter (unix socket path).
    pub socket_path: String,
    /// spamd host.
    pub spamd_addr: String,
    /// spamd port.
    pub spamd_port: u16,
    /// Optional per-user setting passed to spamd (`User:` request line).
    #[serde(default)]
    pub spamd_user: Option<String>,
    /// Clients whose name or address matches this pattern are accepted at
    /// connect time without scoring.
    #[serde(default)]
    pub ignore_connect: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: "/var/run/spamd-milter.sock".to_string(),
            spamd_addr: "127.0.0.1".to_string(),
            spamd_port: 783,
            spamd_user: None,
            ignore_connect: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `host:port` for the spamd connection.
    pub fn spamd_endpoint(&self) -> String {
        format!("{}:{}", self.spamd_addr, self.spamd_port)
    }

    /// Compile the connect-time ignore pattern, if one is configured.
    pub fn ignore_matcher(&self) -> anyhow::Result<Option<IgnoreMatcher>> {
        match self.ignore_connect.as_deref().filter(|p| !p.is_empty()) {
            Some(pattern) => Ok(Some(IgnoreMatcher::new(pattern)?)),
            None => Ok(None),
        }
    }
}

/// Precompiled, case-insensitive matcher for connect-time ignores.
#[derive(Debug)]
pub struct IgnoreMatcher {
    regex: Regex,
}

impl IgnoreMatcher {
    pub fn new(pattern: &str) -> anyhow::Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("invalid ignore_connect pattern: {pattern}"))?;
        Ok(IgnoreMatcher { regex })
    }

    /// True when either the client's name or its address matches.
    pub fn matches(&self, client_name: &str, client_addr: &str) -> bool {
        self.regex.is_match(client_name) || self.regex.is_match(client_addr)
    }
}
