//! Relay routes and their cooldown bookkeeping.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};

/// Default cooldown applied to a proxy that failed to serve a fetch.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// An immutable relay route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    name: String,
    url_template: String,
}

impl ProxyDescriptor {
    /// Create a descriptor. The template must contain `{url}` or `{raw_url}`.
    pub fn new(name: impl Into<String>, url_template: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let url_template = url_template.into();

        if name.is_empty() {
            return Err(Error::config("proxy name must not be empty"));
        }
        if !url_template.contains("{url}") && !url_template.contains("{raw_url}") {
            return Err(Error::config(format!(
                "proxy '{name}' template has no {{url}} or {{raw_url}} placeholder"
            )));
        }

        Ok(Self { name, url_template })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the proxied URL for `target`.
    pub fn build_url(&self, target: &str) -> String {
        self.url_template
            .replace("{url}", &urlencoding::encode(target))
            .replace("{raw_url}", target)
    }
}

impl TryFrom<&ProxyConfig> for ProxyDescriptor {
    type Error = Error;

    fn try_from(config: &ProxyConfig) -> Result<Self> {
        Self::new(config.name.clone(), config.url_template.clone())
    }
}

/// Ordered proxy list plus the cooldown table and last-working pointer.
#[derive(Debug)]
pub struct ProxyRegistry {
    proxies: Vec<ProxyDescriptor>,
    /// Proxy name -> instant until which it is excluded.
    cooldowns: HashMap<String, Instant>,
    last_working: Option<String>,
    cooldown: Duration,
}

impl ProxyRegistry {
    /// Create a registry. Rejects an empty list and duplicate names.
    pub fn new(proxies: Vec<ProxyDescriptor>) -> Result<Self> {
        if proxies.is_empty() {
            return Err(Error::config("at least one proxy is required"));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = proxies.iter().find(|p| !seen.insert(p.name())) {
            return Err(Error::config(format!("duplicate proxy name '{}'", dup.name())));
        }

        Ok(Self {
            proxies,
            cooldowns: HashMap::new(),
            last_working: None,
            cooldown: DEFAULT_COOLDOWN,
        })
    }

    /// Build a registry from configuration.
    pub fn from_config(proxies: &[ProxyConfig]) -> Result<Self> {
        let descriptors = proxies
            .iter()
            .map(ProxyDescriptor::try_from)
            .collect::<Result<Vec<_>>>()?;
        Self::new(descriptors)
    }

    /// Set the cooldown duration.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Candidate proxies for one fetch at `now`.
    ///
    /// Cooling proxies are excluded. The last proxy that worked goes first;
    /// the rest keep registration order.
    pub fn candidates(&self, now: Instant) -> Result<Vec<ProxyDescriptor>> {
        let mut candidates: Vec<ProxyDescriptor> = self
            .proxies
            .iter()
            .filter(|p| !self.is_cooling_down(p.name(), now))
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Err(Error::NoProxiesAvailable);
        }

        if let Some(last) = &self.last_working
            && let Some(pos) = candidates.iter().position(|p| p.name() == last)
        {
            let preferred = candidates.remove(pos);
            candidates.insert(0, preferred);
        }

        Ok(candidates)
    }

    /// Whether `name` is excluded at `now`.
    pub fn is_cooling_down(&self, name: &str, now: Instant) -> bool {
        self.cooldowns.get(name).is_some_and(|until| now < *until)
    }

    /// The cooldown entry for `name`, expired or not.
    pub fn cooldown_until(&self, name: &str) -> Option<Instant> {
        self.cooldowns.get(name).copied()
    }

    /// Record that `name` served a clean response.
    pub fn mark_success(&mut self, name: &str) {
        if self.cooldowns.remove(name).is_some() {
            info!("Proxy '{}' recovered, cooldown cleared", name);
        }
        if self.last_working.as_deref() != Some(name) {
            debug!("Proxy '{}' is now preferred", name);
            self.last_working = Some(name.to_string());
        }
    }

    /// Put `name` on cooldown from `now`. Returns the end of the cooldown.
    pub fn mark_exhausted(&mut self, name: &str, now: Instant) -> Instant {
        let until = now + self.cooldown;
        self.cooldowns.insert(name.to_string(), until);
        info!(
            "Proxy '{}' on cooldown for {}s",
            name,
            self.cooldown.as_secs()
        );
        until
    }

    pub fn last_working(&self) -> Option<&str> {
        self.last_working.as_deref()
    }
}
