// CLASSIFICATION: COMMUNITY
// Filename: config.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Loader configuration: the operator-wide proxy timeout override and the
//! per-peripheral descriptor settings.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::{PilError, PilResult};
use crate::platform::IrqLine;

/// Environment variable holding the proxy timeout override in milliseconds.
pub const PROXY_TIMEOUT_ENV: &str = "COHESIX_PIL_PROXY_TIMEOUT_MS";

/// Operator override for when proxy votes are dropped after a boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProxyTimeout {
    /// Use the timeout declared by the peripheral descriptor.
    #[default]
    Driver,
    /// Hold proxy votes until the peripheral is shut down.
    HoldUntilShutdown,
    /// Drop proxy votes after exactly this many milliseconds.
    After(u64),
}

impl ProxyTimeout {
    /// Decode the raw knob: negative is driver default, zero holds, positive is ms.
    #[must_use]
    pub fn from_ms(raw: i64) -> Self {
        match raw {
            r if r < 0 => ProxyTimeout::Driver,
            0 => ProxyTimeout::HoldUntilShutdown,
            r => ProxyTimeout::After(r.unsigned_abs()),
        }
    }
}

/// Process-wide loader settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PilConfig {
    pub proxy_timeout: ProxyTimeout,
}

impl Default for PilConfig {
    fn default() -> Self {
        let proxy_timeout = std::env::var(PROXY_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(ProxyTimeout::from_ms)
            .unwrap_or_default();
        Self { proxy_timeout }
    }
}

static CONFIG: Lazy<RwLock<PilConfig>> = Lazy::new(|| RwLock::new(PilConfig::default()));

/// Replace the global loader configuration.
pub fn set_config(cfg: PilConfig) -> PilResult<()> {
    let mut guard = CONFIG.write().map_err(|_| PilError::LockPoisoned)?;
    *guard = cfg;
    Ok(())
}

/// Get a clone of the current configuration.
pub fn get_config() -> PilResult<PilConfig> {
    CONFIG
        .read()
        .map_err(|_| PilError::LockPoisoned)
        .map(|g| g.clone())
}

/// Current override; a poisoned lock falls back to the driver timeout.
pub(crate) fn proxy_timeout() -> ProxyTimeout {
    get_config()
        .map(|c| c.proxy_timeout)
        .unwrap_or(ProxyTimeout::Driver)
}

/// Settings for one peripheral, handed to [`Descriptor::new`](crate::Descriptor::new).
#[derive(Clone)]
pub struct DescriptorConfig {
    pub(crate) name: String,
    pub(crate) skip_entry_check: bool,
    pub(crate) hold_proxy_until_shutdown: bool,
    pub(crate) proxy_timeout: Duration,
    pub(crate) unvote_irq: Option<Arc<dyn IrqLine>>,
}

impl DescriptorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skip_entry_check: false,
            hold_proxy_until_shutdown: false,
            proxy_timeout: Duration::ZERO,
            unvote_irq: None,
        }
    }

    /// Boot even when the entry address lies outside every segment.
    #[must_use]
    pub fn skip_entry_check(mut self, skip: bool) -> Self {
        self.skip_entry_check = skip;
        self
    }

    /// Keep proxy votes until shutdown unless the operator override says otherwise.
    #[must_use]
    pub fn hold_proxy_until_shutdown(mut self, hold: bool) -> Self {
        self.hold_proxy_until_shutdown = hold;
        self
    }

    /// Default delay before proxy votes are dropped after a successful boot.
    #[must_use]
    pub fn proxy_timeout_ms(mut self, ms: u64) -> Self {
        self.proxy_timeout = Duration::from_millis(ms);
        self
    }

    /// Interrupt line the peripheral raises once its clocks are no longer needed.
    #[must_use]
    pub fn unvote_irq(mut self, irq: Arc<dyn IrqLine>) -> Self {
        self.unvote_irq = Some(irq);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for DescriptorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorConfig")
            .field("name", &self.name)
            .field("skip_entry_check", &self.skip_entry_check)
            .field("hold_proxy_until_shutdown", &self.hold_proxy_until_shutdown)
            .field("proxy_timeout", &self.proxy_timeout)
            .field("unvote_irq", &self.unvote_irq.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn raw_knob_decodes() {
        assert_eq!(ProxyTimeout::from_ms(-1), ProxyTimeout::Driver);
        assert_eq!(ProxyTimeout::from_ms(0), ProxyTimeout::HoldUntilShutdown);
        assert_eq!(ProxyTimeout::from_ms(250), ProxyTimeout::After(250));
    }

    #[test]
    #[serial]
    fn set_and_get_round_trip() {
        let prev = get_config().unwrap();
        set_config(PilConfig {
            proxy_timeout: ProxyTimeout::After(5),
        })
        .unwrap();
        assert_eq!(proxy_timeout(), ProxyTimeout::After(5));
        set_config(prev).unwrap();
    }

    #[test]
    fn builder_sets_fields() {
        let cfg = DescriptorConfig::new("modem")
            .skip_entry_check(true)
            .proxy_timeout_ms(10_000);
        assert_eq!(cfg.name(), "modem");
        assert!(cfg.skip_entry_check);
        assert!(!cfg.hold_proxy_until_shutdown);
        assert_eq!(cfg.proxy_timeout, Duration::from_millis(10_000));
        assert!(cfg.unvote_irq.is_none());
    }
}
