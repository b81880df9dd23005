// CLASSIFICATION: COMMUNITY
// Filename: proxy.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Proxy votes: power and clock resources held only across the boot window.
//!
//! Release happens on one of three paths: a timer on the shared workqueue,
//! the peripheral's "clocks no longer needed" interrupt, or an immediate
//! request on failure and shutdown. All three go through a single release
//! token; the first path to claim it with a compare-and-swap performs the
//! release and the others become no-ops.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::{self, ProxyTimeout};
use crate::error::{HookStage, PilError, PilResult};
use crate::platform::{IrqLine, PilOps};
use crate::pm::{WakeGuard, WakeSource};
use crate::workqueue::DelayedWork;

const UNVOTED: u8 = 0;
const VOTED: u8 = 1;

struct ProxyShared {
    name: String,
    ops: Arc<dyn PilOps>,
    token: AtomicU8,
    wake: WakeSource,
    wake_guard: Mutex<Option<WakeGuard>>,
}

impl ProxyShared {
    fn claim(&self) -> bool {
        self.token
            .compare_exchange(VOTED, UNVOTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        if !self.claim() {
            return;
        }
        if let Some(voter) = self.ops.proxy() {
            voter.unvote();
        }
        let guard = self
            .wake_guard
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        drop(guard);
        info!("[pil] {}: proxy votes released", self.name);
    }
}

/// Entry point for the proxy-unvote interrupt.
///
/// Handed to [`IrqLine::request`]; the platform calls [`handle`](Self::handle)
/// when the line fires. Holds no strong reference to the descriptor.
#[derive(Clone)]
pub struct UnvoteIrqHandler {
    shared: Weak<ProxyShared>,
}

impl UnvoteIrqHandler {
    pub fn handle(&self) {
        if let Some(shared) = self.shared.upgrade() {
            info!("[pil] {}: power/clock ready interrupt received", shared.name);
            shared.release();
        }
    }
}

/// Proxy-vote state of one descriptor.
pub(crate) struct ProxyVote {
    shared: Arc<ProxyShared>,
    work: DelayedWork,
    irq: Option<Arc<dyn IrqLine>>,
    irq_enabled: AtomicBool,
    default_timeout: Duration,
    hold_until_shutdown: bool,
}

impl ProxyVote {
    pub(crate) fn new(
        name: &str,
        ops: Arc<dyn PilOps>,
        irq: Option<Arc<dyn IrqLine>>,
        default_timeout: Duration,
        hold_until_shutdown: bool,
    ) -> PilResult<Self> {
        let has_voter = ops.proxy().is_some();
        let irq = match irq {
            Some(_) if !has_voter => {
                warn!("[pil] {name}: unvote irq given without a proxy voter; ignoring it");
                None
            }
            other => other,
        };
        if has_voter && irq.is_none() && default_timeout.is_zero() && !hold_until_shutdown {
            warn!("[pil] {name}: proxy voter with neither an unvote irq nor a proxy timeout");
        }

        let shared = Arc::new(ProxyShared {
            name: name.to_owned(),
            ops,
            token: AtomicU8::new(UNVOTED),
            wake: WakeSource::new(format!("pil-{name}")),
            wake_guard: Mutex::new(None),
        });
        let unit = Arc::clone(&shared);
        let work = DelayedWork::new(format!("pil-{name}-proxy"), move || unit.release());

        if let Some(line) = &irq {
            let handler = UnvoteIrqHandler {
                shared: Arc::downgrade(&shared),
            };
            line.request(name, handler).map_err(|e| {
                error!("[pil] {name}: unable to request proxy unvote irq: {e:#}");
                PilError::ResourceExhausted(format!("proxy unvote irq: {e:#}"))
            })?;
            line.disable();
        }

        Ok(Self {
            shared,
            work,
            irq,
            irq_enabled: AtomicBool::new(false),
            default_timeout,
            hold_until_shutdown,
        })
    }

    /// Operator override first, then the descriptor's hold setting.
    fn policy(&self) -> ProxyTimeout {
        match config::proxy_timeout() {
            ProxyTimeout::Driver if self.hold_until_shutdown => ProxyTimeout::HoldUntilShutdown,
            policy => policy,
        }
    }

    pub(crate) fn vote(&self) -> PilResult<()> {
        let name = &self.shared.name;
        if let Some(voter) = self.shared.ops.proxy() {
            let guard = self.shared.wake.acquire();
            voter.vote().map_err(|e| {
                error!("[pil] {name}: failed to proxy vote");
                PilError::hook(HookStage::ProxyVote, e)
            })?;
            *self
                .shared
                .wake_guard
                .lock()
                .unwrap_or_else(|p| p.into_inner()) = Some(guard);
            self.shared.token.store(VOTED, Ordering::Release);
        }
        if let Some(line) = &self.irq {
            self.irq_enabled.store(true, Ordering::SeqCst);
            line.enable();
        }
        debug!("[pil] {name}: proxy vote taken");
        Ok(())
    }

    /// Release the vote now, or arrange for it to be released later.
    pub(crate) fn unvote(&self, immediate: bool) {
        let policy = self.policy();
        if policy == ProxyTimeout::HoldUntilShutdown && !immediate {
            debug!("[pil] {}: holding proxy votes until shutdown", self.shared.name);
            return;
        }
        if self.shared.ops.proxy().is_none() {
            return;
        }
        if immediate {
            self.work.schedule(Duration::ZERO);
            self.work.flush();
            return;
        }
        let timeout = match policy {
            ProxyTimeout::After(ms) => Duration::from_millis(ms),
            // the interrupt releases the vote
            _ if self.irq.is_some() => return,
            _ => self.default_timeout,
        };
        if !self.work.schedule(timeout) {
            debug!("[pil] {}: proxy release already pending", self.shared.name);
        }
    }

    pub(crate) fn disable_irq(&self) {
        if let Some(line) = &self.irq {
            if self.irq_enabled.swap(false, Ordering::SeqCst) {
                line.disable();
            }
        }
    }

    /// Shutdown path: stop the interrupt, release anything still held and
    /// wait for the release unit to finish.
    pub(crate) fn on_shutdown(&self) {
        self.disable_irq();
        if self.is_voted() {
            self.unvote(true);
        }
        self.work.flush();
    }

    /// Wait for a pending or running release.
    pub(crate) fn flush(&self) {
        self.work.flush();
    }

    pub(crate) fn is_voted(&self) -> bool {
        self.shared.token.load(Ordering::Acquire) == VOTED
    }

    #[cfg(test)]
    fn is_release_pending(&self) -> bool {
        self.work.is_pending()
    }

    /// Final teardown when the descriptor is released.
    pub(crate) fn teardown(&self) {
        self.work.flush();
        if let Some(line) = &self.irq {
            self.disable_irq();
            line.free();
        }
    }
}
