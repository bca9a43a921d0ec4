//! Per-channel reconnect state machine.
//!
//! ```text
//! Idle ─start─▶ Subscribing ─subscribed─▶ Subscribed
//!                   │                         │
//!                failure                   failure
//!                   ▼                         ▼
//!                 Errored ◀───────────────────┘
//!                   │ schedule
//!          ┌────────┴─────────┐
//!          ▼                  ▼
//!    Reconnecting ─timer─▶ Subscribing     Disabled (terminal)
//! ```
//!
//! The machine is pure: it never sleeps or talks to a transport. The
//! engine's channel loop drives it and acts on the returned [`Step`].

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use strata_core::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Idle,
    Subscribing,
    Subscribed,
    Errored,
    Reconnecting,
    /// Reconnect attempts exhausted. Only an explicit re-enable restarts.
    Disabled,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Idle => "idle",
            ChannelState::Subscribing => "subscribing",
            ChannelState::Subscribed => "subscribed",
            ChannelState::Errored => "errored",
            ChannelState::Reconnecting => "reconnecting",
            ChannelState::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the driver should do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Issue a subscribe call now.
    Subscribe,
    /// Sleep for `delay`, then fire the timer.
    Retry { attempt: u32, delay: Duration },
    /// Stop; the channel is disabled.
    GiveUp { attempts: u32 },
    /// The event does not apply in the current state.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct ChannelMachine {
    state: ChannelState,
    policy: ReconnectConfig,
    /// Consecutive failures since the last successful subscribe.
    attempt: u32,
    timers_scheduled: u64,
    last_error: Option<String>,
}

impl ChannelMachine {
    pub fn new(policy: ReconnectConfig) -> Self {
        Self {
            state: ChannelState::Idle,
            policy,
            attempt: 0,
            timers_scheduled: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reconnect timers handed out since creation or the last reset.
    pub fn timers_scheduled(&self) -> u64 {
        self.timers_scheduled
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// `Idle → Subscribing`.
    pub fn start(&mut self) -> Step {
        match self.state {
            ChannelState::Idle => {
                self.state = ChannelState::Subscribing;
                Step::Subscribe
            }
            _ => Step::Ignore,
        }
    }

    /// `Subscribing → Subscribed`; clears the failure count.
    pub fn on_subscribed(&mut self) -> Step {
        match self.state {
            ChannelState::Subscribing | ChannelState::Subscribed => {
                self.state = ChannelState::Subscribed;
                self.attempt = 0;
                self.last_error = None;
                Step::Ignore
            }
            _ => Step::Ignore,
        }
    }

    /// `Subscribing | Subscribed → Errored`.
    pub fn on_failure(&mut self, reason: impl Into<String>) -> bool {
        match self.state {
            ChannelState::Subscribing | ChannelState::Subscribed => {
                self.state = ChannelState::Errored;
                self.last_error = Some(reason.into());
                true
            }
            _ => false,
        }
    }

    /// `Errored → Reconnecting`, or `Errored → Disabled` once the failure
    /// count reaches `max_attempts`.
    pub fn schedule(&mut self) -> Step {
        if self.state != ChannelState::Errored {
            return Step::Ignore;
        }
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt >= self.policy.max_attempts {
            self.state = ChannelState::Disabled;
            return Step::GiveUp {
                attempts: self.attempt,
            };
        }
        self.state = ChannelState::Reconnecting;
        self.timers_scheduled += 1;
        Step::Retry {
            attempt: self.attempt,
            delay: self.policy.delay_for(self.attempt),
        }
    }

    /// `Reconnecting → Subscribing`.
    pub fn on_timer(&mut self) -> Step {
        match self.state {
            ChannelState::Reconnecting => {
                self.state = ChannelState::Subscribing;
                Step::Subscribe
            }
            _ => Step::Ignore,
        }
    }

    /// Back to `Idle` with a clean history.
    pub fn reset(&mut self) {
        self.state = ChannelState::Idle;
        self.attempt = 0;
        self.timers_scheduled = 0;
        self.last_error = None;
    }
}

/// `delay` plus up to `jitter_ms` of clock-derived jitter.
pub(crate) fn jittered(delay: Duration, jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return delay;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    delay.saturating_add(Duration::from_millis(nanos % jitter_ms))
}
