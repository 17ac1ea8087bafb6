//! Liveness monitoring for the duplex channel.
//!
//! Pure counters: the connection manager drives the clock (probe timers
//! and ack deadlines), so every transition is unit testable. Any inbound
//! envelope counts as life, not just heartbeat echoes.

use std::time::Duration;

/// Configuration for liveness probing.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Interval between heartbeat probes.
    pub probe_interval: Duration,
    /// How long after a probe inbound traffic must arrive.
    pub probe_timeout: Duration,
    /// Consecutive misses before the channel is declared dead.
    pub max_missed: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            max_missed: 3,
        }
    }
}

/// Verdict of a probe deadline check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// Keep probing.
    Alive,
    /// The channel is dead. Emitted exactly once per monitoring run;
    /// the monitor stops itself so a dead channel cannot signal twice.
    Dead,
}

/// Missed-heartbeat tracker for one channel.
#[derive(Debug)]
pub struct LivenessMonitor {
    config: LivenessConfig,
    running: bool,
    missed: u32,
    probe_outstanding: bool,
}

impl LivenessMonitor {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            running: false,
            missed: 0,
            probe_outstanding: false,
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Begin monitoring a fresh channel.
    pub fn start(&mut self) {
        self.running = true;
        self.missed = 0;
        self.probe_outstanding = false;
    }

    /// Stop monitoring (channel closed or declared dead).
    pub fn stop(&mut self) {
        self.running = false;
        self.probe_outstanding = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Record that a probe went out; the ack window opens now.
    pub fn on_probe_sent(&mut self) {
        if self.running {
            self.probe_outstanding = true;
        }
    }

    /// Record inbound traffic of any kind.
    pub fn on_inbound(&mut self) {
        self.missed = 0;
        self.probe_outstanding = false;
    }

    /// The ack window for the last probe has elapsed.
    pub fn on_probe_deadline(&mut self) -> LivenessVerdict {
        if !self.running || !self.probe_outstanding {
            return LivenessVerdict::Alive;
        }

        self.probe_outstanding = false;
        self.missed += 1;

        if self.missed >= self.config.max_missed {
            // Stop immediately so the dead signal cannot repeat.
            self.stop();
            LivenessVerdict::Dead
        } else {
            LivenessVerdict::Alive
        }
    }

    /// Current consecutive miss count.
    pub fn missed(&self) -> u32 {
        self.missed
    }
}
