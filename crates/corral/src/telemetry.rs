//! Process CPU watchdog.
//!
//! Samples this process's CPU on an interval, keeps a rolling average
//! over the last [`CPU_WINDOW`] samples, and alerts edge-triggered: the
//! third consecutive over-threshold average fires exactly one syslog
//! alert, then the watch stays quiet until the average dips back under
//! the threshold and re-arms.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::notify::{Notifier, Severity};

/// Rolling-average window, in samples.
pub const CPU_WINDOW: usize = 12;
/// Consecutive over-threshold averages needed to fire.
pub const ALERT_STRIKES: u32 = 3;

/// Where CPU numbers come from. The production probe reads this process
/// from the OS; tests script their own.
pub trait CpuProbe: Send {
    /// Current CPU usage in percent, or `None` if it cannot be read
    /// right now.
    fn sample(&mut self) -> Option<f32>;
}

pub struct ProcessCpuProbe {
    system: System,
    pid: Pid,
}

impl ProcessCpuProbe {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("cannot determine own pid: {e}"))?;
        let mut system = System::new();
        // Prime the delta-based usage calculation.
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        Ok(ProcessCpuProbe { system, pid })
    }
}

impl CpuProbe for ProcessCpuProbe {
    fn sample(&mut self) -> Option<f32> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        self.system.process(self.pid).map(|p| p.cpu_usage())
    }
}

/// Pure alerting state machine, separate from the sampling loop so the
/// edge-trigger logic is testable sample by sample.
pub struct CpuWatch {
    window: VecDeque<f32>,
    threshold: f32,
    strikes: u32,
}

pub struct CpuReading {
    pub average: f32,
    pub alert: bool,
}

impl CpuWatch {
    pub fn new(threshold: f32) -> Self {
        CpuWatch {
            window: VecDeque::with_capacity(CPU_WINDOW),
            threshold,
            strikes: 0,
        }
    }

    pub fn push(&mut self, sample: f32) -> CpuReading {
        if self.window.len() == CPU_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        let average = self.window.iter().sum::<f32>() / self.window.len() as f32;

        let alert = if average >= self.threshold {
            self.strikes = self.strikes.saturating_add(1);
            self.strikes == ALERT_STRIKES
        } else {
            self.strikes = 0;
            false
        };
        CpuReading { average, alert }
    }
}

pub fn spawn_cpu_watch(
    mut probe: Box<dyn CpuProbe>,
    threshold: f32,
    interval: Duration,
    notifier: Arc<Notifier>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut watch = CpuWatch::new(threshold);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(sample) = probe.sample() else { continue };
                    let reading = watch.push(sample);
                    debug!(sample, average = reading.average, "CPU sampled");
                    if reading.alert {
                        warn!(average = reading.average, threshold, "CPU average over threshold");
                        notifier.alert(
                            Severity::Warning,
                            "cpu",
                            &format!(
                                "capture pool CPU at {:.1}% (threshold {:.1}%)",
                                reading.average, threshold
                            ),
                        );
                    }
                }
            }
        }
        debug!("CPU watch stopped");
    })
}
