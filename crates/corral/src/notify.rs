//! Fire-and-forget syslog alerting over UDP.
//!
//! Lines follow the classic BSD syslog shape: `<priority>` prefix, a
//! yearless `%b %e %H:%M:%S` timestamp, a hostname capped at 15
//! characters, then `tag[subtag]: message`. Priority is facility * 8 +
//! severity with the user facility. Delivery is datagram best-effort and
//! every failure is swallowed after a trace log; the control plane never
//! waits on, or fails because of, alerting.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use chrono::{DateTime, Local};
use tracing::{trace, warn};

/// Syslog facility 1, "user-level messages".
const FACILITY_USER: u8 = 1;

const HOSTNAME_MAX: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
}

impl Severity {
    fn priority(self) -> u8 {
        FACILITY_USER * 8 + self as u8
    }
}

pub struct Notifier {
    target: Option<SocketAddr>,
    tag: String,
    hostname: String,
}

impl Notifier {
    /// Resolve the target once up front. An empty target means alerting is
    /// off; an unresolvable one disables it with a warning instead of
    /// failing daemon startup.
    pub fn new(target: &str, tag: &str) -> Self {
        let resolved = if target.trim().is_empty() {
            None
        } else {
            let resolved = target
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next());
            if resolved.is_none() {
                warn!(target, "Syslog target did not resolve, alerting disabled");
            }
            resolved
        };
        let raw = gethostname::gethostname();
        Notifier {
            target: resolved,
            tag: tag.to_string(),
            hostname: short_hostname(&raw.to_string_lossy()),
        }
    }

    pub fn alert(&self, severity: Severity, subtag: &str, message: &str) {
        let Some(target) = self.target else {
            return;
        };
        let line = render_line(
            &self.hostname,
            &self.tag,
            subtag,
            severity,
            message,
            Local::now(),
        );
        let sent = UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| socket.send_to(line.as_bytes(), target));
        match sent {
            Ok(_) => trace!(%target, subtag, "Alert sent"),
            Err(e) => trace!("Alert send failed: {e}"),
        }
    }
}

fn short_hostname(raw: &str) -> String {
    raw.chars().take(HOSTNAME_MAX).collect()
}

fn render_line(
    host: &str,
    tag: &str,
    subtag: &str,
    severity: Severity,
    message: &str,
    now: DateTime<Local>,
) -> String {
    format!(
        "<{}>{} {} {}[{}]: {}",
        severity.priority(),
        now.format("%b %e %H:%M:%S"),
        host,
        tag,
        subtag,
        message
    )
}
