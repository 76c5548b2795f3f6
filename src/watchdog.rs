//! Liveness watchdog: a pure decision tree over a point-in-time snapshot of
//! a partition's fetch/stream/commit health, matching the original
//! `_verify_aiokafka_event_path` / `verify_event_path` functions exactly.

use crate::types::TopicPartition;

/// A snapshot of everything the watchdog needs to judge one partition at
/// one instant. Held as plain data so the decision tree is a pure function,
/// independent of the live consumer and stream runtime.
#[derive(Debug, Clone)]
pub struct WatchdogState {
    pub tp: TopicPartition,
    pub time_started: f64,
    pub poll_at: Option<f64>,
    pub highwater: Option<i64>,
    pub committed_offset: Option<i64>,
    pub acks_enabled: bool,
    pub stream_inbound_time: Option<f64>,
    pub last_committed_at: Option<f64>,
    pub fetch_request_timeout: f64,
    pub stream_timeout: f64,
    pub commit_timeout: f64,
}

/// Which aspect of the pipeline a diagnostic implicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    Fetch,
    Stream,
    Agent,
    CommitHandler,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub summary: String,
    pub setting_name: &'static str,
    pub setting_value: f64,
    pub causes: Vec<Cause>,
}

impl Diagnostic {
    /// Renders the full multi-part message: summary, explanation block,
    /// enumerated causes starting at "2)".
    pub fn render(&self) -> String {
        let mut out = format!(
            "{} (this may be caused by several different scenarios; the relevant setting \
             is `{}` currently set to {})",
            self.summary, self.setting_name, self.setting_value
        );
        out.push_str("\n1) the broker or network is slow or unreachable");
        for (i, cause) in self.causes.iter().enumerate() {
            let label = match cause {
                Cause::Fetch => "the fetch loop is stuck",
                Cause::Stream => "the stream processor is stuck",
                Cause::Agent => "a downstream agent is stuck",
                Cause::CommitHandler => "the commit handler is stuck",
            };
            out.push_str(&format!("\n{}) {}", i + 2, label));
        }
        out
    }
}

/// Full decision tree, evaluated in order; the first matched condition
/// returns a diagnostic.
pub fn verify_event_path(now: f64, state: &WatchdogState) -> Option<Diagnostic> {
    if let Some(diag) = verify_recovery_event_path(now, state) {
        return Some(diag);
    }

    if !state.acks_enabled {
        return None;
    }
    let highwater = state.highwater?;
    let committed = state.committed_offset.unwrap_or(0);
    if highwater <= committed {
        return None;
    }

    match state.stream_inbound_time {
        None => {
            if now - state.time_started >= state.stream_timeout {
                return Some(Diagnostic {
                    summary: format!("{}: stream has not processed any records since start", state.tp),
                    setting_name: "stream_processing_timeout",
                    setting_value: state.stream_timeout,
                    causes: vec![Cause::Stream, Cause::Agent],
                });
            }
        }
        Some(last_inbound) => {
            if now - last_inbound >= state.stream_timeout {
                return Some(Diagnostic {
                    summary: format!("{}: stream stopped processing records", state.tp),
                    setting_name: "stream_processing_timeout",
                    setting_value: state.stream_timeout,
                    causes: vec![Cause::Stream, Cause::Agent],
                });
            }
        }
    }

    match state.last_committed_at {
        None => {
            if now - state.time_started >= state.commit_timeout {
                return Some(Diagnostic {
                    summary: format!("{}: no commit since start", state.tp),
                    setting_name: "broker_commit_livelock_soft_timeout",
                    setting_value: state.commit_timeout,
                    causes: vec![Cause::CommitHandler],
                });
            }
        }
        Some(last_committed_at) => {
            if now - last_committed_at >= state.commit_timeout {
                return Some(Diagnostic {
                    summary: format!("{}: stopped committing", state.tp),
                    setting_name: "broker_commit_livelock_soft_timeout",
                    setting_value: state.commit_timeout,
                    causes: vec![Cause::CommitHandler],
                });
            }
        }
    }

    None
}

/// Runs only the fetch/highwater steps (1-3), ignoring stream and commit
/// health. Used during table recovery, when no commit activity is expected.
pub fn verify_recovery_event_path(now: f64, state: &WatchdogState) -> Option<Diagnostic> {
    match state.poll_at {
        None => {
            if now - state.time_started >= state.fetch_request_timeout {
                return Some(Diagnostic {
                    summary: format!("{}: no fetch sent since start", state.tp),
                    setting_name: "stream_processing_timeout",
                    setting_value: state.fetch_request_timeout,
                    causes: vec![Cause::Fetch],
                });
            }
        }
        Some(poll_at) => {
            if now - poll_at >= state.fetch_request_timeout {
                return Some(Diagnostic {
                    summary: format!("{}: stopped fetching, last done {:.1}s ago", state.tp, now - poll_at),
                    setting_name: "stream_processing_timeout",
                    setting_value: state.fetch_request_timeout,
                    causes: vec![Cause::Fetch],
                });
            }
        }
    }

    if state.highwater.is_none() && now - state.time_started >= state.stream_timeout {
        return Some(Diagnostic {
            summary: format!("{}: highwater not available", state.tp),
            setting_name: "stream_processing_timeout",
            setting_value: state.stream_timeout,
            causes: vec![Cause::Fetch],
        });
    }

    None
}
