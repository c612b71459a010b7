// src/ui/mod.rs — Notification/UI sink abstraction
//
// The cycle engine never renders anything itself. Everything user-facing goes
// through this write-only trait; the only reads are the two boolean gates
// checked before a cycle may start.

use crate::core::types::CycleState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Which intervention surface the UI should open for a human pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitlMode {
    Prompt,
    CodeEdit,
}

pub trait UiSink: Send + Sync {
    fn update_status(&self, message: &str, busy: bool);
    fn log_timeline(&self, cycle: u64, message: &str, level: LogLevel);
    fn notify(&self, message: &str, level: LogLevel);
    fn update_metrics(&self, state: &CycleState);

    fn show_intervention(&self, mode: HitlMode, reason: &str, artifact_hint: Option<&str>);
    fn hide_intervention(&self);
    fn show_sandbox(&self, staged_source: &str);

    /// True while a staged self-modification awaits sandbox approval.
    fn is_sandbox_pending(&self) -> bool;
    /// False while the human intervention surface is open.
    fn is_intervention_hidden(&self) -> bool;
}

/// Sink that discards everything. Used in tests and headless runs.
#[derive(Debug, Default)]
pub struct NullUi;

impl UiSink for NullUi {
    fn update_status(&self, _message: &str, _busy: bool) {}
    fn log_timeline(&self, _cycle: u64, _message: &str, _level: LogLevel) {}
    fn notify(&self, _message: &str, _level: LogLevel) {}
    fn update_metrics(&self, _state: &CycleState) {}
    fn show_intervention(&self, _mode: HitlMode, _reason: &str, _artifact_hint: Option<&str>) {}
    fn hide_intervention(&self) {}
    fn show_sandbox(&self, _staged_source: &str) {}
    fn is_sandbox_pending(&self) -> bool {
        false
    }
    fn is_intervention_hidden(&self) -> bool {
        true
    }
}

/// Sink that forwards timeline and status traffic to `tracing`. Suitable for
/// daemonized runs where no interactive surface exists; intervention and
/// sandbox requests are logged but never block.
#[derive(Debug, Default)]
pub struct TracingUi;

impl UiSink for TracingUi {
    fn update_status(&self, message: &str, busy: bool) {
        tracing::debug!(busy, "status: {}", message);
    }

    fn log_timeline(&self, cycle: u64, message: &str, level: LogLevel) {
        match level {
            LogLevel::Info => tracing::info!(cycle, "{}", message),
            LogLevel::Warn => tracing::warn!(cycle, "{}", message),
            LogLevel::Error => tracing::error!(cycle, "{}", message),
        }
    }

    fn notify(&self, message: &str, level: LogLevel) {
        match level {
            LogLevel::Error => tracing::error!("{}", message),
            _ => tracing::info!("{}", message),
        }
    }

    fn update_metrics(&self, state: &CycleState) {
        tracing::debug!(
            total_cycles = state.total_cycles,
            avg_confidence = ?state.avg_confidence,
            critique_fail_rate = ?state.critique_fail_rate,
            "metrics",
        );
    }

    fn show_intervention(&self, mode: HitlMode, reason: &str, artifact_hint: Option<&str>) {
        tracing::warn!(?mode, artifact = ?artifact_hint, "human intervention requested: {}", reason);
    }

    fn hide_intervention(&self) {}

    fn show_sandbox(&self, _staged_source: &str) {
        tracing::warn!("sandbox review requested for staged full source");
    }

    fn is_sandbox_pending(&self) -> bool {
        false
    }

    fn is_intervention_hidden(&self) -> bool {
        true
    }
}
