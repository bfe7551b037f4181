//! Protocol gate: enforces that mutating operations are preceded by a
//! `briefing` (initialization) and, for a stricter subset, a recent
//! `context_check`.
//!
//! The token table is process-wide in spirit but never a true global: it
//! lives in one explicitly-constructed [`ProtocolGate`] that callers pass
//! to handlers, so tests can instantiate isolated gates.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
struct ContextToken {
    issued_at: DateTime<Utc>,
    ttl: ChronoDuration,
}

impl ContextToken {
    fn valid_at(&self, now: DateTime<Utc>) -> bool {
        now - self.issued_at < self.ttl
    }

    fn valid_until(&self) -> DateTime<Utc> {
        self.issued_at + self.ttl
    }
}

/// Process-wide (per-instance) table of initialization and context tokens,
/// keyed by project path.
pub struct ProtocolGate {
    initialized: Mutex<HashMap<String, DateTime<Utc>>>,
    context: Mutex<HashMap<String, ContextToken>>,
    context_ttl: ChronoDuration,
}

impl ProtocolGate {
    pub fn new(context_ttl_seconds: u64) -> Self {
        Self {
            initialized: Mutex::new(HashMap::new()),
            context: Mutex::new(HashMap::new()),
            context_ttl: ChronoDuration::seconds(context_ttl_seconds as i64),
        }
    }

    /// Register an initialization token for `project`. Called by `briefing`.
    /// Monotonic and overwrite-safe: calling this again just refreshes the
    /// timestamp, it never revokes a live token.
    pub fn register_initialization(&self, project: &str) {
        if let Ok(mut table) = self.initialized.lock() {
            table.insert(project.to_string(), Utc::now());
        }
    }

    /// Register a context token for `project`, returning its expiry.
    /// Called by `context_check`. The description is not retained verbatim
    /// (the token witnesses that *something* was checked, it does not
    /// enforce a content match on later calls).
    pub fn register_context(&self, project: &str) -> DateTime<Utc> {
        let token = ContextToken { issued_at: Utc::now(), ttl: self.context_ttl };
        let valid_until = token.valid_until();
        if let Ok(mut table) = self.context.lock() {
            table.insert(project.to_string(), token);
        }
        valid_until
    }

    /// Fail with `InitRequired` unless `project` has a live initialization
    /// token.
    pub fn requires_initialization(&self, project: &str, operation: &'static str) -> Result<()> {
        let table = self.initialized.lock().map_err(|_| EngineError::Internal("gate lock poisoned".into()))?;
        if table.contains_key(project) {
            Ok(())
        } else {
            Err(EngineError::InitRequired { operation })
        }
    }

    /// Fail with `ContextCheckRequired` unless `project` has a non-expired
    /// context token. Implies `requires_initialization`.
    pub fn requires_context(&self, project: &str, operation: &'static str) -> Result<()> {
        self.requires_context_at(project, operation, Utc::now())
    }

    fn requires_context_at(&self, project: &str, operation: &'static str, now: DateTime<Utc>) -> Result<()> {
        self.requires_initialization(project, operation)?;
        let table = self.context.lock().map_err(|_| EngineError::Internal("gate lock poisoned".into()))?;
        match table.get(project) {
            Some(token) if token.valid_at(now) => Ok(()),
            _ => Err(EngineError::ContextCheckRequired { operation }),
        }
    }

    /// Whether `project` currently holds a live initialization token,
    /// without failing — used by diagnostics (`health`).
    pub fn is_initialized(&self, project: &str) -> bool {
        self.initialized.lock().map(|t| t.contains_key(project)).unwrap_or(false)
    }
}

impl Default for ProtocolGate {
    fn default() -> Self {
        Self::new(300)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_initialization_fails_before_briefing() {
        let gate = ProtocolGate::default();
        let err = gate.requires_initialization("proj", "get_briefing").unwrap_err();
        assert!(matches!(err, EngineError::InitRequired { operation: "get_briefing" }));
    }

    #[test]
    fn test_requires_initialization_succeeds_after_register() {
        let gate = ProtocolGate::default();
        gate.register_initialization("proj");
        assert!(gate.requires_initialization("proj", "record").is_ok());
    }

    #[test]
    fn test_requires_context_fails_without_context_check() {
        let gate = ProtocolGate::default();
        gate.register_initialization("proj");
        let err = gate.requires_context("proj", "seal_outcome").unwrap_err();
        assert!(matches!(err, EngineError::ContextCheckRequired { operation: "seal_outcome" }));
    }

    #[test]
    fn test_requires_context_succeeds_immediately_after_check() {
        let gate = ProtocolGate::default();
        gate.register_initialization("proj");
        gate.register_context("proj");
        assert!(gate.requires_context("proj", "seal_outcome").is_ok());
    }

    #[test]
    fn test_requires_context_expires_after_ttl() {
        let gate = ProtocolGate::new(300);
        gate.register_initialization("proj");
        gate.register_context("proj");
        let six_minutes_later = Utc::now() + ChronoDuration::seconds(360);
        let err = gate.requires_context_at("proj", "seal_outcome", six_minutes_later).unwrap_err();
        assert!(matches!(err, EngineError::ContextCheckRequired { .. }));
    }

    #[test]
    fn test_gate_is_per_instance_not_global() {
        let gate_a = ProtocolGate::default();
        let gate_b = ProtocolGate::default();
        gate_a.register_initialization("proj");
        assert!(gate_a.requires_initialization("proj", "record").is_ok());
        assert!(gate_b.requires_initialization("proj", "record").is_err());
    }
}
