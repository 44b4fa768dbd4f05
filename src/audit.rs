use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use ulid::Ulid;

use crate::limits::MAX_AUDIT_ENTRIES;
use crate::model::Ms;
use crate::policy::Actor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Create,
    Update,
    Cancel,
    Deactivate,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Cancel => "CANCEL",
            AuditAction::Deactivate => "DEACTIVATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub at: Ms,
    pub actor: String,
    pub action: AuditAction,
    pub entity_type: &'static str,
    pub entity_id: Ulid,
    pub details: Value,
}

impl AuditEntry {
    pub fn new(
        at: Ms,
        actor: &Actor,
        action: AuditAction,
        entity_type: &'static str,
        entity_id: Ulid,
        details: Value,
    ) -> Self {
        Self {
            at,
            actor: actor.to_string(),
            action,
            entity_type,
            entity_id,
            details,
        }
    }
}

/// Where audit entries go. Recording is fire-and-forget: it never fails the
/// operation that produced the entry.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);

    /// Newest entries first.
    fn recent(&self, _limit: usize) -> Vec<AuditEntry> {
        Vec::new()
    }
}

/// Emits every entry as a `tracing` event (target `audit`) and keeps the last
/// `capacity` entries in memory for `SELECT * FROM audit_log`.
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(MAX_AUDIT_ENTRIES)
    }
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Lock the deque, taking over a poisoned lock. Every critical section
    /// leaves the deque consistent.
    fn entries(&self) -> MutexGuard<'_, VecDeque<AuditEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(target: "audit", "audit log lock poisoned, recovering");
            self.entries.clear_poison();
            PoisonError::into_inner(poisoned)
        })
    }
}

impl AuditSink for AuditLog {
    fn record(&self, entry: AuditEntry) {
        tracing::info!(
            target: "audit",
            actor = %entry.actor,
            action = entry.action.as_str(),
            entity = entry.entity_type,
            entity_id = %entry.entity_id,
            details = %entry.details,
            "recorded"
        );
        let mut entries = self.entries();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.entries().iter().rev().take(limit).cloned().collect()
    }
}
