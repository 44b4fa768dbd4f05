use ulid::Ulid;

use crate::audit::AuditEntry;
use crate::limits::*;
use crate::model::*;

use super::availability::free_slots;
use super::conflict::{first_conflict, proposed_span};
use super::store::PractitionerDirectory;
use super::{Engine, EngineError};

impl Engine {
    /// Would `[start, start + duration)` fit in the practitioner's agenda?
    /// Returns the blocking booking, if any. Nothing is written.
    pub async fn check_availability(
        &self,
        practitioner_id: Ulid,
        start: Ms,
        duration_minutes: i64,
    ) -> Result<Option<Conflict>, EngineError> {
        let proposed = proposed_span(start, duration_minutes)?;
        self.store.active_practitioner(practitioner_id)?;
        let ps = self
            .get_practitioner(&practitioner_id)
            .ok_or(EngineError::UnknownPractitioner(practitioner_id))?;
        let guard = ps.read().await;
        Ok(first_conflict(guard.overlapping(&proposed), &proposed, None))
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let pid = self.store.practitioner_for_booking(&id)?;
        let ps = self.get_practitioner(&pid)?;
        let guard = ps.read().await;
        guard.booking(id).cloned()
    }

    /// Bookings matching `filter`, sorted by (start, id), then paged.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let practitioner_ids = match (filter.id, filter.practitioner_id) {
            (Some(id), _) => self
                .store
                .practitioner_for_booking(&id)
                .into_iter()
                .collect(),
            (None, Some(pid)) => vec![pid],
            (None, None) => self.store.practitioner_ids(),
        };

        let mut out = Vec::new();
        for pid in practitioner_ids {
            let Some(ps) = self.get_practitioner(&pid) else {
                continue;
            };
            let guard = ps.read().await;
            out.extend(guard.bookings.iter().filter(|b| filter.matches(b)).cloned());
        }
        out.sort_by_key(|b| (b.span.start, b.id));

        let limit = filter.limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT);
        out.into_iter().skip(filter.offset).take(limit).collect()
    }

    pub fn list_practitioners(&self) -> Vec<PractitionerInfo> {
        self.store.practitioners()
    }

    pub fn list_subjects(&self) -> Vec<SubjectInfo> {
        self.store.subjects()
    }

    /// Free gaps in a practitioner's agenda within `[window_start, window_end)`.
    pub async fn free_slots(
        &self,
        practitioner_id: Ulid,
        window_start: Ms,
        window_end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let valid = MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS;
        if !valid.contains(&window_start) || !valid.contains(&window_end) {
            return Err(EngineError::InvalidInterval(format!(
                "window [{window_start}, {window_end}) out of range"
            )));
        }
        if window_end <= window_start {
            return Err(EngineError::InvalidInterval(format!(
                "window end {window_end} must be after start {window_start}"
            )));
        }
        if window_end - window_start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let ps = self
            .get_practitioner(&practitioner_id)
            .ok_or(EngineError::UnknownPractitioner(practitioner_id))?;
        let guard = ps.read().await;
        Ok(free_slots(
            &guard,
            &Span::new(window_start, window_end),
            min_duration_ms,
        ))
    }

    pub fn audit_log(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit.recent(limit.min(MAX_AUDIT_ENTRIES))
    }
}
