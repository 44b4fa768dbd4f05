use std::collections::{HashMap, HashSet};

use serde_json::json;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::audit::{AuditAction, AuditEntry};
use crate::limits::*;
use crate::model::*;
use crate::policy::Actor;

use super::conflict::{check_no_conflict, now_ms, proposed_span};
use super::store::{PractitionerDirectory, SubjectDirectory};
use super::{Engine, EngineError, WalCommand};

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded("name too long")),
        _ => Ok(()),
    }
}

fn check_notes(notes: &Option<String>) -> Result<(), EngineError> {
    match notes {
        Some(n) if n.len() > MAX_NOTES_LEN => Err(EngineError::LimitExceeded("notes too long")),
        _ => Ok(()),
    }
}

impl Engine {
    // ── Directory ────────────────────────────────────────────

    pub async fn register_practitioner(
        &self,
        actor: &Actor,
        id: Ulid,
        name: Option<String>,
    ) -> Result<PractitionerInfo, EngineError> {
        check_name(&name)?;
        let _gate = self.compact_gate.read().await;
        if self.store.practitioner_count() >= MAX_PRACTITIONERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many practitioners"));
        }
        let claim = self
            .store
            .claim_practitioner_id(id)
            .ok_or(EngineError::AlreadyExists(id))?;

        let event = Event::PractitionerRegistered { id, name: name.clone() };
        self.wal_append(&event).await?;
        let state = PractitionerState::new(id, name);
        let info = state.info();
        self.store.insert_practitioner(state);
        drop(claim);
        self.record_audit(AuditEntry::new(
            now_ms(),
            actor,
            AuditAction::Create,
            "practitioner",
            id,
            json!({ "name": info.name }),
        ));
        Ok(info)
    }

    /// Soft delete: the practitioner keeps its agenda but takes no new bookings.
    pub async fn deactivate_practitioner(
        &self,
        actor: &Actor,
        id: Ulid,
    ) -> Result<PractitionerInfo, EngineError> {
        let _gate = self.compact_gate.read().await;
        let ps = self
            .get_practitioner(&id)
            .ok_or(EngineError::UnknownPractitioner(id))?;
        let mut guard = ps.write().await;
        if !guard.active {
            return Ok(guard.info());
        }

        let event = Event::PractitionerDeactivated { id };
        self.persist_and_apply(&mut guard, &event).await?;
        self.record_audit(AuditEntry::new(
            now_ms(),
            actor,
            AuditAction::Deactivate,
            "practitioner",
            id,
            json!({}),
        ));
        Ok(guard.info())
    }

    pub async fn register_subject(
        &self,
        actor: &Actor,
        id: Ulid,
        name: Option<String>,
    ) -> Result<SubjectInfo, EngineError> {
        check_name(&name)?;
        let _gate = self.compact_gate.read().await;
        if self.store.subject_count() >= MAX_SUBJECTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many subjects"));
        }
        let claim = self
            .store
            .claim_subject_id(id)
            .ok_or(EngineError::AlreadyExists(id))?;

        let event = Event::SubjectRegistered { id, name: name.clone() };
        self.wal_append(&event).await?;
        let info = SubjectInfo { id, name };
        self.store.insert_subject(info.clone());
        drop(claim);
        self.record_audit(AuditEntry::new(
            now_ms(),
            actor,
            AuditAction::Create,
            "subject",
            id,
            json!({ "name": info.name }),
        ));
        Ok(info)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Book a slot. The practitioner's write lock is held from the conflict
    /// check until the booking is durable and applied.
    pub async fn book_appointment(
        &self,
        actor: &Actor,
        request: BookingRequest,
    ) -> Result<Booking, EngineError> {
        let span = proposed_span(request.start, request.duration_minutes)?;
        check_notes(&request.notes)?;
        self.store.subject(request.subject_id)?;
        self.store.active_practitioner(request.practitioner_id)?;

        let _gate = self.compact_gate.read().await;
        let ps = self
            .get_practitioner(&request.practitioner_id)
            .ok_or(EngineError::UnknownPractitioner(request.practitioner_id))?;
        let mut guard = ps.write().await;
        // Deactivation may have won the race for the lock.
        if !guard.active {
            return Err(EngineError::UnknownPractitioner(request.practitioner_id));
        }
        if self.store.contains_booking(&request.id) {
            return Err(EngineError::AlreadyExists(request.id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PRACTITIONER {
            return Err(EngineError::LimitExceeded("too many bookings on practitioner"));
        }

        check_no_conflict(&guard, &span, None)?;

        // Another practitioner's lock may be booking the same id right now.
        if !self.store.claim_booking_id(request.id, request.practitioner_id) {
            return Err(EngineError::AlreadyExists(request.id));
        }
        let event = Event::BookingCreated {
            id: request.id,
            practitioner_id: request.practitioner_id,
            subject_id: request.subject_id,
            span,
            notes: request.notes,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.store.release_booking_ids(&[request.id]);
            return Err(e);
        }
        let booking = guard
            .booking(request.id)
            .cloned()
            .ok_or(EngineError::NotFound(request.id))?;
        drop(guard);

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        self.audit_booking(actor, AuditAction::Create, &booking, json!({}));
        Ok(booking)
    }

    /// Atomically book multiple slots. All-or-nothing: if any request fails
    /// validation or conflicts, nothing is committed. Requests may target
    /// different practitioners. The bookings are written as a single
    /// `Event::Batch` record, so a WAL failure or a torn tail also leaves
    /// none of them behind.
    pub async fn batch_book(
        &self,
        actor: &Actor,
        requests: Vec<BookingRequest>,
    ) -> Result<Vec<Booking>, EngineError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let mut spans = Vec::with_capacity(requests.len());
        let mut seen = HashSet::new();
        for req in &requests {
            spans.push(proposed_span(req.start, req.duration_minutes)?);
            check_notes(&req.notes)?;
            self.store.subject(req.subject_id)?;
            self.store.active_practitioner(req.practitioner_id)?;
            if !seen.insert(req.id) || self.store.contains_booking(&req.id) {
                return Err(EngineError::AlreadyExists(req.id));
            }
        }

        let _gate = self.compact_gate.read().await;

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut practitioner_ids: Vec<Ulid> =
            requests.iter().map(|r| r.practitioner_id).collect();
        practitioner_ids.sort();
        practitioner_ids.dedup();

        let mut guards = Vec::with_capacity(practitioner_ids.len());
        let mut guard_index = HashMap::new();
        for pid in &practitioner_ids {
            let ps = self
                .get_practitioner(pid)
                .ok_or(EngineError::UnknownPractitioner(*pid))?;
            let guard = ps.write_owned().await;
            if !guard.active {
                return Err(EngineError::UnknownPractitioner(*pid));
            }
            guard_index.insert(*pid, guards.len());
            guards.push(guard);
        }

        // Phase 1: validate against the store and against earlier requests
        // of the same batch.
        let mut accepted: HashMap<Ulid, Vec<(Ulid, Span)>> = HashMap::new();
        for (req, span) in requests.iter().zip(&spans) {
            let guard = &guards[guard_index[&req.practitioner_id]];
            let pending = accepted.entry(req.practitioner_id).or_default();
            if guard.bookings.len() + pending.len() >= MAX_BOOKINGS_PER_PRACTITIONER {
                return Err(EngineError::LimitExceeded("too many bookings on practitioner"));
            }
            check_no_conflict(guard, span, None)?;
            if let Some((other_id, other_span)) = pending
                .iter()
                .filter(|(_, s)| s.overlaps(span))
                .min_by_key(|(id, s)| (s.start, *id))
            {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::SchedulingConflict {
                    booking_id: *other_id,
                    span: *other_span,
                });
            }
            pending.push((req.id, *span));
        }

        // Phase 2: claim every id, then commit the batch as one record.
        let ids: Vec<Ulid> = requests.iter().map(|r| r.id).collect();
        for (n, req) in requests.iter().enumerate() {
            if !self.store.claim_booking_id(req.id, req.practitioner_id) {
                self.store.release_booking_ids(&ids[..n]);
                return Err(EngineError::AlreadyExists(req.id));
            }
        }
        let events: Vec<Event> = requests
            .into_iter()
            .zip(spans)
            .map(|(req, span)| Event::BookingCreated {
                id: req.id,
                practitioner_id: req.practitioner_id,
                subject_id: req.subject_id,
                span,
                notes: req.notes,
            })
            .collect();
        let record = Event::Batch {
            events: events.clone(),
        };
        if let Err(e) = self.wal_submit(record).await {
            self.store.release_booking_ids(&ids);
            return Err(e);
        }

        let mut booked = Vec::with_capacity(events.len());
        for event in &events {
            let Event::BookingCreated { id, practitioner_id, .. } = event else {
                continue;
            };
            let guard = &mut guards[guard_index[practitioner_id]];
            self.store.apply_event(guard, event);
            if let Some(b) = guard.booking(*id) {
                booked.push(b.clone());
            }
        }
        drop(guards);

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL)
            .increment(booked.len() as u64);
        for booking in &booked {
            self.audit_booking(actor, AuditAction::Create, booking, json!({ "batch": true }));
        }
        Ok(booked)
    }

    /// Cancel a booking. Cancelling a cancelled booking succeeds without
    /// writing anything; completed bookings cannot be cancelled.
    pub async fn cancel_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.compact_gate.read().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        match current.status {
            BookingStatus::Cancelled => return Ok(current),
            BookingStatus::Completed => {
                return Err(EngineError::InvalidStateTransition {
                    id,
                    from: current.status,
                    to: BookingStatus::Cancelled,
                });
            }
            BookingStatus::Scheduled | BookingStatus::Confirmed => {}
        }

        let event = Event::BookingStatusChanged {
            id,
            practitioner_id: current.practitioner_id,
            status: BookingStatus::Cancelled,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        self.audit_booking(
            actor,
            AuditAction::Cancel,
            &booking,
            json!({ "from": current.status.as_str() }),
        );
        Ok(booking)
    }

    /// Move a booking along `SCHEDULED -> CONFIRMED -> COMPLETED`.
    /// Transitions to CANCELLED behave exactly like `cancel_booking`.
    pub async fn transition_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        if status == BookingStatus::Cancelled {
            return self.cancel_booking(actor, id).await;
        }

        let _gate = self.compact_gate.read().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !current.status.can_transition_to(status) {
            return Err(EngineError::InvalidStateTransition {
                id,
                from: current.status,
                to: status,
            });
        }

        let event = Event::BookingStatusChanged {
            id,
            practitioner_id: current.practitioner_id,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        self.audit_booking(
            actor,
            AuditAction::Update,
            &booking,
            json!({ "from": current.status.as_str(), "to": status.as_str() }),
        );
        Ok(booking)
    }

    /// Move an active booking to a new start (and optionally a new duration).
    /// The booking's own former slot never conflicts with itself.
    pub async fn reschedule_booking(
        &self,
        actor: &Actor,
        id: Ulid,
        start: Ms,
        duration_minutes: Option<i64>,
    ) -> Result<Booking, EngineError> {
        let _gate = self.compact_gate.read().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status.is_terminal() {
            return Err(EngineError::InvalidStateTransition {
                id,
                from: current.status,
                to: BookingStatus::Scheduled,
            });
        }

        let minutes = duration_minutes.unwrap_or_else(|| current.span.duration_minutes());
        let span = proposed_span(start, minutes)?;
        check_no_conflict(&guard, &span, Some(id))?;

        let event = Event::BookingRescheduled {
            id,
            practitioner_id: current.practitioner_id,
            span,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        self.audit_booking(
            actor,
            AuditAction::Update,
            &booking,
            json!({
                "previous_start": current.span.start,
                "previous_end": current.span.end,
            }),
        );
        Ok(booking)
    }

    /// Replace a booking's notes, whatever its status. Writing the notes it
    /// already has is a no-op.
    pub async fn update_booking_notes(
        &self,
        actor: &Actor,
        id: Ulid,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        check_notes(&notes)?;
        let _gate = self.compact_gate.read().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.notes == notes {
            return Ok(current);
        }

        let event = Event::BookingNotesChanged {
            id,
            practitioner_id: current.practitioner_id,
            notes,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        self.audit_booking(
            actor,
            AuditAction::Update,
            &booking,
            json!({ "previous_notes": current.notes }),
        );
        Ok(booking)
    }

    fn audit_booking(
        &self,
        actor: &Actor,
        action: AuditAction,
        booking: &Booking,
        extra: serde_json::Value,
    ) {
        let mut details = json!({
            "practitioner_id": booking.practitioner_id.to_string(),
            "subject_id": booking.subject_id.to_string(),
            "start": booking.span.start,
            "end": booking.span.end,
            "status": booking.status.as_str(),
        });
        if let (Some(details), serde_json::Value::Object(extra)) = (details.as_object_mut(), extra)
        {
            details.extend(extra);
        }
        self.record_audit(AuditEntry::new(
            now_ms(),
            actor,
            action,
            "booking",
            booking.id,
            details,
        ));
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compact_gate.write().await;

        let mut events = Vec::new();
        for subject in self.store.subjects() {
            events.push(Event::SubjectRegistered {
                id: subject.id,
                name: subject.name,
            });
        }
        for pid in self.store.practitioner_ids() {
            let Some(ps) = self.get_practitioner(&pid) else {
                continue;
            };
            let guard = ps.read().await;
            events.push(Event::PractitionerRegistered {
                id: guard.id,
                name: guard.name.clone(),
            });
            for b in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    practitioner_id: b.practitioner_id,
                    subject_id: b.subject_id,
                    span: b.span,
                    notes: b.notes.clone(),
                });
                if b.status != BookingStatus::Scheduled {
                    events.push(Event::BookingStatusChanged {
                        id: b.id,
                        practitioner_id: b.practitioner_id,
                        status: b.status,
                    });
                }
            }
            if !guard.active {
                events.push(Event::PractitionerDeactivated { id: guard.id });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::debug!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
