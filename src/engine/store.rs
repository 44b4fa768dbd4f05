use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::{EngineError, SharedPractitionerState};

/// Lookup of bookable practitioners.
pub trait PractitionerDirectory {
    /// Fails with `UnknownPractitioner` when the id is missing or inactive.
    fn active_practitioner(&self, id: Ulid) -> Result<PractitionerInfo, EngineError>;
}

pub trait SubjectDirectory {
    fn subject(&self, id: Ulid) -> Result<SubjectInfo, EngineError>;
}

pub struct InMemoryStore {
    practitioners: DashMap<Ulid, SharedPractitionerState>,
    /// Lock-free copy of each practitioner's directory entry.
    directory: DashMap<Ulid, PractitionerInfo>,
    subjects: DashMap<Ulid, SubjectInfo>,
    /// Reverse lookup: booking id → practitioner id. Ids are claimed here
    /// before their WAL append, so an id can only ever be booked once.
    booking_index: DashMap<Ulid, Ulid>,
    pending_practitioners: DashMap<Ulid, ()>,
    pending_subjects: DashMap<Ulid, ()>,
}

/// A directory id held between the duplicate check and the insert that
/// follows its WAL append. Dropping the claim frees the id.
pub struct DirectoryClaim<'a> {
    pending: &'a DashMap<Ulid, ()>,
    id: Ulid,
}

impl Drop for DirectoryClaim<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

fn claim<'a>(
    pending: &'a DashMap<Ulid, ()>,
    id: Ulid,
    exists: impl FnOnce() -> bool,
) -> Option<DirectoryClaim<'a>> {
    match pending.entry(id) {
        Entry::Occupied(_) => return None,
        Entry::Vacant(slot) => {
            slot.insert(());
        }
    }
    let claim = DirectoryClaim { pending, id };
    // A registration that finished before our claim has already inserted.
    if exists() {
        return None;
    }
    Some(claim)
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            practitioners: DashMap::new(),
            directory: DashMap::new(),
            subjects: DashMap::new(),
            booking_index: DashMap::new(),
            pending_practitioners: DashMap::new(),
            pending_subjects: DashMap::new(),
        }
    }

    // ── Practitioners ────────────────────────────────────────

    pub fn practitioner_count(&self) -> usize {
        self.practitioners.len()
    }

    pub fn contains_practitioner(&self, id: &Ulid) -> bool {
        self.practitioners.contains_key(id)
    }

    /// `None` if the id is registered or another registration holds it.
    pub fn claim_practitioner_id(&self, id: Ulid) -> Option<DirectoryClaim<'_>> {
        claim(&self.pending_practitioners, id, || self.contains_practitioner(&id))
    }

    pub fn get_practitioner(&self, id: &Ulid) -> Option<SharedPractitionerState> {
        self.practitioners.get(id).map(|e| e.value().clone())
    }

    pub fn insert_practitioner(&self, state: PractitionerState) {
        self.directory.insert(state.id, state.info());
        self.practitioners
            .insert(state.id, Arc::new(RwLock::new(state)));
    }

    /// Ids sorted, so callers that lock several practitioners lock them in
    /// one global order.
    pub fn practitioner_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.practitioners.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn practitioners(&self) -> Vec<PractitionerInfo> {
        let mut all: Vec<PractitionerInfo> =
            self.directory.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|p| p.id);
        all
    }

    // ── Subjects ─────────────────────────────────────────────

    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }

    pub fn contains_subject(&self, id: &Ulid) -> bool {
        self.subjects.contains_key(id)
    }

    pub fn claim_subject_id(&self, id: Ulid) -> Option<DirectoryClaim<'_>> {
        claim(&self.pending_subjects, id, || self.contains_subject(&id))
    }

    pub fn insert_subject(&self, info: SubjectInfo) {
        self.subjects.insert(info.id, info);
    }

    pub fn subjects(&self) -> Vec<SubjectInfo> {
        let mut all: Vec<SubjectInfo> = self.subjects.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    // ── Booking index ────────────────────────────────────────

    pub fn practitioner_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    pub fn contains_booking(&self, booking_id: &Ulid) -> bool {
        self.booking_index.contains_key(booking_id)
    }

    /// Reserve `booking_id` for `practitioner_id`. `false` if it is taken.
    pub fn claim_booking_id(&self, booking_id: Ulid, practitioner_id: Ulid) -> bool {
        match self.booking_index.entry(booking_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(practitioner_id);
                true
            }
        }
    }

    /// Undo `claim_booking_id` after a failed WAL append.
    pub fn release_booking_ids(&self, booking_ids: &[Ulid]) {
        for id in booking_ids {
            self.booking_index.remove(id);
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply a directory-level event. Returns `false` for agenda events,
    /// which need the practitioner lock and go through `apply_event`.
    pub fn apply_directory_event(&self, event: &Event) -> bool {
        match event {
            Event::PractitionerRegistered { id, name } => {
                if !self.contains_practitioner(id) {
                    self.insert_practitioner(PractitionerState::new(*id, name.clone()));
                }
                true
            }
            Event::SubjectRegistered { id, name } => {
                self.insert_subject(SubjectInfo {
                    id: *id,
                    name: name.clone(),
                });
                true
            }
            _ => false,
        }
    }

    /// Apply an agenda event to a practitioner (no locking, caller holds the lock).
    pub fn apply_event(&self, ps: &mut PractitionerState, event: &Event) {
        match event {
            Event::PractitionerDeactivated { id } => {
                ps.active = false;
                if let Some(mut info) = self.directory.get_mut(id) {
                    info.active = false;
                }
            }
            Event::BookingCreated {
                id,
                practitioner_id,
                subject_id,
                span,
                notes,
            } => {
                ps.insert_booking(Booking {
                    id: *id,
                    practitioner_id: *practitioner_id,
                    subject_id: *subject_id,
                    span: *span,
                    status: BookingStatus::Scheduled,
                    notes: notes.clone(),
                });
                self.booking_index.insert(*id, *practitioner_id);
            }
            Event::BookingStatusChanged { id, status, .. } => {
                if let Some(b) = ps.booking_mut(*id) {
                    b.status = *status;
                }
            }
            Event::BookingRescheduled { id, span, .. } => {
                // Remove and reinsert so the agenda stays sorted by start.
                if let Some(mut b) = ps.remove_booking(*id) {
                    b.span = *span;
                    ps.insert_booking(b);
                }
            }
            Event::BookingNotesChanged { id, notes, .. } => {
                if let Some(b) = ps.booking_mut(*id) {
                    b.notes = notes.clone();
                }
            }
            // Directory events go through `apply_directory_event`; batches
            // are split by the caller, which holds one lock per practitioner.
            Event::PractitionerRegistered { .. }
            | Event::SubjectRegistered { .. }
            | Event::Batch { .. } => {}
        }
    }
}

impl PractitionerDirectory for InMemoryStore {
    fn active_practitioner(&self, id: Ulid) -> Result<PractitionerInfo, EngineError> {
        match self.directory.get(&id) {
            Some(info) if info.active => Ok(info.value().clone()),
            _ => Err(EngineError::UnknownPractitioner(id)),
        }
    }
}

impl SubjectDirectory for InMemoryStore {
    fn subject(&self, id: Ulid) -> Result<SubjectInfo, EngineError> {
        self.subjects
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::UnknownSubject(id))
    }
}
