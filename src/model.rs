use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Span starting at `start` and lasting `minutes`. `None` when the
    /// duration is not positive or the end does not fit in an `Ms`.
    pub fn from_minutes(start: Ms, minutes: i64) -> Option<Self> {
        let end = minutes
            .checked_mul(MINUTE_MS)
            .and_then(|d| start.checked_add(d))?;
        (end > start).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Scheduled,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// `SCHEDULED -> {CONFIRMED, CANCELLED}`, `CONFIRMED -> {COMPLETED, CANCELLED}`.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Scheduled, BookingStatus::Confirmed)
                | (BookingStatus::Scheduled, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Completed)
                | (BookingStatus::Confirmed, BookingStatus::Cancelled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "scheduled" => Ok(BookingStatus::Scheduled),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// A scheduled appointment between a practitioner and a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub practitioner_id: Ulid,
    pub subject_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
}

impl Booking {
    /// Cancelled bookings never take part in conflict checks.
    pub fn is_blocking(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }
}

#[derive(Debug, Clone)]
pub struct PractitionerState {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    /// All bookings, cancelled included, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl PractitionerState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            active: true,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn info(&self) -> PractitionerInfo {
        PractitionerInfo {
            id: self.id,
            name: self.name.clone(),
            active: self.active,
        }
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PractitionerRegistered {
        id: Ulid,
        name: Option<String>,
    },
    PractitionerDeactivated {
        id: Ulid,
    },
    SubjectRegistered {
        id: Ulid,
        name: Option<String>,
    },
    BookingCreated {
        id: Ulid,
        practitioner_id: Ulid,
        subject_id: Ulid,
        span: Span,
        notes: Option<String>,
    },
    BookingStatusChanged {
        id: Ulid,
        practitioner_id: Ulid,
        status: BookingStatus,
    },
    BookingRescheduled {
        id: Ulid,
        practitioner_id: Ulid,
        span: Span,
    },
    BookingNotesChanged {
        id: Ulid,
        practitioner_id: Ulid,
        notes: Option<String>,
    },
    /// Events written as one WAL record. Replay sees all of them or none.
    Batch {
        events: Vec<Event>,
    },
}

impl Event {
    /// The practitioner whose agenda this event touches, if any.
    pub fn practitioner_id(&self) -> Option<Ulid> {
        match self {
            Event::PractitionerRegistered { id, .. } | Event::PractitionerDeactivated { id } => {
                Some(*id)
            }
            Event::BookingCreated { practitioner_id, .. }
            | Event::BookingStatusChanged { practitioner_id, .. }
            | Event::BookingRescheduled { practitioner_id, .. }
            | Event::BookingNotesChanged { practitioner_id, .. } => Some(*practitioner_id),
            Event::SubjectRegistered { .. } | Event::Batch { .. } => None,
        }
    }
}

// ── Request / result types ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub practitioner_id: Ulid,
    pub subject_id: Ulid,
    pub start: Ms,
    pub duration_minutes: i64,
    pub notes: Option<String>,
}

/// The existing booking that blocks a proposed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub booking_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PractitionerInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectInfo {
    pub id: Ulid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub id: Option<Ulid>,
    pub practitioner_id: Option<Ulid>,
    pub subject_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
    /// Keep bookings with `start >= from`.
    pub from: Option<Ms>,
    /// Keep bookings with `end <= until`.
    pub until: Option<Ms>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl BookingFilter {
    pub fn matches(&self, b: &Booking) -> bool {
        self.id.is_none_or(|id| b.id == id)
            && self.practitioner_id.is_none_or(|p| b.practitioner_id == p)
            && self.subject_id.is_none_or(|s| b.subject_id == s)
            && self.status.is_none_or(|s| b.status == s)
            && self.from.is_none_or(|t| b.span.start >= t)
            && self.until.is_none_or(|t| b.span.end <= t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            practitioner_id: Ulid::new(),
            subject_id: Ulid::new(),
            span: Span::new(start, end),
            status,
            notes: None,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_from_minutes() {
        let s = Span::from_minutes(0, 30).unwrap();
        assert_eq!(s.end, 30 * MINUTE_MS);
        assert_eq!(Span::from_minutes(Ms::MAX - 1_000, 30), None);
        assert_eq!(Span::from_minutes(0, 0), None);
        assert_eq!(s.duration_minutes(), 30);
    }

    #[test]
    fn status_state_machine() {
        use BookingStatus::*;
        assert!(Scheduled.can_transition_to(Confirmed));
        assert!(Scheduled.can_transition_to(Cancelled));
        assert!(!Scheduled.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(!Confirmed.can_transition_to(Scheduled));
        for terminal in [Completed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Scheduled, Confirmed, Completed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_parse() {
        assert_eq!("CONFIRMED".parse::<BookingStatus>(), Ok(BookingStatus::Confirmed));
        assert_eq!("canceled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert!("agendada".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut ps = PractitionerState::new(Ulid::new(), None);
        ps.insert_booking(booking(300, 400, BookingStatus::Scheduled));
        ps.insert_booking(booking(100, 200, BookingStatus::Scheduled));
        ps.insert_booking(booking(200, 300, BookingStatus::Cancelled));
        let starts: Vec<Ms> = ps.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ps = PractitionerState::new(Ulid::new(), None);
        ps.insert_booking(booking(100, 200, BookingStatus::Scheduled));
        ps.insert_booking(booking(450, 600, BookingStatus::Scheduled));
        ps.insert_booking(booking(1000, 1100, BookingStatus::Scheduled));

        let hits: Vec<_> = ps.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ps = PractitionerState::new(Ulid::new(), None);
        ps.insert_booking(booking(100, 200, BookingStatus::Scheduled));
        assert_eq!(ps.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn remove_booking_preserves_order() {
        let mut ps = PractitionerState::new(Ulid::new(), None);
        let ids: Vec<Ulid> = (0..3)
            .map(|i| {
                let b = booking(i * 100, i * 100 + 50, BookingStatus::Scheduled);
                let id = b.id;
                ps.insert_booking(b);
                id
            })
            .collect();
        assert!(ps.remove_booking(ids[1]).is_some());
        assert!(ps.remove_booking(Ulid::new()).is_none());
        assert_eq!(ps.bookings[0].id, ids[0]);
        assert_eq!(ps.bookings[1].id, ids[2]);
    }

    #[test]
    fn filter_matches_window_and_status() {
        let b = booking(1000, 2000, BookingStatus::Confirmed);
        let mut f = BookingFilter {
            from: Some(1000),
            until: Some(2000),
            ..Default::default()
        };
        assert!(f.matches(&b));
        f.status = Some(BookingStatus::Scheduled);
        assert!(!f.matches(&b));
        let f = BookingFilter {
            until: Some(1999),
            ..Default::default()
        };
        assert!(!f.matches(&b));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            id: Ulid::new(),
            practitioner_id: Ulid::new(),
            subject_id: Ulid::new(),
            span: Span::new(0, 30 * MINUTE_MS),
            notes: Some("first visit".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn batch_record_keeps_inner_events() {
        let p = Ulid::new();
        let inner = vec![
            Event::BookingNotesChanged {
                id: Ulid::new(),
                practitioner_id: p,
                notes: Some("bring exams".into()),
            },
            Event::PractitionerDeactivated { id: p },
        ];
        let batch = Event::Batch { events: inner.clone() };
        assert_eq!(batch.practitioner_id(), None);
        assert_eq!(inner[0].practitioner_id(), Some(p));

        let decoded: Event = bincode::deserialize(&bincode::serialize(&batch).unwrap()).unwrap();
        assert_eq!(decoded, Event::Batch { events: inner });
    }
}
