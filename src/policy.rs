//! Centralized authorization. The wire layer resolves the actor once per
//! connection and asks `authorize` before executing any command.

use std::fmt;

use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Internal callers: replay, maintenance, tests.
    System,
    Admin,
    Practitioner(Ulid),
    Subject(Ulid),
}

impl Actor {
    /// Map a login user name to an actor: `admin`, `practitioner_<ULID>`,
    /// `subject_<ULID>`. Anything else is not a valid login.
    pub fn from_login(user: &str) -> Option<Actor> {
        let user = user.trim();
        if user.eq_ignore_ascii_case("admin") {
            return Some(Actor::Admin);
        }
        if let Some(id) = user.strip_prefix("practitioner_") {
            return Ulid::from_string(id).ok().map(Actor::Practitioner);
        }
        if let Some(id) = user.strip_prefix("subject_") {
            return Ulid::from_string(id).ok().map(Actor::Subject);
        }
        None
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::Admin => f.write_str("admin"),
            Actor::Practitioner(id) => write!(f, "practitioner_{id}"),
            Actor::Subject(id) => write!(f, "subject_{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ManageDirectory,
    ViewDirectory,
    Book,
    Cancel,
    Transition,
    Reschedule,
    EditNotes,
    ViewBookings,
    ViewAvailability,
    ViewAuditLog,
}

/// What the action targets, as far as ownership is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Directory,
    /// A practitioner's whole agenda.
    Agenda { practitioner_id: Ulid },
    /// One booking, or a listing restricted to one subject.
    Booking {
        practitioner_id: Option<Ulid>,
        subject_id: Option<Ulid>,
    },
    /// Unrestricted listing of every booking in the clinic.
    AllBookings,
    AuditLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(&'static str),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

pub fn authorize(actor: &Actor, action: Action, resource: &Resource) -> Decision {
    match actor {
        Actor::System | Actor::Admin => Decision::Allow,
        Actor::Practitioner(me) => practitioner_policy(*me, action, resource),
        Actor::Subject(me) => subject_policy(*me, action, resource),
    }
}

fn owns_agenda(me: Ulid, resource: &Resource) -> bool {
    match resource {
        Resource::Agenda { practitioner_id } => *practitioner_id == me,
        Resource::Booking {
            practitioner_id: Some(p),
            ..
        } => *p == me,
        _ => false,
    }
}

fn practitioner_policy(me: Ulid, action: Action, resource: &Resource) -> Decision {
    match action {
        Action::ViewDirectory => Decision::Allow,
        Action::ManageDirectory | Action::ViewAuditLog => Decision::Deny("admin only"),
        Action::Book
        | Action::Cancel
        | Action::Transition
        | Action::Reschedule
        | Action::EditNotes
        | Action::ViewBookings
        | Action::ViewAvailability => {
            if owns_agenda(me, resource) {
                Decision::Allow
            } else {
                Decision::Deny("not your agenda")
            }
        }
    }
}

fn subject_policy(me: Ulid, action: Action, resource: &Resource) -> Decision {
    match action {
        Action::ViewDirectory | Action::ViewAvailability => Decision::Allow,
        Action::Cancel | Action::ViewBookings => match resource {
            Resource::Booking {
                subject_id: Some(s),
                ..
            } if *s == me => Decision::Allow,
            _ => Decision::Deny("not your booking"),
        },
        Action::Book | Action::Transition | Action::Reschedule | Action::EditNotes => {
            Decision::Deny("patients cannot change the agenda")
        }
        Action::ManageDirectory | Action::ViewAuditLog => Decision::Deny("admin only"),
    }
}
