//! Hard limits enforced per tenant. Every request that could grow memory
//! or the WAL without bound is checked against one of these.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_PRACTITIONERS_PER_TENANT: usize = 10_000;
pub const MAX_SUBJECTS_PER_TENANT: usize = 1_000_000;
pub const MAX_BOOKINGS_PER_PRACTITIONER: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4_096;

pub const MAX_BATCH_SIZE: usize = 500;
pub const MAX_LIST_LIMIT: usize = 10_000;
pub const MAX_AUDIT_ENTRIES: usize = 10_000;

/// Appointments default to half an hour when no duration is given.
pub const DEFAULT_DURATION_MINUTES: i64 = 30;
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Free-slot queries may look at most one year ahead.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;
