//! Hard limits applied to every facility. Requests exceeding them are
//! rejected before a transaction is opened.

use crate::model::{Ms, DAY_MS};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_RESERVATION_DURATION_MS: Ms = 7 * DAY_MS;
pub const MAX_SESSION_DURATION_MS: Ms = DAY_MS;

pub const MAX_COURTS_PER_RESERVATION: usize = 64;
pub const MAX_PARTICIPANTS_PER_RESERVATION: usize = 256;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_RECURRENCE_RULE_LEN: usize = 512;
pub const MAX_REASON_LEN: usize = 1024;

pub const MAX_TIERS_PER_FACILITY: usize = 128;
pub const MAX_REFUND_PERCENTAGE: u8 = 100;

/// Offers expire after this long when the facility config leaves it unset.
pub const DEFAULT_OFFER_EXPIRY_MINUTES: u32 = 30;

pub const MAX_FACILITIES: usize = 10_000;
