// src/reconcile.rs

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const UNPAID_LEAVE: &str = "Other Unpaid Leave";
pub const COMPASSIONATE_LEAVE: &str = "Compassionate Leave (paid)";
pub const JURY_DUTY_LEAVE: &str = "Jury Duty";
pub const PERSONAL_LEAVE: &str = "Personal/Carer's Leave";
pub const ANNUAL_LEAVE: &str = "Annual Leave";

const ANNUAL_LEAVE_NEGATIVE_LIMIT: Decimal = dec!(-40);
const PERSONAL_LEAVE_NEGATIVE_LIMIT: Decimal = dec!(-16);

/// How far into the negative a leave type may be drawn before the remainder
/// becomes unpaid leave. Only annual and personal leave carry an allowance.
fn negative_balance_floor(leave_type: &str) -> Option<Decimal> {
    if leave_type.eq_ignore_ascii_case(ANNUAL_LEAVE) {
        Some(ANNUAL_LEAVE_NEGATIVE_LIMIT)
    } else if leave_type.eq_ignore_ascii_case(PERSONAL_LEAVE) {
        Some(PERSONAL_LEAVE_NEGATIVE_LIMIT)
    } else {
        None
    }
}

/// Leave types that must never be topped up from unpaid leave. A shortfall is
/// rejected outright instead.
pub fn rejects_unpaid_fallback(leave_type: &str) -> bool {
    leave_type.eq_ignore_ascii_case(COMPASSIONATE_LEAVE)
        || leave_type.eq_ignore_ascii_case(JURY_DUTY_LEAVE)
}

/// Usable balance before a request falls through to unpaid leave.
///
/// For types with a negative allowance the raw balance is remapped so the
/// headroom below zero counts as available:
///   - raw below the floor: the allowance is spent, nothing is available;
///   - raw positive: allowance plus the positive balance;
///   - raw negative but above the floor: whatever allowance remains.
pub fn effective_available_units(leave_type: &str, raw_balance: Decimal) -> Decimal {
    let Some(floor) = negative_balance_floor(leave_type) else {
        return raw_balance;
    };

    if raw_balance < floor {
        Decimal::ZERO
    } else if raw_balance > Decimal::ZERO {
        floor.abs() + raw_balance
    } else {
        (floor - raw_balance).abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveSplit {
    pub paid: Decimal,
    pub unpaid: Decimal,
}

/// Divides requested hours into a paid portion charged against the available
/// balance and an unpaid remainder. A request exactly equal to the available
/// balance is fully paid.
pub fn paid_unpaid_split(requested: Decimal, available: Decimal) -> LeaveSplit {
    if requested >= available {
        if available > Decimal::ZERO {
            LeaveSplit {
                paid: available,
                unpaid: requested - available,
            }
        } else {
            LeaveSplit {
                paid: Decimal::ZERO,
                unpaid: requested,
            }
        }
    } else {
        LeaveSplit {
            paid: requested,
            unpaid: Decimal::ZERO,
        }
    }
}
