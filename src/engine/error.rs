use ulid::Ulid;

use crate::locks::LockStoreError;
use crate::model::{BookingStatus, Ms, TenantId};
use crate::tenant::Locale;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("row belongs to tenant {given}, not {ambient}")]
    TenantMismatch { ambient: TenantId, given: TenantId },
    #[error("invalid availability rule: {0}")]
    InvalidRule(&'static str),
    #[error("invalid span [{start}, {end})")]
    InvalidSpan { start: Ms, end: Ms },
    #[error("cannot move booking from {} to {}", from.as_str(), to.as_str())]
    IllegalTransition { from: BookingStatus, to: BookingStatus },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

/// Failure taxonomy shown to students. `NoAvailability` is an empty slot list,
/// never an error value, but it still has a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    NoAvailability,
    SlotNoLongerAvailable,
    InsufficientCredits,
    ConflictingBooking,
    PersistenceFailure,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::NoAvailability => "no_availability",
            FailureKind::SlotNoLongerAvailable => "slot_no_longer_available",
            FailureKind::InsufficientCredits => "insufficient_credits",
            FailureKind::ConflictingBooking => "conflicting_booking",
            FailureKind::PersistenceFailure => "persistence_failure",
        }
    }

    pub fn user_message(&self, locale: Locale) -> &'static str {
        match (self, locale) {
            (FailureKind::NoAvailability, Locale::En) => "No slots available for this day.",
            (FailureKind::NoAvailability, Locale::Es) => "No hay horarios disponibles para este día.",
            (FailureKind::SlotNoLongerAvailable, Locale::En) => {
                "This slot was just taken by another student."
            }
            (FailureKind::SlotNoLongerAvailable, Locale::Es) => {
                "Este horario acaba de ser reservado por otro alumno."
            }
            (FailureKind::InsufficientCredits, Locale::En) => "Insufficient credits.",
            (FailureKind::InsufficientCredits, Locale::Es) => "Créditos insuficientes.",
            (FailureKind::ConflictingBooking, Locale::En) => {
                "This slot conflicts with an existing booking."
            }
            (FailureKind::ConflictingBooking, Locale::Es) => {
                "Este horario coincide con una reserva existente."
            }
            (FailureKind::PersistenceFailure, Locale::En) => {
                "The booking could not be completed. Please try again."
            }
            (FailureKind::PersistenceFailure, Locale::Es) => {
                "No se pudo completar la reserva. Inténtalo de nuevo."
            }
        }
    }
}

/// Outcome of a failed confirm. Nothing was written when this is returned.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("slot no longer available")]
    SlotNoLongerAvailable,
    #[error("insufficient credits: balance {balance}, cost {cost}")]
    InsufficientCredits { balance: u32, cost: u32 },
    #[error("conflicts with booking {0}")]
    ConflictingBooking(Ulid),
    /// Internal detail for logs only; students see the generic message.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl BookingError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BookingError::SlotNoLongerAvailable => FailureKind::SlotNoLongerAvailable,
            BookingError::InsufficientCredits { .. } => FailureKind::InsufficientCredits,
            BookingError::ConflictingBooking(_) => FailureKind::ConflictingBooking,
            BookingError::PersistenceFailure(_) => FailureKind::PersistenceFailure,
        }
    }

    /// Business rejections leave the student's selection (and its lock) in place.
    pub fn keeps_selection(&self) -> bool {
        !matches!(self, BookingError::PersistenceFailure(_))
    }

    pub fn user_message(&self, locale: Locale) -> &'static str {
        self.kind().user_message(locale)
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            BookingError::SlotNoLongerAvailable => "55P03",
            BookingError::InsufficientCredits { .. } => "P0001",
            BookingError::ConflictingBooking(_) => "23P01",
            BookingError::PersistenceFailure(_) => "XX000",
        }
    }
}

impl From<EngineError> for BookingError {
    fn from(e: EngineError) -> Self {
        BookingError::PersistenceFailure(e.to_string())
    }
}

impl From<LockStoreError> for BookingError {
    fn from(e: LockStoreError) -> Self {
        BookingError::PersistenceFailure(e.to_string())
    }
}
