use ulid::Ulid;

use crate::model::BoxId;

/// Typed failure of an engine operation. Every variant aborts the
/// enclosing transaction with zero partial mutation; `code()` is the
/// stable machine-readable form surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    BoxNotFound(BoxId),
    RegistrationNotFound(Ulid),
    WaitlistEntryNotFound(Ulid),
    /// The apartment has no active registration to switch away from.
    NoActiveRegistration(String),
    NoticeNotFound(Ulid),
    BoxOccupied(BoxId),
    /// The box is administratively held and the caller is not an admin.
    BoxReserved(BoxId),
    ApartmentHasRegistration {
        apartment_key: String,
        registration_id: Ulid,
    },
    /// The apartment already holds a box; re-registering needs an
    /// explicit switch confirmation. Carries the held box.
    SwitchRequired {
        existing_box: BoxId,
    },
    SameBox(BoxId),
    NotActive(Ulid),
    NotWaiting(Ulid),
    /// Joining the waitlist while boxes remain available.
    BoxesStillAvailable(usize),
    LimitExceeded(&'static str),
    /// Lock contention exhausted the operation's retries. Retry-safe:
    /// nothing was applied.
    Contended(&'static str),
    /// WAL/infrastructure failure. Retry-safe: nothing was applied.
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code for the calling layer.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::BoxNotFound(_)
            | EngineError::RegistrationNotFound(_)
            | EngineError::WaitlistEntryNotFound(_)
            | EngineError::NoActiveRegistration(_)
            | EngineError::NoticeNotFound(_) => "NOT_FOUND",
            EngineError::BoxOccupied(_) => "BOX_OCCUPIED",
            EngineError::BoxReserved(_) => "BOX_RESERVED",
            EngineError::ApartmentHasRegistration { .. } => "APARTMENT_HAS_REGISTRATION",
            EngineError::SwitchRequired { .. } => "SWITCH_REQUIRED",
            EngineError::SameBox(_) => "SAME_BOX",
            EngineError::NotActive(_) => "NOT_ACTIVE",
            EngineError::NotWaiting(_) => "NOT_WAITING",
            EngineError::BoxesStillAvailable(_) => "BOXES_STILL_AVAILABLE",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::Contended(_) => "TRANSIENT",
            EngineError::WalError(_) => "STORAGE",
        }
    }

    /// True for failures where retrying the whole operation is safe and
    /// sensible (infrastructure, not business rules).
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Contended(_) | EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::BoxNotFound(id) => write!(f, "box {id} not found"),
            EngineError::RegistrationNotFound(id) => write!(f, "registration {id} not found"),
            EngineError::WaitlistEntryNotFound(id) => write!(f, "waitlist entry {id} not found"),
            EngineError::NoActiveRegistration(key) => {
                write!(f, "no active registration for apartment {key}")
            }
            EngineError::NoticeNotFound(id) => write!(f, "notice {id} not found"),
            EngineError::BoxOccupied(id) => write!(f, "box {id} is already occupied"),
            EngineError::BoxReserved(id) => write!(f, "box {id} is reserved"),
            EngineError::ApartmentHasRegistration { apartment_key, .. } => {
                write!(f, "apartment {apartment_key} already has an active registration")
            }
            EngineError::SwitchRequired { existing_box } => {
                write!(f, "apartment already holds box {existing_box}; confirm the switch")
            }
            EngineError::SameBox(id) => write!(f, "new box must differ from current box {id}"),
            EngineError::NotActive(id) => write!(f, "registration {id} is not active"),
            EngineError::NotWaiting(id) => write!(f, "waitlist entry {id} is not waiting"),
            EngineError::BoxesStillAvailable(n) => {
                write!(f, "{n} boxes are still available; register instead")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Contended(op) => write!(f, "{op} contended; retry"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::BoxNotFound(3).code(), "NOT_FOUND");
        assert_eq!(EngineError::BoxOccupied(5).code(), "BOX_OCCUPIED");
        assert_eq!(
            EngineError::SwitchRequired { existing_box: 1 }.code(),
            "SWITCH_REQUIRED"
        );
        assert_eq!(EngineError::BoxesStillAvailable(4).code(), "BOXES_STILL_AVAILABLE");
        assert_eq!(EngineError::WalError("io".into()).code(), "STORAGE");
    }

    #[test]
    fn only_infrastructure_is_transient() {
        assert!(EngineError::WalError("io".into()).is_transient());
        assert!(!EngineError::BoxOccupied(1).is_transient());
        assert!(!EngineError::SwitchRequired { existing_box: 2 }.is_transient());
    }
}
