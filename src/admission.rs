//! Outcome of a reservation attempt.

use std::fmt;

/// Why a reservation was not admitted.
///
/// All variants mean the same thing to a caller: do not run the gated work
/// now. They are kept apart so logs can tell real contention from races.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    /// The limit for at least one window (or the concurrency limit) is used up.
    QuotaExceeded,
    /// A watched key changed before commit, so the quota could not be verified.
    TransactionAborted,
    /// The window counter expired underneath the increment.
    CounterExpired,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Rejection::QuotaExceeded => "quota exceeded",
            Rejection::TransactionAborted => "transaction aborted by a concurrent writer",
            Rejection::CounterExpired => "counter expired during the attempt",
        };
        f.write_str(reason)
    }
}

/// Result of a reservation: either the token proving the reservation, or
/// the reason it was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission<T> {
    /// The reservation holds; the token must be handed back on release.
    Admitted(T),
    /// Nothing is held.
    Rejected(Rejection),
}

impl<T> Admission<T> {
    /// Whether the reservation was granted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    /// The token, if admitted.
    pub fn admitted(self) -> Option<T> {
        match self {
            Admission::Admitted(token) => Some(token),
            Admission::Rejected(_) => None,
        }
    }

    /// The rejection reason, if refused.
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Admission::Admitted(_) => None,
            Admission::Rejected(rejection) => Some(*rejection),
        }
    }

    /// Transform the admitted token.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Admission<U> {
        match self {
            Admission::Admitted(token) => Admission::Admitted(f(token)),
            Admission::Rejected(rejection) => Admission::Rejected(rejection),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admitted_accessors() {
        let admission: Admission<u64> = Admission::Admitted(5);
        assert!(admission.is_admitted());
        assert_eq!(admission.rejection(), None);
        assert_eq!(admission.map(|v| v * 2).admitted(), Some(10));
    }

    #[test]
    fn test_rejected_accessors() {
        let admission: Admission<u64> = Admission::Rejected(Rejection::TransactionAborted);
        assert!(!admission.is_admitted());
        assert_eq!(admission.rejection(), Some(Rejection::TransactionAborted));
        assert_eq!(admission.admitted(), None);
    }

    #[test]
    fn test_rejection_display() {
        assert_eq!(Rejection::QuotaExceeded.to_string(), "quota exceeded");
    }
}
