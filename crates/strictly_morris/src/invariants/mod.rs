//! Board invariants checked after every applied move.
//!
//! Each invariant is a zero-sized type; tuples of them form an
//! [`InvariantSet`] that reports every failure at once.

mod distinct_cells;
mod phase_consistent;
mod piece_limit;

pub use distinct_cells::DistinctCellsInvariant;
pub use phase_consistent::PhaseConsistentInvariant;
pub use piece_limit::PieceLimitInvariant;

/// A property of `S` that every reachable state satisfies.
pub trait Invariant<S> {
    /// True if `state` satisfies the property.
    fn holds(state: &S) -> bool;

    /// One-line statement of the property.
    fn description() -> &'static str;
}

/// A failed invariant.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{}", description)]
pub struct InvariantViolation {
    /// Statement of the property that failed.
    pub description: String,
}

impl InvariantViolation {
    fn of<S, I: Invariant<S>>() -> Self {
        Self {
            description: I::description().to_string(),
        }
    }
}

/// Several invariants checked as one.
pub trait InvariantSet<S> {
    /// Checks every member and returns all violations, in member order.
    fn check_all(state: &S) -> Result<(), Vec<InvariantViolation>>;
}

macro_rules! invariant_tuple {
    ($($member:ident),+) => {
        impl<S, $($member: Invariant<S>),+> InvariantSet<S> for ($($member,)+) {
            fn check_all(state: &S) -> Result<(), Vec<InvariantViolation>> {
                let mut violations = Vec::new();
                $(
                    if !$member::holds(state) {
                        violations.push(InvariantViolation::of::<S, $member>());
                    }
                )+
                if violations.is_empty() {
                    Ok(())
                } else {
                    Err(violations)
                }
            }
        }
    };
}

invariant_tuple!(A, B);
invariant_tuple!(A, B, C);

/// Everything [`crate::Game`] guarantees between moves.
pub type MorrisInvariants = (
    PieceLimitInvariant,
    DistinctCellsInvariant,
    PhaseConsistentInvariant,
);
