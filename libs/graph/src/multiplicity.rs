//! Port connection cardinality and its validator.

/// How many links a port may legally carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Multiplicity {
    /// Zero or more links.
    Any,
    /// At most one link.
    ZeroOrOne,
    /// Exactly one link.
    ExactlyOne,
    /// At least one link.
    OneOrMore,
    /// No links allowed (e.g. event ports, which are wired dynamically).
    Zero,
}

/// Checks whether `link_count` is legal for a port declared with
/// `multiplicity`.
///
/// Pure and total. Invoked at graph-build time to compute each port's
/// validity flag, and again whenever a link set changes. An invalid
/// result is a wiring diagnostic, never a runtime error.
pub fn is_valid(multiplicity: Multiplicity, link_count: usize) -> bool {
    match multiplicity {
        Multiplicity::Any => true,
        Multiplicity::ZeroOrOne => link_count < 2,
        Multiplicity::ExactlyOne => link_count == 1,
        Multiplicity::OneOrMore => link_count > 0,
        Multiplicity::Zero => link_count == 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exactly_one_accepts_only_one() {
        assert!(!is_valid(Multiplicity::ExactlyOne, 0));
        assert!(is_valid(Multiplicity::ExactlyOne, 1));
        assert!(!is_valid(Multiplicity::ExactlyOne, 2));
    }

    #[test]
    fn zero_accepts_only_zero() {
        assert!(is_valid(Multiplicity::Zero, 0));
        assert!(!is_valid(Multiplicity::Zero, 1));
    }

    proptest! {
        #[test]
        fn any_accepts_everything(count in 0usize..1000) {
            prop_assert!(is_valid(Multiplicity::Any, count));
        }

        #[test]
        fn zero_or_one_accepts_below_two(count in 0usize..1000) {
            prop_assert_eq!(is_valid(Multiplicity::ZeroOrOne, count), count < 2);
        }

        #[test]
        fn one_or_more_rejects_only_zero(count in 0usize..1000) {
            prop_assert_eq!(is_valid(Multiplicity::OneOrMore, count), count > 0);
        }
    }
}
