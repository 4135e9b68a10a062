//! Allen's interval algebra over half-open ranges.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::RangeError;
use crate::range::{Bound, ValidRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllenRelation {
    Precedes,
    Meets,
    Overlaps,
    Starts,
    During,
    Finishes,
    Equals,
    PrecededBy,
    MetBy,
    OverlappedBy,
    StartedBy,
    Contains,
    FinishedBy,
}

impl AllenRelation {
    pub const ALL: [AllenRelation; 13] = [
        Self::Precedes,
        Self::Meets,
        Self::Overlaps,
        Self::Starts,
        Self::During,
        Self::Finishes,
        Self::Equals,
        Self::PrecededBy,
        Self::MetBy,
        Self::OverlappedBy,
        Self::StartedBy,
        Self::Contains,
        Self::FinishedBy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Precedes => "precedes",
            Self::Meets => "meets",
            Self::Overlaps => "overlaps",
            Self::Starts => "starts",
            Self::During => "during",
            Self::Finishes => "finishes",
            Self::Equals => "equals",
            Self::PrecededBy => "preceded_by",
            Self::MetBy => "met_by",
            Self::OverlappedBy => "overlapped_by",
            Self::StartedBy => "started_by",
            Self::Contains => "contains",
            Self::FinishedBy => "finished_by",
        }
    }

    /// The relation seen from the other interval: `relation(b, a)`.
    pub fn inverse(&self) -> Self {
        match self {
            Self::Precedes => Self::PrecededBy,
            Self::Meets => Self::MetBy,
            Self::Overlaps => Self::OverlappedBy,
            Self::Starts => Self::StartedBy,
            Self::During => Self::Contains,
            Self::Finishes => Self::FinishedBy,
            Self::Equals => Self::Equals,
            Self::PrecededBy => Self::Precedes,
            Self::MetBy => Self::Meets,
            Self::OverlappedBy => Self::Overlaps,
            Self::StartedBy => Self::Starts,
            Self::Contains => Self::During,
            Self::FinishedBy => Self::Finishes,
        }
    }

    /// Relation of `[x_from, x_until)` to `[y_from, y_until)`.
    /// Fails if either interval is empty or reversed.
    pub fn between(
        x_from: &Bound,
        x_until: &Bound,
        y_from: &Bound,
        y_until: &Bound,
    ) -> Result<Self, RangeError> {
        let x = ValidRange::new(*x_from, *x_until)?;
        let y = ValidRange::new(*y_from, *y_until)?;
        Ok(relation(&x, &y))
    }
}

/// Relation of `x` to `y`. Total over non-empty ranges.
pub fn relation(x: &ValidRange, y: &ValidRange) -> AllenRelation {
    use AllenRelation::*;

    let (x_from, x_until) = (x.lower(), x.upper());
    let (y_from, y_until) = (y.lower(), y.upper());

    if x_until < y_from {
        return Precedes;
    }
    if x_until == y_from {
        return Meets;
    }
    if y_until < x_from {
        return PrecededBy;
    }
    if y_until == x_from {
        return MetBy;
    }
    // The intervals share at least one point from here on.
    match (x_from.cmp(y_from), x_until.cmp(y_until)) {
        (Ordering::Less, Ordering::Less) => Overlaps,
        (Ordering::Less, Ordering::Equal) => FinishedBy,
        (Ordering::Less, Ordering::Greater) => Contains,
        (Ordering::Equal, Ordering::Less) => Starts,
        (Ordering::Equal, Ordering::Equal) => Equals,
        (Ordering::Equal, Ordering::Greater) => StartedBy,
        (Ordering::Greater, Ordering::Less) => During,
        (Ordering::Greater, Ordering::Equal) => Finishes,
        (Ordering::Greater, Ordering::Greater) => OverlappedBy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn r(a: i64, b: i64) -> ValidRange {
        ValidRange::new(Bound::integer(a), Bound::integer(b)).unwrap()
    }

    #[test]
    fn documented_scenarios() {
        assert_eq!(relation(&r(10, 20), &r(30, 40)), AllenRelation::Precedes);
        assert_eq!(relation(&r(30, 40), &r(10, 20)), AllenRelation::PrecededBy);
        assert_eq!(relation(&r(10, 30), &r(20, 40)), AllenRelation::Overlaps);
        assert_eq!(relation(&r(20, 40), &r(10, 30)), AllenRelation::OverlappedBy);
    }

    #[test]
    fn each_relation_is_reachable() {
        let cases = [
            (r(1, 2), r(3, 4), AllenRelation::Precedes),
            (r(1, 3), r(3, 4), AllenRelation::Meets),
            (r(1, 3), r(2, 4), AllenRelation::Overlaps),
            (r(1, 2), r(1, 4), AllenRelation::Starts),
            (r(2, 3), r(1, 4), AllenRelation::During),
            (r(2, 4), r(1, 4), AllenRelation::Finishes),
            (r(1, 4), r(1, 4), AllenRelation::Equals),
            (r(3, 4), r(1, 2), AllenRelation::PrecededBy),
            (r(3, 4), r(1, 3), AllenRelation::MetBy),
            (r(2, 4), r(1, 3), AllenRelation::OverlappedBy),
            (r(1, 4), r(1, 2), AllenRelation::StartedBy),
            (r(1, 4), r(2, 3), AllenRelation::Contains),
            (r(1, 4), r(2, 4), AllenRelation::FinishedBy),
        ];
        for (x, y, expected) in cases {
            assert_eq!(relation(&x, &y), expected, "{x} vs {y}");
        }
    }

    #[test]
    fn meets_is_not_overlaps() {
        assert_eq!(relation(&r(1, 5), &r(5, 9)), AllenRelation::Meets);
        assert_eq!(relation(&r(1, 6), &r(5, 9)), AllenRelation::Overlaps);
    }

    #[test]
    fn infinite_bounds_are_outermost() {
        let all = ValidRange::new(Bound::NegInfinity, Bound::Infinity).unwrap();
        let open_end = ValidRange::new(Bound::integer(5), Bound::Infinity).unwrap();
        assert_eq!(relation(&r(1, 5), &all), AllenRelation::During);
        assert_eq!(relation(&open_end, &all), AllenRelation::Finishes);
        assert_eq!(relation(&r(5, 100), &open_end), AllenRelation::Starts);
    }

    #[test]
    fn between_rejects_empty_input() {
        let five = Bound::integer(5);
        assert!(AllenRelation::between(&five, &five, &five, &Bound::integer(6)).is_err());
        assert_eq!(
            AllenRelation::between(&Bound::integer(1), &five, &five, &Bound::integer(9)).unwrap(),
            AllenRelation::Meets
        );
    }

    #[test]
    fn inverse_is_an_involution() {
        for rel in AllenRelation::ALL {
            assert_eq!(rel.inverse().inverse(), rel);
        }
        assert_eq!(serde_json::to_value(AllenRelation::MetBy).unwrap(), "met_by");
    }

    proptest! {
        #[test]
        fn swapping_arguments_inverts(a in -50i64..50, la in 1i64..30, b in -50i64..50, lb in 1i64..30) {
            let x = r(a, a + la);
            let y = r(b, b + lb);
            prop_assert_eq!(relation(&y, &x), relation(&x, &y).inverse());
            prop_assert_eq!(relation(&x, &x), AllenRelation::Equals);
        }
    }
}
