//! Set operations over collections of ranges: normalised multiranges,
//! gap-free coverage and overlap detection.

use crate::range::{cmp_by_lower, Bound, ValidRange};

/// A set of points stored as sorted, disjoint, non-adjacent ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multirange {
    spans: Vec<ValidRange>,
}

impl Multirange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> &[ValidRange] {
        &self.spans
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Add a range, merging it with every span it overlaps or touches.
    pub fn insert(&mut self, range: ValidRange) {
        let mut lower = *range.lower();
        let mut upper = *range.upper();
        let mut kept = Vec::with_capacity(self.spans.len() + 1);
        for span in self.spans.drain(..) {
            if *span.upper() < lower || upper < *span.lower() {
                kept.push(span);
            } else {
                lower = lower.min(*span.lower());
                upper = upper.max(*span.upper());
            }
        }
        if let Ok(merged) = ValidRange::new(lower, upper) {
            kept.push(merged);
        }
        kept.sort_by(cmp_by_lower);
        self.spans = kept;
    }

    pub fn union(&self, other: &Multirange) -> Multirange {
        let mut out = self.clone();
        for span in &other.spans {
            out.insert(*span);
        }
        out
    }

    /// True when every point of `range` is in the set.
    pub fn contains(&self, range: &ValidRange) -> bool {
        self.spans.iter().any(|s| s.contains(range))
    }

    pub fn overlaps(&self, range: &ValidRange) -> bool {
        self.spans.iter().any(|s| s.overlaps(range))
    }

    /// Remove every point of `range` from the set.
    pub fn subtract(&mut self, range: &ValidRange) {
        let mut kept = Vec::with_capacity(self.spans.len() + 1);
        for span in self.spans.drain(..) {
            if !span.overlaps(range) {
                kept.push(span);
                continue;
            }
            if let Ok(left) = ValidRange::new(*span.lower(), *range.lower()) {
                kept.push(left);
            }
            if let Ok(right) = ValidRange::new(*range.upper(), *span.upper()) {
                kept.push(right);
            }
        }
        self.spans = kept;
    }

    pub fn difference(&self, other: &Multirange) -> Multirange {
        let mut out = self.clone();
        for span in &other.spans {
            out.subtract(span);
        }
        out
    }
}

impl FromIterator<ValidRange> for Multirange {
    fn from_iter<I: IntoIterator<Item = ValidRange>>(iter: I) -> Self {
        let mut m = Multirange::new();
        for r in iter {
            m.insert(r);
        }
        m
    }
}

/// Do `ranges` jointly cover `target` with no gaps?
///
/// Walks the ranges in lower-bound order keeping the furthest point reached;
/// any range starting beyond that point leaves a hole.
pub fn covers_without_gaps<'a, I>(ranges: I, target: &ValidRange) -> bool
where
    I: IntoIterator<Item = &'a ValidRange>,
{
    let mut sorted: Vec<&ValidRange> = ranges.into_iter().collect();
    sorted.sort_by(|a, b| cmp_by_lower(a, b));

    let mut covered_to: Option<Bound> = None;
    for r in sorted {
        if *r.upper() <= *target.lower() {
            continue;
        }
        match covered_to {
            None => {
                if *r.lower() > *target.lower() {
                    return false;
                }
                covered_to = Some(*r.upper());
            }
            Some(reached) => {
                if *r.lower() > reached {
                    return false;
                }
                covered_to = Some(reached.max(*r.upper()));
            }
        }
        if covered_to.is_some_and(|c| c >= *target.upper()) {
            return true;
        }
    }
    false
}

/// First pair of overlapping ranges, in lower-bound order.
pub fn find_overlap<'a, I>(ranges: I) -> Option<(ValidRange, ValidRange)>
where
    I: IntoIterator<Item = &'a ValidRange>,
{
    let mut sorted: Vec<&ValidRange> = ranges.into_iter().collect();
    sorted.sort_by(|a, b| cmp_by_lower(a, b));
    let mut furthest: Option<&ValidRange> = None;
    for r in sorted {
        if let Some(prev) = furthest {
            if prev.overlaps(r) {
                return Some((*prev, *r));
            }
            if r.upper() > prev.upper() {
                furthest = Some(r);
            }
        } else {
            furthest = Some(r);
        }
    }
    None
}
