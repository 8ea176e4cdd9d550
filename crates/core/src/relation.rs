//! Temporal relation classification.
//!
//! Given a reference span, every other span is either before it, during
//! it, after it, or none of these. Classification always runs on
//! *expanded* interval bounds ([`crate::FlexDate::expand`]), so a span
//! known only as "1961" participates as [1961-01-01, 1961-12-31].
//!
//! The classifier is pure; [`crate::SpanGraph::related_spans`] composes it
//! with the access resolver so listings only contain spans the requesting
//! principal may view.

use std::str::FromStr;

use crate::date::Edge;
use crate::{Span, SpanKind, SpanState, TidemarkError, UserId};

/// How a candidate span sits relative to a reference span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalRelation {
    /// The candidate's interval ends before the reference begins.
    Before,
    /// The candidate's interval is contained in the reference's.
    During,
    /// The candidate's interval begins after the reference ends.
    After,
}

impl FromStr for TemporalRelation {
    type Err = TidemarkError;

    /// Parse a relation name. An unknown name is a programmer error, not a
    /// data condition; it is surfaced as
    /// [`TidemarkError::UnknownTemporalRelation`] and never retried.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before" => Ok(TemporalRelation::Before),
            "during" => Ok(TemporalRelation::During),
            "after" => Ok(TemporalRelation::After),
            other => Err(TidemarkError::UnknownTemporalRelation(other.to_string())),
        }
    }
}

impl std::fmt::Display for TemporalRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemporalRelation::Before => write!(f, "before"),
            TemporalRelation::During => write!(f, "during"),
            TemporalRelation::After => write!(f, "after"),
        }
    }
}

/// Does `candidate` stand in `relation` to `reference`?
///
/// Rules, with `[rlo, rhi]` the reference's expanded interval (`rhi`
/// absent when the reference is ongoing):
///
/// - `Before`: candidate's upper bound `< rlo`. An ongoing candidate has
///   no upper bound and never qualifies.
/// - `After`: candidate's lower bound `> rhi`. Nothing is after an
///   ongoing reference.
/// - `During`: candidate's lower bound `>= rlo` and upper bound `<= rhi`.
///   When the reference is ongoing, only candidates with a *known* end
///   qualify (their lower bound must still be `>= rlo`): an interval
///   with no upper bound cannot contain another open-ended one.
///
/// A span never stands in any relation to itself, and a span without a
/// start year has no interval and never classifies, in either position.
pub fn classify(reference: &Span, candidate: &Span, relation: TemporalRelation) -> bool {
    if candidate.id == reference.id {
        return false;
    }
    let Some(rlo) = reference.start.expand(Edge::Lower) else {
        return false;
    };
    let rhi = reference.end.expand(Edge::Upper);
    let Some(lo) = candidate.start.expand(Edge::Lower) else {
        return false;
    };
    let hi = candidate.end.expand(Edge::Upper);

    match relation {
        TemporalRelation::Before => matches!(hi, Some(h) if h < rlo),
        TemporalRelation::After => matches!(rhi, Some(rh) if lo > rh),
        TemporalRelation::During => {
            if lo < rlo {
                return false;
            }
            match rhi {
                Some(rh) => matches!(hi, Some(h) if h <= rh),
                None => hi.is_some(),
            }
        }
    }
}

/// Equality filters and pagination for span listings.
///
/// `Default` matches everything. Pagination applies after filtering and
/// ordering.
#[derive(Debug, Clone, Default)]
pub struct SpanFilter {
    pub kind: Option<SpanKind>,
    pub owner: Option<UserId>,
    pub state: Option<SpanState>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl SpanFilter {
    pub fn matches(&self, span: &Span) -> bool {
        if let Some(kind) = self.kind {
            if span.kind != kind {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if span.owner != *owner {
                return false;
            }
        }
        if let Some(state) = self.state {
            if span.state != state {
                return false;
            }
        }
        true
    }

    pub(crate) fn page(&self, spans: Vec<Span>) -> Vec<Span> {
        spans
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccessLevel, FlexDate, NewSpan};

    fn span(name: &str, start: FlexDate, end: FlexDate) -> Span {
        Span::from_new(NewSpan {
            kind: SpanKind::Event,
            name: name.to_string(),
            start,
            end,
            state: SpanState::Complete,
            access_level: AccessLevel::Public,
            owner: UserId::from("alice"),
            metadata: serde_json::Map::new(),
        })
    }

    #[test]
    fn relation_names_parse_and_unknown_is_an_error() {
        assert_eq!(
            "before".parse::<TemporalRelation>().unwrap(),
            TemporalRelation::Before
        );
        assert_eq!(
            "during".parse::<TemporalRelation>().unwrap(),
            TemporalRelation::During
        );
        assert_eq!(
            "after".parse::<TemporalRelation>().unwrap(),
            TemporalRelation::After
        );
        assert!(matches!(
            "overlapping".parse::<TemporalRelation>(),
            Err(TidemarkError::UnknownTemporalRelation(name)) if name == "overlapping"
        ));
    }

    #[test]
    fn before_requires_candidate_to_end_before_reference_starts() {
        let reference = span("war", FlexDate::year(1939), FlexDate::year(1945));
        let earlier = span("treaty", FlexDate::year(1919), FlexDate::year(1920));
        let touching = span("mobilisation", FlexDate::year(1938), FlexDate::year(1939));
        let ongoing = span("institution", FlexDate::year(1900), FlexDate::unknown());

        assert!(classify(&reference, &earlier, TemporalRelation::Before));
        // Ends within the reference's first year: upper bound 1939-12-31
        // is not < 1939-01-01.
        assert!(!classify(&reference, &touching, TemporalRelation::Before));
        assert!(!classify(&reference, &ongoing, TemporalRelation::Before));
    }

    #[test]
    fn after_requires_candidate_to_start_after_reference_ends() {
        let reference = span("war", FlexDate::year(1939), FlexDate::year(1945));
        let later = span("airlift", FlexDate::year(1948), FlexDate::year(1949));
        let within = span("raid", FlexDate::year(1944), FlexDate::year(1944));

        assert!(classify(&reference, &later, TemporalRelation::After));
        assert!(!classify(&reference, &within, TemporalRelation::After));
    }

    #[test]
    fn nothing_is_after_an_ongoing_reference() {
        let reference = span("era", FlexDate::year(1990), FlexDate::unknown());
        let later = span("summit", FlexDate::year(2020), FlexDate::year(2020));
        assert!(!classify(&reference, &later, TemporalRelation::After));
    }

    #[test]
    fn during_requires_containment_at_expanded_bounds() {
        let reference = span("war", FlexDate::year(1939), FlexDate::year(1945));
        let within = span("raid", FlexDate::month(1944, 6), FlexDate::month(1944, 6));
        let straddling = span("career", FlexDate::year(1930), FlexDate::year(1950));

        assert!(classify(&reference, &within, TemporalRelation::During));
        assert!(!classify(&reference, &straddling, TemporalRelation::During));
    }

    #[test]
    fn during_ongoing_reference_excludes_ongoing_candidates() {
        let reference = span("era", FlexDate::year(1990), FlexDate::unknown());
        let closed = span("project", FlexDate::year(1995), FlexDate::year(1998));
        let open = span("career", FlexDate::year(1995), FlexDate::unknown());
        let earlier = span("prelude", FlexDate::year(1980), FlexDate::year(1985));

        assert!(classify(&reference, &closed, TemporalRelation::During));
        assert!(!classify(&reference, &open, TemporalRelation::During));
        assert!(!classify(&reference, &earlier, TemporalRelation::During));
    }

    #[test]
    fn a_span_never_relates_to_itself() {
        let reference = span("war", FlexDate::year(1939), FlexDate::year(1945));
        assert!(!classify(&reference, &reference, TemporalRelation::During));
        assert!(!classify(&reference, &reference, TemporalRelation::Before));
        assert!(!classify(&reference, &reference, TemporalRelation::After));
    }

    #[test]
    fn dateless_spans_never_classify() {
        let reference = span("war", FlexDate::year(1939), FlexDate::year(1945));
        let dateless = span("mystery", FlexDate::unknown(), FlexDate::unknown());
        assert!(!classify(&reference, &dateless, TemporalRelation::Before));
        assert!(!classify(&reference, &dateless, TemporalRelation::During));
        assert!(!classify(&dateless, &reference, TemporalRelation::During));
    }

    #[test]
    fn filter_matches_on_kind_owner_state() {
        let s = span("event", FlexDate::year(2000), FlexDate::year(2001));
        assert!(SpanFilter::default().matches(&s));
        assert!(SpanFilter {
            kind: Some(SpanKind::Event),
            ..Default::default()
        }
        .matches(&s));
        assert!(!SpanFilter {
            kind: Some(SpanKind::Person),
            ..Default::default()
        }
        .matches(&s));
        assert!(!SpanFilter {
            owner: Some(UserId::from("bob")),
            ..Default::default()
        }
        .matches(&s));
        assert!(!SpanFilter {
            state: Some(SpanState::Draft),
            ..Default::default()
        }
        .matches(&s));
    }
}
