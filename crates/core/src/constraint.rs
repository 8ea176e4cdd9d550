//! Connection constraint validation.
//!
//! The source of truth for whether a proposed connection may exist. The
//! validator is a pure function over explicit inputs (the candidate edge,
//! its connection-span, the type's policy, and the existing connections
//! sharing the (subject, object, type) triple), so it can be unit-tested
//! without a database and safely re-run after a transaction retry.
//! [`crate::SpanGraph`] calls it inside the write transaction that will
//! persist the candidate, which serialises the check against concurrent
//! writers on the same triple.

use crate::date::{DateBound, Edge};
use crate::{
    Connection, ConnectionId, ConnectionType, ConstraintKind, EndpointRole, Span, SpanKind,
    SpanState, TidemarkError,
};

/// A policy rejection, naming the existing connection it conflicts with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstraintViolation {
    /// An edge with the identical (subject, object, type) triple already
    /// exists and the type does not admit recurrence.
    #[error("duplicate connection; conflicts with {existing}")]
    Duplicate { existing: ConnectionId },
    /// The type allows a single edge per (subject, object) pair.
    #[error("connection type allows a single edge per pair; conflicts with {existing}")]
    SingleExists { existing: ConnectionId },
    /// The candidate's validity interval intersects an existing edge of
    /// the same triple.
    #[error("validity interval overlaps connection {existing}")]
    Overlap { existing: ConnectionId },
}

/// Validate a candidate connection against its type's policy.
///
/// `existing` is every connection sharing the candidate's
/// (subject, object, type) triple, paired with its connection-span. The
/// candidate itself may appear in `existing` (the update path re-validates
/// in place); it is excluded by id. Spans of other triples are the caller's
/// responsibility to pre-filter, but a mismatched entry is skipped rather
/// than trusted.
///
/// Checks, in order:
/// 1. the connection-span's own date invariants; for a `Placeholder`
///    span only the component hierarchy applies, though start > end is
///    still rejected when both years are present;
/// 2. endpoint kinds against the type's allow-lists;
/// 3. the type's temporal policy:
///    - `Timeless`: no temporal check, but the triple must not recur;
///    - `Single`: the triple must not recur;
///    - `NonOverlapping`: expanded validity intervals of the triple's
///      edges must be pairwise disjoint. An absent end date is an open
///      interval (unbounded above). Skipped entirely while the candidate
///      span is a `Placeholder`: unknown dates cannot be checked for
///      overlap.
///
/// Accepting is returning `Ok(())`; the function performs no writes, so
/// re-validating an accepted candidate against unchanged state accepts
/// again.
pub fn validate_connection(
    candidate: &Connection,
    candidate_span: &Span,
    subject_kind: SpanKind,
    object_kind: SpanKind,
    ctype: &ConnectionType,
    existing: &[(Connection, Span)],
) -> Result<(), TidemarkError> {
    candidate_span.validate()?;

    if !ctype.allows_subject(subject_kind) {
        return Err(TidemarkError::DisallowedEndpointType {
            connection_type: ctype.id.clone(),
            role: EndpointRole::Subject,
            kind: subject_kind,
        });
    }
    if !ctype.allows_object(object_kind) {
        return Err(TidemarkError::DisallowedEndpointType {
            connection_type: ctype.id.clone(),
            role: EndpointRole::Object,
            kind: object_kind,
        });
    }

    let mut peers = existing.iter().filter(|(conn, _)| {
        conn.id != candidate.id
            && conn.subject_id == candidate.subject_id
            && conn.object_id == candidate.object_id
            && conn.type_id == candidate.type_id
    });

    match ctype.constraint {
        ConstraintKind::Timeless => {
            if let Some((conn, _)) = peers.next() {
                return Err(ConstraintViolation::Duplicate {
                    existing: conn.id.clone(),
                }
                .into());
            }
        }
        ConstraintKind::Single => {
            if let Some((conn, _)) = peers.next() {
                return Err(ConstraintViolation::SingleExists {
                    existing: conn.id.clone(),
                }
                .into());
            }
        }
        ConstraintKind::NonOverlapping => {
            if candidate_span.state == SpanState::Placeholder {
                return Ok(());
            }
            let Some(lo) = candidate_span.start.expand(Edge::Lower) else {
                return Ok(());
            };
            let hi = candidate_span.end.expand(Edge::Upper);
            for (conn, span) in peers {
                // A placeholder peer has no interval to conflict with.
                let Some(peer_lo) = span.start.expand(Edge::Lower) else {
                    continue;
                };
                let peer_hi = span.end.expand(Edge::Upper);
                if intersects((lo, hi), (peer_lo, peer_hi)) {
                    return Err(ConstraintViolation::Overlap {
                        existing: conn.id.clone(),
                    }
                    .into());
                }
            }
        }
    }

    Ok(())
}

/// Two intervals intersect unless one's upper bound strictly precedes the
/// other's lower bound. `None` upper bounds are open (ongoing) intervals.
fn intersects(a: (DateBound, Option<DateBound>), b: (DateBound, Option<DateBound>)) -> bool {
    let (a_lo, a_hi) = a;
    let (b_lo, b_hi) = b;
    let a_ends_first = matches!(a_hi, Some(h) if h < b_lo);
    let b_ends_first = matches!(b_hi, Some(h) if h < a_lo);
    !(a_ends_first || b_ends_first)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
