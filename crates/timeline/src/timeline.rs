//! High-level timeline API built on Tidemark.
//!
//! [`Timeline`] wraps the generic [`SpanGraph`] engine with the
//! vocabulary a biographical or historical application actually speaks:
//! people, places, organisations, events, and a catalogue of everyday
//! connection types (employment, residence, family, ...) seeded on first
//! open. The core stays domain-agnostic; the opinions live here.
//!
//! # Usage
//!
//! ```rust,no_run
//! use tidemark_timeline::Timeline;
//! use tidemark::{FlexDate, Principal};
//!
//! let timeline = Timeline::open("./my-world.tidemark").unwrap();
//! let alice = Principal::user("alice");
//!
//! let ada = timeline
//!     .add_person("alice", "Ada Lovelace", FlexDate::day(1815, 12, 10))
//!     .unwrap();
//! let babbage = timeline
//!     .add_person("alice", "Charles Babbage", FlexDate::year(1791))
//!     .unwrap();
//!
//! // A friendship edge; dates unknown, so it starts as a placeholder.
//! timeline
//!     .connect(&alice, &babbage, "friendship", &ada, FlexDate::unknown(), FlexDate::unknown())
//!     .unwrap();
//!
//! // Everything that happened during Ada's lifetime, access-filtered.
//! let events = timeline.during(&ada, Some(&alice)).unwrap();
//! ```

use tidemark::{NewConnection, NewSpan, SpanFilter, SpanUpdate};

// The vocabulary callers need alongside this API.
pub use tidemark::{
    AccessLevel, Connection, ConnectionId, ConnectionType, ConstraintKind, FlexDate, GroupId,
    Permission, Precision, Principal, Span, SpanGraph, SpanId, SpanKind, SpanState,
    TemporalRelation, UserId,
};
pub use tidemark::TidemarkError as Error;
pub type Result<T> = std::result::Result<T, Error>;

/// The connection types a fresh timeline is seeded with.
///
/// | type          | constraint      | subject | object |
/// |---------------|-----------------|---------|--------|
/// | family        | single          | person  | person |
/// | friendship    | timeless        | person  | person |
/// | employment    | non-overlapping | person  | thing  |
/// | education     | non-overlapping | person  | thing  |
/// | residence     | non-overlapping | person  | place  |
/// | membership    | non-overlapping | person  | set    |
/// | participation | timeless        | person  | event  |
/// | created       | single          | person  | thing  |
/// | has_role      | non-overlapping | person  | role   |
pub fn default_connection_types() -> Vec<ConnectionType> {
    use SpanKind::{Event, Person, Place, Role, Set, Thing};
    vec![
        ConnectionType::new("family", ConstraintKind::Single, vec![Person], vec![Person]),
        ConnectionType::new(
            "friendship",
            ConstraintKind::Timeless,
            vec![Person],
            vec![Person],
        ),
        ConnectionType::new(
            "employment",
            ConstraintKind::NonOverlapping,
            vec![Person],
            vec![Thing],
        ),
        ConnectionType::new(
            "education",
            ConstraintKind::NonOverlapping,
            vec![Person],
            vec![Thing],
        ),
        ConnectionType::new(
            "residence",
            ConstraintKind::NonOverlapping,
            vec![Person],
            vec![Place],
        ),
        ConnectionType::new(
            "membership",
            ConstraintKind::NonOverlapping,
            vec![Person],
            vec![Set],
        ),
        ConnectionType::new(
            "participation",
            ConstraintKind::Timeless,
            vec![Person],
            vec![Event],
        ),
        ConnectionType::new("created", ConstraintKind::Single, vec![Person], vec![Thing]),
        ConnectionType::new(
            "has_role",
            ConstraintKind::NonOverlapping,
            vec![Person],
            vec![Role],
        ),
    ]
}

/// A domain-flavoured wrapper around [`SpanGraph`].
///
/// This is the primary entry point for application developers. It wraps
/// the engine with constructors per span kind, date-or-placeholder
/// handling, and sharing helpers.
pub struct Timeline {
    graph: SpanGraph,
}

impl Timeline {
    /// Open or create a timeline at the given path, seeding the default
    /// connection-type catalogue on first open. Re-opening an existing
    /// file is a no-op for already-registered types.
    pub fn open(path: &str) -> Result<Self> {
        let timeline = Self {
            graph: SpanGraph::open(path)?,
        };
        timeline.seed_connection_types()?;
        Ok(timeline)
    }

    /// Create an in-memory timeline (no file I/O), seeded like [`open`].
    ///
    /// [`open`]: Timeline::open
    pub fn open_in_memory() -> Result<Self> {
        let timeline = Self {
            graph: SpanGraph::open_in_memory()?,
        };
        timeline.seed_connection_types()?;
        Ok(timeline)
    }

    fn seed_connection_types(&self) -> Result<()> {
        for ctype in default_connection_types() {
            match self.graph.register_connection_type(ctype) {
                Ok(()) => {}
                // Already seeded by a previous open.
                Err(Error::ConnectionTypeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// The underlying engine, for operations this wrapper does not cover.
    pub fn graph(&self) -> &SpanGraph {
        &self.graph
    }

    // -- constructors -------------------------------------------------------

    /// Add a person. An unknown birth date creates a placeholder; the
    /// person can be dated later without losing their connections.
    pub fn add_person(
        &self,
        owner: impl Into<UserId>,
        name: impl Into<String>,
        born: FlexDate,
    ) -> Result<SpanId> {
        self.add_dated(SpanKind::Person, owner, name, born, FlexDate::unknown())
    }

    /// Add a place. Dates are optional the same way as [`add_person`].
    ///
    /// [`add_person`]: Timeline::add_person
    pub fn add_place(
        &self,
        owner: impl Into<UserId>,
        name: impl Into<String>,
        since: FlexDate,
    ) -> Result<SpanId> {
        self.add_dated(SpanKind::Place, owner, name, since, FlexDate::unknown())
    }

    /// Add an organisation, institution, or other thing.
    pub fn add_organisation(
        &self,
        owner: impl Into<UserId>,
        name: impl Into<String>,
        founded: FlexDate,
    ) -> Result<SpanId> {
        self.add_dated(SpanKind::Thing, owner, name, founded, FlexDate::unknown())
    }

    /// Add an event with an explicit interval. An unknown end means the
    /// event is ongoing.
    pub fn add_event(
        &self,
        owner: impl Into<UserId>,
        name: impl Into<String>,
        start: FlexDate,
        end: FlexDate,
    ) -> Result<SpanId> {
        self.add_dated(SpanKind::Event, owner, name, start, end)
    }

    /// Add a role: a timeless kind, never required to carry dates.
    pub fn add_role(&self, owner: impl Into<UserId>, name: impl Into<String>) -> Result<SpanId> {
        self.graph
            .create_span(NewSpan::new(SpanKind::Role, name, owner))
    }

    /// Add a set: a timeless grouping kind (a band, a committee, a
    /// dynasty).
    pub fn add_set(&self, owner: impl Into<UserId>, name: impl Into<String>) -> Result<SpanId> {
        self.graph
            .create_span(NewSpan::new(SpanKind::Set, name, owner))
    }

    /// Add a placeholder of any kind: an entity known to exist whose
    /// dates are not known at all yet.
    pub fn add_placeholder(
        &self,
        owner: impl Into<UserId>,
        kind: SpanKind,
        name: impl Into<String>,
    ) -> Result<SpanId> {
        self.graph
            .create_span(NewSpan::new(kind, name, owner).in_state(SpanState::Placeholder))
    }

    fn add_dated(
        &self,
        kind: SpanKind,
        owner: impl Into<UserId>,
        name: impl Into<String>,
        start: FlexDate,
        end: FlexDate,
    ) -> Result<SpanId> {
        let state = if start.is_unknown() {
            SpanState::Placeholder
        } else {
            SpanState::Complete
        };
        self.graph.create_span(
            NewSpan::new(kind, name, owner)
                .starting(start)
                .ending(end)
                .in_state(state),
        )
    }

    // -- connections --------------------------------------------------------

    /// Connect two spans with a typed, dated edge.
    ///
    /// Fully unknown dates create a placeholder edge: it passes the
    /// type's temporal checks until it is dated via
    /// [`SpanGraph::update_connection_span`], at which point validation
    /// re-runs.
    pub fn connect(
        &self,
        principal: &Principal,
        subject: &SpanId,
        type_id: &str,
        object: &SpanId,
        start: FlexDate,
        end: FlexDate,
    ) -> Result<ConnectionId> {
        let mut new = NewConnection::new(subject.clone(), type_id, object.clone());
        if start.is_unknown() && end.is_unknown() {
            new = new.as_placeholder();
        } else {
            new = new.spanning(start, end);
        }
        self.graph.create_connection(new, Some(principal))
    }

    /// Every connection a span participates in, visible to the principal.
    pub fn connections_of(
        &self,
        span: &SpanId,
        principal: Option<&Principal>,
    ) -> Result<Vec<(Connection, Span)>> {
        self.graph.connections_of(span, principal)
    }

    // -- sharing ------------------------------------------------------------

    /// Grant a user view or edit on a span.
    pub fn share_with(
        &self,
        principal: &Principal,
        span: &SpanId,
        user: impl Into<UserId>,
        permission: Permission,
    ) -> Result<()> {
        self.graph
            .grant_permission(span, user, permission, Some(principal))?;
        Ok(())
    }

    /// Grant a whole group view or edit on a span.
    pub fn share_with_group(
        &self,
        principal: &Principal,
        span: &SpanId,
        group: &GroupId,
        permission: Permission,
    ) -> Result<()> {
        self.graph
            .grant_group_permission(span, group.clone(), permission, Some(principal))?;
        Ok(())
    }

    /// Make a span world-viewable.
    pub fn make_public(&self, principal: &Principal, span: &SpanId) -> Result<()> {
        self.graph.update_span(
            span,
            Some(principal),
            SpanUpdate {
                access_level: Some(AccessLevel::Public),
                ..Default::default()
            },
        )
    }

    // -- metadata -----------------------------------------------------------

    /// Set one metadata key on a span. Requires `Edit`.
    pub fn set_metadata(
        &self,
        principal: &Principal,
        span: &SpanId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        let current = self.graph.span(span, Some(principal))?;
        let mut metadata = current.metadata;
        metadata.insert(key.into(), value);
        self.graph.update_span(
            span,
            Some(principal),
            SpanUpdate {
                metadata: Some(metadata),
                ..Default::default()
            },
        )
    }

    // -- temporal queries ---------------------------------------------------

    /// Spans that ended before `reference` began.
    pub fn before(&self, reference: &SpanId, principal: Option<&Principal>) -> Result<Vec<Span>> {
        self.related(reference, TemporalRelation::Before, principal)
    }

    /// Spans contained in `reference`'s interval.
    pub fn during(&self, reference: &SpanId, principal: Option<&Principal>) -> Result<Vec<Span>> {
        self.related(reference, TemporalRelation::During, principal)
    }

    /// Spans that began after `reference` ended.
    pub fn after(&self, reference: &SpanId, principal: Option<&Principal>) -> Result<Vec<Span>> {
        self.related(reference, TemporalRelation::After, principal)
    }

    fn related(
        &self,
        reference: &SpanId,
        relation: TemporalRelation,
        principal: Option<&Principal>,
    ) -> Result<Vec<Span>> {
        self.graph
            .related_spans(reference, relation, &SpanFilter::default(), principal)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_temp_timeline() -> (Timeline, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let timeline = Timeline::open(&path).unwrap();
        (timeline, file)
    }

    #[test]
    fn open_seeds_default_connection_types_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("seed-reopen.tidemark");
        let path_str = path.to_str().unwrap();

        let expected = default_connection_types().len();
        {
            let timeline = Timeline::open(path_str).unwrap();
            assert_eq!(timeline.graph().connection_types().unwrap().len(), expected);
        }
        // Re-opening must not fail on, or duplicate, existing types.
        let timeline = Timeline::open(path_str).unwrap();
        assert_eq!(timeline.graph().connection_types().unwrap().len(), expected);
    }

    #[test]
    fn undated_person_becomes_a_placeholder() {
        let (timeline, _tmp) = open_temp_timeline();
        let alice = Principal::user("alice");

        let id = timeline
            .add_person("alice", "Somebody", FlexDate::unknown())
            .unwrap();
        let span = timeline.graph().span(&id, Some(&alice)).unwrap();
        assert_eq!(span.state, SpanState::Placeholder);

        let dated = timeline
            .add_person("alice", "Ada Lovelace", FlexDate::year(1815))
            .unwrap();
        let span = timeline.graph().span(&dated, Some(&alice)).unwrap();
        assert_eq!(span.state, SpanState::Complete);

        let explicit = timeline
            .add_placeholder("alice", SpanKind::Event, "the lost expedition")
            .unwrap();
        let span = timeline.graph().span(&explicit, Some(&alice)).unwrap();
        assert_eq!(span.state, SpanState::Placeholder);
        assert_eq!(span.kind, SpanKind::Event);
    }

    #[test]
    fn employment_stints_must_not_overlap() {
        let (timeline, _tmp) = open_temp_timeline();
        let alice = Principal::user("alice");

        let ada = timeline
            .add_person("alice", "Ada", FlexDate::year(1815))
            .unwrap();
        let acme = timeline
            .add_organisation("alice", "Acme", FlexDate::year(1990))
            .unwrap();

        timeline
            .connect(
                &alice,
                &ada,
                "employment",
                &acme,
                FlexDate::year(2000),
                FlexDate::year(2005),
            )
            .unwrap();

        let err = timeline
            .connect(
                &alice,
                &ada,
                "employment",
                &acme,
                FlexDate::year(2003),
                FlexDate::year(2008),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));

        timeline
            .connect(
                &alice,
                &ada,
                "employment",
                &acme,
                FlexDate::year(2006),
                FlexDate::year(2010),
            )
            .unwrap();
        assert_eq!(timeline.connections_of(&ada, Some(&alice)).unwrap().len(), 2);
    }

    #[test]
    fn undated_connection_is_a_placeholder_edge() {
        let (timeline, _tmp) = open_temp_timeline();
        let alice = Principal::user("alice");

        let ada = timeline
            .add_person("alice", "Ada", FlexDate::year(1815))
            .unwrap();
        let acme = timeline
            .add_organisation("alice", "Acme", FlexDate::year(1990))
            .unwrap();

        timeline
            .connect(
                &alice,
                &ada,
                "employment",
                &acme,
                FlexDate::year(2000),
                FlexDate::year(2005),
            )
            .unwrap();

        // Unknown dates: accepted despite the existing edge on the triple.
        let placeholder = timeline
            .connect(
                &alice,
                &ada,
                "employment",
                &acme,
                FlexDate::unknown(),
                FlexDate::unknown(),
            )
            .unwrap();
        let (_, span) = timeline.graph().connection(&placeholder, Some(&alice)).unwrap();
        assert_eq!(span.state, SpanState::Placeholder);
    }

    #[test]
    fn family_is_single_per_pair() {
        let (timeline, _tmp) = open_temp_timeline();
        let alice = Principal::user("alice");

        let parent = timeline
            .add_person("alice", "Annabella", FlexDate::year(1792))
            .unwrap();
        let child = timeline
            .add_person("alice", "Ada", FlexDate::year(1815))
            .unwrap();

        timeline
            .connect(
                &alice,
                &parent,
                "family",
                &child,
                FlexDate::year(1815),
                FlexDate::unknown(),
            )
            .unwrap();
        let err = timeline
            .connect(
                &alice,
                &parent,
                "family",
                &child,
                FlexDate::year(1820),
                FlexDate::unknown(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
    }

    #[test]
    fn endpoint_kinds_follow_the_catalogue() {
        let (timeline, _tmp) = open_temp_timeline();
        let alice = Principal::user("alice");

        let ada = timeline
            .add_person("alice", "Ada", FlexDate::year(1815))
            .unwrap();
        let london = timeline
            .add_place("alice", "London", FlexDate::unknown())
            .unwrap();

        // employment requires a Thing object, not a Place.
        let err = timeline
            .connect(
                &alice,
                &ada,
                "employment",
                &london,
                FlexDate::year(1840),
                FlexDate::year(1842),
            )
            .unwrap_err();
        assert!(matches!(err, Error::DisallowedEndpointType { .. }));

        // residence is the right type for that pair.
        timeline
            .connect(
                &alice,
                &ada,
                "residence",
                &london,
                FlexDate::year(1840),
                FlexDate::year(1842),
            )
            .unwrap();
    }

    #[test]
    fn sharing_and_group_sharing() {
        let (timeline, _tmp) = open_temp_timeline();
        let alice = Principal::user("alice");
        let bob = Principal::user("bob");

        let ada = timeline
            .add_person("alice", "Ada", FlexDate::year(1815))
            .unwrap();

        // Invisible until shared.
        assert!(timeline.graph().span(&ada, Some(&bob)).is_err());
        timeline
            .share_with(&alice, &ada, "bob", Permission::View)
            .unwrap();
        assert!(timeline.graph().span(&ada, Some(&bob)).is_ok());
        assert!(!timeline
            .graph()
            .resolve_permission(Some(&bob), &ada, Permission::Edit)
            .unwrap());

        // Group path.
        let carol = Principal::user("carol");
        let historians = timeline.graph().create_group("historians", &alice).unwrap();
        timeline
            .graph()
            .add_group_member(&historians, "carol", &alice)
            .unwrap();
        timeline
            .share_with_group(&alice, &ada, &historians, Permission::View)
            .unwrap();
        assert!(timeline
            .graph()
            .resolve_permission(Some(&carol), &ada, Permission::View)
            .unwrap());
    }

    #[test]
    fn make_public_opens_guest_view() {
        let (timeline, _tmp) = open_temp_timeline();
        let alice = Principal::user("alice");

        let ada = timeline
            .add_person("alice", "Ada", FlexDate::year(1815))
            .unwrap();
        assert!(timeline.graph().span(&ada, None).is_err());

        timeline.make_public(&alice, &ada).unwrap();
        assert!(timeline.graph().span(&ada, None).is_ok());
    }

    #[test]
    fn metadata_round_trips() {
        let (timeline, _tmp) = open_temp_timeline();
        let alice = Principal::user("alice");

        let ada = timeline
            .add_person("alice", "Ada", FlexDate::year(1815))
            .unwrap();
        timeline
            .set_metadata(&alice, &ada, "occupation", "mathematician".into())
            .unwrap();

        let span = timeline.graph().span(&ada, Some(&alice)).unwrap();
        assert_eq!(
            span.metadata.get("occupation").and_then(|v| v.as_str()),
            Some("mathematician")
        );
    }

    #[test]
    fn lifetime_queries_compose_relations_and_access() {
        let (timeline, _tmp) = open_temp_timeline();
        let alice = Principal::user("alice");

        let ada = timeline
            .add_person("alice", "Ada", FlexDate::year(1815))
            .unwrap();
        // Close the lifetime so `during` has an upper bound.
        timeline
            .graph()
            .update_span(
                &ada,
                Some(&alice),
                tidemark::SpanUpdate {
                    end: Some(FlexDate::year(1852)),
                    ..Default::default()
                },
            )
            .unwrap();

        timeline
            .add_event(
                "alice",
                "publication of the Notes",
                FlexDate::year(1843),
                FlexDate::year(1843),
            )
            .unwrap();
        timeline
            .add_event(
                "alice",
                "congress of Vienna",
                FlexDate::year(1814),
                FlexDate::year(1815),
            )
            .unwrap();

        let during = timeline.during(&ada, Some(&alice)).unwrap();
        assert_eq!(during.len(), 1);
        assert_eq!(during[0].name, "publication of the Notes");

        let before = timeline.before(&ada, Some(&alice)).unwrap();
        assert!(before.is_empty(), "congress overlaps Ada's birth year");
    }
}
