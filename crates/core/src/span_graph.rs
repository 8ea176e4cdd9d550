//! Tidemark — embedded temporal entity graph with access control.
//!
//! The core primitive is a [`Span`]: an entity (a person, a place, an
//! event, a thing) that exists over a time interval, dated with explicit
//! [`Precision`] (a date may be known only to the year, the month, or the
//! day). Spans are linked by [`Connection`]s: directed, typed edges whose
//! own temporal extent lives in an associated connection-span, validated
//! against the connection type's constraint policy (single edge,
//! non-overlapping intervals, or timeless). Every read and write passes
//! through a composable permission model: ownership, public visibility,
//! explicit per-user grants, and group-transitive grants, with edit
//! implying view.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tidemark::{
//!     ConnectionType, ConstraintKind, FlexDate, NewConnection, NewSpan, Principal, SpanGraph,
//!     SpanKind,
//! };
//!
//! let graph = SpanGraph::open("my-world.tidemark").unwrap();
//! let alice = Principal::user("alice");
//!
//! // Connection types are immutable reference data, registered once.
//! graph
//!     .register_connection_type(ConnectionType::new(
//!         "employment",
//!         ConstraintKind::NonOverlapping,
//!         vec![SpanKind::Person],
//!         vec![SpanKind::Thing],
//!     ))
//!     .unwrap();
//!
//! // Spans: entities that exist over time.
//! let person = graph
//!     .create_span(
//!         NewSpan::new(SpanKind::Person, "Douglas Adams", "alice")
//!             .starting(FlexDate::day(1952, 3, 11)),
//!     )
//!     .unwrap();
//! let employer = graph
//!     .create_span(NewSpan::new(SpanKind::Thing, "BBC Radio", "alice").starting(FlexDate::year(1922)))
//!     .unwrap();
//!
//! // A dated, typed edge between them; constraint-checked on insert.
//! graph
//!     .create_connection(
//!         NewConnection::new(person.clone(), "employment", employer)
//!             .spanning(FlexDate::year(1978), FlexDate::year(1980)),
//!         Some(&alice),
//!     )
//!     .unwrap();
//!
//! // What happened during this person's lifetime?
//! let during = graph
//!     .related_spans(&person, "during".parse().unwrap(), &Default::default(), Some(&alice))
//!     .unwrap();
//! ```

pub mod access;
pub mod constraint;
pub mod date;
pub mod relation;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use ulid::Ulid;

pub use access::{AccessLevel, GrantTarget, Group, Permission, PermissionGrant, Principal};
pub use constraint::ConstraintViolation;
pub use date::{cmp_shared_precision, DateBound, DateError, Edge, FlexDate, Precision};
pub use relation::{SpanFilter, TemporalRelation};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TidemarkError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Also the public face of a permission-denied point lookup: a denied
    /// read and a missing row are indistinguishable to the caller.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid date: {0}")]
    InvalidDate(#[from] DateError),
    #[error("unknown connection type: {0}")]
    UnknownConnectionType(String),
    #[error("connection type {0} is already registered")]
    ConnectionTypeExists(String),
    #[error("span kind {kind} is not allowed as the {role} of a {connection_type} connection")]
    DisallowedEndpointType {
        connection_type: String,
        role: EndpointRole,
        kind: SpanKind,
    },
    #[error("constraint violation: {0}")]
    Constraint(#[from] ConstraintViolation),
    #[error("permission denied")]
    PermissionDenied,
    #[error("unknown temporal relation: {0}")]
    UnknownTemporalRelation(String),
}

impl From<redb::DatabaseError> for TidemarkError {
    fn from(e: redb::DatabaseError) -> Self {
        TidemarkError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for TidemarkError {
    fn from(e: redb::TransactionError) -> Self {
        TidemarkError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for TidemarkError {
    fn from(e: redb::TableError) -> Self {
        TidemarkError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for TidemarkError {
    fn from(e: redb::StorageError) -> Self {
        TidemarkError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for TidemarkError {
    fn from(e: redb::CommitError) -> Self {
        TidemarkError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TidemarkError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Ulid::new().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

define_id! {
    /// A stable, time-sortable identifier for a [`Span`].
    SpanId
}
define_id! {
    /// A stable, time-sortable identifier for a [`Connection`].
    ConnectionId
}
define_id! {
    /// A user identity. Usually supplied by the embedding application's
    /// account system rather than generated here.
    UserId
}
define_id! {
    /// A stable identifier for a [`Group`].
    GroupId
}
define_id! {
    /// A stable identifier for a [`PermissionGrant`].
    GrantId
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// The kind of entity a [`Span`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Person,
    Place,
    Event,
    Thing,
    /// The span holding a [`Connection`]'s own temporal extent.
    Connection,
    Role,
    Set,
}

impl SpanKind {
    /// Kinds that exist outside calendar time; a start year is never
    /// required of them.
    pub fn is_timeless(self) -> bool {
        matches!(self, SpanKind::Role | SpanKind::Set)
    }
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SpanKind::Person => "person",
            SpanKind::Place => "place",
            SpanKind::Event => "event",
            SpanKind::Thing => "thing",
            SpanKind::Connection => "connection",
            SpanKind::Role => "role",
            SpanKind::Set => "set",
        };
        write!(f, "{name}")
    }
}

/// Editorial state of a [`Span`].
///
/// A `Placeholder` stands in for an entity whose dates are not yet known;
/// the start-year requirement and overlap validation are relaxed for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanState {
    Placeholder,
    Draft,
    Complete,
}

/// An entity that exists over a time interval (possibly open-ended or
/// unknown).
///
/// A span's own date range is distinct from the range of any connection it
/// participates in: a person born in 1952 may hold an `employment`
/// connection spanning 1978-1980.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Stable time-sortable ID.
    pub id: SpanId,
    pub kind: SpanKind,
    pub name: String,
    /// When the entity began. Precision-aware; see [`FlexDate`].
    pub start: FlexDate,
    /// When the entity ended. Fully unknown = ongoing.
    pub end: FlexDate,
    pub state: SpanState,
    pub access_level: AccessLevel,
    /// The owning user. Owners can view and edit unconditionally.
    pub owner: UserId,
    /// Free-form kind-scoped metadata. Not interpreted by the engine.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Span {
    pub(crate) fn from_new(new: NewSpan) -> Self {
        let now = Utc::now();
        Self {
            id: SpanId::new(),
            kind: new.kind,
            name: new.name,
            start: new.start,
            end: new.end,
            state: new.state,
            access_level: new.access_level,
            owner: new.owner,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the span's date invariants.
    ///
    /// Component hierarchy and calendar validity always apply. A start
    /// year is required unless the span is a `Placeholder` or its kind is
    /// timeless. When both years are present, the end must not precede the
    /// start at the finest jointly-specified precision, placeholders
    /// included.
    pub fn validate(&self) -> std::result::Result<(), DateError> {
        self.start.validate()?;
        self.end.validate()?;
        if self.start.year.is_none()
            && self.state != SpanState::Placeholder
            && !self.kind.is_timeless()
        {
            return Err(DateError::MissingStartYear);
        }
        if cmp_shared_precision(&self.start, &self.end) == Some(Ordering::Greater) {
            return Err(DateError::EndBeforeStart);
        }
        Ok(())
    }

    fn apply(&mut self, update: SpanUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(start) = update.start {
            self.start = start;
        }
        if let Some(end) = update.end {
            self.end = end;
        }
        if let Some(state) = update.state {
            self.state = state;
        }
        if let Some(level) = update.access_level {
            self.access_level = level;
        }
        if let Some(metadata) = update.metadata {
            self.metadata = metadata;
        }
    }
}

/// Specification for a span to be created.
#[derive(Debug, Clone)]
pub struct NewSpan {
    pub kind: SpanKind,
    pub name: String,
    pub start: FlexDate,
    pub end: FlexDate,
    pub state: SpanState,
    pub access_level: AccessLevel,
    pub owner: UserId,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl NewSpan {
    /// A draft, private span with unknown dates.
    pub fn new(kind: SpanKind, name: impl Into<String>, owner: impl Into<UserId>) -> Self {
        Self {
            kind,
            name: name.into(),
            start: FlexDate::unknown(),
            end: FlexDate::unknown(),
            state: SpanState::Draft,
            access_level: AccessLevel::Private,
            owner: owner.into(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn starting(mut self, start: FlexDate) -> Self {
        self.start = start;
        self
    }

    pub fn ending(mut self, end: FlexDate) -> Self {
        self.end = end;
        self
    }

    pub fn in_state(mut self, state: SpanState) -> Self {
        self.state = state;
        self
    }

    pub fn with_access(mut self, level: AccessLevel) -> Self {
        self.access_level = level;
        self
    }
}

/// A partial update to a span. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SpanUpdate {
    pub name: Option<String>,
    pub start: Option<FlexDate>,
    pub end: Option<FlexDate>,
    pub state: Option<SpanState>,
    pub access_level: Option<AccessLevel>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Temporal-uniqueness policy attached to a [`ConnectionType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// At most one edge of this type between two spans, ever.
    Single,
    /// Edges of this type between the same two spans must not overlap in
    /// time.
    NonOverlapping,
    /// No temporal constraint; the edge itself must still be unique.
    Timeless,
}

/// Which end of a connection an endpoint check refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Subject,
    Object,
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointRole::Subject => write!(f, "subject"),
            EndpointRole::Object => write!(f, "object"),
        }
    }
}

/// Immutable reference data describing one kind of edge: its constraint
/// policy and the span kinds admitted at each endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionType {
    pub id: String,
    pub constraint: ConstraintKind,
    pub subject_kinds: Vec<SpanKind>,
    pub object_kinds: Vec<SpanKind>,
}

impl ConnectionType {
    pub fn new(
        id: impl Into<String>,
        constraint: ConstraintKind,
        subject_kinds: Vec<SpanKind>,
        object_kinds: Vec<SpanKind>,
    ) -> Self {
        Self {
            id: id.into(),
            constraint,
            subject_kinds,
            object_kinds,
        }
    }

    pub fn allows_subject(&self, kind: SpanKind) -> bool {
        self.subject_kinds.contains(&kind)
    }

    pub fn allows_object(&self, kind: SpanKind) -> bool {
        self.object_kinds.contains(&kind)
    }
}

/// A directed, typed edge between two spans.
///
/// The edge's own temporal extent lives in its connection-span (a [`Span`]
/// of kind `Connection`), so "worked at, 2001-2004" is the span's date
/// range, not the endpoints'. A connection is owned transitively through
/// its connection-span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub subject_id: SpanId,
    pub object_id: SpanId,
    pub type_id: String,
    pub connection_span_id: SpanId,
}

/// Specification for a connection to be created.
///
/// The connection-span is created alongside the edge, owned by the
/// creating principal. Defaults: unknown dates and `Complete` state. Set
/// dates with [`spanning`], or mark the edge [`as_placeholder`] when its
/// dates are not yet known.
///
/// [`spanning`]: NewConnection::spanning
/// [`as_placeholder`]: NewConnection::as_placeholder
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub subject_id: SpanId,
    pub object_id: SpanId,
    pub type_id: String,
    pub start: FlexDate,
    pub end: FlexDate,
    pub state: SpanState,
    pub access_level: AccessLevel,
}

impl NewConnection {
    pub fn new(subject_id: SpanId, type_id: impl Into<String>, object_id: SpanId) -> Self {
        Self {
            subject_id,
            object_id,
            type_id: type_id.into(),
            start: FlexDate::unknown(),
            end: FlexDate::unknown(),
            state: SpanState::Complete,
            access_level: AccessLevel::Private,
        }
    }

    /// Set the edge's validity interval. An unknown `end` means ongoing.
    pub fn spanning(mut self, start: FlexDate, end: FlexDate) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn as_placeholder(mut self) -> Self {
        self.state = SpanState::Placeholder;
        self
    }

    pub fn with_access(mut self, level: AccessLevel) -> Self {
        self.access_level = level;
        self
    }
}

// ---------------------------------------------------------------------------
// Mutation events
// ---------------------------------------------------------------------------

/// A committed change to the graph, published to the registered
/// [`MutationObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Span(SpanId),
    Connection(ConnectionId),
}

/// Receiver for mutation events: the seam where cache invalidation,
/// indexing, or notification layers attach without the engine knowing
/// about them.
///
/// Notified synchronously, **after** the owning write transaction commits;
/// rejected or rolled-back mutations are never published. Implementations
/// must not fail: the engine ignores whatever the observer does.
pub trait MutationObserver: Send + Sync {
    fn notify(&self, mutation: &Mutation);
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Span rows keyed by span id. ULIDs are time-sortable, so a full scan
/// visits spans in creation order.
const SPANS: TableDefinition<&str, &str> = TableDefinition::new("spans");

/// Composite string key: `"{subject_id}:{type_id}:{connection_id}"`.
///
/// Everything the constraint validator needs to see (the existing edges
/// of one (subject, type) pair) is a single prefix scan.
const CONNECTIONS: TableDefinition<&str, &str> = TableDefinition::new("connections");

/// Connection types keyed by type id. Immutable once registered.
const CONNECTION_TYPES: TableDefinition<&str, &str> = TableDefinition::new("connection_types");

/// Composite string key: `"{span_id}:{grant_id}"`. The grants of one span
/// are a prefix scan, and cascade deletion removes the prefix.
const GRANTS: TableDefinition<&str, &str> = TableDefinition::new("grants");

/// Group rows keyed by group id, members inline.
const GROUPS: TableDefinition<&str, &str> = TableDefinition::new("groups");

/// Maps client-supplied idempotency keys to persisted span IDs.
///
/// Used by [`SpanGraph::create_span_idempotent`] to provide safe retry
/// semantics for import pipelines.
const IDEMPOTENCY: TableDefinition<&str, &str> = TableDefinition::new("idempotency");

fn connection_key(conn: &Connection) -> String {
    format!("{}:{}:{}", conn.subject_id, conn.type_id, conn.id)
}

fn grant_key(grant: &PermissionGrant) -> String {
    format!("{}:{}", grant.span_id, grant.id)
}

fn not_found_span(id: &SpanId) -> TidemarkError {
    TidemarkError::NotFound(format!("span {id}"))
}

fn read_json<T, V>(table: &T, key: &str) -> Result<Option<V>>
where
    T: ReadableTable<&'static str, &'static str>,
    V: serde::de::DeserializeOwned,
{
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
        None => Ok(None),
    }
}

fn scan_entries<T, V>(table: &T, prefix: &str) -> Result<Vec<(String, V)>>
where
    T: ReadableTable<&'static str, &'static str>,
    V: serde::de::DeserializeOwned,
{
    let mut results = Vec::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        if k.value().starts_with(prefix) {
            results.push((k.value().to_string(), serde_json::from_str(v.value())?));
        }
    }
    Ok(results)
}

fn scan_json<T, V>(table: &T, prefix: &str) -> Result<Vec<V>>
where
    T: ReadableTable<&'static str, &'static str>,
    V: serde::de::DeserializeOwned,
{
    Ok(scan_entries(table, prefix)?
        .into_iter()
        .map(|(_, v)| v)
        .collect())
}

/// Load the existing connections of one (subject, type, object) triple,
/// paired with their connection-spans. A connection whose span row is
/// missing is skipped.
fn load_triple<TC, TS>(
    connections: &TC,
    spans: &TS,
    subject: &SpanId,
    type_id: &str,
    object: &SpanId,
) -> Result<Vec<(Connection, Span)>>
where
    TC: ReadableTable<&'static str, &'static str>,
    TS: ReadableTable<&'static str, &'static str>,
{
    let candidates: Vec<Connection> = scan_json(connections, &format!("{subject}:{type_id}:"))?;
    let mut results = Vec::new();
    for conn in candidates {
        if conn.object_id != *object {
            continue;
        }
        let Some(span) = read_json::<_, Span>(spans, &conn.connection_span_id.0)? else {
            continue;
        };
        results.push((conn, span));
    }
    Ok(results)
}

/// Resolve `requested` for `principal` on `span` using the stored grant
/// and group records. Loads only the records the pure resolver needs.
fn resolve_on_span<TGr, TGp>(
    span: &Span,
    principal: Option<&Principal>,
    requested: Permission,
    grants: &TGr,
    groups: &TGp,
) -> Result<bool>
where
    TGr: ReadableTable<&'static str, &'static str>,
    TGp: ReadableTable<&'static str, &'static str>,
{
    let grant_records: Vec<PermissionGrant> = scan_json(grants, &format!("{}:", span.id))?;
    let group_records: Vec<Group> = match principal {
        Some(p) => scan_json::<_, Group>(groups, "")?
            .into_iter()
            .filter(|g| g.has_member(&p.id))
            .collect(),
        None => Vec::new(),
    };
    Ok(access::resolve(
        principal,
        span,
        &grant_records,
        &group_records,
        requested,
    ))
}

/// Gate a mutation on `requested`. Deny reads as `NotFound` when the
/// principal cannot even view the span (a denied lookup must be
/// indistinguishable from a missing one), and as `PermissionDenied` when
/// the span is visible but the permission is lacking.
fn authorize<TGr, TGp>(
    span: &Span,
    principal: Option<&Principal>,
    requested: Permission,
    grants: &TGr,
    groups: &TGp,
) -> Result<()>
where
    TGr: ReadableTable<&'static str, &'static str>,
    TGp: ReadableTable<&'static str, &'static str>,
{
    if resolve_on_span(span, principal, requested, grants, groups)? {
        return Ok(());
    }
    if requested == Permission::Edit
        && resolve_on_span(span, principal, Permission::View, grants, groups)?
    {
        return Err(TidemarkError::PermissionDenied);
    }
    Err(not_found_span(&span.id))
}

/// Tidemark temporal entity graph.
///
/// An embedded, serverless store where precision-dated spans and
/// constraint-checked connections are the core primitives. All writes are
/// ACID (backed by `redb`); constraint validation runs inside the same
/// write transaction as the insert it guards, so two concurrent writers
/// cannot both pass the existence check for a `single` or
/// `non_overlapping` type. The database file uses the `.tidemark`
/// extension by convention.
pub struct SpanGraph {
    db: Database,
    observer: Option<Box<dyn MutationObserver>>,
}

impl SpanGraph {
    /// Open or create a Tidemark database at the given path.
    ///
    /// The file will be created if it does not exist. The `.tidemark`
    /// extension is conventional but not enforced.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory Tidemark database (no file I/O).
    ///
    /// Useful for testing and ephemeral workloads where persistence is
    /// not needed. Data is lost when the instance is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(SPANS)?;
            write_txn.open_table(CONNECTIONS)?;
            write_txn.open_table(CONNECTION_TYPES)?;
            write_txn.open_table(GRANTS)?;
            write_txn.open_table(GROUPS)?;
            write_txn.open_table(IDEMPOTENCY)?;
            write_txn.commit()?;
        }
        Ok(Self { db, observer: None })
    }

    /// Register the observer that receives committed mutation events.
    /// Replaces any previous observer.
    pub fn set_observer(&mut self, observer: Box<dyn MutationObserver>) {
        self.observer = Some(observer);
    }

    fn emit(&self, mutation: Mutation) {
        if let Some(observer) = &self.observer {
            observer.notify(&mutation);
        }
    }

    // -- connection types ---------------------------------------------------

    /// Register a connection type. Types are immutable reference data:
    /// re-registering an id is an error.
    pub fn register_connection_type(&self, ctype: ConnectionType) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CONNECTION_TYPES)?;
            if read_json::<_, ConnectionType>(&table, &ctype.id)?.is_some() {
                return Err(TidemarkError::ConnectionTypeExists(ctype.id));
            }
            let value = serde_json::to_string(&ctype)?;
            table.insert(ctype.id.as_str(), value.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn connection_type(&self, id: &str) -> Result<ConnectionType> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONNECTION_TYPES)?;
        read_json(&table, id)?.ok_or_else(|| TidemarkError::UnknownConnectionType(id.to_string()))
    }

    pub fn connection_types(&self) -> Result<Vec<ConnectionType>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONNECTION_TYPES)?;
        scan_json(&table, "")
    }

    // -- spans --------------------------------------------------------------

    /// Validate and persist a new span, returning its [`SpanId`].
    pub fn create_span(&self, new: NewSpan) -> Result<SpanId> {
        let span = Span::from_new(new);
        span.validate()?;
        let value = serde_json::to_string(&span)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SPANS)?;
            table.insert(span.id.0.as_str(), value.as_str())?;
        }
        write_txn.commit()?;

        self.emit(Mutation::Span(span.id.clone()));
        Ok(span.id)
    }

    /// Create a span with idempotency-key deduplication.
    ///
    /// If `idempotency_key` has already been used, returns the original
    /// [`SpanId`] without creating a new row. Otherwise creates the span
    /// and stores the key -> span mapping atomically in the same
    /// transaction.
    pub fn create_span_idempotent(&self, idempotency_key: &str, new: NewSpan) -> Result<SpanId> {
        // Fast path: check with a read transaction to avoid holding the
        // write lock on cache-hit (idempotent retry).
        {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(IDEMPOTENCY)?;
            let existing: Option<String> = table
                .get(idempotency_key)?
                .map(|guard| guard.value().to_string());
            if let Some(existing_id) = existing {
                return Ok(SpanId(existing_id));
            }
        }

        let span = Span::from_new(new);
        span.validate()?;
        let value = serde_json::to_string(&span)?;

        // Slow path: acquire the write lock. Re-check the key since
        // another writer may have inserted between our read and this
        // write (double-check).
        let write_txn = self.db.begin_write()?;
        {
            let table = write_txn.open_table(IDEMPOTENCY)?;
            let existing: Option<String> = table
                .get(idempotency_key)?
                .map(|guard| guard.value().to_string());
            if let Some(existing_id) = existing {
                return Ok(SpanId(existing_id));
            }
        }
        {
            let mut table = write_txn.open_table(SPANS)?;
            table.insert(span.id.0.as_str(), value.as_str())?;
        }
        {
            let mut table = write_txn.open_table(IDEMPOTENCY)?;
            table.insert(idempotency_key, span.id.0.as_str())?;
        }
        write_txn.commit()?;

        self.emit(Mutation::Span(span.id.clone()));
        Ok(span.id)
    }

    /// Fetch a span the principal may view.
    ///
    /// A span the principal may not view yields the same `NotFound` as a
    /// span that does not exist.
    pub fn span(&self, id: &SpanId, principal: Option<&Principal>) -> Result<Span> {
        let read_txn = self.db.begin_read()?;
        let spans = read_txn.open_table(SPANS)?;
        let Some(span) = read_json::<_, Span>(&spans, &id.0)? else {
            return Err(not_found_span(id));
        };
        let grants = read_txn.open_table(GRANTS)?;
        let groups = read_txn.open_table(GROUPS)?;
        if !resolve_on_span(&span, principal, Permission::View, &grants, &groups)? {
            return Err(not_found_span(id));
        }
        Ok(span)
    }

    /// Apply a partial update to a span. Requires `Edit`.
    ///
    /// Editing the dates or state of a connection-span re-triggers the
    /// owning connection's constraint validation; completing a
    /// placeholder with real dates is validated like any other edit.
    pub fn update_span(
        &self,
        id: &SpanId,
        principal: Option<&Principal>,
        update: SpanUpdate,
    ) -> Result<()> {
        let mut mutations = vec![Mutation::Span(id.clone())];

        let write_txn = self.db.begin_write()?;
        {
            let mut spans = write_txn.open_table(SPANS)?;
            let Some(mut span) = read_json::<_, Span>(&spans, &id.0)? else {
                return Err(not_found_span(id));
            };
            {
                let grants = write_txn.open_table(GRANTS)?;
                let groups = write_txn.open_table(GROUPS)?;
                authorize(&span, principal, Permission::Edit, &grants, &groups)?;
            }

            let dates_touched =
                update.start.is_some() || update.end.is_some() || update.state.is_some();
            span.apply(update);
            span.validate()?;

            if span.kind == SpanKind::Connection && dates_touched {
                let connections = write_txn.open_table(CONNECTIONS)?;
                if let Some(conn) = find_connection_by_span(&connections, id)? {
                    let types = write_txn.open_table(CONNECTION_TYPES)?;
                    let ctype: ConnectionType = read_json(&types, &conn.type_id)?
                        .ok_or_else(|| TidemarkError::UnknownConnectionType(conn.type_id.clone()))?;
                    let subject = read_json::<_, Span>(&spans, &conn.subject_id.0)?
                        .ok_or_else(|| not_found_span(&conn.subject_id))?;
                    let object = read_json::<_, Span>(&spans, &conn.object_id.0)?
                        .ok_or_else(|| not_found_span(&conn.object_id))?;
                    let existing = load_triple(
                        &connections,
                        &spans,
                        &conn.subject_id,
                        &conn.type_id,
                        &conn.object_id,
                    )?;
                    constraint::validate_connection(
                        &conn,
                        &span,
                        subject.kind,
                        object.kind,
                        &ctype,
                        &existing,
                    )?;
                    mutations.push(Mutation::Connection(conn.id));
                }
            }

            span.updated_at = Utc::now();
            let value = serde_json::to_string(&span)?;
            spans.insert(id.0.as_str(), value.as_str())?;
        }
        write_txn.commit()?;

        for mutation in mutations {
            self.emit(mutation);
        }
        Ok(())
    }

    /// Delete a span. Requires `Edit`. Cascades to the span's grants and
    /// to every connection the span participates in (as an endpoint or as
    /// the connection-span), including those connections' own spans and
    /// grants.
    pub fn delete_span(&self, id: &SpanId, principal: Option<&Principal>) -> Result<()> {
        let mut mutations = Vec::new();

        let write_txn = self.db.begin_write()?;
        {
            let mut spans = write_txn.open_table(SPANS)?;
            let mut connections = write_txn.open_table(CONNECTIONS)?;
            let mut grants = write_txn.open_table(GRANTS)?;

            let Some(span) = read_json::<_, Span>(&spans, &id.0)? else {
                return Err(not_found_span(id));
            };
            {
                let groups = write_txn.open_table(GROUPS)?;
                authorize(&span, principal, Permission::Edit, &grants, &groups)?;
            }

            let mut dead_spans = vec![id.clone()];
            let mut dead_connection_keys = Vec::new();
            for (key, conn) in scan_entries::<_, Connection>(&connections, "")? {
                let incident = conn.subject_id == *id
                    || conn.object_id == *id
                    || conn.connection_span_id == *id;
                if !incident {
                    continue;
                }
                dead_connection_keys.push(key);
                mutations.push(Mutation::Connection(conn.id));
                if conn.connection_span_id != *id {
                    dead_spans.push(conn.connection_span_id);
                }
            }

            for key in &dead_connection_keys {
                connections.remove(key.as_str())?;
            }
            for span_id in &dead_spans {
                spans.remove(span_id.0.as_str())?;
                mutations.push(Mutation::Span(span_id.clone()));
                let grant_keys: Vec<String> =
                    scan_entries::<_, PermissionGrant>(&grants, &format!("{span_id}:"))?
                        .into_iter()
                        .map(|(k, _)| k)
                        .collect();
                for key in grant_keys {
                    grants.remove(key.as_str())?;
                }
            }
        }
        write_txn.commit()?;

        for mutation in mutations {
            self.emit(mutation);
        }
        Ok(())
    }

    /// List the spans the principal may view, filtered and paginated.
    /// Ordered by creation (span IDs are time-sortable).
    pub fn spans(&self, filter: &SpanFilter, principal: Option<&Principal>) -> Result<Vec<Span>> {
        let read_txn = self.db.begin_read()?;
        let spans = read_txn.open_table(SPANS)?;
        let grants = read_txn.open_table(GRANTS)?;
        let groups = read_txn.open_table(GROUPS)?;

        let mut results = Vec::new();
        for span in scan_json::<_, Span>(&spans, "")? {
            if !filter.matches(&span) {
                continue;
            }
            if !resolve_on_span(&span, principal, Permission::View, &grants, &groups)? {
                continue;
            }
            results.push(span);
        }
        results.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        Ok(filter.page(results))
    }

    // -- connections --------------------------------------------------------

    /// Create a connection and its connection-span.
    ///
    /// Both endpoints must exist and be viewable by the principal (a
    /// non-viewable endpoint reads as missing). The connection-span's
    /// date invariants, the endpoint kinds, and the type's constraint
    /// policy are all checked, and the rows written, inside **one**
    /// write transaction, so concurrent writers on the same
    /// (subject, object, type) triple serialize rather than racing the
    /// existence check.
    pub fn create_connection(
        &self,
        new: NewConnection,
        principal: Option<&Principal>,
    ) -> Result<ConnectionId> {
        let Some(principal) = principal else {
            return Err(TidemarkError::PermissionDenied);
        };

        let connection_id;
        let connection_span_id;

        let write_txn = self.db.begin_write()?;
        {
            let mut spans = write_txn.open_table(SPANS)?;
            let mut connections = write_txn.open_table(CONNECTIONS)?;
            let types = write_txn.open_table(CONNECTION_TYPES)?;
            let grants = write_txn.open_table(GRANTS)?;
            let groups = write_txn.open_table(GROUPS)?;

            let ctype: ConnectionType = read_json(&types, &new.type_id)?
                .ok_or_else(|| TidemarkError::UnknownConnectionType(new.type_id.clone()))?;
            let subject = read_json::<_, Span>(&spans, &new.subject_id.0)?
                .ok_or_else(|| not_found_span(&new.subject_id))?;
            let object = read_json::<_, Span>(&spans, &new.object_id.0)?
                .ok_or_else(|| not_found_span(&new.object_id))?;
            if !resolve_on_span(&subject, Some(principal), Permission::View, &grants, &groups)? {
                return Err(not_found_span(&new.subject_id));
            }
            if !resolve_on_span(&object, Some(principal), Permission::View, &grants, &groups)? {
                return Err(not_found_span(&new.object_id));
            }

            let connection_span = Span::from_new(NewSpan {
                kind: SpanKind::Connection,
                name: format!("{} {} {}", subject.name, ctype.id, object.name),
                start: new.start,
                end: new.end,
                state: new.state,
                access_level: new.access_level,
                owner: principal.id.clone(),
                metadata: serde_json::Map::new(),
            });
            let conn = Connection {
                id: ConnectionId::new(),
                subject_id: new.subject_id,
                object_id: new.object_id,
                type_id: new.type_id,
                connection_span_id: connection_span.id.clone(),
            };

            let existing = load_triple(
                &connections,
                &spans,
                &conn.subject_id,
                &conn.type_id,
                &conn.object_id,
            )?;
            constraint::validate_connection(
                &conn,
                &connection_span,
                subject.kind,
                object.kind,
                &ctype,
                &existing,
            )?;

            let span_value = serde_json::to_string(&connection_span)?;
            spans.insert(connection_span.id.0.as_str(), span_value.as_str())?;
            let conn_value = serde_json::to_string(&conn)?;
            connections.insert(connection_key(&conn).as_str(), conn_value.as_str())?;

            connection_span_id = connection_span.id;
            connection_id = conn.id;
        }
        write_txn.commit()?;

        self.emit(Mutation::Span(connection_span_id));
        self.emit(Mutation::Connection(connection_id.clone()));
        Ok(connection_id)
    }

    /// Dry-run the checks [`create_connection`] would perform, without
    /// writing or requiring a principal. Accepting is returning `Ok(())`.
    ///
    /// [`create_connection`]: SpanGraph::create_connection
    pub fn validate_connection(&self, new: &NewConnection) -> Result<()> {
        let read_txn = self.db.begin_read()?;
        let spans = read_txn.open_table(SPANS)?;
        let connections = read_txn.open_table(CONNECTIONS)?;
        let types = read_txn.open_table(CONNECTION_TYPES)?;

        let ctype: ConnectionType = read_json(&types, &new.type_id)?
            .ok_or_else(|| TidemarkError::UnknownConnectionType(new.type_id.clone()))?;
        let subject = read_json::<_, Span>(&spans, &new.subject_id.0)?
            .ok_or_else(|| not_found_span(&new.subject_id))?;
        let object = read_json::<_, Span>(&spans, &new.object_id.0)?
            .ok_or_else(|| not_found_span(&new.object_id))?;

        let connection_span = Span::from_new(NewSpan {
            kind: SpanKind::Connection,
            name: format!("{} {} {}", subject.name, ctype.id, object.name),
            start: new.start,
            end: new.end,
            state: new.state,
            access_level: new.access_level,
            owner: subject.owner.clone(),
            metadata: serde_json::Map::new(),
        });
        let conn = Connection {
            id: ConnectionId::new(),
            subject_id: new.subject_id.clone(),
            object_id: new.object_id.clone(),
            type_id: new.type_id.clone(),
            connection_span_id: connection_span.id.clone(),
        };

        let existing = load_triple(
            &connections,
            &spans,
            &conn.subject_id,
            &conn.type_id,
            &conn.object_id,
        )?;
        constraint::validate_connection(
            &conn,
            &connection_span,
            subject.kind,
            object.kind,
            &ctype,
            &existing,
        )
    }

    /// Re-run constraint validation for a persisted connection against
    /// current state. Validation is deterministic, so an accepted,
    /// unchanged connection re-validates to `Ok`. Useful after a
    /// transaction retry.
    pub fn revalidate_connection(&self, id: &ConnectionId) -> Result<()> {
        let read_txn = self.db.begin_read()?;
        let spans = read_txn.open_table(SPANS)?;
        let connections = read_txn.open_table(CONNECTIONS)?;
        let types = read_txn.open_table(CONNECTION_TYPES)?;

        let Some(conn) = find_connection_by_id(&connections, id)? else {
            return Err(TidemarkError::NotFound(format!("connection {id}")));
        };
        let span = read_json::<_, Span>(&spans, &conn.connection_span_id.0)?
            .ok_or_else(|| not_found_span(&conn.connection_span_id))?;
        let ctype: ConnectionType = read_json(&types, &conn.type_id)?
            .ok_or_else(|| TidemarkError::UnknownConnectionType(conn.type_id.clone()))?;
        let subject = read_json::<_, Span>(&spans, &conn.subject_id.0)?
            .ok_or_else(|| not_found_span(&conn.subject_id))?;
        let object = read_json::<_, Span>(&spans, &conn.object_id.0)?
            .ok_or_else(|| not_found_span(&conn.object_id))?;

        let existing = load_triple(
            &connections,
            &spans,
            &conn.subject_id,
            &conn.type_id,
            &conn.object_id,
        )?;
        constraint::validate_connection(&conn, &span, subject.kind, object.kind, &ctype, &existing)
    }

    /// Fetch a connection and its connection-span. Visibility follows the
    /// connection-span; a denied lookup reads as missing.
    pub fn connection(
        &self,
        id: &ConnectionId,
        principal: Option<&Principal>,
    ) -> Result<(Connection, Span)> {
        let read_txn = self.db.begin_read()?;
        let spans = read_txn.open_table(SPANS)?;
        let connections = read_txn.open_table(CONNECTIONS)?;
        let grants = read_txn.open_table(GRANTS)?;
        let groups = read_txn.open_table(GROUPS)?;

        let Some(conn) = find_connection_by_id(&connections, id)? else {
            return Err(TidemarkError::NotFound(format!("connection {id}")));
        };
        let span = read_json::<_, Span>(&spans, &conn.connection_span_id.0)?
            .ok_or_else(|| not_found_span(&conn.connection_span_id))?;
        if !resolve_on_span(&span, principal, Permission::View, &grants, &groups)? {
            return Err(TidemarkError::NotFound(format!("connection {id}")));
        }
        Ok((conn, span))
    }

    /// Every connection a span participates in as subject or object,
    /// restricted to those whose connection-span the principal may view.
    pub fn connections_of(
        &self,
        span_id: &SpanId,
        principal: Option<&Principal>,
    ) -> Result<Vec<(Connection, Span)>> {
        let read_txn = self.db.begin_read()?;
        let spans = read_txn.open_table(SPANS)?;
        let connections = read_txn.open_table(CONNECTIONS)?;
        let grants = read_txn.open_table(GRANTS)?;
        let groups = read_txn.open_table(GROUPS)?;

        let mut results = Vec::new();
        for conn in scan_json::<_, Connection>(&connections, "")? {
            if conn.subject_id != *span_id && conn.object_id != *span_id {
                continue;
            }
            let Some(span) = read_json::<_, Span>(&spans, &conn.connection_span_id.0)? else {
                continue;
            };
            if !resolve_on_span(&span, principal, Permission::View, &grants, &groups)? {
                continue;
            }
            results.push((conn, span));
        }
        results.sort_by(|a, b| a.0.id.0.cmp(&b.0.id.0));
        Ok(results)
    }

    /// Re-date a connection by editing its connection-span. Requires
    /// `Edit` on the connection-span; constraint validation re-runs with
    /// the new dates and state.
    pub fn update_connection_span(
        &self,
        id: &ConnectionId,
        principal: Option<&Principal>,
        start: FlexDate,
        end: FlexDate,
        state: SpanState,
    ) -> Result<()> {
        let span_id = {
            let read_txn = self.db.begin_read()?;
            let connections = read_txn.open_table(CONNECTIONS)?;
            let Some(conn) = find_connection_by_id(&connections, id)? else {
                return Err(TidemarkError::NotFound(format!("connection {id}")));
            };
            conn.connection_span_id
        };
        self.update_span(
            &span_id,
            principal,
            SpanUpdate {
                start: Some(start),
                end: Some(end),
                state: Some(state),
                ..Default::default()
            },
        )
    }

    /// Delete a connection and its connection-span (with that span's
    /// grants). Requires `Edit` on the connection-span.
    pub fn delete_connection(&self, id: &ConnectionId, principal: Option<&Principal>) -> Result<()> {
        let span_id = {
            let read_txn = self.db.begin_read()?;
            let connections = read_txn.open_table(CONNECTIONS)?;
            let Some(conn) = find_connection_by_id(&connections, id)? else {
                return Err(TidemarkError::NotFound(format!("connection {id}")));
            };
            conn.connection_span_id
        };
        // The connection-span cascade removes the edge row as well.
        self.delete_span(&span_id, principal)
    }

    // -- permissions --------------------------------------------------------

    /// Grant a user a permission on a span. Requires `Edit` on the span.
    pub fn grant_permission(
        &self,
        span_id: &SpanId,
        user: impl Into<UserId>,
        permission: Permission,
        principal: Option<&Principal>,
    ) -> Result<GrantId> {
        self.grant(span_id, GrantTarget::User(user.into()), permission, principal)
    }

    /// Grant a group a permission on a span. Requires `Edit` on the span;
    /// the group must exist.
    pub fn grant_group_permission(
        &self,
        span_id: &SpanId,
        group: impl Into<GroupId>,
        permission: Permission,
        principal: Option<&Principal>,
    ) -> Result<GrantId> {
        self.grant(
            span_id,
            GrantTarget::Group(group.into()),
            permission,
            principal,
        )
    }

    fn grant(
        &self,
        span_id: &SpanId,
        target: GrantTarget,
        permission: Permission,
        principal: Option<&Principal>,
    ) -> Result<GrantId> {
        let grant_id;
        let write_txn = self.db.begin_write()?;
        {
            let spans = write_txn.open_table(SPANS)?;
            let mut grants = write_txn.open_table(GRANTS)?;
            let groups = write_txn.open_table(GROUPS)?;

            let Some(span) = read_json::<_, Span>(&spans, &span_id.0)? else {
                return Err(not_found_span(span_id));
            };
            authorize(&span, principal, Permission::Edit, &grants, &groups)?;

            if let GrantTarget::Group(group_id) = &target {
                if read_json::<_, Group>(&groups, &group_id.0)?.is_none() {
                    return Err(TidemarkError::NotFound(format!("group {group_id}")));
                }
            }

            let grant = PermissionGrant {
                id: GrantId::new(),
                span_id: span_id.clone(),
                target,
                permission,
            };
            let value = serde_json::to_string(&grant)?;
            grants.insert(grant_key(&grant).as_str(), value.as_str())?;
            grant_id = grant.id;
        }
        write_txn.commit()?;

        self.emit(Mutation::Span(span_id.clone()));
        Ok(grant_id)
    }

    /// Remove every grant on `span_id` addressed to `target`. Requires
    /// `Edit` on the span. Removing a target with no grants is a no-op.
    pub fn revoke_permission(
        &self,
        span_id: &SpanId,
        target: &GrantTarget,
        principal: Option<&Principal>,
    ) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let spans = write_txn.open_table(SPANS)?;
            let mut grants = write_txn.open_table(GRANTS)?;
            let groups = write_txn.open_table(GROUPS)?;

            let Some(span) = read_json::<_, Span>(&spans, &span_id.0)? else {
                return Err(not_found_span(span_id));
            };
            authorize(&span, principal, Permission::Edit, &grants, &groups)?;

            let keys: Vec<String> =
                scan_entries::<_, PermissionGrant>(&grants, &format!("{span_id}:"))?
                    .into_iter()
                    .filter(|(_, g)| g.target == *target)
                    .map(|(k, _)| k)
                    .collect();
            for key in keys {
                grants.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;

        self.emit(Mutation::Span(span_id.clone()));
        Ok(())
    }

    /// The grants on a span. Administrative: requires `Edit`.
    pub fn grants_for(
        &self,
        span_id: &SpanId,
        principal: Option<&Principal>,
    ) -> Result<Vec<PermissionGrant>> {
        let read_txn = self.db.begin_read()?;
        let spans = read_txn.open_table(SPANS)?;
        let grants = read_txn.open_table(GRANTS)?;
        let groups = read_txn.open_table(GROUPS)?;

        let Some(span) = read_json::<_, Span>(&spans, &span_id.0)? else {
            return Err(not_found_span(span_id));
        };
        authorize(&span, principal, Permission::Edit, &grants, &groups)?;
        scan_json(&grants, &format!("{span_id}:"))
    }

    /// Resolve whether `principal` holds `permission` on `span_id`.
    pub fn resolve_permission(
        &self,
        principal: Option<&Principal>,
        span_id: &SpanId,
        permission: Permission,
    ) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let spans = read_txn.open_table(SPANS)?;
        let grants = read_txn.open_table(GRANTS)?;
        let groups = read_txn.open_table(GROUPS)?;

        let Some(span) = read_json::<_, Span>(&spans, &span_id.0)? else {
            return Err(not_found_span(span_id));
        };
        resolve_on_span(&span, principal, permission, &grants, &groups)
    }

    // -- groups -------------------------------------------------------------

    /// Create an empty group administered by `principal`.
    pub fn create_group(&self, name: impl Into<String>, principal: &Principal) -> Result<GroupId> {
        let group = Group {
            id: GroupId::new(),
            name: name.into(),
            owner: principal.id.clone(),
            members: Vec::new(),
        };
        let value = serde_json::to_string(&group)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(GROUPS)?;
            table.insert(group.id.0.as_str(), value.as_str())?;
        }
        write_txn.commit()?;
        Ok(group.id)
    }

    /// Add a member. Only the group's administrator (or an admin
    /// principal) may change membership. Adding an existing member is a
    /// no-op.
    pub fn add_group_member(
        &self,
        group_id: &GroupId,
        user: impl Into<UserId>,
        principal: &Principal,
    ) -> Result<()> {
        self.update_group(group_id, principal, |group| {
            let user = user.into();
            if !group.members.contains(&user) {
                group.members.push(user);
            }
        })
    }

    /// Remove a member. Only the group's administrator (or an admin
    /// principal) may change membership.
    pub fn remove_group_member(
        &self,
        group_id: &GroupId,
        user: &UserId,
        principal: &Principal,
    ) -> Result<()> {
        self.update_group(group_id, principal, |group| {
            group.members.retain(|m| m != user);
        })
    }

    fn update_group(
        &self,
        group_id: &GroupId,
        principal: &Principal,
        apply: impl FnOnce(&mut Group),
    ) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(GROUPS)?;
            let Some(mut group) = read_json::<_, Group>(&table, &group_id.0)? else {
                return Err(TidemarkError::NotFound(format!("group {group_id}")));
            };
            if !principal.admin && group.owner != principal.id {
                return Err(TidemarkError::PermissionDenied);
            }
            apply(&mut group);
            let value = serde_json::to_string(&group)?;
            table.insert(group_id.0.as_str(), value.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn group(&self, id: &GroupId) -> Result<Group> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(GROUPS)?;
        read_json(&table, &id.0)?.ok_or_else(|| TidemarkError::NotFound(format!("group {id}")))
    }

    /// Every group the user is a member of.
    pub fn groups_of(&self, user: &UserId) -> Result<Vec<Group>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(GROUPS)?;
        Ok(scan_json::<_, Group>(&table, "")?
            .into_iter()
            .filter(|g| g.has_member(user))
            .collect())
    }

    // -- temporal relations -------------------------------------------------

    /// The spans standing in `relation` to `reference`, access-filtered
    /// to what the principal may view, then filtered and paginated by
    /// `filter`. Ordered by expanded lower bound, ties broken by id.
    ///
    /// The reference itself never appears in its own results. A reference
    /// the principal may not view reads as missing.
    pub fn related_spans(
        &self,
        reference: &SpanId,
        relation: TemporalRelation,
        filter: &SpanFilter,
        principal: Option<&Principal>,
    ) -> Result<Vec<Span>> {
        let read_txn = self.db.begin_read()?;
        let spans = read_txn.open_table(SPANS)?;
        let grants = read_txn.open_table(GRANTS)?;
        let groups = read_txn.open_table(GROUPS)?;

        let Some(reference_span) = read_json::<_, Span>(&spans, &reference.0)? else {
            return Err(not_found_span(reference));
        };
        if !resolve_on_span(&reference_span, principal, Permission::View, &grants, &groups)? {
            return Err(not_found_span(reference));
        }

        let mut results = Vec::new();
        for span in scan_json::<_, Span>(&spans, "")? {
            if !relation::classify(&reference_span, &span, relation) {
                continue;
            }
            if !filter.matches(&span) {
                continue;
            }
            if !resolve_on_span(&span, principal, Permission::View, &grants, &groups)? {
                continue;
            }
            results.push(span);
        }
        results.sort_by(|a, b| {
            let ka = a.start.expand(Edge::Lower);
            let kb = b.start.expand(Edge::Lower);
            ka.cmp(&kb).then_with(|| a.id.0.cmp(&b.id.0))
        });
        Ok(filter.page(results))
    }
}

/// Linear scan for a connection by id. Connection rows are keyed for
/// triple scans, not id lookups; id lookups are rare enough that a scan
/// is acceptable.
fn find_connection_by_id<T>(table: &T, id: &ConnectionId) -> Result<Option<Connection>>
where
    T: ReadableTable<&'static str, &'static str>,
{
    for entry in table.iter()? {
        let (_k, v) = entry?;
        let conn: Connection = serde_json::from_str(v.value())?;
        if conn.id == *id {
            return Ok(Some(conn));
        }
    }
    Ok(None)
}

/// Linear scan for the connection owning a connection-span.
fn find_connection_by_span<T>(table: &T, span_id: &SpanId) -> Result<Option<Connection>>
where
    T: ReadableTable<&'static str, &'static str>,
{
    for entry in table.iter()? {
        let (_k, v) = entry?;
        let conn: Connection = serde_json::from_str(v.value())?;
        if conn.connection_span_id == *span_id {
            return Ok(Some(conn));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
