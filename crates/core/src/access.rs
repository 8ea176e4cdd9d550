//! Access control resolution.
//!
//! Permissions compose four sources into one decision: ownership, the
//! span's visibility level, explicit per-user grants, and grants held by
//! groups the principal belongs to. The resolver is a pure function over
//! explicit inputs (no session state, no storage handle), so every branch
//! of the decision table is unit-testable in isolation. [`crate::SpanGraph`]
//! loads the grant and group records and delegates here.

use serde::{Deserialize, Serialize};

use crate::{GrantId, GroupId, Span, SpanId, UserId};

/// The two permission kinds. `Edit` subsumes `View`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    View,
    Edit,
}

impl Permission {
    /// Does a grant of `self` satisfy a request for `requested`?
    ///
    /// A grant of `Edit` satisfies both kinds; a grant of `View` satisfies
    /// only `View`.
    pub fn grants(self, requested: Permission) -> bool {
        match (self, requested) {
            (Permission::Edit, _) => true,
            (Permission::View, Permission::View) => true,
            (Permission::View, Permission::Edit) => false,
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::View => write!(f, "view"),
            Permission::Edit => write!(f, "edit"),
        }
    }
}

/// Visibility level of a span.
///
/// `Public` spans are viewable by anyone, including guests. `Shared` and
/// `Private` spans are visible only to the owner and grant holders; the
/// distinction between the two is presentational (a `Shared` span is one
/// the owner intends to grant on) and carries no extra capability here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Private,
    Shared,
    Public,
}

/// Who a grant is addressed to: one user or one group, never both.
///
/// The exactly-one-of invariant holds by construction: there is no record
/// shape with both a user and a group id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum GrantTarget {
    User(UserId),
    Group(GroupId),
}

/// An explicit permission record tying a target to a span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub id: GrantId,
    pub span_id: SpanId,
    pub target: GrantTarget,
    pub permission: Permission,
}

/// A flat set of member users. Grants addressed to the group confer on
/// every member. Groups do not nest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// The user who created and administers the group.
    pub owner: UserId,
    pub members: Vec<UserId>,
}

impl Group {
    pub fn has_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }
}

/// The caller's identity. Absence of a principal is a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: UserId,
    pub admin: bool,
}

impl Principal {
    pub fn user(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            admin: false,
        }
    }

    pub fn admin(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            admin: true,
        }
    }
}

/// Resolve whether `principal` holds `requested` on `span`.
///
/// Resolution order, first match wins:
/// 1. guest: allow only `View` on a public span;
/// 2. administrator: allow;
/// 3. owner: allow;
/// 4. `View` on a public span: allow;
/// 5. explicit user grant whose permission [`Permission::grants`] the
///    request: allow;
/// 6. grant held by any group the principal is a member of, same
///    hierarchy rule: allow;
/// 7. deny.
///
/// `grants` are the grant records for this span and `groups` the groups
/// the principal belongs to; both are matched against the span and
/// principal again here, so over-supplying records cannot widen access.
pub fn resolve(
    principal: Option<&Principal>,
    span: &Span,
    grants: &[PermissionGrant],
    groups: &[Group],
    requested: Permission,
) -> bool {
    let Some(principal) = principal else {
        return requested == Permission::View && span.access_level == AccessLevel::Public;
    };
    if principal.admin {
        return true;
    }
    if span.owner == principal.id {
        return true;
    }
    if requested == Permission::View && span.access_level == AccessLevel::Public {
        return true;
    }

    let applicable = grants
        .iter()
        .filter(|g| g.span_id == span.id && g.permission.grants(requested));

    for grant in applicable {
        match &grant.target {
            GrantTarget::User(user) if *user == principal.id => return true,
            GrantTarget::Group(group_id)
                if groups
                    .iter()
                    .any(|g| g.id == *group_id && g.has_member(&principal.id)) =>
            {
                return true
            }
            _ => {}
        }
    }

    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FlexDate, NewSpan, SpanKind, SpanState};

    fn span(owner: &str, access_level: AccessLevel) -> Span {
        Span::from_new(NewSpan {
            kind: SpanKind::Person,
            name: "test subject".to_string(),
            start: FlexDate::year(1960),
            end: FlexDate::unknown(),
            state: SpanState::Complete,
            access_level,
            owner: UserId::from(owner),
            metadata: serde_json::Map::new(),
        })
    }

    fn user_grant(span: &Span, user: &str, permission: Permission) -> PermissionGrant {
        PermissionGrant {
            id: GrantId::new(),
            span_id: span.id.clone(),
            target: GrantTarget::User(UserId::from(user)),
            permission,
        }
    }

    fn group_of(id: &str, owner: &str, members: &[&str]) -> Group {
        Group {
            id: GroupId::from(id),
            name: id.to_string(),
            owner: UserId::from(owner),
            members: members.iter().map(|m| UserId::from(*m)).collect(),
        }
    }

    #[test]
    fn guest_can_view_public_but_never_edit() {
        let s = span("alice", AccessLevel::Public);
        assert!(resolve(None, &s, &[], &[], Permission::View));
        assert!(!resolve(None, &s, &[], &[], Permission::Edit));

        let hidden = span("alice", AccessLevel::Private);
        assert!(!resolve(None, &hidden, &[], &[], Permission::View));
    }

    #[test]
    fn owner_can_view_and_edit_unconditionally() {
        let s = span("alice", AccessLevel::Private);
        let alice = Principal::user("alice");
        assert!(resolve(Some(&alice), &s, &[], &[], Permission::View));
        assert!(resolve(Some(&alice), &s, &[], &[], Permission::Edit));
    }

    #[test]
    fn admin_bypasses_everything() {
        let s = span("alice", AccessLevel::Private);
        let root = Principal::admin("root");
        assert!(resolve(Some(&root), &s, &[], &[], Permission::Edit));
    }

    #[test]
    fn public_span_viewable_by_any_principal() {
        let s = span("alice", AccessLevel::Public);
        let bob = Principal::user("bob");
        assert!(resolve(Some(&bob), &s, &[], &[], Permission::View));
        assert!(!resolve(Some(&bob), &s, &[], &[], Permission::Edit));
    }

    #[test]
    fn view_grant_does_not_satisfy_edit() {
        let s = span("alice", AccessLevel::Private);
        let bob = Principal::user("bob");
        let grants = vec![user_grant(&s, "bob", Permission::View)];
        assert!(resolve(Some(&bob), &s, &grants, &[], Permission::View));
        assert!(!resolve(Some(&bob), &s, &grants, &[], Permission::Edit));
    }

    #[test]
    fn edit_grant_satisfies_view() {
        let s = span("alice", AccessLevel::Private);
        let bob = Principal::user("bob");
        let grants = vec![user_grant(&s, "bob", Permission::Edit)];
        assert!(resolve(Some(&bob), &s, &grants, &[], Permission::View));
        assert!(resolve(Some(&bob), &s, &grants, &[], Permission::Edit));
    }

    #[test]
    fn group_grant_confers_on_members_only() {
        let s = span("alice", AccessLevel::Private);
        let grants = vec![PermissionGrant {
            id: GrantId::new(),
            span_id: s.id.clone(),
            target: GrantTarget::Group(GroupId::from("historians")),
            permission: Permission::View,
        }];
        let groups = vec![group_of("historians", "alice", &["bob"])];

        let bob = Principal::user("bob");
        assert!(resolve(Some(&bob), &s, &grants, &groups, Permission::View));
        assert!(!resolve(Some(&bob), &s, &grants, &groups, Permission::Edit));

        let carol = Principal::user("carol");
        assert!(!resolve(Some(&carol), &s, &grants, &groups, Permission::View));
    }

    #[test]
    fn grants_for_other_spans_do_not_leak() {
        let s = span("alice", AccessLevel::Private);
        let other = span("alice", AccessLevel::Private);
        let bob = Principal::user("bob");
        // Grant addressed to a different span must not widen access here.
        let grants = vec![user_grant(&other, "bob", Permission::Edit)];
        assert!(!resolve(Some(&bob), &s, &grants, &[], Permission::View));
    }
}
