#![forbid(unsafe_code)]

//! The capability lattice: rights carried by each named capability,
//! subtyping, the control-flow join, and viewpoint adaptation for field
//! access. `isolated` is the unique bottom; `identity-only` and
//! `frozen` are supertypes reachable from most capabilities.

use sable_ast::Capability;

/// An atomic access right or its exclusivity guarantee.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Right {
    Read,
    Write,
    Identity,
    ExclusiveRead,
    ExclusiveWrite,
    ExclusiveIdentity,
}

impl Right {
    pub fn display(&self) -> &'static str {
        match self {
            Right::Read => "read",
            Right::Write => "write",
            Right::Identity => "identity",
            Right::ExclusiveRead => "exclusive-read",
            Right::ExclusiveWrite => "exclusive-write",
            Right::ExclusiveIdentity => "exclusive-identity",
        }
    }
}

/// Three-valued presence of the exclusive-identity right. `Deferred`
/// models uniqueness decided at runtime; every static rule must be
/// sound under either runtime resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tri {
    Absent,
    Present,
    Deferred,
}

impl Tri {
    /// True only when the right is statically guaranteed.
    pub fn guaranteed(&self) -> bool {
        matches!(self, Tri::Present)
    }

    /// True when the right might be held at runtime.
    pub fn possible(&self) -> bool {
        !matches!(self, Tri::Absent)
    }
}

/// The full right set of a capability. Plain booleans except
/// exclusive-identity, which is three-valued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rights {
    pub read: bool,
    pub write: bool,
    pub identity: bool,
    pub exclusive_read: bool,
    pub exclusive_write: bool,
    pub exclusive_identity: Tri,
}

impl Rights {
    pub fn has(&self, right: Right) -> bool {
        match right {
            Right::Read => self.read,
            Right::Write => self.write,
            Right::Identity => self.identity,
            Right::ExclusiveRead => self.exclusive_read,
            Right::ExclusiveWrite => self.exclusive_write,
            Right::ExclusiveIdentity => self.exclusive_identity.guaranteed(),
        }
    }

    /// True when this set guarantees every right the other set carries.
    /// A `Deferred` exclusive-identity never satisfies a required
    /// `Present`, since the runtime outcome may go either way.
    pub fn covers(&self, other: &Rights) -> bool {
        (!other.read || self.read)
            && (!other.write || self.write)
            && (!other.identity || self.identity)
            && (!other.exclusive_read || self.exclusive_read)
            && (!other.exclusive_write || self.exclusive_write)
            && (!other.exclusive_identity.guaranteed()
                || self.exclusive_identity.guaranteed())
    }

    fn intersect(&self, other: &Rights) -> Rights {
        Rights {
            read: self.read && other.read,
            write: self.write && other.write,
            identity: self.identity && other.identity,
            exclusive_read: self.exclusive_read && other.exclusive_read,
            exclusive_write: self.exclusive_write && other.exclusive_write,
            exclusive_identity: match (self.exclusive_identity, other.exclusive_identity) {
                (Tri::Present, Tri::Present) => Tri::Present,
                (Tri::Absent, _) | (_, Tri::Absent) => Tri::Absent,
                _ => Tri::Deferred,
            },
        }
    }
}

/// The right set of a named capability.
pub fn rights_of(cap: Capability) -> Rights {
    match cap {
        Capability::Isolated => Rights {
            read: true,
            write: true,
            identity: true,
            exclusive_read: true,
            exclusive_write: true,
            exclusive_identity: Tri::Present,
        },
        // An isolated reference that has been aliased: the destruction
        // obligation survives, exclusivity of identity is deferred to
        // runtime, all other exclusivity is gone.
        Capability::Owned => Rights {
            read: true,
            write: true,
            identity: true,
            exclusive_read: false,
            exclusive_write: false,
            exclusive_identity: Tri::Deferred,
        },
        Capability::MutableExclusive => Rights {
            read: true,
            write: true,
            identity: true,
            exclusive_read: true,
            exclusive_write: true,
            exclusive_identity: Tri::Absent,
        },
        Capability::SharedRead => Rights {
            read: true,
            write: false,
            identity: false,
            exclusive_read: false,
            exclusive_write: false,
            exclusive_identity: Tri::Absent,
        },
        Capability::Frozen => Rights {
            read: true,
            write: false,
            identity: false,
            exclusive_read: false,
            exclusive_write: true,
            exclusive_identity: Tri::Absent,
        },
        Capability::IdentityOnly => Rights {
            read: false,
            write: false,
            identity: true,
            exclusive_read: false,
            exclusive_write: false,
            exclusive_identity: Tri::Absent,
        },
    }
}

/// Subtyping: `a` may be used where `b` is required iff `a` guarantees
/// every right of `b`. Only the named capabilities take part; arbitrary
/// right sets are not capabilities.
pub fn is_subtype(a: Capability, b: Capability) -> bool {
    rights_of(a).covers(&rights_of(b))
}

/// Preference order when several named capabilities fit a right-set
/// intersection: the one carrying the most rights wins, read access
/// preferred over bare identity.
const JOIN_ORDER: [Capability; 6] = [
    Capability::Isolated,
    Capability::MutableExclusive,
    Capability::Owned,
    Capability::Frozen,
    Capability::SharedRead,
    Capability::IdentityOnly,
];

/// Least upper bound used at control-flow merge points: the strongest
/// named capability whose rights both sides guarantee. `None` when the
/// sides have no usable right in common (the flow layer treats that as
/// invalid).
pub fn join(a: Capability, b: Capability) -> Option<Capability> {
    if a == b {
        return Some(a);
    }
    let meet = rights_of(a).intersect(&rights_of(b));
    JOIN_ORDER
        .into_iter()
        .find(|&cand| meet.covers(&rights_of(cand)))
}

/// Capability of a field of capability `inner` accessed through a
/// reference of capability `outer`.
pub fn combine_viewpoint(outer: Capability, inner: Capability) -> Capability {
    match outer {
        // A frozen reference freezes everything it reaches.
        Capability::Frozen => Capability::Frozen,
        // Identity-only grants no access to the field at all beyond
        // identity.
        Capability::IdentityOnly => Capability::IdentityOnly,
        // A read-only view never hands out write access, but cannot
        // weaken permanently-immutable or identity-only fields further.
        Capability::SharedRead => match inner {
            Capability::Frozen => Capability::Frozen,
            Capability::IdentityOnly => Capability::IdentityOnly,
            _ => Capability::SharedRead,
        },
        // Writable paths pass the field capability through, except that
        // an isolated field reached through a reference is by that very
        // access aliased, so it weakens to owned-but-shared.
        Capability::Isolated | Capability::Owned | Capability::MutableExclusive => match inner {
            Capability::Isolated => Capability::Owned,
            other => other,
        },
    }
}

/// Internal sanity check: exclusive-identity together with any other
/// exclusivity is only meaningful on `isolated`. Tripping this is a
/// checker bug, never a user diagnostic.
pub fn assert_legal(cap: Capability) {
    let r = rights_of(cap);
    if r.exclusive_identity.guaranteed()
        && (r.exclusive_read || r.exclusive_write)
        && cap != Capability::Isolated
    {
        panic!(
            "illegal right combination reified for capability `{}`",
            cap.display()
        );
    }
}
