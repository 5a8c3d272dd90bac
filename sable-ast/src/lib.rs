#![forbid(unsafe_code)]

use std::collections::HashMap;

use miette::SourceSpan;

pub type Span = SourceSpan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(span: Span, node: T) -> Self {
        Self { span, node }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            span: self.span,
            node: f(self.node),
        }
    }
}

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

pub type Ident = Spanned<String>;

pub fn ident(start: usize, name: &str) -> Ident {
    Spanned::new(span(start, name.len()), name.to_string())
}

/// Identifier for a binding (local, parameter, field, or container
/// element) assigned by the checker while it walks the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(pub u32);

/// Identifier for a region (the reachable subgraph of a reference).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionId(pub u32);

/// Identifier carried by annotatable tree nodes (declarations and
/// expressions). Assigned by the front end that produces the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Hands out fresh node ids for front ends and tests building trees.
#[derive(Debug, Default)]
pub struct NodeIdGen {
    next: u32,
}

impl NodeIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;
        id
    }
}

/// The named reference capabilities. These are the only capabilities
/// that may appear in source; arbitrary right combinations are not
/// expressible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Sole reference to its reachable subgraph. All rights, all
    /// exclusivities. Bottom of the lattice.
    Isolated,
    /// Owned-but-shared: what an isolated reference weakens to once it
    /// has been aliased. Keeps the destruction obligation; uniqueness
    /// of identity is deferred to runtime.
    Owned,
    /// Writable with exclusive read and write, but identity may be
    /// compared against other references.
    MutableExclusive,
    /// Read access only, other readers and writers may exist.
    SharedRead,
    /// Permanently read-only; no writer can ever exist again.
    Frozen,
    /// Identity comparison only. Universally compatible fallback.
    IdentityOnly,
}

impl Capability {
    pub fn display(&self) -> &'static str {
        match self {
            Capability::Isolated => "isolated",
            Capability::Owned => "owned",
            Capability::MutableExclusive => "mutable-exclusive",
            Capability::SharedRead => "shared-read",
            Capability::Frozen => "frozen",
            Capability::IdentityOnly => "identity-only",
        }
    }

    pub const ALL: [Capability; 6] = [
        Capability::Isolated,
        Capability::Owned,
        Capability::MutableExclusive,
        Capability::SharedRead,
        Capability::Frozen,
        Capability::IdentityOnly,
    ];
}

/// Declared variance of an ordinary generic parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variance {
    Covariant,
    Contravariant,
    Invariant,
    /// Covariant while the instance is read-only, invariant while it is
    /// mutable.
    ReadOnlyCovariant,
}

impl Variance {
    pub fn display(&self) -> &'static str {
        match self {
            Variance::Covariant => "covariant",
            Variance::Contravariant => "contravariant",
            Variance::Invariant => "invariant",
            Variance::ReadOnlyCovariant => "read-only-covariant",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub types: Vec<TypeDef>,
    pub funcs: Vec<FuncDef>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeDef {
    pub span: Span,
    pub name: Ident,
    pub params: Vec<TypeParam>,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodSig>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeParam {
    pub span: Span,
    pub name: Ident,
    /// Variance annotation for ordinary parameters. Independent
    /// parameters carry no variance; their capability is never part of
    /// the container's type.
    pub variance: Option<Variance>,
    pub independent: bool,
    /// Optional capability bound restricting what capabilities the
    /// argument may take.
    pub constraint: Option<CapConstraint>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CapConstraint {
    pub span: Span,
    pub allowed: Vec<Capability>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDef {
    pub span: Span,
    pub name: Ident,
    pub mutable: bool,
    pub ty: TypeExpr,
}

/// A method signature. Bodies are not part of a type definition; the
/// declaration passes only need the signature shapes.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodSig {
    pub span: Span,
    pub name: Ident,
    pub self_cap: Capability,
    pub params: Vec<ParamDecl>,
    pub ret: Option<TypeExpr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParamDecl {
    pub span: Span,
    pub name: Ident,
    pub ty: TypeExpr,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TypeExpr {
    Named {
        span: Span,
        name: Ident,
        cap: Option<Capability>,
        args: Vec<TypeExpr>,
    },
    /// A callback type. Parameter types are input positions, the return
    /// type is an output position.
    Fn {
        span: Span,
        params: Vec<TypeExpr>,
        ret: Option<Box<TypeExpr>>,
    },
}

impl TypeExpr {
    pub fn span(&self) -> Span {
        match self {
            TypeExpr::Named { span, .. } | TypeExpr::Fn { span, .. } => *span,
        }
    }

    pub fn named(start: usize, name: &str) -> Self {
        TypeExpr::Named {
            span: span(start, name.len()),
            name: ident(start, name),
            cap: None,
            args: Vec::new(),
        }
    }

    pub fn with_cap(self, cap: Capability) -> Self {
        match self {
            TypeExpr::Named {
                span, name, args, ..
            } => TypeExpr::Named {
                span,
                name,
                cap: Some(cap),
                args,
            },
            other => other,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FuncDef {
    pub span: Span,
    pub name: Ident,
    pub params: Vec<ParamDecl>,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub span: Span,
    pub stmts: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Declare(DeclareStmt),
    Assign(AssignStmt),
    Use(UseStmt),
    Call(CallStmt),
    Freeze(FreezeStmt),
    Recover(RecoverStmt),
    ContainerOp(ContainerOpStmt),
    If(IfStmt),
    While(WhileStmt),
    Scope(Block),
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeclareStmt {
    pub span: Span,
    pub id: NodeId,
    pub name: Ident,
    pub cap: Option<Capability>,
    pub ty: Option<TypeExpr>,
    pub init: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssignStmt {
    pub span: Span,
    pub target: Ident,
    pub expr: Expr,
}

/// How a binding is touched by a plain use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UseKind {
    Read,
    Write,
    Identity,
}

impl UseKind {
    pub fn display(&self) -> &'static str {
        match self {
            UseKind::Read => "read",
            UseKind::Write => "write",
            UseKind::Identity => "identity-compare",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UseStmt {
    pub span: Span,
    pub target: Ident,
    pub kind: UseKind,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallStmt {
    pub span: Span,
    pub callee: Ident,
    pub args: Vec<Ident>,
}

/// Target of a freeze or recover-isolation operation: either a plain
/// binding or a named element handle of a container.
#[derive(Clone, Debug, PartialEq)]
pub enum CapTarget {
    Binding(Ident),
    Element { container: Ident, index: usize },
}

impl CapTarget {
    pub fn span(&self) -> Span {
        match self {
            CapTarget::Binding(name) => name.span,
            CapTarget::Element { container, .. } => container.span,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FreezeStmt {
    pub span: Span,
    pub target: CapTarget,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecoverStmt {
    pub span: Span,
    pub target: CapTarget,
    /// When present, the recovered isolated value is bound to this
    /// fresh name and the source binding is invalidated.
    pub into: Option<(NodeId, Ident)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ContainerOpStmt {
    pub span: Span,
    pub container: Ident,
    pub op: ContainerOp,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ContainerOp {
    /// Store a binding as a new element. The first add fixes the
    /// container's ownership flag.
    Add { element: Ident },
    /// Remove an element, binding it to a fresh name.
    Take { index: usize, into: (NodeId, Ident) },
    /// Remove and destroy an element.
    Discard { index: usize },
    /// Discard and add, atomically.
    Replace { index: usize, with: Ident },
    /// Produce an alias of an element without removing it. The alias
    /// may request an explicitly weaker capability than the container
    /// view would give.
    Alias {
        index: usize,
        into: (NodeId, Ident),
        cap: Option<Capability>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfStmt {
    pub span: Span,
    pub then_block: Block,
    pub else_block: Option<Block>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhileStmt {
    pub span: Span,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub span: Span,
    pub id: NodeId,
    pub kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    /// A freshly allocated object. Always isolated.
    New(TypeExpr),
    /// A non-consuming read of a binding's value.
    Use(Ident),
    /// A new reference to the same object: unions sharing sets and may
    /// weaken the source.
    Alias(Ident),
    /// Transfer of the reference: the source becomes invalid.
    Move(Ident),
    /// A field read through a reference; the result capability is the
    /// viewpoint adaptation of the base's capability over the field's.
    Field { base: Ident, field: Ident },
}

/// Inferred capabilities keyed by node id, written back on success so a
/// downstream consumer can read the capability at every binding and
/// expression.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Annotations {
    pub caps: HashMap<NodeId, Capability>,
}

impl Annotations {
    pub fn record(&mut self, id: NodeId, cap: Capability) {
        self.caps.insert(id, cap);
    }

    pub fn get(&self, id: NodeId) -> Option<Capability> {
        self.caps.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }
}
