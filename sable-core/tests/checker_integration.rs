//! End-to-end runs of the checker over whole programs: container
//! ownership, element aliasing, freezing across sharing sets, and the
//! declaration-time passes.

use sable_ast::{
    ident, span, Block, CapTarget, Capability, ContainerOp, ContainerOpStmt, DeclareStmt, Expr,
    ExprKind, FreezeStmt, FuncDef, NodeId, NodeIdGen, ParamDecl, Program, RecoverStmt, Stmt,
    TypeDef, TypeExpr, TypeParam, UseKind, UseStmt,
};
use sable_core::{check_program, CheckOutcome, CheckerOptions, ErrorKind, Severity};

struct Builder {
    ids: NodeIdGen,
    at: usize,
}

impl Builder {
    fn new() -> Self {
        Builder {
            ids: NodeIdGen::new(),
            at: 0,
        }
    }

    /// Each statement gets a fresh, strictly increasing offset so
    /// diagnostics sort deterministically.
    fn here(&mut self) -> usize {
        self.at += 10;
        self.at
    }

    fn fresh(&mut self) -> NodeId {
        self.ids.fresh()
    }

    fn new_expr(&mut self, ty: &str) -> Expr {
        let at = self.here();
        Expr {
            span: span(at, 3),
            id: self.fresh(),
            kind: ExprKind::New(TypeExpr::named(at, ty)),
        }
    }

    fn declare(&mut self, name: &str, cap: Option<Capability>, ty: Option<&str>, init: Expr) -> Stmt {
        let at = self.here();
        Stmt::Declare(DeclareStmt {
            span: span(at, name.len()),
            id: self.fresh(),
            name: ident(at, name),
            cap,
            ty: ty.map(|t| TypeExpr::named(at, t)),
            init: Some(init),
        })
    }

    fn add(&mut self, container: &str, element: &str) -> Stmt {
        let at = self.here();
        Stmt::ContainerOp(ContainerOpStmt {
            span: span(at, container.len()),
            container: ident(at, container),
            op: ContainerOp::Add {
                element: ident(at, element),
            },
        })
    }

    fn alias_element(
        &mut self,
        container: &str,
        index: usize,
        into: &str,
        cap: Option<Capability>,
    ) -> Stmt {
        let at = self.here();
        Stmt::ContainerOp(ContainerOpStmt {
            span: span(at, container.len()),
            container: ident(at, container),
            op: ContainerOp::Alias {
                index,
                into: (self.fresh(), ident(at, into)),
                cap,
            },
        })
    }

    fn discard(&mut self, container: &str, index: usize) -> Stmt {
        let at = self.here();
        Stmt::ContainerOp(ContainerOpStmt {
            span: span(at, container.len()),
            container: ident(at, container),
            op: ContainerOp::Discard { index },
        })
    }

    fn take(&mut self, container: &str, index: usize, into: &str) -> Stmt {
        let at = self.here();
        Stmt::ContainerOp(ContainerOpStmt {
            span: span(at, container.len()),
            container: ident(at, container),
            op: ContainerOp::Take {
                index,
                into: (self.fresh(), ident(at, into)),
            },
        })
    }

    fn freeze(&mut self, target: CapTarget) -> Stmt {
        let at = self.here();
        Stmt::Freeze(FreezeStmt {
            span: span(at, 6),
            target,
        })
    }

    fn recover_element(&mut self, container: &str, index: usize) -> Stmt {
        let at = self.here();
        Stmt::Recover(RecoverStmt {
            span: span(at, 7),
            target: CapTarget::Element {
                container: ident(at, container),
                index,
            },
            into: None,
        })
    }

    fn use_stmt(&mut self, name: &str, kind: UseKind) -> Stmt {
        let at = self.here();
        Stmt::Use(UseStmt {
            span: span(at, name.len()),
            target: ident(at, name),
            kind,
        })
    }

    fn scope(&mut self, stmts: Vec<Stmt>) -> Stmt {
        let at = self.here();
        Stmt::Scope(Block {
            span: span(at, 1),
            stmts,
        })
    }
}

/// A container type over one independent element parameter.
fn box_type() -> TypeDef {
    TypeDef {
        span: span(0, 3),
        name: ident(0, "Box"),
        params: vec![TypeParam {
            span: span(4, 1),
            name: ident(4, "T"),
            variance: None,
            independent: true,
            constraint: None,
        }],
        fields: Vec::new(),
        methods: Vec::new(),
    }
}

/// A plain payload type with no parameters.
fn cell_type() -> TypeDef {
    TypeDef {
        span: span(0, 4),
        name: ident(0, "Cell"),
        params: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
    }
}

fn program(types: Vec<TypeDef>, stmts: Vec<Stmt>) -> Program {
    Program {
        types,
        funcs: vec![FuncDef {
            span: span(0, 4),
            name: ident(0, "main"),
            params: Vec::new(),
            body: Block {
                span: span(0, 0),
                stmts,
            },
        }],
    }
}

fn check(program: &Program) -> CheckOutcome {
    check_program(program, CheckerOptions::default())
}

fn error_kinds(outcome: &CheckOutcome) -> Vec<ErrorKind> {
    outcome
        .diagnostics()
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.kind)
        .collect()
}

#[test]
fn test_freeze_container_with_read_alias_of_element() {
    // An isolated box holding one owned element. A read-only alias of
    // the element does not stop the freeze, and afterwards both the
    // box and the alias read fine.
    let mut b = Builder::new();
    let stmts = vec![
        {
            let init = b.new_expr("Box");
            b.declare("bx", Some(Capability::Isolated), Some("Box"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e", None, Some("Cell"), init)
        },
        b.add("bx", "e"),
        b.alias_element("bx", 0, "r", Some(Capability::SharedRead)),
        b.freeze(CapTarget::Binding(ident(500, "bx"))),
        b.use_stmt("r", UseKind::Read),
        b.use_stmt("bx", UseKind::Read),
    ];
    let outcome = check(&program(vec![box_type(), cell_type()], stmts));
    assert!(outcome.is_ok(), "{:?}", outcome.diagnostics());
}

#[test]
fn test_frozen_container_rejects_writes() {
    let mut b = Builder::new();
    let stmts = vec![
        {
            let init = b.new_expr("Box");
            b.declare("bx", Some(Capability::Isolated), Some("Box"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e", None, Some("Cell"), init)
        },
        b.add("bx", "e"),
        b.freeze(CapTarget::Binding(ident(500, "bx"))),
        b.use_stmt("bx", UseKind::Write),
    ];
    let outcome = check(&program(vec![box_type(), cell_type()], stmts));
    assert_eq!(error_kinds(&outcome), vec![ErrorKind::CapabilityMismatch]);
}

#[test]
fn test_freeze_blocked_by_writing_alias_of_element() {
    // An element alias with no requested capability keeps the owned
    // (writable) view, which blocks the freeze.
    let mut b = Builder::new();
    let stmts = vec![
        {
            let init = b.new_expr("Box");
            b.declare("bx", Some(Capability::Isolated), Some("Box"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e", None, Some("Cell"), init)
        },
        b.add("bx", "e"),
        b.alias_element("bx", 0, "w", None),
        b.freeze(CapTarget::Binding(ident(500, "bx"))),
    ];
    let outcome = check(&program(vec![box_type(), cell_type()], stmts));
    assert_eq!(error_kinds(&outcome), vec![ErrorKind::SharingViolation]);
}

#[test]
fn test_freeze_element_under_live_container_rejected() {
    // Freezing one element while the container binding is still live
    // and writable would let the container discard the frozen value;
    // the container itself counts as a blocking writer.
    let mut b = Builder::new();
    let stmts = vec![
        {
            let init = b.new_expr("Box");
            b.declare("bx", Some(Capability::Isolated), Some("Box"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e", None, Some("Cell"), init)
        },
        b.add("bx", "e"),
        b.freeze(CapTarget::Element {
            container: ident(500, "bx"),
            index: 0,
        }),
        b.discard("bx", 0),
    ];
    let outcome = check(&program(vec![box_type(), cell_type()], stmts));
    assert_eq!(error_kinds(&outcome), vec![ErrorKind::SharingViolation]);
}

#[test]
fn test_element_alias_cannot_request_stronger_view() {
    // An owned element can hand out an owned or weaker view; asking
    // for isolation is rejected rather than quietly lowered.
    let mut b = Builder::new();
    let stmts = vec![
        {
            let init = b.new_expr("Box");
            b.declare("bx", Some(Capability::Isolated), Some("Box"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e", None, Some("Cell"), init)
        },
        b.add("bx", "e"),
        b.alias_element("bx", 0, "grab", Some(Capability::Isolated)),
    ];
    let outcome = check(&program(vec![box_type(), cell_type()], stmts));
    assert_eq!(error_kinds(&outcome), vec![ErrorKind::CapabilityMismatch]);
}

#[test]
fn test_freeze_container_twice_is_idempotent() {
    let mut b = Builder::new();
    let stmts = vec![
        {
            let init = b.new_expr("Box");
            b.declare("bx", Some(Capability::Isolated), Some("Box"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e", None, Some("Cell"), init)
        },
        b.add("bx", "e"),
        b.freeze(CapTarget::Binding(ident(500, "bx"))),
        b.freeze(CapTarget::Binding(ident(510, "bx"))),
        b.use_stmt("bx", UseKind::Read),
    ];
    let outcome = check(&program(vec![box_type(), cell_type()], stmts));
    assert!(outcome.is_ok(), "{:?}", outcome.diagnostics());
}

#[test]
fn test_stored_callback_over_independent_param_is_illegal() {
    // Storing a callback that takes the independent element as input
    // would pin the element's capability in the container type; the
    // declaration itself is rejected.
    let container = TypeDef {
        span: span(0, 3),
        name: ident(0, "Hub"),
        params: vec![TypeParam {
            span: span(4, 1),
            name: ident(4, "T"),
            variance: None,
            independent: true,
            constraint: None,
        }],
        fields: vec![sable_ast::FieldDef {
            span: span(10, 8),
            name: ident(10, "callback"),
            mutable: false,
            ty: TypeExpr::Fn {
                span: span(10, 8),
                params: vec![TypeExpr::named(12, "T")],
                ret: None,
            },
        }],
        methods: Vec::new(),
    };
    let outcome = check(&program(vec![container], Vec::new()));
    assert_eq!(error_kinds(&outcome), vec![ErrorKind::IllegalReification]);
}

#[test]
fn test_recover_element_blocked_by_alias_of_sibling() {
    // Recovering element 1 needs the whole family quiescent: a live
    // alias of element 0 still reaches the container's subgraph.
    let mut b = Builder::new();
    let stmts = vec![
        {
            let init = b.new_expr("Box");
            b.declare("bx", Some(Capability::Isolated), Some("Box"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e1", None, Some("Cell"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e2", None, Some("Cell"), init)
        },
        b.add("bx", "e1"),
        b.add("bx", "e2"),
        b.alias_element("bx", 0, "r0", Some(Capability::SharedRead)),
        b.recover_element("bx", 1),
    ];
    let outcome = check(&program(vec![box_type(), cell_type()], stmts));
    assert_eq!(error_kinds(&outcome), vec![ErrorKind::SharingViolation]);
}

#[test]
fn test_recover_element_succeeds_after_alias_dies() {
    let mut b = Builder::new();
    let alias_scope = {
        let alias = b.alias_element("bx", 0, "r0", Some(Capability::SharedRead));
        let read = b.use_stmt("r0", UseKind::Read);
        b.scope(vec![alias, read])
    };
    let stmts = vec![
        {
            let init = b.new_expr("Box");
            b.declare("bx", Some(Capability::Isolated), Some("Box"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e1", None, Some("Cell"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e2", None, Some("Cell"), init)
        },
        b.add("bx", "e1"),
        b.add("bx", "e2"),
        alias_scope,
        b.recover_element("bx", 1),
    ];
    let outcome = check(&program(vec![box_type(), cell_type()], stmts));
    assert!(outcome.is_ok(), "{:?}", outcome.diagnostics());
}

#[test]
fn test_discard_blocked_then_allowed_after_alias_dies() {
    // Destroying an owned element is only legal once nothing else can
    // reach it.
    let mut b = Builder::new();
    let blocked = {
        let stmts = vec![
            {
                let init = b.new_expr("Box");
                b.declare("bx", Some(Capability::Isolated), Some("Box"), init)
            },
            {
                let init = b.new_expr("Cell");
                b.declare("e", None, Some("Cell"), init)
            },
            b.add("bx", "e"),
            b.alias_element("bx", 0, "r", Some(Capability::SharedRead)),
            b.discard("bx", 0),
        ];
        check(&program(vec![box_type(), cell_type()], stmts))
    };
    assert_eq!(error_kinds(&blocked), vec![ErrorKind::SharingViolation]);

    let mut b = Builder::new();
    let alias_scope = {
        let alias = b.alias_element("bx", 0, "r", Some(Capability::SharedRead));
        b.scope(vec![alias])
    };
    let allowed = {
        let stmts = vec![
            {
                let init = b.new_expr("Box");
                b.declare("bx", Some(Capability::Isolated), Some("Box"), init)
            },
            {
                let init = b.new_expr("Cell");
                b.declare("e", None, Some("Cell"), init)
            },
            b.add("bx", "e"),
            alias_scope,
            b.discard("bx", 0),
        ];
        check(&program(vec![box_type(), cell_type()], stmts))
    };
    assert!(allowed.is_ok(), "{:?}", allowed.diagnostics());
}

#[test]
fn test_take_from_owned_container_restores_isolation() {
    // With no outstanding aliases, taking the element back out of an
    // owned container yields an isolated binding again.
    let mut b = Builder::new();
    let stmts = vec![
        {
            let init = b.new_expr("Box");
            b.declare("bx", Some(Capability::Isolated), Some("Box"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e", None, Some("Cell"), init)
        },
        b.add("bx", "e"),
        b.take("bx", 0, "out"),
        b.use_stmt("out", UseKind::Write),
        // The slot is gone; touching it again is an error.
        b.discard("bx", 0),
    ];
    let outcome = check(&program(vec![box_type(), cell_type()], stmts));
    assert_eq!(error_kinds(&outcome), vec![ErrorKind::UseAfterInvalidate]);
}

#[test]
fn test_add_non_isolated_to_owned_container_rejected() {
    // The first add fixed ownership from an isolated element; a later
    // add of an aliased (owned) element cannot keep that promise.
    let mut b = Builder::new();
    let alias_init = |b: &mut Builder, name: &str| {
        let at = b.at + 5;
        Expr {
            span: span(at, name.len()),
            id: b.fresh(),
            kind: ExprKind::Alias(ident(at, name)),
        }
    };
    let stmts = vec![
        {
            let init = b.new_expr("Box");
            b.declare("bx", Some(Capability::Isolated), Some("Box"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e1", None, Some("Cell"), init)
        },
        {
            let init = b.new_expr("Cell");
            b.declare("e2", None, Some("Cell"), init)
        },
        {
            let init = alias_init(&mut b, "e2");
            b.declare("shared", None, Some("Cell"), init)
        },
        b.add("bx", "e1"),
        b.add("bx", "e2"),
    ];
    let outcome = check(&program(vec![box_type(), cell_type()], stmts));
    assert_eq!(error_kinds(&outcome), vec![ErrorKind::CapabilityMismatch]);
}

#[test]
fn test_overloads_on_capability_alone_rejected() {
    let sig = |name: &str, cap: Capability| FuncDef {
        span: span(0, name.len()),
        name: ident(0, name),
        params: vec![ParamDecl {
            span: span(10, 1),
            name: ident(10, "v"),
            ty: TypeExpr::named(10, "Cell").with_cap(cap),
        }],
        body: Block {
            span: span(0, 0),
            stmts: Vec::new(),
        },
    };
    let program = Program {
        types: vec![cell_type()],
        funcs: vec![
            sig("handle", Capability::Isolated),
            sig("handle", Capability::SharedRead),
        ],
    };
    let outcome = check(&program);
    assert_eq!(error_kinds(&outcome), vec![ErrorKind::OverloadOnCapability]);
}

#[test]
fn test_annotations_written_back_on_success() {
    let mut b = Builder::new();
    let init = b.new_expr("Cell");
    let decl = b.declare("x", None, Some("Cell"), init);
    let decl_id = match &decl {
        Stmt::Declare(d) => d.id,
        _ => unreachable!(),
    };
    let outcome = check(&program(vec![cell_type()], vec![decl]));
    match outcome {
        CheckOutcome::Annotated { annotations, .. } => {
            assert_eq!(annotations.get(decl_id), Some(Capability::Isolated));
            // The initializer expression is annotated too.
            assert!(annotations.len() >= 2);
        }
        CheckOutcome::Rejected { diagnostics } => panic!("unexpected rejection: {diagnostics:?}"),
    }
}

#[test]
fn test_diagnostics_sorted_by_source_position() {
    let mut b = Builder::new();
    let stmts = vec![
        b.use_stmt("ghost_a", UseKind::Read),
        b.use_stmt("ghost_b", UseKind::Read),
    ];
    let outcome = check(&program(Vec::new(), stmts));
    let diags = outcome.diagnostics();
    assert_eq!(diags.len(), 2);
    assert!(diags[0].span.offset() < diags[1].span.offset());
    assert!(diags.iter().all(|d| d.kind == ErrorKind::UnknownBinding));
}
