#![forbid(unsafe_code)]

//! The checker driver. One `Checker` owns every table for a
//! compilation unit — bindings, regions, the sharing forest, container
//! instances, the reporter — and is threaded explicitly through the
//! walk; there is no ambient state. Declaration passes (overloads,
//! variance) run first, then flow-sensitive inference per function.

use std::collections::HashMap;

use sable_ast::{
    Annotations, AssignStmt, BindingId, Block, CallStmt, CapTarget, Capability, ContainerOp,
    ContainerOpStmt, DeclareStmt, Expr, ExprKind, FreezeStmt, FuncDef, Ident, IfStmt, Program,
    RecoverStmt, RegionId, Span, Stmt, TypeDef, TypeExpr, UseKind, UseStmt, WhileStmt,
};

use crate::error::{CheckDiagnostic, ErrorKind, Reporter, Severity};
use crate::flow::{alias_result, FlowEnv, FlowState};
use crate::independent::{ContainerTable, ContainerViolation};
use crate::lattice;
use crate::region::{Bound, RegionTable};
use crate::sharing::SharingForest;

/// Loop bodies are re-walked until the entry state stabilizes; the
/// lattice is finite, so a handful of passes always suffices.
const MAX_LOOP_PASSES: usize = 8;

#[derive(Clone, Copy, Debug)]
pub struct CheckerOptions {
    /// When set, references to unknown types, fields, and functions
    /// are diagnosed instead of skipped.
    pub strict: bool,
    /// Upper bound on recorded diagnostics per run.
    pub max_diagnostics: usize,
}

impl Default for CheckerOptions {
    fn default() -> Self {
        CheckerOptions {
            strict: false,
            max_diagnostics: 64,
        }
    }
}

/// Result of checking one compilation unit: the annotated tree, or the
/// ordered diagnostics that rejected it.
#[derive(Debug)]
pub enum CheckOutcome {
    Annotated {
        annotations: Annotations,
        /// Non-error notes (hints) gathered along the way.
        notes: Vec<CheckDiagnostic>,
    },
    Rejected {
        diagnostics: Vec<CheckDiagnostic>,
    },
}

impl CheckOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CheckOutcome::Annotated { .. })
    }

    pub fn diagnostics(&self) -> &[CheckDiagnostic] {
        match self {
            CheckOutcome::Annotated { notes, .. } => notes,
            CheckOutcome::Rejected { diagnostics } => diagnostics,
        }
    }
}

#[derive(Debug)]
struct BindingInfo {
    name: String,
    span: Span,
    region: RegionId,
    depth: u32,
    declared: Option<Capability>,
    ty_name: Option<String>,
    declared_isolated: bool,
    isolation_consumed: bool,
}

/// What evaluating an initializer or right-hand side produced.
struct Eval {
    state: FlowState,
    /// Source binding the result aliases, if any.
    alias_of: Option<BindingId>,
    /// Region the result points into; `None` means a fresh allocation.
    region_src: Option<RegionId>,
    /// Extra lifetime bound on the result (field references are bound
    /// to the scope of the base binding).
    bound: Bound,
}

impl Eval {
    fn invalid() -> Self {
        Eval {
            state: FlowState::Invalid,
            alias_of: None,
            region_src: None,
            bound: Bound::Unbounded,
        }
    }
}

pub struct Checker<'p> {
    program: &'p Program,
    options: CheckerOptions,
    types: HashMap<String, &'p TypeDef>,
    funcs: HashMap<String, &'p FuncDef>,
    bindings: Vec<BindingInfo>,
    scopes: Vec<Vec<(String, BindingId)>>,
    forest: SharingForest,
    regions: RegionTable,
    containers: ContainerTable,
    reporter: Reporter,
    annotations: Annotations,
    env: FlowEnv,
    /// Non-zero while re-walking loop bodies toward a fixed point;
    /// diagnostics are only recorded on the final pass.
    muted: u32,
}

pub fn check_program(program: &Program, options: CheckerOptions) -> CheckOutcome {
    Checker::new(program, options).run()
}

impl<'p> Checker<'p> {
    pub fn new(program: &'p Program, options: CheckerOptions) -> Self {
        let mut types = HashMap::new();
        for def in &program.types {
            types.entry(def.name.node.clone()).or_insert(def);
        }
        let mut funcs = HashMap::new();
        for func in &program.funcs {
            funcs.entry(func.name.node.clone()).or_insert(func);
        }
        Checker {
            program,
            options,
            types,
            funcs,
            bindings: Vec::new(),
            scopes: Vec::new(),
            forest: SharingForest::new(),
            regions: RegionTable::new(),
            containers: ContainerTable::new(),
            reporter: Reporter::new(),
            annotations: Annotations::default(),
            env: FlowEnv::new(),
            muted: 0,
        }
    }

    pub fn run(mut self) -> CheckOutcome {
        let program = self.program;
        crate::overloads::check_program(program, &mut self.reporter);
        crate::variance::check_program(program, &mut self.reporter);
        for func in &program.funcs {
            self.check_func(func);
        }
        if self.reporter.has_errors() {
            CheckOutcome::Rejected {
                diagnostics: self.reporter.into_sorted(),
            }
        } else {
            CheckOutcome::Annotated {
                annotations: self.annotations,
                notes: self.reporter.into_sorted(),
            }
        }
    }

    fn check_func(&mut self, func: &FuncDef) {
        self.env = FlowEnv::new();
        self.enter_scope();
        for param in &func.params {
            let cap = declared_cap_of(&param.ty).unwrap_or(Capability::SharedRead);
            let region = self.regions.alloc(Bound::Unbounded);
            let id = self.new_binding(
                param.name.node.clone(),
                param.span,
                region,
                Some(cap),
                type_name_of(&param.ty),
                FlowState::Cap(cap),
            );
            // A parameter's capability is the function's contract, not
            // something inference should second-guess.
            self.bindings[id.0 as usize].declared_isolated = false;
        }
        self.walk_block_in_place(&func.body);
        self.exit_scope();
    }

    // ---- diagnostics -------------------------------------------------

    fn emit(&mut self, diag: CheckDiagnostic) {
        if self.muted == 0 && self.reporter.diagnostics().len() < self.options.max_diagnostics {
            self.reporter.report(diag);
        }
    }

    fn sharer_names(&self, ids: &[BindingId]) -> Vec<String> {
        ids.iter()
            .map(|id| self.bindings[id.0 as usize].name.clone())
            .collect()
    }

    fn container_diag(&self, span: Span, violation: ContainerViolation) -> CheckDiagnostic {
        let kind = match &violation {
            ContainerViolation::SharingBlocked { .. } => ErrorKind::SharingViolation,
            ContainerViolation::OwnedRequiresIsolated { .. } => ErrorKind::CapabilityMismatch,
            ContainerViolation::NoSuchElement { .. } | ContainerViolation::ElementGone { .. } => {
                ErrorKind::UseAfterInvalidate
            }
            ContainerViolation::AliasNotWeaker { .. } => ErrorKind::CapabilityMismatch,
            ContainerViolation::FrozenElement { .. } => ErrorKind::SharingViolation,
        };
        let sharers = self.sharer_names(violation.blockers());
        let diag = CheckDiagnostic::new(kind, span, violation.message()).with_sharers(sharers);
        if let ContainerViolation::AliasNotWeaker { base, requested } = violation {
            diag.with_caps(base, requested)
        } else {
            diag
        }
    }

    // ---- scopes and bindings ----------------------------------------

    fn enter_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn exit_scope(&mut self) {
        let frame = self.scopes.pop().expect("scope frame");
        let ids: Vec<BindingId> = frame.iter().map(|(_, id)| *id).collect();
        for &id in &ids {
            let info = &self.bindings[id.0 as usize];
            if info.declared_isolated && !info.isolation_consumed {
                let diag = CheckDiagnostic::new(
                    ErrorKind::CapabilityMismatch,
                    info.span,
                    format!(
                        "`{}` is declared isolated but its isolation is never used; a weaker capability would do",
                        info.name
                    ),
                )
                .with_severity(Severity::Info);
                self.emit(diag);
            }
        }
        for &id in &ids {
            self.forest.retire(id);
            self.env.remove(id);
        }
        // References bound to a binding that just died are gone too.
        let live: Vec<BindingId> = self.env.ids().collect();
        for b in live {
            let region = self.bindings[b.0 as usize].region;
            if self.env.get(b).is_usable() && self.regions.bound_by_any(region, &ids) {
                self.env.set(b, FlowState::Invalid);
            }
        }
    }

    fn new_binding(
        &mut self,
        name: String,
        span: Span,
        region: RegionId,
        declared: Option<Capability>,
        ty_name: Option<String>,
        state: FlowState,
    ) -> BindingId {
        let id = BindingId(self.bindings.len() as u32);
        let exempt = matches!(
            state.cap(),
            Some(Capability::Frozen) | Some(Capability::IdentityOnly)
        );
        let declared_isolated =
            declared == Some(Capability::Isolated) && state.cap() == Some(Capability::Isolated);
        self.bindings.push(BindingInfo {
            name: name.clone(),
            span,
            region,
            depth: self.scopes.len() as u32,
            declared,
            ty_name,
            declared_isolated,
            isolation_consumed: false,
        });
        self.forest.register(id, exempt);
        self.scopes.last_mut().expect("scope frame").push((name, id));
        self.env.set(id, state);
        id
    }

    /// A binding with no source name: container element slots and
    /// recovered elements.
    fn pseudo_binding(&mut self, name: String, span: Span, state: FlowState) -> BindingId {
        let region = self.regions.alloc(Bound::Unbounded);
        self.new_binding(name, span, region, None, None, state)
    }

    fn resolve(&mut self, name: &Ident) -> Option<BindingId> {
        for frame in self.scopes.iter().rev() {
            for (n, id) in frame.iter().rev() {
                if n == &name.node {
                    return Some(*id);
                }
            }
        }
        self.emit(CheckDiagnostic::new(
            ErrorKind::UnknownBinding,
            name.span,
            format!("`{}` is not declared", name.node),
        ));
        None
    }

    /// Current capability of a binding, or a use-after-invalidate
    /// diagnostic.
    fn expect_usable(&mut self, id: BindingId, span: Span) -> Option<Capability> {
        match self.env.get(id) {
            FlowState::Cap(cap) => Some(cap),
            FlowState::Uninitialized => {
                let name = self.bindings[id.0 as usize].name.clone();
                self.emit(CheckDiagnostic::new(
                    ErrorKind::UseAfterInvalidate,
                    span,
                    format!("`{name}` is used before it is given a value"),
                ));
                None
            }
            FlowState::Invalid => {
                let name = self.bindings[id.0 as usize].name.clone();
                self.emit(CheckDiagnostic::new(
                    ErrorKind::UseAfterInvalidate,
                    span,
                    format!("`{name}` is used after it was moved or invalidated"),
                ));
                None
            }
        }
    }

    fn mark_consumed(&mut self, id: BindingId) {
        self.bindings[id.0 as usize].isolation_consumed = true;
    }

    fn is_writer(env: &FlowEnv, id: BindingId) -> bool {
        env.get(id)
            .cap()
            .map(|c| lattice::rights_of(c).write)
            .unwrap_or(false)
    }

    // ---- statement walk ---------------------------------------------

    fn walk_block_in_place(&mut self, block: &Block) {
        for stmt in &block.stmts {
            self.walk_stmt(stmt);
        }
    }

    fn walk_block(&mut self, block: &Block) {
        self.enter_scope();
        self.walk_block_in_place(block);
        self.exit_scope();
    }

    fn walk_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Declare(decl) => self.walk_declare(decl),
            Stmt::Assign(assign) => self.walk_assign(assign),
            Stmt::Use(use_stmt) => self.walk_use(use_stmt),
            Stmt::Call(call) => self.walk_call(call),
            Stmt::Freeze(freeze) => self.walk_freeze(freeze),
            Stmt::Recover(recover) => self.walk_recover(recover),
            Stmt::ContainerOp(op) => self.walk_container_op(op),
            Stmt::If(if_stmt) => self.walk_if(if_stmt),
            Stmt::While(while_stmt) => self.walk_while(while_stmt),
            Stmt::Scope(block) => self.walk_block(block),
        }
    }

    fn walk_declare(&mut self, decl: &DeclareStmt) {
        let eval = match &decl.init {
            Some(expr) => self.eval_expr(expr),
            None => Eval {
                state: FlowState::Uninitialized,
                alias_of: None,
                region_src: None,
                bound: Bound::Unbounded,
            },
        };

        let state = self.coerce_to_declared(eval.state, decl.cap, decl.span);

        let region = match (eval.region_src, eval.alias_of) {
            // A move takes the source's region over wholesale.
            (Some(src_region), None) => src_region,
            (Some(src_region), Some(_)) => {
                let r = self.regions.alloc(eval.bound);
                self.regions.connect(r, src_region);
                r
            }
            (None, _) => self.regions.alloc(eval.bound),
        };

        let ty_name = decl.ty.as_ref().and_then(type_name_of);
        let id = self.new_binding(
            decl.name.node.clone(),
            decl.span,
            region,
            decl.cap,
            ty_name.clone(),
            state,
        );

        if let Some(src) = eval.alias_of {
            self.forest.alias(id, src);
        }

        if let Some(name) = &ty_name {
            if let Some(def) = self.types.get(name.as_str()) {
                if def.params.iter().any(|p| p.independent) {
                    self.containers.declare(id);
                }
            }
        }

        if let FlowState::Cap(cap) = state {
            self.annotations.record(decl.id, cap);
        }
    }

    /// Narrow an initializer's capability to the declared one, or
    /// poison the binding on a mismatch. Checking continues with the
    /// invalid state to surface follow-on problems.
    fn coerce_to_declared(
        &mut self,
        state: FlowState,
        declared: Option<Capability>,
        span: Span,
    ) -> FlowState {
        let Some(required) = declared else {
            return state;
        };
        match state {
            FlowState::Cap(observed) if lattice::is_subtype(observed, required) => {
                FlowState::Cap(required)
            }
            FlowState::Cap(observed) => {
                self.emit(
                    CheckDiagnostic::new(
                        ErrorKind::CapabilityMismatch,
                        span,
                        format!(
                            "initializer has capability `{}` but `{}` is required",
                            observed.display(),
                            required.display()
                        ),
                    )
                    .with_caps(observed, required),
                );
                FlowState::Invalid
            }
            other => other,
        }
    }

    fn walk_assign(&mut self, assign: &AssignStmt) {
        let Some(target) = self.resolve(&assign.target) else {
            return;
        };
        match self.env.get(target) {
            // First assignment initializes.
            FlowState::Uninitialized => {}
            FlowState::Invalid => {
                self.expect_usable(target, assign.span);
                return;
            }
            FlowState::Cap(cap) => {
                if !lattice::rights_of(cap).write {
                    self.emit(
                        CheckDiagnostic::new(
                            ErrorKind::CapabilityMismatch,
                            assign.span,
                            format!(
                                "cannot assign through `{}`: `{}` grants no write right",
                                assign.target.node,
                                cap.display()
                            ),
                        )
                        .with_caps(cap, Capability::MutableExclusive),
                    );
                    return;
                }
            }
        }
        let eval = self.eval_expr(&assign.expr);
        let declared = self.bindings[target.0 as usize].declared;
        let state = self.coerce_to_declared(eval.state, declared, assign.span);
        if let Some(src) = eval.alias_of {
            self.forest.alias(target, src);
        }
        if let Some(src_region) = eval.region_src {
            let region = self.bindings[target.0 as usize].region;
            // Route through a node carrying the result's bound so a
            // scope-bound field reference stays bound after the
            // assignment.
            let via = self.regions.alloc(eval.bound);
            self.regions.connect(region, via);
            self.regions.connect(via, src_region);
        }
        // A binding that now holds a frozen or identity-only reference
        // can no longer break isolation or induce sharing.
        if matches!(
            state.cap(),
            Some(Capability::Frozen) | Some(Capability::IdentityOnly)
        ) {
            self.forest.retire(target);
        }
        self.env.set(target, state);
    }

    fn walk_use(&mut self, use_stmt: &UseStmt) {
        let Some(id) = self.resolve(&use_stmt.target) else {
            return;
        };
        let Some(cap) = self.expect_usable(id, use_stmt.span) else {
            return;
        };
        let state = self.env.get(id);
        if !state.allows(use_stmt.kind) {
            let required = match use_stmt.kind {
                UseKind::Read => Capability::SharedRead,
                UseKind::Write => Capability::MutableExclusive,
                UseKind::Identity => Capability::IdentityOnly,
            };
            self.emit(
                CheckDiagnostic::new(
                    ErrorKind::CapabilityMismatch,
                    use_stmt.span,
                    format!(
                        "cannot {} `{}` through capability `{}`",
                        use_stmt.kind.display(),
                        use_stmt.target.node,
                        cap.display()
                    ),
                )
                .with_caps(cap, required),
            );
        }
    }

    fn walk_call(&mut self, call: &CallStmt) {
        let Some(func) = self.funcs.get(call.callee.node.as_str()).copied() else {
            if self.options.strict {
                self.emit(CheckDiagnostic::new(
                    ErrorKind::UnknownBinding,
                    call.callee.span,
                    format!("call to unknown function `{}`", call.callee.node),
                ));
            }
            return;
        };
        for (arg, param) in call.args.iter().zip(&func.params) {
            let Some(id) = self.resolve(arg) else {
                continue;
            };
            let Some(observed) = self.expect_usable(id, arg.span) else {
                continue;
            };
            let required = declared_cap_of(&param.ty).unwrap_or(Capability::SharedRead);
            if !lattice::is_subtype(observed, required) {
                self.emit(
                    CheckDiagnostic::new(
                        ErrorKind::CapabilityMismatch,
                        arg.span,
                        format!(
                            "argument `{}` has capability `{}` but `{}` requires `{}`",
                            arg.node,
                            observed.display(),
                            call.callee.node,
                            required.display()
                        ),
                    )
                    .with_caps(observed, required),
                );
                continue;
            }
            // Passing isolation transfers it: the argument is moved.
            if required == Capability::Isolated {
                self.forest.retire(id);
                self.env.set(id, FlowState::Invalid);
                self.mark_consumed(id);
            }
        }
    }

    fn walk_freeze(&mut self, freeze: &FreezeStmt) {
        match &freeze.target {
            CapTarget::Binding(name) => {
                let Some(id) = self.resolve(name) else {
                    return;
                };
                if self.containers.is_container(id) {
                    self.freeze_container(id, freeze.span);
                    return;
                }
                // Freezing an already-frozen binding is a no-op.
                if self.env.get(id).cap() == Some(Capability::Frozen) {
                    return;
                }
                if self.expect_usable(id, freeze.span).is_none() {
                    return;
                }
                let env = &self.env;
                if !self.forest.can_freeze(id, |m| Self::is_writer(env, m)) {
                    let writers: Vec<BindingId> = {
                        let env = &self.env;
                        self.forest
                            .live_others(id)
                            .into_iter()
                            .filter(|&m| Self::is_writer(env, m))
                            .collect()
                    };
                    let sharers = self.sharer_names(&writers);
                    self.emit(
                        CheckDiagnostic::new(
                            ErrorKind::SharingViolation,
                            freeze.span,
                            format!(
                                "cannot freeze `{}`: its sharing set still has writers",
                                name.node
                            ),
                        )
                        .with_sharers(sharers),
                    );
                    return;
                }
                let members = self.forest.freeze_component(id);
                for m in members {
                    self.env.set(m, FlowState::Cap(Capability::Frozen));
                }
                self.env.set(id, FlowState::Cap(Capability::Frozen));
                self.mark_consumed(id);
            }
            CapTarget::Element { container, index } => {
                let Some(c) = self.resolve(container) else {
                    return;
                };
                if !self.require_container(c, container) {
                    return;
                }
                let env = &self.env;
                let result = self.containers.freeze_element(c, *index, &mut self.forest, |m| {
                    Self::is_writer(env, m)
                });
                match result {
                    Ok(members) => {
                        for m in members {
                            self.env.set(m, FlowState::Cap(Capability::Frozen));
                        }
                    }
                    Err(violation) => {
                        let diag = self.container_diag(freeze.span, violation);
                        self.emit(diag);
                    }
                }
            }
        }
    }

    fn freeze_container(&mut self, id: BindingId, span: Span) {
        if self.env.get(id).cap() == Some(Capability::Frozen) {
            return;
        }
        if self.expect_usable(id, span).is_none() {
            return;
        }
        let env = &self.env;
        let result = self
            .containers
            .freeze_container(id, &mut self.forest, |m| Self::is_writer(env, m));
        match result {
            Ok(members) => {
                for m in members {
                    self.env.set(m, FlowState::Cap(Capability::Frozen));
                }
                self.mark_consumed(id);
            }
            Err(violation) => {
                let diag = self.container_diag(span, violation);
                self.emit(diag);
            }
        }
    }

    fn walk_recover(&mut self, recover: &RecoverStmt) {
        match &recover.target {
            CapTarget::Binding(name) => {
                let Some(id) = self.resolve(name) else {
                    return;
                };
                if self.expect_usable(id, recover.span).is_none() {
                    return;
                }
                // A freeze is permanent. The component was retired
                // wholesale, so the emptiness check below would pass
                // vacuously and resurrect write access.
                let frozen =
                    self.forest.is_frozen(id) || self.env.get(id).cap() == Some(Capability::Frozen);
                if frozen {
                    self.emit(CheckDiagnostic::new(
                        ErrorKind::SharingViolation,
                        recover.span,
                        format!("cannot recover isolation of `{}`: it is frozen", name.node),
                    ));
                    return;
                }
                if !self.forest.can_recover(id) {
                    let others = self.forest.live_others(id);
                    let sharers = self.sharer_names(&others);
                    self.emit(
                        CheckDiagnostic::new(
                            ErrorKind::SharingViolation,
                            recover.span,
                            format!(
                                "cannot recover isolation of `{}`: its sharing set is not empty",
                                name.node
                            ),
                        )
                        .with_sharers(sharers),
                    );
                    return;
                }
                self.mark_consumed(id);
                match &recover.into {
                    Some((node, into)) => {
                        // The recovered value moves into a fresh
                        // isolated binding; the source is dead.
                        let region = self.bindings[id.0 as usize].region;
                        self.forest.retire(id);
                        self.env.set(id, FlowState::Invalid);
                        let new = self.new_binding(
                            into.node.clone(),
                            into.span,
                            region,
                            Some(Capability::Isolated),
                            self.bindings[id.0 as usize].ty_name.clone(),
                            FlowState::Cap(Capability::Isolated),
                        );
                        self.mark_consumed(new);
                        self.annotations.record(*node, Capability::Isolated);
                    }
                    None => {
                        self.env.set(id, FlowState::Cap(Capability::Isolated));
                    }
                }
            }
            CapTarget::Element { container, index } => {
                let Some(c) = self.resolve(container) else {
                    return;
                };
                if !self.require_container(c, container) {
                    return;
                }
                let name = format!("{}[{}]", container.node, index);
                let fresh =
                    self.pseudo_binding(name, recover.span, FlowState::Cap(Capability::Isolated));
                match self.containers.recover(c, *index, &mut self.forest, fresh) {
                    Ok(old) => {
                        self.env.set(old, FlowState::Invalid);
                    }
                    Err(violation) => {
                        self.forest.retire(fresh);
                        self.env.set(fresh, FlowState::Invalid);
                        let diag = self.container_diag(recover.span, violation);
                        self.emit(diag);
                    }
                }
            }
        }
    }

    // ---- container operations ---------------------------------------

    fn require_container(&mut self, id: BindingId, name: &Ident) -> bool {
        if self.containers.is_container(id) {
            return true;
        }
        self.emit(CheckDiagnostic::new(
            ErrorKind::CapabilityMismatch,
            name.span,
            format!("`{}` is not a container with an independent element", name.node),
        ));
        false
    }

    fn require_right(
        &mut self,
        cap: Capability,
        has: bool,
        span: Span,
        what: &str,
        name: &str,
    ) -> bool {
        if has {
            return true;
        }
        self.emit(
            CheckDiagnostic::new(
                ErrorKind::CapabilityMismatch,
                span,
                format!(
                    "container `{name}` needs {what} for this operation but has `{}`",
                    cap.display()
                ),
            )
            .with_caps(cap, Capability::MutableExclusive),
        );
        false
    }

    fn walk_container_op(&mut self, op_stmt: &ContainerOpStmt) {
        let Some(c) = self.resolve(&op_stmt.container) else {
            return;
        };
        if !self.require_container(c, &op_stmt.container) {
            return;
        }
        let Some(ccap) = self.expect_usable(c, op_stmt.span) else {
            return;
        };
        let cname = op_stmt.container.node.clone();
        match &op_stmt.op {
            ContainerOp::Add { element } => {
                let rights = lattice::rights_of(ccap);
                if !self.require_right(ccap, rights.write, op_stmt.span, "write", &cname) {
                    return;
                }
                self.container_add(c, &cname, element, op_stmt.span);
            }
            ContainerOp::Take { index, into } => {
                let rights = lattice::rights_of(ccap);
                if !self.require_right(ccap, rights.exclusive_write, op_stmt.span, "exclusive-write", &cname)
                {
                    return;
                }
                match self.containers.take(c, *index, &mut self.forest) {
                    Ok((elem, cap)) => {
                        let (node, name) = into;
                        let region = self.bindings[elem.0 as usize].region;
                        let id = self.new_binding(
                            name.node.clone(),
                            name.span,
                            region,
                            None,
                            None,
                            FlowState::Cap(cap),
                        );
                        if cap != Capability::Isolated {
                            self.forest.alias(id, elem);
                        }
                        self.forest.retire(elem);
                        self.env.set(elem, FlowState::Invalid);
                        self.annotations.record(*node, cap);
                    }
                    Err(violation) => {
                        let diag = self.container_diag(op_stmt.span, violation);
                        self.emit(diag);
                    }
                }
            }
            ContainerOp::Discard { index } => {
                let rights = lattice::rights_of(ccap);
                if !self.require_right(ccap, rights.exclusive_write, op_stmt.span, "exclusive-write", &cname)
                {
                    return;
                }
                self.container_discard(c, *index, op_stmt.span);
            }
            ContainerOp::Replace { index, with } => {
                let rights = lattice::rights_of(ccap);
                if !self.require_right(ccap, rights.exclusive_write, op_stmt.span, "exclusive-write", &cname)
                {
                    return;
                }
                // Old element out first; the add only happens when the
                // discard was legal.
                if self.container_discard(c, *index, op_stmt.span) {
                    self.container_add(c, &cname, with, op_stmt.span);
                }
            }
            ContainerOp::Alias { index, into, cap } => {
                let rights = lattice::rights_of(ccap);
                if !rights.read {
                    self.emit(
                        CheckDiagnostic::new(
                            ErrorKind::CapabilityMismatch,
                            op_stmt.span,
                            format!(
                                "container `{cname}` needs read for this operation but has `{}`",
                                ccap.display()
                            ),
                        )
                        .with_caps(ccap, Capability::SharedRead),
                    );
                    return;
                }
                match self.containers.alias_element(c, *index, ccap, *cap) {
                    Ok((elem, alias_cap)) => {
                        let (node, name) = into;
                        let region = self.regions.alloc(Bound::Unbounded);
                        let src_region = self.bindings[elem.0 as usize].region;
                        self.regions.connect(region, src_region);
                        let id = self.new_binding(
                            name.node.clone(),
                            name.span,
                            region,
                            None,
                            None,
                            FlowState::Cap(alias_cap),
                        );
                        self.forest.alias(id, elem);
                        self.annotations.record(*node, alias_cap);
                    }
                    Err(violation) => {
                        let diag = self.container_diag(op_stmt.span, violation);
                        self.emit(diag);
                    }
                }
            }
        }
    }

    fn container_add(&mut self, c: BindingId, cname: &str, element: &Ident, span: Span) {
        let Some(src) = self.resolve(element) else {
            return;
        };
        let Some(scap) = self.expect_usable(src, element.span) else {
            return;
        };
        let elem_name = format!("{cname}[element]");
        let elem = self.pseudo_binding(elem_name, span, FlowState::Uninitialized);
        match self.containers.add(c, elem, scap) {
            Ok(crate::independent::Ownership::Owned) => {
                // Storing into an owned container consumes the source.
                self.forest.retire(src);
                self.env.set(src, FlowState::Invalid);
                self.mark_consumed(src);
                self.env.set(elem, FlowState::Cap(Capability::Owned));
            }
            Ok(crate::independent::Ownership::Unowned) => {
                let (src_after, elem_cap) = alias_result(scap);
                self.env.set(src, FlowState::Cap(src_after));
                self.env.set(elem, FlowState::Cap(elem_cap));
                self.forest.alias(elem, src);
            }
            Err(violation) => {
                self.forest.retire(elem);
                self.env.set(elem, FlowState::Invalid);
                let diag = self
                    .container_diag(span, violation)
                    .with_caps(scap, Capability::Isolated);
                self.emit(diag);
            }
        }
    }

    fn container_discard(&mut self, c: BindingId, index: usize, span: Span) -> bool {
        match self.containers.discard(c, index, &mut self.forest) {
            Ok(elem) => {
                self.env.set(elem, FlowState::Invalid);
                true
            }
            Err(violation) => {
                let diag = self.container_diag(span, violation);
                self.emit(diag);
                false
            }
        }
    }

    // ---- control flow -----------------------------------------------

    fn walk_if(&mut self, if_stmt: &IfStmt) {
        let entry = self.env.clone();
        self.walk_block(&if_stmt.then_block);
        let then_env = std::mem::replace(&mut self.env, entry);
        if let Some(else_block) = &if_stmt.else_block {
            self.walk_block(else_block);
        }
        self.env = then_env.join_with(&self.env);
    }

    fn walk_while(&mut self, while_stmt: &WhileStmt) {
        // Iterate the body against the joined entry state until it
        // stabilizes, diagnostics muted; then one recorded pass over
        // the stable state.
        let mut entry = self.env.clone();
        self.muted += 1;
        for _ in 0..MAX_LOOP_PASSES {
            self.env = entry.clone();
            self.walk_block(&while_stmt.body);
            let joined = entry.join_with(&self.env);
            if joined == entry {
                break;
            }
            entry = joined;
        }
        self.muted -= 1;
        self.env = entry.clone();
        self.walk_block(&while_stmt.body);
        // The loop may run zero times.
        self.env = entry.join_with(&self.env);
    }

    // ---- expressions ------------------------------------------------

    fn eval_expr(&mut self, expr: &Expr) -> Eval {
        let eval = self.eval_expr_inner(expr);
        if let FlowState::Cap(cap) = eval.state {
            self.annotations.record(expr.id, cap);
        }
        eval
    }

    fn eval_expr_inner(&mut self, expr: &Expr) -> Eval {
        match &expr.kind {
            ExprKind::New(_) => Eval {
                state: FlowState::Cap(Capability::Isolated),
                alias_of: None,
                region_src: None,
                bound: Bound::Unbounded,
            },
            // A plain use of a reference in value position copies the
            // reference, which is an alias.
            ExprKind::Use(name) | ExprKind::Alias(name) => {
                let Some(src) = self.resolve(name) else {
                    return Eval::invalid();
                };
                let Some(cap) = self.expect_usable(src, expr.span) else {
                    return Eval::invalid();
                };
                let (src_after, alias_cap) = alias_result(cap);
                self.env.set(src, FlowState::Cap(src_after));
                Eval {
                    state: FlowState::Cap(alias_cap),
                    alias_of: Some(src),
                    region_src: Some(self.bindings[src.0 as usize].region),
                    bound: Bound::Unbounded,
                }
            }
            ExprKind::Move(name) => {
                let Some(src) = self.resolve(name) else {
                    return Eval::invalid();
                };
                let Some(cap) = self.expect_usable(src, expr.span) else {
                    return Eval::invalid();
                };
                if !self.forest.can_recover(src) {
                    let others = self.forest.live_others(src);
                    let sharers = self.sharer_names(&others);
                    self.emit(
                        CheckDiagnostic::new(
                            ErrorKind::SharingViolation,
                            expr.span,
                            format!(
                                "cannot move `{}`: its sharing set is not empty",
                                name.node
                            ),
                        )
                        .with_sharers(sharers),
                    );
                    self.env.set(src, FlowState::Invalid);
                    return Eval::invalid();
                }
                let region = self.bindings[src.0 as usize].region;
                self.forest.retire(src);
                self.env.set(src, FlowState::Invalid);
                self.mark_consumed(src);
                Eval {
                    state: FlowState::Cap(cap),
                    alias_of: None,
                    region_src: Some(region),
                    bound: Bound::Unbounded,
                }
            }
            ExprKind::Field { base, field } => {
                let Some(base_id) = self.resolve(base) else {
                    return Eval::invalid();
                };
                let Some(base_cap) = self.expect_usable(base_id, expr.span) else {
                    return Eval::invalid();
                };
                let field_cap = self.field_cap(base_id, field);
                let seen = lattice::combine_viewpoint(base_cap, field_cap);
                let info = &self.bindings[base_id.0 as usize];
                Eval {
                    state: FlowState::Cap(seen),
                    alias_of: Some(base_id),
                    region_src: Some(info.region),
                    // An interior reference dies with the binding it
                    // was read through.
                    bound: Bound::BoundTo {
                        owner: base_id,
                        depth: info.depth,
                    },
                }
            }
        }
    }

    /// Declared capability of a field, defaulting to shared-read.
    fn field_cap(&mut self, base: BindingId, field: &Ident) -> Capability {
        let Some(ty_name) = self.bindings[base.0 as usize].ty_name.clone() else {
            return Capability::SharedRead;
        };
        let Some(def) = self.types.get(ty_name.as_str()).copied() else {
            if self.options.strict {
                self.emit(CheckDiagnostic::new(
                    ErrorKind::UnknownBinding,
                    field.span,
                    format!("unknown type `{ty_name}`"),
                ));
            }
            return Capability::SharedRead;
        };
        match def.fields.iter().find(|f| f.name.node == field.node) {
            Some(f) => declared_cap_of(&f.ty).unwrap_or(Capability::SharedRead),
            None => {
                if self.options.strict {
                    self.emit(CheckDiagnostic::new(
                        ErrorKind::UnknownBinding,
                        field.span,
                        format!("type `{ty_name}` has no field `{}`", field.node),
                    ));
                }
                Capability::SharedRead
            }
        }
    }
}

fn declared_cap_of(ty: &TypeExpr) -> Option<Capability> {
    match ty {
        TypeExpr::Named { cap, .. } => *cap,
        TypeExpr::Fn { .. } => None,
    }
}

fn type_name_of(ty: &TypeExpr) -> Option<String> {
    match ty {
        TypeExpr::Named { name, .. } => Some(name.node.clone()),
        TypeExpr::Fn { .. } => None,
    }
}
