#![forbid(unsafe_code)]

//! No overloading on capability alone: two declarations in the same
//! scope whose signatures differ only by reference capability are
//! rejected, regardless of whether the capabilities could be disjoint
//! at runtime. A plain symbol-table rule, deliberately separate from
//! the lattice.

use std::collections::HashMap;

use sable_ast::{Capability, FuncDef, Program, Span, TypeDef, TypeExpr};

use crate::error::{CheckDiagnostic, ErrorKind, Reporter};

/// A signature with every capability erased. Declarations that collide
/// on this key but not on their capability profile are overloads on
/// capability.
fn erased_type(ty: &TypeExpr) -> String {
    match ty {
        TypeExpr::Named { name, args, .. } => {
            if args.is_empty() {
                name.node.clone()
            } else {
                let args_s = args.iter().map(erased_type).collect::<Vec<_>>().join(", ");
                format!("{}<{}>", name.node, args_s)
            }
        }
        TypeExpr::Fn { params, ret, .. } => {
            let params_s = params.iter().map(erased_type).collect::<Vec<_>>().join(", ");
            match ret {
                Some(ret) => format!("fn({params_s}) -> {}", erased_type(ret)),
                None => format!("fn({params_s})"),
            }
        }
    }
}

fn cap_profile(ty: &TypeExpr, out: &mut Vec<Option<Capability>>) {
    match ty {
        TypeExpr::Named { cap, args, .. } => {
            out.push(*cap);
            for arg in args {
                cap_profile(arg, out);
            }
        }
        TypeExpr::Fn { params, ret, .. } => {
            for p in params {
                cap_profile(p, out);
            }
            if let Some(ret) = ret {
                cap_profile(ret, out);
            }
        }
    }
}

struct SigEntry {
    span: Span,
    caps: Vec<Option<Capability>>,
}

#[derive(Default)]
struct SigTable {
    seen: HashMap<String, Vec<SigEntry>>,
}

impl SigTable {
    fn check(
        &mut self,
        key: String,
        span: Span,
        caps: Vec<Option<Capability>>,
        what: &str,
        name: &str,
        reporter: &mut Reporter,
    ) {
        let entries = self.seen.entry(key).or_default();
        if entries.iter().any(|e| e.caps != caps) {
            reporter.report(CheckDiagnostic::new(
                ErrorKind::OverloadOnCapability,
                span,
                format!("{what} `{name}` differs from an earlier declaration only by capability"),
            ));
        }
        entries.push(SigEntry { span, caps });
    }
}

fn func_key(func: &FuncDef) -> (String, Vec<Option<Capability>>) {
    let erased = func
        .params
        .iter()
        .map(|p| erased_type(&p.ty))
        .collect::<Vec<_>>()
        .join(", ");
    let mut caps = Vec::new();
    for p in &func.params {
        cap_profile(&p.ty, &mut caps);
    }
    (format!("{}({erased})", func.name.node), caps)
}

pub fn check_program(program: &Program, reporter: &mut Reporter) {
    let mut funcs = SigTable::default();
    for func in &program.funcs {
        let (key, caps) = func_key(func);
        funcs.check(key, func.span, caps, "function", &func.name.node, reporter);
    }
    for ty in &program.types {
        check_type(ty, reporter);
    }
}

fn check_type(ty: &TypeDef, reporter: &mut Reporter) {
    let mut methods = SigTable::default();
    for method in &ty.methods {
        let erased = method
            .params
            .iter()
            .map(|p| erased_type(&p.ty))
            .collect::<Vec<_>>()
            .join(", ");
        // Receiver capability counts toward the profile: overloading on
        // `self` capability alone is still overloading on capability.
        let mut caps = vec![Some(method.self_cap)];
        for p in &method.params {
            cap_profile(&p.ty, &mut caps);
        }
        methods.check(
            format!("{}::{}({erased})", ty.name.node, method.name.node),
            method.span,
            caps,
            "method",
            &method.name.node,
            reporter,
        );
    }
}
