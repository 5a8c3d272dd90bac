#![forbid(unsafe_code)]

//! Declaration-time validation of generic variance, capability
//! included, plus the independence rules. A pure pass over type
//! definitions; it runs before any flow analysis, so the "Illegal"
//! stored-callback pattern is rejected before an instance can exist.

use sable_ast::{Capability, MethodSig, Program, Span, TypeDef, TypeExpr, TypeParam, Variance};

use crate::error::{CheckDiagnostic, ErrorKind, Reporter};

/// Where in a signature a parameter occurrence sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Polarity {
    /// Output position: return types, read-only fields.
    Positive,
    /// Input position: method parameters, callback parameters.
    Negative,
    /// Both at once: mutable fields, arguments of foreign generics.
    Invariant,
}

impl Polarity {
    fn flip(self) -> Polarity {
        match self {
            Polarity::Positive => Polarity::Negative,
            Polarity::Negative => Polarity::Positive,
            Polarity::Invariant => Polarity::Invariant,
        }
    }
}

/// One use of a generic parameter inside a member signature.
struct Occurrence {
    span: Span,
    polarity: Polarity,
    /// Explicit capability annotation on the occurrence, if any.
    cap: Option<Capability>,
    /// True when the occurrence lives in a field: state the instance
    /// retains, rather than a per-call signature.
    stored: bool,
    /// True when the enclosing member is reachable from a read-only
    /// receiver (fields always are; methods depend on the receiver
    /// capability).
    read_only_reachable: bool,
}

fn receiver_is_read_only(cap: Capability) -> bool {
    matches!(
        cap,
        Capability::SharedRead | Capability::Frozen | Capability::IdentityOnly
    )
}

fn collect(
    ty: &TypeExpr,
    param: &str,
    polarity: Polarity,
    stored: bool,
    read_only_reachable: bool,
    out: &mut Vec<Occurrence>,
) {
    match ty {
        TypeExpr::Named {
            span,
            name,
            cap,
            args,
        } => {
            if name.node == param {
                out.push(Occurrence {
                    span: *span,
                    polarity,
                    cap: *cap,
                    stored,
                    read_only_reachable,
                });
            }
            // Arguments of other generics: no variance knowledge about
            // the foreign type, so conservatively invariant.
            for arg in args {
                collect(arg, param, Polarity::Invariant, stored, read_only_reachable, out);
            }
        }
        TypeExpr::Fn { params, ret, .. } => {
            for p in params {
                collect(p, param, polarity.flip(), stored, read_only_reachable, out);
            }
            if let Some(ret) = ret {
                collect(ret, param, polarity, stored, read_only_reachable, out);
            }
        }
    }
}

fn occurrences_of(def: &TypeDef, param: &str) -> Vec<Occurrence> {
    let mut out = Vec::new();
    for field in &def.fields {
        let polarity = if field.mutable {
            Polarity::Invariant
        } else {
            Polarity::Positive
        };
        collect(&field.ty, param, polarity, true, true, &mut out);
    }
    for method in &def.methods {
        collect_method(method, param, &mut out);
    }
    out
}

fn collect_method(method: &MethodSig, param: &str, out: &mut Vec<Occurrence>) {
    let ro = receiver_is_read_only(method.self_cap);
    for p in &method.params {
        collect(&p.ty, param, Polarity::Negative, false, ro, out);
    }
    if let Some(ret) = &method.ret {
        collect(ret, param, Polarity::Positive, false, ro, out);
    }
}

pub fn check_program(program: &Program, reporter: &mut Reporter) {
    for def in &program.types {
        check_type(def, reporter);
    }
}

fn check_type(def: &TypeDef, reporter: &mut Reporter) {
    for param in &def.params {
        if param.independent {
            check_independent(def, param, reporter);
        } else if let Some(variance) = param.variance {
            check_variance(def, param, variance, reporter);
        }
    }
}

fn check_variance(
    def: &TypeDef,
    param: &TypeParam,
    variance: Variance,
    reporter: &mut Reporter,
) {
    for occ in occurrences_of(def, &param.name.node) {
        // The capability travels with the parameter under subtyping;
        // pinning it at an occurrence would let the type reify a
        // capability it does not control.
        if occ.cap.is_some() && variance != Variance::Invariant {
            reporter.report(CheckDiagnostic::new(
                ErrorKind::VarianceViolation,
                occ.span,
                format!(
                    "occurrence of {} parameter `{}` in `{}` pins an explicit capability",
                    variance.display(),
                    param.name.node,
                    def.name.node
                ),
            ));
            continue;
        }
        let ok = match variance {
            Variance::Covariant => occ.polarity == Polarity::Positive,
            Variance::Contravariant => occ.polarity == Polarity::Negative,
            Variance::Invariant => true,
            // Covariance only has to hold where a read-only instance
            // can observe the parameter; mutable instances are checked
            // as invariant, which admits everything.
            Variance::ReadOnlyCovariant => {
                !occ.read_only_reachable || occ.polarity != Polarity::Negative
            }
        };
        if !ok {
            reporter.report(CheckDiagnostic::new(
                ErrorKind::VarianceViolation,
                occ.span,
                format!(
                    "parameter `{}` of `{}` is declared {} but occurs in a {} position",
                    param.name.node,
                    def.name.node,
                    variance.display(),
                    match occ.polarity {
                        Polarity::Positive => "covariant",
                        Polarity::Negative => "contravariant",
                        Polarity::Invariant => "invariant",
                    }
                ),
            ));
        }
    }
}

fn check_independent(def: &TypeDef, param: &TypeParam, reporter: &mut Reporter) {
    // Independence means the container never fixes the parameter's
    // capability, so a variance declaration on it is meaningless.
    if let Some(variance) = param.variance {
        reporter.report(CheckDiagnostic::new(
            ErrorKind::VarianceViolation,
            param.span,
            format!(
                "independent parameter `{}` of `{}` cannot also be declared {}",
                param.name.node,
                def.name.node,
                variance.display()
            ),
        ));
    }
    // The unconstrained default must keep the universally-compatible
    // fallback available.
    if let Some(constraint) = &param.constraint {
        if !constraint.allowed.contains(&Capability::IdentityOnly) {
            reporter.report(CheckDiagnostic::new(
                ErrorKind::VarianceViolation,
                constraint.span,
                format!(
                    "capability constraint on independent parameter `{}` excludes identity-only",
                    param.name.node
                ),
            ));
        }
    }
    for occ in occurrences_of(def, &param.name.node) {
        // Stored state whose type uses the parameter as an input would
        // let the instance assume a capability the element no longer
        // has once it changes externally (for example a mutating
        // callback captured for an element that is later frozen).
        if occ.stored && occ.polarity != Polarity::Positive {
            reporter.report(CheckDiagnostic::new(
                ErrorKind::IllegalReification,
                occ.span,
                format!(
                    "independent parameter `{}` of `{}` is stored in a non-covariant position",
                    param.name.node, def.name.node
                ),
            ));
        }
    }
}
