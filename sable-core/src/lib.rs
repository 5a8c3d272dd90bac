#![forbid(unsafe_code)]

mod checker;
mod error;
mod flow;
mod independent;
mod lattice;
mod overloads;
mod region;
mod sharing;
mod variance;

pub use checker::{check_program, CheckOutcome, Checker, CheckerOptions};
pub use error::{CheckDiagnostic, ErrorKind, Reporter, Severity};
pub use flow::{alias_result, FlowEnv, FlowState};
pub use independent::{ContainerTable, ContainerViolation, Ownership};
pub use lattice::{combine_viewpoint, is_subtype, join, rights_of, Right, Rights, Tri};
pub use overloads::check_program as check_overloads;
pub use region::{Bound, RegionTable};
pub use sharing::SharingForest;
pub use variance::check_program as check_variance;
