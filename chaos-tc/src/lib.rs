//! Kernel-facing half of the chaos agent: everything needed to reconcile
//! one network namespace's traffic-control state against a desired
//! impairment, with no knowledge of Kubernetes or pods.

pub mod cidr;
pub mod error;
pub mod exec;
pub mod mirror;
pub mod shaper;
pub mod spec;

pub use error::{TcError, TcResult};
pub use exec::{Exec, RealExec};
pub use mirror::{MirrorDevice, MirrorDevices};
pub use shaper::{Direction, Shaper};
pub use spec::ParsedImpairment;
