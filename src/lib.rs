//! NUMA topology discovery for interrupt balancing.
//!
//! [`numa::NumaNodes`] finds the NUMA nodes of the running host and the cpus
//! local to each, so that device interrupts can be steered to cpus near the
//! device. Higher layers hang their objects off the nodes: see
//! [`cputree::PackageTree`] for the package layer.

pub mod cpumask;
pub mod cputree;
pub mod error;
pub mod numa;
pub mod topology;

pub use cpumask::CpuMask;
pub use error::{Result, TopologyError};
pub use numa::{NumaConfig, NumaNodes};
pub use topology::{ObjRef, ObjType, TopoObj};
