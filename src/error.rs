//! Error types for topology discovery.
//!
//! None of these escape the enumerator: every failure is recovered where it
//! happens and at most logged.

use std::path::PathBuf;

use crate::cpumask::NR_CPUS;

/// Errors raised while reading or parsing the kernel topology files.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// Cpumap text that is not a comma-separated list of hex groups
    #[error("invalid cpumap {0:?}")]
    InvalidCpumap(String),

    /// Cpumap with bits set beyond the supported CPU count
    #[error("cpumap sets cpus beyond {}", NR_CPUS)]
    CpumapOverflow,

    /// A sysfs file or directory could not be opened
    #[error("open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A sysfs file was opened but reading it failed
    #[error("read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file was readable but held nothing
    #[error("{} is empty", .0.display())]
    Empty(PathBuf),
}

pub type Result<T> = std::result::Result<T, TopologyError>;
