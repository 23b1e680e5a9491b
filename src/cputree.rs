//! Package discovery from the cpu sysfs tree.
//!
//! Online cpus are grouped by `topology/physical_package_id` and each package
//! is hung under the NUMA node of its lowest-numbered cpu.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use tracing::debug;

use crate::cpumask::CpuMask;
use crate::numa::{NumaNodes, UNSPECIFIED_NODE_ID};
use crate::topology::{ObjList, ObjRef, ObjType, TopoObj};

pub const SYSFS_CPU_PATH: &str = "/sys/devices/system/cpu";

/// Owns the package objects; nodes only hold weak handles to them.
pub struct PackageTree {
    packages: ObjList,
}

impl PackageTree {
    pub fn scan(cpu_path: &Path, nodes: &NumaNodes) -> Self {
        let packages: ObjList = Rc::new(RefCell::new(Vec::new()));

        // package id -> (cpus, node of the first cpu seen)
        let mut found: BTreeMap<i32, (CpuMask, i32)> = BTreeMap::new();
        for cpu in online_cpus(cpu_path).iter() {
            let dir = cpu_path.join(format!("cpu{cpu}"));
            let package = fs::read_to_string(dir.join("topology/physical_package_id"))
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok())
                .unwrap_or(0);
            let (mask, _) = found
                .entry(package)
                .or_insert_with(|| (CpuMask::EMPTY, cpu_node(&dir)));
            mask.set(cpu);
        }

        for (number, (mask, node)) in found {
            let pkg = TopoObj::new(ObjType::Package, number, mask, &packages).into_ref();
            nodes.attach_package(&pkg, node);
            packages.borrow_mut().push(pkg);
        }
        debug!(packages = packages.borrow().len(), "package tree built");

        Self { packages }
    }

    pub fn packages(&self) -> Vec<ObjRef> {
        self.packages.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.packages.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.borrow().is_empty()
    }
}

fn online_cpus(cpu_path: &Path) -> CpuMask {
    if let Ok(s) = fs::read_to_string(cpu_path.join("online")) {
        return CpuMask::parse_cpulist(&s);
    }
    let mut mask = CpuMask::EMPTY;
    if let Ok(entries) = fs::read_dir(cpu_path) {
        for e in entries.flatten() {
            let name = e.file_name();
            if let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("cpu"))
                .and_then(|n| n.parse::<usize>().ok())
            {
                mask.set(id);
            }
        }
    }
    mask
}

// The kernel links each cpu to its node as cpu<N>/node<M>.
fn cpu_node(cpu_dir: &Path) -> i32 {
    let Ok(entries) = fs::read_dir(cpu_dir) else {
        return UNSPECIFIED_NODE_ID;
    };
    for e in entries.flatten() {
        if let Some(name) = e.file_name().to_str() {
            if let Some(n) = name.strip_prefix("node").and_then(|n| n.parse::<i32>().ok()) {
                return n;
            }
        }
    }
    UNSPECIFIED_NODE_ID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_from_directory_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["cpu0", "cpu1", "cpu3", "cpufreq", "cpuidle"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        assert_eq!(online_cpus(dir.path()).to_cpulist(), "0-1,3");

        fs::write(dir.path().join("online"), "0-1\n").unwrap();
        assert_eq!(online_cpus(dir.path()).to_cpulist(), "0-1");
    }

    #[test]
    fn cpu_node_link() {
        let dir = tempfile::tempdir().unwrap();
        let cpu = dir.path().join("cpu4");
        fs::create_dir_all(cpu.join("topology")).unwrap();
        assert_eq!(cpu_node(&cpu), UNSPECIFIED_NODE_ID);

        fs::create_dir(cpu.join("node1")).unwrap();
        assert_eq!(cpu_node(&cpu), 1);
    }
}
