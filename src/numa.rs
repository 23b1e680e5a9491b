// src/numa.rs
//! NUMA node discovery, headed by the unspecified node (`-1`, every cpu).

use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cpumask::CpuMask;
use crate::error::{Result, TopologyError};
use crate::topology::{ObjList, ObjRef, ObjType, TopoObj};

pub const SYSFS_NODE_PATH: &str = "/sys/devices/system/node";

/// Number of the unspecified node.
pub const UNSPECIFIED_NODE_ID: i32 = -1;

struct NodeTemplate {
    number: i32,
    mask: CpuMask,
}

impl NodeTemplate {
    fn instantiate(&self, list: &ObjList) -> ObjRef {
        TopoObj::new(ObjType::Node, self.number, self.mask, list).into_ref()
    }
}

const UNSPECIFIED_NODE: NodeTemplate = NodeTemplate {
    number: UNSPECIFIED_NODE_ID,
    mask: CpuMask::ALL,
};

#[derive(Debug, Clone)]
pub struct NumaConfig {
    /// Directory holding the `node<N>` entries.
    pub node_path: PathBuf,
    /// When false only the unspecified node is ever built.
    pub numa_available: bool,
}

impl NumaConfig {
    /// Configuration for `node_path`, with availability probed from it.
    pub fn probe(node_path: impl Into<PathBuf>) -> Self {
        let node_path = node_path.into();
        let numa_available = numa_available(&node_path);
        Self {
            node_path,
            numa_available,
        }
    }
}

impl Default for NumaConfig {
    fn default() -> Self {
        Self::probe(SYSFS_NODE_PATH)
    }
}

/// True when `node_path` holds at least one `node<N>` directory.
pub fn numa_available(node_path: &Path) -> bool {
    let Ok(entries) = fs::read_dir(node_path) else {
        return false;
    };
    entries.map_while(|e| e.ok()).any(|e| {
        let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let name = e.file_name();
        let name = name.to_string_lossy();
        is_dir
            && name
                .strip_prefix("node")
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    })
}

/// Node a PCI device is attached to, read from `<dev_path>/numa_node`.
///
/// Devices without locality information report the unspecified node.
pub fn device_numa_node(dev_path: &Path) -> i32 {
    fs::read_to_string(dev_path.join("numa_node"))
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .filter(|n| *n >= 0)
        .unwrap_or(UNSPECIFIED_NODE_ID)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Empty,
    Populated,
}

pub struct NumaNodes {
    config: NumaConfig,
    // Survives teardown; replaced by a fresh copy of the template on build.
    unspecified: ObjRef,
    nodes: ObjList,
    state: State,
}

impl NumaNodes {
    /// An empty enumerator. Call [`NumaNodes::build`] to scan.
    pub fn new(config: NumaConfig) -> Self {
        let nodes: ObjList = Rc::new(RefCell::new(Vec::new()));
        let unspecified = UNSPECIFIED_NODE.instantiate(&nodes);
        Self {
            config,
            unspecified,
            nodes,
            state: State::Empty,
        }
    }

    pub fn config(&self) -> &NumaConfig {
        &self.config
    }

    pub fn is_populated(&self) -> bool {
        self.state == State::Populated
    }

    /// Populate the node list from the node directory.
    ///
    /// Never fails: nodes whose `cpumap` cannot be opened are skipped, nodes
    /// whose `cpumap` cannot be read or parsed get an empty mask, and a
    /// missing directory leaves just the unspecified node.
    pub fn build(&mut self) {
        if self.state == State::Populated {
            warn!("numa node list rebuilt without teardown");
            self.teardown();
        }

        self.unspecified = UNSPECIFIED_NODE.instantiate(&self.nodes);
        self.nodes.borrow_mut().push(self.unspecified.clone());
        self.state = State::Populated;

        if !self.config.numa_available {
            debug!("numa unavailable, using the unspecified node only");
            return;
        }

        let dir = match fs::read_dir(&self.config.node_path) {
            Ok(dir) => dir,
            Err(err) => {
                debug!(path = %self.config.node_path.display(), %err, "cannot list numa nodes");
                return;
            }
        };
        for entry in dir.map_while(|e| e.ok()) {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if is_dir && name.contains("node") {
                self.add_one_node(name);
            }
        }
        debug!(nodes = self.len(), "numa node list built");
    }

    fn add_one_node(&self, name: &str) {
        match read_node(&self.config.node_path, name, &self.nodes) {
            Ok(node) => self.nodes.borrow_mut().push(node.into_ref()),
            Err(err) => debug!(node = name, %err, "skipping numa node"),
        }
    }

    /// Empty the node list. Safe to call when already empty.
    ///
    /// Each node's children and interrupt lists are cleared; the packages and
    /// interrupts themselves belong to their own enumerators.
    pub fn teardown(&mut self) {
        let nodes = std::mem::take(&mut *self.nodes.borrow_mut());
        let released = nodes
            .iter()
            .filter(|node| !Rc::ptr_eq(node, &self.unspecified))
            .count();
        for node in &nodes {
            node.borrow_mut().clear_links();
        }
        drop(nodes);

        // Nodes still held elsewhere lose their way back to the list.
        self.nodes = Rc::new(RefCell::new(Vec::new()));
        self.state = State::Empty;
        debug!(released, "numa node list torn down");
    }

    pub fn rescan(&mut self) {
        self.teardown();
        self.build();
    }

    /// Node numbered `id`.
    ///
    /// `-1`, or any id when NUMA is unavailable, resolves to the unspecified
    /// node. Otherwise `None` when no such node was found by the last build.
    pub fn lookup(&self, id: i32) -> Option<ObjRef> {
        if !self.config.numa_available || id == UNSPECIFIED_NODE_ID {
            return Some(self.unspecified.clone());
        }
        self.nodes
            .borrow()
            .iter()
            .find(|node| node.borrow().number == id)
            .cloned()
    }

    pub fn unspecified(&self) -> ObjRef {
        self.unspecified.clone()
    }

    /// Hang `pkg` under node `id`.
    ///
    /// Does nothing if the node is unknown or `pkg` already has a live
    /// parent, so packages are never moved between nodes.
    pub fn attach_package(&self, pkg: &ObjRef, id: i32) {
        let Some(node) = self.lookup(id) else {
            info!("Could not find numa node for node id {id}");
            return;
        };
        if pkg.borrow().kind == ObjType::Node {
            debug!(id, "refusing to attach a numa node under another node");
            return;
        }
        if pkg.borrow().has_parent() {
            return;
        }
        node.borrow_mut().push_child(pkg);
        pkg.borrow_mut().set_parent(&node);
    }

    /// Visit every node, unspecified node first, in scan order.
    ///
    /// Walks a snapshot of the list, so the visitor may attach packages.
    pub fn for_each(&self, mut visitor: impl FnMut(&ObjRef)) {
        for node in self.nodes() {
            visitor(&node);
        }
    }

    pub fn nodes(&self) -> Vec<ObjRef> {
        self.nodes.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    /// First real node whose mask holds `cpu`, else the unspecified node.
    pub fn node_for_cpu(&self, cpu: usize) -> ObjRef {
        self.nodes
            .borrow()
            .iter()
            .find(|node| {
                let node = node.borrow();
                node.number >= 0 && node.mask.contains(cpu)
            })
            .cloned()
            .unwrap_or_else(|| self.unspecified.clone())
    }

    pub fn summaries(&self) -> Vec<NodeSummary> {
        let mut out = Vec::with_capacity(self.len());
        self.for_each(|node| out.push(NodeSummary::of(&node.borrow())));
        out
    }

    pub fn dump(&self) {
        self.for_each(|node| dump_node(&node.borrow()));
    }
}

fn read_node(node_path: &Path, name: &str, list: &ObjList) -> Result<TopoObj> {
    let path = node_path.join(name).join("cpumap");
    let file = File::open(&path).map_err(|source| TopologyError::Open {
        path: path.clone(),
        source,
    })?;
    let mask = match read_cpumap_line(BufReader::new(file), &path) {
        Ok(line) => CpuMask::from_cpumap_lossy(&line),
        Err(err) => {
            debug!(node = name, %err, "unreadable cpumap, node gets an empty mask");
            CpuMask::EMPTY
        }
    };
    Ok(TopoObj::new(ObjType::Node, parse_node_number(name), mask, list))
}

fn read_cpumap_line(mut reader: impl BufRead, path: &Path) -> Result<String> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|source| TopologyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if read == 0 {
        return Err(TopologyError::Empty(path.to_path_buf()));
    }
    Ok(line)
}

// Decimal digits after the "node" prefix; anything unparsable is node 0.
fn parse_node_number(name: &str) -> i32 {
    let rest = name.get(4..).unwrap_or("");
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().unwrap_or(0)
}

/// Log a node's number and local cpus.
pub fn dump_node(node: &TopoObj) {
    info!("NUMA NODE NUMBER: {}", node.number);
    info!("LOCAL CPU MASK: {}", node.mask);
}

/// Serializable view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub number: i32,
    pub cpumap: String,
    pub cpulist: String,
    pub packages: Vec<i32>,
    pub load: u64,
}

impl NodeSummary {
    pub fn of(node: &TopoObj) -> Self {
        Self {
            number: node.number,
            cpumap: node.mask.to_cpumap(),
            cpulist: node.mask.to_cpulist(),
            packages: node
                .children()
                .iter()
                .map(|child| child.borrow().number)
                .collect(),
            load: node.load,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor, Read};

    #[test]
    fn node_number_from_name() {
        assert_eq!(parse_node_number("node0"), 0);
        assert_eq!(parse_node_number("node12"), 12);
        assert_eq!(parse_node_number("node3x"), 3);
        assert_eq!(parse_node_number("node_list"), 0);
        assert_eq!(parse_node_number("node"), 0);
        assert_eq!(parse_node_number("node99999999999"), 0);
    }

    #[test]
    fn cpumap_first_line_only() {
        let path = Path::new("cpumap");
        let line = read_cpumap_line(Cursor::new("0000ff00\nffffffff\n"), path).unwrap();
        assert_eq!(CpuMask::from_cpumap_lossy(&line).to_cpulist(), "8-15");
    }

    #[test]
    fn cpumap_empty_file() {
        let err = read_cpumap_line(Cursor::new(""), Path::new("cpumap")).unwrap_err();
        assert!(matches!(err, TopologyError::Empty(_)));
    }

    struct Failing;

    impl Read for Failing {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("io error"))
        }
    }

    #[test]
    fn cpumap_read_error() {
        let err = read_cpumap_line(BufReader::new(Failing), Path::new("cpumap")).unwrap_err();
        assert!(matches!(err, TopologyError::Read { .. }));
    }

    fn without_numa() -> NumaNodes {
        NumaNodes::new(NumaConfig {
            node_path: PathBuf::from("/nonexistent"),
            numa_available: false,
        })
    }

    #[test]
    fn starts_empty() {
        let nodes = without_numa();
        assert!(!nodes.is_populated());
        assert!(nodes.is_empty());
    }

    #[test]
    fn unspecified_only_without_numa() {
        let mut nodes = without_numa();
        nodes.build();
        assert_eq!(nodes.len(), 1);
        for id in [-1, 0, 42] {
            let node = nodes.lookup(id).unwrap();
            assert!(Rc::ptr_eq(&node, &nodes.unspecified()));
        }
        let first = nodes.nodes()[0].clone();
        let first = first.borrow();
        assert_eq!(first.number, UNSPECIFIED_NODE_ID);
        assert_eq!(first.mask, CpuMask::ALL);
        assert!(first.parent().is_none());
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut nodes = without_numa();
        nodes.teardown();
        nodes.build();
        nodes.teardown();
        nodes.teardown();
        assert!(nodes.is_empty());
        assert!(!nodes.is_populated());
    }

    #[test]
    fn rebuild_resets_unspecified_node() {
        let mut nodes = without_numa();
        nodes.build();
        let pkg_list: ObjList = Rc::new(RefCell::new(Vec::new()));
        let pkg = TopoObj::new(ObjType::Package, 0, CpuMask::EMPTY, &pkg_list).into_ref();
        nodes.attach_package(&pkg, 5);
        nodes.unspecified().borrow_mut().add_load(7);
        assert_eq!(nodes.unspecified().borrow().children().len(), 1);

        nodes.teardown();
        nodes.build();
        let unspecified = nodes.unspecified();
        let unspecified = unspecified.borrow();
        assert!(unspecified.children().is_empty());
        assert!(unspecified.interrupts().is_empty());
        assert_eq!(unspecified.load, 0);
        assert!(!pkg.borrow().has_parent());
    }

    #[test]
    fn nodes_are_never_attached() {
        let mut nodes = without_numa();
        nodes.build();
        let other: ObjList = Rc::new(RefCell::new(Vec::new()));
        let node = TopoObj::new(ObjType::Node, 3, CpuMask::EMPTY, &other).into_ref();
        nodes.attach_package(&node, -1);
        assert!(!node.borrow().has_parent());
        assert!(nodes.unspecified().borrow().children().is_empty());
    }

    #[test]
    fn device_without_numa_node_file() {
        assert_eq!(device_numa_node(Path::new("/nonexistent/device")), UNSPECIFIED_NODE_ID);
    }
}
