// src/topology.rs
//! Objects shared by every layer of the tree; all links between them are weak.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::cpumask::CpuMask;

pub type ObjRef = Rc<RefCell<TopoObj>>;
pub type WeakObj = Weak<RefCell<TopoObj>>;

/// A list of objects of one type, owned by that type's enumerator.
pub type ObjList = Rc<RefCell<Vec<ObjRef>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjType {
    Node,
    Package,
    Cache,
    Cpu,
}

/// An interrupt source, owned by the interrupt classifier.
#[derive(Debug, Default)]
pub struct IrqInfo {
    pub irq: u32,
    pub load: u64,
}

pub type IrqRef = Rc<RefCell<IrqInfo>>;

#[derive(Debug)]
pub struct TopoObj {
    pub kind: ObjType,
    /// `-1` only for the unspecified node.
    pub number: i32,
    pub mask: CpuMask,
    /// Accumulated by the rebalancer; zero on creation.
    pub load: u64,
    children: Vec<WeakObj>,
    parent: Option<WeakObj>,
    interrupts: Vec<Weak<RefCell<IrqInfo>>>,
    owning_list: Weak<RefCell<Vec<ObjRef>>>,
}

impl TopoObj {
    pub fn new(kind: ObjType, number: i32, mask: CpuMask, list: &ObjList) -> Self {
        Self {
            kind,
            number,
            mask,
            load: 0,
            children: Vec::new(),
            parent: None,
            interrupts: Vec::new(),
            owning_list: Rc::downgrade(list),
        }
    }

    pub fn into_ref(self) -> ObjRef {
        Rc::new(RefCell::new(self))
    }

    /// Children still alive, in attachment order.
    pub fn children(&self) -> Vec<ObjRef> {
        self.children.iter().filter_map(Weak::upgrade).collect()
    }

    /// Parent object, if one was set and is still alive.
    pub fn parent(&self) -> Option<ObjRef> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn has_parent(&self) -> bool {
        self.parent().is_some()
    }

    pub fn interrupts(&self) -> Vec<IrqRef> {
        self.interrupts.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn add_interrupt(&mut self, irq: &IrqRef) {
        self.interrupts.push(Rc::downgrade(irq));
    }

    pub fn add_load(&mut self, load: u64) {
        self.load = self.load.saturating_add(load);
    }

    /// Every object on the same list as this one, itself included.
    ///
    /// Empty once the owning list has been released.
    pub fn siblings(&self) -> Vec<ObjRef> {
        self.owning_list
            .upgrade()
            .map(|list| {
                let objs = list.borrow();
                objs.clone()
            })
            .unwrap_or_default()
    }

    /// Drop the children and interrupt spines. The objects they referred to
    /// are untouched.
    pub fn clear_links(&mut self) {
        self.children = Vec::new();
        self.interrupts = Vec::new();
    }

    pub(crate) fn push_child(&mut self, child: &ObjRef) {
        self.children.push(Rc::downgrade(child));
    }

    pub(crate) fn set_parent(&mut self, parent: &ObjRef) {
        self.parent = Some(Rc::downgrade(parent));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> ObjList {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn links_are_weak() {
        let nodes = list();
        let packages = list();
        let node = TopoObj::new(ObjType::Node, 0, CpuMask::ALL, &nodes).into_ref();
        let pkg = TopoObj::new(ObjType::Package, 0, CpuMask::EMPTY, &packages).into_ref();

        node.borrow_mut().push_child(&pkg);
        pkg.borrow_mut().set_parent(&node);
        assert_eq!(node.borrow().children().len(), 1);
        assert!(Rc::ptr_eq(&pkg.borrow().parent().unwrap(), &node));

        drop(node);
        assert!(!pkg.borrow().has_parent());
    }

    #[test]
    fn dropped_children_disappear() {
        let nodes = list();
        let node = TopoObj::new(ObjType::Node, 0, CpuMask::ALL, &nodes).into_ref();
        let pkg = TopoObj::new(ObjType::Package, 3, CpuMask::EMPTY, &list()).into_ref();
        node.borrow_mut().push_child(&pkg);
        drop(pkg);
        assert!(node.borrow().children().is_empty());
    }

    #[test]
    fn siblings_follow_owning_list() {
        let nodes = list();
        let a = TopoObj::new(ObjType::Node, 0, CpuMask::EMPTY, &nodes).into_ref();
        let b = TopoObj::new(ObjType::Node, 1, CpuMask::EMPTY, &nodes).into_ref();
        nodes.borrow_mut().extend([a.clone(), b]);
        assert_eq!(a.borrow().siblings().len(), 2);

        drop(nodes);
        assert!(a.borrow().siblings().is_empty());
    }

    #[test]
    fn interrupts_and_load() {
        let nodes = list();
        let mut node = TopoObj::new(ObjType::Node, 0, CpuMask::EMPTY, &nodes);
        let irq = Rc::new(RefCell::new(IrqInfo { irq: 24, load: 0 }));
        node.add_interrupt(&irq);
        node.add_load(10);
        node.add_load(u64::MAX);
        assert_eq!(node.load, u64::MAX);
        assert_eq!(node.interrupts()[0].borrow().irq, 24);

        node.clear_links();
        assert!(node.interrupts().is_empty());
        assert_eq!(irq.borrow().irq, 24);
    }
}
