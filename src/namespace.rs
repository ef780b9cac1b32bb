/*
 * Device Namespace
 *
 * A device becomes reachable once its node name is published in the host's
 * device namespace. The framework only needs publish/unpublish; lookup is
 * what the host's open path uses to find the node again.
 *
 * DeviceRegistry is a bounded in-memory namespace for firmware images that
 * have no VFS of their own. It holds weak references only, so a published
 * node never keeps its device alive.
 */

use alloc::sync::{Arc, Weak};

use heapless::{String, Vec};
use spin::Mutex;

use crate::error::{DeviceError, Result};
use crate::file::FileOps;

/// Maximum number of nodes a DeviceRegistry can hold
pub const MAX_NODES: usize = 16;

/// Maximum length of a node name, in bytes
pub const DEVNAME_MAX: usize = 32;

/// Host device-namespace facility
pub trait Namespace: Send + Sync {
    /// Make `node` reachable under `devname`.
    fn publish(&self, devname: &str, node: Weak<dyn FileOps>) -> Result<()>;

    /// Remove `devname` from the namespace if it still refers to `node`.
    ///
    /// Unknown names, and names since taken over by another node, are left
    /// alone.
    fn unpublish(&self, devname: &str, node: &Weak<dyn FileOps>);
}

struct Node {
    name: String<DEVNAME_MAX>,
    ops: Weak<dyn FileOps>,
}

/// Bounded node table
pub struct DeviceRegistry {
    nodes: Mutex<Vec<Node, MAX_NODES>>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Find the live node published under `devname`
    pub fn lookup(&self, devname: &str) -> Result<Arc<dyn FileOps>> {
        self.nodes
            .lock()
            .iter()
            .find(|n| n.name.as_str() == devname)
            .and_then(|n| n.ops.upgrade())
            .ok_or(DeviceError::NotFound)
    }

    pub fn contains(&self, devname: &str) -> bool {
        self.nodes.lock().iter().any(|n| n.name.as_str() == devname)
    }

    /// Number of published nodes
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace for DeviceRegistry {
    fn publish(&self, devname: &str, node: Weak<dyn FileOps>) -> Result<()> {
        let mut name = String::new();
        name.push_str(devname)
            .map_err(|_| DeviceError::InvalidArgument)?;
        if name.is_empty() {
            return Err(DeviceError::InvalidArgument);
        }

        let mut nodes = self.nodes.lock();

        // Nodes whose device is gone no longer count as taken.
        nodes.retain(|n| n.ops.strong_count() > 0);

        if nodes.iter().any(|n| n.name == name) {
            return Err(DeviceError::AlreadyExists);
        }

        nodes
            .push(Node { name, ops: node })
            .map_err(|_| DeviceError::CapacityExceeded)?;

        log::info!("devfs: published {}", devname);
        Ok(())
    }

    fn unpublish(&self, devname: &str, node: &Weak<dyn FileOps>) {
        let mut nodes = self.nodes.lock();
        if let Some(idx) = nodes
            .iter()
            .position(|n| n.name.as_str() == devname && Weak::ptr_eq(&n.ops, node))
        {
            nodes.swap_remove(idx);
            log::info!("devfs: unpublished {}", devname);
        }
    }
}
