//! Host facilities handed to every device at construction.

use alloc::sync::Arc;

use crate::irq::InterruptLine;
use crate::namespace::Namespace;

/// The interrupt controller and device namespace a device lives in
#[derive(Clone)]
pub struct Platform {
    interrupts: Arc<dyn InterruptLine>,
    namespace: Arc<dyn Namespace>,
}

impl Platform {
    pub fn new(interrupts: Arc<dyn InterruptLine>, namespace: Arc<dyn Namespace>) -> Self {
        Self {
            interrupts,
            namespace,
        }
    }

    pub fn interrupts(&self) -> &Arc<dyn InterruptLine> {
        &self.interrupts
    }

    pub fn namespace(&self) -> &Arc<dyn Namespace> {
        &self.namespace
    }
}
