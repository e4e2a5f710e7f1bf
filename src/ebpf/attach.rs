//! Classifier attachment and the per-interface clsact registry
//!
//! A clsact qdisc must exist on an interface before tc filters can be added,
//! and only one can exist per interface. The registry keeps one slot per
//! interface; the existence check, the qdisc creation and the filter install
//! all happen while holding that slot's lock, so concurrent attaches to the
//! same interface cannot race each other into a second `qdisc add`.

use crate::trace::Direction;
use crate::{Result, TracerError};
use dashmap::DashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Low-level tc operations on a network interface.
pub trait TcBackend: Send + Sync {
    /// Loaded classifier program a filter is bound to.
    type Program: ?Sized;
    /// Owned handle to an installed filter.
    type Link: Send;

    /// Add a clsact qdisc. Must fail with [`io::ErrorKind::AlreadyExists`]
    /// when one is already present.
    fn add_clsact(&self, interface: &str) -> io::Result<()>;

    fn attach_filter(
        &self,
        interface: &str,
        direction: Direction,
        program: &mut Self::Program,
    ) -> anyhow::Result<Self::Link>;

    fn detach_filter(&self, link: Self::Link) -> anyhow::Result<()>;

    fn remove_clsact(&self, interface: &str) -> anyhow::Result<()>;

    /// Clear any XDP program left on the interface.
    fn clear_xdp(&self, interface: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct QdiscSlot {
    present: bool,
    created: bool,
    filters: usize,
}

/// An installed filter. Hand it back to [`QdiscRegistry::detach`].
#[derive(Debug)]
pub struct AttachmentHandle<L> {
    interface: String,
    direction: Direction,
    program: String,
    link: L,
}

impl<L> AttachmentHandle<L> {
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn link_label(&self) -> &'static str {
        self.direction.link_label()
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Process-wide registry of clsact qdiscs, one slot per interface.
pub struct QdiscRegistry<B: TcBackend> {
    backend: B,
    slots: DashMap<String, Arc<Mutex<QdiscSlot>>>,
}

impl<B: TcBackend> QdiscRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            slots: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn slot(&self, interface: &str) -> Arc<Mutex<QdiscSlot>> {
        self.slots
            .entry(interface.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Number of filters currently installed through the registry on
    /// `interface`.
    pub fn filter_count(&self, interface: &str) -> usize {
        self.slots
            .get(interface)
            .map(|slot| {
                let filters = lock(&slot).filters;
                filters
            })
            .unwrap_or(0)
    }

    /// Ensure the clsact qdisc exists on `interface`, then install the
    /// filter for `direction`.
    pub fn attach(
        &self,
        interface: &str,
        direction: Direction,
        program_name: &str,
        program: &mut B::Program,
    ) -> Result<AttachmentHandle<B::Link>> {
        let slot = self.slot(interface);
        let mut slot = lock(&slot);

        if !slot.present {
            match self.backend.add_clsact(interface) {
                Ok(()) => {
                    info!(interface, "clsact qdisc created");
                    slot.created = true;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(interface, "clsact qdisc already present");
                    slot.created = false;
                }
                Err(source) => {
                    return Err(TracerError::QdiscFailed {
                        interface: interface.to_string(),
                        source,
                    })
                }
            }
            slot.present = true;
        }

        let link = match self.backend.attach_filter(interface, direction, program) {
            Ok(link) => link,
            Err(e) => {
                if slot.filters == 0 {
                    self.release_qdisc(interface, &mut slot);
                }
                return Err(TracerError::AttachFailed {
                    interface: interface.to_string(),
                    filter: direction.link_label().to_string(),
                    reason: format!("{:#}", e),
                });
            }
        };

        slot.filters += 1;
        info!(
            interface,
            filter = direction.link_label(),
            program = program_name,
            "classifier attached"
        );

        Ok(AttachmentHandle {
            interface: interface.to_string(),
            direction,
            program: program_name.to_string(),
            link,
        })
    }

    /// Remove a filter; the last filter on an interface takes the qdisc
    /// with it. Failures are logged and teardown carries on.
    pub fn detach(&self, handle: AttachmentHandle<B::Link>) {
        let AttachmentHandle {
            interface,
            direction,
            link,
            ..
        } = handle;

        let slot = self.slot(&interface);
        let mut slot = lock(&slot);

        match self.backend.detach_filter(link) {
            Ok(()) => info!(
                interface = %interface,
                filter = direction.link_label(),
                "classifier detached"
            ),
            Err(e) => warn!(
                interface = %interface,
                filter = direction.link_label(),
                error = %e,
                "failed to detach classifier"
            ),
        }

        slot.filters = slot.filters.saturating_sub(1);
        if slot.filters == 0 {
            self.release_qdisc(&interface, &mut slot);
        }
    }

    fn release_qdisc(&self, interface: &str, slot: &mut QdiscSlot) {
        if slot.created {
            if let Err(e) = self.backend.remove_clsact(interface) {
                warn!(interface, error = %e, "failed to remove clsact qdisc");
            } else {
                info!(interface, "clsact qdisc removed");
            }
            if let Err(e) = self.backend.clear_xdp(interface) {
                warn!(interface, error = %e, "failed to clear xdp state");
            }
        }
        slot.present = false;
        slot.created = false;
    }
}

fn lock(slot: &Mutex<QdiscSlot>) -> MutexGuard<'_, QdiscSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
