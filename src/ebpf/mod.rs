pub mod attach;
pub mod drain;
#[cfg(target_os = "linux")]
pub mod kernel_map;
#[cfg(target_os = "linux")]
pub mod loader;
pub mod preflight;

pub use attach::{AttachmentHandle, QdiscRegistry, TcBackend};
pub use drain::{run_drainer, Batch, BatchMap, DrainStats, Drainer};

/// A loaded packet probe: classifiers attached, event map ready to drain.
pub trait PacketProbe: Send {
    fn events(&mut self) -> &mut dyn BatchMap;

    /// Remove the classifiers and release the loaded object. Best-effort.
    fn detach(self: Box<Self>);
}
