//! eBPF programs for proctrace
//!
//! The classifier in `src/bin/packet_probe.rs` attaches to a network
//! interface's ingress and egress hooks and records packet metadata into a
//! hash map keyed by kernel timestamp. Userspace drains that map in batches.

#![cfg_attr(not(test), no_std)]

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
