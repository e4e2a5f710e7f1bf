//! Shared types between the tc classifier (kernel) and userspace
//!
//! Everything here must be:
//! - `#[repr(C)]` for stable memory layout
//! - `no_std` compatible for eBPF
//! - Laid out identically to the values stored in the kernel maps

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Name of the hash map the classifier records packets into.
pub const PACKET_EVENTS_MAP: &str = "PACKET_EVENTS";

/// Name of the two-slot array holding the port filter.
pub const PORT_FILTER_MAP: &str = "PORT_FILTER";

/// Entry point of the socket filter variant, used by the socket attach mode.
pub const SOCKET_FILTER_PROGRAM: &str = "report_packet";

/// Port filter slot for the source port.
pub const PORT_FILTER_SRC_INDEX: u32 = 0;

/// Port filter slot for the destination port.
pub const PORT_FILTER_DST_INDEX: u32 = 1;

/// Capacity of the packet event map. Events arriving while the map is full
/// are dropped by the classifier.
pub const PACKET_EVENTS_CAPACITY: u32 = 10_000;

/// Packet observed by the classifier.
///
/// Keyed in [`PACKET_EVENTS_MAP`] by the kernel timestamp (`bpf_ktime_get_ns`)
/// at which the packet was seen.
///
/// Layout (48 bytes, 8-byte aligned), every field widened to u64:
/// - len: `skb->len`
/// - saddr / daddr: IPv4 addresses, first octet in the LSB
/// - sport / dport: ports in host byte order
/// - direction: [`direction::INGRESS`] or [`direction::EGRESS`]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct PacketEvent {
    pub len: u64,
    pub saddr: u64,
    pub daddr: u64,
    pub sport: u64,
    pub dport: u64,
    pub direction: u64,
}

/// Traffic direction constants
pub mod direction {
    pub const INGRESS: u64 = 0;
    pub const EGRESS: u64 = 1;
}

/// IP protocol constants
pub mod protocol {
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<PacketEvent>() == 48,
        "PacketEvent must be exactly 48 bytes"
    );
    assert!(
        core::mem::align_of::<PacketEvent>() == 8,
        "PacketEvent must be 8-byte aligned"
    );
};
