//! Packet programs that record metadata for the traced port pair
//!
//! Three entry points share one body:
//! - `report_ingress`, attached to the clsact ingress hook
//! - `report_egress`, attached to the clsact egress hook
//! - `report_packet`, a socket filter for a promiscuous `AF_PACKET` socket;
//!   direction comes from `skb->pkt_type`
//!
//! Each matching IPv4 TCP/UDP packet is inserted into `PACKET_EVENTS`, keyed
//! by `bpf_ktime_get_ns()`. Userspace removes entries with
//! `BPF_MAP_LOOKUP_AND_DELETE_BATCH`; if it falls behind and the map fills up,
//! new packets are dropped.
//!
//! Note: This binary must be built for the bpfel-unknown-none target.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::TC_ACT_OK,
    helpers::bpf_ktime_get_ns,
    macros::{classifier, map, socket_filter},
    maps::{Array, HashMap},
    programs::{SkBuffContext, TcContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use proctrace_common::{
    direction, protocol, PacketEvent, PACKET_EVENTS_CAPACITY, PORT_FILTER_DST_INDEX,
    PORT_FILTER_SRC_INDEX,
};

const ETH_HDR_LEN: usize = 14;
const ETH_PROTO_OFFSET: usize = 12;
const ETH_P_IP: u16 = 0x0800;
const IP_PROTO_OFFSET: usize = 9;
const IP_SADDR_OFFSET: usize = 12;
const IP_DADDR_OFFSET: usize = 16;
/// `skb->pkt_type` of a packet this host sent.
const PACKET_OUTGOING: u32 = 4;

#[map]
static PACKET_EVENTS: HashMap<u64, PacketEvent> =
    HashMap::with_max_entries(PACKET_EVENTS_CAPACITY, 0);

#[map]
static PORT_FILTER: Array<u64> = Array::with_max_entries(2, 0);

#[classifier]
pub fn report_ingress(ctx: TcContext) -> i32 {
    let _ = try_report(&ctx, direction::INGRESS);
    TC_ACT_OK
}

#[classifier]
pub fn report_egress(ctx: TcContext) -> i32 {
    let _ = try_report(&ctx, direction::EGRESS);
    TC_ACT_OK
}

#[socket_filter]
pub fn report_packet(ctx: SkBuffContext) -> i64 {
    // SAFETY: the context pointer is valid for the life of the program
    let pkt_type = unsafe { (*ctx.skb.skb).pkt_type };
    let direction = if pkt_type == PACKET_OUTGOING {
        direction::EGRESS
    } else {
        direction::INGRESS
    };
    let _ = try_report(&ctx, direction);
    // Nothing reads the socket; keep zero bytes so its queue never fills
    0
}

/// Byte access shared by the classifier and socket filter contexts.
trait PacketBytes {
    fn load_at<T>(&self, offset: usize) -> Result<T, ()>;
    fn packet_len(&self) -> u32;
}

impl PacketBytes for TcContext {
    fn load_at<T>(&self, offset: usize) -> Result<T, ()> {
        self.load(offset).map_err(|_| ())
    }

    fn packet_len(&self) -> u32 {
        self.len()
    }
}

impl PacketBytes for SkBuffContext {
    fn load_at<T>(&self, offset: usize) -> Result<T, ()> {
        self.load(offset).map_err(|_| ())
    }

    fn packet_len(&self) -> u32 {
        self.len()
    }
}

fn try_report<C: PacketBytes + EbpfContext>(ctx: &C, direction: u64) -> Result<(), ()> {
    let eth_proto = u16::from_be(ctx.load_at::<u16>(ETH_PROTO_OFFSET)?);
    if eth_proto != ETH_P_IP {
        return Ok(());
    }

    let version_ihl: u8 = ctx.load_at(ETH_HDR_LEN)?;
    let ihl = ((version_ihl & 0x0f) as usize) * 4;
    if ihl < 20 {
        return Ok(());
    }

    let ip_proto: u8 = ctx.load_at(ETH_HDR_LEN + IP_PROTO_OFFSET)?;
    if ip_proto != protocol::TCP && ip_proto != protocol::UDP {
        return Ok(());
    }

    let saddr: u32 = ctx.load_at(ETH_HDR_LEN + IP_SADDR_OFFSET)?;
    let daddr: u32 = ctx.load_at(ETH_HDR_LEN + IP_DADDR_OFFSET)?;

    // TCP and UDP both start with source port then destination port
    let l4 = ETH_HDR_LEN + ihl;
    let sport = u16::from_be(ctx.load_at::<u16>(l4)?) as u64;
    let dport = u16::from_be(ctx.load_at::<u16>(l4 + 2)?) as u64;

    if !port_matches(sport, dport) {
        return Ok(());
    }

    let event = PacketEvent {
        len: ctx.packet_len() as u64,
        saddr: saddr as u64,
        daddr: daddr as u64,
        sport,
        dport,
        direction,
    };

    // SAFETY: bpf_ktime_get_ns is always safe to call from eBPF context
    let key = unsafe { bpf_ktime_get_ns() };

    if PACKET_EVENTS.insert(&key, &event, 0).is_err() {
        debug!(ctx, "packet event map full, dropping event");
    }

    Ok(())
}

/// A zero slot means "any port". A configured port matches when it appears
/// on either side of the packet.
fn port_matches(sport: u64, dport: u64) -> bool {
    let src = PORT_FILTER.get(PORT_FILTER_SRC_INDEX).copied().unwrap_or(0);
    let dst = PORT_FILTER.get(PORT_FILTER_DST_INDEX).copied().unwrap_or(0);

    if src == 0 && dst == 0 {
        return true;
    }

    (src != 0 && (src == sport || src == dport)) || (dst != 0 && (dst == sport || dst == dport))
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
