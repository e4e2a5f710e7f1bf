//! Packet probe loading and lifecycle

use super::attach::{AttachmentHandle, QdiscRegistry, TcBackend};
use super::kernel_map::KernelEventMap;
use super::{preflight, BatchMap, PacketProbe};
use crate::config::NetworkConfig;
use crate::trace::Direction;
use crate::{Result, TracerError};
use anyhow::{anyhow, Context};
use aya::maps::{Array, Map, MapError};
use aya::programs::links::Link;
use aya::programs::socket_filter::SocketFilterLink;
use aya::programs::tc::SchedClassifierLink;
use aya::programs::{tc, ProgramError, SchedClassifier, SocketFilter, TcAttachType};
use aya::Ebpf;
use aya_log::EbpfLogger;
use proctrace_common::{
    PACKET_EVENTS_MAP, PORT_FILTER_DST_INDEX, PORT_FILTER_MAP, PORT_FILTER_SRC_INDEX,
    SOCKET_FILTER_PROGRAM,
};
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Command;
use std::sync::Arc;
use tracing::{info, warn};

/// tc operations through aya's netlink support, with the `tc`/`ip` tools
/// for the removals aya does not expose.
#[derive(Debug, Default)]
pub struct AyaTc;

impl TcBackend for AyaTc {
    type Program = SchedClassifier;
    type Link = SchedClassifierLink;

    fn add_clsact(&self, interface: &str) -> io::Result<()> {
        tc::qdisc_add_clsact(interface)
    }

    fn attach_filter(
        &self,
        interface: &str,
        direction: Direction,
        program: &mut SchedClassifier,
    ) -> anyhow::Result<SchedClassifierLink> {
        let attach_type = match direction {
            Direction::Ingress => TcAttachType::Ingress,
            Direction::Egress => TcAttachType::Egress,
        };
        let id = program
            .attach(interface, attach_type)
            .with_context(|| format!("Failed to attach to {} {}", interface, direction))?;
        program
            .take_link(id)
            .context("Failed to take ownership of classifier link")
    }

    fn detach_filter(&self, link: SchedClassifierLink) -> anyhow::Result<()> {
        link.detach().context("Failed to detach classifier")
    }

    fn remove_clsact(&self, interface: &str) -> anyhow::Result<()> {
        run_tool("tc", &["qdisc", "del", "dev", interface, "clsact"])
    }

    fn clear_xdp(&self, interface: &str) -> anyhow::Result<()> {
        run_tool("ip", &["link", "set", "dev", interface, "xdp", "off"])
    }
}

fn run_tool(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {}", program))?;

    if !output.status.success() {
        return Err(anyhow!(
            "{} {} exited with {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// Loaded probe object with its classifiers attached to one interface.
pub struct KernelProbe {
    events: KernelEventMap,
    attachments: Vec<AttachmentHandle<SchedClassifierLink>>,
    registry: Arc<QdiscRegistry<AyaTc>>,
    bpf: Ebpf,
}

impl KernelProbe {
    /// Load the probe object named in `config`, program the port filter and
    /// attach both classifiers. Anything attached before a failure is
    /// detached again.
    pub fn attach(config: &NetworkConfig, registry: Arc<QdiscRegistry<AyaTc>>) -> Result<Self> {
        let (bpf, events) = load_object(config)?;

        let mut probe = Self {
            events,
            attachments: Vec::with_capacity(Direction::ALL.len()),
            registry,
            bpf,
        };

        for direction in Direction::ALL {
            match probe.attach_direction(&config.interface, direction) {
                Ok(handle) => probe.attachments.push(handle),
                Err(e) => {
                    probe.teardown();
                    return Err(e);
                }
            }
        }

        info!(interface = %config.interface, "packet probe attached");
        Ok(probe)
    }

    fn attach_direction(
        &mut self,
        interface: &str,
        direction: Direction,
    ) -> Result<AttachmentHandle<SchedClassifierLink>> {
        let name = direction.program_name();
        let program: &mut SchedClassifier = self
            .bpf
            .program_mut(name)
            .ok_or_else(|| {
                TracerError::ProgramLoadFailed(format!("{} program not found in probe object", name))
            })?
            .try_into()
            .map_err(|e: ProgramError| TracerError::ProgramLoadFailed(format!("{}: {}", name, e)))?;

        program
            .load()
            .map_err(|e| TracerError::ProgramLoadFailed(format!("{}: {}", name, e)))?;

        self.registry.attach(interface, direction, name, program)
    }

    fn teardown(&mut self) {
        while let Some(handle) = self.attachments.pop() {
            self.registry.detach(handle);
        }
    }
}

impl PacketProbe for KernelProbe {
    fn events(&mut self) -> &mut dyn BatchMap {
        &mut self.events
    }

    fn detach(mut self: Box<Self>) {
        info!("Detaching packet probe...");
        self.teardown();
        drop(self);
        info!("Packet probe unloaded");
    }
}

/// Socket filter on a promiscuous `AF_PACKET` socket bound to one
/// interface. Sees both directions without touching the qdisc layout.
pub struct SocketCapture {
    events: KernelEventMap,
    link: SocketFilterLink,
    socket: OwnedFd,
    bpf: Ebpf,
}

impl SocketCapture {
    pub fn attach(config: &NetworkConfig) -> Result<Self> {
        let (mut bpf, events) = load_object(config)?;
        let attach_failed = |reason: String| TracerError::AttachFailed {
            interface: config.interface.clone(),
            filter: SOCKET_FILTER_PROGRAM.to_string(),
            reason,
        };

        let socket =
            open_packet_socket(&config.interface).map_err(|e| attach_failed(e.to_string()))?;

        let program: &mut SocketFilter = bpf
            .program_mut(SOCKET_FILTER_PROGRAM)
            .ok_or_else(|| {
                TracerError::ProgramLoadFailed(format!(
                    "{} program not found in probe object",
                    SOCKET_FILTER_PROGRAM
                ))
            })?
            .try_into()
            .map_err(|e: ProgramError| {
                TracerError::ProgramLoadFailed(format!("{}: {}", SOCKET_FILTER_PROGRAM, e))
            })?;
        program.load().map_err(|e| {
            TracerError::ProgramLoadFailed(format!("{}: {}", SOCKET_FILTER_PROGRAM, e))
        })?;

        let id = program
            .attach(&socket)
            .map_err(|e| attach_failed(e.to_string()))?;
        let link = program
            .take_link(id)
            .map_err(|e| attach_failed(e.to_string()))?;

        info!(
            interface = %config.interface,
            fd = socket.as_raw_fd(),
            "socket filter attached"
        );
        Ok(Self {
            events,
            link,
            socket,
            bpf,
        })
    }
}

impl PacketProbe for SocketCapture {
    fn events(&mut self) -> &mut dyn BatchMap {
        &mut self.events
    }

    fn detach(self: Box<Self>) {
        let SocketCapture {
            events,
            link,
            socket,
            bpf,
        } = *self;
        if let Err(e) = link.detach() {
            warn!(error = %e, "failed to detach socket filter");
        }
        // Closing the socket also leaves promiscuous mode
        drop(socket);
        drop(events);
        drop(bpf);
        info!("Socket filter closed");
    }
}

/// Load the object named in `config`, program its port filter and take the
/// event map out of it.
fn load_object(config: &NetworkConfig) -> Result<(Ebpf, KernelEventMap)> {
    preflight::run_preflight_checks()?;
    preflight::raise_memlock_limit();

    info!(path = %config.probe_object.display(), mode = %config.attach, "Loading packet probe...");
    let mut bpf = Ebpf::load_file(&config.probe_object).map_err(|e| {
        TracerError::ProgramLoadFailed(format!("{}: {}", config.probe_object.display(), e))
    })?;

    if let Err(e) = EbpfLogger::init(&mut bpf) {
        warn!(error = %e, "Failed to initialize EbpfLogger, probe logs will not be visible");
    }

    program_port_filter(&mut bpf, config)?;
    let events = take_event_map(&mut bpf)?;
    Ok((bpf, events))
}

/// Raw `AF_PACKET` socket bound to `interface`, in promiscuous mode for as
/// long as it stays open.
fn open_packet_socket(interface: &str) -> io::Result<OwnedFd> {
    let name = CString::new(interface)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `name` is NUL-terminated and outlives the call
    let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if ifindex == 0 {
        return Err(io::Error::last_os_error());
    }

    let protocol = (libc::ETH_P_ALL as u16).to_be();
    // SAFETY: socket(2) takes no pointers
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::c_int::from(protocol),
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by socket(2) and nothing else owns it
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let addr = libc::sockaddr_ll {
        sll_family: libc::AF_PACKET as u16,
        sll_protocol: protocol,
        sll_ifindex: ifindex as libc::c_int,
        sll_hatype: 0,
        sll_pkttype: 0,
        sll_halen: 0,
        sll_addr: [0; 8],
    };
    // SAFETY: `addr` is a live sockaddr_ll and the length matches it
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    // Membership is dropped by the kernel when the socket closes
    let mreq = libc::packet_mreq {
        mr_ifindex: ifindex as libc::c_int,
        mr_type: libc::PACKET_MR_PROMISC as libc::c_ushort,
        mr_alen: 0,
        mr_address: [0; 8],
    };
    // SAFETY: `mreq` is a live packet_mreq and the length matches it
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_PACKET,
            libc::PACKET_ADD_MEMBERSHIP,
            &mreq as *const libc::packet_mreq as *const libc::c_void,
            mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(socket)
}

fn program_port_filter(bpf: &mut Ebpf, config: &NetworkConfig) -> Result<()> {
    let map = bpf.map_mut(PORT_FILTER_MAP).ok_or_else(|| {
        TracerError::EbpfError(format!("{} map not found in probe object", PORT_FILTER_MAP))
    })?;
    let mut filter: Array<_, u64> =
        Array::try_from(map).map_err(|e: MapError| TracerError::EbpfError(e.to_string()))?;

    let slots = [
        (PORT_FILTER_SRC_INDEX, config.src_port),
        (PORT_FILTER_DST_INDEX, config.dst_port),
    ];
    for (index, port) in slots {
        let value = port.map(u64::from).unwrap_or(0);
        filter
            .set(index, value, 0)
            .map_err(|e| TracerError::EbpfError(format!("port filter slot {}: {}", index, e)))?;
    }
    Ok(())
}

fn take_event_map(bpf: &mut Ebpf) -> Result<KernelEventMap> {
    let available: Vec<_> = bpf.maps().map(|(name, _)| name.to_string()).collect();
    match bpf.take_map(PACKET_EVENTS_MAP) {
        Some(Map::HashMap(data)) => Ok(KernelEventMap::new(data)),
        Some(_) => Err(TracerError::EbpfError(format!(
            "{} is not a hash map",
            PACKET_EVENTS_MAP
        ))),
        None => Err(TracerError::EbpfError(format!(
            "{} map not found in probe object. Available maps: {:?}",
            PACKET_EVENTS_MAP, available
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface_has_no_socket() {
        let err = open_packet_socket("nosuchif0").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODEV));
    }

    #[test]
    fn test_interface_name_with_nul_rejected() {
        let err = open_packet_socket("eth\0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
