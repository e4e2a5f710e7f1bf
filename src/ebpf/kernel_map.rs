//! `BPF_MAP_LOOKUP_AND_DELETE_BATCH` over the packet event hash map
//!
//! aya does not wrap the batch commands, so the call goes straight through
//! the `bpf(2)` syscall on the map's fd.

use super::drain::{Batch, BatchMap};
use aya::maps::MapData;
use proctrace_common::PacketEvent;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd};

const BPF_MAP_LOOKUP_AND_DELETE_BATCH: libc::c_int = 25;

/// `bpf_attr` layout for the `BPF_MAP_*_BATCH` commands.
#[repr(C)]
#[derive(Debug, Default)]
struct BatchAttr {
    in_batch: u64,
    out_batch: u64,
    keys: u64,
    values: u64,
    count: u32,
    map_fd: u32,
    elem_flags: u64,
    flags: u64,
}

/// The kernel-resident packet event map, owned by the probe.
pub struct KernelEventMap {
    data: MapData,
}

impl KernelEventMap {
    pub fn new(data: MapData) -> Self {
        Self { data }
    }
}

impl BatchMap for KernelEventMap {
    fn lookup_and_delete_batch(
        &mut self,
        cursor: Option<u64>,
        keys: &mut [u64],
        values: &mut [PacketEvent],
    ) -> io::Result<Batch> {
        let capacity = keys.len().min(values.len());
        let in_batch = cursor.unwrap_or_default();
        let mut out_batch: u64 = 0;

        let mut attr = BatchAttr {
            in_batch: match cursor {
                Some(_) => &in_batch as *const u64 as u64,
                None => 0,
            },
            out_batch: &mut out_batch as *mut u64 as u64,
            keys: keys.as_mut_ptr() as u64,
            values: values.as_mut_ptr() as u64,
            count: capacity as u32,
            map_fd: self.data.fd().as_fd().as_raw_fd() as u32,
            ..Default::default()
        };

        // SAFETY: the attr points at buffers that outlive the call, sized to
        // `count` keys and values of the map's key/value size.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_MAP_LOOKUP_AND_DELETE_BATCH,
                &mut attr as *mut BatchAttr,
                mem::size_of::<BatchAttr>() as libc::c_uint,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT marks the end of the map; `count` still holds the
            // entries copied out by this last call.
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(Batch {
                    count: attr.count as usize,
                    next_cursor: out_batch,
                    exhausted: true,
                });
            }
            return Err(err);
        }

        Ok(Batch {
            count: attr.count as usize,
            next_cursor: out_batch,
            exhausted: false,
        })
    }
}
