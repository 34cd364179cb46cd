//! Windows IP Helper FFI for querying TCP/UDP port-to-PID tables.
//!
//! Wraps `GetExtendedTcpTable`/`GetExtendedUdpTable` from `iphlpapi.dll`,
//! IPv4 only (IPv6 is out of scope). This is the unsafe FFI boundary for
//! port resolution: all pointer and byte-order arithmetic stays in this
//! module and its callers only ever see plain `HashMap<u16, u32>`s.

use std::collections::HashMap;

const AF_INET: u32 = 2;
const TCP_TABLE_OWNER_PID_ALL: u32 = 5;
const UDP_TABLE_OWNER_PID: u32 = 1;
const NO_ERROR: u32 = 0;
const ERROR_INSUFFICIENT_BUFFER: u32 = 122;

#[repr(C)]
struct MibTcpRowOwnerPid {
    state: u32,
    local_addr: u32,
    local_port: u32,
    remote_addr: u32,
    remote_port: u32,
    owning_pid: u32,
}

#[repr(C)]
struct MibUdpRowOwnerPid {
    local_addr: u32,
    local_port: u32,
    owning_pid: u32,
}

#[link(name = "iphlpapi")]
extern "system" {
    fn GetExtendedTcpTable(
        pTcpTable: *mut u8,
        pdwSize: *mut u32,
        bOrder: i32,
        ulAf: u32,
        TableClass: u32,
        Reserved: u32,
    ) -> u32;

    fn GetExtendedUdpTable(
        pUdpTable: *mut u8,
        pdwSize: *mut u32,
        bOrder: i32,
        ulAf: u32,
        TableClass: u32,
        Reserved: u32,
    ) -> u32;
}

/// Scan the IPv4 TCP and UDP owner-PID tables. Ports with owning PID 0 are
/// excluded; duplicate ports (rare listen-socket collisions) resolve to
/// the last PID seen in the OS table, matching iteration order (spec §4.2).
pub fn scan() -> (HashMap<u16, u32>, HashMap<u16, u32>) {
    (scan_tcp(), scan_udp())
}

fn scan_tcp() -> HashMap<u16, u32> {
    let mut map = HashMap::new();
    let mut size: u32 = 0;
    // SAFETY: null buffer + size query is the documented way to size the
    // allocation; the second call writes into a buffer we size from the
    // first call's returned value.
    let ret = unsafe {
        GetExtendedTcpTable(std::ptr::null_mut(), &mut size, 0, AF_INET, TCP_TABLE_OWNER_PID_ALL, 0)
    };
    if ret != ERROR_INSUFFICIENT_BUFFER {
        return map;
    }

    let mut buf = vec![0u8; size as usize];
    let ret = unsafe {
        GetExtendedTcpTable(buf.as_mut_ptr(), &mut size, 0, AF_INET, TCP_TABLE_OWNER_PID_ALL, 0)
    };
    if ret != NO_ERROR {
        tracing::warn!("GetExtendedTcpTable failed with code {ret}");
        return map;
    }

    if buf.len() < 4 {
        return map;
    }
    let num_entries = u32::from_ne_bytes(buf[0..4].try_into().unwrap()) as usize;
    let row_size = std::mem::size_of::<MibTcpRowOwnerPid>();

    for i in 0..num_entries {
        let offset = 4 + i * row_size;
        if offset + row_size > buf.len() {
            break;
        }
        // SAFETY: offset/row_size bounds were just checked against buf.len().
        let row = unsafe { &*(buf.as_ptr().add(offset) as *const MibTcpRowOwnerPid) };
        let port = u16::from_be(row.local_port as u16);
        if port > 0 && row.owning_pid > 0 {
            map.insert(port, row.owning_pid);
        }
    }
    map
}

fn scan_udp() -> HashMap<u16, u32> {
    let mut map = HashMap::new();
    let mut size: u32 = 0;
    let ret = unsafe {
        GetExtendedUdpTable(std::ptr::null_mut(), &mut size, 0, AF_INET, UDP_TABLE_OWNER_PID, 0)
    };
    if ret != ERROR_INSUFFICIENT_BUFFER {
        return map;
    }

    let mut buf = vec![0u8; size as usize];
    let ret = unsafe {
        GetExtendedUdpTable(buf.as_mut_ptr(), &mut size, 0, AF_INET, UDP_TABLE_OWNER_PID, 0)
    };
    if ret != NO_ERROR {
        tracing::warn!("GetExtendedUdpTable failed with code {ret}");
        return map;
    }

    if buf.len() < 4 {
        return map;
    }
    let num_entries = u32::from_ne_bytes(buf[0..4].try_into().unwrap()) as usize;
    let row_size = std::mem::size_of::<MibUdpRowOwnerPid>();

    for i in 0..num_entries {
        let offset = 4 + i * row_size;
        if offset + row_size > buf.len() {
            break;
        }
        // SAFETY: offset/row_size bounds were just checked against buf.len().
        let row = unsafe { &*(buf.as_ptr().add(offset) as *const MibUdpRowOwnerPid) };
        let port = u16::from_be(row.local_port as u16);
        if port > 0 && row.owning_pid > 0 {
            map.insert(port, row.owning_pid);
        }
    }
    map
}
