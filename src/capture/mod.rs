//! Platform-specific packet capture backends, behind a single safe trait.
//!
//! All pointer and byte-order arithmetic against the kernel hook lives in
//! this module (and its platform submodules) so the engine never touches
//! raw pointers directly (Design Notes, spec §9).
//!
//! - Windows: WinDivert 2.x (`windivert_backend`)
//! - macOS: pf + dnctl (`pf_backend`)
//! - Tests/other platforms: an in-process synthetic source (`NullCapture`)

#[cfg(target_os = "windows")]
pub mod windivert_backend;

#[cfg(target_os = "macos")]
pub mod pf_backend;

use crate::error::CoreError;

/// Per-packet metadata carried alongside the raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketAddr {
    /// `true` if the packet originated on this host (host -> network).
    pub outbound: bool,
    /// `true` if the packet is IPv6 (bypasses all accounting/enforcement).
    pub ipv6: bool,
}

/// IANA protocol numbers this engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn from_ip_byte(byte: u8) -> Option<Protocol> {
        match byte {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }
}

/// Safe, invariant-checked handle to the kernel packet hook.
///
/// The filter an implementation installs MUST select IPv4 TCP and UDP
/// packets only (spec §4.1). Every method is best-effort except `recv`,
/// whose `Err` return is the sole cancellation signal for the hot loop.
pub trait PacketCapture: Send {
    /// Blocking read of the next matching packet into `buf`. Returns the
    /// number of bytes written and the packet's address metadata.
    /// Returns `Err` only when the handle has been closed.
    fn recv(&self, buf: &mut [u8]) -> Result<(usize, PacketAddr), CoreError>;

    /// Reinject a packet. Best-effort: failures are logged by the caller,
    /// never fatal (a failed reinject is equivalent to a natural drop).
    fn send(&self, buf: &[u8], addr: PacketAddr) -> Result<(), CoreError>;

    /// Unblock any pending `recv` on this handle with `Err`.
    fn close(&self);

    /// Recompute network/transport checksums in `buf` in place. Best-effort;
    /// any internal failure is swallowed by the implementation.
    fn fix_checksums(&self, buf: &mut [u8], addr: PacketAddr);
}

/// Open the platform-appropriate capture backend with a filter selecting
/// IPv4 TCP and UDP only.
pub fn open_default() -> Result<Box<dyn PacketCapture>, CoreError> {
    #[cfg(target_os = "windows")]
    {
        windivert_backend::open("ip and (tcp or udp)")
    }
    #[cfg(target_os = "macos")]
    {
        pf_backend::open()
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        Err(CoreError::MissingCaptureLib(
            "no packet capture backend is available on this platform".into(),
        ))
    }
}

/// Parsed IPv4 transport-layer header fields the engine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub protocol: Protocol,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Parse an IPv4 packet's protocol and transport ports (spec §4.6 step 5-6).
///
/// Returns `None` for anything that is not a well-formed IPv4 TCP/UDP
/// packet with at least 4 bytes of transport header following the IP
/// header — truncated or non-IPv4/non-TCP/UDP packets are the caller's
/// cue to reinject untouched without accounting or enforcement.
pub fn parse_ipv4_header(data: &[u8]) -> Option<ParsedHeader> {
    if data.len() < 20 {
        return None;
    }
    let version = data[0] >> 4;
    if version != 4 {
        return None;
    }

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < 20 || ihl + 4 > data.len() {
        return None;
    }

    let protocol = Protocol::from_ip_byte(data[9])?;
    let src_port = u16::from_be_bytes([data[ihl], data[ihl + 1]]);
    let dst_port = u16::from_be_bytes([data[ihl + 2], data[ihl + 3]]);

    Some(ParsedHeader {
        protocol,
        src_port,
        dst_port,
    })
}

/// An in-process, non-kernel capture backend used by tests and by the
/// "cooperating synthetic packet source" end-to-end scenarios (spec §8).
///
/// Packets are fed in via `inject` and drained by `recv`. Closing unblocks
/// any thread parked in `recv`.
pub mod null_backend {
    use super::{CoreError, PacketAddr, PacketCapture};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Condvar, Mutex};

    #[derive(Default)]
    struct Queue {
        packets: VecDeque<(Vec<u8>, PacketAddr)>,
    }

    pub struct NullCapture {
        queue: Mutex<Queue>,
        cv: Condvar,
        closed: AtomicBool,
        pub sent: Mutex<Vec<(Vec<u8>, PacketAddr)>>,
    }

    impl NullCapture {
        pub fn new() -> Self {
            Self {
                queue: Mutex::new(Queue::default()),
                cv: Condvar::new(),
                closed: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            }
        }

        /// Feed a synthetic packet to the next `recv` call.
        pub fn inject(&self, data: Vec<u8>, addr: PacketAddr) {
            let mut q = self.queue.lock().unwrap();
            q.packets.push_back((data, addr));
            self.cv.notify_one();
        }
    }

    impl Default for NullCapture {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PacketCapture for NullCapture {
        fn recv(&self, buf: &mut [u8]) -> Result<(usize, PacketAddr), CoreError> {
            let mut q = self.queue.lock().unwrap();
            loop {
                if let Some((data, addr)) = q.packets.pop_front() {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    return Ok((n, addr));
                }
                if self.closed.load(Ordering::Acquire) {
                    return Err(CoreError::Io("capture handle closed".into()));
                }
                q = self.cv.wait(q).unwrap();
            }
        }

        fn send(&self, buf: &[u8], addr: PacketAddr) -> Result<(), CoreError> {
            self.sent.lock().unwrap().push((buf.to_vec(), addr));
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
            let _guard = self.queue.lock().unwrap();
            self.cv.notify_all();
        }

        fn fix_checksums(&self, _buf: &mut [u8], _addr: PacketAddr) {}
    }
}
