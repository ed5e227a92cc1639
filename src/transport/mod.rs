//! Abstract radio link interface.
use crate::error::Result;
use crate::protocol::Packet;

pub use self::loopback::Loopback;
pub use self::serial::{Baudrate, SerialBridge};

mod loopback;
mod serial;

/// Abstraction of the host's end of the radio link.
/// Might be a radio dongle behind a serial port, or an in-process simulation.
///
/// The link acknowledges every delivered frame, and the remote side can
/// attach a previously queued payload to that acknowledgment. `send_raw`
/// reports the acknowledgment, `take_reply` hands out its payload.
pub trait Transport {
    /// Points the link at the bootloader. 40-bit pipe addresses.
    fn open_pipes(&mut self, source: u64, target: u64) -> Result<()> {
        let _ = (source, target);
        Ok(())
    }

    /// Blocks until the frame is acknowledged or the link gives up.
    fn send_raw(&mut self, raw: &[u8]) -> Result<bool>;

    /// Payload carried by the last acknowledgment, if it had one.
    fn take_reply(&mut self) -> Result<Option<Vec<u8>>>;

    fn send(&mut self, packet: Packet) -> Result<bool> {
        let name = packet.name();
        let raw = packet.into_raw()?;
        log::trace!("=> {}", hex::encode(&raw));
        let acked = self.send_raw(&raw)?;
        if !acked {
            log::debug!("{} not acknowledged", name);
        }
        Ok(acked)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open_pipes(&mut self, source: u64, target: u64) -> Result<()> {
        (**self).open_pipes(source, target)
    }

    fn send_raw(&mut self, raw: &[u8]) -> Result<bool> {
        (**self).send_raw(raw)
    }

    fn take_reply(&mut self) -> Result<Option<Vec<u8>>> {
        (**self).take_reply()
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn open_pipes(&mut self, source: u64, target: u64) -> Result<()> {
        (**self).open_pipes(source, target)
    }

    fn send_raw(&mut self, raw: &[u8]) -> Result<bool> {
        (**self).send_raw(raw)
    }

    fn take_reply(&mut self) -> Result<Option<Vec<u8>>> {
        (**self).take_reply()
    }
}
