//! The packet catalog spoken between host and bootloader.
//!
//! Every frame is one type byte followed by a type-specific payload, at most
//! [`MAX_PACKET_SIZE`] bytes in total. Multi-byte fields are little-endian.

use std::fmt;

use scroll::{Pread, Pwrite};
use thiserror::Error;

use crate::constants::{
    MAX_PACKET_SIZE, PAGE_CHUNK_SIZE, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR,
    fail_reasons, packets, sizes,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("{kind} frame has invalid length {len}")]
    InvalidLength { kind: &'static str, len: usize },
    #[error("{kind} payload of {len} bytes does not fit in a frame")]
    PayloadTooLong { kind: &'static str, len: usize },
    #[error("field access out of bounds: {0}")]
    Scroll(String),
}

impl From<scroll::Error> for FrameError {
    fn from(err: scroll::Error) -> Self {
        FrameError::Scroll(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const CURRENT: Version = Version {
        major: PROTOCOL_VERSION_MAJOR,
        minor: PROTOCOL_VERSION_MINOR,
    };
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Fuses {
    pub low: u8,
    pub high: u8,
    pub extended: u8,
    pub lock: u8,
}

impl From<[u8; 4]> for Fuses {
    fn from(raw: [u8; 4]) -> Self {
        Fuses {
            low: raw[0],
            high: raw[1],
            extended: raw[2],
            lock: raw[3],
        }
    }
}

/// Body of a HELLO frame.
///
/// The host sends it with only version and signature filled in (the
/// capability fields stay zero); the bootloader answers with all fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HelloInfo {
    pub version: Version,
    pub signature: [u8; 3],
    pub page_size: u8,
    pub available_flash: u16,
    pub fuses: Fuses,
    pub eeprom_size: u16,
}

impl HelloInfo {
    pub fn request(signature: [u8; 3]) -> Self {
        HelloInfo {
            version: Version::CURRENT,
            signature,
            page_size: 0,
            available_flash: 0,
            fuses: Fuses::default(),
            eeprom_size: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailReason {
    VersionMismatch,
    SignatureMismatch,
    Unknown(u8),
}

impl From<u8> for FailReason {
    fn from(code: u8) -> Self {
        match code {
            fail_reasons::VERSION_MISMATCH => FailReason::VersionMismatch,
            fail_reasons::SIGNATURE_MISMATCH => FailReason::SignatureMismatch,
            other => FailReason::Unknown(other),
        }
    }
}

impl From<FailReason> for u8 {
    fn from(reason: FailReason) -> Self {
        match reason {
            FailReason::VersionMismatch => fail_reasons::VERSION_MISMATCH,
            FailReason::SignatureMismatch => fail_reasons::SIGNATURE_MISMATCH,
            FailReason::Unknown(code) => code,
        }
    }
}

/// One radio frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Packet {
    /// Handshake. Request and queued reply share the layout.
    Hello(HelloInfo),
    /// Retrieves the queued HELLO reply.
    HelloFlush,
    /// Ends the session, the device leaves the bootloader.
    Done,
    /// Loads a page from flash and queues its first chunk.
    PageRead { address: u16 },
    PageReadPayload { seq: u8, data: Vec<u8> },
    /// Retrieves the next queued page chunk.
    PageReadFlush,
    /// Starts erasing the page at `address`.
    PageProg { address: u16 },
    PageProgPayload { seq: u8, data: Vec<u8> },
    EepromRead { address: u16 },
    EepromReadPayload { value: u8 },
    EepromReadFlush,
    /// Writes one EEPROM byte. No reply.
    EepromProg { address: u16, value: u8 },
    CmdFailed(FailReason),
}

impl Packet {
    pub fn type_code(&self) -> u8 {
        match self {
            Packet::Hello(_) => packets::HELLO,
            Packet::HelloFlush => packets::HELLO_FLUSH,
            Packet::Done => packets::DONE,
            Packet::PageRead { .. } => packets::PAGE_READ,
            Packet::PageReadPayload { .. } => packets::PAGE_READ_PAYLOAD,
            Packet::PageReadFlush => packets::PAGE_READ_FLUSH,
            Packet::PageProg { .. } => packets::PAGE_PROG,
            Packet::PageProgPayload { .. } => packets::PAGE_PROG_PAYLOAD,
            Packet::EepromRead { .. } => packets::EEPROM_READ,
            Packet::EepromReadPayload { .. } => packets::EEPROM_READ_PAYLOAD,
            Packet::EepromReadFlush => packets::EEPROM_READ_FLUSH,
            Packet::EepromProg { .. } => packets::EEPROM_PROG,
            Packet::CmdFailed(_) => packets::CMD_FAILED,
        }
    }

    pub fn name(&self) -> &'static str {
        type_name(self.type_code())
    }

    pub fn into_raw(self) -> Result<Vec<u8>, FrameError> {
        let code = self.type_code();
        match self {
            Packet::Hello(info) => {
                let mut buf = vec![0u8; sizes::HELLO];
                buf[0] = code;
                buf[1] = info.version.major;
                buf[2] = info.version.minor;
                buf[3..6].copy_from_slice(&info.signature);
                buf[6] = info.page_size;
                buf.pwrite_with(info.available_flash, 7, scroll::LE)?;
                buf[9] = info.fuses.low;
                buf[10] = info.fuses.high;
                buf[11] = info.fuses.extended;
                buf[12] = info.fuses.lock;
                buf.pwrite_with(info.eeprom_size, 13, scroll::LE)?;
                Ok(buf)
            }
            Packet::HelloFlush
            | Packet::Done
            | Packet::PageReadFlush
            | Packet::EepromReadFlush => Ok(vec![code]),
            Packet::PageRead { address }
            | Packet::PageProg { address }
            | Packet::EepromRead { address } => {
                let mut buf = vec![code, 0, 0];
                buf.pwrite_with(address, 1, scroll::LE)?;
                Ok(buf)
            }
            Packet::PageReadPayload { seq, data } | Packet::PageProgPayload { seq, data } => {
                if data.len() > PAGE_CHUNK_SIZE {
                    return Err(FrameError::PayloadTooLong {
                        kind: type_name(code),
                        len: data.len(),
                    });
                }
                let mut buf = Vec::with_capacity(2 + data.len());
                buf.push(code);
                buf.push(seq);
                buf.extend(data);
                Ok(buf)
            }
            Packet::EepromReadPayload { value } => Ok(vec![code, value]),
            Packet::EepromProg { address, value } => {
                let mut buf = vec![code, 0, 0, value];
                buf.pwrite_with(address, 1, scroll::LE)?;
                Ok(buf)
            }
            Packet::CmdFailed(reason) => Ok(vec![code, reason.into()]),
        }
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self, FrameError> {
        let (&code, _) = raw.split_first().ok_or(FrameError::Empty)?;
        let expect = |ok: bool| {
            if ok && raw.len() <= MAX_PACKET_SIZE {
                Ok(())
            } else {
                Err(FrameError::InvalidLength {
                    kind: type_name(code),
                    len: raw.len(),
                })
            }
        };
        let packet = match code {
            packets::HELLO => {
                // requests may omit the zeroed capability fields
                expect(raw.len() >= sizes::HELLO_MIN)?;
                let mut full = [0u8; sizes::HELLO];
                let n = raw.len().min(sizes::HELLO);
                full[..n].copy_from_slice(&raw[..n]);
                Packet::Hello(HelloInfo {
                    version: Version {
                        major: full[1],
                        minor: full[2],
                    },
                    signature: [full[3], full[4], full[5]],
                    page_size: full[6],
                    available_flash: full.pread_with(7, scroll::LE)?,
                    fuses: Fuses::from([full[9], full[10], full[11], full[12]]),
                    eeprom_size: full.pread_with(13, scroll::LE)?,
                })
            }
            packets::HELLO_FLUSH => {
                expect(raw.len() == sizes::FLUSH)?;
                Packet::HelloFlush
            }
            packets::DONE => {
                expect(raw.len() == sizes::FLUSH)?;
                Packet::Done
            }
            packets::PAGE_READ_FLUSH => {
                expect(raw.len() == sizes::FLUSH)?;
                Packet::PageReadFlush
            }
            packets::EEPROM_READ_FLUSH => {
                expect(raw.len() == sizes::FLUSH)?;
                Packet::EepromReadFlush
            }
            packets::PAGE_READ | packets::PAGE_PROG | packets::EEPROM_READ => {
                expect(raw.len() == sizes::ADDRESSED)?;
                let address: u16 = raw.pread_with(1, scroll::LE)?;
                match code {
                    packets::PAGE_READ => Packet::PageRead { address },
                    packets::PAGE_PROG => Packet::PageProg { address },
                    _ => Packet::EepromRead { address },
                }
            }
            packets::PAGE_READ_PAYLOAD | packets::PAGE_PROG_PAYLOAD => {
                expect(raw.len() > 2)?;
                let seq = raw[1];
                let data = raw[2..].to_vec();
                if code == packets::PAGE_READ_PAYLOAD {
                    Packet::PageReadPayload { seq, data }
                } else {
                    Packet::PageProgPayload { seq, data }
                }
            }
            packets::EEPROM_READ_PAYLOAD => {
                expect(raw.len() == sizes::EEPROM_READ_PAYLOAD)?;
                Packet::EepromReadPayload { value: raw[1] }
            }
            packets::EEPROM_PROG => {
                expect(raw.len() == sizes::EEPROM_PROG)?;
                Packet::EepromProg {
                    address: raw.pread_with(1, scroll::LE)?,
                    value: raw[3],
                }
            }
            packets::CMD_FAILED => {
                expect(raw.len() == sizes::CMD_FAILED)?;
                Packet::CmdFailed(FailReason::from(raw[1]))
            }
            other => return Err(FrameError::UnknownType(other)),
        };
        Ok(packet)
    }
}

/// Human readable name of a type code, for logs and errors.
pub fn type_name(code: u8) -> &'static str {
    match code {
        packets::HELLO => "HELLO",
        packets::HELLO_FLUSH => "HELLO_FLUSH",
        packets::DONE => "DONE",
        packets::PAGE_READ => "PAGE_READ",
        packets::PAGE_READ_PAYLOAD => "PAGE_READ_PAYLOAD",
        packets::PAGE_READ_FLUSH => "PAGE_READ_FLUSH",
        packets::PAGE_PROG => "PAGE_PROG",
        packets::PAGE_PROG_PAYLOAD => "PAGE_PROG_PAYLOAD",
        packets::EEPROM_READ => "EEPROM_READ",
        packets::EEPROM_READ_PAYLOAD => "EEPROM_READ_PAYLOAD",
        packets::EEPROM_READ_FLUSH => "EEPROM_READ_FLUSH",
        packets::EEPROM_PROG => "EEPROM_PROG",
        packets::CMD_FAILED => "CMD_FAILED",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_reply_layout() {
        let info = HelloInfo {
            version: Version { major: 1, minor: 0 },
            signature: [0x1e, 0x95, 0x0f],
            page_size: 128,
            available_flash: 0x7800,
            fuses: Fuses::from([0xff, 0xda, 0xfd, 0xff]),
            eeprom_size: 1024,
        };
        let raw = Packet::Hello(info).into_raw().unwrap();
        assert_eq!(
            raw,
            [2, 1, 0, 0x1e, 0x95, 0x0f, 128, 0x00, 0x78, 0xff, 0xda, 0xfd, 0xff, 0x00, 0x04]
        );
        assert_eq!(Packet::from_raw(&raw).unwrap(), Packet::Hello(info));
    }

    #[test]
    fn hello_request_pads_capabilities_with_zero() {
        let raw = Packet::Hello(HelloInfo::request([0x1e, 0x95, 0x0f]))
            .into_raw()
            .unwrap();
        assert_eq!(raw.len(), sizes::HELLO);
        assert!(raw[6..].iter().all(|&b| b == 0));

        // short requests still decode
        match Packet::from_raw(&raw[..6]).unwrap() {
            Packet::Hello(info) => assert_eq!(info.signature, [0x1e, 0x95, 0x0f]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn addresses_are_little_endian() {
        let raw = Packet::PageProg { address: 0x1280 }.into_raw().unwrap();
        assert_eq!(raw, [23, 0x80, 0x12]);
        let raw = Packet::EepromProg {
            address: 0x0102,
            value: 0xaa,
        }
        .into_raw()
        .unwrap();
        assert_eq!(raw, [53, 0x02, 0x01, 0xaa]);
    }

    #[test]
    fn payload_longer_than_frame_is_rejected() {
        let err = Packet::PageProgPayload {
            seq: 0,
            data: vec![0; PAGE_CHUNK_SIZE + 1],
        }
        .into_raw()
        .unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLong { len: 31, .. }));
    }

    #[test]
    fn malformed_frames() {
        assert_eq!(Packet::from_raw(&[]), Err(FrameError::Empty));
        assert_eq!(Packet::from_raw(&[7]), Err(FrameError::UnknownType(7)));
        assert!(matches!(
            Packet::from_raw(&[packets::PAGE_READ, 0x00]),
            Err(FrameError::InvalidLength { len: 2, .. })
        ));
        assert!(matches!(
            Packet::from_raw(&[packets::PAGE_PROG_PAYLOAD, 0]),
            Err(FrameError::InvalidLength { .. })
        ));
        assert!(Packet::from_raw(&[packets::PAGE_PROG_PAYLOAD; 33]).is_err());
    }

    #[test]
    fn cmd_failed_reasons() {
        assert_eq!(
            Packet::from_raw(&[251, 3]).unwrap(),
            Packet::CmdFailed(FailReason::SignatureMismatch)
        );
        assert_eq!(
            Packet::from_raw(&[251, 9]).unwrap(),
            Packet::CmdFailed(FailReason::Unknown(9))
        );
        assert_eq!(
            Packet::CmdFailed(FailReason::VersionMismatch)
                .into_raw()
                .unwrap(),
            [251, 2]
        );
    }
}
