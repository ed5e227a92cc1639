//! Host side of a programming session.

use std::thread::sleep;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

use crate::config::SessionConfig;
use crate::constants::{PAGE_CHUNK_SIZE, PROTOCOL_VERSION_MAJOR, packets, sizes};
use crate::device::PartDB;
use crate::error::{Error, Result};
use crate::image::{Image, Tag};
use crate::protocol::{FailReason, Fuses, HelloInfo, Packet, Version, type_name};
use crate::transport::Transport;

/// What the bootloader reported during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub source: u64,
    pub target: u64,
    pub version: Version,
    pub signature: [u8; 3],
    pub page_size: u8,
    pub available_flash: u16,
    pub fuses: Fuses,
    pub eeprom_size: u16,
}

impl Session {
    /// Payload frames needed to carry one page.
    pub fn packets_per_page(&self) -> usize {
        (self.page_size as usize).div_ceil(PAGE_CHUNK_SIZE)
    }

    /// Data length of chunk `seq` within a page.
    fn chunk_len(&self, seq: usize) -> usize {
        let page = self.page_size as usize;
        PAGE_CHUNK_SIZE.min(page.saturating_sub(seq * PAGE_CHUNK_SIZE))
    }
}

pub struct Flashing<T: Transport> {
    transport: T,
    config: SessionConfig,
    session: Session,
}

impl<T: Transport> Flashing<T> {
    /// Opens the pipes and performs the handshake with the bootloader whose
    /// signature is `expected`.
    pub fn hello(mut transport: T, config: SessionConfig, expected: [u8; 3]) -> Result<Self> {
        transport.open_pipes(config.source, config.target)?;

        let mut flashing = Flashing {
            transport,
            session: Session {
                source: config.source,
                target: config.target,
                version: Version::CURRENT,
                signature: expected,
                page_size: 0,
                available_flash: 0,
                fuses: Fuses::default(),
                eeprom_size: 0,
            },
            config,
        };

        let request = Packet::Hello(HelloInfo::request(expected));
        let retries = flashing.config.hello_retries;
        let mut delivered = false;
        for attempt in 1..=retries {
            delivered = match flashing.transport.send(request.clone()) {
                Ok(acked) => acked,
                Err(err) if err.is_timeout() => false,
                Err(err) => return Err(err),
            };
            flashing.delay();
            if delivered {
                break;
            }
            log::debug!("HELLO attempt {}/{} not acknowledged", attempt, retries);
        }
        if !delivered {
            return Err(Error::RetryExhausted(retries));
        }

        flashing.send(Packet::HelloFlush)?;
        let raw = flashing.take_reply(packets::HELLO)?;
        let info = match Packet::from_raw(&raw)? {
            Packet::CmdFailed(FailReason::VersionMismatch) => {
                return Err(Error::VersionMismatch {
                    expected: PROTOCOL_VERSION_MAJOR,
                    found: None,
                });
            }
            Packet::CmdFailed(FailReason::SignatureMismatch) => {
                return Err(Error::SignatureMismatch {
                    expected,
                    found: None,
                });
            }
            Packet::CmdFailed(FailReason::Unknown(code)) => {
                return Err(Error::Protocol(format!("HELLO rejected with reason {}", code)));
            }
            Packet::Hello(info) if raw.len() == sizes::HELLO => info,
            _ => {
                return Err(Error::Protocol(format!(
                    "expected {}-byte HELLO reply, got {}",
                    sizes::HELLO,
                    hex::encode(&raw)
                )));
            }
        };

        // the reply may have been corrupted on the way back
        if info.version.major != PROTOCOL_VERSION_MAJOR {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION_MAJOR,
                found: Some(info.version.major),
            });
        }
        if info.signature != expected {
            return Err(Error::SignatureMismatch {
                expected,
                found: Some(info.signature),
            });
        }
        if info.page_size == 0 || info.page_size % 2 != 0 {
            return Err(Error::Protocol(format!(
                "bootloader reports page size {}",
                info.page_size
            )));
        }

        let session = &mut flashing.session;
        session.version = info.version;
        session.page_size = info.page_size;
        session.available_flash = info.available_flash;
        session.fuses = info.fuses;
        session.eeprom_size = info.eeprom_size;
        log::debug!("handshake done: {:?}", session);
        Ok(flashing)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn dump_info(&self) -> Result<()> {
        let s = &self.session;
        let part = PartDB::load()?
            .find_by_signature(s.signature)
            .map(|p| p.name)
            .unwrap_or_else(|_| "unknown part".to_string());
        log::info!("Source address: {:010x}", s.source);
        log::info!("Target address: {:010x}", s.target);
        log::info!("HELLO retries: {}", self.config.hello_retries);
        log::info!("Signature: {} ({})", hex::encode(s.signature), part);
        log::info!("Bootloader version: {}", s.version);
        log::info!("Page size: {} bytes", s.page_size);
        log::info!("Available flash: {} bytes", s.available_flash);
        log::info!(
            "Fuses: low 0x{:02x}, high 0x{:02x}, extended 0x{:02x}, lock 0x{:02x}",
            s.fuses.low,
            s.fuses.high,
            s.fuses.extended,
            s.fuses.lock
        );
        log::info!("EEPROM size: {} bytes", s.eeprom_size);
        Ok(())
    }

    /// Programs `image` and reads it back for comparison.
    pub fn upload(&mut self, image: &Image) -> Result<()> {
        self.program(image)?;
        let readback = self.download(image.min_address(), image.max_address())?;
        self.verify(image, &readback)?;
        log::info!("Verified {} bytes", image.total_allocated_bytes());
        Ok(())
    }

    /// Writes every page the image touches. Bytes the image does not
    /// allocate are written as erased flash.
    pub fn program(&mut self, image: &Image) -> Result<()> {
        let available = self.session.available_flash as usize;
        if image.total_allocated_bytes() > available {
            return Err(Error::ImageTooLarge {
                size: image.total_allocated_bytes(),
                available,
            });
        }
        if image.max_address() as usize >= available {
            return Err(Error::ImageTooLarge {
                size: image.max_address() as usize + 1,
                available,
            });
        }

        let page = self.session.page_size as usize;
        let start = image.min_address() as usize / page * page;
        let pages = (image.max_address() as usize + 1 - start).div_ceil(page);
        log::info!(
            "Programming {} pages from 0x{:04x}",
            pages,
            start
        );

        let started = Instant::now();
        let bar = self.progress_bar(pages as u64);
        for index in 0..pages {
            let base = start + index * page;
            self.send(Packet::PageProg {
                address: base as u16,
            })?;
            let mut offset = 0;
            for seq in 0..self.session.packets_per_page() {
                let len = self.session.chunk_len(seq);
                let data = (base + offset..base + offset + len)
                    .map(|address| image.byte_or_filler(address as u32))
                    .collect();
                self.send(Packet::PageProgPayload {
                    seq: seq as u8,
                    data,
                })?;
                offset += len;
            }
            bar.inc(1);
        }
        bar.finish_and_clear();
        log_statistics("Programmed", pages * page, started);
        Ok(())
    }

    /// Reads the whole application section.
    pub fn download_all(&mut self) -> Result<Image> {
        let available = self.session.available_flash;
        if available == 0 {
            return Err(Error::AddressOutOfRange {
                address: 0,
                limit: 0,
            });
        }
        self.download(0, available - 1)
    }

    /// Reads `[start, end]` back from flash, page by page.
    pub fn download(&mut self, start: u16, end: u16) -> Result<Image> {
        let available = self.session.available_flash as u32;
        if start > end {
            return Err(Error::AddressOutOfRange {
                address: start as u32,
                limit: end as u32,
            });
        }
        if end as u32 >= available || (end - start) as u32 + 1 > available {
            return Err(Error::AddressOutOfRange {
                address: end as u32,
                limit: available,
            });
        }

        let page = self.session.page_size as usize;
        let span = (end - start) as usize + 1;
        let pages = span.div_ceil(page);
        log::info!("Reading 0x{:04x}..=0x{:04x} ({} pages)", start, end, pages);

        let started = Instant::now();
        let bar = self.progress_bar(pages as u64);
        let mut bytes = Vec::with_capacity(pages * page);
        for index in 0..pages {
            let address = start as usize + index * page;
            self.send(Packet::PageRead {
                address: address as u16,
            })?;
            for seq in 0..self.session.packets_per_page() {
                self.send(Packet::PageReadFlush)?;
                let len = self.session.chunk_len(seq);
                let raw = self.take_reply(packets::PAGE_READ_PAYLOAD)?;
                match Packet::from_raw(&raw)? {
                    Packet::PageReadPayload { seq: got, data }
                        if data.len() == len && got as usize == seq =>
                    {
                        bytes.extend_from_slice(&data);
                    }
                    Packet::PageReadPayload { seq: got, data } => {
                        return Err(Error::Protocol(format!(
                            "page 0x{:04x}: chunk {} of {} bytes, expected chunk {} of {} bytes",
                            address,
                            got,
                            data.len(),
                            seq,
                            len
                        )));
                    }
                    other => {
                        return Err(Error::Protocol(format!(
                            "expected PAGE_READ_PAYLOAD, got {}",
                            other.name()
                        )));
                    }
                }
            }
            bar.inc(1);
        }
        bar.finish_and_clear();
        log_statistics("Read", bytes.len(), started);

        bytes.truncate(span);
        Image::from_map(start, bytes, vec![Tag::Allocated; span])
    }

    /// Compares every allocated byte of `expected` against `actual`.
    pub fn verify(&self, expected: &Image, actual: &Image) -> Result<()> {
        for (address, value) in expected.allocated() {
            let found = actual.byte_or_filler(address as u32);
            if actual.get(address) != Some(value) {
                return Err(Error::VerificationFailed {
                    address,
                    expected: value,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Writes the image's allocated bytes to EEPROM, then reads them back.
    pub fn eeprom_upload(&mut self, image: &Image) -> Result<()> {
        let size = self.session.eeprom_size as u32;
        if image.max_address() as u32 >= size {
            return Err(Error::AddressOutOfRange {
                address: image.max_address() as u32,
                limit: size,
            });
        }

        let count = image.total_allocated_bytes();
        log::info!("Writing {} EEPROM bytes", count);
        let started = Instant::now();
        let bar = self.progress_bar(count as u64);
        for (address, value) in image.allocated() {
            self.send(Packet::EepromProg { address, value })?;
            bar.inc(1);
        }
        bar.finish_and_clear();
        log_statistics("Wrote", count, started);

        for (address, value) in image.allocated() {
            let found = self.eeprom_read(address)?;
            if found != value {
                return Err(Error::VerificationFailed {
                    address,
                    expected: value,
                    found,
                });
            }
        }
        log::info!("Verified {} EEPROM bytes", count);
        Ok(())
    }

    /// Reads the whole EEPROM.
    pub fn eeprom_download(&mut self) -> Result<Image> {
        let size = self.session.eeprom_size;
        if size == 0 {
            return Err(Error::AddressOutOfRange {
                address: 0,
                limit: 0,
            });
        }
        log::info!("Reading {} EEPROM bytes", size);
        let started = Instant::now();
        let bar = self.progress_bar(size as u64);
        let mut bytes = Vec::with_capacity(size as usize);
        for address in 0..size {
            bytes.push(self.eeprom_read(address)?);
            bar.inc(1);
        }
        bar.finish_and_clear();
        log_statistics("Read", bytes.len(), started);
        Image::from_bytes(0, bytes)
    }

    /// Ends the session; the bootloader starts the application.
    pub fn finish(mut self) -> Result<T> {
        self.send(Packet::Done)?;
        log::info!("Session done");
        Ok(self.transport)
    }

    fn eeprom_read(&mut self, address: u16) -> Result<u8> {
        self.send(Packet::EepromRead { address })?;
        self.send(Packet::EepromReadFlush)?;
        let raw = self.take_reply(packets::EEPROM_READ_PAYLOAD)?;
        if raw.len() != sizes::EEPROM_READ_PAYLOAD {
            return Err(Error::Protocol(format!(
                "EEPROM_READ_PAYLOAD of {} bytes",
                raw.len()
            )));
        }
        match Packet::from_raw(&raw)? {
            Packet::EepromReadPayload { value } => Ok(value),
            other => Err(Error::Protocol(format!(
                "expected EEPROM_READ_PAYLOAD, got {}",
                other.name()
            ))),
        }
    }

    fn send(&mut self, packet: Packet) -> Result<()> {
        let name = packet.name();
        log::debug!("sending {}", name);
        let acked = self.transport.send(packet)?;
        self.delay();
        if !acked {
            return Err(Error::Undelivered(name));
        }
        Ok(())
    }

    /// Reply carried by the last acknowledgment. A `CMD_FAILED` reply is
    /// passed through for the caller to interpret.
    fn take_reply(&mut self, expected: u8) -> Result<Vec<u8>> {
        let raw = self.transport.take_reply()?.ok_or_else(|| {
            Error::Protocol(format!("no reply, expected {}", type_name(expected)))
        })?;
        log::trace!("<= {}", hex::encode(&raw));
        match raw.first() {
            Some(&code) if code == expected || code == packets::CMD_FAILED => Ok(raw),
            Some(&code) => Err(Error::Protocol(format!(
                "expected {}, got {}",
                type_name(expected),
                type_name(code)
            ))),
            None => Err(Error::Protocol("empty reply".into())),
        }
    }

    fn delay(&self) {
        let delay = self.config.post_send_delay();
        if !delay.is_zero() {
            sleep(delay);
        }
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.config.progress {
            return ProgressBar::hidden();
        }
        let style = ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        ProgressBar::new(len).with_style(style)
    }
}

fn log_statistics(what: &str, bytes: usize, started: Instant) {
    let secs = started.elapsed().as_secs_f64();
    let rate = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
    log::info!("{} {} bytes in {:.2} s ({:.0} bytes/s)", what, bytes, secs, rate);
}
