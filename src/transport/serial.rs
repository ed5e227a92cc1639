//! Radio bridge behind a serial port.
//!
//! A USB-UART dongle owns the radio. Requests are framed as
//! `57 AB cmd len payload.. sum`, responses as `57 AB cmd status len payload.. sum`,
//! where `sum` is the wrapping byte sum of everything after the prefix.
use std::{
    fmt::Display,
    io::{Read, Write},
    time::Duration,
};

use clap::{ValueEnum, builder::PossibleValue};
use serialport::{ClearBuffer, SerialPort};

use super::Transport;
use crate::error::{Error, Result};

const PREFIX: [u8; 2] = [0x57, 0xab];

mod commands {
    pub const OPEN_PIPES: u8 = 0x01;
    pub const SEND: u8 = 0x02;
}

const STATUS_OK: u8 = 0x00;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Baudrate {
    #[default]
    Baud115200,
    Baud500k,
    Baud1m,
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        match value {
            Baudrate::Baud115200 => 115200,
            Baudrate::Baud500k => 500000,
            Baudrate::Baud1m => 1000000,
        }
    }
}

impl Display for Baudrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

impl ValueEnum for Baudrate {
    fn value_variants<'a>() -> &'a [Self] {
        &[Baudrate::Baud115200, Baudrate::Baud500k, Baudrate::Baud1m]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Baudrate::Baud115200 => Some(PossibleValue::new("Baud115200").aliases(["115200"])),
            Baudrate::Baud500k => {
                Some(PossibleValue::new("Baud500k").aliases(["500000", "500_000", "500k"]))
            }
            Baudrate::Baud1m => {
                Some(PossibleValue::new("Baud1m").aliases(["1000000", "1_000_000", "1m"]))
            }
        }
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &val| acc.wrapping_add(val))
}

fn encode_request(cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u8::try_from(payload.len())
        .map_err(|_| Error::Protocol(format!("bridge payload of {} bytes", payload.len())))?;
    let mut v = Vec::with_capacity(payload.len() + 5);
    v.extend_from_slice(&PREFIX); // Append request prefix
    v.push(cmd);
    v.push(len);
    v.extend_from_slice(payload);
    v.push(checksum(&v[2..]));
    Ok(v)
}

/// Reads one response to `cmd`, returning its status and payload.
fn read_response<R: Read + ?Sized>(reader: &mut R, cmd: u8) -> Result<(u8, Vec<u8>)> {
    // prefix, cmd, status, len
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[..2] != PREFIX {
        return Err(Error::Protocol(format!(
            "bad bridge response prefix {}",
            hex::encode(&header[..2])
        )));
    }
    if header[2] != cmd {
        return Err(Error::Protocol(format!(
            "bridge answered command 0x{:02x} to 0x{:02x}",
            header[2], cmd
        )));
    }
    // payload + sum
    let mut body = vec![0u8; header[4] as usize + 1];
    reader.read_exact(&mut body)?;
    let (sum, payload) = body.split_last().ok_or(Error::Protocol("empty bridge response".into()))?;
    let expected = checksum(&header[2..]).wrapping_add(checksum(payload));
    if *sum != expected {
        return Err(Error::Protocol(format!(
            "bridge response checksum 0x{:02x}, expected 0x{:02x}",
            sum, expected
        )));
    }
    Ok((header[3], payload.to_vec()))
}

pub struct SerialBridge {
    serial_port: Box<dyn SerialPort>,
    reply: Option<Vec<u8>>,
}

impl SerialBridge {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports().map_err(std::io::Error::from)?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    /// `timeout` bounds every bridge exchange, including the radio's own
    /// retransmissions of a frame.
    pub fn open(port: &str, baudrate: Baudrate, timeout: Duration) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let port = serialport::new(port, baudrate.into())
            .timeout(timeout)
            .open()
            .map_err(std::io::Error::from)?;
        Ok(SerialBridge {
            serial_port: port,
            reply: None,
        })
    }

    pub fn open_nth(nth: usize, baudrate: Baudrate, timeout: Duration) -> Result<Self> {
        let ports = Self::scan_ports()?;
        if ports.len() > 1 {
            log::info!("Available serial ports: {}", ports.join(", "));
        }

        match ports.get(nth) {
            Some(port) => Self::open(port, baudrate, timeout),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No serial ports found!",
            ))),
        }
    }

    pub fn open_any(baudrate: Baudrate, timeout: Duration) -> Result<Self> {
        Self::open_nth(0, baudrate, timeout)
    }

    fn exchange(&mut self, cmd: u8, payload: &[u8]) -> Result<(u8, Vec<u8>)> {
        let req = encode_request(cmd, payload)?;
        self.serial_port.write_all(&req)?;
        self.serial_port.flush()?;
        read_response(&mut self.serial_port, cmd)
    }
}

impl Transport for SerialBridge {
    fn open_pipes(&mut self, source: u64, target: u64) -> Result<()> {
        let mut payload = Vec::with_capacity(10);
        payload.extend_from_slice(&source.to_le_bytes()[..5]);
        payload.extend_from_slice(&target.to_le_bytes()[..5]);
        let (status, _) = self.exchange(commands::OPEN_PIPES, &payload)?;
        if status != STATUS_OK {
            return Err(Error::Protocol(format!(
                "bridge refused to open pipes (status 0x{:02x})",
                status
            )));
        }
        log::debug!("Pipes open: {:010x} -> {:010x}", source, target);
        Ok(())
    }

    /// A bridge that does not answer in time counts as an unacknowledged
    /// frame. Whatever part of its response already arrived is discarded.
    fn send_raw(&mut self, raw: &[u8]) -> Result<bool> {
        self.reply = None;
        let (status, payload) = match self.exchange(commands::SEND, raw) {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                log::debug!("bridge timed out, dropping input");
                self.serial_port
                    .clear(ClearBuffer::Input)
                    .map_err(std::io::Error::from)?;
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        if status != STATUS_OK {
            return Ok(false);
        }
        if !payload.is_empty() {
            self.reply = Some(payload);
        }
        Ok(true)
    }

    fn take_reply(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.reply.take())
    }
}
