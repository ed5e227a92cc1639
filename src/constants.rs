
/// Largest frame the radio carries, type byte included.
pub const MAX_PACKET_SIZE: usize = 32;

/// Type byte plus sequence number in front of every page payload.
pub const PAGE_PAYLOAD_HEADER_SIZE: usize = 2;

/// Data bytes carried by one full page payload frame.
pub const PAGE_CHUNK_SIZE: usize = MAX_PACKET_SIZE - PAGE_PAYLOAD_HEADER_SIZE;

pub const PROTOCOL_VERSION_MAJOR: u8 = 1;
pub const PROTOCOL_VERSION_MINOR: u8 = 0;

/// Pipe the host transmits from.
pub const DEFAULT_SOURCE_ADDRESS: u64 = 0xC0_FFEE_1000;
/// Pipe the bootloader listens on.
pub const DEFAULT_TARGET_ADDRESS: u64 = 0xC0_FFEE_0010;

pub const DEFAULT_HELLO_RETRIES: u8 = 10;
pub const SEND_TIMEOUT_MS: u64 = 500;
pub const POST_SEND_DELAY_US: u64 = 10_000;

/// Data bytes per serialized record.
pub const DEFAULT_RECORD_LEN: usize = 16;

/// Depth of the radio's ack payload FIFO.
pub const ACK_FIFO_DEPTH: usize = 3;
/// Depth of the radio's receive FIFO; bounds one drain of the device loop.
pub const RX_FIFO_DEPTH: usize = 3;

/// Value of erased flash, and filler for unallocated image bytes.
pub const ERASED_BYTE: u8 = 0xff;

// Type codes are sparse primes so a single flipped bit rarely turns one
// valid code into another.
pub mod packets {
    pub const HELLO: u8 = 2;
    pub const HELLO_FLUSH: u8 = 3;
    pub const DONE: u8 = 5;
    pub const PAGE_READ: u8 = 11;
    pub const PAGE_READ_PAYLOAD: u8 = 13;
    pub const PAGE_READ_FLUSH: u8 = 17;
    pub const PAGE_PROG: u8 = 23;
    pub const PAGE_PROG_PAYLOAD: u8 = 29;
    pub const EEPROM_READ: u8 = 41;
    pub const EEPROM_READ_PAYLOAD: u8 = 43;
    pub const EEPROM_READ_FLUSH: u8 = 47;
    pub const EEPROM_PROG: u8 = 53;
    pub const CMD_FAILED: u8 = 251;
}

pub mod sizes {
    pub const HELLO: usize = 15;
    pub const HELLO_MIN: usize = 6;
    pub const FLUSH: usize = 1;
    pub const ADDRESSED: usize = 3;
    pub const EEPROM_READ_PAYLOAD: usize = 2;
    pub const EEPROM_PROG: usize = 4;
    pub const CMD_FAILED: usize = 2;
}

pub mod fail_reasons {
    pub const VERSION_MISMATCH: u8 = 2;
    pub const SIGNATURE_MISMATCH: u8 = 3;
}
