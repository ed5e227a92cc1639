//! Radio bootloader protocol: host session, device state machine and the
//! sparse memory image exchanged between them.

pub mod bootloader;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod image;
pub mod protocol;
pub mod target;
pub mod transport;

pub use self::bootloader::{Bootloader, DeviceSession};
pub use self::config::SessionConfig;
pub use self::device::{Part, PartDB};
pub use self::error::{Error, Result};
pub use self::flashing::{Flashing, Session};
pub use self::image::{Image, Record, Tag};
pub use self::protocol::Packet;
pub use self::target::{MemoryTarget, Target};
pub use self::transport::Transport;
