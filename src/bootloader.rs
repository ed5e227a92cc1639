//! Device side of the protocol: the bootloader's frame handler and main loop.
//!
//! The radio answers every received frame with an automatic acknowledgment,
//! and that acknowledgment can only carry a payload queued *before* the frame
//! arrived. Reads therefore take two frames: the command makes the device
//! compute and queue the answer, the following flush frame's acknowledgment
//! carries it back. Writes need no answer.

use crate::constants::{PAGE_CHUNK_SIZE, PROTOCOL_VERSION_MAJOR, RX_FIFO_DEPTH};
use crate::protocol::{FailReason, HelloInfo, Packet, Version};
use crate::target::Target;

/// Where a frame handler leaves its replies.
pub trait ReplyQueue {
    /// Queues `frame` as the payload of the next automatic acknowledgment.
    fn queue_reply(&mut self, frame: &[u8]);
}

/// The device-side radio shim the main loop polls.
pub trait Radio: ReplyQueue {
    /// The interrupt line: frames are waiting in the receive FIFO.
    fn irq_pending(&self) -> bool;
    fn recv(&mut self) -> Option<Vec<u8>>;
    fn clear_irq(&mut self);
}

/// Tells the main loop whether to keep serving frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Exit,
}

/// Progress of a page program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Idle,
    /// Erase started, no payload accepted yet.
    ErasingPage { address: u16 },
    FillingPage { address: u16 },
}

/// Page download in progress, independent of any page program.
#[derive(Debug, Clone, Default)]
pub struct ReadCursor {
    page: Vec<u8>,
    offset: usize,
    seq: u8,
}

impl ReadCursor {
    pub fn remaining(&self) -> usize {
        self.page.len() - self.offset
    }

    fn load(&mut self, page: Vec<u8>) {
        self.page = page;
        self.offset = 0;
        self.seq = 0;
    }

    fn take_chunk(&mut self) -> Vec<u8> {
        let len = self.remaining().min(PAGE_CHUNK_SIZE);
        let chunk = self.page[self.offset..self.offset + len].to_vec();
        self.offset += len;
        chunk
    }
}

/// All state the frame handler keeps between frames.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    state: WriteState,
    expected_seq: u8,
    fill: Vec<u8>,
    read: ReadCursor,
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSession {
    pub fn new() -> Self {
        DeviceSession {
            state: WriteState::Idle,
            expected_seq: 0,
            fill: Vec::new(),
            read: ReadCursor::default(),
        }
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    pub fn expected_seq(&self) -> u8 {
        self.expected_seq
    }

    /// Bytes accumulated for the page being programmed.
    pub fn filled(&self) -> usize {
        self.fill.len()
    }

    pub fn read_cursor(&self) -> &ReadCursor {
        &self.read
    }

    /// Processes one inbound frame. Never fails: anything malformed or
    /// unexpected is dropped.
    pub fn handle<M: Target, Q: ReplyQueue + ?Sized>(
        &mut self,
        target: &mut M,
        replies: &mut Q,
        frame: &[u8],
    ) -> Control {
        let packet = match Packet::from_raw(frame) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("ignoring frame {}: {}", hex::encode(frame), err);
                return Control::Continue;
            }
        };
        log::trace!("<= {:?}", packet);

        match packet {
            Packet::Hello(request) => self.hello(target, replies, &request),
            // the reply was queued by the command before it
            Packet::HelloFlush | Packet::EepromReadFlush => (),
            Packet::Done => return Control::Exit,
            Packet::PageRead { address } => {
                let page = (0..target.page_size() as u16)
                    .map(|i| target.read_flash(address.wrapping_add(i)))
                    .collect();
                self.read.load(page);
                let data = self.read.take_chunk();
                queue(replies, Packet::PageReadPayload { seq: 0, data });
            }
            Packet::PageReadFlush => {
                if self.read.remaining() > 0 {
                    self.read.seq = self.read.seq.wrapping_add(1);
                    let data = self.read.take_chunk();
                    queue(
                        replies,
                        Packet::PageReadPayload {
                            seq: self.read.seq,
                            data,
                        },
                    );
                }
            }
            Packet::PageProg { address } => {
                if self.filled() > 0 {
                    log::warn!("discarding {} bytes of unfinished page", self.filled());
                }
                target.page_erase(address);
                self.state = WriteState::ErasingPage { address };
                self.expected_seq = 0;
                self.fill.clear();
            }
            Packet::PageProgPayload { seq, data } => self.page_payload(target, seq, &data),
            Packet::EepromRead { address } => {
                let value = target.eeprom_read(address);
                queue(replies, Packet::EepromReadPayload { value });
            }
            Packet::EepromProg { address, value } => target.eeprom_write(address, value),
            other => log::debug!("ignoring {} frame", other.name()),
        }
        Control::Continue
    }

    fn hello<M: Target, Q: ReplyQueue + ?Sized>(
        &mut self,
        target: &mut M,
        replies: &mut Q,
        request: &HelloInfo,
    ) {
        let reply = if request.version.major != PROTOCOL_VERSION_MAJOR {
            log::warn!("HELLO with protocol version {}", request.version);
            Packet::CmdFailed(FailReason::VersionMismatch)
        } else if request.signature != target.signature() {
            log::warn!("HELLO for signature {}", hex::encode(request.signature));
            Packet::CmdFailed(FailReason::SignatureMismatch)
        } else {
            Packet::Hello(HelloInfo {
                version: Version::CURRENT,
                signature: target.signature(),
                page_size: target.page_size(),
                available_flash: target.available_flash(),
                fuses: target.fuses(),
                eeprom_size: target.eeprom_size(),
            })
        };
        queue(replies, reply);
    }

    fn page_payload<M: Target>(&mut self, target: &mut M, seq: u8, data: &[u8]) {
        let address = match self.state {
            WriteState::Idle => {
                log::debug!("PAGE_PROG_PAYLOAD without PAGE_PROG");
                return;
            }
            WriteState::ErasingPage { address } | WriteState::FillingPage { address } => address,
        };
        // The page is already erased at this point; a skipped or repeated
        // payload leaves it short until the host programs it again.
        if seq != self.expected_seq {
            log::warn!(
                "out of sequence payload {} (expected {})",
                seq,
                self.expected_seq
            );
            return;
        }
        let page_size = target.page_size() as usize;
        if self.fill.len() + data.len() > page_size {
            log::warn!(
                "payload of {} bytes overruns page at 0x{:04x}",
                data.len(),
                address
            );
            return;
        }
        self.fill.extend_from_slice(data);
        self.expected_seq = self.expected_seq.wrapping_add(1);
        self.state = WriteState::FillingPage { address };

        if self.fill.len() == page_size {
            target.busy_wait();
            for (i, word) in self.fill.chunks_exact(2).enumerate() {
                let word = u16::from_le_bytes([word[0], word[1]]);
                target.page_fill(address.wrapping_add(2 * i as u16), word);
            }
            target.page_write(address);
            target.busy_wait();
            target.rww_enable();
            log::debug!("programmed page 0x{:04x}", address);

            self.fill.clear();
            self.expected_seq = 0;
            self.state = WriteState::Idle;
        }
    }
}

fn queue<Q: ReplyQueue + ?Sized>(replies: &mut Q, packet: Packet) {
    let name = packet.name();
    match packet.into_raw() {
        Ok(raw) => replies.queue_reply(&raw),
        Err(err) => log::warn!("cannot queue {}: {}", name, err),
    }
}

/// The bootloader main loop: owns the memory and the session state.
pub struct Bootloader<M: Target> {
    target: M,
    session: DeviceSession,
    running: bool,
}

impl<M: Target> Bootloader<M> {
    pub fn new(target: M) -> Self {
        Bootloader {
            target,
            session: DeviceSession::new(),
            running: true,
        }
    }

    pub fn target(&self) -> &M {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut M {
        &mut self.target
    }

    pub fn into_target(self) -> M {
        self.target
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// False once DONE has been received.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// One pass of the loop: if the radio signals pending frames, drain what
    /// is buffered (at most one receive FIFO's worth), then clear the signal.
    pub fn poll<R: Radio + ?Sized>(&mut self, radio: &mut R) -> Control {
        if !radio.irq_pending() {
            return Control::Continue;
        }
        let mut control = Control::Continue;
        for _ in 0..RX_FIFO_DEPTH {
            let Some(frame) = radio.recv() else {
                break;
            };
            if self.session.handle(&mut self.target, radio, &frame) == Control::Exit {
                control = Control::Exit;
            }
        }
        radio.clear_irq();
        if control == Control::Exit {
            log::info!("programming session done");
            self.running = false;
        }
        control
    }

    /// Serves frames until DONE. `wait` blocks until the radio interrupt
    /// fires; returning false abandons the session (the watchdog path).
    pub fn run<R: Radio + ?Sized>(&mut self, radio: &mut R, mut wait: impl FnMut(&mut R) -> bool) {
        while self.running {
            if !wait(radio) {
                log::warn!("no traffic, leaving bootloader");
                break;
            }
            self.poll(radio);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::constants::packets;
    use crate::protocol::Fuses;
    use crate::target::{MemoryTarget, Operation};

    const SIG: [u8; 3] = [0x1e, 0x95, 0x0f];

    #[derive(Default)]
    struct TestRadio {
        inbound: VecDeque<Vec<u8>>,
        replies: Vec<Vec<u8>>,
        irq: bool,
    }

    impl ReplyQueue for TestRadio {
        fn queue_reply(&mut self, frame: &[u8]) {
            self.replies.push(frame.to_vec());
        }
    }

    impl Radio for TestRadio {
        fn irq_pending(&self) -> bool {
            self.irq
        }

        fn recv(&mut self) -> Option<Vec<u8>> {
            self.inbound.pop_front()
        }

        fn clear_irq(&mut self) {
            self.irq = false;
        }
    }

    fn target(page_size: u8) -> MemoryTarget {
        MemoryTarget::new(SIG, page_size, 1024, 64, Fuses::from([0xff, 0xda, 0xfd, 0xff]))
    }

    fn send(
        session: &mut DeviceSession,
        target: &mut MemoryTarget,
        radio: &mut TestRadio,
        packet: Packet,
    ) -> Control {
        let raw = packet.into_raw().unwrap();
        session.handle(target, radio, &raw)
    }

    fn replies(radio: &mut TestRadio) -> Vec<Packet> {
        radio
            .replies
            .drain(..)
            .map(|raw| Packet::from_raw(&raw).unwrap())
            .collect()
    }

    #[test]
    fn hello_reports_capabilities() {
        let (mut s, mut t, mut r) = (DeviceSession::new(), target(32), TestRadio::default());
        send(&mut s, &mut t, &mut r, Packet::Hello(HelloInfo::request(SIG)));
        match replies(&mut r).as_slice() {
            [Packet::Hello(info)] => {
                assert_eq!(info.version, Version::CURRENT);
                assert_eq!(info.signature, SIG);
                assert_eq!(info.page_size, 32);
                assert_eq!(info.available_flash, 1024);
                assert_eq!(info.eeprom_size, 64);
                assert_eq!(info.fuses.high, 0xda);
            }
            other => panic!("unexpected {:?}", other),
        }
        // flush only retrieves
        send(&mut s, &mut t, &mut r, Packet::HelloFlush);
        assert!(r.replies.is_empty());
    }

    #[test]
    fn hello_mismatches_queue_cmd_failed() {
        let (mut s, mut t, mut r) = (DeviceSession::new(), target(32), TestRadio::default());
        send(&mut s, &mut t, &mut r, Packet::Hello(HelloInfo::request([0x1e, 0x94, 0x06])));
        let mut old = HelloInfo::request(SIG);
        old.version.major = 0;
        send(&mut s, &mut t, &mut r, Packet::Hello(old));
        assert_eq!(
            replies(&mut r),
            [
                Packet::CmdFailed(FailReason::SignatureMismatch),
                Packet::CmdFailed(FailReason::VersionMismatch)
            ]
        );
    }

    #[test]
    fn page_read_is_served_in_chunks() {
        let (mut s, mut t, mut r) = (DeviceSession::new(), target(32), TestRadio::default());
        for (i, cell) in t.flash_mut()[64..96].iter_mut().enumerate() {
            *cell = i as u8;
        }
        send(&mut s, &mut t, &mut r, Packet::PageRead { address: 64 });
        send(&mut s, &mut t, &mut r, Packet::PageReadFlush);
        send(&mut s, &mut t, &mut r, Packet::PageReadFlush);
        send(&mut s, &mut t, &mut r, Packet::PageReadFlush);
        assert_eq!(
            replies(&mut r),
            [
                Packet::PageReadPayload {
                    seq: 0,
                    data: (0..30).collect()
                },
                Packet::PageReadPayload {
                    seq: 1,
                    data: vec![30, 31]
                },
            ]
        );
        assert_eq!(s.read_cursor().remaining(), 0);
    }

    #[test]
    fn page_program_commits_full_page() {
        let (mut s, mut t, mut r) = (DeviceSession::new(), target(32), TestRadio::default());
        send(&mut s, &mut t, &mut r, Packet::PageProg { address: 32 });
        assert_eq!(s.state(), WriteState::ErasingPage { address: 32 });

        send(
            &mut s,
            &mut t,
            &mut r,
            Packet::PageProgPayload {
                seq: 0,
                data: vec![0xa5; 30],
            },
        );
        assert_eq!(s.state(), WriteState::FillingPage { address: 32 });
        assert_eq!((s.filled(), s.expected_seq()), (30, 1));

        send(
            &mut s,
            &mut t,
            &mut r,
            Packet::PageProgPayload {
                seq: 1,
                data: vec![0x11, 0x22],
            },
        );
        assert_eq!(s.state(), WriteState::Idle);
        assert_eq!((s.filled(), s.expected_seq()), (0, 0));
        assert_eq!(&t.flash()[32..62], [0xa5; 30]);
        assert_eq!(&t.flash()[62..64], [0x11, 0x22]);
        assert!(t.rww_enabled());
        assert_eq!(
            t.operations(),
            [Operation::PageErase(32), Operation::PageWrite(32)]
        );
        assert!(r.replies.is_empty());
    }

    #[test]
    fn out_of_sequence_payload_changes_nothing() {
        let (mut s, mut t, mut r) = (DeviceSession::new(), target(32), TestRadio::default());
        send(&mut s, &mut t, &mut r, Packet::PageProg { address: 0 });
        send(
            &mut s,
            &mut t,
            &mut r,
            Packet::PageProgPayload {
                seq: 0,
                data: vec![0; 30],
            },
        );
        for seq in [0, 2, 7] {
            send(
                &mut s,
                &mut t,
                &mut r,
                Packet::PageProgPayload {
                    seq,
                    data: vec![1, 2],
                },
            );
            assert_eq!((s.filled(), s.expected_seq()), (30, 1));
            assert_eq!(s.state(), WriteState::FillingPage { address: 0 });
        }
    }

    #[test]
    fn page_prog_restarts_unfinished_page() {
        let (mut s, mut t, mut r) = (DeviceSession::new(), target(32), TestRadio::default());
        send(&mut s, &mut t, &mut r, Packet::PageProg { address: 0 });
        send(
            &mut s,
            &mut t,
            &mut r,
            Packet::PageProgPayload {
                seq: 0,
                data: vec![0; 30],
            },
        );
        send(&mut s, &mut t, &mut r, Packet::PageProg { address: 32 });
        assert_eq!(s.state(), WriteState::ErasingPage { address: 32 });
        assert_eq!((s.filled(), s.expected_seq()), (0, 0));
        // the partial page was never written
        assert!(!t.operations().contains(&Operation::PageWrite(0)));
    }

    #[test]
    fn stray_and_oversized_payloads_are_ignored() {
        let (mut s, mut t, mut r) = (DeviceSession::new(), target(32), TestRadio::default());
        send(
            &mut s,
            &mut t,
            &mut r,
            Packet::PageProgPayload {
                seq: 0,
                data: vec![0; 2],
            },
        );
        assert_eq!((s.state(), s.filled()), (WriteState::Idle, 0));

        send(&mut s, &mut t, &mut r, Packet::PageProg { address: 0 });
        send(
            &mut s,
            &mut t,
            &mut r,
            Packet::PageProgPayload {
                seq: 0,
                data: vec![0; 30],
            },
        );
        send(
            &mut s,
            &mut t,
            &mut r,
            Packet::PageProgPayload {
                seq: 1,
                data: vec![0; 3],
            },
        );
        assert_eq!((s.filled(), s.expected_seq()), (30, 1));
    }

    #[test]
    fn eeprom_access() {
        let (mut s, mut t, mut r) = (DeviceSession::new(), target(32), TestRadio::default());
        send(
            &mut s,
            &mut t,
            &mut r,
            Packet::EepromProg {
                address: 5,
                value: 0x3c,
            },
        );
        assert_eq!(t.eeprom()[5], 0x3c);
        assert!(r.replies.is_empty());

        send(&mut s, &mut t, &mut r, Packet::EepromRead { address: 5 });
        send(&mut s, &mut t, &mut r, Packet::EepromReadFlush);
        assert_eq!(replies(&mut r), [Packet::EepromReadPayload { value: 0x3c }]);
    }

    #[test]
    fn garbage_is_ignored() {
        let (mut s, mut t, mut r) = (DeviceSession::new(), target(32), TestRadio::default());
        let frames: [&[u8]; 4] = [&[], &[7], &[packets::PAGE_READ, 1], &[packets::CMD_FAILED, 2]];
        for frame in frames {
            assert_eq!(s.handle(&mut t, &mut r, frame), Control::Continue);
        }
        assert!(r.replies.is_empty());
        assert!(t.operations().is_empty());
    }

    #[test]
    fn poll_drains_pending_frames_until_done() {
        let mut bootloader = Bootloader::new(target(32));
        let mut radio = TestRadio::default();
        assert_eq!(bootloader.poll(&mut radio), Control::Continue);

        radio.inbound.extend([
            Packet::EepromProg { address: 0, value: 1 }.into_raw().unwrap(),
            Packet::Done.into_raw().unwrap(),
        ]);
        // frames buffered but the interrupt has not fired yet
        assert_eq!(bootloader.poll(&mut radio), Control::Continue);
        assert_eq!(radio.inbound.len(), 2);

        radio.irq = true;
        assert_eq!(bootloader.poll(&mut radio), Control::Exit);
        assert!(!radio.irq);
        assert!(!bootloader.is_running());
        assert_eq!(bootloader.target().eeprom()[0], 1);
    }

    #[test]
    fn run_stops_when_wait_gives_up() {
        let mut bootloader = Bootloader::new(target(32));
        let mut radio = TestRadio::default();
        let mut wakeups = 0;
        bootloader.run(&mut radio, |_| {
            wakeups += 1;
            wakeups < 3
        });
        assert_eq!(wakeups, 3);
        assert!(bootloader.is_running());
    }
}
