//! In-process link to a simulated bootloader.
use std::collections::VecDeque;

use crate::bootloader::{Bootloader, Radio, ReplyQueue};
use crate::constants::ACK_FIFO_DEPTH;
use crate::error::Result;
use crate::target::Target;

use super::Transport;

/// The device's radio as the bootloader sees it.
#[derive(Debug, Default)]
struct AirLink {
    inbound: VecDeque<Vec<u8>>,
    acks: VecDeque<Vec<u8>>,
    irq: bool,
}

impl ReplyQueue for AirLink {
    fn queue_reply(&mut self, frame: &[u8]) {
        if self.acks.len() >= ACK_FIFO_DEPTH {
            log::warn!("ack payload FIFO full, dropping {}", hex::encode(frame));
            return;
        }
        self.acks.push_back(frame.to_vec());
    }
}

impl Radio for AirLink {
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

/// Connects the host session directly to a [`Bootloader`].
///
/// Each delivered frame is acknowledged with whatever payload the device
/// had queued before the frame arrived, then handed to the bootloader, so a
/// reply produced by frame *n* rides on the acknowledgment of frame *n+1*.
pub struct Loopback<M: Target> {
    bootloader: Bootloader<M>,
    link: AirLink,
    reply: Option<Vec<u8>>,
    drop_frames: usize,
    lose_acks: usize,
    delivered: Vec<Vec<u8>>,
}

impl<M: Target> Loopback<M> {
    pub fn new(target: M) -> Self {
        Loopback {
            bootloader: Bootloader::new(target),
            link: AirLink::default(),
            reply: None,
            drop_frames: 0,
            lose_acks: 0,
            delivered: vec![],
        }
    }

    /// The next `n` frames never reach the device.
    pub fn drop_frames(&mut self, n: usize) {
        self.drop_frames = n;
    }

    /// The next `n` frames reach the device but their acknowledgments, and
    /// whatever payload they carried, are lost.
    pub fn lose_acks(&mut self, n: usize) {
        self.lose_acks = n;
    }

    /// Every frame the device received, in order.
    pub fn delivered(&self) -> &[Vec<u8>] {
        &self.delivered
    }

    pub fn bootloader(&self) -> &Bootloader<M> {
        &self.bootloader
    }

    pub fn target(&self) -> &M {
        self.bootloader.target()
    }

    pub fn target_mut(&mut self) -> &mut M {
        self.bootloader.target_mut()
    }

    pub fn into_target(self) -> M {
        self.bootloader.into_target()
    }
}

impl<M: Target> Transport for Loopback<M> {
    fn send_raw(&mut self, raw: &[u8]) -> Result<bool> {
        self.reply = None;
        if !self.bootloader.is_running() {
            return Ok(false);
        }
        if self.drop_frames > 0 {
            self.drop_frames -= 1;
            log::debug!("loopback: dropping frame {}", hex::encode(raw));
            return Ok(false);
        }

        let ack = self.link.acks.pop_front();
        self.link.inbound.push_back(raw.to_vec());
        self.link.irq = true;
        self.delivered.push(raw.to_vec());
        self.bootloader.poll(&mut self.link);

        if self.lose_acks > 0 {
            self.lose_acks -= 1;
            log::debug!("loopback: losing ack of {}", hex::encode(raw));
            return Ok(false);
        }
        self.reply = ack;
        Ok(true)
    }

    fn take_reply(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.reply.take())
    }
}
