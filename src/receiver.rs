use std::cmp::min;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use crate::config::HomaConfig;
use crate::control_messages::{ControlMessageGrant, ControlMessageIdOnly, ControlMessageResend};
use crate::driver::Driver;
use crate::message_id::MessageId;
use crate::packet_header::{DataHeader, Opcode};
use crate::policy::Policy;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::timer::{TimerKind, TimerWheel};

/// Tracks which packets of a message have arrived. Packet indices are derived from the
///  byte offset carried in each DATA packet, so presence is exact even for out-of-order
///  arrival.
struct PacketBitmap {
    words: Vec<u64>,
    num_packets: usize,
}

impl PacketBitmap {
    fn new(num_packets: usize) -> PacketBitmap {
        PacketBitmap {
            words: vec![0; num_packets.div_ceil(64)],
            num_packets,
        }
    }

    /// returns true if the packet was newly recorded, false for a duplicate
    fn set(&mut self, idx: usize) -> bool {
        let word = &mut self.words[idx / 64];
        let mask = 1u64 << (idx % 64);
        let newly = *word & mask == 0;
        *word |= mask;
        newly
    }

    fn is_set(&self, idx: usize) -> bool {
        self.words[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    fn first_missing(&self) -> Option<usize> {
        (0..self.num_packets).find(|&idx| !self.is_set(idx))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundStatus {
    InProgress,
    Complete,
}

/// Per-message reassembly state on the receiving side.
struct InboundMessage {
    id: MessageId,
    source: SocketAddr,
    total_length: u32,
    payload_capacity: u32,
    data: Vec<u8>,
    bitmap: PacketBitmap,
    bytes_received: u32,
    /// how far the sender is authorized to transmit; monotonically non-decreasing, seeded
    ///  from the unscheduled allowance announced in the first DATA packet
    bytes_granted: u32,
    /// priority assigned by the most recent grant pass, reused for RESEND requests
    priority: u8,
    no_ack: bool,
    status: InboundStatus,
    /// handed to the application, waiting for it to release the handle
    delivered: bool,
    resend_deadline: u64,
    timeout_deadline: u64,
}

impl InboundMessage {
    fn packet_start(&self, idx: usize) -> u32 {
        let idx: u32 = idx.prechecked_cast();
        idx * self.payload_capacity
    }

    fn packet_end(&self, idx: usize) -> u32 {
        min(self.total_length, self.packet_start(idx) + self.payload_capacity)
    }

    fn remaining(&self) -> u32 {
        self.total_length - self.bytes_received
    }

    /// the first contiguous run of missing packets that the sender was already authorized
    ///  to transmit, as a byte range
    fn first_gap_below_granted(&self) -> Option<(u32, u32)> {
        let first = self.bitmap.first_missing()?;
        if self.packet_start(first) >= self.bytes_granted {
            return None;
        }
        let mut end = first;
        while end + 1 < self.bitmap.num_packets
            && !self.bitmap.is_set(end + 1)
            && self.packet_start(end + 1) < self.bytes_granted
        {
            end += 1;
        }
        Some((self.packet_start(first), self.packet_end(end) - self.packet_start(first)))
    }
}

/// A fully reassembled message ready to be handed to the application.
pub(crate) struct Delivery {
    pub id: MessageId,
    pub source: SocketAddr,
    pub data: Vec<u8>,
}

/// Reassembles inbound messages from out-of-order DATA packets, drives the receiver side
///  of congestion control by granting the shortest-remaining messages first, and emits
///  completion acknowledgements once the application releases a message.
pub(crate) struct Receiver {
    config: Arc<HomaConfig>,
    policy: Arc<Policy>,
    driver: Arc<dyn Driver>,
    payload_capacity: u32,
    messages: FxHashMap<MessageId, InboundMessage>,
    ready: VecDeque<MessageId>,
    timers: TimerWheel,
}

impl Receiver {
    pub fn new(config: Arc<HomaConfig>, policy: Arc<Policy>, driver: Arc<dyn Driver>) -> Receiver {
        let payload_capacity =
            (driver.max_payload_size() - DataHeader::SERIALIZED_LEN).prechecked_cast();
        Receiver {
            config,
            policy,
            driver,
            payload_capacity,
            messages: FxHashMap::default(),
            ready: VecDeque::new(),
            timers: TimerWheel::new(1024),
        }
    }

    pub fn on_data(&mut self, from: SocketAddr, header: DataHeader, payload: &[u8], now: u64) {
        let driver = self.driver.clone();

        if header.total_length > self.config.max_message_size {
            warn!(
                "DATA for {} announces {} bytes, more than the maximum of {} - rejecting",
                header.id, header.total_length, self.config.max_message_size
            );
            Self::send_id_only(driver.as_ref(), Opcode::Error, header.id, from);
            return;
        }

        if !self.messages.contains_key(&header.id) {
            let total: usize = header.total_length.safe_cast();
            let num_packets = total.div_ceil(self.payload_capacity.safe_cast()).max(1);
            debug!(
                "new inbound message {} of {} bytes ({} packets) from {:?}",
                header.id, header.total_length, num_packets, from
            );

            let msg = InboundMessage {
                id: header.id,
                source: from,
                total_length: header.total_length,
                payload_capacity: self.payload_capacity,
                data: vec![0; total],
                bitmap: PacketBitmap::new(num_packets),
                bytes_received: 0,
                bytes_granted: min(header.unscheduled, header.total_length),
                priority: self.policy.scheduled_priority(0),
                no_ack: header.flags & DataHeader::FLAG_NO_ACK != 0,
                status: InboundStatus::InProgress,
                delivered: false,
                resend_deadline: now + self.config.resend_interval_ticks,
                timeout_deadline: now + self.config.timeout_ticks,
            };
            self.timers.schedule(header.id, TimerKind::Resend, msg.resend_deadline);
            self.timers.schedule(header.id, TimerKind::Timeout, msg.timeout_deadline);
            self.messages.insert(header.id, msg);
        }

        let msg = self.messages.get_mut(&header.id)
            .expect("this is a bug: the entry was just created");

        if msg.status == InboundStatus::Complete {
            // everything has arrived but the application has not released the message yet,
            //  so the DONE is still pending - keep the sender patient
            trace!("DATA for completed message {} - answering BUSY", header.id);
            Self::send_id_only(driver.as_ref(), Opcode::Busy, header.id, msg.source);
            return;
        }

        if header.total_length != msg.total_length {
            warn!(
                "DATA for {} announces {} bytes but the message was created with {} - dropping",
                header.id, header.total_length, msg.total_length
            );
            return;
        }
        if header.offset % msg.payload_capacity != 0 {
            warn!("DATA for {} at unaligned offset {} - dropping", header.id, header.offset);
            return;
        }
        let idx: usize = (header.offset / msg.payload_capacity).safe_cast();
        if idx >= msg.bitmap.num_packets {
            warn!("DATA for {} at offset {} beyond the message end - dropping", header.id, header.offset);
            return;
        }
        let expected = msg.packet_end(idx) - header.offset;
        let expected_len: usize = expected.safe_cast();
        if payload.len() != expected_len {
            warn!(
                "DATA for {} at offset {} carries {} payload bytes, expected {} - dropping",
                header.id, header.offset, payload.len(), expected_len
            );
            return;
        }

        if msg.bitmap.set(idx) {
            let offset: usize = header.offset.safe_cast();
            msg.data[offset..offset + payload.len()].copy_from_slice(payload);
            msg.bytes_received += expected;
            msg.bytes_granted = msg.bytes_granted.max(min(header.unscheduled, msg.total_length));
            trace!(
                "recorded packet {} of {}: {} of {} bytes received",
                idx, header.id, msg.bytes_received, msg.total_length
            );
        }
        else {
            trace!("duplicate packet {} of {} - dropping", idx, header.id);
        }

        msg.resend_deadline = now + self.config.resend_interval_ticks;

        if msg.bytes_received == msg.total_length && msg.status == InboundStatus::InProgress {
            debug!("message {} fully received", header.id);
            msg.status = InboundStatus::Complete;
            self.ready.push_back(header.id);
        }
    }

    pub fn on_busy(&mut self, id: MessageId, now: u64) {
        if let Some(msg) = self.messages.get_mut(&id) {
            trace!("sender is busy on {} - backing off", id);
            msg.resend_deadline = now + self.config.resend_interval_ticks;
        }
    }

    /// A sender probing for the state of one of its messages, typically because a GRANT or
    ///  the DONE got lost.
    pub fn on_ping(&mut self, id: MessageId, from: SocketAddr, now: u64) {
        let driver = self.driver.clone();
        let Some(msg) = self.messages.get_mut(&id) else {
            debug!("PING for unknown inbound message {} - answering UNKNOWN", id);
            Self::send_id_only(driver.as_ref(), Opcode::Unknown, id, from);
            return;
        };

        match msg.status {
            InboundStatus::Complete => {
                // the DONE is emitted when the application releases the message, not here
                Self::send_id_only(driver.as_ref(), Opcode::Busy, id, msg.source);
            }
            InboundStatus::InProgress => {
                if let Some((offset, length)) = msg.first_gap_below_granted() {
                    Self::send_resend(driver.as_ref(), msg, offset, length);
                }
                else {
                    Self::send_id_only(driver.as_ref(), Opcode::Busy, id, msg.source);
                }
                msg.resend_deadline = now + self.config.resend_interval_ticks;
            }
        }
    }

    pub fn receive(&mut self) -> Option<Delivery> {
        while let Some(id) = self.ready.pop_front() {
            let Some(msg) = self.messages.get_mut(&id) else {
                continue;
            };
            if msg.status != InboundStatus::Complete || msg.delivered {
                continue;
            }
            msg.delivered = true;
            return Some(Delivery {
                id,
                source: msg.source,
                data: std::mem::take(&mut msg.data),
            });
        }
        None
    }

    /// Signals to the sender that the message is fully processed. Idempotent: the first
    ///  call retires the local state, later calls are no-ops.
    pub fn acknowledge(&mut self, id: MessageId) {
        let driver = self.driver.clone();
        if let Some(msg) = self.messages.remove(&id) {
            debug!("acknowledging message {}", id);
            if !msg.no_ack {
                Self::send_id_only(driver.as_ref(), Opcode::Done, id, msg.source);
            }
        }
    }

    pub fn fail(&mut self, id: MessageId) {
        let driver = self.driver.clone();
        if let Some(msg) = self.messages.remove(&id) {
            warn!("application failed message {}", id);
            Self::send_id_only(driver.as_ref(), Opcode::Error, id, msg.source);
        }
    }

    /// The per-poll receiver pass: fire due timers, then top up grants for the messages
    ///  with the least remaining bytes.
    pub fn poll(&mut self, now: u64) {
        self.fire_timers(now);
        self.grant_pass();
    }

    fn fire_timers(&mut self, now: u64) {
        let driver = self.driver.clone();
        let mut expired = Vec::new();
        self.timers.advance(now, &mut expired);

        for entry in expired {
            let Some(msg) = self.messages.get_mut(&entry.id) else {
                continue;
            };
            if msg.status != InboundStatus::InProgress {
                continue;
            }

            match entry.kind {
                TimerKind::Timeout => {
                    if msg.timeout_deadline > now {
                        self.timers.schedule(entry.id, TimerKind::Timeout, msg.timeout_deadline);
                        continue;
                    }
                    warn!("inbound message {} timed out with {} of {} bytes - dropping its state",
                        entry.id, msg.bytes_received, msg.total_length);
                    self.messages.remove(&entry.id);
                }
                TimerKind::Resend => {
                    if msg.resend_deadline > now {
                        self.timers.schedule(entry.id, TimerKind::Resend, msg.resend_deadline);
                        continue;
                    }
                    // no progress for a full interval: either re-request authorized bytes
                    //  that never arrived, or probe a sender we are not currently granting
                    if let Some((offset, length)) = msg.first_gap_below_granted() {
                        Self::send_resend(driver.as_ref(), msg, offset, length);
                    }
                    else {
                        trace!("no gap below the granted range of {} - pinging sender", entry.id);
                        Self::send_id_only(driver.as_ref(), Opcode::Ping, entry.id, msg.source);
                    }
                    msg.resend_deadline = now + self.config.resend_interval_ticks;
                    self.timers.schedule(entry.id, TimerKind::Resend, msg.resend_deadline);
                }
                TimerKind::Ping => {}
            }
        }
    }

    /// SRPT with overcommitment: the configured number of messages with the least
    ///  remaining bytes are kept granted one window ahead of what they have received,
    ///  at priorities reflecting their rank. The ordering is rebuilt lazily per pass
    ///  rather than maintained incrementally.
    fn grant_pass(&mut self) {
        let driver = self.driver.clone();
        let window = self.policy.grant_window();

        let mut candidates = self
            .messages
            .iter()
            .filter(|(_, msg)| {
                msg.status == InboundStatus::InProgress && msg.bytes_granted < msg.total_length
            })
            .map(|(id, msg)| (msg.remaining(), id.sequence, *id))
            .collect::<Vec<_>>();
        candidates.sort_unstable();

        for (rank, &(_, _, id)) in candidates.iter().take(self.config.overcommitment).enumerate() {
            let msg = self.messages.get_mut(&id)
                .expect("this is a bug: candidate ids are taken from the table");
            msg.priority = self.policy.scheduled_priority(rank);

            if msg.bytes_granted.saturating_sub(msg.bytes_received) < window {
                let new_offset = min(msg.total_length, msg.bytes_received + window);
                if new_offset > msg.bytes_granted {
                    msg.bytes_granted = new_offset;
                    trace!("granting {} up to {} at priority {}", id, new_offset, msg.priority);

                    let mut buf = driver.alloc_packet();
                    ControlMessageGrant { id, offset: new_offset, priority: msg.priority }
                        .ser(&mut buf);
                    if let Err(e) = driver.send_packet(msg.source, buf.as_ref()) {
                        error!("driver failed to send GRANT for {}: {:#}", id, e);
                    }
                    driver.release_packet(buf);
                }
            }
        }
    }

    fn send_resend(driver: &dyn Driver, msg: &InboundMessage, offset: u32, length: u32) {
        trace!("requesting resend of [{}, {}) of {}", offset, offset + length, msg.id);
        let mut buf = driver.alloc_packet();
        ControlMessageResend { id: msg.id, offset, length, priority: msg.priority }.ser(&mut buf);
        if let Err(e) = driver.send_packet(msg.source, buf.as_ref()) {
            error!("driver failed to send RESEND for {}: {:#}", msg.id, e);
        }
        driver.release_packet(buf);
    }

    fn send_id_only(driver: &dyn Driver, opcode: Opcode, id: MessageId, to: SocketAddr) {
        let mut buf = driver.alloc_packet();
        ControlMessageIdOnly { id }.ser(opcode, &mut buf);
        if let Err(e) = driver.send_packet(to, buf.as_ref()) {
            error!("driver failed to send {:?} for {}: {:#}", opcode, id, e);
        }
        driver.release_packet(buf);
    }
}
