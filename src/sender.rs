use std::cmp::{max, min};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use bytes::{BufMut, BytesMut};
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

/// Optional per-send behavior, the transport-level equivalent of a 3-bit flag set on the
///  wire API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    /// No transport-level DONE acknowledgement is required; the message counts as completed
    ///  the moment its last byte is transmitted. Usually set because higher-level software
    ///  has its own way of confirming completion.
    pub no_ack: bool,
    /// The transport keeps managing the message after the application drops its handle,
    ///  retrying until a terminal status is reached and then releasing it silently.
    pub detached: bool,
    /// Hint that this message is likely to generate a response, letting the transport
    ///  anticipate incast.
    pub expect_response: bool,
}

impl SendFlags {
    pub const NONE: SendFlags = SendFlags { no_ack: false, detached: false, expect_response: false };
}

/// Application-observable lifecycle of an outbound message. Once a terminal state
///  (everything but `InProgress` and `Sent`) is reached the status never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStatus {
    /// not all bytes have been transmitted yet
    InProgress,
    /// fully transmitted, waiting for the receiver's DONE
    Sent,
    Completed,
    Canceled,
    Failed,
}

impl OutboundStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboundStatus::Completed | OutboundStatus::Canceled | OutboundStatus::Failed)
    }
}

/// Per-message state on the sending side. Payload is copied into pre-fragmented packet
///  buffers at `append` time; `send` freezes the length and serializes the DATA headers in
///  place, so retransmission never re-fragments.
struct OutboundMessage {
    id: MessageId,
    destination: Option<SocketAddr>,
    /// fully serialized DATA packets once sent; before that, header-sized placeholders
    ///  followed by payload fragments
    packets: Vec<BytesMut>,
    length: u32,
    payload_capacity: u32,
    unscheduled: u32,
    unscheduled_priority: u8,
    grant_offset: u32,
    granted_priority: u8,
    /// index of the next packet that has never been transmitted
    send_cursor: usize,
    bytes_sent: u32,
    /// retransmissions requested by the receiver, as (packet index, priority)
    resend_queue: VecDeque<(usize, u8)>,
    flags: SendFlags,
    status: OutboundStatus,
    restarts: u32,
    handle_dropped: bool,
    resend_deadline: u64,
    ping_deadline: u64,
    timeout_deadline: u64,
}

impl OutboundMessage {
    fn packet_start(&self, idx: usize) -> u32 {
        let idx: u32 = idx.prechecked_cast();
        idx * self.payload_capacity
    }

    fn packet_end(&self, idx: usize) -> u32 {
        min(self.length, self.packet_start(idx) + self.payload_capacity)
    }

    /// the byte offset up to which transmission is currently authorized
    fn send_limit(&self) -> u32 {
        min(self.length, max(self.unscheduled, self.grant_offset))
    }

    fn next_cursor_sendable(&self) -> bool {
        self.send_cursor < self.packets.len()
            && (self.length == 0 || self.packet_end(self.send_cursor) <= self.send_limit())
    }

    fn has_work(&self) -> bool {
        if self.status.is_terminal() || self.destination.is_none() {
            return false;
        }
        !self.resend_queue.is_empty()
            || (self.status == OutboundStatus::InProgress && self.next_cursor_sendable())
    }
}

/// Owns all outbound messages from allocation to their terminal status: fragments payload,
///  emits DATA up to the unscheduled/granted limit in SRPT order, retransmits on request
///  and retires messages on DONE.
pub(crate) struct Sender {
    config: Arc<HomaConfig>,
    policy: Arc<Policy>,
    driver: Arc<dyn Driver>,
    payload_capacity: u32,
    messages: FxHashMap<MessageId, OutboundMessage>,
    timers: TimerWheel,
}

impl Sender {
    pub fn new(config: Arc<HomaConfig>, policy: Arc<Policy>, driver: Arc<dyn Driver>) -> Sender {
        let payload_capacity =
            (driver.max_payload_size() - DataHeader::SERIALIZED_LEN).prechecked_cast();
        Sender {
            config,
            policy,
            driver,
            payload_capacity,
            messages: FxHashMap::default(),
            timers: TimerWheel::new(1024),
        }
    }

    pub fn alloc(&mut self, id: MessageId) {
        let prev = self.messages.insert(
            id,
            OutboundMessage {
                id,
                destination: None,
                packets: Vec::new(),
                length: 0,
                payload_capacity: self.payload_capacity,
                unscheduled: 0,
                unscheduled_priority: 0,
                grant_offset: 0,
                granted_priority: 0,
                send_cursor: 0,
                bytes_sent: 0,
                resend_queue: VecDeque::new(),
                flags: SendFlags::NONE,
                status: OutboundStatus::InProgress,
                restarts: 0,
                handle_dropped: false,
                resend_deadline: 0,
                ping_deadline: 0,
                timeout_deadline: 0,
            },
        );
        assert!(prev.is_none(), "message id allocated twice");
    }

    pub fn append(&mut self, id: MessageId, mut bytes: &[u8]) -> anyhow::Result<()> {
        let payload_capacity: usize = self.payload_capacity.safe_cast();
        let Some(msg) = self.messages.get_mut(&id) else {
            bail!("append on a retired message {}", id);
        };
        if msg.destination.is_some() {
            bail!("append on message {} after it was sent", id);
        }
        let length: u64 = msg.length.safe_cast();
        let max_message_size: u64 = self.config.max_message_size.safe_cast();
        if length + bytes.len() as u64 > max_message_size {
            bail!(
                "message {} would exceed the maximum message size of {} bytes",
                id,
                self.config.max_message_size
            );
        }

        while !bytes.is_empty() {
            let room = match msg.packets.last() {
                Some(packet) => {
                    payload_capacity - (packet.len() - DataHeader::SERIALIZED_LEN)
                }
                None => 0,
            };
            if room == 0 {
                let mut packet = self.driver.alloc_packet();
                packet.put_bytes(0, DataHeader::SERIALIZED_LEN);
                msg.packets.push(packet);
                continue;
            }

            let chunk = min(room, bytes.len());
            msg.packets.last_mut()
                .expect("this is a bug: a packet was just pushed")
                .put_slice(&bytes[..chunk]);
            let chunk_len: u32 = chunk.prechecked_cast();
            msg.length += chunk_len;
            bytes = &bytes[chunk..];
        }
        Ok(())
    }

    pub fn send(
        &mut self,
        id: MessageId,
        destination: SocketAddr,
        flags: SendFlags,
        now: u64,
    ) -> anyhow::Result<()> {
        let Some(msg) = self.messages.get_mut(&id) else {
            bail!("send on a retired message {}", id);
        };
        if msg.destination.is_some() {
            bail!("message {} was already sent", id);
        }

        // a zero-length message still occupies one (payload-free) DATA packet on the wire
        if msg.packets.is_empty() {
            let mut packet = self.driver.alloc_packet();
            packet.put_bytes(0, DataHeader::SERIALIZED_LEN);
            msg.packets.push(packet);
        }

        msg.destination = Some(destination);
        msg.flags = flags;
        msg.unscheduled = self.policy.unscheduled_limit(msg.length);
        msg.unscheduled_priority = self.policy.unscheduled_priority(msg.length);

        let mut wire_flags = 0u8;
        if flags.no_ack {
            wire_flags |= DataHeader::FLAG_NO_ACK;
        }

        let mut header_buf = BytesMut::with_capacity(DataHeader::SERIALIZED_LEN);
        for idx in 0..msg.packets.len() {
            header_buf.clear();
            DataHeader {
                id,
                total_length: msg.length,
                offset: msg.packet_start(idx),
                unscheduled: msg.unscheduled,
                priority: msg.unscheduled_priority,
                flags: wire_flags,
            }
            .ser(&mut header_buf);
            msg.packets[idx][..DataHeader::SERIALIZED_LEN].copy_from_slice(&header_buf);
        }

        debug!(
            "sending message {} of {} bytes ({} packets, {} unscheduled) to {:?}",
            id,
            msg.length,
            msg.packets.len(),
            msg.unscheduled,
            destination
        );

        msg.resend_deadline = now + self.config.resend_interval_ticks;
        msg.timeout_deadline = now + self.config.timeout_ticks;
        self.timers.schedule(id, TimerKind::Resend, msg.resend_deadline);
        self.timers.schedule(id, TimerKind::Timeout, msg.timeout_deadline);
        Ok(())
    }

    pub fn cancel(&mut self, id: MessageId) {
        let driver = self.driver.clone();
        if let Some(msg) = self.messages.get_mut(&id) {
            if !msg.status.is_terminal() {
                debug!("canceling message {}", id);
                msg.status = OutboundStatus::Canceled;
                Self::release_packets(driver.as_ref(), msg);
            }
        }
    }

    pub fn status(&self, id: MessageId) -> OutboundStatus {
        match self.messages.get(&id) {
            Some(msg) => msg.status,
            None => {
                // only reachable if status is queried through a stale id after retirement
                warn!("status query for retired message {}", id);
                OutboundStatus::Completed
            }
        }
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.contains_key(&id)
    }

    /// Called when the application drops its handle. Detached messages stay managed until
    ///  terminal, everything else is canceled or retired on the spot.
    pub fn handle_dropped(&mut self, id: MessageId) {
        let Some(msg) = self.messages.get_mut(&id) else {
            return;
        };
        if msg.status.is_terminal() {
            self.retire(id);
        }
        else if msg.flags.detached {
            msg.handle_dropped = true;
        }
        else {
            self.cancel(id);
            self.retire(id);
        }
    }

    fn retire(&mut self, id: MessageId) {
        if let Some(mut msg) = self.messages.remove(&id) {
            trace!("retiring message {}", id);
            Self::release_packets(self.driver.as_ref(), &mut msg);
        }
    }

    fn release_packets(driver: &dyn Driver, msg: &mut OutboundMessage) {
        for packet in msg.packets.drain(..) {
            driver.release_packet(packet);
        }
        msg.resend_queue.clear();
    }

    pub fn on_grant(&mut self, grant: ControlMessageGrant, now: u64) {
        let Some(msg) = self.messages.get_mut(&grant.id) else {
            debug!("GRANT for unknown message {} - dropping", grant.id);
            return;
        };
        trace!("received GRANT up to {} at priority {} for {}", grant.offset, grant.priority, grant.id);

        let offset = min(grant.offset, msg.length);
        if offset >= msg.grant_offset {
            msg.grant_offset = offset;
            msg.granted_priority = grant.priority;
        }
        msg.resend_deadline = now + self.config.resend_interval_ticks;
    }

    pub fn on_resend(&mut self, resend: ControlMessageResend, now: u64) {
        let driver = self.driver.clone();
        let Some(msg) = self.messages.get_mut(&resend.id) else {
            debug!("RESEND for unknown message {} - dropping", resend.id);
            return;
        };
        if msg.status == OutboundStatus::Canceled || msg.status == OutboundStatus::Failed {
            return;
        }
        trace!(
            "received RESEND for [{}, {}) of {} at priority {}",
            resend.offset,
            resend.offset + resend.length,
            resend.id,
            resend.priority
        );

        let first: usize = (resend.offset / msg.payload_capacity).safe_cast();
        let end_offset = min(msg.length, resend.offset.saturating_add(resend.length));

        // a RESEND also authorizes the requested range, which recovers from lost GRANTs
        if end_offset > msg.grant_offset {
            msg.grant_offset = end_offset;
            msg.granted_priority = resend.priority;
        }

        let mut requested_unsent = false;
        for idx in first..msg.packets.len() {
            if msg.packet_start(idx) >= end_offset {
                break;
            }
            if idx < msg.send_cursor {
                if !msg.resend_queue.iter().any(|&(queued, _)| queued == idx) {
                    msg.resend_queue.push_back((idx, resend.priority));
                }
            }
            else {
                requested_unsent = true;
            }
        }

        // a range we have not transmitted yet means the receiver is just impatient while
        //  we are occupied with other messages - tell it so instead of resending
        if requested_unsent {
            let destination = msg.destination;
            if let Some(to) = destination {
                Self::send_id_only(driver.as_ref(), Opcode::Busy, resend.id, to);
            }
        }

        msg.resend_deadline = now + self.config.resend_interval_ticks;
    }

    pub fn on_done(&mut self, id: MessageId) {
        let driver = self.driver.clone();
        let Some(msg) = self.messages.get_mut(&id) else {
            debug!("DONE for unknown message {} - dropping", id);
            return;
        };
        match msg.status {
            // DONE can overtake our own bookkeeping of the final DATA packet, so it is
            //  accepted from InProgress as well
            OutboundStatus::InProgress | OutboundStatus::Sent => {
                debug!("message {} completed", id);
                msg.status = OutboundStatus::Completed;
                Self::release_packets(driver.as_ref(), msg);
                if msg.handle_dropped {
                    self.retire(id);
                }
            }
            _ => {}
        }
    }

    pub fn on_busy(&mut self, id: MessageId, now: u64) {
        let Some(msg) = self.messages.get_mut(&id) else {
            return;
        };
        trace!("received BUSY for {}", id);
        msg.resend_deadline = now + self.config.resend_interval_ticks;
        msg.timeout_deadline = now + self.config.timeout_ticks;
        self.timers.schedule(id, TimerKind::Timeout, msg.timeout_deadline);
    }

    /// A receiver probing for one of our outbound messages: confirm we are alive and
    ///  working on it.
    pub fn on_ping(&mut self, id: MessageId) {
        let driver = self.driver.clone();
        let Some(msg) = self.messages.get_mut(&id) else {
            debug!("PING for unknown outbound message {} - dropping", id);
            return;
        };
        if msg.status.is_terminal() {
            return;
        }
        if let Some(to) = msg.destination {
            Self::send_id_only(driver.as_ref(), Opcode::Busy, id, to);
        }
    }

    pub fn on_unknown(&mut self, id: MessageId, now: u64) {
        let driver = self.driver.clone();
        let max_restarts = self.config.max_restarts;
        let Some(msg) = self.messages.get_mut(&id) else {
            debug!("UNKNOWN for unknown message {} - dropping", id);
            return;
        };
        match msg.status {
            OutboundStatus::InProgress | OutboundStatus::Sent => {
                if msg.restarts < max_restarts {
                    // the receiver lost (or never had) its state - start over from the
                    //  first byte for at-least-once delivery
                    msg.restarts += 1;
                    warn!("receiver has no state for {} - restarting transmission ({} of {})", id, msg.restarts, max_restarts);
                    msg.send_cursor = 0;
                    msg.resend_queue.clear();
                    msg.status = OutboundStatus::InProgress;
                    msg.resend_deadline = now + self.config.resend_interval_ticks;
                    self.timers.schedule(id, TimerKind::Resend, msg.resend_deadline);
                }
                else {
                    warn!("receiver has no state for {} after {} restarts - giving up", id, msg.restarts);
                    msg.status = OutboundStatus::Failed;
                    Self::release_packets(driver.as_ref(), msg);
                }
            }
            _ => {}
        }
    }

    pub fn on_error(&mut self, id: MessageId) {
        let driver = self.driver.clone();
        let Some(msg) = self.messages.get_mut(&id) else {
            debug!("ERROR for unknown message {} - dropping", id);
            return;
        };
        if !msg.status.is_terminal() {
            warn!("receiver failed message {}", id);
            msg.status = OutboundStatus::Failed;
            Self::release_packets(driver.as_ref(), msg);
        }
    }

    /// The per-poll transmission pass: fire due timers, then emit DATA packets in SRPT
    ///  order up to the configured burst.
    pub fn poll(&mut self, now: u64) {
        self.fire_timers(now);
        self.transmit(now);
        self.sweep();
    }

    fn fire_timers(&mut self, now: u64) {
        let driver = self.driver.clone();
        let mut expired = Vec::new();
        self.timers.advance(now, &mut expired);

        for entry in expired {
            let Some(msg) = self.messages.get_mut(&entry.id) else {
                continue;
            };
            if msg.status.is_terminal() {
                continue;
            }

            match entry.kind {
                TimerKind::Timeout => {
                    if msg.timeout_deadline > now {
                        // pushed back by a BUSY in the meantime
                        self.timers.schedule(entry.id, TimerKind::Timeout, msg.timeout_deadline);
                        continue;
                    }
                    warn!("message {} timed out without completing", entry.id);
                    msg.status = OutboundStatus::Failed;
                    Self::release_packets(driver.as_ref(), msg);
                }
                TimerKind::Resend => {
                    if msg.status != OutboundStatus::InProgress {
                        // probing for a fully transmitted message is the ping timer's job
                        continue;
                    }
                    if msg.resend_deadline > now {
                        self.timers.schedule(entry.id, TimerKind::Resend, msg.resend_deadline);
                        continue;
                    }
                    // No progress signal from the receiver for a full interval. If we are
                    //  stalled waiting for grants, probe the receiver - it answers with
                    //  RESEND for whatever it is missing, with a GRANT, or with BUSY.
                    if !msg.next_cursor_sendable() && msg.resend_queue.is_empty() {
                        if let Some(to) = msg.destination {
                            trace!("no progress on {} - pinging receiver", entry.id);
                            Self::send_id_only(driver.as_ref(), Opcode::Ping, entry.id, to);
                        }
                    }
                    msg.resend_deadline = now + self.config.resend_interval_ticks;
                    self.timers.schedule(entry.id, TimerKind::Resend, msg.resend_deadline);
                }
                TimerKind::Ping => {
                    if msg.ping_deadline > now {
                        self.timers.schedule(entry.id, TimerKind::Ping, msg.ping_deadline);
                        continue;
                    }
                    if msg.status == OutboundStatus::Sent {
                        if let Some(to) = msg.destination {
                            trace!("still waiting for DONE on {} - pinging receiver", entry.id);
                            Self::send_id_only(driver.as_ref(), Opcode::Ping, entry.id, to);
                        }
                        msg.ping_deadline = now + self.config.ping_interval_ticks;
                        self.timers.schedule(entry.id, TimerKind::Ping, msg.ping_deadline);
                    }
                }
            }
        }
    }

    fn transmit(&mut self, now: u64) {
        let driver = self.driver.clone();

        // Rebuild the SRPT order lazily: shortest remaining bytes first, ties broken in
        //  favor of the older message.
        let mut candidates = self
            .messages
            .iter()
            .filter(|(_, msg)| msg.has_work())
            .map(|(id, msg)| (msg.length - msg.bytes_sent, id.sequence, *id))
            .collect::<Vec<_>>();
        candidates.sort_unstable();

        let mut budget = self.config.max_send_burst;
        for (_, _, id) in candidates {
            if budget == 0 {
                break;
            }
            let msg = self.messages.get_mut(&id)
                .expect("this is a bug: candidate ids are taken from the table");

            while budget > 0 {
                let (idx, priority) = if let Some(requested) = msg.resend_queue.pop_front() {
                    requested
                }
                else if msg.next_cursor_sendable() {
                    let idx = msg.send_cursor;
                    let priority = if msg.packet_start(idx) < msg.unscheduled || msg.length == 0 {
                        msg.unscheduled_priority
                    }
                    else {
                        msg.granted_priority
                    };
                    msg.send_cursor += 1;
                    msg.bytes_sent = max(msg.bytes_sent, msg.packet_end(idx));
                    (idx, priority)
                }
                else {
                    break;
                };

                DataHeader::patch_priority(&mut msg.packets[idx], priority);
                let to = msg.destination
                    .expect("this is a bug: messages without a destination have no work");
                trace!("emitting packet {} of {} at priority {}", idx, id, priority);
                if let Err(e) = driver.send_packet(to, msg.packets[idx].as_ref()) {
                    error!("driver failed to send packet for {}: {:#} - failing the message", id, e);
                    msg.status = OutboundStatus::Failed;
                    Self::release_packets(driver.as_ref(), msg);
                    break;
                }
                budget -= 1;
            }

            if msg.status == OutboundStatus::InProgress
                && msg.send_cursor == msg.packets.len()
                && msg.resend_queue.is_empty()
            {
                if msg.flags.no_ack {
                    debug!("message {} fully transmitted, no ack required - completing", id);
                    msg.status = OutboundStatus::Completed;
                    Self::release_packets(driver.as_ref(), msg);
                }
                else {
                    debug!("message {} fully transmitted - awaiting DONE", id);
                    msg.status = OutboundStatus::Sent;
                    msg.ping_deadline = now + self.config.ping_interval_ticks;
                    self.timers.schedule(id, TimerKind::Ping, msg.ping_deadline);
                }
            }
        }
    }

    /// Retire terminal messages whose handle is gone (detached sends end up here).
    fn sweep(&mut self) {
        let retired = self
            .messages
            .iter()
            .filter(|(_, msg)| msg.status.is_terminal() && msg.handle_dropped)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in retired {
            self.retire(id);
        }
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
