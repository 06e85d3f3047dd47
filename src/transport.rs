use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use tracing::{debug, span, trace, warn, Level};
use uuid::Uuid;

use crate::config::HomaConfig;
use crate::control_messages::{ControlMessageGrant, ControlMessageIdOnly, ControlMessageResend};
use crate::driver::Driver;
use crate::message_id::MessageId;
use crate::packet_header::{DataHeader, Opcode, PacketHeader};
use crate::policy::Policy;
use crate::receiver::Receiver;
use crate::sender::{OutboundStatus, SendFlags, Sender};

struct TransportInner {
    driver: Arc<dyn Driver>,
    config: Arc<HomaConfig>,
    transport_id: u64,
    next_sequence: AtomicU64,
    tick: AtomicU64,
    sender: Mutex<Sender>,
    receiver: Mutex<Receiver>,
    poll_mutex: Mutex<()>,
}

/// The place where all other parts of the protocol come together: it drains the driver's
///  inbound queue, dispatches packets to the Sender or Receiver by opcode, and runs their
///  per-poll passes. The public surface is thread-safe; `poll()` is the only operation
///  that makes protocol progress and must therefore be called frequently.
///
/// Concurrent `poll()` calls do not block each other: a contended call is a no-op, since
///  another thread is already making progress.
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(driver: Arc<dyn Driver>, config: HomaConfig) -> anyhow::Result<Transport> {
        config.validate()?;
        if driver.max_payload_size() <= DataHeader::SERIALIZED_LEN {
            bail!(
                "driver payload size of {} cannot fit a DATA header of {} bytes",
                driver.max_payload_size(),
                DataHeader::SERIALIZED_LEN
            );
        }

        let config = Arc::new(config);
        let policy = Arc::new(Policy::new(&config, driver.bandwidth_bps()));
        let transport_id: u64 = rand::random();
        debug!(
            "initializing transport {} on {:?} with {} RTT-bytes",
            transport_id,
            driver.local_addr(),
            policy.rtt_bytes()
        );

        Ok(Transport {
            inner: Arc::new(TransportInner {
                driver: driver.clone(),
                config: config.clone(),
                transport_id,
                next_sequence: AtomicU64::new(0),
                tick: AtomicU64::new(0),
                sender: Mutex::new(Sender::new(config.clone(), policy.clone(), driver.clone())),
                receiver: Mutex::new(Receiver::new(config, policy, driver)),
                poll_mutex: Mutex::new(()),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.driver.local_addr()
    }

    /// Creates a new outbound message bound to a fresh id. Payload is added with
    ///  `OutMessage::append`, transmission starts with `OutMessage::send`.
    pub fn alloc(&self) -> OutMessage {
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let id = MessageId::new(self.inner.transport_id, sequence);
        self.inner.sender.lock().unwrap().alloc(id);
        OutMessage { inner: self.inner.clone(), id }
    }

    /// Returns a fully reassembled inbound message, if any. Dropping (or acknowledging)
    ///  the returned handle signals completion to the sender.
    pub fn receive(&self) -> Option<InMessage> {
        let delivery = self.inner.receiver.lock().unwrap().receive()?;
        Some(InMessage {
            inner: self.inner.clone(),
            id: delivery.id,
            source: delivery.source,
            data: delivery.data,
            acked: false,
        })
    }

    /// Makes incremental progress on all transport functionality: drains inbound packets,
    ///  issues grants, transmits data and fires timers - each with a bounded amount of
    ///  work. Does not block; if another poll is already running this call is a no-op.
    pub fn poll(&self) {
        let Ok(_poll_guard) = self.inner.poll_mutex.try_lock() else {
            return;
        };
        let now = self.inner.tick.fetch_add(1, Ordering::Relaxed) + 1;

        let mut batch = Vec::with_capacity(self.inner.config.poll_receive_batch);
        self.inner.driver.receive_packets(self.inner.config.poll_receive_batch, &mut batch);
        for (from, packet_buf) in batch {
            self.dispatch(from, packet_buf.as_ref(), now);
            self.inner.driver.release_packet(packet_buf);
        }

        self.inner.receiver.lock().unwrap().poll(now);
        self.inner.sender.lock().unwrap().poll(now);
    }

    /// Routes one inbound packet by opcode. DATA belongs to the Receiver; GRANT, DONE,
    ///  RESEND, UNKNOWN and ERROR concern an outbound message and belong to the Sender.
    ///  BUSY and PING flow in both directions and are routed by whichever side owns the
    ///  id they refer to.
    fn dispatch(&self, from: SocketAddr, packet_buf: &[u8], now: u64) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "packet_received", ?correlation_id);
        let _entered = span.enter();

        trace!("received packet of {} bytes from {:?}", packet_buf.len(), from);

        let parse_buf = &mut &packet_buf[..];
        let header = match PacketHeader::deser(parse_buf) {
            Ok(header) => header,
            Err(_) => {
                warn!("received packet with unparsable header from {:?} - dropping", from);
                return;
            }
        };

        match header.opcode {
            Opcode::Data => match DataHeader::deser(parse_buf) {
                Ok(data_header) => {
                    self.inner.receiver.lock().unwrap().on_data(from, data_header, *parse_buf, now)
                }
                Err(_) => warn!("received unparsable DATA packet from {:?} - dropping", from),
            },
            Opcode::Grant => match ControlMessageGrant::deser(parse_buf) {
                Ok(grant) => self.inner.sender.lock().unwrap().on_grant(grant, now),
                Err(_) => warn!("received unparsable GRANT packet from {:?} - dropping", from),
            },
            Opcode::Resend => match ControlMessageResend::deser(parse_buf) {
                Ok(resend) => self.inner.sender.lock().unwrap().on_resend(resend, now),
                Err(_) => warn!("received unparsable RESEND packet from {:?} - dropping", from),
            },
            Opcode::Done | Opcode::Unknown | Opcode::Error | Opcode::Busy | Opcode::Ping => {
                let id = match ControlMessageIdOnly::deser(parse_buf) {
                    Ok(msg) => msg.id,
                    Err(_) => {
                        warn!("received unparsable {:?} packet from {:?} - dropping", header.opcode, from);
                        return;
                    }
                };
                match header.opcode {
                    Opcode::Done => self.inner.sender.lock().unwrap().on_done(id),
                    Opcode::Unknown => self.inner.sender.lock().unwrap().on_unknown(id, now),
                    Opcode::Error => self.inner.sender.lock().unwrap().on_error(id),
                    Opcode::Busy => {
                        if self.sender_owns(id) {
                            self.inner.sender.lock().unwrap().on_busy(id, now);
                        }
                        else {
                            self.inner.receiver.lock().unwrap().on_busy(id, now);
                        }
                    }
                    Opcode::Ping => {
                        if self.sender_owns(id) {
                            self.inner.sender.lock().unwrap().on_ping(id);
                        }
                        else {
                            self.inner.receiver.lock().unwrap().on_ping(id, from, now);
                        }
                    }
                    _ => unreachable!(),
                }
            }
        }
    }

    fn sender_owns(&self, id: MessageId) -> bool {
        id.transport_id == self.inner.transport_id
            && self.inner.sender.lock().unwrap().contains(id)
    }
}

/// Handle to an outbound message. Build it up with `append`, hand it to the transport
///  with `send`, then watch `status` until a terminal state is reached.
///
/// Dropping the handle before completion cancels the message unless it was sent with the
///  `detached` flag, in which case the transport keeps retrying on its own.
pub struct OutMessage {
    inner: Arc<TransportInner>,
    id: MessageId,
}

impl OutMessage {
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Appends payload by copying it into the message's packet buffers. Must not be
    ///  called once the message was sent.
    pub fn append(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.inner.sender.lock().unwrap().append(self.id, bytes)
    }

    /// Freezes the message and queues it for transmission. `completes` may carry inbound
    ///  messages that this send logically acknowledges; their DONE signals are emitted as
    ///  part of the same operation.
    pub fn send(
        &mut self,
        destination: SocketAddr,
        flags: SendFlags,
        completes: Vec<InMessage>,
    ) -> anyhow::Result<()> {
        let now = self.inner.tick.load(Ordering::Relaxed);
        self.inner.sender.lock().unwrap().send(self.id, destination, flags, now)?;
        for mut completed in completes {
            completed.acknowledge();
        }
        Ok(())
    }

    /// Cooperative cancellation: packets not yet transmitted are suppressed, the receiver
    ///  learns through its own timeout.
    pub fn cancel(&self) {
        self.inner.sender.lock().unwrap().cancel(self.id);
    }

    pub fn status(&self) -> OutboundStatus {
        self.inner.sender.lock().unwrap().status(self.id)
    }
}

impl Drop for OutMessage {
    fn drop(&mut self) {
        self.inner.sender.lock().unwrap().handle_dropped(self.id);
    }
}

/// Handle to a fully reassembled inbound message. The payload is owned by the handle;
///  dropping it (or calling `acknowledge`) emits the DONE acknowledgement to the sender
///  unless the sender opted out of acks.
pub struct InMessage {
    inner: Arc<TransportInner>,
    id: MessageId,
    source: SocketAddr,
    data: Vec<u8>,
    acked: bool,
}

impl InMessage {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Copies a byte range into `destination`, returning how many bytes were copied. The
    ///  count is less than `destination.len()` if the requested range extends past the
    ///  end of the message.
    pub fn read_at(&self, offset: usize, destination: &mut [u8]) -> usize {
        if offset >= self.data.len() {
            return 0;
        }
        let num = destination.len().min(self.data.len() - offset);
        destination[..num].copy_from_slice(&self.data[offset..offset + num]);
        num
    }

    /// Explicitly signals completion to the sender. Idempotent; dropping the handle has
    ///  the same effect.
    pub fn acknowledge(&mut self) {
        if !self.acked {
            self.acked = true;
            self.inner.receiver.lock().unwrap().acknowledge(self.id);
        }
    }

    /// Signals a processing failure to the sender instead of a completion.
    pub fn fail(mut self) {
        self.acked = true;
        self.inner.receiver.lock().unwrap().fail(self.id);
    }
}

impl Drop for InMessage {
    fn drop(&mut self) {
        if !self.acked {
            self.inner.receiver.lock().unwrap().acknowledge(self.id);
        }
    }
}
