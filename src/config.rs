use anyhow::bail;

/// Tuning knobs of the transport. All protocol timers are expressed in ticks, where one tick
///  is one call to `Transport::poll()` - the transport makes no progress between polls, so
///  poll-observed time is the only clock the protocol state machine ever sees.
pub struct HomaConfig {
    /// The assumed round-trip time across the fabric. Together with the driver's bandwidth
    ///  this determines RTT-bytes, i.e. the number of bytes that keep the link busy for one
    ///  round trip. RTT-bytes is both the unscheduled allowance of a new message and the
    ///  grant window kept open per scheduled message.
    ///
    /// Choosing this value too big overcommits receiver buffers, choosing it too small adds
    ///  a stall after the unscheduled prefix of every message.
    pub rtt_micros: u64,

    /// Upper limit for a single message. Messages bigger than this are rejected at the API,
    ///  and inbound DATA packets announcing a bigger total length are answered with ERROR.
    pub max_message_size: u32,

    /// The number of inbound messages that are granted concurrently. Granting only the
    ///  single shortest message would leave the link idle whenever that sender stalls, so
    ///  the receiver keeps this many messages supplied with grants at staggered priorities.
    pub overcommitment: usize,

    /// Ascending message-length cutoffs partitioning the unscheduled priority bands: a
    ///  message shorter than the first cutoff uses the highest band and so on. This is a
    ///  deployment-tuned table rather than a protocol constant - the defaults are a
    ///  reasonable starting point for mixed RPC workloads.
    pub unscheduled_priority_cutoffs: Vec<u32>,

    /// The number of (lowest) priority levels reserved for granted packets. Unscheduled
    ///  bands sit on top of these, so `scheduled_priority_levels` plus the number of
    ///  unscheduled bands must not exceed the 8 levels the wire format carries.
    pub scheduled_priority_levels: u8,

    /// Ticks without progress on a message before the peer is probed: the receiver requests
    ///  a RESEND for the first gap (or pings a stalled sender), the sender pings a receiver
    ///  that went quiet. Configure to roughly 2x the RTT in expected poll cadence.
    pub resend_interval_ticks: u64,

    /// Ticks between liveness probes for a fully transmitted message still waiting for its
    ///  DONE acknowledgement.
    pub ping_interval_ticks: u64,

    /// Ticks without completion before a message is abandoned as FAILED. Unlike the resend
    ///  timer this one is never reset by progress signals, so it bounds the total lifetime
    ///  of a message.
    pub timeout_ticks: u64,

    /// How often a sender restarts transmission from the beginning (in response to UNKNOWN
    ///  from a receiver that lost its state) before giving up and failing the message.
    pub max_restarts: u32,

    /// Upper bound on inbound packets drained from the driver in a single poll.
    pub poll_receive_batch: usize,

    /// Upper bound on DATA packets emitted in a single poll, across all outbound messages.
    pub max_send_burst: usize,
}

impl HomaConfig {
    /// Defaults for a datacenter fabric in the 10G class with single-digit-microsecond RTT,
    ///  assuming poll is driven at a sub-RTT cadence.
    pub fn default_datacenter() -> HomaConfig {
        HomaConfig {
            rtt_micros: 5,
            max_message_size: 16 * 1024 * 1024,
            overcommitment: 8,
            unscheduled_priority_cutoffs: vec![512, 4096, 16384],
            scheduled_priority_levels: 4,
            resend_interval_ticks: 50,
            ping_interval_ticks: 200,
            timeout_ticks: 2000,
            max_restarts: 3,
            poll_receive_batch: 32,
            max_send_burst: 16,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rtt_micros == 0 {
            bail!("rtt_micros must be positive");
        }
        if self.overcommitment == 0 {
            bail!("overcommitment must be at least 1");
        }
        if self.scheduled_priority_levels == 0 {
            bail!("at least one scheduled priority level is required");
        }
        let num_levels =
            self.scheduled_priority_levels as usize + self.unscheduled_priority_cutoffs.len() + 1;
        if num_levels > 8 {
            bail!("{} priority levels configured, the wire format carries at most 8", num_levels);
        }
        if !self.unscheduled_priority_cutoffs.is_sorted() {
            bail!("unscheduled priority cutoffs must be ascending");
        }
        if self.resend_interval_ticks == 0 || self.ping_interval_ticks == 0 {
            bail!("timer intervals must be positive");
        }
        if self.timeout_ticks <= self.resend_interval_ticks {
            bail!("timeout must be longer than the resend interval");
        }
        if self.poll_receive_batch == 0 || self.max_send_burst == 0 {
            bail!("per-poll work bounds must be positive");
        }
        Ok(())
    }
}
