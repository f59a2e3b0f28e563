//! Transport-agnostic PTP ordinary-clock (slave) state machine.
//!
//! [`Client`] runs the Sync/Follow-Up/Delay-Req/Delay-Resp exchange against
//! a single master and reports a finished [`super::Measurement`] through a
//! [`super::Callback`] each time all four timestamps are known. It knows
//! nothing about how messages reach the wire; [`crate::eth::Ptp`] and
//! [`crate::udp::Ptp`] supply that via the same bind/connect/`poll_always`
//! split used by [`crate::tpipe`].

use crate::io::{Readable, Writeable};
use crate::ptp::{Callback, DelayResp, FollowUp, Header, PortId, SyncBody, Time, Timestamp};

/// Minimum interval between Delay-Req transmissions, matching a
/// `log_interval` of 0 (one second) unless overridden.
const DEFAULT_REQ_INTERVAL_MSEC: u32 = 1000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Pending {
    /// Waiting for the next Sync.
    None,
    /// Sync seen (one-step: `t1` already known); waiting to send Delay-Req.
    GotSync,
    /// Two-step Sync seen; waiting for the matching Follow-Up.
    AwaitFollowUp { seq_id: u16 },
    /// Delay-Req sent; waiting for the matching Delay-Resp.
    AwaitResp { seq_id: u16 },
}

/// Slave-side PTP session: one master, one port identity.
pub struct Client {
    local_port: PortId,
    pending: Pending,
    t1: Time,
    t2: Time,
    t3: Time,
    seq_id: u16,
    req_interval_msec: u32,
    next_req_msec: u32,
    now: u32,
    want_req: bool,
}

impl Client {
    pub fn new(local_port: PortId) -> Self {
        Client {
            local_port,
            pending: Pending::None,
            t1: Time::ZERO,
            t2: Time::ZERO,
            t3: Time::ZERO,
            seq_id: 0,
            req_interval_msec: DEFAULT_REQ_INTERVAL_MSEC,
            next_req_msec: 0,
            now: 0,
            want_req: false,
        }
    }

    pub fn set_req_interval(&mut self, msec: u32) {
        self.req_interval_msec = msec.max(1);
    }

    /// Latch the current millisecond tick; call before `packet_rcvd` or
    /// `poll_always`.
    pub fn set_time(&mut self, now_msec: u32) {
        self.now = now_msec;
    }

    /// Handle one received PTP message body (header already parsed).
    /// `local_rx_time` is the caller-supplied local timestamp of arrival,
    /// standing in for a hardware timestamp source.
    pub fn packet_rcvd(
        &mut self,
        header: &Header,
        local_rx_time: Time,
        body: &mut dyn Readable,
        callback: &mut dyn Callback,
    ) {
        match header.msg_type {
            Header::TYPE_SYNC => {
                let sync = SyncBody::read_from(body);
                if header.flags & Header::FLAG_TWO_STEP != 0 {
                    self.pending = Pending::AwaitFollowUp {
                        seq_id: header.seq_id,
                    };
                } else {
                    self.t1 = sync.origin_timestamp.as_time();
                    self.t2 = local_rx_time;
                    self.seq_id = header.seq_id;
                    self.pending = Pending::GotSync;
                    self.want_req = true;
                }
            }
            Header::TYPE_FOLLOW_UP => {
                if let Pending::AwaitFollowUp { seq_id } = self.pending {
                    if seq_id == header.seq_id {
                        let fup = FollowUp::read_from(body);
                        self.t1 = fup.precise_origin_timestamp.as_time();
                        self.t2 = local_rx_time;
                        self.seq_id = header.seq_id;
                        self.pending = Pending::GotSync;
                        self.want_req = true;
                    }
                }
            }
            Header::TYPE_DELAY_RESP => {
                if let Pending::AwaitResp { seq_id } = self.pending {
                    let resp = DelayResp::read_from(body);
                    if seq_id == header.seq_id && resp.requesting_port == self.local_port {
                        let t4 = resp.receive_timestamp.as_time();
                        let measurement = super::Measurement {
                            t1: self.t1,
                            t2: self.t2,
                            t3: self.t3,
                            t4,
                        };
                        self.pending = Pending::None;
                        callback.ptp_ready(&measurement);
                    }
                }
            }
            _ => {}
        }
    }

    /// True exactly once a Sync/Follow-Up has arrived and a Delay-Req is
    /// ready to go out; the embedding transport calls `write_delay_req`
    /// then clears this by transitioning state internally.
    pub fn due(&self) -> bool {
        self.want_req
    }

    /// Write a Delay-Req message using `local_tx_time` as `t3`. Returns the
    /// header so the transport can also provide framing/addressing hints
    /// (e.g. the destination for `DispatchTo::BroadcastL2`).
    pub fn write_delay_req(&mut self, local_tx_time: Time, out: &mut dyn Writeable) -> Header {
        self.t3 = local_tx_time;
        self.seq_id = self.seq_id.wrapping_add(1);
        self.pending = Pending::AwaitResp {
            seq_id: self.seq_id,
        };
        self.want_req = false;
        self.next_req_msec = self.now.wrapping_add(self.req_interval_msec);
        let header = Header {
            msg_type: Header::TYPE_DELAY_REQ,
            version: 2,
            length: (Header::HEADER_LEN + Timestamp::WIRE_LEN) as u16,
            domain: 0,
            sdo_id: 0,
            flags: 0,
            correction: 0,
            subtype: 0,
            src_port: self.local_port,
            seq_id: self.seq_id,
            control: 1,
            log_interval: 0,
        };
        header.write_to(out);
        SyncBody {
            origin_timestamp: local_tx_time.as_wire(),
        }
        .write_to(out);
        header
    }
}
