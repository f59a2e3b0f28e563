//! Drives two `tpipe::Core`s through a handshake and ten consecutive
//! 4321-byte transfers over a simulated link that independently drops 20%
//! of frames in each direction, and checks that every transfer still
//! arrives byte-for-byte (via the core's own retransmit/flow-control
//! logic) inside a 60-second simulated time budget.

use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

use satcat5::io::{ArrayRead, ArrayWrite, LimitedRead, Readable, Writeable};
use satcat5::tpipe::{Core, Link};

const MESSAGE_LEN: usize = 4321;
const ITERATIONS: usize = 10;
const BUDGET_MSEC: u32 = 60_000;
const STEP_MSEC: u32 = 5;

/// Both bindings (`eth::Tpipe`, `udp::Tpipe`) only use this to gate
/// readiness (ARP/ports not yet resolved); a bare loopback always is.
struct LoopbackLink;
impl Link for LoopbackLink {
    fn open_write(&mut self, _body_len: usize, _out: &mut dyn Writeable) -> bool {
        true
    }
}

/// Delivers `bytes` to `peer`, unless `rng` rolls a drop. Mirrors a wire
/// with an independent `drop_pct` percent frame-loss rate.
fn maybe_deliver(bytes: &[u8], peer: &mut Core, now_msec: u32, rng: &mut ChaCha8Rng, drop_pct: u32) {
    if bytes.is_empty() {
        return;
    }
    if rng.next_u32() % 100 < drop_pct {
        return;
    }
    let mut r = ArrayRead::new(bytes);
    let len = r.read_ready();
    peer.set_time(now_msec);
    peer.packet_rcvd(LimitedRead::new(&mut r, len));
}

fn pseudo_random_message(seed: u64) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut data = vec![0u8; MESSAGE_LEN];
    rng.fill_bytes(&mut data);
    data
}

#[test]
fn ten_transfers_survive_twenty_percent_loss_in_each_direction() {
    let mut a = Core::new(0xA11CE);
    let mut b = Core::new(0xB0B);
    let mut link = LoopbackLink;
    let mut drop_ab = ChaCha8Rng::seed_from_u64(100);
    let mut drop_ba = ChaCha8Rng::seed_from_u64(200);

    let mut now: u32 = 0;
    a.set_time(now);
    a.open();

    // Drive the handshake to completion before timing any transfers.
    while !a.is_ready() || !b.is_ready() {
        now += STEP_MSEC;
        assert!(now < BUDGET_MSEC, "handshake never completed");
        a.set_time(now);
        b.set_time(now);

        let mut buf_a = [0u8; 32];
        let mut wa = ArrayWrite::new(&mut buf_a);
        a.poll_always(&mut link, &mut wa);
        maybe_deliver(wa.written(), &mut b, now, &mut drop_ab, 20);

        let mut buf_b = [0u8; 32];
        let mut wb = ArrayWrite::new(&mut buf_b);
        b.poll_always(&mut link, &mut wb);
        maybe_deliver(wb.written(), &mut a, now, &mut drop_ba, 20);
    }

    for iter in 0..ITERATIONS {
        let source = pseudo_random_message(iter as u64);
        let mut sent = 0usize;
        let mut received = Vec::with_capacity(MESSAGE_LEN);

        // Keep stepping until every byte has both arrived at `b` and been
        // acknowledged back to `a` — the ack for the final chunk can lag
        // the data itself by a round trip, so don't stop the instant the
        // receiver has everything.
        while received.len() < MESSAGE_LEN || !a.completed() {
            now += STEP_MSEC;
            assert!(now < BUDGET_MSEC, "transfer {iter} blew the 60s simulated budget");
            a.set_time(now);
            b.set_time(now);

            if sent < source.len() {
                let room = a.write_space().min(source.len() - sent);
                if room > 0 {
                    a.write_bytes(&source[sent..sent + room]);
                    sent += room;
                    a.data_queued();
                }
            }

            let mut buf_a = [0u8; 600];
            let mut wa = ArrayWrite::new(&mut buf_a);
            a.poll_always(&mut link, &mut wa);
            maybe_deliver(wa.written(), &mut b, now, &mut drop_ab, 20);

            let mut buf_b = [0u8; 600];
            let mut wb = ArrayWrite::new(&mut buf_b);
            b.poll_always(&mut link, &mut wb);
            maybe_deliver(wb.written(), &mut a, now, &mut drop_ba, 20);

            let ready = b.read_ready();
            if ready > 0 {
                let mut chunk = vec![0u8; ready];
                assert!(b.read_bytes(&mut chunk));
                received.extend_from_slice(&chunk);
            }
        }

        assert_eq!(received, source, "transfer {iter} did not arrive intact");
        assert!(a.completed(), "sender should have every byte of transfer {iter} acknowledged");
    }
}
