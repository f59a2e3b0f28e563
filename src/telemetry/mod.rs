//! CBOR telemetry aggregation: periodic per-tier data collection fanned
//! out to registered sinks, and the receive side that hashes incoming
//! keys and notifies matching watchers. Grounded on `net_telemetry.cc`,
//! adapted from its intrusive-linked-list registration (`TelemetryTier`/
//! `TelemetrySink` add themselves to their parent's list on construction)
//! to the explicit `add_*`-returns-`Result` idiom already used by
//! [`crate::ptp::tracking::TrackingController`] and [`crate::eth::Dispatch`],
//! since safe Rust has no equivalent to a self-registering base-class
//! constructor without a cell or unsafe code.

pub mod cbor;

use heapless::Vec;
use thiserror::Error;

pub use cbor::{CborMapIter, CborValue, CborWriter};

/// Per-record backing buffer size. Chosen to comfortably hold a handful
/// of scalar fields; an embedding with larger records picks a bigger
/// `CborWriter<N>` directly rather than widening this default.
pub const CBOR_BUFFER_LEN: usize = 256;

pub type Cbor = CborWriter<CBOR_BUFFER_LEN>;

pub const DEFAULT_TICK_MSEC: u32 = 100;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tier table is full")]
    TierTableFull,
    #[error("sink table is full")]
    SinkTableFull,
    #[error("watcher table is full")]
    WatcherTableFull,
}

/// A human-readable telemetry key whose on-wire hash is computed once at
/// construction (the same CRC-32 used for Ethernet FCS).
pub struct TelemetryKey {
    pub label: &'static str,
    pub hash: u32,
}

impl TelemetryKey {
    pub fn new(label: &'static str) -> Self {
        TelemetryKey {
            label,
            hash: crate::crc::crc32(label.as_bytes()),
        }
    }
}

/// One periodically-polled data source, invoked by the aggregator it's
/// registered with. `tier_id` lets one source feed several tiers at
/// different rates if needed, though the common case ignores it.
pub trait TelemetrySource {
    fn telem_event(&mut self, tier_id: u32, cbor: &mut Cbor);
}

/// Receives each tier's encoded CBOR bytes once a polling interval
/// elapses and the tier (or, in concatenated mode, the whole aggregator)
/// has something to send.
pub trait TelemetrySink {
    fn telem_ready(&mut self, tier_id: u32, data: &[u8]);
}

struct TierSlot<'a> {
    tier_id: u32,
    source: &'a mut dyn TelemetrySource,
    interval_msec: u32,
    time_count: u32,
}

/// Holds a fixed-capacity list of [`TelemetrySource`]s (one per "tier",
/// each with its own polling period) and [`TelemetrySink`]s, and drives
/// both from a single, externally-clocked tick.
///
/// In `concat_tiers` mode every tier's fields land in one shared CBOR map
/// sent once per aggregator tick under `tier_id == 0`; otherwise each due
/// tier gets its own map sent under its own `tier_id`, matching
/// `TelemetryAggregator::timer_event`'s two branches.
pub struct TelemetryAggregator<'a, const MAX_TIERS: usize, const MAX_SINKS: usize> {
    tiers: Vec<TierSlot<'a>, MAX_TIERS>,
    sinks: Vec<&'a mut dyn TelemetrySink, MAX_SINKS>,
    concat_tiers: bool,
    tick_msec: u32,
    now: u32,
    next_due_msec: u32,
}

impl<'a, const MAX_TIERS: usize, const MAX_SINKS: usize> TelemetryAggregator<'a, MAX_TIERS, MAX_SINKS> {
    pub fn new(concat_tiers: bool) -> Self {
        TelemetryAggregator {
            tiers: Vec::new(),
            sinks: Vec::new(),
            concat_tiers,
            tick_msec: DEFAULT_TICK_MSEC,
            now: 0,
            next_due_msec: 0,
        }
    }

    /// Register a data source under `tier_id`, polled every
    /// `interval_msec` (rounded up to a multiple of the aggregator's own
    /// tick, like the source's `set_interval`). An `interval_msec` of zero
    /// disables polling for this tier without removing it.
    pub fn add_tier(
        &mut self,
        tier_id: u32,
        interval_msec: u32,
        source: &'a mut dyn TelemetrySource,
    ) -> Result<(), Error> {
        if interval_msec > 0 && interval_msec < self.tick_msec {
            self.tick_msec = interval_msec;
        }
        self.tiers
            .push(TierSlot {
                tier_id,
                source,
                interval_msec,
                time_count: 0,
            })
            .map_err(|_| Error::TierTableFull)
    }

    pub fn add_sink(&mut self, sink: &'a mut dyn TelemetrySink) -> Result<(), Error> {
        self.sinks.push(sink).map_err(|_| Error::SinkTableFull)
    }

    pub fn set_time(&mut self, now_msec: u32) {
        self.now = now_msec;
    }

    fn due(&self) -> bool {
        self.now.wrapping_sub(self.next_due_msec) < (1 << 31)
    }

    fn telem_send(&mut self, tier_id: u32, cbor: &mut Cbor) {
        if !cbor.close() || cbor.is_empty() {
            return;
        }
        let encoded = cbor.encoded();
        for sink in self.sinks.iter_mut() {
            sink.telem_ready(tier_id, encoded);
        }
    }

    /// Advance every tier's internal clock by one tick and send any data
    /// that became due. Call once per main-loop pass after `set_time`.
    pub fn poll_always(&mut self) {
        if !self.due() {
            return;
        }
        self.next_due_msec = self.now.wrapping_add(self.tick_msec);

        if !self.concat_tiers {
            for tier in self.tiers.iter_mut() {
                tier.time_count += self.tick_msec;
                if tier.interval_msec == 0 || tier.time_count < tier.interval_msec {
                    continue;
                }
                tier.time_count -= tier.interval_msec;
                let mut cbor = Cbor::new();
                tier.source.telem_event(tier.tier_id, &mut cbor);
                if !cbor.close() || cbor.is_empty() {
                    continue;
                }
                let encoded = cbor.encoded();
                for sink in self.sinks.iter_mut() {
                    sink.telem_ready(tier.tier_id, encoded);
                }
            }
        } else {
            let mut cbor = Cbor::new();
            for tier in self.tiers.iter_mut() {
                tier.time_count += self.tick_msec;
                if tier.interval_msec == 0 || tier.time_count < tier.interval_msec {
                    continue;
                }
                tier.time_count -= tier.interval_msec;
                tier.source.telem_event(tier.tier_id, &mut cbor);
            }
            self.telem_send(0, &mut cbor);
        }
    }
}

/// Receives a [`TelemetryWatcher`]'s attention: one key/value pair from a
/// decoded telemetry packet.
pub trait TelemetryWatcher {
    fn telem_rcvd(&mut self, key: u32, value: CborValue<'_>);
}

/// Decodes inbound CBOR telemetry packets and notifies every registered
/// watcher of each key/value pair. A packet that fails to parse as a CBOR
/// map (truncated, wrong type) is silently dropped.
pub struct TelemetryRx<'a, const MAX_WATCHERS: usize> {
    watchers: Vec<&'a mut dyn TelemetryWatcher, MAX_WATCHERS>,
}

impl<'a, const MAX_WATCHERS: usize> TelemetryRx<'a, MAX_WATCHERS> {
    pub fn new() -> Self {
        TelemetryRx {
            watchers: Vec::new(),
        }
    }

    pub fn add_watcher(&mut self, watcher: &'a mut dyn TelemetryWatcher) -> Result<(), Error> {
        self.watchers.push(watcher).map_err(|_| Error::WatcherTableFull)
    }

    pub fn telem_packet(&mut self, data: &[u8]) {
        let Some(items) = CborMapIter::new(data) else {
            return;
        };
        for (key, value) in items {
            for watcher in self.watchers.iter_mut() {
                watcher.telem_rcvd(key, value);
            }
        }
    }
}

impl<'a, const MAX_WATCHERS: usize> Default for TelemetryRx<'a, MAX_WATCHERS> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`TelemetryWatcher`] that emits one log line per matched key,
/// optionally filtered down to a single key.
pub struct TelemetryLogger {
    source_label: &'static str,
    filter: Option<u32>,
}

impl TelemetryLogger {
    /// Log every key received.
    pub fn new(source_label: &'static str) -> Self {
        TelemetryLogger {
            source_label,
            filter: None,
        }
    }

    /// Log only the one key named by `key.hash`.
    pub fn filtered(source_label: &'static str, key: &TelemetryKey) -> Self {
        TelemetryLogger {
            source_label,
            filter: Some(key.hash),
        }
    }
}

impl TelemetryWatcher for TelemetryLogger {
    fn telem_rcvd(&mut self, key: u32, value: CborValue<'_>) {
        if let Some(filter) = self.filter {
            if filter != key {
                return;
            }
        }
        let log = crate::log::Log::new(crate::log::INFO, self.source_label).write_u32(key);
        let log = match value {
            CborValue::Uint(v) => log.write_dec64(v),
            CborValue::Int(v) => log.write_dec_signed64(v),
            CborValue::Bytes(b) => log.write_bytes(b),
            CborValue::Text(s) => log.write(s),
            CborValue::F32(v) => log.write(&fmt_f32(v)),
            CborValue::F64(v) => log.write(&fmt_f32(v as f32)),
            CborValue::Bool(v) => log.write_bool(v),
        };
        log.emit_global();
    }
}

fn fmt_f32(val: f32) -> heapless::String<32> {
    use core::fmt::Write as _;
    let mut s = heapless::String::new();
    let _ = write!(s, "{}", val);
    s
}

/// Short-circuits one [`TelemetryAggregator`]'s output directly into a
/// local [`TelemetryRx`], bypassing any network transport. Used by tests
/// and single-process embeddings that want telemetry delivered without a
/// real Ethernet/UDP round trip.
pub struct TelemetryLoopback<'r, 'a, const MAX_WATCHERS: usize> {
    dst: &'r mut TelemetryRx<'a, MAX_WATCHERS>,
}

impl<'r, 'a, const MAX_WATCHERS: usize> TelemetryLoopback<'r, 'a, MAX_WATCHERS> {
    pub fn new(dst: &'r mut TelemetryRx<'a, MAX_WATCHERS>) -> Self {
        TelemetryLoopback { dst }
    }
}

impl<'r, 'a, const MAX_WATCHERS: usize> TelemetrySink for TelemetryLoopback<'r, 'a, MAX_WATCHERS> {
    fn telem_ready(&mut self, _tier_id: u32, data: &[u8]) {
        self.dst.telem_packet(data);
    }
}
