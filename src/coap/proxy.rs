//! CoAP reverse proxy (RFC 7252 section 5.7): forwards requests for a
//! fixed set of registered resources to a downstream server and relays
//! the eventual response back to the original requestor.
//!
//! Grounded directly on `coap_proxy.cc`'s transaction bookkeeping: a
//! single monotonically-increasing token counter, incremented by two so
//! that `token_client`/`token_server` (same masking here) can derive a
//! pair of values from one base — [`token_server`] is the literal token
//! sent on the wire to the downstream server, [`token_client`] is the
//! key this proxy's own transaction table is looked up under. The
//! original's `Connection`/`Endpoint` classes (confirmable
//! retransmission, separate-response mode, a pooled set of persistent
//! `ConnectionUdp` sessions) are not reproduced: this is a stateless,
//! one-transaction-slot-per-request-in-flight store-and-forward
//! translator, not a full CoAP endpoint.

use heapless::Vec;

use crate::coap::message::{self, code, Message};
use crate::io::Writeable;
use crate::ip::{Addr, Port};

/// Mask applied to the transaction counter before tagging a direction
/// onto it; the low bit is reserved for [`token_client`]/[`token_server`].
pub const TOKEN_MASK: u32 = 0xFFFF_FFFE;

pub const fn token_client(x: u32) -> u32 {
    x & TOKEN_MASK
}

pub const fn token_server(x: u32) -> u32 {
    (x & TOKEN_MASK) | 1
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resource table is full")]
    ResourceTableFull,
    #[error("no free transaction slot")]
    ProxyBusy,
}

/// One reverse-proxied resource: requests under `local_uri` are
/// forwarded to `fwd_addr`:`fwd_port`, optionally rewriting the
/// Uri-Path to `fwd_uri` (defaulting to `local_uri` unchanged).
#[derive(Clone, Copy, Debug)]
pub struct ProxyResource {
    pub local_uri: &'static str,
    pub fwd_addr: Addr,
    pub fwd_port: Port,
    pub fwd_uri: Option<&'static str>,
}

impl ProxyResource {
    fn effective_fwd_uri(&self) -> &'static str {
        self.fwd_uri.unwrap_or(self.local_uri)
    }
}

struct Transaction {
    base_token: u32,
    client_addr: Addr,
    client_port: Port,
    client_token: Vec<u8, 8>,
    client_msg_id: u16,
}

/// Options forwarded verbatim alongside the rewritten Uri-Path, matching
/// `ProxyResource::request_any`'s explicit list in the original.
fn copy_passthrough_options(msg: &Message<'_>, dst: &mut dyn Writeable, last_number: &mut u16) {
    if let Some(v) = msg.find_option(message::OPTION_CONTENT_FORMAT) {
        message::write_option(dst, last_number, message::OPTION_CONTENT_FORMAT, v);
    }
    if let Some(v) = msg.find_option(message::OPTION_BLOCK1) {
        message::write_option(dst, last_number, message::OPTION_BLOCK1, v);
    }
    if let Some(v) = msg.find_option(message::OPTION_BLOCK2) {
        message::write_option(dst, last_number, message::OPTION_BLOCK2, v);
    }
    if let Some(v) = msg.find_option(message::OPTION_SIZE1) {
        message::write_option(dst, last_number, message::OPTION_SIZE1, v);
    }
}

/// `NRES` bounds the number of registered [`ProxyResource`]s; `NTXN`
/// bounds the number of requests that may be awaiting a response at
/// once.
pub struct ProxyServer<const NRES: usize, const NTXN: usize> {
    resources: Vec<ProxyResource, NRES>,
    transactions: Vec<Option<Transaction>, NTXN>,
    next_msgid: u16,
    next_token: u32,
}

impl<const NRES: usize, const NTXN: usize> ProxyServer<NRES, NTXN> {
    /// `seed` should come from an embedding-supplied source of entropy
    /// (or any fixed value for deterministic tests); it only needs to
    /// avoid colliding with a prior run's in-flight tokens after a
    /// restart, not be cryptographically unpredictable.
    pub fn new(seed: u32) -> Self {
        let mut transactions = Vec::new();
        for _ in 0..NTXN {
            let _ = transactions.push(None);
        }
        ProxyServer {
            resources: Vec::new(),
            transactions,
            next_msgid: seed as u16,
            next_token: seed,
        }
    }

    pub fn add_resource(&mut self, resource: ProxyResource) -> Result<(), Error> {
        self.resources.push(resource).map_err(|_| Error::ResourceTableFull)
    }

    pub fn next_msgid(&mut self) -> u16 {
        let id = self.next_msgid;
        self.next_msgid = self.next_msgid.wrapping_add(1);
        id
    }

    pub fn next_token(&mut self) -> u32 {
        self.next_token = self.next_token.wrapping_add(2) & TOKEN_MASK;
        self.next_token
    }

    fn find_resource(&self, msg: &Message<'_>) -> Option<ProxyResource> {
        self.resources.iter().copied().find(|r| msg.uri_path_matches(r.local_uri))
    }

    fn free_slot(&mut self) -> Option<&mut Option<Transaction>> {
        self.transactions.iter_mut().find(|t| t.is_none())
    }

    /// Resolve a token previously handed to the downstream server back
    /// to the client that originated the request, without consuming the
    /// slot — mirrors `ProxyServer::find_client`.
    pub fn find_client(&self, token: u32) -> Option<(Addr, Port)> {
        let want = token_client(token);
        self.transactions
            .iter()
            .filter_map(|t| t.as_ref())
            .find(|t| t.base_token == want)
            .map(|t| (t.client_addr, t.client_port))
    }

    /// True if `token`'s server-facing form already names an in-flight
    /// transaction — mirrors `ProxyServer::find_server`.
    pub fn find_server(&self, token: u32) -> bool {
        let want = token_server(token);
        self.transactions
            .iter()
            .filter_map(|t| t.as_ref())
            .any(|t| token_server(t.base_token) == want)
    }

    /// Handle an incoming request. If its Uri-Path matches a registered
    /// resource, forwards it to that resource's downstream server via
    /// `out` (already positioned at the destination by the caller's
    /// UDP/IP framing) and returns `true`. Otherwise returns `false` so
    /// the caller can fall back to local resource handling.
    pub fn handle_request(
        &mut self,
        msg: &Message<'_>,
        client_addr: Addr,
        client_port: Port,
        out: &mut dyn Writeable,
    ) -> Result<bool, Error> {
        let Some(resource) = self.find_resource(msg) else {
            return Ok(false);
        };
        let slot = self.free_slot().ok_or(Error::ProxyBusy)?;
        let base_token = self.next_token;
        self.next_token = self.next_token.wrapping_add(2) & TOKEN_MASK;
        let msgid = self.next_msgid();
        self.next_msgid = self.next_msgid.wrapping_add(1);

        let mut client_token: Vec<u8, 8> = Vec::new();
        let _ = client_token.extend_from_slice(msg.token());
        *slot = Some(Transaction {
            base_token,
            client_addr,
            client_port,
            client_token,
            client_msg_id: msg.msg_id(),
        });

        let wire_token = token_server(base_token).to_be_bytes();
        let header = message::Header {
            msg_type: msg.msg_type(),
            token_len: 4,
            code: msg.code(),
            msg_id: msgid,
        };
        header.write_to(out);
        out.write_bytes(&wire_token);

        let mut last_number = 0u16;
        message::write_uri_path(out, &mut last_number, resource.effective_fwd_uri());
        copy_passthrough_options(msg, out, &mut last_number);
        out.write_u8(0xFF);
        out.write_bytes(msg.payload());
        out.write_finalize();
        Ok(true)
    }

    /// Handle an incoming response. If its token matches an in-flight
    /// transaction, relays it back to the original client via `out`
    /// (already positioned at the client's address) and frees the
    /// transaction slot, returning `true`. Otherwise returns `false` —
    /// the caller should treat it as a non-proxy response, if any.
    pub fn handle_response(&mut self, msg: &Message<'_>, out: &mut dyn Writeable) -> bool {
        if msg.token().len() != 4 {
            return false;
        }
        let rcvd_token = u32::from_be_bytes(msg.token().try_into().unwrap());
        let idx = self.transactions.iter().position(|t| {
            t.as_ref()
                .is_some_and(|t| token_server(t.base_token) == rcvd_token)
        });
        let Some(idx) = idx else {
            return false;
        };
        let txn = self.transactions[idx].take().expect("checked by position");

        let header = message::Header {
            msg_type: message::Type::Acknowledgement,
            token_len: txn.client_token.len() as u8,
            code: msg.code(),
            msg_id: txn.client_msg_id,
        };
        header.write_to(out);
        out.write_bytes(&txn.client_token);

        let mut last_number = 0u16;
        if let Some(v) = msg.find_option(message::OPTION_URI_PATH) {
            message::write_option(out, &mut last_number, message::OPTION_URI_PATH, v);
        }
        copy_passthrough_options(msg, out, &mut last_number);
        out.write_u8(0xFF);
        out.write_bytes(msg.payload());
        out.write_finalize();
        true
    }

    /// A transaction that never saw a response (e.g. downstream
    /// timeout): report a gateway-timeout to the original client and
    /// free the slot — mirrors `ProxyServer::coap_error`.
    pub fn fail_transaction(&mut self, base_token: u32, out: &mut dyn Writeable) {
        let idx = self
            .transactions
            .iter()
            .position(|t| t.as_ref().is_some_and(|t| t.base_token == base_token));
        let Some(idx) = idx else { return };
        let txn = self.transactions[idx].take().expect("checked by position");

        let header = message::Header {
            msg_type: message::Type::Acknowledgement,
            token_len: txn.client_token.len() as u8,
            code: code::GATEWAY_TIMEOUT,
            msg_id: txn.client_msg_id,
        };
        header.write_to(out);
        out.write_bytes(&txn.client_token);
        out.write_finalize();
    }
}
