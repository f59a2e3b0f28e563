//! Constrained Application Protocol: a minimal message codec
//! ([`message`]) and a bounded reverse proxy built on top of it
//! ([`proxy`]) that forwards requests for a fixed set of resources to a
//! downstream server and relays the response back. Gated behind the
//! `coap` feature.

pub mod message;
pub mod proxy;
