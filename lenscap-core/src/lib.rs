//! Protocol codecs and record types for the Lenscap interception engine.
//!
//! Everything in this crate is pure computation over byte buffers: the DER and
//! X.509 encoders used to mint certificates, the HTTP/1.1 and WebSocket wire
//! codecs, and the traffic record model. No sockets, no runtime.

pub mod der;
pub mod errors;
pub mod http;
pub mod records;
pub mod websocket;
pub mod x509;
