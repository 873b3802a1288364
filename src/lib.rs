//! Transparent Redis AUTH-rewriting proxy.
//!
//! A client authenticates against the proxy's own password; the proxy
//! swaps that for the real upstream Redis credentials before forwarding
//! the handshake, then shuttles bytes unmodified for the rest of the
//! connection. See the individual modules for the pieces: [`resp`] does
//! the wire-level recognition, [`auth`] tracks per-session state,
//! [`pool`] manages upstream connections, and [`listener`] / [`session`]
//! wire it all together around an accept loop.

pub mod auth;
pub mod config;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod resp;
pub mod session;
