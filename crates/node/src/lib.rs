//! Parallelcoin node: network synchronization core.
//!
//! The three long-lived components live here: the outbound connection
//! manager ([`connmgr`]), the block sync manager ([`netsync`]), and the
//! mining controller ([`control`]). The [`server`] module drives peer
//! sockets and fans announcements back out; [`wire`] and [`peer`] carry the
//! protocol plumbing they share.

pub mod addr_book;
pub mod config;
pub mod connmgr;
pub mod control;
pub mod fee_estimator;
pub mod netsync;
pub mod peer;
pub mod progress;
pub mod server;
pub mod wire;
