//! Peer-to-peer wire protocol and the tracker client.
//!
//! Nodes find each other through the tracker ([`tracker`]) and then talk
//! directly over a line-based TCP protocol ([`wire`]): [`client`] issues one
//! request per connection, [`server`] answers requests against the local jobs.

pub mod client;
pub mod server;
pub mod tracker;
pub mod wire;

pub use client::{PeerClient, PeerReply};
pub use server::PeerServer;
pub use tracker::{PeerAddr, TrackerClient, TrackerKey};
