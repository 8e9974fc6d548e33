//! NetworkManager over the system D-Bus.

mod client;
mod proxies;

pub use client::NmClient;
