#![doc = include_str!("../README.md")]

mod common;
mod dht;
pub mod rpc;

pub use common::{Id, Node};
pub use dht::{Dht, DhtBuilder, Testnet};
