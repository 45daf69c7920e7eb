//! Custody KBS (Key Broker Service)
//!
//! A single-host broker that holds versioned key material for local callers
//! and exposes operations over it (encrypt, decrypt, HMAC, sign, verify).
//! Key material itself only leaves the broker for callers holding the
//! `retrieve` capability.
//!
//! The crate is split into:
//! - [`keystore`]: versioned key sets and the persisted key store file
//! - [`permission`]: caller identity, grants and the permission gate
//! - [`protocol`]: framed bincode request/response contract
//! - [`broker`]: request dispatch
//! - [`server`] and [`client`]: the Unix socket daemon and its client handle

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod keystore;
pub mod permission;
pub mod protocol;
pub mod server;

pub use broker::{Broker, ConnectionContext};
pub use client::{BrokerClient, ClientOptions, RetrievedKey};
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use keystore::{load_keystore, KeyStore, KeyVersion, MemoryKeyStore};
pub use permission::{Action, CallerIdentity, Capability, Entity, Grant, PermissionGate, PolicyGate};
pub use protocol::{ErrorKind, Operation, Request, Response, ResponseBody};
pub use server::BrokerServer;
