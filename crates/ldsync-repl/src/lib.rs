#![warn(missing_docs)]

//! ldsync replication: multi-master replication of directory data.
//!
//! Every replica stamps its changes with a change sequence number
//! ([`csn::Csn`]) and publishes them through a [`domain::ReplicationDomain`]
//! to a [`broker::ReplicationServer`], which stores them in its changelog and
//! relays them to the other replicas of the same base DN. Conflicting changes
//! are resolved identically everywhere, so replicas converge once they have
//! seen the same changes.

pub mod backend;
pub mod broker;
pub mod changelog;
pub mod config;
pub mod conflict_resolver;
pub mod csn;
pub mod dn;
pub mod domain;
pub mod entry_store;
pub mod error;
pub mod flow;
pub mod generation;
pub mod heartbeat;
pub mod historical;
pub mod metrics;
pub mod monitor;
pub mod pending;
pub mod protocol;
pub mod purge;
pub mod replay;
pub mod retry;
pub mod selection;
pub mod server_state;
pub mod session;
pub mod status;
pub mod update_msg;
pub mod wire;

pub use broker::ReplicationServer;
pub use config::{BrokerConfig, DomainConfig, ReplConfig};
pub use csn::{Csn, CsnGenerator, ServerId};
pub use dn::Dn;
pub use domain::{FullUpdateEvent, ReplicationDomain};
pub use error::{ReplError, Result};
pub use server_state::{ReplicaId, ServerState};
pub use status::ReplicaStatus;
pub use update_msg::{LocalChange, Modification, UpdateMsg};
