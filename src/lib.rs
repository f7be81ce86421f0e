//! # Partitioned Parameter Server
//!
//! A key-value store for machine-learning model parameters. Workers push
//! local updates ("preValues") for keys and pull the latest values; the
//! server merges pushes with a user-supplied [`ParameterUpdater`].
//!
//! ## Key Features
//!
//! - **Hash routing**: a key's 32-bit hash picks its partition, and the
//!   [`ServerResolver`] maps partitions to servers
//! - **Sequential partitions**: one thread per partition applies that
//!   partition's operations strictly in arrival order; partitions run in parallel
//! - **Blocking pulls with timeouts**: replies are correlated by request id,
//!   so many threads can pull through one worker
//! - **Network transparent**: workers and servers only talk through a
//!   [`Transport`]; [`LocalNetwork`] wires co-located participants
//! - **Pluggable codecs**: keys, preValues and values are opaque bytes on
//!   the wire
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  push / pull   ┌──────────────────────────────┐
//! │ ParameterWorker  │ ─────────────> │ PartitionedParameterServer   │
//! │  resolver        │    Envelope    │   ┌─────────┐  ┌─────────┐   │
//! │  codecs          │                │   │ part 0  │  │ part 1  │   │
//! │  pending pulls   │ <───────────── │   │ queue   │  │ queue   │   │
//! └──────────────────┘     reply      │   │ store   │  │ store   │   │
//!                                     │   └─────────┘  └─────────┘   │
//!                                     └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use partitioned_ps::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let manager = ParameterServerManager::new(4);
//! let network = Arc::new(LocalNetwork::default());
//! let resolver = Arc::new(manager.resolver()?);
//! let codecs = Codecs::<i32, i32, i32>::new(IntegerCodec, IntegerCodec, IntegerCodec);
//!
//! let server = PartitionedParameterServer::serve(
//!     manager.server_config(),
//!     resolver.clone(),
//!     AddUpdater::<i32, i32>::new(),
//!     codecs.clone(),
//!     network.clone(),
//! )?;
//!
//! let worker = ParameterWorker::new(manager.worker_config(), resolver, codecs, network)?;
//! worker.push(&7, &1)?;
//! assert_eq!(worker.pull(&7)?, 1);
//!
//! server.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, rust_2018_idioms)]

pub mod codec;
pub mod error;
pub mod key;
pub mod manager;
pub mod message;
pub mod partition;
pub mod queue;
pub mod resolver;
pub mod server;
pub mod transport;
pub mod updater;
pub mod worker;

// Re-exports
pub use codec::{BincodeCodec, Codec, Codecs, IntegerCodec, StringCodec};
pub use error::{Error, Result};
pub use key::{key_hash, EncodedKey, EndpointId};
pub use manager::ParameterServerManager;
pub use message::{Envelope, MsgType, PsMsg, PullMsg, PushMsg, ReplyMsg};
pub use partition::{PartitionConfig, PartitionStore};
pub use resolver::{ServerResolver, SingleNodeResolver, StaticResolver};
pub use server::{NetworkReplySender, PartitionedParameterServer, ReplySender, ServerConfig, ServerMsgHandler};
pub use transport::{LocalNetwork, MessageHandler, NetworkConfig, Transport};
pub use updater::{AddUpdater, ParameterUpdater, SgdUpdater};
pub use worker::{ParameterWorker, WorkerConfig};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::codec::{BincodeCodec, Codec, Codecs, IntegerCodec, StringCodec};
    pub use crate::error::{Error, Result};
    pub use crate::key::{EncodedKey, EndpointId};
    pub use crate::manager::ParameterServerManager;
    pub use crate::resolver::{ServerResolver, SingleNodeResolver, StaticResolver};
    pub use crate::server::{PartitionedParameterServer, ReplySender, ServerConfig};
    pub use crate::transport::{LocalNetwork, Transport};
    pub use crate::updater::{AddUpdater, ParameterUpdater, SgdUpdater};
    pub use crate::worker::{ParameterWorker, WorkerConfig};
}
