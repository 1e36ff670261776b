//! Cluster coordination plane.
//!
//! A single master owns the Global Cookie Jar and the session-status
//! registry; worker nodes talk to it through four RPCs (broadcast, status
//! update, snapshot, watch) carried as length-delimited protobuf frames
//! over TCP. The watch RPC is server-streaming: subscribers get the current
//! jar snapshot immediately, then a push for every later broadcast.

pub mod client;
pub mod lock;
pub mod master;
pub mod proto;

pub use client::{ClusterError, WorkerClient};
pub use lock::{with_lock, DistributedLock, InMemoryLock, LockError};
pub use master::{listen_and_serve, serve, GlobalCookieJar, MasterError, MasterService};
