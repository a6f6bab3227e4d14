//! Node interaction: RPC provider with failover and debug tracing calls

mod provider;

pub use provider::NodeProvider;
