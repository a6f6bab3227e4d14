//! sleuth is a programmable Ethereum JSON-RPC client built for automated
//! testing: concurrent nonce management over a pool of signing keys,
//! adaptive gas estimation with congestion buffering, replacement of stuck
//! transactions, and decoding of call traces against registered ABIs.

pub mod abi;
pub mod cache;
pub mod chain;
pub mod client;
pub mod config;
pub mod error;
pub mod trace;
pub mod tx;
pub mod units;

pub use abi::{AbiFinder, AbiFinderResult, ContractMap, ContractStore, UNKNOWN};
pub use client::{Client, DecodedTransaction, SentTransaction};
pub use config::{Config, CongestionStrategy, Experiment, Priority};
pub use error::{SleuthError, SleuthResult};
pub use trace::{DecodedCall, DecodedEvent, TraceBundle, Tracer};
pub use tx::bump::{priority_based_bump_strategy, GasBumpStrategy, TxBumper};
pub use tx::gas::{Congestion, FeePercentiles, FeeStats, GasAdjuster};
pub use tx::nonce::{KeyNonce, NonceManager, NonceSource, TIMED_OUT_KEY_NUM};
