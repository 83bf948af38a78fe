//! Backend selection strategies.
//!
//! Every strategy picks one instance from the healthy list the server pool
//! hands it; none of them mutate the list and ties break deterministically.

pub mod strategies;

pub use strategies::{
    strategy_factory, IpHash, Strategy, StrategyFactory, WeightedLeastConnections,
    WeightedRoundRobin,
};
