//! tidepool-balancer: routes each request to one pool of a [`PoolGroup`].
//!
//! ```text
//! SelectionHint ──► LoadBalancer::select ──► PoolGroup::eligible (Healthy, open)
//!                        │                        │
//!                        └──── Strategy ◄─────────┘
//!                   round_robin | least_connections | weighted
//! ```
//!
//! The group is passed around explicitly; there is no process-wide
//! registry. The health checker flips pool health, and the executor feeds
//! request outcomes back through [`LoadBalancer::record_outcome`] to tune
//! weights.

pub mod balancer;
pub mod error;
pub mod group;
pub mod strategy;

pub use balancer::{LoadBalancer, SelectionHint};
pub use error::{BalancerError, BalancerResult};
pub use group::{Candidate, MAX_WEIGHT, MIN_WEIGHT, MemberStatus, PoolGroup};
pub use strategy::{LeastConnections, RoundRobin, Strategy, Weighted, strategy_for};
