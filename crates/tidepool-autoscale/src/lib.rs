//! tidepool-autoscale: resizes pool targets from observed utilization.
//!
//! The sizer reads the samples the performance monitor collected since its
//! previous tick, and grows or shrinks each pool's target once a condition
//! has held for enough consecutive ticks. Resizing is advisory; in-flight
//! work is never interrupted.

pub mod sizer;

pub use sizer::{PoolSizer, SizeDecision, WindowObservation};
