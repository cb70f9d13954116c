//! Cold and hot streams
//!
//! - [`Sequence`]: cold, the producer re-runs for every collector
//! - [`StateCell`]: hot current value, conflated and de-duplicated
//! - [`Broadcast`]: hot multi-subscriber fan-out with replay and overflow policy

mod broadcast;
mod sequence;
mod state;

pub use broadcast::{Broadcast, BroadcastConfig, BroadcastSubscription, Emit as BroadcastEmit, Overflow};
pub use sequence::{sequence, Emit, Emitter, Sequence, SequenceStream};
pub use state::{StateCell, StateSubscription, WatchHandle};
