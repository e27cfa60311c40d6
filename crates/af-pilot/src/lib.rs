pub mod checkpoints;
pub mod coordinator;
pub mod events;
pub mod executor;
pub mod objectives;
pub mod signal;
pub mod stagnation;
