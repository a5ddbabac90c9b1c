pub mod deliverer;
pub mod queue;
pub mod reconcile;
