pub mod informer;
pub mod membership;
