pub mod cache;
pub mod dynamic_object_ext;
pub mod store;
pub mod types;
