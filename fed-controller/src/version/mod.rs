pub mod adapter;
pub mod manager;
pub mod resource;
