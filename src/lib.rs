pub mod alarm;
pub mod api;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod extract;
pub mod health;
pub mod plan;
pub mod sink;
pub mod tags;
