pub mod agent;
pub mod aggregator;
pub mod allocation;
pub mod allocation_store;
pub mod bucket;
pub mod bucket_store;
pub mod config;
pub mod dispatch;
pub mod manager;
pub mod network;
pub mod notification;
pub mod persistence;
pub mod registry;
pub mod retrieval_plan;
pub mod subscription;
