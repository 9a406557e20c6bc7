pub mod app;
pub mod cache;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod http;
pub mod integrity;
pub mod layout;
pub mod modules;
pub mod nbia;
pub mod orchestrator;
pub mod output;
pub mod planner;
pub mod store;
pub mod sync;
