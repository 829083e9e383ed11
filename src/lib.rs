//! FeodoForge
//!
//! Fetches the abuse.ch Feodo Tracker C2 blocklist and enriches it with port
//! service names, C2 lifespans and IP geolocation.

pub mod collectors;
pub mod enrichment;
pub mod models;
pub mod storage;
