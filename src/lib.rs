//! Ratewarden - in-process admission control for sensitive endpoints
//!
//! This crate implements an exact sliding-window-log rate limiter. Each key
//! may make at most `limit` requests per window, across any number of
//! windows enforced together (e.g. 6/hour and 20/day). Eviction timers
//! release keys once their traffic stops, so memory follows active traffic.

pub mod config;
pub mod error;
pub mod ratelimit;
