//! Rate limiting and monitoring gateway for the FitPulse web app.
//!
//! Each instance keeps its own limiter, metrics and probe state in memory.
//! Nothing is shared between instances, so a fleet of N gateways admits up to
//! N times a policy's limit for one caller.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod state;
pub mod worker;
