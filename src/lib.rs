//! Layered response and object cache for the gamer social network API.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
