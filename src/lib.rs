//! Keeps DNS records at one or more providers in line with the endpoints
//! requested by a set of sources, without ever touching records another
//! writer owns.

pub mod config;
pub mod conflict;
pub mod controller;
pub mod domain_filter;
pub mod endpoint;
pub mod error;
pub mod handlers;
pub mod leader;
pub mod pdns;
pub mod plan;
pub mod policy;
pub mod provider;
pub mod registry;
pub mod source;
