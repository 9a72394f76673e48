//! Core of `cloudopt`: turns provider data into cost-saving recommendations,
//! runs them as approval-gated actions and chains actions into workflows.

pub mod action;
pub mod config;
pub mod error;
pub mod execution;
pub mod io;
pub mod paths;
pub mod provider;
pub mod recommend;
pub mod recommendation;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod workflow;

pub use error::{CloudoptError, Result};
