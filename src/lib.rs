//! Foreman: moves issues through a label-driven workflow by handing them to
//! worker sessions and routing their results.
//!
//! The engines ([`dispatch::DispatchEngine`], [`completion::CompletionPipeline`],
//! [`review::ReviewPoller`], [`health::HealthReconciler`]) all take a
//! [`services::Services`] value built once at startup.

pub mod actions;
pub mod audit;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod foreman_config;
pub mod health;
pub mod heartbeat;
pub mod logging;
pub mod prompt;
pub mod providers;
pub mod queue;
pub mod review;
pub mod roles;
pub mod services;
pub mod state;
pub mod workflow;

#[cfg(test)]
mod testing;
