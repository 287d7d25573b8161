//! Analysis agents for the Warden orchestration engine.
//!
//! Defines what an agent is, keeps the set of registered agents, and guards
//! every agent call with a per-agent circuit breaker.
//!
//! # Main types
//!
//! - [`Agent`] — Trait every analysis agent implements.
//! - [`AgentDescriptor`] — Name, priority, requirements and legacy alias of an agent.
//! - [`AgentRegistry`] — Registered agents with alias resolution and hot-reloadable settings.
//! - [`HealthMonitor`] — Circuit breaker, call timeout, recovery and background sweep.
//! - [`LlmAgent`] — Agent backed by a [`warden_core::GenerationBackend`].

/// The agent trait and per-agent settings.
pub mod agent;
/// Static agent metadata and input requirements.
pub mod descriptor;
/// Circuit breaker, reliability scoring and background sweep.
pub mod health;
/// Generation-backed agent.
pub mod llm_agent;
/// Built-in agent set.
pub mod profiles;
/// Agent registry.
pub mod registry;

pub use agent::{Agent, AgentSettings};
pub use descriptor::{AgentCategory, AgentDescriptor, AgentRequirements};
pub use health::{AgentHealthMetrics, BreakerState, HealthConfig, HealthMonitor, ProbeResult};
pub use llm_agent::{LlmAgent, DEFAULT_CACHE_CAPACITY};
pub use profiles::builtin_agents;
pub use registry::{AgentHandle, AgentRegistry};
