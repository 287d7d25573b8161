use crate::agent::{Agent, AgentSettings};
use crate::descriptor::AgentDescriptor;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use warden_core::{WardenError, WardenResult};

/// An agent together with the settings snapshot it will run with.
///
/// The settings `Arc` is captured when the handle is created, so a reload
/// never changes the settings of a call already in flight.
#[derive(Clone)]
pub struct AgentHandle {
    /// The registered agent.
    pub agent: Arc<dyn Agent>,
    /// Settings captured when the handle was taken.
    pub settings: Arc<AgentSettings>,
}

impl AgentHandle {
    /// Registered name.
    pub fn name(&self) -> &str {
        &self.agent.descriptor().name
    }

    /// Agent descriptor.
    pub fn descriptor(&self) -> &AgentDescriptor {
        self.agent.descriptor()
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("name", &self.name())
            .field("settings", &self.settings)
            .finish()
    }
}

struct Entry {
    agent: Arc<dyn Agent>,
    settings: Arc<AgentSettings>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    aliases: HashMap<String, String>,
}

/// Central registry of analysis agents.
///
/// Registration is first-wins: a name or legacy alias can never be claimed twice.
pub struct AgentRegistry {
    inner: RwLock<Inner>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register every agent in order, failing on the first rejection.
    pub fn with_agents(agents: Vec<Arc<dyn Agent>>) -> WardenResult<Self> {
        let registry = Self::new();
        for agent in agents {
            registry.register(agent)?;
        }
        Ok(registry)
    }

    /// Register an agent under its name and legacy alias.
    pub fn register(&self, agent: Arc<dyn Agent>) -> WardenResult<()> {
        let descriptor = agent.descriptor().clone();
        descriptor.validate()?;

        let mut inner = self.inner.write();
        if inner.entries.contains_key(&descriptor.name) || inner.aliases.contains_key(&descriptor.name) {
            warn!(agent = %descriptor.name, "Rejected duplicate agent registration");
            return Err(WardenError::AgentCollision(descriptor.name));
        }
        if let Some(alias) = &descriptor.legacy_alias {
            if inner.entries.contains_key(alias) || inner.aliases.contains_key(alias) {
                warn!(agent = %descriptor.name, alias = %alias, "Rejected colliding legacy alias");
                return Err(WardenError::AgentCollision(alias.clone()));
            }
            inner.aliases.insert(alias.clone(), descriptor.name.clone());
        }

        let settings = Arc::new(agent.default_settings());
        inner
            .entries
            .insert(descriptor.name.clone(), Entry { agent, settings });
        info!(
            agent = %descriptor.name,
            version = %descriptor.version,
            priority = descriptor.priority,
            "Registered agent"
        );
        Ok(())
    }

    /// Map a legacy alias to its current name. Current names resolve to themselves.
    pub fn resolve(&self, name: &str) -> Option<String> {
        let inner = self.inner.read();
        if inner.entries.contains_key(name) {
            return Some(name.to_string());
        }
        inner.aliases.get(name).cloned()
    }

    /// Handle for one agent, by name or alias.
    pub fn get(&self, name: &str) -> WardenResult<AgentHandle> {
        let inner = self.inner.read();
        let resolved = if inner.entries.contains_key(name) {
            name
        } else {
            inner
                .aliases
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| WardenError::AgentNotFound(name.to_string()))?
        };
        inner
            .entries
            .get(resolved)
            .map(|e| AgentHandle {
                agent: e.agent.clone(),
                settings: e.settings.clone(),
            })
            .ok_or_else(|| WardenError::AgentNotFound(name.to_string()))
    }

    /// The named agents (aliases accepted), ordered by priority then name.
    /// Unknown names are logged and dropped; duplicates collapse.
    pub fn list_enabled(&self, enabled: &[String]) -> Vec<AgentHandle> {
        let mut seen = HashSet::new();
        let mut handles = Vec::new();
        for name in enabled {
            match self.get(name) {
                Ok(handle) => {
                    if seen.insert(handle.name().to_string()) {
                        handles.push(handle);
                    }
                }
                Err(_) => warn!(agent = %name, "Unknown agent in enabled list, skipping"),
            }
        }
        sort_handles(&mut handles);
        handles
    }

    /// Agents enabled by default, ordered by priority then name.
    pub fn default_enabled(&self) -> Vec<AgentHandle> {
        let mut handles: Vec<_> = self
            .all()
            .into_iter()
            .filter(|h| h.descriptor().enabled_by_default)
            .collect();
        sort_handles(&mut handles);
        handles
    }

    /// Every registered agent, ordered by priority then name.
    pub fn all(&self) -> Vec<AgentHandle> {
        let inner = self.inner.read();
        let mut handles: Vec<_> = inner
            .entries
            .values()
            .map(|e| AgentHandle {
                agent: e.agent.clone(),
                settings: e.settings.clone(),
            })
            .collect();
        drop(inner);
        sort_handles(&mut handles);
        handles
    }

    /// Swap an agent's settings. Calls already holding a handle keep the old ones.
    pub fn reload(&self, name: &str, settings: AgentSettings) -> WardenResult<()> {
        let resolved = self
            .resolve(name)
            .ok_or_else(|| WardenError::AgentNotFound(name.to_string()))?;
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(&resolved)
            .ok_or_else(|| WardenError::AgentNotFound(name.to_string()))?;
        entry.settings = Arc::new(settings);
        info!(agent = %resolved, "Reloaded agent settings");
        Ok(())
    }

    /// Restore the agent's default settings.
    pub fn reset_settings(&self, name: &str) -> WardenResult<()> {
        let handle = self.get(name)?;
        self.reload(handle.name(), handle.agent.default_settings())
    }

    /// Current settings of an agent.
    pub fn settings(&self, name: &str) -> WardenResult<Arc<AgentSettings>> {
        self.get(name).map(|h| h.settings)
    }

    /// Descriptors of every agent, sorted by priority then name.
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.all().iter().map(|h| h.descriptor().clone()).collect()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(|h| h.name().to_string()).collect()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_handles(handles: &mut [AgentHandle]) {
    handles.sort_by(|a, b| {
        a.descriptor()
            .priority
            .cmp(&b.descriptor().priority)
            .then_with(|| a.name().cmp(b.name()))
    });
}
