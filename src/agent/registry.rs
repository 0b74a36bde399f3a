//! Agent registry: which agents react to which label.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::agent::hook::{AgentHooks, RunWindow};
use crate::config::Settings;
use crate::error::RegistryError;
use crate::pipeline::types::TriageLabel;

/// Soft per-hook time budget used when an agent does not set one.
pub const DEFAULT_TIMEOUT_HINT: Duration = Duration::from_secs(60);

/// A startup function that registers one or more agents. Settings are
/// passed for registration-time options such as schedules.
pub type Registrar = fn(&mut AgentRegistry, &Settings) -> Result<(), RegistryError>;

/// When an agent's `postLabel` hook runs.
#[derive(Debug, Clone, Default)]
pub enum RunWhen {
    /// Every run.
    #[default]
    Always,
    /// Runs whose window contains an occurrence of the schedule.
    Cron(Box<cron::Schedule>),
}

impl RunWhen {
    /// Parse a cron expression (seconds field included, e.g. `0 0 17 * * *`).
    pub fn cron(agent: &str, expression: &str) -> Result<Self, RegistryError> {
        cron::Schedule::from_str(expression)
            .map(|s| Self::Cron(Box::new(s)))
            .map_err(|e| RegistryError::InvalidSchedule {
                name: agent.to_string(),
                reason: format!("{expression}: {e}"),
            })
    }

    /// Whether the hook should run for `window`.
    pub fn is_due(&self, window: &RunWindow) -> bool {
        match self {
            Self::Always => true,
            Self::Cron(schedule) => schedule
                .after(&window.start)
                .next()
                .is_some_and(|next| next <= window.end),
        }
    }
}

/// Registration metadata.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub run_when: RunWhen,
    /// Soft budget; exceeding it only logs a warning.
    pub timeout_hint: Duration,
    pub enabled: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            run_when: RunWhen::Always,
            timeout_hint: DEFAULT_TIMEOUT_HINT,
            enabled: true,
        }
    }
}

impl AgentOptions {
    pub fn run_when(mut self, run_when: RunWhen) -> Self {
        self.run_when = run_when;
        self
    }

    pub fn timeout_hint(mut self, hint: Duration) -> Self {
        self.timeout_hint = hint;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// One agent registered for one label.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub label: TriageLabel,
    pub name: String,
    pub hooks: AgentHooks,
    pub options: AgentOptions,
}

impl AgentRegistration {
    /// Settings key prefix for this agent: `todo-forwarder` → `todo_forwarder`.
    pub fn settings_key(&self) -> String {
        settings_key(&self.name)
    }

    /// Enabled unless the options or the `<key>_enabled` setting say otherwise.
    pub fn is_enabled(&self, settings: &Settings) -> bool {
        self.options.enabled
            && settings
                .flag(&format!("{}_enabled", self.settings_key()))
                .unwrap_or(true)
    }

    /// Dry when the global flag or the `<key>_dry_run` setting says so. The
    /// setting can only add dry-run, never lift a global one.
    pub fn dry_run(&self, settings: &Settings, global: bool) -> bool {
        global
            || settings
                .flag(&format!("{}_dry_run", self.settings_key()))
                .unwrap_or(false)
    }
}

/// Settings key prefix for an agent name.
pub fn settings_key(name: &str) -> String {
    name.replace('-', "_").to_lowercase()
}

/// Label → ordered agent registrations. Built once at startup.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<TriageLabel, Vec<AgentRegistration>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry by running each registrar in order.
    pub fn from_registrars(
        registrars: &[Registrar],
        settings: &Settings,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for registrar in registrars {
            registrar(&mut registry, settings)?;
        }
        tracing::info!(agents = registry.len(), "Agent registry built");
        Ok(registry)
    }

    /// Register an agent for `label`. Same-label agents run in registration order.
    pub fn register(
        &mut self,
        label: TriageLabel,
        name: impl Into<String>,
        hooks: AgentHooks,
        options: AgentOptions,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if hooks.is_empty() {
            return Err(RegistryError::NoHooks {
                label: label.to_string(),
                name,
            });
        }

        let slot = self.agents.entry(label).or_default();
        if slot.iter().any(|r| r.name == name) {
            return Err(RegistryError::Duplicate {
                label: label.to_string(),
                name,
            });
        }

        tracing::debug!(
            %label,
            agent = %name,
            on_label = hooks.on_label.is_some(),
            post_label = hooks.post_label.is_some(),
            enabled = options.enabled,
            "Registered agent"
        );
        slot.push(AgentRegistration {
            label,
            name,
            hooks,
            options,
        });
        Ok(())
    }

    /// Agents registered for `label`, in registration order.
    pub fn agents(&self, label: TriageLabel) -> &[AgentRegistration] {
        self.agents.get(&label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All registrations, grouped by label in label order.
    pub fn iter(&self) -> impl Iterator<Item = &AgentRegistration> {
        self.agents.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.agents.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
