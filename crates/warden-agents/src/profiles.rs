use crate::agent::{Agent, AgentSettings};
use crate::descriptor::{AgentCategory, AgentDescriptor};
use crate::llm_agent::LlmAgent;
use std::sync::Arc;
use warden_core::GenerationBackend;

/// Create the built-in analysis agents, all sharing one generation backend.
pub fn builtin_agents(backend: Arc<dyn GenerationBackend>) -> Vec<Arc<dyn Agent>> {
    vec![
        stride_agent(backend.clone()),
        owasp_agent(backend.clone()),
        compliance_agent(backend.clone()),
        architecture_agent(backend),
    ]
}

fn stride_agent(backend: Arc<dyn GenerationBackend>) -> Arc<dyn Agent> {
    let descriptor = AgentDescriptor::new("stride", AgentCategory::Threat)
        .with_version("2.1.0")
        .with_description("STRIDE threat modeling of the described system")
        .with_priority(10)
        .needs_document()
        .with_legacy_alias("threat_modeling");
    Arc::new(
        LlmAgent::new(descriptor, STRIDE_PROMPT, backend)
            .with_default_settings(AgentSettings::default().with_temperature(0.3)),
    )
}

fn owasp_agent(backend: Arc<dyn GenerationBackend>) -> Arc<dyn Agent> {
    let descriptor = AgentDescriptor::new("owasp", AgentCategory::Vulnerability)
        .with_version("1.4.0")
        .with_description("OWASP Top 10 vulnerability review")
        .with_priority(20)
        .needs_document()
        .with_legacy_alias("vulnerability_scan");
    Arc::new(
        LlmAgent::new(descriptor, OWASP_PROMPT, backend)
            .with_default_settings(AgentSettings::default().with_temperature(0.2)),
    )
}

fn compliance_agent(backend: Arc<dyn GenerationBackend>) -> Arc<dyn Agent> {
    let descriptor = AgentDescriptor::new("compliance", AgentCategory::Compliance)
        .with_version("1.2.0")
        .with_description("Control-framework gap analysis")
        .with_priority(30)
        .needs_document()
        .with_legacy_alias("compliance_check");
    Arc::new(
        LlmAgent::new(descriptor, COMPLIANCE_PROMPT, backend)
            .with_default_settings(AgentSettings::default().with_temperature(0.1)),
    )
}

fn architecture_agent(backend: Arc<dyn GenerationBackend>) -> Arc<dyn Agent> {
    let descriptor = AgentDescriptor::new("architecture", AgentCategory::Architecture)
        .with_version("1.0.0")
        .with_description("Trust-boundary review of a structured architecture model")
        .with_priority(40)
        .needs_structured_input()
        .disabled_by_default();
    Arc::new(
        LlmAgent::new(descriptor, ARCHITECTURE_PROMPT, backend)
            .with_default_settings(AgentSettings::default().with_max_tokens(6144)),
    )
}

const STRIDE_PROMPT: &str = "\
You are a security architect performing STRIDE threat modeling. \
Identify threats in each category (Spoofing, Tampering, Repudiation, \
Information disclosure, Denial of service, Elevation of privilege) that the \
described system is realistically exposed to.

Rules:
1. Name the affected component for every threat.
2. Put the STRIDE category in \"classification\".
3. Rate impact and likelihood independently.
4. Give a concrete, actionable mitigation.
5. Do not invent components the document does not mention.
";

const OWASP_PROMPT: &str = "\
You are an application security reviewer. Assess the described system \
against the OWASP Top 10 and report concrete vulnerabilities.

Rules:
1. Use category \"vulnerability\" and put the OWASP identifier (e.g. A01) \
   in \"classification\".
2. Tie every finding to a component and a specific weakness.
3. Prefer fewer, well-supported findings over speculative ones.
4. Lower \"confidence\" when the document lacks detail.
";

const COMPLIANCE_PROMPT: &str = "\
You are a compliance auditor. Compare the described system with common \
control frameworks (SOC 2, ISO 27001, GDPR) and report gaps.

Rules:
1. Use category \"compliance\" and name the control in \"classification\".
2. Describe what evidence is missing, not just the control title.
3. Mitigations must state the control activity that closes the gap.
";

const ARCHITECTURE_PROMPT: &str = "\
You are reviewing a structured architecture model (components, data flows \
and trust boundaries given as JSON). Report threats arising where data \
crosses a trust boundary without authentication, integrity protection or \
encryption.

Rules:
1. Use category \"threat\" and reference the data flow in \"component\".
2. Use the prior findings to avoid repeating known issues.
";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use warden_core::{Generation, GenerationRequest, WardenResult};

    struct NullBackend;

    #[async_trait]
    impl GenerationBackend for NullBackend {
        async fn generate(&self, _request: GenerationRequest) -> WardenResult<Generation> {
            Ok(Generation {
                content: "[]".into(),
                tokens_used: 0,
            })
        }
    }

    #[test]
    fn test_builtin_agents_are_valid_and_unique() {
        let agents = builtin_agents(Arc::new(NullBackend));
        assert_eq!(agents.len(), 4);
        let mut names = HashSet::new();
        for agent in &agents {
            let d = agent.descriptor();
            d.validate().unwrap();
            assert!(names.insert(d.name.clone()));
            if let Some(alias) = &d.legacy_alias {
                assert!(names.insert(alias.clone()));
            }
        }
    }

    #[test]
    fn test_architecture_is_opt_in() {
        let agents = builtin_agents(Arc::new(NullBackend));
        let arch = agents
            .iter()
            .find(|a| a.descriptor().name == "architecture")
            .unwrap();
        assert!(!arch.descriptor().enabled_by_default);
        assert!(arch.descriptor().requirements.needs_structured_input);
        assert_eq!(arch.default_settings().max_tokens, Some(6144));
    }
}
