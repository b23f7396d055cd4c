//! Per-call resolution
//!
//! Picks the context, provider (or pipeline) and audio profile for one
//! call. Resolution order, first match wins: per-call channel variable,
//! then the context's declared override, then the global default. A
//! resolved provider that is disabled or missing fails the call before
//! any audio is committed.

use std::collections::HashMap;

use tracing::debug;

use arivox_media_core::profile::AudioProfile;

use super::{Config, ContextConfig, PipelineConfig, ProviderConfig};
use crate::error::{EngineError, Result};

/// Channel variables the dialplan may set per call
#[derive(Debug, Clone, Default)]
pub struct CallVars {
    pub provider: Option<String>,
    pub context: Option<String>,
    pub audio_profile: Option<String>,
    pub greeting: Option<String>,
    pub persona: Option<String>,
}

impl CallVars {
    /// Extract the `AI_*` variables from a channel-variable map
    pub fn from_channel_vars(vars: &HashMap<String, String>) -> Self {
        let get = |name: &str| vars.get(name).filter(|v| !v.is_empty()).cloned();
        Self {
            provider: get("AI_PROVIDER"),
            context: get("AI_CONTEXT"),
            audio_profile: get("AI_AUDIO_PROFILE"),
            greeting: get("AI_GREETING"),
            persona: get("AI_PERSONA"),
        }
    }
}

/// What the session runs with, chosen before media attaches
#[derive(Debug, Clone)]
pub enum ResolvedProvider {
    Monolithic {
        name: String,
        provider: ProviderConfig,
    },
    Pipeline {
        name: String,
        pipeline: PipelineConfig,
        stt: ProviderConfig,
        llm: ProviderConfig,
        tts: ProviderConfig,
    },
}

impl ResolvedProvider {
    pub fn name(&self) -> &str {
        match self {
            ResolvedProvider::Monolithic { name, .. } => name,
            ResolvedProvider::Pipeline { name, .. } => name,
        }
    }

    pub fn is_monolithic(&self) -> bool {
        matches!(self, ResolvedProvider::Monolithic { .. })
    }

    /// Whether the provider owns turn detection for this call
    pub fn use_provider_vad(&self) -> bool {
        match self {
            ResolvedProvider::Monolithic { provider, .. } => provider.use_provider_vad,
            ResolvedProvider::Pipeline { .. } => false,
        }
    }
}

/// Everything the coordinator needs, pinned at call start
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    pub context_name: String,
    pub context: ContextConfig,
    pub provider: ResolvedProvider,
    pub profile: AudioProfile,
    /// Greeting after per-call override
    pub greeting: String,
    /// System prompt after persona override
    pub prompt: String,
}

fn lookup_provider(config: &Config, name: &str) -> Result<ResolvedProvider> {
    if let Some(provider) = config.providers.get(name) {
        if provider.kind != super::ProviderRole::Monolithic {
            return Err(EngineError::Config(format!(
                "provider '{name}' is a pipeline member, not callable directly"
            )));
        }
        if !provider.enabled {
            return Err(EngineError::Config(format!("provider '{name}' is disabled")));
        }
        return Ok(ResolvedProvider::Monolithic {
            name: name.to_string(),
            provider: provider.clone(),
        });
    }
    if let Some(pipeline) = config.pipelines.get(name) {
        let member = |role: &str, member_name: &str| -> Result<ProviderConfig> {
            let p = config.providers.get(member_name).ok_or_else(|| {
                EngineError::Config(format!(
                    "pipeline '{name}' {role} provider '{member_name}' missing"
                ))
            })?;
            if !p.enabled {
                return Err(EngineError::Config(format!(
                    "pipeline '{name}' {role} provider '{member_name}' is disabled"
                )));
            }
            Ok(p.clone())
        };
        return Ok(ResolvedProvider::Pipeline {
            name: name.to_string(),
            stt: member("stt", &pipeline.stt)?,
            llm: member("llm", &pipeline.llm)?,
            tts: member("tts", &pipeline.tts)?,
            pipeline: pipeline.clone(),
        });
    }
    Err(EngineError::Config(format!("provider '{name}' is not configured")))
}

/// Resolve one call against a pinned config snapshot
pub fn resolve_call(config: &Config, vars: &CallVars) -> Result<ResolvedCall> {
    let context_name = vars
        .context
        .clone()
        .unwrap_or_else(|| config.default_context.clone());
    let context = config
        .contexts
        .get(&context_name)
        .cloned()
        .unwrap_or_else(|| {
            debug!(context = %context_name, "context not configured, using empty defaults");
            ContextConfig {
                greeting: String::new(),
                prompt: String::new(),
                persona: String::new(),
                tools: Vec::new(),
                profile: None,
                provider: None,
            }
        });

    let provider_name = vars
        .provider
        .clone()
        .or_else(|| context.provider.clone())
        .unwrap_or_else(|| config.default_provider.clone());
    let provider = lookup_provider(config, &provider_name)?;

    let profile_name = vars
        .audio_profile
        .clone()
        .or_else(|| context.profile.clone())
        .unwrap_or_else(|| config.default_profile.clone());
    let profile = config.profile(&profile_name)?;

    let greeting = vars
        .greeting
        .clone()
        .unwrap_or_else(|| context.greeting.clone());
    let prompt = match &vars.persona {
        Some(persona) => format!("{}\n\n{persona}", context.prompt),
        None if !context.persona.is_empty() => {
            format!("{}\n\n{}", context.prompt, context.persona)
        }
        None => context.prompt.clone(),
    };

    debug!(
        context = %context_name,
        provider = %provider.name(),
        profile = %profile.name,
        "resolved call"
    );

    Ok(ResolvedCall {
        context_name,
        context,
        provider,
        profile,
        greeting,
        prompt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::minimal_toml;

    fn config_with_pipeline() -> Config {
        let mut raw = minimal_toml();
        raw.push_str(
            r#"
            [providers.local_stt]
            kind = "stt"
            url = "ws://stt.local"

            [providers.local_llm]
            kind = "llm"
            url = "http://llm.local/v1/chat/completions"
            model = "llama"

            [providers.local_tts]
            kind = "tts"
            url = "http://tts.local/synthesize"
            tts_mode = "file"

            [pipelines.local_hybrid]
            stt = "local_stt"
            llm = "local_llm"
            tts = "local_tts"

            [contexts.sales_queue]
            greeting = "Sales here."
            prompt = "You route sales calls."
            provider = "local_hybrid"
            profile = "telephony_responsive"
            "#,
        );
        Config::from_str(&raw).unwrap().0
    }

    #[test]
    fn defaults_apply_when_no_vars() {
        let config = config_with_pipeline();
        let resolved = resolve_call(&config, &CallVars::default()).unwrap();
        assert_eq!(resolved.context_name, "default");
        assert_eq!(resolved.provider.name(), "agent");
        assert!(resolved.provider.is_monolithic());
        assert_eq!(resolved.profile.name, "telephony_ulaw_8k");
        assert_eq!(resolved.greeting, "Hello, how can I help?");
    }

    #[test]
    fn context_overrides_provider_and_profile() {
        let config = config_with_pipeline();
        let vars = CallVars {
            context: Some("sales_queue".into()),
            ..Default::default()
        };
        let resolved = resolve_call(&config, &vars).unwrap();
        assert_eq!(resolved.provider.name(), "local_hybrid");
        assert!(!resolved.provider.is_monolithic());
        assert_eq!(resolved.profile.name, "telephony_responsive");
    }

    #[test]
    fn channel_var_beats_context() {
        let config = config_with_pipeline();
        let vars = CallVars {
            context: Some("sales_queue".into()),
            provider: Some("agent".into()),
            audio_profile: Some("wideband_pcm_16k".into()),
            greeting: Some("Custom greeting".into()),
            ..Default::default()
        };
        let resolved = resolve_call(&config, &vars).unwrap();
        assert_eq!(resolved.provider.name(), "agent");
        assert_eq!(resolved.profile.name, "wideband_pcm_16k");
        assert_eq!(resolved.greeting, "Custom greeting");
    }

    #[test]
    fn disabled_provider_fails_resolution() {
        let mut config = config_with_pipeline();
        config.providers.get_mut("agent").unwrap().enabled = false;
        let err = resolve_call(&config, &CallVars::default()).unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn unknown_provider_var_fails_resolution() {
        let config = config_with_pipeline();
        let vars = CallVars {
            provider: Some("nope".into()),
            ..Default::default()
        };
        assert!(resolve_call(&config, &vars).is_err());
    }

    #[test]
    fn persona_var_is_appended_to_prompt() {
        let config = config_with_pipeline();
        let vars = CallVars {
            persona: Some("Speak like a pirate.".into()),
            ..Default::default()
        };
        let resolved = resolve_call(&config, &vars).unwrap();
        assert!(resolved.prompt.ends_with("Speak like a pirate."));
    }

    #[test]
    fn ai_vars_extracted_from_channel_map() {
        let mut vars = HashMap::new();
        vars.insert("AI_CONTEXT".to_string(), "support".to_string());
        vars.insert("AI_GREETING".to_string(), String::new());
        vars.insert("UNRELATED".to_string(), "x".to_string());
        let call_vars = CallVars::from_channel_vars(&vars);
        assert_eq!(call_vars.context.as_deref(), Some("support"));
        assert!(call_vars.greeting.is_none());
    }
}
