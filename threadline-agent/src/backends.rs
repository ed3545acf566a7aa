//! Backend construction from configuration

use std::sync::Arc;
use threadline_core::config::{BackendsConfig, StatefulBackendConfig, StatelessBackendConfig};
use threadline_providers::{ChatCompletionClient, ConversationClient, StatefulProvider};
use tracing::info;

use crate::prompt::PromptBuilder;
use crate::relay::StatelessBackend;

fn api_key(key: &str) -> Option<String> {
    Some(key.to_string()).filter(|key| !key.trim().is_empty())
}

pub fn stateless_backend(config: &StatelessBackendConfig) -> Option<StatelessBackend> {
    if !config.enabled {
        return None;
    }
    info!(
        "Stateless backend: {} (model {})",
        config.api_base, config.model
    );
    let client = ChatCompletionClient::new(
        api_key(&config.api_key),
        config.api_base.clone(),
        config.model.clone(),
        config.extra_headers.clone(),
    );
    Some(StatelessBackend {
        provider: Arc::new(client),
        model: Some(config.model.clone()),
        temperature: f64::from(config.temperature),
        prompt: PromptBuilder::new(config.system_prompt.clone()),
    })
}

pub fn stateful_backend(config: &StatefulBackendConfig) -> Option<Arc<dyn StatefulProvider>> {
    if !config.enabled {
        return None;
    }
    info!("Stateful backend: {}", config.api_base);
    Some(Arc::new(ConversationClient::new(
        api_key(&config.api_key),
        config.api_base.clone(),
        config.extra_headers.clone(),
    )))
}

/// Both backends, `None` where disabled
pub fn build_backends(
    config: &BackendsConfig,
) -> (Option<StatelessBackend>, Option<Arc<dyn StatefulProvider>>) {
    (
        stateless_backend(&config.stateless),
        stateful_backend(&config.stateful),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_stateless_only() {
        let (stateless, stateful) = build_backends(&BackendsConfig::default());
        let stateless = stateless.unwrap();
        assert_eq!(stateless.model.as_deref(), Some("gpt-3.5-turbo"));
        assert!((stateless.temperature - 0.9).abs() < 1e-6);
        assert!(stateful.is_none());
    }

    #[test]
    fn test_disabled_backends_are_skipped() {
        let mut config = BackendsConfig::default();
        config.stateless.enabled = false;
        config.stateful.enabled = true;

        let (stateless, stateful) = build_backends(&config);
        assert!(stateless.is_none());
        assert!(stateful.is_some());
    }

    #[test]
    fn test_blank_api_key_is_none() {
        assert_eq!(api_key("  "), None);
        assert_eq!(api_key("sk-1"), Some("sk-1".to_string()));
    }
}
