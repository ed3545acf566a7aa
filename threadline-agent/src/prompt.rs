//! Prompt assembly for stateless backends

use threadline_core::TranscriptEntry;
use threadline_providers::Message;

/// Turns a thread transcript into the message list sent to a provider
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    system_prompt: Option<String>,
}

impl PromptBuilder {
    /// A blank system prompt is treated as none
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        Self {
            system_prompt: (!system_prompt.trim().is_empty()).then_some(system_prompt),
        }
    }

    pub fn build_messages(&self, transcript: &[TranscriptEntry]) -> Vec<Message> {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        if let Some(system) = &self.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.extend(
            transcript
                .iter()
                .map(|entry| Message::new(entry.role.as_str(), entry.content.clone())),
        );
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadline_core::Role;

    fn transcript() -> Vec<TranscriptEntry> {
        vec![
            TranscriptEntry::new(Role::User, "hi"),
            TranscriptEntry::new(Role::Assistant, "hello"),
        ]
    }

    #[test]
    fn test_without_system_prompt() {
        let messages = PromptBuilder::default().build_messages(&transcript());
        assert_eq!(
            messages,
            vec![Message::user("hi"), Message::assistant("hello")]
        );
    }

    #[test]
    fn test_system_prompt_comes_first() {
        let messages = PromptBuilder::new("Be brief.").build_messages(&transcript());
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Message::system("Be brief."));
        assert_eq!(messages[1], Message::user("hi"));
    }

    #[test]
    fn test_blank_system_prompt_is_omitted() {
        let messages = PromptBuilder::new("   ").build_messages(&transcript());
        assert_eq!(messages.len(), 2);
    }
}
