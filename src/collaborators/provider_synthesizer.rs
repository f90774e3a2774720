//! Flow synthesizer backed by a chat-completion provider.

use crate::collaborators::FlowSynthesizer;
use crate::error::CollaboratorError;
use crate::orchestrator::RepairContext;
use crate::provider::{ChatClient, ChatMessage, CompletionOptions};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_SYSTEM_PROMPT: &str = "You write Salesforce Flow metadata. \
Reply with one complete Flow XML document (root element <Flow> in the \
http://soap.sforce.com/2006/04/metadata namespace) and nothing else.";

pub struct ProviderSynthesizer {
    client: Arc<dyn ChatClient>,
    options: CompletionOptions,
    system_prompt: String,
}

impl ProviderSynthesizer {
    pub fn new(client: Arc<dyn ChatClient>) -> Self {
        Self {
            client,
            options: CompletionOptions::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }
}

#[async_trait]
impl FlowSynthesizer for ProviderSynthesizer {
    async fn synthesize(
        &self,
        requirements: &str,
        context: &RepairContext,
    ) -> Result<String, CollaboratorError> {
        let messages = vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(render_request(requirements, context)),
        ];
        let response = self.client.complete(messages, self.options.clone()).await?;
        debug!(
            flow = %context.flow_api_name,
            attempt = context.attempt_number,
            model = %response.model,
            completion_tokens = response.usage.completion_tokens,
            "Synthesis response received"
        );
        extract_flow_xml(&response.content)
            .map(str::to_string)
            .ok_or_else(|| {
                CollaboratorError::Synthesis("response contains no <Flow> document".to_string())
            })
    }
}

/// User message: requirements first, then whatever the previous attempts taught.
pub fn render_request(requirements: &str, context: &RepairContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Flow API name: {}", context.flow_api_name);
    let _ = writeln!(out, "Attempt: {}", context.attempt_number);
    let _ = writeln!(out, "\nRequirements:\n{}", requirements.trim());

    if !context.errors.is_empty() {
        let _ = writeln!(out, "\nThe previous attempt failed. Fix these errors:");
        for error in &context.errors {
            let _ = writeln!(out, "- {}", error);
        }
    }
    if !context.applicable_success_patterns.is_empty() {
        let _ = writeln!(out, "\nThese structures deployed and validated before:");
        for pattern in &context.applicable_success_patterns {
            let _ = writeln!(out, "- {}", pattern);
        }
    }
    if !context.applicable_failure_patterns.is_empty() {
        let _ = writeln!(out, "\nKnown failure causes:");
        for failure in &context.applicable_failure_patterns {
            let _ = writeln!(out, "- {}", failure);
        }
    }
    if !context.recommendations.is_empty() {
        let _ = writeln!(out, "\nRecommendations:");
        for rec in &context.recommendations {
            let _ = writeln!(out, "- {}", rec.trim());
        }
    }
    out
}

/// The `<Flow>` document inside a model reply, with any XML declaration in front
/// of it. Code fences and surrounding prose are dropped. A self-closing `<Flow/>`
/// is returned as is.
pub fn extract_flow_xml(reply: &str) -> Option<&str> {
    let root = reply.match_indices("<Flow").find_map(|(idx, _)| {
        let next = reply[idx + "<Flow".len()..].chars().next()?;
        (next.is_whitespace() || next == '>' || next == '/').then_some(idx)
    })?;
    let open_end = root + reply[root..].find('>')? + 1;
    let end = if reply[..open_end].ends_with("/>") {
        open_end
    } else {
        let close = "</Flow>";
        let end = reply.rfind(close)? + close.len();
        if end <= root {
            return None;
        }
        end
    };
    let start = reply[..root]
        .rfind("<?xml")
        .filter(|&decl| !reply[decl..root].contains("```"))
        .unwrap_or(root);
    Some(reply[start..end].trim())
}
