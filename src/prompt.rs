use serde::{Deserialize, Serialize};

/// Placeholder replaced by the job's source text.
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// One chat message sent to the completion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Substitute `{input}` in `template`. A template without the placeholder
/// gets the input appended on its own paragraph.
pub fn render(template: &str, input: &str) -> String {
    if template.contains(INPUT_PLACEHOLDER) {
        template.replace(INPUT_PLACEHOLDER, input)
    } else if template.trim().is_empty() {
        input.to_string()
    } else {
        format!("{}\n\n{}", template.trim_end(), input)
    }
}

/// System instruction (if any) followed by the rendered user message.
pub fn build_messages(system_prompt: &str, user_template: &str, input: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    if !system_prompt.trim().is_empty() {
        messages.push(ChatMessage::system(system_prompt));
    }
    messages.push(ChatMessage::user(render(user_template, input)));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_placeholder() {
        assert_eq!(
            render("Rewrite this: {input}", "the text"),
            "Rewrite this: the text"
        );
    }

    #[test]
    fn test_render_without_placeholder_appends() {
        assert_eq!(render("Rewrite:", "the text"), "Rewrite:\n\nthe text");
        assert_eq!(render("  ", "the text"), "the text");
    }

    #[test]
    fn test_build_messages_with_system() {
        let messages = build_messages("Be concise.", "{input}", "Hello");
        assert_eq!(
            messages,
            vec![ChatMessage::system("Be concise."), ChatMessage::user("Hello")]
        );
    }

    #[test]
    fn test_build_messages_without_system() {
        let messages = build_messages("", "{input}", "Hello");
        assert_eq!(messages, vec![ChatMessage::user("Hello")]);
    }
}
