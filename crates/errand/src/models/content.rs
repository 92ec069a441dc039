use super::role::Role;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<Vec<Role>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    pub data: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<Vec<Role>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
/// Content passed to or from an LLM, and returned by tool servers
pub enum Content {
    Text(TextContent),
    Image(ImageContent),
}

impl Content {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Content::Text(TextContent {
            text: text.into(),
            audience: None,
            priority: None,
        })
    }

    pub fn image<S: Into<String>, T: Into<String>>(data: S, mime_type: T) -> Self {
        Content::Image(ImageContent {
            data: data.into(),
            mime_type: mime_type.into(),
            audience: None,
            priority: None,
        })
    }

    /// Get the text content if this is a TextContent variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(&text.text),
            _ => None,
        }
    }

    /// Get the image content if this is an ImageContent variant
    pub fn as_image(&self) -> Option<(&str, &str)> {
        match self {
            Content::Image(image) => Some((&image.data, &image.mime_type)),
            _ => None,
        }
    }

    pub fn with_audience(mut self, audience: Vec<Role>) -> Self {
        match &mut self {
            Content::Text(text) => text.audience = Some(audience),
            Content::Image(image) => image.audience = Some(audience),
        }
        self
    }

    /// Set the priority, clamped to the 0.0..=1.0 range MCP annotations use
    pub fn with_priority(mut self, priority: f32) -> Self {
        let priority = priority.clamp(0.0, 1.0);
        match &mut self {
            Content::Text(text) => text.priority = Some(priority),
            Content::Image(image) => image.priority = Some(priority),
        }
        self
    }

    pub fn audience(&self) -> Option<&Vec<Role>> {
        match self {
            Content::Text(text) => text.audience.as_ref(),
            Content::Image(image) => image.audience.as_ref(),
        }
    }

    pub fn priority(&self) -> Option<f32> {
        match self {
            Content::Text(text) => text.priority,
            Content::Image(image) => image.priority,
        }
    }

    /// Whether the assistant should see this content (no audience, or one that includes it)
    pub fn is_for_assistant(&self) -> bool {
        self.audience()
            .map_or(true, |audience| audience.contains(&Role::Assistant))
    }

    /// Strip annotations before sending content to a provider
    pub fn unannotated(&self) -> Self {
        match self {
            Content::Text(text) => Content::text(text.text.clone()),
            Content::Image(image) => Content::image(image.data.clone(), image.mime_type.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_is_clamped() {
        let content = Content::text("hi").with_priority(3.5);
        assert_eq!(content.priority(), Some(1.0));
        let content = Content::text("hi").with_priority(-1.0);
        assert_eq!(content.priority(), Some(0.0));
    }

    #[test]
    fn test_audience_filtering() {
        assert!(Content::text("a").is_for_assistant());
        assert!(!Content::text("a")
            .with_audience(vec![Role::User])
            .is_for_assistant());
        assert!(Content::text("a")
            .with_audience(vec![Role::User, Role::Assistant])
            .is_for_assistant());
    }

    #[test]
    fn test_unannotated_drops_annotations() {
        let content = Content::image("aGVsbG8=", "image/png")
            .with_audience(vec![Role::Assistant])
            .with_priority(0.5);
        let plain = content.unannotated();
        assert_eq!(plain.audience(), None);
        assert_eq!(plain.priority(), None);
        assert_eq!(plain.as_image(), Some(("aGVsbG8=", "image/png")));
    }
}
