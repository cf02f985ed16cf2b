//! Bot-protocol activity envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activity type names.
pub mod activity_types {
    pub const MESSAGE: &str = "message";
    pub const CONVERSATION_UPDATE: &str = "conversationUpdate";
}

/// A participant in a conversation (user, bot or agent).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aad_object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agentic_app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agentic_user_id: Option<String>,
}

/// Conversation reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Inbound or outbound message envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub from: ChannelAccount,
    #[serde(default)]
    pub conversation: ConversationAccount,
    #[serde(default)]
    pub recipient: ChannelAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_format: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members_added: Vec<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl Activity {
    /// A bare message activity carrying `text`.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            kind: activity_types::MESSAGE.into(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn is_message(&self) -> bool {
        self.kind == activity_types::MESSAGE
    }

    pub fn is_conversation_update(&self) -> bool {
        self.kind == activity_types::CONVERSATION_UPDATE
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation.id
    }

    /// Tenant of the agent receiving the activity, empty when absent.
    pub fn recipient_tenant_id(&self) -> &str {
        self.recipient.tenant_id.as_deref().unwrap_or_default()
    }

    /// Agentic application id of the recipient, empty when absent.
    pub fn recipient_agentic_app_id(&self) -> &str {
        self.recipient.agentic_app_id.as_deref().unwrap_or_default()
    }

    /// Build a markdown message replying to this activity.
    pub fn create_reply(&self, text: impl Into<String>) -> Self {
        Self {
            kind: activity_types::MESSAGE.into(),
            id: Some(uuid::Uuid::new_v4().to_string()),
            timestamp: Some(Utc::now()),
            service_url: self.service_url.clone(),
            channel_id: self.channel_id.clone(),
            from: self.recipient.clone(),
            conversation: self.conversation.clone(),
            recipient: self.from.clone(),
            text: Some(text.into()),
            text_format: Some("markdown".into()),
            members_added: Vec::new(),
            reply_to_id: self.id.clone(),
            locale: self.locale.clone(),
        }
    }
}
