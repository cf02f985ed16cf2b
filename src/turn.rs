//! Per-turn context handed to activity handlers.

use std::sync::Mutex;

use crate::activity::Activity;

/// The inbound activity plus the replies produced while handling it.
///
/// Replies are returned in the HTTP response body rather than posted back to
/// the channel service.
#[derive(Debug)]
pub struct TurnContext {
    activity: Activity,
    replies: Mutex<Vec<Activity>>,
}

impl TurnContext {
    pub fn new(activity: Activity) -> Self {
        Self {
            activity,
            replies: Mutex::new(Vec::new()),
        }
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    /// Queue a text reply to the inbound activity.
    pub async fn send_activity(&self, text: impl Into<String>) {
        let reply = self.activity.create_reply(text);
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reply);
    }

    /// Drain queued replies.
    pub fn take_replies(&self) -> Vec<Activity> {
        std::mem::take(&mut *self.replies.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Text of every queued reply, in order.
    pub fn reply_texts(&self) -> Vec<String> {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|a| a.text.clone())
            .collect()
    }
}
