//! Conversation-level orchestration: sending prompts, owning the stream task
//! of each conversation, and the message edits the UI exposes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{ChatMessage, ChatRequest, ChatTransport};
use crate::config::Config;
use crate::display::DisplayTarget;
use crate::error::{StorageError, StreamError};
use crate::ingest::{StreamIngestor, StreamState, ThrottleConfig};
use crate::store::{
    Conversation, ConversationId, ConversationStore, Message, MessageId, MessageStatus,
    MessageStore, Role,
};

pub const DEFAULT_TITLE: &str = "New chat";
const TITLE_CHARS: usize = 20;

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub model: String,
    pub system_prompt: String,
    pub greeting: String,
    pub throttle: ThrottleConfig,
}

impl From<&Config> for ChatSettings {
    fn from(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            greeting: config.greeting.clone(),
            throttle: config.throttle(),
        }
    }
}

struct ActiveStream {
    message_id: MessageId,
    cancel: CancellationToken,
    handle: JoinHandle<Option<StreamState>>,
}

impl ActiveStream {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

pub struct ConversationController {
    messages: Arc<dyn MessageStore>,
    conversations: Arc<dyn ConversationStore>,
    transport: Arc<dyn ChatTransport>,
    display: Arc<dyn DisplayTarget>,
    settings: ChatSettings,
    current: Option<ConversationId>,
    active: HashMap<ConversationId, ActiveStream>,
}

impl ConversationController {
    pub fn new<S>(
        store: Arc<S>,
        transport: Arc<dyn ChatTransport>,
        display: Arc<dyn DisplayTarget>,
        settings: ChatSettings,
    ) -> Self
    where
        S: MessageStore + ConversationStore + 'static,
    {
        Self {
            messages: store.clone(),
            conversations: store,
            transport,
            display,
            settings,
            current: None,
            active: HashMap::new(),
        }
    }

    pub fn current_conversation(&self) -> Option<ConversationId> {
        self.current
    }

    /// True while the current conversation has a reply in flight.
    pub fn is_streaming(&self) -> bool {
        self.current
            .and_then(|id| self.active.get(&id))
            .is_some_and(ActiveStream::is_running)
    }

    pub async fn new_conversation(&mut self) -> ConversationId {
        let conversation_id = self.conversations.insert(Conversation::new(DEFAULT_TITLE)).await;
        let greeting = Message::new(conversation_id, Role::Assistant, self.settings.greeting.clone());
        self.messages.insert(greeting).await;
        self.current = Some(conversation_id);
        info!(conversation_id = %conversation_id, "Conversation created");
        conversation_id
    }

    pub async fn load_conversation(&mut self, id: ConversationId) -> Result<Vec<Message>, StorageError> {
        if self.conversations.get(id).await.is_none() {
            return Err(StorageError::ConversationNotFound(id));
        }
        self.current = Some(id);
        Ok(self.messages.list_for_conversation(id).await)
    }

    /// Messages of the current conversation, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        match self.current {
            Some(id) => self.messages.list_for_conversation(id).await,
            None => Vec::new(),
        }
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.conversations.list().await
    }

    /// Stores the prompt, creates the reply placeholder and starts streaming
    /// into it. Returns the placeholder id, or `None` for a blank prompt.
    pub async fn send_message(&mut self, content: &str) -> Result<Option<MessageId>, StreamError> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }
        let conversation_id = match self.current {
            Some(id) => id,
            None => self.new_conversation().await,
        };
        if let Some(active) = self.active.get(&conversation_id).filter(|a| a.is_running()) {
            return Err(StreamError::AlreadyStreaming(active.message_id));
        }

        let history = self.messages.list_for_conversation(conversation_id).await;
        let first_prompt = !history.iter().any(|m| m.role == Role::User);

        let prompt = Message::new(conversation_id, Role::User, content).with_status(MessageStatus::Sending);
        let prompt_id = self.messages.insert(prompt).await;
        self.touch_conversation(conversation_id, first_prompt.then_some(content)).await?;

        let placeholder = Message::new(conversation_id, Role::Assistant, "")
            .with_status(MessageStatus::Sending)
            .streaming();
        let reply_id = self.messages.insert(placeholder).await;

        let request = self.build_request(&history, content);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(stream_reply(
            StreamIngestor::new(self.messages.clone(), self.display.clone(), self.settings.throttle),
            self.transport.clone(),
            self.messages.clone(),
            request,
            prompt_id,
            reply_id,
            cancel.clone(),
        ));

        self.active.insert(
            conversation_id,
            ActiveStream {
                message_id: reply_id,
                cancel,
                handle,
            },
        );
        Ok(Some(reply_id))
    }

    fn build_request(&self, history: &[Message], prompt: &str) -> ChatRequest {
        let mut messages = vec![ChatMessage::new(Role::System, self.settings.system_prompt.clone())];
        messages.extend(
            history
                .iter()
                .filter(|m| m.role != Role::System && !m.content.is_empty())
                .map(|m| ChatMessage::new(m.role, m.content.clone())),
        );
        messages.push(ChatMessage::new(Role::User, prompt));

        ChatRequest {
            model: self.settings.model.clone(),
            messages,
            stream: true,
        }
    }

    async fn touch_conversation(&self, id: ConversationId, first_prompt: Option<&str>) -> Result<(), StorageError> {
        let mut conversation = self
            .conversations
            .get(id)
            .await
            .ok_or(StorageError::ConversationNotFound(id))?;
        if let Some(prompt) = first_prompt {
            conversation.title = title_from(prompt);
        }
        conversation.updated_at = Utc::now();
        self.conversations.update(conversation).await
    }

    /// Cancels the reply streaming into the current conversation, if any.
    pub fn cancel_stream(&self) -> bool {
        match self.current.and_then(|id| self.active.get(&id)) {
            Some(active) if active.is_running() => {
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Waits for the current conversation's stream task and returns how it
    /// ended.
    pub async fn wait_for_reply(&mut self) -> Option<StreamState> {
        let active = self.current.and_then(|id| self.active.remove(&id))?;
        match active.handle.await {
            Ok(state) => state,
            Err(e) => {
                warn!("Stream task ended abnormally: {}", e);
                None
            }
        }
    }

    pub async fn edit_message(&self, id: MessageId, content: &str) -> Result<(), StorageError> {
        let mut message = self.messages.get(id).await.ok_or(StorageError::MessageNotFound(id))?;
        message.content = content.to_string();
        message.is_edited = true;
        self.messages.update(message).await
    }

    /// Deleting a reply that is still streaming cancels its stream first.
    pub async fn delete_message(&mut self, id: MessageId) -> Result<(), StorageError> {
        for active in self.active.values().filter(|a| a.message_id == id) {
            active.cancel.cancel();
        }
        self.messages.delete(id).await
    }

    /// Drops every conversation and starts a fresh one.
    pub async fn clear_all(&mut self) -> ConversationId {
        for (_, active) in self.active.drain() {
            active.cancel.cancel();
        }
        for conversation in self.conversations.list().await {
            self.messages.delete_for_conversation(conversation.id).await;
            if let Err(e) = self.conversations.delete(conversation.id).await {
                warn!("Failed to delete conversation: {}", e);
            }
        }
        self.new_conversation().await
    }
}

async fn stream_reply(
    mut ingestor: StreamIngestor,
    transport: Arc<dyn ChatTransport>,
    messages: Arc<dyn MessageStore>,
    request: ChatRequest,
    prompt_id: MessageId,
    reply_id: MessageId,
    cancel: CancellationToken,
) -> Option<StreamState> {
    if let Err(e) = ingestor.begin(reply_id) {
        warn!("Stream not started: {}", e);
        return None;
    }

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = transport.open(request) => Some(result),
    };
    let state = match opened {
        Some(Ok(lines)) => ingestor.run(lines, cancel).await,
        Some(Err(e)) => {
            ingestor.fail(e).await;
            ingestor.state()
        }
        None => {
            ingestor.cancel().await;
            ingestor.state()
        }
    };

    if let Some(mut prompt) = messages.get(prompt_id).await {
        prompt.status = MessageStatus::Sent;
        if let Err(e) = messages.update(prompt).await {
            warn!("Prompt status not updated: {}", e);
        }
    }
    state
}

/// First characters of the opening prompt, with `...` when cut.
fn title_from(prompt: &str) -> String {
    let mut chars = prompt.chars();
    let head: String = chars.by_ref().take(TITLE_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::stream::{self, StreamExt};
    use tokio::sync::mpsc;

    use super::*;
    use crate::api::LineStream;
    use crate::display::{ChannelDisplay, DisplayEvent};
    use crate::error::TransportError;
    use crate::store::MemoryStore;

    const HE: &str = r#"data: {"choices":[{"delta":{"content":"He"}}]}"#;
    const LLO: &str = r#"data: {"choices":[{"delta":{"content":"llo"}}]}"#;
    const DONE: &str = "data: [DONE]";

    enum Script {
        Lines(Vec<&'static str>),
        /// Yields the lines, then never ends.
        Hang(Vec<&'static str>),
        Refuse(u16),
    }

    struct ScriptedTransport {
        script: Script,
        requests: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open(&self, request: ChatRequest) -> Result<LineStream, TransportError> {
            self.requests.lock().unwrap().push(request);
            let owned = |lines: &Vec<&'static str>| -> Vec<Result<String, TransportError>> {
                lines.iter().map(|l| Ok(l.to_string())).collect()
            };
            match &self.script {
                Script::Lines(lines) => Ok(stream::iter(owned(lines)).boxed()),
                Script::Hang(lines) => Ok(stream::iter(owned(lines)).chain(stream::pending()).boxed()),
                Script::Refuse(status) => Err(TransportError::Status {
                    status: *status,
                    body: "rate limited".into(),
                }),
            }
        }
    }

    struct Harness {
        controller: ConversationController,
        store: Arc<MemoryStore>,
        transport: Arc<ScriptedTransport>,
        events: mpsc::Receiver<DisplayEvent>,
    }

    fn harness(script: Script) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport {
            script,
            requests: Mutex::new(Vec::new()),
        });
        let (tx, events) = mpsc::channel(64);
        let settings = ChatSettings {
            model: "test-model".into(),
            system_prompt: "be kind".into(),
            greeting: "Hi!".into(),
            throttle: ThrottleConfig::default(),
        };
        let controller = ConversationController::new(
            store.clone(),
            transport.clone(),
            Arc::new(ChannelDisplay::new(tx)),
            settings,
        );
        Harness { controller, store, transport, events }
    }

    #[tokio::test]
    async fn reply_streams_into_the_placeholder() {
        let mut h = harness(Script::Lines(vec![HE, LLO, DONE]));
        h.controller.new_conversation().await;

        let reply_id = h.controller.send_message("Hello there").await.unwrap().unwrap();
        assert_eq!(h.controller.wait_for_reply().await, Some(StreamState::Finalized));

        let messages = h.controller.messages().await;
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hi!", "Hello there", "Hello"]);
        assert!(messages.iter().all(|m| m.status == MessageStatus::Sent));
        let reply = messages.last().unwrap();
        assert_eq!(reply.id, reply_id);
        assert!(!reply.is_streaming);

        let mut completed = None;
        while let Ok(event) = h.events.try_recv() {
            if let DisplayEvent::Completed { message_id, text } = event {
                completed = Some((message_id, text));
            }
        }
        assert_eq!(completed, Some((reply_id, "Hello".to_string())));
    }

    #[tokio::test]
    async fn request_carries_system_prompt_history_and_prompt() {
        let mut h = harness(Script::Lines(vec![DONE]));
        h.controller.new_conversation().await;
        h.controller.send_message("question").await.unwrap();
        h.controller.wait_for_reply().await;

        let requests = h.transport.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.model, "test-model");
        assert!(request.stream);
        assert_eq!(
            request.messages,
            vec![
                ChatMessage::new(Role::System, "be kind"),
                ChatMessage::new(Role::Assistant, "Hi!"),
                ChatMessage::new(Role::User, "question"),
            ]
        );
    }

    #[tokio::test]
    async fn blank_prompt_is_ignored() {
        let mut h = harness(Script::Lines(vec![DONE]));
        h.controller.new_conversation().await;
        assert_eq!(h.controller.send_message("   \n").await.unwrap(), None);
        assert_eq!(h.controller.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn second_prompt_while_streaming_is_rejected() {
        let mut h = harness(Script::Hang(vec![HE]));
        h.controller.new_conversation().await;
        let reply_id = h.controller.send_message("one").await.unwrap().unwrap();

        let err = h.controller.send_message("two").await.unwrap_err();
        assert!(matches!(err, StreamError::AlreadyStreaming(id) if id == reply_id));
        assert!(h.controller.is_streaming());

        assert!(h.controller.cancel_stream());
        assert_eq!(h.controller.wait_for_reply().await, Some(StreamState::Cancelled));
        let reply = MessageStore::get(h.store.as_ref(), reply_id).await.unwrap();
        assert_eq!(reply.status, MessageStatus::Error);
        assert!(!reply.is_streaming);
    }

    #[tokio::test]
    async fn deleting_the_streaming_reply_cancels_it() {
        let mut h = harness(Script::Hang(vec![HE]));
        h.controller.new_conversation().await;
        let reply_id = h.controller.send_message("one").await.unwrap().unwrap();

        h.controller.delete_message(reply_id).await.unwrap();

        assert_eq!(h.controller.wait_for_reply().await, Some(StreamState::Cancelled));
        assert!(MessageStore::get(h.store.as_ref(), reply_id).await.is_none());
    }

    #[tokio::test]
    async fn refused_request_fails_the_reply() {
        let mut h = harness(Script::Refuse(429));
        h.controller.new_conversation().await;
        let reply_id = h.controller.send_message("hello").await.unwrap().unwrap();

        assert_eq!(h.controller.wait_for_reply().await, Some(StreamState::Failed));

        let messages = h.controller.messages().await;
        assert_eq!(messages[1].status, MessageStatus::Sent);
        assert_eq!(messages[2].status, MessageStatus::Error);

        let failures: Vec<DisplayEvent> = std::iter::from_fn(|| h.events.try_recv().ok())
            .filter(|e| matches!(e, DisplayEvent::Failed { .. }))
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0], DisplayEvent::Failed { message_id, error }
            if *message_id == reply_id && error.contains("429")));
    }

    #[tokio::test]
    async fn first_prompt_becomes_the_title() {
        let mut h = harness(Script::Lines(vec![DONE]));
        let id = h.controller.new_conversation().await;
        h.controller.send_message("How do I stop worrying about tomorrow?").await.unwrap();
        h.controller.wait_for_reply().await;
        h.controller.send_message("second prompt").await.unwrap();
        h.controller.wait_for_reply().await;

        let conversation = ConversationStore::get(h.store.as_ref(), id).await.unwrap();
        assert_eq!(conversation.title, "How do I stop worryi...");
    }

    #[tokio::test]
    async fn sending_without_a_conversation_creates_one() {
        let mut h = harness(Script::Lines(vec![DONE]));
        h.controller.send_message("短").await.unwrap();
        h.controller.wait_for_reply().await;

        let conversations = h.controller.conversations().await;
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].title, "短");
    }

    #[tokio::test]
    async fn edit_marks_message_as_edited() {
        let mut h = harness(Script::Lines(vec![DONE]));
        h.controller.new_conversation().await;
        let greeting = h.controller.messages().await[0].id;

        h.controller.edit_message(greeting, "Hello again").await.unwrap();

        let edited = MessageStore::get(h.store.as_ref(), greeting).await.unwrap();
        assert_eq!(edited.content, "Hello again");
        assert!(edited.is_edited);
        assert!(h.controller.edit_message(MessageId(999), "x").await.is_err());
    }

    #[tokio::test]
    async fn clear_all_leaves_one_fresh_conversation() {
        let mut h = harness(Script::Lines(vec![DONE]));
        let old = h.controller.new_conversation().await;
        h.controller.send_message("remember this").await.unwrap();
        h.controller.wait_for_reply().await;
        h.controller.new_conversation().await;

        let fresh = h.controller.clear_all().await;

        assert_ne!(fresh, old);
        let conversations = h.controller.conversations().await;
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].id, fresh);
        assert!(h.store.list_for_conversation(old).await.is_empty());
        assert_eq!(h.controller.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn load_conversation_switches_current() {
        let mut h = harness(Script::Lines(vec![DONE]));
        let first = h.controller.new_conversation().await;
        h.controller.new_conversation().await;

        let messages = h.controller.load_conversation(first).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(h.controller.current_conversation(), Some(first));
        assert!(h.controller.load_conversation(ConversationId(77)).await.is_err());
    }

    #[test]
    fn title_counts_characters_not_bytes() {
        assert_eq!(title_from("短い"), "短い");
        assert_eq!(title_from(&"字".repeat(21)), format!("{}...", "字".repeat(20)));
    }
}
