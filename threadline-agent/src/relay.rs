//! Conversation relay: the processing loop between a chat and its backends

use std::sync::Arc;
use threadline_channels::ChannelHandlerPtr;
use threadline_core::events::{BackendKind, InboundMessage, OutboundMessage};
use threadline_core::retry::{with_retry, RetryPolicy};
use threadline_core::threading::StatefulAdvance;
use threadline_core::utils::truncate;
use threadline_core::{BackendContext, Error, MessageId, Result, Route, SharedThreads};
use threadline_providers::{ConversationHandle, LLMProvider, StatefulProvider, StatefulRequest};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::prompt::PromptBuilder;

/// Sent in place of an answer when every backend attempt failed
pub const BACKEND_FAILURE_NOTICE: &str =
    "Sorry, I could not get an answer from the backend. Please try again later.";

/// Sent when a backend returns no text at all
const EMPTY_REPLY: &str = "(empty reply)";

/// Thread state as the relay shares it with the lifecycle manager
pub type RelayThreads = SharedThreads<ConversationHandle>;

/// Stateless backend together with its call settings
#[derive(Clone)]
pub struct StatelessBackend {
    pub provider: Arc<dyn LLMProvider>,
    pub model: Option<String>,
    pub temperature: f64,
    pub prompt: PromptBuilder,
}

/// Turns inbound chat messages into backend turns and threaded replies
///
/// Every message and every reply is recorded in the shared thread state,
/// so replying to any bot message continues that conversation.
pub struct ConversationRelay {
    channel: ChannelHandlerPtr,
    threads: RelayThreads,
    stateless: Option<StatelessBackend>,
    stateful: Option<Arc<dyn StatefulProvider>>,
    retry: RetryPolicy,
}

impl ConversationRelay {
    pub fn new(channel: ChannelHandlerPtr, threads: RelayThreads, retry: RetryPolicy) -> Self {
        Self {
            channel,
            threads,
            stateless: None,
            stateful: None,
            retry,
        }
    }

    pub fn with_stateless(mut self, backend: StatelessBackend) -> Self {
        self.stateless = Some(backend);
        self
    }

    pub fn with_stateful(mut self, provider: Arc<dyn StatefulProvider>) -> Self {
        self.stateful = Some(provider);
        self
    }

    pub fn threads(&self) -> &RelayThreads {
        &self.threads
    }

    /// Process messages until the inbound channel closes
    ///
    /// Each message is handled on its own task so a slow backend does not
    /// hold up other chats.
    pub async fn run(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<InboundMessage>) {
        info!("Conversation relay started");

        while let Some(msg) = inbound_rx.recv().await {
            debug!(
                "Received message {} from {}:{}",
                msg.message_id, msg.channel, msg.chat_id
            );
            let relay = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = relay.handle_inbound(msg).await {
                    error!("Error processing message: {}", e);
                }
            });
        }

        info!("Inbound channel closed, conversation relay stopped");
    }

    /// Handle one inbound message
    ///
    /// Commands start a thread on the requested backend. Plain messages
    /// continue a thread only when they reply to a stored message; the
    /// stored message decides which backend answers.
    pub async fn handle_inbound(&self, msg: InboundMessage) -> Result<()> {
        let kind = match (msg.command, msg.reply_to) {
            (Some(kind), _) => Some((kind, None)),
            (None, Some(parent)) => match self.threads.lock().route_for_reply(parent) {
                Some(Route::Stateless) => Some((BackendKind::Stateless, Some(parent))),
                Some(Route::Stateful { .. }) => Some((BackendKind::Stateful, Some(parent))),
                None => {
                    debug!("Message {} replies to unknown {}, ignoring", msg.message_id, parent);
                    None
                }
            },
            (None, None) => None,
        };
        let Some((kind, reply_to)) = kind else {
            return Ok(());
        };

        if msg.text().trim().is_empty() {
            debug!("Message {} has no text, ignoring", msg.message_id);
            return Ok(());
        }

        match kind {
            BackendKind::Stateless => match self.stateless.clone() {
                Some(backend) => self.stateless_turn(&backend, msg, reply_to).await,
                None => {
                    warn!("Stateless backend is disabled, ignoring message {}", msg.message_id);
                    Ok(())
                }
            },
            BackendKind::Stateful => match self.stateful.clone() {
                Some(provider) => self.stateful_turn(provider, msg, reply_to).await,
                None => {
                    warn!("Stateful backend is disabled, ignoring message {}", msg.message_id);
                    Ok(())
                }
            },
        }
    }

    async fn stateless_turn(
        &self,
        backend: &StatelessBackend,
        msg: InboundMessage,
        reply_to: Option<MessageId>,
    ) -> Result<()> {
        let transcript = {
            let mut threads = self.threads.lock();
            threads.record_message(
                msg.message_id,
                reply_to,
                msg.content.clone(),
                BackendContext::None,
            )?;
            threads.transcript(msg.message_id)
        };
        let messages = backend.prompt.build_messages(&transcript);
        debug!(
            "Stateless turn for {} with {} transcript entries",
            msg.message_id,
            transcript.len()
        );

        self.start_typing(&msg.chat_id).await;
        let result = with_retry(self.retry, "stateless backend", || {
            backend
                .provider
                .chat(messages.clone(), backend.model.clone(), backend.temperature)
        })
        .await;

        match result {
            Ok(response) => {
                self.deliver(&msg, response.text(), BackendContext::None)
                    .await?;
                Ok(())
            }
            Err(e) => self.fail_turn(&msg, BackendContext::None, e.to_string()).await,
        }
    }

    async fn stateful_turn(
        &self,
        provider: Arc<dyn StatefulProvider>,
        msg: InboundMessage,
        reply_to: Option<MessageId>,
    ) -> Result<()> {
        let StatefulAdvance {
            advance,
            parent_context,
        } = {
            let mut threads = self.threads.lock();
            threads.record_stateful_message(
                msg.message_id,
                reply_to,
                msg.content.clone(),
                BackendContext::None,
                || provider.open_conversation(),
            )?
        };
        let conversation = advance
            .backend_handle
            .unwrap_or_else(|| provider.open_conversation());

        let mut request = StatefulRequest::new(msg.text());
        if let BackendContext::StatefulRef {
            parent_backend_message_id,
            backend_conversation_id,
        } = &parent_context
        {
            request = request.continuing(
                parent_backend_message_id.clone(),
                backend_conversation_id.clone(),
            );
        }
        debug!(
            "Stateful turn for {} in session {} (parent: {:?})",
            msg.message_id, advance.start_id, request.parent_message_id
        );

        self.start_typing(&msg.chat_id).await;
        let result = with_retry(self.retry, "stateful backend", || {
            conversation.send(request.clone())
        })
        .await;

        match result {
            Ok(reply) => {
                let context = BackendContext::stateful(reply.message_id, reply.conversation_id);
                self.deliver(&msg, &reply.text, context).await?;
                Ok(())
            }
            // Keep the parent's ids on the notice so replying to it retries
            // from the same point of the conversation
            Err(e) => self.fail_turn(&msg, parent_context, e.to_string()).await,
        }
    }

    /// Send a reply to `msg` and thread it onto the same conversation
    async fn deliver(
        &self,
        msg: &InboundMessage,
        content: &str,
        context: BackendContext,
    ) -> Result<MessageId> {
        let content = if content.trim().is_empty() {
            EMPTY_REPLY
        } else {
            content
        };

        let outbound = OutboundMessage::new(msg.channel.clone(), msg.chat_id.clone(), content)
            .reply_to(msg.message_id);
        let reply_id = self
            .channel
            .read()
            .await
            .send(outbound)
            .await
            .map_err(|e| Error::Channel(e.to_string()))?;

        self.threads.lock().record_message(
            reply_id,
            Some(msg.message_id),
            Some(content.to_string()),
            context,
        )?;

        info!(
            "Replied in chat {} ({} -> {}): {}",
            msg.chat_id,
            msg.message_id,
            reply_id,
            truncate(content, 120)
        );
        Ok(reply_id)
    }

    /// Close out a turn whose backend never answered
    async fn fail_turn(
        &self,
        msg: &InboundMessage,
        context: BackendContext,
        reason: String,
    ) -> Result<()> {
        if let Err(e) = self.deliver(msg, BACKEND_FAILURE_NOTICE, context).await {
            warn!("Failed to deliver failure notice for {}: {}", msg.message_id, e);
        }
        Err(Error::Provider(reason))
    }

    async fn start_typing(&self, chat_id: &str) {
        self.channel.read().await.start_typing(chat_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
    use threadline_channels::{ChannelError, ChannelHandler};
    use threadline_core::ThreadState;
    use threadline_providers::{
        LLMResponse, Message, ProviderError, ProviderResult, StatefulConversation, StatefulReply,
    };
    use tokio::sync::RwLock;

    /// Channel that records deliveries and numbers them from 1000
    #[derive(Default)]
    struct FakeChannel {
        sent: Arc<Mutex<Vec<OutboundMessage>>>,
        next_id: AtomicI64,
    }

    #[async_trait]
    impl ChannelHandler for FakeChannel {
        fn name(&self) -> &str {
            "fake"
        }

        fn is_running(&self) -> bool {
            true
        }

        async fn start(&mut self) -> threadline_channels::Result<()> {
            Ok(())
        }

        async fn stop(&mut self) -> threadline_channels::Result<()> {
            Ok(())
        }

        async fn send(&self, message: OutboundMessage) -> threadline_channels::Result<MessageId> {
            if message.content.is_empty() {
                return Err(ChannelError::SendFailed("empty".into()));
            }
            let chat = message.chat_id.parse().unwrap_or_default();
            self.sent.lock().push(message);
            Ok(MessageId::new(
                chat,
                1000 + self.next_id.fetch_add(1, Ordering::SeqCst),
            ))
        }

        fn set_inbound_sender(&mut self, _tx: mpsc::Sender<InboundMessage>) {}

        fn is_allowed(&self, _chat_id: &str) -> bool {
            true
        }
    }

    /// Chat provider that fails `failures` times, then echoes the turn count
    struct FakeLLM {
        calls: AtomicU32,
        failures: u32,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl FakeLLM {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LLMProvider for FakeLLM {
        async fn chat(
            &self,
            messages: Vec<Message>,
            _model: Option<String>,
            _temperature: f64,
        ) -> ProviderResult<LLMResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(ProviderError::ApiError("HTTP 500".into()));
            }
            let turn = messages.iter().filter(|m| m.role == "user").count();
            self.seen.lock().push(messages);
            Ok(LLMResponse {
                content: Some(format!("answer {}", turn)),
                finish_reason: "stop".into(),
                usage: Default::default(),
            })
        }

        fn get_default_model(&self) -> String {
            "fake".into()
        }
    }

    #[derive(Default)]
    struct FakeStateful {
        opened: AtomicU32,
        requests: Arc<Mutex<Vec<StatefulRequest>>>,
    }

    struct FakeConversation {
        requests: Arc<Mutex<Vec<StatefulRequest>>>,
    }

    #[async_trait]
    impl StatefulConversation for FakeConversation {
        async fn send(&self, request: StatefulRequest) -> ProviderResult<StatefulReply> {
            let mut requests = self.requests.lock();
            requests.push(request);
            Ok(StatefulReply {
                text: "stateful answer".into(),
                message_id: format!("m{}", requests.len()),
                conversation_id: "c1".into(),
            })
        }
    }

    impl StatefulProvider for FakeStateful {
        fn open_conversation(&self) -> ConversationHandle {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Arc::new(FakeConversation {
                requests: Arc::clone(&self.requests),
            })
        }
    }

    fn relay_with(
        llm: Option<Arc<FakeLLM>>,
        stateful: Option<Arc<FakeStateful>>,
    ) -> (ConversationRelay, Arc<Mutex<Vec<OutboundMessage>>>) {
        let channel = FakeChannel::default();
        let sent = Arc::clone(&channel.sent);
        let channel: ChannelHandlerPtr = Arc::new(RwLock::new(channel));

        let mut relay =
            ConversationRelay::new(channel, ThreadState::shared(), RetryPolicy::immediate(3));
        if let Some(llm) = llm {
            relay = relay.with_stateless(StatelessBackend {
                provider: llm,
                model: None,
                temperature: 0.9,
                prompt: PromptBuilder::default(),
            });
        }
        if let Some(stateful) = stateful {
            relay = relay.with_stateful(stateful);
        }
        (relay, sent)
    }

    fn mid(n: i64) -> MessageId {
        MessageId::new(42, n)
    }

    fn command_in(chat: i64, id: i64, text: &str, kind: BackendKind) -> InboundMessage {
        InboundMessage::new(
            "fake",
            chat.to_string(),
            MessageId::new(chat, id),
            Some(text.to_string()),
        )
        .with_command(kind)
    }

    fn reply_in(chat: i64, id: i64, parent: i64, text: &str) -> InboundMessage {
        InboundMessage::new(
            "fake",
            chat.to_string(),
            MessageId::new(chat, id),
            Some(text.to_string()),
        )
        .replying_to(MessageId::new(chat, parent))
    }

    fn command(id: i64, text: &str, kind: BackendKind) -> InboundMessage {
        command_in(42, id, text, kind)
    }

    fn reply(id: i64, parent: i64, text: &str) -> InboundMessage {
        reply_in(42, id, parent, text)
    }

    #[tokio::test]
    async fn test_stateless_turn_extends_chain() {
        let llm = FakeLLM::new(0);
        let (relay, sent) = relay_with(Some(Arc::clone(&llm)), None);

        relay
            .handle_inbound(command(1, "hi", BackendKind::Stateless))
            .await
            .unwrap();
        relay.handle_inbound(reply(2, 1000, "more")).await.unwrap();

        let seen = llm.seen.lock();
        assert_eq!(
            seen[1],
            vec![
                Message::user("hi"),
                Message::assistant("answer 1"),
                Message::user("more"),
            ]
        );

        let sent = sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].reply_to, Some(mid(1)));
        assert_eq!(sent[1].reply_to, Some(mid(2)));
        assert_eq!(sent[1].content, "answer 2");

        let threads = relay.threads().lock();
        assert_eq!(
            threads.sessions().find_by_end(mid(1001)),
            Ok(mid(1))
        );
        assert_eq!(threads.transcript(mid(1001)).len(), 4);
    }

    #[tokio::test]
    async fn test_stateful_reply_routes_parent_ids() {
        let stateful = Arc::new(FakeStateful::default());
        let (relay, sent) = relay_with(None, Some(Arc::clone(&stateful)));

        relay
            .handle_inbound(command(1, "hi", BackendKind::Stateful))
            .await
            .unwrap();
        relay.handle_inbound(reply(2, 1000, "again")).await.unwrap();

        let requests = stateful.requests.lock();
        assert_eq!(requests[0], StatefulRequest::new("hi"));
        assert_eq!(
            requests[1],
            StatefulRequest::new("again").continuing("m1".into(), "c1".into())
        );
        assert_eq!(stateful.opened.load(Ordering::SeqCst), 1);
        assert_eq!(sent.lock().len(), 2);

        let threads = relay.threads().lock();
        assert_eq!(
            threads.route_for_reply(mid(1001)),
            Some(Route::Stateful {
                parent_message_id: "m2".into(),
                conversation_id: "c1".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let llm = FakeLLM::new(2);
        let (relay, sent) = relay_with(Some(Arc::clone(&llm)), None);

        relay
            .handle_inbound(command(1, "hi", BackendKind::Stateless))
            .await
            .unwrap();

        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sent.lock()[0].content, "answer 1");
    }

    #[tokio::test]
    async fn test_retry_exhaustion_still_sends_notice() {
        let llm = FakeLLM::new(u32::MAX);
        let (relay, sent) = relay_with(Some(Arc::clone(&llm)), None);

        let err = relay
            .handle_inbound(command(1, "hi", BackendKind::Stateless))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provider(ref reason) if reason.contains("3 attempt")));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, BACKEND_FAILURE_NOTICE);
        assert_eq!(sent[0].reply_to, Some(mid(1)));

        let threads = relay.threads().lock();
        assert_eq!(
            threads.sessions().find_by_end(mid(1000)),
            Ok(mid(1))
        );
    }

    #[tokio::test]
    async fn test_chats_reusing_ids_stay_separate() {
        let llm = FakeLLM::new(0);
        let (relay, sent) = relay_with(Some(Arc::clone(&llm)), None);

        relay
            .handle_inbound(command_in(42, 1, "secret of chat 42", BackendKind::Stateless))
            .await
            .unwrap();
        relay
            .handle_inbound(command_in(43, 1, "hello from 43", BackendKind::Stateless))
            .await
            .unwrap();
        // Chat 43 has no message 1000 of its own; chat 42's reply must not match
        relay
            .handle_inbound(reply_in(43, 7, 1000, "what did I say?"))
            .await
            .unwrap();
        relay
            .handle_inbound(reply_in(43, 8, 1001, "more"))
            .await
            .unwrap();

        let seen = llm.seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen[2],
            vec![
                Message::user("hello from 43"),
                Message::assistant("answer 1"),
                Message::user("more"),
            ]
        );
        assert!(seen[1..]
            .iter()
            .flatten()
            .all(|m| !m.content.contains("secret")));

        let sent = sent.lock();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].chat_id, "43");
        assert_eq!(sent[2].reply_to, Some(MessageId::new(43, 8)));

        let threads = relay.threads().lock();
        assert_eq!(
            threads.sessions().find_by_end(MessageId::new(42, 1000)),
            Ok(MessageId::new(42, 1))
        );
        assert_eq!(
            threads.sessions().find_by_end(MessageId::new(43, 1002)),
            Ok(MessageId::new(43, 1))
        );
    }

    #[tokio::test]
    async fn test_unknown_reply_target_is_ignored() {
        let llm = FakeLLM::new(0);
        let (relay, sent) = relay_with(Some(Arc::clone(&llm)), None);

        relay.handle_inbound(reply(5, 999, "hello?")).await.unwrap();
        relay
            .handle_inbound(InboundMessage::new("fake", "42", mid(6), Some("hey".into())))
            .await
            .unwrap();

        assert!(sent.lock().is_empty());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert!(relay.threads().lock().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_backend_is_ignored() {
        let (relay, sent) = relay_with(Some(FakeLLM::new(0)), None);

        relay
            .handle_inbound(command(1, "hi", BackendKind::Stateful))
            .await
            .unwrap();

        assert!(sent.lock().is_empty());
        assert!(relay.threads().lock().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_message_is_an_error() {
        let (relay, _sent) = relay_with(Some(FakeLLM::new(0)), None);

        relay
            .handle_inbound(command(1, "hi", BackendKind::Stateless))
            .await
            .unwrap();
        let err = relay
            .handle_inbound(command(1, "hi", BackendKind::Stateless))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Thread(_)));
    }

    #[tokio::test]
    async fn test_run_processes_until_closed() {
        let llm = FakeLLM::new(0);
        let (relay, sent) = relay_with(Some(Arc::clone(&llm)), None);
        let relay = Arc::new(relay);

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(Arc::clone(&relay).run(rx));
        tx.send(command(1, "hi", BackendKind::Stateless)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        for _ in 0..50 {
            if !sent.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(sent.lock().len(), 1);
    }
}
