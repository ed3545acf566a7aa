//! Telegram channel integration

use crate::base::{AllowList, BaseChannel, ChannelError, ChannelHandler, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::dispatching::{Dispatcher, UpdateFilterExt};
use teloxide::prelude::*;
use teloxide::types::{BotCommand, ChatAction, ParseMode, ReplyParameters};
use teloxide::utils::command::BotCommands;
use threadline_core::config::schema::TelegramConfig;
use threadline_core::events::{BackendKind, InboundMessage, OutboundMessage};
use threadline_core::MessageId;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const CHANNEL_NAME: &str = "telegram";

/// Seconds between typing actions; Telegram shows one for about five
const TYPING_REFRESH_SECS: u64 = 4;

/// Telegram bot commands
#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "threadline commands:")]
enum Command {
    #[command(description = "Start the bot")]
    Start,
    #[command(description = "Show this help message")]
    Help,
    #[command(description = "Start a thread with the chat-completion backend")]
    Chat(String),
    #[command(description = "Start a thread with the stateful backend")]
    Stateful(String),
}

/// Telegram channel handler
pub struct TelegramHandler {
    token: String,
    api_url: Option<String>,
    proxy: Option<String>,
    base: BaseChannel,
    bot: Option<Bot>,
    running: bool,
    dispatcher_handle: Option<JoinHandle<()>>,
    /// Typing indicator tasks by chat id
    typing_tasks: Arc<Mutex<HashMap<i64, JoinHandle<()>>>>,
}

impl TelegramHandler {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            token: config.token.clone(),
            api_url: config.api_url.clone().filter(|url| !url.trim().is_empty()),
            proxy: config.proxy.clone().filter(|proxy| !proxy.trim().is_empty()),
            base: BaseChannel::new(CHANNEL_NAME, AllowList::new(config.allowed_chat_ids.clone())),
            bot: None,
            running: false,
            dispatcher_handle: None,
            typing_tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build the bot with the configured proxy and API server
    fn build_bot(&self) -> Result<Bot> {
        let mut settings = teloxide::net::default_reqwest_settings();
        if let Some(proxy) = &self.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| ChannelError::InvalidConfig(format!("telegram.proxy: {}", e)))?;
            settings = settings.proxy(proxy);
        }
        let client = settings
            .build()
            .map_err(|e| ChannelError::Error(format!("Failed to build HTTP client: {}", e)))?;

        let mut bot = Bot::with_client(&self.token, client);
        if let Some(api_url) = &self.api_url {
            let url = url::Url::parse(api_url)
                .map_err(|e| ChannelError::InvalidConfig(format!("telegram.api_url: {}", e)))?;
            bot = bot.set_api_url(url);
        }
        Ok(bot)
    }

    /// Convert markdown to Telegram HTML
    fn markdown_to_telegram_html(text: &str) -> String {
        static CODE_BLOCK: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"```[\w]*\n?([\s\S]*?)```").expect("valid regex"));
        static INLINE_CODE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"`([^`]+)`").expect("valid regex"));
        static HEADER: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+(.+)$").expect("valid regex"));
        static QUOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^>\s*(.*)$").expect("valid regex"));
        static LINK: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("valid regex"));
        static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("valid regex"));
        static BOLD_UNDERSCORE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"__(.+?)__").expect("valid regex"));
        static ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"_([^_]+)_").expect("valid regex"));
        static STRIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"~~(.+?)~~").expect("valid regex"));
        static BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[-*]\s+").expect("valid regex"));

        if text.is_empty() {
            return String::new();
        }

        // Protect code from the inline rewrites below
        let mut code_blocks: Vec<String> = Vec::new();
        let mut result = CODE_BLOCK
            .replace_all(text, |caps: &regex::Captures| {
                let idx = code_blocks.len();
                code_blocks.push(caps[1].to_string());
                format!("\x00CB{idx}\x00")
            })
            .to_string();

        let mut inline_codes: Vec<String> = Vec::new();
        result = INLINE_CODE
            .replace_all(&result, |caps: &regex::Captures| {
                let idx = inline_codes.len();
                inline_codes.push(caps[1].to_string());
                format!("\x00IC{idx}\x00")
            })
            .to_string();

        result = HEADER.replace_all(&result, "$1").to_string();
        result = QUOTE.replace_all(&result, "$1").to_string();
        result = escape_html(&result);
        result = LINK.replace_all(&result, r#"<a href="$2">$1</a>"#).to_string();
        result = BOLD.replace_all(&result, "<b>$1</b>").to_string();
        result = BOLD_UNDERSCORE.replace_all(&result, "<b>$1</b>").to_string();
        result = ITALIC.replace_all(&result, "<i>$1</i>").to_string();
        result = STRIKE.replace_all(&result, "<s>$1</s>").to_string();
        result = BULLET.replace_all(&result, "• ").to_string();

        for (i, code) in inline_codes.iter().enumerate() {
            result = result.replace(
                &format!("\x00IC{i}\x00"),
                &format!("<code>{}</code>", escape_html(code)),
            );
        }
        for (i, code) in code_blocks.iter().enumerate() {
            result = result.replace(
                &format!("\x00CB{i}\x00"),
                &format!("<pre><code>{}</code></pre>", escape_html(code)),
            );
        }

        result
    }

    /// Turn a Telegram message into an inbound event
    ///
    /// Plain messages only matter when they reply to something; anything
    /// else that is not a command yields `None`.
    fn to_inbound(
        chat_id: i64,
        message_id: i32,
        reply_to: Option<i32>,
        text: Option<String>,
        command: Option<BackendKind>,
    ) -> Option<InboundMessage> {
        let msg = InboundMessage::new(
            CHANNEL_NAME,
            chat_id.to_string(),
            MessageId::new(chat_id, i64::from(message_id)),
            text,
        );
        match (command, reply_to) {
            (Some(kind), _) => Some(msg.with_command(kind)),
            (None, Some(parent)) => {
                Some(msg.replying_to(MessageId::new(chat_id, i64::from(parent))))
            }
            (None, None) => None,
        }
    }

    async fn handle_command(base: &BaseChannel, bot: Bot, msg: Message, cmd: Command) {
        let (kind, text) = match cmd {
            Command::Start => {
                let text = "👋 Hi! Start a thread with /chat or /stateful, then keep talking by replying to my messages.";
                if let Err(e) = bot.send_message(msg.chat.id, text).await {
                    tracing::error!("Error handling /start: {}", e);
                }
                return;
            }
            Command::Help => {
                if let Err(e) = bot
                    .send_message(msg.chat.id, Command::descriptions().to_string())
                    .await
                {
                    tracing::error!("Error handling /help: {}", e);
                }
                return;
            }
            Command::Chat(text) => (BackendKind::Stateless, text),
            Command::Stateful(text) => (BackendKind::Stateful, text),
        };

        let inbound = Self::to_inbound(msg.chat.id.0, msg.id.0, None, Some(text), Some(kind));
        if let Some(inbound) = inbound {
            if let Err(e) = base.handle_message(inbound).await {
                tracing::debug!("Command not forwarded: {}", e);
            }
        }
    }

    async fn handle_plain(base: &BaseChannel, msg: Message) {
        let text = msg.text().or_else(|| msg.caption()).map(ToString::to_string);
        let reply_to = msg.reply_to_message().map(|parent| parent.id.0);

        match Self::to_inbound(msg.chat.id.0, msg.id.0, reply_to, text, None) {
            Some(inbound) => {
                if let Err(e) = base.handle_message(inbound).await {
                    tracing::debug!("Message not forwarded: {}", e);
                }
            }
            None => tracing::trace!("Ignoring message {} without reply target", msg.id.0),
        }
    }

    async fn stop_typing(&self, chat_id: i64) {
        let mut tasks = self.typing_tasks.lock().await;
        if let Some(handle) = tasks.remove(&chat_id) {
            handle.abort();
        }
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn parse_chat_id(chat_id: &str) -> Result<i64> {
    chat_id
        .parse()
        .map_err(|_| ChannelError::Error(format!("Invalid chat_id: {}", chat_id)))
}

#[async_trait]
impl ChannelHandler for TelegramHandler {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn is_running(&self) -> bool {
        self.running
    }

    async fn start(&mut self) -> Result<()> {
        if self.token.is_empty() {
            return Err(ChannelError::NotConfigured(
                "Telegram token not configured".to_string(),
            ));
        }

        if self.running {
            return Ok(());
        }

        tracing::info!("Starting Telegram bot (polling mode)...");

        let bot = self.build_bot()?;

        let commands = vec![
            BotCommand::new("chat", "Start a thread with the chat-completion backend"),
            BotCommand::new("stateful", "Start a thread with the stateful backend"),
            BotCommand::new("help", "Show available commands"),
        ];
        if let Err(e) = bot.set_my_commands(commands).await {
            tracing::warn!("Failed to set bot commands: {}", e);
        }

        match bot.get_me().await {
            Ok(me) => {
                let username = me.username.clone().unwrap_or_else(|| "unknown".to_string());
                tracing::info!("Telegram bot @{} connected", username);
            }
            Err(e) => {
                return Err(ChannelError::ApiError(format!(
                    "Failed to get bot info: {}",
                    e
                )));
            }
        }

        self.bot = Some(bot.clone());
        self.running = true;

        let base = Arc::new(self.base.clone());
        let base_cmd = Arc::clone(&base);

        let handler = dptree::entry()
            .branch(
                Update::filter_message()
                    .filter_command::<Command>()
                    .endpoint(move |bot: Bot, msg: Message, cmd: Command| {
                        let base = Arc::clone(&base_cmd);
                        async move {
                            Self::handle_command(&base, bot, msg, cmd).await;
                            Ok::<(), teloxide::RequestError>(())
                        }
                    }),
            )
            .branch(Update::filter_message().endpoint(move |msg: Message| {
                let base = Arc::clone(&base);
                async move {
                    Self::handle_plain(&base, msg).await;
                    Ok::<(), teloxide::RequestError>(())
                }
            }));

        let dispatcher_handle = tokio::spawn(async move {
            Dispatcher::builder(bot, handler).build().dispatch().await;
        });
        self.dispatcher_handle = Some(dispatcher_handle);

        tracing::info!("Telegram bot started successfully");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        tracing::info!("Stopping Telegram bot...");

        let mut tasks = self.typing_tasks.lock().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        drop(tasks);

        if let Some(handle) = self.dispatcher_handle.take() {
            handle.abort();
        }

        self.bot = None;
        self.running = false;

        tracing::info!("Telegram bot stopped");
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<MessageId> {
        let bot = self
            .bot
            .as_ref()
            .ok_or_else(|| ChannelError::NotRunning("Telegram bot not running".to_string()))?;

        let chat_id = parse_chat_id(&message.chat_id)?;
        self.stop_typing(chat_id).await;

        let reply_parameters = message
            .reply_to
            .map(|id| {
                i32::try_from(id.message)
                    .map(|id| ReplyParameters::new(teloxide::types::MessageId(id)))
                    .map_err(|_| ChannelError::Error(format!("Message id out of range: {}", id)))
            })
            .transpose()?;

        let html_content = Self::markdown_to_telegram_html(&message.content);
        let mut rich = bot
            .send_message(ChatId(chat_id), html_content)
            .parse_mode(ParseMode::Html);
        if let Some(params) = reply_parameters.clone() {
            rich = rich.reply_parameters(params);
        }

        let sent = match rich.await {
            Ok(sent) => sent,
            Err(e) => {
                tracing::warn!("HTML parse failed, falling back to plain text: {}", e);
                let mut plain = bot.send_message(ChatId(chat_id), &message.content);
                if let Some(params) = reply_parameters {
                    plain = plain.reply_parameters(params);
                }
                plain.await.map_err(|e2| {
                    ChannelError::SendFailed(format!("Failed to send message: {}", e2))
                })?
            }
        };

        Ok(MessageId::new(chat_id, i64::from(sent.id.0)))
    }

    async fn start_typing(&self, chat_id: &str) {
        let (Some(bot), Ok(chat_id)) = (self.bot.clone(), parse_chat_id(chat_id)) else {
            return;
        };
        self.stop_typing(chat_id).await;

        let handle = tokio::spawn(async move {
            loop {
                let _ = bot.send_chat_action(ChatId(chat_id), ChatAction::Typing).await;
                tokio::time::sleep(tokio::time::Duration::from_secs(TYPING_REFRESH_SECS)).await;
            }
        });

        self.typing_tasks.lock().await.insert(chat_id, handle);
    }

    fn set_inbound_sender(&mut self, tx: mpsc::Sender<InboundMessage>) {
        self.base.set_inbound_sender(tx);
    }

    fn is_allowed(&self, chat_id: &str) -> bool {
        self.base.allow_list.is_allowed_str(chat_id)
    }
}
