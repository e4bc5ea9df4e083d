use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatKind;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use cirnobot::chatbot::{
    Collaborators, InboundEvent, IngestOutcome, LlmClient, Pipeline, SqliteSettings, TelegramSender,
    is_direct_mention,
};
use cirnobot::config::Config;

struct BotState {
    config: Config,
    pipeline: Pipeline,
    bot_user_id: i64,
    bot_username: String,
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "cirnobot.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::never(&log_dir, "cirnobot.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting cirnobot...");
    info!("Loaded config from {config_path}");

    let bot = Bot::new(&config.telegram_bot_token);
    let (bot_user_id, bot_username) = match bot.get_me().await {
        Ok(me) => {
            info!("Bot user ID: {}, username: @{}", me.id, me.username());
            (me.id.0 as i64, me.username().to_string())
        }
        Err(e) => {
            warn!("Failed to get bot info: {e}");
            std::process::exit(1);
        }
    };

    let settings = match SqliteSettings::open(&config.data_dir.join("settings.db")) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            warn!("Failed to open settings database: {e}");
            std::process::exit(1);
        }
    };
    let llm = match LlmClient::new(config.llm.clone(), bot_username.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!("Failed to build LLM client: {e}");
            std::process::exit(1);
        }
    };

    let collab = Collaborators {
        generator: llm.clone(),
        necessity: llm,
        sender: Arc::new(TelegramSender::new(bot.clone())),
        settings,
    };
    let pipeline = Pipeline::new(config.pipeline(bot_user_id, &bot_username), collab);
    pipeline.start();

    let state = Arc::new(BotState {
        config,
        pipeline,
        bot_user_id,
        bot_username,
    });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_new_message))
        .branch(Update::filter_edited_message().endpoint(handle_edited_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state.clone()])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    state.pipeline.shutdown();
}

/// Groups and private chats are both rooms; a private chat is a room of one.
fn is_listened_room(state: &BotState, msg: &Message) -> bool {
    matches!(msg.chat.kind, ChatKind::Public(_) | ChatKind::Private(_))
        && state.config.is_allowed_room(msg.chat.id.0)
}

async fn handle_new_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    if !is_listened_room(&state, &msg) {
        return Ok(());
    }
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let is_reply_to_bot = msg
        .reply_to_message()
        .and_then(|reply| reply.from.as_ref())
        .is_some_and(|author| author.id.0 as i64 == state.bot_user_id);

    let event = InboundEvent {
        room_id: msg.chat.id.0,
        user_id: user.id.0 as i64,
        display_name: user.username.clone().unwrap_or_else(|| user.first_name.clone()),
        message_id: msg.id.0 as i64,
        text: text.to_string(),
        is_direct_mention: is_direct_mention(text, &state.bot_username, msg.chat.is_private()),
        is_reply_to_bot,
    };

    match state.pipeline.ingest(event) {
        IngestOutcome::Command => handle_command(&bot, &msg, text, &state).await,
        outcome => {
            debug!("Message {} in {} → {:?}", msg.id, msg.chat.id, outcome);
            Ok(())
        }
    }
}

/// Adapter-side commands: `<prefix>quiet <minutes>` and `<prefix>stats`.
async fn handle_command(
    bot: &Bot,
    msg: &Message,
    text: &str,
    state: &BotState,
) -> ResponseResult<()> {
    let body = text
        .trim_start()
        .trim_start_matches(state.config.command_prefix.as_str())
        .trim();
    let mut parts = body.split_whitespace();
    let reply = match parts.next() {
        Some("quiet") => {
            let minutes = parts.next().and_then(|m| m.parse::<u64>().ok()).unwrap_or(10);
            state
                .pipeline
                .set_quiet(msg.chat.id.0, Duration::from_secs(minutes * 60));
            format!("ok, staying quiet for {minutes} min")
        }
        Some("stats") => {
            let stats = state.pipeline.rate_limiter().stats();
            format!(
                "global tokens {:.0}/{:.0}, rooms {}, users {}, open windows {}",
                stats.global_tokens,
                stats.global_capacity,
                stats.active_rooms,
                stats.active_users,
                state.pipeline.aggregator().open_windows()
            )
        }
        _ => return Ok(()),
    };
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

async fn handle_edited_message(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    if !is_listened_room(&state, &msg) {
        return Ok(());
    }
    let Some(text) = msg.text() else {
        return Ok(());
    };

    if state.pipeline.handle_edit(msg.chat.id.0, msg.id.0 as i64, text) {
        info!("✏️ Edit applied to message {} in {}", msg.id, msg.chat.id);
    }
    Ok(())
}
