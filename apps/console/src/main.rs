use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    ClientConfig, ClientEvent, MissingMediaSource, MissingPeerConnector, RealtimeClient,
    TimelineItem,
};
use shared::{ConversationId, UserId};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Parser, Debug)]
struct Args {
    /// Base url for the REST surface and the push channel.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    user: Option<String>,
    /// Counterpart to open a conversation with.
    #[arg(long)]
    peer: String,
    /// Known conversation id; omitted for a not-yet-started conversation.
    #[arg(long)]
    conversation: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(token) = args.token {
        settings.auth_token = token;
    }
    if let Some(user) = args.user {
        settings.user_id = user;
    }

    let config = ClientConfig::new(
        settings.server_url,
        settings.auth_token,
        settings.user_id.as_str(),
    );
    let client = RealtimeClient::connect(
        config,
        Arc::new(MissingMediaSource),
        Arc::new(MissingPeerConnector),
    )
    .await?;

    let conversation = client
        .open_conversation(
            UserId::new(args.peer.as_str()),
            args.conversation.map(ConversationId::new),
        )
        .await;
    conversation.load_initial().await?;
    print_timeline(&conversation.timeline().await);

    let mut events = client.subscribe_events();
    info!("console: watching for updates; ctrl-c to quit");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::ConversationChanged { .. }) => {
                    print_timeline(&conversation.timeline().await);
                }
                Ok(ClientEvent::ChannelState { connected }) => {
                    info!("console: channel {}", if connected { "up" } else { "down" });
                }
                Ok(ClientEvent::IncomingCall(incoming)) => {
                    println!("* incoming {:?} call from {}", incoming.call_type, incoming.caller);
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    client.close().await;
    Ok(())
}

fn print_timeline(items: &[TimelineItem]) {
    println!("----------------------------------------");
    for item in items {
        match item {
            TimelineItem::DaySeparator { label, .. } => println!("--- {label} ---"),
            TimelineItem::Single(message) => {
                let body = message
                    .text
                    .as_deref()
                    .or(message.attachment.as_ref().map(|a| a.file_name.as_str()))
                    .unwrap_or("");
                println!("{}: {body}", message.sender);
            }
            TimelineItem::ImageGroup { sender, messages } => {
                println!("{sender}: [{} images]", messages.len());
            }
        }
    }
}
