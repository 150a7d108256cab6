use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chat_core::{
    compute_channel_id, ChannelChange, ChannelChangeHandler, ChannelManager,
    ChannelManagerHistory, Conversation, FederationAccess, StaticIdentities, StoreAccessControl,
    StoreChannelManager, TopicReconciler, UpdateListener,
};
use clap::{Parser, Subcommand};
use shared::{
    domain::{LogicalMessageId, PersonId},
    protocol::{ChannelFilter, MessageContent, RoomHandle},
};
use storage::{ObjectStore, SqliteObjectStore};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use versioning::{DisplayRecord, MessageVersioning};

mod config;

use config::{load_settings, normalize_database_url, Settings};

#[derive(Parser, Debug)]
#[command(name = "peer-node", about = "Peer-to-peer chat node over a local object store")]
struct Cli {
    /// TOML settings file; `./peer.toml` is read when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    peer_id: Option<String>,
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the channel id two people share.
    ChannelId { a: String, b: String },
    /// Open (creating if needed) the conversation with `remote`.
    Open { remote: String },
    Send {
        remote: String,
        text: String,
        #[arg(long = "subject")]
        subjects: Vec<String>,
        #[arg(long = "keyword")]
        keywords: Vec<String>,
    },
    Edit {
        remote: String,
        logical_id: String,
        text: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Retract {
        remote: String,
        logical_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show the conversation, or every version of one message.
    History {
        remote: String,
        logical_id: Option<String>,
    },
    Channels {
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        p2p_only: bool,
    },
    /// React to channel changes until interrupted.
    Listen {
        /// Peers whose conversations are opened and shared on startup.
        #[arg(long = "peer")]
        peers: Vec<String>,
    },
}

struct Node {
    settings: Settings,
    channels: Arc<StoreChannelManager>,
    federation: Arc<FederationAccess>,
    versioning: Arc<MessageVersioning>,
    reconciler: Arc<TopicReconciler>,
    conversation: Conversation,
}

impl Node {
    async fn open(settings: Settings) -> Result<Self> {
        let database_url = normalize_database_url(&settings.database_url);
        let store = SqliteObjectStore::new(&database_url).await.map_err(|error| {
            error!(
                %database_url,
                %error,
                "failed to open object store; verify the path and its permissions"
            );
            error
        })?;
        let store: Arc<dyn ObjectStore> = Arc::new(store);

        let channels = Arc::new(StoreChannelManager::new(store.clone()));
        let federation = Arc::new(FederationAccess::new(
            Arc::new(StoreAccessControl::new(store.clone())),
            settings.federation_groups(),
        ));
        let versioning = Arc::new(MessageVersioning::new(
            store,
            Arc::new(ChannelManagerHistory::new(channels.clone())),
        ));
        let reconciler = Arc::new(TopicReconciler::new(
            settings.reconciler_config(),
            channels.clone(),
            federation.clone(),
            versioning.clone(),
        ));
        let conversation =
            Conversation::new(settings.local_id(), channels.clone(), versioning.clone());

        Ok(Self {
            settings,
            channels,
            federation,
            versioning,
            reconciler,
            conversation,
        })
    }

    /// Opens the conversation with `remote` and reloads its version chains.
    async fn room_with(&self, remote: &str) -> Result<RoomHandle> {
        let local = self.settings.local_id();
        let room = self
            .reconciler
            .ensure_topic(&local, &PersonId::new(remote))
            .await
            .with_context(|| format!("failed to open conversation with '{remote}'"))?;
        self.versioning.rebuild_chain(&room.channel_id).await?;
        Ok(room)
    }
}

struct LoggingHandler {
    profile: &'static str,
}

#[async_trait]
impl ChannelChangeHandler for LoggingHandler {
    async fn on_channel_changed(&self, change: ChannelChange) -> anyhow::Result<()> {
        info!(
            profile = self.profile,
            channel_id = %change.room.channel_id,
            event = ?change.event,
            messages = change.message_count,
            "peer-node: channel changed"
        );
        println!(
            "[{}] {} {}",
            self.profile,
            change.room.channel_id,
            render(&change.display)
        );
        Ok(())
    }
}

fn render(record: &DisplayRecord) -> String {
    let marker = if record.is_retracted {
        " (retracted)"
    } else if record.is_edited {
        " (edited)"
    } else {
        ""
    };
    format!(
        "{} v{} {}: {}{marker}",
        record.logical_id, record.version_number, record.author, record.content.text
    )
}

fn content(text: String, subjects: Vec<String>, keywords: Vec<String>) -> MessageContent {
    MessageContent {
        subjects,
        keywords,
        ..MessageContent::text(text)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(peer_id) = cli.peer_id {
        settings.peer_id = peer_id;
    }
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .init();

    if let Command::ChannelId { a, b } = &cli.command {
        println!("{}", compute_channel_id(&PersonId::new(a), &PersonId::new(b)));
        return Ok(());
    }

    let node = Node::open(settings).await?;
    match cli.command {
        Command::ChannelId { .. } => {}
        Command::Open { remote } => {
            let room = node.room_with(&remote).await?;
            println!("channel_id={}", room.channel_id);
        }
        Command::Send {
            remote,
            text,
            subjects,
            keywords,
        } => {
            let room = node.room_with(&remote).await?;
            let record = node
                .conversation
                .send(&room, content(text, subjects, keywords))
                .await?;
            println!("sent logical_id={}", record.logical_id);
        }
        Command::Edit {
            remote,
            logical_id,
            text,
            reason,
        } => {
            let room = node.room_with(&remote).await?;
            let record = node
                .conversation
                .edit(
                    &room,
                    &LogicalMessageId::new(logical_id),
                    MessageContent::text(text),
                    reason,
                )
                .await?;
            println!(
                "edited logical_id={} version={}",
                record.logical_id, record.version_number
            );
        }
        Command::Retract {
            remote,
            logical_id,
            reason,
        } => {
            let room = node.room_with(&remote).await?;
            let logical_id = LogicalMessageId::new(logical_id);
            match node.conversation.retract(&room, &logical_id, reason).await? {
                Some(record) => println!(
                    "retracted logical_id={} version={}",
                    record.logical_id, record.version_number
                ),
                None => println!("already retracted logical_id={logical_id}"),
            }
        }
        Command::History { remote, logical_id } => {
            let room = node.room_with(&remote).await?;
            match logical_id {
                Some(logical_id) => {
                    let logical_id = LogicalMessageId::new(logical_id);
                    for record in node.versioning.get_version_history(&logical_id).await? {
                        println!("{}", render(&DisplayRecord::from(&record)));
                    }
                }
                None => {
                    for record in node.conversation.display_messages(&room).await? {
                        println!("{}", render(&record));
                    }
                }
            }
        }
        Command::Channels { prefix, p2p_only } => {
            let filter = ChannelFilter {
                id_prefix: prefix,
                owner: None,
                p2p_only,
            };
            for record in node.channels.matching_channels(&filter).await? {
                println!("{} created_at={}", record.id, record.created_at.to_rfc3339());
            }
        }
        Command::Listen { peers } => listen(node, peers).await?,
    }

    Ok(())
}

async fn listen(node: Node, peers: Vec<String>) -> Result<()> {
    let channels_watch = node
        .federation
        .watch_new_channels(node.channels.subscribe_created());
    let (contacts, contact_events) = broadcast::channel(64);
    let contacts_watch = node.federation.watch_new_contacts(contact_events);

    let identities = Arc::new(StaticIdentities::new(
        node.settings.local_id(),
        node.settings.automated_agents(),
    ));
    let listeners = [
        (node.settings.peer_listener(), "peer"),
        (node.settings.ai_listener(), "ai"),
    ]
    .into_iter()
    .map(|(config, profile)| {
        UpdateListener::new(
            config,
            node.channels.clone(),
            node.reconciler.clone(),
            node.versioning.clone(),
            identities.clone(),
            Arc::new(LoggingHandler { profile }),
        )
    })
    .collect::<Vec<_>>();
    for listener in &listeners {
        listener.start().await;
    }

    for peer in &peers {
        let person = PersonId::new(peer.as_str());
        if contacts.send(person).is_err() {
            warn!(peer = %peer, "peer-node: contact watcher is gone");
        }
        if let Err(err) = node.room_with(peer).await {
            warn!(peer = %peer, "peer-node: {err:#}");
        }
    }

    let sync_channels = node.channels.clone();
    let sync_every = Duration::from_millis(node.settings.sync_interval_ms.max(10));
    let sync = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sync_every);
        loop {
            ticker.tick().await;
            if let Err(err) = sync_channels.sync_external_changes().await {
                warn!("peer-node: external sync failed: {err}");
            }
        }
    });

    info!(
        peer_id = %node.settings.peer_id,
        peers = peers.len(),
        "peer-node: listening, press ctrl-c to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;

    sync.abort();
    for listener in &listeners {
        listener.stop().await;
    }
    drop(contacts);
    channels_watch.abort();
    if let Err(err) = contacts_watch.await {
        warn!("peer-node: contact watcher ended abnormally: {err}");
    }
    info!("peer-node: stopped");
    Ok(())
}
