mod chat;
mod error;
mod mail_reader;
mod settings;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::sync::Arc;
use log::{error, info, LevelFilter};

use crate::chat::mattermost::MattermostClient;
use crate::chat::ChatPublisher;
use crate::mail_reader::imap::ImapConnector;
use crate::mail_reader::message::{MessageTemplate, MimeTransformer};
use crate::mail_reader::supervisor::{ConnectionSupervisor, Credentials};
use crate::mail_reader::watcher::MailboxWatcher;
use crate::settings::Profile;

fn setup_logger(level: LevelFilter) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(
            fern::Dispatch::new()
                .filter(|metadata| metadata.level() > log::Level::Warn)
                .chain(std::io::stdout()),
        )
        .chain(
            fern::Dispatch::new()
                .level(LevelFilter::Warn)
                .chain(std::io::stderr()),
        )
        .apply()?;
    Ok(())
}

// Bridge one mailbox to one channel until the process is stopped
async fn run_profile(profile: Profile) {
    let name: Arc<str> = Arc::from(profile.name.as_str());

    let publisher = ChatPublisher::new(MattermostClient::new(profile.mattermost.clone()), name.clone());
    let transformer = MimeTransformer::new(
        profile.mattermost.channel.clone(),
        MessageTemplate::new(profile.mail_template.clone()),
    );
    let mut watcher = MailboxWatcher::new(
        profile.imap.mailbox.clone(),
        profile.keepalive(),
        transformer,
        publisher,
        name.clone(),
    );
    let mut supervisor = ConnectionSupervisor::new(
        ImapConnector::new(&profile.imap),
        Credentials {
            user: profile.imap.username.clone(),
            secret: profile.imap.password.clone(),
        },
        profile.retry_policy(),
        name.clone(),
    );

    tokio::select! {
        _ = supervisor.run(&mut watcher) => {}
        _ = tokio::signal::ctrl_c() => info!("{}\tShutting down", name),
    }
    supervisor.shutdown().await;
    watcher.close().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("mailbridge")
        .about("Posts new mail from an IMAP inbox to a Mattermost channel")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("config.yaml"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    setup_logger(level).context("Cannot set up logging")?;

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    let config = settings::load_settings(&config_path)?;

    let handles: Vec<_> = config
        .profiles
        .into_iter()
        .map(|profile| tokio::spawn(run_profile(profile)))
        .collect();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Bridge task failed: {}", e);
        }
    }
    Ok(())
}
