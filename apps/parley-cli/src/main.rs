mod config;
mod logging;
mod view;

use std::{error::Error, process::ExitCode, sync::Arc};

use chat_core::{
    Contact, ContactDirectory, HistoryStore, InMemoryContactDirectory, InMemoryHistoryStore,
    InMemoryLiveChannel, LiveChannel, LiveEvent, SessionCommand, SessionEvent, SessionSnapshot,
};
use chat_remote::{HttpHistoryStore, WsConfig, WsLiveChannel};
use chat_session::{EventStream, SessionContext, SessionHandle, spawn_session};
use config::ParleyConfig;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use view::ConsoleState;

const HELP: &str = "\
commands:
  /login <user>   sign in as <user>
  /contacts       list users you can open a conversation with
  /open <peer>    open the conversation with <peer>
  /retry          reload history after a failed load
  /close          close the active conversation
  /typing         report a composer keystroke
  /peer <text>    (offline only) inject a message from the peer
  /who            print the session state
  /quit           end the session
anything else is sent to the active peer";

/// Parsed stdin line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Login(String),
    Contacts,
    Open(String),
    Retry,
    Close,
    Typing,
    Peer(String),
    Who,
    Help,
    Quit,
    Send(String),
    Empty,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(line.to_owned());
    };
    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(name, rest)| (name, rest.trim()))
        .unwrap_or((command, ""));
    match (name, rest.is_empty()) {
        ("login", false) => Input::Login(rest.to_owned()),
        ("open", false) => Input::Open(rest.to_owned()),
        ("peer", false) => Input::Peer(rest.to_owned()),
        ("contacts", true) => Input::Contacts,
        ("retry", true) => Input::Retry,
        ("close", true) => Input::Close,
        ("typing", true) => Input::Typing,
        ("who", true) => Input::Who,
        ("help", _) => Input::Help,
        ("quit" | "exit", true) => Input::Quit,
        _ => Input::Unknown(line.to_owned()),
    }
}

/// Transport wiring: real server adapters, or in-process fakes when no
/// server url is configured.
enum Backend {
    Remote {
        channel: Arc<WsLiveChannel>,
        history: Arc<HttpHistoryStore>,
    },
    Loopback {
        channel: InMemoryLiveChannel,
        history: InMemoryHistoryStore,
        contacts: InMemoryContactDirectory,
    },
}

impl Backend {
    fn from_config(config: &ParleyConfig) -> Result<Self, Box<dyn Error>> {
        let Some(server_url) = &config.server_url else {
            info!("no PARLEY_SERVER_URL set; using offline loopback");
            return Ok(Self::Loopback {
                channel: InMemoryLiveChannel::new(true),
                history: InMemoryHistoryStore::default(),
                contacts: InMemoryContactDirectory::new(),
            });
        };

        let history = HttpHistoryStore::new(server_url)?;
        let ws_config = WsConfig::new(server_url)?.with_retry(config.retry_policy());
        info!(server = %server_url, live = %ws_config.url, "using remote chat server");
        Ok(Self::Remote {
            channel: Arc::new(WsLiveChannel::spawn(ws_config)),
            history: Arc::new(history),
        })
    }

    fn context(&self) -> SessionContext {
        let (channel, history) = match self {
            Self::Remote { channel, history } => (
                Arc::clone(channel) as Arc<dyn LiveChannel>,
                Arc::clone(history) as Arc<dyn HistoryStore>,
            ),
            Self::Loopback {
                channel, history, ..
            } => (
                Arc::new(channel.clone()) as Arc<dyn LiveChannel>,
                Arc::new(history.clone()) as Arc<dyn HistoryStore>,
            ),
        };
        SessionContext::new(channel, history)
    }

    fn contacts(&self) -> &dyn ContactDirectory {
        match self {
            Self::Remote { history, .. } => history.as_ref() as &dyn ContactDirectory,
            Self::Loopback { contacts, .. } => contacts,
        }
    }

    /// Deliver a message as if the active peer had sent it.
    fn inject_peer_message(&self, text: String) -> bool {
        match self {
            Self::Loopback { channel, .. } => {
                channel.deliver(LiveEvent::MessageReceived {
                    sender_id: None,
                    text,
                    sent_at_ms: None,
                });
                true
            }
            Self::Remote { .. } => false,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting parley-cli");

    let config = match ParleyConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            eprintln!("parley: {err}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "parley-cli failed");
            eprintln!("parley: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ParleyConfig) -> Result<(), Box<dyn Error>> {
    let backend = Backend::from_config(&config)?;
    let handle = spawn_session(backend.context(), config.session_config())?;
    let printer = spawn_printer(handle.subscribe(), ConsoleState::new(config.timeline_max_items));

    match &config.user_id {
        Some(user_id) => {
            handle
                .send(SessionCommand::Authenticate {
                    user_id: user_id.clone(),
                })
                .await?;
        }
        None => println!("* type /login <user> to sign in (or set PARLEY_USER)"),
    }
    if let Some(peer_user_id) = &config.peer_user_id {
        handle
            .send(SessionCommand::OpenConversation {
                peer_user_id: peer_user_id.clone(),
            })
            .await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !dispatch(parse_input(&line), &handle, &backend).await? {
            break;
        }
    }

    debug!("input closed; ending session");
    let _ = handle.send(SessionCommand::EndSession).await;
    drop(handle);
    if let Err(err) = printer.await {
        warn!(error = %err, "event printer task failed");
    }
    Ok(())
}

/// Act on one input line. Returns `false` when the client should exit.
async fn dispatch(
    input: Input,
    handle: &SessionHandle,
    backend: &Backend,
) -> Result<bool, Box<dyn Error>> {
    let command = match input {
        Input::Login(user_id) => SessionCommand::Authenticate { user_id },
        Input::Open(peer_user_id) => SessionCommand::OpenConversation { peer_user_id },
        Input::Retry => SessionCommand::RetryLoad,
        Input::Close => SessionCommand::CloseConversation,
        Input::Typing => SessionCommand::Keystroke,
        Input::Send(text) => {
            if let Err(err) = handle.send_text(text).await {
                println!("! {err}");
            }
            return Ok(true);
        }
        Input::Contacts => {
            let Some(user_id) = handle.snapshot().await?.local_user_id else {
                println!("! sign in with /login before listing contacts");
                return Ok(true);
            };
            match backend.contacts().list_contacts(&user_id).await {
                Ok(contacts) => {
                    for line in describe_contacts(&contacts) {
                        println!("{line}");
                    }
                }
                Err(err) => println!("! contacts unavailable ({}): {err}", err.code()),
            }
            return Ok(true);
        }
        Input::Peer(text) => {
            if !backend.inject_peer_message(text) {
                println!("! /peer is only available offline");
            }
            return Ok(true);
        }
        Input::Who => {
            for line in describe(&handle.snapshot().await?) {
                println!("{line}");
            }
            return Ok(true);
        }
        Input::Help => {
            println!("{HELP}");
            return Ok(true);
        }
        Input::Unknown(line) => {
            println!("! unknown command '{line}' (try /help)");
            return Ok(true);
        }
        Input::Empty => return Ok(true),
        Input::Quit => return Ok(false),
    };
    handle.send(command).await?;
    Ok(true)
}

fn spawn_printer(mut events: EventStream, mut state: ConsoleState) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "console fell behind session events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let ended = matches!(event, SessionEvent::SessionEnded);
            for line in state.handle_session_event(event) {
                println!("{line}");
            }
            if ended {
                break;
            }
        }
    })
}

fn describe_contacts(contacts: &[Contact]) -> Vec<String> {
    if contacts.is_empty() {
        return vec!["* no contacts yet".to_owned()];
    }
    contacts
        .iter()
        .map(|contact| format!("* {} ({})", contact.username, contact.id))
        .collect()
}

fn describe(snapshot: &SessionSnapshot) -> Vec<String> {
    let user = snapshot.local_user_id.as_deref().unwrap_or("(signed out)");
    let link = if snapshot.channel_connected {
        "connected"
    } else {
        "offline"
    };
    let mut lines = vec![format!("* {user}, {link}")];
    if let Some(conversation) = &snapshot.conversation {
        let typing = if snapshot.is_peer_typing {
            ", typing"
        } else {
            ""
        };
        lines.push(format!(
            "* talking to {}{typing}: {:?}, {} messages",
            conversation.peer_user_id,
            snapshot.load_status,
            snapshot.messages.len()
        ));
    }
    if let Some(code) = &snapshot.last_error_code {
        lines.push(format!("* last error: {code}"));
    }
    lines
}
