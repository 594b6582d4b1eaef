use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    select,
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream, connect_async,
    tungstenite::http::StatusCode,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    console::Console,
    message::ChatMessage,
    session::{
        CloseReason, DEFAULT_MAILBOX_CAPACITY, Delivery, Route, Session, SessionConfig,
        SessionTasks,
    },
    transport::Transport,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Who the terminal user is; stamped onto every outgoing message.
struct Identity {
    client_id: String,
    user_name: String,
    ip: String,
}

impl Identity {
    fn message(&self, text: &str) -> ChatMessage {
        ChatMessage::new(&self.client_id, &self.user_name, &self.ip, text)
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (transport, ip) = establish_connection(&args.server).await?;
    let session = Session::new(transport, SessionConfig::default());
    let (inbound_tx, mut inbound) = mpsc::channel(DEFAULT_MAILBOX_CAPACITY);
    let tasks = session.start(Route::Local(inbound_tx))?;

    let identity = Identity {
        client_id: session.id().to_string(),
        user_name: args.name,
        ip,
    };
    write_stdout(&format!("*** connected as {}", identity.user_name)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&session, &identity, &mut inbound, &mut stdin, &mut input).await?;
    shutdown_session(&session, tasks).await;

    Ok(())
}

async fn establish_connection(server: &str) -> Result<(Transport, String)> {
    let url = format!("ws://{server}/websocket");
    let (socket, response) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        bail!("dial {url} failed, status code: {}", response.status());
    }
    info!("connected to {url}");

    let ip = match socket.get_ref() {
        MaybeTlsStream::Plain(stream) => stream.local_addr()?.ip().to_string(),
        _ => "unknown".to_string(),
    };
    Ok((Transport::from_tungstenite(socket), ip))
}

async fn run_client_loop(
    session: &Arc<Session>,
    identity: &Identity,
    inbound: &mut mpsc::Receiver<ChatMessage>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    let closed = session.on_close().wait();
    tokio::pin!(closed);

    loop {
        input.clear();
        select! {
            message = inbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                write_stdout(&message.render()).await?;
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, session, identity).await? {
                    break;
                }
            }
            reason = &mut closed => {
                handle_relay_closed(reason).await?;
                break;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    session: &Session,
    identity: &Identity,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    match session.send(&identity.message(text)) {
        Delivery::Queued | Delivery::Dropped { .. } => Ok(true),
        Delivery::Closed => {
            write_stderr("!!! not connected").await?;
            Ok(false)
        }
    }
}

async fn handle_relay_closed(reason: CloseReason) -> io::Result<()> {
    match reason {
        CloseReason::RemoteClosed => write_stdout("*** relay closed the connection").await,
        other => write_stderr(&format!("!!! connection lost: {other}")).await,
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_session(session: &Session, tasks: SessionTasks) {
    session.finish();
    if timeout(SHUTDOWN_GRACE, tasks.join()).await.is_err() {
        warn!(session = %session.id(), "relay did not acknowledge close in time");
        session.close(CloseReason::Requested);
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    Console::stdout().write_line(line).await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    Console::stderr().write_line(line).await
}
