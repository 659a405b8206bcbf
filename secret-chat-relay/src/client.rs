use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    crypto::KeyPair,
    message::{MessageReader, RelayToClient, is_malformed, write_message},
    session::{Action, Session},
};

type RelayReader = MessageReader<BufReader<tokio::net::tcp::OwnedReadHalf>>;
type RelayWriter = tokio::net::tcp::OwnedWriteHalf;

pub async fn run(args: ClientArgs) -> Result<()> {
    let keys = load_keys(&args)?;
    let (mut reader, mut writer) = establish_connection(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let username = resolve_username(&args, &mut stdin).await?;
    // A blank name ends the session here, before anything is registered.
    let mut session = Session::new(&username, keys).context("cannot join the chat")?;

    write_message(&mut writer, &session.registration()).await?;

    let mut input = Vec::new();
    run_client_loop(&mut session, &mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

fn load_keys(args: &ClientArgs) -> Result<KeyPair> {
    match &args.key_file {
        Some(path) => KeyPair::load_or_generate(path),
        None => Ok(KeyPair::generate()),
    }
}

async fn establish_connection(args: &ClientArgs) -> Result<(RelayReader, RelayWriter)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((MessageReader::new(BufReader::new(reader)), writer))
}

async fn resolve_username(
    args: &ClientArgs,
    stdin: &mut BufReader<tokio::io::Stdin>,
) -> Result<String> {
    if let Some(username) = &args.username {
        return Ok(username.clone());
    }

    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"Enter your username: ").await?;
    stdout.flush().await?;

    let mut line = String::new();
    stdin
        .read_line(&mut line)
        .await
        .context("failed to read username")?;
    Ok(line)
}

async fn run_client_loop(
    session: &mut Session,
    reader: &mut RelayReader,
    writer: &mut RelayWriter,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut Vec<u8>,
) -> Result<()> {
    loop {
        select! {
            relay_message = reader.next::<RelayToClient>() => {
                if !handle_relay_message(relay_message, session, writer).await? {
                    break;
                }
            }
            bytes_read = stdin.read_until(b'\n', input) => {
                let keep_going = handle_stdin_input(bytes_read, input, session, writer).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                write_stdout("*** exiting").await?;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_relay_message(
    message: io::Result<Option<RelayToClient>>,
    session: &mut Session,
    writer: &mut RelayWriter,
) -> Result<bool> {
    match message {
        Ok(Some(message)) => {
            perform(session.handle_relay_message(message), writer).await?;
            Ok(true)
        }
        Ok(None) => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
        Err(err) if is_malformed(&err) => {
            warn!(error = %err, "ignoring malformed event from relay");
            Ok(true)
        }
        Err(err) => Err(err.into()),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &[u8],
    session: &mut Session,
    writer: &mut RelayWriter,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = String::from_utf8_lossy(input);
    let line = text.trim_end_matches(['\r', '\n']);
    perform(session.on_user_input(line), writer).await?;
    Ok(true)
}

async fn perform(actions: Vec<Action>, writer: &mut RelayWriter) -> Result<()> {
    for action in actions {
        match action {
            Action::Send(message) => write_message(writer, &message).await?,
            Action::Display(notice) if notice.is_error() => {
                write_stderr(&notice.to_string()).await?
            }
            Action::Display(notice) => write_stdout(&notice.to_string()).await?,
        }
    }
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut RelayWriter) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
