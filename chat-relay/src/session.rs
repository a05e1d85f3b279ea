use std::{io, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    broker::{BrokerClosed, BrokerHandle},
    mailbox::{DEFAULT_MAILBOX_CAPACITY, Inbox, mailbox},
    protocol::{self, ALIAS_PROMPT, MAX_ALIAS_LEN},
    registry::SessionId,
};

/// How long a closed session may spend flushing its mailbox to the socket.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer disconnected before sending an alias")]
    Disconnected,
    #[error("alias is empty")]
    EmptyAlias,
    #[error("alias is longer than {MAX_ALIAS_LEN} characters")]
    AliasTooLong,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("connection failed: {0}")]
    Connection(#[from] io::Error),
    #[error(transparent)]
    Broker(#[from] BrokerClosed),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub mailbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// Runs one client connection from handshake to teardown.
///
/// After a successful handshake the session is registered with the broker and
/// exactly one Leave is sent for it, whichever comes first of the reader
/// stopping, the writer stopping, or the broker closing the mailbox. Cancelling
/// `cancel` only aborts a pending handshake; active sessions are ended by the
/// broker closing their mailbox.
pub async fn serve_connection<S>(
    stream: S,
    broker: BrokerHandle,
    config: SessionConfig,
    cancel: CancellationToken,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let alias = select! {
        _ = cancel.cancelled() => return Ok(()),
        alias = handshake(&mut reader, &mut writer) => alias?,
    };

    let id = SessionId::next();
    let (mailbox, inbox) = mailbox(config.mailbox_capacity);
    let evicted = inbox.close_signal();
    let mut writer_task = tokio::spawn(write_loop(inbox, writer));
    broker.join(id, alias.clone(), mailbox).await?;
    info!(%id, alias, "session active");

    let mut writer_done = false;
    let outcome = select! {
        result = read_loop(&mut reader, &alias, &broker) => result,
        _ = evicted.cancelled() => {
            debug!(%id, "mailbox closed by broker");
            Ok(())
        }
        result = &mut writer_task => {
            writer_done = true;
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(SessionError::Connection(err)),
                Err(join_err) => Err(io::Error::other(join_err.to_string()).into()),
            }
        }
    };

    if broker.leave(id).await.is_err() {
        debug!(%id, "broker already stopped");
    }

    if !writer_done {
        // The broker closes the mailbox on Leave; give the writer a moment to flush.
        match timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await {
            Ok(Ok(Err(err))) => debug!(%id, error = %err, "writer failed while draining"),
            Ok(_) => {}
            Err(_) => {
                warn!(%id, "writer did not drain in time");
                writer_task.abort();
            }
        }
    }

    info!(%id, alias, "session closed");
    outcome
}

/// Prompts for an alias and reads it back.
pub async fn handshake<R, W>(reader: &mut R, writer: &mut W) -> Result<String, SessionError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    protocol::write_line(writer, ALIAS_PROMPT).await?;

    let line = protocol::read_line(reader)
        .await?
        .ok_or(HandshakeError::Disconnected)?;
    let alias = line.trim();
    if alias.is_empty() {
        return Err(HandshakeError::EmptyAlias.into());
    }
    if alias.chars().count() > MAX_ALIAS_LEN {
        return Err(HandshakeError::AliasTooLong.into());
    }

    Ok(alias.to_string())
}

/// Forwards every non-blank line as a chat message until the peer closes.
/// Text is relayed as sent, surrounding whitespace included.
pub async fn read_loop<R>(
    reader: &mut R,
    alias: &str,
    broker: &BrokerHandle,
) -> Result<(), SessionError>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = protocol::read_line(reader).await? {
        if line.trim().is_empty() {
            continue;
        }
        broker.outbound(alias, line).await?;
    }
    Ok(())
}

/// Writes queued lines to the socket until the mailbox is closed and drained.
pub async fn write_loop<W>(mut inbox: Inbox, mut writer: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = inbox.recv().await {
        protocol::write_line(&mut writer, &line).await?;
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use tokio::{io::duplex, sync::mpsc};

    use super::*;
    use crate::broker::BrokerEvent;

    fn recording_broker() -> (BrokerHandle, mpsc::Receiver<BrokerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (BrokerHandle::new(tx), rx)
    }

    async fn handshake_with(input: &'static [u8]) -> (Result<String, SessionError>, String) {
        let mut reader = BufReader::new(input);
        let mut written = Vec::new();
        let result = handshake(&mut reader, &mut written).await;
        (result, String::from_utf8(written).unwrap())
    }

    #[tokio::test]
    async fn handshake_prompts_and_trims_alias() {
        let (result, written) = handshake_with(b"  alice \r\nignored\n").await;
        assert_eq!(written, "Enter your alias:\n");
        assert_eq!(result.unwrap(), "alice");
    }

    #[tokio::test]
    async fn handshake_rejects_blank_alias() {
        let (result, _) = handshake_with(b"   \t \n").await;
        assert!(matches!(
            result,
            Err(SessionError::Handshake(HandshakeError::EmptyAlias))
        ));
    }

    #[tokio::test]
    async fn handshake_rejects_early_disconnect() {
        let (result, _) = handshake_with(b"").await;
        assert!(matches!(
            result,
            Err(SessionError::Handshake(HandshakeError::Disconnected))
        ));
    }

    #[tokio::test]
    async fn handshake_rejects_long_alias() {
        let (result, _) =
            handshake_with(b"abcdefghijklmnopqrstuvwxyz0123456789\n").await;
        assert!(matches!(
            result,
            Err(SessionError::Handshake(HandshakeError::AliasTooLong))
        ));
    }

    #[tokio::test]
    async fn read_loop_drops_blank_lines() {
        let (broker, mut events) = recording_broker();
        let mut reader = BufReader::new(&b"hello\n\n   \n\t\n  spaced out  \n"[..]);

        read_loop(&mut reader, "alice", &broker).await.unwrap();
        drop(broker);

        let mut sent = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                BrokerEvent::Outbound { alias, text } => sent.push((alias, text)),
                _ => panic!("read loop emitted a non-chat event"),
            }
        }
        assert_eq!(
            sent,
            vec![
                ("alice".to_string(), "hello".to_string()),
                ("alice".to_string(), "  spaced out  ".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn read_loop_keeps_surrounding_whitespace() {
        let (broker, mut events) = recording_broker();
        let mut reader = BufReader::new(&b"    indented code\r\n\tcol\tcol\n"[..]);

        read_loop(&mut reader, "alice", &broker).await.unwrap();
        drop(broker);

        let mut texts = Vec::new();
        while let Some(event) = events.recv().await {
            if let BrokerEvent::Outbound { text, .. } = event {
                texts.push(text);
            }
        }
        assert_eq!(texts, vec!["    indented code", "\tcol\tcol"]);
    }

    #[tokio::test]
    async fn write_loop_drains_then_closes() {
        let (mailbox, inbox) = mailbox(4);
        let (client, server) = duplex(256);
        mailbox.offer("[bob]:one".into()).unwrap();
        mailbox.offer("🟢 carol joined".into()).unwrap();
        mailbox.close();

        write_loop(inbox, server).await.unwrap();

        let mut reader = BufReader::new(client);
        assert_eq!(
            protocol::read_line(&mut reader).await.unwrap().as_deref(),
            Some("[bob]:one")
        );
        assert_eq!(
            protocol::read_line(&mut reader).await.unwrap().as_deref(),
            Some("🟢 carol joined")
        );
        assert_eq!(protocol::read_line(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_handshake_never_joins() {
        let (broker, mut events) = recording_broker();
        let (client, server) = duplex(256);
        let (client_read, mut client_write) = tokio::io::split(client);

        let session = tokio::spawn(serve_connection(
            server,
            broker,
            SessionConfig::default(),
            CancellationToken::new(),
        ));
        client_write.write_all(b"   \n").await.unwrap();

        let result = session.await.unwrap();
        assert!(matches!(result, Err(SessionError::Handshake(_))));
        assert!(events.recv().await.is_none());
        drop(client_read);
    }

    #[tokio::test]
    async fn peer_close_sends_exactly_one_leave() {
        let (broker, mut events) = recording_broker();
        let (client, server) = duplex(256);
        let (client_read, mut client_write) = tokio::io::split(client);

        let session = tokio::spawn(serve_connection(
            server,
            broker,
            SessionConfig::default(),
            CancellationToken::new(),
        ));
        client_write.write_all(b"erin\nhi\n").await.unwrap();

        let BrokerEvent::Join { id, alias, mailbox } = events.recv().await.unwrap() else {
            panic!("expected join first");
        };
        assert_eq!(alias, "erin");
        assert!(matches!(
            events.recv().await.unwrap(),
            BrokerEvent::Outbound { ref text, .. } if text == "hi"
        ));

        client_write.shutdown().await.unwrap();
        let BrokerEvent::Leave { id: left } = events.recv().await.unwrap() else {
            panic!("expected leave after peer close");
        };
        assert_eq!(left, id);

        // Stand in for the broker: closing the mailbox lets the writer finish.
        mailbox.close();
        session.await.unwrap().unwrap();
        assert!(events.recv().await.is_none());
        drop(client_read);
    }

    #[tokio::test]
    async fn closed_mailbox_ends_session_with_one_leave() {
        let (broker, mut events) = recording_broker();
        let (client, server) = duplex(256);
        let (client_read, mut client_write) = tokio::io::split(client);
        let mut client_read = BufReader::new(client_read);

        let session = tokio::spawn(serve_connection(
            server,
            broker,
            SessionConfig::default(),
            CancellationToken::new(),
        ));
        client_write.write_all(b"frank\n").await.unwrap();

        let BrokerEvent::Join { id, mailbox, .. } = events.recv().await.unwrap() else {
            panic!("expected join");
        };
        mailbox.offer("bye for now".into()).unwrap();
        mailbox.close();

        let BrokerEvent::Leave { id: left } = events.recv().await.unwrap() else {
            panic!("expected leave after eviction");
        };
        assert_eq!(left, id);
        session.await.unwrap().unwrap();
        assert!(events.recv().await.is_none());

        assert_eq!(
            protocol::read_line(&mut client_read).await.unwrap().as_deref(),
            Some(ALIAS_PROMPT)
        );
        assert_eq!(
            protocol::read_line(&mut client_read).await.unwrap().as_deref(),
            Some("bye for now")
        );
        assert_eq!(protocol::read_line(&mut client_read).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancel_aborts_pending_handshake() {
        let (broker, mut events) = recording_broker();
        let (_client, server) = duplex(256);
        let cancel = CancellationToken::new();

        let session = tokio::spawn(serve_connection(
            server,
            broker,
            SessionConfig::default(),
            cancel.clone(),
        ));
        cancel.cancel();

        session.await.unwrap().unwrap();
        assert!(events.recv().await.is_none());
    }
}
