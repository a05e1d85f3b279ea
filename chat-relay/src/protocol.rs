use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const ALIAS_PROMPT: &str = "Enter your alias:";
pub const MAX_LINE_LEN: usize = 4096;
pub const MAX_ALIAS_LEN: usize = 32;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Payload carried on the bus topic.
///
/// Relays exchange this as a JSON object with a `type` discriminant. Clients
/// never see it: each relay renders it to the plain text line format before
/// it reaches a mailbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    Joined { alias: String },
    Left { alias: String },
    Chat { alias: String, text: String },
}

impl BusEvent {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    /// The line a client sees for this event, without the terminator.
    pub fn render(&self) -> String {
        match self {
            BusEvent::Joined { alias } => format!("🟢 {alias} joined"),
            BusEvent::Left { alias } => format!("🔴 {alias} left"),
            BusEvent::Chat { alias, text } => format!("[{alias}]:{text}"),
        }
    }
}

/// Renders a raw bus payload for clients. Payloads that are not a
/// [`BusEvent`] come from older relays that published plain text lines and
/// are passed through unchanged.
pub fn render_payload(payload: &str) -> String {
    match BusEvent::decode(payload) {
        Ok(event) => event.render(),
        Err(_) => payload.trim_end_matches(LINE_ENDINGS).to_string(),
    }
}

/// Reads one line, without its terminator. Returns `Ok(None)` at end of
/// stream. A final line without a terminator is still returned.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    // Room for the longest allowed line plus a CRLF terminator.
    let limit = MAX_LINE_LEN + 2;
    let bytes = (&mut *reader).take(limit as u64).read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }

    let text = line.trim_end_matches(LINE_ENDINGS);
    let truncated = bytes == limit && !line.ends_with('\n');
    if truncated || text.len() > MAX_LINE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {MAX_LINE_LEN} bytes"),
        ));
    }

    Ok(Some(text.to_string()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_render_to_client_lines() {
        let joined = BusEvent::Joined {
            alias: "alice".into(),
        };
        let left = BusEvent::Left {
            alias: "alice".into(),
        };
        let chat = BusEvent::Chat {
            alias: "alice".into(),
            text: "hi there".into(),
        };

        assert_eq!(joined.render(), "🟢 alice joined");
        assert_eq!(left.render(), "🔴 alice left");
        assert_eq!(chat.render(), "[alice]:hi there");
    }

    #[test]
    fn bus_payload_carries_discriminant() {
        let chat = BusEvent::Chat {
            alias: "bob".into(),
            text: "yo".into(),
        };
        let encoded = chat.encode().expect("encode");
        assert_eq!(encoded, r#"{"type":"chat","alias":"bob","text":"yo"}"#);
        assert_eq!(render_payload(&encoded), "[bob]:yo");
    }

    #[test]
    fn plain_text_payloads_pass_through() {
        assert_eq!(render_payload("[carol]:legacy"), "[carol]:legacy");
        assert_eq!(render_payload("🟢 carol joined\n"), "🟢 carol joined");
        assert_eq!(render_payload(r#"{"type":"shout"}"#), r#"{"type":"shout"}"#);
    }

    #[tokio::test]
    async fn read_line_strips_terminators() {
        let input: &[u8] = b"first\r\nsecond\nlast";
        let mut reader = tokio::io::BufReader::new(input);

        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("first"));
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("second"));
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("last"));
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_line_rejects_oversized_lines() {
        let mut input = vec![b'x'; MAX_LINE_LEN + 10];
        input.push(b'\n');
        let mut reader = tokio::io::BufReader::new(input.as_slice());

        let err = read_line(&mut reader).await.expect_err("line too long");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn line_at_limit_is_accepted() {
        let mut input = vec![b'y'; MAX_LINE_LEN];
        input.push(b'\n');
        let mut reader = tokio::io::BufReader::new(input.as_slice());

        let line = read_line(&mut reader).await.unwrap().expect("line");
        assert_eq!(line.len(), MAX_LINE_LEN);
    }

    #[tokio::test]
    async fn crlf_line_at_limit_is_accepted() {
        let mut input = vec![b'y'; MAX_LINE_LEN];
        input.extend_from_slice(b"\r\nnext\r\n");
        let mut reader = tokio::io::BufReader::new(input.as_slice());

        let line = read_line(&mut reader).await.unwrap().expect("line");
        assert_eq!(line.len(), MAX_LINE_LEN);
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn line_one_past_limit_is_rejected() {
        let mut input = vec![b'z'; MAX_LINE_LEN + 1];
        input.push(b'\n');
        let mut reader = tokio::io::BufReader::new(input.as_slice());

        let err = read_line(&mut reader).await.expect_err("line too long");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn write_line_appends_newline() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut reader = tokio::io::BufReader::new(reader);

        write_line(&mut writer, "[alice]:hello").await.expect("write");
        let line = read_line(&mut reader).await.expect("read").expect("line");
        assert_eq!(line, "[alice]:hello");
    }
}
