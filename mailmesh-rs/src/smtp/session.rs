use crate::module::{Storage, Table};
use crate::smtp::commands::SmtpCommand;
use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Maximum number of recipients per message
const MAX_RECIPIENTS: usize = 100;

/// Maximum line length in SMTP protocol (RFC 5321)
const MAX_LINE_LENGTH: usize = 1000;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

const DATA_TIMEOUT: Duration = Duration::from_secs(600);

/// Maximum number of errors before disconnecting
const MAX_ERRORS: usize = 10;

/// Settings shared by every session of one endpoint
pub struct SessionConfig {
    pub hostname: String,
    pub storage: Arc<dyn Storage>,
    pub rcpt_rewrite: Option<Arc<dyn Table>>,
    pub max_message_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
}

pub struct SmtpSession {
    config: Arc<SessionConfig>,
    state: SmtpState,
    from: Option<String>,
    to: Vec<String>,
    error_count: usize,
}

/// Outcome of reading one bounded line
#[derive(Debug, PartialEq)]
enum LineRead {
    Eof,
    Line,
    TooLong,
}

/// Read one line of at most `limit` bytes into `buf`.
///
/// The remainder of an overlong line is read and dropped in `limit` sized
/// pieces.
async fn read_line_bounded<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader).take(limit as u64).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.ends_with(b"\n") || n < limit {
        return Ok(LineRead::Line);
    }

    let mut rest = Vec::new();
    loop {
        rest.clear();
        let n = (&mut *reader).take(limit as u64).read_until(b'\n', &mut rest).await?;
        if n == 0 || rest.ends_with(b"\n") {
            return Ok(LineRead::TooLong);
        }
    }
}

enum Reply {
    Send(String),
    StartData,
    Close(String),
}

impl SmtpSession {
    pub fn new(config: Arc<SessionConfig>) -> Self {
        Self {
            config,
            state: SmtpState::Fresh,
            from: None,
            to: Vec::new(),
            error_count: 0,
        }
    }

    pub async fn handle<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        stream
            .write_all(format!("220 {} ESMTP Service Ready\r\n", self.config.hostname).as_bytes())
            .await?;

        let mut line = Vec::new();
        loop {
            if self.error_count >= MAX_ERRORS {
                warn!("Too many errors, disconnecting");
                stream
                    .write_all(b"421 Too many errors, closing connection\r\n")
                    .await?;
                return Ok(());
            }

            let read = timeout(
                COMMAND_TIMEOUT,
                read_line_bounded(&mut stream, &mut line, MAX_LINE_LENGTH),
            )
            .await;
            match read {
                Ok(read) => match read? {
                    LineRead::Line => {}
                    LineRead::Eof => {
                        debug!("Client disconnected");
                        return Ok(());
                    }
                    LineRead::TooLong => {
                        stream.write_all(b"500 Line too long\r\n").await?;
                        self.error_count += 1;
                        continue;
                    }
                },
                Err(_) => {
                    warn!("Command timeout, disconnecting");
                    stream
                        .write_all(b"421 Timeout, closing connection\r\n")
                        .await?;
                    return Ok(());
                }
            }

            let parsed = match std::str::from_utf8(&line) {
                Ok(text) => SmtpCommand::parse(text.trim_end()),
                Err(e) => Err(e.into()),
            };
            let command = match parsed {
                Ok(command) => command,
                Err(e) => {
                    debug!("Command parse error: {}", e);
                    stream
                        .write_all(b"501 Syntax error in parameters or arguments\r\n")
                        .await?;
                    self.error_count += 1;
                    continue;
                }
            };

            match self.handle_command(command) {
                Reply::Send(response) => {
                    if !response.starts_with('2') {
                        self.error_count += 1;
                    }
                    stream.write_all(response.as_bytes()).await?;
                }
                Reply::Close(response) => {
                    stream.write_all(response.as_bytes()).await?;
                    return Ok(());
                }
                Reply::StartData => {
                    stream
                        .write_all(b"354 Start mail input; end with <CRLF>.<CRLF>\r\n")
                        .await?;
                    let response = match self.receive_data(&mut stream).await {
                        Ok(message) => match self.deliver(&message).await {
                            Ok(()) => "250 OK: Message accepted\r\n".to_string(),
                            Err(e) => {
                                error!("Delivery failed: {:#}", e);
                                "451 Requested action aborted: local error in processing\r\n"
                                    .to_string()
                            }
                        },
                        Err(e) => {
                            warn!("Error receiving data: {:#}", e);
                            self.error_count += 1;
                            format!("552 {}\r\n", e)
                        }
                    };
                    self.reset();
                    stream.write_all(response.as_bytes()).await?;
                }
            }
        }
    }

    fn reset(&mut self) {
        self.from = None;
        self.to.clear();
        if self.state != SmtpState::Fresh {
            self.state = SmtpState::Greeted;
        }
    }

    fn handle_command(&mut self, cmd: SmtpCommand) -> Reply {
        let config = Arc::clone(&self.config);
        let hostname = &config.hostname;
        match (&self.state, cmd) {
            (_, SmtpCommand::Helo(domain)) => {
                debug!("HELO from {}", domain);
                self.reset();
                self.state = SmtpState::Greeted;
                Reply::Send(format!("250 {} Hello {}\r\n", hostname, domain))
            }
            (_, SmtpCommand::Ehlo(domain)) => {
                debug!("EHLO from {}", domain);
                self.reset();
                self.state = SmtpState::Greeted;
                Reply::Send(format!(
                    "250-{} Hello {}\r\n250-SIZE {}\r\n250 HELP\r\n",
                    hostname, domain, config.max_message_size
                ))
            }
            (SmtpState::Greeted, SmtpCommand::MailFrom(from)) => {
                debug!("MAIL FROM: {}", from);
                self.from = Some(from);
                self.to.clear();
                self.state = SmtpState::MailFrom;
                Reply::Send("250 OK\r\n".to_string())
            }
            (SmtpState::MailFrom | SmtpState::RcptTo, SmtpCommand::RcptTo(to)) => {
                if self.to.len() >= MAX_RECIPIENTS {
                    warn!("Too many recipients: {}", self.to.len());
                    return Reply::Send(format!(
                        "452 Too many recipients (max {})\r\n",
                        MAX_RECIPIENTS
                    ));
                }
                let to = self.rewrite(to);
                debug!("RCPT TO: {}", to);
                self.to.push(to);
                self.state = SmtpState::RcptTo;
                Reply::Send("250 OK\r\n".to_string())
            }
            (SmtpState::RcptTo, SmtpCommand::Data) => Reply::StartData,
            (_, SmtpCommand::Rset) => {
                self.reset();
                Reply::Send("250 OK\r\n".to_string())
            }
            (_, SmtpCommand::Noop) => Reply::Send("250 OK\r\n".to_string()),
            (_, SmtpCommand::Quit) => {
                Reply::Close(format!("221 {} closing connection\r\n", hostname))
            }
            (_, SmtpCommand::Unknown(cmd)) => {
                debug!("Unknown command: {}", cmd);
                Reply::Send("502 Command not implemented\r\n".to_string())
            }
            _ => Reply::Send("503 Bad sequence of commands\r\n".to_string()),
        }
    }

    fn rewrite(&self, rcpt: String) -> String {
        let Some(table) = &self.config.rcpt_rewrite else {
            return rcpt;
        };
        match table.lookup(&rcpt) {
            Some(replacement) => {
                debug!("recipient {} rewritten to {}", rcpt, replacement);
                replacement
            }
            None => rcpt,
        }
    }

    async fn receive_data<S>(&mut self, stream: &mut BufReader<S>) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut data = Vec::new();
        let mut too_large = false;
        let mut chunk = Vec::new();
        // Long lines arrive in several chunks; only the first starts a line
        let mut line_start = true;

        loop {
            chunk.clear();
            let mut limited = (&mut *stream).take(MAX_LINE_LENGTH as u64);
            let read = limited.read_until(b'\n', &mut chunk);
            let n = match timeout(DATA_TIMEOUT, read).await {
                Ok(read) => read?,
                Err(_) => bail!("Timeout during DATA"),
            };
            if n == 0 {
                bail!("Connection closed during DATA");
            }
            let starts_line = line_start;
            line_start = chunk.ends_with(b"\n");

            if starts_line && (chunk.as_slice() == b".\r\n" || chunk.as_slice() == b".\n") {
                break;
            }
            if too_large {
                continue;
            }

            // Dot-stuffing
            let bytes = match chunk.strip_prefix(b".") {
                Some(rest) if starts_line => rest,
                _ => chunk.as_slice(),
            };
            if data.len() + bytes.len() > self.config.max_message_size {
                too_large = true;
                continue;
            }
            data.extend_from_slice(bytes);
        }

        if too_large {
            bail!(
                "Message too large (max {} bytes)",
                self.config.max_message_size
            );
        }
        if data.is_empty() {
            bail!("Empty message");
        }
        Ok(data)
    }

    async fn deliver(&self, message: &[u8]) -> Result<()> {
        let from = self.from.as_deref().unwrap_or("");
        for recipient in &self.to {
            let id = self.config.storage.deliver(recipient, message).await?;
            info!("Delivered message from <{}> to {} as {}", from, recipient, id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt};

    #[derive(Default)]
    struct MemoryStorage {
        messages: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Storage for MemoryStorage {
        async fn deliver(&self, recipient: &str, data: &[u8]) -> anyhow::Result<String> {
            let mut messages = self.messages.lock().unwrap();
            messages.push((recipient.to_string(), data.to_vec()));
            Ok(format!("msg{}", messages.len()))
        }
    }

    struct Aliases;

    impl Table for Aliases {
        fn lookup(&self, key: &str) -> Option<String> {
            (key == "postmaster@example.org").then(|| "admin@example.org".to_string())
        }
    }

    async fn converse(
        storage: Arc<MemoryStorage>,
        rewrite: Option<Arc<dyn Table>>,
        script: impl AsRef<[u8]>,
    ) -> String {
        let config = Arc::new(SessionConfig {
            hostname: "mx.test".to_string(),
            storage,
            rcpt_rewrite: rewrite,
            max_message_size: 1024,
        });
        let (client, server) = duplex(64 * 1024);
        let session = tokio::spawn(SmtpSession::new(config).handle(server));

        let (mut read, mut write) = tokio::io::split(client);
        write.write_all(script.as_ref()).await.unwrap();
        let mut out = String::new();
        read.read_to_string(&mut out).await.unwrap();
        session.await.unwrap().unwrap();
        out
    }

    #[tokio::test]
    async fn test_full_transaction() {
        let storage = Arc::new(MemoryStorage::default());
        let out = converse(
            Arc::clone(&storage),
            None,
            "EHLO client\r\nMAIL FROM:<a@example.org>\r\nRCPT TO:<b@example.org>\r\nDATA\r\nSubject: hi\r\n\r\n..dotted\r\n.\r\nQUIT\r\n",
        )
        .await;

        assert!(out.starts_with("220 mx.test"));
        assert!(out.contains("250-SIZE 1024"));
        assert!(out.contains("354 "));
        assert!(out.contains("250 OK: Message accepted"));
        assert!(out.ends_with("221 mx.test closing connection\r\n"));

        let messages = storage.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "b@example.org");
        assert_eq!(messages[0].1, b"Subject: hi\r\n\r\n.dotted\r\n");
    }

    #[tokio::test]
    async fn test_bad_sequence() {
        let storage = Arc::new(MemoryStorage::default());
        let out = converse(storage, None, "MAIL FROM:<a@example.org>\r\nDATA\r\nQUIT\r\n").await;
        assert_eq!(out.matches("503 Bad sequence").count(), 2);
    }

    #[tokio::test]
    async fn test_recipient_rewrite() {
        let storage = Arc::new(MemoryStorage::default());
        converse(
            Arc::clone(&storage),
            Some(Arc::new(Aliases)),
            "HELO c\r\nMAIL FROM:<a@example.org>\r\nRCPT TO:<postmaster@example.org>\r\nDATA\r\nbody\r\n.\r\nQUIT\r\n",
        )
        .await;
        assert_eq!(storage.messages.lock().unwrap()[0].0, "admin@example.org");
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let storage = Arc::new(MemoryStorage::default());
        let body = "x".repeat(900);
        let script = format!(
            "HELO c\r\nMAIL FROM:<a@example.org>\r\nRCPT TO:<b@example.org>\r\nDATA\r\n{0}\r\n{0}\r\n.\r\nQUIT\r\n",
            body
        );
        let out = converse(Arc::clone(&storage), None, &script).await;
        assert!(out.contains("552 Message too large"));
        assert!(storage.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_eight_bit_body_accepted() {
        let storage = Arc::new(MemoryStorage::default());
        let mut script = b"HELO c\r\nMAIL FROM:<a@example.org>\r\nRCPT TO:<b@example.org>\r\nDATA\r\n".to_vec();
        script.extend_from_slice(b"Subject: caf\xe9\r\n\r\nbody\r\n.\r\nQUIT\r\n");
        let out = converse(Arc::clone(&storage), None, script).await;

        assert!(out.contains("250 OK: Message accepted"), "{}", out);
        let messages = storage.messages.lock().unwrap();
        assert_eq!(messages[0].1, b"Subject: caf\xe9\r\n\r\nbody\r\n");
    }

    #[tokio::test]
    async fn test_overlong_command_line_discarded() {
        let storage = Arc::new(MemoryStorage::default());
        let script = format!("{}\r\nNOOP\r\nQUIT\r\n", "A".repeat(5000));
        let out = converse(storage, None, script).await;
        assert!(out.contains("500 Line too long\r\n250 OK\r\n221 "), "{}", out);
    }

    #[tokio::test]
    async fn test_non_utf8_command_rejected() {
        let storage = Arc::new(MemoryStorage::default());
        let out = converse(storage, None, &b"HELO caf\xe9\r\nQUIT\r\n"[..]).await;
        assert!(out.contains("501 Syntax error"), "{}", out);
        assert!(out.ends_with("221 mx.test closing connection\r\n"));
    }

    #[tokio::test]
    async fn test_read_line_bounded() {
        let input = b"short\r\nxxxxxxxxxxxxxxxxxxxx\r\nnext\r\ntail";
        let mut reader = BufReader::new(&input[..]);
        let mut buf = Vec::new();

        assert_eq!(read_line_bounded(&mut reader, &mut buf, 8).await.unwrap(), LineRead::Line);
        assert_eq!(buf, b"short\r\n");
        assert_eq!(read_line_bounded(&mut reader, &mut buf, 8).await.unwrap(), LineRead::TooLong);
        assert_eq!(read_line_bounded(&mut reader, &mut buf, 8).await.unwrap(), LineRead::Line);
        assert_eq!(buf, b"next\r\n");
        assert_eq!(read_line_bounded(&mut reader, &mut buf, 8).await.unwrap(), LineRead::Line);
        assert_eq!(buf, b"tail");
        assert_eq!(read_line_bounded(&mut reader, &mut buf, 8).await.unwrap(), LineRead::Eof);
    }
}
