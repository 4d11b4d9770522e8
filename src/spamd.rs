use crate::reply::ReplyParser;
use log::{debug, error};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// How long one wait for reply data may take.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// How many timed-out waits are tolerated before giving up on spamd
/// (6 x 10s, roughly a minute total).
pub const REPLY_RETRIES: u32 = 6;

/// Bound on one reply line; spamd never comes close to this.
const REPLY_LINE_MAX: usize = 2048;

/// Why the reply read loop stopped. None of these are fatal to the mail
/// transaction; the caller decides the disposition from whatever the parser
/// managed to extract.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// spamd finished and closed the connection.
    Closed,
    /// spamd sent something the reply grammar rejects.
    ProtocolError,
    /// No data within the retry budget.
    TimedOut,
    /// Read failed at the socket level.
    ReadError,
}

/// One connection to spamd, opened per message and never reused.
#[derive(Debug)]
pub struct SpamdClient {
    stream: TcpStream,
}

impl SpamdClient {
    /// Connect to spamd. A failure here means the message is simply not
    /// scored; the caller logs and accepts.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(SpamdClient { stream })
    }

    pub async fn write_all(&mut self, data: &str) -> io::Result<()> {
        self.stream.write_all(data.as_bytes()).await
    }

    /// Close the write half. spamd does not answer until it sees
    /// end-of-input, so this has to happen before any read.
    pub async fn finish_sending(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Read spamd's reply, feeding complete lines to `parser`, until the
    /// parser rejects a line, the peer closes, or the retry budget is gone.
    pub async fn read_reply(&mut self, parser: &mut ReplyParser, log_ctx: &str) -> ReadOutcome {
        let mut retries = 0;
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            if retries >= REPLY_RETRIES {
                error!("{log_ctx}: spamd connection timed out");
                return ReadOutcome::TimedOut;
            }
            let read = match timeout(REPLY_TIMEOUT, self.stream.read(&mut buf)).await {
                Err(_elapsed) => {
                    retries += 1;
                    debug!("{log_ctx}: waiting for spamd reply (retry {retries})");
                    continue;
                }
                Ok(Err(e)) => {
                    error!("{log_ctx}: read from spamd: {e}");
                    return ReadOutcome::ReadError;
                }
                Ok(Ok(0)) => return ReadOutcome::Closed,
                Ok(Ok(n)) => &buf[..n],
            };
            for &byte in read {
                if byte != b'\n' && pending.len() < REPLY_LINE_MAX {
                    pending.push(byte);
                    continue;
                }
                if pending.last() == Some(&b'\r') {
                    pending.pop();
                }
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                if byte != b'\n' {
                    pending.push(byte);
                }
                if let Err(e) = parser.feed_line(&line) {
                    error!("{log_ctx}: {e}");
                    return ReadOutcome::ProtocolError;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ParserState;
    use tokio::net::TcpListener;

    async fn local_server<F, Fut>(serve: F) -> String
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve(stream).await;
        });
        addr
    }

    #[tokio::test]
    async fn full_exchange_with_fake_spamd() {
        let addr = local_server(|mut stream| async move {
            // drain the request until the client half-closes
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            let request = String::from_utf8(request).unwrap();
            assert!(request.starts_with("SYMBOLS SPAMC/1.2\r\n"));
            assert!(request.contains("Received: from"));
            stream
                .write_all(
                    b"SPAMD/1.1 0 EX_OK\r\n\
                      Spam: True ; 75.0 / 5.0\r\n\
                      \r\n\
                      SYMBOL_A,SYMBOL_B\r\n",
                )
                .await
                .unwrap();
        })
        .await;

        let mut client = SpamdClient::connect(&addr).await.unwrap();
        client.write_all("SYMBOLS SPAMC/1.2\r\n\r\n").await.unwrap();
        client
            .write_all("Received: from example.com (mail.example.com [203.0.113.5])\r\n")
            .await
            .unwrap();
        client.write_all("Subject: hi\r\n\r\nbuy now\r\n").await.unwrap();
        client.finish_sending().await.unwrap();

        let mut parser = ReplyParser::new();
        let outcome = client.read_reply(&mut parser, "203.0.113.5").await;
        assert_eq!(outcome, ReadOutcome::Closed);
        let verdict = parser.verdict().unwrap();
        assert!(verdict.spam);
        assert!((verdict.score - 75.0).abs() < f64::EPSILON);
        assert_eq!(parser.symbols(), "SYMBOL_A,SYMBOL_B");
    }

    #[tokio::test]
    async fn bad_greeting_stops_the_read() {
        let addr = local_server(|mut stream| async move {
            stream.write_all(b"NOT-SPAMD\r\n").await.unwrap();
            // keep the socket open; the client must stop on its own
            std::future::pending::<()>().await;
        })
        .await;

        let mut client = SpamdClient::connect(&addr).await.unwrap();
        client.finish_sending().await.unwrap();
        let mut parser = ReplyParser::new();
        let outcome = client.read_reply(&mut parser, "test").await;
        assert_eq!(outcome, ReadOutcome::ProtocolError);
        assert!(parser.verdict().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_spamd_times_out_within_budget() {
        let addr = local_server(|stream| async move {
            let _stream = stream;
            std::future::pending::<()>().await;
        })
        .await;

        let mut client = SpamdClient::connect(&addr).await.unwrap();
        client.finish_sending().await.unwrap();
        let mut parser = ReplyParser::new();
        let outcome = client.read_reply(&mut parser, "test").await;
        assert_eq!(outcome, ReadOutcome::TimedOut);
        assert_eq!(parser.state(), ParserState::AwaitingGreeting);
        assert!(parser.verdict().is_none());
    }

    #[tokio::test]
    async fn reply_split_across_reads_still_parses() {
        let addr = local_server(|mut stream| async move {
            stream.write_all(b"SPAMD/1.1 0").await.unwrap();
            stream.flush().await.unwrap();
            tokio::task::yield_now().await;
            stream
                .write_all(b" EX_OK\r\nSpam: False ; 0.5 / 5.0\r\n\r\nNONE\r\n")
                .await
                .unwrap();
        })
        .await;

        let mut client = SpamdClient::connect(&addr).await.unwrap();
        client.finish_sending().await.unwrap();
        let mut parser = ReplyParser::new();
        let outcome = client.read_reply(&mut parser, "test").await;
        assert_eq!(outcome, ReadOutcome::Closed);
        let verdict = parser.verdict().unwrap();
        assert!(!verdict.spam);
        assert_eq!(parser.symbols(), "NONE");
    }
}
