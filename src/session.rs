use crate::reply::{truncated, ReplyParser};
use crate::spamd::SpamdClient;

/// Bound on captured header values (From/To/Subject and friends). Longer
/// values are cut, never refused.
pub const MAX_FIELD: usize = 1024;

/// Bound on one assembled body line; a line that never sees `\n` is flushed
/// once it reaches this size.
pub const MAX_LINE: usize = 2048;

/// Body lines forwarded to spamd per message. Past this the rest of the
/// body is not sent, which bounds what one message can cost the backend.
pub const MAX_BODY_LINES: u32 = 1000;

/// Everything tracked across one milter connection. Connection-level fields
/// (client identity, HELO) live for the whole connection; the rest is
/// per-message and cleared by [`Session::reset_message`].
#[derive(Debug, Default)]
pub struct Session {
    pub client_name: String,
    pub client_addr: String,
    pub helo: String,
    pub env_rcpt: String,
    pub hdr_from: String,
    pub hdr_to: String,
    pub hdr_subject: String,
    /// Open connection to spamd, present only while a message is being
    /// forwarded.
    pub spamd: Option<SpamdClient>,
    pub forwarded_lines: u32,
    pub parser: ReplyParser,
    line_buf: Vec<u8>,
}

impl Session {
    pub fn new(client_name: &str, client_addr: &str) -> Self {
        Session {
            client_name: truncated(client_name, MAX_FIELD).to_string(),
            client_addr: truncated(client_addr, MAX_FIELD).to_string(),
            ..Default::default()
        }
    }

    pub fn set_helo(&mut self, helo: &str) {
        self.helo = truncated(helo, MAX_FIELD).to_string();
    }

    /// Last recipient wins; the trace header only needs one.
    pub fn set_recipient(&mut self, rcpt: &str) {
        self.env_rcpt = truncated(rcpt, MAX_FIELD).to_string();
    }

    /// Capture From/To/Subject on first occurrence, case-insensitively.
    pub fn record_header(&mut self, name: &str, value: &str) {
        let slot = if name.eq_ignore_ascii_case("From") {
            &mut self.hdr_from
        } else if name.eq_ignore_ascii_case("To") {
            &mut self.hdr_to
        } else if name.eq_ignore_ascii_case("Subject") {
            &mut self.hdr_subject
        } else {
            return;
        };
        if slot.is_empty() {
            *slot = truncated(value, MAX_FIELD).to_string();
        }
    }

    /// Feed a body chunk, returning the lines it completed. Trailing CR is
    /// stripped; a partial line is carried over to the next chunk.
    pub fn split_body_lines(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || self.line_buf.len() >= MAX_LINE {
                if self.line_buf.last() == Some(&b'\r') {
                    self.line_buf.pop();
                }
                lines.push(String::from_utf8_lossy(&self.line_buf).into_owned());
                self.line_buf.clear();
                if byte != b'\n' {
                    self.line_buf.push(byte);
                }
            } else {
                self.line_buf.push(byte);
            }
        }
        lines
    }

    /// Called at end-of-headers: the body phase starts with fresh counters.
    pub fn begin_body(&mut self) {
        self.line_buf.clear();
        self.forwarded_lines = 0;
    }

    /// Clear every per-message field. Runs after any disposition and on
    /// abort, so nothing leaks into the next message on this connection.
    pub fn reset_message(&mut self) {
        self.spamd = None;
        self.env_rcpt.clear();
        self.hdr_from.clear();
        self.hdr_to.clear();
        self.hdr_subject.clear();
        self.forwarded_lines = 0;
        self.line_buf.clear();
        self.parser = ReplyParser::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ParserState;

    #[test]
    fn first_header_occurrence_wins() {
        let mut session = Session::new("mail.example.com", "203.0.113.5");
        session.record_header("From", "a@x.com");
        session.record_header("FROM", "b@y.com");
        session.record_header("subject", "hi");
        session.record_header("X-Mailer", "whatever");
        assert_eq!(session.hdr_from, "a@x.com");
        assert_eq!(session.hdr_subject, "hi");
        assert_eq!(session.hdr_to, "");
    }

    #[test]
    fn oversized_header_is_truncated_not_dropped() {
        let mut session = Session::new("n", "a");
        let long = "x".repeat(MAX_FIELD + 100);
        session.record_header("Subject", &long);
        assert_eq!(session.hdr_subject.len(), MAX_FIELD);
    }

    #[test]
    fn body_lines_split_across_chunks() {
        let mut session = Session::new("n", "a");
        assert_eq!(session.split_body_lines(b"hello wo"), Vec::<String>::new());
        assert_eq!(
            session.split_body_lines(b"rld\r\nsecond\nthird"),
            vec!["hello world".to_string(), "second".to_string()]
        );
        assert_eq!(session.split_body_lines(b"\n"), vec!["third".to_string()]);
    }

    #[test]
    fn overlong_body_line_is_flushed_at_bound() {
        let mut session = Session::new("n", "a");
        let lines = session.split_body_lines(&vec![b'x'; MAX_LINE + 10]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_LINE);
    }

    #[test]
    fn reset_reopens_first_occurrence_capture() {
        let mut session = Session::new("n", "a");
        session.record_header("From", "old@x.com");
        session.reset_message();
        session.record_header("From", "new@y.com");
        assert_eq!(session.hdr_from, "new@y.com");
    }

    #[test]
    fn reset_clears_per_message_state() {
        let mut session = Session::new("mail.example.com", "203.0.113.5");
        session.set_helo("example.com");
        session.set_recipient("u@example.org");
        session.record_header("From", "a@x.com");
        session.forwarded_lines = 42;
        session.split_body_lines(b"partial");
        session.parser.feed_line("SPAMD/1.1 0 EX_OK").unwrap();

        session.reset_message();

        assert_eq!(session.env_rcpt, "");
        assert_eq!(session.hdr_from, "");
        assert_eq!(session.forwarded_lines, 0);
        assert_eq!(session.parser.state(), ParserState::AwaitingGreeting);
        assert!(session.parser.verdict().is_none());
        // connection-scoped facts survive a message reset
        assert_eq!(session.client_addr, "203.0.113.5");
        assert_eq!(session.helo, "example.com");
        // the partial line buffer was discarded too
        assert_eq!(session.split_body_lines(b"\n"), vec![String::new()]);
    }
}
