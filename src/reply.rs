use anyhow::{anyhow, Result};

/// Upper bound on the accumulated symbol text. Overlong symbol lists are
/// truncated, never treated as an error.
const MAX_SYMBOLS: usize = 8192;

/// The verdict spamd reported for one message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub spam: bool,
    pub score: f64,
    pub threshold: f64,
}

/// Where the parser is within spamd's reply.
///
/// The reply is a status line, zero or more informational lines followed by
/// the `Spam:` verdict line, a blank separator, and free-text symbol lines
/// until the peer closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    AwaitingGreeting,
    AwaitingVerdict,
    AwaitingSymbolSeparator,
    CollectingSymbols,
}

#[derive(Debug)]
pub struct ReplyParser {
    state: ParserState,
    verdict: Option<Verdict>,
    symbols: String,
}

impl Default for ReplyParser {
    fn default() -> Self {
        ReplyParser {
            state: ParserState::AwaitingGreeting,
            verdict: None,
            symbols: String::new(),
        }
    }
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// The parsed verdict, once the `Spam:` line has been seen.
    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    pub fn symbols(&self) -> &str {
        &self.symbols
    }

    /// Consume one reply line (CR/LF already stripped).
    ///
    /// An `Err` means spamd violated the protocol; the caller is expected to
    /// stop reading and fall back to accepting the message.
    pub fn feed_line(&mut self, line: &str) -> Result<()> {
        match self.state {
            ParserState::AwaitingGreeting => {
                let rest = line
                    .strip_prefix("SPAMD/")
                    .ok_or_else(|| anyhow!("first reply not a SPAMD status line: {line}"))?;
                // skip the version token, then require a 0 EX_OK status
                let status = rest
                    .split_once(' ')
                    .map(|(_, status)| status.trim_start())
                    .unwrap_or("");
                if !status.starts_with("0 EX_OK") {
                    return Err(anyhow!("spamd status not 0 EX_OK: {line}"));
                }
                self.state = ParserState::AwaitingVerdict;
            }
            ParserState::AwaitingVerdict => {
                // spamd may emit other header lines before the verdict
                if let Some(rest) = line.strip_prefix("Spam: ") {
                    self.verdict = Some(parse_verdict(rest)?);
                    self.state = ParserState::AwaitingSymbolSeparator;
                }
            }
            ParserState::AwaitingSymbolSeparator => {
                if line.is_empty() {
                    self.state = ParserState::CollectingSymbols;
                }
            }
            ParserState::CollectingSymbols => {
                let room = MAX_SYMBOLS.saturating_sub(self.symbols.len());
                self.symbols.push_str(truncated(line, room));
            }
        }
        Ok(())
    }
}

/// Parse `<decision> ; <score> / <threshold>` from a `Spam:` line.
///
/// Only the literal token `True` marks the message as spam, matching spamd's
/// case-sensitive output.
fn parse_verdict(rest: &str) -> Result<Verdict> {
    let malformed = || anyhow!("malformed decision reply: Spam: {rest}");
    let (decision, numbers) = rest.split_once(';').ok_or_else(malformed)?;
    let (score, threshold) = numbers.split_once('/').ok_or_else(malformed)?;
    let score: f64 = score.trim().parse().map_err(|_| malformed())?;
    let threshold: f64 = threshold.trim().parse().map_err(|_| malformed())?;
    Ok(Verdict {
        spam: decision.trim() == "True",
        score,
        threshold,
    })
}

/// Cut `s` down to at most `max` bytes without splitting a character.
pub(crate) fn truncated(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
