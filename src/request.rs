use chrono::Local;

/// Protocol banner sent to spamd. SYMBOLS asks for the verdict plus the
/// matched rule names.
const SPAMC_COMMAND: &str = "SYMBOLS SPAMC/1.2";

/// Context for the synthetic `Received:` header, gathered from the milter
/// connection and the MTA's macros. Everything except the client identity is
/// optional.
#[derive(Debug, Default, Clone)]
pub struct TraceInfo {
    pub helo: String,
    pub client_name: String,
    pub client_addr: String,
    pub env_rcpt: String,
    /// `{auth_type}` macro, when the client authenticated.
    pub auth_type: Option<String>,
    /// `{auth_ssf}` macro, the cipher bit strength.
    pub auth_ssf: Option<String>,
    /// `j` macro, the MTA's own hostname.
    pub local_host: Option<String>,
    /// `i` macro, the queue id.
    pub queue_id: Option<String>,
    /// `b` macro, the message date as the MTA formatted it.
    pub date: Option<String>,
}

/// The request lines spamd expects before the message itself: the command
/// banner, an optional per-user setting, and a blank separator.
pub fn request_preamble(user: Option<&str>) -> String {
    let mut out = format!("{SPAMC_COMMAND}\r\n");
    if let Some(user) = user.filter(|u| !u.is_empty()) {
        out.push_str(&format!("User: {user}\r\n"));
    }
    out.push_str("\r\n");
    out
}

/// Build the forged `Received:` header that fronts the forwarded message.
///
/// spamd's relay rules expect a believable trace line; without one, messages
/// score very differently than they would at a real relay.
pub fn received_header(trace: &TraceInfo) -> String {
    let mut header = format!(
        "Received: from {} ({} [{}])",
        trace.helo, trace.client_name, trace.client_addr
    );
    if nonempty(&trace.auth_type).is_some() {
        header.push_str("\r\n\t(authenticated");
        if let Some(ssf) = nonempty(&trace.auth_ssf) {
            header.push_str(&format!(" bits={ssf}"));
        }
        header.push(')');
    }
    if let Some(host) = nonempty(&trace.local_host) {
        header.push_str(&format!("\r\n\tby {host} (spamd-milter)"));
        if let Some(id) = nonempty(&trace.queue_id) {
            header.push_str(&format!(" id {id}"));
        }
    }
    if !trace.env_rcpt.is_empty() {
        header.push_str(&format!("\r\n\tfor {}", trace.env_rcpt));
    }
    match nonempty(&trace.date) {
        Some(date) => header.push_str(&format!("; {date}")),
        None => header.push_str(&format!("; {}", Local::now().to_rfc2822())),
    }
    header.push_str("\r\n");
    header
}

fn nonempty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}
