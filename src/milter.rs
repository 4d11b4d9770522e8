use crate::config::{Config, IgnoreMatcher};
use crate::disposition::{self, Disposition};
use crate::request::{received_header, request_preamble, TraceInfo};
use crate::session::{Session, MAX_BODY_LINES};
use crate::spamd::SpamdClient;
use indymilter::{
    run, Actions, Callbacks, Config as IndyConfig, Context, ContextActions, EomContext, Macros,
    SetErrorReply, SocketInfo, Status,
};
use std::ffi::CString;
use std::sync::Arc;
use tokio::net::UnixListener;

pub struct Milter {
    config: Arc<Config>,
    ignore: Arc<Option<IgnoreMatcher>>,
}

impl Milter {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let ignore = Arc::new(config.ignore_matcher()?);
        Ok(Milter {
            config: Arc::new(config),
            ignore,
        })
    }

    pub async fn run(&self, socket_path: &str) -> anyhow::Result<()> {
        log::info!("Starting milter on: {}", socket_path);
        let socket_path = socket_file(socket_path);
        // Remove existing socket if it exists
        if std::path::Path::new(socket_path).exists() {
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        let callbacks = self.callbacks();

        // Negotiate the header-annotation action with the MTA
        let config = IndyConfig {
            actions: Actions::ADD_HEADER,
            ..Default::default()
        };

        run(listener, callbacks, config, tokio::signal::ctrl_c()).await?;
        Ok(())
    }

    fn callbacks(&self) -> Callbacks<Session> {
        let config = self.config.clone();
        let ignore = self.ignore.clone();

        Callbacks {
            connect: Some(Box::new({
                let ignore = ignore.clone();
                move |ctx: &mut Context<Session>, hostname, socket_info| {
                    let ignore = ignore.clone();
                    Box::pin(async move {
                        let client_name = hostname.to_string_lossy().into_owned();
                        let client_addr = match socket_info {
                            SocketInfo::Inet(addr) => addr.ip().to_string(),
                            _ => "unknown".to_string(),
                        };
                        log::debug!("connect('{client_name}', '{client_addr}')");
                        if let Some(matcher) = ignore.as_ref() {
                            if matcher.matches(&client_name, &client_addr) {
                                log::debug!("{client_addr}: matches connect ignore pattern");
                                return Status::Accept;
                            }
                        }
                        ctx.data = Some(Session::new(&client_name, &client_addr));
                        Status::Continue
                    })
                }
            })),

            helo: Some(Box::new(move |ctx: &mut Context<Session>, helo_host| {
                Box::pin(async move {
                    let Some(session) = ctx.data.as_mut() else {
                        log::error!("helo: no session");
                        return Status::Accept;
                    };
                    let helo = helo_host.to_string_lossy();
                    log::debug!("{}: helo('{helo}')", session.client_addr);
                    session.set_helo(&helo);
                    Status::Continue
                })
            })),

            mail: Some(Box::new(move |ctx: &mut Context<Session>, args| {
                Box::pin(async move {
                    let Some(session) = ctx.data.as_mut() else {
                        log::error!("mail: no session");
                        return Status::Accept;
                    };
                    if let Some(sender) = args.first() {
                        log::debug!(
                            "{}: mail_from('{}')",
                            session.client_addr,
                            sender.to_string_lossy()
                        );
                    }
                    Status::Continue
                })
            })),

            rcpt: Some(Box::new(move |ctx: &mut Context<Session>, args| {
                Box::pin(async move {
                    let Some(session) = ctx.data.as_mut() else {
                        log::error!("rcpt: no session");
                        return Status::Accept;
                    };
                    if let Some(rcpt) = args.first() {
                        let rcpt = rcpt.to_string_lossy();
                        log::debug!("{}: rcpt_to('{rcpt}')", session.client_addr);
                        session.set_recipient(&rcpt);
                    }
                    Status::Continue
                })
            })),

            header: Some(Box::new({
                let config = config.clone();
                move |ctx: &mut Context<Session>, name, value| {
                    let config = config.clone();
                    Box::pin(async move {
                        let name = name.to_string_lossy().into_owned();
                        let value = value.to_string_lossy().into_owned();
                        let aux = trace_macros(&ctx.macros);
                        let Some(session) = ctx.data.as_mut() else {
                            log::error!("header: no session");
                            return Status::Accept;
                        };
                        log::debug!("{}: header('{name}', '{value}')", session.client_addr);

                        if session.spamd.is_none() && !start_scoring(session, &config, aux).await {
                            // fail open: deliver unscored
                            return Status::Accept;
                        }

                        let forwarded = forward(session, &format!("{name}: {value}\r\n")).await;
                        session.record_header(&name, &value);
                        if forwarded {
                            Status::Continue
                        } else {
                            session.reset_message();
                            Status::Accept
                        }
                    })
                }
            })),

            eoh: Some(Box::new(move |ctx: &mut Context<Session>| {
                Box::pin(async move {
                    let Some(session) = ctx.data.as_mut() else {
                        log::error!("eoh: no session");
                        return Status::Accept;
                    };
                    log::debug!("{}: eoh()", session.client_addr);
                    // blank line ends the synthetic header block
                    forward(session, "\r\n").await;
                    session.begin_body();
                    Status::Continue
                })
            })),

            body: Some(Box::new(move |ctx: &mut Context<Session>, chunk| {
                Box::pin(async move {
                    let Some(session) = ctx.data.as_mut() else {
                        log::error!("body: no session");
                        return Status::Accept;
                    };
                    forward_body_lines(session, &chunk).await;
                    Status::Continue
                })
            })),

            eom: Some(Box::new(move |ctx: &mut EomContext<Session>| {
                Box::pin(async move {
                    let Some(session) = ctx.data.as_mut() else {
                        log::error!("eom: no session");
                        return Status::Accept;
                    };
                    log::debug!("{}: eom()", session.client_addr);

                    if let Some(spamd) = session.spamd.as_mut() {
                        // no more data for spamd, read the verdict now
                        match spamd.finish_sending().await {
                            Ok(()) => {
                                spamd
                                    .read_reply(&mut session.parser, &session.client_addr)
                                    .await;
                            }
                            Err(e) => {
                                log::error!("{}: shutdown: {e}", session.client_addr);
                            }
                        }
                    }

                    let verdict = session.parser.verdict();
                    let symbols = session.parser.symbols().to_string();
                    let disposition = disposition::decide(verdict, &symbols);
                    log::info!(
                        "{}: {}",
                        session.client_addr,
                        disposition::summary_line(
                            &disposition,
                            verdict,
                            &symbols,
                            &session.hdr_from,
                            &session.hdr_to,
                            &session.hdr_subject,
                        )
                    );
                    let client_addr = session.client_addr.clone();
                    // closes the spamd socket and clears per-message state
                    session.reset_message();

                    match disposition {
                        Disposition::Accept { headers } => {
                            for (name, value) in headers {
                                if let Err(e) = ctx.actions.add_header(name, value).await {
                                    log::error!("{client_addr}: add_header: {e}");
                                }
                            }
                            Status::Accept
                        }
                        Disposition::Reject {
                            code,
                            xcode,
                            message,
                        } => {
                            if let Err(e) = ctx
                                .reply
                                .set_error_reply(code, Some(xcode), vec![message.as_str()])
                            {
                                log::error!("{client_addr}: set_error_reply: {e}");
                            }
                            Status::Reject
                        }
                    }
                })
            })),

            abort: Some(Box::new(move |ctx: &mut Context<Session>| {
                Box::pin(async move {
                    if let Some(session) = ctx.data.as_mut() {
                        log::debug!("{}: abort()", session.client_addr);
                        session.reset_message();
                    }
                    Status::Continue
                })
            })),

            close: Some(Box::new(move |ctx: &mut Context<Session>| {
                Box::pin(async move {
                    if let Some(session) = ctx.data.take() {
                        log::debug!("{}: close()", session.client_addr);
                    }
                    Status::Continue
                })
            })),

            ..Default::default()
        }
    }
}

/// Accept the sendmail-style `unix:<path>` and `local:<path>` socket
/// spellings alongside a bare filesystem path.
fn socket_file(socket_path: &str) -> &str {
    socket_path
        .strip_prefix("unix:")
        .or_else(|| socket_path.strip_prefix("local:"))
        .unwrap_or(socket_path)
}

/// First contact with spamd for this message: connect, then send the SPAMC
/// preamble and the synthetic trace header. Returns false after failing
/// open: the backend is dropped and per-message state is cleared so the next
/// message on this connection starts clean.
async fn start_scoring(session: &mut Session, config: &Config, aux: TraceAux) -> bool {
    match SpamdClient::connect(&config.spamd_endpoint()).await {
        Ok(client) => session.spamd = Some(client),
        Err(e) => {
            log::error!("{}: connect to spamd: {e}", session.client_addr);
            session.reset_message();
            return false;
        }
    }
    let trace = TraceInfo {
        helo: session.helo.clone(),
        client_name: session.client_name.clone(),
        client_addr: session.client_addr.clone(),
        env_rcpt: session.env_rcpt.clone(),
        auth_type: aux.auth_type,
        auth_ssf: aux.auth_ssf,
        local_host: aux.local_host,
        queue_id: aux.queue_id,
        date: aux.date,
    };
    let opening = format!(
        "{}{}",
        request_preamble(config.spamd_user.as_deref()),
        received_header(&trace)
    );
    if !forward(session, &opening).await {
        session.reset_message();
        return false;
    }
    true
}

/// Complete body lines from `chunk` and forward them, subject to the
/// per-message line cap. Lines past the cap are dropped from the forward
/// stream only; local processing is unaffected.
async fn forward_body_lines(session: &mut Session, chunk: &[u8]) {
    for line in session.split_body_lines(chunk) {
        if session.spamd.is_none() || session.forwarded_lines >= MAX_BODY_LINES {
            continue;
        }
        if !forward(session, &format!("{line}\r\n")).await {
            break;
        }
        session.forwarded_lines += 1;
    }
}

/// Write to the spamd connection, if one is open. A failed write drops the
/// connection and reports false so the caller can fail open.
async fn forward(session: &mut Session, data: &str) -> bool {
    let Some(spamd) = session.spamd.as_mut() else {
        return true;
    };
    if let Err(e) = spamd.write_all(data).await {
        log::error!("{}: write to spamd: {e}", session.client_addr);
        session.spamd = None;
        return false;
    }
    true
}

/// Auxiliary trace context pulled from the MTA's macros during the header
/// phase.
struct TraceAux {
    auth_type: Option<String>,
    auth_ssf: Option<String>,
    local_host: Option<String>,
    queue_id: Option<String>,
    date: Option<String>,
}

fn trace_macros(macros: &Macros) -> TraceAux {
    TraceAux {
        auth_type: macro_string(macros, "{auth_type}"),
        auth_ssf: macro_string(macros, "{auth_ssf}"),
        local_host: macro_string(macros, "j"),
        queue_id: macro_string(macros, "i"),
        date: macro_string(macros, "b"),
    }
}

fn macro_string(macros: &Macros, name: &str) -> Option<String> {
    let name = CString::new(name).ok()?;
    macros
        .get(&name)
        .map(|value| value.to_string_lossy().into_owned())
}
