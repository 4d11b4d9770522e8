pub mod config;
pub mod disposition;
pub mod milter;
pub mod reply;
pub mod request;
pub mod session;
pub mod spamd;

pub use config::{Config, IgnoreMatcher};
pub use disposition::{decide, Disposition};
pub use milter::Milter;
pub use reply::{ParserState, ReplyParser, Verdict};
pub use request::TraceInfo;
pub use session::Session;
pub use spamd::SpamdClient;
