//! Squid redirector protocol parser and response generator.
//!
//! The proxy sends one line per request and waits for exactly one line back:
//!
//! ```text
//! Request:  <channel-id> <url> [<extra> ...]
//! Response: <channel-id> OK rewrite-url="<url>"
//!           <channel-id> OK status=301 url="<url>"
//!           <channel-id> ERR
//!           BH
//! ```
//!
//! Extras (client address, ident, method, key=value pairs) depend on the
//! proxy's `url_rewrite_extras` format and are carried but never inspected.
//!
//! Everything here is a pure function of the line and the rule table.

use crate::rules::{Category, RuleTable};
use std::fmt;
use tracing::{debug, trace};

/// HTTP status sent with every redirect.
pub const REDIRECT_STATUS: u16 = 301;

/// Response for a line that could not be parsed.
///
/// Carries no channel id, so a proxy multiplexing several channels cannot
/// attribute it to a request.
pub const BAD_HEADER: &str = "BH";

/// Parsed request line. Borrows from the input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<'a> {
    /// Opaque channel token, echoed back verbatim.
    pub channel_id: &'a str,
    pub url: &'a str,
    pub extras: Vec<&'a str>,
}

/// Request line parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Fewer than the two required tokens (channel id and url)
    TooFewTokens(usize),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::TooFewTokens(n) => {
                write!(f, "Expected at least 2 tokens, found {}", n)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse a request line.
pub fn parse(line: &str) -> Result<Request<'_>, ParseError> {
    let mut tokens = line.split_whitespace();

    let (channel_id, url) = match (tokens.next(), tokens.next()) {
        (Some(channel_id), Some(url)) => (channel_id, url),
        (Some(_), None) => return Err(ParseError::TooFewTokens(1)),
        _ => return Err(ParseError::TooFewTokens(0)),
    };

    Ok(Request {
        channel_id,
        url,
        extras: tokens.collect(),
    })
}

/// What to tell the proxy about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Rewrite(String),
    Redirect { url: String, status: u16 },
    NoMatch,
}

/// Decide what to do with a request. Rewrite rules are tried before redirect rules.
pub fn evaluate(request: &Request<'_>, rules: &RuleTable) -> Directive {
    if let Some(url) = rules.first_match(request.url, Category::Rewrite) {
        return Directive::Rewrite(url);
    }
    if let Some(url) = rules.first_match(request.url, Category::Redirect) {
        return Directive::Redirect {
            url,
            status: REDIRECT_STATUS,
        };
    }
    Directive::NoMatch
}

/// Format a response line (without the line terminator).
pub fn format(channel_id: &str, directive: &Directive) -> String {
    match directive {
        Directive::Rewrite(url) => format!("{} OK rewrite-url=\"{}\"", channel_id, url),
        Directive::Redirect { url, status } => {
            format!("{} OK status={} url=\"{}\"", channel_id, status, url)
        }
        Directive::NoMatch => format!("{} ERR", channel_id),
    }
}

/// The answer to one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Answer {
        channel_id: String,
        directive: Directive,
    },
    BadHeader,
}

impl Reply {
    /// Short label for logging.
    pub fn outcome(&self) -> &'static str {
        match self {
            Reply::Answer { directive, .. } => match directive {
                Directive::Rewrite(_) => "rewrite",
                Directive::Redirect { .. } => "redirect",
                Directive::NoMatch => "no_match",
            },
            Reply::BadHeader => "bad_header",
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Answer {
                channel_id,
                directive,
            } => f.write_str(&format(channel_id, directive)),
            Reply::BadHeader => f.write_str(BAD_HEADER),
        }
    }
}

/// Parse, evaluate and build the reply for one raw line.
pub fn respond(line: &str, rules: &RuleTable) -> Reply {
    match parse(line) {
        Ok(request) => {
            trace!(
                channel_id = request.channel_id,
                url = request.url,
                extras = ?request.extras,
                "Parsed request"
            );
            Reply::Answer {
                channel_id: request.channel_id.to_string(),
                directive: evaluate(&request, rules),
            }
        }
        Err(e) => {
            debug!(error = %e, "Unparseable request line");
            Reply::BadHeader
        }
    }
}
