//! Line-at-a-time request loop.
//!
//! Reads a request line, answers it, flushes, and only then reads the next
//! one. The proxy blocks on every answer, so nothing is ever batched.

use crate::protocol::{self, Directive, Reply};
use crate::rules::RuleTable;
use std::io::{self, BufRead, Write};
use tracing::{debug, info, warn};

/// Initial capacity of the line buffer
const LINE_CAPACITY: usize = 4 * 1024;

/// Counters for one session, reported at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub requests: u64,
    pub rewrites: u64,
    pub redirects: u64,
    pub no_match: u64,
    pub malformed: u64,
}

impl SessionStats {
    fn record(&mut self, reply: &Reply) {
        self.requests += 1;
        match reply {
            Reply::Answer { directive, .. } => match directive {
                Directive::Rewrite(_) => self.rewrites += 1,
                Directive::Redirect { .. } => self.redirects += 1,
                Directive::NoMatch => self.no_match += 1,
            },
            Reply::BadHeader => self.malformed += 1,
        }
    }
}

/// Redirector instance
pub struct Server {
    rules: RuleTable,
}

impl Server {
    pub fn new(rules: RuleTable) -> Self {
        Server { rules }
    }

    /// Serve requests on stdin/stdout until the proxy hangs up.
    pub fn run_stdio(&self) -> io::Result<SessionStats> {
        let stdin = io::stdin();
        let stdout = io::stdout();
        self.run(stdin.lock(), stdout.lock())
    }

    /// Serve requests until end of input or a blank line.
    ///
    /// Read and write failures end the session with an error.
    pub fn run<R: BufRead, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
    ) -> io::Result<SessionStats> {
        let mut stats = SessionStats::default();
        let mut buf = Vec::with_capacity(LINE_CAPACITY);

        loop {
            buf.clear();

            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                debug!("End of input");
                break;
            }

            let line = String::from_utf8_lossy(&buf);
            if line.trim().is_empty() {
                debug!("Blank line, shutting down");
                break;
            }

            let reply = protocol::respond(&line, &self.rules);
            if matches!(reply, Reply::BadHeader) {
                warn!(line = %line.trim_end(), "Malformed request line");
            } else {
                debug!(line = %line.trim_end(), outcome = reply.outcome(), "Request handled");
            }
            stats.record(&reply);

            let mut response = reply.to_string();
            response.push('\n');
            writer.write_all(response.as_bytes())?;
            writer.flush()?;
        }

        info!(
            requests = stats.requests,
            rewrites = stats.rewrites,
            redirects = stats.redirects,
            no_match = stats.no_match,
            malformed = stats.malformed,
            "Session finished"
        );

        Ok(stats)
    }
}
