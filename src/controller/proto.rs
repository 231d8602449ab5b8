//! Wire encoding for the controller's line-oriented text protocol.
//!
//! Modeled after the overlay daemon's real control port grammar
//! (`EXTENDCIRCUIT`, `CLOSECIRCUIT`, `GETINFO`, `SETCONF`, `ATTACHSTREAM`,
//! `SETEVENTS STREAM`), including the `250+key=\r\n...\r\n.\r\n250 OK`
//! multi-line data replies `GETINFO ns/all` returns.

use std::io;
use std::mem;

/// A single reply line: a three-digit status code plus free text.
#[derive(Clone, Debug)]
pub struct ReplyLine {
    pub code: u16,
    pub text: String,
}

impl ReplyLine {
    pub fn is_success(&self) -> bool {
        self.code / 100 == 2
    }

    /// `650` lines are asynchronous events, not replies to a command.
    pub fn is_async_event(&self) -> bool {
        self.code == 650
    }

    pub fn parse(line: &str) -> Result<Self, io::Error> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 4 || !line.is_char_boundary(3) {
            return Err(invalid(&format!("short or malformed reply: {line:?}")))
        }
        let code = line[..3].parse().map_err(|_| {
            invalid(&format!("malformed status code in {line:?}"))
        })?;
        let text = line.get(4..).unwrap_or("").to_string();
        Ok(ReplyLine { code, text })
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Joins single-line replies straight through and folds a `250+key=`
/// data reply's body (everything up to the lone-dot terminator) plus
/// its trailing status line into one [`ReplyLine`].
#[derive(Default)]
pub struct MultilineReply {
    state: ReplyState,
}

#[derive(Default)]
enum ReplyState {
    #[default]
    Idle,
    Collecting(String),
    AwaitingFinal(String),
}

impl MultilineReply {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line with its trailing CRLF already stripped. Returns
    /// `Some` once a complete reply is available; `None` means a data
    /// block is still being collected.
    pub fn feed(&mut self, raw: &str) -> Result<Option<ReplyLine>, io::Error> {
        match mem::take(&mut self.state) {
            ReplyState::Idle => {
                if is_data_opener(raw) {
                    self.state = ReplyState::Collecting(String::new());
                    Ok(None)
                }
                else {
                    ReplyLine::parse(raw).map(Some)
                }
            }
            ReplyState::Collecting(mut buffer) => {
                if raw == "." {
                    self.state = ReplyState::AwaitingFinal(buffer);
                }
                else {
                    buffer.push_str(raw);
                    buffer.push('\n');
                    self.state = ReplyState::Collecting(buffer);
                }
                Ok(None)
            }
            ReplyState::AwaitingFinal(buffer) => {
                let mut reply = ReplyLine::parse(raw)?;
                reply.text = buffer;
                Ok(Some(reply))
            }
        }
    }
}

/// A data-reply opener looks like `250+ns/all=`: three digits then `+`.
fn is_data_opener(raw: &str) -> bool {
    raw.len() > 3 && raw.as_bytes()[3] == b'+'
}

/// Formats a command verb plus space-separated arguments, CRLF-terminated.
pub fn format_command(verb: &str, args: &[&str]) -> String {
    if args.is_empty() {
        format!("{verb}\r\n")
    }
    else {
        format!("{} {}\r\n", verb, args.join(" "))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_ok_reply() {
        let line = ReplyLine::parse("250 OK").unwrap();
        assert_eq!(line.code, 250);
        assert!(line.is_success());
        assert!(!line.is_async_event());
    }

    #[test]
    fn parses_async_event() {
        let line = ReplyLine::parse("650 STREAM 1 NEW 0 example:0").unwrap();
        assert!(line.is_async_event());
        assert_eq!(line.text, "STREAM 1 NEW 0 example:0");
    }

    #[test]
    fn rejects_short_line() {
        assert!(ReplyLine::parse("25").is_err());
    }

    #[test]
    fn formats_command_with_args() {
        assert_eq!(
            format_command("SETCONF", &["__DisablePredictedCircuits=1"]),
            "SETCONF __DisablePredictedCircuits=1\r\n"
        );
        assert_eq!(format_command("GETINFO", &[]), "GETINFO\r\n");
    }

    #[test]
    fn single_line_reply_passes_through() {
        let mut multiline = MultilineReply::new();
        let reply = multiline.feed("250 OK").unwrap().unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.text, "OK");
    }

    #[test]
    fn collects_data_reply_body_until_final_status_line() {
        let mut multiline = MultilineReply::new();
        assert!(multiline.feed("250+ns/all=").unwrap().is_none());
        assert!(multiline.feed("r first line").unwrap().is_none());
        assert!(multiline.feed("r second line").unwrap().is_none());
        assert!(multiline.feed(".").unwrap().is_none());
        let reply = multiline.feed("250 OK").unwrap().unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.text, "r first line\nr second line\n");
    }
}
