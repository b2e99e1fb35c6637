//! Message assembly: groups wire lines into reply and event blocks.
//!
//! A message opens on `<REPLY command>` or `<EVENT id>`, carries zero or more
//! `id option option ...` lines and closes on `<END code (message)>`. Lines
//! sharing an id accumulate into one [`OptionResult`]. A parse failure taints
//! the open message; the remaining lines up to the terminator are skipped and
//! the failure is reported once the message closes.

use super::codec::{self, Cursor};
use super::error::{FramingError, ParseError, RequestError, RequestResult};
use super::value::{ObjectId, ObjectOption, OptionResult, Value};

const REPLY_MARKER: &str = "<REPLY ";
const EVENT_MARKER: &str = "<EVENT";
const END_MARKER: &str = "<END";

/// A completed message, ready for the controller.
#[derive(Debug, Clone)]
pub enum Assembled {
    /// Reply to the command whose exact text is `command`
    Reply {
        /// Echoed command text (the correlation key)
        command: String,
        /// Result rows or failure
        outcome: RequestResult<Vec<OptionResult>>,
    },
    /// Spontaneous event that completed successfully
    Event(Vec<OptionResult>),
    /// Failure with nobody to report to but the notification channel
    Notify(ParseError),
}

/// Line-by-line message assembler.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    header: Option<String>,
    group: Option<ObjectId>,
    results: Vec<OptionResult>,
    options: Vec<ObjectOption>,
    error: Option<ParseError>,
    end_seen: bool,
    echo_lines: bool,
}

impl MessageAssembler {
    /// Create an assembler; `echo_lines` traces every wire line.
    pub fn new(echo_lines: bool) -> Self {
        Self {
            echo_lines,
            ..Self::default()
        }
    }

    /// True while a header has been read but no terminator yet.
    pub fn in_message(&self) -> bool {
        self.header.is_some()
    }

    /// Consume one line.
    ///
    /// Returns the completed message when `line` was a terminator. An error
    /// must be handed back through [`MessageAssembler::fail`].
    pub fn push_line(&mut self, line: &str) -> Result<Option<Assembled>, ParseError> {
        if self.echo_lines {
            tracing::trace!(target: "ecoslink::wire", "<< {line}");
        }

        if line.starts_with(REPLY_MARKER) || line.starts_with(EVENT_MARKER) {
            self.open(line)?;
            Ok(None)
        } else if line.starts_with(END_MARKER) {
            self.end_seen = true;
            if self.error.is_some() {
                return Ok(self.finish(-1, String::new()));
            }
            let (code, message) = parse_terminator(line)?;
            Ok(self.finish(code, message))
        } else if self.error.is_none() {
            self.push_options(line)?;
            Ok(None)
        } else {
            Ok(None)
        }
    }

    /// Record a failure for the open message.
    ///
    /// The first failure sticks. If the failing line was the terminator the
    /// message is resolved right away.
    pub fn fail(&mut self, error: ParseError) -> Option<Assembled> {
        if self.error.is_none() {
            self.error = Some(error);
        }
        if self.end_seen {
            self.finish(-1, String::new())
        } else {
            None
        }
    }

    fn open(&mut self, line: &str) -> Result<(), ParseError> {
        if self.header.is_some() {
            return Err(FramingError::new("message header inside an open message", line).into());
        }
        let body = line
            .strip_suffix('>')
            .ok_or_else(|| FramingError::new("message header not terminated by `>`", line))?;
        let marker = if line.starts_with(REPLY_MARKER) {
            REPLY_MARKER.len()
        } else {
            EVENT_MARKER.len()
        };
        self.header = Some(body[marker..].trim().to_string());
        Ok(())
    }

    fn push_options(&mut self, line: &str) -> Result<(), ParseError> {
        let mut cursor = Cursor::new(line);
        let id = match codec::parse_value(&mut cursor)? {
            Value::Int(id) => id,
            _ => return Err(cursor.error("object id expected").into()),
        };
        if self.group != Some(id) {
            self.flush();
            self.group = Some(id);
        }

        while cursor.skip_ws() {
            let option = codec::parse_option(&mut cursor)?;
            self.options.push(option);
        }
        Ok(())
    }

    fn flush(&mut self) {
        if let Some(id) = self.group.take() {
            if !self.options.is_empty() {
                let options = std::mem::take(&mut self.options);
                self.results.push(OptionResult::new(id, options));
            }
        }
        self.options.clear();
    }

    fn finish(&mut self, code: i32, message: String) -> Option<Assembled> {
        self.flush();
        let header = self.header.take();
        let error = self.error.take();
        let results = std::mem::take(&mut self.results);
        self.end_seen = false;

        let header = match header {
            Some(header) => header,
            None => {
                return match error {
                    Some(error) => Some(Assembled::Notify(error)),
                    None => {
                        tracing::warn!(code, "terminator without message header dropped");
                        None
                    }
                };
            }
        };

        if header.parse::<ObjectId>().is_ok() {
            return match error {
                Some(error) => Some(Assembled::Notify(error)),
                None if code == 0 => Some(Assembled::Event(results)),
                None => {
                    tracing::debug!(object = %header, code, %message, "event with error code dropped");
                    None
                }
            };
        }

        let outcome = match error {
            Some(error) if header.is_empty() => return Some(Assembled::Notify(error)),
            Some(error) => Err(RequestError::Parse(error)),
            None if code != 0 => Err(RequestError::Protocol { code, message }),
            None => Ok(results),
        };
        Some(Assembled::Reply {
            command: header,
            outcome,
        })
    }
}

/// Parse `<END code (message)>` into code and message.
fn parse_terminator(line: &str) -> Result<(i32, String), ParseError> {
    let body = line
        .strip_suffix('>')
        .ok_or_else(|| FramingError::new("terminator not closed by `>`", line))?;
    let mut cursor = Cursor::at(body, END_MARKER.len());
    let code = match codec::parse_value(&mut cursor)? {
        Value::Int(code) => code,
        _ => return Err(FramingError::new("return code expected", line).into()),
    };

    let has_message = cursor.skip_ws() && cursor.peek() == Some(b'(') && body.ends_with(')');
    let message = if has_message {
        body[cursor.position() + 1..body.len() - 1].to_string()
    } else {
        String::new()
    };

    if code > 0 && !has_message {
        return Err(FramingError::new(
            format!("could not read error message for code {code}"),
            line,
        )
        .into());
    }
    Ok((code, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(assembler: &mut MessageAssembler, lines: &[&str]) -> Vec<Assembled> {
        let mut out = Vec::new();
        for line in lines {
            match assembler.push_line(line) {
                Ok(Some(done)) => out.push(done),
                Ok(None) => {}
                Err(err) => out.extend(assembler.fail(err)),
            }
        }
        out
    }

    fn reply_ok(done: &Assembled) -> (&str, &[OptionResult]) {
        match done {
            Assembled::Reply {
                command,
                outcome: Ok(results),
            } => (command, results),
            other => panic!("expected successful reply, got {other:?}"),
        }
    }

    #[test]
    fn reply_groups_lines_by_id() {
        let mut assembler = MessageAssembler::new(false);
        let out = feed(
            &mut assembler,
            &[
                "<REPLY queryObjects(10,name,addr)>",
                "1002 name[\"BR 218\"]",
                "1002 addr[3]",
                "1003 name[\"V 100\"] addr[4]",
                "<END 0 (OK)>",
            ],
        );
        assert_eq!(out.len(), 1);
        let (command, results) = reply_ok(&out[0]);
        assert_eq!(command, "queryObjects(10,name,addr)");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, 1002);
        assert_eq!(results[0].options.len(), 2);
        assert_eq!(results[1].id, 1003);
        assert_eq!(results[1].int_of("addr"), Some(4));
        assert!(!assembler.in_message());
    }

    #[test]
    fn empty_reply_resolves_with_no_rows() {
        let mut assembler = MessageAssembler::new(false);
        let out = feed(&mut assembler, &["<REPLY request(1,view)>", "<END 0 (OK)>"]);
        let (_, results) = reply_ok(&out[0]);
        assert!(results.is_empty());
    }

    #[test]
    fn error_code_rejects_reply() {
        let mut assembler = MessageAssembler::new(false);
        let out = feed(
            &mut assembler,
            &["<REPLY set(5,stop)>", "<END 11 (Object not found)>"],
        );
        match &out[0] {
            Assembled::Reply {
                command,
                outcome: Err(RequestError::Protocol { code, message }),
            } => {
                assert_eq!(command, "set(5,stop)");
                assert_eq!(*code, 11);
                assert_eq!(message, "Object not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn event_is_dispatched_only_on_success() {
        let mut assembler = MessageAssembler::new(false);
        let out = feed(
            &mut assembler,
            &[
                "<EVENT 1002>",
                "1002 func[3,1]",
                "<END 0 (OK)>",
                "<EVENT 1002>",
                "1002 speed[4]",
                "<END 25 (busy)>",
            ],
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            Assembled::Event(results) => {
                assert_eq!(
                    results,
                    &vec![OptionResult::new(
                        1002,
                        vec![ObjectOption::named("func").with(3).with(1)]
                    )]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_line_taints_reply_until_end() {
        let mut assembler = MessageAssembler::new(false);
        let out = feed(
            &mut assembler,
            &[
                "<REPLY get(1,status)>",
                "1 status[GO",
                "1 ignored[1]",
                "<END 0 (OK)>",
                "<REPLY get(1,status)>",
                "1 status[GO]",
                "<END 0 (OK)>",
            ],
        );
        assert_eq!(out.len(), 2);
        match &out[0] {
            Assembled::Reply {
                outcome: Err(RequestError::Parse(ParseError::Format(_))),
                ..
            } => {}
            other => panic!("unexpected {other:?}"),
        }
        let (_, results) = reply_ok(&out[1]);
        assert_eq!(results[0].text_of("status"), Some("GO"));
    }

    #[test]
    fn malformed_event_goes_to_notification() {
        let mut assembler = MessageAssembler::new(false);
        let out = feed(&mut assembler, &["<EVENT 7>", "x func[1]", "<END 0 (OK)>"]);
        assert!(matches!(out[0], Assembled::Notify(ParseError::Format(_))));
    }

    #[test]
    fn nested_header_is_a_framing_error() {
        let mut assembler = MessageAssembler::new(false);
        let out = feed(
            &mut assembler,
            &["<REPLY get(1,info)>", "<EVENT 1>", "<END 0 (OK)>"],
        );
        match &out[0] {
            Assembled::Reply {
                command,
                outcome: Err(RequestError::Parse(ParseError::Framing(_))),
            } => assert_eq!(command, "get(1,info)"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn terminator_without_message_is_resolved_immediately() {
        let mut assembler = MessageAssembler::new(false);
        let out = feed(&mut assembler, &["<REPLY set(1,go)>", "<END 3>"]);
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            Assembled::Reply {
                outcome: Err(RequestError::Parse(ParseError::Framing(_))),
                ..
            }
        ));
        assert!(!assembler.in_message());
    }

    #[test]
    fn state_resets_between_messages() {
        let mut assembler = MessageAssembler::new(false);
        let out = feed(
            &mut assembler,
            &[
                "<REPLY get(1,info)>",
                "1 ECoS",
                "<END 0 (OK)>",
                "<REPLY get(1,status)>",
                "1 status[STOP]",
                "<END 0 (OK)>",
            ],
        );
        let (_, second) = reply_ok(&out[1]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].options.len(), 1);
        assert_eq!(second[0].text_of("status"), Some("STOP"));
    }
}
