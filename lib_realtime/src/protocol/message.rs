//! # Message Framing
//!
//! Every message on the wire has the shape `TOPIC US ACTION (US PART)* RS`, where
//! `US` is the ASCII unit separator and `RS` the record separator. A single
//! transport frame may contain several messages back to back.

use std::fmt;
use thiserror::Error;

/// Separates the topic, action and data parts of one message.
pub const PART_SEPARATOR: char = '\u{1f}';
/// Terminates a message inside a frame.
pub const MESSAGE_SEPARATOR: char = '\u{1e}';

/// Errors produced while decoding a frame or a typed value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("message is missing its action: '{0}'")]
    Truncated(String),

    #[error("invalid typed value '{0}'")]
    InvalidTyped(String),

    #[error("part contains a reserved separator: '{0}'")]
    ReservedSeparator(String),
}

/// True when `part` holds a separator and cannot travel as one part.
pub fn has_separator(part: &str) -> bool {
    part.contains([PART_SEPARATOR, MESSAGE_SEPARATOR])
}

/// The subsystem a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Connection housekeeping (ping, challenge).
    Connection,
    /// Authentication.
    Auth,
    /// Server-level errors not bound to another topic.
    Error,
    /// Events.
    Event,
    /// Records.
    Record,
    /// Remote procedure calls.
    Rpc,
}

impl Topic {
    /// The wire token for this topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Connection => "C",
            Topic::Auth => "A",
            Topic::Error => "X",
            Topic::Event => "E",
            Topic::Record => "R",
            Topic::Rpc => "P",
        }
    }

    /// Parses a wire token.
    pub fn parse(token: &str) -> Result<Self, ParseError> {
        match token {
            "C" => Ok(Topic::Connection),
            "A" => Ok(Topic::Auth),
            "X" => Ok(Topic::Error),
            "E" => Ok(Topic::Event),
            "R" => Ok(Topic::Record),
            "P" => Ok(Topic::Rpc),
            other => Err(ParseError::UnknownTopic(other.to_string())),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the message asks the receiver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// `PI`
    Ping,
    /// `PO`
    Pong,
    /// `CH`
    Challenge,
    /// `CHR`
    ChallengeResponse,
    /// `A`
    Ack,
    /// `E`
    Error,
    /// `REQ`
    Request,
    /// `RES`
    Response,
    /// `REJ`
    Reject,
    /// `S`
    Subscribe,
    /// `US`
    Unsubscribe,
    /// `L`
    Listen,
    /// `UL`
    Unlisten,
    /// `SP`: a subscription matching a listened pattern appeared.
    SubscriptionForPatternFound,
    /// `SR`: the last subscription matching a listened pattern went away.
    SubscriptionForPatternRemoved,
    /// `EVT`
    Event,
    /// `CR`
    CreateOrRead,
    /// `R`
    Read,
    /// `U`
    Update,
    /// `P`
    Patch,
    /// `D`
    Delete,
    /// `WA`
    WriteAcknowledgement,
}

impl Action {
    /// The wire token for this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Ping => "PI",
            Action::Pong => "PO",
            Action::Challenge => "CH",
            Action::ChallengeResponse => "CHR",
            Action::Ack => "A",
            Action::Error => "E",
            Action::Request => "REQ",
            Action::Response => "RES",
            Action::Reject => "REJ",
            Action::Subscribe => "S",
            Action::Unsubscribe => "US",
            Action::Listen => "L",
            Action::Unlisten => "UL",
            Action::SubscriptionForPatternFound => "SP",
            Action::SubscriptionForPatternRemoved => "SR",
            Action::Event => "EVT",
            Action::CreateOrRead => "CR",
            Action::Read => "R",
            Action::Update => "U",
            Action::Patch => "P",
            Action::Delete => "D",
            Action::WriteAcknowledgement => "WA",
        }
    }

    /// Parses a wire token.
    pub fn parse(token: &str) -> Result<Self, ParseError> {
        let action = match token {
            "PI" => Action::Ping,
            "PO" => Action::Pong,
            "CH" => Action::Challenge,
            "CHR" => Action::ChallengeResponse,
            "A" => Action::Ack,
            "E" => Action::Error,
            "REQ" => Action::Request,
            "RES" => Action::Response,
            "REJ" => Action::Reject,
            "S" => Action::Subscribe,
            "US" => Action::Unsubscribe,
            "L" => Action::Listen,
            "UL" => Action::Unlisten,
            "SP" => Action::SubscriptionForPatternFound,
            "SR" => Action::SubscriptionForPatternRemoved,
            "EVT" => Action::Event,
            "CR" => Action::CreateOrRead,
            "R" => Action::Read,
            "U" => Action::Update,
            "P" => Action::Patch,
            "D" => Action::Delete,
            "WA" => Action::WriteAcknowledgement,
            other => return Err(ParseError::UnknownAction(other.to_string())),
        };
        Ok(action)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Addressed subsystem.
    pub topic: Topic,
    /// Requested operation.
    pub action: Action,
    /// Positional data parts; meaning depends on topic and action.
    pub data: Vec<String>,
}

impl Message {
    /// Builds a message from anything convertible into its data parts.
    pub fn new<I, S>(topic: Topic, action: Action, data: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topic,
            action,
            data: data.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the data part at `index`, or an empty string when absent.
    pub fn part(&self, index: usize) -> &str {
        self.data.get(index).map(String::as_str).unwrap_or("")
    }

    /// Fails if any data part would split or end the message on the wire.
    pub fn check_parts(&self) -> Result<(), ParseError> {
        match self.data.iter().find(|part| has_separator(part)) {
            Some(part) => Err(ParseError::ReservedSeparator(part.escape_debug().to_string())),
            None => Ok(()),
        }
    }

    /// Encodes this message, including the trailing message separator.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(
            8 + self.data.iter().map(|d| d.len() + 1).sum::<usize>(),
        );
        out.push_str(self.topic.as_str());
        out.push(PART_SEPARATOR);
        out.push_str(self.action.as_str());
        for part in &self.data {
            out.push(PART_SEPARATOR);
            out.push_str(part);
        }
        out.push(MESSAGE_SEPARATOR);
        out
    }

    /// Decodes one message (without its trailing separator).
    pub fn decode(raw: &str) -> Result<Self, ParseError> {
        let mut parts = raw.split(PART_SEPARATOR);
        let topic = Topic::parse(parts.next().unwrap_or(""))?;
        let action = match parts.next() {
            Some(token) => Action::parse(token)?,
            None => return Err(ParseError::Truncated(raw.to_string())),
        };
        Ok(Self {
            topic,
            action,
            data: parts.map(str::to_string).collect(),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.topic, self.action)?;
        for part in &self.data {
            write!(f, "|{}", part)?;
        }
        Ok(())
    }
}

/// Splits a transport frame into messages. A malformed message does not stop
/// the ones after it from being decoded.
pub fn decode_frame(frame: &str) -> Vec<Result<Message, ParseError>> {
    frame
        .split(MESSAGE_SEPARATOR)
        .filter(|raw| !raw.is_empty())
        .map(Message::decode)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_uses_separators() {
        let msg = Message::new(Topic::Event, Action::Subscribe, ["event/.*"]);
        assert_eq!(msg.encode(), "E\u{1f}S\u{1f}event/.*\u{1e}");
    }

    #[test]
    fn test_decode_frame_with_several_messages() {
        let frame = "C\u{1f}PI\u{1e}E\u{1f}EVT\u{1f}event/foo\u{1f}N42\u{1e}";
        let messages: Vec<Message> = decode_frame(frame).into_iter().map(Result::unwrap).collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].topic, Topic::Connection);
        assert_eq!(messages[0].action, Action::Ping);
        assert_eq!(messages[1].part(0), "event/foo");
        assert_eq!(messages[1].part(1), "N42");
        assert_eq!(messages[1].part(7), "");
    }

    #[test]
    fn test_bad_message_does_not_poison_frame() {
        let frame = "Q\u{1f}S\u{1e}R\u{1f}ZZ\u{1e}R\u{1f}\u{1e}E\u{1f}S\u{1f}a\u{1e}";
        let decoded = decode_frame(frame);
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[0], Err(ParseError::UnknownTopic("Q".to_string())));
        assert_eq!(decoded[1], Err(ParseError::UnknownAction("ZZ".to_string())));
        assert!(decoded[2].is_err());
        assert_eq!(decoded[3].as_ref().unwrap().part(0), "a");
    }

    #[test]
    fn test_separator_inside_a_part_is_refused() {
        let ok = Message::new(Topic::Event, Action::Event, ["event/a", "Sleft right"]);
        assert_eq!(ok.check_parts(), Ok(()));

        let split = Message::new(Topic::Event, Action::Event, ["event/a", "Sleft\u{1f}right"]);
        assert!(matches!(split.check_parts(), Err(ParseError::ReservedSeparator(_))));
        let ended = Message::new(Topic::Record, Action::CreateOrRead, ["r\u{1e}1"]);
        assert!(matches!(ended.check_parts(), Err(ParseError::ReservedSeparator(_))));
    }

    #[test]
    fn test_truncated_message() {
        assert!(matches!(Message::decode("R"), Err(ParseError::Truncated(_))));
    }
}
