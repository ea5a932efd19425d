//! MPD text protocol: response lines, subsystem events and reply shapes.
//!
//! Reference: https://mpd.readthedocs.io/en/latest/protocol.html

use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::Serialize;

use crate::error::{CommandError, MpdError};

pub const SUCCESS: &str = "OK";
pub const LIST_SUCCESS: &str = "list_OK";
pub const WELCOME_PREFIX: &str = "OK MPD ";
const ACK_PREFIX: &str = "ACK ";
const DELIM: &str = ": ";

pub(crate) const NOIDLE: &str = "noidle";
pub(crate) const COMMAND_LIST_BEGIN: &str = "command_list_ok_begin";
pub(crate) const COMMAND_LIST_END: &str = "command_list_end";
pub(crate) const CHANGED: &str = "changed";

bitflags! {
  /// Events an idle call can wait for.
  ///
  /// One flag per MPD subsystem, plus:
  /// - `ANY` - every subsystem.
  /// - `CONNECT` - the client is connected to the server.
  /// - `IDLE` - the client has nothing queued or in flight.
  /// - `TIMEOUT` - only ever returned, when an idle call timed out.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
  pub struct Event: u32 {
    const DATABASE = 1 << 0;
    const UPDATE = 1 << 1;
    const STORED_PLAYLIST = 1 << 2;
    const PLAYLIST = 1 << 3;
    const PLAYER = 1 << 4;
    const MIXER = 1 << 5;
    const OUTPUT = 1 << 6;
    const OPTIONS = 1 << 7;
    const PARTITION = 1 << 8;
    const STICKER = 1 << 9;
    const SUBSCRIPTION = 1 << 10;
    const MESSAGE = 1 << 11;
    const NEIGHBOR = 1 << 12;
    const MOUNT = 1 << 13;

    const ANY = (1 << 14) - 1;

    const CONNECT = 1 << 14;
    const IDLE = 1 << 15;
    const TIMEOUT = 1 << 16;
  }
}

const SUBSYSTEMS: &[(&str, Event)] = &[
  ("database", Event::DATABASE),
  ("update", Event::UPDATE),
  ("stored_playlist", Event::STORED_PLAYLIST),
  ("playlist", Event::PLAYLIST),
  ("player", Event::PLAYER),
  ("mixer", Event::MIXER),
  ("output", Event::OUTPUT),
  ("options", Event::OPTIONS),
  ("partition", Event::PARTITION),
  ("sticker", Event::STICKER),
  ("subscription", Event::SUBSCRIPTION),
  ("message", Event::MESSAGE),
  ("neighbor", Event::NEIGHBOR),
  ("mount", Event::MOUNT),
];

impl Event {
  /// Map a subsystem name from a `changed:` line to its flag.
  pub fn from_subsystem(name: &str) -> Option<Event> {
    SUBSYSTEMS
      .iter()
      .find(|(subsystem, _)| *subsystem == name)
      .map(|(_, event)| *event)
  }

  /// Subsystem names covered by this mask, in protocol order.
  pub fn subsystems(self) -> impl Iterator<Item = &'static str> {
    SUBSYSTEMS
      .iter()
      .filter(move |(_, event)| self.contains(*event))
      .map(|(name, _)| *name)
  }

  /// The part of the mask the server knows about.
  pub fn wire(self) -> Event {
    self & Event::ANY
  }
}

/// Build the `idle` line for a mask. A mask covering every subsystem is sent bare.
pub(crate) fn idle_command(mask: Event) -> String {
  let wire = mask.wire();
  if wire == Event::ANY {
    return "idle".to_string();
  }
  std::iter::once("idle")
    .chain(wire.subsystems())
    .collect::<Vec<_>>()
    .join(" ")
}

/// One classified line of a server response.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResponseLine<'a> {
  Ok,
  ListOk,
  Ack(CommandError),
  Field(&'a str, &'a str),
  Malformed,
}

/// Classify a response line.
pub(crate) fn parse_line(line: &str) -> ResponseLine<'_> {
  if line == SUCCESS {
    return ResponseLine::Ok;
  }
  if line == LIST_SUCCESS {
    return ResponseLine::ListOk;
  }
  if let Some(rest) = line.strip_prefix(ACK_PREFIX) {
    return match parse_ack(rest) {
      Some(err) => ResponseLine::Ack(err),
      None => ResponseLine::Malformed,
    };
  }
  match line.split_once(DELIM) {
    Some((key, value)) => ResponseLine::Field(key, value),
    None => ResponseLine::Malformed,
  }
}

/// Parse the part after `ACK `: `[code@position] {command} message`.
fn parse_ack(rest: &str) -> Option<CommandError> {
  let rest = rest.strip_prefix('[')?;
  let (location, rest) = rest.split_once(']')?;
  let (code, position) = location.split_once('@')?;
  let rest = rest.trim_start().strip_prefix('{')?;
  let (command, message) = rest.split_once('}')?;

  Some(CommandError {
    code: code.parse().ok()?,
    position: position.parse().ok()?,
    command: command.to_string(),
    message: message.strip_prefix(' ').unwrap_or(message).to_string(),
  })
}

/// Extract the protocol version from the greeting line.
pub(crate) fn parse_welcome(line: &str) -> Result<String, MpdError> {
  line
    .strip_prefix(WELCOME_PREFIX)
    .map(|version| version.trim().to_string())
    .ok_or_else(|| MpdError::Protocol(format!("Unexpected greeting: {}", line)))
}

/// Shape of a command's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
  /// No fields, just `OK`.
  Empty,
  /// Exactly one field; its value.
  Value,
  /// Fields as a map (last value wins).
  Map,
  /// Every value, field names dropped.
  List,
  /// Values grouped by field name.
  Lists,
  /// Records split wherever the first field name reappears.
  Records,
  /// Records split at `file`, `directory` and `playlist`, grouped by that marker.
  Entries,
}

pub type Fields = BTreeMap<String, String>;

const ENTRY_MARKERS: &[&str] = &["file", "directory", "playlist"];

/// Typed reply to a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
  Empty,
  Value(String),
  Map(Fields),
  List(Vec<String>),
  Lists(BTreeMap<String, Vec<String>>),
  Records(Vec<Fields>),
  Entries(BTreeMap<String, Vec<Fields>>),
}

impl Reply {
  /// Shape raw `key: value` pairs according to `kind`.
  pub(crate) fn shape(kind: ReplyKind, pairs: Vec<(String, String)>) -> Result<Reply, MpdError> {
    match kind {
      ReplyKind::Empty => {
        if pairs.is_empty() {
          Ok(Reply::Empty)
        } else {
          Err(MpdError::Protocol(format!(
            "Expected empty reply, got {} fields",
            pairs.len()
          )))
        }
      }
      ReplyKind::Value => match <[(String, String); 1]>::try_from(pairs) {
        Ok([(_, value)]) => Ok(Reply::Value(value)),
        Err(pairs) => Err(MpdError::Protocol(format!(
          "Expected a single value, got {} fields",
          pairs.len()
        ))),
      },
      ReplyKind::Map => Ok(Reply::Map(pairs.into_iter().collect())),
      ReplyKind::List => Ok(Reply::List(
        pairs.into_iter().map(|(_, value)| value).collect(),
      )),
      ReplyKind::Lists => {
        let mut lists: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in pairs {
          lists.entry(key).or_default().push(value);
        }
        Ok(Reply::Lists(lists))
      }
      ReplyKind::Records => {
        let Some(marker) = pairs.first().map(|(key, _)| key.clone()) else {
          return Ok(Reply::Records(Vec::new()));
        };
        let mut records: Vec<Fields> = Vec::new();
        for (key, value) in pairs {
          if key == marker {
            records.push(Fields::new());
          }
          if let Some(record) = records.last_mut() {
            record.insert(key, value);
          }
        }
        Ok(Reply::Records(records))
      }
      ReplyKind::Entries => {
        let mut entries: BTreeMap<String, Vec<Fields>> = BTreeMap::new();
        let mut current: Option<String> = None;
        for (key, value) in pairs {
          if ENTRY_MARKERS.contains(&key.as_str()) {
            entries.entry(key.clone()).or_default().push(Fields::new());
            current = Some(key.clone());
          }
          let record = current
            .as_ref()
            .and_then(|marker| entries.get_mut(marker))
            .and_then(|records| records.last_mut())
            .ok_or_else(|| MpdError::Protocol(format!("Field {} outside of any entry", key)))?;
          record.insert(key, value);
        }
        Ok(Reply::Entries(entries))
      }
    }
  }

  /// The value of a `Value` reply.
  pub fn as_value(&self) -> Option<&str> {
    match self {
      Reply::Value(value) => Some(value),
      _ => None,
    }
  }

  /// The fields of a `Map` reply.
  pub fn as_map(&self) -> Option<&Fields> {
    match self {
      Reply::Map(map) => Some(map),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[String]> {
    match self {
      Reply::List(list) => Some(list),
      _ => None,
    }
  }

  pub fn as_records(&self) -> Option<&[Fields]> {
    match self {
      Reply::Records(records) => Some(records),
      _ => None,
    }
  }
}
