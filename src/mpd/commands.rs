//! Static catalog of MPD commands: wire spelling, argument arity and reply shape.
//!
//! `idle`, `noidle`, command lists, `close`, `kill` and `password` are not in the
//! table: the client drives those itself or does not support them. Commands with
//! binary replies (`albumart`, `readpicture`) cannot be carried over line framing.

use crate::error::MpdError;

use super::protocol::ReplyKind::{self, Empty, Entries, List, Lists, Map, Records, Value};

/// One entry of the command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
  /// Name callers use.
  pub name: &'static str,
  /// Text sent on the wire.
  pub wire: &'static str,
  pub min_args: usize,
  /// `None` for variadic commands.
  pub max_args: Option<usize>,
  pub reply: ReplyKind,
}

const fn cmd(name: &'static str, min_args: usize, max_args: Option<usize>, reply: ReplyKind) -> CommandSpec {
  CommandSpec {
    name,
    wire: name,
    min_args,
    max_args,
    reply,
  }
}

const fn sub(
  name: &'static str,
  wire: &'static str,
  min_args: usize,
  max_args: Option<usize>,
  reply: ReplyKind,
) -> CommandSpec {
  CommandSpec {
    name,
    wire,
    min_args,
    max_args,
    reply,
  }
}

const N: Option<usize> = None;
const fn up(n: usize) -> Option<usize> {
  Some(n)
}

static COMMANDS: &[CommandSpec] = &[
  // Status
  cmd("clearerror", 0, up(0), Empty),
  cmd("currentsong", 0, up(0), Map),
  cmd("status", 0, up(0), Map),
  cmd("stats", 0, up(0), Map),
  // Playback options
  cmd("consume", 1, up(1), Empty),
  cmd("crossfade", 1, up(1), Empty),
  cmd("mixrampdb", 1, up(1), Empty),
  cmd("mixrampdelay", 1, up(1), Empty),
  cmd("random", 1, up(1), Empty),
  cmd("repeat", 1, up(1), Empty),
  cmd("setvol", 1, up(1), Empty),
  cmd("volume", 1, up(1), Empty),
  cmd("single", 1, up(1), Empty),
  cmd("replay_gain_mode", 1, up(1), Empty),
  cmd("replay_gain_status", 0, up(0), Value),
  // Playback control
  cmd("next", 0, up(0), Empty),
  cmd("pause", 0, up(1), Empty),
  cmd("play", 0, up(1), Empty),
  cmd("playid", 0, up(1), Empty),
  cmd("previous", 0, up(0), Empty),
  cmd("seek", 2, up(2), Empty),
  cmd("seekid", 2, up(2), Empty),
  cmd("seekcur", 1, up(1), Empty),
  cmd("stop", 0, up(0), Empty),
  // Queue
  cmd("add", 1, up(2), Empty),
  cmd("addid", 1, up(2), Value),
  cmd("clear", 0, up(0), Empty),
  cmd("delete", 1, up(1), Empty),
  cmd("deleteid", 1, up(1), Empty),
  cmd("move", 2, up(2), Empty),
  cmd("moveid", 2, up(2), Empty),
  cmd("playlist", 0, up(0), List),
  cmd("playlistfind", 2, N, Records),
  cmd("playlistid", 0, up(1), Records),
  cmd("playlistinfo", 0, up(1), Records),
  cmd("playlistsearch", 2, N, Records),
  cmd("plchanges", 1, up(2), Records),
  cmd("plchangesposid", 1, up(2), Records),
  cmd("prio", 2, N, Empty),
  cmd("prioid", 2, N, Empty),
  cmd("rangeid", 2, up(2), Empty),
  cmd("shuffle", 0, up(1), Empty),
  cmd("swap", 2, up(2), Empty),
  cmd("swapid", 2, up(2), Empty),
  cmd("addtagid", 3, up(3), Empty),
  cmd("cleartagid", 1, up(2), Empty),
  // Stored playlists
  cmd("listplaylist", 1, up(2), List),
  cmd("listplaylistinfo", 1, up(2), Records),
  cmd("listplaylists", 0, up(0), Records),
  cmd("load", 1, up(3), Empty),
  cmd("playlistadd", 2, up(3), Empty),
  cmd("playlistclear", 1, up(1), Empty),
  cmd("playlistdelete", 2, up(2), Empty),
  cmd("playlistmove", 3, up(3), Empty),
  cmd("rename", 2, up(2), Empty),
  cmd("rm", 1, up(1), Empty),
  cmd("save", 1, up(2), Empty),
  // Database
  cmd("count", 1, N, Map),
  cmd("find", 1, N, Records),
  cmd("findadd", 1, N, Empty),
  cmd("list", 1, N, List),
  cmd("listall", 0, up(1), Lists),
  cmd("listallinfo", 0, up(1), Entries),
  cmd("listfiles", 0, up(1), Entries),
  cmd("lsinfo", 0, up(1), Entries),
  cmd("readcomments", 1, up(1), Map),
  cmd("search", 1, N, Records),
  cmd("searchadd", 1, N, Empty),
  cmd("searchaddpl", 2, N, Empty),
  cmd("update", 0, up(1), Value),
  cmd("rescan", 0, up(1), Value),
  // Mounts and neighbors
  cmd("mount", 2, up(2), Empty),
  cmd("unmount", 1, up(1), Empty),
  cmd("listmounts", 0, up(0), Records),
  cmd("listneighbors", 0, up(0), Records),
  // Stickers
  sub("sticker_get", "sticker get", 3, up(3), Value),
  sub("sticker_set", "sticker set", 4, up(4), Empty),
  sub("sticker_delete", "sticker delete", 2, up(3), Empty),
  sub("sticker_list", "sticker list", 2, up(2), List),
  sub("sticker_find", "sticker find", 3, up(5), Records),
  // Connection
  cmd("ping", 0, up(0), Empty),
  // Partitions
  cmd("partition", 1, up(1), Empty),
  cmd("listpartitions", 0, up(0), List),
  cmd("newpartition", 1, up(1), Empty),
  cmd("delpartition", 1, up(1), Empty),
  cmd("moveoutput", 1, up(1), Empty),
  // Outputs
  cmd("disableoutput", 1, up(1), Empty),
  cmd("enableoutput", 1, up(1), Empty),
  cmd("toggleoutput", 1, up(1), Empty),
  cmd("outputs", 0, up(0), Records),
  // Reflection
  cmd("config", 0, up(0), Map),
  cmd("commands", 0, up(0), List),
  cmd("notcommands", 0, up(0), List),
  cmd("tagtypes", 0, N, List),
  cmd("urlhandlers", 0, up(0), List),
  cmd("decoders", 0, up(0), Lists),
  // Client to client
  cmd("subscribe", 1, up(1), Empty),
  cmd("unsubscribe", 1, up(1), Empty),
  cmd("channels", 0, up(0), List),
  cmd("readmessages", 0, up(0), Records),
  cmd("sendmessage", 2, up(2), Empty),
];

/// Look up a command by name.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
  COMMANDS.iter().find(|spec| spec.name == name)
}

/// Every known command, in table order.
pub fn all() -> &'static [CommandSpec] {
  COMMANDS
}

/// A command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
  /// Sent double-quoted, with `\` and `"` escaped.
  Text(String),
  Int(i64),
  Float(f64),
  /// `start:end`; an open end is sent as `start:`.
  Range(u32, Option<u32>),
}

impl Arg {
  fn encode(&self) -> Option<String> {
    match self {
      Arg::Text(text) => {
        if text.contains(['\n', '\r']) {
          return None;
        }
        Some(format!(
          "\"{}\"",
          text.replace('\\', "\\\\").replace('"', "\\\"")
        ))
      }
      Arg::Int(value) => Some(value.to_string()),
      Arg::Float(value) => Some(value.to_string()),
      Arg::Range(start, Some(end)) => Some(format!("{}:{}", start, end)),
      Arg::Range(start, None) => Some(format!("{}:", start)),
    }
  }
}

impl From<&str> for Arg {
  fn from(value: &str) -> Self {
    Arg::Text(value.to_string())
  }
}

impl From<String> for Arg {
  fn from(value: String) -> Self {
    Arg::Text(value)
  }
}

impl From<i64> for Arg {
  fn from(value: i64) -> Self {
    Arg::Int(value)
  }
}

impl From<i32> for Arg {
  fn from(value: i32) -> Self {
    Arg::Int(value.into())
  }
}

impl From<u32> for Arg {
  fn from(value: u32) -> Self {
    Arg::Int(value.into())
  }
}

impl From<f64> for Arg {
  fn from(value: f64) -> Self {
    Arg::Float(value)
  }
}

impl From<bool> for Arg {
  fn from(value: bool) -> Self {
    Arg::Int(value.into())
  }
}

/// A validated command, ready to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
  spec: &'static CommandSpec,
  line: String,
}

impl Command {
  /// Look up `name` and encode `args` against its table entry.
  pub fn new(name: &str, args: impl IntoIterator<Item = Arg>) -> Result<Self, MpdError> {
    let spec = lookup(name).ok_or_else(|| MpdError::UnknownCommand(name.to_string()))?;
    let args: Vec<Arg> = args.into_iter().collect();

    let invalid = |reason: String| MpdError::InvalidArguments {
      command: name.to_string(),
      reason,
    };

    if args.len() < spec.min_args {
      return Err(invalid(format!(
        "expected at least {} arguments, got {}",
        spec.min_args,
        args.len()
      )));
    }
    if let Some(max) = spec.max_args {
      if args.len() > max {
        return Err(invalid(format!(
          "expected at most {} arguments, got {}",
          max,
          args.len()
        )));
      }
    }

    let mut line = spec.wire.to_string();
    for (index, arg) in args.iter().enumerate() {
      let encoded = arg
        .encode()
        .ok_or_else(|| invalid(format!("argument {} contains a line break", index)))?;
      line.push(' ');
      line.push_str(&encoded);
    }

    Ok(Self { spec, line })
  }

  pub fn name(&self) -> &'static str {
    self.spec.name
  }

  /// The encoded command line, without terminator.
  pub fn line(&self) -> &str {
    &self.line
  }

  pub(crate) fn reply_kind(&self) -> ReplyKind {
    self.spec.reply
  }
}
