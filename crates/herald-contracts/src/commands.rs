/// Inbound command parsing for the chat surface.
///
/// The transport (gateway client, slash-command registration) is an
/// external collaborator; by the time a line reaches this parser it is
/// plain text plus an implicit requester identity. A leading `@<id>`
/// token overrides the implicit requester, which the stdin surface uses
/// to exercise multi-requester flows.

pub const HELP_COMMANDS: [&str; 5] = [
    "/banner",
    "/force_add <external_id>",
    "/confirm",
    "/help",
    "/quit",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Request a status banner (starts the link handshake when unlinked).
    Banner,
    /// Debug: force an outbound friend request to an arbitrary external id.
    ForceAdd { external_id: String },
    /// Confirm the pending handshake candidate.
    Confirm,
    Help,
    Quit,
    /// Legacy text fallback for `/banner`: answered with a usage hint.
    BannerHint,
    Noop,
    Unknown { command: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub requester: Option<u64>,
    pub command: Command,
    pub raw: String,
}

pub fn parse_command(text: &str) -> CommandRequest {
    let raw = text.to_string();
    let mut rest = text.trim();

    let mut requester = None;
    if let Some(tail) = rest.strip_prefix('@') {
        let id_len = tail.chars().take_while(|ch| ch.is_ascii_digit()).count();
        if id_len > 0 && tail[id_len..].starts_with(char::is_whitespace) {
            requester = tail[..id_len].parse::<u64>().ok();
            rest = tail[id_len..].trim_start();
        }
    }

    let command = if let Some(tail) = rest.strip_prefix('/') {
        parse_slash(tail)
    } else if let Some(tail) = rest.strip_prefix('!') {
        parse_legacy(tail)
    } else {
        Command::Noop
    };

    CommandRequest {
        requester,
        command,
        raw,
    }
}

fn parse_slash(tail: &str) -> Command {
    let command_len = tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return Command::Noop;
    }
    let command = tail[..command_len].to_ascii_lowercase();
    let arg = tail[command_len..].trim();

    match command.as_str() {
        "banner" => Command::Banner,
        "force_add" => Command::ForceAdd {
            external_id: arg.to_string(),
        },
        "confirm" => Command::Confirm,
        "help" => Command::Help,
        "quit" => Command::Quit,
        _ => Command::Unknown { command },
    }
}

/// Text-prefixed fallbacks kept from before slash registration was
/// reliable: `!force_add <id>` mirrors the debug command, `!banner`
/// answers with a hint.
fn parse_legacy(tail: &str) -> Command {
    let mut parts = tail.split_whitespace();
    match parts.next().map(str::to_ascii_lowercase).as_deref() {
        Some("force_add") => Command::ForceAdd {
            external_id: parts.collect::<Vec<_>>().join(" "),
        },
        Some("banner") => Command::BannerHint,
        Some(other) => Command::Unknown {
            command: other.to_string(),
        },
        None => Command::Noop,
    }
}

/// Boundary validation for user-supplied external ids.
pub fn parse_external_id(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    trimmed.parse::<u64>().ok()
}
