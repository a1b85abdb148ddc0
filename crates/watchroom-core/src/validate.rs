//! Input validation shared by the server and clients.

pub const USERNAME_MIN_LEN: usize = 2;
pub const USERNAME_MAX_LEN: usize = 20;
pub const CHAT_MAX_LEN: usize = 500;
pub const USER_ID_MAX_LEN: usize = 64;
pub const VIDEO_ID_LEN: usize = 11;
pub const TITLE_MAX_LEN: usize = 200;
pub const UNTITLED: &str = "Untitled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    UsernameLength,
    UsernameCharacters,
    EmptyChat,
    ChatTooLong,
    InvalidUserId,
    InvalidRoomCode,
    InvalidVideoUrl,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UsernameLength => write!(
                f,
                "Username must be between {USERNAME_MIN_LEN} and {USERNAME_MAX_LEN} characters"
            ),
            Self::UsernameCharacters => write!(
                f,
                "Username may only contain letters, numbers, spaces, '.', '_' and '-'"
            ),
            Self::EmptyChat => write!(f, "Message cannot be empty"),
            Self::ChatTooLong => write!(f, "Message cannot exceed {CHAT_MAX_LEN} characters"),
            Self::InvalidUserId => write!(f, "Invalid user id"),
            Self::InvalidRoomCode => write!(f, "Invalid room code"),
            Self::InvalidVideoUrl => write!(f, "Invalid YouTube URL"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Trim and check a display name.
pub fn normalize_username(raw: &str) -> Result<String, ValidationError> {
    let name = raw.trim();
    let len = name.chars().count();
    if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
        return Err(ValidationError::UsernameLength);
    }
    let allowed = |c: char| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.');
    if !name.chars().all(allowed) {
        return Err(ValidationError::UsernameCharacters);
    }
    Ok(name.to_string())
}

/// Case-insensitive username comparison used for uniqueness checks.
pub fn same_username(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Trim and check a chat message body.
pub fn normalize_chat(raw: &str) -> Result<String, ValidationError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ValidationError::EmptyChat);
    }
    if text.chars().count() > CHAT_MAX_LEN {
        return Err(ValidationError::ChatTooLong);
    }
    Ok(text.to_string())
}

/// Check a client-supplied stable user id. `Ok(None)` means the client did
/// not send one.
pub fn normalize_user_id(raw: Option<&str>) -> Result<Option<String>, ValidationError> {
    let Some(id) = raw.map(str::trim).filter(|id| !id.is_empty()) else {
        return Ok(None);
    };
    if id.len() > USER_ID_MAX_LEN
        || !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(ValidationError::InvalidUserId);
    }
    Ok(Some(id.to_string()))
}

fn is_video_id(candidate: &str) -> bool {
    candidate.len() == VIDEO_ID_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Extract the 11-character YouTube video id from a watch, short, embed or
/// `youtu.be` URL, or accept a bare id.
pub fn extract_video_id(url: &str) -> Result<String, ValidationError> {
    let url = url.trim();
    if is_video_id(url) {
        return Ok(url.to_string());
    }

    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let (host, rest) = without_scheme
        .split_once('/')
        .ok_or(ValidationError::InvalidVideoUrl)?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    let host = host.strip_prefix("m.").unwrap_or(host);

    let candidate = match host {
        "youtu.be" => rest.split(['?', '#', '/']).next(),
        "youtube.com" | "music.youtube.com" | "youtube-nocookie.com" => {
            let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
            if path == "watch" {
                query
                    .split(['&', '#'])
                    .find_map(|pair| pair.strip_prefix("v="))
            } else {
                ["embed/", "shorts/", "live/", "v/"]
                    .iter()
                    .find_map(|prefix| path.strip_prefix(prefix))
                    .and_then(|tail| tail.split(['/', '#']).next())
            }
        },
        _ => None,
    };

    match candidate {
        Some(id) if is_video_id(id) => Ok(id.to_string()),
        _ => Err(ValidationError::InvalidVideoUrl),
    }
}

/// Trim a client-supplied title; empty titles become "Untitled" and long ones
/// are cut at a character boundary.
pub fn sanitize_title(raw: &str) -> String {
    let title = raw.trim();
    if title.is_empty() {
        return UNTITLED.to_string();
    }
    title.chars().take(TITLE_MAX_LEN).collect()
}

/// Use the client's thumbnail URL if it looks like one, otherwise the
/// standard YouTube thumbnail for `video_id`.
pub fn thumbnail_or_default(raw: &str, video_id: &str) -> String {
    let url = raw.trim();
    if url.starts_with("https://") && url.len() <= 512 {
        url.to_string()
    } else {
        format!("https://i.ytimg.com/vi/{video_id}/hqdefault.jpg")
    }
}

/// Durations that are negative or not finite are treated as unknown.
pub fn sanitize_duration(raw: f64) -> f64 {
    if raw.is_finite() && raw > 0.0 {
        raw
    } else {
        0.0
    }
}
