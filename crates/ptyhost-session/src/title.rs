//! Session titles and tab title formats.

/// Which of a session's titles is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleRole {
    /// The name of the session.
    Name,
    /// The title shown in tabs and window captions.
    DisplayedTitle,
}

/// Context selecting one of the two tab title formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabTitleContext {
    Local,
    /// The session is connected to a remote host (ssh and friends).
    Remote,
}

/// A title request made by the program in the terminal, identified by the
/// numeric code of the OSC sequence that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTitle {
    /// `ESC ] 0 ;` window title and icon text.
    WindowAndIcon,
    /// `ESC ] 1 ;` icon text only.
    IconText,
    /// `ESC ] 2 ;` window title only.
    WindowTitle,
    /// `ESC ] 11 ;` background colour.
    BackgroundColor,
    /// `ESC ] 30 ;` rename the session.
    SessionName,
    /// `ESC ] 31 ;` open a URL or directory.
    OpenUrl,
    /// `ESC ] 32 ;` icon name.
    IconName,
}

impl UserTitle {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::WindowAndIcon),
            1 => Some(Self::IconText),
            2 => Some(Self::WindowTitle),
            11 => Some(Self::BackgroundColor),
            30 => Some(Self::SessionName),
            31 => Some(Self::OpenUrl),
            32 => Some(Self::IconName),
            _ => None,
        }
    }
}

/// Values a tab title format can refer to.
#[derive(Debug, Clone, Copy, Default)]
pub struct TitleVars<'a> {
    /// `%n`
    pub name: &'a str,
    /// `%u`
    pub user_title: &'a str,
    /// `%p`, the program's file name.
    pub program: &'a str,
    /// `%d`, the last component of the working directory.
    pub directory: &'a str,
    /// `%#`
    pub session_id: u64,
}

/// Expand `%` directives in `format`. `%%` is a literal percent sign;
/// unknown directives are kept verbatim.
pub fn expand_tab_title(format: &str, vars: &TitleVars<'_>) -> String {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push_str(vars.name),
            Some('u') => out.push_str(vars.user_title),
            Some('p') => out.push_str(basename(vars.program)),
            Some('d') => out.push_str(basename(vars.directory)),
            Some('#') => out.push_str(&vars.session_id.to_string()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return path;
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Replace a leading `~` with `home`.
pub(crate) fn expand_tilde(path: &str, home: Option<&str>) -> String {
    match (path.strip_prefix('~'), home) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            format!("{home}{rest}")
        }
        _ => path.to_string(),
    }
}
