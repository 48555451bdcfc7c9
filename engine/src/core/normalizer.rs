//! Canonical forms for common application-control commands.
//!
//! Every command is cleaned first (escaped quotes, line breaks, repeated
//! whitespace). It is then offered to an ordered rule table; the first rule
//! that recognizes the command rewrites it. Unrecognized commands pass
//! through cleaned. Normalizing twice yields the same result as once.

use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;

struct Rule {
    name: &'static str,
    rewrite: fn(&str) -> Option<String>,
}

const RULES: &[Rule] = &[
    Rule {
        name: "open_app",
        rewrite: open_app,
    },
    Rule {
        name: "quit_app",
        rewrite: quit_app,
    },
    Rule {
        name: "start_app",
        rewrite: start_app,
    },
    Rule {
        name: "killall",
        rewrite: killall,
    },
    Rule {
        name: "run_script",
        rewrite: run_script,
    },
];

static OPEN_APP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)^open\s+-a\s+(?:"(?P<dq>[^"]+)"|'(?P<sq>[^']+)'|(?P<app>[^"'\s].*?\.app)/?|(?P<word>[^\s"']+))(?P<rest>\s.*)?$"#,
    )
    .expect("open pattern should compile")
});

static OSASCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^osascript\s+-e\s+(?P<script>.+)$").expect("osascript pattern should compile")
});

static QUIT_SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:quit\s+app(?:lication)?\s+(?P<quit>.+)|tell\s+app(?:lication)?\s+(?P<tell>.+?)\s+to\s+quit)$")
        .expect("quit pattern should compile")
});

static START_APP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^start\s+"?(?P<name>[^"\s]+?)(?:\.exe)?"?$"#)
        .expect("start pattern should compile")
});

static KILLALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^killall\s+(?P<target>.+)$").expect("killall pattern should compile")
});

static RUN_SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?P<interp>sh|bash|zsh|python|python3)\s+(?:"(?P<dq>[^"]+)"|'(?P<sq>[^']+)')(?P<rest>\s.*)?$"#,
    )
    .expect("script pattern should compile")
});

/// Rewrite `command` into its canonical form.
pub fn normalize(command: &str) -> String {
    let cleaned = clean_command(command);
    for rule in RULES {
        if let Some(rewritten) = (rule.rewrite)(&cleaned) {
            trace!(rule = rule.name, from = %cleaned, to = %rewritten, "normalized command");
            return rewritten;
        }
    }
    cleaned
}

/// Unescape quotes, drop carriage returns, fold newlines and collapse runs
/// of whitespace.
pub fn clean_command(command: &str) -> String {
    command
        .replace("\\\"", "\"")
        .replace('\r', "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn open_app(command: &str) -> Option<String> {
    let caps = OPEN_APP.captures(command)?;
    let target = caps
        .name("dq")
        .or_else(|| caps.name("sq"))
        .or_else(|| caps.name("app"))
        .or_else(|| caps.name("word"))?
        .as_str();
    let name = app_name(target);
    if name.is_empty() || name.contains('"') {
        return None;
    }
    let mut out = format!("open -a \"{name}\"");
    if let Some(rest) = caps.name("rest") {
        out.push(' ');
        out.push_str(rest.as_str().trim());
    }
    Some(out)
}

fn quit_app(command: &str) -> Option<String> {
    let script = OSASCRIPT.captures(command)?.name("script")?.as_str();
    let script = unquote(&script.replace("'\\''", "'"));
    let caps = QUIT_SCRIPT.captures(script.trim())?;
    let target = caps.name("quit").or_else(|| caps.name("tell"))?.as_str();
    let name = app_name(target);
    if name.is_empty() {
        return None;
    }
    let escaped = name.replace('"', "\\\"").replace('\'', "'\\''");
    Some(format!("osascript -e 'quit app \"{escaped}\"'"))
}

fn start_app(command: &str) -> Option<String> {
    let caps = START_APP.captures(command)?;
    Some(format!("start {}", caps.name("name")?.as_str()))
}

fn killall(command: &str) -> Option<String> {
    let target = KILLALL.captures(command)?.name("target")?.as_str().trim();
    if target.starts_with('-') {
        return None;
    }
    let quoted = is_quoted(target);
    let bundle = target.to_lowercase().ends_with(".app");
    if !quoted && !bundle && target.contains(char::is_whitespace) {
        return None;
    }
    let name = app_name(target);
    if name.is_empty() {
        return None;
    }
    if name.contains(' ') {
        Some(format!("killall \"{name}\""))
    } else {
        Some(format!("killall {name}"))
    }
}

fn run_script(command: &str) -> Option<String> {
    let caps = RUN_SCRIPT.captures(command)?;
    let path = caps.name("dq").or_else(|| caps.name("sq"))?.as_str().trim();
    let mut out = format!("{} \"{}\"", &caps["interp"], path);
    if let Some(rest) = caps.name("rest") {
        out.push(' ');
        out.push_str(rest.as_str().trim());
    }
    Some(out)
}

/// Application name from a target: quotes, directories and a trailing
/// `.app` bundle suffix are removed.
fn app_name(target: &str) -> String {
    let unquoted = unquote(target.trim());
    let base = unquoted
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let base = match base.len().checked_sub(4) {
        Some(cut) if base.is_char_boundary(cut) && base[cut..].eq_ignore_ascii_case(".app") => {
            &base[..cut]
        }
        _ => base,
    };
    base.trim().to_string()
}

fn is_quoted(text: &str) -> bool {
    text.len() >= 2
        && ((text.starts_with('"') && text.ends_with('"'))
            || (text.starts_with('\'') && text.ends_with('\'')))
}

fn unquote(text: &str) -> String {
    if is_quoted(text) {
        text[1..text.len() - 1].to_string()
    } else {
        text.to_string()
    }
}
