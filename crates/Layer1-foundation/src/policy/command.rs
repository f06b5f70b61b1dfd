//! Shell command parsing for rule checks
//!
//! Splits a command line into segments at `&&`, `||`, `;`, `|` and
//! newlines (outside quotes), then derives each segment's base command
//! and its path-like arguments.

/// One simple command out of a shell command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSegment {
    /// Raw segment text, trimmed
    pub text: String,
    /// Basename of the executable, after `VAR=value` prefixes
    pub base: String,
    /// Remaining words
    pub args: Vec<String>,
}

/// Split a command line into its segments
pub fn parse_segments(command: &str) -> Vec<CommandSegment> {
    split_operators(command)
        .into_iter()
        .filter_map(|text| parse_segment(&text))
        .collect()
}

/// Base command of the first segment (`"FOO=1 /usr/bin/git status"` → `"git"`)
pub fn base_command(command: &str) -> Option<String> {
    parse_segments(command).into_iter().next().map(|s| s.base)
}

fn split_operators(command: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut single = false;
    let mut double = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !single => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !double => {
                single = !single;
                current.push(c);
            }
            '"' if !single => {
                double = !double;
                current.push(c);
            }
            ';' | '\n' if !single && !double => {
                parts.push(std::mem::take(&mut current));
            }
            '&' if !single && !double && chars.peek() == Some(&'&') => {
                chars.next();
                parts.push(std::mem::take(&mut current));
            }
            '|' if !single && !double => {
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);

    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn parse_segment(text: &str) -> Option<CommandSegment> {
    let words = shlex::split(text)
        .unwrap_or_else(|| text.split_whitespace().map(str::to_string).collect());

    let mut words = words
        .into_iter()
        .skip_while(|w| is_env_assignment(w))
        .collect::<Vec<_>>()
        .into_iter();

    let program = words.next()?;
    let base = program
        .trim_start_matches(&['(', '{'][..])
        .rsplit('/')
        .next()
        .unwrap_or(program.as_str())
        .to_string();

    Some(CommandSegment {
        text: text.to_string(),
        base,
        args: words.collect(),
    })
}

fn is_env_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Path-like arguments referenced by a segment
///
/// Covers plain arguments (`/etc/passwd`, `./a`, `../b`, `~/.ssh`),
/// redirect targets (`>/tmp/x`, `2>>log`) and `--flag=/path` values.
pub fn path_arguments(segment: &CommandSegment) -> Vec<String> {
    let mut paths = Vec::new();
    let mut expect_redirect_target = false;

    for arg in &segment.args {
        if expect_redirect_target {
            paths.push(arg.clone());
            expect_redirect_target = false;
            continue;
        }

        let stripped = arg.trim_start_matches(|c: char| c.is_ascii_digit());
        let stripped = stripped.trim_start_matches(&['<', '>', '&'][..]);
        if stripped.len() != arg.len() && (arg.contains('>') || arg.contains('<')) {
            if stripped.is_empty() {
                expect_redirect_target = true;
            } else {
                paths.push(stripped.to_string());
            }
            continue;
        }

        let candidate = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with('-') => value,
            _ => arg.as_str(),
        };

        if looks_like_path(candidate) {
            paths.push(candidate.to_string());
        }
    }

    paths
}

fn looks_like_path(word: &str) -> bool {
    word.starts_with('/')
        || word.starts_with("./")
        || word.starts_with("../")
        || word.starts_with("~")
        || word == ".."
        || word.contains("/../")
        || word.ends_with("/..")
}

/// Lexically normalize `path` against `base` (no filesystem access)
///
/// A leading `~` maps to `/home`.
pub fn normalize_path(path: &str, base: &str) -> String {
    let joined = if let Some(rest) = path.strip_prefix('~') {
        format!("/home{}", rest)
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_on_operators() {
        let segs = parse_segments("cd /workspace && cargo test | tee out.txt; echo done");
        let bases: Vec<_> = segs.iter().map(|s| s.base.as_str()).collect();
        assert_eq!(bases, vec!["cd", "cargo", "tee", "echo"]);
    }

    #[test]
    fn test_quoted_operators_are_kept() {
        let segs = parse_segments("echo 'a && b' \"c | d\"");
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].args, vec!["a && b", "c | d"]);
    }

    #[test]
    fn test_base_command_skips_env_and_dirs() {
        assert_eq!(
            base_command("RUST_LOG=debug /usr/bin/cargo run").as_deref(),
            Some("cargo")
        );
        assert_eq!(base_command("   ").as_deref(), None);
    }

    #[test]
    fn test_path_arguments() {
        let segs = parse_segments("cat /etc/passwd ./local >/tmp/out --config=/srv/app.toml plain");
        let paths = path_arguments(&segs[0]);
        assert_eq!(
            paths,
            vec!["/etc/passwd", "./local", "/tmp/out", "/srv/app.toml"]
        );
    }

    #[test]
    fn test_detached_redirect_target() {
        let segs = parse_segments("echo hi > /etc/motd");
        assert_eq!(path_arguments(&segs[0]), vec!["/etc/motd"]);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("src/../../etc/passwd", "/workspace"), "/etc/passwd");
        assert_eq!(normalize_path("./a/./b", "/workspace"), "/workspace/a/b");
        assert_eq!(normalize_path("/../..", "/workspace"), "/");
        assert_eq!(normalize_path("~/.ssh/id_rsa", "/workspace"), "/home/.ssh/id_rsa");
    }
}
