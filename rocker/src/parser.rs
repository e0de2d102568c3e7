//! Build-file parsing.
//!
//! The format is line oriented: a directive name followed by free-form
//! arguments, `\` line continuation, `#` comments, and an optional JSON-array
//! argument form for directives that take lists (`CMD ["a", "b"]`). Directive
//! names are case insensitive.

use anyhow::{bail, Context, Result};

/// One logical build-file line, before it is turned into a typed command.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SourceCommand {
    /// Lowercased directive name.
    pub name: String,
    /// Split arguments. For the JSON-array form these are the array elements,
    /// otherwise the result of shell-style word splitting.
    pub args: Vec<String>,
    /// The raw argument text, needed by shell-form RUN/CMD/ENTRYPOINT.
    pub rest: String,
    /// Whether the arguments came from a JSON array.
    pub json: bool,
    /// The logical source line, for messages and commit descriptions.
    pub original: String,
    /// 1-based line number of the first physical line.
    pub line: usize,
}

/// Parse a whole build file into its command lines.
pub(crate) fn parse(content: &str) -> Result<Vec<SourceCommand>> {
    let mut commands = Vec::new();
    let mut pending = String::new();
    let mut start_line = 0;

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim_end();
        let trimmed = line.trim_start();
        if pending.is_empty() {
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            start_line = idx + 1;
        } else if trimmed.starts_with('#') {
            // Comments may interleave continuation lines.
            continue;
        }

        if let Some(stripped) = line.strip_suffix('\\') {
            pending.push_str(stripped.trim());
            pending.push(' ');
            continue;
        }
        pending.push_str(trimmed);

        let logical = std::mem::take(&mut pending);
        if logical.trim().is_empty() {
            continue;
        }
        commands.push(
            parse_logical(logical.trim(), start_line)
                .with_context(|| format!("failed to parse line {start_line}"))?,
        );
    }

    if !pending.trim().is_empty() {
        commands.push(parse_logical(pending.trim(), start_line)?);
    }

    Ok(commands)
}

/// Parse a single logical line, e.g. an ONBUILD trigger lifted from a base
/// image.
pub(crate) fn parse_line(line: &str) -> Result<SourceCommand> {
    parse_logical(line.trim(), 0)
}

fn parse_logical(line: &str, line_number: usize) -> Result<SourceCommand> {
    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };
    if !name.chars().all(|c| c.is_ascii_alphabetic()) {
        bail!("invalid directive name '{name}'");
    }

    let (args, json) = if rest.starts_with('[') {
        let args: Vec<String> = serde_json::from_str(rest)
            .with_context(|| format!("invalid JSON argument list for {name}"))?;
        (args, true)
    } else {
        // Shell-form RUN lines may contain unbalanced quotes; fall back to
        // whitespace splitting since those commands only use the raw text.
        let args = shell_words::split(rest)
            .unwrap_or_else(|_| rest.split_whitespace().map(str::to_string).collect());
        (args, false)
    };

    Ok(SourceCommand {
        name: name.to_lowercase(),
        args,
        rest: rest.to_string(),
        json,
        original: line.to_string(),
        line: line_number,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_simple_lines() {
        let commands = parse("FROM busybox\nRUN touch /t\n").unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].name, "from");
        assert_eq!(commands[0].args, vec!["busybox"]);
        assert_eq!(commands[1].name, "run");
        assert_eq!(commands[1].rest, "touch /t");
    }

    #[test]
    fn skips_comments_and_blanks() {
        let commands = parse("# header\n\nFROM busybox\n  # indented comment\n").unwrap();
        assert_eq!(commands.len(), 1);
    }

    #[test]
    fn joins_continuations() {
        let commands = parse("RUN apt-get update && \\\n    apt-get install -y curl\n").unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0].rest,
            "apt-get update && apt-get install -y curl"
        );
    }

    #[test]
    fn comment_inside_continuation() {
        let commands = parse("RUN echo a \\\n# not part of the command\n  echo b\n").unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].rest, "echo a echo b");
    }

    #[test]
    fn json_array_form() {
        let commands = parse("CMD [\"/bin/sh\", \"-c\", \"echo hi\"]\n").unwrap();
        assert!(commands[0].json);
        assert_eq!(commands[0].args, vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn names_are_case_insensitive() {
        let commands = parse("fRoM busybox\n").unwrap();
        assert_eq!(commands[0].name, "from");
    }

    #[test]
    fn quoted_arguments() {
        let commands = parse("ENV GREETING=\"hello world\"\n").unwrap();
        assert_eq!(commands[0].args, vec!["GREETING=hello world"]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("!!! nope\n").is_err());
    }
}
