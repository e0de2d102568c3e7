//! Shell-style variable expansion for directives that accept `$VAR`.

use std::collections::BTreeMap;

/// Expand `$NAME` and `${NAME}` from the given environment. Undefined
/// variables expand to the empty string. A backslash escapes the following
/// character, and text in single quotes is left alone.
pub(crate) fn expand(input: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_single_quotes = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single_quotes => {
                if let Some(next) = chars.next() {
                    if next != '$' {
                        out.push('\\');
                    }
                    out.push(next);
                } else {
                    out.push('\\');
                }
            }
            '\'' => {
                in_single_quotes = !in_single_quotes;
                out.push(c);
            }
            '$' if !in_single_quotes => {
                let name = if chars.peek() == Some(&'{') {
                    chars.next();
                    let mut name = String::new();
                    for c in chars.by_ref() {
                        if c == '}' {
                            break;
                        }
                        name.push(c);
                    }
                    name
                } else {
                    let mut name = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            name.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    name
                };
                if name.is_empty() {
                    out.push('$');
                } else if let Some(value) = env.get(&name) {
                    out.push_str(value);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn plain_and_braced() {
        let e = env(&[("NAME", "world")]);
        assert_eq!(expand("hello $NAME", &e), "hello world");
        assert_eq!(expand("hello ${NAME}!", &e), "hello world!");
    }

    #[test]
    fn undefined_is_empty() {
        assert_eq!(expand("a $MISSING b", &env(&[])), "a  b");
    }

    #[test]
    fn escapes_and_quotes() {
        let e = env(&[("V", "x")]);
        assert_eq!(expand(r"\$V", &e), "$V");
        assert_eq!(expand("'$V'", &e), "'$V'");
        assert_eq!(expand("\"$V\"", &e), "\"x\"");
    }

    #[test]
    fn adjacent_text() {
        let e = env(&[("DIR", "/opt")]);
        assert_eq!(expand("${DIR}/bin", &e), "/opt/bin");
    }
}
