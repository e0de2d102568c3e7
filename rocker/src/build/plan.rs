//! The plan compiler.
//!
//! Turns the ordered directive list into a flat list of executable steps,
//! inserting commit markers where accumulated configuration must be
//! materialized as a snapshot and cleanup markers at stage boundaries.

use super::commands::Command;

/// Directives that need a clean snapshot before they run.
const COMMIT_BEFORE: &[&str] = &[
    "run", "attach", "add", "copy", "tag", "push", "export", "import",
];
/// Directives whose effect is committed immediately after they run.
const COMMIT_AFTER: &[&str] = &["run", "attach", "add", "copy", "export", "import"];
/// Directives that leave the dirty flag untouched.
const NEVER_AFTER: &[&str] = &["from", "maintainer", "tag", "push"];
/// Directives after which a stage counts as tagged for cleanup purposes.
const TAGGING: &[&str] = &["tag", "push", "from"];

#[derive(Debug)]
pub(crate) enum Step {
    Command(Command),
    /// Commit accumulated changes, if any.
    Commit,
    /// Reset the stage; `tagged` suppresses removal of the stage image and
    /// `is_final` preserves the final image id.
    Cleanup { is_final: bool, tagged: bool },
}

pub(crate) fn compile(commands: Vec<Command>, final_cleanup: bool) -> Vec<Step> {
    let mut steps = Vec::with_capacity(commands.len() * 2);
    let mut committed = true;
    let mut seen_from = false;
    let mut previous: Option<String> = None;

    for command in commands {
        let name = command.name().to_string();

        if name == "from" {
            if seen_from {
                if !committed {
                    steps.push(Step::Commit);
                    committed = true;
                }
                steps.push(Step::Cleanup {
                    is_final: false,
                    tagged: was_tagging(&previous),
                });
            }
            seen_from = true;
        }

        push_with_markers(&mut steps, command, &name, &mut committed);
        previous = Some(name);
    }

    if !committed {
        steps.push(Step::Commit);
    }
    if final_cleanup {
        steps.push(Step::Cleanup {
            is_final: true,
            tagged: was_tagging(&previous),
        });
    }
    steps
}

/// Compile a spliced fragment (ONBUILD triggers) without end-of-input
/// handling. The fragment conservatively assumes a dirty state, which at
/// worst inserts a commit marker that no-ops.
pub(crate) fn compile_fragment(commands: Vec<Command>) -> Vec<Step> {
    let mut steps = Vec::with_capacity(commands.len() * 2);
    let mut committed = false;
    for command in commands {
        let name = command.name().to_string();
        push_with_markers(&mut steps, command, &name, &mut committed);
    }
    steps
}

fn push_with_markers(steps: &mut Vec<Step>, command: Command, name: &str, committed: &mut bool) {
    if COMMIT_BEFORE.contains(&name) && !*committed {
        steps.push(Step::Commit);
        *committed = true;
    }
    steps.push(Step::Command(command));
    if COMMIT_AFTER.contains(&name) {
        steps.push(Step::Commit);
        *committed = true;
    } else if !NEVER_AFTER.contains(&name) {
        *committed = false;
    }
}

fn was_tagging(previous: &Option<String>) -> bool {
    previous
        .as_deref()
        .map(|name| TAGGING.contains(&name))
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::build::commands::parse_commands;
    use crate::parser;

    fn steps_of(content: &str, final_cleanup: bool) -> Vec<String> {
        let commands = parse_commands(parser::parse(content).unwrap()).unwrap();
        compile(commands, final_cleanup)
            .iter()
            .map(|step| match step {
                Step::Command(command) => command.name().to_string(),
                Step::Commit => "<commit>".to_string(),
                Step::Cleanup { is_final, tagged } => {
                    format!("<cleanup final={is_final} tagged={tagged}>")
                }
            })
            .collect()
    }

    #[test]
    fn run_commits_after() {
        assert_eq!(
            steps_of("FROM busybox\nRUN touch /t\n", false),
            vec!["from", "run", "<commit>"]
        );
    }

    #[test]
    fn config_directives_flush_before_run() {
        assert_eq!(
            steps_of("FROM busybox\nENV A=1\nEXPOSE 80\nRUN true\n", false),
            vec!["from", "env", "expose", "<commit>", "run", "<commit>"]
        );
    }

    #[test]
    fn trailing_config_commits_at_end() {
        assert_eq!(
            steps_of("FROM busybox\nENV A=1\n", false),
            vec!["from", "env", "<commit>"]
        );
    }

    #[test]
    fn tag_flushes_but_does_not_dirty() {
        assert_eq!(
            steps_of("FROM busybox\nENV A=1\nTAG app:1\n", false),
            vec!["from", "env", "<commit>", "tag"]
        );
    }

    #[test]
    fn second_from_cleans_up_previous_stage() {
        assert_eq!(
            steps_of("FROM busybox\nRUN true\nFROM alpine\nRUN false\n", false),
            vec![
                "from",
                "run",
                "<commit>",
                "<cleanup final=false tagged=false>",
                "from",
                "run",
                "<commit>",
            ]
        );
    }

    #[test]
    fn dirty_state_flushes_before_stage_cleanup() {
        assert_eq!(
            steps_of("FROM busybox\nENV A=1\nFROM alpine\n", false),
            vec![
                "from",
                "env",
                "<commit>",
                "<cleanup final=false tagged=false>",
                "from",
            ]
        );
    }

    #[test]
    fn tagged_stage_cleanup() {
        assert_eq!(
            steps_of("FROM busybox\nRUN true\nTAG app:1\nFROM alpine\n", true),
            vec![
                "from",
                "run",
                "<commit>",
                "tag",
                "<cleanup final=false tagged=true>",
                "from",
                "<cleanup final=true tagged=true>"
            ]
        );
    }

    #[test]
    fn fragment_assumes_dirty_state() {
        let commands =
            parse_commands(parser::parse("RUN touch /x\nENV A=1\n").unwrap()).unwrap();
        let rendered: Vec<String> = compile_fragment(commands)
            .iter()
            .map(|step| match step {
                Step::Command(command) => command.name().to_string(),
                Step::Commit => "<commit>".to_string(),
                Step::Cleanup { .. } => "<cleanup>".to_string(),
            })
            .collect();
        assert_eq!(rendered, vec!["<commit>", "run", "<commit>", "env"]);
    }
}
