use std::fmt::Write as _;

use twig_core::{ConversationSummary, ConversationTree, Part, Role};

const TIMESTAMP_WIDTH: usize = 13;

/// One line per conversation: id, update time, flags and title.
pub fn summary_line(summary: &ConversationSummary) -> String {
    let title = summary.title.as_deref().unwrap_or("(untitled)");
    let flag = if summary.has_error { " !" } else { "" };
    format!(
        "{}  {:>width$}  {}{}",
        summary.id,
        summary.updated_at_ms,
        title,
        flag,
        width = TIMESTAMP_WIDTH
    )
}

/// The current path of `tree`, one block per branch. Branches with more than
/// one version show which one is active.
pub fn transcript(tree: &ConversationTree) -> String {
    let mut out = String::new();
    for branch in tree.path_branches() {
        let role = match branch.role() {
            Role::User => "user",
            Role::Model => "model",
        };
        if branch.version_count() > 1 {
            let _ = writeln!(
                out,
                "[{role} {}/{}]",
                branch.current_version_index() + 1,
                branch.version_count()
            );
        } else {
            let _ = writeln!(out, "[{role}]");
        }

        for part in branch.current_version().parts() {
            match part {
                Part::Text { text } if text.is_empty() => {}
                Part::Text { text } => {
                    let _ = writeln!(out, "{text}");
                }
                Part::Image { url } => {
                    let _ = writeln!(out, "<image {url}>");
                }
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use twig_core::ConversationRecord;

    use super::*;

    #[test]
    fn transcript_marks_alternative_versions() {
        let mut record = ConversationRecord::new("test-model");
        let user = record
            .add_branch(Role::User, vec![Part::text("draw a cat")])
            .expect("user");
        record
            .add_branch(Role::Model, vec![Part::image("cat.png"), Part::text("here")])
            .expect("model");
        record
            .add_version(&user, vec![Part::text("draw a dog")], false)
            .expect("edit");

        assert_eq!(transcript(record.tree()), "[user 2/2]\ndraw a dog\n\n");

        record.switch_version(&user, -1).expect("switch");
        assert_eq!(
            transcript(record.tree()),
            "[user 1/2]\ndraw a cat\n\n[model]\n<image cat.png>\nhere\n\n"
        );
    }

    #[test]
    fn summary_line_flags_errors() {
        let summary = ConversationSummary {
            id: "conv_1".into(),
            title: None,
            model: "m".into(),
            project_id: None,
            has_error: true,
            created_at_ms: 0,
            updated_at_ms: 42,
        };
        let line = summary_line(&summary);
        assert!(line.starts_with("conv_1"));
        assert!(line.ends_with("(untitled) !"));
    }
}
