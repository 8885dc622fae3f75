use twig_llm::{AssistantPart, ImagePart, Message, TextPart, UserPart};

use crate::part::Part;
use crate::tree::{Branch, Role};

/// Turn the active versions of `branches` into provider messages. Branches
/// without visible content (an unanswered placeholder, for instance) are
/// skipped.
pub(crate) fn to_messages<'a>(branches: impl IntoIterator<Item = &'a Branch>) -> Vec<Message> {
    branches.into_iter().filter_map(to_message).collect()
}

fn to_message(branch: &Branch) -> Option<Message> {
    let parts = branch
        .current_version()
        .parts()
        .iter()
        .filter(|part| !part.is_blank());

    let message = match branch.role() {
        Role::User => Message::User {
            parts: parts
                .map(|part| match part {
                    Part::Text { text } => UserPart::Text(TextPart { text: text.clone() }),
                    Part::Image { url } => UserPart::Image(ImagePart { url: url.clone() }),
                })
                .collect(),
        },
        Role::Model => Message::Assistant {
            parts: parts
                .map(|part| match part {
                    Part::Text { text } => AssistantPart::Text(TextPart { text: text.clone() }),
                    Part::Image { url } => AssistantPart::Image(ImagePart { url: url.clone() }),
                })
                .collect(),
        },
    };

    let empty = match &message {
        Message::User { parts } => parts.is_empty(),
        Message::Assistant { parts } => parts.is_empty(),
    };
    (!empty).then_some(message)
}
