//! Inline text conventions for reactions and replies.
//!
//! Radios only carry plain text, so reactions and replies ride inside the
//! body: `[R:<id>:<emoji>]` is a reaction to message `<id>`, and
//! `[>:<id>] body` is a reply to it.

use mesh_types::{is_supported_reaction, MessageId};

use crate::DecodeError;

const REACTION_PREFIX: &str = "[R:";
const REPLY_PREFIX: &str = "[>:";

/// A text body after convention parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextBody {
    /// Ordinary text, possibly a reply.
    Message {
        /// Text with any reply prefix removed.
        body: String,
        /// Parent message.
        reply_to: Option<MessageId>,
    },
    /// A reaction.
    Reaction {
        /// Target message.
        target: MessageId,
        /// Emoji.
        emoji: String,
    },
}

/// Split a text payload into its convention.
pub fn parse(text: &str) -> Result<TextBody, DecodeError> {
    if let Some(inner) = text
        .strip_prefix(REACTION_PREFIX)
        .and_then(|rest| rest.strip_suffix(']'))
    {
        let (id, emoji) = inner.split_once(':').ok_or_else(|| malformed("reaction missing emoji"))?;
        let target = parse_id(id)?;
        if !is_supported_reaction(emoji) {
            return Err(DecodeError::UnsupportedReaction(emoji.to_string()));
        }
        return Ok(TextBody::Reaction {
            target,
            emoji: emoji.to_string(),
        });
    }

    if let Some(rest) = text.strip_prefix(REPLY_PREFIX) {
        let (id, body) = rest
            .split_once(']')
            .ok_or_else(|| malformed("unterminated reply prefix"))?;
        let parent = parse_id(id)?;
        let body = body.strip_prefix(' ').unwrap_or(body);
        return Ok(TextBody::Message {
            body: body.to_string(),
            reply_to: Some(parent),
        });
    }

    Ok(TextBody::Message {
        body: text.to_string(),
        reply_to: None,
    })
}

/// Wire text for a reaction.
pub fn format_reaction(target: MessageId, emoji: &str) -> String {
    format!("{}{}:{}]", REACTION_PREFIX, target, emoji)
}

/// Wire text for a message, with a reply prefix when it has a parent.
pub fn format_message(body: &str, reply_to: Option<MessageId>) -> String {
    match reply_to {
        Some(parent) => format!("{}{}] {}", REPLY_PREFIX, parent, body),
        None => body.to_string(),
    }
}

fn parse_id(text: &str) -> Result<MessageId, DecodeError> {
    text.parse::<u32>()
        .map(MessageId::new)
        .map_err(|_| malformed("bad message id"))
}

fn malformed(reason: &str) -> DecodeError {
    DecodeError::Malformed {
        port: "text",
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(
            parse("Hello everyone!").unwrap(),
            TextBody::Message {
                body: "Hello everyone!".into(),
                reply_to: None
            }
        );
    }

    #[test]
    fn reaction_is_recognized() {
        assert_eq!(
            parse("[R:12345:👍]").unwrap(),
            TextBody::Reaction {
                target: MessageId::new(12345),
                emoji: "👍".into()
            }
        );
    }

    #[test]
    fn unsupported_reaction_is_rejected() {
        assert_eq!(
            parse("[R:1:🚀]"),
            Err(DecodeError::UnsupportedReaction("🚀".into()))
        );
    }

    #[test]
    fn bad_reaction_id_is_malformed() {
        assert!(matches!(parse("[R:abc:👍]"), Err(DecodeError::Malformed { .. })));
        assert!(matches!(parse("[R:12]"), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn reply_prefix_is_stripped() {
        assert_eq!(
            parse("[>:77] sounds good").unwrap(),
            TextBody::Message {
                body: "sounds good".into(),
                reply_to: Some(MessageId::new(77))
            }
        );
    }

    #[test]
    fn text_that_only_looks_like_a_prefix() {
        assert!(matches!(parse("[>:77 oops"), Err(DecodeError::Malformed { .. })));
        assert_eq!(
            parse("[R: not closed").unwrap(),
            TextBody::Message {
                body: "[R: not closed".into(),
                reply_to: None
            }
        );
    }

    #[test]
    fn formatting_matches_parsing() {
        let reaction = format_reaction(MessageId::new(9), "❤️");
        assert_eq!(reaction, "[R:9:❤️]");
        assert!(matches!(parse(&reaction).unwrap(), TextBody::Reaction { .. }));

        let reply = format_message("yes", Some(MessageId::new(5)));
        assert_eq!(reply, "[>:5] yes");
        assert_eq!(format_message("yes", None), "yes");
    }
}
