//! Command parsing for review comments.
//!
//! A comment is a command when its first whitespace-separated word is either
//! the configured bot trigger (`@autoland try`, `@autoland r+`) or the
//! `@`-mention of an authorized reviewer followed by `r?`
//! (`@alice r? bob`). Everything else is ordinary conversation.

use std::fmt;

use crate::config::ReviewerSet;
use crate::state_machine::state::AttemptMode;

/// A parsed command from a review comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Assign the pull request for review.
    AssignReview {
        /// The reviewer whose mention opened the comment, without the `@`.
        reviewer: String,
        /// Who to assign. `None` means the reviewer claims it themselves.
        target: Option<String>,
    },
    /// Start an integration attempt.
    StartAttempt(AttemptMode),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::AssignReview { reviewer, target } => match target {
                Some(target) => write!(f, "@{} r? {}", reviewer, target),
                None => write!(f, "@{} r?", reviewer),
            },
            Command::StartAttempt(mode) => write!(f, "{}", mode.verb()),
        }
    }
}

/// Result of parsing a comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// Not addressed to the bot; the caller should do nothing.
    NotACommand,
    /// Addressed to the bot but missing the verb (a lone `@autoland`).
    Malformed,
    /// Addressed to the bot with a verb it does not know.
    Unrecognized {
        /// The verb that was attempted.
        attempted: String,
    },
    /// A valid command.
    Command(Command),
}

/// Parse a comment body.
///
/// Tokens are split on any whitespace, so line breaks between the trigger
/// and the verb are tolerated. The trigger comparison is case-insensitive;
/// verbs are matched exactly.
pub fn parse_comment(body: &str, reviewers: &ReviewerSet, bot_trigger: &str) -> ParseResult {
    let mut tokens = body.split_whitespace();

    let Some(trigger) = tokens.next() else {
        return ParseResult::NotACommand;
    };

    let is_bot = trigger.eq_ignore_ascii_case(bot_trigger);
    let is_reviewer = reviewers.is_mention(trigger);
    if !is_bot && !is_reviewer {
        return ParseResult::NotACommand;
    }

    let Some(verb) = tokens.next() else {
        return ParseResult::Malformed;
    };

    // A reviewer's own mention takes precedence so that a reviewer whose
    // login equals the bot trigger can still hand out reviews.
    if is_reviewer && verb == "r?" {
        return ParseResult::Command(Command::AssignReview {
            reviewer: strip_mention(trigger),
            target: tokens.next().map(strip_mention),
        });
    }

    if !is_bot {
        return ParseResult::NotACommand;
    }

    match verb {
        "try" => ParseResult::Command(Command::StartAttempt(AttemptMode::DryRun)),
        "r+" => ParseResult::Command(Command::StartAttempt(AttemptMode::Merge)),
        other => ParseResult::Unrecognized {
            attempted: other.to_string(),
        },
    }
}

fn strip_mention(login: &str) -> String {
    login.trim_start_matches('@').to_string()
}
