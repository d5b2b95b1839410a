//! Pull request text
//!
//! The description always carries [`FIX_MARKER`]; the dedup check searches
//! upstream issues and pull requests for it.

use rand::seq::IndexedRandom;
use rand::Rng;

pub const FIX_MARKER: &str = "avoid 'master' and 'slave' terminology";

const ACTIONS: &[&str] = &[
    "Removal of",
    "Removing the",
    "Changing the",
    "Discarding the",
    "Discard",
    "Migrate from",
    "Migrating from",
    "Get away from",
];

const PAIRS: &[&str] = &["master/slave", "master-slave", "master and slave"];

const NOUNS: &[&str] = &[
    "terminology",
    "words",
    "jargon",
    "lingo",
    "vocabulary",
    "phrasing",
    "language",
];

/// Title made of one phrase from each word list. Doubles as the commit message.
pub fn generate_title<R: Rng + ?Sized>(rng: &mut R) -> String {
    let pick = |words: &[&'static str], rng: &mut R| -> &'static str {
        words.choose(rng).copied().unwrap_or_default()
    };
    let action = pick(ACTIONS, rng);
    let pair = pick(PAIRS, rng);
    let noun = pick(NOUNS, rng);
    format!("{} {} {}", action, pair, noun)
}

pub fn random_title() -> String {
    generate_title(&mut rand::rng())
}

pub fn description() -> String {
    format!(
        "Hi! This change proposes to {} in this repository, since the terms \
         are associated with slavery and can read as hurtful to contributors. \
         Occurrences were replaced with \"main\" and \"subordinate\" while \
         keeping the original capitalization. URLs and binary files were left \
         untouched.\n\nThanks for considering it. Happy to adjust anything in \
         the patch if you prefer different wording.",
        FIX_MARKER
    )
}
