//! Vocabulary for free-form human answers.

const AFFIRMATIVE: &[&str] = &[
    "", "y", "yes", "ok", "okay", "sure", "continue", "go", "go ahead", "proceed", "done", "yep",
];
const NEGATIVE: &[&str] = &["n", "no", "nope", "skip", "stop", "cancel", "abort"];

fn normalize(answer: &str) -> String {
    answer
        .trim()
        .trim_end_matches(['.', '!'])
        .to_ascii_lowercase()
}

/// True for answers that mean "go ahead". An empty answer counts as yes.
pub fn is_affirmative(answer: &str) -> bool {
    AFFIRMATIVE.contains(&normalize(answer).as_str())
}

pub fn is_negative(answer: &str) -> bool {
    NEGATIVE.contains(&normalize(answer).as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_common_yes_forms_are_affirmative() {
        for answer in ["", "  ", "Y", "yes.", "Continue", "ok!"] {
            assert!(is_affirmative(answer), "{answer:?}");
        }
    }

    /// Verifies a bug report is neither a yes nor a no.
    #[test]
    fn free_text_is_neither() {
        let report = "the page renders blank";
        assert!(!is_affirmative(report));
        assert!(!is_negative(report));
        assert!(is_negative("No"));
    }
}
