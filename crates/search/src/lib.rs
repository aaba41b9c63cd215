//! Opskit search: resolve a user-supplied name against a candidate universe.
//!
//! Resolution runs an exact phase first, then a three-tier similarity score
//! (equality / substring / subsequence). Ambiguous candidate sets are handed
//! to a caller-supplied [`Chooser`] so this crate stays independent of the
//! console menu that usually backs it. Matching is case-insensitive in both
//! phases.

#![forbid(unsafe_code)]

use tracing::debug;

/// Score awarded for case-insensitive equality; also the auto-resolution bar.
pub const EXACT_SCORE: i64 = 1000;
/// Candidates must score strictly above this to survive the fuzzy phase.
pub const MIN_SCORE: i64 = 100;
/// At most this many candidates are offered for interactive disambiguation.
pub const MAX_CANDIDATES: usize = 10;

/// `(candidate index, score)`. Scores are only comparable within a single
/// resolution call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MatchCandidate {
    pub index: usize,
    pub score: i64,
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Single(usize),
    Multiple(Vec<usize>),
    Canceled,
    NotFound,
}

/// Seam through which ambiguous candidate sets reach an interactive picker.
/// `candidates` are indices into the original slice; the return value is the
/// chosen subset (empty means canceled).
pub trait Chooser {
    fn choose(&mut self, candidates: &[usize], multiple: bool) -> Vec<usize>;
}

/// Similarity of `candidate` against `term` (both compared lowercased):
/// equality scores [`EXACT_SCORE`]; a substring occurrence at char index `i`
/// scores `500 + (100 - i)`; otherwise an in-order character walk awards 10
/// per matched char plus a 5-point adjacency bonus, minus the absolute
/// length difference.
pub fn score(term: &str, candidate: &str) -> i64 {
    let t = term.to_lowercase();
    let c = candidate.to_lowercase();
    if t == c {
        return EXACT_SCORE;
    }
    if let Some(byte_idx) = c.find(&t) {
        let char_idx = c[..byte_idx].chars().count() as i64;
        return 500 + (100 - char_idx);
    }
    let c_chars: Vec<char> = c.chars().collect();
    let mut total = 0i64;
    let mut pos = 0usize;
    let mut last_match: Option<usize> = None;
    for tc in t.chars() {
        if pos >= c_chars.len() {
            break;
        }
        if let Some(off) = c_chars[pos..].iter().position(|&cc| cc == tc) {
            let at = pos + off;
            total += 10;
            if last_match == Some(at.wrapping_sub(1)) {
                total += 5;
            }
            last_match = Some(at);
            pos = at + 1;
        }
    }
    total - (t.chars().count() as i64 - c_chars.len() as i64).abs()
}

/// Strip any path prefix from a search term, leaving the bare name.
pub fn bare_name(term: &str) -> &str {
    term.rsplit(['/', '\\']).next().unwrap_or(term)
}

/// Rank `items` against `term`: keep scores strictly above [`MIN_SCORE`],
/// sort descending with input-order ties (stable), cap at
/// [`MAX_CANDIDATES`].
pub fn rank<T>(term: &str, items: &[T], name_of: impl Fn(&T) -> &str) -> Vec<MatchCandidate> {
    let mut hits: Vec<MatchCandidate> = items
        .iter()
        .enumerate()
        .map(|(index, item)| MatchCandidate { index, score: score(term, name_of(item)) })
        .filter(|m| m.score > MIN_SCORE)
        .collect();
    hits.sort_by(|a, b| b.score.cmp(&a.score));
    hits.truncate(MAX_CANDIDATES);
    metrics::histogram!("resolve_candidates", hits.len() as f64);
    hits
}

/// Resolve `term` against `items`. Exactly one exact match auto-resolves; a
/// top fuzzy score at or above [`EXACT_SCORE`] auto-resolves; everything
/// else ambiguous goes through `chooser`.
pub fn resolve<T>(
    term: &str,
    items: &[T],
    name_of: impl Fn(&T) -> &str,
    multiple: bool,
    chooser: &mut dyn Chooser,
) -> Resolution {
    let bare = bare_name(term);
    // a term like "tests/" strips to nothing; an empty needle is a substring
    // of everything, so bail out before it matches the whole universe
    if bare.is_empty() {
        return Resolution::NotFound;
    }

    let exact: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| name_of(item).to_lowercase() == bare.to_lowercase())
        .map(|(i, _)| i)
        .collect();
    match exact.len() {
        1 => return auto_resolve(exact[0], multiple),
        n if n > 1 => {
            debug!(term = %bare, matches = n, "multiple exact matches; delegating");
            return from_choice(chooser.choose(&exact, multiple), multiple);
        }
        _ => {}
    }

    let hits = rank(bare, items, name_of);
    if hits.is_empty() {
        return Resolution::NotFound;
    }
    if hits[0].score >= EXACT_SCORE {
        return auto_resolve(hits[0].index, multiple);
    }
    let candidates: Vec<usize> = hits.iter().map(|m| m.index).collect();
    from_choice(chooser.choose(&candidates, multiple), multiple)
}

fn auto_resolve(index: usize, multiple: bool) -> Resolution {
    if multiple {
        Resolution::Multiple(vec![index])
    } else {
        Resolution::Single(index)
    }
}

fn from_choice(chosen: Vec<usize>, multiple: bool) -> Resolution {
    if chosen.is_empty() {
        Resolution::Canceled
    } else if multiple {
        Resolution::Multiple(chosen)
    } else {
        Resolution::Single(chosen[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records invocations and replays a canned answer.
    struct ScriptedChooser {
        answer: Vec<usize>,
        calls: Vec<Vec<usize>>,
    }

    impl ScriptedChooser {
        fn answering(answer: Vec<usize>) -> Self {
            Self { answer, calls: Vec::new() }
        }
    }

    impl Chooser for ScriptedChooser {
        fn choose(&mut self, candidates: &[usize], _multiple: bool) -> Vec<usize> {
            self.calls.push(candidates.to_vec());
            self.answer.clone()
        }
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_strings_score_exact_and_maximal() {
        assert_eq!(score("Settings", "Settings"), EXACT_SCORE);
        assert_eq!(score("settings", "SETTINGS"), EXACT_SCORE);
        let universe = ["SettingsHelper", "Settings", "MySettings", "unrelated"];
        let best = universe.iter().map(|c| score("Settings", c)).max().expect("non-empty");
        assert_eq!(best, score("Settings", "Settings"));
    }

    #[test]
    fn substring_scores_decrease_with_start_index() {
        // worked examples: index 0 -> 600, index 2 -> 598
        assert_eq!(score("Settings", "SettingsHelper.Tests.ps1"), 600);
        assert_eq!(score("Settings", "MySettings.Tests.ps1"), 598);
        assert!(score("cfg", "cfg-loader") > score("cfg", "my-cfg-loader"));
    }

    #[test]
    fn subsequence_scoring_skips_unmatched_chars() {
        // term "axc" against "abc": a(10) + c(10), x unmatched, no adjacency,
        // length penalty |3-3| = 0
        assert_eq!(score("axc", "abc"), 20);
    }

    #[test]
    fn subsequence_walk_is_in_order() {
        // term "ba" vs candidate "ab": 'b' matches at 1, 'a' has nothing
        // after position 1 -> one match, penalty 0
        assert_eq!(score("ba", "ab"), 10);
        // adjacency bonus: "ac" vs "xacx": a at 1 (10), c at 2 (10+5), len diff 2
        assert_eq!(score("acq", "xacxq"), 10 + 15 + 10 - 2);
    }

    #[test]
    fn score_can_go_negative() {
        assert!(score("zz", "a-very-long-candidate-name") < 0);
    }

    #[test]
    fn rank_filters_sorts_and_caps() {
        let items = names(&["alpha-config", "config", "beta-config", "zzz"]);
        let hits = rank("config", &items, |s| s.as_str());
        assert_eq!(hits[0].index, 1, "equality outranks substrings");
        assert_eq!(hits[0].score, EXACT_SCORE);
        assert!(hits.iter().all(|h| h.score > MIN_SCORE));
        assert!(!hits.iter().any(|h| h.index == 3), "zzz is below threshold");

        // ties keep input order (stable sort)
        let tied = names(&["xconfigy", "xconfigz"]);
        let hits = rank("config", &tied, |s| s.as_str());
        assert_eq!(hits[0].index, 0);
        assert_eq!(hits[1].index, 1);
        assert_eq!(hits[0].score, hits[1].score);

        // cap at MAX_CANDIDATES
        let many: Vec<String> = (0..25).map(|i| format!("config-{}", i)).collect();
        assert_eq!(rank("config", &many, |s| s.as_str()).len(), MAX_CANDIDATES);
    }

    #[test]
    fn single_exact_match_resolves_without_prompting() {
        let items = names(&["other.rs", "settings.rs", "settings_helper.rs"]);
        let mut chooser = ScriptedChooser::answering(vec![0]);
        let got = resolve("settings.rs", &items, |s| s.as_str(), false, &mut chooser);
        assert_eq!(got, Resolution::Single(1));
        assert!(chooser.calls.is_empty(), "selector must not be invoked");
    }

    #[test]
    fn exact_match_strips_path_prefix() {
        let items = names(&["settings.rs"]);
        let mut chooser = ScriptedChooser::answering(vec![]);
        let got = resolve("tests/unit/settings.rs", &items, |s| s.as_str(), false, &mut chooser);
        assert_eq!(got, Resolution::Single(0));
    }

    #[test]
    fn multiple_exact_matches_delegate_the_exact_subset() {
        let items = names(&["dup.rs", "other.rs", "dup.rs"]);
        let mut chooser = ScriptedChooser::answering(vec![2]);
        let got = resolve("dup.rs", &items, |s| s.as_str(), false, &mut chooser);
        assert_eq!(got, Resolution::Single(2));
        assert_eq!(chooser.calls, vec![vec![0, 2]]);
    }

    #[test]
    fn top_score_at_exact_bar_bypasses_prompt_even_in_multi_mode() {
        // case-insensitive equality resolves without prompting regardless of
        // the multi flag; the chooser must never fire
        let items = names(&["SETTINGS.RS", "settings_helper.rs"]);
        let mut chooser = ScriptedChooser::answering(vec![1]);
        let got = resolve("Settings.rs", &items, |s| s.as_str(), true, &mut chooser);
        assert_eq!(got, Resolution::Multiple(vec![0]));
        assert!(chooser.calls.is_empty());
    }

    #[test]
    fn ambiguous_fuzzy_set_routes_through_chooser() {
        let items = names(&["app_settings.rs", "settings_helper.rs", "zzz.rs"]);
        let mut chooser = ScriptedChooser::answering(vec![0, 1]);
        let got = resolve("settings", &items, |s| s.as_str(), true, &mut chooser);
        assert_eq!(got, Resolution::Multiple(vec![0, 1]));
        assert_eq!(chooser.calls.len(), 1);
        assert!(!chooser.calls[0].contains(&2), "below-threshold candidates excluded");
    }

    #[test]
    fn empty_choice_maps_to_canceled() {
        let items = names(&["app_settings.rs", "settings_helper.rs"]);
        let mut chooser = ScriptedChooser::answering(vec![]);
        let got = resolve("settings", &items, |s| s.as_str(), true, &mut chooser);
        assert_eq!(got, Resolution::Canceled);
    }

    #[test]
    fn term_that_strips_to_nothing_is_not_found() {
        let items = names(&["alpha.rs", "beta.rs"]);
        let mut chooser = ScriptedChooser::answering(vec![0]);
        for term in ["tests/", "a/b/", "", "\\"] {
            let got = resolve(term, &items, |s| s.as_str(), false, &mut chooser);
            assert_eq!(got, Resolution::NotFound, "term {:?}", term);
        }
        assert!(chooser.calls.is_empty(), "selector must not be invoked");
    }

    #[test]
    fn nothing_above_threshold_is_not_found() {
        let items = names(&["alpha.rs", "beta.rs"]);
        let mut chooser = ScriptedChooser::answering(vec![0]);
        let got = resolve("qqqqqq", &items, |s| s.as_str(), false, &mut chooser);
        assert_eq!(got, Resolution::NotFound);
        assert!(chooser.calls.is_empty());
    }
}
