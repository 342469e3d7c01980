//! Narrative Quality Scoring
//!
//! Deterministic, pure checks applied to every generated story beat before
//! the router accepts it. No I/O and no randomness, so the same content and
//! constraints always produce the same [`QualityScore`].
//!
//! ## Checks (in order)
//!
//! 1. `EmptyContent`: text empty or whitespace only
//! 2. `TooShort` / `TooLong`: character count outside `[min_length, max_length]`
//! 3. `DisallowedContent`: a denylist pattern matches, or an emoji is present
//!    while `reject_emoji` is set
//! 4. `MissingTerminalMarker`: trimmed text does not end with a configured marker

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ai::provider::GeneratedContent;
use crate::config::QualityConfig;
use crate::types::{Result, TaleError};

/// Whether scoring stops at the first issue or reports all of them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    #[default]
    FailFast,
    Diagnostic,
}

/// A single quality problem found in generated content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueTag {
    EmptyContent,
    TooShort,
    TooLong,
    DisallowedContent,
    MissingTerminalMarker,
}

impl std::fmt::Display for IssueTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyContent => write!(f, "EMPTY_CONTENT"),
            Self::TooShort => write!(f, "TOO_SHORT"),
            Self::TooLong => write!(f, "TOO_LONG"),
            Self::DisallowedContent => write!(f, "DISALLOWED_CONTENT"),
            Self::MissingTerminalMarker => write!(f, "MISSING_TERMINAL_MARKER"),
        }
    }
}

/// Scoring verdict. `passed` is true iff `issues` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityScore {
    pub passed: bool,
    pub issues: Vec<IssueTag>,
}

impl QualityScore {
    pub fn pass() -> Self {
        Self {
            passed: true,
            issues: Vec::new(),
        }
    }

    pub fn fail(issues: Vec<IssueTag>) -> Self {
        Self {
            passed: issues.is_empty(),
            issues,
        }
    }

    pub fn has(&self, tag: IssueTag) -> bool {
        self.issues.contains(&tag)
    }
}

/// Compiled constraints. Denylist patterns are compiled once here.
#[derive(Debug, Clone)]
pub struct QualityConstraints {
    pub min_length: usize,
    pub max_length: usize,
    pub terminal_markers: Vec<String>,
    pub denylist: Vec<Regex>,
    pub reject_emoji: bool,
    pub mode: ScoringMode,
}

impl Default for QualityConstraints {
    fn default() -> Self {
        Self {
            min_length: crate::constants::quality::MIN_LENGTH,
            max_length: crate::constants::quality::MAX_LENGTH,
            terminal_markers: crate::constants::quality::TERMINAL_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            denylist: Vec::new(),
            reject_emoji: true,
            mode: ScoringMode::FailFast,
        }
    }
}

impl QualityConstraints {
    pub fn from_config(config: &QualityConfig) -> Result<Self> {
        if config.min_length > config.max_length {
            return Err(TaleError::Config(format!(
                "quality.min_length ({}) exceeds quality.max_length ({})",
                config.min_length, config.max_length
            )));
        }

        let denylist = config
            .denylist
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    TaleError::Config(format!("invalid quality.denylist pattern '{pattern}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            min_length: config.min_length,
            max_length: config.max_length,
            terminal_markers: config.terminal_markers.clone(),
            denylist,
            reject_emoji: config.reject_emoji,
            mode: config.mode,
        })
    }

    pub fn with_mode(mut self, mode: ScoringMode) -> Self {
        self.mode = mode;
        self
    }
}

// =============================================================================
// Scorer
// =============================================================================

pub struct QualityScorer;

impl QualityScorer {
    pub fn score(content: &GeneratedContent, constraints: &QualityConstraints) -> QualityScore {
        let text = content.text.as_str();
        let fail_fast = constraints.mode == ScoringMode::FailFast;
        let mut issues = Vec::new();

        if text.trim().is_empty() {
            issues.push(IssueTag::EmptyContent);
            if fail_fast {
                return QualityScore::fail(issues);
            }
        }

        let length = text.chars().count();
        if length < constraints.min_length {
            issues.push(IssueTag::TooShort);
        } else if length > constraints.max_length {
            issues.push(IssueTag::TooLong);
        }
        if fail_fast && !issues.is_empty() {
            return QualityScore::fail(issues);
        }

        if contains_disallowed(text, constraints) {
            issues.push(IssueTag::DisallowedContent);
            if fail_fast {
                return QualityScore::fail(issues);
            }
        }

        if !ends_with_marker(text, &constraints.terminal_markers) {
            issues.push(IssueTag::MissingTerminalMarker);
        }

        QualityScore::fail(issues)
    }
}

fn contains_disallowed(text: &str, constraints: &QualityConstraints) -> bool {
    if constraints.denylist.iter().any(|re| re.is_match(text)) {
        return true;
    }
    constraints.reject_emoji && text.chars().any(is_emoji)
}

fn ends_with_marker(text: &str, markers: &[String]) -> bool {
    if markers.is_empty() {
        return true;
    }
    let trimmed = text.trim_end();
    markers.iter().any(|marker| trimmed.ends_with(marker.as_str()))
}

/// Unicode blocks treated as emoji
const EMOJI_RANGES: &[(u32, u32)] = &[
    (0x1F000, 0x1FAFF), // pictographs, emoticons, transport, flags, supplemental symbols
    (0x2600, 0x27BF),   // miscellaneous symbols and dingbats
    (0x2B00, 0x2BFF),   // arrows and stars such as U+2B50
    (0x1F1E6, 0x1F1FF), // regional indicators
    (0xFE0F, 0xFE0F),   // emoji presentation selector
];

pub fn is_emoji(c: char) -> bool {
    let code = c as u32;
    EMOJI_RANGES
        .iter()
        .any(|&(start, end)| (start..=end).contains(&code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn content(text: &str) -> GeneratedContent {
        GeneratedContent::new(text, 10, 10)
    }

    fn diagnostic() -> QualityConstraints {
        QualityConstraints::default().with_mode(ScoringMode::Diagnostic)
    }

    #[test]
    fn test_passing_beat() {
        let score = QualityScorer::score(
            &content("The corridor splits. Go left? (Y/N)"),
            &QualityConstraints::default(),
        );
        assert_eq!(score, QualityScore::pass());
    }

    #[test]
    fn test_whitespace_is_empty() {
        let score = QualityScorer::score(&content("   \n"), &QualityConstraints::default());
        assert!(!score.passed);
        assert_eq!(score.issues, vec![IssueTag::EmptyContent]);
    }

    #[test]
    fn test_emoji_is_disallowed() {
        let score = QualityScorer::score(
            &content("A dragon appears \u{1F409} (Y/N)"),
            &QualityConstraints::default(),
        );
        assert!(!score.passed);
        assert_eq!(score.issues, vec![IssueTag::DisallowedContent]);
    }

    #[test]
    fn test_emoji_allowed_when_disabled() {
        let constraints = QualityConstraints {
            reject_emoji: false,
            ..QualityConstraints::default()
        };
        let score = QualityScorer::score(&content("Sun \u{2600} (Y/N)"), &constraints);
        assert!(score.passed);
    }

    #[test]
    fn test_missing_terminal_marker() {
        let score = QualityScorer::score(&content("You wait."), &QualityConstraints::default());
        assert_eq!(score.issues, vec![IssueTag::MissingTerminalMarker]);
    }

    #[test]
    fn test_trailing_whitespace_after_marker() {
        let score = QualityScorer::score(
            &content("The end. (Restart?)  \n"),
            &QualityConstraints::default(),
        );
        assert!(score.passed);
    }

    #[test]
    fn test_empty_marker_list_disables_check() {
        let constraints = QualityConstraints {
            terminal_markers: Vec::new(),
            ..QualityConstraints::default()
        };
        assert!(QualityScorer::score(&content("You wait."), &constraints).passed);
    }

    #[test]
    fn test_length_bounds() {
        let constraints = QualityConstraints {
            min_length: 10,
            max_length: 20,
            terminal_markers: Vec::new(),
            ..QualityConstraints::default()
        };
        assert_eq!(
            QualityScorer::score(&content("short"), &constraints).issues,
            vec![IssueTag::TooShort]
        );
        assert_eq!(
            QualityScorer::score(&content(&"x".repeat(21)), &constraints).issues,
            vec![IssueTag::TooLong]
        );
        assert!(QualityScorer::score(&content(&"x".repeat(20)), &constraints).passed);
    }

    #[test]
    fn test_fail_fast_stops_at_first_issue() {
        let score = QualityScorer::score(
            &content("Boo \u{1F47B}"),
            &QualityConstraints::default(),
        );
        assert_eq!(score.issues, vec![IssueTag::DisallowedContent]);
    }

    #[test]
    fn test_diagnostic_reports_all_issues() {
        let score = QualityScorer::score(&content("Boo \u{1F47B}"), &diagnostic());
        assert_eq!(
            score.issues,
            vec![IssueTag::DisallowedContent, IssueTag::MissingTerminalMarker]
        );

        let empty = QualityScorer::score(&content(""), &diagnostic());
        assert_eq!(
            empty.issues,
            vec![
                IssueTag::EmptyContent,
                IssueTag::TooShort,
                IssueTag::MissingTerminalMarker
            ]
        );
    }

    #[test]
    fn test_denylist_from_config() {
        let config = QualityConfig {
            denylist: vec![r"(?i)\bgore\b".to_string()],
            ..QualityConfig::default()
        };
        let constraints = QualityConstraints::from_config(&config).unwrap();
        let score = QualityScorer::score(&content("Such GORE. (Y/N)"), &constraints);
        assert!(score.has(IssueTag::DisallowedContent));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad_pattern = QualityConfig {
            denylist: vec!["(unclosed".to_string()],
            ..QualityConfig::default()
        };
        assert!(matches!(
            QualityConstraints::from_config(&bad_pattern),
            Err(TaleError::Config(_))
        ));

        let inverted = QualityConfig {
            min_length: 50,
            max_length: 10,
            ..QualityConfig::default()
        };
        assert!(QualityConstraints::from_config(&inverted).is_err());
    }

    proptest! {
        #[test]
        fn prop_scoring_is_deterministic(text in ".{0,200}", diagnostic_mode in any::<bool>()) {
            let mode = if diagnostic_mode { ScoringMode::Diagnostic } else { ScoringMode::FailFast };
            let constraints = QualityConstraints::default().with_mode(mode);
            let generated = content(&text);
            let first = QualityScorer::score(&generated, &constraints);
            let second = QualityScorer::score(&generated, &constraints);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.passed, first.issues.is_empty());
        }
    }
}
