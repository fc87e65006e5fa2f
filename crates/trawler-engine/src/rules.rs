//! Ordered filter-rule evaluation.
//!
//! Rules compile once per snapshot; evaluation is pure and deterministic.
//! The first enabled, in-scope, matching rule decides. `NoMatch` is left to
//! the caller's default policy.

use regex::Regex;
use tracing::warn;

use trawler_config::{FilterRule, MatchField, PatternType};
use trawler_core::model::DiscountLevel;

/// A candidate as the rule engine sees it.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    /// Site the candidate was observed on.
    pub site_id: &'a str,
    /// Subscription the candidate came through.
    pub subscription: &'a str,
    /// Candidate title.
    pub title: &'a str,
    /// Candidate tag, when one is configured.
    pub tag: Option<&'a str>,
    /// Resolved promotion level.
    pub discount: DiscountLevel,
}

/// Outcome of rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The matched rule accepts the candidate.
    Accept,
    /// The matched rule rejects the candidate (or its free requirement is
    /// unmet).
    Reject,
    /// No rule matched; the caller applies the default policy.
    NoMatch,
}

enum Matcher {
    Keyword(String),
    Pattern(Regex),
}

struct CompiledRule {
    rule: FilterRule,
    matcher: Matcher,
}

/// A compiled, ordered rule set.
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile `rules` in evaluation order. Rules whose pattern fails to
    /// compile are skipped with a warning rather than poisoning the set.
    #[must_use]
    pub fn compile(rules: &[FilterRule]) -> Self {
        let mut ordered: Vec<&FilterRule> = rules.iter().collect();
        ordered.sort_by_key(|rule| (rule.priority, rule.id));

        let compiled = ordered
            .into_iter()
            .filter_map(|rule| {
                let matcher = match rule.pattern_type {
                    PatternType::Keyword => Matcher::Keyword(rule.pattern.to_lowercase()),
                    PatternType::Wildcard => {
                        match Regex::new(&wildcard_to_regex(&rule.pattern)) {
                            Ok(regex) => Matcher::Pattern(regex),
                            Err(error) => {
                                warn!(rule = %rule.name, error = %error, "skipping rule with uncompilable wildcard");
                                return None;
                            }
                        }
                    }
                    PatternType::Regex => {
                        match Regex::new(&format!("^(?:{})$", rule.pattern)) {
                            Ok(regex) => Matcher::Pattern(regex),
                            Err(error) => {
                                warn!(rule = %rule.name, error = %error, "skipping rule with uncompilable regex");
                                return None;
                            }
                        }
                    }
                };
                Some(CompiledRule {
                    rule: rule.clone(),
                    matcher,
                })
            })
            .collect();
        Self { rules: compiled }
    }

    /// Number of usable rules in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set holds no usable rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate the first enabled, in-scope, matching rule.
    #[must_use]
    pub fn decide(&self, candidate: &Candidate<'_>) -> Verdict {
        for compiled in &self.rules {
            let rule = &compiled.rule;
            if !rule.enabled {
                continue;
            }
            if rule
                .scope_site
                .as_deref()
                .is_some_and(|scope| scope != candidate.site_id)
            {
                continue;
            }
            if rule
                .scope_rss
                .as_deref()
                .is_some_and(|scope| scope != candidate.subscription)
            {
                continue;
            }
            if !field_matches(compiled, candidate) {
                continue;
            }
            if rule.require_free && !candidate.discount.is_free() {
                return Verdict::Reject;
            }
            return Verdict::Accept;
        }
        Verdict::NoMatch
    }
}

fn field_matches(compiled: &CompiledRule, candidate: &Candidate<'_>) -> bool {
    let title = matches_text(&compiled.matcher, candidate.title);
    let tag = candidate
        .tag
        .is_some_and(|tag| matches_text(&compiled.matcher, tag));
    match compiled.rule.match_field {
        MatchField::Title => title,
        MatchField::Tag => tag,
        MatchField::Both => title || tag,
    }
}

fn matches_text(matcher: &Matcher, text: &str) -> bool {
    match matcher {
        Matcher::Keyword(needle) => text.to_lowercase().contains(needle),
        Matcher::Pattern(regex) => regex.is_match(text),
    }
}

/// Translate an anchored glob (`*` any run, `?` one char) into a regex,
/// case-insensitive like the keyword matcher.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push_str("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, priority: i32, pattern: &str, kind: PatternType) -> FilterRule {
        FilterRule {
            id,
            name: format!("rule-{id}"),
            pattern: pattern.to_string(),
            pattern_type: kind,
            match_field: MatchField::Title,
            require_free: false,
            scope_site: None,
            scope_rss: None,
            enabled: true,
            priority,
        }
    }

    fn candidate<'a>(title: &'a str, discount: DiscountLevel) -> Candidate<'a> {
        Candidate {
            site_id: "hdsky",
            subscription: "R1",
            title,
            tag: Some("auto"),
            discount,
        }
    }

    #[test]
    fn keyword_matches_case_insensitively() {
        let set = RuleSet::compile(&[rule(1, 0, "ReMuX", PatternType::Keyword)]);
        assert_eq!(
            set.decide(&candidate("Movie.2024.REMUX.mkv", DiscountLevel::None)),
            Verdict::Accept
        );
        assert_eq!(
            set.decide(&candidate("Movie.2024.WEB-DL.mkv", DiscountLevel::None)),
            Verdict::NoMatch
        );
    }

    #[test]
    fn wildcard_is_anchored() {
        let set = RuleSet::compile(&[rule(1, 0, "Movie.*.remux.*", PatternType::Wildcard)]);
        assert_eq!(
            set.decide(&candidate("movie.2024.Remux.mkv", DiscountLevel::None)),
            Verdict::Accept
        );
        // Anchoring: a prefix alone does not match.
        assert_eq!(
            set.decide(&candidate("prefix Movie.2024.remux.mkv", DiscountLevel::None)),
            Verdict::NoMatch
        );

        let single = RuleSet::compile(&[rule(1, 0, "S0?E0?", PatternType::Wildcard)]);
        assert_eq!(
            single.decide(&candidate("S01E02", DiscountLevel::None)),
            Verdict::Accept
        );
        assert_eq!(
            single.decide(&candidate("S011E02", DiscountLevel::None)),
            Verdict::NoMatch
        );
    }

    #[test]
    fn regex_requires_a_full_match() {
        let set = RuleSet::compile(&[rule(1, 0, r".*\.(mkv|iso)", PatternType::Regex)]);
        assert_eq!(
            set.decide(&candidate("Movie.2024.mkv", DiscountLevel::None)),
            Verdict::Accept
        );
        assert_eq!(
            set.decide(&candidate("Movie.2024.mkv.nfo", DiscountLevel::None)),
            Verdict::NoMatch
        );
    }

    #[test]
    fn first_matching_rule_wins_in_priority_then_id_order() {
        let mut reject_free = rule(2, 1, "remux", PatternType::Keyword);
        reject_free.require_free = true;
        let rules = vec![
            rule(5, 10, "remux", PatternType::Keyword),
            reject_free,
        ];
        let set = RuleSet::compile(&rules);

        // Priority 1 (id 2) evaluates before priority 10 (id 5): the
        // require-free rule decides.
        assert_eq!(
            set.decide(&candidate("A.Remux.B", DiscountLevel::None)),
            Verdict::Reject
        );
        assert_eq!(
            set.decide(&candidate("A.Remux.B", DiscountLevel::Free)),
            Verdict::Accept
        );
    }

    #[test]
    fn require_free_accepts_both_full_free_levels() {
        let mut free_only = rule(1, 0, "*", PatternType::Wildcard);
        free_only.require_free = true;
        let set = RuleSet::compile(&[free_only]);

        assert_eq!(
            set.decide(&candidate("anything", DiscountLevel::Free)),
            Verdict::Accept
        );
        assert_eq!(
            set.decide(&candidate("anything", DiscountLevel::DoubleFree)),
            Verdict::Accept
        );
        assert_eq!(
            set.decide(&candidate("anything", DiscountLevel::Percent50)),
            Verdict::Reject
        );
    }

    #[test]
    fn scopes_are_independently_nullable() {
        let mut scoped = rule(1, 0, "remux", PatternType::Keyword);
        scoped.scope_site = Some("hdsky".to_string());
        scoped.scope_rss = Some("R1".to_string());
        let set = RuleSet::compile(&[scoped]);

        assert_eq!(
            set.decide(&candidate("A.Remux.B", DiscountLevel::None)),
            Verdict::Accept
        );

        let other_site = Candidate {
            site_id: "mteam",
            ..candidate("A.Remux.B", DiscountLevel::None)
        };
        assert_eq!(set.decide(&other_site), Verdict::NoMatch);

        let other_feed = Candidate {
            subscription: "R2",
            ..candidate("A.Remux.B", DiscountLevel::None)
        };
        assert_eq!(set.decide(&other_feed), Verdict::NoMatch);
    }

    #[test]
    fn tag_and_both_fields() {
        let mut tag_rule = rule(1, 0, "auto", PatternType::Keyword);
        tag_rule.match_field = MatchField::Tag;
        let set = RuleSet::compile(&[tag_rule]);
        assert_eq!(
            set.decide(&candidate("no-match-title", DiscountLevel::None)),
            Verdict::Accept
        );

        let mut both_rule = rule(1, 0, "remux", PatternType::Keyword);
        both_rule.match_field = MatchField::Both;
        let set = RuleSet::compile(&[both_rule]);
        let no_tag = Candidate {
            tag: None,
            ..candidate("A.Remux.B", DiscountLevel::None)
        };
        assert_eq!(set.decide(&no_tag), Verdict::Accept);
    }

    #[test]
    fn disabled_and_uncompilable_rules_are_skipped() {
        let mut disabled = rule(1, 0, "remux", PatternType::Keyword);
        disabled.enabled = false;
        let broken = rule(2, 1, "(unclosed", PatternType::Regex);
        let set = RuleSet::compile(&[disabled, broken]);
        assert_eq!(set.len(), 1, "broken regex is dropped at compile time");
        assert_eq!(
            set.decide(&candidate("A.Remux.B", DiscountLevel::None)),
            Verdict::NoMatch
        );
    }

    #[test]
    fn decisions_are_deterministic() {
        let rules = vec![
            rule(1, 0, "remux", PatternType::Keyword),
            rule(2, 0, ".*2160p.*", PatternType::Regex),
        ];
        let set = RuleSet::compile(&rules);
        let sample = candidate("Movie.2160p.Remux", DiscountLevel::Free);
        let first = set.decide(&sample);
        for _ in 0..100 {
            assert_eq!(set.decide(&sample), first);
        }
    }
}
