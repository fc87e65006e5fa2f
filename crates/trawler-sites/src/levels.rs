//! Level-ladder resolution.

use chrono::{DateTime, Utc};

use trawler_core::model::UserProfile;

use crate::registry::{LevelRule, Requirement, RequirementGroup};

/// Walk the ladder bottom-up and return the highest level whose
/// requirements the profile satisfies at `now`.
///
/// Rules are AND across groups and OR across a group's alternatives. Where
/// a rung carries date-gated variants, the variant with the latest
/// `effective_from` that is not in the future applies.
#[must_use]
pub fn resolve_level(
    ladder: &[LevelRule],
    profile: &UserProfile,
    now: DateTime<Utc>,
) -> (u32, String) {
    let mut best: (u32, String) = (0, String::new());
    let mut rung = 0_u32;
    loop {
        let Some(rule) = effective_variant(ladder, rung, now) else {
            if ladder.iter().all(|rule| rule.id <= rung) {
                break;
            }
            rung += 1;
            continue;
        };
        if satisfies(rule, profile, now) {
            best = (rule.id, rule.name.clone());
        } else {
            break;
        }
        rung += 1;
    }
    best
}

fn effective_variant(ladder: &[LevelRule], id: u32, now: DateTime<Utc>) -> Option<&LevelRule> {
    ladder
        .iter()
        .filter(|rule| rule.id == id)
        .filter(|rule| rule.effective_from.is_none_or(|from| from <= now))
        .max_by_key(|rule| rule.effective_from)
}

fn satisfies(rule: &LevelRule, profile: &UserProfile, now: DateTime<Utc>) -> bool {
    rule.requirements
        .iter()
        .all(|group| group_satisfied(group, profile, now))
}

fn group_satisfied(group: &RequirementGroup, profile: &UserProfile, now: DateTime<Utc>) -> bool {
    group
        .any
        .iter()
        .any(|requirement| requirement_satisfied(*requirement, profile, now))
}

fn requirement_satisfied(
    requirement: Requirement,
    profile: &UserProfile,
    now: DateTime<Utc>,
) -> bool {
    match requirement {
        Requirement::UploadedAtLeast(bytes) => profile.uploaded_bytes >= bytes,
        Requirement::RatioAtLeast(ratio) => profile.ratio >= ratio,
        Requirement::BonusAtLeast(bonus) => profile.bonus >= bonus,
        Requirement::AgeAtLeastWeeks(weeks) => profile.join_date.is_some_and(|joined| {
            (now - joined).num_weeks() >= i64::from(weeks)
        }),
        Requirement::SeedingSizeAtLeast(bytes) => profile.seeding_size_bytes >= bytes,
    }
}
