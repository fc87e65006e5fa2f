//! Declarative site metadata: the definition schema and the builtin set.
//!
//! Definitions are data, not behaviour. They are built once at startup and
//! read-only afterwards; drivers look up their own definition by site id and
//! fall back to the schema-generic entry.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

use trawler_core::model::{DiscountLevel, SiteSchema};

/// URL templates and selector plans for one site.
#[derive(Debug, Clone)]
pub struct SiteDefinition {
    /// Stable site identifier, or a schema-generic placeholder.
    pub site_id: String,
    /// Display name.
    pub display_name: String,
    /// Tracker software family.
    pub schema: SiteSchema,
    /// Detail page template; `{id}` is replaced by the torrent id.
    pub detail_path: String,
    /// Download template; `{id}` is replaced by the torrent id.
    pub download_path: String,
    /// Selector plan for detail pages (HTML schemas only).
    pub detail_selectors: DetailSelectors,
    /// Ordered steps resolving the account's statistics.
    pub user_info: Vec<UserInfoStep>,
    /// Mapping from markup class / API tag to discount level, first match
    /// wins.
    pub discounts: Vec<(String, DiscountLevel)>,
    /// Promotion ladder, ascending.
    pub levels: Vec<LevelRule>,
    /// Outbound request budget for the fixed-window limiter.
    pub requests_per_window: u32,
    /// Window length for the limiter.
    pub window: Duration,
}

/// CSS selectors used to lift promotion facts off a detail page.
#[derive(Debug, Clone)]
pub struct DetailSelectors {
    /// Element whose `title` attribute carries the tracker-local deadline.
    pub deadline: String,
    /// Element marking a hit-and-run obligation.
    pub hit_and_run: String,
    /// Element whose text carries the payload size, used when the feed did
    /// not.
    pub size: String,
}

/// One step of the user-info extraction plan.
#[derive(Debug, Clone)]
pub struct UserInfoStep {
    /// Path template joined onto the site base URL (HTML schemas) or the
    /// API base (JSON schemas).
    pub path: String,
    /// Field name to selector (HTML) or JSON pointer (API) mapping.
    pub selectors: HashMap<String, String>,
}

/// One rung of a site's promotion ladder, possibly date-gated.
#[derive(Debug, Clone)]
pub struct LevelRule {
    /// Ladder position, ascending.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Instant this variant of the rule took effect; `None` means always.
    pub effective_from: Option<DateTime<Utc>>,
    /// Requirement groups, AND'd together; within a group the alternatives
    /// are OR'd.
    pub requirements: Vec<RequirementGroup>,
}

/// OR-group of alternative requirements.
#[derive(Debug, Clone)]
pub struct RequirementGroup {
    /// Alternatives; one satisfied alternative satisfies the group.
    pub any: Vec<Requirement>,
}

impl RequirementGroup {
    /// Group with a single, non-alternative requirement.
    #[must_use]
    pub fn single(requirement: Requirement) -> Self {
        Self {
            any: vec![requirement],
        }
    }
}

/// One measurable requirement of a level rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Requirement {
    /// Lifetime upload of at least this many bytes.
    UploadedAtLeast(u64),
    /// Share ratio of at least this value.
    RatioAtLeast(f64),
    /// Bonus balance of at least this value.
    BonusAtLeast(f64),
    /// Account age of at least this many weeks.
    AgeAtLeastWeeks(u32),
    /// Actively seeded payload of at least this many bytes.
    SeedingSizeAtLeast(u64),
}

/// Process-wide, immutable definition registry.
pub struct Registry {
    by_site: HashMap<String, SiteDefinition>,
    by_schema: HashMap<SiteSchema, SiteDefinition>,
}

impl Registry {
    /// The registry built from the builtin definition set.
    #[must_use]
    pub fn global() -> &'static Self {
        static REGISTRY: Lazy<Registry> = Lazy::new(Registry::builtin);
        &REGISTRY
    }

    /// Definition for a concrete site id, when one is known.
    #[must_use]
    pub fn get(&self, site_id: &str) -> Option<&SiteDefinition> {
        self.by_site.get(site_id)
    }

    /// Schema-generic fallback definition.
    #[must_use]
    pub fn for_schema(&self, schema: SiteSchema) -> Option<&SiteDefinition> {
        self.by_schema.get(&schema)
    }

    /// Definition for a site, falling back to its schema.
    #[must_use]
    pub fn resolve(&self, site_id: &str, schema: SiteSchema) -> Option<&SiteDefinition> {
        self.get(site_id).or_else(|| self.for_schema(schema))
    }

    fn builtin() -> Self {
        let definitions = builtin_definitions();
        let mut by_site = HashMap::new();
        let mut by_schema = HashMap::new();
        for definition in definitions {
            by_schema
                .entry(definition.schema)
                .or_insert_with(|| definition.clone());
            by_site.insert(definition.site_id.clone(), definition);
        }
        Self { by_site, by_schema }
    }
}

const GIB: u64 = 1_024 * 1_024 * 1_024;
const TIB: u64 = 1_024 * GIB;

fn nexusphp_detail_selectors() -> DetailSelectors {
    DetailSelectors {
        deadline: "h1#top span[title]".to_string(),
        hit_and_run: "img.hitandrun".to_string(),
        size: "td.rowfollow[valign]".to_string(),
    }
}

fn nexusphp_discounts() -> Vec<(String, DiscountLevel)> {
    vec![
        ("pro_free2up".to_string(), DiscountLevel::DoubleFree),
        ("pro_free".to_string(), DiscountLevel::Free),
        ("pro_50pctdown2up".to_string(), DiscountLevel::DoublePercent50),
        ("pro_50pctdown".to_string(), DiscountLevel::Percent50),
        ("pro_30pctdown".to_string(), DiscountLevel::Percent30),
        ("pro_2up".to_string(), DiscountLevel::DoubleUp),
    ]
}

fn nexusphp_user_info(path: &str) -> Vec<UserInfoStep> {
    let mut selectors = HashMap::new();
    selectors.insert("username".to_string(), "a[href*='userdetails'] b".to_string());
    selectors.insert("uploaded".to_string(), "td#outer [title*='uploaded'], font.color_uploaded".to_string());
    selectors.insert("downloaded".to_string(), "font.color_downloaded".to_string());
    selectors.insert("bonus".to_string(), "font.color_bonus".to_string());
    selectors.insert("join_date".to_string(), "td.rowfollow span[title]".to_string());
    vec![UserInfoStep {
        path: path.to_string(),
        selectors,
    }]
}

fn nexusphp_levels() -> Vec<LevelRule> {
    vec![
        LevelRule {
            id: 1,
            name: "User".to_string(),
            effective_from: None,
            requirements: Vec::new(),
        },
        LevelRule {
            id: 2,
            name: "Power User".to_string(),
            effective_from: None,
            requirements: vec![
                RequirementGroup::single(Requirement::UploadedAtLeast(50 * GIB)),
                RequirementGroup::single(Requirement::RatioAtLeast(1.05)),
                RequirementGroup::single(Requirement::AgeAtLeastWeeks(4)),
            ],
        },
        LevelRule {
            id: 3,
            name: "Elite User".to_string(),
            effective_from: None,
            requirements: vec![
                RequirementGroup::single(Requirement::UploadedAtLeast(120 * GIB)),
                RequirementGroup::single(Requirement::RatioAtLeast(1.55)),
                RequirementGroup::single(Requirement::AgeAtLeastWeeks(8)),
            ],
        },
        LevelRule {
            id: 4,
            name: "Crazy User".to_string(),
            effective_from: None,
            requirements: vec![
                RequirementGroup::single(Requirement::UploadedAtLeast(300 * GIB)),
                RequirementGroup::single(Requirement::RatioAtLeast(2.05)),
                RequirementGroup {
                    any: vec![
                        Requirement::BonusAtLeast(100_000.0),
                        Requirement::SeedingSizeAtLeast(2 * TIB),
                    ],
                },
                RequirementGroup::single(Requirement::AgeAtLeastWeeks(15)),
            ],
        },
    ]
}

fn builtin_definitions() -> Vec<SiteDefinition> {
    vec![
        SiteDefinition {
            site_id: "hdsky".to_string(),
            display_name: "HDSky".to_string(),
            schema: SiteSchema::NexusPhp,
            detail_path: "details.php?id={id}&hit=1".to_string(),
            download_path: "download.php?id={id}".to_string(),
            detail_selectors: nexusphp_detail_selectors(),
            user_info: nexusphp_user_info("userdetails.php"),
            discounts: nexusphp_discounts(),
            levels: nexusphp_levels(),
            requests_per_window: 30,
            window: Duration::from_secs(60),
        },
        SiteDefinition {
            site_id: "hddolby".to_string(),
            display_name: "HDDolby".to_string(),
            schema: SiteSchema::HdDolby,
            detail_path: "details.php?id={id}&hit=1".to_string(),
            download_path: "download.php?id={id}".to_string(),
            detail_selectors: nexusphp_detail_selectors(),
            user_info: nexusphp_user_info("userdetails.php"),
            discounts: nexusphp_discounts(),
            levels: nexusphp_levels(),
            requests_per_window: 20,
            window: Duration::from_secs(60),
        },
        SiteDefinition {
            site_id: "rousi".to_string(),
            display_name: "Rousi".to_string(),
            schema: SiteSchema::Rousi,
            detail_path: "details.php?id={id}&hit=1".to_string(),
            download_path: "download.php?id={id}".to_string(),
            detail_selectors: nexusphp_detail_selectors(),
            user_info: nexusphp_user_info("userdetails.php"),
            discounts: nexusphp_discounts(),
            levels: nexusphp_levels(),
            requests_per_window: 20,
            window: Duration::from_secs(60),
        },
        SiteDefinition {
            site_id: "unit3d".to_string(),
            display_name: "Unit3D".to_string(),
            schema: SiteSchema::Unit3d,
            detail_path: "torrents/{id}".to_string(),
            download_path: "torrents/download/{id}".to_string(),
            detail_selectors: DetailSelectors {
                deadline: "span.torrent__freeleech[title]".to_string(),
                hit_and_run: "i.torrent__hit-and-run".to_string(),
                size: "td.torrent__size".to_string(),
            },
            user_info: nexusphp_user_info("users/profile"),
            discounts: vec![
                ("torrent__freeleech-100".to_string(), DiscountLevel::Free),
                ("torrent__freeleech-50".to_string(), DiscountLevel::Percent50),
                ("torrent__double-upload".to_string(), DiscountLevel::DoubleUp),
            ],
            levels: nexusphp_levels(),
            requests_per_window: 20,
            window: Duration::from_secs(60),
        },
        SiteDefinition {
            site_id: "gazelle".to_string(),
            display_name: "Gazelle".to_string(),
            schema: SiteSchema::Gazelle,
            detail_path: "torrents.php?torrentid={id}".to_string(),
            download_path: "torrents.php?action=download&id={id}".to_string(),
            detail_selectors: DetailSelectors {
                deadline: "strong.freeleech[title]".to_string(),
                hit_and_run: "span.hnr".to_string(),
                size: "td.number_column".to_string(),
            },
            user_info: nexusphp_user_info("user.php"),
            discounts: vec![
                ("freeleech".to_string(), DiscountLevel::Free),
                ("neutral".to_string(), DiscountLevel::DoubleUp),
            ],
            levels: nexusphp_levels(),
            requests_per_window: 15,
            window: Duration::from_secs(60),
        },
        SiteDefinition {
            site_id: "mteam".to_string(),
            display_name: "M-Team".to_string(),
            schema: SiteSchema::MTorrent,
            detail_path: "torrent/detail".to_string(),
            download_path: "torrent/genDlToken".to_string(),
            detail_selectors: DetailSelectors {
                deadline: String::new(),
                hit_and_run: String::new(),
                size: String::new(),
            },
            user_info: vec![UserInfoStep {
                path: "member/profile".to_string(),
                selectors: HashMap::new(),
            }],
            discounts: vec![
                ("FREE".to_string(), DiscountLevel::Free),
                ("_2X_FREE".to_string(), DiscountLevel::DoubleFree),
                ("_2X".to_string(), DiscountLevel::DoubleUp),
                ("PERCENT_70".to_string(), DiscountLevel::Percent30),
                ("_2X_PERCENT_50".to_string(), DiscountLevel::DoublePercent50),
                ("PERCENT_50".to_string(), DiscountLevel::Percent50),
            ],
            levels: mteam_levels(),
            requests_per_window: 15,
            window: Duration::from_secs(60),
        },
    ]
}

fn mteam_levels() -> Vec<LevelRule> {
    // The ladder tightened in 2023; resolution always selects the latest
    // variant in effect at evaluation time, so the pre-2023 rules only
    // apply when resolving against an instant before the gate.
    let tightened = chrono::DateTime::parse_from_rfc3339("2023-10-01T00:00:00+08:00")
        .map(|instant| instant.with_timezone(&Utc))
        .ok();
    vec![
        LevelRule {
            id: 1,
            name: "User".to_string(),
            effective_from: None,
            requirements: Vec::new(),
        },
        LevelRule {
            id: 2,
            name: "Power User".to_string(),
            effective_from: None,
            requirements: vec![
                RequirementGroup::single(Requirement::UploadedAtLeast(200 * GIB)),
                RequirementGroup::single(Requirement::RatioAtLeast(2.0)),
                RequirementGroup::single(Requirement::AgeAtLeastWeeks(5)),
            ],
        },
        LevelRule {
            id: 3,
            name: "Elite User".to_string(),
            effective_from: tightened,
            requirements: vec![
                RequirementGroup::single(Requirement::UploadedAtLeast(TIB)),
                RequirementGroup::single(Requirement::RatioAtLeast(3.0)),
                RequirementGroup {
                    any: vec![
                        Requirement::BonusAtLeast(200_000.0),
                        Requirement::SeedingSizeAtLeast(5 * TIB),
                    ],
                },
                RequirementGroup::single(Requirement::AgeAtLeastWeeks(10)),
            ],
        },
        LevelRule {
            id: 3,
            name: "Elite User".to_string(),
            effective_from: None,
            requirements: vec![
                RequirementGroup::single(Requirement::UploadedAtLeast(500 * GIB)),
                RequirementGroup::single(Requirement::RatioAtLeast(3.0)),
                RequirementGroup::single(Requirement::AgeAtLeastWeeks(10)),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_known_sites_and_schemas() {
        let registry = Registry::global();
        assert!(registry.get("hdsky").is_some());
        assert!(registry.get("mteam").is_some());
        assert!(registry.get("unknown-site").is_none());

        let fallback = registry
            .resolve("brand-new-nexus", SiteSchema::NexusPhp)
            .expect("schema fallback");
        assert_eq!(fallback.schema, SiteSchema::NexusPhp);
    }

    #[test]
    fn discount_mapping_orders_compound_classes_first() {
        let registry = Registry::global();
        let hdsky = registry.get("hdsky").expect("hdsky definition");
        let free2up_index = hdsky
            .discounts
            .iter()
            .position(|(class, _)| class == "pro_free2up")
            .expect("compound class present");
        let free_index = hdsky
            .discounts
            .iter()
            .position(|(class, _)| class == "pro_free")
            .expect("free class present");
        assert!(
            free2up_index < free_index,
            "substring classes must be checked after their compounds"
        );
    }

    #[test]
    fn every_definition_carries_a_positive_request_budget() {
        let registry = Registry::global();
        for site_id in ["hdsky", "hddolby", "rousi", "unit3d", "gazelle", "mteam"] {
            let definition = registry.get(site_id).expect("builtin definition");
            assert!(definition.requests_per_window > 0);
            assert!(definition.window.as_secs() > 0);
        }
    }
}
