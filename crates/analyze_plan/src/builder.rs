//! `build_plan`: transitive closure over `depends_on`, preserving matrix
//! order, with unknown requested card types appended verbatim at the end.
//! Ported from `rules.py`'s `normalize_cards`/`build_plan`.

use std::collections::{HashMap, HashSet};

use analyze_protocol::CardSpec;

use crate::matrix::{CardDef, CardMatrix};

fn default_concurrency_group(source: &str, card_type: &str) -> String {
    let source = source.trim().to_ascii_lowercase();
    if card_type.starts_with("resource.") {
        return match source.as_str() {
            "github" => "github_api",
            "scholar" => "crawlbase",
            "linkedin" => "apify",
            _ => "resource",
        }
        .to_string();
    }
    const AI_CARDS: &[&str] = &[
        "repos",
        "role_model",
        "roast",
        "summary",
        "news",
        "level",
        "skills",
        "career",
        "money",
    ];
    if AI_CARDS.contains(&card_type) {
        return "llm".to_string();
    }
    "default".to_string()
}

/// Depth-first closure over requested card types and their transitive
/// dependencies, preserving matrix order; unrecognized requested types are
/// appended verbatim at the end in request order.
pub fn normalize_cards(matrix: &CardMatrix, source: &str, requested: Option<&[String]>) -> Vec<String> {
    let defs = matrix.defs_for(source);
    let Some(requested) = requested else {
        return defs.iter().map(|d| d.card_type.clone()).collect();
    };

    let available: HashMap<&str, &CardDef> = defs.iter().map(|d| (d.card_type.as_str(), d)).collect();
    let requested_clean: Vec<&str> = requested.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();

    let mut include: HashSet<String> = HashSet::new();

    fn add_card(
        card_type: &str,
        available: &HashMap<&str, &CardDef>,
        include: &mut HashSet<String>,
    ) {
        if include.contains(card_type) {
            return;
        }
        include.insert(card_type.to_string());
        if let Some(def) = available.get(card_type) {
            for dep in &def.depends_on {
                add_card(dep, available, include);
            }
        }
    }

    for card in &requested_clean {
        add_card(card, &available, &mut include);
    }

    let mut ordered: Vec<String> = defs
        .iter()
        .filter(|d| include.contains(&d.card_type))
        .map(|d| d.card_type.clone())
        .collect();

    for extra in &requested_clean {
        if !available.contains_key(extra) && !ordered.iter().any(|c| c == extra) {
            ordered.push(extra.to_string());
        }
    }
    ordered
}

/// Expand `(source, requested_cards)` into an ordered list of `CardSpec`,
/// one per card in `normalize_cards`' output. Cards outside the matrix
/// default to `depends_on = ["full_report"]`, matching `rules.py`.
pub fn build_plan(matrix: &CardMatrix, source: &str, requested: Option<&[String]>) -> Vec<CardSpec> {
    let defs = matrix.defs_for(source);
    let lookup: HashMap<&str, &CardDef> = defs.iter().map(|d| (d.card_type.as_str(), d)).collect();
    let cards = normalize_cards(matrix, source, requested);

    cards
        .into_iter()
        .map(|card_type| {
            let def = lookup.get(card_type.as_str());
            let depends_on = def
                .map(|d| d.depends_on.clone())
                .unwrap_or_else(|| vec!["full_report".to_string()]);
            let priority = def.map(|d| d.priority).unwrap_or(0);
            let concurrency_group = def
                .and_then(|d| d.concurrency_group.clone())
                .unwrap_or_else(|| default_concurrency_group(source, &card_type));
            CardSpec {
                card_type,
                depends_on,
                priority,
                concurrency_group,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::default_matrix;

    #[test]
    fn unrequested_plan_returns_full_matrix_in_order() {
        let matrix = default_matrix();
        let plan = build_plan(&matrix, "github", None);
        let types: Vec<_> = plan.iter().map(|c| c.card_type.as_str()).collect();
        assert!(types.contains(&"resource.github.profile"));
        assert!(types.contains(&"summary"));
    }

    #[test]
    fn requested_cards_pull_in_transitive_deps() {
        let matrix = default_matrix();
        let plan = build_plan(&matrix, "github", Some(&["repos".to_string()]));
        let types: Vec<_> = plan.iter().map(|c| c.card_type.clone()).collect();
        assert!(types.contains(&"repos".to_string()));
        assert!(types.contains(&"resource.github.enrich".to_string()));
        assert!(types.contains(&"resource.github.data".to_string()));
        assert!(!types.contains(&"profile".to_string()));
    }

    #[test]
    fn unknown_requested_card_is_appended_verbatim() {
        let matrix = default_matrix();
        let plan = build_plan(&matrix, "github", Some(&["mystery_card".to_string()]));
        assert_eq!(plan.last().unwrap().card_type, "mystery_card");
        assert_eq!(plan.last().unwrap().depends_on, vec!["full_report".to_string()]);
    }

    #[test]
    fn unknown_source_falls_back_to_minimal_pair() {
        let matrix = default_matrix();
        let plan = build_plan(&matrix, "mystery_source", None);
        let types: Vec<_> = plan.iter().map(|c| c.card_type.as_str()).collect();
        assert_eq!(types, vec!["full_report", "summary"]);
    }

    #[test]
    fn resource_cards_default_to_per_source_group() {
        let matrix = default_matrix();
        let plan = build_plan(&matrix, "scholar", None);
        let page0 = plan.iter().find(|c| c.card_type == "resource.scholar.page0").unwrap();
        assert_eq!(page0.concurrency_group, "crawlbase");
    }
}
