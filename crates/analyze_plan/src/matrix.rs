//! The per-source card matrix: available cards with their dependencies,
//! priority, and default concurrency group. This is explicitly external
//! input data — the default matrix shipped here, ported from
//! `analyze/rules.py`, is a usable fixture for tests and standalone runs,
//! not authoritative business logic.

use std::collections::HashMap;

/// One entry in a source's card matrix.
#[derive(Debug, Clone)]
pub struct CardDef {
    pub card_type: String,
    pub depends_on: Vec<String>,
    pub priority: i32,
    pub concurrency_group: Option<String>,
}

impl CardDef {
    pub fn new(card_type: &str, depends_on: &[&str], priority: i32) -> Self {
        Self {
            card_type: card_type.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            priority,
            concurrency_group: None,
        }
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.concurrency_group = Some(group.to_string());
        self
    }
}

/// A source's full set of card definitions, plus a lookup for defs not in
/// the matrix.
#[derive(Debug, Clone, Default)]
pub struct CardMatrix {
    by_source: HashMap<String, Vec<CardDef>>,
}

impl CardMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: &str, defs: Vec<CardDef>) -> &mut Self {
        self.by_source.insert(source.to_string(), defs);
        self
    }

    /// Defs for `source`, sorted ascending by priority (matrix order, used
    /// to order the plan's card list — not the scheduler's dispatch
    /// order, which ranks by priority descending at runtime), falling back
    /// to a minimal `full_report -> summary` pair for unknown sources,
    /// matching `rules.py::_fallback_defs`.
    pub fn defs_for(&self, source: &str) -> Vec<CardDef> {
        let mut defs = self
            .by_source
            .get(source)
            .cloned()
            .unwrap_or_else(|| vec![CardDef::new("full_report", &[], 0), CardDef::new("summary", &["full_report"], 100)]);
        defs.sort_by(|a, b| a.priority.cmp(&b.priority));
        defs
    }
}

/// Built-in default matrix for the sources named in `rules.py`: scholar,
/// github, linkedin, huggingface, twitter, openreview, youtube.
pub fn default_matrix() -> CardMatrix {
    let mut matrix = CardMatrix::new();

    matrix.insert(
        "scholar",
        vec![
            CardDef::new("resource.scholar.page0", &[], 100),
            CardDef::new("resource.scholar.full", &[], 90),
            CardDef::new("resource.scholar.level", &["resource.scholar.full"], 80).with_group("llm"),
            CardDef::new("criticalReview", &["resource.scholar.full"], 75).with_group("llm"),
            CardDef::new("researcherInfo", &["resource.scholar.page0"], 80),
            CardDef::new("publicationStats", &["resource.scholar.full"], 70),
            CardDef::new("publicationInsight", &["resource.scholar.full"], 60),
            CardDef::new("roleModel", &["resource.scholar.full"], 50),
            CardDef::new("closestCollaborator", &["resource.scholar.full"], 40),
            CardDef::new("estimatedSalary", &["resource.scholar.level"], 35),
            CardDef::new("researcherCharacter", &["resource.scholar.level"], 34),
            CardDef::new("paperOfYear", &["resource.scholar.full"], 30),
            CardDef::new("representativePaper", &["resource.scholar.full"], 20),
        ],
    );

    matrix.insert(
        "github",
        vec![
            CardDef::new("resource.github.profile", &[], 100),
            CardDef::new("resource.github.data", &[], 90),
            CardDef::new("resource.github.enrich", &["resource.github.data"], 5).with_group("llm"),
            CardDef::new("profile", &["resource.github.profile"], 30),
            CardDef::new("activity", &["resource.github.data"], 20),
            CardDef::new("repos", &["resource.github.enrich"], 10).with_group("default"),
            CardDef::new("role_model", &["resource.github.enrich"], 40).with_group("default"),
            CardDef::new("roast", &["resource.github.enrich"], 50).with_group("default"),
            CardDef::new("summary", &["resource.github.enrich"], 60).with_group("default"),
        ],
    );

    matrix.insert(
        "linkedin",
        vec![
            CardDef::new("resource.linkedin.preview", &[], 100).with_group("default"),
            CardDef::new("resource.linkedin.raw_profile", &["resource.linkedin.preview"], 0),
            CardDef::new("resource.linkedin.enrich", &["resource.linkedin.raw_profile"], 5).with_group("llm"),
            CardDef::new("profile", &["resource.linkedin.enrich"], 10),
            CardDef::new("skills", &["resource.linkedin.enrich"], 20).with_group("default"),
            CardDef::new("career", &["resource.linkedin.enrich"], 30).with_group("default"),
            CardDef::new("role_model", &["resource.linkedin.enrich"], 40).with_group("default"),
            CardDef::new("money", &["resource.linkedin.enrich"], 50).with_group("default"),
            CardDef::new("roast", &["profile"], 60),
            CardDef::new("summary", &["resource.linkedin.enrich"], 70).with_group("default"),
        ],
    );

    matrix.insert(
        "huggingface",
        vec![
            CardDef::new("full_report", &[], 0),
            CardDef::new("profile", &["full_report"], 10),
            CardDef::new("summary", &["full_report"], 20),
        ],
    );

    matrix.insert(
        "twitter",
        vec![
            CardDef::new("full_report", &[], 0),
            CardDef::new("profile", &["full_report"], 10),
            CardDef::new("stats", &["full_report"], 20),
            CardDef::new("network", &["full_report"], 30),
            CardDef::new("summary", &["full_report"], 40),
        ],
    );

    matrix.insert(
        "openreview",
        vec![
            CardDef::new("full_report", &[], 0),
            CardDef::new("profile", &["full_report"], 10),
            CardDef::new("papers", &["full_report"], 20),
            CardDef::new("summary", &["full_report"], 30),
        ],
    );

    matrix.insert(
        "youtube",
        vec![
            CardDef::new("full_report", &[], 0),
            CardDef::new("profile", &["full_report"], 10),
            CardDef::new("summary", &["full_report"], 20),
        ],
    );

    matrix
}
