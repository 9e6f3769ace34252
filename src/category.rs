//! Category registry: the closed set of ranking axes and their rank columns.
//!
//! Column identifiers end up interpolated into SQL (`UPDATE courses SET
//! {column} = ?`), so a [`RankColumn`] can only be obtained through
//! [`RankColumn::parse`], which enforces `^[a-z0-9_]+$`. The global registry
//! validates every entry once, the first time it is touched.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static COLUMN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").expect("column pattern is a valid regex"));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CategoryError {
    #[error("unknown category: {0}")]
    Unknown(String),
    #[error("invalid rank column identifier: {0:?}")]
    InvalidColumn(String),
    #[error("duplicate rank column {column} (category {category})")]
    DuplicateColumn { category: String, column: String },
}

/// A validated storage column name holding one category's ranks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RankColumn(String);

impl RankColumn {
    pub fn parse(raw: &str) -> Result<Self, CategoryError> {
        if COLUMN_PATTERN.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(CategoryError::InvalidColumn(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RankColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Audience segment a course is ranked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Business,
    Technology,
    Healthcare,
    Creative,
    PublicSector,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Business,
        Category::Technology,
        Category::Healthcare,
        Category::Creative,
        Category::PublicSector,
    ];

    /// Display name, also what the oracle sees.
    pub fn name(self) -> &'static str {
        match self {
            Category::Business => "Business",
            Category::Technology => "Technology",
            Category::Healthcare => "Healthcare",
            Category::Creative => "Creative",
            Category::PublicSector => "Public Sector",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Category::Business => "business",
            Category::Technology => "technology",
            Category::Healthcare => "healthcare",
            Category::Creative => "creative",
            Category::PublicSector => "public_sector",
        }
    }

    pub fn context_description(self) -> &'static str {
        match self {
            Category::Business => {
                "Professionals in management, sales, marketing, operations and \
                 entrepreneurship who want skills that move revenue, teams and strategy: \
                 leadership, negotiation, analytics for decision making, project and \
                 product management."
            }
            Category::Technology => {
                "Software engineers, data practitioners and IT staff building or running \
                 technical systems: programming, cloud, data engineering, machine \
                 learning, security and DevOps."
            }
            Category::Healthcare => {
                "Clinicians, care staff and health administrators: clinical practice, \
                 patient safety, health informatics, regulation and compliance, and \
                 healthcare management."
            }
            Category::Creative => {
                "Designers, writers, marketers and media producers: visual and UX design, \
                 content creation, storytelling, brand, video and audio production."
            }
            Category::PublicSector => {
                "Civil servants, policy staff and non-profit workers: public policy, \
                 procurement, public finance, digital government and community programs."
            }
        }
    }

    fn raw_column(self) -> &'static str {
        match self {
            Category::Business => "business_rank",
            Category::Technology => "technology_rank",
            Category::Healthcare => "healthcare_rank",
            Category::Creative => "creative_rank",
            Category::PublicSector => "public_sector_rank",
        }
    }

    /// Validated rank column from the global registry.
    pub fn rank_column(self) -> &'static RankColumn {
        CategoryRegistry::global().column(self)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = CategoryError;

    /// Accepts the display name or the snake_case key, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.key() == needle || c.name().to_ascii_lowercase() == needle)
            .ok_or_else(|| CategoryError::Unknown(s.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct CategoryEntry {
    pub category: Category,
    pub context_description: &'static str,
    pub rank_column: RankColumn,
}

/// Process-wide, immutable category configuration.
#[derive(Debug)]
pub struct CategoryRegistry {
    entries: Vec<CategoryEntry>,
}

static REGISTRY: OnceLock<CategoryRegistry> = OnceLock::new();

impl CategoryRegistry {
    /// Build from `(category, raw column)` pairs, rejecting bad or shared columns.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (Category, &'a str)>,
    ) -> Result<Self, CategoryError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for (category, raw) in pairs {
            let rank_column = RankColumn::parse(raw)?;
            if !seen.insert(rank_column.clone()) {
                return Err(CategoryError::DuplicateColumn {
                    category: category.name().to_string(),
                    column: raw.to_string(),
                });
            }
            entries.push(CategoryEntry {
                category,
                context_description: category.context_description(),
                rank_column,
            });
        }
        Ok(Self { entries })
    }

    /// Validate the built-in table without installing it.
    pub fn validate() -> Result<Self, CategoryError> {
        Self::from_pairs(Category::ALL.into_iter().map(|c| (c, c.raw_column())))
    }

    pub fn global() -> &'static CategoryRegistry {
        REGISTRY.get_or_init(|| match Self::validate() {
            Ok(registry) => registry,
            // The built-in table is static; a failure here is a programming error.
            Err(e) => panic!("built-in category registry is invalid: {e}"),
        })
    }

    pub fn entries(&self) -> &[CategoryEntry] {
        &self.entries
    }

    pub fn get(&self, category: Category) -> Option<&CategoryEntry> {
        self.entries.iter().find(|e| e.category == category)
    }

    fn column(&self, category: Category) -> &RankColumn {
        match self.get(category) {
            Some(entry) => &entry.rank_column,
            None => panic!("category {category} missing from registry"),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &RankColumn> {
        self.entries.iter().map(|e| &e.rank_column)
    }
}
