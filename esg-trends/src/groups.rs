//! Subject grouping
//!
//! Trends are published per trend category rather than per company:
//! a subject maps to a sector, and a sector maps to a category.

use crate::config::GroupsConfig;

/// Resolves subjects to the `subject_group` used in trend records
#[derive(Debug, Clone)]
pub struct SubjectGroups {
    config: GroupsConfig,
}

impl SubjectGroups {
    pub fn new(config: GroupsConfig) -> Self {
        Self { config }
    }

    /// Sector of a subject, if known
    pub fn sector_of(&self, subject_id: &str) -> Option<&str> {
        self.config
            .subject_sectors
            .get(subject_id)
            .or_else(|| self.config.subject_sectors.get(&subject_id.to_uppercase()))
            .map(String::as_str)
    }

    /// Trend category for a subject
    pub fn group_of(&self, subject_id: &str) -> String {
        self.sector_of(subject_id)
            .and_then(|sector| self.config.sector_categories.get(sector))
            .cloned()
            .unwrap_or_else(|| self.config.default_category.clone())
    }
}

impl Default for SubjectGroups {
    fn default() -> Self {
        Self::new(GroupsConfig::default())
    }
}
