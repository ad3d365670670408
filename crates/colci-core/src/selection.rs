//! Rendered CI selection
//!
//! The selection handed to the run trigger is a pure function of the included
//! and excluded node sets: both lists are sorted and de-duplicated on
//! construction, so the same sets always render to the same arguments and the
//! same fingerprint.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// dbt commands whose selection can be narrowed with `--exclude`
const DBT_COMMAND_PATTERN: &str = r"^\s*dbt\s+((--warn-error|--use-experimental-parser|--no-partial-parse|--fail-fast)\s+)*(run|test|source|compile|ls|list|docs\s+generate|build|clone)(\s|$)";

static DBT_COMMAND: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(DBT_COMMAND_PATTERN).ok());

/// Selection expression for the CI run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiSelection {
    /// Base selector the job runs (e.g. "state:modified+")
    pub select: String,

    /// Unique ids that stay in the run
    pub included: Vec<String>,

    /// Node names excluded from the run
    pub excluded: Vec<String>,

    /// Unique ids of ancestors the included nodes build on (deferred, not rebuilt)
    pub ancestors: Vec<String>,
}

impl CiSelection {
    pub fn new<I, E, A>(select: impl Into<String>, included: I, excluded: E, ancestors: A) -> Self
    where
        I: IntoIterator<Item = String>,
        E: IntoIterator<Item = String>,
        A: IntoIterator<Item = String>,
    {
        Self {
            select: select.into(),
            included: sorted(included),
            excluded: sorted(excluded),
            ancestors: sorted(ancestors),
        }
    }

    /// Selection that excludes nothing
    pub fn unpruned(select: impl Into<String>) -> Self {
        Self::new(select, Vec::new(), Vec::new(), Vec::new())
    }

    /// Whether anything was pruned from the run
    pub fn is_pruned(&self) -> bool {
        !self.excluded.is_empty()
    }

    /// Space separated exclusion list, if any
    pub fn exclude_expression(&self) -> Option<String> {
        if self.excluded.is_empty() {
            None
        } else {
            Some(self.excluded.join(" "))
        }
    }

    /// Command-line arguments for a dbt invocation
    pub fn to_args(&self) -> String {
        match self.exclude_expression() {
            Some(exclude) => format!("--select {} --exclude {}", self.select, exclude),
            None => format!("--select {}", self.select),
        }
    }

    /// Append the exclusions to every recognised dbt command of a job
    pub fn apply_to_steps(&self, steps: &[String]) -> Vec<String> {
        let Some(exclude) = self.exclude_expression() else {
            return steps.to_vec();
        };

        steps
            .iter()
            .map(|step| {
                if is_dbt_command(step) {
                    format!("{} --exclude {}", step.trim_end(), exclude)
                } else {
                    step.clone()
                }
            })
            .collect()
    }

    /// SHA-256 of the rendered arguments
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_args().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Whether a job step is a dbt command that accepts `--exclude`
pub fn is_dbt_command(step: &str) -> bool {
    DBT_COMMAND.as_ref().map_or(false, |re| re.is_match(step))
}

fn sorted<I: IntoIterator<Item = String>>(items: I) -> Vec<String> {
    let mut items: Vec<String> = items.into_iter().collect();
    items.sort();
    items.dedup();
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn selection(excluded: &[&str]) -> CiSelection {
        CiSelection::new(
            "state:modified+",
            vec!["model.shop.int_orders".to_string()],
            excluded.iter().map(|s| s.to_string()),
            Vec::new(),
        )
    }

    #[test]
    fn renders_sorted_exclusions() {
        let sel = selection(&["rpt_revenue", "dim_customers", "rpt_revenue"]);
        assert_eq!(sel.excluded, vec!["dim_customers", "rpt_revenue"]);
        assert_eq!(
            sel.to_args(),
            "--select state:modified+ --exclude dim_customers rpt_revenue"
        );
    }

    #[test]
    fn unpruned_selection_has_no_exclude_flag() {
        let sel = CiSelection::unpruned("state:modified+");
        assert!(!sel.is_pruned());
        assert_eq!(sel.to_args(), "--select state:modified+");
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = selection(&["b", "a"]);
        let b = selection(&["a", "b"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), selection(&["a"]).fingerprint());
    }

    #[test]
    fn only_dbt_commands_get_exclusions() {
        let sel = selection(&["rpt_revenue"]);
        let steps = vec![
            "dbt build --select state:modified+".to_string(),
            "dbt --fail-fast test".to_string(),
            "dbt docs generate".to_string(),
            "dbt seed".to_string(),
            "echo done".to_string(),
        ];

        assert_eq!(
            sel.apply_to_steps(&steps),
            vec![
                "dbt build --select state:modified+ --exclude rpt_revenue".to_string(),
                "dbt --fail-fast test --exclude rpt_revenue".to_string(),
                "dbt docs generate --exclude rpt_revenue".to_string(),
                "dbt seed".to_string(),
                "echo done".to_string(),
            ]
        );
    }

    #[test]
    fn command_pattern_requires_word_boundary() {
        assert!(is_dbt_command("dbt run"));
        assert!(!is_dbt_command("dbt runner"));
        assert!(!is_dbt_command("python dbt run"));
    }

    #[test]
    fn command_pattern_is_built_once() {
        let first = DBT_COMMAND.as_ref().map(|re| re as *const Regex);
        assert!(first.is_some());
        assert_eq!(first, DBT_COMMAND.as_ref().map(|re| re as *const Regex));
        assert!(is_dbt_command("dbt --warn-error docs generate"));
    }
}
