//! Selection criteria grammar
//!
//! A small subset of dbt's node selection syntax:
//!
//! ```text
//! criteria := term (WHITESPACE term)*      union
//! term     := atom ("," atom)*             intersection
//! atom     := ["+"] method ["+"]           "+" prefix: ancestors, "+" suffix: descendants
//! method   := "*" | "resource_type:" TYPE | "state:modified" | NAME | UNIQUE_ID
//! ```
//!
//! Parsing is pure; resolution against a graph lives in [`crate::graph`].

use colci_core::ResourceType;

/// Why a selection string does not parse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("empty selection")]
    Empty,

    #[error("empty selector in `{0}`")]
    EmptyAtom(String),

    #[error("unknown resource type `{0}`")]
    UnknownResourceType(String),

    #[error("unsupported selector method `{0}`")]
    UnsupportedMethod(String),
}

/// How an atom matches nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorMethod {
    /// Every project node
    Wildcard,

    /// Every node of a resource type
    ResourceType(ResourceType),

    /// Every node flagged as modified in this run
    StateModified,

    /// A node name or unique id
    Identifier(String),
}

/// One selector with optional graph operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorAtom {
    pub method: SelectorMethod,
    pub ancestors: bool,
    pub descendants: bool,
}

/// Atoms joined by commas (intersection)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionTerm {
    pub atoms: Vec<SelectorAtom>,
}

/// Parsed selection criteria (union of terms)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionCriteria {
    pub raw: String,
    pub terms: Vec<SelectionTerm>,
}

impl SelectionCriteria {
    pub fn parse(criteria: &str) -> Result<Self, SelectorError> {
        let mut terms = Vec::new();

        for raw_term in criteria.split_whitespace() {
            let atoms = raw_term
                .split(',')
                .map(parse_atom)
                .collect::<Result<Vec<_>, _>>()?;
            terms.push(SelectionTerm { atoms });
        }

        if terms.is_empty() {
            return Err(SelectorError::Empty);
        }

        Ok(Self { raw: criteria.trim().to_string(), terms })
    }
}

fn parse_atom(raw: &str) -> Result<SelectorAtom, SelectorError> {
    let ancestors = raw.starts_with('+');
    let body = raw.strip_prefix('+').unwrap_or(raw);
    let descendants = body.ends_with('+');
    let body = body.strip_suffix('+').unwrap_or(body);

    if body.is_empty() {
        return Err(SelectorError::EmptyAtom(raw.to_string()));
    }

    let method = match body.split_once(':') {
        Some(("resource_type", value)) => match ResourceType::parse(value) {
            ResourceType::Unknown => return Err(SelectorError::UnknownResourceType(value.to_string())),
            resource_type => SelectorMethod::ResourceType(resource_type),
        },
        Some(("state", "modified")) => SelectorMethod::StateModified,
        Some((method, _)) => return Err(SelectorError::UnsupportedMethod(method.to_string())),
        None if body == "*" => SelectorMethod::Wildcard,
        None => SelectorMethod::Identifier(body.to_string()),
    };

    Ok(SelectorAtom { method, ancestors, descendants })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_graph_operators() {
        let criteria = SelectionCriteria::parse("+int_orders+").unwrap();
        assert_eq!(
            criteria.terms[0].atoms[0],
            SelectorAtom {
                method: SelectorMethod::Identifier("int_orders".to_string()),
                ancestors: true,
                descendants: true,
            }
        );
    }

    #[test]
    fn whitespace_is_union_and_comma_is_intersection() {
        let criteria = SelectionCriteria::parse("state:modified+,resource_type:model  fct_orders").unwrap();
        assert_eq!(criteria.terms.len(), 2);
        assert_eq!(criteria.terms[0].atoms.len(), 2);
        assert_eq!(criteria.terms[0].atoms[0].method, SelectorMethod::StateModified);
        assert!(criteria.terms[0].atoms[0].descendants);
        assert_eq!(
            criteria.terms[0].atoms[1].method,
            SelectorMethod::ResourceType(ResourceType::Model)
        );
    }

    #[test]
    fn rejects_malformed_criteria() {
        assert_eq!(SelectionCriteria::parse("   "), Err(SelectorError::Empty));
        assert_eq!(SelectionCriteria::parse("+"), Err(SelectorError::EmptyAtom("+".to_string())));
        assert_eq!(
            SelectionCriteria::parse("tag:nightly"),
            Err(SelectorError::UnsupportedMethod("tag".to_string()))
        );
        assert_eq!(
            SelectionCriteria::parse("resource_type:widget"),
            Err(SelectorError::UnknownResourceType("widget".to_string()))
        );
    }

    #[test]
    fn wildcard() {
        let criteria = SelectionCriteria::parse("*").unwrap();
        assert_eq!(criteria.terms[0].atoms[0].method, SelectorMethod::Wildcard);
    }
}
