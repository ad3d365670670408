//! SQL parsing using datafusion-sqlparser-rs
//!
//! Parses compiled SQL into an AST for the configured dialect.

use colci_core::{ClassificationError, DialectConfig};
use sqlparser::ast::{Query, Statement};
use sqlparser::dialect::{
    BigQueryDialect, DatabricksDialect, Dialect, DuckDbDialect, GenericDialect, PostgreSqlDialect,
    RedshiftSqlDialect, SnowflakeDialect,
};
use sqlparser::parser::{Parser, ParserError};

/// SQL parser with configurable dialect
pub struct SqlParser {
    dialect: Box<dyn Dialect + Send + Sync>,
}

impl SqlParser {
    /// Create a new SQL parser with the default (generic) dialect
    pub fn new() -> Self {
        Self {
            dialect: Box::new(GenericDialect {}),
        }
    }

    /// Create a parser from a dialect config
    pub fn from_dialect(dialect: &DialectConfig) -> Self {
        let dialect: Box<dyn Dialect + Send + Sync> = match dialect {
            DialectConfig::Ansi => Box::new(GenericDialect {}),
            DialectConfig::BigQuery => Box::new(BigQueryDialect {}),
            DialectConfig::Snowflake => Box::new(SnowflakeDialect {}),
            DialectConfig::Postgres => Box::new(PostgreSqlDialect {}),
            DialectConfig::Redshift => Box::new(RedshiftSqlDialect {}),
            DialectConfig::Databricks => Box::new(DatabricksDialect {}),
            DialectConfig::DuckDb => Box::new(DuckDbDialect {}),
        };

        Self { dialect }
    }

    /// Parse SQL string into AST
    pub fn parse(&self, sql: &str) -> Result<ParsedSql, ParseError> {
        match Parser::parse_sql(&*self.dialect, sql) {
            Ok(statements) => Ok(ParsedSql {
                sql: sql.to_string(),
                statements,
            }),
            Err(error) => Err(ParseError::Syntax {
                sql: sql.to_string(),
                error,
            }),
        }
    }

    /// Parse SQL that must be exactly one query (the shape of a compiled dbt model)
    pub fn parse_query(&self, sql: &str) -> Result<Query, ParseError> {
        self.parse(sql)?.into_query()
    }
}

impl Default for SqlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Successfully parsed SQL with AST
#[derive(Debug, Clone)]
pub struct ParsedSql {
    /// Original SQL string
    pub sql: String,

    /// Parsed statements
    pub statements: Vec<Statement>,
}

impl ParsedSql {
    /// Get the first statement
    pub fn first_statement(&self) -> Option<&Statement> {
        self.statements.first()
    }

    /// Check if this is a SELECT statement
    pub fn is_select(&self) -> bool {
        matches!(self.first_statement(), Some(Statement::Query(_)))
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// The single query this SQL consists of
    pub fn into_query(mut self) -> Result<Query, ParseError> {
        if self.statements.len() != 1 {
            return Err(ParseError::Unsupported {
                sql: self.sql,
                reason: format!("expected a single statement, found {}", self.statements.len()),
            });
        }

        match self.statements.pop() {
            Some(Statement::Query(query)) => Ok(*query),
            _ => Err(ParseError::Unsupported {
                sql: self.sql,
                reason: "statement is not a query".to_string(),
            }),
        }
    }
}

/// SQL parsing error
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("SQL parse error: {error}")]
    Syntax { sql: String, error: ParserError },

    #[error("Unsupported SQL: {reason}")]
    Unsupported { sql: String, reason: String },
}

impl ParseError {
    /// Raw SQL that failed
    pub fn sql(&self) -> &str {
        match self {
            Self::Syntax { sql, .. } | Self::Unsupported { sql, .. } => sql,
        }
    }

    /// Attribute the failure to a node
    pub fn into_classification_error(self, node_id: &str) -> ClassificationError {
        let reason = match &self {
            Self::Syntax { error, .. } => error.to_string(),
            Self::Unsupported { reason, .. } => reason.clone(),
        };

        ClassificationError::new(node_id, reason, self.sql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_select() {
        let parser = SqlParser::new();
        let parsed = parser.parse("SELECT id, name FROM users WHERE active = true").unwrap();
        assert_eq!(parsed.statement_count(), 1);
        assert!(parsed.is_select());
    }

    #[test]
    fn parse_with_cte() {
        let parser = SqlParser::new();
        let sql = r#"
            WITH active_users AS (
                SELECT * FROM users WHERE active = true
            )
            SELECT id, name FROM active_users
        "#;

        assert!(parser.parse_query(sql).is_ok());
    }

    #[test]
    fn parse_invalid_sql() {
        let err = SqlParser::new().parse_query("SELECT FROM WHERE").unwrap_err();
        assert!(matches!(err, ParseError::Syntax { .. }));

        let classification = err.into_classification_error("model.shop.broken");
        assert_eq!(classification.node_id, "model.shop.broken");
        assert_eq!(classification.sql, "SELECT FROM WHERE");
    }

    #[test]
    fn rejects_non_queries_and_scripts() {
        let parser = SqlParser::new();
        assert!(matches!(
            parser.parse_query("DELETE FROM users"),
            Err(ParseError::Unsupported { .. })
        ));
        assert!(matches!(
            parser.parse_query("SELECT 1; SELECT 2"),
            Err(ParseError::Unsupported { .. })
        ));
    }

    #[test]
    fn different_dialects() {
        let sql = "SELECT id FROM users";
        for dialect in [
            DialectConfig::Ansi,
            DialectConfig::BigQuery,
            DialectConfig::Snowflake,
            DialectConfig::Postgres,
            DialectConfig::Redshift,
            DialectConfig::Databricks,
            DialectConfig::DuckDb,
        ] {
            assert!(SqlParser::from_dialect(&dialect).parse(sql).is_ok(), "{:?}", dialect);
        }
    }

    #[test]
    fn dialect_specific_syntax() {
        let sql = "SELECT `order id` FROM `project.dataset.orders`";
        assert!(SqlParser::from_dialect(&DialectConfig::BigQuery).parse(sql).is_ok());
    }
}
