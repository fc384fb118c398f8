//! SQL dialects of the network engines.

use std::fmt;

use crate::config::Driver;

/// Engine-specific SQL for catalog queries and database DDL.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn driver(&self) -> Driver;

    /// Query returning one database name per row.
    fn list_databases_sql(&self) -> &'static str;

    fn quote_ident(&self, name: &str) -> String;

    /// Escaper for string literals, usable as a plain function pointer.
    fn literal(&self) -> fn(&str) -> String;

    fn create_database_sql(&self, name: &str) -> String {
        format!("CREATE DATABASE {}", self.quote_ident(name))
    }

    fn drop_database_sql(&self, name: &str) -> String {
        format!("DROP DATABASE IF EXISTS {}", self.quote_ident(name))
    }

    /// Query returning the database size in bytes as its single value.
    fn size_sql(&self, name: &str) -> String;
}

#[derive(Debug, Clone, Copy)]
pub struct Postgres;

#[derive(Debug, Clone, Copy)]
pub struct MySql;

impl Dialect for Postgres {
    fn driver(&self) -> Driver {
        Driver::Pgsql
    }

    fn list_databases_sql(&self) -> &'static str {
        "SELECT datname FROM pg_database WHERE datistemplate = false AND datname <> 'postgres' ORDER BY datname"
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn literal(&self) -> fn(&str) -> String {
        pg_literal
    }

    fn size_sql(&self, name: &str) -> String {
        format!("SELECT pg_database_size({})", pg_literal(name))
    }
}

impl Dialect for MySql {
    fn driver(&self) -> Driver {
        Driver::Mysql
    }

    fn list_databases_sql(&self) -> &'static str {
        "SELECT SCHEMA_NAME FROM information_schema.SCHEMATA \
         WHERE SCHEMA_NAME NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys') \
         ORDER BY SCHEMA_NAME"
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn literal(&self) -> fn(&str) -> String {
        mysql_literal
    }

    fn size_sql(&self, name: &str) -> String {
        format!(
            "SELECT SUM(data_length + index_length) FROM information_schema.TABLES WHERE table_schema = {}",
            mysql_literal(name)
        )
    }
}

fn pg_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn mysql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// The dialect for a network engine. SQLite has none; it is file-based.
pub fn dialect_for(driver: Driver) -> Option<&'static dyn Dialect> {
    match driver {
        Driver::Pgsql => Some(&Postgres),
        Driver::Mysql => Some(&MySql),
        Driver::Sqlite => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_statements() {
        assert_eq!(Postgres.drop_database_sql("test-app_ab12"), "DROP DATABASE IF EXISTS \"test-app_ab12\"");
        assert_eq!(Postgres.create_database_sql("test-app"), "CREATE DATABASE \"test-app\"");
        assert_eq!(Postgres.size_sql("o'db"), "SELECT pg_database_size('o''db')");
    }

    #[test]
    fn test_mysql_statements() {
        assert_eq!(MySql.drop_database_sql("test-app"), "DROP DATABASE IF EXISTS `test-app`");
        assert!(MySql.size_sql("app").ends_with("table_schema = 'app'"));
        assert_eq!((MySql.literal())("a\\b'c"), "'a\\\\b''c'");
    }

    #[test]
    fn test_dialect_lookup() {
        assert_eq!(dialect_for(Driver::Pgsql).map(|d| d.driver()), Some(Driver::Pgsql));
        assert_eq!(dialect_for(Driver::Mysql).map(|d| d.driver()), Some(Driver::Mysql));
        assert!(dialect_for(Driver::Sqlite).is_none());
    }
}
