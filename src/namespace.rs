use crate::context::{Context, DEFAULT_NAMESPACE};
use crate::error::{ErrorKind, Result, StoreError};

// ============================================================================
// Namespace Router
// ============================================================================
//
// Maps the logical namespace of a call onto a physical table:
//
//     table = prefix + namespace
//
// A router built with `with_default_table` sends the default namespace to
// that table instead, so single-tenant callers keep a plain table name.
//
// Namespaces double as table name suffixes, so they are restricted to
// ASCII letters, digits and underscores.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct NamespaceRouter {
    prefix: String,
    default_table: Option<String>,
}

impl NamespaceRouter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            default_table: None,
        }
    }

    /// Route the default namespace to `table` and every other namespace to
    /// `table_<namespace>`.
    pub fn with_default_table(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            prefix: format!("{table}_"),
            default_table: Some(table),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Namespace carried by the context, or the default one.
    pub fn namespace_of<'a>(&self, ctx: &'a Context) -> &'a str {
        ctx.namespace()
    }

    /// Physical table for the namespace of `ctx`.
    pub fn table_name(&self, ctx: &Context) -> Result<String> {
        let namespace = ctx.namespace();
        if !is_valid_namespace(namespace) {
            return Err(StoreError::new(ErrorKind::InvalidNamespace, namespace));
        }
        match &self.default_table {
            Some(table) if namespace == DEFAULT_NAMESPACE => Ok(table.clone()),
            _ => Ok(format!("{}{}", self.prefix, namespace)),
        }
    }
}

fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
