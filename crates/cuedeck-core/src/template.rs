//! Template - authored-config resolution against the run context
//!
//! Authored operation configs may contain `{{ path }}` regions referring
//! to run context values. The executor resolves every config through a
//! [`TemplateResolver`] before any handler sees it, so handlers never
//! observe unresolved template text. Embedders with richer template
//! engines plug in their own resolver; [`MustacheLiteResolver`] covers
//! plain path substitution and [`PassthroughResolver`] disables
//! resolution entirely.

use crate::run::ContextView;
use serde_json::{Map, Value};
use thiserror::Error;

/// Template resolution failure. Treated as a configuration error: the
/// operation fails before its handler is invoked.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// A `{{` region was never closed.
    #[error("unclosed template region in {template:?}")]
    UnclosedRegion {
        /// The offending template string.
        template: String,
    },

    /// A `{{ }}` region with nothing inside.
    #[error("empty template region in {template:?}")]
    EmptyRegion {
        /// The offending template string.
        template: String,
    },

    /// A region referenced a context path that does not exist.
    #[error("unknown context path: {path}")]
    UnknownPath {
        /// The dotted path that failed to resolve.
        path: String,
    },

    /// Resolver-specific failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Resolves authored configuration against the current run context.
#[async_trait::async_trait]
pub trait TemplateResolver: Send + Sync {
    /// Resolve `config`, returning a value free of template regions.
    async fn resolve(&self, config: &Value, ctx: &ContextView) -> Result<Value, TemplateError>;
}

/// Resolver that returns configs unchanged, for embedders that resolve
/// upstream and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolver;

#[async_trait::async_trait]
impl TemplateResolver for PassthroughResolver {
    async fn resolve(&self, config: &Value, _ctx: &ContextView) -> Result<Value, TemplateError> {
        Ok(config.clone())
    }
}

/// Plain `{{ path }}` substitution over string values, recursing through
/// objects and arrays.
///
/// A string that is exactly one region resolves to the referenced value
/// itself, preserving its type; mixed strings render referenced values as
/// text. Unknown paths are errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct MustacheLiteResolver;

#[async_trait::async_trait]
impl TemplateResolver for MustacheLiteResolver {
    async fn resolve(&self, config: &Value, ctx: &ContextView) -> Result<Value, TemplateError> {
        resolve_value(config, ctx)
    }
}

fn resolve_value(value: &Value, ctx: &ContextView) -> Result<Value, TemplateError> {
    match value {
        Value::String(text) => resolve_string(text, ctx),
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, ctx)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => {
            let resolved = items
                .iter()
                .map(|item| resolve_value(item, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(resolved))
        }
        other => Ok(other.clone()),
    }
}

enum Region<'a> {
    Text(&'a str),
    Path(&'a str),
}

fn scan_regions(template: &str) -> Result<Vec<Region<'_>>, TemplateError> {
    let mut regions = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            regions.push(Region::Text(&rest[..open]));
        }
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            return Err(TemplateError::UnclosedRegion {
                template: template.to_string(),
            });
        };
        let path = after_open[..close].trim();
        if path.is_empty() {
            return Err(TemplateError::EmptyRegion {
                template: template.to_string(),
            });
        }
        regions.push(Region::Path(path));
        rest = &after_open[close + 2..];
    }
    if !rest.is_empty() {
        regions.push(Region::Text(rest));
    }
    Ok(regions)
}

fn resolve_string(template: &str, ctx: &ContextView) -> Result<Value, TemplateError> {
    let regions = scan_regions(template)?;

    // A template that is exactly one region resolves to the referenced
    // value itself, so numbers stay numbers.
    if let [Region::Path(path)] = regions.as_slice() {
        return lookup(ctx, path).cloned();
    }

    let mut rendered = String::with_capacity(template.len());
    for region in &regions {
        match region {
            Region::Text(text) => rendered.push_str(text),
            Region::Path(path) => rendered.push_str(&render(lookup(ctx, path)?)),
        }
    }
    Ok(Value::String(rendered))
}

fn lookup<'a>(ctx: &'a ContextView, path: &str) -> Result<&'a Value, TemplateError> {
    ctx.lookup(path).ok_or_else(|| TemplateError::UnknownPath {
        path: path.to_string(),
    })
}

/// Text rendering for mixed templates: strings verbatim, null empty,
/// everything else compact JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
