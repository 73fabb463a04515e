//! Render engine: turn routes into artifacts, in memory.
//!
//! For each route the engine enumerates every concrete route instance (the
//! cartesian product of the declared argument values, first rule parameter
//! outermost), invokes the route's handler once per instance, and wraps each
//! returned export as an [`Artifact`]. Nothing is written to disk here.
//!
//! Handler failures travel inside [`RenderError::Handler`] with the handler's
//! own error as the `source`, so callers can downcast to the concrete type.
//! The engine never inspects, retries or drops a handler error.

use crate::rule::RuleError;
use crate::types::{Artifact, Manifest, Module, Route, RouteInstance};
use crate::writers::{Rendered, Writers};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use thiserror::Error;

/// Error type handlers report; kept opaque so any error passes through.
pub type HandlerError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("no handler named '{handler}' for route {rule} in module '{module}'")]
    NoSuchHandler {
        module: String,
        rule: String,
        handler: String,
    },
    #[error("cannot expand route in module '{module}': {source}")]
    Rule { module: String, source: RuleError },
    #[error("rendering {path} in module '{module}' failed: {source}")]
    Handler {
        module: String,
        path: String,
        source: HandlerError,
    },
    #[error("handler for {path} in module '{module}' returned export '{label}' twice")]
    DuplicateExport {
        module: String,
        path: String,
        label: String,
    },
}

impl RenderError {
    /// The handler's own error, when this failure came from a handler.
    pub fn handler_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Handler { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Executes a route for one bound instance.
///
/// Returns one [`Rendered`] per export, in the route's export order.
pub trait Handler {
    fn invoke(&self, route: &Route, instance: &RouteInstance)
    -> Result<Vec<Rendered>, HandlerError>;
}

/// Stock handler: the module's static context plus the bound arguments,
/// passed through each declared writer.
pub struct ContextHandler {
    writers: Writers,
}

impl ContextHandler {
    pub fn new(writers: Writers) -> Self {
        Self { writers }
    }
}

impl Handler for ContextHandler {
    fn invoke(
        &self,
        route: &Route,
        instance: &RouteInstance,
    ) -> Result<Vec<Rendered>, HandlerError> {
        let mut context = route.context.clone();
        for (name, value) in instance.args.iter() {
            context.insert(name.to_string(), toml::Value::String(value.to_string()));
        }
        route
            .exports
            .iter()
            .map(|export| Ok(self.writers.write(export, &context)?))
            .collect()
    }
}

/// Named handlers available to a site's routes.
#[derive(Default)]
pub struct HandlerSet {
    handlers: BTreeMap<String, Box<dyn Handler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock set for a manifest: `context` bound to its template dir.
    pub fn for_manifest(manifest: &Manifest) -> Self {
        let mut set = Self::new();
        set.register(
            "context",
            ContextHandler::new(Writers::new(manifest.templates_dir())),
        );
        set
    }

    /// Register or replace a handler.
    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Handler> {
        self.handlers.get(name).map(|h| h.as_ref())
    }
}

/// All artifacts of one route instance.
#[derive(Debug, Clone)]
pub struct RenderedInstance {
    /// Shelf namespace of the route.
    pub site: String,
    pub instance: RouteInstance,
    pub artifacts: Vec<Artifact>,
}

pub struct RenderEngine<'a> {
    handlers: &'a HandlerSet,
}

impl<'a> RenderEngine<'a> {
    pub fn new(handlers: &'a HandlerSet) -> Self {
        Self { handlers }
    }

    /// Render every route of a module, in declaration order.
    pub fn render_module(&self, module: &Module) -> Result<Vec<RenderedInstance>, RenderError> {
        let mut rendered = Vec::new();
        for route in &module.routes {
            rendered.extend(self.render_route(route)?);
        }
        Ok(rendered)
    }

    /// Render every instance of one route.
    pub fn render_route(&self, route: &Route) -> Result<Vec<RenderedInstance>, RenderError> {
        let handler =
            self.handlers
                .get(&route.handler)
                .ok_or_else(|| RenderError::NoSuchHandler {
                    module: route.module.clone(),
                    rule: route.rule.pattern().to_string(),
                    handler: route.handler.clone(),
                })?;

        expand_instances(route)?
            .into_iter()
            .map(|instance| {
                let outputs =
                    handler
                        .invoke(route, &instance)
                        .map_err(|source| RenderError::Handler {
                            module: route.module.clone(),
                            path: instance.path.clone(),
                            source,
                        })?;
                let artifacts = to_artifacts(route, &instance, outputs)?;
                Ok(RenderedInstance {
                    site: route.site.clone(),
                    instance,
                    artifacts,
                })
            })
            .collect()
    }
}

fn to_artifacts(
    route: &Route,
    instance: &RouteInstance,
    outputs: Vec<Rendered>,
) -> Result<Vec<Artifact>, RenderError> {
    let mut artifacts: Vec<Artifact> = Vec::with_capacity(outputs.len());
    for output in outputs {
        if artifacts.iter().any(|a| a.label == output.label) {
            return Err(RenderError::DuplicateExport {
                module: route.module.clone(),
                path: instance.path.clone(),
                label: output.label,
            });
        }
        artifacts.push(Artifact {
            path: instance.path.clone(),
            label: output.label,
            content_type: output.content_type,
            content: output.content,
            source: route.source(),
        });
    }
    Ok(artifacts)
}

/// Every concrete instance of a route, first rule parameter outermost.
pub fn expand_instances(route: &Route) -> Result<Vec<RouteInstance>, RenderError> {
    route.instances().map_err(|source| RenderError::Rule {
        module: route.module.clone(),
        source,
    })
}
