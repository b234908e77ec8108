//! Runtime text templates for artifact paths, commit messages, and log
//! summaries.
//!
//! Templates use [upon]'s Mustache-like syntax (`{{ name }}`,
//! `{% for line in summary %}`) and are compiled eagerly so that syntax
//! errors surface at configuration time rather than mid-run.

use serde::Serialize;
use thiserror::Error;
use upon::{Engine, Template};

/// Template compilation or rendering failure.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template compile: {0}")]
    Compile(#[source] upon::Error),

    #[error("template render: {0}")]
    Render(#[source] upon::Error),
}

/// A compiled template, reusable across renders.
pub struct TextTemplate {
    engine: Engine<'static>,
    template: Template<'static>,
}

impl TextTemplate {
    /// Compile the given template source.
    pub fn compile(source: &str) -> Result<Self, TemplateError> {
        let engine = Engine::new();
        let template = engine
            .compile(source.to_string())
            .map_err(TemplateError::Compile)?;
        Ok(Self { engine, template })
    }

    /// Render against any serializable context.
    pub fn render(&self, data: impl Serialize) -> Result<String, TemplateError> {
        self.template
            .render(&self.engine, data)
            .to_string()
            .map_err(TemplateError::Render)
    }
}

impl std::fmt::Debug for TextTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextTemplate").finish_non_exhaustive()
    }
}
