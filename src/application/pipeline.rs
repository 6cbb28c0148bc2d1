//! Immutable configuration shared by every stage of the render pipeline.

use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use crate::{
    config::Settings,
    domain::{request::TemplateReference, rewrite::RewriteRuleSet},
};

/// How the external toolchain is reached.
#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    /// When set, wrapper scripts run through `chroot <dir>`.
    pub chroot_dir: Option<PathBuf>,
    pub shell: PathBuf,
    pub pandoc: String,
    pub latexdiff: String,
    pub latex_engine: String,
    /// `PATH` exported inside the wrapper script.
    pub search_path: String,
}

/// Loaded once at start-up and handed to each component by `Arc`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub static_dir: PathBuf,
    pub static_content: Vec<String>,
    pub default_template: TemplateReference,
    pub rewrite_rules: RewriteRuleSet,
    pub toolchain: ToolchainConfig,
    pub retention: Duration,
    pub max_concurrent_renders: Option<NonZeroUsize>,
}

impl From<&Settings> for PipelineConfig {
    fn from(settings: &Settings) -> Self {
        let render = &settings.render;
        Self {
            static_dir: render.static_dir.clone(),
            static_content: render.static_content.clone(),
            default_template: TemplateReference::parse(&render.default_template),
            rewrite_rules: settings.compare.rules.clone(),
            toolchain: ToolchainConfig {
                chroot_dir: render.chroot_dir.clone(),
                shell: render.shell.clone(),
                pandoc: render.pandoc.clone(),
                latexdiff: render.latexdiff.clone(),
                latex_engine: render.latex_engine.clone(),
                search_path: render.search_path.clone(),
            },
            retention: settings.workspace.retention,
            max_concurrent_renders: settings.jobs.max_concurrent_renders,
        }
    }
}

impl PipelineConfig {
    /// Resolve a static asset name: relative to the static directory first,
    /// then as an absolute path.
    pub fn locate_static(&self, name: &str) -> Option<PathBuf> {
        let relative = self.static_dir.join(name);
        if relative.is_file() {
            return Some(relative);
        }
        let absolute = PathBuf::from(name);
        (absolute.is_absolute() && absolute.is_file()).then_some(absolute)
    }

    /// Static assets that cannot be found by [`Self::locate_static`].
    pub fn missing_static_content(&self) -> Vec<&str> {
        self.static_content
            .iter()
            .map(String::as_str)
            .filter(|name| self.locate_static(name).is_none())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Configuration pointing at a fake toolchain; used across module tests.
    pub(crate) fn pipeline_config(static_dir: PathBuf) -> PipelineConfig {
        PipelineConfig {
            static_dir,
            static_content: Vec::new(),
            default_template: TemplateReference::Named("example.latex".to_string()),
            rewrite_rules: RewriteRuleSet::default(),
            toolchain: ToolchainConfig {
                chroot_dir: None,
                shell: PathBuf::from("/bin/sh"),
                pandoc: "pandoc".to_string(),
                latexdiff: "latexdiff".to_string(),
                latex_engine: "xelatex".to_string(),
                search_path: "/usr/bin:/bin".to_string(),
            },
            retention: Duration::from_secs(120),
            max_concurrent_renders: None,
        }
    }
}
