//! Per-upload render request values.

use std::path::{Path, PathBuf};

use super::types::JobIdentifier;

/// Template handed to Pandoc via `--template`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateReference {
    /// A file name looked up in the workspace, then in the static directory.
    Named(String),
    /// A literal absolute path used as-is.
    Path(PathBuf),
}

impl TemplateReference {
    /// Interpret a configured default or an `x-latex-template` header value.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        let path = Path::new(trimmed);
        if path.is_absolute() {
            Self::Path(path.to_path_buf())
        } else {
            Self::Named(trimmed.to_string())
        }
    }

    /// Resolve the template argument at job start.
    ///
    /// Named templates prefer the copy staged inside the workspace, so the
    /// bare file name keeps working when the toolchain runs inside a chroot.
    pub fn resolve(&self, workspace: &Path, static_dir: &Path) -> ResolvedTemplate {
        match self {
            TemplateReference::Path(path) => ResolvedTemplate {
                argument: path.display().to_string(),
                available: path.is_file(),
            },
            TemplateReference::Named(name) => {
                if workspace.join(name).is_file() {
                    return ResolvedTemplate {
                        argument: name.clone(),
                        available: true,
                    };
                }
                let candidate = static_dir.join(name);
                if candidate.is_file() {
                    ResolvedTemplate {
                        argument: candidate.display().to_string(),
                        available: true,
                    }
                } else {
                    ResolvedTemplate {
                        argument: name.clone(),
                        available: false,
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTemplate {
    pub argument: String,
    pub available: bool,
}

/// Documents located in a workspace for one render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderMode {
    Single { document: PathBuf },
    Compare { new: PathBuf, old: PathBuf },
}

impl RenderMode {
    pub fn label(&self) -> &'static str {
        match self {
            RenderMode::Single { .. } => "single",
            RenderMode::Compare { .. } => "compare",
        }
    }
}

/// Everything a render job needs, built once per accepted upload.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub identifier: JobIdentifier,
    pub template: TemplateReference,
    pub mode: RenderMode,
}
