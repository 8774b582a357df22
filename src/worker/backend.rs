//! Worker backend variants.
//!
//! A backend tag selects the construction strategy for a pool slot: extra
//! launch arguments, the wire revision used for column payloads and the
//! snippet templates for preloading modules. The mapping is resolved once,
//! when the slot is constructed.

use crate::codec::WireRev;

use super::WorkerOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Default backend speaking the current column wire revision.
    Current,
    /// Workers still speaking the deprecated legacy column layout.
    Legacy,
}

/// Static construction profile for one backend variant.
#[derive(Debug)]
pub struct BackendProfile {
    pub label: &'static str,
    pub wire_rev: WireRev,
    pub extra_args: &'static [&'static str],
}

static CURRENT_PROFILE: BackendProfile = BackendProfile {
    label: "current",
    wire_rev: WireRev::Current,
    extra_args: &[],
};

static LEGACY_PROFILE: BackendProfile = BackendProfile {
    label: "legacy",
    wire_rev: WireRev::Legacy,
    extra_args: &["--legacy-serialization"],
};

impl BackendKind {
    pub fn profile(&self) -> &'static BackendProfile {
        match self {
            Self::Current => &CURRENT_PROFILE,
            Self::Legacy => &LEGACY_PROFILE,
        }
    }
}

impl BackendProfile {
    /// Import statement for a module that must be present. A failing import
    /// fails worker construction.
    pub fn import_statement(&self, module: &str) -> String {
        format!("import {}", module)
    }

    /// Guarded import for a module that should be present but is allowed to
    /// be absent.
    pub fn guarded_import_statement(&self, module: &str) -> String {
        format!(
            "try:\n\timport {}\nexcept Exception:\n\tpass",
            module
        )
    }

    /// Prologue applied when a checked-out worker is configured: declares
    /// the host's variable-naming convention and the outputs it expects the
    /// workspace to populate.
    pub fn configure_snippet(&self, options: &WorkerOptions) -> String {
        let outputs = options
            .expected_outputs
            .iter()
            .map(|name| format!("\"{}\"", name))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{prefix}prefix = \"{prefix}\"\n{prefix}expected_outputs = [{outputs}]",
            prefix = options.variable_prefix,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_resolve_wire_revisions() {
        assert_eq!(BackendKind::Current.profile().wire_rev, WireRev::Current);
        assert_eq!(BackendKind::Legacy.profile().wire_rev, WireRev::Legacy);
        assert!(BackendKind::Legacy
            .profile()
            .extra_args
            .contains(&"--legacy-serialization"));
    }

    #[test]
    fn import_snippets() {
        let profile = BackendKind::Current.profile();
        assert_eq!(profile.import_statement("numpy"), "import numpy");
        let guarded = profile.guarded_import_statement("pandas");
        assert!(guarded.starts_with("try:"));
        assert!(guarded.contains("import pandas"));
    }

    #[test]
    fn configure_snippet_lists_expected_outputs() {
        let options = WorkerOptions {
            variable_prefix: "host_".into(),
            expected_outputs: vec!["out_table".into(), "out_image".into()],
        };
        let snippet = BackendKind::Current.profile().configure_snippet(&options);
        assert!(snippet.contains("host_prefix"));
        assert!(snippet.contains("\"out_table\", \"out_image\""));
    }
}
