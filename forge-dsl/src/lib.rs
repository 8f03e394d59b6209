//! Compiler pipeline for the Forge application language.
//!
//! Source files move through six phases:
//!
//! ```text
//! .forge sources → Lexer → Parser → Analyzer → Normalizer → Planner → Emitter
//!                                                                       ↓
//!                                                          artifact.json + client SDK
//! ```
//!
//! Diagnostics from every phase are collected; a compile fails only
//! after all of them have been gathered, so a single run reports every
//! problem in the sources. Compilation is deterministic: the same
//! sources always produce byte-identical artifacts.

pub mod analyzer;
pub mod emit;
pub mod lexer;
pub mod normalize;
pub mod parser;
pub mod plan;

pub use analyzer::{Analyzer, ParsedFile};
pub use emit::{render_sdk, source_digest, write_artifact};
pub use lexer::{Lexer, Token, TokenKind};
pub use normalize::{normalize, NormalizedSpec};
pub use parser::Parser;
pub use plan::build_artifact;

use forge_core::{Artifact, Diagnostics};
use std::path::Path;

/// One input source file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub path: String,
    pub text: String,
}

/// A successful compile: the artifact, the rendered SDK, and any
/// warnings that were collected along the way.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub artifact: Artifact,
    pub sdk_source: String,
    /// Warning-severity diagnostics (a compile with errors returns Err).
    pub warnings: Diagnostics,
}

/// Compile a set of source files.
///
/// Returns the collected diagnostics as `Err` when any of them is an
/// error; warnings ride along in the `Ok` output.
pub fn compile(files: &[SourceFile]) -> Result<CompileOutput, Diagnostics> {
    let mut sorted: Vec<&SourceFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut diagnostics = Diagnostics::new();
    let mut parsed = Vec::new();
    for file in &sorted {
        let (decls, parse_diags) = Parser::parse_source(&file.text, &file.path);
        diagnostics.extend(parse_diags);
        parsed.push(ParsedFile {
            path: file.path.clone(),
            decls,
        });
    }

    diagnostics.extend(Analyzer::new(&parsed).run());

    let (spec, norm_diags) = normalize(&parsed);
    diagnostics.extend(norm_diags);

    if diagnostics.has_errors() {
        return Err(diagnostics.sorted());
    }

    let artifact = build_artifact(&spec, source_digest(files));
    let sdk_source = render_sdk(&artifact);

    Ok(CompileOutput {
        artifact,
        sdk_source,
        warnings: diagnostics.sorted(),
    })
}

/// Compile every `.forge` file in a directory (non-recursive), in
/// sorted path order.
pub fn compile_dir(dir: &Path) -> Result<CompileOutput, Diagnostics> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            let mut diagnostics = Diagnostics::new();
            diagnostics.push(forge_core::Diagnostic::new(
                forge_core::DiagCode::FatalParseError,
                format!("cannot read source directory {}: {}", dir.display(), e),
                dir.display().to_string(),
                forge_core::Span::default(),
            ));
            return Err(diagnostics);
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("forge") {
            match std::fs::read_to_string(&path) {
                Ok(text) => files.push(SourceFile {
                    path: path.display().to_string(),
                    text,
                }),
                Err(e) => {
                    let mut diagnostics = Diagnostics::new();
                    diagnostics.push(forge_core::Diagnostic::new(
                        forge_core::DiagCode::FatalParseError,
                        format!("cannot read {}: {}", path.display(), e),
                        path.display().to_string(),
                        forge_core::Span::default(),
                    ));
                    return Err(diagnostics);
                }
            }
        }
    }
    compile(&files)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELPDESK: &str = r#"
        app Helpdesk { version: "1.0.0" }

        entity User { name: text, role: text }
        entity Org { name: text }
        entity Ticket {
            subject: text(200) required
            status: enum(open, pending, closed) default "open"
            priority: int default 0
        }

        relation Ticket.org -> Org
        relation Ticket.author -> User
        relation Ticket.assignee -> User
        relation Org.members -> User { cardinality: many, inverse: org }

        access Ticket { read: user in org.members write: user in org.members }
        access User { read: true write: user.id == id }
        access Org { read: true write: false }

        message TICKET_CLOSED { level: error, text: "Closed tickets cannot be modified" }
        rule Ticket.update { forbid if status == "closed" emit TICKET_CLOSED }

        action create_ticket { input: Ticket, creates: Ticket }

        view TicketList {
            source: Ticket
            fields: subject, status, priority, author.name, assignee.name
            sort: -created_at
        }

        hook Ticket.after_create { enqueue notify_agents }
        job notify_agents { input: Ticket, needs: org.members, effect: email.send }
    "#;

    #[test]
    fn test_compile_helpdesk() {
        let output = compile(&[SourceFile {
            path: "app.forge".to_string(),
            text: HELPDESK.to_string(),
        }])
        .expect("compile");

        let artifact = &output.artifact;
        assert_eq!(artifact.app.name, "Helpdesk");
        assert_eq!(artifact.entities.len(), 3);
        assert_eq!(artifact.rules.len(), 1);
        assert!(artifact.views.contains_key("TicketList"));
        assert!(artifact.jobs.contains_key("notify_agents"));
        assert!(!output.warnings.has_errors());
    }

    #[test]
    fn test_deterministic_compilation() {
        let files = [SourceFile {
            path: "app.forge".to_string(),
            text: HELPDESK.to_string(),
        }];
        let first = compile(&files).expect("compile").artifact;
        let second = compile(&files).expect("compile").artifact;
        assert_eq!(
            first.to_canonical_json().unwrap(),
            second.to_canonical_json().unwrap()
        );
    }

    #[test]
    fn test_compile_collects_errors_across_phases() {
        let result = compile(&[SourceFile {
            path: "app.forge".to_string(),
            text: r#"
                entity Ticket { subject: text }
                entity Ticket { body: text }
                view Broken { source: Missing fields: subject }
            "#
            .to_string(),
        }]);
        let diagnostics = result.expect_err("expected failure");
        assert!(diagnostics.iter().filter(|d| d.is_error()).count() >= 2);
    }

    #[test]
    fn test_multi_file_compile() {
        let output = compile(&[
            SourceFile {
                path: "b_views.forge".to_string(),
                text: "view All { source: Ticket fields: subject }".to_string(),
            },
            SourceFile {
                path: "a_entities.forge".to_string(),
                text: "entity Ticket { subject: text } access Ticket { read: true write: true }"
                    .to_string(),
            },
        ])
        .expect("cross-file references resolve");
        assert!(output.artifact.views.contains_key("All"));
    }
}
