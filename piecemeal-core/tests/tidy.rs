//! Piecemeal Style Consistency Enforcement
//!
//! Walks every workspace crate and flags structural style problems: oversized
//! modules, grab-bag module names, undocumented public API and test names
//! that do not say what they check.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Module size limit.
const MAX_MODULE_LINES: usize = 500;

/// Anti-pattern module names.
const BANNED_MODULE_NAMES: &[&str] = &[
    "utils", "util", "helpers", "helper", "common", "shared", "misc", "tools",
];

const WORKSPACE_CRATES: &[&str] = &[
    "piecemeal-core",
    "piecemeal-sim",
    "piecemeal-cli",
    "piecemeal-tests",
];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Severity {
    Critical, // Must fix - fails CI
    Warning,  // Should fix - improves consistency
}

#[derive(Debug, Clone)]
struct StyleViolation {
    severity: Severity,
    file: String,
    line: usize,
    rule: &'static str,
    message: String,
}

struct StyleChecker {
    violations: Vec<StyleViolation>,
    current_file: PathBuf,
    file_lines: Vec<String>,
}

impl StyleChecker {
    fn new() -> Self {
        Self {
            violations: Vec::new(),
            current_file: PathBuf::new(),
            file_lines: Vec::new(),
        }
    }

    fn check_file(&mut self, file_path: PathBuf) -> Result<(), std::io::Error> {
        let content = fs::read_to_string(&file_path)?;
        self.current_file = file_path;
        self.file_lines = content.lines().map(str::to_string).collect();

        let is_test_file = self
            .current_file
            .strip_prefix(workspace_root())
            .unwrap_or(&self.current_file)
            .to_string_lossy()
            .contains("test");

        self.check_module_size();
        self.check_banned_module_names();
        self.check_emoji_usage();

        if !is_test_file {
            self.check_public_documentation();
        }

        self.check_test_naming_patterns();
        self.check_import_organization();
        Ok(())
    }

    fn add_violation(&mut self, severity: Severity, line: usize, rule: &'static str, message: String) {
        self.violations.push(StyleViolation {
            severity,
            file: self.current_file.to_string_lossy().to_string(),
            line,
            rule,
            message,
        });
    }

    fn check_module_size(&mut self) {
        let line_count = self.file_lines.len();
        if line_count > MAX_MODULE_LINES {
            self.add_violation(
                Severity::Critical,
                1,
                "MODULE_SIZE_LIMIT",
                format!("Module has {line_count} lines, exceeding {MAX_MODULE_LINES} line limit"),
            );
        }
    }

    fn check_banned_module_names(&mut self) {
        let Some(name) = self.current_file.file_stem().and_then(|stem| stem.to_str()) else {
            return;
        };
        if BANNED_MODULE_NAMES.contains(&name) {
            let message =
                format!("Module '{name}' uses banned name - use domain-specific names instead");
            self.add_violation(Severity::Critical, 1, "BANNED_MODULE_NAME", message);
        }
    }

    /// Blocks emoji faces and flags, not functional symbols.
    fn check_emoji_usage(&mut self) {
        let lines: Vec<usize> = self
            .file_lines
            .iter()
            .enumerate()
            .filter(|(_, line)| {
                line.chars().any(|ch| {
                    matches!(ch as u32,
                        0x1F600..=0x1F64F | 0x1F910..=0x1F96B | 0x1F970..=0x1F9FF | 0x1F1E6..=0x1F1FF)
                })
            })
            .map(|(index, _)| index + 1)
            .collect();
        for line in lines {
            self.add_violation(
                Severity::Critical,
                line,
                "NO_EMOJIS",
                "Emoji faces and decorative symbols are forbidden - use plain text instead"
                    .to_string(),
            );
        }
    }

    /// Public functions and structs need a `///` block; attributes between
    /// the doc and the item are allowed. Functions returning `Result` need
    /// an `# Errors` section.
    fn check_public_documentation(&mut self) {
        let mut doc_lines: Vec<&str> = Vec::new();
        let mut found = Vec::new();

        for (index, line) in self.file_lines.iter().enumerate() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("///") {
                doc_lines.push(trimmed);
                continue;
            }
            if trimmed.starts_with("#[") {
                continue;
            }

            let item = if trimmed.starts_with("pub fn ") || trimmed.starts_with("pub async fn ") {
                Some("function")
            } else if trimmed.starts_with("pub struct ") {
                Some("struct")
            } else {
                None
            };

            if let Some(kind) = item {
                let name = item_name(trimmed);
                if doc_lines.is_empty() {
                    found.push((
                        index + 1,
                        "MISSING_PUBLIC_DOC",
                        format!("Public {kind} '{name}' missing documentation"),
                    ));
                } else if kind == "function"
                    && returns_result(&self.signature(index))
                    && !doc_lines.iter().any(|doc| doc.contains("# Errors"))
                {
                    found.push((
                        index + 1,
                        "MISSING_ERRORS_DOC",
                        format!(
                            "Public function '{name}' returning Result missing '# Errors' documentation"
                        ),
                    ));
                }
            }
            doc_lines.clear();
        }

        for (line, rule, message) in found {
            self.add_violation(Severity::Critical, line, rule, message);
        }
    }

    /// Signature text from `start` up to the opening brace.
    fn signature(&self, start: usize) -> String {
        let mut signature = String::new();
        for line in &self.file_lines[start..] {
            signature.push_str(line);
            if line.contains('{') || line.trim_end().ends_with(';') {
                break;
            }
        }
        signature.split('{').next().unwrap_or_default().to_string()
    }

    /// Test names follow `test_unit_condition_outcome`.
    fn check_test_naming_patterns(&mut self) {
        let found: Vec<(usize, String)> = self
            .file_lines
            .iter()
            .enumerate()
            .filter_map(|(index, line)| {
                let trimmed = line.trim_start();
                let rest = trimmed
                    .strip_prefix("async fn test_")
                    .or_else(|| trimmed.strip_prefix("fn test_"))?;
                let name = format!("test_{}", rest.split('(').next()?);
                (name.split('_').count() < 4).then_some((index + 1, name))
            })
            .collect();

        for (line, name) in found {
            self.add_violation(
                Severity::Warning,
                line,
                "TEST_NAMING_PATTERN",
                format!("Test '{name}' should follow pattern 'test_unit_condition_outcome'"),
            );
        }
    }

    /// Imports grouped at the top of each module body.
    fn check_import_organization(&mut self) {
        let mut found_non_import = false;
        let mut in_use = false;
        let mut found = Vec::new();

        for (index, line) in self.file_lines.iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("//") || trimmed.starts_with("#") {
                continue;
            }
            if trimmed.starts_with("mod ") && trimmed.ends_with('{') {
                // Nested test modules start a new import block.
                found_non_import = false;
                continue;
            }
            let is_module_decl = trimmed.ends_with(';')
                && (trimmed.starts_with("mod ") || trimmed.starts_with("pub mod "));
            if is_module_decl {
                continue;
            }
            if in_use {
                in_use = !trimmed.ends_with(';');
                continue;
            }
            if trimmed.starts_with("use ") || trimmed.starts_with("pub use ") {
                if found_non_import {
                    found.push(index + 1);
                }
                in_use = !trimmed.ends_with(';');
            } else {
                found_non_import = true;
            }
        }

        for line in found {
            self.add_violation(
                Severity::Warning,
                line,
                "IMPORT_ORGANIZATION",
                "Imports should be grouped together at the top of the file".to_string(),
            );
        }
    }
}

/// Whether the return type itself is a `Result`, not a type wrapping one.
fn returns_result(signature: &str) -> bool {
    signature
        .rsplit_once("->")
        .and_then(|(_, output)| output.split('<').next())
        .is_some_and(|head| head.trim().ends_with("Result"))
}

fn item_name(line: &str) -> String {
    line.split_whitespace()
        .find(|word| !matches!(*word, "pub" | "async" | "fn" | "struct"))
        .unwrap_or_default()
        .split(['(', '<', '{', ';'])
        .next()
        .unwrap_or_default()
        .to_string()
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn collect_workspace_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();
    for crate_name in WORKSPACE_CRATES {
        collect_rust_files_in_dir(&root.join(crate_name), &mut files);
    }
    files.sort();
    files
}

fn collect_rust_files_in_dir(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "rs") {
            files.push(path);
        } else if path.is_dir() && !path.ends_with("target") {
            collect_rust_files_in_dir(&path, files);
        }
    }
}

#[test]
fn enforce_piecemeal_style_consistency() {
    let mut checker = StyleChecker::new();
    let mut file_count = 0;

    for file_path in collect_workspace_files() {
        if let Err(e) = checker.check_file(file_path.clone()) {
            eprintln!("Failed to check {file_path:?}: {e}");
            continue;
        }
        file_count += 1;
    }
    assert!(file_count > 0, "no workspace sources found");

    checker.violations.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then(a.file.cmp(&b.file))
            .then(a.line.cmp(&b.line))
    });

    let mut violations_by_rule: HashMap<&str, usize> = HashMap::new();
    let mut critical_violations = 0;
    for violation in &checker.violations {
        *violations_by_rule.entry(violation.rule).or_insert(0) += 1;
        let label = match violation.severity {
            Severity::Critical => {
                critical_violations += 1;
                "CRITICAL"
            }
            Severity::Warning => "WARNING",
        };
        println!(
            "{label} [{}] {}:{} - {}",
            violation.rule, violation.file, violation.line, violation.message
        );
    }

    println!("\n--- Piecemeal Style Consistency Summary ---");
    println!("Files analyzed: {file_count}");
    println!("Total violations: {}", checker.violations.len());
    for (rule, count) in &violations_by_rule {
        println!("  {rule}: {count}");
    }

    assert_eq!(
        critical_violations, 0,
        "Found {critical_violations} critical style violations that must be fixed"
    );
}
