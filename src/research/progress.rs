//! Scratch document shared across per-file analysis runs.
//!
//! Each file is analyzed in a fresh conversation; this document is the only
//! memory carried from one file to the next and the sole input to synthesis.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressDoc {
    content: String,
}

impl ProgressDoc {
    pub fn new(plan: &str) -> Self {
        Self {
            content: format!(
                "# Research Progress\n\n## Analysis Plan\n{}\n\n## Findings\n",
                plan.trim()
            ),
        }
    }

    /// Append a `### heading` block.
    pub fn append(&mut self, heading: &str, body: &str) {
        self.content = format!("{}\n\n### {}\n{}", self.content, heading, body.trim())
            .trim()
            .to_string();
    }

    pub fn append_failure(&mut self, file_name: &str, error: &str) {
        let error = crate::util::truncate_chars(error, 200);
        self.append(file_name, &format!("(analysis failed: {})", error));
    }

    pub fn append_skipped(&mut self, file_names: &[&str]) {
        self.append(
            "(budget limit)",
            &format!("Skipped files due to token budget: {}", file_names.join(", ")),
        );
    }

    pub fn as_str(&self) -> &str {
        &self.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let mut doc = ProgressDoc::new("1. a.csv - totals");
        assert!(doc
            .as_str()
            .starts_with("# Research Progress\n\n## Analysis Plan\n1. a.csv - totals\n\n## Findings"));

        doc.append("a.csv", "- revenue up 12%\n");
        doc.append_failure("b.pdf", &"x".repeat(300));
        doc.append_skipped(&["c.docx", "d.xlsx"]);

        let text = doc.as_str();
        assert!(text.contains("## Findings\n\n\n### a.csv\n- revenue up 12%"));
        assert!(text.contains(&format!("### b.pdf\n(analysis failed: {})", "x".repeat(200))));
        assert!(!text.contains(&"x".repeat(201)));
        assert!(text.ends_with("### (budget limit)\nSkipped files due to token budget: c.docx, d.xlsx"));
    }
}
