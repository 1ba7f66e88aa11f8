//! Prompt text for the generation steps.

use crate::content::GeneratedReport;

use super::state::{ReportConfig, WorkflowState};

const REPORT_SYSTEM: &str = "You are an expert research analyst. Create a professional report.

REPORT TITLE: {title}
DETAIL LEVEL: {detail_level}
{detail_guidance}

Create a comprehensive report with an executive summary (2-3 paragraphs),
detailed sections with substantive content, at least 2 key findings,
and at least 1 actionable recommendation.";

const PRESENTATION_SYSTEM: &str = "Create a presentation with {min} to {max} slides.
Include a title slide, content slides with bullet points, key findings,
recommendations, and a closing slide. Use stat_callout, comparison,
timeline, and chart slides when data warrants it.";

const SKILL_PLANNING_SYSTEM: &str = "You are a skill planning agent. Analyze the workflow context and
choose the skills that should be loaded.

{catalog}

Review the input file types and output formats, then name the skills that will
improve the quality of the generated report and presentation.";

pub(crate) fn report_system(config: &ReportConfig) -> String {
    REPORT_SYSTEM
        .replace("{title}", &config.title)
        .replace("{detail_level}", &config.detail_level.as_str().to_uppercase())
        .replace("{detail_guidance}", config.detail_level.guidance())
}

pub(crate) fn report_user(config: &ReportConfig, research_notes: &str) -> String {
    let mut content = String::new();
    if let Some(instructions) = &config.custom_instructions {
        content.push_str(&format!("USER INSTRUCTIONS:\n{}\n\n", instructions));
    }
    content.push_str(&format!(
        "RESEARCH MATERIAL:\n{}\n\nGenerate the report now.",
        research_notes
    ));
    content
}

pub(crate) fn presentation_system(config: &ReportConfig) -> String {
    PRESENTATION_SYSTEM
        .replace("{min}", &config.slide_count_min.to_string())
        .replace("{max}", &config.slide_count_max.to_string())
}

pub(crate) fn presentation_user(report: &GeneratedReport) -> String {
    let mut sections = String::new();
    for section in &report.sections {
        sections.push_str(&format!("\n## {}\n{}\n", section.title, section.content));
        for sub in &section.subsections {
            sections.push_str(&format!("\n### {}\n{}\n", sub.title, sub.content));
        }
    }
    let bullets = |items: &[String]| {
        items
            .iter()
            .map(|i| format!("- {}", i))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Create a presentation from this report:\n\n\
         TITLE: {}\n\n\
         EXECUTIVE SUMMARY:\n{}\n\n\
         SECTIONS:\n{}\n\n\
         KEY FINDINGS:\n{}\n\n\
         RECOMMENDATIONS:\n{}\n\n\
         Generate the presentation slides now.",
        report.title,
        report.executive_summary,
        sections,
        bullets(&report.key_findings),
        bullets(&report.recommendations)
    )
}

pub(crate) fn skill_planning_system(catalog: &str) -> String {
    SKILL_PLANNING_SYSTEM.replace("{catalog}", catalog)
}

pub(crate) fn skill_planning_user(state: &WorkflowState) -> String {
    let mut types: Vec<&str> = state.input_file_types.iter().map(String::as_str).collect();
    types.sort_unstable();
    let types = if types.is_empty() {
        "none detected".to_string()
    } else {
        types.join(", ")
    };
    format!(
        "Input file types: {}\n\
         Output formats: {}\n\
         User instructions: {}\n\n\
         Analyze the context and name any skills that would improve the \
         report and presentation quality.",
        types,
        state.config.format_names().join(", "),
        state
            .config
            .custom_instructions
            .as_deref()
            .unwrap_or("None provided")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::tests::sample_report;
    use crate::workflow::DetailLevel;

    #[test]
    fn test_report_prompts() {
        let config = ReportConfig {
            title: "Q3".to_string(),
            detail_level: DetailLevel::Executive,
            custom_instructions: Some("EMEA only".to_string()),
            ..ReportConfig::default()
        };
        let system = report_system(&config);
        assert!(system.contains("REPORT TITLE: Q3\nDETAIL LEVEL: EXECUTIVE\nCreate a concise"));

        let user = report_user(&config, "notes");
        assert_eq!(
            user,
            "USER INSTRUCTIONS:\nEMEA only\n\nRESEARCH MATERIAL:\nnotes\n\nGenerate the report now."
        );
        assert!(report_user(&ReportConfig::default(), "n").starts_with("RESEARCH MATERIAL:"));
    }

    #[test]
    fn test_presentation_prompts() {
        let config = ReportConfig {
            slide_count_min: 4,
            slide_count_max: 6,
            ..ReportConfig::default()
        };
        assert!(presentation_system(&config).starts_with("Create a presentation with 4 to 6 slides."));

        let report = sample_report();
        let user = presentation_user(&report);
        assert!(user.contains(&format!("TITLE: {}", report.title)));
        assert!(user.contains(&format!("\n## {}\n", report.sections[0].title)));
        assert!(user.contains(&format!("- {}", report.key_findings[0])));
        assert!(user.ends_with("Generate the presentation slides now."));
    }
}
