//! Generated report and presentation content.
//!
//! These are the structured outputs requested from the model. Both implement
//! [`StructuredOutput`], so the gateway rejects anything that fails
//! [`StructuredOutput::validate`] before a workflow step sees it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::llm::{StructuredOutput, ValidationError};

const MIN_EXECUTIVE_SUMMARY: usize = 100;
const MIN_SECTION_CONTENT: usize = 50;
const MIN_SUBSECTION_CONTENT: usize = 30;
const MIN_FINDINGS: usize = 2;
const MIN_SLIDES: usize = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Report
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSubsection {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub subsections: Vec<ReportSubsection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedReport {
    pub title: String,
    pub executive_summary: String,
    pub sections: Vec<ReportSection>,
    pub key_findings: Vec<String>,
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

fn trimmed_len(s: &str) -> usize {
    s.trim().chars().count()
}

fn clean_list(items: &mut Vec<String>) {
    *items = items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
}

impl StructuredOutput for GeneratedReport {
    fn schema() -> Value {
        let text_block = |desc: &str| json!({"type": "string", "description": desc});
        json!({
            "type": "object",
            "required": ["title", "executive_summary", "sections", "key_findings", "recommendations"],
            "properties": {
                "title": text_block("Descriptive report title"),
                "executive_summary": text_block("2-3 paragraphs summarizing key insights (min 100 chars)"),
                "sections": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "required": ["title", "content"],
                        "properties": {
                            "title": text_block("Section title"),
                            "content": text_block("Substantive analysis (min 50 chars)"),
                            "subsections": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "required": ["title", "content"],
                                    "properties": {
                                        "title": text_block("Subsection title"),
                                        "content": text_block("Subsection text (min 30 chars)")
                                    }
                                }
                            }
                        }
                    }
                },
                "key_findings": {"type": "array", "minItems": 2, "items": {"type": "string"}},
                "recommendations": {"type": "array", "minItems": 1, "items": {"type": "string"}},
                "sources": {"type": "array", "items": {"type": "string"}}
            }
        })
    }

    fn normalize(&mut self) {
        self.title = self.title.trim().to_string();
        for section in &mut self.sections {
            section.title = section.title.trim().to_string();
            for sub in &mut section.subsections {
                sub.title = sub.title.trim().to_string();
            }
        }
        clean_list(&mut self.key_findings);
        clean_list(&mut self.recommendations);
        clean_list(&mut self.sources);
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::new("Report title cannot be empty"));
        }
        if trimmed_len(&self.executive_summary) < MIN_EXECUTIVE_SUMMARY {
            return Err(ValidationError::new(format!(
                "Executive summary must be at least {} characters",
                MIN_EXECUTIVE_SUMMARY
            )));
        }
        if self.sections.is_empty() {
            return Err(ValidationError::new("Report must have at least 1 section"));
        }
        for (i, section) in self.sections.iter().enumerate() {
            if section.title.trim().is_empty() {
                return Err(ValidationError::new(format!("Section {} has an empty title", i + 1)));
            }
            if trimmed_len(&section.content) < MIN_SECTION_CONTENT {
                return Err(ValidationError::new(format!(
                    "Section '{}' content must be at least {} characters",
                    section.title, MIN_SECTION_CONTENT
                )));
            }
            for sub in &section.subsections {
                if sub.title.trim().is_empty() {
                    return Err(ValidationError::new(format!(
                        "Section '{}' has a subsection with an empty title",
                        section.title
                    )));
                }
                if trimmed_len(&sub.content) < MIN_SUBSECTION_CONTENT {
                    return Err(ValidationError::new(format!(
                        "Subsection '{}' content must be at least {} characters",
                        sub.title, MIN_SUBSECTION_CONTENT
                    )));
                }
            }
        }
        if self.key_findings.len() < MIN_FINDINGS {
            return Err(ValidationError::new("Report must have at least 2 key findings"));
        }
        if self.recommendations.is_empty() {
            return Err(ValidationError::new("Report must have at least 1 recommendation"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Presentation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlideType {
    Title,
    Section,
    Content,
    KeyFindings,
    StatCallout,
    Comparison,
    Timeline,
    Chart,
    Recommendations,
    Closing,
}

impl SlideType {
    pub const ALL: [SlideType; 10] = [
        SlideType::Title,
        SlideType::Section,
        SlideType::Content,
        SlideType::KeyFindings,
        SlideType::StatCallout,
        SlideType::Comparison,
        SlideType::Timeline,
        SlideType::Chart,
        SlideType::Recommendations,
        SlideType::Closing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Section => "section",
            Self::Content => "content",
            Self::KeyFindings => "key_findings",
            Self::StatCallout => "stat_callout",
            Self::Comparison => "comparison",
            Self::Timeline => "timeline",
            Self::Chart => "chart",
            Self::Recommendations => "recommendations",
            Self::Closing => "closing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub date: String,
    pub description: String,
}

/// One slide. Which optional fields apply depends on `slide_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationSlide {
    #[serde(rename = "type")]
    pub slide_type: SlideType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bullets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_items: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_items: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<TimelineEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_values: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl PresentationSlide {
    /// A slide with only a type and title set.
    pub fn new(slide_type: SlideType, title: impl Into<String>) -> Self {
        Self {
            slide_type,
            title: title.into(),
            subtitle: None,
            bullets: None,
            findings: None,
            items: None,
            stat_value: None,
            stat_context: None,
            left_label: None,
            left_items: None,
            right_label: None,
            right_items: None,
            events: None,
            chart_type: None,
            chart_title: None,
            data_labels: None,
            data_values: None,
            contact: None,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedPresentation {
    pub title: String,
    pub slides: Vec<PresentationSlide>,
}

impl GeneratedPresentation {
    pub fn has_slide(&self, slide_type: SlideType) -> bool {
        self.slides.iter().any(|s| s.slide_type == slide_type)
    }
}

impl StructuredOutput for GeneratedPresentation {
    fn schema() -> Value {
        let strings = json!({"type": "array", "items": {"type": "string"}});
        let types: Vec<&str> = SlideType::ALL.iter().map(SlideType::as_str).collect();
        json!({
            "type": "object",
            "required": ["title", "slides"],
            "properties": {
                "title": {"type": "string"},
                "slides": {
                    "type": "array",
                    "minItems": 3,
                    "description": "Ordered slides; must include one slide of type 'title'",
                    "items": {
                        "type": "object",
                        "required": ["type", "title"],
                        "properties": {
                            "type": {"type": "string", "enum": types},
                            "title": {"type": "string"},
                            "subtitle": {"type": "string"},
                            "bullets": strings,
                            "findings": strings,
                            "items": strings,
                            "stat_value": {"type": "string", "description": "Headline metric, e.g. '$4.2M'"},
                            "stat_context": {"type": "string"},
                            "left_label": {"type": "string"},
                            "left_items": strings,
                            "right_label": {"type": "string"},
                            "right_items": strings,
                            "events": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "required": ["date", "description"],
                                    "properties": {
                                        "date": {"type": "string"},
                                        "description": {"type": "string"}
                                    }
                                }
                            },
                            "chart_type": {"type": "string", "enum": ["bar", "horizontal_bar", "line", "pie"]},
                            "chart_title": {"type": "string"},
                            "data_labels": strings,
                            "data_values": {"type": "array", "items": {"type": "number"}},
                            "contact": {"type": "string"},
                            "notes": {"type": "string", "description": "Speaker notes"}
                        }
                    }
                }
            }
        })
    }

    fn normalize(&mut self) {
        self.title = self.title.trim().to_string();
        for slide in &mut self.slides {
            slide.title = slide.title.trim().to_string();
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::new("Presentation title cannot be empty"));
        }
        if self.slides.len() < MIN_SLIDES {
            return Err(ValidationError::new("Presentation must have at least 3 slides"));
        }
        if let Some(i) = self.slides.iter().position(|s| s.title.trim().is_empty()) {
            return Err(ValidationError::new(format!("Slide {} has an empty title", i + 1)));
        }
        if !self.has_slide(SlideType::Title) {
            return Err(ValidationError::new("Presentation must have a title slide"));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_report() -> GeneratedReport {
        GeneratedReport {
            title: "Q3 Revenue Review".to_string(),
            executive_summary: "Revenue grew 12% quarter over quarter, driven by enterprise renewals and \
                                a strong expansion motion in EMEA, while churn stayed flat."
                .to_string(),
            sections: vec![ReportSection {
                title: "Revenue".to_string(),
                content: "Enterprise renewals accounted for most of the growth this quarter across regions."
                    .to_string(),
                subsections: vec![ReportSubsection {
                    title: "EMEA".to_string(),
                    content: "EMEA expansion doubled relative to the prior quarter.".to_string(),
                }],
            }],
            key_findings: vec!["Growth 12%".to_string(), "Churn flat".to_string()],
            recommendations: vec!["Invest in EMEA".to_string()],
            sources: vec!["q3.csv".to_string()],
        }
    }

    pub(crate) fn sample_presentation() -> GeneratedPresentation {
        GeneratedPresentation {
            title: "Q3 Review".to_string(),
            slides: vec![
                PresentationSlide::new(SlideType::Title, "Q3 Review"),
                PresentationSlide::new(SlideType::Content, "Highlights"),
                PresentationSlide::new(SlideType::Closing, "Thanks"),
            ],
        }
    }

    #[test]
    fn test_valid_report_passes() {
        assert!(sample_report().validate().is_ok());
    }

    #[test]
    fn test_report_rejections() {
        let mut report = sample_report();
        report.sections.clear();
        assert!(report.validate().is_err());

        let mut report = sample_report();
        report.executive_summary = "too short".to_string();
        assert!(report.validate().is_err());

        let mut report = sample_report();
        report.sections[0].subsections[0].content = "tiny".to_string();
        assert!(report.validate().is_err());

        let mut report = sample_report();
        report.sections[0].title = "   ".to_string();
        assert!(report.validate().is_err());
    }

    #[test]
    fn test_blank_findings_are_filtered_before_validation() {
        let mut report = sample_report();
        report.key_findings = vec!["  one ".to_string(), "".to_string(), "   ".to_string()];
        report.normalize();
        assert_eq!(report.key_findings, vec!["one"]);
        assert!(report.validate().is_err());
    }

    #[test]
    fn test_presentation_requires_title_slide() {
        assert!(sample_presentation().validate().is_ok());

        let mut deck = sample_presentation();
        deck.slides[0].slide_type = SlideType::Section;
        assert!(deck.validate().is_err());

        let mut deck = sample_presentation();
        deck.slides.truncate(2);
        assert!(deck.validate().is_err());
    }

    #[test]
    fn test_slide_wire_format() {
        let json = r#"{"type": "stat_callout", "title": " Growth ", "stat_value": "12%"}"#;
        let slide: PresentationSlide = serde_json::from_str(json).unwrap();
        assert_eq!(slide.slide_type, SlideType::StatCallout);
        assert_eq!(slide.stat_value.as_deref(), Some("12%"));

        let out = serde_json::to_value(&slide).unwrap();
        assert_eq!(out["type"], "stat_callout");
        assert!(out.get("bullets").is_none());
    }
}
