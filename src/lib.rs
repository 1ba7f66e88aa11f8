//! # Report Orchestrator
//!
//! Turns uploaded source documents into a written report, optionally a slide
//! deck, and rendered PDF/DOCX/PPTX files.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────┐   pending    ┌────────────────────────────────────────┐
//!   │ Record store │ ───────────▶ │ Worker (GenerationLimiter permit)      │
//!   └──────▲───────┘              └───────────────────┬────────────────────┘
//!          │ status / progress                        ▼
//!          │                        ┌──────────────────────────────────┐
//!          └─────────────────────── │ Workflow state machine           │
//!                                   │  register → skills → research →  │
//!                                   │  report → [slides] → render →    │
//!                                   │  finalize                        │
//!                                   └───────┬───────────────┬──────────┘
//!                                           ▼               ▼
//!                                   ┌──────────────┐ ┌──────────────┐
//!                                   │ ModelGateway │ │ Object store │
//!                                   │ (routing,    │ │ + renderers  │
//!                                   │  fallback)   │ └──────────────┘
//!                                   └──────────────┘
//! ```
//!
//! ## Modules
//! - `llm`: provider clients, model catalog, routing, retry and fallback
//! - `budget`: per-run token budget and usage metrics
//! - `research`: plan / per-file analysis / synthesis agent and its tools
//! - `workflow`: the state machine that drives one report run
//! - `services`: record store, object store, text extraction and renderers
//! - `skills`: analysis skills loaded from disk
//! - `limiter`: per-process cap on concurrent runs

pub mod budget;
pub mod config;
pub mod content;
pub mod limiter;
pub mod llm;
pub mod research;
pub mod services;
pub mod skills;
pub mod util;
pub mod workflow;

pub use config::Config;
pub use limiter::GenerationLimiter;
pub use workflow::{run_workflow, run_workflow_with_deadline, WorkflowDeps, WorkflowState};
