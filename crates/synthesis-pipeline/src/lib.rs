//! Template Synthesis Pipeline (spec.md §4.5): `fetch_cves -> partition_by_novelty
//! -> generate_template -> store_templates -> validate_template -> refine_loop`.

mod context;
mod generate;
mod novelty;
mod run;
mod store;
mod validate;

pub use context::PipelineContext;
pub use generate::{generate_template, GeneratedTemplate};
pub use novelty::partition_by_novelty;
pub use run::PipelineRunner;
pub use store::store_templates;
pub use validate::{validate_and_refine, ValidationSummary};
