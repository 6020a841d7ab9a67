//! Translate orchestrator-level inputs into the scanner binary's CLI
//! surface (spec.md §6): Nuclei templates are selected with repeated `-t`
//! flags, one per directory or file.

use scan_core::TemplateSelector;

/// # Errors
/// None: every [`TemplateSelector`] variant reachable from [`SubmitScan`]
/// maps onto a valid command. [`TemplateSelector::File`] is only ever
/// constructed by the custom/AI scan paths, which build their own command
/// from a library-mounted path instead of calling this function.
///
/// [`SubmitScan`]: crate::OrchestratorCore::submit_scan
#[must_use]
pub fn scan_command(selector: &TemplateSelector) -> Vec<String> {
    match selector {
        TemplateSelector::All => Vec::new(),
        TemplateSelector::Dirs(dirs) => dirs.iter().flat_map(|d| ["-t".to_string(), d.clone()]).collect(),
        TemplateSelector::File(_) => Vec::new(),
    }
}

/// KV key a resolved container name is indexed under so `StreamScanLog`
/// (keyed by `container_name`, spec.md §6) can find the owning job.
#[must_use]
pub fn container_index_key(container_name: &str) -> String {
    format!("container_name:{container_name}")
}
