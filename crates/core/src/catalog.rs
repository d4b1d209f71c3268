use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::step::Assignee;

/// A resolved decision point before it is persisted as a step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub sequence: u32,
    pub name: String,
    pub assignee: Assignee,
    pub is_required: bool,
}

impl StepTemplate {
    pub fn required(sequence: u32, name: impl Into<String>, assignee: Assignee) -> Self {
        Self { sequence, name: name.into(), assignee, is_required: true }
    }

    pub fn optional(sequence: u32, name: impl Into<String>, assignee: Assignee) -> Self {
        Self { sequence, name: name.into(), assignee, is_required: false }
    }
}

/// The static per-type step catalog. Loaded once at process start (from
/// config or the built-in defaults) and immutable thereafter. Unknown request
/// types resolve to the generic three-step chain, so catalog resolution never
/// fails.
#[derive(Clone, Debug)]
pub struct StepCatalog {
    version: u32,
    chains: HashMap<String, Vec<StepTemplate>>,
    generic: Vec<StepTemplate>,
}

impl StepCatalog {
    pub fn new(version: u32, chains: HashMap<String, Vec<StepTemplate>>) -> Self {
        let chains: HashMap<String, Vec<StepTemplate>> = chains
            .into_iter()
            .map(|(request_type, chain)| (normalize_key(&request_type), normalize_chain(chain)))
            .collect();
        Self { version, chains, generic: generic_chain() }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Deterministic: identical request types always yield the identical
    /// ordered template list.
    pub fn resolve(&self, request_type: &str) -> &[StepTemplate] {
        self.chains.get(&normalize_key(request_type)).map(Vec::as_slice).unwrap_or(&self.generic)
    }

    pub fn known_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.chains.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for StepCatalog {
    fn default() -> Self {
        let mut chains = HashMap::new();
        chains.insert(
            "order".to_string(),
            vec![
                StepTemplate::optional(1, "Submission", Assignee::role("salesperson")),
                StepTemplate::required(2, "Sales Review", Assignee::role("sales_manager")),
                StepTemplate::required(3, "Finance Review", Assignee::role("finance_manager")),
                StepTemplate::required(4, "Final Approval", Assignee::role("sales_director")),
            ],
        );
        chains.insert(
            "return".to_string(),
            vec![
                StepTemplate::optional(1, "Submission", Assignee::role("salesperson")),
                StepTemplate::required(2, "Depot Review", Assignee::role("depot_manager")),
                StepTemplate::required(3, "Inventory Check", Assignee::role("warehouse_supervisor")),
                StepTemplate::required(4, "Final Approval", Assignee::role("sales_director")),
            ],
        );
        chains.insert(
            "expense".to_string(),
            vec![
                StepTemplate::optional(1, "Submission", Assignee::role("salesperson")),
                StepTemplate::required(2, "Manager Review", Assignee::role("manager")),
                StepTemplate::required(3, "Finance Approval", Assignee::role("finance_manager")),
            ],
        );
        Self::new(1, chains)
    }
}

fn generic_chain() -> Vec<StepTemplate> {
    vec![
        StepTemplate::optional(1, "Submitted", Assignee::role("salesperson")),
        StepTemplate::required(2, "Review", Assignee::role("manager")),
        StepTemplate::required(3, "Approval", Assignee::role("director")),
    ]
}

/// Chains are stored sorted by their declared sequence, then renumbered so
/// that persisted step sequences are always contiguous starting at 1.
fn normalize_chain(mut chain: Vec<StepTemplate>) -> Vec<StepTemplate> {
    chain.sort_by_key(|template| template.sequence);
    for (index, template) in chain.iter_mut().enumerate() {
        template.sequence = index as u32 + 1;
    }
    chain
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{StepCatalog, StepTemplate};
    use crate::domain::step::Assignee;

    #[test]
    fn default_catalog_matches_fixed_chain_lengths() {
        let catalog = StepCatalog::default();
        assert_eq!(catalog.resolve("order").len(), 4);
        assert_eq!(catalog.resolve("return").len(), 4);
        assert_eq!(catalog.resolve("expense").len(), 3);
    }

    #[test]
    fn unknown_type_falls_back_to_generic_three_steps() {
        let catalog = StepCatalog::default();
        let chain = catalog.resolve("travel_request");
        assert_eq!(chain.len(), 3);
        assert!(!chain[0].is_required);
        assert_eq!(chain[1].assignee, Assignee::role("manager"));
        assert_eq!(chain[2].assignee, Assignee::role("director"));
    }

    #[test]
    fn resolution_is_case_insensitive_and_deterministic() {
        let catalog = StepCatalog::default();
        assert_eq!(catalog.resolve("Order"), catalog.resolve("order"));
        assert_eq!(catalog.resolve("order"), catalog.resolve("  order "));
    }

    #[test]
    fn chains_are_renumbered_contiguously() {
        let mut chains = HashMap::new();
        chains.insert(
            "order".to_string(),
            vec![
                StepTemplate::required(10, "Second", Assignee::role("manager")),
                StepTemplate::required(5, "First", Assignee::role("salesperson")),
            ],
        );
        let catalog = StepCatalog::new(2, chains);

        let chain = catalog.resolve("order");
        assert_eq!(chain[0].name, "First");
        assert_eq!(chain[0].sequence, 1);
        assert_eq!(chain[1].name, "Second");
        assert_eq!(chain[1].sequence, 2);
        assert_eq!(catalog.version(), 2);
    }
}
